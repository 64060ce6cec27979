//! Upstream venue connection.
//!
//! A single actor task owns the TLS socket and reconnects with exponential
//! backoff until stopped. Requests are multiplexed over the channel and
//! correlated by client message id; callers hold a cloneable
//! [`UpstreamHandle`] that gates sends on readiness (TLS connected and
//! application-authorized) and enforces per-request timeouts.
//!
//! Ownership: the actor exclusively owns the socket, the heartbeat timer,
//! and the reconnect schedule. The pending-request map and ready gate are
//! shared with handles, which insert and remove entries but never touch
//! the socket.

use crate::error::UpstreamError;
use crate::quote_bus::{Quote, QuoteBus};
use crate::subscriptions::SubscriptionIndex;
use bytes::BytesMut;
use common::Environment;
use dashmap::DashMap;
use metrics::{counter, gauge};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, error, info, warn};
use wire::registry::SchemaRegistry;
use wire::{deframe, frame};

/// Payload key for application auth; issued by the actor itself as the
/// first request on every connect, before the ready gate opens.
const APP_AUTH_REQ: &str = "PROTO_OA_APPLICATION_AUTH_REQ";

const HEARTBEAT_EVENT: &str = "PROTO_HEARTBEAT_EVENT";
const SPOT_EVENT: &str = "PROTO_OA_SPOT_EVENT";

/// Uncorrelated frames of these types resolve the oldest pending request;
/// the venue occasionally omits the correlation id on system frames.
const SYSTEM_FALLBACK_PAYLOADS: &[&str] = &[
    "PROTO_OA_APPLICATION_AUTH_RES",
    "PROTO_OA_ERROR_RES",
    "PROTO_OA_ACCOUNT_AUTH_RES",
];

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const BACKOFF_FACTOR: f64 = 1.8;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const APP_AUTH_TIMEOUT: Duration = Duration::from_secs(12);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(9);

/// Client message ids live in `1..2_000_000_000`, skipping 0.
const CLIENT_MSG_ID_WRAP: u64 = 2_000_000_000;

/// Connection parameters resolved from configuration at boot.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub demo_host: String,
    pub live_host: String,
    pub port: u16,
    pub client_id: String,
    pub client_secret: String,
    pub default_env: Environment,
}

impl ConnectionConfig {
    fn host(&self, env: Environment) -> &str {
        match env {
            Environment::Demo => &self.demo_host,
            Environment::Live => &self.live_host,
        }
    }
}

/// Readiness gate state, published on a watch channel. Reset to `NotReady`
/// on every connect attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateState {
    NotReady { env: Environment },
    Ready { env: Environment },
    ShuttingDown,
}

/// A correlated response delivered to the sender.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub payload_name: String,
    pub type_name: String,
    pub decoded: Value,
}

enum Command {
    Write {
        frame: BytesMut,
        client_msg_id: Option<String>,
    },
    SwitchEnv(Environment),
    Stop,
}

struct PendingEntry {
    seq: u64,
    payload_key: String,
    tx: oneshot::Sender<Result<UpstreamResponse, UpstreamError>>,
}

enum SessionEnd {
    Stop,
    Switch(Environment),
    Failed,
}

enum BackoffOutcome {
    Elapsed,
    Switch(Environment),
    Stop,
}

/// Spawns the connection actor.
pub struct UpstreamConnection;

impl UpstreamConnection {
    /// Start the actor connecting to the configured default environment.
    /// Never blocks callers on readiness; sends await the gate instead.
    pub fn start(
        registry: Arc<SchemaRegistry>,
        bus: Arc<QuoteBus>,
        subscriptions: Arc<SubscriptionIndex>,
        config: ConnectionConfig,
    ) -> Result<UpstreamHandle, UpstreamError> {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (gate_tx, gate_rx) = watch::channel(GateState::NotReady {
            env: config.default_env,
        });
        let next_id = Arc::new(AtomicU64::new(0));
        let router = Arc::new(InboundRouter::new(registry.clone(), bus, subscriptions));

        let handle = UpstreamHandle {
            command_tx,
            gate: gate_rx,
            router: router.clone(),
            registry: registry.clone(),
            next_id: next_id.clone(),
            default_env: config.default_env,
        };

        let actor = ConnectionActor {
            config,
            registry,
            router,
            command_rx,
            gate_tx,
            next_id,
            tls: tls_connector()?,
        };
        tokio::spawn(actor.run());

        Ok(handle)
    }
}

/// Cloneable API over the connection actor.
#[derive(Clone)]
pub struct UpstreamHandle {
    command_tx: mpsc::UnboundedSender<Command>,
    gate: watch::Receiver<GateState>,
    router: Arc<InboundRouter>,
    registry: Arc<SchemaRegistry>,
    next_id: Arc<AtomicU64>,
    default_env: Environment,
}

impl UpstreamHandle {
    pub fn default_env(&self) -> Environment {
        self.default_env
    }

    /// Signal shutdown: the actor stops the heartbeat, closes the socket,
    /// rejects every pending request and gate waiter, and exits.
    pub fn stop(&self) {
        let _ = self.command_tx.send(Command::Stop);
    }

    /// Wait until the channel is ready on `env`, forcing a reconnect when
    /// the channel is currently on a different environment. An env switch
    /// is globally disruptive: every in-flight request on the old
    /// environment is rejected.
    pub async fn ensure_ready(&self, env: Environment) -> Result<(), UpstreamError> {
        let mut gate = self.gate.clone();
        loop {
            let state = gate.borrow_and_update().clone();
            match state {
                GateState::Ready { env: current } if current == env => return Ok(()),
                GateState::ShuttingDown => return Err(UpstreamError::ShuttingDown),
                GateState::Ready { env: current } | GateState::NotReady { env: current } => {
                    if current != env {
                        self.command_tx
                            .send(Command::SwitchEnv(env))
                            .map_err(|_| UpstreamError::ShuttingDown)?;
                    }
                    if gate.changed().await.is_err() {
                        return Err(UpstreamError::ShuttingDown);
                    }
                }
            }
        }
    }

    /// Send a request and await its correlated response.
    ///
    /// Exactly one of three things happens to every send: a correlated
    /// response is delivered, the timeout fires, or a disconnect rejects
    /// it. Writes preserve the order of `send` calls; responses do not.
    pub async fn send(
        &self,
        payload_key: &str,
        mut payload: Value,
        timeout: Duration,
        env: Option<Environment>,
    ) -> Result<UpstreamResponse, UpstreamError> {
        let target = env.unwrap_or(self.default_env);
        self.ensure_ready(target).await?;

        let id = next_client_msg_id(&self.next_id);
        let framed = encode_request(&self.registry, payload_key, &mut payload, Some(&id))?;

        let (tx, mut rx) = oneshot::channel();
        self.router.register(id.clone(), payload_key, tx);
        if self
            .command_tx
            .send(Command::Write {
                frame: framed,
                client_msg_id: Some(id.clone()),
            })
            .is_err()
        {
            self.router.take(&id);
            return Err(UpstreamError::Disconnected);
        }

        let sleep = tokio::time::sleep(timeout);
        tokio::pin!(sleep);
        tokio::select! {
            res = &mut rx => match res {
                Ok(outcome) => outcome,
                Err(_) => Err(UpstreamError::Disconnected),
            },
            _ = &mut sleep => {
                if self.router.take(&id).is_some() {
                    counter!("upstream_request_timeouts_total").increment(1);
                    Err(UpstreamError::Timeout {
                        payload_key: payload_key.to_string(),
                        client_msg_id: id,
                    })
                } else {
                    // The router won the race; the response is in flight.
                    match rx.await {
                        Ok(outcome) => outcome,
                        Err(_) => Err(UpstreamError::Disconnected),
                    }
                }
            }
        }
    }
}

// ============================================================================
// Actor
// ============================================================================

struct ConnectionActor {
    config: ConnectionConfig,
    registry: Arc<SchemaRegistry>,
    router: Arc<InboundRouter>,
    command_rx: mpsc::UnboundedReceiver<Command>,
    gate_tx: watch::Sender<GateState>,
    next_id: Arc<AtomicU64>,
    tls: TlsConnector,
}

impl ConnectionActor {
    async fn run(mut self) {
        let mut env = self.config.default_env;
        let mut backoff = INITIAL_BACKOFF;
        loop {
            let _ = self.gate_tx.send(GateState::NotReady { env });
            match self.run_session(env, &mut backoff).await {
                SessionEnd::Stop => break,
                SessionEnd::Switch(next) => {
                    info!("switching upstream environment {} -> {}", env, next);
                    self.router.reject_all(|| UpstreamError::Disconnected);
                    env = next;
                    backoff = INITIAL_BACKOFF;
                }
                SessionEnd::Failed => {
                    self.router.reject_all(|| UpstreamError::Disconnected);
                    warn!("upstream disconnected, reconnecting in {:?}", backoff);
                    match self.backoff_wait(backoff).await {
                        BackoffOutcome::Elapsed => backoff = next_backoff(backoff),
                        BackoffOutcome::Switch(next) => {
                            env = next;
                            backoff = INITIAL_BACKOFF;
                        }
                        BackoffOutcome::Stop => break,
                    }
                }
            }
        }
        self.shutdown();
    }

    async fn run_session(&mut self, env: Environment, backoff: &mut Duration) -> SessionEnd {
        info!("connecting to upstream {}:{}", self.config.host(env), self.config.port);
        let stream = match self.dial(env).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("connect failed: {}", e);
                return SessionEnd::Failed;
            }
        };
        counter!("upstream_connects_total").increment(1);
        // Backoff resets on successful connect, not on successful auth.
        *backoff = INITIAL_BACKOFF;
        info!("TLS established to {}", self.config.host(env));

        let (mut reader, mut writer) = tokio::io::split(stream);

        let end = self.run_authorized_loop(env, &mut reader, &mut writer).await;

        gauge!("upstream_ready").set(0.0);
        end
    }

    async fn run_authorized_loop(
        &mut self,
        env: Environment,
        reader: &mut ReadHalf<TlsStream<TcpStream>>,
        writer: &mut WriteHalf<TlsStream<TcpStream>>,
    ) -> SessionEnd {
        // Application auth must be the first request on the channel.
        let auth_id = next_client_msg_id(&self.next_id);
        let mut auth_payload = serde_json::json!({
            "clientId": self.config.client_id,
            "clientSecret": self.config.client_secret,
        });
        let auth_frame =
            match encode_request(&self.registry, APP_AUTH_REQ, &mut auth_payload, Some(&auth_id)) {
                Ok(framed) => framed,
                Err(e) => {
                    error!("failed to encode application auth: {}", e);
                    return SessionEnd::Failed;
                }
            };
        let (auth_tx, mut auth_rx) = oneshot::channel();
        self.router.register(auth_id.clone(), APP_AUTH_REQ, auth_tx);
        if let Err(e) = write_frame(writer, &auth_frame).await {
            error!("failed to send application auth: {}", e);
            self.router.take(&auth_id);
            return SessionEnd::Failed;
        }

        let auth_deadline = tokio::time::sleep(APP_AUTH_TIMEOUT);
        tokio::pin!(auth_deadline);
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ready = false;
        let mut acc = BytesMut::with_capacity(16 * 1024);

        loop {
            tokio::select! {
                biased;

                cmd = self.command_rx.recv() => match cmd {
                    None | Some(Command::Stop) => return SessionEnd::Stop,
                    Some(Command::SwitchEnv(next)) => {
                        if next != env {
                            return SessionEnd::Switch(next);
                        }
                    }
                    Some(Command::Write { frame, client_msg_id }) => {
                        if let Err(e) = write_frame(writer, &frame).await {
                            error!("socket write failed: {}", e);
                            if let Some(id) = client_msg_id {
                                self.router.reject_one(&id, UpstreamError::Disconnected);
                            }
                            return SessionEnd::Failed;
                        }
                        counter!("upstream_frames_sent_total").increment(1);
                    }
                },

                res = &mut auth_rx, if !ready => {
                    match app_auth_outcome(res) {
                        Ok(()) => {
                            ready = true;
                            info!("application authorized on {} channel", env);
                            let _ = self.gate_tx.send(GateState::Ready { env });
                            gauge!("upstream_ready").set(1.0);
                            heartbeat.reset();
                        }
                        Err(e) => {
                            error!("application auth failed: {}", e);
                            return SessionEnd::Failed;
                        }
                    }
                },

                _ = &mut auth_deadline, if !ready => {
                    error!("application auth timed out after {:?}", APP_AUTH_TIMEOUT);
                    self.router.take(&auth_id);
                    return SessionEnd::Failed;
                },

                _ = heartbeat.tick(), if ready => {
                    // One-way, uncorrelated; failures are swallowed and the
                    // read path surfaces any real socket loss.
                    match self.heartbeat_frame() {
                        Ok(framed) => {
                            if let Err(e) = write_frame(writer, &framed).await {
                                warn!("heartbeat write failed: {}", e);
                            }
                        }
                        Err(e) => warn!("heartbeat encode failed: {}", e),
                    }
                },

                read = reader.read_buf(&mut acc) => match read {
                    Ok(0) => {
                        info!("upstream closed the connection");
                        return SessionEnd::Failed;
                    }
                    Ok(_) => {
                        for inbound in deframe(&mut acc) {
                            self.router.route_frame(&inbound, env);
                        }
                    }
                    Err(e) => {
                        error!("socket read failed: {}", e);
                        return SessionEnd::Failed;
                    }
                },
            }
        }
    }

    /// Sleep out the backoff, still honoring stop/switch commands. Writes
    /// that arrive while disconnected are rejected immediately.
    async fn backoff_wait(&mut self, delay: Duration) -> BackoffOutcome {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return BackoffOutcome::Elapsed,
                cmd = self.command_rx.recv() => match cmd {
                    None | Some(Command::Stop) => return BackoffOutcome::Stop,
                    Some(Command::SwitchEnv(env)) => return BackoffOutcome::Switch(env),
                    Some(Command::Write { client_msg_id, .. }) => {
                        if let Some(id) = client_msg_id {
                            self.router.reject_one(&id, UpstreamError::Disconnected);
                        }
                    }
                },
            }
        }
    }

    async fn dial(&self, env: Environment) -> Result<TlsStream<TcpStream>, UpstreamError> {
        let host = self.config.host(env).to_string();
        let addr = format!("{}:{}", host, self.config.port);
        let tcp = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr))
            .await
            .map_err(|_| UpstreamError::ConnectTimeout(addr.clone()))??;
        let server_name = rustls::pki_types::ServerName::try_from(host.clone())
            .map_err(|_| UpstreamError::InvalidHost(host))?;
        let stream = self.tls.connect(server_name, tcp).await?;
        Ok(stream)
    }

    fn heartbeat_frame(&self) -> Result<BytesMut, UpstreamError> {
        let mut payload = serde_json::json!({});
        encode_request(&self.registry, HEARTBEAT_EVENT, &mut payload, None)
    }

    fn shutdown(&self) {
        let _ = self.gate_tx.send(GateState::ShuttingDown);
        self.router.reject_all(|| UpstreamError::Disconnected);
        gauge!("upstream_ready").set(0.0);
        info!("upstream connection stopped");
    }
}

async fn write_frame(
    writer: &mut WriteHalf<TlsStream<TcpStream>>,
    framed: &[u8],
) -> std::io::Result<()> {
    writer.write_all(framed).await?;
    writer.flush().await
}

fn app_auth_outcome(
    res: Result<Result<UpstreamResponse, UpstreamError>, oneshot::error::RecvError>,
) -> Result<(), UpstreamError> {
    match res {
        Ok(Ok(response)) => {
            if response.payload_name.contains("ERROR_RES") {
                Err(UpstreamError::AppAuth(error_description(&response.decoded)))
            } else if !response.decoded.is_object() {
                Err(UpstreamError::AppAuth("empty response".to_string()))
            } else {
                Ok(())
            }
        }
        Ok(Err(e)) => Err(e),
        Err(_) => Err(UpstreamError::Disconnected),
    }
}

fn error_description(decoded: &Value) -> String {
    decoded
        .get("description")
        .and_then(Value::as_str)
        .or_else(|| decoded.get("errorCode").and_then(Value::as_str))
        .unwrap_or("upstream error")
        .to_string()
}

fn tls_connector() -> Result<TlsConnector, UpstreamError> {
    let mut roots = rustls::RootCertStore::empty();
    let certs = rustls_native_certs::load_native_certs();
    for cert in certs.certs {
        let _ = roots.add(cert);
    }
    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| UpstreamError::Io(std::io::Error::other(e)))?
    .with_root_certificates(roots)
    .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Allocate the next client message id: monotonic, wrapping inside
/// `1..2_000_000_000` so 0 is never issued.
fn next_client_msg_id(counter: &AtomicU64) -> String {
    let raw = counter.fetch_add(1, Ordering::SeqCst);
    let id = raw % (CLIENT_MSG_ID_WRAP - 1) + 1;
    id.to_string()
}

fn next_backoff(current: Duration) -> Duration {
    current.mul_f64(BACKOFF_FACTOR).min(MAX_BACKOFF)
}

/// Build one framed request: payload encoded, correlation id attached to
/// the payload when its message type has a `clientMsgId` field, wrapper
/// always carrying the id when one is supplied.
fn encode_request(
    registry: &SchemaRegistry,
    payload_key: &str,
    payload: &mut Value,
    client_msg_id: Option<&str>,
) -> Result<BytesMut, UpstreamError> {
    let payload_type = registry.payload_type_id(payload_key)?;
    let desc = registry.message_type_from_payload_name(payload_key)?;
    if let Some(id) = client_msg_id {
        if registry.has_field(&desc, "clientMsgId") {
            if let Some(obj) = payload.as_object_mut() {
                obj.insert("clientMsgId".to_string(), Value::String(id.to_string()));
            }
        }
    }
    let payload_bytes = registry.encode_message(&desc, payload)?;
    let wrapped = registry.encode_proto_message(payload_type, &payload_bytes, client_msg_id)?;
    Ok(frame(&wrapped))
}

// ============================================================================
// Inbound routing
// ============================================================================

/// Routes decoded inbound frames: correlation first, then the oldest-pending
/// fallback for system frames, then the async event path. Shared between
/// the actor (routing, disconnect rejection) and handles (register/remove).
pub(crate) struct InboundRouter {
    registry: Arc<SchemaRegistry>,
    pending: DashMap<String, PendingEntry>,
    next_seq: AtomicU64,
    bus: Arc<QuoteBus>,
    subscriptions: Arc<SubscriptionIndex>,
}

impl InboundRouter {
    fn new(
        registry: Arc<SchemaRegistry>,
        bus: Arc<QuoteBus>,
        subscriptions: Arc<SubscriptionIndex>,
    ) -> Self {
        Self {
            registry,
            pending: DashMap::new(),
            next_seq: AtomicU64::new(0),
            bus,
            subscriptions,
        }
    }

    fn register(
        &self,
        client_msg_id: String,
        payload_key: &str,
        tx: oneshot::Sender<Result<UpstreamResponse, UpstreamError>>,
    ) {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        self.pending.insert(
            client_msg_id,
            PendingEntry {
                seq,
                payload_key: payload_key.to_string(),
                tx,
            },
        );
        gauge!("upstream_pending_requests").set(self.pending.len() as f64);
    }

    fn take(&self, client_msg_id: &str) -> Option<PendingEntry> {
        let entry = self.pending.remove(client_msg_id).map(|(_, e)| e);
        gauge!("upstream_pending_requests").set(self.pending.len() as f64);
        entry
    }

    fn reject_one(&self, client_msg_id: &str, err: UpstreamError) {
        if let Some(entry) = self.take(client_msg_id) {
            let _ = entry.tx.send(Err(err));
        }
    }

    /// Atomically reject everything pending, e.g. on disconnect.
    fn reject_all(&self, make_err: impl Fn() -> UpstreamError) {
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, entry)) = self.pending.remove(&id) {
                debug!("rejecting pending {} ({})", id, entry.payload_key);
                let _ = entry.tx.send(Err(make_err()));
            }
        }
        gauge!("upstream_pending_requests").set(self.pending.len() as f64);
    }

    fn route_frame(&self, inbound: &[u8], env: Environment) {
        counter!("upstream_frames_received_total").increment(1);
        let wrapper = match self.registry.decode_proto_message(inbound) {
            Ok(wrapper) => wrapper,
            Err(e) => {
                warn!("dropping undecodable frame: {}", e);
                return;
            }
        };
        let payload_name = match self.registry.payload_type_name(wrapper.payload_type) {
            Some(name) => name.to_string(),
            None => {
                debug!("ignoring frame with unknown payload type {}", wrapper.payload_type);
                return;
            }
        };
        let desc = match self.registry.message_type_from_payload_name(&payload_name) {
            Ok(desc) => desc,
            Err(e) => {
                warn!("no message type for {}: {}", payload_name, e);
                return;
            }
        };
        let decoded = match self.registry.decode_message(&desc, &wrapper.payload) {
            Ok(value) => value,
            Err(e) => {
                warn!("dropping malformed {} frame: {}", payload_name, e);
                return;
            }
        };

        // Wrapper id first, payload id as fallback.
        let correlation_id = wrapper.client_msg_id.clone().or_else(|| {
            decoded
                .get("clientMsgId")
                .and_then(Value::as_str)
                .map(str::to_string)
        });

        let response = UpstreamResponse {
            payload_name: payload_name.clone(),
            type_name: desc.name().to_string(),
            decoded,
        };

        if let Some(id) = &correlation_id {
            if let Some(entry) = self.take(id) {
                let _ = entry.tx.send(Ok(response));
                return;
            }
        }

        if SYSTEM_FALLBACK_PAYLOADS.contains(&payload_name.as_str()) {
            if let Some(unclaimed) = self.resolve_oldest(response) {
                debug!(
                    "uncorrelated {} with no pending requests",
                    unclaimed.payload_name
                );
            }
            return;
        }

        match payload_name.as_str() {
            SPOT_EVENT => self.route_spot(response.decoded, env),
            _ => debug!("dropping unhandled event {}", payload_name),
        }
    }

    /// Best-effort match for uncorrelated system frames. Returns the
    /// response when nothing was pending.
    fn resolve_oldest(&self, response: UpstreamResponse) -> Option<UpstreamResponse> {
        let oldest = self
            .pending
            .iter()
            .min_by_key(|e| e.value().seq)
            .map(|e| e.key().clone());
        match oldest.and_then(|id| self.take(&id)) {
            Some(entry) => {
                let _ = entry.tx.send(Ok(response));
                None
            }
            None => Some(response),
        }
    }

    fn route_spot(&self, decoded: Value, env: Environment) {
        let account_id = decoded.get("ctidTraderAccountId").and_then(Value::as_i64);
        let symbol_id = decoded.get("symbolId").and_then(Value::as_i64);
        let (Some(account_id), Some(symbol_id)) = (account_id, symbol_id) else {
            warn!("spot event missing account or symbol id");
            return;
        };
        let Some(route) = self.subscriptions.resolve(account_id, symbol_id) else {
            debug!(
                "spot for unsubscribed account {} symbol {}",
                account_id, symbol_id
            );
            return;
        };
        if route.env != env {
            debug!("spot for account {} arrived on wrong environment", account_id);
            return;
        }
        let quote = Quote {
            user_id: route.user_id,
            env: route.env,
            account_id,
            symbol_id,
            bid: decoded.get("bid").and_then(Value::as_u64),
            ask: decoded.get("ask").and_then(Value::as_u64),
            timestamp: decoded.get("timestamp").and_then(Value::as_i64),
        };
        counter!("upstream_spot_events_total").increment(1);
        self.bus.upsert(quote);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscriptions::SpotRoute;
    use serde_json::json;
    use std::path::PathBuf;

    fn registry() -> Arc<SchemaRegistry> {
        let dir = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../proto");
        Arc::new(SchemaRegistry::load(&dir).unwrap())
    }

    fn router() -> (Arc<InboundRouter>, Arc<QuoteBus>, Arc<SubscriptionIndex>) {
        let bus = Arc::new(QuoteBus::new());
        let subs = Arc::new(SubscriptionIndex::new());
        let router = Arc::new(InboundRouter::new(registry(), bus.clone(), subs.clone()));
        (router, bus, subs)
    }

    fn inbound_frame(
        reg: &SchemaRegistry,
        payload_key: &str,
        payload: serde_json::Value,
        client_msg_id: Option<&str>,
    ) -> Vec<u8> {
        let id = reg.payload_type_id(payload_key).unwrap();
        let desc = reg.message_type_from_payload_name(payload_key).unwrap();
        let bytes = reg.encode_message(&desc, &payload).unwrap();
        reg.encode_proto_message(id, &bytes, client_msg_id).unwrap()
    }

    #[test]
    fn test_client_msg_id_skips_zero_and_wraps() {
        let counter = AtomicU64::new(0);
        assert_eq!(next_client_msg_id(&counter), "1");
        assert_eq!(next_client_msg_id(&counter), "2");

        let near_wrap = AtomicU64::new(CLIENT_MSG_ID_WRAP - 2);
        assert_eq!(next_client_msg_id(&near_wrap), "1999999999");
        // Wraps back to 1, never 0.
        assert_eq!(next_client_msg_id(&near_wrap), "1");
        assert_eq!(next_client_msg_id(&near_wrap), "2");
    }

    #[test]
    fn test_backoff_progression() {
        let mut delay = INITIAL_BACKOFF;
        assert_eq!(delay, Duration::from_millis(500));
        delay = next_backoff(delay);
        assert_eq!(delay, Duration::from_millis(900));
        delay = next_backoff(delay);
        assert_eq!(delay, Duration::from_millis(1620));
        for _ in 0..20 {
            delay = next_backoff(delay);
        }
        assert_eq!(delay, MAX_BACKOFF);
    }

    #[test]
    fn test_encode_request_attaches_wrapper_id() {
        let reg = registry();
        let mut payload = json!({"ctidTraderAccountId": 1, "accessToken": "T"});
        let framed = encode_request(&reg, "PROTO_OA_ACCOUNT_AUTH_REQ", &mut payload, Some("7"))
            .unwrap();
        let mut acc = BytesMut::from(&framed[..]);
        let frames = deframe(&mut acc);
        assert_eq!(frames.len(), 1);
        let wrapper = reg.decode_proto_message(&frames[0]).unwrap();
        assert_eq!(wrapper.payload_type, 2102);
        assert_eq!(wrapper.client_msg_id.as_deref(), Some("7"));
        // The payload message has no clientMsgId field, so the object is
        // left alone.
        assert!(payload.get("clientMsgId").is_none());
    }

    #[tokio::test]
    async fn test_correlated_response_resolves_pending() {
        let (router, _, _) = router();
        let (tx, rx) = oneshot::channel();
        router.register("5".to_string(), "PROTO_OA_ACCOUNT_AUTH_REQ", tx);

        let reg = registry();
        let frame = inbound_frame(
            &reg,
            "PROTO_OA_ACCOUNT_AUTH_RES",
            json!({"ctidTraderAccountId": 42}),
            Some("5"),
        );
        router.route_frame(&frame, Environment::Demo);

        let response = rx.await.unwrap().unwrap();
        assert_eq!(response.payload_name, "PROTO_OA_ACCOUNT_AUTH_RES");
        assert_eq!(response.type_name, "ProtoOAAccountAuthRes");
        assert_eq!(response.decoded["ctidTraderAccountId"], json!(42));
    }

    #[tokio::test]
    async fn test_uncorrelated_system_frame_resolves_oldest() {
        let (router, _, _) = router();
        let (tx_old, rx_old) = oneshot::channel();
        let (tx_new, mut rx_new) = oneshot::channel();
        router.register("1".to_string(), "PROTO_OA_APPLICATION_AUTH_REQ", tx_old);
        router.register("2".to_string(), "PROTO_OA_TRADER_REQ", tx_new);

        let reg = registry();
        let frame = inbound_frame(&reg, "PROTO_OA_APPLICATION_AUTH_RES", json!({}), None);
        router.route_frame(&frame, Environment::Demo);

        let response = rx_old.await.unwrap().unwrap();
        assert_eq!(response.payload_name, "PROTO_OA_APPLICATION_AUTH_RES");
        assert!(rx_new.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_uncorrelated_event_is_dropped() {
        let (router, bus, _) = router();
        let (tx, mut rx) = oneshot::channel();
        router.register("1".to_string(), "PROTO_OA_TRADER_REQ", tx);

        let reg = registry();
        let frame = inbound_frame(
            &reg,
            "PROTO_OA_EXECUTION_EVENT",
            json!({"ctidTraderAccountId": 1, "executionType": "ORDER_ACCEPTED"}),
            None,
        );
        router.route_frame(&frame, Environment::Demo);

        // Execution events never resolve pending requests or touch the bus.
        assert!(rx.try_recv().is_err());
        assert!(bus
            .get_last(&QuoteKeyFixture::key())
            .is_none());
    }

    #[tokio::test]
    async fn test_spot_event_routes_to_quote_bus() {
        let (router, bus, subs) = router();
        subs.register(
            42,
            1,
            SpotRoute {
                user_id: "u1".to_string(),
                env: Environment::Demo,
                account_id: 42,
            },
        );

        let reg = registry();
        let frame = inbound_frame(
            &reg,
            "PROTO_OA_SPOT_EVENT",
            json!({"ctidTraderAccountId": 42, "symbolId": 1, "bid": 110450, "ask": 110470, "timestamp": 1700000000000i64}),
            None,
        );
        router.route_frame(&frame, Environment::Demo);

        let quote = bus.get_last(&QuoteKeyFixture::key()).unwrap();
        assert_eq!(quote.bid, Some(110450));
        assert_eq!(quote.ask, Some(110470));
        assert_eq!(quote.user_id, "u1");
    }

    #[tokio::test]
    async fn test_spot_event_without_subscription_is_dropped() {
        let (router, bus, _) = router();
        let reg = registry();
        let frame = inbound_frame(
            &reg,
            "PROTO_OA_SPOT_EVENT",
            json!({"ctidTraderAccountId": 42, "symbolId": 1, "bid": 1}),
            None,
        );
        router.route_frame(&frame, Environment::Demo);
        assert!(bus.get_last(&QuoteKeyFixture::key()).is_none());
    }

    #[test]
    fn test_garbage_frame_does_not_panic() {
        let (router, _, _) = router();
        router.route_frame(&[0xff, 0x01, 0x02], Environment::Demo);
    }

    #[tokio::test]
    async fn test_reject_all_delivers_disconnect() {
        let (router, _, _) = router();
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        router.register("1".to_string(), "PROTO_OA_TRADER_REQ", tx1);
        router.register("2".to_string(), "PROTO_OA_NEW_ORDER_REQ", tx2);

        router.reject_all(|| UpstreamError::Disconnected);

        assert!(matches!(rx1.await.unwrap(), Err(UpstreamError::Disconnected)));
        assert!(matches!(rx2.await.unwrap(), Err(UpstreamError::Disconnected)));
        assert!(router.pending.is_empty());
    }

    /// A handle wired to a test-held command queue and an already-open
    /// gate, with no socket behind it.
    struct SendHarness {
        handle: UpstreamHandle,
        command_rx: mpsc::UnboundedReceiver<Command>,
        router: Arc<InboundRouter>,
        _gate: watch::Sender<GateState>,
    }

    fn send_harness() -> SendHarness {
        let reg = registry();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (gate_tx, gate_rx) = watch::channel(GateState::Ready {
            env: Environment::Demo,
        });
        let router = Arc::new(InboundRouter::new(
            reg.clone(),
            Arc::new(QuoteBus::new()),
            Arc::new(SubscriptionIndex::new()),
        ));
        SendHarness {
            handle: UpstreamHandle {
                command_tx,
                gate: gate_rx,
                router: router.clone(),
                registry: reg,
                next_id: Arc::new(AtomicU64::new(0)),
                default_env: Environment::Demo,
            },
            command_rx,
            router,
            _gate: gate_tx,
        }
    }

    #[tokio::test]
    async fn test_send_resolves_with_correlated_response() {
        let mut harness = send_harness();
        let handle = harness.handle.clone();
        let request = tokio::spawn(async move {
            handle
                .send(
                    "PROTO_OA_ACCOUNT_AUTH_REQ",
                    json!({"ctidTraderAccountId": 42, "accessToken": "T"}),
                    Duration::from_secs(5),
                    None,
                )
                .await
        });

        let Some(Command::Write { frame, client_msg_id }) = harness.command_rx.recv().await
        else {
            panic!("expected a write command");
        };
        let id = client_msg_id.expect("send registers a correlation id");

        // The wrapper on the wire carries the same id the pending map uses.
        let reg = registry();
        let mut acc = frame;
        let frames = deframe(&mut acc);
        assert_eq!(frames.len(), 1);
        let wrapper = reg.decode_proto_message(&frames[0]).unwrap();
        assert_eq!(wrapper.client_msg_id.as_deref(), Some(id.as_str()));

        let response_frame = inbound_frame(
            &reg,
            "PROTO_OA_ACCOUNT_AUTH_RES",
            json!({"ctidTraderAccountId": 42}),
            Some(&id),
        );
        harness.router.route_frame(&response_frame, Environment::Demo);

        let response = request.await.unwrap().unwrap();
        assert_eq!(response.payload_name, "PROTO_OA_ACCOUNT_AUTH_RES");
        assert_eq!(response.decoded["ctidTraderAccountId"], json!(42));
        assert!(harness.router.pending.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_times_out_and_clears_pending() {
        let mut harness = send_harness();
        let handle = harness.handle.clone();
        let request = tokio::spawn(async move {
            handle
                .send(
                    "PROTO_OA_TRADER_REQ",
                    json!({"ctidTraderAccountId": 1}),
                    Duration::from_secs(2),
                    None,
                )
                .await
        });

        // The frame is written but never answered.
        assert!(matches!(
            harness.command_rx.recv().await,
            Some(Command::Write { .. })
        ));

        let err = request.await.unwrap().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Request timeout (PROTO_OA_TRADER_REQ) clientMsgId=1"
        );
        assert!(harness.router.pending.is_empty());
    }

    #[tokio::test]
    async fn test_send_rejected_when_pending_at_disconnect() {
        let mut harness = send_harness();
        let handle = harness.handle.clone();
        let request = tokio::spawn(async move {
            handle
                .send(
                    "PROTO_OA_TRADER_REQ",
                    json!({"ctidTraderAccountId": 1}),
                    Duration::from_secs(30),
                    None,
                )
                .await
        });
        assert!(matches!(
            harness.command_rx.recv().await,
            Some(Command::Write { .. })
        ));

        harness.router.reject_all(|| UpstreamError::Disconnected);

        let err = request.await.unwrap().unwrap_err();
        assert!(matches!(err, UpstreamError::Disconnected));
    }

    #[tokio::test]
    async fn test_send_fails_fast_when_shutting_down() {
        let harness = send_harness();
        let _ = harness._gate.send(GateState::ShuttingDown);
        let err = harness
            .handle
            .send(
                "PROTO_OA_TRADER_REQ",
                json!({"ctidTraderAccountId": 1}),
                Duration::from_secs(1),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::ShuttingDown));
    }

    struct QuoteKeyFixture;

    impl QuoteKeyFixture {
        fn key() -> crate::quote_bus::QuoteKey {
            crate::quote_bus::QuoteKey {
                user_id: "u1".to_string(),
                env: Environment::Demo,
                account_id: 42,
                symbol_id: 1,
            }
        }
    }
}
