//! Per-user session state in the KV store.
//!
//! Sessions are created lazily on first write and expire with their TTL,
//! which is refreshed on every write to the most recent token lifetime.
//! All mutation goes through `patch_session`, which merges only the defined
//! fields of the patch so unset fields stay absent (never serialized as
//! null).

use crate::crypto::TokenCipher;
use crate::error::Result;
use crate::kv::Kv;
use chrono::Utc;
use common::Environment;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Redis key prefix for sessions: session:{userId}
pub const SESSION_KEY_PREFIX: &str = "session:";

/// Persisted session document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Environment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_account_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token_enc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token_enc: Option<String>,
    #[serde(default)]
    pub updated_at: i64,
}

/// Fields to merge into a session. `None` means "leave unchanged".
#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    pub env: Option<Environment>,
    pub active_account_id: Option<i64>,
    pub access_token_enc: Option<String>,
    pub refresh_token_enc: Option<String>,
}

/// Store for per-user sessions; token fields are encrypted at rest and
/// decrypted transparently on read.
#[derive(Clone)]
pub struct SessionStore {
    kv: Arc<dyn Kv>,
    cipher: Arc<TokenCipher>,
}

impl SessionStore {
    pub fn new(kv: Arc<dyn Kv>, cipher: Arc<TokenCipher>) -> Self {
        Self { kv, cipher }
    }

    fn key(user_id: &str) -> String {
        format!("{SESSION_KEY_PREFIX}{user_id}")
    }

    pub async fn load_session(&self, user_id: &str) -> Result<Option<Session>> {
        match self.kv.get(&Self::key(user_id)).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Read-modify-write merge. Writes with `Some(ttl)` reset the expiry;
    /// `None` keeps the one already on the key.
    pub async fn patch_session(
        &self,
        user_id: &str,
        patch: SessionPatch,
        ttl: Option<u64>,
    ) -> Result<Session> {
        let mut session = self.load_session(user_id).await?.unwrap_or_default();
        if let Some(env) = patch.env {
            session.env = Some(env);
        }
        if let Some(account_id) = patch.active_account_id {
            session.active_account_id = Some(account_id);
        }
        if let Some(token) = patch.access_token_enc {
            session.access_token_enc = Some(token);
        }
        if let Some(token) = patch.refresh_token_enc {
            session.refresh_token_enc = Some(token);
        }
        session.updated_at = Utc::now().timestamp_millis();

        let json = serde_json::to_string(&session)?;
        self.kv.set(&Self::key(user_id), &json, ttl).await?;
        debug!("session patched for user {}", user_id);
        Ok(session)
    }

    pub async fn set_env(&self, user_id: &str, env: Environment) -> Result<Session> {
        self.patch_session(
            user_id,
            SessionPatch {
                env: Some(env),
                ..Default::default()
            },
            None,
        )
        .await
    }

    pub async fn set_active_account_id(&self, user_id: &str, account_id: i64) -> Result<Session> {
        self.patch_session(
            user_id,
            SessionPatch {
                active_account_id: Some(account_id),
                ..Default::default()
            },
            None,
        )
        .await
    }

    /// Encrypt and persist a token pair; the session TTL follows the token
    /// lifetime.
    pub async fn save_tokens(
        &self,
        user_id: &str,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_in: u64,
    ) -> Result<Session> {
        let patch = SessionPatch {
            access_token_enc: Some(self.cipher.encrypt(access_token)?),
            refresh_token_enc: refresh_token
                .map(|t| self.cipher.encrypt(t))
                .transpose()?,
            ..Default::default()
        };
        self.patch_session(user_id, patch, Some(expires_in)).await
    }

    /// Decrypted access token; `Ok(None)` when the user has none stored.
    pub async fn access_token(&self, user_id: &str) -> Result<Option<String>> {
        match self.load_session(user_id).await? {
            Some(Session {
                access_token_enc: Some(sealed),
                ..
            }) => Ok(Some(self.cipher.decrypt(&sealed)?)),
            _ => Ok(None),
        }
    }

    /// Decrypted refresh token; `Ok(None)` when the user has none stored.
    pub async fn refresh_token(&self, user_id: &str) -> Result<Option<String>> {
        match self.load_session(user_id).await? {
            Some(Session {
                refresh_token_enc: Some(sealed),
                ..
            }) => Ok(Some(self.cipher.decrypt(&sealed)?)),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;

    const HEX_KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    fn store() -> (SessionStore, MemoryKv) {
        let kv = MemoryKv::new();
        let cipher = Arc::new(TokenCipher::from_key_material(HEX_KEY).unwrap());
        (SessionStore::new(Arc::new(kv.clone()), cipher), kv)
    }

    #[tokio::test]
    async fn test_patch_preserves_unset_fields() {
        let (store, kv) = store();
        store.set_env("u1", Environment::Live).await.unwrap();
        store.set_active_account_id("u1", 42).await.unwrap();

        let raw = kv.get("session:u1").await.unwrap().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed["env"], "live");
        assert_eq!(parsed["activeAccountId"], 42);
        // Fields never patched are absent from the JSON, not null.
        assert!(parsed.get("accessTokenEnc").is_none());
        assert!(parsed.get("refreshTokenEnc").is_none());
    }

    #[tokio::test]
    async fn test_save_tokens_encrypts_and_sets_ttl() {
        let (store, kv) = store();
        store
            .save_tokens("u1", "ACCESS", Some("REFRESH"), 3600)
            .await
            .unwrap();

        assert_eq!(kv.ttl_of("session:u1"), Some(3600));
        let raw = kv.get("session:u1").await.unwrap().unwrap();
        assert!(!raw.contains("ACCESS"));
        assert!(!raw.contains("REFRESH"));

        assert_eq!(store.access_token("u1").await.unwrap().as_deref(), Some("ACCESS"));
        assert_eq!(store.refresh_token("u1").await.unwrap().as_deref(), Some("REFRESH"));
    }

    #[tokio::test]
    async fn test_save_tokens_without_refresh_keeps_previous() {
        let (store, _) = store();
        store
            .save_tokens("u1", "A1", Some("R1"), 60)
            .await
            .unwrap();
        store.save_tokens("u1", "A2", None, 60).await.unwrap();

        assert_eq!(store.access_token("u1").await.unwrap().as_deref(), Some("A2"));
        assert_eq!(store.refresh_token("u1").await.unwrap().as_deref(), Some("R1"));
    }

    #[tokio::test]
    async fn test_absent_session_reads_as_none() {
        let (store, _) = store();
        assert!(store.load_session("ghost").await.unwrap().is_none());
        assert!(store.access_token("ghost").await.unwrap().is_none());
    }
}
