//! Runtime protobuf schema registry.
//!
//! The venue publishes its schema as `.proto` files rather than as a stable
//! generated API, so the registry compiles the schema at startup and works
//! with dynamic messages. JSON-shaped values (`serde_json::Value`) cross this
//! boundary: encode coerces human-readable enum constants ("BUY", "MARKET")
//! to their numeric values, decode emits proto field names and numeric enums.

use crate::error::{Result, WireError};
use bytes::Bytes;
use prost::Message;
use prost_reflect::{
    DescriptorPool, DeserializeOptions, DynamicMessage, MessageDescriptor, SerializeOptions,
    Value as ProtoValue,
};
use std::collections::HashMap;
use std::path::Path;

/// The fixed schema set shipped by the venue. Order matters only for
/// readability; imports are resolved against the schema directory.
pub const SCHEMA_FILES: &[&str] = &[
    "OpenApiCommonModelMessages.proto",
    "OpenApiCommonMessages.proto",
    "OpenApiModelMessages.proto",
    "OpenApiMessages.proto",
];

const WRAPPER_SUFFIX: &str = "ProtoMessage";
const PAYLOAD_ENUM_SUFFIX: &str = "PayloadType";
const MAX_SUGGESTIONS: usize = 10;

/// The venue renamed a handful of messages across schema revisions; these
/// aliases keep the old spellings working. Checked only after a direct
/// lookup misses.
const PAYLOAD_KEY_ALIASES: &[(&str, &str)] = &[
    ("PROTO_HEARTBEAT_EVENT", "HEARTBEAT_EVENT"),
    ("PROTO_ERROR_RES", "ERROR_RES"),
    (
        "PROTO_OA_GET_ACCOUNTS_BY_ACCESS_TOKEN_REQ",
        "PROTO_OA_GET_ACCOUNT_LIST_BY_ACCESS_TOKEN_REQ",
    ),
    (
        "PROTO_OA_GET_ACCOUNTS_BY_ACCESS_TOKEN_RES",
        "PROTO_OA_GET_ACCOUNT_LIST_BY_ACCESS_TOKEN_RES",
    ),
];

const TYPE_NAME_ALIASES: &[(&str, &str)] = &[
    ("HeartbeatEvent", "ProtoHeartbeatEvent"),
    ("ErrorRes", "ProtoErrorRes"),
    ("Message", "ProtoMessage"),
    (
        "ProtoOAGetAccountsByAccessTokenReq",
        "ProtoOAGetAccountListByAccessTokenReq",
    ),
    (
        "ProtoOAGetAccountsByAccessTokenRes",
        "ProtoOAGetAccountListByAccessTokenRes",
    ),
];

/// Decoded wrapper frame: the payload type discriminant, the raw payload
/// bytes, and the correlation id when the venue echoed one.
#[derive(Debug, Clone)]
pub struct DecodedProtoMessage {
    pub payload_type: u32,
    pub payload: Bytes,
    pub client_msg_id: Option<String>,
}

/// Typed registry over the compiled schema: payload enum tables plus
/// message descriptors, with encode/decode helpers for both the wrapper
/// and the payload messages.
pub struct SchemaRegistry {
    pool: DescriptorPool,
    wrapper: MessageDescriptor,
    payload_ids: HashMap<String, u32>,
    payload_names: HashMap<u32, String>,
}

impl SchemaRegistry {
    /// Compile the schema files under `dir` and build the lookup tables.
    pub fn load(dir: &Path) -> Result<Self> {
        Self::load_files(dir, SCHEMA_FILES)
    }

    pub(crate) fn load_files(dir: &Path, files: &[&str]) -> Result<Self> {
        let paths: Vec<_> = files.iter().map(|f| dir.join(f)).collect();
        let set = protox::compile(&paths, [dir])
            .map_err(|e| WireError::SchemaCompile(e.to_string()))?;
        let pool = DescriptorPool::from_file_descriptor_set(set)?;

        let wrapper = pool
            .all_messages()
            .find(|m| m.name().ends_with(WRAPPER_SUFFIX))
            .ok_or(WireError::MissingWrapper(WRAPPER_SUFFIX))?;

        let mut payload_ids = HashMap::new();
        let mut payload_names = HashMap::new();
        for desc in pool.all_enums().filter(|e| e.name().ends_with(PAYLOAD_ENUM_SUFFIX)) {
            for value in desc.values() {
                let id = value.number() as u32;
                payload_ids.entry(value.name().to_string()).or_insert(id);
                payload_names.entry(id).or_insert_with(|| value.name().to_string());
            }
        }

        tracing::debug!(
            "schema loaded: {} payload types, wrapper {}",
            payload_ids.len(),
            wrapper.name()
        );

        Ok(Self {
            pool,
            wrapper,
            payload_ids,
            payload_names,
        })
    }

    /// Numeric payload type for an enum key, following the alias table.
    pub fn payload_type_id(&self, name: &str) -> Result<u32> {
        if let Some(id) = self.payload_ids.get(name) {
            return Ok(*id);
        }
        if let Some(alias) = alias_for(PAYLOAD_KEY_ALIASES, name) {
            if let Some(id) = self.payload_ids.get(alias) {
                return Ok(*id);
            }
        }
        Err(WireError::UnknownPayloadType {
            name: name.to_string(),
            suggestions: format_suggestions(&self.suggest_payload_keys(name)),
        })
    }

    /// Enum key for a numeric payload type, if the schema declares one.
    pub fn payload_type_name(&self, id: u32) -> Option<&str> {
        self.payload_names.get(&id).map(String::as_str)
    }

    /// Resolve a payload enum key to its message descriptor:
    /// `PROTO_OA_FOO_BAR_REQ` -> `ProtoOAFooBarReq` (the `OA` token is
    /// preserved as-is).
    pub fn message_type_from_payload_name(&self, enum_key: &str) -> Result<MessageDescriptor> {
        let key = alias_for(PAYLOAD_KEY_ALIASES, enum_key).unwrap_or(enum_key);
        let type_name = payload_key_to_type_name(key);
        self.message_by_name(&type_name)
    }

    /// Find a message descriptor by simple name, following the alias table.
    pub fn message_by_name(&self, name: &str) -> Result<MessageDescriptor> {
        if let Some(m) = self.find_message(name) {
            return Ok(m);
        }
        if let Some(alias) = alias_for(TYPE_NAME_ALIASES, name) {
            if let Some(m) = self.find_message(alias) {
                return Ok(m);
            }
        }
        Err(WireError::UnknownMessageType {
            name: name.to_string(),
            suggestions: format_suggestions(&self.suggest_type_names(name)),
        })
    }

    /// Whether `type_desc` declares a field named `name`.
    pub fn has_field(&self, type_desc: &MessageDescriptor, name: &str) -> bool {
        type_desc.get_field_by_name(name).is_some()
    }

    /// Encode a JSON-shaped object as the given message type.
    ///
    /// Enum fields (scalar and repeated) accept either the enum value name
    /// or its number; unknown object keys are ignored rather than rejected,
    /// matching what callers hand-build from HTTP requests.
    pub fn encode_message(
        &self,
        type_desc: &MessageDescriptor,
        value: &serde_json::Value,
    ) -> Result<Vec<u8>> {
        let options = DeserializeOptions::new().deny_unknown_fields(false);
        let message =
            DynamicMessage::deserialize_with_options(type_desc.clone(), value.clone(), &options)
                .map_err(|e| WireError::Encode {
                    type_name: type_desc.name().to_string(),
                    message: e.to_string(),
                })?;
        Ok(message.encode_to_vec())
    }

    /// Decode payload bytes into a JSON-shaped object with proto field
    /// names and numeric enum values.
    pub fn decode_message(
        &self,
        type_desc: &MessageDescriptor,
        bytes: &[u8],
    ) -> Result<serde_json::Value> {
        let message = DynamicMessage::decode(type_desc.clone(), bytes).map_err(|e| {
            WireError::Decode {
                type_name: type_desc.name().to_string(),
                message: e.to_string(),
            }
        })?;
        let options = SerializeOptions::new()
            .use_proto_field_name(true)
            .use_enum_numbers(true)
            .stringify_64_bit_integers(false)
            .skip_default_fields(true);
        message
            .serialize_with_options(serde_json::value::Serializer, &options)
            .map_err(|e| WireError::Decode {
                type_name: type_desc.name().to_string(),
                message: e.to_string(),
            })
    }

    /// Build the outer wrapper frame around already-encoded payload bytes.
    pub fn encode_proto_message(
        &self,
        payload_type: u32,
        payload: &[u8],
        client_msg_id: Option<&str>,
    ) -> Result<Vec<u8>> {
        let mut message = DynamicMessage::new(self.wrapper.clone());
        message.set_field(
            &self.wrapper_field("payloadType")?,
            ProtoValue::U32(payload_type),
        );
        message.set_field(
            &self.wrapper_field("payload")?,
            ProtoValue::Bytes(Bytes::copy_from_slice(payload)),
        );
        if let Some(id) = client_msg_id {
            message.set_field(
                &self.wrapper_field("clientMsgId")?,
                ProtoValue::String(id.to_string()),
            );
        }
        Ok(message.encode_to_vec())
    }

    /// Split a wrapper frame into its payload type, payload bytes, and
    /// correlation id.
    pub fn decode_proto_message(&self, bytes: &[u8]) -> Result<DecodedProtoMessage> {
        let message = DynamicMessage::decode(self.wrapper.clone(), bytes)
            .map_err(|e| WireError::InvalidWrapper(e.to_string()))?;

        let payload_type = message
            .get_field_by_name("payloadType")
            .and_then(|v| v.as_u32())
            .ok_or_else(|| WireError::InvalidWrapper("missing payloadType".to_string()))?;

        let payload = message
            .get_field_by_name("payload")
            .and_then(|v| v.as_bytes().cloned())
            .unwrap_or_default();

        let client_msg_id = if message.has_field_by_name("clientMsgId") {
            message
                .get_field_by_name("clientMsgId")
                .and_then(|v| v.as_str().map(str::to_string))
                .filter(|s| !s.is_empty())
        } else {
            None
        };

        Ok(DecodedProtoMessage {
            payload_type,
            payload,
            client_msg_id,
        })
    }

    fn wrapper_field(&self, name: &'static str) -> Result<prost_reflect::FieldDescriptor> {
        self.wrapper
            .get_field_by_name(name)
            .ok_or(WireError::MissingWrapperField(name))
    }

    fn find_message(&self, simple_name: &str) -> Option<MessageDescriptor> {
        self.pool.all_messages().find(|m| m.name() == simple_name)
    }

    fn suggest_payload_keys(&self, needle: &str) -> Vec<String> {
        suggest(self.payload_ids.keys().map(String::as_str), needle)
    }

    fn suggest_type_names(&self, needle: &str) -> Vec<String> {
        let names: Vec<String> = self.pool.all_messages().map(|m| m.name().to_string()).collect();
        suggest(names.iter().map(String::as_str), needle)
    }
}

/// `PROTO_OA_FOO_BAR_REQ` -> `ProtoOAFooBarReq`.
pub fn payload_key_to_type_name(key: &str) -> String {
    key.split('_')
        .map(|token| {
            if token == "OA" {
                token.to_string()
            } else {
                let mut chars = token.chars();
                match chars.next() {
                    Some(first) => {
                        first.to_ascii_uppercase().to_string()
                            + &chars.as_str().to_ascii_lowercase()
                    }
                    None => String::new(),
                }
            }
        })
        .collect()
}

fn alias_for<'a>(table: &'a [(&'a str, &'a str)], name: &str) -> Option<&'a str> {
    table.iter().find(|(from, _)| *from == name).map(|(_, to)| *to)
}

/// Did-you-mean candidates: whole-needle substring match first, then any
/// distinctive token of the needle.
fn suggest<'a>(candidates: impl Iterator<Item = &'a str>, needle: &str) -> Vec<String> {
    let needle_up = needle.to_ascii_uppercase();
    let all: Vec<&str> = candidates.collect();

    let mut hits: Vec<String> = all
        .iter()
        .filter(|c| c.to_ascii_uppercase().contains(&needle_up))
        .map(|c| c.to_string())
        .collect();

    if hits.is_empty() {
        let tokens: Vec<&str> = needle_up
            .split(['_', '.'])
            .filter(|t| !matches!(*t, "" | "PROTO" | "OA" | "REQ" | "RES" | "EVENT"))
            .collect();
        hits = all
            .iter()
            .filter(|c| {
                let cu = c.to_ascii_uppercase();
                tokens.iter().any(|t| cu.contains(t))
            })
            .map(|c| c.to_string())
            .collect();
    }

    hits.sort();
    hits.truncate(MAX_SUGGESTIONS);
    hits
}

fn format_suggestions(suggestions: &[String]) -> String {
    if suggestions.is_empty() {
        String::new()
    } else {
        format!(". Did you mean: {}", suggestions.join(", "))
    }
}
