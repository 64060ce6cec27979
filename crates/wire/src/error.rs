//! Wire error types.

use thiserror::Error;

/// Errors raised by the frame codec and schema registry.
#[derive(Debug, Error)]
pub enum WireError {
    /// Schema compilation failed (missing file, syntax error, bad import).
    #[error("failed to compile protobuf schema: {0}")]
    SchemaCompile(String),

    /// The compiled descriptor set was rejected by the reflection layer.
    #[error("invalid descriptor set: {0}")]
    Descriptor(#[from] prost_reflect::DescriptorError),

    /// No message with the expected wrapper suffix exists in the schema.
    #[error("schema has no message with suffix '{0}'")]
    MissingWrapper(&'static str),

    /// The wrapper message is missing a field the protocol depends on.
    #[error("wrapper message lacks field '{0}'")]
    MissingWrapperField(&'static str),

    /// Payload enum key lookup failed. `suggestions` is pre-formatted
    /// ("" or ". Did you mean: A, B, ...").
    #[error("unknown payload type '{name}'{suggestions}")]
    UnknownPayloadType { name: String, suggestions: String },

    /// Message type lookup failed.
    #[error("unknown message type '{name}'{suggestions}")]
    UnknownMessageType { name: String, suggestions: String },

    #[error("failed to encode {type_name}: {message}")]
    Encode { type_name: String, message: String },

    #[error("failed to decode {type_name}: {message}")]
    Decode { type_name: String, message: String },

    /// The frame did not parse as the wrapper message.
    #[error("frame is not a valid wrapper message: {0}")]
    InvalidWrapper(String),
}

pub type Result<T> = std::result::Result<T, WireError>;
