//! Wire-level plumbing for the upstream venue protocol: the 4-byte
//! length-prefixed framing and the runtime protobuf schema registry.

pub mod error;
pub mod frame;
pub mod registry;

pub use error::{Result, WireError};
pub use frame::{deframe, frame};
pub use registry::{DecodedProtoMessage, SchemaRegistry};
