//! Clients for the collaborators the gateway does not own: the shared
//! key/value store, the OAuth token endpoint, and the at-rest token cipher,
//! plus the session and symbol stores built on top of them.

pub mod crypto;
pub mod error;
pub mod kv;
pub mod oauth;
pub mod session;
pub mod symbols;

pub use crypto::TokenCipher;
pub use error::{Error, Result};
pub use kv::{Kv, MemoryKv, RedisKv};
pub use oauth::{OAuthClient, TokenResponse};
pub use session::{Session, SessionPatch, SessionStore};
pub use symbols::{SymbolEntry, SymbolStore};
