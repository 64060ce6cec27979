//! At-rest encryption for OAuth tokens.
//!
//! AES-256-GCM with a fresh 12-byte IV per encryption. The stored layout is
//! `base64(iv ‖ tag ‖ ciphertext)`, so decrypt must reorder before handing
//! the buffer to the AEAD (which expects the tag appended).

use crate::error::{Error, Result};
use aes_gcm::aead::{Aead, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

const IV_BYTES: usize = 12;
const TAG_BYTES: usize = 16;
const KEY_BYTES: usize = 32;

/// Authenticated symmetric cipher for access/refresh tokens.
#[derive(Clone)]
pub struct TokenCipher {
    cipher: Aes256Gcm,
}

impl TokenCipher {
    /// Accepts the key as 64 hex characters or as base64 of 32 raw bytes.
    pub fn from_key_material(material: &str) -> Result<Self> {
        let raw = decode_key_material(material)?;
        let cipher = Aes256Gcm::new_from_slice(&raw)
            .map_err(|_| Error::InvalidKey("key must be exactly 32 bytes"))?;
        Ok(Self { cipher })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| Error::Encrypt)?;
        // The AEAD appends the tag; stored layout puts it before the body.
        let (body, tag) = sealed.split_at(sealed.len() - TAG_BYTES);
        let mut out = Vec::with_capacity(IV_BYTES + TAG_BYTES + body.len());
        out.extend_from_slice(nonce.as_slice());
        out.extend_from_slice(tag);
        out.extend_from_slice(body);
        Ok(BASE64.encode(out))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String> {
        let raw = BASE64.decode(encoded)?;
        if raw.len() < IV_BYTES + TAG_BYTES {
            return Err(Error::CiphertextTooShort);
        }
        let (iv, rest) = raw.split_at(IV_BYTES);
        let (tag, body) = rest.split_at(TAG_BYTES);
        let mut sealed = Vec::with_capacity(body.len() + TAG_BYTES);
        sealed.extend_from_slice(body);
        sealed.extend_from_slice(tag);
        let plain = self
            .cipher
            .decrypt(Nonce::from_slice(iv), sealed.as_ref())
            .map_err(|_| Error::Decrypt)?;
        String::from_utf8(plain).map_err(|_| Error::Decrypt)
    }
}

fn decode_key_material(material: &str) -> Result<Vec<u8>> {
    let trimmed = material.trim();
    if trimmed.len() == KEY_BYTES * 2 && trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
        return hex::decode(trimmed)
            .map_err(|_| Error::InvalidKey("invalid hex encoding"));
    }
    let raw = BASE64
        .decode(trimmed)
        .map_err(|_| Error::InvalidKey("expected 64 hex chars or base64"))?;
    if raw.len() != KEY_BYTES {
        return Err(Error::InvalidKey("decoded key must be 32 bytes"));
    }
    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEX_KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    fn cipher() -> TokenCipher {
        TokenCipher::from_key_material(HEX_KEY).unwrap()
    }

    #[test]
    fn test_roundtrip() {
        let c = cipher();
        let sealed = c.encrypt("very-secret-token").unwrap();
        assert_eq!(c.decrypt(&sealed).unwrap(), "very-secret-token");
    }

    #[test]
    fn test_fresh_iv_per_encryption() {
        let c = cipher();
        assert_ne!(c.encrypt("token").unwrap(), c.encrypt("token").unwrap());
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let c = cipher();
        let sealed = c.encrypt("token").unwrap();
        let mut raw = BASE64.decode(&sealed).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let tampered = BASE64.encode(raw);
        assert!(matches!(c.decrypt(&tampered), Err(Error::Decrypt)));
    }

    #[test]
    fn test_short_input_rejected() {
        let c = cipher();
        let short = BASE64.encode([0u8; 27]);
        assert!(matches!(c.decrypt(&short), Err(Error::CiphertextTooShort)));
    }

    #[test]
    fn test_base64_key_accepted() {
        let raw: Vec<u8> = (0u8..32).collect();
        let c = TokenCipher::from_key_material(&BASE64.encode(&raw)).unwrap();
        let hex_c = cipher();
        // Same key material either way: ciphertexts are interchangeable.
        let sealed = c.encrypt("x").unwrap();
        assert_eq!(hex_c.decrypt(&sealed).unwrap(), "x");
    }

    #[test]
    fn test_bad_key_rejected() {
        assert!(TokenCipher::from_key_material("deadbeef").is_err());
        assert!(TokenCipher::from_key_material(&BASE64.encode([0u8; 16])).is_err());
    }
}
