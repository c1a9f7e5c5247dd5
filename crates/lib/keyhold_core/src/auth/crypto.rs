//! AES-256-GCM field encryption and keyed email lookup digests.
//!
//! Personal data columns (email, phone) are stored as base64-encoded
//! `nonce || ciphertext || tag` with a random 12-byte nonce per call, so
//! decryption needs no external nonce storage. Because ciphertexts are
//! randomized, emails additionally get an HMAC-SHA256 lookup digest that
//! serves as the unique index for login.

use std::fmt;

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use super::AuthError;

/// Nonce size for AES-256-GCM (12 bytes).
const NONCE_SIZE: usize = 12;
/// AES-256 key size (32 bytes).
pub const KEY_SIZE: usize = 32;
/// GCM tag size (16 bytes).
const TAG_SIZE: usize = 16;

/// Raw 256-bit field encryption key.
#[derive(Clone, PartialEq, Eq)]
pub struct FieldKey([u8; KEY_SIZE]);

impl FieldKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Decode a base64 key as stored in the secret backend.
    pub fn from_base64(encoded: &str) -> Result<Self, AuthError> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| AuthError::Encryption(format!("field key base64: {e}")))?;
        let key: [u8; KEY_SIZE] = bytes.try_into().map_err(|v: Vec<u8>| {
            AuthError::Encryption(format!("field key must be {KEY_SIZE} bytes, got {}", v.len()))
        })?;
        Ok(Self(key))
    }

    /// Generate a random key.
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_SIZE];
        rand::rng().fill_bytes(&mut key);
        Self(key)
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }
}

impl fmt::Debug for FieldKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FieldKey(..)")
    }
}

/// HMAC key for email lookup digests.
#[derive(Clone, PartialEq, Eq)]
pub struct LookupKey(Vec<u8>);

impl LookupKey {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self, AuthError> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(AuthError::Encryption("lookup key is empty".into()));
        }
        Ok(Self(bytes))
    }

    pub fn generate() -> Self {
        let mut key = vec![0u8; KEY_SIZE];
        rand::rng().fill_bytes(&mut key);
        Self(key)
    }
}

impl fmt::Debug for LookupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LookupKey(..)")
    }
}

/// Encrypt plaintext with AES-256-GCM.
///
/// Returns base64-encoded `nonce || ciphertext || tag`.
pub fn encrypt_field(plaintext: &str, key: &FieldKey) -> Result<String, AuthError> {
    let cipher = Aes256Gcm::new_from_slice(&key.0)
        .map_err(|e| AuthError::Encryption(format!("key init failed: {e}")))?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|e| AuthError::Encryption(format!("encryption failed: {e}")))?;

    let mut combined = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    combined.extend_from_slice(&nonce_bytes);
    combined.extend_from_slice(&ciphertext);

    Ok(STANDARD.encode(&combined))
}

/// Decrypt base64-encoded `nonce || ciphertext || tag`.
///
/// A wrong key or a tampered ciphertext fails authentication; it never yields
/// different plaintext.
pub fn decrypt_field(encrypted_b64: &str, key: &FieldKey) -> Result<String, AuthError> {
    let combined = STANDARD
        .decode(encrypted_b64)
        .map_err(|e| AuthError::Encryption(format!("base64 decode failed: {e}")))?;

    if combined.len() < NONCE_SIZE + TAG_SIZE {
        return Err(AuthError::Encryption("ciphertext too short".into()));
    }

    let cipher = Aes256Gcm::new_from_slice(&key.0)
        .map_err(|e| AuthError::Encryption(format!("key init failed: {e}")))?;

    let nonce = Nonce::from_slice(&combined[..NONCE_SIZE]);
    let plaintext = cipher
        .decrypt(nonce, &combined[NONCE_SIZE..])
        .map_err(|_| AuthError::Encryption("decryption failed".into()))?;

    String::from_utf8(plaintext)
        .map_err(|e| AuthError::Encryption(format!("UTF-8 decode failed: {e}")))
}

/// Normalize an email for lookup: trimmed and lowercased.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Hex HMAC-SHA256 digest of the normalized email.
pub fn email_lookup(email: &str, key: &LookupKey) -> Result<String, AuthError> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&key.0)
        .map_err(|e| AuthError::Encryption(format!("lookup key init failed: {e}")))?;
    mac.update(normalize_email(email).as_bytes());
    Ok(mac
        .finalize()
        .into_bytes()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect())
}

/// Field encryption bound to the keys handed over by the secret cache.
///
/// The gateway never persists key material.
#[derive(Debug, Clone)]
pub struct EncryptionGateway {
    field_key: FieldKey,
    lookup_key: LookupKey,
}

impl EncryptionGateway {
    pub fn new(field_key: FieldKey, lookup_key: LookupKey) -> Self {
        Self {
            field_key,
            lookup_key,
        }
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, AuthError> {
        encrypt_field(plaintext, &self.field_key)
    }

    pub fn decrypt(&self, ciphertext: &str) -> Result<String, AuthError> {
        decrypt_field(ciphertext, &self.field_key)
    }

    pub fn encrypt_opt(&self, plaintext: Option<&str>) -> Result<Option<String>, AuthError> {
        plaintext.map(|p| self.encrypt(p)).transpose()
    }

    pub fn decrypt_opt(&self, ciphertext: Option<&str>) -> Result<Option<String>, AuthError> {
        ciphertext.map(|c| self.decrypt(c)).transpose()
    }

    pub fn email_lookup(&self, email: &str) -> Result<String, AuthError> {
        email_lookup(email, &self.lookup_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_round_trip() {
        let key = FieldKey::generate();
        let plaintext = "alice@example.com";
        let encrypted = encrypt_field(plaintext, &key).unwrap();
        assert_ne!(encrypted, plaintext);
        assert_eq!(decrypt_field(&encrypted, &key).unwrap(), plaintext);
    }

    #[test]
    fn wrong_key_fails() {
        let encrypted = encrypt_field("+7 900 000 00 00", &FieldKey::generate()).unwrap();
        assert!(decrypt_field(&encrypted, &FieldKey::generate()).is_err());
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let key = FieldKey::generate();
        let encrypted = encrypt_field("secret", &key).unwrap();
        let mut raw = STANDARD.decode(&encrypted).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        assert!(decrypt_field(&STANDARD.encode(raw), &key).is_err());
    }

    #[test]
    fn nonce_is_fresh_per_call() {
        let key = FieldKey::generate();
        let a = encrypt_field("same", &key).unwrap();
        let b = encrypt_field("same", &key).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn empty_plaintext() {
        let key = FieldKey::generate();
        let encrypted = encrypt_field("", &key).unwrap();
        assert_eq!(decrypt_field(&encrypted, &key).unwrap(), "");
    }

    #[test]
    fn short_ciphertext_is_rejected() {
        let key = FieldKey::generate();
        assert!(decrypt_field(&STANDARD.encode([0u8; 8]), &key).is_err());
    }

    #[test]
    fn field_key_base64_round_trip() {
        let key = FieldKey::generate();
        assert_eq!(FieldKey::from_base64(&key.to_base64()).unwrap(), key);
        assert!(FieldKey::from_base64(&STANDARD.encode([1u8; 16])).is_err());
    }

    #[test]
    fn email_lookup_is_normalized_and_keyed() {
        let key = LookupKey::new(b"lookup-key".to_vec()).unwrap();
        let other = LookupKey::new(b"other-key".to_vec()).unwrap();
        let digest = email_lookup("Alice@Example.com ", &key).unwrap();
        assert_eq!(digest, email_lookup("alice@example.com", &key).unwrap());
        assert_ne!(digest, email_lookup("alice@example.com", &other).unwrap());
        assert_eq!(digest.len(), 64);
    }
}
