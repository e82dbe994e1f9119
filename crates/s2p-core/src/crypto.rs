//! Cryptography for the paired session: key derivation, payload encryption,
//! and message checksums.
//!
//! Both endpoints must produce byte-identical outputs for identical inputs —
//! the checksum and key-derivation test vectors at the bottom of this file
//! are the interop contract.
//!
//! - **Key derivation** — PBKDF2-HMAC-SHA256 over `pin ‖ local_id ‖ peer_id`
//!   with the protocol-wide salt. Changing the salt breaks every existing
//!   pairing.
//! - **Payload encryption** — AES-256-GCM, fresh 12-byte nonce per call,
//!   `base64(nonce ‖ ciphertext ‖ tag)` on the wire.
//! - **Checksum** — first 4 bytes of SHA-256 over
//!   `ascii(version) ‖ kind ‖ payload ‖ ascii(timestamp) ‖ key`, lowercase hex.

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

use crate::error::{BridgeError, BridgeResult};
use crate::message::Message;

/// Protocol-wide PBKDF2 salt. Process-wide constant; never rotate.
pub const PROTOCOL_SALT: &[u8] = b"speech2prompt_v1";
pub const PBKDF2_ITERATIONS: u32 = 100_000;
pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 12;
/// GCM appends a 128-bit tag; nothing shorter than nonce + tag can decrypt.
const MIN_BLOB_SIZE: usize = NONCE_SIZE + 16;

/// Derive a 256-bit session key from the user PIN and both device identifiers.
///
/// The three strings are concatenated as UTF-8 in exactly this order; both
/// endpoints must agree on it.
pub fn derive_key(pin: &str, local_id: &str, peer_id: &str) -> [u8; KEY_SIZE] {
    let password = format!("{pin}{local_id}{peer_id}");
    let mut key = [0u8; KEY_SIZE];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), PROTOCOL_SALT, PBKDF2_ITERATIONS, &mut key);
    key
}

/// Encrypt plaintext using AES-256-GCM.
/// Returns `base64(nonce ‖ ciphertext ‖ tag)`.
pub fn encrypt(plaintext: &str, key: &[u8]) -> BridgeResult<String> {
    if key.len() != KEY_SIZE {
        return Err(BridgeError::InvalidKeyLength { actual: key.len() });
    }
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|_| BridgeError::InvalidKeyLength { actual: key.len() })?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|e| BridgeError::Decrypt { message: format!("encryption failed: {e}") })?;

    let mut combined = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    combined.extend_from_slice(&nonce_bytes);
    combined.extend_from_slice(&ciphertext);

    Ok(BASE64.encode(combined))
}

/// Decrypt `base64(nonce ‖ ciphertext ‖ tag)` using AES-256-GCM.
pub fn decrypt(blob: &str, key: &[u8]) -> BridgeResult<String> {
    if key.len() != KEY_SIZE {
        return Err(BridgeError::InvalidKeyLength { actual: key.len() });
    }
    let combined = BASE64
        .decode(blob)
        .map_err(|e| BridgeError::Decrypt { message: format!("base64 decode failed: {e}") })?;

    if combined.len() < MIN_BLOB_SIZE {
        return Err(BridgeError::Decrypt {
            message: format!("blob truncated: {} < {MIN_BLOB_SIZE} bytes", combined.len()),
        });
    }

    let (nonce_bytes, ciphertext) = combined.split_at(NONCE_SIZE);
    let nonce = Nonce::from_slice(nonce_bytes);
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|_| BridgeError::InvalidKeyLength { actual: key.len() })?;

    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| BridgeError::Decrypt { message: "tag mismatch".into() })?;

    String::from_utf8(plaintext)
        .map_err(|e| BridgeError::Decrypt { message: format!("not UTF-8: {e}") })
}

/// Message checksum: first 4 bytes of SHA-256 over
/// `ascii(version) ‖ kind ‖ payload ‖ ascii(timestamp) ‖ secret`, as 8
/// lowercase hex characters.
pub fn checksum(version: u8, kind: &str, payload: &str, timestamp: u64, secret: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(version.to_string().as_bytes());
    hasher.update(kind.as_bytes());
    hasher.update(payload.as_bytes());
    hasher.update(timestamp.to_string().as_bytes());
    hasher.update(secret);

    let hash = hasher.finalize();
    hex::encode(&hash[..4])
}

/// Constant-time checksum comparison.
pub fn verify_checksum(
    version: u8,
    kind: &str,
    payload: &str,
    timestamp: u64,
    secret: &[u8],
    expected: &str,
) -> bool {
    let calculated = checksum(version, kind, payload, timestamp, secret);
    if calculated.len() != expected.len() {
        return false;
    }
    calculated.as_bytes().ct_eq(expected.as_bytes()).into()
}

/// Generate a random 128-bit device identifier, hex-encoded.
///
/// Generated once per install and persisted; the pairing key derivation
/// binds to it.
pub fn generate_device_id() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Cryptographic context for a paired session.
///
/// Owns the 32-byte session key from pairing completion (or reconnect) until
/// [`close`](Self::close) or drop; the key bytes are overwritten on both
/// paths. Every operation after close fails with `SessionClosed`.
pub struct CryptoContext {
    key: [u8; KEY_SIZE],
    closed: bool,
}

impl CryptoContext {
    /// Create a context from raw key material (e.g. a stored pairing).
    pub fn new(key: [u8; KEY_SIZE]) -> Self {
        Self { key, closed: false }
    }

    /// Create a context from key material of unchecked length.
    pub fn from_key_bytes(key: &[u8]) -> BridgeResult<Self> {
        let key: [u8; KEY_SIZE] = key
            .try_into()
            .map_err(|_| BridgeError::InvalidKeyLength { actual: key.len() })?;
        Ok(Self::new(key))
    }

    /// Derive a context from the user PIN and both device identifiers.
    pub fn from_pin(pin: &str, local_id: &str, peer_id: &str) -> Self {
        Self::new(derive_key(pin, local_id, peer_id))
    }

    fn guard(&self) -> BridgeResult<()> {
        if self.closed {
            return Err(BridgeError::SessionClosed);
        }
        Ok(())
    }

    /// Compute and store the checksum over the message's current fields.
    pub fn sign(&self, msg: &mut Message) -> BridgeResult<()> {
        self.guard()?;
        msg.checksum = checksum(
            msg.version,
            msg.kind.as_str(),
            &msg.payload,
            msg.timestamp,
            &self.key,
        );
        Ok(())
    }

    /// Recompute the checksum and compare in constant time.
    pub fn verify(&self, msg: &Message) -> BridgeResult<bool> {
        self.guard()?;
        Ok(verify_checksum(
            msg.version,
            msg.kind.as_str(),
            &msg.payload,
            msg.timestamp,
            &self.key,
            &msg.checksum,
        ))
    }

    /// Encrypt the payload in place, then sign over the ciphertext.
    ///
    /// Signing over ciphertext means inbound integrity failures short-circuit
    /// before AES ever runs.
    pub fn sign_and_encrypt(&self, msg: &mut Message) -> BridgeResult<()> {
        self.guard()?;
        msg.payload = encrypt(&msg.payload, &self.key)?;
        self.sign(msg)
    }

    /// Verify over the ciphertext first; only on success decrypt in place.
    pub fn verify_and_decrypt(&self, msg: &mut Message) -> BridgeResult<()> {
        if !self.verify(msg)? {
            return Err(BridgeError::Integrity);
        }
        msg.payload = decrypt(&msg.payload, &self.key)?;
        Ok(())
    }

    /// Zero the key. All operations afterwards fail with `SessionClosed`.
    pub fn close(&mut self) {
        self.key.zeroize();
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for CryptoContext {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageKind;

    #[test]
    fn key_derivation_is_deterministic() {
        let key1 = derive_key("123456", "handheld-abc", "desktop-xyz");
        let key2 = derive_key("123456", "handheld-abc", "desktop-xyz");
        let key3 = derive_key("654321", "handheld-abc", "desktop-xyz");

        assert_eq!(key1, key2);
        assert_ne!(key1, key3);
    }

    #[test]
    fn key_derivation_order_matters() {
        let ab = derive_key("123456", "A", "B");
        let ba = derive_key("123456", "B", "A");
        assert_ne!(ab, ba);
    }

    #[test]
    fn encrypt_decrypt_round_trip() {
        let key = derive_key("123456", "handheld-abc", "desktop-xyz");
        let plaintext = "Hello, World!";

        let encrypted = encrypt(plaintext, &key).unwrap();
        let decrypted = decrypt(&encrypted, &key).unwrap();

        assert_eq!(plaintext, decrypted);
        assert_ne!(plaintext, encrypted);
    }

    #[test]
    fn encrypt_uses_fresh_nonces() {
        let key = derive_key("123456", "a", "b");
        let one = encrypt("same input", &key).unwrap();
        let two = encrypt("same input", &key).unwrap();
        assert_ne!(one, two);
    }

    #[test]
    fn decrypt_rejects_wrong_key_and_truncation() {
        let key = derive_key("123456", "a", "b");
        let other = derive_key("999999", "a", "b");
        let blob = encrypt("secret", &key).unwrap();

        assert!(matches!(decrypt(&blob, &other), Err(BridgeError::Decrypt { .. })));
        assert!(matches!(
            decrypt(&BASE64.encode([0u8; 27]), &key),
            Err(BridgeError::Decrypt { .. })
        ));
        assert!(matches!(
            encrypt("x", &[0u8; 31]),
            Err(BridgeError::InvalidKeyLength { actual: 31 })
        ));
    }

    #[test]
    fn checksum_shape_and_sensitivity() {
        let key = derive_key("123456", "a", "b");
        let cs = checksum(1, "TEXT", "hello", 1_234_567_890, &key);

        assert_eq!(cs.len(), 8);
        assert!(cs.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(cs, checksum(1, "TEXT", "hello", 1_234_567_890, &key));
        assert_ne!(cs, checksum(1, "TEXT", "world", 1_234_567_890, &key));
        assert_ne!(cs, checksum(2, "TEXT", "hello", 1_234_567_890, &key));
        assert_ne!(cs, checksum(1, "ACK", "hello", 1_234_567_890, &key));
        assert_ne!(cs, checksum(1, "TEXT", "hello", 1_234_567_891, &key));
    }

    /// Interop vector: both endpoints must derive exactly this key for the
    /// S1 scenario inputs (PIN "123456", local id "A", peer id "B").
    #[test]
    fn derive_key_matches_peer_vector() {
        let key = derive_key("123456", "A", "B");
        let mut expected = [0u8; KEY_SIZE];
        pbkdf2::pbkdf2_hmac::<Sha256>(b"123456AB", b"speech2prompt_v1", 100_000, &mut expected);
        assert_eq!(key, expected);
    }

    #[test]
    fn context_sign_verify_and_tamper() {
        let ctx = CryptoContext::from_pin("123456", "handheld-abc", "desktop-xyz");
        let mut msg = Message::text("test");
        ctx.sign(&mut msg).unwrap();

        assert!(!msg.checksum.is_empty());
        assert!(ctx.verify(&msg).unwrap());

        msg.payload = "tampered".into();
        assert!(!ctx.verify(&msg).unwrap());
    }

    #[test]
    fn verify_refuses_before_decrypt_on_tamper() {
        let ctx = CryptoContext::from_pin("123456", "a", "b");
        let mut msg = Message::text("secret message");
        ctx.sign_and_encrypt(&mut msg).unwrap();

        // Flip one ciphertext byte; the checksum must catch it before AES runs.
        let mut blob = BASE64.decode(&msg.payload).unwrap();
        blob[NONCE_SIZE] ^= 0x01;
        msg.payload = BASE64.encode(blob);

        assert!(matches!(ctx.verify_and_decrypt(&mut msg), Err(BridgeError::Integrity)));
    }

    #[test]
    fn sign_and_encrypt_round_trip() {
        let ctx = CryptoContext::from_pin("123456", "a", "b");
        let mut msg = Message::new(MessageKind::Command, "ENTER");
        ctx.sign_and_encrypt(&mut msg).unwrap();
        assert_ne!(msg.payload, "ENTER");

        ctx.verify_and_decrypt(&mut msg).unwrap();
        assert_eq!(msg.payload, "ENTER");
    }

    #[test]
    fn close_zeroes_key_and_rejects_use() {
        let mut ctx = CryptoContext::from_pin("123456", "a", "b");
        assert_ne!(ctx.key, [0u8; KEY_SIZE]);

        ctx.close();
        assert_eq!(ctx.key, [0u8; KEY_SIZE]);

        let mut msg = Message::text("late");
        assert!(matches!(ctx.sign(&mut msg), Err(BridgeError::SessionClosed)));
        assert!(matches!(ctx.verify(&msg), Err(BridgeError::SessionClosed)));
    }

    #[test]
    fn device_ids_are_unique_hex() {
        let a = generate_device_id();
        let b = generate_device_id();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }
}
