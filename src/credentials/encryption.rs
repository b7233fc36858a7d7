//! AES-256-GCM envelope codec for credential payloads.
//!
//! The write path is fixed: hash the configured key material into a 256-bit
//! key, encrypt with a fresh random 96-bit nonce, serialize `{"iv", "data"}`
//! as JSON. The read path is permanently polymorphic: the storage format
//! changed three times without a re-encryption migration (a secret is only
//! rewritten on its next refresh), so the decoder must keep reading every
//! shape ever written.
//!
//! Shape detection is an ordered list of pure detector functions. The first
//! structural match wins and is decrypted exactly once; an authentication
//! failure at that point is a hard error, never a signal to try the next
//! detector. Only structural ambiguity is resolved by shape fallback.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{
    engine::general_purpose::{STANDARD as BASE64, URL_SAFE as BASE64_URL},
    Engine,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Size of the AES-256 key in bytes.
const KEY_SIZE: usize = 32;

/// Size of the GCM nonce in bytes (96 bits).
const NONCE_SIZE: usize = 12;

/// Size of the GCM authentication tag in bytes.
const TAG_SIZE: usize = 16;

/// A structurally identified envelope: nonce plus ciphertext, independent of
/// the serialization it arrived in.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub nonce: [u8; NONCE_SIZE],
    pub ciphertext: Vec<u8>,
}

/// The JSON serialization written by the current generation.
#[derive(Serialize, Deserialize)]
struct EnvelopeJson {
    iv: String,
    data: String,
}

/// Derives the AES-256 key by hashing the configured key material.
///
/// The key material is an arbitrary operator-supplied secret string; hashing
/// normalizes it to exactly [`KEY_SIZE`] bytes.
pub fn derive_key(key_material: &str) -> [u8; KEY_SIZE] {
    let digest = Sha256::digest(key_material.as_bytes());
    digest.into()
}

/// Validates key material at startup.
pub fn validate_key_material(key_material: &str) -> Result<()> {
    if key_material.trim().is_empty() {
        return Err(Error::Configuration(
            "encryption key material must not be empty".to_string(),
        ));
    }
    Ok(())
}

fn cipher_for(key_material: &str) -> Result<Aes256Gcm> {
    let key = derive_key(key_material);
    Aes256Gcm::new_from_slice(&key)
        .map_err(|e| Error::Configuration(format!("failed to create cipher: {}", e)))
}

/// Encrypts plaintext into the current-generation envelope string.
///
/// Generates a fresh random nonce per call (never reused) and returns the
/// `{"iv", "data"}` JSON text. Callers may base64-wrap the whole string for
/// column storage; [`decrypt`] reads both forms.
pub fn encrypt(plaintext: &str, key_material: &str) -> Result<String> {
    let cipher = cipher_for(key_material)?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext.as_bytes())
        .map_err(|e| Error::Decryption(format!("encryption failed: {}", e)))?;

    let envelope = EnvelopeJson {
        iv: BASE64.encode(nonce),
        data: BASE64.encode(&ciphertext),
    };
    Ok(serde_json::to_string(&envelope)?)
}

/// Decrypts a stored envelope in any historically written shape.
///
/// Tries the shape detectors in their fixed order, short-circuits on the
/// first structural match, then performs exactly one AEAD decryption.
pub fn decrypt(stored: &str, key_material: &str) -> Result<String> {
    let envelope = detect_envelope(stored)
        .ok_or_else(|| Error::Decryption("no supported envelope shape matched".to_string()))?;
    open_envelope(&envelope, key_material)
}

/// Decrypts an envelope already materialized as a JSON value (the oldest
/// read path handed rows around as parsed JSON).
pub fn decrypt_value(stored: &Value, key_material: &str) -> Result<String> {
    // Shape 1: a native structure already exposing iv/data.
    if let Some(envelope) = envelope_from_value(stored) {
        return open_envelope(&envelope, key_material);
    }
    // A JSON string value carries any of the text shapes.
    if let Some(text) = stored.as_str() {
        return decrypt(text, key_material);
    }
    Err(Error::Decryption(
        "no supported envelope shape matched".to_string(),
    ))
}

/// Runs the ordered detector list over a stored text.
fn detect_envelope(stored: &str) -> Option<Envelope> {
    let detectors: [fn(&str) -> Option<Envelope>; 4] = [
        detect_json,
        detect_double_json,
        detect_base64_text,
        detect_packed,
    ];
    detectors.iter().find_map(|detect| detect(stored))
}

/// Shape 2: JSON text parsing directly to `{iv, data}`.
fn detect_json(stored: &str) -> Option<Envelope> {
    let value: Value = serde_json::from_str(stored).ok()?;
    envelope_from_value(&value)
}

/// Shape 3: JSON text parsing to a *string* which itself parses to
/// `{iv, data}` (double-encoded legacy rows).
fn detect_double_json(stored: &str) -> Option<Envelope> {
    let value: Value = serde_json::from_str(stored).ok()?;
    let inner = value.as_str()?;
    detect_json(inner)
}

/// Shape 4: base64 (standard or URL-safe, auto-repadded) wrapping of the
/// JSON text shapes.
fn detect_base64_text(stored: &str) -> Option<Envelope> {
    let bytes = decode_base64_any(stored)?;
    let text = String::from_utf8(bytes).ok()?;
    detect_json(&text).or_else(|| detect_double_json(&text))
}

/// Shape 5: packed binary (12-byte nonce followed by ciphertext), delivered
/// as base64 or as hex, optionally `\x`-prefixed the way a relational
/// database renders a binary column as text.
///
/// Hex is checked first: every hex string is also a valid base64 alphabet,
/// so decoding the other way around would hand garbage to the AEAD step.
fn detect_packed(stored: &str) -> Option<Envelope> {
    let bytes = decode_hex(stored).or_else(|| decode_base64_any(stored))?;
    envelope_from_packed(&bytes)
}

/// Builds an envelope from a parsed JSON value exposing `iv`/`data`.
fn envelope_from_value(value: &Value) -> Option<Envelope> {
    let obj = value.as_object()?;
    let iv = obj.get("iv")?.as_str()?;
    let data = obj.get("data")?.as_str()?;

    let nonce_bytes = decode_base64_any(iv)?;
    let nonce: [u8; NONCE_SIZE] = nonce_bytes.try_into().ok()?;
    let ciphertext = decode_base64_any(data)?;
    if ciphertext.len() < TAG_SIZE {
        return None;
    }
    Some(Envelope { nonce, ciphertext })
}

fn envelope_from_packed(bytes: &[u8]) -> Option<Envelope> {
    if bytes.len() < NONCE_SIZE + TAG_SIZE {
        return None;
    }
    let (nonce_bytes, ciphertext) = bytes.split_at(NONCE_SIZE);
    let nonce: [u8; NONCE_SIZE] = nonce_bytes.try_into().ok()?;
    Some(Envelope {
        nonce,
        ciphertext: ciphertext.to_vec(),
    })
}

/// Decodes standard or URL-safe base64, repadding to a multiple of four.
fn decode_base64_any(text: &str) -> Option<Vec<u8>> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    let unpadded = trimmed.trim_end_matches('=');
    let mut repadded = unpadded.to_string();
    while repadded.len() % 4 != 0 {
        repadded.push('=');
    }
    BASE64
        .decode(&repadded)
        .or_else(|_| BASE64_URL.decode(&repadded))
        .ok()
}

/// Decodes a hex string, accepting the `\x` prefix a database text rendering
/// of a binary column carries.
fn decode_hex(text: &str) -> Option<Vec<u8>> {
    let trimmed = text.trim();
    let digits = trimmed.strip_prefix("\\x").unwrap_or(trimmed);
    if digits.is_empty() || digits.len() % 2 != 0 {
        return None;
    }
    if !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    hex::decode(digits).ok()
}

/// The single AEAD attempt. A tag mismatch here means the key or the data is
/// wrong; it is a hard failure, not a shape-detection miss.
fn open_envelope(envelope: &Envelope, key_material: &str) -> Result<String> {
    let cipher = cipher_for(key_material)?;
    let nonce = Nonce::from_slice(&envelope.nonce);

    let plaintext = cipher
        .decrypt(nonce, envelope.ciphertext.as_ref())
        .map_err(|_| {
            Error::Decryption("authentication tag verification failed".to_string())
        })?;

    String::from_utf8(plaintext)
        .map_err(|_| Error::Decryption("decrypted payload is not valid UTF-8".to_string()))
}
