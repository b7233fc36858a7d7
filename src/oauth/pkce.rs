//! PKCE (RFC 7636) verifier/challenge generation and the flow's random
//! state values.
//!
//! The verifier is server-side only; the provider only ever sees its S256
//! digest.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Entropy of the code verifier in bytes.
const VERIFIER_BYTES: usize = 32;

/// Entropy of the state value in bytes.
const STATE_BYTES: usize = 24;

/// Generates a cryptographically random PKCE code verifier.
pub fn generate_verifier() -> String {
    let mut bytes = [0u8; VERIFIER_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Derives the S256 code challenge: base64url(SHA-256(verifier)), no padding.
pub fn challenge(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

/// Generates the random CSRF state value carried through the flow.
pub fn generate_state() -> String {
    let mut bytes = [0u8; STATE_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
