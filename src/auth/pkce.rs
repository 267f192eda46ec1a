//! Random material for the authorization-code flow
//!
//! PKCE (RFC 7636, S256 method) verifier/challenge pairs and the opaque
//! `state` value echoed back by the identity provider.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::Rng;
use sha2::{Digest, Sha256};

/// Unreserved URI characters allowed in a code verifier
const VERIFIER_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-._~";

const STATE_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

const VERIFIER_LENGTH: usize = 64;
const STATE_LENGTH: usize = 32;

fn random_string(charset: &[u8], len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| charset[rng.gen_range(0..charset.len())] as char)
        .collect()
}

/// BASE64URL(SHA256(verifier))
pub fn challenge_for(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// Random `state` value for CSRF protection
pub fn generate_state() -> String {
    random_string(STATE_CHARSET, STATE_LENGTH)
}

/// One-time PKCE verifier and its derived challenge
#[derive(Debug, Clone)]
pub struct PkcePair {
    pub verifier: String,
    pub challenge: String,
}

impl PkcePair {
    pub fn generate() -> Self {
        let verifier = random_string(VERIFIER_CHARSET, VERIFIER_LENGTH);
        let challenge = challenge_for(&verifier);
        Self { verifier, challenge }
    }
}
