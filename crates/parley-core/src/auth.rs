//! Challenge-response helpers shared by server and client.
//!
//! The directory stores a password secret per user: PBKDF2-HMAC-SHA512 of
//! the password, salted with the lower-cased username, hex encoded. At
//! login the server issues a random hex challenge and both sides compute
//! `HMAC-SHA256(secret, challenge)`; the client sends its digest back as
//! standard base64.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::Rng;
use ring::{hmac, pbkdf2};
use std::num::NonZeroU32;

/// PBKDF2 rounds for password secrets.
const PBKDF2_ITERATIONS: NonZeroU32 = match NonZeroU32::new(10_000) {
    Some(n) => n,
    None => unreachable!(),
};

/// Derived key length (SHA-512 output).
const SECRET_LEN: usize = 64;

/// Random bytes per challenge, before hex encoding.
const CHALLENGE_LEN: usize = 64;

/// Derive the stored password secret for `username`.
pub fn derive_password_secret(username: &str, password: &str) -> String {
    let salt = username.to_lowercase();
    let mut out = [0u8; SECRET_LEN];
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA512,
        PBKDF2_ITERATIONS,
        salt.as_bytes(),
        password.as_bytes(),
        &mut out,
    );
    hex::encode(out)
}

/// Generate a fresh login challenge (hex text).
pub fn generate_challenge() -> String {
    let mut bytes = [0u8; CHALLENGE_LEN];
    rand::thread_rng().fill(&mut bytes[..]);
    hex::encode(bytes)
}

/// HMAC-SHA256 of `challenge` keyed with `secret`.
pub fn compute_digest(secret: &[u8], challenge: &str) -> Vec<u8> {
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    hmac::sign(&key, challenge.as_bytes()).as_ref().to_vec()
}

/// Wire form of a digest.
pub fn encode_digest(digest: &[u8]) -> String {
    STANDARD.encode(digest)
}

/// Check a client's wire digest against the expected one in constant time.
///
/// Undecodable input is treated as a mismatch.
pub fn verify_digest(secret: &[u8], challenge: &str, wire_digest: &str) -> bool {
    let Ok(client_digest) = STANDARD.decode(wire_digest.trim()) else {
        return false;
    };
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    hmac::verify(&key, challenge.as_bytes(), &client_digest).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_is_deterministic_and_case_insensitive_in_name() {
        let a = derive_password_secret("Alice", "hunter2");
        let b = derive_password_secret("alice", "hunter2");
        assert_eq!(a, b);
        assert_eq!(a.len(), SECRET_LEN * 2);
        assert_ne!(a, derive_password_secret("alice", "hunter3"));
    }

    #[test]
    fn challenges_are_unique_hex() {
        let c1 = generate_challenge();
        let c2 = generate_challenge();
        assert_eq!(c1.len(), CHALLENGE_LEN * 2);
        assert!(c1.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(c1, c2);
    }

    #[test]
    fn matching_digest_verifies() {
        let secret = derive_password_secret("bob", "pw");
        let challenge = generate_challenge();
        let wire = encode_digest(&compute_digest(secret.as_bytes(), &challenge));
        assert!(verify_digest(secret.as_bytes(), &challenge, &wire));
    }

    #[test]
    fn wrong_password_fails() {
        let secret = derive_password_secret("bob", "pw");
        let other = derive_password_secret("bob", "not-pw");
        let challenge = generate_challenge();
        let wire = encode_digest(&compute_digest(other.as_bytes(), &challenge));
        assert!(!verify_digest(secret.as_bytes(), &challenge, &wire));
    }

    #[test]
    fn wrong_challenge_fails() {
        let secret = derive_password_secret("bob", "pw");
        let wire = encode_digest(&compute_digest(secret.as_bytes(), "aaaa"));
        assert!(!verify_digest(secret.as_bytes(), "bbbb", &wire));
    }

    #[test]
    fn garbage_digest_fails() {
        let secret = derive_password_secret("bob", "pw");
        assert!(!verify_digest(secret.as_bytes(), "aaaa", "%%% not base64"));
        assert!(!verify_digest(secret.as_bytes(), "aaaa", ""));
    }
}
