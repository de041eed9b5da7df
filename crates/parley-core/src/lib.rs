//! parley-core: Shared protocol library for the parley chat relay.
//!
//! Provides the JSON envelope model, length-prefixed framing, the error
//! taxonomy shared by server and client, and the challenge-response helpers
//! (password secrets, challenges, HMAC digests).

pub mod auth;
pub mod codec;
pub mod envelope;
pub mod error;

// Re-export commonly used items at crate root.
pub use auth::{
    compute_digest, derive_password_secret, encode_digest, generate_challenge, verify_digest,
};
pub use codec::{frame_encode, json_decode, FrameDecoder, DEFAULT_MAX_FRAME_LEN};
pub use envelope::{Action, Envelope, ResponseCode};
pub use error::{ParleyError, ParleyResult};
