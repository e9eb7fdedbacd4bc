//! Network Protocol Infrastructure
//!
//! Envelope serialization and the HMAC primitives shared by the UDP packet
//! format and the TCP connection handshake.

pub mod envelope;
pub mod security;

// Re-export commonly used types
pub use envelope::{decode_envelope, encode_envelope};
pub use security::{generate_nonce, Authenticator};
