//! Wire-level protocol constants shared by the UDP and TCP transports.

/// Number of bytes in the protocol version tag.
pub const VERSION_BYTES: usize = 4;

/// Protocol version stamped on every UDP packet and TCP handshake.
pub const PROTOCOL_VERSION: [u8; VERSION_BYTES] = [0, 1, 0, 0];

/// Length of an HMAC-MD5 digest.
pub const DIGEST_LENGTH: usize = 16;

/// Digest filler used when no authentication key is configured.
pub const UNAUTHENTICATED_DIGEST: [u8; DIGEST_LENGTH] = [b'0'; DIGEST_LENGTH];

/// Offset of the payload inside a UDP packet.
pub const UDP_DATA_OFFSET: usize = VERSION_BYTES + DIGEST_LENGTH;

/// Length of the random challenge sent by an accepting TCP endpoint.
pub const NONCE_LENGTH: usize = 20;

/// Challenge tag announcing a keyed (HMAC) handshake.
pub const KEY_CHALLENGE: &[u8; 4] = b"#KY#";

/// Challenge tag announcing a version-only handshake.
pub const VER_CHALLENGE: &[u8; 4] = b"#VR#";

/// Handshake accepted.
pub const WELCOME: &[u8] = b"#WELCOME#";

/// Handshake rejected.
pub const FAILURE: &[u8] = b"#FAILURE#";
