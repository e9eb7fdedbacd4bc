//! Envelope Codec
//!
//! Envelopes travel as bincode over their serde derives. The transports
//! treat the encoded bytes as opaque payload; only the router encodes and
//! decodes.

use crate::{Result, TransportError};
use types::Envelope;

/// Serialize an envelope for the wire.
pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>> {
    Ok(bincode::serialize(envelope)?)
}

/// Deserialize an envelope received from a transport.
pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope> {
    if bytes.is_empty() {
        return Err(TransportError::protocol("empty envelope"));
    }
    Ok(bincode::deserialize(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use types::{Command, Payload, ProcessId, Term};

    #[test]
    fn test_envelope_roundtrip() {
        let src = ProcessId::new("Ping", None, "localhost", vec![Some(10001), Some(10002)]);
        let dest =
            ProcessId::new("Pong", Some("pong".into()), "localhost", vec![None, Some(10003)]);
        let env = Envelope::new(
            Some(src),
            Some(dest),
            Payload::Command(Command::Message {
                clock: Some(4),
                body: Term::tuple(["Ping".into(), 1.into()]),
            }),
        );

        let bytes = encode_envelope(&env).unwrap();
        assert_eq!(decode_envelope(&bytes).unwrap(), env);
    }

    #[test]
    fn test_garbage_is_protocol_error() {
        assert!(matches!(
            decode_envelope(&[]),
            Err(TransportError::Protocol { .. })
        ));
        assert!(matches!(
            decode_envelope(&[0xff; 3]),
            Err(TransportError::Protocol { .. })
        ));
    }
}
