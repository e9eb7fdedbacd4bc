//! Authentication Primitives
//!
//! HMAC-MD5 digests keyed with the shared runtime key, used both to sign
//! UDP packets and to answer TCP connection challenges.

use crate::{Result, TransportError};
use hmac::{Hmac, Mac};
use md5::Md5;
use rand::RngCore;
use std::fmt;
use types::{DIGEST_LENGTH, NONCE_LENGTH};

type HmacMd5 = Hmac<Md5>;

/// Keyed digest calculator.
///
/// The key schedule is computed once; every digest clones the prepared
/// state.
#[derive(Clone)]
pub struct Authenticator {
    mac: HmacMd5,
}

impl Authenticator {
    pub fn new(key: &[u8]) -> Result<Self> {
        let mac = HmacMd5::new_from_slice(key).map_err(|_| {
            TransportError::configuration("invalid authentication key", Some("authkey"))
        })?;
        Ok(Self { mac })
    }

    /// HMAC of `data` under this key.
    pub fn digest(&self, data: &[u8]) -> [u8; DIGEST_LENGTH] {
        let mut mac = self.mac.clone();
        mac.update(data);
        let mut out = [0u8; DIGEST_LENGTH];
        out.copy_from_slice(&mac.finalize().into_bytes());
        out
    }

    /// Constant-time check of `digest` against the HMAC of `data`.
    pub fn verify(&self, data: &[u8], digest: &[u8]) -> bool {
        let mut mac = self.mac.clone();
        mac.update(data);
        mac.verify_slice(digest).is_ok()
    }
}

impl fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Authenticator { .. }")
    }
}

/// Fresh random challenge for a TCP handshake.
pub fn generate_nonce() -> [u8; NONCE_LENGTH] {
    let mut nonce = [0u8; NONCE_LENGTH];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}
