//! Channel capability sets
//!
//! A send names the capabilities it needs; each transport declares the
//! capabilities it cannot provide. The two masks must not overlap for the
//! transport to be eligible.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Ordering, reliability, locality and broadcast properties of a channel.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct ChannelCaps: u8 {
        /// Messages between an ordered pair of endpoints arrive in send order.
        const FIFO = 1 << 0;
        /// Messages are not silently lost.
        const RELIABLE = 1 << 1;
        /// Endpoints may live on different hosts.
        const INTERHOST = 1 << 2;
        /// One send may reach several receivers.
        const BROADCAST = 1 << 3;

        const RELIABLE_FIFO = Self::FIFO.bits() | Self::RELIABLE.bits();
    }
}

impl ChannelCaps {
    /// Build a capability set from flag names such as `"fifo"` or `"RELIABLE"`.
    ///
    /// Unknown names are reported back so configuration errors are visible.
    pub fn from_names<I, S>(names: I) -> Result<Self, String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut caps = ChannelCaps::empty();
        for name in names {
            let upper = name.as_ref().trim().to_ascii_uppercase();
            match ChannelCaps::from_name(&upper) {
                Some(flag) => caps |= flag,
                None => return Err(name.as_ref().to_string()),
            }
        }
        Ok(caps)
    }

    /// True when a transport with this *unsupported* mask can serve `requested`.
    pub fn admits(self, requested: ChannelCaps) -> bool {
        (self & requested).is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_case_insensitive() {
        let caps = ChannelCaps::from_names(["fifo", "Reliable"]).unwrap();
        assert_eq!(caps, ChannelCaps::RELIABLE_FIFO);
    }

    #[test]
    fn unknown_name_is_reported() {
        assert_eq!(
            ChannelCaps::from_names(["fifo", "ordered"]),
            Err("ordered".to_string())
        );
    }

    #[test]
    fn admits_checks_overlap_only() {
        let udp_unsupported = ChannelCaps::all() - ChannelCaps::INTERHOST;
        assert!(udp_unsupported.admits(ChannelCaps::INTERHOST));
        assert!(udp_unsupported.admits(ChannelCaps::empty()));
        assert!(!udp_unsupported.admits(ChannelCaps::FIFO));
    }
}
