//! Time-ordered 16-byte record identifiers.

use std::{
    convert::TryFrom,
    fmt,
    str::FromStr,
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

pub use hex::FromHexError;
use serde::{Deserialize, Serialize};

static LAST_MILLIS: AtomicU64 = AtomicU64::new(0);

/// 128-bit, lexicographically time-ordered identifier for a record.
///
/// The first 6 bytes are a millisecond Unix timestamp (big-endian),
/// the remaining 10 bytes are random. Two `Gid`s minted in the same
/// process within the same millisecond still sort correctly relative
/// to each other: the process-wide millisecond counter is bumped by
/// one whenever it would otherwise repeat, rather than relying on a
/// random tie-break.
#[derive(Default, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Gid([u8; 16]);

impl Gid {
    /// Mint a fresh, time-ordered identifier.
    pub fn new() -> Gid {
        let millis = next_millis();
        let mut bytes = [0u8; 16];
        bytes[..6].copy_from_slice(&millis.to_be_bytes()[2..]);
        getrandom::getrandom(&mut bytes[6..]).expect("system RNG unavailable");
        Gid(bytes)
    }

    pub fn from_bytes(bytes: impl AsRef<[u8]>) -> Gid {
        let mut id = Gid::default();
        id.0.copy_from_slice(bytes.as_ref());
        id
    }
}

/// Wall-clock millisecond, bumped past its previous value if time
/// hasn't visibly advanced since the last call (clock granularity or
/// back-to-back allocation within the same tick).
fn next_millis() -> u64 {
    let wall_clock = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as u64;

    let mut stamped = 0;
    LAST_MILLIS
        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |last| {
            stamped = wall_clock.max(last + 1);
            Some(stamped)
        })
        .unwrap();
    stamped
}

impl AsRef<[u8]> for Gid {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl TryFrom<&str> for Gid {
    type Error = FromHexError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        hex::decode(value).map(Gid::from_bytes)
    }
}

impl FromStr for Gid {
    type Err = FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Gid::try_from(s)
    }
}

impl fmt::Display for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_hex() {
        let id = Gid::new();
        let text = id.to_string();
        let parsed = Gid::try_from(text.as_str()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn is_monotonic_for_rapid_allocation() {
        let mut prev = Gid::new();
        for _ in 0..1000 {
            let next = Gid::new();
            assert!(next > prev, "{:?} should sort after {:?}", next, prev);
            prev = next;
        }
    }

    #[test]
    fn byte_equality_is_value_equality() {
        let id = Gid::new();
        let copy = Gid::from_bytes(id.as_ref());
        assert_eq!(id, copy);
    }
}
