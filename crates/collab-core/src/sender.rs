//! SenderId: Per-session identifier stamped on every outgoing envelope.
//!
//! Wraps a u64 internally but displays as a 16-character hex string.
//! It exists only so a channel can recognise (and drop) its own messages when
//! the broadcast transport echoes them back; it carries no authority.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SenderIdError {
    #[error("Invalid sender ID format: expected 16 hex chars")]
    InvalidFormat,
    #[error("Invalid hex: {0}")]
    InvalidHex(#[from] std::num::ParseIntError),
}

/// Identifier of one client session.
///
/// # Examples
/// ```
/// use collab_core::SenderId;
///
/// let sender = SenderId::generate();
/// let parsed: SenderId = sender.to_string().parse().unwrap();
/// assert_eq!(sender, parsed);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SenderId(u64);

impl SenderId {
    /// Generate a new random sender ID. Never returns zero.
    pub fn generate() -> Self {
        use rand::Rng;
        loop {
            let id: u64 = rand::rng().random();
            if id != 0 {
                return Self(id);
            }
        }
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Display for SenderId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for SenderId {
    type Err = SenderIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() == 16 && s.chars().all(|c| c.is_ascii_hexdigit()) {
            let id = u64::from_str_radix(&s.to_ascii_lowercase(), 16)?;
            return Ok(Self(id));
        }
        Err(SenderIdError::InvalidFormat)
    }
}

impl From<u64> for SenderId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

// Serialized as the hex string so it reads the same in logs and on the wire
impl serde::Serialize for SenderId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for SenderId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
