//! Session configuration.

use collab_core::{CodecError, FrameCodec, Presence, RoomId};
use std::time::Duration;

/// Interval of the durable-state flush timer.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Lifetime of presence entries without a refresh.
pub const DEFAULT_PRESENCE_TTL: Duration = Duration::from_secs(30);

/// Where frames are encrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encryption {
    /// End-to-end: frames are sealed with the room key before posting.
    #[default]
    Sealed,
    /// Plain JSON envelopes, for relays that terminate encryption themselves.
    Plain,
}

impl Encryption {
    pub fn codec(self, room: &RoomId) -> Result<FrameCodec, CodecError> {
        match self {
            Encryption::Sealed => FrameCodec::sealed(room),
            Encryption::Plain => Ok(FrameCodec::Plain),
        }
    }
}

/// Reopen policy after the push stream ends.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
        }
    }
}

/// Delay before reconnect attempt number `attempt` (1-based).
pub fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let delay_secs = config.initial_delay.as_secs_f64()
        * config.backoff_factor.powi(attempt.saturating_sub(1) as i32);

    Duration::from_secs_f64(delay_secs.min(config.max_delay.as_secs_f64()))
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub room: RoomId,
    pub encryption: Encryption,
    pub flush_interval: Duration,
    pub presence_ttl: Duration,
    pub reconnect: ReconnectConfig,
}

impl SessionConfig {
    pub fn new(room: RoomId) -> Self {
        Self {
            room,
            encryption: Encryption::default(),
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            presence_ttl: DEFAULT_PRESENCE_TTL,
            reconnect: ReconnectConfig::default(),
        }
    }

    /// Config for the room derived from a resource key.
    pub fn for_resource(resource_key: &str) -> Self {
        Self::new(RoomId::derive(resource_key))
    }

    pub fn with_encryption(mut self, encryption: Encryption) -> Self {
        self.encryption = encryption;
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn with_presence_ttl(mut self, ttl: Duration) -> Self {
        self.presence_ttl = ttl;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Presence stores for `identity` using the configured TTL.
    pub fn presence(&self, identity: impl Into<String>) -> Presence {
        Presence::new(identity, self.presence_ttl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::for_resource("pads/a");
        assert_eq!(config.flush_interval, Duration::from_secs(5));
        assert_eq!(config.presence_ttl, Duration::from_secs(30));
        assert_eq!(config.encryption, Encryption::Sealed);
        assert_eq!(config.room, RoomId::derive("pads/a"));
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let config = ReconnectConfig::default();
        assert_eq!(calculate_backoff(1, &config), Duration::from_secs(1));
        assert_eq!(calculate_backoff(2, &config), Duration::from_secs(2));
        assert_eq!(calculate_backoff(4, &config), Duration::from_secs(8));
        assert_eq!(calculate_backoff(20, &config), Duration::from_secs(30));
    }

    #[test]
    fn test_encryption_codec() {
        let room = RoomId::new("r").unwrap();
        assert!(Encryption::Sealed.codec(&room).unwrap().is_sealed());
        assert!(!Encryption::Plain.codec(&room).unwrap().is_sealed());
    }
}
