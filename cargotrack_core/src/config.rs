//! Session configuration.
//!
//! Every knob has a production default; the serialized form expresses
//! durations in milliseconds so a JSON override file stays readable:
//!
//! ```json
//! { "poll_interval": 10000, "backoff": { "base": 500, "max_delay": 30000 } }
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Reconnect policy for the push channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay before the first retry (default: 1s)
    #[serde(with = "millis")]
    pub base: Duration,

    /// Upper bound for any retry delay (default: 30s)
    #[serde(with = "millis")]
    pub max_delay: Duration,

    /// Bound on a single handshake attempt (default: 10s)
    #[serde(with = "millis")]
    pub connect_timeout: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl BackoffConfig {
    /// Delay before retry number `retry_count` (1-based).
    ///
    /// `min(base * 2^(n-1), max_delay)`; zero for `n == 0`.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        if retry_count == 0 {
            return Duration::ZERO;
        }
        let exponent = (retry_count - 1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

/// Configuration for one tracking session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Push channel reconnect policy
    pub backoff: BackoffConfig,

    /// Periodic poll fallback for the selected entity (default: 15s)
    #[serde(with = "millis")]
    pub poll_interval: Duration,

    /// Bound on a single poll request (default: 8s)
    #[serde(with = "millis")]
    pub poll_timeout: Duration,

    /// How often the session clock ticks for staleness and polling (default: 1s)
    #[serde(with = "millis")]
    pub tick_interval: Duration,

    /// Age after which a Ready view turns Stale (default: 60s, 2x the expected push interval)
    #[serde(with = "millis")]
    pub freshness_threshold: Duration,

    /// Maximum location samples kept per entity (default: 500)
    pub max_history: usize,

    /// How long delivered/cancelled snapshots are kept once unreferenced (default: 5min)
    #[serde(with = "millis")]
    pub terminal_grace: Duration,

    /// Padding added around map bounds, in degrees (default: 0.01 ~ 1km)
    pub bounds_padding: f64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            poll_interval: Duration::from_secs(15),
            poll_timeout: Duration::from_secs(8),
            tick_interval: Duration::from_secs(1),
            freshness_threshold: Duration::from_secs(60),
            max_history: 500,
            terminal_grace: Duration::from_secs(300),
            bounds_padding: 0.01,
        }
    }
}

impl SessionConfig {
    /// Parses a JSON override; missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
