//! Node configuration.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use repliq_source::PersistedStore;
use repliq_transport::Endpoint;

// ---------------------------------------------------------------------------
// ReconnectConfig
// ---------------------------------------------------------------------------

/// Backoff for re-establishing outbound links.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound of the doubling delay.
    pub max_delay: Duration,
    /// Random extra delay (0 to this value) added to every retry so nodes
    /// dropped at the same moment do not reconnect in lockstep.
    pub jitter: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            jitter: Duration::from_millis(50),
        }
    }
}

impl ReconnectConfig {
    /// Clamps values into their usable ranges.
    pub fn validated(mut self) -> Self {
        if self.initial_delay.is_zero() {
            self.initial_delay = Duration::from_millis(1);
        }
        if self.max_delay < self.initial_delay {
            tracing::warn!(
                max = ?self.max_delay,
                initial = ?self.initial_delay,
                "max_delay below initial_delay; raising it"
            );
            self.max_delay = self.initial_delay;
        }
        self
    }

    /// Delay before retry number `attempt` (0-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(16);
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Delay before retry number `attempt`, jitter included.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    }
}

// ---------------------------------------------------------------------------
// NodeConfig
// ---------------------------------------------------------------------------

/// Configuration of a [`Node`](crate::Node).
#[derive(Clone)]
pub struct NodeConfig {
    /// Where the registry is hosted. `None` disables discovery.
    pub registry_url: Option<Endpoint>,

    pub reconnect: ReconnectConfig,

    /// Capacity of the event channels handed to subscribers. Slow
    /// subscribers skip events once it is exceeded.
    pub channel_capacity: usize,

    /// Where static replicas keep their last-known property values.
    pub persisted_store: Option<Arc<dyn PersistedStore>>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            registry_url: None,
            reconnect: ReconnectConfig::default(),
            channel_capacity: 256,
            persisted_store: None,
        }
    }
}

impl NodeConfig {
    /// Clamps values into their usable ranges.
    pub fn validated(mut self) -> Self {
        self.reconnect = self.reconnect.validated();
        if self.channel_capacity == 0 {
            tracing::warn!("channel_capacity of 0 raised to 1");
            self.channel_capacity = 1;
        }
        self
    }
}

impl fmt::Debug for NodeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeConfig")
            .field("registry_url", &self.registry_url)
            .field("reconnect", &self.reconnect)
            .field("channel_capacity", &self.channel_capacity)
            .field("persisted_store", &self.persisted_store.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_delay_doubles_up_to_max() {
        let config = ReconnectConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(700),
            jitter: Duration::ZERO,
        };
        assert_eq!(config.base_delay(0), Duration::from_millis(100));
        assert_eq!(config.base_delay(1), Duration::from_millis(200));
        assert_eq!(config.base_delay(2), Duration::from_millis(400));
        assert_eq!(config.base_delay(3), Duration::from_millis(700));
        assert_eq!(config.base_delay(40), Duration::from_millis(700));
    }

    #[test]
    fn test_delay_adds_bounded_jitter() {
        let config = ReconnectConfig {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(10),
            jitter: Duration::from_millis(5),
        };
        for _ in 0..50 {
            let d = config.delay(3);
            assert!(d >= Duration::from_millis(10) && d <= Duration::from_millis(15));
        }
    }

    #[test]
    fn test_validated_fixes_inverted_bounds() {
        let config = NodeConfig {
            reconnect: ReconnectConfig {
                initial_delay: Duration::from_secs(2),
                max_delay: Duration::from_secs(1),
                jitter: Duration::ZERO,
            },
            channel_capacity: 0,
            ..NodeConfig::default()
        }
        .validated();
        assert_eq!(config.reconnect.max_delay, Duration::from_secs(2));
        assert_eq!(config.channel_capacity, 1);
    }
}
