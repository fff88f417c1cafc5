//! Client configuration.

use crate::{ClientId, SpaceId};
use std::time::Duration;

/// Background pull interval.
pub const DEFAULT_PULL_INTERVAL: Duration = Duration::from_secs(20);

/// Minimum spacing between consecutive pulls or pushes.
pub const DEFAULT_RECONCILE_DELAY: Duration = Duration::from_millis(50);

/// Configuration for a [`Client`](crate::Client).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Space to sync. Derived from the mutator names when unset.
    pub space_id: Option<SpaceId>,
    /// Client identity. A random UUID when unset.
    pub client_id: Option<ClientId>,
    /// Interval of the background pull timer.
    pub pull_interval: Duration,
    /// Spacing of a trailing pull after the previous one started.
    pub pull_delay: Duration,
    /// Spacing of a trailing push after the previous one started.
    pub push_delay: Duration,
    /// Whether the background pull timer runs at all.
    pub polling: bool,
}

impl ClientConfig {
    /// Creates a configuration with defaults.
    pub fn new() -> Self {
        Self {
            space_id: None,
            client_id: None,
            pull_interval: DEFAULT_PULL_INTERVAL,
            pull_delay: DEFAULT_RECONCILE_DELAY,
            push_delay: DEFAULT_RECONCILE_DELAY,
            polling: true,
        }
    }

    /// Sets the space id.
    pub fn with_space_id(mut self, space_id: impl Into<SpaceId>) -> Self {
        self.space_id = Some(space_id.into());
        self
    }

    /// Sets the client id.
    pub fn with_client_id(mut self, client_id: impl Into<ClientId>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Sets the background pull interval.
    pub fn with_pull_interval(mut self, interval: Duration) -> Self {
        self.pull_interval = interval;
        self
    }

    /// Sets the pull throttle delay.
    pub fn with_pull_delay(mut self, delay: Duration) -> Self {
        self.pull_delay = delay;
        self
    }

    /// Sets the push throttle delay.
    pub fn with_push_delay(mut self, delay: Duration) -> Self {
        self.push_delay = delay;
        self
    }

    /// Enables or disables the background pull timer.
    pub fn with_polling(mut self, polling: bool) -> Self {
        self.polling = polling;
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.pull_interval, Duration::from_secs(20));
        assert_eq!(config.pull_delay, Duration::from_millis(50));
        assert_eq!(config.push_delay, Duration::from_millis(50));
        assert!(config.polling);
        assert!(config.space_id.is_none());
    }

    #[test]
    fn builder() {
        let config = ClientConfig::new()
            .with_space_id("todos")
            .with_client_id("c1")
            .with_pull_interval(Duration::from_secs(1))
            .with_polling(false);
        assert_eq!(config.space_id.as_deref(), Some("todos"));
        assert_eq!(config.client_id.as_deref(), Some("c1"));
        assert_eq!(config.pull_interval, Duration::from_secs(1));
        assert!(!config.polling);
    }
}
