//! Engine configuration.

use crate::{TableId, DEFAULT_SIGNALING};
use std::env;
use std::time::Duration;

/// Records written to the document per bootstrap transaction.
pub const DEFAULT_BATCH_SIZE: usize = 50;

/// Quiet period after the last remote change before reporting `synced`.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(2);

/// Minimum spacing of sync-event notifications per table.
pub const DEFAULT_EVENT_THROTTLE: Duration = Duration::from_secs(1);

/// How the engine retries after a provider loses sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Growth factor applied per attempt
    pub multiplier: u32,
    /// Upper bound of any single delay
    pub max_delay: Duration,
    /// Retries before giving up (`None` = retry forever)
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            multiplier: 2,
            max_delay: Duration::from_secs(30),
            max_attempts: Some(10),
        }
    }
}

impl ReconnectPolicy {
    /// Same delay for every attempt, never giving up.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            multiplier: 1,
            max_delay: delay,
            max_attempts: None,
        }
    }

    /// Delay before retry number `attempt` (1-based), or `None` when the
    /// attempt budget is spent.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if let Some(max) = self.max_attempts {
            if attempt > max {
                return None;
            }
        }
        let factor = self.multiplier.saturating_pow(attempt.saturating_sub(1));
        Some(self.initial_delay.saturating_mul(factor).min(self.max_delay))
    }
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub batch_size: usize,
    pub settle_delay: Duration,
    pub event_throttle: Duration,
    pub reconnect: ReconnectPolicy,
    /// Signaling endpoints used when the session parameters name none
    pub signaling: Vec<String>,
    /// Tables bootstrapped and observed per session
    pub tables: Vec<TableId>,
    /// Tear down a session left behind by an earlier engine in this process
    pub reinit_guard: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            settle_delay: DEFAULT_SETTLE_DELAY,
            event_throttle: DEFAULT_EVENT_THROTTLE,
            reconnect: ReconnectPolicy::default(),
            signaling: vec![DEFAULT_SIGNALING.to_string()],
            tables: TableId::ALL.to_vec(),
            reinit_guard: cfg!(debug_assertions),
        }
    }
}

impl SyncConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn with_event_throttle(mut self, window: Duration) -> Self {
        self.event_throttle = window;
        self
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn with_signaling(mut self, endpoints: Vec<String>) -> Self {
        self.signaling = endpoints;
        self
    }

    pub fn with_tables(mut self, tables: Vec<TableId>) -> Self {
        self.tables = tables;
        self
    }

    pub fn with_reinit_guard(mut self, enabled: bool) -> Self {
        self.reinit_guard = enabled;
        self
    }

    /// Load configuration from environment variables, falling back to
    /// defaults for unset ones.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(size) = parse::<usize>(&lookup, "TETHER_BATCH_SIZE")? {
            if size == 0 {
                return Err(ConfigError::Invalid {
                    key: "TETHER_BATCH_SIZE",
                    value: size.to_string(),
                });
            }
            config.batch_size = size;
        }
        if let Some(ms) = parse::<u64>(&lookup, "TETHER_SETTLE_MS")? {
            config.settle_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64>(&lookup, "TETHER_THROTTLE_MS")? {
            config.event_throttle = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64>(&lookup, "TETHER_RECONNECT_INITIAL_MS")? {
            config.reconnect.initial_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64>(&lookup, "TETHER_RECONNECT_MAX_MS")? {
            config.reconnect.max_delay = Duration::from_millis(ms);
        }
        if let Some(attempts) = parse::<u32>(&lookup, "TETHER_RECONNECT_ATTEMPTS")? {
            config.reconnect.max_attempts = (attempts > 0).then_some(attempts);
        }
        if let Some(endpoints) = lookup("TETHER_SIGNALING") {
            config.signaling = endpoints
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(enabled) = parse::<bool>(&lookup, "TETHER_REINIT_GUARD")? {
            config.reinit_guard = enabled;
        }

        Ok(config)
    }
}

fn parse<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value }),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.settle_delay, Duration::from_secs(2));
        assert_eq!(config.event_throttle, Duration::from_secs(1));
        assert_eq!(config.tables.len(), 5);
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(1), Some(Duration::from_secs(1)));
        assert_eq!(policy.delay_for(2), Some(Duration::from_secs(2)));
        assert_eq!(policy.delay_for(3), Some(Duration::from_secs(4)));
        assert_eq!(policy.delay_for(9), Some(Duration::from_secs(30)));
        assert_eq!(policy.delay_for(10), Some(Duration::from_secs(30)));
        assert_eq!(policy.delay_for(11), None);
    }

    #[test]
    fn fixed_policy_never_gives_up() {
        let policy = ReconnectPolicy::fixed(Duration::from_secs(1));
        assert_eq!(policy.delay_for(1_000), Some(Duration::from_secs(1)));
    }

    #[test]
    fn from_lookup_overrides() {
        let config = SyncConfig::from_lookup(lookup(&[
            ("TETHER_BATCH_SIZE", "10"),
            ("TETHER_SETTLE_MS", "500"),
            ("TETHER_RECONNECT_ATTEMPTS", "0"),
            ("TETHER_SIGNALING", "wss://a.example, wss://b.example,"),
            ("TETHER_REINIT_GUARD", "false"),
        ]))
        .unwrap();

        assert_eq!(config.batch_size, 10);
        assert_eq!(config.settle_delay, Duration::from_millis(500));
        assert_eq!(config.reconnect.max_attempts, None);
        assert_eq!(config.signaling, vec!["wss://a.example", "wss://b.example"]);
        assert!(!config.reinit_guard);
    }

    #[test]
    fn from_lookup_rejects_garbage() {
        let err = SyncConfig::from_lookup(lookup(&[("TETHER_THROTTLE_MS", "soon")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                key: "TETHER_THROTTLE_MS",
                value: "soon".into()
            }
        );

        let err = SyncConfig::from_lookup(lookup(&[("TETHER_BATCH_SIZE", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "TETHER_BATCH_SIZE", .. }));
    }
}
