//! Connection configuration, loadable from TOML.
//!
//! All keys are optional; the defaults match the feed's documented
//! behaviour. Keys:
//!
//! ```toml
//! dump = false
//!
//! [network]
//! heartbeatPeriod = 10
//! heartbeatTimeout = 120
//! reestablishConnections = true
//!
//! [subscriptions]
//! disableLastEventStorage = true
//!
//! [logger]
//! level = "info"
//! ```

use crate::{FeedError, FeedResult};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedConfiguration {
    heartbeat_period: Duration,
    heartbeat_timeout: Duration,
    reestablish_connections: bool,
    disable_last_event_storage: bool,
    logger_level: log::LevelFilter,
    dump: bool,
    max_inbound_frame_size: usize,
}

impl Default for FeedConfiguration {
    fn default() -> Self {
        Self {
            heartbeat_period: Duration::from_secs(Self::DEFAULT_HEARTBEAT_PERIOD_SECS),
            heartbeat_timeout: Duration::from_secs(Self::DEFAULT_HEARTBEAT_TIMEOUT_SECS),
            reestablish_connections: true,
            disable_last_event_storage: true,
            logger_level: log::LevelFilter::Info,
            dump: false,
            max_inbound_frame_size: Self::DEFAULT_MAX_INBOUND_FRAME_SIZE,
        }
    }
}

impl FeedConfiguration {
    /// Default outbound heartbeat period in seconds.
    pub const DEFAULT_HEARTBEAT_PERIOD_SECS: u64 = 10;

    /// Default inbound silence tolerated before the connection is deemed
    /// dead, in seconds.
    pub const DEFAULT_HEARTBEAT_TIMEOUT_SECS: u64 = 120;

    /// Default cap on a single inbound frame. A frame above the cap is a
    /// fatal protocol error, not a growth request.
    pub const DEFAULT_MAX_INBOUND_FRAME_SIZE: usize = 16 * 1024 * 1024;

    /// Returns the outbound heartbeat period.
    pub fn heartbeat_period(&self) -> Duration {
        self.heartbeat_period
    }
    /// Sets the outbound heartbeat period.
    pub fn set_heartbeat_period(&mut self, period: Duration) {
        self.heartbeat_period = period;
    }
    /// Builder-method for setting the outbound heartbeat period.
    #[must_use]
    pub fn with_heartbeat_period(mut self, period: Duration) -> Self {
        self.heartbeat_period = period;
        self
    }

    /// Returns the inbound-silence limit.
    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_timeout
    }
    /// Sets the inbound-silence limit.
    pub fn set_heartbeat_timeout(&mut self, timeout: Duration) {
        self.heartbeat_timeout = timeout;
    }
    /// Builder-method for setting the inbound-silence limit.
    #[must_use]
    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    /// Returns whether dropped connections are re-established.
    pub fn reestablish_connections(&self) -> bool {
        self.reestablish_connections
    }
    /// Defines whether dropped connections are re-established.
    pub fn set_reestablish_connections(&mut self, enabled: bool) {
        self.reestablish_connections = enabled;
    }
    /// Builder-method for defining whether dropped connections are
    /// re-established.
    #[must_use]
    pub fn with_reestablish_connections(mut self, enabled: bool) -> Self {
        self.reestablish_connections = enabled;
        self
    }

    /// Returns whether the per-symbol last-event cache is disabled.
    pub fn disable_last_event_storage(&self) -> bool {
        self.disable_last_event_storage
    }
    /// Disables or enables the per-symbol last-event cache.
    pub fn set_disable_last_event_storage(&mut self, disabled: bool) {
        self.disable_last_event_storage = disabled;
    }
    /// Builder-method for the last-event cache switch.
    #[must_use]
    pub fn with_disable_last_event_storage(mut self, disabled: bool) -> Self {
        self.disable_last_event_storage = disabled;
        self
    }

    /// The minimum log level the embedding application is asked to emit.
    /// The crate logs through `log`; it never installs a logger itself.
    pub fn logger_level(&self) -> log::LevelFilter {
        self.logger_level
    }

    /// Returns the single-frame size cap.
    pub fn max_inbound_frame_size(&self) -> usize {
        self.max_inbound_frame_size
    }
    /// Sets the single-frame size cap.
    pub fn set_max_inbound_frame_size(&mut self, size: usize) {
        self.max_inbound_frame_size = size;
    }
    /// Builder-method for the single-frame size cap.
    #[must_use]
    pub fn with_max_inbound_frame_size(mut self, size: usize) -> Self {
        self.max_inbound_frame_size = size;
        self
    }

    /// Loads a configuration from a TOML string.
    pub fn from_toml_str(input: &str) -> FeedResult<Self> {
        let raw: RawConfig = toml::from_str(input)
            .map_err(|e| FeedError::Configuration(e.to_string()))?;
        Self::from_raw(raw)
    }

    /// Loads a configuration from a TOML file.
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> FeedResult<Self> {
        let input = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&input)
    }

    fn from_raw(raw: RawConfig) -> FeedResult<Self> {
        let mut config = Self::default();
        if let Some(network) = raw.network {
            if let Some(period) = network.heartbeat_period {
                config.heartbeat_period = Duration::from_secs(period);
            }
            if let Some(timeout) = network.heartbeat_timeout {
                config.heartbeat_timeout = Duration::from_secs(timeout);
            }
            if let Some(reestablish) = network.reestablish_connections {
                config.reestablish_connections = reestablish;
            }
        }
        if let Some(subscriptions) = raw.subscriptions {
            if let Some(disable) = subscriptions.disable_last_event_storage {
                config.disable_last_event_storage = disable;
            }
        }
        if let Some(logger) = raw.logger {
            if let Some(level) = logger.level {
                config.logger_level = level
                    .parse()
                    .map_err(|_| FeedError::Configuration(format!("bad logger level {level:?}")))?;
            }
        }
        if let Some(dump) = raw.dump {
            config.dump = dump;
        }
        if config.dump {
            info!("resolved configuration: {config:?}");
        }
        Ok(config)
    }
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    dump: Option<bool>,
    network: Option<RawNetwork>,
    subscriptions: Option<RawSubscriptions>,
    logger: Option<RawLogger>,
}

#[derive(Debug, Deserialize)]
struct RawNetwork {
    #[serde(rename = "heartbeatPeriod")]
    heartbeat_period: Option<u64>,
    #[serde(rename = "heartbeatTimeout")]
    heartbeat_timeout: Option<u64>,
    #[serde(rename = "reestablishConnections")]
    reestablish_connections: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RawSubscriptions {
    #[serde(rename = "disableLastEventStorage")]
    disable_last_event_storage: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RawLogger {
    level: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_table() {
        let c = FeedConfiguration::default();
        assert_eq!(c.heartbeat_period(), Duration::from_secs(10));
        assert_eq!(c.heartbeat_timeout(), Duration::from_secs(120));
        assert!(c.reestablish_connections());
        assert!(c.disable_last_event_storage());
    }

    #[test]
    fn toml_keys_override_defaults() {
        let c = FeedConfiguration::from_toml_str(
            r#"
            dump = false

            [network]
            heartbeatPeriod = 5
            heartbeatTimeout = 30
            reestablishConnections = false

            [subscriptions]
            disableLastEventStorage = false

            [logger]
            level = "debug"
            "#,
        )
        .unwrap();
        assert_eq!(c.heartbeat_period(), Duration::from_secs(5));
        assert_eq!(c.heartbeat_timeout(), Duration::from_secs(30));
        assert!(!c.reestablish_connections());
        assert!(!c.disable_last_event_storage());
        assert_eq!(c.logger_level(), log::LevelFilter::Debug);
    }

    #[test]
    fn bad_toml_is_a_configuration_error() {
        assert!(matches!(
            FeedConfiguration::from_toml_str("network = 3"),
            Err(FeedError::Configuration(_))
        ));
        assert!(matches!(
            FeedConfiguration::from_toml_str("[logger]\nlevel = \"loud\""),
            Err(FeedError::Configuration(_))
        ));
    }
}
