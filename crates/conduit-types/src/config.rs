//! Server configuration with sensible defaults.
//!
//! All operational parameters of the session manager are centralized
//! here. Every value has a documented default; [`ServerConfig::validate`]
//! rejects values outside their acceptable range.
//!
//! Example config file:
//! ```json
//! {
//!   "channel_capacity": 64,
//!   "default_deadline_ms": 30000,
//!   "max_sessions": 1024
//! }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{ConduitError, Result};

/// Default bounded channel capacity (messages per direction).
pub const DEFAULT_CHANNEL_CAPACITY: usize = 32;

/// Session manager configuration.
///
/// Interceptors are not part of this struct: they are code, not data,
/// and are supplied through the server builder in registration order.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Capacity of every session channel. Sends block once this many
    /// messages are buffered unread.
    pub channel_capacity: usize,

    /// Deadline applied to calls that arrive without one.
    #[serde(rename = "default_deadline_ms", with = "duration_ms")]
    pub default_deadline: Option<Duration>,

    /// Upper bound on concurrently registered sessions. `None` is unbounded.
    pub max_sessions: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            default_deadline: None,
            max_sessions: None,
        }
    }
}

impl ServerConfig {
    /// Validates all configuration values.
    ///
    /// Returns an error if any value is outside its acceptable range.
    pub fn validate(&self) -> Result<()> {
        if self.channel_capacity == 0 {
            return Err(ConduitError::ConfigError {
                reason: "channel_capacity must be greater than 0".into(),
            });
        }

        if let Some(deadline) = self.default_deadline {
            if deadline.is_zero() {
                return Err(ConduitError::ConfigError {
                    reason: "default_deadline must be greater than 0".into(),
                });
            }
        }

        if self.max_sessions == Some(0) {
            return Err(ConduitError::ConfigError {
                reason: "max_sessions must be greater than 0".into(),
            });
        }

        Ok(())
    }

    /// Parses and validates a JSON config document.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text).map_err(|e| ConduitError::ConfigError {
            reason: format!("invalid config JSON: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a JSON config file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| ConduitError::ConfigError {
            reason: format!("failed to read config file '{}': {e}", path.display()),
        })?;
        Self::from_json_str(&text)
    }
}

/// Serde adapter storing `Option<Duration>` as optional milliseconds.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.channel_capacity, 32);
        assert_eq!(config.default_deadline, None);
        assert_eq!(config.max_sessions, None);
    }

    #[test]
    fn zero_capacity_rejected() {
        let config = ServerConfig {
            channel_capacity: 0,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_deadline_rejected() {
        let config = ServerConfig {
            default_deadline: Some(Duration::ZERO),
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_max_sessions_rejected() {
        let config = ServerConfig {
            max_sessions: Some(0),
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn json_fields_and_defaults() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let config = ServerConfig::from_json_str(r#"{ "default_deadline_ms": 1500 }"#)?;
        assert_eq!(config.channel_capacity, DEFAULT_CHANNEL_CAPACITY);
        assert_eq!(config.default_deadline, Some(Duration::from_millis(1500)));

        let config = ServerConfig::from_json_str(r#"{ "channel_capacity": 4, "max_sessions": 2 }"#)?;
        assert_eq!(config.channel_capacity, 4);
        assert_eq!(config.max_sessions, Some(2));
        Ok(())
    }

    #[test]
    fn json_invalid_values_rejected() {
        assert!(ServerConfig::from_json_str(r#"{ "channel_capacity": 0 }"#).is_err());
        assert!(ServerConfig::from_json_str("not json").is_err());
    }

    #[test]
    fn json_serialize_roundtrip() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let config = ServerConfig {
            channel_capacity: 8,
            default_deadline: Some(Duration::from_secs(2)),
            max_sessions: None,
        };
        let text = serde_json::to_string(&config)?;
        assert!(text.contains("\"default_deadline_ms\":2000"));
        assert_eq!(ServerConfig::from_json_str(&text)?, config);
        Ok(())
    }

    #[test]
    fn load_missing_file_is_config_error() {
        let result = ServerConfig::load(Path::new("/nonexistent/conduit.json"));
        assert!(matches!(result, Err(ConduitError::ConfigError { .. })));
    }
}
