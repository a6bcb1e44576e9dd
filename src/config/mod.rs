//! Pool configuration.
//!
//! A [`PgConfig`] is built once at process start (from code, JSON, or the
//! environment) and handed to [`Database::new`](crate::database::Database::new),
//! which validates it. It is read-only afterwards.

use serde::Deserialize;
use thiserror::Error;

/// Default maximum number of live database connections.
pub const DEFAULT_MAX_CONNECTIONS: u16 = 2;

/// Default capacity of the query-job and wait-entry record pools.
pub const DEFAULT_RECORD_CAPACITY: usize = 100;

const ENV_CONNINFO: &str = "RTTP_PGSQL_CONNINFO";
const ENV_MAX_CONNECTIONS: &str = "RTTP_PGSQL_MAX_CONNECTIONS";
const ENV_WAIT_CAPACITY: &str = "RTTP_PGSQL_WAIT_CAPACITY";
const ENV_JOB_CAPACITY: &str = "RTTP_PGSQL_JOB_CAPACITY";

/// Errors produced while loading or validating a [`PgConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no connection string configured")]
    MissingConninfo,

    #[error("max_connections must be at least 1")]
    ZeroConnections,

    #[error("wait_capacity must be at least 1")]
    ZeroWaitCapacity,

    #[error("job_capacity ({job_capacity}) is smaller than max_connections ({max_connections})")]
    JobCapacityTooSmall {
        job_capacity: usize,
        max_connections: u16,
    },

    #[error("environment variable {name} is not set")]
    MissingEnv { name: &'static str },

    #[error("environment variable {name} has an invalid value: {value:?}")]
    InvalidEnv { name: &'static str, value: String },

    #[error("invalid JSON configuration: {0}")]
    Json(#[from] serde_json::Error),
}

/// Connection pool settings.
///
/// # Examples
///
/// ```
/// use rttp_pgsql::config::PgConfig;
///
/// let config = PgConfig::new("host=localhost dbname=app user=app")
///     .max_connections(4);
///
/// assert_eq!(config.max_connections, 4);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct PgConfig {
    /// libpq-style `keyword=value` connection string.
    pub conninfo: String,

    /// Upper bound on live connections, busy or free.
    #[serde(default = "default_max_connections")]
    pub max_connections: u16,

    /// Number of requests that may be parked waiting for a connection.
    #[serde(default = "default_record_capacity")]
    pub wait_capacity: usize,

    /// Number of query jobs that may be in flight at once.
    #[serde(default = "default_record_capacity")]
    pub job_capacity: usize,
}

fn default_max_connections() -> u16 {
    DEFAULT_MAX_CONNECTIONS
}

fn default_record_capacity() -> usize {
    DEFAULT_RECORD_CAPACITY
}

impl PgConfig {
    /// Creates a configuration for `conninfo` with default sizing.
    pub fn new(conninfo: impl Into<String>) -> Self {
        Self {
            conninfo: conninfo.into(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            wait_capacity: DEFAULT_RECORD_CAPACITY,
            job_capacity: DEFAULT_RECORD_CAPACITY,
        }
    }

    /// Sets the maximum number of live connections.
    #[must_use]
    pub fn max_connections(mut self, max: u16) -> Self {
        self.max_connections = max;
        self
    }

    /// Sets the wait-queue capacity.
    #[must_use]
    pub fn wait_capacity(mut self, capacity: usize) -> Self {
        self.wait_capacity = capacity;
        self
    }

    /// Sets the query-job capacity.
    #[must_use]
    pub fn job_capacity(mut self, capacity: usize) -> Self {
        self.job_capacity = capacity;
        self
    }

    /// Parses a JSON document such as
    /// `{"conninfo": "dbname=app", "max_connections": 4}`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Json`] on malformed input, or any validation
    /// error from [`validate`](Self::validate).
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads the configuration from `RTTP_PGSQL_*` environment variables.
    ///
    /// `RTTP_PGSQL_CONNINFO` is required; `RTTP_PGSQL_MAX_CONNECTIONS`,
    /// `RTTP_PGSQL_WAIT_CAPACITY` and `RTTP_PGSQL_JOB_CAPACITY` fall back to
    /// their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingEnv`] or [`ConfigError::InvalidEnv`]
    /// for absent or unparsable variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let conninfo = std::env::var(ENV_CONNINFO).map_err(|_| ConfigError::MissingEnv {
            name: ENV_CONNINFO,
        })?;

        let mut config = Self::new(conninfo);
        if let Some(max) = env_parse(ENV_MAX_CONNECTIONS)? {
            config.max_connections = max;
        }
        if let Some(capacity) = env_parse(ENV_WAIT_CAPACITY)? {
            config.wait_capacity = capacity;
        }
        if let Some(capacity) = env_parse(ENV_JOB_CAPACITY)? {
            config.job_capacity = capacity;
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks the sizing invariants.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.conninfo.trim().is_empty() {
            return Err(ConfigError::MissingConninfo);
        }
        if self.max_connections == 0 {
            return Err(ConfigError::ZeroConnections);
        }
        if self.wait_capacity == 0 {
            return Err(ConfigError::ZeroWaitCapacity);
        }
        if self.job_capacity < usize::from(self.max_connections) {
            return Err(ConfigError::JobCapacityTooSmall {
                job_capacity: self.job_capacity,
                max_connections: self.max_connections,
            });
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { name, value }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = PgConfig::new("dbname=test");
        assert_eq!(config.max_connections, 2);
        assert_eq!(config.wait_capacity, 100);
        assert_eq!(config.job_capacity, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn json_with_defaults() {
        let config = PgConfig::from_json(r#"{"conninfo": "dbname=test"}"#).unwrap();
        assert_eq!(config.conninfo, "dbname=test");
        assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
    }

    #[test]
    fn json_overrides() {
        let config =
            PgConfig::from_json(r#"{"conninfo": "dbname=test", "max_connections": 8}"#).unwrap();
        assert_eq!(config.max_connections, 8);
    }

    #[test]
    fn json_missing_conninfo() {
        assert!(matches!(
            PgConfig::from_json(r#"{"max_connections": 8}"#),
            Err(ConfigError::Json(_))
        ));
    }

    #[test]
    fn rejects_empty_conninfo() {
        assert!(matches!(
            PgConfig::new("   ").validate(),
            Err(ConfigError::MissingConninfo)
        ));
    }

    #[test]
    fn rejects_zero_connections() {
        let config = PgConfig::new("dbname=test").max_connections(0);
        assert!(matches!(config.validate(), Err(ConfigError::ZeroConnections)));
    }

    #[test]
    fn rejects_small_job_capacity() {
        let config = PgConfig::new("dbname=test")
            .max_connections(10)
            .job_capacity(4);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::JobCapacityTooSmall { .. })
        ));
    }
}
