//! Session store configuration.
//!
//! A [`SessionConfig`] is resolved once at startup and passed by value into
//! every component. Options come from four layers, highest precedence first:
//!
//! 1. runtime: a [`ConfigLayer`] built in code,
//! 2. file: a TOML or JSON file named by the `config_file` option,
//! 3. environment: `AWS_DYNAMO_DB_SESSION_<OPTION>` variables,
//! 4. the defaults below.

use crate::error::{SessionError, SessionResult};
use serde::{Deserialize, Deserializer};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Prefix of environment variables holding session store options.
pub const ENV_PREFIX: &str = "AWS_DYNAMO_DB_SESSION_";

/// Deprecated prefix, still honoured.
pub const DEPRECATED_ENV_PREFIX: &str = "DYNAMO_DB_SESSION_";

/// Option names accepted by every layer.
pub const OPTION_NAMES: &[&str] = &[
    "table_name",
    "table_key",
    "secret_key",
    "consistent_read",
    "read_capacity",
    "write_capacity",
    "raise_errors",
    "max_age",
    "max_stale",
    "enable_locking",
    "lock_expiry_time",
    "lock_retry_delay",
    "lock_max_wait_time",
    "gc_scan_limit",
    "gc_max_batch_attempts",
    "gc_retry_base_delay",
    "gc_retry_max_delay",
    "config_file",
];

/// Session store configuration.
#[derive(Clone, PartialEq)]
pub struct SessionConfig {
    /// Name of the session table
    pub table_name: String,
    /// Name of the hash key attribute
    pub table_key: String,
    /// Secret used to sign session identifiers
    pub secret_key: Option<String>,
    /// Use strongly consistent reads
    pub consistent_read: bool,
    /// Provisioned read capacity hint
    pub read_capacity: u64,
    /// Provisioned write capacity hint
    pub write_capacity: u64,
    /// Propagate every error instead of swallowing soft ones
    pub raise_errors: bool,
    /// Sessions created longer ago than this are garbage
    pub max_age: Option<Duration>,
    /// Sessions not updated for longer than this are garbage
    pub max_stale: Option<Duration>,
    /// Serialize concurrent requests on the same session
    pub enable_locking: bool,
    /// Age after which a held lock may be busted
    pub lock_expiry_time: Duration,
    /// Pause between lock attempts
    pub lock_retry_delay: Duration,
    /// Total time to wait for a lock before giving up
    pub lock_max_wait_time: Duration,
    /// Items evaluated per garbage-collection scan page
    pub gc_scan_limit: Option<u32>,
    /// Submissions of one delete batch before the sweep gives up
    pub gc_max_batch_attempts: u32,
    /// First backoff between batch resubmissions
    pub gc_retry_base_delay: Duration,
    /// Backoff ceiling between batch resubmissions
    pub gc_retry_max_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            table_name: "sessions".to_string(),
            table_key: "session_id".to_string(),
            secret_key: None,
            consistent_read: true,
            read_capacity: 10,
            write_capacity: 5,
            raise_errors: false,
            max_age: None,
            max_stale: None,
            enable_locking: false,
            lock_expiry_time: Duration::from_millis(500),
            lock_retry_delay: Duration::from_millis(500),
            lock_max_wait_time: Duration::from_secs(1),
            gc_scan_limit: None,
            gc_max_batch_attempts: 10,
            gc_retry_base_delay: Duration::from_millis(50),
            gc_retry_max_delay: Duration::from_secs(2),
        }
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("table_name", &self.table_name)
            .field("table_key", &self.table_key)
            .field("secret_key", &self.secret_key.as_ref().map(|_| "[REDACTED]"))
            .field("consistent_read", &self.consistent_read)
            .field("read_capacity", &self.read_capacity)
            .field("write_capacity", &self.write_capacity)
            .field("raise_errors", &self.raise_errors)
            .field("max_age", &self.max_age)
            .field("max_stale", &self.max_stale)
            .field("enable_locking", &self.enable_locking)
            .field("lock_expiry_time", &self.lock_expiry_time)
            .field("lock_retry_delay", &self.lock_retry_delay)
            .field("lock_max_wait_time", &self.lock_max_wait_time)
            .field("gc_scan_limit", &self.gc_scan_limit)
            .field("gc_max_batch_attempts", &self.gc_max_batch_attempts)
            .field("gc_retry_base_delay", &self.gc_retry_base_delay)
            .field("gc_retry_max_delay", &self.gc_retry_max_delay)
            .finish()
    }
}

impl SessionConfig {
    /// Create a configuration with defaults and the given secret.
    ///
    /// # Examples
    ///
    /// ```
    /// use sessionstore_dynamodb::SessionConfig;
    ///
    /// let config = SessionConfig::new("watermelon_smiles").with_table_name("app-sessions");
    /// assert_eq!(config.table_name, "app-sessions");
    /// ```
    pub fn new(secret_key: impl Into<String>) -> Self {
        Self {
            secret_key: Some(secret_key.into()),
            ..Default::default()
        }
    }

    /// Resolve from the runtime layer, the configuration file and the process environment.
    pub fn resolve(runtime: ConfigLayer) -> SessionResult<Self> {
        Self::resolve_layers(runtime, ConfigLayer::from_env()?)
    }

    /// Resolve from explicit runtime and environment layers.
    ///
    /// The configuration file is named by `config_file` in either layer
    /// (runtime wins) and sits between them in precedence.
    pub fn resolve_layers(runtime: ConfigLayer, env: ConfigLayer) -> SessionResult<Self> {
        let file = match runtime.config_file.as_ref().or(env.config_file.as_ref()) {
            Some(path) => ConfigLayer::from_file(path)?,
            None => ConfigLayer::default(),
        };

        let mut config = Self::default();
        runtime.or(file).or(env).apply(&mut config)?;
        config.validate()?;
        Ok(config)
    }

    /// Set the table name.
    pub fn with_table_name(mut self, table_name: impl Into<String>) -> Self {
        self.table_name = table_name.into();
        self
    }

    /// Set the hash key attribute name.
    pub fn with_table_key(mut self, table_key: impl Into<String>) -> Self {
        self.table_key = table_key.into();
        self
    }

    /// Set the identifier signing secret.
    pub fn with_secret_key(mut self, secret_key: impl Into<String>) -> Self {
        self.secret_key = Some(secret_key.into());
        self
    }

    pub fn with_consistent_read(mut self, consistent_read: bool) -> Self {
        self.consistent_read = consistent_read;
        self
    }

    pub fn with_capacity(mut self, read: u64, write: u64) -> Self {
        self.read_capacity = read;
        self.write_capacity = write;
        self
    }

    /// Propagate soft errors too.
    pub fn with_raise_errors(mut self, raise_errors: bool) -> Self {
        self.raise_errors = raise_errors;
        self
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    pub fn with_max_stale(mut self, max_stale: Duration) -> Self {
        self.max_stale = Some(max_stale);
        self
    }

    /// Enable pessimistic locking.
    pub fn with_locking(mut self, enable: bool) -> Self {
        self.enable_locking = enable;
        self
    }

    /// Set lock expiry, retry delay and maximum wait in one go.
    pub fn with_lock_timing(mut self, expiry: Duration, retry_delay: Duration, max_wait: Duration) -> Self {
        self.lock_expiry_time = expiry;
        self.lock_retry_delay = retry_delay;
        self.lock_max_wait_time = max_wait;
        self
    }

    pub fn with_gc_scan_limit(mut self, limit: u32) -> Self {
        self.gc_scan_limit = Some(limit);
        self
    }

    /// Configure resubmission of unprocessed batch deletes.
    pub fn with_gc_retry(mut self, max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        self.gc_max_batch_attempts = max_attempts;
        self.gc_retry_base_delay = base_delay;
        self.gc_retry_max_delay = max_delay;
        self
    }

    /// Check option values for consistency.
    pub fn validate(&self) -> SessionResult<()> {
        if self.table_name.trim().is_empty() {
            return Err(SessionError::Config("table_name must not be empty".to_string()));
        }
        if self.table_key.trim().is_empty() {
            return Err(SessionError::Config("table_key must not be empty".to_string()));
        }
        if self.read_capacity == 0 || self.write_capacity == 0 {
            return Err(SessionError::Config(
                "read_capacity and write_capacity must be positive".to_string(),
            ));
        }
        if self.enable_locking && self.lock_retry_delay.is_zero() {
            return Err(SessionError::Config(
                "lock_retry_delay must be positive when locking is enabled".to_string(),
            ));
        }
        if self.gc_max_batch_attempts == 0 {
            return Err(SessionError::Config(
                "gc_max_batch_attempts must be at least 1".to_string(),
            ));
        }
        if self.gc_scan_limit == Some(0) {
            return Err(SessionError::Config("gc_scan_limit must be positive".to_string()));
        }
        Ok(())
    }
}

/// A partial set of options from one source.
///
/// Durations use the units of the option names: `lock_expiry_time`,
/// `lock_retry_delay` and the `gc_retry_*` delays in milliseconds,
/// `lock_max_wait_time`, `max_age` and `max_stale` in seconds.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ConfigLayer {
    #[serde(deserialize_with = "lenient_string")]
    pub table_name: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub table_key: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub secret_key: Option<String>,
    pub consistent_read: Option<bool>,
    pub read_capacity: Option<u64>,
    pub write_capacity: Option<u64>,
    pub raise_errors: Option<bool>,
    pub max_age: Option<f64>,
    pub max_stale: Option<f64>,
    pub enable_locking: Option<bool>,
    pub lock_expiry_time: Option<u64>,
    pub lock_retry_delay: Option<u64>,
    pub lock_max_wait_time: Option<f64>,
    pub gc_scan_limit: Option<u32>,
    pub gc_max_batch_attempts: Option<u32>,
    pub gc_retry_base_delay: Option<u64>,
    pub gc_retry_max_delay: Option<u64>,
    #[serde(deserialize_with = "lenient_string")]
    pub config_file: Option<String>,
}

impl ConfigLayer {
    /// Read the layer from the process environment.
    pub fn from_env() -> SessionResult<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Read the layer from `(name, value)` pairs shaped like environment variables.
    ///
    /// Values parse as integer, then float, then `true`/`false`, and are
    /// otherwise kept as strings.
    pub fn from_vars<I>(vars: I) -> SessionResult<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars: std::collections::HashMap<String, String> = vars.into_iter().collect();
        let mut map = serde_json::Map::new();

        for name in OPTION_NAMES {
            let upper = name.to_uppercase();
            let deprecated = format!("{}{}", DEPRECATED_ENV_PREFIX, upper);
            let current = format!("{}{}", ENV_PREFIX, upper);

            let value = if let Some(value) = vars.get(&deprecated) {
                warn!(
                    variable = %deprecated,
                    replacement = %current,
                    "Deprecated session store environment variable"
                );
                value
            } else if let Some(value) = vars.get(&current) {
                value
            } else {
                continue;
            };
            map.insert(name.to_string(), parse_env_value(value));
        }

        serde_json::from_value(serde_json::Value::Object(map))
            .map_err(|e| SessionError::Config(format!("Invalid environment option: {}", e)))
    }

    /// Read the layer from a TOML or JSON file, chosen by extension.
    pub fn from_file(path: impl AsRef<Path>) -> SessionResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            SessionError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;

        let extension = path
            .extension()
            .and_then(|s| s.to_str())
            .map(str::to_lowercase)
            .unwrap_or_default();

        let layer: ConfigLayer = match extension.as_str() {
            "toml" => toml::from_str(&content)
                .map_err(|e| SessionError::Config(format!("TOML parse error: {}", e)))?,
            "json" => serde_json::from_str(&content)
                .map_err(|e| SessionError::Config(format!("JSON parse error: {}", e)))?,
            other => {
                return Err(SessionError::Config(format!(
                    "Unsupported configuration format: {:?}",
                    other
                )));
            }
        };

        // A file cannot point at another file.
        Ok(ConfigLayer {
            config_file: None,
            ..layer
        })
    }

    /// Fill every unset option of `self` from `lower`.
    pub fn or(self, lower: ConfigLayer) -> ConfigLayer {
        ConfigLayer {
            table_name: self.table_name.or(lower.table_name),
            table_key: self.table_key.or(lower.table_key),
            secret_key: self.secret_key.or(lower.secret_key),
            consistent_read: self.consistent_read.or(lower.consistent_read),
            read_capacity: self.read_capacity.or(lower.read_capacity),
            write_capacity: self.write_capacity.or(lower.write_capacity),
            raise_errors: self.raise_errors.or(lower.raise_errors),
            max_age: self.max_age.or(lower.max_age),
            max_stale: self.max_stale.or(lower.max_stale),
            enable_locking: self.enable_locking.or(lower.enable_locking),
            lock_expiry_time: self.lock_expiry_time.or(lower.lock_expiry_time),
            lock_retry_delay: self.lock_retry_delay.or(lower.lock_retry_delay),
            lock_max_wait_time: self.lock_max_wait_time.or(lower.lock_max_wait_time),
            gc_scan_limit: self.gc_scan_limit.or(lower.gc_scan_limit),
            gc_max_batch_attempts: self.gc_max_batch_attempts.or(lower.gc_max_batch_attempts),
            gc_retry_base_delay: self.gc_retry_base_delay.or(lower.gc_retry_base_delay),
            gc_retry_max_delay: self.gc_retry_max_delay.or(lower.gc_retry_max_delay),
            config_file: self.config_file.or(lower.config_file),
        }
    }

    /// Write every set option onto `config`.
    pub fn apply(self, config: &mut SessionConfig) -> SessionResult<()> {
        if let Some(v) = self.table_name {
            config.table_name = v;
        }
        if let Some(v) = self.table_key {
            config.table_key = v;
        }
        if let Some(v) = self.secret_key {
            config.secret_key = Some(v);
        }
        if let Some(v) = self.consistent_read {
            config.consistent_read = v;
        }
        if let Some(v) = self.read_capacity {
            config.read_capacity = v;
        }
        if let Some(v) = self.write_capacity {
            config.write_capacity = v;
        }
        if let Some(v) = self.raise_errors {
            config.raise_errors = v;
        }
        if let Some(v) = self.max_age {
            config.max_age = Some(seconds("max_age", v)?);
        }
        if let Some(v) = self.max_stale {
            config.max_stale = Some(seconds("max_stale", v)?);
        }
        if let Some(v) = self.enable_locking {
            config.enable_locking = v;
        }
        if let Some(v) = self.lock_expiry_time {
            config.lock_expiry_time = Duration::from_millis(v);
        }
        if let Some(v) = self.lock_retry_delay {
            config.lock_retry_delay = Duration::from_millis(v);
        }
        if let Some(v) = self.lock_max_wait_time {
            config.lock_max_wait_time = seconds("lock_max_wait_time", v)?;
        }
        if let Some(v) = self.gc_scan_limit {
            config.gc_scan_limit = Some(v);
        }
        if let Some(v) = self.gc_max_batch_attempts {
            config.gc_max_batch_attempts = v;
        }
        if let Some(v) = self.gc_retry_base_delay {
            config.gc_retry_base_delay = Duration::from_millis(v);
        }
        if let Some(v) = self.gc_retry_max_delay {
            config.gc_retry_max_delay = Duration::from_millis(v);
        }
        Ok(())
    }
}

fn seconds(option: &str, value: f64) -> SessionResult<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|e| SessionError::Config(format!("{} must be a non-negative number of seconds: {}", option, e)))
}

fn parse_env_value(value: &str) -> serde_json::Value {
    if let Ok(n) = value.parse::<i64>() {
        return serde_json::Value::from(n);
    }
    if let Ok(n) = value.parse::<f64>() {
        if n.is_finite() {
            return serde_json::Value::from(n);
        }
    }
    match value {
        "true" => serde_json::Value::Bool(true),
        "false" => serde_json::Value::Bool(false),
        _ => serde_json::Value::String(value.to_string()),
    }
}

/// Accept strings, numbers and booleans for string-valued options.
fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Lenient {
        S(String),
        I(i64),
        F(f64),
        B(bool),
    }

    Ok(Option::<Lenient>::deserialize(deserializer)?.map(|v| match v {
        Lenient::S(s) => s,
        Lenient::I(i) => i.to_string(),
        Lenient::F(f) => f.to_string(),
        Lenient::B(b) => b.to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.table_name, "sessions");
        assert_eq!(config.table_key, "session_id");
        assert!(config.secret_key.is_none());
        assert!(config.consistent_read);
        assert_eq!(config.read_capacity, 10);
        assert_eq!(config.write_capacity, 5);
        assert!(!config.raise_errors);
        assert!(!config.enable_locking);
        assert_eq!(config.lock_expiry_time, Duration::from_millis(500));
        assert_eq!(config.lock_retry_delay, Duration::from_millis(500));
        assert_eq!(config.lock_max_wait_time, Duration::from_secs(1));
    }

    #[test]
    fn test_debug_redacts_secret() {
        let config = SessionConfig::new("watermelon_smiles");
        let debug = format!("{:?}", config);
        assert!(!debug.contains("watermelon_smiles"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn test_env_values_are_typed() {
        let layer = ConfigLayer::from_vars(vars(&[
            ("AWS_DYNAMO_DB_SESSION_TABLE_NAME", "app-sessions"),
            ("AWS_DYNAMO_DB_SESSION_ENABLE_LOCKING", "true"),
            ("AWS_DYNAMO_DB_SESSION_LOCK_EXPIRY_TIME", "2000"),
            ("AWS_DYNAMO_DB_SESSION_LOCK_MAX_WAIT_TIME", "0.25"),
            ("AWS_DYNAMO_DB_SESSION_SECRET_KEY", "12345"),
            ("UNRELATED", "x"),
        ]))
        .unwrap();

        assert_eq!(layer.table_name.as_deref(), Some("app-sessions"));
        assert_eq!(layer.enable_locking, Some(true));
        assert_eq!(layer.lock_expiry_time, Some(2000));
        assert_eq!(layer.lock_max_wait_time, Some(0.25));
        assert_eq!(layer.secret_key.as_deref(), Some("12345"));
    }

    #[test]
    fn test_deprecated_env_prefix_wins_when_present() {
        let layer = ConfigLayer::from_vars(vars(&[
            ("DYNAMO_DB_SESSION_TABLE_NAME", "old"),
            ("AWS_DYNAMO_DB_SESSION_TABLE_NAME", "new"),
        ]))
        .unwrap();
        assert_eq!(layer.table_name.as_deref(), Some("old"));
    }

    #[test]
    fn test_env_type_mismatch() {
        let result = ConfigLayer::from_vars(vars(&[("AWS_DYNAMO_DB_SESSION_READ_CAPACITY", "lots")]));
        assert!(matches!(result, Err(SessionError::Config(_))));
    }

    #[test]
    fn test_precedence_runtime_over_file_over_env() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "table_name = \"from-file\"\ntable_key = \"file_key\"\nmax_stale = 3600"
        )
        .unwrap();

        let runtime = ConfigLayer {
            table_name: Some("from-runtime".into()),
            config_file: Some(file.path().to_string_lossy().into_owned()),
            ..Default::default()
        };
        let env = ConfigLayer::from_vars(vars(&[
            ("AWS_DYNAMO_DB_SESSION_TABLE_NAME", "from-env"),
            ("AWS_DYNAMO_DB_SESSION_TABLE_KEY", "env_key"),
            ("AWS_DYNAMO_DB_SESSION_SECRET_KEY", "env-secret"),
        ]))
        .unwrap();

        let config = SessionConfig::resolve_layers(runtime, env).unwrap();
        assert_eq!(config.table_name, "from-runtime");
        assert_eq!(config.table_key, "file_key");
        assert_eq!(config.secret_key.as_deref(), Some("env-secret"));
        assert_eq!(config.max_stale, Some(Duration::from_secs(3600)));
        assert_eq!(config.read_capacity, 10);
    }

    #[test]
    fn test_json_file() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"enable_locking": true, "lock_retry_delay": 100}}"#).unwrap();

        let layer = ConfigLayer::from_file(file.path()).unwrap();
        assert_eq!(layer.enable_locking, Some(true));
        assert_eq!(layer.lock_retry_delay, Some(100));
    }

    #[test]
    fn test_unsupported_file_format() {
        let file = tempfile::Builder::new().suffix(".ini").tempfile().unwrap();
        assert!(matches!(
            ConfigLayer::from_file(file.path()),
            Err(SessionError::Config(_))
        ));
    }

    #[test]
    fn test_validation() {
        assert!(SessionConfig::default().validate().is_ok());
        assert!(SessionConfig::default().with_table_name("").validate().is_err());
        assert!(SessionConfig::default().with_capacity(0, 5).validate().is_err());
        assert!(
            SessionConfig::default()
                .with_locking(true)
                .with_lock_timing(Duration::from_millis(500), Duration::ZERO, Duration::from_secs(1))
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_negative_seconds_rejected() {
        let layer = ConfigLayer {
            max_age: Some(-1.0),
            ..Default::default()
        };
        let mut config = SessionConfig::default();
        assert!(layer.apply(&mut config).is_err());
    }
}
