//! Configuration loading from a TOML file and environment variables.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::cache::CacheEntryOptions;
use crate::outbox::RelayConfig;
use crate::retry::{BackoffStrategy, RetryPolicy};

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct FolioConfig {
    #[serde(default)]
    pub relay: RelaySettings,

    #[serde(default)]
    pub pipeline: PipelineSettings,

    #[serde(default)]
    pub cache: CacheSettings,

    #[serde(default)]
    pub consumer: ConsumerSettings,

    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Outbox relay settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RelaySettings {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,

    /// Publish attempts before a message is parked as failed.
    #[serde(default = "default_relay_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

/// Command pipeline settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PipelineSettings {
    /// Retries after an optimistic-concurrency conflict (handler runs at most this + 1 times).
    #[serde(default = "default_max_conflict_retries")]
    pub max_conflict_retries: u32,

    #[serde(default = "default_conflict_backoff_ms")]
    pub conflict_backoff_ms: u64,
}

/// Cache settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CacheSettings {
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,

    #[serde(default = "default_list_ttl_secs")]
    pub list_ttl_secs: u64,

    #[serde(default = "default_entity_ttl_secs")]
    pub entity_ttl_secs: u64,

    /// Optional idle expiry for entity entries, capped by `entity_ttl_secs`.
    #[serde(default)]
    pub entity_sliding_secs: Option<u64>,
}

/// Consumer worker settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ConsumerSettings {
    /// Apply attempts before a message is dead-lettered.
    #[serde(default = "default_consumer_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_consumer_backoff_ms")]
    pub backoff_ms: u64,
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LoggingSettings {
    /// Log level filter (e.g. "info", "folio_infra=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default = "default_log_json")]
    pub json: bool,
}

fn default_poll_interval_ms() -> u64 {
    2_000
}

fn default_batch_size() -> usize {
    100
}

fn default_lease_secs() -> u64 {
    30
}

fn default_relay_max_attempts() -> u32 {
    5
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    60_000
}

fn default_max_conflict_retries() -> u32 {
    3
}

fn default_conflict_backoff_ms() -> u64 {
    10
}

fn default_token_ttl_secs() -> u64 {
    3_600
}

fn default_list_ttl_secs() -> u64 {
    300
}

fn default_entity_ttl_secs() -> u64 {
    600
}

fn default_consumer_max_attempts() -> u32 {
    3
}

fn default_consumer_backoff_ms() -> u64 {
    100
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_json() -> bool {
    true
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            batch_size: default_batch_size(),
            lease_secs: default_lease_secs(),
            max_attempts: default_relay_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_conflict_retries: default_max_conflict_retries(),
            conflict_backoff_ms: default_conflict_backoff_ms(),
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            token_ttl_secs: default_token_ttl_secs(),
            list_ttl_secs: default_list_ttl_secs(),
            entity_ttl_secs: default_entity_ttl_secs(),
            entity_sliding_secs: None,
        }
    }
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            max_attempts: default_consumer_max_attempts(),
            backoff_ms: default_consumer_backoff_ms(),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: default_log_json(),
        }
    }
}

impl RelaySettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.max_attempts,
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_max_ms),
        )
    }

    pub fn to_relay_config(&self, name: impl Into<String>) -> RelayConfig {
        RelayConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            batch_size: self.batch_size.max(1),
            lease: Duration::from_secs(self.lease_secs),
            retry: self.retry_policy(),
            name: name.into(),
        }
    }
}

impl PipelineSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.max_conflict_retries, Duration::from_millis(self.conflict_backoff_ms))
    }
}

impl CacheSettings {
    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }

    pub fn list_options(&self) -> CacheEntryOptions {
        CacheEntryOptions::absolute(Duration::from_secs(self.list_ttl_secs))
    }

    pub fn entity_options(&self) -> CacheEntryOptions {
        let options = CacheEntryOptions::absolute(Duration::from_secs(self.entity_ttl_secs));
        match self.entity_sliding_secs {
            Some(idle) => options.with_sliding(Duration::from_secs(idle)),
            None => options,
        }
    }
}

impl ConsumerSettings {
    /// Retry policy for apply failures; `max_attempts` counts the first try.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.saturating_sub(1),
            base_delay: Duration::from_millis(self.backoff_ms),
            max_delay: Duration::from_millis(self.backoff_ms.saturating_mul(8)),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.0,
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {var}: {value:?}")]
    InvalidOverride { var: &'static str, value: String },
}

impl FolioConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    ///
    /// Environment variable overrides:
    /// - `FOLIO_RELAY_POLL_INTERVAL_MS` overrides `relay.poll_interval_ms`
    /// - `FOLIO_RELAY_BATCH_SIZE` overrides `relay.batch_size`
    /// - `FOLIO_RELAY_MAX_ATTEMPTS` overrides `relay.max_attempts`
    /// - `FOLIO_PIPELINE_MAX_CONFLICT_RETRIES` overrides `pipeline.max_conflict_retries`
    /// - `FOLIO_CACHE_TOKEN_TTL_SECS` overrides `cache.token_ttl_secs`
    /// - `FOLIO_LOG_LEVEL` overrides `logging.level`
    /// - `FOLIO_LOG_JSON` overrides `logging.json` ("true"/"1" to enable)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file exists but cannot be read or parsed,
    /// or if an override does not parse.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => match std::fs::read_to_string(p) {
                Ok(contents) => Self::from_toml(&contents)?,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    tracing::info!(path = %p.display(), "config file not found, using defaults");
                    Self::default()
                }
                Err(e) => return Err(ConfigError::FileRead(e)),
            },
            None => Self::default(),
        };

        config.apply_overrides(|var| std::env::var(var).ok())?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Apply `FOLIO_*` overrides read through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(v) = parsed(&lookup, "FOLIO_RELAY_POLL_INTERVAL_MS")? {
            self.relay.poll_interval_ms = v;
        }
        if let Some(v) = parsed(&lookup, "FOLIO_RELAY_BATCH_SIZE")? {
            self.relay.batch_size = v;
        }
        if let Some(v) = parsed(&lookup, "FOLIO_RELAY_MAX_ATTEMPTS")? {
            self.relay.max_attempts = v;
        }
        if let Some(v) = parsed(&lookup, "FOLIO_PIPELINE_MAX_CONFLICT_RETRIES")? {
            self.pipeline.max_conflict_retries = v;
        }
        if let Some(v) = parsed(&lookup, "FOLIO_CACHE_TOKEN_TTL_SECS")? {
            self.cache.token_ttl_secs = v;
        }
        if let Some(level) = lookup("FOLIO_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(json) = lookup("FOLIO_LOG_JSON") {
            self.logging.json = json == "true" || json == "1";
        }
        Ok(())
    }
}

fn parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidOverride { var, value }),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = FolioConfig::default();
        assert_eq!(config.relay.poll_interval_ms, 2_000);
        assert_eq!(config.relay.batch_size, 100);
        assert_eq!(config.relay.max_attempts, 5);
        assert_eq!(config.pipeline.max_conflict_retries, 3);
        assert_eq!(config.cache.token_ttl(), Duration::from_secs(3_600));
        assert_eq!(config.consumer.retry_policy().max_attempts, 2);
        assert!(config.logging.json);
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let config = FolioConfig::from_toml(
            r#"
            [relay]
            batch_size = 10

            [cache]
            list_ttl_secs = 60
            entity_sliding_secs = 30
            "#,
        )
        .unwrap();

        assert_eq!(config.relay.batch_size, 10);
        assert_eq!(config.relay.lease_secs, 30);
        assert_eq!(config.cache.list_options(), CacheEntryOptions::absolute(Duration::from_secs(60)));
        assert_eq!(
            config.cache.entity_options().sliding_expiration,
            Some(Duration::from_secs(30))
        );
        assert_eq!(config.pipeline, PipelineSettings::default());
    }

    #[test]
    fn env_overrides_win_over_file_values() {
        let mut config = FolioConfig::from_toml("[pipeline]\nmax_conflict_retries = 1\n").unwrap();
        config
            .apply_overrides(env(&[
                ("FOLIO_PIPELINE_MAX_CONFLICT_RETRIES", "7"),
                ("FOLIO_LOG_JSON", "0"),
                ("FOLIO_LOG_LEVEL", "debug"),
            ]))
            .unwrap();

        assert_eq!(config.pipeline.max_conflict_retries, 7);
        assert_eq!(config.pipeline.retry_policy().max_attempts, 7);
        assert!(!config.logging.json);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn malformed_override_is_rejected() {
        let mut config = FolioConfig::default();
        let err = config
            .apply_overrides(env(&[("FOLIO_RELAY_BATCH_SIZE", "lots")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidOverride { var: "FOLIO_RELAY_BATCH_SIZE", .. }));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = FolioConfig::load(Some(Path::new("/nonexistent/folio.toml"))).unwrap();
        assert_eq!(config.relay, RelaySettings::default());
    }

    #[test]
    fn relay_settings_convert_to_runtime_config() {
        let relay = RelaySettings::default().to_relay_config("relay-1");
        assert_eq!(relay.name, "relay-1");
        assert_eq!(relay.lease, Duration::from_secs(30));
        assert_eq!(relay.retry.max_attempts, 5);
        assert_eq!(relay.retry.strategy, BackoffStrategy::Exponential);
    }
}
