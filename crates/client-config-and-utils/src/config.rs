//! Configuration management for the delivery layer.

use crate::{CoreError, CoreResult, Paths};
use serde::{Deserialize, Serialize};
use std::path::Path;
use url::Url;

/// Default Supabase URL (can be overridden at compile time via SUPABASE_URL env var).
pub const DEFAULT_SUPABASE_URL: &str = match option_env!("SUPABASE_URL") {
    Some(url) => url,
    None => "https://naarscars.supabase.co",
};

/// Default Supabase publishable key (can be overridden at compile time via SUPABASE_PUBLISHABLE_KEY env var).
pub const DEFAULT_SUPABASE_PUBLISHABLE_KEY: &str = match option_env!("SUPABASE_PUBLISHABLE_KEY") {
    Some(key) => key,
    None => "public-anon-key",
};

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Channel-name prefixes exempt from eviction while unprotected channels exist.
pub const DEFAULT_PROTECTED_PREFIXES: [&str; 3] = ["messages:", "conversations:", "dashboard:"];

/// Returns the Supabase URL baked in at compile time.
pub fn compile_time_supabase_url() -> &'static str {
    DEFAULT_SUPABASE_URL
}

/// Outbound delivery settings for the send worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Attempts per item before it is marked failed.
    pub max_attempts: u32,
    /// Delay before the second attempt, doubled after every failure.
    pub initial_backoff_ms: u64,
    /// Upper bound on the backoff delay.
    pub max_backoff_ms: u64,
    /// Per-request HTTP timeout for the REST transport.
    pub request_timeout_secs: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            request_timeout_secs: 30,
        }
    }
}

/// Live-update subscription settings for the multiplexer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Hard cap on concurrently open channels.
    pub max_concurrent_subscriptions: usize,
    /// How long channels survive after the app is backgrounded.
    pub background_grace_period_secs: u64,
    /// Channel-name prefixes that are evicted last.
    pub protected_prefixes: Vec<String>,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            max_concurrent_subscriptions: 30,
            background_grace_period_secs: 30,
            protected_prefixes: DEFAULT_PROTECTED_PREFIXES
                .iter()
                .map(|p| p.to_string())
                .collect(),
        }
    }
}

/// Main client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
    /// Supabase project URL.
    #[serde(default = "default_supabase_url")]
    pub supabase_url: String,
    /// Supabase publishable API key (public, safe to expose).
    #[serde(default = "default_supabase_publishable_key")]
    pub supabase_publishable_key: String,
    /// Send worker retry policy.
    #[serde(default)]
    pub delivery: DeliveryConfig,
    /// Subscription multiplexer limits.
    #[serde(default)]
    pub realtime: RealtimeConfig,
}

fn default_supabase_url() -> String {
    DEFAULT_SUPABASE_URL.to_string()
}

fn default_supabase_publishable_key() -> String {
    DEFAULT_SUPABASE_PUBLISHABLE_KEY.to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            supabase_url: DEFAULT_SUPABASE_URL.to_string(),
            supabase_publishable_key: DEFAULT_SUPABASE_PUBLISHABLE_KEY.to_string(),
            delivery: DeliveryConfig::default(),
            realtime: RealtimeConfig::default(),
        }
    }
}

impl Config {
    /// Create a new Config with default values, then override from environment.
    pub fn new() -> Self {
        let mut config = Self::default();
        config.load_from_env();
        config
    }

    /// Load configuration from the config file, falling back to defaults.
    pub fn load(paths: &Paths) -> CoreResult<Self> {
        let config_path = paths.config_file();

        let mut config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            Self::default()
        };

        config.load_from_env();
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a file.
    pub fn save(&self, paths: &Paths) -> CoreResult<()> {
        paths.ensure_dirs()?;
        let config_path = paths.config_file();
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;
        Ok(())
    }

    /// Override configuration from environment variables.
    fn load_from_env(&mut self) {
        if let Ok(log_level) = std::env::var("NAARS_LOG_LEVEL") {
            self.log_level = log_level;
        }
        if let Ok(url) = std::env::var("NAARS_SUPABASE_URL") {
            if !url.trim().is_empty() {
                self.supabase_url = url.trim().to_string();
            }
        }
    }

    /// Reject settings the worker and multiplexer cannot run with.
    pub fn validate(&self) -> CoreResult<()> {
        if self.delivery.max_attempts == 0 {
            return Err(CoreError::Config(
                "delivery.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.delivery.initial_backoff_ms > self.delivery.max_backoff_ms {
            return Err(CoreError::Config(format!(
                "delivery.initial_backoff_ms ({}) exceeds delivery.max_backoff_ms ({})",
                self.delivery.initial_backoff_ms, self.delivery.max_backoff_ms
            )));
        }
        if self.realtime.max_concurrent_subscriptions == 0 {
            return Err(CoreError::Config(
                "realtime.max_concurrent_subscriptions must be at least 1".to_string(),
            ));
        }
        self.supabase_url()?;
        Ok(())
    }

    /// Get the Supabase URL as a parsed URL.
    pub fn supabase_url(&self) -> CoreResult<Url> {
        Url::parse(&self.supabase_url).map_err(CoreError::from)
    }
}
