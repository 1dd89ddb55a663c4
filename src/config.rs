//! Configuration management for Tollgate.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{Result, TollgateError};
use crate::ratelimit::Algorithm;

/// Prefix for environment variable overrides, e.g. `TOLLGATE_SERVER__LISTEN_ADDR`.
const ENV_PREFIX: &str = "TOLLGATE";

/// Main configuration for the Tollgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP server address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Windowing algorithm
    #[serde(default)]
    pub algorithm: Algorithm,

    /// Requests allowed per window
    #[serde(default = "default_requests_limit")]
    pub requests_limit: u64,

    /// Window length in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// How long an idle key's record survives, in seconds; also the sweep period
    #[serde(default = "default_store_ttl_secs")]
    pub store_ttl_secs: u64,

    /// Sliding window only: write back the pruned log on denied requests
    #[serde(default)]
    pub persist_pruned_on_deny: bool,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::default(),
            requests_limit: default_requests_limit(),
            window_secs: default_window_secs(),
            store_ttl_secs: default_store_ttl_secs(),
            persist_pruned_on_deny: false,
        }
    }
}

fn default_requests_limit() -> u64 {
    100
}

fn default_window_secs() -> u64 {
    60
}

fn default_store_ttl_secs() -> u64 {
    600
}

impl RateLimitingConfig {
    /// The window as a duration.
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// The store TTL as a duration.
    pub fn store_ttl(&self) -> Duration {
        Duration::from_secs(self.store_ttl_secs)
    }

    /// Check the values the rate limiting core relies on.
    pub fn validate(&self) -> Result<()> {
        if self.requests_limit == 0 {
            return Err(TollgateError::Config(
                "requests_limit must be greater than zero".to_string(),
            ));
        }
        if self.window_secs == 0 {
            return Err(TollgateError::Config(
                "window_secs must be greater than zero".to_string(),
            ));
        }
        if self.store_ttl_secs == 0 {
            return Err(TollgateError::Config(
                "store_ttl_secs must be greater than zero".to_string(),
            ));
        }
        if self.store_ttl_secs < self.window_secs {
            warn!(
                store_ttl_secs = self.store_ttl_secs,
                window_secs = self.window_secs,
                "Store TTL is shorter than the window; records may expire mid-window"
            );
        }
        Ok(())
    }
}

impl TollgateConfig {
    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::Config(format!("Failed to parse configuration: {}", e)))
    }

    /// Load configuration from defaults, an optional file, and the environment.
    ///
    /// Later sources win. Environment keys use the `TOLLGATE_` prefix and `__`
    /// between sections, e.g. `TOLLGATE_RATE_LIMITING__REQUESTS_LIMIT=50`.
    pub fn load(path: Option<&str>) -> Result<Self> {
        Self::load_with_env(path, environment())
    }

    fn load_with_env(path: Option<&str>, env: ::config::Environment) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            info!(path = %path, "Loading configuration file");
            builder = builder.add_source(::config::File::with_name(path));
        }

        let config: TollgateConfig = builder.add_source(env).build()?.try_deserialize()?;

        Ok(config)
    }

    /// Validate the whole configuration.
    pub fn validate(&self) -> Result<()> {
        self.rate_limiting.validate()
    }
}

fn environment() -> ::config::Environment {
    ::config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}
