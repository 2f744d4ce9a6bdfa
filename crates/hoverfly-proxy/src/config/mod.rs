//! Configuration types for hoverfly-proxy.

mod listen;
mod runtime;
mod tunnel;

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::mode::ProxyMode;

pub use listen::{CacheConfig, ListenConfig, MetricsConfig, UpstreamConfig};
pub use runtime::RuntimeConfig;
pub use tunnel::{CaConfig, TunnelConfig, TunnelStrategy};

/// Startup configuration, loaded from YAML and overridden from the CLI
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub listen: ListenConfig,

    /// Regular expression selecting which hosts are intercepted
    #[serde(default = "default_destination")]
    pub destination: String,

    /// Mode active at startup
    #[serde(default)]
    pub mode: ProxyMode,

    /// Middleware command (run through `sh -c`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub middleware: Option<String>,

    #[serde(default = "default_middleware_timeout")]
    pub middleware_timeout_ms: u64,

    /// Latency injected before simulated responses
    #[serde(default)]
    pub response_delay_ms: u64,

    /// Verify upstream TLS certificates on live calls
    #[serde(default = "default_true")]
    pub tls_verify: bool,

    #[serde(default)]
    pub verbose: bool,

    #[serde(default)]
    pub tunnel: TunnelConfig,

    #[serde(default)]
    pub upstream: UpstreamConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

fn default_destination() -> String {
    ".".to_string()
}

fn default_middleware_timeout() -> u64 {
    5000
}

fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: ListenConfig::default(),
            destination: default_destination(),
            mode: ProxyMode::default(),
            middleware: None,
            middleware_timeout_ms: default_middleware_timeout(),
            response_delay_ms: 0,
            tls_verify: true,
            verbose: false,
            tunnel: TunnelConfig::default(),
            upstream: UpstreamConfig::default(),
            cache: CacheConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, anyhow::Error> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        regex::Regex::new(&self.destination).map_err(|e| {
            anyhow::anyhow!("Invalid destination pattern '{}': {e}", self.destination)
        })?;

        if self.mode.requires_middleware() && self.middleware.is_none() {
            anyhow::bail!(
                "Mode '{}' requires a middleware. Please provide 'middleware'",
                self.mode
            );
        }

        if self.middleware_timeout_ms == 0 {
            anyhow::bail!("'middlewareTimeoutMs' must be greater than zero");
        }

        let ca = &self.tunnel.ca;
        if ca.cert_path.is_some() != ca.key_path.is_some() {
            anyhow::bail!(
                "'tunnel.ca.certPath' and 'tunnel.ca.keyPath' must be provided together"
            );
        }

        Ok(())
    }
}
