//! Runtime configuration holder shared by every connection worker.

use super::{Config, TunnelStrategy};
use crate::mode::ProxyMode;
use regex::Regex;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tracing::info;

/// Startup parameters plus the mutable proxy mode.
///
/// Everything except the mode is fixed after construction. The mode is an
/// atomic so a reader always sees one whole value.
#[derive(Debug)]
pub struct RuntimeConfig {
    destination: Regex,
    middleware: Option<String>,
    middleware_timeout: Duration,
    response_delay: Duration,
    tls_verify: bool,
    verbose: bool,
    tunnel_strategy: TunnelStrategy,
    upstream_connect_timeout: Duration,
    upstream_request_timeout: Duration,
    mode: AtomicU8,
}

impl RuntimeConfig {
    pub fn from_config(config: &Config) -> Result<Self, anyhow::Error> {
        let destination = Regex::new(&config.destination).map_err(|e| {
            anyhow::anyhow!("Invalid destination pattern '{}': {e}", config.destination)
        })?;

        Ok(Self {
            destination,
            middleware: config.middleware.clone(),
            middleware_timeout: Duration::from_millis(config.middleware_timeout_ms),
            response_delay: Duration::from_millis(config.response_delay_ms),
            tls_verify: config.tls_verify,
            verbose: config.verbose,
            tunnel_strategy: config.tunnel.strategy,
            upstream_connect_timeout: Duration::from_secs(config.upstream.connect_timeout_secs),
            upstream_request_timeout: Duration::from_secs(config.upstream.request_timeout_secs),
            mode: AtomicU8::new(config.mode as u8),
        })
    }

    pub fn mode(&self) -> ProxyMode {
        ProxyMode::from_u8(self.mode.load(Ordering::Acquire))
    }

    /// Switch the active mode. Requests already dispatched keep the mode
    /// they observed.
    pub fn set_mode(&self, mode: ProxyMode) {
        let previous = ProxyMode::from_u8(self.mode.swap(mode as u8, Ordering::AcqRel));
        if previous != mode {
            info!(from = %previous, to = %mode, "Proxy mode changed");
        }
    }

    /// Whether traffic for `host` is intercepted.
    pub fn matches_destination(&self, host: &str) -> bool {
        self.destination.is_match(host)
    }

    pub fn destination(&self) -> &str {
        self.destination.as_str()
    }

    pub fn middleware(&self) -> Option<&str> {
        self.middleware.as_deref()
    }

    pub fn middleware_timeout(&self) -> Duration {
        self.middleware_timeout
    }

    pub fn response_delay(&self) -> Duration {
        self.response_delay
    }

    pub fn tls_verify(&self) -> bool {
        self.tls_verify
    }

    pub fn verbose(&self) -> bool {
        self.verbose
    }

    pub fn tunnel_strategy(&self) -> TunnelStrategy {
        self.tunnel_strategy
    }

    pub fn upstream_connect_timeout(&self) -> Duration {
        self.upstream_connect_timeout
    }

    pub fn upstream_request_timeout(&self) -> Duration {
        self.upstream_request_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn runtime(destination: &str) -> RuntimeConfig {
        RuntimeConfig::from_config(&Config {
            destination: destination.to_string(),
            response_delay_ms: 250,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_from_config() {
        let rt = runtime(".");
        assert_eq!(rt.mode(), ProxyMode::Simulate);
        assert_eq!(rt.middleware_timeout(), Duration::from_millis(5000));
        assert_eq!(rt.response_delay(), Duration::from_millis(250));
        assert!(rt.tls_verify());
        assert_eq!(rt.tunnel_strategy(), TunnelStrategy::Intercept);
    }

    #[test]
    fn test_set_mode() {
        let rt = runtime(".");
        rt.set_mode(ProxyMode::Capture);
        assert_eq!(rt.mode(), ProxyMode::Capture);
        rt.set_mode(ProxyMode::Modify);
        assert_eq!(rt.mode(), ProxyMode::Modify);
    }

    #[test]
    fn test_destination_matching() {
        let rt = runtime(r"^api\.example\.com(:\d+)?$");
        assert!(rt.matches_destination("api.example.com"));
        assert!(rt.matches_destination("api.example.com:443"));
        assert!(!rt.matches_destination("www.example.com"));

        let all = runtime(".");
        assert!(all.matches_destination("anything.test:80"));
    }

    #[test]
    fn test_invalid_pattern() {
        let result = RuntimeConfig::from_config(&Config {
            destination: "[".to_string(),
            ..Default::default()
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_concurrent_mode_reads_see_whole_values() {
        let rt = Arc::new(runtime("."));
        let writer = {
            let rt = Arc::clone(&rt);
            std::thread::spawn(move || {
                for i in 0..1000 {
                    rt.set_mode(ProxyMode::ALL[i % 4]);
                }
            })
        };
        let reader = {
            let rt = Arc::clone(&rt);
            std::thread::spawn(move || {
                for _ in 0..1000 {
                    assert!(ProxyMode::ALL.contains(&rt.mode()));
                }
            })
        };
        writer.join().unwrap();
        reader.join().unwrap();
    }
}
