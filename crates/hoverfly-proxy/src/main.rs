use clap::Parser;
use hoverfly_proxy::config::{Config, TunnelStrategy};
use hoverfly_proxy::{ProxyMode, ProxyServer};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Hoverfly - capture, simulate, synthesize and modify HTTP(S) traffic
#[derive(Parser, Debug)]
#[command(name = "hoverfly-proxy")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(short, long, env = "HOVERFLY_CONFIG")]
    config: Option<String>,

    /// Proxy port
    #[arg(short, long, env = "HOVERFLY_PROXY_PORT")]
    port: Option<u16>,

    /// Regular expression selecting intercepted hosts
    #[arg(short, long, env = "HOVERFLY_DESTINATION")]
    destination: Option<String>,

    /// Start in capture mode
    #[arg(long, group = "mode")]
    capture: bool,

    /// Start in synthesize mode (requires --middleware)
    #[arg(long, group = "mode")]
    synthesize: bool,

    /// Start in modify mode (requires --middleware)
    #[arg(long, group = "mode")]
    modify: bool,

    /// Middleware command, run through `sh -c`
    #[arg(short, long, env = "HOVERFLY_MIDDLEWARE")]
    middleware: Option<String>,

    /// Verify upstream TLS certificates
    #[arg(long, env = "HOVERFLY_TLS_VERIFY")]
    tls_verify: Option<bool>,

    /// Log every request
    #[arg(short, long)]
    verbose: bool,

    /// Delay (ms) applied to simulated responses
    #[arg(long, env = "HOVERFLY_RESPONSE_DELAY")]
    response_delay: Option<u64>,

    /// CONNECT strategy for intercepted hosts: intercept or relay
    #[arg(long, env = "HOVERFLY_TUNNEL")]
    tunnel: Option<TunnelStrategy>,

    /// CA certificate (PEM) used to sign intercept certificates
    #[arg(long, requires = "ca_key")]
    ca_cert: Option<String>,

    /// CA private key (PEM)
    #[arg(long, requires = "ca_cert")]
    ca_key: Option<String>,

    /// JSON file the cache is loaded from and saved to
    #[arg(long, env = "HOVERFLY_CACHE_FILE")]
    cache_file: Option<String>,
}

impl Args {
    fn mode(&self) -> Option<ProxyMode> {
        if self.capture {
            Some(ProxyMode::Capture)
        } else if self.synthesize {
            Some(ProxyMode::Synthesize)
        } else if self.modify {
            Some(ProxyMode::Modify)
        } else {
            None
        }
    }

    /// Load the config file (or defaults) and apply command-line overrides.
    fn into_config(self) -> Result<Config, anyhow::Error> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };

        if let Some(mode) = self.mode() {
            config.mode = mode;
        }
        if let Some(port) = self.port {
            config.listen.port = port;
        }
        if let Some(destination) = self.destination {
            config.destination = destination;
        }
        if let Some(middleware) = self.middleware {
            config.middleware = Some(middleware);
        }
        if let Some(tls_verify) = self.tls_verify {
            config.tls_verify = tls_verify;
        }
        if let Some(delay) = self.response_delay {
            config.response_delay_ms = delay;
        }
        if let Some(strategy) = self.tunnel {
            config.tunnel.strategy = strategy;
        }
        if self.ca_cert.is_some() {
            config.tunnel.ca.cert_path = self.ca_cert;
            config.tunnel.ca.key_path = self.ca_key;
        }
        if let Some(path) = self.cache_file {
            config.cache.path = Some(path);
        }
        config.verbose |= self.verbose;

        config.validate()?;
        Ok(config)
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let config = Args::parse().into_config()?;
    init_tracing(config.verbose);

    info!("Starting hoverfly-proxy in {} mode", config.mode);
    let report_interval = config.metrics.log_interval_secs;
    let server = Arc::new(ProxyServer::new(config)?);

    if let Some(secs) = report_interval.filter(|secs| *secs > 0) {
        server
            .hoverfly()
            .counter()
            .spawn_reporter(Duration::from_secs(secs));
    }

    server
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
}
