//! ProxyServer struct and accept loop.
//!
//! Each accepted connection gets its own task serving HTTP/1.1 with
//! upgrades enabled, so CONNECT can hand the socket over to a tunnel.

use super::ca::CertificateAuthority;
use super::forwarding::{forward_transparent, text_response};
use super::handler::Hoverfly;
use super::network::bind_listener;
use super::response_ext::{ProxyBody, ResponseExt};
use super::tunnel::handle_connect;
use crate::cache::{Cache, InMemoryCache};
use crate::config::{CaConfig, Config, RuntimeConfig};
use crate::metrics::ModeCounter;
use crate::middleware::{CommandMiddleware, Middleware};
use crate::models::request_host;
use anyhow::Context;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub struct ProxyServer {
    listen_addr: String,
    hoverfly: Arc<Hoverfly>,
    ca: Arc<CertificateAuthority>,
    persistence: Option<(Arc<InMemoryCache>, PathBuf)>,
}

impl ProxyServer {
    /// Build a server with the default in-memory cache and, when configured,
    /// the command middleware.
    pub fn new(config: Config) -> Result<Self, anyhow::Error> {
        config.validate()?;
        let runtime = Arc::new(RuntimeConfig::from_config(&config)?);

        let cache = Arc::new(InMemoryCache::new());
        let cache_path = config.cache.path.as_ref().map(PathBuf::from);
        if let Some(path) = &cache_path {
            cache
                .load_from_file(path)
                .with_context(|| format!("Failed to load cache file {}", path.display()))?;
        }

        let middleware = runtime.middleware().map(|command| {
            Arc::new(CommandMiddleware::new(command, runtime.middleware_timeout()))
                as Arc<dyn Middleware>
        });

        let mut server = Self::assemble(&config, runtime, cache.clone(), middleware)?;
        server.persistence = cache_path.map(|path| (cache, path));
        Ok(server)
    }

    /// Build a server around caller-provided cache and middleware.
    pub fn with_parts(
        config: Config,
        cache: Arc<dyn Cache>,
        middleware: Option<Arc<dyn Middleware>>,
    ) -> Result<Self, anyhow::Error> {
        config.validate()?;
        let runtime = Arc::new(RuntimeConfig::from_config(&config)?);
        Self::assemble(&config, runtime, cache, middleware)
    }

    fn assemble(
        config: &Config,
        runtime: Arc<RuntimeConfig>,
        cache: Arc<dyn Cache>,
        middleware: Option<Arc<dyn Middleware>>,
    ) -> Result<Self, anyhow::Error> {
        let counter = Arc::new(ModeCounter::new()?);
        let ca = load_certificate_authority(&config.tunnel.ca)?;

        Ok(Self {
            listen_addr: format!("{}:{}", config.listen.address, config.listen.port),
            hoverfly: Arc::new(Hoverfly::new(runtime, cache, middleware, counter)),
            ca: Arc::new(ca),
            persistence: None,
        })
    }

    pub fn hoverfly(&self) -> &Arc<Hoverfly> {
        &self.hoverfly
    }

    pub fn certificate_authority(&self) -> &Arc<CertificateAuthority> {
        &self.ca
    }

    /// Write the cache to its configured file, if any.
    pub fn save_cache(&self) -> Result<(), anyhow::Error> {
        if let Some((cache, path)) = &self.persistence {
            cache
                .save_to_file(path)
                .with_context(|| format!("Failed to save cache file {}", path.display()))?;
        }
        Ok(())
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(self: Arc<Self>) -> Result<(), anyhow::Error> {
        let addr: SocketAddr = self
            .listen_addr
            .parse()
            .with_context(|| format!("Invalid listen address '{}'", self.listen_addr))?;
        let listener = bind_listener(addr)?;
        self.serve(listener).await
    }

    /// Serve until `shutdown` resolves or the listener fails, then save the
    /// cache. The cache is saved on both paths.
    pub async fn run_until<F>(self: Arc<Self>, shutdown: F) -> Result<(), anyhow::Error>
    where
        F: std::future::Future<Output = ()>,
    {
        let result = tokio::select! {
            result = Arc::clone(&self).run() => result,
            _ = shutdown => {
                info!("Shutting down");
                Ok(())
            }
        };
        if let Err(e) = &result {
            error!("Proxy server stopped: {:#}", e);
        }

        self.save_cache()?;
        result
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), anyhow::Error> {
        let config = self.hoverfly.config();
        info!("Listening on {}", listener.local_addr()?);
        info!(
            destination = config.destination(),
            mode = %config.mode(),
            tunnel = %config.tunnel_strategy(),
            middleware = config.middleware().unwrap_or(""),
            "Proxy ready"
        );

        loop {
            let (stream, remote_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    error!("Failed to accept connection: {}", err);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            };
            let _ = stream.set_nodelay(true);
            let server = Arc::clone(&self);

            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let server = Arc::clone(&server);
                    async move { server.handle_request(req).await }
                });

                if let Err(err) = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .with_upgrades()
                    .await
                {
                    error!("Error serving connection from {}: {}", remote_addr, err);
                }
            });
        }
    }

    async fn handle_request(
        &self,
        req: Request<Incoming>,
    ) -> Result<Response<ProxyBody>, Infallible> {
        if req.method() == Method::CONNECT {
            return Ok(handle_connect(Arc::clone(&self.hoverfly), Arc::clone(&self.ca), req).await);
        }

        self.hoverfly.log_request(&req);
        let (parts, body) = req.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!(error = %e, "Failed to read request body");
                return Ok(
                    text_response(StatusCode::BAD_REQUEST, "Failed to read request body\n")
                        .into_boxed(),
                );
            }
        };
        let req = Request::from_parts(parts, body);

        let intercepted = request_host(&req)
            .is_some_and(|host| self.hoverfly.config().matches_destination(&host));
        let response = if intercepted {
            self.hoverfly.process_request(req).await
        } else {
            forward_transparent(self.hoverfly.upstream(), req).await
        };
        Ok(response.into_boxed())
    }
}

fn load_certificate_authority(config: &CaConfig) -> Result<CertificateAuthority, anyhow::Error> {
    let ca = match (&config.cert_path, &config.key_path) {
        (Some(cert), Some(key)) => {
            let ca = CertificateAuthority::from_pem_files(cert, key)
                .with_context(|| format!("Failed to load CA from {cert} and {key}"))?;
            info!("Loaded CA certificate from {}", cert);
            ca
        }
        _ => {
            let ca = CertificateAuthority::generate()?;
            info!("Generated ephemeral CA certificate");
            ca
        }
    };

    if let Some(path) = &config.export_path {
        std::fs::write(path, ca.cert_pem())
            .with_context(|| format!("Failed to export CA certificate to {path}"))?;
        info!("Exported CA certificate to {}", path);
    }
    Ok(ca)
}
