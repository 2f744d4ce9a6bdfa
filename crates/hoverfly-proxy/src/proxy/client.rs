//! Upstream HTTP client.
//!
//! Used for live round trips in capture and modify modes and for
//! transparent forwarding of non-intercepted requests.

use super::tls::{install_crypto_provider, NoVerifier};
use crate::config::RuntimeConfig;
use crate::models::{ModelError, RequestDetails, ResponseDetails};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::http::response::Parts;
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Type alias for the HTTP client used by the proxy.
pub type HttpClient = Client<hyper_rustls::HttpsConnector<HttpConnector>, Full<Bytes>>;

/// Live upstream round-trip failures
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("invalid upstream request: {0}")]
    InvalidRequest(#[from] ModelError),
    #[error("{0}")]
    Request(String),
    #[error("failed to read upstream response body: {0}")]
    Body(#[from] hyper::Error),
    #[error("upstream request timed out after {0:?}")]
    Timeout(Duration),
}

/// Shared client honouring the configured TLS verification policy
#[derive(Clone)]
pub struct UpstreamClient {
    client: HttpClient,
    timeout: Duration,
}

impl UpstreamClient {
    pub fn new(config: &RuntimeConfig) -> Self {
        install_crypto_provider();

        let mut http_connector = HttpConnector::new();
        http_connector.set_connect_timeout(Some(config.upstream_connect_timeout()));
        http_connector.enforce_http(false); // Allow both HTTP and HTTPS

        let https_connector = if config.tls_verify() {
            hyper_rustls::HttpsConnectorBuilder::new()
                .with_webpki_roots()
                .https_or_http()
                .enable_http1()
                .wrap_connector(http_connector)
        } else {
            warn!("Upstream TLS certificate verification DISABLED");
            hyper_rustls::HttpsConnectorBuilder::new()
                .with_tls_config(
                    rustls::ClientConfig::builder()
                        .dangerous()
                        .with_custom_certificate_verifier(Arc::new(NoVerifier))
                        .with_no_client_auth(),
                )
                .https_or_http()
                .enable_http1()
                .wrap_connector(http_connector)
        };

        Self {
            client: Client::builder(TokioExecutor::new()).build(https_connector),
            timeout: config.upstream_request_timeout(),
        }
    }

    /// Perform a live round trip for a serialized request.
    pub async fn send(&self, request: &RequestDetails) -> Result<ResponseDetails, UpstreamError> {
        let req = request.to_request()?;
        debug!("Sending upstream request to {}", request.uri());
        let (parts, body) = self.round_trip(req).await?;
        Ok(ResponseDetails::from_parts(
            parts.status.as_u16(),
            &parts.headers,
            &body,
        ))
    }

    /// Forward a live request and buffer the response.
    pub async fn forward(
        &self,
        req: Request<Full<Bytes>>,
    ) -> Result<Response<Full<Bytes>>, UpstreamError> {
        let (parts, body) = self.round_trip(req).await?;
        Ok(Response::from_parts(parts, Full::new(body)))
    }

    async fn round_trip(&self, req: Request<Full<Bytes>>) -> Result<(Parts, Bytes), UpstreamError> {
        let exchange = async {
            let response = self
                .client
                .request(req)
                .await
                .map_err(|e| UpstreamError::Request(error_chain(&e)))?;
            let (parts, body) = response.into_parts();
            let body = body.collect().await?.to_bytes();
            Ok::<_, UpstreamError>((parts, body))
        };

        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| UpstreamError::Timeout(self.timeout))?
    }
}

/// Render an error with its sources, e.g. `client error (Connect): tcp connect error: refused`.
fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
