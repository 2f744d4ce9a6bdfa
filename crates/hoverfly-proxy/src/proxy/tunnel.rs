//! CONNECT handling.
//!
//! A CONNECT to a host outside the destination pattern becomes a pure byte
//! tunnel. A matching CONNECT uses the configured strategy: decrypting
//! intercept (TLS terminated with a minted certificate, requests served by
//! the mode dispatcher) or raw relay of HTTP/1.1 messages.

use super::ca::{CaError, CertificateAuthority};
use super::forwarding::text_response;
use super::handler::Hoverfly;
use super::relay::relay;
use super::response_ext::{empty, ProxyBody, ResponseExt};
use crate::config::TunnelStrategy;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::HOST;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

/// Tunnel failures. They end the tunnel, never the proxy.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("failed to connect to {target}: {source}")]
    Dial {
        target: String,
        #[source]
        source: std::io::Error,
    },
    #[error("tunnel I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed HTTP message: {0}")]
    Parse(#[from] httparse::Error),
    #[error("message head exceeds size limit")]
    HeadTooLarge,
    #[error("connection closed mid-message")]
    Truncated,
    #[error("invalid content-length")]
    InvalidContentLength,
    #[error("invalid chunk size")]
    InvalidChunk,
    #[error("remote closed the connection")]
    RemoteClosed,
    #[error("remote sent data without a request")]
    UnexpectedData,
    #[error("connection upgrade failed: {0}")]
    Upgrade(#[from] hyper::Error),
    #[error(transparent)]
    Certificate(#[from] CaError),
}

/// Answer a CONNECT request and spawn the tunnel behind it.
pub async fn handle_connect(
    hoverfly: Arc<Hoverfly>,
    ca: Arc<CertificateAuthority>,
    req: Request<Incoming>,
) -> Response<ProxyBody> {
    let Some(target) = req.uri().authority().map(|a| a.to_string()) else {
        warn!(uri = %req.uri(), "CONNECT without host:port");
        return text_response(StatusCode::BAD_REQUEST, "CONNECT must be to host:port\n")
            .into_boxed();
    };

    if !hoverfly.config().matches_destination(&target) {
        return passthrough(req, target).await;
    }

    match hoverfly.config().tunnel_strategy() {
        TunnelStrategy::Intercept => {
            let tls = match ca.server_config(&target) {
                Ok(config) => TlsAcceptor::from(config),
                Err(e) => {
                    warn!(destination = %target, error = %e, "Could not issue certificate");
                    return text_response(
                        StatusCode::BAD_GATEWAY,
                        format!("Could not issue certificate for {target}: {e}\n"),
                    )
                    .into_boxed();
                }
            };
            tokio::spawn(async move {
                if let Err(e) = intercept(hoverfly, tls, req, &target).await {
                    warn!(destination = %target, error = %e, "Intercepted tunnel failed");
                }
            });
        }
        TunnelStrategy::Relay => {
            tokio::spawn(async move {
                match hyper::upgrade::on(req).await {
                    Ok(upgraded) => relay(TokioIo::new(upgraded), &target).await,
                    Err(e) => warn!(destination = %target, error = %e, "Upgrade failed"),
                }
            });
        }
    }

    Response::new(empty())
}

/// Byte tunnel to a host outside the destination pattern. The target is
/// dialed before the client is told the tunnel is up.
async fn passthrough(req: Request<Incoming>, target: String) -> Response<ProxyBody> {
    let mut remote = match TcpStream::connect(&target).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(destination = %target, error = %e, "Passthrough dial failed");
            return text_response(StatusCode::BAD_GATEWAY, format!("Bad Gateway: {e}\n"))
                .into_boxed();
        }
    };

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let mut client = TokioIo::new(upgraded);
                match tokio::io::copy_bidirectional(&mut client, &mut remote).await {
                    Ok((up, down)) => {
                        debug!(destination = %target, up, down, "Passthrough tunnel closed")
                    }
                    Err(e) => debug!(destination = %target, error = %e, "Passthrough tunnel error"),
                }
            }
            Err(e) => warn!(destination = %target, error = %e, "Upgrade failed"),
        }
    });

    Response::new(empty())
}

/// Terminate TLS on the upgraded connection and serve its requests
/// through the mode dispatcher.
async fn intercept(
    hoverfly: Arc<Hoverfly>,
    tls: TlsAcceptor,
    req: Request<Incoming>,
    target: &str,
) -> Result<(), TunnelError> {
    let upgraded = hyper::upgrade::on(req).await?;
    let stream = tls.accept(TokioIo::new(upgraded)).await?;
    debug!(destination = %target, "TLS intercept established");

    let authority = target.to_string();
    let service = service_fn(move |req: Request<Incoming>| {
        let hoverfly = Arc::clone(&hoverfly);
        let authority = authority.clone();
        async move { Ok::<_, Infallible>(serve_intercepted(&hoverfly, &authority, req).await) }
    });

    http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .await?;
    Ok(())
}

async fn serve_intercepted(
    hoverfly: &Hoverfly,
    authority: &str,
    req: Request<Incoming>,
) -> Response<ProxyBody> {
    let (mut parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(error = %e, "Failed to read intercepted request body");
            return text_response(StatusCode::BAD_REQUEST, "Failed to read request body\n")
                .into_boxed();
        }
    };

    parts.uri = match intercepted_uri(&parts.uri, &parts.headers, authority) {
        Some(uri) => uri,
        None => {
            return text_response(StatusCode::BAD_REQUEST, "Invalid request URI\n").into_boxed();
        }
    };

    let req = Request::from_parts(parts, body);
    hoverfly.log_request(&req);
    hoverfly.process_request(req).await.into_boxed()
}

/// `https://<host><path>` for a request received inside a TLS tunnel.
fn intercepted_uri(uri: &Uri, headers: &hyper::HeaderMap, authority: &str) -> Option<Uri> {
    let host = headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or(authority);
    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    format!("https://{host}{path}").parse().ok()
}
