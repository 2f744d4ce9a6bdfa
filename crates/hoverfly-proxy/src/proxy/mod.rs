//! Forward proxy.
//!
//! # Module Structure
//!
//! - `server` - ProxyServer struct and accept loop
//! - `handler` - mode dispatcher and the four mode handlers
//! - `forwarding` - error responses and transparent forwarding
//! - `client` - upstream HTTP client
//! - `tunnel` - CONNECT handling (intercept, relay, passthrough)
//! - `relay` - raw HTTP/1.1 message relay
//! - `ca` - certificate authority for TLS interception
//! - `tls` - crypto provider and upstream verifier
//! - `network` - listener setup

mod ca;
mod client;
mod forwarding;
mod handler;
pub(crate) mod headers;
mod network;
mod relay;
mod response_ext;
mod server;
mod tls;
mod tunnel;

pub use ca::{CaError, CertificateAuthority};
pub use client::{UpstreamClient, UpstreamError};
pub use forwarding::{hoverfly_error, hoverfly_error_with_status};
pub use handler::{HandlerError, Hoverfly};
pub use relay::CANNOT_REACH_DESTINATION;
pub use server::ProxyServer;
pub use tls::install_crypto_provider;
pub use tunnel::TunnelError;
