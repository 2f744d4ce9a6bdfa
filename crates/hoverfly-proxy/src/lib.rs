//! Service virtualization forward proxy.
//!
//! Captures live HTTP(S) traffic, replays it from a cache, synthesizes
//! responses through middleware, or lets middleware rewrite traffic in
//! flight, depending on the active [`ProxyMode`].

pub mod cache;
pub mod config;
pub mod fingerprint;
pub mod metrics;
pub mod middleware;
pub mod mode;
pub mod models;
pub mod proxy;

pub use cache::{Cache, CacheError, InMemoryCache};
pub use config::{Config, RuntimeConfig};
pub use fingerprint::Fingerprint;
pub use metrics::ModeCounter;
pub use middleware::{CommandMiddleware, Middleware, MiddlewareError};
pub use mode::ProxyMode;
pub use models::{CapturedPair, Payload, RequestDetails, ResponseDetails};
pub use proxy::{Hoverfly, ProxyServer};
