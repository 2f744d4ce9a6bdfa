//! Mode dispatch and the four mode handlers.
//!
//! [`Hoverfly::process_request`] reads the active mode once, runs exactly one
//! handler and counts the response under that mode whatever the outcome.
//! Handler failures never escape as errors: they are logged with the
//! request's coordinates and turned into plain-text error responses.

use super::client::{UpstreamClient, UpstreamError};
use super::forwarding::{hoverfly_error, hoverfly_error_with_status};
use crate::cache::{Cache, CacheError};
use crate::config::RuntimeConfig;
use crate::fingerprint::Fingerprint;
use crate::metrics::ModeCounter;
use crate::middleware::{Middleware, MiddlewareError};
use crate::mode::ProxyMode;
use crate::models::{request_host, CapturedPair, ModelError, Payload, RequestDetails};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Request, Response, StatusCode};
use std::sync::Arc;
use tracing::{debug, error, info};

type HandlerResult = Result<Response<Full<Bytes>>, HandlerError>;

/// Handler-level failures
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error(transparent)]
    Middleware(#[from] MiddlewareError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("no captured response for fingerprint {0}")]
    NotCaptured(Fingerprint),
}

/// The mode dispatcher with its collaborators
pub struct Hoverfly {
    config: Arc<RuntimeConfig>,
    cache: Arc<dyn Cache>,
    middleware: Option<Arc<dyn Middleware>>,
    upstream: UpstreamClient,
    counter: Arc<ModeCounter>,
}

impl Hoverfly {
    pub fn new(
        config: Arc<RuntimeConfig>,
        cache: Arc<dyn Cache>,
        middleware: Option<Arc<dyn Middleware>>,
        counter: Arc<ModeCounter>,
    ) -> Self {
        let upstream = UpstreamClient::new(&config);
        Self {
            config,
            cache,
            middleware,
            upstream,
            counter,
        }
    }

    pub fn config(&self) -> &Arc<RuntimeConfig> {
        &self.config
    }

    pub fn cache(&self) -> &Arc<dyn Cache> {
        &self.cache
    }

    pub fn counter(&self) -> &Arc<ModeCounter> {
        &self.counter
    }

    pub fn upstream(&self) -> &UpstreamClient {
        &self.upstream
    }

    pub fn mode(&self) -> ProxyMode {
        self.config.mode()
    }

    pub fn set_mode(&self, mode: ProxyMode) {
        self.config.set_mode(mode);
    }

    /// Verbose log line for a request reaching the proxy, intercepted or not.
    pub fn log_request<B>(&self, req: &Request<B>) {
        if self.config.verbose() {
            debug!(
                mode = %self.config.mode(),
                method = %req.method(),
                destination = %request_host(req).unwrap_or_default(),
                path = %req.uri().path(),
                rawQuery = %req.uri().query().unwrap_or(""),
                "got request.."
            );
        }
    }

    /// Produce exactly one response for an intercepted request.
    ///
    /// The request URI must be in absolute form (or carry a Host header).
    pub async fn process_request(&self, req: Request<Bytes>) -> Response<Full<Bytes>> {
        let mode = self.config.mode();
        let request = RequestDetails::from_request(&req);

        let response = match mode {
            ProxyMode::Capture => self.handle_capture(&request).await,
            ProxyMode::Simulate => self.handle_simulate(&request).await,
            ProxyMode::Synthesize => self.handle_synthesize(&request).await,
            ProxyMode::Modify => self.handle_modify(&request).await,
        };

        let response = response.unwrap_or_else(|e| self.failure_response(mode, &request, e));
        self.counter.count(mode);
        response
    }

    /// Live round trip, then store the pair. Nothing is stored on failure.
    async fn handle_capture(&self, request: &RequestDetails) -> HandlerResult {
        let response = self.upstream.send(request).await?;
        let live = response.to_response()?;

        let pair = CapturedPair::new(request.clone(), response);
        let fingerprint = pair.fingerprint;
        self.cache.put(fingerprint, pair)?;

        info!(
            mode = %ProxyMode::Capture,
            method = %request.method,
            destination = %request.destination,
            path = %request.path,
            rawQuery = %request.query,
            fingerprint = %fingerprint,
            status = live.status().as_u16(),
            "request and response captured"
        );
        Ok(live)
    }

    async fn handle_simulate(&self, request: &RequestDetails) -> HandlerResult {
        let fingerprint = request.fingerprint();
        let pair = self
            .cache
            .get(&fingerprint)?
            .ok_or(HandlerError::NotCaptured(fingerprint))?;
        let response = pair.response.to_response()?;

        let delay = self.config.response_delay();
        if !delay.is_zero() {
            debug!(delay_ms = delay.as_millis() as u64, "Delaying simulated response");
            tokio::time::sleep(delay).await;
        }
        Ok(response)
    }

    /// Middleware builds the whole response; upstream is never contacted.
    async fn handle_synthesize(&self, request: &RequestDetails) -> HandlerResult {
        let middleware = self.middleware()?;
        let payload = middleware
            .transform(Payload::from_request(request.clone()))
            .await?;
        let response = payload.response.ok_or(MiddlewareError::MissingResponse)?;

        info!(
            mode = %ProxyMode::Synthesize,
            middleware = middleware.name(),
            path = %request.path,
            status = response.status,
            "synthetic response created"
        );
        Ok(response.to_response()?)
    }

    /// Middleware on the way out, live call, middleware on the way back.
    ///
    /// A failed transform aborts the exchange before anything partial is
    /// sent or returned.
    async fn handle_modify(&self, request: &RequestDetails) -> HandlerResult {
        let middleware = self.middleware()?;

        let outbound = middleware
            .transform(Payload::from_request(request.clone()))
            .await?;
        let response = self.upstream.send(&outbound.request).await?;

        let inbound = middleware
            .transform(Payload {
                request: outbound.request,
                response: Some(response),
            })
            .await?;
        let response = inbound.response.ok_or(MiddlewareError::MissingResponse)?;
        Ok(response.to_response()?)
    }

    fn middleware(&self) -> Result<&dyn Middleware, MiddlewareError> {
        self.middleware
            .as_deref()
            .ok_or(MiddlewareError::NotConfigured)
    }

    fn failure_response(
        &self,
        mode: ProxyMode,
        request: &RequestDetails,
        err: HandlerError,
    ) -> Response<Full<Bytes>> {
        let middleware = self.middleware.as_ref().map(|m| m.name()).unwrap_or("");
        error!(
            mode = %mode,
            middleware,
            method = %request.method,
            destination = %request.destination,
            path = %request.path,
            rawQuery = %request.query,
            error = %err,
            "Request handling failed"
        );

        match (mode, &err) {
            (_, HandlerError::NotCaptured(_)) => hoverfly_error_with_status(
                StatusCode::PRECONDITION_FAILED,
                "Could not find recorded request, please record it first!",
                &err,
            ),
            (ProxyMode::Capture, _) => hoverfly_error("Could not capture request", &err),
            (ProxyMode::Simulate, _) => hoverfly_error("Could not retrieve recorded response", &err),
            (ProxyMode::Synthesize, _) => hoverfly_error(
                &format!("Could not create synthetic response with middleware ({middleware})"),
                &err,
            ),
            (ProxyMode::Modify, _) => hoverfly_error(
                &format!("Middleware ({middleware}) failed or something else happened!"),
                &err,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;
    use crate::config::Config;
    use crate::models::ResponseDetails;
    use async_trait::async_trait;
    use http_body_util::BodyExt;
    use hyper::body::Incoming;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper_util::rt::TokioIo;
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};
    use tokio::net::TcpListener;

    struct FnMiddleware<F>(F);

    #[async_trait]
    impl<F> Middleware for FnMiddleware<F>
    where
        F: Fn(Payload) -> Result<Payload, MiddlewareError> + Send + Sync,
    {
        fn name(&self) -> &str {
            "test-middleware"
        }

        async fn transform(&self, payload: Payload) -> Result<Payload, MiddlewareError> {
            (self.0)(payload)
        }
    }

    struct BrokenCache;

    impl Cache for BrokenCache {
        fn put(&self, _: Fingerprint, _: CapturedPair) -> Result<(), CacheError> {
            Err(CacheError::Storage("disk full".to_string()))
        }
        fn get(&self, _: &Fingerprint) -> Result<Option<CapturedPair>, CacheError> {
            Err(CacheError::Storage("disk full".to_string()))
        }
        fn records(&self) -> Result<Vec<CapturedPair>, CacheError> {
            Ok(Vec::new())
        }
        fn len(&self) -> usize {
            0
        }
        fn clear(&self) -> Result<(), CacheError> {
            Ok(())
        }
    }

    /// Upstream answering `upstream <METHOD> <path>` and counting hits.
    async fn spawn_upstream(hits: Arc<AtomicUsize>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let hits = Arc::clone(&hits);
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let hits = Arc::clone(&hits);
                        async move {
                            hits.fetch_add(1, Ordering::SeqCst);
                            let body = format!("upstream {} {}", req.method(), req.uri().path());
                            Ok::<_, Infallible>(
                                Response::builder()
                                    .header("x-upstream", "yes")
                                    .body(Full::new(Bytes::from(body)))
                                    .unwrap(),
                            )
                        }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });
        addr
    }

    fn hoverfly(
        mode: ProxyMode,
        cache: Arc<dyn Cache>,
        middleware: Option<Arc<dyn Middleware>>,
        delay_ms: u64,
    ) -> Hoverfly {
        let config = Config {
            mode,
            response_delay_ms: delay_ms,
            ..Default::default()
        };
        Hoverfly::new(
            Arc::new(RuntimeConfig::from_config(&config).unwrap()),
            cache,
            middleware,
            Arc::new(ModeCounter::new().unwrap()),
        )
    }

    fn get(addr: SocketAddr, path: &str) -> Request<Bytes> {
        Request::get(format!("http://{addr}{path}"))
            .body(Bytes::new())
            .unwrap()
    }

    async fn body_text(response: Response<Full<Bytes>>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_capture_then_simulate() {
        let hits = Arc::new(AtomicUsize::new(0));
        let addr = spawn_upstream(Arc::clone(&hits)).await;
        let cache = Arc::new(InMemoryCache::new());
        let hf = hoverfly(ProxyMode::Capture, cache.clone(), None, 0);

        let captured = hf.process_request(get(addr, "/foo")).await;
        assert_eq!(captured.status(), 200);
        assert_eq!(captured.headers()["x-upstream"], "yes");
        assert_eq!(body_text(captured).await, "upstream GET /foo");

        let fingerprint = Fingerprint::compute("GET", &addr.to_string(), "/foo", "", b"");
        let pair = cache.get(&fingerprint).unwrap().unwrap();
        assert_eq!(pair.response.body, "upstream GET /foo");

        hf.set_mode(ProxyMode::Simulate);
        let replayed = hf.process_request(get(addr, "/foo")).await;
        assert_eq!(replayed.status(), 200);
        assert_eq!(replayed.headers()["x-upstream"], "yes");
        assert_eq!(body_text(replayed).await, "upstream GET /foo");

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(hf.counter().get(ProxyMode::Capture), 1);
        assert_eq!(hf.counter().get(ProxyMode::Simulate), 1);
    }

    #[tokio::test]
    async fn test_capture_failure_stores_nothing() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let cache = Arc::new(InMemoryCache::new());
        let hf = hoverfly(ProxyMode::Capture, cache.clone(), None, 0);
        let response = hf.process_request(get(addr, "/down")).await;

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(body_text(response)
            .await
            .starts_with("Hoverfly Error! Could not capture request. Got error: "));
        assert!(cache.is_empty());
        assert_eq!(hf.counter().get(ProxyMode::Capture), 1);
    }

    #[tokio::test]
    async fn test_capture_cache_write_failure() {
        let hits = Arc::new(AtomicUsize::new(0));
        let addr = spawn_upstream(hits).await;
        let hf = hoverfly(ProxyMode::Capture, Arc::new(BrokenCache), None, 0);

        let response = hf.process_request(get(addr, "/foo")).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            body_text(response).await,
            "Hoverfly Error! Could not capture request. Got error: cache storage error: disk full\n"
        );
    }

    #[tokio::test]
    async fn test_simulate_miss_is_precondition_failed() {
        let hf = hoverfly(ProxyMode::Simulate, Arc::new(InMemoryCache::new()), None, 0);
        let response = hf.process_request(get("127.0.0.1:1".parse().unwrap(), "/x")).await;

        assert_eq!(response.status(), StatusCode::PRECONDITION_FAILED);
        let body = body_text(response).await;
        assert!(body.starts_with(
            "Hoverfly Error! Could not find recorded request, please record it first!. \
             Got error: no captured response for fingerprint "
        ));
        assert_eq!(hf.counter().get(ProxyMode::Simulate), 1);
    }

    #[tokio::test]
    async fn test_simulate_lookup_failure_is_unavailable() {
        let hf = hoverfly(ProxyMode::Simulate, Arc::new(BrokenCache), None, 0);
        let response = hf.process_request(get("127.0.0.1:1".parse().unwrap(), "/x")).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_simulate_delay() {
        let cache = Arc::new(InMemoryCache::new());
        let request = RequestDetails {
            method: "GET".to_string(),
            scheme: "http".to_string(),
            destination: "example.com".to_string(),
            path: "/slow".to_string(),
            ..Default::default()
        };
        let pair = CapturedPair::new(
            request,
            ResponseDetails {
                status: 200,
                body: "slow".to_string(),
                ..Default::default()
            },
        );
        cache.put(pair.fingerprint, pair).unwrap();

        let hf = hoverfly(ProxyMode::Simulate, cache, None, 100);
        let req = Request::get("http://example.com/slow")
            .body(Bytes::new())
            .unwrap();
        let start = Instant::now();
        let response = hf.process_request(req).await;
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert_eq!(body_text(response).await, "slow");
    }

    #[tokio::test]
    async fn test_synthesize_never_contacts_upstream() {
        let hits = Arc::new(AtomicUsize::new(0));
        let addr = spawn_upstream(Arc::clone(&hits)).await;
        let middleware = FnMiddleware(|mut payload: Payload| {
            payload.response = Some(ResponseDetails {
                status: 201,
                body: format!("synthetic {}", payload.request.path),
                ..Default::default()
            });
            Ok(payload)
        });
        let hf = hoverfly(
            ProxyMode::Synthesize,
            Arc::new(InMemoryCache::new()),
            Some(Arc::new(middleware)),
            0,
        );

        let response = hf.process_request(get(addr, "/made-up")).await;
        assert_eq!(response.status(), 201);
        assert_eq!(body_text(response).await, "synthetic /made-up");
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(hf.counter().get(ProxyMode::Synthesize), 1);
    }

    #[tokio::test]
    async fn test_synthesize_failure() {
        let middleware = FnMiddleware(|_: Payload| -> Result<Payload, MiddlewareError> {
            Err(MiddlewareError::MissingResponse)
        });
        let hf = hoverfly(
            ProxyMode::Synthesize,
            Arc::new(InMemoryCache::new()),
            Some(Arc::new(middleware)),
            0,
        );

        let response = hf.process_request(get("127.0.0.1:1".parse().unwrap(), "/")).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            body_text(response).await,
            "Hoverfly Error! Could not create synthetic response with middleware (test-middleware). \
             Got error: middleware did not return a response\n"
        );
    }

    #[tokio::test]
    async fn test_synthesize_without_middleware() {
        let hf = hoverfly(ProxyMode::Synthesize, Arc::new(InMemoryCache::new()), None, 0);
        let response = hf.process_request(get("127.0.0.1:1".parse().unwrap(), "/")).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(body_text(response)
            .await
            .ends_with("Got error: middleware is not configured\n"));
    }

    #[tokio::test]
    async fn test_modify_rewrites_both_directions() {
        let hits = Arc::new(AtomicUsize::new(0));
        let addr = spawn_upstream(Arc::clone(&hits)).await;
        let middleware = FnMiddleware(|mut payload: Payload| {
            match payload.response.as_mut() {
                None => payload.request.path = "/rewritten".to_string(),
                Some(response) => response.body = format!("{} (modified)", response.body),
            }
            Ok(payload)
        });
        let hf = hoverfly(
            ProxyMode::Modify,
            Arc::new(InMemoryCache::new()),
            Some(Arc::new(middleware)),
            0,
        );

        let response = hf.process_request(get(addr, "/original")).await;
        assert_eq!(response.status(), 200);
        assert_eq!(body_text(response).await, "upstream GET /rewritten (modified)");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(hf.counter().get(ProxyMode::Modify), 1);
    }

    #[tokio::test]
    async fn test_modify_outbound_failure_sends_nothing() {
        let hits = Arc::new(AtomicUsize::new(0));
        let addr = spawn_upstream(Arc::clone(&hits)).await;
        let middleware = FnMiddleware(|_: Payload| -> Result<Payload, MiddlewareError> {
            Err(MiddlewareError::Timeout(Duration::from_millis(10)))
        });
        let hf = hoverfly(
            ProxyMode::Modify,
            Arc::new(InMemoryCache::new()),
            Some(Arc::new(middleware)),
            0,
        );

        let response = hf.process_request(get(addr, "/")).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(body_text(response)
            .await
            .starts_with("Hoverfly Error! Middleware (test-middleware) failed or something else happened!."));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_modify_inbound_failure_returns_no_partial_response() {
        let hits = Arc::new(AtomicUsize::new(0));
        let addr = spawn_upstream(Arc::clone(&hits)).await;
        let middleware = FnMiddleware(|payload: Payload| match payload.response {
            None => Ok(payload),
            Some(_) => Err(MiddlewareError::Failed {
                status: "exit status: 1".to_string(),
                stderr: "bad response".to_string(),
            }),
        });
        let hf = hoverfly(
            ProxyMode::Modify,
            Arc::new(InMemoryCache::new()),
            Some(Arc::new(middleware)),
            0,
        );

        let response = hf.process_request(get(addr, "/")).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(!body_text(response).await.contains("upstream GET"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_mode_read_once_per_request() {
        let hf = hoverfly(ProxyMode::Simulate, Arc::new(InMemoryCache::new()), None, 0);
        hf.process_request(get("127.0.0.1:1".parse().unwrap(), "/")).await;
        hf.set_mode(ProxyMode::Synthesize);
        hf.process_request(get("127.0.0.1:1".parse().unwrap(), "/")).await;

        let snapshot = hf.counter().snapshot();
        assert_eq!(snapshot["simulate"], 1);
        assert_eq!(snapshot["synthesize"], 1);
        assert_eq!(snapshot["capture"], 0);
        assert_eq!(snapshot["modify"], 0);
    }
}
