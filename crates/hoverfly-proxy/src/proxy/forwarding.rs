//! Error responses and transparent forwarding.
//!
//! Requests for hosts outside the destination pattern are forwarded as-is
//! and never reach a mode handler.

use super::client::UpstreamClient;
use super::headers::is_hop_by_hop;
use crate::models::request_host;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Request, Response, StatusCode, Uri};
use std::fmt::Display;
use tracing::{debug, error};

/// Plain-text response with the given status.
pub fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

/// Handler failure response: `503 Service Unavailable`, plain text.
pub fn hoverfly_error(message: &str, err: &dyn Display) -> Response<Full<Bytes>> {
    hoverfly_error_with_status(StatusCode::SERVICE_UNAVAILABLE, message, err)
}

pub fn hoverfly_error_with_status(
    status: StatusCode,
    message: &str,
    err: &dyn Display,
) -> Response<Full<Bytes>> {
    text_response(
        status,
        format!("Hoverfly Error! {message}. Got error: {err}\n"),
    )
}

/// Forward a request untouched to its own destination.
///
/// Hop-by-hop headers are dropped in both directions. Upstream failures
/// become `502 Bad Gateway`.
pub async fn forward_transparent(
    upstream: &UpstreamClient,
    req: Request<Bytes>,
) -> Response<Full<Bytes>> {
    let uri = match absolute_uri(&req) {
        Some(uri) => uri,
        None => {
            return text_response(StatusCode::BAD_REQUEST, "Missing request host\n");
        }
    };
    debug!("Forwarding (passthrough) to: {}", uri);

    let (mut parts, body) = req.into_parts();
    parts.uri = uri;
    strip_hop_by_hop(&mut parts.headers);

    match upstream
        .forward(Request::from_parts(parts, Full::new(body)))
        .await
    {
        Ok(mut response) => {
            strip_hop_by_hop(response.headers_mut());
            response
        }
        Err(e) => {
            error!(error = %e, "Failed to forward request to upstream");
            text_response(StatusCode::BAD_GATEWAY, format!("Bad Gateway: {e}\n"))
        }
    }
}

/// Request URI in absolute form, filling scheme and authority from the
/// Host header when the client sent origin form.
pub fn absolute_uri<B>(req: &Request<B>) -> Option<Uri> {
    if req.uri().scheme().is_some() && req.uri().authority().is_some() {
        return Some(req.uri().clone());
    }
    let host = request_host(req)?;
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    format!("http://{host}{path}").parse().ok()
}

fn strip_hop_by_hop(headers: &mut hyper::HeaderMap) {
    let names: Vec<_> = headers
        .keys()
        .filter(|name| is_hop_by_hop(name.as_str()))
        .cloned()
        .collect();
    for name in names {
        headers.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn body_text(response: Response<Full<Bytes>>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_hoverfly_error_format() {
        let response = hoverfly_error("Could not capture request", &"connection refused");
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[CONTENT_TYPE], "text/plain");
        assert_eq!(
            body_text(response).await,
            "Hoverfly Error! Could not capture request. Got error: connection refused\n"
        );
    }

    #[tokio::test]
    async fn test_error_with_custom_status() {
        let response =
            hoverfly_error_with_status(StatusCode::PRECONDITION_FAILED, "No match", &"miss");
        assert_eq!(response.status(), StatusCode::PRECONDITION_FAILED);
        assert_eq!(
            body_text(response).await,
            "Hoverfly Error! No match. Got error: miss\n"
        );
    }

    #[test]
    fn test_absolute_uri() {
        let req = Request::get("http://example.com/a?b=1").body(()).unwrap();
        assert_eq!(absolute_uri(&req).unwrap(), "http://example.com/a?b=1");

        let req = Request::get("/a?b=1")
            .header("host", "example.com:8080")
            .body(())
            .unwrap();
        assert_eq!(absolute_uri(&req).unwrap(), "http://example.com:8080/a?b=1");

        let req = Request::get("/a").body(()).unwrap();
        assert!(absolute_uri(&req).is_none());
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = hyper::HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("close"));
        headers.insert("proxy-connection", HeaderValue::from_static("keep-alive"));
        headers.insert("x-keep", HeaderValue::from_static("1"));
        strip_hop_by_hop(&mut headers);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("x-keep"));
    }
}
