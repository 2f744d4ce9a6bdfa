//! Serialized request/response types shared by the cache and middleware.
//!
//! Headers use the multi-value shape `{name: [values]}` so that repeated
//! headers survive a round trip through JSON. Bodies that are not valid
//! UTF-8 are base64-encoded and flagged with `encodedBody`.

use crate::fingerprint::Fingerprint;
use crate::proxy::headers::is_hop_by_hop;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http_body_util::Full;
use hyper::header::{HeaderName, HeaderValue, CONTENT_LENGTH, HOST};
use hyper::{HeaderMap, Request, Response};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type HeaderValues = BTreeMap<String, Vec<String>>;

/// Errors converting between serialized details and live HTTP messages
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("invalid base64 body: {0}")]
    InvalidBody(#[from] base64::DecodeError),
    #[error("invalid HTTP message: {0}")]
    InvalidMessage(#[from] hyper::http::Error),
    #[error("invalid status code {0}")]
    InvalidStatus(u16),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestDetails {
    pub method: String,
    #[serde(default)]
    pub scheme: String,
    pub destination: String,
    pub path: String,
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub headers: HeaderValues,
    #[serde(default)]
    pub body: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub encoded_body: bool,
}

impl RequestDetails {
    /// Build from a buffered request whose URI is in absolute form.
    pub fn from_request(req: &Request<Bytes>) -> Self {
        let uri = req.uri();
        let (body, encoded_body) = encode_body(req.body());
        Self {
            method: req.method().as_str().to_string(),
            scheme: uri.scheme_str().unwrap_or("http").to_string(),
            destination: request_host(req).unwrap_or_default(),
            path: uri.path().to_string(),
            query: uri.query().unwrap_or_default().to_string(),
            headers: headers_to_map(req.headers()),
            body,
            encoded_body,
        }
    }

    pub fn body_bytes(&self) -> Result<Bytes, ModelError> {
        decode_body(&self.body, self.encoded_body)
    }

    pub fn fingerprint(&self) -> Fingerprint {
        let body = self
            .body_bytes()
            .unwrap_or_else(|_| Bytes::copy_from_slice(self.body.as_bytes()));
        Fingerprint::compute(
            &self.method,
            &self.destination,
            &self.path,
            &self.query,
            &body,
        )
    }

    pub fn uri(&self) -> String {
        let scheme = if self.scheme.is_empty() {
            "http"
        } else {
            &self.scheme
        };
        if self.query.is_empty() {
            format!("{scheme}://{}{}", self.destination, self.path)
        } else {
            format!("{scheme}://{}{}?{}", self.destination, self.path, self.query)
        }
    }

    /// Rebuild a live request for sending upstream.
    pub fn to_request(&self) -> Result<Request<Full<Bytes>>, ModelError> {
        let body = self.body_bytes()?;
        let mut builder = Request::builder()
            .method(self.method.as_str())
            .uri(self.uri());
        if let Some(headers) = builder.headers_mut() {
            apply_headers(headers, &self.headers, body.len());
        }
        Ok(builder.body(Full::new(body))?)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseDetails {
    pub status: u16,
    #[serde(default)]
    pub headers: HeaderValues,
    #[serde(default)]
    pub body: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub encoded_body: bool,
}

impl ResponseDetails {
    pub fn from_parts(status: u16, headers: &HeaderMap, body: &[u8]) -> Self {
        let (body, encoded_body) = encode_body(body);
        Self {
            status,
            headers: headers_to_map(headers),
            body,
            encoded_body,
        }
    }

    pub fn body_bytes(&self) -> Result<Bytes, ModelError> {
        decode_body(&self.body, self.encoded_body)
    }

    pub fn to_response(&self) -> Result<Response<Full<Bytes>>, ModelError> {
        let body = self.body_bytes()?;
        let status = hyper::StatusCode::from_u16(self.status)
            .map_err(|_| ModelError::InvalidStatus(self.status))?;
        let mut builder = Response::builder().status(status);
        if let Some(headers) = builder.headers_mut() {
            apply_headers(headers, &self.headers, body.len());
        }
        Ok(builder.body(Full::new(body))?)
    }
}

/// Middleware exchange format
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    #[serde(default)]
    pub request: RequestDetails,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<ResponseDetails>,
}

impl Payload {
    pub fn from_request(request: RequestDetails) -> Self {
        Self {
            request,
            response: None,
        }
    }
}

/// A captured request/response pair as stored in the cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedPair {
    pub fingerprint: Fingerprint,
    pub request: RequestDetails,
    pub response: ResponseDetails,
    #[serde(default = "Utc::now")]
    pub captured_at: DateTime<Utc>,
}

impl CapturedPair {
    pub fn new(request: RequestDetails, response: ResponseDetails) -> Self {
        Self {
            fingerprint: request.fingerprint(),
            request,
            response,
            captured_at: Utc::now(),
        }
    }
}

/// Host a request is addressed to: URI authority first, then the Host header.
pub fn request_host<B>(req: &Request<B>) -> Option<String> {
    req.uri()
        .authority()
        .map(|a| a.as_str().to_string())
        .or_else(|| {
            req.headers()
                .get(HOST)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
}

/// Convert a header map, dropping hop-by-hop headers.
pub fn headers_to_map(headers: &HeaderMap) -> HeaderValues {
    let mut map = HeaderValues::new();
    for (name, value) in headers {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        map.entry(name.as_str().to_string())
            .or_default()
            .push(value);
    }
    map
}

/// Copy serialized headers onto a live header map.
///
/// A `content-length` that no longer matches the body is dropped so the
/// server recomputes it.
fn apply_headers(target: &mut HeaderMap, headers: &HeaderValues, body_len: usize) {
    for (name, values) in headers {
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            continue;
        };
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        if name == CONTENT_LENGTH
            && values.first().map(String::as_str) != Some(body_len.to_string().as_str())
        {
            continue;
        }
        for value in values {
            if let Ok(value) = HeaderValue::from_str(value) {
                target.append(name.clone(), value);
            }
        }
    }
}

fn encode_body(body: &[u8]) -> (String, bool) {
    match std::str::from_utf8(body) {
        Ok(text) => (text.to_string(), false),
        Err(_) => (BASE64.encode(body), true),
    }
}

fn decode_body(body: &str, encoded: bool) -> Result<Bytes, ModelError> {
    if encoded {
        Ok(Bytes::from(BASE64.decode(body)?))
    } else {
        Ok(Bytes::copy_from_slice(body.as_bytes()))
    }
}
