//! Body conversions for responses handed back to hyper.

use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::Response;
use std::convert::Infallible;

/// Proxy response body type
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

pub trait ResponseExt {
    /// Box the body so buffered and empty responses share one type.
    fn into_boxed(self) -> Response<ProxyBody>;
}

impl ResponseExt for Response<Full<Bytes>> {
    fn into_boxed(self) -> Response<ProxyBody> {
        self.map(|b| BoxBody::new(b.map_err(|never: Infallible| match never {})))
    }
}

/// Empty body, e.g. for `200 Connection established`.
pub fn empty() -> ProxyBody {
    BoxBody::new(
        http_body_util::Empty::<Bytes>::new().map_err(|never: Infallible| match never {}),
    )
}
