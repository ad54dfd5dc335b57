//! Proxying core shared by the HTTP and TCP listeners.
//!
//! ## Architecture
//!
//! ```text
//! Listener -> Transport -> BackendCache (shuffled, sticky first) -> dial -> Backend
//!                 |
//!                 +-- HTTP: prepare headers, hyper round trip, stream response
//!                 +-- Upgrade: 101 bridges both connections
//!                 +-- TCP: bidirectional copy with half-close
//! ```

mod headers;
mod stream;
mod transport;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, CONNECTION};
use http::{HeaderValue, Response, StatusCode};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};

pub use headers::{
    is_upgrade, prepare_request, prepare_response, Forwarded, X_FORWARDED_FOR,
    X_FORWARDED_PORT, X_FORWARDED_PROTO, X_REQUEST_ID, X_REQUEST_START,
};
pub use stream::proxy_bidirectional;
pub use transport::{dial, order_backends, Transport, DIAL_TIMEOUT};

/// Body type of every response the router writes.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

pub fn full(body: impl Into<Bytes>) -> ProxyBody {
    Full::new(body.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// Plain-text response with the given status.
pub fn text_response(status: StatusCode, body: &'static str) -> Response<ProxyBody> {
    let mut res = Response::new(full(body));
    *res.status_mut() = status;
    res.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    res
}

/// Body served when no backend can take a request.
#[derive(Debug, Clone, Default)]
pub struct ErrorPage {
    html: Option<Bytes>,
}

impl ErrorPage {
    pub fn new(html: Option<Bytes>) -> Self {
        Self { html }
    }

    pub fn service_unavailable(&self) -> Response<ProxyBody> {
        let mut res = match &self.html {
            Some(html) => {
                let mut res = Response::new(full(html.clone()));
                res.headers_mut().insert(
                    CONTENT_TYPE,
                    HeaderValue::from_static("text/html; charset=utf-8"),
                );
                res
            }
            None => text_response(StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable\n"),
        };
        *res.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
        res
    }

    /// 503 for a backend that failed after the dial, closing the connection.
    pub fn upstream_failed(&self) -> Response<ProxyBody> {
        let mut res = self.service_unavailable();
        res.headers_mut()
            .insert(CONNECTION, HeaderValue::from_static("close"));
        res
    }
}
