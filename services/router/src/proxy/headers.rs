//! Request and response header preparation.

use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use http::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, TE, TRANSFER_ENCODING, UPGRADE};
use http::uri::{PathAndQuery, Uri};
use http::{Request, Response, Version};

pub const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
pub const X_FORWARDED_PORT: HeaderName = HeaderName::from_static("x-forwarded-port");
pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
pub const X_REQUEST_START: HeaderName = HeaderName::from_static("x-request-start");
pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

const TRAILERS: HeaderName = HeaderName::from_static("trailers");

/// Per-hop headers stripped in both directions.
const HOP_HEADERS: [HeaderName; 3] = [TE, TRAILERS, TRANSFER_ENCODING];

/// Listener-side facts written into forwarded headers.
#[derive(Debug, Clone, Copy)]
pub struct Forwarded {
    pub proto: &'static str,
    pub port: u16,
    pub client_ip: IpAddr,
}

/// Whether the `Connection` header carries the `upgrade` token.
pub fn is_upgrade(headers: &HeaderMap) -> bool {
    connection_tokens(headers).any(|token| token.eq_ignore_ascii_case("upgrade"))
}

fn connection_tokens(headers: &HeaderMap) -> impl Iterator<Item = &str> {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

fn strip_hop_headers(headers: &mut HeaderMap, upgrade: bool) {
    for name in &HOP_HEADERS {
        headers.remove(name);
    }
    if upgrade {
        return;
    }
    let listed: Vec<HeaderName> = connection_tokens(headers)
        .filter_map(|t| HeaderName::from_bytes(t.as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    headers.remove(CONNECTION);
    headers.remove(UPGRADE);
}

/// Append `value` to `name`, joining with any prior values by `", "`.
fn append_forwarded(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    let prior: Vec<&str> = headers
        .get_all(&name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    let joined = if prior.is_empty() {
        value.to_string()
    } else {
        format!("{}, {}", prior.join(", "), value)
    };
    if let Ok(value) = HeaderValue::from_str(&joined) {
        headers.insert(name, value);
    }
}

/// Origin-form request target, kept verbatim.
///
/// Absolute-form targets are reduced to their path and query; a target
/// starting with `//` is passed through as a path rather than re-parsed as an
/// authority.
fn outbound_uri(uri: &Uri) -> Uri {
    let target = uri
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"));
    Uri::from(target)
}

/// Rewrite an inbound request for a plaintext HTTP/1.1 backend.
pub fn prepare_request<B>(req: Request<B>, forwarded: &Forwarded) -> Request<B> {
    let (mut parts, body) = req.into_parts();
    let upgrade = is_upgrade(&parts.headers);

    parts.uri = outbound_uri(&parts.uri);
    parts.version = Version::HTTP_11;

    let headers = &mut parts.headers;
    strip_hop_headers(headers, upgrade);
    append_forwarded(headers, X_FORWARDED_PROTO, forwarded.proto);
    append_forwarded(headers, X_FORWARDED_PORT, &forwarded.port.to_string());
    append_forwarded(headers, X_FORWARDED_FOR, &forwarded.client_ip.to_string());

    let start_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    headers.insert(X_REQUEST_START, HeaderValue::from(start_ms as u64));
    if let Ok(id) = HeaderValue::from_str(&uuid::Uuid::new_v4().to_string()) {
        headers.insert(X_REQUEST_ID, id);
    }

    Request::from_parts(parts, body)
}

/// Strip per-hop headers from a backend response.
pub fn prepare_response<B>(res: &mut Response<B>) {
    let upgrade = is_upgrade(res.headers());
    strip_hop_headers(res.headers_mut(), upgrade);
}
