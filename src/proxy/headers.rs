//! Header hygiene at the proxy boundary.

use http::header::{self, HeaderMap, HeaderName, HeaderValue};

/// Diagnostic header naming the branch that served the response.
pub const X_PROXY_CACHE: HeaderName = HeaderName::from_static("x-proxy-cache");
/// Origin round-trip time in milliseconds.
pub const X_PROXY_LATENCY: HeaderName = HeaderName::from_static("x-proxy-latency");

/// Connection-scoped headers that must never cross the proxy.
const HOP_BY_HOP: [&str; 10] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// Removes hop-by-hop headers, including any extra names listed in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(&name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Builds the header set sent to origin for an inbound request.
///
/// Hop-by-hop headers, `Host` and `Content-Length` are dropped (the client
/// sets both for the new hop), `Accept-Encoding` is pinned to `identity` so
/// bodies arrive uncompressed and cacheable, and a resolved session token
/// replaces any inbound `Authorization`.
pub fn forward_request_headers(inbound: &HeaderMap, bearer_token: Option<&str>) -> HeaderMap {
    let mut headers = inbound.clone();
    strip_hop_by_hop(&mut headers);
    headers.remove(header::HOST);
    headers.remove(header::CONTENT_LENGTH);
    headers.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("identity"));

    if let Some(token) = bearer_token {
        match HeaderValue::from_str(&format!("Bearer {}", token)) {
            Ok(mut value) => {
                value.set_sensitive(true);
                headers.insert(header::AUTHORIZATION, value);
            }
            Err(_) => tracing::warn!("Session token is not a valid header value; not forwarded"),
        }
    }

    headers
}

/// Whether the request carries `Cache-Control: no-store`.
pub fn requests_no_store(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::CACHE_CONTROL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|d| d.trim().eq_ignore_ascii_case("no-store"))
}
