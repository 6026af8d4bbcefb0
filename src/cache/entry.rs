use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Extensions, StatusCode};
use hyper::ext::ReasonPhrase;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use super::control::CacheControl;
use crate::proxy::headers::is_hop_by_hop;

/// A stored origin response.
///
/// Timestamps are Unix epoch milliseconds so that every proxy instance sharing
/// the store agrees on them. The body is base64-encoded inside the JSON
/// envelope, which keeps the stored value binary-safe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub url: String,
    pub status: u16,
    pub status_text: String,
    /// Response headers in origin order, hop-by-hop and framing headers removed.
    pub headers: Vec<(String, String)>,
    #[serde(with = "body_base64")]
    pub body: Bytes,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    /// Raw `Cache-Control` value as last seen from origin.
    pub cache_control: Option<String>,
    pub stored_at: u64,
    pub expires_at: u64,
    pub swr_until: u64,
}

impl CacheEntry {
    /// Builds an entry from a live origin response received at `now_ms`.
    ///
    /// Callers are expected to have checked [`is_storable_response`] first.
    pub fn from_response(
        url: &str,
        status: StatusCode,
        headers: &HeaderMap,
        body: Bytes,
        now_ms: u64,
        default_swr_secs: u64,
    ) -> Self {
        let mut entry = Self {
            url: url.to_string(),
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            headers: storable_headers(headers),
            body,
            etag: header_str(headers, &header::ETAG),
            last_modified: header_str(headers, &header::LAST_MODIFIED),
            cache_control: joined_header(headers, &header::CACHE_CONTROL),
            stored_at: now_ms,
            expires_at: now_ms,
            swr_until: now_ms,
        };
        entry.reset_windows(now_ms, default_swr_secs);
        entry
    }

    /// Directives from the stored `Cache-Control` value.
    pub fn directives(&self) -> CacheControl {
        CacheControl::parse(self.cache_control.as_deref())
    }

    /// Recomputes `stored_at`, `expires_at` and `swr_until` from the stored directives.
    fn reset_windows(&mut self, now_ms: u64, default_swr_secs: u64) {
        let cc = self.directives();
        let fresh_ms = cc.freshness_secs().unwrap_or(0).saturating_mul(1000);
        let swr_ms = cc
            .stale_while_revalidate
            .unwrap_or(default_swr_secs)
            .saturating_mul(1000);

        self.stored_at = now_ms;
        self.expires_at = now_ms.saturating_add(fresh_ms);
        self.swr_until = self.expires_at.saturating_add(swr_ms);
    }

    /// Folds a `304 Not Modified` revalidation response into this entry.
    ///
    /// Headers present on the 304 replace the stored ones of the same name;
    /// validators and directives are refreshed when the 304 carries them, and
    /// the freshness windows restart at `now_ms`.
    pub fn merge_not_modified(&mut self, headers: &HeaderMap, now_ms: u64, default_swr_secs: u64) {
        let updates = storable_headers(headers);
        for (name, _) in &updates {
            self.headers.retain(|(existing, _)| !existing.eq_ignore_ascii_case(name));
        }
        self.headers.extend(updates);

        if let Some(etag) = header_str(headers, &header::ETAG) {
            self.etag = Some(etag);
        }
        if let Some(last_modified) = header_str(headers, &header::LAST_MODIFIED) {
            self.last_modified = Some(last_modified);
        }
        if let Some(cc) = joined_header(headers, &header::CACHE_CONTROL) {
            self.cache_control = Some(cc);
        }

        self.reset_windows(now_ms, default_swr_secs);
    }

    pub fn is_fresh(&self, now_ms: u64) -> bool {
        now_ms < self.expires_at
    }

    /// Stale but still inside the SWR window and not older than `max_stale_ms`.
    pub fn is_servable_stale(&self, now_ms: u64, max_stale_ms: u64) -> bool {
        now_ms >= self.expires_at
            && now_ms < self.swr_until
            && now_ms.saturating_sub(self.stored_at) <= max_stale_ms
    }

    /// Physical record lifetime in the store: freshness + SWR, rounded up, at least 1s.
    pub fn ttl_secs(&self) -> u64 {
        let span_ms = self.swr_until.saturating_sub(self.stored_at);
        span_ms.div_ceil(1000).max(1)
    }

    pub fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK)
    }

    /// Keeps the origin's own reason phrase. hyper only records one in the
    /// response extensions when it differs from the canonical text.
    pub fn with_reason(mut self, extensions: &Extensions) -> Self {
        if let Some(reason) = extensions.get::<ReasonPhrase>() {
            self.status_text = String::from_utf8_lossy(reason.as_bytes()).into_owned();
        }
        self
    }

    /// The stored reason phrase as a response extension, when it is not the
    /// canonical one for the status.
    pub fn reason_phrase(&self) -> Option<ReasonPhrase> {
        let canonical = self.status_code().canonical_reason().unwrap_or_default();
        if self.status_text.is_empty() || self.status_text == canonical {
            return None;
        }
        ReasonPhrase::try_from(self.status_text.as_bytes()).ok()
    }

    /// Rebuilds a header map from the stored pairs, skipping any that no longer parse.
    pub fn header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                map.append(name, value);
            }
        }
        map
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_slice(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }
}

/// The shared-cache storage predicate for a live origin response.
///
/// A response is storable only if it is a `200`, sets no cookies, carries
/// `public` with a positive freshness lifetime and no `no-store`, `no-cache`
/// or `private`, and does not vary on `Authorization` (or `*`).
pub fn is_storable_response(status: StatusCode, headers: &HeaderMap) -> bool {
    if status != StatusCode::OK || headers.contains_key(header::SET_COOKIE) {
        return false;
    }

    let cc = CacheControl::parse(joined_header(headers, &header::CACHE_CONTROL).as_deref());
    if !cc.allows_shared_storage() {
        return false;
    }

    !headers
        .get_all(header::VARY)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .any(|field| field == "*" || field.eq_ignore_ascii_case("authorization"))
}

/// Current wall-clock time in Unix epoch milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// All values of `name` joined with `", "`, or `None` when absent.
pub(crate) fn joined_header(headers: &HeaderMap, name: &HeaderName) -> Option<String> {
    let values: Vec<&str> = headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    if values.is_empty() {
        None
    } else {
        Some(values.join(", "))
    }
}

fn header_str(headers: &HeaderMap, name: &HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn storable_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(name, _)| keep_stored_header(name))
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

fn keep_stored_header(name: &HeaderName) -> bool {
    !is_hop_by_hop(name) && *name != header::CONTENT_LENGTH && *name != header::SET_COOKIE
}

mod body_base64 {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
