use http::header::{self, HeaderMap};

use super::entry::CacheEntry;

/// Whether the client's validators already match `entry`, so the proxy can
/// answer `304 Not Modified` without touching origin.
///
/// `If-None-Match` uses weak comparison and matches when any listed tag (or
/// `*`) equals the stored `ETag`. `If-Modified-Since` matches when it is at or
/// after the stored `Last-Modified`. Anything that fails to parse is treated
/// as no match, so the client gets content rather than an empty 304.
pub fn is_not_modified(request: &HeaderMap, entry: &CacheEntry) -> bool {
    etag_matches(request, entry) || not_modified_since(request, entry)
}

fn etag_matches(request: &HeaderMap, entry: &CacheEntry) -> bool {
    let Some(stored) = entry.etag.as_deref() else {
        return false;
    };
    let stored = opaque_tag(stored);

    request
        .get_all(header::IF_NONE_MATCH)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .any(|tag| tag == "*" || opaque_tag(tag) == stored)
}

fn not_modified_since(request: &HeaderMap, entry: &CacheEntry) -> bool {
    let Some(since) = request
        .get(header::IF_MODIFIED_SINCE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| httpdate::parse_http_date(v.trim()).ok())
    else {
        return false;
    };

    entry
        .last_modified
        .as_deref()
        .and_then(|lm| httpdate::parse_http_date(lm.trim()).ok())
        .is_some_and(|last_modified| since >= last_modified)
}

/// Strips the weak indicator so `W/"x"` and `"x"` compare equal.
fn opaque_tag(tag: &str) -> &str {
    tag.strip_prefix("W/").unwrap_or(tag)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::{HeaderValue, StatusCode};

    fn entry(etag: Option<&'static str>, last_modified: Option<&'static str>) -> CacheEntry {
        let mut h = HeaderMap::new();
        h.insert(header::CACHE_CONTROL, HeaderValue::from_static("public, max-age=60"));
        if let Some(e) = etag {
            h.insert(header::ETAG, HeaderValue::from_static(e));
        }
        if let Some(lm) = last_modified {
            h.insert(header::LAST_MODIFIED, HeaderValue::from_static(lm));
        }
        CacheEntry::from_response("http://o/r", StatusCode::OK, &h, Bytes::new(), 0, 30)
    }

    fn request(name: header::HeaderName, value: &'static str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(name, HeaderValue::from_static(value));
        h
    }

    #[test]
    fn etag_in_list_matches() {
        let e = entry(Some("\"abc\""), None);
        assert!(is_not_modified(&request(header::IF_NONE_MATCH, "\"xyz\", \"abc\""), &e));
        assert!(!is_not_modified(&request(header::IF_NONE_MATCH, "\"xyz\""), &e));
    }

    #[test]
    fn weak_and_wildcard_tags() {
        let e = entry(Some("W/\"abc\""), None);
        assert!(is_not_modified(&request(header::IF_NONE_MATCH, "\"abc\""), &e));
        assert!(is_not_modified(&request(header::IF_NONE_MATCH, "*"), &e));
        // nothing to compare against
        assert!(!is_not_modified(&request(header::IF_NONE_MATCH, "*"), &entry(None, None)));
    }

    #[test]
    fn if_modified_since_at_or_after() {
        let e = entry(None, Some("Wed, 21 Oct 2015 07:28:00 GMT"));
        assert!(is_not_modified(
            &request(header::IF_MODIFIED_SINCE, "Wed, 21 Oct 2015 07:28:00 GMT"),
            &e
        ));
        assert!(is_not_modified(
            &request(header::IF_MODIFIED_SINCE, "Thu, 22 Oct 2015 07:28:00 GMT"),
            &e
        ));
        assert!(!is_not_modified(
            &request(header::IF_MODIFIED_SINCE, "Tue, 20 Oct 2015 07:28:00 GMT"),
            &e
        ));
    }

    #[test]
    fn unparseable_dates_fail_open() {
        let e = entry(None, Some("yesterday-ish"));
        assert!(!is_not_modified(
            &request(header::IF_MODIFIED_SINCE, "Wed, 21 Oct 2015 07:28:00 GMT"),
            &e
        ));
        let e = entry(None, Some("Wed, 21 Oct 2015 07:28:00 GMT"));
        assert!(!is_not_modified(&request(header::IF_MODIFIED_SINCE, "not a date"), &e));
    }
}
