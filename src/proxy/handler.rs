use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderValue};
use http::{Method, Request, Response, StatusCode, Uri};
use http_body_util::BodyExt;
use hyper::body::{Body, Incoming};
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::headers::{
    X_PROXY_CACHE, X_PROXY_LATENCY, forward_request_headers, requests_no_store, strip_hop_by_hop,
};
use super::origin::{BoxError, UpstreamBody, empty_upstream, origin_request, upstream_body};
use super::{ProxyBody, ProxyState, empty_body, full_body};
use crate::cache::conditional::is_not_modified;
use crate::cache::entry::joined_header;
use crate::cache::{CacheControl, CacheEntry, CacheStatus, is_storable_response, now_millis};
use crate::error::ProxyError;
use crate::telemetry::access_log::{AccessLogEntry, log_timestamp};

/// A response on its way out, plus what the request log needs.
struct Served {
    response: Response<ProxyBody>,
    cache: CacheStatus,
    origin_latency: Option<Duration>,
    bytes: Option<u64>,
}

impl Served {
    fn local(response: Response<ProxyBody>, cache: CacheStatus, bytes: Option<u64>) -> Self {
        Self {
            response,
            cache,
            origin_latency: None,
            bytes,
        }
    }

    /// Streams an origin response back unbuffered, hop-by-hop headers removed.
    fn streamed(resp: Response<Incoming>, cache: CacheStatus, rtt: Duration) -> Self {
        let (mut parts, body) = resp.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        let bytes = parts
            .headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        Self {
            response: Response::from_parts(parts, body.boxed()),
            cache,
            origin_latency: Some(rtt),
            bytes,
        }
    }
}

/// Joins the origin base with the path remainder after `prefix`, keeping the
/// query string. Returns `Ok(None)` when the path is outside `prefix`.
pub fn build_target_url(
    base: &str,
    prefix: &str,
    uri: &Uri,
) -> Result<Option<String>, ProxyError> {
    let Some(rest) = uri.path().strip_prefix(prefix) else {
        return Ok(None);
    };

    let mut target = format!(
        "{}/{}",
        base.trim_end_matches('/'),
        rest.trim_start_matches('/')
    );
    if let Some(query) = uri.query().filter(|q| !q.is_empty()) {
        target.push('?');
        target.push_str(query);
    }

    match target.parse::<Uri>() {
        Ok(parsed) if parsed.scheme().is_some() && parsed.authority().is_some() => Ok(Some(target)),
        _ => Err(ProxyError::InvalidTarget(target)),
    }
}

/// Only anonymous GET/HEAD requests that did not opt out may touch the cache.
fn is_cacheable(method: &Method, inbound: &HeaderMap, has_session: bool) -> bool {
    (*method == Method::GET || *method == Method::HEAD)
        && !inbound.contains_key(header::AUTHORIZATION)
        && !requests_no_store(inbound)
        && !has_session
}

/// Whether a live GET response invalidates what we hold for its URL.
fn invalidates_entry(status: StatusCode, headers: &HeaderMap) -> bool {
    status.is_client_error()
        || status.is_server_error()
        || CacheControl::parse(joined_header(headers, &header::CACHE_CONTROL).as_deref()).no_store
}

fn entry_response(
    entry: &CacheEntry,
    not_modified: bool,
) -> Result<Response<ProxyBody>, ProxyError> {
    let (status, body) = if not_modified {
        (StatusCode::NOT_MODIFIED, empty_body())
    } else {
        (entry.status_code(), full_body(entry.body.clone()))
    };
    let mut resp = Response::builder().status(status).body(body)?;
    *resp.headers_mut() = entry.header_map();
    if !not_modified {
        if let Some(reason) = entry.reason_phrase() {
            resp.extensions_mut().insert(reason);
        }
    }
    Ok(resp)
}

fn text_response(status: StatusCode, text: impl Into<Bytes>) -> Response<ProxyBody> {
    let mut resp = Response::new(full_body(text.into()));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}

fn error_response(e: &ProxyError) -> Response<ProxyBody> {
    let status = e.status();
    let text = match e {
        ProxyError::MissingBackend => e.to_string(),
        _ => status.canonical_reason().unwrap_or("Error").to_string(),
    };
    text_response(status, text)
}

impl ProxyState {
    /// Answers one inbound request. Never fails: errors become status
    /// responses tagged `BYPASS`.
    pub async fn handle<B>(
        &self,
        req: Request<B>,
        client_ip: Option<IpAddr>,
    ) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let started = Instant::now();
        let method = req.method().clone();
        let path = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| req.uri().path().to_string());
        let user_agent = req
            .headers()
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-")
            .to_string();

        // 1. Build target
        let routed = match self.config.origin.base_url.as_deref() {
            Some(base) => build_target_url(base, &self.config.route_prefix, req.uri()),
            None => Err(ProxyError::MissingBackend),
        };

        let (result, logged_target) = match routed {
            Ok(Some(target)) => {
                let result = self.dispatch(req, &target).await;
                (result, target)
            }
            Ok(None) => {
                debug!("No route for {}", path);
                let served = Served::local(
                    text_response(StatusCode::NOT_FOUND, "Not Found"),
                    CacheStatus::Bypass,
                    None,
                );
                (Ok(served), path.clone())
            }
            Err(e) => (Err(e), path.clone()),
        };

        let mut served = result.unwrap_or_else(|e| {
            match &e {
                ProxyError::MissingBackend | ProxyError::Http(_) => {
                    error!("{} {} failed: {}", method, logged_target, e)
                }
                _ => warn!("{} {} failed: {}", method, logged_target, e),
            }
            Served::local(error_response(&e), CacheStatus::Bypass, None)
        });

        let status = served.response.status();
        let headers = served.response.headers_mut();
        headers.insert(X_PROXY_CACHE, HeaderValue::from_static(served.cache.as_str()));
        if let Some(rtt) = served.origin_latency {
            headers.insert(X_PROXY_LATENCY, HeaderValue::from(rtt.as_millis() as u64));
        }

        let elapsed = started.elapsed();
        info!(
            "{} {} -> {} in {}ms [{}]",
            method,
            logged_target,
            status.as_u16(),
            elapsed.as_millis(),
            served.cache.as_str()
        );
        self.metrics
            .http_requests_total
            .with_label_values(&[method.as_str(), status.as_str(), served.cache.as_str()])
            .inc();

        if let Some(logger) = &self.access_logger {
            logger.log(AccessLogEntry {
                timestamp: log_timestamp(),
                client_ip: client_ip.map(|ip| ip.to_string()).unwrap_or_else(|| "-".to_string()),
                method: method.to_string(),
                path,
                status: status.as_u16(),
                cache: served.cache.as_str(),
                latency_ms: elapsed.as_millis() as u64,
                origin_latency_ms: served.origin_latency.map(|d| d.as_millis() as u64),
                bytes_sent: served.bytes,
                user_agent,
            });
        }

        served.response
    }

    async fn dispatch<B>(&self, req: Request<B>, target: &str) -> Result<Served, ProxyError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let (parts, body) = req.into_parts();

        // 2. Sanitize headers
        let token = self.session.bearer_token(&parts.headers).await;
        let forwarded = forward_request_headers(&parts.headers, token.as_deref());

        // 3. Classify
        let cacheable = is_cacheable(&parts.method, &parts.headers, token.is_some());

        match parts.method {
            Method::GET => self.serve_get(&parts.headers, forwarded, target, cacheable).await,
            Method::HEAD => {
                self.passthrough(Method::HEAD, target, forwarded, empty_upstream())
                    .await
            }
            method @ (Method::POST | Method::PUT | Method::PATCH | Method::DELETE) => {
                self.mutate(method, target, forwarded, upstream_body(body))
                    .await
            }
            other => {
                self.passthrough(other, target, forwarded, upstream_body(body))
                    .await
            }
        }
    }

    async fn serve_get(
        &self,
        inbound: &HeaderMap,
        forwarded: HeaderMap,
        target: &str,
        cacheable: bool,
    ) -> Result<Served, ProxyError> {
        let cached = if cacheable {
            self.cache.read(target).await
        } else {
            None
        };

        if let Some(entry) = cached.as_ref() {
            let now = now_millis();

            // 4. Conditional short-circuit
            if is_not_modified(inbound, entry) {
                return Ok(Served::local(
                    entry_response(entry, true)?,
                    CacheStatus::HitLocal304,
                    Some(0),
                ));
            }

            let size = Some(entry.body.len() as u64);

            // 5. Fresh hit
            if entry.is_fresh(now) {
                return Ok(Served::local(
                    entry_response(entry, false)?,
                    CacheStatus::HitFresh,
                    size,
                ));
            }

            // 6. Stale but servable
            if entry.is_servable_stale(now, self.config.cache.max_stale_ms()) {
                let tag = if self.locks.try_acquire(target).await {
                    self.revalidator.spawn(target.to_string(), entry.clone(), forwarded);
                    CacheStatus::HitStaleRevalidating
                } else {
                    CacheStatus::HitStale
                };
                return Ok(Served::local(entry_response(entry, false)?, tag, size));
            }
        }

        // 7. Miss, expired or not cacheable
        let req = origin_request(Method::GET, target, forwarded, empty_upstream())?;
        let (resp, rtt) = self.origin.send(req).await?;
        let status = resp.status();

        if cacheable && is_storable_response(status, resp.headers()) {
            let (parts, body) = resp.into_parts();
            let body = body.collect().await?.to_bytes();
            let entry = CacheEntry::from_response(
                target,
                status,
                &parts.headers,
                body,
                now_millis(),
                self.config.cache.default_swr_secs,
            )
            .with_reason(&parts.extensions);
            let tag = if self.cache.write(target, &entry).await {
                CacheStatus::MissStored
            } else {
                CacheStatus::Bypass
            };
            return Ok(Served {
                response: entry_response(&entry, false)?,
                cache: tag,
                origin_latency: Some(rtt),
                bytes: Some(entry.body.len() as u64),
            });
        }

        if cacheable && invalidates_entry(status, resp.headers()) {
            self.cache.delete(target).await;
        }

        let tag = if cached.is_some() {
            CacheStatus::BypassStale
        } else {
            CacheStatus::Bypass
        };
        Ok(Served::streamed(resp, tag, rtt))
    }

    /// Forwards a mutation and purges the entry for the same URL on success.
    async fn mutate(
        &self,
        method: Method,
        target: &str,
        forwarded: HeaderMap,
        body: UpstreamBody,
    ) -> Result<Served, ProxyError> {
        let req = origin_request(method, target, forwarded, body)?;
        let (resp, rtt) = self.origin.send(req).await?;

        if matches!(resp.status().as_u16(), 200 | 201 | 202 | 204) {
            self.cache.delete(target).await;
        }
        Ok(Served::streamed(resp, CacheStatus::Bypass, rtt))
    }

    async fn passthrough(
        &self,
        method: Method,
        target: &str,
        forwarded: HeaderMap,
        body: UpstreamBody,
    ) -> Result<Served, ProxyError> {
        let req = origin_request(method, target, forwarded, body)?;
        let (resp, rtt) = self.origin.send(req).await?;
        Ok(Served::streamed(resp, CacheStatus::Bypass, rtt))
    }
}
