use http::header::{self, HeaderMap, HeaderValue};
use http::{Method, StatusCode};
use http_body_util::BodyExt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::origin::{OriginClient, empty_upstream, origin_request};
use crate::admin::ProxyMetrics;
use crate::cache::{CacheEntry, ResponseCache, is_storable_response, now_millis};
use crate::error::ProxyError;

/// What a background revalidation did to the stored entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevalidationOutcome {
    /// 304: validators and headers merged, windows restarted.
    NotModified,
    /// 200 and storable: entry replaced.
    Replaced,
    /// Origin said the entry must go (error status, `no-store`, no longer public).
    Purged,
    /// Unexpected status; entry left as is.
    Untouched,
    /// The entry was purged or rewritten while origin was answering; the
    /// result is dropped.
    Superseded,
    /// Origin unreachable or timed out; entry left as is.
    Failed,
}

impl RevalidationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RevalidationOutcome::NotModified => "not_modified",
            RevalidationOutcome::Replaced => "replaced",
            RevalidationOutcome::Purged => "purged",
            RevalidationOutcome::Untouched => "untouched",
            RevalidationOutcome::Superseded => "superseded",
            RevalidationOutcome::Failed => "failed",
        }
    }
}

/// Refreshes stale entries against origin with a conditional GET.
#[derive(Clone)]
pub struct Revalidator {
    origin: OriginClient,
    cache: ResponseCache,
    metrics: Arc<ProxyMetrics>,
    default_swr_secs: u64,
}

impl Revalidator {
    pub fn new(
        origin: OriginClient,
        cache: ResponseCache,
        metrics: Arc<ProxyMetrics>,
        default_swr_secs: u64,
    ) -> Self {
        Self {
            origin,
            cache,
            metrics,
            default_swr_secs,
        }
    }

    /// Fire-and-forget. The caller must already hold the revalidation lock.
    pub fn spawn(&self, target: String, entry: CacheEntry, base_headers: HeaderMap) {
        let this = self.clone();
        tokio::spawn(async move {
            this.run(&target, entry, base_headers).await;
        });
    }

    pub async fn run(
        &self,
        target: &str,
        entry: CacheEntry,
        base_headers: HeaderMap,
    ) -> RevalidationOutcome {
        let outcome = match self.revalidate(target, entry, base_headers).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Revalidation of {} failed: {}", target, e);
                RevalidationOutcome::Failed
            }
        };

        info!("Revalidated {} -> {}", target, outcome.as_str());
        self.metrics
            .revalidations_total
            .with_label_values(&[outcome.as_str()])
            .inc();
        outcome
    }

    async fn revalidate(
        &self,
        target: &str,
        mut entry: CacheEntry,
        base_headers: HeaderMap,
    ) -> Result<RevalidationOutcome, ProxyError> {
        let headers = conditional_headers(base_headers, &entry);

        let req = origin_request(Method::GET, target, headers, empty_upstream())?;
        let (resp, _) = self.origin.send(req).await?;
        let status = resp.status();

        let snapshot_at = entry.stored_at;

        if status == StatusCode::NOT_MODIFIED {
            if !self.still_current(target, snapshot_at).await {
                return Ok(RevalidationOutcome::Superseded);
            }
            entry.merge_not_modified(resp.headers(), now_millis(), self.default_swr_secs);
            if entry.directives().allows_shared_storage() {
                self.cache.write(target, &entry).await;
                return Ok(RevalidationOutcome::NotModified);
            }
            self.cache.delete(target).await;
            return Ok(RevalidationOutcome::Purged);
        }

        if status == StatusCode::OK {
            if !is_storable_response(status, resp.headers()) {
                self.cache.delete(target).await;
                return Ok(RevalidationOutcome::Purged);
            }
            let (parts, body) = resp.into_parts();
            let body = body.collect().await?.to_bytes();
            if !self.still_current(target, snapshot_at).await {
                return Ok(RevalidationOutcome::Superseded);
            }
            let fresh = CacheEntry::from_response(
                target,
                status,
                &parts.headers,
                body,
                now_millis(),
                self.default_swr_secs,
            )
            .with_reason(&parts.extensions);
            self.cache.write(target, &fresh).await;
            return Ok(RevalidationOutcome::Replaced);
        }

        if status.is_client_error() || status.is_server_error() {
            self.cache.delete(target).await;
            return Ok(RevalidationOutcome::Purged);
        }

        debug!("Revalidation of {} got {}; keeping entry", target, status);
        Ok(RevalidationOutcome::Untouched)
    }

    /// Whether the store still holds the entry this revalidation started
    /// from. A mutation purge or a newer write in the meantime wins.
    async fn still_current(&self, target: &str, snapshot_at: u64) -> bool {
        match self.cache.read(target).await {
            Some(current) if current.stored_at == snapshot_at => true,
            Some(_) => {
                debug!("Entry for {} was replaced during revalidation", target);
                false
            }
            None => {
                debug!("Entry for {} was purged during revalidation", target);
                false
            }
        }
    }
}

/// Replaces the client's conditionals with the entry's validators.
fn conditional_headers(mut headers: HeaderMap, entry: &CacheEntry) -> HeaderMap {
    for name in [
        header::IF_NONE_MATCH,
        header::IF_MODIFIED_SINCE,
        header::IF_MATCH,
        header::IF_UNMODIFIED_SINCE,
        header::IF_RANGE,
    ] {
        headers.remove(name);
    }

    if let Some(value) = entry.etag.as_deref().and_then(|v| HeaderValue::from_str(v).ok()) {
        headers.insert(header::IF_NONE_MATCH, value);
    }
    if let Some(value) = entry
        .last_modified
        .as_deref()
        .and_then(|v| HeaderValue::from_str(v).ok())
    {
        headers.insert(header::IF_MODIFIED_SINCE, value);
    }
    headers
}
