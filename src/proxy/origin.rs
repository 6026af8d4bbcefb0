use bytes::Bytes;
use http::{HeaderMap, Method};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Body, Incoming};
use hyper::{Request, Response};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::admin::ProxyMetrics;
use crate::config::OriginConfig;
use crate::error::ProxyError;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Request body type sent to origin: an empty body, a buffered one, or the
/// client's streamed body.
pub type UpstreamBody = UnsyncBoxBody<Bytes, BoxError>;

pub fn empty_upstream() -> UpstreamBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Adapts any inbound body (hyper's `Incoming` in production) for forwarding.
pub fn upstream_body<B>(body: B) -> UpstreamBody
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    body.map_err(Into::into).boxed_unsync()
}

/// Absolute-form request to origin with exactly `headers`.
pub fn origin_request(
    method: Method,
    target: &str,
    headers: HeaderMap,
    body: UpstreamBody,
) -> Result<Request<UpstreamBody>, ProxyError> {
    let mut req = Request::builder().method(method).uri(target).body(body)?;
    *req.headers_mut() = headers;
    Ok(req)
}

/// Pooled keep-alive HTTP/1.1 client shared by foreground requests and
/// background revalidation. Cheap to clone.
#[derive(Clone)]
pub struct OriginClient {
    client: Client<HttpConnector, UpstreamBody>,
    request_timeout: Duration,
    metrics: Arc<ProxyMetrics>,
}

impl OriginClient {
    pub fn new(config: &OriginConfig, metrics: Arc<ProxyMetrics>) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(config.connect_timeout()));
        connector.set_nodelay(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(config.pool_idle_timeout())
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .build(connector);

        Self {
            client,
            request_timeout: config.request_timeout(),
            metrics,
        }
    }

    /// Sends `req` and waits for the response head.
    ///
    /// Returns the response together with the round-trip time to headers,
    /// which is also recorded in the origin latency histogram. No retries.
    pub async fn send(
        &self,
        req: Request<UpstreamBody>,
    ) -> Result<(Response<Incoming>, Duration), ProxyError> {
        let method = req.method().clone();
        let uri = req.uri().clone();
        let started = Instant::now();

        let result = tokio::time::timeout(self.request_timeout, self.client.request(req)).await;
        let elapsed = started.elapsed();
        self.metrics
            .origin_request_duration
            .with_label_values(&[method.as_str()])
            .observe(elapsed.as_secs_f64());

        match result {
            Ok(Ok(resp)) => {
                debug!("Origin {} {} -> {} in {:?}", method, uri, resp.status(), elapsed);
                Ok((resp, elapsed))
            }
            Ok(Err(e)) => Err(ProxyError::Origin(e)),
            Err(_) => Err(ProxyError::OriginTimeout(self.request_timeout)),
        }
    }
}
