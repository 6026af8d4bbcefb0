use actix_web::{App, HttpResponse, HttpServer, Responder, get, web};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Metrics registry shared by the proxy, the cache adapter and the admin server.
#[derive(Clone)]
pub struct ProxyMetrics {
    pub registry: Registry,
    /// Requests answered, labeled by method, status code and cache outcome.
    pub http_requests_total: IntCounterVec,
    /// Origin round-trip time (to response headers), labeled by method.
    pub origin_request_duration: HistogramVec,
    /// Background revalidations, labeled by result.
    pub revalidations_total: IntCounterVec,
    /// Cache store failures that were absorbed, labeled by operation.
    pub store_errors_total: IntCounterVec,
}

impl ProxyMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let http_requests_total = IntCounterVec::new(
            Opts::new("swr_http_requests_total", "Total HTTP requests answered"),
            &["method", "status", "cache"],
        )
        .unwrap();

        let origin_request_duration = HistogramVec::new(
            HistogramOpts::new(
                "swr_origin_request_duration_seconds",
                "Origin round-trip time in seconds",
            )
            .buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ]),
            &["method"],
        )
        .unwrap();

        let revalidations_total = IntCounterVec::new(
            Opts::new(
                "swr_revalidations_total",
                "Background revalidations by result",
            ),
            &["result"],
        )
        .unwrap();

        let store_errors_total = IntCounterVec::new(
            Opts::new(
                "swr_store_errors_total",
                "Cache store errors absorbed by the proxy",
            ),
            &["op"],
        )
        .unwrap();

        registry
            .register(Box::new(http_requests_total.clone()))
            .unwrap();
        registry
            .register(Box::new(origin_request_duration.clone()))
            .unwrap();
        registry
            .register(Box::new(revalidations_total.clone()))
            .unwrap();
        registry
            .register(Box::new(store_errors_total.clone()))
            .unwrap();

        Self {
            registry,
            http_requests_total,
            origin_request_duration,
            revalidations_total,
            store_errors_total,
        }
    }

    /// Encodes all registered metrics into Prometheus text exposition format.
    pub fn encode(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::error!("Failed to encode metrics: {}", e);
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for ProxyMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[get("/health")]
async fn health() -> impl Responder {
    HttpResponse::Ok().body("OK")
}

#[get("/metrics")]
async fn metrics_endpoint(metrics: web::Data<Arc<ProxyMetrics>>) -> impl Responder {
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4; charset=utf-8")
        .body(metrics.encode())
}

/// Serves `/health` and `/metrics` until `shutdown` fires.
pub async fn start_admin_server(
    bind_addr: String,
    metrics: Arc<ProxyMetrics>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    info!("Admin API listening on http://{}", bind_addr);

    let metrics = web::Data::new(metrics);
    let server = HttpServer::new(move || {
        App::new()
            .app_data(metrics.clone())
            .service(health)
            .service(metrics_endpoint)
    })
    .workers(1)
    .disable_signals()
    .bind(&bind_addr)?
    .run();

    let handle = server.handle();
    tokio::spawn(async move {
        shutdown.cancelled().await;
        handle.stop(true).await;
    });

    server.await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_includes_registered_families() {
        let metrics = ProxyMetrics::new();
        metrics
            .http_requests_total
            .with_label_values(&["GET", "200", "HIT-FRESH"])
            .inc();
        metrics
            .revalidations_total
            .with_label_values(&["not_modified"])
            .inc();
        let text = metrics.encode();
        assert!(text.contains("swr_http_requests_total"));
        assert!(text.contains("HIT-FRESH"));
        assert!(text.contains("swr_revalidations_total"));
    }

    #[actix_web::test]
    async fn health_and_metrics_routes() {
        use actix_web::test;

        let metrics = Arc::new(ProxyMetrics::new());
        metrics.store_errors_total.with_label_values(&["read"]).inc();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(Arc::clone(&metrics)))
                .service(health)
                .service(metrics_endpoint),
        )
        .await;

        let resp = test::call_service(&app, test::TestRequest::get().uri("/health").to_request()).await;
        assert!(resp.status().is_success());

        let body = test::call_and_read_body(
            &app,
            test::TestRequest::get().uri("/metrics").to_request(),
        )
        .await;
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("swr_store_errors_total"));
    }
}
