use swr_proxy::*;

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use cache::{KvStore, MemoryStore, RedisStore};
use config::StoreBackend;

/// Entry point for the SWR edge proxy.
/// `main` stays synchronous so the configuration is read before the runtime
/// is built with the configured number of worker threads.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Telemetry
    telemetry::init_telemetry();

    // 2. Configuration from the environment
    let cfg = Arc::new(config::load_config());

    tracing::info!(
        "Starting SWR proxy with {} worker threads (store: {:?}, prefix: {})",
        cfg.workers,
        cfg.cache.store,
        cfg.route_prefix
    );

    // 3. Runtime
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(cfg.workers)
        .enable_all()
        .build()?;

    rt.block_on(async move {
        // --- Graceful Shutdown ---
        let shutdown_token = CancellationToken::new();
        let shutdown_token_signal = shutdown_token.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received, initiating graceful shutdown...");
            shutdown_token_signal.cancel();
        });

        let metrics = Arc::new(admin::ProxyMetrics::new());

        // Cache store: Redis is lazy, so a down instance only degrades requests.
        let store: Arc<dyn KvStore> = match cfg.cache.store {
            StoreBackend::Redis => Arc::new(RedisStore::new(
                &cfg.cache.redis_url,
                cfg.cache.redis_timeout(),
            )?),
            StoreBackend::Memory => {
                tracing::warn!("Using in-process cache store; entries are not shared");
                Arc::new(MemoryStore::new())
            }
        };

        let mut state = proxy::ProxyState::new(Arc::clone(&cfg), store, Arc::clone(&metrics));
        if let Some(path) = cfg.access_log_path.as_deref() {
            let format = telemetry::access_log::LogFormat::parse(
                cfg.access_log_format.as_deref().unwrap_or("json"),
            );
            state = state.with_access_logger(Arc::new(telemetry::access_log::AccessLogger::new(
                path, format,
            )));
        }

        // Admin API in the background
        let admin_bind = cfg.admin_bind.clone();
        let metrics_admin = Arc::clone(&metrics);
        let shutdown_admin = shutdown_token.clone();
        tokio::spawn(async move {
            let result = admin::start_admin_server(admin_bind, metrics_admin, shutdown_admin).await;
            if let Err(e) = result {
                tracing::error!("Admin server failed: {}", e);
            }
        });

        proxy::start_proxy(&cfg.proxy_bind, Arc::new(state), shutdown_token).await?;
        Ok::<(), Box<dyn std::error::Error>>(())
    })?;

    Ok(())
}

/// Waits for Ctrl+C or SIGTERM to initiate graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => { tracing::info!("Received Ctrl+C"); }
                    _ = sigterm.recv() => { tracing::info!("Received SIGTERM"); }
                }
            }
            Err(e) => {
                tracing::warn!("Failed to register SIGTERM handler: {}", e);
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
