use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full, combinators::BoxBody};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, body::Incoming};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub mod handler;
pub mod headers;
pub mod origin;
pub mod revalidate;
pub mod session;

use crate::admin::ProxyMetrics;
use crate::cache::{KvStore, LockManager, ResponseCache};
use crate::config::AppConfig;
use crate::telemetry::access_log::AccessLogger;
use origin::OriginClient;
use revalidate::Revalidator;
use session::{NoSession, SessionResolver, StaticToken};

/// Body type of every response the proxy sends.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

pub(crate) fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

pub(crate) fn full_body(bytes: Bytes) -> ProxyBody {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}

/// Everything a request needs, built once at startup and shared by `Arc`
/// across connection tasks and background revalidations.
pub struct ProxyState {
    pub config: Arc<AppConfig>,
    pub origin: OriginClient,
    pub cache: ResponseCache,
    pub locks: LockManager,
    pub revalidator: Revalidator,
    pub session: Arc<dyn SessionResolver>,
    pub metrics: Arc<ProxyMetrics>,
    pub access_logger: Option<Arc<AccessLogger>>,
}

impl ProxyState {
    /// Wires the cache, lock manager and origin client over `store`.
    ///
    /// The session resolver is [`StaticToken`] when `SESSION_BEARER_TOKEN`
    /// is configured, otherwise [`NoSession`].
    pub fn new(
        config: Arc<AppConfig>,
        store: Arc<dyn KvStore>,
        metrics: Arc<ProxyMetrics>,
    ) -> Self {
        let prefix = config.cache.key_prefix.clone();
        let origin = OriginClient::new(&config.origin, Arc::clone(&metrics));
        let cache = ResponseCache::new(Arc::clone(&store), prefix.clone(), Arc::clone(&metrics));
        let locks = LockManager::new(store, prefix, config.cache.lock_ttl_secs);
        let revalidator = Revalidator::new(
            origin.clone(),
            cache.clone(),
            Arc::clone(&metrics),
            config.cache.default_swr_secs,
        );
        let session: Arc<dyn SessionResolver> = match config.session_bearer_token.as_deref() {
            Some(token) => Arc::new(StaticToken::new(token)),
            None => Arc::new(NoSession),
        };

        Self {
            config,
            origin,
            cache,
            locks,
            revalidator,
            session,
            metrics,
            access_logger: None,
        }
    }

    pub fn with_session(mut self, session: Arc<dyn SessionResolver>) -> Self {
        self.session = session;
        self
    }

    pub fn with_access_logger(mut self, logger: Arc<AccessLogger>) -> Self {
        self.access_logger = Some(logger);
        self
    }
}

/// Binds `bind_addr` and serves until `shutdown` fires.
pub async fn start_proxy(
    bind_addr: &str,
    state: Arc<ProxyState>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let addr: SocketAddr = bind_addr
        .parse()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let listener = TcpListener::bind(addr).await?;
    serve(listener, state, shutdown).await
}

/// Accept loop over an already bound listener. One task per connection,
/// HTTP/1.1 with keep-alive.
pub async fn serve(
    listener: TcpListener,
    state: Arc<ProxyState>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    info!("Proxy listening on {}", listener.local_addr()?);

    loop {
        // Accept new connections, or break on shutdown signal
        let (stream, peer) = tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok(s) => s,
                    Err(e) => {
                        error!("Accept error: {}", e);
                        continue;
                    }
                }
            }
            _ = shutdown.cancelled() => {
                info!("Proxy shutting down, no new connections accepted.");
                break;
            }
        };

        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let svc = service_fn(move |req: Request<Incoming>| {
                let state = Arc::clone(&state);
                async move { Ok::<_, hyper::Error>(state.handle(req, Some(peer.ip())).await) }
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, svc).await {
                debug!("Error serving connection from {}: {:?}", peer, e);
            }
        });
    }

    Ok(())
}
