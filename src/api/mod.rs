//! The ingestion HTTP surface: `POST /mail/inbound` plus the health and
//! readiness probes, served over plain TCP or TLS depending on config.

pub mod inbound;
pub mod middleware;

use axum::{
    Extension, Json, Router,
    extract::State,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnectionBuilder;
use hyper_util::service::TowerToHyperService;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower::Service;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::auth::AuthEngine;
use crate::config::Config;
use crate::control::ConnectionControl;
use crate::error::Error;
use crate::metrics::{CipherLabels, Metrics, VersionLabels};
use crate::ratelimit::RateLimiter;
use crate::storage::MessageStore;
use crate::tls::{ReloadableTls, cipher_label, version_label};
use crate::webhook::WebhookClient;
use middleware::RequestId;

/// In-flight requests get this long to finish once shutdown starts.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub engine: AuthEngine,
    pub store: MessageStore,
    pub control: Arc<ConnectionControl>,
    pub limiter: Arc<RateLimiter>,
    pub metrics: Arc<Metrics>,
    pub webhook: WebhookClient,
    pub tls: Option<Arc<ReloadableTls>>,
}

pub struct IngestServer {
    state: AppState,
    shutdown: CancellationToken,
}

impl IngestServer {
    pub fn new(state: AppState, shutdown: CancellationToken) -> IngestServer {
        IngestServer { state, shutdown }
    }

    pub fn router(state: AppState) -> Router {
        let mail = Router::new()
            .route("/mail/inbound", post(inbound::inbound))
            .route_layer(axum::middleware::from_fn_with_state(
                state.clone(),
                middleware::admission,
            ));

        Router::new()
            .merge(mail)
            .route("/health", get(health))
            .route("/ready", get(ready))
            .fallback(not_found)
            .layer((
                axum::middleware::from_fn(middleware::request_id),
                tower::limit::GlobalConcurrencyLimitLayer::new(state.config.max_connections),
                TraceLayer::new_for_http(),
                axum::middleware::from_fn_with_state(state.clone(), middleware::track_metrics),
                axum::middleware::from_fn(middleware::recover_panics),
                axum::middleware::from_fn_with_state(state.clone(), middleware::handler_timeout),
            ))
            .with_state(state)
    }

    pub async fn serve(self) -> Result<(), std::io::Error> {
        let addr = self.state.config.listen_addr();
        let router = Self::router(self.state.clone());

        match self.state.tls.clone() {
            Some(tls) if self.state.config.tls.enabled => {
                self.serve_tls(addr, router, tls).await
            }
            _ => self.serve_plain(addr, router).await,
        }
    }

    async fn serve_plain(self, addr: SocketAddr, router: Router) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(addr).await?;
        info!("ingestion server listening on {addr}");

        let token = self.shutdown.clone();
        let mut task = tokio::spawn(async move {
            axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await
        });

        tokio::select! {
            result = &mut task => return result.expect("ingestion server task panicked"),
            _ = self.shutdown.cancelled() => {}
        }

        let started = Instant::now();
        let result = match tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await {
            Ok(joined) => joined.expect("ingestion server task panicked"),
            Err(_) => {
                warn!("in-flight requests exceeded the shutdown grace period");
                task.abort();
                Ok(())
            }
        };
        let elapsed = started.elapsed();
        self.state
            .metrics
            .shutdown_duration_seconds
            .set(elapsed.as_secs_f64());
        info!("ingestion server drained in {elapsed:?}");
        result
    }

    /// TLS termination on the ingestion port: accept, handshake, then hand
    /// the stream to hyper with the routed service.
    async fn serve_tls(
        self,
        addr: SocketAddr,
        router: Router,
        tls: Arc<ReloadableTls>,
    ) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(addr).await?;
        info!("ingestion server listening on {addr} (TLS)");

        let mut make_service = router.into_make_service_with_connect_info::<SocketAddr>();
        let tracker = TaskTracker::new();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!("failed to accept connection: {e}");
                            continue;
                        }
                    };

                    let service = match make_service.call(peer).await {
                        Ok(service) => service,
                        Err(never) => match never {},
                    };
                    let acceptor = tls.acceptor().await;
                    let metrics = self.state.metrics.clone();

                    tracker.spawn(async move {
                        let tls_stream = match acceptor.accept(stream).await {
                            Ok(tls_stream) => tls_stream,
                            Err(e) => {
                                metrics.tls_handshake_errors.inc();
                                debug!(peer = %peer, "TLS handshake failed: {e}");
                                return;
                            }
                        };

                        {
                            let (_, connection) = tls_stream.get_ref();
                            metrics.tls_connections.inc();
                            metrics
                                .tls_version
                                .get_or_create(&VersionLabels {
                                    version: version_label(connection.protocol_version())
                                        .to_string(),
                                })
                                .inc();
                            metrics
                                .tls_cipher_suite
                                .get_or_create(&CipherLabels {
                                    cipher: cipher_label(
                                        connection.negotiated_cipher_suite().map(|s| s.suite()),
                                    )
                                    .to_string(),
                                })
                                .inc();
                        }

                        let result = ConnectionBuilder::new(TokioExecutor::new())
                            .serve_connection_with_upgrades(
                                TokioIo::new(tls_stream),
                                TowerToHyperService::new(service),
                            )
                            .await;
                        if let Err(e) = result {
                            debug!(peer = %peer, "connection error: {e}");
                        }
                    });
                }
            }
        }

        let started = Instant::now();
        tracker.close();
        if tokio::time::timeout(SHUTDOWN_GRACE, tracker.wait())
            .await
            .is_err()
        {
            warn!("in-flight TLS connections exceeded the shutdown grace period");
        }
        let elapsed = started.elapsed();
        self.state
            .metrics
            .shutdown_duration_seconds
            .set(elapsed.as_secs_f64());
        info!("ingestion server drained in {elapsed:?}");
        Ok(())
    }

    pub fn spawn(self) {
        let token = self.shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = self.serve().await {
                error!("ingestion server error: {e}");
                token.cancel();
            }
        });
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "healthy" }))
}

/// Ready once storage is writable and, when TLS is enabled, the material
/// is unexpired.
async fn ready(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
) -> Response {
    let storage_ok = state.store.probe().await;
    let tls_ok = match (&state.tls, state.config.tls.enabled) {
        (Some(tls), true) => tls.valid().await,
        _ => true,
    };

    if storage_ok && tls_ok {
        (http::StatusCode::OK, Json(json!({ "status": "ready" }))).into_response()
    } else {
        let reason = if storage_ok {
            "TLS material unavailable or expired"
        } else {
            "storage not writable"
        };
        Error::Unavailable(reason.to_string()).into_response_with_id(&request_id.0)
    }
}

async fn not_found(Extension(request_id): Extension<RequestId>) -> Response {
    Error::NotFound.into_response_with_id(&request_id.0)
}
