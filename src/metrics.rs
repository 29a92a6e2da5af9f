//! Prometheus metrics: one typed `Metrics` struct registered against a
//! registry at startup, exposed by a dedicated listener on the metrics
//! port. Tests build their own registry, so nothing here is global.

use axum::{Router, extract::State, response::IntoResponse, routing::get};
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HttpLabels {
    pub method: String,
    pub endpoint: String,
    pub status: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StatusLabels {
    pub status: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReasonLabels {
    pub reason: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ResultLabels {
    pub result: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct EndpointLabels {
    pub endpoint: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct VersionLabels {
    pub version: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CipherLabels {
    pub cipher: String,
}

type FloatGauge = Gauge<f64, AtomicU64>;

#[derive(Debug)]
pub struct Metrics {
    pub http_requests: Family<HttpLabels, Counter>,
    pub http_request_duration: Family<HttpLabels, Histogram>,
    pub http_active_requests: Gauge,
    pub emails_processed: Family<StatusLabels, Counter>,
    pub emails_quarantined: Family<ReasonLabels, Counter>,
    pub emails_rejected: Family<ReasonLabels, Counter>,
    pub email_size_bytes: Histogram,
    pub email_processing_duration: Histogram,
    pub spf_results: Family<ResultLabels, Counter>,
    pub dkim_results: Family<ResultLabels, Counter>,
    pub dmarc_results: Family<ResultLabels, Counter>,
    pub connections_accepted: Counter,
    pub connections_rejected: Family<ReasonLabels, Counter>,
    pub active_connections: Gauge,
    pub banned_ips: Gauge,
    pub tls_connections: Counter,
    pub tls_version: Family<VersionLabels, Counter>,
    pub tls_cipher_suite: Family<CipherLabels, Counter>,
    pub tls_handshake_errors: Counter,
    pub timeouts: Family<EndpointLabels, Counter>,
    pub webhook_failures: Counter,
    pub shutdown_duration_seconds: FloatGauge,
}

impl Metrics {
    pub fn new(registry: &mut Registry) -> Self {
        let duration_family = Family::<HttpLabels, Histogram>::new_with_constructor(|| {
            Histogram::new(exponential_buckets(0.005, 2.0, 12))
        });
        let metrics = Metrics {
            http_requests: Family::default(),
            http_request_duration: duration_family,
            http_active_requests: Gauge::default(),
            emails_processed: Family::default(),
            emails_quarantined: Family::default(),
            emails_rejected: Family::default(),
            email_size_bytes: Histogram::new(exponential_buckets(1024.0, 4.0, 10)),
            email_processing_duration: Histogram::new(exponential_buckets(0.005, 2.0, 12)),
            spf_results: Family::default(),
            dkim_results: Family::default(),
            dmarc_results: Family::default(),
            connections_accepted: Counter::default(),
            connections_rejected: Family::default(),
            active_connections: Gauge::default(),
            banned_ips: Gauge::default(),
            tls_connections: Counter::default(),
            tls_version: Family::default(),
            tls_cipher_suite: Family::default(),
            tls_handshake_errors: Counter::default(),
            timeouts: Family::default(),
            webhook_failures: Counter::default(),
            shutdown_duration_seconds: FloatGauge::default(),
        };

        registry.register(
            "http_requests",
            "HTTP requests served",
            metrics.http_requests.clone(),
        );
        registry.register(
            "http_request_duration_seconds",
            "HTTP request latency",
            metrics.http_request_duration.clone(),
        );
        registry.register(
            "http_active_requests",
            "Requests currently in flight",
            metrics.http_active_requests.clone(),
        );
        registry.register(
            "emails_processed",
            "Inbound messages processed, by outcome",
            metrics.emails_processed.clone(),
        );
        registry.register(
            "emails_quarantined",
            "Messages quarantined, by reason",
            metrics.emails_quarantined.clone(),
        );
        registry.register(
            "emails_rejected",
            "Messages rejected, by reason",
            metrics.emails_rejected.clone(),
        );
        registry.register(
            "email_size_bytes",
            "Size of accepted messages",
            metrics.email_size_bytes.clone(),
        );
        registry.register(
            "email_processing_duration_seconds",
            "Ingestion pipeline latency per message",
            metrics.email_processing_duration.clone(),
        );
        registry.register(
            "spf_results",
            "SPF evaluation results",
            metrics.spf_results.clone(),
        );
        registry.register(
            "dkim_results",
            "DKIM signature results",
            metrics.dkim_results.clone(),
        );
        registry.register(
            "dmarc_results",
            "DMARC evaluation results",
            metrics.dmarc_results.clone(),
        );
        registry.register(
            "connections_accepted",
            "Connections admitted by connection control",
            metrics.connections_accepted.clone(),
        );
        registry.register(
            "connections_rejected",
            "Connections rejected by connection control, by reason",
            metrics.connections_rejected.clone(),
        );
        registry.register(
            "active_connections",
            "Currently admitted connections",
            metrics.active_connections.clone(),
        );
        registry.register(
            "banned_ips",
            "IPs with an unexpired ban",
            metrics.banned_ips.clone(),
        );
        registry.register(
            "tls_connections",
            "TLS sessions established",
            metrics.tls_connections.clone(),
        );
        registry.register(
            "tls_version",
            "TLS sessions by protocol version",
            metrics.tls_version.clone(),
        );
        registry.register(
            "tls_cipher_suite",
            "TLS sessions by negotiated cipher suite",
            metrics.tls_cipher_suite.clone(),
        );
        registry.register(
            "tls_handshake_errors",
            "Failed TLS handshakes",
            metrics.tls_handshake_errors.clone(),
        );
        registry.register(
            "timeouts",
            "Handler timeouts, by endpoint",
            metrics.timeouts.clone(),
        );
        registry.register(
            "webhook_failures",
            "Failed webhook deliveries",
            metrics.webhook_failures.clone(),
        );
        registry.register(
            "shutdown_duration_seconds",
            "Time the last graceful shutdown took",
            metrics.shutdown_duration_seconds.clone(),
        );

        metrics
    }

    pub fn record_auth(&self, auth: &crate::auth::AuthenticationResult) {
        self.spf_results
            .get_or_create(&ResultLabels {
                result: auth.spf.result.as_str().to_string(),
            })
            .inc();
        for dkim in &auth.dkim {
            self.dkim_results
                .get_or_create(&ResultLabels {
                    result: dkim.result.as_str().to_string(),
                })
                .inc();
        }
        self.dmarc_results
            .get_or_create(&ResultLabels {
                result: auth.dmarc.result.as_str().to_string(),
            })
            .inc();
    }
}

/// Build a fresh registry with every gateway series registered. The
/// registry feeds the exposition endpoint; the `Metrics` handle is shared
/// with the components that record.
pub fn build() -> (Arc<Metrics>, Arc<Mutex<Registry>>) {
    let mut registry = Registry::default();
    let metrics = Metrics::new(&mut registry);
    (Arc::new(metrics), Arc::new(Mutex::new(registry)))
}

pub struct MetricsServer {
    addr: SocketAddr,
    path: String,
    registry: Arc<Mutex<Registry>>,
    shutdown: CancellationToken,
}

impl MetricsServer {
    pub fn new(
        addr: SocketAddr,
        path: &str,
        registry: Arc<Mutex<Registry>>,
        shutdown: CancellationToken,
    ) -> MetricsServer {
        MetricsServer {
            addr,
            path: path.to_string(),
            registry,
            shutdown,
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route(&self.path, get(render))
            .with_state(self.registry.clone())
    }

    pub async fn serve(self) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(self.addr).await?;
        info!("metrics listening on {}{}", self.addr, self.path);

        let shutdown = self.shutdown.clone();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
    }

    pub fn spawn(self) {
        tokio::spawn(async move {
            if let Err(e) = self.serve().await {
                error!("metrics server error: {e}");
            }
        });
    }
}

async fn render(State(registry): State<Arc<Mutex<Registry>>>) -> impl IntoResponse {
    let mut body = String::new();
    let registry = registry.lock().expect("metrics registry lock");
    match encode(&mut body, &registry) {
        Ok(()) => (
            [(http::header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => (
            http::StatusCode::INTERNAL_SERVER_ERROR,
            format!("metrics encoding failed: {e}"),
        )
            .into_response(),
    }
}
