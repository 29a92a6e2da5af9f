use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub mod api;
pub mod auth;
pub mod config;
pub mod control;
pub mod error;
pub mod message;
pub mod metrics;
pub mod parser;
pub mod ratelimit;
pub mod smtp;
pub mod storage;
pub mod tls;
pub mod webhook;

#[cfg(test)]
mod test;

use api::{AppState, IngestServer};
use auth::AuthEngine;
use auth::resolver::DnsResolver;
use config::{Config, Mode};
use control::ConnectionControl;
use metrics::MetricsServer;
use ratelimit::RateLimiter;
use smtp::SmtpBroker;
use storage::MessageStore;
use tls::ReloadableTls;
use webhook::WebhookClient;

pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!(
                    "{}=debug,tower_http=info,info",
                    env!("CARGO_CRATE_NAME")
                )
                .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

/// Wire up and start every server. Returned tracker completes when all
/// listeners have drained after `shutdown` is cancelled.
pub async fn run(config: Config, shutdown: CancellationToken) -> anyhow::Result<TaskTracker> {
    let config = Arc::new(config);
    let tracker = TaskTracker::new();

    if config.mode == Mode::Socket {
        warn!("mode=socket is reserved; running the plain HTTP listener");
    }

    let store = MessageStore::open(&config.data_dir).await?;
    let (metrics, registry) = metrics::build();

    let resolver = DnsResolver::new(&config.dns_servers);
    let engine = AuthEngine::new(&config, resolver);

    let control = ConnectionControl::new(config.control.clone());
    control.clone().spawn_cleanup(shutdown.clone());

    let limiter = Arc::new(RateLimiter::new(
        config.rate_limit_per_minute,
        config.rate_limit_burst,
    ));
    spawn_limiter_cleanup(limiter.clone(), shutdown.clone());

    let tls = if config.tls.enabled || config.smtp.enabled {
        let cert = config.tls.cert_path.as_ref().expect("checked by config");
        let key = config.tls.key_path.as_ref().expect("checked by config");
        let tls = Arc::new(ReloadableTls::load(cert, key)?);
        tls.clone().spawn_sighup_reload(shutdown.clone());
        Some(tls)
    } else {
        None
    };

    let state = AppState {
        engine,
        store,
        control,
        limiter,
        metrics: metrics.clone(),
        webhook: WebhookClient::new(
            config.api_endpoint.clone(),
            config.max_idle_conns,
            metrics.clone(),
        ),
        tls: tls.clone(),
        config: config.clone(),
    };

    let ingest = IngestServer::new(state, shutdown.clone());
    let token = shutdown.clone();
    tracker.spawn(async move {
        if let Err(e) = ingest.serve().await {
            error!("ingestion server error: {e}");
            token.cancel();
        }
    });

    let metrics_server = MetricsServer::new(
        config.metrics_addr(),
        &config.metrics_path,
        registry,
        shutdown.clone(),
    );
    let token = shutdown.clone();
    tracker.spawn(async move {
        if let Err(e) = metrics_server.serve().await {
            error!("metrics server error: {e}");
            token.cancel();
        }
    });

    if config.smtp.enabled {
        let broker = SmtpBroker::new(
            config.smtp.clone(),
            &config.mail_hostname,
            tls.expect("checked by config"),
            metrics,
            shutdown.clone(),
        );
        let token = shutdown.clone();
        tracker.spawn(async move {
            if let Err(e) = broker.serve().await {
                error!("SMTP broker error: {e}");
                token.cancel();
            }
        });
    }

    tracker.close();
    Ok(tracker)
}

fn spawn_limiter_cleanup(limiter: Arc<RateLimiter>, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = interval.tick() => limiter.evict_idle(),
            }
        }
    });
}

pub async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = token.cancelled() => {},
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("received shutdown signal");
}
