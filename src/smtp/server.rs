use std::sync::Arc;
use std::time::Duration;
use tokio::{net::TcpListener, select};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, trace};

use crate::config::SmtpBrokerConfig;
use crate::metrics::Metrics;
use crate::smtp::connection::{self, ConnectionContext, ConnectionError};
use crate::tls::ReloadableTls;

pub struct SmtpBroker {
    config: SmtpBrokerConfig,
    hostname: String,
    tls: Arc<ReloadableTls>,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
}

impl SmtpBroker {
    pub fn new(
        config: SmtpBrokerConfig,
        hostname: &str,
        tls: Arc<ReloadableTls>,
        metrics: Arc<Metrics>,
        shutdown: CancellationToken,
    ) -> SmtpBroker {
        SmtpBroker {
            config,
            hostname: hostname.to_string(),
            tls,
            metrics,
            shutdown,
        }
    }

    pub async fn serve(self) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        info!("SMTP broker listening on {}", self.config.listen_addr);

        loop {
            select! {
                _ = self.shutdown.cancelled() => {
                    info!("shutting down SMTP broker");
                    return Ok(());
                }
                result = listener.accept() => match result {
                    Ok((stream, peer)) => {
                        trace!(peer = %peer, "new SMTP connection");
                        let context = ConnectionContext {
                            hostname: self.hostname.clone(),
                            require_tls: self.config.require_tls,
                            upstream: self.config.upstream_addr,
                            handshake_timeout: Duration::from_secs(
                                self.config.handshake_timeout_secs,
                            ),
                            acceptor: self.tls.acceptor().await,
                            metrics: self.metrics.clone(),
                        };

                        tokio::spawn(async move {
                            if let Err(err) = connection::handle(stream, peer, context).await {
                                match err {
                                    ConnectionError::Dropped => {
                                        trace!("connection from {peer} dropped")
                                    }
                                    err => error!("failed to handle connection from {peer}: {err}"),
                                }
                            }
                        });
                    }
                    Err(err) => {
                        error!("failed to accept connection: {err}");
                    }
                },
            }
        }
    }

    pub fn spawn(self) {
        tokio::spawn(async move {
            if let Err(e) = self.serve().await {
                error!("SMTP broker error: {e}");
            }
        });
    }
}
