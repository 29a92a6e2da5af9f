use anyhow::{Context, bail};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;

use mailgate::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    mailgate::init_tracing();

    let config_path = parse_args()?;
    let config = Config::load(config_path.as_deref()).context("failed to load configuration")?;

    let shutdown = CancellationToken::new();
    let servers = mailgate::run(config, shutdown.clone())
        .await
        .context("failed to start")?;

    mailgate::shutdown_signal(shutdown.clone()).await;
    info!("stopping services");
    shutdown.cancel();
    servers.wait().await;

    Ok(())
}

fn parse_args() -> anyhow::Result<Option<PathBuf>> {
    let mut config_path = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                config_path = Some(PathBuf::from(
                    args.next().context("--config requires a path")?,
                ));
            }
            other => bail!("unknown argument `{other}`"),
        }
    }
    Ok(config_path)
}
