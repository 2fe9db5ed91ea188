//! wiretap - interactive HTTP/HTTPS debugging proxy
//!
//! Loads the engine configuration from the application data directory,
//! starts the proxy and runs until interrupted.

use wiretap::{app_data_dir, EngineConfig, Wiretap};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  let data_dir = app_data_dir()?;
  let config = EngineConfig::load(&data_dir.join("config.json"));

  tracing_subscriber::fmt()
    .with_env_filter(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.clone())),
    )
    .init();

  tracing::info!("starting wiretap, data dir {:?}", data_dir);
  let proxy = Wiretap::new(data_dir, config).await?;
  let addr = proxy.start().await?;
  tracing::info!("proxy listening on {}", addr);

  let status = proxy.ca_status().await;
  tracing::info!(
    "root CA {:?} at {:?} (trusted: {:?})",
    status.subject,
    status.cert_path,
    status.trust.trusted
  );

  tokio::signal::ctrl_c().await?;
  tracing::info!("shutting down");
  proxy.stop().await;
  Ok(())
}
