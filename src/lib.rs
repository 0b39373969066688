pub mod api;
pub mod config;
pub mod job_tracker;
pub mod pipeline;

use thiserror::Error;
use tracing_subscriber::EnvFilter;

use crate::api::{start_server, ApiContext, ServerError};
use crate::config::{ConfigError, ServiceConfig};

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Server(#[from] ServerError),
    #[error("Failed to listen for shutdown signal: {0}")]
    Signal(#[source] std::io::Error),
}

/// Load configuration, serve until Ctrl-C, then shut down gracefully.
pub async fn run() -> Result<(), StartupError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .init();

    tracing::info!("{} starting v{}", config::APP_NAME, config::APP_VERSION);

    let config = ServiceConfig::load()?;
    tracing::info!(
        bind = %config.bind_addr,
        work_dir = %config.work_dir.display(),
        engines = config.engines.len(),
        policy = %config.merge_policy,
        "Configuration loaded"
    );

    let ctx = ApiContext::from_config(&config);
    let server = start_server(ctx, &config.bind_addr).await?;

    tokio::signal::ctrl_c().await.map_err(StartupError::Signal)?;
    tracing::info!("Ctrl-C received, shutting down");
    server.stop().await;

    Ok(())
}
