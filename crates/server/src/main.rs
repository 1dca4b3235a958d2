use anyhow::{self, Error as AnyhowError};
use local_deployment::DeploymentError;
use server::{DeploymentImpl, ServerError, start_server};
use sqlx::Error as SqlxError;
use thiserror::Error;
use tracing_subscriber::{EnvFilter, prelude::*};
use utils::assets::asset_dir;

#[derive(Debug, Error)]
pub enum WorktreeEnvError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Sqlx(#[from] SqlxError),
    #[error(transparent)]
    Deployment(#[from] DeploymentError),
    #[error(transparent)]
    Server(#[from] ServerError),
    #[error(transparent)]
    Other(#[from] AnyhowError),
}

#[tokio::main]
async fn main() -> Result<(), WorktreeEnvError> {
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let filter_string = format!(
        "warn,server={level},services={level},db={level},local_deployment={level},\
         utils={level},environment_output={level}",
        level = log_level
    );
    let fmt_filter = EnvFilter::try_new(&filter_string)
        .map_err(|e| anyhow::anyhow!("Invalid tracing filter '{}': {}", filter_string, e))?;
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(fmt_filter))
        .init();

    if !asset_dir().exists() {
        std::fs::create_dir_all(asset_dir())?;
    }

    let deployment = DeploymentImpl::new().await?;

    let port = match std::env::var("BACKEND_PORT").or_else(|_| std::env::var("PORT")) {
        Ok(raw) => raw
            .trim()
            .parse::<u16>()
            .map_err(|e| anyhow::anyhow!("Invalid port value '{}': {}", raw.trim(), e))?,
        Err(_) => 0,
    };
    let host = std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());

    let (_url, handle) = start_server(deployment, &host, port).await?;
    if let Err(e) = handle.await {
        tracing::error!("Server task failed: {}", e);
    }

    Ok(())
}
