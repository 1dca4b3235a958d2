use std::sync::Arc;

use db::DBService;
use services::services::{
    config::{Config, ConfigError, load_config_from_file},
    environment::EnvironmentError,
};
use thiserror::Error;
use utils::assets::config_path;

pub mod environment;
pub mod process_store;

pub use environment::LocalEnvironmentService;

#[derive(Debug, Error)]
pub enum DeploymentError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Environment(#[from] EnvironmentError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Everything the daemon needs, wired for a single local machine.
#[derive(Clone)]
pub struct LocalDeployment {
    config: Arc<Config>,
    db: DBService,
    environment: LocalEnvironmentService,
}

impl LocalDeployment {
    /// Load config from the asset directory (plus `WTENV_*` overrides) and open
    /// the database named by `WTENV_DATABASE_URL`, or the default one.
    pub async fn new() -> Result<Self, DeploymentError> {
        let mut config = load_config_from_file(&config_path()).await;
        config.apply_env_overrides();
        config.validate()?;

        let db = match std::env::var("WTENV_DATABASE_URL") {
            Ok(url) if !url.trim().is_empty() => DBService::connect(&url).await?,
            _ => DBService::new().await?,
        };
        Ok(Self::from_parts(config, db))
    }

    pub fn from_parts(config: Config, db: DBService) -> Self {
        let config = Arc::new(config);
        let environment = LocalEnvironmentService::new(db.clone(), config.clone());
        tracing::info!(
            container_isolation = config.container_isolation,
            runtime = %config.container_runtime,
            "Environment engine ready"
        );
        Self {
            config,
            db,
            environment,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn db(&self) -> &DBService {
        &self.db
    }

    pub fn environment(&self) -> &LocalEnvironmentService {
        &self.environment
    }
}
