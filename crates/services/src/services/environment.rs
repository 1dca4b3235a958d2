use std::path::{Path, PathBuf};

use async_trait::async_trait;
use db::{
    DBService,
    models::{
        environment::{
            EnvironmentInstance, EnvironmentPatch, EnvironmentStatus, HealthCheck, HealthStatus,
        },
        worktree::{Worktree, WorktreeError},
    },
};
use serde::Serialize;
use sqlx::Error as SqlxError;
use strum_macros::Display;
use thiserror::Error;
use uuid::Uuid;

use super::{
    command_runner::CommandError,
    config::Config,
    container_runtime::{ContainerError, ContainerManager},
};

pub const NO_LOGS_COMMAND_MESSAGE: &str = "no logs command configured";

/// Build log location inside a worktree.
pub fn build_log_path(worktree_path: &Path) -> PathBuf {
    worktree_path.join(".wtenv").join("build.log")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    Start,
    Stop,
    Nuke,
    Logs,
}

#[derive(Debug, Error)]
pub enum EnvironmentError {
    #[error(transparent)]
    Sqlx(#[from] SqlxError),
    #[error(transparent)]
    Worktree(#[from] WorktreeError),
    #[error("Worktree {0} not found")]
    WorktreeNotFound(Uuid),
    #[error("Environment is already running")]
    AlreadyRunning,
    #[error("No {0} command configured")]
    MissingCommand(CommandKind),
    #[error(transparent)]
    Container(#[from] ContainerError),
    #[error(transparent)]
    Command(#[from] CommandError),
}

impl EnvironmentError {
    /// Rejections raised before any side effect took place.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            EnvironmentError::AlreadyRunning | EnvironmentError::MissingCommand(_)
        )
    }
}

/// Result of a mutating lifecycle operation. Command failures are reported
/// here (and persisted) rather than as errors.
#[derive(Debug, Clone, Serialize)]
pub struct EnvironmentOutcome {
    pub worktree_id: Uuid,
    pub succeeded: bool,
    pub message: Option<String>,
    pub environment: EnvironmentInstance,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnvironmentView {
    pub worktree_id: Uuid,
    pub environment: EnvironmentInstance,
    pub container_name: Option<String>,
    pub ssh_port: Option<u16>,
    /// Whether this process holds a live handle for the start command.
    pub process_tracked: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthTickOutcome {
    /// Not in a probed state, or nothing to probe.
    Skipped,
    Promoted,
    Healthy,
    StillStarting,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogsResult {
    NotConfigured {
        message: String,
    },
    Output {
        output: String,
        truncated: bool,
        /// Set when the logs command itself failed or timed out.
        failure: Option<String>,
    },
}

impl LogsResult {
    pub fn not_configured() -> Self {
        LogsResult::NotConfigured {
            message: NO_LOGS_COMMAND_MESSAGE.to_string(),
        }
    }
}

/// The environment lifecycle state machine.
///
/// Implementations serialize the mutating operations per worktree; log
/// retrieval and reads are not serialized.
#[async_trait]
pub trait EnvironmentService: Send + Sync {
    fn db(&self) -> &DBService;

    fn config(&self) -> &Config;

    fn containers(&self) -> &ContainerManager;

    async fn has_tracked_process(&self, worktree_id: Uuid) -> bool;

    async fn start(&self, worktree_id: Uuid) -> Result<EnvironmentOutcome, EnvironmentError>;

    async fn stop(&self, worktree_id: Uuid) -> Result<EnvironmentOutcome, EnvironmentError>;

    async fn restart(&self, worktree_id: Uuid) -> Result<EnvironmentOutcome, EnvironmentError>;

    async fn nuke(&self, worktree_id: Uuid) -> Result<EnvironmentOutcome, EnvironmentError>;

    async fn health_tick(&self, worktree_id: Uuid) -> Result<HealthTickOutcome, EnvironmentError>;

    async fn logs(&self, worktree_id: Uuid) -> Result<LogsResult, EnvironmentError>;

    /// Reset the environment of an archived or removed worktree.
    async fn clear_environment(&self, worktree_id: Uuid) -> Result<(), EnvironmentError>;

    async fn kill_all_running_processes(&self) -> Result<(), EnvironmentError>;

    async fn load_worktree(&self, worktree_id: Uuid) -> Result<Worktree, EnvironmentError> {
        Worktree::find_by_id(&self.db().pool, worktree_id)
            .await?
            .ok_or(EnvironmentError::WorktreeNotFound(worktree_id))
    }

    async fn get_environment(
        &self,
        worktree_id: Uuid,
    ) -> Result<EnvironmentView, EnvironmentError> {
        let worktree = self.load_worktree(worktree_id).await?;
        Ok(EnvironmentView {
            worktree_id,
            environment: worktree.environment,
            container_name: worktree.container_name,
            ssh_port: worktree.ssh_port,
            process_tracked: self.has_tracked_process(worktree_id).await,
        })
    }

    /// Probe every environment that is starting or running. Returns how many were ticked.
    async fn health_tick_all(&self) -> Result<usize, EnvironmentError> {
        let worktrees = Worktree::find_by_environment_status(
            &self.db().pool,
            &[EnvironmentStatus::Starting, EnvironmentStatus::Running],
        )
        .await?;

        let mut ticked = 0;
        for worktree in worktrees {
            match self.health_tick(worktree.id).await {
                Ok(HealthTickOutcome::Skipped) => {}
                Ok(outcome) => {
                    ticked += 1;
                    tracing::debug!(worktree_id = %worktree.id, ?outcome, "Health tick");
                }
                Err(e) => {
                    tracing::warn!(worktree_id = %worktree.id, "Health tick failed: {}", e);
                }
            }
        }
        Ok(ticked)
    }

    /// Repair snapshots left behind by a previous daemon run. Call at startup.
    ///
    /// Nothing is killed: `stopping` becomes `stopped`, and with container
    /// isolation enabled a `starting`/`running` worktree whose container is not
    /// running becomes `stopped`. Returns how many snapshots were repaired.
    async fn reconcile(&self) -> Result<usize, EnvironmentError> {
        let pool = &self.db().pool;
        let mut repaired = 0;

        let stuck =
            Worktree::find_by_environment_status(pool, &[EnvironmentStatus::Stopping]).await?;
        for worktree in stuck {
            tracing::info!(
                worktree_id = %worktree.id,
                "Found environment stuck in stopping, marking stopped"
            );
            let patch = EnvironmentPatch::status(EnvironmentStatus::Stopped)
                .with_access_urls(Vec::new())
                .with_pid(None)
                .with_health_check(HealthCheck::now(
                    HealthStatus::Unknown,
                    "stop interrupted by daemon restart",
                ));
            if Worktree::patch_environment(pool, worktree.id, &patch).await? {
                repaired += 1;
            }
        }

        if !self.config().container_isolation {
            return Ok(repaired);
        }

        let active = Worktree::find_by_environment_status(
            pool,
            &[EnvironmentStatus::Starting, EnvironmentStatus::Running],
        )
        .await?;
        for worktree in active {
            let Some(name) = worktree.container_name.as_deref() else {
                continue;
            };
            match self.containers().is_container_running(name).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::info!(
                        worktree_id = %worktree.id,
                        container = %name,
                        "Container not running, marking environment stopped"
                    );
                    let patch = EnvironmentPatch::status(EnvironmentStatus::Stopped)
                        .with_access_urls(Vec::new())
                        .with_pid(None)
                        .with_health_check(HealthCheck::now(
                            HealthStatus::Unknown,
                            format!("container {name} was not running at daemon startup"),
                        ));
                    if Worktree::patch_environment(pool, worktree.id, &patch).await? {
                        repaired += 1;
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        worktree_id = %worktree.id,
                        "Could not check container {} during reconciliation: {}",
                        name,
                        e
                    );
                }
            }
        }
        Ok(repaired)
    }
}
