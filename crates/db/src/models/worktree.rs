use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqlitePool, types::Json};
use thiserror::Error;
use uuid::Uuid;

use super::environment::{
    AccessUrl, EnvironmentInstance, EnvironmentPatch, EnvironmentStatus, HealthCheck,
    HealthStatus, ProcessRecord, WorktreeEnvironmentConfig,
};

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("Worktree not found")]
    WorktreeNotFound,
}

const SELECT_COLUMNS: &str = "id, unique_id, path, repo_path, start_command, stop_command, \
    nuke_command, logs_command, health_check_url, env_status, health_checked_at, health_status, \
    health_message, access_urls, process_pid, ssh_port, container_name, archived_at, created_at, \
    updated_at";

#[derive(Debug, FromRow)]
struct WorktreeRow {
    id: Uuid,
    unique_id: i64,
    path: String,
    repo_path: String,
    start_command: Option<String>,
    stop_command: Option<String>,
    nuke_command: Option<String>,
    logs_command: Option<String>,
    health_check_url: Option<String>,
    env_status: EnvironmentStatus,
    health_checked_at: Option<DateTime<Utc>>,
    health_status: Option<HealthStatus>,
    health_message: Option<String>,
    access_urls: Json<Vec<AccessUrl>>,
    process_pid: Option<i64>,
    ssh_port: Option<i64>,
    container_name: Option<String>,
    archived_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

/// A worktree record as seen by the environment engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worktree {
    pub id: Uuid,
    /// Numeric identity from the worktree manager; container ports derive from it.
    pub unique_id: i64,
    pub path: PathBuf,
    pub repo_path: PathBuf,
    pub environment_config: WorktreeEnvironmentConfig,
    pub environment: EnvironmentInstance,
    pub ssh_port: Option<u16>,
    pub container_name: Option<String>,
    pub archived_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<WorktreeRow> for Worktree {
    fn from(row: WorktreeRow) -> Self {
        let last_health_check = match (row.health_checked_at, row.health_status) {
            (Some(timestamp), Some(status)) => Some(HealthCheck {
                timestamp,
                status,
                message: row.health_message,
            }),
            _ => None,
        };

        Worktree {
            id: row.id,
            unique_id: row.unique_id,
            path: PathBuf::from(row.path),
            repo_path: PathBuf::from(row.repo_path),
            environment_config: WorktreeEnvironmentConfig {
                start_command: row.start_command,
                stop_command: row.stop_command,
                nuke_command: row.nuke_command,
                logs_command: row.logs_command,
                health_check_url: row.health_check_url,
            },
            environment: EnvironmentInstance {
                status: row.env_status,
                last_health_check,
                access_urls: row.access_urls.0,
                process: row
                    .process_pid
                    .and_then(|pid| u32::try_from(pid).ok())
                    .map(|pid| ProcessRecord { pid }),
            },
            ssh_port: row.ssh_port.and_then(|p| u16::try_from(p).ok()),
            container_name: row.container_name,
            archived_at: row.archived_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateWorktree {
    pub unique_id: i64,
    pub path: PathBuf,
    pub repo_path: PathBuf,
    #[serde(default)]
    pub environment_config: WorktreeEnvironmentConfig,
}

impl Worktree {
    pub async fn create(
        pool: &SqlitePool,
        id: Uuid,
        data: &CreateWorktree,
    ) -> Result<Self, WorktreeError> {
        let now = Utc::now();
        sqlx::query(
            r#"INSERT INTO worktrees (
                   id, unique_id, path, repo_path,
                   start_command, stop_command, nuke_command, logs_command, health_check_url,
                   created_at, updated_at
               ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(id)
        .bind(data.unique_id)
        .bind(data.path.to_string_lossy().into_owned())
        .bind(data.repo_path.to_string_lossy().into_owned())
        .bind(&data.environment_config.start_command)
        .bind(&data.environment_config.stop_command)
        .bind(&data.environment_config.nuke_command)
        .bind(&data.environment_config.logs_command)
        .bind(&data.environment_config.health_check_url)
        .bind(now)
        .bind(now)
        .execute(pool)
        .await?;

        Self::find_by_id(pool, id)
            .await?
            .ok_or(WorktreeError::WorktreeNotFound)
    }

    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        let row = sqlx::query_as::<_, WorktreeRow>(&format!(
            "SELECT {SELECT_COLUMNS} FROM worktrees WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await?;
        Ok(row.map(Worktree::from))
    }

    /// Non-archived worktrees whose environment is in one of `statuses`.
    pub async fn find_by_environment_status(
        pool: &SqlitePool,
        statuses: &[EnvironmentStatus],
    ) -> Result<Vec<Self>, sqlx::Error> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let mut query = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {SELECT_COLUMNS} FROM worktrees WHERE archived_at IS NULL AND env_status IN ("
        ));
        let mut separated = query.separated(", ");
        for status in statuses {
            separated.push_bind(*status);
        }
        separated.push_unseparated(") ORDER BY unique_id ASC");

        let rows = query
            .build_query_as::<WorktreeRow>()
            .fetch_all(pool)
            .await?;
        Ok(rows.into_iter().map(Worktree::from).collect())
    }

    /// Write the fields set on `patch`. Returns `false` when the worktree does not exist.
    pub async fn patch_environment(
        pool: &SqlitePool,
        id: Uuid,
        patch: &EnvironmentPatch,
    ) -> Result<bool, sqlx::Error> {
        if patch.is_empty() {
            return Ok(true);
        }

        let mut query = QueryBuilder::<Sqlite>::new("UPDATE worktrees SET updated_at = ");
        query.push_bind(Utc::now());
        if let Some(status) = patch.status {
            query.push(", env_status = ").push_bind(status);
        }
        match &patch.last_health_check {
            Some(Some(check)) => {
                query.push(", health_checked_at = ").push_bind(check.timestamp);
                query.push(", health_status = ").push_bind(check.status);
                query
                    .push(", health_message = ")
                    .push_bind(check.message.clone());
            }
            Some(None) => {
                query.push(
                    ", health_checked_at = NULL, health_status = NULL, health_message = NULL",
                );
            }
            None => {}
        }
        if let Some(urls) = &patch.access_urls {
            query.push(", access_urls = ").push_bind(Json(urls.clone()));
        }
        if let Some(pid) = patch.pid {
            query.push(", process_pid = ").push_bind(pid.map(i64::from));
        }
        query.push(" WHERE id = ").push_bind(id);

        let result = query.build().execute(pool).await?;
        Ok(result.rows_affected() > 0)
    }

    /// Cache the container identity back onto the worktree once it exists.
    pub async fn set_container_info(
        pool: &SqlitePool,
        id: Uuid,
        container_name: Option<&str>,
        ssh_port: Option<u16>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE worktrees SET container_name = ?, ssh_port = ?, updated_at = ? WHERE id = ?",
        )
        .bind(container_name)
        .bind(ssh_port.map(i64::from))
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Reset the environment snapshot to its creation defaults and mark the worktree archived.
    pub async fn clear_environment(pool: &SqlitePool, id: Uuid) -> Result<(), sqlx::Error> {
        let now = Utc::now();
        sqlx::query(
            r#"UPDATE worktrees
               SET env_status = 'stopped',
                   health_checked_at = NULL,
                   health_status = NULL,
                   health_message = NULL,
                   access_urls = '[]',
                   process_pid = NULL,
                   ssh_port = NULL,
                   container_name = NULL,
                   archived_at = COALESCE(archived_at, ?),
                   updated_at = ?
               WHERE id = ?"#,
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }
}
