use std::{collections::HashMap, path::PathBuf, sync::Arc};

use chrono::{DateTime, Utc};
use services::services::command_runner::RunningCommand;
use tokio::sync::RwLock;
use uuid::Uuid;

/// A start command this daemon spawned and can still kill.
#[derive(Clone)]
pub struct ManagedProcess {
    pub handle: RunningCommand,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub log_path: PathBuf,
}

impl ManagedProcess {
    pub fn new(handle: RunningCommand, log_path: PathBuf) -> Self {
        Self {
            pid: handle.pid(),
            started_at: handle.started_at(),
            handle,
            log_path,
        }
    }
}

/// Live start-command handles keyed by worktree.
///
/// Held only in memory and rebuilt empty on every daemon start; after a
/// restart the persisted PID is the only (racy) way back to an old process.
#[derive(Clone, Default)]
pub struct ProcessStore {
    inner: Arc<RwLock<HashMap<Uuid, ManagedProcess>>>,
}

impl ProcessStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `process`, returning any handle it replaced.
    pub async fn insert(
        &self,
        worktree_id: Uuid,
        process: ManagedProcess,
    ) -> Option<ManagedProcess> {
        self.inner.write().await.insert(worktree_id, process)
    }

    pub async fn contains(&self, worktree_id: &Uuid) -> bool {
        self.inner.read().await.contains_key(worktree_id)
    }

    pub async fn remove(&self, worktree_id: &Uuid) -> Option<ManagedProcess> {
        self.inner.write().await.remove(worktree_id)
    }

    /// Remove the entry only if it still refers to the process with `pid`.
    pub async fn remove_if_pid(&self, worktree_id: &Uuid, pid: Option<u32>) -> bool {
        let mut map = self.inner.write().await;
        if map.get(worktree_id).is_some_and(|p| p.pid == pid) {
            map.remove(worktree_id);
            true
        } else {
            false
        }
    }

    pub async fn drain(&self) -> Vec<(Uuid, ManagedProcess)> {
        self.inner.write().await.drain().collect()
    }
}
