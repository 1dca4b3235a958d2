use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use dashmap::DashMap;
use db::{
    DBService,
    models::{
        environment::{
            AccessUrl, EnvironmentPatch, EnvironmentStatus, HealthCheck, HealthStatus,
        },
        worktree::Worktree,
    },
};
use services::services::{
    command_runner::{CommandRequest, CommandRunner, ExecutionTarget},
    config::Config,
    container_runtime::{
        CliRuntime, ContainerError, ContainerManager, ContainerRuntime, ContainerSettings,
        CreateContainerRequest, app_port_from_url,
    },
    environment::{
        CommandKind, EnvironmentError, EnvironmentOutcome, EnvironmentService, HealthTickOutcome,
        LogsResult, build_log_path,
    },
    health::HealthProber,
};
use tokio::sync::{Mutex, OwnedMutexGuard};
use url::Url;
use uuid::Uuid;

use crate::process_store::{ManagedProcess, ProcessStore};

pub const NUKED_MESSAGE: &str = "nuked: data destroyed";

#[derive(Debug, Clone, Copy)]
struct ContainerAccess {
    app_port: Option<u16>,
}

#[derive(Clone)]
pub struct LocalEnvironmentService {
    db: DBService,
    config: Arc<Config>,
    runner: CommandRunner,
    containers: ContainerManager,
    prober: HealthProber,
    processes: ProcessStore,
    locks: Arc<DashMap<Uuid, Arc<Mutex<()>>>>,
    /// Scrubbed environment handed to every lifecycle command.
    command_env: Arc<HashMap<String, String>>,
}

impl LocalEnvironmentService {
    pub fn new(db: DBService, config: Arc<Config>) -> Self {
        let command_env = utils::env::scrubbed_env(&config.scrub_env_vars);
        let runtime = Arc::new(
            CliRuntime::new(config.container_runtime.clone()).with_env(command_env.clone()),
        );
        Self::build(db, config, runtime, command_env)
    }

    /// Use a specific container runtime instead of the configured CLI.
    pub fn with_runtime(
        db: DBService,
        config: Arc<Config>,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Self {
        let command_env = utils::env::scrubbed_env(&config.scrub_env_vars);
        Self::build(db, config, runtime, command_env)
    }

    fn build(
        db: DBService,
        config: Arc<Config>,
        runtime: Arc<dyn ContainerRuntime>,
        command_env: HashMap<String, String>,
    ) -> Self {
        let containers =
            ContainerManager::new(runtime.clone(), ContainerSettings::from(config.as_ref()));
        let prober = HealthProber::new(config.probe_timeout(), runtime);
        Self {
            db,
            config,
            runner: CommandRunner::new(),
            containers,
            prober,
            processes: ProcessStore::new(),
            locks: Arc::new(DashMap::new()),
            command_env: Arc::new(command_env),
        }
    }

    async fn lock(&self, worktree_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = self.locks.entry(worktree_id).or_default().clone();
        lock.lock_owned().await
    }

    /// Drop the worktree's lock unless another caller still holds or waits on it.
    fn release_lock(&self, worktree_id: Uuid) {
        self.locks
            .remove_if(&worktree_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    fn request(&self, kind: CommandKind, command: &str, worktree: &Worktree) -> CommandRequest {
        CommandRequest::new(kind.to_string(), command, &worktree.path)
            .env(self.command_env.as_ref().clone())
            .log_path(build_log_path(&worktree.path))
    }

    /// Write only the fields of `patch` that differ from the loaded snapshot.
    async fn persist(
        &self,
        worktree: &mut Worktree,
        patch: EnvironmentPatch,
    ) -> Result<(), EnvironmentError> {
        let current = &worktree.environment;
        let mut effective = EnvironmentPatch::default();

        if let Some(status) = patch.status
            && status != current.status
        {
            effective.status = Some(status);
        }
        if let Some(check) = patch.last_health_check {
            let changed = match (&check, &current.last_health_check) {
                (Some(new), Some(old)) => !new.same_content(old),
                (None, None) => false,
                _ => true,
            };
            if changed {
                effective.last_health_check = Some(check);
            }
        }
        if let Some(urls) = patch.access_urls
            && urls != current.access_urls
        {
            effective.access_urls = Some(urls);
        }
        if let Some(pid) = patch.pid
            && pid != current.process.map(|p| p.pid)
        {
            effective.pid = Some(pid);
        }

        if effective.is_empty() {
            return Ok(());
        }
        if !Worktree::patch_environment(&self.db.pool, worktree.id, &effective).await? {
            return Err(EnvironmentError::WorktreeNotFound(worktree.id));
        }
        effective.apply_to(&mut worktree.environment);
        Ok(())
    }

    async fn record_failure(
        &self,
        worktree: &mut Worktree,
        message: String,
    ) -> Result<EnvironmentOutcome, EnvironmentError> {
        tracing::warn!(worktree_id = %worktree.id, "{}", message);
        let patch = EnvironmentPatch::status(EnvironmentStatus::Error)
            .with_health_check(HealthCheck::now(HealthStatus::Unhealthy, &message))
            .with_access_urls(Vec::new());
        self.persist(worktree, patch).await?;
        Ok(outcome(worktree, false, Some(message)))
    }

    /// Pick where the start command runs, creating the container on demand.
    /// Container trouble degrades to the host and is reported as a note.
    async fn start_target(&self, worktree: &mut Worktree) -> (ExecutionTarget, Option<String>) {
        if !self.config.container_isolation {
            return (ExecutionTarget::Host, None);
        }

        let request = CreateContainerRequest {
            worktree_id: worktree.id,
            unique_id: worktree.unique_id,
            worktree_path: worktree.path.clone(),
            repo_path: worktree.repo_path.clone(),
            app_internal_port: worktree
                .environment_config
                .health_check_url()
                .and_then(app_port_from_url),
        };
        match self.containers.resolve_container(&request).await {
            Ok(info) => {
                let cached = worktree.container_name.as_deref()
                    == Some(info.container_name.as_str())
                    && worktree.ssh_port == Some(info.ssh_port);
                if !cached {
                    match Worktree::set_container_info(
                        &self.db.pool,
                        worktree.id,
                        Some(&info.container_name),
                        Some(info.ssh_port),
                    )
                    .await
                    {
                        Ok(()) => {
                            worktree.container_name = Some(info.container_name.clone());
                            worktree.ssh_port = Some(info.ssh_port);
                        }
                        Err(e) => tracing::warn!(
                            worktree_id = %worktree.id,
                            "Failed to cache container info: {}",
                            e
                        ),
                    }
                }
                (self.containers.exec_target(&info.container_name), None)
            }
            Err(e) => {
                tracing::warn!(
                    worktree_id = %worktree.id,
                    "Container unavailable, falling back to host execution: {}",
                    e
                );
                (
                    ExecutionTarget::Host,
                    Some(format!("container unavailable, running on host: {e}")),
                )
            }
        }
    }

    /// Target for commands that act on an environment that may already exist.
    /// Never creates a container.
    async fn existing_target(
        &self,
        worktree: &Worktree,
    ) -> Result<ExecutionTarget, ContainerError> {
        if !self.config.container_isolation {
            return Ok(ExecutionTarget::Host);
        }
        let name = self.containers.container_name(&worktree.id);
        if !self.containers.container_exists(&name).await? {
            return Ok(ExecutionTarget::Host);
        }
        self.containers.ensure_container_running(&worktree.id).await?;
        Ok(self.containers.exec_target(&name))
    }

    /// Name of the worktree's container if it is running right now.
    async fn running_container(&self, worktree: &Worktree) -> Option<String> {
        if !self.config.container_isolation {
            return None;
        }
        let name = self.containers.container_name(&worktree.id);
        match self.containers.is_container_running(&name).await {
            Ok(true) => Some(name),
            Ok(false) => None,
            Err(e) => {
                tracing::debug!(worktree_id = %worktree.id, "Container check failed: {}", e);
                None
            }
        }
    }

    /// URLs recorded on promotion. `container` carries the host port bound to
    /// the app inside the running container, if one was published.
    fn access_urls(
        &self,
        worktree: &Worktree,
        container: Option<ContainerAccess>,
    ) -> Vec<AccessUrl> {
        let mut urls = Vec::new();
        let health_url = worktree
            .environment_config
            .health_check_url()
            .and_then(|url| Url::parse(url).ok());
        if let Some(health_url) = health_url {
            let app = match container {
                Some(access) => access.app_port.map(|port| {
                    let mut url = format!("http://localhost:{port}{}", health_url.path());
                    if let Some(query) = health_url.query() {
                        url.push('?');
                        url.push_str(query);
                    }
                    url
                }),
                None => Some(health_url.origin())
                    .filter(|origin| origin.is_tuple())
                    .map(|origin| origin.ascii_serialization()),
            };
            if let Some(app) = app {
                urls.push(AccessUrl::new("app", app));
            }
        }
        if container.is_some()
            && let Some(port) = worktree.ssh_port
        {
            urls.push(AccessUrl::new("ssh", format!("ssh://localhost:{port}")));
        }
        urls
    }

    /// Access details of the worktree's running container.
    async fn container_access(&self, worktree: &Worktree, name: &str) -> ContainerAccess {
        let internal = worktree
            .environment_config
            .health_check_url()
            .and_then(app_port_from_url);
        let app_port = match internal {
            Some(internal) => {
                self.containers
                    .published_app_port(name, worktree.unique_id, internal)
                    .await
            }
            None => None,
        };
        ContainerAccess { app_port }
    }

    /// Kill the tracked start command, if any. Returns a note on failure.
    async fn kill_tracked(&self, worktree_id: Uuid) -> Option<String> {
        let process = self.processes.remove(&worktree_id).await?;
        match process.handle.kill().await {
            Ok(()) => {
                tracing::info!(
                    worktree_id = %worktree_id,
                    pid = ?process.pid,
                    "Killed tracked start process"
                );
                None
            }
            Err(e) => Some(format!("failed to kill start process: {e}")),
        }
    }

    /// Track a start command and drop the entry once it exits on its own.
    async fn track(&self, worktree_id: Uuid, process: ManagedProcess) {
        let pid = process.pid;
        let handle = process.handle.clone();
        if let Some(replaced) = self.processes.insert(worktree_id, process).await
            && let Err(e) = replaced.handle.kill().await
        {
            tracing::warn!(
                worktree_id = %worktree_id,
                "Failed to kill replaced start process: {}",
                e
            );
        }

        let processes = self.processes.clone();
        tokio::spawn(async move {
            let status = handle.wait().await;
            if processes.remove_if_pid(&worktree_id, pid).await {
                tracing::info!(
                    worktree_id = %worktree_id,
                    ?pid,
                    "Start process exited on its own: {:?}",
                    status
                );
            }
        });
    }

    async fn start_locked(
        &self,
        worktree_id: Uuid,
    ) -> Result<EnvironmentOutcome, EnvironmentError> {
        let mut worktree = self.load_worktree(worktree_id).await?;
        if worktree.environment.status == EnvironmentStatus::Running {
            return Err(EnvironmentError::AlreadyRunning);
        }
        let Some(command) = worktree.environment_config.start_command().map(str::to_string) else {
            return Err(EnvironmentError::MissingCommand(CommandKind::Start));
        };

        if let Some(note) = self.kill_tracked(worktree_id).await {
            tracing::warn!(worktree_id = %worktree_id, "{}", note);
        }

        self.persist(
            &mut worktree,
            EnvironmentPatch::status(EnvironmentStatus::Starting)
                .clearing_health_check()
                .with_access_urls(Vec::new()),
        )
        .await?;

        let (target, note) = self.start_target(&mut worktree).await;
        let request = self.request(CommandKind::Start, &command, &worktree);
        tracing::info!(worktree_id = %worktree_id, %target, "Starting environment");

        let running = match self.runner.spawn(&target, &request).await {
            Ok(running) => running,
            Err(e) => {
                return self
                    .record_failure(&mut worktree, format!("start command failed: {e}"))
                    .await;
            }
        };

        let liveness = match running.wait_for_exit(self.config.start_grace()).await {
            Some(status) if status.success() => {
                self.persist(&mut worktree, EnvironmentPatch::default().with_pid(None))
                    .await?;
                "start command completed".to_string()
            }
            Some(status) => {
                let log_path = build_log_path(&worktree.path);
                return self
                    .record_failure(
                        &mut worktree,
                        format!("start command {status}; see {}", log_path.display()),
                    )
                    .await;
            }
            None => {
                let pid = running.pid();
                self.track(
                    worktree_id,
                    ManagedProcess::new(running, request.log_path.clone().unwrap_or_default()),
                )
                .await;
                self.persist(&mut worktree, EnvironmentPatch::default().with_pid(pid))
                    .await?;
                match pid {
                    Some(pid) => format!("start command running (pid {pid})"),
                    None => "start command running".to_string(),
                }
            }
        };

        // Readiness comes only from a health probe; without a URL the
        // environment stays `starting` and just records what is known.
        let message = match (worktree.environment_config.health_check_url().is_some(), note) {
            (true, None) => None,
            (true, Some(note)) => Some(note),
            (false, None) => Some(format!("{liveness}; no health check configured")),
            (false, Some(note)) => Some(format!("{liveness}; no health check configured; {note}")),
        };
        if let Some(message) = &message {
            self.persist(
                &mut worktree,
                EnvironmentPatch::default()
                    .with_health_check(HealthCheck::now(HealthStatus::Unknown, message)),
            )
            .await?;
        }
        Ok(outcome(&worktree, true, message))
    }

    async fn stop_locked(&self, worktree_id: Uuid) -> Result<EnvironmentOutcome, EnvironmentError> {
        let mut worktree = self.load_worktree(worktree_id).await?;
        self.persist(&mut worktree, EnvironmentPatch::status(EnvironmentStatus::Stopping))
            .await?;

        let mut notes = Vec::new();
        match worktree.environment_config.stop_command().map(str::to_string) {
            Some(command) => {
                match self.existing_target(&worktree).await {
                    Ok(target) => {
                        let request = self
                            .request(CommandKind::Stop, &command, &worktree)
                            .timeout(self.config.command_timeout());
                        match self.runner.run(&target, &request).await {
                            Ok(result) => {
                                if let Some(failure) = result.failure_message() {
                                    notes.push(format!("stop command {failure}"));
                                }
                            }
                            Err(e) => notes.push(format!("stop command failed: {e}")),
                        }
                    }
                    Err(e) => notes.push(format!("stop command not run: {e}")),
                }
                notes.extend(self.kill_tracked(worktree_id).await);
            }
            None => {
                if self.processes.contains(&worktree_id).await {
                    notes.extend(self.kill_tracked(worktree_id).await);
                } else if let Some(record) = worktree.environment.process {
                    match utils::process::terminate_pid(record.pid) {
                        Ok(true) => tracing::info!(
                            worktree_id = %worktree_id,
                            pid = record.pid,
                            "Terminated start process by persisted pid"
                        ),
                        Ok(false) => tracing::debug!(
                            worktree_id = %worktree_id,
                            pid = record.pid,
                            "Persisted pid no longer running"
                        ),
                        Err(e) => {
                            notes.push(format!("failed to terminate pid {}: {e}", record.pid))
                        }
                    }
                }
                // Killing the exec client leaves the app running inside the
                // container, so the container itself has to stop.
                if self.running_container(&worktree).await.is_some()
                    && let Err(e) = self.containers.stop_container(&worktree_id).await
                {
                    notes.push(format!("failed to stop container: {e}"));
                }
            }
        }

        let mut patch = EnvironmentPatch::status(EnvironmentStatus::Stopped)
            .with_access_urls(Vec::new())
            .with_pid(None);
        let message = if notes.is_empty() {
            None
        } else {
            let message = format!("stopped with errors: {}", notes.join("; "));
            tracing::warn!(worktree_id = %worktree_id, "{}", message);
            patch = patch.with_health_check(HealthCheck::now(HealthStatus::Unknown, &message));
            Some(message)
        };
        self.persist(&mut worktree, patch).await?;
        tracing::info!(worktree_id = %worktree_id, "Environment stopped");
        Ok(outcome(&worktree, message.is_none(), message))
    }
}

fn outcome(worktree: &Worktree, succeeded: bool, message: Option<String>) -> EnvironmentOutcome {
    EnvironmentOutcome {
        worktree_id: worktree.id,
        succeeded,
        message,
        environment: worktree.environment.clone(),
    }
}

#[async_trait]
impl EnvironmentService for LocalEnvironmentService {
    fn db(&self) -> &DBService {
        &self.db
    }

    fn config(&self) -> &Config {
        &self.config
    }

    fn containers(&self) -> &ContainerManager {
        &self.containers
    }

    async fn has_tracked_process(&self, worktree_id: Uuid) -> bool {
        self.processes.contains(&worktree_id).await
    }

    async fn start(&self, worktree_id: Uuid) -> Result<EnvironmentOutcome, EnvironmentError> {
        let _guard = self.lock(worktree_id).await;
        self.start_locked(worktree_id).await
    }

    async fn stop(&self, worktree_id: Uuid) -> Result<EnvironmentOutcome, EnvironmentError> {
        let _guard = self.lock(worktree_id).await;
        self.stop_locked(worktree_id).await
    }

    async fn restart(&self, worktree_id: Uuid) -> Result<EnvironmentOutcome, EnvironmentError> {
        let _guard = self.lock(worktree_id).await;
        let worktree = self.load_worktree(worktree_id).await?;
        if worktree.environment.status == EnvironmentStatus::Running {
            let stopped = self.stop_locked(worktree_id).await?;
            if let Some(message) = &stopped.message {
                tracing::warn!(worktree_id = %worktree_id, "Restart continuing after: {}", message);
            }
            tokio::time::sleep(self.config.restart_delay()).await;
        }
        self.start_locked(worktree_id).await
    }

    async fn nuke(&self, worktree_id: Uuid) -> Result<EnvironmentOutcome, EnvironmentError> {
        let _guard = self.lock(worktree_id).await;
        let mut worktree = self.load_worktree(worktree_id).await?;
        let Some(command) = worktree.environment_config.nuke_command().map(str::to_string) else {
            return Err(EnvironmentError::MissingCommand(CommandKind::Nuke));
        };

        self.persist(&mut worktree, EnvironmentPatch::status(EnvironmentStatus::Stopping))
            .await?;
        if let Some(note) = self.kill_tracked(worktree_id).await {
            tracing::warn!(worktree_id = %worktree_id, "{}", note);
        }

        let target = match self.existing_target(&worktree).await {
            Ok(target) => target,
            Err(e) => {
                return self
                    .record_failure(&mut worktree, format!("nuke command not run: {e}"))
                    .await;
            }
        };
        tracing::warn!(worktree_id = %worktree_id, %target, "Nuking environment");
        let request = self
            .request(CommandKind::Nuke, &command, &worktree)
            .timeout(self.config.command_timeout());
        let result = match self.runner.run(&target, &request).await {
            Ok(result) => result,
            Err(e) => {
                return self
                    .record_failure(&mut worktree, format!("nuke command failed: {e}"))
                    .await;
            }
        };
        if let Some(failure) = result.failure_message() {
            return self
                .record_failure(&mut worktree, format!("nuke command {failure}"))
                .await;
        }

        self.persist(
            &mut worktree,
            EnvironmentPatch::status(EnvironmentStatus::Stopped)
                .with_health_check(HealthCheck::now(HealthStatus::Unknown, NUKED_MESSAGE))
                .with_access_urls(Vec::new())
                .with_pid(None),
        )
        .await?;
        Ok(outcome(&worktree, true, Some(NUKED_MESSAGE.to_string())))
    }

    async fn health_tick(&self, worktree_id: Uuid) -> Result<HealthTickOutcome, EnvironmentError> {
        let _guard = self.lock(worktree_id).await;
        let mut worktree = self.load_worktree(worktree_id).await?;
        let status = worktree.environment.status;
        if !status.is_probed() {
            return Ok(HealthTickOutcome::Skipped);
        }
        let Some(url) = worktree
            .environment_config
            .health_check_url()
            .map(str::to_string)
        else {
            return Ok(HealthTickOutcome::Skipped);
        };

        let container = self.running_container(&worktree).await;
        let probe = self.prober.probe(&url, container.as_deref()).await;

        match (status, probe.healthy) {
            (EnvironmentStatus::Starting, true) => {
                let access = match &container {
                    Some(name) => Some(self.container_access(&worktree, name).await),
                    None => None,
                };
                let urls = self.access_urls(&worktree, access);
                self.persist(
                    &mut worktree,
                    EnvironmentPatch::status(EnvironmentStatus::Running)
                        .with_health_check(HealthCheck::now(HealthStatus::Healthy, probe.message))
                        .with_access_urls(urls),
                )
                .await?;
                tracing::info!(worktree_id = %worktree_id, "Environment is running");
                Ok(HealthTickOutcome::Promoted)
            }
            (EnvironmentStatus::Starting, false) => Ok(HealthTickOutcome::StillStarting),
            (_, true) => {
                self.persist(
                    &mut worktree,
                    EnvironmentPatch::default()
                        .with_health_check(HealthCheck::now(HealthStatus::Healthy, probe.message)),
                )
                .await?;
                Ok(HealthTickOutcome::Healthy)
            }
            (_, false) => {
                self.persist(
                    &mut worktree,
                    EnvironmentPatch::default().with_health_check(HealthCheck::now(
                        HealthStatus::Unhealthy,
                        probe.message,
                    )),
                )
                .await?;
                Ok(HealthTickOutcome::Unhealthy)
            }
        }
    }

    async fn logs(&self, worktree_id: Uuid) -> Result<LogsResult, EnvironmentError> {
        let worktree = self.load_worktree(worktree_id).await?;
        let Some(command) = worktree.environment_config.logs_command() else {
            return Ok(LogsResult::not_configured());
        };

        let target = self.existing_target(&worktree).await?;
        // Polling logs stays out of the build log.
        let request = CommandRequest::new(CommandKind::Logs.to_string(), command, &worktree.path)
            .env(self.command_env.as_ref().clone())
            .timeout(self.config.logs_timeout())
            .output_limit(self.config.logs_max_bytes);
        let result = self.runner.run(&target, &request).await?;

        let failure = if result.truncated {
            None
        } else {
            result.failure_message()
        };
        Ok(LogsResult::Output {
            output: result.output,
            truncated: result.truncated,
            failure,
        })
    }

    async fn clear_environment(&self, worktree_id: Uuid) -> Result<(), EnvironmentError> {
        {
            let _guard = self.lock(worktree_id).await;
            self.load_worktree(worktree_id).await?;

            if let Some(note) = self.kill_tracked(worktree_id).await {
                tracing::warn!(worktree_id = %worktree_id, "{}", note);
            }
            if self.config.container_isolation
                && let Err(e) = self.containers.destroy_container(&worktree_id).await
            {
                tracing::warn!(worktree_id = %worktree_id, "Failed to destroy container: {}", e);
            }
            Worktree::clear_environment(&self.db.pool, worktree_id).await?;
            tracing::info!(worktree_id = %worktree_id, "Cleared environment");
        }
        self.release_lock(worktree_id);
        Ok(())
    }

    async fn kill_all_running_processes(&self) -> Result<(), EnvironmentError> {
        let tracked = self.processes.drain().await;
        tracing::info!("Killing {} tracked environment processes", tracked.len());
        let kills = tracked.into_iter().map(|(worktree_id, process)| async move {
            if let Err(e) = process.handle.kill().await {
                tracing::error!(
                    worktree_id = %worktree_id,
                    "Failed to kill environment process {:?}: {}",
                    process.pid,
                    e
                );
            }
        });
        futures::future::join_all(kills).await;
        Ok(())
    }
}
