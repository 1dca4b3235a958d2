//! Per-worktree container lifecycle on top of a docker-compatible CLI.
//!
//! Container state is never cached: every existence or liveness question is
//! answered by asking the runtime, since containers can be stopped or removed
//! outside this process at any time.
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use url::Url;
use utils::text::short_uuid;
use uuid::Uuid;

use super::{command_runner::ExecutionTarget, config::Config};

/// Label attached to every container so it can be traced back to its worktree.
pub const WORKTREE_LABEL: &str = "wtenv.worktree";
const SSH_CONTAINER_PORT: u16 = 22;

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("Container runtime '{0}' is not available")]
    RuntimeUnavailable(String),
    #[error("Container runtime command '{command}' failed (exit code {code:?}): {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("Container {0} does not exist")]
    ContainerNotFound(String),
    #[error("Port {base} + {offset} is outside the valid port range")]
    PortOutOfRange { base: u16, offset: i64 },
    #[error("Invalid keepalive command: {0}")]
    InvalidKeepalive(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// A docker-compatible container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Executable used for `exec` invocations routed through the command runner.
    fn program(&self) -> &str;

    async fn invoke(&self, args: &[String]) -> Result<RuntimeOutput, ContainerError>;
}

/// Shells out to the runtime binary (`docker`, `podman`).
#[derive(Debug, Clone)]
pub struct CliRuntime {
    program: String,
    env: Option<HashMap<String, String>>,
}

impl CliRuntime {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            env: None,
        }
    }

    /// Run the runtime CLI with exactly this environment.
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }
}

#[async_trait]
impl ContainerRuntime for CliRuntime {
    fn program(&self) -> &str {
        &self.program
    }

    async fn invoke(&self, args: &[String]) -> Result<RuntimeOutput, ContainerError> {
        let mut command = Command::new(&self.program);
        command.args(args).kill_on_drop(true);
        if let Some(env) = &self.env {
            command.env_clear().envs(env);
        }
        let output = command.output().await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ContainerError::RuntimeUnavailable(self.program.clone())
            } else {
                ContainerError::Io(e)
            }
        })?;
        Ok(RuntimeOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ContainerSettings {
    pub name_prefix: String,
    pub image: String,
    pub keepalive_command: String,
    pub ssh_base_port: u16,
    pub app_base_port: u16,
    pub stop_grace: Duration,
}

impl From<&Config> for ContainerSettings {
    fn from(config: &Config) -> Self {
        Self {
            name_prefix: config.container_name_prefix.clone(),
            image: config.container_image.clone(),
            keepalive_command: config.container_keepalive_command.clone(),
            ssh_base_port: config.ssh_base_port,
            app_base_port: config.app_base_port,
            stop_grace: config.container_stop_grace(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreateContainerRequest {
    pub worktree_id: Uuid,
    pub unique_id: i64,
    pub worktree_path: PathBuf,
    pub repo_path: PathBuf,
    /// Port the application listens on inside the container, if known.
    pub app_internal_port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub container_name: String,
    pub ssh_port: u16,
    /// Host port bound to the application port, when one was published.
    pub app_port: Option<u16>,
}

#[derive(Clone)]
pub struct ContainerManager {
    runtime: Arc<dyn ContainerRuntime>,
    settings: ContainerSettings,
}

impl ContainerManager {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, settings: ContainerSettings) -> Self {
        Self { runtime, settings }
    }

    pub fn container_name(&self, worktree_id: &Uuid) -> String {
        format!("{}{}", self.settings.name_prefix, short_uuid(worktree_id))
    }

    pub fn ssh_port(&self, unique_id: i64) -> Result<u16, ContainerError> {
        offset_port(self.settings.ssh_base_port, unique_id)
    }

    pub fn app_port(&self, unique_id: i64) -> Result<u16, ContainerError> {
        offset_port(self.settings.app_base_port, unique_id)
    }

    /// Target that routes commands through `exec` into the named container.
    pub fn exec_target(&self, container_name: &str) -> ExecutionTarget {
        ExecutionTarget::Container {
            runtime: self.runtime.program().to_string(),
            name: container_name.to_string(),
        }
    }

    pub async fn container_exists(&self, name: &str) -> Result<bool, ContainerError> {
        let output = self.invoke(&["inspect", name]).await?;
        if output.success {
            Ok(true)
        } else if is_missing(&output) {
            Ok(false)
        } else {
            Err(failure("inspect", &output))
        }
    }

    pub async fn is_container_running(&self, name: &str) -> Result<bool, ContainerError> {
        let output = self
            .invoke(&["inspect", "-f", "{{.State.Running}}", name])
            .await?;
        if output.success {
            Ok(output.stdout.trim() == "true")
        } else if is_missing(&output) {
            Ok(false)
        } else {
            Err(failure("inspect", &output))
        }
    }

    /// Create and start the worktree's container.
    ///
    /// The worktree is mounted read-write at its host path together with the
    /// parent repository, whose object store the worktree's git metadata
    /// points at. A container that fails to start is removed again.
    pub async fn create_container(
        &self,
        request: &CreateContainerRequest,
    ) -> Result<ContainerInfo, ContainerError> {
        let name = self.container_name(&request.worktree_id);
        let ssh_port = self.ssh_port(request.unique_id)?;
        let app_port = match request.app_internal_port {
            Some(internal) => Some((self.app_port(request.unique_id)?, internal)),
            None => None,
        };
        let keepalive = shlex::split(&self.settings.keepalive_command)
            .filter(|argv| !argv.is_empty())
            .ok_or_else(|| {
                ContainerError::InvalidKeepalive(self.settings.keepalive_command.clone())
            })?;

        let mut args = vec![
            "create".to_string(),
            "--name".to_string(),
            name.clone(),
            "--label".to_string(),
            format!("{WORKTREE_LABEL}={}", request.worktree_id),
            "-v".to_string(),
            bind_mount(&request.worktree_path),
            "-v".to_string(),
            bind_mount(&request.repo_path),
            "-w".to_string(),
            request.worktree_path.to_string_lossy().to_string(),
            "-p".to_string(),
            format!("{ssh_port}:{SSH_CONTAINER_PORT}"),
        ];
        if let Some((external, internal)) = app_port {
            args.push("-p".to_string());
            args.push(format!("{external}:{internal}"));
        }
        args.push(self.settings.image.clone());
        args.extend(keepalive);

        let output = self.runtime.invoke(&args).await?;
        if !output.success {
            return Err(failure("create", &output));
        }

        let output = self.invoke(&["start", &name]).await?;
        if !output.success {
            let err = failure("start", &output);
            if let Err(cleanup) = self.invoke(&["rm", "-f", &name]).await {
                tracing::warn!("Failed to remove unstartable container {}: {}", name, cleanup);
            }
            return Err(err);
        }

        tracing::info!(
            worktree_id = %request.worktree_id,
            container = %name,
            ssh_port,
            "Created container"
        );
        Ok(ContainerInfo {
            container_name: name,
            ssh_port,
            app_port: app_port.map(|(external, _)| external),
        })
    }

    /// Start the worktree's container if it exists but is stopped.
    pub async fn ensure_container_running(&self, worktree_id: &Uuid) -> Result<(), ContainerError> {
        let name = self.container_name(worktree_id);
        if !self.container_exists(&name).await? {
            return Err(ContainerError::ContainerNotFound(name));
        }
        if self.is_container_running(&name).await? {
            return Ok(());
        }
        let output = self.invoke(&["start", &name]).await?;
        if !output.success {
            return Err(failure("start", &output));
        }
        tracing::info!(worktree_id = %worktree_id, container = %name, "Started existing container");
        Ok(())
    }

    /// Reuse the worktree's container if present, otherwise create it.
    pub async fn resolve_container(
        &self,
        request: &CreateContainerRequest,
    ) -> Result<ContainerInfo, ContainerError> {
        let name = self.container_name(&request.worktree_id);
        if !self.container_exists(&name).await? {
            return self.create_container(request).await;
        }
        self.ensure_container_running(&request.worktree_id).await?;
        let app_port = match request.app_internal_port {
            Some(internal) => self.published_app_port(&name, request.unique_id, internal).await,
            None => None,
        };
        Ok(ContainerInfo {
            container_name: name,
            ssh_port: self.ssh_port(request.unique_id)?,
            app_port,
        })
    }

    /// Host port bound to `internal`, if it is this worktree's app port.
    pub async fn published_app_port(
        &self,
        name: &str,
        unique_id: i64,
        internal: u16,
    ) -> Option<u16> {
        let expected = self.app_port(unique_id).ok()?;
        let output = self
            .invoke(&["port", name, &format!("{internal}/tcp")])
            .await
            .ok()?;
        let published = output.success
            && output
                .stdout
                .lines()
                .any(|line| line.trim().ends_with(&format!(":{expected}")));
        published.then_some(expected)
    }

    /// Stop the worktree's container and everything running in it. The
    /// container itself is kept for the next start.
    pub async fn stop_container(&self, worktree_id: &Uuid) -> Result<(), ContainerError> {
        let name = self.container_name(worktree_id);
        let grace = self.settings.stop_grace.as_secs().to_string();

        let output = self.invoke(&["stop", "-t", &grace, &name]).await?;
        if !output.success && !is_missing(&output) {
            return Err(failure("stop", &output));
        }
        tracing::info!(worktree_id = %worktree_id, container = %name, "Stopped container");
        Ok(())
    }

    /// Stop and remove the worktree's container. A missing container is fine.
    pub async fn destroy_container(&self, worktree_id: &Uuid) -> Result<(), ContainerError> {
        let name = self.container_name(worktree_id);
        if let Err(e) = self.stop_container(worktree_id).await {
            tracing::warn!(container = %name, "Graceful stop failed, forcing removal: {}", e);
        }

        let output = self.invoke(&["rm", "-f", &name]).await?;
        if !output.success && !is_missing(&output) {
            return Err(failure("rm", &output));
        }
        tracing::info!(worktree_id = %worktree_id, container = %name, "Destroyed container");
        Ok(())
    }

    async fn invoke(&self, args: &[&str]) -> Result<RuntimeOutput, ContainerError> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        self.runtime.invoke(&args).await
    }
}

/// Port the application listens on, taken from its configured URL.
pub fn app_port_from_url(url: &str) -> Option<u16> {
    Url::parse(url).ok()?.port_or_known_default()
}

fn offset_port(base: u16, offset: i64) -> Result<u16, ContainerError> {
    i64::from(base)
        .checked_add(offset)
        .filter(|_| offset >= 0)
        .and_then(|port| u16::try_from(port).ok())
        .ok_or(ContainerError::PortOutOfRange { base, offset })
}

fn bind_mount(path: &Path) -> String {
    let path = path.to_string_lossy();
    format!("{path}:{path}")
}

fn is_missing(output: &RuntimeOutput) -> bool {
    output.stderr.to_lowercase().contains("no such")
}

fn failure(command: &str, output: &RuntimeOutput) -> ContainerError {
    ContainerError::CommandFailed {
        command: command.to_string(),
        code: output.code,
        stderr: output.stderr.clone(),
    }
}
