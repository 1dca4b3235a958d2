//! Runs lifecycle shell commands on the host or inside a container.
//!
//! Both targets share one code path: a container invocation is the same shell
//! command wrapped in `<runtime> exec -w <cwd> <name> sh -c <command>`, so the
//! build log, timeout and output capture behave identically in either mode.
//!
//! Every invocation appends a header and a footer to the worktree's build log
//! and mirrors each output chunk to the log file and to `tracing` as it arrives.
use std::{
    collections::HashMap,
    fmt, io,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use command_group::{AsyncCommandGroup, AsyncGroupChild};
use futures::{StreamExt, TryStreamExt, stream::BoxStream};
use serde::Serialize;
use thiserror::Error;
use tokio::{
    fs::{File, OpenOptions},
    io::AsyncWriteExt,
    process::Command,
    sync::{RwLock, watch},
};
use tokio_util::io::ReaderStream;
use utils::text::summarize_line;

/// Bytes of trailing output kept for failure messages when no cap is requested.
const DIAGNOSTIC_TAIL_BYTES: usize = 8 * 1024;
/// How long each signal in the kill escalation gets before the next one is sent.
const KILL_ESCALATION_WAIT: Duration = Duration::from_secs(2);
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Failed to spawn {label}: {source}")]
    Spawn {
        label: String,
        #[source]
        source: io::Error,
    },
    #[error("Failed to open build log {path}: {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Io error: {0}")]
    Io(#[from] io::Error),
    #[error("Failed to kill process: {0}")]
    KillFailed(io::Error),
    #[error("Process output pipes unavailable")]
    MissingPipe,
}

/// Where a command executes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionTarget {
    Host,
    Container { runtime: String, name: String },
}

impl fmt::Display for ExecutionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionTarget::Host => write!(f, "host"),
            ExecutionTarget::Container { name, .. } => write!(f, "container {name}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandRequest {
    /// Fully resolved shell command.
    pub command: String,
    pub cwd: PathBuf,
    /// Replaces the inherited environment when set.
    pub env: Option<HashMap<String, String>>,
    /// Append-only build log; `None` skips the audit trail.
    pub log_path: Option<PathBuf>,
    pub label: String,
    pub timeout: Option<Duration>,
    /// Capture at most this many bytes; exceeding it terminates the process.
    pub output_limit: Option<usize>,
}

impl CommandRequest {
    pub fn new(
        label: impl Into<String>,
        command: impl Into<String>,
        cwd: impl Into<PathBuf>,
    ) -> Self {
        Self {
            command: command.into(),
            cwd: cwd.into(),
            env: None,
            log_path: None,
            label: label.into(),
            timeout: None,
            output_limit: None,
        }
    }

    pub fn env(mut self, env: HashMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }

    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn output_limit(mut self, bytes: usize) -> Self {
        self.output_limit = Some(bytes);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommandStatus {
    Exited { code: i32 },
    Signaled { signal: i32 },
    TimedOut { after_secs: u64 },
    /// The OS could not report how the process ended.
    Unknown,
}

impl CommandStatus {
    pub fn success(&self) -> bool {
        matches!(self, CommandStatus::Exited { code: 0 })
    }

    fn from_exit_status(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return CommandStatus::Exited { code };
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return CommandStatus::Signaled { signal };
            }
        }
        CommandStatus::Unknown
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandStatus::Exited { code } => write!(f, "exited with code {code}"),
            CommandStatus::Signaled { signal } => write!(f, "terminated by signal {signal}"),
            CommandStatus::TimedOut { after_secs } => write!(f, "timed out after {after_secs}s"),
            CommandStatus::Unknown => write!(f, "exit status unavailable"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub status: CommandStatus,
    /// Captured stdout and stderr interleaved in arrival order. Holds the full
    /// capture when an output limit was requested, otherwise a diagnostic tail.
    pub output: String,
    pub truncated: bool,
    pub duration: Duration,
    pub pid: Option<u32>,
}

impl CommandOutcome {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Short human-readable description of why the command failed.
    pub fn failure_message(&self) -> Option<String> {
        if self.success() {
            return None;
        }
        let detail = summarize_line(&self.output, 200);
        if detail.is_empty() {
            Some(self.status.to_string())
        } else {
            Some(format!("{}: {}", self.status, detail))
        }
    }
}

#[derive(Debug, Clone)]
enum OutputChunk {
    Stdout(Bytes),
    Stderr(Bytes),
}

impl OutputChunk {
    fn bytes(&self) -> &[u8] {
        match self {
            OutputChunk::Stdout(b) | OutputChunk::Stderr(b) => b,
        }
    }

    fn stream_name(&self) -> &'static str {
        match self {
            OutputChunk::Stdout(_) => "stdout",
            OutputChunk::Stderr(_) => "stderr",
        }
    }
}

struct OutputCapture {
    buf: Vec<u8>,
    limit: Option<usize>,
    truncated: bool,
}

impl OutputCapture {
    fn new(limit: Option<usize>) -> Self {
        Self {
            buf: Vec::new(),
            limit,
            truncated: false,
        }
    }

    /// Returns `true` once the byte budget is exhausted and the process should stop.
    fn push(&mut self, chunk: &[u8]) -> bool {
        match self.limit {
            Some(limit) => {
                let room = limit.saturating_sub(self.buf.len());
                if chunk.len() > room {
                    self.buf.extend_from_slice(&chunk[..room]);
                    let partial = incomplete_utf8_tail(&self.buf);
                    self.buf.truncate(self.buf.len() - partial);
                    self.truncated = true;
                    return true;
                }
                self.buf.extend_from_slice(chunk);
                false
            }
            None => {
                self.buf.extend_from_slice(chunk);
                if self.buf.len() > DIAGNOSTIC_TAIL_BYTES {
                    let excess = self.buf.len() - DIAGNOSTIC_TAIL_BYTES;
                    self.buf.drain(..excess);
                }
                false
            }
        }
    }

    fn into_output(self) -> (String, bool) {
        (String::from_utf8_lossy(&self.buf).into_owned(), self.truncated)
    }
}

/// Number of trailing bytes that start a UTF-8 sequence the cap cut short.
fn incomplete_utf8_tail(buf: &[u8]) -> usize {
    for back in 1..=buf.len().min(3) {
        let byte = buf[buf.len() - back];
        if byte & 0b1100_0000 == 0b1000_0000 {
            continue;
        }
        let needed = match byte {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        return if needed > back { back } else { 0 };
    }
    0
}

/// Append-only build log shared by every invocation for a worktree.
struct BuildLog {
    path: Option<PathBuf>,
    file: Option<File>,
}

impl BuildLog {
    async fn open(path: Option<&Path>) -> Result<Self, CommandError> {
        let Some(path) = path else {
            return Ok(Self {
                path: None,
                file: None,
            });
        };
        let to_err = |source| CommandError::LogFile {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(to_err)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(to_err)?;
        Ok(Self {
            path: Some(path.to_path_buf()),
            file: Some(file),
        })
    }

    fn is_audited(&self) -> bool {
        self.path.is_some()
    }

    async fn write(&mut self, bytes: &[u8]) {
        let Some(file) = self.file.as_mut() else {
            return;
        };
        let result = match file.write_all(bytes).await {
            Ok(()) => file.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            tracing::warn!(
                "Failed to write build log {:?}, disabling it for this command: {}",
                self.path,
                e
            );
            self.file = None;
        }
    }

    async fn write_header(&mut self, request: &CommandRequest, target: &ExecutionTarget) {
        let header = format!(
            "\n=== {} ===\ncommand: {}\ncwd: {}\ntarget: {}\nstarted: {}\n",
            request.label.to_uppercase(),
            request.command,
            request.cwd.display(),
            target,
            Utc::now().to_rfc3339(),
        );
        self.write(header.as_bytes()).await;
    }

    async fn write_footer(&mut self, status: &CommandStatus, elapsed: Duration, truncated: bool) {
        let mut footer = String::new();
        if truncated {
            footer.push_str("--- output truncated ---\n");
        }
        let exit_code = match status {
            CommandStatus::Exited { code } => code.to_string(),
            _ => "none".to_string(),
        };
        footer.push_str(&format!(
            "=== exit code: {} ({}) | finished: {} | elapsed: {:.1}s ===\n",
            exit_code,
            status,
            Utc::now().to_rfc3339(),
            elapsed.as_secs_f64(),
        ));
        self.write(footer.as_bytes()).await;
    }

    async fn write_spawn_failure(&mut self, error: &io::Error) {
        let footer = format!(
            "=== failed to spawn: {} | finished: {} ===\n",
            error,
            Utc::now().to_rfc3339()
        );
        self.write(footer.as_bytes()).await;
    }
}

fn mirror_chunk(label: &str, chunk: &OutputChunk, audited: bool) {
    let text = String::from_utf8_lossy(chunk.bytes());
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        if audited {
            tracing::info!(
                target: "environment_output",
                label = %label,
                stream = chunk.stream_name(),
                "{}",
                line
            );
        } else {
            tracing::debug!(
                target: "environment_output",
                label = %label,
                stream = chunk.stream_name(),
                "{}",
                line
            );
        }
    }
}

fn build_command(target: &ExecutionTarget, request: &CommandRequest) -> Command {
    let mut command = match target {
        ExecutionTarget::Host => host_shell(&request.command),
        ExecutionTarget::Container { runtime, name } => {
            let mut command = Command::new(runtime);
            command
                .arg("exec")
                .arg("-w")
                .arg(&request.cwd)
                .arg(name)
                .arg("sh")
                .arg("-c")
                .arg(&request.command);
            command
        }
    };
    command
        .current_dir(&request.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(env) = &request.env {
        command.env_clear().envs(env);
    }
    command
}

#[cfg(unix)]
fn host_shell(script: &str) -> Command {
    let mut command = Command::new("sh");
    command.arg("-c").arg(script);
    command
}

#[cfg(windows)]
fn host_shell(script: &str) -> Command {
    let mut command = Command::new("cmd");
    command.arg("/C").arg(script);
    command
}

fn output_stream(
    child: &mut AsyncGroupChild,
) -> Result<BoxStream<'static, io::Result<OutputChunk>>, CommandError> {
    let stdout = child.inner().stdout.take().ok_or(CommandError::MissingPipe)?;
    let stderr = child.inner().stderr.take().ok_or(CommandError::MissingPipe)?;

    let out = ReaderStream::new(stdout).map_ok(OutputChunk::Stdout);
    let err = ReaderStream::new(stderr).map_ok(OutputChunk::Stderr);
    Ok(futures::stream::select(out, err).boxed())
}

/// Terminate the whole process group led by `child`: SIGINT, then SIGTERM, then
/// SIGKILL, giving each signal a moment to take effect.
pub async fn kill_process_group(
    child: &mut AsyncGroupChild,
    pgid: Option<u32>,
) -> Result<(), CommandError> {
    #[cfg(unix)]
    {
        use nix::{
            errno::Errno,
            sys::signal::{Signal, killpg},
            unistd::Pid,
        };

        if let Some(pgid) = pgid.or_else(|| child.id()).and_then(|p| i32::try_from(p).ok()) {
            let pgid = Pid::from_raw(pgid);
            for signal in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGKILL] {
                match killpg(pgid, signal) {
                    Ok(()) => {}
                    Err(Errno::ESRCH) => break,
                    Err(e) => {
                        return Err(CommandError::KillFailed(io::Error::from_raw_os_error(
                            e as i32,
                        )));
                    }
                }

                let deadline = Instant::now() + KILL_ESCALATION_WAIT;
                let mut group_gone = false;
                while Instant::now() < deadline {
                    // Reap the leader so a zombie does not keep the group alive.
                    let _ = child.try_wait();
                    if killpg(pgid, None) == Err(Errno::ESRCH) {
                        group_gone = true;
                        break;
                    }
                    tokio::time::sleep(EXIT_POLL_INTERVAL).await;
                }
                if group_gone {
                    break;
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = pgid;
        if let Err(e) = child.kill().await {
            tracing::debug!("Kill on process group returned: {}", e);
        }
    }

    match tokio::time::timeout(KILL_ESCALATION_WAIT, child.wait()).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => {
            tracing::debug!("Waiting on killed process group failed: {}", e);
            Ok(())
        }
        Err(_) => Err(CommandError::KillFailed(io::Error::new(
            io::ErrorKind::TimedOut,
            "process group did not exit after SIGKILL",
        ))),
    }
}

/// A lifecycle command still running in the background.
///
/// Output keeps flowing into the build log until the process exits, at which
/// point the footer is written. Cloning shares the same underlying process.
#[derive(Clone)]
pub struct RunningCommand {
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    child: Arc<RwLock<AsyncGroupChild>>,
    status_rx: watch::Receiver<Option<CommandStatus>>,
}

impl RunningCommand {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn exit_status(&self) -> Option<CommandStatus> {
        *self.status_rx.borrow()
    }

    /// Wait up to `within` for the process to exit.
    pub async fn wait_for_exit(&self, within: Duration) -> Option<CommandStatus> {
        let mut rx = self.status_rx.clone();
        let status = match tokio::time::timeout(within, rx.wait_for(|s| s.is_some())).await {
            Ok(Ok(status)) => *status,
            _ => None,
        };
        status
    }

    pub async fn wait(&self) -> Option<CommandStatus> {
        let mut rx = self.status_rx.clone();
        let status = match rx.wait_for(|s| s.is_some()).await {
            Ok(status) => *status,
            Err(_) => None,
        };
        status
    }

    pub async fn kill(&self) -> Result<(), CommandError> {
        if self.exit_status().is_some() && !group_alive(self.pid) {
            return Ok(());
        }
        let mut child = self.child.write().await;
        kill_process_group(&mut child, self.pid).await
    }
}

#[cfg(unix)]
fn group_alive(pgid: Option<u32>) -> bool {
    use nix::{sys::signal::killpg, unistd::Pid};
    pgid.and_then(|p| i32::try_from(p).ok())
        .is_some_and(|p| killpg(Pid::from_raw(p), None).is_ok())
}

#[cfg(not(unix))]
fn group_alive(_pgid: Option<u32>) -> bool {
    false
}

#[derive(Clone, Default)]
pub struct CommandRunner;

impl CommandRunner {
    pub fn new() -> Self {
        Self {}
    }

    /// Run a command to completion (or until its timeout or output cap).
    pub async fn run(
        &self,
        target: &ExecutionTarget,
        request: &CommandRequest,
    ) -> Result<CommandOutcome, CommandError> {
        let started = Instant::now();
        let mut log = BuildLog::open(request.log_path.as_deref()).await?;
        log.write_header(request, target).await;

        let mut child = match build_command(target, request).group_spawn() {
            Ok(child) => child,
            Err(source) => {
                log.write_spawn_failure(&source).await;
                return Err(CommandError::Spawn {
                    label: request.label.clone(),
                    source,
                });
            }
        };
        let pid = child.id();
        tracing::debug!(label = %request.label, ?pid, %target, "Spawned command");

        let mut stream = output_stream(&mut child)?;
        let deadline = request
            .timeout
            .map(|timeout| tokio::time::Instant::now() + timeout);
        let mut capture = OutputCapture::new(request.output_limit);
        let mut timed_out = false;
        let mut over_budget = false;

        loop {
            let next = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, stream.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        timed_out = true;
                        break;
                    }
                },
                None => stream.next().await,
            };
            match next {
                Some(Ok(chunk)) => {
                    log.write(chunk.bytes()).await;
                    mirror_chunk(&request.label, &chunk, log.is_audited());
                    if capture.push(chunk.bytes()) {
                        over_budget = true;
                        break;
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!(label = %request.label, "Error reading command output: {}", e);
                    break;
                }
                None => break,
            }
        }
        drop(stream);

        if !timed_out && !over_budget {
            let exited = match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, child.wait()).await.ok(),
                None => Some(child.wait().await),
            };
            match exited {
                Some(result) => {
                    let status = CommandStatus::from_exit_status(result?);
                    return Ok(finish(&mut log, status, capture, started, pid).await);
                }
                None => timed_out = true,
            }
        }

        if timed_out {
            tracing::warn!(label = %request.label, ?pid, "Command timed out, terminating");
        } else {
            tracing::debug!(label = %request.label, ?pid, "Output budget exhausted, terminating");
        }
        kill_process_group(&mut child, pid).await?;

        let status = if timed_out {
            CommandStatus::TimedOut {
                after_secs: request.timeout.unwrap_or_default().as_secs(),
            }
        } else {
            match child.try_wait() {
                Ok(Some(status)) => CommandStatus::from_exit_status(status),
                _ => CommandStatus::Unknown,
            }
        };
        Ok(finish(&mut log, status, capture, started, pid).await)
    }

    /// Spawn a long-running command and return immediately with a handle to it.
    pub async fn spawn(
        &self,
        target: &ExecutionTarget,
        request: &CommandRequest,
    ) -> Result<RunningCommand, CommandError> {
        let started = Instant::now();
        let mut log = BuildLog::open(request.log_path.as_deref()).await?;
        log.write_header(request, target).await;

        let mut child = match build_command(target, request).group_spawn() {
            Ok(child) => child,
            Err(source) => {
                log.write_spawn_failure(&source).await;
                return Err(CommandError::Spawn {
                    label: request.label.clone(),
                    source,
                });
            }
        };
        let pid = child.id();
        tracing::debug!(label = %request.label, ?pid, %target, "Spawned background command");

        let mut stream = output_stream(&mut child)?;
        let child = Arc::new(RwLock::new(child));
        let (status_tx, status_rx) = watch::channel(None);

        let watched = child.clone();
        tokio::spawn(async move {
            loop {
                let polled = {
                    let mut guard = watched.write().await;
                    guard.try_wait()
                };
                match polled {
                    Ok(Some(status)) => {
                        let _ = status_tx.send(Some(CommandStatus::from_exit_status(status)));
                        break;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!("Failed to poll background command: {}", e);
                        let _ = status_tx.send(Some(CommandStatus::Unknown));
                        break;
                    }
                }
                tokio::time::sleep(EXIT_POLL_INTERVAL).await;
            }
        });

        let label = request.label.clone();
        let mut footer_rx = status_rx.clone();
        tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                match item {
                    Ok(chunk) => {
                        log.write(chunk.bytes()).await;
                        mirror_chunk(&label, &chunk, log.is_audited());
                    }
                    Err(e) => {
                        tracing::warn!(label = %label, "Error reading command output: {}", e);
                        break;
                    }
                }
            }
            let status = match footer_rx.wait_for(|s| s.is_some()).await {
                Ok(status) => *status,
                Err(_) => None,
            };
            if let Some(status) = status {
                tracing::info!(label = %label, "Background command {}", status);
                log.write_footer(&status, started.elapsed(), false).await;
            }
        });

        Ok(RunningCommand {
            pid,
            started_at: Utc::now(),
            child,
            status_rx,
        })
    }
}

async fn finish(
    log: &mut BuildLog,
    status: CommandStatus,
    capture: OutputCapture,
    started: Instant,
    pid: Option<u32>,
) -> CommandOutcome {
    let (output, truncated) = capture.into_output();
    let duration = started.elapsed();
    log.write_footer(&status, duration, truncated).await;
    CommandOutcome {
        status,
        output,
        truncated,
        duration,
        pid,
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn request(label: &str, command: &str, cwd: &Path) -> CommandRequest {
        CommandRequest::new(label, command, cwd)
    }

    #[tokio::test]
    async fn successful_command_writes_header_output_and_footer() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join(".wtenv").join("build.log");
        let runner = CommandRunner::new();

        let outcome = runner
            .run(
                &ExecutionTarget::Host,
                &request("start", "echo hello && echo oops >&2", dir.path()).log_path(&log_path),
            )
            .await
            .unwrap();

        assert!(outcome.success());
        assert!(outcome.failure_message().is_none());
        assert!(outcome.output.contains("hello"));
        assert!(outcome.output.contains("oops"));

        let log = tokio::fs::read_to_string(&log_path).await.unwrap();
        assert!(log.contains("=== START ==="));
        assert!(log.contains("command: echo hello && echo oops >&2"));
        assert!(log.contains(&format!("cwd: {}", dir.path().display())));
        assert!(log.contains("hello"));
        assert!(log.contains("=== exit code: 0"));
    }

    #[tokio::test]
    async fn log_is_appended_across_invocations() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("build.log");
        let runner = CommandRunner::new();

        for label in ["start", "stop"] {
            runner
                .run(
                    &ExecutionTarget::Host,
                    &request(label, "true", dir.path()).log_path(&log_path),
                )
                .await
                .unwrap();
        }

        let log = tokio::fs::read_to_string(&log_path).await.unwrap();
        let start = log.find("=== START ===").unwrap();
        let stop = log.find("=== STOP ===").unwrap();
        assert!(start < stop);
    }

    #[tokio::test]
    async fn non_zero_exit_is_classified_with_detail() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = CommandRunner::new()
            .run(
                &ExecutionTarget::Host,
                &request("stop", "echo 'port already in use' >&2; exit 3", dir.path()),
            )
            .await
            .unwrap();

        assert_eq!(outcome.status, CommandStatus::Exited { code: 3 });
        let message = outcome.failure_message().unwrap();
        assert!(message.starts_with("exited with code 3"));
        assert!(message.contains("port already in use"));
    }

    #[tokio::test]
    async fn timeout_terminates_and_is_distinguished() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("build.log");
        let outcome = CommandRunner::new()
            .run(
                &ExecutionTarget::Host,
                &request("nuke", "sleep 30", dir.path())
                    .log_path(&log_path)
                    .timeout(Duration::from_millis(300)),
            )
            .await
            .unwrap();

        assert!(matches!(outcome.status, CommandStatus::TimedOut { .. }));
        assert!(outcome.failure_message().unwrap().contains("timed out"));
        assert!(outcome.duration < Duration::from_secs(10));
        let pid = outcome.pid.unwrap();
        assert!(!utils::process::is_process_running(pid));

        let log = tokio::fs::read_to_string(&log_path).await.unwrap();
        assert!(log.contains("timed out after"));
    }

    #[tokio::test]
    async fn output_cap_returns_exact_budget_and_kills_process() {
        let dir = tempfile::tempdir().unwrap();
        let budget = 4096;
        let outcome = CommandRunner::new()
            .run(
                &ExecutionTarget::Host,
                &request("logs", "yes 'streaming log line'", dir.path())
                    .timeout(Duration::from_secs(10))
                    .output_limit(budget),
            )
            .await
            .unwrap();

        assert!(outcome.truncated);
        assert_eq!(outcome.output.len(), budget);
        assert!(!matches!(outcome.status, CommandStatus::TimedOut { .. }));
        assert!(!utils::process::is_process_running(outcome.pid.unwrap()));
    }

    #[tokio::test]
    async fn output_cap_never_splits_a_multibyte_character() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = CommandRunner::new()
            .run(
                &ExecutionTarget::Host,
                &request("logs", "printf '\\303\\251\\303\\251\\303\\251'", dir.path())
                    .timeout(Duration::from_secs(10))
                    .output_limit(5),
            )
            .await
            .unwrap();

        assert!(outcome.truncated);
        assert_eq!(outcome.output, "éé");
        assert!(outcome.output.len() <= 5);
    }

    #[test]
    fn capture_backs_off_to_last_complete_character() {
        let mut capture = OutputCapture::new(Some(6));
        // "a" + "€" (3 bytes) + "€" cut after one of its bytes
        assert!(capture.push("a€€".as_bytes()));
        let (output, truncated) = capture.into_output();
        assert_eq!(output, "a€");
        assert!(truncated);

        let mut capture = OutputCapture::new(Some(4));
        assert!(capture.push(b"abcdef"));
        assert_eq!(capture.into_output(), ("abcd".to_string(), true));
    }

    #[tokio::test]
    async fn output_within_budget_is_not_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = CommandRunner::new()
            .run(
                &ExecutionTarget::Host,
                &request("logs", "printf abc", dir.path()).output_limit(3),
            )
            .await
            .unwrap();

        assert!(outcome.success());
        assert!(!outcome.truncated);
        assert_eq!(outcome.output, "abc");
    }

    #[tokio::test]
    async fn explicit_env_replaces_inherited_environment() {
        let dir = tempfile::tempdir().unwrap();
        let env = HashMap::from([
            ("PATH".to_string(), std::env::var("PATH").unwrap_or_default()),
            ("APP_MODE".to_string(), "test".to_string()),
        ]);
        let outcome = CommandRunner::new()
            .run(
                &ExecutionTarget::Host,
                &request("start", "echo \"$APP_MODE-${HOME:-unset}\"", dir.path()).env(env),
            )
            .await
            .unwrap();

        assert_eq!(outcome.output.trim(), "test-unset");
    }

    #[tokio::test]
    async fn spawned_command_reports_exit_and_writes_footer() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("build.log");
        let running = CommandRunner::new()
            .spawn(
                &ExecutionTarget::Host,
                &request("start", "echo booting; exit 7", dir.path()).log_path(&log_path),
            )
            .await
            .unwrap();

        let status = running.wait_for_exit(Duration::from_secs(5)).await;
        assert_eq!(status, Some(CommandStatus::Exited { code: 7 }));

        // The footer lands once the output pump drains.
        let mut log = String::new();
        for _ in 0..50 {
            log = tokio::fs::read_to_string(&log_path).await.unwrap();
            if log.contains("=== exit code: 7") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(log.contains("booting"));
        assert!(log.contains("=== exit code: 7"));
    }

    #[tokio::test]
    async fn spawned_command_can_be_killed() {
        let dir = tempfile::tempdir().unwrap();
        let running = CommandRunner::new()
            .spawn(&ExecutionTarget::Host, &request("start", "sleep 30", dir.path()))
            .await
            .unwrap();

        assert_eq!(running.wait_for_exit(Duration::from_millis(200)).await, None);
        running.kill().await.unwrap();

        let status = running.wait_for_exit(Duration::from_secs(5)).await;
        assert!(matches!(status, Some(s) if !s.success()));
        assert!(!utils::process::is_process_running(running.pid().unwrap()));
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does-not-exist");
        let err = CommandRunner::new()
            .run(&ExecutionTarget::Host, &request("start", "true", &missing))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Spawn { .. }));
    }
}
