use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Type;
use strum_macros::{Display, EnumString};

#[derive(
    Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq, EnumString, Display, Default,
)]
#[sqlx(type_name = "environment_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum EnvironmentStatus {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl EnvironmentStatus {
    /// States in which the health tick probes the environment.
    pub fn is_probed(&self) -> bool {
        matches!(self, EnvironmentStatus::Starting | EnvironmentStatus::Running)
    }
}

#[derive(
    Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq, EnumString, Display, Default,
)]
#[sqlx(type_name = "health_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthCheck {
    pub timestamp: DateTime<Utc>,
    pub status: HealthStatus,
    pub message: Option<String>,
}

impl HealthCheck {
    pub fn now(status: HealthStatus, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            status,
            message: Some(message.into()),
        }
    }

    /// Same status and message, ignoring when the check ran.
    pub fn same_content(&self, other: &HealthCheck) -> bool {
        self.status == other.status && self.message == other.message
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessUrl {
    pub name: String,
    pub url: String,
}

impl AccessUrl {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
        }
    }
}

/// Legacy kill handle persisted alongside the snapshot. Racy: the PID may
/// have been recycled by the time anyone reads it back.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessRecord {
    pub pid: u32,
}

/// Commands configured when the worktree was created. Immutable afterwards.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorktreeEnvironmentConfig {
    pub start_command: Option<String>,
    pub stop_command: Option<String>,
    pub nuke_command: Option<String>,
    pub logs_command: Option<String>,
    pub health_check_url: Option<String>,
}

impl WorktreeEnvironmentConfig {
    pub fn start_command(&self) -> Option<&str> {
        non_blank(&self.start_command)
    }

    pub fn stop_command(&self) -> Option<&str> {
        non_blank(&self.stop_command)
    }

    pub fn nuke_command(&self) -> Option<&str> {
        non_blank(&self.nuke_command)
    }

    pub fn logs_command(&self) -> Option<&str> {
        non_blank(&self.logs_command)
    }

    pub fn health_check_url(&self) -> Option<&str> {
        non_blank(&self.health_check_url)
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Mutable runtime snapshot for a worktree's environment.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvironmentInstance {
    pub status: EnvironmentStatus,
    pub last_health_check: Option<HealthCheck>,
    pub access_urls: Vec<AccessUrl>,
    pub process: Option<ProcessRecord>,
}

/// Partial update of an [`EnvironmentInstance`]. `None` leaves a field untouched;
/// for nullable fields `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentPatch {
    pub status: Option<EnvironmentStatus>,
    pub last_health_check: Option<Option<HealthCheck>>,
    pub access_urls: Option<Vec<AccessUrl>>,
    pub pid: Option<Option<u32>>,
}

impl EnvironmentPatch {
    pub fn status(status: EnvironmentStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_health_check(mut self, check: HealthCheck) -> Self {
        self.last_health_check = Some(Some(check));
        self
    }

    pub fn clearing_health_check(mut self) -> Self {
        self.last_health_check = Some(None);
        self
    }

    pub fn with_access_urls(mut self, urls: Vec<AccessUrl>) -> Self {
        self.access_urls = Some(urls);
        self
    }

    pub fn with_pid(mut self, pid: Option<u32>) -> Self {
        self.pid = Some(pid);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.last_health_check.is_none()
            && self.access_urls.is_none()
            && self.pid.is_none()
    }

    pub fn apply_to(&self, instance: &mut EnvironmentInstance) {
        if let Some(status) = self.status {
            instance.status = status;
        }
        if let Some(check) = &self.last_health_check {
            instance.last_health_check = check.clone();
        }
        if let Some(urls) = &self.access_urls {
            instance.access_urls = urls.clone();
        }
        if let Some(pid) = self.pid {
            instance.process = pid.map(|pid| ProcessRecord { pid });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_commands_count_as_absent() {
        let config = WorktreeEnvironmentConfig {
            start_command: Some("  ".to_string()),
            stop_command: Some(" npm run stop ".to_string()),
            ..Default::default()
        };
        assert_eq!(config.start_command(), None);
        assert_eq!(config.stop_command(), Some("npm run stop"));
        assert_eq!(config.nuke_command(), None);
    }

    #[test]
    fn status_round_trips_through_strings() {
        use std::str::FromStr;
        assert_eq!(EnvironmentStatus::Running.to_string(), "running");
        assert_eq!(
            EnvironmentStatus::from_str("stopping").unwrap(),
            EnvironmentStatus::Stopping
        );
        assert!(EnvironmentStatus::Starting.is_probed());
        assert!(!EnvironmentStatus::Error.is_probed());
    }

    #[test]
    fn health_check_content_ignores_timestamp() {
        let a = HealthCheck::now(HealthStatus::Healthy, "HTTP 200");
        let mut b = a.clone();
        b.timestamp = b.timestamp + chrono::Duration::seconds(30);
        assert!(a.same_content(&b));
        b.message = Some("HTTP 204".to_string());
        assert!(!a.same_content(&b));
    }

    #[test]
    fn patch_applies_only_set_fields() {
        let mut instance = EnvironmentInstance {
            status: EnvironmentStatus::Running,
            last_health_check: Some(HealthCheck::now(HealthStatus::Healthy, "ok")),
            access_urls: vec![AccessUrl::new("app", "http://localhost:3000")],
            process: Some(ProcessRecord { pid: 42 }),
        };

        EnvironmentPatch::status(EnvironmentStatus::Stopped)
            .with_access_urls(Vec::new())
            .with_pid(None)
            .apply_to(&mut instance);

        assert_eq!(instance.status, EnvironmentStatus::Stopped);
        assert!(instance.access_urls.is_empty());
        assert!(instance.process.is_none());
        assert!(instance.last_health_check.is_some());
        assert!(EnvironmentPatch::default().is_empty());
    }
}
