use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Method, Request, StatusCode},
};
use db::{
    DBService,
    models::{
        environment::WorktreeEnvironmentConfig,
        worktree::{CreateWorktree, Worktree},
    },
};
use serde_json::Value;
use server::{DeploymentImpl, routes};
use services::services::config::Config;
use tempfile::TempDir;
use tower::ServiceExt;
use uuid::Uuid;

struct TestApp {
    deployment: DeploymentImpl,
    _dir: TempDir,
}

impl TestApp {
    async fn new() -> Self {
        let db = DBService::connect("sqlite::memory:").await.unwrap();
        Self {
            deployment: DeploymentImpl::from_parts(Config::default(), db),
            _dir: tempfile::tempdir().unwrap(),
        }
    }

    fn router(&self) -> Router {
        routes::router(self.deployment.clone())
    }

    async fn worktree(&self, config: WorktreeEnvironmentConfig) -> Uuid {
        let id = Uuid::new_v4();
        let path = self._dir.path().join("wt");
        std::fs::create_dir_all(&path).unwrap();
        Worktree::create(
            &self.deployment.db().pool,
            id,
            &CreateWorktree {
                unique_id: 1,
                path,
                repo_path: self._dir.path().to_path_buf(),
                environment_config: config,
            },
        )
        .await
        .unwrap();
        id
    }

    async fn call(&self, method: Method, uri: &str) -> (StatusCode, Value) {
        let response = self
            .router()
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }
}

#[tokio::test]
async fn health_endpoint_reports_ok() {
    let app = TestApp::new().await;
    let (status, body) = app.call(Method::GET, "/api/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"], "OK");
}

#[tokio::test]
async fn unknown_worktree_is_not_found() {
    let app = TestApp::new().await;
    let uri = format!("/api/worktrees/{}/environment", Uuid::new_v4());
    let (status, body) = app.call(Method::GET, &uri).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn fresh_worktree_environment_is_stopped() {
    let app = TestApp::new().await;
    let id = app.worktree(WorktreeEnvironmentConfig::default()).await;
    let (status, body) = app
        .call(Method::GET, &format!("/api/worktrees/{id}/environment"))
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["environment"]["status"], "stopped");
    assert_eq!(body["data"]["process_tracked"], false);
}

#[tokio::test]
async fn start_without_command_is_unprocessable() {
    let app = TestApp::new().await;
    let id = app.worktree(WorktreeEnvironmentConfig::default()).await;
    let (status, body) = app
        .call(Method::POST, &format!("/api/worktrees/{id}/environment/start"))
        .await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["success"], false);
    assert!(body["message"].as_str().unwrap().contains("start"));
}

#[tokio::test]
async fn logs_without_command_reports_not_configured() {
    let app = TestApp::new().await;
    let id = app.worktree(WorktreeEnvironmentConfig::default()).await;
    let (status, body) = app
        .call(Method::GET, &format!("/api/worktrees/{id}/environment/logs"))
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["kind"], "not_configured");
    assert_eq!(body["data"]["message"], "no logs command configured");
}

#[cfg(unix)]
#[tokio::test]
async fn stop_on_idle_environment_succeeds() {
    let app = TestApp::new().await;
    let id = app
        .worktree(WorktreeEnvironmentConfig {
            stop_command: Some("true".to_string()),
            ..Default::default()
        })
        .await;
    let (status, body) = app
        .call(Method::POST, &format!("/api/worktrees/{id}/environment/stop"))
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["succeeded"], true);
    assert_eq!(body["data"]["environment"]["status"], "stopped");
}
