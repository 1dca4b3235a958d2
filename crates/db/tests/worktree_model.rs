use std::path::PathBuf;

use db::{
    DBService,
    models::{
        environment::{
            AccessUrl, EnvironmentInstance, EnvironmentPatch, EnvironmentStatus, HealthCheck,
            HealthStatus, WorktreeEnvironmentConfig,
        },
        worktree::{CreateWorktree, Worktree},
    },
};
use uuid::Uuid;

async fn setup_db() -> DBService {
    DBService::connect("sqlite::memory:").await.unwrap()
}

async fn create(db: &DBService, unique_id: i64) -> Worktree {
    Worktree::create(
        &db.pool,
        Uuid::new_v4(),
        &CreateWorktree {
            unique_id,
            path: PathBuf::from(format!("/work/app-wt-{unique_id}")),
            repo_path: PathBuf::from("/work/app"),
            environment_config: WorktreeEnvironmentConfig {
                start_command: Some("npm run dev".to_string()),
                stop_command: Some("   ".to_string()),
                health_check_url: Some("http://localhost:3000/health".to_string()),
                ..Default::default()
            },
        },
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn new_worktree_starts_stopped_with_config() {
    let db = setup_db().await;
    let worktree = create(&db, 1).await;

    assert_eq!(worktree.environment, EnvironmentInstance::default());
    assert_eq!(worktree.environment_config.start_command(), Some("npm run dev"));
    // Blank commands count as not configured.
    assert_eq!(worktree.environment_config.stop_command(), None);
    assert!(worktree.container_name.is_none());
    assert!(worktree.ssh_port.is_none());
}

#[tokio::test]
async fn patch_writes_only_given_fields() {
    let db = setup_db().await;
    let worktree = create(&db, 2).await;

    let check = HealthCheck::now(HealthStatus::Healthy, "HTTP 200");
    let patch = EnvironmentPatch::status(EnvironmentStatus::Running)
        .with_health_check(check.clone())
        .with_access_urls(vec![AccessUrl::new("app", "http://localhost:3000")])
        .with_pid(Some(4242));
    assert!(Worktree::patch_environment(&db.pool, worktree.id, &patch).await.unwrap());

    let loaded = Worktree::find_by_id(&db.pool, worktree.id).await.unwrap().unwrap();
    assert_eq!(loaded.environment.status, EnvironmentStatus::Running);
    assert!(loaded.environment.last_health_check.as_ref().unwrap().same_content(&check));
    assert_eq!(loaded.environment.access_urls[0].url, "http://localhost:3000");
    assert_eq!(loaded.environment.process.unwrap().pid, 4242);

    let patch = EnvironmentPatch::status(EnvironmentStatus::Stopped).with_pid(None);
    Worktree::patch_environment(&db.pool, worktree.id, &patch).await.unwrap();
    let loaded = Worktree::find_by_id(&db.pool, worktree.id).await.unwrap().unwrap();
    assert_eq!(loaded.environment.status, EnvironmentStatus::Stopped);
    assert!(loaded.environment.process.is_none());
    // Untouched fields survive.
    assert!(loaded.environment.last_health_check.is_some());
    assert_eq!(loaded.environment.access_urls.len(), 1);

    let cleared = EnvironmentPatch::default().clearing_health_check();
    Worktree::patch_environment(&db.pool, worktree.id, &cleared).await.unwrap();
    let loaded = Worktree::find_by_id(&db.pool, worktree.id).await.unwrap().unwrap();
    assert!(loaded.environment.last_health_check.is_none());
}

#[tokio::test]
async fn patch_of_missing_worktree_reports_false() {
    let db = setup_db().await;
    let patch = EnvironmentPatch::status(EnvironmentStatus::Running);
    assert!(!Worktree::patch_environment(&db.pool, Uuid::new_v4(), &patch).await.unwrap());
}

#[tokio::test]
async fn find_by_status_skips_archived_and_orders_by_unique_id() {
    let db = setup_db().await;
    let late = create(&db, 9).await;
    let early = create(&db, 3).await;
    let archived = create(&db, 5).await;
    let idle = create(&db, 7).await;

    for id in [late.id, early.id, archived.id] {
        Worktree::patch_environment(
            &db.pool,
            id,
            &EnvironmentPatch::status(EnvironmentStatus::Starting),
        )
        .await
        .unwrap();
    }
    Worktree::clear_environment(&db.pool, archived.id).await.unwrap();

    let found = Worktree::find_by_environment_status(
        &db.pool,
        &[EnvironmentStatus::Starting, EnvironmentStatus::Running],
    )
    .await
    .unwrap();
    let ids: Vec<Uuid> = found.iter().map(|w| w.id).collect();
    assert_eq!(ids, vec![early.id, late.id]);
    assert!(!ids.contains(&idle.id));

    assert!(
        Worktree::find_by_environment_status(&db.pool, &[])
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn container_info_is_cached_and_cleared() {
    let db = setup_db().await;
    let worktree = create(&db, 4).await;

    Worktree::set_container_info(&db.pool, worktree.id, Some("wtenv-abcd1234"), Some(42004))
        .await
        .unwrap();
    let loaded = Worktree::find_by_id(&db.pool, worktree.id).await.unwrap().unwrap();
    assert_eq!(loaded.container_name.as_deref(), Some("wtenv-abcd1234"));
    assert_eq!(loaded.ssh_port, Some(42004));

    Worktree::clear_environment(&db.pool, worktree.id).await.unwrap();
    let loaded = Worktree::find_by_id(&db.pool, worktree.id).await.unwrap().unwrap();
    assert!(loaded.container_name.is_none());
    assert!(loaded.ssh_port.is_none());
    assert!(loaded.archived_at.is_some());
    assert_eq!(loaded.environment, EnvironmentInstance::default());
}

#[tokio::test]
async fn unique_id_is_unique() {
    let db = setup_db().await;
    create(&db, 6).await;
    let duplicate = Worktree::create(
        &db.pool,
        Uuid::new_v4(),
        &CreateWorktree {
            unique_id: 6,
            path: PathBuf::from("/work/other"),
            repo_path: PathBuf::from("/work/app"),
            environment_config: Default::default(),
        },
    )
    .await;
    assert!(duplicate.is_err());
}
