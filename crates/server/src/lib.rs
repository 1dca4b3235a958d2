pub mod error;
pub mod routes;

use std::net::SocketAddr;

use services::services::environment::EnvironmentService;
use thiserror::Error;
use tokio::{task::JoinHandle, time::MissedTickBehavior};

pub type DeploymentImpl = local_deployment::LocalDeployment;

/// Error type for server startup
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to address: {0}")]
    Bind(#[from] std::io::Error),
}

/// Repair environment snapshots left by a previous run. Runs in the background.
pub fn spawn_startup_tasks(deployment: &DeploymentImpl) {
    let deployment = deployment.clone();
    tokio::spawn(async move {
        match deployment.environment().reconcile().await {
            Ok(0) => {}
            Ok(repaired) => tracing::info!("Reconciled {} environment snapshots", repaired),
            Err(e) => tracing::error!("Failed to reconcile environments: {}", e),
        }
    });
}

/// Drive the health tick for every starting or running environment.
pub fn spawn_health_ticker(deployment: &DeploymentImpl) -> JoinHandle<()> {
    let deployment = deployment.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(deployment.config().health_tick_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            match deployment.environment().health_tick_all().await {
                Ok(0) => {}
                Ok(probed) => tracing::debug!("Health tick probed {} environments", probed),
                Err(e) => tracing::error!("Health tick failed: {}", e),
            }
        }
    })
}

/// Starts the Axum HTTP server on `host:port` (port 0 picks a free port) and
/// returns its URL with the `JoinHandle` of the serving task.
pub async fn start_server(
    deployment: DeploymentImpl,
    host: &str,
    port: u16,
) -> Result<(String, JoinHandle<()>), ServerError> {
    spawn_startup_tasks(&deployment);
    let ticker = spawn_health_ticker(&deployment);

    let app_router = routes::router(deployment.clone());

    let listener = tokio::net::TcpListener::bind(format!("{host}:{port}")).await?;
    let addr: SocketAddr = listener.local_addr()?;
    let url = format!("http://{}", addr);

    tracing::info!("Server running on {}", url);

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app_router)
            .with_graceful_shutdown(shutdown_signal())
            .await
        {
            tracing::error!("Server error: {}", e);
        }
        ticker.abort();
        perform_cleanup_actions(&deployment).await;
    });

    Ok((url, handle))
}

/// Waits for shutdown signals (Ctrl+C or SIGTERM on Unix).
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
        }
    };

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let terminate = async {
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
            } else {
                tracing::error!("Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        };

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
    }
}

/// Performs cleanup actions on server shutdown.
pub async fn perform_cleanup_actions(deployment: &DeploymentImpl) {
    if let Err(e) = deployment
        .environment()
        .kill_all_running_processes()
        .await
    {
        tracing::error!("Failed to cleanly kill environment processes: {}", e);
    }
}
