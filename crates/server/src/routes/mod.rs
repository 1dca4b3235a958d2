use axum::{Router, routing::get};
use tower_http::trace::TraceLayer;

use crate::DeploymentImpl;

pub mod environment;
pub mod health;

pub fn router(deployment: DeploymentImpl) -> Router {
    let base_routes = Router::new()
        .route("/health", get(health::health_check))
        .merge(environment::router())
        .with_state(deployment);

    Router::new()
        .nest("/api", base_routes)
        .layer(TraceLayer::new_for_http())
}
