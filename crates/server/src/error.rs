use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use services::services::environment::EnvironmentError;
use thiserror::Error;
use utils::response::ApiResponse;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Environment(#[from] EnvironmentError),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl ApiError {
    fn status(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Environment(EnvironmentError::WorktreeNotFound(_)) => {
                (StatusCode::NOT_FOUND, "WorktreeNotFound")
            }
            ApiError::Environment(EnvironmentError::AlreadyRunning) => {
                (StatusCode::CONFLICT, "AlreadyRunning")
            }
            ApiError::Environment(EnvironmentError::MissingCommand(_)) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "MissingCommand")
            }
            ApiError::Environment(EnvironmentError::Container(_)) => {
                (StatusCode::BAD_GATEWAY, "ContainerError")
            }
            ApiError::Environment(EnvironmentError::Command(_)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "CommandError")
            }
            ApiError::Environment(_) | ApiError::Database(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "DatabaseError")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status_code, error_type) = self.status();
        let message = self.to_string();
        if status_code.is_server_error() {
            tracing::error!(error_type, "{}", message);
        } else {
            tracing::debug!(error_type, "{}", message);
        }
        (status_code, Json(ApiResponse::<()>::error(&message))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use services::services::environment::CommandKind;
    use uuid::Uuid;

    use super::*;

    #[test]
    fn configuration_errors_map_to_client_statuses() {
        let cases = [
            (
                ApiError::from(EnvironmentError::WorktreeNotFound(Uuid::nil())),
                StatusCode::NOT_FOUND,
            ),
            (
                ApiError::from(EnvironmentError::AlreadyRunning),
                StatusCode::CONFLICT,
            ),
            (
                ApiError::from(EnvironmentError::MissingCommand(CommandKind::Nuke)),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
        ];
        for (error, expected) in cases {
            assert_eq!(error.into_response().status(), expected);
        }
    }
}
