use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::{
    connection::{EndpointError, ManagerStopped},
    house_store::HouseError,
    settings::SettingsError,
};

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Unprocessable(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Internal(e) => {
                error!(error = %e, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = Json(json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

impl From<HouseError> for AppError {
    fn from(e: HouseError) -> Self {
        match e {
            HouseError::NotFound(_) => Self::NotFound(e.to_string()),
            HouseError::DuplicateName(_) => Self::Conflict(e.to_string()),
            HouseError::EmptyName | HouseError::NameTooLong => Self::Unprocessable(e.to_string()),
            HouseError::Storage(e) => Self::Internal(e),
        }
    }
}

impl From<SettingsError> for AppError {
    fn from(e: SettingsError) -> Self {
        match e {
            SettingsError::Invalid(e) => Self::Unprocessable(e.to_string()),
            SettingsError::Storage(e) => Self::Internal(e),
        }
    }
}

impl From<EndpointError> for AppError {
    fn from(e: EndpointError) -> Self {
        Self::Unprocessable(e.to_string())
    }
}

impl From<ManagerStopped> for AppError {
    fn from(e: ManagerStopped) -> Self {
        Self::Internal(e.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thresholds::ThresholdError;

    #[test]
    fn domain_errors_map_to_status_codes() {
        let cases: Vec<(AppError, StatusCode)> = vec![
            (HouseError::NotFound("rmh09".into()).into(), StatusCode::NOT_FOUND),
            (HouseError::DuplicateName("A".into()).into(), StatusCode::CONFLICT),
            (HouseError::EmptyName.into(), StatusCode::UNPROCESSABLE_ENTITY),
            (
                HouseError::Storage(anyhow::anyhow!("db down")).into(),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                SettingsError::Invalid(ThresholdError::NotFinite {
                    dimension: "trash volume",
                    bound: "full",
                })
                .into(),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                SettingsError::Storage(anyhow::anyhow!("db down")).into(),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (EndpointError::InvalidPort.into(), StatusCode::UNPROCESSABLE_ENTITY),
            (ManagerStopped.into(), StatusCode::INTERNAL_SERVER_ERROR),
            (AppError::BadRequest("bad".into()), StatusCode::BAD_REQUEST),
        ];
        for (err, expected) in cases {
            assert_eq!(err.into_response().status(), expected);
        }
    }
}
