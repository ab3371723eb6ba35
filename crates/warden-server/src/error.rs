use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Authorization token is missing")]
    MissingToken,
    #[error("Invalid authorization token")]
    InvalidToken,
    #[error("Challenge not found")]
    ChallengeNotFound,
    #[error("Instance not found")]
    InstanceNotFound,
    #[error("Instance is already running")]
    AlreadyRunning,
    #[error("Another instance operation is in progress")]
    OperationInProgress,
    #[error("Captcha response is missing")]
    CaptchaMissing,
    #[error("Captcha validation failed")]
    CaptchaFailed,
    #[error("Daemon has run out of available subnets for creating networks. Contact admins.")]
    SubnetsExhausted,
    #[error("{0}")]
    Docker(#[from] bollard::errors::Error),
    #[error("{0}")]
    Cache(#[from] redis::RedisError),
    #[error("{0}")]
    Upstream(#[from] reqwest::Error),
}

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Serialize)]
pub struct ErrorResponse<'a> {
    error: &'a str,
    message: String,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let message = self.to_string();
        let (status, error) = match self {
            Error::MissingToken => (StatusCode::UNAUTHORIZED, "unauthenticated"),
            Error::InvalidToken => (StatusCode::FORBIDDEN, "forbidden"),
            Error::ChallengeNotFound | Error::InstanceNotFound => {
                (StatusCode::NOT_FOUND, "not_found")
            }
            Error::AlreadyRunning | Error::OperationInProgress => {
                (StatusCode::BAD_REQUEST, "conflict")
            }
            Error::CaptchaMissing | Error::CaptchaFailed => {
                (StatusCode::BAD_REQUEST, "captcha_failed")
            }
            Error::SubnetsExhausted => (StatusCode::INTERNAL_SERVER_ERROR, "daemon_exhausted"),
            Error::Docker(_) | Error::Cache(_) | Error::Upstream(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal")
            }
        };

        (status, Json(ErrorResponse { error, message })).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_token_maps_to_unauthorized() {
        let response = Error::MissingToken.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn invalid_token_maps_to_forbidden() {
        let response = Error::InvalidToken.into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn lookup_failures_map_to_not_found() {
        assert_eq!(
            Error::ChallengeNotFound.into_response().status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::InstanceNotFound.into_response().status(),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn conflicts_map_to_bad_request() {
        assert_eq!(
            Error::AlreadyRunning.into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::OperationInProgress.into_response().status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn exhausted_daemon_maps_to_server_error() {
        let response = Error::SubnetsExhausted.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
