use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::{error, warn};

use crate::error::{FinderError, JobFailure};

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    retryable: bool,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub retryable: bool,
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            retryable: false,
        }
    }

    #[allow(dead_code)]
    pub fn status(&self) -> StatusCode {
        self.status
    }
}

fn status_for(err: &FinderError) -> StatusCode {
    match err {
        FinderError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        FinderError::Search(_) => StatusCode::BAD_GATEWAY,
        FinderError::Job(JobFailure::NotFound(_)) => StatusCode::NOT_FOUND,
        FinderError::Job(JobFailure::Network(_) | JobFailure::Conversion(_)) => {
            StatusCode::BAD_GATEWAY
        }
        FinderError::Job(JobFailure::TooLarge { .. }) => StatusCode::PAYLOAD_TOO_LARGE,
        FinderError::Storage { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<FinderError> for ApiError {
    fn from(err: FinderError) -> Self {
        let status = status_for(&err);
        if status.is_server_error() {
            error!("Request failed ({}): {}", status, err);
        } else {
            warn!("Request rejected ({}): {}", status, err);
        }

        Self {
            status,
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: self.message,
            retryable: self.retryable,
        };
        (self.status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SearchError;
    use pretty_assertions::assert_eq;

    #[test]
    fn finder_errors_map_to_statuses() {
        let cases = [
            (FinderError::invalid("empty"), StatusCode::BAD_REQUEST),
            (SearchError::new("down").into(), StatusCode::BAD_GATEWAY),
            (
                JobFailure::NotFound("x".into()).into(),
                StatusCode::NOT_FOUND,
            ),
            (
                JobFailure::Network("reset".into()).into(),
                StatusCode::BAD_GATEWAY,
            ),
            (
                JobFailure::Conversion("ffmpeg".into()).into(),
                StatusCode::BAD_GATEWAY,
            ),
            (
                JobFailure::TooLarge {
                    size_bytes: 2,
                    limit_bytes: 1,
                }
                .into(),
                StatusCode::PAYLOAD_TOO_LARGE,
            ),
            (
                FinderError::storage("/x", std::io::Error::other("disk")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, expected) in cases {
            assert_eq!(ApiError::from(err).status(), expected);
        }
    }
}
