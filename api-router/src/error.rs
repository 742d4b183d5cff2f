use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use common::error::AppError;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum ApiError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Too many requests: {0}")]
    TooManyRequests(String, u64),

    #[error("Internal server error")]
    Internal(String),
}

/// Wire shape of every error response.
#[derive(Serialize, Debug)]
pub struct ErrorBody {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
}

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        match err {
            AppError::BadMessage(msg) | AppError::BadEngine(msg) | AppError::Validation(msg) => {
                Self::Validation(msg)
            }
            AppError::Auth(msg) => Self::Unauthorized(msg),
            other => {
                tracing::error!("Internal error: {:?}", other);
                Self::Internal("Internal server error".to_string())
            }
        }
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::TooManyRequests(_, _) => StatusCode::TOO_MANY_REQUESTS,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> String {
        match self {
            Self::Validation(msg)
            | Self::Unauthorized(msg)
            | Self::Forbidden(msg)
            | Self::NotFound(msg)
            | Self::Conflict(msg)
            | Self::TooManyRequests(msg, _) => msg.clone(),
            Self::Internal(_) => "Internal server error".to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(ErrorBody {
            message: self.message(),
            code: Some(status.as_u16()),
        });
        let mut response = (status, body).into_response();
        if let Self::TooManyRequests(_, retry_after) = &self {
            if let Ok(value) = header::HeaderValue::from_str(&retry_after.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_of(error: ApiError) -> StatusCode {
        error.into_response().status()
    }

    #[test]
    fn test_app_error_to_api_error_conversion() {
        let bad_message = AppError::BadMessage("alternating roles".to_string());
        assert!(matches!(
            ApiError::from(bad_message),
            ApiError::Validation(msg) if msg == "alternating roles"
        ));

        let bad_engine = AppError::BadEngine("invalid engine".to_string());
        assert!(matches!(ApiError::from(bad_engine), ApiError::Validation(_)));

        let auth = AppError::Auth("missing key".to_string());
        assert!(matches!(ApiError::from(auth), ApiError::Unauthorized(_)));

        let upstream = AppError::UpstreamChat("provider exploded".to_string());
        assert!(matches!(ApiError::from(upstream), ApiError::Internal(_)));
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(status_of(ApiError::Validation("v".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status_of(ApiError::Unauthorized("u".into())), StatusCode::UNAUTHORIZED);
        assert_eq!(status_of(ApiError::Forbidden("f".into())), StatusCode::FORBIDDEN);
        assert_eq!(status_of(ApiError::NotFound("n".into())), StatusCode::NOT_FOUND);
        assert_eq!(status_of(ApiError::Conflict("c".into())), StatusCode::CONFLICT);
        assert_eq!(
            status_of(ApiError::TooManyRequests("t".into(), 3)),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            status_of(ApiError::Internal("secret detail".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_retry_after_header() {
        let response = ApiError::TooManyRequests("slow down".into(), 30).into_response();
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).unwrap(),
            "30"
        );
    }

    #[test]
    fn test_internal_error_message_is_sanitized() {
        let error = ApiError::Internal("db password incorrect".to_string());
        assert_eq!(error.message(), "Internal server error");
    }
}
