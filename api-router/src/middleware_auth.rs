use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};

use crate::{api_state::ApiState, error::ApiError};

/// Bearer-key auth against the configured allow-list.
pub async fn api_auth(
    State(state): State<ApiState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let api_key = extract_bearer_key(&request)
        .ok_or_else(|| ApiError::Unauthorized("Unauthorized".to_string()))?;

    if !state.config.api_keys.iter().any(|key| key == &api_key) {
        return Err(ApiError::Unauthorized("Unauthorized".to_string()));
    }

    Ok(next.run(request).await)
}

fn extract_bearer_key(request: &Request) -> Option<String> {
    request
        .headers()
        .get("Authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "))
        .map(|key| key.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;

    fn request_with_auth(value: Option<&str>) -> Request {
        let mut builder = HttpRequest::builder().uri("/chat/completions");
        if let Some(value) = value {
            builder = builder.header("Authorization", value);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn test_extracts_bearer_key() {
        let request = request_with_auth(Some("Bearer sk-secret"));
        assert_eq!(extract_bearer_key(&request).as_deref(), Some("sk-secret"));
    }

    #[test]
    fn test_missing_or_malformed_header() {
        assert!(extract_bearer_key(&request_with_auth(None)).is_none());
        assert!(extract_bearer_key(&request_with_auth(Some("Basic abc"))).is_none());
    }
}
