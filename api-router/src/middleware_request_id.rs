use std::net::SocketAddr;
use std::time::Instant;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::HeaderValue,
    middleware::Next,
    response::Response,
};
use common::utils::id::{gen_id, REQUEST_ID_PREFIX};
use tracing::info;

use crate::api_state::ApiState;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Correlation id carried through request extensions.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Takes the request id from the inbound header or generates one, echoes it
/// on the response and writes one access-log line per request. The client
/// ip comes from the configured header when set, the connection peer
/// otherwise.
pub async fn request_context(
    State(state): State<ApiState>,
    mut request: Request,
    next: Next,
) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| gen_id(REQUEST_ID_PREFIX));

    let client_ip = client_ip(&state, &request);
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();
    request.extensions_mut().insert(RequestId(request_id.clone()));

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    info!(
        %request_id,
        %method,
        %path,
        client_ip = client_ip.as_deref().unwrap_or("-"),
        status = response.status().as_u16(),
        latency_ms = started.elapsed().as_millis() as u64,
        "request completed"
    );
    response
}

fn client_ip(state: &ApiState, request: &Request) -> Option<String> {
    if let Some(header_name) = &state.config.client_ip_header {
        if let Some(value) = request
            .headers()
            .get(header_name.as_str())
            .and_then(|value| value.to_str().ok())
        {
            return Some(value.to_string());
        }
    }
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
}
