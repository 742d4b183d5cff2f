use axum::{
    middleware::from_fn_with_state,
    routing::{get, post},
    Router,
};

pub mod api_state;
pub mod dto;
pub mod error;
mod middleware_auth;
mod middleware_request_id;
mod routes;

use api_state::ApiState;
use middleware_auth::api_auth;
use middleware_request_id::request_context;
use routes::{chat_completions::chat_completions, probes::{live, ready}};

/// OpenAI-compatible API router. Probes are public; chat completions sit
/// behind bearer auth. Every request gets an `x-request-id` and one access
/// log line.
pub fn api_router(state: ApiState) -> Router {
    // Public, unauthenticated endpoints (for k8s/systemd probes)
    let public = Router::new()
        .route("/live", get(live))
        .route("/ready", get(ready));

    let protected = Router::new()
        .route("/chat/completions", post(chat_completions))
        .route_layer(from_fn_with_state(state.clone(), api_auth));

    public
        .merge(protected)
        .layer(from_fn_with_state(state.clone(), request_context))
        .with_state(state)
}
