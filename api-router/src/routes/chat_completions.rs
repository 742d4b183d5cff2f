use std::convert::Infallible;

use async_stream::stream;
use axum::{
    extract::State,
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    Json,
};
use common::utils::id::{gen_id, CHAT_ID_PREFIX};
use futures::StreamExt;
use query_engine::ChatOutput;
use tracing::error;

use crate::{
    api_state::ApiState,
    dto::{ChatCompletionChunkResponse, ChatCompletionResponse, CompletionCreateRequest},
    error::ApiError,
};

/// `POST /chat/completions`, OpenAI compatible in both modes. Streaming
/// responses are SSE events terminated by a single `data: [DONE]` line; a
/// stream that fails upstream ends without the terminator.
pub async fn chat_completions(
    State(state): State<ApiState>,
    Json(request): Json<CompletionCreateRequest>,
) -> Result<Response, ApiError> {
    request.validate()?;
    let messages = request.chat_messages()?;
    let options = request.chat_options();

    let output = state
        .client
        .chat(
            &state.config.search_engine,
            messages,
            request.stream,
            false,
            &options,
        )
        .await
        .map_err(ApiError::from)?;

    let id = gen_id(CHAT_ID_PREFIX);
    match output {
        ChatOutput::Complete(result) => {
            Ok(Json(ChatCompletionResponse::from_result(id, *result)).into_response())
        }
        ChatOutput::Stream(chunks) => {
            let event_stream = stream! {
                let mut chunks = chunks;
                let mut failed = false;
                while let Some(chunk) = chunks.next().await {
                    match chunk {
                        Ok(chunk) => {
                            let payload = ChatCompletionChunkResponse::from_chunk(&id, chunk);
                            match serde_json::to_string(&payload) {
                                Ok(json) => yield Ok::<Event, Infallible>(Event::default().data(json)),
                                Err(err) => {
                                    error!(error = %err, "Failed to serialize stream chunk");
                                    failed = true;
                                    break;
                                }
                            }
                        }
                        Err(err) => {
                            error!(error = %err, "Engine stream failed mid-flight");
                            failed = true;
                            break;
                        }
                    }
                }
                if !failed {
                    yield Ok(Event::default().data("[DONE]"));
                }
            };
            Ok(Sse::new(event_stream).into_response())
        }
    }
}
