use std::pin::Pin;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use common::error::AppError;
use futures::{Stream, StreamExt};
use serde::Serialize;

use crate::context::ContextSections;
use crate::llm::{ChatResponse, ChatStream, Usage};

#[derive(Debug, Clone, Serialize)]
pub struct ResultMessage {
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refusal: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Choice {
    pub finish_reason: Option<String>,
    pub message: ResultMessage,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkDelta {
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refusal: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkChoice {
    pub finish_reason: Option<String>,
    pub delta: ChunkDelta,
}

/// One key point from a map batch.
#[derive(Debug, Clone, Serialize)]
pub struct KeyPoint {
    pub answer: String,
    pub score: f64,
}

/// The outcome of one map call, tagged with its originating batch index.
#[derive(Debug, Clone, Serialize)]
pub struct MapResult {
    pub batch: usize,
    pub points: Vec<KeyPoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    pub llm_calls: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_text: Option<String>,
}

/// Extra fields attached to whole results when `verbose` is requested.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchVerbose {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_data: Option<ContextSections>,
    pub completion_time: f64,
    pub llm_calls: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub map_result: Option<Vec<MapResult>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reduce_context_text: Option<String>,
}

/// An OpenAI-shaped whole search result.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub created: i64,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_fingerprint: Option<String>,
    pub choice: Choice,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(flatten)]
    pub verbose: Option<Box<SearchVerbose>>,
}

/// Verbose payload on streamed chunks; populated only on the terminal
/// chunk (the one carrying `finish_reason`).
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChunkVerbose {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_data: Option<ContextSections>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_calls: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub map_result: Option<Vec<MapResult>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reduce_context_text: Option<String>,
}

/// One streamed search result chunk.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResultChunk {
    pub created: i64,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_fingerprint: Option<String>,
    pub choice: ChunkChoice,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(flatten)]
    pub verbose: Option<Box<ChunkVerbose>>,
}

pub type SearchStream = Pin<Box<dyn Stream<Item = Result<SearchResultChunk, AppError>> + Send>>;

pub(crate) fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or(0)
}

/// Builds a whole result from a chat response, attaching the verbose block
/// when requested.
pub(crate) fn result_from_response(
    response: ChatResponse,
    model: &str,
    created: i64,
    verbose: Option<SearchVerbose>,
) -> SearchResult {
    SearchResult {
        created,
        model: model.to_string(),
        system_fingerprint: response.system_fingerprint,
        choice: Choice {
            finish_reason: response.finish_reason,
            message: ResultMessage {
                content: response.content,
                refusal: response.refusal,
            },
        },
        usage: response.usage,
        verbose: verbose.map(Box::new),
    }
}

/// Seed data for verbose terminal chunks of a stream.
pub(crate) struct VerboseStreamSeed {
    pub context_text: Option<String>,
    pub context_data: Option<ContextSections>,
    pub llm_calls: usize,
    pub map_result: Option<Vec<MapResult>>,
    pub reduce_context_text: Option<String>,
    pub started: Instant,
}

/// Adapts an upstream chat stream into search result chunks. When verbose,
/// the chunk that carries a `finish_reason` also carries the context block
/// and timing.
pub(crate) fn chunk_stream_from_chat(
    upstream: ChatStream,
    model: String,
    created: i64,
    verbose: Option<VerboseStreamSeed>,
) -> SearchStream {
    let stream = async_stream::stream! {
        let mut upstream = upstream;
        let mut seed = verbose;
        while let Some(item) = upstream.next().await {
            match item {
                Ok(chunk) => {
                    let verbose_block = match (&chunk.finish_reason, &mut seed) {
                        (Some(_), Some(seed)) => Some(Box::new(ChunkVerbose {
                            context_text: seed.context_text.take(),
                            context_data: seed.context_data.take(),
                            completion_time: Some(seed.started.elapsed().as_secs_f64()),
                            llm_calls: Some(seed.llm_calls),
                            map_result: seed.map_result.take(),
                            reduce_context_text: seed.reduce_context_text.take(),
                        })),
                        (None, Some(_)) => Some(Box::new(ChunkVerbose::default())),
                        _ => None,
                    };
                    yield Ok(SearchResultChunk {
                        created,
                        model: model.clone(),
                        system_fingerprint: chunk.system_fingerprint,
                        choice: ChunkChoice {
                            finish_reason: chunk.finish_reason,
                            delta: ChunkDelta {
                                content: chunk.content,
                                refusal: chunk.refusal,
                            },
                        },
                        usage: chunk.usage,
                        verbose: verbose_block,
                    });
                }
                Err(error) => {
                    yield Err(error);
                    break;
                }
            }
        }
    };
    Box::pin(stream)
}
