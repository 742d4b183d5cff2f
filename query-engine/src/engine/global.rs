use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_openai::types::ResponseFormat;
use common::error::AppError;
use common::utils::template::safe_format;
use common::utils::tokens::TokenCounter;
use futures::stream::{self, StreamExt};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::context::{GlobalContextBuilder, GlobalContextParams};
use crate::history::ConversationHistory;
use crate::llm::{ChatLlm, ChatMessage, ChatOptions};
use crate::prompts;

use super::result::{
    chunk_stream_from_chat, now_unix, result_from_response, Choice, ChunkChoice, ChunkDelta,
    ChunkVerbose, KeyPoint, MapResult, ResultMessage, SearchResult, SearchResultChunk,
    SearchStream, SearchVerbose, VerboseStreamSeed,
};

/// Engine-level settings for global search.
#[derive(Debug, Clone)]
pub struct GlobalEngineConfig {
    pub map_sys_prompt: Option<String>,
    pub reduce_sys_prompt: Option<String>,
    pub allow_general_knowledge: bool,
    pub general_knowledge_sys_prompt: Option<String>,
    pub no_data_answer: Option<String>,
    pub json_mode: bool,
    pub max_data_tokens: usize,
    pub concurrency: usize,
}

impl Default for GlobalEngineConfig {
    fn default() -> Self {
        Self {
            map_sys_prompt: None,
            reduce_sys_prompt: None,
            allow_general_knowledge: false,
            general_knowledge_sys_prompt: None,
            no_data_answer: None,
            json_mode: true,
            max_data_tokens: 8000,
            concurrency: 16,
        }
    }
}

/// Global search: map-reduce summarization over community report batches.
/// Every upstream call is gated by the shared semaphore, so no more than
/// `concurrency` calls are ever in flight.
pub struct GlobalSearchEngine {
    chat: Arc<dyn ChatLlm>,
    builder: GlobalContextBuilder,
    counter: TokenCounter,
    map_sys_prompt: String,
    reduce_sys_prompt: String,
    allow_general_knowledge: bool,
    general_knowledge_sys_prompt: String,
    no_data_answer: String,
    json_mode: bool,
    max_data_tokens: usize,
    concurrency: usize,
    semaphore: Arc<Semaphore>,
}

impl GlobalSearchEngine {
    pub fn new(
        chat: Arc<dyn ChatLlm>,
        builder: GlobalContextBuilder,
        counter: TokenCounter,
        config: GlobalEngineConfig,
    ) -> Self {
        let map_sys_prompt = config
            .map_sys_prompt
            .unwrap_or_else(|| prompts::GLOBAL_SEARCH_MAP_SYS_PROMPT.to_string());
        if !map_sys_prompt.contains("{context_data}") {
            warn!("Global search map system prompt does not contain \"{{context_data}}\"");
        }
        let reduce_sys_prompt = config
            .reduce_sys_prompt
            .unwrap_or_else(|| prompts::GLOBAL_SEARCH_REDUCE_SYS_PROMPT.to_string());
        if !reduce_sys_prompt.contains("{report_data}") {
            warn!("Global search reduce system prompt does not contain \"{{report_data}}\"");
        }

        let concurrency = config.concurrency.max(1);
        Self {
            chat,
            builder,
            counter,
            map_sys_prompt,
            reduce_sys_prompt,
            allow_general_knowledge: config.allow_general_knowledge,
            general_knowledge_sys_prompt: config
                .general_knowledge_sys_prompt
                .unwrap_or_else(|| {
                    prompts::GLOBAL_SEARCH_GENERAL_KNOWLEDGE_INSTRUCTION.to_string()
                }),
            no_data_answer: config
                .no_data_answer
                .unwrap_or_else(|| prompts::GLOBAL_SEARCH_NO_DATA_ANSWER.to_string()),
            json_mode: config.json_mode,
            max_data_tokens: config.max_data_tokens,
            concurrency,
            semaphore: Arc::new(Semaphore::new(concurrency)),
        }
    }

    pub async fn search(
        &self,
        query: &str,
        history: Option<&ConversationHistory>,
        params: &GlobalContextParams,
        options: &ChatOptions,
        verbose: bool,
    ) -> Result<SearchResult, AppError> {
        let started = Instant::now();
        let created = now_unix();
        info!(%query, "Starting global search");

        let map_results = self.run_map_phase(query, history, params, options, verbose).await;
        let map_calls: usize = map_results.iter().map(|r| r.llm_calls).sum();

        let Some(report_data) = self.assemble_report_data(&map_results) else {
            warn!("No key points found from the map phase");
            return Ok(self.no_data_result(created, started, verbose, map_results, map_calls));
        };

        let messages = self.reduce_messages(query, &report_data);
        let response = {
            let _permit = self.acquire_permit().await?;
            self.chat.chat(messages, options).await?
        };

        Ok(result_from_response(
            response,
            self.chat.model(),
            created,
            verbose.then(|| SearchVerbose {
                context_text: Some(report_data.clone()),
                context_data: None,
                completion_time: started.elapsed().as_secs_f64(),
                llm_calls: map_calls + 1,
                map_result: Some(map_results),
                reduce_context_text: Some(report_data),
            }),
        ))
    }

    pub async fn search_stream(
        &self,
        query: &str,
        history: Option<&ConversationHistory>,
        params: &GlobalContextParams,
        options: &ChatOptions,
        verbose: bool,
    ) -> Result<SearchStream, AppError> {
        let started = Instant::now();
        let created = now_unix();
        info!(%query, "Starting streaming global search");

        let map_results = self.run_map_phase(query, history, params, options, verbose).await;
        let map_calls: usize = map_results.iter().map(|r| r.llm_calls).sum();

        let Some(report_data) = self.assemble_report_data(&map_results) else {
            warn!("No key points found from the map phase");
            let chunk = self.no_data_chunk(created, started, verbose, map_results, map_calls);
            let chunks: Vec<Result<SearchResultChunk, AppError>> = vec![Ok(chunk)];
            return Ok(Box::pin(stream::iter(chunks)));
        };

        let messages = self.reduce_messages(query, &report_data);
        let upstream = {
            let _permit = self.acquire_permit().await?;
            self.chat.chat_stream(messages, options).await?
        };

        Ok(chunk_stream_from_chat(
            upstream,
            self.chat.model().to_string(),
            created,
            verbose.then(|| VerboseStreamSeed {
                context_text: Some(report_data.clone()),
                context_data: None,
                llm_calls: map_calls + 1,
                map_result: Some(map_results),
                reduce_context_text: Some(report_data),
                started,
            }),
        ))
    }

    async fn acquire_permit(&self) -> Result<tokio::sync::SemaphorePermit<'_>, AppError> {
        self.semaphore
            .acquire()
            .await
            .map_err(|_| AppError::Internal("search semaphore closed".to_string()))
    }

    /// Runs one map call per context batch, at most `concurrency` in
    /// flight. Results come back tagged with their batch index; a failed
    /// batch degrades to a single empty point instead of failing the search.
    async fn run_map_phase(
        &self,
        query: &str,
        history: Option<&ConversationHistory>,
        params: &GlobalContextParams,
        options: &ChatOptions,
        verbose: bool,
    ) -> Vec<MapResult> {
        let (batches, _sections) = self.builder.build_context(history, params);
        debug!(batches = batches.len(), "Scheduling map phase");

        let mut results: Vec<MapResult> = stream::iter(
            batches
                .into_iter()
                .enumerate()
                .map(|(index, batch)| self.map_batch(query, index, batch, options, verbose)),
        )
        .buffer_unordered(self.concurrency)
        .collect()
        .await;
        results.sort_by_key(|result| result.batch);
        results
    }

    async fn map_batch(
        &self,
        query: &str,
        batch_index: usize,
        batch: String,
        options: &ChatOptions,
        verbose: bool,
    ) -> MapResult {
        let prompt = safe_format(
            &self.map_sys_prompt,
            &HashMap::from([("context_data", batch.as_str()), ("query", query)]),
        );
        let messages = vec![ChatMessage::system(prompt), ChatMessage::user(query)];

        let mut map_options = options.clone();
        if self.json_mode {
            map_options.response_format = Some(ResponseFormat::JsonObject);
        }

        let response = {
            let Ok(_permit) = self.semaphore.acquire().await else {
                return MapResult {
                    batch: batch_index,
                    points: vec![empty_point()],
                    usage: None,
                    llm_calls: 0,
                    context_text: verbose.then_some(batch),
                };
            };
            self.chat.chat(messages, &map_options).await
        };

        match response {
            Ok(response) => MapResult {
                batch: batch_index,
                points: parse_map_points(response.content.as_deref()),
                usage: response.usage,
                llm_calls: 1,
                context_text: verbose.then_some(batch),
            },
            Err(error) => {
                warn!(batch = batch_index, %error, "Map call failed, emitting empty point");
                MapResult {
                    batch: batch_index,
                    points: vec![empty_point()],
                    usage: None,
                    llm_calls: 1,
                    context_text: verbose.then_some(batch),
                }
            }
        }
    }

    /// Sorts the surviving key points by score and packs analyst blocks into
    /// `max_data_tokens`. Returns `None` when nothing survives and general
    /// knowledge is not allowed.
    fn assemble_report_data(&self, map_results: &[MapResult]) -> Option<String> {
        let mut key_points: Vec<(usize, &KeyPoint)> = map_results
            .iter()
            .flat_map(|result| result.points.iter().map(move |point| (result.batch, point)))
            .filter(|(_, point)| point.score > 0.0)
            .collect();

        if key_points.is_empty() && !self.allow_general_knowledge {
            return None;
        }
        key_points.sort_by(|(_, a), (_, b)| b.score.total_cmp(&a.score));

        let mut blocks: Vec<String> = Vec::new();
        let mut total_tokens = 0usize;
        for (analyst, point) in key_points {
            let block = format!(
                "----Analyst {}----\nImportance score: {}\n{}",
                analyst + 1,
                format_score(point.score),
                point.answer
            );
            total_tokens += self.counter.count(&block);
            if total_tokens > self.max_data_tokens {
                warn!("Analyst data exceeds maximum token limit, truncating");
                break;
            }
            blocks.push(block);
        }
        Some(blocks.join("\n\n"))
    }

    fn reduce_messages(&self, query: &str, report_data: &str) -> Vec<ChatMessage> {
        let mut prompt = safe_format(
            &self.reduce_sys_prompt,
            &HashMap::from([("report_data", report_data)]),
        );
        if self.allow_general_knowledge {
            prompt.push('\n');
            prompt.push_str(&self.general_knowledge_sys_prompt);
        }
        vec![ChatMessage::system(prompt), ChatMessage::user(query)]
    }

    fn no_data_result(
        &self,
        created: i64,
        started: Instant,
        verbose: bool,
        map_results: Vec<MapResult>,
        map_calls: usize,
    ) -> SearchResult {
        SearchResult {
            created,
            model: self.chat.model().to_string(),
            system_fingerprint: None,
            choice: Choice {
                finish_reason: Some("stop".to_string()),
                message: ResultMessage {
                    content: Some(self.no_data_answer.clone()),
                    refusal: None,
                },
            },
            usage: None,
            verbose: verbose.then(|| {
                Box::new(SearchVerbose {
                    context_text: None,
                    context_data: None,
                    completion_time: started.elapsed().as_secs_f64(),
                    llm_calls: map_calls,
                    map_result: Some(map_results),
                    reduce_context_text: None,
                })
            }),
        }
    }

    fn no_data_chunk(
        &self,
        created: i64,
        started: Instant,
        verbose: bool,
        map_results: Vec<MapResult>,
        map_calls: usize,
    ) -> SearchResultChunk {
        SearchResultChunk {
            created,
            model: self.chat.model().to_string(),
            system_fingerprint: None,
            choice: ChunkChoice {
                finish_reason: Some("stop".to_string()),
                delta: ChunkDelta {
                    content: Some(self.no_data_answer.clone()),
                    refusal: None,
                },
            },
            usage: None,
            verbose: verbose.then(|| {
                Box::new(ChunkVerbose {
                    context_text: None,
                    context_data: None,
                    completion_time: Some(started.elapsed().as_secs_f64()),
                    llm_calls: Some(map_calls),
                    map_result: Some(map_results),
                    reduce_context_text: None,
                })
            }),
        }
    }
}

fn empty_point() -> KeyPoint {
    KeyPoint {
        answer: String::new(),
        score: 0.0,
    }
}

fn format_score(score: f64) -> String {
    if score.fract() == 0.0 {
        format!("{}", score as i64)
    } else {
        score.to_string()
    }
}

/// Parses the map response `{"points": [{"description", "score"}]}`,
/// repairing malformed JSON first. Anything unusable becomes the single
/// empty point.
fn parse_map_points(content: Option<&str>) -> Vec<KeyPoint> {
    let default = vec![empty_point()];
    let Some(content) = content else {
        return default;
    };
    let Some(value) = json_repair::repair_json(content) else {
        return default;
    };
    let Some(points) = value.get("points").and_then(|points| points.as_array()) else {
        return default;
    };

    let parsed: Vec<KeyPoint> = points
        .iter()
        .filter_map(|point| {
            let description = point.get("description")?.as_str()?;
            let score = point.get("score")?.as_f64()?;
            Some(KeyPoint {
                answer: description.to_string(),
                score,
            })
        })
        .collect();
    if parsed.is_empty() {
        return default;
    }
    parsed
}
