use std::collections::HashMap;

use async_openai::types::{
    ChatCompletionTool, ChatCompletionToolChoiceOption, ResponseFormat, ServiceTier,
};
use query_engine::engine::result::{SearchResult, SearchResultChunk};
use query_engine::{ChatMessage, ChatOptions, ChatRole};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ApiError;

#[derive(Debug, Clone, Deserialize)]
pub struct IncomingMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum StopParam {
    Single(String),
    Many(Vec<String>),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamOptionsParam {
    pub include_usage: Option<bool>,
}

/// Inbound `/chat/completions` body. Fields beyond this set are dropped at
/// deserialization, which is the explicit boundary for unknown options.
#[derive(Debug, Deserialize)]
pub struct CompletionCreateRequest {
    pub model: String,
    pub messages: Vec<IncomingMessage>,
    #[serde(default)]
    pub stream: bool,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
    pub max_completion_tokens: Option<u32>,
    pub frequency_penalty: Option<f32>,
    pub presence_penalty: Option<f32>,
    pub stop: Option<StopParam>,
    pub seed: Option<i64>,
    pub response_format: Option<ResponseFormat>,
    pub tool_choice: Option<ChatCompletionToolChoiceOption>,
    pub tools: Option<Vec<ChatCompletionTool>>,
    pub logit_bias: Option<HashMap<String, Value>>,
    pub logprobs: Option<bool>,
    pub top_logprobs: Option<u8>,
    pub user: Option<String>,
    pub service_tier: Option<ServiceTier>,
    pub store: Option<bool>,
    pub parallel_tool_calls: Option<bool>,
    pub stream_options: Option<StreamOptionsParam>,
}

impl CompletionCreateRequest {
    pub fn validate(&self) -> Result<(), ApiError> {
        let mut reasons = Vec::new();
        if self.model.trim().is_empty() {
            reasons.push("model: must be a non-empty string");
        }
        if self.messages.is_empty() {
            reasons.push("messages: must be a non-empty list");
        }
        if reasons.is_empty() {
            Ok(())
        } else {
            Err(ApiError::Validation(format!(
                "Validation Error: {}.",
                reasons.join("; ")
            )))
        }
    }

    pub fn chat_messages(&self) -> Result<Vec<ChatMessage>, ApiError> {
        self.messages
            .iter()
            .map(|message| {
                let role = match message.role.as_str() {
                    "system" => ChatRole::System,
                    "user" => ChatRole::User,
                    "assistant" => ChatRole::Assistant,
                    other => {
                        return Err(ApiError::Validation(format!(
                            "Validation Error: messages: unknown role '{other}'."
                        )))
                    }
                };
                Ok(ChatMessage {
                    role,
                    content: message.content.clone(),
                })
            })
            .collect()
    }

    pub fn chat_options(&self) -> ChatOptions {
        ChatOptions {
            temperature: self.temperature,
            top_p: self.top_p,
            max_tokens: self.max_tokens,
            max_completion_tokens: self.max_completion_tokens,
            frequency_penalty: self.frequency_penalty,
            presence_penalty: self.presence_penalty,
            stop: self.stop.clone().map(|stop| match stop {
                StopParam::Single(value) => vec![value],
                StopParam::Many(values) => values,
            }),
            seed: self.seed,
            response_format: self.response_format.clone(),
            tool_choice: self.tool_choice.clone(),
            tools: self.tools.clone(),
            logit_bias: self.logit_bias.clone(),
            logprobs: self.logprobs,
            top_logprobs: self.top_logprobs,
            user: self.user.clone(),
            service_tier: self.service_tier.clone(),
            store: self.store,
            parallel_tool_calls: self.parallel_tool_calls,
            include_usage: self.stream_options.as_ref().and_then(|opts| opts.include_usage),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MessageDto {
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refusal: Option<String>,
    pub role: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ChoiceDto {
    pub finish_reason: Option<String>,
    pub index: u32,
    pub message: MessageDto,
}

#[derive(Debug, Serialize)]
pub struct UsageDto {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Outbound non-streaming completion, OpenAI `chat.completion` shaped.
#[derive(Debug, Serialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub choices: Vec<ChoiceDto>,
    pub created: i64,
    pub model: String,
    pub object: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_fingerprint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageDto>,
}

impl ChatCompletionResponse {
    pub fn from_result(id: String, result: SearchResult) -> Self {
        Self {
            id,
            choices: vec![ChoiceDto {
                finish_reason: result.choice.finish_reason,
                index: 0,
                message: MessageDto {
                    content: result.choice.message.content,
                    refusal: result.choice.message.refusal,
                    role: "assistant",
                },
            }],
            created: result.created,
            model: result.model,
            object: "chat.completion",
            system_fingerprint: result.system_fingerprint,
            usage: result.usage.map(|usage| UsageDto {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
                total_tokens: usage.total_tokens,
            }),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DeltaDto {
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refusal: Option<String>,
    pub role: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ChunkChoiceDto {
    pub finish_reason: Option<String>,
    pub index: u32,
    pub delta: DeltaDto,
}

/// Outbound streaming chunk, OpenAI `chat.completion.chunk` shaped.
#[derive(Debug, Serialize)]
pub struct ChatCompletionChunkResponse {
    pub id: String,
    pub choices: Vec<ChunkChoiceDto>,
    pub created: i64,
    pub model: String,
    pub object: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_fingerprint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageDto>,
}

impl ChatCompletionChunkResponse {
    pub fn from_chunk(id: &str, chunk: SearchResultChunk) -> Self {
        Self {
            id: id.to_string(),
            choices: vec![ChunkChoiceDto {
                finish_reason: chunk.choice.finish_reason,
                index: 0,
                delta: DeltaDto {
                    content: chunk.choice.delta.content,
                    refusal: chunk.choice.delta.refusal,
                    role: "assistant",
                },
            }],
            created: chunk.created,
            model: chunk.model,
            object: "chat.completion.chunk",
            system_fingerprint: chunk.system_fingerprint,
            usage: chunk.usage.map(|usage| UsageDto {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
                total_tokens: usage.total_tokens,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_json(messages: &str) -> CompletionCreateRequest {
        serde_json::from_str(&format!(
            r#"{{"model": "graph-rag", "messages": {messages}}}"#
        ))
        .unwrap()
    }

    #[test]
    fn test_validate_rejects_empty_model_and_messages() {
        let request = request_json("[]");
        assert!(request.validate().is_err());

        let request: CompletionCreateRequest = serde_json::from_str(
            r#"{"model": "", "messages": [{"role": "user", "content": "hi"}]}"#,
        )
        .unwrap();
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_messages_convert_roles() {
        let request = request_json(
            r#"[{"role": "user", "content": "q"}, {"role": "assistant", "content": "a"}]"#,
        );
        let messages = request.chat_messages().unwrap();
        assert_eq!(messages[0].role, ChatRole::User);
        assert_eq!(messages[1].role, ChatRole::Assistant);

        let request = request_json(r#"[{"role": "tool", "content": "x"}]"#);
        assert!(request.chat_messages().is_err());
    }

    #[test]
    fn test_options_forward_known_fields_and_drop_unknowns() {
        let request: CompletionCreateRequest = serde_json::from_str(
            r#"{
                "model": "graph-rag",
                "messages": [{"role": "user", "content": "q"}],
                "temperature": 0.2,
                "stop": "END",
                "stream_options": {"include_usage": true},
                "tool_choice": "auto",
                "tools": [{"type": "function", "function": {"name": "lookup_entity"}}],
                "service_tier": "auto",
                "unknown_knob": 42
            }"#,
        )
        .unwrap();
        let options = request.chat_options();
        assert_eq!(options.temperature, Some(0.2));
        assert_eq!(options.stop.as_deref(), Some(&["END".to_string()][..]));
        assert_eq!(options.include_usage, Some(true));
        assert_eq!(
            options.tool_choice,
            Some(ChatCompletionToolChoiceOption::Auto)
        );
        assert_eq!(
            options.tools.as_ref().map(Vec::len),
            Some(1)
        );
        assert_eq!(options.service_tier, Some(ServiceTier::Auto));
    }

    #[test]
    fn test_chunk_response_shape() {
        let chunk = SearchResultChunk {
            created: 7,
            model: "graph-rag".to_string(),
            system_fingerprint: None,
            choice: query_engine::engine::result::ChunkChoice {
                finish_reason: None,
                delta: query_engine::engine::result::ChunkDelta {
                    content: Some("hello".to_string()),
                    refusal: None,
                },
            },
            usage: None,
            verbose: None,
        };
        let response = ChatCompletionChunkResponse::from_chunk("chat-abc", chunk);
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["object"], "chat.completion.chunk");
        assert_eq!(json["choices"][0]["delta"]["content"], "hello");
        assert_eq!(json["choices"][0]["delta"]["role"], "assistant");
        assert_eq!(json["choices"][0]["index"], 0);
    }
}
