pub mod openai_chat;
pub mod openai_embedding;

use std::collections::HashMap;
use std::pin::Pin;

use async_openai::types::{
    ChatCompletionTool, ChatCompletionToolChoiceOption, ResponseFormat, ServiceTier,
};
use async_trait::async_trait;
use common::error::AppError;
use futures::Stream;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for ChatRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Options forwarded to the upstream chat endpoint. This is the explicit
/// boundary for client-supplied knobs: anything not listed here is dropped
/// before the upstream call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatOptions {
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
    pub max_completion_tokens: Option<u32>,
    pub frequency_penalty: Option<f32>,
    pub presence_penalty: Option<f32>,
    pub stop: Option<Vec<String>>,
    pub seed: Option<i64>,
    pub response_format: Option<ResponseFormat>,
    pub tool_choice: Option<ChatCompletionToolChoiceOption>,
    pub tools: Option<Vec<ChatCompletionTool>>,
    pub logit_bias: Option<HashMap<String, serde_json::Value>>,
    pub logprobs: Option<bool>,
    pub top_logprobs: Option<u8>,
    pub user: Option<String>,
    pub service_tier: Option<ServiceTier>,
    pub store: Option<bool>,
    pub parallel_tool_calls: Option<bool>,
    pub include_usage: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// A whole (non-streaming) chat completion, reduced to the fields the
/// engines consume.
#[derive(Debug, Clone, Default)]
pub struct ChatResponse {
    pub content: Option<String>,
    pub refusal: Option<String>,
    pub finish_reason: Option<String>,
    pub system_fingerprint: Option<String>,
    pub usage: Option<Usage>,
}

/// One streamed delta. The terminal chunk carries a `finish_reason`; a
/// usage-only trailer may follow when `include_usage` was requested.
#[derive(Debug, Clone, Default)]
pub struct ChatChunk {
    pub content: Option<String>,
    pub refusal: Option<String>,
    pub finish_reason: Option<String>,
    pub system_fingerprint: Option<String>,
    pub usage: Option<Usage>,
}

pub type ChatStream = Pin<Box<dyn Stream<Item = Result<ChatChunk, AppError>> + Send>>;

/// Chat-capable model client. Implementations own retries and timeouts;
/// engines treat a returned error as final.
#[async_trait]
pub trait ChatLlm: Send + Sync {
    fn model(&self) -> &str;

    async fn chat(
        &self,
        messages: Vec<ChatMessage>,
        options: &ChatOptions,
    ) -> Result<ChatResponse, AppError>;

    async fn chat_stream(
        &self,
        messages: Vec<ChatMessage>,
        options: &ChatOptions,
    ) -> Result<ChatStream, AppError>;
}

/// Text embedding client returning unit-norm vectors.
#[async_trait]
pub trait TextEmbedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, AppError>;
}
