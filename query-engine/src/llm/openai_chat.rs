use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::types::{
    ChatCompletionRequestAssistantMessage, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessage, ChatCompletionRequestUserMessage,
    ChatCompletionStreamOptions, CompletionUsage, CreateChatCompletionRequest,
    CreateChatCompletionRequestArgs, FinishReason, Stop,
};
use async_openai::Client;
use async_trait::async_trait;
use common::error::AppError;
use futures::StreamExt;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use tracing::debug;

use super::{ChatChunk, ChatLlm, ChatMessage, ChatOptions, ChatResponse, ChatRole, ChatStream, Usage};

/// OpenAI-compatible chat client with bounded retries and a per-call
/// timeout. The base url makes it usable against any compatible endpoint.
pub struct OpenAiChatLlm {
    client: Client<OpenAIConfig>,
    model: String,
    timeout: Duration,
    max_retries: usize,
}

impl OpenAiChatLlm {
    pub fn new(
        model: impl Into<String>,
        api_key: &str,
        base_url: &str,
        timeout: Duration,
        max_retries: usize,
    ) -> Self {
        let config = OpenAIConfig::new()
            .with_api_key(api_key)
            .with_api_base(base_url);
        Self {
            client: Client::with_config(config),
            model: model.into(),
            timeout,
            max_retries: max_retries.min(10),
        }
    }

    fn retry_strategy(&self) -> impl Iterator<Item = Duration> {
        ExponentialBackoff::from_millis(250)
            .map(jitter)
            .take(self.max_retries)
    }

    fn build_request(
        &self,
        messages: Vec<ChatMessage>,
        options: &ChatOptions,
    ) -> Result<CreateChatCompletionRequest, AppError> {
        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(&self.model)
            .messages(to_openai_messages(messages));

        if let Some(value) = options.temperature {
            args.temperature(value);
        }
        if let Some(value) = options.top_p {
            args.top_p(value);
        }
        if let Some(value) = options.max_tokens {
            #[allow(deprecated)]
            args.max_tokens(value);
        }
        if let Some(value) = options.max_completion_tokens {
            args.max_completion_tokens(value);
        }
        if let Some(value) = options.frequency_penalty {
            args.frequency_penalty(value);
        }
        if let Some(value) = options.presence_penalty {
            args.presence_penalty(value);
        }
        if let Some(value) = &options.stop {
            args.stop(Stop::StringArray(value.clone()));
        }
        if let Some(value) = options.seed {
            args.seed(value);
        }
        if let Some(value) = &options.response_format {
            args.response_format(value.clone());
        }
        if let Some(value) = &options.tool_choice {
            args.tool_choice(value.clone());
        }
        if let Some(value) = &options.tools {
            args.tools(value.clone());
        }
        if let Some(value) = &options.logit_bias {
            args.logit_bias(value.clone());
        }
        if let Some(value) = options.logprobs {
            args.logprobs(value);
        }
        if let Some(value) = options.top_logprobs {
            args.top_logprobs(value);
        }
        if let Some(value) = &options.user {
            args.user(value.clone());
        }
        if let Some(value) = &options.service_tier {
            args.service_tier(value.clone());
        }
        if let Some(value) = options.store {
            args.store(value);
        }
        if let Some(value) = options.parallel_tool_calls {
            args.parallel_tool_calls(value);
        }
        if let Some(value) = options.include_usage {
            args.stream_options(ChatCompletionStreamOptions {
                include_usage: value,
            });
        }

        args.build().map_err(AppError::from)
    }
}

#[async_trait]
impl ChatLlm for OpenAiChatLlm {
    fn model(&self) -> &str {
        &self.model
    }

    async fn chat(
        &self,
        messages: Vec<ChatMessage>,
        options: &ChatOptions,
    ) -> Result<ChatResponse, AppError> {
        let request = self.build_request(messages, options)?;
        debug!(model = %self.model, "Dispatching chat completion");

        let response = Retry::spawn(self.retry_strategy(), || {
            let request = request.clone();
            async move {
                tokio::time::timeout(self.timeout, self.client.chat().create(request))
                    .await
                    .map_err(|_| {
                        AppError::UpstreamChat("chat completion timed out".to_string())
                    })?
                    .map_err(AppError::from)
            }
        })
        .await?;

        let choice = response.choices.into_iter().next();
        Ok(ChatResponse {
            content: choice.as_ref().and_then(|c| c.message.content.clone()),
            refusal: choice.as_ref().and_then(|c| c.message.refusal.clone()),
            finish_reason: choice
                .as_ref()
                .and_then(|c| c.finish_reason)
                .map(finish_reason_str),
            system_fingerprint: response.system_fingerprint,
            usage: response.usage.map(usage_from_openai),
        })
    }

    async fn chat_stream(
        &self,
        messages: Vec<ChatMessage>,
        options: &ChatOptions,
    ) -> Result<ChatStream, AppError> {
        let request = self.build_request(messages, options)?;
        debug!(model = %self.model, "Dispatching streaming chat completion");

        let stream = Retry::spawn(self.retry_strategy(), || {
            let request = request.clone();
            async move {
                tokio::time::timeout(self.timeout, self.client.chat().create_stream(request))
                    .await
                    .map_err(|_| {
                        AppError::UpstreamChat("chat completion timed out".to_string())
                    })?
                    .map_err(AppError::from)
            }
        })
        .await?;

        let mapped = stream.map(|item| {
            item.map_err(AppError::from).map(|response| {
                let choice = response.choices.into_iter().next();
                ChatChunk {
                    content: choice.as_ref().and_then(|c| c.delta.content.clone()),
                    refusal: choice.as_ref().and_then(|c| c.delta.refusal.clone()),
                    finish_reason: choice
                        .as_ref()
                        .and_then(|c| c.finish_reason)
                        .map(finish_reason_str),
                    system_fingerprint: response.system_fingerprint,
                    usage: response.usage.map(usage_from_openai),
                }
            })
        });
        Ok(Box::pin(mapped))
    }
}

pub(crate) fn to_openai_messages(messages: Vec<ChatMessage>) -> Vec<ChatCompletionRequestMessage> {
    messages
        .into_iter()
        .map(|message| match message.role {
            ChatRole::System => {
                ChatCompletionRequestSystemMessage::from(message.content).into()
            }
            ChatRole::User => ChatCompletionRequestUserMessage::from(message.content).into(),
            ChatRole::Assistant => {
                ChatCompletionRequestAssistantMessage::from(message.content).into()
            }
        })
        .collect()
}

fn usage_from_openai(usage: CompletionUsage) -> Usage {
    Usage {
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        total_tokens: usage.total_tokens,
    }
}

fn finish_reason_str(reason: FinishReason) -> String {
    match reason {
        FinishReason::Stop => "stop",
        FinishReason::Length => "length",
        FinishReason::ToolCalls => "tool_calls",
        FinishReason::ContentFilter => "content_filter",
        FinishReason::FunctionCall => "function_call",
    }
    .to_string()
}
