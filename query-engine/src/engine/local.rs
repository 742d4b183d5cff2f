use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use common::error::AppError;
use common::utils::template::safe_format;
use tracing::{debug, info, warn};

use crate::context::{LocalContextBuilder, LocalContextParams};
use crate::history::ConversationHistory;
use crate::llm::{ChatLlm, ChatMessage, ChatOptions};
use crate::prompts;

use super::result::{
    chunk_stream_from_chat, now_unix, result_from_response, SearchResult, SearchStream,
    SearchVerbose, VerboseStreamSeed,
};

/// Local search: answer from the entity neighbourhood around the query.
pub struct LocalSearchEngine {
    chat: Arc<dyn ChatLlm>,
    builder: LocalContextBuilder,
    sys_prompt: String,
}

impl LocalSearchEngine {
    pub fn new(
        chat: Arc<dyn ChatLlm>,
        builder: LocalContextBuilder,
        sys_prompt: Option<String>,
    ) -> Self {
        let sys_prompt =
            sys_prompt.unwrap_or_else(|| prompts::LOCAL_SEARCH_SYS_PROMPT.to_string());
        if !sys_prompt.contains("{context_data}") {
            warn!("Local search system prompt does not contain \"{{context_data}}\"");
        }
        Self {
            chat,
            builder,
            sys_prompt,
        }
    }

    async fn prepare_messages(
        &self,
        query: &str,
        history: Option<&ConversationHistory>,
        params: &LocalContextParams,
    ) -> Result<(Vec<ChatMessage>, String, crate::context::ContextSections), AppError> {
        let (context_text, context_data) =
            self.builder.build_context(query, history, params).await?;

        let prompt = safe_format(
            &self.sys_prompt,
            &HashMap::from([("context_data", context_text.as_str())]),
        );
        let mut messages = vec![ChatMessage::system(prompt)];
        if let Some(history) = history {
            messages.extend(history.to_messages());
        }
        messages.push(ChatMessage::user(query));
        debug!(messages = messages.len(), "Constructed local search messages");
        Ok((messages, context_text, context_data))
    }

    pub async fn search(
        &self,
        query: &str,
        history: Option<&ConversationHistory>,
        params: &LocalContextParams,
        options: &ChatOptions,
        verbose: bool,
    ) -> Result<SearchResult, AppError> {
        let started = Instant::now();
        let created = now_unix();
        info!(%query, "Starting local search");

        let (messages, context_text, context_data) =
            self.prepare_messages(query, history, params).await?;
        let response = self.chat.chat(messages, options).await?;

        Ok(result_from_response(
            response,
            self.chat.model(),
            created,
            verbose.then(|| SearchVerbose {
                context_text: Some(context_text),
                context_data: Some(context_data),
                completion_time: started.elapsed().as_secs_f64(),
                llm_calls: 1,
                map_result: None,
                reduce_context_text: None,
            }),
        ))
    }

    pub async fn search_stream(
        &self,
        query: &str,
        history: Option<&ConversationHistory>,
        params: &LocalContextParams,
        options: &ChatOptions,
        verbose: bool,
    ) -> Result<SearchStream, AppError> {
        let started = Instant::now();
        let created = now_unix();
        info!(%query, "Starting streaming local search");

        let (messages, context_text, context_data) =
            self.prepare_messages(query, history, params).await?;
        let upstream = self.chat.chat_stream(messages, options).await?;

        Ok(chunk_stream_from_chat(
            upstream,
            self.chat.model().to_string(),
            created,
            verbose.then(|| VerboseStreamSeed {
                context_text: Some(context_text),
                context_data: Some(context_data),
                llm_calls: 1,
                map_result: None,
                reduce_context_text: None,
                started,
            }),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{local_builder_with_mocks, MockChatLlm};
    use futures::StreamExt;

    #[tokio::test]
    async fn test_search_builds_system_history_user_messages() {
        let chat = Arc::new(MockChatLlm::new(vec!["the answer"]));
        let engine = LocalSearchEngine::new(chat.clone(), local_builder_with_mocks(), None);

        let mut history = ConversationHistory::new();
        history.add_turn(crate::llm::ChatRole::User, "earlier question");
        history.add_turn(crate::llm::ChatRole::Assistant, "earlier answer");

        let result = engine
            .search(
                "what links alpha and beta?",
                Some(&history),
                &LocalContextParams::default(),
                &ChatOptions::default(),
                true,
            )
            .await
            .unwrap();

        assert_eq!(result.choice.message.content.as_deref(), Some("the answer"));
        let verbose = result.verbose.unwrap();
        assert_eq!(verbose.llm_calls, 1);
        assert!(verbose.context_text.is_some());
        assert!(verbose.context_data.as_ref().unwrap().contains_key("entities"));

        let sent = chat.last_messages();
        assert_eq!(sent[0].role, crate::llm::ChatRole::System);
        assert!(sent[0].content.contains("-----Entities-----"));
        assert_eq!(sent[1].content, "earlier question");
        assert_eq!(sent[2].content, "earlier answer");
        assert_eq!(sent.last().unwrap().content, "what links alpha and beta?");
    }

    #[tokio::test]
    async fn test_search_stream_emits_terminal_finish_reason() {
        let chat = Arc::new(MockChatLlm::new(vec!["streamed answer"]));
        let engine = LocalSearchEngine::new(chat, local_builder_with_mocks(), None);

        let stream = engine
            .search_stream(
                "query",
                None,
                &LocalContextParams::default(),
                &ChatOptions::default(),
                false,
            )
            .await
            .unwrap();
        let chunks: Vec<_> = stream.collect().await;
        let last = chunks.last().unwrap().as_ref().unwrap();
        assert_eq!(last.choice.finish_reason.as_deref(), Some("stop"));
        let text: String = chunks
            .iter()
            .filter_map(|chunk| chunk.as_ref().ok())
            .filter_map(|chunk| chunk.choice.delta.content.clone())
            .collect();
        assert_eq!(text, "streamed answer");
    }

    #[tokio::test]
    async fn test_zero_budget_sends_empty_context() {
        let chat = Arc::new(MockChatLlm::new(vec!["ok"]));
        let engine = LocalSearchEngine::new(chat.clone(), local_builder_with_mocks(), None);
        let params = LocalContextParams {
            max_tokens: 0,
            ..LocalContextParams::default()
        };
        engine
            .search("query", None, &params, &ChatOptions::default(), false)
            .await
            .unwrap();
        let sent = chat.last_messages();
        assert_eq!(sent.len(), 2);
        assert!(!sent[0].content.contains("-----Entities-----"));
    }
}
