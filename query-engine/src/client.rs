use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use common::error::AppError;
use common::utils::config::AppConfig;
use common::utils::tokens::TokenCounter;
use graph_store::{GraphArtifacts, GraphTables, InMemoryVectorStore, TableNames};
use tracing::info;

use crate::context::{
    EntityStoreKey, GlobalContextBuilder, GlobalContextParams, LocalContextBuilder,
    LocalContextParams,
};
use crate::engine::{GlobalEngineConfig, GlobalSearchEngine, LocalSearchEngine};
use crate::history::ConversationHistory;
use crate::llm::openai_chat::OpenAiChatLlm;
use crate::llm::openai_embedding::OpenAiEmbedder;
use crate::llm::{ChatMessage, ChatOptions, ChatRole};

use crate::engine::result::{SearchResult, SearchStream};

const BAD_MESSAGE: &str =
    "The message must be in the format of alternating roles with the last role being 'user'";

/// The search engine a chat request is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchEngineKind {
    Local,
    Global,
}

impl FromStr for SearchEngineKind {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "local" => Ok(Self::Local),
            "global" => Ok(Self::Global),
            other => Err(AppError::BadEngine(format!(
                "invalid engine '{other}', must be either 'local' or 'global'"
            ))),
        }
    }
}

/// Either a whole result or a chunk stream, matching the `stream` flag.
pub enum ChatOutput {
    Complete(Box<SearchResult>),
    Stream(SearchStream),
}

impl std::fmt::Debug for ChatOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Complete(result) => f.debug_tuple("Complete").field(result).finish(),
            Self::Stream(_) => f.debug_tuple("Stream").field(&"<stream>").finish(),
        }
    }
}

/// Entry point owning both engines. Shared read-only across requests; all
/// per-call state lives on the stack of `chat`.
pub struct GraphRagClient {
    local: LocalSearchEngine,
    global: GlobalSearchEngine,
    local_params: LocalContextParams,
    global_params: GlobalContextParams,
}

impl GraphRagClient {
    pub fn new(local: LocalSearchEngine, global: GlobalSearchEngine) -> Self {
        Self {
            local,
            global,
            local_params: LocalContextParams::default(),
            global_params: GlobalContextParams::default(),
        }
    }

    /// Full wiring from configuration: loads the graph tables, projects the
    /// artifacts at the per-engine community levels, populates the entity
    /// embedding store and connects the upstream clients.
    pub async fn from_config(config: &AppConfig) -> Result<Self, AppError> {
        let counter = TokenCounter::new(&config.encoding_model)?;
        // upstream deadline is bounded to (0, 60) seconds
        let timeout = Duration::from_secs(config.request_timeout_secs.clamp(1, 59));

        let chat = Arc::new(OpenAiChatLlm::new(
            &config.chat_model,
            &config.chat_api_key,
            &config.chat_base_url,
            timeout,
            config.max_retries,
        ));
        let embedder = Arc::new(OpenAiEmbedder::new(
            &config.embedding_model,
            config.embedding_key(),
            &config.embedding_base_url,
            counter.clone(),
            timeout,
            config.max_retries,
        ));

        let tables = GraphTables::from_directory(&config.context_dir, &TableNames::default())?;
        let local_artifacts = Arc::new(GraphArtifacts::load(
            &tables,
            config.local_community_level,
        )?);
        let global_artifacts = Arc::new(GraphArtifacts::load(
            &tables,
            config.global_community_level,
        )?);
        info!(
            context_dir = %config.context_dir,
            "Initialized graph artifacts for both engines"
        );

        let store = Arc::new(InMemoryVectorStore::new());
        let local_builder = LocalContextBuilder::new(
            local_artifacts,
            store,
            embedder,
            counter.clone(),
            EntityStoreKey::Id,
        )?;
        let global_builder = GlobalContextBuilder::new(global_artifacts, counter.clone());

        let local_chat: Arc<dyn crate::llm::ChatLlm> = Arc::clone(&chat) as Arc<dyn crate::llm::ChatLlm>;
        let local = LocalSearchEngine::new(local_chat, local_builder, None);
        let global = GlobalSearchEngine::new(
            chat,
            global_builder,
            counter,
            GlobalEngineConfig {
                allow_general_knowledge: config.allow_general_knowledge,
                concurrency: config.map_concurrency,
                ..GlobalEngineConfig::default()
            },
        );
        Ok(Self::new(local, global))
    }

    pub fn with_local_params(mut self, params: LocalContextParams) -> Self {
        self.local_params = params;
        self
    }

    pub fn with_global_params(mut self, params: GlobalContextParams) -> Self {
        self.global_params = params;
        self
    }

    /// Validates the message sequence, splits off the trailing user query
    /// and dispatches to the requested engine.
    pub async fn chat(
        &self,
        engine: &str,
        messages: Vec<ChatMessage>,
        stream: bool,
        verbose: bool,
        options: &ChatOptions,
    ) -> Result<ChatOutput, AppError> {
        let engine = SearchEngineKind::from_str(engine)?;
        validate_messages(&messages)?;

        let (query, history_messages) = match messages.split_last() {
            Some((last, rest)) => (last.content.clone(), rest),
            None => return Err(AppError::BadMessage(BAD_MESSAGE.to_string())),
        };
        let history = (!history_messages.is_empty())
            .then(|| ConversationHistory::from_messages(history_messages));

        match (engine, stream) {
            (SearchEngineKind::Local, false) => self
                .local
                .search(&query, history.as_ref(), &self.local_params, options, verbose)
                .await
                .map(|result| ChatOutput::Complete(Box::new(result))),
            (SearchEngineKind::Local, true) => self
                .local
                .search_stream(&query, history.as_ref(), &self.local_params, options, verbose)
                .await
                .map(ChatOutput::Stream),
            (SearchEngineKind::Global, false) => self
                .global
                .search(&query, history.as_ref(), &self.global_params, options, verbose)
                .await
                .map(|result| ChatOutput::Complete(Box::new(result))),
            (SearchEngineKind::Global, true) => self
                .global
                .search_stream(&query, history.as_ref(), &self.global_params, options, verbose)
                .await
                .map(ChatOutput::Stream),
        }
    }
}

/// A valid message list is non-empty, free of `system` roles, alternates
/// `user`/`assistant` and ends with `user`.
pub fn validate_messages(messages: &[ChatMessage]) -> Result<(), AppError> {
    if messages.is_empty() {
        return Err(AppError::BadMessage(BAD_MESSAGE.to_string()));
    }
    for (index, message) in messages.iter().enumerate() {
        let expected = if index % 2 == 0 {
            ChatRole::User
        } else {
            ChatRole::Assistant
        };
        if message.role == ChatRole::System || message.role != expected {
            return Err(AppError::BadMessage(BAD_MESSAGE.to_string()));
        }
    }
    if messages.len() % 2 == 0 {
        return Err(AppError::BadMessage(BAD_MESSAGE.to_string()));
    }
    Ok(())
}
