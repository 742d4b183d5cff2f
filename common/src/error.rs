use async_openai::error::OpenAIError;
use thiserror::Error;
use tokio::task::JoinError;

// Core internal errors
#[derive(Error, Debug)]
pub enum AppError {
    #[error("OpenAI error: {0}")]
    OpenAI(#[from] OpenAIError),
    #[error("Embedding error: {0}")]
    Embedding(String),
    #[error("Upstream chat error: {0}")]
    UpstreamChat(String),
    #[error("Invalid message sequence: {0}")]
    BadMessage(String),
    #[error("Invalid engine: {0}")]
    BadEngine(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Authorization error: {0}")]
    Auth(String),
    #[error("Directory not found: {0}")]
    DirectoryNotFound(String),
    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),
    #[error("Embedding load failure: {0}")]
    EmbeddingLoad(String),
    #[error("LLM parsing error: {0}")]
    LLMParsing(String),
    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("IoError: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serde error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Task join error: {0}")]
    Join(#[from] JoinError),
    #[error("Internal service error: {0}")]
    Internal(String),
}
