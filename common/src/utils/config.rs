use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

/// Runtime configuration, merged from an optional `config.{json,yaml,toml}`
/// file, a `.env` file and `GRAPH_RAG_OPENAI__`-prefixed environment
/// variables (`__` is the nesting delimiter, e.g.
/// `GRAPH_RAG_OPENAI__API_KEYS`).
#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    pub chat_model: String,
    pub chat_api_key: String,
    #[serde(default = "default_base_url")]
    pub chat_base_url: String,
    pub embedding_model: String,
    #[serde(default)]
    pub embedding_api_key: Option<String>,
    #[serde(default = "default_base_url")]
    pub embedding_base_url: String,
    #[serde(default = "default_context_dir")]
    pub context_dir: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_route_prefix")]
    pub route_prefix: String,
    #[serde(default)]
    pub api_keys: Vec<String>,
    #[serde(default = "default_encoding_model")]
    pub encoding_model: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_map_concurrency")]
    pub map_concurrency: usize,
    #[serde(default = "default_local_community_level")]
    pub local_community_level: i64,
    #[serde(default = "default_global_community_level")]
    pub global_community_level: i64,
    #[serde(default)]
    pub allow_general_knowledge: bool,
    #[serde(default = "default_search_engine")]
    pub search_engine: String,
    #[serde(default)]
    pub client_ip_header: Option<String>,
}

impl AppConfig {
    /// Key used for the embedding endpoint, falling back to the chat key.
    pub fn embedding_key(&self) -> &str {
        self.embedding_api_key.as_deref().unwrap_or(&self.chat_api_key)
    }
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_context_dir() -> String {
    "./context".to_string()
}

fn default_http_port() -> u16 {
    8080
}

fn default_route_prefix() -> String {
    "/api/v1".to_string()
}

fn default_encoding_model() -> String {
    "cl100k_base".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> usize {
    3
}

fn default_map_concurrency() -> usize {
    16
}

fn default_local_community_level() -> i64 {
    2
}

fn default_global_community_level() -> i64 {
    1
}

fn default_search_engine() -> String {
    "local".to_string()
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    dotenvy::dotenv().ok();

    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(
            Environment::with_prefix("GRAPH_RAG_OPENAI")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("api_keys"),
        )
        .build()?;

    config.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_optional_fields() {
        let config = Config::builder()
            .set_override("chat_model", "gpt-4o")
            .unwrap()
            .set_override("chat_api_key", "sk-test")
            .unwrap()
            .set_override("embedding_model", "text-embedding-3-small")
            .unwrap()
            .build()
            .unwrap();

        let app: AppConfig = config.try_deserialize().unwrap();
        assert_eq!(app.http_port, 8080);
        assert_eq!(app.route_prefix, "/api/v1");
        assert_eq!(app.encoding_model, "cl100k_base");
        assert_eq!(app.map_concurrency, 16);
        assert_eq!(app.local_community_level, 2);
        assert_eq!(app.global_community_level, 1);
        assert_eq!(app.embedding_key(), "sk-test");
        assert!(app.api_keys.is_empty());
        assert!(!app.allow_general_knowledge);
        assert_eq!(app.search_engine, "local");
        assert!(app.client_ip_header.is_none());
    }

    #[test]
    fn test_embedding_key_prefers_dedicated_key() {
        let config = Config::builder()
            .set_override("chat_model", "gpt-4o")
            .unwrap()
            .set_override("chat_api_key", "sk-chat")
            .unwrap()
            .set_override("embedding_model", "text-embedding-3-small")
            .unwrap()
            .set_override("embedding_api_key", "sk-embed")
            .unwrap()
            .build()
            .unwrap();

        let app: AppConfig = config.try_deserialize().unwrap();
        assert_eq!(app.embedding_key(), "sk-embed");
    }
}
