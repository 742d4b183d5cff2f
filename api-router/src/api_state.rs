use std::sync::Arc;

use common::{error::AppError, utils::config::AppConfig};
use query_engine::GraphRagClient;

/// Shared per-process state: one graph query client, initialized once at
/// server startup and passed through request context.
#[derive(Clone)]
pub struct ApiState {
    pub client: Arc<GraphRagClient>,
    pub config: AppConfig,
}

impl ApiState {
    pub async fn new(config: &AppConfig) -> Result<Self, AppError> {
        let client = GraphRagClient::from_config(config).await?;
        Ok(Self {
            client: Arc::new(client),
            config: config.clone(),
        })
    }

    pub fn with_client(config: AppConfig, client: Arc<GraphRagClient>) -> Self {
        Self { client, config }
    }
}
