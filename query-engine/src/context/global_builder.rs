use std::sync::Arc;

use common::utils::tokens::TokenCounter;
use graph_store::{CommunityReport, GraphArtifacts};
use tracing::debug;

use crate::history::{ConversationHistory, HistoryContextParams};

use super::community::{build_community_context, CommunityContextParams};
use super::table::{ContextSections, DEFAULT_COLUMN_DELIMITER};

#[derive(Debug, Clone)]
pub struct GlobalContextParams {
    pub use_community_summary: bool,
    pub shuffle_data: bool,
    pub include_community_rank: bool,
    pub min_community_rank: f64,
    pub max_tokens: usize,
    pub context_name: String,
    pub column_delimiter: char,
    pub conversation_history_user_turns_only: bool,
    pub conversation_history_max_turns: usize,
}

impl Default for GlobalContextParams {
    fn default() -> Self {
        Self {
            use_community_summary: true,
            shuffle_data: true,
            include_community_rank: false,
            min_community_rank: 0.0,
            max_tokens: 8000,
            context_name: "Reports".to_string(),
            column_delimiter: DEFAULT_COLUMN_DELIMITER,
            conversation_history_user_turns_only: true,
            conversation_history_max_turns: 5,
        }
    }
}

/// Batches community reports for the global map phase. Unlike the local
/// builder this may emit several context chunks, one per map call.
pub struct GlobalContextBuilder {
    artifacts: Arc<GraphArtifacts>,
    counter: TokenCounter,
    random_seed: u64,
}

impl GlobalContextBuilder {
    pub fn new(artifacts: Arc<GraphArtifacts>, counter: TokenCounter) -> Self {
        Self {
            artifacts,
            counter,
            random_seed: 42,
        }
    }

    pub fn with_random_seed(mut self, random_seed: u64) -> Self {
        self.random_seed = random_seed;
        self
    }

    /// Produces the map-phase context batches. Reports are ordered by rank,
    /// or shuffled with the fixed seed when `shuffle_data` is set; the
    /// conversation history (when present) is prepended to every batch.
    pub fn build_context(
        &self,
        history: Option<&ConversationHistory>,
        params: &GlobalContextParams,
    ) -> (Vec<String>, ContextSections) {
        let mut sections = ContextSections::new();

        let history_context = history.and_then(|history| {
            let history_params = HistoryContextParams {
                include_user_turns_only: params.conversation_history_user_turns_only,
                max_qa_turns: params.conversation_history_max_turns,
                max_tokens: params.max_tokens,
                recency_bias: false,
                column_delimiter: params.column_delimiter,
                context_name: "Conversation History".to_string(),
            };
            let (text, table) = history.build_context(&self.counter, &history_params);
            if text.is_empty() {
                None
            } else {
                sections.insert("conversation history".to_string(), table);
                Some(text)
            }
        });

        let mut reports: Vec<&CommunityReport> =
            self.artifacts.community_reports.iter().collect();
        if !params.shuffle_data {
            reports.sort_by(|a, b| b.rank.total_cmp(&a.rank));
        }

        let community_params = CommunityContextParams {
            use_community_summary: params.use_community_summary,
            column_delimiter: params.column_delimiter,
            shuffle_data: params.shuffle_data,
            include_community_rank: params.include_community_rank,
            min_community_rank: params.min_community_rank,
            max_tokens: params.max_tokens,
            single_batch: false,
            context_name: params.context_name.clone(),
            random_seed: self.random_seed,
        };
        let (batches, table) = build_community_context(&reports, &self.counter, &community_params);
        sections.insert(params.context_name.to_lowercase(), table);

        let batches = match history_context {
            Some(history_context) => batches
                .into_iter()
                .map(|batch| format!("{history_context}\n\n{batch}"))
                .collect(),
            None => batches,
        };
        debug!(batches = batches.len(), "Built global context batches");
        (batches, sections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ChatRole;

    fn artifacts_with_reports(count: usize) -> Arc<GraphArtifacts> {
        let community_reports = (0..count)
            .map(|i| CommunityReport {
                id: format!("r{i}"),
                short_id: Some(format!("{i}")),
                community_id: format!("{i}"),
                title: format!("Community {i}"),
                summary: "a long enough community summary to occupy some tokens".to_string(),
                full_content: "full community report content".to_string(),
                rank: i as f64,
                attributes: None,
            })
            .collect();
        Arc::new(GraphArtifacts {
            community_reports,
            ..GraphArtifacts::default()
        })
    }

    fn counter() -> TokenCounter {
        TokenCounter::new("cl100k_base").unwrap()
    }

    #[test]
    fn test_batches_respect_budget() {
        let builder = GlobalContextBuilder::new(artifacts_with_reports(10), counter());
        let params = GlobalContextParams {
            shuffle_data: false,
            max_tokens: 80,
            ..GlobalContextParams::default()
        };
        let (batches, sections) = builder.build_context(None, &params);
        assert!(batches.len() > 1);
        for batch in &batches {
            assert!(counter().count(batch) <= 80);
        }
        assert!(sections.contains_key("reports"));
    }

    #[test]
    fn test_rank_ordering_without_shuffle() {
        let builder = GlobalContextBuilder::new(artifacts_with_reports(4), counter());
        let params = GlobalContextParams {
            shuffle_data: false,
            ..GlobalContextParams::default()
        };
        let (batches, _) = builder.build_context(None, &params);
        let first = &batches[0];
        // highest rank comes first
        let pos3 = first.find("Community 3").unwrap();
        let pos0 = first.find("Community 0").unwrap();
        assert!(pos3 < pos0);
    }

    #[test]
    fn test_history_is_prepended_to_each_batch() {
        let mut history = ConversationHistory::new();
        history.add_turn(ChatRole::User, "previous question");
        let builder = GlobalContextBuilder::new(artifacts_with_reports(6), counter());
        let params = GlobalContextParams {
            shuffle_data: false,
            max_tokens: 60,
            ..GlobalContextParams::default()
        };
        let (batches, sections) = builder.build_context(Some(&history), &params);
        assert!(batches.len() > 1);
        for batch in &batches {
            assert!(batch.starts_with("-----Conversation History-----\n"));
        }
        assert!(sections.contains_key("conversation history"));
    }
}
