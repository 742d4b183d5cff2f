use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use common::error::AppError;
use common::utils::tokens::TokenCounter;
use graph_store::{Entity, GraphArtifacts, VectorDocument, VectorStore};
use tracing::{debug, warn};

use crate::history::ConversationHistory;
use crate::llm::TextEmbedder;

use super::community::{build_community_context, CommunityContextParams};
use super::local::{build_covariates_context, build_entity_context, build_relationship_context};
use super::source::{build_text_unit_context, count_relationships};
use super::table::{ContextSections, ContextTable, DEFAULT_COLUMN_DELIMITER};

/// Splits the context budget into (community, local, text-unit) shares:
/// `⌊M·c⌋ / ⌊M·(1−c−t)⌋ / ⌊M·t⌋`.
pub(crate) fn split_budget(
    max_tokens: usize,
    community_prop: f64,
    text_unit_prop: f64,
) -> (usize, usize, usize) {
    let local_prop = 1.0 - community_prop - text_unit_prop;
    let share = |prop: f64| (max_tokens as f64 * prop).floor().max(0.0) as usize;
    (
        share(community_prop),
        share(local_prop),
        share(text_unit_prop),
    )
}

/// Which document id the entity embedding store is keyed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityStoreKey {
    Id,
    Title,
}

/// Policy knobs for one local context assembly.
#[derive(Debug, Clone)]
pub struct LocalContextParams {
    pub include_entity_names: Vec<String>,
    pub exclude_entity_names: Vec<String>,
    pub conversation_history_max_turns: usize,
    pub max_tokens: usize,
    pub text_unit_prop: f64,
    pub community_prop: f64,
    pub top_k_mapped_entities: usize,
    pub top_k_relationships: usize,
    pub oversample_scaler: usize,
    pub include_entity_rank: bool,
    pub rank_description: String,
    pub include_relationship_weight: bool,
    pub relationship_ranking_attribute: String,
    pub use_community_summary: bool,
    pub include_community_rank: bool,
    pub min_community_rank: f64,
    pub community_context_name: String,
    pub column_delimiter: char,
}

impl Default for LocalContextParams {
    fn default() -> Self {
        Self {
            include_entity_names: Vec::new(),
            exclude_entity_names: Vec::new(),
            conversation_history_max_turns: 5,
            max_tokens: 8000,
            text_unit_prop: 0.5,
            community_prop: 0.25,
            top_k_mapped_entities: 10,
            top_k_relationships: 10,
            oversample_scaler: 2,
            include_entity_rank: false,
            rank_description: "number of relationships".to_string(),
            include_relationship_weight: false,
            relationship_ranking_attribute: "rank".to_string(),
            use_community_summary: false,
            include_community_rank: false,
            min_community_rank: 0.0,
            community_context_name: "Reports".to_string(),
            column_delimiter: DEFAULT_COLUMN_DELIMITER,
        }
    }
}

/// Assembles the token-budgeted local search context: community reports,
/// entity/relationship/covariate tables and text units around the entities
/// the query maps to.
pub struct LocalContextBuilder {
    artifacts: Arc<GraphArtifacts>,
    entity_by_id: HashMap<String, usize>,
    entities_by_title: HashMap<String, Vec<usize>>,
    report_by_community: HashMap<String, usize>,
    text_unit_by_id: HashMap<String, usize>,
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn TextEmbedder>,
    counter: TokenCounter,
    store_key: EntityStoreKey,
}

impl LocalContextBuilder {
    /// Builds the context builder and populates the vector store from the
    /// entity description embeddings. Fails with `EmbeddingLoad` when the
    /// entity set carries no embeddings at all.
    pub fn new(
        artifacts: Arc<GraphArtifacts>,
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn TextEmbedder>,
        counter: TokenCounter,
        store_key: EntityStoreKey,
    ) -> Result<Self, AppError> {
        let mut entity_by_id = HashMap::new();
        let mut entities_by_title: HashMap<String, Vec<usize>> = HashMap::new();
        for (index, entity) in artifacts.entities.iter().enumerate() {
            entity_by_id.insert(entity.id.clone(), index);
            entities_by_title
                .entry(entity.title.clone())
                .or_default()
                .push(index);
        }
        let report_by_community = artifacts
            .community_reports
            .iter()
            .enumerate()
            .map(|(index, report)| (report.community_id.clone(), index))
            .collect();
        let text_unit_by_id = artifacts
            .text_units
            .iter()
            .enumerate()
            .map(|(index, unit)| (unit.id.clone(), index))
            .collect();

        let builder = Self {
            artifacts,
            entity_by_id,
            entities_by_title,
            report_by_community,
            text_unit_by_id,
            store,
            embedder,
            counter,
            store_key,
        };
        builder.load_entity_embeddings()?;
        Ok(builder)
    }

    fn load_entity_embeddings(&self) -> Result<(), AppError> {
        let documents: Vec<VectorDocument> = self
            .artifacts
            .entities
            .iter()
            .map(|entity| VectorDocument {
                id: match self.store_key {
                    EntityStoreKey::Id => entity.id.clone(),
                    EntityStoreKey::Title => entity.title.clone(),
                },
                text: entity.description.clone(),
                vector: entity.description_embedding.clone(),
                attributes: [(
                    "title".to_string(),
                    serde_json::Value::String(entity.title.clone()),
                )]
                .into_iter()
                .collect(),
            })
            .collect();

        let with_vectors = documents
            .iter()
            .filter(|document| document.vector.is_some())
            .count();
        if with_vectors == 0 && !documents.is_empty() {
            return Err(AppError::EmbeddingLoad(
                "no entity description embeddings present in the entity table".to_string(),
            ));
        }
        self.store.load(documents, true);
        debug!(loaded = with_vectors, "Entity description embeddings loaded");
        Ok(())
    }

    fn resolve_hit(&self, document_id: &str) -> Option<&Entity> {
        let index = match self.store_key {
            EntityStoreKey::Id => self.entity_by_id.get(document_id).copied(),
            EntityStoreKey::Title => self
                .entities_by_title
                .get(document_id)
                .and_then(|indices| indices.first().copied()),
        }?;
        self.artifacts.entities.get(index)
    }

    /// Maps the query onto entities: ANN over description embeddings with
    /// oversampling, or top-`k` by rank for an empty query. Excluded names
    /// are dropped, included names prepended.
    async fn map_query_to_entities(
        &self,
        query: &str,
        params: &LocalContextParams,
    ) -> Result<Vec<&Entity>, AppError> {
        let mut matched: Vec<&Entity> = Vec::new();
        if query.is_empty() {
            let mut indices: Vec<usize> = (0..self.artifacts.entities.len()).collect();
            indices.sort_by_key(|&index| {
                std::cmp::Reverse(
                    self.artifacts
                        .entities
                        .get(index)
                        .map(|entity| entity.rank)
                        .unwrap_or(0),
                )
            });
            matched = indices
                .into_iter()
                .take(params.top_k_mapped_entities)
                .filter_map(|index| self.artifacts.entities.get(index))
                .collect();
        } else {
            let embedding = self.embedder.embed(query).await?;
            let hits = self.store.search_by_vector(
                &embedding,
                params
                    .top_k_mapped_entities
                    .saturating_mul(params.oversample_scaler.max(1)),
            );
            for hit in hits {
                if let Some(entity) = self.resolve_hit(&hit.document.id) {
                    matched.push(entity);
                }
            }
        }

        if !params.exclude_entity_names.is_empty() {
            matched.retain(|entity| !params.exclude_entity_names.contains(&entity.title));
        }

        let mut selected: Vec<&Entity> = Vec::new();
        for name in &params.include_entity_names {
            if let Some(indices) = self.entities_by_title.get(name) {
                selected.extend(
                    indices
                        .iter()
                        .filter_map(|&index| self.artifacts.entities.get(index)),
                );
            }
        }
        selected.extend(matched);
        Ok(selected)
    }

    /// Builds the full local context. The query is augmented with recent
    /// user turns for similarity search only; the returned text never
    /// includes them.
    pub async fn build_context(
        &self,
        query: &str,
        history: Option<&ConversationHistory>,
        params: &LocalContextParams,
    ) -> Result<(String, ContextSections), AppError> {
        if params.community_prop + params.text_unit_prop > 1.0 {
            return Err(AppError::Validation(
                "the sum of community_prop and text_unit_prop must not exceed 1".to_string(),
            ));
        }

        let augmented_query = match history {
            Some(history) if !history.is_empty() => {
                let user_turns = history.get_user_turns(params.conversation_history_max_turns);
                if user_turns.is_empty() {
                    query.to_string()
                } else {
                    format!("{query}\n{}", user_turns.join("\n"))
                }
            }
            _ => query.to_string(),
        };

        let selected = self
            .map_query_to_entities(&augmented_query, params)
            .await?;
        debug!(selected = selected.len(), "Mapped query to entities");

        let mut final_parts: Vec<String> = Vec::new();
        let mut sections = ContextSections::new();

        let (community_tokens, local_tokens, text_unit_tokens) = split_budget(
            params.max_tokens,
            params.community_prop,
            params.text_unit_prop,
        );
        let (community_text, community_table) =
            self.build_community_section(&selected, community_tokens, params);
        if !community_text.trim().is_empty() {
            final_parts.push(community_text);
            sections.insert(
                params.community_context_name.to_lowercase(),
                community_table,
            );
        }

        let (local_text, local_sections) = self.build_local_section(&selected, local_tokens, params);
        if !local_text.trim().is_empty() {
            final_parts.push(local_text);
            sections.extend(local_sections);
        }

        let (text_unit_text, text_unit_table) =
            self.build_text_unit_section(&selected, text_unit_tokens, params);
        if !text_unit_text.trim().is_empty() {
            final_parts.push(text_unit_text);
            sections.insert("sources".to_string(), text_unit_table);
        }

        Ok((final_parts.join("\n\n"), sections))
    }

    /// Community reports the selected entities belong to, ordered by
    /// (matched entities desc, report rank desc), packed into the budget.
    fn build_community_section(
        &self,
        selected: &[&Entity],
        max_tokens: usize,
        params: &LocalContextParams,
    ) -> (String, ContextTable) {
        if selected.is_empty() || self.artifacts.community_reports.is_empty() {
            return (
                String::new(),
                ContextTable::new(&["id", "title", "summary"]),
            );
        }

        let mut matches: HashMap<&str, usize> = HashMap::new();
        for entity in selected {
            if let Some(community_ids) = &entity.community_ids {
                for community_id in community_ids {
                    if self.report_by_community.contains_key(community_id) {
                        *matches.entry(community_id.as_str()).or_default() += 1;
                    }
                }
            }
        }

        let mut ordered: Vec<(usize, usize)> = matches
            .iter()
            .filter_map(|(community_id, &count)| {
                self.report_by_community
                    .get(*community_id)
                    .map(|&index| (index, count))
            })
            .collect();
        ordered.sort_by(|(index_a, count_a), (index_b, count_b)| {
            let rank_a = self
                .artifacts
                .community_reports
                .get(*index_a)
                .map_or(0.0, |r| r.rank);
            let rank_b = self
                .artifacts
                .community_reports
                .get(*index_b)
                .map_or(0.0, |r| r.rank);
            count_b
                .cmp(count_a)
                .then_with(|| rank_b.total_cmp(&rank_a))
        });

        let reports: Vec<&graph_store::CommunityReport> = ordered
            .iter()
            .filter_map(|(index, _)| self.artifacts.community_reports.get(*index))
            .collect();

        let community_params = CommunityContextParams {
            use_community_summary: params.use_community_summary,
            column_delimiter: params.column_delimiter,
            shuffle_data: false,
            include_community_rank: params.include_community_rank,
            min_community_rank: params.min_community_rank,
            max_tokens,
            single_batch: true,
            context_name: params.community_context_name.clone(),
            random_seed: 0,
        };
        let (batches, table) = build_community_context(&reports, &self.counter, &community_params);
        (batches.join("\n\n"), table)
    }

    /// Entity table plus, entity by entity, relationship and covariate
    /// tables. The loop reverts to the previous snapshot the moment the
    /// running total overruns the budget.
    fn build_local_section(
        &self,
        selected: &[&Entity],
        max_tokens: usize,
        params: &LocalContextParams,
    ) -> (String, ContextSections) {
        let mut sections = ContextSections::new();
        if selected.is_empty() {
            sections.insert("entities".to_string(), ContextTable::new(&["id", "entity", "description"]));
            return (String::new(), sections);
        }

        let (entity_text, entity_table) = build_entity_context(
            selected,
            &self.counter,
            max_tokens,
            params.include_entity_rank,
            &params.rank_description,
            params.column_delimiter,
            "Entities",
        );
        let entity_tokens = self.counter.count(&entity_text);

        let covariate_classes: BTreeMap<&String, &Vec<graph_store::Covariate>> =
            self.artifacts.covariates.iter().collect();

        let mut added: Vec<&Entity> = Vec::new();
        let mut final_parts: Vec<String> = Vec::new();
        let mut final_sections = ContextSections::new();

        for entity in selected {
            added.push(entity);

            let (relationship_text, relationship_table) = build_relationship_context(
                &added,
                &self.artifacts.relationships,
                &self.counter,
                max_tokens,
                params.top_k_relationships,
                params.include_relationship_weight,
                &params.relationship_ranking_attribute,
                params.column_delimiter,
                "Relationships",
            );
            let mut current_parts = vec![relationship_text.clone()];
            let mut current_sections = ContextSections::new();
            current_sections.insert("relationships".to_string(), relationship_table);
            let mut total_tokens = entity_tokens + self.counter.count(&relationship_text);

            for (class, covariates) in &covariate_classes {
                let (covariate_text, covariate_table) = build_covariates_context(
                    &added,
                    covariates,
                    &self.counter,
                    max_tokens,
                    params.column_delimiter,
                    class,
                );
                total_tokens += self.counter.count(&covariate_text);
                current_parts.push(covariate_text);
                current_sections.insert(class.to_lowercase(), covariate_table);
            }

            if total_tokens > max_tokens {
                warn!("Reached token limit - reverting to previous context state");
                break;
            }
            final_parts = current_parts;
            final_sections = current_sections;
        }

        let tail = final_parts
            .iter()
            .filter(|part| !part.trim().is_empty())
            .cloned()
            .collect::<Vec<_>>()
            .join("\n\n");
        let text = if tail.is_empty() {
            entity_text
        } else {
            format!("{entity_text}\n\n{tail}")
        };

        sections.extend(final_sections);
        sections.insert("entities".to_string(), entity_table);
        (text, sections)
    }

    /// Text units referenced by the selected entities, deduplicated and
    /// ordered by (entity order asc, tied relationships desc).
    fn build_text_unit_section(
        &self,
        selected: &[&Entity],
        max_tokens: usize,
        params: &LocalContextParams,
    ) -> (String, ContextTable) {
        if selected.is_empty() || self.artifacts.text_units.is_empty() {
            return (String::new(), ContextTable::new(&["id", "text"]));
        }

        let mut seen: HashSet<&str> = HashSet::new();
        let mut annotated: Vec<(usize, usize, &graph_store::TextUnit)> = Vec::new();
        for (entity_order, entity) in selected.iter().enumerate() {
            let Some(unit_ids) = &entity.text_unit_ids else {
                continue;
            };
            for unit_id in unit_ids {
                if seen.contains(unit_id.as_str()) {
                    continue;
                }
                let Some(unit) = self
                    .text_unit_by_id
                    .get(unit_id)
                    .and_then(|&index| self.artifacts.text_units.get(index))
                else {
                    continue;
                };
                seen.insert(unit_id.as_str());
                let num_relationships =
                    count_relationships(unit, entity, &self.artifacts.relationships);
                annotated.push((entity_order, num_relationships, unit));
            }
        }

        annotated.sort_by(|(order_a, rels_a, _), (order_b, rels_b, _)| {
            order_a.cmp(order_b).then_with(|| rels_b.cmp(rels_a))
        });

        let units: Vec<&graph_store::TextUnit> =
            annotated.iter().map(|(_, _, unit)| *unit).collect();
        build_text_unit_context(
            &units,
            &self.counter,
            max_tokens,
            params.column_delimiter,
            "Sources",
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::local_builder_with_mocks;

    fn entity_titles(sections: &ContextSections) -> Vec<String> {
        sections
            .get("entities")
            .map(|table| table.rows.iter().map(|row| row[1].clone()).collect())
            .unwrap_or_default()
    }

    #[test]
    fn test_budget_split() {
        assert_eq!(split_budget(1000, 0.3, 0.2), (300, 500, 200));
        assert_eq!(split_budget(0, 0.3, 0.2), (0, 0, 0));
        assert_eq!(split_budget(100, 0.0, 0.0), (0, 100, 0));
    }

    #[tokio::test]
    async fn test_invalid_proportions_are_rejected() {
        let builder = local_builder_with_mocks();
        let params = LocalContextParams {
            community_prop: 0.7,
            text_unit_prop: 0.5,
            ..LocalContextParams::default()
        };
        let err = builder.build_context("query", None, &params).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn test_empty_query_selects_top_ranked_entities() {
        let builder = local_builder_with_mocks();
        let params = LocalContextParams {
            top_k_mapped_entities: 2,
            ..LocalContextParams::default()
        };
        let (_, sections) = builder.build_context("", None, &params).await.unwrap();
        assert_eq!(entity_titles(&sections), vec!["Alpha", "Beta"]);
    }

    #[tokio::test]
    async fn test_similarity_query_selects_nearest_entities() {
        let builder = local_builder_with_mocks();
        let (text, sections) = builder
            .build_context("who is alpha", None, &LocalContextParams::default())
            .await
            .unwrap();
        // the embedder points at Alpha's vector, so Alpha comes first
        assert_eq!(entity_titles(&sections)[0], "Alpha");
        assert!(text.contains("-----Entities-----"));
        assert!(text.contains("-----Relationships-----"));
        assert!(text.contains("-----Sources-----"));
        assert!(sections.contains_key("claims"));
        assert!(sections.contains_key("reports"));
    }

    #[tokio::test]
    async fn test_exclude_and_include_entity_names() {
        let builder = local_builder_with_mocks();
        let params = LocalContextParams {
            exclude_entity_names: vec!["Alpha".to_string()],
            include_entity_names: vec!["Gamma".to_string()],
            ..LocalContextParams::default()
        };
        let (_, sections) = builder
            .build_context("who is alpha", None, &params)
            .await
            .unwrap();
        let titles = entity_titles(&sections);
        assert_eq!(titles[0], "Gamma");
        assert!(!titles.contains(&"Alpha".to_string()));
    }

    #[tokio::test]
    async fn test_community_section_orders_by_matches_then_rank() {
        let builder = local_builder_with_mocks();
        let (_, sections) = builder
            .build_context("who is alpha", None, &LocalContextParams::default())
            .await
            .unwrap();
        let reports = sections.get("reports").unwrap();
        // Alpha and Beta both sit in community 1, only Gamma in community 2;
        // more matches beats the higher report rank
        assert_eq!(reports.rows[0][1], "Alpha-Beta community");
    }

    #[tokio::test]
    async fn test_rendered_context_stays_within_budget() {
        let builder = local_builder_with_mocks();
        let params = LocalContextParams {
            max_tokens: 200,
            ..LocalContextParams::default()
        };
        let (text, _) = builder
            .build_context("who is alpha", None, &params)
            .await
            .unwrap();
        let counter = common::utils::tokens::TokenCounter::new("cl100k_base").unwrap();
        // allow slack for the per-section banners and blank-line joins
        assert!(counter.count(&text) <= 200 + 40);
    }

    #[tokio::test]
    async fn test_history_augments_similarity_but_not_output() {
        use crate::history::ConversationHistory;
        use crate::llm::ChatRole;

        let builder = local_builder_with_mocks();
        let mut history = ConversationHistory::new();
        history.add_turn(ChatRole::User, "unrelated earlier question");

        let (text, _) = builder
            .build_context("who is alpha", Some(&history), &LocalContextParams::default())
            .await
            .unwrap();
        assert!(!text.contains("unrelated earlier question"));
    }

    #[tokio::test]
    async fn test_missing_history_equals_empty_history() {
        use crate::history::ConversationHistory;

        let builder = local_builder_with_mocks();
        let params = LocalContextParams::default();
        let (without, _) = builder.build_context("who is alpha", None, &params).await.unwrap();
        let empty = ConversationHistory::new();
        let (with_empty, _) = builder
            .build_context("who is alpha", Some(&empty), &params)
            .await
            .unwrap();
        assert_eq!(without, with_empty);
    }

    #[tokio::test]
    async fn test_text_units_deduplicated_across_entities() {
        let builder = local_builder_with_mocks();
        let (_, sections) = builder
            .build_context("who is alpha", None, &LocalContextParams::default())
            .await
            .unwrap();
        let sources = sections.get("sources").unwrap();
        let ids: Vec<&str> = sources.rows.iter().map(|row| row[0].as_str()).collect();
        let mut deduped = ids.clone();
        deduped.dedup();
        assert_eq!(ids, deduped);
        // u2 is shared between Alpha and Beta but appears once
        assert_eq!(ids.iter().filter(|id| **id == "u2").count(), 1);
    }
}
