use std::collections::{HashMap, HashSet};

use arrow_array::RecordBatch;
use common::error::AppError;
use serde_json::Value;
use tracing::info;

use crate::model::{Covariate, CommunityReport, Entity, Relationship, TextUnit};
use crate::tables::{
    f32_list_at, f64_at, i64_at, require_column, str_list_at, utf8_at, GraphTables,
};

/// Covariate detail columns carried into the rendered claim tables when the
/// on-disk table provides them.
const COVARIATE_DETAIL_COLUMNS: &[&str] = &["type", "status", "description"];

/// Typed projection of the columnar tables, immutable for the lifetime of an
/// engine. Covariates are grouped per class; the claim extractor emits a
/// single `claims` class.
#[derive(Debug, Default)]
pub struct GraphArtifacts {
    pub entities: Vec<Entity>,
    pub relationships: Vec<Relationship>,
    pub covariates: HashMap<String, Vec<Covariate>>,
    pub text_units: Vec<TextUnit>,
    pub community_reports: Vec<CommunityReport>,
}

impl GraphArtifacts {
    pub fn load(tables: &GraphTables, community_level: i64) -> Result<Self, AppError> {
        let nodes = project_nodes(&tables.nodes, community_level)?;
        let entities = project_entities(&tables.entities, &nodes)?;
        let community_reports =
            project_community_reports(&tables.community_reports, community_level, &nodes)?;
        let relationships = project_relationships(&tables.relationships)?;
        let text_units = project_text_units(&tables.text_units)?;
        let covariates = match &tables.covariates {
            Some(batches) => project_covariates(batches)?,
            None => HashMap::new(),
        };

        info!(
            community_level,
            entities = entities.len(),
            relationships = relationships.len(),
            community_reports = community_reports.len(),
            text_units = text_units.len(),
            "Projected graph artifacts"
        );

        Ok(Self {
            entities,
            relationships,
            covariates,
            text_units,
            community_reports,
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct NodeInfo {
    rank: i64,
    community: i64,
}

/// Surviving node per title: rows above `community_level` are dropped, the
/// highest community wins per title, missing community encodes as -1.
fn project_nodes(
    batches: &[RecordBatch],
    community_level: i64,
) -> Result<HashMap<String, NodeInfo>, AppError> {
    require_column(batches, "nodes", "title")?;

    let mut per_title: HashMap<String, NodeInfo> = HashMap::new();
    for batch in batches {
        for row in 0..batch.num_rows() {
            let level = i64_at(batch, "level", row).unwrap_or(0);
            if level > community_level {
                continue;
            }
            let Some(title) = utf8_at(batch, "title", row) else {
                continue;
            };
            let rank = i64_at(batch, "degree", row)
                .or_else(|| i64_at(batch, "rank", row))
                .unwrap_or(0);
            let community = i64_at(batch, "community", row).unwrap_or(-1);
            per_title
                .entry(title)
                .and_modify(|node| {
                    node.community = node.community.max(community);
                    node.rank = node.rank.max(rank);
                })
                .or_insert(NodeInfo { rank, community });
        }
    }
    Ok(per_title)
}

/// Entities inner-joined with surviving nodes on title, deduplicated,
/// community ids normalized to a single-element string list.
fn project_entities(
    batches: &[RecordBatch],
    nodes: &HashMap<String, NodeInfo>,
) -> Result<Vec<Entity>, AppError> {
    require_column(batches, "entities", "id")?;

    let mut seen_titles = HashSet::new();
    let mut entities = Vec::new();
    for batch in batches {
        for row in 0..batch.num_rows() {
            let Some(title) =
                utf8_at(batch, "title", row).or_else(|| utf8_at(batch, "name", row))
            else {
                continue;
            };
            let Some(node) = nodes.get(&title) else {
                continue;
            };
            if !seen_titles.insert(title.clone()) {
                continue;
            }
            let id = utf8_at(batch, "id", row).ok_or_else(|| {
                AppError::SchemaMismatch(format!("entity {title} has no id"))
            })?;
            entities.push(Entity {
                id,
                short_id: utf8_at(batch, "human_readable_id", row)
                    .or_else(|| Some(row.to_string())),
                title,
                entity_type: utf8_at(batch, "type", row),
                description: utf8_at(batch, "description", row),
                description_embedding: f32_list_at(batch, "description_embedding", row),
                graph_embedding: f32_list_at(batch, "graph_embedding", row),
                community_ids: Some(vec![node.community.to_string()]),
                text_unit_ids: str_list_at(batch, "text_unit_ids", row),
                rank: node.rank,
                attributes: None,
            });
        }
    }
    Ok(entities)
}

/// Reports filtered by level and inner-joined with the communities the
/// surviving nodes reference.
fn project_community_reports(
    batches: &[RecordBatch],
    community_level: i64,
    nodes: &HashMap<String, NodeInfo>,
) -> Result<Vec<CommunityReport>, AppError> {
    require_column(batches, "community_reports", "community")?;

    let referenced: HashSet<String> = nodes
        .values()
        .map(|node| node.community.to_string())
        .collect();

    let mut reports = Vec::new();
    for batch in batches {
        for row in 0..batch.num_rows() {
            let level = i64_at(batch, "level", row).unwrap_or(0);
            if level > community_level {
                continue;
            }
            let Some(community_id) = utf8_at(batch, "community", row) else {
                continue;
            };
            if !referenced.contains(&community_id) {
                continue;
            }
            reports.push(CommunityReport {
                id: utf8_at(batch, "id", row).unwrap_or_else(|| community_id.clone()),
                short_id: utf8_at(batch, "human_readable_id", row)
                    .or_else(|| Some(community_id.clone())),
                community_id,
                title: utf8_at(batch, "title", row).unwrap_or_default(),
                summary: utf8_at(batch, "summary", row).unwrap_or_default(),
                full_content: utf8_at(batch, "full_content", row).unwrap_or_default(),
                rank: f64_at(batch, "rank", row).unwrap_or(0.0),
                attributes: None,
            });
        }
    }
    Ok(reports)
}

fn project_relationships(batches: &[RecordBatch]) -> Result<Vec<Relationship>, AppError> {
    require_column(batches, "relationships", "source")?;
    require_column(batches, "relationships", "target")?;

    let mut relationships = Vec::new();
    for batch in batches {
        for row in 0..batch.num_rows() {
            let (Some(source), Some(target)) = (
                utf8_at(batch, "source", row),
                utf8_at(batch, "target", row),
            ) else {
                continue;
            };
            relationships.push(Relationship {
                id: utf8_at(batch, "id", row).unwrap_or_else(|| row.to_string()),
                short_id: utf8_at(batch, "human_readable_id", row)
                    .or_else(|| Some(row.to_string())),
                source,
                target,
                weight: f64_at(batch, "weight", row).unwrap_or(Relationship::DEFAULT_WEIGHT),
                description: utf8_at(batch, "description", row),
                text_unit_ids: str_list_at(batch, "text_unit_ids", row),
                attributes: None,
            });
        }
    }
    Ok(relationships)
}

fn project_text_units(batches: &[RecordBatch]) -> Result<Vec<TextUnit>, AppError> {
    require_column(batches, "text_units", "id")?;
    require_column(batches, "text_units", "text")?;

    let mut units = Vec::new();
    for batch in batches {
        for row in 0..batch.num_rows() {
            let (Some(id), Some(text)) =
                (utf8_at(batch, "id", row), utf8_at(batch, "text", row))
            else {
                continue;
            };
            units.push(TextUnit {
                id,
                short_id: utf8_at(batch, "human_readable_id", row)
                    .or_else(|| Some(row.to_string())),
                text,
                n_tokens: i64_at(batch, "n_tokens", row),
                entity_ids: str_list_at(batch, "entity_ids", row),
                relationship_ids: str_list_at(batch, "relationship_ids", row),
                attributes: None,
            });
        }
    }
    Ok(units)
}

/// All covariates land in the `claims` class, the only class the claim
/// extraction pipeline produces. Detail columns become attributes.
fn project_covariates(
    batches: &[RecordBatch],
) -> Result<HashMap<String, Vec<Covariate>>, AppError> {
    require_column(batches, "covariates", "subject_id")?;

    let mut claims = Vec::new();
    for batch in batches {
        for row in 0..batch.num_rows() {
            let Some(subject_id) = utf8_at(batch, "subject_id", row) else {
                continue;
            };
            let mut attributes = HashMap::new();
            for column in COVARIATE_DETAIL_COLUMNS {
                if let Some(value) = utf8_at(batch, column, row) {
                    attributes.insert((*column).to_string(), Value::String(value));
                }
            }
            claims.push(Covariate {
                id: utf8_at(batch, "id", row).unwrap_or_else(|| row.to_string()),
                short_id: utf8_at(batch, "human_readable_id", row)
                    .or_else(|| Some(row.to_string())),
                subject_id,
                subject_type: utf8_at(batch, "subject_type", row)
                    .unwrap_or_else(|| "entity".to_string()),
                covariate_type: utf8_at(batch, "covariate_type", row)
                    .unwrap_or_else(|| "claim".to_string()),
                text_unit_ids: str_list_at(batch, "text_unit_ids", row),
                attributes: Some(attributes),
            });
        }
    }

    let mut covariates = HashMap::new();
    if !claims.is_empty() {
        covariates.insert("claims".to_string(), claims);
    }
    Ok(covariates)
}
