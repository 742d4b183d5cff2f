use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A named graph entity with its description embedding and community
/// memberships. `rank` is the entity's degree in the graph.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub short_id: Option<String>,
    pub title: String,
    #[serde(rename = "type")]
    pub entity_type: Option<String>,
    pub description: Option<String>,
    pub description_embedding: Option<Vec<f32>>,
    pub graph_embedding: Option<Vec<f32>>,
    pub community_ids: Option<Vec<String>>,
    pub text_unit_ids: Option<Vec<String>>,
    pub rank: i64,
    pub attributes: Option<HashMap<String, Value>>,
}

/// A directed edge between two entities, addressed by entity titles.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Relationship {
    pub id: String,
    pub short_id: Option<String>,
    pub source: String,
    pub target: String,
    pub weight: f64,
    pub description: Option<String>,
    pub text_unit_ids: Option<Vec<String>>,
    pub attributes: Option<HashMap<String, Value>>,
}

impl Relationship {
    /// Default edge weight when the table does not carry one.
    pub const DEFAULT_WEIGHT: f64 = 1.0;
}

/// An auxiliary factual claim attached to an entity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Covariate {
    pub id: String,
    pub short_id: Option<String>,
    pub subject_id: String,
    pub subject_type: String,
    pub covariate_type: String,
    pub text_unit_ids: Option<Vec<String>>,
    pub attributes: Option<HashMap<String, Value>>,
}

/// A chunk of source text referenced by entities and relationships.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TextUnit {
    pub id: String,
    pub short_id: Option<String>,
    pub text: String,
    pub n_tokens: Option<i64>,
    pub entity_ids: Option<Vec<String>>,
    pub relationship_ids: Option<Vec<String>>,
    pub attributes: Option<HashMap<String, Value>>,
}

/// The LLM-written report summarizing one community of entities.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommunityReport {
    pub id: String,
    pub short_id: Option<String>,
    pub community_id: String,
    pub title: String,
    pub summary: String,
    pub full_content: String,
    pub rank: f64,
    pub attributes: Option<HashMap<String, Value>>,
}
