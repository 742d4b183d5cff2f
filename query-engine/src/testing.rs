//! Mock clients and small graph fixtures shared by the engine tests (and,
//! behind the `test-utils` feature, by dependent crates' tests).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use common::error::AppError;
use common::utils::tokens::TokenCounter;
use futures::stream;
use graph_store::{
    CommunityReport, Covariate, Entity, GraphArtifacts, InMemoryVectorStore, Relationship,
    TextUnit,
};

use crate::context::{
    EntityStoreKey, GlobalContextBuilder, LocalContextBuilder,
};
use crate::llm::{
    ChatChunk, ChatLlm, ChatMessage, ChatOptions, ChatResponse, ChatStream, TextEmbedder, Usage,
};

/// Scripted chat client: pops canned responses in call order, optionally
/// failing the first call, and records the messages of the last call.
pub struct MockChatLlm {
    model: String,
    responses: Mutex<VecDeque<String>>,
    repeating: Option<String>,
    fail_first: AtomicBool,
    calls: AtomicUsize,
    last: Mutex<Vec<ChatMessage>>,
}

impl MockChatLlm {
    pub fn new(responses: Vec<&str>) -> Self {
        Self {
            model: "mock-model".to_string(),
            responses: Mutex::new(responses.into_iter().map(str::to_string).collect()),
            repeating: None,
            fail_first: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
            last: Mutex::new(Vec::new()),
        }
    }

    /// Returns the same response for every call.
    pub fn repeating(response: &str) -> Self {
        Self {
            repeating: Some(response.to_string()),
            ..Self::new(Vec::new())
        }
    }

    /// Fails the first call with an upstream error, then pops `responses`.
    pub fn failing_then(responses: Vec<&str>) -> Self {
        let mock = Self::new(responses);
        mock.fail_first.store(true, Ordering::SeqCst);
        mock
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Messages of the most recent call.
    pub fn last_messages(&self) -> Vec<ChatMessage> {
        self.last.lock().map(|last| last.clone()).unwrap_or_default()
    }

    fn next_response(&self, messages: Vec<ChatMessage>) -> Result<String, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut last) = self.last.lock() {
            *last = messages;
        }
        if self.fail_first.swap(false, Ordering::SeqCst) {
            return Err(AppError::UpstreamChat("mock upstream failure".to_string()));
        }
        if let Some(repeating) = &self.repeating {
            return Ok(repeating.clone());
        }
        Ok(self
            .responses
            .lock()
            .ok()
            .and_then(|mut responses| responses.pop_front())
            .unwrap_or_else(|| "mock response".to_string()))
    }
}

#[async_trait]
impl ChatLlm for MockChatLlm {
    fn model(&self) -> &str {
        &self.model
    }

    async fn chat(
        &self,
        messages: Vec<ChatMessage>,
        _options: &ChatOptions,
    ) -> Result<ChatResponse, AppError> {
        let content = self.next_response(messages)?;
        Ok(ChatResponse {
            content: Some(content),
            refusal: None,
            finish_reason: Some("stop".to_string()),
            system_fingerprint: None,
            usage: Some(Usage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            }),
        })
    }

    async fn chat_stream(
        &self,
        messages: Vec<ChatMessage>,
        _options: &ChatOptions,
    ) -> Result<ChatStream, AppError> {
        let content = self.next_response(messages)?;
        let chars: Vec<char> = content.chars().collect();
        let mid = chars.len() / 2;
        let first: String = chars.iter().take(mid).collect();
        let second: String = chars.iter().skip(mid).collect();
        let chunks = vec![
            Ok(ChatChunk {
                content: Some(first),
                ..ChatChunk::default()
            }),
            Ok(ChatChunk {
                content: Some(second),
                ..ChatChunk::default()
            }),
            Ok(ChatChunk {
                finish_reason: Some("stop".to_string()),
                ..ChatChunk::default()
            }),
        ];
        Ok(Box::pin(stream::iter(chunks)))
    }
}

/// Embedder returning a fixed vector for every input.
pub struct MockEmbedder {
    pub vector: Vec<f32>,
}

impl MockEmbedder {
    pub fn new(vector: Vec<f32>) -> Self {
        Self { vector }
    }
}

#[async_trait]
impl TextEmbedder for MockEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, AppError> {
        Ok(self.vector.clone())
    }
}

fn entity(
    id: &str,
    title: &str,
    rank: i64,
    community: &str,
    embedding: Vec<f32>,
    text_unit_ids: &[&str],
) -> Entity {
    Entity {
        id: id.to_string(),
        short_id: Some(id.to_string()),
        title: title.to_string(),
        entity_type: Some("organization".to_string()),
        description: Some(format!("{title} is a well described entity")),
        description_embedding: Some(embedding),
        community_ids: Some(vec![community.to_string()]),
        text_unit_ids: if text_unit_ids.is_empty() {
            None
        } else {
            Some(text_unit_ids.iter().map(|id| (*id).to_string()).collect())
        },
        rank,
        ..Entity::default()
    }
}

fn report(id: &str, community: &str, title: &str, rank: f64) -> CommunityReport {
    CommunityReport {
        id: id.to_string(),
        short_id: Some(id.to_string()),
        community_id: community.to_string(),
        title: title.to_string(),
        summary: format!("{title} summary"),
        full_content: format!("{title} full content"),
        rank,
        attributes: None,
    }
}

/// A small three-entity graph with reports, relationships, covariates and
/// text units, shaped for the context builder tests.
pub fn sample_artifacts() -> GraphArtifacts {
    let entities = vec![
        entity("e1", "Alpha", 5, "1", vec![1.0, 0.0], &["u1", "u2"]),
        entity("e2", "Beta", 3, "1", vec![0.9, 0.1], &["u2", "u3"]),
        entity("e3", "Gamma", 1, "2", vec![0.0, 1.0], &["u3"]),
    ];
    let relationships = vec![
        Relationship {
            id: "rel1".to_string(),
            short_id: Some("rel1".to_string()),
            source: "Alpha".to_string(),
            target: "Beta".to_string(),
            weight: 2.0,
            description: Some("Alpha works with Beta".to_string()),
            text_unit_ids: Some(vec!["u2".to_string()]),
            ..Relationship::default()
        },
        Relationship {
            id: "rel2".to_string(),
            short_id: Some("rel2".to_string()),
            source: "Alpha".to_string(),
            target: "Gamma".to_string(),
            weight: 1.0,
            description: Some("Alpha mentions Gamma".to_string()),
            text_unit_ids: Some(vec!["u1".to_string()]),
            ..Relationship::default()
        },
        Relationship {
            id: "rel3".to_string(),
            short_id: Some("rel3".to_string()),
            source: "Beta".to_string(),
            target: "Outside".to_string(),
            weight: 1.0,
            description: Some("Beta links outward".to_string()),
            text_unit_ids: None,
            ..Relationship::default()
        },
    ];
    let covariates = HashMap::from([(
        "claims".to_string(),
        vec![Covariate {
            id: "c1".to_string(),
            short_id: Some("c1".to_string()),
            subject_id: "Alpha".to_string(),
            subject_type: "entity".to_string(),
            covariate_type: "claim".to_string(),
            text_unit_ids: Some(vec!["u1".to_string()]),
            attributes: Some(HashMap::from([(
                "description".to_string(),
                serde_json::Value::String("Alpha made an announcement".to_string()),
            )])),
        }],
    )]);
    let text_units = vec![
        TextUnit {
            id: "u1".to_string(),
            short_id: Some("u1".to_string()),
            text: "Alpha announced a partnership".to_string(),
            ..TextUnit::default()
        },
        TextUnit {
            id: "u2".to_string(),
            short_id: Some("u2".to_string()),
            text: "Alpha and Beta collaborate closely".to_string(),
            ..TextUnit::default()
        },
        TextUnit {
            id: "u3".to_string(),
            short_id: Some("u3".to_string()),
            text: "Beta and Gamma share an office".to_string(),
            ..TextUnit::default()
        },
    ];
    let community_reports = vec![
        report("r1", "1", "Alpha-Beta community", 7.0),
        report("r2", "2", "Gamma community", 9.0),
    ];

    GraphArtifacts {
        entities,
        relationships,
        covariates,
        text_units,
        community_reports,
    }
}

/// Local context builder over [`sample_artifacts`] with an in-memory store
/// and a fixed-vector embedder biased towards Alpha.
pub fn local_builder_with_mocks() -> LocalContextBuilder {
    LocalContextBuilder::new(
        Arc::new(sample_artifacts()),
        Arc::new(InMemoryVectorStore::new()),
        Arc::new(MockEmbedder::new(vec![1.0, 0.0])),
        TokenCounter::new("cl100k_base").expect("tokenizer"),
        EntityStoreKey::Id,
    )
    .expect("local context builder")
}

/// Global context builder over `count` generated community reports whose
/// rows land at roughly fifteen tokens, so batch splits are predictable.
pub fn global_builder_with_reports(count: usize) -> GlobalContextBuilder {
    let community_reports = (0..count)
        .map(|i| CommunityReport {
            id: format!("r{i}"),
            short_id: Some(i.to_string()),
            community_id: i.to_string(),
            title: format!("Community {i}"),
            summary: "covers a small cluster of closely related entities".to_string(),
            full_content: "full report body".to_string(),
            rank: i as f64,
            attributes: None,
        })
        .collect();
    let artifacts = GraphArtifacts {
        community_reports,
        ..GraphArtifacts::default()
    };
    GlobalContextBuilder::new(
        Arc::new(artifacts),
        TokenCounter::new("cl100k_base").expect("tokenizer"),
    )
}
