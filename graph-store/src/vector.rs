use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// A stored embedding with its source text and display attributes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VectorDocument {
    pub id: String,
    pub text: Option<String>,
    pub vector: Option<Vec<f32>>,
    pub attributes: HashMap<String, Value>,
}

#[derive(Debug, Clone)]
pub struct VectorSearchHit {
    pub document: VectorDocument,
    pub score: f32,
}

/// The minimal store contract the engines consume. Searching by text is
/// composed at the call site (embed, then `search_by_vector`), keeping the
/// store itself synchronous.
pub trait VectorStore: Send + Sync {
    /// Bulk-loads documents; `overwrite` clears existing content first.
    /// Documents without a vector are skipped.
    fn load(&self, documents: Vec<VectorDocument>, overwrite: bool);

    /// Nearest neighbours of `query`, best first. Scores are
    /// `1 - |distance|`, so higher means more similar.
    fn search_by_vector(&self, query: &[f32], k: usize) -> Vec<VectorSearchHit>;

    /// Installs a disjunctive id filter applied to subsequent searches; an
    /// empty slice clears it.
    fn filter_by_id(&self, ids: &[String]);
}

/// Exact-scan in-memory store over cosine distance. Entity description sets
/// are small enough that a linear scan beats maintaining an index.
#[derive(Default)]
pub struct InMemoryVectorStore {
    documents: RwLock<HashMap<String, VectorDocument>>,
    id_filter: RwLock<Option<HashSet<String>>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.documents.read().map(|docs| docs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
        let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
        let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm_a == 0.0 || norm_b == 0.0 {
            return 1.0;
        }
        1.0 - dot / (norm_a * norm_b)
    }
}

impl VectorStore for InMemoryVectorStore {
    fn load(&self, documents: Vec<VectorDocument>, overwrite: bool) {
        let Ok(mut store) = self.documents.write() else {
            return;
        };
        if overwrite {
            store.clear();
        }
        let mut loaded = 0usize;
        for document in documents {
            if document.vector.is_none() {
                continue;
            }
            store.insert(document.id.clone(), document);
            loaded += 1;
        }
        debug!(loaded, total = store.len(), "Loaded vector documents");
    }

    fn search_by_vector(&self, query: &[f32], k: usize) -> Vec<VectorSearchHit> {
        if k == 0 || query.is_empty() {
            return Vec::new();
        }
        let filter = self
            .id_filter
            .read()
            .ok()
            .and_then(|guard| guard.clone());
        let Ok(store) = self.documents.read() else {
            return Vec::new();
        };

        let mut hits: Vec<VectorSearchHit> = store
            .values()
            .filter(|document| {
                filter
                    .as_ref()
                    .is_none_or(|ids| ids.contains(&document.id))
            })
            .filter_map(|document| {
                let vector = document.vector.as_ref()?;
                let distance = Self::cosine_distance(query, vector);
                Some(VectorSearchHit {
                    document: document.clone(),
                    score: 1.0 - distance.abs(),
                })
            })
            .collect();

        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(k);
        hits
    }

    fn filter_by_id(&self, ids: &[String]) {
        if let Ok(mut filter) = self.id_filter.write() {
            *filter = if ids.is_empty() {
                None
            } else {
                Some(ids.iter().cloned().collect())
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str, vector: Vec<f32>) -> VectorDocument {
        VectorDocument {
            id: id.to_string(),
            text: Some(format!("text for {id}")),
            vector: Some(vector),
            attributes: HashMap::new(),
        }
    }

    fn store_with_docs() -> InMemoryVectorStore {
        let store = InMemoryVectorStore::new();
        store.load(
            vec![
                doc("a", vec![1.0, 0.0]),
                doc("b", vec![0.9, 0.1]),
                doc("c", vec![0.0, 1.0]),
            ],
            true,
        );
        store
    }

    #[test]
    fn test_search_orders_by_similarity() {
        let store = store_with_docs();
        let hits = store.search_by_vector(&[1.0, 0.0], 2);
        let ids: Vec<&str> = hits.iter().map(|h| h.document.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(hits[0].score > hits[1].score);
        assert!((hits[0].score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_id_filter_restricts_and_clears() {
        let store = store_with_docs();
        store.filter_by_id(&["c".to_string()]);
        let hits = store.search_by_vector(&[1.0, 0.0], 3);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document.id, "c");

        store.filter_by_id(&[]);
        assert_eq!(store.search_by_vector(&[1.0, 0.0], 3).len(), 3);
    }

    #[test]
    fn test_documents_without_vectors_are_skipped() {
        let store = InMemoryVectorStore::new();
        store.load(
            vec![
                VectorDocument {
                    id: "empty".to_string(),
                    ..VectorDocument::default()
                },
                doc("a", vec![1.0]),
            ],
            true,
        );
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_overwrite_replaces_content() {
        let store = store_with_docs();
        store.load(vec![doc("z", vec![1.0, 1.0])], true);
        assert_eq!(store.len(), 1);
        store.load(vec![doc("y", vec![0.5, 0.5])], false);
        assert_eq!(store.len(), 2);
    }
}
