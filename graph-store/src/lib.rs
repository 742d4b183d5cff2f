pub mod model;
pub mod project;
pub mod tables;
pub mod vector;

pub use model::{Covariate, CommunityReport, Entity, Relationship, TextUnit};
pub use project::GraphArtifacts;
pub use tables::{GraphTables, TableNames};
pub use vector::{InMemoryVectorStore, VectorDocument, VectorSearchHit, VectorStore};
