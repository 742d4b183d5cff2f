pub mod community;
pub mod global_builder;
pub mod local;
pub mod local_builder;
pub mod source;
pub mod table;

pub use global_builder::{GlobalContextBuilder, GlobalContextParams};
pub use local_builder::{EntityStoreKey, LocalContextBuilder, LocalContextParams};
pub use table::{ContextSections, ContextTable};
