//! Knowledge layer: the durable cause store and its read-through cache.

pub mod cache;
pub mod store;

pub use cache::{CacheSnapshot, KnowledgeCache};
pub use store::{InMemoryStore, KnowledgeStore, LocalFileStore};
