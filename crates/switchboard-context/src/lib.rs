//! Three-tier context management for Switchboard.
//!
//! - **Working context**: compiled per invocation by
//!   [`ContextManager::compile_working_context`] under a hard token ceiling.
//! - **Session history**: per-conversation turns in a [`SessionStore`],
//!   kept until explicitly cleared.
//! - **Long-term memory**: tenant-partitioned facts in a [`MemoryStore`],
//!   retrieved by cosine similarity.

/// Text embeddings for memory search.
pub mod embedding;
/// Working-context compilation.
pub mod manager;
/// Long-term memory stores.
pub mod memory;
/// Session history stores.
pub mod session;
/// Token counting.
pub mod tokens;

pub use embedding::{cosine_similarity, EmbeddingProvider, LocalEmbedding};
pub use manager::{task_text, ContextManager, SectionBudgets};
pub use memory::{FileMemoryStore, InMemoryMemoryStore, MemoryEntry, MemoryStore, ScoredMemory};
pub use session::{FileSessionStore, InMemorySessionStore, SessionStore};
pub use tokens::TokenCounter;
