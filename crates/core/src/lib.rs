//! # Engram Core
//!
//! Domain types, traits, and error definitions for the Engram session
//! memory layer. This crate defines the model that all other crates
//! implement against.
//!
//! ## Design Philosophy
//!
//! Every external collaborator is defined as a trait here — storage,
//! embedding, reflection, token counting. Implementations live in their
//! respective crates. This enables:
//! - Swapping implementations via configuration
//! - Easy testing with mock/stub implementations
//! - Clean dependency graph (all crates depend inward on core)

pub mod config;
pub mod context;
pub mod episode;
pub mod error;
pub mod fact;
pub mod ids;
pub mod marker;
pub mod provider;
pub mod storage;
pub mod token;
pub mod turn;

// Re-export key types at crate root for ergonomics
pub use config::{
    CacheConfig, EngramConfig, EpisodeBoundaryConfig, RecallConfig, ReflectionConfig, RetryConfig,
};
pub use context::{ContextItem, SessionStats, SourceType};
pub use episode::{Episode, EpisodeStatus};
pub use error::{Error, ProviderError, ReflectionError, Result, StorageError};
pub use fact::{Fact, FactStatus};
pub use marker::{detect_markers, marker_boost, merge_markers, Marker};
pub use provider::{Embedder, FactProposal, ReflectionAction, Reflector, ReflectorOutput};
pub use storage::{
    EmbeddingKind, EmbeddingMetadata, StorageBackend, VectorFilter, VectorSearchResult,
};
pub use token::{HeuristicTokenCounter, TokenCounter};
pub use turn::{Role, Turn};
