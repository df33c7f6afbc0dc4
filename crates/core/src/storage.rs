//! Storage backend trait — persistence for turns, episodes, facts, and
//! embeddings, with metadata-filtered vector search.
//!
//! The backend is the single source of truth. Implementations must be
//! internally thread-safe and give each read call a coherent point-in-time
//! view. Fact supersession is a compare-and-set on the fact's status so
//! concurrent supersessions lose cleanly instead of clobbering each other.

use crate::episode::{Episode, EpisodeStatus};
use crate::error::StorageError;
use crate::fact::{Fact, FactStatus};
use crate::turn::Turn;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What kind of entity an embedding belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingKind {
    Turn,
    Fact,
}

/// Metadata stored alongside an embedding, used for search filtering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingMetadata {
    /// Owning session
    pub session_id: String,

    /// Turn or fact embedding
    pub kind: EmbeddingKind,

    /// ID of the source turn or fact
    pub source_id: String,

    /// Episode the source belongs to (turns) or was distilled from (facts)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub episode_id: Option<String>,

    /// Whether the source carries markers
    #[serde(default)]
    pub has_markers: bool,
}

/// Metadata filter for [`StorageBackend::vector_search`].
///
/// `None` fields match everything; set fields are equality constraints.
#[derive(Debug, Clone, Default)]
pub struct VectorFilter {
    pub session_id: Option<String>,
    pub kind: Option<EmbeddingKind>,
    pub has_markers: Option<bool>,
}

impl VectorFilter {
    /// Whether the given metadata satisfies this filter.
    pub fn matches(&self, metadata: &EmbeddingMetadata) -> bool {
        if let Some(session_id) = &self.session_id {
            if metadata.session_id != *session_id {
                return false;
            }
        }
        if let Some(kind) = self.kind {
            if metadata.kind != kind {
                return false;
            }
        }
        if let Some(has_markers) = self.has_markers {
            if metadata.has_markers != has_markers {
                return false;
            }
        }
        true
    }
}

/// A single vector search hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorSearchResult {
    /// Embedding ID
    pub id: String,

    /// Cosine similarity to the query vector
    pub score: f32,

    /// Metadata stored with the embedding
    pub metadata: EmbeddingMetadata,
}

/// The core storage trait.
///
/// Implementations: in-memory (reference/testing), plus whatever a
/// deployment plugs in behind the same operations.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// The backend name (e.g. "in_memory").
    fn name(&self) -> &str;

    /// Initialize storage (create tables, indexes, ...). Idempotent.
    async fn initialize(&self) -> Result<(), StorageError>;

    /// Flush buffers and release resources.
    async fn close(&self) -> Result<(), StorageError>;

    // --- Turns ---

    async fn save_turn(&self, turn: Turn) -> Result<(), StorageError>;

    async fn get_turn(&self, turn_id: &str) -> Result<Option<Turn>, StorageError>;

    /// All turns of an episode in chronological order.
    async fn get_turns_by_episode(&self, episode_id: &str) -> Result<Vec<Turn>, StorageError>;

    /// All turns of a session in chronological order, up to `limit`.
    async fn get_turns_by_session(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<Turn>, StorageError>;

    /// All marked turns of a session, optionally excluding one episode
    /// (typically the current one), in chronological order.
    async fn get_marked_turns(
        &self,
        session_id: &str,
        exclude_episode_id: Option<&str>,
    ) -> Result<Vec<Turn>, StorageError>;

    // --- Episodes ---

    async fn save_episode(&self, episode: Episode) -> Result<(), StorageError>;

    async fn update_episode(&self, episode: Episode) -> Result<(), StorageError>;

    async fn get_episode(&self, episode_id: &str) -> Result<Option<Episode>, StorageError>;

    /// Episodes of a session in chronological order, optionally filtered by
    /// status, up to `limit`.
    async fn get_episodes(
        &self,
        session_id: &str,
        status: Option<EpisodeStatus>,
        limit: usize,
    ) -> Result<Vec<Episode>, StorageError>;

    // --- Facts ---

    async fn save_fact(&self, fact: Fact) -> Result<(), StorageError>;

    /// Facts of a session in creation order, optionally filtered by status.
    async fn get_facts_by_session(
        &self,
        session_id: &str,
        status: Option<FactStatus>,
    ) -> Result<Vec<Fact>, StorageError>;

    /// Facts distilled from a specific episode.
    async fn get_facts_by_episode(&self, episode_id: &str) -> Result<Vec<Fact>, StorageError>;

    /// Atomically mark a fact superseded.
    ///
    /// Compare-and-set on the fact's status: fails with
    /// [`StorageError::Conflict`] if the target is already superseded and
    /// [`StorageError::NotFound`] if it doesn't exist.
    async fn update_fact_supersession(
        &self,
        target_id: &str,
        superseded_by: Option<&str>,
        superseded_at: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    // --- Embeddings ---

    async fn save_embedding(
        &self,
        id: &str,
        vector: Vec<f32>,
        metadata: EmbeddingMetadata,
    ) -> Result<(), StorageError>;

    async fn get_embedding(&self, id: &str) -> Result<Option<Vec<f32>>, StorageError>;

    /// K-nearest-neighbor search, descending by similarity, honoring the
    /// metadata filter.
    async fn vector_search(
        &self,
        vector: &[f32],
        k: usize,
        filter: &VectorFilter,
    ) -> Result<Vec<VectorSearchResult>, StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(session: &str, kind: EmbeddingKind, has_markers: bool) -> EmbeddingMetadata {
        EmbeddingMetadata {
            session_id: session.into(),
            kind,
            source_id: "turn_1".into(),
            episode_id: Some("ep_1".into()),
            has_markers,
        }
    }

    #[test]
    fn empty_filter_matches_everything() {
        let filter = VectorFilter::default();
        assert!(filter.matches(&metadata("s1", EmbeddingKind::Turn, true)));
        assert!(filter.matches(&metadata("s2", EmbeddingKind::Fact, false)));
    }

    #[test]
    fn filter_constrains_session_kind_and_markers() {
        let filter = VectorFilter {
            session_id: Some("s1".into()),
            kind: Some(EmbeddingKind::Turn),
            has_markers: Some(false),
        };
        assert!(filter.matches(&metadata("s1", EmbeddingKind::Turn, false)));
        assert!(!filter.matches(&metadata("s2", EmbeddingKind::Turn, false)));
        assert!(!filter.matches(&metadata("s1", EmbeddingKind::Fact, false)));
        assert!(!filter.matches(&metadata("s1", EmbeddingKind::Turn, true)));
    }
}
