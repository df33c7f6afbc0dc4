//! In-memory backend — the reference implementation, useful for testing
//! and ephemeral sessions.
//!
//! All collections live behind a single `RwLock`, so every read sees a
//! coherent point-in-time view. Vector search is brute-force cosine over
//! the stored embeddings.

use crate::vector::cosine_similarity;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use engram_core::episode::{Episode, EpisodeStatus};
use engram_core::error::StorageError;
use engram_core::fact::{Fact, FactStatus};
use engram_core::storage::{
    EmbeddingMetadata, StorageBackend, VectorFilter, VectorSearchResult,
};
use engram_core::turn::Turn;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Default)]
struct Store {
    turns: HashMap<String, Turn>,
    episodes: HashMap<String, Episode>,
    facts: HashMap<String, Fact>,
    embeddings: HashMap<String, (Vec<f32>, EmbeddingMetadata)>,
}

/// An in-memory storage backend keeping everything in hash maps.
/// Data is lost when the process exits.
pub struct InMemoryBackend {
    store: Arc<RwLock<Store>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self {
            store: Arc::new(RwLock::new(Store::default())),
        }
    }

    /// Drop all stored data (for tests).
    pub async fn clear(&self) {
        let mut store = self.store.write().await;
        store.turns.clear();
        store.episodes.clear();
        store.facts.clear();
        store.embeddings.clear();
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageBackend for InMemoryBackend {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn initialize(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }

    // --- Turns ---

    async fn save_turn(&self, turn: Turn) -> Result<(), StorageError> {
        self.store.write().await.turns.insert(turn.id.clone(), turn);
        Ok(())
    }

    async fn get_turn(&self, turn_id: &str) -> Result<Option<Turn>, StorageError> {
        Ok(self.store.read().await.turns.get(turn_id).cloned())
    }

    async fn get_turns_by_episode(&self, episode_id: &str) -> Result<Vec<Turn>, StorageError> {
        let store = self.store.read().await;
        let mut turns: Vec<Turn> = store
            .turns
            .values()
            .filter(|t| t.episode_id == episode_id)
            .cloned()
            .collect();
        turns.sort_by_key(|t| (t.position, t.created_at));
        Ok(turns)
    }

    async fn get_turns_by_session(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<Turn>, StorageError> {
        let store = self.store.read().await;
        let mut turns: Vec<Turn> = store
            .turns
            .values()
            .filter(|t| t.session_id == session_id)
            .cloned()
            .collect();
        turns.sort_by_key(|t| t.created_at);
        turns.truncate(limit);
        Ok(turns)
    }

    async fn get_marked_turns(
        &self,
        session_id: &str,
        exclude_episode_id: Option<&str>,
    ) -> Result<Vec<Turn>, StorageError> {
        let store = self.store.read().await;
        let mut turns: Vec<Turn> = store
            .turns
            .values()
            .filter(|t| {
                t.session_id == session_id
                    && t.is_marked()
                    && exclude_episode_id.map_or(true, |ep| t.episode_id != ep)
            })
            .cloned()
            .collect();
        turns.sort_by_key(|t| t.created_at);
        Ok(turns)
    }

    // --- Episodes ---

    async fn save_episode(&self, episode: Episode) -> Result<(), StorageError> {
        self.store
            .write()
            .await
            .episodes
            .insert(episode.id.clone(), episode);
        Ok(())
    }

    async fn update_episode(&self, episode: Episode) -> Result<(), StorageError> {
        let mut store = self.store.write().await;
        if !store.episodes.contains_key(&episode.id) {
            return Err(StorageError::NotFound(episode.id.clone()));
        }
        store.episodes.insert(episode.id.clone(), episode);
        Ok(())
    }

    async fn get_episode(&self, episode_id: &str) -> Result<Option<Episode>, StorageError> {
        Ok(self.store.read().await.episodes.get(episode_id).cloned())
    }

    async fn get_episodes(
        &self,
        session_id: &str,
        status: Option<EpisodeStatus>,
        limit: usize,
    ) -> Result<Vec<Episode>, StorageError> {
        let store = self.store.read().await;
        let mut episodes: Vec<Episode> = store
            .episodes
            .values()
            .filter(|e| e.session_id == session_id && status.map_or(true, |s| e.status == s))
            .cloned()
            .collect();
        episodes.sort_by_key(|e| e.opened_at);
        episodes.truncate(limit);
        Ok(episodes)
    }

    // --- Facts ---

    async fn save_fact(&self, fact: Fact) -> Result<(), StorageError> {
        self.store.write().await.facts.insert(fact.id.clone(), fact);
        Ok(())
    }

    async fn get_facts_by_session(
        &self,
        session_id: &str,
        status: Option<FactStatus>,
    ) -> Result<Vec<Fact>, StorageError> {
        let store = self.store.read().await;
        let mut facts: Vec<Fact> = store
            .facts
            .values()
            .filter(|f| f.session_id == session_id && status.map_or(true, |s| f.status == s))
            .cloned()
            .collect();
        facts.sort_by_key(|f| f.created_at);
        Ok(facts)
    }

    async fn get_facts_by_episode(&self, episode_id: &str) -> Result<Vec<Fact>, StorageError> {
        let store = self.store.read().await;
        let mut facts: Vec<Fact> = store
            .facts
            .values()
            .filter(|f| f.source_episode_ids.iter().any(|id| id == episode_id))
            .cloned()
            .collect();
        facts.sort_by_key(|f| f.created_at);
        Ok(facts)
    }

    async fn update_fact_supersession(
        &self,
        target_id: &str,
        superseded_by: Option<&str>,
        superseded_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let mut store = self.store.write().await;
        let fact = store
            .facts
            .get_mut(target_id)
            .ok_or_else(|| StorageError::NotFound(target_id.to_string()))?;

        // Compare-and-set: a fact can only be superseded once.
        if fact.status == FactStatus::Superseded {
            return Err(StorageError::Conflict(format!(
                "fact {target_id} is already superseded"
            )));
        }

        fact.status = FactStatus::Superseded;
        fact.superseded_by = superseded_by.map(str::to_string);
        fact.superseded_at = Some(superseded_at);
        Ok(())
    }

    // --- Embeddings ---

    async fn save_embedding(
        &self,
        id: &str,
        vector: Vec<f32>,
        metadata: EmbeddingMetadata,
    ) -> Result<(), StorageError> {
        self.store
            .write()
            .await
            .embeddings
            .insert(id.to_string(), (vector, metadata));
        Ok(())
    }

    async fn get_embedding(&self, id: &str) -> Result<Option<Vec<f32>>, StorageError> {
        Ok(self
            .store
            .read()
            .await
            .embeddings
            .get(id)
            .map(|(v, _)| v.clone()))
    }

    async fn vector_search(
        &self,
        vector: &[f32],
        k: usize,
        filter: &VectorFilter,
    ) -> Result<Vec<VectorSearchResult>, StorageError> {
        let store = self.store.read().await;
        let mut results: Vec<VectorSearchResult> = store
            .embeddings
            .iter()
            .filter(|(_, (_, metadata))| filter.matches(metadata))
            .map(|(id, (emb, metadata))| VectorSearchResult {
                id: id.clone(),
                score: cosine_similarity(vector, emb),
                metadata: metadata.clone(),
            })
            .collect();

        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        results.truncate(k);
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engram_core::marker::Marker;
    use engram_core::storage::EmbeddingKind;

    fn test_turn(id: &str, session: &str, episode: &str, markers: Vec<Marker>) -> Turn {
        Turn {
            id: id.into(),
            session_id: session.into(),
            episode_id: episode.into(),
            role: engram_core::Role::User,
            content: format!("content of {id}"),
            created_at: Utc::now(),
            markers,
            metadata: serde_json::Map::new(),
            token_count: 4,
            embedding_id: None,
            position: 0,
        }
    }

    fn turn_metadata(session: &str, source: &str, has_markers: bool) -> EmbeddingMetadata {
        EmbeddingMetadata {
            session_id: session.into(),
            kind: EmbeddingKind::Turn,
            source_id: source.into(),
            episode_id: Some("ep_1".into()),
            has_markers,
        }
    }

    #[tokio::test]
    async fn save_and_get_turn() {
        let backend = InMemoryBackend::new();
        backend
            .save_turn(test_turn("turn_1", "s1", "ep_1", vec![]))
            .await
            .unwrap();

        let turn = backend.get_turn("turn_1").await.unwrap();
        assert!(turn.is_some());
        assert_eq!(turn.unwrap().content, "content of turn_1");
        assert!(backend.get_turn("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn turns_by_episode_ordered_by_position() {
        let backend = InMemoryBackend::new();
        for (id, pos) in [("turn_b", 1), ("turn_a", 0), ("turn_c", 2)] {
            let mut turn = test_turn(id, "s1", "ep_1", vec![]);
            turn.position = pos;
            backend.save_turn(turn).await.unwrap();
        }

        let turns = backend.get_turns_by_episode("ep_1").await.unwrap();
        let ids: Vec<&str> = turns.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["turn_a", "turn_b", "turn_c"]);
    }

    #[tokio::test]
    async fn marked_turns_excludes_episode() {
        let backend = InMemoryBackend::new();
        backend
            .save_turn(test_turn("turn_1", "s1", "ep_1", vec![Marker::Decision]))
            .await
            .unwrap();
        backend
            .save_turn(test_turn("turn_2", "s1", "ep_2", vec![Marker::Goal]))
            .await
            .unwrap();
        backend
            .save_turn(test_turn("turn_3", "s1", "ep_2", vec![]))
            .await
            .unwrap();

        let marked = backend.get_marked_turns("s1", Some("ep_2")).await.unwrap();
        assert_eq!(marked.len(), 1);
        assert_eq!(marked[0].id, "turn_1");

        let all_marked = backend.get_marked_turns("s1", None).await.unwrap();
        assert_eq!(all_marked.len(), 2);
    }

    #[tokio::test]
    async fn episodes_filter_by_status() {
        let backend = InMemoryBackend::new();
        let open = Episode::open("s1");
        let mut closed = Episode::open("s1");
        closed.close("max_turns");
        backend.save_episode(open.clone()).await.unwrap();
        backend.save_episode(closed).await.unwrap();

        let open_eps = backend
            .get_episodes("s1", Some(EpisodeStatus::Open), 100)
            .await
            .unwrap();
        assert_eq!(open_eps.len(), 1);
        assert_eq!(open_eps[0].id, open.id);

        let all = backend.get_episodes("s1", None, 100).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn update_episode_requires_existing() {
        let backend = InMemoryBackend::new();
        let episode = Episode::open("s1");
        let err = backend.update_episode(episode.clone()).await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));

        backend.save_episode(episode.clone()).await.unwrap();
        let mut updated = episode;
        updated.turn_count = 3;
        backend.update_episode(updated.clone()).await.unwrap();
        let fetched = backend.get_episode(&updated.id).await.unwrap().unwrap();
        assert_eq!(fetched.turn_count, 3);
    }

    #[tokio::test]
    async fn supersession_is_compare_and_set() {
        let backend = InMemoryBackend::new();
        let fact = Fact::new("s1", "ep_1", "use PostgreSQL", vec![Marker::Decision]);
        let fact_id = fact.id.clone();
        backend.save_fact(fact).await.unwrap();

        backend
            .update_fact_supersession(&fact_id, Some("fact_new"), Utc::now())
            .await
            .unwrap();

        let facts = backend.get_facts_by_session("s1", None).await.unwrap();
        assert_eq!(facts[0].status, FactStatus::Superseded);
        assert_eq!(facts[0].superseded_by.as_deref(), Some("fact_new"));
        assert!(facts[0].superseded_at.is_some());

        // Second supersession of the same fact must fail.
        let err = backend
            .update_fact_supersession(&fact_id, Some("fact_other"), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));

        // Unknown target.
        let err = backend
            .update_fact_supersession("missing", None, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn facts_filter_by_status() {
        let backend = InMemoryBackend::new();
        let active = Fact::new("s1", "ep_1", "fact a", vec![]);
        let other = Fact::new("s1", "ep_1", "fact b", vec![]);
        let other_id = other.id.clone();
        backend.save_fact(active).await.unwrap();
        backend.save_fact(other).await.unwrap();
        backend
            .update_fact_supersession(&other_id, None, Utc::now())
            .await
            .unwrap();

        let active_facts = backend
            .get_facts_by_session("s1", Some(FactStatus::Active))
            .await
            .unwrap();
        assert_eq!(active_facts.len(), 1);
        assert_eq!(active_facts[0].content, "fact a");

        let superseded = backend
            .get_facts_by_session("s1", Some(FactStatus::Superseded))
            .await
            .unwrap();
        assert_eq!(superseded.len(), 1);
    }

    #[tokio::test]
    async fn vector_search_respects_filters_and_order() {
        let backend = InMemoryBackend::new();
        backend
            .save_embedding("emb_1", vec![1.0, 0.0], turn_metadata("s1", "turn_1", false))
            .await
            .unwrap();
        backend
            .save_embedding("emb_2", vec![0.5, 0.5], turn_metadata("s1", "turn_2", false))
            .await
            .unwrap();
        backend
            .save_embedding("emb_3", vec![1.0, 0.0], turn_metadata("s1", "turn_3", true))
            .await
            .unwrap();
        backend
            .save_embedding("emb_4", vec![1.0, 0.0], turn_metadata("s2", "turn_4", false))
            .await
            .unwrap();

        let filter = VectorFilter {
            session_id: Some("s1".into()),
            kind: Some(EmbeddingKind::Turn),
            has_markers: Some(false),
        };
        let results = backend
            .vector_search(&[1.0, 0.0], 10, &filter)
            .await
            .unwrap();

        // Marked and cross-session embeddings are excluded.
        let ids: Vec<&str> = results.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["emb_1", "emb_2"]);
        assert!(results[0].score > results[1].score);
    }

    #[tokio::test]
    async fn vector_search_truncates_to_k() {
        let backend = InMemoryBackend::new();
        for i in 0..20 {
            backend
                .save_embedding(
                    &format!("emb_{i}"),
                    vec![1.0, i as f32 * 0.05],
                    turn_metadata("s1", &format!("turn_{i}"), false),
                )
                .await
                .unwrap();
        }
        let results = backend
            .vector_search(&[1.0, 0.0], 5, &VectorFilter::default())
            .await
            .unwrap();
        assert_eq!(results.len(), 5);
    }
}
