//! Write-through LRU cache layer in front of a storage backend.
//!
//! The cache is non-authoritative: reads check it before storage, writes
//! update both. Capacities are independent per entity kind. Fact
//! supersession invalidates both the superseded fact and the session's
//! active-facts entry.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use engram_core::config::CacheConfig;
use engram_core::episode::{Episode, EpisodeStatus};
use engram_core::error::StorageError;
use engram_core::fact::{Fact, FactStatus};
use engram_core::storage::{
    EmbeddingMetadata, StorageBackend, VectorFilter, VectorSearchResult,
};
use engram_core::turn::Turn;
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct CacheEntry<V> {
    value: V,
    created_at: Instant,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, ttl: Option<Duration>) -> bool {
        match ttl {
            Some(ttl) => self.created_at.elapsed() > ttl,
            None => false,
        }
    }
}

/// A bounded LRU cache with optional TTL and hit/miss statistics.
///
/// Not internally synchronized; callers wrap it in a lock.
pub struct LruCache<K, V> {
    max_size: usize,
    ttl: Option<Duration>,
    map: HashMap<K, CacheEntry<V>>,
    // Front = least recently used.
    order: VecDeque<K>,
    hits: u64,
    misses: u64,
}

impl<K: Eq + Hash + Clone, V: Clone> LruCache<K, V> {
    pub fn new(max_size: usize, ttl: Option<Duration>) -> Self {
        Self {
            max_size,
            ttl,
            map: HashMap::new(),
            order: VecDeque::new(),
            hits: 0,
            misses: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    /// Hit rate in [0, 1]; 0 when the cache has never been read.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    fn touch(&mut self, key: &K) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
        self.order.push_back(key.clone());
    }

    pub fn get(&mut self, key: &K) -> Option<V> {
        let expired = match self.map.get(key) {
            None => {
                self.misses += 1;
                return None;
            }
            Some(entry) => entry.is_expired(self.ttl),
        };

        if expired {
            self.map.remove(key);
            if let Some(pos) = self.order.iter().position(|k| k == key) {
                self.order.remove(pos);
            }
            self.misses += 1;
            return None;
        }

        let value = self.map.get(key).map(|entry| entry.value.clone());
        self.touch(key);
        self.hits += 1;
        value
    }

    pub fn put(&mut self, key: K, value: V) {
        if self.max_size == 0 {
            return;
        }

        if self.map.contains_key(&key) {
            self.map.insert(
                key.clone(),
                CacheEntry {
                    value,
                    created_at: Instant::now(),
                },
            );
            self.touch(&key);
            return;
        }

        while self.map.len() >= self.max_size {
            match self.order.pop_front() {
                Some(evicted) => {
                    self.map.remove(&evicted);
                }
                None => break,
            }
        }

        self.map.insert(
            key.clone(),
            CacheEntry {
                value,
                created_at: Instant::now(),
            },
        );
        self.order.push_back(key);
    }

    pub fn remove(&mut self, key: &K) -> bool {
        if self.map.remove(key).is_some() {
            if let Some(pos) = self.order.iter().position(|k| k == key) {
                self.order.remove(pos);
            }
            true
        } else {
            false
        }
    }

    pub fn clear(&mut self) {
        self.map.clear();
        self.order.clear();
    }
}

/// Hit/miss statistics for one cached entity kind.
#[derive(Debug, Clone, Copy)]
pub struct CacheStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
}

/// Write-through cache wrapper around a storage backend.
///
/// Caches turns, episodes, embeddings, and facts by id, plus the per-session
/// marked-turn and active-fact lists. List reads that miss fall through to
/// the inner backend and repopulate.
pub struct CachedBackend {
    inner: Arc<dyn StorageBackend>,
    turns: Mutex<LruCache<String, Turn>>,
    episodes: Mutex<LruCache<String, Episode>>,
    embeddings: Mutex<LruCache<String, Vec<f32>>>,
    facts: Mutex<LruCache<String, Fact>>,
    // session_id -> all marked turns of the session, chronological.
    marked_turns: Mutex<LruCache<String, Vec<Turn>>>,
    // session_id -> active fact ids, creation order.
    active_facts: Mutex<LruCache<String, Vec<String>>>,
}

impl CachedBackend {
    pub fn new(inner: Arc<dyn StorageBackend>, config: &CacheConfig) -> Self {
        let ttl = config.ttl_seconds.map(Duration::from_secs);
        Self {
            inner,
            turns: Mutex::new(LruCache::new(config.max_turns, ttl)),
            episodes: Mutex::new(LruCache::new(config.max_episodes, ttl)),
            embeddings: Mutex::new(LruCache::new(config.max_embeddings, ttl)),
            facts: Mutex::new(LruCache::new(config.max_facts, ttl)),
            marked_turns: Mutex::new(LruCache::new(config.max_episodes.max(16), ttl)),
            active_facts: Mutex::new(LruCache::new(config.max_episodes.max(16), ttl)),
        }
    }

    /// Statistics for the per-turn cache (representative of cache health).
    pub fn turn_stats(&self) -> CacheStats {
        let cache = self.turns.lock().unwrap();
        CacheStats {
            size: cache.len(),
            hits: cache.hits(),
            misses: cache.misses(),
        }
    }
}

#[async_trait]
impl StorageBackend for CachedBackend {
    fn name(&self) -> &str {
        "cached"
    }

    async fn initialize(&self) -> Result<(), StorageError> {
        self.inner.initialize().await
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.inner.close().await
    }

    // --- Turns ---

    async fn save_turn(&self, turn: Turn) -> Result<(), StorageError> {
        self.inner.save_turn(turn.clone()).await?;
        if turn.is_marked() {
            self.marked_turns.lock().unwrap().remove(&turn.session_id);
        }
        self.turns.lock().unwrap().put(turn.id.clone(), turn);
        Ok(())
    }

    async fn get_turn(&self, turn_id: &str) -> Result<Option<Turn>, StorageError> {
        if let Some(turn) = self.turns.lock().unwrap().get(&turn_id.to_string()) {
            return Ok(Some(turn));
        }
        let turn = self.inner.get_turn(turn_id).await?;
        if let Some(turn) = &turn {
            self.turns
                .lock()
                .unwrap()
                .put(turn.id.clone(), turn.clone());
        }
        Ok(turn)
    }

    async fn get_turns_by_episode(&self, episode_id: &str) -> Result<Vec<Turn>, StorageError> {
        let turns = self.inner.get_turns_by_episode(episode_id).await?;
        let mut cache = self.turns.lock().unwrap();
        for turn in &turns {
            cache.put(turn.id.clone(), turn.clone());
        }
        Ok(turns)
    }

    async fn get_turns_by_session(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<Turn>, StorageError> {
        self.inner.get_turns_by_session(session_id, limit).await
    }

    async fn get_marked_turns(
        &self,
        session_id: &str,
        exclude_episode_id: Option<&str>,
    ) -> Result<Vec<Turn>, StorageError> {
        let cached = self
            .marked_turns
            .lock()
            .unwrap()
            .get(&session_id.to_string());
        let all_marked = match cached {
            Some(turns) => turns,
            None => {
                let turns = self.inner.get_marked_turns(session_id, None).await?;
                self.marked_turns
                    .lock()
                    .unwrap()
                    .put(session_id.to_string(), turns.clone());
                turns
            }
        };

        Ok(match exclude_episode_id {
            Some(ep) => all_marked
                .into_iter()
                .filter(|t| t.episode_id != ep)
                .collect(),
            None => all_marked,
        })
    }

    // --- Episodes ---

    async fn save_episode(&self, episode: Episode) -> Result<(), StorageError> {
        self.inner.save_episode(episode.clone()).await?;
        self.episodes
            .lock()
            .unwrap()
            .put(episode.id.clone(), episode);
        Ok(())
    }

    async fn update_episode(&self, episode: Episode) -> Result<(), StorageError> {
        self.inner.update_episode(episode.clone()).await?;
        self.episodes
            .lock()
            .unwrap()
            .put(episode.id.clone(), episode);
        Ok(())
    }

    async fn get_episode(&self, episode_id: &str) -> Result<Option<Episode>, StorageError> {
        if let Some(episode) = self.episodes.lock().unwrap().get(&episode_id.to_string()) {
            return Ok(Some(episode));
        }
        let episode = self.inner.get_episode(episode_id).await?;
        if let Some(episode) = &episode {
            self.episodes
                .lock()
                .unwrap()
                .put(episode.id.clone(), episode.clone());
        }
        Ok(episode)
    }

    async fn get_episodes(
        &self,
        session_id: &str,
        status: Option<EpisodeStatus>,
        limit: usize,
    ) -> Result<Vec<Episode>, StorageError> {
        self.inner.get_episodes(session_id, status, limit).await
    }

    // --- Facts ---

    async fn save_fact(&self, fact: Fact) -> Result<(), StorageError> {
        self.inner.save_fact(fact.clone()).await?;
        self.active_facts.lock().unwrap().remove(&fact.session_id);
        self.facts.lock().unwrap().put(fact.id.clone(), fact);
        Ok(())
    }

    async fn get_facts_by_session(
        &self,
        session_id: &str,
        status: Option<FactStatus>,
    ) -> Result<Vec<Fact>, StorageError> {
        // Only the active-facts list is cached; it's the hot path in recall.
        if status == Some(FactStatus::Active) {
            let cached_ids = self
                .active_facts
                .lock()
                .unwrap()
                .get(&session_id.to_string());
            if let Some(ids) = cached_ids {
                let mut facts = Vec::with_capacity(ids.len());
                let mut cache = self.facts.lock().unwrap();
                let mut complete = true;
                for id in &ids {
                    match cache.get(id) {
                        Some(fact) => facts.push(fact),
                        None => {
                            complete = false;
                            break;
                        }
                    }
                }
                if complete {
                    return Ok(facts);
                }
            }

            let facts = self
                .inner
                .get_facts_by_session(session_id, Some(FactStatus::Active))
                .await?;
            let ids: Vec<String> = facts.iter().map(|f| f.id.clone()).collect();
            {
                let mut cache = self.facts.lock().unwrap();
                for fact in &facts {
                    cache.put(fact.id.clone(), fact.clone());
                }
            }
            self.active_facts
                .lock()
                .unwrap()
                .put(session_id.to_string(), ids);
            return Ok(facts);
        }

        self.inner.get_facts_by_session(session_id, status).await
    }

    async fn get_facts_by_episode(&self, episode_id: &str) -> Result<Vec<Fact>, StorageError> {
        self.inner.get_facts_by_episode(episode_id).await
    }

    async fn update_fact_supersession(
        &self,
        target_id: &str,
        superseded_by: Option<&str>,
        superseded_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.inner
            .update_fact_supersession(target_id, superseded_by, superseded_at)
            .await?;

        // The superseded fact leaves the active set; drop the stale copies.
        let session_id = {
            let mut cache = self.facts.lock().unwrap();
            let session_id = cache
                .get(&target_id.to_string())
                .map(|f| f.session_id.clone());
            cache.remove(&target_id.to_string());
            session_id
        };
        match session_id {
            Some(session_id) => {
                self.active_facts.lock().unwrap().remove(&session_id);
            }
            None => self.active_facts.lock().unwrap().clear(),
        }
        Ok(())
    }

    // --- Embeddings ---

    async fn save_embedding(
        &self,
        id: &str,
        vector: Vec<f32>,
        metadata: EmbeddingMetadata,
    ) -> Result<(), StorageError> {
        self.inner
            .save_embedding(id, vector.clone(), metadata)
            .await?;
        self.embeddings.lock().unwrap().put(id.to_string(), vector);
        Ok(())
    }

    async fn get_embedding(&self, id: &str) -> Result<Option<Vec<f32>>, StorageError> {
        if let Some(vector) = self.embeddings.lock().unwrap().get(&id.to_string()) {
            return Ok(Some(vector));
        }
        let vector = self.inner.get_embedding(id).await?;
        if let Some(vector) = &vector {
            self.embeddings
                .lock()
                .unwrap()
                .put(id.to_string(), vector.clone());
        }
        Ok(vector)
    }

    async fn vector_search(
        &self,
        vector: &[f32],
        k: usize,
        filter: &VectorFilter,
    ) -> Result<Vec<VectorSearchResult>, StorageError> {
        self.inner.vector_search(vector, k, filter).await
    }
}
