//! Session facade — the single long-lived object owning a session's
//! memory state.
//!
//! One `MemorySession` instance = one session. Ingest calls are serialized
//! by the internal state lock; recall only reads and may run concurrently
//! with a pending reflection. Reflection runs on a background worker in
//! episode-close order; `close()` drains it.

use crate::episode_manager::EpisodeManager;
use crate::ingestion::IngestionPipeline;
use crate::recall::{RecallOptions, RecallPipeline};
use crate::reflection::{
    ReflectionRunner, ReflectionWorker, TraceCallback, TraceCallbackSlot,
};
use engram_core::config::EngramConfig;
use engram_core::context::{ContextItem, SessionStats};
use engram_core::episode::EpisodeStatus;
use engram_core::error::{Error, Result};
use engram_core::fact::FactStatus;
use engram_core::marker::Marker;
use engram_core::provider::{Embedder, Reflector};
use engram_core::storage::StorageBackend;
use engram_core::token::{HeuristicTokenCounter, TokenCounter};
use engram_core::turn::Role;
use engram_memory::CachedBackend;
use engram_providers::NullEmbedder;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Builder for [`MemorySession`].
pub struct MemorySessionBuilder {
    session_id: String,
    storage: Arc<dyn StorageBackend>,
    embedder: Option<Arc<dyn Embedder>>,
    reflector: Option<Arc<dyn Reflector>>,
    token_counter: Option<Arc<dyn TokenCounter>>,
    config: Option<EngramConfig>,
}

impl MemorySessionBuilder {
    pub fn embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn reflector(mut self, reflector: Arc<dyn Reflector>) -> Self {
        self.reflector = Some(reflector);
        self
    }

    pub fn token_counter(mut self, token_counter: Arc<dyn TokenCounter>) -> Self {
        self.token_counter = Some(token_counter);
        self
    }

    pub fn config(mut self, config: EngramConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Validate inputs and construct the session.
    ///
    /// Configuration problems surface here, not at first use.
    pub fn build(self) -> Result<MemorySession> {
        let session_id = validate_session_id(&self.session_id)?;
        let config = self.config.unwrap_or_default();
        config.validate()?;
        let config = Arc::new(config);

        let storage: Arc<dyn StorageBackend> = if config.cache.enabled {
            Arc::new(CachedBackend::new(self.storage, &config.cache))
        } else {
            self.storage
        };
        let embedder = self
            .embedder
            .unwrap_or_else(|| Arc::new(NullEmbedder::default()));
        let token_counter = self
            .token_counter
            .unwrap_or_else(|| Arc::new(HeuristicTokenCounter::default()));

        let ingestion = IngestionPipeline::new(
            &session_id,
            storage.clone(),
            embedder.clone(),
            token_counter.clone(),
            config.clone(),
        );
        let recall = RecallPipeline::new(
            &session_id,
            storage.clone(),
            embedder.clone(),
            config.clone(),
        );
        let episodes = EpisodeManager::new(
            &session_id,
            storage.clone(),
            config.episode_boundary.clone(),
        )?;

        Ok(MemorySession {
            session_id,
            storage,
            embedder,
            reflector: self.reflector,
            token_counter,
            config,
            ingestion,
            recall,
            state: Mutex::new(SessionState {
                episodes,
                reflection: None,
                initialized: false,
                closed: false,
            }),
            trace_callback: Arc::new(std::sync::RwLock::new(None)),
            reflections_executed: Arc::new(AtomicU64::new(0)),
        })
    }
}

struct SessionState {
    episodes: EpisodeManager,
    reflection: Option<ReflectionRunner>,
    initialized: bool,
    closed: bool,
}

impl SessionState {
    fn ensure_usable(&self) -> Result<()> {
        if !self.initialized {
            return Err(Error::validation(
                "session",
                "Session not initialized. Call initialize() first",
            ));
        }
        if self.closed {
            return Err(Error::validation("session", "Session has been closed"));
        }
        Ok(())
    }
}

/// Session-scoped memory for a conversational agent.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use engram_session::MemorySession;
/// # use engram_memory::InMemoryBackend;
/// # use engram_core::{Result, Role};
/// # async fn demo() -> Result<()> {
/// let session = MemorySession::builder("sess_1", Arc::new(InMemoryBackend::new())).build()?;
/// session.initialize().await?;
///
/// session.ingest(Role::User, "Let's pick a database.").await?;
/// session.ingest(Role::Assistant, "Decision: We'll use PostgreSQL.").await?;
///
/// let context = session.recall("What database?", Some(200)).await?;
/// for item in &context {
///     println!("[{:?}] {}", item.role, item.content);
/// }
/// # session.close().await
/// # }
/// ```
pub struct MemorySession {
    session_id: String,
    storage: Arc<dyn StorageBackend>,
    embedder: Arc<dyn Embedder>,
    reflector: Option<Arc<dyn Reflector>>,
    token_counter: Arc<dyn TokenCounter>,
    config: Arc<EngramConfig>,
    ingestion: IngestionPipeline,
    recall: RecallPipeline,
    state: Mutex<SessionState>,
    trace_callback: TraceCallbackSlot,
    reflections_executed: Arc<AtomicU64>,
}

impl std::fmt::Debug for MemorySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySession")
            .field("session_id", &self.session_id)
            .field("config", &self.config)
            .field("reflections_executed", &self.reflections_executed)
            .finish()
    }
}

impl MemorySession {
    /// Start building a session over the given storage backend.
    pub fn builder(
        session_id: impl Into<String>,
        storage: Arc<dyn StorageBackend>,
    ) -> MemorySessionBuilder {
        MemorySessionBuilder {
            session_id: session_id.into(),
            storage,
            embedder: None,
            reflector: None,
            token_counter: None,
            config: None,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The open episode's id, if the session is initialized.
    pub async fn current_episode_id(&self) -> Option<String> {
        let state = self.state.lock().await;
        state.episodes.current_episode_id().map(str::to_string)
    }

    /// Initialize storage and ensure an open episode exists. Idempotent.
    pub async fn initialize(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.initialized {
            return Ok(());
        }
        if state.closed {
            return Err(Error::validation("session", "Session has been closed"));
        }

        self.storage.initialize().await?;
        state.episodes.initialize().await?;

        if self.config.reflection.enabled {
            if let Some(reflector) = &self.reflector {
                let worker = ReflectionWorker::new(
                    &self.session_id,
                    self.storage.clone(),
                    self.embedder.clone(),
                    reflector.clone(),
                    self.token_counter.clone(),
                    self.config.clone(),
                    self.trace_callback.clone(),
                    self.reflections_executed.clone(),
                );
                state.reflection = Some(ReflectionRunner::spawn(worker));
            }
        }

        state.initialized = true;
        info!(session_id = %self.session_id, "Session initialized");
        Ok(())
    }

    /// Ingest a turn with no explicit markers or metadata.
    pub async fn ingest(&self, role: Role, content: &str) -> Result<String> {
        self.ingest_with(role, content, &[], None).await
    }

    /// Ingest a turn with explicit markers and metadata.
    pub async fn ingest_with(
        &self,
        role: Role,
        content: &str,
        markers: &[Marker],
        metadata: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<String> {
        let mut state = self.state.lock().await;
        state.ensure_usable()?;

        let report = self
            .ingestion
            .ingest(&mut state.episodes, role, content, markers, metadata)
            .await?;

        for episode_id in &report.closed_episodes {
            if let Some(runner) = &state.reflection {
                runner.enqueue(episode_id.clone());
            }
        }

        Ok(report.turn_id)
    }

    /// Recall relevant context for a query under a token budget.
    pub async fn recall(&self, query: &str, token_budget: Option<usize>) -> Result<Vec<ContextItem>> {
        self.recall_with(
            query,
            &RecallOptions {
                token_budget,
                ..Default::default()
            },
        )
        .await
    }

    /// Recall with full options.
    pub async fn recall_with(
        &self,
        query: &str,
        options: &RecallOptions,
    ) -> Result<Vec<ContextItem>> {
        // Only the current-episode id needs the state lock; the gather and
        // packing run unlocked so recall can overlap a pending reflection.
        let current_episode_id = {
            let state = self.state.lock().await;
            state.ensure_usable()?;
            state.episodes.current_episode_id().map(str::to_string)
        };

        self.recall
            .recall(current_episode_id.as_deref(), query, options)
            .await
    }

    /// Force-close the open episode and trigger reflection.
    ///
    /// Returns the closed episode id, or `None` when the open episode has
    /// no turns (nothing worth closing).
    pub async fn close_episode(&self, reason: &str) -> Result<Option<String>> {
        let mut state = self.state.lock().await;
        state.ensure_usable()?;
        Self::close_current_locked(&mut state, reason).await
    }

    async fn close_current_locked(
        state: &mut SessionState,
        reason: &str,
    ) -> Result<Option<String>> {
        let has_turns = state
            .episodes
            .current_episode()
            .map(|e| e.turn_count > 0)
            .unwrap_or(false);
        if !has_turns {
            debug!("Skipping close of empty episode");
            return Ok(None);
        }

        let closed = state.episodes.close_current(reason).await?;
        if let (Some(episode_id), Some(runner)) = (&closed, &state.reflection) {
            runner.enqueue(episode_id.clone());
        }
        Ok(closed)
    }

    /// Install (or clear) the reflection trace sink.
    pub fn set_trace_callback(&self, callback: Option<TraceCallback>) {
        *self.trace_callback.write().unwrap() = callback;
    }

    /// Counts describing the session's memory state.
    pub async fn get_session_stats(&self) -> Result<SessionStats> {
        {
            let state = self.state.lock().await;
            state.ensure_usable()?;
        }

        let turns = self
            .storage
            .get_turns_by_session(&self.session_id, usize::MAX)
            .await?;
        let episodes = self
            .storage
            .get_episodes(&self.session_id, None, usize::MAX)
            .await?;
        let active_facts = self
            .storage
            .get_facts_by_session(&self.session_id, Some(FactStatus::Active))
            .await?;
        let superseded_facts = self
            .storage
            .get_facts_by_session(&self.session_id, Some(FactStatus::Superseded))
            .await?;

        let open_episodes = episodes
            .iter()
            .filter(|e| e.status == EpisodeStatus::Open)
            .count();

        Ok(SessionStats {
            session_id: self.session_id.clone(),
            total_turns: turns.len(),
            open_episodes,
            closed_episodes: episodes.len() - open_episodes,
            active_facts: active_facts.len(),
            superseded_facts: superseded_facts.len(),
            total_tokens_ingested: turns.iter().map(|t| t.token_count).sum(),
            reflections_executed: self.reflections_executed.load(Ordering::Relaxed),
        })
    }

    /// Close the session: close the open episode, drain pending
    /// reflections, and release storage. Safe to call multiple times.
    pub async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(());
        }

        if state.initialized {
            Self::close_current_locked(&mut state, "session_close").await?;

            if let Some(mut runner) = state.reflection.take() {
                runner.shutdown().await;
            }

            self.storage.close().await?;
        }

        state.closed = true;
        info!(session_id = %self.session_id, "Session closed");
        Ok(())
    }
}

fn validate_session_id(session_id: &str) -> Result<String> {
    let trimmed = session_id.trim();
    if trimmed.is_empty() {
        return Err(Error::validation("session_id", "Session ID cannot be empty"));
    }
    if !trimmed
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(Error::validation(
            "session_id",
            "Session ID must be alphanumeric with hyphens/underscores only",
        ));
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use engram_memory::InMemoryBackend;

    fn storage() -> Arc<InMemoryBackend> {
        Arc::new(InMemoryBackend::new())
    }

    #[test]
    fn session_id_validation() {
        assert!(validate_session_id("sess-1_ok").is_ok());
        assert!(validate_session_id("  padded  ").is_err());
        assert!(validate_session_id("").is_err());
        assert!(validate_session_id("has space").is_err());
        assert!(validate_session_id("emoji😀").is_err());
    }

    #[test]
    fn invalid_config_fails_at_build() {
        let mut config = EngramConfig::default();
        config.recall.current_episode_budget_pct = 2.0;
        let err = MemorySession::builder("s1", storage())
            .config(config)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[tokio::test]
    async fn operations_require_initialize() {
        let session = MemorySession::builder("s1", storage()).build().unwrap();
        let err = session.ingest(Role::User, "hello").await.unwrap_err();
        assert!(err.to_string().contains("not initialized"));
    }

    #[tokio::test]
    async fn initialize_is_idempotent() {
        let session = MemorySession::builder("s1", storage()).build().unwrap();
        session.initialize().await.unwrap();
        let first = session.current_episode_id().await.unwrap();
        session.initialize().await.unwrap();
        assert_eq!(session.current_episode_id().await.unwrap(), first);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_blocks_further_use() {
        let session = MemorySession::builder("s1", storage()).build().unwrap();
        session.initialize().await.unwrap();
        session.close().await.unwrap();
        session.close().await.unwrap();

        let err = session.ingest(Role::User, "too late").await.unwrap_err();
        assert!(err.to_string().contains("closed"));
    }

    #[tokio::test]
    async fn close_episode_on_empty_episode_returns_none() {
        let session = MemorySession::builder("s1", storage()).build().unwrap();
        session.initialize().await.unwrap();
        assert_eq!(session.close_episode("manual").await.unwrap(), None);
    }

    #[tokio::test]
    async fn stats_count_turns_and_tokens() {
        let session = MemorySession::builder("s1", storage()).build().unwrap();
        session.initialize().await.unwrap();

        session.ingest(Role::User, "12345678").await.unwrap(); // 2 tokens
        session.ingest(Role::Assistant, "1234").await.unwrap(); // 1 token

        let stats = session.get_session_stats().await.unwrap();
        assert_eq!(stats.total_turns, 2);
        assert_eq!(stats.total_tokens_ingested, 3);
        assert_eq!(stats.open_episodes, 1);
        assert_eq!(stats.active_facts, 0);
    }
}
