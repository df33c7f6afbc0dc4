//! Turn ingestion pipeline.
//!
//! Each ingest runs: validate → marker detection → token count → episode
//! assignment → persist turn → embed → persist embedding. Persistence
//! failures for the turn surface to the caller; a failed embedding is
//! logged and swallowed (the turn stays reachable through the
//! current-episode and marker paths, it just won't appear in vector
//! search).

use crate::episode_manager::EpisodeManager;
use chrono::Utc;
use engram_core::config::EngramConfig;
use engram_core::error::{Error, Result};
use engram_core::ids;
use engram_core::marker::{detect_markers, merge_markers, Marker};
use engram_core::provider::Embedder;
use engram_core::storage::{EmbeddingKind, EmbeddingMetadata, StorageBackend};
use engram_core::token::TokenCounter;
use engram_core::turn::{Role, Turn};
use engram_providers::retry::with_retry;
use std::sync::Arc;
use tracing::{debug, warn};

/// What an ingest produced: the new turn plus any episodes its assignment
/// closed (reflection triggers).
#[derive(Debug, Clone)]
pub struct IngestReport {
    pub turn_id: String,
    pub closed_episodes: Vec<String>,
}

/// Pipeline for ingesting turns into session memory.
pub struct IngestionPipeline {
    session_id: String,
    storage: Arc<dyn StorageBackend>,
    embedder: Arc<dyn Embedder>,
    token_counter: Arc<dyn TokenCounter>,
    config: Arc<EngramConfig>,
}

impl IngestionPipeline {
    pub fn new(
        session_id: impl Into<String>,
        storage: Arc<dyn StorageBackend>,
        embedder: Arc<dyn Embedder>,
        token_counter: Arc<dyn TokenCounter>,
        config: Arc<EngramConfig>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            storage,
            embedder,
            token_counter,
            config,
        }
    }

    /// Ingest one turn. Returns the turn id and any closed episodes.
    pub async fn ingest(
        &self,
        episodes: &mut EpisodeManager,
        role: Role,
        content: &str,
        explicit_markers: &[Marker],
        metadata: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<IngestReport> {
        let content = validate_content(content, self.config.max_content_length)?;
        validate_markers(explicit_markers)?;

        let markers = if self.config.auto_detect_markers {
            merge_markers(explicit_markers, detect_markers(&content))
        } else {
            merge_markers(explicit_markers, Vec::new())
        };

        let token_count = self.token_counter.count(&content);

        let mut turn = Turn {
            id: ids::turn_id(),
            session_id: self.session_id.clone(),
            episode_id: String::new(),
            role,
            content,
            created_at: Utc::now(),
            markers,
            metadata: metadata.unwrap_or_default(),
            token_count,
            embedding_id: None,
            position: 0,
        };

        // Episode assignment may close the current episode and open a new one.
        let outcome = episodes.assign(&mut turn).await?;

        // Persist the turn before embedding so an embedding failure can
        // never lose the turn.
        self.storage.save_turn(turn.clone()).await?;

        if let Some(embedding_id) = self.embed_turn(&turn).await? {
            turn.embedding_id = Some(embedding_id);
            self.storage.save_turn(turn.clone()).await?;
        }

        debug!(
            turn_id = %turn.id,
            episode_id = %turn.episode_id,
            role = %turn.role,
            token_count,
            markers = turn.markers.len(),
            "Turn ingested"
        );

        Ok(IngestReport {
            turn_id: turn.id,
            closed_episodes: outcome.closed_episodes,
        })
    }

    /// Embed a turn and persist the vector. Provider failures (after
    /// retries) are swallowed; storage failures surface.
    async fn embed_turn(&self, turn: &Turn) -> Result<Option<String>> {
        let texts = [turn.content.clone()];
        let vectors = match with_retry("embed_turn", &self.config.retry, || {
            self.embedder.embed(&texts)
        })
        .await
        {
            Ok(vectors) => vectors,
            Err(e) => {
                warn!(turn_id = %turn.id, error = %e, "Embedding failed; turn stored without vector");
                return Ok(None);
            }
        };

        let Some(vector) = vectors.into_iter().next() else {
            return Ok(None);
        };

        self.storage
            .save_embedding(
                &turn.id,
                vector,
                EmbeddingMetadata {
                    session_id: turn.session_id.clone(),
                    kind: EmbeddingKind::Turn,
                    source_id: turn.id.clone(),
                    episode_id: Some(turn.episode_id.clone()),
                    has_markers: turn.is_marked(),
                },
            )
            .await?;

        Ok(Some(turn.id.clone()))
    }
}

/// Validate and normalize turn content.
pub fn validate_content(content: &str, max_length: usize) -> Result<String> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(Error::validation("content", "Content cannot be empty"));
    }
    if trimmed.chars().count() > max_length {
        return Err(Error::validation(
            "content",
            format!("Content exceeds maximum length of {max_length}"),
        ));
    }
    Ok(trimmed.to_string())
}

/// Validate a marker list (custom labels must be non-empty).
pub fn validate_markers(markers: &[Marker]) -> Result<()> {
    for marker in markers {
        if let Marker::Custom(label) = marker {
            if label.is_empty() {
                return Err(Error::validation(
                    "markers",
                    "Custom marker must have a name after 'custom:'",
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use engram_core::config::EpisodeBoundaryConfig;
    use engram_core::storage::VectorFilter;
    use engram_core::token::HeuristicTokenCounter;
    use engram_memory::InMemoryBackend;
    use engram_providers::NullEmbedder;

    struct Fixture {
        pipeline: IngestionPipeline,
        episodes: EpisodeManager,
        storage: Arc<InMemoryBackend>,
    }

    async fn fixture(config: EngramConfig) -> Fixture {
        let storage = Arc::new(InMemoryBackend::new());
        let config = Arc::new(config);
        let mut episodes = EpisodeManager::new(
            "s1",
            storage.clone(),
            config.episode_boundary.clone(),
        )
        .unwrap();
        episodes.initialize().await.unwrap();

        let pipeline = IngestionPipeline::new(
            "s1",
            storage.clone(),
            Arc::new(NullEmbedder::new(4)),
            Arc::new(HeuristicTokenCounter::default()),
            config,
        );
        Fixture {
            pipeline,
            episodes,
            storage,
        }
    }

    fn quiet_config() -> EngramConfig {
        let mut config = EngramConfig::default();
        config.episode_boundary.close_on_patterns = vec![];
        config
    }

    #[tokio::test]
    async fn ingest_persists_turn_and_embedding() {
        let mut fx = fixture(quiet_config()).await;
        let report = fx
            .pipeline
            .ingest(&mut fx.episodes, Role::User, "Let's pick a database.", &[], None)
            .await
            .unwrap();

        let turn = fx.storage.get_turn(&report.turn_id).await.unwrap().unwrap();
        assert_eq!(turn.content, "Let's pick a database.");
        assert_eq!(turn.role, Role::User);
        assert_eq!(turn.token_count, 6); // 22 chars / 4, rounded up
        assert_eq!(turn.embedding_id.as_deref(), Some(report.turn_id.as_str()));

        let embedding = fx.storage.get_embedding(&report.turn_id).await.unwrap();
        assert!(embedding.is_some());
    }

    #[tokio::test]
    async fn auto_detection_adds_markers() {
        let mut fx = fixture(quiet_config()).await;
        let report = fx
            .pipeline
            .ingest(
                &mut fx.episodes,
                Role::Assistant,
                "Decision: We'll use PostgreSQL.",
                &[],
                None,
            )
            .await
            .unwrap();

        let turn = fx.storage.get_turn(&report.turn_id).await.unwrap().unwrap();
        assert_eq!(turn.markers, vec![Marker::Decision]);
    }

    #[tokio::test]
    async fn auto_detection_can_be_disabled() {
        let mut config = quiet_config();
        config.auto_detect_markers = false;
        let mut fx = fixture(config).await;

        let report = fx
            .pipeline
            .ingest(
                &mut fx.episodes,
                Role::Assistant,
                "Decision: We'll use PostgreSQL.",
                &[],
                None,
            )
            .await
            .unwrap();

        let turn = fx.storage.get_turn(&report.turn_id).await.unwrap().unwrap();
        assert!(turn.markers.is_empty());
    }

    #[tokio::test]
    async fn explicit_markers_merge_with_detected() {
        let mut fx = fixture(quiet_config()).await;
        let report = fx
            .pipeline
            .ingest(
                &mut fx.episodes,
                Role::User,
                "Decision: ship on Friday",
                &[Marker::Custom("release".into())],
                None,
            )
            .await
            .unwrap();

        let turn = fx.storage.get_turn(&report.turn_id).await.unwrap().unwrap();
        assert_eq!(
            turn.markers,
            vec![Marker::Custom("release".into()), Marker::Decision]
        );
    }

    #[tokio::test]
    async fn empty_content_is_rejected() {
        let mut fx = fixture(quiet_config()).await;
        let err = fx
            .pipeline
            .ingest(&mut fx.episodes, Role::User, "   ", &[], None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { field: Some("content"), .. }));
    }

    #[tokio::test]
    async fn oversized_content_is_rejected() {
        let mut config = quiet_config();
        config.max_content_length = 10;
        let mut fx = fixture(config).await;
        let err = fx
            .pipeline
            .ingest(&mut fx.episodes, Role::User, "this is definitely too long", &[], None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[tokio::test]
    async fn empty_custom_marker_is_rejected() {
        let mut fx = fixture(quiet_config()).await;
        let err = fx
            .pipeline
            .ingest(
                &mut fx.episodes,
                Role::User,
                "hello",
                &[Marker::Custom(String::new())],
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { field: Some("markers"), .. }));
    }

    #[tokio::test]
    async fn embedding_metadata_supports_unmarked_filter() {
        let mut fx = fixture(quiet_config()).await;
        fx.pipeline
            .ingest(&mut fx.episodes, Role::User, "plain turn", &[], None)
            .await
            .unwrap();
        fx.pipeline
            .ingest(
                &mut fx.episodes,
                Role::Assistant,
                "Decision: marked turn",
                &[],
                None,
            )
            .await
            .unwrap();

        let filter = VectorFilter {
            session_id: Some("s1".into()),
            kind: Some(EmbeddingKind::Turn),
            has_markers: Some(false),
        };
        let results = fx
            .storage
            .vector_search(&[0.0, 0.0, 0.0, 0.0], 10, &filter)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert!(!results[0].metadata.has_markers);
    }

    #[tokio::test]
    async fn max_turns_close_is_reported() {
        let mut config = quiet_config();
        config.episode_boundary.max_turns = 2;
        let mut fx = fixture(config).await;

        let first = fx
            .pipeline
            .ingest(&mut fx.episodes, Role::User, "one", &[], None)
            .await
            .unwrap();
        assert!(first.closed_episodes.is_empty());

        let second = fx
            .pipeline
            .ingest(&mut fx.episodes, Role::Assistant, "two", &[], None)
            .await
            .unwrap();
        assert_eq!(second.closed_episodes.len(), 1);
    }
}
