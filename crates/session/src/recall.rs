//! Context recall pipeline.
//!
//! Recall gathers candidates from four sources — the current episode,
//! marked past turns, active facts, and vector search over unmarked past
//! turns — scores the past sources by `relevance + marker_boost`, and packs
//! priority-ordered under the token budget. The budget is a hard ceiling:
//! an item that doesn't fit is skipped whole, never truncated.

use engram_core::config::EngramConfig;
use engram_core::context::{ContextItem, SourceType};
use engram_core::error::{Error, Result};
use engram_core::fact::FactStatus;
use engram_core::marker::{marker_boost, Marker};
use engram_core::provider::Embedder;
use engram_core::storage::{EmbeddingKind, StorageBackend, VectorFilter};
use engram_core::turn::{Role, Turn};
use engram_providers::retry::with_retry;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

// Relevance assigned when no embedding is available to compare against.
const FALLBACK_RELEVANCE: f32 = 0.5;
// Sentinel relevance for current-episode turns, which are not scored.
const CURRENT_EPISODE_RELEVANCE: f32 = 1.0;

/// Options for a recall query.
#[derive(Debug, Clone)]
pub struct RecallOptions {
    /// Maximum total tokens in the result; defaults to the configured budget.
    pub token_budget: Option<usize>,
    /// Whether current-episode turns are included.
    pub include_current_episode: bool,
    /// Minimum relevance (cosine similarity, before marker boost) for past
    /// items to qualify.
    pub min_relevance: f32,
}

impl Default for RecallOptions {
    fn default() -> Self {
        Self {
            token_budget: None,
            include_current_episode: true,
            min_relevance: 0.0,
        }
    }
}

struct Candidate {
    id: String,
    content: String,
    role: Option<Role>,
    source: SourceType,
    relevance: f32,
    boost: f32,
    token_count: usize,
    markers: Vec<Marker>,
}

impl Candidate {
    fn final_score(&self) -> f32 {
        self.relevance + self.boost
    }

    fn into_item(self) -> ContextItem {
        let score = self.final_score();
        ContextItem {
            source_id: self.id,
            content: self.content,
            role: self.role,
            markers: self.markers,
            score,
            token_count: self.token_count,
            source_type: self.source,
        }
    }
}

/// Pipeline answering "what prior turns/facts are relevant to this query?".
pub struct RecallPipeline {
    session_id: String,
    storage: Arc<dyn StorageBackend>,
    embedder: Arc<dyn Embedder>,
    config: Arc<EngramConfig>,
}

impl RecallPipeline {
    pub fn new(
        session_id: impl Into<String>,
        storage: Arc<dyn StorageBackend>,
        embedder: Arc<dyn Embedder>,
        config: Arc<EngramConfig>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            storage,
            embedder,
            config,
        }
    }

    /// Run a recall query against the session's memory.
    ///
    /// `current_episode_id` is the open episode at the time of the call;
    /// recall never fails outright — losing the embedding merely degrades
    /// to the non-vector sources.
    pub async fn recall(
        &self,
        current_episode_id: Option<&str>,
        query: &str,
        options: &RecallOptions,
    ) -> Result<Vec<ContextItem>> {
        if query.trim().is_empty() {
            return Err(Error::validation("query", "Query cannot be empty"));
        }
        if !(0.0..=1.0).contains(&options.min_relevance) {
            return Err(Error::validation(
                "min_relevance",
                format!(
                    "Relevance threshold must be between 0 and 1, got {}",
                    options.min_relevance
                ),
            ));
        }
        let token_budget = match options.token_budget {
            Some(0) => {
                return Err(Error::validation("token_budget", "Token budget must be positive"))
            }
            Some(budget) => budget,
            None => self.config.recall.default_token_budget,
        };

        // Step 1: embed the query; degrade to the non-vector path on failure.
        let query_embedding = self.embed_query(query).await;

        // Step 2: gather candidates from the four sources.
        let current = if options.include_current_episode {
            self.current_episode_candidates(current_episode_id).await?
        } else {
            Vec::new()
        };
        let marked = self
            .marked_candidates(current_episode_id, query_embedding.as_deref(), options.min_relevance)
            .await?;
        let facts = self
            .fact_candidates(query_embedding.as_deref(), options.min_relevance)
            .await?;
        let vectors = self
            .vector_candidates(query_embedding.as_deref(), options.min_relevance)
            .await?;

        // Step 3: dedup — a turn reachable from several sources is taken once.
        let mut seen: HashSet<String> = current.iter().map(|c| c.id.clone()).collect();
        seen.extend(marked.iter().map(|c| c.id.clone()));
        let vectors: Vec<Candidate> = vectors
            .into_iter()
            .filter(|c| !seen.contains(&c.id))
            .collect();

        // Step 4: pack under budget, priority-ordered.
        let items = self.pack(token_budget, current, marked, facts, vectors);

        debug!(
            session_id = %self.session_id,
            budget = token_budget,
            items = items.len(),
            total_tokens = items.iter().map(|i| i.token_count).sum::<usize>(),
            "Recall assembled"
        );
        Ok(items)
    }

    async fn embed_query(&self, query: &str) -> Option<Vec<f32>> {
        let texts = [query.to_string()];
        match with_retry("embed_query", &self.config.retry, || {
            self.embedder.embed(&texts)
        })
        .await
        {
            Ok(vectors) => vectors.into_iter().next(),
            Err(e) => {
                warn!(error = %e, "Query embedding failed; recall degrades to non-vector sources");
                None
            }
        }
    }

    async fn current_episode_candidates(
        &self,
        current_episode_id: Option<&str>,
    ) -> Result<Vec<Candidate>> {
        let Some(episode_id) = current_episode_id else {
            return Ok(Vec::new());
        };
        let turns = self.storage.get_turns_by_episode(episode_id).await?;
        Ok(turns
            .into_iter()
            .map(|turn| self.turn_candidate(turn, CURRENT_EPISODE_RELEVANCE))
            .collect())
    }

    async fn marked_candidates(
        &self,
        current_episode_id: Option<&str>,
        query_embedding: Option<&[f32]>,
        min_relevance: f32,
    ) -> Result<Vec<Candidate>> {
        let turns = self
            .storage
            .get_marked_turns(&self.session_id, current_episode_id)
            .await?;

        let mut candidates = Vec::with_capacity(turns.len());
        for turn in turns {
            let relevance = self
                .relevance_for(turn.embedding_id.as_deref(), query_embedding)
                .await;
            if relevance < min_relevance {
                continue;
            }
            candidates.push(self.turn_candidate(turn, relevance));
        }
        sort_by_score(&mut candidates);
        Ok(candidates)
    }

    async fn fact_candidates(
        &self,
        query_embedding: Option<&[f32]>,
        min_relevance: f32,
    ) -> Result<Vec<Candidate>> {
        if !self.config.reflection.enabled {
            return Ok(Vec::new());
        }
        let facts = self
            .storage
            .get_facts_by_session(&self.session_id, Some(FactStatus::Active))
            .await?;

        let mut candidates = Vec::with_capacity(facts.len());
        for fact in facts {
            let relevance = self
                .relevance_for(fact.embedding_id.as_deref(), query_embedding)
                .await;
            if relevance < min_relevance {
                continue;
            }
            let boost = marker_boost(&fact.markers, &self.config.marker_weights);
            candidates.push(Candidate {
                id: fact.id,
                content: fact.content,
                role: None,
                source: SourceType::Fact,
                relevance,
                boost,
                token_count: fact.token_count,
                markers: fact.markers,
            });
        }
        sort_by_score(&mut candidates);
        Ok(candidates)
    }

    async fn vector_candidates(
        &self,
        query_embedding: Option<&[f32]>,
        min_relevance: f32,
    ) -> Result<Vec<Candidate>> {
        let Some(query_embedding) = query_embedding else {
            return Ok(Vec::new());
        };

        let filter = VectorFilter {
            session_id: Some(self.session_id.clone()),
            kind: Some(EmbeddingKind::Turn),
            has_markers: Some(false),
        };
        let results = self
            .storage
            .vector_search(query_embedding, self.config.recall.vector_search_k, &filter)
            .await?;

        let mut candidates = Vec::with_capacity(results.len());
        for result in results {
            if result.score < min_relevance {
                continue;
            }
            let Some(turn) = self.storage.get_turn(&result.metadata.source_id).await? else {
                continue;
            };
            candidates.push(self.turn_candidate(turn, result.score));
        }
        Ok(candidates)
    }

    async fn relevance_for(
        &self,
        embedding_id: Option<&str>,
        query_embedding: Option<&[f32]>,
    ) -> f32 {
        let (Some(embedding_id), Some(query_embedding)) = (embedding_id, query_embedding) else {
            return FALLBACK_RELEVANCE;
        };
        match self.storage.get_embedding(embedding_id).await {
            Ok(Some(vector)) => engram_memory::cosine_similarity(query_embedding, &vector),
            Ok(None) => FALLBACK_RELEVANCE,
            Err(e) => {
                warn!(embedding_id, error = %e, "Failed to load embedding for scoring");
                FALLBACK_RELEVANCE
            }
        }
    }

    fn turn_candidate(&self, turn: Turn, relevance: f32) -> Candidate {
        let boost = marker_boost(&turn.markers, &self.config.marker_weights);
        Candidate {
            id: turn.id,
            content: turn.content,
            role: Some(turn.role),
            source: SourceType::Turn,
            relevance,
            boost,
            token_count: turn.token_count,
            markers: turn.markers,
        }
    }

    /// Pack candidates under the budget.
    ///
    /// Step A reserves a slice for the current episode (marked turns first,
    /// then most recent unmarked). Step B takes marked past turns in score
    /// order until one would overflow. Step C merges facts and vector
    /// results by score, skipping items that don't fit. Output order:
    /// facts, past turns, then current-episode turns chronologically.
    fn pack(
        &self,
        token_budget: usize,
        current: Vec<Candidate>,
        marked: Vec<Candidate>,
        facts: Vec<Candidate>,
        vectors: Vec<Candidate>,
    ) -> Vec<ContextItem> {
        let mut used = 0usize;

        // --- Step A: current episode within its reservation ---
        let reservation = ((token_budget as f64)
            * (self.config.recall.current_episode_budget_pct as f64))
            .floor() as usize;
        let current_total: usize = current.iter().map(|c| c.token_count).sum();

        let selected_current: Vec<Candidate> = if current_total <= reservation {
            current
        } else {
            warn!(
                current_tokens = current_total,
                reservation,
                "Current episode exceeds its budget reservation; dropping oldest unmarked turns"
            );
            let mut keep = vec![false; current.len()];
            let mut reserved_used = 0usize;

            // Marked current-episode turns are always retained first, best
            // score first.
            let mut marked_order: Vec<usize> = (0..current.len())
                .filter(|&i| !current[i].markers.is_empty())
                .collect();
            marked_order.sort_by(|&a, &b| {
                current[b]
                    .final_score()
                    .partial_cmp(&current[a].final_score())
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            let mut any_marked_dropped = false;
            for i in marked_order {
                if reserved_used + current[i].token_count <= reservation {
                    keep[i] = true;
                    reserved_used += current[i].token_count;
                } else {
                    any_marked_dropped = true;
                }
            }
            if any_marked_dropped {
                warn!("Marked current-episode turns alone exceed the reservation");
            }

            // Fill the rest with the most recent unmarked turns.
            for i in (0..current.len()).rev() {
                if keep[i] || !current[i].markers.is_empty() {
                    continue;
                }
                if reserved_used + current[i].token_count <= reservation {
                    keep[i] = true;
                    reserved_used += current[i].token_count;
                }
            }

            current
                .into_iter()
                .zip(keep)
                .filter_map(|(c, kept)| kept.then_some(c))
                .collect()
        };
        used += selected_current.iter().map(|c| c.token_count).sum::<usize>();

        // --- Step B: marked past turns by score, stop at first overflow ---
        let mut selected_marked = Vec::new();
        for candidate in marked {
            if used + candidate.token_count > token_budget {
                debug!(
                    turn_id = %candidate.id,
                    "Marked turn excluded by budget; stopping marked-source fill"
                );
                break;
            }
            used += candidate.token_count;
            selected_marked.push(candidate);
        }

        // --- Step C: facts + vector results merged by score, skip misfits ---
        let mut remaining: Vec<Candidate> = facts.into_iter().chain(vectors).collect();
        sort_by_score(&mut remaining);

        let mut selected_facts = Vec::new();
        let mut selected_vectors = Vec::new();
        for candidate in remaining {
            if used + candidate.token_count > token_budget {
                continue;
            }
            used += candidate.token_count;
            match candidate.source {
                SourceType::Fact => selected_facts.push(candidate),
                SourceType::Turn => selected_vectors.push(candidate),
            }
        }

        // --- Assemble: facts, past turns (marked + vector) by score, then
        // current episode chronologically. Dedup by source id. ---
        let mut past_turns: Vec<Candidate> = selected_marked
            .into_iter()
            .chain(selected_vectors)
            .collect();
        sort_by_score(&mut past_turns);

        let mut emitted: HashSet<String> = HashSet::new();
        selected_facts
            .into_iter()
            .chain(past_turns)
            .chain(selected_current)
            .filter(|c| emitted.insert(c.id.clone()))
            .map(Candidate::into_item)
            .collect()
    }
}

fn sort_by_score(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| {
        b.final_score()
            .partial_cmp(&a.final_score())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}
