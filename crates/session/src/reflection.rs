//! Reflection runner — distills closed episodes into durable facts.
//!
//! Reflections for a session run on a dedicated worker task fed by an
//! unbounded queue, so they execute in episode-close order with at most
//! one in flight per session. Triggers are fire-and-forget from ingestion;
//! `shutdown` drains the queue.
//!
//! Failure semantics: a failed reflection leaves every existing fact
//! untouched and pushes the episode's turns onto the carry-forward buffer
//! so they join the next reflection's input. Action application is atomic
//! per action — supersession goes through a storage compare-and-set.

use chrono::Utc;
use engram_core::config::EngramConfig;
use engram_core::error::StorageError;
use engram_core::fact::{Fact, FactStatus};
use engram_core::marker::Marker;
use engram_core::provider::{Embedder, ReflectionAction, Reflector, ReflectorOutput};
use engram_core::storage::{EmbeddingKind, EmbeddingMetadata, StorageBackend};
use engram_core::token::TokenCounter;
use engram_core::turn::Turn;
use engram_memory::{centroid, cosine_similarity, is_zero_vector};
use engram_providers::retry::with_retry;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Whether a reflection ran as first extraction or as consolidation of
/// prior facts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReflectionMode {
    Initial,
    Consolidation,
}

/// A fact summarized for trace emission.
#[derive(Debug, Clone, Serialize)]
pub struct TraceFact {
    pub id: String,
    pub content: String,
    pub markers: Vec<Marker>,
}

impl From<&Fact> for TraceFact {
    fn from(fact: &Fact) -> Self {
        Self {
            id: fact.id.clone(),
            content: fact.content.clone(),
            markers: fact.markers.clone(),
        }
    }
}

/// A supersession recorded in a trace.
#[derive(Debug, Clone, Serialize)]
pub struct TraceSupersession {
    pub id: String,
    pub content: String,
    /// The replacement fact, or `None` for plain removals.
    pub superseded_by: Option<String>,
}

/// Complete record of a single reflection, emitted through the trace
/// callback. Serializable; embeddings are never included.
#[derive(Debug, Clone, Serialize)]
pub struct ReflectionTrace {
    pub episode_id: String,
    pub mode: ReflectionMode,
    pub input_turn_count: usize,
    pub prior_facts: Vec<TraceFact>,
    pub scoped_fact_count: usize,
    /// Raw provider output, or an error record on failure.
    pub raw_output: Option<serde_json::Value>,
    pub saved_facts: Vec<TraceFact>,
    pub superseded_facts: Vec<TraceSupersession>,
    /// Actions dropped as malformed, unknown-target, duplicate, or
    /// low-confidence.
    pub skipped_actions: usize,
    pub elapsed_ms: u64,
}

/// Callback receiving reflection traces.
pub type TraceCallback = Arc<dyn Fn(&ReflectionTrace) + Send + Sync>;

/// Shared slot for the installed trace callback.
pub type TraceCallbackSlot = Arc<RwLock<Option<TraceCallback>>>;

/// Handle to a session's reflection worker.
pub struct ReflectionRunner {
    tx: Option<mpsc::UnboundedSender<String>>,
    handle: Option<JoinHandle<()>>,
}

impl ReflectionRunner {
    /// Spawn the worker task for a session.
    pub fn spawn(worker: ReflectionWorker) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let handle = tokio::spawn(async move {
            let mut worker = worker;
            while let Some(episode_id) = rx.recv().await {
                worker.run(&episode_id).await;
            }
        });
        Self {
            tx: Some(tx),
            handle: Some(handle),
        }
    }

    /// Queue a closed episode for reflection (fire-and-forget, FIFO).
    pub fn enqueue(&self, episode_id: impl Into<String>) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(episode_id.into());
        }
    }

    /// Drain the queue and stop the worker.
    pub async fn shutdown(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

/// The per-session reflection state machine driven by [`ReflectionRunner`].
pub struct ReflectionWorker {
    session_id: String,
    storage: Arc<dyn StorageBackend>,
    embedder: Arc<dyn Embedder>,
    reflector: Arc<dyn Reflector>,
    token_counter: Arc<dyn TokenCounter>,
    config: Arc<EngramConfig>,
    trace_callback: TraceCallbackSlot,
    executed: Arc<AtomicU64>,
    carry: Vec<Turn>,
}

impl ReflectionWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_id: impl Into<String>,
        storage: Arc<dyn StorageBackend>,
        embedder: Arc<dyn Embedder>,
        reflector: Arc<dyn Reflector>,
        token_counter: Arc<dyn TokenCounter>,
        config: Arc<EngramConfig>,
        trace_callback: TraceCallbackSlot,
        executed: Arc<AtomicU64>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            storage,
            embedder,
            reflector,
            token_counter,
            config,
            trace_callback,
            executed,
            carry: Vec::new(),
        }
    }

    /// Run one reflection for a closed episode. Never propagates errors;
    /// failures retain the turns for the next attempt.
    pub async fn run(&mut self, episode_id: &str) {
        let started = Instant::now();

        let turns = match self.storage.get_turns_by_episode(episode_id).await {
            Ok(turns) => turns,
            Err(e) => {
                error!(episode_id, error = %e, "Failed to load episode turns for reflection");
                return;
            }
        };

        let mut combined = std::mem::take(&mut self.carry);
        combined.extend(turns);

        let prior_facts = match self
            .storage
            .get_facts_by_session(&self.session_id, Some(FactStatus::Active))
            .await
        {
            Ok(facts) => facts,
            Err(e) => {
                error!(episode_id, error = %e, "Failed to load prior facts for reflection");
                self.carry = combined;
                return;
            }
        };

        let mode = if prior_facts.is_empty() {
            ReflectionMode::Initial
        } else {
            ReflectionMode::Consolidation
        };
        let mut trace = ReflectionTrace {
            episode_id: episode_id.to_string(),
            mode,
            input_turn_count: combined.len(),
            prior_facts: prior_facts.iter().map(TraceFact::from).collect(),
            scoped_fact_count: 0,
            raw_output: None,
            saved_facts: Vec::new(),
            superseded_facts: Vec::new(),
            skipped_actions: 0,
            elapsed_ms: 0,
        };

        // Too little material and nothing to consolidate: carry the turns
        // into the next reflection rather than dropping them.
        if combined.len() < self.config.reflection.min_episode_turns && prior_facts.is_empty() {
            debug!(
                episode_id,
                turns = combined.len(),
                min = self.config.reflection.min_episode_turns,
                "Episode too short for reflection; carrying turns forward"
            );
            self.carry = combined;
            self.emit_trace(trace, started);
            return;
        }

        let episode_centroid = self.episode_centroid(&combined).await;
        let scoped = self
            .scope_facts(&prior_facts, episode_centroid.as_deref())
            .await;
        trace.scoped_fact_count = scoped.len();

        let output = match with_retry("reflect", &self.config.retry, || {
            self.reflector.reflect(&scoped, &combined)
        })
        .await
        {
            Ok(output) => output,
            Err(e) => {
                error!(episode_id, error = %e, "Reflection provider failed; retaining turns");
                trace.raw_output = Some(serde_json::json!({ "error": e.to_string() }));
                self.carry = combined;
                self.emit_trace(trace, started);
                return;
            }
        };
        trace.raw_output = serde_json::to_value(&output).ok();

        let actions = match output {
            ReflectorOutput::Actions(actions) => {
                // Advisory: flag prior facts the reflector never addressed.
                crate::coverage::validate_coverage(&scoped, &actions);
                actions
            }
            ReflectorOutput::Proposals(proposals) => proposals
                .into_iter()
                .map(|p| ReflectionAction::Add {
                    content: p.content,
                    markers: p.markers,
                    confidence: p.confidence,
                })
                .collect(),
        };

        self.apply_actions(episode_id, actions, prior_facts, &mut trace)
            .await;

        self.executed.fetch_add(1, Ordering::Relaxed);
        info!(
            episode_id,
            mode = ?trace.mode,
            saved = trace.saved_facts.len(),
            superseded = trace.superseded_facts.len(),
            skipped = trace.skipped_actions,
            "Reflection applied"
        );
        self.emit_trace(trace, started);
    }

    /// Turns still waiting for a reflection (exposed for session close).
    pub fn carry_len(&self) -> usize {
        self.carry.len()
    }

    // ------------------------------------------------------------------
    // Scoping
    // ------------------------------------------------------------------

    /// Mean of the episode's turn embeddings; falls back to embedding the
    /// concatenated turn text when none are stored.
    async fn episode_centroid(&self, turns: &[Turn]) -> Option<Vec<f32>> {
        let mut vectors = Vec::new();
        for turn in turns {
            if let Some(embedding_id) = &turn.embedding_id {
                if let Ok(Some(vector)) = self.storage.get_embedding(embedding_id).await {
                    vectors.push(vector);
                }
            }
        }
        if !vectors.is_empty() {
            return centroid(&vectors);
        }

        let joined = turns
            .iter()
            .map(|t| t.content.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        let texts = [joined];
        match with_retry("embed_episode", &self.config.retry, || {
            self.embedder.embed(&texts)
        })
        .await
        {
            Ok(vectors) => vectors.into_iter().next(),
            Err(e) => {
                warn!(error = %e, "Failed to embed episode for fact scoping");
                None
            }
        }
    }

    /// Select the prior facts relevant to this episode.
    ///
    /// Facts without embeddings are always in scope; a missing or
    /// zero-vector centroid disables similarity filtering entirely rather
    /// than silently dropping facts. If filtering removes everything, all
    /// priors are included as a conservative fallback. The result is
    /// bounded by `max_scoped_facts`, most similar first.
    async fn scope_facts(&self, prior_facts: &[Fact], episode_centroid: Option<&[f32]>) -> Vec<Fact> {
        if prior_facts.is_empty() {
            return Vec::new();
        }

        let max_scoped = self.config.reflection.max_scoped_facts;
        let centroid_vec = match episode_centroid {
            Some(v) if !is_zero_vector(v) => v,
            _ => {
                let mut all = prior_facts.to_vec();
                all.truncate(max_scoped);
                return all;
            }
        };

        let threshold = self.config.reflection.consolidation_similarity_threshold;
        let mut scored: Vec<(f32, Fact)> = Vec::new();
        for fact in prior_facts {
            let similarity = match &fact.embedding_id {
                None => 1.0,
                Some(embedding_id) => match self.storage.get_embedding(embedding_id).await {
                    Ok(Some(vector)) => cosine_similarity(centroid_vec, &vector),
                    _ => 1.0,
                },
            };
            if similarity >= threshold {
                scored.push((similarity, fact.clone()));
            }
        }

        if scored.is_empty() {
            debug!(
                priors = prior_facts.len(),
                "Similarity scoping removed all facts; including all as fallback"
            );
            let mut all = prior_facts.to_vec();
            all.truncate(max_scoped);
            return all;
        }

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(max_scoped);
        scored.into_iter().map(|(_, fact)| fact).collect()
    }

    // ------------------------------------------------------------------
    // Action application
    // ------------------------------------------------------------------

    async fn apply_actions(
        &mut self,
        episode_id: &str,
        actions: Vec<ReflectionAction>,
        prior_facts: Vec<Fact>,
        trace: &mut ReflectionTrace,
    ) {
        let mut active: HashMap<String, Fact> =
            prior_facts.into_iter().map(|f| (f.id.clone(), f)).collect();
        // Embeddings of facts saved during this run, kept for dedup.
        let mut fresh_embeddings: HashMap<String, Vec<f32>> = HashMap::new();
        let mut adds_saved = 0usize;

        for action in actions {
            match action {
                ReflectionAction::Keep { target_fact_id } => {
                    if !active.contains_key(&target_fact_id) {
                        warn!(fact_id = %target_fact_id, "Keep references unknown fact");
                        trace.skipped_actions += 1;
                    }
                }

                ReflectionAction::Add {
                    content,
                    markers,
                    confidence,
                } => {
                    if confidence < self.config.reflection.min_confidence {
                        trace.skipped_actions += 1;
                        continue;
                    }
                    if adds_saved >= self.config.reflection.max_facts_per_episode {
                        debug!(
                            max = self.config.reflection.max_facts_per_episode,
                            "Per-episode fact cap reached; dropping add"
                        );
                        trace.skipped_actions += 1;
                        continue;
                    }

                    let vector = self.embed_text(&content).await;
                    if let Some(vector) = &vector {
                        if self
                            .is_duplicate(vector, &content, &active, &fresh_embeddings)
                            .await
                        {
                            trace.skipped_actions += 1;
                            continue;
                        }
                    }

                    let mut fact =
                        Fact::new(&self.session_id, episode_id, content, markers);
                    fact.confidence = confidence;
                    match self.save_fact(fact, vector.clone()).await {
                        Ok(fact) => {
                            adds_saved += 1;
                            trace.saved_facts.push(TraceFact::from(&fact));
                            if let Some(vector) = vector {
                                fresh_embeddings.insert(fact.id.clone(), vector);
                            }
                            active.insert(fact.id.clone(), fact);
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to persist new fact");
                            trace.skipped_actions += 1;
                        }
                    }
                }

                ReflectionAction::Update {
                    target_fact_id,
                    content,
                    markers,
                    confidence,
                    reason,
                } => {
                    if !active.contains_key(&target_fact_id) {
                        warn!(fact_id = %target_fact_id, "Update references unknown or superseded fact");
                        trace.skipped_actions += 1;
                        continue;
                    }
                    if confidence < self.config.reflection.min_confidence {
                        trace.skipped_actions += 1;
                        continue;
                    }

                    let vector = self.embed_text(&content).await;
                    let mut replacement =
                        Fact::new(&self.session_id, episode_id, content, markers);
                    replacement.confidence = confidence;
                    let replacement = match self.save_fact(replacement, vector.clone()).await {
                        Ok(fact) => fact,
                        Err(e) => {
                            error!(error = %e, "Failed to persist replacement fact");
                            trace.skipped_actions += 1;
                            continue;
                        }
                    };

                    match self
                        .storage
                        .update_fact_supersession(&target_fact_id, Some(&replacement.id), Utc::now())
                        .await
                    {
                        Ok(()) => {
                            let old = active.remove(&target_fact_id);
                            debug!(
                                old = %target_fact_id,
                                new = %replacement.id,
                                reason = %reason,
                                "Fact superseded by update"
                            );
                            trace.superseded_facts.push(TraceSupersession {
                                id: target_fact_id,
                                content: old.map(|f| f.content).unwrap_or_default(),
                                superseded_by: Some(replacement.id.clone()),
                            });
                            trace.saved_facts.push(TraceFact::from(&replacement));
                            if let Some(vector) = vector {
                                fresh_embeddings.insert(replacement.id.clone(), vector);
                            }
                            active.insert(replacement.id.clone(), replacement);
                        }
                        Err(e) => {
                            // The target was superseded out from under us;
                            // retire the replacement so the chain stays
                            // single-headed.
                            warn!(fact_id = %target_fact_id, error = %e, "Supersession rejected; rolling back replacement");
                            if let Err(rollback) = self
                                .storage
                                .update_fact_supersession(&replacement.id, None, Utc::now())
                                .await
                            {
                                error!(error = %rollback, "Failed to roll back replacement fact");
                            }
                            trace.skipped_actions += 1;
                        }
                    }
                }

                ReflectionAction::Remove {
                    target_fact_id,
                    reason,
                } => {
                    if !active.contains_key(&target_fact_id) {
                        warn!(fact_id = %target_fact_id, "Remove references unknown or superseded fact");
                        trace.skipped_actions += 1;
                        continue;
                    }
                    match self
                        .storage
                        .update_fact_supersession(&target_fact_id, None, Utc::now())
                        .await
                    {
                        Ok(()) => {
                            let old = active.remove(&target_fact_id);
                            debug!(fact_id = %target_fact_id, reason = %reason, "Fact removed");
                            trace.superseded_facts.push(TraceSupersession {
                                id: target_fact_id,
                                content: old.map(|f| f.content).unwrap_or_default(),
                                superseded_by: None,
                            });
                        }
                        Err(StorageError::Conflict(message)) => {
                            warn!(fact_id = %target_fact_id, detail = %message, "Remove lost a supersession race");
                            trace.skipped_actions += 1;
                        }
                        Err(e) => {
                            error!(fact_id = %target_fact_id, error = %e, "Failed to remove fact");
                            trace.skipped_actions += 1;
                        }
                    }
                }
            }
        }
    }

    async fn embed_text(&self, text: &str) -> Option<Vec<f32>> {
        let texts = [text.to_string()];
        match with_retry("embed_fact", &self.config.retry, || {
            self.embedder.embed(&texts)
        })
        .await
        {
            Ok(vectors) => vectors.into_iter().next(),
            Err(e) => {
                warn!(error = %e, "Failed to embed fact content");
                None
            }
        }
    }

    /// Whether a proposed fact duplicates an active fact by embedding
    /// similarity. Zero vectors (null embedder) disable dedup.
    async fn is_duplicate(
        &self,
        vector: &[f32],
        content: &str,
        active: &HashMap<String, Fact>,
        fresh_embeddings: &HashMap<String, Vec<f32>>,
    ) -> bool {
        let threshold = self.config.reflection.dedup_similarity_threshold;
        if threshold >= 1.0 || is_zero_vector(vector) {
            return false;
        }

        for fact in active.values() {
            let existing = match fresh_embeddings.get(&fact.id) {
                Some(vector) => Some(vector.clone()),
                None => match &fact.embedding_id {
                    Some(embedding_id) => {
                        self.storage.get_embedding(embedding_id).await.ok().flatten()
                    }
                    None => None,
                },
            };
            let Some(existing) = existing else { continue };
            let similarity = cosine_similarity(vector, &existing);
            if similarity >= threshold {
                let preview: String = content.chars().take(60).collect();
                info!(
                    similarity,
                    existing = %fact.id,
                    content = %preview,
                    "Duplicate fact discarded"
                );
                return true;
            }
        }
        false
    }

    /// Count tokens, persist the embedding if available, and save the fact.
    async fn save_fact(
        &self,
        mut fact: Fact,
        vector: Option<Vec<f32>>,
    ) -> Result<Fact, StorageError> {
        fact.token_count = self.token_counter.count(&fact.content);

        if let Some(vector) = vector {
            let metadata = EmbeddingMetadata {
                session_id: self.session_id.clone(),
                kind: EmbeddingKind::Fact,
                source_id: fact.id.clone(),
                episode_id: fact.source_episode_ids.first().cloned(),
                has_markers: !fact.markers.is_empty(),
            };
            match self.storage.save_embedding(&fact.id, vector, metadata).await {
                Ok(()) => fact.embedding_id = Some(fact.id.clone()),
                Err(e) => warn!(fact_id = %fact.id, error = %e, "Failed to persist fact embedding"),
            }
        }

        self.storage.save_fact(fact.clone()).await?;
        Ok(fact)
    }

    fn emit_trace(&self, mut trace: ReflectionTrace, started: Instant) {
        let callback = self.trace_callback.read().unwrap().clone();
        if let Some(callback) = callback {
            trace.elapsed_ms = started.elapsed().as_millis() as u64;
            callback(&trace);
        }
    }
}
