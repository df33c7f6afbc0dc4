//! Configuration for the Engram memory layer.
//!
//! All options have defaults; `validate()` surfaces out-of-range values as
//! configuration errors at session construction time.

use crate::error::Error;
use crate::marker::default_marker_weights;
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Configuration for automatic episode boundaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodeBoundaryConfig {
    /// Close the episode once it holds this many turns.
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,

    /// Close the episode when the gap between turns exceeds this.
    #[serde(default = "default_max_time_gap")]
    pub max_time_gap_seconds: u64,

    /// Close the episode after a tool result turn.
    #[serde(default = "default_true")]
    pub close_on_tool_result: bool,

    /// Regex patterns that trigger episode closure when they match turn content.
    #[serde(default = "default_close_patterns")]
    pub close_on_patterns: Vec<String>,
}

fn default_max_turns() -> usize {
    6
}
fn default_max_time_gap() -> u64 {
    1800 // 30 minutes
}
fn default_close_patterns() -> Vec<String> {
    vec![r"(?i)\b(done|finished|complete|thanks|thank you)\b".to_string()]
}
fn default_true() -> bool {
    true
}

impl Default for EpisodeBoundaryConfig {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
            max_time_gap_seconds: default_max_time_gap(),
            close_on_tool_result: true,
            close_on_patterns: default_close_patterns(),
        }
    }
}

/// Configuration for recall behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecallConfig {
    /// Token budget used when the caller doesn't specify one.
    #[serde(default = "default_token_budget")]
    pub default_token_budget: usize,

    /// Fraction of the budget reserved for current-episode turns (0–1).
    #[serde(default = "default_current_episode_pct")]
    pub current_episode_budget_pct: f32,

    /// Number of results requested from vector search.
    #[serde(default = "default_vector_search_k")]
    pub vector_search_k: usize,
}

fn default_token_budget() -> usize {
    4000
}
fn default_current_episode_pct() -> f32 {
    0.4
}
fn default_vector_search_k() -> usize {
    10
}

impl Default for RecallConfig {
    fn default() -> Self {
        Self {
            default_token_budget: default_token_budget(),
            current_episode_budget_pct: default_current_episode_pct(),
            vector_search_k: default_vector_search_k(),
        }
    }
}

/// Configuration for reflection (fact distillation).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReflectionConfig {
    /// Whether reflection runs at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Minimum turns before a closed episode is reflected; shorter episodes
    /// are carried forward into the next reflection.
    #[serde(default = "default_min_episode_turns")]
    pub min_episode_turns: usize,

    /// Cap on new facts added per reflection.
    #[serde(default = "default_max_facts")]
    pub max_facts_per_episode: usize,

    /// Cap on prior facts handed to the reflector as context.
    #[serde(default = "default_max_scoped_facts")]
    pub max_scoped_facts: usize,

    /// Minimum cosine similarity between a prior fact and the episode
    /// centroid for the fact to be included in consolidation scope.
    #[serde(default = "default_consolidation_threshold")]
    pub consolidation_similarity_threshold: f32,

    /// Cosine similarity at or above which a proposed fact is discarded as
    /// a duplicate of an existing active fact.
    #[serde(default = "default_dedup_threshold")]
    pub dedup_similarity_threshold: f32,

    /// Minimum reflector confidence for a fact to be persisted.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f32,
}

fn default_min_episode_turns() -> usize {
    3
}
fn default_max_facts() -> usize {
    5
}
fn default_max_scoped_facts() -> usize {
    20
}
fn default_consolidation_threshold() -> f32 {
    0.3
}
fn default_dedup_threshold() -> f32 {
    0.95
}
fn default_min_confidence() -> f32 {
    0.7
}

impl Default for ReflectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_episode_turns: default_min_episode_turns(),
            max_facts_per_episode: default_max_facts(),
            max_scoped_facts: default_max_scoped_facts(),
            consolidation_similarity_threshold: default_consolidation_threshold(),
            dedup_similarity_threshold: default_dedup_threshold(),
            min_confidence: default_min_confidence(),
        }
    }
}

/// Configuration for provider call retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_exponential_base")]
    pub exponential_base: f64,

    /// Add ±25% jitter to each delay.
    #[serde(default = "default_true")]
    pub jitter: bool,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    500
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_exponential_base() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            exponential_base: default_exponential_base(),
            jitter: true,
        }
    }
}

/// Configuration for the in-process LRU cache layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_cache_turns")]
    pub max_turns: usize,

    #[serde(default = "default_cache_episodes")]
    pub max_episodes: usize,

    #[serde(default = "default_cache_embeddings")]
    pub max_embeddings: usize,

    #[serde(default = "default_cache_facts")]
    pub max_facts: usize,

    /// Optional TTL for cache entries; `None` means no expiry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<u64>,
}

fn default_cache_turns() -> usize {
    1000
}
fn default_cache_episodes() -> usize {
    100
}
fn default_cache_embeddings() -> usize {
    1000
}
fn default_cache_facts() -> usize {
    500
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_turns: default_cache_turns(),
            max_episodes: default_cache_episodes(),
            max_embeddings: default_cache_embeddings(),
            max_facts: default_cache_facts(),
            ttl_seconds: None,
        }
    }
}

/// Main configuration for an Engram session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngramConfig {
    /// Whether to auto-detect markers from content prefix patterns.
    #[serde(default = "default_true")]
    pub auto_detect_markers: bool,

    /// Boost weights per marker key in recall scoring.
    #[serde(default = "default_marker_weights")]
    pub marker_weights: HashMap<String, f32>,

    /// Maximum content length per turn (characters).
    #[serde(default = "default_max_content_length")]
    pub max_content_length: usize,

    #[serde(default)]
    pub episode_boundary: EpisodeBoundaryConfig,

    #[serde(default)]
    pub recall: RecallConfig,

    #[serde(default)]
    pub reflection: ReflectionConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub cache: CacheConfig,
}

fn default_max_content_length() -> usize {
    100_000
}

impl Default for EngramConfig {
    fn default() -> Self {
        Self {
            auto_detect_markers: true,
            marker_weights: default_marker_weights(),
            max_content_length: default_max_content_length(),
            episode_boundary: EpisodeBoundaryConfig::default(),
            recall: RecallConfig::default(),
            reflection: ReflectionConfig::default(),
            retry: RetryConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

impl EngramConfig {
    /// Validate the entire configuration.
    pub fn validate(&self) -> Result<(), Error> {
        for (marker, weight) in &self.marker_weights {
            if *weight < 0.0 {
                return Err(Error::config(format!(
                    "Marker weight must be non-negative, got {weight} for {marker}"
                )));
            }
        }

        if self.max_content_length == 0 {
            return Err(Error::config("max_content_length must be positive"));
        }

        if self.episode_boundary.max_turns == 0 {
            return Err(Error::config("max_turns must be positive"));
        }
        for pattern in &self.episode_boundary.close_on_patterns {
            Regex::new(pattern).map_err(|e| {
                Error::config(format!("Invalid close_on_patterns regex {pattern:?}: {e}"))
            })?;
        }

        let pct = self.recall.current_episode_budget_pct;
        if !(0.0..=1.0).contains(&pct) {
            return Err(Error::config(format!(
                "current_episode_budget_pct must be between 0 and 1, got {pct}"
            )));
        }
        if self.recall.default_token_budget == 0 {
            return Err(Error::config("default_token_budget must be positive"));
        }
        if self.recall.vector_search_k == 0 {
            return Err(Error::config("vector_search_k must be positive"));
        }

        let refl = &self.reflection;
        for (name, value) in [
            (
                "consolidation_similarity_threshold",
                refl.consolidation_similarity_threshold,
            ),
            ("dedup_similarity_threshold", refl.dedup_similarity_threshold),
            ("min_confidence", refl.min_confidence),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::config(format!(
                    "{name} must be between 0 and 1, got {value}"
                )));
            }
        }
        if refl.max_facts_per_episode == 0 {
            return Err(Error::config("max_facts_per_episode must be positive"));
        }

        if self.retry.max_attempts == 0 {
            return Err(Error::config("max_attempts must be positive"));
        }
        if self.retry.exponential_base < 1.0 {
            return Err(Error::config(format!(
                "exponential_base must be at least 1, got {}",
                self.retry.exponential_base
            )));
        }

        Ok(())
    }

    /// Boost weight for a marker key, falling back to the custom default.
    pub fn marker_weight(&self, key: &str) -> f32 {
        self.marker_weights
            .get(key)
            .copied()
            .unwrap_or(crate::marker::DEFAULT_CUSTOM_MARKER_WEIGHT)
    }
}
