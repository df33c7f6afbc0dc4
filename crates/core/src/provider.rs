//! Provider traits — embedding and reflection.
//!
//! Providers are external collaborators: the core only requires
//! `embed(texts) -> vectors` and `reflect(existing_facts, turns) -> output`.
//! Implementations live in the `engram-providers` crate.

use crate::error::ProviderError;
use crate::fact::Fact;
use crate::marker::Marker;
use crate::turn::Turn;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Converts text into dense vectors for semantic similarity search.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Generate one embedding per input text, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError>;

    /// Embedding dimension (e.g. 1536 for text-embedding-3-small).
    fn dimension(&self) -> usize;
}

/// A bare new-fact proposal from a reflector running without prior facts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactProposal {
    pub content: String,
    #[serde(default)]
    pub markers: Vec<Marker>,
    #[serde(default = "default_confidence")]
    pub confidence: f32,
}

fn default_confidence() -> f32 {
    0.8
}

/// A typed consolidation action over the session's fact set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ReflectionAction {
    /// Introduce a new fact.
    Add {
        content: String,
        #[serde(default)]
        markers: Vec<Marker>,
        #[serde(default = "default_confidence")]
        confidence: f32,
    },
    /// Replace an existing fact with revised content.
    Update {
        target_fact_id: String,
        content: String,
        #[serde(default)]
        markers: Vec<Marker>,
        #[serde(default = "default_confidence")]
        confidence: f32,
        #[serde(default)]
        reason: String,
    },
    /// Retire an existing fact without replacement.
    Remove {
        target_fact_id: String,
        #[serde(default)]
        reason: String,
    },
    /// Existing fact is still accurate; no change.
    Keep { target_fact_id: String },
}

/// What a reflector returns: either bare fact proposals (initial
/// extraction) or an ordered list of typed actions (consolidation).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ReflectorOutput {
    Proposals(Vec<FactProposal>),
    Actions(Vec<ReflectionAction>),
}

impl ReflectorOutput {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Proposals(p) => p.is_empty(),
            Self::Actions(a) => a.is_empty(),
        }
    }
}

/// Consolidates prior facts with new episode turns.
#[async_trait]
pub trait Reflector: Send + Sync {
    /// Distill the turns (plus any carry-forward input) against the scoped
    /// prior facts into proposals or actions.
    async fn reflect(
        &self,
        existing_facts: &[Fact],
        turns: &[Turn],
    ) -> Result<ReflectorOutput, ProviderError>;
}
