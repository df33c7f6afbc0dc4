//! No-op providers for testing and for running without real services.

use async_trait::async_trait;
use engram_core::error::ProviderError;
use engram_core::fact::Fact;
use engram_core::provider::{Embedder, Reflector, ReflectorOutput};
use engram_core::turn::Turn;

/// Embedder that returns zero vectors of a configurable dimension.
///
/// The reflection runner recognizes zero vectors and disables similarity
/// scoping and dedup rather than silently dropping facts.
pub struct NullEmbedder {
    dimension: usize,
}

impl NullEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

impl Default for NullEmbedder {
    fn default() -> Self {
        Self::new(1536)
    }
}

#[async_trait]
impl Embedder for NullEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        Ok(texts.iter().map(|_| vec![0.0; self.dimension]).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Reflector that produces no output. Use when reflection is disabled.
#[derive(Default)]
pub struct NullReflector;

#[async_trait]
impl Reflector for NullReflector {
    async fn reflect(
        &self,
        _existing_facts: &[Fact],
        _turns: &[Turn],
    ) -> Result<ReflectorOutput, ProviderError> {
        Ok(ReflectorOutput::Proposals(Vec::new()))
    }
}
