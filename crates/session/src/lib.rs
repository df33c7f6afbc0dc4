//! # Engram Session
//!
//! The session-scoped memory layer: episode lifecycle, turn ingestion,
//! token-budgeted recall, and reflection into durable facts.
//!
//! The entry point is [`MemorySession`] — one instance per conversation
//! session, built over a storage backend and optional embedding/reflection
//! providers.

pub mod coverage;
pub mod episode_manager;
pub mod ingestion;
pub mod recall;
pub mod reflection;
pub mod session;

pub use coverage::validate_coverage;
pub use episode_manager::{AssignOutcome, EpisodeManager};
pub use ingestion::{IngestReport, IngestionPipeline};
pub use recall::{RecallOptions, RecallPipeline};
pub use reflection::{
    ReflectionMode, ReflectionRunner, ReflectionTrace, ReflectionWorker, TraceCallback,
    TraceFact, TraceSupersession,
};
pub use session::{MemorySession, MemorySessionBuilder};
