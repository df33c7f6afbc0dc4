//! Embedding and reflection provider implementations for Engram.

pub mod http;
pub mod null;
pub mod parsing;
pub mod retry;

pub use http::{HttpEmbedder, HttpReflector};
pub use null::{NullEmbedder, NullReflector};
pub use parsing::{extract_json, parse_fact_proposals, parse_reflection_actions};
pub use retry::{backoff_delay, with_retry};
