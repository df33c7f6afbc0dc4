//! Recall output types — context items and session statistics.

use crate::marker::Marker;
use crate::turn::Role;
use serde::{Deserialize, Serialize};

/// Where a context item came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Turn,
    Fact,
}

/// A single element of a recall result.
///
/// Emitted only; never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextItem {
    /// ID of the source turn or fact
    pub source_id: String,

    /// The text content
    pub content: String,

    /// Turn role; `None` for facts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,

    /// Markers carried by the source
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub markers: Vec<Marker>,

    /// Final score (relevance + marker boost; sentinel for current-episode turns)
    pub score: f32,

    /// Token count of the content
    pub token_count: usize,

    /// Turn or fact
    pub source_type: SourceType,
}

/// Counts describing a session's memory state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStats {
    pub session_id: String,
    pub total_turns: usize,
    pub open_episodes: usize,
    pub closed_episodes: usize,
    pub active_facts: usize,
    pub superseded_facts: usize,
    pub total_tokens_ingested: usize,
    pub reflections_executed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_item_for_fact_has_no_role() {
        let item = ContextItem {
            source_id: "fact_1".into(),
            content: "Database is PostgreSQL".into(),
            role: None,
            markers: vec![Marker::Decision],
            score: 0.9,
            token_count: 6,
            source_type: SourceType::Fact,
        };
        let json = serde_json::to_string(&item).unwrap();
        assert!(!json.contains("\"role\""));
        assert!(json.contains("\"fact\""));
    }
}
