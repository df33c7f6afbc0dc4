//! Fact domain type — durable statements distilled from closed episodes.

use crate::ids;
use crate::marker::Marker;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Visibility status of a fact.
///
/// Facts are never physically deleted: supersession is the only mutation
/// that changes visibility, and the superseded fact is retained for audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FactStatus {
    Active,
    Superseded,
}

/// A semantic fact extracted by reflection over one or more episodes.
///
/// Supersession chains (`superseded_by` links) form a DAG terminating at an
/// active fact or at a removal (`superseded_by = None`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fact {
    /// Unique fact ID
    pub id: String,

    /// Owning session
    pub session_id: String,

    /// Episodes this fact was distilled from (at least one)
    pub source_episode_ids: Vec<String>,

    /// The fact statement
    pub content: String,

    /// Markers carried from the source material
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub markers: Vec<Marker>,

    /// Active or superseded
    pub status: FactStatus,

    /// The fact that replaced this one (`None` for active facts and for
    /// facts retired by a `remove` action)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<String>,

    /// When this fact was created
    pub created_at: DateTime<Utc>,

    /// When this fact was superseded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_at: Option<DateTime<Utc>>,

    /// Reflector confidence (0–1)
    #[serde(default = "default_confidence")]
    pub confidence: f32,

    /// Embedding reference (stored separately)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_id: Option<String>,

    /// Token count of the content
    #[serde(default)]
    pub token_count: usize,
}

fn default_confidence() -> f32 {
    1.0
}

impl Fact {
    /// Create a new active fact sourced from a single episode.
    pub fn new(
        session_id: impl Into<String>,
        source_episode_id: impl Into<String>,
        content: impl Into<String>,
        markers: Vec<Marker>,
    ) -> Self {
        Self {
            id: ids::fact_id(),
            session_id: session_id.into(),
            source_episode_ids: vec![source_episode_id.into()],
            content: content.into(),
            markers,
            status: FactStatus::Active,
            superseded_by: None,
            created_at: Utc::now(),
            superseded_at: None,
            confidence: 1.0,
            embedding_id: None,
            token_count: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == FactStatus::Active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_fact_is_active() {
        let fact = Fact::new("sess_1", "ep_1", "Database is PostgreSQL", vec![Marker::Decision]);
        assert!(fact.is_active());
        assert!(fact.superseded_by.is_none());
        assert_eq!(fact.source_episode_ids, vec!["ep_1".to_string()]);
        assert!(fact.id.starts_with("fact_"));
    }

    #[test]
    fn fact_serde_round_trip() {
        let fact = Fact::new("sess_1", "ep_1", "API must be versioned", vec![Marker::Constraint]);
        let json = serde_json::to_string(&fact).unwrap();
        assert!(json.contains("\"active\""));
        let back: Fact = serde_json::from_str(&json).unwrap();
        assert_eq!(back.content, fact.content);
        assert_eq!(back.status, FactStatus::Active);
    }
}
