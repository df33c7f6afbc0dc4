//! Episode domain type — an ordered, time-bounded group of turns.

use crate::ids;
use crate::marker::Marker;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of an episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EpisodeStatus {
    Open,
    Closed,
}

/// A group of related turns forming a coherent interaction unit.
///
/// At most one episode per session is `Open` at any time; a closed episode
/// never reopens. Episodes are the unit of reflection input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    /// Unique episode ID
    pub id: String,

    /// Owning session
    pub session_id: String,

    /// Open or closed
    pub status: EpisodeStatus,

    /// When the episode was opened
    pub opened_at: DateTime<Utc>,

    /// When the episode was closed (always ≥ `opened_at`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,

    /// Why the episode closed (`max_turns`, `time_gap`, `tool_result`,
    /// `pattern`, `manual`, `session_close`, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub close_reason: Option<String>,

    /// Number of turns appended so far
    #[serde(default)]
    pub turn_count: usize,

    /// Sum of turn token counts
    #[serde(default)]
    pub total_tokens: usize,

    /// Markers aggregated from the episode's turns
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub markers: Vec<Marker>,
}

impl Episode {
    /// Create a fresh open episode for a session.
    pub fn open(session_id: impl Into<String>) -> Self {
        Self {
            id: ids::episode_id(),
            session_id: session_id.into(),
            status: EpisodeStatus::Open,
            opened_at: Utc::now(),
            closed_at: None,
            close_reason: None,
            turn_count: 0,
            total_tokens: 0,
            markers: Vec::new(),
        }
    }

    /// Mark this episode closed with the given reason.
    pub fn close(&mut self, reason: impl Into<String>) {
        self.status = EpisodeStatus::Closed;
        self.closed_at = Some(Utc::now());
        self.close_reason = Some(reason.into());
    }

    pub fn is_open(&self) -> bool {
        self.status == EpisodeStatus::Open
    }
}
