//! Turn domain type — a single message event ingested into a session.

use crate::error::Error;
use crate::marker::Marker;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The end user
    User,
    /// The AI assistant
    Assistant,
    /// Tool execution result
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s.to_ascii_lowercase().as_str() {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "tool" => Ok(Self::Tool),
            other => Err(Error::validation(
                "role",
                format!("Invalid role: {other}. Must be one of: user, assistant, tool"),
            )),
        }
    }
}

/// A single turn in a conversation.
///
/// Turns are the raw memory level: verbatim messages, each belonging to
/// exactly one episode of its session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    /// Unique turn ID
    pub id: String,

    /// Owning session
    pub session_id: String,

    /// Episode this turn belongs to
    pub episode_id: String,

    /// Who produced this turn
    pub role: Role,

    /// The text content
    pub content: String,

    /// Ingestion timestamp (monotone within a session)
    pub created_at: DateTime<Utc>,

    /// Importance markers (explicit plus auto-detected)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub markers: Vec<Marker>,

    /// Arbitrary caller metadata
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,

    /// Token count, computed during ingestion
    #[serde(default)]
    pub token_count: usize,

    /// Embedding reference (stored separately)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_id: Option<String>,

    /// 0-indexed position within the episode
    #[serde(default)]
    pub position: usize,
}

impl Turn {
    /// Whether this turn carries any markers.
    pub fn is_marked(&self) -> bool {
        !self.markers.is_empty()
    }
}
