//! Episode lifecycle management — boundary detection and the open-episode
//! state machine.
//!
//! Exactly one episode per session is open at any time after
//! initialization: closing an episode immediately opens its successor.
//! Close triggers are evaluated after appending the triggering turn,
//! except the time-gap rule which runs before the append so the late turn
//! starts the new episode.

use chrono::{DateTime, Duration, Utc};
use engram_core::config::EpisodeBoundaryConfig;
use engram_core::episode::{Episode, EpisodeStatus};
use engram_core::error::{Error, Result};
use engram_core::storage::StorageBackend;
use engram_core::turn::{Role, Turn};
use regex_lite::Regex;
use std::sync::Arc;
use tracing::{debug, info};

/// Result of assigning a turn to an episode.
#[derive(Debug, Clone)]
pub struct AssignOutcome {
    /// The episode the turn was appended to.
    pub episode_id: String,
    /// Episodes closed during this assignment (time-gap close before the
    /// append, boundary close after it — rarely both).
    pub closed_episodes: Vec<String>,
}

/// Tracks the single open episode of a session and applies boundary rules.
pub struct EpisodeManager {
    session_id: String,
    storage: Arc<dyn StorageBackend>,
    boundary: EpisodeBoundaryConfig,
    close_patterns: Vec<Regex>,
    current: Option<Episode>,
    last_turn_time: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for EpisodeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpisodeManager")
            .field("session_id", &self.session_id)
            .field("boundary", &self.boundary)
            .field("current", &self.current)
            .field("last_turn_time", &self.last_turn_time)
            .finish()
    }
}

impl EpisodeManager {
    pub fn new(
        session_id: impl Into<String>,
        storage: Arc<dyn StorageBackend>,
        boundary: EpisodeBoundaryConfig,
    ) -> Result<Self> {
        let close_patterns = boundary
            .close_on_patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|e| {
                    Error::config(format!("Invalid close_on_patterns regex {pattern:?}: {e}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            session_id: session_id.into(),
            storage,
            boundary,
            close_patterns,
            current: None,
            last_turn_time: None,
        })
    }

    /// Load the existing open episode or create the session's first one.
    pub async fn initialize(&mut self) -> Result<()> {
        let open = self
            .storage
            .get_episodes(&self.session_id, Some(EpisodeStatus::Open), 1)
            .await?;

        match open.into_iter().next() {
            Some(episode) => {
                let turns = self.storage.get_turns_by_episode(&episode.id).await?;
                self.last_turn_time = turns.last().map(|t| t.created_at);
                self.current = Some(episode);
            }
            None => {
                self.open_new().await?;
            }
        }
        Ok(())
    }

    pub fn current_episode(&self) -> Option<&Episode> {
        self.current.as_ref()
    }

    pub fn current_episode_id(&self) -> Option<&str> {
        self.current.as_ref().map(|e| e.id.as_str())
    }

    /// Append a turn to the open episode, applying boundary rules.
    ///
    /// Sets the turn's `episode_id` and `position`. Any episode closed along
    /// the way is reported in the outcome so the caller can trigger
    /// reflection.
    pub async fn assign(&mut self, turn: &mut Turn) -> Result<AssignOutcome> {
        let mut closed_episodes = Vec::new();

        // Time-gap rule runs before the append: the late turn opens the new
        // episode instead of stretching the stale one.
        if let Some(last) = self.last_turn_time {
            let gap = turn.created_at.signed_duration_since(last);
            if gap >= Duration::seconds(self.boundary.max_time_gap_seconds as i64) {
                if let Some(id) = self.close_current("time_gap").await? {
                    closed_episodes.push(id);
                }
            }
        }

        if self.current.is_none() {
            self.open_new().await?;
        }

        let episode_id = {
            let episode = self.current.as_mut().expect("an episode is always open");
            turn.episode_id = episode.id.clone();
            turn.position = episode.turn_count;
            episode.turn_count += 1;
            episode.total_tokens += turn.token_count;
            for marker in &turn.markers {
                if !episode.markers.contains(marker) {
                    episode.markers.push(marker.clone());
                }
            }
            episode.id.clone()
        };
        let snapshot = self.current.as_ref().expect("just appended").clone();
        self.storage.update_episode(snapshot).await?;
        self.last_turn_time = Some(turn.created_at);

        // Post-append triggers, first match wins.
        let close_reason = {
            let episode = self.current.as_ref().expect("an episode is always open");
            if episode.turn_count >= self.boundary.max_turns {
                Some("max_turns")
            } else if self.boundary.close_on_tool_result && turn.role == Role::Tool {
                Some("tool_result")
            } else if self.close_patterns.iter().any(|re| re.is_match(&turn.content)) {
                Some("pattern")
            } else {
                None
            }
        };

        if let Some(reason) = close_reason {
            if let Some(id) = self.close_current(reason).await? {
                closed_episodes.push(id);
            }
        }

        Ok(AssignOutcome {
            episode_id,
            closed_episodes,
        })
    }

    /// Close the open episode and immediately open its successor.
    ///
    /// Returns the closed episode's id, or `None` when no episode is open
    /// (only possible before initialization).
    pub async fn close_current(&mut self, reason: &str) -> Result<Option<String>> {
        let Some(mut episode) = self.current.take() else {
            return Ok(None);
        };

        episode.close(reason);
        let episode_id = episode.id.clone();
        let turn_count = episode.turn_count;
        self.storage.update_episode(episode).await?;
        self.last_turn_time = None;

        info!(
            episode_id = %episode_id,
            reason,
            turn_count,
            "Episode closed"
        );

        self.open_new().await?;
        Ok(Some(episode_id))
    }

    async fn open_new(&mut self) -> Result<()> {
        let episode = Episode::open(&self.session_id);
        debug!(episode_id = %episode.id, "Opened new episode");
        self.storage.save_episode(episode.clone()).await?;
        self.current = Some(episode);
        Ok(())
    }
}
