//! Importance markers and auto-detection.
//!
//! Markers are lightweight signals attached to turns (and carried into
//! facts) that boost recall scoring:
//! - `decision`: choices made, maintain consistency
//! - `constraint`: limitations/requirements, always relevant
//! - `failure`: what didn't work, prevent repeated attempts
//! - `goal`: task objectives, anchor for relevance
//! - `custom:<label>`: opaque caller-defined tags
//!
//! Auto-detection matches prefix patterns at the start of content or
//! immediately after a newline (`Decision: ...`, `Constraint: ...`, etc.).

use crate::error::Error;
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::OnceLock;

/// Default boost weight for `custom:*` and unknown markers.
pub const DEFAULT_CUSTOM_MARKER_WEIGHT: f32 = 0.2;

/// An importance marker attached to a turn or fact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Marker {
    Decision,
    Constraint,
    Failure,
    Goal,
    /// Caller-defined marker; the label is opaque and must be non-empty.
    Custom(String),
}

impl Marker {
    /// Parse a marker string, validating custom labels.
    pub fn parse(s: &str) -> Result<Self, Error> {
        match s {
            "decision" => Ok(Self::Decision),
            "constraint" => Ok(Self::Constraint),
            "failure" => Ok(Self::Failure),
            "goal" => Ok(Self::Goal),
            _ => {
                if let Some(label) = s.strip_prefix("custom:") {
                    if label.is_empty() {
                        return Err(Error::validation(
                            "markers",
                            format!("Custom marker must have a name after 'custom:': {s}"),
                        ));
                    }
                    Ok(Self::Custom(label.to_string()))
                } else {
                    Err(Error::validation(
                        "markers",
                        format!("Invalid marker: {s}. Must be decision, constraint, failure, goal, or 'custom:*'"),
                    ))
                }
            }
        }
    }

    /// The canonical string form (`decision`, `custom:<label>`, ...).
    pub fn as_key(&self) -> String {
        match self {
            Self::Decision => "decision".into(),
            Self::Constraint => "constraint".into(),
            Self::Failure => "failure".into(),
            Self::Goal => "goal".into(),
            Self::Custom(label) => format!("custom:{label}"),
        }
    }

    /// Whether this is a caller-defined marker.
    pub fn is_custom(&self) -> bool {
        matches!(self, Self::Custom(_))
    }
}

impl std::fmt::Display for Marker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_key())
    }
}

impl From<Marker> for String {
    fn from(m: Marker) -> Self {
        m.as_key()
    }
}

impl TryFrom<String> for Marker {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Error> {
        Marker::parse(&s)
    }
}

/// Default boost weights for the built-in markers.
pub fn default_marker_weights() -> HashMap<String, f32> {
    HashMap::from([
        ("constraint".to_string(), 0.4),
        ("decision".to_string(), 0.3),
        ("goal".to_string(), 0.3),
        ("failure".to_string(), 0.2),
    ])
}

/// Total score boost for a marker set under the given weight table.
///
/// Markers absent from the table (custom or unknown) fall back to
/// [`DEFAULT_CUSTOM_MARKER_WEIGHT`].
pub fn marker_boost(markers: &[Marker], weights: &HashMap<String, f32>) -> f32 {
    markers
        .iter()
        .map(|m| {
            weights
                .get(&m.as_key())
                .copied()
                .unwrap_or(DEFAULT_CUSTOM_MARKER_WEIGHT)
        })
        .sum()
}

// Pattern must appear at start of content or after a newline, optionally
// preceded by whitespace, and be terminated by a colon.
fn detection_patterns() -> &'static [(Marker, Regex)] {
    static PATTERNS: OnceLock<Vec<(Marker, Regex)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let table = [
            (
                Marker::Decision,
                r"(?i)(?:^|\n)\s*(?:decision|decided|choosing|selected|chose|picked|going with):",
            ),
            (
                Marker::Constraint,
                r"(?i)(?:^|\n)\s*(?:constraint|requirement|must|cannot|can't|won't|budget|limit|restriction):",
            ),
            (
                Marker::Failure,
                r"(?i)(?:^|\n)\s*(?:failed|error|didn't work|didn't succeed|tried but|couldn't|could not):",
            ),
            (
                Marker::Goal,
                r"(?i)(?:^|\n)\s*(?:goal|objective|task|need to|want to|trying to|aim):",
            ),
        ];
        table
            .into_iter()
            .map(|(marker, pattern)| {
                let re = Regex::new(pattern).expect("built-in marker pattern must compile");
                (marker, re)
            })
            .collect()
    })
}

/// Auto-detect markers from content prefix patterns.
///
/// A pure function of content: feeding already-marked text back through
/// detection yields the same result.
pub fn detect_markers(content: &str) -> Vec<Marker> {
    detection_patterns()
        .iter()
        .filter(|(_, re)| re.is_match(content))
        .map(|(marker, _)| marker.clone())
        .collect()
}

/// Merge explicit markers with auto-detected ones.
///
/// The effective set is the union, explicit markers first, duplicates
/// removed while keeping insertion order.
pub fn merge_markers(explicit: &[Marker], detected: Vec<Marker>) -> Vec<Marker> {
    let mut merged: Vec<Marker> = Vec::with_capacity(explicit.len() + detected.len());
    for marker in explicit.iter().cloned().chain(detected) {
        if !merged.contains(&marker) {
            merged.push(marker);
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_builtin_markers() {
        assert_eq!(Marker::parse("decision").unwrap(), Marker::Decision);
        assert_eq!(Marker::parse("constraint").unwrap(), Marker::Constraint);
        assert_eq!(Marker::parse("failure").unwrap(), Marker::Failure);
        assert_eq!(Marker::parse("goal").unwrap(), Marker::Goal);
    }

    #[test]
    fn parse_custom_marker() {
        let m = Marker::parse("custom:billing").unwrap();
        assert_eq!(m, Marker::Custom("billing".into()));
        assert_eq!(m.as_key(), "custom:billing");
    }

    #[test]
    fn empty_custom_label_rejected() {
        assert!(Marker::parse("custom:").is_err());
    }

    #[test]
    fn unknown_marker_rejected() {
        assert!(Marker::parse("importance").is_err());
    }

    #[test]
    fn detects_decision_at_start() {
        let markers = detect_markers("Decision: We'll use PostgreSQL.");
        assert_eq!(markers, vec![Marker::Decision]);
    }

    #[test]
    fn detects_after_newline() {
        let markers = detect_markers("Here's the plan.\nConstraint: budget is $500.");
        assert_eq!(markers, vec![Marker::Constraint]);
    }

    #[test]
    fn detection_is_case_insensitive() {
        assert_eq!(detect_markers("DECIDED: go with option B"), vec![Marker::Decision]);
    }

    #[test]
    fn mid_sentence_keyword_not_detected() {
        // "decision" appears but not as a prefix pattern.
        assert!(detect_markers("That was a hard decision to make.").is_empty());
    }

    #[test]
    fn multiple_markers_detected() {
        let markers = detect_markers("Goal: ship v1.\nFailed: the first deploy attempt.");
        assert!(markers.contains(&Marker::Goal));
        assert!(markers.contains(&Marker::Failure));
        assert_eq!(markers.len(), 2);
    }

    #[test]
    fn detection_is_idempotent() {
        let text = "Decision: use Redis for the queue.";
        let first = detect_markers(text);
        let second = detect_markers(text);
        assert_eq!(first, second);
    }

    #[test]
    fn merge_unions_and_dedups() {
        let merged = merge_markers(
            &[Marker::Goal, Marker::Decision],
            vec![Marker::Decision, Marker::Constraint],
        );
        assert_eq!(
            merged,
            vec![Marker::Goal, Marker::Decision, Marker::Constraint]
        );
    }

    #[test]
    fn boost_sums_weights() {
        let weights = default_marker_weights();
        let boost = marker_boost(&[Marker::Constraint, Marker::Decision], &weights);
        assert!((boost - 0.7).abs() < 1e-6);
    }

    #[test]
    fn custom_marker_uses_default_weight() {
        let weights = default_marker_weights();
        let boost = marker_boost(&[Marker::Custom("billing".into())], &weights);
        assert!((boost - DEFAULT_CUSTOM_MARKER_WEIGHT).abs() < 1e-6);
    }

    #[test]
    fn marker_serde_round_trip() {
        let m = Marker::Custom("infra".into());
        let json = serde_json::to_string(&m).unwrap();
        assert_eq!(json, "\"custom:infra\"");
        let back: Marker = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);
    }
}
