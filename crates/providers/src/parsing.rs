//! Parsing of reflector model output into typed proposals and actions.
//!
//! Models wrap JSON in markdown fences or prose often enough that parsing
//! is lenient: the first JSON object found in the text is used, malformed
//! items are skipped and counted, and unknown fact types degrade to
//! `decision`. Parsing never returns an error for bad content — an empty
//! result plus a skip count is always preferred.

use engram_core::fact::Fact;
use engram_core::marker::Marker;
use engram_core::provider::{FactProposal, ReflectionAction};
use engram_core::turn::Turn;
use serde_json::Value;
use tracing::warn;

/// Extract the first JSON object from a string.
///
/// Fast path for clean JSON; otherwise scans from the first `{` to the
/// last `}`.
pub fn extract_json(content: &str) -> Option<Value> {
    let stripped = content.trim();
    if stripped.starts_with('{') {
        if let Ok(value) = serde_json::from_str(stripped) {
            return Some(value);
        }
    }

    let start = content.find('{')?;
    let end = content.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&content[start..=end]).ok()
}

fn parse_marker(raw: Option<&Value>) -> Vec<Marker> {
    match raw.and_then(Value::as_str) {
        Some(s) => match Marker::parse(s) {
            Ok(marker) => vec![marker],
            Err(_) => vec![Marker::Decision],
        },
        None => vec![Marker::Decision],
    }
}

fn parse_confidence(raw: Option<&Value>, default: f32) -> f32 {
    raw.and_then(Value::as_f64).map(|c| c as f32).unwrap_or(default)
}

/// Parse initial-reflection output into fact proposals.
///
/// Expected shape: `{"facts": [{"content": "...", "type": "decision",
/// "confidence": 0.9}, ...]}`. Returns the proposals plus the number of
/// skipped malformed items.
pub fn parse_fact_proposals(content: &str) -> (Vec<FactProposal>, usize) {
    let Some(data) = extract_json(content) else {
        warn!("Reflection response contained no valid JSON");
        return (Vec::new(), 0);
    };

    let Some(items) = data.get("facts").and_then(Value::as_array) else {
        warn!("Reflection response 'facts' is missing or not a list");
        return (Vec::new(), 0);
    };

    let mut proposals = Vec::new();
    let mut skipped = 0;
    for item in items {
        let Some(obj) = item.as_object() else {
            skipped += 1;
            continue;
        };
        let Some(text) = obj.get("content").and_then(Value::as_str) else {
            skipped += 1;
            continue;
        };
        if text.is_empty() {
            skipped += 1;
            continue;
        }
        proposals.push(FactProposal {
            content: text.to_string(),
            markers: parse_marker(obj.get("type")),
            confidence: parse_confidence(obj.get("confidence"), 0.8),
        });
    }

    (proposals, skipped)
}

/// Parse consolidation output into typed actions.
///
/// Expected shape: `{"actions": [{"action": "keep|update|add|remove",
/// "content": "...", "type": "...", "confidence": 0.9,
/// "source_fact_id": "fact_...", "reason": "..."}, ...]}`. Returns the
/// actions plus the number of skipped malformed items.
pub fn parse_reflection_actions(content: &str) -> (Vec<ReflectionAction>, usize) {
    let Some(data) = extract_json(content) else {
        warn!("Consolidation response contained no valid JSON");
        return (Vec::new(), 0);
    };

    let Some(items) = data.get("actions").and_then(Value::as_array) else {
        warn!("Consolidation response 'actions' is missing or not a list");
        return (Vec::new(), 0);
    };

    let mut actions = Vec::new();
    let mut skipped = 0;
    for item in items {
        let Some(obj) = item.as_object() else {
            skipped += 1;
            continue;
        };
        let kind = obj.get("action").and_then(Value::as_str).unwrap_or("");
        let content_text = obj
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let target = obj
            .get("source_fact_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        let reason = obj
            .get("reason")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();

        let action = match kind {
            "add" => {
                if content_text.is_empty() {
                    skipped += 1;
                    continue;
                }
                ReflectionAction::Add {
                    content: content_text,
                    markers: parse_marker(obj.get("type")),
                    confidence: parse_confidence(obj.get("confidence"), 0.9),
                }
            }
            "update" => {
                let Some(target_fact_id) = target else {
                    skipped += 1;
                    continue;
                };
                if content_text.is_empty() {
                    skipped += 1;
                    continue;
                }
                ReflectionAction::Update {
                    target_fact_id,
                    content: content_text,
                    markers: parse_marker(obj.get("type")),
                    confidence: parse_confidence(obj.get("confidence"), 0.9),
                    reason,
                }
            }
            "remove" => {
                let Some(target_fact_id) = target else {
                    skipped += 1;
                    continue;
                };
                ReflectionAction::Remove {
                    target_fact_id,
                    reason,
                }
            }
            "keep" => {
                let Some(target_fact_id) = target else {
                    skipped += 1;
                    continue;
                };
                ReflectionAction::Keep { target_fact_id }
            }
            other => {
                warn!(action = other, "Unknown consolidation action type");
                skipped += 1;
                continue;
            }
        };
        actions.push(action);
    }

    (actions, skipped)
}

/// Prompt for initial fact extraction from an episode.
pub const REFLECTION_PROMPT: &str = r#"You are extracting durable facts from a conversation episode for a memory system.

A "fact" is one atomic piece of information: a single decision, requirement, parameter, preference, or constraint. When several details are discussed, extract each as its own fact.

## Fact Types
- "decision": a choice or determination that was made
- "constraint": a limitation or rule that must be followed
- "goal": an objective or desired outcome
- "failure": something that did not work or was rejected

## Episode Turns
{turns}

## Instructions
1. Extract up to {max_facts} facts from the episode above.
2. Each fact captures ONE specific piece of information, not a summary.
3. Keep concrete values, names, and parameters (say "Timeout is 30s", not "a timeout was chosen").
4. Record both user requests and assistant confirmations.
5. If something was rejected or reverted, record that as a fact too.

Respond ONLY with valid JSON, no other text:
{"facts": [
  {"content": "The database engine is PostgreSQL", "type": "decision", "confidence": 0.95},
  {"content": "All API endpoints require authentication", "type": "constraint", "confidence": 0.9}
]}"#;

/// Prompt for consolidating prior facts with new episode turns.
pub const CONSOLIDATION_PROMPT: &str = r#"You maintain the fact set for an ongoing session. Keep it accurate against the new conversation turns.

## Existing Facts
{prior_facts}

## New Episode Turns
{turns}

## Instructions
Work through these steps in order:

STEP 1 — Output exactly one action for EVERY existing fact:
- "keep": still accurate and unchanged. Include source_fact_id.
- "update": any detail changed. Include source_fact_id, the corrected content, and a reason.
- "remove": no longer true or explicitly revoked. Include source_fact_id and a reason.

STEP 2 — If two existing facts contradict each other, remove the outdated one with a reason naming the contradiction.

STEP 3 — For each detail in the new turns not covered by an existing fact, output:
- "add": include content, type, and confidence.

Rules:
1. Never skip an existing fact.
2. A fact that says X when the conversation now says Y is an UPDATE, not a keep.
3. One fact = one atomic piece of information.
4. Do not drop information from an existing fact when updating it.

Respond ONLY with valid JSON, no other text:
{"actions": [
  {"action": "keep", "source_fact_id": "fact_abc", "content": "API uses REST", "type": "decision", "confidence": 0.95},
  {"action": "update", "source_fact_id": "fact_def", "content": "Database engine is MySQL", "type": "decision", "confidence": 0.9, "reason": "user switched from PostgreSQL"},
  {"action": "add", "content": "Responses include pagination metadata", "type": "constraint", "confidence": 0.85}
]}"#;

/// Render prior facts for inclusion in the consolidation prompt.
pub fn format_prior_facts(facts: &[Fact]) -> String {
    facts
        .iter()
        .map(|fact| {
            let kinds = fact
                .markers
                .iter()
                .map(|m| m.as_key())
                .collect::<Vec<_>>()
                .join(",");
            format!("- [{}] ({}) {}", fact.id, kinds, fact.content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Render episode turns for inclusion in reflection prompts.
pub fn format_turns(turns: &[Turn]) -> String {
    turns
        .iter()
        .map(|t| format!("[{}]: {}", t.role, t.content))
        .collect::<Vec<_>>()
        .join("\n")
}
