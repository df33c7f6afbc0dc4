//! Coverage validation for fact consolidation.
//!
//! After the reflector returns consolidation actions, this module checks
//! that every scoped prior fact is accounted for, either by an explicit
//! target reference or by keyword overlap with some action's content.
//! Validation is advisory (logs warnings, never fails a reflection), since
//! imperfect consolidation beats no consolidation.

use engram_core::fact::Fact;
use engram_core::provider::ReflectionAction;
use std::collections::HashSet;
use tracing::warn;

// Common English stop words excluded from keyword extraction.
const STOP_WORDS: &[&str] = &[
    "the", "and", "for", "are", "but", "not", "you", "all", "can", "had", "her", "was", "one",
    "our", "out", "has", "have", "been", "from", "with", "they", "this", "that", "will", "would",
    "there", "their", "what", "about", "which", "when", "make", "like", "could", "into", "than",
    "its", "over", "such", "after", "also", "did", "some", "then", "them", "each", "does", "how",
    "may", "much", "should", "these", "just", "use", "used", "using",
];

/// Extract meaningful keywords: lowercased, punctuation-stripped words of
/// three or more characters that are not stop words.
pub fn extract_keywords(text: &str) -> HashSet<String> {
    text.split_whitespace()
        .map(|word| {
            word.trim_matches(|c: char| c.is_ascii_punctuation())
                .to_lowercase()
        })
        .filter(|word| word.len() >= 3 && !STOP_WORDS.contains(&word.as_str()))
        .collect()
}

/// Check that every prior fact is covered by at least one action.
///
/// A fact counts as covered when its id appears as an action target, or
/// when at least half of its keywords appear across the action contents.
/// Returns one warning string per uncovered fact (logged by the caller's
/// behalf here as well); empty when everything is covered.
pub fn validate_coverage(prior_facts: &[Fact], actions: &[ReflectionAction]) -> Vec<String> {
    if prior_facts.is_empty() {
        return Vec::new();
    }

    let mut referenced: HashSet<&str> = HashSet::new();
    let mut action_keywords: HashSet<String> = HashSet::new();
    for action in actions {
        match action {
            ReflectionAction::Add { content, .. } => {
                action_keywords.extend(extract_keywords(content));
            }
            ReflectionAction::Update {
                target_fact_id,
                content,
                ..
            } => {
                referenced.insert(target_fact_id);
                action_keywords.extend(extract_keywords(content));
            }
            ReflectionAction::Remove { target_fact_id, .. }
            | ReflectionAction::Keep { target_fact_id } => {
                referenced.insert(target_fact_id);
            }
        }
    }

    let mut warnings = Vec::new();
    for fact in prior_facts {
        if referenced.contains(fact.id.as_str()) {
            continue;
        }

        let fact_keywords = extract_keywords(&fact.content);
        if fact_keywords.is_empty() {
            continue;
        }

        let overlap = fact_keywords
            .iter()
            .filter(|k| action_keywords.contains(*k))
            .count();
        let ratio = overlap as f64 / fact_keywords.len() as f64;
        if ratio < 0.5 {
            let preview: String = fact.content.chars().take(80).collect();
            warnings.push(format!(
                "Fact {} may not be covered by consolidation (keyword overlap {:.0}%): {}",
                fact.id,
                ratio * 100.0,
                preview
            ));
        }
    }

    for warning in &warnings {
        warn!("{warning}");
    }
    warnings
}
