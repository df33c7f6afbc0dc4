//! Opaque ID generation with entity prefixes.

use uuid::Uuid;

/// Generate a unique ID with the given prefix (e.g. `turn_4f2a...`).
pub fn generate_id(prefix: &str) -> String {
    let uid = Uuid::new_v4().simple().to_string();
    format!("{}_{}", prefix, &uid[..16])
}

/// Generate a unique turn ID.
pub fn turn_id() -> String {
    generate_id("turn")
}

/// Generate a unique episode ID.
pub fn episode_id() -> String {
    generate_id("ep")
}

/// Generate a unique fact ID.
pub fn fact_id() -> String {
    generate_id("fact")
}

/// Generate a unique embedding ID.
pub fn embedding_id() -> String {
    generate_id("emb")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_carry_prefix() {
        assert!(turn_id().starts_with("turn_"));
        assert!(episode_id().starts_with("ep_"));
        assert!(fact_id().starts_with("fact_"));
        assert!(embedding_id().starts_with("emb_"));
    }

    #[test]
    fn ids_are_unique() {
        let a = turn_id();
        let b = turn_id();
        assert_ne!(a, b);
    }

    #[test]
    fn id_suffix_is_sixteen_hex_chars() {
        let id = generate_id("x");
        let suffix = id.strip_prefix("x_").unwrap();
        assert_eq!(suffix.len(), 16);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
