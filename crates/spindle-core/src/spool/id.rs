//! Spool id generation and tag parsing.

use rand::RngCore;

/// Number of random bytes in a spool id (16 hex chars).
const ID_BYTES: usize = 8;

/// Generate a fresh spool id: lowercase hex from the thread-local
/// cryptographic RNG, optionally carrying a harness prefix such as
/// `codex-`.
#[must_use]
pub fn generate(prefix: Option<&str>) -> String {
    let mut bytes = [0u8; ID_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    match prefix {
        Some(p) => format!("{p}-{hex}"),
        None => hex,
    }
}

/// A short suffix for worktree/branch names.
#[must_use]
pub fn short_suffix() -> String {
    let mut bytes = [0u8; 3];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Parse a comma-separated tag string: trimmed, empties dropped,
/// duplicates removed, first-seen order preserved.
#[must_use]
pub fn parse_tags(raw: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    raw.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .filter(|t| seen.insert(t.to_string()))
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_hex_and_long_enough() {
        let id = generate(None);
        assert_eq!(id.len(), ID_BYTES * 2);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn ids_carry_prefix() {
        let id = generate(Some("codex"));
        assert!(id.starts_with("codex-"));
        assert_eq!(id.len(), "codex-".len() + ID_BYTES * 2);
    }

    #[test]
    fn ids_do_not_collide_casually() {
        let a = generate(None);
        let b = generate(None);
        assert_ne!(a, b);
    }

    #[test]
    fn tags_trim_dedupe_preserve_order() {
        let tags = parse_tags(" triage, batch-1 ,triage,, batch-2 ");
        assert_eq!(tags, vec!["triage", "batch-1", "batch-2"]);
    }

    #[test]
    fn empty_tag_string_yields_nothing() {
        assert!(parse_tags("").is_empty());
        assert!(parse_tags(" , ,").is_empty());
    }
}
