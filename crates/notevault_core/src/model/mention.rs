//! Cross-note mention links.
//!
//! # Invariants
//! - A mention is materialized only from a readable (plain) source body.
//! - Link syntax is `notevault://note/<uuid>`.

use crate::model::note::NoteId;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

const LINK_SCHEME: &str = "notevault://note/";

static MENTION_LINK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"notevault://note/([0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12})")
        .expect("valid mention regex")
});

/// Directed reference from one note body to another note.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Mention {
    pub source: NoteId,
    pub target: NoteId,
}

/// Renders the internal link for a note.
pub fn mention_link(target: NoteId) -> String {
    format!("{LINK_SCHEME}{target}")
}

/// Extracts distinct mention targets from an editor body.
///
/// Bodies are opaque bytes; invalid UTF-8 sequences are skipped, not fatal.
pub fn extract_mentions(body: &[u8]) -> BTreeSet<NoteId> {
    let text = String::from_utf8_lossy(body);
    MENTION_LINK_RE
        .captures_iter(&text)
        .filter_map(|caps| caps.get(1))
        .filter_map(|m| Uuid::parse_str(m.as_str()).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{extract_mentions, mention_link};
    use uuid::Uuid;

    #[test]
    fn extracts_distinct_targets_from_html_body() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let body = format!(
            "<a href=\"{}\">x</a> <a href='{}'>y</a> {}",
            mention_link(a),
            mention_link(b),
            mention_link(a)
        );
        let targets = extract_mentions(body.as_bytes());
        assert_eq!(targets.len(), 2);
        assert!(targets.contains(&a));
        assert!(targets.contains(&b));
    }

    #[test]
    fn ignores_malformed_links() {
        let targets = extract_mentions(b"notevault://note/not-a-uuid \xff\xfe");
        assert!(targets.is_empty());
    }
}
