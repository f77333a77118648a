//! Vault-aware note access, lazy search and mention autocomplete.
//!
//! # Responsibility
//! - Resolve a note to readable title/body, decrypting only with keys the
//!   caller's session holds.
//! - Drive search and autocomplete without ever surfacing titles of notes
//!   in vaults the session has not unlocked.
//!
//! # Invariants
//! - Matching is case-insensitive; every query word must occur in the
//!   title or the body.
//! - A note whose vault is locked is skipped, never partially reported.

use crate::model::{mention_link, FolderId, Note, NoteContent, NoteId, Workspace};
use crate::vault::{unseal, VaultError, VaultResult, VaultSession};
use std::borrow::Cow;
use std::collections::btree_map::Values;

/// Readable title and body of one note.
pub(crate) struct Readable<'a> {
    pub title: Cow<'a, str>,
    pub body: Cow<'a, [u8]>,
}

/// Opens `note` for reading with the keys held by `session`.
pub(crate) fn read_content<'a>(
    workspace: &Workspace,
    session: &VaultSession,
    note: &'a Note,
) -> VaultResult<Readable<'a>> {
    match &note.content {
        NoteContent::Plain { title, body } => Ok(Readable {
            title: Cow::Borrowed(title.as_str()),
            body: Cow::Borrowed(body.as_slice()),
        }),
        NoteContent::Sealed { blob } => {
            let vault_id = workspace
                .vault_of_note(note.id)
                .ok_or_else(|| VaultError::InvalidParams("sealed note outside a vault".to_string()))?;
            let key = session.key(vault_id).ok_or(VaultError::Locked(vault_id))?;
            let (title, body) = unseal(key, note.id, blob)?;
            Ok(Readable {
                title: Cow::Owned(title),
                body: Cow::Owned(body),
            })
        }
    }
}

/// Splits a query into lowercase words.
pub(crate) fn query_words(query: &str) -> Vec<String> {
    query
        .split_whitespace()
        .map(str::to_lowercase)
        .collect()
}

fn matches_words(words: &[String], title: &str, body: &[u8]) -> bool {
    let title = title.to_lowercase();
    let body = String::from_utf8_lossy(body).to_lowercase();
    words
        .iter()
        .all(|word| title.contains(word.as_str()) || body.contains(word.as_str()))
}

/// One search hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchMatch {
    pub id: NoteId,
    pub folder_id: FolderId,
    pub title: String,
    /// Hit came from an unlocked vault.
    pub in_vault: bool,
}

/// Lazy search over the in-memory workspace.
///
/// Each call to `next` inspects notes until one matches; vault notes are
/// decrypted on the fly.
pub struct SearchMatches<'a> {
    notes: Values<'a, NoteId, Note>,
    workspace: &'a Workspace,
    session: &'a VaultSession,
    words: Vec<String>,
}

impl<'a> SearchMatches<'a> {
    pub(crate) fn new(workspace: &'a Workspace, session: &'a VaultSession, query: &str) -> Self {
        Self {
            notes: workspace.notes.values(),
            workspace,
            session,
            words: query_words(query),
        }
    }
}

impl Iterator for SearchMatches<'_> {
    type Item = SearchMatch;

    fn next(&mut self) -> Option<Self::Item> {
        if self.words.is_empty() {
            return None;
        }
        loop {
            let note = self.notes.next()?;
            let Ok(readable) = read_content(self.workspace, self.session, note) else {
                continue;
            };
            if matches_words(&self.words, &readable.title, &readable.body) {
                return Some(SearchMatch {
                    id: note.id,
                    folder_id: note.folder_id,
                    title: readable.title.into_owned(),
                    in_vault: note.content.is_sealed(),
                });
            }
        }
    }
}

/// Mention autocomplete suggestion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MentionCandidate {
    pub id: NoteId,
    pub title: String,
    /// Link to embed in the editor body.
    pub link: String,
}

/// Notes whose title contains `fragment`, sorted by title.
pub(crate) fn autocomplete(
    workspace: &Workspace,
    session: &VaultSession,
    fragment: &str,
    limit: usize,
) -> Vec<MentionCandidate> {
    let needle = fragment.trim().to_lowercase();
    let mut candidates: Vec<MentionCandidate> = workspace
        .notes
        .values()
        .filter_map(|note| {
            let readable = read_content(workspace, session, note).ok()?;
            if !readable.title.to_lowercase().contains(&needle) {
                return None;
            }
            Some(MentionCandidate {
                id: note.id,
                title: readable.title.into_owned(),
                link: mention_link(note.id),
            })
        })
        .collect();
    candidates.sort_by(|a, b| {
        a.title
            .to_lowercase()
            .cmp(&b.title.to_lowercase())
            .then(a.id.cmp(&b.id))
    });
    candidates.truncate(limit);
    candidates
}

#[cfg(test)]
mod tests {
    use super::{autocomplete, query_words, SearchMatches};
    use crate::model::{Folder, Note, Workspace};
    use crate::vault::VaultSession;

    fn workspace() -> Workspace {
        let mut ws = Workspace::new();
        let folder = Folder::new(Some(ws.root_id), "Work");
        let folder_id = folder.id;
        ws.insert_folder(folder);
        ws.insert_note(Note::new(folder_id, "Quarterly Plan", b"budget and hiring".to_vec()));
        ws.insert_note(Note::new(folder_id, "Groceries", b"milk, Budget eggs".to_vec()));
        ws
    }

    #[test]
    fn all_words_must_match_case_insensitively() {
        let ws = workspace();
        let session = VaultSession::new();
        let hits: Vec<_> = SearchMatches::new(&ws, &session, "BUDGET hiring").collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "Quarterly Plan");

        assert_eq!(SearchMatches::new(&ws, &session, "budget").count(), 2);
        assert_eq!(SearchMatches::new(&ws, &session, "   ").count(), 0);
    }

    #[test]
    fn autocomplete_sorts_and_limits() {
        let ws = workspace();
        let session = VaultSession::new();
        let all = autocomplete(&ws, &session, "", 10);
        assert_eq!(all[0].title, "Groceries");
        assert_eq!(autocomplete(&ws, &session, "pla", 10).len(), 1);
        assert_eq!(autocomplete(&ws, &session, "", 1).len(), 1);
    }

    #[test]
    fn words_are_lowercased() {
        assert_eq!(query_words(" Foo  BAR "), vec!["foo", "bar"]);
    }
}
