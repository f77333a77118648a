//! Workspace use-case services.
//!
//! # Responsibility
//! - Orchestrate model, vault and storage calls into use-case level APIs.
//! - Keep host UI layers decoupled from storage details.

pub mod change_log;
pub mod note_service;
pub mod search;

pub use change_log::{Change, ChangeLog};
pub use note_service::{MentionResolution, NoteService, NoteView, ServiceError, ServiceResult};
pub use search::{MentionCandidate, SearchMatch, SearchMatches};
