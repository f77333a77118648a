//! Lazy entity summaries.
//!
//! # Responsibility
//! - Page through folder/note summaries without materializing the whole
//!   result set up front.
//! - Let a cursor restart from the first page.
//!
//! # Invariants
//! - Summaries never carry note bodies; sealed notes carry no title.
//! - Page order is stable: `All` lists folders then notes by id, a folder
//!   scope follows the folder's child order.

use crate::model::{EntityKind, Folder, FolderId, Note, Workspace};
use crate::storage::{StoreError, StoreResult};
use std::collections::VecDeque;
use uuid::Uuid;

/// Which entities a listing covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListScope {
    /// Every folder and note in the workspace.
    All,
    /// Direct children of one folder.
    Folder(FolderId),
}

/// Body-free view of one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntitySummary {
    pub id: Uuid,
    pub kind: EntityKind,
    pub parent_id: Option<FolderId>,
    /// `None` for sealed notes.
    pub title: Option<String>,
    /// Folder is a vault, or note content is sealed.
    pub locked: bool,
    pub pinned: bool,
    pub modified_at: i64,
}

impl EntitySummary {
    pub fn of_folder(folder: &Folder) -> Self {
        Self {
            id: folder.id,
            kind: EntityKind::Folder,
            parent_id: folder.parent_id,
            title: Some(folder.title.clone()),
            locked: folder.is_locked(),
            pinned: false,
            modified_at: folder.modified_at,
        }
    }

    pub fn of_note(note: &Note) -> Self {
        Self {
            id: note.id,
            kind: EntityKind::Note,
            parent_id: Some(note.folder_id),
            title: note.title().map(str::to_string),
            locked: note.content.is_sealed(),
            pinned: note.pinned,
            modified_at: note.modified_at,
        }
    }
}

/// Backend-specific page producer behind a [`SummaryCursor`].
pub trait SummarySource {
    fn fetch_page(
        &self,
        scope: ListScope,
        offset: usize,
        limit: usize,
    ) -> StoreResult<Vec<EntitySummary>>;
}

/// Restartable iterator that fetches one page at a time.
pub struct SummaryCursor<'a> {
    source: Box<dyn SummarySource + 'a>,
    scope: ListScope,
    page_size: usize,
    offset: usize,
    buffer: VecDeque<EntitySummary>,
    exhausted: bool,
    pages_fetched: usize,
}

impl<'a> SummaryCursor<'a> {
    pub fn new(source: Box<dyn SummarySource + 'a>, scope: ListScope, page_size: usize) -> Self {
        Self {
            source,
            scope,
            page_size: page_size.max(1),
            offset: 0,
            buffer: VecDeque::new(),
            exhausted: false,
            pages_fetched: 0,
        }
    }

    pub fn scope(&self) -> ListScope {
        self.scope
    }

    /// Pages fetched since creation or the last restart.
    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }

    /// Rewinds to the first page; the next item re-queries the source.
    pub fn restart(&mut self) {
        self.offset = 0;
        self.buffer.clear();
        self.exhausted = false;
        self.pages_fetched = 0;
    }
}

impl Iterator for SummaryCursor<'_> {
    type Item = StoreResult<EntitySummary>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            match self
                .source
                .fetch_page(self.scope, self.offset, self.page_size)
            {
                Ok(page) => {
                    self.pages_fetched += 1;
                    if page.len() < self.page_size {
                        self.exhausted = true;
                    }
                    self.offset += page.len();
                    self.buffer.extend(page);
                }
                Err(err) => {
                    self.exhausted = true;
                    return Some(Err(err));
                }
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}

/// Summary source over an in-memory workspace snapshot.
pub struct WorkspaceSummaries {
    workspace: Workspace,
}

impl WorkspaceSummaries {
    pub fn new(workspace: Workspace) -> Self {
        Self { workspace }
    }

    fn summarize(&self, id: Uuid) -> Option<EntitySummary> {
        self.workspace
            .folder(id)
            .map(EntitySummary::of_folder)
            .or_else(|| self.workspace.note(id).map(EntitySummary::of_note))
    }
}

impl SummarySource for WorkspaceSummaries {
    fn fetch_page(
        &self,
        scope: ListScope,
        offset: usize,
        limit: usize,
    ) -> StoreResult<Vec<EntitySummary>> {
        match scope {
            ListScope::All => Ok(self
                .workspace
                .folders
                .values()
                .map(EntitySummary::of_folder)
                .chain(self.workspace.notes.values().map(EntitySummary::of_note))
                .skip(offset)
                .take(limit)
                .collect()),
            ListScope::Folder(folder_id) => {
                let folder = self
                    .workspace
                    .folder(folder_id)
                    .ok_or(StoreError::NotFound(folder_id))?;
                Ok(folder
                    .children
                    .iter()
                    .skip(offset)
                    .take(limit)
                    .filter_map(|id| self.summarize(*id))
                    .collect())
            }
        }
    }
}
