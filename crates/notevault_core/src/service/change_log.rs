//! Pending-change bookkeeping between commits.

use crate::model::EntityKind;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Kind of pending change for one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Upsert(EntityKind),
    Delete(EntityKind),
}

/// Entities changed since the last successful commit.
#[derive(Debug, Clone, Default)]
pub struct ChangeLog {
    entries: BTreeMap<Uuid, Change>,
    generation: u64,
}

impl ChangeLog {
    pub fn record_upsert(&mut self, id: Uuid, kind: EntityKind) {
        self.entries.insert(id, Change::Upsert(kind));
        self.generation += 1;
    }

    /// Replaces any pending upsert of `id` with a tombstone.
    pub fn record_delete(&mut self, id: Uuid, kind: EntityKind) {
        self.entries.insert(id, Change::Delete(kind));
        self.generation += 1;
    }

    /// Marks a non-entity change (settings) so the next flush commits.
    pub fn touch(&mut self) {
        self.generation += 1;
    }

    pub fn get(&self, id: Uuid) -> Option<Change> {
        self.entries.get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Monotonic counter bumped by every recorded change.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Forgets every entry; the generation keeps counting.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::{Change, ChangeLog};
    use crate::model::EntityKind;
    use uuid::Uuid;

    #[test]
    fn delete_supersedes_pending_upsert() {
        let mut log = ChangeLog::default();
        let id = Uuid::new_v4();
        log.record_upsert(id, EntityKind::Note);
        log.record_delete(id, EntityKind::Note);
        assert_eq!(log.get(id), Some(Change::Delete(EntityKind::Note)));
        assert_eq!(log.len(), 1);
        assert_eq!(log.generation(), 2);
    }
}
