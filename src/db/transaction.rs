use std::ops::{Deref, DerefMut};

use crate::db::{
    entry::{Entry, HistoryCaps},
    group::Group,
    Times,
};

/// A scoped change set over an entry.
///
/// The transaction edits a deep working copy; the target is only touched by
/// [EntryTransaction::commit], which also updates the modification
/// timestamps, snapshots the pre-commit state into history and applies the
/// history caps. Dropping the transaction without committing leaves the
/// target unchanged. Holding the `&mut` borrow makes a second transaction
/// on the same target impossible.
pub struct EntryTransaction<'a> {
    target: &'a mut Entry,
    work: Entry,
    caps: HistoryCaps,
}

impl<'a> EntryTransaction<'a> {
    pub(crate) fn new(target: &'a mut Entry, caps: HistoryCaps) -> Self {
        let work = target.clone();
        Self { target, work, caps }
    }

    /// Apply the edits to the target entry
    pub fn commit(mut self) {
        let snapshot = self.target.clone();

        let now = Times::now();
        self.work.times.set_last_modification(now);
        self.work.times.set_last_access(now);

        self.work.add_historical_entry(snapshot);
        self.work.prune_history(&self.caps);

        *self.target = self.work;
    }

    /// Explicitly discard the edits. Equivalent to dropping the transaction.
    pub fn rollback(self) {}
}

impl Deref for EntryTransaction<'_> {
    type Target = Entry;

    fn deref(&self) -> &Entry {
        &self.work
    }
}

impl DerefMut for EntryTransaction<'_> {
    fn deref_mut(&mut self) -> &mut Entry {
        &mut self.work
    }
}

impl Entry {
    /// Start a transaction over this entry with the given history caps
    pub fn begin_work(&mut self, caps: HistoryCaps) -> EntryTransaction<'_> {
        EntryTransaction::new(self, caps)
    }
}

/// A scoped change set over a group's own attributes.
///
/// Commit updates the modification timestamps; groups keep no history.
pub struct GroupTransaction<'a> {
    target: &'a mut Group,
    work: Group,
}

impl<'a> GroupTransaction<'a> {
    pub(crate) fn new(target: &'a mut Group) -> Self {
        let work = target.clone();
        Self { target, work }
    }

    pub fn commit(mut self) {
        let now = Times::now();
        self.work.times.set_last_modification(now);
        self.work.times.set_last_access(now);

        *self.target = self.work;
    }

    pub fn rollback(self) {}
}

impl Deref for GroupTransaction<'_> {
    type Target = Group;

    fn deref(&self) -> &Group {
        &self.work
    }
}

impl DerefMut for GroupTransaction<'_> {
    fn deref_mut(&mut self) -> &mut Group {
        &mut self.work
    }
}

impl Group {
    /// Start a transaction over this group's attributes
    pub fn begin_work(&mut self) -> GroupTransaction<'_> {
        GroupTransaction::new(self)
    }
}

#[cfg(test)]
mod transaction_tests {
    use super::*;

    #[test]
    fn commit_applies_edits_and_snapshots_history() {
        let mut entry = Entry::new();
        entry.set_unprotected("Title", "before");
        let before_modification = *entry.times.get_last_modification().unwrap();

        let mut tx = entry.begin_work(HistoryCaps::default());
        tx.set_unprotected("Title", "after");
        tx.commit();

        assert_eq!(entry.get_title(), Some("after"));
        assert_eq!(entry.history_entries().len(), 1);
        assert_eq!(entry.history_entries()[0].get_title(), Some("before"));
        assert!(*entry.times.get_last_modification().unwrap() >= before_modification);
    }

    #[test]
    fn drop_without_commit_leaves_target_unchanged() {
        let mut entry = Entry::new();
        entry.set_unprotected("Title", "before");
        let pristine = entry.clone();

        {
            let mut tx = entry.begin_work(HistoryCaps::default());
            tx.set_unprotected("Title", "never applied");
        }

        assert_eq!(entry, pristine);

        let mut tx = entry.begin_work(HistoryCaps::default());
        tx.set_unprotected("Title", "also never applied");
        tx.rollback();

        assert_eq!(entry, pristine);
    }

    #[test]
    fn commit_respects_history_caps() {
        let mut entry = Entry::new();
        entry.set_unprotected("Title", "v0");

        for i in 1..20 {
            let mut tx = entry.begin_work(HistoryCaps {
                max_items: 3,
                max_size: -1,
                max_age_days: -1,
            });
            tx.set_unprotected("Title", &format!("v{}", i));
            tx.commit();
        }

        assert!(entry.history_entries().len() <= 3);
        assert_eq!(entry.get_title(), Some("v19"));
    }

    #[test]
    fn group_transaction_round_trip() {
        let mut group = Group::new("original");
        let pristine = group.clone();

        {
            let mut tx = group.begin_work();
            tx.name = "edited".to_string();
        }
        assert_eq!(group, pristine);

        let mut tx = group.begin_work();
        tx.name = "edited".to_string();
        tx.commit();
        assert_eq!(group.name, "edited");
    }
}
