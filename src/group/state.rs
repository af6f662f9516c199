use std::sync::atomic::{AtomicI64, Ordering};

use crate::constants::NO_COMMITTED_OFFSET;
use crate::types::{Generation, TopicPartition};

/// Lifecycle of a group member.
///
/// `Created -> Connecting -> Joining -> Stable -> Rebalancing -> Joining -> ...
/// -> Closing -> Closed`. Errors are reported as events and never move the
/// member out of its current state on their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupState {
    Created,
    Connecting,
    Joining,
    Stable,
    Rebalancing,
    Closing,
    Closed,
}

impl GroupState {
    pub fn is_closed(self) -> bool {
        matches!(self, GroupState::Closing | GroupState::Closed)
    }
}

/// The member's view of the current generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Membership {
    pub group_id: String,
    pub generation_id: i32,
    pub member_id: String,
    pub assignment: Vec<TopicPartition>,
}

impl Membership {
    pub fn generation(&self) -> Generation {
        Generation::new(self.generation_id, self.member_id.clone())
    }
}

/// Snapshot of one partition's consumption progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumptionCursor {
    pub next_offset: i64,
    pub high_water_mark: i64,
    /// `-1` until the first successful commit.
    pub last_committed: i64,
}

/// Live cursor shared between a partition's fetch task and the committer.
/// Only the fetch task moves `next_offset`.
#[derive(Debug)]
pub(crate) struct Cursor {
    next_offset: AtomicI64,
    high_water: AtomicI64,
    committed: AtomicI64,
}

impl Cursor {
    /// The high water mark is seeded from the known positions until the
    /// first fetch reports the real one.
    pub(crate) fn new(start: i64, committed: i64) -> Self {
        Self {
            next_offset: AtomicI64::new(start),
            high_water: AtomicI64::new(start.max(committed)),
            committed: AtomicI64::new(committed),
        }
    }

    pub(crate) fn next_offset(&self) -> i64 {
        self.next_offset.load(Ordering::Acquire)
    }

    pub(crate) fn advance(&self, next: i64) {
        self.next_offset.fetch_max(next, Ordering::AcqRel);
    }

    // may move backwards
    pub(crate) fn reset(&self, offset: i64) {
        self.next_offset.store(offset, Ordering::Release);
    }

    pub(crate) fn set_high_water(&self, high_water: i64) {
        self.high_water.store(high_water, Ordering::Release);
    }

    pub(crate) fn mark_committed(&self, offset: i64) {
        self.committed.store(offset, Ordering::Release);
    }

    /// Offset to commit, if any. Unless `force` is set only a cursor that
    /// moved since its last commit qualifies.
    pub(crate) fn pending_commit(&self, force: bool) -> Option<i64> {
        let next = self.next_offset();
        if next < 0 {
            return None;
        }
        (force || next != self.committed.load(Ordering::Acquire)).then_some(next)
    }

    pub(crate) fn snapshot(&self) -> ConsumptionCursor {
        ConsumptionCursor {
            next_offset: self.next_offset(),
            high_water_mark: self.high_water.load(Ordering::Acquire),
            last_committed: self.committed.load(Ordering::Acquire),
        }
    }
}

impl Default for Cursor {
    fn default() -> Self {
        Self::new(0, NO_COMMITTED_OFFSET)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_advanced_cursors_need_committing() {
        let cursor = Cursor::new(4, 4);
        assert_eq!(cursor.pending_commit(false), None);
        assert_eq!(cursor.pending_commit(true), Some(4));
        cursor.advance(6);
        assert_eq!(cursor.pending_commit(false), Some(6));
        cursor.mark_committed(6);
        assert_eq!(cursor.pending_commit(false), None);
    }

    #[test]
    fn advance_never_moves_backwards_but_reset_does() {
        let cursor = Cursor::default();
        cursor.advance(5);
        cursor.advance(3);
        assert_eq!(cursor.next_offset(), 5);
        cursor.reset(2);
        assert_eq!(cursor.next_offset(), 2);
    }

    #[test]
    fn fresh_cursor_never_reports_commits_above_high_water() {
        let resumed = Cursor::new(7, 7).snapshot();
        assert_eq!(resumed.high_water_mark, 7);
        assert!(resumed.last_committed <= resumed.high_water_mark);

        let fresh = Cursor::new(3, NO_COMMITTED_OFFSET).snapshot();
        assert_eq!(fresh.high_water_mark, 3);
    }

    #[test]
    fn snapshot_reports_all_positions() {
        let cursor = Cursor::new(1, NO_COMMITTED_OFFSET);
        cursor.set_high_water(9);
        assert_eq!(
            cursor.snapshot(),
            ConsumptionCursor {
                next_offset: 1,
                high_water_mark: 9,
                last_committed: -1,
            }
        );
    }
}
