//! # Record Lock Table
//!
//! Record and gap locks keyed by `(space, page, record offset)`. The tree
//! engine never edits lock entries directly: every structural change calls
//! one of the `update_*` hooks, which re-map lock positions to wherever
//! the records moved. A lock set on a record therefore follows it through
//! reorganize, split, merge, root raise, and discard; gap locks are
//! inherited by the record that inherits the gap.
//!
//! Offsets are only stable between structural changes, which is exactly
//! the window the hooks close: each hook runs inside the mini-transaction
//! performing the move, before any other thread can observe the pages.

use hashbrown::HashMap;
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::page::{Page, INFIMUM_OFFSET, SUPREMUM_OFFSET};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lock {
    pub trx_id: u64,
    pub gap: bool,
}

type RecLocks = SmallVec<[Lock; 2]>;
type PageLocks = HashMap<u16, RecLocks>;

#[derive(Default)]
pub struct LockTable {
    pages: Mutex<HashMap<(u32, u32), PageLocks>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_rec(&self, space_id: u32, page_no: u32, rec: u16, lock: Lock) {
        let mut pages = self.pages.lock();
        pages
            .entry((space_id, page_no))
            .or_default()
            .entry(rec)
            .or_default()
            .push(lock);
    }

    pub fn locks_on(&self, space_id: u32, page_no: u32, rec: u16) -> Vec<Lock> {
        let pages = self.pages.lock();
        pages
            .get(&(space_id, page_no))
            .and_then(|p| p.get(&rec))
            .map(|l| l.to_vec())
            .unwrap_or_default()
    }

    pub fn page_lock_count(&self, space_id: u32, page_no: u32) -> usize {
        let pages = self.pages.lock();
        pages
            .get(&(space_id, page_no))
            .map(|p| p.values().map(|l| l.len()).sum())
            .unwrap_or(0)
    }

    fn take_page(&self, space_id: u32, page_no: u32) -> PageLocks {
        self.pages
            .lock()
            .remove(&(space_id, page_no))
            .unwrap_or_default()
    }

    fn merge_into(&self, space_id: u32, page_no: u32, locks: PageLocks) {
        if locks.is_empty() {
            return;
        }
        let mut pages = self.pages.lock();
        let dst = pages.entry((space_id, page_no)).or_default();
        for (rec, list) in locks {
            dst.entry(rec).or_default().extend(list);
        }
    }

    fn remap(old: PageLocks, pairs: &[(u16, u16)]) -> (PageLocks, PageLocks) {
        // Splits the old page's lock set into (stays, moves) per the
        // old-offset to new-offset pairs.
        let mut stays = PageLocks::new();
        let mut moves = PageLocks::new();
        let map: HashMap<u16, u16> = pairs.iter().copied().collect();
        for (rec, list) in old {
            match map.get(&rec) {
                Some(&new_rec) => {
                    moves.entry(new_rec).or_default().extend(list);
                }
                None => {
                    stays.entry(rec).or_default().extend(list);
                }
            }
        }
        (stays, moves)
    }

    /// Re-aligns lock positions after a page reorganize: record contents
    /// are unchanged but every heap offset moved.
    pub fn move_reorganize_page(&self, space_id: u32, page_no: u32, pairs: &[(u16, u16)]) {
        let old = self.take_page(space_id, page_no);
        let (stays, moves) = Self::remap(old, pairs);
        // Sentinel locks keep their fixed offsets.
        self.merge_into(space_id, page_no, stays);
        self.merge_into(space_id, page_no, moves);
    }

    /// Root raise: every record of the root moved to the new child page,
    /// and locks on the root infimum (queued there by pessimistic updates)
    /// migrate to the child's infimum.
    pub fn update_root_raise(&self, space_id: u32, root: u32, new_page: u32, pairs: &[(u16, u16)]) {
        let old = self.take_page(space_id, root);
        let (mut stays, moves) = Self::remap(old, pairs);
        if let Some(inf) = stays.remove(&INFIMUM_OFFSET) {
            self.merge_into(space_id, new_page, [(INFIMUM_OFFSET, inf)].into_iter().collect());
        }
        self.merge_into(space_id, root, stays);
        self.merge_into(space_id, new_page, moves);
    }

    /// Split with the new page on the left: the moved records' locks
    /// follow them to the new page.
    pub fn update_split_left(
        &self,
        space_id: u32,
        page: u32,
        new_page: u32,
        pairs: &[(u16, u16)],
    ) {
        let old = self.take_page(space_id, page);
        let (stays, moves) = Self::remap(old, pairs);
        self.merge_into(space_id, page, stays);
        self.merge_into(space_id, new_page, moves);
    }

    /// Split with the new page on the right: moved records' locks follow,
    /// and supremum locks of the old page move to the new rightmost page.
    pub fn update_split_right(
        &self,
        space_id: u32,
        page: u32,
        new_page: u32,
        pairs: &[(u16, u16)],
    ) {
        let old = self.take_page(space_id, page);
        let (mut stays, moves) = Self::remap(old, pairs);
        if let Some(sup) = stays.remove(&SUPREMUM_OFFSET) {
            self.merge_into(
                space_id,
                new_page,
                [(SUPREMUM_OFFSET, sup)].into_iter().collect(),
            );
        }
        self.merge_into(space_id, page, stays);
        self.merge_into(space_id, new_page, moves);
    }

    /// Left merge: the discarded page's record locks move onto the left
    /// sibling; locks on the discarded page's supremum follow to the
    /// sibling's supremum.
    pub fn update_merge_left(
        &self,
        space_id: u32,
        page: u32,
        merge_page: u32,
        pairs: &[(u16, u16)],
    ) {
        let old = self.take_page(space_id, page);
        let (mut stays, moves) = Self::remap(old, pairs);
        if let Some(sup) = stays.remove(&SUPREMUM_OFFSET) {
            self.merge_into(
                space_id,
                merge_page,
                [(SUPREMUM_OFFSET, sup)].into_iter().collect(),
            );
        }
        // Gap locks on the infimum inherit to the sibling's supremum gap.
        if let Some(inf) = stays.remove(&INFIMUM_OFFSET) {
            self.merge_into(
                space_id,
                merge_page,
                [(SUPREMUM_OFFSET, inf)].into_iter().collect(),
            );
        }
        self.merge_into(space_id, merge_page, moves);
        debug_assert!(stays.is_empty(), "merge left leaves locks behind");
    }

    /// Right merge: the discarded page's record locks move onto the right
    /// sibling; infimum locks follow to the sibling's infimum.
    pub fn update_merge_right(
        &self,
        space_id: u32,
        page: u32,
        merge_page: u32,
        pairs: &[(u16, u16)],
    ) {
        let old = self.take_page(space_id, page);
        let (mut stays, moves) = Self::remap(old, pairs);
        if let Some(inf) = stays.remove(&INFIMUM_OFFSET) {
            self.merge_into(
                space_id,
                merge_page,
                [(INFIMUM_OFFSET, inf)].into_iter().collect(),
            );
        }
        if let Some(sup) = stays.remove(&SUPREMUM_OFFSET) {
            self.merge_into(
                space_id,
                merge_page,
                [(SUPREMUM_OFFSET, sup)].into_iter().collect(),
            );
        }
        self.merge_into(space_id, merge_page, moves);
        debug_assert!(stays.is_empty(), "merge right leaves locks behind");
    }

    /// Lift: the only page of a level was copied into its father and
    /// freed; its locks move with the records.
    pub fn update_copy_and_discard(
        &self,
        space_id: u32,
        page: u32,
        father: u32,
        pairs: &[(u16, u16)],
    ) {
        let old = self.take_page(space_id, page);
        let (mut stays, moves) = Self::remap(old, pairs);
        if let Some(inf) = stays.remove(&INFIMUM_OFFSET) {
            self.merge_into(space_id, father, [(INFIMUM_OFFSET, inf)].into_iter().collect());
        }
        if let Some(sup) = stays.remove(&SUPREMUM_OFFSET) {
            self.merge_into(space_id, father, [(SUPREMUM_OFFSET, sup)].into_iter().collect());
        }
        self.merge_into(space_id, father, moves);
    }

    /// Discard of an empty page: all its locks are gap locks by now and
    /// inherit to `heir_rec` on the surviving page.
    pub fn update_discard(&self, space_id: u32, page: u32, heir_page: u32, heir_rec: u16) {
        let old = self.take_page(space_id, page);
        let mut inherited = RecLocks::new();
        for (_, list) in old {
            for lock in list {
                inherited.push(Lock {
                    trx_id: lock.trx_id,
                    gap: true,
                });
            }
        }
        if !inherited.is_empty() {
            let mut locks = PageLocks::new();
            locks.insert(heir_rec, inherited);
            self.merge_into(space_id, heir_page, locks);
        }
    }
}

/// Offset pairs for a reorganize: the same records at the same list
/// positions, before and after the rebuild.
pub fn reorganize_pairs(before: &Page<'_>, after: &Page<'_>) -> Vec<(u16, u16)> {
    before.user_recs().zip(after.user_recs()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lk(trx_id: u64) -> Lock {
        Lock {
            trx_id,
            gap: false,
        }
    }

    #[test]
    fn locks_follow_reorganize() {
        let t = LockTable::new();
        t.lock_rec(0, 5, 100, lk(1));
        t.lock_rec(0, 5, 200, lk(2));

        t.move_reorganize_page(0, 5, &[(100, 80), (200, 92)]);

        assert_eq!(t.locks_on(0, 5, 80), vec![lk(1)]);
        assert_eq!(t.locks_on(0, 5, 92), vec![lk(2)]);
        assert!(t.locks_on(0, 5, 100).is_empty());
    }

    #[test]
    fn split_right_moves_tail_and_supremum() {
        let t = LockTable::new();
        t.lock_rec(0, 5, 100, lk(1));
        t.lock_rec(0, 5, 150, lk(2));
        t.lock_rec(0, 5, SUPREMUM_OFFSET, lk(3));

        // Record at 150 moves to the new right page at offset 80.
        t.update_split_right(0, 5, 6, &[(150, 80)]);

        assert_eq!(t.locks_on(0, 5, 100), vec![lk(1)]);
        assert_eq!(t.locks_on(0, 6, 80), vec![lk(2)]);
        assert_eq!(t.locks_on(0, 6, SUPREMUM_OFFSET), vec![lk(3)]);
        assert!(t.locks_on(0, 5, SUPREMUM_OFFSET).is_empty());
    }

    #[test]
    fn root_raise_migrates_infimum_queue() {
        let t = LockTable::new();
        t.lock_rec(0, 3, INFIMUM_OFFSET, lk(9));
        t.lock_rec(0, 3, 120, lk(1));

        t.update_root_raise(0, 3, 8, &[(120, 84)]);

        assert_eq!(t.locks_on(0, 8, INFIMUM_OFFSET), vec![lk(9)]);
        assert_eq!(t.locks_on(0, 8, 84), vec![lk(1)]);
        assert_eq!(t.page_lock_count(0, 3), 0);
    }

    #[test]
    fn discard_inherits_as_gap_locks() {
        let t = LockTable::new();
        t.lock_rec(0, 7, 90, lk(4));
        t.lock_rec(0, 7, SUPREMUM_OFFSET, lk(5));

        t.update_discard(0, 7, 6, 88);

        let inherited = t.locks_on(0, 6, 88);
        assert_eq!(inherited.len(), 2);
        assert!(inherited.iter().all(|l| l.gap));
        assert_eq!(t.page_lock_count(0, 7), 0);
    }

    #[test]
    fn merge_left_moves_all_locks() {
        let t = LockTable::new();
        t.lock_rec(0, 7, 90, lk(4));
        t.lock_rec(0, 7, SUPREMUM_OFFSET, lk(5));
        t.lock_rec(0, 7, INFIMUM_OFFSET, lk(6));

        t.update_merge_left(0, 7, 6, &[(90, 300)]);

        assert_eq!(t.locks_on(0, 6, 300), vec![lk(4)]);
        assert_eq!(t.page_lock_count(0, 7), 0);
        assert_eq!(t.locks_on(0, 6, SUPREMUM_OFFSET).len(), 2);
    }
}
