//! # Tree Cursor
//!
//! Latched descent from the root to a target level, and the operation
//! drivers that park on a leaf and escalate to structural modification
//! when a page overflows or underflows.
//!
//! ## Latch Intents
//!
//! - `Search` / `Modify`: tree S-latch for the descent, non-leaf pages
//!   buffer-fixed only, target page latched S (reads) or X (writes), tree
//!   latch released once the leaf latch is held.
//! - `ModifyTree`: tree X-latch held for the whole operation; the target
//!   page is X-latched, and at the leaf level both siblings too, since
//!   merge and discard need them.
//! - `ContModifyTree`: the caller already holds the tree X-latch (father
//!   lookups and non-leaf inserts inside a structural operation).
//!
//! ## Operation State Machine
//!
//! A leaf operation either completes on the leaf (`LEAF_OK`), or observes
//! overflow and re-descends pessimistically into a root raise or split, or
//! observes underflow and re-descends into merge, lift, or discard. Every
//! path terminates back at a consistent leaf.

use std::sync::Arc;

use eyre::{bail, ensure, Result};

use crate::mtr::{MiniTransaction, PageLatch};
use crate::page::cursor::{rec_n_fields, search_le, tuple_insert, PageCursor};
use crate::page::{Page, RecStatus, PAGE_NIL};
use crate::records::{rec_get_offsets, DataTuple, Field, IndexSchema};
use crate::storage::buffer::Block;

use super::node_ptr::node_ptr_child;
use super::BTree;

/// Field count of a record by status, re-exported for the tree layer.
pub fn rec_field_count(status: RecStatus, schema: &IndexSchema) -> usize {
    rec_n_fields(status, schema)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatchIntent {
    Search,
    Modify,
    ModifyTree,
    ContModifyTree,
}

pub struct TreeCursor {
    pub block: Arc<Block>,
    pub position: PageCursor,
    pub matched: bool,
    pub left_sibling: Option<Arc<Block>>,
    pub right_sibling: Option<Arc<Block>>,
}

impl BTree<'_> {
    /// Descends to `level` and positions on the last record `<=` tuple.
    pub fn search_to_level(
        &self,
        level: u16,
        tuple: &DataTuple,
        intent: LatchIntent,
        mtr: &mut MiniTransaction,
    ) -> Result<TreeCursor> {
        let latch = self.index.latch();
        match intent {
            LatchIntent::Search | LatchIntent::Modify => mtr.s_latch_tree(latch),
            LatchIntent::ModifyTree => mtr.x_latch_tree(latch),
            LatchIntent::ContModifyTree => {
                ensure!(
                    mtr.has_tree_x(latch),
                    "continued tree modification requires the tree X-latch"
                );
            }
        }

        let space_id = self.index.space_id;
        let mut page_no = self.index.root_page();
        ensure!(page_no != PAGE_NIL, "index {} has no root page", self.index.id);

        let block = loop {
            let block = self.eng.buf.block_get(space_id, page_no);

            let descend = mtr.with_buf_fixed_page(&block, |page| -> Result<Option<u32>> {
                debug_assert_eq!(page.index_id(), self.index.id);
                ensure!(
                    page.level() >= level,
                    "search for level {} descended past level {}",
                    level,
                    page.level()
                );
                if page.level() == level {
                    return Ok(None);
                }
                let out = search_le(&page, &self.index.schema, tuple)?;
                if out.cursor.is_before_first() {
                    bail!(
                        "non-leaf page {} routes below its first node pointer",
                        page.page_no()
                    );
                }
                Ok(Some(node_ptr_child(&page, out.cursor.rec, &self.index.schema)?))
            })?;

            match descend {
                None => break block,
                Some(child) => {
                    mtr.latch_block(&block, PageLatch::BufFix);
                    page_no = child;
                }
            }
        };

        let mut left_sibling = None;
        let mut right_sibling = None;
        match intent {
            LatchIntent::Search => mtr.latch_block(&block, PageLatch::S),
            LatchIntent::Modify => mtr.latch_block(&block, PageLatch::X),
            LatchIntent::ModifyTree | LatchIntent::ContModifyTree => {
                if level == 0 && intent == LatchIntent::ModifyTree {
                    // Merge and discard need both brothers; take them in
                    // left-to-right order.
                    let (prev, next) =
                        mtr.with_buf_fixed_page(&block, |page| (page.prev(), page.next()));
                    if prev != PAGE_NIL {
                        left_sibling =
                            Some(mtr.page_get(&self.eng.buf, space_id, prev, PageLatch::X));
                    }
                    mtr.latch_block(&block, PageLatch::X);
                    if next != PAGE_NIL {
                        right_sibling =
                            Some(mtr.page_get(&self.eng.buf, space_id, next, PageLatch::X));
                    }
                } else {
                    mtr.latch_block(&block, PageLatch::X);
                }
            }
        }

        // With the leaf latched the tree latch is no longer needed for a
        // plain search or record modification.
        if matches!(intent, LatchIntent::Search | LatchIntent::Modify) {
            mtr.release_tree_s(latch);
        }

        let page = mtr.page(&block)?;
        let out = match self.cached_position(&page, tuple, intent) {
            Some(hit) => hit,
            None => {
                let out = search_le(&page, &self.index.schema, tuple)?;
                if level == 0
                    && out.matched
                    && matches!(intent, LatchIntent::Search | LatchIntent::Modify)
                {
                    self.eng.search.remember(
                        space_id,
                        page.page_no(),
                        &tuple.to_payload(),
                        out.cursor.rec,
                    );
                }
                out
            }
        };

        Ok(TreeCursor {
            block: Arc::clone(&block),
            position: out.cursor,
            matched: out.matched,
            left_sibling,
            right_sibling,
        })
    }

    fn cached_position(
        &self,
        page: &Page<'_>,
        tuple: &DataTuple,
        intent: LatchIntent,
    ) -> Option<crate::page::cursor::SearchOutcome> {
        if !matches!(intent, LatchIntent::Search | LatchIntent::Modify) || !page.is_leaf() {
            return None;
        }
        let key = tuple.to_payload();
        let rec = self
            .eng
            .search
            .lookup(self.index.space_id, page.page_no(), &key)?;
        // The cache is only a hint; verify bounds, shape, and content
        // before trusting it.
        let off = rec as usize;
        if off < crate::page::HEAP_START as usize
            || off + crate::page::REC_HEADER_SIZE > crate::page::PAGE_SIZE
        {
            return None;
        }
        let len = page.rec_len(rec) as usize;
        if len < crate::page::REC_HEADER_SIZE
            || off + len > crate::page::PAGE_SIZE
            || !page.rec_is_user(rec)
            || page.rec_payload(rec) != key
        {
            return None;
        }
        Some(crate::page::cursor::SearchOutcome {
            cursor: PageCursor::on(rec),
            matched: true,
        })
    }

    /// The user record before `rec`, crossing to the left sibling when
    /// `rec` is the first on its page. The caller must already hold a
    /// latch on that sibling.
    pub fn get_prev_user_rec(
        &self,
        mtr: &MiniTransaction,
        block: &Arc<Block>,
        rec: u16,
    ) -> Result<Option<(Arc<Block>, u16)>> {
        let page = mtr.page(block)?;
        if let Some(prev) = page.prev_user_rec(rec) {
            return Ok(Some((Arc::clone(block), prev)));
        }
        let prev_no = page.prev();
        if prev_no == PAGE_NIL {
            return Ok(None);
        }
        let prev_block = self.eng.buf.block_get(self.index.space_id, prev_no);
        ensure!(
            mtr.has_page_latch(&prev_block),
            "crossing to page {} without a latch on it",
            prev_no
        );
        let prev_page = mtr.page(&prev_block)?;
        debug_assert_eq!(prev_page.next(), page.page_no());
        debug_assert_eq!(prev_page.level(), page.level());
        Ok(prev_page.last_user_rec().map(|r| (prev_block, r)))
    }

    /// The user record after `rec`, crossing to the right sibling when
    /// `rec` is the last on its page. The caller must already hold a latch
    /// on that sibling.
    pub fn get_next_user_rec(
        &self,
        mtr: &MiniTransaction,
        block: &Arc<Block>,
        rec: u16,
    ) -> Result<Option<(Arc<Block>, u16)>> {
        let page = mtr.page(block)?;
        if let Some(next) = page.next_user_rec(rec) {
            return Ok(Some((Arc::clone(block), next)));
        }
        let next_no = page.next();
        if next_no == PAGE_NIL {
            return Ok(None);
        }
        let next_block = self.eng.buf.block_get(self.index.space_id, next_no);
        ensure!(
            mtr.has_page_latch(&next_block),
            "crossing to page {} without a latch on it",
            next_no
        );
        let next_page = mtr.page(&next_block)?;
        debug_assert_eq!(next_page.prev(), page.page_no());
        debug_assert_eq!(next_page.level(), page.level());
        Ok(next_page.first_user_rec().map(|r| (next_block, r)))
    }

    /// Point lookup. Returns the decoded record, `None` if the key is
    /// absent.
    pub fn search(&self, tuple: &DataTuple) -> Result<Option<DataTuple>> {
        let mut mtr = self.eng.mtr();
        let cur = self.search_to_level(0, tuple, LatchIntent::Search, &mut mtr)?;
        let found = if cur.matched {
            let page = mtr.page(&cur.block)?;
            let payload = page.rec_payload(cur.position.rec);
            let offsets = rec_get_offsets(payload, self.index.schema.n_fields())?;
            let fields = (0..offsets.n_fields())
                .map(|i| match offsets.field(payload, i) {
                    Some(b) => Field::Data(b.to_vec()),
                    None => Field::Null,
                })
                .collect();
            Some(DataTuple::new(fields))
        } else {
            None
        };
        mtr.commit()?;
        Ok(found)
    }

    /// Inserts a tuple, splitting (or raising the root) when the leaf has
    /// no room. Duplicate keys are rejected.
    pub fn insert(&self, tuple: &DataTuple) -> Result<()> {
        ensure!(
            tuple.fields.len() == self.index.schema.n_fields(),
            "tuple has {} fields, index schema has {}",
            tuple.fields.len(),
            self.index.schema.n_fields()
        );

        // Optimistic pass: latch just the leaf.
        {
            let mut mtr = self.eng.mtr();
            let cur = self.search_to_level(0, tuple, LatchIntent::Modify, &mut mtr)?;
            ensure!(!cur.matched, "duplicate key");

            let need = Self::rec_stored_size(tuple);
            let page = mtr.page(&cur.block)?;
            let page_no = page.page_no();
            let fits_now = page.max_insert_size(1) >= need;
            let fits_reorganized = page.max_insert_size_after_reorganize(1) >= need;

            if fits_now || fits_reorganized {
                self.eng.search.drop_page_hash(self.index.space_id, page_no);
                let mut position = cur.position;
                if !fits_now {
                    // The room exists but is fragmented.
                    if self.page_reorganize(&mut mtr, &cur.block)? {
                        let page = mtr.page(&cur.block)?;
                        position = search_le(&page, &self.index.schema, tuple)?.cursor;
                    }
                }
                let inserted = {
                    let mut pm = mtr.page_mut(&cur.block)?;
                    tuple_insert(&mut pm, position, tuple, &self.index.schema)?
                };
                if inserted.is_some() {
                    mtr.commit()?;
                    return Ok(());
                }
                // Only a compressed mirror overflow falls through here.
            }
            mtr.commit()?;
        }

        // Pessimistic pass: the structural mutators may not fail for lack
        // of space, so reserve the worst case up front.
        let space = self.eng.space(self.index.space_id)?;
        let reserved = if self.index.is_ibuf() {
            false
        } else {
            ensure!(
                space.reserve_free_pages(2),
                "out of tablespace in index {}",
                self.index.id
            );
            true
        };

        let mut mtr = self.eng.mtr();
        let mut cur = self.search_to_level(0, tuple, LatchIntent::ModifyTree, &mut mtr)?;
        ensure!(!cur.matched, "duplicate key");

        let result = if cur.block.page_no() == self.index.root_page() {
            self.root_raise_and_insert(&mut mtr, &mut cur, tuple)
        } else {
            self.page_split_and_insert(&mut mtr, &mut cur, tuple)
        };
        if reserved {
            space.release_reservation(2);
        }
        result?;
        mtr.commit()?;
        Ok(())
    }

    /// Deletes the record matching the tuple's key. Returns whether a
    /// record was deleted. Underflowing pages are merged; emptied pages
    /// are discarded.
    pub fn delete(&self, tuple: &DataTuple) -> Result<bool> {
        // Optimistic pass for the common case of a page that stays
        // comfortably filled.
        {
            let mut mtr = self.eng.mtr();
            let cur = self.search_to_level(0, tuple, LatchIntent::Modify, &mut mtr)?;
            if !cur.matched {
                mtr.commit()?;
                return Ok(false);
            }
            let page = mtr.page(&cur.block)?;
            let page_no = page.page_no();
            let is_root = page_no == self.index.root_page();
            let becomes_empty = page.n_recs() == 1;
            let rec_size = page.rec_len(cur.position.rec) as usize;
            let underfull_after =
                page.data_size() - rec_size < Page::free_space_of_empty() / 2;

            if is_root || (!becomes_empty && !underfull_after) {
                self.eng.search.drop_page_hash(self.index.space_id, page_no);
                let mut pm = mtr.page_mut(&cur.block)?;
                pm.delete_rec(cur.position.rec);
                drop(pm);
                mtr.commit()?;
                return Ok(true);
            }
            mtr.commit()?;
        }

        // Pessimistic pass: re-descend with the tree X-latch and shrink
        // the tree as needed.
        let mut mtr = self.eng.mtr();
        let mut cur = self.search_to_level(0, tuple, LatchIntent::ModifyTree, &mut mtr)?;
        if !cur.matched {
            mtr.commit()?;
            return Ok(false);
        }
        self.eng
            .search
            .drop_page_hash(self.index.space_id, cur.block.page_no());

        let (n_recs, is_root) = {
            let page = mtr.page(&cur.block)?;
            (page.n_recs(), page.page_no() == self.index.root_page())
        };
        if n_recs == 1 && !is_root {
            // The whole page goes, last record included; discard locates
            // the father while the record is still there.
            self.discard_page(&mut mtr, &mut cur)?;
            mtr.commit()?;
            return Ok(true);
        }

        {
            let mut pm = mtr.page_mut(&cur.block)?;
            crate::page::cursor::delete_rec(&mut pm, &mut cur.position);
        }
        let underfull = {
            let page = mtr.page(&cur.block)?;
            page.data_size() < Page::free_space_of_empty() / 2
        };
        if !is_root && underfull {
            let _ = self.compress(&mut mtr, &mut cur)?;
        }
        mtr.commit()?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Engine;
    use crate::index::{Index, IndexKind};
    use crate::page::SUPREMUM_OFFSET;

    fn setup(schema: IndexSchema) -> (tempfile::TempDir, Engine, Arc<Index>) {
        let dir = tempfile::tempdir().unwrap();
        let eng = Engine::create(dir.path()).unwrap();
        eng.add_space(0, 256);
        let index = Index::new(1, 0, IndexKind::Regular, schema);
        let tree = BTree::new(&eng, Arc::clone(&index));
        let mut mtr = eng.mtr();
        tree.create(&mut mtr).unwrap().unwrap();
        mtr.commit().unwrap();
        (dir, eng, index)
    }

    fn small_schema() -> IndexSchema {
        IndexSchema::single_fixed_key(4, true)
    }

    fn wide_schema() -> IndexSchema {
        IndexSchema::single_fixed_key(400, true)
    }

    fn key4(k: u32) -> DataTuple {
        DataTuple::from_key(&k.to_be_bytes())
    }

    fn wide_key(k: u32) -> DataTuple {
        let mut bytes = vec![0u8; 400];
        bytes[396..].copy_from_slice(&k.to_be_bytes());
        DataTuple::from_key(&bytes)
    }

    #[test]
    fn search_positions_on_the_last_record_at_most_equal() {
        let (_dir, eng, index) = setup(small_schema());
        let tree = BTree::new(&eng, Arc::clone(&index));
        for k in [10u32, 20, 30] {
            tree.insert(&key4(k)).unwrap();
        }

        let exact_rec = {
            let mut mtr = eng.mtr();
            let cur = tree
                .search_to_level(0, &key4(20), LatchIntent::Search, &mut mtr)
                .unwrap();
            assert!(cur.matched);
            mtr.commit().unwrap();
            cur.position.rec
        };

        let mut mtr = eng.mtr();
        let gap = tree
            .search_to_level(0, &key4(25), LatchIntent::Search, &mut mtr)
            .unwrap();
        assert!(!gap.matched);
        // 25 parks on 20, its insert predecessor.
        assert_eq!(gap.position.rec, exact_rec);

        let below = tree
            .search_to_level(0, &key4(5), LatchIntent::Search, &mut mtr)
            .unwrap();
        assert!(!below.matched);
        assert!(below.position.is_before_first());
        mtr.commit().unwrap();
    }

    #[test]
    fn cached_position_revalidates_before_trusting_a_hint() {
        let (_dir, eng, index) = setup(small_schema());
        let tree = BTree::new(&eng, Arc::clone(&index));
        for k in [10u32, 20, 30, 40, 50] {
            tree.insert(&key4(k)).unwrap();
        }
        assert!(tree.search(&key4(30)).unwrap().is_some());

        let root = index.root_page();
        let key = key4(30).to_payload();
        let good = eng.search.lookup(0, root, &key).unwrap();

        let mut mtr = eng.mtr();
        let block = mtr.page_get(&eng.buf, 0, root, PageLatch::S);
        let page = mtr.page(&block).unwrap();

        // A genuine hint is taken.
        let hit = tree.cached_position(&page, &key4(30), LatchIntent::Search);
        assert!(matches!(hit, Some(out) if out.cursor.rec == good && out.matched));
        // Never on a non-leaf descent or without a latch intent that
        // reads the leaf.
        assert!(tree
            .cached_position(&page, &key4(30), LatchIntent::ModifyTree)
            .is_none());

        // A stale offset pointing into unformatted heap is rejected.
        eng.search.remember(0, root, &key, 9000);
        assert!(tree
            .cached_position(&page, &key4(30), LatchIntent::Search)
            .is_none());
        // So is one aimed at a sentinel.
        eng.search.remember(0, root, &key, SUPREMUM_OFFSET);
        assert!(tree
            .cached_position(&page, &key4(30), LatchIntent::Search)
            .is_none());
        drop(page);
        mtr.commit().unwrap();

        // The full search shrugs the poison off and repairs the entry.
        eng.search.remember(0, root, &key, 9000);
        assert!(tree.search(&key4(30)).unwrap().is_some());
        assert_eq!(eng.search.lookup(0, root, &key), Some(good));
    }

    #[test]
    fn modify_tree_descent_latches_leaf_siblings() {
        let (_dir, eng, index) = setup(wide_schema());
        let tree = BTree::new(&eng, Arc::clone(&index));
        for k in 1..=80u32 {
            tree.insert(&wide_key(k)).unwrap();
        }

        // A middle leaf has brothers on both sides, all X-latched.
        let mut mtr = eng.mtr();
        let cur = tree
            .search_to_level(0, &wide_key(45), LatchIntent::ModifyTree, &mut mtr)
            .unwrap();
        let left = cur.left_sibling.as_ref().expect("middle leaf has a left brother");
        let right = cur.right_sibling.as_ref().expect("middle leaf has a right brother");
        assert!(mtr.has_page_x(left));
        assert!(mtr.has_page_x(&cur.block));
        assert!(mtr.has_page_x(right));
        mtr.commit().unwrap();

        // The leftmost leaf has none on the left.
        let mut mtr = eng.mtr();
        let cur = tree
            .search_to_level(0, &wide_key(1), LatchIntent::ModifyTree, &mut mtr)
            .unwrap();
        assert!(cur.left_sibling.is_none());
        assert!(cur.right_sibling.is_some());
        mtr.commit().unwrap();
    }

    #[test]
    fn duplicate_inserts_and_missing_deletes_are_rejected() {
        let (_dir, eng, index) = setup(small_schema());
        let tree = BTree::new(&eng, Arc::clone(&index));

        tree.insert(&key4(7)).unwrap();
        assert!(tree.insert(&key4(7)).is_err());

        assert!(!tree.delete(&key4(9)).unwrap());
        assert!(tree.delete(&key4(7)).unwrap());
        assert!(tree.search(&key4(7)).unwrap().is_none());
    }

    #[test]
    fn crossing_a_page_boundary_requires_the_sibling_latch() {
        let (_dir, eng, index) = setup(wide_schema());
        let tree = BTree::new(&eng, Arc::clone(&index));
        for k in 1..=80u32 {
            tree.insert(&wide_key(k)).unwrap();
        }

        // A plain search latches only the leaf itself.
        let mut mtr = eng.mtr();
        let cur = tree
            .search_to_level(0, &wide_key(39), LatchIntent::Search, &mut mtr)
            .unwrap();
        assert!(cur.matched);
        {
            let page = mtr.page(&cur.block).unwrap();
            assert_eq!(page.last_user_rec(), Some(cur.position.rec));
            assert_ne!(page.next(), PAGE_NIL);
        }

        // Stepping right would cross to an unlatched brother: refused.
        assert!(tree
            .get_next_user_rec(&mtr, &cur.block, cur.position.rec)
            .is_err());

        // Within the page no brother is involved.
        let first = mtr.page(&cur.block).unwrap().first_user_rec().unwrap();
        let (same_block, next) = tree
            .get_next_user_rec(&mtr, &cur.block, first)
            .unwrap()
            .expect("the first record has an in-page successor");
        assert!(Arc::ptr_eq(&same_block, &cur.block));
        assert_ne!(next, first);

        // At the level's left edge there is simply no predecessor.
        assert!(tree
            .get_prev_user_rec(&mtr, &cur.block, first)
            .unwrap()
            .is_none());
        mtr.commit().unwrap();
    }
}
