//! # Structural Mutation
//!
//! Root raise, split-and-insert, merge (compress), lift-up, and discard:
//! every operation that changes the shape of the tree rather than just a
//! page's contents. All of them run under the tree X-latch and may not
//! fail halfway — callers reserve the worst-case page count before
//! entering, and every record movement has a fallback that cannot fail
//! (byte copy plus range deletes).
//!
//! ## Split Point Heuristics
//!
//! The insert hint (`last_insert` in the page header) drives the split
//! choice:
//!
//! - inserts marching right (the hint equals the insert position) split
//!   just past the insert point, keeping one record behind so sequential
//!   inserts keep their cached position on the old page;
//! - inserts marching left mirror that to split leftward;
//! - otherwise the page splits at the middle of the slot directory;
//! - after a failed attempt, a "sure" split point is computed from the
//!   actual record sizes so the tuple provably fits its half.
//!
//! ## Latch Release Inside a Split
//!
//! Once `attach_half_pages` has the parent pointer and the level links
//! consistent, a leaf split that will fit its tuple (and has no
//! compressed mirror) releases the tree X-latch before moving records:
//! the tree is already structurally sound, and the record movement is
//! page-local work.

use std::cmp::Ordering;
use std::sync::Arc;

use eyre::{ensure, eyre, Result};

use crate::mtr::{MiniTransaction, PageLatch};
use crate::page::cursor::{rec_cmp_tuple, search_le, tuple_insert, PageCursor};
use crate::page::ops::{
    copy_rec_list_end, copy_rec_list_start, delete_rec_list_end, delete_rec_list_start,
    move_rec_list_end, move_rec_list_start, zip_page_copy,
};
use crate::page::{Page, PageZip, INFIMUM_OFFSET, PAGE_NIL, SUPREMUM_OFFSET};
use crate::records::{DataTuple, Field};
use crate::storage::buffer::Block;
use crate::storage::space::AllocDirection;

use super::cursor::TreeCursor;
use super::BTree;

/// The chosen first record of the upper half-page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SplitRec {
    /// Split in front of this record.
    At(u16),
    /// The tuple to be inserted becomes the first record on the upper
    /// half.
    NewTuple,
}

impl BTree<'_> {
    /// Right-convergence heuristic: if this insert lands right after the
    /// previous one, assume an ascending workload and split just past the
    /// insert point, keeping one record on the old page so cached search
    /// positions stay usable.
    fn split_rec_to_right(&self, page: &Page<'_>, ins_rec: u16) -> Option<SplitRec> {
        let last = page.last_insert();
        if last == 0 || last != ins_rec {
            return None;
        }
        let next = page.rec_next(ins_rec);
        if next == SUPREMUM_OFFSET {
            return Some(SplitRec::NewTuple);
        }
        let next_next = page.rec_next(next);
        if next_next == SUPREMUM_OFFSET {
            return Some(SplitRec::NewTuple);
        }
        Some(SplitRec::At(next_next))
    }

    /// Left-convergence heuristic, the mirror image. When the convergence
    /// point is in the middle of the page the record just before the new
    /// insert moves too; otherwise repeated left splits would shuffle the
    /// same small records page to page.
    fn split_rec_to_left(&self, page: &Page<'_>, ins_rec: u16) -> Option<SplitRec> {
        let last = page.last_insert();
        if last == 0 || page.rec_next(ins_rec) != last {
            return None;
        }
        let first_user = page.rec_next(INFIMUM_OFFSET);
        if ins_rec != INFIMUM_OFFSET && ins_rec != first_user {
            Some(SplitRec::At(ins_rec))
        } else {
            Some(SplitRec::At(last))
        }
    }

    /// Computes a split record such that the tuple certainly fits on its
    /// half-page. Walks the records (with the tuple spliced in at the
    /// cursor) accumulating reserved space until half the total is
    /// covered.
    fn sure_split_rec(
        &self,
        page: &Page<'_>,
        zip_cap: Option<usize>,
        ins_rec: u16,
        tuple: &DataTuple,
    ) -> SplitRec {
        let insert_size = Self::rec_stored_size(tuple);
        let mut free_space = Page::free_space_of_empty();
        if let Some(cap) = zip_cap {
            let zip_free = PageZip::empty_size(self.index.schema.n_fields(), cap);
            if free_space > zip_free {
                free_space = zip_free;
                // One record on a compressed page is a caller
                // precondition; the estimator is not exact below that.
                debug_assert!(insert_size <= free_space);
            }
        }

        let total_data = page.data_size() + insert_size;
        let total_n = page.n_recs() as usize + 1;
        debug_assert!(total_n >= 2);
        let total_space = total_data + 2 * total_n;

        // The records as they would read after the insert.
        let mut items: Vec<(SplitRec, usize)> = Vec::with_capacity(total_n);
        if ins_rec == INFIMUM_OFFSET {
            items.push((SplitRec::NewTuple, insert_size));
        }
        for off in page.user_recs() {
            items.push((SplitRec::At(off), page.rec_len(off) as usize));
            if off == ins_rec {
                items.push((SplitRec::NewTuple, insert_size));
            }
        }

        let mut included = 0usize;
        let mut n = 0usize;
        let mut idx = 0usize;
        loop {
            included += items[idx].1;
            n += 1;
            if included + 2 * n >= total_space / 2 || idx + 1 >= items.len() {
                break;
            }
            idx += 1;
        }

        // If everything included fits on the left page, the following
        // record opens the right half instead.
        if included + 2 * n <= free_space && idx + 1 < items.len() {
            idx += 1;
        }
        items[idx].0
    }

    /// Whether the tuple will fit on its half-page once the records on the
    /// other half are gone.
    fn insert_fits(
        &self,
        page: &Page<'_>,
        ins_rec: u16,
        split: SplitRec,
        tuple: &DataTuple,
    ) -> Result<bool> {
        let insert_size = Self::rec_stored_size(tuple);
        let free_space = Page::free_space_of_empty();

        let mut total_data = page.data_size() + insert_size;
        let mut total_n = page.n_recs() as usize + 1;

        // The records from `rec` to `end_rec` leave for the other half.
        let (mut rec, end_rec) = match split {
            SplitRec::NewTuple => (page.rec_next(INFIMUM_OFFSET), page.rec_next(ins_rec)),
            SplitRec::At(off) => {
                if rec_cmp_tuple(page, off, tuple, &self.index.schema)? != Ordering::Greater {
                    // Tuple goes to the upper half; the lower keeps the
                    // records before the split point.
                    (page.rec_next(INFIMUM_OFFSET), off)
                } else {
                    (off, SUPREMUM_OFFSET)
                }
            }
        };

        if total_data + 2 * total_n <= free_space {
            return Ok(true);
        }

        while rec != end_rec && rec != SUPREMUM_OFFSET {
            total_data -= page.rec_len(rec) as usize;
            total_n -= 1;
            if total_data + 2 * total_n <= free_space {
                return Ok(true);
            }
            rec = page.rec_next(rec);
        }
        Ok(false)
    }

    fn node_ptr_from_tuple(&self, tuple: &DataTuple, child_page_no: u32) -> DataTuple {
        let schema = &self.index.schema;
        let mut fields: Vec<Field> = tuple.fields[..schema.n_uniq].to_vec();
        fields.push(Field::Data(child_page_no.to_be_bytes().to_vec()));
        DataTuple::new(fields).with_n_cmp(schema.n_uniq)
    }

    /// Wires a freshly split pair into the tree: rewrites the parent
    /// pointer (downward split), inserts the upper half's node pointer one
    /// level up (which may cascade into another split), and fixes the
    /// doubly-linked level list. The level is re-set on both halves
    /// explicitly; a compressed mirror requires it before the first
    /// insert on a non-leaf page.
    fn attach_half_pages(
        &self,
        mtr: &mut MiniTransaction,
        block: &Arc<Block>,
        new_block: &Arc<Block>,
        split: SplitRec,
        tuple: &DataTuple,
        direction: AllocDirection,
    ) -> Result<()> {
        let (page_no, new_page_no, level, prev_no, next_no) = {
            let page = mtr.page(block)?;
            (
                page.page_no(),
                mtr.page(new_block)?.page_no(),
                page.level(),
                page.prev(),
                page.next(),
            )
        };

        let (lower_no, upper_no) = match direction {
            AllocDirection::Down => (new_page_no, page_no),
            _ => (page_no, new_page_no),
        };

        if direction == AllocDirection::Down {
            // The old parent pointer must route to the new lower half.
            let (father_block, father_rec) = self.father_node_ptr(mtr, block)?;
            self.node_ptr_set_child_page_no(mtr, &father_block, father_rec, lower_no)?;
        }

        let np_upper = match split {
            SplitRec::At(off) => {
                let page = mtr.page(block)?;
                self.build_node_ptr(&page, off, upper_no)?
            }
            SplitRec::NewTuple => self.node_ptr_from_tuple(tuple, upper_no),
        };

        // May cascade into a split on the level above.
        self.insert_on_non_leaf_level(mtr, level + 1, &np_upper)?;

        if prev_no != PAGE_NIL {
            let prev_block = mtr.page_get(&self.eng.buf, self.index.space_id, prev_no, PageLatch::X);
            debug_assert_eq!(mtr.page(&prev_block)?.next(), page_no);
            mtr.page_mut(&prev_block)?.set_next(lower_no);
        }
        if next_no != PAGE_NIL {
            let next_block = mtr.page_get(&self.eng.buf, self.index.space_id, next_no, PageLatch::X);
            debug_assert_eq!(mtr.page(&next_block)?.prev(), page_no);
            mtr.page_mut(&next_block)?.set_prev(upper_no);
        }

        let (lower_block, upper_block) = match direction {
            AllocDirection::Down => (new_block, block),
            _ => (block, new_block),
        };
        {
            let mut pm = mtr.page_mut(lower_block)?;
            pm.set_prev(prev_no);
            pm.set_next(upper_no);
            pm.set_level(level);
        }
        {
            let mut pm = mtr.page_mut(upper_block)?;
            pm.set_prev(lower_no);
            pm.set_next(next_no);
            pm.set_level(level);
        }
        Ok(())
    }

    /// Raises the tree one level by moving the root's records to a fresh
    /// page, rebuilding the root as a single node pointer to it, and
    /// splitting that child to make room for the tuple. The caller must
    /// have reserved enough free pages: this operation cannot be
    /// reversed, so it must never fail midway.
    pub fn root_raise_and_insert(
        &self,
        mtr: &mut MiniTransaction,
        cursor: &mut TreeCursor,
        tuple: &DataTuple,
    ) -> Result<u16> {
        let root_block = Arc::clone(&cursor.block);
        let root_no = root_block.page_no();
        ensure!(
            root_no == self.index.root_page(),
            "root raise invoked on page {}, the root is {}",
            root_no,
            self.index.root_page()
        );
        ensure!(
            mtr.has_tree_x(self.index.latch()),
            "root raise requires the tree X-latch"
        );
        debug_assert!(mtr.has_page_x(&root_block));

        let space_id = self.index.space_id;
        self.eng.search.drop_page_hash(space_id, root_no);

        let level = mtr.page(&root_block)?.level();
        let new_block = self
            .page_alloc(mtr, 0, AllocDirection::NoDirection, level)?
            .ok_or_else(|| eyre!("root raise could not allocate: reservation missing"))?;
        let new_page_no = new_block.page_no();
        self.page_create(mtr, &new_block, level)?;
        {
            let mut pm = mtr.page_mut(&new_block)?;
            pm.set_prev(PAGE_NIL);
            pm.set_next(PAGE_NIL);
        }

        // Copy the whole root across, byte-for-byte if the compressed
        // mirror refuses the record copy.
        let pairs = match copy_rec_list_end(mtr, &new_block, &root_block, INFIMUM_OFFSET)? {
            Some(copied) => copied.pairs,
            None => {
                zip_page_copy(mtr, &new_block, &root_block)?;
                let page = mtr.page(&new_block)?;
                page.user_recs().map(|off| (off, off)).collect()
            }
        };

        // Pessimistic updates park lock queues on the root infimum; they
        // migrate with everything else.
        self.eng
            .locks
            .update_root_raise(space_id, root_no, new_page_no, &pairs);

        let mut np = {
            let page = mtr.page(&new_block)?;
            let first = page
                .first_user_rec()
                .ok_or_else(|| eyre!("root raise on a rootless record list"))?;
            self.build_node_ptr(&page, first, new_page_no)?
        };
        // No lower limit exists for keys in the leftmost node of a level.
        np.min_rec = true;

        // Rebuild the root one level up, holding just the node pointer.
        {
            let mut pm = mtr.page_mut(&root_block)?;
            pm.create(self.index.is_comp());
            pm.set_level(level + 1);
            pm.set_prev(PAGE_NIL);
            pm.set_next(PAGE_NIL);
        }
        root_block.set_check_index_on_flush();
        {
            let mut pm = mtr.page_mut(&root_block)?;
            let rec = tuple_insert(&mut pm, PageCursor::before_first(), &np, &self.index.schema)?;
            ensure!(
                rec.is_some(),
                "the root must fit its only node pointer after a raise"
            );
        }

        self.eng.ibuf_reset_free_bits(space_id, new_page_no);

        // Reposition on the child and split it to place the tuple.
        {
            let page = mtr.page(&new_block)?;
            cursor.position = search_le(&page, &self.index.schema, tuple)?.cursor;
        }
        cursor.block = new_block;
        self.page_split_and_insert(mtr, cursor, tuple)
    }

    /// Splits the cursor's page and inserts the tuple on the correct
    /// half. Requires the tree X-latch (released inside once it is safe)
    /// and two reserved pages. Returns the offset of the inserted record.
    pub fn page_split_and_insert(
        &self,
        mtr: &mut MiniTransaction,
        cursor: &mut TreeCursor,
        tuple: &DataTuple,
    ) -> Result<u16> {
        let space_id = self.index.space_id;
        let mut n_iterations = 0u32;

        loop {
            ensure!(
                mtr.has_tree_x(self.index.latch()),
                "split requires the tree X-latch"
            );
            let block = Arc::clone(&cursor.block);
            debug_assert!(mtr.has_page_x(&block));

            let (page_no, level, n_recs, zip_cap) = {
                let frame = mtr.frame(&block)?;
                let page = Page::from_bytes(&frame.bytes[..])?;
                (
                    page.page_no(),
                    page.level(),
                    page.n_recs(),
                    frame.zip.as_ref().map(|z| z.cap()),
                )
            };
            ensure!(n_recs >= 1, "cannot split a page with no records");

            // 1. Decide the split record and direction.
            let (direction, hint_page_no, split) = {
                let page = mtr.page(&block)?;
                if n_iterations > 0 {
                    (
                        AllocDirection::Up,
                        page_no + 1,
                        self.sure_split_rec(&page, zip_cap, cursor.position.rec, tuple),
                    )
                } else if let Some(split) = self.split_rec_to_right(&page, cursor.position.rec) {
                    (AllocDirection::Up, page_no + 1, split)
                } else if let Some(split) = self.split_rec_to_left(&page, cursor.position.rec) {
                    (AllocDirection::Down, page_no.saturating_sub(1), split)
                } else {
                    let middle = page.middle_rec().expect("page has at least one record");
                    (AllocDirection::Up, page_no + 1, SplitRec::At(middle))
                }
            };

            // Never split in front of the minus-infinity record; the flag
            // must stay with the leftmost page of the level.
            let split = {
                let page = mtr.page(&block)?;
                match split {
                    SplitRec::At(off)
                        if Some(off) == page.first_user_rec() && page.rec_is_min_rec(off) =>
                    {
                        match page.next_user_rec(off) {
                            Some(next) => SplitRec::At(next),
                            None => SplitRec::NewTuple,
                        }
                    }
                    other => other,
                }
            };

            // 2. Allocate the new half. The caller reserved the pages, so
            // failure here is a broken contract, not an error to handle.
            let new_block = self
                .page_alloc(mtr, hint_page_no, direction, level)?
                .ok_or_else(|| eyre!("split could not allocate: reservation missing"))?;
            let new_page_no = new_block.page_no();
            self.page_create(mtr, &new_block, level)?;

            // 3. The first record to live on the upper half.
            let move_limit = match split {
                SplitRec::At(off) => off,
                SplitRec::NewTuple => mtr.page(&block)?.rec_next(cursor.position.rec),
            };

            // 4. Tree structure first: parents and level links.
            self.attach_half_pages(mtr, &block, &new_block, split, tuple, direction)?;

            // 5. The tree latch can go early if the record movement below
            // cannot fail and the insert is leaf-local.
            let (insert_left, insert_will_fit) = {
                let page = mtr.page(&block)?;
                let insert_left = match split {
                    SplitRec::At(off) => {
                        rec_cmp_tuple(&page, off, tuple, &self.index.schema)? == Ordering::Greater
                    }
                    SplitRec::NewTuple => false,
                };
                (
                    insert_left,
                    self.insert_fits(&page, cursor.position.rec, split, tuple)?,
                )
            };
            if insert_will_fit && level == 0 && zip_cap.is_none() {
                mtr.release_tree_x(self.index.latch());
            }

            // 6. Move the records.
            self.eng.search.drop_page_hash(space_id, page_no);
            let pairs: Vec<(u16, u16)> = match direction {
                AllocDirection::Down => {
                    match move_rec_list_start(mtr, &new_block, &block, move_limit)? {
                        Some(copied) => copied.pairs,
                        None => {
                            // Recompression failed: byte-copy, then carve
                            // both pages down. Deletion cannot fail.
                            zip_page_copy(mtr, &new_block, &block)?;
                            delete_rec_list_end(mtr, &new_block, move_limit)?;
                            let moved = delete_rec_list_start(mtr, &block, move_limit)?;
                            moved.into_iter().map(|off| (off, off)).collect()
                        }
                    }
                }
                _ => {
                    if move_limit == SUPREMUM_OFFSET {
                        // The upper half starts empty; only the new tuple
                        // will live there.
                        Vec::new()
                    } else {
                        match move_rec_list_end(mtr, &new_block, &block, move_limit)? {
                            Some(copied) => copied.pairs,
                            None => {
                                zip_page_copy(mtr, &new_block, &block)?;
                                delete_rec_list_start(mtr, &new_block, move_limit)?;
                                let moved = delete_rec_list_end(mtr, &block, move_limit)?;
                                moved.into_iter().map(|off| (off, off)).collect()
                            }
                        }
                    }
                }
            };

            // 7. Record locks follow the moved records.
            let (left_block, right_block) = match direction {
                AllocDirection::Down => (&new_block, &block),
                _ => (&block, &new_block),
            };
            match direction {
                AllocDirection::Down => {
                    self.eng
                        .locks
                        .update_split_left(space_id, page_no, new_page_no, &pairs)
                }
                _ => self
                    .eng
                    .locks
                    .update_split_right(space_id, page_no, new_page_no, &pairs),
            }

            // 8. Reposition on the correct half and insert.
            let insert_block = if insert_left {
                Arc::clone(left_block)
            } else {
                Arc::clone(right_block)
            };
            {
                let page = mtr.page(&insert_block)?;
                cursor.position = search_le(&page, &self.index.schema, tuple)?.cursor;
            }
            cursor.block = Arc::clone(&insert_block);

            let inserted = {
                let mut pm = mtr.page_mut(&insert_block)?;
                tuple_insert(&mut pm, cursor.position, tuple, &self.index.schema)?
            };
            if let Some(rec) = inserted {
                self.eng.ibuf_update_free_bits_for_two_pages(
                    space_id,
                    &mtr.page(left_block)?,
                    &mtr.page(right_block)?,
                );
                cursor.position = PageCursor::on(rec);
                return Ok(rec);
            }

            // 9. No fit: reorganize the target half and retry once.
            if self.page_reorganize(mtr, &insert_block)? {
                {
                    let page = mtr.page(&insert_block)?;
                    cursor.position = search_le(&page, &self.index.schema, tuple)?.cursor;
                }
                let inserted = {
                    let mut pm = mtr.page_mut(&insert_block)?;
                    tuple_insert(&mut pm, cursor.position, tuple, &self.index.schema)?
                };
                if let Some(rec) = inserted {
                    self.eng.ibuf_update_free_bits_for_two_pages(
                        space_id,
                        &mtr.page(left_block)?,
                        &mtr.page(right_block)?,
                    );
                    cursor.position = PageCursor::on(rec);
                    return Ok(rec);
                }
            }

            // Still no fit: restart with a sure split. Only a compressed
            // mirror can push the loop past its second round.
            self.eng.ibuf_reset_free_bits(space_id, new_page_no);
            n_iterations += 1;
            debug_assert!(n_iterations < 2 || zip_cap.is_some());
            debug_assert!(!insert_will_fit || zip_cap.is_some());
        }
    }

    /// Unlinks a page from the doubly-linked list of its level.
    fn level_list_remove(&self, mtr: &mut MiniTransaction, block: &Arc<Block>) -> Result<()> {
        debug_assert!(mtr.has_page_x(block));
        let (page_no, prev_no, next_no) = {
            let page = mtr.page(block)?;
            (page.page_no(), page.prev(), page.next())
        };

        if prev_no != PAGE_NIL {
            let prev_block = mtr.page_get(&self.eng.buf, self.index.space_id, prev_no, PageLatch::X);
            debug_assert_eq!(mtr.page(&prev_block)?.next(), page_no);
            mtr.page_mut(&prev_block)?.set_next(next_no);
        }
        if next_no != PAGE_NIL {
            let next_block = mtr.page_get(&self.eng.buf, self.index.space_id, next_no, PageLatch::X);
            debug_assert_eq!(mtr.page(&next_block)?.prev(), page_no);
            mtr.page_mut(&next_block)?.set_prev(prev_no);
        }
        Ok(())
    }

    /// Moves the records of the only page on its level up into the father,
    /// reducing the tree height by one. The page must not be empty.
    fn lift_page_up(&self, mtr: &mut MiniTransaction, block: &Arc<Block>) -> Result<()> {
        let space_id = self.index.space_id;
        let (page_no, page_level) = {
            let page = mtr.page(block)?;
            ensure!(
                page.prev() == PAGE_NIL && page.next() == PAGE_NIL,
                "lift of page {} which still has siblings",
                page.page_no()
            );
            (page.page_no(), page.level())
        };
        debug_assert!(mtr.has_page_x(block));

        let (father_block, _) = self.father_node_ptr(mtr, block)?;
        let father_no = father_block.page_no();

        self.eng.search.drop_page_hash(space_id, page_no);

        self.page_empty(mtr, &father_block)?;
        // The level goes down before the first insert; compressed-page
        // re-emission demands it on non-leaf pages.
        mtr.page_mut(&father_block)?.set_level(page_level);

        let pairs = match copy_rec_list_end(mtr, &father_block, block, INFIMUM_OFFSET)? {
            Some(copied) => copied.pairs,
            None => {
                zip_page_copy(mtr, &father_block, block)?;
                let page = mtr.page(&father_block)?;
                page.user_recs().map(|off| (off, off)).collect()
            }
        };
        self.eng
            .locks
            .update_copy_and_discard(space_id, page_no, father_no, &pairs);

        self.page_free(mtr, block)?;

        self.eng.ibuf_reset_free_bits(space_id, father_no);

        if cfg!(debug_assertions) {
            mtr.page(&father_block)?.validate_structure()?;
            debug_assert!(self.check_node_ptr(mtr, &father_block)?);
        }
        Ok(())
    }

    /// Merges the cursor's page into a sibling when its records fit there:
    /// left sibling preferred, right as fallback, lift-up when the page is
    /// alone on its level. Returns `false` when no merge is possible and
    /// the caller keeps the page.
    pub fn compress(&self, mtr: &mut MiniTransaction, cursor: &mut TreeCursor) -> Result<bool> {
        let block = Arc::clone(&cursor.block);
        let space_id = self.index.space_id;
        ensure!(
            mtr.has_tree_x(self.index.latch()),
            "merge requires the tree X-latch"
        );
        debug_assert!(mtr.has_page_x(&block));

        let (page_no, left_no, right_no, n_recs, data_size) = {
            let page = mtr.page(&block)?;
            ensure!(
                page.n_recs() >= 1,
                "merge of an empty page: discard it instead"
            );
            ensure!(
                page.page_no() != self.index.root_page(),
                "the root page cannot be merged"
            );
            (
                page.page_no(),
                page.prev(),
                page.next(),
                page.n_recs() as usize,
                page.data_size(),
            )
        };

        let (father_block, father_rec) = self.father_node_ptr(mtr, &block)?;

        // Prefer the left sibling; it inherits the locks most cheaply.
        let is_left = left_no != PAGE_NIL;
        let merge_block = if is_left {
            mtr.page_get(&self.eng.buf, space_id, left_no, PageLatch::X)
        } else if right_no != PAGE_NIL {
            mtr.page_get(&self.eng.buf, space_id, right_no, PageLatch::X)
        } else {
            // Alone on its level: the records go up, not sideways.
            self.lift_page_up(mtr, &block)?;
            return Ok(true);
        };
        let merge_no = merge_block.page_no();
        {
            let merge_page = mtr.page(&merge_block)?;
            if is_left {
                debug_assert_eq!(merge_page.next(), page_no);
            } else {
                debug_assert_eq!(merge_page.prev(), page_no);
            }
            debug_assert_eq!(merge_page.is_comp(), self.index.is_comp());
        }

        // Room check: records must fit even at the reorganized bound, and
        // the sibling is reorganized first if its contiguous space is
        // short.
        let max_ins_reorg = mtr
            .page(&merge_block)?
            .max_insert_size_after_reorganize(n_recs);
        if data_size > max_ins_reorg {
            return Ok(false);
        }
        let mut max_ins = mtr.page(&merge_block)?.max_insert_size(n_recs);
        if data_size > max_ins {
            if !self.page_reorganize(mtr, &merge_block)? {
                return Ok(false);
            }
            max_ins = mtr.page(&merge_block)?.max_insert_size(n_recs);
            debug_assert_eq!(max_ins, max_ins_reorg);
            if data_size > max_ins {
                return Ok(false);
            }
        }

        if is_left {
            let Some(copied) = copy_rec_list_start(mtr, &merge_block, &block, SUPREMUM_OFFSET)?
            else {
                return Ok(false);
            };
            self.eng.search.drop_page_hash(space_id, page_no);
            self.level_list_remove(mtr, &block)?;
            self.node_ptr_delete(mtr, &block)?;
            self.eng
                .locks
                .update_merge_left(space_id, page_no, merge_no, &copied.pairs);
        } else {
            // The compressed re-emission of the sink requires prev to read
            // as NIL while the leftmost records (and their min-rec mark)
            // arrive; save the real value around the copy.
            let merge_has_zip = mtr.frame(&merge_block)?.zip.is_some();
            let saved_prev = mtr.page(&merge_block)?.prev();
            if merge_has_zip {
                mtr.page_mut(&merge_block)?.set_prev(PAGE_NIL);
            }

            let copied = copy_rec_list_end(mtr, &merge_block, &block, INFIMUM_OFFSET)?;
            let Some(copied) = copied else {
                if merge_has_zip {
                    mtr.page_mut(&merge_block)?.set_prev(saved_prev);
                }
                return Ok(false);
            };
            if merge_has_zip {
                mtr.page_mut(&merge_block)?.set_prev(saved_prev);
            }

            self.eng.search.drop_page_hash(space_id, page_no);
            self.level_list_remove(mtr, &block)?;

            // The old pointer to this page now routes to the survivor; the
            // survivor's own pointer is the one to delete.
            self.node_ptr_set_child_page_no(mtr, &father_block, father_rec, right_no)?;
            self.node_ptr_delete(mtr, &merge_block)?;

            self.eng
                .locks
                .update_merge_right(space_id, page_no, merge_no, &copied.pairs);
        }

        // The sibling gained records; refresh its free-space hint in the
        // same mini-transaction.
        {
            let merge_page = mtr.page(&merge_block)?;
            self.eng.ibuf_update_free_bits(space_id, &merge_page);
        }

        if cfg!(debug_assertions) {
            mtr.page(&merge_block)?.validate_structure()?;
        }

        self.page_free(mtr, &block)?;
        cursor.block = merge_block;

        if cfg!(debug_assertions) {
            debug_assert!(self.check_node_ptr(mtr, &cursor.block)?);
        }
        Ok(true)
    }

    /// Discards a page that is about to lose its last record. The whole
    /// page is removed; the record on it goes with it. Cannot be used on
    /// the root, which is allowed to become empty.
    pub fn discard_page(&self, mtr: &mut MiniTransaction, cursor: &mut TreeCursor) -> Result<()> {
        let block = Arc::clone(&cursor.block);
        let space_id = self.index.space_id;
        ensure!(
            block.page_no() != self.index.root_page(),
            "the root page is never discarded"
        );
        ensure!(
            mtr.has_tree_x(self.index.latch()),
            "discard requires the tree X-latch"
        );
        debug_assert!(mtr.has_page_x(&block));

        let (page_no, left_no, right_no, level) = {
            let page = mtr.page(&block)?;
            (page.page_no(), page.prev(), page.next(), page.level())
        };

        // The sibling that inherits this page's locks.
        let is_left = left_no != PAGE_NIL;
        let merge_block = if is_left {
            mtr.page_get(&self.eng.buf, space_id, left_no, PageLatch::X)
        } else if right_no != PAGE_NIL {
            mtr.page_get(&self.eng.buf, space_id, right_no, PageLatch::X)
        } else {
            return self.discard_only_page_on_level(mtr, &block);
        };
        let merge_no = merge_block.page_no();
        {
            let merge_page = mtr.page(&merge_block)?;
            if is_left {
                debug_assert_eq!(merge_page.next(), page_no);
            } else {
                debug_assert_eq!(merge_page.prev(), page_no);
            }
        }

        self.eng.search.drop_page_hash(space_id, page_no);

        if left_no == PAGE_NIL && level > 0 {
            // The survivor becomes the leftmost page of a non-leaf level;
            // its first node pointer takes over as minus infinity.
            let first = mtr
                .page(&merge_block)?
                .first_user_rec()
                .ok_or_else(|| eyre!("discard survivor page {} is empty", merge_no))?;
            self.set_min_rec_mark(mtr, &merge_block, first)?;
        }

        self.node_ptr_delete(mtr, &block)?;
        self.level_list_remove(mtr, &block)?;

        let heir_rec = if is_left {
            SUPREMUM_OFFSET
        } else {
            mtr.page(&merge_block)?
                .first_user_rec()
                .unwrap_or(SUPREMUM_OFFSET)
        };
        self.eng
            .locks
            .update_discard(space_id, page_no, merge_no, heir_rec);

        self.page_free(mtr, &block)?;

        if cfg!(debug_assertions) {
            debug_assert!(self.check_node_ptr(mtr, &merge_block)?);
        }
        cursor.block = merge_block;
        Ok(())
    }

    /// Discards a chain of pages that are each alone on their level,
    /// emptying the root at the top but leaving it allocated. The fathers
    /// are located while the level fields are still consistent, then the
    /// chain is freed bottom-up with each father adopting its child's
    /// level.
    fn discard_only_page_on_level(
        &self,
        mtr: &mut MiniTransaction,
        block: &Arc<Block>,
    ) -> Result<()> {
        let space_id = self.index.space_id;

        let mut chain: Vec<Arc<Block>> = vec![Arc::clone(block)];
        loop {
            let top = chain.last().expect("chain starts non-empty");
            if top.page_no() == self.index.root_page() {
                break;
            }
            {
                let page = mtr.page(top)?;
                ensure!(
                    page.prev() == PAGE_NIL && page.next() == PAGE_NIL,
                    "page {} is not alone on its level",
                    page.page_no()
                );
            }
            let (father, _) = self.father_node_ptr(mtr, top)?;
            chain.push(father);
        }

        let bottom_level = mtr.page(&chain[0])?.level();

        for pair in chain.windows(2) {
            let (page, father) = (&pair[0], &pair[1]);
            let page_no = page.page_no();
            self.eng.search.drop_page_hash(space_id, page_no);

            let page_level = mtr.page(page)?.level();
            self.eng
                .locks
                .update_discard(space_id, page_no, father.page_no(), SUPREMUM_OFFSET);
            mtr.page_mut(father)?.set_level(page_level);
            self.page_free(mtr, page)?;

            debug_assert!(
                father.page_no() == self.index.root_page()
                    || mtr.page(father)?.n_recs() == 1
            );
        }

        // The root stays allocated, as an empty page at the discarded
        // chain's bottom level.
        let root_block = chain.last().expect("chain ends at the root");
        self.page_empty(mtr, root_block)?;
        mtr.page_mut(root_block)?.set_level(bottom_level);
        self.eng.ibuf_reset_free_bits(space_id, root_block.page_no());
        Ok(())
    }

    /// Debug check: the father node pointer of a page routes back to it,
    /// and on non-leaf pages its key equals the page's first record.
    pub(crate) fn check_node_ptr(
        &self,
        mtr: &mut MiniTransaction,
        block: &Arc<Block>,
    ) -> Result<bool> {
        if block.page_no() == self.index.root_page() {
            return Ok(true);
        }
        let (father_block, father_rec) = self.father_node_ptr(mtr, block)?;
        let page = mtr.page(block)?;
        if page.is_leaf() {
            return Ok(true);
        }
        let first = page
            .first_user_rec()
            .ok_or_else(|| eyre!("non-leaf page {} has no records", page.page_no()))?;
        let tuple = self.build_node_ptr(&page, first, 0)?;
        let father_page = mtr.page(&father_block)?;
        Ok(
            rec_cmp_tuple(&father_page, father_rec, &tuple, &self.index.schema)?
                == Ordering::Equal,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::cursor::LatchIntent;
    use crate::engine::Engine;
    use crate::index::{Index, IndexKind};
    use crate::page::test_util::TestFrame;
    use crate::page::RecStatus;
    use crate::records::IndexSchema;

    fn setup(schema: IndexSchema) -> (tempfile::TempDir, Engine, Arc<Index>) {
        let dir = tempfile::tempdir().unwrap();
        let eng = Engine::create(dir.path()).unwrap();
        eng.add_space(0, 256);
        let index = Index::new(1, 0, IndexKind::Regular, schema);
        (dir, eng, index)
    }

    fn create_tree(eng: &Engine, index: &Arc<Index>) {
        let tree = BTree::new(eng, Arc::clone(index));
        let mut mtr = eng.mtr();
        tree.create(&mut mtr).unwrap().unwrap();
        mtr.commit().unwrap();
    }

    fn root_level(eng: &Engine, index: &Arc<Index>) -> u16 {
        let tree = BTree::new(eng, Arc::clone(index));
        let mut mtr = eng.mtr();
        let root = tree.root_get(&mut mtr).unwrap();
        let level = mtr.page(&root).unwrap().level();
        mtr.commit().unwrap();
        level
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

    fn payload4(k: u32) -> Vec<u8> {
        let mut p = Vec::new();
        p.extend_from_slice(&4u16.to_le_bytes());
        p.extend_from_slice(&k.to_be_bytes());
        p
    }

    fn fill_frame(f: &mut TestFrame, keys: &[u32]) -> Vec<u16> {
        let mut pm = f.page_mut();
        pm.create(true);
        let mut prev = INFIMUM_OFFSET;
        let mut offs = Vec::new();
        for &k in keys {
            prev = pm
                .insert_rec_after(prev, 0, RecStatus::Data, &payload4(k))
                .unwrap();
            offs.push(prev);
        }
        offs
    }

    fn big_field(k: u32) -> Vec<u8> {
        let mut v = k.to_be_bytes().to_vec();
        v.resize(1020, 0);
        v
    }

    fn big_tuple(k: u32) -> DataTuple {
        DataTuple::new(vec![Field::Data(big_field(k))])
    }

    fn big_payload(k: u32) -> Vec<u8> {
        let mut p = Vec::new();
        p.extend_from_slice(&1020u16.to_le_bytes());
        p.extend_from_slice(&big_field(k));
        p
    }

    #[test]
    fn right_convergence_splits_past_the_insert_point() {
        let (_dir, eng, index) = setup(small_schema());
        let tree = BTree::new(&eng, Arc::clone(&index));
        let mut f = TestFrame::new();
        let offs = fill_frame(&mut f, &[10, 20, 30, 40, 50, 60]);

        let page = f.page();
        // Not at the convergence point: no recommendation.
        assert_eq!(tree.split_rec_to_right(&page, offs[2]), None);
        // Ascending inserts at the page end: the new tuple opens the
        // upper half.
        assert_eq!(
            tree.split_rec_to_right(&page, offs[5]),
            Some(SplitRec::NewTuple)
        );

        // Convergence mid-page with two followers: split two past the
        // insert point, keeping one record behind.
        let mid = {
            let mut pm = f.page_mut();
            pm.insert_rec_after(offs[2], 0, RecStatus::Data, &payload4(35))
                .unwrap()
        };
        let page = f.page();
        assert_eq!(
            tree.split_rec_to_right(&page, mid),
            Some(SplitRec::At(offs[4]))
        );
    }

    #[test]
    fn left_convergence_mirrors_the_insert_pattern() {
        let (_dir, eng, index) = setup(small_schema());
        let tree = BTree::new(&eng, Arc::clone(&index));

        // Mid-page convergence: the record before the insert moves too.
        let mut f = TestFrame::new();
        let offs = fill_frame(&mut f, &[10, 20, 30, 40]);
        {
            let mut pm = f.page_mut();
            pm.insert_rec_after(offs[1], 0, RecStatus::Data, &payload4(25))
                .unwrap();
        }
        let page = f.page();
        assert_eq!(
            tree.split_rec_to_left(&page, offs[1]),
            Some(SplitRec::At(offs[1]))
        );
        // No convergence at this position.
        assert_eq!(tree.split_rec_to_left(&page, offs[3]), None);

        // Convergence at the page edge: split right at the previous
        // insert instead.
        let mut f = TestFrame::new();
        let first;
        {
            let mut pm = f.page_mut();
            pm.create(true);
            pm.insert_rec_after(INFIMUM_OFFSET, 0, RecStatus::Data, &payload4(20))
                .unwrap();
            first = pm
                .insert_rec_after(INFIMUM_OFFSET, 0, RecStatus::Data, &payload4(10))
                .unwrap();
        }
        let page = f.page();
        assert_eq!(
            tree.split_rec_to_left(&page, INFIMUM_OFFSET),
            Some(SplitRec::At(first))
        );
    }

    #[test]
    fn sure_split_balances_reserved_space() {
        let (_dir, eng, index) = setup(small_schema());
        let tree = BTree::new(&eng, Arc::clone(&index));
        let mut f = TestFrame::new();
        let offs = fill_frame(&mut f, &(1..=10).collect::<Vec<_>>());
        let page = f.page();

        // Ten uniform records plus the tuple: half the reserved space is
        // covered after six items, and since they all fit an empty page
        // the boundary advances one more.
        assert_eq!(
            tree.sure_split_rec(&page, None, offs[9], &key4(11)),
            SplitRec::At(offs[6])
        );

        // With the tuple spliced in first, the item sequence shifts by
        // one.
        assert_eq!(
            tree.sure_split_rec(&page, None, INFIMUM_OFFSET, &key4(0)),
            SplitRec::At(offs[5])
        );
    }

    #[test]
    fn insert_fits_accounts_for_departing_records() {
        let (_dir, eng, index) = setup(small_schema());
        let tree = BTree::new(&eng, Arc::clone(&index));

        // Fifteen ~1KB records leave no room for a sixteenth.
        let mut f = TestFrame::new();
        let offs = {
            let mut pm = f.page_mut();
            pm.create(true);
            let mut prev = INFIMUM_OFFSET;
            let mut offs = Vec::new();
            for k in 1..=15u32 {
                prev = pm
                    .insert_rec_after(prev, 0, RecStatus::Data, &big_payload(k))
                    .unwrap();
                offs.push(prev);
            }
            offs
        };
        let page = f.page();

        // Splitting mid-page sends half the records away: the tuple fits
        // its half.
        assert!(tree
            .insert_fits(&page, offs[14], SplitRec::At(offs[7]), &big_tuple(16))
            .unwrap());
        // Splitting in front of the first record moves nothing off the
        // tuple's half: no room.
        assert!(!tree
            .insert_fits(&page, offs[14], SplitRec::At(offs[0]), &big_tuple(16))
            .unwrap());
        // A tuple-first split leaves every record behind: fits.
        assert!(tree
            .insert_fits(&page, offs[14], SplitRec::NewTuple, &big_tuple(16))
            .unwrap());
    }

    #[test]
    fn level_list_remove_relinks_both_neighbors() {
        let (_dir, eng, index) = setup(small_schema());
        let tree = BTree::new(&eng, Arc::clone(&index));

        let mut mtr = eng.mtr();
        let a = mtr.page_get(&eng.buf, 0, 1, PageLatch::X);
        let b = mtr.page_get(&eng.buf, 0, 2, PageLatch::X);
        let c = mtr.page_get(&eng.buf, 0, 3, PageLatch::X);
        for blk in [&a, &b, &c] {
            mtr.page_mut(blk).unwrap().create(true);
        }
        mtr.page_mut(&a).unwrap().set_next(2);
        {
            let mut pm = mtr.page_mut(&b).unwrap();
            pm.set_prev(1);
            pm.set_next(3);
        }
        mtr.page_mut(&c).unwrap().set_prev(2);

        tree.level_list_remove(&mut mtr, &b).unwrap();

        assert_eq!(mtr.page(&a).unwrap().next(), 3);
        assert_eq!(mtr.page(&c).unwrap().prev(), 1);
        mtr.commit().unwrap();
    }

    #[test]
    fn compress_refuses_when_the_sibling_lacks_room() {
        let (_dir, eng, index) = setup(wide_schema());
        create_tree(&eng, &index);
        let tree = BTree::new(&eng, Arc::clone(&index));
        for k in 1..=80u32 {
            tree.insert(&wide_key(k)).unwrap();
        }
        assert!(root_level(&eng, &index) >= 1);

        // The leftmost leaf is full; so is its only merge candidate.
        let mut mtr = eng.mtr();
        let mut cur = tree
            .search_to_level(0, &wide_key(20), LatchIntent::ModifyTree, &mut mtr)
            .unwrap();
        assert!(cur.matched);
        assert_ne!(cur.block.page_no(), index.root_page());

        assert!(!tree.compress(&mut mtr, &mut cur).unwrap());
        mtr.commit().unwrap();
        assert!(tree.validate_index(None).unwrap());
    }

    #[test]
    fn root_raise_moves_records_and_splits_the_child() {
        let (_dir, eng, index) = setup(wide_schema());
        create_tree(&eng, &index);
        let tree = BTree::new(&eng, Arc::clone(&index));
        for k in 1..=39u32 {
            tree.insert(&wide_key(k)).unwrap();
        }
        assert_eq!(root_level(&eng, &index), 0);

        let space = eng.space(0).unwrap();
        assert!(space.reserve_free_pages(2));
        let mut mtr = eng.mtr();
        let mut cur = tree
            .search_to_level(0, &wide_key(40), LatchIntent::ModifyTree, &mut mtr)
            .unwrap();
        assert_eq!(cur.block.page_no(), index.root_page());

        let rec = tree
            .root_raise_and_insert(&mut mtr, &mut cur, &wide_key(40))
            .unwrap();
        assert_ne!(rec, 0);
        mtr.commit().unwrap();
        space.release_reservation(2);

        assert_eq!(root_level(&eng, &index), 1);
        for k in 1..=40u32 {
            assert!(tree.search(&wide_key(k)).unwrap().is_some(), "key {}", k);
        }
        assert!(tree.validate_index(None).unwrap());
    }

    #[test]
    fn deleting_everything_collapses_to_an_empty_leaf_root() {
        let (_dir, eng, index) = setup(wide_schema());
        create_tree(&eng, &index);
        let tree = BTree::new(&eng, Arc::clone(&index));
        for k in 1..=80u32 {
            tree.insert(&wide_key(k)).unwrap();
        }
        assert!(root_level(&eng, &index) >= 1);

        // The last delete on each only-page walks the discard chain.
        for k in 1..=80u32 {
            assert!(tree.delete(&wide_key(k)).unwrap(), "delete of key {}", k);
        }

        assert_eq!(root_level(&eng, &index), 0);
        let mut mtr = eng.mtr();
        let root = tree.root_get(&mut mtr).unwrap();
        assert_eq!(mtr.page(&root).unwrap().n_recs(), 0);
        mtr.commit().unwrap();

        let space = eng.space(0).unwrap();
        assert!(space.free_count() > 0, "discarded pages return to the space");
        assert!(tree.validate_index(None).unwrap());
    }
}
