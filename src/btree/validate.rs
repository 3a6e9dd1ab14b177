//! # Tree Validation
//!
//! Consistency checks used by background verification and debug builds:
//! record shape against the index schema, and a level-by-level walk
//! checking sibling reciprocity, cross-page ordering, the min-rec flag
//! rule, and parent/child agreement.
//!
//! Validation reports through the diagnostic sink and returns `false`
//! rather than aborting, so callers decide what a broken tree means for
//! them. The tree X-latch is released and re-acquired for every page
//! visited to bound latch hold times, and a caller-supplied interrupt
//! flag is polled between pages.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use eyre::Result;

use crate::mtr::{MiniTransaction, PageLatch};
use crate::page::cursor::{rec_cmp_tuple, rec_n_fields};
use crate::page::{Page, PAGE_NIL};
use crate::records::rec_get_offsets;
use crate::storage::buffer::Block;

use super::node_ptr::node_ptr_child;
use super::BTree;

impl BTree<'_> {
    /// Checks one record's shape against the index schema: field count,
    /// fixed-size lengths, prefix limits, NULLs only where nullable.
    /// Universal trees carry records of arbitrary shape and always pass.
    pub fn index_rec_validate(&self, page: &Page<'_>, rec: u16) -> bool {
        if self.index.is_universal() {
            return true;
        }
        let schema = &self.index.schema;

        if page.is_comp() != schema.comp {
            self.eng.diag.report(&format!(
                "page {} compact flag {} disagrees with the index schema",
                page.page_no(),
                page.is_comp()
            ));
            return false;
        }

        let n_fields = rec_n_fields(page.rec_status(rec), schema);
        let payload = page.rec_payload(rec);
        let offsets = match rec_get_offsets(payload, n_fields) {
            Ok(o) => o,
            Err(err) => {
                self.eng.diag.dump_page("record shape failure", page);
                self.eng.diag.report(&format!(
                    "record at {} on page {} does not parse as {} fields: {}",
                    rec,
                    page.page_no(),
                    n_fields,
                    err
                ));
                return false;
            }
        };
        if offsets.size as usize != payload.len() {
            self.eng.diag.dump_page("record shape failure", page);
            self.eng.diag.report(&format!(
                "record at {} on page {} has {} trailing bytes",
                rec,
                page.page_no(),
                payload.len() - offsets.size as usize
            ));
            return false;
        }

        for (i, col) in schema.cols.iter().enumerate().take(offsets.n_fields()) {
            let len = offsets.fields[i].len;
            let bad = match len {
                None => !col.nullable,
                Some(len) => {
                    let fixed_bad = col.prefix_len.is_none()
                        && col.fixed_len.is_some_and(|f| f != len);
                    let prefix_bad = col.prefix_len.is_some_and(|p| len > p);
                    fixed_bad || prefix_bad
                }
            };
            if bad {
                self.eng.diag.dump_page("record shape failure", page);
                self.eng.diag.report(&format!(
                    "record at {} on page {}: field {} has length {:?}",
                    rec,
                    page.page_no(),
                    i,
                    len
                ));
                return false;
            }
        }
        true
    }

    fn index_page_validate(&self, page: &Page<'_>) -> bool {
        page.user_recs().all(|rec| self.index_rec_validate(page, rec))
    }

    /// Records within the page must be in strictly increasing key order.
    fn page_order_validate(&self, page: &Page<'_>) -> Result<bool> {
        let mut prev: Option<u16> = None;
        for rec in page.user_recs() {
            if let Some(p) = prev {
                let tuple = self.build_node_ptr_free(page, rec)?;
                if rec_cmp_tuple(page, p, &tuple, &self.index.schema)? != Ordering::Less {
                    self.eng.diag.dump_page("records out of order", page);
                    self.eng.diag.report(&format!(
                        "page {}: records at {} and {} are not ascending",
                        page.page_no(),
                        p,
                        rec
                    ));
                    return Ok(false);
                }
            }
            prev = Some(rec);
        }
        Ok(true)
    }

    // A comparison key for any record, node pointer or leaf.
    fn build_node_ptr_free(
        &self,
        page: &Page<'_>,
        rec: u16,
    ) -> Result<crate::records::DataTuple> {
        self.build_node_ptr(page, rec, 0)
    }

    fn validate_level(&self, level: u16, interrupt: Option<&AtomicBool>) -> Result<bool> {
        let space_id = self.index.space_id;
        let mut ret = true;

        let mut mtr = self.eng.mtr();
        mtr.x_latch_tree(self.index.latch());

        // Descend the leftmost path to the requested level.
        let mut block = self.root_get(&mut mtr)?;
        loop {
            let page = mtr.page(&block)?;
            if page.level() == level {
                break;
            }
            let first = match page.first_user_rec() {
                Some(f) => f,
                None => {
                    self.eng.diag.dump_page("empty non-leaf page", &page);
                    mtr.commit()?;
                    return Ok(false);
                }
            };
            let child = node_ptr_child(&page, first, &self.index.schema)?;
            block = mtr.page_get(&self.eng.buf, space_id, child, PageLatch::X);
        }

        // Walk the sibling chain, one mini-transaction per page so the
        // tree latch is never held across the whole level.
        loop {
            if interrupt.is_some_and(|f| f.load(AtomicOrdering::Acquire)) {
                mtr.commit()?;
                return Ok(ret);
            }

            if !self.validate_page(&mut mtr, &block, level)? {
                ret = false;
            }
            let right_no = mtr.page(&block)?.next();

            mtr.commit()?;
            if right_no == PAGE_NIL {
                break;
            }
            mtr = self.eng.mtr();
            mtr.x_latch_tree(self.index.latch());
            block = mtr.page_get(&self.eng.buf, space_id, right_no, PageLatch::X);
        }
        Ok(ret)
    }

    fn validate_page(
        &self,
        mtr: &mut MiniTransaction,
        block: &Arc<Block>,
        level: u16,
    ) -> Result<bool> {
        let space_id = self.index.space_id;
        let mut ret = true;

        let (page_no, left_no, right_no, n_recs, is_root) = {
            let page = mtr.page(block)?;
            if page.level() != level {
                self.eng.diag.dump_page("page on the wrong level", &page);
                return Ok(false);
            }
            if let Err(err) = page.validate_structure() {
                self.eng.diag.dump_page("page structure failure", &page);
                self.eng.diag.report(&format!("{}", err));
                return Ok(false);
            }
            if !self.page_order_validate(&page)? {
                ret = false;
            }
            if level == 0 && !self.index_page_validate(&page) {
                ret = false;
            }
            (
                page.page_no(),
                page.prev(),
                page.next(),
                page.n_recs(),
                page.page_no() == self.index.root_page(),
            )
        };

        // Only an empty leaf root may hold no records.
        if n_recs == 0 && !(level == 0 && is_root) {
            self.eng.diag.report(&format!(
                "page {} on level {} has no records",
                page_no, level
            ));
            ret = false;
        }

        // Sibling reciprocity, format agreement, and cross-page order.
        if right_no != PAGE_NIL {
            let right_block = mtr.page_get(&self.eng.buf, space_id, right_no, PageLatch::X);
            let page = mtr.page(block)?;
            let right = mtr.page(&right_block)?;
            if right.prev() != page_no || right.level() != level {
                self.eng.diag.dump_page("broken sibling link, left", &page);
                self.eng.diag.dump_page("broken sibling link, right", &right);
                ret = false;
            } else if right.is_comp() != page.is_comp() {
                self.eng.diag.report(&format!(
                    "pages {} and {} disagree on the compact flag",
                    page_no, right_no
                ));
                return Ok(false);
            } else if let (Some(last), Some(right_first)) =
                (page.last_user_rec(), right.first_user_rec())
            {
                let right_tuple = self.build_node_ptr_free(&right, right_first)?;
                if rec_cmp_tuple(&page, last, &right_tuple, &self.index.schema)?
                    != Ordering::Less
                {
                    self.eng.diag.dump_page("order break across pages, left", &page);
                    self.eng
                        .diag
                        .dump_page("order break across pages, right", &right);
                    ret = false;
                }
            }
        }

        // The minus-infinity marker sits exactly on leftmost non-leaf
        // pages.
        if level > 0 {
            if let Some(first) = mtr.page(block)?.first_user_rec() {
                let page = mtr.page(block)?;
                if page.rec_is_min_rec(first) != (left_no == PAGE_NIL) {
                    self.eng.diag.dump_page("min-rec flag rule broken", &page);
                    ret = false;
                }
            }
        }

        if !is_root && n_recs > 0 {
            ret &= self.validate_father(mtr, block, level, right_no)?;
        }
        Ok(ret)
    }

    fn validate_father(
        &self,
        mtr: &mut MiniTransaction,
        block: &Arc<Block>,
        level: u16,
        right_no: u32,
    ) -> Result<bool> {
        let space_id = self.index.space_id;
        let mut ret = true;

        let (father_block, father_rec) = match self.father_node_ptr_checked(mtr, block)? {
            Ok(found) => found,
            Err(msg) => {
                self.eng.diag.report(&msg);
                return Ok(false);
            }
        };

        // The pointer's key must equal the page's first record; for leaf
        // children the pointer is only a lower bound, keyed by whatever
        // record led the page when it was attached.
        if level > 0 {
            let page = mtr.page(block)?;
            let first = page.first_user_rec().expect("checked above");
            let tuple = self.build_node_ptr_free(&page, first)?;
            let father_page = mtr.page(&father_block)?;
            if rec_cmp_tuple(&father_page, father_rec, &tuple, &self.index.schema)?
                != Ordering::Equal
            {
                self.eng.diag.dump_page("node pointer key mismatch, child", &page);
                self.eng
                    .diag
                    .dump_page("node pointer key mismatch, father", &father_page);
                ret = false;
            }
        }

        // The pointer found through the page's last record must be the
        // same one.
        {
            let last_tuple = {
                let page = mtr.page(block)?;
                let last = page.last_user_rec().expect("page has records");
                self.build_node_ptr_free(&page, last)?
            };
            let via_last = self.search_to_level(
                level + 1,
                &last_tuple,
                super::cursor::LatchIntent::ContModifyTree,
                mtr,
            )?;
            if !Arc::ptr_eq(&via_last.block, &father_block)
                || via_last.position.rec != father_rec
            {
                self.eng.diag.report(&format!(
                    "page {}: first and last record disagree on the father pointer",
                    mtr.page(block)?.page_no()
                ));
                ret = false;
            }
        }

        // The right sibling's father pointer is either the next record on
        // this father page, or the first on the father's right sibling.
        if right_no != PAGE_NIL {
            let right_block = mtr.page_get(&self.eng.buf, space_id, right_no, PageLatch::X);
            match self.father_node_ptr_checked(mtr, &right_block)? {
                Err(msg) => {
                    self.eng.diag.report(&msg);
                    ret = false;
                }
                Ok((right_father_block, right_father_rec)) => {
                    let father_page = mtr.page(&father_block)?;
                    match father_page.next_user_rec(father_rec) {
                        Some(next) => {
                            if !Arc::ptr_eq(&right_father_block, &father_block)
                                || right_father_rec != next
                            {
                                self.eng
                                    .diag
                                    .report("node pointer to the right page is wrong");
                                ret = false;
                            }
                        }
                        None => {
                            let right_father_page = mtr.page(&right_father_block)?;
                            if right_father_page.first_user_rec() != Some(right_father_rec)
                                || father_page.next() != right_father_page.page_no()
                            {
                                self.eng
                                    .diag
                                    .report("father pages do not chain with their children");
                                ret = false;
                            }
                        }
                    }
                }
            }
        }
        Ok(ret)
    }

    /// Walks the whole tree level by level, root down. Returns `true` when
    /// every invariant holds. Interruptible between pages.
    pub fn validate_index(&self, interrupt: Option<&AtomicBool>) -> Result<bool> {
        let root_level = {
            let mut mtr = self.eng.mtr();
            mtr.x_latch_tree(self.index.latch());
            let root = self.root_get(&mut mtr)?;
            let level = mtr.page(&root)?.level();
            mtr.commit()?;
            level
        };

        for depth in 0..=root_level {
            if interrupt.is_some_and(|f| f.load(AtomicOrdering::Acquire)) {
                return Ok(true);
            }
            if !self.validate_level(root_level - depth, interrupt)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Engine;
    use crate::index::{Index, IndexKind};
    use crate::page::test_util::TestFrame;
    use crate::page::{RecStatus, INFIMUM_OFFSET, REC_INFO_MIN_REC};
    use crate::records::{DataTuple, IndexSchema};

    fn setup(kind: IndexKind, schema: IndexSchema) -> (tempfile::TempDir, Engine, Arc<Index>) {
        let dir = tempfile::tempdir().unwrap();
        let eng = Engine::create(dir.path()).unwrap();
        eng.add_space(0, 256);
        let index = Index::new(1, 0, kind, schema);
        (dir, eng, index)
    }

    fn create_tree(eng: &Engine, index: &Arc<Index>) {
        let tree = BTree::new(eng, Arc::clone(index));
        let mut mtr = eng.mtr();
        tree.create(&mut mtr).unwrap().unwrap();
        mtr.commit().unwrap();
    }

    fn wide_schema() -> IndexSchema {
        IndexSchema::single_fixed_key(400, true)
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

    #[test]
    fn record_shape_is_checked_against_the_schema() {
        let (_dir, eng, index) = setup(
            IndexKind::Regular,
            IndexSchema::single_fixed_key(4, true),
        );
        let tree = BTree::new(&eng, Arc::clone(&index));

        let mut f = TestFrame::new();
        let (good, short, null_field, trailing);
        {
            let mut pm = f.page_mut();
            pm.create(true);
            good = pm
                .insert_rec_after(INFIMUM_OFFSET, 0, RecStatus::Data, &payload4(1))
                .unwrap();
            // A 3-byte value in a fixed 4-byte column.
            short = pm
                .insert_rec_after(good, 0, RecStatus::Data, &[3, 0, 0, 0, 2])
                .unwrap();
            // NULL in a non-nullable column.
            null_field = pm
                .insert_rec_after(short, 0, RecStatus::Data, &[0xFF, 0xFF])
                .unwrap();
            // Bytes past the last declared field.
            trailing = pm
                .insert_rec_after(null_field, 0, RecStatus::Data, &[4, 0, 0, 0, 0, 3, 9])
                .unwrap();
        }

        let page = f.page();
        assert!(tree.index_rec_validate(&page, good));
        assert!(!tree.index_rec_validate(&page, short));
        assert!(!tree.index_rec_validate(&page, null_field));
        assert!(!tree.index_rec_validate(&page, trailing));
        assert!(eng.diag.dump_count() > 0);

        // A universal tree carries records of any shape.
        let universal = Index::new(
            2,
            0,
            IndexKind::Universal,
            IndexSchema::single_fixed_key(4, true),
        );
        let utree = BTree::new(&eng, universal);
        assert!(utree.index_rec_validate(&page, short));
        assert!(utree.index_rec_validate(&page, null_field));
    }

    #[test]
    fn in_page_disorder_is_detected() {
        let (_dir, eng, index) = setup(
            IndexKind::Regular,
            IndexSchema::single_fixed_key(4, true),
        );
        let tree = BTree::new(&eng, Arc::clone(&index));

        let mut f = TestFrame::new();
        {
            let mut pm = f.page_mut();
            pm.create(true);
            let r20 = pm
                .insert_rec_after(INFIMUM_OFFSET, 0, RecStatus::Data, &payload4(20))
                .unwrap();
            // Linked after 20 although it sorts before it.
            pm.insert_rec_after(r20, 0, RecStatus::Data, &payload4(10))
                .unwrap();
        }
        assert!(!tree.page_order_validate(&f.page()).unwrap());

        let mut sorted = TestFrame::new();
        {
            let mut pm = sorted.page_mut();
            pm.create(true);
            let r10 = pm
                .insert_rec_after(INFIMUM_OFFSET, 0, RecStatus::Data, &payload4(10))
                .unwrap();
            pm.insert_rec_after(r10, 0, RecStatus::Data, &payload4(20))
                .unwrap();
        }
        assert!(tree.page_order_validate(&sorted.page()).unwrap());
    }

    #[test]
    fn forged_parent_pointer_is_reported_not_aborted() {
        let (_dir, eng, index) = setup(IndexKind::Regular, wide_schema());
        create_tree(&eng, &index);
        let tree = BTree::new(&eng, Arc::clone(&index));
        for k in 1..=80u32 {
            tree.insert(&wide_key(k)).unwrap();
        }
        assert!(tree.validate_index(None).unwrap());

        // Point the second node pointer at the first pointer's child.
        let mut mtr = eng.mtr();
        mtr.x_latch_tree(index.latch());
        let root = tree.root_get(&mut mtr).unwrap();
        let (second, child1, child2) = {
            let page = mtr.page(&root).unwrap();
            assert!(!page.is_leaf());
            let first = page.first_user_rec().unwrap();
            let second = page.next_user_rec(first).unwrap();
            (
                second,
                node_ptr_child(&page, first, &index.schema).unwrap(),
                node_ptr_child(&page, second, &index.schema).unwrap(),
            )
        };
        let orphan = mtr.page_get(&eng.buf, 0, child2, PageLatch::X);
        tree.node_ptr_set_child_page_no(&mut mtr, &root, second, child1)
            .unwrap();

        // The checked father lookup reports the mismatch.
        let checked = tree.father_node_ptr_checked(&mut mtr, &orphan).unwrap();
        assert!(checked.is_err());
        mtr.commit().unwrap();

        assert!(!tree.validate_index(None).unwrap());
        assert!(eng.diag.dump_count() > 0);
    }

    #[test]
    fn missing_min_rec_flag_fails_the_level_walk() {
        let (_dir, eng, index) = setup(IndexKind::Regular, wide_schema());
        create_tree(&eng, &index);
        let tree = BTree::new(&eng, Arc::clone(&index));
        for k in 1..=80u32 {
            tree.insert(&wide_key(k)).unwrap();
        }
        assert!(tree.validate_index(None).unwrap());

        // Strip the minus-infinity marker from the leftmost pointer.
        let mut mtr = eng.mtr();
        mtr.x_latch_tree(index.latch());
        let root = tree.root_get(&mut mtr).unwrap();
        let first = mtr.page(&root).unwrap().first_user_rec().unwrap();
        assert!(mtr.page(&root).unwrap().rec_is_min_rec(first));
        {
            let mut pm = mtr.page_mut(&root).unwrap();
            let info = pm.page().rec_info(first) & !REC_INFO_MIN_REC;
            pm.write_rec_info_raw(first, info);
        }
        mtr.commit().unwrap();

        assert!(!tree.validate_index(None).unwrap());
    }

    #[test]
    fn interrupted_validation_exits_with_the_accumulated_result() {
        let (_dir, eng, index) = setup(IndexKind::Regular, wide_schema());
        create_tree(&eng, &index);
        let tree = BTree::new(&eng, Arc::clone(&index));
        for k in 1..=40u32 {
            tree.insert(&wide_key(k)).unwrap();
        }

        let stop = AtomicBool::new(true);
        assert!(tree.validate_index(Some(&stop)).unwrap());

        stop.store(false, AtomicOrdering::Release);
        assert!(tree.validate_index(Some(&stop)).unwrap());
    }
}
