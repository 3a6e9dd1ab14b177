//! # Node Pointers
//!
//! Internal-level records routing searches to child pages: the unique key
//! prefix of the child's first record, followed by the child page number
//! as a fixed 4-byte big-endian trailing field.
//!
//! The father of a page is found by searching one level up with a node
//! pointer built from the page's own first user record. A mismatch between
//! the located pointer's child field and the page itself means the tree is
//! corrupt: both pages are dumped to the diagnostic sink and the process
//! aborts, because no in-line recovery is possible.

use std::sync::Arc;

use eyre::{bail, ensure, Result};

use crate::mtr::{MiniTransaction, PageLatch};
use crate::page::{Page, REC_HEADER_SIZE};
use crate::records::{rec_get_offsets, DataTuple, Field, IndexSchema, NODE_PTR_FIELD_SIZE};
use crate::storage::buffer::Block;

use super::cursor::LatchIntent;
use super::BTree;

/// Reads the child page number from the trailing field of a node pointer.
pub fn node_ptr_child(page: &Page<'_>, rec_off: u16, schema: &IndexSchema) -> Result<u32> {
    let payload = page.rec_payload(rec_off);
    let offsets = rec_get_offsets(payload, schema.node_ptr_fields())?;
    let child = offsets
        .field(payload, offsets.n_fields() - 1)
        .ok_or_else(|| eyre::eyre!("node pointer child field is NULL"))?;
    ensure!(
        child.len() == NODE_PTR_FIELD_SIZE,
        "node pointer child field has length {}, expected {}",
        child.len(),
        NODE_PTR_FIELD_SIZE
    );
    Ok(u32::from_be_bytes(child.try_into().unwrap()))
}

impl BTree<'_> {
    /// Builds the node pointer tuple for a record: its first `n_uniq`
    /// fields plus `child_page_no`. The record's minimum-record flag is
    /// carried into the tuple, so the pointer to a leftmost non-leaf child
    /// compares equal to its father record.
    pub fn build_node_ptr(
        &self,
        page: &Page<'_>,
        rec_off: u16,
        child_page_no: u32,
    ) -> Result<DataTuple> {
        let schema = &self.index.schema;
        let payload = page.rec_payload(rec_off);
        let n_src = super::cursor::rec_field_count(page.rec_status(rec_off), schema);
        let offsets = rec_get_offsets(payload, n_src)?;

        let mut fields = Vec::with_capacity(schema.n_uniq + 1);
        for i in 0..schema.n_uniq {
            fields.push(match offsets.field(payload, i) {
                Some(b) => Field::Data(b.to_vec()),
                None => Field::Null,
            });
        }
        fields.push(Field::Data(child_page_no.to_be_bytes().to_vec()));

        let mut tuple = DataTuple::new(fields).with_n_cmp(schema.n_uniq);
        tuple.min_rec = page.rec_is_min_rec(rec_off);
        Ok(tuple)
    }

    /// Overwrites the child page number of a node pointer, atomically with
    /// a typed write on the compressed mirror.
    pub fn node_ptr_set_child_page_no(
        &self,
        mtr: &mut MiniTransaction,
        block: &Arc<Block>,
        rec_off: u16,
        child_page_no: u32,
    ) -> Result<()> {
        let schema = &self.index.schema;
        let mut pm = mtr.page_mut(block)?;
        let page = pm.page();
        debug_assert!(!page.is_leaf());

        let payload = page.rec_payload(rec_off);
        let offsets = rec_get_offsets(payload, schema.node_ptr_fields())?;
        let last = offsets.fields[offsets.n_fields() - 1];
        ensure!(
            last.len == Some(NODE_PTR_FIELD_SIZE as u16),
            "node pointer child field has unexpected shape"
        );
        let field_pos = last.offset as usize;

        pm.write_rec_payload(rec_off, field_pos, &child_page_no.to_be_bytes());
        if let Some(zip) = pm.zip() {
            zip.write_node_ptr(rec_off, child_page_no);
        }
        Ok(())
    }

    /// Returns the child block of a node pointer, X-latched.
    pub fn node_ptr_get_child(
        &self,
        mtr: &mut MiniTransaction,
        father_page: &Page<'_>,
        rec_off: u16,
    ) -> Result<Arc<Block>> {
        let child = node_ptr_child(father_page, rec_off, &self.index.schema)?;
        Ok(mtr.page_get(&self.eng.buf, self.index.space_id, child, PageLatch::X))
    }

    /// Locates the father node pointer of `block`, which must contain at
    /// least one user record. The mini-transaction must hold the tree
    /// X-latch. Returns the father block (X-latched) and the record
    /// offset.
    ///
    /// A located pointer whose child field does not equal the page is an
    /// index corruption: both pages go to the diagnostic sink and the
    /// process aborts.
    pub fn father_node_ptr(
        &self,
        mtr: &mut MiniTransaction,
        block: &Arc<Block>,
    ) -> Result<(Arc<Block>, u16)> {
        match self.father_node_ptr_checked(mtr, block)? {
            Ok(found) => Ok(found),
            Err(corruption) => {
                panic!(
                    "B-tree corruption in index {}: {}; dump written to the diagnostic sink",
                    self.index.id, corruption
                );
            }
        }
    }

    /// Father lookup that reports a child-field mismatch instead of
    /// aborting; the validator uses this form.
    pub(crate) fn father_node_ptr_checked(
        &self,
        mtr: &mut MiniTransaction,
        block: &Arc<Block>,
    ) -> Result<std::result::Result<(Arc<Block>, u16), String>> {
        ensure!(
            mtr.has_tree_x(self.index.latch()),
            "father lookup requires the tree X-latch"
        );

        let (tuple, level, page_no) = {
            let page = mtr.page(block)?;
            ensure!(
                page.page_no() != self.index.root_page(),
                "the root page has no father"
            );
            let first = page
                .first_user_rec()
                .ok_or_else(|| eyre::eyre!("father lookup on a page with no user records"))?;
            (self.build_node_ptr(&page, first, 0)?, page.level(), page.page_no())
        };

        let cursor = self.search_to_level(level + 1, &tuple, LatchIntent::ContModifyTree, mtr)?;
        let father_block = cursor.block;
        let rec_off = cursor.position.rec;

        let father_page = mtr.page(&father_block)?;
        if cursor.position.is_before_first() {
            let child_page = mtr.page(block)?;
            self.eng.diag.dump_page("child of missing node pointer", &child_page);
            self.eng.diag.dump_page("father page", &father_page);
            return Ok(Err(format!(
                "no node pointer found on level {} for page {}",
                level + 1,
                page_no
            )));
        }

        let child = node_ptr_child(&father_page, rec_off, &self.index.schema)?;
        if child != page_no {
            let child_page = mtr.page(block)?;
            self.eng.diag.dump_page("child page", &child_page);
            self.eng.diag.dump_page("father page", &father_page);
            return Ok(Err(format!(
                "father node pointer names child page {}, expected {}",
                child, page_no
            )));
        }
        Ok(Ok((father_block, rec_off)))
    }

    /// Inserts a tuple on a non-leaf level. The mini-transaction must hold
    /// the tree X-latch. Internal inserts bypass record locking and undo
    /// entirely and must succeed.
    pub fn insert_on_non_leaf_level(
        &self,
        mtr: &mut MiniTransaction,
        level: u16,
        tuple: &DataTuple,
    ) -> Result<()> {
        debug_assert!(level > 0);
        let mut cursor = self.search_to_level(level, tuple, LatchIntent::ContModifyTree, mtr)?;

        let inserted = {
            let mut pm = mtr.page_mut(&cursor.block)?;
            crate::page::cursor::tuple_insert(&mut pm, cursor.position, tuple, &self.index.schema)?
        };
        if inserted.is_some() {
            return Ok(());
        }

        // No room: reorganize first, then split if still too tight.
        if self.page_reorganize(mtr, &cursor.block)? {
            let page = mtr.page(&cursor.block)?;
            let out = crate::page::cursor::search_le(&page, &self.index.schema, tuple)?;
            cursor.position = out.cursor;
            let mut pm = mtr.page_mut(&cursor.block)?;
            if crate::page::cursor::tuple_insert(&mut pm, cursor.position, tuple, &self.index.schema)?
                .is_some()
            {
                return Ok(());
            }
        }

        let space = self.eng.space(self.index.space_id)?;
        ensure!(
            space.reserve_free_pages(2),
            "out of tablespace while splitting level {}",
            level
        );
        let result = if cursor.block.page_no() == self.index.root_page() {
            self.root_raise_and_insert(mtr, &mut cursor, tuple)
        } else {
            self.page_split_and_insert(mtr, &mut cursor, tuple)
        };
        space.release_reservation(2);
        let rec = result?;
        ensure!(rec != 0, "non-leaf insert must succeed after a split");
        Ok(())
    }

    /// Deletes the node pointer of `block` from its father. When the
    /// deleted pointer carried the minimum-record flag, the flag transfers
    /// to its successor so the level keeps its minus-infinity marker.
    pub fn node_ptr_delete(&self, mtr: &mut MiniTransaction, block: &Arc<Block>) -> Result<()> {
        let (father_block, rec_off) = self.father_node_ptr(mtr, block)?;

        let (n_recs, father_is_root) = {
            let page = mtr.page(&father_block)?;
            (
                page.n_recs(),
                page.page_no() == self.index.root_page(),
            )
        };
        if n_recs == 1 && !father_is_root {
            // The pointer is the father's last record; the whole father
            // page goes with it.
            let mut cursor = super::cursor::TreeCursor {
                block: father_block,
                position: crate::page::cursor::PageCursor::on(rec_off),
                matched: false,
                left_sibling: None,
                right_sibling: None,
            };
            return self.discard_page(mtr, &mut cursor);
        }

        let (was_min_rec, next_rec) = {
            let page = mtr.page(&father_block)?;
            (page.rec_is_min_rec(rec_off), page.next_user_rec(rec_off))
        };

        {
            let mut pm = mtr.page_mut(&father_block)?;
            pm.delete_rec(rec_off);
        }

        if was_min_rec {
            if let Some(next) = next_rec {
                self.set_min_rec_mark(mtr, &father_block, next)?;
            }
        }

        // A father that fell below half occupancy is merged further, the
        // same way a record delete compresses a leaf.
        let (is_root, underfull, empty) = {
            let page = mtr.page(&father_block)?;
            (
                page.page_no() == self.index.root_page(),
                page.data_size() < Page::free_space_of_empty() / 2,
                page.n_recs() == 0,
            )
        };
        if !is_root && !empty && underfull {
            let page = mtr.page(&father_block)?;
            let first = page.first_user_rec().expect("non-empty page has a first record");
            let mut cursor = super::cursor::TreeCursor {
                block: Arc::clone(&father_block),
                position: crate::page::cursor::PageCursor::on(first),
                matched: false,
                left_sibling: None,
                right_sibling: None,
            };
            let _ = self.compress(mtr, &mut cursor)?;
        }
        Ok(())
    }

    pub(crate) fn rec_stored_size(tuple: &DataTuple) -> usize {
        REC_HEADER_SIZE + tuple.converted_size()
    }
}
