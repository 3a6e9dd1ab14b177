//! # Page Lifecycle
//!
//! Tree creation and drop, page allocation and free, page empty, and page
//! reorganize.
//!
//! Pages of a regular tree come from the two file segments anchored on the
//! root: the leaf segment for level 0, the top segment for everything
//! above. The insert-buffer tree instead keeps a free list of pages on its
//! root page and allocates by popping it, so insert-buffer merges never
//! wait on the space manager.
//!
//! Reorganize rebuilds a page's heap compactly: copy the page into a
//! scratch frame, recreate it empty, reinsert the records in order, then
//! re-align the lock table. It logs a single logical redo record before
//! switching the mini-transaction to `LogMode::None` for the rebuild; the
//! record order is fully determined by the schema and the pre-image, so
//! replaying the one record reproduces the reorganization.

use std::sync::Arc;

use eyre::{ensure, Result};

use crate::lock::reorganize_pairs;
use crate::mtr::{LogMode, MiniTransaction, PageLatch};
use crate::page::{Page, RecImage, INFIMUM_OFFSET, PAGE_MAX_REC_SIZE, PAGE_NIL};
use crate::storage::buffer::Block;
use crate::storage::redo::RedoOp;
use crate::storage::space::AllocDirection;

use super::BTree;

impl BTree<'_> {
    /// Creates the root node of a new index tree: its segments (or the
    /// insert-buffer free list) and the empty root page. Returns the root
    /// page number, or `None` when the tablespace is exhausted.
    pub fn create(&self, mtr: &mut MiniTransaction) -> Result<Option<u32>> {
        let space = self.eng.space(self.index.space_id)?;
        let comp = self.index.is_comp();

        let Some((seg_top, root_no)) = space.create_segment_with_page() else {
            return Ok(None);
        };
        // The insert-buffer tree has no leaf segment: its pages cycle
        // through the free list on the root.
        let seg_leaf = if self.index.is_ibuf() {
            0
        } else {
            space.create_segment()
        };

        self.index.set_root_page(root_no);
        let root = mtr.page_get(&self.eng.buf, self.index.space_id, root_no, PageLatch::X);
        {
            let mut pm = mtr.page_mut(&root)?;
            pm.create(comp);
            pm.set_level(0);
            pm.set_index_id(self.index.id);
            pm.set_prev(PAGE_NIL);
            pm.set_next(PAGE_NIL);
            pm.set_seg_top(seg_top);
            pm.set_seg_leaf(seg_leaf);
            if self.index.is_ibuf() {
                pm.set_ibuf_free_head(PAGE_NIL);
                pm.set_ibuf_free_len(0);
            }
        }
        root.set_check_index_on_flush();

        // Several trees may be created in one mini-transaction; reset the
        // hint directly rather than latching a bitmap page.
        self.eng.ibuf_reset_free_bits(self.index.space_id, root_no);

        // Two records of maximum allowed size must fit on the empty root,
        // or the split algorithms cannot make progress.
        debug_assert!(mtr.page(&root)?.max_insert_size(2) > 2 * PAGE_MAX_REC_SIZE);

        Ok(Some(root_no))
    }

    /// Initializes a freshly allocated page at `level`.
    pub(crate) fn page_create(
        &self,
        mtr: &mut MiniTransaction,
        block: &Arc<Block>,
        level: u16,
    ) -> Result<()> {
        debug_assert!(mtr.has_page_x(block));
        let mut pm = mtr.page_mut(block)?;
        pm.create(self.index.is_comp());
        pm.set_level(level);
        pm.set_index_id(self.index.id);
        drop(pm);
        block.set_check_index_on_flush();
        Ok(())
    }

    /// Allocates a new page for the tree, X-latched, or `None` when the
    /// space is exhausted. The caller must hold an extent reservation;
    /// insert-buffer trees pop their root free list instead.
    pub fn page_alloc(
        &self,
        mtr: &mut MiniTransaction,
        hint_page_no: u32,
        direction: AllocDirection,
        level: u16,
    ) -> Result<Option<Arc<Block>>> {
        if self.index.is_ibuf() {
            return self.page_alloc_for_ibuf(mtr).map(Some);
        }

        let space = self.eng.space(self.index.space_id)?;
        let root = self.root_get(mtr)?;
        let page = mtr.page(&root)?;
        let seg = if level == 0 {
            page.header().seg_leaf()
        } else {
            page.header().seg_top()
        };

        let Some(page_no) = space.alloc_page(seg, hint_page_no, direction, true) else {
            return Ok(None);
        };
        let block = mtr.page_get(&self.eng.buf, self.index.space_id, page_no, PageLatch::X);
        Ok(Some(block))
    }

    /// Pops a page from the insert-buffer free list on the root, which
    /// must not be empty.
    fn page_alloc_for_ibuf(&self, mtr: &mut MiniTransaction) -> Result<Arc<Block>> {
        let root = self.root_get(mtr)?;
        let (head, len) = {
            let page = mtr.page(&root)?;
            (page.header().ibuf_free_head(), page.header().ibuf_free_len())
        };
        ensure!(
            head != PAGE_NIL && len > 0,
            "insert-buffer tree {} has an empty free list",
            self.index.id
        );

        let block = mtr.page_get(&self.eng.buf, self.index.space_id, head, PageLatch::X);
        let next_free = mtr.page(&block)?.next();
        let mut pm = mtr.page_mut(&root)?;
        pm.set_ibuf_free_head(next_free);
        pm.set_ibuf_free_len(len - 1);
        Ok(block)
    }

    fn page_free_for_ibuf(&self, mtr: &mut MiniTransaction, block: &Arc<Block>) -> Result<()> {
        let root = self.root_get(mtr)?;
        let (head, len) = {
            let page = mtr.page(&root)?;
            (page.header().ibuf_free_head(), page.header().ibuf_free_len())
        };
        // The freed page's next field doubles as the free-list link.
        let page_no = block.page_no();
        {
            let mut pm = mtr.page_mut(block)?;
            pm.set_next(head);
        }
        let mut pm = mtr.page_mut(&root)?;
        pm.set_ibuf_free_head(page_no);
        pm.set_ibuf_free_len(len + 1);
        Ok(())
    }

    /// Frees a page of the tree. The page must be X-latched; its level
    /// decides the segment it returns to.
    pub fn page_free(&self, mtr: &mut MiniTransaction, block: &Arc<Block>) -> Result<()> {
        debug_assert!(mtr.has_page_x(block));

        // The page goes invalid for optimistic handles and cached probes.
        self.eng
            .search
            .drop_page_hash(self.index.space_id, block.page_no());
        block.modify_clock_inc();

        if self.index.is_ibuf() {
            return self.page_free_for_ibuf(mtr, block);
        }

        let level = mtr.page(block)?.level();
        let root = self.root_get(mtr)?;
        let page = mtr.page(&root)?;
        let seg = if level == 0 {
            page.header().seg_leaf()
        } else {
            page.header().seg_top()
        };
        let space = self.eng.space(self.index.space_id)?;
        space.free_page(seg, block.page_no());
        Ok(())
    }

    /// Empties a page, preserving its global header fields (siblings,
    /// level, segment headers on the root).
    pub(crate) fn page_empty(&self, mtr: &mut MiniTransaction, block: &Arc<Block>) -> Result<()> {
        self.eng
            .search
            .drop_page_hash(self.index.space_id, block.page_no());
        let mut pm = mtr.page_mut(block)?;
        pm.create(self.index.is_comp());
        drop(pm);
        block.set_check_index_on_flush();
        Ok(())
    }

    /// Reorganizes a page to reclaim fragmented space.
    pub fn page_reorganize(&self, mtr: &mut MiniTransaction, block: &Arc<Block>) -> Result<bool> {
        self.page_reorganize_low(false, mtr, block)
    }

    /// The reorganize body. In recovery the lock table and the adaptive
    /// cache are untouched: neither can hold entries for the page.
    pub(crate) fn page_reorganize_low(
        &self,
        recovery: bool,
        mtr: &mut MiniTransaction,
        block: &Arc<Block>,
    ) -> Result<bool> {
        debug_assert!(mtr.has_page_x(block));
        let comp = self.index.is_comp();
        let page_no = block.page_no();

        let (data_size_before, max_ins_before, image) = {
            let page = mtr.page(block)?;
            ensure!(
                page.is_comp() == comp,
                "page {} compact flag disagrees with its index",
                page_no
            );
            (
                page.data_size(),
                page.max_insert_size_after_reorganize(1),
                page.bytes().to_vec(),
            )
        };

        // The one logical record; everything below runs unlogged.
        {
            let mut pm = mtr.page_mut(block)?;
            pm.emit(RedoOp::Reorganize { comp });
        }
        let old_mode = mtr.set_log_mode(LogMode::None);

        let mut scratch = self.eng.buf.block_alloc();
        scratch.bytes.copy_from_slice(&image);
        let before = Page::from_bytes(&scratch.bytes[..])?;
        let images: Vec<RecImage> = before.rec_images();
        let saved_max_trx_id = before.max_trx_id();

        if !recovery {
            self.eng.search.drop_page_hash(self.index.space_id, page_no);
        }

        let mut rebuilt = true;
        {
            let mut pm = mtr.page_mut(block)?;
            pm.create(comp);
            let mut prev = INFIMUM_OFFSET;
            for img in &images {
                match pm.insert_rec_after(prev, img.info, img.status, &img.payload) {
                    Some(off) => prev = off,
                    None => {
                        rebuilt = false;
                        break;
                    }
                }
            }
            if rebuilt {
                pm.set_max_trx_id(saved_max_trx_id);
            }
        }

        if !rebuilt {
            // Recompression failed; put the pre-image back and report
            // failure. The caller decides what to do with the page.
            let mut pm = mtr.page_mut(block)?;
            pm.write_frame_image(&image);
            mtr.set_log_mode(old_mode);
            return Ok(false);
        }
        block.set_check_index_on_flush();

        if !recovery {
            let after = mtr.page(block)?;
            let pairs = reorganize_pairs(&before, &after);
            self.eng
                .locks
                .move_reorganize_page(self.index.space_id, page_no, &pairs);
        }

        let (data_size_after, max_ins_after) = {
            let page = mtr.page(block)?;
            (page.data_size(), page.max_insert_size_after_reorganize(1))
        };

        let success = data_size_before == data_size_after && max_ins_before == max_ins_after;
        if !success {
            let page = mtr.page(block)?;
            self.eng.diag.dump_page("page after reorganize", &page);
            self.eng.diag.dump_page("page before reorganize", &before);
            self.eng.diag.report(&format!(
                "reorganize of page {} changed sizes: data {} -> {}, max insert {} -> {}",
                page_no, data_size_before, data_size_after, max_ins_before, max_ins_after
            ));
        }

        mtr.set_log_mode(old_mode);
        Ok(success)
    }
}
