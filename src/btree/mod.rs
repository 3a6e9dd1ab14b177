//! # B-Tree Index Engine
//!
//! Ordered, disk-resident, multi-level index trees over fixed-size pages:
//! concurrent search, insert, delete, structural modification (split,
//! merge, lift, root raise), and crash-recoverable mutation through the
//! redo log.
//!
//! ## Latching Strategy
//!
//! A tree latch protects all non-leaf nodes of a tree; each page also has
//! a latch of its own.
//!
//! An operation normally takes the tree S-latch, descends without latching
//! the non-leaf pages it passes (they are only buffer-fixed; the tree
//! latch excludes structural change), latches the leaf, and releases the
//! tree latch. An operation that may restructure the tree takes the tree
//! X-latch before descending and X-latches the pages it works on. A leaf
//! split decides the split point, allocates the new page, wires the node
//! pointer into the level above, releases the tree X-latch, and only then
//! moves records — so record movement does not hold up the rest of the
//! tree.
//!
//! ## Node Pointers
//!
//! Leaf pages store the index records themselves. Each level above stores
//! one node pointer per child page: a key prefix long enough to route
//! uniquely, plus the child page number as a trailing 4-byte field. The
//! leftmost node pointer of every level carries the minimum-record flag
//! and acts as minus infinity, so arbitrary deletions at the left edge of
//! a leaf never touch the levels above.
//!
//! ## File Page Allocation
//!
//! The root page of every tree carries two file segment headers: leaf
//! pages are allocated from one segment, non-leaf pages from the other,
//! keeping each level as contiguous on disk as possible. The insert-buffer
//! tree instead draws pages from a free list anchored on its root.
//!
//! ## Module Organization
//!
//! - `node_ptr`: node-pointer build/read/rewrite and the father lookup
//! - `lifecycle`: tree create/free, page alloc/free, empty, reorganize
//! - `mutate`: root raise, split, merge, lift, discard
//! - `redo`: the reorganize and min-rec-mark redo records
//! - `validate`: record-shape and level-walk consistency checks
//! - `cursor`: latched descent and the optimistic/pessimistic operation
//!   drivers

pub mod cursor;
pub mod lifecycle;
pub mod mutate;
pub mod node_ptr;
pub mod redo;
pub mod validate;

use std::sync::Arc;

use eyre::{ensure, Result};

use crate::engine::Engine;
use crate::index::Index;
use crate::mtr::{MiniTransaction, PageLatch};
use crate::storage::buffer::Block;

pub use cursor::{LatchIntent, TreeCursor};

/// Which page population [`BTree::get_size`] counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeKind {
    LeafPages,
    TotalSize,
}

/// Handle binding one index tree to the engine it lives in.
pub struct BTree<'e> {
    pub eng: &'e Engine,
    pub index: Arc<Index>,
}

impl<'e> BTree<'e> {
    pub fn new(eng: &'e Engine, index: Arc<Index>) -> Self {
        Self { eng, index }
    }

    /// Gets the root page of the tree, X-latched.
    pub fn root_get(&self, mtr: &mut MiniTransaction) -> Result<Arc<Block>> {
        let root = mtr.page_get(
            &self.eng.buf,
            self.index.space_id,
            self.index.root_page(),
            PageLatch::X,
        );
        let page = mtr.page(&root)?;
        ensure!(
            page.is_comp() == self.index.is_comp(),
            "root page {} compact flag {} disagrees with index {}",
            page.page_no(),
            page.is_comp(),
            self.index.id
        );
        Ok(root)
    }

    /// Number of pages in the tree, from the segment bookkeeping.
    pub fn get_size(&self, flag: SizeKind) -> Result<u32> {
        let space = self.eng.space(self.index.space_id)?;
        let mut mtr = self.eng.mtr();
        mtr.s_latch_tree(self.index.latch());

        let root = self.root_get(&mut mtr)?;
        let page = mtr.page(&root)?;
        let (seg_leaf, seg_top) = (page.header().seg_leaf(), page.header().seg_top());

        let n = match flag {
            SizeKind::LeafPages => space.seg_n_reserved_pages(seg_leaf),
            SizeKind::TotalSize => {
                space.seg_n_reserved_pages(seg_top) + space.seg_n_reserved_pages(seg_leaf)
            }
        };
        mtr.commit()?;
        Ok(n)
    }

    /// Frees every page of the tree except the root. The root must be
    /// freed afterwards with [`BTree::free_root`]. Each freed page gets
    /// its own mini-transaction so the tree latch is never held across the
    /// whole drop.
    pub fn free_but_not_root(&self) -> Result<()> {
        let space = self.eng.space(self.index.space_id)?;

        // Leaf segment first.
        loop {
            let mut mtr = self.eng.mtr();
            let root = self.root_get(&mut mtr)?;
            let seg_leaf = mtr.page(&root)?.header().seg_leaf();
            let freed = space.seg_free_step(seg_leaf);
            mtr.commit()?;
            match freed {
                Some(page_no) => {
                    self.eng.search.drop_page_hash(self.index.space_id, page_no);
                    self.eng
                        .buf
                        .block_get(self.index.space_id, page_no)
                        .modify_clock_inc();
                }
                None => break,
            }
        }

        // Then the non-leaf segment, sparing the root page.
        loop {
            let mut mtr = self.eng.mtr();
            let root = self.root_get(&mut mtr)?;
            let seg_top = mtr.page(&root)?.header().seg_top();
            let freed = space.seg_free_step_not_header(seg_top, self.index.root_page());
            mtr.commit()?;
            match freed {
                Some(page_no) => {
                    self.eng.search.drop_page_hash(self.index.space_id, page_no);
                    self.eng
                        .buf
                        .block_get(self.index.space_id, page_no)
                        .modify_clock_inc();
                }
                None => break,
            }
        }
        Ok(())
    }

    /// Frees the root page. The rest of the tree must already be gone.
    pub fn free_root(&self, mtr: &mut MiniTransaction) -> Result<()> {
        let space = self.eng.space(self.index.space_id)?;
        let root = self.root_get(mtr)?;
        self.eng
            .search
            .drop_page_hash(self.index.space_id, self.index.root_page());
        root.modify_clock_inc();

        let seg_top = mtr.page(&root)?.header().seg_top();
        while space.seg_free_step(seg_top).is_some() {}
        Ok(())
    }
}
