//! # Buffer Pool
//!
//! Latched access to page frames by `(space_id, page_no)`. Each resident
//! page is a [`Block`]: a 16KB heap frame plus an optional compressed
//! mirror, guarded by its own read-write latch. The pool itself is a
//! sharded map so that block lookup never serializes unrelated trees.
//!
//! ## Latching
//!
//! The pool hands out `Arc<Block>` handles; the per-page latch lives
//! inside the block and is taken through the mini-transaction memo as an
//! owned (`arc_lock`) guard. A search descent may also *buffer-fix* a
//! block: hold the handle without any latch, relying on the tree latch to
//! exclude structural changes.
//!
//! ## Modify Clock
//!
//! Every block carries a modify clock, incremented when the page is freed
//! or its record layout is rebuilt. Optimistic restarts compare clock
//! values instead of re-validating page contents.
//!
//! ## Scratch Frames
//!
//! Reorganize and the split fallback need a temporary page-sized buffer
//! that belongs to no space. [`BufferPool::block_alloc`] returns a scratch
//! frame that is dropped, not returned to the pool.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::page::{init_frame_identity, PageZip, PAGE_SIZE};

const SHARD_COUNT: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageKey {
    pub space_id: u32,
    pub page_no: u32,
}

impl PageKey {
    pub fn new(space_id: u32, page_no: u32) -> Self {
        Self { space_id, page_no }
    }
}

/// One resident page: the uncompressed frame and its optional compressed
/// mirror, mutated only under the block latch.
pub struct Frame {
    pub bytes: Box<[u8; PAGE_SIZE]>,
    pub zip: Option<PageZip>,
}

pub struct Block {
    key: PageKey,
    latch: Arc<RwLock<Frame>>,
    modify_clock: AtomicU64,
    check_index_on_flush: std::sync::atomic::AtomicBool,
}

impl Block {
    fn new(key: PageKey, zip_cap: Option<usize>) -> Self {
        let mut bytes: Box<[u8; PAGE_SIZE]> = vec![0u8; PAGE_SIZE]
            .into_boxed_slice()
            .try_into()
            .expect("frame allocation has page size");
        init_frame_identity(&mut bytes[..], key.space_id, key.page_no);
        Self {
            key,
            latch: Arc::new(RwLock::new(Frame {
                bytes,
                zip: zip_cap.map(PageZip::new),
            })),
            modify_clock: AtomicU64::new(0),
            check_index_on_flush: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> PageKey {
        self.key
    }

    pub fn space_id(&self) -> u32 {
        self.key.space_id
    }

    pub fn page_no(&self) -> u32 {
        self.key.page_no
    }

    pub fn latch(&self) -> &Arc<RwLock<Frame>> {
        &self.latch
    }

    pub fn modify_clock(&self) -> u64 {
        self.modify_clock.load(Ordering::Acquire)
    }

    /// Invalidates optimistic handles to this frame.
    pub fn modify_clock_inc(&self) {
        self.modify_clock.fetch_add(1, Ordering::AcqRel);
    }

    /// Marks the page for an index-consistency check when it is next
    /// flushed. Set whenever a page's record structure is rebuilt.
    pub fn set_check_index_on_flush(&self) {
        self.check_index_on_flush.store(true, Ordering::Release);
    }

    pub fn check_index_on_flush(&self) -> bool {
        self.check_index_on_flush.load(Ordering::Acquire)
    }
}

/// Page-sized buffer outside any space, for reorganize and copy fallbacks.
pub struct ScratchFrame {
    pub bytes: Box<[u8; PAGE_SIZE]>,
}

struct Shard {
    blocks: HashMap<PageKey, Arc<Block>>,
}

pub struct BufferPool {
    shards: Vec<RwLock<Shard>>,
    zip_cap: Option<usize>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::with_zip_cap(None)
    }

    /// Pool whose pages carry a compressed mirror of the given capacity.
    pub fn with_zip_cap(zip_cap: Option<usize>) -> Self {
        Self {
            shards: (0..SHARD_COUNT)
                .map(|_| {
                    RwLock::new(Shard {
                        blocks: HashMap::new(),
                    })
                })
                .collect(),
            zip_cap,
        }
    }

    fn shard(&self, key: &PageKey) -> &RwLock<Shard> {
        let hash = (key.space_id as usize)
            .wrapping_mul(31)
            .wrapping_add(key.page_no as usize);
        &self.shards[hash % SHARD_COUNT]
    }

    /// Returns the block for a page, materializing a zeroed frame on first
    /// touch. The caller latches it through its mini-transaction.
    pub fn block_get(&self, space_id: u32, page_no: u32) -> Arc<Block> {
        let key = PageKey::new(space_id, page_no);
        {
            let shard = self.shard(&key).read();
            if let Some(block) = shard.blocks.get(&key) {
                return Arc::clone(block);
            }
        }
        let mut shard = self.shard(&key).write();
        Arc::clone(
            shard
                .blocks
                .entry(key)
                .or_insert_with(|| Arc::new(Block::new(key, self.zip_cap))),
        )
    }

    /// Allocates a scratch frame that belongs to no space.
    pub fn block_alloc(&self) -> ScratchFrame {
        ScratchFrame {
            bytes: vec![0u8; PAGE_SIZE]
                .into_boxed_slice()
                .try_into()
                .expect("frame allocation has page size"),
        }
    }

    pub fn resident_count(&self) -> usize {
        self.shards.iter().map(|s| s.read().blocks.len()).sum()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_get_is_idempotent() {
        let pool = BufferPool::new();
        let a = pool.block_get(1, 7);
        let b = pool.block_get(1, 7);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(pool.resident_count(), 1);
    }

    #[test]
    fn distinct_pages_get_distinct_blocks() {
        let pool = BufferPool::new();
        let a = pool.block_get(1, 7);
        let b = pool.block_get(1, 8);
        let c = pool.block_get(2, 7);
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn fresh_frame_carries_identity() {
        let pool = BufferPool::new();
        let block = pool.block_get(3, 11);
        let frame = block.latch().read();
        let page = crate::page::Page::from_bytes(&frame.bytes[..]).unwrap();
        assert_eq!(page.space_id(), 3);
        assert_eq!(page.page_no(), 11);
        assert_eq!(page.prev(), crate::page::PAGE_NIL);
        assert_eq!(page.next(), crate::page::PAGE_NIL);
    }

    #[test]
    fn zip_pool_attaches_mirrors() {
        let pool = BufferPool::with_zip_cap(Some(4096));
        let block = pool.block_get(1, 1);
        assert!(block.latch().read().zip.is_some());
    }

    #[test]
    fn modify_clock_increments() {
        let pool = BufferPool::new();
        let block = pool.block_get(1, 1);
        let before = block.modify_clock();
        block.modify_clock_inc();
        assert_eq!(block.modify_clock(), before + 1);
    }
}
