//! # Engine Context
//!
//! The shared subsystems a tree operation runs against: buffer pool,
//! tablespaces, lock table, adaptive search cache, redo log, and the
//! diagnostic sink. One [`Engine`] serves any number of index trees;
//! parallel threads mutate independent trees concurrently, serialized only
//! by per-tree and per-page latches.

use std::path::Path;
use std::sync::Arc;

use eyre::{eyre, Result};
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};

use crate::diag::DiagSink;
use crate::lock::LockTable;
use crate::mtr::MiniTransaction;
use crate::page::{Page, PAGE_SIZE};
use crate::search::SearchCache;
use crate::storage::buffer::BufferPool;
use crate::storage::redo::RedoLog;
use crate::storage::space::Space;

pub struct Engine {
    pub buf: BufferPool,
    pub locks: LockTable,
    pub search: SearchCache,
    pub redo: Arc<RedoLog>,
    pub diag: DiagSink,
    spaces: RwLock<HashMap<u32, Arc<Space>>>,
    free_bits: Mutex<HashMap<(u32, u32), u8>>,
}

impl Engine {
    pub fn create(log_dir: &Path) -> Result<Self> {
        Ok(Self::with_parts(
            BufferPool::new(),
            Arc::new(RedoLog::create(log_dir)?),
        ))
    }

    /// Opens against an existing redo log directory; the caller replays
    /// the scanned batches onto its pages.
    pub fn open(log_dir: &Path) -> Result<Self> {
        Ok(Self::with_parts(
            BufferPool::new(),
            Arc::new(RedoLog::open(log_dir)?),
        ))
    }

    pub fn with_parts(buf: BufferPool, redo: Arc<RedoLog>) -> Self {
        Self {
            buf,
            locks: LockTable::new(),
            search: SearchCache::new(),
            redo,
            diag: DiagSink::new(),
            spaces: RwLock::new(HashMap::new()),
            free_bits: Mutex::new(HashMap::new()),
        }
    }

    pub fn add_space(&self, id: u32, max_pages: u32) -> Arc<Space> {
        let space = Arc::new(Space::new(id, max_pages));
        self.spaces.write().insert(id, Arc::clone(&space));
        space
    }

    pub fn space(&self, id: u32) -> Result<Arc<Space>> {
        self.spaces
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| eyre!("tablespace {} is not registered", id))
    }

    pub fn mtr(&self) -> MiniTransaction {
        MiniTransaction::new(Arc::clone(&self.redo))
    }

    // Insert-buffer free-bits hints. Two bits of free-space category per
    // page, kept beside the tree rather than inside it; only ever a hint.

    fn compute_free_bits(page: &Page<'_>) -> u8 {
        let free = page.max_insert_size_after_reorganize(1);
        (free / (PAGE_SIZE / 8)).min(3) as u8
    }

    /// Conservatively zeroes the hint, as page creation and lift do.
    pub fn ibuf_reset_free_bits(&self, space_id: u32, page_no: u32) {
        self.free_bits.lock().insert((space_id, page_no), 0);
    }

    pub fn ibuf_update_free_bits(&self, space_id: u32, page: &Page<'_>) {
        self.free_bits
            .lock()
            .insert((space_id, page.page_no()), Self::compute_free_bits(page));
    }

    /// Updates both halves of a split in one step, inside the same
    /// mini-transaction as the split itself.
    pub fn ibuf_update_free_bits_for_two_pages(
        &self,
        space_id: u32,
        left: &Page<'_>,
        right: &Page<'_>,
    ) {
        let mut bits = self.free_bits.lock();
        bits.insert((space_id, left.page_no()), Self::compute_free_bits(left));
        bits.insert((space_id, right.page_no()), Self::compute_free_bits(right));
    }

    pub fn ibuf_free_bits(&self, space_id: u32, page_no: u32) -> u8 {
        self.free_bits
            .lock()
            .get(&(space_id, page_no))
            .copied()
            .unwrap_or(0)
    }
}
