//! # Mini-Transactions
//!
//! A mini-transaction groups the page mutations of one short structural or
//! record operation: it owns the latches the operation acquires (the memo)
//! and buffers the redo records the mutations emit. Commit appends the
//! records to the redo log as one checksummed batch, stamps the batch LSN
//! into every touched page, and releases the latches.
//!
//! ## Memo
//!
//! The memo holds owned latch guards: tree S/X latches, page S/X latches,
//! and buffer-fixes (a block handle with no latch, legal on non-leaf pages
//! while the tree latch excludes structural changes). Page byte access
//! flows through the memo — [`MiniTransaction::page`] and
//! [`MiniTransaction::page_mut`] find the guard and lend out a view — so a
//! page cannot be touched by a mini-transaction that has not latched it.
//!
//! ## Log Modes
//!
//! `set_log_mode(LogMode::None)` suspends redo emission; page reorganize
//! logs a single logical record, then rebuilds the page under `None` since
//! replaying that one record reproduces the whole rebuild.
//!
//! ## Commit on Drop
//!
//! Dropping an uncommitted mini-transaction commits it. Every latch is
//! released on every exit path, panics included; a failed commit inside
//! drop is reported through the diagnostic stream rather than unwinding.

use std::sync::Arc;

use eyre::{bail, Result};
use hashbrown::HashSet;
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{RawRwLock, RwLock};

use crate::page::{stamp_lsn, Page, PageMut, RedoSink};
use crate::storage::buffer::{Block, BufferPool, Frame};
use crate::storage::redo::{RedoLog, RedoRecord};

type FrameReadGuard = ArcRwLockReadGuard<RawRwLock, Frame>;
type FrameWriteGuard = ArcRwLockWriteGuard<RawRwLock, Frame>;
type TreeReadGuard = ArcRwLockReadGuard<RawRwLock, ()>;
type TreeWriteGuard = ArcRwLockWriteGuard<RawRwLock, ()>;

/// The tree latch: one per index, serializing structural changes.
pub type TreeLatch = Arc<RwLock<()>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogMode {
    All,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageLatch {
    S,
    X,
    BufFix,
}

enum MemoEntry {
    PageS {
        block: Arc<Block>,
        guard: FrameReadGuard,
    },
    PageX {
        block: Arc<Block>,
        guard: FrameWriteGuard,
    },
    BufFix {
        block: Arc<Block>,
    },
    TreeS {
        latch: TreeLatch,
        _guard: TreeReadGuard,
    },
    TreeX {
        latch: TreeLatch,
        _guard: TreeWriteGuard,
    },
}

pub struct MiniTransaction {
    redo: Arc<RedoLog>,
    memo: Vec<MemoEntry>,
    records: Vec<RedoRecord>,
    log_mode: LogMode,
    committed: bool,
}

impl MiniTransaction {
    pub fn new(redo: Arc<RedoLog>) -> Self {
        Self {
            redo,
            memo: Vec::new(),
            records: Vec::new(),
            log_mode: LogMode::All,
            committed: false,
        }
    }

    // Tree latches.

    pub fn x_latch_tree(&mut self, latch: &TreeLatch) {
        if self.has_tree_x(latch) {
            return;
        }
        let guard = latch.write_arc();
        self.memo.push(MemoEntry::TreeX {
            latch: Arc::clone(latch),
            _guard: guard,
        });
    }

    pub fn s_latch_tree(&mut self, latch: &TreeLatch) {
        if self.has_tree_s(latch) || self.has_tree_x(latch) {
            return;
        }
        let guard = latch.read_arc();
        self.memo.push(MemoEntry::TreeS {
            latch: Arc::clone(latch),
            _guard: guard,
        });
    }

    pub fn has_tree_x(&self, latch: &TreeLatch) -> bool {
        self.memo.iter().any(
            |e| matches!(e, MemoEntry::TreeX { latch: l, .. } if Arc::ptr_eq(l, latch)),
        )
    }

    pub fn has_tree_s(&self, latch: &TreeLatch) -> bool {
        self.memo.iter().any(
            |e| matches!(e, MemoEntry::TreeS { latch: l, .. } if Arc::ptr_eq(l, latch)),
        )
    }

    /// Releases the tree X-latch early, before commit. The split path uses
    /// this once parent pointers and level links are consistent, so record
    /// movement does not hold up other structural operations.
    pub fn release_tree_x(&mut self, latch: &TreeLatch) {
        self.memo.retain(
            |e| !matches!(e, MemoEntry::TreeX { latch: l, .. } if Arc::ptr_eq(l, latch)),
        );
    }

    pub fn release_tree_s(&mut self, latch: &TreeLatch) {
        self.memo.retain(
            |e| !matches!(e, MemoEntry::TreeS { latch: l, .. } if Arc::ptr_eq(l, latch)),
        );
    }

    // Page latches.

    pub fn latch_block(&mut self, block: &Arc<Block>, latch: PageLatch) {
        match latch {
            PageLatch::X => {
                if self.has_page_x(block) {
                    return;
                }
                debug_assert!(
                    !self.has_page_s(block),
                    "S to X page latch upgrade is not supported"
                );
                let guard = block.latch().write_arc();
                self.memo.push(MemoEntry::PageX {
                    block: Arc::clone(block),
                    guard,
                });
            }
            PageLatch::S => {
                if self.has_page_x(block) || self.has_page_s(block) {
                    return;
                }
                let guard = block.latch().read_arc();
                self.memo.push(MemoEntry::PageS {
                    block: Arc::clone(block),
                    guard,
                });
            }
            PageLatch::BufFix => {
                self.memo.push(MemoEntry::BufFix {
                    block: Arc::clone(block),
                });
            }
        }
    }

    /// Fetches a block from the pool and latches it in one step.
    pub fn page_get(
        &mut self,
        buf: &BufferPool,
        space_id: u32,
        page_no: u32,
        latch: PageLatch,
    ) -> Arc<Block> {
        let block = buf.block_get(space_id, page_no);
        self.latch_block(&block, latch);
        block
    }

    pub fn has_page_x(&self, block: &Arc<Block>) -> bool {
        self.memo.iter().any(
            |e| matches!(e, MemoEntry::PageX { block: b, .. } if Arc::ptr_eq(b, block)),
        )
    }

    pub fn has_page_s(&self, block: &Arc<Block>) -> bool {
        self.memo.iter().any(
            |e| matches!(e, MemoEntry::PageS { block: b, .. } if Arc::ptr_eq(b, block)),
        )
    }

    /// S- or X-latched; the precondition for crossing to a sibling page.
    pub fn has_page_latch(&self, block: &Arc<Block>) -> bool {
        self.has_page_x(block) || self.has_page_s(block)
    }

    // Page access.

    pub fn frame(&self, block: &Arc<Block>) -> Result<&Frame> {
        for e in &self.memo {
            match e {
                MemoEntry::PageS { block: b, guard } if Arc::ptr_eq(b, block) => return Ok(guard),
                MemoEntry::PageX { block: b, guard } if Arc::ptr_eq(b, block) => return Ok(guard),
                _ => {}
            }
        }
        bail!(
            "page {}:{} is not latched in this mini-transaction",
            block.space_id(),
            block.page_no()
        )
    }

    pub fn page(&self, block: &Arc<Block>) -> Result<Page<'_>> {
        Page::from_bytes(&self.frame(block)?.bytes[..])
    }

    /// Write view over an X-latched page, wired to this mini-transaction's
    /// redo buffer.
    pub fn page_mut(&mut self, block: &Arc<Block>) -> Result<PageMut<'_>> {
        let Self {
            memo,
            records,
            log_mode,
            ..
        } = self;
        for e in memo.iter_mut() {
            if let MemoEntry::PageX { block: b, guard } = e {
                if Arc::ptr_eq(b, block) {
                    let frame: &mut Frame = &mut *guard;
                    return PageMut::new(
                        &mut frame.bytes[..],
                        frame.zip.as_mut(),
                        RedoSink {
                            records,
                            enabled: *log_mode == LogMode::All,
                            space_id: block.space_id(),
                            page_no: block.page_no(),
                        },
                    );
                }
            }
        }
        bail!(
            "page {}:{} is not X-latched in this mini-transaction",
            block.space_id(),
            block.page_no()
        )
    }

    /// Reads through a buffer-fixed block: the page latch is held only for
    /// the duration of the closure. Used on non-leaf pages during a
    /// descent, where the tree latch already excludes structural changes.
    /// A block this mini-transaction has already latched is read through
    /// the memo guard; the per-page latch is not re-entrant.
    pub fn with_buf_fixed_page<R>(
        &self,
        block: &Arc<Block>,
        f: impl FnOnce(Page<'_>) -> R,
    ) -> R {
        if let Ok(frame) = self.frame(block) {
            // INVARIANT: frames are always page-sized
            return f(Page::from_bytes(&frame.bytes[..]).unwrap());
        }
        let guard = block.latch().read();
        f(Page::from_bytes(&guard.bytes[..]).unwrap())
    }

    // Logging.

    pub fn set_log_mode(&mut self, mode: LogMode) -> LogMode {
        std::mem::replace(&mut self.log_mode, mode)
    }

    pub fn log_mode(&self) -> LogMode {
        self.log_mode
    }

    pub fn n_log_records(&self) -> usize {
        self.records.len()
    }

    fn do_commit(&mut self) -> Result<u64> {
        self.committed = true;
        let records = std::mem::take(&mut self.records);
        if records.is_empty() {
            self.memo.clear();
            return Ok(0);
        }

        let lsn = self.redo.append(&records)?;

        let touched: HashSet<(u32, u32)> = records
            .iter()
            .map(|r| (r.space_id, r.page_no))
            .collect();
        for e in self.memo.iter_mut() {
            if let MemoEntry::PageX { block, guard } = e {
                if touched.contains(&(block.space_id(), block.page_no())) {
                    let frame: &mut Frame = &mut *guard;
                    stamp_lsn(&mut frame.bytes[..], frame.zip.as_mut(), lsn);
                }
            }
        }

        self.memo.clear();
        Ok(lsn)
    }

    /// Flushes the redo batch and releases every latch. Returns the batch
    /// LSN, or 0 when nothing was logged.
    pub fn commit(mut self) -> Result<u64> {
        self.do_commit()
    }
}

impl Drop for MiniTransaction {
    fn drop(&mut self) {
        if !self.committed {
            if let Err(err) = self.do_commit() {
                tracing::error!(?err, "mini-transaction commit failed during drop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{RecStatus, INFIMUM_OFFSET};
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, Arc<RedoLog>, BufferPool) {
        let dir = tempdir().unwrap();
        let redo = Arc::new(RedoLog::create(dir.path()).unwrap());
        (dir, redo, BufferPool::new())
    }

    #[test]
    fn page_access_requires_latch() {
        let (_dir, redo, buf) = setup();
        let block = buf.block_get(0, 1);

        let mut mtr = MiniTransaction::new(Arc::clone(&redo));
        assert!(mtr.page(&block).is_err());
        assert!(mtr.page_mut(&block).is_err());

        mtr.latch_block(&block, PageLatch::S);
        assert!(mtr.page(&block).is_ok());
        assert!(mtr.page_mut(&block).is_err());
        mtr.commit().unwrap();
    }

    #[test]
    fn commit_stamps_lsn_and_appends_batch() {
        let (_dir, redo, buf) = setup();
        let block = buf.block_get(0, 1);

        let mut mtr = MiniTransaction::new(Arc::clone(&redo));
        mtr.latch_block(&block, PageLatch::X);
        {
            let mut pm = mtr.page_mut(&block).unwrap();
            pm.create(true);
            pm.insert_rec_after(INFIMUM_OFFSET, 0, RecStatus::Data, &[2, 0, 7, 7])
                .unwrap();
        }
        let lsn = mtr.commit().unwrap();
        assert!(lsn > 0);

        let frame = block.latch().read();
        let page = Page::from_bytes(&frame.bytes[..]).unwrap();
        assert_eq!(page.lsn(), lsn);
        drop(frame);

        let batches = redo.scan().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].lsn, lsn);
        assert_eq!(batches[0].records.len(), 2);
    }

    #[test]
    fn log_none_suppresses_records() {
        let (_dir, redo, buf) = setup();
        let block = buf.block_get(0, 1);

        let mut mtr = MiniTransaction::new(Arc::clone(&redo));
        mtr.latch_block(&block, PageLatch::X);
        let old = mtr.set_log_mode(LogMode::None);
        assert_eq!(old, LogMode::All);
        {
            let mut pm = mtr.page_mut(&block).unwrap();
            pm.create(true);
        }
        mtr.set_log_mode(LogMode::All);
        assert_eq!(mtr.n_log_records(), 0);
        mtr.commit().unwrap();
        assert!(redo.scan().unwrap().is_empty());
    }

    #[test]
    fn drop_commits_and_releases_latches() {
        let (_dir, redo, buf) = setup();
        let block = buf.block_get(0, 1);

        {
            let mut mtr = MiniTransaction::new(Arc::clone(&redo));
            mtr.latch_block(&block, PageLatch::X);
            let mut pm = mtr.page_mut(&block).unwrap();
            pm.create(true);
            // No explicit commit.
        }
        // The latch must be free again and the batch durable.
        assert!(block.latch().try_write().is_some());
        assert_eq!(redo.scan().unwrap().len(), 1);
    }

    #[test]
    fn tree_latch_release_is_selective() {
        let (_dir, redo, _buf) = setup();
        let latch: TreeLatch = Arc::new(RwLock::new(()));

        let mut mtr = MiniTransaction::new(redo);
        mtr.x_latch_tree(&latch);
        assert!(mtr.has_tree_x(&latch));
        assert!(latch.try_read().is_none());

        mtr.release_tree_x(&latch);
        assert!(!mtr.has_tree_x(&latch));
        assert!(latch.try_read().is_some());
        mtr.commit().unwrap();
    }

    #[test]
    fn relatch_same_page_is_idempotent() {
        let (_dir, redo, buf) = setup();
        let block = buf.block_get(0, 9);
        let mut mtr = MiniTransaction::new(redo);
        mtr.latch_block(&block, PageLatch::X);
        mtr.latch_block(&block, PageLatch::X);
        assert!(mtr.page_mut(&block).is_ok());
        mtr.commit().unwrap();
    }
}
