//! # Tree Redo Records
//!
//! The two redo records this engine defines beyond the generic page
//! mutations: page reorganize (an empty-body logical record; the schema
//! and the page pre-image determine the result) and the min-rec mark (a
//! 2-byte record offset). Each comes in a compact and an old-format
//! opcode, carried in [`RedoOp`] by the `comp` flag.
//!
//! This module also hosts the recovery driver: it replays scanned batches
//! against the buffer pool, skipping any page whose stamped LSN already
//! covers a batch, so replay is idempotent.

use std::sync::Arc;

use eyre::{ensure, Result};
use hashbrown::HashMap;

use crate::engine::Engine;
use crate::index::Index;
use crate::mtr::{LogMode, MiniTransaction, PageLatch};
use crate::page::{PageMut, REC_INFO_MIN_REC};
use crate::storage::buffer::Block;
use crate::storage::redo::{self, RedoBatch, RedoOp};

use super::BTree;

impl BTree<'_> {
    /// Sets the minimum-record flag on a record and logs it. The record
    /// acts as minus infinity afterwards.
    pub fn set_min_rec_mark(
        &self,
        mtr: &mut MiniTransaction,
        block: &Arc<Block>,
        rec: u16,
    ) -> Result<()> {
        let comp = self.index.is_comp();
        let mut pm = mtr.page_mut(block)?;
        let info = pm.page().rec_info(rec) | REC_INFO_MIN_REC;
        pm.write_rec_info_raw(rec, info);
        pm.emit(RedoOp::MinRecMark { offset: rec, comp });
        Ok(())
    }

    /// Parses and replays a reorganize record. The body is empty beyond
    /// the opcode; with a page present the reorganization is re-run
    /// against it in recovery mode (no lock table, no search cache).
    /// Returns the rest of the buffer.
    pub fn parse_page_reorganize<'a>(
        &self,
        ptr: &'a [u8],
        mtr: &mut MiniTransaction,
        block: Option<&Arc<Block>>,
    ) -> Result<&'a [u8]> {
        if let Some(block) = block {
            self.page_reorganize_low(true, mtr, block)?;
        }
        Ok(ptr)
    }
}

/// Parses a min-rec-mark record body: a 2-byte record offset. Applies the
/// flag when a page is given. Returns the rest of the buffer, or `None`
/// when the body is truncated.
pub fn parse_set_min_rec_mark<'a>(
    ptr: &'a [u8],
    comp: bool,
    page: Option<&mut PageMut<'_>>,
) -> Option<&'a [u8]> {
    if ptr.len() < 2 {
        return None;
    }
    let offset = u16::from_le_bytes([ptr[0], ptr[1]]);
    if let Some(pm) = page {
        debug_assert_eq!(pm.page().is_comp(), comp);
        let info = pm.page().rec_info(offset) | REC_INFO_MIN_REC;
        pm.write_rec_info_raw(offset, info);
    }
    Some(&ptr[2..])
}

/// Replays redo batches onto the buffer pool. A page whose stamped LSN is
/// at or past a batch skips it, making the replay idempotent; pages an
/// applied batch touched are stamped with the batch LSN afterwards.
/// Returns the number of records applied.
pub fn recover(eng: &Engine, indexes: &[Arc<Index>], batches: &[RedoBatch]) -> Result<u32> {
    let by_id: HashMap<u64, &Arc<Index>> = indexes.iter().map(|ix| (ix.id, ix)).collect();
    let mut applied = 0u32;

    for batch in batches {
        let mut mtr = eng.mtr();
        mtr.set_log_mode(LogMode::None);
        let mut touched: Vec<Arc<Block>> = Vec::new();

        for rec in &batch.records {
            let block = eng.buf.block_get(rec.space_id, rec.page_no);
            if !mtr.has_page_x(&block) {
                mtr.latch_block(&block, PageLatch::X);
                touched.push(Arc::clone(&block));
            }
            if mtr.page(&block)?.lsn() >= batch.lsn {
                continue;
            }

            match &rec.op {
                RedoOp::Reorganize { .. } => {
                    let index_id = mtr.page(&block)?.index_id();
                    let index = by_id.get(&index_id).ok_or_else(|| {
                        eyre::eyre!("reorganize replay for unknown index {}", index_id)
                    })?;
                    let tree = BTree::new(eng, Arc::clone(index));
                    tree.page_reorganize_low(true, &mut mtr, &block)?;
                }
                op => {
                    let mut pm = mtr.page_mut(&block)?;
                    let handled = redo::apply(op, &mut pm)?;
                    ensure!(handled, "generic redo apply refused op {:?}", op);
                }
            }
            applied += 1;
        }

        for block in &touched {
            if mtr.page(block)?.lsn() < batch.lsn {
                mtr.page_mut(block)?.set_lsn(batch.lsn);
            }
        }
        mtr.commit()?;
    }
    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::test_util::TestFrame;
    use crate::page::{RecStatus, INFIMUM_OFFSET};

    #[test]
    fn parse_min_rec_mark_sets_flag() {
        let mut f = TestFrame::new();
        let off;
        {
            let mut pm = f.page_mut();
            pm.create(true);
            off = pm
                .insert_rec_after(INFIMUM_OFFSET, 0, RecStatus::NodePtr, &[2, 0, 9, 9])
                .unwrap();
        }
        let body = off.to_le_bytes();
        {
            let mut pm = f.page_mut();
            let rest = parse_set_min_rec_mark(&body, true, Some(&mut pm)).unwrap();
            assert!(rest.is_empty());
        }
        assert!(f.page().rec_is_min_rec(off));
    }

    #[test]
    fn parse_min_rec_mark_rejects_short_body() {
        assert!(parse_set_min_rec_mark(&[0x01], true, None).is_none());
    }
}
