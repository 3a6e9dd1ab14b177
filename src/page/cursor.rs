//! # Page Cursor
//!
//! Positioning within a single page: binary search over the slot
//! directory, tuple insert at a position, record delete. The cursor holds
//! a record offset; "before first" is the infimum sentinel.
//!
//! Search mode is less-or-equal: the cursor lands on the last record whose
//! key compares `<=` the search tuple, which is the insert predecessor and
//! the node-pointer routing rule in one.

use std::cmp::Ordering;

use eyre::{bail, ensure, Result};

use crate::records::{cmp_tuple_rec, rec_get_offsets, DataTuple, IndexSchema};

use super::{
    Page, PageMut, RecStatus, INFIMUM_OFFSET, PAGE_MAX_REC_SIZE, REC_HEADER_SIZE, REC_INFO_MIN_REC,
};

/// Field count of a record, by its status byte.
pub fn rec_n_fields(status: RecStatus, schema: &IndexSchema) -> usize {
    match status {
        RecStatus::NodePtr => schema.node_ptr_fields(),
        _ => schema.n_fields(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageCursor {
    /// Offset of the record the cursor rests on; the infimum when the
    /// cursor is before the first user record.
    pub rec: u16,
}

impl PageCursor {
    pub fn before_first() -> Self {
        Self {
            rec: INFIMUM_OFFSET,
        }
    }

    pub fn on(rec: u16) -> Self {
        Self { rec }
    }

    pub fn is_before_first(&self) -> bool {
        self.rec == INFIMUM_OFFSET
    }
}

/// Result of a less-or-equal search: the cursor position and whether the
/// record it rests on compared equal over the tuple's comparison fields.
#[derive(Debug, Clone, Copy)]
pub struct SearchOutcome {
    pub cursor: PageCursor,
    pub matched: bool,
}

/// Ordering of the record at `off` relative to the tuple.
pub fn rec_cmp_tuple(
    page: &Page<'_>,
    off: u16,
    tuple: &DataTuple,
    schema: &IndexSchema,
) -> Result<Ordering> {
    let payload = page.rec_payload(off);
    let offsets = rec_get_offsets(payload, rec_n_fields(page.rec_status(off), schema))?;
    // cmp_tuple_rec orders tuple vs record; invert for record vs tuple.
    Ok(cmp_tuple_rec(tuple, payload, &offsets, page.rec_is_min_rec(off)).reverse())
}

use self::rec_cmp_tuple as cmp_at;

/// Positions on the last record `<=` tuple, the infimum if every record is
/// greater.
pub fn search_le(page: &Page<'_>, schema: &IndexSchema, tuple: &DataTuple) -> Result<SearchOutcome> {
    let n = page.n_recs() as usize;
    // Binary search for the first slot whose record compares > tuple.
    let mut lo = 0usize;
    let mut hi = n;
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        let off = page.dir_slot(mid);
        match cmp_at(page, off, tuple, schema)? {
            Ordering::Greater => hi = mid,
            _ => lo = mid + 1,
        }
    }
    if lo == 0 {
        return Ok(SearchOutcome {
            cursor: PageCursor::before_first(),
            matched: false,
        });
    }
    let off = page.dir_slot(lo - 1);
    let matched = cmp_at(page, off, tuple, schema)? == Ordering::Equal;
    Ok(SearchOutcome {
        cursor: PageCursor::on(off),
        matched,
    })
}

/// Converts the tuple and inserts it after the cursor position. Returns
/// the new record offset, or `None` when the page (or its compressed
/// mirror) has no room.
pub fn tuple_insert(
    pm: &mut PageMut<'_>,
    cursor: PageCursor,
    tuple: &DataTuple,
    _schema: &IndexSchema,
) -> Result<Option<u16>> {
    let payload = tuple.to_payload();
    ensure!(
        REC_HEADER_SIZE + payload.len() <= PAGE_MAX_REC_SIZE,
        "record of {} bytes exceeds the maximum of {}",
        REC_HEADER_SIZE + payload.len(),
        PAGE_MAX_REC_SIZE
    );

    let page = pm.page();
    if page.rec_status(cursor.rec) == RecStatus::Supremum {
        bail!("cannot insert after the supremum sentinel");
    }
    let status = if page.is_leaf() {
        RecStatus::Data
    } else {
        RecStatus::NodePtr
    };
    let info = if tuple.min_rec { REC_INFO_MIN_REC } else { 0 };
    Ok(pm.insert_rec_after(cursor.rec, info, status, &payload))
}

/// Deletes the record under the cursor and repositions on its predecessor.
pub fn delete_rec(pm: &mut PageMut<'_>, cursor: &mut PageCursor) {
    let prev = pm.page().rec_prev_any(cursor.rec);
    pm.delete_rec(cursor.rec);
    cursor.rec = prev;
}
