//! # Page Frames
//!
//! Typed views over a fixed-size 16KB page frame. Every page of an index
//! tree shares the same layout: a 68-byte header, two sentinel records, a
//! heap of variable-length records growing upward, and a slot directory
//! growing downward from the page end.
//!
//! ## Page Layout
//!
//! ```text
//! Offset  Size  Field          Description
//! ------  ----  -------------  ----------------------------------------
//! 0       4     page_no        Page number within the space
//! 4       4     space_id       Owning tablespace
//! 8       4     prev           Left sibling on the same level (NIL at end)
//! 12      4     next           Right sibling on the same level
//! 16      8     lsn            LSN of the last mini-transaction to touch
//!                              this page; guards idempotent redo replay
//! 24      2     level          0 = leaf, higher = internal
//! 26      2     flags          Bit 0: compact row format
//! 28      8     index_id       Owning index tree
//! 36      2     n_recs         User record count
//! 38      2     heap_top       First free heap byte
//! 40      2     garbage        Bytes occupied by deleted records
//! 42      2     last_insert    Offset of the previous successful insert
//!                              (0 = none); drives the split heuristics
//! 44      8     max_trx_id     Highest transaction id to modify the page
//! 52      4     seg_leaf       Leaf file segment (root page only)
//! 56      4     seg_top        Non-leaf file segment (root page only)
//! 60      4     ibuf_free_head Insert-buffer free list head (ibuf root)
//! 64      2     ibuf_free_len  Insert-buffer free list length
//! 66      2     reserved
//! 68      6     infimum        Sentinel below all user records
//! 74      6     supremum       Sentinel above all user records
//! 80      ...   record heap    Grows upward
//! ...           free space
//! ...     2*N   slot directory Grows downward from offset 16384, one
//!                              2-byte slot per user record in key order
//! ```
//!
//! ## Record Header (6 bytes, precedes every record payload)
//!
//! ```text
//! Offset  Size  Field    Description
//! ------  ----  -------  -----------------------------------------
//! 0       2     next     Page offset of the list successor (0 = end)
//! 2       2     len      Total record size including this header
//! 4       1     info     Bit 0: minimum-record flag
//! 5       1     status   0 data, 1 node pointer, 2 infimum, 3 supremum
//! ```
//!
//! User records form a singly-linked list from infimum to supremum in key
//! order; the slot directory indexes the same sequence for binary search.
//!
//! ## Write Views
//!
//! [`Page`] is a read view. [`PageMut`] pairs the uncompressed frame, the
//! optional compressed mirror, and the mini-transaction's redo sink, so a
//! mutation cannot update one and forget the others: every typed write goes
//! through the mirror and emits its redo record in one call.

pub mod cursor;
pub mod ops;
pub mod zip;

use eyre::{ensure, Result};
use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::storage::redo::{HeaderField, RedoOp, RedoRecord};
use crate::zerocopy_accessors;
pub use zip::PageZip;

pub const PAGE_SIZE: usize = 16384;
pub const PAGE_HEADER_SIZE: usize = 68;
pub const INFIMUM_OFFSET: u16 = PAGE_HEADER_SIZE as u16;
pub const SUPREMUM_OFFSET: u16 = INFIMUM_OFFSET + REC_HEADER_SIZE as u16;
pub const HEAP_START: u16 = SUPREMUM_OFFSET + REC_HEADER_SIZE as u16;
pub const REC_HEADER_SIZE: usize = 6;
pub const DIR_SLOT_SIZE: usize = 2;

/// "No page": the NIL page number.
pub const PAGE_NIL: u32 = u32::MAX;

/// Largest record the tree layer accepts. Two of these must fit on an empty
/// root page or split progress is not guaranteed.
pub const PAGE_MAX_REC_SIZE: usize = PAGE_SIZE / 2 - 200;

const FLAG_COMP: u16 = 0x0001;

/// Minimum-record flag bit in the record info byte.
pub const REC_INFO_MIN_REC: u8 = 0x01;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecStatus {
    Data = 0,
    NodePtr = 1,
    Infimum = 2,
    Supremum = 3,
}

impl RecStatus {
    pub fn from_byte(b: u8) -> Self {
        match b {
            1 => RecStatus::NodePtr,
            2 => RecStatus::Infimum,
            3 => RecStatus::Supremum,
            _ => RecStatus::Data,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct PageHeader {
    page_no: U32,
    space_id: U32,
    prev: U32,
    next: U32,
    lsn: U64,
    level: U16,
    flags: U16,
    index_id: U64,
    n_recs: U16,
    heap_top: U16,
    garbage: U16,
    last_insert: U16,
    max_trx_id: U64,
    seg_leaf: U32,
    seg_top: U32,
    ibuf_free_head: U32,
    ibuf_free_len: U16,
    _reserved: U16,
}

impl PageHeader {
    zerocopy_accessors! {
        page_no: u32,
        space_id: u32,
        prev: u32,
        next: u32,
        lsn: u64,
        level: u16,
        index_id: u64,
        n_recs: u16,
        heap_top: u16,
        garbage: u16,
        last_insert: u16,
        max_trx_id: u64,
        seg_leaf: u32,
        seg_top: u32,
        ibuf_free_head: u32,
        ibuf_free_len: u16,
    }

    pub fn is_comp(&self) -> bool {
        self.flags.get() & FLAG_COMP != 0
    }

    pub fn set_comp(&mut self, comp: bool) {
        let mut f = self.flags.get() & !FLAG_COMP;
        if comp {
            f |= FLAG_COMP;
        }
        self.flags = U16::new(f);
    }

    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        ensure!(
            data.len() >= PAGE_HEADER_SIZE,
            "buffer too small for PageHeader: {} < {}",
            data.len(),
            PAGE_HEADER_SIZE
        );
        Self::ref_from_bytes(&data[..PAGE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read PageHeader: {:?}", e))
    }

    pub fn from_bytes_mut(data: &mut [u8]) -> Result<&mut Self> {
        ensure!(
            data.len() >= PAGE_HEADER_SIZE,
            "buffer too small for PageHeader: {} < {}",
            data.len(),
            PAGE_HEADER_SIZE
        );
        Self::mut_from_bytes(&mut data[..PAGE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read PageHeader: {:?}", e))
    }
}

const _: () = assert!(std::mem::size_of::<PageHeader>() == PAGE_HEADER_SIZE);

/// Owned image of one record, used when records travel between pages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecImage {
    pub info: u8,
    pub status: RecStatus,
    pub payload: Vec<u8>,
}

impl RecImage {
    pub fn stored_size(&self) -> usize {
        REC_HEADER_SIZE + self.payload.len()
    }
}

/// Read view over a page frame.
#[derive(Debug, Clone, Copy)]
pub struct Page<'a> {
    data: &'a [u8],
}

impl<'a> Page<'a> {
    pub fn from_bytes(data: &'a [u8]) -> Result<Self> {
        ensure!(
            data.len() == PAGE_SIZE,
            "invalid page size: {} != {}",
            data.len(),
            PAGE_SIZE
        );
        Ok(Self { data })
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.data
    }

    pub fn header(&self) -> &'a PageHeader {
        // INVARIANT: length validated in from_bytes
        PageHeader::from_bytes(self.data).unwrap()
    }

    pub fn page_no(&self) -> u32 {
        self.header().page_no()
    }

    pub fn space_id(&self) -> u32 {
        self.header().space_id()
    }

    pub fn prev(&self) -> u32 {
        self.header().prev()
    }

    pub fn next(&self) -> u32 {
        self.header().next()
    }

    pub fn level(&self) -> u16 {
        self.header().level()
    }

    pub fn is_leaf(&self) -> bool {
        self.level() == 0
    }

    pub fn is_comp(&self) -> bool {
        self.header().is_comp()
    }

    pub fn index_id(&self) -> u64 {
        self.header().index_id()
    }

    pub fn lsn(&self) -> u64 {
        self.header().lsn()
    }

    pub fn n_recs(&self) -> u16 {
        self.header().n_recs()
    }

    pub fn max_trx_id(&self) -> u64 {
        self.header().max_trx_id()
    }

    pub fn last_insert(&self) -> u16 {
        self.header().last_insert()
    }

    // Record header access.

    fn rec_header(&self, off: u16) -> &'a [u8] {
        &self.data[off as usize..off as usize + REC_HEADER_SIZE]
    }

    pub fn rec_next(&self, off: u16) -> u16 {
        let h = self.rec_header(off);
        u16::from_le_bytes([h[0], h[1]])
    }

    pub fn rec_len(&self, off: u16) -> u16 {
        let h = self.rec_header(off);
        u16::from_le_bytes([h[2], h[3]])
    }

    pub fn rec_info(&self, off: u16) -> u8 {
        self.rec_header(off)[4]
    }

    pub fn rec_status(&self, off: u16) -> RecStatus {
        RecStatus::from_byte(self.rec_header(off)[5])
    }

    pub fn rec_is_min_rec(&self, off: u16) -> bool {
        self.rec_info(off) & REC_INFO_MIN_REC != 0
    }

    pub fn rec_is_user(&self, off: u16) -> bool {
        matches!(self.rec_status(off), RecStatus::Data | RecStatus::NodePtr)
    }

    pub fn rec_payload(&self, off: u16) -> &'a [u8] {
        let len = self.rec_len(off) as usize;
        &self.data[off as usize + REC_HEADER_SIZE..off as usize + len]
    }

    pub fn rec_image(&self, off: u16) -> RecImage {
        RecImage {
            info: self.rec_info(off),
            status: self.rec_status(off),
            payload: self.rec_payload(off).to_vec(),
        }
    }

    // Record list navigation. User-record iteration starts at
    // next(infimum) and ends at prev(supremum).

    pub fn first_user_rec(&self) -> Option<u16> {
        let next = self.rec_next(INFIMUM_OFFSET);
        (next != SUPREMUM_OFFSET).then_some(next)
    }

    pub fn last_user_rec(&self) -> Option<u16> {
        let n = self.n_recs();
        (n > 0).then(|| self.dir_slot(n as usize - 1))
    }

    pub fn next_user_rec(&self, off: u16) -> Option<u16> {
        let next = self.rec_next(off);
        (next != SUPREMUM_OFFSET && next != 0).then_some(next)
    }

    pub fn prev_user_rec(&self, off: u16) -> Option<u16> {
        let idx = self.dir_index_of(off)?;
        (idx > 0).then(|| self.dir_slot(idx - 1))
    }

    /// Record preceding `off` in the full list, infimum included.
    pub fn rec_prev_any(&self, off: u16) -> u16 {
        let mut cur = INFIMUM_OFFSET;
        loop {
            let next = self.rec_next(cur);
            if next == off || next == 0 {
                return cur;
            }
            cur = next;
        }
    }

    pub fn user_recs(&self) -> UserRecs<'a> {
        UserRecs {
            page: *self,
            cur: self.rec_next(INFIMUM_OFFSET),
        }
    }

    pub fn rec_images(&self) -> Vec<RecImage> {
        self.user_recs().map(|off| self.rec_image(off)).collect()
    }

    // Slot directory. Slot i holds the offset of the i-th user record in
    // key order, stored at descending addresses from the page end.

    pub fn dir_start(&self) -> usize {
        PAGE_SIZE - DIR_SLOT_SIZE * self.n_recs() as usize
    }

    pub fn dir_slot(&self, i: usize) -> u16 {
        debug_assert!(i < self.n_recs() as usize);
        let at = PAGE_SIZE - DIR_SLOT_SIZE * (i + 1);
        u16::from_le_bytes([self.data[at], self.data[at + 1]])
    }

    pub fn dir_index_of(&self, off: u16) -> Option<usize> {
        (0..self.n_recs() as usize).find(|&i| self.dir_slot(i) == off)
    }

    /// Record at the midpoint of the slot directory.
    pub fn middle_rec(&self) -> Option<u16> {
        let n = self.n_recs() as usize;
        (n > 0).then(|| self.dir_slot(n / 2))
    }

    // Space accounting.

    pub fn data_size(&self) -> usize {
        self.header().heap_top() as usize - HEAP_START as usize - self.header().garbage() as usize
    }

    pub fn free_space_of_empty() -> usize {
        PAGE_SIZE - HEAP_START as usize
    }

    /// Largest record that fits `n` times in the currently free contiguous
    /// area, accounting for directory growth.
    pub fn max_insert_size(&self, n: usize) -> usize {
        let contiguous = self.dir_start() - self.header().heap_top() as usize;
        contiguous.saturating_sub(DIR_SLOT_SIZE * n)
    }

    /// Largest record that fits `n` times after the page is reorganized
    /// (garbage reclaimed, heap recompacted).
    pub fn max_insert_size_after_reorganize(&self, n: usize) -> usize {
        Self::free_space_of_empty()
            .saturating_sub(self.data_size() + DIR_SLOT_SIZE * (self.n_recs() as usize + n))
    }

    /// Structural self-check: sentinel statuses, list/directory agreement,
    /// heap bounds. Key ordering is checked by the tree validator, which
    /// has the schema.
    pub fn validate_structure(&self) -> Result<()> {
        ensure!(
            self.rec_status(INFIMUM_OFFSET) == RecStatus::Infimum,
            "page {}: infimum sentinel corrupted",
            self.page_no()
        );
        ensure!(
            self.rec_status(SUPREMUM_OFFSET) == RecStatus::Supremum,
            "page {}: supremum sentinel corrupted",
            self.page_no()
        );
        let heap_top = self.header().heap_top() as usize;
        ensure!(
            heap_top >= HEAP_START as usize && heap_top <= self.dir_start(),
            "page {}: heap top {} out of bounds",
            self.page_no(),
            heap_top
        );

        let mut count = 0usize;
        let mut cur = self.rec_next(INFIMUM_OFFSET);
        while cur != SUPREMUM_OFFSET {
            ensure!(
                cur != 0 && (cur as usize) < PAGE_SIZE - REC_HEADER_SIZE,
                "page {}: record list points out of bounds at {}",
                self.page_no(),
                cur
            );
            ensure!(
                self.rec_is_user(cur),
                "page {}: non-user record {} linked into the user list",
                self.page_no(),
                cur
            );
            ensure!(
                count < self.n_recs() as usize,
                "page {}: record list longer than n_recs {}",
                self.page_no(),
                self.n_recs()
            );
            ensure!(
                self.dir_slot(count) == cur,
                "page {}: directory slot {} disagrees with record list",
                self.page_no(),
                count
            );
            count += 1;
            cur = self.rec_next(cur);
        }
        ensure!(
            count == self.n_recs() as usize,
            "page {}: record list has {} records, header says {}",
            self.page_no(),
            count,
            self.n_recs()
        );
        Ok(())
    }
}

pub struct UserRecs<'a> {
    page: Page<'a>,
    cur: u16,
}

impl Iterator for UserRecs<'_> {
    type Item = u16;

    fn next(&mut self) -> Option<u16> {
        if self.cur == SUPREMUM_OFFSET || self.cur == 0 {
            return None;
        }
        let off = self.cur;
        self.cur = self.page.rec_next(off);
        Some(off)
    }
}

/// Redo sink for one page within a mini-transaction. Appends nothing when
/// the log mode is `None` (the reorganize window).
pub struct RedoSink<'a> {
    pub records: &'a mut Vec<RedoRecord>,
    pub enabled: bool,
    pub space_id: u32,
    pub page_no: u32,
}

impl RedoSink<'_> {
    fn emit(&mut self, op: RedoOp) {
        if self.enabled {
            self.records.push(RedoRecord {
                space_id: self.space_id,
                page_no: self.page_no,
                op,
            });
        }
    }
}

/// Write view over a latched page frame: the uncompressed bytes, the
/// optional compressed mirror, and the redo sink, updated together.
pub struct PageMut<'a> {
    data: &'a mut [u8],
    zip: Option<&'a mut PageZip>,
    sink: RedoSink<'a>,
}

impl<'a> PageMut<'a> {
    pub fn new(data: &'a mut [u8], zip: Option<&'a mut PageZip>, sink: RedoSink<'a>) -> Result<Self> {
        ensure!(
            data.len() == PAGE_SIZE,
            "invalid page size: {} != {}",
            data.len(),
            PAGE_SIZE
        );
        Ok(Self { data, zip, sink })
    }

    pub fn page(&self) -> Page<'_> {
        Page { data: self.data }
    }

    pub fn has_zip(&self) -> bool {
        self.zip.is_some()
    }

    pub fn zip(&mut self) -> Option<&mut PageZip> {
        self.zip.as_deref_mut()
    }

    fn header_mut(&mut self) -> &mut PageHeader {
        // INVARIANT: length validated in new
        PageHeader::from_bytes_mut(self.data).unwrap()
    }

    fn sync_zip_header(&mut self) {
        if let Some(zip) = self.zip.as_deref_mut() {
            zip.patch_header(&self.data[..PAGE_HEADER_SIZE]);
        }
    }

    fn set_header_field(&mut self, field: HeaderField, val: u64) {
        let h = self.header_mut();
        match field {
            HeaderField::Prev => h.set_prev(val as u32),
            HeaderField::Next => h.set_next(val as u32),
            HeaderField::Level => h.set_level(val as u16),
            HeaderField::IndexId => h.set_index_id(val),
            HeaderField::MaxTrxId => h.set_max_trx_id(val),
            HeaderField::SegLeaf => h.set_seg_leaf(val as u32),
            HeaderField::SegTop => h.set_seg_top(val as u32),
            HeaderField::IbufFreeHead => h.set_ibuf_free_head(val as u32),
            HeaderField::IbufFreeLen => h.set_ibuf_free_len(val as u16),
        }
        self.sync_zip_header();
        self.sink.emit(RedoOp::SetField { field, val });
    }

    pub fn set_prev(&mut self, v: u32) {
        self.set_header_field(HeaderField::Prev, v as u64);
    }

    pub fn set_next(&mut self, v: u32) {
        self.set_header_field(HeaderField::Next, v as u64);
    }

    pub fn set_level(&mut self, v: u16) {
        self.set_header_field(HeaderField::Level, v as u64);
    }

    pub fn set_index_id(&mut self, v: u64) {
        self.set_header_field(HeaderField::IndexId, v);
    }

    pub fn set_max_trx_id(&mut self, v: u64) {
        self.set_header_field(HeaderField::MaxTrxId, v);
    }

    pub fn set_seg_leaf(&mut self, v: u32) {
        self.set_header_field(HeaderField::SegLeaf, v as u64);
    }

    pub fn set_seg_top(&mut self, v: u32) {
        self.set_header_field(HeaderField::SegTop, v as u64);
    }

    pub fn set_ibuf_free_head(&mut self, v: u32) {
        self.set_header_field(HeaderField::IbufFreeHead, v as u64);
    }

    pub fn set_ibuf_free_len(&mut self, v: u16) {
        self.set_header_field(HeaderField::IbufFreeLen, v as u64);
    }

    /// Recreates the record structure of the page. Global header fields
    /// (page number, space, siblings, level, segment headers, insert-
    /// buffer free list) are preserved intact; the record heap, directory
    /// and insert hint are reset. New pages get their level set explicitly
    /// after creation.
    pub fn create(&mut self, comp: bool) {
        {
            let h = self.header_mut();
            h.set_comp(comp);
            h.set_n_recs(0);
            h.set_heap_top(HEAP_START);
            h.set_garbage(0);
            h.set_last_insert(0);
            h.set_max_trx_id(0);
        }

        write_rec_header(
            self.data,
            INFIMUM_OFFSET,
            SUPREMUM_OFFSET,
            REC_HEADER_SIZE as u16,
            0,
            RecStatus::Infimum,
        );
        write_rec_header(
            self.data,
            SUPREMUM_OFFSET,
            0,
            REC_HEADER_SIZE as u16,
            0,
            RecStatus::Supremum,
        );

        // Wipe the heap so replay produces identical bytes.
        self.data[HEAP_START as usize..].fill(0);

        if let Some(zip) = self.zip.as_deref_mut() {
            let ok = zip.compress(self.data);
            debug_assert!(ok, "an empty page must always compress");
        }
        self.sink.emit(RedoOp::Create { comp });
    }

    /// Inserts a record after `prev_off` (a user record or the infimum).
    /// Returns the new record offset, or `None` if the record does not fit
    /// in the contiguous free area or the compressed mirror overflows.
    pub fn insert_rec_after(
        &mut self,
        prev_off: u16,
        info: u8,
        status: RecStatus,
        payload: &[u8],
    ) -> Option<u16> {
        debug_assert!(matches!(status, RecStatus::Data | RecStatus::NodePtr));
        debug_assert!(self.page().rec_status(prev_off) != RecStatus::Supremum);

        let rec_len = REC_HEADER_SIZE + payload.len();
        let page = self.page();
        let heap_top = page.header().heap_top() as usize;
        let n = page.n_recs() as usize;
        let new_dir_start = PAGE_SIZE - DIR_SLOT_SIZE * (n + 1);
        if heap_top + rec_len > new_dir_start {
            return None;
        }

        if let Some(zip) = self.zip.as_deref() {
            if !zip.would_fit_after_insert(self.data, rec_len) {
                return None;
            }
        }

        let new_off = heap_top as u16;
        let next = self.page().rec_next(prev_off);

        write_rec_header(self.data, new_off, next, rec_len as u16, info, status);
        self.data[new_off as usize + REC_HEADER_SIZE..new_off as usize + rec_len]
            .copy_from_slice(payload);
        set_rec_next(self.data, prev_off, new_off);

        // Directory slot for the new record goes right after prev's slot.
        let slot_idx = if prev_off == INFIMUM_OFFSET {
            0
        } else {
            // INVARIANT: prev_off is a live user record, present in the dir
            self.page().dir_index_of(prev_off).unwrap() + 1
        };
        self.dir_insert(slot_idx, new_off);

        {
            let h = self.header_mut();
            h.set_n_recs(n as u16 + 1);
            h.set_heap_top((heap_top + rec_len) as u16);
            h.set_last_insert(new_off);
        }

        if let Some(zip) = self.zip.as_deref_mut() {
            let ok = zip.compress(self.data);
            debug_assert!(ok, "pre-checked compressed insert must fit");
        }
        self.sink.emit(RedoOp::Insert {
            prev: prev_off,
            info,
            status: status as u8,
            payload: payload.to_vec(),
        });
        Some(new_off)
    }

    /// Unlinks and deletes the record at `off`. The heap bytes become
    /// garbage until the next reorganize. Deletion never fails.
    pub fn delete_rec(&mut self, off: u16) {
        debug_assert!(self.page().rec_is_user(off));
        let page = self.page();
        let prev = page.rec_prev_any(off);
        let next = page.rec_next(off);
        let rec_len = page.rec_len(off);
        // INVARIANT: off is a live user record, present in the dir
        let slot_idx = page.dir_index_of(off).unwrap();

        set_rec_next(self.data, prev, next);
        self.dir_remove(slot_idx);

        {
            let h = self.header_mut();
            h.set_n_recs(h.n_recs() - 1);
            h.set_garbage(h.garbage() + rec_len);
            if h.last_insert() == off {
                h.set_last_insert(0);
            }
        }

        if let Some(zip) = self.zip.as_deref_mut() {
            let ok = zip.compress(self.data);
            debug_assert!(ok, "compressed delete must fit");
        }
        self.sink.emit(RedoOp::Delete { offset: off });
    }

    /// Writes the record info byte without full recompression. Used by the
    /// min-rec-mark path, which logs its own dedicated redo record.
    pub fn write_rec_info_raw(&mut self, off: u16, info: u8) {
        self.data[off as usize + 4] = info;
        if let Some(zip) = self.zip.as_deref_mut() {
            zip.patch_rec_info(off, info);
        }
    }

    /// Overwrites `len` payload bytes of the record at `off`, starting
    /// `field_pos` bytes into the payload, and emits a physical write
    /// record. The compressed mirror is patched by the caller's typed
    /// operation (e.g. the node-pointer write).
    pub fn write_rec_payload(&mut self, off: u16, field_pos: usize, bytes: &[u8]) {
        let at = off as usize + REC_HEADER_SIZE + field_pos;
        debug_assert!(at + bytes.len() <= off as usize + self.page().rec_len(off) as usize);
        self.data[at..at + bytes.len()].copy_from_slice(bytes);
        self.sink.emit(RedoOp::Write {
            offset: at as u16,
            bytes: bytes.to_vec(),
        });
    }

    /// Stamps the page LSN during recovery. Not a logged mutation.
    pub fn set_lsn(&mut self, lsn: u64) {
        self.header_mut().set_lsn(lsn);
        self.sync_zip_header();
    }

    /// Physical write for redo replay. Refreshes the mirror on a
    /// best-effort basis; recovery revalidates mirrors once the page
    /// settles.
    pub fn apply_raw_write(&mut self, offset: usize, bytes: &[u8]) {
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        if let Some(zip) = self.zip.as_deref_mut() {
            let _ = zip.compress(self.data);
        }
    }

    /// Replaces the whole frame with `src`, preserving this page's
    /// identity, sibling links, and root-only header fields (segment
    /// headers, insert-buffer free list). Used by the compressed-copy
    /// fallback.
    pub fn write_frame_image(&mut self, src: &[u8]) {
        debug_assert_eq!(src.len(), PAGE_SIZE);
        let h = self.page().header();
        let (page_no, space_id, prev, next, lsn) =
            (h.page_no(), h.space_id(), h.prev(), h.next(), h.lsn());
        let (seg_leaf, seg_top, ibuf_head, ibuf_len) = (
            h.seg_leaf(),
            h.seg_top(),
            h.ibuf_free_head(),
            h.ibuf_free_len(),
        );

        self.data.copy_from_slice(src);

        let h = self.header_mut();
        h.set_page_no(page_no);
        h.set_space_id(space_id);
        h.set_prev(prev);
        h.set_next(next);
        h.set_lsn(lsn);
        h.set_seg_leaf(seg_leaf);
        h.set_seg_top(seg_top);
        h.set_ibuf_free_head(ibuf_head);
        h.set_ibuf_free_len(ibuf_len);
        // Re-emit the mirror from the new bytes. This can transiently fail
        // while sibling links are mid-rewrite; the next record operation
        // restores it.
        if let Some(zip) = self.zip.as_deref_mut() {
            let _ = zip.compress(self.data);
        }

        let image = self.data.to_vec();
        self.sink.emit(RedoOp::PageImage { bytes: image });
    }

    pub fn emit(&mut self, op: RedoOp) {
        self.sink.emit(op);
    }

    fn dir_insert(&mut self, idx: usize, off: u16) {
        let n = self.page().n_recs() as usize;
        let mut slots: Vec<u16> = (0..n).map(|i| self.page().dir_slot(i)).collect();
        slots.insert(idx, off);
        self.dir_write(&slots);
    }

    fn dir_remove(&mut self, idx: usize) {
        let n = self.page().n_recs() as usize;
        let mut slots: Vec<u16> = (0..n).map(|i| self.page().dir_slot(i)).collect();
        slots.remove(idx);
        // Clear the vacated slot so reorganized pages compare byte-equal.
        let vacated = PAGE_SIZE - DIR_SLOT_SIZE * n;
        self.data[vacated..vacated + DIR_SLOT_SIZE].fill(0);
        self.dir_write(&slots);
    }

    fn dir_write(&mut self, slots: &[u16]) {
        for (i, off) in slots.iter().enumerate() {
            let at = PAGE_SIZE - DIR_SLOT_SIZE * (i + 1);
            self.data[at..at + DIR_SLOT_SIZE].copy_from_slice(&off.to_le_bytes());
        }
    }
}

fn write_rec_header(data: &mut [u8], off: u16, next: u16, len: u16, info: u8, status: RecStatus) {
    let at = off as usize;
    data[at..at + 2].copy_from_slice(&next.to_le_bytes());
    data[at + 2..at + 4].copy_from_slice(&len.to_le_bytes());
    data[at + 4] = info;
    data[at + 5] = status as u8;
}

fn set_rec_next(data: &mut [u8], off: u16, next: u16) {
    let at = off as usize;
    data[at..at + 2].copy_from_slice(&next.to_le_bytes());
}

/// Initializes the fixed identity fields of a fresh frame. Runs outside any
/// mini-transaction: a frame's identity is not a logged mutation.
pub fn init_frame_identity(data: &mut [u8], space_id: u32, page_no: u32) {
    let h = PageHeader::from_bytes_mut(data).expect("frame shorter than a page header");
    h.set_page_no(page_no);
    h.set_space_id(space_id);
    h.set_prev(PAGE_NIL);
    h.set_next(PAGE_NIL);
}

/// Stamps the page LSN directly into a frame at mini-transaction commit.
pub fn stamp_lsn(data: &mut [u8], zip: Option<&mut PageZip>, lsn: u64) {
    let h = PageHeader::from_bytes_mut(data).expect("frame shorter than a page header");
    h.set_lsn(lsn);
    if let Some(zip) = zip {
        zip.patch_header(&data[..PAGE_HEADER_SIZE]);
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;
    use crate::storage::redo::RedoRecord;

    /// A standalone frame plus redo buffer for unit tests below the
    /// mini-transaction layer.
    pub struct TestFrame {
        pub bytes: Vec<u8>,
        pub zip: Option<PageZip>,
        pub redo: Vec<RedoRecord>,
    }

    impl TestFrame {
        pub fn new() -> Self {
            let mut bytes = vec![0u8; PAGE_SIZE];
            init_frame_identity(&mut bytes, 0, 1);
            Self {
                bytes,
                zip: None,
                redo: Vec::new(),
            }
        }

        pub fn with_zip(cap: usize) -> Self {
            let mut f = Self::new();
            f.zip = Some(PageZip::new(cap));
            f
        }

        pub fn page_mut(&mut self) -> PageMut<'_> {
            PageMut::new(
                &mut self.bytes,
                self.zip.as_mut(),
                RedoSink {
                    records: &mut self.redo,
                    enabled: true,
                    space_id: 0,
                    page_no: 1,
                },
            )
            .unwrap()
        }

        pub fn page(&self) -> Page<'_> {
            Page::from_bytes(&self.bytes).unwrap()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_util::TestFrame;
    use super::*;

    fn payload(key: u32) -> Vec<u8> {
        let mut p = Vec::new();
        p.extend_from_slice(&4u16.to_le_bytes());
        p.extend_from_slice(&key.to_be_bytes());
        p
    }

    #[test]
    fn create_initializes_sentinels() {
        let mut f = TestFrame::new();
        f.page_mut().create(true);

        let page = f.page();
        assert_eq!(page.rec_status(INFIMUM_OFFSET), RecStatus::Infimum);
        assert_eq!(page.rec_status(SUPREMUM_OFFSET), RecStatus::Supremum);
        assert_eq!(page.rec_next(INFIMUM_OFFSET), SUPREMUM_OFFSET);
        assert_eq!(page.n_recs(), 0);
        assert!(page.first_user_rec().is_none());
        assert!(page.is_comp());
        page.validate_structure().unwrap();
    }

    #[test]
    fn create_preserves_global_fields() {
        let mut f = TestFrame::new();
        {
            let mut pm = f.page_mut();
            pm.create(true);
            pm.set_prev(7);
            pm.set_next(9);
            pm.set_seg_leaf(3);
            pm.create(true);
        }
        let page = f.page();
        assert_eq!(page.prev(), 7);
        assert_eq!(page.next(), 9);
        assert_eq!(page.header().seg_leaf(), 3);
        assert_eq!(page.page_no(), 1);
    }

    #[test]
    fn insert_links_and_orders_records() {
        let mut f = TestFrame::new();
        let (a, b, c);
        {
            let mut pm = f.page_mut();
            pm.create(true);
            a = pm
                .insert_rec_after(INFIMUM_OFFSET, 0, RecStatus::Data, &payload(10))
                .unwrap();
            b = pm.insert_rec_after(a, 0, RecStatus::Data, &payload(30)).unwrap();
            // Insert between a and b.
            c = pm.insert_rec_after(a, 0, RecStatus::Data, &payload(20)).unwrap();
        }

        let page = f.page();
        assert_eq!(page.n_recs(), 3);
        let order: Vec<u16> = page.user_recs().collect();
        assert_eq!(order, vec![a, c, b]);
        assert_eq!(page.dir_slot(0), a);
        assert_eq!(page.dir_slot(1), c);
        assert_eq!(page.dir_slot(2), b);
        assert_eq!(page.last_insert(), c);
        page.validate_structure().unwrap();
    }

    #[test]
    fn delete_unlinks_and_accounts_garbage() {
        let mut f = TestFrame::new();
        let (a, b, c);
        {
            let mut pm = f.page_mut();
            pm.create(true);
            a = pm
                .insert_rec_after(INFIMUM_OFFSET, 0, RecStatus::Data, &payload(1))
                .unwrap();
            b = pm.insert_rec_after(a, 0, RecStatus::Data, &payload(2)).unwrap();
            c = pm.insert_rec_after(b, 0, RecStatus::Data, &payload(3)).unwrap();
            pm.delete_rec(b);
        }

        let page = f.page();
        assert_eq!(page.n_recs(), 2);
        let order: Vec<u16> = page.user_recs().collect();
        assert_eq!(order, vec![a, c]);
        assert_eq!(page.header().garbage() as usize, REC_HEADER_SIZE + payload(2).len());
        page.validate_structure().unwrap();
    }

    #[test]
    fn insert_fails_when_page_full() {
        let mut f = TestFrame::new();
        let mut pm = f.page_mut();
        pm.create(true);

        let big = vec![0u8; 4000];
        let mut prev = INFIMUM_OFFSET;
        let mut n = 0;
        while let Some(off) = pm.insert_rec_after(prev, 0, RecStatus::Data, &big) {
            prev = off;
            n += 1;
        }
        assert_eq!(n, 4); // 4 * ~4KB fills a 16KB page
        assert!(pm.page().max_insert_size(1) < big.len() + REC_HEADER_SIZE);
    }

    #[test]
    fn max_insert_size_after_reorganize_reclaims_garbage() {
        let mut f = TestFrame::new();
        let before;
        {
            let mut pm = f.page_mut();
            pm.create(true);
            let a = pm
                .insert_rec_after(INFIMUM_OFFSET, 0, RecStatus::Data, &vec![0u8; 1000])
                .unwrap();
            before = pm.page().max_insert_size(1);
            pm.delete_rec(a);
        }
        let page = f.page();
        // Contiguous space unchanged by delete, reorganized space larger.
        assert_eq!(page.max_insert_size(1), before);
        assert!(page.max_insert_size_after_reorganize(1) > before);
    }

    #[test]
    fn min_rec_flag_round_trip() {
        let mut f = TestFrame::new();
        let a;
        {
            let mut pm = f.page_mut();
            pm.create(true);
            a = pm
                .insert_rec_after(INFIMUM_OFFSET, 0, RecStatus::NodePtr, &payload(1))
                .unwrap();
            let info = pm.page().rec_info(a) | REC_INFO_MIN_REC;
            pm.write_rec_info_raw(a, info);
        }
        assert!(f.page().rec_is_min_rec(a));
    }

    #[test]
    fn header_writes_emit_redo() {
        let mut f = TestFrame::new();
        {
            let mut pm = f.page_mut();
            pm.create(true);
            pm.set_next(42);
        }
        assert!(f
            .redo
            .iter()
            .any(|r| matches!(r.op, RedoOp::SetField { field: HeaderField::Next, val: 42 })));
        assert!(f.redo.iter().any(|r| matches!(r.op, RedoOp::Create { .. })));
    }

    #[test]
    fn middle_rec_splits_directory() {
        let mut f = TestFrame::new();
        let mut offs = Vec::new();
        {
            let mut pm = f.page_mut();
            pm.create(true);
            let mut prev = INFIMUM_OFFSET;
            for k in 0..9u32 {
                prev = pm
                    .insert_rec_after(prev, 0, RecStatus::Data, &payload(k))
                    .unwrap();
                offs.push(prev);
            }
        }
        assert_eq!(f.page().middle_rec(), Some(offs[4]));
    }
}
