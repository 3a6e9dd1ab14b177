//! # Redo Log
//!
//! Append-only log of page-level changes, written in checksummed batches
//! at mini-transaction commit and scanned back at recovery.
//!
//! ## Batch Format
//!
//! ```text
//! +------------------+-------------------------------+
//! | Batch Header     | Record Body                   |
//! | (24 bytes)       | (body_len bytes)              |
//! +------------------+-------------------------------+
//! ```
//!
//! The batch header contains:
//! - `lsn`: log sequence number of the batch; stamped into every page the
//!   batch touches, making replay idempotent
//! - `n_records`: record count in the body
//! - `body_len`: body size in bytes
//! - `checksum`: CRC64 over the header fields and the body
//!
//! ## Record Format
//!
//! ```text
//! +--------+-----------+----------+----------+---------+
//! | op(1B) | space(4B) | page(4B) | len(2B)  | payload |
//! +--------+-----------+----------+----------+---------+
//! ```
//!
//! Opcode pairs distinguish the compact and old row formats where the
//! original format did (`PAGE_REORGANIZE`/`COMP_PAGE_REORGANIZE`,
//! `REC_MIN_MARK`/`COMP_REC_MIN_MARK`, and page create). The reorganize
//! body is empty: record order is fully determined by the index schema and
//! the page pre-image, so replay simply re-runs the reorganization.
//!
//! ## Recovery
//!
//! The log segment is memory-mapped and scanned from the start; the first
//! batch with a bad checksum marks the end of the durable prefix, which is
//! the normal shape of a torn final write.

use std::fs::{create_dir_all, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crc::{Crc, CRC_64_ECMA_182};
use eyre::{bail, ensure, Result, WrapErr};
use memmap2::Mmap;
use parking_lot::Mutex;

use crate::page::{PageMut, RecStatus};

pub const BATCH_HEADER_SIZE: usize = 24;
pub const REC_PREFIX_SIZE: usize = 11;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

const OP_WRITE: u8 = 0x01;
const OP_INSERT: u8 = 0x02;
const OP_DELETE: u8 = 0x03;
const OP_PAGE_CREATE: u8 = 0x04;
const OP_COMP_PAGE_CREATE: u8 = 0x05;
const OP_SET_FIELD: u8 = 0x06;
const OP_PAGE_IMAGE: u8 = 0x07;
const OP_PAGE_REORGANIZE: u8 = 0x08;
const OP_COMP_PAGE_REORGANIZE: u8 = 0x09;
const OP_REC_MIN_MARK: u8 = 0x0A;
const OP_COMP_REC_MIN_MARK: u8 = 0x0B;

/// Page header fields addressable by a `SetField` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderField {
    Prev,
    Next,
    Level,
    IndexId,
    MaxTrxId,
    SegLeaf,
    SegTop,
    IbufFreeHead,
    IbufFreeLen,
}

impl HeaderField {
    fn to_byte(self) -> u8 {
        match self {
            HeaderField::Prev => 0,
            HeaderField::Next => 1,
            HeaderField::Level => 2,
            HeaderField::IndexId => 3,
            HeaderField::MaxTrxId => 4,
            HeaderField::SegLeaf => 5,
            HeaderField::SegTop => 6,
            HeaderField::IbufFreeHead => 7,
            HeaderField::IbufFreeLen => 8,
        }
    }

    fn from_byte(b: u8) -> Result<Self> {
        Ok(match b {
            0 => HeaderField::Prev,
            1 => HeaderField::Next,
            2 => HeaderField::Level,
            3 => HeaderField::IndexId,
            4 => HeaderField::MaxTrxId,
            5 => HeaderField::SegLeaf,
            6 => HeaderField::SegTop,
            7 => HeaderField::IbufFreeHead,
            8 => HeaderField::IbufFreeLen,
            _ => bail!("unknown header field code {}", b),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedoOp {
    /// Recreate the record structure of the page.
    Create { comp: bool },
    /// Typed page header write.
    SetField { field: HeaderField, val: u64 },
    /// Insert a record after the record at `prev`.
    Insert {
        prev: u16,
        info: u8,
        status: u8,
        payload: Vec<u8>,
    },
    /// Delete the record at `offset`.
    Delete { offset: u16 },
    /// Physical in-page write (node-pointer child rewrites).
    Write { offset: u16, bytes: Vec<u8> },
    /// Full-frame image, the compressed-copy fallback.
    PageImage { bytes: Vec<u8> },
    /// Re-run page reorganization against the pre-image. Empty body.
    Reorganize { comp: bool },
    /// Set the minimum-record flag on the record at `offset`.
    MinRecMark { offset: u16, comp: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedoRecord {
    pub space_id: u32,
    pub page_no: u32,
    pub op: RedoOp,
}

#[derive(Debug, Clone)]
pub struct RedoBatch {
    pub lsn: u64,
    pub records: Vec<RedoRecord>,
}

fn encode_record(rec: &RedoRecord, out: &mut Vec<u8>) {
    let (op, body): (u8, Vec<u8>) = match &rec.op {
        RedoOp::Create { comp } => (
            if *comp {
                OP_COMP_PAGE_CREATE
            } else {
                OP_PAGE_CREATE
            },
            Vec::new(),
        ),
        RedoOp::SetField { field, val } => {
            let mut b = Vec::with_capacity(9);
            b.push(field.to_byte());
            b.extend_from_slice(&val.to_le_bytes());
            (OP_SET_FIELD, b)
        }
        RedoOp::Insert {
            prev,
            info,
            status,
            payload,
        } => {
            let mut b = Vec::with_capacity(4 + payload.len());
            b.extend_from_slice(&prev.to_le_bytes());
            b.push(*info);
            b.push(*status);
            b.extend_from_slice(payload);
            (OP_INSERT, b)
        }
        RedoOp::Delete { offset } => (OP_DELETE, offset.to_le_bytes().to_vec()),
        RedoOp::Write { offset, bytes } => {
            let mut b = Vec::with_capacity(2 + bytes.len());
            b.extend_from_slice(&offset.to_le_bytes());
            b.extend_from_slice(bytes);
            (OP_WRITE, b)
        }
        RedoOp::PageImage { bytes } => (OP_PAGE_IMAGE, bytes.clone()),
        RedoOp::Reorganize { comp } => (
            if *comp {
                OP_COMP_PAGE_REORGANIZE
            } else {
                OP_PAGE_REORGANIZE
            },
            Vec::new(),
        ),
        RedoOp::MinRecMark { offset, comp } => (
            if *comp {
                OP_COMP_REC_MIN_MARK
            } else {
                OP_REC_MIN_MARK
            },
            offset.to_le_bytes().to_vec(),
        ),
    };

    out.push(op);
    out.extend_from_slice(&rec.space_id.to_le_bytes());
    out.extend_from_slice(&rec.page_no.to_le_bytes());
    out.extend_from_slice(&(body.len() as u16).to_le_bytes());
    out.extend_from_slice(&body);
}

fn decode_record(buf: &[u8]) -> Result<(RedoRecord, usize)> {
    ensure!(
        buf.len() >= REC_PREFIX_SIZE,
        "truncated redo record prefix: {} bytes",
        buf.len()
    );
    let op = buf[0];
    let space_id = u32::from_le_bytes(buf[1..5].try_into().unwrap());
    let page_no = u32::from_le_bytes(buf[5..9].try_into().unwrap());
    let len = u16::from_le_bytes(buf[9..11].try_into().unwrap()) as usize;
    ensure!(
        buf.len() >= REC_PREFIX_SIZE + len,
        "truncated redo record body: need {}, have {}",
        len,
        buf.len() - REC_PREFIX_SIZE
    );
    let body = &buf[REC_PREFIX_SIZE..REC_PREFIX_SIZE + len];

    let parsed = match op {
        OP_PAGE_CREATE => RedoOp::Create { comp: false },
        OP_COMP_PAGE_CREATE => RedoOp::Create { comp: true },
        OP_SET_FIELD => {
            ensure!(body.len() == 9, "bad SetField body length {}", body.len());
            RedoOp::SetField {
                field: HeaderField::from_byte(body[0])?,
                val: u64::from_le_bytes(body[1..9].try_into().unwrap()),
            }
        }
        OP_INSERT => {
            ensure!(body.len() >= 4, "bad Insert body length {}", body.len());
            RedoOp::Insert {
                prev: u16::from_le_bytes(body[..2].try_into().unwrap()),
                info: body[2],
                status: body[3],
                payload: body[4..].to_vec(),
            }
        }
        OP_DELETE => {
            ensure!(body.len() == 2, "bad Delete body length {}", body.len());
            RedoOp::Delete {
                offset: u16::from_le_bytes(body.try_into().unwrap()),
            }
        }
        OP_WRITE => {
            ensure!(body.len() >= 2, "bad Write body length {}", body.len());
            RedoOp::Write {
                offset: u16::from_le_bytes(body[..2].try_into().unwrap()),
                bytes: body[2..].to_vec(),
            }
        }
        OP_PAGE_IMAGE => RedoOp::PageImage {
            bytes: body.to_vec(),
        },
        OP_PAGE_REORGANIZE => RedoOp::Reorganize { comp: false },
        OP_COMP_PAGE_REORGANIZE => RedoOp::Reorganize { comp: true },
        OP_REC_MIN_MARK | OP_COMP_REC_MIN_MARK => {
            ensure!(body.len() == 2, "bad MinRecMark body length {}", body.len());
            RedoOp::MinRecMark {
                offset: u16::from_le_bytes(body.try_into().unwrap()),
                comp: op == OP_COMP_REC_MIN_MARK,
            }
        }
        _ => bail!("unknown redo opcode {:#04x}", op),
    };

    Ok((
        RedoRecord {
            space_id,
            page_no,
            op: parsed,
        },
        REC_PREFIX_SIZE + len,
    ))
}

fn batch_checksum(lsn: u64, n_records: u32, body: &[u8]) -> u64 {
    let mut digest = CRC64.digest();
    digest.update(&lsn.to_le_bytes());
    digest.update(&n_records.to_le_bytes());
    digest.update(&(body.len() as u32).to_le_bytes());
    digest.update(body);
    digest.finalize()
}

struct LogFile {
    file: File,
    offset: u64,
}

/// The redo log: one append-only segment file per log directory.
pub struct RedoLog {
    #[allow(dead_code)]
    dir: PathBuf,
    path: PathBuf,
    file: Mutex<LogFile>,
    next_lsn: AtomicU64,
}

impl RedoLog {
    fn segment_path(dir: &Path) -> PathBuf {
        dir.join("redo.000001")
    }

    pub fn create(dir: &Path) -> Result<Self> {
        create_dir_all(dir)
            .wrap_err_with(|| format!("failed to create redo directory at {:?}", dir))?;
        let path = Self::segment_path(dir);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .read(true)
            .truncate(true)
            .open(&path)
            .wrap_err_with(|| format!("failed to create redo segment at {:?}", path))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            path,
            file: Mutex::new(LogFile { file, offset: 0 }),
            next_lsn: AtomicU64::new(1),
        })
    }

    /// Opens an existing log directory, positioning after the last valid
    /// batch.
    pub fn open(dir: &Path) -> Result<Self> {
        let path = Self::segment_path(dir);
        if !path.exists() {
            return Self::create(dir);
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .wrap_err_with(|| format!("failed to open redo segment at {:?}", path))?;

        let log = Self {
            dir: dir.to_path_buf(),
            path,
            file: Mutex::new(LogFile { file, offset: 0 }),
            next_lsn: AtomicU64::new(1),
        };
        let (batches, end) = log.scan_from_disk()?;
        if let Some(last) = batches.last() {
            log.next_lsn.store(last.lsn + 1, Ordering::Release);
        }
        log.file.lock().offset = end;
        Ok(log)
    }

    /// Appends one batch, assigning its LSN, and syncs it to disk.
    pub fn append(&self, records: &[RedoRecord]) -> Result<u64> {
        debug_assert!(!records.is_empty());
        let lsn = self.next_lsn.fetch_add(1, Ordering::AcqRel);

        let mut body = Vec::new();
        for rec in records {
            encode_record(rec, &mut body);
        }
        let checksum = batch_checksum(lsn, records.len() as u32, &body);

        let mut header = [0u8; BATCH_HEADER_SIZE];
        header[0..8].copy_from_slice(&lsn.to_le_bytes());
        header[8..12].copy_from_slice(&(records.len() as u32).to_le_bytes());
        header[12..16].copy_from_slice(&(body.len() as u32).to_le_bytes());
        header[16..24].copy_from_slice(&checksum.to_le_bytes());

        let mut guard = self.file.lock();
        guard
            .file
            .write_all(&header)
            .wrap_err("failed to write redo batch header")?;
        guard
            .file
            .write_all(&body)
            .wrap_err("failed to write redo batch body")?;
        guard
            .file
            .sync_all()
            .wrap_err("failed to sync redo batch to disk")?;
        guard.offset += (BATCH_HEADER_SIZE + body.len()) as u64;

        Ok(lsn)
    }

    fn scan_from_disk(&self) -> Result<(Vec<RedoBatch>, u64)> {
        let file = File::open(&self.path)
            .wrap_err_with(|| format!("failed to open redo segment for scan at {:?}", self.path))?;
        if file.metadata()?.len() == 0 {
            return Ok((Vec::new(), 0));
        }
        let mmap = unsafe {
            Mmap::map(&file)
                .wrap_err_with(|| format!("failed to mmap redo segment at {:?}", self.path))?
        };

        let mut batches = Vec::new();
        let mut pos = 0usize;
        while pos + BATCH_HEADER_SIZE <= mmap.len() {
            let h = &mmap[pos..pos + BATCH_HEADER_SIZE];
            let lsn = u64::from_le_bytes(h[0..8].try_into().unwrap());
            let n_records = u32::from_le_bytes(h[8..12].try_into().unwrap());
            let body_len = u32::from_le_bytes(h[12..16].try_into().unwrap()) as usize;
            let checksum = u64::from_le_bytes(h[16..24].try_into().unwrap());

            let body_start = pos + BATCH_HEADER_SIZE;
            if body_start + body_len > mmap.len() {
                break;
            }
            let body = &mmap[body_start..body_start + body_len];
            if batch_checksum(lsn, n_records, body) != checksum {
                // Torn tail write; the durable prefix ends here.
                break;
            }

            let mut records = Vec::with_capacity(n_records as usize);
            let mut off = 0usize;
            for _ in 0..n_records {
                let (rec, used) = decode_record(&body[off..])?;
                records.push(rec);
                off += used;
            }
            batches.push(RedoBatch { lsn, records });
            pos = body_start + body_len;
        }
        Ok((batches, pos as u64))
    }

    /// All durable batches, in commit order.
    pub fn scan(&self) -> Result<Vec<RedoBatch>> {
        Ok(self.scan_from_disk()?.0)
    }

    pub fn truncate(&self) -> Result<()> {
        let mut guard = self.file.lock();
        guard
            .file
            .set_len(0)
            .wrap_err("failed to truncate redo segment")?;
        guard
            .file
            .sync_all()
            .wrap_err("failed to sync redo segment after truncate")?;
        guard.offset = 0;
        Ok(())
    }

    pub fn current_offset(&self) -> u64 {
        self.file.lock().offset
    }
}

/// Applies one generic redo record to an X-latched page. Returns `false`
/// for `Reorganize`, which needs the index schema; the tree layer's parse
/// routine handles it.
pub fn apply(op: &RedoOp, pm: &mut PageMut<'_>) -> Result<bool> {
    match op {
        RedoOp::Create { comp } => {
            pm.create(*comp);
        }
        RedoOp::SetField { field, val } => {
            // Route through the typed setter to keep the mirror in sync.
            match field {
                HeaderField::Prev => pm.set_prev(*val as u32),
                HeaderField::Next => pm.set_next(*val as u32),
                HeaderField::Level => pm.set_level(*val as u16),
                HeaderField::IndexId => pm.set_index_id(*val),
                HeaderField::MaxTrxId => pm.set_max_trx_id(*val),
                HeaderField::SegLeaf => pm.set_seg_leaf(*val as u32),
                HeaderField::SegTop => pm.set_seg_top(*val as u32),
                HeaderField::IbufFreeHead => pm.set_ibuf_free_head(*val as u32),
                HeaderField::IbufFreeLen => pm.set_ibuf_free_len(*val as u16),
            }
        }
        RedoOp::Insert {
            prev,
            info,
            status,
            payload,
        } => {
            let inserted =
                pm.insert_rec_after(*prev, *info, RecStatus::from_byte(*status), payload);
            ensure!(
                inserted.is_some(),
                "redo insert does not fit on page {} during replay",
                pm.page().page_no()
            );
        }
        RedoOp::Delete { offset } => pm.delete_rec(*offset),
        RedoOp::Write { offset, bytes } => pm.apply_raw_write(*offset as usize, bytes),
        RedoOp::PageImage { bytes } => pm.write_frame_image(bytes),
        RedoOp::MinRecMark { offset, .. } => {
            let info = pm.page().rec_info(*offset) | crate::page::REC_INFO_MIN_REC;
            pm.write_rec_info_raw(*offset, info);
        }
        RedoOp::Reorganize { .. } => return Ok(false),
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_records() -> Vec<RedoRecord> {
        vec![
            RedoRecord {
                space_id: 1,
                page_no: 3,
                op: RedoOp::Create { comp: true },
            },
            RedoRecord {
                space_id: 1,
                page_no: 3,
                op: RedoOp::SetField {
                    field: HeaderField::Level,
                    val: 2,
                },
            },
            RedoRecord {
                space_id: 1,
                page_no: 3,
                op: RedoOp::Insert {
                    prev: 68,
                    info: 0,
                    status: 0,
                    payload: vec![4, 0, 1, 2, 3, 4],
                },
            },
            RedoRecord {
                space_id: 1,
                page_no: 4,
                op: RedoOp::MinRecMark {
                    offset: 80,
                    comp: true,
                },
            },
            RedoRecord {
                space_id: 1,
                page_no: 4,
                op: RedoOp::Reorganize { comp: false },
            },
        ]
    }

    #[test]
    fn append_scan_round_trip() {
        let dir = tempdir().unwrap();
        let log = RedoLog::create(dir.path()).unwrap();

        let records = sample_records();
        let lsn1 = log.append(&records[..2]).unwrap();
        let lsn2 = log.append(&records[2..]).unwrap();
        assert!(lsn2 > lsn1);

        let batches = log.scan().unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].lsn, lsn1);
        assert_eq!(batches[0].records, &records[..2]);
        assert_eq!(batches[1].records, &records[2..]);
    }

    #[test]
    fn reopen_resumes_lsn_sequence() {
        let dir = tempdir().unwrap();
        let records = sample_records();
        let first;
        {
            let log = RedoLog::create(dir.path()).unwrap();
            first = log.append(&records[..1]).unwrap();
        }
        let log = RedoLog::open(dir.path()).unwrap();
        let second = log.append(&records[1..2]).unwrap();
        assert_eq!(second, first + 1);
        assert_eq!(log.scan().unwrap().len(), 2);
    }

    #[test]
    fn torn_tail_is_ignored() {
        let dir = tempdir().unwrap();
        let log = RedoLog::create(dir.path()).unwrap();
        let records = sample_records();
        log.append(&records[..2]).unwrap();

        // Simulate a torn write: append garbage after the valid batch.
        {
            let mut guard = log.file.lock();
            guard.file.write_all(&[0xDE, 0xAD, 0xBE, 0xEF]).unwrap();
            guard.file.sync_all().unwrap();
        }
        let batches = log.scan().unwrap();
        assert_eq!(batches.len(), 1);
    }

    #[test]
    fn corrupt_checksum_truncates_scan() {
        let dir = tempdir().unwrap();
        let log = RedoLog::create(dir.path()).unwrap();
        let records = sample_records();
        log.append(&records[..2]).unwrap();
        log.append(&records[2..]).unwrap();

        // Flip a byte in the second batch body.
        {
            use std::io::{Seek, SeekFrom};
            let mut guard = log.file.lock();
            let end = guard.offset;
            guard.file.seek(SeekFrom::Start(end - 1)).unwrap();
            guard.file.write_all(&[0xFF]).unwrap();
            guard.file.sync_all().unwrap();
        }
        let batches = log.scan().unwrap();
        assert_eq!(batches.len(), 1);
    }
}
