//! # Storage Layer
//!
//! The page substrate the tree engine runs on: a buffer pool of latched
//! page frames, a file-space manager handing out pages from per-tree
//! segments, and the redo log that makes mini-transactions durable.
//!
//! ## Module Organization
//!
//! - `buffer`: blocks addressed by `(space_id, page_no)`, each a 16KB
//!   arena frame with an optional compressed mirror behind a read-write
//!   latch
//! - `space`: segment bookkeeping and page allocation with extent
//!   reservation
//! - `redo`: checksummed redo record batches in an append-only segment
//!   file, scanned back at recovery
//!
//! ## Safety Model
//!
//! Frames never leak native references across latch boundaries: a caller
//! addresses a page by `(space_id, page_no)`, and byte access flows
//! through latch guards owned by a mini-transaction memo. Dropping the
//! memo releases every latch; the borrow checker keeps page views from
//! outliving it.

pub mod buffer;
pub mod redo;
pub mod space;

pub use buffer::{Block, BufferPool, Frame, PageKey, ScratchFrame};
pub use redo::{HeaderField, RedoBatch, RedoLog, RedoOp, RedoRecord};
pub use space::{AllocDirection, Space, SegId};
