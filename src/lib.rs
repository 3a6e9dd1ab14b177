//! # ArborDB — B-Tree Index Engine
//!
//! ArborDB is the index engine of a transactional storage substrate:
//! ordered, disk-resident, multi-level B-trees over fixed-size 16KB pages,
//! with concurrent search, insert and delete, structural maintenance
//! (split, merge, lift, root raise) under a two-tier latching protocol,
//! and crash-recoverable mutation through write-ahead redo logging.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │     Tree Cursor (search, ins/del)        │
//! ├──────────────────────────────────────────┤
//! │  Structural Mutator │ Validator │ Redo   │
//! ├──────────────────────────────────────────┤
//! │  Node Pointers │ Page Lifecycle          │
//! ├──────────────────────────────────────────┤
//! │  Page Frames │ Page Cursor │ List Ops    │
//! ├──────────────────────────────────────────┤
//! │ Buffer Pool │ Space Mgr │ Locks │ Search │
//! ├──────────────────────────────────────────┤
//! │     Mini-Transactions + Redo Log         │
//! └──────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use arbordb::{BTree, ColumnDef, DataTuple, Engine, Index, IndexKind, IndexSchema};
//!
//! let eng = Engine::create(log_dir)?;
//! eng.add_space(0, 4096);
//!
//! let schema = IndexSchema::single_fixed_key(4, true);
//! let index = Index::new(1, 0, IndexKind::Regular, schema);
//! let tree = BTree::new(&eng, index.clone());
//!
//! let mut mtr = eng.mtr();
//! tree.create(&mut mtr)?;
//! mtr.commit()?;
//!
//! tree.insert(&DataTuple::from_key(&7u32.to_be_bytes()))?;
//! assert!(tree.search(&DataTuple::from_key(&7u32.to_be_bytes()))?.is_some());
//! ```
//!
//! ## Concurrency Model
//!
//! Parallel threads mutate independent trees concurrently. Within a tree,
//! a read-write tree latch serializes structural changes against plain
//! searches: searches take it shared and drop it at the leaf; structural
//! operations take it exclusive, and a leaf split releases it as soon as
//! parents and level links are consistent. Per-page latches are acquired
//! through mini-transactions, which release them atomically at commit
//! after flushing their redo batch.
//!
//! ## Module Overview
//!
//! - [`btree`]: the tree engine itself
//! - [`page`]: page frames, in-page cursor, record list operations, the
//!   compressed-page mirror
//! - [`storage`]: buffer pool, file-space manager, redo log
//! - [`mtr`]: mini-transactions
//! - [`records`]: schemas, tuples, and the record payload codec
//! - [`lock`]: record/gap lock table with structural-move hooks
//! - [`search`]: adaptive per-page search cache
//! - [`diag`]: explicit diagnostic sink

#[macro_use]
mod macros;

pub mod btree;
pub mod diag;
pub mod engine;
pub mod index;
pub mod lock;
pub mod mtr;
pub mod page;
pub mod records;
pub mod search;
pub mod storage;

pub use btree::{BTree, LatchIntent, SizeKind, TreeCursor};
pub use engine::Engine;
pub use index::{Index, IndexKind};
pub use mtr::{LogMode, MiniTransaction, PageLatch};
pub use page::{Page, PageZip, PAGE_NIL, PAGE_SIZE};
pub use records::{ColumnDef, DataTuple, Field, IndexSchema};
pub use storage::{AllocDirection, RedoBatch, RedoLog, RedoOp, Space};
