//! # Index Descriptor
//!
//! In-memory metadata for one B-tree: its schema, type, root page number,
//! and the tree latch that serializes structural changes against searches.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::mtr::TreeLatch;
use crate::page::PAGE_NIL;
use crate::records::IndexSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    Regular,
    /// The insert-buffer tree: pages come from a free list stored on the
    /// root rather than from the leaf/top segments.
    InsertBuffer,
    /// Schemaless tree carrying records of arbitrary shape; the validator
    /// cannot check field counts or lengths.
    Universal,
}

pub struct Index {
    pub id: u64,
    pub space_id: u32,
    pub kind: IndexKind,
    pub schema: IndexSchema,
    root_page: AtomicU32,
    latch: TreeLatch,
}

impl Index {
    pub fn new(id: u64, space_id: u32, kind: IndexKind, schema: IndexSchema) -> Arc<Self> {
        Arc::new(Self {
            id,
            space_id,
            kind,
            schema,
            root_page: AtomicU32::new(PAGE_NIL),
            latch: Arc::new(RwLock::new(())),
        })
    }

    pub fn root_page(&self) -> u32 {
        self.root_page.load(Ordering::Acquire)
    }

    pub fn set_root_page(&self, page_no: u32) {
        self.root_page.store(page_no, Ordering::Release);
    }

    pub fn latch(&self) -> &TreeLatch {
        &self.latch
    }

    pub fn is_ibuf(&self) -> bool {
        self.kind == IndexKind::InsertBuffer
    }

    pub fn is_universal(&self) -> bool {
        self.kind == IndexKind::Universal
    }

    /// Number of fields a node pointer of this tree carries.
    pub fn n_uniq(&self) -> usize {
        self.schema.n_uniq
    }

    pub fn is_comp(&self) -> bool {
        self.schema.comp
    }
}
