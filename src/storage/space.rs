//! # File-Space Manager
//!
//! Page allocation within one tablespace. Every index tree draws its pages
//! from two segments created on the root page: one for leaves, one for the
//! non-leaf levels, so each level stays as contiguous on disk as the free
//! list allows.
//!
//! ## Reservation Contract
//!
//! Structural mutations cannot be rolled back halfway, so callers of
//! split and root-raise must reserve their worst-case page count up front
//! with [`Space::reserve_free_pages`] and pass `has_reservation` to the
//! allocator. An allocation made against a reservation cannot fail for
//! lack of space.
//!
//! ## Allocation Hints
//!
//! `alloc_page` takes a hint page number and a direction. A split to the
//! right asks for `page_no + 1` ascending, a split to the left for
//! `page_no - 1` descending; the allocator serves the closest free page on
//! that side before growing the space.

use hashbrown::HashMap;
use parking_lot::Mutex;
use smallvec::SmallVec;

pub type SegId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocDirection {
    Up,
    Down,
    NoDirection,
}

#[derive(Debug, Default)]
struct Segment {
    pages: SmallVec<[u32; 16]>,
}

struct SpaceInner {
    next_page: u32,
    max_pages: u32,
    free: Vec<u32>,
    segments: HashMap<SegId, Segment>,
    next_seg: SegId,
    reserved: u32,
}

pub struct Space {
    id: u32,
    inner: Mutex<SpaceInner>,
}

impl Space {
    pub fn new(id: u32, max_pages: u32) -> Self {
        Self {
            id,
            inner: Mutex::new(SpaceInner {
                next_page: 0,
                max_pages,
                free: Vec::new(),
                segments: HashMap::new(),
                next_seg: 1,
                reserved: 0,
            }),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn create_segment(&self) -> SegId {
        let mut inner = self.inner.lock();
        let seg = inner.next_seg;
        inner.next_seg += 1;
        inner.segments.insert(seg, Segment::default());
        seg
    }

    /// Creates a segment together with its first page (the future tree
    /// root). Returns `None` when the space is exhausted.
    pub fn create_segment_with_page(&self) -> Option<(SegId, u32)> {
        let seg = self.create_segment();
        match self.alloc_page(seg, 0, AllocDirection::NoDirection, false) {
            Some(page_no) => Some((seg, page_no)),
            None => {
                self.inner.lock().segments.remove(&seg);
                None
            }
        }
    }

    fn take_free(inner: &mut SpaceInner, hint: u32, direction: AllocDirection) -> Option<u32> {
        if inner.free.is_empty() {
            return None;
        }
        let pos = match direction {
            AllocDirection::Up => {
                // Closest free page at or above the hint, else the lowest.
                let mut best: Option<(usize, u32)> = None;
                for (i, &p) in inner.free.iter().enumerate() {
                    let better = match best {
                        None => true,
                        Some((_, bp)) => {
                            if (p >= hint) != (bp >= hint) {
                                p >= hint
                            } else if p >= hint {
                                p < bp
                            } else {
                                p < bp
                            }
                        }
                    };
                    if better {
                        best = Some((i, p));
                    }
                }
                best.map(|(i, _)| i)
            }
            AllocDirection::Down => {
                let mut best: Option<(usize, u32)> = None;
                for (i, &p) in inner.free.iter().enumerate() {
                    let better = match best {
                        None => true,
                        Some((_, bp)) => {
                            if (p <= hint) != (bp <= hint) {
                                p <= hint
                            } else if p <= hint {
                                p > bp
                            } else {
                                p > bp
                            }
                        }
                    };
                    if better {
                        best = Some((i, p));
                    }
                }
                best.map(|(i, _)| i)
            }
            AllocDirection::NoDirection => Some(inner.free.len() - 1),
        };
        pos.map(|i| inner.free.swap_remove(i))
    }

    /// Allocates one page into `seg`. With `has_reservation` the caller
    /// promises a prior [`reserve_free_pages`] grant covers this page, so
    /// the allocation cannot fail; the grant itself is released by the
    /// caller once the whole structural change is done.
    ///
    /// [`reserve_free_pages`]: Space::reserve_free_pages
    pub fn alloc_page(
        &self,
        seg: SegId,
        hint: u32,
        direction: AllocDirection,
        has_reservation: bool,
    ) -> Option<u32> {
        let mut inner = self.inner.lock();
        if has_reservation {
            debug_assert!(inner.reserved > 0, "allocation without a live reservation");
        }

        let page_no = match Self::take_free(&mut inner, hint, direction) {
            Some(p) => p,
            None => {
                if inner.next_page >= inner.max_pages {
                    return None;
                }
                let p = inner.next_page;
                inner.next_page += 1;
                p
            }
        };
        inner
            .segments
            .get_mut(&seg)
            .expect("allocation into an unknown segment")
            .pages
            .push(page_no);
        Some(page_no)
    }

    pub fn free_page(&self, seg: SegId, page_no: u32) {
        let mut inner = self.inner.lock();
        // The hint segment is right except for pages whose level changed
        // since allocation (a lift turns a non-leaf page into a leaf);
        // fall back to the segment that actually owns the page.
        let owner = if inner
            .segments
            .get(&seg)
            .is_some_and(|s| s.pages.contains(&page_no))
        {
            seg
        } else {
            *inner
                .segments
                .iter()
                .find(|(_, s)| s.pages.contains(&page_no))
                .map(|(id, _)| id)
                .expect("freed page is not part of any segment")
        };
        let segment = inner.segments.get_mut(&owner).unwrap();
        let pos = segment.pages.iter().position(|&p| p == page_no).unwrap();
        segment.pages.swap_remove(pos);
        inner.free.push(page_no);
    }

    /// Pages currently owned by the segment.
    pub fn seg_n_reserved_pages(&self, seg: SegId) -> u32 {
        self.inner
            .lock()
            .segments
            .get(&seg)
            .map(|s| s.pages.len() as u32)
            .unwrap_or(0)
    }

    /// Frees one page of the segment; `None` once the segment is empty
    /// (and removed). Drives the bounded free loops of tree drop.
    pub fn seg_free_step(&self, seg: SegId) -> Option<u32> {
        let mut inner = self.inner.lock();
        let segment = inner.segments.get_mut(&seg)?;
        match segment.pages.pop() {
            Some(p) => {
                inner.free.push(p);
                Some(p)
            }
            None => {
                inner.segments.remove(&seg);
                None
            }
        }
    }

    /// Like [`seg_free_step`](Space::seg_free_step) but never frees
    /// `header_page`; `None` once only the header page remains.
    pub fn seg_free_step_not_header(&self, seg: SegId, header_page: u32) -> Option<u32> {
        let mut inner = self.inner.lock();
        let segment = inner.segments.get_mut(&seg)?;
        let pos = segment.pages.iter().position(|&p| p != header_page)?;
        let p = segment.pages.swap_remove(pos);
        inner.free.push(p);
        Some(p)
    }

    /// Reserves `n` future allocations. Returns `false` when the space
    /// cannot guarantee them.
    pub fn reserve_free_pages(&self, n: u32) -> bool {
        let mut inner = self.inner.lock();
        let available =
            inner.free.len() as u32 + inner.max_pages.saturating_sub(inner.next_page);
        if available < inner.reserved + n {
            return false;
        }
        inner.reserved += n;
        true
    }

    /// Returns unused reservation units.
    pub fn release_reservation(&self, n: u32) {
        let mut inner = self.inner.lock();
        inner.reserved = inner.reserved.saturating_sub(n);
    }

    pub fn free_count(&self) -> u32 {
        self.inner.lock().free.len() as u32
    }
}
