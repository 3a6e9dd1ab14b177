//! # Record List Operations
//!
//! Bulk movement of record ranges between latched pages: the primitives
//! underneath split, merge, root raise, lift, and reorganize.
//!
//! Directional conventions follow the callers' needs:
//!
//! - [`copy_rec_list_end`] takes the records from `from` to the end of the
//!   source and inserts them at the *start* of the destination list. A
//!   right merge prepends the dying page's smaller records to its right
//!   sibling this way; into an empty page it is a plain copy.
//! - [`copy_rec_list_start`] takes the records from the start of the
//!   source up to (not including) `limit` and *appends* them to the
//!   destination. A left merge appends the dying page's larger records to
//!   its left sibling.
//!
//! Move variants copy and then delete the range from the source; delete
//! never fails, so a move that passed its copy step cannot be left half
//! done.
//!
//! When the destination carries a compressed mirror, the whole copy is
//! sized against the mirror capacity *before* any byte moves; a copy that
//! would overflow returns `None` with both pages untouched, and the caller
//! falls back to the byte-copy path or gives up the merge.

use std::sync::Arc;

use eyre::{ensure, Result};

use crate::mtr::MiniTransaction;
use crate::storage::buffer::Block;

use super::{PageZip, RecImage, INFIMUM_OFFSET, SUPREMUM_OFFSET};

/// Outcome of a successful list copy.
#[derive(Debug)]
pub struct RecListCopy {
    /// (source offset, destination offset) per copied record, in order.
    pub pairs: Vec<(u16, u16)>,
    /// For an end-copy: the destination's original first user record (its
    /// supremum if none). For a start-copy: the destination's original
    /// last user record (its infimum if none). Lock inheritance anchors
    /// here.
    pub boundary: u16,
}

fn collect_range_end(mtr: &MiniTransaction, src: &Arc<Block>, from: u16) -> Result<Vec<(u16, RecImage)>> {
    let page = mtr.page(src)?;
    let start = if from == INFIMUM_OFFSET {
        page.first_user_rec()
    } else {
        ensure!(page.rec_is_user(from), "copy range start is not a user record");
        Some(from)
    };
    let mut out = Vec::new();
    let mut cur = start;
    while let Some(off) = cur {
        out.push((off, page.rec_image(off)));
        cur = page.next_user_rec(off);
    }
    Ok(out)
}

fn collect_range_start(
    mtr: &MiniTransaction,
    src: &Arc<Block>,
    limit: u16,
) -> Result<Vec<(u16, RecImage)>> {
    let page = mtr.page(src)?;
    let mut out = Vec::new();
    let mut cur = page.first_user_rec();
    while let Some(off) = cur {
        if off == limit {
            break;
        }
        out.push((off, page.rec_image(off)));
        cur = page.next_user_rec(off);
    }
    Ok(out)
}

fn zip_would_overflow(mtr: &MiniTransaction, dst: &Arc<Block>, images: &[(u16, RecImage)]) -> Result<bool> {
    let frame = mtr.frame(dst)?;
    let Some(zip) = frame.zip.as_ref() else {
        return Ok(false);
    };
    let extra: usize = images.iter().map(|(_, img)| 4 + img.stored_size()).sum();
    Ok(PageZip::serialized_size(&frame.bytes[..]) + extra > zip.cap())
}

fn insert_chain(
    mtr: &mut MiniTransaction,
    dst: &Arc<Block>,
    after: u16,
    images: &[(u16, RecImage)],
) -> Result<Vec<(u16, u16)>> {
    let mut pm = mtr.page_mut(dst)?;
    let mut prev = after;
    let mut pairs = Vec::with_capacity(images.len());
    for (src_off, img) in images {
        let new_off = pm.insert_rec_after(prev, img.info, img.status, &img.payload);
        let new_off = match new_off {
            Some(o) => o,
            None => {
                eyre::bail!(
                    "record list copy overflowed page {} after {} records",
                    pm.page().page_no(),
                    pairs.len()
                )
            }
        };
        pairs.push((*src_off, new_off));
        prev = new_off;
    }
    Ok(pairs)
}

/// Copies the records of `src` from `from` (inclusive; the infimum means
/// "from the first user record") to the end, inserting them before the
/// destination's existing records. Returns `None` if the destination's
/// compressed mirror cannot hold the result; neither page is modified in
/// that case.
pub fn copy_rec_list_end(
    mtr: &mut MiniTransaction,
    dst: &Arc<Block>,
    src: &Arc<Block>,
    from: u16,
) -> Result<Option<RecListCopy>> {
    let images = collect_range_end(mtr, src, from)?;
    if zip_would_overflow(mtr, dst, &images)? {
        return Ok(None);
    }
    let boundary = mtr.page(dst)?.first_user_rec().unwrap_or(SUPREMUM_OFFSET);
    let pairs = insert_chain(mtr, dst, INFIMUM_OFFSET, &images)?;
    Ok(Some(RecListCopy { pairs, boundary }))
}

/// Copies the records of `src` before `limit` (exclusive; the supremum
/// means "every user record"), appending them after the destination's
/// existing records. Returns `None` on compressed-mirror overflow with
/// neither page modified.
pub fn copy_rec_list_start(
    mtr: &mut MiniTransaction,
    dst: &Arc<Block>,
    src: &Arc<Block>,
    limit: u16,
) -> Result<Option<RecListCopy>> {
    let images = collect_range_start(mtr, src, limit)?;
    if zip_would_overflow(mtr, dst, &images)? {
        return Ok(None);
    }
    let dst_page = mtr.page(dst)?;
    let boundary = dst_page.last_user_rec().unwrap_or(INFIMUM_OFFSET);
    let pairs = insert_chain(mtr, dst, boundary, &images)?;
    Ok(Some(RecListCopy { pairs, boundary }))
}

/// Deletes the records of `block` from `from` (inclusive) to the end.
/// Returns the deleted offsets.
pub fn delete_rec_list_end(
    mtr: &mut MiniTransaction,
    block: &Arc<Block>,
    from: u16,
) -> Result<Vec<u16>> {
    let offsets: Vec<u16> = {
        let page = mtr.page(block)?;
        let start = if from == INFIMUM_OFFSET {
            page.first_user_rec()
        } else {
            Some(from)
        };
        let mut v = Vec::new();
        let mut cur = start;
        while let Some(off) = cur {
            v.push(off);
            cur = page.next_user_rec(off);
        }
        v
    };
    let mut pm = mtr.page_mut(block)?;
    for off in &offsets {
        pm.delete_rec(*off);
    }
    Ok(offsets)
}

/// Deletes the records of `block` before `limit` (exclusive). Returns the
/// deleted offsets.
pub fn delete_rec_list_start(
    mtr: &mut MiniTransaction,
    block: &Arc<Block>,
    limit: u16,
) -> Result<Vec<u16>> {
    let offsets: Vec<u16> = {
        let page = mtr.page(block)?;
        let mut v = Vec::new();
        let mut cur = page.first_user_rec();
        while let Some(off) = cur {
            if off == limit {
                break;
            }
            v.push(off);
            cur = page.next_user_rec(off);
        }
        v
    };
    let mut pm = mtr.page_mut(block)?;
    for off in &offsets {
        pm.delete_rec(*off);
    }
    Ok(offsets)
}

/// Moves the records from `from` to the end of `src` into `dst`.
pub fn move_rec_list_end(
    mtr: &mut MiniTransaction,
    dst: &Arc<Block>,
    src: &Arc<Block>,
    from: u16,
) -> Result<Option<RecListCopy>> {
    let Some(copied) = copy_rec_list_end(mtr, dst, src, from)? else {
        return Ok(None);
    };
    delete_rec_list_end(mtr, src, from)?;
    Ok(Some(copied))
}

/// Moves the records before `limit` out of `src` into `dst`.
pub fn move_rec_list_start(
    mtr: &mut MiniTransaction,
    dst: &Arc<Block>,
    src: &Arc<Block>,
    limit: u16,
) -> Result<Option<RecListCopy>> {
    let Some(copied) = copy_rec_list_start(mtr, dst, src, limit)? else {
        return Ok(None);
    };
    delete_rec_list_start(mtr, src, limit)?;
    Ok(Some(copied))
}

/// Byte-for-byte page copy, the fallback when recompression of a regular
/// record copy fails. The destination keeps its own identity and sibling
/// links.
pub fn zip_page_copy(mtr: &mut MiniTransaction, dst: &Arc<Block>, src: &Arc<Block>) -> Result<()> {
    let image = mtr.page(src)?.bytes().to_vec();
    let mut pm = mtr.page_mut(dst)?;
    pm.write_frame_image(&image);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mtr::PageLatch;
    use crate::page::{Page, RecStatus};
    use crate::storage::buffer::BufferPool;
    use crate::storage::redo::RedoLog;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, Arc<RedoLog>, BufferPool) {
        let dir = tempdir().unwrap();
        let redo = Arc::new(RedoLog::create(dir.path()).unwrap());
        (dir, redo, BufferPool::new())
    }

    fn payload(k: u32) -> Vec<u8> {
        let mut p = Vec::new();
        p.extend_from_slice(&4u16.to_le_bytes());
        p.extend_from_slice(&k.to_be_bytes());
        p
    }

    fn fill_page(mtr: &mut MiniTransaction, block: &Arc<Block>, keys: &[u32]) -> Vec<u16> {
        let mut pm = mtr.page_mut(block).unwrap();
        pm.create(true);
        let mut prev = INFIMUM_OFFSET;
        let mut offs = Vec::new();
        for &k in keys {
            prev = pm
                .insert_rec_after(prev, 0, RecStatus::Data, &payload(k))
                .unwrap();
            offs.push(prev);
        }
        offs
    }

    fn keys_of(page: &Page<'_>) -> Vec<u32> {
        page.user_recs()
            .map(|off| {
                let p = page.rec_payload(off);
                u32::from_be_bytes(p[2..6].try_into().unwrap())
            })
            .collect()
    }

    #[test]
    fn copy_end_prepends_to_destination() {
        let (_dir, redo, buf) = setup();
        let mut mtr = MiniTransaction::new(redo);
        let src = mtr.page_get(&buf, 0, 1, PageLatch::X);
        let dst = mtr.page_get(&buf, 0, 2, PageLatch::X);

        fill_page(&mut mtr, &src, &[1, 2, 3]);
        fill_page(&mut mtr, &dst, &[10, 11]);

        let copied = copy_rec_list_end(&mut mtr, &dst, &src, INFIMUM_OFFSET)
            .unwrap()
            .unwrap();
        assert_eq!(copied.pairs.len(), 3);

        let dst_page = mtr.page(&dst).unwrap();
        assert_eq!(keys_of(&dst_page), vec![1, 2, 3, 10, 11]);
        // Boundary is the original first record of dst, for merge-right
        // lock inheritance.
        let boundary_key = {
            let p = dst_page.rec_payload(copied.boundary);
            u32::from_be_bytes(p[2..6].try_into().unwrap())
        };
        assert_eq!(boundary_key, 10);
        // Source untouched by a copy.
        assert_eq!(keys_of(&mtr.page(&src).unwrap()), vec![1, 2, 3]);
        mtr.commit().unwrap();
    }

    #[test]
    fn copy_start_appends_to_destination() {
        let (_dir, redo, buf) = setup();
        let mut mtr = MiniTransaction::new(redo);
        let src = mtr.page_get(&buf, 0, 1, PageLatch::X);
        let dst = mtr.page_get(&buf, 0, 2, PageLatch::X);

        let src_offs = fill_page(&mut mtr, &src, &[10, 11, 12]);
        fill_page(&mut mtr, &dst, &[1, 2]);

        // Copy the first two records only.
        let copied = copy_rec_list_start(&mut mtr, &dst, &src, src_offs[2])
            .unwrap()
            .unwrap();
        assert_eq!(copied.pairs.len(), 2);
        assert_eq!(keys_of(&mtr.page(&dst).unwrap()), vec![1, 2, 10, 11]);
        mtr.commit().unwrap();
    }

    #[test]
    fn move_end_deletes_source_range() {
        let (_dir, redo, buf) = setup();
        let mut mtr = MiniTransaction::new(redo);
        let src = mtr.page_get(&buf, 0, 1, PageLatch::X);
        let dst = mtr.page_get(&buf, 0, 2, PageLatch::X);

        let src_offs = fill_page(&mut mtr, &src, &[1, 2, 3, 4]);
        fill_page(&mut mtr, &dst, &[]);

        move_rec_list_end(&mut mtr, &dst, &src, src_offs[2])
            .unwrap()
            .unwrap();

        assert_eq!(keys_of(&mtr.page(&src).unwrap()), vec![1, 2]);
        assert_eq!(keys_of(&mtr.page(&dst).unwrap()), vec![3, 4]);
        mtr.page(&src).unwrap().validate_structure().unwrap();
        mtr.page(&dst).unwrap().validate_structure().unwrap();
        mtr.commit().unwrap();
    }

    #[test]
    fn move_start_deletes_source_prefix() {
        let (_dir, redo, buf) = setup();
        let mut mtr = MiniTransaction::new(redo);
        let src = mtr.page_get(&buf, 0, 1, PageLatch::X);
        let dst = mtr.page_get(&buf, 0, 2, PageLatch::X);

        let src_offs = fill_page(&mut mtr, &src, &[1, 2, 3, 4]);
        fill_page(&mut mtr, &dst, &[]);

        move_rec_list_start(&mut mtr, &dst, &src, src_offs[2])
            .unwrap()
            .unwrap();

        assert_eq!(keys_of(&mtr.page(&src).unwrap()), vec![3, 4]);
        assert_eq!(keys_of(&mtr.page(&dst).unwrap()), vec![1, 2]);
        mtr.commit().unwrap();
    }

    #[test]
    fn zip_overflow_leaves_both_pages_untouched() {
        let dir = tempdir().unwrap();
        let redo = Arc::new(RedoLog::create(dir.path()).unwrap());
        let buf = BufferPool::with_zip_cap(Some(160));

        let mut mtr = MiniTransaction::new(redo);
        let src = mtr.page_get(&buf, 0, 1, PageLatch::X);
        let dst = mtr.page_get(&buf, 0, 2, PageLatch::X);

        // Each source record fits the 160-byte mirror alone, but the five
        // together cannot join dst's existing record.
        fill_page(&mut mtr, &src, &[1, 2, 3, 4, 5]);
        fill_page(&mut mtr, &dst, &[100]);

        let dst_before = mtr.page(&dst).unwrap().bytes().to_vec();
        let out = copy_rec_list_end(&mut mtr, &dst, &src, INFIMUM_OFFSET).unwrap();
        assert!(out.is_none());
        assert_eq!(mtr.page(&dst).unwrap().bytes(), &dst_before[..]);
        mtr.commit().unwrap();
    }

    #[test]
    fn zip_page_copy_preserves_identity_and_links() {
        let (_dir, redo, buf) = setup();
        let mut mtr = MiniTransaction::new(redo);
        let src = mtr.page_get(&buf, 0, 1, PageLatch::X);
        let dst = mtr.page_get(&buf, 0, 2, PageLatch::X);

        fill_page(&mut mtr, &src, &[5, 6]);
        fill_page(&mut mtr, &dst, &[]);
        {
            let mut pm = mtr.page_mut(&dst).unwrap();
            pm.set_prev(77);
            pm.set_next(78);
        }

        zip_page_copy(&mut mtr, &dst, &src).unwrap();

        let dst_page = mtr.page(&dst).unwrap();
        assert_eq!(keys_of(&dst_page), vec![5, 6]);
        assert_eq!(dst_page.page_no(), 2);
        assert_eq!(dst_page.prev(), 77);
        assert_eq!(dst_page.next(), 78);
        mtr.commit().unwrap();
    }
}
