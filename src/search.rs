//! # Adaptive Search Cache
//!
//! A per-page hash of recently located keys to record offsets, letting a
//! point lookup skip the in-page binary search when the same key is probed
//! again. Entries are only hints: they must be dropped before a page's
//! record layout changes, and every structural operation does so through
//! [`SearchCache::drop_page_hash`].

use hashbrown::HashMap;
use parking_lot::Mutex;

#[derive(Default)]
pub struct SearchCache {
    pages: Mutex<HashMap<(u32, u32), HashMap<Vec<u8>, u16>>>,
}

impl SearchCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remember(&self, space_id: u32, page_no: u32, key: &[u8], rec: u16) {
        let mut pages = self.pages.lock();
        pages
            .entry((space_id, page_no))
            .or_default()
            .insert(key.to_vec(), rec);
    }

    pub fn lookup(&self, space_id: u32, page_no: u32, key: &[u8]) -> Option<u16> {
        let pages = self.pages.lock();
        pages.get(&(space_id, page_no))?.get(key).copied()
    }

    /// Drops every cached position for the page. Called before any
    /// mutation that moves records.
    pub fn drop_page_hash(&self, space_id: u32, page_no: u32) {
        self.pages.lock().remove(&(space_id, page_no));
    }

    pub fn page_entry_count(&self, space_id: u32, page_no: u32) -> usize {
        self.pages
            .lock()
            .get(&(space_id, page_no))
            .map(|m| m.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remember_and_lookup() {
        let c = SearchCache::new();
        c.remember(0, 4, b"key", 96);
        assert_eq!(c.lookup(0, 4, b"key"), Some(96));
        assert_eq!(c.lookup(0, 4, b"other"), None);
        assert_eq!(c.lookup(0, 5, b"key"), None);
    }

    #[test]
    fn drop_page_hash_clears_page() {
        let c = SearchCache::new();
        c.remember(0, 4, b"a", 80);
        c.remember(0, 4, b"b", 90);
        c.remember(0, 5, b"a", 80);

        c.drop_page_hash(0, 4);
        assert_eq!(c.page_entry_count(0, 4), 0);
        assert_eq!(c.lookup(0, 5, b"a"), Some(80));
    }
}
