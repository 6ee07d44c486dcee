//! Free-space index over normal pages, bucketed by how much room each has left.

use parking_lot::Mutex;

use crate::{PageNo, PAGE_SIZE};

const INTERVALS_NO: usize = 40;
const THRESHOLD: usize = PAGE_SIZE / INTERVALS_NO;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageInfo {
    pub pgno: PageNo,
    pub free_space: usize,
}

pub struct PageIndex {
    buckets: Mutex<Vec<Vec<PageInfo>>>,
}

impl Default for PageIndex {
    fn default() -> Self {
        Self::new()
    }
}

fn bucket_of(space: usize) -> usize {
    (space / THRESHOLD).min(INTERVALS_NO)
}

impl PageIndex {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(vec![Vec::new(); INTERVALS_NO + 1]),
        }
    }

    pub fn add(&self, pgno: PageNo, free_space: usize) {
        let mut buckets = self.buckets.lock();
        buckets[bucket_of(free_space)].push(PageInfo { pgno, free_space });
    }

    /// Takes a page with at least `space` bytes free out of the index.
    ///
    /// In the request's own bucket only pages that actually fit qualify; every
    /// higher bucket fits by construction. The caller re-adds the page once it
    /// has written to it.
    pub fn select(&self, space: usize) -> Option<PageInfo> {
        let mut buckets = self.buckets.lock();
        let first = bucket_of(space);

        if let Some(pos) = buckets[first].iter().position(|p| p.free_space >= space) {
            return Some(buckets[first].remove(pos));
        }
        buckets[first + 1..]
            .iter_mut()
            .find(|bucket| !bucket.is_empty())
            .map(|bucket| bucket.remove(0))
    }

    pub fn len(&self) -> usize {
        self.buckets.lock().iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::normal::MAX_FREE_SPACE;

    #[test]
    fn test_selected_page_is_removed() {
        let index = PageIndex::new();
        index.add(7, 100);
        assert_eq!(
            index.select(50),
            Some(PageInfo {
                pgno: 7,
                free_space: 100
            })
        );
        assert_eq!(index.select(50), None);
        index.add(7, 40);
        assert_eq!(index.select(50), None);
        assert_eq!(index.select(30).map(|p| p.pgno), Some(7));
    }

    #[test]
    fn test_select_skips_pages_that_are_too_small() {
        let index = PageIndex::new();
        index.add(2, 210);
        index.add(3, 300);
        // both in bucket 1; only page 3 fits
        assert_eq!(index.select(250).map(|p| p.pgno), Some(3));
        assert_eq!(index.select(250), None);
    }

    #[test]
    fn test_select_walks_up_buckets() {
        let index = PageIndex::new();
        index.add(4, MAX_FREE_SPACE);
        index.add(5, 1000);
        assert_eq!(index.select(10).map(|p| p.pgno), Some(5));
        assert_eq!(index.select(10).map(|p| p.pgno), Some(4));
        assert!(index.is_empty());
    }

    #[test]
    fn test_full_page_bucket() {
        let index = PageIndex::new();
        index.add(9, PAGE_SIZE);
        assert_eq!(index.select(PAGE_SIZE).map(|p| p.pgno), Some(9));
        assert_eq!(index.select(MAX_FREE_SPACE), None);
    }
}
