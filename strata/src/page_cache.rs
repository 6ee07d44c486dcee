//! The page cache: a bounded, reference-counted view of the database file.

use std::ops::Deref;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::cache::{RefCache, Resource};
use crate::error::{Error, Result};
use crate::page::Page;
use crate::pager::Pager;
use crate::PageNo;

/// Fewest pages the cache can run with.
pub const MIN_CACHE_PAGES: usize = 10;

struct PageSource {
    pager: Pager,
}

impl Resource for PageSource {
    type Item = Page;

    fn load(&self, key: u64) -> Result<Page> {
        let pgno = key as PageNo;
        Ok(Page::new(pgno, self.pager.read_page(pgno)?))
    }

    fn writeback(&self, key: u64, page: &Arc<Page>) -> Result<()> {
        if page.is_dirty() {
            self.pager.write_page(key as PageNo, &page.read())?;
            page.set_dirty(false);
        }
        Ok(())
    }
}

pub struct PageCache {
    pages: RefCache<PageSource>,
    page_count: AtomicU32,
}

/// An RAII guard for a cached page. Dropping it releases the reference.
pub struct PageRef {
    cache: Arc<PageCache>,
    page: Arc<Page>,
}

impl Deref for PageRef {
    type Target = Page;

    fn deref(&self) -> &Page {
        &self.page
    }
}

impl Drop for PageRef {
    fn drop(&mut self) {
        if let Err(e) = self.cache.pages.release(self.page.pgno() as u64) {
            tracing::error!(pgno = self.page.pgno(), error = %e, "page writeback failed");
        }
    }
}

impl PageCache {
    pub fn create<P: AsRef<Path>>(path: P, memory: u64) -> Result<Arc<Self>> {
        let pager = Pager::create(path)?;
        Self::with_pager(pager, memory)
    }

    pub fn open<P: AsRef<Path>>(path: P, memory: u64) -> Result<Arc<Self>> {
        let pager = Pager::open(path)?;
        Self::with_pager(pager, memory)
    }

    fn with_pager(pager: Pager, memory: u64) -> Result<Arc<Self>> {
        let capacity = (memory / crate::PAGE_SIZE as u64) as usize;
        if capacity < MIN_CACHE_PAGES {
            return Err(Error::MemTooSmall {
                pages: capacity,
                min: MIN_CACHE_PAGES,
            });
        }
        let page_count = pager.num_pages()?;
        tracing::info!(capacity, page_count, "page cache ready");
        Ok(Arc::new(Self {
            pages: RefCache::new(PageSource { pager }, capacity),
            page_count: AtomicU32::new(page_count),
        }))
    }

    /// Appends a page holding `init` and writes it through to disk.
    pub fn new_page(&self, init: &[u8]) -> Result<PageNo> {
        let pgno = self.page_count.fetch_add(1, Ordering::SeqCst) + 1;
        self.pages.resource().pager.write_page(pgno, init)?;
        tracing::debug!(pgno, "new page");
        Ok(pgno)
    }

    pub fn get_page(self: &Arc<Self>, pgno: PageNo) -> Result<PageRef> {
        let page = self.pages.get(pgno as u64)?;
        Ok(PageRef {
            cache: Arc::clone(self),
            page,
        })
    }

    /// Writes the page to disk now, whether or not anyone still holds it.
    pub fn flush_page(&self, page: &Page) -> Result<()> {
        self.pages.resource().pager.write_page(page.pgno(), &page.read())?;
        page.set_dirty(false);
        Ok(())
    }

    /// Cuts the file to `max_pgno` pages. Used by recovery before redo.
    pub fn truncate_by_pgno(&self, max_pgno: PageNo) -> Result<()> {
        self.pages.resource().pager.truncate(max_pgno)?;
        self.page_count.store(max_pgno, Ordering::SeqCst);
        Ok(())
    }

    pub fn page_count(&self) -> PageNo {
        self.page_count.load(Ordering::SeqCst)
    }

    /// Writes back every cached page and syncs the file.
    pub fn close(&self) -> Result<()> {
        self.pages.close()?;
        self.pages.resource().pager.sync()
    }
}
