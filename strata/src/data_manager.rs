//! The data manager: records on pages, with every change written ahead to the log.

use std::ops::Deref;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cache::{RefCache, Resource};
use crate::config::EngineConfig;
use crate::data_item::{self, DataItem};
use crate::error::{Error, Result};
use crate::failpoint::{self, INSERT_AFTER_LOG};
use crate::page::{boot, normal};
use crate::page_cache::{PageCache, PageRef};
use crate::page_index::PageIndex;
use crate::recovery;
use crate::transaction::TransactionManager;
use crate::wal::{LogRecord, Logger};
use crate::{address_to_uid, uid_to_address, Uid, Xid};

const INSERT_ATTEMPTS: usize = 5;
const BOOT_PGNO: u32 = 1;

struct ItemSource {
    pages: Arc<PageCache>,
    logger: Arc<Logger>,
}

impl Resource for ItemSource {
    type Item = DataItem;

    fn load(&self, uid: u64) -> Result<DataItem> {
        let (pgno, offset) = uid_to_address(uid);
        // records live on normal pages only
        if pgno <= BOOT_PGNO || pgno > self.pages.page_count() {
            return Err(Error::RecordNotFound { uid });
        }
        let page = self.pages.get_page(pgno)?;
        DataItem::parse(page, offset, uid, Arc::clone(&self.logger))
    }

    // The item's page reference goes with the last Arc.
    fn writeback(&self, _uid: u64, _item: &Arc<DataItem>) -> Result<()> {
        Ok(())
    }
}

pub struct DataManager {
    items: RefCache<ItemSource>,
    pages: Arc<PageCache>,
    logger: Arc<Logger>,
    tm: Arc<TransactionManager>,
    index: PageIndex,
    boot: Mutex<Option<PageRef>>,
}

/// A checked-out data item. Dropping it releases the item.
pub struct DataItemRef {
    dm: Arc<DataManager>,
    item: Arc<DataItem>,
}

impl Deref for DataItemRef {
    type Target = DataItem;

    fn deref(&self) -> &DataItem {
        &self.item
    }
}

impl Drop for DataItemRef {
    fn drop(&mut self) {
        if let Err(e) = self.dm.items.release(self.item.uid()) {
            tracing::error!(uid = self.item.uid(), error = %e, "data item release failed");
        }
    }
}

impl DataManager {
    fn assemble(
        pages: Arc<PageCache>,
        logger: Logger,
        tm: Arc<TransactionManager>,
    ) -> Self {
        let logger = Arc::new(logger);
        Self {
            items: RefCache::new(
                ItemSource {
                    pages: Arc::clone(&pages),
                    logger: Arc::clone(&logger),
                },
                0,
            ),
            pages,
            logger,
            tm,
            index: PageIndex::new(),
            boot: Mutex::new(None),
        }
    }

    pub fn create(config: &EngineConfig, tm: Arc<TransactionManager>) -> Result<Arc<Self>> {
        let pages = PageCache::create(config.with_suffix(".db"), config.memory)?;
        let logger = Logger::create(config.with_suffix(".log"))?;
        let dm = Self::assemble(pages, logger, tm);

        let pgno = dm.pages.new_page(&boot::init_raw())?;
        debug_assert_eq!(pgno, BOOT_PGNO);
        let boot_page = dm.pages.get_page(pgno)?;
        dm.pages.flush_page(&boot_page)?;
        *dm.boot.lock() = Some(boot_page);

        tracing::info!(path = ?config.path, "created data manager");
        Ok(Arc::new(dm))
    }

    /// Opens an existing store, recovering first if it was not closed cleanly.
    pub fn open(config: &EngineConfig, tm: Arc<TransactionManager>) -> Result<Arc<Self>> {
        let pages = PageCache::open(config.with_suffix(".db"), config.memory)?;
        let logger = Logger::open(config.with_suffix(".log"))?;
        let dm = Self::assemble(pages, logger, tm);

        let boot_page = dm.pages.get_page(BOOT_PGNO)?;
        if !boot::markers_match(&boot_page) {
            tracing::warn!(path = ?config.path, "unclean shutdown detected");
            recovery::recover(&dm.tm, &dm.logger, &dm.pages)?;
        }
        dm.fill_page_index()?;

        boot::set_open_marker(&boot_page);
        dm.pages.flush_page(&boot_page)?;
        *dm.boot.lock() = Some(boot_page);

        tracing::info!(path = ?config.path, pages = dm.pages.page_count(), "opened data manager");
        Ok(Arc::new(dm))
    }

    fn fill_page_index(&self) -> Result<()> {
        for pgno in BOOT_PGNO + 1..=self.pages.page_count() {
            let page = self.pages.get_page(pgno)?;
            self.index.add(pgno, normal::free_space(&page));
        }
        Ok(())
    }

    /// Stores `data` as a new item and returns its uid.
    pub fn insert(&self, xid: Xid, data: &[u8]) -> Result<Uid> {
        let raw = data_item::wrap_raw(data);
        if raw.len() > normal::MAX_FREE_SPACE {
            return Err(Error::DataTooLarge {
                size: raw.len(),
                max: normal::MAX_FREE_SPACE,
            });
        }

        let mut picked = None;
        for _ in 0..INSERT_ATTEMPTS {
            if let Some(info) = self.index.select(raw.len()) {
                picked = Some(info);
                break;
            }
            let pgno = self.pages.new_page(&normal::init_raw())?;
            self.index.add(pgno, normal::MAX_FREE_SPACE);
        }
        let info = picked.ok_or(Error::DatabaseBusy)?;

        let page = match self.pages.get_page(info.pgno) {
            Ok(page) => page,
            Err(e) => {
                self.index.add(info.pgno, info.free_space);
                return Err(e);
            }
        };

        let result = (|| -> Result<Uid> {
            let record = LogRecord::Insert {
                xid,
                pgno: info.pgno,
                offset: normal::fso(&page),
                raw: raw.clone(),
            };
            self.logger.log(&record.encode())?;
            failpoint::maybe_fail(INSERT_AFTER_LOG)?;

            let offset = normal::insert(&page, &raw);
            Ok(address_to_uid(info.pgno, offset))
        })();

        self.index.add(info.pgno, normal::free_space(&page));
        result
    }

    /// Checks out the item at `uid`, or `None` if it has been invalidated.
    /// A uid that does not address a stored item is `RecordNotFound`.
    pub fn read(self: &Arc<Self>, uid: Uid) -> Result<Option<DataItemRef>> {
        let item = DataItemRef {
            dm: Arc::clone(self),
            item: self.items.get(uid)?,
        };
        if !item.is_valid() {
            return Ok(None);
        }
        Ok(Some(item))
    }

    pub fn transaction_manager(&self) -> &Arc<TransactionManager> {
        &self.tm
    }

    pub fn logger(&self) -> &Arc<Logger> {
        &self.logger
    }

    pub fn page_cache(&self) -> &Arc<PageCache> {
        &self.pages
    }

    /// Flushes everything and stamps the clean-shutdown marker.
    pub fn close(&self) -> Result<()> {
        self.items.close()?;
        if let Some(boot_page) = self.boot.lock().take() {
            boot::set_close_marker(&boot_page);
            self.pages.flush_page(&boot_page)?;
        }
        self.logger.close()?;
        self.pages.close()?;
        tracing::info!("closed data manager");
        Ok(())
    }
}
