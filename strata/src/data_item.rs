//! A data item is a record inside a normal page: `[valid: u8][size: u16][payload]`.
//!
//! Items are views over the page buffer, never copies. Writes go through
//! [`DataItem::before`], which latches the item and snapshots its bytes;
//! [`DataItemWriter::after`] logs old and new images, while dropping the
//! writer without calling it puts the old bytes back.

use std::ops::Range;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockWriteGuard};

use crate::error::{Error, Result};
use crate::failpoint::{self, UPDATE_AFTER_LOG};
use crate::page::normal;
use crate::page_cache::PageRef;
use crate::wal::{self, Logger};
use crate::{Uid, Xid, PAGE_SIZE};

const OFFSET_VALID: usize = 0;
const OFFSET_SIZE: usize = 1;
pub const OFFSET_DATA: usize = 3;

const VALID: u8 = 0;
const INVALID: u8 = 1;

/// Frames a payload as a valid item.
pub fn wrap_raw(data: &[u8]) -> Vec<u8> {
    let mut raw = Vec::with_capacity(OFFSET_DATA + data.len());
    raw.push(VALID);
    raw.extend_from_slice(&(data.len() as u16).to_be_bytes());
    raw.extend_from_slice(data);
    raw
}

pub fn set_raw_invalid(raw: &mut [u8]) {
    raw[OFFSET_VALID] = INVALID;
}

pub struct DataItem {
    uid: Uid,
    page: PageRef,
    /// Item bytes within the page.
    range: Range<usize>,
    latch: RwLock<()>,
    logger: Arc<Logger>,
}

impl DataItem {
    /// Reads the item header at `offset` and builds a view over it. The item
    /// must lie wholly inside the written part of the page.
    pub fn parse(page: PageRef, offset: u16, uid: Uid, logger: Arc<Logger>) -> Result<Self> {
        let start = offset as usize;
        let range = {
            let data = page.read();
            let written = (normal::fso_of(&data) as usize).min(PAGE_SIZE);
            if start < normal::OFFSET_DATA || start + OFFSET_DATA > written {
                return Err(Error::RecordNotFound { uid });
            }
            let size =
                u16::from_be_bytes([data[start + OFFSET_SIZE], data[start + OFFSET_SIZE + 1]]) as usize;
            let end = start + OFFSET_DATA + size;
            if end > written {
                return Err(Error::RecordNotFound { uid });
            }
            start..end
        };
        Ok(Self {
            uid,
            page,
            range,
            latch: RwLock::new(()),
            logger,
        })
    }

    pub fn uid(&self) -> Uid {
        self.uid
    }

    pub fn is_valid(&self) -> bool {
        let _latch = self.latch.read();
        self.page.read()[self.range.start + OFFSET_VALID] == VALID
    }

    /// Copy of the payload.
    pub fn data(&self) -> Vec<u8> {
        let _latch = self.latch.read();
        self.page.read()[self.payload_range()].to_vec()
    }

    fn payload_range(&self) -> Range<usize> {
        self.range.start + OFFSET_DATA..self.range.end
    }

    fn raw(&self) -> Vec<u8> {
        self.page.read()[self.range.clone()].to_vec()
    }

    fn put_raw(&self, raw: &[u8]) {
        self.page.write()[self.range.clone()].copy_from_slice(raw);
    }

    /// Latches the item for writing. Blocks while another writer holds it.
    pub fn before(&self) -> DataItemWriter<'_> {
        let latch = self.latch.write();
        self.page.set_dirty(true);
        DataItemWriter {
            item: self,
            old_raw: self.raw(),
            _latch: latch,
            finished: false,
        }
    }
}

/// Exclusive write access to one data item.
pub struct DataItemWriter<'a> {
    item: &'a DataItem,
    old_raw: Vec<u8>,
    _latch: RwLockWriteGuard<'a, ()>,
    finished: bool,
}

impl DataItemWriter<'_> {
    pub fn data(&self) -> Vec<u8> {
        self.item.page.read()[self.item.payload_range()].to_vec()
    }

    /// Overwrites the payload in place. Items never change size.
    pub fn set_data(&mut self, data: &[u8]) {
        let range = self.item.payload_range();
        debug_assert_eq!(range.len(), data.len());
        self.item.page.write()[range].copy_from_slice(data);
    }

    /// Writes `data` at `offset` within the payload.
    pub fn write_at(&mut self, offset: usize, data: &[u8]) {
        let start = self.item.payload_range().start + offset;
        self.item.page.write()[start..start + data.len()].copy_from_slice(data);
    }

    /// Logs the change under `xid` and releases the latch.
    pub fn after(mut self, xid: Xid) -> Result<()> {
        let (pgno, offset) = crate::uid_to_address(self.item.uid);
        let record = wal::update_record(xid, pgno, offset, &self.old_raw, &self.item.raw());
        self.item.logger.log(&record.encode())?;
        self.finished = true;
        failpoint::maybe_fail(UPDATE_AFTER_LOG)
    }

    /// Restores the bytes captured by `before` and releases the latch.
    pub fn un_before(mut self) {
        self.restore();
    }

    fn restore(&mut self) {
        self.item.put_raw(&self.old_raw);
        self.finished = true;
    }
}

impl Drop for DataItemWriter<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.restore();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address_to_uid;
    use crate::page_cache::PageCache;
    use tempfile::tempdir;

    fn setup(dir: &std::path::Path) -> (Arc<PageCache>, Arc<Logger>, Uid) {
        let pages = PageCache::create(dir.join("d.db"), (PAGE_SIZE * 10) as u64).unwrap();
        let logger = Arc::new(Logger::create(dir.join("d.log")).unwrap());
        let pgno = pages.new_page(&normal::init_raw()).unwrap();
        let page = pages.get_page(pgno).unwrap();
        let offset = normal::insert(&page, &wrap_raw(b"abcd"));
        (pages, logger, address_to_uid(pgno, offset))
    }

    fn item(pages: &Arc<PageCache>, logger: &Arc<Logger>, uid: Uid) -> DataItem {
        let (pgno, offset) = crate::uid_to_address(uid);
        DataItem::parse(pages.get_page(pgno).unwrap(), offset, uid, Arc::clone(logger)).unwrap()
    }

    #[test]
    fn test_wrap_raw_layout() {
        let mut raw = wrap_raw(&[9, 8, 7]);
        assert_eq!(raw, vec![0, 0, 3, 9, 8, 7]);
        set_raw_invalid(&mut raw);
        assert_eq!(raw[0], 1);
    }

    #[test]
    fn test_after_logs_both_images() {
        let dir = tempdir().unwrap();
        let (pages, logger, uid) = setup(dir.path());
        let item = item(&pages, &logger, uid);
        assert!(item.is_valid());
        assert_eq!(item.data(), b"abcd");

        let mut w = item.before();
        w.set_data(b"wxyz");
        assert_eq!(w.data(), b"wxyz");
        w.after(5).unwrap();
        assert_eq!(item.data(), b"wxyz");

        logger.rewind();
        let record = wal::LogRecord::decode(&logger.next().unwrap().unwrap()).unwrap();
        assert_eq!(
            record,
            wal::LogRecord::Update {
                xid: 5,
                uid,
                old_raw: wrap_raw(b"abcd"),
                new_raw: wrap_raw(b"wxyz"),
            }
        );
    }

    #[test]
    fn test_un_before_and_drop_restore() {
        let dir = tempdir().unwrap();
        let (pages, logger, uid) = setup(dir.path());
        let item = item(&pages, &logger, uid);

        let mut w = item.before();
        w.set_data(b"zzzz");
        w.un_before();
        assert_eq!(item.data(), b"abcd");

        {
            let mut w = item.before();
            w.write_at(1, b"Q");
        }
        assert_eq!(item.data(), b"abcd");

        logger.rewind();
        assert!(logger.next().unwrap().is_none());
    }

    #[test]
    fn test_parse_rejects_offsets_outside_written_space() {
        let dir = tempdir().unwrap();
        let (pages, logger, uid) = setup(dir.path());
        let (pgno, offset) = crate::uid_to_address(uid);
        let end = offset + (OFFSET_DATA + 4) as u16;
        for bad in [0, 1, end, 8191] {
            let page = pages.get_page(pgno).unwrap();
            let bad_uid = address_to_uid(pgno, bad);
            assert!(matches!(
                DataItem::parse(page, bad, bad_uid, Arc::clone(&logger)),
                Err(Error::RecordNotFound { uid }) if uid == bad_uid
            ));
        }

        // a header whose size runs past the written space
        let page = pages.get_page(pgno).unwrap();
        page.write()[offset as usize + 1..offset as usize + 3].copy_from_slice(&9000u16.to_be_bytes());
        assert!(DataItem::parse(page, offset, uid, Arc::clone(&logger)).is_err());
    }

    #[test]
    fn test_views_share_the_page() {
        let dir = tempdir().unwrap();
        let (pages, logger, uid) = setup(dir.path());
        let a = item(&pages, &logger, uid);
        let b = item(&pages, &logger, uid);
        let mut w = a.before();
        w.set_data(b"1234");
        w.after(1).unwrap();
        assert_eq!(b.data(), b"1234");
    }
}
