//! The layout of a page in memory and on disk.
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::{PageNo, PAGE_SIZE};

/// A cached page. The byte buffer is shared by every data item that lives on
/// the page; it goes away only when the page leaves the cache.
#[derive(Debug)]
pub struct Page {
    pgno: PageNo,
    data: RwLock<Box<[u8]>>,
    dirty: AtomicBool,
}

impl Page {
    pub fn new(pgno: PageNo, data: Vec<u8>) -> Self {
        debug_assert_eq!(data.len(), PAGE_SIZE);
        Self {
            pgno,
            data: RwLock::new(data.into_boxed_slice()),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn pgno(&self) -> PageNo {
        self.pgno
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn set_dirty(&self, dirty: bool) {
        self.dirty.store(dirty, Ordering::Release);
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.data.read()
    }

    /// Write access to the bytes. Marks the page dirty.
    pub fn write(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        self.set_dirty(true);
        self.data.write()
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.data.read().to_vec()
    }
}

/// Normal pages: `[free space offset: u16][data...]`.
pub mod normal {
    use super::Page;
    use crate::PAGE_SIZE;

    const OFFSET_FREE: usize = 0;
    pub const OFFSET_DATA: usize = 2;
    pub const MAX_FREE_SPACE: usize = PAGE_SIZE - OFFSET_DATA;

    pub fn init_raw() -> Vec<u8> {
        let mut raw = vec![0u8; PAGE_SIZE];
        set_fso(&mut raw, OFFSET_DATA as u16);
        raw
    }

    fn set_fso(raw: &mut [u8], fso: u16) {
        raw[OFFSET_FREE..OFFSET_FREE + 2].copy_from_slice(&fso.to_be_bytes());
    }

    pub fn fso_of(raw: &[u8]) -> u16 {
        u16::from_be_bytes([raw[OFFSET_FREE], raw[OFFSET_FREE + 1]])
    }

    pub fn fso(page: &Page) -> u16 {
        fso_of(&page.read())
    }

    pub fn free_space(page: &Page) -> usize {
        PAGE_SIZE.saturating_sub(fso(page) as usize)
    }

    /// Appends `raw` at the free space offset and returns where it landed.
    pub fn insert(page: &Page, raw: &[u8]) -> u16 {
        let mut data = page.write();
        let offset = fso_of(&data);
        let start = offset as usize;
        data[start..start + raw.len()].copy_from_slice(raw);
        set_fso(&mut data, offset + raw.len() as u16);
        offset
    }

    /// Writes `raw` at `offset`, growing the free space offset if needed.
    pub fn recover_insert(page: &Page, raw: &[u8], offset: u16) {
        let mut data = page.write();
        let start = offset as usize;
        data[start..start + raw.len()].copy_from_slice(raw);
        let end = offset + raw.len() as u16;
        if fso_of(&data) < end {
            set_fso(&mut data, end);
        }
    }

    /// Writes `raw` at `offset` without touching the free space offset.
    pub fn recover_update(page: &Page, raw: &[u8], offset: u16) {
        let mut data = page.write();
        let start = offset as usize;
        data[start..start + raw.len()].copy_from_slice(raw);
    }
}

/// Page 1: a random open marker at `[100, 108)` copied to `[108, 116)` on a
/// clean close. Unequal ranges on open mean the last shutdown crashed.
pub mod boot {
    use super::Page;
    use crate::PAGE_SIZE;

    const OFFSET_VC: usize = 100;
    const LEN_VC: usize = 8;

    pub fn init_raw() -> Vec<u8> {
        let mut raw = vec![0u8; PAGE_SIZE];
        fill_open_marker(&mut raw);
        raw
    }

    fn fill_open_marker(raw: &mut [u8]) {
        let marker: [u8; LEN_VC] = rand::random();
        raw[OFFSET_VC..OFFSET_VC + LEN_VC].copy_from_slice(&marker);
    }

    pub fn set_open_marker(page: &Page) {
        fill_open_marker(&mut page.write());
    }

    pub fn set_close_marker(page: &Page) {
        page.write()
            .copy_within(OFFSET_VC..OFFSET_VC + LEN_VC, OFFSET_VC + LEN_VC);
    }

    pub fn markers_match(page: &Page) -> bool {
        let data = page.read();
        data[OFFSET_VC..OFFSET_VC + LEN_VC] == data[OFFSET_VC + LEN_VC..OFFSET_VC + 2 * LEN_VC]
    }
}
