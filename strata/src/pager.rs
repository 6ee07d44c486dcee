//! The Pager is responsible for reading and writing pages to the database file.
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::{PageNo, PAGE_SIZE};

/// Creates a new file for reading and writing. Fails if it already exists.
pub(crate) fn create_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    match OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(path)
    {
        Ok(file) => Ok(file),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(Error::FileExists {
            path: path.to_path_buf(),
        }),
        Err(e) => Err(e.into()),
    }
}

/// Opens an existing file for reading and writing.
pub(crate) fn open_file(path: &Path) -> Result<File> {
    let meta = match std::fs::metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(Error::FileNotExists {
                path: path.to_path_buf(),
            })
        }
        Err(e) => return Err(e.into()),
    };
    if !meta.is_file() || meta.permissions().readonly() {
        return Err(Error::FileCannotReadWrite {
            path: path.to_path_buf(),
        });
    }
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| match e.kind() {
            io::ErrorKind::PermissionDenied => Error::FileCannotReadWrite {
                path: path.to_path_buf(),
            },
            _ => e.into(),
        })
}

fn page_offset(pgno: PageNo) -> Result<u64> {
    match pgno.checked_sub(1) {
        Some(index) => Ok(index as u64 * PAGE_SIZE as u64),
        None => Err(io::Error::new(io::ErrorKind::InvalidInput, "page numbers start at 1").into()),
    }
}

/// Page-granular access to the database file. Pages are numbered from 1.
pub struct Pager {
    file: Mutex<File>,
}

impl Pager {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = create_file(path.as_ref())?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = open_file(path.as_ref())?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    /// Number of whole pages currently in the file.
    pub fn num_pages(&self) -> Result<PageNo> {
        let len = self.file.lock().metadata()?.len();
        Ok((len / PAGE_SIZE as u64) as PageNo)
    }

    /// Reads a page. Bytes past the end of the file read as zero.
    pub fn read_page(&self, pgno: PageNo) -> Result<Vec<u8>> {
        tracing::debug!(pgno, "read page");
        let mut data = vec![0u8; PAGE_SIZE];
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(page_offset(pgno)?))?;

        let mut filled = 0;
        while filled < PAGE_SIZE {
            let n = file.read(&mut data[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(data)
    }

    /// Writes a page and forces it to disk.
    pub fn write_page(&self, pgno: PageNo, data: &[u8]) -> Result<()> {
        tracing::debug!(pgno, "write page");
        debug_assert_eq!(data.len(), PAGE_SIZE);
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(page_offset(pgno)?))?;
        file.write_all(data)?;
        file.sync_data()?;
        Ok(())
    }

    /// Cuts the file down to exactly `pages` pages.
    pub fn truncate(&self, pages: PageNo) -> Result<()> {
        let file = self.file.lock();
        file.set_len(pages as u64 * PAGE_SIZE as u64)?;
        file.sync_all()?;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }
}
