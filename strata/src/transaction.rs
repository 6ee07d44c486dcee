//! Durable transaction state.
//!
//! The xid file starts with an 8-byte big-endian counter holding the highest
//! xid ever issued, followed by one status byte per xid at `8 + (xid - 1)`.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::pager::{create_file, open_file};
use crate::{Xid, SUPER_XID};

const XID_HEADER_LEN: u64 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransactionStatus {
    Active = 0,
    Committed = 1,
    Aborted = 2,
}

impl TransactionStatus {
    fn from_byte(b: u8) -> Result<Self> {
        match b {
            0 => Ok(Self::Active),
            1 => Ok(Self::Committed),
            2 => Ok(Self::Aborted),
            other => Err(Error::BadXidFile {
                detail: format!("unknown status byte {other}"),
            }),
        }
    }
}

struct XidFile {
    file: File,
    counter: Xid,
}

/// The transaction manager. The only source of truth for whether a xid
/// committed, aborted or is still running.
pub struct TransactionManager {
    state: Mutex<XidFile>,
}

fn status_offset(xid: Xid) -> u64 {
    XID_HEADER_LEN + (xid - 1)
}

impl TransactionManager {
    /// Creates a fresh xid file. Fails if the file already exists.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = create_file(path.as_ref())?;
        file.write_all(&0u64.to_be_bytes())?;
        file.sync_all()?;
        tracing::info!(path = ?path.as_ref(), "created xid file");
        Ok(Self {
            state: Mutex::new(XidFile { file, counter: 0 }),
        })
    }

    /// Opens an existing xid file and validates its header against its length.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = open_file(path.as_ref())?;
        let len = file.metadata()?.len();
        if len < XID_HEADER_LEN {
            return Err(Error::BadXidFile {
                detail: format!("file is {len} bytes, shorter than its header"),
            });
        }

        let mut header = [0u8; XID_HEADER_LEN as usize];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut header)?;
        let counter = u64::from_be_bytes(header);

        let expected = XID_HEADER_LEN + counter;
        if expected != len {
            return Err(Error::BadXidFile {
                detail: format!("counter {counter} implies {expected} bytes, file has {len}"),
            });
        }
        tracing::info!(path = ?path.as_ref(), counter, "opened xid file");
        Ok(Self {
            state: Mutex::new(XidFile { file, counter }),
        })
    }

    /// Issues a new xid in the active state.
    pub fn begin(&self) -> Result<Xid> {
        let mut state = self.state.lock();
        let xid = state.counter + 1;
        Self::write_status(&mut state.file, xid, TransactionStatus::Active)?;

        state.file.seek(SeekFrom::Start(0))?;
        state.file.write_all(&xid.to_be_bytes())?;
        state.file.sync_data()?;
        state.counter = xid;
        tracing::debug!(xid, "begin");
        Ok(xid)
    }

    pub fn commit(&self, xid: Xid) -> Result<()> {
        let mut state = self.state.lock();
        Self::write_status(&mut state.file, xid, TransactionStatus::Committed)?;
        tracing::debug!(xid, "commit");
        Ok(())
    }

    pub fn abort(&self, xid: Xid) -> Result<()> {
        let mut state = self.state.lock();
        Self::write_status(&mut state.file, xid, TransactionStatus::Aborted)?;
        tracing::debug!(xid, "abort");
        Ok(())
    }

    pub fn is_active(&self, xid: Xid) -> Result<bool> {
        if xid == SUPER_XID {
            return Ok(false);
        }
        Ok(self.status(xid)? == TransactionStatus::Active)
    }

    pub fn is_committed(&self, xid: Xid) -> Result<bool> {
        if xid == SUPER_XID {
            return Ok(true);
        }
        Ok(self.status(xid)? == TransactionStatus::Committed)
    }

    pub fn is_aborted(&self, xid: Xid) -> Result<bool> {
        if xid == SUPER_XID {
            return Ok(false);
        }
        Ok(self.status(xid)? == TransactionStatus::Aborted)
    }

    /// Highest xid issued so far.
    pub fn counter(&self) -> Xid {
        self.state.lock().counter
    }

    pub fn close(&self) -> Result<()> {
        self.state.lock().file.sync_all()?;
        Ok(())
    }

    fn status(&self, xid: Xid) -> Result<TransactionStatus> {
        let mut state = self.state.lock();
        if xid > state.counter {
            return Err(Error::BadXidFile {
                detail: format!("xid {xid} was never issued"),
            });
        }
        let mut buf = [0u8; 1];
        state.file.seek(SeekFrom::Start(status_offset(xid)))?;
        state.file.read_exact(&mut buf)?;
        TransactionStatus::from_byte(buf[0])
    }

    fn write_status(file: &mut File, xid: Xid, status: TransactionStatus) -> Result<()> {
        file.seek(SeekFrom::Start(status_offset(xid)))?;
        file.write_all(&[status as u8])?;
        file.sync_data()?;
        Ok(())
    }
}
