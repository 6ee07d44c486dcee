//! Versioned records: `[xmin: u64][xmax: u64][payload]`.
//!
//! `xmin` is the creating transaction and never changes. `xmax` is zero
//! while the record is live and holds the deleting transaction after.

use std::sync::Arc;

use crate::data_manager::{DataItemRef, DataManager};
use crate::error::{Error, Result};
use crate::{Uid, Xid};

const OFFSET_XMIN: usize = 0;
const OFFSET_XMAX: usize = OFFSET_XMIN + 8;
const OFFSET_DATA: usize = OFFSET_XMAX + 8;

pub fn wrap_entry_raw(xid: Xid, data: &[u8]) -> Vec<u8> {
    let mut raw = Vec::with_capacity(OFFSET_DATA + data.len());
    raw.extend_from_slice(&xid.to_be_bytes());
    raw.extend_from_slice(&0u64.to_be_bytes());
    raw.extend_from_slice(data);
    raw
}

fn read_xid(raw: &[u8], at: usize) -> Xid {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&raw[at..at + 8]);
    Xid::from_be_bytes(buf)
}

pub struct Entry {
    item: DataItemRef,
}

impl Entry {
    /// `None` when the backing item has been invalidated. An item too short
    /// to carry the version header is not an entry.
    pub fn load(dm: &Arc<DataManager>, uid: Uid) -> Result<Option<Self>> {
        let Some(item) = dm.read(uid)? else {
            return Ok(None);
        };
        if item.data().len() < OFFSET_DATA {
            return Err(Error::RecordNotFound { uid });
        }
        Ok(Some(Self { item }))
    }

    pub fn uid(&self) -> Uid {
        self.item.uid()
    }

    pub fn data(&self) -> Vec<u8> {
        self.item.data().split_off(OFFSET_DATA)
    }

    pub fn xmin(&self) -> Xid {
        read_xid(&self.item.data(), OFFSET_XMIN)
    }

    pub fn xmax(&self) -> Xid {
        read_xid(&self.item.data(), OFFSET_XMAX)
    }

    /// Marks the record deleted by `xid`, logged under `xid`.
    pub fn set_xmax(&self, xid: Xid) -> Result<()> {
        let mut writer = self.item.before();
        writer.write_at(OFFSET_XMAX, &xid.to_be_bytes());
        writer.after(xid)
    }
}
