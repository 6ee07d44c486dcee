//! The write-ahead log.
//!
//! File layout: a 4-byte file checksum, then records framed as
//! `[size: u32][checksum: u32][payload]`. The file checksum folds every whole
//! framed record, so a mismatch on open means the file itself is damaged.
//! A trailing record that is short or fails its own checksum is a torn write
//! and gets cut off.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use bytes::{Buf, BufMut};
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::pager::{create_file, open_file};
use crate::{address_to_uid, uid_to_address, PageNo, Uid, Xid};

const SEED: i32 = 13331;
const OFFSET_SIZE: u64 = 0;
const OFFSET_CHECKSUM: u64 = OFFSET_SIZE + 4;
const OFFSET_DATA: u64 = OFFSET_CHECKSUM + 4;
const FILE_HEADER_LEN: u64 = 4;

/// Rolling multiplicative hash over signed bytes.
pub fn checksum(seed: i32, bytes: &[u8]) -> i32 {
    bytes
        .iter()
        .fold(seed, |acc, &b| acc.wrapping_mul(SEED).wrapping_add(b as i8 as i32))
}

fn wrap(payload: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(OFFSET_DATA as usize + payload.len());
    framed.put_u32(payload.len() as u32);
    framed.put_i32(checksum(0, payload));
    framed.put_slice(payload);
    framed
}

struct LogFile {
    file: File,
    /// Read cursor.
    position: u64,
    file_size: u64,
    x_checksum: i32,
}

impl LogFile {
    /// Reads the framed record at the cursor, or `None` at a torn or absent tail.
    fn next_framed(&mut self) -> Result<Option<Vec<u8>>> {
        if self.position + OFFSET_DATA > self.file_size {
            return Ok(None);
        }
        let mut header = [0u8; OFFSET_DATA as usize];
        self.file.seek(SeekFrom::Start(self.position))?;
        self.file.read_exact(&mut header)?;
        let mut h = &header[..];
        let size = h.get_u32() as u64;
        let expected = h.get_i32();
        if self.position + OFFSET_DATA + size > self.file_size {
            return Ok(None);
        }

        let mut framed = vec![0u8; (OFFSET_DATA + size) as usize];
        framed[..OFFSET_DATA as usize].copy_from_slice(&header);
        self.file.read_exact(&mut framed[OFFSET_DATA as usize..])?;
        if checksum(0, &framed[OFFSET_DATA as usize..]) != expected {
            return Ok(None);
        }
        self.position += framed.len() as u64;
        Ok(Some(framed))
    }
}

pub struct Logger {
    inner: Mutex<LogFile>,
}

impl Logger {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = create_file(path.as_ref())?;
        file.write_all(&0i32.to_be_bytes())?;
        file.sync_all()?;
        tracing::info!(path = ?path.as_ref(), "created log file");
        Ok(Self {
            inner: Mutex::new(LogFile {
                file,
                position: FILE_HEADER_LEN,
                file_size: FILE_HEADER_LEN,
                x_checksum: 0,
            }),
        })
    }

    /// Opens the log, verifies the file checksum and cuts off a torn tail.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = open_file(path.as_ref())?;
        let file_size = file.metadata()?.len();
        if file_size < FILE_HEADER_LEN {
            return Err(Error::BadLogFile);
        }
        let mut header = [0u8; FILE_HEADER_LEN as usize];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut header)?;
        let x_checksum = i32::from_be_bytes(header);

        let mut log = LogFile {
            file,
            position: FILE_HEADER_LEN,
            file_size,
            x_checksum,
        };

        let mut folded = 0i32;
        let mut records = 0usize;
        while let Some(framed) = log.next_framed()? {
            folded = checksum(folded, &framed);
            records += 1;
        }
        if folded != x_checksum {
            tracing::error!(path = ?path.as_ref(), "log file checksum mismatch");
            return Err(Error::BadLogFile);
        }

        if log.position < file_size {
            tracing::warn!(
                valid = log.position,
                file_size,
                "truncating torn log tail"
            );
            log.file.set_len(log.position)?;
            log.file.sync_all()?;
            log.file_size = log.position;
        }
        log.position = FILE_HEADER_LEN;
        tracing::info!(path = ?path.as_ref(), records, "opened log file");

        Ok(Self {
            inner: Mutex::new(log),
        })
    }

    /// Appends `payload` as a new record and forces it to disk.
    pub fn log(&self, payload: &[u8]) -> Result<()> {
        let framed = wrap(payload);
        let mut log = self.inner.lock();

        let end = log.file_size;
        log.file.seek(SeekFrom::Start(end))?;
        log.file.write_all(&framed)?;

        log.x_checksum = checksum(log.x_checksum, &framed);
        let x_checksum = log.x_checksum;
        log.file.seek(SeekFrom::Start(0))?;
        log.file.write_all(&x_checksum.to_be_bytes())?;
        log.file.sync_data()?;

        log.file_size = end + framed.len() as u64;
        Ok(())
    }

    /// Payload of the next record, or `None` once the log is exhausted.
    pub fn next(&self) -> Result<Option<Vec<u8>>> {
        let mut log = self.inner.lock();
        Ok(log
            .next_framed()?
            .map(|mut framed| framed.split_off(OFFSET_DATA as usize)))
    }

    pub fn rewind(&self) {
        self.inner.lock().position = FILE_HEADER_LEN;
    }

    /// Cuts the file to `len` bytes.
    pub fn truncate(&self, len: u64) -> Result<()> {
        let mut log = self.inner.lock();
        log.file.set_len(len)?;
        log.file.sync_all()?;
        log.file_size = len;
        log.position = log.position.min(len);
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        self.inner.lock().file.sync_all()?;
        Ok(())
    }
}

const TYPE_INSERT: u8 = 0;
const TYPE_UPDATE: u8 = 1;

/// A logical log record. Both kinds carry whole data item bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    Insert {
        xid: Xid,
        pgno: PageNo,
        offset: u16,
        raw: Vec<u8>,
    },
    Update {
        xid: Xid,
        uid: Uid,
        old_raw: Vec<u8>,
        new_raw: Vec<u8>,
    },
}

impl LogRecord {
    pub fn xid(&self) -> Xid {
        match self {
            LogRecord::Insert { xid, .. } | LogRecord::Update { xid, .. } => *xid,
        }
    }

    pub fn pgno(&self) -> PageNo {
        match self {
            LogRecord::Insert { pgno, .. } => *pgno,
            LogRecord::Update { uid, .. } => uid_to_address(*uid).0,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            LogRecord::Insert {
                xid,
                pgno,
                offset,
                raw,
            } => {
                let mut buf = Vec::with_capacity(15 + raw.len());
                buf.put_u8(TYPE_INSERT);
                buf.put_u64(*xid);
                buf.put_u32(*pgno);
                buf.put_u16(*offset);
                buf.put_slice(raw);
                buf
            }
            LogRecord::Update {
                xid,
                uid,
                old_raw,
                new_raw,
            } => {
                debug_assert_eq!(old_raw.len(), new_raw.len());
                let mut buf = Vec::with_capacity(17 + old_raw.len() * 2);
                buf.put_u8(TYPE_UPDATE);
                buf.put_u64(*xid);
                buf.put_u64(*uid);
                buf.put_slice(old_raw);
                buf.put_slice(new_raw);
                buf
            }
        }
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let bad = |detail: &str| Error::BadLogRecord {
            detail: detail.to_string(),
        };
        let mut buf = payload;
        if !buf.has_remaining() {
            return Err(bad("empty record"));
        }
        match buf.get_u8() {
            TYPE_INSERT => {
                if buf.remaining() < 14 {
                    return Err(bad("insert record too short"));
                }
                let xid = buf.get_u64();
                let pgno = buf.get_u32();
                let offset = buf.get_u16();
                Ok(LogRecord::Insert {
                    xid,
                    pgno,
                    offset,
                    raw: buf.to_vec(),
                })
            }
            TYPE_UPDATE => {
                if buf.remaining() < 16 {
                    return Err(bad("update record too short"));
                }
                let xid = buf.get_u64();
                let uid = buf.get_u64();
                if buf.len() % 2 != 0 {
                    return Err(bad("update images differ in length"));
                }
                let (old_raw, new_raw) = buf.split_at(buf.len() / 2);
                Ok(LogRecord::Update {
                    xid,
                    uid,
                    old_raw: old_raw.to_vec(),
                    new_raw: new_raw.to_vec(),
                })
            }
            other => Err(bad(&format!("unknown record type {other}"))),
        }
    }
}

/// Builds the update record for a data item at `(pgno, offset)`.
pub fn update_record(xid: Xid, pgno: PageNo, offset: u16, old_raw: &[u8], new_raw: &[u8]) -> LogRecord {
    LogRecord::Update {
        xid,
        uid: address_to_uid(pgno, offset),
        old_raw: old_raw.to_vec(),
        new_raw: new_raw.to_vec(),
    }
}
