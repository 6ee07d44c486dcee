//! Crash recovery: redo finished transactions, undo the ones still marked active.
//!
//! Every undone record is followed by a compensation record in the log and the
//! transaction is then marked aborted. A later recovery therefore redoes the
//! original record and its compensation in order, landing on the same bytes.

use std::collections::HashMap;
use std::sync::Arc;

use crate::data_item;
use crate::error::Result;
use crate::page::normal;
use crate::page_cache::PageCache;
use crate::transaction::TransactionManager;
use crate::wal::{LogRecord, Logger};
use crate::{uid_to_address, PageNo, Xid};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    Redo,
    Undo,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryStats {
    pub max_pgno: PageNo,
    pub redone: usize,
    pub undone: usize,
    pub aborted: usize,
}

pub fn recover(
    tm: &TransactionManager,
    logger: &Logger,
    pages: &Arc<PageCache>,
) -> Result<RecoveryStats> {
    tracing::info!("recovery started");
    let mut stats = RecoveryStats::default();

    logger.rewind();
    let mut max_pgno: PageNo = 1;
    while let Some(payload) = logger.next()? {
        max_pgno = max_pgno.max(LogRecord::decode(&payload)?.pgno());
    }
    pages.truncate_by_pgno(max_pgno)?;
    stats.max_pgno = max_pgno;
    tracing::info!(max_pgno, "truncated page file");

    stats.redone = redo(tm, logger, pages)?;
    let (undone, aborted) = undo(tm, logger, pages)?;
    stats.undone = undone;
    stats.aborted = aborted;

    tracing::info!(
        redone = stats.redone,
        undone = stats.undone,
        aborted = stats.aborted,
        "recovery finished"
    );
    Ok(stats)
}

fn redo(tm: &TransactionManager, logger: &Logger, pages: &Arc<PageCache>) -> Result<usize> {
    logger.rewind();
    let mut redone = 0;
    while let Some(payload) = logger.next()? {
        let record = LogRecord::decode(&payload)?;
        if !tm.is_active(record.xid())? {
            apply(pages, &record, Pass::Redo)?;
            redone += 1;
        }
    }
    Ok(redone)
}

fn undo(
    tm: &TransactionManager,
    logger: &Logger,
    pages: &Arc<PageCache>,
) -> Result<(usize, usize)> {
    logger.rewind();
    let mut active: HashMap<Xid, Vec<LogRecord>> = HashMap::new();
    while let Some(payload) = logger.next()? {
        let record = LogRecord::decode(&payload)?;
        if tm.is_active(record.xid())? {
            active.entry(record.xid()).or_default().push(record);
        }
    }

    let mut undone = 0;
    let aborted = active.len();
    for (xid, records) in active {
        for record in records.iter().rev() {
            apply(pages, record, Pass::Undo)?;
            logger.log(&compensation(record).encode())?;
            undone += 1;
        }
        tm.abort(xid)?;
        tracing::warn!(xid, records = records.len(), "rolled back unfinished transaction");
    }
    Ok((undone, aborted))
}

/// The record whose redo has the effect of undoing `record`.
fn compensation(record: &LogRecord) -> LogRecord {
    match record {
        LogRecord::Insert {
            xid,
            pgno,
            offset,
            raw,
        } => {
            let mut raw = raw.clone();
            data_item::set_raw_invalid(&mut raw);
            LogRecord::Insert {
                xid: *xid,
                pgno: *pgno,
                offset: *offset,
                raw,
            }
        }
        LogRecord::Update {
            xid,
            uid,
            old_raw,
            new_raw,
        } => LogRecord::Update {
            xid: *xid,
            uid: *uid,
            old_raw: new_raw.clone(),
            new_raw: old_raw.clone(),
        },
    }
}

fn apply(pages: &Arc<PageCache>, record: &LogRecord, pass: Pass) -> Result<()> {
    match record {
        LogRecord::Insert {
            pgno, offset, raw, ..
        } => {
            let page = pages.get_page(*pgno)?;
            if pass == Pass::Undo {
                let mut raw = raw.clone();
                data_item::set_raw_invalid(&mut raw);
                normal::recover_insert(&page, &raw, *offset);
            } else {
                normal::recover_insert(&page, raw, *offset);
            }
        }
        LogRecord::Update {
            uid,
            old_raw,
            new_raw,
            ..
        } => {
            let (pgno, offset) = uid_to_address(*uid);
            let page = pages.get_page(pgno)?;
            let raw = match pass {
                Pass::Redo => new_raw,
                Pass::Undo => old_raw,
            };
            normal::recover_update(&page, raw, offset);
        }
    }
    Ok(())
}
