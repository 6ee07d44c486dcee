//! Which versions a transaction may see.

use crate::entry::Entry;
use crate::error::Result;
use crate::transaction::TransactionManager;
use crate::version_manager::{IsolationLevel, Transaction};
use crate::Xid;

pub fn is_visible(tm: &TransactionManager, t: &Transaction, e: &Entry) -> Result<bool> {
    visible(tm, t, e.xmin(), e.xmax())
}

/// True when `e` was deleted by a transaction `t` cannot see, so `t` must not touch it.
pub fn is_version_skip(tm: &TransactionManager, t: &Transaction, e: &Entry) -> Result<bool> {
    version_skip(tm, t, e.xmax())
}

pub(crate) fn visible(tm: &TransactionManager, t: &Transaction, xmin: Xid, xmax: Xid) -> Result<bool> {
    match t.level() {
        IsolationLevel::ReadCommitted => read_committed(tm, t, xmin, xmax),
        IsolationLevel::RepeatableRead => repeatable_read(tm, t, xmin, xmax),
    }
}

pub(crate) fn version_skip(tm: &TransactionManager, t: &Transaction, xmax: Xid) -> Result<bool> {
    if t.level() == IsolationLevel::ReadCommitted {
        return Ok(false);
    }
    Ok(tm.is_committed(xmax)? && (xmax > t.xid() || t.is_in_snapshot(xmax)))
}

fn read_committed(tm: &TransactionManager, t: &Transaction, xmin: Xid, xmax: Xid) -> Result<bool> {
    let xid = t.xid();
    if xmin == xid && xmax == 0 {
        return Ok(true);
    }
    if tm.is_committed(xmin)? {
        if xmax == 0 {
            return Ok(true);
        }
        if xmax != xid && !tm.is_committed(xmax)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn repeatable_read(tm: &TransactionManager, t: &Transaction, xmin: Xid, xmax: Xid) -> Result<bool> {
    let xid = t.xid();
    if xmin == xid && xmax == 0 {
        return Ok(true);
    }
    if tm.is_committed(xmin)? && xmin < xid && !t.is_in_snapshot(xmin) {
        if xmax == 0 {
            return Ok(true);
        }
        if xmax != xid
            && (!tm.is_committed(xmax)? || xmax > xid || t.is_in_snapshot(xmax))
        {
            return Ok(true);
        }
    }
    Ok(false)
}
