//! Record locks held until commit or abort, with deadlock detection.
//!
//! Each transaction waits on at most one record and each record has at most
//! one holder, so the wait-for graph has out-degree one and a cycle check is
//! a walk along `xid -> waited uid -> holder`. The check runs before a
//! waiter blocks; an `add` that would close a cycle is refused.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::{Uid, Xid};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    #[error("deadlock: transaction {xid} waiting for record {uid}")]
    Deadlock { xid: Xid, uid: Uid },
}

/// Handed to a transaction that has to wait for a record.
#[derive(Debug, Default)]
pub struct Waiter {
    granted: Mutex<bool>,
    cvar: Condvar,
}

impl Waiter {
    /// Blocks until the record has been transferred to this transaction.
    pub fn wait(&self) {
        let mut granted = self.granted.lock();
        while !*granted {
            self.cvar.wait(&mut granted);
        }
    }

    fn grant(&self) {
        *self.granted.lock() = true;
        self.cvar.notify_all();
    }
}

#[derive(Default)]
struct Graph {
    /// Records each transaction holds.
    held: HashMap<Xid, Vec<Uid>>,
    /// Holder of each record.
    holder: HashMap<Uid, Xid>,
    /// Transactions queued for each record, oldest first.
    waiters: HashMap<Uid, VecDeque<Xid>>,
    /// The record each blocked transaction waits for.
    waiting: HashMap<Xid, Uid>,
    grants: HashMap<Xid, Arc<Waiter>>,
}

impl Graph {
    fn has_deadlock(&self) -> bool {
        let mut stamps: HashMap<Xid, u32> = HashMap::new();
        let mut stamp = 0;
        for &start in self.held.keys() {
            if stamps.contains_key(&start) {
                continue;
            }
            stamp += 1;
            let mut xid = start;
            loop {
                match stamps.get(&xid) {
                    Some(&s) if s == stamp => return true,
                    Some(_) => break,
                    None => {}
                }
                stamps.insert(xid, stamp);
                let next = self
                    .waiting
                    .get(&xid)
                    .and_then(|uid| self.holder.get(uid));
                match next {
                    Some(&holder) => xid = holder,
                    None => break,
                }
            }
        }
        false
    }

    fn unqueue(&mut self, xid: Xid, uid: Uid) {
        self.waiting.remove(&xid);
        if let Some(queue) = self.waiters.get_mut(&uid) {
            queue.retain(|&w| w != xid);
            if queue.is_empty() {
                self.waiters.remove(&uid);
            }
        }
    }

    /// Hands `uid` to its oldest waiter that is still blocked, or frees it.
    fn transfer(&mut self, uid: Uid) {
        self.holder.remove(&uid);
        let Some(queue) = self.waiters.get_mut(&uid) else {
            return;
        };
        while let Some(next) = queue.pop_front() {
            if let Some(waiter) = self.grants.remove(&next) {
                self.holder.insert(uid, next);
                self.held.entry(next).or_default().push(uid);
                self.waiting.remove(&next);
                waiter.grant();
                break;
            }
        }
        if queue.is_empty() {
            self.waiters.remove(&uid);
        }
    }
}

#[derive(Default)]
pub struct LockTable {
    graph: Mutex<Graph>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Asks for `uid` on behalf of `xid`.
    ///
    /// `Ok(None)` means the lock is held now. `Ok(Some(waiter))` means the
    /// caller must [`Waiter::wait`] until the current holder finishes.
    pub fn add(&self, xid: Xid, uid: Uid) -> Result<Option<Arc<Waiter>>, LockError> {
        let mut graph = self.graph.lock();
        if graph.held.get(&xid).is_some_and(|uids| uids.contains(&uid)) {
            return Ok(None);
        }
        if !graph.holder.contains_key(&uid) {
            graph.holder.insert(uid, xid);
            graph.held.entry(xid).or_default().push(uid);
            return Ok(None);
        }

        graph.waiting.insert(xid, uid);
        graph.waiters.entry(uid).or_default().push_back(xid);
        if graph.has_deadlock() {
            graph.unqueue(xid, uid);
            tracing::warn!(xid, uid, "deadlock detected");
            return Err(LockError::Deadlock { xid, uid });
        }

        let waiter = Arc::new(Waiter::default());
        graph.grants.insert(xid, Arc::clone(&waiter));
        tracing::debug!(xid, uid, "waiting for record lock");
        Ok(Some(waiter))
    }

    /// Releases everything `xid` holds or waits for.
    pub fn remove(&self, xid: Xid) {
        let mut graph = self.graph.lock();
        if let Some(uids) = graph.held.remove(&xid) {
            for uid in uids {
                graph.transfer(uid);
            }
        }
        if let Some(uid) = graph.waiting.get(&xid).copied() {
            graph.unqueue(xid, uid);
        }
        graph.grants.remove(&xid);
    }

    /// Holder of `uid`, if any.
    pub fn holder(&self, uid: Uid) -> Option<Xid> {
        self.graph.lock().holder.get(&uid).copied()
    }
}
