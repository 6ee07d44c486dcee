//! Multi-version concurrency control over the data manager.

use std::collections::{HashMap, HashSet};
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cache::{RefCache, Resource};
use crate::data_manager::DataManager;
use crate::entry::{self, Entry};
use crate::error::{Error, Result};
use crate::lock_table::LockTable;
use crate::transaction::TransactionManager;
use crate::visibility;
use crate::{Uid, Xid, SUPER_XID};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    #[default]
    ReadCommitted,
    RepeatableRead,
}

impl TryFrom<u8> for IsolationLevel {
    type Error = u8;

    fn try_from(level: u8) -> std::result::Result<Self, u8> {
        match level {
            0 => Ok(Self::ReadCommitted),
            1 => Ok(Self::RepeatableRead),
            other => Err(other),
        }
    }
}

/// An in-flight transaction as the version manager sees it.
#[derive(Debug)]
pub struct Transaction {
    xid: Xid,
    level: IsolationLevel,
    /// Transactions active when this one began. Empty under read committed.
    snapshot: HashSet<Xid>,
    failed: AtomicBool,
    auto_aborted: AtomicBool,
}

impl Transaction {
    pub fn new(xid: Xid, level: IsolationLevel, snapshot: HashSet<Xid>) -> Self {
        let snapshot = match level {
            IsolationLevel::ReadCommitted => HashSet::new(),
            IsolationLevel::RepeatableRead => snapshot,
        };
        Self {
            xid,
            level,
            snapshot,
            failed: AtomicBool::new(false),
            auto_aborted: AtomicBool::new(false),
        }
    }

    pub fn xid(&self) -> Xid {
        self.xid
    }

    pub fn level(&self) -> IsolationLevel {
        self.level
    }

    pub fn is_in_snapshot(&self, xid: Xid) -> bool {
        xid != SUPER_XID && self.snapshot.contains(&xid)
    }

    /// Fails with the sticky error once the transaction was forced to abort.
    fn check(&self) -> Result<()> {
        if self.failed.load(Ordering::Acquire) {
            return Err(Error::ConcurrentUpdate { xid: self.xid });
        }
        Ok(())
    }
}

struct EntrySource {
    dm: Arc<DataManager>,
}

impl Resource for EntrySource {
    type Item = Entry;

    fn load(&self, uid: u64) -> Result<Entry> {
        Entry::load(&self.dm, uid)?.ok_or(Error::NullEntry { uid })
    }

    fn writeback(&self, _uid: u64, _entry: &Arc<Entry>) -> Result<()> {
        Ok(())
    }
}

struct EntryRef<'a> {
    vm: &'a VersionManager,
    entry: Arc<Entry>,
}

impl Deref for EntryRef<'_> {
    type Target = Entry;

    fn deref(&self) -> &Entry {
        &self.entry
    }
}

impl Drop for EntryRef<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.vm.entries.release(self.entry.uid()) {
            tracing::error!(uid = self.entry.uid(), error = %e, "entry release failed");
        }
    }
}

pub struct VersionManager {
    tm: Arc<TransactionManager>,
    dm: Arc<DataManager>,
    entries: RefCache<EntrySource>,
    active: Mutex<HashMap<Xid, Arc<Transaction>>>,
    locks: LockTable,
}

impl VersionManager {
    pub fn new(tm: Arc<TransactionManager>, dm: Arc<DataManager>) -> Self {
        let mut active = HashMap::new();
        active.insert(
            SUPER_XID,
            Arc::new(Transaction::new(
                SUPER_XID,
                IsolationLevel::ReadCommitted,
                HashSet::new(),
            )),
        );
        Self {
            tm,
            entries: RefCache::new(
                EntrySource {
                    dm: Arc::clone(&dm),
                },
                0,
            ),
            dm,
            active: Mutex::new(active),
            locks: LockTable::new(),
        }
    }

    pub fn begin(&self, level: IsolationLevel) -> Result<Xid> {
        let mut active = self.active.lock();
        let xid = self.tm.begin()?;
        let snapshot = active.keys().copied().collect();
        active.insert(xid, Arc::new(Transaction::new(xid, level, snapshot)));
        Ok(xid)
    }

    fn transaction(&self, xid: Xid) -> Result<Arc<Transaction>> {
        self.active
            .lock()
            .get(&xid)
            .cloned()
            .ok_or(Error::NoTransaction { xid })
    }

    fn entry(&self, uid: Uid) -> Result<Option<EntryRef<'_>>> {
        match self.entries.get(uid) {
            Ok(entry) => Ok(Some(EntryRef { vm: self, entry })),
            Err(Error::NullEntry { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// The payload at `uid` if `xid` can see it.
    pub fn read(&self, xid: Xid, uid: Uid) -> Result<Option<Vec<u8>>> {
        let t = self.transaction(xid)?;
        t.check()?;
        let Some(entry) = self.entry(uid)? else {
            return Ok(None);
        };
        if visibility::is_visible(&self.tm, &t, &entry)? {
            Ok(Some(entry.data()))
        } else {
            Ok(None)
        }
    }

    pub fn insert(&self, xid: Xid, data: &[u8]) -> Result<Uid> {
        let t = self.transaction(xid)?;
        t.check()?;
        self.dm.insert(xid, &entry::wrap_entry_raw(xid, data))
    }

    /// Marks the record at `uid` deleted by `xid`. Returns false if there was
    /// nothing visible to delete or `xid` already deleted it.
    pub fn delete(&self, xid: Xid, uid: Uid) -> Result<bool> {
        let t = self.transaction(xid)?;
        t.check()?;
        let Some(entry) = self.entry(uid)? else {
            return Ok(false);
        };
        if !visibility::is_visible(&self.tm, &t, &entry)? {
            return Ok(false);
        }

        match self.locks.add(xid, uid) {
            Ok(Some(waiter)) => waiter.wait(),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(xid, uid, error = %e, "aborting deadlocked transaction");
                return Err(self.force_abort(&t));
            }
        }

        if entry.xmax() == xid {
            return Ok(false);
        }
        if visibility::is_version_skip(&self.tm, &t, &entry)? {
            tracing::warn!(xid, uid, "aborting on version skip");
            return Err(self.force_abort(&t));
        }
        // the previous holder may have deleted it while we waited
        if !visibility::is_visible(&self.tm, &t, &entry)? {
            return Ok(false);
        }

        entry.set_xmax(xid)?;
        Ok(true)
    }

    /// Aborts `t` on the engine's behalf. `t` stays registered so later calls
    /// keep failing until the owner aborts it.
    fn force_abort(&self, t: &Transaction) -> Error {
        t.failed.store(true, Ordering::Release);
        if let Err(e) = self.abort_internal(t.xid, true) {
            return e;
        }
        t.auto_aborted.store(true, Ordering::Release);
        Error::ConcurrentUpdate { xid: t.xid }
    }

    pub fn commit(&self, xid: Xid) -> Result<()> {
        let t = self.transaction(xid)?;
        t.check()?;
        {
            // a transaction beginning now either has xid in its snapshot or sees it committed
            let mut active = self.active.lock();
            self.tm.commit(xid)?;
            active.remove(&xid);
        }
        self.locks.remove(xid);
        Ok(())
    }

    pub fn abort(&self, xid: Xid) -> Result<()> {
        self.abort_internal(xid, false)
    }

    fn abort_internal(&self, xid: Xid, auto: bool) -> Result<()> {
        let t = {
            let mut active = self.active.lock();
            let t = active.get(&xid).cloned().ok_or(Error::NoTransaction { xid })?;
            if !auto {
                active.remove(&xid);
            }
            t
        };
        if t.auto_aborted.load(Ordering::Acquire) {
            return Ok(());
        }
        self.locks.remove(xid);
        self.tm.abort(xid)
    }

    pub fn transaction_manager(&self) -> &Arc<TransactionManager> {
        &self.tm
    }

    pub fn data_manager(&self) -> &Arc<DataManager> {
        &self.dm
    }

    pub fn close(&self) -> Result<()> {
        self.entries.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::PAGE_SIZE;
    use tempfile::{tempdir, TempDir};

    fn setup() -> (TempDir, VersionManager) {
        let dir = tempdir().unwrap();
        let config = EngineConfig::new(dir.path().join("vm")).with_memory((PAGE_SIZE * 32) as u64);
        let tm = Arc::new(TransactionManager::create(config.with_suffix(".xid")).unwrap());
        let dm = DataManager::create(&config, Arc::clone(&tm)).unwrap();
        (dir, VersionManager::new(tm, dm))
    }

    #[test]
    fn test_isolation_level_from_u8() {
        assert_eq!(IsolationLevel::try_from(0), Ok(IsolationLevel::ReadCommitted));
        assert_eq!(IsolationLevel::try_from(1), Ok(IsolationLevel::RepeatableRead));
        assert_eq!(IsolationLevel::try_from(7), Err(7));
    }

    #[test]
    fn test_own_writes_and_commit() {
        let (_dir, vm) = setup();
        let x1 = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        let uid = vm.insert(x1, b"row").unwrap();
        assert_eq!(vm.read(x1, uid).unwrap(), Some(b"row".to_vec()));

        let x2 = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        assert_eq!(vm.read(x2, uid).unwrap(), None);
        vm.commit(x1).unwrap();
        assert_eq!(vm.read(x2, uid).unwrap(), Some(b"row".to_vec()));
    }

    #[test]
    fn test_delete_then_delete_again() {
        let (_dir, vm) = setup();
        let x1 = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        let uid = vm.insert(x1, b"row").unwrap();
        vm.commit(x1).unwrap();

        let x2 = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        assert!(vm.delete(x2, uid).unwrap());
        assert!(!vm.delete(x2, uid).unwrap());
        assert_eq!(vm.read(x2, uid).unwrap(), None);
        vm.commit(x2).unwrap();

        let x3 = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        assert_eq!(vm.read(x3, uid).unwrap(), None);
        assert!(!vm.delete(x3, uid).unwrap());
    }

    #[test]
    fn test_abort_releases_and_hides() {
        let (_dir, vm) = setup();
        let x1 = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        let uid = vm.insert(x1, b"gone").unwrap();
        vm.abort(x1).unwrap();
        assert!(vm.transaction_manager().is_aborted(x1).unwrap());

        let x2 = vm.begin(IsolationLevel::RepeatableRead).unwrap();
        assert_eq!(vm.read(x2, uid).unwrap(), None);
        assert!(matches!(vm.commit(x1), Err(Error::NoTransaction { .. })));
    }

    #[test]
    fn test_version_skip_aborts_and_sticks() {
        let (_dir, vm) = setup();
        let x0 = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        let uid = vm.insert(x0, b"row").unwrap();
        vm.commit(x0).unwrap();

        let a = vm.begin(IsolationLevel::RepeatableRead).unwrap();
        let b = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        assert!(vm.delete(b, uid).unwrap());
        vm.commit(b).unwrap();

        assert!(matches!(
            vm.delete(a, uid),
            Err(Error::ConcurrentUpdate { xid }) if xid == a
        ));
        assert!(vm.transaction_manager().is_aborted(a).unwrap());
        assert!(matches!(vm.read(a, uid), Err(Error::ConcurrentUpdate { .. })));
        assert!(matches!(vm.commit(a), Err(Error::ConcurrentUpdate { .. })));
        vm.abort(a).unwrap();
        assert!(matches!(vm.read(a, uid), Err(Error::NoTransaction { .. })));
    }

    #[test]
    fn test_repeatable_read_is_stable_across_concurrent_commits() {
        let (_dir, vm) = setup();
        let uids = Mutex::new(Vec::new());
        let done = AtomicBool::new(false);

        std::thread::scope(|s| {
            s.spawn(|| {
                for i in 0..200u32 {
                    let x = vm.begin(IsolationLevel::ReadCommitted).unwrap();
                    let uid = vm.insert(x, &i.to_be_bytes()).unwrap();
                    uids.lock().push(uid);
                    vm.commit(x).unwrap();
                }
                done.store(true, Ordering::Release);
            });

            while !done.load(Ordering::Acquire) {
                let reader = vm.begin(IsolationLevel::RepeatableRead).unwrap();
                let seen: Vec<_> = uids.lock().clone();
                let first: Vec<_> = seen.iter().map(|&u| vm.read(reader, u).unwrap()).collect();
                std::thread::yield_now();
                let second: Vec<_> = seen.iter().map(|&u| vm.read(reader, u).unwrap()).collect();
                assert_eq!(first, second);
                vm.commit(reader).unwrap();
            }
        });
    }

    #[test]
    fn test_unknown_transaction() {
        let (_dir, vm) = setup();
        assert!(matches!(vm.read(42, 1), Err(Error::NoTransaction { xid: 42 })));
        assert!(matches!(vm.abort(42), Err(Error::NoTransaction { xid: 42 })));
    }
}
