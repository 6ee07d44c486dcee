//! The engine handle that the table layer talks to.

use std::sync::Arc;

use crate::btree::BPlusTree;
use crate::config::EngineConfig;
use crate::data_manager::DataManager;
use crate::error::{Error, Result};
use crate::transaction::TransactionManager;
use crate::version_manager::{IsolationLevel, VersionManager};
use crate::{Uid, Xid};

const SUFFIXES: [&str; 3] = [".db", ".log", ".xid"];

pub struct Engine {
    config: EngineConfig,
    dm: Arc<DataManager>,
    vm: VersionManager,
}

impl Engine {
    /// Creates a new store. Fails if any of its files already exist.
    pub fn create(config: EngineConfig) -> Result<Self> {
        for suffix in SUFFIXES {
            let path = config.with_suffix(suffix);
            if path.exists() {
                return Err(Error::FileExists { path });
            }
        }
        let tm = Arc::new(TransactionManager::create(config.with_suffix(".xid"))?);
        let dm = DataManager::create(&config, Arc::clone(&tm))?;
        let vm = VersionManager::new(tm, Arc::clone(&dm));
        tracing::info!(path = ?config.path, "created store");
        Ok(Self { config, dm, vm })
    }

    /// Opens an existing store, running recovery if it was not closed cleanly.
    pub fn open(config: EngineConfig) -> Result<Self> {
        let tm = Arc::new(TransactionManager::open(config.with_suffix(".xid"))?);
        let dm = DataManager::open(&config, Arc::clone(&tm))?;
        let vm = VersionManager::new(tm, Arc::clone(&dm));
        tracing::info!(path = ?config.path, "opened store");
        Ok(Self { config, dm, vm })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn begin_transaction(&self, level: IsolationLevel) -> Result<Xid> {
        self.vm.begin(level)
    }

    pub fn commit(&self, xid: Xid) -> Result<()> {
        self.vm.commit(xid)
    }

    pub fn abort(&self, xid: Xid) -> Result<()> {
        self.vm.abort(xid)
    }

    pub fn insert_record(&self, xid: Xid, data: &[u8]) -> Result<Uid> {
        self.vm.insert(xid, data)
    }

    pub fn read_record(&self, xid: Xid, uid: Uid) -> Result<Option<Vec<u8>>> {
        self.vm.read(xid, uid)
    }

    pub fn delete_record(&self, xid: Xid, uid: Uid) -> Result<bool> {
        self.vm.delete(xid, uid)
    }

    /// Creates an empty index and returns the uid to load it by.
    pub fn create_index(&self) -> Result<Uid> {
        BPlusTree::create(&self.dm)
    }

    pub fn load_index(&self, boot_uid: Uid) -> Result<BPlusTree> {
        BPlusTree::load(Arc::clone(&self.dm), boot_uid)
    }

    /// Flushes everything and marks the store cleanly shut down. Indexes
    /// loaded from this engine must be dropped first.
    pub fn close(self) -> Result<()> {
        self.vm.close()?;
        self.dm.close()?;
        self.vm.transaction_manager().close()?;
        tracing::info!(path = ?self.config.path, "closed store");
        Ok(())
    }
}
