pub mod btree;

pub mod cache;

pub mod config;

pub mod data_item;

pub mod data_manager;

pub mod engine;

pub mod entry;

pub mod error;

pub mod failpoint;

pub mod lock_table;

pub mod page;

pub mod page_cache;

pub mod page_index;

pub mod pager;

pub mod recovery;

pub mod transaction;

pub mod version_manager;

pub mod visibility;

pub mod wal;

pub const PAGE_SIZE: usize = 8192;

pub type PageNo = u32;

/// Transaction identifier. `0` is the super transaction.
pub type Xid = u64;

/// Record address: page number in the high 32 bits, in-page offset in the low 16.
pub type Uid = u64;

pub const SUPER_XID: Xid = 0;

pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{Error, Result};
pub use version_manager::IsolationLevel;

pub fn address_to_uid(pgno: PageNo, offset: u16) -> Uid {
    ((pgno as u64) << 32) | offset as u64
}

pub fn uid_to_address(uid: Uid) -> (PageNo, u16) {
    let offset = (uid & 0xffff) as u16;
    let pgno = (uid >> 32) as PageNo;
    (pgno, offset)
}
