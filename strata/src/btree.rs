//! B+Tree index over `i64` keys, with every node stored as a data item.
//!
//! Node layout: `[is_leaf: u8][key_count: u16][sibling: u64]` followed by
//! `(son: u64, key: i64)` pairs. In an internal node `son[i]` holds keys
//! up to `key[i]`; keys past the last bound continue at the sibling. A key
//! equal to a bound may sit on either side of it, so descents take the left
//! son and range scans walk right along the leaf chain. Leaves
//! are chained through their siblings. The root uid lives in a boot item so
//! a root split only rewrites eight bytes.
//!
//! Nodes are owned by the super transaction and are never freed.
use std::sync::Arc;

use parking_lot::Mutex;

use crate::data_manager::{DataItemRef, DataManager};
use crate::error::{Error, Result};
use crate::{Uid, SUPER_XID};

pub type Key = i64;

pub const BALANCE_NUMBER: usize = 32;

const IS_LEAF_OFFSET: usize = 0;
const KEY_COUNT_OFFSET: usize = IS_LEAF_OFFSET + 1;
const SIBLING_OFFSET: usize = KEY_COUNT_OFFSET + 2;
const NODE_HEADER_SIZE: usize = SIBLING_OFFSET + 8;
const PAIR_SIZE: usize = 16;
pub const NODE_SIZE: usize = NODE_HEADER_SIZE + PAIR_SIZE * (BALANCE_NUMBER * 2 + 2);

fn read_u64(raw: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&raw[at..at + 8]);
    u64::from_be_bytes(buf)
}

fn is_leaf(raw: &[u8]) -> bool {
    raw[IS_LEAF_OFFSET] == 1
}

fn set_is_leaf(raw: &mut [u8], leaf: bool) {
    raw[IS_LEAF_OFFSET] = leaf as u8;
}

fn key_count(raw: &[u8]) -> usize {
    u16::from_be_bytes([raw[KEY_COUNT_OFFSET], raw[KEY_COUNT_OFFSET + 1]]) as usize
}

fn set_key_count(raw: &mut [u8], n: usize) {
    raw[KEY_COUNT_OFFSET..KEY_COUNT_OFFSET + 2].copy_from_slice(&(n as u16).to_be_bytes());
}

fn sibling(raw: &[u8]) -> Uid {
    read_u64(raw, SIBLING_OFFSET)
}

fn set_sibling(raw: &mut [u8], uid: Uid) {
    raw[SIBLING_OFFSET..SIBLING_OFFSET + 8].copy_from_slice(&uid.to_be_bytes());
}

fn pair_offset(k: usize) -> usize {
    NODE_HEADER_SIZE + k * PAIR_SIZE
}

fn son(raw: &[u8], k: usize) -> Uid {
    read_u64(raw, pair_offset(k))
}

fn set_son(raw: &mut [u8], k: usize, uid: Uid) {
    let at = pair_offset(k);
    raw[at..at + 8].copy_from_slice(&uid.to_be_bytes());
}

fn key(raw: &[u8], k: usize) -> Key {
    read_u64(raw, pair_offset(k) + 8) as Key
}

fn set_key(raw: &mut [u8], k: usize, key: Key) {
    let at = pair_offset(k) + 8;
    raw[at..at + 8].copy_from_slice(&key.to_be_bytes());
}

/// Moves pairs `k..` one slot right.
fn shift_from(raw: &mut [u8], k: usize) {
    let begin = pair_offset(k);
    raw.copy_within(begin..NODE_SIZE - PAIR_SIZE, begin + PAIR_SIZE);
}

fn nil_raw() -> Vec<u8> {
    vec![0u8; NODE_SIZE]
}

/// An empty leaf, the first root of every tree.
pub fn nil_root_raw() -> Vec<u8> {
    let mut raw = nil_raw();
    set_is_leaf(&mut raw, true);
    raw
}

/// A root over two children split at `key`.
pub fn new_root_raw(left: Uid, right: Uid, key: Key) -> Vec<u8> {
    let mut raw = nil_raw();
    set_is_leaf(&mut raw, false);
    set_key_count(&mut raw, 2);
    set_son(&mut raw, 0, left);
    set_key(&mut raw, 0, key);
    set_son(&mut raw, 1, right);
    set_key(&mut raw, 1, Key::MAX);
    raw
}

/// Inserts `(uid, key)` in sorted position. Returns false when the key
/// belongs past this node and a sibling exists.
fn insert_pair(raw: &mut [u8], uid: Uid, new_key: Key) -> bool {
    let count = key_count(raw);
    let kth = (0..count).find(|&k| key(raw, k) >= new_key).unwrap_or(count);
    if kth == count && sibling(raw) != 0 {
        return false;
    }

    if is_leaf(raw) {
        shift_from(raw, kth);
        set_key(raw, kth, new_key);
        set_son(raw, kth, uid);
    } else {
        // son[kth] was split: it keeps keys below new_key and uid takes the rest
        let bound = key(raw, kth);
        set_key(raw, kth, new_key);
        shift_from(raw, kth + 1);
        set_key(raw, kth + 1, bound);
        set_son(raw, kth + 1, uid);
    }
    set_key_count(raw, count + 1);
    true
}

/// Moves the upper half of `raw` into a new node and links it as the sibling.
fn split(dm: &DataManager, raw: &mut [u8]) -> Result<(Uid, Key)> {
    let mut upper = nil_raw();
    set_is_leaf(&mut upper, is_leaf(raw));
    set_key_count(&mut upper, BALANCE_NUMBER);
    set_sibling(&mut upper, sibling(raw));
    let from = pair_offset(BALANCE_NUMBER);
    let len = BALANCE_NUMBER * PAIR_SIZE;
    upper[NODE_HEADER_SIZE..NODE_HEADER_SIZE + len].copy_from_slice(&raw[from..from + len]);

    let upper_uid = dm.insert(SUPER_XID, &upper)?;
    set_key_count(raw, BALANCE_NUMBER);
    set_sibling(raw, upper_uid);
    Ok((upper_uid, key(&upper, 0)))
}

enum Step {
    Son(Uid),
    Sibling(Uid),
}

enum Inserted {
    MoveRight(Uid),
    Done,
    Split { son: Uid, key: Key },
}

/// A node checked out of the data manager for one step of a search or insert.
struct Node {
    item: DataItemRef,
}

impl Node {
    fn load(dm: &Arc<DataManager>, uid: Uid) -> Result<Self> {
        let item = dm.read(uid)?.ok_or(Error::RecordNotFound { uid })?;
        Ok(Self { item })
    }

    fn is_leaf(&self) -> bool {
        is_leaf(&self.item.data())
    }

    fn search_next(&self, target: Key) -> Step {
        let raw = self.item.data();
        let count = key_count(&raw);
        if let Some(k) = (0..count).find(|&k| target <= key(&raw, k)) {
            return Step::Son(son(&raw, k));
        }
        match sibling(&raw) {
            0 if count > 0 => Step::Son(son(&raw, count - 1)),
            s => Step::Sibling(s),
        }
    }

    /// Uids with keys in `[lo, hi]`, plus the next leaf when the range may continue there.
    fn leaf_search_range(&self, lo: Key, hi: Key) -> (Vec<Uid>, Uid) {
        let raw = self.item.data();
        let count = key_count(&raw);
        let mut k = (0..count).find(|&k| key(&raw, k) >= lo).unwrap_or(count);
        let mut uids = Vec::new();
        while k < count && key(&raw, k) <= hi {
            uids.push(son(&raw, k));
            k += 1;
        }
        let next = if k == count { sibling(&raw) } else { 0 };
        (uids, next)
    }

    fn insert_and_split(&self, dm: &DataManager, uid: Uid, new_key: Key) -> Result<Inserted> {
        let mut writer = self.item.before();
        let mut raw = writer.data();
        if !insert_pair(&mut raw, uid, new_key) {
            let next = sibling(&raw);
            writer.un_before();
            return Ok(Inserted::MoveRight(next));
        }

        let outcome = if key_count(&raw) == BALANCE_NUMBER * 2 {
            let (son, key) = split(dm, &mut raw)?;
            Inserted::Split { son, key }
        } else {
            Inserted::Done
        };
        writer.set_data(&raw);
        writer.after(SUPER_XID)?;
        Ok(outcome)
    }
}

pub struct BPlusTree {
    dm: Arc<DataManager>,
    boot_uid: Uid,
    boot: DataItemRef,
    /// Serializes writers. Readers take the root from `boot` under its item latch.
    boot_lock: Mutex<()>,
}

impl BPlusTree {
    /// Builds an empty tree and returns the uid of its boot item.
    pub fn create(dm: &Arc<DataManager>) -> Result<Uid> {
        let root = dm.insert(SUPER_XID, &nil_root_raw())?;
        let boot_uid = dm.insert(SUPER_XID, &root.to_be_bytes())?;
        tracing::debug!(boot_uid, root, "created index");
        Ok(boot_uid)
    }

    pub fn load(dm: Arc<DataManager>, boot_uid: Uid) -> Result<Self> {
        let boot = dm
            .read(boot_uid)?
            .ok_or(Error::RecordNotFound { uid: boot_uid })?;
        Ok(Self {
            dm,
            boot_uid,
            boot,
            boot_lock: Mutex::new(()),
        })
    }

    pub fn boot_uid(&self) -> Uid {
        self.boot_uid
    }

    fn read_root(&self) -> Uid {
        read_u64(&self.boot.data(), 0)
    }

    pub fn search(&self, key: Key) -> Result<Vec<Uid>> {
        self.search_range(key, key)
    }

    /// Uids of every entry with a key in `[lo, hi]`, in key order.
    pub fn search_range(&self, lo: Key, hi: Key) -> Result<Vec<Uid>> {
        let mut leaf = self.search_leaf(self.read_root(), lo)?;
        let mut uids = Vec::new();
        while leaf != 0 {
            let (found, next) = Node::load(&self.dm, leaf)?.leaf_search_range(lo, hi);
            uids.extend(found);
            leaf = next;
        }
        Ok(uids)
    }

    fn search_leaf(&self, node_uid: Uid, key: Key) -> Result<Uid> {
        if Node::load(&self.dm, node_uid)?.is_leaf() {
            return Ok(node_uid);
        }
        let next = self.search_next(node_uid, key)?;
        self.search_leaf(next, key)
    }

    fn search_next(&self, mut node_uid: Uid, key: Key) -> Result<Uid> {
        loop {
            match Node::load(&self.dm, node_uid)?.search_next(key) {
                Step::Son(uid) => return Ok(uid),
                Step::Sibling(0) => return Err(Error::RecordNotFound { uid: node_uid }),
                Step::Sibling(uid) => node_uid = uid,
            }
        }
    }

    pub fn insert(&self, key: Key, uid: Uid) -> Result<()> {
        let _boot = self.boot_lock.lock();
        let root = self.read_root();
        if let Some((right, right_key)) = self.insert_at(root, uid, key)? {
            self.update_root(root, right, right_key)?;
        }
        Ok(())
    }

    fn insert_at(&self, node_uid: Uid, uid: Uid, key: Key) -> Result<Option<(Uid, Key)>> {
        if Node::load(&self.dm, node_uid)?.is_leaf() {
            return self.insert_and_split(node_uid, uid, key);
        }
        let next = self.search_next(node_uid, key)?;
        match self.insert_at(next, uid, key)? {
            Some((son, son_key)) => self.insert_and_split(node_uid, son, son_key),
            None => Ok(None),
        }
    }

    fn insert_and_split(&self, mut node_uid: Uid, uid: Uid, key: Key) -> Result<Option<(Uid, Key)>> {
        loop {
            let node = Node::load(&self.dm, node_uid)?;
            match node.insert_and_split(&self.dm, uid, key)? {
                Inserted::MoveRight(next) => node_uid = next,
                Inserted::Done => return Ok(None),
                Inserted::Split { son, key } => return Ok(Some((son, key))),
            }
        }
    }

    fn update_root(&self, left: Uid, right: Uid, right_key: Key) -> Result<()> {
        let root = self.dm.insert(SUPER_XID, &new_root_raw(left, right, right_key))?;
        let mut writer = self.boot.before();
        writer.set_data(&root.to_be_bytes());
        writer.after(SUPER_XID)?;
        tracing::debug!(root, "index root split");
        Ok(())
    }
}
