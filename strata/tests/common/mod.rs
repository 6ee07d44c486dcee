#![allow(dead_code)]

use std::path::Path;

use strata::{Engine, EngineConfig, PAGE_SIZE};
use tempfile::{tempdir, TempDir};

/// An engine over a temporary directory. The directory outlives the engine.
pub struct TestStore {
    pub engine: Engine,
    pub dir: TempDir,
}

pub fn config_in(dir: &Path) -> EngineConfig {
    EngineConfig::new(dir.join("store")).with_memory((PAGE_SIZE * 256) as u64)
}

pub fn new_store() -> TestStore {
    let dir = tempdir().unwrap();
    let engine = Engine::create(config_in(dir.path())).unwrap();
    TestStore { engine, dir }
}

/// Drops the engine without closing it, as a crash would, and opens it again.
pub fn crash_and_reopen(store: TestStore) -> TestStore {
    let TestStore { engine, dir } = store;
    drop(engine);
    let engine = Engine::open(config_in(dir.path())).unwrap();
    TestStore { engine, dir }
}

/// Closes the engine cleanly and opens it again.
pub fn close_and_reopen(store: TestStore) -> TestStore {
    let TestStore { engine, dir } = store;
    engine.close().unwrap();
    let engine = Engine::open(config_in(dir.path())).unwrap();
    TestStore { engine, dir }
}
