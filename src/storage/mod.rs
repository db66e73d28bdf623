//! Key-value persistence boundary.
//!
//! Every core component that persists anything goes through `Database`;
//! the engine behind it (LevelDB-style store, in-memory map) is not this
//! crate's concern. The transaction-pool journal is the one exception and
//! does its own append-only file I/O.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database closed")]
    Closed,
    #[error("io: {0}")]
    Io(String),
}

pub trait Database: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DbError>;
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), DbError>;
    fn has(&self, key: &[u8]) -> Result<bool, DbError>;
    fn delete(&self, key: &[u8]) -> Result<(), DbError>;
    fn new_batch(&self) -> Box<dyn Batch>;
}

/// Write batch: buffered puts flushed atomically by `write`.
pub trait Batch: Send {
    fn put(&mut self, key: &[u8], value: &[u8]);
    fn write(&mut self) -> Result<(), DbError>;
    fn value_size(&self) -> usize;
    fn reset(&mut self);
}

// ── In-memory reference implementation ────────────────────────────────────

#[derive(Default, Clone)]
pub struct MemDb {
    inner: Arc<Mutex<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Database for MemDb {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DbError> {
        Ok(self.inner.lock().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), DbError> {
        self.inner.lock().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn has(&self, key: &[u8]) -> Result<bool, DbError> {
        Ok(self.inner.lock().contains_key(key))
    }

    fn delete(&self, key: &[u8]) -> Result<(), DbError> {
        self.inner.lock().remove(key);
        Ok(())
    }

    fn new_batch(&self) -> Box<dyn Batch> {
        Box::new(MemBatch { db: self.clone(), writes: Vec::new(), size: 0 })
    }
}

struct MemBatch {
    db: MemDb,
    writes: Vec<(Vec<u8>, Vec<u8>)>,
    size: usize,
}

impl Batch for MemBatch {
    fn put(&mut self, key: &[u8], value: &[u8]) {
        self.size += value.len();
        self.writes.push((key.to_vec(), value.to_vec()));
    }

    fn write(&mut self) -> Result<(), DbError> {
        let mut map = self.db.inner.lock();
        for (k, v) in self.writes.drain(..) {
            map.insert(k, v);
        }
        self.size = 0;
        Ok(())
    }

    fn value_size(&self) -> usize {
        self.size
    }

    fn reset(&mut self) {
        self.writes.clear();
        self.size = 0;
    }
}
