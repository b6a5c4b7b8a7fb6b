//! In-memory storage backend

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use rulefed_core::{Error, Result};

use crate::StorageBackend;

/// Map-backed storage that lives as long as the process
///
/// Writes can be switched to fail with [`MemoryStorage::fail_writes`], which
/// lets callers exercise their persistence-failure paths.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    blobs: RwLock<BTreeMap<String, Bytes>>,
    fail_writes: AtomicBool,
    writes: AtomicU64,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail (or succeed again)
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful writes so far
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Overwrite a blob directly, bypassing failure injection
    pub fn insert_raw(&self, path: &str, data: Bytes) {
        self.blobs.write().insert(path.to_string(), data);
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    async fn read(&self, path: &str) -> Result<Bytes> {
        self.blobs
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| Error::StoragePathNotFound {
                path: path.to_string(),
            })
    }

    async fn write(&self, path: &str, data: Bytes) -> Result<u64> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Storage {
                message: format!("Injected write failure for {}", path),
            });
        }

        let size = data.len() as u64;
        self.blobs.write().insert(path.to_string(), data);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(size)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .blobs
            .read()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}
