//! Storage backend trait definition

use async_trait::async_trait;
use bytes::Bytes;
use rulefed_core::Result;
use std::sync::Arc;

/// Async blob storage addressed by relative, `/`-separated paths
///
/// `write` must be all-or-nothing: a reader observes either the previous
/// contents of a path or the complete new contents, never a prefix.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Read the full contents at `path`
    ///
    /// # Errors
    /// [`rulefed_core::Error::StoragePathNotFound`] when nothing is stored there
    async fn read(&self, path: &str) -> Result<Bytes>;

    /// Replace the contents at `path`, creating parents as needed
    ///
    /// # Returns
    /// Number of bytes written
    async fn write(&self, path: &str, data: Bytes) -> Result<u64>;

    /// All stored paths starting with `prefix`, sorted
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Shared handle to a backend
pub type StorageHandle = Arc<dyn StorageBackend>;
