//! Storage - blob backends behind the global model store
//!
//! Two backends ship with the crate:
//! - [`LocalStorage`]: a directory on the local filesystem, with atomic
//!   temp-file-then-rename writes
//! - [`MemoryStorage`]: an in-process map, used by tests and ephemeral
//!   coordinators
//!
//! # Example
//!
//! ```no_run
//! use storage::{StorageBackend, LocalStorage};
//! use bytes::Bytes;
//!
//! # async fn example() -> rulefed_core::Result<()> {
//! let storage = LocalStorage::new("/tmp/federation-data");
//! storage.write("versions/v0000000001.rgm", Bytes::from(vec![1, 2, 3])).await?;
//! let data = storage.read("versions/v0000000001.rgm").await?;
//! # Ok(())
//! # }
//! ```

mod backend;
mod local;
mod memory;

pub use backend::{StorageBackend, StorageHandle};
pub use local::LocalStorage;
pub use memory::MemoryStorage;
