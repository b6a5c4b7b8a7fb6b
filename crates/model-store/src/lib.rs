//! Global model store
//!
//! Publishes merged rule models as strictly increasing versions and keeps
//! them durable across restarts. Layout on the storage backend:
//!
//! ```text
//! CURRENT                  pointer to the authoritative version (JSON)
//! versions/v0000000001.rgm one record per published version
//! ```

pub mod record;
pub mod store;

pub use record::{ModelRecord, RECORD_FORMAT_VERSION, RECORD_MAGIC};
pub use store::{CurrentPointer, GlobalModelStore, GlobalModelStoreHandle, VersionInfo};
