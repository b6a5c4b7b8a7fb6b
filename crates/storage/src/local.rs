//! Local filesystem storage backend

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use rulefed_core::{Error, Result};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::StorageBackend;

const TEMP_SUFFIX: &str = ".tmp";

/// Directory-backed storage
///
/// Writes go to a hidden temp file in the target directory, are fsynced,
/// then renamed over the destination; the parent directory is synced after
/// the rename so the new entry survives a crash.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    base_path: PathBuf,
}

impl LocalStorage {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Resolve a relative path, refusing anything that escapes the base directory
    fn resolve_path(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(Error::Storage {
                message: format!("Path {:?} is not a relative path inside the store", path),
            });
        }
        Ok(self.base_path.join(relative))
    }

    fn temp_path(full_path: &Path) -> PathBuf {
        let temp_name = format!(
            ".{}.{}{}",
            full_path.file_name().unwrap_or_default().to_string_lossy(),
            Uuid::new_v4(),
            TEMP_SUFFIX
        );
        full_path.with_file_name(temp_name)
    }

    async fn write_temp(temp_path: &Path, data: &[u8]) -> std::io::Result<()> {
        let mut file = fs::File::create(temp_path).await?;
        file.write_all(data).await?;
        file.sync_all().await
    }
}

fn is_temp_file(path: &Path) -> bool {
    path.file_name()
        .map(|name| {
            let name = name.to_string_lossy();
            name.starts_with('.') && name.ends_with(TEMP_SUFFIX)
        })
        .unwrap_or(false)
}

#[async_trait]
impl StorageBackend for LocalStorage {
    #[instrument(skip(self), fields(backend = "local"))]
    async fn read(&self, path: &str) -> Result<Bytes> {
        let full_path = self.resolve_path(path)?;

        match fs::read(&full_path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(Error::StoragePathNotFound {
                path: path.to_string(),
            }),
            Err(e) => Err(Error::Storage {
                message: format!("Failed to read {}: {}", path, e),
            }),
        }
    }

    #[instrument(skip(self, data), fields(backend = "local", size = data.len()))]
    async fn write(&self, path: &str, data: Bytes) -> Result<u64> {
        let full_path = self.resolve_path(path)?;
        let temp_path = Self::temp_path(&full_path);
        let size = data.len() as u64;

        let parent = full_path.parent().map(Path::to_path_buf);
        if let Some(parent) = &parent {
            fs::create_dir_all(parent).await.map_err(|e| Error::Storage {
                message: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        if let Err(e) = Self::write_temp(&temp_path, &data).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(Error::Storage {
                message: format!("Failed to write temp file {:?}: {}", temp_path, e),
            });
        }

        if let Err(e) = fs::rename(&temp_path, &full_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(Error::Storage {
                message: format!("Failed to rename {:?} to {:?}: {}", temp_path, full_path, e),
            });
        }

        // Directory fsync is best effort; not every platform allows opening a directory.
        if let Some(parent) = &parent {
            match fs::File::open(parent).await {
                Ok(dir) => {
                    if let Err(e) = dir.sync_all().await {
                        warn!(?parent, error = %e, "Failed to sync directory");
                    }
                }
                Err(e) => debug!(?parent, error = %e, "Directory sync unavailable"),
            }
        }

        debug!(?full_path, size, "Blob written");
        Ok(size)
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut results = Vec::new();
        let mut stack = vec![self.base_path.clone()];

        while let Some(dir) = stack.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(Error::Storage {
                        message: format!("Failed to list {:?}: {}", dir, e),
                    })
                }
            };

            while let Some(entry) = entries.next_entry().await? {
                let entry_path = entry.path();
                let file_type = entry.file_type().await?;

                if file_type.is_dir() {
                    stack.push(entry_path);
                } else if file_type.is_file() && !is_temp_file(&entry_path) {
                    if let Ok(relative) = entry_path.strip_prefix(&self.base_path) {
                        let relative = relative
                            .components()
                            .map(|c| c.as_os_str().to_string_lossy())
                            .collect::<Vec<_>>()
                            .join("/");
                        if relative.starts_with(prefix) {
                            results.push(relative);
                        }
                    }
                }
            }
        }

        results.sort();
        debug!(count = results.len(), "Listed blobs");
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, LocalStorage) {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp_dir.path());
        (temp_dir, storage)
    }

    #[tokio::test]
    async fn test_write_and_read() {
        let (_temp_dir, storage) = setup();
        let data = Bytes::from("global model v1");

        let written = storage.write("versions/v1.rgm", data.clone()).await.unwrap();
        assert_eq!(written, data.len() as u64);
        assert_eq!(storage.read("versions/v1.rgm").await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_overwrite_replaces_contents() {
        let (_temp_dir, storage) = setup();

        storage.write("CURRENT", Bytes::from("{\"version\":1}")).await.unwrap();
        storage.write("CURRENT", Bytes::from("{\"version\":2}")).await.unwrap();

        assert_eq!(
            storage.read("CURRENT").await.unwrap(),
            Bytes::from("{\"version\":2}")
        );
    }

    #[tokio::test]
    async fn test_read_not_found() {
        let (_temp_dir, storage) = setup();

        assert!(matches!(
            storage.read("missing").await,
            Err(Error::StoragePathNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_list_by_prefix_skips_temp_files() {
        let (temp_dir, storage) = setup();

        storage.write("versions/v2.rgm", Bytes::from("2")).await.unwrap();
        storage.write("versions/v1.rgm", Bytes::from("1")).await.unwrap();
        storage.write("CURRENT", Bytes::from("{}")).await.unwrap();
        std::fs::write(temp_dir.path().join("versions/.v3.rgm.abc.tmp"), b"partial").unwrap();

        let versions = storage.list("versions/").await.unwrap();
        assert_eq!(versions, vec!["versions/v1.rgm", "versions/v2.rgm"]);
        assert_eq!(storage.list("").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_list_on_missing_base() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp_dir.path().join("not-created-yet"));
        assert!(storage.list("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_escaping_paths() {
        let (_temp_dir, storage) = setup();

        assert!(matches!(
            storage.write("../outside", Bytes::from("x")).await,
            Err(Error::Storage { .. })
        ));
        assert!(matches!(
            storage.read("/etc/passwd").await,
            Err(Error::Storage { .. })
        ));
    }

    #[tokio::test]
    async fn test_no_temp_files_left_behind() {
        let (temp_dir, storage) = setup();

        storage.write("atomic.bin", Bytes::from("complete")).await.unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(temp_dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| is_temp_file(&e.path()))
            .collect();
        assert!(leftovers.is_empty());
    }
}
