//! Filesystem-backed persistence.

use async_trait::async_trait;
use bytes::Bytes;
use kiln_core::persistence::{Persistence, key_segments};
use kiln_core::Result;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::StorageError;

/// Stores each key as a file under `root`.
///
/// Writes go to a hidden temporary file in the target directory which is
/// synced and renamed over the target, so a crash leaves either the old or
/// the new record.
#[derive(Debug, Clone)]
pub struct FsPersistence {
    root: PathBuf,
}

impl FsPersistence {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let mut path = self.root.clone();
        for segment in key_segments(key)? {
            path.push(segment);
        }
        Ok(path)
    }
}

fn is_temp_file(name: &str) -> bool {
    name.starts_with('.') && name.contains(".tmp.")
}

#[async_trait]
impl Persistence for FsPersistence {
    async fn read(&self, key: &str) -> Result<Option<Bytes>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::io(key, e).into()),
        }
    }

    async fn atomic_write(&self, key: &str, data: Bytes) -> Result<()> {
        let path = self.path_for(key)?;
        let (Some(dir), Some(file_name)) = (path.parent(), path.file_name()) else {
            return Err(kiln_core::Error::InvalidInput(format!("invalid storage key '{}'", key)));
        };

        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| StorageError::io(key, e))?;

        let tmp = dir.join(format!(
            ".{}.tmp.{}",
            file_name.to_string_lossy(),
            Uuid::new_v4().simple()
        ));

        let write = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(&data).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&tmp, &path).await
        };

        if let Err(e) = write.await {
            if let Err(cleanup) = tokio::fs::remove_file(&tmp).await {
                if cleanup.kind() != ErrorKind::NotFound {
                    warn!(path = %tmp.display(), error = %cleanup, "Failed to remove temporary file");
                }
            }
            return Err(StorageError::io(key, e).into());
        }

        debug!(key, bytes = data.len(), "Record written");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::io(key, e).into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        // Start from the deepest directory the prefix names.
        let base = match prefix.rfind('/') {
            Some(i) => &prefix[..i],
            None => "",
        };
        let start = if base.is_empty() {
            self.root.clone()
        } else {
            self.path_for(base)?
        };

        let mut keys = Vec::new();
        let mut pending = vec![(start, base.to_string())];

        while let Some((dir, rel)) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(StorageError::io(&rel, e).into()),
            };

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| StorageError::io(&rel, e))?
            {
                let name = entry.file_name().to_string_lossy().into_owned();
                let key = if rel.is_empty() {
                    name.clone()
                } else {
                    format!("{}/{}", rel, name)
                };
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| StorageError::io(&key, e))?;

                if file_type.is_dir() {
                    let dir_key = format!("{}/", key);
                    if dir_key.starts_with(prefix) || prefix.starts_with(&dir_key) {
                        pending.push((entry.path(), key));
                    }
                } else if !is_temp_file(&name) && key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }

        keys.sort();
        Ok(keys)
    }
}
