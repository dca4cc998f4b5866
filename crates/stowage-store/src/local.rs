//! [`FileStore`] backed by a directory tree.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use stowage_transfer_core::{FileStore, StoreError, StoreReader, StoreResult, StoreWriter};
use tokio::fs::{self, OpenOptions};
use tokio::task;
use tracing::{debug, info};
use uuid::Uuid;

use crate::handles::{LocalReader, LocalWriter};
use crate::paths::{owner_dir, resolve};
use crate::tree;

/// File store rooted at a local directory, one subdirectory per owner.
#[derive(Debug, Clone)]
pub struct LocalFileStore {
    root: PathBuf,
    owner_quota_bytes: Option<u64>,
}

impl LocalFileStore {
    /// Build a store rooted at `root`, optionally capping each owner's usage.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, owner_quota_bytes: Option<u64>) -> Self {
        Self {
            root: root.into(),
            owner_quota_bytes,
        }
    }

    /// Root directory of the store.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn locate(&self, owner: &str, path: &str) -> StoreResult<(PathBuf, PathBuf)> {
        let owner_root = owner_dir(&self.root, owner)?;
        let target = resolve(&owner_root, path)?;
        Ok((owner_root, target))
    }

    async fn check_quota(
        &self,
        owner_root: PathBuf,
        target: &Path,
        path: &str,
        declared_size: u64,
    ) -> StoreResult<()> {
        let Some(quota) = self.owner_quota_bytes else {
            return Ok(());
        };
        let used = task::spawn_blocking(move || tree::usage(&owner_root))
            .await
            .map_err(|err| StoreError::io("quota.usage", target, io::Error::other(err)))??;
        // Overwriting a file frees its current size.
        let replaced = match fs::metadata(target).await {
            Ok(metadata) if metadata.is_file() => metadata.len(),
            _ => 0,
        };
        let projected = used.saturating_sub(replaced).saturating_add(declared_size);
        if projected > quota {
            debug!(path, used, declared_size, quota, "write refused by quota");
            return Err(StoreError::denied(path, "quota_exceeded"));
        }
        Ok(())
    }
}

fn map_open_error(operation: &'static str, path: &str, target: &Path, err: io::Error) -> StoreError {
    match err.kind() {
        io::ErrorKind::NotFound => StoreError::NotFound {
            path: path.to_string(),
        },
        io::ErrorKind::PermissionDenied => StoreError::denied(path, "filesystem_denied"),
        _ => StoreError::io(operation, target, err),
    }
}

#[async_trait]
impl FileStore for LocalFileStore {
    async fn readable(&self, owner: &str, path: &str) -> StoreResult<Box<dyn StoreReader>> {
        let (_, target) = self.locate(owner, path)?;
        let metadata = fs::metadata(&target)
            .await
            .map_err(|err| map_open_error("readable.metadata", path, &target, err))?;
        if !metadata.is_file() {
            return Err(StoreError::NotFound {
                path: path.to_string(),
            });
        }
        let file = fs::File::open(&target)
            .await
            .map_err(|err| map_open_error("readable.open", path, &target, err))?;
        Ok(Box::new(LocalReader::new(file)))
    }

    async fn writable(
        &self,
        owner: &str,
        path: &str,
        declared_size: u64,
    ) -> StoreResult<Box<dyn StoreWriter>> {
        let (owner_root, target) = self.locate(owner, path)?;
        if fs::metadata(&target)
            .await
            .is_ok_and(|metadata| metadata.is_dir())
        {
            return Err(StoreError::denied(path, "target_is_directory"));
        }
        self.check_quota(owner_root, &target, path, declared_size)
            .await?;

        let parent = target
            .parent()
            .ok_or_else(|| StoreError::denied(path, "empty_path"))?;
        fs::create_dir_all(parent)
            .await
            .map_err(|err| map_open_error("writable.create_parent", path, parent, err))?;
        let name = target
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp = parent.join(format!(".{name}.{}.part", Uuid::new_v4().simple()));
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp)
            .await
            .map_err(|err| map_open_error("writable.open", path, &temp, err))?;
        Ok(Box::new(LocalWriter::new(file, temp, target)))
    }

    async fn import(&self, owner: &str, path: &str, artifact: &Path) -> StoreResult<()> {
        let (_, target) = self.locate(owner, path)?;
        let source = artifact.to_path_buf();
        let destination = target.clone();
        task::spawn_blocking(move || tree::move_tree(&source, &destination))
            .await
            .map_err(|err| StoreError::io("import.join", artifact, io::Error::other(err)))??;
        info!(
            owner,
            path,
            artifact = %artifact.display(),
            "artifact imported into store"
        );
        Ok(())
    }

    async fn contains(&self, owner: &str, path: &str) -> StoreResult<bool> {
        let (_, target) = self.locate(owner, path)?;
        fs::try_exists(&target)
            .await
            .map_err(|err| StoreError::io("contains", &target, err))
    }
}
