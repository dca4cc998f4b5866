//! Blocking filesystem helpers run on the blocking pool.

use std::fs;
use std::io;
use std::path::Path;

use stowage_transfer_core::{StoreError, StoreResult};
use walkdir::WalkDir;

fn walk_error(operation: &'static str, root: &Path, err: walkdir::Error) -> StoreError {
    let path = err.path().unwrap_or(root).to_path_buf();
    StoreError::io(operation, path, io::Error::other(err))
}

/// Total size of the regular files below `root`; zero when it does not exist.
pub(crate) fn usage(root: &Path) -> StoreResult<u64> {
    if !root.exists() {
        return Ok(0);
    }
    let mut total = 0_u64;
    for entry in WalkDir::new(root) {
        let entry = entry.map_err(|err| walk_error("usage.walk", root, err))?;
        if entry.file_type().is_file() {
            let metadata = entry
                .metadata()
                .map_err(|err| walk_error("usage.metadata", root, err))?;
            total = total.saturating_add(metadata.len());
        }
    }
    Ok(total)
}

pub(crate) fn copy_tree(source: &Path, destination: &Path) -> StoreResult<()> {
    if source.is_file() {
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| StoreError::io("copy_tree.create_parent", parent, err))?;
        }
        fs::copy(source, destination)
            .map_err(|err| StoreError::io("copy_tree.copy_file", destination, err))?;
        return Ok(());
    }

    for entry in WalkDir::new(source) {
        let entry = entry.map_err(|err| walk_error("copy_tree.walk", source, err))?;
        let Ok(relative) = entry.path().strip_prefix(source) else {
            continue;
        };
        let target = destination.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)
                .map_err(|err| StoreError::io("copy_tree.create_dir", &target, err))?;
        } else {
            fs::copy(entry.path(), &target)
                .map_err(|err| StoreError::io("copy_tree.copy_entry", &target, err))?;
        }
    }
    Ok(())
}

/// Rename `source` onto `destination`, copying across filesystems when needed.
pub(crate) fn move_tree(source: &Path, destination: &Path) -> StoreResult<()> {
    if !source.exists() {
        return Err(StoreError::io(
            "move_tree.source",
            source,
            io::Error::from(io::ErrorKind::NotFound),
        ));
    }
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| StoreError::io("move_tree.create_parent", parent, err))?;
    }
    match fs::rename(source, destination) {
        Ok(()) => Ok(()),
        Err(_rename_err) => {
            copy_tree(source, destination)?;
            let cleanup = if source.is_dir() {
                fs::remove_dir_all(source)
            } else {
                fs::remove_file(source)
            };
            match cleanup {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(err) => Err(StoreError::io("move_tree.cleanup", source, err)),
            }
        }
    }
}
