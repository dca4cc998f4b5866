//! Owner and path sanitisation.

use std::path::{Component, Path, PathBuf};

use stowage_transfer_core::{StoreError, StoreResult};

/// Validate an owner identifier for use as a directory name.
pub(crate) fn owner_dir(root: &Path, owner: &str) -> StoreResult<PathBuf> {
    let valid = !owner.is_empty()
        && owner != "."
        && owner != ".."
        && !owner.contains(['/', '\\', '\0']);
    if !valid {
        return Err(StoreError::denied(owner, "invalid_owner"));
    }
    Ok(root.join(owner))
}

/// Resolve a client path inside the owner's directory.
///
/// Leading slashes and `.` segments are ignored; `..` and platform prefixes
/// are refused so the result never leaves `owner_root`.
pub(crate) fn resolve(owner_root: &Path, path: &str) -> StoreResult<PathBuf> {
    if path.contains('\0') {
        return Err(StoreError::denied(path, "invalid_segment"));
    }
    let mut relative = PathBuf::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(segment) => relative.push(segment),
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                return Err(StoreError::denied(path, "path_escape"));
            }
        }
    }
    if relative.as_os_str().is_empty() {
        return Err(StoreError::denied(path, "empty_path"));
    }
    Ok(owner_root.join(relative))
}
