//! Ownership-aware filesystem helpers.
//!
//! All result-tree writes funnel through [FsWriter] so that, when a results
//! owner is configured, every created file and directory ends up `chown`ed to
//! the configured uid/gid instead of the process user.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::{
    ffi::CString,
    fs,
    os::unix::ffi::OsStrExt,
    path::Path,
};

/// The principal that should own files written to the results tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct OwnerConfig {
    /// The owning user id.
    pub(crate) uid: u32,
    /// The owning group id.
    pub(crate) gid: u32,
}

/// A filesystem writer that applies an optional [OwnerConfig] to everything
/// it creates.
#[derive(Debug, Clone, Default)]
pub(crate) struct FsWriter {
    owner: Option<OwnerConfig>,
}

impl FsWriter {
    /// Creates a new writer for the given (optional) owner.
    pub(crate) fn new(owner: Option<OwnerConfig>) -> Self {
        Self { owner }
    }

    /// Creates a directory and all missing parents, chowning every directory
    /// created by this call.
    pub(crate) fn create_dir_all(&self, path: &Path) -> Result<()> {
        // Find the deepest existing ancestor so only newly created
        // directories are chowned.
        let mut missing = Vec::new();
        let mut cursor = path;
        while !cursor.exists() {
            missing.push(cursor.to_path_buf());
            cursor = cursor
                .parent()
                .ok_or_else(|| eyre!("no existing ancestor for {}", path.display()))?;
        }

        fs::create_dir_all(path)?;
        for dir in missing.into_iter().rev() {
            self.apply_owner(&dir)?;
        }
        Ok(())
    }

    /// Writes a file (creating parent directories as needed) and chowns it.
    pub(crate) fn write(&self, path: &Path, contents: impl AsRef<[u8]>) -> Result<()> {
        if let Some(parent) = path.parent() {
            self.create_dir_all(parent)?;
        }
        fs::write(path, contents)?;
        self.apply_owner(path)
    }

    /// Serialises a value as indented JSON and writes it.
    pub(crate) fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        self.write(path, serde_json::to_string_pretty(value)?)
    }

    /// Recursively copies a directory tree, chowning everything created.
    pub(crate) fn copy_dir_all(&self, from: &Path, to: &Path) -> Result<()> {
        self.create_dir_all(to)?;
        for entry in walkdir::WalkDir::new(from).min_depth(1) {
            let entry = entry?;
            let rel = entry.path().strip_prefix(from)?;
            let dest = to.join(rel);
            if entry.file_type().is_dir() {
                self.create_dir_all(&dest)?;
            } else if entry.file_type().is_symlink() {
                let target = fs::read_link(entry.path())?;
                std::os::unix::fs::symlink(target, &dest)?;
            } else {
                fs::copy(entry.path(), &dest)?;
                self.apply_owner(&dest)?;
            }
        }
        Ok(())
    }

    fn apply_owner(&self, path: &Path) -> Result<()> {
        let Some(owner) = self.owner else {
            return Ok(());
        };
        chown(path, owner.uid, owner.gid)
    }
}

/// Changes ownership of a single path.
fn chown(path: &Path, uid: u32, gid: u32) -> Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| eyre!("path contains NUL: {}", path.display()))?;
    // SAFETY: c_path is a valid NUL-terminated string for the duration of
    // the call.
    let rc = unsafe { libc::lchown(c_path.as_ptr(), uid, gid) };
    if rc != 0 {
        return Err(eyre!(
            "chown({}, {uid}, {gid}) failed: {}",
            path.display(),
            std::io::Error::last_os_error()
        ));
    }
    Ok(())
}
