//! Filesystem helpers for the on-disk plugin layout.
//!
//! Layout under the plugins root:
//! - `{millis}-{name}/` finalized installs
//! - `.temp-extract-{millis}/` in-flight extraction, always removed by operation end

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::PluginError;

pub const TEMP_EXTRACT_PREFIX: &str = ".temp-extract-";
pub const BACKUP_SUFFIX: &str = "-backup";

/// Unix time in milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Create `dir` and its parents
pub fn ensure_dir(dir: &Path) -> Result<(), PluginError> {
    fs::create_dir_all(dir).map_err(|e| PluginError::fs(dir, e))
}

/// Pick a free `{root}/{millis}-{name}` path. Collisions within the same
/// millisecond move the timestamp forward.
pub fn install_dir_for(root: &Path, name: &str) -> PathBuf {
    let mut stamp = now_millis();
    loop {
        let candidate = root.join(format!("{}-{}", stamp, name));
        if !candidate.exists() {
            return candidate;
        }
        stamp += 1;
    }
}

/// Move `src` to a fresh `{root}/{millis}-{name}`. A candidate taken by a
/// concurrent install is skipped.
pub fn finalize_install(src: &Path, root: &Path, name: &str) -> Result<PathBuf, PluginError> {
    const ATTEMPTS: usize = 16;
    let mut attempt = 1;
    loop {
        let candidate = install_dir_for(root, name);
        match rename_into_place(src, &candidate) {
            Ok(()) => return Ok(candidate),
            Err(_) if attempt < ATTEMPTS && candidate.exists() && src.exists() => {
                debug!(dir = ?candidate, "Install directory taken, picking another");
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Create a fresh `.temp-extract-{millis}` directory under `root`
pub fn create_temp_extract_dir(root: &Path) -> Result<PathBuf, PluginError> {
    let mut stamp = now_millis();
    loop {
        let candidate = root.join(format!("{}{}", TEMP_EXTRACT_PREFIX, stamp));
        match fs::create_dir(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => stamp += 1,
            Err(e) => return Err(PluginError::fs(&candidate, e)),
        }
    }
}

/// Sibling path used to hold the previous install during an update
pub fn backup_path(dir: &Path) -> PathBuf {
    let mut name = dir
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(BACKUP_SUFFIX);
    dir.with_file_name(name)
}

/// Move `src` to `dst`. Falls back to copy + remove when a plain rename is
/// not possible (e.g. across filesystems).
pub fn rename_into_place(src: &Path, dst: &Path) -> Result<(), PluginError> {
    if dst.exists() {
        return Err(PluginError::FileSystem {
            path: dst.to_path_buf(),
            message: "destination already exists".to_string(),
        });
    }
    if let Some(parent) = dst.parent() {
        ensure_dir(parent)?;
    }
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        // Claimed by someone else between the check and the rename
        Err(_) if dst.exists() => Err(PluginError::FileSystem {
            path: dst.to_path_buf(),
            message: "destination already exists".to_string(),
        }),
        Err(rename_err) => {
            debug!(src = ?src, dst = ?dst, error = %rename_err, "Rename failed, copying instead");
            if let Err(e) = copy_dir_recursive(src, dst) {
                remove_best_effort(dst);
                return Err(PluginError::fs(dst, e));
            }
            remove_best_effort(src);
            Ok(())
        }
    }
}

/// Recursively copy a directory
pub fn copy_dir_recursive(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&src_path, &dst_path)?;
        } else {
            fs::copy(&src_path, &dst_path)?;
        }
    }
    Ok(())
}

/// Remove a file or directory tree, logging instead of failing
pub fn remove_best_effort(path: &Path) {
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return,
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => debug!(path = ?path, "Removed"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = ?path, error = %e, "Cleanup failed"),
    }
}

/// Remove a directory tree, retrying transient failures
pub async fn remove_dir_with_retry(
    dir: &Path,
    attempts: u32,
    delay: Duration,
) -> Result<(), PluginError> {
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) if attempt < attempts => {
                warn!(path = ?dir, attempt, error = %e, "Directory removal failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(PluginError::fs(dir, e)),
        }
    }
}
