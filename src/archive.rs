//! Archive extraction with path-traversal and size-bomb protection.
//!
//! Every entry path is sanitized before anything is written: absolute paths,
//! drive prefixes and `..` components reject the whole archive, and the
//! joined output path must still start with the extraction root. Sizes are
//! checked against the declared entry size and again while bytes are copied,
//! so lying headers cannot slip past the ceilings.

use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use tar::Archive;
use tracing::{debug, warn};
use zip::ZipArchive;

use crate::error::PluginError;

/// Size ceilings applied during extraction. `None` disables a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractionLimits {
    pub max_file_size: Option<u64>,
    pub max_total_size: Option<u64>,
}

impl ExtractionLimits {
    /// No size ceilings; path-traversal protection still applies
    pub fn unbounded() -> Self {
        Self {
            max_file_size: None,
            max_total_size: None,
        }
    }
}

/// Totals for a finished extraction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractionStats {
    pub files: usize,
    pub bytes: u64,
}

/// Normalize an archive entry name into a relative path with only normal
/// components
pub fn sanitize_entry_path(raw: &str) -> Result<PathBuf, PluginError> {
    let normalized = raw.replace('\\', "/");
    let mut cleaned = PathBuf::new();
    for component in Path::new(&normalized).components() {
        match component {
            Component::Prefix(_) | Component::RootDir | Component::ParentDir => {
                return Err(PluginError::Security(format!(
                    "archive entry escapes extraction root: {}",
                    raw
                )));
            }
            Component::CurDir => {}
            Component::Normal(part) => cleaned.push(part),
        }
    }
    if cleaned.as_os_str().is_empty() {
        return Err(PluginError::Validation(format!(
            "archive entry has an empty path: '{}'",
            raw
        )));
    }
    Ok(cleaned)
}

/// Resolve an entry name against `root`, guaranteeing the result stays inside it
pub fn resolve_entry_path(root: &Path, raw: &str) -> Result<PathBuf, PluginError> {
    let relative = sanitize_entry_path(raw)?;
    let resolved = root.join(relative);
    if !resolved.starts_with(root) {
        return Err(PluginError::Security(format!(
            "archive entry escapes extraction root: {}",
            raw
        )));
    }
    Ok(resolved)
}

/// Running byte count checked against the limits
struct Budget {
    limits: ExtractionLimits,
    stats: ExtractionStats,
}

impl Budget {
    fn new(limits: ExtractionLimits) -> Self {
        Self {
            limits,
            stats: ExtractionStats::default(),
        }
    }

    fn check_declared(&self, name: &str, size: u64) -> Result<(), PluginError> {
        if let Some(max) = self.limits.max_file_size {
            if size > max {
                return Err(file_too_large(name, size, max));
            }
        }
        if let Some(max) = self.limits.max_total_size {
            if self.stats.bytes.saturating_add(size) > max {
                return Err(total_too_large(max));
            }
        }
        Ok(())
    }

    /// Copy one entry into `out`, enforcing both ceilings on the real byte
    /// count
    fn copy_entry<R: Read>(
        &mut self,
        name: &str,
        reader: &mut R,
        out: &Path,
    ) -> Result<u64, PluginError> {
        let per_file = self.limits.max_file_size.unwrap_or(u64::MAX);
        let remaining_total = self
            .limits
            .max_total_size
            .map(|max| max.saturating_sub(self.stats.bytes))
            .unwrap_or(u64::MAX);
        let cap = per_file.min(remaining_total);

        let mut file = File::create(out).map_err(|e| PluginError::fs(out, e))?;
        let mut limited = reader.take(cap.saturating_add(1));
        let written = io::copy(&mut limited, &mut file).map_err(|e| {
            PluginError::Validation(format!("failed to extract '{}': {}", name, e))
        })?;
        file.flush().map_err(|e| PluginError::fs(out, e))?;

        if written > cap {
            drop(file);
            let _ = fs::remove_file(out);
            return Err(if written > per_file {
                file_too_large(name, written, per_file)
            } else {
                total_too_large(self.limits.max_total_size.unwrap_or(u64::MAX))
            });
        }

        self.stats.files += 1;
        self.stats.bytes += written;
        Ok(written)
    }
}

fn file_too_large(name: &str, size: u64, max: u64) -> PluginError {
    PluginError::Security(format!(
        "archive entry '{}' is too large ({} bytes, max {} bytes)",
        name, size, max
    ))
}

fn total_too_large(max: u64) -> PluginError {
    PluginError::Security(format!(
        "archive expands beyond the {} byte extraction limit",
        max
    ))
}

fn create_parent(out: &Path) -> Result<(), PluginError> {
    if let Some(parent) = out.parent() {
        fs::create_dir_all(parent).map_err(|e| PluginError::fs(parent, e))?;
    }
    Ok(())
}

const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;

#[cfg(unix)]
fn apply_mode(path: &Path, mode: Option<u32>) {
    use std::os::unix::fs::PermissionsExt;
    // Keep rwx bits only; setuid/setgid/sticky are never honoured
    if let Some(mode) = mode.map(|m| m & 0o777).filter(|m| m & 0o111 != 0) {
        if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(mode | 0o600)) {
            warn!(path = ?path, error = %e, "Failed to set permissions on extracted file");
        }
    }
}

#[cfg(not(unix))]
fn apply_mode(_path: &Path, _mode: Option<u32>) {}

/// Extract a zip archive into `dest`
pub fn extract_zip(
    archive_path: &Path,
    dest: &Path,
    limits: ExtractionLimits,
) -> Result<ExtractionStats, PluginError> {
    let file = File::open(archive_path).map_err(|e| PluginError::fs(archive_path, e))?;
    let mut archive = ZipArchive::new(file).map_err(|e| {
        PluginError::Validation(format!(
            "invalid zip archive {}: {}",
            archive_path.display(),
            e
        ))
    })?;
    let mut budget = Budget::new(limits);

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| PluginError::Validation(format!("unreadable zip entry #{}: {}", i, e)))?;
        let name = entry.name().to_string();
        let out = resolve_entry_path(dest, &name)?;

        if entry.is_dir() {
            fs::create_dir_all(&out).map_err(|e| PluginError::fs(&out, e))?;
            continue;
        }
        let mode = entry.unix_mode();
        if mode.is_some_and(|m| m & S_IFMT == S_IFLNK) {
            warn!(entry = %name, "Skipping symlink entry in zip archive");
            continue;
        }

        budget.check_declared(&name, entry.size())?;
        create_parent(&out)?;
        budget.copy_entry(&name, &mut entry, &out)?;
        apply_mode(&out, mode);
    }

    debug!(
        archive = ?archive_path,
        files = budget.stats.files,
        bytes = budget.stats.bytes,
        "Extracted zip archive"
    );
    Ok(budget.stats)
}

/// Extract a gzip-compressed tarball (npm `.tgz`) into `dest`
pub fn extract_tar_gz(
    archive_path: &Path,
    dest: &Path,
    limits: ExtractionLimits,
) -> Result<ExtractionStats, PluginError> {
    let file = File::open(archive_path).map_err(|e| PluginError::fs(archive_path, e))?;
    let mut archive = Archive::new(GzDecoder::new(file));
    let mut budget = Budget::new(limits);

    let entries = archive
        .entries()
        .map_err(|e| PluginError::Validation(format!("invalid tarball: {}", e)))?;
    for entry in entries {
        let mut entry =
            entry.map_err(|e| PluginError::Validation(format!("invalid tarball entry: {}", e)))?;
        let name = entry
            .path()
            .map_err(|e| PluginError::Validation(format!("invalid path in tarball: {}", e)))?
            .to_string_lossy()
            .to_string();
        let out = resolve_entry_path(dest, &name)?;
        let entry_type = entry.header().entry_type();

        if entry_type.is_dir() {
            fs::create_dir_all(&out).map_err(|e| PluginError::fs(&out, e))?;
            continue;
        }
        if !entry_type.is_file() {
            warn!(entry = %name, kind = ?entry_type, "Skipping non-regular tarball entry");
            continue;
        }

        let mode = entry.header().mode().ok();
        budget.check_declared(&name, entry.size())?;
        create_parent(&out)?;
        budget.copy_entry(&name, &mut entry, &out)?;
        apply_mode(&out, mode);
    }

    debug!(
        archive = ?archive_path,
        files = budget.stats.files,
        bytes = budget.stats.bytes,
        "Extracted tarball"
    );
    Ok(budget.stats)
}


#[cfg(test)]
mod tests {
    use super::test_support::{tgz_bytes, zip_bytes};
    use super::*;
    use tempfile::TempDir;

    fn limits(file: u64, total: u64) -> ExtractionLimits {
        ExtractionLimits {
            max_file_size: Some(file),
            max_total_size: Some(total),
        }
    }

    #[test]
    fn test_sanitize_rejects_traversal() {
        for raw in ["../../evil.sh", "/etc/passwd", "a/../../b", "..\\..\\evil.bat"] {
            assert!(
                matches!(sanitize_entry_path(raw), Err(PluginError::Security(_))),
                "{} should be rejected",
                raw
            );
        }
    }

    #[test]
    fn test_sanitize_normalizes() {
        assert_eq!(
            sanitize_entry_path("./plugin\\dist/index.js").unwrap(),
            PathBuf::from("plugin/dist/index.js")
        );
        assert!(sanitize_entry_path("./").is_err());
    }

    #[test]
    fn test_resolved_paths_stay_in_root() {
        let root = Path::new("/plugins/.temp-extract-1");
        let resolved = resolve_entry_path(root, "clock/manifest.json").unwrap();
        assert!(resolved.starts_with(root));
    }

    #[test]
    fn test_extract_zip_writes_files() {
        let dir = TempDir::new().unwrap();
        let zip = dir.path().join("p.zip");
        fs::write(
            &zip,
            zip_bytes(&[("clock/manifest.json", br#"{"name":"clock"}"#), ("clock/run.sh", b"#!/bin/sh\n")]),
        )
        .unwrap();

        let out = dir.path().join("out");
        let stats = extract_zip(&zip, &out, ExtractionLimits::unbounded()).unwrap();
        assert_eq!(stats.files, 2);
        assert!(out.join("clock/manifest.json").is_file());
    }

    #[cfg(unix)]
    #[test]
    fn test_extract_zip_keeps_executable_bit() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let zip = dir.path().join("p.zip");
        fs::write(&zip, zip_bytes(&[("run.sh", b"#!/bin/sh\n")])).unwrap();
        let out = dir.path().join("out");
        extract_zip(&zip, &out, ExtractionLimits::unbounded()).unwrap();
        let mode = fs::metadata(out.join("run.sh")).unwrap().permissions().mode();
        assert_ne!(mode & 0o111, 0);
    }

    #[test]
    fn test_extract_zip_rejects_zip_slip() {
        let dir = TempDir::new().unwrap();
        let zip = dir.path().join("evil.zip");
        fs::write(&zip, zip_bytes(&[("../../evil.sh", b"rm -rf /")])).unwrap();

        let out = dir.path().join("a/b/out");
        let err = extract_zip(&zip, &out, ExtractionLimits::unbounded()).unwrap_err();
        assert!(matches!(err, PluginError::Security(_)));
        assert!(!dir.path().join("evil.sh").exists());
        assert!(!dir.path().join("a/evil.sh").exists());
    }

    #[test]
    fn test_extract_zip_rejects_oversized_entry() {
        let dir = TempDir::new().unwrap();
        let zip = dir.path().join("big.zip");
        fs::write(&zip, zip_bytes(&[("big.bin", &[7u8; 4096])])).unwrap();

        let err = extract_zip(&zip, &dir.path().join("out"), limits(1024, 1 << 20)).unwrap_err();
        assert!(matches!(err, PluginError::Security(msg) if msg.contains("big.bin")));
    }

    #[test]
    fn test_extract_zip_rejects_cumulative_overflow() {
        let dir = TempDir::new().unwrap();
        let zip = dir.path().join("many.zip");
        fs::write(
            &zip,
            zip_bytes(&[("a.bin", &[1u8; 600]), ("b.bin", &[2u8; 600])]),
        )
        .unwrap();

        let err = extract_zip(&zip, &dir.path().join("out"), limits(1000, 1000)).unwrap_err();
        assert!(matches!(err, PluginError::Security(msg) if msg.contains("extraction limit")));
    }

    #[test]
    fn test_extract_zip_garbage_is_validation_error() {
        let dir = TempDir::new().unwrap();
        let zip = dir.path().join("junk.zip");
        fs::write(&zip, b"this is not a zip").unwrap();
        assert!(matches!(
            extract_zip(&zip, &dir.path().join("out"), ExtractionLimits::unbounded()),
            Err(PluginError::Validation(_))
        ));
    }

    #[test]
    fn test_extract_tar_gz_writes_package_root() {
        let dir = TempDir::new().unwrap();
        let tgz = dir.path().join("pkg.tgz");
        fs::write(
            &tgz,
            tgz_bytes(&[
                ("package/manifest.json", br#"{"name":"a"}"#),
                ("package/package.json", br#"{"name":"a"}"#),
            ]),
        )
        .unwrap();

        let out = dir.path().join("out");
        let stats = extract_tar_gz(&tgz, &out, ExtractionLimits::unbounded()).unwrap();
        assert_eq!(stats.files, 2);
        assert!(out.join("package/manifest.json").is_file());
    }

    #[test]
    fn test_extract_tar_gz_enforces_limits() {
        let dir = TempDir::new().unwrap();
        let tgz = dir.path().join("pkg.tgz");
        fs::write(&tgz, tgz_bytes(&[("package/blob", &[0u8; 2048])])).unwrap();
        let err = extract_tar_gz(&tgz, &dir.path().join("out"), limits(1024, 4096)).unwrap_err();
        assert!(matches!(err, PluginError::Security(_)));
    }
}
