//! Plugin manifest (`manifest.json`) parsing, validation and discovery.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;
use tracing::debug;

use crate::error::PluginError;
use crate::fs_util::TEMP_EXTRACT_PREFIX;

pub const MANIFEST_FILE: &str = "manifest.json";

/// Directories that already hold a finalized install (`{13-digit millis}-name`)
static INSTALLED_DIR_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{13}-").expect("static pattern"));

/// Descriptor at the root of every plugin package
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PluginManifest {
    /// Unique key of the plugin
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Entry file path relative to the plugin root
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main: Option<String>,
    /// UI entry path relative to the plugin root
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renderer: Option<String>,
}

impl PluginManifest {
    /// Parse and validate manifest JSON
    pub fn from_json(content: &str) -> Result<Self, PluginError> {
        let manifest: Self = serde_json::from_str(content)
            .map_err(|e| PluginError::Validation(format!("invalid manifest.json: {}", e)))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Load and validate `{dir}/manifest.json`
    pub fn load(dir: &Path) -> Result<Self, PluginError> {
        Self::load_file(&dir.join(MANIFEST_FILE))
    }

    pub fn load_file(path: &Path) -> Result<Self, PluginError> {
        let content = fs::read_to_string(path).map_err(|e| {
            PluginError::Validation(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&content)
    }

    pub fn validate(&self) -> Result<(), PluginError> {
        validate_name(&self.name)?;
        if let Some(main) = &self.main {
            validate_relative("main", main)?;
        }
        if let Some(renderer) = &self.renderer {
            validate_relative("renderer", renderer)?;
        }
        Ok(())
    }

    /// Absolute path of the entry module inside `dir`
    pub fn entry_path(&self, dir: &Path) -> Option<PathBuf> {
        self.main.as_ref().map(|main| dir.join(main))
    }

    pub fn version_or_default(&self) -> &str {
        self.version.as_deref().unwrap_or("0.0.0")
    }
}

/// The name becomes part of a directory name, so it must be a single plain
/// path segment.
fn validate_name(name: &str) -> Result<(), PluginError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(PluginError::Validation(
            "manifest is missing required field 'name'".to_string(),
        ));
    }
    if trimmed != name {
        return Err(PluginError::Validation(format!(
            "plugin name '{}' has surrounding whitespace",
            name
        )));
    }
    if name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(PluginError::Validation(format!(
            "plugin name '{}' is not a valid directory name",
            name
        )));
    }
    if name.chars().any(|c| c.is_control()) {
        return Err(PluginError::Validation(
            "plugin name contains control characters".to_string(),
        ));
    }
    Ok(())
}

fn validate_relative(field: &str, value: &str) -> Result<(), PluginError> {
    let path = Path::new(value);
    let escapes = path.components().any(|c| {
        matches!(
            c,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    });
    if value.is_empty() || escapes {
        return Err(PluginError::Validation(format!(
            "manifest field '{}' must be a path inside the plugin: '{}'",
            field, value
        )));
    }
    Ok(())
}

/// Whether a directory name belongs to a finalized install or an in-flight
/// extraction, which the manifest search must not descend into
pub fn is_skipped_dir(name: &str) -> bool {
    INSTALLED_DIR_PATTERN.is_match(name)
        || name.starts_with(TEMP_EXTRACT_PREFIX)
        || name == "__MACOSX"
}

/// Locate `manifest.json` under `root`.
///
/// `expected` (usually the archive name without extension) is tried first.
/// Otherwise the tree is searched depth-first up to `max_depth` levels below
/// `root`, in name order, stopping at the first match.
pub fn find_manifest(root: &Path, expected: Option<&str>, max_depth: usize) -> Option<PathBuf> {
    if let Some(expected) = expected {
        let candidate = root.join(expected).join(MANIFEST_FILE);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    let found = search(root, 0, max_depth);
    debug!(root = ?root, found = ?found, "Manifest search finished");
    found
}

fn search(dir: &Path, depth: usize, max_depth: usize) -> Option<PathBuf> {
    let candidate = dir.join(MANIFEST_FILE);
    if candidate.is_file() {
        return Some(candidate);
    }
    if depth >= max_depth {
        return None;
    }

    let mut children: Vec<(String, PathBuf)> = fs::read_dir(dir)
        .ok()?
        .flatten()
        .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .map(|entry| (entry.file_name().to_string_lossy().to_string(), entry.path()))
        .filter(|(name, _)| !is_skipped_dir(name))
        .collect();
    children.sort();

    children
        .into_iter()
        .find_map(|(_, path)| search(&path, depth + 1, max_depth))
}
