//! Local strategy: install a zip the user picked from disk.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use super::{install_zip, wrong_config, DownloadConfig, DownloadOutcome, DownloadStrategy, SourceType};
use crate::archive::ExtractionLimits;
use crate::config::EngineConfig;
use crate::error::PluginError;
use crate::fs_util;

/// Host-provided file dialog. Returns `None` when the user cancels.
pub trait FilePicker: Send + Sync {
    fn pick_zip(&self) -> Option<PathBuf>;
}

/// Picker that always answers with the same path
pub struct FixedPicker(pub PathBuf);

impl FilePicker for FixedPicker {
    fn pick_zip(&self) -> Option<PathBuf> {
        Some(self.0.clone())
    }
}

pub struct LocalStrategy {
    picker: Option<Arc<dyn FilePicker>>,
    search_depth: usize,
}

impl LocalStrategy {
    pub fn new(config: &EngineConfig, picker: Option<Arc<dyn FilePicker>>) -> Self {
        Self {
            picker,
            search_depth: config.limits.manifest_search_depth,
        }
    }

    fn resolve_path(&self, configured: Option<&PathBuf>) -> Result<PathBuf, PluginError> {
        let path = match configured {
            Some(path) => path.clone(),
            None => self
                .picker
                .as_ref()
                .and_then(|picker| picker.pick_zip())
                .ok_or_else(|| PluginError::Validation("no plugin archive selected".to_string()))?,
        };
        let is_zip = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("zip"))
            .unwrap_or(false);
        if !is_zip {
            return Err(PluginError::Validation(format!(
                "{} is not a .zip archive",
                path.display()
            )));
        }
        if !path.is_file() {
            return Err(PluginError::Validation(format!(
                "{} does not exist",
                path.display()
            )));
        }
        Ok(path)
    }
}

#[async_trait]
impl DownloadStrategy for LocalStrategy {
    async fn execute(
        &self,
        config: &DownloadConfig,
        plugins_dir: &Path,
    ) -> Result<DownloadOutcome, PluginError> {
        let DownloadConfig::Local(local) = config else {
            return Err(wrong_config(SourceType::Local, config));
        };
        let zip_path = self.resolve_path(local.path.as_ref())?;
        info!(path = ?zip_path, "Installing plugin from local archive");

        fs_util::ensure_dir(plugins_dir)?;
        let stem = zip_path
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string());
        // Locally trusted source: no size ceilings, traversal guard still applies.
        // The user's zip is never removed.
        install_zip(
            &zip_path,
            stem.as_deref(),
            plugins_dir,
            ExtractionLimits::unbounded(),
            self.search_depth,
        )
        .await
    }
}
