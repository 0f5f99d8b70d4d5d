//! Download strategies: one way of acquiring a plugin package per source type.
//!
//! Every strategy turns a source-specific config into a finalized
//! `{plugins_dir}/{millis}-{name}` directory plus its validated manifest.
//! Work happens in strategy-owned temp locations that are removed on both
//! success and failure, so a failed download never leaves anything in the
//! plugins root.

pub mod cdn;
pub mod local;
pub mod npm;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::archive::{self, ExtractionLimits};
use crate::config::EngineConfig;
use crate::error::PluginError;
use crate::fs_util;
use crate::manifest::{self, PluginManifest};
use crate::retry::{classify_status, AttemptError};

pub use cdn::CdnStrategy;
pub use local::{FilePicker, FixedPicker, LocalStrategy};
pub use npm::NpmStrategy;

/// Where a plugin package comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceType {
    #[serde(rename = "CDN")]
    Cdn,
    #[serde(rename = "LOCAL")]
    Local,
    #[serde(rename = "NPM")]
    Npm,
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cdn => write!(f, "CDN"),
            Self::Local => write!(f, "LOCAL"),
            Self::Npm => write!(f, "NPM"),
        }
    }
}

impl std::str::FromStr for SourceType {
    type Err = PluginError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "CDN" => Ok(Self::Cdn),
            "LOCAL" => Ok(Self::Local),
            "NPM" => Ok(Self::Npm),
            _ => Err(PluginError::UnknownSource(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CdnConfig {
    /// `http(s)://...` URL of a `.zip` package
    pub url: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LocalConfig {
    /// Zip to install; when absent the file picker is asked
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

/// Private registry credentials
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PrivateRegistry {
    #[serde(rename = "privateURL")]
    pub private_url: String,
    #[serde(default, rename = "authToken", skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NpmConfig {
    pub name: String,
    /// Exact version or dist-tag; `latest` when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<PrivateRegistry>,
}

/// Source-specific download request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum DownloadConfig {
    #[serde(rename = "CDN")]
    Cdn(CdnConfig),
    #[serde(rename = "LOCAL")]
    Local(LocalConfig),
    #[serde(rename = "NPM")]
    Npm(NpmConfig),
}

impl DownloadConfig {
    pub fn source_type(&self) -> SourceType {
        match self {
            Self::Cdn(_) => SourceType::Cdn,
            Self::Local(_) => SourceType::Local,
            Self::Npm(_) => SourceType::Npm,
        }
    }
}

/// A finalized install produced by a strategy
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadOutcome {
    /// `{plugins_dir}/{millis}-{name}`
    pub path_dirname: PathBuf,
    pub metadata: PluginManifest,
}

/// One pluggable algorithm for acquiring a plugin package
#[async_trait]
pub trait DownloadStrategy: Send + Sync {
    /// Acquire the package described by `config` and finalize it under
    /// `plugins_dir`
    async fn execute(
        &self,
        config: &DownloadConfig,
        plugins_dir: &Path,
    ) -> Result<DownloadOutcome, PluginError>;
}

/// A selected strategy behind one call shape
#[derive(Clone)]
pub struct DownloadContext {
    source: SourceType,
    strategy: Arc<dyn DownloadStrategy>,
}

impl DownloadContext {
    pub fn source(&self) -> SourceType {
        self.source
    }

    pub async fn execute(
        &self,
        config: &DownloadConfig,
        plugins_dir: &Path,
    ) -> Result<DownloadOutcome, PluginError> {
        debug!(source = %self.source, dir = ?plugins_dir, "Executing download strategy");
        self.strategy.execute(config, plugins_dir).await
    }
}

/// Maps source types to strategies
#[derive(Clone, Default)]
pub struct StrategyFactory {
    strategies: HashMap<SourceType, Arc<dyn DownloadStrategy>>,
}

impl StrategyFactory {
    /// Factory without any strategies
    pub fn empty() -> Self {
        Self::default()
    }

    /// Factory with the CDN, local and npm strategies configured from `config`
    pub fn from_config(config: &EngineConfig, picker: Option<Arc<dyn FilePicker>>) -> Self {
        let mut factory = Self::empty();
        factory.register(SourceType::Cdn, Arc::new(CdnStrategy::new(config)));
        factory.register(SourceType::Local, Arc::new(LocalStrategy::new(config, picker)));
        factory.register(SourceType::Npm, Arc::new(NpmStrategy::new(config)));
        factory
    }

    /// Add or replace the strategy for a source type
    pub fn register(&mut self, source: SourceType, strategy: Arc<dyn DownloadStrategy>) {
        self.strategies.insert(source, strategy);
    }

    pub fn context(&self, source: SourceType) -> Result<DownloadContext, PluginError> {
        self.strategies
            .get(&source)
            .map(|strategy| DownloadContext {
                source,
                strategy: Arc::clone(strategy),
            })
            .ok_or_else(|| PluginError::UnknownSource(source.to_string()))
    }

    /// Resolve a source type by name, e.g. from host input
    pub fn context_for(&self, source: &str) -> Result<DownloadContext, PluginError> {
        self.context(source.parse()?)
    }
}

pub(crate) fn wrong_config(expected: SourceType, config: &DownloadConfig) -> PluginError {
    PluginError::Validation(format!(
        "{} strategy cannot handle a {} config",
        expected,
        config.source_type()
    ))
}

/// Write a response body to `dest`, enforcing `max` bytes on both the
/// advertised length and the bytes actually received
pub(crate) async fn stream_to_file(
    response: reqwest::Response,
    dest: &Path,
    max: Option<u64>,
) -> Result<u64, AttemptError> {
    let status = response.status();
    if !status.is_success() {
        return Err(AttemptError::new(
            classify_status(status),
            PluginError::Network(format!("GET {} returned {}", response.url(), status)),
        ));
    }
    if let (Some(max), Some(len)) = (max, response.content_length()) {
        if len > max {
            return Err(AttemptError::fatal(PluginError::Security(format!(
                "archive is too large ({} bytes, max {} bytes)",
                len, max
            ))));
        }
    }

    let mut file = tokio::fs::File::create(dest)
        .await
        .map_err(|e| AttemptError::fatal(PluginError::fs(dest, e)))?;
    let mut stream = response.bytes_stream();
    let mut received: u64 = 0;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        received += chunk.len() as u64;
        if let Some(max) = max {
            if received > max {
                return Err(AttemptError::fatal(PluginError::Security(format!(
                    "archive exceeded {} bytes while downloading",
                    max
                ))));
            }
        }
        file.write_all(&chunk)
            .await
            .map_err(|e| AttemptError::fatal(PluginError::fs(dest, e)))?;
    }
    file.flush()
        .await
        .map_err(|e| AttemptError::fatal(PluginError::fs(dest, e)))?;
    Ok(received)
}

/// Run blocking extraction off the async runtime
pub(crate) async fn blocking<T, F>(what: &'static str, f: F) -> Result<T, PluginError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, PluginError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| PluginError::FileSystem {
            path: PathBuf::from(what),
            message: format!("background task failed: {}", e),
        })?
}

/// Shared zip pipeline for the CDN and local strategies: extract into a fresh
/// temp dir, locate and validate the manifest, then rename the plugin subtree
/// into `{plugins_dir}/{millis}-{name}`. `expected` is the directory the
/// manifest should normally sit in (the zip name without extension). The temp
/// dir is always removed; the zip itself is left to the caller.
pub(crate) async fn install_zip(
    zip_path: &Path,
    expected: Option<&str>,
    plugins_dir: &Path,
    limits: ExtractionLimits,
    search_depth: usize,
) -> Result<DownloadOutcome, PluginError> {
    let temp = fs_util::create_temp_extract_dir(plugins_dir)?;
    let result = finalize_zip(zip_path, expected, &temp, plugins_dir, limits, search_depth).await;
    fs_util::remove_best_effort(&temp);
    result
}

async fn finalize_zip(
    zip_path: &Path,
    expected: Option<&str>,
    temp: &Path,
    plugins_dir: &Path,
    limits: ExtractionLimits,
    search_depth: usize,
) -> Result<DownloadOutcome, PluginError> {
    let (zip, dest) = (zip_path.to_path_buf(), temp.to_path_buf());
    let stats = blocking("zip extraction", move || archive::extract_zip(&zip, &dest, limits)).await?;

    let manifest_path = manifest::find_manifest(temp, expected, search_depth)
        .ok_or_else(|| {
            PluginError::Validation(format!(
                "manifest.json not found in {}",
                zip_path.display()
            ))
        })?;
    let metadata = PluginManifest::load_file(&manifest_path)?;
    let plugin_root = manifest_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| temp.to_path_buf());

    let path_dirname = fs_util::finalize_install(&plugin_root, plugins_dir, &metadata.name)?;

    info!(
        plugin = %metadata.name,
        version = ?metadata.version,
        files = stats.files,
        bytes = stats.bytes,
        dir = ?path_dirname,
        "Plugin package extracted"
    );
    Ok(DownloadOutcome {
        path_dirname,
        metadata,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::test_support::zip_bytes;
    use std::fs;
    use tempfile::TempDir;

    fn dir_entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_source_type_parsing() {
        assert_eq!("cdn".parse::<SourceType>().unwrap(), SourceType::Cdn);
        assert_eq!("NPM".parse::<SourceType>().unwrap(), SourceType::Npm);
        assert!(matches!(
            "git".parse::<SourceType>(),
            Err(PluginError::UnknownSource(_))
        ));
    }

    #[test]
    fn test_download_config_tagged_json() {
        let config: DownloadConfig = serde_json::from_value(serde_json::json!({
            "type": "NPM",
            "name": "@acme/clock",
            "registry": { "privateURL": "https://npm.acme.dev", "authToken": "t0k" }
        }))
        .unwrap();
        match &config {
            DownloadConfig::Npm(npm) => {
                assert_eq!(npm.name, "@acme/clock");
                assert!(npm.version.is_none());
                assert_eq!(npm.registry.as_ref().unwrap().auth_token.as_deref(), Some("t0k"));
            }
            other => panic!("unexpected config {:?}", other),
        }
        assert_eq!(config.source_type(), SourceType::Npm);

        let cdn: DownloadConfig =
            serde_json::from_str(r#"{"type":"CDN","url":"https://x.com/p.zip"}"#).unwrap();
        assert_eq!(cdn.source_type(), SourceType::Cdn);
    }

    #[test]
    fn test_factory_unknown_type_fails_without_io() {
        let factory = StrategyFactory::empty();
        assert!(matches!(
            factory.context(SourceType::Cdn),
            Err(PluginError::UnknownSource(_))
        ));
        assert!(matches!(
            StrategyFactory::from_config(&EngineConfig::default(), None).context_for("ftp"),
            Err(PluginError::UnknownSource(_))
        ));
    }

    #[test]
    fn test_factory_selects_registered_strategy() {
        let factory = StrategyFactory::from_config(&EngineConfig::default(), None);
        assert_eq!(factory.context(SourceType::Local).unwrap().source(), SourceType::Local);
        assert_eq!(factory.context_for("npm").unwrap().source(), SourceType::Npm);
    }

    #[tokio::test]
    async fn test_install_zip_finalizes_and_cleans_up() {
        let root = TempDir::new().unwrap();
        let zip = root.path().join("clock.zip");
        fs::write(
            &zip,
            zip_bytes(&[("clock/manifest.json", br#"{"name":"clock","version":"1.0.0"}"#)]),
        )
        .unwrap();
        let plugins = root.path().join("plugins");
        fs::create_dir_all(&plugins).unwrap();

        let outcome = install_zip(&zip, Some("clock"), &plugins, ExtractionLimits::unbounded(), 3)
            .await
            .unwrap();
        assert_eq!(outcome.metadata.name, "clock");
        assert!(outcome.path_dirname.join("manifest.json").is_file());

        let entries = dir_entries(&plugins);
        assert_eq!(entries.len(), 1);
        assert!(entries[0].ends_with("-clock"));
    }

    #[tokio::test]
    async fn test_install_zip_without_manifest_leaves_nothing() {
        let root = TempDir::new().unwrap();
        let zip = root.path().join("empty.zip");
        fs::write(&zip, zip_bytes(&[("readme.txt", b"hello")])).unwrap();
        let plugins = root.path().join("plugins");
        fs::create_dir_all(&plugins).unwrap();

        let err = install_zip(&zip, Some("clock"), &plugins, ExtractionLimits::unbounded(), 3)
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::Validation(_)));
        assert!(dir_entries(&plugins).is_empty());
    }

    #[tokio::test]
    async fn test_install_zip_flat_archive_uses_whole_root() {
        let root = TempDir::new().unwrap();
        let zip = root.path().join("flat.zip");
        fs::write(
            &zip,
            zip_bytes(&[("manifest.json", br#"{"name":"flat"}"#), ("index.js", b"")]),
        )
        .unwrap();
        let plugins = root.path().join("plugins");
        fs::create_dir_all(&plugins).unwrap();

        let outcome = install_zip(&zip, Some("clock"), &plugins, ExtractionLimits::unbounded(), 3)
            .await
            .unwrap();
        assert!(outcome.path_dirname.join("index.js").is_file());
        assert_eq!(dir_entries(&plugins).len(), 1);
    }
}
