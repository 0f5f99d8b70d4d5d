//! Configuration loader for the plugin engine.
//!
//! Loads configuration from:
//! 1. Default values
//! 2. `.plugin-engine/config.yaml` in the working directory
//! 3. `~/.plugin-engine/config.yaml` in the home directory
//! 4. Environment variables with `PLUGIN_ENGINE_` prefix, sections separated by `__`

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::archive::ExtractionLimits;
use crate::retry::RetryPolicy;

const MIB: u64 = 1024 * 1024;

/// Main configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    /// Root directory holding `{millis}-{name}` plugin installs
    #[serde(default = "default_plugins_dir")]
    pub plugins_dir: PathBuf,
    /// SQLite database holding one metadata record per plugin
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub download: DownloadSettings,
    #[serde(default)]
    pub npm: NpmSettings,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub uninstall: UninstallConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            plugins_dir: default_plugins_dir(),
            database_path: default_database_path(),
            limits: LimitsConfig::default(),
            download: DownloadSettings::default(),
            npm: NpmSettings::default(),
            lifecycle: LifecycleConfig::default(),
            uninstall: UninstallConfig::default(),
        }
    }
}

fn base_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".plugin-engine")
}

fn default_plugins_dir() -> PathBuf {
    base_dir().join("plugins")
}

fn default_database_path() -> PathBuf {
    base_dir().join("plugins.db")
}

/// Extraction ceilings for untrusted archives
#[derive(Debug, Deserialize, Clone)]
pub struct LimitsConfig {
    /// Largest single archive entry (and largest downloaded archive), in bytes
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    /// Largest cumulative extraction, in bytes
    #[serde(default = "default_max_total_size")]
    pub max_total_size: u64,
    /// How deep to look for `manifest.json` when it is not where expected
    #[serde(default = "default_manifest_search_depth")]
    pub manifest_search_depth: usize,
}

fn default_max_file_size() -> u64 {
    500 * MIB
}

fn default_max_total_size() -> u64 {
    1024 * MIB
}

fn default_manifest_search_depth() -> usize {
    3
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_file_size: default_max_file_size(),
            max_total_size: default_max_total_size(),
            manifest_search_depth: default_manifest_search_depth(),
        }
    }
}

impl LimitsConfig {
    pub fn extraction_limits(&self) -> ExtractionLimits {
        ExtractionLimits {
            max_file_size: Some(self.max_file_size),
            max_total_size: Some(self.max_total_size),
        }
    }
}

/// CDN download behaviour
#[derive(Debug, Deserialize, Clone)]
pub struct DownloadSettings {
    /// Hard timeout for one download attempt
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl DownloadSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

/// npm registry access
#[derive(Debug, Deserialize, Clone)]
pub struct NpmSettings {
    #[serde(default = "default_registry_url")]
    pub registry_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Maximum nesting of `node_modules` installs below the primary package
    #[serde(default = "default_max_dependency_depth")]
    pub max_dependency_depth: usize,
    /// Check `dist.integrity` when the registry provides it
    #[serde(default = "default_verify_integrity")]
    pub verify_integrity: bool,
}

fn default_registry_url() -> String {
    "https://registry.npmjs.org".to_string()
}

fn default_max_dependency_depth() -> usize {
    8
}

fn default_verify_integrity() -> bool {
    true
}

impl Default for NpmSettings {
    fn default() -> Self {
        Self {
            registry_url: default_registry_url(),
            timeout_secs: default_timeout_secs(),
            max_dependency_depth: default_max_dependency_depth(),
            verify_integrity: default_verify_integrity(),
        }
    }
}

impl NpmSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Lifecycle hook execution
#[derive(Debug, Deserialize, Clone)]
pub struct LifecycleConfig {
    #[serde(default = "default_hook_timeout_secs")]
    pub hook_timeout_secs: u64,
}

fn default_hook_timeout_secs() -> u64 {
    30
}

impl LifecycleConfig {
    pub fn hook_timeout(&self) -> Duration {
        Duration::from_secs(self.hook_timeout_secs)
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            hook_timeout_secs: default_hook_timeout_secs(),
        }
    }
}

/// Directory removal on uninstall
#[derive(Debug, Deserialize, Clone)]
pub struct UninstallConfig {
    #[serde(default = "default_remove_attempts")]
    pub remove_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_remove_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    200
}

impl UninstallConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl Default for UninstallConfig {
    fn default() -> Self {
        Self {
            remove_attempts: default_remove_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

/// Load configuration from all sources
pub fn load_config() -> Result<EngineConfig, ConfigError> {
    let mut files = vec![PathBuf::from(".plugin-engine/config.yaml")];
    if let Some(home) = dirs::home_dir() {
        files.push(home.join(".plugin-engine/config.yaml"));
    }
    load_config_from(&files)
}

/// Load configuration layering the given YAML files (missing files are
/// skipped) under environment overrides
pub fn load_config_from(files: &[PathBuf]) -> Result<EngineConfig, ConfigError> {
    let mut builder = Config::builder();

    builder = builder
        .set_default("plugins_dir", path_string(&default_plugins_dir()))?
        .set_default("database_path", path_string(&default_database_path()))?;

    for file in files {
        if file.exists() {
            builder = builder.add_source(File::from(file.clone()).required(false));
        }
    }

    // e.g. PLUGIN_ENGINE_PLUGINS_DIR=/srv/plugins, PLUGIN_ENGINE_LIMITS__MAX_FILE_SIZE=1048576
    builder = builder.add_source(
        Environment::with_prefix("PLUGIN_ENGINE")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().to_string()
}
