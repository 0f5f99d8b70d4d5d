//! Plugin manager: install, update, activate, deactivate, uninstall and load.
//!
//! The manager owns the in-memory registry of loaded modules and the active
//! set. The metadata store is the durable source of truth; the registry is
//! rebuilt from it by [`PluginManager::load_plugins`]. Mutating operations
//! for one plugin name are serialised by a per-name lock.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{EngineConfig, UninstallConfig};
use crate::error::PluginError;
use crate::events::StatusReporter;
use crate::fs_util;
use crate::loader::{CommandLoader, PluginLoader, PluginModule};
use crate::manifest::PluginManifest;
use crate::store::{PluginMetadataRecord, PluginMetadataStore};
use crate::strategy::{
    DownloadConfig, DownloadOutcome, FilePicker, SourceType, StrategyFactory,
};

/// A download as requested by the host
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRequest {
    pub config: DownloadConfig,
    /// Remote installation id to correlate a multi-step install
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installation_id: Option<String>,
}

impl From<DownloadConfig> for DownloadRequest {
    fn from(config: DownloadConfig) -> Self {
        Self {
            config,
            installation_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum InstallAction {
    Installed,
    Updated,
    /// Same version was already installed
    Unchanged,
}

impl std::fmt::Display for InstallAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Installed => write!(f, "installed"),
            Self::Updated => write!(f, "updated"),
            Self::Unchanged => write!(f, "unchanged"),
        }
    }
}

/// Result of a completed download
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadReport {
    pub name: String,
    pub version: Option<String>,
    pub pathname: PathBuf,
    pub action: InstallAction,
    pub installation_id: String,
}

/// Downloaded but not yet activated
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingInstallation {
    pub name: String,
    pub installation_id: String,
    pub created_at: DateTime<Utc>,
}

/// Menu contribution of one active plugin
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PluginMenu {
    pub name: String,
    pub menu: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LoadSummary {
    pub loaded: Vec<String>,
    pub activated: Vec<String>,
    pub failed: Vec<String>,
}

pub struct PluginManager {
    plugins_dir: PathBuf,
    uninstall: UninstallConfig,
    factory: StrategyFactory,
    store: PluginMetadataStore,
    loader: Arc<dyn PluginLoader>,
    modules: RwLock<HashMap<String, Arc<dyn PluginModule>>>,
    active: RwLock<HashSet<String>>,
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
    pending: StdMutex<HashMap<String, PendingInstallation>>,
    reporter: StatusReporter,
}

impl PluginManager {
    pub fn new(
        config: &EngineConfig,
        factory: StrategyFactory,
        store: PluginMetadataStore,
        loader: Arc<dyn PluginLoader>,
    ) -> Self {
        Self {
            plugins_dir: config.plugins_dir.clone(),
            uninstall: config.uninstall.clone(),
            factory,
            store,
            loader,
            modules: RwLock::new(HashMap::new()),
            active: RwLock::new(HashSet::new()),
            locks: StdMutex::new(HashMap::new()),
            pending: StdMutex::new(HashMap::new()),
            reporter: StatusReporter::noop(),
        }
    }

    /// Manager with the built-in strategies, the SQLite store at
    /// `config.database_path` and the out-of-process loader
    pub fn from_config(
        config: &EngineConfig,
        picker: Option<Arc<dyn FilePicker>>,
    ) -> Result<Self, PluginError> {
        let store = PluginMetadataStore::open(&config.database_path)?;
        let factory = StrategyFactory::from_config(config, picker);
        let loader = Arc::new(CommandLoader::new(config.lifecycle.hook_timeout()));
        Ok(Self::new(config, factory, store, loader))
    }

    pub fn with_reporter(mut self, reporter: StatusReporter) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn plugins_dir(&self) -> &Path {
        &self.plugins_dir
    }

    fn lock_for(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        Arc::clone(locks.entry(name.to_string()).or_default())
    }

    /// Drop the lock entry for `name` unless another caller still holds it
    fn release_lock(&self, name: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        // One reference in the map, one in `lock`
        if Arc::strong_count(&lock) == 2 {
            locks.remove(name);
        }
    }

    /// Acquire, finalize and register a plugin. A name that is already
    /// installed goes through the update path, otherwise the plugin is
    /// installed and activated.
    pub async fn download_plugin(
        &self,
        request: DownloadRequest,
    ) -> Result<DownloadReport, PluginError> {
        let source = request.config.source_type();
        let context = self.factory.context(source)?;
        let installation_id = request
            .installation_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        self.reporter
            .in_progress("download", None, format!("Downloading from {}", source));
        let outcome = context.execute(&request.config, &self.plugins_dir).await?;
        let name = outcome.metadata.name.clone();
        info!(plugin = %name, source = %source, dir = ?outcome.path_dirname, "Plugin downloaded");

        self.track_pending(&installation_id, &name);
        let lock = self.lock_for(&name);
        let result = {
            let _guard = lock.lock().await;
            self.finish_download(outcome, source).await
        };
        self.discard_pending(&installation_id);

        let (pathname, action) = result?;
        Ok(DownloadReport {
            version: self.store.get(&name)?.and_then(|r| r.version),
            name,
            pathname,
            action,
            installation_id,
        })
    }

    /// Install or update under the name lock. Returns the directory the
    /// record points at.
    async fn finish_download(
        &self,
        outcome: DownloadOutcome,
        source: SourceType,
    ) -> Result<(PathBuf, InstallAction), PluginError> {
        let name = outcome.metadata.name.clone();
        let exists = match self.store.contains(&name) {
            Ok(exists) => exists,
            Err(e) => {
                fs_util::remove_best_effort(&outcome.path_dirname);
                return Err(e);
            }
        };

        if exists {
            self.reporter
                .in_progress("download", Some(&name), format!("Updating {}", name));
            return self.update_locked(outcome).await;
        }

        self.reporter
            .in_progress("download", Some(&name), format!("Installing {}", name));
        self.install_locked(&outcome.metadata, &outcome.path_dirname, Some(source))
            .await?;
        self.activate_locked(&name).await?;
        Ok((outcome.path_dirname, InstallAction::Installed))
    }

    /// Load the entry module from `dir`, register it and persist a new
    /// record. On failure `dir` is removed.
    pub async fn install_plugin(
        &self,
        manifest: &PluginManifest,
        dir: &Path,
    ) -> Result<(), PluginError> {
        let lock = self.lock_for(&manifest.name);
        let _guard = lock.lock().await;
        self.install_locked(manifest, dir, None).await
    }

    async fn install_locked(
        &self,
        manifest: &PluginManifest,
        dir: &Path,
        source: Option<SourceType>,
    ) -> Result<(), PluginError> {
        let result = async {
            let module = self.loader.load(dir, manifest).await?;
            self.store
                .upsert(&PluginMetadataRecord::new(manifest, dir, source))?;
            self.modules
                .write()
                .await
                .insert(manifest.name.clone(), module);
            Ok(())
        }
        .await;

        match &result {
            Ok(()) => info!(plugin = %manifest.name, dir = ?dir, "Plugin installed"),
            Err(e) => {
                warn!(plugin = %manifest.name, error = %e, "Install failed, removing directory");
                fs_util::remove_best_effort(dir);
            }
        }
        result
    }

    /// Swap an installed plugin for a freshly downloaded one
    pub async fn update_plugin(
        &self,
        outcome: DownloadOutcome,
    ) -> Result<InstallAction, PluginError> {
        let lock = self.lock_for(&outcome.metadata.name);
        let _guard = lock.lock().await;
        self.update_locked(outcome).await.map(|(_, action)| action)
    }

    async fn update_locked(
        &self,
        outcome: DownloadOutcome,
    ) -> Result<(PathBuf, InstallAction), PluginError> {
        let new = &outcome.metadata;
        let new_dir = &outcome.path_dirname;
        let Some(record) = self.store.get(&new.name)? else {
            fs_util::remove_best_effort(new_dir);
            return Err(PluginError::NotFound(new.name.clone()));
        };

        if record.version == new.version {
            info!(plugin = %new.name, version = ?new.version, "Version already installed");
            fs_util::remove_best_effort(new_dir);
            return Ok((record.pathname, InstallAction::Unchanged));
        }
        info!(
            plugin = %new.name,
            from = ?record.version,
            to = ?new.version,
            "Updating plugin"
        );

        let was_active = self.is_active(&new.name).await;
        if was_active {
            if let Err(e) = self.deactivate_locked(&new.name).await {
                fs_util::remove_best_effort(new_dir);
                return Err(e);
            }
        }

        let old_dir = record.pathname.clone();
        let backup = fs_util::backup_path(&old_dir);
        let had_old_dir = old_dir.exists();
        if had_old_dir {
            if let Err(e) = fs_util::rename_into_place(&old_dir, &backup) {
                fs_util::remove_best_effort(new_dir);
                self.restore_activation(&new.name, was_active).await;
                return Err(e);
            }
        }

        match self.swap_in(new, new_dir).await {
            Ok(()) => {
                if had_old_dir {
                    fs_util::remove_best_effort(&backup);
                }
                if was_active {
                    self.activate_locked(&new.name).await?;
                }
                Ok((new_dir.clone(), InstallAction::Updated))
            }
            Err(e) => {
                error!(plugin = %new.name, error = %e, "Update failed, restoring previous version");
                fs_util::remove_best_effort(new_dir);
                if had_old_dir {
                    if let Err(restore) = fs_util::rename_into_place(&backup, &old_dir) {
                        warn!(plugin = %new.name, error = %restore, "Could not restore backup");
                    }
                }
                match self.loader.load(&old_dir, &record.manifest()).await {
                    Ok(module) => {
                        self.modules.write().await.insert(new.name.clone(), module);
                    }
                    Err(reload) => {
                        warn!(plugin = %new.name, error = %reload, "Could not reload previous version")
                    }
                }
                self.restore_activation(&new.name, was_active).await;
                Err(e)
            }
        }
    }

    async fn swap_in(&self, manifest: &PluginManifest, dir: &Path) -> Result<(), PluginError> {
        let module = self.loader.load(dir, manifest).await?;
        if !self.store.update_install(manifest, dir)? {
            return Err(PluginError::NotFound(manifest.name.clone()));
        }
        self.modules
            .write()
            .await
            .insert(manifest.name.clone(), module);
        Ok(())
    }

    async fn restore_activation(&self, name: &str, was_active: bool) {
        if was_active {
            if let Err(e) = self.activate_locked(name).await {
                warn!(plugin = %name, error = %e, "Could not reactivate plugin");
            }
        }
    }

    /// Run `activate` then `initialize`. Unknown names are a no-op.
    pub async fn activate_plugin(&self, name: &str) -> Result<(), PluginError> {
        let lock = self.lock_for(name);
        let _guard = lock.lock().await;
        self.activate_locked(name).await
    }

    async fn activate_locked(&self, name: &str) -> Result<(), PluginError> {
        let Some(module) = self.module(name).await else {
            debug!(plugin = %name, "Activate ignored, plugin not loaded");
            return Ok(());
        };
        if self.is_active(name).await {
            debug!(plugin = %name, "Already active");
            return Ok(());
        }

        module.activate().await?;
        if let Err(e) = module.initialize().await {
            // Undo the activate hook, the plugin stays inactive
            if let Err(cleanup) = module.dispose().await {
                warn!(plugin = %name, error = %cleanup, "Dispose after failed initialize failed");
            }
            if let Err(cleanup) = module.deactivate().await {
                warn!(plugin = %name, error = %cleanup, "Deactivate after failed initialize failed");
            }
            return Err(e);
        }
        self.active.write().await.insert(name.to_string());
        self.store.set_active(name, true)?;
        info!(plugin = %name, "Plugin activated");
        Ok(())
    }

    /// Run `dispose` then `deactivate`. Unknown names are a no-op.
    pub async fn deactivate_plugin(&self, name: &str) -> Result<(), PluginError> {
        let lock = self.lock_for(name);
        let _guard = lock.lock().await;
        self.deactivate_locked(name).await
    }

    async fn deactivate_locked(&self, name: &str) -> Result<(), PluginError> {
        let Some(module) = self.module(name).await else {
            debug!(plugin = %name, "Deactivate ignored, plugin not loaded");
            return Ok(());
        };
        if self.is_active(name).await {
            module.dispose().await?;
            module.deactivate().await?;
            self.active.write().await.remove(name);
            info!(plugin = %name, "Plugin deactivated");
        }
        self.store.set_active(name, false)?;
        Ok(())
    }

    /// Deactivate, forget and delete a plugin. Unknown names are a no-op.
    pub async fn uninstall_plugin(&self, name: &str) -> Result<(), PluginError> {
        let lock = self.lock_for(name);
        let result = {
            let _guard = lock.lock().await;
            self.uninstall_locked(name).await
        };
        self.release_lock(name, lock);
        result
    }

    async fn uninstall_locked(&self, name: &str) -> Result<(), PluginError> {
        let record = self.store.get(name)?;
        let loaded = self.module(name).await.is_some();
        if record.is_none() && !loaded {
            debug!(plugin = %name, "Uninstall ignored, plugin not installed");
            return Ok(());
        }

        if let Err(e) = self.deactivate_locked(name).await {
            warn!(plugin = %name, error = %e, "Deactivation failed during uninstall");
            self.active.write().await.remove(name);
        }
        self.modules.write().await.remove(name);
        self.store.delete(name)?;

        if let Some(record) = record {
            if let Err(e) = fs_util::remove_dir_with_retry(
                &record.pathname,
                self.uninstall.remove_attempts,
                self.uninstall.retry_delay(),
            )
            .await
            {
                warn!(plugin = %name, error = %e, "Could not remove plugin directory");
            }
        }
        info!(plugin = %name, "Plugin uninstalled");
        Ok(())
    }

    /// Rebuild the registry from the store and reactivate plugins that were
    /// active. One broken plugin does not stop the others.
    pub async fn load_plugins(&self) -> Result<LoadSummary, PluginError> {
        let records = self.store.list()?;
        let results = join_all(records.iter().map(|record| self.load_record(record))).await;

        let mut summary = LoadSummary::default();
        for (record, result) in records.iter().zip(results) {
            match result {
                Ok(()) => summary.loaded.push(record.name.clone()),
                Err(e) => {
                    warn!(plugin = %record.name, error = %e, "Could not load plugin");
                    summary.failed.push(record.name.clone());
                }
            }
        }

        for record in records.iter().filter(|r| r.is_activate) {
            if !summary.loaded.contains(&record.name) {
                continue;
            }
            match self.activate_plugin(&record.name).await {
                Ok(()) => summary.activated.push(record.name.clone()),
                Err(e) => {
                    warn!(plugin = %record.name, error = %e, "Could not reactivate plugin");
                    summary.failed.push(record.name.clone());
                }
            }
        }
        info!(
            loaded = summary.loaded.len(),
            activated = summary.activated.len(),
            failed = summary.failed.len(),
            "Plugins loaded"
        );
        Ok(summary)
    }

    async fn load_record(&self, record: &PluginMetadataRecord) -> Result<(), PluginError> {
        let lock = self.lock_for(&record.name);
        let _guard = lock.lock().await;
        if self.module(&record.name).await.is_some() {
            return Ok(());
        }
        let module = self.loader.load(&record.pathname, &record.manifest()).await?;
        self.modules
            .write()
            .await
            .insert(record.name.clone(), module);
        Ok(())
    }

    /// Menu contributions of every active plugin that has one. Any error
    /// yields an empty list.
    pub async fn get_menu_plugins(&self) -> Vec<PluginMenu> {
        let mut active: Vec<String> = self.active.read().await.iter().cloned().collect();
        active.sort();

        let mut menus = Vec::new();
        for name in active {
            let Some(module) = self.module(&name).await else {
                continue;
            };
            match module.menu().await {
                Ok(Some(menu)) => menus.push(PluginMenu { name, menu }),
                Ok(None) => {}
                Err(e) => {
                    warn!(plugin = %name, error = %e, "Collecting menus failed");
                    return Vec::new();
                }
            }
        }
        menus
    }

    pub fn get_all(&self) -> Result<Vec<PluginMetadataRecord>, PluginError> {
        self.store.list()
    }

    pub fn get_one(&self, name: &str) -> Result<Option<PluginMetadataRecord>, PluginError> {
        self.store.get(name)
    }

    pub fn pending_installations(&self) -> Vec<PendingInstallation> {
        let pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
        let mut list: Vec<_> = pending.values().cloned().collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        list
    }

    pub async fn is_active(&self, name: &str) -> bool {
        self.active.read().await.contains(name)
    }

    pub async fn is_loaded(&self, name: &str) -> bool {
        self.modules.read().await.contains_key(name)
    }

    async fn module(&self, name: &str) -> Option<Arc<dyn PluginModule>> {
        self.modules.read().await.get(name).cloned()
    }

    fn track_pending(&self, installation_id: &str, name: &str) {
        let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
        pending.insert(
            installation_id.to_string(),
            PendingInstallation {
                name: name.to_string(),
                installation_id: installation_id.to_string(),
                created_at: Utc::now(),
            },
        );
    }

    fn discard_pending(&self, installation_id: &str) {
        let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
        pending.remove(installation_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::{DownloadStrategy, LocalConfig};
    use async_trait::async_trait;
    use std::fs;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    /// Strategy that materializes whatever manifest it was primed with
    struct FakeStrategy {
        manifest: StdMutex<PluginManifest>,
    }

    impl FakeStrategy {
        fn new(name: &str, version: &str) -> Arc<Self> {
            Arc::new(Self {
                manifest: StdMutex::new(manifest(name, version)),
            })
        }

        fn set_version(&self, version: &str) {
            self.manifest.lock().unwrap().version = Some(version.to_string());
        }
    }

    #[async_trait]
    impl DownloadStrategy for FakeStrategy {
        async fn execute(
            &self,
            _config: &DownloadConfig,
            plugins_dir: &Path,
        ) -> Result<DownloadOutcome, PluginError> {
            let manifest = self.manifest.lock().unwrap().clone();
            let dir = fs_util::install_dir_for(plugins_dir, &manifest.name);
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("manifest.json"), serde_json::to_string(&manifest).unwrap())
                .unwrap();
            Ok(DownloadOutcome {
                path_dirname: dir,
                metadata: manifest,
            })
        }
    }

    #[derive(Default)]
    struct RecordingModule {
        calls: StdMutex<Vec<String>>,
        fail_activate: bool,
        fail_initialize: bool,
    }

    impl RecordingModule {
        fn record(&self, hook: &str) {
            self.calls.lock().unwrap().push(hook.to_string());
        }
    }

    #[async_trait]
    impl PluginModule for RecordingModule {
        async fn activate(&self) -> Result<(), PluginError> {
            self.record("activate");
            if self.fail_activate {
                return Err(PluginError::lifecycle("p", "activate", "boom"));
            }
            Ok(())
        }
        async fn initialize(&self) -> Result<(), PluginError> {
            self.record("initialize");
            if self.fail_initialize {
                return Err(PluginError::lifecycle("p", "initialize", "boom"));
            }
            Ok(())
        }
        async fn dispose(&self) -> Result<(), PluginError> {
            self.record("dispose");
            Ok(())
        }
        async fn deactivate(&self) -> Result<(), PluginError> {
            self.record("deactivate");
            Ok(())
        }
        async fn menu(&self) -> Result<Option<serde_json::Value>, PluginError> {
            Ok(Some(serde_json::json!({"label": "menu"})))
        }
    }

    #[derive(Default)]
    struct RecordingLoader {
        modules: StdMutex<Vec<(PathBuf, Arc<RecordingModule>)>>,
        fail_version: StdMutex<Option<String>>,
        fail_activate: AtomicBool,
        fail_initialize: AtomicBool,
    }

    impl RecordingLoader {
        fn last(&self) -> Arc<RecordingModule> {
            Arc::clone(&self.modules.lock().unwrap().last().unwrap().1)
        }

        fn load_count(&self) -> usize {
            self.modules.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl PluginLoader for RecordingLoader {
        async fn load(
            &self,
            dir: &Path,
            manifest: &PluginManifest,
        ) -> Result<Arc<dyn PluginModule>, PluginError> {
            let fail_version = self.fail_version.lock().unwrap().clone();
            if fail_version.is_some() && fail_version == manifest.version {
                return Err(PluginError::lifecycle(&manifest.name, "load", "broken entry"));
            }
            let module = Arc::new(RecordingModule {
                calls: StdMutex::default(),
                fail_activate: self.fail_activate.load(Ordering::SeqCst),
                fail_initialize: self.fail_initialize.load(Ordering::SeqCst),
            });
            self.modules
                .lock()
                .unwrap()
                .push((dir.to_path_buf(), Arc::clone(&module)));
            Ok(module)
        }
    }

    fn manifest(name: &str, version: &str) -> PluginManifest {
        PluginManifest {
            name: name.to_string(),
            version: Some(version.to_string()),
            main: None,
            renderer: None,
        }
    }

    struct Harness {
        _root: TempDir,
        manager: PluginManager,
        strategy: Arc<FakeStrategy>,
        loader: Arc<RecordingLoader>,
    }

    fn harness() -> Harness {
        let root = TempDir::new().unwrap();
        let mut config = EngineConfig::default();
        config.plugins_dir = root.path().join("plugins");
        config.uninstall.retry_delay_ms = 1;

        let strategy = FakeStrategy::new("clock", "1.0.0");
        let mut factory = StrategyFactory::empty();
        factory.register(SourceType::Local, strategy.clone());
        let loader = Arc::new(RecordingLoader::default());
        let manager = PluginManager::new(
            &config,
            factory,
            PluginMetadataStore::open_in_memory().unwrap(),
            loader.clone(),
        );
        Harness {
            _root: root,
            manager,
            strategy,
            loader,
        }
    }

    fn local() -> DownloadRequest {
        DownloadConfig::Local(LocalConfig::default()).into()
    }

    fn dirs_in(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_download_installs_and_activates() {
        let h = harness();
        let report = h.manager.download_plugin(local()).await.unwrap();

        assert_eq!(report.action, InstallAction::Installed);
        assert_eq!(report.version.as_deref(), Some("1.0.0"));
        assert!(h.manager.is_active("clock").await);
        let record = h.manager.get_one("clock").unwrap().unwrap();
        assert!(record.is_activate);
        assert_eq!(record.source, Some(SourceType::Local));
        assert_eq!(*h.loader.last().calls.lock().unwrap(), vec!["activate", "initialize"]);
        assert!(h.manager.pending_installations().is_empty());
    }

    #[tokio::test]
    async fn test_installation_id_is_echoed() {
        let h = harness();
        let mut request = local();
        request.installation_id = Some("inst-42".into());
        let report = h.manager.download_plugin(request).await.unwrap();
        assert_eq!(report.installation_id, "inst-42");
    }

    #[tokio::test]
    async fn test_unknown_source_fails_without_io() {
        let h = harness();
        let request = DownloadConfig::Cdn(crate::strategy::CdnConfig {
            url: "https://x.com/a.zip".into(),
        })
        .into();
        let err = h.manager.download_plugin(request).await.unwrap_err();
        assert!(matches!(err, PluginError::UnknownSource(_)));
        assert!(!h.manager.plugins_dir().exists());
    }

    #[tokio::test]
    async fn test_same_version_is_idempotent() {
        let h = harness();
        h.manager.download_plugin(local()).await.unwrap();
        let report = h.manager.download_plugin(local()).await.unwrap();

        assert_eq!(report.action, InstallAction::Unchanged);
        assert_eq!(h.manager.get_all().unwrap().len(), 1);
        assert_eq!(dirs_in(h.manager.plugins_dir()).len(), 1);
    }

    #[tokio::test]
    async fn test_update_swaps_directory_and_keeps_activation() {
        let h = harness();
        let first = h.manager.download_plugin(local()).await.unwrap();
        let old_module = h.loader.last();

        h.strategy.set_version("2.0.0");
        let second = h.manager.download_plugin(local()).await.unwrap();

        assert_eq!(second.action, InstallAction::Updated);
        assert_eq!(second.version.as_deref(), Some("2.0.0"));
        assert!(!first.pathname.exists());
        assert_eq!(
            dirs_in(h.manager.plugins_dir()),
            vec![second.pathname.file_name().unwrap().to_string_lossy().to_string()]
        );
        let record = h.manager.get_one("clock").unwrap().unwrap();
        assert_eq!(record.pathname, second.pathname);
        assert!(record.is_activate);
        assert_eq!(
            *old_module.calls.lock().unwrap(),
            vec!["activate", "initialize", "dispose", "deactivate"]
        );
        assert_eq!(*h.loader.last().calls.lock().unwrap(), vec!["activate", "initialize"]);
    }

    #[tokio::test]
    async fn test_failed_update_restores_previous_version() {
        let h = harness();
        let first = h.manager.download_plugin(local()).await.unwrap();

        h.strategy.set_version("2.0.0");
        *h.loader.fail_version.lock().unwrap() = Some("2.0.0".into());
        let err = h.manager.download_plugin(local()).await.unwrap_err();
        assert_eq!(err.category(), "lifecycle");

        let record = h.manager.get_one("clock").unwrap().unwrap();
        assert_eq!(record.version.as_deref(), Some("1.0.0"));
        assert_eq!(record.pathname, first.pathname);
        assert!(first.pathname.join("manifest.json").is_file());
        assert_eq!(dirs_in(h.manager.plugins_dir()).len(), 1);
        assert!(h.manager.is_active("clock").await);
    }

    #[tokio::test]
    async fn test_failed_install_removes_directory() {
        let h = harness();
        *h.loader.fail_version.lock().unwrap() = Some("1.0.0".into());
        assert!(h.manager.download_plugin(local()).await.is_err());
        assert!(dirs_in(h.manager.plugins_dir()).is_empty());
        assert!(h.manager.get_one("clock").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_activation_failure_leaves_plugin_inactive() {
        let h = harness();
        h.loader.fail_activate.store(true, Ordering::SeqCst);
        let err = h.manager.download_plugin(local()).await.unwrap_err();
        assert_eq!(err.category(), "lifecycle");
        assert!(!h.manager.is_active("clock").await);
        assert!(!h.manager.get_one("clock").unwrap().unwrap().is_activate);
    }

    #[tokio::test]
    async fn test_failed_initialize_undoes_activate() {
        let h = harness();
        h.loader.fail_initialize.store(true, Ordering::SeqCst);
        let err = h.manager.download_plugin(local()).await.unwrap_err();
        assert_eq!(err.category(), "lifecycle");
        assert!(!h.manager.is_active("clock").await);
        assert!(!h.manager.get_one("clock").unwrap().unwrap().is_activate);
        assert_eq!(
            *h.loader.last().calls.lock().unwrap(),
            vec!["activate", "initialize", "dispose", "deactivate"]
        );
    }

    #[tokio::test]
    async fn test_unknown_names_are_noops() {
        let h = harness();
        h.manager.activate_plugin("unknown-name").await.unwrap();
        h.manager.deactivate_plugin("unknown-name").await.unwrap();
        h.manager.uninstall_plugin("unknown-name").await.unwrap();
        assert!(h.manager.get_all().unwrap().is_empty());
        assert!(!h.manager.plugins_dir().exists());
    }

    #[tokio::test]
    async fn test_deactivate_then_activate() {
        let h = harness();
        h.manager.download_plugin(local()).await.unwrap();

        h.manager.deactivate_plugin("clock").await.unwrap();
        assert!(!h.manager.is_active("clock").await);
        assert!(!h.manager.get_one("clock").unwrap().unwrap().is_activate);
        assert!(h.manager.get_menu_plugins().await.is_empty());

        h.manager.activate_plugin("clock").await.unwrap();
        assert_eq!(h.manager.get_menu_plugins().await.len(), 1);
    }

    #[tokio::test]
    async fn test_uninstall_round_trip() {
        let h = harness();
        let report = h.manager.download_plugin(local()).await.unwrap();
        h.manager.uninstall_plugin("clock").await.unwrap();

        assert!(h.manager.get_one("clock").unwrap().is_none());
        assert!(!report.pathname.exists());
        assert!(!h.manager.is_loaded("clock").await);
        assert!(h.loader.last().calls.lock().unwrap().contains(&"deactivate".to_string()));
    }

    #[tokio::test]
    async fn test_uninstall_releases_name_lock() {
        let h = harness();
        h.manager.download_plugin(local()).await.unwrap();
        assert!(h.manager.locks.lock().unwrap().contains_key("clock"));

        h.manager.uninstall_plugin("clock").await.unwrap();
        assert!(!h.manager.locks.lock().unwrap().contains_key("clock"));

        // A held lock survives the uninstall
        let held = h.manager.lock_for("other");
        h.manager.uninstall_plugin("other").await.unwrap();
        assert!(h.manager.locks.lock().unwrap().contains_key("other"));
        drop(held);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_downloads_of_one_name_serialise() {
        use crate::archive::test_support::zip_bytes;
        use crate::strategy::LocalStrategy;

        let root = TempDir::new().unwrap();
        let mut config = EngineConfig::default();
        config.plugins_dir = root.path().join("plugins");
        config.database_path = root.path().join("plugins.db");

        let zip = root.path().join("clock.zip");
        fs::write(
            &zip,
            zip_bytes(&[
                ("clock/manifest.json", br#"{"name":"clock","version":"1.0.0"}"#),
                ("clock/index.js", b"module.exports = {}"),
            ]),
        )
        .unwrap();

        let mut factory = StrategyFactory::empty();
        factory.register(SourceType::Local, Arc::new(LocalStrategy::new(&config, None)));
        let manager = Arc::new(PluginManager::new(
            &config,
            factory,
            PluginMetadataStore::open(&config.database_path).unwrap(),
            Arc::new(RecordingLoader::default()),
        ));

        let request = || -> DownloadRequest {
            DownloadConfig::Local(LocalConfig {
                path: Some(zip.clone()),
            })
            .into()
        };
        let (a, b) = tokio::join!(
            manager.download_plugin(request()),
            manager.download_plugin(request())
        );
        let mut actions = vec![a.unwrap().action, b.unwrap().action];
        actions.sort_by_key(|action| action.to_string());

        assert_eq!(actions, vec![InstallAction::Installed, InstallAction::Unchanged]);
        assert_eq!(manager.get_all().unwrap().len(), 1);
        let record = manager.get_one("clock").unwrap().unwrap();
        assert_eq!(
            dirs_in(manager.plugins_dir()),
            vec![record.pathname.file_name().unwrap().to_string_lossy().to_string()]
        );
        assert!(record.pathname.join("manifest.json").is_file());
        assert!(manager.is_active("clock").await);
    }

    #[tokio::test]
    async fn test_load_plugins_restores_active_set() {
        let h = harness();
        h.manager.download_plugin(local()).await.unwrap();

        // Fresh manager over the same store contents
        let store = PluginMetadataStore::open_in_memory().unwrap();
        for record in h.manager.get_all().unwrap() {
            store.upsert(&record).unwrap();
        }
        let loader = Arc::new(RecordingLoader::default());
        let mut config = EngineConfig::default();
        config.plugins_dir = h.manager.plugins_dir().to_path_buf();
        let restarted = PluginManager::new(&config, StrategyFactory::empty(), store, loader.clone());

        let summary = restarted.load_plugins().await.unwrap();
        assert_eq!(summary.loaded, vec!["clock"]);
        assert_eq!(summary.activated, vec!["clock"]);
        assert!(restarted.is_active("clock").await);
        assert_eq!(loader.load_count(), 1);
    }

    #[tokio::test]
    async fn test_reporter_sees_progress() {
        let (reporter, mut rx) = StatusReporter::channel();
        let h = harness();
        let manager = h.manager.with_reporter(reporter);
        manager.download_plugin(local()).await.unwrap();
        let first = rx.try_recv().unwrap();
        assert_eq!(first.operation, "download");
        assert!(rx.try_recv().unwrap().message.unwrap().contains("Installing clock"));
    }
}
