//! Loading installed plugins and driving their lifecycle hooks.
//!
//! The default [`CommandLoader`] keeps plugin code out of the engine process:
//! `manifest.main` names an executable inside the plugin directory and every
//! hook runs it as `<main> <hook>` with a JSON context on stdin.

use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::PluginError;
use crate::manifest::PluginManifest;

/// A loaded plugin instance. Hooks default to no-ops.
#[async_trait]
pub trait PluginModule: Send + Sync {
    async fn activate(&self) -> Result<(), PluginError> {
        Ok(())
    }

    async fn initialize(&self) -> Result<(), PluginError> {
        Ok(())
    }

    async fn dispose(&self) -> Result<(), PluginError> {
        Ok(())
    }

    async fn deactivate(&self) -> Result<(), PluginError> {
        Ok(())
    }

    /// Menu contribution shown by the host while the plugin is active
    async fn menu(&self) -> Result<Option<serde_json::Value>, PluginError> {
        Ok(None)
    }
}

/// Turns an installed directory into a live module
#[async_trait]
pub trait PluginLoader: Send + Sync {
    async fn load(
        &self,
        dir: &Path,
        manifest: &PluginManifest,
    ) -> Result<Arc<dyn PluginModule>, PluginError>;
}

/// Module for a plugin that ships no entry point
pub struct InertModule;

impl PluginModule for InertModule {}

/// Loader that runs each plugin's entry as a child process per hook
pub struct CommandLoader {
    hook_timeout: Duration,
}

impl CommandLoader {
    pub fn new(hook_timeout: Duration) -> Self {
        Self { hook_timeout }
    }
}

#[async_trait]
impl PluginLoader for CommandLoader {
    async fn load(
        &self,
        dir: &Path,
        manifest: &PluginManifest,
    ) -> Result<Arc<dyn PluginModule>, PluginError> {
        let Some(entry) = manifest.entry_path(dir) else {
            debug!(plugin = %manifest.name, "No entry point, loading inert module");
            return Ok(Arc::new(InertModule));
        };
        if !entry.is_file() {
            return Err(PluginError::lifecycle(
                &manifest.name,
                "load",
                format!("entry point {} does not exist", entry.display()),
            ));
        }
        debug!(plugin = %manifest.name, entry = ?entry, "Loaded plugin entry point");
        Ok(Arc::new(CommandModule {
            name: manifest.name.clone(),
            version: manifest.version.clone(),
            dir: dir.to_path_buf(),
            entry,
            hook_timeout: self.hook_timeout,
        }))
    }
}

/// Context written to the hook process on stdin
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HookContext<'a> {
    plugin: &'a str,
    version: Option<&'a str>,
    hook: &'a str,
    plugin_dir: &'a Path,
}

struct CommandModule {
    name: String,
    version: Option<String>,
    dir: PathBuf,
    entry: PathBuf,
    hook_timeout: Duration,
}

impl CommandModule {
    /// Run `<entry> <hook>` and return its stdout
    async fn run_hook(&self, hook: &str) -> Result<String, PluginError> {
        let context = serde_json::to_string(&HookContext {
            plugin: &self.name,
            version: self.version.as_deref(),
            hook,
            plugin_dir: &self.dir,
        })?;

        let mut child = Command::new(&self.entry)
            .arg(hook)
            .current_dir(&self.dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PluginError::lifecycle(&self.name, hook, e.to_string()))?;

        if let Some(mut stdin) = child.stdin.take() {
            // A hook that ignores its input may close stdin early
            if let Err(e) = stdin.write_all(context.as_bytes()).await {
                debug!(plugin = %self.name, hook, error = %e, "Hook did not read its context");
            }
        }

        let output = match timeout(self.hook_timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(PluginError::lifecycle(&self.name, hook, e.to_string())),
            Err(_) => {
                return Err(PluginError::lifecycle(
                    &self.name,
                    hook,
                    format!("timed out after {}s", self.hook_timeout.as_secs()),
                ))
            }
        };

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            let detail = stderr.trim();
            return Err(PluginError::lifecycle(
                &self.name,
                hook,
                if detail.is_empty() {
                    format!("exited with {}", output.status)
                } else {
                    format!("exited with {}: {}", output.status, detail)
                },
            ));
        }
        if !stderr.is_empty() {
            debug!(plugin = %self.name, hook, stderr = %stderr, "Hook stderr");
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl PluginModule for CommandModule {
    async fn activate(&self) -> Result<(), PluginError> {
        self.run_hook("activate").await.map(drop)
    }

    async fn initialize(&self) -> Result<(), PluginError> {
        self.run_hook("initialize").await.map(drop)
    }

    async fn dispose(&self) -> Result<(), PluginError> {
        self.run_hook("dispose").await.map(drop)
    }

    async fn deactivate(&self) -> Result<(), PluginError> {
        self.run_hook("deactivate").await.map(drop)
    }

    async fn menu(&self) -> Result<Option<serde_json::Value>, PluginError> {
        let stdout = self.run_hook("menu").await?;
        let trimmed = stdout.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        match serde_json::from_str::<serde_json::Value>(trimmed) {
            Ok(serde_json::Value::Null) => Ok(None),
            Ok(menu) => Ok(Some(menu)),
            Err(e) => {
                warn!(plugin = %self.name, error = %e, "Menu output is not JSON");
                Err(PluginError::lifecycle(&self.name, "menu", format!("invalid menu JSON: {}", e)))
            }
        }
    }
}
