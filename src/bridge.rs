//! Host bridge: the JSON command surface in front of the manager.
//!
//! Every command emits `inProgress` followed by `success` or `error` on the
//! reporter and returns a [`BridgeReply`].

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

use crate::error::PluginError;
use crate::events::{PluginStatus, StatusReporter};
use crate::manager::{DownloadRequest, PluginManager};
use crate::strategy::DownloadConfig;

/// Command sent by the host, tagged by `command`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum BridgeCommand {
    #[serde(rename_all = "camelCase")]
    Download {
        config: DownloadConfig,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        installation_id: Option<String>,
    },
    Activate {
        name: String,
    },
    Deactivate {
        name: String,
    },
    Uninstall {
        name: String,
    },
    Load,
    GetAll,
    GetOne {
        name: String,
    },
    Menu,
    Pending,
}

impl BridgeCommand {
    /// Wire name of the command
    pub fn operation(&self) -> &'static str {
        match self {
            Self::Download { .. } => "download",
            Self::Activate { .. } => "activate",
            Self::Deactivate { .. } => "deactivate",
            Self::Uninstall { .. } => "uninstall",
            Self::Load => "load",
            Self::GetAll => "getAll",
            Self::GetOne { .. } => "getOne",
            Self::Menu => "menu",
            Self::Pending => "pending",
        }
    }

    fn plugin(&self) -> Option<&str> {
        match self {
            Self::Activate { name }
            | Self::Deactivate { name }
            | Self::Uninstall { name }
            | Self::GetOne { name } => Some(name),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeReply {
    pub status: PluginStatus,
    pub operation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl BridgeReply {
    fn success(operation: &str, message: Option<String>, payload: Option<serde_json::Value>) -> Self {
        Self {
            status: PluginStatus::Success,
            operation: operation.to_string(),
            message,
            category: None,
            payload,
        }
    }

    fn error(operation: &str, err: &PluginError) -> Self {
        Self {
            status: PluginStatus::Error,
            operation: operation.to_string(),
            message: Some(err.to_string()),
            category: Some(err.category().to_string()),
            payload: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == PluginStatus::Success
    }
}

pub struct HostBridge {
    manager: Arc<PluginManager>,
    reporter: StatusReporter,
}

impl HostBridge {
    pub fn new(manager: Arc<PluginManager>, reporter: StatusReporter) -> Self {
        Self { manager, reporter }
    }

    pub fn manager(&self) -> &Arc<PluginManager> {
        &self.manager
    }

    /// Parse one JSON command and run it
    pub async fn dispatch_json(&self, line: &str) -> BridgeReply {
        match serde_json::from_str::<BridgeCommand>(line) {
            Ok(command) => self.dispatch(command).await,
            Err(e) => {
                let err = PluginError::Validation(format!("invalid command: {}", e));
                self.reporter.error("unknown", None, &err);
                BridgeReply::error("unknown", &err)
            }
        }
    }

    pub async fn dispatch(&self, command: BridgeCommand) -> BridgeReply {
        let operation = command.operation();
        let plugin = command.plugin().map(str::to_string);
        self.reporter
            .in_progress(operation, plugin.as_deref(), format!("{} started", operation));

        match self.run(command).await {
            Ok((message, payload)) => {
                info!(operation, plugin = ?plugin, "Command succeeded");
                self.reporter
                    .success(operation, plugin.as_deref(), message.clone());
                BridgeReply::success(operation, message, payload)
            }
            Err(e) => {
                error!(operation, plugin = ?plugin, error = %e, "Command failed");
                self.reporter.error(operation, plugin.as_deref(), &e);
                BridgeReply::error(operation, &e)
            }
        }
    }

    async fn run(
        &self,
        command: BridgeCommand,
    ) -> Result<(Option<String>, Option<serde_json::Value>), PluginError> {
        let manager = &self.manager;
        match command {
            BridgeCommand::Download {
                config,
                installation_id,
            } => {
                let report = manager
                    .download_plugin(DownloadRequest {
                        config,
                        installation_id,
                    })
                    .await?;
                let message = format!("{} {}", report.name, report.action);
                Ok((Some(message), Some(serde_json::to_value(report)?)))
            }
            BridgeCommand::Activate { name } => {
                manager.activate_plugin(&name).await?;
                Ok((Some(format!("{} activated", name)), None))
            }
            BridgeCommand::Deactivate { name } => {
                manager.deactivate_plugin(&name).await?;
                Ok((Some(format!("{} deactivated", name)), None))
            }
            BridgeCommand::Uninstall { name } => {
                manager.uninstall_plugin(&name).await?;
                Ok((Some(format!("{} uninstalled", name)), None))
            }
            BridgeCommand::Load => {
                let summary = manager.load_plugins().await?;
                Ok((None, Some(serde_json::to_value(summary)?)))
            }
            BridgeCommand::GetAll => {
                let records = manager.get_all()?;
                Ok((None, Some(serde_json::to_value(records)?)))
            }
            BridgeCommand::GetOne { name } => {
                let record = manager
                    .get_one(&name)?
                    .ok_or(PluginError::NotFound(name))?;
                Ok((None, Some(serde_json::to_value(record)?)))
            }
            BridgeCommand::Menu => {
                let menus = manager.get_menu_plugins().await;
                Ok((None, Some(serde_json::to_value(menus)?)))
            }
            BridgeCommand::Pending => {
                let pending = manager.pending_installations();
                Ok((None, Some(serde_json::to_value(pending)?)))
            }
        }
    }
}
