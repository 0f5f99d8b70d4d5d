//! Status events reported to the host while commands run.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::debug;

use crate::error::PluginError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PluginStatus {
    InProgress,
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub status: PluginStatus,
    /// Command that produced the event, e.g. `download`
    pub operation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Error category, only set on `error`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

/// Sending half of the event channel. Cloning shares the channel.
#[derive(Debug, Clone, Default)]
pub struct StatusReporter {
    tx: Option<UnboundedSender<StatusEvent>>,
}

impl StatusReporter {
    pub fn channel() -> (Self, UnboundedReceiver<StatusEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Reporter that drops every event
    pub fn noop() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: StatusEvent) {
        if let Some(tx) = &self.tx {
            if tx.send(event).is_err() {
                debug!("Status receiver dropped");
            }
        }
    }

    pub fn in_progress(&self, operation: &str, plugin: Option<&str>, message: impl Into<String>) {
        self.emit(StatusEvent {
            status: PluginStatus::InProgress,
            operation: operation.to_string(),
            plugin: plugin.map(str::to_string),
            message: Some(message.into()),
            category: None,
        });
    }

    pub fn success(&self, operation: &str, plugin: Option<&str>, message: Option<String>) {
        self.emit(StatusEvent {
            status: PluginStatus::Success,
            operation: operation.to_string(),
            plugin: plugin.map(str::to_string),
            message,
            category: None,
        });
    }

    pub fn error(&self, operation: &str, plugin: Option<&str>, err: &PluginError) {
        self.emit(StatusEvent {
            status: PluginStatus::Error,
            operation: operation.to_string(),
            plugin: plugin.map(str::to_string),
            message: Some(err.to_string()),
            category: Some(err.category().to_string()),
        });
    }
}
