//! plugin-engine - acquire, extract, validate and drive third-party plugins
//!
//! Plugins arrive as zip archives from a CDN or local disk, or as npm
//! packages. Each is finalized under `{plugins_dir}/{millis}-{name}`,
//! recorded in a SQLite catalog and driven through its lifecycle hooks by
//! the [`manager::PluginManager`]. Hosts talk to the manager through the
//! JSON command surface in [`bridge`].

pub mod archive;
pub mod bridge;
pub mod config;
pub mod error;
pub mod events;
pub mod fs_util;
pub mod loader;
pub mod manager;
pub mod manifest;
pub mod retry;
pub mod store;
pub mod strategy;

pub use error::PluginError;
