//! Persisted catalog of installed plugins.
//!
//! One row per plugin name in a SQLite database. The record is the durable
//! source of truth; loaded modules are rebuilt from it on every start.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::error::PluginError;
use crate::fs_util;
use crate::manifest::PluginManifest;
use crate::strategy::SourceType;

/// Current schema version - increment when adding migrations
const SCHEMA_VERSION: i64 = 2;

/// Durable description of one installed plugin
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginMetadataRecord {
    pub name: String,
    pub version: Option<String>,
    pub main: Option<String>,
    pub renderer: Option<String>,
    /// Absolute install directory
    pub pathname: PathBuf,
    pub is_activate: bool,
    pub source: Option<SourceType>,
    pub installed_at: String,
    pub updated_at: String,
}

impl PluginMetadataRecord {
    /// Fresh, inactive record for a just-finalized install
    pub fn new(manifest: &PluginManifest, pathname: &Path, source: Option<SourceType>) -> Self {
        let now = Utc::now().to_rfc3339();
        Self {
            name: manifest.name.clone(),
            version: manifest.version.clone(),
            main: manifest.main.clone(),
            renderer: manifest.renderer.clone(),
            pathname: pathname.to_path_buf(),
            is_activate: false,
            source,
            installed_at: now.clone(),
            updated_at: now,
        }
    }

    /// Manifest view of the record, used to reload the entry module
    pub fn manifest(&self) -> PluginManifest {
        PluginManifest {
            name: self.name.clone(),
            version: self.version.clone(),
            main: self.main.clone(),
            renderer: self.renderer.clone(),
        }
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let pathname: String = row.get("pathname")?;
        let source: Option<String> = row.get("source")?;
        Ok(Self {
            name: row.get("name")?,
            version: row.get("version")?,
            main: row.get("main")?,
            renderer: row.get("renderer")?,
            pathname: PathBuf::from(pathname),
            is_activate: row.get("is_activate")?,
            source: source.and_then(|s| s.parse().ok()),
            installed_at: row.get("installed_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

const SELECT_COLUMNS: &str = "SELECT name, version, main, renderer, pathname, is_activate, \
                              source, installed_at, updated_at FROM plugins";

/// SQLite-backed metadata store
pub struct PluginMetadataStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl PluginMetadataStore {
    /// Open or create the store at `path`
    pub fn open(path: &Path) -> Result<Self, PluginError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs_util::ensure_dir(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::with_connection(conn, Some(path.to_path_buf()))
    }

    /// Store that lives only as long as the process
    pub fn open_in_memory() -> Result<Self, PluginError> {
        Self::with_connection(Connection::open_in_memory()?, None)
    }

    fn with_connection(conn: Connection, path: Option<PathBuf>) -> Result<Self, PluginError> {
        let store = Self {
            conn: Mutex::new(conn),
            path,
        };
        store.ensure_schema()?;
        Ok(store)
    }

    /// Database file, `None` for in-memory stores
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the lock cannot leave SQLite half-written
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ensure_schema(&self) -> Result<(), PluginError> {
        let conn = self.conn();
        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
            [],
        )?;
        let current_version: i64 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < SCHEMA_VERSION {
            tracing::info!(
                "Migrating plugin store from version {} to {}",
                current_version,
                SCHEMA_VERSION
            );
            run_migrations(&conn, current_version)?;
        }
        Ok(())
    }

    /// Insert or replace the record keyed by `record.name`
    pub fn upsert(&self, record: &PluginMetadataRecord) -> Result<(), PluginError> {
        self.conn().execute(
            "INSERT INTO plugins
                (name, version, main, renderer, pathname, is_activate, source, installed_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(name) DO UPDATE SET
                version = excluded.version,
                main = excluded.main,
                renderer = excluded.renderer,
                pathname = excluded.pathname,
                is_activate = excluded.is_activate,
                source = excluded.source,
                updated_at = excluded.updated_at",
            params![
                record.name,
                record.version,
                record.main,
                record.renderer,
                record.pathname.to_string_lossy(),
                record.is_activate,
                record.source.map(|s| s.to_string()),
                record.installed_at,
                record.updated_at,
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Option<PluginMetadataRecord>, PluginError> {
        let record = self
            .conn()
            .query_row(
                &format!("{} WHERE name = ?1", SELECT_COLUMNS),
                params![name],
                PluginMetadataRecord::from_row,
            )
            .optional()?;
        Ok(record)
    }

    pub fn contains(&self, name: &str) -> Result<bool, PluginError> {
        Ok(self.get(name)?.is_some())
    }

    /// All records ordered by name
    pub fn list(&self) -> Result<Vec<PluginMetadataRecord>, PluginError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!("{} ORDER BY name", SELECT_COLUMNS))?;
        let records = stmt
            .query_map([], PluginMetadataRecord::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Point the record at a new install. Returns false when no record exists.
    pub fn update_install(
        &self,
        manifest: &PluginManifest,
        pathname: &Path,
    ) -> Result<bool, PluginError> {
        let changed = self.conn().execute(
            "UPDATE plugins
             SET version = ?2, main = ?3, renderer = ?4, pathname = ?5, updated_at = ?6
             WHERE name = ?1",
            params![
                manifest.name,
                manifest.version,
                manifest.main,
                manifest.renderer,
                pathname.to_string_lossy(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(changed > 0)
    }

    /// Persist the activation flag. Returns false when no record exists.
    pub fn set_active(&self, name: &str, active: bool) -> Result<bool, PluginError> {
        let changed = self.conn().execute(
            "UPDATE plugins SET is_activate = ?2, updated_at = ?3 WHERE name = ?1",
            params![name, active, Utc::now().to_rfc3339()],
        )?;
        Ok(changed > 0)
    }

    /// Delete the record. Returns false when none existed.
    pub fn delete(&self, name: &str) -> Result<bool, PluginError> {
        let changed = self
            .conn()
            .execute("DELETE FROM plugins WHERE name = ?1", params![name])?;
        Ok(changed > 0)
    }
}

fn run_migrations(conn: &Connection, from_version: i64) -> Result<(), PluginError> {
    // Version 1: plugin catalog
    if from_version < 1 {
        tracing::debug!("Running migration v1: plugins table");
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS plugins (
                name TEXT PRIMARY KEY NOT NULL,
                version TEXT,
                main TEXT,
                renderer TEXT,
                pathname TEXT NOT NULL,
                is_activate INTEGER NOT NULL DEFAULT 0
            );
            "#,
        )?;
    }

    // Version 2: source tracking and timestamps
    if from_version < 2 {
        tracing::debug!("Running migration v2: source and timestamps");
        conn.execute_batch(
            r#"
            ALTER TABLE plugins ADD COLUMN source TEXT;
            ALTER TABLE plugins ADD COLUMN installed_at TEXT NOT NULL DEFAULT '';
            ALTER TABLE plugins ADD COLUMN updated_at TEXT NOT NULL DEFAULT '';
            "#,
        )?;
    }

    conn.execute(
        "INSERT OR REPLACE INTO schema_version (version) VALUES (?1)",
        params![SCHEMA_VERSION],
    )?;
    Ok(())
}
