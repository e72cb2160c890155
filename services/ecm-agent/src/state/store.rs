//! SQLite-based plugin record store.
//!
//! This provides durable storage for installed plugins, enabling the agent
//! to reload them onto their ECUs after a restart.

use std::path::{Path, PathBuf};

use ecm_messages::{AppId, EcuId, LinkContextEntry, PortId, PortInitialContext};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use thiserror::Error;
use tracing::debug;

/// Errors from plugin store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Context encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Deployment state of one plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginRecord {
    /// Server-visible application ID.
    pub app_id: AppId,
    /// ECU the plugin is installed on.
    pub remote_ecu_id: EcuId,
    /// Plugin display name (durable key).
    pub plugin_name: String,
    /// Entry name the ECU loads.
    pub executable_plugin_name: String,
    pub callback_port_id: PortId,
    pub sending_port_id: PortId,
    pub port_initial_context: PortInitialContext,
    pub port_linking_context: Vec<LinkContextEntry>,
    /// Where the plugin binary is stored on disk.
    pub location: PathBuf,
}

const RECORD_COLUMNS: &str = "plugin_name, app_id, remote_ecu_id, executable_plugin_name, \
     callback_port_id, sending_port_id, port_initial_context, port_linking_context, location";

/// SQLite plugin store.
pub struct PluginStore {
    conn: Connection,
}

impl PluginStore {
    /// Open or create a plugin store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self { conn };
        store.init_schema()?;

        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    /// Initialize database schema.
    fn init_schema(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS plugins (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                plugin_name TEXT NOT NULL UNIQUE,
                app_id INTEGER NOT NULL,
                remote_ecu_id INTEGER NOT NULL,
                executable_plugin_name TEXT NOT NULL,
                callback_port_id INTEGER NOT NULL,
                sending_port_id INTEGER NOT NULL,
                port_initial_context TEXT NOT NULL,
                port_linking_context TEXT NOT NULL,
                location TEXT NOT NULL,
                installed_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_plugins_ecu ON plugins(remote_ecu_id);
            "#,
        )?;

        debug!("Plugin store schema initialized");
        Ok(())
    }

    /// Insert a record, replacing any record with the same name.
    ///
    /// A replaced record moves to the end of its ECU's load order.
    pub fn put(&self, record: &PluginRecord) -> Result<(), StoreError> {
        let initial = serde_json::to_string(&record.port_initial_context)?;
        let linking = serde_json::to_string(&record.port_linking_context)?;
        let now = chrono::Utc::now().timestamp();

        self.conn.execute(
            r#"
            INSERT OR REPLACE INTO plugins (plugin_name, app_id, remote_ecu_id, executable_plugin_name,
                callback_port_id, sending_port_id, port_initial_context, port_linking_context,
                location, installed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                record.plugin_name,
                record.app_id,
                record.remote_ecu_id,
                record.executable_plugin_name,
                record.callback_port_id,
                record.sending_port_id,
                initial,
                linking,
                record.location.to_string_lossy().into_owned(),
                now,
            ],
        )?;
        Ok(())
    }

    /// Get a record by plugin name.
    pub fn get(&self, plugin_name: &str) -> Result<Option<PluginRecord>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM plugins WHERE plugin_name = ?1"
        ))?;

        stmt.query_row(params![plugin_name], record_from_row)
            .optional()
            .map_err(Into::into)
    }

    /// Delete a record. Returns whether a record existed.
    pub fn delete(&self, plugin_name: &str) -> Result<bool, StoreError> {
        let removed = self.conn.execute(
            "DELETE FROM plugins WHERE plugin_name = ?1",
            params![plugin_name],
        )?;
        Ok(removed > 0)
    }

    /// List the plugins installed on an ECU, in insertion order.
    pub fn list(&self, ecu_id: EcuId) -> Result<Vec<PluginRecord>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM plugins WHERE remote_ecu_id = ?1 ORDER BY seq"
        ))?;

        let records = stmt
            .query_map(params![ecu_id], record_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(records)
    }

    /// Look up the application ID of a plugin.
    pub fn app_id(&self, plugin_name: &str) -> Result<Option<AppId>, StoreError> {
        self.conn
            .query_row(
                "SELECT app_id FROM plugins WHERE plugin_name = ?1",
                params![plugin_name],
                |row| row.get(0),
            )
            .optional()
            .map_err(Into::into)
    }

    /// Count all records.
    pub fn count(&self) -> Result<i64, StoreError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM plugins", [], |row| row.get(0))?;
        Ok(count)
    }
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<PluginRecord> {
    let initial: String = row.get(6)?;
    let linking: String = row.get(7)?;
    let location: String = row.get(8)?;

    Ok(PluginRecord {
        plugin_name: row.get(0)?,
        app_id: row.get(1)?,
        remote_ecu_id: row.get(2)?,
        executable_plugin_name: row.get(3)?,
        callback_port_id: row.get(4)?,
        sending_port_id: row.get(5)?,
        port_initial_context: decode_json(6, &initial)?,
        port_linking_context: decode_json(7, &linking)?,
        location: PathBuf::from(location),
    })
}

fn decode_json<T: serde::de::DeserializeOwned>(column: usize, raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(e)))
}
