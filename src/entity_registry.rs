//! Entity registry persisted in SQLite (WAL).
//!
//! Remembers which entities an integration created, keyed by the
//! integration's unique id, so a restarted registration knows the devices it
//! owned before (nmap_tracker uses this for its missing-device pass).

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::error::RegistryError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistryEntry {
    pub entity_id: String,
    pub unique_id: String,
    pub platform: String,
    pub config_entry_id: String,
    pub original_name: Option<String>,
}

pub struct EntityRegistry {
    conn: Mutex<Connection>,
}

fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS entity_registry (
            entity_id       TEXT PRIMARY KEY,
            unique_id       TEXT NOT NULL,
            platform        TEXT NOT NULL,
            config_entry_id TEXT NOT NULL,
            original_name   TEXT,
            created_at      TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
            UNIQUE(platform, unique_id)
        );
        CREATE INDEX IF NOT EXISTS idx_registry_entry
            ON entity_registry(config_entry_id);",
    )
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<RegistryEntry> {
    Ok(RegistryEntry {
        entity_id: row.get(0)?,
        unique_id: row.get(1)?,
        platform: row.get(2)?,
        config_entry_id: row.get(3)?,
        original_name: row.get(4)?,
    })
}

impl EntityRegistry {
    /// Open (or create) the registry database at `path`.
    pub fn open(path: &Path) -> Result<Self, RegistryError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "wal")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, RegistryError> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register an entity, or refresh the name and owner of an existing one.
    /// Returns the stored entry; an already-registered unique id keeps its
    /// original entity id.
    pub fn register(
        &self,
        platform: &str,
        unique_id: &str,
        suggested_entity_id: &str,
        config_entry_id: &str,
        original_name: Option<&str>,
    ) -> Result<RegistryEntry, RegistryError> {
        if let Some(mut existing) = self.get_by_unique_id(platform, unique_id)? {
            self.conn().execute(
                "UPDATE entity_registry SET config_entry_id = ?1, original_name = ?2
                 WHERE entity_id = ?3",
                params![config_entry_id, original_name, existing.entity_id],
            )?;
            existing.config_entry_id = config_entry_id.to_string();
            existing.original_name = original_name.map(String::from);
            return Ok(existing);
        }

        let entity_id = self.free_entity_id(suggested_entity_id)?;
        self.conn().execute(
            "INSERT INTO entity_registry (entity_id, unique_id, platform, config_entry_id, original_name)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![entity_id, unique_id, platform, config_entry_id, original_name],
        )?;
        tracing::debug!(entity_id = %entity_id, platform, unique_id, "Registered entity");

        Ok(RegistryEntry {
            entity_id,
            unique_id: unique_id.to_string(),
            platform: platform.to_string(),
            config_entry_id: config_entry_id.to_string(),
            original_name: original_name.map(String::from),
        })
    }

    /// First of `id`, `id_2`, `id_3`, ... that is not taken.
    fn free_entity_id(&self, suggested: &str) -> Result<String, RegistryError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT 1 FROM entity_registry WHERE entity_id = ?1")?;
        let mut candidate = suggested.to_string();
        let mut n = 2;
        while stmt.exists(params![candidate])? {
            candidate = format!("{}_{}", suggested, n);
            n += 1;
        }
        Ok(candidate)
    }

    pub fn get_by_unique_id(
        &self,
        platform: &str,
        unique_id: &str,
    ) -> Result<Option<RegistryEntry>, RegistryError> {
        let entry = self
            .conn()
            .query_row(
                "SELECT entity_id, unique_id, platform, config_entry_id, original_name
                 FROM entity_registry WHERE platform = ?1 AND unique_id = ?2",
                params![platform, unique_id],
                row_to_entry,
            )
            .optional()?;
        Ok(entry)
    }

    pub fn entries_for_config_entry(
        &self,
        config_entry_id: &str,
    ) -> Result<Vec<RegistryEntry>, RegistryError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT entity_id, unique_id, platform, config_entry_id, original_name
             FROM entity_registry WHERE config_entry_id = ?1 ORDER BY entity_id",
        )?;
        let entries = stmt
            .query_map(params![config_entry_id], row_to_entry)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    /// Delete every entity owned by a config entry. Returns the number removed.
    pub fn remove_config_entry(&self, config_entry_id: &str) -> Result<usize, RegistryError> {
        let removed = self.conn().execute(
            "DELETE FROM entity_registry WHERE config_entry_id = ?1",
            params![config_entry_id],
        )?;
        Ok(removed)
    }
}
