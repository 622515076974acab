use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

// ── App config ─────────────────────────────────────────────────────

pub fn get_config(conn: &Connection, key: &str) -> Result<Option<String>, rusqlite::Error> {
    conn.query_row(
        "SELECT value FROM app_config WHERE key = ?1",
        params![key],
        |row| row.get(0),
    )
    .optional()
}

pub fn set_config(conn: &Connection, key: &str, value: &str) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT OR REPLACE INTO app_config (key, value, updated_at)
         VALUES (?1, ?2, datetime('now'))",
        params![key, value],
    )?;
    Ok(())
}

pub fn list_config(conn: &Connection) -> Result<Vec<(String, String)>, rusqlite::Error> {
    let mut stmt = conn.prepare("SELECT key, value FROM app_config ORDER BY key")?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    rows.collect()
}

// ── Variables ──────────────────────────────────────────────────────

pub fn set_variable(conn: &Connection, name: &str, value: &str) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO meter_variables (name, value, updated_at)
         VALUES (?1, ?2, datetime('now'))
         ON CONFLICT(name) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![name, value],
    )?;
    Ok(())
}

pub fn get_variable(conn: &Connection, name: &str) -> Result<Option<String>, rusqlite::Error> {
    conn.query_row(
        "SELECT value FROM meter_variables WHERE name = ?1",
        params![name],
        |row| row.get(0),
    )
    .optional()
}

pub fn remove_variable(conn: &Connection, name: &str) -> Result<bool, rusqlite::Error> {
    let changed = conn.execute("DELETE FROM meter_variables WHERE name = ?1", params![name])?;
    Ok(changed > 0)
}

pub fn list_variables(conn: &Connection) -> Result<Vec<(String, String)>, rusqlite::Error> {
    let mut stmt = conn.prepare("SELECT name, value FROM meter_variables ORDER BY name")?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    rows.collect()
}

// ── Collection registry ────────────────────────────────────────────

/// Designate the timestamp column used to date-bound a collection.
pub fn set_timestamp_field(
    conn: &Connection,
    collection: &str,
    timestamp_field: &str,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO meter_collections (collection, timestamp_field, updated_at)
         VALUES (?1, ?2, datetime('now'))
         ON CONFLICT(collection) DO UPDATE SET
           timestamp_field = excluded.timestamp_field,
           updated_at = excluded.updated_at",
        params![collection, timestamp_field],
    )?;
    Ok(())
}

pub fn list_timestamp_fields(conn: &Connection) -> Result<Vec<(String, String)>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT collection, timestamp_field FROM meter_collections ORDER BY collection",
    )?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    rows.collect()
}

// ── Saved meters ───────────────────────────────────────────────────

/// A saved meter definition as stored; `config_json` holds the tagged configuration.
#[derive(Debug, Clone, Serialize)]
pub struct StoredMeter {
    pub name: String,
    pub mode: String,
    pub config_json: String,
    pub created_at: String,
    pub updated_at: String,
}

pub fn upsert_meter(
    conn: &Connection,
    name: &str,
    mode: &str,
    config_json: &str,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO meters (name, mode, config_json, created_at, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'), datetime('now'))
         ON CONFLICT(name) DO UPDATE SET
           mode = excluded.mode,
           config_json = excluded.config_json,
           updated_at = excluded.updated_at",
        params![name, mode, config_json],
    )?;
    Ok(())
}

pub fn get_meter(conn: &Connection, name: &str) -> Result<Option<StoredMeter>, rusqlite::Error> {
    conn.query_row(
        "SELECT name, mode, config_json, created_at, updated_at FROM meters WHERE name = ?1",
        params![name],
        row_to_meter,
    )
    .optional()
}

pub fn list_meters(conn: &Connection) -> Result<Vec<StoredMeter>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT name, mode, config_json, created_at, updated_at FROM meters ORDER BY name",
    )?;
    let rows = stmt.query_map([], row_to_meter)?;
    rows.collect()
}

pub fn remove_meter(conn: &Connection, name: &str) -> Result<bool, rusqlite::Error> {
    let changed = conn.execute("DELETE FROM meters WHERE name = ?1", params![name])?;
    Ok(changed > 0)
}

fn row_to_meter(row: &rusqlite::Row<'_>) -> Result<StoredMeter, rusqlite::Error> {
    Ok(StoredMeter {
        name: row.get(0)?,
        mode: row.get(1)?,
        config_json: row.get(2)?,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
    })
}
