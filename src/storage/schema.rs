use std::collections::HashSet;

use rusqlite::{params, Connection};

/// Tables owned by the application itself, never offered as collections.
const INTERNAL_TABLES: &[&str] = &["app_config", "meter_variables", "meter_collections", "meters"];

/// Column names of a collection; empty when the collection does not exist.
pub fn collection_columns(
    conn: &Connection,
    collection: &str,
) -> Result<HashSet<String>, rusqlite::Error> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1)")?;
    let rows = stmt.query_map(params![collection], |row| row.get(0))?;
    rows.collect()
}

/// Data collections (tables and views) available for aggregation.
pub fn list_collections(conn: &Connection) -> Result<Vec<String>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master
         WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%'
         ORDER BY name",
    )?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut out = Vec::new();
    for name in rows {
        let name = name?;
        if !INTERNAL_TABLES.contains(&name.as_str()) {
            out.push(name);
        }
    }
    Ok(out)
}

/// Row count of a collection, for status output.
pub fn collection_row_count(conn: &Connection, collection: &str) -> Result<i64, rusqlite::Error> {
    let sql = format!(
        "SELECT COUNT(*) FROM {}",
        crate::query::builder::quote_ident(collection)
    );
    conn.query_row(&sql, [], |row| row.get(0))
}
