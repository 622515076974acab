pub mod repository;
pub mod schema;

use rusqlite::OpenFlags;
use rusqlite_migration::{Migrations, M};

use crate::error::{Error, Result};

/// Database wraps two `tokio_rusqlite::Connection` instances (writer + reader)
/// using WAL mode for concurrent access. The writer serializes writes via
/// `tokio_rusqlite`'s internal channel; the reader serves aggregate queries
/// without waiting on writes.
#[derive(Clone)]
pub struct Database {
    writer: tokio_rusqlite::Connection,
    reader: tokio_rusqlite::Connection,
}

impl Database {
    /// Open the database at the default path (`~/.dynmeter/dynmeter.db`).
    pub async fn open() -> Result<Self> {
        let dir = dirs::home_dir()
            .ok_or_else(|| Error::Config("cannot determine home directory".into()))?
            .join(".dynmeter");
        std::fs::create_dir_all(&dir).map_err(|e| Error::Config(e.to_string()))?;
        Self::open_at(dir.join("dynmeter.db")).await
    }

    /// Open the database at the given path, applying migrations.
    pub async fn open_at(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let writer = tokio_rusqlite::Connection::open(&path).await?;
        Self::init_writer(&writer).await?;

        let reader = tokio_rusqlite::Connection::open(&path).await?;
        Self::init_reader(&reader).await?;

        Ok(Self { writer, reader })
    }

    /// Attach to an existing SQLite file holding data collections.
    ///
    /// The file is opened read-only: no migrations, no pragma that
    /// changes it on disk.
    pub async fn open_data_at(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return Err(Error::Config(format!(
                "data store not found: {}",
                path.display()
            )));
        }
        let reader =
            tokio_rusqlite::Connection::open_with_flags(&path, OpenFlags::SQLITE_OPEN_READ_ONLY)
                .await?;
        // The journal mode is a property of the file; leave it as the owner set it.
        reader
            .call(|conn| conn.execute_batch("PRAGMA busy_timeout=5000;"))
            .await?;
        Ok(Self {
            writer: reader.clone(),
            reader,
        })
    }

    /// Open an in-memory database (for testing).
    pub async fn open_memory() -> Result<Self> {
        let writer = tokio_rusqlite::Connection::open_in_memory().await?;
        Self::init_writer(&writer).await?;

        // For in-memory, we share the same connection for reader/writer
        // since in-memory DBs are per-connection.
        Ok(Self {
            reader: writer.clone(),
            writer,
        })
    }

    async fn init_writer(conn: &tokio_rusqlite::Connection) -> Result<()> {
        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode=WAL;\
                 PRAGMA foreign_keys=ON;\
                 PRAGMA busy_timeout=5000;",
            )
            .map_err(|e| e.to_string())?;
            let migrations = Migrations::new(vec![M::up(include_str!(
                "migrations/001_initial.sql"
            ))]);
            migrations.to_latest(conn).map_err(|e| e.to_string())?;
            Ok::<(), String>(())
        })
        .await
        .map_err(|e| Error::Migration(e.to_string()))
    }

    async fn init_reader(conn: &tokio_rusqlite::Connection) -> Result<()> {
        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode=WAL;\
                 PRAGMA busy_timeout=5000;",
            )?;
            Ok::<(), rusqlite::Error>(())
        })
        .await?;
        Ok(())
    }

    /// Get a reference to the writer connection.
    pub fn writer(&self) -> &tokio_rusqlite::Connection {
        &self.writer
    }

    /// Get a reference to the reader connection.
    pub fn reader(&self) -> &tokio_rusqlite::Connection {
        &self.reader
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_memory() {
        let db = Database::open_memory().await.unwrap();

        let tables: Vec<String> = db
            .reader()
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT name FROM sqlite_master WHERE type='table' ORDER BY name",
                )?;
                let rows = stmt.query_map([], |row| row.get(0))?;
                Ok::<Vec<String>, rusqlite::Error>(rows.filter_map(|r| r.ok()).collect())
            })
            .await
            .unwrap();

        assert!(tables.contains(&"app_config".to_string()));
        assert!(tables.contains(&"meter_variables".to_string()));
        assert!(tables.contains(&"meter_collections".to_string()));
        assert!(tables.contains(&"meters".to_string()));
    }

    #[tokio::test]
    async fn test_open_at_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meter.db");
        {
            let db = Database::open_at(&path).await.unwrap();
            db.writer()
                .call(|conn| repository::set_config(conn, "default_timestamp_field", "created_at"))
                .await
                .unwrap();
        }
        let db = Database::open_at(&path).await.unwrap();
        let value = db
            .reader()
            .call(|conn| repository::get_config(conn, "default_timestamp_field"))
            .await
            .unwrap();
        assert_eq!(value.as_deref(), Some("created_at"));
    }

    #[tokio::test]
    async fn test_open_data_leaves_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warehouse.db");
        {
            let conn = rusqlite::Connection::open(&path).unwrap();
            conn.execute_batch("CREATE TABLE customers (id INTEGER PRIMARY KEY, status TEXT);")
                .unwrap();
        }

        let db = Database::open_data_at(&path).await.unwrap();
        let count: i64 = db
            .reader()
            .call(|conn| conn.query_row("SELECT COUNT(*) FROM customers", [], |row| row.get(0)))
            .await
            .unwrap();
        assert_eq!(count, 0);

        let err = db
            .writer()
            .call(|conn| conn.execute("INSERT INTO customers (status) VALUES ('x')", []))
            .await;
        assert!(err.is_err());
        drop(db);

        let conn = rusqlite::Connection::open(&path).unwrap();
        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode, "delete");
        assert!(!dir.path().join("warehouse.db-wal").exists());
    }

    #[tokio::test]
    async fn test_open_data_requires_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Database::open_data_at(dir.path().join("missing.db"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Config(_)));
    }
}
