use std::path::Path;
use tokio_rusqlite::{Connection, rusqlite};

use crate::error::{Error, Result};

pub mod sets;

pub(crate) fn index_error(err: impl std::fmt::Display) -> Error {
    Error::Index(err.to_string())
}

/// Open (creating if needed) the local set index at `path`.
pub async fn init(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let conn = Connection::open(path.to_path_buf()).await.map_err(index_error)?;
    apply_schema(&conn).await?;
    Ok(conn)
}

pub async fn init_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory().await.map_err(index_error)?;
    apply_schema(&conn).await?;
    Ok(conn)
}

async fn apply_schema(conn: &Connection) -> Result<()> {
    conn.call(|conn| {
        let schema = include_str!("schema.sql");
        conn.execute_batch(schema)?;

        // SQLite leaves foreign keys off unless asked.
        conn.execute("PRAGMA foreign_keys = ON;", [])?;

        Ok::<(), rusqlite::Error>(())
    })
    .await
    .map_err(index_error)
}
