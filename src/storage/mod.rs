pub mod repository;

use std::path::Path;

use rusqlite_migration::{Migrations, M};

use crate::error::{Error, Result};

const PRAGMAS: &str = "PRAGMA journal_mode=WAL;\
                       PRAGMA foreign_keys=ON;\
                       PRAGMA busy_timeout=5000;";

fn migrations() -> Migrations<'static> {
    Migrations::new(vec![M::up(include_str!("migrations/001_initial.sql"))])
}

/// Local cache of credentials, cursors and messages.
///
/// Writes go through one connection so they apply in order; reads use a
/// second one and see committed WAL state.
#[derive(Clone)]
pub struct Database {
    writer: tokio_rusqlite::Connection,
    reader: tokio_rusqlite::Connection,
}

impl Database {
    /// `~/.inboxsync/inboxsync.db`, creating the directory on first use.
    pub async fn open() -> Result<Self> {
        let dir = dirs::home_dir()
            .ok_or_else(|| Error::Config("cannot determine home directory".into()))?
            .join(".inboxsync");
        std::fs::create_dir_all(&dir).map_err(|e| Error::Config(e.to_string()))?;
        Self::open_at(dir.join("inboxsync.db")).await
    }

    /// Migrates the file before the reader connection is opened.
    pub async fn open_at(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let writer = tokio_rusqlite::Connection::open(path).await?;
        Self::migrate(&writer).await?;

        let reader = tokio_rusqlite::Connection::open(path).await?;
        reader
            .call(|conn| conn.execute_batch(PRAGMAS))
            .await?;
        Ok(Self { writer, reader })
    }

    /// Throwaway database for tests. Both handles point at the same
    /// connection since a memory database is private to its connection.
    pub async fn open_memory() -> Result<Self> {
        let conn = tokio_rusqlite::Connection::open_in_memory().await?;
        Self::migrate(&conn).await?;
        Ok(Self {
            reader: conn.clone(),
            writer: conn,
        })
    }

    async fn migrate(conn: &tokio_rusqlite::Connection) -> Result<()> {
        conn.call(|conn| {
            conn.execute_batch(PRAGMAS).map_err(|e| e.to_string())?;
            migrations().to_latest(conn).map_err(|e| e.to_string())
        })
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    pub fn writer(&self) -> &tokio_rusqlite::Connection {
        &self.writer
    }

    pub fn reader(&self) -> &tokio_rusqlite::Connection {
        &self.reader
    }
}
