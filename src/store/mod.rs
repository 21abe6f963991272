//! Embedded relational store: one file per session (§3 Persistence),
//! opened with the journaling discipline described in §5.

pub mod schema;
pub mod staging;

use crate::error::{Error, Result};
use rusqlite::Connection;
use std::path::{Path, PathBuf};

/// A handle to one session's sqlite file.
pub struct Store {
    pub conn: Connection,
    pub path: PathBuf,
}

impl Store {
    /// Create a brand-new session store without secondary indexes
    /// (§4.4 step 3).
    pub fn create_new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        configure_for_import(&conn)?;
        schema::create_base_schema(&conn)?;
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    /// Open an existing store for reads (§5: "WAL for reads").
    pub fn open_for_read(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        configure_for_read(&conn)?;
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    /// Open an existing store allowing writes (used by migration/rename/
    /// member mutation operations).
    pub fn open_for_write(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        configure_for_read(&conn)?;
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    /// Truncate the write-ahead log (§4.4 step 4/5, §5).
    pub fn checkpoint(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")
            .map_err(Error::from)
    }

    pub fn require_current_schema(&self) -> Result<()> {
        let v = schema::current_version(&self.conn)?;
        if v < schema::LATEST_VERSION && v != 0 {
            return Err(Error::MigrationRequired {
                path: self.path.clone(),
                current: v,
                latest: schema::LATEST_VERSION,
            });
        }
        Ok(())
    }
}

/// NORMAL sync + WAL during bulk import, per §5.
fn configure_for_import(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA foreign_keys = ON;",
    )?;
    Ok(())
}

fn configure_for_read(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;",
    )?;
    Ok(())
}
