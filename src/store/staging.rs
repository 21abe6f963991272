//! Staging store (§3 "Staging record", §4.6): a per-source temporary
//! store used only during merge, with a minimal schema — no monotone id
//! semantics, no sender join (messages carry the sender's platform id
//! directly).

use crate::error::{Error, Result};
use rusqlite::Connection;
use std::path::{Path, PathBuf};

const CREATE_META: &str = "
CREATE TABLE IF NOT EXISTS meta (
    name TEXT NOT NULL,
    platform TEXT NOT NULL,
    type TEXT NOT NULL
)";

const CREATE_MEMBER: &str = "
CREATE TABLE IF NOT EXISTS member (
    platform_id TEXT PRIMARY KEY,
    account_name TEXT NOT NULL,
    group_nickname TEXT,
    avatar TEXT
)";

const CREATE_MESSAGE: &str = "
CREATE TABLE IF NOT EXISTS message (
    ts INTEGER NOT NULL,
    sender_platform_id TEXT NOT NULL,
    sender_account_name TEXT NOT NULL,
    sender_group_nickname TEXT,
    type INTEGER NOT NULL,
    content TEXT
)";

pub struct StagingStore {
    pub conn: Connection,
    pub path: PathBuf,
}

impl StagingStore {
    pub fn create_new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // Staging stores are ephemeral; a prior crash can leave one behind
        // (swept at startup per §5, but merge may also be invoked without
        // a fresh sweep in test harnesses), so always start clean.
        let _ = crate::paths::remove_with_sidecars(path);
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        conn.execute_batch(&format!("{CREATE_META}; {CREATE_MEMBER}; {CREATE_MESSAGE};"))?;
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    pub fn open_existing(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::NotFound(format!(
                "staging store not found: {}",
                path.display()
            )));
        }
        let conn = Connection::open(path)?;
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    pub fn platform(&self) -> Result<String> {
        self.conn
            .query_row("SELECT platform FROM meta LIMIT 1", [], |r| r.get(0))
            .map_err(Error::from)
    }
}

impl Drop for StagingStore {
    fn drop(&mut self) {
        // Staging stores are deleted on application start and after merge
        // completion (§3); dropping the handle does not delete the file —
        // deletion is explicit via `paths::remove_with_sidecars` so a
        // caller inspecting a failed merge can still find the file.
    }
}
