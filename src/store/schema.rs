//! Per-session persisted schema (§6.2) and the schema migrator (§4.9).

use crate::error::{Error, Result};
use rusqlite::Connection;

/// Current schema version written by fresh stores.
pub const LATEST_VERSION: i64 = 3;

pub const CREATE_META: &str = "
CREATE TABLE IF NOT EXISTS meta (
    name TEXT NOT NULL,
    platform TEXT NOT NULL,
    type TEXT NOT NULL,
    imported_at INTEGER NOT NULL,
    group_id TEXT,
    group_avatar TEXT
)";

pub const CREATE_MEMBER: &str = "
CREATE TABLE IF NOT EXISTS member (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    platform_id TEXT NOT NULL UNIQUE,
    account_name TEXT NOT NULL,
    group_nickname TEXT,
    aliases TEXT NOT NULL DEFAULT '[]',
    avatar TEXT
)";

pub const CREATE_NAME_HISTORY: &str = "
CREATE TABLE IF NOT EXISTS member_name_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    member_id INTEGER NOT NULL REFERENCES member(id),
    name_type TEXT NOT NULL,
    name TEXT NOT NULL,
    start_ts INTEGER NOT NULL,
    end_ts INTEGER
)";

pub const CREATE_MESSAGE: &str = "
CREATE TABLE IF NOT EXISTS message (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    sender_id INTEGER NOT NULL REFERENCES member(id),
    sender_account_name TEXT NOT NULL,
    sender_group_nickname TEXT,
    ts INTEGER NOT NULL,
    type INTEGER NOT NULL,
    content TEXT
)";

pub const CREATE_SESSION_INDEX: &str = "
CREATE TABLE IF NOT EXISTS session_index (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    start_ts INTEGER NOT NULL,
    end_ts INTEGER NOT NULL,
    message_count INTEGER NOT NULL,
    first_message_id INTEGER NOT NULL
)";

pub const CREATE_SESSION_INDEX_META: &str = "
CREATE TABLE IF NOT EXISTS session_index_meta (
    gap_threshold INTEGER NOT NULL
)";

pub const CREATE_SCHEMA_VERSION: &str = "
CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)";

const IDX_MESSAGE_TS: &str = "CREATE INDEX IF NOT EXISTS idx_message_ts ON message(ts)";
const IDX_MESSAGE_SENDER: &str =
    "CREATE INDEX IF NOT EXISTS idx_message_sender_id ON message(sender_id)";
const IDX_NAME_HISTORY_MEMBER: &str =
    "CREATE INDEX IF NOT EXISTS idx_member_name_history_member_id ON member_name_history(member_id)";

/// Create a fresh store's tables, deliberately without secondary indexes
/// (§4.4 step 3: "creates the store without secondary indexes").
pub fn create_base_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(&format!(
        "{CREATE_META};
         {CREATE_MEMBER};
         {CREATE_NAME_HISTORY};
         {CREATE_MESSAGE};
         {CREATE_SESSION_INDEX};
         {CREATE_SESSION_INDEX_META};
         {CREATE_SCHEMA_VERSION};"
    ))?;
    conn.execute(
        "INSERT INTO schema_version (version) SELECT ?1 WHERE NOT EXISTS (SELECT 1 FROM schema_version)",
        [LATEST_VERSION],
    )?;
    Ok(())
}

/// Create the three secondary indexes named in §4.4 step 5 / §6.2.
pub fn create_secondary_indexes(conn: &Connection) -> Result<()> {
    conn.execute_batch(&format!("{IDX_MESSAGE_TS}; {IDX_MESSAGE_SENDER}; {IDX_NAME_HISTORY_MEMBER};"))?;
    Ok(())
}

pub fn current_version(conn: &Connection) -> Result<i64> {
    let has_table: bool = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version'",
            [],
            |_| Ok(true),
        )
        .unwrap_or(false);
    if !has_table {
        return Ok(0);
    }
    let v: Option<i64> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |r| r.get(0))
        .ok();
    Ok(v.unwrap_or(0))
}

/// One ordered migration step (§4.9).
pub struct Migration {
    pub from: i64,
    pub to: i64,
    pub description: &'static str,
    pub apply: fn(&Connection) -> Result<()>,
}

pub fn migrations() -> Vec<Migration> {
    vec![
        Migration {
            from: 1,
            to: 2,
            description: "add member.aliases column",
            apply: |conn| {
                add_column_if_absent(conn, "member", "aliases", "TEXT NOT NULL DEFAULT '[]'")
            },
        },
        Migration {
            from: 2,
            to: 3,
            description: "add member.avatar and meta.group_avatar columns",
            apply: |conn| {
                add_column_if_absent(conn, "member", "avatar", "TEXT")?;
                add_column_if_absent(conn, "meta", "group_avatar", "TEXT")
            },
        },
    ]
}

/// Idempotent soft-migration helper used both by the ordered migrations
/// above and by lazy per-session checks (§4.9).
pub fn add_column_if_absent(conn: &Connection, table: &str, column: &str, decl: &str) -> Result<()> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let exists = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .filter_map(|r| r.ok())
        .any(|name| name == column);
    drop(stmt);
    if !exists {
        conn.execute(&format!("ALTER TABLE {table} ADD COLUMN {column} {decl}"), [])?;
    }
    Ok(())
}

/// Runs every pending migration for a store in a single transaction,
/// advancing the recorded version (§4.9).
pub fn run_pending(conn: &mut Connection) -> Result<Vec<&'static str>> {
    let mut applied = Vec::new();
    let tx = conn.transaction()?;
    let mut version = current_version(&tx)?;
    if version == 0 {
        // Pre-versioned store: treat as v1, the first version that had
        // explicit migrations recorded.
        version = 1;
        tx.execute("INSERT OR REPLACE INTO schema_version (version) VALUES (1)", [])
            .map_err(Error::from)?;
    }
    for m in migrations() {
        if m.from == version {
            (m.apply)(&tx)?;
            tx.execute("UPDATE schema_version SET version = ?1", [m.to])?;
            version = m.to;
            applied.push(m.description);
        }
    }
    tx.commit()?;
    Ok(applied)
}

/// Pending migration descriptions without applying them (§4.9, startup report).
pub fn pending_descriptions(conn: &Connection) -> Result<Vec<&'static str>> {
    let version = current_version(conn)?.max(1);
    Ok(migrations()
        .into_iter()
        .filter(|m| m.from >= version)
        .map(|m| m.description)
        .collect())
}
