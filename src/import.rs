//! Import pipeline (§4.4) and incremental import (§4.5).

use crate::error::{Error, Result};
use crate::format::registry::Registry;
use crate::format::{ParserEvent, RawMember, RawMessage, RawSessionMeta, StreamParser, sniffer};
use crate::model::{MessageType, NameKind};
use crate::nickname::NicknameTracker;
use crate::paths::{AppPaths, remove_with_sidecars};
use crate::store::staging::StagingStore;
use crate::store::{Store, schema};
use rusqlite::Connection;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Commit cadence during bulk import (§4.4 step 4).
pub const COMMIT_EVERY: u64 = 50_000;
/// WAL checkpoint cadence during bulk import (§4.4 step 4).
pub const CHECKPOINT_EVERY: u64 = 200_000;

#[derive(Debug, Clone)]
pub enum ImportProgress {
    Stage(&'static str),
    Progress {
        bytes_read: u64,
        total_bytes: u64,
        percentage: u8,
        messages_processed: u64,
    },
}

#[derive(Debug, Clone, Default)]
pub struct ImportCounts {
    pub total_messages: u64,
    pub dropped_messages: u64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ImportOutcome {
    pub session_id: String,
    pub total_messages: u64,
    pub dropped_messages: u64,
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct IncrementalOutcome {
    pub new: u64,
    pub duplicate: u64,
    pub total: u64,
}

/// `chat_<wall-ms>_<random-6>` (§4.4 step 3).
pub fn allocate_session_id() -> String {
    let wall_ms = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let random = &uuid::Uuid::new_v4().simple().to_string()[..6];
    format!("chat_{wall_ms}_{random}")
}

fn now_seconds() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn percent(bytes_read: u64, total_bytes: u64) -> u8 {
    if total_bytes == 0 {
        100
    } else {
        (100 * bytes_read.min(total_bytes) / total_bytes) as u8
    }
}

pub struct ImportPipeline<'a> {
    registry: &'a Registry,
    paths: &'a AppPaths,
}

impl<'a> ImportPipeline<'a> {
    pub fn new(registry: &'a Registry, paths: &'a AppPaths) -> Self {
        Self { registry, paths }
    }

    /// Runs the full import pipeline (§4.4) and returns the new session's
    /// id, or a cleaned-up error on any failure (step 6). `timeout`, if
    /// set, bounds the whole import's wall-clock time the same way
    /// [`crate::query::QueryLayer::execute_sql`] bounds a raw query.
    pub fn import(
        &self,
        source: &Path,
        abort: Option<&Arc<AtomicBool>>,
        timeout: Option<Duration>,
        on_progress: &mut dyn FnMut(ImportProgress),
    ) -> Result<ImportOutcome> {
        on_progress(ImportProgress::Stage("detect"));
        let format_id = sniffer::sniff_or_error(source, self.registry)?;
        let descriptor = self
            .registry
            .get(format_id)
            .expect("sniffed format id must be registered");

        let size = std::fs::metadata(source)?.len();
        let mut parse_path = source.to_path_buf();
        let mut preprocessed_path: Option<PathBuf> = None;
        if let Some(pre) = &descriptor.preprocessor
            && pre.needs_preprocess(source, size)
        {
            on_progress(ImportProgress::Stage("preprocess"));
            let temp_dir = self.paths.temp_dir();
            let out = pre.preprocess(source, &temp_dir, &mut |read, total| {
                on_progress(ImportProgress::Progress {
                    bytes_read: read,
                    total_bytes: total,
                    percentage: percent(read, total),
                    messages_processed: 0,
                });
            })?;
            preprocessed_path = Some(out.clone());
            parse_path = out;
        }

        let session_id = allocate_session_id();
        let db_path = self.paths.session_db_path(&session_id);

        let result = run_import(
            &db_path,
            &parse_path,
            descriptor.parser.as_ref(),
            abort,
            timeout,
            on_progress,
        );

        if let Some(tmp) = preprocessed_path {
            let _ = std::fs::remove_file(tmp);
        }

        match result {
            Ok(counts) => Ok(ImportOutcome {
                session_id,
                total_messages: counts.total_messages,
                dropped_messages: counts.dropped_messages,
            }),
            Err(e) => {
                let _ = remove_with_sidecars(&db_path);
                Err(e)
            }
        }
    }

    /// Stages `source` (§4.5, §4.6 step 1) for either incremental import
    /// or merge.
    pub fn stage(&self, source: &Path, staging_name: &str) -> Result<StagingStore> {
        let staging_path = self.paths.staging_db_path(staging_name);
        stage_source(source, self.registry, &staging_path)
    }

    /// `(new, duplicate, total)` without writing (§4.5).
    pub fn analyze_incremental(
        &self,
        session_store: &Store,
        staging: &StagingStore,
        timeout: Option<Duration>,
    ) -> Result<IncrementalOutcome> {
        analyze_incremental(session_store, staging, timeout)
    }

    /// Copies only messages absent from the session (§4.5), preserving
    /// monotone ids, and rebuilds nickname history for touched members.
    pub fn incremental_import(
        &self,
        session_store: &mut Store,
        staging: &StagingStore,
        timeout: Option<Duration>,
    ) -> Result<IncrementalOutcome> {
        incremental_import(session_store, staging, timeout)
    }
}

/// Drives a format's parser events into a freshly-created staging store
/// (§4.6 step 1), shared by incremental import and the merger.
pub fn stage_source(source: &Path, registry: &Registry, staging_path: &Path) -> Result<StagingStore> {
    let format_id = sniffer::sniff_or_error(source, registry)?;
    let descriptor = registry
        .get(format_id)
        .expect("sniffed format id must be registered");

    let size = std::fs::metadata(source)?.len();
    let mut parse_path = source.to_path_buf();
    let mut preprocessed_path: Option<PathBuf> = None;
    if let Some(pre) = &descriptor.preprocessor
        && pre.needs_preprocess(source, size)
    {
        let temp_dir = staging_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(std::env::temp_dir);
        let out = pre.preprocess(source, &temp_dir, &mut |_, _| {})?;
        preprocessed_path = Some(out.clone());
        parse_path = out;
    }

    let staging = StagingStore::create_new(staging_path)?;
    let result = (|| -> Result<()> {
        let conn = &staging.conn;
        let mut meta_written = false;
        let mut on_event = |event: ParserEvent| match event {
            ParserEvent::Meta(meta) => {
                if !meta_written {
                    let _ = insert_staging_meta(conn, &meta);
                    meta_written = true;
                }
            }
            ParserEvent::Members(members) => {
                for m in &members {
                    let _ = upsert_staging_member(conn, m);
                }
            }
            ParserEvent::Messages(batch) => {
                for raw in &batch {
                    let _ = insert_staging_message(conn, raw);
                }
            }
            ParserEvent::Progress { .. } | ParserEvent::Done { .. } | ParserEvent::Error(_) => {}
        };
        descriptor
            .parser
            .parse(&parse_path, crate::format::DEFAULT_BATCH_SIZE, &mut on_event)
    })();

    if let Some(tmp) = preprocessed_path {
        let _ = std::fs::remove_file(tmp);
    }
    result?;
    Ok(staging)
}

fn insert_staging_meta(conn: &Connection, meta: &RawSessionMeta) -> Result<()> {
    conn.execute(
        "INSERT INTO meta (name, platform, type) VALUES (?1, ?2, ?3)",
        rusqlite::params![meta.name, meta.platform.as_str(), meta.kind.as_str()],
    )?;
    Ok(())
}

fn upsert_staging_member(conn: &Connection, m: &RawMember) -> Result<()> {
    conn.execute(
        "INSERT INTO member (platform_id, account_name, group_nickname, avatar) VALUES (?1,?2,?3,?4)
         ON CONFLICT(platform_id) DO UPDATE SET
            account_name = excluded.account_name,
            group_nickname = COALESCE(excluded.group_nickname, member.group_nickname),
            avatar = COALESCE(excluded.avatar, member.avatar)",
        rusqlite::params![m.platform_id, m.account_name, m.group_nickname, m.avatar],
    )?;
    Ok(())
}

fn insert_staging_message(conn: &Connection, raw: &RawMessage) -> Result<()> {
    let (Some(sender), Some(ts)) = (raw.sender_platform_id.as_deref(), raw.ts) else {
        return Ok(());
    };
    if !MessageType::is_known(raw.msg_type_raw) {
        return Ok(());
    }
    conn.execute(
        "INSERT INTO message (ts, sender_platform_id, sender_account_name, sender_group_nickname, type, content)
         VALUES (?1,?2,?3,?4,?5,?6)",
        rusqlite::params![
            ts,
            sender,
            raw.sender_account_name,
            raw.sender_group_nickname,
            raw.msg_type_raw,
            raw.content
        ],
    )?;
    Ok(())
}

fn run_import(
    db_path: &Path,
    parse_path: &Path,
    parser: &dyn StreamParser,
    abort: Option<&Arc<AtomicBool>>,
    timeout: Option<Duration>,
    on_progress: &mut dyn FnMut(ImportProgress),
) -> Result<ImportCounts> {
    let store = Store::create_new(db_path)?;
    on_progress(ImportProgress::Stage("import"));

    // `store` is a fresh connection scoped to this function and dropped
    // with it on every exit path, so the handler never needs clearing
    // (unlike the cached, long-lived connections behind `analyze_incremental`
    // and `incremental_import`).
    if let Some(timeout) = timeout {
        let start = Instant::now();
        let _ = store.conn.progress_handler(1000, Some(move || start.elapsed() > timeout));
    }

    let mut member_ids: HashMap<String, i64> = HashMap::new();
    let mut nickname = NicknameTracker::new();
    let mut total_messages: u64 = 0;
    let mut dropped_messages: u64 = 0;
    let mut since_commit: u64 = 0;
    let mut since_checkpoint: u64 = 0;
    let mut in_transaction = false;
    let mut cancelled = false;
    let mut soft_error: Option<Error> = None;

    let parse_result = {
        let conn = &store.conn;
        let mut on_event = |event: ParserEvent| {
            if cancelled || soft_error.is_some() {
                return;
            }
            match event {
                ParserEvent::Meta(meta) => {
                    if let Err(e) = insert_meta(conn, &meta) {
                        soft_error = Some(e);
                    }
                }
                ParserEvent::Members(members) => {
                    if !in_transaction {
                        if let Err(e) = conn.execute_batch("BEGIN") {
                            soft_error = Some(e.into());
                            return;
                        }
                        in_transaction = true;
                    }
                    for m in &members {
                        if let Err(e) = upsert_member(conn, m) {
                            soft_error = Some(e);
                            return;
                        }
                        if let Ok(id) = member_id_of(conn, &m.platform_id) {
                            member_ids.insert(m.platform_id.clone(), id);
                        }
                    }
                }
                ParserEvent::Messages(batch) => {
                    if abort.is_some_and(|a| a.load(Ordering::SeqCst)) {
                        cancelled = true;
                        return;
                    }
                    if !in_transaction {
                        if let Err(e) = conn.execute_batch("BEGIN") {
                            soft_error = Some(e.into());
                            return;
                        }
                        in_transaction = true;
                    }
                    let batch_len = batch.len() as u64;
                    for raw in &batch {
                        match process_message(conn, &mut member_ids, &mut nickname, raw) {
                            Ok(true) => total_messages += 1,
                            Ok(false) => dropped_messages += 1,
                            Err(e) => {
                                soft_error = Some(e);
                                return;
                            }
                        }
                    }
                    since_commit += batch_len;
                    since_checkpoint += batch_len;
                    if since_commit >= COMMIT_EVERY {
                        if let Err(e) = conn.execute_batch("COMMIT") {
                            soft_error = Some(e.into());
                            return;
                        }
                        in_transaction = false;
                        since_commit = 0;
                    }
                    if since_checkpoint >= CHECKPOINT_EVERY && !in_transaction {
                        if let Err(e) = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);") {
                            soft_error = Some(e.into());
                            return;
                        }
                        since_checkpoint = 0;
                    }
                }
                ParserEvent::Progress {
                    bytes_read,
                    total_bytes,
                    percentage,
                } => {
                    on_progress(ImportProgress::Progress {
                        bytes_read,
                        total_bytes,
                        percentage,
                        messages_processed: total_messages,
                    });
                }
                ParserEvent::Done { .. } => {}
                ParserEvent::Error(msg) => {
                    soft_error = Some(Error::Parse(msg));
                }
            }
        };
        parser.parse(parse_path, crate::format::DEFAULT_BATCH_SIZE, &mut on_event)
    };

    if let Some(e) = soft_error {
        if in_transaction {
            let _ = store.conn.execute_batch("ROLLBACK");
        }
        return Err(e);
    }
    if cancelled {
        if in_transaction {
            let _ = store.conn.execute_batch("ROLLBACK");
        }
        return Err(Error::Cancelled);
    }
    if let Err(e) = parse_result {
        if in_transaction {
            let _ = store.conn.execute_batch("ROLLBACK");
        }
        return Err(e);
    }
    if in_transaction {
        store.conn.execute_batch("COMMIT")?;
    }

    on_progress(ImportProgress::Stage("finalize"));
    compact_all_nicknames(&store.conn, &member_ids, &nickname)?;
    schema::create_secondary_indexes(&store.conn)?;
    store.checkpoint()?;
    on_progress(ImportProgress::Stage("done"));

    Ok(ImportCounts {
        total_messages,
        dropped_messages,
    })
}

fn insert_meta(conn: &Connection, meta: &RawSessionMeta) -> Result<()> {
    conn.execute(
        "INSERT INTO meta (name, platform, type, imported_at, group_id, group_avatar) VALUES (?1,?2,?3,?4,?5,?6)",
        rusqlite::params![
            meta.name,
            meta.platform.as_str(),
            meta.kind.as_str(),
            now_seconds(),
            meta.group_id,
            meta.group_avatar
        ],
    )?;
    Ok(())
}

fn upsert_member(conn: &Connection, m: &RawMember) -> Result<()> {
    conn.execute(
        "INSERT INTO member (platform_id, account_name, group_nickname, avatar) VALUES (?1,?2,?3,?4)
         ON CONFLICT(platform_id) DO UPDATE SET
            account_name = excluded.account_name,
            group_nickname = COALESCE(excluded.group_nickname, member.group_nickname),
            avatar = COALESCE(excluded.avatar, member.avatar)",
        rusqlite::params![m.platform_id, m.account_name, m.group_nickname, m.avatar],
    )?;
    Ok(())
}

fn member_id_of(conn: &Connection, platform_id: &str) -> Result<i64> {
    conn.query_row(
        "SELECT id FROM member WHERE platform_id = ?1",
        [platform_id],
        |r| r.get(0),
    )
    .map_err(Error::from)
}

fn insert_avatarless_member(conn: &Connection, platform_id: &str, account_name: &str) -> Result<i64> {
    conn.execute(
        "INSERT INTO member (platform_id, account_name) VALUES (?1, ?2)
         ON CONFLICT(platform_id) DO NOTHING",
        rusqlite::params![platform_id, account_name],
    )?;
    member_id_of(conn, platform_id)
}

/// Drops messages with a missing sender id, missing timestamp, or
/// unknown type (§4.4 step 4); inserts members first seen through
/// messages as avatar-less rows; records the sighting in the in-memory
/// nickname tracker.
fn process_message(
    conn: &Connection,
    member_ids: &mut HashMap<String, i64>,
    nickname: &mut NicknameTracker,
    raw: &RawMessage,
) -> Result<bool> {
    let Some(sender_platform_id) = raw.sender_platform_id.as_deref() else {
        return Ok(false);
    };
    let Some(ts) = raw.ts else {
        return Ok(false);
    };
    if !MessageType::is_known(raw.msg_type_raw) {
        return Ok(false);
    }

    let sender_id = match member_ids.get(sender_platform_id) {
        Some(id) => *id,
        None => {
            let id = insert_avatarless_member(conn, sender_platform_id, &raw.sender_account_name)?;
            member_ids.insert(sender_platform_id.to_string(), id);
            id
        }
    };

    conn.execute(
        "INSERT INTO message (sender_id, sender_account_name, sender_group_nickname, ts, type, content)
         VALUES (?1,?2,?3,?4,?5,?6)",
        rusqlite::params![
            sender_id,
            raw.sender_account_name,
            raw.sender_group_nickname,
            ts,
            raw.msg_type_raw,
            raw.content
        ],
    )?;

    nickname.observe(sender_platform_id, NameKind::AccountName, &raw.sender_account_name, ts);
    if let Some(nick) = &raw.sender_group_nickname {
        nickname.observe(sender_platform_id, NameKind::GroupNickname, nick, ts);
    }
    Ok(true)
}

/// Compacts every touched member's nickname history in a single
/// transaction (§4.4 step 5) and updates the member row's current name.
fn compact_all_nicknames(
    conn: &Connection,
    member_ids: &HashMap<String, i64>,
    nickname: &NicknameTracker,
) -> Result<()> {
    conn.execute_batch("BEGIN")?;
    let result = (|| -> Result<()> {
        for kind in [NameKind::AccountName, NameKind::GroupNickname] {
            for platform_id in nickname.platform_ids(kind) {
                let Some(&member_id) = member_ids.get(&platform_id) else {
                    continue;
                };
                for entry in nickname.compact(&platform_id, kind) {
                    conn.execute(
                        "INSERT INTO member_name_history (member_id, name_type, name, start_ts, end_ts)
                         VALUES (?1,?2,?3,?4,?5)",
                        rusqlite::params![member_id, kind.column(), entry.name, entry.start_ts, entry.end_ts],
                    )?;
                }
                if let Some(current) = nickname.current_name(&platform_id, kind) {
                    let column = kind.column();
                    conn.execute(
                        &format!("UPDATE member SET {column} = ?1 WHERE id = ?2"),
                        rusqlite::params![current, member_id],
                    )?;
                }
            }
        }
        Ok(())
    })();
    match result {
        Ok(()) => {
            conn.execute_batch("COMMIT")?;
            Ok(())
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

type DedupeKey = (i64, String, usize);

fn existing_dedupe_keys(session_store: &Store) -> Result<HashSet<DedupeKey>> {
    let mut keys = HashSet::new();
    let mut stmt = session_store.conn.prepare(
        "SELECT m.ts, mb.platform_id, LENGTH(m.content) FROM message m JOIN member mb ON mb.id = m.sender_id",
    )?;
    let rows = stmt.query_map([], |r| {
        Ok((
            r.get::<_, i64>(0)?,
            r.get::<_, String>(1)?,
            r.get::<_, Option<i64>>(2)?.unwrap_or(0) as usize,
        ))
    })?;
    for row in rows {
        keys.insert(row?);
    }
    Ok(keys)
}

fn analyze_incremental(
    session_store: &Store,
    staging: &StagingStore,
    timeout: Option<Duration>,
) -> Result<IncrementalOutcome> {
    // Unlike `run_import`'s fresh connection, `session_store` is pulled
    // from the worker's long-lived handle cache, so the handler must be
    // cleared before returning or it would bound every later call on the
    // same cached connection too.
    if let Some(timeout) = timeout {
        let start = Instant::now();
        let _ = session_store
            .conn
            .progress_handler(1000, Some(move || start.elapsed() > timeout));
    }
    let result = (|| -> Result<IncrementalOutcome> {
        let existing = existing_dedupe_keys(session_store)?;
        let mut outcome = IncrementalOutcome::default();
        let mut stmt = staging
            .conn
            .prepare("SELECT ts, sender_platform_id, LENGTH(content) FROM message")?;
        let rows = stmt.query_map([], |r| {
            Ok((
                r.get::<_, i64>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, Option<i64>>(2)?.unwrap_or(0) as usize,
            ))
        })?;
        for row in rows {
            let key = row?;
            outcome.total += 1;
            if existing.contains(&key) {
                outcome.duplicate += 1;
            } else {
                outcome.new += 1;
            }
        }
        Ok(outcome)
    })();
    if timeout.is_some() {
        let _ = session_store.conn.progress_handler(0, None::<fn() -> bool>);
    }
    result
}

fn incremental_import(
    session_store: &mut Store,
    staging: &StagingStore,
    timeout: Option<Duration>,
) -> Result<IncrementalOutcome> {
    if let Some(timeout) = timeout {
        let start = Instant::now();
        let _ = session_store
            .conn
            .progress_handler(1000, Some(move || start.elapsed() > timeout));
    }
    let result = (|| -> Result<IncrementalOutcome> {
        let mut existing = existing_dedupe_keys(session_store)?;
        let mut member_ids: HashMap<String, i64> = HashMap::new();
        {
            let mut stmt = session_store.conn.prepare("SELECT id, platform_id FROM member")?;
            let rows = stmt.query_map([], |r| Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?)))?;
            for row in rows {
                let (id, platform_id) = row?;
                member_ids.insert(platform_id, id);
            }
        }

        let mut staging_rows = Vec::new();
        {
            let mut stmt = staging.conn.prepare(
                "SELECT ts, sender_platform_id, sender_account_name, sender_group_nickname, type, content
                 FROM message ORDER BY ts",
            )?;
            let rows = stmt.query_map([], |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, Option<String>>(3)?,
                    r.get::<_, i64>(4)?,
                    r.get::<_, Option<String>>(5)?,
                ))
            })?;
            for row in rows {
                staging_rows.push(row?);
            }
        }

        let mut outcome = IncrementalOutcome::default();
        let mut touched: HashSet<String> = HashSet::new();

        session_store.conn.execute_batch("BEGIN")?;
        let insert_result = (|| -> Result<()> {
            for (ts, sender, account_name, nickname_name, msg_type, content) in staging_rows {
                outcome.total += 1;
                let len = content.as_deref().map(str::len).unwrap_or(0);
                let key = (ts, sender.clone(), len);
                if existing.contains(&key) {
                    outcome.duplicate += 1;
                    continue;
                }
                let sender_id = match member_ids.get(&sender) {
                    Some(id) => *id,
                    None => {
                        let id = insert_avatarless_member(&session_store.conn, &sender, &account_name)?;
                        member_ids.insert(sender.clone(), id);
                        id
                    }
                };
                session_store.conn.execute(
                    "INSERT INTO message (sender_id, sender_account_name, sender_group_nickname, ts, type, content)
                     VALUES (?1,?2,?3,?4,?5,?6)",
                    rusqlite::params![sender_id, account_name, nickname_name, ts, msg_type, content],
                )?;
                existing.insert(key);
                touched.insert(sender);
                outcome.new += 1;
            }
            Ok(())
        })();
        match insert_result {
            Ok(()) => session_store.conn.execute_batch("COMMIT")?,
            Err(e) => {
                let _ = session_store.conn.execute_batch("ROLLBACK");
                return Err(e);
            }
        }

        if !touched.is_empty() {
            rebuild_nickname_history(session_store, &touched)?;
        }
        crate::query::session_index::invalidate(&session_store.conn)?;

        Ok(outcome)
    })();
    if timeout.is_some() {
        let _ = session_store.conn.progress_handler(0, None::<fn() -> bool>);
    }
    result
}

/// Rebuilds nickname history from scratch for a set of members whose
/// messages changed, rather than trying to splice new observations into
/// an already-compacted history (§4.5 "preserving session monotone ids").
fn rebuild_nickname_history(store: &Store, platform_ids: &HashSet<String>) -> Result<()> {
    store.conn.execute_batch("BEGIN")?;
    let result = (|| -> Result<()> {
        for platform_id in platform_ids {
            let member_id: i64 = store.conn.query_row(
                "SELECT id FROM member WHERE platform_id = ?1",
                [platform_id],
                |r| r.get(0),
            )?;
            let mut tracker = NicknameTracker::new();
            {
                let mut stmt = store.conn.prepare(
                    "SELECT ts, sender_account_name, sender_group_nickname FROM message
                     WHERE sender_id = ?1 ORDER BY ts",
                )?;
                let rows = stmt.query_map([member_id], |r| {
                    Ok((
                        r.get::<_, i64>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, Option<String>>(2)?,
                    ))
                })?;
                for row in rows {
                    let (ts, account_name, nick) = row?;
                    tracker.observe(platform_id, NameKind::AccountName, &account_name, ts);
                    if let Some(n) = nick {
                        tracker.observe(platform_id, NameKind::GroupNickname, &n, ts);
                    }
                }
            }
            store
                .conn
                .execute("DELETE FROM member_name_history WHERE member_id = ?1", [member_id])?;
            for kind in [NameKind::AccountName, NameKind::GroupNickname] {
                for entry in tracker.compact(platform_id, kind) {
                    store.conn.execute(
                        "INSERT INTO member_name_history (member_id, name_type, name, start_ts, end_ts)
                         VALUES (?1,?2,?3,?4,?5)",
                        rusqlite::params![member_id, kind.column(), entry.name, entry.start_ts, entry.end_ts],
                    )?;
                }
                if let Some(current) = tracker.current_name(platform_id, kind) {
                    let column = kind.column();
                    store.conn.execute(
                        &format!("UPDATE member SET {column} = ?1 WHERE id = ?2"),
                        rusqlite::params![current, member_id],
                    )?;
                }
            }
        }
        Ok(())
    })();
    match result {
        Ok(()) => {
            store.conn.execute_batch("COMMIT")?;
            Ok(())
        }
        Err(e) => {
            let _ = store.conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}
