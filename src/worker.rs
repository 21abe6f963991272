//! Worker host (§4.8, §5): a single dedicated execution context that owns
//! every open store, dispatches typed requests, and streams progress.

use crate::error::{Error, ErrorPayload, Result};
use crate::format::registry::Registry;
use crate::format::sniffer;
use crate::import::{ImportOutcome, ImportPipeline, ImportProgress, IncrementalOutcome, stage_source};
use crate::merge::{ConflictReport, MergeOutcome, Merger};
use crate::model::{ConversationKind, Filter, Member, NameHistoryEntry, Platform};
use crate::paths::AppPaths;
use crate::query::QueryLayer;
use crate::query::session_index;
use crate::store::Store;
use crate::store::schema;
use crate::store::staging::StagingStore;
use crossbeam_channel::{Receiver, Sender};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread::JoinHandle;

/// Bound on the open-handle cache (§4.8b, §9 "bounded mapping").
const MAX_OPEN_HANDLES: usize = 16;
/// Default timeout for everything but import/incremental import (§4.8).
pub const SHORT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);
/// Default timeout for long-running import requests (§4.8).
pub const LONG_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOp {
    AvailableYears,
    MemberActivity,
    Hourly,
    Daily,
    Weekday,
    Monthly,
    Yearly,
    LengthDistribution,
    TypeDistribution,
    TimeRange,
    Repeat,
    Catchphrase,
    NightOwl,
    DragonKing,
    Diving,
    Monologue,
    Mention,
    MentionGraph,
    Laugh,
    MemeBattle,
    CheckIn,
}

#[derive(Debug, Clone)]
pub enum Operation {
    ImportStream {
        source: PathBuf,
    },
    ImportAnalyzeIncremental {
        session_id: String,
        source: PathBuf,
    },
    ImportIncremental {
        session_id: String,
        source: PathBuf,
    },
    ImportParseFileInfo {
        source: PathBuf,
    },

    SessionGetAll,
    SessionList,
    SessionGet {
        session_id: String,
    },
    SessionRename {
        session_id: String,
        name: String,
    },
    SessionDelete {
        session_id: String,
    },
    SessionUpdateOwnerId {
        session_id: String,
        owner_member_id: Option<i64>,
    },
    SessionUpdateGapThreshold {
        session_id: String,
        gap_threshold: i64,
    },
    SessionGenerateIndex {
        session_id: String,
        gap_threshold: Option<i64>,
    },
    SessionHasIndex {
        session_id: String,
    },
    SessionIndexStats {
        session_id: String,
    },
    SessionClearIndex {
        session_id: String,
    },

    MemberList {
        session_id: String,
    },
    MemberUpdateAliases {
        session_id: String,
        member_id: i64,
        aliases: Vec<String>,
    },
    MemberDelete {
        session_id: String,
        member_id: i64,
    },
    MemberNameHistory {
        session_id: String,
        member_id: i64,
    },

    Query {
        session_id: String,
        filter: Filter,
        op: QueryOp,
    },

    MsgSearch {
        session_id: String,
        filter: Filter,
        keywords: Vec<String>,
        limit: usize,
    },
    MsgContext {
        session_id: String,
        seed_ids: Vec<i64>,
        k: i64,
    },
    MsgRecent {
        session_id: String,
        filter: Filter,
        limit: usize,
    },
    MsgAllRecent {
        session_ids: Vec<String>,
        filter: Filter,
        limit: usize,
    },
    MsgBetween {
        session_id: String,
        filter: Filter,
        start_id: i64,
        end_id: i64,
    },
    MsgBefore {
        session_id: String,
        filter: Filter,
        cursor_id: i64,
        limit: usize,
        sender_id: Option<i64>,
        keywords: Vec<String>,
    },
    MsgAfter {
        session_id: String,
        filter: Filter,
        cursor_id: i64,
        limit: usize,
        sender_id: Option<i64>,
        keywords: Vec<String>,
    },
    MsgFilterWithContext {
        session_id: String,
        filter: Filter,
        keywords: Vec<String>,
        k: i64,
    },
    MsgFromSessions {
        session_ids: Vec<String>,
        filter: Filter,
        limit: usize,
    },

    SqlExecute {
        session_id: String,
        sql: String,
        row_limit: usize,
    },
    SqlSchema {
        session_id: String,
    },

    MergeParseFileInfo {
        source: PathBuf,
    },
    MergeCheckConflicts {
        merge_id: String,
        sources: Vec<PathBuf>,
    },
    MergeMergeFiles {
        merge_id: String,
        sources: Vec<PathBuf>,
        group_name: String,
        output_path: PathBuf,
        reimport: bool,
    },
    MergeClearCache,

    MigrationCheck,
    MigrationRun,
}

pub struct Request {
    pub id: String,
    pub op: Operation,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub id: String,
    pub progress: ImportProgress,
}

pub enum WorkerMessage {
    Progress(ProgressEvent),
    Response {
        id: String,
        result: std::result::Result<serde_json::Value, ErrorPayload>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub name: String,
    pub platform: Platform,
    pub kind: ConversationKind,
    pub imported_at: i64,
    pub group_id: Option<String>,
    pub message_count: i64,
    pub member_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileInfo {
    pub format_id: String,
    pub display_name: String,
    pub platform: Platform,
    pub size_bytes: u64,
    /// Sniffed container type of the raw bytes, as a diagnostic: exports
    /// are expected to come back `Some("text/plain")`-ish or `None`; a
    /// surprising hit (e.g. a zip or image signature) means the file
    /// isn't what its extension claims.
    pub mime_hint: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationStatus {
    pub session_id: String,
    pub current: i64,
    pub latest: i64,
    pub pending: Vec<&'static str>,
}

struct Job {
    request: Request,
    abort: Arc<AtomicBool>,
    outbound: Sender<WorkerMessage>,
}

fn touch(lru: &mut VecDeque<String>, session_id: &str) {
    lru.retain(|id| id != session_id);
    lru.push_back(session_id.to_string());
}

fn evict_lru_if_full(handles: &mut HashMap<String, Store>, lru: &mut VecDeque<String>) {
    while handles.len() >= MAX_OPEN_HANDLES {
        if let Some(oldest) = lru.pop_front() {
            handles.remove(&oldest);
        } else {
            break;
        }
    }
}

/// Free function (rather than a `&mut self` method) so callers can hold
/// it alongside a separate immutable borrow of another `HostState` field
/// in the same expression (§9 "bounded mapping" of open handles).
fn open_handle<'a>(
    handles: &'a mut HashMap<String, Store>,
    lru: &mut VecDeque<String>,
    paths: &AppPaths,
    session_id: &str,
) -> Result<&'a mut Store> {
    if !handles.contains_key(session_id) {
        evict_lru_if_full(handles, lru);
        let path = paths.session_db_path(session_id);
        let store = Store::open_for_read(&path)?;
        handles.insert(session_id.to_string(), store);
    }
    touch(lru, session_id);
    Ok(handles.get_mut(session_id).expect("just inserted"))
}

/// The off-thread executor (§4.8): owns the registry, the file layout, a
/// bounded open-handle cache, and in-flight staging stores for merges
/// awaiting `merge.mergeFiles`.
struct HostState {
    registry: Registry,
    paths: AppPaths,
    handles: HashMap<String, Store>,
    lru: VecDeque<String>,
    staged_merges: HashMap<String, Vec<StagingStore>>,
}

impl HostState {
    fn new(registry: Registry, paths: AppPaths) -> Self {
        Self {
            registry,
            paths,
            handles: HashMap::new(),
            lru: VecDeque::new(),
            staged_merges: HashMap::new(),
        }
    }

    /// Borrows only the `handles`/`lru`/`paths` fields, so callers that
    /// also need `&self.registry` alive across the same expression (the
    /// incremental-import operations) can take that borrow separately
    /// instead of going through a `&mut self` method.
    fn handle(&mut self, session_id: &str) -> Result<&mut Store> {
        open_handle(&mut self.handles, &mut self.lru, &self.paths, session_id)
    }

    /// Evicts the cached handle before the caller deletes files (§9
    /// "the worker's open-handle cache must not outlive a session delete").
    fn evict(&mut self, session_id: &str) {
        self.handles.remove(session_id);
        self.lru.retain(|id| id != session_id);
    }

    fn dispatch(
        &mut self,
        op: Operation,
        abort: &Arc<AtomicBool>,
        on_progress: &mut dyn FnMut(ImportProgress),
    ) -> Result<serde_json::Value> {
        match op {
            Operation::ImportStream { source } => {
                let pipeline = ImportPipeline::new(&self.registry, &self.paths);
                let outcome: ImportOutcome = pipeline.import(&source, Some(abort), Some(LONG_TIMEOUT), on_progress)?;
                to_value(&outcome)
            }
            Operation::ImportAnalyzeIncremental { session_id, source } => {
                let staging_path = self.paths.staging_db_path(&format!("analyze_{session_id}"));
                let staging = stage_source(&source, &self.registry, &staging_path)?;
                let store = open_handle(&mut self.handles, &mut self.lru, &self.paths, &session_id)?;
                let outcome = ImportPipeline::new(&self.registry, &self.paths).analyze_incremental(
                    store,
                    &staging,
                    Some(LONG_TIMEOUT),
                )?;
                let _ = crate::paths::remove_with_sidecars(&staging_path);
                to_value(&outcome)
            }
            Operation::ImportIncremental { session_id, source } => {
                let staging_path = self.paths.staging_db_path(&format!("incr_{session_id}"));
                let staging = stage_source(&source, &self.registry, &staging_path)?;
                let store = open_handle(&mut self.handles, &mut self.lru, &self.paths, &session_id)?;
                let outcome: IncrementalOutcome = ImportPipeline::new(&self.registry, &self.paths).incremental_import(
                    store,
                    &staging,
                    Some(LONG_TIMEOUT),
                )?;
                let _ = crate::paths::remove_with_sidecars(&staging_path);
                to_value(&outcome)
            }
            Operation::ImportParseFileInfo { source } => {
                let info = parse_file_info(&source, &self.registry)?;
                to_value(&info)
            }

            Operation::SessionGetAll | Operation::SessionList => {
                let summaries = list_sessions(&self.paths)?;
                to_value(&summaries)
            }
            Operation::SessionGet { session_id } => {
                let summary = session_summary(&self.paths, &session_id)?;
                to_value(&summary)
            }
            Operation::SessionRename { session_id, name } => {
                let store = self.handle(&session_id)?;
                store.conn.execute("UPDATE meta SET name = ?1", [&name])?;
                to_value(&true)
            }
            Operation::SessionDelete { session_id } => {
                self.evict(&session_id);
                self.paths.delete_session_files(&session_id).map_err(Error::Io)?;
                to_value(&true)
            }
            Operation::SessionUpdateOwnerId {
                session_id,
                owner_member_id,
            } => {
                let store = self.handle(&session_id)?;
                schema::add_column_if_absent(&store.conn, "meta", "owner_member_id", "INTEGER")?;
                store
                    .conn
                    .execute("UPDATE meta SET owner_member_id = ?1", [owner_member_id])?;
                to_value(&true)
            }
            Operation::SessionUpdateGapThreshold {
                session_id,
                gap_threshold,
            } => {
                let store = self.handle(&session_id)?;
                let count = session_index::rebuild(&mut store.conn, gap_threshold)?;
                to_value(&count)
            }
            Operation::SessionGenerateIndex {
                session_id,
                gap_threshold,
            } => {
                let store = self.handle(&session_id)?;
                let threshold = gap_threshold.unwrap_or(session_index::DEFAULT_GAP_THRESHOLD);
                let count = session_index::rebuild(&mut store.conn, threshold)?;
                to_value(&count)
            }
            Operation::SessionHasIndex { session_id } => {
                let store = self.handle(&session_id)?;
                to_value(&session_index::has_index(&store.conn)?)
            }
            Operation::SessionIndexStats { session_id } => {
                let store = self.handle(&session_id)?;
                to_value(&session_index::index_stats(&store.conn)?)
            }
            Operation::SessionClearIndex { session_id } => {
                let store = self.handle(&session_id)?;
                session_index::clear(&store.conn)?;
                to_value(&true)
            }

            Operation::MemberList { session_id } => {
                let store = self.handle(&session_id)?;
                to_value(&list_members(&store.conn)?)
            }
            Operation::MemberUpdateAliases {
                session_id,
                member_id,
                aliases,
            } => {
                let store = self.handle(&session_id)?;
                let encoded = serde_json::to_string(&aliases).map_err(|e| Error::Parse(e.to_string()))?;
                store
                    .conn
                    .execute("UPDATE member SET aliases = ?1 WHERE id = ?2", rusqlite::params![encoded, member_id])?;
                to_value(&true)
            }
            Operation::MemberDelete { session_id, member_id } => {
                let store = self.handle(&session_id)?;
                store.conn.execute_batch("BEGIN")?;
                let result = (|| -> Result<()> {
                    store
                        .conn
                        .execute("DELETE FROM message WHERE sender_id = ?1", [member_id])?;
                    store
                        .conn
                        .execute("DELETE FROM member_name_history WHERE member_id = ?1", [member_id])?;
                    store.conn.execute("DELETE FROM member WHERE id = ?1", [member_id])?;
                    Ok(())
                })();
                match result {
                    Ok(()) => store.conn.execute_batch("COMMIT")?,
                    Err(e) => {
                        let _ = store.conn.execute_batch("ROLLBACK");
                        return Err(e);
                    }
                }
                session_index::invalidate(&store.conn)?;
                to_value(&true)
            }
            Operation::MemberNameHistory { session_id, member_id } => {
                let store = self.handle(&session_id)?;
                let history: Vec<NameHistoryEntry> = QueryLayer::new(&store.conn).nickname_history(member_id)?;
                to_value(&history)
            }

            Operation::Query { session_id, filter, op } => {
                let store = self.handle(&session_id)?;
                run_query(&store.conn, &filter, op)
            }

            Operation::MsgSearch {
                session_id,
                filter,
                keywords,
                limit,
            } => {
                let store = self.handle(&session_id)?;
                to_value(&QueryLayer::new(&store.conn).search(&filter, &keywords, limit)?)
            }
            Operation::MsgContext { session_id, seed_ids, k } => {
                let store = self.handle(&session_id)?;
                to_value(&QueryLayer::new(&store.conn).context(&seed_ids, k)?)
            }
            Operation::MsgRecent { session_id, filter, limit } => {
                let store = self.handle(&session_id)?;
                to_value(&QueryLayer::new(&store.conn).recent(&filter, limit)?)
            }
            Operation::MsgAllRecent {
                session_ids,
                filter,
                limit,
            } => {
                let mut all = Vec::new();
                for sid in &session_ids {
                    let store = self.handle(sid)?;
                    all.extend(QueryLayer::new(&store.conn).recent(&filter, limit)?);
                }
                all.sort_by_key(|m: &crate::model::Message| std::cmp::Reverse(m.ts));
                all.truncate(limit);
                to_value(&all)
            }
            Operation::MsgBetween {
                session_id,
                filter,
                start_id,
                end_id,
            } => {
                let store = self.handle(&session_id)?;
                to_value(&QueryLayer::new(&store.conn).between(&filter, start_id, end_id)?)
            }
            Operation::MsgBefore {
                session_id,
                filter,
                cursor_id,
                limit,
                sender_id,
                keywords,
            } => {
                let store = self.handle(&session_id)?;
                let (messages, has_more) =
                    QueryLayer::new(&store.conn).before(&filter, cursor_id, limit, sender_id, &keywords)?;
                to_value(&(messages, has_more))
            }
            Operation::MsgAfter {
                session_id,
                filter,
                cursor_id,
                limit,
                sender_id,
                keywords,
            } => {
                let store = self.handle(&session_id)?;
                let (messages, has_more) =
                    QueryLayer::new(&store.conn).after(&filter, cursor_id, limit, sender_id, &keywords)?;
                to_value(&(messages, has_more))
            }
            Operation::MsgFilterWithContext {
                session_id,
                filter,
                keywords,
                k,
            } => {
                let store = self.handle(&session_id)?;
                let q = QueryLayer::new(&store.conn);
                let hits = q.search(&filter, &keywords, 1000)?;
                let seed_ids: Vec<i64> = hits.iter().map(|m| m.id).collect();
                to_value(&q.context(&seed_ids, k)?)
            }
            Operation::MsgFromSessions {
                session_ids,
                filter,
                limit,
            } => {
                let mut all = Vec::new();
                for sid in &session_ids {
                    let store = self.handle(sid)?;
                    all.extend(QueryLayer::new(&store.conn).search(&filter, &[], limit)?);
                }
                all.sort_by_key(|m: &crate::model::Message| std::cmp::Reverse(m.ts));
                all.truncate(limit);
                to_value(&all)
            }

            Operation::SqlExecute {
                session_id,
                sql,
                row_limit,
            } => {
                let store = self.handle(&session_id)?;
                to_value(&QueryLayer::new(&store.conn).execute_sql(&sql, row_limit, Some(SHORT_TIMEOUT))?)
            }
            Operation::SqlSchema { session_id } => {
                let store = self.handle(&session_id)?;
                to_value(&QueryLayer::new(&store.conn).schema()?)
            }

            Operation::MergeParseFileInfo { source } => {
                let info = parse_file_info(&source, &self.registry)?;
                to_value(&info)
            }
            Operation::MergeCheckConflicts { merge_id, sources } => {
                let merger = Merger::new(&self.registry, &self.paths);
                let stagings = merger.stage_all(&sources, &merge_id)?;
                let report: ConflictReport = merger.detect_conflicts(&stagings)?;
                self.staged_merges.insert(merge_id, stagings);
                to_value(&report)
            }
            Operation::MergeMergeFiles {
                merge_id,
                sources,
                group_name,
                output_path,
                reimport,
            } => {
                let merger = Merger::new(&self.registry, &self.paths);
                let stagings = match self.staged_merges.remove(&merge_id) {
                    Some(s) => s,
                    None => merger.stage_all(&sources, &merge_id)?,
                };
                let outcome: MergeOutcome = merger.merge(&stagings, &group_name, &output_path, reimport, Some(abort))?;
                drop(stagings);
                let _ = self.paths.sweep_staging();
                to_value(&outcome)
            }
            Operation::MergeClearCache => {
                self.staged_merges.clear();
                self.paths.sweep_staging().map_err(Error::Io)?;
                to_value(&true)
            }

            Operation::MigrationCheck => {
                let statuses = migration_check(&self.paths)?;
                to_value(&statuses)
            }
            Operation::MigrationRun => {
                let applied = migration_run(&self.paths, &mut self.handles)?;
                to_value(&applied)
            }
        }
    }
}

fn to_value<T: Serialize>(v: &T) -> Result<serde_json::Value> {
    serde_json::to_value(v).map_err(|e| Error::Parse(e.to_string()))
}

fn run_query(conn: &rusqlite::Connection, filter: &Filter, op: QueryOp) -> Result<serde_json::Value> {
    let q = QueryLayer::new(conn);
    match op {
        QueryOp::AvailableYears => to_value(&q.available_years(filter)?),
        QueryOp::MemberActivity => to_value(&q.member_activity(filter)?),
        QueryOp::Hourly => to_value(&q.hourly(filter)?),
        QueryOp::Daily => to_value(&q.daily(filter)?),
        QueryOp::Weekday => to_value(&q.weekday(filter)?),
        QueryOp::Monthly => to_value(&q.monthly(filter)?),
        QueryOp::Yearly => to_value(&q.yearly(filter)?),
        QueryOp::LengthDistribution => to_value(&q.length_distribution(filter)?),
        QueryOp::TypeDistribution => to_value(&q.type_distribution(filter)?),
        QueryOp::TimeRange => to_value(&q.time_range(filter)?),
        QueryOp::Repeat => to_value(&q.repeat_chains(filter)?),
        QueryOp::Catchphrase => to_value(&q.catchphrase(filter, 20)?),
        QueryOp::NightOwl => to_value(&q.night_owl(filter)?),
        QueryOp::DragonKing => to_value(&q.dragon_king(filter)?),
        QueryOp::Diving => to_value(&q.diving(filter)?),
        QueryOp::Monologue => to_value(&q.monologue(filter)?),
        QueryOp::Mention => to_value(&q.mention(filter)?),
        QueryOp::MentionGraph => to_value(&q.mention_graph(filter)?),
        QueryOp::Laugh => to_value(&q.laugh(filter)?),
        QueryOp::MemeBattle => to_value(&q.meme_battle(filter)?),
        QueryOp::CheckIn => to_value(&q.check_in(filter)?),
    }
}

fn list_members(conn: &rusqlite::Connection) -> Result<Vec<Member>> {
    let mut stmt = conn.prepare("SELECT id, platform_id, account_name, group_nickname, aliases, avatar FROM member")?;
    let rows = stmt.query_map([], |r| {
        let aliases_json: String = r.get(4)?;
        let aliases: Vec<String> = serde_json::from_str(&aliases_json).unwrap_or_default();
        Ok(Member {
            id: r.get(0)?,
            platform_id: r.get(1)?,
            account_name: r.get(2)?,
            group_nickname: r.get(3)?,
            aliases,
            avatar: r.get(5)?,
        })
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

fn parse_file_info(source: &std::path::Path, registry: &Registry) -> Result<FileInfo> {
    let format_id = sniffer::sniff_or_error(source, registry)?;
    let descriptor = registry.get(format_id).expect("sniffed format id must be registered");
    let size_bytes = std::fs::metadata(source)?.len();
    let prefix = sniffer::read_prefix(source, 4096)?;
    let mime_hint = infer::get(&prefix).map(|t| t.mime_type().to_string());
    Ok(FileInfo {
        format_id: descriptor.id.to_string(),
        display_name: descriptor.display_name.to_string(),
        platform: descriptor.platform,
        size_bytes,
        mime_hint,
    })
}

fn list_sessions(paths: &AppPaths) -> Result<Vec<SessionSummary>> {
    let dir = paths.databases_dir();
    if !dir.exists() {
        return Ok(vec![]);
    }
    let mut out = Vec::new();
    for entry in std::fs::read_dir(&dir)?.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("db") {
            continue;
        }
        let Some(session_id) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if let Ok(summary) = session_summary(paths, session_id) {
            out.push(summary);
        }
    }
    out.sort_by_key(|s| std::cmp::Reverse(s.imported_at));
    Ok(out)
}

fn session_summary(paths: &AppPaths, session_id: &str) -> Result<SessionSummary> {
    let path = paths.session_db_path(session_id);
    let store = Store::open_for_read(&path)?;
    let (name, platform, kind, imported_at, group_id): (String, String, String, i64, Option<String>) = store
        .conn
        .query_row(
            "SELECT name, platform, type, imported_at, group_id FROM meta LIMIT 1",
            [],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
        )?;
    let message_count: i64 = store.conn.query_row("SELECT COUNT(*) FROM message", [], |r| r.get(0))?;
    let member_count: i64 = store.conn.query_row("SELECT COUNT(*) FROM member", [], |r| r.get(0))?;
    Ok(SessionSummary {
        id: session_id.to_string(),
        name,
        platform: Platform::parse(&platform),
        kind: ConversationKind::parse(&kind),
        imported_at,
        group_id,
        message_count,
        member_count,
    })
}

fn migration_check(paths: &AppPaths) -> Result<Vec<MigrationStatus>> {
    let dir = paths.databases_dir();
    if !dir.exists() {
        return Ok(vec![]);
    }
    let mut out = Vec::new();
    for entry in std::fs::read_dir(&dir)?.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("db") {
            continue;
        }
        let Some(session_id) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let conn = rusqlite::Connection::open(&path)?;
        let current = schema::current_version(&conn)?;
        if current < schema::LATEST_VERSION {
            out.push(MigrationStatus {
                session_id: session_id.to_string(),
                current,
                latest: schema::LATEST_VERSION,
                pending: schema::pending_descriptions(&conn)?,
            });
        }
    }
    Ok(out)
}

fn migration_run(paths: &AppPaths, handles: &mut HashMap<String, Store>) -> Result<Vec<String>> {
    let statuses = migration_check(paths)?;
    let mut applied = Vec::new();
    for status in statuses {
        handles.remove(&status.session_id);
        let path = paths.session_db_path(&status.session_id);
        let mut conn = rusqlite::Connection::open(&path)?;
        for desc in schema::run_pending(&mut conn)? {
            applied.push(format!("{}: {desc}", status.session_id));
        }
    }
    Ok(applied)
}

/// The off-thread host: spawns its loop on construction and accepts
/// requests until dropped/shut down (§4.8, §5).
pub struct WorkerHost {
    inbound: Sender<Job>,
    join: Option<JoinHandle<()>>,
}

impl WorkerHost {
    pub fn spawn(registry: Registry, paths: AppPaths) -> Self {
        let (tx, rx): (Sender<Job>, Receiver<Job>) = crossbeam_channel::unbounded();
        let join = std::thread::spawn(move || {
            let mut state = HostState::new(registry, paths);
            for job in rx {
                run_job(&mut state, job);
            }
        });
        Self {
            inbound: tx,
            join: Some(join),
        }
    }

    /// Submits a request; progress and the final response arrive on
    /// `outbound`. Returns the cancellation token for this request,
    /// consulted at batch boundaries by the import pipeline (§4.8).
    pub fn submit(&self, request: Request, outbound: Sender<WorkerMessage>) -> Arc<AtomicBool> {
        let abort = Arc::new(AtomicBool::new(false));
        let _ = self.inbound.send(Job {
            request,
            abort: abort.clone(),
            outbound,
        });
        abort
    }

    pub fn shutdown(self) {
        drop(self.inbound);
        if let Some(j) = self.join {
            let _ = j.join();
        }
    }
}

fn run_job(state: &mut HostState, job: Job) {
    let Job { request, abort, outbound } = job;
    let id = request.id;
    let outbound_progress = outbound.clone();
    let id_for_progress = id.clone();
    let mut on_progress = move |p: ImportProgress| {
        let _ = outbound_progress.send(WorkerMessage::Progress(ProgressEvent {
            id: id_for_progress.clone(),
            progress: p,
        }));
    };
    let result = state.dispatch(request.op, &abort, &mut on_progress);
    let payload = result.map_err(|e| e.to_payload());
    let _ = outbound.send(WorkerMessage::Response { id, result: payload });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn qq_fixture(path: &std::path::Path) {
        let mut f = std::fs::File::create(path).unwrap();
        write!(
            f,
            r#"{{"qq_export":{{"group_name":"g","is_group":true}},"members":[{{"uin":"1","card":"A"}}],"messages":[{{"sender_uin":"1","sender_card":"A","time":1700000000,"msg_type":"text","content":"hi"}}]}}"#
        )
        .unwrap();
    }

    #[test]
    fn import_then_query_round_trips_through_requests() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("in.json");
        qq_fixture(&source);
        let paths = AppPaths::new(dir.path().to_path_buf(), "chatlab-test");
        paths.ensure_dirs().unwrap();
        let host = WorkerHost::spawn(Registry::standard(), paths);

        let (tx, rx) = crossbeam_channel::unbounded();
        host.submit(
            Request {
                id: "1".into(),
                op: Operation::ImportStream { source },
            },
            tx,
        );
        let mut session_id = None;
        for msg in rx {
            if let WorkerMessage::Response { result, .. } = msg {
                let value = result.unwrap();
                session_id = Some(value["session_id"].as_str().unwrap().to_string());
                break;
            }
        }
        let session_id = session_id.unwrap();

        let (tx2, rx2) = crossbeam_channel::unbounded();
        host.submit(
            Request {
                id: "2".into(),
                op: Operation::Query {
                    session_id,
                    filter: Filter::default(),
                    op: QueryOp::MemberActivity,
                },
            },
            tx2,
        );
        let response = rx2.recv().unwrap();
        if let WorkerMessage::Response { result, .. } = response {
            let value = result.unwrap();
            assert_eq!(value.as_array().unwrap().len(), 1);
        } else {
            panic!("expected response");
        }

        host.shutdown();
    }
}
