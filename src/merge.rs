//! Staging store and merger (§4.6).

use crate::error::{Error, Result};
use crate::format::chatlab::{
    CanonicalExport, ChatlabHeader, ExportMember, ExportMessage, ExportMeta, ExportSource, write_export,
};
use crate::format::registry::Registry;
use crate::import::{ImportOutcome, ImportPipeline, stage_source};
use crate::paths::AppPaths;
use crate::store::staging::StagingStore;
use regex::Regex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};

/// Pure-image content auto-dedupes even when byte-for-byte distinct
/// across sources (§4.6 step 3).
static PURE_IMAGE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\[图片:\s*.+\]$").expect("static pattern"));

#[derive(Debug, Clone, Serialize)]
pub struct ConflictVariant {
    pub content: Option<String>,
    pub source_indices: Vec<usize>,
    /// Short content fingerprint, purely a diagnostic aid for telling two
    /// long variants apart at a glance without printing both in full.
    pub content_fingerprint: Option<String>,
}

fn fingerprint(content: &str) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(content.as_bytes());
    hex_prefix(&digest, 8)
}

fn hex_prefix(bytes: &[u8], n: usize) -> String {
    bytes.iter().take(n).map(|b| format!("{b:02x}")).collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct ConflictEntry {
    pub timestamp: i64,
    pub sender_platform_id: String,
    pub variants: Vec<ConflictVariant>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConflictReport {
    pub conflicts: Vec<ConflictEntry>,
    /// Size of the message set once the merge's first-wins dedupe key
    /// is applied (§4.6 step 3/4).
    pub post_dedup_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeOutcome {
    pub export_path: PathBuf,
    pub total_messages: usize,
    pub reimported_session_id: Option<String>,
}

struct StagedMessage {
    source_index: usize,
    ts: i64,
    sender_platform_id: String,
    content: Option<String>,
}

fn now_seconds() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn load_all(stagings: &[StagingStore]) -> Result<Vec<StagedMessage>> {
    let mut out = Vec::new();
    for (source_index, staging) in stagings.iter().enumerate() {
        let mut stmt = staging
            .conn
            .prepare("SELECT ts, sender_platform_id, content FROM message")?;
        let rows = stmt.query_map([], |r| {
            Ok(StagedMessage {
                source_index,
                ts: r.get(0)?,
                sender_platform_id: r.get(1)?,
                content: r.get(2)?,
            })
        })?;
        for row in rows {
            out.push(row?);
        }
    }
    Ok(out)
}

/// Bucket by `(timestamp, sender)`, then by content, flagging any bucket
/// fed by ≥2 sources with ≥2 distinct non-pure-image contents as a
/// conflict (§4.6 step 3).
pub fn detect_conflicts(stagings: &[StagingStore]) -> Result<ConflictReport> {
    let messages = load_all(stagings)?;

    let mut buckets: HashMap<(i64, String), Vec<&StagedMessage>> = HashMap::new();
    for m in &messages {
        buckets
            .entry((m.ts, m.sender_platform_id.clone()))
            .or_default()
            .push(m);
    }

    let mut conflicts = Vec::new();
    for ((ts, sender), msgs) in &buckets {
        let distinct_sources: HashSet<usize> = msgs.iter().map(|m| m.source_index).collect();
        if distinct_sources.len() < 2 {
            continue;
        }
        let mut by_content: HashMap<Option<String>, Vec<usize>> = HashMap::new();
        for m in msgs {
            by_content.entry(m.content.clone()).or_default().push(m.source_index);
        }
        if by_content.len() <= 1 {
            continue;
        }
        let all_pure_image = by_content
            .keys()
            .all(|c| c.as_deref().is_some_and(|s| PURE_IMAGE.is_match(s)));
        if all_pure_image {
            continue;
        }
        let variants = by_content
            .into_iter()
            .map(|(content, source_indices)| {
                let content_fingerprint = content.as_deref().map(fingerprint);
                ConflictVariant {
                    content,
                    source_indices,
                    content_fingerprint,
                }
            })
            .collect();
        conflicts.push(ConflictEntry {
            timestamp: *ts,
            sender_platform_id: sender.clone(),
            variants,
        });
    }
    conflicts.sort_by_key(|c| c.timestamp);

    let mut dedupe_keys: HashSet<(i64, String, usize)> = HashSet::new();
    for m in &messages {
        let len = m.content.as_deref().map(str::len).unwrap_or(0);
        dedupe_keys.insert((m.ts, m.sender_platform_id.clone(), len));
    }

    Ok(ConflictReport {
        conflicts,
        post_dedup_count: dedupe_keys.len(),
    })
}

pub struct Merger<'a> {
    registry: &'a Registry,
    paths: &'a AppPaths,
}

impl<'a> Merger<'a> {
    pub fn new(registry: &'a Registry, paths: &'a AppPaths) -> Self {
        Self { registry, paths }
    }

    /// Stages every source under a shared `merge_id` prefix (§4.6 step 1).
    pub fn stage_all(&self, sources: &[PathBuf], merge_id: &str) -> Result<Vec<StagingStore>> {
        sources
            .iter()
            .enumerate()
            .map(|(i, src)| {
                let staging_path = self.paths.staging_db_path(&format!("{merge_id}_{i}"));
                stage_source(src, self.registry, &staging_path)
            })
            .collect()
    }

    pub fn detect_conflicts(&self, stagings: &[StagingStore]) -> Result<ConflictReport> {
        detect_conflicts(stagings)
    }

    /// Unions members, applies the first-wins dedupe merge, writes the
    /// canonical export, and optionally re-imports it (§4.6 steps 2-6).
    pub fn merge(
        &self,
        stagings: &[StagingStore],
        group_name: &str,
        output_path: &Path,
        reimport: bool,
        abort: Option<&Arc<AtomicBool>>,
    ) -> Result<MergeOutcome> {
        let platforms: Vec<String> = stagings.iter().map(|s| s.platform()).collect::<Result<_>>()?;
        let distinct: HashSet<&String> = platforms.iter().collect();
        if distinct.len() > 1 {
            return Err(Error::MixedPlatforms { platforms });
        }
        let platform_str = platforms.first().cloned().unwrap_or_else(|| "unknown".to_string());

        let mut members: HashMap<String, ExportMember> = HashMap::new();
        let mut sources_meta = Vec::new();
        let mut seen: HashSet<(i64, String, usize)> = HashSet::new();
        let mut merged: Vec<ExportMessage> = Vec::new();

        for staging in stagings {
            let mut mstmt = staging
                .conn
                .prepare("SELECT platform_id, account_name, group_nickname, avatar FROM member")?;
            let mrows = mstmt.query_map([], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, Option<String>>(2)?,
                    r.get::<_, Option<String>>(3)?,
                ))
            })?;
            for row in mrows {
                let (platform_id, account_name, group_nickname, avatar) = row?;
                let entry = members.entry(platform_id.clone()).or_insert_with(|| ExportMember {
                    platform_id: platform_id.clone(),
                    account_name: account_name.clone(),
                    group_nickname: None,
                    aliases: vec![],
                    avatar: None,
                });
                if !account_name.is_empty() {
                    entry.account_name = account_name;
                }
                if let Some(n) = group_nickname.filter(|s| !s.is_empty()) {
                    entry.group_nickname = Some(n);
                }
                if let Some(a) = avatar.filter(|s| !s.is_empty()) {
                    entry.avatar = Some(a);
                }
            }

            let mut count_this_source = 0i64;
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
                let (ts, sender, account_name, nickname, msg_type, content) = row?;
                let len = content.as_deref().map(str::len).unwrap_or(0);
                let key = (ts, sender.clone(), len);
                if seen.contains(&key) {
                    continue;
                }
                seen.insert(key);
                count_this_source += 1;
                merged.push(ExportMessage {
                    sender,
                    account_name,
                    group_nickname: nickname,
                    timestamp: ts,
                    msg_type,
                    content,
                });
            }
            sources_meta.push(ExportSource {
                filename: staging
                    .path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or("source")
                    .to_string(),
                platform: Some(platform_str.clone()),
                message_count: count_this_source,
            });

            if abort.is_some_and(|a| a.load(Ordering::SeqCst)) {
                return Err(Error::Cancelled);
            }
        }

        merged.sort_by_key(|m| m.timestamp);
        let total_messages = merged.len();

        let export = CanonicalExport {
            chatlab: ChatlabHeader {
                version: "1.0".to_string(),
                exported_at: now_seconds(),
                generator: Some("chatlab-core merge".to_string()),
                description: None,
            },
            meta: ExportMeta {
                name: group_name.to_string(),
                platform: platform_str,
                kind: "group".to_string(),
                sources: sources_meta,
                group_id: None,
                group_avatar: None,
            },
            members: members.into_values().collect(),
            messages: merged,
        };

        write_export(output_path, &export)?;

        let reimported_session_id = if reimport {
            let pipeline = ImportPipeline::new(self.registry, self.paths);
            let outcome: ImportOutcome = pipeline.import(output_path, abort, None, &mut |_| {})?;
            Some(outcome.session_id)
        } else {
            None
        };

        Ok(MergeOutcome {
            export_path: output_path.to_path_buf(),
            total_messages,
            reimported_session_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn fixture(dir: &Path, name: &str, members: &str, messages: &str) -> PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        write!(
            f,
            r#"{{"qq_export":{{"group_name":"g","is_group":true}},"members":{members},"messages":{messages}}}"#
        )
        .unwrap();
        path
    }

    #[test]
    fn auto_dedupes_identical_content_across_sources() {
        let dir = tempfile::tempdir().unwrap();
        let a = fixture(
            dir.path(),
            "a.json",
            r#"[{"uin":"1","card":"A"}]"#,
            r#"[{"sender_uin":"1","sender_card":"A","time":1700000000,"msg_type":"text","content":"hi"}]"#,
        );
        let b = fixture(
            dir.path(),
            "b.json",
            r#"[{"uin":"1","card":"A"}]"#,
            r#"[{"sender_uin":"1","sender_card":"A","time":1700000000,"msg_type":"text","content":"hi"}]"#,
        );
        let registry = Registry::standard();
        let paths = AppPaths::new(dir.path().to_path_buf(), "chatlab-test");
        paths.ensure_dirs().unwrap();
        let merger = Merger::new(&registry, &paths);
        let stagings = merger.stage_all(&[a, b], "t1").unwrap();
        let report = merger.detect_conflicts(&stagings).unwrap();
        assert!(report.conflicts.is_empty());
        assert_eq!(report.post_dedup_count, 1);
    }

    #[test]
    fn flags_real_conflicts_between_distinct_contents() {
        let dir = tempfile::tempdir().unwrap();
        let a = fixture(
            dir.path(),
            "a.json",
            r#"[{"uin":"1","card":"A"}]"#,
            r#"[{"sender_uin":"1","sender_card":"A","time":1700000000,"msg_type":"text","content":"hi"}]"#,
        );
        let b = fixture(
            dir.path(),
            "b.json",
            r#"[{"uin":"1","card":"A"}]"#,
            r#"[{"sender_uin":"1","sender_card":"A","time":1700000000,"msg_type":"text","content":"bye"}]"#,
        );
        let registry = Registry::standard();
        let paths = AppPaths::new(dir.path().to_path_buf(), "chatlab-test");
        paths.ensure_dirs().unwrap();
        let merger = Merger::new(&registry, &paths);
        let stagings = merger.stage_all(&[a, b], "t2").unwrap();
        let report = merger.detect_conflicts(&stagings).unwrap();
        assert_eq!(report.conflicts.len(), 1);
    }

    #[test]
    fn merge_writes_canonical_export_sorted_by_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let a = fixture(
            dir.path(),
            "a.json",
            r#"[{"uin":"1","card":"A"}]"#,
            r#"[{"sender_uin":"1","sender_card":"A","time":1700000100,"msg_type":"text","content":"second"}]"#,
        );
        let b = fixture(
            dir.path(),
            "b.json",
            r#"[{"uin":"1","card":"A"}]"#,
            r#"[{"sender_uin":"1","sender_card":"A","time":1700000000,"msg_type":"text","content":"first"}]"#,
        );
        let registry = Registry::standard();
        let paths = AppPaths::new(dir.path().to_path_buf(), "chatlab-test");
        paths.ensure_dirs().unwrap();
        let merger = Merger::new(&registry, &paths);
        let stagings = merger.stage_all(&[a, b], "t3").unwrap();
        let output = dir.path().join("merged.json");
        let outcome = merger.merge(&stagings, "Group", &output, false, None).unwrap();
        assert_eq!(outcome.total_messages, 2);
        let text = std::fs::read_to_string(&output).unwrap();
        let first = text.find("first").unwrap();
        let second = text.find("second").unwrap();
        assert!(first < second);
    }

    #[test]
    fn rejects_mixed_platforms() {
        let dir = tempfile::tempdir().unwrap();
        let a = fixture(
            dir.path(),
            "a.json",
            r#"[{"uin":"1","card":"A"}]"#,
            r#"[{"sender_uin":"1","sender_card":"A","time":1700000000,"msg_type":"text","content":"hi"}]"#,
        );
        let b_path = dir.path().join("b.json");
        std::fs::write(
            &b_path,
            r#"{"wx_export":{"chat_name":"g","is_group":true},"members":[{"wxid":"1","remark":"A"}],"msgList":[{"from_wxid":"1","from_remark":"A","createTime":1700000000,"type":1,"content":"hi"}]}"#,
        )
        .unwrap();
        let registry = Registry::standard();
        let paths = AppPaths::new(dir.path().to_path_buf(), "chatlab-test");
        paths.ensure_dirs().unwrap();
        let merger = Merger::new(&registry, &paths);
        let stagings = merger.stage_all(&[a, b_path], "t4").unwrap();
        let output = dir.path().join("merged.json");
        let err = merger.merge(&stagings, "Group", &output, false, None).unwrap_err();
        assert!(matches!(err, Error::MixedPlatforms { .. }));
    }
}
