//! Query layer (§4.7): read-only time/member/keyword-filtered aggregates,
//! behavioral analyses, message pagination, and bounded raw SQL.

pub mod session_index;

use crate::error::{Error, Result};
use crate::model::{Filter, Message, MessageType, NameHistoryEntry, NameKind};
use base64::Engine;
use regex::Regex;
use rusqlite::Connection;
use rusqlite::types::Value as SqlValue;
use serde::Serialize;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Serialize)]
pub struct MemberActivityEntry {
    pub member_id: i64,
    pub display_name: String,
    pub count: i64,
    pub percentage: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DailyCount {
    pub date: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct YearCount {
    pub year: i32,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LengthBucket {
    pub range: &'static str,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TypeCount {
    pub msg_type: i64,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RepeatChain {
    pub content: String,
    pub member_ids: Vec<i64>,
    pub start_message_id: i64,
    pub end_message_id: i64,
    pub length: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CatchphraseEntry {
    pub member_id: i64,
    pub phrase: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct NightOwlEntry {
    pub member_id: i64,
    pub night_message_count: i64,
    pub total_message_count: i64,
    pub ratio: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DragonKingEntry {
    pub date: String,
    pub member_id: i64,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DivingEntry {
    pub member_id: i64,
    pub message_id: i64,
    pub ts: i64,
    pub silence_seconds: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonologueEntry {
    pub member_id: i64,
    pub start_message_id: i64,
    pub end_message_id: i64,
    pub length: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct MentionCount {
    pub mentioned_name: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MentionEdge {
    pub from_member_id: i64,
    pub to_name: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LaughCount {
    pub member_id: i64,
    pub laugh_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemeBattleEntry {
    pub date: String,
    pub member_id: i64,
    pub image_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckInEntry {
    pub member_id: i64,
    pub streak_days: i64,
    pub last_date: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SqlResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    pub truncated: bool,
}

/// Minimum consecutive-message run lengths for the "chain" style
/// analyses, kept as named constants since they recur with different
/// intents (identical content vs. same sender).
const REPEAT_CHAIN_MIN_LEN: usize = 3;
const MONOLOGUE_MIN_LEN: usize = 3;
const CATCHPHRASE_MIN_COUNT: i64 = 3;
const NIGHT_HOUR_START: u32 = 0;
const NIGHT_HOUR_END: u32 = 5;
const DIVING_SILENCE_SECONDS: i64 = 7 * 24 * 3600;
const DEFAULT_SQL_TIMEOUT: Duration = Duration::from_secs(5);

pub struct QueryLayer<'a> {
    conn: &'a Connection,
}

impl<'a> QueryLayer<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn filtered_sql(&self, select: &str, filter: &Filter) -> (String, Vec<SqlValue>) {
        let (where_clause, params) = filter.where_clause();
        (format!("{select} WHERE {where_clause}"), params)
    }

    pub fn available_years(&self, filter: &Filter) -> Result<Vec<i32>> {
        let (sql, params) = self.filtered_sql(
            "SELECT DISTINCT CAST(strftime('%Y', ts, 'unixepoch', 'localtime') AS INTEGER) FROM message",
            filter,
        );
        let mut stmt = self.conn.prepare(&format!("{sql} ORDER BY 1"))?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params), |r| r.get::<_, i32>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn member_activity(&self, filter: &Filter) -> Result<Vec<MemberActivityEntry>> {
        let (sql, params) = self.filtered_sql(
            "SELECT sender_id, COUNT(*) as cnt FROM message",
            filter,
        );
        let mut stmt = self
            .conn
            .prepare(&format!("{sql} GROUP BY sender_id ORDER BY cnt DESC"))?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params), |r| {
            Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?))
        })?;
        let mut counts = Vec::new();
        let mut total = 0i64;
        for row in rows {
            let (member_id, count) = row?;
            total += count;
            counts.push((member_id, count));
        }
        let mut out = Vec::with_capacity(counts.len());
        for (member_id, count) in counts {
            let display_name: String = self
                .conn
                .query_row(
                    "SELECT COALESCE(group_nickname, account_name) FROM member WHERE id = ?1",
                    [member_id],
                    |r| r.get(0),
                )
                .unwrap_or_default();
            let percentage = if total > 0 {
                (count as f64 / total as f64 * 10000.0).round() / 100.0
            } else {
                0.0
            };
            out.push(MemberActivityEntry {
                member_id,
                display_name,
                count,
                percentage,
            });
        }
        Ok(out)
    }

    pub fn hourly(&self, filter: &Filter) -> Result<[u64; 24]> {
        let (sql, params) = self.filtered_sql(
            "SELECT CAST(strftime('%H', ts, 'unixepoch', 'localtime') AS INTEGER) as bucket, COUNT(*) FROM message",
            filter,
        );
        self.bucketed(&format!("{sql} GROUP BY bucket"), params)
    }

    /// Monday = 1 .. Sunday = 7 (§4.7); SQLite's `%w` is Sunday = 0, so
    /// the native zero (Sunday) maps to bucket 7 and index 0 is always
    /// empty.
    pub fn weekday(&self, filter: &Filter) -> Result<[u64; 8]> {
        let (sql, params) = self.filtered_sql(
            "SELECT (CASE WHEN strftime('%w', ts, 'unixepoch', 'localtime') = '0' THEN 7 \
                ELSE CAST(strftime('%w', ts, 'unixepoch', 'localtime') AS INTEGER) END) as bucket, \
                COUNT(*) FROM message",
            filter,
        );
        self.bucketed(&format!("{sql} GROUP BY bucket"), params)
    }

    pub fn monthly(&self, filter: &Filter) -> Result<[u64; 12]> {
        let (sql, params) = self.filtered_sql(
            "SELECT CAST(strftime('%m', ts, 'unixepoch', 'localtime') AS INTEGER) - 1 as bucket, COUNT(*) FROM message",
            filter,
        );
        self.bucketed(&format!("{sql} GROUP BY bucket"), params)
    }

    fn bucketed<const N: usize>(&self, sql: &str, params: Vec<SqlValue>) -> Result<[u64; N]> {
        let mut buckets = [0u64; N];
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params), |r| {
            Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (bucket, count) = row?;
            if bucket >= 0 && (bucket as usize) < N {
                buckets[bucket as usize] = count as u64;
            }
        }
        Ok(buckets)
    }

    /// Only years for which at least one message exists (§4.7).
    pub fn yearly(&self, filter: &Filter) -> Result<Vec<YearCount>> {
        let (sql, params) = self.filtered_sql(
            "SELECT CAST(strftime('%Y', ts, 'unixepoch', 'localtime') AS INTEGER) as year, COUNT(*) FROM message",
            filter,
        );
        let mut stmt = self.conn.prepare(&format!("{sql} GROUP BY year ORDER BY year"))?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params), |r| {
            Ok(YearCount {
                year: r.get(0)?,
                count: r.get(1)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// One row per local calendar day present; absent days are absent.
    pub fn daily(&self, filter: &Filter) -> Result<Vec<DailyCount>> {
        let (sql, params) = self.filtered_sql(
            "SELECT strftime('%Y-%m-%d', ts, 'unixepoch', 'localtime') as day, COUNT(*) FROM message",
            filter,
        );
        let mut stmt = self.conn.prepare(&format!("{sql} GROUP BY day ORDER BY day"))?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params), |r| {
            Ok(DailyCount {
                date: r.get(0)?,
                count: r.get(1)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn length_distribution(&self, filter: &Filter) -> Result<Vec<LengthBucket>> {
        let (sql, params) = self.filtered_sql(
            "SELECT
                CASE
                    WHEN LENGTH(content) IS NULL THEN 'n/a'
                    WHEN LENGTH(content) <= 10 THEN '0-10'
                    WHEN LENGTH(content) <= 50 THEN '11-50'
                    WHEN LENGTH(content) <= 200 THEN '51-200'
                    WHEN LENGTH(content) <= 1000 THEN '201-1000'
                    ELSE '1000+'
                END as bucket,
                COUNT(*)
             FROM message",
            filter,
        );
        let mut stmt = self.conn.prepare(&format!("{sql} GROUP BY bucket"))?;
        let mut counts: std::collections::HashMap<String, i64> = std::collections::HashMap::new();
        let rows = stmt.query_map(rusqlite::params_from_iter(params), |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (bucket, count) = row?;
            counts.insert(bucket, count);
        }
        let order = ["0-10", "11-50", "51-200", "201-1000", "1000+", "n/a"];
        Ok(order
            .iter()
            .map(|range| LengthBucket {
                range,
                count: *counts.get(*range).unwrap_or(&0),
            })
            .collect())
    }

    pub fn type_distribution(&self, filter: &Filter) -> Result<Vec<TypeCount>> {
        let (sql, params) = self.filtered_sql("SELECT type, COUNT(*) FROM message", filter);
        let mut stmt = self.conn.prepare(&format!("{sql} GROUP BY type ORDER BY type"))?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params), |r| {
            Ok(TypeCount {
                msg_type: r.get(0)?,
                count: r.get(1)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn time_range(&self, filter: &Filter) -> Result<Option<(i64, i64)>> {
        let (sql, params) = self.filtered_sql("SELECT MIN(ts), MAX(ts) FROM message", filter);
        let row: (Option<i64>, Option<i64>) = self
            .conn
            .query_row(&sql, rusqlite::params_from_iter(params), |r| {
                Ok((r.get(0)?, r.get(1)?))
            })?;
        Ok(match row {
            (Some(min), Some(max)) => Some((min, max)),
            _ => None,
        })
    }

    /// All entries for a member, most recent first (§4.7).
    pub fn nickname_history(&self, member_id: i64) -> Result<Vec<NameHistoryEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, member_id, name_type, name, start_ts, end_ts FROM member_name_history
             WHERE member_id = ?1 ORDER BY start_ts DESC",
        )?;
        let rows = stmt.query_map([member_id], |r| {
            let name_type: String = r.get(2)?;
            Ok(NameHistoryEntry {
                id: r.get(0)?,
                member_id: r.get(1)?,
                name_type: if name_type == "group_nickname" {
                    NameKind::GroupNickname
                } else {
                    NameKind::AccountName
                },
                name: r.get(3)?,
                start_ts: r.get(4)?,
                end_ts: r.get(5)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn filtered_messages(&self, filter: &Filter) -> Result<Vec<(i64, i64, i64, Option<String>)>> {
        let (sql, params) = self.filtered_sql("SELECT id, sender_id, ts, content FROM message", filter);
        let mut stmt = self.conn.prepare(&format!("{sql} ORDER BY ts ASC, id ASC"))?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params), |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Runs of identical non-empty content posted back-to-back by
    /// different members ("接龙" chat chains).
    pub fn repeat_chains(&self, filter: &Filter) -> Result<Vec<RepeatChain>> {
        let rows = self.filtered_messages(filter)?;
        let mut chains = Vec::new();
        let mut run: Vec<(i64, i64, String)> = Vec::new(); // id, sender_id, content

        let flush = |run: &mut Vec<(i64, i64, String)>, chains: &mut Vec<RepeatChain>| {
            if run.len() >= REPEAT_CHAIN_MIN_LEN {
                chains.push(RepeatChain {
                    content: run[0].2.clone(),
                    member_ids: run.iter().map(|(_, s, _)| *s).collect(),
                    start_message_id: run.first().unwrap().0,
                    end_message_id: run.last().unwrap().0,
                    length: run.len(),
                });
            }
            run.clear();
        };

        for (id, sender_id, _ts, content) in rows {
            let Some(content) = content.filter(|c| !c.is_empty()) else {
                flush(&mut run, &mut chains);
                continue;
            };
            match run.last() {
                Some((_, _, last_content)) if *last_content == content => {
                    run.push((id, sender_id, content));
                }
                Some(_) => {
                    flush(&mut run, &mut chains);
                    run.push((id, sender_id, content));
                }
                None => run.push((id, sender_id, content)),
            }
        }
        flush(&mut run, &mut chains);
        Ok(chains)
    }

    /// Per-member exact-content repeats above [`CATCHPHRASE_MIN_COUNT`],
    /// sorted by count descending.
    pub fn catchphrase(&self, filter: &Filter, top_n: usize) -> Result<Vec<CatchphraseEntry>> {
        let (sql, params) = self.filtered_sql(
            "SELECT sender_id, content, COUNT(*) as cnt FROM message",
            filter,
        );
        let mut stmt = self.conn.prepare(&format!(
            "{sql} AND content IS NOT NULL AND LENGTH(content) > 0
             GROUP BY sender_id, content HAVING cnt >= ? ORDER BY cnt DESC LIMIT ?"
        ))?;
        let mut all_params = params;
        all_params.push(SqlValue::Integer(CATCHPHRASE_MIN_COUNT));
        all_params.push(SqlValue::Integer(top_n as i64));
        let rows = stmt.query_map(rusqlite::params_from_iter(all_params), |r| {
            Ok(CatchphraseEntry {
                member_id: r.get(0)?,
                phrase: r.get(1)?,
                count: r.get(2)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn night_owl(&self, filter: &Filter) -> Result<Vec<NightOwlEntry>> {
        let (sql, params) = self.filtered_sql(
            &format!(
                "SELECT sender_id,
                    SUM(CASE WHEN CAST(strftime('%H', ts, 'unixepoch', 'localtime') AS INTEGER)
                         BETWEEN {NIGHT_HOUR_START} AND {NIGHT_HOUR_END} THEN 1 ELSE 0 END) as night_count,
                    COUNT(*) as total
                 FROM message"
            ),
            filter,
        );
        let mut stmt = self.conn.prepare(&format!("{sql} GROUP BY sender_id ORDER BY night_count DESC"))?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params), |r| {
            Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?, r.get::<_, i64>(2)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (member_id, night_count, total) = row?;
            let ratio = if total > 0 {
                night_count as f64 / total as f64
            } else {
                0.0
            };
            out.push(NightOwlEntry {
                member_id,
                night_message_count: night_count,
                total_message_count: total,
                ratio,
            });
        }
        Ok(out)
    }

    /// Per local day, the member with the most messages ("龙王").
    pub fn dragon_king(&self, filter: &Filter) -> Result<Vec<DragonKingEntry>> {
        let (sql, params) = self.filtered_sql(
            "SELECT strftime('%Y-%m-%d', ts, 'unixepoch', 'localtime') as day, sender_id, COUNT(*) as cnt
             FROM message",
            filter,
        );
        let mut stmt = self
            .conn
            .prepare(&format!("{sql} GROUP BY day, sender_id ORDER BY day ASC, cnt DESC"))?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params), |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?, r.get::<_, i64>(2)?))
        })?;
        let mut best: std::collections::HashMap<String, (i64, i64)> = std::collections::HashMap::new();
        let mut order: Vec<String> = Vec::new();
        for row in rows {
            let (day, member_id, count) = row?;
            match best.get(&day) {
                Some((_, best_count)) if *best_count >= count => {}
                Some(_) => {
                    best.insert(day.clone(), (member_id, count));
                }
                None => {
                    order.push(day.clone());
                    best.insert(day.clone(), (member_id, count));
                }
            }
        }
        Ok(order
            .into_iter()
            .map(|day| {
                let (member_id, count) = best[&day];
                DragonKingEntry {
                    date: day,
                    member_id,
                    count,
                }
            })
            .collect())
    }

    /// Senders who resurface after a long personal silence ("潜水").
    pub fn diving(&self, filter: &Filter) -> Result<Vec<DivingEntry>> {
        let rows = self.filtered_messages(filter)?;
        let mut last_seen: std::collections::HashMap<i64, i64> = std::collections::HashMap::new();
        let mut out = Vec::new();
        for (id, sender_id, ts, _content) in rows {
            if let Some(&last_ts) = last_seen.get(&sender_id) {
                let gap = ts - last_ts;
                if gap > DIVING_SILENCE_SECONDS {
                    out.push(DivingEntry {
                        member_id: sender_id,
                        message_id: id,
                        ts,
                        silence_seconds: gap,
                    });
                }
            }
            last_seen.insert(sender_id, ts);
        }
        Ok(out)
    }

    /// Consecutive runs of messages from the same sender with nobody
    /// else interleaved ("唱独角戏").
    pub fn monologue(&self, filter: &Filter) -> Result<Vec<MonologueEntry>> {
        let rows = self.filtered_messages(filter)?;
        let mut out = Vec::new();
        let mut run_start: Option<(i64, i64)> = None; // (sender_id, start_id)
        let mut run_len = 0usize;
        let mut last_id = 0i64;

        let flush = |run_start: &Option<(i64, i64)>, run_len: usize, last_id: i64, out: &mut Vec<MonologueEntry>| {
            if run_len < MONOLOGUE_MIN_LEN {
                return;
            }
            if let Some((sender_id, start_id)) = run_start {
                out.push(MonologueEntry {
                    member_id: *sender_id,
                    start_message_id: *start_id,
                    end_message_id: last_id,
                    length: run_len,
                });
            }
        };

        for (id, sender_id, _ts, _content) in rows {
            match run_start {
                Some((current_sender, _)) if current_sender == sender_id => {
                    run_len += 1;
                    last_id = id;
                }
                _ => {
                    flush(&run_start, run_len, last_id, &mut out);
                    run_start = Some((sender_id, id));
                    run_len = 1;
                    last_id = id;
                }
            }
        }
        flush(&run_start, run_len, last_id, &mut out);
        Ok(out)
    }

    fn mention_regex() -> Regex {
        Regex::new(r"@([^\s@,，。！!？?]{1,32})").expect("static mention pattern")
    }

    pub fn mention(&self, filter: &Filter) -> Result<Vec<MentionCount>> {
        let rows = self.filtered_messages(filter)?;
        let re = Self::mention_regex();
        let mut counts: std::collections::HashMap<String, i64> = std::collections::HashMap::new();
        for (_, _, _, content) in rows {
            let Some(content) = content else { continue };
            for cap in re.captures_iter(&content) {
                *counts.entry(cap[1].to_string()).or_insert(0) += 1;
            }
        }
        let mut out: Vec<MentionCount> = counts
            .into_iter()
            .map(|(mentioned_name, count)| MentionCount { mentioned_name, count })
            .collect();
        out.sort_by(|a, b| b.count.cmp(&a.count));
        Ok(out)
    }

    pub fn mention_graph(&self, filter: &Filter) -> Result<Vec<MentionEdge>> {
        let rows = self.filtered_messages(filter)?;
        let re = Self::mention_regex();
        let mut counts: std::collections::HashMap<(i64, String), i64> = std::collections::HashMap::new();
        for (_, sender_id, _, content) in rows {
            let Some(content) = content else { continue };
            for cap in re.captures_iter(&content) {
                *counts.entry((sender_id, cap[1].to_string())).or_insert(0) += 1;
            }
        }
        let mut out: Vec<MentionEdge> = counts
            .into_iter()
            .map(|((from_member_id, to_name), count)| MentionEdge {
                from_member_id,
                to_name,
                count,
            })
            .collect();
        out.sort_by(|a, b| b.count.cmp(&a.count));
        Ok(out)
    }

    fn laugh_regex() -> Regex {
        Regex::new(r"(哈哈+|233+|lol|lmao|😂|笑死)").expect("static laugh pattern")
    }

    pub fn laugh(&self, filter: &Filter) -> Result<Vec<LaughCount>> {
        let rows = self.filtered_messages(filter)?;
        let re = Self::laugh_regex();
        let mut counts: std::collections::HashMap<i64, i64> = std::collections::HashMap::new();
        for (_, sender_id, _, content) in rows {
            let Some(content) = content else { continue };
            let hits = re.find_iter(&content.to_lowercase()).count() as i64;
            if hits > 0 {
                *counts.entry(sender_id).or_insert(0) += hits;
            }
        }
        let mut out: Vec<LaughCount> = counts
            .into_iter()
            .map(|(member_id, laugh_count)| LaughCount { member_id, laugh_count })
            .collect();
        out.sort_by(|a, b| b.laugh_count.cmp(&a.laugh_count));
        Ok(out)
    }

    /// Per local day, image-message counts per member ("表情包大战").
    pub fn meme_battle(&self, filter: &Filter) -> Result<Vec<MemeBattleEntry>> {
        let (sql, params) = self.filtered_sql(
            "SELECT strftime('%Y-%m-%d', ts, 'unixepoch', 'localtime') as day, sender_id, COUNT(*) as cnt
             FROM message",
            filter,
        );
        let image_type = MessageType::Image.to_i64();
        let mut stmt = self.conn.prepare(&format!(
            "{sql} AND type = {image_type} GROUP BY day, sender_id HAVING cnt > 1 ORDER BY day ASC, cnt DESC"
        ))?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params), |r| {
            Ok(MemeBattleEntry {
                date: r.get(0)?,
                member_id: r.get(1)?,
                image_count: r.get(2)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Per member, the longest run of consecutive local calendar days
    /// with at least one message ("打卡").
    pub fn check_in(&self, filter: &Filter) -> Result<Vec<CheckInEntry>> {
        let (sql, params) = self.filtered_sql(
            "SELECT DISTINCT sender_id, strftime('%Y-%m-%d', ts, 'unixepoch', 'localtime') as day FROM message",
            filter,
        );
        let mut stmt = self.conn.prepare(&format!("{sql} ORDER BY sender_id, day"))?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params), |r| {
            Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?))
        })?;
        let mut by_member: std::collections::HashMap<i64, Vec<chrono::NaiveDate>> = std::collections::HashMap::new();
        for row in rows {
            let (member_id, day) = row?;
            if let Ok(date) = chrono::NaiveDate::parse_from_str(&day, "%Y-%m-%d") {
                by_member.entry(member_id).or_default().push(date);
            }
        }
        let mut out = Vec::new();
        for (member_id, days) in by_member {
            let mut best_len = 1i64;
            let mut cur_len = 1i64;
            let mut last_date_in_best_streak = days[0];
            for w in days.windows(2) {
                if w[1] == w[0].succ_opt().unwrap_or(w[1]) {
                    cur_len += 1;
                } else {
                    cur_len = 1;
                }
                if cur_len > best_len {
                    best_len = cur_len;
                    last_date_in_best_streak = w[1];
                }
            }
            out.push(CheckInEntry {
                member_id,
                streak_days: best_len,
                last_date: last_date_in_best_streak.format("%Y-%m-%d").to_string(),
            });
        }
        out.sort_by(|a, b| b.streak_days.cmp(&a.streak_days));
        Ok(out)
    }

    fn paged(
        &self,
        filter: &Filter,
        comparator: &str,
        cursor_id: i64,
        order: &str,
        limit: usize,
        sender_id: Option<i64>,
        keywords: &[String],
    ) -> Result<(Vec<Message>, bool)> {
        let (mut where_clause, mut params) = filter.where_clause();
        where_clause.push_str(&format!(" AND id {comparator} ?"));
        params.push(SqlValue::Integer(cursor_id));
        if let Some(sender_id) = sender_id {
            where_clause.push_str(" AND sender_id = ?");
            params.push(SqlValue::Integer(sender_id));
        }
        if !keywords.is_empty() {
            let ors: Vec<String> = keywords.iter().map(|_| "content LIKE ?".to_string()).collect();
            where_clause.push_str(&format!(" AND ({})", ors.join(" OR ")));
            for kw in keywords {
                params.push(SqlValue::Text(format!("%{kw}%")));
            }
        }
        let fetch_limit = limit as i64 + 1;
        params.push(SqlValue::Integer(fetch_limit));

        let sql = format!(
            "SELECT id, sender_id, sender_account_name, sender_group_nickname, ts, type, content
             FROM message WHERE {where_clause} ORDER BY id {order} LIMIT ?"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params), message_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        let has_more = out.len() > limit;
        out.truncate(limit);
        if order == "DESC" {
            out.reverse();
        }
        Ok((out, has_more))
    }

    /// Strictly-less-than window, nearest-first then re-ordered ascending
    /// (§4.7 message paging).
    pub fn before(
        &self,
        filter: &Filter,
        cursor_id: i64,
        limit: usize,
        sender_id: Option<i64>,
        keywords: &[String],
    ) -> Result<(Vec<Message>, bool)> {
        self.paged(filter, "<", cursor_id, "DESC", limit, sender_id, keywords)
    }

    pub fn after(
        &self,
        filter: &Filter,
        cursor_id: i64,
        limit: usize,
        sender_id: Option<i64>,
        keywords: &[String],
    ) -> Result<(Vec<Message>, bool)> {
        self.paged(filter, ">", cursor_id, "ASC", limit, sender_id, keywords)
    }

    pub fn search(&self, filter: &Filter, keywords: &[String], limit: usize) -> Result<Vec<Message>> {
        let (mut where_clause, mut params) = filter.where_clause();
        if !keywords.is_empty() {
            let ors: Vec<String> = keywords.iter().map(|_| "content LIKE ?".to_string()).collect();
            where_clause.push_str(&format!(" AND ({})", ors.join(" OR ")));
            for kw in keywords {
                params.push(SqlValue::Text(format!("%{kw}%")));
            }
        }
        params.push(SqlValue::Integer(limit as i64));
        let sql = format!(
            "SELECT id, sender_id, sender_account_name, sender_group_nickname, ts, type, content
             FROM message WHERE {where_clause} ORDER BY ts DESC LIMIT ?"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params), message_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn recent(&self, filter: &Filter, limit: usize) -> Result<Vec<Message>> {
        self.search(filter, &[], limit)
    }

    pub fn between(&self, filter: &Filter, start_id: i64, end_id: i64) -> Result<Vec<Message>> {
        let (where_clause, mut params) = filter.where_clause();
        params.push(SqlValue::Integer(start_id));
        params.push(SqlValue::Integer(end_id));
        let sql = format!(
            "SELECT id, sender_id, sender_account_name, sender_group_nickname, ts, type, content
             FROM message WHERE {where_clause} AND id BETWEEN ? AND ? ORDER BY id ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params), message_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Union of `[id-k, id+k]` across every seed, deduplicated and
    /// id-ordered (§4.7 "Context window").
    pub fn context(&self, seed_ids: &[i64], k: i64) -> Result<Vec<Message>> {
        if seed_ids.is_empty() {
            return Ok(vec![]);
        }
        let clauses: Vec<String> = seed_ids.iter().map(|_| "id BETWEEN ? AND ?".to_string()).collect();
        let mut params = Vec::with_capacity(seed_ids.len() * 2);
        for &id in seed_ids {
            params.push(SqlValue::Integer(id - k));
            params.push(SqlValue::Integer(id + k));
        }
        let sql = format!(
            "SELECT DISTINCT id, sender_id, sender_account_name, sender_group_nickname, ts, type, content
             FROM message WHERE {} ORDER BY id ASC",
            clauses.join(" OR ")
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params), message_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Raw SQL execution (§4.7, §9): refuses writes, bounds rows and
    /// wall-clock time.
    pub fn execute_sql(&self, sql: &str, row_limit: usize, timeout: Option<Duration>) -> Result<SqlResult> {
        let normalized = sql.trim();
        let lower = normalized.to_ascii_lowercase();
        if !(lower.starts_with("select") || lower.starts_with("with") || lower.starts_with("pragma table_info")) {
            return Err(Error::Sql("only read-only SELECT/WITH queries are permitted".into()));
        }
        if normalized.trim_end_matches(';').contains(';') {
            return Err(Error::Sql("multiple statements are not permitted".into()));
        }

        let timeout = timeout.unwrap_or(DEFAULT_SQL_TIMEOUT);
        let start = Instant::now();
        let _ = self.conn
            .progress_handler(1000, Some(move || start.elapsed() > timeout));

        let result = (|| -> Result<SqlResult> {
            let wrapped = format!("SELECT * FROM ({normalized}) LIMIT {}", row_limit + 1);
            let mut stmt = self.conn.prepare(&wrapped)?;
            let columns: Vec<String> = stmt.column_names().into_iter().map(str::to_string).collect();
            let mut rows_out = Vec::new();
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let mut values = Vec::with_capacity(columns.len());
                for i in 0..columns.len() {
                    let v: SqlValue = row.get(i)?;
                    values.push(sqlite_value_to_json(v));
                }
                rows_out.push(values);
            }
            let truncated = rows_out.len() > row_limit;
            rows_out.truncate(row_limit);
            Ok(SqlResult {
                columns,
                rows: rows_out,
                truncated,
            })
        })();

        let _ = self.conn.progress_handler(0, None::<fn() -> bool>);
        result.map_err(|e| match e {
            Error::Sql(_) => e,
            other => Error::Sql(other.to_string()),
        })
    }

    pub fn schema(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT sql FROM sqlite_master WHERE type = 'table' AND sql IS NOT NULL")?;
        let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

fn message_from_row(r: &rusqlite::Row) -> rusqlite::Result<Message> {
    Ok(Message {
        id: r.get(0)?,
        sender_id: r.get(1)?,
        sender_account_name: r.get(2)?,
        sender_group_nickname: r.get(3)?,
        ts: r.get(4)?,
        msg_type: MessageType::from_i64(r.get(5)?),
        content: r.get(6)?,
    })
}

fn sqlite_value_to_json(v: SqlValue) -> serde_json::Value {
    match v {
        SqlValue::Null => serde_json::Value::Null,
        SqlValue::Integer(i) => serde_json::Value::from(i),
        SqlValue::Real(f) => serde_json::Value::from(f),
        SqlValue::Text(s) => serde_json::Value::from(s),
        SqlValue::Blob(b) => serde_json::Value::from(base64::engine::general_purpose::STANDARD.encode(b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::schema;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        schema::create_base_schema(&conn).unwrap();
        conn.execute(
            "INSERT INTO member (platform_id, account_name) VALUES ('1','A'), ('2','B')",
            [],
        )
        .unwrap();
        conn
    }

    fn insert(conn: &Connection, sender_id: i64, ts: i64, content: &str) {
        conn.execute(
            "INSERT INTO message (sender_id, sender_account_name, ts, type, content) VALUES (?1,'x',?2,0,?3)",
            rusqlite::params![sender_id, ts, content],
        )
        .unwrap();
    }

    #[test]
    fn member_activity_percentages_sum_close_to_100() {
        let conn = setup();
        insert(&conn, 1, 1, "hi");
        insert(&conn, 1, 2, "hi");
        insert(&conn, 2, 3, "hi");
        let q = QueryLayer::new(&conn);
        let activity = q.member_activity(&Filter::default()).unwrap();
        let total: f64 = activity.iter().map(|a| a.percentage).sum();
        assert!((total - 100.0).abs() < 0.1);
    }

    #[test]
    fn hourly_sums_match_total_count() {
        let conn = setup();
        insert(&conn, 1, 0, "hi");
        insert(&conn, 1, 3600, "hi");
        insert(&conn, 2, 7200, "hi");
        let q = QueryLayer::new(&conn);
        let hourly = q.hourly(&Filter::default()).unwrap();
        let sum: u64 = hourly.iter().sum();
        assert_eq!(sum, 3);
    }

    #[test]
    fn repeat_chain_detects_three_in_a_row() {
        let conn = setup();
        insert(&conn, 1, 1, "same");
        insert(&conn, 2, 2, "same");
        insert(&conn, 1, 3, "same");
        insert(&conn, 2, 4, "different");
        let q = QueryLayer::new(&conn);
        let chains = q.repeat_chains(&Filter::default()).unwrap();
        assert_eq!(chains.len(), 1);
        assert_eq!(chains[0].length, 3);
    }

    #[test]
    fn execute_sql_rejects_writes() {
        let conn = setup();
        let q = QueryLayer::new(&conn);
        let err = q.execute_sql("DELETE FROM message", 10, None).unwrap_err();
        assert!(matches!(err, Error::Sql(_)));
    }

    #[test]
    fn execute_sql_truncates_to_row_limit() {
        let conn = setup();
        for i in 0..5 {
            insert(&conn, 1, i, "hi");
        }
        let q = QueryLayer::new(&conn);
        let result = q.execute_sql("SELECT * FROM message", 2, None).unwrap();
        assert_eq!(result.rows.len(), 2);
        assert!(result.truncated);
    }
}
