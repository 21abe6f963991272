//! In-memory nickname-history tracking (§4.4 step 4/5, §9 "do not persist
//! them incrementally"). Kept as plain maps rather than touching the
//! store on every message; flushed once at end of import.

use crate::model::NameKind;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Observation {
    name: String,
    start_ts: i64,
}

/// One compacted history entry, ready for insertion into
/// `member_name_history` (§6.2). `end_ts = None` marks the open tail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactedEntry {
    pub name_type: NameKind,
    pub name: String,
    pub start_ts: i64,
    pub end_ts: Option<i64>,
}

/// Accumulates raw `(name, ts)` observations per (platform id, kind)
/// during streaming, then compacts them once at the end of import.
#[derive(Debug, Default)]
pub struct NicknameTracker {
    account: HashMap<String, Vec<Observation>>,
    nickname: HashMap<String, Vec<Observation>>,
}

impl NicknameTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a sighting of `name` for `platform_id` at `ts`, appending
    /// only when it differs from the most recently observed name for
    /// that (member, kind) — the compaction step also dedupes, but doing
    /// it here keeps the per-member vectors from growing unboundedly
    /// across a long, chatty session.
    pub fn observe(&mut self, platform_id: &str, kind: NameKind, name: &str, ts: i64) {
        if name.is_empty() {
            return;
        }
        let map = match kind {
            NameKind::AccountName => &mut self.account,
            NameKind::GroupNickname => &mut self.nickname,
        };
        let entries = map.entry(platform_id.to_string()).or_default();
        if entries.last().is_some_and(|last| last.name == name) {
            return;
        }
        entries.push(Observation {
            name: name.to_string(),
            start_ts: ts,
        });
    }

    /// Current (latest-observed) name for `platform_id`/`kind`, used to
    /// populate the member row's denormalized name column (§4.4 step 5).
    pub fn current_name(&self, platform_id: &str, kind: NameKind) -> Option<&str> {
        let map = match kind {
            NameKind::AccountName => &self.account,
            NameKind::GroupNickname => &self.nickname,
        };
        map.get(platform_id)
            .and_then(|v| v.last())
            .map(|o| o.name.as_str())
    }

    /// Compacts observations for one member/kind into closed-then-open
    /// intervals (§4.4 step 5): dedupes consecutive identical names
    /// (already mostly done by [`Self::observe`], but observations may
    /// arrive out of order across batches), requires at least two
    /// distinct names to persist any history at all, closes each entry's
    /// end at the next entry's start, and leaves the last entry open.
    pub fn compact(&self, platform_id: &str, kind: NameKind) -> Vec<CompactedEntry> {
        let map = match kind {
            NameKind::AccountName => &self.account,
            NameKind::GroupNickname => &self.nickname,
        };
        let Some(observations) = map.get(platform_id) else {
            return vec![];
        };

        let mut sorted = observations.clone();
        sorted.sort_by_key(|o| o.start_ts);

        let mut deduped: Vec<Observation> = Vec::with_capacity(sorted.len());
        for obs in sorted {
            if deduped.last().is_some_and(|last| last.name == obs.name) {
                continue;
            }
            deduped.push(obs);
        }

        if deduped.len() < 2 {
            return vec![];
        }

        let mut entries = Vec::with_capacity(deduped.len());
        for i in 0..deduped.len() {
            let end_ts = deduped.get(i + 1).map(|next| next.start_ts);
            entries.push(CompactedEntry {
                name_type: kind,
                name: deduped[i].name.clone(),
                start_ts: deduped[i].start_ts,
                end_ts,
            });
        }
        entries
    }

    /// All platform ids observed under `kind`, for driving compaction
    /// across the whole session at end of import.
    pub fn platform_ids(&self, kind: NameKind) -> Vec<String> {
        let map = match kind {
            NameKind::AccountName => &self.account,
            NameKind::GroupNickname => &self.nickname,
        };
        map.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compacts_alternating_names_into_closed_then_open_intervals() {
        let mut tracker = NicknameTracker::new();
        tracker.observe("10", NameKind::AccountName, "A", 1);
        tracker.observe("10", NameKind::AccountName, "B", 2);
        tracker.observe("10", NameKind::AccountName, "B", 3);
        tracker.observe("10", NameKind::AccountName, "A", 4);

        let entries = tracker.compact("10", NameKind::AccountName);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].name, "A");
        assert_eq!(entries[0].start_ts, 1);
        assert_eq!(entries[0].end_ts, Some(2));
        assert_eq!(entries[1].name, "B");
        assert_eq!(entries[1].start_ts, 2);
        assert_eq!(entries[1].end_ts, Some(4));
        assert_eq!(entries[2].name, "A");
        assert_eq!(entries[2].start_ts, 4);
        assert_eq!(entries[2].end_ts, None);

        assert_eq!(
            tracker.current_name("10", NameKind::AccountName),
            Some("A")
        );
    }

    #[test]
    fn single_distinct_name_produces_no_history() {
        let mut tracker = NicknameTracker::new();
        tracker.observe("10", NameKind::AccountName, "A", 1);
        tracker.observe("10", NameKind::AccountName, "A", 2);
        assert!(tracker.compact("10", NameKind::AccountName).is_empty());
    }

    #[test]
    fn empty_name_is_ignored() {
        let mut tracker = NicknameTracker::new();
        tracker.observe("10", NameKind::AccountName, "", 1);
        assert!(tracker.platform_ids(NameKind::AccountName).is_empty());
    }
}
