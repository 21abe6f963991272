//! Shared timestamp and message-type normalization helpers used by every
//! per-format parser (§4.2).

use crate::model::{MessageType, PLAUSIBLE_YEAR_MAX, PLAUSIBLE_YEAR_MIN};
use chrono::{DateTime, Datelike, TimeZone, Utc};
use serde_json::Value;

/// Heuristic threshold distinguishing millisecond from second epoch
/// values: seconds since epoch for year 2100 is well under this.
const MS_MAGNITUDE_THRESHOLD: i64 = 10_000_000_000;

/// Accepts integer seconds, integer milliseconds, or an ISO-8601 string
/// (§4.2); returns `None` (message dropped, §8 scenario 2) when the
/// resulting year falls outside the plausibility window.
pub fn normalize_timestamp(raw: &Value) -> Option<i64> {
    let seconds = match raw {
        Value::Number(n) => {
            let v = n.as_i64()?;
            if v.unsigned_abs() as i64 > MS_MAGNITUDE_THRESHOLD {
                v / 1000
            } else {
                v
            }
        }
        Value::String(s) => {
            if let Ok(v) = s.parse::<i64>() {
                if v.unsigned_abs() as i64 > MS_MAGNITUDE_THRESHOLD {
                    v / 1000
                } else {
                    v
                }
            } else {
                DateTime::parse_from_rfc3339(s)
                    .map(|dt| dt.with_timezone(&Utc).timestamp())
                    .ok()?
            }
        }
        _ => return None,
    };
    plausible(seconds).then_some(seconds)
}

fn plausible(seconds: i64) -> bool {
    if seconds < 0 {
        return false;
    }
    match Utc.timestamp_opt(seconds, 0).single() {
        Some(dt) => {
            let y = dt.year();
            (PLAUSIBLE_YEAR_MIN..=PLAUSIBLE_YEAR_MAX).contains(&y)
        }
        None => false,
    }
}

/// Textual-content heuristics layered on top of per-format type tables
/// (§4.2): markers like `[图片]`/`红包` push ambiguous "text" rows into
/// their real type when a format doesn't carry an explicit type field
/// for that message.
pub fn heuristic_type_from_text(content: &str) -> Option<MessageType> {
    let table: &[(&str, MessageType)] = &[
        ("[图片]", MessageType::Image),
        ("[动画表情]", MessageType::Emoji),
        ("[语音]", MessageType::Voice),
        ("[视频]", MessageType::Video),
        ("[文件]", MessageType::File),
        ("红包", MessageType::RedPacket),
        ("[位置]", MessageType::Location),
        ("拍了拍", MessageType::Poke),
        ("[转账]", MessageType::Transfer),
        ("撤回了一条消息", MessageType::Recall),
    ];
    table
        .iter()
        .find(|(marker, _)| content.contains(marker))
        .map(|(_, t)| *t)
}

pub fn clamp_known(raw_type: i64) -> i64 {
    if crate::model::MessageType::is_known(raw_type) {
        raw_type
    } else {
        MessageType::Other.to_i64()
    }
}
