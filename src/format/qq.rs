//! QQ group/private export parser.
//!
//! Wire shape:
//! ```json
//! {
//!   "qq_export": { "group_name": "...", "is_group": true, "group_id": "...", "group_avatar": "data:..." },
//!   "members": [ { "uin": "...", "card": "...", "nickname": "...", "avatar": "..." } ],
//!   "messages": [ { "sender_uin": "...", "sender_card": "...", "sender_nickname": "...",
//!                   "time": 1700000000, "msg_type": "text", "content": "hi" } ]
//! }
//! ```

use super::jsonscan::{
    ArrayItemScanner, CountingReader, extract_object_field, skip_to_array_start,
};
use super::normalize::{clamp_known, heuristic_type_from_text, normalize_timestamp};
use super::{DEFAULT_BATCH_SIZE, ParserEvent, RawMember, RawMessage, RawSessionMeta, StreamParser};
use crate::error::{Error, Result};
use crate::model::{ConversationKind, MessageType, Platform};
use serde::Deserialize;
use serde_json::Value;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

#[derive(Debug, Deserialize)]
struct QqExportMeta {
    group_name: String,
    #[serde(default)]
    is_group: bool,
    #[serde(default)]
    group_id: Option<String>,
    #[serde(default)]
    group_avatar: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct QqMemberWire {
    uin: String,
    #[serde(default)]
    card: Option<String>,
    #[serde(default)]
    nickname: Option<String>,
    #[serde(default)]
    avatar: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct QqMessageWire {
    #[serde(default)]
    sender_uin: Option<String>,
    #[serde(default)]
    sender_card: Option<String>,
    #[serde(default)]
    sender_nickname: Option<String>,
    #[serde(default)]
    time: Option<Value>,
    #[serde(default)]
    msg_type: Option<Value>,
    #[serde(default)]
    content: Option<String>,
}

const QQ_TYPE_TABLE: &[(&str, MessageType)] = &[
    ("text", MessageType::Text),
    ("image", MessageType::Image),
    ("voice", MessageType::Voice),
    ("video", MessageType::Video),
    ("file", MessageType::File),
    ("emoji", MessageType::Emoji),
    ("link", MessageType::Link),
    ("location", MessageType::Location),
    ("red_packet", MessageType::RedPacket),
    ("transfer", MessageType::Transfer),
    ("poke", MessageType::Poke),
    ("call", MessageType::Call),
    ("share", MessageType::Share),
    ("reply", MessageType::Reply),
    ("forward", MessageType::Forward),
    ("contact", MessageType::Contact),
    ("system", MessageType::System),
    ("recall", MessageType::Recall),
];

fn resolve_type(raw: &QqMessageWire) -> i64 {
    if let Some(v) = &raw.msg_type {
        match v {
            Value::String(s) => {
                if let Some((_, t)) = QQ_TYPE_TABLE.iter().find(|(name, _)| name == s) {
                    return t.to_i64();
                }
            }
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    return clamp_known(i);
                }
            }
            _ => {}
        }
    }
    if let Some(content) = &raw.content
        && let Some(t) = heuristic_type_from_text(content)
    {
        return t.to_i64();
    }
    MessageType::Text.to_i64()
}

pub struct QqParser;

impl StreamParser for QqParser {
    fn format_id(&self) -> &'static str {
        "qq"
    }

    fn parse(
        &self,
        path: &Path,
        batch_size: usize,
        on_event: &mut dyn FnMut(ParserEvent),
    ) -> Result<()> {
        let total_bytes = std::fs::metadata(path)?.len();
        let batch_size = if batch_size == 0 {
            DEFAULT_BATCH_SIZE
        } else {
            batch_size
        };

        // Meta: the `qq_export` object is small and always precedes
        // `members`/`messages`, so a bounded head read is sufficient.
        let head = super::sniffer::read_prefix(path, 64 * 1024)?;
        let qq_meta: QqExportMeta = extract_object_field(&head, "qq_export")
            .ok_or_else(|| Error::Parse("qq_export object not found in head prefix".into()))?;

        let kind = if qq_meta.is_group {
            ConversationKind::Group
        } else {
            ConversationKind::Private
        };

        on_event(ParserEvent::Meta(RawSessionMeta {
            name: qq_meta.group_name,
            platform: Platform::Qq,
            kind,
            group_id: qq_meta.group_id,
            group_avatar: qq_meta.group_avatar,
        }));

        // Members: scan the `members` array from the start of the file.
        let mut member_reader =
            CountingReader::new(BufReader::new(File::open(path)?));
        let mut members = Vec::new();
        if skip_to_array_start(&mut member_reader, "members")? {
            let mut scanner = ArrayItemScanner::new(&mut member_reader);
            while let Some(item) = scanner.next_item()? {
                let w: QqMemberWire = serde_json::from_slice(&item)
                    .map_err(|e| Error::Parse(format!("invalid qq member: {e}")))?;
                members.push(RawMember {
                    platform_id: w.uin,
                    account_name: w.card.or(w.nickname).unwrap_or_default(),
                    group_nickname: None,
                    avatar: w.avatar,
                });
            }
        }
        on_event(ParserEvent::Members(members));

        // Messages: a fresh streaming pass over the whole file.
        let mut reader = CountingReader::new(BufReader::new(File::open(path)?));
        if !skip_to_array_start(&mut reader, "messages")? {
            on_event(ParserEvent::Done { total_messages: 0 });
            return Ok(());
        }

        let mut batch = Vec::with_capacity(batch_size);
        let mut total_messages: u64 = 0;
        let prefix_bytes = reader.bytes_read;
        let mut scanner = ArrayItemScanner::new(&mut reader);

        loop {
            let item = match scanner.next_item() {
                Ok(Some(item)) => item,
                Ok(None) => break,
                Err(e) => {
                    on_event(ParserEvent::Error(e.to_string()));
                    return Err(e);
                }
            };
            let w: QqMessageWire = match serde_json::from_slice(&item) {
                Ok(w) => w,
                Err(_) => continue, // malformed single message: soft-dropped (§7c)
            };
            let ts = w.time.as_ref().and_then(normalize_timestamp);
            let msg_type = resolve_type(&w);
            batch.push(RawMessage {
                sender_platform_id: w.sender_uin,
                sender_account_name: w.sender_card.or(w.sender_nickname).unwrap_or_default(),
                sender_group_nickname: None,
                ts,
                msg_type_raw: msg_type,
                content: w.content,
            });
            total_messages += 1;

            if batch.len() >= batch_size {
                on_event(ParserEvent::Messages(std::mem::take(&mut batch)));
                report_progress(on_event, prefix_bytes + scanner.bytes_read(), total_bytes);
            }
        }
        if !batch.is_empty() {
            on_event(ParserEvent::Messages(batch));
        }
        report_progress(on_event, prefix_bytes + scanner.bytes_read(), total_bytes);
        on_event(ParserEvent::Done { total_messages });
        Ok(())
    }
}

fn report_progress(on_event: &mut dyn FnMut(ParserEvent), bytes_read: u64, total_bytes: u64) {
    let percentage = if total_bytes == 0 {
        100
    } else {
        ((100 * bytes_read.min(total_bytes)) as f64 / total_bytes as f64).round() as u8
    };
    on_event(ParserEvent::Progress {
        bytes_read,
        total_bytes,
        percentage,
    });
}
