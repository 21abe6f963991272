//! WeChat group/private export parser.
//!
//! Wire shape:
//! ```json
//! {
//!   "wx_export": { "chat_name": "...", "is_group": true, "room_id": "...", "room_avatar": "..." },
//!   "members": [ { "wxid": "...", "remark": "...", "nickname": "...", "avatar": "..." } ],
//!   "msgList": [ { "from_wxid": "...", "from_remark": "...", "from_nickname": "...",
//!                  "createTime": "2023-01-01T12:00:00Z", "type": 1, "content": "hi" } ]
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
struct WxExportMeta {
    chat_name: String,
    #[serde(default)]
    is_group: bool,
    #[serde(default)]
    room_id: Option<String>,
    #[serde(default)]
    room_avatar: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct WxMemberWire {
    wxid: String,
    #[serde(default)]
    remark: Option<String>,
    #[serde(default)]
    nickname: Option<String>,
    #[serde(default)]
    avatar: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct WxMessageWire {
    #[serde(default)]
    from_wxid: Option<String>,
    #[serde(default)]
    from_remark: Option<String>,
    #[serde(default)]
    from_nickname: Option<String>,
    #[serde(default, rename = "createTime")]
    create_time: Option<Value>,
    #[serde(default, rename = "type")]
    msg_type: Option<i64>,
    #[serde(default)]
    content: Option<String>,
}

/// WeChat's numeric type codes, mapped to the crate's own message-type
/// space rather than carried through verbatim (§3, §4.2).
fn resolve_type(raw: &WxMessageWire) -> i64 {
    if let Some(t) = raw.msg_type {
        let mapped = match t {
            1 => MessageType::Text.to_i64(),
            3 => MessageType::Image.to_i64(),
            34 => MessageType::Voice.to_i64(),
            43 => MessageType::Video.to_i64(),
            47 => MessageType::Emoji.to_i64(),
            49 => MessageType::Link.to_i64(),
            48 => MessageType::Location.to_i64(),
            10000 | 10002 => MessageType::System.to_i64(),
            other => clamp_known(other),
        };
        return mapped;
    }
    if let Some(content) = &raw.content
        && let Some(t) = heuristic_type_from_text(content)
    {
        return t.to_i64();
    }
    MessageType::Text.to_i64()
}

pub struct WechatParser;

impl StreamParser for WechatParser {
    fn format_id(&self) -> &'static str {
        "wechat"
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

        let head = super::sniffer::read_prefix(path, 64 * 1024)?;
        let wx_meta: WxExportMeta = extract_object_field(&head, "wx_export")
            .ok_or_else(|| Error::Parse("wx_export object not found in head prefix".into()))?;

        let kind = if wx_meta.is_group {
            ConversationKind::Group
        } else {
            ConversationKind::Private
        };

        on_event(ParserEvent::Meta(RawSessionMeta {
            name: wx_meta.chat_name,
            platform: Platform::Wechat,
            kind,
            group_id: wx_meta.room_id,
            group_avatar: wx_meta.room_avatar,
        }));

        let mut member_reader = CountingReader::new(BufReader::new(File::open(path)?));
        let mut members = Vec::new();
        if skip_to_array_start(&mut member_reader, "members")? {
            let mut scanner = ArrayItemScanner::new(&mut member_reader);
            while let Some(item) = scanner.next_item()? {
                let w: WxMemberWire = serde_json::from_slice(&item)
                    .map_err(|e| Error::Parse(format!("invalid wechat member: {e}")))?;
                members.push(RawMember {
                    platform_id: w.wxid,
                    account_name: w.remark.or(w.nickname).unwrap_or_default(),
                    group_nickname: None,
                    avatar: w.avatar,
                });
            }
        }
        on_event(ParserEvent::Members(members));

        let mut reader = CountingReader::new(BufReader::new(File::open(path)?));
        if !skip_to_array_start(&mut reader, "msgList")? {
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
            let w: WxMessageWire = match serde_json::from_slice(&item) {
                Ok(w) => w,
                Err(_) => continue,
            };
            let ts = w.create_time.as_ref().and_then(normalize_timestamp);
            let msg_type = resolve_type(&w);
            batch.push(RawMessage {
                sender_platform_id: w.from_wxid,
                sender_account_name: w.from_remark.or(w.from_nickname).unwrap_or_default(),
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
