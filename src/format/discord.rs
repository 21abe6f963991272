//! Discord channel/guild export parser.
//!
//! Wire shape:
//! ```json
//! {
//!   "guild": { "name": "..." },
//!   "channel": { "name": "general", "id": "..." },
//!   "members": [ { "id": "...", "nickname": "...", "username": "...", "avatar": "..." } ],
//!   "messages": [ { "authorId": "...", "username": "...", "nickname": "...",
//!                   "timestamp": "2023-01-01T12:00:00.000Z", "type": "Default", "content": "hi" } ]
//! }
//! ```

use super::jsonscan::{
    ArrayItemScanner, CountingReader, extract_object_field, skip_to_array_start,
};
use super::normalize::{heuristic_type_from_text, normalize_timestamp};
use super::{DEFAULT_BATCH_SIZE, ParserEvent, RawMember, RawMessage, RawSessionMeta, StreamParser};
use crate::error::{Error, Result};
use crate::model::{ConversationKind, MessageType, Platform};
use serde::Deserialize;
use serde_json::Value;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

#[derive(Debug, Deserialize)]
struct GuildMeta {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChannelMeta {
    name: String,
    #[serde(default)]
    id: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct DiscordMemberWire {
    id: String,
    #[serde(default)]
    nickname: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    avatar: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct DiscordMessageWire {
    #[serde(default, rename = "authorId")]
    author_id: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    nickname: Option<String>,
    #[serde(default)]
    timestamp: Option<Value>,
    #[serde(default, rename = "type")]
    msg_type: Option<String>,
    #[serde(default)]
    content: Option<String>,
}

fn resolve_type(raw: &DiscordMessageWire) -> i64 {
    if let Some(t) = &raw.msg_type {
        let mapped = match t.as_str() {
            "Default" => MessageType::Text.to_i64(),
            "Reply" => MessageType::Reply.to_i64(),
            "ChannelPinnedMessage" | "GuildMemberJoin" => MessageType::System.to_i64(),
            "Call" => MessageType::Call.to_i64(),
            _ => MessageType::Other.to_i64(),
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

pub struct DiscordParser;

impl StreamParser for DiscordParser {
    fn format_id(&self) -> &'static str {
        "discord"
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
        let guild: GuildMeta = extract_object_field(&head, "guild").unwrap_or(GuildMeta {
            name: None,
        });
        let channel: ChannelMeta = extract_object_field(&head, "channel")
            .ok_or_else(|| Error::Parse("channel object not found in head prefix".into()))?;

        let name = guild
            .name
            .map(|g| format!("{g} / #{}", channel.name))
            .unwrap_or(channel.name);

        on_event(ParserEvent::Meta(RawSessionMeta {
            name,
            platform: Platform::Discord,
            kind: ConversationKind::Group,
            group_id: channel.id,
            group_avatar: None,
        }));

        let mut member_reader = CountingReader::new(BufReader::new(File::open(path)?));
        let mut members = Vec::new();
        if skip_to_array_start(&mut member_reader, "members")? {
            let mut scanner = ArrayItemScanner::new(&mut member_reader);
            while let Some(item) = scanner.next_item()? {
                let w: DiscordMemberWire = serde_json::from_slice(&item)
                    .map_err(|e| Error::Parse(format!("invalid discord member: {e}")))?;
                members.push(RawMember {
                    platform_id: w.id,
                    account_name: w.username.unwrap_or_default(),
                    group_nickname: w.nickname,
                    avatar: w.avatar,
                });
            }
        }
        on_event(ParserEvent::Members(members));

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
            let w: DiscordMessageWire = match serde_json::from_slice(&item) {
                Ok(w) => w,
                Err(_) => continue,
            };
            let ts = w.timestamp.as_ref().and_then(normalize_timestamp);
            let msg_type = resolve_type(&w);
            batch.push(RawMessage {
                sender_platform_id: w.author_id,
                sender_account_name: w.username.unwrap_or_default(),
                sender_group_nickname: w.nickname,
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
