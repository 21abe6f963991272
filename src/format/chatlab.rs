//! Canonical export parser and writer (§6.1).
//!
//! This is the only format whose writer lives alongside its parser: the
//! merger (§4.6) and an optional re-import of the merged output both need
//! to round-trip through this shape, so reader and writer are kept next
//! to each other instead of splitting across two modules.

use super::jsonscan::{ArrayItemScanner, CountingReader, extract_object_field, skip_to_array_start};
use super::{DEFAULT_BATCH_SIZE, ParserEvent, RawMember, RawMessage, RawSessionMeta, StreamParser};
use crate::error::{Error, Result};
use crate::model::{ConversationKind, Platform};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

/// `chatlab` header object; its mere presence is what the sniffer keys
/// detection on (§4.1, GLOSSARY "Canonical export").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatlabHeader {
    pub version: String,
    #[serde(rename = "exportedAt")]
    pub exported_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportSource {
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(rename = "messageCount")]
    pub message_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportMeta {
    pub name: String,
    pub platform: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<ExportSource>,
    #[serde(rename = "groupId", default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(
        rename = "groupAvatar",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub group_avatar: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExportMember {
    #[serde(rename = "platformId")]
    pub platform_id: String,
    #[serde(rename = "accountName")]
    pub account_name: String,
    #[serde(
        rename = "groupNickname",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub group_nickname: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportMessage {
    pub sender: String,
    #[serde(rename = "accountName")]
    pub account_name: String,
    #[serde(
        rename = "groupNickname",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub group_nickname: Option<String>,
    pub timestamp: i64,
    #[serde(rename = "type")]
    pub msg_type: i64,
    pub content: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalExport {
    pub chatlab: ChatlabHeader,
    pub meta: ExportMeta,
    pub members: Vec<ExportMember>,
    pub messages: Vec<ExportMessage>,
}

/// Writes a canonical export to `path`, streaming the `messages` array
/// element-by-element rather than building one giant `serde_json::Value`
/// (§4.2's memory discipline extends to writing, not just reading).
pub fn write_export(path: &Path, export: &CanonicalExport) -> Result<()> {
    let file = File::create(path)?;
    let mut w = BufWriter::new(file);

    write!(w, "{{\"chatlab\":")?;
    serde_json::to_writer(&mut w, &export.chatlab).map_err(|e| Error::Parse(e.to_string()))?;
    write!(w, ",\"meta\":")?;
    serde_json::to_writer(&mut w, &export.meta).map_err(|e| Error::Parse(e.to_string()))?;
    write!(w, ",\"members\":")?;
    serde_json::to_writer(&mut w, &export.members).map_err(|e| Error::Parse(e.to_string()))?;
    write!(w, ",\"messages\":[")?;
    for (i, msg) in export.messages.iter().enumerate() {
        if i > 0 {
            write!(w, ",")?;
        }
        serde_json::to_writer(&mut w, msg).map_err(|e| Error::Parse(e.to_string()))?;
    }
    write!(w, "]}}")?;
    w.flush()?;
    Ok(())
}

pub struct ChatlabParser;

impl StreamParser for ChatlabParser {
    fn format_id(&self) -> &'static str {
        "chatlab"
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
        let meta: ExportMeta = extract_object_field(&head, "meta")
            .ok_or_else(|| Error::Parse("meta object not found in head prefix".into()))?;

        let platform = Platform::parse(&meta.platform);
        let kind = ConversationKind::parse(&meta.kind);

        on_event(ParserEvent::Meta(RawSessionMeta {
            name: meta.name,
            platform,
            kind,
            group_id: meta.group_id,
            group_avatar: meta.group_avatar,
        }));

        let mut member_reader = CountingReader::new(BufReader::new(File::open(path)?));
        let mut members = Vec::new();
        if skip_to_array_start(&mut member_reader, "members")? {
            let mut scanner = ArrayItemScanner::new(&mut member_reader);
            while let Some(item) = scanner.next_item()? {
                let w: ExportMember = serde_json::from_slice(&item)
                    .map_err(|e| Error::Parse(format!("invalid member: {e}")))?;
                members.push(RawMember {
                    platform_id: w.platform_id,
                    account_name: w.account_name,
                    group_nickname: w.group_nickname,
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
            let w: ExportMessage = match serde_json::from_slice(&item) {
                Ok(w) => w,
                Err(_) => continue,
            };
            batch.push(RawMessage {
                sender_platform_id: Some(w.sender),
                sender_account_name: w.account_name,
                sender_group_nickname: w.group_nickname,
                ts: Some(w.timestamp),
                msg_type_raw: w.msg_type,
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_and_reparses_minimal_export() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("export.json");
        let export = CanonicalExport {
            chatlab: ChatlabHeader {
                version: "0.0.1".into(),
                exported_at: 1,
                generator: None,
                description: None,
            },
            meta: ExportMeta {
                name: "G".into(),
                platform: "qq".into(),
                kind: "group".into(),
                sources: vec![],
                group_id: None,
                group_avatar: None,
            },
            members: vec![ExportMember {
                platform_id: "10".into(),
                account_name: "A".into(),
                ..Default::default()
            }],
            messages: vec![ExportMessage {
                sender: "10".into(),
                account_name: "A".into(),
                group_nickname: None,
                timestamp: 1_700_000_000,
                msg_type: 0,
                content: Some("hi".into()),
            }],
        };
        write_export(&path, &export).unwrap();

        let mut events = Vec::new();
        ChatlabParser
            .parse(&path, 10, &mut |e| events.push(e))
            .unwrap();
        let has_one_message = events.iter().any(|e| match e {
            ParserEvent::Messages(msgs) => msgs.len() == 1,
            _ => false,
        });
        assert!(has_one_message);
    }

    #[test]
    fn empty_file_is_handled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        let mut f = File::create(&path).unwrap();
        writeln!(f, "{{}}").unwrap();
        let result = ChatlabParser.parse(&path, 10, &mut |_| {});
        assert!(result.is_err());
    }
}
