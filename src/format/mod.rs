//! Format registry, sniffer, stream parsers and preprocessors (§4.1-4.3).

pub mod chatlab;
pub mod discord;
pub mod jsonscan;
pub mod normalize;
pub mod preprocess;
pub mod qq;
pub mod registry;
pub mod sniffer;
pub mod wechat;

use crate::error::Result;
use crate::model::{ConversationKind, Platform};
use std::path::Path;

/// Raw member record observed while streaming, prior to any store write.
#[derive(Debug, Clone)]
pub struct RawMember {
    pub platform_id: String,
    pub account_name: String,
    pub group_nickname: Option<String>,
    pub avatar: Option<String>,
}

/// Raw message record observed while streaming, prior to validation.
#[derive(Debug, Clone)]
pub struct RawMessage {
    /// `None` when the sender could not be resolved — dropped by the
    /// importer per §4.4 step 4 / §7(c).
    pub sender_platform_id: Option<String>,
    pub sender_account_name: String,
    pub sender_group_nickname: Option<String>,
    /// `None` when the timestamp could not be normalized at all.
    pub ts: Option<i64>,
    pub msg_type_raw: i64,
    pub content: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RawSessionMeta {
    pub name: String,
    pub platform: Platform,
    pub kind: ConversationKind,
    pub group_id: Option<String>,
    pub group_avatar: Option<String>,
}

/// Ordered event sequence every stream parser emits (§4.2):
/// one `Meta`, one `Members`, zero-or-more `Messages` batches interleaved
/// with `Progress`, and exactly one terminal `Done`/`Error`.
#[derive(Debug, Clone)]
pub enum ParserEvent {
    Meta(RawSessionMeta),
    Members(Vec<RawMember>),
    Messages(Vec<RawMessage>),
    Progress {
        bytes_read: u64,
        total_bytes: u64,
        percentage: u8,
    },
    Done {
        total_messages: u64,
    },
    Error(String),
}

/// Default batch size for `Messages` events (§4.2).
pub const DEFAULT_BATCH_SIZE: usize = 5000;

/// Bytes read from the start of a file while sniffing (§4.1).
pub const DEFAULT_SNIFF_PREFIX: usize = 8 * 1024;

/// A format's streaming parser, driven as a pull loop by the import
/// pipeline via a push callback (§9 Design Notes: either representation
/// is acceptable; this crate picks push-callback to match the teacher's
/// synchronous style).
pub trait StreamParser: Send + Sync {
    fn format_id(&self) -> &'static str;

    fn parse(
        &self,
        path: &Path,
        batch_size: usize,
        on_event: &mut dyn FnMut(ParserEvent),
    ) -> Result<()>;
}
