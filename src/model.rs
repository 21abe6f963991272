//! Core data model (§3). Plain structs shared by the store, parsers,
//! importer, merger and query layer.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Qq,
    Wechat,
    Discord,
    Mixed,
    Unknown,
}

impl Platform {
    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Qq => "qq",
            Platform::Wechat => "wechat",
            Platform::Discord => "discord",
            Platform::Mixed => "mixed",
            Platform::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "qq" => Platform::Qq,
            "wechat" => Platform::Wechat,
            "discord" => Platform::Discord,
            "mixed" => Platform::Mixed,
            _ => Platform::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    Group,
    Private,
}

impl ConversationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ConversationKind::Group => "group",
            ConversationKind::Private => "private",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "private" => ConversationKind::Private,
            _ => ConversationKind::Group,
        }
    }
}

/// Wire-stable message type enum (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    Text = 0,
    Image = 1,
    Voice = 2,
    Video = 3,
    File = 4,
    Emoji = 5,
    Link = 7,
    Location = 8,
    RedPacket = 20,
    Transfer = 21,
    Poke = 22,
    Call = 23,
    Share = 24,
    Reply = 25,
    Forward = 26,
    Contact = 27,
    System = 80,
    Recall = 81,
    Other = 99,
}

impl MessageType {
    pub fn from_i64(v: i64) -> Self {
        match v {
            0 => MessageType::Text,
            1 => MessageType::Image,
            2 => MessageType::Voice,
            3 => MessageType::Video,
            4 => MessageType::File,
            5 => MessageType::Emoji,
            7 => MessageType::Link,
            8 => MessageType::Location,
            20 => MessageType::RedPacket,
            21 => MessageType::Transfer,
            22 => MessageType::Poke,
            23 => MessageType::Call,
            24 => MessageType::Share,
            25 => MessageType::Reply,
            26 => MessageType::Forward,
            27 => MessageType::Contact,
            80 => MessageType::System,
            81 => MessageType::Recall,
            _ => MessageType::Other,
        }
    }

    pub fn to_i64(self) -> i64 {
        self as i64
    }

    /// True for base (0-19), interactive (20-39) and system (80-89)
    /// enum ranges taken directly from §3; anything outside these ranges
    /// collapses to `other` at the call site via [`MessageType::from_i64`].
    pub fn is_known(v: i64) -> bool {
        matches!(v, 0..=19 | 20..=39 | 80..=89 | 99)
    }
}

/// Name kind distinguishing the two tracked per-member histories (§3, §6.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NameKind {
    AccountName,
    GroupNickname,
}

impl NameKind {
    pub fn column(self) -> &'static str {
        match self {
            NameKind::AccountName => "account_name",
            NameKind::GroupNickname => "group_nickname",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMeta {
    pub id: String,
    pub name: String,
    pub platform: Platform,
    pub kind: ConversationKind,
    pub imported_at: i64,
    pub group_id: Option<String>,
    pub group_avatar: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Member {
    pub id: i64,
    pub platform_id: String,
    pub account_name: String,
    pub group_nickname: Option<String>,
    pub aliases: Vec<String>,
    pub avatar: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NameHistoryEntry {
    pub id: i64,
    pub member_id: i64,
    pub name_type: NameKind,
    pub name: String,
    pub start_ts: i64,
    pub end_ts: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub sender_id: i64,
    pub sender_account_name: String,
    pub sender_group_nickname: Option<String>,
    pub ts: i64,
    pub msg_type: MessageType,
    pub content: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionIndexEntry {
    pub id: i64,
    pub start_ts: i64,
    pub end_ts: i64,
    pub message_count: i64,
    pub first_message_id: i64,
}

/// The uniform filter from §4.7, composed conjunctively.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Filter {
    pub start_ts: Option<i64>,
    pub end_ts: Option<i64>,
    pub member_id: Option<i64>,
}

impl Filter {
    /// System-author exclusion is always appended (§4.7).
    pub const SYSTEM_AUTHOR: &'static str = "系统消息";

    pub fn where_clause(&self) -> (String, Vec<rusqlite::types::Value>) {
        let mut clauses = vec!["sender_account_name != ?".to_string()];
        let mut params: Vec<rusqlite::types::Value> = vec![Self::SYSTEM_AUTHOR.to_string().into()];
        if let Some(start) = self.start_ts {
            clauses.push("ts >= ?".to_string());
            params.push(start.into());
        }
        if let Some(end) = self.end_ts {
            clauses.push("ts <= ?".to_string());
            params.push(end.into());
        }
        if let Some(member_id) = self.member_id {
            clauses.push("sender_id = ?".to_string());
            params.push(member_id.into());
        }
        (clauses.join(" AND "), params)
    }
}

pub const PLAUSIBLE_YEAR_MIN: i32 = 1999;
pub const PLAUSIBLE_YEAR_MAX: i32 = 2100;
