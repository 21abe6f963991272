//! Format registry (§4.1): ordered descriptors with priority, extension
//! and signature constraints, plus the dispatch table that replaces
//! per-format polymorphic classes (§9 Design Notes).

use super::{StreamParser, chatlab, discord, preprocess, preprocess::Preprocessor, qq, wechat};
use crate::model::Platform;
use regex::bytes::Regex;
use std::sync::Arc;

#[derive(Clone)]
pub struct Signature {
    /// Regex patterns matched against the bounded prefix; all must match
    /// at least once.
    pub patterns: Vec<Regex>,
    /// Top-level JSON field names that must appear as keys in the prefix.
    pub required_fields: Vec<&'static str>,
}

#[derive(Clone)]
pub struct FormatDescriptor {
    pub id: &'static str,
    pub display_name: &'static str,
    pub platform: Platform,
    /// Lower sorts first.
    pub priority: i32,
    pub extensions: Vec<&'static str>,
    pub signature: Signature,
    pub parser: Arc<dyn StreamParser>,
    pub preprocessor: Option<Arc<dyn Preprocessor>>,
}

pub struct Registry {
    pub formats: Vec<FormatDescriptor>,
}

impl Registry {
    /// The four formats described by SPEC_FULL.md: three platform
    /// formats plus the canonical `chatlab` export itself, registered
    /// so merge's optional re-import and general round-tripping share
    /// one streaming code path (§4.6 step 6).
    pub fn standard() -> Self {
        let formats = vec![
            FormatDescriptor {
                id: "chatlab",
                display_name: "ChatLab canonical export",
                platform: Platform::Mixed,
                priority: 0,
                extensions: vec!["json"],
                signature: Signature {
                    patterns: vec![],
                    required_fields: vec!["chatlab", "meta", "members", "messages"],
                },
                parser: Arc::new(chatlab::ChatlabParser),
                preprocessor: None,
            },
            FormatDescriptor {
                id: "qq",
                display_name: "QQ group/private export",
                platform: Platform::Qq,
                priority: 10,
                extensions: vec!["json"],
                signature: Signature {
                    patterns: vec![],
                    required_fields: vec!["qq_export", "messages"],
                },
                parser: Arc::new(qq::QqParser),
                preprocessor: Some(Arc::new(preprocess::QqPreprocessor)),
            },
            FormatDescriptor {
                id: "wechat",
                display_name: "WeChat chat export",
                platform: Platform::Wechat,
                priority: 20,
                extensions: vec!["json"],
                signature: Signature {
                    patterns: vec![],
                    required_fields: vec!["wx_export", "msgList"],
                },
                parser: Arc::new(wechat::WechatParser),
                preprocessor: None,
            },
            FormatDescriptor {
                id: "discord",
                display_name: "Discord channel export",
                platform: Platform::Discord,
                priority: 30,
                extensions: vec!["json"],
                signature: Signature {
                    patterns: vec![],
                    required_fields: vec!["guild", "channel", "messages"],
                },
                parser: Arc::new(discord::DiscordParser),
                preprocessor: None,
            },
        ];
        Self { formats }
    }

    pub fn ordered_by_priority(&self) -> Vec<&FormatDescriptor> {
        let mut v: Vec<&FormatDescriptor> = self.formats.iter().collect();
        v.sort_by_key(|f| f.priority);
        v
    }

    pub fn get(&self, id: &str) -> Option<&FormatDescriptor> {
        self.formats.iter().find(|f| f.id == id)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::standard()
    }
}
