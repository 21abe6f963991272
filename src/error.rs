//! Typed error surface shared by every layer of the core.
//!
//! Library code returns [`Error`]; the CLI binary wraps it in `eyre` for
//! human-facing context the way the teacher crate wraps `rusqlite`/`io`
//! errors with `wrap_err`.

use serde::Serialize;
use std::path::PathBuf;

/// A single unmatched-or-partially-matched format, reported back to the
/// caller when sniffing fails outright (§4.1).
#[derive(Debug, Clone, Serialize)]
pub struct PartialMatch {
    pub format_name: String,
    pub missing_fields: Vec<String>,
}

/// Attached to `unrecognized_format` errors (§6.5).
#[derive(Debug, Clone, Serialize)]
pub struct Diagnosis {
    pub suggestion: String,
    pub partial_matches: Vec<PartialMatch>,
}

/// The stable error codes from §6.5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    UnrecognizedFormat,
    MixedPlatforms,
    IoError,
    ParseError,
    MigrationRequired,
    Cancelled,
    SqlError,
    NotFound,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unrecognized format for {path}")]
    UnrecognizedFormat {
        path: PathBuf,
        diagnosis: Diagnosis,
    },

    #[error("sources report more than one platform: {platforms:?}")]
    MixedPlatforms { platforms: Vec<String> },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("store at {path} needs migration ({current} < {latest})")]
    MigrationRequired {
        path: PathBuf,
        current: i64,
        latest: i64,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("sql error: {0}")]
    Sql(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl Error {
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::UnrecognizedFormat { .. } => ErrorCode::UnrecognizedFormat,
            Error::MixedPlatforms { .. } => ErrorCode::MixedPlatforms,
            Error::Io(_) => ErrorCode::IoError,
            Error::Parse(_) => ErrorCode::ParseError,
            Error::MigrationRequired { .. } => ErrorCode::MigrationRequired,
            Error::Cancelled => ErrorCode::Cancelled,
            Error::Sql(_) => ErrorCode::SqlError,
            Error::NotFound(_) => ErrorCode::NotFound,
        }
    }

    pub fn diagnosis(&self) -> Option<&Diagnosis> {
        match self {
            Error::UnrecognizedFormat { diagnosis, .. } => Some(diagnosis),
            _ => None,
        }
    }

    /// The `{ code, message, diagnosis? }` wire shape of §6.5.
    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload {
            code: self.code(),
            message: self.to_string(),
            diagnosis: self.diagnosis().cloned(),
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Sql(e.to_string())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnosis: Option<Diagnosis>,
}

pub type Result<T> = std::result::Result<T, Error>;
