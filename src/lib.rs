//! Core library for ingesting exported chat histories from multiple
//! platforms into a per-conversation SQLite store, merging overlapping
//! exports, and serving analytic queries over the result.
//!
//! The crate is organized the way the worker host dispatches work:
//! format detection and streaming parse (`format`), the append-only
//! import pipeline and its incremental variant (`import`), nickname
//! history tracking (`nickname`), multi-source merging (`merge`), the
//! read-side query layer (`query`), and the single execution context
//! that ties them together (`worker`). `store` and `model` hold the
//! schema and the shared record types everything else passes around.

pub mod error;
pub mod format;
pub mod import;
pub mod merge;
pub mod model;
pub mod nickname;
pub mod paths;
pub mod query;
pub mod store;
pub mod worker;

pub use error::{Error, ErrorCode, ErrorPayload, Result};
pub use paths::AppPaths;
