//! The engine's single error type.
//!
//! Grounded on the `thiserror`-based `Error` enum already declared in
//! `lib.rs`; extended here to cover every failure kind spec.md §7 names.

use std::fmt;

/// The result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("io error")]
    Io(#[from] std::io::Error),

    #[error("end of file: offset {offset} + page_size {page_size} exceeds file length")]
    EndOfFile { offset: u64, page_size: u32 },

    #[error("key not found")]
    KeyNotFound,

    #[error("tree `{name}` is already managed")]
    TreeAlreadyManaged { name: String },

    #[error("tree `{name}` not found")]
    TreeNotFound { name: String },

    #[error("revision {revision} not found")]
    RevisionNotFound { revision: u64 },

    #[error("snapshot expired")]
    SnapshotExpired,

    #[error("failed to construct serializer: {0}")]
    SerializerCreation(String),

    #[error("illegal argument: {0}")]
    IllegalArgument(&'static str),

    #[error("unsupported operation: {0}")]
    UnsupportedOperation(&'static str),

    #[error("corrupt on-disk structure: {0}")]
    Corrupt(String),
}

impl Error {
    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        Error::Corrupt(msg.into())
    }
}

/// A minimal `Display` helper for holders whose decoded/serialized state
/// may legitimately be absent mid-construction (spec.md §9 OQ2): renders
/// `<unset>` rather than touching a field that might be null.
pub(crate) fn fmt_or_unset<T: fmt::Debug>(value: Option<&T>, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match value {
        Some(v) => write!(f, "{:?}", v),
        None => write!(f, "<unset>"),
    }
}
