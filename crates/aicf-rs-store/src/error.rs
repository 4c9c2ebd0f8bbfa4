//! Error types for store operations.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Errors returned by the path guard, writer and reader.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Requested path resolves outside the store root.
    #[error("path traversal rejected for {requested:?}: {reason}")]
    PathTraversal { requested: String, reason: String },
    /// Append lock was not acquired before the deadline.
    #[error("timed out after {waited:?} waiting for append lock on {}", .path.display())]
    LockTimeout { path: PathBuf, waited: Duration },
    /// Record violates size or shape constraints.
    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),
    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Store file does not exist.
    #[error("store not found: {}", .0.display())]
    StoreNotFound(PathBuf),
    /// Invalid store root.
    #[error("invalid store root: {0}")]
    InvalidRoot(String),
    /// Regex compilation error.
    #[error("regex error: {0}")]
    Regex(String),
    /// Blocking task failed to complete.
    #[error("store task failed: {0}")]
    Task(String),
}

impl StoreError {
    pub(crate) fn traversal(requested: &str, reason: impl Into<String>) -> Self {
        Self::PathTraversal {
            requested: requested.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether retrying the same operation later can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockTimeout { .. })
    }
}

/// Reasons a record cannot be encoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    /// Content exceeds the configured maximum field size.
    #[error("content is {size} bytes, limit is {max}")]
    ContentTooLarge { size: usize, max: usize },
    /// Encoded line exceeds the longest line readers accept.
    #[error("encoded line is {size} bytes, limit is {max}")]
    LineTooLong { size: usize, max: usize },
    /// Record id is empty, too long, or contains whitespace/control characters.
    #[error("invalid record id: {0:?}")]
    InvalidId(String),
    /// Role value is empty.
    #[error("record role is empty")]
    EmptyRole,
    /// Custom role spelled like a built-in one; it would decode as the built-in.
    #[error("custom role {0:?} shadows a built-in role")]
    ShadowedRole(String),
    /// Timestamp year cannot be written as four RFC 3339 digits.
    #[error("timestamp {0} is outside years 0000-9999")]
    InvalidTimestamp(String),
    /// Metadata key is empty.
    #[error("metadata keys must not be empty")]
    EmptyMetadataKey,
    /// Record carries a field its format version cannot represent.
    #[error("format version {version} cannot carry {field}")]
    UnsupportedField {
        version: &'static str,
        field: &'static str,
    },
    /// Retained raw content is present but empty.
    #[error("retained raw content must not be empty")]
    EmptyRetainedRaw,
}

/// Why a line failed to decode.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedReason {
    /// Line is empty.
    #[error("empty line")]
    EmptyLine,
    /// Line bytes are not UTF-8.
    #[error("line is not valid utf-8")]
    InvalidUtf8,
    /// Line has no terminating newline (truncated write).
    #[error("line is missing its terminating newline")]
    Truncated,
    /// Line exceeds the reader's line limit.
    #[error("line is {len} bytes, limit is {max}")]
    LineTooLong { len: usize, max: usize },
    /// Version tag is not one the codec knows.
    #[error("unsupported format version {0:?}")]
    UnsupportedVersion(String),
    /// Field count does not match the version schema.
    #[error("format {version} expects {expected} fields, found {found}")]
    FieldCount {
        version: &'static str,
        expected: usize,
        found: usize,
    },
    /// Bad escape sequence.
    #[error("invalid escape sequence at byte {0}")]
    InvalidEscape(usize),
    /// Record id is not well-formed.
    #[error("invalid record id")]
    InvalidId,
    /// Timestamp is not RFC 3339.
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),
    /// Role field is empty.
    #[error("missing role")]
    MissingRole,
    /// Metadata field does not parse.
    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),
}

/// A line that could not be decoded, kept as data rather than raised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedRecord {
    /// 1-based line number, set by the reader.
    pub line: Option<u64>,
    /// Offending bytes without the line terminator.
    pub raw: Vec<u8>,
    /// Diagnostic.
    pub reason: MalformedReason,
}

impl MalformedRecord {
    pub(crate) fn new(raw: &[u8], reason: MalformedReason) -> Self {
        Self {
            line: None,
            raw: raw.to_vec(),
            reason,
        }
    }

    pub(crate) fn at_line(mut self, line: u64) -> Self {
        self.line = Some(line);
        self
    }
}

impl fmt::Display for MalformedRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "malformed record at line {line}: {}", self.reason),
            None => write!(f, "malformed record: {}", self.reason),
        }
    }
}

impl std::error::Error for MalformedRecord {}
