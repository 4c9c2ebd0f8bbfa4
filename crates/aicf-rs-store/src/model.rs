//! Conversation record model.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Codec version that produced a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FormatVersion {
    /// `1.0`: id, timestamp, role, content, metadata.
    V1_0,
    /// `1.1`: adds the audit-mode retained raw content field.
    V1_1,
}

impl FormatVersion {
    /// Version stamped on newly constructed records.
    pub const CURRENT: Self = Self::V1_1;

    /// Tag written as the first field of each line.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::V1_0 => "1.0",
            Self::V1_1 => "1.1",
        }
    }

    /// Number of fields a line of this version carries, tag included.
    pub fn field_count(self) -> usize {
        match self {
            Self::V1_0 => 6,
            Self::V1_1 => 7,
        }
    }

    /// Look up a version by its tag.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "1.0" => Some(Self::V1_0),
            "1.1" => Some(Self::V1_1),
            _ => None,
        }
    }
}

impl Default for FormatVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl fmt::Display for FormatVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FormatVersion {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::from_tag(value).ok_or_else(|| format!("unsupported format version {value:?}"))
    }
}

/// Originator of a conversation turn.
///
/// Unknown values are preserved in `Other` so newer writers stay readable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
    Other(String),
}

impl Role {
    /// Wire representation of the role.
    pub fn as_str(&self) -> &str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
            Self::Tool => "tool",
            Self::Other(value) => value,
        }
    }
}

impl From<&str> for Role {
    fn from(value: &str) -> Self {
        match value {
            "user" => Self::User,
            "assistant" => Self::Assistant,
            "system" => Self::System,
            "tool" => Self::Tool,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One conversation turn plus metadata; one line on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationRecord {
    /// Identifier, unique per store.
    pub id: String,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
    /// Turn originator.
    pub role: Role,
    /// Free-form text payload.
    pub content: String,
    /// Session id, model name, token counts and similar.
    pub metadata: BTreeMap<String, String>,
    /// Encoding rules that produced (or will produce) this record.
    pub format_version: FormatVersion,
    /// Pre-redaction content, kept only in audit mode.
    pub retained_raw: Option<String>,
}

impl ConversationRecord {
    /// Create a record with a time-ordered id and the current time.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            timestamp: Utc::now(),
            role,
            content: content.into(),
            metadata: BTreeMap::new(),
            format_version: FormatVersion::CURRENT,
            retained_raw: None,
        }
    }

    /// Replace the generated id with a caller-assigned one.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Replace the creation time.
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Insert a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Longest accepted record id, in characters.
pub(crate) const MAX_ID_CHARS: usize = 128;

/// Ids are 1..=128 chars without whitespace or control characters.
pub(crate) fn is_well_formed_id(id: &str) -> bool {
    !id.is_empty()
        && id.chars().count() <= MAX_ID_CHARS
        && !id.chars().any(|ch| ch.is_whitespace() || ch.is_control())
}
