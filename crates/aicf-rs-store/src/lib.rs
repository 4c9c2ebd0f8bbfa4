//! Append-only conversation store: path confinement, line codec, PII
//! redaction, per-path append locking and streaming read/write.

pub mod codec;
pub mod error;
pub mod guard;
pub mod lock;
pub mod model;
pub mod pii;
pub mod provider;
pub mod reader;
pub mod writer;

/// Store error types.
pub use error::{EncodeError, MalformedReason, MalformedRecord, StoreError};
/// Path confinement.
pub use guard::PathGuard;
/// Append lock table and guard.
pub use lock::{AppendGuard, LockTable};
/// Record model.
pub use model::{ConversationRecord, FormatVersion, Role};
/// Sensitive-data scanning.
pub use pii::{
    ByteScanOutcome, PiiCategory, PiiScanner, RedactionAnnotation, ScanOptions, ScanOutcome,
};
/// Async store interface and file implementation.
pub use provider::{ConversationStore, FileConversationStore};
/// Streaming reader.
pub use reader::{ReadStats, RecordStream, StoreEntry, StoreReader};
/// Streaming writer.
pub use writer::{AppendAck, FieldRedaction, RedactedField, StoreHandle, StoreWriter, WriterSettings};
