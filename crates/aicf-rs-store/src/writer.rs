//! Streaming writer: scan, encode and append one record at a time.

use crate::codec;
use crate::error::{EncodeError, StoreError};
use crate::guard::PathGuard;
use crate::lock::LockTable;
use crate::model::{ConversationRecord, FormatVersion};
use crate::pii::{PiiCategory, PiiScanner, RedactionAnnotation};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Limits and policy applied to every append.
#[derive(Debug, Clone, PartialEq)]
pub struct WriterSettings {
    /// Version stamped on every written record.
    pub format_version: FormatVersion,
    /// Largest accepted `content`, in bytes, before redaction.
    pub max_content_bytes: usize,
    /// Largest encoded line, terminator included.
    pub max_line_bytes: usize,
    /// How long an append waits for the store lock.
    pub lock_timeout: Duration,
    /// Flush file data to disk before releasing the lock.
    pub fsync: bool,
    /// Scan metadata values as well as content.
    pub scan_metadata: bool,
    /// Keep pre-redaction content on the record (audit mode).
    pub retain_raw: bool,
}

impl Default for WriterSettings {
    fn default() -> Self {
        Self {
            format_version: FormatVersion::CURRENT,
            max_content_bytes: 1024 * 1024,
            max_line_bytes: 8 * 1024 * 1024,
            lock_timeout: Duration::from_millis(5000),
            fsync: true,
            scan_metadata: true,
            retain_raw: false,
        }
    }
}

/// Field a redaction was applied to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedactedField {
    Content,
    Metadata(String),
}

/// Redactions applied to one field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldRedaction {
    pub field: RedactedField,
    pub annotations: Vec<RedactionAnnotation>,
}

/// Outcome of a successful append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendAck {
    /// Id of the written record.
    pub id: String,
    /// Bytes appended, including any terminator added to a torn tail.
    pub bytes_written: usize,
    /// Redactions applied before encoding, by field.
    pub redactions: Vec<FieldRedaction>,
    /// Timestamp is earlier than the previous append to this store.
    pub out_of_order: bool,
}

impl AppendAck {
    /// Redaction counts per category across all fields.
    pub fn category_counts(&self) -> BTreeMap<PiiCategory, usize> {
        let mut counts = BTreeMap::new();
        for annotation in self.redactions.iter().flat_map(|field| &field.annotations) {
            *counts.entry(annotation.category).or_insert(0) += 1;
        }
        counts
    }

    /// Total replaced spans.
    pub fn redaction_count(&self) -> usize {
        self.redactions
            .iter()
            .map(|field| field.annotations.len())
            .sum()
    }
}

/// A store path that already passed the path guard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreHandle {
    requested: String,
    path: PathBuf,
}

impl StoreHandle {
    /// Canonical store path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path as the caller asked for it.
    pub fn requested(&self) -> &str {
        &self.requested
    }
}

/// Record ready to be appended.
struct Prepared {
    id: String,
    timestamp: DateTime<Utc>,
    line: String,
    redactions: Vec<FieldRedaction>,
}

/// Appends records to stores under one root.
#[derive(Debug)]
pub struct StoreWriter {
    guard: PathGuard,
    scanner: Arc<PiiScanner>,
    locks: Arc<LockTable>,
    settings: WriterSettings,
    last_timestamps: Mutex<HashMap<PathBuf, DateTime<Utc>>>,
}

impl StoreWriter {
    /// Create a writer that coordinates through the process-wide lock table.
    pub fn new(guard: PathGuard, scanner: Arc<PiiScanner>, mut settings: WriterSettings) -> Self {
        if settings.retain_raw && settings.format_version == FormatVersion::V1_0 {
            log::warn!("raw retention needs format 1.1; disabled (format_version=1.0)");
            settings.retain_raw = false;
        }
        if settings.retain_raw {
            log::warn!(
                "raw audit retention enabled (root={})",
                guard.root().display()
            );
        }
        log::info!(
            "store writer ready (root={}, format_version={}, fsync={})",
            guard.root().display(),
            settings.format_version,
            settings.fsync
        );
        Self {
            guard,
            scanner,
            locks: LockTable::shared(),
            settings,
            last_timestamps: Mutex::new(HashMap::new()),
        }
    }

    /// Coordinate through `locks` instead of the process-wide table.
    pub fn with_lock_table(mut self, locks: Arc<LockTable>) -> Self {
        self.locks = locks;
        self
    }

    pub fn settings(&self) -> &WriterSettings {
        &self.settings
    }

    pub fn guard(&self) -> &PathGuard {
        &self.guard
    }

    /// Resolve `requested` through the path guard.
    pub fn handle(&self, requested: &str) -> Result<StoreHandle, StoreError> {
        let path = self.guard.resolve(requested)?;
        Ok(StoreHandle {
            requested: requested.to_string(),
            path,
        })
    }

    /// Redact, encode and durably append `record`.
    ///
    /// The lock is held only around the file write; it is released on every
    /// exit path. A failed write is rolled back so no partial line remains.
    pub fn append(
        &self,
        handle: &StoreHandle,
        record: ConversationRecord,
    ) -> Result<AppendAck, StoreError> {
        let prepared = self.prepare(record)?;

        if let Some(parent) = handle.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = open_append(&handle.path).map_err(|err| {
            if is_symlink_refusal(&err) {
                StoreError::traversal(&handle.requested, "store file is a symlink")
            } else {
                StoreError::Io(err)
            }
        })?;

        let lock = self
            .locks
            .acquire(&handle.path, file, self.settings.lock_timeout)?;
        let bytes_written =
            write_line(lock.file(), prepared.line.as_bytes(), self.settings.fsync)?;
        let out_of_order = self.note_timestamp(&handle.path, prepared.timestamp);
        drop(lock);

        if out_of_order {
            log::warn!(
                "out-of-order timestamp appended (path={}, id={})",
                handle.path.display(),
                prepared.id
            );
        }
        let ack = AppendAck {
            id: prepared.id,
            bytes_written,
            redactions: prepared.redactions,
            out_of_order,
        };
        log::debug!(
            "record appended (path={}, id={}, bytes={}, redactions={})",
            handle.path.display(),
            ack.id,
            ack.bytes_written,
            ack.redaction_count()
        );
        Ok(ack)
    }

    /// Pure per-record work, done before any lock is taken.
    fn prepare(&self, mut record: ConversationRecord) -> Result<Prepared, StoreError> {
        let size = record.content.len();
        if size > self.settings.max_content_bytes {
            return Err(EncodeError::ContentTooLarge {
                size,
                max: self.settings.max_content_bytes,
            }
            .into());
        }

        let mut redactions = Vec::new();
        let scanned = self.scanner.scan(&record.content);
        // Only the writer sets this field; caller-provided raw text would
        // bypass the scan.
        record.retained_raw = None;
        if scanned.is_redacted() {
            let raw = std::mem::replace(&mut record.content, scanned.text);
            if self.settings.retain_raw {
                record.retained_raw = Some(raw);
            }
            redactions.push(FieldRedaction {
                field: RedactedField::Content,
                annotations: scanned.annotations,
            });
        }

        if self.settings.scan_metadata {
            for (key, value) in record.metadata.iter_mut() {
                let scanned = self.scanner.scan(value);
                if scanned.is_redacted() {
                    *value = scanned.text;
                    redactions.push(FieldRedaction {
                        field: RedactedField::Metadata(key.clone()),
                        annotations: scanned.annotations,
                    });
                }
            }
        }

        record.format_version = self.settings.format_version;
        let line = codec::encode(&record)?;
        if line.len() > self.settings.max_line_bytes {
            return Err(EncodeError::LineTooLong {
                size: line.len(),
                max: self.settings.max_line_bytes,
            }
            .into());
        }
        Ok(Prepared {
            id: record.id,
            timestamp: record.timestamp,
            line,
            redactions,
        })
    }

    /// Record the latest timestamp for `path`; true if `timestamp` goes back.
    fn note_timestamp(&self, path: &Path, timestamp: DateTime<Utc>) -> bool {
        let mut last = self.last_timestamps.lock();
        match last.get_mut(path) {
            Some(previous) if timestamp < *previous => true,
            Some(previous) => {
                *previous = timestamp;
                false
            }
            None => {
                last.insert(path.to_path_buf(), timestamp);
                false
            }
        }
    }
}

/// Open for append, creating the file; never follows a final symlink.
fn open_append(path: &Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.read(true).append(true).create(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.custom_flags(libc::O_NOFOLLOW);
    }
    options.open(path)
}

fn is_symlink_refusal(err: &io::Error) -> bool {
    #[cfg(unix)]
    {
        err.raw_os_error() == Some(libc::ELOOP)
    }
    #[cfg(not(unix))]
    {
        let _ = err;
        false
    }
}

/// Whether the file ends in a partial line left by an interrupted write.
fn has_torn_tail(file: &File, len: u64) -> io::Result<bool> {
    if len == 0 {
        return Ok(false);
    }
    let mut last = [0u8; 1];
    let mut cursor = file;
    cursor.seek(SeekFrom::Start(len - 1))?;
    cursor.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

/// Append one line as a single write, truncating back on failure.
///
/// A torn tail is terminated first so the new record starts its own line.
/// Returns the number of bytes appended.
fn write_line(file: &File, line: &[u8], fsync: bool) -> Result<usize, StoreError> {
    let start = file.metadata()?.len();
    let torn = has_torn_tail(file, start)?;
    let mut payload = Vec::with_capacity(line.len() + usize::from(torn));
    if torn {
        log::warn!("terminating torn tail before append (len={start})");
        payload.push(b'\n');
    }
    payload.extend_from_slice(line);

    let mut out = file;
    let written = out
        .write_all(&payload)
        .and_then(|()| if fsync { file.sync_data() } else { Ok(()) });
    if let Err(err) = written {
        log::warn!("append failed, rolling back (len={start}, err={err})");
        if let Err(rollback) = file.set_len(start) {
            log::warn!("append rollback failed (err={rollback})");
        }
        return Err(StoreError::Io(err));
    }
    Ok(payload.len())
}

#[cfg(test)]
mod tests {
    use super::{RedactedField, StoreWriter, WriterSettings};
    use crate::codec;
    use crate::error::{EncodeError, StoreError};
    use crate::guard::PathGuard;
    use crate::lock::LockTable;
    use crate::model::{ConversationRecord, FormatVersion, Role};
    use crate::pii::{PiiCategory, PiiScanner};
    use chrono::{Duration as ChronoDuration, Utc};
    use pretty_assertions::assert_eq;
    use std::fs::{self, OpenOptions};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::{TempDir, tempdir};

    fn writer_with(temp: &TempDir, settings: WriterSettings) -> StoreWriter {
        let guard = PathGuard::new(temp.path()).expect("guard");
        let scanner = Arc::new(PiiScanner::new().expect("scanner"));
        StoreWriter::new(guard, scanner, settings).with_lock_table(LockTable::new())
    }

    fn lines(writer: &StoreWriter, name: &str) -> Vec<String> {
        fs::read_to_string(writer.guard().root().join(name))
            .expect("read")
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn append_writes_one_decodable_line() {
        let temp = tempdir().expect("tempdir");
        let writer = writer_with(&temp, WriterSettings::default());
        let handle = writer.handle("chat.aicf").expect("handle");
        let record = ConversationRecord::new(Role::User, "hello").with_id("turn-1");

        let ack = writer.append(&handle, record.clone()).expect("append");
        assert_eq!(ack.id, "turn-1");
        assert!(ack.redactions.is_empty());
        assert!(!ack.out_of_order);

        let written = lines(&writer, "chat.aicf");
        assert_eq!(written.len(), 1);
        assert_eq!(ack.bytes_written, written[0].len() + 1);
        assert_eq!(codec::decode(written[0].as_bytes()).expect("decode"), record);
    }

    #[test]
    fn content_is_redacted_before_it_reaches_disk() {
        let temp = tempdir().expect("tempdir");
        let writer = writer_with(&temp, WriterSettings::default());
        let handle = writer.handle("chat.aicf").expect("handle");
        let record = ConversationRecord::new(Role::User, "my SSN is 123-45-6789");

        let ack = writer.append(&handle, record).expect("append");
        assert_eq!(ack.redactions.len(), 1);
        assert_eq!(ack.redactions[0].field, RedactedField::Content);
        assert_eq!(ack.category_counts().get(&PiiCategory::Ssn), Some(&1));

        let raw = fs::read_to_string(handle.path()).expect("read");
        assert!(raw.contains("[REDACTED:ssn]"));
        assert!(!raw.contains("123-45-6789"));
    }

    #[test]
    fn metadata_scanning_follows_settings() {
        let temp = tempdir().expect("tempdir");
        let record = ConversationRecord::new(Role::User, "hi")
            .with_metadata("contact", "jane@example.com");

        let scanning = writer_with(&temp, WriterSettings::default());
        let handle = scanning.handle("scanned.aicf").expect("handle");
        let ack = scanning.append(&handle, record.clone()).expect("append");
        assert_eq!(
            ack.redactions[0].field,
            RedactedField::Metadata("contact".to_string())
        );

        let plain = writer_with(
            &temp,
            WriterSettings {
                scan_metadata: false,
                ..WriterSettings::default()
            },
        );
        let handle = plain.handle("plain.aicf").expect("handle");
        let ack = plain.append(&handle, record).expect("append");
        assert!(ack.redactions.is_empty());
        assert!(
            fs::read_to_string(handle.path())
                .expect("read")
                .contains("jane@example.com")
        );
    }

    #[test]
    fn oversized_content_is_rejected_without_touching_the_file() {
        let temp = tempdir().expect("tempdir");
        let locks = LockTable::new();
        let writer = writer_with(
            &temp,
            WriterSettings {
                max_content_bytes: 8,
                ..WriterSettings::default()
            },
        )
        .with_lock_table(Arc::clone(&locks));
        let handle = writer.handle("chat.aicf").expect("handle");

        let err = writer
            .append(&handle, ConversationRecord::new(Role::User, "123456789"))
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Encode(EncodeError::ContentTooLarge { size: 9, max: 8 })
        ));
        assert!(!handle.path().exists());
        assert!(locks.is_empty());
    }

    #[test]
    fn encoded_line_must_fit_line_limit() {
        let temp = tempdir().expect("tempdir");
        let writer = writer_with(
            &temp,
            WriterSettings {
                max_line_bytes: 64,
                ..WriterSettings::default()
            },
        );
        let handle = writer.handle("chat.aicf").expect("handle");
        let err = writer
            .append(&handle, ConversationRecord::new(Role::User, "x".repeat(40)))
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Encode(EncodeError::LineTooLong { max: 64, .. })
        ));
    }

    #[test]
    fn audit_mode_keeps_raw_content_only_when_redacted() {
        let temp = tempdir().expect("tempdir");
        let writer = writer_with(
            &temp,
            WriterSettings {
                retain_raw: true,
                ..WriterSettings::default()
            },
        );
        let handle = writer.handle("audit.aicf").expect("handle");
        writer
            .append(&handle, ConversationRecord::new(Role::User, "ssn 123-45-6789"))
            .expect("append");
        writer
            .append(&handle, ConversationRecord::new(Role::User, "noted"))
            .expect("append");

        let written = lines(&writer, "audit.aicf");
        let first = codec::decode(written[0].as_bytes()).expect("decode");
        let second = codec::decode(written[1].as_bytes()).expect("decode");
        assert_eq!(first.content, "ssn [REDACTED:ssn]");
        assert_eq!(first.retained_raw.as_deref(), Some("ssn 123-45-6789"));
        assert_eq!(second.retained_raw, None);
    }

    #[test]
    fn caller_supplied_raw_content_is_dropped() {
        let temp = tempdir().expect("tempdir");
        let writer = writer_with(&temp, WriterSettings::default());
        let handle = writer.handle("chat.aicf").expect("handle");
        let mut record = ConversationRecord::new(Role::User, "fine");
        record.retained_raw = Some("123-45-6789".to_string());
        writer.append(&handle, record).expect("append");

        let raw = fs::read_to_string(handle.path()).expect("read");
        assert!(!raw.contains("123-45-6789"));
    }

    #[test]
    fn writer_stamps_its_format_version() {
        let temp = tempdir().expect("tempdir");
        let writer = writer_with(
            &temp,
            WriterSettings {
                format_version: FormatVersion::V1_0,
                retain_raw: true,
                ..WriterSettings::default()
            },
        );
        assert!(!writer.settings().retain_raw);
        let handle = writer.handle("legacy.aicf").expect("handle");
        writer
            .append(&handle, ConversationRecord::new(Role::User, "ssn 123-45-6789"))
            .expect("append");
        let written = lines(&writer, "legacy.aicf");
        assert!(written[0].starts_with("1.0|"));
        let record = codec::decode(written[0].as_bytes()).expect("decode");
        assert_eq!(record.format_version, FormatVersion::V1_0);
        assert_eq!(record.retained_raw, None);
    }

    #[test]
    fn earlier_timestamps_are_flagged_not_rejected() {
        let temp = tempdir().expect("tempdir");
        let writer = writer_with(&temp, WriterSettings::default());
        let handle = writer.handle("chat.aicf").expect("handle");
        let now = Utc::now();

        let first = writer
            .append(
                &handle,
                ConversationRecord::new(Role::User, "a").with_timestamp(now),
            )
            .expect("append");
        let second = writer
            .append(
                &handle,
                ConversationRecord::new(Role::User, "b")
                    .with_timestamp(now - ChronoDuration::seconds(5)),
            )
            .expect("append");
        assert!(!first.out_of_order);
        assert!(second.out_of_order);
        assert_eq!(lines(&writer, "chat.aicf").len(), 2);
    }

    #[test]
    fn lock_timeout_leaves_store_untouched() {
        let temp = tempdir().expect("tempdir");
        let locks = LockTable::new();
        let writer = writer_with(
            &temp,
            WriterSettings {
                lock_timeout: Duration::from_millis(30),
                ..WriterSettings::default()
            },
        )
        .with_lock_table(Arc::clone(&locks));
        let handle = writer.handle("chat.aicf").expect("handle");
        let holder = OpenOptions::new()
            .append(true)
            .create(true)
            .open(handle.path())
            .expect("open");
        let _held = locks
            .acquire(handle.path(), holder, Duration::from_secs(1))
            .expect("acquire");

        let err = writer
            .append(&handle, ConversationRecord::new(Role::User, "blocked"))
            .unwrap_err();
        assert!(matches!(err, StoreError::LockTimeout { .. }));
        assert_eq!(fs::read_to_string(handle.path()).expect("read"), "");
    }

    #[test]
    fn torn_tail_is_terminated_before_the_next_record() {
        let temp = tempdir().expect("tempdir");
        let writer = writer_with(&temp, WriterSettings::default());
        let handle = writer.handle("chat.aicf").expect("handle");
        fs::write(handle.path(), "1.1|torn-rec").expect("seed");

        let record = ConversationRecord::new(Role::User, "after crash").with_id("next");
        let ack = writer.append(&handle, record.clone()).expect("append");
        let written = lines(&writer, "chat.aicf");
        assert_eq!(written.len(), 2);
        assert_eq!(written[0], "1.1|torn-rec");
        assert_eq!(ack.bytes_written, written[1].len() + 2);
        assert_eq!(codec::decode(written[1].as_bytes()).expect("decode"), record);
    }

    #[test]
    fn traversal_is_rejected_before_any_file_is_opened() {
        let temp = tempdir().expect("tempdir");
        let writer = writer_with(&temp, WriterSettings::default());
        let err = writer.handle("../escape.aicf").unwrap_err();
        assert!(matches!(err, StoreError::PathTraversal { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn symlink_swapped_in_after_resolution_is_refused() {
        use std::os::unix::fs::symlink;

        let outside = tempdir().expect("outside");
        let temp = tempdir().expect("tempdir");
        let writer = writer_with(&temp, WriterSettings::default());
        let handle = writer.handle("chat.aicf").expect("handle");
        symlink(outside.path().join("stolen.aicf"), handle.path()).expect("symlink");

        let err = writer
            .append(&handle, ConversationRecord::new(Role::User, "hello"))
            .unwrap_err();
        assert!(matches!(err, StoreError::PathTraversal { .. }));
        assert!(!outside.path().join("stolen.aicf").exists());
    }
}
