//! Streaming reader over a store file.
//!
//! Lines are read into one reused buffer capped at the configured line
//! limit, so memory is bounded by the longest accepted line regardless of
//! file size. Bad lines are yielded as [`MalformedRecord`] values and
//! iteration continues.

use crate::codec;
use crate::error::{MalformedReason, MalformedRecord, StoreError};
use crate::guard::PathGuard;
use crate::model::ConversationRecord;
use crate::writer::StoreHandle;
use chrono::{DateTime, Utc};
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, ErrorKind};
use std::iter::FusedIterator;
use std::path::{Path, PathBuf};

/// Bytes of an over-long line kept for diagnostics.
const MAX_RAW_PREFIX: usize = 1024;

/// One item of a store read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEntry {
    /// A decoded record and its 1-based line number.
    Record {
        line: u64,
        record: ConversationRecord,
        /// Timestamp is earlier than an earlier record in this read.
        out_of_order: bool,
    },
    /// A line that failed to decode.
    Malformed(MalformedRecord),
}

impl StoreEntry {
    /// 1-based line number of the entry.
    pub fn line(&self) -> u64 {
        match self {
            Self::Record { line, .. } => *line,
            Self::Malformed(malformed) => malformed.line.unwrap_or_default(),
        }
    }

    pub fn record(&self) -> Option<&ConversationRecord> {
        match self {
            Self::Record { record, .. } => Some(record),
            Self::Malformed(_) => None,
        }
    }

    pub fn into_record(self) -> Option<ConversationRecord> {
        match self {
            Self::Record { record, .. } => Some(record),
            Self::Malformed(_) => None,
        }
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::Malformed(_))
    }
}

/// Counters for one pass over a store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadStats {
    pub lines: u64,
    pub records: u64,
    pub malformed: u64,
    pub out_of_order: u64,
}

/// Opens store files under one root.
#[derive(Debug, Clone)]
pub struct StoreReader {
    guard: PathGuard,
    max_line_bytes: usize,
}

impl StoreReader {
    pub fn new(guard: PathGuard, max_line_bytes: usize) -> Self {
        Self {
            guard,
            max_line_bytes,
        }
    }

    /// Resolve `requested` and open it for streaming.
    ///
    /// Fails immediately if the path escapes the root or the store is
    /// missing; nothing is read until the stream is polled.
    pub fn open(&self, requested: &str) -> Result<RecordStream, StoreError> {
        let path = self.guard.resolve(requested)?;
        self.open_resolved(requested, path)
    }

    /// Open a store through an already resolved handle.
    pub fn open_handle(&self, handle: &StoreHandle) -> Result<RecordStream, StoreError> {
        self.open_resolved(handle.requested(), handle.path().to_path_buf())
    }

    fn open_resolved(&self, requested: &str, path: PathBuf) -> Result<RecordStream, StoreError> {
        let file = open_read(&path).map_err(|err| match err.kind() {
            ErrorKind::NotFound => StoreError::StoreNotFound(path.clone()),
            _ if is_symlink_refusal(&err) => {
                StoreError::traversal(requested, "store file is a symlink")
            }
            _ => StoreError::Io(err),
        })?;
        if !file.metadata()?.is_file() {
            return Err(StoreError::Io(io::Error::new(
                ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            )));
        }
        log::info!("store opened for read (path={})", path.display());
        Ok(RecordStream {
            reader: BufReader::new(file),
            path,
            buf: Vec::new(),
            max_line_bytes: self.max_line_bytes,
            latest: None,
            stats: ReadStats::default(),
            done: false,
        })
    }
}

fn open_read(path: &Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.read(true);
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

/// Shape of the line just read into the buffer.
struct RawLine {
    /// Full line length without the terminator, even past the cap.
    len: usize,
    terminated: bool,
}

/// Lazy sequence of store entries. Only I/O failures are `Err`; the stream
/// ends after the first one.
#[derive(Debug)]
pub struct RecordStream {
    reader: BufReader<File>,
    path: PathBuf,
    buf: Vec<u8>,
    max_line_bytes: usize,
    latest: Option<DateTime<Utc>>,
    stats: ReadStats,
    done: bool,
}

impl RecordStream {
    /// Canonical path being read.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Counters for the entries yielded so far.
    pub fn stats(&self) -> ReadStats {
        self.stats
    }

    /// Read the next line into `buf`, keeping at most `max_line_bytes`.
    fn read_line(&mut self) -> io::Result<Option<RawLine>> {
        self.buf.clear();
        let mut len = 0;
        let mut terminated = false;
        loop {
            let available = match self.reader.fill_buf() {
                Ok(available) => available,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            };
            if available.is_empty() {
                break;
            }
            let newline = available.iter().position(|byte| *byte == b'\n');
            let chunk = &available[..newline.unwrap_or(available.len())];
            let room = self.max_line_bytes.saturating_sub(self.buf.len());
            self.buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
            len += chunk.len();
            let consumed = chunk.len() + usize::from(newline.is_some());
            self.reader.consume(consumed);
            if newline.is_some() {
                terminated = true;
                break;
            }
        }
        if len == 0 && !terminated {
            return Ok(None);
        }
        Ok(Some(RawLine { len, terminated }))
    }

    fn classify(&mut self, raw: RawLine, line: u64) -> StoreEntry {
        let reason = if raw.len > self.max_line_bytes {
            Some(MalformedReason::LineTooLong {
                len: raw.len,
                max: self.max_line_bytes,
            })
        } else if !raw.terminated {
            Some(MalformedReason::Truncated)
        } else {
            None
        };
        if let Some(reason) = reason {
            let keep = self.buf.len().min(MAX_RAW_PREFIX);
            return StoreEntry::Malformed(
                MalformedRecord::new(&self.buf[..keep], reason).at_line(line),
            );
        }

        match codec::decode(&self.buf) {
            Ok(record) => {
                let out_of_order = self.latest.is_some_and(|latest| record.timestamp < latest);
                if !out_of_order {
                    self.latest = Some(record.timestamp);
                }
                StoreEntry::Record {
                    line,
                    record,
                    out_of_order,
                }
            }
            Err(malformed) => StoreEntry::Malformed(malformed.at_line(line)),
        }
    }
}

impl Iterator for RecordStream {
    type Item = Result<StoreEntry, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let raw = match self.read_line() {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                self.done = true;
                log::debug!(
                    "store read finished (path={}, records={}, malformed={})",
                    self.path.display(),
                    self.stats.records,
                    self.stats.malformed
                );
                return None;
            }
            Err(err) => {
                self.done = true;
                log::warn!(
                    "store read failed (path={}, line={}, err={err})",
                    self.path.display(),
                    self.stats.lines + 1
                );
                return Some(Err(StoreError::Io(err)));
            }
        };

        self.stats.lines += 1;
        let line = self.stats.lines;
        let entry = self.classify(raw, line);
        match &entry {
            StoreEntry::Record { out_of_order, .. } => {
                self.stats.records += 1;
                if *out_of_order {
                    self.stats.out_of_order += 1;
                    log::warn!(
                        "out-of-order timestamp (path={}, line={line})",
                        self.path.display()
                    );
                }
            }
            StoreEntry::Malformed(malformed) => {
                self.stats.malformed += 1;
                log::warn!(
                    "malformed record skipped (path={}, line={line}, reason={})",
                    self.path.display(),
                    malformed.reason
                );
            }
        }
        Some(Ok(entry))
    }
}

impl FusedIterator for RecordStream {}
