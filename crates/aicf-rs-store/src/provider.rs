//! Async store interface and the file-backed implementation.

use crate::error::StoreError;
use crate::guard::PathGuard;
use crate::model::ConversationRecord;
use crate::pii::{PiiScanner, ScanOptions};
use crate::reader::{RecordStream, StoreEntry, StoreReader};
use crate::writer::{AppendAck, StoreHandle, StoreWriter, WriterSettings};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

#[async_trait]
/// Conversation store abstraction used by services.
pub trait ConversationStore: Send + Sync {
    /// Resolve a store path for later appends and reads.
    async fn handle(&self, requested: &str) -> Result<StoreHandle, StoreError>;

    /// Redact and append one record.
    async fn append(
        &self,
        store: &StoreHandle,
        record: ConversationRecord,
    ) -> Result<AppendAck, StoreError>;

    /// Append records in order, stopping at the first failure.
    async fn append_all(
        &self,
        store: &StoreHandle,
        records: Vec<ConversationRecord>,
    ) -> Result<Vec<AppendAck>, StoreError> {
        let mut acks = Vec::with_capacity(records.len());
        for record in records {
            acks.push(self.append(store, record).await?);
        }
        Ok(acks)
    }

    /// Open a lazy read over the store.
    async fn open(&self, store: &StoreHandle) -> Result<RecordStream, StoreError>;

    /// Read every entry of the store.
    async fn read_all(&self, store: &StoreHandle) -> Result<Vec<StoreEntry>, StoreError>;
}

/// File-backed store running blocking I/O on tokio's blocking pool.
///
/// Work handed to the pool runs to completion even if the calling future is
/// dropped, so an abandoned append still releases its lock.
#[derive(Debug, Clone)]
pub struct FileConversationStore {
    writer: Arc<StoreWriter>,
    reader: StoreReader,
}

impl FileConversationStore {
    pub fn new(writer: StoreWriter, reader: StoreReader) -> Self {
        Self {
            writer: Arc::new(writer),
            reader,
        }
    }

    /// Build a store confined to `root`.
    pub fn from_root(
        root: impl AsRef<Path>,
        settings: WriterSettings,
        scan: ScanOptions,
    ) -> Result<Self, StoreError> {
        let guard = PathGuard::new(root)?;
        let scanner = Arc::new(PiiScanner::with_options(scan)?);
        let reader = StoreReader::new(guard.clone(), settings.max_line_bytes);
        let writer = StoreWriter::new(guard, scanner, settings);
        Ok(Self::new(writer, reader))
    }

    pub fn writer(&self) -> &StoreWriter {
        &self.writer
    }

    pub fn reader(&self) -> &StoreReader {
        &self.reader
    }
}

async fn run_blocking<T, F>(task: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|err| StoreError::Task(err.to_string()))?
}

#[async_trait]
impl ConversationStore for FileConversationStore {
    async fn handle(&self, requested: &str) -> Result<StoreHandle, StoreError> {
        let writer = Arc::clone(&self.writer);
        let requested = requested.to_string();
        run_blocking(move || writer.handle(&requested)).await
    }

    async fn append(
        &self,
        store: &StoreHandle,
        record: ConversationRecord,
    ) -> Result<AppendAck, StoreError> {
        let writer = Arc::clone(&self.writer);
        let store = store.clone();
        run_blocking(move || writer.append(&store, record)).await
    }

    async fn open(&self, store: &StoreHandle) -> Result<RecordStream, StoreError> {
        let reader = self.reader.clone();
        let store = store.clone();
        run_blocking(move || reader.open_handle(&store)).await
    }

    async fn read_all(&self, store: &StoreHandle) -> Result<Vec<StoreEntry>, StoreError> {
        let reader = self.reader.clone();
        let store = store.clone();
        run_blocking(move || reader.open_handle(&store)?.collect()).await
    }
}
