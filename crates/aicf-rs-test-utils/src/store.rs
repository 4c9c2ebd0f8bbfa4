use aicf_rs_store::{
    LockTable, PathGuard, PiiScanner, ScanOptions, StoreReader, StoreWriter, WriterSettings,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Store root in a temporary directory with an isolated lock table.
pub struct TempStore {
    dir: TempDir,
    locks: Arc<LockTable>,
}

impl TempStore {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("tempdir"),
            locks: LockTable::new(),
        }
    }

    /// Canonical store root.
    pub fn root(&self) -> PathBuf {
        self.dir.path().canonicalize().expect("canonical root")
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.root().join(name)
    }

    pub fn locks(&self) -> Arc<LockTable> {
        Arc::clone(&self.locks)
    }

    pub fn guard(&self) -> PathGuard {
        PathGuard::new(self.dir.path()).expect("guard")
    }

    /// Writer with default scanning and the given settings.
    pub fn writer(&self, settings: WriterSettings) -> StoreWriter {
        self.writer_with(settings, ScanOptions::default())
    }

    pub fn writer_with(&self, settings: WriterSettings, scan: ScanOptions) -> StoreWriter {
        let scanner = Arc::new(PiiScanner::with_options(scan).expect("scanner"));
        StoreWriter::new(self.guard(), scanner, settings).with_lock_table(self.locks())
    }

    pub fn reader(&self) -> StoreReader {
        StoreReader::new(self.guard(), WriterSettings::default().max_line_bytes)
    }

    /// Write raw bytes to a store file, bypassing the writer.
    pub fn write_raw(&self, name: &str, bytes: impl AsRef<[u8]>) -> PathBuf {
        let path = self.path(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("dir");
        }
        fs::write(&path, bytes).expect("write");
        path
    }

    /// Physical lines of a store file, terminators stripped.
    pub fn lines(&self, name: &str) -> Vec<String> {
        read_lines(&self.path(name))
    }
}

impl Default for TempStore {
    fn default() -> Self {
        Self::new()
    }
}

fn read_lines(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .expect("read store")
        .lines()
        .map(str::to_string)
        .collect()
}
