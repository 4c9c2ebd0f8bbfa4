//! Public SDK surface for AICF.
//!
//! This crate re-exports the config and store building blocks and wires a
//! file-backed store from an [`AicfConfig`].

/// Re-export for convenience.
pub use aicf_rs_config as config;
/// Re-export for convenience.
pub use aicf_rs_store as store;

pub use aicf_rs_config::{AicfConfig, ConfigError};
pub use aicf_rs_store::{
    AppendAck, ConversationRecord, ConversationStore, FileConversationStore, FormatVersion,
    MalformedRecord, PiiCategory, Role, StoreEntry, StoreError, StoreHandle,
};

use aicf_rs_store::{ScanOptions, WriterSettings};
use std::time::Duration;

/// Errors from building a store out of configuration.
#[derive(Debug, thiserror::Error)]
pub enum AicfError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[inline]
/// Initialize logging using env_logger if the "logging" feature is enabled.
///
/// This is a no-op if the feature is not enabled. Binaries are still expected
/// to call this early in startup to ensure log output is wired up.
pub fn init_logging() {
    #[cfg(feature = "logging")]
    {
        let _ = env_logger::try_init();
    }
}

/// Writer limits derived from `config.store` and `config.redaction`.
pub fn writer_settings(config: &AicfConfig) -> Result<WriterSettings, AicfError> {
    let format_version = config
        .store
        .format_version
        .parse::<FormatVersion>()
        .map_err(|message| ConfigError::InvalidField {
            path: "store.format_version".to_string(),
            message,
        })?;
    Ok(WriterSettings {
        format_version,
        max_content_bytes: config.store.max_content_bytes,
        max_line_bytes: config.store.max_line_bytes,
        lock_timeout: Duration::from_millis(config.store.lock_timeout_ms),
        fsync: config.store.fsync,
        scan_metadata: config.redaction.scan_metadata,
        retain_raw: config.redaction.retain_raw,
    })
}

/// Scanner options derived from `config.redaction`.
pub fn scan_options(config: &AicfConfig) -> Result<ScanOptions, AicfError> {
    let redaction = &config.redaction;
    let mut disabled = Vec::with_capacity(redaction.disabled_categories.len());
    for (idx, name) in redaction.disabled_categories.iter().enumerate() {
        let category = PiiCategory::from_name(name).ok_or_else(|| ConfigError::InvalidField {
            path: format!("redaction.disabled_categories[{idx}]"),
            message: format!("unknown category {name:?}"),
        })?;
        disabled.push(category);
    }
    Ok(ScanOptions {
        detect_secrets: redaction.detect_secrets,
        secret_entropy_threshold: redaction.secret_entropy_threshold,
        patterns: redaction.patterns.clone(),
        disabled,
    })
}

/// Build a file-backed store confined to `config.store.root`.
pub fn open_store(config: &AicfConfig) -> Result<FileConversationStore, AicfError> {
    config.validate()?;
    let root = config
        .store
        .root
        .as_deref()
        .ok_or_else(|| ConfigError::InvalidField {
            path: "store.root".to_string(),
            message: "a store root is required".to_string(),
        })?;
    let store = FileConversationStore::from_root(
        root,
        writer_settings(config)?,
        scan_options(config)?,
    )?;
    log::info!("aicf store ready (root={root})");
    Ok(store)
}
