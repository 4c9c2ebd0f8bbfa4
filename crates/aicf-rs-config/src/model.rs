//! Configuration schema for AICF stores.

use serde::{Deserialize, Serialize};

/// Format versions the store codec can write.
pub const SUPPORTED_FORMAT_VERSIONS: &[&str] = &["1.0", "1.1"];

/// Category names accepted by `redaction.disabled_categories`, in the
/// order of the store's `PiiCategory::ALL`.
pub const REDACTION_CATEGORIES: &[&str] = &[
    "private-key",
    "jwt",
    "api-key",
    "credential",
    "payment-card",
    "iban",
    "ssn",
    "email",
    "phone",
    "ip-address",
    "street-address",
    "secret",
    "custom",
];

/// Root config for an AICF store.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AicfConfig {
    #[serde(default, rename = "$schema")]
    pub schema: Option<String>,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub redaction: RedactionConfig,
}

impl AicfConfig {
    /// Start building a config programmatically with defaults applied.
    pub fn builder() -> AicfConfigBuilder {
        AicfConfigBuilder::new()
    }
}

/// Builder for assembling an `AicfConfig` in code.
#[derive(Debug, Default, Clone)]
pub struct AicfConfigBuilder {
    config: AicfConfig,
}

impl AicfConfigBuilder {
    /// Create a new builder seeded with default config values.
    pub fn new() -> Self {
        Self {
            config: AicfConfig::default(),
        }
    }

    /// Set the directory every store path is confined to.
    pub fn root(mut self, root: impl Into<String>) -> Self {
        self.config.store.root = Some(root.into());
        self
    }

    /// Replace the store configuration.
    pub fn store(mut self, store: StoreConfig) -> Self {
        self.config.store = store;
        self
    }

    /// Replace the redaction configuration.
    pub fn redaction(mut self, redaction: RedactionConfig) -> Self {
        self.config.redaction = redaction;
        self
    }

    /// Finalize and return the built `AicfConfig`.
    pub fn build(self) -> AicfConfig {
        self.config
    }
}

/// Store file and codec settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory all store paths must resolve inside.
    #[serde(default)]
    pub root: Option<String>,
    /// Codec version stamped on appended records.
    #[serde(default = "default_format_version")]
    pub format_version: String,
    /// Largest accepted `content` field, in bytes.
    #[serde(default = "default_max_content_bytes")]
    pub max_content_bytes: usize,
    /// Longest line the reader buffers and the writer emits.
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
    /// Bounded wait for the append lock.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    /// Flush file data to disk before acknowledging an append.
    #[serde(default = "default_true")]
    pub fsync: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: None,
            format_version: default_format_version(),
            max_content_bytes: default_max_content_bytes(),
            max_line_bytes: default_max_line_bytes(),
            lock_timeout_ms: default_lock_timeout_ms(),
            fsync: true,
        }
    }
}

/// Sensitive-data scanning settings applied on append.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedactionConfig {
    /// Scan metadata values in addition to content.
    #[serde(default = "default_true")]
    pub scan_metadata: bool,
    /// Keep the pre-redaction content alongside the record (audit mode).
    #[serde(default)]
    pub retain_raw: bool,
    /// Detect high-entropy tokens that look like secrets.
    #[serde(default = "default_true")]
    pub detect_secrets: bool,
    /// Shannon entropy threshold for secret detection.
    #[serde(default = "default_secret_entropy_threshold")]
    pub secret_entropy_threshold: f32,
    /// Extra regex patterns redacted under the `custom` category.
    #[serde(default)]
    pub patterns: Vec<String>,
    /// Catalog categories to skip.
    #[serde(default)]
    pub disabled_categories: Vec<String>,
}

impl Default for RedactionConfig {
    fn default() -> Self {
        Self {
            scan_metadata: true,
            retain_raw: false,
            detect_secrets: true,
            secret_entropy_threshold: default_secret_entropy_threshold(),
            patterns: Vec::new(),
            disabled_categories: Vec::new(),
        }
    }
}

fn default_format_version() -> String {
    "1.1".to_string()
}

fn default_max_content_bytes() -> usize {
    1024 * 1024
}

fn default_max_line_bytes() -> usize {
    8 * 1024 * 1024
}

fn default_lock_timeout_ms() -> u64 {
    5_000
}

fn default_secret_entropy_threshold() -> f32 {
    3.7
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::AicfConfig;
    use pretty_assertions::assert_eq;

    #[test]
    fn builder_sets_root_and_keeps_defaults() {
        let config = AicfConfig::builder().root("/srv/aicf").build();
        assert_eq!(config.store.root.as_deref(), Some("/srv/aicf"));
        assert_eq!(config.store.format_version, "1.1");
        assert_eq!(config.store.lock_timeout_ms, 5_000);
        assert!(config.redaction.scan_metadata);
        assert!(!config.redaction.retain_raw);
    }
}
