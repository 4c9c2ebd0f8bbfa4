//! Layered configuration loader.
//!
//! Discovers configuration layers (system/user/project/runtime), validates
//! each against the schema, merges them and produces a final `AicfConfig`.

mod layer_io;
mod merge;
mod schema;


use crate::{AicfConfig, ConfigError, SUPPORTED_FORMAT_VERSIONS};
use log::{debug, info};
use regex::Regex;
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Default config filename in local layers.
const DEFAULT_CONFIG_FILE: &str = "aicf.json5";
/// Default config directory under user or project roots.
const DEFAULT_CONFIG_DIR: &str = ".aicf";
/// Marker files/dirs that identify a project root.
const DEFAULT_PROJECT_ROOT_MARKERS: &[&str] = &[".git"];

#[cfg(unix)]
/// Default system config path on Unix.
const SYSTEM_CONFIG_PATH: &str = "/etc/aicf/aicf.json5";
#[cfg(windows)]
/// Default system config path on Windows.
const SYSTEM_CONFIG_PATH: &str = "C:\\ProgramData\\aicf\\aicf.json5";

/// Effective config plus metadata about which layers were loaded.
#[derive(Debug, Clone)]
pub struct LayeredConfig {
    /// The merged, validated config.
    pub config: AicfConfig,
    /// Metadata for each layer loaded.
    pub layers: Vec<ConfigLayer>,
}

/// Origin for a single config layer in the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigLayerSource {
    /// System-wide configuration.
    System,
    /// User-specific configuration.
    User,
    /// Project-local configuration.
    Project,
    /// Runtime overrides (highest precedence).
    Runtime,
}

impl ConfigLayerSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Project => "project",
            Self::Runtime => "runtime",
        }
    }
}

impl fmt::Display for ConfigLayerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata about a loaded config layer.
#[derive(Debug, Clone)]
pub struct ConfigLayer {
    /// Layer origin.
    pub source: ConfigLayerSource,
    /// Location on disk.
    pub path: PathBuf,
}

/// Options controlling layered config discovery and overrides.
#[derive(Debug, Clone)]
pub struct LayeredConfigOptions {
    /// Working directory used to find the project layer.
    pub cwd: PathBuf,
    /// Optional system config path (defaults to `/etc/aicf/aicf.json5` on Unix).
    pub system_config_path: Option<PathBuf>,
    /// Optional user config path (defaults to `~/.aicf/aicf.json5`).
    pub user_config_path: Option<PathBuf>,
    /// Runtime override config paths applied last, in order.
    ///
    /// [`LayeredConfigOptions::new`] seeds this from `AICF_CONFIG`.
    pub runtime_paths: Vec<PathBuf>,
    /// Marker files/dirs used to detect the project root.
    pub project_root_markers: Vec<String>,
}

impl LayeredConfigOptions {
    /// Create options with default layer locations for the provided cwd.
    pub fn new(cwd: impl AsRef<Path>) -> Self {
        Self {
            cwd: cwd.as_ref().to_path_buf(),
            system_config_path: layer_io::default_system_config_path(),
            user_config_path: layer_io::default_user_config_path(),
            runtime_paths: layer_io::env_config_path().into_iter().collect(),
            project_root_markers: DEFAULT_PROJECT_ROOT_MARKERS
                .iter()
                .map(|marker| marker.to_string())
                .collect(),
        }
    }

    /// Add a runtime override config path that is applied last.
    pub fn with_runtime_path(mut self, path: impl AsRef<Path>) -> Self {
        self.runtime_paths.push(path.as_ref().to_path_buf());
        self
    }
}

impl AicfConfig {
    /// Load a single config from a path (no layering).
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!("loading config (path={})", path.display());
        let contents = fs::read_to_string(path).map_err(|err| ConfigError::read(path, err))?;
        let label = path.display().to_string();
        let value = layer_io::parse_json5(&contents, &label)?;
        config_from_value(value, &label)
    }

    /// Load a single config from JSON5 contents (no layering).
    pub fn load_from_str(contents: &str) -> Result<Self, ConfigError> {
        debug!("loading config from raw contents (len={})", contents.len());
        let value = layer_io::parse_json5(contents, "config")?;
        config_from_value(value, "config")
    }

    /// Load a layered config stack using the default layer locations.
    pub fn load_layered(cwd: impl AsRef<Path>) -> Result<LayeredConfig, ConfigError> {
        info!(
            "loading layered config with defaults (cwd={})",
            cwd.as_ref().display()
        );
        Self::load_layered_with_options(LayeredConfigOptions::new(cwd))
    }

    /// Load a layered config stack using explicit layer locations.
    ///
    /// Layer precedence (low -> high): system, user, project, runtime.
    pub fn load_layered_with_options(
        options: LayeredConfigOptions,
    ) -> Result<LayeredConfig, ConfigError> {
        let cwd = layer_io::resolve_cwd(&options.cwd)?;
        debug!("normalized cwd for config load: {}", cwd.display());

        let mut candidates: Vec<(ConfigLayerSource, PathBuf)> = Vec::new();
        if let Some(path) = options.system_config_path {
            candidates.push((ConfigLayerSource::System, path));
        }
        if let Some(path) = options.user_config_path {
            candidates.push((ConfigLayerSource::User, path));
        }
        match layer_io::find_project_root(&cwd, &options.project_root_markers) {
            Some(project_root) => {
                debug!("resolved project root: {}", project_root.display());
                candidates.push((
                    ConfigLayerSource::Project,
                    project_root.join(DEFAULT_CONFIG_DIR).join(DEFAULT_CONFIG_FILE),
                ));
            }
            None => debug!("project root not found; skipping project layer"),
        }

        let mut layers = Vec::new();
        let mut merged = Value::Object(serde_json::Map::new());
        let mut seen_paths = HashSet::new();

        for (source, path) in candidates {
            if !seen_paths.insert(layer_io::dedup_key(&path)) {
                debug!(
                    "skipping duplicate layer (source={source}, path={})",
                    path.display()
                );
                continue;
            }
            if let Some(layer) = layer_io::read_layer(source, &path, false)? {
                merge::merge_json_values(&mut merged, &layer.value);
                layers.push(layer.meta);
            }
        }

        for runtime_path in &options.runtime_paths {
            if let Some(layer) =
                layer_io::read_layer(ConfigLayerSource::Runtime, runtime_path, true)?
            {
                merge::merge_json_values(&mut merged, &layer.value);
                layers.push(layer.meta);
            }
        }

        let config = config_from_value(merged, "effective")?;
        info!("layered config loaded (layers={})", layers.len());
        Ok(LayeredConfig { config, layers })
    }

    /// Validate configuration invariants that cannot be expressed in serde.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let store = &self.store;
        if !SUPPORTED_FORMAT_VERSIONS.contains(&store.format_version.as_str()) {
            return Err(ConfigError::InvalidField {
                path: "store.format_version".to_string(),
                message: format!("unsupported format version {:?}", store.format_version),
            });
        }
        if store.max_content_bytes == 0 {
            return Err(ConfigError::Invalid(
                "store.max_content_bytes must be greater than zero".to_string(),
            ));
        }
        if store.max_line_bytes <= store.max_content_bytes {
            return Err(ConfigError::Invalid(
                "store.max_line_bytes must exceed store.max_content_bytes".to_string(),
            ));
        }
        if store.lock_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "store.lock_timeout_ms must be greater than zero".to_string(),
            ));
        }

        let redaction = &self.redaction;
        let threshold = redaction.secret_entropy_threshold;
        if !threshold.is_finite() || threshold <= 0.0 {
            return Err(ConfigError::InvalidField {
                path: "redaction.secret_entropy_threshold".to_string(),
                message: "expected a positive finite number".to_string(),
            });
        }
        for (idx, pattern) in redaction.patterns.iter().enumerate() {
            if let Err(err) = Regex::new(pattern) {
                return Err(ConfigError::InvalidField {
                    path: format!("redaction.patterns[{idx}]"),
                    message: err.to_string(),
                });
            }
        }

        Ok(())
    }
}

/// Internal representation of a loaded config layer.
#[derive(Debug, Clone)]
struct LoadedLayer {
    meta: ConfigLayer,
    value: Value,
}

fn config_from_value(value: Value, label: &str) -> Result<AicfConfig, ConfigError> {
    schema::validate_layer_schema(&value, label)?;
    let config: AicfConfig = serde_json::from_value(value)?;
    config.validate()?;
    Ok(config)
}
