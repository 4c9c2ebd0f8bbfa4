//! Reading layers from disk and the default layer locations.

use super::{
    ConfigLayer, ConfigLayerSource, DEFAULT_CONFIG_DIR, DEFAULT_CONFIG_FILE, LoadedLayer,
    SYSTEM_CONFIG_PATH, schema,
};
use crate::ConfigError;
use directories::UserDirs;
use log::debug;
use serde_json::Value;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Environment variable naming an extra runtime layer.
pub(super) const CONFIG_ENV: &str = "AICF_CONFIG";

/// Read, parse and schema-check one layer.
///
/// A missing file is `Ok(None)` unless the layer is `required`.
pub(super) fn read_layer(
    source: ConfigLayerSource,
    path: &Path,
    required: bool,
) -> Result<Option<LoadedLayer>, ConfigError> {
    let label = format!("{source}({})", path.display());
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound && !required => {
            debug!("config layer absent (layer={label})");
            return Ok(None);
        }
        Err(err) => return Err(ConfigError::read(path, err)),
    };
    let value = parse_json5(&contents, &label)?;
    schema::validate_layer_schema(&value, &label)?;
    debug!("config layer read (layer={label}, bytes={})", contents.len());
    Ok(Some(LoadedLayer {
        meta: ConfigLayer {
            source,
            path: path.to_path_buf(),
        },
        value,
    }))
}

pub(super) fn parse_json5(contents: &str, layer: &str) -> Result<Value, ConfigError> {
    json5::from_str(contents).map_err(|source| ConfigError::Syntax {
        layer: layer.to_string(),
        source,
    })
}

pub(super) fn default_system_config_path() -> Option<PathBuf> {
    #[cfg(any(unix, windows))]
    {
        Some(PathBuf::from(SYSTEM_CONFIG_PATH))
    }
    #[cfg(not(any(unix, windows)))]
    {
        None
    }
}

/// `~/.aicf/aicf.json5`
pub(super) fn default_user_config_path() -> Option<PathBuf> {
    UserDirs::new().map(|dirs| {
        dirs.home_dir()
            .join(DEFAULT_CONFIG_DIR)
            .join(DEFAULT_CONFIG_FILE)
    })
}

/// Runtime layer named by `AICF_CONFIG`, if set and non-empty.
pub(super) fn env_config_path() -> Option<PathBuf> {
    std::env::var_os(CONFIG_ENV)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

/// Canonical cwd; a cwd that does not exist yet is used as given.
pub(super) fn resolve_cwd(cwd: &Path) -> Result<PathBuf, ConfigError> {
    match cwd.canonicalize() {
        Ok(path) => Ok(path),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(cwd.to_path_buf()),
        Err(err) => Err(ConfigError::read(cwd, err)),
    }
}

/// Key used to load each layer file once.
pub(super) fn dedup_key(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

/// Closest ancestor of `cwd` holding one of `markers`.
pub(super) fn find_project_root(cwd: &Path, markers: &[String]) -> Option<PathBuf> {
    cwd.ancestors()
        .find(|dir| markers.iter().any(|marker| dir.join(marker).exists()))
        .map(Path::to_path_buf)
}
