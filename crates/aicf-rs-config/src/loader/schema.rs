//! Per-layer shape checks against a key table, run before layers are merged.

use crate::{ConfigError, REDACTION_CATEGORIES, SUPPORTED_FORMAT_VERSIONS};
use serde_json::{Map, Value};

/// Expected shape of one key.
#[derive(Debug, Clone, Copy)]
enum Kind {
    Str,
    Bool,
    Count,
    Number,
    Patterns,
    FormatVersion,
    Categories,
    Block(&'static [(&'static str, Kind)]),
}

const STORE: &[(&str, Kind)] = &[
    ("root", Kind::Str),
    ("format_version", Kind::FormatVersion),
    ("max_content_bytes", Kind::Count),
    ("max_line_bytes", Kind::Count),
    ("lock_timeout_ms", Kind::Count),
    ("fsync", Kind::Bool),
];

const REDACTION: &[(&str, Kind)] = &[
    ("scan_metadata", Kind::Bool),
    ("retain_raw", Kind::Bool),
    ("detect_secrets", Kind::Bool),
    ("secret_entropy_threshold", Kind::Number),
    ("patterns", Kind::Patterns),
    ("disabled_categories", Kind::Categories),
];

const ROOT: &[(&str, Kind)] = &[
    ("$schema", Kind::Str),
    ("store", Kind::Block(STORE)),
    ("redaction", Kind::Block(REDACTION)),
];

/// Check one layer's value; errors are reported as `layer:dotted.path`.
pub(super) fn validate_layer_schema(value: &Value, layer: &str) -> Result<(), ConfigError> {
    Checker { layer }.check(value, Kind::Block(ROOT), "")
}

struct Checker<'a> {
    layer: &'a str,
}

impl Checker<'_> {
    fn check(&self, value: &Value, kind: Kind, path: &str) -> Result<(), ConfigError> {
        match kind {
            Kind::Block(keys) => self.block(value, keys, path),
            Kind::Str => self.string(value, path).map(drop),
            Kind::Bool if value.is_boolean() => Ok(()),
            Kind::Bool => Err(self.invalid(path, "expected bool")),
            Kind::Count if value.is_u64() => Ok(()),
            Kind::Count => Err(self.invalid(path, "expected non-negative integer")),
            Kind::Number if value.is_number() => Ok(()),
            Kind::Number => Err(self.invalid(path, "expected number")),
            Kind::FormatVersion => {
                let version = self.string(value, path)?;
                if SUPPORTED_FORMAT_VERSIONS.contains(&version) {
                    Ok(())
                } else {
                    Err(self.invalid(
                        path,
                        &format!("expected one of {}", SUPPORTED_FORMAT_VERSIONS.join(", ")),
                    ))
                }
            }
            Kind::Patterns => self.strings(value, path, |_| true, ""),
            Kind::Categories => self.strings(
                value,
                path,
                |name| REDACTION_CATEGORIES.contains(&name),
                "unknown redaction category",
            ),
        }
    }

    fn block(
        &self,
        value: &Value,
        keys: &[(&str, Kind)],
        path: &str,
    ) -> Result<(), ConfigError> {
        let Value::Object(map) = value else {
            return Err(self.invalid(path, "expected object"));
        };
        self.known_keys(map, keys, path)?;
        for (key, kind) in keys {
            if let Some(value) = map.get(*key) {
                self.check(value, *kind, &join_path(path, key))?;
            }
        }
        Ok(())
    }

    fn known_keys(
        &self,
        map: &Map<String, Value>,
        keys: &[(&str, Kind)],
        path: &str,
    ) -> Result<(), ConfigError> {
        match map
            .keys()
            .find(|key| !keys.iter().any(|(known, _)| *known == key.as_str()))
        {
            Some(unknown) => Err(self.invalid(&join_path(path, unknown), "unknown key")),
            None => Ok(()),
        }
    }

    fn string<'v>(&self, value: &'v Value, path: &str) -> Result<&'v str, ConfigError> {
        value
            .as_str()
            .ok_or_else(|| self.invalid(path, "expected string"))
    }

    /// Array of strings, each accepted by `allowed`.
    fn strings(
        &self,
        value: &Value,
        path: &str,
        allowed: impl Fn(&str) -> bool,
        rejected: &str,
    ) -> Result<(), ConfigError> {
        let Value::Array(entries) = value else {
            return Err(self.invalid(path, "expected array"));
        };
        for (idx, entry) in entries.iter().enumerate() {
            let entry_path = format!("{path}[{idx}]");
            let name = self.string(entry, &entry_path)?;
            if !allowed(name) {
                return Err(self.invalid(&entry_path, rejected));
            }
        }
        Ok(())
    }

    fn invalid(&self, path: &str, message: &str) -> ConfigError {
        let path = if path.is_empty() { "root" } else { path };
        ConfigError::InvalidField {
            path: format!("{}:{path}", self.layer),
            message: message.to_string(),
        }
    }
}

fn join_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}
