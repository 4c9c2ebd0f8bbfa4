//! Line codec for conversation records.
//!
//! A record is one line: fields joined by `|`, first field the format
//! version tag. Backslash, `|`, LF, CR, `;` and `=` inside values are
//! written as `\\`, `\|`, `\n`, `\r`, `\;` and `\=`, so a line never
//! contains a raw delimiter or newline taken from record data.
//!
//! Metadata is a single field of `key=value` pairs joined by `;`, sorted by
//! key. Decoding dispatches on the version tag of each line, so a store may
//! mix versions.

use crate::error::{EncodeError, MalformedReason, MalformedRecord};
use crate::model::{ConversationRecord, FormatVersion, Role, is_well_formed_id};
use chrono::{DateTime, Datelike, SecondsFormat, Utc};
use std::collections::BTreeMap;

const DELIMITER: u8 = b'|';
const ESCAPE: u8 = b'\\';
const PAIR_SEPARATOR: u8 = b';';
const KEY_VALUE_SEPARATOR: u8 = b'=';

/// Encode a record as one newline-terminated line.
pub fn encode(record: &ConversationRecord) -> Result<String, EncodeError> {
    validate_shape(record)?;

    let version = record.format_version;
    let mut line = String::with_capacity(
        64 + record.id.len()
            + record.content.len()
            + record.retained_raw.as_ref().map_or(0, String::len),
    );
    line.push_str(version.as_str());
    push_field(&mut line, &record.id);
    push_field(
        &mut line,
        &record.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true),
    );
    push_field(&mut line, record.role.as_str());
    push_field(&mut line, &record.content);

    line.push(DELIMITER as char);
    for (idx, (key, value)) in record.metadata.iter().enumerate() {
        if idx > 0 {
            line.push(PAIR_SEPARATOR as char);
        }
        escape_into(&mut line, key);
        line.push(KEY_VALUE_SEPARATOR as char);
        escape_into(&mut line, value);
    }

    if version == FormatVersion::V1_1 {
        push_field(&mut line, record.retained_raw.as_deref().unwrap_or_default());
    }
    line.push('\n');
    Ok(line)
}

/// Decode one line (with or without its terminator) into a record.
pub fn decode(line: &[u8]) -> Result<ConversationRecord, MalformedRecord> {
    decode_fields(line).map_err(|reason| MalformedRecord::new(strip_terminator(line), reason))
}

fn decode_fields(line: &[u8]) -> Result<ConversationRecord, MalformedReason> {
    let body = strip_terminator(line);
    if body.is_empty() {
        return Err(MalformedReason::EmptyLine);
    }
    let text = std::str::from_utf8(body).map_err(|_| MalformedReason::InvalidUtf8)?;

    let fields = split_unescaped(text, DELIMITER, 0);
    let (_, tag) = fields[0];
    let version = FormatVersion::from_tag(tag)
        .ok_or_else(|| MalformedReason::UnsupportedVersion(tag.to_string()))?;
    if fields.len() != version.field_count() {
        return Err(MalformedReason::FieldCount {
            version: version.as_str(),
            expected: version.field_count(),
            found: fields.len(),
        });
    }

    let id = unescape_field(fields[1])?;
    if !is_well_formed_id(&id) {
        return Err(MalformedReason::InvalidId);
    }

    let timestamp = unescape_field(fields[2])?;
    let timestamp = DateTime::parse_from_rfc3339(&timestamp)
        .map_err(|err| MalformedReason::InvalidTimestamp(err.to_string()))?
        .with_timezone(&Utc);

    let role = unescape_field(fields[3])?;
    if role.is_empty() {
        return Err(MalformedReason::MissingRole);
    }

    let content = unescape_field(fields[4])?;
    let metadata = decode_metadata(fields[5])?;

    let retained_raw = match version {
        FormatVersion::V1_0 => None,
        FormatVersion::V1_1 => {
            let (_, raw) = fields[6];
            if raw.is_empty() {
                None
            } else {
                Some(unescape_field(fields[6])?)
            }
        }
    };

    Ok(ConversationRecord {
        id,
        timestamp,
        role: Role::from(role.as_str()),
        content,
        metadata,
        format_version: version,
        retained_raw,
    })
}

/// Check constraints the wire format cannot represent.
fn validate_shape(record: &ConversationRecord) -> Result<(), EncodeError> {
    if !is_well_formed_id(&record.id) {
        return Err(EncodeError::InvalidId(record.id.clone()));
    }
    if let Role::Other(name) = &record.role {
        if name.is_empty() {
            return Err(EncodeError::EmptyRole);
        }
        if !matches!(Role::from(name.as_str()), Role::Other(_)) {
            return Err(EncodeError::ShadowedRole(name.clone()));
        }
    }
    if !(0..=9999).contains(&record.timestamp.year()) {
        return Err(EncodeError::InvalidTimestamp(record.timestamp.to_string()));
    }
    if record.metadata.keys().any(String::is_empty) {
        return Err(EncodeError::EmptyMetadataKey);
    }
    match (&record.retained_raw, record.format_version) {
        (Some(_), FormatVersion::V1_0) => Err(EncodeError::UnsupportedField {
            version: FormatVersion::V1_0.as_str(),
            field: "retained_raw",
        }),
        (Some(raw), _) if raw.is_empty() => Err(EncodeError::EmptyRetainedRaw),
        _ => Ok(()),
    }
}

fn decode_metadata(
    (offset, raw): (usize, &str),
) -> Result<BTreeMap<String, String>, MalformedReason> {
    let mut metadata = BTreeMap::new();
    if raw.is_empty() {
        return Ok(metadata);
    }
    for (idx, entry) in split_unescaped(raw, PAIR_SEPARATOR, offset)
        .into_iter()
        .enumerate()
    {
        let parts = split_unescaped(entry.1, KEY_VALUE_SEPARATOR, entry.0);
        let [key, value] = parts[..] else {
            return Err(MalformedReason::InvalidMetadata(format!(
                "entry {idx} is not a single key=value pair"
            )));
        };
        let key = unescape_field(key)?;
        if key.is_empty() {
            return Err(MalformedReason::InvalidMetadata(format!(
                "entry {idx} has an empty key"
            )));
        }
        let value = unescape_field(value)?;
        if metadata.insert(key, value).is_some() {
            return Err(MalformedReason::InvalidMetadata(format!(
                "entry {idx} repeats a key"
            )));
        }
    }
    Ok(metadata)
}

fn strip_terminator(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn push_field(line: &mut String, value: &str) {
    line.push(DELIMITER as char);
    escape_into(line, value);
}

fn escape_into(out: &mut String, value: &str) {
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '|' => out.push_str("\\|"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ';' => out.push_str("\\;"),
            '=' => out.push_str("\\="),
            other => out.push(other),
        }
    }
}

/// Split on `separator` bytes not preceded by an escape.
///
/// Returned slices are still escaped and carry their byte offset in the line.
fn split_unescaped(value: &str, separator: u8, base: usize) -> Vec<(usize, &str)> {
    let bytes = value.as_bytes();
    let mut parts = Vec::new();
    let mut start = 0;
    let mut idx = 0;
    while idx < bytes.len() {
        match bytes[idx] {
            ESCAPE => idx += 2,
            byte if byte == separator => {
                parts.push((base + start, &value[start..idx]));
                idx += 1;
                start = idx;
            }
            _ => idx += 1,
        }
    }
    parts.push((base + start.min(bytes.len()), &value[start.min(bytes.len())..]));
    parts
}

fn unescape_field((offset, value): (usize, &str)) -> Result<String, MalformedReason> {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.char_indices();
    while let Some((idx, ch)) = chars.next() {
        if ch != ESCAPE as char {
            out.push(ch);
            continue;
        }
        let unescaped = match chars.next() {
            Some((_, '\\')) => '\\',
            Some((_, '|')) => '|',
            Some((_, 'n')) => '\n',
            Some((_, 'r')) => '\r',
            Some((_, ';')) => ';',
            Some((_, '=')) => '=',
            _ => return Err(MalformedReason::InvalidEscape(offset + idx)),
        };
        out.push(unescaped);
    }
    Ok(out)
}
