//! Store path confinement.
//!
//! Requested paths are percent-decoded to a fixpoint, lexically normalized,
//! then canonicalized against the filesystem so symlinks are followed before
//! the root check. Only the canonical form is ever compared.

use crate::error::StoreError;
use percent_encoding::percent_decode_str;
use std::borrow::Cow;
use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

/// Upper bound on nested percent-encoding layers.
const MAX_DECODE_ROUNDS: usize = 8;

/// Confines store paths to a canonical root directory.
#[derive(Debug, Clone)]
pub struct PathGuard {
    root: PathBuf,
}

impl PathGuard {
    /// Create a guard for an existing root directory.
    pub fn new(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref();
        let canonical = root
            .canonicalize()
            .map_err(|err| StoreError::InvalidRoot(format!("{}: {err}", root.display())))?;
        if !canonical.is_dir() {
            return Err(StoreError::InvalidRoot(format!(
                "{} is not a directory",
                canonical.display()
            )));
        }
        log::info!("path guard ready (root={})", canonical.display());
        Ok(Self { root: canonical })
    }

    /// Canonical root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `requested` to a canonical path inside the root.
    ///
    /// Relative paths are taken relative to the root. Absolute paths are
    /// accepted only if they land inside it. The target itself may be
    /// missing; its nearest existing ancestor is canonicalized instead.
    ///
    /// Percent-encoding is decoded until stable and the decoded name is the
    /// one used on disk, so `100%25.aicf` and `100%2525.aicf` both name
    /// `100%.aicf`. Callers wanting a literal `%25` in a file name cannot
    /// express it.
    pub fn resolve(&self, requested: &str) -> Result<PathBuf, StoreError> {
        if requested.trim().is_empty() {
            return Err(StoreError::traversal(requested, "path is empty"));
        }
        let decoded = decode_fully(requested)?;
        if let Some(ch) = decoded.chars().find(|ch| ch.is_control() || *ch == '\\') {
            return Err(StoreError::traversal(
                requested,
                format!("forbidden character {ch:?}"),
            ));
        }

        let lexical = self.normalize(requested, Path::new(decoded.as_ref()))?;
        let canonical = canonicalize_existing_prefix(requested, &lexical)?;
        if !canonical.starts_with(&self.root) {
            log::warn!(
                "path traversal rejected (root={}, resolved={})",
                self.root.display(),
                canonical.display()
            );
            return Err(StoreError::traversal(requested, "resolves outside store root"));
        }
        Ok(canonical)
    }

    /// Lexically fold `.` and `..` without touching the filesystem.
    fn normalize(&self, requested: &str, path: &Path) -> Result<PathBuf, StoreError> {
        let absolute = path.is_absolute();
        let mut parts: Vec<OsString> = Vec::new();
        for component in path.components() {
            match component {
                Component::Normal(part) => parts.push(part.to_os_string()),
                Component::CurDir | Component::RootDir => (),
                Component::ParentDir => {
                    if parts.pop().is_none() && !absolute {
                        return Err(StoreError::traversal(requested, "path escapes store root"));
                    }
                }
                Component::Prefix(_) => {
                    return Err(StoreError::traversal(requested, "path prefixes are not allowed"));
                }
            }
        }

        let mut resolved = if absolute {
            PathBuf::from(Component::RootDir.as_os_str())
        } else {
            self.root.clone()
        };
        resolved.extend(parts);
        Ok(resolved)
    }
}

/// Percent-decode until the value stops changing.
fn decode_fully(requested: &str) -> Result<Cow<'_, str>, StoreError> {
    let mut current = Cow::Borrowed(requested);
    for _ in 0..MAX_DECODE_ROUNDS {
        let decoded = percent_decode_str(&current)
            .decode_utf8()
            .map_err(|_| StoreError::traversal(requested, "encoded bytes are not valid utf-8"))?;
        if decoded == current {
            return Ok(current);
        }
        current = Cow::Owned(decoded.into_owned());
    }
    Err(StoreError::traversal(requested, "too many percent-encoding layers"))
}

/// Canonicalize the nearest existing ancestor and re-append the missing tail.
fn canonicalize_existing_prefix(requested: &str, path: &Path) -> Result<PathBuf, StoreError> {
    let mut existing = path.to_path_buf();
    let mut missing: Vec<OsString> = Vec::new();
    loop {
        match existing.symlink_metadata() {
            Ok(_) => break,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                let Some(name) = existing.file_name().map(|name| name.to_os_string()) else {
                    return Err(StoreError::Io(err));
                };
                missing.push(name);
                existing.pop();
            }
            Err(err) => return Err(StoreError::Io(err)),
        }
    }

    let mut canonical = match existing.canonicalize() {
        Ok(path) => path,
        // The entry exists but cannot be followed: a dangling symlink.
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(StoreError::traversal(requested, "dangling symlink"));
        }
        Err(err) => return Err(StoreError::Io(err)),
    };
    canonical.extend(missing.into_iter().rev());
    Ok(canonical)
}

#[cfg(test)]
mod tests {
    use super::PathGuard;
    use crate::error::StoreError;
    use pretty_assertions::assert_eq;
    use std::fs;
    use tempfile::tempdir;

    fn assert_traversal(guard: &PathGuard, requested: &str) {
        match guard.resolve(requested) {
            Err(StoreError::PathTraversal { .. }) => {}
            other => panic!("expected traversal for {requested:?}, got {other:?}"),
        }
    }

    #[test]
    fn resolves_paths_inside_root() {
        let temp = tempdir().expect("tempdir");
        let guard = PathGuard::new(temp.path()).expect("guard");
        fs::create_dir(guard.root().join("sessions")).expect("dir");

        let resolved = guard.resolve("sessions/./chat.aicf").expect("resolved");
        assert_eq!(resolved, guard.root().join("sessions").join("chat.aicf"));

        let nested = guard.resolve("missing/deeper/chat.aicf").expect("resolved");
        assert_eq!(nested, guard.root().join("missing/deeper/chat.aicf"));

        let folded = guard.resolve("sessions/../chat.aicf").expect("resolved");
        assert_eq!(folded, guard.root().join("chat.aicf"));
    }

    #[test]
    fn percent_escapes_name_the_decoded_file() {
        let temp = tempdir().expect("tempdir");
        let guard = PathGuard::new(temp.path()).expect("guard");
        let expected = guard.root().join("100%.aicf");
        for requested in ["100%.aicf", "100%25.aicf", "100%2525.aicf"] {
            assert_eq!(guard.resolve(requested).expect("resolved"), expected);
        }
        assert_eq!(
            guard.resolve("notes%2Fchat.aicf").expect("resolved"),
            guard.root().join("notes").join("chat.aicf")
        );
    }

    #[test]
    fn accepts_absolute_paths_only_inside_root() {
        let temp = tempdir().expect("tempdir");
        let guard = PathGuard::new(temp.path()).expect("guard");
        let inside = guard.root().join("chat.aicf");
        let resolved = guard.resolve(inside.to_str().expect("utf8")).expect("resolved");
        assert_eq!(resolved, inside);

        let outside = temp.path().parent().expect("parent").join("elsewhere.aicf");
        assert_traversal(&guard, outside.to_str().expect("utf8"));
    }

    #[test]
    fn rejects_dot_dot_escapes() {
        let temp = tempdir().expect("tempdir");
        let guard = PathGuard::new(temp.path()).expect("guard");
        assert_traversal(&guard, "../outside.aicf");
        assert_traversal(&guard, "a/../../outside.aicf");
        assert_traversal(&guard, "./../../etc/passwd");
    }

    #[test]
    fn rejects_encoded_and_double_encoded_escapes() {
        let temp = tempdir().expect("tempdir");
        let guard = PathGuard::new(temp.path()).expect("guard");
        assert_traversal(&guard, "%2e%2e/outside.aicf");
        assert_traversal(&guard, "..%2foutside.aicf");
        assert_traversal(&guard, "%252e%252e%252foutside.aicf");
        assert_traversal(&guard, "%25252e%25252e/outside.aicf");
    }

    #[test]
    fn rejects_control_characters_and_backslashes() {
        let temp = tempdir().expect("tempdir");
        let guard = PathGuard::new(temp.path()).expect("guard");
        assert_traversal(&guard, "chat\0.aicf");
        assert_traversal(&guard, "chat%00.aicf");
        assert_traversal(&guard, "chat\u{7}.aicf");
        assert_traversal(&guard, "..\\outside.aicf");
        assert_traversal(&guard, "");
        assert_traversal(&guard, "%ff%fe");
    }

    #[cfg(unix)]
    #[test]
    fn rejects_symlinks_resolving_outside_root() {
        use std::os::unix::fs::symlink;

        let outside = tempdir().expect("outside");
        let temp = tempdir().expect("tempdir");
        let guard = PathGuard::new(temp.path()).expect("guard");
        symlink(outside.path(), guard.root().join("escape")).expect("symlink");
        symlink(
            outside.path().join("store.aicf"),
            guard.root().join("file-link.aicf"),
        )
        .expect("symlink");

        assert_traversal(&guard, "escape/store.aicf");
        assert_traversal(&guard, "escape");
        // Target is missing, so the link dangles.
        assert_traversal(&guard, "file-link.aicf");

        fs::write(outside.path().join("store.aicf"), "").expect("write");
        assert_traversal(&guard, "file-link.aicf");
    }

    #[cfg(unix)]
    #[test]
    fn follows_symlinks_that_stay_inside_root() {
        use std::os::unix::fs::symlink;

        let temp = tempdir().expect("tempdir");
        let guard = PathGuard::new(temp.path()).expect("guard");
        fs::create_dir(guard.root().join("real")).expect("dir");
        symlink(guard.root().join("real"), guard.root().join("alias")).expect("symlink");

        let resolved = guard.resolve("alias/chat.aicf").expect("resolved");
        assert_eq!(resolved, guard.root().join("real").join("chat.aicf"));
    }

    #[test]
    fn invalid_roots_are_rejected() {
        let temp = tempdir().expect("tempdir");
        let missing = PathGuard::new(temp.path().join("absent")).unwrap_err();
        assert!(matches!(missing, StoreError::InvalidRoot(_)));

        let file = temp.path().join("file");
        fs::write(&file, "x").expect("write");
        let not_dir = PathGuard::new(&file).unwrap_err();
        assert!(matches!(not_dir, StoreError::InvalidRoot(_)));
    }
}
