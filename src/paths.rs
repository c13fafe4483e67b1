//! Confinement of every filesystem mutation to the configured base directory.
//!
//! Candidate paths are lexically normalized (so `a/../../etc` cannot sneak
//! past a prefix check), then canonicalized as far as they exist on disk so a
//! symlink inside the base cannot point the engine elsewhere.

use std::io;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;

/// Path validation errors.
#[derive(Debug, Error)]
pub enum PathError {
    /// The resolved path is not below the base directory.
    #[error("path outside base directory: {path}")]
    OutsideBase { path: PathBuf },

    /// The resolved path is the base directory itself.
    #[error("path is the base directory itself: {path}")]
    IsBase { path: PathBuf },

    /// Empty path supplied.
    #[error("empty path")]
    Empty,

    /// Filesystem error while resolving the path.
    #[error("cannot resolve {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl PathError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Validates paths against a canonical base directory.
#[derive(Debug, Clone)]
pub struct PathValidator {
    base: PathBuf,
}

impl PathValidator {
    /// Creates a validator rooted at `base`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns [`PathError::Io`] if the directory cannot be created or canonicalized.
    pub fn new(base: &Path) -> Result<Self, PathError> {
        if base.as_os_str().is_empty() {
            return Err(PathError::Empty);
        }
        std::fs::create_dir_all(base).map_err(|e| PathError::io(base, e))?;
        let base = std::fs::canonicalize(base).map_err(|e| PathError::io(base, e))?;
        Ok(Self { base })
    }

    /// The canonical base directory.
    #[must_use]
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Resolves a file path that must be a strict descendant of the base.
    ///
    /// Relative paths are taken relative to the base.
    ///
    /// # Errors
    ///
    /// Returns [`PathError::OutsideBase`] or [`PathError::IsBase`] when the
    /// resolved path escapes or equals the base.
    pub fn validate(&self, candidate: impl AsRef<Path>) -> Result<PathBuf, PathError> {
        let resolved = self.resolve(candidate.as_ref())?;
        if resolved == self.base {
            return Err(PathError::IsBase { path: resolved });
        }
        if !resolved.starts_with(&self.base) {
            return Err(PathError::OutsideBase { path: resolved });
        }
        Ok(resolved)
    }

    /// Resolves a target directory, which may be the base itself.
    ///
    /// # Errors
    ///
    /// Returns [`PathError::OutsideBase`] when the directory escapes the base.
    pub fn validate_dir(&self, candidate: impl AsRef<Path>) -> Result<PathBuf, PathError> {
        let resolved = self.resolve(candidate.as_ref())?;
        if !resolved.starts_with(&self.base) {
            return Err(PathError::OutsideBase { path: resolved });
        }
        Ok(resolved)
    }

    /// Returns true when `candidate` resolves to a strict descendant of the base.
    #[must_use]
    pub fn is_strict_descendant(&self, candidate: impl AsRef<Path>) -> bool {
        self.validate(candidate).is_ok()
    }

    fn resolve(&self, candidate: &Path) -> Result<PathBuf, PathError> {
        if candidate.as_os_str().is_empty() {
            return Err(PathError::Empty);
        }
        let joined = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.base.join(candidate)
        };
        canonicalize_existing_prefix(&normalize_lexically(&joined))
    }
}

/// Removes `.` and folds `..` without touching the filesystem.
#[must_use]
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                // Never pops past the root.
                if !matches!(
                    out.components().next_back(),
                    None | Some(Component::RootDir | Component::Prefix(_))
                ) {
                    out.pop();
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Canonicalizes the longest existing ancestor and re-appends the rest.
fn canonicalize_existing_prefix(path: &Path) -> Result<PathBuf, PathError> {
    let mut existing = path.to_path_buf();
    let mut rest = Vec::new();
    loop {
        match std::fs::canonicalize(&existing) {
            Ok(mut resolved) => {
                for part in rest.iter().rev() {
                    resolved.push(part);
                }
                return Ok(resolved);
            }
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                let Some(name) = existing.file_name().map(ToOwned::to_owned) else {
                    return Err(PathError::io(path, error));
                };
                rest.push(name);
                if !existing.pop() {
                    return Err(PathError::io(path, error));
                }
            }
            Err(error) => return Err(PathError::io(path, error)),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn validator() -> (TempDir, PathValidator) {
        let dir = TempDir::new().unwrap();
        let validator = PathValidator::new(dir.path()).unwrap();
        (dir, validator)
    }

    #[test]
    fn test_normalize_lexically_folds_parent_segments() {
        assert_eq!(
            normalize_lexically(Path::new("/downloads/movie/../../etc/passwd")),
            PathBuf::from("/etc/passwd")
        );
        assert_eq!(
            normalize_lexically(Path::new("/a/./b/../c")),
            PathBuf::from("/a/c")
        );
        assert_eq!(
            normalize_lexically(Path::new("/../../x")),
            PathBuf::from("/x")
        );
    }

    #[test]
    fn test_validate_accepts_nested_relative_path() {
        let (_dir, validator) = validator();
        let resolved = validator.validate("movies/film.mkv").unwrap();
        assert_eq!(resolved, validator.base().join("movies/film.mkv"));
    }

    #[test]
    fn test_validate_rejects_traversal_out_of_base() {
        let (_dir, validator) = validator();
        let candidate = validator.base().join("movie/../../etc/passwd");
        assert!(matches!(
            validator.validate(&candidate),
            Err(PathError::OutsideBase { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_base_itself() {
        let (_dir, validator) = validator();
        let base = validator.base().to_path_buf();
        assert!(matches!(
            validator.validate(&base),
            Err(PathError::IsBase { .. })
        ));
        assert!(matches!(
            validator.validate(base.join("sub/..")),
            Err(PathError::IsBase { .. })
        ));
        assert_eq!(validator.validate_dir(&base).unwrap(), base);
    }

    #[test]
    fn test_validate_rejects_sibling_with_common_prefix() {
        let parent = TempDir::new().unwrap();
        let base = parent.path().join("downloads");
        let sibling = parent.path().join("downloads-evil");
        std::fs::create_dir_all(&sibling).unwrap();
        let validator = PathValidator::new(&base).unwrap();

        assert!(!validator.is_strict_descendant(sibling.join("x.txt")));
    }

    #[cfg(unix)]
    #[test]
    fn test_validate_rejects_symlink_escape() {
        let (_dir, validator) = validator();
        let outside = TempDir::new().unwrap();
        std::fs::write(outside.path().join("secret.txt"), b"x").unwrap();
        std::os::unix::fs::symlink(outside.path(), validator.base().join("link")).unwrap();

        assert!(matches!(
            validator.validate("link/secret.txt"),
            Err(PathError::OutsideBase { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_empty_path() {
        let (_dir, validator) = validator();
        assert!(matches!(validator.validate(""), Err(PathError::Empty)));
    }
}
