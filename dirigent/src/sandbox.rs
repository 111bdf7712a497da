//! Sandboxed filesystem gateway — the only I/O surface workers may use.
//!
//! Every path is taken relative to one project root and checked twice:
//! syntactically (no absolute prefix, no parent-directory segments) and
//! again after resolution (the canonicalized target must still live under
//! the canonicalized root). The second check defeats symlink escapes the
//! first one cannot see.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("invalid or unsafe path: {path}")]
    Escape { path: String },
    #[error("not found: {path}")]
    NotFound { path: String },
    #[error("not a directory: {path}")]
    NotADirectory { path: String },
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// Directory listing split into files and subdirectories, both sorted and
/// relative to the sandbox root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirListing {
    pub files: Vec<String>,
    pub directories: Vec<String>,
}

/// Restricted read/write/list confined to a fixed project root.
#[derive(Debug, Clone)]
pub struct SandboxFs {
    root: PathBuf,
}

impl SandboxFs {
    /// Create a gateway rooted at `root`, creating the directory if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, SandboxError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| SandboxError::Io {
            path: root.display().to_string(),
            source,
        })?;
        let root = root.canonicalize().map_err(|source| SandboxError::Io {
            path: root.display().to_string(),
            source,
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write `content` to `path`, creating intermediate directories.
    pub fn write(&self, path: &str, content: &str) -> Result<(), SandboxError> {
        let full = self.resolve_for_write(path)?;
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).map_err(|source| SandboxError::Io {
                path: path.to_string(),
                source,
            })?;
        }
        fs::write(&full, content).map_err(|source| SandboxError::Io {
            path: path.to_string(),
            source,
        })?;
        debug!(path, bytes = content.len(), "sandbox write");
        Ok(())
    }

    /// Read the file at `path`.
    pub fn read(&self, path: &str) -> Result<String, SandboxError> {
        let full = self.resolve_existing(path)?;
        fs::read_to_string(&full).map_err(|source| SandboxError::Io {
            path: path.to_string(),
            source,
        })
    }

    /// List files and directories directly under `path`.
    pub fn list(&self, path: &str) -> Result<DirListing, SandboxError> {
        let full = self.resolve_existing(path)?;
        if !full.is_dir() {
            return Err(SandboxError::NotADirectory {
                path: path.to_string(),
            });
        }

        let mut files = Vec::new();
        let mut directories = Vec::new();
        let entries = fs::read_dir(&full).map_err(|source| SandboxError::Io {
            path: path.to_string(),
            source,
        })?;
        for entry in entries.flatten() {
            let entry_path = entry.path();
            let Ok(rel) = entry_path.strip_prefix(&self.root) else {
                continue;
            };
            let rel = rel.to_string_lossy().into_owned();
            if entry_path.is_dir() {
                directories.push(rel);
            } else {
                files.push(rel);
            }
        }
        files.sort();
        directories.sort();
        Ok(DirListing { files, directories })
    }

    /// Whether `path` exists inside the sandbox. Escaping paths read as absent.
    pub fn exists(&self, path: &str) -> bool {
        self.resolve_existing(path).is_ok()
    }

    /// Syntactic check: relative, no parent segments.
    fn checked_join(&self, path: &str) -> Result<PathBuf, SandboxError> {
        let rel = Path::new(path);
        if path.is_empty() || rel.is_absolute() {
            return Err(SandboxError::Escape {
                path: path.to_string(),
            });
        }
        for component in rel.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => {
                    return Err(SandboxError::Escape {
                        path: path.to_string(),
                    });
                }
            }
        }
        Ok(self.root.join(rel))
    }

    /// Resolve an existing target and re-verify it is still under the root.
    fn resolve_existing(&self, path: &str) -> Result<PathBuf, SandboxError> {
        let joined = self.checked_join(path)?;
        let resolved = joined.canonicalize().map_err(|_| SandboxError::NotFound {
            path: path.to_string(),
        })?;
        if !resolved.starts_with(&self.root) {
            return Err(SandboxError::Escape {
                path: path.to_string(),
            });
        }
        Ok(resolved)
    }

    /// Resolve a write target: the target itself (when it exists) and the
    /// nearest existing ancestor are both canonicalized so neither a
    /// symlinked file nor a symlinked directory can smuggle the write
    /// outside the root.
    fn resolve_for_write(&self, path: &str) -> Result<PathBuf, SandboxError> {
        let joined = self.checked_join(path)?;

        // An existing target may be a symlink; follow it before deciding.
        // A dangling link counts as an escape, the write would follow it.
        if fs::symlink_metadata(&joined).is_ok() {
            let resolved = joined.canonicalize().map_err(|_| SandboxError::Escape {
                path: path.to_string(),
            })?;
            if !resolved.starts_with(&self.root) {
                return Err(SandboxError::Escape {
                    path: path.to_string(),
                });
            }
            return Ok(resolved);
        }

        let mut ancestor = joined.parent();
        while let Some(dir) = ancestor {
            if dir.exists() {
                let resolved = dir.canonicalize().map_err(|source| SandboxError::Io {
                    path: path.to_string(),
                    source,
                })?;
                if !resolved.starts_with(&self.root) {
                    return Err(SandboxError::Escape {
                        path: path.to_string(),
                    });
                }
                break;
            }
            ancestor = dir.parent();
        }
        Ok(joined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sandbox() -> (tempfile::TempDir, SandboxFs) {
        let temp = tempfile::tempdir().expect("tempdir");
        let fs = SandboxFs::new(temp.path()).expect("sandbox");
        (temp, fs)
    }

    #[test]
    fn parent_traversal_is_rejected() {
        let (_temp, fs) = sandbox();
        assert!(matches!(
            fs.write("../escape.txt", "x"),
            Err(SandboxError::Escape { .. })
        ));
        assert!(matches!(
            fs.read("a/../../etc/passwd"),
            Err(SandboxError::Escape { .. })
        ));
    }

    #[test]
    fn absolute_paths_are_rejected() {
        let (_temp, fs) = sandbox();
        assert!(matches!(
            fs.write("/etc/x", "x"),
            Err(SandboxError::Escape { .. })
        ));
        assert!(matches!(fs.list("/"), Err(SandboxError::Escape { .. })));
    }

    #[test]
    fn write_then_read_round_trips() {
        let (_temp, fs) = sandbox();
        fs.write("a/b.txt", "hi").expect("write");
        assert_eq!(fs.read("a/b.txt").expect("read"), "hi");
    }

    #[test]
    fn read_missing_is_not_found() {
        let (_temp, fs) = sandbox();
        assert!(matches!(
            fs.read("nope.txt"),
            Err(SandboxError::NotFound { .. })
        ));
        assert!(matches!(
            fs.list("nodir"),
            Err(SandboxError::NotFound { .. })
        ));
    }

    #[test]
    fn list_splits_files_and_directories() {
        let (_temp, fs) = sandbox();
        fs.write("docs/readme.md", "r").expect("write");
        fs.write("docs/api/spec.yml", "s").expect("write");

        let listing = fs.list("docs").expect("list");
        assert_eq!(listing.files, vec!["docs/readme.md".to_string()]);
        assert_eq!(listing.directories, vec!["docs/api".to_string()]);
    }

    #[cfg(unix)]
    #[test]
    fn symlink_escape_is_rejected_on_resolution() {
        let (_temp, fs) = sandbox();
        let outside = tempfile::tempdir().expect("outside");
        std::os::unix::fs::symlink(outside.path(), fs.root().join("link")).expect("symlink");

        // Syntactically fine, but resolves outside the root.
        assert!(matches!(
            fs.write("link/evil.txt", "x"),
            Err(SandboxError::Escape { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn symlink_file_cannot_redirect_a_write_outside_the_root() {
        let (_temp, fs) = sandbox();
        let outside = tempfile::tempdir().expect("outside");
        let secret = outside.path().join("secret.txt");
        std::fs::write(&secret, "original").expect("seed");
        std::os::unix::fs::symlink(&secret, fs.root().join("link.txt")).expect("symlink");

        assert!(matches!(
            fs.write("link.txt", "pwned"),
            Err(SandboxError::Escape { .. })
        ));
        // The linked-to file is untouched.
        assert_eq!(std::fs::read_to_string(&secret).expect("read"), "original");
    }

    #[cfg(unix)]
    #[test]
    fn dangling_symlink_write_is_rejected() {
        let (_temp, fs) = sandbox();
        let outside = tempfile::tempdir().expect("outside");
        let target = outside.path().join("not-yet.txt");
        std::os::unix::fs::symlink(&target, fs.root().join("dangling.txt")).expect("symlink");

        assert!(matches!(
            fs.write("dangling.txt", "x"),
            Err(SandboxError::Escape { .. })
        ));
        assert!(!target.exists());
    }

    #[cfg(unix)]
    #[test]
    fn symlink_inside_the_root_is_still_writable() {
        let (_temp, fs) = sandbox();
        fs.write("real.txt", "old").expect("write");
        std::os::unix::fs::symlink(fs.root().join("real.txt"), fs.root().join("alias.txt"))
            .expect("symlink");

        fs.write("alias.txt", "new").expect("write through link");
        assert_eq!(fs.read("real.txt").expect("read"), "new");
    }
}
