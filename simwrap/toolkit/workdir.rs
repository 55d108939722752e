use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::error::ToolkitError;

/// Creates `path` and its parents. Succeeds when another worker created the
/// directory concurrently.
pub fn ensure_dir(path: impl AsRef<Path>) -> Result<(), ToolkitError> {
    let path = path.as_ref();
    match fs::create_dir_all(path) {
        Ok(()) => Ok(()),
        Err(_) if path.is_dir() => Ok(()),
        Err(err) => Err(ToolkitError::io(
            format!("creating directory {}", path.display()),
            err,
        )),
    }
}

/// Uniquely named scratch directory for one evaluation.
///
/// The directory is removed when the guard is dropped, whichever way the
/// scope is left. With `cleanup == false` it is left on disk for debugging.
/// The process working directory is never changed: run external commands
/// with [`TempWorkDir::path`] as their `current_dir`.
pub struct TempWorkDir {
    path: PathBuf,
    guard: Option<TempDir>,
}

impl TempWorkDir {
    /// Creates a directory named `<prefix><random>` under `base`.
    pub fn new(
        base: impl AsRef<Path>,
        prefix: &str,
        cleanup: bool,
    ) -> Result<Self, ToolkitError> {
        let base = base.as_ref();
        ensure_dir(base)?;
        let dir = tempfile::Builder::new()
            .prefix(prefix)
            .tempdir_in(base)
            .map_err(|err| {
                ToolkitError::io(format!("creating work dir in {}", base.display()), err)
            })?;
        if cleanup {
            debug!(path = %dir.path().display(), "created work dir");
            Ok(Self {
                path: dir.path().to_path_buf(),
                guard: Some(dir),
            })
        } else {
            let path = dir.keep();
            info!(path = %path.display(), "created work dir (kept after use)");
            Ok(Self { path, guard: None })
        }
    }

    /// Directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of `name` inside the directory.
    #[must_use]
    pub fn join(&self, name: impl AsRef<Path>) -> PathBuf {
        self.path.join(name)
    }

    /// Whether the directory is removed on drop.
    #[must_use]
    pub const fn cleans_up(&self) -> bool {
        self.guard.is_some()
    }

    /// Disables cleanup and returns the directory path.
    #[must_use]
    pub fn persist(mut self) -> PathBuf {
        if let Some(dir) = self.guard.take() {
            let _ = dir.keep();
        }
        self.path.clone()
    }

    /// Removes the directory now, reporting removal errors.
    pub fn close(mut self) -> Result<(), ToolkitError> {
        match self.guard.take() {
            Some(dir) => dir.close().map_err(|err| {
                ToolkitError::io(format!("removing work dir {}", self.path.display()), err)
            }),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for TempWorkDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TempWorkDir")
            .field("path", &self.path)
            .field("cleanup", &self.cleans_up())
            .finish()
    }
}

impl Drop for TempWorkDir {
    fn drop(&mut self) {
        if let Some(dir) = self.guard.take() {
            if let Err(err) = dir.close() {
                warn!(path = %self.path.display(), error = %err, "failed to remove work dir");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn removes_directory_on_drop() {
        let base = tempdir().unwrap();
        let path = {
            let work = TempWorkDir::new(base.path(), "sim-", true).unwrap();
            fs::write(work.join("input.txt"), "1.0").unwrap();
            assert!(work
                .path()
                .file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("sim-"));
            work.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn removes_directory_when_scope_panics() {
        let base = tempdir().unwrap();
        let base_path = base.path().to_path_buf();
        let result = std::panic::catch_unwind(move || {
            let work = TempWorkDir::new(&base_path, "boom-", true).unwrap();
            fs::write(work.join("partial.xml"), "<x/>").unwrap();
            panic!("simulation crashed");
        });
        assert!(result.is_err());
        assert_eq!(fs::read_dir(base.path()).unwrap().count(), 0);
    }

    #[test]
    fn keeps_directory_without_cleanup() {
        let base = tempdir().unwrap();
        let work = TempWorkDir::new(base.path().join("nested"), "keep-", false).unwrap();
        assert!(!work.cleans_up());
        let path = work.path().to_path_buf();
        drop(work);
        assert!(path.is_dir());
    }

    #[test]
    fn persist_and_close() {
        let base = tempdir().unwrap();
        let kept = TempWorkDir::new(base.path(), "p-", true).unwrap().persist();
        assert!(kept.is_dir());

        let closed = TempWorkDir::new(base.path(), "c-", true).unwrap();
        let closed_path = closed.path().to_path_buf();
        closed.close().unwrap();
        assert!(!closed_path.exists());
    }

    #[test]
    fn ensure_dir_is_idempotent() {
        let base = tempdir().unwrap();
        let target = base.path().join("a/b/c");
        ensure_dir(&target).unwrap();
        ensure_dir(&target).unwrap();
        assert!(target.is_dir());
    }
}
