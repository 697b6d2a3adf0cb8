//! Temporary resource guard
//!
//! Every temporary file or directory an export creates (the GIF palette, the
//! frame buffer directory of a streaming GIF) is registered with a
//! [`TempGuard`] scoped to that export. Each resource is released exactly
//! once: explicitly, through [`TempGuard::release_all`], or when the guard
//! is dropped (which also covers a cancelled future or an unwinding task).

use parking_lot::Mutex;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tempfile::{TempDir, TempPath};

/// What kind of resource to create
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    File,
    Directory,
}

enum Handle {
    File(TempPath),
    Directory(TempDir),
}

/// One registered temporary path with a one-shot release flag
pub struct TempResource {
    path: PathBuf,
    kind: ResourceKind,
    released: AtomicBool,
    handle: Mutex<Option<Handle>>,
}

impl TempResource {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Delete the resource from disk.
    ///
    /// Returns `Ok(false)` if it was already released. A resource that was
    /// removed by someone else counts as released.
    pub fn release(&self) -> io::Result<bool> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }

        let handle = self.handle.lock().take();
        let result = match handle {
            Some(Handle::File(path)) => path.close(),
            Some(Handle::Directory(dir)) => dir.close(),
            None => Ok(()),
        };

        match result {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(true),
            Err(e) => Err(e),
        }
    }
}

impl std::fmt::Debug for TempResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TempResource")
            .field("path", &self.path)
            .field("kind", &self.kind)
            .field("released", &self.is_released())
            .finish()
    }
}

/// Registry of the temporary resources owned by one export
#[derive(Debug, Default)]
pub struct TempGuard {
    resources: Mutex<Vec<Arc<TempResource>>>,
}

impl TempGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a uniquely named file or directory inside `dir` and register it.
    ///
    /// Files are created empty; the caller (usually the encoder) overwrites them.
    pub fn acquire(
        &self,
        kind: ResourceKind,
        dir: &Path,
        prefix: &str,
        suffix: &str,
    ) -> io::Result<PathBuf> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(prefix).suffix(suffix);

        let (path, handle) = match kind {
            ResourceKind::File => {
                let temp = builder.tempfile_in(dir)?.into_temp_path();
                (temp.to_path_buf(), Handle::File(temp))
            }
            ResourceKind::Directory => {
                let temp = builder.tempdir_in(dir)?;
                (temp.path().to_path_buf(), Handle::Directory(temp))
            }
        };

        tracing::debug!("Acquired temporary {:?}: {:?}", kind, path);
        self.resources.lock().push(Arc::new(TempResource {
            path: path.clone(),
            kind,
            released: AtomicBool::new(false),
            handle: Mutex::new(Some(handle)),
        }));

        Ok(path)
    }

    /// Release a single resource by path. Unknown paths are ignored.
    pub fn release(&self, path: &Path) -> io::Result<bool> {
        let resource = {
            let mut resources = self.resources.lock();
            let index = resources.iter().position(|r| r.path() == path);
            index.map(|i| resources.remove(i))
        };

        match resource {
            Some(resource) => resource.release(),
            None => Ok(false),
        }
    }

    /// Release everything still registered.
    ///
    /// Every resource is attempted even if an earlier one fails; the first
    /// error is returned.
    pub fn release_all(&self) -> io::Result<usize> {
        let resources: Vec<_> = std::mem::take(&mut *self.resources.lock());

        let mut released = 0;
        let mut first_error = None;
        for resource in resources {
            match resource.release() {
                Ok(true) => released += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!("Failed to remove temporary {:?}: {}", resource.path(), e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(released),
        }
    }

    /// Number of resources not yet released
    pub fn outstanding(&self) -> usize {
        self.resources
            .lock()
            .iter()
            .filter(|r| !r.is_released())
            .count()
    }
}

impl Drop for TempGuard {
    fn drop(&mut self) {
        if let Ok(count) = self.release_all() {
            if count > 0 {
                tracing::debug!("Released {} temporary resource(s) on drop", count);
            }
        }
    }
}
