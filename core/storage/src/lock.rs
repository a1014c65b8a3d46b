//! Advisory file lock for serializing read-modify-write cycles.
//!
//! On Unix an exclusive `flock` on a sidecar `<file>.lock` serializes
//! writers across processes. Elsewhere the lock degrades to a no-op and
//! writes rely on atomic rename alone.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

use lockbox_common::{Error, Result};

/// Sidecar lock for a state file.
#[derive(Debug, Clone)]
pub struct FileLock {
    path: PathBuf,
}

/// Guard that holds the exclusive lock for its lifetime.
#[derive(Debug)]
pub struct FileLockGuard {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Lock guarding `target`; the lock file is `<target>.lock`.
    pub fn for_file(target: &Path) -> Self {
        let mut name = target.as_os_str().to_os_string();
        name.push(".lock");
        Self {
            path: PathBuf::from(name),
        }
    }

    /// Path of the lock file itself.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquire the exclusive lock, waiting for other holders to release it.
    ///
    /// The blocking `flock` call runs on the blocking thread pool.
    pub async fn acquire(&self) -> Result<FileLockGuard> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || lock_blocking(path))
            .await
            .map_err(|e| Error::Storage(format!("Lock task failed: {}", e)))?
    }

    /// Try to acquire the lock without waiting.
    ///
    /// Returns `Ok(None)` if another holder has it.
    pub fn try_acquire(&self) -> Result<Option<FileLockGuard>> {
        let file = open_lock_file(&self.path)?;
        if imp::try_lock_exclusive(&file)? {
            Ok(Some(FileLockGuard {
                file,
                path: self.path.clone(),
            }))
        } else {
            Ok(None)
        }
    }
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        let _ = imp::unlock(&self.file);
        debug!(path = %self.path.display(), "Released file lock");
    }
}

fn open_lock_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut options = OpenOptions::new();
    options.read(true).write(true).create(true).truncate(false);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(crate::fs::PRIVATE_FILE_MODE);
    }
    Ok(options.open(path)?)
}

fn lock_blocking(path: PathBuf) -> Result<FileLockGuard> {
    let file = open_lock_file(&path)?;
    imp::lock_exclusive(&file)?;
    debug!(path = %path.display(), "Acquired file lock");
    Ok(FileLockGuard { file, path })
}

#[cfg(unix)]
mod imp {
    use std::fs::File;
    use std::os::unix::io::AsRawFd;

    pub fn lock_exclusive(file: &File) -> std::io::Result<()> {
        loop {
            // SAFETY: `flock` is called with a valid fd owned by `file`.
            let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
            if result == 0 {
                return Ok(());
            }
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    pub fn try_lock_exclusive(file: &File) -> std::io::Result<bool> {
        // SAFETY: `flock` is called with a valid fd owned by `file`.
        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if result == 0 {
            return Ok(true);
        }
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::WouldBlock {
            Ok(false)
        } else {
            Err(err)
        }
    }

    pub fn unlock(file: &File) -> std::io::Result<()> {
        // SAFETY: `flock` is called with a valid fd owned by `file`.
        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
        if result == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }
}

#[cfg(not(unix))]
mod imp {
    use std::fs::File;

    pub fn lock_exclusive(_file: &File) -> std::io::Result<()> {
        Ok(())
    }

    pub fn try_lock_exclusive(_file: &File) -> std::io::Result<bool> {
        Ok(true)
    }

    pub fn unlock(_file: &File) -> std::io::Result<()> {
        Ok(())
    }
}
