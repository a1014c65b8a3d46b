//! Owner-only, atomic file writes.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use lockbox_common::{Error, Result};

/// Permission bits for files holding vault state.
pub const PRIVATE_FILE_MODE: u32 = 0o600;

/// Permission bits for directories holding vault state.
pub const PRIVATE_DIR_MODE: u32 = 0o700;

/// Map an arbitrary identifier to a single flat file name component.
///
/// Bytes outside `[A-Za-z0-9.-]` are escaped as `_xx`, so distinct
/// identifiers never map to the same name.
pub fn escape_file_name(id: &str) -> String {
    let mut name = String::with_capacity(id.len());
    for byte in id.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'-' => name.push(char::from(byte)),
            _ => name.push_str(&format!("_{:02x}", byte)),
        }
    }
    name
}

/// Create `dir` (and parents) restricted to the owner.
pub async fn ensure_private_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        fs::create_dir_all(dir).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(dir, std::fs::Permissions::from_mode(PRIVATE_DIR_MODE)).await?;
        }
    }
    Ok(())
}

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

fn temp_path_for(path: &Path) -> PathBuf {
    let parent = path.parent().unwrap_or(Path::new("."));
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "state".to_string());
    let seq = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    parent.join(format!(".{}.{}.{}.tmp", name, std::process::id(), seq))
}

async fn ensure_parent(path: &Path) -> Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => ensure_private_dir(parent).await,
        _ => Ok(()),
    }
}

/// Write `data` to a fresh owner-only temp file next to `path` and fsync it.
async fn write_temp(path: &Path, data: &[u8]) -> Result<PathBuf> {
    let tmp_path = temp_path_for(path);

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(PRIVATE_FILE_MODE);

    let write_result = async {
        let mut file = options.open(&tmp_path).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        Ok::<_, std::io::Error>(())
    }
    .await;

    match write_result {
        Ok(()) => Ok(tmp_path),
        Err(e) => {
            let _ = fs::remove_file(&tmp_path).await;
            Err(Error::Io(e))
        }
    }
}

/// Write `data` to `path` atomically.
///
/// 1. Write to a temp file in the same directory, mode 0600.
/// 2. fsync the temp file.
/// 3. Rename it over the target.
///
/// Readers see either the previous content or the new content, never a
/// prefix. A crash leaves at most a stray temp file behind.
pub async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    ensure_parent(path).await?;
    let tmp_path = write_temp(path, data).await?;

    if let Err(e) = fs::rename(&tmp_path, path).await {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(Error::Io(e));
    }

    debug!(path = %path.display(), bytes = data.len(), "Atomic write complete");
    Ok(())
}

/// Create `path` holding `data` unless it already exists.
///
/// Like [`write_atomic`], but the finished temp file is hard-linked into
/// place, which fails instead of replacing an existing file. Returns
/// `false` if `path` was already there; its content is left untouched.
/// No reader ever sees `path` empty or half written.
pub async fn write_new_atomic(path: &Path, data: &[u8]) -> Result<bool> {
    ensure_parent(path).await?;
    let tmp_path = write_temp(path, data).await?;

    let linked = fs::hard_link(&tmp_path, path).await;
    let _ = fs::remove_file(&tmp_path).await;

    match linked {
        Ok(()) => {
            debug!(path = %path.display(), bytes = data.len(), "Created file");
            Ok(true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(Error::Io(e)),
    }
}

/// Read a whole file, mapping absence to `NotFound`.
pub async fn read_existing(path: &Path, what: &str) -> Result<Vec<u8>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::NotFound(format!(
            "{} not found at {}",
            what,
            path.display()
        ))),
        Err(e) => Err(Error::Io(e)),
    }
}

/// Remove a file; a missing file is not an error.
pub async fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::Io(e)),
    }
}
