//! Presence DLP - Secure Filesystem Operations
//!
//! Atomic writes for ciphertext, owner-only writes for protected containers,
//! and the best-effort zero-wipe applied to plaintext originals.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use tracing::warn;

use crate::error::{DlpError, DlpResult};

/// Zero buffer size used while wiping
const WIPE_CHUNK: usize = 1024 * 1024;

/// Write file atomically (temp file + rename)
pub fn write_atomic(path: &Path, data: &[u8]) -> DlpResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let mut temp_name = path.as_os_str().to_owned();
    temp_name.push(".tmp");
    let temp_path = Path::new(&temp_name);

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(temp_path)?;

    file.write_all(data)?;
    file.sync_all()?;

    fs::rename(temp_path, path)?;

    Ok(())
}

/// Write file atomically, readable only by the owner on Unix
pub fn write_private(path: &Path, data: &[u8]) -> DlpResult<()> {
    write_atomic(path, data)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }

    Ok(())
}

/// Overwrite the file with zeros sized to its length, then delete it.
///
/// Best effort only: log-structured and wear-levelled storage may keep
/// older copies of the blocks. A failed overwrite is logged and the delete
/// still happens.
pub fn wipe_and_delete(path: &Path) -> DlpResult<()> {
    if !path.exists() {
        return Err(DlpError::FileNotFound(path.display().to_string()));
    }

    if let Err(e) = overwrite_with_zeros(path) {
        warn!("Secure wipe failed for {}: {}", path.display(), e);
    }

    fs::remove_file(path)?;
    Ok(())
}

fn overwrite_with_zeros(path: &Path) -> std::io::Result<()> {
    let size = fs::metadata(path)?.len() as usize;
    if size == 0 {
        return Ok(());
    }

    let mut file = OpenOptions::new().write(true).open(path)?;
    let zeros = vec![0u8; size.min(WIPE_CHUNK)];
    let mut remaining = size;
    while remaining > 0 {
        let to_write = remaining.min(zeros.len());
        file.write_all(&zeros[..to_write])?;
        remaining -= to_write;
    }
    file.sync_all()
}
