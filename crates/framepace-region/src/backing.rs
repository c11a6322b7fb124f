//! Backing files for shared regions.
//!
//! Prefers `memfd_create`. Kernels without memfd fall back to a file in
//! `$XDG_RUNTIME_DIR` (or the system temp dir) that is unlinked right after
//! creation, so only the descriptor keeps it alive.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

/// Attempts at picking an unused temp file name before giving up.
const MAX_NAME_ATTEMPTS: u32 = 16;

static NEXT_NAME: AtomicU32 = AtomicU32::new(0);

/// Create an anonymous file of exactly `size` bytes.
pub(crate) fn create_anonymous_file(size: usize) -> io::Result<File> {
    let file = create_backing_file()?;
    file.set_len(size as u64)?;
    Ok(file)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn create_backing_file() -> io::Result<File> {
    match memfd() {
        Ok(file) => Ok(file),
        Err(e) if e.raw_os_error() == Some(libc::ENOSYS) => {
            tracing::debug!("memfd_create unsupported, using an unlinked temp file");
            unlinked_temp_file()
        }
        Err(e) => Err(e),
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn create_backing_file() -> io::Result<File> {
    unlinked_temp_file()
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn memfd() -> io::Result<File> {
    use std::os::fd::FromRawFd;

    let name = c"framepace-shared";
    // SAFETY: name is a valid NUL-terminated string.
    let fd = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fd was just returned by memfd_create and nothing else owns it.
    Ok(unsafe { File::from_raw_fd(fd) })
}

fn unlinked_temp_file() -> io::Result<File> {
    let dir = std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir);

    for _ in 0..MAX_NAME_ATTEMPTS {
        let path = dir.join(format!(
            "framepace-shared-{}-{}",
            std::process::id(),
            NEXT_NAME.fetch_add(1, Ordering::Relaxed)
        ));

        // std opens with O_CLOEXEC on unix.
        match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&path)
        {
            Ok(file) => {
                std::fs::remove_file(&path)?;
                return Ok(file);
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }

    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("no free temp file name in {}", dir.display()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anonymous_file_has_requested_size() {
        let file = create_anonymous_file(4096).unwrap();
        assert_eq!(file.metadata().unwrap().len(), 4096);
    }

    #[test]
    fn test_unlinked_temp_file_is_usable() {
        use std::os::unix::fs::MetadataExt;

        let file = unlinked_temp_file().unwrap();
        file.set_len(128).unwrap();
        let meta = file.metadata().unwrap();
        assert_eq!(meta.len(), 128);
        // No directory entry left behind.
        assert_eq!(meta.nlink(), 0);
    }
}
