//! Anonymous shared memory regions.
//!
//! A [`SharedRegion`] is a read-write `MAP_SHARED` mapping of an anonymous
//! file. The file descriptor behind it is the transferable handle: give it to
//! the consumer (a display server, another process) with
//! [`SharedRegion::share`], which closes the local copy afterwards. The
//! mapping stays valid after the descriptor is closed and lives until the
//! region is dropped.
//!
//! [`SharedView`] is the other half: it maps a received descriptor read-only.
//!
//! ```no_run
//! use framepace_region::{AllocError, SharedView};
//!
//! let mut region = framepace_region::allocate(4096)?;
//! region.as_bytes_mut().fill(0xff);
//! let view = region.share(|fd| SharedView::map(fd, 4096))?;
//! assert_eq!(view.word(0), Some(0xffff_ffff));
//! # Ok::<(), AllocError>(())
//! ```

#![forbid(unsafe_op_in_unsafe_fn)]

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::ptr::NonNull;

mod backing;
mod view;

pub use view::SharedView;

/// Allocate a shared region of `size` bytes.
///
/// The contents are unspecified. The returned region owns one transferable
/// handle, see [`SharedRegion::handle`].
pub fn allocate(size: usize) -> Result<SharedRegion, AllocError> {
    if size == 0 {
        return Err(AllocError::InvalidSize);
    }

    let file = backing::create_anonymous_file(size).map_err(|e| {
        tracing::error!(size, error = %e, "creating a shared buffer file failed");
        AllocError::BackingStoreUnavailable(e)
    })?;

    // On failure `file` is dropped here, which closes the backing store.
    let ptr = map(file.as_fd(), size, libc::PROT_READ | libc::PROT_WRITE).map_err(|e| {
        tracing::error!(size, error = %e, "mmap of shared buffer failed");
        AllocError::MapFailed(e)
    })?;

    let handle = OwnedFd::from(file);
    tracing::debug!(size, fd = handle.as_raw_fd(), "allocated shared region");

    Ok(SharedRegion {
        ptr,
        len: size,
        handle: Some(handle),
    })
}

/// `mmap` a descriptor with `MAP_SHARED`.
pub(crate) fn map(fd: BorrowedFd<'_>, len: usize, prot: libc::c_int) -> io::Result<NonNull<u8>> {
    // SAFETY: we ask the kernel for a fresh mapping; no existing memory is touched.
    let addr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            prot,
            libc::MAP_SHARED,
            fd.as_raw_fd(),
            0,
        )
    };

    if addr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }

    NonNull::new(addr as *mut u8).ok_or_else(|| io::Error::other("mmap returned null"))
}

/// `munmap` a mapping created by [`map`].
///
/// # Safety
///
/// `ptr` and `len` must describe a live mapping that nothing borrows anymore.
pub(crate) unsafe fn unmap(ptr: NonNull<u8>, len: usize) {
    // SAFETY: guaranteed by the caller.
    let rc = unsafe { libc::munmap(ptr.as_ptr() as *mut libc::c_void, len) };
    if rc != 0 {
        tracing::warn!(len, error = %io::Error::last_os_error(), "munmap failed");
    }
}

// =============================================================================
// SharedRegion
// =============================================================================

/// A read-write shared mapping backed by an anonymous file.
pub struct SharedRegion {
    ptr: NonNull<u8>,
    len: usize,
    /// Transferable handle; `None` once closed.
    handle: Option<OwnedFd>,
}

// SAFETY: the region exclusively owns its mapping; access goes through &self / &mut self.
unsafe impl Send for SharedRegion {}

impl SharedRegion {
    /// Size of the mapping in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always false; regions are never empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The transferable handle, until [`close_handle`](Self::close_handle) is called.
    pub fn handle(&self) -> Option<BorrowedFd<'_>> {
        self.handle.as_ref().map(|fd| fd.as_fd())
    }

    /// Close the local copy of the handle.
    ///
    /// Returns `true` if a handle was open. The mapping is unaffected.
    pub fn close_handle(&mut self) -> bool {
        match self.handle.take() {
            Some(fd) => {
                tracing::trace!(fd = fd.as_raw_fd(), len = self.len, "closing shared region handle");
                true
            }
            None => false,
        }
    }

    /// Hand the handle to `send`, then close it.
    ///
    /// The handle is closed whether or not `send` succeeds, so it is closed
    /// exactly once. Fails with [`AllocError::HandleClosed`] if it was
    /// already closed.
    pub fn share<T, E>(&mut self, send: impl FnOnce(BorrowedFd<'_>) -> Result<T, E>) -> Result<T, E>
    where
        E: From<AllocError>,
    {
        let fd = self.handle.take().ok_or(AllocError::HandleClosed)?;
        let result = send(fd.as_fd());
        tracing::trace!(fd = fd.as_raw_fd(), len = self.len, "shared region handed off");
        drop(fd);
        result
    }

    /// The mapped bytes.
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: ptr/len describe our mapping, which lives as long as self.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// The mapped bytes, writable.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above, and &mut self gives exclusive access on our side.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// The mapping as 32-bit words. Trailing bytes past a multiple of 4 are excluded.
    pub fn as_words(&self) -> &[u32] {
        // SAFETY: mmap returns page-aligned memory, so u32 alignment holds.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr() as *const u32, self.len / 4) }
    }

    /// The mapping as writable 32-bit words.
    pub fn as_words_mut(&mut self) -> &mut [u32] {
        // SAFETY: page-aligned, exclusive on our side.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr() as *mut u32, self.len / 4) }
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from a successful map() and no borrows outlive self.
        unsafe { unmap(self.ptr, self.len) };
    }
}

impl std::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("len", &self.len)
            .field("handle", &self.handle.as_ref().map(|fd| fd.as_raw_fd()))
            .finish()
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Errors from allocating or mapping a shared region.
#[derive(Debug)]
pub enum AllocError {
    /// Requested size was zero.
    InvalidSize,
    /// The anonymous file could not be created or sized.
    BackingStoreUnavailable(io::Error),
    /// The file exists but mapping it failed.
    MapFailed(io::Error),
    /// A received descriptor is smaller than the mapping asked for.
    BackingTooSmall { len: usize, required: usize },
    /// The region's handle was already handed off and closed.
    HandleClosed,
}

impl std::fmt::Display for AllocError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidSize => write!(f, "shared region size must be positive"),
            Self::BackingStoreUnavailable(e) => {
                write!(f, "creating a shared buffer file failed: {}", e)
            }
            Self::MapFailed(e) => write!(f, "mmap failed: {}", e),
            Self::BackingTooSmall { len, required } => {
                write!(
                    f,
                    "backing file too small: {} bytes, need {}",
                    len, required
                )
            }
            Self::HandleClosed => write!(f, "shared region handle already closed"),
        }
    }
}

impl std::error::Error for AllocError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::BackingStoreUnavailable(e) | Self::MapFailed(e) => Some(e),
            _ => None,
        }
    }
}
