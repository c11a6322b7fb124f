//! Consumer-side, read-only mappings of a received region handle.

use std::os::fd::{AsRawFd, BorrowedFd};
use std::ptr::NonNull;

use crate::AllocError;

/// A read-only `MAP_SHARED` mapping of a descriptor produced by [`crate::allocate`].
///
/// The view does not keep the descriptor; the sender may close its copy as
/// soon as this returns.
pub struct SharedView {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the view owns its mapping and only hands out shared borrows.
unsafe impl Send for SharedView {}
unsafe impl Sync for SharedView {}

impl SharedView {
    /// Map the first `len` bytes of `fd` read-only.
    pub fn map(fd: BorrowedFd<'_>, len: usize) -> Result<Self, AllocError> {
        if len == 0 {
            return Err(AllocError::InvalidSize);
        }

        let file_len = file_len(fd).map_err(AllocError::MapFailed)?;
        if file_len < len {
            return Err(AllocError::BackingTooSmall {
                len: file_len,
                required: len,
            });
        }

        let ptr = crate::map(fd, len, libc::PROT_READ).map_err(AllocError::MapFailed)?;
        tracing::trace!(fd = fd.as_raw_fd(), len, "mapped shared view");
        Ok(Self { ptr, len })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: ptr/len describe our mapping, which lives as long as self.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Read the `index`-th 32-bit word, if in bounds.
    pub fn word(&self, index: usize) -> Option<u32> {
        let start = index.checked_mul(4)?;
        let bytes = self.as_bytes().get(start..start + 4)?;
        Some(u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

impl Drop for SharedView {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from a successful map() and no borrows outlive self.
        unsafe { crate::unmap(self.ptr, self.len) };
    }
}

impl std::fmt::Debug for SharedView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedView").field("len", &self.len).finish()
    }
}

fn file_len(fd: BorrowedFd<'_>) -> std::io::Result<usize> {
    // SAFETY: zeroed stat is a valid out-parameter for fstat.
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    // SAFETY: fd is a live descriptor for the duration of the borrow.
    if unsafe { libc::fstat(fd.as_raw_fd(), &mut stat) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(stat.st_size as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocate;

    #[test]
    fn test_view_sees_writer_bytes() {
        let mut region = allocate(16).unwrap();
        region.as_words_mut()[1] = 0xdead_beef;

        let view = SharedView::map(region.handle().unwrap(), 16).unwrap();
        assert_eq!(view.word(1), Some(0xdead_beef));

        // Writes after mapping are visible too; both map the same pages.
        region.as_words_mut()[2] = 42;
        assert_eq!(view.word(2), Some(42));
        assert_eq!(view.word(4), None);
    }

    #[test]
    fn test_view_outlives_closed_handles() {
        let mut region = allocate(8).unwrap();
        let view = SharedView::map(region.handle().unwrap(), 8).unwrap();
        region.close_handle();

        region.as_bytes_mut()[0] = 9;
        assert_eq!(view.as_bytes()[0], 9);
    }

    #[test]
    fn test_view_rejects_oversized_mapping() {
        let region = allocate(8).unwrap();
        let err = SharedView::map(region.handle().unwrap(), 4096).unwrap_err();
        assert!(matches!(
            err,
            AllocError::BackingTooSmall {
                len: 8,
                required: 4096
            }
        ));
    }
}
