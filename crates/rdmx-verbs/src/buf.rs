//! The session's registered buffer and the views carved out of it.

use std::io;
use std::ptr::NonNull;

use crate::error::{RdmaError, Result};

fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

/// Page-aligned, zero-initialised heap memory handed to the NIC.
///
/// The allocation is never moved or resized, so its address can be
/// registered and published to the peer for the lifetime of the value.
pub struct RegisteredBuffer {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the buffer is uniquely owned; all access goes through &self/&mut self.
unsafe impl Send for RegisteredBuffer {}

impl RegisteredBuffer {
    pub fn allocate(len: usize) -> Result<Self> {
        if len == 0 {
            return Err(RdmaError::Resource {
                op: "allocate buffer",
                source: io::Error::new(io::ErrorKind::InvalidInput, "zero-length buffer"),
            });
        }
        let mut raw: *mut libc::c_void = std::ptr::null_mut();
        // SAFETY: `raw` is a valid out pointer and page_size() is a power of two
        // multiple of size_of::<*mut c_void>().
        let ret = unsafe { libc::posix_memalign(&mut raw, page_size(), len) };
        if ret != 0 {
            return Err(RdmaError::Resource {
                op: "posix_memalign",
                source: io::Error::from_raw_os_error(ret),
            });
        }
        let ptr = NonNull::new(raw as *mut u8).ok_or_else(|| RdmaError::Resource {
            op: "posix_memalign",
            source: io::Error::from(io::ErrorKind::OutOfMemory),
        })?;
        // SAFETY: freshly allocated region of `len` bytes.
        unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0, len) };
        Ok(Self { ptr, len })
    }

    pub fn capacity(&self) -> usize {
        self.len
    }

    pub fn addr(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for len initialised bytes while self lives.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and &mut self guarantees exclusivity.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    pub fn whole(&self) -> RegionView {
        RegionView::new(0, self.len)
    }

    /// Rejects lengths past the end of the buffer.
    pub fn check_len(&self, length: usize) -> Result<()> {
        if length > self.len {
            return Err(RdmaError::LengthExceedsBuffer {
                length,
                capacity: self.len,
            });
        }
        Ok(())
    }

    pub fn view(&self, view: RegionView) -> Result<&[u8]> {
        self.check_view(view)?;
        Ok(&self.as_slice()[view.offset..view.end()])
    }

    pub fn view_mut(&mut self, view: RegionView) -> Result<&mut [u8]> {
        self.check_view(view)?;
        Ok(&mut self.as_mut_slice()[view.offset..view.end()])
    }

    /// Copies `data` to `offset`.
    pub fn write_at(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        let view = RegionView::new(offset, data.len());
        self.view_mut(view)?.copy_from_slice(data);
        Ok(())
    }

    fn check_view(&self, view: RegionView) -> Result<()> {
        match view.offset.checked_add(view.len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(RdmaError::LengthExceedsBuffer {
                length: view.offset.saturating_add(view.len),
                capacity: self.len,
            }),
        }
    }
}

impl Drop for RegisteredBuffer {
    fn drop(&mut self) {
        // SAFETY: allocated by posix_memalign and freed exactly once.
        unsafe { libc::free(self.ptr.as_ptr() as *mut libc::c_void) };
    }
}

impl std::fmt::Debug for RegisteredBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredBuffer")
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("len", &self.len)
            .finish()
    }
}

/// An `(offset, len)` window into a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegionView {
    pub offset: usize,
    pub len: usize,
}

impl RegionView {
    pub const fn new(offset: usize, len: usize) -> Self {
        Self { offset, len }
    }

    pub const fn end(&self) -> usize {
        self.offset + self.len
    }

    pub fn overlaps(&self, other: &RegionView) -> bool {
        self.len > 0 && other.len > 0 && self.offset < other.end() && other.offset < self.end()
    }

    pub fn contains(&self, other: &RegionView) -> bool {
        other.offset >= self.offset && other.end() <= self.end()
    }

    /// The first `len` bytes of this view, if they fit.
    pub fn prefix(&self, len: usize) -> Option<RegionView> {
        (len <= self.len).then(|| RegionView::new(self.offset, len))
    }
}

/// The peer-side address and key of a one-sided operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteTarget {
    pub addr: u64,
    pub rkey: u32,
}

impl RemoteTarget {
    pub const fn new(addr: u64, rkey: u32) -> Self {
        Self { addr, rkey }
    }

    /// The same region shifted forward by `offset` bytes.
    pub fn at(&self, offset: u64) -> RemoteTarget {
        RemoteTarget {
            addr: self.addr.wrapping_add(offset),
            rkey: self.rkey,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_is_aligned_and_zeroed() {
        let buf = RegisteredBuffer::allocate(4096).unwrap();
        assert_eq!(buf.capacity(), 4096);
        assert_eq!(buf.addr() as usize % page_size(), 0);
        assert!(buf.as_slice().iter().all(|b| *b == 0));
    }

    #[test]
    fn test_allocate_zero_rejected() {
        assert!(matches!(
            RegisteredBuffer::allocate(0),
            Err(RdmaError::Resource { .. })
        ));
    }

    #[test]
    fn test_write_at_and_view() {
        let mut buf = RegisteredBuffer::allocate(64).unwrap();
        buf.write_at(10, b"hello").unwrap();
        assert_eq!(buf.view(RegionView::new(10, 5)).unwrap(), b"hello");
        assert!(matches!(
            buf.write_at(60, b"hello"),
            Err(RdmaError::LengthExceedsBuffer {
                length: 65,
                capacity: 64
            })
        ));
        assert!(buf.view(RegionView::new(usize::MAX, 2)).is_err());
    }

    #[test]
    fn test_check_len() {
        let buf = RegisteredBuffer::allocate(128).unwrap();
        assert!(buf.check_len(128).is_ok());
        assert!(buf.check_len(129).is_err());
    }

    #[test]
    fn test_region_view_overlap() {
        let a = RegionView::new(0, 2048);
        let b = RegionView::new(2048, 2048);
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&RegionView::new(2047, 1)));
        assert!(!a.overlaps(&RegionView::new(100, 0)));
        assert!(RegionView::new(0, 4096).contains(&b));
        assert_eq!(b.prefix(12), Some(RegionView::new(2048, 12)));
        assert_eq!(b.prefix(4096), None);
    }

    #[test]
    fn test_remote_target_at() {
        let target = RemoteTarget::new(0x1000, 7);
        let shifted = target.at(0x20);
        assert_eq!(shifted.addr, 0x1020);
        assert_eq!(shifted.rkey, 7);
    }
}
