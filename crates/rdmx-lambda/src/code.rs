//! Code on both ends: the bytes a client ships and the executable mapping a
//! server runs them from.

use std::io;
use std::path::Path;
use std::ptr::NonNull;

use tracing::debug;

use crate::error::{LambdaError, Result};

/// Position-independent machine code plus the metadata sent with it.
///
/// The transmitted length is exactly `bytes.len()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LambdaCode {
    pub function_name: String,
    pub bytes: Vec<u8>,
    pub entry_offset: u64,
}

impl LambdaCode {
    pub fn new(function_name: impl Into<String>, bytes: Vec<u8>, entry_offset: u64) -> Self {
        Self {
            function_name: function_name.into(),
            bytes,
            entry_offset,
        }
    }

    /// Loads a flat binary (for example `objcopy -O binary -j .text`).
    pub fn from_file(
        path: impl AsRef<Path>,
        function_name: impl Into<String>,
        entry_offset: u64,
    ) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|source| LambdaError::CodeLoad {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::new(function_name, bytes, entry_offset))
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Checks the same bounds the server enforces.
    pub fn validate(&self, max_code_size: usize) -> Result<()> {
        if self.bytes.is_empty() {
            return Err(LambdaError::EmptyCode);
        }
        if self.bytes.len() > max_code_size {
            return Err(LambdaError::CodeTooLarge {
                size: self.bytes.len(),
                max: max_code_size,
            });
        }
        if self.entry_offset >= self.bytes.len() as u64 {
            return Err(LambdaError::EntryOutOfRange {
                entry_offset: self.entry_offset,
                code_size: self.bytes.len(),
            });
        }
        Ok(())
    }
}

fn region_err(op: &'static str) -> impl FnOnce(io::Error) -> LambdaError {
    move |source| LambdaError::CodeRegion { op, source }
}

/// A private anonymous mapping that is either writable or executable,
/// never both.
pub struct CodeRegion {
    ptr: NonNull<u8>,
    map_len: usize,
    capacity: usize,
    loaded: usize,
    executable: bool,
}

// SAFETY: the mapping is uniquely owned.
unsafe impl Send for CodeRegion {}

impl CodeRegion {
    /// Maps `capacity` bytes read-write.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(LambdaError::CodeRegion {
                op: "mmap",
                source: io::Error::new(io::ErrorKind::InvalidInput, "zero-length code region"),
            });
        }
        // SAFETY: sysconf has no preconditions.
        let page = match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
            n if n > 0 => n as usize,
            _ => 4096,
        };
        let map_len = capacity.div_ceil(page) * page;
        // SAFETY: anonymous private mapping with no address hint.
        let raw = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return Err(region_err("mmap")(io::Error::last_os_error()));
        }
        let ptr = NonNull::new(raw as *mut u8)
            .ok_or_else(|| region_err("mmap")(io::Error::from(io::ErrorKind::OutOfMemory)))?;
        debug!(capacity, map_len, addr = ?ptr, "mapped code region");
        Ok(Self {
            ptr,
            map_len,
            capacity,
            loaded: 0,
            executable: false,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes loaded by the last complete load.
    pub fn loaded_len(&self) -> usize {
        self.loaded
    }

    pub fn is_executable(&self) -> bool {
        self.executable
    }

    fn protect(&mut self, prot: libc::c_int) -> Result<()> {
        // SAFETY: the range is exactly our mapping.
        let ret = unsafe { libc::mprotect(self.ptr.as_ptr() as *mut libc::c_void, self.map_len, prot) };
        if ret != 0 {
            return Err(region_err("mprotect")(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Makes the region writable and forgets the previous code.
    pub fn begin_load(&mut self) -> Result<()> {
        if self.executable {
            self.protect(libc::PROT_READ | libc::PROT_WRITE)?;
            self.executable = false;
        }
        self.loaded = 0;
        Ok(())
    }

    /// Copies `bytes` to `offset` during a load.
    pub fn write_at(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        let end = offset.checked_add(bytes.len()).filter(|&e| e <= self.capacity);
        match end {
            Some(_) if !self.executable => {
                // SAFETY: bounds checked above; the mapping is writable.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        bytes.as_ptr(),
                        self.ptr.as_ptr().add(offset),
                        bytes.len(),
                    )
                };
                Ok(())
            }
            Some(_) => Err(LambdaError::CodeRegion {
                op: "write",
                source: io::Error::new(io::ErrorKind::PermissionDenied, "region is sealed"),
            }),
            None => Err(LambdaError::CodeTooLarge {
                size: offset.saturating_add(bytes.len()),
                max: self.capacity,
            }),
        }
    }

    /// Flips the region to read+execute with `len` bytes of code.
    pub fn seal(&mut self, len: usize) -> Result<()> {
        if len == 0 || len > self.capacity {
            return Err(LambdaError::CodeTooLarge {
                size: len,
                max: self.capacity,
            });
        }
        self.protect(libc::PROT_READ | libc::PROT_EXEC)?;
        self.executable = true;
        self.loaded = len;
        Ok(())
    }

    /// `begin_load` + `write_at(0, ..)` + `seal`.
    pub fn load(&mut self, code: &[u8]) -> Result<()> {
        self.begin_load()?;
        self.write_at(0, code)?;
        self.seal(code.len())
    }

    /// The loaded code, readable in either state.
    pub fn code(&self) -> &[u8] {
        // SAFETY: `loaded` bytes are inside the mapping, which is always readable.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.loaded) }
    }

    /// Address of `offset` inside sealed code.
    pub fn entry_point(&self, offset: u64) -> Option<*const u8> {
        let offset = usize::try_from(offset).ok()?;
        (self.executable && offset < self.loaded)
            // SAFETY: offset is inside the loaded code.
            .then(|| unsafe { self.ptr.as_ptr().add(offset) as *const u8 })
    }
}

impl Drop for CodeRegion {
    fn drop(&mut self) {
        // SAFETY: unmapping the region mapped in `new`.
        unsafe { libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.map_len) };
    }
}

impl std::fmt::Debug for CodeRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeRegion")
            .field("addr", &self.ptr)
            .field("capacity", &self.capacity)
            .field("loaded", &self.loaded)
            .field("executable", &self.executable)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_seals_and_exposes_entry() {
        let mut region = CodeRegion::new(100).unwrap();
        assert!(region.entry_point(0).is_none());
        region.load(&[0xc3; 10]).unwrap();
        assert!(region.is_executable());
        assert_eq!(region.loaded_len(), 10);
        assert_eq!(region.code(), &[0xc3; 10]);
        assert!(region.entry_point(9).is_some());
        assert!(region.entry_point(10).is_none());
    }

    #[test]
    fn test_sealed_region_rejects_writes_until_reloaded() {
        let mut region = CodeRegion::new(64).unwrap();
        region.load(b"abcd").unwrap();
        assert!(matches!(
            region.write_at(0, b"x"),
            Err(LambdaError::CodeRegion { op: "write", .. })
        ));
        region.begin_load().unwrap();
        assert!(!region.is_executable());
        assert!(region.entry_point(0).is_none());
        region.write_at(0, b"wx").unwrap();
        region.write_at(2, b"yz").unwrap();
        region.seal(4).unwrap();
        assert_eq!(region.code(), b"wxyz");
    }

    #[test]
    fn test_bounds() {
        let mut region = CodeRegion::new(8).unwrap();
        assert!(matches!(
            region.write_at(4, &[0; 5]),
            Err(LambdaError::CodeTooLarge { size: 9, max: 8 })
        ));
        assert!(region.seal(0).is_err());
        assert!(region.seal(9).is_err());
        assert!(CodeRegion::new(0).is_err());
    }

    #[test]
    fn test_code_validation() {
        let code = LambdaCode::new("f", vec![0x90; 16], 15);
        code.validate(16).unwrap();
        assert!(matches!(
            code.validate(15),
            Err(LambdaError::CodeTooLarge { size: 16, max: 15 })
        ));
        assert!(matches!(
            LambdaCode::new("f", vec![0x90; 16], 16).validate(64),
            Err(LambdaError::EntryOutOfRange { .. })
        ));
        assert!(matches!(
            LambdaCode::new("f", Vec::new(), 0).validate(64),
            Err(LambdaError::EmptyCode)
        ));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        std::fs::write(&path, [1u8, 2, 3]).unwrap();
        let code = LambdaCode::from_file(&path, "f", 1).unwrap();
        assert_eq!(code.bytes, vec![1, 2, 3]);
        assert_eq!(code.len(), 3);

        let err = LambdaCode::from_file(dir.path().join("missing"), "f", 0).unwrap_err();
        assert!(matches!(err, LambdaError::CodeLoad { .. }));
    }
}
