//! Backing store for the code cache arena.

use core::ptr::NonNull;

/// A fixed-size, zero-initialised byte region that the host can execute.
///
/// The region is never writable and executable at once. It starts out read-write; callers flip
/// it with [`Self::make_executable`] and [`Self::make_writable`] around code emission.
///
/// On unix hosts the region is an anonymous `mmap` and the flips are `mprotect` calls. Other
/// hosts get a heap allocation: code can still be emitted and inspected but not run.
pub(crate) struct ExecBuffer {
    ptr: NonNull<u8>,
    len: usize,
    writable: bool,
}

impl ExecBuffer {
    #[cfg(unix)]
    pub(crate) fn new(len: usize) -> std::io::Result<Self> {
        // SAFETY: anonymous private mapping; no existing memory is aliased.
        let ptr = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error());
        }
        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| std::io::Error::other("mmap returned a null mapping"))?;
        Ok(Self {
            ptr,
            len,
            writable: true,
        })
    }

    #[cfg(not(unix))]
    pub(crate) fn new(len: usize) -> std::io::Result<Self> {
        let boxed: Box<[u8]> = vec![0u8; len].into_boxed_slice();
        let raw = Box::into_raw(boxed);
        let ptr = NonNull::new(raw.cast::<u8>())
            .ok_or_else(|| std::io::Error::other("allocation returned null"))?;
        Ok(Self {
            ptr,
            len,
            writable: true,
        })
    }

    pub(crate) fn is_writable(&self) -> bool {
        self.writable
    }

    /// Switch the region to read-write. No-op if it already is.
    pub(crate) fn make_writable(&mut self) -> std::io::Result<()> {
        if !self.writable {
            self.protect(true)?;
            self.writable = true;
        }
        Ok(())
    }

    /// Switch the region to read-execute. No-op if it already is.
    pub(crate) fn make_executable(&mut self) -> std::io::Result<()> {
        if self.writable {
            self.protect(false)?;
            self.writable = false;
        }
        Ok(())
    }

    #[cfg(unix)]
    fn protect(&mut self, writable: bool) -> std::io::Result<()> {
        let prot = if writable {
            libc::PROT_READ | libc::PROT_WRITE
        } else {
            libc::PROT_READ | libc::PROT_EXEC
        };
        // SAFETY: `ptr` is the page-aligned start of our own mapping of `len` bytes; the kernel
        // rounds the length up to whole pages, all of which belong to the mapping.
        let rc = unsafe { libc::mprotect(self.ptr.as_ptr().cast(), self.len, prot) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn protect(&mut self, _writable: bool) -> std::io::Result<()> {
        Ok(())
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn base_addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        // SAFETY: `ptr` is valid for `len` initialised bytes for the lifetime of `self`.
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        debug_assert!(self.writable, "write to the code arena while it is executable");
        // SAFETY: as above, and `&mut self` guarantees exclusive access from Rust.
        unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for ExecBuffer {
    #[cfg(unix)]
    fn drop(&mut self) {
        // SAFETY: the mapping was created by `new` with exactly this length.
        let rc = unsafe { libc::munmap(self.ptr.as_ptr().cast(), self.len) };
        if rc != 0 {
            tracing::warn!(
                error = %std::io::Error::last_os_error(),
                "munmap of code cache arena failed"
            );
        }
    }

    #[cfg(not(unix))]
    fn drop(&mut self) {
        let slice = core::ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.len);
        // SAFETY: the allocation came from `Box::into_raw` in `new` with this length.
        drop(unsafe { Box::from_raw(slice) });
    }
}

impl core::fmt::Debug for ExecBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ExecBuffer")
            .field("base", &format_args!("{:#x}", self.base_addr()))
            .field("len", &self.len)
            .field("writable", &self.writable)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_is_zeroed_and_writable() {
        let mut buf = ExecBuffer::new(8192).unwrap();
        assert_eq!(buf.len(), 8192);
        assert!(buf.as_slice().iter().all(|&b| b == 0));
        buf.as_mut_slice()[4095] = 0xC3;
        assert_eq!(buf.as_slice()[4095], 0xC3);
        assert_ne!(buf.base_addr(), 0);
    }

    #[test]
    fn protection_flips_between_write_and_execute() {
        let mut buf = ExecBuffer::new(8192).unwrap();
        assert!(buf.is_writable());
        buf.as_mut_slice()[0] = 0xC3;

        buf.make_executable().unwrap();
        assert!(!buf.is_writable());
        // Reads stay allowed.
        assert_eq!(buf.as_slice()[0], 0xC3);
        buf.make_executable().unwrap();

        buf.make_writable().unwrap();
        assert!(buf.is_writable());
        buf.as_mut_slice()[1] = 0x90;
        assert_eq!(buf.as_slice()[..2], [0xC3, 0x90]);
    }

    /// Permission string (`rw-`, `r-x`, ...) of the mapping containing `addr`.
    #[cfg(target_os = "linux")]
    fn mapped_perms(addr: usize) -> String {
        let maps = std::fs::read_to_string("/proc/self/maps").unwrap();
        for line in maps.lines() {
            let mut fields = line.split_whitespace();
            let (range, perms) = (fields.next().unwrap(), fields.next().unwrap());
            let (lo, hi) = range.split_once('-').unwrap();
            let lo = usize::from_str_radix(lo, 16).unwrap();
            let hi = usize::from_str_radix(hi, 16).unwrap();
            if (lo..hi).contains(&addr) {
                return perms[..3].to_owned();
            }
        }
        panic!("{addr:#x} is not mapped");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn mapping_is_never_writable_and_executable() {
        let mut buf = ExecBuffer::new(3 * 4096).unwrap();
        let last = buf.base_addr() + buf.len() - 1;
        assert_eq!(mapped_perms(buf.base_addr()), "rw-");

        buf.make_executable().unwrap();
        assert_eq!(mapped_perms(buf.base_addr()), "r-x");
        assert_eq!(mapped_perms(last), "r-x");

        buf.make_writable().unwrap();
        assert_eq!(mapped_perms(buf.base_addr()), "rw-");
        assert_eq!(mapped_perms(last), "rw-");
    }
}
