//! Address-space reservations.
//!
//! A reservation is a large anonymous private mapping taken with no backing
//! commitment (`PROT_NONE` / `MEM_RESERVE`); individual pages are committed
//! read/write when a heap claims them and decommitted when released. Commit
//! failure on the acquire path is fatal; decommit failure is a RAM leak and
//! only logged.

#[cfg(unix)]
mod imp {
    use std::ptr::null_mut;

    pub struct Mmap {
        start: *mut u8,
        size: usize,
    }

    impl Mmap {
        /// Reserve `size` bytes of address space with no access rights.
        /// Returns None when the address space is exhausted.
        pub fn reserve(size: usize) -> Option<Self> {
            unsafe {
                let map = libc::mmap(
                    null_mut(),
                    size as _,
                    libc::PROT_NONE,
                    libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_NORESERVE,
                    -1,
                    0,
                );
                if map == libc::MAP_FAILED {
                    log::error!("mmap({} bytes) failed: {}", size, errno::errno());
                    return None;
                }
                Some(Self {
                    start: map as *mut u8,
                    size,
                })
            }
        }

        pub fn start(&self) -> *mut u8 {
            self.start
        }

        pub const fn size(&self) -> usize {
            self.size
        }

        /// Map a range read/write. The allocator cannot make progress
        /// without it, so failure aborts.
        pub fn commit(&self, at: *mut u8, len: usize) {
            unsafe {
                if libc::mprotect(at as *mut _, len as _, libc::PROT_READ | libc::PROT_WRITE) != 0 {
                    log::error!("mprotect(rw) of {} bytes at {:p} failed: {}", len, at, errno::errno());
                    std::process::abort();
                }
            }
        }

        /// Drop access and return physical memory to the OS.
        pub fn decommit(&self, at: *mut u8, len: usize) {
            unsafe {
                if libc::mprotect(at as *mut _, len as _, libc::PROT_NONE) != 0 {
                    log::warn!("mprotect(none) at {:p} failed: {}; leaking RAM", at, errno::errno());
                    return;
                }
                if libc::madvise(at as *mut _, len as _, libc::MADV_DONTNEED) != 0 {
                    log::warn!("madvise(dontneed) at {:p} failed: {}", at, errno::errno());
                }
            }
        }
    }

    impl Drop for Mmap {
        fn drop(&mut self) {
            unsafe {
                libc::munmap(self.start as *mut _, self.size as _);
            }
        }
    }
}

#[cfg(windows)]
mod imp {
    use std::ptr::null_mut;
    use winapi::um::memoryapi::{VirtualAlloc, VirtualFree};
    use winapi::um::winnt::{MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_NOACCESS, PAGE_READWRITE};

    pub struct Mmap {
        start: *mut u8,
        size: usize,
    }

    impl Mmap {
        pub fn reserve(size: usize) -> Option<Self> {
            unsafe {
                let mem = VirtualAlloc(null_mut(), size, MEM_RESERVE, PAGE_NOACCESS);
                if mem.is_null() {
                    log::error!("VirtualAlloc reserve of {} bytes failed", size);
                    return None;
                }
                Some(Self {
                    start: mem as *mut u8,
                    size,
                })
            }
        }

        pub fn start(&self) -> *mut u8 {
            self.start
        }

        pub const fn size(&self) -> usize {
            self.size
        }

        pub fn commit(&self, at: *mut u8, len: usize) {
            unsafe {
                if VirtualAlloc(at.cast(), len, MEM_COMMIT, PAGE_READWRITE).is_null() {
                    log::error!("VirtualAlloc commit of {} bytes at {:p} failed", len, at);
                    std::process::abort();
                }
            }
        }

        pub fn decommit(&self, at: *mut u8, len: usize) {
            unsafe {
                if VirtualFree(at.cast(), len, MEM_DECOMMIT) == 0 {
                    log::warn!("VirtualFree decommit at {:p} failed; leaking RAM", at);
                }
            }
        }
    }

    impl Drop for Mmap {
        fn drop(&mut self) {
            unsafe {
                VirtualFree(self.start.cast(), 0, MEM_RELEASE);
            }
        }
    }
}

pub use imp::Mmap;

unsafe impl Send for Mmap {}
unsafe impl Sync for Mmap {}
