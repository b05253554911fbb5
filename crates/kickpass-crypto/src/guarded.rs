//! Guarded memory for cached secrets
//!
//! A `GuardedBuf` owns a private anonymous mapping rounded up to whole
//! pages. The mapping is `mlock`ed so it never reaches swap and, on Linux,
//! excluded from core dumps. Both are best effort: an unprivileged process
//! may run out of lockable memory, in which case the buffer still works and
//! `is_locked()` reports false. The contents are zeroed before unmapping.
//!
//! The only way to put bytes into a buffer is at allocation time, so a
//! buffer handed out is effectively read-only.

use std::fmt;
use std::ptr::{self, NonNull};

use thiserror::Error;
use tracing::debug;
use zeroize::Zeroize;

#[derive(Error, Debug)]
pub enum GuardedError {
    #[error("guarded allocation of {0} bytes failed")]
    AllocationFailed(usize),

    #[error("secret of {len} bytes exceeds buffer capacity of {max}")]
    TooLarge { len: usize, max: usize },
}

pub struct GuardedBuf {
    ptr: NonNull<u8>,
    capacity: usize,
    max_len: usize,
    len: usize,
    locked: bool,
}

// Safety: the buffer exclusively owns its mapping and exposes only shared reads
unsafe impl Send for GuardedBuf {}
unsafe impl Sync for GuardedBuf {}

fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as usize
    }
}

impl GuardedBuf {
    /// Allocate a buffer able to hold `max_len` bytes and copy `data` into it
    pub fn new(max_len: usize, data: &[u8]) -> Result<Self, GuardedError> {
        if data.len() > max_len {
            return Err(GuardedError::TooLarge {
                len: data.len(),
                max: max_len,
            });
        }

        let page = page_size();
        let capacity = max_len.max(1).div_ceil(page) * page;

        let raw = unsafe {
            libc::mmap(
                ptr::null_mut(),
                capacity,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return Err(GuardedError::AllocationFailed(capacity));
        }
        let ptr = NonNull::new(raw as *mut u8).ok_or(GuardedError::AllocationFailed(capacity))?;

        let locked = unsafe { libc::mlock(raw as *const _, capacity) } == 0;
        if !locked {
            debug!(capacity, "mlock failed, guarded buffer may be swapped");
        }

        #[cfg(target_os = "linux")]
        unsafe {
            libc::madvise(raw, capacity, libc::MADV_DONTDUMP);
        }

        unsafe { ptr::copy_nonoverlapping(data.as_ptr(), ptr.as_ptr(), data.len()) };

        Ok(Self {
            ptr,
            capacity,
            max_len,
            len: data.len(),
            locked,
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Largest secret this buffer was sized for
    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// Whether mlock succeeded
    pub fn is_locked(&self) -> bool {
        self.locked
    }
}

impl Drop for GuardedBuf {
    fn drop(&mut self) {
        unsafe {
            std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.capacity).zeroize();
            if self.locked {
                libc::munlock(self.ptr.as_ptr() as *const _, self.capacity);
            }
            libc::munmap(self.ptr.as_ptr() as *mut _, self.capacity);
        }
        self.len = 0;
    }
}

impl fmt::Debug for GuardedBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuardedBuf")
            .field("len", &self.len)
            .field("max_len", &self.max_len)
            .field("locked", &self.locked)
            .finish_non_exhaustive()
    }
}
