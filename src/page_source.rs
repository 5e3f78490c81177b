//! OS page acquisition/release and kernel reclamation hints (C1).
//!
//! Exposes exactly three operations: acquire one page-aligned, page-sized,
//! zero-initialized region from the OS; release one back; and advise the
//! kernel that a page is unused so its RSS may drop. `advise_unused` must
//! never be treated as fallible by callers — failures are counted (C8) and
//! otherwise ignored.

use crate::config::PAGE_SIZE;
use std::ptr::NonNull;

#[cfg(unix)]
mod unix {
    use super::PAGE_SIZE;
    use std::ptr::NonNull;

    pub fn acquire_page() -> Option<NonNull<u8>> {
        // The OS's native page size may be smaller than our configured
        // PAGE_SIZE, so mmap only guarantees the OS's own alignment.
        // Over-allocate and trim the leading/trailing waste to guarantee
        // PAGE_SIZE alignment.
        unsafe {
            let raw = libc::mmap(
                std::ptr::null_mut(),
                PAGE_SIZE * 2,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            if raw == libc::MAP_FAILED {
                return None;
            }

            let raw_addr = raw as usize;
            let aligned_addr = (raw_addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);

            let lead = aligned_addr - raw_addr;
            if lead > 0 {
                libc::munmap(raw_addr as *mut libc::c_void, lead);
            }
            let trail = (raw_addr + PAGE_SIZE * 2) - (aligned_addr + PAGE_SIZE);
            if trail > 0 {
                libc::munmap((aligned_addr + PAGE_SIZE) as *mut libc::c_void, trail);
            }

            NonNull::new(aligned_addr as *mut u8)
        }
    }

    /// # Safety
    /// `ptr` must have been returned by `acquire_page` and not already released.
    pub unsafe fn release_page(ptr: NonNull<u8>) {
        unsafe {
            libc::munmap(ptr.as_ptr() as *mut libc::c_void, PAGE_SIZE);
        }
    }

    /// # Safety
    /// `ptr` must refer to a live page returned by `acquire_page`.
    pub unsafe fn advise_unused(ptr: NonNull<u8>) -> bool {
        let rc = unsafe {
            libc::madvise(
                ptr.as_ptr() as *mut libc::c_void,
                PAGE_SIZE,
                libc::MADV_DONTNEED,
            )
        };
        rc == 0
    }
}

#[cfg(windows)]
mod windows {
    use super::PAGE_SIZE;
    use std::ptr::NonNull;
    use windows_sys::Win32::System::Memory::{
        VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE,
        PAGE_READWRITE,
    };

    pub fn acquire_page() -> Option<NonNull<u8>> {
        unsafe {
            let ptr = VirtualAlloc(
                std::ptr::null(),
                PAGE_SIZE,
                MEM_COMMIT | MEM_RESERVE,
                PAGE_READWRITE,
            );
            NonNull::new(ptr as *mut u8)
        }
    }

    /// # Safety
    /// `ptr` must have been returned by `acquire_page` and not already released.
    pub unsafe fn release_page(ptr: NonNull<u8>) {
        unsafe {
            VirtualFree(ptr.as_ptr() as *mut _, 0, MEM_RELEASE);
        }
    }

    /// # Safety
    /// `ptr` must refer to a live page returned by `acquire_page`.
    pub unsafe fn advise_unused(ptr: NonNull<u8>) -> bool {
        unsafe { VirtualFree(ptr.as_ptr() as *mut _, PAGE_SIZE, MEM_DECOMMIT) != 0 }
    }
}

/// Acquire one page-aligned, page-sized, zero-initialized region from the
/// OS. Returns `None` on OS-level allocation failure; the caller turns
/// that into [`crate::error::AllocError::OutOfMemory`].
#[inline]
pub fn acquire_page() -> Option<NonNull<u8>> {
    cfg_if::cfg_if! {
        if #[cfg(unix)] {
            unix::acquire_page()
        } else if #[cfg(windows)] {
            windows::acquire_page()
        } else {
            compile_error!("unsupported platform: no page source implementation");
        }
    }
}

/// Return a page previously returned by [`acquire_page`] to the OS.
///
/// # Safety
/// `ptr` must have been returned by `acquire_page` and not already released.
#[inline]
pub unsafe fn release_page(ptr: NonNull<u8>) {
    cfg_if::cfg_if! {
        if #[cfg(unix)] {
            unsafe { unix::release_page(ptr) }
        } else if #[cfg(windows)] {
            unsafe { windows::release_page(ptr) }
        }
    }
}

/// Hint to the kernel that `ptr`'s page is unused and its RSS may drop.
/// Must succeed silently on systems lacking the capability: callers count
/// failures (C8) but never treat them as errors.
///
/// # Safety
/// `ptr` must refer to a live page returned by `acquire_page`.
#[inline]
pub unsafe fn advise_unused(ptr: NonNull<u8>) -> bool {
    cfg_if::cfg_if! {
        if #[cfg(unix)] {
            unsafe { unix::advise_unused(ptr) }
        } else if #[cfg(windows)] {
            unsafe { windows::advise_unused(ptr) }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_is_page_aligned_and_zeroed() {
        let ptr = acquire_page().expect("acquire_page should succeed");
        assert_eq!(ptr.as_ptr() as usize % PAGE_SIZE, 0);
        unsafe {
            for i in 0..PAGE_SIZE {
                assert_eq!(*ptr.as_ptr().add(i), 0);
            }
            for i in 0..PAGE_SIZE {
                *ptr.as_ptr().add(i) = (i & 0xFF) as u8;
            }
            for i in 0..PAGE_SIZE {
                assert_eq!(*ptr.as_ptr().add(i), (i & 0xFF) as u8);
            }
            release_page(ptr);
        }
    }

    #[test]
    fn advise_unused_does_not_panic() {
        let ptr = acquire_page().expect("acquire_page should succeed");
        unsafe {
            let _ = advise_unused(ptr);
            release_page(ptr);
        }
    }
}
