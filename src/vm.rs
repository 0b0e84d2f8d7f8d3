use std::fmt;

use crate::common::PageRange;

/// Errors surfaced by the injected memory-modification operations.
#[derive(Debug)]
pub enum VmError {
    CommitFailed(std::io::Error),
    DecommitFailed(std::io::Error),
    InitializationFailed(String),
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::CommitFailed(e) => write!(f, "VM commit failed: {e}"),
            VmError::DecommitFailed(e) => write!(f, "VM decommit failed: {e}"),
            VmError::InitializationFailed(msg) => write!(f, "VM initialization failed: {msg}"),
        }
    }
}

impl std::error::Error for VmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VmError::CommitFailed(e) | VmError::DecommitFailed(e) => Some(e),
            VmError::InitializationFailed(_) => None,
        }
    }
}

/// A single injected "modify this page range" capability.
///
/// The filler consumes two instances: an *unbacker* (discard the physical
/// pages behind a free range) and a *backer* (re-back a previously
/// discarded range before it is handed out again). Either may fail;
/// failure means the range is unchanged and the operation may be retried
/// later. The filler never issues overlapping or concurrent calls; every
/// entry point runs under the caller's page-heap lock.
///
/// The call may block on an OS syscall while that lock is held; that is
/// the caller's trade-off, not this crate's.
pub trait MemoryModify {
    /// Attempt the modification.
    ///
    /// # Errors
    ///
    /// Returns `VmError` when the OS rejects the request. No pages change
    /// state on error.
    fn modify(&mut self, r: PageRange) -> Result<(), VmError>;
}

impl<F> MemoryModify for F
where
    F: FnMut(PageRange) -> Result<(), VmError>,
{
    fn modify(&mut self, r: PageRange) -> Result<(), VmError> {
        self(r)
    }
}

#[cfg(unix)]
pub use self::unix::{SystemBack, SystemUnback};

#[cfg(unix)]
mod unix {
    use super::{MemoryModify, PageRange, VmError};
    use crate::common::PAGE_SHIFT;
    use std::io;

    /// Production unbacker: returns the physical pages behind a range to
    /// the OS while keeping the address range reserved.
    ///
    /// `MADV_FREE` marks the pages for lazy reclamation (the cheapest
    /// discard on Linux >= 4.5 and macOS), then `mprotect(PROT_NONE)`
    /// removes access so stale reads fault instead of observing old data.
    pub struct SystemUnback {
        base: *mut u8,
    }

    // Safety: holds only an address; all accesses go through the kernel.
    unsafe impl Send for SystemUnback {}

    impl SystemUnback {
        /// `base` is the address of page id zero. Every range passed to
        /// [`MemoryModify::modify`] must lie within a mapping owned by the
        /// caller.
        #[must_use]
        pub fn new(base: *mut u8) -> Self {
            Self { base }
        }

        fn addr(&self, r: PageRange) -> *mut libc::c_void {
            // Safety: caller guarantees the range lies within its mapping.
            unsafe { self.base.add(r.first.0 << PAGE_SHIFT).cast() }
        }
    }

    impl MemoryModify for SystemUnback {
        fn modify(&mut self, r: PageRange) -> Result<(), VmError> {
            let addr = self.addr(r);
            let len = r.in_bytes();
            // Safety: FFI call to madvise on a caller-owned range.
            if unsafe { libc::madvise(addr, len, libc::MADV_FREE) } != 0 {
                let err = io::Error::last_os_error();
                log::warn!("madvise(MADV_FREE) failed for {} pages at {:?}: {err}", r.len, addr);
                return Err(VmError::DecommitFailed(err));
            }
            // Safety: FFI call to mprotect on the same range.
            if unsafe { libc::mprotect(addr, len, libc::PROT_NONE) } != 0 {
                let err = io::Error::last_os_error();
                log::warn!("mprotect(PROT_NONE) failed for {} pages at {:?}: {err}", r.len, addr);
                return Err(VmError::DecommitFailed(err));
            }
            Ok(())
        }
    }

    /// Production backer: restores access to a previously unbacked range
    /// and asks for immediate physical backing to avoid a burst of minor
    /// faults when the pages are handed out.
    pub struct SystemBack {
        base: *mut u8,
    }

    // Safety: holds only an address; all accesses go through the kernel.
    unsafe impl Send for SystemBack {}

    impl SystemBack {
        #[must_use]
        pub fn new(base: *mut u8) -> Self {
            Self { base }
        }

        fn addr(&self, r: PageRange) -> *mut libc::c_void {
            // Safety: caller guarantees the range lies within its mapping.
            unsafe { self.base.add(r.first.0 << PAGE_SHIFT).cast() }
        }
    }

    impl MemoryModify for SystemBack {
        fn modify(&mut self, r: PageRange) -> Result<(), VmError> {
            let addr = self.addr(r);
            let len = r.in_bytes();
            // Safety: FFI call to mprotect on a caller-owned range.
            if unsafe { libc::mprotect(addr, len, libc::PROT_READ | libc::PROT_WRITE) } != 0 {
                let err = io::Error::last_os_error();
                log::warn!("mprotect(RW) failed for {} pages at {:?}: {err}", r.len, addr);
                return Err(VmError::CommitFailed(err));
            }
            #[cfg(target_os = "linux")]
            {
                // Best effort; failure to prefault is not an error.
                // Safety: FFI call to madvise on the same range.
                unsafe { libc::madvise(addr, len, libc::MADV_WILLNEED) };
            }
            Ok(())
        }
    }
}
