//! The per-vCPU `kvm_run` mapping.

use std::io;
use std::mem;
use std::os::fd::AsRawFd;
use std::ptr::{self, NonNull};

use kvm_bindings::kvm_run;
use kvm_ioctls::Kvm;
use log::{debug, warn};

use crate::{Error, Result, PAGE_SIZE};

/// Size of the run data region for vCPUs of `kvm` (`KVM_GET_VCPU_MMAP_SIZE`).
///
/// Fixed for the lifetime of the host kernel, so callers query it once and
/// pass it to every [`RunData::map`].
pub fn run_data_size(kvm: &Kvm) -> Result<usize> {
    let size = kvm.get_vcpu_mmap_size().map_err(Error::GetVcpuMmapSize)?;
    check_size(size)?;
    Ok(size)
}

fn check_size(size: usize) -> Result<()> {
    if size == 0 || size % PAGE_SIZE != 0 || size < mem::size_of::<kvm_run>() {
        return Err(Error::InvalidRunDataSize(size));
    }
    Ok(())
}

/// Shared mapping of a vCPU's run data, written by the kernel on every
/// `KVM_RUN` exit.
///
/// Owned by exactly one vCPU. [`unmap`](Self::unmap) consumes the region;
/// dropping it unmaps as well.
#[derive(Debug)]
pub struct RunData {
    ptr: NonNull<kvm_run>,
    len: usize,
}

// SAFETY: the pointer refers to a process-wide shared mapping that lives
// until `unmap`/`drop`. Access to the contents is gated by `unsafe fn get`,
// whose callers must serialize with the thread issuing `KVM_RUN`.
unsafe impl Send for RunData {}
// SAFETY: see above.
unsafe impl Sync for RunData {}

impl RunData {
    /// Maps `size` bytes of `fd` at offset 0, read/write and shared, at an
    /// address chosen by the kernel.
    pub fn map(fd: &impl AsRawFd, size: usize) -> Result<Self> {
        check_size(size)?;

        // SAFETY: a null hint lets the kernel choose the address; the fd is
        // only borrowed for the call and the kernel validates it.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Error::MapRunData(io::Error::last_os_error()));
        }
        let ptr = NonNull::new(ptr.cast::<kvm_run>())
            .ok_or_else(|| Error::MapRunData(io::Error::from_raw_os_error(libc::EFAULT)))?;

        debug!(
            "mapped run data: fd={}, addr={:p}, size={:#x}",
            fd.as_raw_fd(),
            ptr,
            size
        );
        Ok(Self { ptr, len: size })
    }

    /// Releases the mapping. The region is gone afterwards even on error.
    pub fn unmap(self) -> Result<()> {
        let this = mem::ManuallyDrop::new(self);
        this.munmap()
    }

    fn munmap(&self) -> Result<()> {
        // SAFETY: `ptr`/`len` describe a mapping created by `map`, and this
        // is reached at most once per region (`unmap` suppresses `drop`).
        let ret = unsafe { libc::munmap(self.ptr.as_ptr().cast(), self.len) };
        if ret != 0 {
            return Err(Error::UnmapRunData(io::Error::last_os_error()));
        }
        debug!("unmapped run data: addr={:p}", self.ptr);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *mut kvm_run {
        self.ptr.as_ptr()
    }

    /// Shared view of the run data.
    ///
    /// # Safety
    /// The owning vCPU must not be inside `KVM_RUN`: the kernel writes the
    /// structure during entry and exit.
    pub unsafe fn get(&self) -> &kvm_run {
        self.ptr.as_ref()
    }

    /// Sets `immediate_exit`, making the next (or an about to start)
    /// `KVM_RUN` return with `EINTR`.
    ///
    /// A single volatile byte store; safe from a signal handler.
    pub fn set_immediate_exit(&self, exit: bool) {
        // SAFETY: the mapping is live and at least `size_of::<kvm_run>()`
        // bytes long; the field is a byte, so the store cannot tear.
        unsafe {
            ptr::addr_of_mut!((*self.ptr.as_ptr()).immediate_exit).write_volatile(exit as u8);
        }
    }
}

impl Drop for RunData {
    fn drop(&mut self) {
        if let Err(err) = self.munmap() {
            warn!("dropping run data at {:p}: {}", self.ptr, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::os::fd::{FromRawFd, RawFd};

    struct BadFd;

    impl AsRawFd for BadFd {
        fn as_raw_fd(&self) -> RawFd {
            -1
        }
    }

    fn region_size() -> usize {
        mem::size_of::<kvm_run>().next_multiple_of(PAGE_SIZE)
    }

    /// A memfd standing in for a vCPU fd.
    fn backing(size: usize) -> File {
        // SAFETY: name is NUL terminated; the returned fd is owned by `File`.
        let file = unsafe {
            let fd = libc::memfd_create(b"run-data\0".as_ptr().cast(), libc::MFD_CLOEXEC);
            assert!(fd >= 0, "memfd_create: {}", io::Error::last_os_error());
            File::from_raw_fd(fd)
        };
        file.set_len(size as u64).unwrap();
        file
    }

    #[test]
    fn test_map_and_unmap() {
        let size = region_size();
        let file = backing(size);

        let run_data = RunData::map(&file, size).unwrap();
        assert_eq!(run_data.len(), size);
        assert!(!run_data.as_ptr().is_null());
        assert_eq!(run_data.as_ptr() as usize % PAGE_SIZE, 0);

        run_data.unmap().unwrap();
    }

    #[test]
    fn test_map_invalid_fd() {
        let err = RunData::map(&BadFd, region_size()).unwrap_err();
        match err {
            Error::MapRunData(io) => assert_eq!(io.raw_os_error(), Some(libc::EBADF)),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_map_rejects_bad_sizes() {
        let file = backing(region_size());
        for size in [0, PAGE_SIZE + 1, PAGE_SIZE / 2] {
            assert!(matches!(
                RunData::map(&file, size),
                Err(Error::InvalidRunDataSize(s)) if s == size
            ));
        }
    }

    #[test]
    fn test_mapping_is_shared() {
        let size = region_size();
        let file = backing(size);
        let first = RunData::map(&file, size).unwrap();
        let second = RunData::map(&file, size).unwrap();

        first.set_immediate_exit(true);
        // SAFETY: no vCPU is running against a memfd.
        assert_eq!(unsafe { second.get() }.immediate_exit, 1);
        first.set_immediate_exit(false);
        assert_eq!(unsafe { second.get() }.immediate_exit, 0);

        first.unmap().unwrap();
        drop(second);
    }
}
