use std::ffi::CString;

use rustix::fd::{AsFd, OwnedFd};
use rustix::fs::{ftruncate, Mode};
use rustix::io::Errno;
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use rustix::shm::{shm_open, shm_unlink};
use vasi::VirtualAddressSpaceIndependent;

use crate::error::ShmemError;

/// A named POSIX shared-memory mapping of a raw `T`, with no locking or
/// initialization handshake of its own. `T` must be self-synchronizing
/// (atomics, futex-based channels) and must tolerate a freshly
/// `ftruncate`-zeroed bit pattern as a valid initial value.
///
/// [`crate::Segment`] is built on top of this for the common case (a `T`
/// guarded by one coarse-grained spinlock); this lower-level primitive
/// exists for registries that need their own fine-grained synchronization
/// instead, such as the helper-thread inbox registry.
pub struct RawMapping<T> {
    ptr: *mut T,
    len: usize,
    name: CString,
    // Kept alive for the lifetime of the mapping; never read directly.
    _fd: OwnedFd,
}

// SAFETY: access to the mapped `T` only ever happens through shared
// references handed out by `get`, so this is Send/Sync whenever `T` is.
unsafe impl<T> Send for RawMapping<T> where T: Send {}
unsafe impl<T> Sync for RawMapping<T> where T: Send + Sync {}

impl<T> RawMapping<T>
where
    T: VirtualAddressSpaceIndependent + Send,
{
    /// Opens (creating if absent) the named shm object and maps it as a `T`.
    /// Returns whether this call created the object, so callers can run
    /// their own one-shot initialization only on the creating path.
    pub fn open(name: &str, key: &str) -> Result<(Self, bool), ShmemError> {
        let shm_name =
            CString::new(format!("/dlb_{name}_{key}")).map_err(|_| ShmemError::InvalidName)?;
        let size = std::mem::size_of::<T>();

        let (fd, created) = match shm_open(
            shm_name.as_c_str(),
            rustix::fs::OFlags::CREATE | rustix::fs::OFlags::EXCL | rustix::fs::OFlags::RDWR,
            Mode::RUSR | Mode::WUSR,
        ) {
            Ok(fd) => (fd, true),
            Err(Errno::EXIST) => {
                let fd = shm_open(
                    shm_name.as_c_str(),
                    rustix::fs::OFlags::RDWR,
                    Mode::empty(),
                )
                .map_err(ShmemError::Open)?;
                (fd, false)
            }
            Err(e) => return Err(ShmemError::Open(e)),
        };

        if created {
            ftruncate(&fd, size as u64).map_err(ShmemError::Truncate)?;
        }

        // SAFETY: `fd` refers to a shm object at least `size` bytes long
        // (just created and truncated, or pre-existing with the same
        // layout); the mapping is kept alive for the lifetime of `RawMapping`.
        let addr = unsafe {
            mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                fd.as_fd(),
                0,
            )
        }
        .map_err(ShmemError::Mmap)?;

        log::debug!("mapped raw shmem segment {shm_name:?} (created={created})");

        Ok((
            Self {
                ptr: addr as *mut T,
                len: size,
                name: shm_name,
                _fd: fd,
            },
            created,
        ))
    }

    pub fn name(&self) -> &CString {
        &self.name
    }

    pub fn get(&self) -> &T {
        // SAFETY: the mapping covers `size_of::<T>()` bytes and was either
        // freshly zeroed or already initialized by a prior opener; `T`'s own
        // contract guarantees the zeroed pattern is valid.
        unsafe { &*self.ptr }
    }

    pub fn close(self, delete: bool) -> Result<(), ShmemError> {
        let name = self.name.clone();
        // SAFETY: `self.ptr`/`self.len` describe the mapping created in `open`.
        let result = unsafe { munmap(self.ptr as *mut _, self.len) };
        std::mem::forget(self);
        result.map_err(ShmemError::Munmap)?;
        if delete {
            shm_unlink(name.as_c_str()).map_err(ShmemError::Unlink)?;
            log::debug!("unlinked raw shmem segment {name:?}");
        }
        Ok(())
    }
}

impl<T> Drop for RawMapping<T> {
    fn drop(&mut self) {
        // Best-effort: `close` is the controlled teardown path; this just
        // avoids leaking the mapping if dropped directly.
        // SAFETY: see `close`.
        let _ = unsafe { munmap(self.ptr as *mut _, self.len) };
    }
}
