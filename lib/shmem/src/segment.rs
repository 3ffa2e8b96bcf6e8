use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use pod::Pod;
use vasi::VirtualAddressSpaceIndependent;
use vasi_sync::scmutex::{SelfContainedMutex, SelfContainedMutexGuard};

use crate::error::ShmemError;
use crate::raw_mapping::RawMapping;

const MAGIC: u32 = 0x444c_4231; // "DLB1"

const STATE_UNINIT: u32 = 0;
const STATE_INITIALIZING: u32 = 1;
const STATE_INITIALIZED: u32 = 2;

/// Bound on the open handshake: if the segment doesn't reach
/// `STATE_INITIALIZED` within this window, the registry is presumed
/// corrupted and `open` fails with [`ShmemError::Timeout`].
const OPEN_TIMEOUT: Duration = Duration::from_secs(1);

#[repr(C)]
struct Header<T> {
    magic: AtomicU32,
    version: AtomicU32,
    init_state: AtomicU32,
    initial_time_ns: AtomicU64,
    mutex: SelfContainedMutex<T>,
}

// SAFETY: every field is either a plain atomic machine word (no pointers, C
// layout) or a `SelfContainedMutex<T>`, which is VASI whenever `T` is.
unsafe impl<T> VirtualAddressSpaceIndependent for Header<T> where T: VirtualAddressSpaceIndependent {}

/// A named POSIX shared-memory segment holding a `T` behind a process-shared
/// spinlock, with a one-shot creation/attach handshake.
///
/// `T` must be [`Pod`] so that the segment returned by the kernel for a
/// freshly created file — guaranteed zero-filled by `ftruncate` — is already
/// a valid `Header<T>` without any placement-new step.
pub struct Segment<T> {
    mapping: RawMapping<Header<T>>,
}

impl<T> Segment<T>
where
    T: Pod + VirtualAddressSpaceIndependent + Send,
{
    /// Creates the named region if absent, else attaches to it, performing
    /// the one-shot initialization handshake. `name` and `key` are combined
    /// into the POSIX shm object name (`--shm-key` disambiguates segments
    /// for different DLB runs sharing a node).
    pub fn open(name: &str, key: &str) -> Result<Self, ShmemError> {
        let (mapping, created) = RawMapping::open(name, key)?;
        let segment = Segment { mapping };

        if created {
            segment.initialize()?;
        } else {
            segment.await_initialized()?;
        }

        Ok(segment)
    }

    fn header(&self) -> &Header<T> {
        self.mapping.get()
    }

    fn initialize(&self) -> Result<(), ShmemError> {
        let header = self.header();
        match header.init_state.compare_exchange(
            STATE_UNINIT,
            STATE_INITIALIZING,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                header.magic.store(MAGIC, Ordering::Relaxed);
                header.version.store(1, Ordering::Relaxed);
                let now = rustix::time::clock_gettime(rustix::time::ClockId::Monotonic);
                let now_ns = now.tv_sec as u64 * 1_000_000_000 + now.tv_nsec as u64;
                header.initial_time_ns.store(now_ns, Ordering::Relaxed);
                // The mutex's zeroed bit pattern is already a valid unlocked
                // `SelfContainedMutex<T>` holding a zeroed (Pod-valid) `T`;
                // nothing further to construct here.
                header.init_state.store(STATE_INITIALIZED, Ordering::Release);
                log::debug!("initialized shmem segment {:?}", self.mapping.name());
                Ok(())
            }
            // Lost the creation race to a concurrent opener of the same
            // freshly-created segment; fall back to waiting like an attacher.
            Err(_) => self.await_initialized(),
        }
    }

    fn await_initialized(&self) -> Result<(), ShmemError> {
        let header = self.header();
        let start = Instant::now();
        loop {
            if header.init_state.load(Ordering::Acquire) == STATE_INITIALIZED {
                return Ok(());
            }
            if start.elapsed() > OPEN_TIMEOUT {
                log::warn!(
                    "timed out waiting for shmem segment {:?} to initialize",
                    self.mapping.name()
                );
                return Err(ShmemError::Timeout);
            }
            std::thread::yield_now();
        }
    }

    /// Acquires the segment's process-shared spinlock, bracketing the
    /// critical section with a trace event.
    pub fn lock(&self) -> SelfContainedMutexGuard<'_, T> {
        log::trace!("acquiring shmem lock on {:?}", self.mapping.name());
        self.header().mutex.lock()
    }

    /// Tears down the mapping, optionally unlinking the backing shm object.
    /// Only the last detaching process should pass `delete = true`.
    pub fn close(self, delete: bool) -> Result<(), ShmemError> {
        self.mapping.close(delete)
    }
}
