use cpuset::MAX_CPUS;
use dlb_shmem::{PidRegistry, Segment};
use pod::Pod;
use vasi::VirtualAddressSpaceIndependent;
use vasi_sync::scmutex::SelfContainedMutexGuard;

use super::cpu_info::CpuInfo;
use super::requests::GlobalRequestRing;
use crate::error::DlbError;

/// The full contents of the `cpuinfo` shared-memory segment (§3): per-CPU
/// records, the global request queue, and the attached-PID registry.
///
/// Sized to [`MAX_CPUS`] regardless of the node's actual CPU count, since
/// the segment's layout (and mmap size) must be fixed before any process
/// knows `N_sys`; only the first `n_sys` entries of `node_info` are live.
#[repr(C)]
#[derive(Copy, Clone, VirtualAddressSpaceIndependent)]
pub struct CpuInfoShmem {
    n_sys: u32,
    ledger_ready: bool,
    /// Global DROM dirty flag; set whenever any CPU's `dirty` bit is set.
    pub dirty: bool,
    /// Whether CPUs owned by a deregistering process become publicly
    /// borrowable (`LENT`) rather than `DISABLED` (§4.3.2, scenario 6).
    pub cpu_is_public_post_mortem: bool,
    pub node_info: [CpuInfo; MAX_CPUS],
    pub global_requests: GlobalRequestRing,
    pub pid_registry: PidRegistry<MAX_CPUS>,
}

// SAFETY: every field is itself Pod.
unsafe impl Pod for CpuInfoShmem {}

impl CpuInfoShmem {
    /// Idempotent ledger-level initialization, run under the segment lock by
    /// whichever process happens to take it first. The low-level shmem
    /// handshake (`dlb_shmem::Segment::open`) only establishes that the
    /// *bytes* are valid; per-CPU `id`s still need populating since a
    /// zeroed `CpuInfo` can't know its own index.
    pub fn ensure_ready(&mut self, n_sys: usize, cpu_is_public_post_mortem: bool) {
        if self.ledger_ready {
            return;
        }
        self.n_sys = n_sys as u32;
        self.cpu_is_public_post_mortem = cpu_is_public_post_mortem;
        for (i, cpu) in self.node_info.iter_mut().enumerate().take(n_sys) {
            *cpu = CpuInfo::new(i as u32);
        }
        self.ledger_ready = true;
    }

    pub fn n_sys(&self) -> usize {
        self.n_sys as usize
    }

    pub fn cpus(&self) -> &[CpuInfo] {
        &self.node_info[..self.n_sys()]
    }

    pub fn cpus_mut(&mut self) -> &mut [CpuInfo] {
        let n = self.n_sys();
        &mut self.node_info[..n]
    }
}

/// Owns the attached `cpuinfo` segment for this process.
pub struct Ledger {
    segment: Segment<CpuInfoShmem>,
    n_sys: usize,
    cpu_is_public_post_mortem: bool,
}

impl Ledger {
    pub fn open(
        shm_key: &str,
        n_sys: usize,
        cpu_is_public_post_mortem: bool,
    ) -> Result<Self, DlbError> {
        if n_sys > MAX_CPUS {
            log::warn!("n_sys {n_sys} exceeds MAX_CPUS {MAX_CPUS}; clamping");
        }
        let n_sys = n_sys.min(MAX_CPUS);
        let segment = Segment::open("cpuinfo", shm_key)?;
        let ledger = Ledger {
            segment,
            n_sys,
            cpu_is_public_post_mortem,
        };
        ledger.with_lock(|_| {});
        Ok(ledger)
    }

    pub fn n_sys(&self) -> usize {
        self.n_sys
    }

    /// Runs `f` with the ledger locked, after ensuring per-process
    /// bookkeeping (the one-shot ledger init) has run.
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut CpuInfoShmem) -> R) -> R {
        let mut guard: SelfContainedMutexGuard<'_, CpuInfoShmem> = self.segment.lock();
        guard.ensure_ready(self.n_sys, self.cpu_is_public_post_mortem);
        f(&mut guard)
    }

    /// Adds this process's PID to the attached registry and probes for
    /// stale entries left by crashed processes.
    pub fn attach(&self, pid: i32) {
        self.with_lock(|shmem| {
            if !shmem.pid_registry.add(pid) {
                log::warn!("pid_registry full; {pid} could not be recorded as attached");
            }
            shmem.pid_registry.warn_stale();
        });
    }

    /// Removes `pid` from the attached registry; returns `true` if no PID
    /// remains, in which case the caller should unlink the segment.
    pub fn detach(&self, pid: i32) -> bool {
        self.with_lock(|shmem| {
            shmem.pid_registry.remove(pid);
            shmem.pid_registry.is_empty()
        })
    }

    pub fn close(self, unlink: bool) -> Result<(), DlbError> {
        self.segment.close(unlink).map_err(DlbError::from)
    }
}
