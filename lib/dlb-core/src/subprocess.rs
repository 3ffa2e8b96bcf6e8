//! Subprocess descriptor (§4.7): aggregates everything one participating
//! process needs — its masks, options, PMI table, policy state, and
//! ledger handle — behind an opaque handle so several logical
//! subprocesses can coexist in one OS process, per §9's "arena-style
//! allocation" design note (the registry owns the descriptors; the
//! helper thread only ever carries a pid, never a back-reference).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use cpuset::{Mask, Topology};
use dlb_shmem::RawMapping;

use crate::error::{DlbError, DlbResult};
use crate::helper::{HelperRegistry, HelperThread};
use crate::ledger::{ops, Ledger};
use crate::options::{DlbOptions, HelperMode};
use crate::pmi::PmiTable;
use crate::policy::common::LendMode;
use crate::policy::Policy;

/// Opaque handle returned by `Init_sp`, used by the explicit multi-subprocess
/// API instead of a raw pointer/reference (§4.7).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct SubprocessHandle(u64);

pub struct Subprocess {
    pub pid: i32,
    pub process_mask: Mask,
    pub active_mask: Arc<Mutex<Mask>>,
    pub options: DlbOptions,
    pub pmi: Arc<Mutex<PmiTable>>,
    pub ledger: Arc<Ledger>,
    pub policy: Mutex<Policy>,
    pub topology: Topology,
    pub nthreads: Mutex<usize>,
    pub initial_nthreads: usize,
    /// Cross-process post handle for this process's helper inbox, shared
    /// by any other process reassigning one of this process's CPUs
    /// (§4.5). `None` in sync mode (no helper thread is running).
    pub helper_registry: Option<Arc<RawMapping<HelperRegistry>>>,
    helper: Mutex<Option<HelperThread>>,
}

impl Subprocess {
    /// `Init`: registers `process_mask` in the ledger and brings up the
    /// policy (and, in async mode, the helper thread).
    pub fn init(
        pid: i32,
        process_mask: Mask,
        options: DlbOptions,
        ledger: Arc<Ledger>,
    ) -> DlbResult<Self> {
        ledger.attach(pid);
        ledger.with_lock(|shmem| ops::register(shmem, pid, &process_mask, false))?;

        let nthreads = process_mask.count().max(1);
        let pmi = Arc::new(Mutex::new(PmiTable::new()));
        let topology = Topology::discover(ledger.n_sys());
        let lend_mode = LendMode::from_keep_cpu_on_blocking(options.lewi_keep_cpu_on_blocking);
        let policy = Policy::new(false, options.lewi, options.lewi_greedy, lend_mode);
        let active_mask = Arc::new(Mutex::new(process_mask));

        let (helper, helper_registry) = if options.mode == HelperMode::Async {
            let helper = HelperThread::spawn(&options.shm_key, pid, pmi.clone(), active_mask.clone())?;
            let registry = helper.registry();
            (Some(helper), Some(registry))
        } else {
            (None, None)
        };

        Ok(Subprocess {
            pid,
            process_mask,
            active_mask,
            options,
            pmi,
            ledger,
            policy: Mutex::new(policy),
            topology,
            nthreads: Mutex::new(nthreads),
            initial_nthreads: nthreads,
            helper_registry,
            helper: Mutex::new(helper),
        })
    }

    /// `Finalize`: deregisters from the ledger, tears down the helper
    /// thread, and detaches. Returns whether this was the last attached
    /// process (the caller should unlink the segment).
    pub fn finalize(self) -> DlbResult<bool> {
        if let Some(helper) = self.helper.lock().unwrap().take() {
            helper.finalize();
        }
        let pid = self.pid;
        let ledger = self.ledger.clone();
        ledger.with_lock(|shmem| ops::deregister(shmem, pid));
        Ok(ledger.detach(pid))
    }

    pub fn active_mask(&self) -> Mask {
        *self.active_mask.lock().unwrap()
    }

    pub fn nthreads(&self) -> usize {
        *self.nthreads.lock().unwrap()
    }
}

/// Top-level registry for the explicit multi-subprocess API
/// (`Init_sp`/`Finalize_sp`) plus the single globally-installed descriptor
/// used by the MPI-intercept path (`thread_spd`).
#[derive(Default)]
pub struct SubprocessRegistry {
    next_handle: AtomicU64,
    entries: Mutex<HashMap<u64, Arc<Subprocess>>>,
    thread_spd: Mutex<Option<Arc<Subprocess>>>,
}

impl SubprocessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn init_sp(
        &self,
        pid: i32,
        process_mask: Mask,
        options: DlbOptions,
        ledger: Arc<Ledger>,
    ) -> DlbResult<SubprocessHandle> {
        let sp = Arc::new(Subprocess::init(pid, process_mask, options, ledger)?);
        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().unwrap().insert(id, sp);
        Ok(SubprocessHandle(id))
    }

    pub fn finalize_sp(&self, handle: SubprocessHandle) -> DlbResult<bool> {
        let sp = self
            .entries
            .lock()
            .unwrap()
            .remove(&handle.0)
            .ok_or(DlbError::NoProcess)?;
        match Arc::try_unwrap(sp) {
            Ok(sp) => sp.finalize(),
            // A clone outlived the registry entry (e.g. a concurrent
            // `get()`); nothing to finalize yet, caller already has it.
            Err(_) => Err(DlbError::ProcessDirty),
        }
    }

    pub fn get(&self, handle: SubprocessHandle) -> DlbResult<Arc<Subprocess>> {
        self.entries
            .lock()
            .unwrap()
            .get(&handle.0)
            .cloned()
            .ok_or(DlbError::NoProcess)
    }

    /// `Init` (implicit, process-wide descriptor used by the MPI-intercept
    /// path).
    pub fn init_thread_spd(
        &self,
        pid: i32,
        process_mask: Mask,
        options: DlbOptions,
        ledger: Arc<Ledger>,
    ) -> DlbResult<()> {
        if self.thread_spd.lock().unwrap().is_some() {
            return Err(DlbError::AlreadyInit);
        }
        let sp = Arc::new(Subprocess::init(pid, process_mask, options, ledger)?);
        *self.thread_spd.lock().unwrap() = Some(sp);
        Ok(())
    }

    pub fn finalize_thread_spd(&self) -> DlbResult<bool> {
        let sp = self
            .thread_spd
            .lock()
            .unwrap()
            .take()
            .ok_or(DlbError::NoInit)?;
        match Arc::try_unwrap(sp) {
            Ok(sp) => sp.finalize(),
            Err(_) => Err(DlbError::ProcessDirty),
        }
    }

    pub fn thread_spd(&self) -> DlbResult<Arc<Subprocess>> {
        self.thread_spd.lock().unwrap().clone().ok_or(DlbError::NoInit)
    }
}
