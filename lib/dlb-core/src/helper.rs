//! Async-mode helper thread (§4.5): one per process, consuming a
//! single-slot inbox so PMI callbacks can be dispatched outside the
//! ledger's spinlock. The inbox lives in a small shared-memory registry
//! (keyed by owning pid) so a *different* process reassigning one of this
//! process's CPUs can cross-post a message without needing this process's
//! virtual addresses — only the shared memory offset.
//!
//! Grounded in [`vasi_sync::scchannel::SelfContainedChannel`], the same
//! futex-backed single-producer/single-consumer primitive `dlb_shmem`
//! uses for its segment handshake machinery; per §9's note that a
//! process-shared semaphore can be emulated with "a futex on a shared
//! word" when the platform doesn't give one directly.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use cpuset::Mask;
use dlb_shmem::{RawMapping, NOBODY_PID};
use vasi::VirtualAddressSpaceIndependent;
use vasi_sync::scchannel::SelfContainedChannel;

use crate::error::DlbError;
use crate::pmi::PmiTable;

const MAX_HELPERS: usize = cpuset::MAX_CPUS;

#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, VirtualAddressSpaceIndependent)]
pub enum HelperAction {
    None = 0,
    EnableCpu = 1,
    DisableCpu = 2,
    SetMask = 3,
    Join = 4,
}

impl From<u8> for HelperAction {
    fn from(value: u8) -> Self {
        match value {
            0 => HelperAction::None,
            1 => HelperAction::EnableCpu,
            2 => HelperAction::DisableCpu,
            3 => HelperAction::SetMask,
            4 => HelperAction::Join,
            other => panic!("invalid HelperAction discriminant {other}"),
        }
    }
}

/// One posted inbox message: `{pid, action, cpu, mask}` per §4.5.
#[repr(C)]
#[derive(Copy, Clone, VirtualAddressSpaceIndependent)]
pub struct HelperMessage {
    pub pid: i32,
    pub action: HelperAction,
    pub cpu: u32,
    pub mask: Mask,
}

impl HelperMessage {
    fn join(pid: i32) -> Self {
        Self {
            pid,
            action: HelperAction::Join,
            cpu: 0,
            mask: Mask::new(),
        }
    }
}

/// One process's claimed inbox slot.
#[repr(C)]
struct HelperSlot {
    owner_pid: AtomicI32,
    inbox: SelfContainedChannel<HelperMessage>,
}

// SAFETY: `owner_pid` is a plain machine word with no pointer semantics,
// and `SelfContainedChannel<T>` is VASI whenever `T` is (here, `HelperMessage`).
unsafe impl VirtualAddressSpaceIndependent for HelperSlot {}

/// Small shared-memory registry of helper inboxes, one slot per attached
/// process (§4.5). A freshly `ftruncate`-zeroed mapping is already a valid
/// `HelperRegistry`: every slot's `owner_pid` is `NOBODY_PID` (free) and
/// every channel starts `Empty`.
#[repr(C)]
#[derive(VirtualAddressSpaceIndependent)]
pub struct HelperRegistry {
    slots: [HelperSlot; MAX_HELPERS],
}

impl HelperRegistry {
    fn claim_slot(&self, pid: i32) -> Option<usize> {
        self.slots.iter().position(|slot| {
            slot.owner_pid
                .compare_exchange(NOBODY_PID, pid, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        })
    }

    fn release_slot(&self, idx: usize) {
        self.slots[idx].owner_pid.store(NOBODY_PID, Ordering::Release);
    }

    fn find_slot(&self, pid: i32) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.owner_pid.load(Ordering::Acquire) == pid)
    }

    /// Cross-posts `msg` to the inbox owned by `target_pid`. Returns
    /// `false` if no helper for that pid is currently registered (it may
    /// not be running in async mode, or may have already exited).
    ///
    /// Only one outstanding post per target is supported at a time, per
    /// the channel's single-producer contract; callers reassigning a CPU
    /// are expected to wait for the prior grant to land before posting
    /// again, which holds in practice since the ledger only elects one
    /// new guest per freed CPU.
    pub fn post(&self, target_pid: i32, msg: HelperMessage) -> bool {
        match self.find_slot(target_pid) {
            Some(idx) => {
                self.slots[idx].inbox.send(msg);
                true
            }
            None => false,
        }
    }
}

/// Handle to this process's running helper thread.
pub struct HelperThread {
    registry: Arc<RawMapping<HelperRegistry>>,
    pid: i32,
    slot: usize,
    join_handle: Option<JoinHandle<()>>,
}

impl HelperThread {
    /// Opens (or creates) the helper registry for `shm_key`, claims a slot
    /// for `pid`, and spawns the dispatcher thread. PMI callbacks run
    /// through `pmi`, outside the ledger lock, as messages arrive.
    pub fn spawn(
        shm_key: &str,
        pid: i32,
        pmi: Arc<Mutex<PmiTable>>,
        active_mask: Arc<Mutex<Mask>>,
    ) -> Result<Self, DlbError> {
        let (mapping, _created) = RawMapping::<HelperRegistry>::open("helper", shm_key)
            .map_err(DlbError::from)?;
        let registry = Arc::new(mapping);
        let slot = registry
            .get()
            .claim_slot(pid)
            .ok_or(DlbError::NoMem)?;

        let thread_registry = registry.clone();
        let join_handle = std::thread::Builder::new()
            .name(format!("dlb-helper-{pid}"))
            .spawn(move || dispatch_loop(thread_registry, slot, pmi, active_mask))
            .map_err(|e| {
                log::error!("failed to spawn helper thread for pid {pid}: {e}");
                DlbError::NoMem
            })?;

        Ok(Self {
            registry,
            pid,
            slot,
            join_handle: Some(join_handle),
        })
    }

    /// Registry handle, for other components (e.g. the policy layer) to
    /// cross-post via [`HelperRegistry::post`].
    pub fn registry(&self) -> Arc<RawMapping<HelperRegistry>> {
        self.registry.clone()
    }

    /// Finalize: post `Join`, wake the thread, and join it (§4.5).
    pub fn finalize(mut self) {
        self.registry.get().slots[self.slot]
            .inbox
            .send(HelperMessage::join(self.pid));
        if let Some(handle) = self.join_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for HelperThread {
    fn drop(&mut self) {
        if let Some(handle) = self.join_handle.take() {
            self.registry.get().slots[self.slot]
                .inbox
                .send(HelperMessage::join(self.pid));
            let _ = handle.join();
        }
    }
}

fn dispatch_loop(
    registry: Arc<RawMapping<HelperRegistry>>,
    slot: usize,
    pmi: Arc<Mutex<PmiTable>>,
    active_mask: Arc<Mutex<Mask>>,
) {
    loop {
        let msg = match registry.get().slots[slot].inbox.receive() {
            Ok(msg) => msg,
            Err(_) => break,
        };
        match msg.action {
            HelperAction::Join => break,
            HelperAction::None => {}
            HelperAction::EnableCpu => {
                if let Err(e) = pmi.lock().unwrap().enable_cpu(msg.cpu as usize) {
                    log::warn!("helper: enable_cpu({}) callback failed: {e}", msg.cpu);
                } else {
                    active_mask.lock().unwrap().set(msg.cpu as usize);
                }
            }
            HelperAction::DisableCpu => {
                let current = *active_mask.lock().unwrap();
                if let Err(e) = pmi.lock().unwrap().disable_cpu(msg.cpu as usize, &current) {
                    log::warn!("helper: disable_cpu({}) callback failed: {e}", msg.cpu);
                } else {
                    active_mask.lock().unwrap().clr(msg.cpu as usize);
                }
            }
            HelperAction::SetMask => {
                if let Err(e) = pmi.lock().unwrap().set_mask(&msg.mask) {
                    log::warn!("helper: set_mask callback failed: {e}");
                } else {
                    *active_mask.lock().unwrap() = msg.mask;
                }
            }
        }
    }
    registry.get().release_slot(slot);
}
