//! Balancing policy entry points (§4.6). Per the redesign note in §9 — "an
//! enum of policies behind one interface, not a trait object per variant" —
//! this is a single [`Policy`] carrying a [`PolicyKind`] tag rather than
//! separate `lewi`/`lewi_mask` implementations: the two modes share every
//! ledger operation and differ only in whether callers address CPUs by
//! count (`Lewi`) or by explicit mask (`LewiMask`).

pub mod common;

use cpuset::Mask;
use dlb_shmem::pid_is_alive;

use crate::error::{DlbError, DlbResult, Status};
use crate::helper::{HelperAction, HelperMessage};
use crate::ledger::{ops, NOBODY};
use crate::subprocess::Subprocess;
use common::{candidate_order, LendMode};

fn is_alive(pid: i32) -> bool {
    pid_is_alive(pid)
}

/// Which surface a caller is expected to use; both share the same ledger
/// operations underneath (§9).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PolicyKind {
    /// Callers think in terms of "how many CPUs" (`AcquireCpus(n)`).
    Lewi,
    /// Callers think in terms of an explicit CPU mask (`AcquireCpuMask`).
    LewiMask,
}

/// Per-process LeWI policy state (§4.6.1): whether balancing is currently
/// enabled, the sticky `single` sub-state entered by a blocking call made
/// with a single active thread, and the configured lend/greedy behavior.
pub struct Policy {
    kind: PolicyKind,
    enabled: bool,
    greedy: bool,
    single: bool,
    lend_mode: LendMode,
    max_parallelism: Option<usize>,
}

impl Policy {
    pub fn new(mask_aware: bool, enabled: bool, greedy: bool, lend_mode: LendMode) -> Self {
        Policy {
            kind: if mask_aware { PolicyKind::LewiMask } else { PolicyKind::Lewi },
            enabled,
            greedy,
            single: false,
            lend_mode,
            max_parallelism: None,
        }
    }

    pub fn kind(&self) -> PolicyKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// `Enable` (§4.6.1): balancing resumes; a process already holding
    /// guests keeps them.
    pub fn enable(&mut self) {
        self.enabled = true;
    }

    /// `Disable` (§4.6.1, SPEC_FULL §11 `lewi_DisableDLB`): gives back every
    /// borrowed CPU and reclaims every lent one, unless the policy was
    /// already disabled or is in the sticky `single` sub-state (where there
    /// is nothing outstanding to unwind).
    pub fn disable(&mut self, sp: &Subprocess) -> DlbResult<Status> {
        let status = if self.enabled && !self.single {
            let a = self.return_all(sp)?;
            let b = self.reclaim_all(sp)?;
            a.combine(b)
        } else {
            Status::NoUpdate
        };
        self.enabled = false;
        Ok(status)
    }

    fn require_enabled(&self) -> DlbResult<()> {
        if self.enabled {
            Ok(())
        } else {
            Err(DlbError::Disabled)
        }
    }

    fn candidates(&self, sp: &Subprocess) -> Vec<usize> {
        candidate_order(sp.ledger.n_sys(), &sp.process_mask, &sp.topology, sp.options.priority)
    }

    /// How many more CPUs this process may take on top of `nthreads`
    /// without breaking `MaxParallelism` (§4.6, invariant 5). `None` means
    /// no cap is in effect.
    fn clamp_to_cap(&self, sp: &Subprocess, want: usize) -> usize {
        match self.max_parallelism {
            Some(cap) => want.min(cap.saturating_sub(sp.nthreads())),
            None => want,
        }
    }

    /// `Lend` (§4.3.5, §4.6): lends every CPU this process currently isn't
    /// using (owned-but-idle CPUs beyond `nthreads`).
    pub fn lend(&mut self, sp: &Subprocess) -> DlbResult<Status> {
        self.require_enabled()?;
        let nthreads = sp.nthreads();
        let owned: Vec<usize> = sp.process_mask.iter().collect();
        let keep = owned.len().min(nthreads);
        let to_lend = owned[keep..].to_vec();
        let aggregate = lend_many(sp, &to_lend);
        Ok(aggregate)
    }

    pub fn lend_cpu(&mut self, sp: &Subprocess, cpu: usize) -> DlbResult<Status> {
        self.require_enabled()?;
        Ok(lend_many(sp, &[cpu]))
    }

    pub fn lend_cpu_mask(&mut self, sp: &Subprocess, mask: &Mask) -> DlbResult<Status> {
        self.require_enabled()?;
        let cpus: Vec<usize> = mask.iter().take(sp.ledger.n_sys()).collect();
        Ok(lend_many(sp, &cpus))
    }

    /// `Reclaim` (§4.3.5, §4.6): reclaims every CPU `sp` owns.
    pub fn reclaim_all(&mut self, sp: &Subprocess) -> DlbResult<Status> {
        self.require_enabled()?;
        let owned: Vec<usize> =
            sp.ledger.with_lock(|shmem| (0..shmem.n_sys()).filter(|&c| shmem.node_info[c].owner == sp.pid).collect());
        reclaim_many(sp, &owned)
    }

    pub fn reclaim_cpu(&mut self, sp: &Subprocess, cpu: usize) -> DlbResult<Status> {
        self.require_enabled()?;
        reclaim_many(sp, &[cpu])
    }

    pub fn reclaim_cpus(&mut self, sp: &Subprocess, cpus: &[usize]) -> DlbResult<Status> {
        self.require_enabled()?;
        reclaim_many(sp, cpus)
    }

    pub fn reclaim_cpu_mask(&mut self, sp: &Subprocess, mask: &Mask) -> DlbResult<Status> {
        let cpus: Vec<usize> = mask.iter().collect();
        self.reclaim_cpus(sp, &cpus)
    }

    /// `Acquire` (§4.3.5, §4.6): tops `sp` back up to its owned CPU count,
    /// queuing any shortfall.
    pub fn acquire(&mut self, sp: &Subprocess) -> DlbResult<Status> {
        let n = sp.process_mask.count();
        self.acquire_cpus(sp, n)
    }

    pub fn acquire_cpu(&mut self, sp: &Subprocess, cpu: usize) -> DlbResult<Status> {
        self.require_enabled()?;
        if self.clamp_to_cap(sp, 1) == 0 {
            return Ok(Status::NoUpdate);
        }
        let (result, prior_owner, prior_guest) = sp.ledger.with_lock(|shmem| {
            let prior_owner = shmem.node_info[cpu].owner;
            let prior_guest = shmem.node_info[cpu].guest;
            (ops::acquire_cpu(shmem, sp.pid, cpu, &is_alive), prior_owner, prior_guest)
        });
        let status = result?;
        match status {
            Status::Success => enable_one(sp, cpu),
            Status::Noted if prior_owner == sp.pid && prior_guest != NOBODY && prior_guest != sp.pid => {
                notify_one(sp, prior_guest, HelperAction::DisableCpu, cpu);
            }
            _ => {}
        }
        Ok(status)
    }

    pub fn acquire_cpu_mask(&mut self, sp: &Subprocess, mask: &Mask) -> DlbResult<Status> {
        self.require_enabled()?;
        let budget = self.clamp_to_cap(sp, mask.count());
        if budget == 0 {
            return Ok(Status::NoUpdate);
        }
        let mut gained = Vec::new();
        let mut notifications = Vec::new();
        let result = sp.ledger.with_lock(|shmem| -> Result<Status, DlbError> {
            let mut aggregate = Status::NoUpdate;
            let mut granted = 0usize;
            for c in mask.iter().take(shmem.n_sys()) {
                if granted >= budget {
                    break;
                }
                let prior_owner = shmem.node_info[c].owner;
                let prior_guest = shmem.node_info[c].guest;
                let status = ops::acquire_cpu(shmem, sp.pid, c, &is_alive)?;
                match status {
                    Status::Success => {
                        granted += 1;
                        gained.push(c);
                    }
                    Status::Noted if prior_owner == sp.pid && prior_guest != NOBODY && prior_guest != sp.pid => {
                        notifications.push((prior_guest, c));
                    }
                    _ => {}
                }
                aggregate = aggregate.combine(status);
            }
            Ok(aggregate)
        });
        let aggregate = result?;
        for c in gained {
            enable_one(sp, c);
        }
        for (pid, c) in notifications {
            notify_one(sp, pid, HelperAction::DisableCpu, c);
        }
        Ok(aggregate)
    }

    /// `AcquireCpus(n)` (§4.3.5, §4.6): the workhorse bulk entry point. With
    /// `greedy` enabled, opportunistically asks for more than `n` by also
    /// walking the rest of the candidate order up to the node's full CPU
    /// count, so idle siblings get snapped up even when not strictly needed
    /// yet.
    pub fn acquire_cpus(&mut self, sp: &Subprocess, n: usize) -> DlbResult<Status> {
        self.require_enabled()?;
        let candidates = self.candidates(sp);
        let want = if self.greedy { candidates.len() } else { n };
        let want = self.clamp_to_cap(sp, want);
        if want == 0 {
            return Ok(Status::NoUpdate);
        }
        let mut notifications = Vec::new();
        let status = sp.ledger.with_lock(|shmem| -> Result<Status, DlbError> {
            let status = ops::acquire_cpus(shmem, sp.pid, &candidates, want, &is_alive)?;
            for &c in &candidates {
                let cpu = shmem.node_info[c];
                if cpu.owner == sp.pid && cpu.guest != sp.pid && cpu.guest != NOBODY {
                    notifications.push((cpu.guest, c));
                }
            }
            Ok(status)
        })?;
        sync_active_from_ledger(sp);
        for (pid, c) in notifications {
            notify_one(sp, pid, HelperAction::DisableCpu, c);
        }
        Ok(status)
    }

    /// `Borrow` (§4.3.5, §4.6): opportunistically takes whatever owned
    /// idle CPUs are immediately free, without queuing.
    pub fn borrow(&mut self, sp: &Subprocess) -> DlbResult<Status> {
        let n = sp.process_mask.count();
        self.borrow_cpus(sp, n)
    }

    pub fn borrow_cpus(&mut self, sp: &Subprocess, n: usize) -> DlbResult<Status> {
        self.require_enabled()?;
        let n = self.clamp_to_cap(sp, n);
        if n == 0 {
            return Ok(Status::NoUpdate);
        }
        let candidates = self.candidates(sp);
        let status = sp.ledger.with_lock(|shmem| ops::borrow_cpus(shmem, sp.pid, &candidates, n));
        sync_active_from_ledger(sp);
        Ok(status)
    }

    pub fn borrow_cpu_mask(&mut self, sp: &Subprocess, mask: &Mask) -> DlbResult<Status> {
        self.require_enabled()?;
        let budget = self.clamp_to_cap(sp, mask.count());
        if budget == 0 {
            return Ok(Status::NoUpdate);
        }
        let status = sp.ledger.with_lock(|shmem| {
            let mut aggregate = Status::NoUpdate;
            let mut granted = 0usize;
            for c in mask.iter().take(shmem.n_sys()) {
                if granted >= budget {
                    break;
                }
                let status = ops::borrow_cpu(shmem, sp.pid, c);
                if status == Status::Success {
                    granted += 1;
                }
                aggregate = aggregate.combine(status);
            }
            aggregate
        });
        sync_active_from_ledger(sp);
        Ok(status)
    }

    /// `Return` (§4.3.5, §4.6): yields every CPU `sp` guests but doesn't own.
    pub fn return_all(&mut self, sp: &Subprocess) -> DlbResult<Status> {
        self.require_enabled()?;
        let guested: Vec<usize> = sp.ledger.with_lock(|shmem| {
            (0..shmem.n_sys())
                .filter(|&c| shmem.node_info[c].guest == sp.pid && shmem.node_info[c].owner != sp.pid)
                .collect()
        });
        return_many(sp, &guested)
    }

    pub fn return_cpu(&mut self, sp: &Subprocess, cpu: usize) -> DlbResult<Status> {
        self.require_enabled()?;
        return_many(sp, &[cpu])
    }

    pub fn return_cpu_mask(&mut self, sp: &Subprocess, mask: &Mask) -> DlbResult<Status> {
        self.require_enabled()?;
        let cpus: Vec<usize> = mask.iter().collect();
        return_many(sp, &cpus)
    }

    /// `IntoBlockingCall` (§4.6.2): on entry to a blocking MPI call, lend
    /// according to `lend_mode`. With a single active thread this also
    /// enters the sticky `single` sub-state, since there is nothing left
    /// to lend without blocking the caller's own progress.
    pub fn into_blocking_call(&mut self, sp: &Subprocess) -> DlbResult<Status> {
        self.require_enabled()?;
        if sp.nthreads() <= 1 {
            self.single = true;
        }
        match self.lend_mode {
            LendMode::Block => self.lend(sp),
            LendMode::OneCpu => {
                let owned: Vec<usize> = sp.process_mask.iter().collect();
                if owned.len() <= 1 {
                    return Ok(Status::NoUpdate);
                }
                let master_cpu = current_cpu(sp);
                let to_lend: Vec<usize> = owned.into_iter().filter(|&c| c != master_cpu).collect();
                let aggregate = lend_many(sp, &to_lend);
                let mut master_mask = Mask::new();
                master_mask.set(master_cpu);
                set_active(sp, &master_mask);
                Ok(aggregate)
            }
        }
    }

    /// `OutOfBlockingCall` (§4.6.2, SPEC_FULL §11 `lewi_OutOfBlockingCall`):
    /// on return from a blocking call, reclaim. In the `single` sub-state
    /// only one CPU is requested back (the call was made with one thread);
    /// otherwise every owned CPU is requested. Either way, `acquire_cpus`
    /// leaves `active_mask`/`nthreads` synced to whatever was actually
    /// granted, which is `set_active_mask(&process_mask)`'s effect when
    /// everything comes back immediately.
    pub fn out_of_blocking_call(&mut self, sp: &Subprocess) -> DlbResult<Status> {
        self.require_enabled()?;
        let n = if self.single { 1 } else { sp.process_mask.count() };
        let status = self.acquire_cpus(sp, n)?;
        self.single = false;
        Ok(status)
    }

    /// `CheckCpuAvailability(c)` (§4.6): true if `c` is free for this
    /// process to take without queuing.
    pub fn check_cpu_availability(&self, sp: &Subprocess, cpu: usize) -> bool {
        sp.ledger.with_lock(|shmem| {
            if cpu >= shmem.n_sys() {
                return false;
            }
            let info = shmem.node_info[cpu];
            info.guest == sp.pid || (info.guest == NOBODY && info.state != crate::ledger::CpuState::Disabled)
        })
    }

    /// `PollDROM` (§4.3.6): observes (and clears) this process's `dirty`
    /// per-CPU bits, returning the up-to-date owned mask if anything
    /// changed.
    pub fn poll_drom(&mut self, sp: &Subprocess) -> Option<Mask> {
        sp.ledger.with_lock(|shmem| {
            let mut changed = false;
            let mut mask = Mask::new();
            for c in 0..shmem.n_sys() {
                let cpu = &mut shmem.node_info[c];
                if cpu.owner == sp.pid {
                    mask.set(c);
                }
                if cpu.dirty && (cpu.owner == sp.pid || mask.isset(c)) {
                    cpu.dirty = false;
                    changed = true;
                }
            }
            changed.then_some(mask)
        })
    }

    /// `MaxParallelism(k)` (§4.6, SPEC_FULL §11 `lewi_SetMaxParallelism`):
    /// clamps `nthreads` to at most `k`, immediately lending any excess
    /// owned-and-active CPUs if the new cap is below what's currently held,
    /// and has every subsequent `Acquire`/`Borrow` respect the cap via
    /// [`Policy::clamp_to_cap`] (invariant 5).
    pub fn set_max_parallelism(&mut self, sp: &Subprocess, k: usize) -> DlbResult<Status> {
        self.require_enabled()?;
        self.max_parallelism = Some(k);
        let active: Vec<usize> = sp.active_mask().iter().filter(|&c| sp.process_mask.isset(c)).collect();
        if active.len() <= k {
            return Ok(Status::NoUpdate);
        }
        let excess = active[k..].to_vec();
        Ok(lend_many(sp, &excess))
    }

    pub fn unset_max_parallelism(&mut self) {
        self.max_parallelism = None;
    }
}

/// Lends every CPU in `cpus` (assumed owned by `sp`), syncing this
/// process's own active mask/thread count through the PMI afterward and
/// cross-notifying any other process newly elected as guest (§4.5, §4.6).
fn lend_many(sp: &Subprocess, cpus: &[usize]) -> Status {
    if cpus.is_empty() {
        return Status::NoUpdate;
    }
    let mut aggregate = Status::NoUpdate;
    let mut notifications = Vec::new();
    sp.ledger.with_lock(|shmem| {
        for &c in cpus {
            let status = ops::add_cpu(shmem, sp.pid, c, &is_alive);
            if status == Status::Success {
                let guest = shmem.node_info[c].guest;
                if guest != sp.pid && guest != NOBODY {
                    notifications.push((guest, c));
                }
            }
            aggregate = aggregate.combine(status);
        }
    });
    sync_active_from_ledger(sp);
    for (pid, c) in notifications {
        notify_one(sp, pid, HelperAction::EnableCpu, c);
    }
    aggregate
}

/// Reclaims every CPU in `cpus` (assumed owned by `sp`): grants that land
/// immediately sync this process's own PMI state; reclaims that only
/// queue a cooperative yield (`Noted`) cross-notify whichever other
/// process is still guesting, so its helper thread can disable that CPU
/// on its own side (§4.5, §4.6).
fn reclaim_many(sp: &Subprocess, cpus: &[usize]) -> DlbResult<Status> {
    let mut gained = Vec::new();
    let mut notifications = Vec::new();
    let aggregate = sp.ledger.with_lock(|shmem| -> Result<Status, DlbError> {
        let mut aggregate = Status::NoUpdate;
        for &c in cpus {
            let prior_guest = shmem.node_info[c].guest;
            let status = ops::recover_cpu(shmem, sp.pid, c)?;
            match status {
                Status::Success => gained.push(c),
                Status::Noted if prior_guest != NOBODY && prior_guest != sp.pid => {
                    notifications.push((prior_guest, c));
                }
                _ => {}
            }
            aggregate = aggregate.combine(status);
        }
        Ok(aggregate)
    })?;
    for c in gained {
        enable_one(sp, c);
    }
    for (pid, c) in notifications {
        notify_one(sp, pid, HelperAction::DisableCpu, c);
    }
    Ok(aggregate)
}

/// Returns every CPU in `cpus` that `sp` currently guests but doesn't own.
/// A successful return frees this process's own PMI state for that CPU
/// and, if the ledger immediately elects a different process as the new
/// guest, cross-notifies it (§4.5, §4.6).
fn return_many(sp: &Subprocess, cpus: &[usize]) -> DlbResult<Status> {
    let mut released = Vec::new();
    let mut notifications = Vec::new();
    let aggregate = sp.ledger.with_lock(|shmem| -> Result<Status, DlbError> {
        let mut aggregate = Status::NoUpdate;
        for &c in cpus {
            let status = ops::return_cpu(shmem, sp.pid, c, &is_alive)?;
            if status == Status::Success {
                released.push(c);
                let new_guest = shmem.node_info[c].guest;
                if new_guest != NOBODY && new_guest != sp.pid {
                    notifications.push((new_guest, c));
                }
            }
            aggregate = aggregate.combine(status);
        }
        Ok(aggregate)
    })?;
    for c in released {
        disable_one(sp, c);
    }
    for (pid, c) in notifications {
        notify_one(sp, pid, HelperAction::EnableCpu, c);
    }
    Ok(aggregate)
}

/// Recomputes this process's active mask straight from the ledger (which
/// CPUs in `process_mask` it currently guests) and pushes it out through
/// the PMI in one shot — the holistic form bulk operations use instead of
/// tracking per-CPU deltas themselves.
fn sync_active_from_ledger(sp: &Subprocess) {
    let mask = sp.ledger.with_lock(|shmem| {
        let mut mask = Mask::new();
        for c in sp.process_mask.iter().take(shmem.n_sys()) {
            if shmem.node_info[c].guest == sp.pid {
                mask.set(c);
            }
        }
        mask
    });
    set_active(sp, &mask);
}

/// `set_active_mask(&mask)` (§4.4): replaces this process's active set
/// wholesale and syncs `nthreads` to match.
fn set_active(sp: &Subprocess, mask: &Mask) {
    *sp.active_mask.lock().unwrap() = *mask;
    if let Err(e) = sp.pmi.lock().unwrap().set_mask(mask) {
        log::debug!("pmi set_active_mask skipped: {e}");
    }
    sync_nthreads(sp);
}

/// `enable_cpu(cpu)` (§4.4): adds one CPU to this process's active set.
fn enable_one(sp: &Subprocess, cpu: usize) {
    sp.active_mask.lock().unwrap().set(cpu);
    if let Err(e) = sp.pmi.lock().unwrap().enable_cpu(cpu) {
        log::debug!("pmi enable_cpu({cpu}) skipped: {e}");
    }
    sync_nthreads(sp);
}

/// `disable_cpu(cpu)` (§4.4): removes one CPU from this process's active
/// set.
fn disable_one(sp: &Subprocess, cpu: usize) {
    let prior = sp.active_mask();
    sp.active_mask.lock().unwrap().clr(cpu);
    if let Err(e) = sp.pmi.lock().unwrap().disable_cpu(cpu, &prior) {
        log::debug!("pmi disable_cpu({cpu}) skipped: {e}");
    }
    sync_nthreads(sp);
}

/// Pushes `nthreads`, derived from the current active mask, out through
/// `set_num_threads` (§4.4) — called at the end of every helper above so
/// `nthreads` never drifts from `active_mask` (invariant, §8).
fn sync_nthreads(sp: &Subprocess) {
    let n = sp.active_mask().count().max(1);
    *sp.nthreads.lock().unwrap() = n;
    let n_sys = sp.ledger.n_sys();
    if let Err(e) = sp.pmi.lock().unwrap().update_threads(n, n_sys) {
        log::debug!("pmi update_threads({n}) skipped: {e}");
    }
}

/// The calling thread's current CPU, for `IntoBlockingCall`'s
/// `master_cpu` (§4.6.2). Falls back to the first owned CPU if the
/// syscall fails or reports one outside `sp`'s process mask (e.g. it
/// raced a DROM update).
fn current_cpu(sp: &Subprocess) -> usize {
    // SAFETY: `sched_getcpu()` has no preconditions; a negative return
    // just means the CPU couldn't be determined.
    let ret = unsafe { libc::sched_getcpu() };
    if ret >= 0 && sp.process_mask.isset(ret as usize) {
        return ret as usize;
    }
    sp.process_mask.iter().next().unwrap_or(0)
}

/// Cross-process post (§4.5): tells `target_pid`'s helper thread to run a
/// PMI callback on our behalf, since we can't call into another process's
/// host runtime directly. Silently drops the notification if `sp` has no
/// helper registry (sync/polling mode) or `target_pid` isn't registered
/// (not running in async mode, or already exited) — the requesting side
/// doesn't block on delivery either way.
fn notify_one(sp: &Subprocess, target_pid: i32, action: HelperAction, cpu: usize) {
    if target_pid == NOBODY || target_pid == sp.pid {
        return;
    }
    let Some(registry) = &sp.helper_registry else {
        return;
    };
    let msg = HelperMessage { pid: target_pid, action, cpu: cpu as u32, mask: Mask::new() };
    if !registry.get().post(target_pid, msg) {
        log::debug!("helper: pid {target_pid} has no registered inbox, dropping notify");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lend_mode_from_bool() {
        assert_eq!(LendMode::from_keep_cpu_on_blocking(true), LendMode::OneCpu);
        assert_eq!(LendMode::from_keep_cpu_on_blocking(false), LendMode::Block);
    }

    #[test]
    fn new_policy_starts_enabled_and_not_single() {
        let policy = Policy::new(false, true, false, LendMode::OneCpu);
        assert!(policy.is_enabled());
        assert!(!policy.single);
        assert_eq!(policy.kind(), PolicyKind::Lewi);
    }
}
