use cpuset::Mask;

use super::cpu_info::{CpuInfo, CpuState, StatsState, NOBODY};
use super::shmem::CpuInfoShmem;
use crate::error::{DlbError, Status};

type IsAlive<'a> = &'a dyn Fn(i32) -> bool;

/// Monotonic nanosecond clock for `CpuStats` bookkeeping, the same source
/// `dlb_shmem`'s segment handshake uses for its own timestamps.
fn now_ns() -> u64 {
    let ts = rustix::time::clock_gettime(rustix::time::ClockId::Monotonic);
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// What `stats_state` a CPU record should be in given its current
/// owner/guest/state fields (§3).
fn stats_state_for(cpu: &CpuInfo) -> StatsState {
    if cpu.state == CpuState::Disabled || cpu.guest == NOBODY {
        StatsState::Idle
    } else if cpu.guest == cpu.owner {
        StatsState::Owned
    } else {
        StatsState::Guested
    }
}

/// Rolls accumulated time into the bucket the CPU was just in, then moves
/// `stats_state` to whatever it should be after the mutation that just
/// happened. Called at the end of every ledger operation that can change
/// `owner`, `guest`, or `state`.
fn touch_stats(cpu: &mut CpuInfo) {
    let new_state = stats_state_for(cpu);
    if new_state != cpu.stats_state {
        cpu.stats.accumulate(cpu.stats_state, now_ns());
        cpu.stats_state = new_state;
    }
}

/// Registers `mask` as owned by `pid` (§4.3.1).
///
/// With `steal = false`, fails with `Permission` if any CPU in `mask` is
/// already owned by a different process. With `steal = true`, existing
/// owners are displaced (and logged).
pub fn register(shmem: &mut CpuInfoShmem, pid: i32, mask: &Mask, steal: bool) -> Result<(), DlbError> {
    if !steal {
        for c in mask.iter().take(shmem.n_sys()) {
            let owner = shmem.node_info[c].owner;
            if owner != NOBODY && owner != pid {
                return Err(DlbError::Permission);
            }
        }
    }
    for c in mask.iter().take(shmem.n_sys()) {
        let cpu = &mut shmem.node_info[c];
        if steal && cpu.owner != NOBODY && cpu.owner != pid {
            log::info!("cpu {c}: pid {} displaced by {pid} registering", cpu.owner);
        }
        cpu.owner = pid;
        cpu.state = CpuState::Busy;
        if cpu.guest == NOBODY {
            cpu.guest = pid;
        }
        cpu.dirty = false;
        touch_stats(cpu);
    }
    Ok(())
}

/// Releases every CPU owned by `pid` (§4.3.2). Returns `true` if no CPU in
/// the ledger retains an owner afterward, signaling that the caller may
/// unlink the segment.
pub fn deregister(shmem: &mut CpuInfoShmem, pid: i32) -> bool {
    let post_mortem_public = shmem.cpu_is_public_post_mortem;
    for c in 0..shmem.n_sys() {
        let cpu = &mut shmem.node_info[c];
        if cpu.owner == pid {
            cpu.owner = NOBODY;
            if cpu.guest == pid {
                cpu.guest = NOBODY;
            }
            cpu.state = if post_mortem_public {
                CpuState::Lent
            } else {
                CpuState::Disabled
            };
        } else if cpu.guest == pid {
            cpu.guest = NOBODY;
        }
        cpu.requests.remove(pid);
        touch_stats(cpu);
    }
    shmem.global_requests.remove(pid);
    shmem.cpus().iter().all(|cpu| cpu.owner == NOBODY)
}

/// Guest election for a CPU that just became free (`guest == NOBODY`),
/// per §4.3.4.
fn elect_guest(shmem: &mut CpuInfoShmem, c: usize, is_alive: IsAlive) {
    debug_assert_eq!(shmem.node_info[c].guest, NOBODY);
    if shmem.node_info[c].state == CpuState::Busy {
        let owner = shmem.node_info[c].owner;
        shmem.node_info[c].guest = owner;
        touch_stats(&mut shmem.node_info[c]);
        return;
    }
    if let Some(pid) = shmem.node_info[c].requests.pop_front() {
        shmem.node_info[c].guest = pid;
        touch_stats(&mut shmem.node_info[c]);
        return;
    }
    if let Some(pid) = shmem.global_requests.pop_live(is_alive) {
        shmem.node_info[c].guest = pid;
        touch_stats(&mut shmem.node_info[c]);
    }
}

/// `add_cpu(pid, c)` (§4.3.3): the owner lends `c`, or a non-owner cancels
/// its own pending request for it.
pub fn add_cpu(shmem: &mut CpuInfoShmem, pid: i32, c: usize, is_alive: IsAlive) -> Status {
    let owner = shmem.node_info[c].owner;
    if owner == pid {
        shmem.node_info[c].state = CpuState::Lent;
    } else {
        shmem.node_info[c].requests.remove(pid);
    }
    if shmem.node_info[c].guest == pid {
        shmem.node_info[c].guest = NOBODY;
    }
    if shmem.node_info[c].guest == NOBODY {
        elect_guest(shmem, c, is_alive);
    }
    touch_stats(&mut shmem.node_info[c]);
    Status::Success
}

/// `recover_cpu(pid, c)` (§4.3.3): the owner reclaims `c`.
pub fn recover_cpu(shmem: &mut CpuInfoShmem, pid: i32, c: usize) -> Result<Status, DlbError> {
    if shmem.node_info[c].owner != pid {
        return Err(DlbError::Permission);
    }
    shmem.node_info[c].state = CpuState::Busy;
    let status = if shmem.node_info[c].guest == NOBODY {
        shmem.node_info[c].guest = pid;
        Status::Success
    } else if shmem.node_info[c].guest == pid {
        Status::NoUpdate
    } else {
        // Cooperative reclaim: the current guest must yield on its own.
        Status::Noted
    };
    touch_stats(&mut shmem.node_info[c]);
    Ok(status)
}

/// `acquire_cpu(pid, c)` (§4.3.3).
pub fn acquire_cpu(
    shmem: &mut CpuInfoShmem,
    pid: i32,
    c: usize,
    is_alive: IsAlive,
) -> Result<Status, DlbError> {
    let cpu = shmem.node_info[c];
    if cpu.guest == pid {
        return Ok(Status::NoUpdate);
    }
    if cpu.owner == pid {
        shmem.node_info[c].state = CpuState::Busy;
        let status = if cpu.guest == NOBODY {
            shmem.node_info[c].guest = pid;
            Status::Success
        } else {
            Status::Noted
        };
        touch_stats(&mut shmem.node_info[c]);
        return Ok(status);
    }
    if cpu.state == CpuState::Lent && cpu.guest == NOBODY {
        shmem.node_info[c].guest = pid;
        touch_stats(&mut shmem.node_info[c]);
        return Ok(Status::Success);
    }
    if cpu.state != CpuState::Disabled {
        shmem.node_info[c].requests.push_back(pid)?;
        let _ = is_alive; // election happens lazily when the CPU frees up
        return Ok(Status::Noted);
    }
    Err(DlbError::Permission)
}

/// `borrow_cpu(pid, c)` (§4.3.3): identical to `acquire_cpu` but never
/// queues; succeeds only if the CPU is immediately takeable.
pub fn borrow_cpu(shmem: &mut CpuInfoShmem, pid: i32, c: usize) -> Status {
    let cpu = shmem.node_info[c];
    if cpu.guest == pid {
        return Status::NoUpdate;
    }
    if cpu.owner == pid && cpu.guest == NOBODY {
        shmem.node_info[c].state = CpuState::Busy;
        shmem.node_info[c].guest = pid;
        touch_stats(&mut shmem.node_info[c]);
        return Status::Success;
    }
    if cpu.state == CpuState::Lent && cpu.guest == NOBODY {
        shmem.node_info[c].guest = pid;
        touch_stats(&mut shmem.node_info[c]);
        return Status::Success;
    }
    Status::NoUpdate
}

/// `return_cpu(pid, c)` (§4.3.3): a guest voluntarily yields a CPU it
/// doesn't own, back to its owner.
pub fn return_cpu(
    shmem: &mut CpuInfoShmem,
    pid: i32,
    c: usize,
    is_alive: IsAlive,
) -> Result<Status, DlbError> {
    let cpu = shmem.node_info[c];
    if cpu.state != CpuState::Busy || cpu.owner == pid || cpu.guest != pid {
        return Ok(Status::NoUpdate);
    }
    shmem.node_info[c].guest = NOBODY;
    touch_stats(&mut shmem.node_info[c]);
    elect_guest(shmem, c, is_alive);
    shmem.node_info[c].requests.push_back(pid)?;
    Ok(Status::Success)
}

/// `acquire_cpus(pid, candidates, n)` (§4.3.5): tries to acquire up to `n`
/// CPUs in priority order, queuing any shortfall as one `global_requests`
/// entry.
pub fn acquire_cpus(
    shmem: &mut CpuInfoShmem,
    pid: i32,
    candidates: &[usize],
    n: usize,
    is_alive: IsAlive,
) -> Result<Status, DlbError> {
    if n == 0 {
        shmem.global_requests.remove(pid);
        return Ok(Status::Success);
    }
    let mut granted = 0usize;
    let mut aggregate = Status::NoUpdate;
    // Owned candidates first: `acquire_cpu` on a CPU this pid owns either
    // grants immediately or queues a cooperative reclaim on that CPU's own
    // ring, so it never needs the global ring.
    for &c in candidates {
        if granted >= n {
            break;
        }
        if shmem.node_info[c].owner != pid {
            continue;
        }
        let status = acquire_cpu(shmem, pid, c, is_alive)?;
        if status == Status::Success {
            granted += 1;
        }
        aggregate = aggregate.combine(status);
    }
    // Non-owned candidates: only takeable if immediately free, never
    // queued (that's what the global ring below is for).
    for &c in candidates {
        if granted >= n {
            break;
        }
        if shmem.node_info[c].owner == pid {
            continue;
        }
        let status = borrow_cpu(shmem, pid, c);
        if status == Status::Success {
            granted += 1;
        }
        aggregate = aggregate.combine(status);
    }
    let remainder = n.saturating_sub(granted);
    if remainder > 0 {
        shmem.global_requests.push_back(pid, remainder as i32)?;
        aggregate = aggregate.combine(Status::Noted);
    }
    Ok(aggregate)
}

/// `borrow_cpus(pid, candidates, n)` (§4.3.5): identical to `acquire_cpus`
/// but never queues a remainder.
pub fn borrow_cpus(shmem: &mut CpuInfoShmem, pid: i32, candidates: &[usize], n: usize) -> Status {
    let mut aggregate = Status::NoUpdate;
    let mut granted = 0usize;
    for &c in candidates {
        if granted >= n {
            break;
        }
        let status = borrow_cpu(shmem, pid, c);
        if !matches!(status, Status::NoUpdate) {
            granted += 1;
        }
        aggregate = aggregate.combine(status);
    }
    aggregate
}

/// `recover_all(pid)` (§4.3.5): reclaims every CPU owned by `pid`.
pub fn recover_all(shmem: &mut CpuInfoShmem, pid: i32) -> Result<Status, DlbError> {
    let mut aggregate = Status::NoUpdate;
    for c in 0..shmem.n_sys() {
        if shmem.node_info[c].owner == pid {
            aggregate = aggregate.combine(recover_cpu(shmem, pid, c)?);
        }
    }
    Ok(aggregate)
}

/// `return_all(pid)` (§4.3.5): yields every CPU `pid` guests but doesn't
/// own.
pub fn return_all(shmem: &mut CpuInfoShmem, pid: i32, is_alive: IsAlive) -> Result<Status, DlbError> {
    let mut aggregate = Status::NoUpdate;
    let guested: Vec<usize> = (0..shmem.n_sys())
        .filter(|&c| shmem.node_info[c].guest == pid && shmem.node_info[c].owner != pid)
        .collect();
    for c in guested {
        aggregate = aggregate.combine(return_cpu(shmem, pid, c, is_alive)?);
    }
    Ok(aggregate)
}

/// `update_ownership(pid, new_process_mask)` (§4.3.6, DROM): rewrites
/// `owner` bits en masse and marks the affected CPUs (and the ledger)
/// dirty so a later `PollDROM` observes the change.
pub fn update_ownership(shmem: &mut CpuInfoShmem, pid: i32, new_mask: &Mask) {
    for c in 0..shmem.n_sys() {
        let cpu = &mut shmem.node_info[c];
        let should_own = new_mask.isset(c);
        let currently_owns = cpu.owner == pid;
        if should_own && !currently_owns {
            cpu.owner = pid;
            cpu.dirty = true;
        } else if currently_owns && !should_own {
            cpu.owner = NOBODY;
            cpu.dirty = true;
        }
        touch_stats(cpu);
    }
    shmem.dirty = true;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alive_all(_: i32) -> bool {
        true
    }

    fn fresh(n_sys: usize) -> CpuInfoShmem {
        let mut shmem: CpuInfoShmem = pod::zeroed();
        shmem.ensure_ready(n_sys, false);
        shmem
    }

    #[test]
    fn register_then_deregister_round_trips() {
        let mut shmem = fresh(4);
        let mask = Mask::from_cpus([0, 1, 2, 3]);
        register(&mut shmem, 100, &mask, false).unwrap();
        for c in 0..4 {
            assert_eq!(shmem.node_info[c].owner, 100);
            assert_eq!(shmem.node_info[c].guest, 100);
            assert_eq!(shmem.node_info[c].state, CpuState::Busy);
        }
        let empty = deregister(&mut shmem, 100);
        assert!(empty);
        for c in 0..4 {
            assert_eq!(shmem.node_info[c].owner, NOBODY);
            assert_eq!(shmem.node_info[c].state, CpuState::Disabled);
        }
    }

    #[test]
    fn lend_then_reclaim_is_identity() {
        let mut shmem = fresh(4);
        let mask = Mask::from_cpus([0, 1, 2, 3]);
        register(&mut shmem, 1, &mask, false).unwrap();
        for c in 0..4 {
            add_cpu(&mut shmem, 1, c, &alive_all);
        }
        for c in 0..4 {
            assert_eq!(shmem.node_info[c].state, CpuState::Lent);
            assert_eq!(shmem.node_info[c].guest, NOBODY);
        }
        let status = recover_all(&mut shmem, 1).unwrap();
        assert_eq!(status, Status::Success);
        for c in 0..4 {
            assert_eq!(shmem.node_info[c].state, CpuState::Busy);
            assert_eq!(shmem.node_info[c].guest, 1);
        }
    }

    #[test]
    fn borrow_never_queues() {
        let mut shmem = fresh(2);
        let mask = Mask::from_cpus([0]);
        register(&mut shmem, 1, &mask, false).unwrap();
        add_cpu(&mut shmem, 1, 0, &alive_all);
        // CPU 1 was never registered by anyone: owner stays NOBODY, state DISABLED.
        assert_eq!(borrow_cpu(&mut shmem, 2, 1), Status::NoUpdate);
        assert!(shmem.node_info[1].requests.is_empty());
    }

    #[test]
    fn acquire_cpu_on_disabled_cpu_is_permission_error() {
        let mut shmem = fresh(1);
        assert_eq!(
            acquire_cpu(&mut shmem, 2, 0, &alive_all),
            Err(DlbError::Permission)
        );
    }

    #[test]
    fn global_queue_fairness_two_waiters() {
        let mut shmem = fresh(1);
        let mask = Mask::from_cpus([0]);
        register(&mut shmem, 1, &mask, false).unwrap();
        // CPU 0 is owned+guested by 1, not 10: 10 isn't a candidate owner
        // of CPU 0, so its request can only ever be a non-owned borrow,
        // which never queues. The unmet request falls through to the
        // global ring instead of CPU 0's own ring.
        assert_eq!(
            acquire_cpus(&mut shmem, 10, &[0], 1, &alive_all).unwrap(),
            Status::Noted
        );
        assert!(!shmem.global_requests.is_empty());
        assert!(shmem.node_info[0].requests.is_empty());

        // A second waiter with no candidate list at all also falls back to
        // the global ring.
        assert_eq!(
            acquire_cpus(&mut shmem, 20, &[], 1, &alive_all).unwrap(),
            Status::Noted
        );

        // CPU 0 frees up: the global ring grants it in FIFO order, to 10
        // first.
        add_cpu(&mut shmem, 1, 0, &alive_all);
        assert_eq!(shmem.node_info[0].guest, 10);
    }

    #[test]
    fn acquire_cpus_zero_cancels_pending_request() {
        let mut shmem = fresh(1);
        shmem.global_requests.push_back(42, 3).unwrap();
        let status = acquire_cpus(&mut shmem, 42, &[], 0, &alive_all).unwrap();
        assert_eq!(status, Status::Success);
        assert!(shmem.global_requests.is_empty());
    }

    #[test]
    fn update_ownership_marks_dirty() {
        let mut shmem = fresh(4);
        let initial = Mask::from_cpus([0, 1]);
        register(&mut shmem, 1, &initial, false).unwrap();
        let new_mask = Mask::from_cpus([2, 3]);
        update_ownership(&mut shmem, 1, &new_mask);
        assert!(shmem.dirty);
        assert!(shmem.node_info[0].dirty);
        assert_eq!(shmem.node_info[0].owner, NOBODY);
        assert_eq!(shmem.node_info[2].owner, 1);
    }
}
