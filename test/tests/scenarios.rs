//! End-to-end scenarios exercising the ledger, the policy layer, and the
//! subprocess descriptor together against a real POSIX shared-memory
//! segment. Each test opens its own uniquely-keyed segment so tests can run
//! concurrently without interfering with one another.

use std::sync::Arc;

use cpuset::Mask;
use dlb_core::ledger::ops;
use dlb_core::{DlbOptions, Ledger, Status};

fn open_ledger(key: &str, n_sys: usize, post_mortem_public: bool) -> Arc<Ledger> {
    Arc::new(Ledger::open(key, n_sys, post_mortem_public).expect("open ledger"))
}

#[test]
fn lend_then_reclaim_roundtrip() {
    let key = dlb_integration_tests::unique_shm_key("lend-reclaim");
    let ledger = open_ledger(&key, 4, false);

    let mask = Mask::from_cpus([0, 1, 2, 3]);
    let mut options = DlbOptions::default();
    options.lewi = true;
    let sp = dlb_core::Subprocess::init(100, mask, options, ledger.clone()).unwrap();

    // Only one thread active: keep CPU 0, lend the rest.
    *sp.nthreads.lock().unwrap() = 1;
    let status = sp.policy.lock().unwrap().lend(&sp).unwrap();
    assert_eq!(status, Status::Success);

    ledger.with_lock(|shmem| {
        assert_eq!(shmem.node_info[0].state, dlb_core::CpuState::Busy);
        for c in 1..4 {
            assert_eq!(shmem.node_info[c].state, dlb_core::CpuState::Lent);
            assert_eq!(shmem.node_info[c].guest, dlb_core::ledger::NOBODY);
        }
    });

    let status = sp.policy.lock().unwrap().reclaim_all(&sp).unwrap();
    assert_eq!(status, Status::Success);
    ledger.with_lock(|shmem| {
        for c in 0..4 {
            assert_eq!(shmem.node_info[c].state, dlb_core::CpuState::Busy);
            assert_eq!(shmem.node_info[c].guest, 100);
        }
    });
}

#[test]
fn max_parallelism_clamp_releases_excess() {
    let key = dlb_integration_tests::unique_shm_key("max-parallelism");
    let ledger = open_ledger(&key, 4, false);

    let mask = Mask::from_cpus([0, 1, 2, 3]);
    let sp = dlb_core::Subprocess::init(200, mask, DlbOptions::default(), ledger.clone()).unwrap();
    assert_eq!(sp.nthreads(), 4);

    let status = sp.policy.lock().unwrap().set_max_parallelism(&sp, 2).unwrap();
    assert_eq!(status, Status::Success);
    assert_eq!(sp.nthreads(), 2);

    ledger.with_lock(|shmem| {
        assert_eq!(shmem.node_info[0].state, dlb_core::CpuState::Busy);
        assert_eq!(shmem.node_info[1].state, dlb_core::CpuState::Busy);
        assert_eq!(shmem.node_info[2].state, dlb_core::CpuState::Lent);
        assert_eq!(shmem.node_info[3].state, dlb_core::CpuState::Lent);
    });

    // The cap keeps holding: a later bulk acquire can't bring the lent
    // CPUs back, since that would exceed the max parallelism of 2.
    let status = sp.policy.lock().unwrap().acquire_cpus(&sp, 4).unwrap();
    assert_eq!(status, Status::NoUpdate);
    assert_eq!(sp.nthreads(), 2);
    ledger.with_lock(|shmem| {
        assert_eq!(shmem.node_info[2].state, dlb_core::CpuState::Lent);
        assert_eq!(shmem.node_info[3].state, dlb_core::CpuState::Lent);
    });

    // Same for an opportunistic borrow.
    let status = sp.policy.lock().unwrap().borrow_cpus(&sp, 4).unwrap();
    assert_eq!(status, Status::NoUpdate);
    assert_eq!(sp.nthreads(), 2);
}

#[test]
fn two_process_lend_and_borrow() {
    let key = dlb_integration_tests::unique_shm_key("lend-borrow");
    let ledger_a = open_ledger(&key, 4, false);
    let ledger_b = open_ledger(&key, 4, false);

    let sp_a = dlb_core::Subprocess::init(
        1,
        Mask::from_cpus([0, 1]),
        DlbOptions::default(),
        ledger_a.clone(),
    )
    .unwrap();
    let sp_b = dlb_core::Subprocess::init(
        2,
        Mask::from_cpus([2, 3]),
        DlbOptions::default(),
        ledger_b.clone(),
    )
    .unwrap();

    // A lends CPU 0 (its second thread is idle).
    let status = sp_a.policy.lock().unwrap().lend_cpu(&sp_a, 0).unwrap();
    assert_eq!(status, Status::Success);

    // B borrows it opportunistically.
    let status = sp_b.policy.lock().unwrap().acquire_cpu(&sp_b, 0).unwrap();
    assert_eq!(status, Status::Success);

    ledger_a.with_lock(|shmem| {
        assert_eq!(shmem.node_info[0].owner, 1);
        assert_eq!(shmem.node_info[0].guest, 2);
        assert_eq!(shmem.node_info[0].state, dlb_core::CpuState::Lent);
    });

    // A reclaims: cooperative (guest must yield), so Noted, not an
    // instant takeover.
    let status = sp_a.policy.lock().unwrap().reclaim_cpu(&sp_a, 0).unwrap();
    assert_eq!(status, Status::Noted);
    ledger_a.with_lock(|shmem| {
        assert_eq!(shmem.node_info[0].guest, 2); // B hasn't yielded yet
        assert_eq!(shmem.node_info[0].state, dlb_core::CpuState::Busy);
    });

    // B yields; the ledger immediately regrants it to the owner.
    let status = sp_b.policy.lock().unwrap().return_cpu(&sp_b, 0).unwrap();
    assert_eq!(status, Status::Success);
    ledger_a.with_lock(|shmem| {
        assert_eq!(shmem.node_info[0].guest, 1);
    });
}

#[test]
fn global_request_queue_is_fifo_across_processes() {
    let key = dlb_integration_tests::unique_shm_key("global-fifo");
    let ledger = open_ledger(&key, 1, false);

    // Owner registers the sole CPU.
    ledger.with_lock(|shmem| ops::register(shmem, 1, &Mask::from_cpus([0]), false)).unwrap();

    fn alive(_: i32) -> bool {
        true
    }

    // Two waiters ask for more CPUs than the node has, so their demand
    // overflows onto the global ring in arrival order.
    ledger.with_lock(|shmem| {
        let status = ops::acquire_cpus(shmem, 10, &[], 1, &alive).unwrap();
        assert_eq!(status, Status::Noted);
        let status = ops::acquire_cpus(shmem, 20, &[], 1, &alive).unwrap();
        assert_eq!(status, Status::Noted);
        assert!(!shmem.global_requests.is_empty());
    });

    // Owner lends the CPU: the first waiter in FIFO order is elected.
    ledger.with_lock(|shmem| {
        ops::add_cpu(shmem, 1, 0, &alive);
        assert_eq!(shmem.node_info[0].guest, 10);
    });

    // 10 releases it voluntarily; the second waiter is elected next from
    // the global ring (its per-CPU ring is empty).
    ledger.with_lock(|shmem| {
        ops::add_cpu(shmem, 10, 0, &alive);
        assert_eq!(shmem.node_info[0].guest, 20);
    });
}

#[test]
fn drom_mask_swap_is_observed_via_poll() {
    let key = dlb_integration_tests::unique_shm_key("drom-swap");
    let ledger = open_ledger(&key, 4, false);

    let sp = dlb_core::Subprocess::init(
        7,
        Mask::from_cpus([0, 1]),
        DlbOptions::default(),
        ledger.clone(),
    )
    .unwrap();

    let new_mask = Mask::from_cpus([2, 3]);
    ledger.with_lock(|shmem| ops::update_ownership(shmem, 7, &new_mask));

    let observed = sp.policy.lock().unwrap().poll_drom(&sp);
    assert_eq!(observed, Some(new_mask));

    // A second poll with nothing new sees no change.
    assert_eq!(sp.policy.lock().unwrap().poll_drom(&sp), None);
}

#[test]
fn deregister_with_post_mortem_public_lends_rather_than_disables() {
    let key = dlb_integration_tests::unique_shm_key("post-mortem");
    let ledger = open_ledger(&key, 2, true);

    let sp = dlb_core::Subprocess::init(
        9,
        Mask::from_cpus([0, 1]),
        DlbOptions::default(),
        ledger.clone(),
    )
    .unwrap();
    let was_last = sp.finalize().unwrap();
    assert!(was_last);

    ledger.with_lock(|shmem| {
        for c in 0..2 {
            assert_eq!(shmem.node_info[c].owner, dlb_core::ledger::NOBODY);
            assert_eq!(shmem.node_info[c].state, dlb_core::CpuState::Lent);
        }
    });
}
