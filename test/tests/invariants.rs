//! Structural invariants from §3/§8: properties that must hold of the
//! ledger after any sequence of operations, independent of which scenario
//! produced that state.

use cpuset::Mask;
use dlb_core::ledger::{ops, NOBODY};
use dlb_core::{CpuState, Ledger};

fn alive(_: i32) -> bool {
    true
}

#[test]
fn a_disabled_cpu_has_no_owner_and_no_guest() {
    let key = dlb_integration_tests::unique_shm_key("invariant-disabled");
    let ledger = Ledger::open(&key, 2, false).unwrap();
    ledger.with_lock(|shmem| {
        assert_eq!(shmem.node_info[0].state, CpuState::Disabled);
        assert_eq!(shmem.node_info[0].owner, NOBODY);
        assert_eq!(shmem.node_info[0].guest, NOBODY);
    });
}

#[test]
fn a_busy_cpus_guest_is_always_its_owner_until_lent() {
    let key = dlb_integration_tests::unique_shm_key("invariant-busy-guest");
    let ledger = Ledger::open(&key, 1, false).unwrap();
    ledger.with_lock(|shmem| ops::register(shmem, 1, &Mask::from_cpus([0]), false)).unwrap();
    ledger.with_lock(|shmem| {
        assert_eq!(shmem.node_info[0].state, CpuState::Busy);
        assert_eq!(shmem.node_info[0].guest, shmem.node_info[0].owner);
    });
}

#[test]
fn register_then_deregister_is_a_true_round_trip() {
    let key = dlb_integration_tests::unique_shm_key("invariant-roundtrip");
    let ledger = Ledger::open(&key, 4, false).unwrap();
    let mask = Mask::from_cpus([0, 1, 2, 3]);

    let before = ledger.with_lock(|shmem| shmem.cpus().to_vec());
    ledger.with_lock(|shmem| ops::register(shmem, 42, &mask, false)).unwrap();
    ledger.with_lock(|shmem| ops::deregister(shmem, 42));
    let after = ledger.with_lock(|shmem| shmem.cpus().to_vec());

    for (b, a) in before.iter().zip(after.iter()) {
        assert_eq!(b.owner, a.owner);
        assert_eq!(b.state, a.state);
    }
}

#[test]
fn a_registered_cpu_rejects_a_second_owner_without_steal() {
    let key = dlb_integration_tests::unique_shm_key("invariant-steal");
    let ledger = Ledger::open(&key, 1, false).unwrap();
    ledger.with_lock(|shmem| ops::register(shmem, 1, &Mask::from_cpus([0]), false)).unwrap();
    let result = ledger.with_lock(|shmem| ops::register(shmem, 2, &Mask::from_cpus([0]), false));
    assert!(result.is_err());

    // ...but succeeds with `steal = true`, displacing the prior owner.
    ledger.with_lock(|shmem| ops::register(shmem, 2, &Mask::from_cpus([0]), true)).unwrap();
    ledger.with_lock(|shmem| assert_eq!(shmem.node_info[0].owner, 2));
}

#[test]
fn acquire_cpu_is_idempotent_for_the_current_guest() {
    let key = dlb_integration_tests::unique_shm_key("invariant-idempotent");
    let ledger = Ledger::open(&key, 1, false).unwrap();
    ledger.with_lock(|shmem| ops::register(shmem, 1, &Mask::from_cpus([0]), false)).unwrap();
    ledger.with_lock(|shmem| ops::add_cpu(shmem, 1, 0, &alive));
    ledger.with_lock(|shmem| ops::acquire_cpu(shmem, 9, 0, &alive)).unwrap();

    let first = ledger.with_lock(|shmem| shmem.node_info[0]);
    let status = ledger.with_lock(|shmem| ops::acquire_cpu(shmem, 9, 0, &alive)).unwrap();
    let second = ledger.with_lock(|shmem| shmem.node_info[0]);

    assert_eq!(status, dlb_core::Status::NoUpdate);
    assert_eq!(first.guest, second.guest);
    assert_eq!(first.state, second.state);
}
