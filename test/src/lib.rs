//! Shared helpers for the integration tests under `tests/`: mainly a
//! per-test shared-memory key generator, since every test that opens a
//! [`dlb_core::Ledger`] needs its own segment to avoid interfering with
//! other tests running concurrently in the same `cargo test` process.

use std::sync::atomic::{AtomicU64, Ordering};

static COUNTER: AtomicU64 = AtomicU64::new(0);

/// A shm key unique to this test run: the current pid plus a monotonic
/// counter, so parallel test threads and repeated `cargo test` invocations
/// never collide on a leftover segment from a previous run.
pub fn unique_shm_key(test_name: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("dlb-test-{}-{}-{}", std::process::id(), test_name, n)
}

/// Enables `log` output under `cargo test -- --nocapture`; safe to call from
/// every test since `try_init` only succeeds once per process.
pub fn init_logging() {
    let _ = env_logger::try_init();
}
