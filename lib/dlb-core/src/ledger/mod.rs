//! The node-wide CPU ownership ledger (§3, §4.3): the shared-memory layout
//! (`shmem`), its per-CPU records (`cpu_info`), the request queues
//! (`requests`), and the mutating operations the policy layer drives
//! (`ops`).

pub mod cpu_info;
pub mod ops;
pub mod requests;
pub mod shmem;

pub use cpu_info::{CpuInfo, CpuState, CpuStats, StatsState, NOBODY};
pub use shmem::{CpuInfoShmem, Ledger};
