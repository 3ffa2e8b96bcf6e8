//! Core, platform-independent implementation of DLB's LeWI (Lend-When-Idle)
//! load balancer: a node-wide CPU ownership ledger held in shared memory,
//! a typed programming-model-interface callback table, an async-mode
//! helper thread, and the policy entry points that tie them together for
//! one participating subprocess.
//!
//! This crate has no notion of "the current process" beyond what's passed
//! in explicitly — the binary/FFI layer built on top of it owns `getpid()`,
//! environment parsing, and the MPI-intercept plumbing.

pub mod error;
pub mod helper;
pub mod ledger;
pub mod options;
pub mod pmi;
pub mod policy;
pub mod subprocess;

pub use error::{DlbError, DlbResult, Status};
pub use helper::{HelperAction, HelperMessage, HelperThread};
pub use ledger::{CpuInfo, CpuState, Ledger};
pub use options::{DlbOptions, HelperMode, MpiCalls, Priority};
pub use pmi::{Callback, PmiTable};
pub use policy::{Policy, PolicyKind};
pub use subprocess::{Subprocess, SubprocessHandle, SubprocessRegistry};
