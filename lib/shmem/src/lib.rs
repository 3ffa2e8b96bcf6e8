//! Named POSIX shared-memory segments for the DLB ledger: a generic
//! `T` held behind a process-shared spinlock, a one-shot
//! creation/attach handshake, and a PID liveness registry.

mod error;
mod pid_registry;
mod raw_mapping;
mod segment;

pub use error::ShmemError;
pub use pid_registry::{pid_is_alive, PidRegistry, NOBODY_PID};
pub use raw_mapping::RawMapping;
pub use segment::Segment;
pub use vasi_sync::scmutex::SelfContainedMutexGuard;
