use pod::Pod;
use vasi::VirtualAddressSpaceIndependent;

use super::requests::CpuRequestRing;

/// Sentinel PID meaning "no process" (owner/guest unset).
pub const NOBODY: i32 = 0;

#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, VirtualAddressSpaceIndependent)]
pub enum CpuState {
    Disabled = 0,
    Busy = 1,
    Lent = 2,
}

// SAFETY: a C-like enum with explicit discriminants is a valid Pod so long
// as every bit pattern used is listed in `From<u8>` below; `from_u8` panics
// on anything else rather than producing an invalid enum value.
unsafe impl Pod for CpuState {}

impl From<u8> for CpuState {
    fn from(value: u8) -> Self {
        match value {
            0 => CpuState::Disabled,
            1 => CpuState::Busy,
            2 => CpuState::Lent,
            other => panic!("invalid CpuState discriminant {other}"),
        }
    }
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, VirtualAddressSpaceIndependent)]
pub enum StatsState {
    Idle = 0,
    Owned = 1,
    Guested = 2,
}

unsafe impl Pod for StatsState {}

impl From<u8> for StatsState {
    fn from(value: u8) -> Self {
        match value {
            0 => StatsState::Idle,
            1 => StatsState::Owned,
            2 => StatsState::Guested,
            other => panic!("invalid StatsState discriminant {other}"),
        }
    }
}

/// Cumulative nanosecond counters per `StatsState`, plus the timestamp of
/// the last transition (§3).
#[repr(C)]
#[derive(Copy, Clone, Debug, VirtualAddressSpaceIndependent)]
pub struct CpuStats {
    pub idle_ns: u64,
    pub owned_ns: u64,
    pub guested_ns: u64,
    pub last_update_ns: u64,
}

unsafe impl Pod for CpuStats {}

impl Default for CpuStats {
    fn default() -> Self {
        Self {
            idle_ns: 0,
            owned_ns: 0,
            guested_ns: 0,
            last_update_ns: 0,
        }
    }
}

impl CpuStats {
    /// Accounts elapsed time against the state the CPU was in before the
    /// transition at `now_ns`, then moves the bookkeeping clock forward.
    pub fn accumulate(&mut self, prior_state: StatsState, now_ns: u64) {
        let elapsed = now_ns.saturating_sub(self.last_update_ns);
        match prior_state {
            StatsState::Idle => self.idle_ns += elapsed,
            StatsState::Owned => self.owned_ns += elapsed,
            StatsState::Guested => self.guested_ns += elapsed,
        }
        self.last_update_ns = now_ns;
    }
}

/// Per-CPU record in the ledger (§3).
#[repr(C)]
#[derive(Copy, Clone, Debug, VirtualAddressSpaceIndependent)]
pub struct CpuInfo {
    pub id: u32,
    pub owner: i32,
    pub guest: i32,
    pub state: CpuState,
    pub stats_state: StatsState,
    pub stats: CpuStats,
    /// Set when the owner's process-mask was modified out from under it
    /// (DROM); cleared once the owner's `PollDROM` observes it.
    pub dirty: bool,
    /// Specific requests queued for this CPU (size 8, §3).
    pub requests: CpuRequestRing,
}

// SAFETY: every field is itself Pod; `bool`/enums here only ever hold their
// documented discriminants because all constructors go through
// `CpuInfo::new` or zeroing, both of which produce valid values.
unsafe impl Pod for CpuInfo {}

impl CpuInfo {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            owner: NOBODY,
            guest: NOBODY,
            state: CpuState::Disabled,
            stats_state: StatsState::Idle,
            stats: CpuStats::default(),
            dirty: false,
            requests: CpuRequestRing::new(),
        }
    }
}
