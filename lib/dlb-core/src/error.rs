use std::fmt;

/// A successful ledger outcome. Distinct from an error: callers must not
/// treat `Noted` or `NoUpdate` as failure (§7).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Status {
    /// The operation had no observable effect (already owning, already
    /// lent, etc.).
    NoUpdate,
    /// The request was queued; the grant will arrive asynchronously or on
    /// the caller's next `Borrow`.
    Noted,
    /// The operation completed immediately as requested.
    Success,
}

impl Status {
    fn precedence(self) -> u8 {
        match self {
            Status::Noted => 2,
            Status::Success => 1,
            Status::NoUpdate => 0,
        }
    }

    /// Folds two per-CPU statuses into the aggregate status a bulk operation
    /// reports, per the precedence `Noted > Success > NoUpdate` (§4.3.5).
    pub fn combine(self, other: Status) -> Status {
        if self.precedence() >= other.precedence() {
            self
        } else {
            other
        }
    }

    pub fn code(self) -> i32 {
        match self {
            Status::Success => 0,
            Status::Noted => 1,
            Status::NoUpdate => 2,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Success => "Success",
            Status::Noted => "Noted",
            Status::NoUpdate => "NoUpdate",
        };
        write!(f, "{s}")
    }
}

/// Stable error codes exposed via `Strerror` (§6).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DlbError {
    Unknown,
    NoInit,
    AlreadyInit,
    Disabled,
    NoShmem,
    NoProcess,
    ProcessDirty,
    Permission,
    Timeout,
    NoCallback,
    NoEntry,
    NotComposable,
    RequestOverflow,
    NoMem,
    NoPolicy,
}

impl DlbError {
    pub fn code(self) -> i32 {
        match self {
            DlbError::Unknown => -1,
            DlbError::NoInit => -2,
            DlbError::AlreadyInit => -3,
            DlbError::Disabled => -4,
            DlbError::NoShmem => -5,
            DlbError::NoProcess => -6,
            DlbError::ProcessDirty => -7,
            DlbError::Permission => -8,
            DlbError::Timeout => -9,
            DlbError::NoCallback => -10,
            DlbError::NoEntry => -11,
            DlbError::NotComposable => -12,
            DlbError::RequestOverflow => -13,
            DlbError::NoMem => -14,
            DlbError::NoPolicy => -15,
        }
    }

    /// Message returned by the public `Strerror` entry point.
    pub fn strerror(self) -> &'static str {
        match self {
            DlbError::Unknown => "Unknown error",
            DlbError::NoInit => "DLB has not been initialized",
            DlbError::AlreadyInit => "DLB has already been initialized",
            DlbError::Disabled => "DLB is disabled",
            DlbError::NoShmem => "Shared memory not found",
            DlbError::NoProcess => "Process not registered",
            DlbError::ProcessDirty => "Process mask has changed",
            DlbError::Permission => "Insufficient permissions",
            DlbError::Timeout => "Operation timed out",
            DlbError::NoCallback => "No callback registered for this event",
            DlbError::NoEntry => "Entry point not found",
            DlbError::NotComposable => "Policy is not composable",
            DlbError::RequestOverflow => "Request queue is full",
            DlbError::NoMem => "Not enough memory",
            DlbError::NoPolicy => "No policy configured",
        }
    }
}

impl fmt::Display for DlbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.strerror(), self.code())
    }
}

impl std::error::Error for DlbError {}

impl From<dlb_shmem::ShmemError> for DlbError {
    fn from(e: dlb_shmem::ShmemError) -> Self {
        match e {
            dlb_shmem::ShmemError::Timeout => DlbError::Timeout,
            _ => DlbError::NoShmem,
        }
    }
}

pub type DlbResult<T = Status> = Result<T, DlbError>;
