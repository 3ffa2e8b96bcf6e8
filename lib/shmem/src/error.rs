use std::fmt;

#[derive(Debug)]
pub enum ShmemError {
    InvalidName,
    Open(rustix::io::Errno),
    Truncate(rustix::io::Errno),
    Mmap(rustix::io::Errno),
    Munmap(rustix::io::Errno),
    Unlink(rustix::io::Errno),
    /// The initialization handshake didn't complete within the open timeout;
    /// the registry is presumed corrupted.
    Timeout,
}

impl fmt::Display for ShmemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShmemError::InvalidName => write!(f, "invalid shared memory segment name"),
            ShmemError::Open(e) => write!(f, "failed to open shared memory segment: {e}"),
            ShmemError::Truncate(e) => write!(f, "failed to size shared memory segment: {e}"),
            ShmemError::Mmap(e) => write!(f, "failed to map shared memory segment: {e}"),
            ShmemError::Munmap(e) => write!(f, "failed to unmap shared memory segment: {e}"),
            ShmemError::Unlink(e) => write!(f, "failed to unlink shared memory segment: {e}"),
            ShmemError::Timeout => write!(
                f,
                "timed out waiting for shared memory segment initialization"
            ),
        }
    }
}

impl std::error::Error for ShmemError {}
