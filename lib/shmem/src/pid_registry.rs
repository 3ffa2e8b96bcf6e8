use pod::Pod;
use vasi::VirtualAddressSpaceIndependent;

/// Sentinel for an empty registry slot or an absent owner/guest.
pub const NOBODY_PID: i32 = 0;

/// Fixed-capacity table of attached PIDs, embedded directly in the shmem
/// segment so every attaching process can see who else is attached.
///
/// Capacity is bounded by `N` rather than the runtime CPU count, since the
/// segment's layout (and therefore its mmap size) is fixed at first creation.
#[repr(C)]
#[derive(Copy, Clone, Debug, VirtualAddressSpaceIndependent)]
pub struct PidRegistry<const N: usize> {
    slots: [i32; N],
}

// SAFETY: a plain array of i32 is valid for any bit pattern.
unsafe impl<const N: usize> Pod for PidRegistry<N> {}

impl<const N: usize> Default for PidRegistry<N> {
    fn default() -> Self {
        Self {
            slots: [NOBODY_PID; N],
        }
    }
}

impl<const N: usize> PidRegistry<N> {
    /// Adds `pid`, returning `false` if the table is full and `pid` wasn't
    /// already present.
    pub fn add(&mut self, pid: i32) -> bool {
        if self.slots.iter().any(|&p| p == pid) {
            return true;
        }
        match self.slots.iter_mut().find(|p| **p == NOBODY_PID) {
            Some(slot) => {
                *slot = pid;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, pid: i32) {
        if let Some(slot) = self.slots.iter_mut().find(|p| **p == pid) {
            *slot = NOBODY_PID;
        }
    }

    pub fn contains(&self, pid: i32) -> bool {
        self.slots.iter().any(|&p| p == pid)
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|&&p| p != NOBODY_PID).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = i32> + '_ {
        self.slots.iter().copied().filter(|&p| p != NOBODY_PID)
    }

    /// Probes every registered PID for liveness. A dead PID is logged as a
    /// warning and left in the table; per the segment contract, stale PIDs
    /// are never forcibly evicted.
    pub fn warn_stale(&self) {
        for pid in self.iter() {
            if !pid_is_alive(pid) {
                log::warn!("stale PID {pid} found in shmem pid_registry");
            }
        }
    }
}

/// Liveness probe for a PID via a zero-signal `kill`: `ESRCH` means the
/// process is gone, `EPERM` means it's alive but owned by someone else.
pub fn pid_is_alive(pid: i32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}
