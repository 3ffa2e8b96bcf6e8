//! Typed programming-model-interface callback table (§4.4). The host
//! runtime (an MPI library, a threading runtime) registers these so the
//! policy layer can push CPU-mask changes out to it; DLB itself never
//! calls `sched_setaffinity` or equivalent.

use cpuset::Mask;

use crate::error::{DlbError, DlbResult};

type NumThreadsFn = dyn FnMut(usize) + Send;
type MaskFn = dyn FnMut(&Mask) + Send;

/// Identifies one callback slot, for `CallbackSet`/`CallbackGet` (§6).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Callback {
    SetNumThreads,
    SetActiveMask,
    SetProcessMask,
    AddActiveMask,
    AddProcessMask,
}

/// The callback table held in the subprocess descriptor (§4.7).
#[derive(Default)]
pub struct PmiTable {
    set_num_threads: Option<Box<NumThreadsFn>>,
    set_active_mask: Option<Box<MaskFn>>,
    set_process_mask: Option<Box<MaskFn>>,
    add_active_mask: Option<Box<MaskFn>>,
    add_process_mask: Option<Box<MaskFn>>,
}

impl PmiTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_set(&self, which: Callback) -> bool {
        match which {
            Callback::SetNumThreads => self.set_num_threads.is_some(),
            Callback::SetActiveMask => self.set_active_mask.is_some(),
            Callback::SetProcessMask => self.set_process_mask.is_some(),
            Callback::AddActiveMask => self.add_active_mask.is_some(),
            Callback::AddProcessMask => self.add_process_mask.is_some(),
        }
    }

    pub fn set_num_threads_callback(&mut self, f: impl FnMut(usize) + Send + 'static) {
        self.set_num_threads = Some(Box::new(f));
    }

    pub fn set_active_mask_callback(&mut self, f: impl FnMut(&Mask) + Send + 'static) {
        self.set_active_mask = Some(Box::new(f));
    }

    pub fn set_process_mask_callback(&mut self, f: impl FnMut(&Mask) + Send + 'static) {
        self.set_process_mask = Some(Box::new(f));
    }

    pub fn add_active_mask_callback(&mut self, f: impl FnMut(&Mask) + Send + 'static) {
        self.add_active_mask = Some(Box::new(f));
    }

    pub fn add_process_mask_callback(&mut self, f: impl FnMut(&Mask) + Send + 'static) {
        self.add_process_mask = Some(Box::new(f));
    }

    /// `update_threads`: clamps to `[1, n_sys]` and invokes `set_num_threads`.
    pub fn update_threads(&mut self, n: usize, n_sys: usize) -> DlbResult<()> {
        let clamped = n.clamp(1, n_sys.max(1));
        if clamped != n {
            log::debug!("update_threads: clamped {n} to {clamped} (n_sys={n_sys})");
        }
        match &mut self.set_num_threads {
            Some(f) => {
                f(clamped);
                log::trace!("PMI set_num_threads({clamped})");
                Ok(())
            }
            None => Err(DlbError::NoCallback),
        }
    }

    pub fn set_mask(&mut self, mask: &Mask) -> DlbResult<()> {
        Self::invoke(&mut self.set_active_mask, mask, "set_active_mask")
    }

    pub fn set_process_mask(&mut self, mask: &Mask) -> DlbResult<()> {
        Self::invoke(&mut self.set_process_mask, mask, "set_process_mask")
    }

    pub fn add_mask(&mut self, mask: &Mask) -> DlbResult<()> {
        Self::invoke(&mut self.add_active_mask, mask, "add_active_mask")
    }

    pub fn add_process_mask(&mut self, mask: &Mask) -> DlbResult<()> {
        Self::invoke(&mut self.add_process_mask, mask, "add_process_mask")
    }

    /// `enable_cpu(cpu)`, emulated via `add_active_mask` with a singleton
    /// mask (§4.4).
    pub fn enable_cpu(&mut self, cpu: usize) -> DlbResult<()> {
        let mut mask = Mask::new();
        mask.set(cpu);
        self.add_mask(&mask)
    }

    /// `disable_cpu(cpu)`, emulated via `set_active_mask` with `current`
    /// minus `cpu` (§4.4).
    pub fn disable_cpu(&mut self, cpu: usize, current: &Mask) -> DlbResult<()> {
        let mut mask = *current;
        mask.clr(cpu);
        self.set_mask(&mask)
    }

    fn invoke(slot: &mut Option<Box<MaskFn>>, mask: &Mask, name: &str) -> DlbResult<()> {
        match slot {
            Some(f) => {
                f(mask);
                log::trace!("PMI {name}({:?})", mask);
                Ok(())
            }
            None => Err(DlbError::NoCallback),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn uncallbacked_ops_return_no_callback() {
        let mut table = PmiTable::new();
        assert_eq!(table.update_threads(2, 4), Err(DlbError::NoCallback));
        assert_eq!(table.set_mask(&Mask::new()), Err(DlbError::NoCallback));
    }

    #[test]
    fn update_threads_clamps_and_invokes() {
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        let mut table = PmiTable::new();
        table.set_num_threads_callback(move |n| seen2.store(n, Ordering::SeqCst));
        table.update_threads(100, 4).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 4);
        table.update_threads(0, 4).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn enable_disable_cpu_emulation() {
        let last_add = Arc::new(std::sync::Mutex::new(Mask::new()));
        let last_set = Arc::new(std::sync::Mutex::new(Mask::new()));
        let (a, s) = (last_add.clone(), last_set.clone());
        let mut table = PmiTable::new();
        table.add_active_mask_callback(move |m| *a.lock().unwrap() = *m);
        table.set_active_mask_callback(move |m| *s.lock().unwrap() = *m);

        table.enable_cpu(3).unwrap();
        assert!(last_add.lock().unwrap().isset(3));

        let current = Mask::from_cpus([1, 2, 3]);
        table.disable_cpu(2, &current).unwrap();
        let after = *last_set.lock().unwrap();
        assert!(!after.isset(2));
        assert!(after.isset(1) && after.isset(3));
    }
}
