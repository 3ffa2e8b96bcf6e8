//! Shared helpers consumed by both `lewi` and `lewi_mask` policy modes
//! (§4.6): candidate-CPU ordering for the bulk ledger ops, and the
//! blocking-call lend mode.

use cpuset::{Mask, Topology};

use crate::options::Priority;

/// `lend_mode` (§4.6): how many CPUs `IntoBlockingCall` lends.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LendMode {
    /// Keep the current (master) CPU, lend the rest. Default.
    OneCpu,
    /// Lend every CPU, including the one making the blocking call.
    Block,
}

impl LendMode {
    pub fn from_keep_cpu_on_blocking(keep: bool) -> Self {
        if keep {
            LendMode::OneCpu
        } else {
            LendMode::Block
        }
    }
}

/// Builds the priority-ordered candidate list consumed by
/// `acquire_cpus`/`borrow_cpus` (§4.3.5, §4.6): CPUs this process already
/// owns come first (so a bulk request reclaims its own idle CPUs before
/// reaching into the shared pool), then the rest of the node ordered by
/// `priority`.
pub fn candidate_order(
    n_sys: usize,
    process_mask: &Mask,
    topology: &Topology,
    priority: Priority,
) -> Vec<usize> {
    let all = Mask::from_cpus(0..n_sys);
    let mut owned: Vec<usize> = process_mask.iter().filter(|&c| c < n_sys).collect();
    owned.sort_unstable();

    let others = all.subtract(process_mask);
    let rest: Vec<usize> = match priority {
        Priority::Any => others.iter().collect(),
        Priority::NearbyFirst => {
            let nearby = topology.parents_covering(process_mask).and(&others);
            let far = others.subtract(&nearby);
            nearby.iter().chain(far.iter()).collect()
        }
        Priority::NearbyOnly => topology.parents_covering(process_mask).and(&others).iter().collect(),
        Priority::SpreadIfempty => {
            let empty_sockets = topology.parents_inside(&others);
            let rest_others = others.subtract(&empty_sockets);
            empty_sockets.iter().chain(rest_others.iter()).collect()
        }
    };

    let mut out = owned;
    out.extend(rest);
    out
}
