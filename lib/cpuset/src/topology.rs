use std::fs;
use std::path::Path;

use crate::mask::Mask;

/// Groups of CPUs that share a resource worth balancing around (a socket, a
/// NUMA node). Used by the priority selector (§4.6) to order candidate CPUs
/// when borrowing: entire idle groups are preferred over scattered CPUs.
pub struct Topology {
    groups: Vec<Mask>,
}

impl Topology {
    pub fn from_groups(groups: Vec<Mask>) -> Self {
        Self { groups }
    }

    /// Discovers socket-level groups from sysfs
    /// (`/sys/devices/system/cpu/cpu*/topology/core_siblings_list`). Falls
    /// back to a single group spanning `[0, n_sys)` if sysfs can't be read,
    /// mirroring how the rest of the ledger treats topology lookups as
    /// best-effort: a missing sysfs shouldn't prevent DLB from balancing.
    pub fn discover(n_sys: usize) -> Self {
        match Self::discover_from_sysfs(n_sys) {
            Some(topology) => topology,
            None => {
                log::warn!(
                    "unable to read CPU topology from sysfs; treating all {n_sys} CPUs as one group"
                );
                Self::from_groups(vec![Mask::from_cpus(0..n_sys)])
            }
        }
    }

    fn discover_from_sysfs(n_sys: usize) -> Option<Self> {
        let mut groups: Vec<Mask> = Vec::new();
        for cpu in 0..n_sys {
            let path = format!("/sys/devices/system/cpu/cpu{cpu}/topology/core_siblings_list");
            let siblings = read_cpu_list(Path::new(&path))?;
            let mask = Mask::from_cpus(siblings.into_iter().filter(|&c| c < n_sys));
            if !groups.iter().any(|g| g.equal(&mask)) {
                groups.push(mask);
            }
        }
        if groups.is_empty() {
            return None;
        }
        Some(Self::from_groups(groups))
    }

    /// Union of every group that intersects `mask` ("sockets touched by
    /// mask").
    pub fn parents_covering(&self, mask: &Mask) -> Mask {
        let mut out = Mask::new();
        for group in &self.groups {
            if !group.and(mask).is_empty() {
                out = out.or(group);
            }
        }
        out
    }

    /// Union of every group that is entirely contained in `mask` ("fully
    /// free sockets").
    pub fn parents_inside(&self, mask: &Mask) -> Mask {
        let mut out = Mask::new();
        for group in &self.groups {
            if group.is_subset(mask) {
                out = out.or(group);
            }
        }
        out
    }
}

/// Parses a Linux sysfs CPU list (e.g. `0-3,8-11`) into individual CPU ids.
fn read_cpu_list(path: &Path) -> Option<Vec<usize>> {
    let contents = fs::read_to_string(path).ok()?;
    let mut cpus = Vec::new();
    for part in contents.trim().split(',') {
        if part.is_empty() {
            continue;
        }
        if let Some((lo, hi)) = part.split_once('-') {
            let lo: usize = lo.trim().parse().ok()?;
            let hi: usize = hi.trim().parse().ok()?;
            cpus.extend(lo..=hi);
        } else {
            cpus.push(part.trim().parse().ok()?);
        }
    }
    Some(cpus)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parents_covering_and_inside() {
        let socket0 = Mask::from_cpus([0, 1]);
        let socket1 = Mask::from_cpus([2, 3]);
        let topology = Topology::from_groups(vec![socket0, socket1]);

        let mask = Mask::from_cpus([1, 2]);
        assert_eq!(topology.parents_covering(&mask), Mask::from_cpus([0, 1, 2, 3]));
        assert_eq!(topology.parents_inside(&mask), Mask::new());

        let full_socket0 = Mask::from_cpus([0, 1]);
        assert_eq!(topology.parents_inside(&full_socket0), socket0);
    }

    #[test]
    fn parse_cpu_list() {
        let dir = std::env::temp_dir().join("cpuset-topology-test");
        std::fs::create_dir_all(&dir).unwrap();
        let file = dir.join("list");
        std::fs::write(&file, "0-1,3\n").unwrap();
        assert_eq!(read_cpu_list(&file).unwrap(), vec![0, 1, 3]);
        std::fs::remove_file(&file).ok();
    }
}
