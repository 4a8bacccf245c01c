//! Platform helpers: CPU topology, thread pinning, timestamps.
//!
//! Latency-sensitive producer/consumer threads benefit from being pinned to
//! dedicated cores so the ring's cache lines stay resident. These helpers
//! are best-effort: pinning can fail on restricted systems (containers,
//! cpusets) and callers should treat a `false` return as advisory.

use core_affinity::CoreId;

use crate::trace;

/// CPU topology information detected at runtime.
#[derive(Debug, Clone)]
pub struct CpuTopology {
    /// Total logical cores (including SMT/hyperthreads).
    pub logical_cores: usize,
    /// Total physical cores.
    pub physical_cores: usize,
    /// Whether SMT (hyperthreading) is enabled.
    pub has_smt: bool,
    /// Available core IDs for pinning.
    pub available_cores: Vec<usize>,
}

impl CpuTopology {
    /// Detects the CPU topology of the current system.
    #[must_use]
    pub fn detect() -> Self {
        let logical_cores = num_cpus::get();
        let physical_cores = num_cpus::get_physical();
        let has_smt = logical_cores > physical_cores;

        let available_cores = core_affinity::get_core_ids()
            .map(|ids| ids.into_iter().map(|id| id.id).collect())
            .unwrap_or_else(|| (0..logical_cores).collect());

        Self {
            logical_cores,
            physical_cores,
            has_smt,
            available_cores,
        }
    }
}

/// Pins the calling thread to the given core.
///
/// Returns `false` if the core doesn't exist or the OS refused the affinity
/// change.
pub fn pin_current_thread(core: usize) -> bool {
    let ok = core_affinity::set_for_current(CoreId { id: core });
    if !ok {
        trace::warn!(core, "failed to pin thread");
    }
    ok
}

/// Pins the calling thread to whichever core it is currently running on,
/// preventing future migrations.
pub fn pin_current_thread_to_current_cpu() -> bool {
    let core = rustix::thread::sched_getcpu();
    pin_current_thread(core)
}

/// Local wall-clock timestamp formatted as `YYYYmmdd_HHMMSS`.
///
/// Suitable for log file and capture file names.
#[must_use]
pub fn timestamp_str() -> String {
    chrono::Local::now().format("%Y%m%d_%H%M%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topology_is_plausible() {
        let topology = CpuTopology::detect();
        assert!(topology.logical_cores >= 1);
        assert!(topology.physical_cores >= 1);
        assert!(topology.logical_cores >= topology.physical_cores);
        assert!(!topology.available_cores.is_empty());
    }

    #[test]
    fn pin_to_current_cpu() {
        // Best-effort: restricted environments may refuse affinity changes.
        let _ = pin_current_thread_to_current_cpu();
    }

    #[test]
    fn timestamp_has_expected_shape() {
        let ts = timestamp_str();
        assert_eq!(ts.len(), 15); // YYYYmmdd_HHMMSS
        assert_eq!(ts.as_bytes()[8], b'_');
        assert!(ts[..8].chars().all(|c| c.is_ascii_digit()));
        assert!(ts[9..].chars().all(|c| c.is_ascii_digit()));
    }
}
