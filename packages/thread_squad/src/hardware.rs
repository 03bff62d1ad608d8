//! Hardware topology oracle.
//!
//! The squad itself never inspects the machine: everything it needs comes
//! through this module, which adapts the `num_cpus` and `core_affinity`
//! crates. The functions here are also useful on their own for building
//! `hardware_thread_mappings` that avoid simultaneous multithreading.

/// Reports the number of concurrent physical cores available.
///
/// Unlike the number of hardware threads, this does not count SMT
/// ("hyper-threading") siblings: on systems with SMT enabled, the hardware
/// thread count is typically some multiple of this value.
#[must_use]
pub fn physical_concurrency() -> usize {
    num_cpus::get_physical()
}

/// Returns a list of hardware thread ids, one per physical core.
///
/// Pinning one worker to each of these ids keeps workers off each other's
/// SMT siblings. The assignment assumes sibling hardware threads carry
/// adjacent ids, which holds on common x86 enumerations; on machines where
/// it does not, the returned ids are still distinct, valid targets.
///
/// Returns an empty list if hardware thread enumeration is not supported by
/// the operating system.
#[must_use]
pub fn physical_core_ids() -> Vec<usize> {
    let Some(cores) = core_affinity::get_core_ids() else {
        return Vec::new();
    };

    if cores.is_empty() {
        return Vec::new();
    }

    let siblings_per_core = cores.len().div_ceil(physical_concurrency().max(1)).max(1);

    cores
        .iter()
        .step_by(siblings_per_core)
        .map(|core| core.id)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn physical_concurrency_is_positive() {
        assert!(physical_concurrency() >= 1);
    }

    #[test]
    fn core_ids_are_distinct_and_ascending() {
        let ids = physical_core_ids();

        for pair in ids.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn one_id_per_physical_core_at_most() {
        assert!(physical_core_ids().len() <= physical_concurrency());
    }
}
