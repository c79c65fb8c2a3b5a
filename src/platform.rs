// Copyright The K1 PSCI Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Platform adapters: topology constants, per-hart scratch access and the
//! power-control backend.

pub mod k1x;
pub mod scp;

use crate::{
    cache::L2FlushMode,
    psci::{CompositePowerState, ErrorCode, LocalState, PerCpuRecord, PowerStateWord},
    riscv64::wfi,
};
use core::ptr::NonNull;

#[cfg(not(test))]
pub use k1x::K1x as PlatformImpl;
#[cfg(test)]
pub use test::TestPlatform as PlatformImpl;

/// The hooks every platform provides to the coordination core.
pub trait Platform {
    /// The number of CPU power domains.
    const CORE_COUNT: usize;

    /// The number of cluster power domains.
    const CLUSTER_COUNT: usize;

    /// The maximum number of CPUs per cluster.
    const MAX_CORES_PER_CLUSTER: usize;

    /// The highest power level: 0 is a CPU, 1 a cluster, the maximum is the
    /// system domain.
    const MAX_POWER_LEVEL: usize;

    /// The number of non-CPU power domains (clusters plus the system root).
    const NON_CPU_DOMAIN_COUNT: usize;

    /// The size in bytes of the largest cache write-back granule.
    const CACHE_WRITEBACK_GRANULE: usize;

    /// The power-domain topology as child counts in breadth-first order,
    /// starting with the number of root domains.
    fn topology() -> &'static [usize];

    /// Maps a hart id to its linear core position, or `None` for an id that
    /// names no CPU on this platform.
    fn core_position(hart_id: usize) -> Option<usize>;

    /// The linear core position of the calling hart.
    fn core_index() -> usize;

    /// The cluster a hart belongs to.
    fn cluster_index(hart_id: usize) -> usize;

    /// The position of a hart within its cluster.
    fn core_in_cluster(hart_id: usize) -> usize;

    /// The per-hart scratch record of a CPU.
    ///
    /// The record must stay valid and at a stable address for the lifetime of
    /// the platform, and must be reachable with the data cache disabled.
    fn per_cpu_record(cpu_index: usize) -> NonNull<PerCpuRecord>;

    /// Flushes the L2 cache of `cluster`.
    fn l2_flush(cluster: usize, mode: L2FlushMode);
}

/// The power-control backend: either direct power-controller register writes
/// or commands forwarded to the system control processor.
///
/// Exactly one implementation is installed at platform-setup time, before the
/// first PSCI call is served.
pub trait PowerOperations: Sync {
    /// Places the calling CPU in a standby state until an interrupt arrives.
    /// `cpu_state` is guaranteed to be a retention state.
    fn cpu_standby(&self, cpu_state: LocalState);

    /// Releases the CPU identified by `hart_id` from reset.
    fn power_domain_on(&self, hart_id: usize) -> Result<(), ErrorCode>;

    /// Housekeeping before a `CPU_OFF` commits; returning an error vetoes the
    /// operation. Implementations mask local wakeup sources here.
    fn power_domain_off_early(&self, _target_state: &CompositePowerState) -> Result<(), ErrorCode> {
        Ok(())
    }

    /// Programs the power controller to turn the calling CPU (and any higher
    /// domains named in `target_state`) off. Point of no return.
    fn power_domain_off(&self, target_state: &CompositePowerState);

    /// Early actions of a power-down suspend, run while the data cache is
    /// still enabled.
    fn power_domain_suspend_powerdown_early(&self, _target_state: &CompositePowerState) {}

    /// Programs the power controller for the suspend described by
    /// `target_state`.
    fn power_domain_suspend(&self, target_state: &CompositePowerState);

    /// Undoes `power_domain_suspend` after wakeup; `previous_state` is the
    /// state each level is emerging from.
    fn power_domain_suspend_finish(&self, previous_state: &CompositePowerState);

    /// Platform actions when a `CPU_ON` target comes out of reset, run before
    /// the data cache is re-enabled.
    fn power_domain_on_finish(&self, previous_state: &CompositePowerState);

    /// Late `CPU_ON` completion actions, run once the CPU and its cluster are
    /// coherent again.
    fn power_domain_on_finish_late(&self, _previous_state: &CompositePowerState) {}

    /// Parks the calling hart so the power controller can take it down. Must
    /// not return; the hart re-enters firmware through the warm-boot vector.
    fn power_domain_power_down_wfi(&self, _target_state: &CompositePowerState) -> ! {
        loop {
            wfi();
        }
    }

    /// Translates and validates a power-state word into the requested state
    /// for every level.
    fn validate_power_state(&self, word: PowerStateWord)
    -> Result<CompositePowerState, ErrorCode>;

    /// The state `SYSTEM_SUSPEND` drives the tree into: every level powered
    /// down.
    fn sys_suspend_power_state(&self) -> CompositePowerState {
        CompositePowerState::OFF
    }
}
