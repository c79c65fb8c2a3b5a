// Copyright The K1 PSCI Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! The K1 dual-cluster platform: two clusters of four harts, a CCI-style
//! interconnect and an SCP reachable over an MHU mailbox.
//!
//! The direct backend drives the power controller itself through the PMU
//! "vote" registers: a core (or cluster) asserts its idle-configuration vote
//! and the controller takes the domain down once every participant agrees.
//! [`setup`] brings up the interconnect and the SCMI driver and installs the
//! SCMI-backed backend when the SCP is reachable, falling back to the direct
//! backend otherwise.

use super::{Platform, PowerOperations, scp};
use crate::{
    cache::{self, L2FlushMode, L2FlushRegister},
    interconnect::SnoopControl,
    mmio,
    psci::{CompositePowerState, ErrorCode, LocalState, PerCpuRecord, PowerStateWord, parse_power_state},
    riscv64,
    scmi::{Channel, Doorbell, Mailbox, ScmiChannel},
    scmi::power::ScmiHandle,
};
use bitflags::bitflags;
use core::{cell::UnsafeCell, ptr::NonNull};
use log::error;
use spin::Once;

const CORE_COUNT: usize = 8;
const CLUSTER_COUNT: usize = 2;
const MAX_CORES_PER_CLUSTER: usize = 4;

/// Cluster field of a hart id.
const HART_CLUSTER_SHIFT: usize = 2;
const HART_CLUSTER_MASK: usize = 0xf;
/// Core-in-cluster field of a hart id.
const HART_CORE_MASK: usize = 0x3;

/// Interconnect register frame.
const CCI_BASE: usize = 0xd850_0000;
/// Slave interface of each cluster master id.
const CCI_MASTER_MAP: [Option<usize>; 4] = [Some(0), Some(1), Some(2), Some(3)];

/// Per-core idle-configuration (power vote) registers.
const PMU_CORE_IDLE_CFG: [usize; CORE_COUNT] = [
    0xd428_2924,
    0xd428_2928,
    0xd428_2960,
    0xd428_2964,
    0xd428_2b04,
    0xd428_2b08,
    0xd428_2b0c,
    0xd428_2b10,
];

/// Per-cluster idle-configuration registers, one vote word per core slot.
const PMU_CLUSTER_IDLE_CFG: [[usize; MAX_CORES_PER_CLUSTER]; CLUSTER_COUNT] = [
    [0xd428_2920, 0xd428_28e4, 0xd428_2950, 0xd428_2954],
    [0xd428_2b14, 0xd428_2b18, 0xd428_2b1c, 0xd428_2b20],
];

/// Per-cluster ACPR registers carrying the top-level shutdown votes.
const PMU_ACPR_CLUSTER: [usize; CLUSTER_COUNT] = [0xd405_1090, 0xd405_1094];
/// Companion ACPR register poked on the way into top-level shutdown.
const PMU_ACPR_MISC: usize = 0xd405_0038;
const PMU_ACPR_MISC_SHUTDOWN_BIT: u32 = 1 << 2;

/// Per-cluster wakeup register blocks: one word per issuing core.
const CPU_WAKEUP_BASE: [usize; CLUSTER_COUNT] = [0xd428_292c, 0xd428_2b24];

/// Power-down vote value in a core or cluster idle-configuration register.
const POWER_DOWN_VOTE: u32 = 0x3;

/// Hardware-assisted L2 flush enable bit in the cluster idle-configuration
/// registers.
const L2_HARDWARE_FLUSH_EN_BIT: u32 = 1 << 13;

/// Per-cluster L2 flush control registers.
const L2_FLUSH_REG: [usize; CLUSTER_COUNT] = [0xd844_01b0, 0xd844_01b4];

/// SCMI shared-memory mailbox window.
const SCMI_MAILBOX_MEM: usize = 0x2f90_2080;
/// MHU mailbox register frame used as the doorbell.
const MAILBOX_REG_BASE: usize = 0x2f82_4000;

/// Cluster power level in a composite state.
const CLUSTER_LEVEL: usize = 1;

bitflags! {
    /// Top-level shutdown votes in a cluster's ACPR register.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    struct ClusterAcpr: u32 {
        const AXISDO = 1 << 31;
        const DDRSD = 1 << 27;
        const APBSD = 1 << 26;
        const VCXOSD = 1 << 19;
        /// Further shutdown votes the power controller expects to see
        /// together with the named ones.
        const AUX_SD = 1 << 30 | 1 << 29 | 1 << 25 | 1 << 14 | 1 << 13;
    }
}

/// Sets bits in a PMU register.
///
/// # Safety
///
/// `addr` must be a valid PMU register on this SoC.
unsafe fn rmw_set(addr: usize, bits: u32) {
    // SAFETY: Forwarded to the caller.
    unsafe {
        let value = mmio::read32(addr);
        mmio::write32(addr, value | bits);
    }
}

/// Clears bits in a PMU register.
///
/// # Safety
///
/// `addr` must be a valid PMU register on this SoC.
unsafe fn rmw_clear(addr: usize, bits: u32) {
    // SAFETY: Forwarded to the caller.
    unsafe {
        let value = mmio::read32(addr);
        mmio::write32(addr, value & !bits);
    }
}

/// The K1 platform singleton.
pub struct K1x;

struct RecordStore([UnsafeCell<PerCpuRecord>; CORE_COUNT]);

// SAFETY: Records are only mutated by their owning hart or under the owner's
// cpu_lock, with explicit cache maintenance for cross-hart visibility.
unsafe impl Sync for RecordStore {}

static PER_CPU_RECORDS: RecordStore =
    RecordStore([const { UnsafeCell::new(PerCpuRecord::new()) }; CORE_COUNT]);

impl Platform for K1x {
    const CORE_COUNT: usize = CORE_COUNT;
    const CLUSTER_COUNT: usize = CLUSTER_COUNT;
    const MAX_CORES_PER_CLUSTER: usize = MAX_CORES_PER_CLUSTER;
    const MAX_POWER_LEVEL: usize = 2;
    const NON_CPU_DOMAIN_COUNT: usize = 3;
    const CACHE_WRITEBACK_GRANULE: usize = cache::CACHE_LINE_SIZE;

    fn topology() -> &'static [usize] {
        // One system root, two clusters of four CPUs.
        &[1, 2, 4, 4]
    }

    fn core_position(hart_id: usize) -> Option<usize> {
        let cluster = Self::cluster_index(hart_id);
        let core = Self::core_in_cluster(hart_id);

        if cluster >= CLUSTER_COUNT || hart_id != (cluster << HART_CLUSTER_SHIFT | core) {
            return None;
        }

        Some(cluster * MAX_CORES_PER_CLUSTER + core)
    }

    fn core_index() -> usize {
        Self::core_position(riscv64::hart_id()).expect("calling hart is not a known CPU")
    }

    fn cluster_index(hart_id: usize) -> usize {
        hart_id >> HART_CLUSTER_SHIFT & HART_CLUSTER_MASK
    }

    fn core_in_cluster(hart_id: usize) -> usize {
        hart_id & HART_CORE_MASK
    }

    fn per_cpu_record(cpu_index: usize) -> NonNull<PerCpuRecord> {
        NonNull::new(PER_CPU_RECORDS.0[cpu_index].get()).unwrap()
    }

    fn l2_flush(cluster: usize, mode: L2FlushMode) {
        // SAFETY: The register address is the cluster's L2 flush control
        // register on this SoC.
        let l2 = unsafe { L2FlushRegister::new(L2_FLUSH_REG[cluster]) };
        l2.flush(mode);
    }
}

/// Releases `target_hart` from reset through the wakeup register of the
/// calling hart's cluster.
fn wakeup_cpu(target_hart: usize) {
    let caller = riscv64::hart_id();
    let reg = CPU_WAKEUP_BASE[K1x::cluster_index(caller)]
        + size_of::<u32>() * K1x::core_in_cluster(caller);
    let target = K1x::core_position(target_hart).expect("wakeup of an unknown hart");

    // SAFETY: `reg` is this core's wakeup register.
    unsafe {
        mmio::write32(reg, 1 << target);
    }
}

/// Votes the calling hart's core power domain down.
fn assert_cpu(hart_id: usize) {
    let position = K1x::core_position(hart_id).expect("power-down of an unknown hart");
    // SAFETY: The register is the core's idle-configuration register.
    unsafe {
        rmw_set(PMU_CORE_IDLE_CFG[position], POWER_DOWN_VOTE);
    }
}

/// Withdraws the calling hart's core power-down vote.
fn deassert_cpu() {
    let position = K1x::core_index();
    // SAFETY: The register is the core's idle-configuration register.
    unsafe {
        rmw_clear(PMU_CORE_IDLE_CFG[position], POWER_DOWN_VOTE);
    }
}

/// Votes the hart's cluster power domain down.
fn cluster_off(hart_id: usize) {
    for reg in PMU_CLUSTER_IDLE_CFG[K1x::cluster_index(hart_id)] {
        // SAFETY: The registers are the cluster's idle-configuration
        // registers.
        unsafe {
            rmw_set(reg, POWER_DOWN_VOTE);
        }
    }
}

/// Withdraws the hart's cluster power-down vote.
fn cluster_on(hart_id: usize) {
    for reg in PMU_CLUSTER_IDLE_CFG[K1x::cluster_index(hart_id)] {
        // SAFETY: As for `cluster_off`.
        unsafe {
            rmw_clear(reg, POWER_DOWN_VOTE);
        }
    }
}

/// Sets the AXI/DDR/APB/VCXO shutdown votes for top-level power-down.
fn top_off() {
    for reg in PMU_ACPR_CLUSTER {
        // SAFETY: The registers are the per-cluster ACPR registers.
        unsafe {
            rmw_set(reg, ClusterAcpr::all().bits());
        }
    }
    // SAFETY: Companion ACPR register on this SoC.
    unsafe {
        rmw_set(PMU_ACPR_MISC, PMU_ACPR_MISC_SHUTDOWN_BIT);
    }
}

/// Clears the top-level shutdown votes on the way back up.
fn top_on() {
    for reg in PMU_ACPR_CLUSTER {
        // SAFETY: As for `top_off`.
        unsafe {
            rmw_clear(reg, ClusterAcpr::all().bits());
        }
    }
}

/// The direct power-controller backend.
pub struct K1xPowerOps {
    interconnect: &'static SnoopControl,
}

impl PowerOperations for K1xPowerOps {
    fn cpu_standby(&self, cpu_state: LocalState) {
        assert_eq!(LocalState::Retention, cpu_state);
        riscv64::wfi();
    }

    fn power_domain_on(&self, hart_id: usize) -> Result<(), ErrorCode> {
        wakeup_cpu(hart_id);
        Ok(())
    }

    fn power_domain_off_early(&self, _target_state: &CompositePowerState) -> Result<(), ErrorCode> {
        riscv64::quiesce_local_interrupts();
        Ok(())
    }

    fn power_domain_off(&self, target_state: &CompositePowerState) {
        let hart_id = riscv64::hart_id();

        if target_state.states[CLUSTER_LEVEL].is_off() {
            self.interconnect
                .disable_snoop_dvm(K1x::cluster_index(hart_id))
                .expect("cluster master is mapped on the interconnect");
            cluster_off(hart_id);
            K1x::l2_flush(K1x::cluster_index(hart_id), L2FlushMode::HardwareAssist);
        }

        if target_state.highest_level_state().is_off() {
            top_off();
        }

        assert_cpu(hart_id);
    }

    fn power_domain_suspend_powerdown_early(&self, _target_state: &CompositePowerState) {
        riscv64::mask_interrupt_enables();
    }

    fn power_domain_suspend(&self, target_state: &CompositePowerState) {
        // Retention is handled entirely by the CPU standby path.
        if target_state.cpu_level_state() == LocalState::Retention {
            return;
        }
        assert!(target_state.cpu_level_state().is_off());

        let hart_id = riscv64::hart_id();

        if target_state.states[CLUSTER_LEVEL].is_off() {
            self.interconnect
                .disable_snoop_dvm(K1x::cluster_index(hart_id))
                .expect("cluster master is mapped on the interconnect");
            cluster_off(hart_id);
            K1x::l2_flush(K1x::cluster_index(hart_id), L2FlushMode::HardwareAssist);
        }

        if target_state.highest_level_state().is_off() {
            top_off();
        }

        assert_cpu(hart_id);
    }

    fn power_domain_suspend_finish(&self, previous_state: &CompositePowerState) {
        if previous_state.cpu_level_state() == LocalState::Retention {
            return;
        }

        let hart_id = riscv64::hart_id();

        if previous_state.states[CLUSTER_LEVEL].is_off() {
            self.interconnect
                .enable_snoop_dvm(K1x::cluster_index(hart_id))
                .expect("cluster master is mapped on the interconnect");
            cluster_on(hart_id);
        }

        if previous_state.highest_level_state().is_off() {
            top_on();
        }

        deassert_cpu();
    }

    fn power_domain_on_finish(&self, previous_state: &CompositePowerState) {
        let hart_id = riscv64::hart_id();

        if previous_state.highest_level_state().is_off() {
            top_on();
        }

        // No lock needed: no other CPU of this cluster is active yet.
        if previous_state.states[CLUSTER_LEVEL].is_off() {
            cluster_on(hart_id);
            self.interconnect
                .enable_snoop_dvm(K1x::cluster_index(hart_id))
                .expect("cluster master is mapped on the interconnect");
        }
    }

    fn power_domain_on_finish_late(&self, _previous_state: &CompositePowerState) {
        deassert_cpu();
    }

    fn validate_power_state(
        &self,
        word: PowerStateWord,
    ) -> Result<CompositePowerState, ErrorCode> {
        parse_power_state(word)
    }
}

/// The MHU doorbell: drains stale replies, clears the latched reply
/// interrupt, then posts a message on the secure PSCI channel.
struct MhuDoorbell {
    base: usize,
}

/// Message registers, one word per channel.
const MBOX_MSG_OFFSET: usize = 0x40;
/// Message FIFO status registers, one word per channel; low nibble counts
/// queued messages.
const MBOX_MSG_STATUS_OFFSET: usize = 0xc0;
const MBOX_MSG_STATUS_COUNT_MASK: u32 = 0xf;
/// Interrupt status-clear register of the first interrupt block.
const MBOX_IRQ_STATUS_CLR_OFFSET: usize = 0x104;

/// Channel carrying secure power-management commands towards the SCP.
const SECURE_PSCI_CHANNEL: usize = 1;
/// Channel carrying the SCP's replies back.
const SECURE_PSCI_REPLY_CHANNEL: usize = SECURE_PSCI_CHANNEL + 2;

impl Doorbell for MhuDoorbell {
    fn ring(&self) {
        let message = self.base + MBOX_MSG_OFFSET + size_of::<u32>() * SECURE_PSCI_CHANNEL;
        let reply = self.base + MBOX_MSG_OFFSET + size_of::<u32>() * SECURE_PSCI_REPLY_CHANNEL;
        let reply_status =
            self.base + MBOX_MSG_STATUS_OFFSET + size_of::<u32>() * SECURE_PSCI_REPLY_CHANNEL;

        // SAFETY: All addresses are registers within the MHU frame.
        unsafe {
            while mmio::read32(reply_status) & MBOX_MSG_STATUS_COUNT_MASK != 0 {
                mmio::read32(reply);
            }

            let pending = mmio::read32(self.base + MBOX_IRQ_STATUS_CLR_OFFSET);
            mmio::write32(
                self.base + MBOX_IRQ_STATUS_CLR_OFFSET,
                pending | 1 << (SECURE_PSCI_REPLY_CHANNEL * 2),
            );

            mmio::write32(message, u32::from(b'c'));
        }
    }
}

static MHU_DOORBELL: MhuDoorbell = MhuDoorbell {
    base: MAILBOX_REG_BASE,
};

static INTERCONNECT: Once<SnoopControl> = Once::new();
static DIRECT_OPS: Once<K1xPowerOps> = Once::new();

/// Cold-boot platform setup on the primary hart.
///
/// Brings up the interconnect, the data cache and the hardware-assisted L2
/// flush, then tries to initialise the SCMI driver. Returns the power backend
/// to install: the SCMI-backed one when the SCP answered the probe, the
/// direct one otherwise.
pub fn setup() -> &'static dyn PowerOperations {
    let interconnect = INTERCONNECT.call_once(|| {
        // SAFETY: `CCI_BASE` is the interconnect register frame on this SoC.
        unsafe { SnoopControl::new(CCI_BASE, &CCI_MASTER_MAP) }
    });

    cache::enable_dcache();

    // The boot cluster joins the snoop domain now; the second cluster joins
    // when it first powers on.
    interconnect
        .enable_snoop_dvm(0)
        .expect("cluster 0 is mapped on the interconnect");

    // Arm the hardware-assisted L2 flush in every cluster idle sequence.
    for cluster in PMU_CLUSTER_IDLE_CFG {
        for reg in cluster {
            // SAFETY: The registers are cluster idle-configuration registers.
            unsafe {
                rmw_set(reg, L2_HARDWARE_FLUSH_EN_BIT);
            }
        }
    }

    let direct = DIRECT_OPS.call_once(|| K1xPowerOps { interconnect });

    let mailbox = NonNull::new(SCMI_MAILBOX_MEM as *mut Mailbox).unwrap();
    // SAFETY: The mailbox window is the SCMI shared memory on this SoC, only
    // otherwise touched by the SCP per the channel protocol.
    let channel = ScmiChannel::new(unsafe { Channel::new(mailbox, &MHU_DOORBELL) });

    match ScmiHandle::init(channel) {
        Ok(handle) => match scp::override_power_ops(handle, interconnect) {
            Ok(ops) => return ops,
            Err(status) => error!("SCMI power operations unavailable: {status:?}"),
        },
        Err(status) => error!("SCMI initialization failed: {status:?}"),
    }

    direct
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hart_id_to_core_position() {
        assert_eq!(Some(0), K1x::core_position(0));
        assert_eq!(Some(3), K1x::core_position(3));
        // Cluster 1 starts at hart id 4.
        assert_eq!(Some(4), K1x::core_position(0x4));
        assert_eq!(Some(7), K1x::core_position(0x7));

        // Cluster 2 does not exist.
        assert_eq!(None, K1x::core_position(0x8));
        assert_eq!(None, K1x::core_position(0x40));
    }

    #[test]
    fn cluster_decomposition() {
        assert_eq!(0, K1x::cluster_index(3));
        assert_eq!(1, K1x::cluster_index(6));
        assert_eq!(2, K1x::core_in_cluster(6));
    }
}
