// Copyright The K1 PSCI Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Snoop and DVM control for the cache-coherent interconnect.
//!
//! Each cluster is a master on the interconnect and owes it a slave interface.
//! Before a cluster powers down its snoop and DVM participation must be
//! withdrawn, and it must be re-enabled before the cluster touches coherent
//! memory again. Both directions write the slave interface's snoop-control
//! register and then wait for the interconnect to acknowledge the change.

use crate::{mmio, riscv64::fence_rw_rw};
use bitflags::bitflags;

/// Offset of the first slave interface from the interconnect base.
const SLAVE_IFACE0_OFFSET: usize = 0x1000;
/// Size of one slave interface register frame.
const SLAVE_IFACE_STRIDE: usize = 0x1000;
/// Snoop control register offset within a slave interface frame.
const SNOOP_CTRL_REG: usize = 0x0;
/// Global status register offset from the interconnect base.
const STATUS_REG: usize = 0xc;

bitflags! {
    /// Snoop-control register bits.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    struct SnoopCtrl: u32 {
        const SNOOP_EN = 1 << 0;
        const DVM_EN = 1 << 1;
    }
}

/// Status register bit indicating a snoop/DVM change is still propagating.
const CHANGE_PENDING_BIT: u32 = 1 << 0;

/// Errors reported by the snoop controller.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InterconnectError {
    /// The master id maps to no slave interface on this interconnect.
    InvalidMaster,
}

/// Driver for the interconnect's per-master snoop and DVM switches.
pub struct SnoopControl {
    base: usize,
    /// Maps each master id to its slave interface index, or `None` for
    /// masters without a snoop-capable interface.
    master_map: &'static [Option<usize>],
}

impl SnoopControl {
    /// Creates a driver for the interconnect at `base`.
    ///
    /// # Safety
    ///
    /// `base` must be the base address of the interconnect's register frame
    /// and must stay mapped for the lifetime of the returned value.
    pub const unsafe fn new(base: usize, master_map: &'static [Option<usize>]) -> Self {
        Self { base, master_map }
    }

    fn slave_iface(&self, master_id: usize) -> Result<usize, InterconnectError> {
        let index = self
            .master_map
            .get(master_id)
            .copied()
            .flatten()
            .ok_or(InterconnectError::InvalidMaster)?;
        Ok(self.base + SLAVE_IFACE0_OFFSET + index * SLAVE_IFACE_STRIDE + SNOOP_CTRL_REG)
    }

    /// Waits until the interconnect has finished propagating a snoop or DVM
    /// change.
    fn wait_for_settle(&self) {
        fence_rw_rw();
        // SAFETY: `self.base` is a valid interconnect register frame per the
        // `new` contract.
        while unsafe { mmio::read32(self.base + STATUS_REG) } & CHANGE_PENDING_BIT != 0 {
            core::hint::spin_loop();
        }
    }

    /// Enables snoops and DVM messages for the given master.
    pub fn enable_snoop_dvm(&self, master_id: usize) -> Result<(), InterconnectError> {
        let reg = self.slave_iface(master_id)?;
        // The remaining register bits are write-ignore, no read-modify-write
        // needed.
        // SAFETY: `reg` is a snoop-control register within the frame mapped
        // per the `new` contract.
        unsafe {
            mmio::write32(reg, (SnoopCtrl::DVM_EN | SnoopCtrl::SNOOP_EN).bits());
        }
        self.wait_for_settle();
        Ok(())
    }

    /// Disables snoops and DVM messages for the given master.
    pub fn disable_snoop_dvm(&self, master_id: usize) -> Result<(), InterconnectError> {
        let reg = self.slave_iface(master_id)?;
        // SAFETY: As for `enable_snoop_dvm`.
        unsafe {
            mmio::write32(reg, SnoopCtrl::empty().bits());
        }
        self.wait_for_settle();
        Ok(())
    }
}

// SAFETY: The driver only holds a device address; concurrent snoop-control
// writes from several harts are serialised by the interconnect itself.
unsafe impl Sync for SnoopControl {}
