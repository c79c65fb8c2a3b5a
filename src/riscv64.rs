// Copyright The K1 PSCI Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! RISC-V barriers, wait-for-interrupt and M-mode CSR helpers.
//!
//! Everything here compiles to a no-op (or reads a fake) when the crate is
//! built for the host, so that the rest of the crate can be unit tested
//! without a target machine.

#[cfg(all(target_arch = "riscv64", not(test)))]
use core::arch::asm;

/// Machine interrupt-enable bits masked before a hart commits to power-down.
///
/// SSIP | MSIP | STIP | MTIP | SEIP | MEIP.
#[cfg(all(target_arch = "riscv64", not(test)))]
const INTERRUPT_ENABLE_MASK: usize = 0xaaa;

/// Supervisor software, timer and external interrupt pending bits in `mip`.
#[cfg(all(target_arch = "riscv64", not(test)))]
const SUPERVISOR_PENDING_MASK: usize = 0x222;

/// Issues a full memory fence (`fence rw, rw`).
pub fn fence_rw_rw() {
    // SAFETY: `fence` does not violate safe Rust guarantees.
    #[cfg(all(target_arch = "riscv64", not(test)))]
    unsafe {
        asm!("fence rw, rw", options(nostack));
    }
}

/// Issues a device I/O ordering fence (`fence iorw, iorw`).
pub fn fence_iorw() {
    // SAFETY: `fence` does not violate safe Rust guarantees.
    #[cfg(all(target_arch = "riscv64", not(test)))]
    unsafe {
        asm!("fence iorw, iorw", options(nostack));
    }
}

/// Issues an instruction-fetch fence (`fence.i`).
pub fn fence_i() {
    // SAFETY: `fence.i` does not violate safe Rust guarantees.
    #[cfg(all(target_arch = "riscv64", not(test)))]
    unsafe {
        asm!("fence.i", options(nostack));
    }
}

/// Waits for an interrupt.
pub fn wfi() {
    // SAFETY: `wfi` does not violate safe Rust guarantees.
    #[cfg(all(target_arch = "riscv64", not(test)))]
    unsafe {
        asm!("wfi", options(nostack));
    }
}

/// Returns the hart id of the calling hart.
#[cfg(all(target_arch = "riscv64", not(test)))]
pub fn hart_id() -> usize {
    let hart_id;
    // SAFETY: Reading `mhartid` has no side effects.
    unsafe {
        asm!("csrr {}, mhartid", out(reg) hart_id, options(nomem, nostack));
    }
    hart_id
}

/// Returns the hart id of the calling hart.
#[cfg(test)]
pub fn hart_id() -> usize {
    fake::CURRENT_HART.load(core::sync::atomic::Ordering::Relaxed)
}

/// Returns the hart id of the calling hart.
#[cfg(all(not(target_arch = "riscv64"), not(test)))]
pub fn hart_id() -> usize {
    unimplemented!("hart_id is only available on riscv64 targets");
}

/// Returns whether a supervisor software, timer or external interrupt is
/// pending on the calling hart.
#[cfg(all(target_arch = "riscv64", not(test)))]
pub fn supervisor_interrupts_pending() -> bool {
    let mip: usize;
    // SAFETY: Reading `mip` has no side effects.
    unsafe {
        asm!("csrr {}, mip", out(reg) mip, options(nomem, nostack));
    }
    mip & SUPERVISOR_PENDING_MASK != 0
}

/// Returns whether a supervisor software, timer or external interrupt is
/// pending on the calling hart.
#[cfg(test)]
pub fn supervisor_interrupts_pending() -> bool {
    fake::PENDING_INTERRUPTS.load(core::sync::atomic::Ordering::Relaxed)
}

/// Returns whether a supervisor software, timer or external interrupt is
/// pending on the calling hart.
#[cfg(all(not(target_arch = "riscv64"), not(test)))]
pub fn supervisor_interrupts_pending() -> bool {
    unimplemented!("mip is only available on riscv64 targets");
}

/// Masks every machine interrupt enable on the calling hart.
pub fn mask_interrupt_enables() {
    // SAFETY: Masking interrupt enables cannot break memory safety; the
    // caller is giving up the hart.
    #[cfg(all(target_arch = "riscv64", not(test)))]
    unsafe {
        asm!("csrc mie, {}", in(reg) INTERRUPT_ENABLE_MASK, options(nostack));
    }
}

/// Masks all local interrupt sources ahead of a power-down commitment.
///
/// Clears every machine interrupt enable, drops any latched external interrupt
/// pending bits and parks the supervisor timer (Sstc `stimecmp`) so that a
/// stale timer programming cannot wake the hart while it is being powered off.
pub fn quiesce_local_interrupts() {
    mask_interrupt_enables();
    // SAFETY: Clearing pending bits and parking the supervisor timer cannot
    // break memory safety; the caller is giving up the hart.
    #[cfg(all(target_arch = "riscv64", not(test)))]
    unsafe {
        // External interrupt pendings, then stimecmp.
        asm!("csrc mip, {}", in(reg) 0xa00usize, options(nostack));
        asm!("csrw 0x14d, {}", in(reg) u64::MAX, options(nostack));
    }
}
