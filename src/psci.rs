// Copyright The K1 PSCI Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! The power-state coordination engine and the PSCI operation handlers.
//!
//! A hart that powers itself down never returns from the call: it parks in
//! the platform's power-down loop and re-enters firmware through a reset
//! vector. The boot path must call [`Psci::warm_boot_entrypoint`] on every
//! hart that comes out of reset; it finishes the pending `CPU_ON` or suspend
//! operation from the other side and walks the tree back to the running
//! state.
//!
//! Per-CPU state (affinity info, suspend level, local power state) lives in
//! per-hart records that are read and written by harts with their data cache
//! disabled, so every cross-hart-visible mutation is pushed out to main
//! memory with an explicit clean+invalidate.

pub mod power_domain_tree;

use crate::{
    cache,
    cache::L2FlushMode,
    platform::{Platform, PlatformImpl, PowerOperations},
    riscv64::{self, fence_iorw, fence_rw_rw, wfi},
};
use core::ptr::NonNull;
use log::{info, warn};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use power_domain_tree::{AncestorPowerDomains, PowerDomainTree};

/// PSCI return codes surfaced to the dispatcher.
#[derive(Clone, Copy, Debug, Eq, IntoPrimitive, PartialEq)]
#[repr(i32)]
pub enum ErrorCode {
    /// The operation is not supported.
    NotSupported = -1,
    /// A parameter was malformed: bad power-state word, unknown affinity, or
    /// an unsupported affinity level.
    InvalidParameters = -2,
    /// The operation was refused: an early power-down veto, or a system
    /// suspend attempted while other harts are still on.
    Denied = -3,
    /// `CPU_ON` targeted a hart that is already on.
    AlreadyOn = -4,
    /// `CPU_ON` targeted a hart with a power-on already in flight.
    OnPending = -5,
    /// The platform power controller failed internally.
    InternalFailure = -6,
}

/// Local power state of a single power domain.
///
/// The discriminants order the states from shallowest to deepest, which is
/// what the coordination rule minimises over.
#[derive(
    Clone, Copy, Debug, Eq, IntoPrimitive, Ord, PartialEq, PartialOrd, TryFromPrimitive,
)]
#[repr(u8)]
pub enum LocalState {
    /// The domain is running.
    Run = 0,
    /// The domain is in a retention state: powered, context preserved.
    Retention = 1,
    /// The domain is powered off.
    Off = 2,
}

impl LocalState {
    /// The deepest retention state; anything deeper is a power-down.
    pub const MAX_RET_STATE: Self = Self::Retention;

    /// The broad class of this state.
    pub fn power_state_type(self) -> PowerStateType {
        match self {
            Self::Run => PowerStateType::Run,
            Self::Retention => PowerStateType::StandbyOrRetention,
            Self::Off => PowerStateType::PowerDown,
        }
    }

    /// Whether this is the running state.
    pub fn is_run(self) -> bool {
        self == Self::Run
    }

    /// Whether this state loses context.
    pub fn is_off(self) -> bool {
        self > Self::MAX_RET_STATE
    }
}

/// The broad class of a power state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PowerStateType {
    /// Running.
    Run,
    /// Standby or retention: context preserved, wakes by interrupt.
    StandbyOrRetention,
    /// Power-down: context lost, wakes through reset.
    PowerDown,
}

/// The affinity state of a CPU as visible to other CPUs.
///
/// The discriminants are the `AFFINITY_INFO` wire encoding.
#[derive(Clone, Copy, Debug, Eq, IntoPrimitive, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum AffinityInfo {
    /// The CPU is on.
    On = 0,
    /// The CPU is off.
    Off = 1,
    /// A `CPU_ON` has been issued and the CPU has not warm booted yet.
    OnPending = 2,
}

/// The non-secure execution state a CPU enters on wakeup.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EntryPoint {
    /// Resume program counter.
    pub pc: usize,
    /// Opaque context value handed back in a register.
    pub context_id: usize,
}

/// Why a warm-booting hart woke up.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WakeUpReason {
    /// A `CPU_ON` targeting this hart completed.
    CpuOn(EntryPoint),
    /// A power-down suspend completed.
    SuspendFinished(EntryPoint),
}

/// Per-CPU power bookkeeping, one per hart, placed in per-hart scratch memory
/// so that it stays reachable with the data cache disabled.
///
/// Only the owning CPU, or a CPU holding the owner's `cpu_lock`, may mutate a
/// record.
#[derive(Clone, Copy, Debug)]
#[repr(C, align(64))]
pub struct PerCpuRecord {
    aff_info_state: AffinityInfo,
    target_power_level: u8,
    local_state: LocalState,
}

impl PerCpuRecord {
    /// Marker for "no suspend in progress" in `target_power_level`.
    const INVALID_POWER_LEVEL: u8 = u8::MAX;

    /// An off, idle record, the state before a CPU is first released from
    /// reset.
    pub const fn new() -> Self {
        Self {
            aff_info_state: AffinityInfo::Off,
            target_power_level: Self::INVALID_POWER_LEVEL,
            local_state: LocalState::Off,
        }
    }
}

impl Default for PerCpuRecord {
    fn default() -> Self {
        Self::new()
    }
}

/// The PSCI power-state word: bits 0..=15 state id (must be zero), bit 16 the
/// type (0 standby, 1 power-down), bits 24..=25 the power level.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PowerStateWord(u32);

const PSTATE_ID_MASK: u32 = 0xffff;
const PSTATE_TYPE_BIT: u32 = 1 << 16;
const PSTATE_LEVEL_SHIFT: u32 = 24;
const PSTATE_LEVEL_MASK: u32 = 0x3;
/// Bits that must be zero in a valid power-state word.
const PSTATE_RESERVED_MASK: u32 =
    !(PSTATE_ID_MASK | PSTATE_TYPE_BIT | PSTATE_LEVEL_MASK << PSTATE_LEVEL_SHIFT);

/// Type bit position in the RISC-V `hart_suspend` encoding of the word.
const RSTATE_TYPE_BIT: u32 = 1 << 31;

impl PowerStateWord {
    /// Wraps a raw word already in the canonical layout.
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Translates the RISC-V `hart_suspend` form (bit 31 type, bits 24..=25
    /// level) into the canonical layout.
    pub const fn from_riscv(raw: u32) -> Self {
        let mut word = 0;
        if raw & RSTATE_TYPE_BIT != 0 {
            word |= PSTATE_TYPE_BIT;
        }
        word |= raw & (PSTATE_LEVEL_MASK << PSTATE_LEVEL_SHIFT);
        Self(word)
    }

    /// A canonical power-down request up to `level`.
    pub const fn power_down(level: usize) -> Self {
        Self(PSTATE_TYPE_BIT | (level as u32 & PSTATE_LEVEL_MASK) << PSTATE_LEVEL_SHIFT)
    }

    /// A canonical standby request at `level`.
    pub const fn standby(level: usize) -> Self {
        Self((level as u32 & PSTATE_LEVEL_MASK) << PSTATE_LEVEL_SHIFT)
    }

    /// The raw canonical encoding.
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// The state id field, which must be zero on this platform.
    pub const fn state_id(self) -> u32 {
        self.0 & PSTATE_ID_MASK
    }

    /// The requested power level.
    pub const fn power_level(self) -> usize {
        ((self.0 >> PSTATE_LEVEL_SHIFT) & PSTATE_LEVEL_MASK) as usize
    }

    /// Whether this is a power-down (context-losing) request.
    pub const fn is_power_down(self) -> bool {
        self.0 & PSTATE_TYPE_BIT != 0
    }

    /// Whether all reserved bits are zero.
    pub const fn reserved_bits_clear(self) -> bool {
        self.0 & PSTATE_RESERVED_MASK == 0
    }
}

/// Parses a canonical power-state word into the per-level requested states.
///
/// Standby is only possible at the CPU level; a power-down request turns off
/// every level from the CPU up to the requested one. The state id must be
/// zero.
pub fn parse_power_state(word: PowerStateWord) -> Result<CompositePowerState, ErrorCode> {
    if !word.reserved_bits_clear() {
        return Err(ErrorCode::InvalidParameters);
    }

    let level = word.power_level();
    if level > PlatformImpl::MAX_POWER_LEVEL {
        return Err(ErrorCode::InvalidParameters);
    }

    let mut composite = CompositePowerState::RUN;
    if word.is_power_down() {
        for state in &mut composite.states[..=level] {
            *state = LocalState::Off;
        }
    } else {
        if level != CompositePowerState::CPU_POWER_LEVEL {
            return Err(ErrorCode::InvalidParameters);
        }
        composite.states[CompositePowerState::CPU_POWER_LEVEL] = LocalState::Retention;
    }

    if word.state_id() != 0 {
        return Err(ErrorCode::InvalidParameters);
    }

    Ok(composite)
}

/// The local power state of every level from the CPU up to the top of the
/// tree.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CompositePowerState {
    /// One state per power level, index 0 being the CPU.
    pub states: [LocalState; PlatformImpl::MAX_POWER_LEVEL + 1],
}

impl CompositePowerState {
    /// The power level of a CPU.
    pub const CPU_POWER_LEVEL: usize = 0;

    /// All levels off.
    pub const OFF: Self = Self {
        states: [LocalState::Off; PlatformImpl::MAX_POWER_LEVEL + 1],
    };

    /// All levels running.
    pub const RUN: Self = Self {
        states: [LocalState::Run; PlatformImpl::MAX_POWER_LEVEL + 1],
    };

    /// The CPU-level state.
    pub fn cpu_level_state(&self) -> LocalState {
        self.states[Self::CPU_POWER_LEVEL]
    }

    /// The state of the highest level in the tree.
    pub fn highest_level_state(&self) -> LocalState {
        self.states[PlatformImpl::MAX_POWER_LEVEL]
    }

    /// The highest level not in the running state.
    pub fn find_highest_non_run_level(&self) -> Option<usize> {
        self.states.iter().rposition(|state| !state.is_run())
    }

    /// The highest level in a power-down state.
    pub fn find_max_off_level(&self) -> Option<usize> {
        self.states.iter().rposition(|state| state.is_off())
    }

    /// Checks that a suspend request does not violate the power-state rules:
    /// some level must leave the running state, no level may request a
    /// shallower state than the level above it, and the request type must
    /// match the deepest state.
    pub fn is_valid_suspend_request(&self, is_power_down: bool) -> bool {
        if self.find_highest_non_run_level().is_none() {
            return false;
        }

        // Deeper (greater) states must sit at lower levels.
        if !self.states.is_sorted_by(|below, above| below >= above) {
            return false;
        }

        if is_power_down {
            self.find_max_off_level().is_some()
        } else {
            self.find_max_off_level().is_none()
        }
    }

    /// Reads back the states the CPU and its locked ancestors currently hold.
    /// Levels above the locked chain are reported as running.
    fn set_from_current_states(&mut self, cpu_index: usize, ancestors: &AncestorPowerDomains) {
        self.states = [LocalState::Run; PlatformImpl::MAX_POWER_LEVEL + 1];
        self.states[Self::CPU_POWER_LEVEL] = Records::local_state(cpu_index);

        for (node, state) in ancestors
            .iter()
            .zip(&mut self.states[Self::CPU_POWER_LEVEL + 1..])
        {
            *state = node.local_state();
        }
    }

    /// Runs one coordination pass for `cpu_index` over its locked ancestors.
    ///
    /// Each level records the caller's requested state and adopts the
    /// shallowest state any descendant CPU requested. Once a level negotiates
    /// to running, every level above it is forced to running too (while still
    /// persisting the caller's request). Each touched node is flushed before
    /// the locks are released so that cache-disabled observers see the
    /// decision.
    pub fn coordinate(&mut self, cpu_index: usize, ancestors: &mut AncestorPowerDomains) {
        let mut higher_levels_are_run = false;

        for (node, state) in ancestors
            .iter_mut()
            .zip(&mut self.states[Self::CPU_POWER_LEVEL + 1..])
        {
            node.set_requested_power_state(cpu_index, *state);

            if !higher_levels_are_run {
                node.set_coordinated_state();
                *state = node.local_state();

                if state.is_run() {
                    higher_levels_are_run = true;
                }
            } else {
                *state = LocalState::Run;
                node.set_local_state(LocalState::Run);
            }

            cache::clean_invalidate_object(&**node);
        }
    }
}

/// Volatile, cache-maintained access to the per-CPU records.
///
/// Reads of another CPU's record flush the line first: the target may have
/// written it with its cache disabled, and our own cached copy may predate
/// the target's cluster leaving coherency.
struct Records;

impl Records {
    fn record(cpu_index: usize) -> NonNull<PerCpuRecord> {
        PlatformImpl::per_cpu_record(cpu_index)
    }

    /// Resets a record to the power-off default and flushes it.
    fn reset(cpu_index: usize) {
        let record = Self::record(cpu_index);
        // SAFETY: The platform guarantees the record pointer is valid and
        // this is only called before secondary harts are released.
        unsafe {
            record.as_ptr().write_volatile(PerCpuRecord::new());
        }
        cache::clean_invalidate_range(record.as_ptr() as usize, size_of::<PerCpuRecord>());
    }

    fn aff_info(cpu_index: usize) -> AffinityInfo {
        let record = Self::record(cpu_index);
        // SAFETY: The record pointer is valid for the platform's lifetime and
        // the field only ever holds valid `AffinityInfo` values.
        unsafe { (&raw const (*record.as_ptr()).aff_info_state).read_volatile() }
    }

    /// Reads another CPU's affinity state, flushing the stale local copy
    /// first.
    fn aff_info_flushed(cpu_index: usize) -> AffinityInfo {
        let record = Self::record(cpu_index);
        // SAFETY: The record pointer is valid for the platform's lifetime.
        let field = unsafe { &raw const (*record.as_ptr()).aff_info_state };
        cache::clean_invalidate_range(field as usize, size_of::<AffinityInfo>());
        // SAFETY: As for `aff_info`.
        unsafe { field.read_volatile() }
    }

    fn set_aff_info(cpu_index: usize, state: AffinityInfo) {
        let record = Self::record(cpu_index);
        // SAFETY: The record pointer is valid for the platform's lifetime.
        let field = unsafe { &raw mut (*record.as_ptr()).aff_info_state };
        // SAFETY: The caller owns the record per the locking rules.
        unsafe {
            field.write_volatile(state);
        }
        cache::clean_invalidate_range(field as usize, size_of::<AffinityInfo>());
    }

    /// Publishes an affinity state from a hart whose data cache is already
    /// disabled. The write goes straight to memory; the bracketing
    /// maintenance makes sure no cached copy survives to shadow it.
    fn set_aff_info_cache_off(cpu_index: usize, state: AffinityInfo) {
        let record = Self::record(cpu_index);
        // SAFETY: The record pointer is valid for the platform's lifetime.
        let field = unsafe { &raw mut (*record.as_ptr()).aff_info_state };
        cache::clean_invalidate_range(field as usize, size_of::<AffinityInfo>());
        // SAFETY: As for `set_aff_info`.
        unsafe {
            field.write_volatile(state);
        }
        fence_rw_rw();
        cache::invalidate_range(field as usize, size_of::<AffinityInfo>());
    }

    fn local_state(cpu_index: usize) -> LocalState {
        let record = Self::record(cpu_index);
        // SAFETY: The record pointer is valid and the field only ever holds
        // valid `LocalState` values.
        unsafe { (&raw const (*record.as_ptr()).local_state).read_volatile() }
    }

    fn set_local_state(cpu_index: usize, state: LocalState) {
        let record = Self::record(cpu_index);
        // SAFETY: The record pointer is valid for the platform's lifetime.
        let field = unsafe { &raw mut (*record.as_ptr()).local_state };
        // SAFETY: The record pointer is valid and only the owning CPU writes
        // its local state.
        unsafe {
            field.write_volatile(state);
        }
        cache::clean_invalidate_range(field as usize, size_of::<LocalState>());
    }

    fn target_power_level(cpu_index: usize) -> Option<usize> {
        let record = Self::record(cpu_index);
        // SAFETY: The record pointer is valid.
        let level = unsafe { (&raw const (*record.as_ptr()).target_power_level).read_volatile() };
        if level == PerCpuRecord::INVALID_POWER_LEVEL {
            None
        } else {
            Some(level as usize)
        }
    }

    fn set_target_power_level(cpu_index: usize, level: Option<usize>) {
        let record = Self::record(cpu_index);
        // SAFETY: The record pointer is valid for the platform's lifetime.
        let field = unsafe { &raw mut (*record.as_ptr()).target_power_level };
        let value = match level {
            Some(level) => level as u8,
            None => PerCpuRecord::INVALID_POWER_LEVEL,
        };
        // SAFETY: The record pointer is valid and only the owning CPU writes
        // its suspend level.
        unsafe {
            field.write_volatile(value);
        }
        cache::clean_invalidate_range(field as usize, size_of::<u8>());
    }
}

/// The PSCI implementation: the power-domain tree plus the platform power
/// operations installed at setup time.
pub struct Psci {
    ops: &'static dyn PowerOperations,
    tree: PowerDomainTree,
}

impl Psci {
    /// Initialises the PSCI state on the primary hart.
    ///
    /// Must run exactly once, before any other method is called and before
    /// any secondary hart is released from reset. The calling hart becomes
    /// the single running CPU of the tree.
    pub fn new(ops: &'static dyn PowerOperations) -> Self {
        info!("Initializing PSCI");

        let tree = PowerDomainTree::new(PlatformImpl::topology());

        for cpu_index in 0..PlatformImpl::CORE_COUNT {
            Records::reset(cpu_index);
        }

        let psci = Self { ops, tree };

        let cpu_index = PlatformImpl::core_index();
        psci.tree.with_ancestors_locked(cpu_index, |mut ancestors| {
            psci.set_domains_to_run(cpu_index, &mut ancestors);
        });

        psci
    }

    /// Handles `CPU_ON`: releases the hart identified by `target_hart` from
    /// reset with `entry` as its non-secure entry point.
    pub fn cpu_on(&self, target_hart: usize, entry: EntryPoint) -> Result<(), ErrorCode> {
        let target = PlatformImpl::core_position(target_hart).ok_or(ErrorCode::InvalidParameters)?;

        let mut cpu = self.tree.locked_cpu_node(target);

        match Records::aff_info_flushed(target) {
            AffinityInfo::On => return Err(ErrorCode::AlreadyOn),
            AffinityInfo::OnPending => return Err(ErrorCode::OnPending),
            AffinityInfo::Off => {}
        }

        Records::set_aff_info(target, AffinityInfo::OnPending);

        // The target's own shutdown ends with a line invalidation which can
        // discard the update we just made; redo it if so.
        if Records::aff_info(target) != AffinityInfo::OnPending {
            assert_eq!(AffinityInfo::Off, Records::aff_info(target));
            Records::set_aff_info(target, AffinityInfo::OnPending);
            assert_eq!(AffinityInfo::OnPending, Records::aff_info(target));
        }

        match self.ops.power_domain_on(target_hart) {
            Ok(()) => {
                cpu.set_entry_point(entry);
                Ok(())
            }
            Err(error) => {
                Records::set_aff_info(target, AffinityInfo::Off);
                Err(error)
            }
        }
    }

    /// Handles `CPU_OFF`: powers the calling hart down, together with every
    /// ancestor domain whose other CPUs have also requested off.
    ///
    /// Returns only if the platform's early hook vetoes the operation;
    /// otherwise the hart parks in the power-down loop and re-enters through
    /// [`Self::warm_boot_entrypoint`] on the next `CPU_ON`.
    pub fn cpu_off(&self) -> Result<(), ErrorCode> {
        let cpu_index = PlatformImpl::core_index();
        let mut composite = CompositePowerState::OFF;

        // The early hook may still veto; it masks local interrupt delivery so
        // that no wakeup source fires between the veto point and the
        // power-down commitment.
        self.ops.power_domain_off_early(&composite)?;

        self.tree.with_ancestors_locked(cpu_index, |mut ancestors| {
            Records::set_local_state(cpu_index, LocalState::Off);
            composite.coordinate(cpu_index, &mut ancestors);

            Self::power_down_cache_maintenance(
                composite
                    .find_max_off_level()
                    .expect("CPU_OFF always powers down the CPU level"),
            );

            // Point of no return.
            self.ops.power_domain_off(&composite);
        });

        Records::set_aff_info_cache_off(cpu_index, AffinityInfo::Off);

        self.ops.power_domain_power_down_wfi(&composite)
    }

    /// Handles `CPU_SUSPEND`.
    ///
    /// `power_state` is the RISC-V `hart_suspend` encoding of the power-state
    /// word; it is translated to the canonical layout before validation. A
    /// retention-only request at the CPU level takes the standby fast path
    /// and never touches the tree; anything deeper runs a coordination pass.
    pub fn cpu_suspend(&self, power_state: u32, entry: EntryPoint) -> Result<(), ErrorCode> {
        let cpu_index = PlatformImpl::core_index();
        let word = PowerStateWord::from_riscv(power_state);

        let composite = self.ops.validate_power_state(word)?;
        let is_power_down = word.is_power_down();

        if !composite.is_valid_suspend_request(is_power_down) {
            return Err(ErrorCode::InvalidParameters);
        }

        let end_level = composite
            .find_highest_non_run_level()
            .ok_or(ErrorCode::InvalidParameters)?;

        if !is_power_down && end_level == CompositePowerState::CPU_POWER_LEVEL {
            // CPU standby does not affect parent domains.
            let cpu_state = composite.cpu_level_state();
            Records::set_local_state(cpu_index, cpu_state);

            self.ops.cpu_standby(cpu_state);
            // An interrupt woke the CPU.

            Records::set_local_state(cpu_index, LocalState::Run);
            return Ok(());
        }

        self.cpu_suspend_start(cpu_index, entry, end_level, composite, is_power_down)
    }

    /// The coordinated path shared by `CPU_SUSPEND` and `SYSTEM_SUSPEND`.
    fn cpu_suspend_start(
        &self,
        cpu_index: usize,
        entry: EntryPoint,
        end_level: usize,
        mut composite: CompositePowerState,
        is_power_down: bool,
    ) -> Result<(), ErrorCode> {
        let skip_wfi =
            self.tree
                .with_ancestors_locked_to_max_level(cpu_index, end_level, |mut ancestors| {
                    // A wakeup that raced the call aborts the suspend before
                    // any state is committed. The lock acquisition above adds
                    // delay, so check late.
                    if riscv64::supervisor_interrupts_pending() {
                        return true;
                    }

                    Records::set_local_state(cpu_index, composite.cpu_level_state());
                    composite.coordinate(cpu_index, &mut ancestors);

                    if is_power_down {
                        // The warm boot needs the suspend level with caches
                        // still off.
                        Records::set_target_power_level(cpu_index, Some(end_level));
                        self.tree.locked_cpu_node(cpu_index).set_entry_point(entry);

                        self.ops.power_domain_suspend_powerdown_early(&composite);

                        Self::power_down_cache_maintenance(
                            composite
                                .find_max_off_level()
                                .expect("power-down suspend turns off the CPU level"),
                        );
                    }

                    self.ops.power_domain_suspend(&composite);
                    false
                });

        if skip_wfi {
            return Ok(());
        }

        if is_power_down {
            // Parks until reset; the wakeup resumes in warm_boot_entrypoint.
            self.ops.power_domain_power_down_wfi(&composite)
        } else {
            wfi();

            self.suspend_to_standby_finisher(cpu_index, end_level);
            Ok(())
        }
    }

    /// Unwinds a retention suspend after the wakeup interrupt.
    fn suspend_to_standby_finisher(&self, cpu_index: usize, end_level: usize) {
        self.tree
            .with_ancestors_locked_to_max_level(cpu_index, end_level, |mut ancestors| {
                // The states exited may be deeper than the ones entered if
                // other CPUs coordinated while this one was asleep.
                let mut composite = CompositePowerState::RUN;
                composite.set_from_current_states(cpu_index, &ancestors);

                self.ops.power_domain_suspend_finish(&composite);

                self.set_domains_to_run(cpu_index, &mut ancestors);
            });
    }

    /// Handles `AFFINITY_INFO` for `target_hart`.
    ///
    /// Only the CPU affinity level is supported.
    pub fn affinity_info(
        &self,
        target_hart: usize,
        lowest_affinity_level: u32,
    ) -> Result<AffinityInfo, ErrorCode> {
        if lowest_affinity_level as usize > CompositePowerState::CPU_POWER_LEVEL {
            return Err(ErrorCode::InvalidParameters);
        }

        let target = PlatformImpl::core_position(target_hart).ok_or(ErrorCode::InvalidParameters)?;

        Ok(Records::aff_info_flushed(target))
    }

    /// Handles `SYSTEM_SUSPEND`: suspends the whole system to RAM.
    ///
    /// Only the last running CPU may call this; the request powers down every
    /// level including the system domain.
    pub fn system_suspend(&self, entry: EntryPoint) -> Result<(), ErrorCode> {
        let cpu_index = PlatformImpl::core_index();

        if !self.is_last_on_cpu(cpu_index) {
            return Err(ErrorCode::Denied);
        }

        let composite = self.ops.sys_suspend_power_state();
        if composite.find_highest_non_run_level() != Some(PlatformImpl::MAX_POWER_LEVEL) {
            return Err(ErrorCode::Denied);
        }

        assert!(composite.is_valid_suspend_request(true));
        assert_eq!(
            PowerStateType::PowerDown,
            composite.highest_level_state().power_state_type()
        );

        self.cpu_suspend_start(
            cpu_index,
            entry,
            PlatformImpl::MAX_POWER_LEVEL,
            composite,
            true,
        )
    }

    /// The warm-boot entry, called on every hart that comes out of reset
    /// after cold boot.
    ///
    /// Returns `None` for a spurious wake (the hart never completed its
    /// suspend entry), otherwise finishes the pending `CPU_ON` or suspend and
    /// reports why the hart woke together with its non-secure entry point.
    pub fn warm_boot_entrypoint(&self) -> Option<WakeUpReason> {
        let cpu_index = PlatformImpl::core_index();

        // A wakeup source that fired while the suspend entry was still in
        // progress can reset-enter here with the tree state already running.
        if Records::local_state(cpu_index).is_run() {
            return None;
        }

        let aff_info = Records::aff_info(cpu_index);
        assert_ne!(
            AffinityInfo::Off,
            aff_info,
            "warm boot of a CPU that was never turned on"
        );

        // How far up the tree the suspend reached; a plain CPU_ON walks the
        // whole chain.
        let end_level =
            Records::target_power_level(cpu_index).unwrap_or(PlatformImpl::MAX_POWER_LEVEL);

        self.tree
            .with_ancestors_locked_to_max_level(cpu_index, end_level, |mut ancestors| {
                let mut composite = CompositePowerState::RUN;
                composite.set_from_current_states(cpu_index, &ancestors);

                if aff_info == AffinityInfo::OnPending {
                    // Finishing CPU_ON.
                    self.ops.power_domain_on_finish(&composite);
                    Self::power_up_cache_maintenance();
                    self.ops.power_domain_on_finish_late(&composite);

                    // Synchronise with the hart that issued the CPU_ON; it
                    // stores the entry point before dropping this lock.
                    drop(self.tree.locked_cpu_node(cpu_index));
                } else {
                    // Waking from a power-down suspend.
                    assert_eq!(
                        PowerStateType::PowerDown,
                        composite.cpu_level_state().power_state_type()
                    );

                    self.ops.power_domain_suspend_finish(&composite);
                    Self::power_up_cache_maintenance();

                    Records::set_target_power_level(cpu_index, None);
                }

                self.set_domains_to_run(cpu_index, &mut ancestors);
            });

        let entry = self
            .tree
            .locked_cpu_node(cpu_index)
            .pop_entry_point()
            .expect("entry point not set for a warm-booting CPU");

        if aff_info == AffinityInfo::OnPending {
            Some(WakeUpReason::CpuOn(entry))
        } else {
            Some(WakeUpReason::SuspendFinished(entry))
        }
    }

    /// Sets the CPU and its locked ancestors back to the running state,
    /// flushing every touched record and node.
    fn set_domains_to_run(&self, cpu_index: usize, ancestors: &mut AncestorPowerDomains) {
        Records::set_local_state(cpu_index, LocalState::Run);
        Records::set_aff_info(cpu_index, AffinityInfo::On);

        for node in ancestors.iter_mut() {
            node.set_requested_power_state(cpu_index, LocalState::Run);
            node.set_local_state(LocalState::Run);
            cache::clean_invalidate_object(&**node);
        }
    }

    /// Whether `cpu_index` is the only CPU still on.
    fn is_last_on_cpu(&self, cpu_index: usize) -> bool {
        for other in 0..PlatformImpl::CORE_COUNT {
            if other == cpu_index {
                assert_eq!(AffinityInfo::On, Records::aff_info(other));
                continue;
            }

            if Records::aff_info_flushed(other) != AffinityInfo::Off {
                warn!("CPU {other} is still on");
                return false;
            }
        }

        true
    }

    /// The power-down side of the warm-boot cache contract.
    ///
    /// Order matters: prefetch off, clean the whole D-cache, flush the L2 if
    /// any level above the CPU is going off, disable the D-cache, drop out of
    /// the snoop domain, then an I/O fence. No dirty line may survive past
    /// the snoop disable.
    fn power_down_cache_maintenance(max_off_level: usize) {
        let hart_id = riscv64::hart_id();

        cache::disable_data_prefetch();
        cache::flush_all();

        if max_off_level > CompositePowerState::CPU_POWER_LEVEL {
            PlatformImpl::l2_flush(
                PlatformImpl::cluster_index(hart_id),
                L2FlushMode::SoftwareRequest,
            );
        }

        cache::disable_dcache();
        cache::disable_core_snoop(PlatformImpl::core_in_cluster(hart_id));
        fence_iorw();
    }

    /// The power-up side of the warm-boot cache contract: drop everything the
    /// cache collected while it was architecturally off, then turn it on.
    fn power_up_cache_maintenance() {
        cache::invalidate_all();
        cache::enable_dcache();
    }
}

impl core::fmt::Debug for Psci {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        self.tree.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::test::{TEST_POWER_OPS, TestPowerOps, exclusive};
    use crate::riscv64::fake;
    use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};

    const ENTRY: EntryPoint = EntryPoint {
        pc: 0x8020_0000,
        context_id: 0xfedc_ba98,
    };

    /// Raw RISC-V suspend word: power-down up to `level`.
    const fn riscv_power_down(level: usize) -> u32 {
        1 << 31 | (level as u32) << 24
    }

    /// Raw RISC-V suspend word: CPU standby.
    const RISCV_STANDBY: u32 = 0;

    /// Runs a closure that is expected to end in the power-down loop, which
    /// the test backend models as a magic panic.
    fn expect_cpu_power_down<F>(f: F)
    where
        F: Fn(),
    {
        let result = catch_unwind(AssertUnwindSafe(f));

        match result {
            Err(payload) => {
                if let Some(message) = payload.downcast_ref::<String>()
                    && *message == TestPowerOps::POWER_DOWN_WFI_MAGIC
                {
                    return;
                }
                resume_unwind(payload);
            }
            Ok(()) => panic!("expected CPU power down did not happen"),
        }
    }

    /// Checks the CPU record and its ancestors against the expected states:
    /// `[cpu, cluster, system]`.
    fn check_states(psci: &Psci, cpu_index: usize, expected: &[LocalState; 3]) {
        assert_eq!(expected[0], Records::local_state(cpu_index));
        psci.tree.with_ancestors_locked(cpu_index, |ancestors| {
            for (node, state) in ancestors.iter().zip(&expected[1..]) {
                assert_eq!(*state, node.local_state());
            }
        });
    }

    /// Boots the given secondary CPU from the primary.
    fn boot_secondary(psci: &Psci, cpu_index: usize) {
        let caller = riscv64::hart_id();
        assert_eq!(Ok(()), psci.cpu_on(cpu_index, ENTRY));

        fake::set_hart_id(cpu_index);
        assert_eq!(
            Some(WakeUpReason::CpuOn(ENTRY)),
            psci.warm_boot_entrypoint()
        );
        fake::set_hart_id(caller);
    }

    #[test]
    fn power_state_word_round_trip() {
        for level in 0..=PlatformImpl::MAX_POWER_LEVEL {
            let word = PowerStateWord::power_down(level);
            assert!(word.is_power_down());
            assert_eq!(level, word.power_level());
            assert_eq!(0, word.state_id());
            assert!(word.reserved_bits_clear());
            assert_eq!(word, PowerStateWord::new(word.raw()));

            let word = PowerStateWord::standby(level);
            assert!(!word.is_power_down());
            assert_eq!(level, word.power_level());
        }
    }

    #[test]
    fn riscv_word_translation() {
        assert_eq!(
            PowerStateWord::power_down(1),
            PowerStateWord::from_riscv(riscv_power_down(1))
        );
        assert_eq!(
            PowerStateWord::standby(0),
            PowerStateWord::from_riscv(RISCV_STANDBY)
        );
        // The id bits of the riscv form are not carried over.
        assert_eq!(
            PowerStateWord::power_down(0),
            PowerStateWord::from_riscv(1 << 31 | 0xffff)
        );
    }

    #[test]
    fn parse_power_state_validation() {
        // A power level beyond the platform maximum.
        assert_eq!(
            Err(ErrorCode::InvalidParameters),
            parse_power_state(PowerStateWord::power_down(3))
        );
        // Standby above the CPU level.
        assert_eq!(
            Err(ErrorCode::InvalidParameters),
            parse_power_state(PowerStateWord::standby(1))
        );
        // Non-zero state id.
        assert_eq!(
            Err(ErrorCode::InvalidParameters),
            parse_power_state(PowerStateWord::new(PSTATE_TYPE_BIT | 1))
        );
        // Reserved bits set.
        assert_eq!(
            Err(ErrorCode::InvalidParameters),
            parse_power_state(PowerStateWord::new(1 << 20))
        );

        let composite = parse_power_state(PowerStateWord::power_down(1)).unwrap();
        assert_eq!(
            [LocalState::Off, LocalState::Off, LocalState::Run],
            composite.states
        );

        let composite = parse_power_state(PowerStateWord::standby(0)).unwrap();
        assert_eq!(
            [LocalState::Retention, LocalState::Run, LocalState::Run],
            composite.states
        );
    }

    #[test]
    fn composite_power_state_levels() {
        let mut composite = CompositePowerState::OFF;
        assert_eq!(LocalState::Off, composite.cpu_level_state());
        assert_eq!(LocalState::Off, composite.highest_level_state());
        assert_eq!(
            Some(PlatformImpl::MAX_POWER_LEVEL),
            composite.find_max_off_level()
        );

        composite.states[PlatformImpl::MAX_POWER_LEVEL] = LocalState::Run;
        assert_eq!(
            Some(PlatformImpl::MAX_POWER_LEVEL - 1),
            composite.find_highest_non_run_level()
        );

        let composite = CompositePowerState::RUN;
        assert_eq!(None, composite.find_highest_non_run_level());
        assert_eq!(None, composite.find_max_off_level());
    }

    #[test]
    fn composite_suspend_request_validation() {
        // All running: no suspend at all.
        assert!(!CompositePowerState::RUN.is_valid_suspend_request(false));

        // All off is a power-down request, not a retention one.
        assert!(CompositePowerState::OFF.is_valid_suspend_request(true));
        assert!(!CompositePowerState::OFF.is_valid_suspend_request(false));

        // A running CPU below an off cluster is inconsistent.
        let mut composite = CompositePowerState::OFF;
        composite.states[CompositePowerState::CPU_POWER_LEVEL] = LocalState::Run;
        assert!(!composite.is_valid_suspend_request(true));

        // Retention at the CPU level only.
        let mut composite = CompositePowerState::RUN;
        composite.states[CompositePowerState::CPU_POWER_LEVEL] = LocalState::Retention;
        assert!(composite.is_valid_suspend_request(false));
        assert!(!composite.is_valid_suspend_request(true));
    }

    #[test]
    fn cpu_on_and_warm_boot() {
        let _lock = exclusive();
        let psci = Psci::new(&TEST_POWER_OPS);

        assert_eq!(
            Err(ErrorCode::InvalidParameters),
            psci.cpu_on(0x99, ENTRY)
        );

        assert_eq!(Ok(()), psci.cpu_on(1, ENTRY));
        assert_eq!(Err(ErrorCode::OnPending), psci.cpu_on(1, ENTRY));
        assert_eq!(Ok(AffinityInfo::OnPending), psci.affinity_info(1, 0));

        fake::set_hart_id(1);
        assert_eq!(
            Some(WakeUpReason::CpuOn(ENTRY)),
            psci.warm_boot_entrypoint()
        );

        fake::set_hart_id(0);
        assert_eq!(Ok(AffinityInfo::On), psci.affinity_info(1, 0));
        assert_eq!(Err(ErrorCode::AlreadyOn), psci.cpu_on(1, ENTRY));

        // The target runs at every level.
        check_states(&psci, 1, &[LocalState::Run, LocalState::Run, LocalState::Run]);
    }

    #[test]
    fn affinity_info_validation() {
        let _lock = exclusive();
        let psci = Psci::new(&TEST_POWER_OPS);

        // Only the CPU affinity level is supported.
        assert_eq!(Err(ErrorCode::InvalidParameters), psci.affinity_info(1, 1));
        assert_eq!(
            Err(ErrorCode::InvalidParameters),
            psci.affinity_info(0x99, 0)
        );
        assert_eq!(Ok(AffinityInfo::Off), psci.affinity_info(1, 0));
        assert_eq!(Ok(AffinityInfo::On), psci.affinity_info(0, 0));
    }

    #[test]
    fn cpu_off_keeps_cluster_running_while_siblings_run() {
        let _lock = exclusive();
        let psci = Psci::new(&TEST_POWER_OPS);

        boot_secondary(&psci, 1);

        fake::set_hart_id(1);
        expect_cpu_power_down(|| {
            let _ = psci.cpu_off();
        });

        fake::set_hart_id(0);
        assert_eq!(Ok(AffinityInfo::Off), psci.affinity_info(1, 0));

        // CPU0 still runs under the same cluster, so the cluster and the
        // system stay up.
        check_states(&psci, 1, &[LocalState::Off, LocalState::Run, LocalState::Run]);
    }

    #[test]
    fn cluster_powers_off_with_its_last_cpu() {
        let _lock = exclusive();
        let psci = Psci::new(&TEST_POWER_OPS);

        for cpu_index in 4..8 {
            boot_secondary(&psci, cpu_index);
        }

        for cpu_index in 4..8 {
            fake::set_hart_id(cpu_index);
            expect_cpu_power_down(|| {
                let _ = psci.cpu_off();
            });

            let expected_cluster = if cpu_index == 7 {
                // The last CPU of the cluster takes the cluster down.
                LocalState::Off
            } else {
                LocalState::Run
            };
            check_states(
                &psci,
                cpu_index,
                &[LocalState::Off, expected_cluster, LocalState::Run],
            );
        }

        fake::set_hart_id(0);
        for cpu_index in 4..8 {
            assert_eq!(Ok(AffinityInfo::Off), psci.affinity_info(cpu_index, 0));
        }
    }

    #[test]
    fn cpu_suspend_standby_fast_path() {
        let _lock = exclusive();
        let psci = Psci::new(&TEST_POWER_OPS);

        assert_eq!(Ok(()), psci.cpu_suspend(RISCV_STANDBY, ENTRY));

        // Back to running, tree untouched.
        check_states(&psci, 0, &[LocalState::Run, LocalState::Run, LocalState::Run]);
    }

    #[test]
    fn cpu_suspend_rejects_bad_power_state() {
        let _lock = exclusive();
        let psci = Psci::new(&TEST_POWER_OPS);

        assert_eq!(
            Err(ErrorCode::InvalidParameters),
            psci.cpu_suspend(riscv_power_down(3), ENTRY)
        );

        check_states(&psci, 0, &[LocalState::Run, LocalState::Run, LocalState::Run]);
    }

    #[test]
    fn cluster_suspend_coordinates_and_resumes() {
        let _lock = exclusive();
        let psci = Psci::new(&TEST_POWER_OPS);

        for cpu_index in 1..8 {
            boot_secondary(&psci, cpu_index);
        }

        // The second cluster's CPUs all request a cluster-level power-down.
        for cpu_index in 4..8 {
            fake::set_hart_id(cpu_index);
            expect_cpu_power_down(|| {
                let _ = psci.cpu_suspend(riscv_power_down(1), ENTRY);
            });

            let expected_cluster = if cpu_index == 7 {
                LocalState::Off
            } else {
                LocalState::Run
            };
            check_states(
                &psci,
                cpu_index,
                &[LocalState::Off, expected_cluster, LocalState::Run],
            );

            // Suspend preserves the affinity state.
            fake::set_hart_id(0);
            assert_eq!(Ok(AffinityInfo::On), psci.affinity_info(cpu_index, 0));
        }

        // CPU7 wakes up and walks its domains back to running.
        fake::set_hart_id(7);
        assert_eq!(
            Some(WakeUpReason::SuspendFinished(ENTRY)),
            psci.warm_boot_entrypoint()
        );
        check_states(&psci, 7, &[LocalState::Run, LocalState::Run, LocalState::Run]);
    }

    #[test]
    fn pending_interrupt_aborts_coordinated_suspend() {
        let _lock = exclusive();
        let psci = Psci::new(&TEST_POWER_OPS);

        fake::set_pending_interrupts(true);
        assert_eq!(Ok(()), psci.cpu_suspend(riscv_power_down(1), ENTRY));

        // The wakeup won: nothing was committed.
        check_states(&psci, 0, &[LocalState::Run, LocalState::Run, LocalState::Run]);
        assert_eq!(Ok(AffinityInfo::On), psci.affinity_info(0, 0));
    }

    #[test]
    fn spurious_wake_returns_none() {
        let _lock = exclusive();
        let psci = Psci::new(&TEST_POWER_OPS);

        // CPU0 runs; a reset-entry with running state is a spurious wake.
        assert_eq!(None, psci.warm_boot_entrypoint());
    }

    #[test]
    fn system_suspend_denied_while_others_on() {
        let _lock = exclusive();
        let psci = Psci::new(&TEST_POWER_OPS);

        boot_secondary(&psci, 3);

        assert_eq!(Err(ErrorCode::Denied), psci.system_suspend(ENTRY));
    }

    #[test]
    fn system_suspend_powers_down_every_level() {
        let _lock = exclusive();
        let psci = Psci::new(&TEST_POWER_OPS);

        expect_cpu_power_down(|| {
            let _ = psci.system_suspend(ENTRY);
        });

        check_states(&psci, 0, &[LocalState::Off, LocalState::Off, LocalState::Off]);

        // The wakeup resumes through the warm-boot entry.
        assert_eq!(
            Some(WakeUpReason::SuspendFinished(ENTRY)),
            psci.warm_boot_entrypoint()
        );
        check_states(&psci, 0, &[LocalState::Run, LocalState::Run, LocalState::Run]);
    }

    /// A backend whose power controller rejects every power-on.
    struct FailingOnOps;

    impl PowerOperations for FailingOnOps {
        fn cpu_standby(&self, _cpu_state: LocalState) {}

        fn power_domain_on(&self, _hart_id: usize) -> Result<(), ErrorCode> {
            Err(ErrorCode::InternalFailure)
        }

        fn power_domain_off(&self, _target_state: &CompositePowerState) {}

        fn power_domain_suspend(&self, _target_state: &CompositePowerState) {}

        fn power_domain_suspend_finish(&self, _previous_state: &CompositePowerState) {}

        fn power_domain_on_finish(&self, _previous_state: &CompositePowerState) {}

        fn validate_power_state(
            &self,
            word: PowerStateWord,
        ) -> Result<CompositePowerState, ErrorCode> {
            parse_power_state(word)
        }
    }

    #[test]
    fn failed_power_on_reverts_the_affinity_state() {
        let _lock = exclusive();
        static FAILING_OPS: FailingOnOps = FailingOnOps;
        let psci = Psci::new(&FAILING_OPS);

        assert_eq!(
            Err(ErrorCode::InternalFailure),
            psci.cpu_on(1, ENTRY)
        );

        // The target is off again and a later attempt starts from scratch.
        assert_eq!(Ok(AffinityInfo::Off), psci.affinity_info(1, 0));
        assert_eq!(
            Err(ErrorCode::InternalFailure),
            psci.cpu_on(1, ENTRY)
        );
    }

    #[test]
    fn retention_suspend_runs_the_standby_finisher() {
        let _lock = exclusive();
        let psci = Psci::new(&TEST_POWER_OPS);

        // A multi-level retention request takes the coordinated path; the
        // host wfi is a no-op, so the flow continues straight into the
        // standby finisher.
        let composite = CompositePowerState {
            states: [LocalState::Retention, LocalState::Retention, LocalState::Run],
        };
        assert_eq!(Ok(()), psci.cpu_suspend_start(0, ENTRY, 1, composite, false));

        check_states(&psci, 0, &[LocalState::Run, LocalState::Run, LocalState::Run]);
        assert_eq!(Ok(AffinityInfo::On), psci.affinity_info(0, 0));

        // Retention keeps the CPU context, so no wakeup entry point was
        // stashed for a warm boot.
        assert_eq!(None, psci.tree.locked_cpu_node(0).pop_entry_point());
    }

    #[test]
    fn concurrent_cpu_on_is_serialised_by_the_cpu_lock() {
        let _lock = exclusive();
        let psci = Psci::new(&TEST_POWER_OPS);

        // Two harts race to turn on CPU2; the target's cpu_lock serialises
        // them, so exactly one wins.
        let results = std::thread::scope(|scope| {
            let first = scope.spawn(|| psci.cpu_on(2, ENTRY));
            let second = scope.spawn(|| psci.cpu_on(2, ENTRY));
            [first.join().unwrap(), second.join().unwrap()]
        });

        assert_eq!(
            1,
            results.iter().filter(|result| result.is_ok()).count()
        );
        assert!(results.iter().any(|result| matches!(
            result,
            Err(ErrorCode::OnPending) | Err(ErrorCode::AlreadyOn)
        )));

        assert_eq!(Ok(AffinityInfo::OnPending), psci.affinity_info(2, 0));
    }

    #[test]
    fn coordination_is_minimum_over_requested_states() {
        let _lock = exclusive();
        let psci = Psci::new(&TEST_POWER_OPS);

        // With only CPU0 on, an all-off request wins everywhere.
        let mut composite = CompositePowerState::OFF;
        psci.tree.with_ancestors_locked(0, |mut ancestors| {
            composite.coordinate(0, &mut ancestors);
        });
        assert_eq!(
            [LocalState::Off, LocalState::Off, LocalState::Off],
            composite.states
        );

        // CPU1's running request pins its cluster, and with it the system.
        let mut running = CompositePowerState::RUN;
        psci.tree.with_ancestors_locked(1, |mut ancestors| {
            running.coordinate(1, &mut ancestors);
        });

        let mut composite = CompositePowerState::OFF;
        psci.tree.with_ancestors_locked(0, |mut ancestors| {
            composite.coordinate(0, &mut ancestors);
        });
        assert_eq!(
            [LocalState::Off, LocalState::Run, LocalState::Run],
            composite.states
        );
    }
}
