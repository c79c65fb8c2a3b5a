// Copyright The K1 PSCI Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! The SCMI-backed power backend: power transitions are not programmed into
//! the power controller directly but forwarded to the SCP as a single
//! composite power-state word per request.

use super::{Platform, PlatformImpl, PowerOperations};
use crate::{
    interconnect::SnoopControl,
    psci::{CompositePowerState, ErrorCode, LocalState, PowerStateWord, parse_power_state},
    riscv64,
    scmi::power::{
        POWER_DOMAIN_PROTOCOL, POWER_STATE_GET_MSG, POWER_STATE_SET_MSG, SYSTEM_POWER_FORCEFUL,
        SYSTEM_POWER_PROTOCOL, SYSTEM_POWER_STATE_SET_MSG, SYSTEM_POWER_SUSPEND_SUPPORTED,
        ScmiDomainState, ScmiHandle, ScmiPowerState, ScmiStatus, SystemPowerState,
    },
};
use log::{info, warn};
use spin::Once;

/// Cluster power level in a composite state.
const CLUSTER_LEVEL: usize = 1;

/// The SCMI domain id of a CPU. Domain ids follow core positions on this
/// platform.
fn scmi_domain_id(cpu_index: usize) -> u32 {
    cpu_index as u32
}

/// The SCMI-backed power backend.
pub struct ScpPowerOps {
    scmi: ScmiHandle,
    interconnect: &'static SnoopControl,
}

impl ScpPowerOps {
    /// Builds the backend from an initialised SCMI handle.
    pub fn new(scmi: ScmiHandle, interconnect: &'static SnoopControl) -> Self {
        Self { scmi, interconnect }
    }

    /// Asks the SCP to turn off the calling CPU and every contiguous OFF
    /// level above it. `CPU_OFF` never reaches the system domain.
    fn scp_off(&self, target_state: &CompositePowerState) {
        assert!(target_state.cpu_level_state().is_off());
        assert!(target_state.highest_level_state().is_run());

        let mut scmi_state = ScmiPowerState::default();
        let mut level = 0;
        while level <= PlatformImpl::MAX_POWER_LEVEL {
            let state = target_state.states[level];
            if state.is_run() {
                break;
            }
            assert!(state.is_off());
            scmi_state.set_level_state(level, ScmiDomainState::Off);
            level += 1;
        }
        scmi_state.set_max_level(level - 1);

        // Fire and forget: the SCP queues the request and takes the domain
        // down once this hart has parked.
        if let Err(status) = self
            .scmi
            .power_state_set(scmi_domain_id(PlatformImpl::core_index()), scmi_state)
        {
            panic!("SCMI power state set returned {status:?}");
        }
    }

    /// Asks the SCP to power the target CPU (and its ancestor domains) on.
    fn scp_on(&self, cpu_index: usize) {
        let mut scmi_state = ScmiPowerState::default();
        for level in 0..=PlatformImpl::MAX_POWER_LEVEL {
            scmi_state.set_level_state(level, ScmiDomainState::On);
        }
        scmi_state.set_max_level(PlatformImpl::MAX_POWER_LEVEL);

        if let Err(status) = self.scmi.power_state_set(scmi_domain_id(cpu_index), scmi_state) {
            panic!("SCMI power state set returned {status:?}");
        }
    }

    /// Asks the SCP to suspend the calling CPU's domains, or the whole
    /// system when the request reaches the top level.
    fn scp_suspend(&self, target_state: &CompositePowerState) {
        assert!(target_state.cpu_level_state().is_off());

        if target_state.highest_level_state().is_off() {
            if let Err(status) = self
                .scmi
                .system_power_state_set(SYSTEM_POWER_FORCEFUL, SystemPowerState::Suspend)
            {
                panic!("SCMI system power state set returned {status:?}");
            }
            return;
        }

        // The CPU level suspends to a context-preserving sleep; everything
        // above it that leaves RUN goes off.
        let mut scmi_state = ScmiPowerState::default();
        scmi_state.set_level_state(CompositePowerState::CPU_POWER_LEVEL, ScmiDomainState::Sleep);

        let mut level = CLUSTER_LEVEL;
        while level <= PlatformImpl::MAX_POWER_LEVEL {
            let state = target_state.states[level];
            if state.is_run() {
                break;
            }
            assert!(state.is_off());
            scmi_state.set_level_state(level, ScmiDomainState::Off);
            level += 1;
        }
        scmi_state.set_max_level(level - 1);

        match self
            .scmi
            .power_state_set(scmi_domain_id(PlatformImpl::core_index()), scmi_state)
        {
            Ok(()) => {}
            Err(status) => panic!("SCMI power state set returned {status:?}"),
        }
    }

    /// Withdraws the cluster from the snoop domain when it is on its way
    /// down.
    fn power_down_common(&self, target_state: &CompositePowerState) {
        if target_state.states[CLUSTER_LEVEL].is_off() {
            let cluster = PlatformImpl::cluster_index(riscv64::hart_id());
            self.interconnect
                .disable_snoop_dvm(cluster)
                .expect("cluster master is mapped on the interconnect");
        }
    }

    /// Rejoins the snoop domain when the cluster comes back up.
    fn power_up_common(&self, previous_state: &CompositePowerState) {
        if previous_state.states[CLUSTER_LEVEL].is_off() {
            let cluster = PlatformImpl::cluster_index(riscv64::hart_id());
            self.interconnect
                .enable_snoop_dvm(cluster)
                .expect("cluster master is mapped on the interconnect");
        }
    }
}

impl PowerOperations for ScpPowerOps {
    fn cpu_standby(&self, cpu_state: LocalState) {
        assert_eq!(LocalState::Retention, cpu_state);
        riscv64::wfi();
    }

    fn power_domain_on(&self, hart_id: usize) -> Result<(), ErrorCode> {
        let cpu_index =
            PlatformImpl::core_position(hart_id).ok_or(ErrorCode::InvalidParameters)?;
        self.scp_on(cpu_index);
        Ok(())
    }

    fn power_domain_off_early(&self, _target_state: &CompositePowerState) -> Result<(), ErrorCode> {
        riscv64::quiesce_local_interrupts();
        Ok(())
    }

    fn power_domain_off(&self, target_state: &CompositePowerState) {
        self.power_down_common(target_state);
        self.scp_off(target_state);
    }

    fn power_domain_suspend_powerdown_early(&self, _target_state: &CompositePowerState) {
        riscv64::mask_interrupt_enables();
    }

    fn power_domain_suspend(&self, target_state: &CompositePowerState) {
        // Retention is handled entirely by the CPU standby path.
        if target_state.cpu_level_state() == LocalState::Retention {
            return;
        }

        self.power_down_common(target_state);
        self.scp_suspend(target_state);
    }

    fn power_domain_suspend_finish(&self, previous_state: &CompositePowerState) {
        if previous_state.cpu_level_state() == LocalState::Retention {
            return;
        }

        self.power_up_common(previous_state);
    }

    fn power_domain_on_finish(&self, previous_state: &CompositePowerState) {
        // The first hart awakening from a system suspend re-initialises the
        // system domain before this runs; a plain CPU_ON never sees the
        // system domain down.
        self.power_up_common(previous_state);
    }

    fn validate_power_state(
        &self,
        word: PowerStateWord,
    ) -> Result<CompositePowerState, ErrorCode> {
        let mut composite = parse_power_state(word)?;

        // The system domain is only reachable through SYSTEM_SUSPEND; a
        // CPU_SUSPEND that names the top level is downgraded.
        composite.states[PlatformImpl::MAX_POWER_LEVEL] = LocalState::Run;

        Ok(composite)
    }
}

static SCP_OPS: Once<ScpPowerOps> = Once::new();

/// Probes the SCP's capabilities and installs the SCMI-backed backend.
///
/// Fails if the SCP does not implement `POWER_STATE_SET` or cannot suspend
/// the system; the caller then keeps the direct backend.
pub fn override_power_ops(
    scmi: ScmiHandle,
    interconnect: &'static SnoopControl,
) -> Result<&'static ScpPowerOps, ScmiStatus> {
    scmi.protocol_message_attributes(POWER_DOMAIN_PROTOCOL, POWER_STATE_SET_MSG)?;

    if scmi
        .protocol_message_attributes(POWER_DOMAIN_PROTOCOL, POWER_STATE_GET_MSG)
        .is_err()
    {
        info!("SCP does not report power domain states");
    }

    let attributes =
        scmi.protocol_message_attributes(SYSTEM_POWER_PROTOCOL, SYSTEM_POWER_STATE_SET_MSG)?;
    if attributes & SYSTEM_POWER_SUSPEND_SUPPORTED == 0 {
        warn!("SCP does not support system suspend");
        return Err(ScmiStatus::NotSupported);
    }

    Ok(SCP_OPS.call_once(|| ScpPowerOps::new(scmi, interconnect)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::test::exclusive;
    use crate::scmi::testing::{channel_with_fake_scp, success_responder};
    use crate::scmi::{header_token, message_header};

    fn fake_interconnect() -> &'static SnoopControl {
        let frame = Box::leak(vec![0u32; 0x5000 / size_of::<u32>()].into_boxed_slice());
        static MAP: [Option<usize>; 2] = [Some(0), Some(1)];
        let base = frame.as_mut_ptr() as usize;
        // SAFETY: The frame is leaked and outlives the driver.
        Box::leak(Box::new(unsafe { SnoopControl::new(base, &MAP) }))
    }

    fn scp_ops() -> (ScpPowerOps, &'static crate::scmi::testing::FakeScp) {
        let (channel, scp) = channel_with_fake_scp(success_responder(vec![]));
        let handle = ScmiHandle::with_channel(channel);
        (ScpPowerOps::new(handle, fake_interconnect()), scp)
    }

    #[test]
    fn cpu_off_word_covers_contiguous_off_levels() {
        let _lock = exclusive();
        let (ops, scp) = scp_ops();

        let mut target = CompositePowerState::OFF;
        target.states[PlatformImpl::MAX_POWER_LEVEL] = LocalState::Run;
        ops.power_domain_off(&target);

        let seen = scp.seen.lock();
        assert_eq!(1, seen.len());
        // Async flag, domain 0, then the state word.
        assert_eq!(1, seen[0].payload[0]);
        assert_eq!(0, seen[0].payload[1]);
        let word = seen[0].payload[2];
        let mut expected = ScmiPowerState::default();
        expected.set_level_state(0, ScmiDomainState::Off);
        expected.set_level_state(1, ScmiDomainState::Off);
        expected.set_max_level(1);
        assert_eq!(expected.raw(), word);
    }

    #[test]
    fn cluster_suspend_sleeps_cpu_and_offs_cluster() {
        let _lock = exclusive();
        crate::riscv64::fake::set_hart_id(0x7);
        let (ops, scp) = scp_ops();

        let mut target = CompositePowerState::OFF;
        target.states[PlatformImpl::MAX_POWER_LEVEL] = LocalState::Run;
        ops.power_domain_suspend(&target);

        let seen = scp.seen.lock();
        assert_eq!(1, seen.len());
        assert_eq!(scmi_domain_id(7), seen[0].payload[1]);
        let mut expected = ScmiPowerState::default();
        expected.set_level_state(0, ScmiDomainState::Sleep);
        expected.set_level_state(1, ScmiDomainState::Off);
        expected.set_max_level(1);
        assert_eq!(expected.raw(), seen[0].payload[2]);
    }

    #[test]
    fn system_suspend_issues_one_system_power_command() {
        let _lock = exclusive();
        let (ops, scp) = scp_ops();

        ops.power_domain_suspend(&CompositePowerState::OFF);

        let seen = scp.seen.lock();
        assert_eq!(1, seen.len());
        assert_eq!(
            message_header(SYSTEM_POWER_PROTOCOL, SYSTEM_POWER_STATE_SET_MSG, 0),
            seen[0].header
        );
        assert_eq!(
            vec![SYSTEM_POWER_FORCEFUL, SystemPowerState::Suspend as u32],
            seen[0].payload
        );
        assert_eq!(0, header_token(seen[0].header));
    }

    #[test]
    fn cpu_on_word_is_all_on() {
        let _lock = exclusive();
        let (ops, scp) = scp_ops();

        assert_eq!(Ok(()), ops.power_domain_on(0x5));

        let seen = scp.seen.lock();
        assert_eq!(scmi_domain_id(5), seen[0].payload[1]);
        let mut expected = ScmiPowerState::default();
        for level in 0..=PlatformImpl::MAX_POWER_LEVEL {
            expected.set_level_state(level, ScmiDomainState::On);
        }
        expected.set_max_level(PlatformImpl::MAX_POWER_LEVEL);
        assert_eq!(expected.raw(), seen[0].payload[2]);
    }

    #[test]
    fn cpu_suspend_never_reaches_the_system_level() {
        let _lock = exclusive();
        let (ops, _scp) = scp_ops();

        let word = PowerStateWord::power_down(PlatformImpl::MAX_POWER_LEVEL);
        let composite = ops.validate_power_state(word).unwrap();
        assert_eq!(LocalState::Run, composite.highest_level_state());
        assert_eq!(LocalState::Off, composite.states[CLUSTER_LEVEL]);
    }
}
