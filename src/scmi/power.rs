// Copyright The K1 PSCI Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Typed clients for the SCMI power-domain and system-power protocols.
//!
//! Every command claims the channel, fills in the mailbox, flushes the whole
//! window (the SCP reads it uncached), performs the synchronous handshake and
//! validates the reply's length and token before releasing the channel again.
//! Length or token disagreements are fatal; see the transport module.

use super::{Channel, ScmiChannel, header_token, message_header};
use crate::cache;
use log::{error, info};
use num_enum::TryFromPrimitive;

/// SCMI power-domain management protocol id.
pub const POWER_DOMAIN_PROTOCOL: u8 = 0x11;
/// SCMI system-power management protocol id.
pub const SYSTEM_POWER_PROTOCOL: u8 = 0x12;

/// `PROTOCOL_VERSION` message id, common to all protocols.
pub const PROTOCOL_VERSION_MSG: u8 = 0x0;
/// `PROTOCOL_MESSAGE_ATTRIBUTES` message id, common to all protocols.
pub const PROTOCOL_MESSAGE_ATTRIBUTES_MSG: u8 = 0x2;
/// Power-domain protocol `POWER_STATE_SET` message id.
pub const POWER_STATE_SET_MSG: u8 = 0x4;
/// Power-domain protocol `POWER_STATE_GET` message id.
pub const POWER_STATE_GET_MSG: u8 = 0x5;
/// System-power protocol `SYSTEM_POWER_STATE_SET` message id.
pub const SYSTEM_POWER_STATE_SET_MSG: u8 = 0x3;

/// Driver version of the power-domain protocol.
const POWER_DOMAIN_PROTOCOL_VERSION: u32 = version(2, 0);
/// Driver version of the system-power protocol.
const SYSTEM_POWER_PROTOCOL_VERSION: u32 = version(1, 0);

/// Message and response lengths in bytes: header word plus payload.
const PROTOCOL_VERSION_MSG_LEN: u32 = 4;
const PROTOCOL_VERSION_RESP_LEN: u32 = 12;
const MESSAGE_ATTRIBUTES_MSG_LEN: u32 = 8;
const MESSAGE_ATTRIBUTES_RESP_LEN: u32 = 12;
const POWER_STATE_SET_MSG_LEN: u32 = 16;
const POWER_STATE_SET_RESP_LEN: u32 = 8;
const POWER_STATE_GET_MSG_LEN: u32 = 8;
const POWER_STATE_GET_RESP_LEN: u32 = 12;
const SYSTEM_POWER_STATE_SET_MSG_LEN: u32 = 12;
const SYSTEM_POWER_STATE_SET_RESP_LEN: u32 = 8;

/// `POWER_STATE_SET` flag requesting asynchronous completion. Application
/// harts only ever use the asynchronous form.
const POWER_STATE_SET_FLAG_ASYNC: u32 = 1;

/// `SYSTEM_POWER_STATE_SET` flag word for a forceful (non-graceful) request.
pub const SYSTEM_POWER_FORCEFUL: u32 = 0;

/// `PROTOCOL_MESSAGE_ATTRIBUTES` bit: the SCP supports system suspend.
pub const SYSTEM_POWER_SUSPEND_SUPPORTED: u32 = 1 << 30;

/// Status word returned by the SCP for every command.
#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive)]
#[repr(i32)]
pub enum ScmiStatus {
    /// The command was accepted and will complete asynchronously.
    Queued = 1,
    /// The command completed successfully.
    Success = 0,
    /// The command or a parameter value is not supported.
    NotSupported = -1,
    /// A parameter was invalid.
    InvalidParameters = -2,
    /// The caller is not permitted to issue the command.
    Denied = -3,
    /// The addressed entity does not exist.
    NotFound = -4,
    /// A parameter was outside its legal range.
    OutOfRange = -5,
    /// The SCP cannot service the command right now.
    Busy = -6,
}

/// `system_state` values for `SYSTEM_POWER_STATE_SET`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum SystemPowerState {
    /// Shut the system down.
    Shutdown = 0,
    /// Cold reset.
    ColdReset = 1,
    /// Warm reset.
    WarmReset = 2,
    /// Power the system up.
    PowerUp = 3,
    /// Suspend the system to RAM.
    Suspend = 4,
}

/// Per-level state encoding inside an [`ScmiPowerState`] word.
#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum ScmiDomainState {
    /// The level is powered off.
    Off = 0,
    /// The level is powered on.
    On = 1,
    /// The level is in a sleep state.
    Sleep = 2,
}

const LEVEL_STATE_WIDTH: u32 = 4;
const LEVEL_STATE_MASK: u32 = (1 << LEVEL_STATE_WIDTH) - 1;
const MAX_LEVEL_SHIFT: u32 = 16;
const MAX_LEVEL_MASK: u32 = 0xf;

/// The composite power-state word of the power-domain protocol.
///
/// Levels 0..=3 each occupy a 4-bit field starting at bit 0; bits 16..=19
/// carry the highest level that holds a valid state.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ScmiPowerState(u32);

impl ScmiPowerState {
    /// Stores `state` into the 4-bit field of `level`.
    pub fn set_level_state(&mut self, level: usize, state: ScmiDomainState) {
        let shift = LEVEL_STATE_WIDTH * level as u32;
        self.0 = (self.0 & !(LEVEL_STATE_MASK << shift)) | (state as u32) << shift;
    }

    /// Records `level` as the highest level carrying a valid state.
    pub fn set_max_level(&mut self, level: usize) {
        self.0 = (self.0 & !(MAX_LEVEL_MASK << MAX_LEVEL_SHIFT))
            | (level as u32 & MAX_LEVEL_MASK) << MAX_LEVEL_SHIFT;
    }

    /// Reads the raw 4-bit state field of `level`.
    pub fn level_state(self, level: usize) -> u32 {
        (self.0 >> (LEVEL_STATE_WIDTH * level as u32)) & LEVEL_STATE_MASK
    }

    /// Reads the highest level carrying a valid state.
    pub fn max_level(self) -> usize {
        ((self.0 >> MAX_LEVEL_SHIFT) & MAX_LEVEL_MASK) as usize
    }

    /// The raw wire encoding.
    pub fn raw(self) -> u32 {
        self.0
    }
}

/// Builds a version word from major and minor parts.
pub const fn version(major: u16, minor: u16) -> u32 {
    (major as u32) << 16 | minor as u32
}

/// Whether driver version `driver` can talk to a firmware reporting
/// `reported`.
///
/// Lower reported major versions are accepted, as all affected protocols have
/// stayed backwards compatible so far; within the same major version the
/// driver's minor must not be newer than the firmware's.
pub const fn is_version_compatible(driver: u32, reported: u32) -> bool {
    let (driver_major, reported_major) = (driver >> 16, reported >> 16);
    driver_major > reported_major
        || (driver_major == reported_major && driver & 0xffff <= reported & 0xffff)
}

/// An initialized SCMI client over the single platform channel.
pub struct ScmiHandle {
    channel: ScmiChannel,
}

impl ScmiHandle {
    /// Wraps a channel without probing the SCP, for unit tests.
    #[cfg(test)]
    pub(crate) fn with_channel(channel: ScmiChannel) -> Self {
        Self { channel }
    }

    /// Brings up the SCMI client: probes the power-domain and system-power
    /// protocol versions and verifies they are compatible with this driver.
    pub fn init(channel: ScmiChannel) -> Result<Self, ScmiStatus> {
        let handle = Self { channel };

        let reported = handle.protocol_version(POWER_DOMAIN_PROTOCOL)?;
        if !is_version_compatible(POWER_DOMAIN_PROTOCOL_VERSION, reported) {
            error!(
                "SCMI power domain protocol version {reported:#x} incompatible with driver \
                 version {POWER_DOMAIN_PROTOCOL_VERSION:#x}"
            );
            return Err(ScmiStatus::NotSupported);
        }
        info!("SCMI power domain protocol version {reported:#x} detected");

        let reported = handle.protocol_version(SYSTEM_POWER_PROTOCOL)?;
        if !is_version_compatible(SYSTEM_POWER_PROTOCOL_VERSION, reported) {
            error!(
                "SCMI system power protocol version {reported:#x} incompatible with driver \
                 version {SYSTEM_POWER_PROTOCOL_VERSION:#x}"
            );
            return Err(ScmiStatus::NotSupported);
        }
        info!("SCMI system power management protocol version {reported:#x} detected");

        info!("SCMI driver initialized");
        Ok(handle)
    }

    /// Queries the version of an SCMI protocol.
    pub fn protocol_version(&self, protocol_id: u8) -> Result<u32, ScmiStatus> {
        self.transact(
            protocol_id,
            PROTOCOL_VERSION_MSG,
            &[],
            PROTOCOL_VERSION_MSG_LEN,
            PROTOCOL_VERSION_RESP_LEN,
            |channel| channel.read_payload(1),
        )
    }

    /// Queries the attributes of one message of an SCMI protocol.
    pub fn protocol_message_attributes(
        &self,
        protocol_id: u8,
        message_id: u8,
    ) -> Result<u32, ScmiStatus> {
        self.transact(
            protocol_id,
            PROTOCOL_MESSAGE_ATTRIBUTES_MSG,
            &[u32::from(message_id)],
            MESSAGE_ATTRIBUTES_MSG_LEN,
            MESSAGE_ATTRIBUTES_RESP_LEN,
            |channel| channel.read_payload(1),
        )
    }

    /// Requests a power-state transition of one power domain.
    ///
    /// Only the asynchronous form is used from application harts, so a
    /// `Queued` status counts as success and the completion is never waited
    /// for.
    pub fn power_state_set(&self, domain_id: u32, state: ScmiPowerState) -> Result<(), ScmiStatus> {
        let status = self.transact_status(
            POWER_DOMAIN_PROTOCOL,
            POWER_STATE_SET_MSG,
            &[POWER_STATE_SET_FLAG_ASYNC, domain_id, state.raw()],
            POWER_STATE_SET_MSG_LEN,
            POWER_STATE_SET_RESP_LEN,
            |_| (),
        );
        match status {
            (ScmiStatus::Success | ScmiStatus::Queued, ()) => Ok(()),
            (status, ()) => Err(status),
        }
    }

    /// Reads the current power state of one power domain.
    pub fn power_state_get(&self, domain_id: u32) -> Result<ScmiPowerState, ScmiStatus> {
        self.transact(
            POWER_DOMAIN_PROTOCOL,
            POWER_STATE_GET_MSG,
            &[domain_id],
            POWER_STATE_GET_MSG_LEN,
            POWER_STATE_GET_RESP_LEN,
            |channel| ScmiPowerState(channel.read_payload(1)),
        )
    }

    /// Requests a system-wide power-state transition.
    pub fn system_power_state_set(
        &self,
        flags: u32,
        system_state: SystemPowerState,
    ) -> Result<(), ScmiStatus> {
        self.transact(
            SYSTEM_POWER_PROTOCOL,
            SYSTEM_POWER_STATE_SET_MSG,
            &[flags, system_state as u32],
            SYSTEM_POWER_STATE_SET_MSG_LEN,
            SYSTEM_POWER_STATE_SET_RESP_LEN,
            |_| (),
        )
    }

    /// Runs one command and maps every status other than `Success` to an
    /// error.
    fn transact<T>(
        &self,
        protocol_id: u8,
        message_id: u8,
        arguments: &[u32],
        message_length: u32,
        response_length: u32,
        read: impl FnOnce(&Channel) -> T,
    ) -> Result<T, ScmiStatus> {
        match self.transact_status(
            protocol_id,
            message_id,
            arguments,
            message_length,
            response_length,
            read,
        ) {
            (ScmiStatus::Success, value) => Ok(value),
            (status, _) => Err(status),
        }
    }

    /// Runs one command through the mailbox and returns the SCP's status word
    /// together with the decoded reply payload.
    fn transact_status<T>(
        &self,
        protocol_id: u8,
        message_id: u8,
        arguments: &[u32],
        message_length: u32,
        response_length: u32,
        read: impl FnOnce(&Channel) -> T,
    ) -> (ScmiStatus, T) {
        let token = 0;
        let channel = self.channel.claim();

        channel.write_command(message_header(protocol_id, message_id, token), message_length);
        for (index, argument) in arguments.iter().enumerate() {
            channel.write_payload(index, *argument);
        }

        // The SCP reads the window uncached.
        cache::clean_invalidate_range(channel.mailbox_base(), super::MAILBOX_SIZE);

        channel.send_sync();

        if channel.read_length() != response_length {
            panic!(
                "SCMI response length {} for protocol {protocol_id:#x} message {message_id:#x}, \
                 expected {response_length}",
                channel.read_length(),
            );
        }
        if header_token(channel.read_header()) != token {
            panic!(
                "SCMI response token mismatch for protocol {protocol_id:#x} \
                 message {message_id:#x}"
            );
        }

        let raw_status = channel.read_payload(0) as i32;
        let status = ScmiStatus::try_from(raw_status)
            .unwrap_or_else(|_| panic!("unknown SCMI status {raw_status}"));
        let value = read(&channel);

        channel.release();
        (status, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scmi::testing::{Reply, channel_with_fake_scp, success_responder};
    use std::panic::{AssertUnwindSafe, catch_unwind};

    #[test]
    fn version_compatibility_rule() {
        // Same major, driver minor not newer: compatible.
        assert!(is_version_compatible(version(2, 0), version(2, 0)));
        assert!(is_version_compatible(version(2, 0), version(2, 7)));
        // Driver newer within a major version: incompatible.
        assert!(!is_version_compatible(version(2, 1), version(2, 0)));
        // Reported major older than the driver's: accepted.
        assert!(is_version_compatible(version(2, 0), version(1, 9)));
        // Reported major newer than the driver's: rejected.
        assert!(!is_version_compatible(version(1, 0), version(2, 0)));
    }

    #[test]
    fn power_state_word_round_trip() {
        let mut state = ScmiPowerState::default();
        for level in 0..4 {
            for domain_state in [
                ScmiDomainState::Off,
                ScmiDomainState::On,
                ScmiDomainState::Sleep,
            ] {
                state.set_level_state(level, domain_state);
                assert_eq!(domain_state as u32, state.level_state(level));
            }
        }
        state.set_max_level(2);
        assert_eq!(2, state.max_level());
    }

    #[test]
    fn protocol_version_round_trip() {
        let (channel, scp) = channel_with_fake_scp(success_responder(vec![version(2, 0)]));
        let handle = ScmiHandle { channel };

        assert_eq!(
            Ok(version(2, 0)),
            handle.protocol_version(POWER_DOMAIN_PROTOCOL)
        );

        let seen = scp.seen.lock();
        assert_eq!(1, seen.len());
        assert_eq!(
            super::super::message_header(POWER_DOMAIN_PROTOCOL, PROTOCOL_VERSION_MSG, 0),
            seen[0].header
        );
        assert_eq!(PROTOCOL_VERSION_MSG_LEN, seen[0].length);
    }

    /// Answers `PROTOCOL_VERSION` with a per-protocol version.
    fn version_responder(
        power_domain: u32,
        system_power: u32,
    ) -> Box<dyn Fn(&crate::scmi::testing::SeenCommand) -> Reply + Send + Sync> {
        Box::new(move |command| {
            let protocol = (command.header >> 10) & 0xff;
            let reported = if protocol == u32::from(POWER_DOMAIN_PROTOCOL) {
                power_domain
            } else {
                system_power
            };
            Reply {
                length: PROTOCOL_VERSION_RESP_LEN,
                payload: vec![0, reported],
                token_override: None,
            }
        })
    }

    #[test]
    fn init_accepts_compatible_firmware() {
        let (channel, _scp) =
            channel_with_fake_scp(version_responder(version(2, 5), version(1, 3)));
        assert!(ScmiHandle::init(channel).is_ok());
    }

    #[test]
    fn init_rejects_incompatible_firmware() {
        // The power-domain protocol reports a newer major version than the
        // driver speaks.
        let (channel, _scp) =
            channel_with_fake_scp(version_responder(version(3, 0), version(1, 0)));
        assert_eq!(
            Err(ScmiStatus::NotSupported),
            ScmiHandle::init(channel).map(|_| ())
        );
    }

    #[test]
    fn power_state_set_is_async_and_accepts_queued() {
        let (channel, scp) = channel_with_fake_scp(Box::new(|_| Reply {
            length: POWER_STATE_SET_RESP_LEN,
            payload: vec![ScmiStatus::Queued as u32],
            token_override: None,
        }));
        let handle = ScmiHandle { channel };

        let mut state = ScmiPowerState::default();
        state.set_level_state(0, ScmiDomainState::Off);
        state.set_max_level(0);
        assert_eq!(Ok(()), handle.power_state_set(3, state));

        let seen = scp.seen.lock();
        assert_eq!(vec![1, 3, state.raw()], seen[0].payload);
    }

    #[test]
    fn power_state_get_round_trips_the_state_word() {
        let mut reported = ScmiPowerState::default();
        reported.set_level_state(0, ScmiDomainState::Sleep);
        reported.set_level_state(1, ScmiDomainState::Off);
        reported.set_max_level(1);

        let (channel, scp) = channel_with_fake_scp(success_responder(vec![reported.raw()]));
        let handle = ScmiHandle { channel };

        let state = handle.power_state_get(2).unwrap();
        assert_eq!(reported, state);
        assert_eq!(ScmiDomainState::Sleep as u32, state.level_state(0));
        assert_eq!(1, state.max_level());

        assert_eq!(vec![2], scp.seen.lock()[0].payload);
    }

    #[test]
    fn system_power_state_set_payload() {
        let (channel, scp) = channel_with_fake_scp(success_responder(vec![]));
        let handle = ScmiHandle { channel };

        assert_eq!(
            Ok(()),
            handle.system_power_state_set(SYSTEM_POWER_FORCEFUL, SystemPowerState::Suspend)
        );

        let seen = scp.seen.lock();
        assert_eq!(
            vec![SYSTEM_POWER_FORCEFUL, SystemPowerState::Suspend as u32],
            seen[0].payload
        );
        assert_eq!(SYSTEM_POWER_STATE_SET_MSG_LEN, seen[0].length);
    }

    #[test]
    fn response_length_mismatch_is_fatal() {
        let (channel, _scp) = channel_with_fake_scp(Box::new(|_| Reply {
            length: 8,
            payload: vec![0],
            token_override: None,
        }));
        let handle = ScmiHandle { channel };

        let result = catch_unwind(AssertUnwindSafe(|| {
            let _ = handle.protocol_version(POWER_DOMAIN_PROTOCOL);
        }));
        assert!(result.is_err());
    }

    #[test]
    fn response_token_mismatch_is_fatal() {
        let (channel, _scp) = channel_with_fake_scp(Box::new(|_| Reply {
            length: PROTOCOL_VERSION_RESP_LEN,
            payload: vec![0, version(2, 0)],
            token_override: Some(7),
        }));
        let handle = ScmiHandle { channel };

        let result = catch_unwind(AssertUnwindSafe(|| {
            let _ = handle.protocol_version(POWER_DOMAIN_PROTOCOL);
        }));
        assert!(result.is_err());
    }
}
