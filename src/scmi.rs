// Copyright The K1 PSCI Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Shared-memory mailbox transport for the system control processor.
//!
//! A single fixed shared-memory channel carries commands from the application
//! harts to the SCP. The low bit of the status word tracks ownership: 1 means
//! the application side owns the channel, 0 means the SCP does. A command is
//! posted by filling in the header, length, flags and payload, clearing the
//! free bit, and ringing the doorbell; the reply has arrived once the SCP
//! hands the channel back by setting the free bit again.
//!
//! Channel-state disagreements with the SCP are unrecoverable: power
//! transitions are already in flight on the other side, so the offending hart
//! halts (panics) rather than guessing.

pub mod power;

use crate::riscv64::fence_iorw;
use core::ptr::NonNull;
use spin::mutex::{SpinMutex, SpinMutexGuard};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Size in bytes of the shared-memory window, header included.
pub const MAILBOX_SIZE: usize = 0x80;

/// Number of payload words that fit in the window.
pub const PAYLOAD_WORDS: usize = (MAILBOX_SIZE - 28) / size_of::<u32>();

/// Status-word bit set while the application side owns the channel.
const STATUS_FREE_BIT: u32 = 1 << 0;

/// Flags-word value requesting a polled (interrupt-less) completion.
pub(crate) const FLAG_RESPONSE_POLL: u32 = 0;

const MESSAGE_ID_MASK: u32 = 0xff;
const PROTOCOL_ID_SHIFT: u32 = 10;
const PROTOCOL_ID_MASK: u32 = 0xff;
const TOKEN_SHIFT: u32 = 18;
const TOKEN_MASK: u32 = 0x3ff;

/// Composes a message header from a protocol id, message id and token.
pub fn message_header(protocol_id: u8, message_id: u8, token: u16) -> u32 {
    (u32::from(protocol_id) & PROTOCOL_ID_MASK) << PROTOCOL_ID_SHIFT
        | (u32::from(token) & TOKEN_MASK) << TOKEN_SHIFT
        | (u32::from(message_id) & MESSAGE_ID_MASK)
}

/// Extracts the token from a message header.
pub fn header_token(header: u32) -> u16 {
    ((header >> TOKEN_SHIFT) & TOKEN_MASK) as u16
}

/// The shared-memory mailbox layout.
///
/// The SCP observes this memory uncached, so writers flush the whole window
/// before ringing the doorbell.
#[derive(FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct Mailbox {
    reserved0: u32,
    status: u32,
    reserved1: u64,
    flags: u32,
    length: u32,
    message_header: u32,
    payload: [u32; PAYLOAD_WORDS],
}

/// Rings the SCP's doorbell interrupt for the channel.
pub trait Doorbell: Sync {
    /// Signals the SCP that a command is waiting in the mailbox.
    fn ring(&self);
}

/// One SCMI channel: a mailbox window plus its doorbell.
///
/// All mailbox accesses are volatile; the SCP mutates the window underneath
/// us.
pub struct Channel {
    mailbox: NonNull<Mailbox>,
    doorbell: &'static dyn Doorbell,
}

// SAFETY: The mailbox pointer refers to static shared memory; exclusive use is
// enforced by the `ScmiChannel` lock.
unsafe impl Send for Channel {}

impl Channel {
    /// Creates a channel over the mailbox at `mailbox`.
    ///
    /// # Safety
    ///
    /// `mailbox` must point to a [`MAILBOX_SIZE`]-byte shared-memory window
    /// that stays mapped for the channel's lifetime and is only otherwise
    /// accessed by the SCP according to the ownership protocol.
    pub const unsafe fn new(mailbox: NonNull<Mailbox>, doorbell: &'static dyn Doorbell) -> Self {
        Self { mailbox, doorbell }
    }

    /// The base address of the mailbox window, for cache maintenance.
    pub fn mailbox_base(&self) -> usize {
        self.mailbox.as_ptr() as usize
    }

    fn status(&self) -> u32 {
        // SAFETY: The mailbox is valid per the `new` contract.
        unsafe { (&raw const (*self.mailbox.as_ptr()).status).read_volatile() }
    }

    fn is_free(&self) -> bool {
        self.status() & STATUS_FREE_BIT != 0
    }

    /// Writes the header, length and flags of an outgoing command.
    pub(crate) fn write_command(&self, header: u32, length: u32) {
        // SAFETY: The mailbox is valid per the `new` contract and this hart
        // owns the channel.
        unsafe {
            let mailbox = self.mailbox.as_ptr();
            (&raw mut (*mailbox).message_header).write_volatile(header);
            (&raw mut (*mailbox).length).write_volatile(length);
            (&raw mut (*mailbox).flags).write_volatile(FLAG_RESPONSE_POLL);
        }
    }

    /// Writes the `index`th payload word of an outgoing command.
    pub(crate) fn write_payload(&self, index: usize, value: u32) {
        assert!(index < PAYLOAD_WORDS);
        // SAFETY: The index is bounds-checked and this hart owns the channel.
        unsafe {
            (&raw mut (*self.mailbox.as_ptr()).payload[index]).write_volatile(value);
        }
    }

    /// Reads the `index`th payload word of the reply.
    pub(crate) fn read_payload(&self, index: usize) -> u32 {
        assert!(index < PAYLOAD_WORDS);
        // SAFETY: The index is bounds-checked and the mailbox is valid per
        // the `new` contract.
        unsafe { (&raw const (*self.mailbox.as_ptr()).payload[index]).read_volatile() }
    }

    /// Reads the reply's length word.
    pub(crate) fn read_length(&self) -> u32 {
        // SAFETY: The mailbox is valid per the `new` contract.
        unsafe { (&raw const (*self.mailbox.as_ptr()).length).read_volatile() }
    }

    /// Reads the reply's message header.
    pub(crate) fn read_header(&self) -> u32 {
        // SAFETY: The mailbox is valid per the `new` contract.
        unsafe { (&raw const (*self.mailbox.as_ptr()).message_header).read_volatile() }
    }

    /// Hands the channel to the SCP and spins until it is handed back.
    ///
    /// The payload must be fully written (and flushed) beforehand. Three I/O
    /// fences keep the payload writes, the doorbell write, the ownership poll
    /// and the payload reads in order on both sides.
    pub(crate) fn send_sync(&self) {
        if !self.is_free() {
            panic!("SCMI channel busy when posting command");
        }
        // SAFETY: The mailbox is valid per the `new` contract and this hart
        // owns the channel.
        unsafe {
            let status = self.status() & !STATUS_FREE_BIT;
            (&raw mut (*self.mailbox.as_ptr()).status).write_volatile(status);
        }

        // Payload writes must retire before the doorbell is visible.
        fence_iorw();
        self.doorbell.ring();
        // The doorbell write must retire before we start polling.
        fence_iorw();

        while !self.is_free() {
            core::hint::spin_loop();
        }

        // The ownership observation must precede the payload reads.
        fence_iorw();
    }
}

/// The lock-guarded SCMI channel shared by all harts.
pub struct ScmiChannel {
    channel: SpinMutex<Channel>,
}

/// Exclusive access to the channel, released on drop.
pub struct ChannelGuard<'a> {
    guard: SpinMutexGuard<'a, Channel>,
}

impl ScmiChannel {
    /// Wraps a channel in the cross-hart lock.
    pub const fn new(channel: Channel) -> Self {
        Self {
            channel: SpinMutex::new(channel),
        }
    }

    /// Acquires exclusive access to the channel.
    ///
    /// Panics if the channel is not in application ownership once the lock is
    /// held: a previous command did not complete, which means the SCP and the
    /// application disagree about channel state.
    pub fn claim(&self) -> ChannelGuard<'_> {
        let guard = self.channel.lock();
        if !guard.is_free() {
            panic!("SCMI channel not free on acquire");
        }
        ChannelGuard { guard }
    }
}

impl ChannelGuard<'_> {
    /// Verifies that the SCP has handed the channel back, then releases the
    /// lock.
    pub fn release(self) {
        if !self.guard.is_free() {
            panic!("SCMI channel not free on release");
        }
    }
}

impl core::ops::Deref for ChannelGuard<'_> {
    type Target = Channel;

    fn deref(&self) -> &Channel {
        &self.guard
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{AssertUnwindSafe, catch_unwind};
    use testing::{Reply, channel_with_fake_scp, success_responder};

    #[test]
    fn header_codec() {
        let header = message_header(0x11, 0x4, 0x2a5);
        assert_eq!(0x11 << 10 | 0x2a5 << 18 | 0x4, header);
        assert_eq!(0x2a5, header_token(header));
    }

    #[test]
    fn header_token_is_ten_bits() {
        let header = message_header(0x12, 0x3, 0xffff);
        assert_eq!(0x3ff, header_token(header));
    }

    #[test]
    fn send_sync_round_trip() {
        let (channel, scp) = channel_with_fake_scp(success_responder(vec![0xabcd]));

        let guard = channel.claim();
        guard.write_command(message_header(0x11, 0x0, 0), 4);
        guard.send_sync();
        assert_eq!(12, guard.read_length());
        assert_eq!(0, guard.read_payload(0));
        assert_eq!(0xabcd, guard.read_payload(1));
        guard.release();

        assert_eq!(1, scp.seen.lock().len());
        assert_eq!(message_header(0x11, 0x0, 0), scp.seen.lock()[0].header);
    }

    #[test]
    fn claim_panics_when_channel_is_scp_owned() {
        let (channel, _scp) = channel_with_fake_scp(Box::new(|_| Reply {
            length: 8,
            payload: vec![0],
            token_override: None,
        }));

        {
            let guard = channel.claim();
            // Steal the free bit as a stuck SCP would.
            // SAFETY: Test-only direct mailbox poke.
            unsafe {
                let mailbox = guard.mailbox.as_ptr();
                (&raw mut (*mailbox).status).write_volatile(0);
            }
            drop(guard.guard);
        }

        let result = catch_unwind(AssertUnwindSafe(|| {
            let _ = channel.claim();
        }));
        assert!(result.is_err());
    }
}
