// S/390-style Channel I/O Command/Completion Engine
// Copyright 2026 cio-rust contributors
// SPDX-License-Identifier: MIT

//! Channel command words and channel programs.
//!
//! A channel program is an ordered sequence of channel command words (CCWs)
//! executed by the channel subsystem in response to a Start request. The
//! command code values match the ESA/390 architected assignments.

use bitflags::bitflags;

/// Channel command codes.
///
/// Each command has the architected 8-bit value placed in the CCW's
/// command field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CcwCommand {
    /// Write data to the device.
    Write = 0x01,

    /// Read data from the device.
    Read = 0x02,

    /// Control command (with a zero count this is the architected no-op).
    Control = 0x03,

    /// Basic sense - retrieve sense bytes after a unit check.
    BasicSense = 0x04,

    /// Transfer in channel (branch within the program).
    TransferInChannel = 0x08,

    /// Read backward.
    ReadBackward = 0x0C,

    /// Sense path-group ID.
    SensePathGroupId = 0x34,

    /// Set path-group ID.
    SetPathGroupId = 0xAF,

    /// Sense ID - retrieve device identification.
    SenseId = 0xE4,
}

impl CcwCommand {
    /// Returns the command code as a u8 value.
    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Returns a human-readable name for the command.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Write => "WRITE",
            Self::Read => "READ",
            Self::Control => "CONTROL",
            Self::BasicSense => "BASIC_SENSE",
            Self::TransferInChannel => "TIC",
            Self::ReadBackward => "READ_BACKWARD",
            Self::SensePathGroupId => "SENSE_PGID",
            Self::SetPathGroupId => "SET_PGID",
            Self::SenseId => "SENSE_ID",
        }
    }
}

impl std::fmt::Display for CcwCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({:#04x})", self.name(), self.as_u8())
    }
}

bitflags! {
    /// CCW flags controlling chaining and data handling.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CcwFlags: u8 {
        /// Chain data to the next CCW.
        const CHAIN_DATA = 0x80;
        /// Chain command to the next CCW.
        const CHAIN_COMMAND = 0x40;
        /// Suppress incorrect-length indication.
        const SUPPRESS_LENGTH = 0x20;
        /// Skip data transfer for this CCW.
        const SKIP = 0x10;
        /// Program-controlled interruption after this CCW.
        const PCI = 0x08;
        /// Data address is an indirect-address list.
        const INDIRECT = 0x04;
        /// Suspend channel-program execution at this CCW.
        const SUSPEND = 0x02;
    }
}

/// Data operand of a CCW.
///
/// The engine never dereferences addresses; `Address` is an opaque cookie
/// the embedding environment resolves. Control-type commands that carry a
/// small outbound operand (SET-PGID) embed it inline so the hardware
/// boundary can observe it without an address space.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CcwData {
    /// No data transfer.
    #[default]
    None,
    /// Opaque data-area handle owned by the caller.
    Address(u64),
    /// Inline outbound payload.
    Inline(Vec<u8>),
}

/// One transfer/command descriptor of a channel program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ccw {
    /// Command code.
    pub command: CcwCommand,
    /// Chaining and data-handling flags.
    pub flags: CcwFlags,
    /// Transfer count in bytes.
    pub count: u32,
    /// Data operand.
    pub data: CcwData,
}

impl Ccw {
    /// Create a CCW with no flags and no data.
    pub fn new(command: CcwCommand, count: u32) -> Self {
        Self {
            command,
            flags: CcwFlags::empty(),
            count,
            data: CcwData::None,
        }
    }

    /// Attach a caller-owned data-area handle.
    pub fn with_address(mut self, addr: u64) -> Self {
        self.data = CcwData::Address(addr);
        self
    }

    /// Attach an inline outbound payload.
    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.count = payload.len() as u32;
        self.data = CcwData::Inline(payload);
        self
    }

    /// Set CCW flags.
    pub fn with_flags(mut self, flags: CcwFlags) -> Self {
        self.flags = flags;
        self
    }
}

/// An ordered sequence of CCWs executed by a Start operation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChannelProgram {
    ccws: Vec<Ccw>,
}

impl ChannelProgram {
    /// Create an empty channel program.
    pub fn new() -> Self {
        Self { ccws: Vec::new() }
    }

    /// Create a single-CCW program.
    pub fn single(ccw: Ccw) -> Self {
        Self { ccws: vec![ccw] }
    }

    /// Append a CCW.
    pub fn push(&mut self, ccw: Ccw) {
        self.ccws.push(ccw);
    }

    /// The CCWs in execution order.
    pub fn ccws(&self) -> &[Ccw] {
        &self.ccws
    }

    /// Number of CCWs.
    pub fn len(&self) -> usize {
        self.ccws.len()
    }

    /// True if the program has no CCWs.
    pub fn is_empty(&self) -> bool {
        self.ccws.is_empty()
    }

    /// Command code of the first CCW, if any.
    pub fn first_command(&self) -> Option<CcwCommand> {
        self.ccws.first().map(|c| c.command)
    }

    /// Architected no-op program (control command, zero count).
    pub fn nop() -> Self {
        Self::single(Ccw::new(CcwCommand::Control, 0))
    }

    /// Basic-sense program reading `count` sense bytes.
    pub fn basic_sense(count: u32) -> Self {
        Self::single(Ccw::new(CcwCommand::BasicSense, count))
    }

    /// SET-PGID program carrying the function byte and group id inline.
    pub fn set_path_group(payload: Vec<u8>) -> Self {
        Self::single(Ccw::new(CcwCommand::SetPathGroupId, 0).with_payload(payload))
    }

    /// SENSE-PGID program reading `count` response bytes.
    pub fn sense_path_group(count: u32) -> Self {
        Self::single(Ccw::new(CcwCommand::SensePathGroupId, count))
    }
}
