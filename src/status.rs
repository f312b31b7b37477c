// S/390-style Channel I/O Command/Completion Engine
// Copyright 2026 cio-rust contributors
// SPDX-License-Identifier: MIT

//! Condition codes, completion status and the accumulated status record.
//!
//! Status for one outstanding operation may arrive spread over several
//! interrupts (primary, intermediate, secondary). The [`StatusRecord`]
//! accumulates those fragments; [`StatusRecord::ending_status`] decides
//! when an operation is fully done.

use crate::subchannel::PathMask;
use bitflags::bitflags;

/// Immediate 0-3 result of issuing a hardware operation.
///
/// Distinct from the later asynchronous completion status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConditionCode {
    /// Operation accepted, completion will be signalled later.
    Accepted = 0,
    /// Status is already pending on the subchannel.
    StatusPending = 1,
    /// Subchannel or device busy.
    Busy = 2,
    /// Device or path not operational.
    NotOperational = 3,
}

impl From<u8> for ConditionCode {
    fn from(cc: u8) -> Self {
        match cc & 0x03 {
            0 => Self::Accepted,
            1 => Self::StatusPending,
            2 => Self::Busy,
            _ => Self::NotOperational,
        }
    }
}

bitflags! {
    /// Device-status byte reported by the device.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DeviceStatus: u8 {
        /// Attention.
        const ATTENTION = 0x80;
        /// Status modifier.
        const STATUS_MODIFIER = 0x40;
        /// Control-unit end.
        const CONTROL_UNIT_END = 0x20;
        /// Device busy.
        const BUSY = 0x10;
        /// Channel end.
        const CHANNEL_END = 0x08;
        /// Device end.
        const DEVICE_END = 0x04;
        /// Unit check - sense data is available or must be retrieved.
        const UNIT_CHECK = 0x02;
        /// Unit exception.
        const UNIT_EXCEPTION = 0x01;
    }
}

bitflags! {
    /// Subchannel-status byte reported by the channel.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SubchannelStatus: u8 {
        /// Program-controlled interruption.
        const PCI = 0x80;
        /// Incorrect length.
        const INCORRECT_LENGTH = 0x40;
        /// Program check.
        const PROGRAM_CHECK = 0x20;
        /// Protection check.
        const PROTECTION_CHECK = 0x10;
        /// Channel-data check.
        const CHANNEL_DATA_CHECK = 0x08;
        /// Channel-control check.
        const CHANNEL_CONTROL_CHECK = 0x04;
        /// Interface-control check.
        const INTERFACE_CONTROL_CHECK = 0x02;
        /// Chaining check.
        const CHAINING_CHECK = 0x01;
    }
}

bitflags! {
    /// Status-control bits classifying a completion fragment.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StatusControl: u8 {
        /// Alert status.
        const ALERT = 0x80;
        /// Intermediate status.
        const INTERMEDIATE = 0x40;
        /// Primary status.
        const PRIMARY = 0x20;
        /// Secondary status.
        const SECONDARY = 0x10;
        /// Status pending.
        const STATUS_PENDING = 0x08;
        /// Channel program suspended.
        const SUSPENDED = 0x04;
        /// Device still active.
        const DEVICE_ACTIVE = 0x02;
        /// Subchannel still active.
        const SUBCHANNEL_ACTIVE = 0x01;
    }
}

/// Fixed-size sense buffer retrieved after a unit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenseData {
    bytes: [u8; Self::CAPACITY],
    len: u8,
}

impl SenseData {
    /// Architected basic-sense buffer size.
    pub const CAPACITY: usize = 32;

    /// Empty sense buffer.
    pub const fn empty() -> Self {
        Self {
            bytes: [0; Self::CAPACITY],
            len: 0,
        }
    }

    /// Build from raw bytes, truncating at [`Self::CAPACITY`].
    pub fn from_slice(data: &[u8]) -> Self {
        let mut bytes = [0u8; Self::CAPACITY];
        let len = data.len().min(Self::CAPACITY);
        bytes[..len].copy_from_slice(&data[..len]);
        Self {
            bytes,
            len: len as u8,
        }
    }

    /// The valid sense bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    /// True if no sense bytes are present.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Command-reject indication (bit 0 of sense byte 0).
    pub fn command_reject(&self) -> bool {
        self.len > 0 && self.bytes[0] & 0x80 != 0
    }
}

impl Default for SenseData {
    fn default() -> Self {
        Self::empty()
    }
}

/// One completion fragment as delivered by the hardware boundary.
#[derive(Debug, Clone, Default)]
pub struct CompletionInfo {
    /// Status-control classification of this fragment.
    pub control: StatusControl,
    /// Device-status byte.
    pub dstat: DeviceStatus,
    /// Subchannel-status byte.
    pub cstat: SubchannelStatus,
    /// Residual byte count of the interrupted/completed transfer.
    pub residual: u32,
    /// Paths the operation actually used.
    pub path_used: PathMask,
    /// Concurrent-sense payload, when the facility applies.
    pub sense: Option<SenseData>,
    /// Inbound data transferred by read-type commands.
    pub data: Vec<u8>,
}

impl CompletionInfo {
    /// Final status: channel end + device end, all clean.
    pub fn final_ok() -> Self {
        Self {
            control: StatusControl::SECONDARY | StatusControl::STATUS_PENDING,
            dstat: DeviceStatus::CHANNEL_END | DeviceStatus::DEVICE_END,
            ..Self::default()
        }
    }

    /// Primary status only; the device is still working.
    pub fn primary_only() -> Self {
        Self {
            control: StatusControl::PRIMARY
                | StatusControl::STATUS_PENDING
                | StatusControl::DEVICE_ACTIVE,
            dstat: DeviceStatus::CHANNEL_END,
            ..Self::default()
        }
    }

    /// Final status with a unit check; sense must be retrieved separately
    /// unless a concurrent-sense payload is attached with [`Self::with_sense`].
    pub fn unit_check() -> Self {
        Self {
            control: StatusControl::ALERT | StatusControl::STATUS_PENDING,
            dstat: DeviceStatus::UNIT_CHECK,
            ..Self::default()
        }
    }

    /// Attach a concurrent-sense payload.
    pub fn with_sense(mut self, sense: &[u8]) -> Self {
        self.sense = Some(SenseData::from_slice(sense));
        self
    }

    /// Attach inbound data.
    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = data;
        self
    }

    /// Set the residual count.
    pub fn with_residual(mut self, residual: u32) -> Self {
        self.residual = residual;
        self
    }

    /// Set the path-used mask.
    pub fn with_path_used(mut self, mask: PathMask) -> Self {
        self.path_used = mask;
        self
    }
}

/// Public accumulated status record for one outstanding operation.
///
/// Status bytes are OR-accumulated across interrupts; the record is reset
/// when a new operation starts (unless a sense retrieval is still pending).
#[derive(Debug, Clone, Default)]
pub struct StatusRecord {
    /// Accumulated device-status byte.
    pub dstat: DeviceStatus,
    /// Accumulated subchannel-status byte.
    pub cstat: SubchannelStatus,
    /// Accumulated status-control bits.
    pub control: StatusControl,
    /// Residual count from the most recent fragment.
    pub residual: u32,
    /// Sense bytes, valid only when `sense_valid` is set.
    pub sense: SenseData,
    /// True once sense bytes have been retrieved or delivered concurrently.
    pub sense_valid: bool,
    /// Inbound data from read-type commands.
    pub data: Vec<u8>,
    /// True once final status has been received.
    pub final_status: bool,
}

impl StatusRecord {
    /// Reset the record for a new operation.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Fold one completion fragment into the record.
    pub fn accumulate(&mut self, info: &CompletionInfo) {
        self.dstat |= info.dstat;
        self.cstat |= info.cstat;
        self.control |= info.control;
        self.residual = info.residual;
        if let Some(sense) = info.sense {
            self.sense = sense;
            self.sense_valid = true;
        }
        if !info.data.is_empty() {
            self.data = info.data.clone();
        }
    }

    /// Ending-status predicate.
    ///
    /// True when secondary status is present, when alert status is pending
    /// without primary, or when status-pending arrived alone with no
    /// intermediate or activity indication.
    pub fn ending_status(&self) -> bool {
        let c = self.control;
        if c.contains(StatusControl::SECONDARY) {
            return true;
        }
        if c.contains(StatusControl::ALERT | StatusControl::STATUS_PENDING)
            && !c.contains(StatusControl::PRIMARY)
        {
            return true;
        }
        c == StatusControl::STATUS_PENDING
    }

    /// True if a unit check has been reported.
    pub fn unit_check(&self) -> bool {
        self.dstat.contains(DeviceStatus::UNIT_CHECK)
    }

    /// True if a channel-control or interface-control check is recorded.
    pub fn channel_check(&self) -> bool {
        self.cstat.intersects(
            SubchannelStatus::CHANNEL_CONTROL_CHECK | SubchannelStatus::INTERFACE_CONTROL_CHECK,
        )
    }

    /// True if the record carries any error status.
    pub fn is_error(&self) -> bool {
        self.unit_check()
            || self
                .dstat
                .contains(DeviceStatus::UNIT_EXCEPTION)
            || !self.cstat.is_empty()
    }
}
