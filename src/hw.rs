// S/390-style Channel I/O Command/Completion Engine
// Copyright 2026 cio-rust contributors
// SPDX-License-Identifier: MIT

//! The hardware boundary.
//!
//! The engine never touches real channel-subsystem instructions; the
//! embedding environment implements these traits. Every call is
//! retry-free and non-blocking - the only contract is the condition-code
//! meaning documented on [`ChannelHardware::issue`].

use crate::command::ChannelProgram;
use crate::status::{CompletionInfo, ConditionCode};
use crate::subchannel::{DeviceNumber, PathMask, SubchannelId};
use std::time::Instant;

/// Result of probing a subchannel's configuration.
#[derive(Debug, Clone, Copy)]
pub struct SubchannelProbe {
    /// Paths physically installed.
    pub installed: PathMask,
    /// Paths currently available.
    pub available: PathMask,
    /// Paths logically online.
    pub online: PathMask,
    /// True for I/O-class subchannels.
    pub is_io: bool,
    /// Configured device number.
    pub devno: DeviceNumber,
}

impl SubchannelProbe {
    /// The usable path set: installed, available and online.
    pub fn usable_paths(&self) -> PathMask {
        self.installed.narrow(self.available).narrow(self.online)
    }
}

/// Outcome of a store-status probe.
#[derive(Debug, Clone)]
pub enum ProbeResult {
    /// Subchannel exists; configuration follows.
    Info(SubchannelProbe),
    /// Status is pending and must be drained before the probe can answer.
    StatusPending,
    /// No such subchannel.
    NotPresent,
}

/// The hardware function an [`ChannelHardware::issue`] call requests.
#[derive(Debug, Clone)]
pub enum IssueKind {
    /// Start a channel program over the selected paths.
    Start {
        program: ChannelProgram,
        lpm: PathMask,
        deny_prefetch: bool,
        allow_suspend: bool,
    },
    /// Halt the current function.
    Halt,
    /// Clear the subchannel.
    Clear,
    /// Resume a suspended channel program.
    Resume,
    /// Cancel an outstanding start before the device accepted it.
    Cancel,
}

impl IssueKind {
    /// Short name for logs and journals.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Halt => "halt",
            Self::Clear => "clear",
            Self::Resume => "resume",
            Self::Cancel => "cancel",
        }
    }
}

/// Immediate outcome of an issue call.
#[derive(Debug, Clone, Copy)]
pub struct IssueResult {
    /// Condition code of the issue itself.
    pub cc: ConditionCode,
    /// Paths the hardware actually selected; on condition code 3 this
    /// names the paths found not operational (empty means all supplied
    /// paths are affected).
    pub path_used: PathMask,
}

impl IssueResult {
    /// Result carrying only a condition code.
    pub fn code(cc: ConditionCode) -> Self {
        Self {
            cc,
            path_used: PathMask::EMPTY,
        }
    }
}

/// Probe/issue primitive of the channel subsystem.
///
/// Implementations must be callable from any thread and must never block;
/// interrupt delivery is modelled by [`Self::poll_pending`] handing out
/// subchannel ids whose completion status can then be fetched.
pub trait ChannelHardware: Send + Sync {
    /// Probe a subchannel's current configuration.
    fn store_status(&self, id: SubchannelId) -> ProbeResult;

    /// Issue a Start/Halt/Clear/Resume/Cancel function.
    ///
    /// Condition codes: 0 accepted, 1 status pending, 2 busy, 3 not
    /// operational.
    fn issue(&self, id: SubchannelId, kind: IssueKind) -> IssueResult;

    /// Fetch and clear the pending completion status of a subchannel.
    ///
    /// Condition code 0/1 means the returned info is valid; 3 means the
    /// device or path became not operational. `None` info with code 0
    /// indicates a spurious interrupt.
    fn fetch_completion(&self, id: SubchannelId) -> (ConditionCode, Option<CompletionInfo>);

    /// Report one pending interrupt, if any.
    fn poll_pending(&self) -> Option<SubchannelId>;

    /// Reprogram which interrupt class the subchannel raises, entering or
    /// leaving synchronous mode. Condition code 3 means the subchannel
    /// vanished.
    fn reprogram_sync_class(&self, id: SubchannelId, enable: bool) -> ConditionCode;
}

/// Channel-topology query consulted by path verification.
pub trait PathTopology {
    /// True if the path is logically online per the topology layer.
    fn is_path_logically_online(&self, _id: SubchannelId, _path: u8) -> bool {
        true
    }
}

/// Monotonic tick counter used only for bounding synchronous waits.
pub trait MonotonicClock: Send + Sync {
    /// Milliseconds since an arbitrary origin; never goes backwards.
    fn ticks_ms(&self) -> u64;
}

/// Default clock backed by [`std::time::Instant`].
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock for SystemClock {
    fn ticks_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}
