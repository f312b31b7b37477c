// S/390-style Channel I/O Command/Completion Engine
// Copyright 2026 cio-rust contributors
// SPDX-License-Identifier: MIT

//! # Channel I/O Command/Completion Engine
//!
//! This crate implements the command/completion core of an S/390-style
//! channel subsystem as a pure in-process state-machine library: it
//! tracks subchannels and their path state, dispatches channel programs,
//! decodes multi-fragment completion status, waits synchronously for
//! selected completions and negotiates path-group identities across
//! multi-path devices.
//!
//! The actual channel hardware stays outside: the embedding environment
//! implements the [`ChannelHardware`] boundary (probe, issue, fetch
//! completion, interrupt polling) and forwards interrupt delivery to
//! [`ChannelSubsystem::process_pending`]. A scriptable software
//! implementation ships in [`sim`] for tests, demos and benchmarks.
//!
//! ## Components
//!
//! | Component | Role |
//! |-----------|------|
//! | Registry ([`ChannelSubsystem::validate`], [`ChannelSubsystem::lookup`]) | authoritative table of known subchannels |
//! | Dispatcher ([`ChannelSubsystem::start`], `halt`, `clear`, `resume`, `cancel`) | issues hardware functions, classifies condition codes |
//! | Waiter ([`StartFlags::WAIT_SYNCHRONOUS`]) | bounded busy-poll until a specific completion |
//! | Status processor ([`ChannelSubsystem::process_pending`]) | single decode point for all completion status |
//! | Path groups ([`ChannelSubsystem::verify_paths`]) | multi-path identity negotiation |
//!
//! ## Example
//!
//! ```rust
//! use cio_rust::sim::SimSubsystem;
//! use cio_rust::{
//!     ChannelProgram, ChannelSubsystem, CioConfig, DeviceNumber, PathMask, StartFlags,
//!     SubchannelId,
//! };
//! use std::sync::Arc;
//!
//! let sim = SimSubsystem::new();
//! let id = SubchannelId(0x10);
//! sim.add_device(id, DeviceNumber(0x1000), PathMask::new(0xC0));
//! sim.set_auto_complete(id, true);
//!
//! let cio = ChannelSubsystem::new(sim, CioConfig::default());
//! cio.request(id, Arc::new(|event| {
//!     assert!(event.status.final_status);
//! }))?;
//!
//! cio.start(id, ChannelProgram::nop(), 1, None, StartFlags::empty())?;
//! while cio.process_pending() {}
//! # Ok::<(), cio_rust::CioError>(())
//! ```
//!
//! ## Concurrency
//!
//! Every subchannel is guarded by its own lock, held only for short,
//! bounded critical sections and never across a blocking wait or an
//! owner callback. Requests on one subchannel are strictly ordered
//! relative to the preceding request's completion; across subchannels
//! there is no ordering guarantee. Only synchronous waits suspend the
//! caller, always bounded by the configured budget.

#![allow(dead_code)] // During development

// Module declarations
pub mod command;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod event;
pub mod hw;
pub mod interrupt;
pub mod pathgroup;
pub mod registry;
pub mod sim;
pub mod status;
pub mod subchannel;
mod wait;

// Re-exports for convenient access
pub use command::{Ccw, CcwCommand, CcwData, CcwFlags, ChannelProgram};
pub use dispatcher::StartFlags;
pub use engine::{ChannelSubsystem, CioConfig};
pub use error::{CioError, CioResult};
pub use event::{CompletionEvent, CompletionKind, Handler};
pub use hw::{
    ChannelHardware, IssueKind, IssueResult, MonotonicClock, PathTopology, ProbeResult,
    SubchannelProbe, SystemClock,
};
pub use interrupt::ProcessVerdict;
pub use pathgroup::{PathGroupId, PathGroupState, SpidMode};
pub use registry::{AllowAll, DevicePolicy, UseGuard};
pub use status::{
    CompletionInfo, ConditionCode, DeviceStatus, SenseData, StatusControl, StatusRecord,
    SubchannelStatus,
};
pub use subchannel::{DeviceNumber, PathMask, SubchannelId, SubchannelInfo};
