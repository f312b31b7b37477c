// S/390-style Channel I/O Command/Completion Engine
// Copyright 2026 cio-rust contributors
// SPDX-License-Identifier: MIT

//! The channel-subsystem engine facade.

use crate::error::{CioError, CioResult};
use crate::event::Handler;
use crate::hw::{ChannelHardware, MonotonicClock, PathTopology, SystemClock};
use crate::registry::{AllowAll, DevicePolicy, SubchannelRegistry};
use crate::subchannel::{SubchannelFlags, SubchannelId};
use crate::wait::SyncClaim;
use std::sync::atomic::AtomicU64;
use std::time::Duration;

/// Tuning knobs for the engine.
///
/// The retry count and wait budgets are hardware-tuning values carried as
/// configuration defaults, not invariants.
#[derive(Debug, Clone)]
pub struct CioConfig {
    /// Number of subchannel slots in the registry.
    pub capacity: usize,
    /// Budget for one synchronous wait.
    pub sync_timeout: Duration,
    /// Sleep between busy-poll iterations of a synchronous wait.
    pub poll_interval: Duration,
    /// Per-path retry bound for path-group negotiation.
    pub pgid_retries: u32,
}

impl Default for CioConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            sync_timeout: Duration::from_secs(3),
            poll_interval: Duration::from_micros(100),
            pgid_retries: 5,
        }
    }
}

/// Channel I/O command/completion engine.
///
/// Owns the registry of subchannels and drives channel programs against
/// the hardware boundary `H`. All operations are safe to call from any
/// thread; per-subchannel ordering is enforced by the busy flag.
///
/// # Example
///
/// ```rust
/// use cio_rust::{ChannelSubsystem, CioConfig, ChannelProgram, StartFlags};
/// use cio_rust::sim::SimSubsystem;
/// use cio_rust::{SubchannelId, DeviceNumber, PathMask};
/// use std::sync::Arc;
///
/// let sim = SimSubsystem::new();
/// let id = SubchannelId(0x10);
/// sim.add_device(id, DeviceNumber(0x1000), PathMask::new(0xC0));
/// sim.set_auto_complete(id, true);
///
/// let cio = ChannelSubsystem::new(sim, CioConfig::default());
/// cio.request(id, Arc::new(|event| {
///     println!("completion: intent={} kind={:?}", event.intent, event.kind);
/// }))?;
///
/// cio.start(id, ChannelProgram::nop(), 1, None, StartFlags::empty())?;
/// while cio.process_pending() {}
/// # Ok::<(), cio_rust::CioError>(())
/// ```
pub struct ChannelSubsystem<H: ChannelHardware + PathTopology> {
    pub(crate) hw: H,
    pub(crate) config: CioConfig,
    pub(crate) clock: Box<dyn MonotonicClock>,
    pub(crate) registry: SubchannelRegistry,
    pub(crate) sync_claim: SyncClaim,
    pub(crate) policy: Box<dyn DevicePolicy>,
    pub(crate) pgid_counter: AtomicU64,
}

impl<H: ChannelHardware + PathTopology> ChannelSubsystem<H> {
    /// Create an engine over `hw` with the default system clock.
    pub fn new(hw: H, config: CioConfig) -> Self {
        Self::with_clock(hw, config, Box::new(SystemClock::new()))
    }

    /// Create an engine with an explicit monotonic clock.
    pub fn with_clock(hw: H, config: CioConfig, clock: Box<dyn MonotonicClock>) -> Self {
        let registry = SubchannelRegistry::new(config.capacity);
        Self {
            hw,
            config,
            clock,
            registry,
            sync_claim: SyncClaim::new(),
            policy: Box::new(AllowAll),
            pgid_counter: AtomicU64::new(1),
        }
    }

    /// Replace the device inclusion policy.
    pub fn set_device_policy(&mut self, policy: Box<dyn DevicePolicy>) {
        self.policy = policy;
    }

    /// The hardware boundary.
    pub fn hardware(&self) -> &H {
        &self.hw
    }

    /// The active configuration.
    pub fn config(&self) -> &CioConfig {
        &self.config
    }

    /// Claim a subchannel by registering its completion handler.
    ///
    /// Validates the subchannel first; fails with `Busy` when another
    /// owner already holds it.
    pub fn request(&self, id: SubchannelId, handler: Handler) -> CioResult<()> {
        self.validate(id)?;
        self.registry.with_sub(id, |sub| {
            if sub.handler.is_some() {
                return Err(CioError::Busy);
            }
            sub.flags.remove(SubchannelFlags::RELEASE_PENDING);
            sub.handler = Some(handler);
            Ok(())
        })?
    }

    /// Release a claimed subchannel.
    ///
    /// While an interrupt is still outstanding the release is deferred
    /// until the interrupt has been fully drained.
    pub fn free(&self, id: SubchannelId) -> CioResult<()> {
        self.registry.with_sub(id, |sub| {
            if sub.handler.is_none() {
                return Err(CioError::InvalidState("subchannel not claimed"));
            }
            if sub.flags.contains(SubchannelFlags::BUSY) {
                sub.flags.insert(SubchannelFlags::RELEASE_PENDING);
            } else {
                sub.handler = None;
            }
            Ok(())
        })?
    }
}
