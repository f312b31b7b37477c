// S/390-style Channel I/O Command/Completion Engine
// Copyright 2026 cio-rust contributors
// SPDX-License-Identifier: MIT

//! Subchannel registry: the authoritative table of known subchannels.
//!
//! A fixed-capacity arena of slots, each guarded by its own lock and
//! addressed by [`SubchannelId`]. The external API takes and returns ids,
//! never references, so the backing store can change without touching the
//! contract. Critical sections are short and bounded; locks are never
//! held across a blocking wait or an owner callback.

use crate::engine::ChannelSubsystem;
use crate::error::{CioError, CioResult};
use crate::hw::{ChannelHardware, PathTopology, ProbeResult};
use crate::subchannel::{DeviceNumber, Subchannel, SubchannelId, SubchannelInfo};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Probe drains attempted before a persistently status-pending
/// subchannel is reported busy.
const MAX_PROBE_DRAINS: u32 = 2;

/// Externally-configured inclusion policy consulted once per validate.
pub trait DevicePolicy: Send + Sync {
    /// Treat this device number as not present regardless of hardware state.
    fn is_blacklisted(&self, devno: DeviceNumber) -> bool;
}

/// Default policy: nothing is blacklisted.
pub struct AllowAll;

impl DevicePolicy for AllowAll {
    fn is_blacklisted(&self, _devno: DeviceNumber) -> bool {
        false
    }
}

/// Fixed arena of per-subchannel slots.
pub(crate) struct SubchannelRegistry {
    slots: Box<[Mutex<Option<Subchannel>>]>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SubchannelRegistry {
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| Mutex::new(None))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { slots }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn check_range(&self, id: SubchannelId) -> CioResult<()> {
        if (id.0 as usize) < self.slots.len() {
            Ok(())
        } else {
            Err(CioError::InvalidHandle)
        }
    }

    /// Run `f` on the slot (vacant or occupied) under its lock.
    pub fn with_slot<R>(
        &self,
        id: SubchannelId,
        f: impl FnOnce(&mut Option<Subchannel>) -> R,
    ) -> CioResult<R> {
        let slot = self
            .slots
            .get(id.0 as usize)
            .ok_or(CioError::InvalidHandle)?;
        Ok(f(&mut lock(slot)))
    }

    /// Run `f` on an existing subchannel under its lock.
    pub fn with_sub<R>(
        &self,
        id: SubchannelId,
        f: impl FnOnce(&mut Subchannel) -> R,
    ) -> CioResult<R> {
        self.with_slot(id, |slot| slot.as_mut().map(f))?
            .ok_or(CioError::InvalidHandle)
    }
}

impl<H: ChannelHardware + PathTopology> ChannelSubsystem<H> {
    /// Probe hardware for a subchannel's current state, creating the
    /// registry entity on first sight.
    ///
    /// Returns `NotPresent` for unknown or blacklisted devices, `NotIo`
    /// for non-I/O subchannels and `NotOperational` when no usable path
    /// exists. A status-pending probe outcome is drained through the
    /// normal completion processor before the probe is retried.
    pub fn validate(&self, id: SubchannelId) -> CioResult<SubchannelInfo> {
        self.registry.check_range(id)?;

        let probe = match self.probe_with_drain(id) {
            Ok(probe) => probe,
            Err(CioError::NotPresent) => {
                self.registry.with_slot(id, |slot| *slot = None)?;
                return Err(CioError::NotPresent);
            }
            Err(err) => return Err(err),
        };

        if self.policy.is_blacklisted(probe.devno) {
            log::debug!("subchannel {id}: device {} blacklisted", probe.devno);
            return Err(CioError::NotPresent);
        }
        if !probe.is_io {
            return Err(CioError::NotIo);
        }

        let opm = probe.usable_paths();
        let info = self.registry.with_slot(id, |slot| {
            let sub = slot.get_or_insert_with(|| {
                log::debug!("subchannel {id}: device {} detected, opm {opm}", probe.devno);
                Subchannel::new(id, probe.devno, opm)
            });
            sub.devno = probe.devno;
            sub.opm = opm;
            sub.operational = !opm.is_empty();
            sub.info()
        })?;

        if !info.operational {
            return Err(CioError::NotOperational);
        }
        Ok(info)
    }

    /// Probe the hardware, draining any pending status that blocks the
    /// answer. A transient status-pending probe outcome is resolved by
    /// processing the pending completion synchronously before retrying.
    pub(crate) fn probe_with_drain(
        &self,
        id: SubchannelId,
    ) -> CioResult<crate::hw::SubchannelProbe> {
        let mut drains = 0;
        loop {
            match self.hw.store_status(id) {
                ProbeResult::NotPresent => return Err(CioError::NotPresent),
                ProbeResult::StatusPending => {
                    drains += 1;
                    if drains > MAX_PROBE_DRAINS {
                        return Err(CioError::Busy);
                    }
                    let _ = self.process_one(id);
                }
                ProbeResult::Info(probe) => return Ok(probe),
            }
        }
    }

    /// Snapshot of a known subchannel.
    pub fn lookup(&self, id: SubchannelId) -> CioResult<SubchannelInfo> {
        self.registry.with_sub(id, |sub| sub.info())
    }

    /// Take a reference-counted use on the subchannel.
    ///
    /// The returned guard releases the reference on every exit path,
    /// including early error returns in the caller. N acquisitions need
    /// N drops before the subchannel returns to an unreferenced state.
    pub fn acquire(&self, id: SubchannelId) -> CioResult<UseGuard<'_, H>> {
        self.registry.with_sub(id, |sub| {
            if !sub.is_available() {
                return Err(CioError::InvalidHandle);
            }
            sub.use_count += 1;
            Ok(())
        })??;
        Ok(UseGuard { cio: self, id })
    }
}

/// Scoped busy reference on a subchannel.
///
/// Dropping the guard decrements the reference taken by
/// [`ChannelSubsystem::acquire`].
pub struct UseGuard<'a, H: ChannelHardware + PathTopology> {
    cio: &'a ChannelSubsystem<H>,
    id: SubchannelId,
}

impl<H: ChannelHardware + PathTopology> UseGuard<'_, H> {
    /// The referenced subchannel.
    pub fn id(&self) -> SubchannelId {
        self.id
    }
}

impl<H: ChannelHardware + PathTopology> Drop for UseGuard<'_, H> {
    fn drop(&mut self) {
        let _ = self.cio.registry.with_sub(self.id, |sub| {
            sub.use_count = sub.use_count.saturating_sub(1);
        });
    }
}
