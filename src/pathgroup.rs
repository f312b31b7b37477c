// S/390-style Channel I/O Command/Completion Engine
// Copyright 2026 cio-rust contributors
// SPDX-License-Identifier: MIT

//! Path-group management.
//!
//! A path group gives a multi-path device one identity for its logical
//! owner, so requests arriving over different physical paths are
//! recognized as coming from the same place. SET-PGID establishes the
//! group path by path; SENSE-PGID probes for an identity someone else
//! (e.g. a hypervisor) may already have established.

use crate::command::ChannelProgram;
use crate::dispatcher::{fire, Callbacks, StartFlags};
use crate::engine::ChannelSubsystem;
use crate::error::{CioError, CioResult};
use crate::event::{CompletionEvent, CompletionKind};
use crate::hw::{ChannelHardware, PathTopology};
use crate::subchannel::{DeviceNumber, PathMask, SubchannelFlags, SubchannelId};
use std::sync::atomic::Ordering;

/// Negotiated 8-byte path-group identifier.
///
/// Generated once per subchannel and stable until teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathGroupId([u8; Self::LEN]);

impl PathGroupId {
    /// Identifier length in bytes.
    pub const LEN: usize = 8;

    /// Derive a fresh identifier from a process-wide counter and the
    /// device number.
    pub fn generate(counter: u64, devno: DeviceNumber) -> Self {
        let mut bytes = [0u8; Self::LEN];
        bytes[..2].copy_from_slice(&devno.0.to_be_bytes());
        bytes[2..].copy_from_slice(&counter.to_be_bytes()[2..]);
        Self(bytes)
    }

    /// Build from raw bytes; `None` unless at least [`Self::LEN`] bytes
    /// are given.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < Self::LEN {
            return None;
        }
        let mut bytes = [0u8; Self::LEN];
        bytes.copy_from_slice(&data[..Self::LEN]);
        Some(Self(bytes))
    }

    /// The raw identifier bytes.
    pub fn as_bytes(&self) -> &[u8; Self::LEN] {
        &self.0
    }
}

impl std::fmt::Display for PathGroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// Group state encoded in the first byte of a SENSE-PGID response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathGroupState {
    /// No group established.
    Reset,
    /// Paths known but not grouped.
    Ungrouped,
    /// Group established.
    Grouped,
}

impl PathGroupState {
    /// Decode the state byte; `None` for garbage.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Reset),
            1 => Some(Self::Ungrouped),
            2 => Some(Self::Grouped),
            _ => None,
        }
    }

    /// Encode the state byte.
    pub fn as_byte(self) -> u8 {
        match self {
            Self::Reset => 0,
            Self::Ungrouped => 1,
            Self::Grouped => 2,
        }
    }
}

/// SET-PGID addressing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpidMode {
    /// Establish the group for all paths at once.
    MultiPath,
    /// Establish the group one path at a time.
    SinglePath,
}

impl SpidMode {
    /// Function byte of the SET-PGID operand: establish function plus
    /// the multi-path bit.
    pub fn function_byte(self) -> u8 {
        match self {
            Self::MultiPath => SPID_FUNC_MULTI_PATH | SPID_FUNC_ESTABLISH,
            Self::SinglePath => SPID_FUNC_ESTABLISH,
        }
    }
}

/// SET-PGID establish function.
pub const SPID_FUNC_ESTABLISH: u8 = 0x00;
/// SET-PGID disband function.
pub const SPID_FUNC_DISBAND: u8 = 0x20;
/// SET-PGID resign function.
pub const SPID_FUNC_RESIGN: u8 = 0x40;
/// Multi-path mode bit of the SET-PGID function byte.
pub const SPID_FUNC_MULTI_PATH: u8 = 0x80;

/// Length of a SENSE-PGID response: state byte plus identifier.
pub const SNID_RESPONSE_LEN: usize = 1 + PathGroupId::LEN;

impl<H: ChannelHardware + PathTopology> ChannelSubsystem<H> {
    /// Establish `pgid` across the selected paths, one path per attempt.
    ///
    /// The first path is tried in multi-path mode; a command reject there
    /// falls back once to single-path mode, and whichever mode succeeded
    /// is reused for every later path. Busy/error outcomes retry up to
    /// the configured bound per path; a path found not operational is
    /// demoted and negotiation continues with partial coverage.
    pub fn set_path_group_id(
        &self,
        id: SubchannelId,
        mask: PathMask,
        pgid: PathGroupId,
    ) -> CioResult<()> {
        let opm = self.lookup(id)?.opm;
        let mask = mask.narrow(opm);
        if mask.is_empty() {
            return Err(CioError::NotOperational);
        }

        let mut mode = SpidMode::MultiPath;
        let mut first_path = true;
        for path in mask.paths() {
            let mut retries = self.config.pgid_retries;
            loop {
                match self.spid_one(id, PathMask::single(path), &pgid, mode) {
                    Ok(()) => break,
                    Err(CioError::Unsupported) => {
                        if first_path && mode == SpidMode::MultiPath && retries > 0 {
                            // The fallback consumes one retry.
                            log::debug!(
                                "subchannel {id}: multi-path SET-PGID rejected, \
                                 falling back to single-path"
                            );
                            mode = SpidMode::SinglePath;
                            retries -= 1;
                            continue;
                        }
                        return Err(CioError::Unsupported);
                    }
                    Err(CioError::NotOperational) => {
                        log::debug!("subchannel {id}: path {path} lost during SET-PGID");
                        self.registry.with_sub(id, |sub| {
                            sub.demote_paths(PathMask::single(path));
                        })?;
                        break;
                    }
                    Err(err @ (CioError::Busy | CioError::IoError { .. })) => {
                        if retries == 0 {
                            return Err(err);
                        }
                        retries -= 1;
                    }
                    Err(err) => return Err(err),
                }
            }
            first_path = false;
        }

        self.registry
            .with_sub(id, |sub| sub.path_group = Some(pgid))?;
        Ok(())
    }

    fn spid_one(
        &self,
        id: SubchannelId,
        lpm: PathMask,
        pgid: &PathGroupId,
        mode: SpidMode,
    ) -> CioResult<()> {
        let mut payload = Vec::with_capacity(1 + PathGroupId::LEN);
        payload.push(mode.function_byte());
        payload.extend_from_slice(pgid.as_bytes());

        self.start_internal(
            id,
            ChannelProgram::set_path_group(payload),
            0,
            Some(lpm),
            StartFlags::SUPPRESS_CALLBACK | StartFlags::WAIT_SYNCHRONOUS,
        )?;

        let record = self.status(id)?;
        if record.unit_check() {
            if record.sense_valid && record.sense.command_reject() {
                return Err(CioError::Unsupported);
            }
            return Err(CioError::IoError {
                cstat: record.cstat.bits(),
                dstat: record.dstat.bits(),
            });
        }
        Ok(())
    }

    /// Probe the group identity over one path set.
    ///
    /// Returns the device-reported state and identifier. A malformed
    /// response is reported as `Unsupported`.
    pub fn sense_path_group_id(
        &self,
        id: SubchannelId,
        mask: PathMask,
    ) -> CioResult<(PathGroupState, PathGroupId)> {
        let opm = self.lookup(id)?.opm;
        let lpm = mask.narrow(opm);
        if lpm.is_empty() {
            return Err(CioError::NotOperational);
        }

        self.start_internal(
            id,
            ChannelProgram::sense_path_group(SNID_RESPONSE_LEN as u32),
            0,
            Some(lpm),
            StartFlags::SUPPRESS_CALLBACK | StartFlags::WAIT_SYNCHRONOUS,
        )?;

        let record = self.status(id)?;
        if record.unit_check() {
            return Err(CioError::Unsupported);
        }
        if record.data.len() < SNID_RESPONSE_LEN {
            return Err(CioError::Unsupported);
        }
        let state = PathGroupState::from_byte(record.data[0]).ok_or(CioError::Unsupported)?;
        let pgid = PathGroupId::from_bytes(&record.data[1..]).ok_or(CioError::Unsupported)?;
        Ok((state, pgid))
    }

    /// Re-verify the path set and (re-)establish the path group.
    ///
    /// The operational mask is re-probed and narrowed by the topology
    /// layer's logically-offline paths and by `user_mask`. Empty-to-usable
    /// transitions (and back) are reported to the owner handler. A device
    /// with a single remaining path is exempt from grouping.
    pub fn verify_paths(&self, id: SubchannelId, user_mask: Option<PathMask>) -> CioResult<()> {
        self.registry.check_range(id)?;

        let probe = match self.probe_with_drain(id) {
            Ok(probe) => probe,
            Err(CioError::NotPresent) => {
                let mut callbacks = Callbacks::new();
                let _ = self.registry.with_sub(id, |sub| {
                    if sub.operational {
                        sub.operational = false;
                        sub.opm = PathMask::EMPTY;
                        if let Some(handler) = sub.handler.clone() {
                            callbacks.push((
                                handler,
                                CompletionEvent {
                                    id,
                                    intent: 0,
                                    kind: CompletionKind::DeviceGone,
                                    status: sub.status.clone(),
                                },
                            ));
                        }
                    }
                });
                fire(callbacks);
                return Err(CioError::NotPresent);
            }
            Err(err) => return Err(err),
        };

        let mut mask = probe.usable_paths();
        for path in mask.paths().collect::<Vec<_>>() {
            if !self.hw.is_path_logically_online(id, path) {
                mask = mask.without(PathMask::single(path));
            }
        }
        if let Some(user) = user_mask {
            mask = mask.narrow(user);
        }

        let mut callbacks = Callbacks::new();
        let (supported, existing, devno) = self.registry.with_sub(id, |sub| {
            let was_operational = sub.operational;
            sub.opm = mask;
            sub.operational = !mask.is_empty();
            if was_operational != sub.operational {
                if let Some(handler) = sub.handler.clone() {
                    let kind = if sub.operational {
                        CompletionKind::DeviceOnline
                    } else {
                        CompletionKind::DeviceGone
                    };
                    callbacks.push((
                        handler,
                        CompletionEvent {
                            id,
                            intent: 0,
                            kind,
                            status: sub.status.clone(),
                        },
                    ));
                }
            }
            (
                sub.flags.contains(SubchannelFlags::PGID_SUPPORTED),
                sub.path_group,
                sub.devno,
            )
        })?;
        fire(callbacks);

        if mask.is_empty() {
            return Err(CioError::NotOperational);
        }

        // Single-path devices skip grouping entirely.
        if mask.count() == 1 {
            self.registry.with_sub(id, |sub| {
                sub.flags.remove(SubchannelFlags::PGID_SUPPORTED);
            })?;
            return Ok(());
        }
        if !supported {
            return Ok(());
        }

        let pgid = existing.unwrap_or_else(|| {
            PathGroupId::generate(self.pgid_counter.fetch_add(1, Ordering::Relaxed), devno)
        });
        match self.set_path_group_id(id, mask, pgid) {
            Ok(()) => Ok(()),
            Err(CioError::Unsupported) => self.adopt_or_disable(id, mask),
            Err(err) => Err(err),
        }
    }

    /// SET-PGID was rejected outright: look for a foreign group identity
    /// before writing the device off as ungroupable.
    fn adopt_or_disable(&self, id: SubchannelId, mask: PathMask) -> CioResult<()> {
        let first = mask
            .first_path()
            .map(PathMask::single)
            .unwrap_or(PathMask::EMPTY);
        match self.sense_path_group_id(id, first) {
            Ok((PathGroupState::Grouped, foreign)) => {
                log::debug!("subchannel {id}: adopting foreign path group {foreign}");
                self.registry.with_sub(id, |sub| {
                    sub.path_group = Some(foreign);
                })?;
                Ok(())
            }
            _ => {
                log::debug!("subchannel {id}: path grouping disabled");
                self.registry.with_sub(id, |sub| {
                    sub.flags.remove(SubchannelFlags::PGID_SUPPORTED);
                })?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CcwCommand, CcwData};
    use crate::engine::CioConfig;
    use crate::event::Handler;
    use crate::hw::{IssueKind, IssueResult};
    use crate::sim::{SimOp, SimSubsystem};
    use crate::status::{CompletionInfo, ConditionCode};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn config() -> CioConfig {
        CioConfig {
            poll_interval: Duration::ZERO,
            ..CioConfig::default()
        }
    }

    fn engine(opm: u8) -> (ChannelSubsystem<SimSubsystem>, SubchannelId) {
        let sim = SimSubsystem::new();
        let id = SubchannelId(0x10);
        sim.add_device(id, DeviceNumber(0x8123), PathMask::new(opm));
        let cio = ChannelSubsystem::new(sim, config());
        cio.validate(id).unwrap();
        (cio, id)
    }

    /// Function byte and path mask of every SET-PGID issued so far.
    fn spid_attempts(cio: &ChannelSubsystem<SimSubsystem>, id: SubchannelId) -> Vec<(u8, u8)> {
        cio.hardware()
            .issues(id)
            .iter()
            .filter_map(|rec| match &rec.kind {
                IssueKind::Start { program, lpm, .. }
                    if program.first_command() == Some(CcwCommand::SetPathGroupId) =>
                {
                    match &program.ccws()[0].data {
                        CcwData::Inline(payload) => Some((payload[0], lpm.bits())),
                        _ => None,
                    }
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_pgid_round_trip() {
        let (cio, id) = engine(0xC0);
        let pgid = PathGroupId::generate(42, DeviceNumber(0x8123));

        cio.set_path_group_id(id, PathMask::ALL, pgid).unwrap();
        assert_eq!(cio.lookup(id).unwrap().path_group, Some(pgid));

        let (state, sensed) = cio
            .sense_path_group_id(id, PathMask::single(0))
            .unwrap();
        assert_eq!(state, PathGroupState::Grouped);
        assert_eq!(sensed, pgid);
    }

    #[test]
    fn test_set_pgid_covers_each_selected_path() {
        let (cio, id) = engine(0xE0);
        let pgid = PathGroupId::generate(1, DeviceNumber(0x8123));
        cio.set_path_group_id(id, PathMask::ALL, pgid).unwrap();

        let attempts = spid_attempts(&cio, id);
        assert_eq!(attempts.len(), 3);
        // One path per call, highest priority first, multi-path mode.
        assert_eq!(attempts[0], (SPID_FUNC_MULTI_PATH, 0x80));
        assert_eq!(attempts[1], (SPID_FUNC_MULTI_PATH, 0x40));
        assert_eq!(attempts[2], (SPID_FUNC_MULTI_PATH, 0x20));
    }

    #[test]
    fn test_scenario_e_single_path_fallback() {
        let (cio, id) = engine(0xC0);
        // First path's multi-path attempt draws a command reject.
        cio.hardware().queue_response(
            id,
            CompletionInfo::unit_check().with_sense(&[0x80]),
        );
        let pgid = PathGroupId::generate(7, DeviceNumber(0x8123));
        cio.set_path_group_id(id, PathMask::ALL, pgid).unwrap();

        let attempts = spid_attempts(&cio, id);
        // Exactly one fallback retry on path 0, then single-path mode
        // for every subsequent path with no multi-path re-attempt.
        assert_eq!(
            attempts,
            vec![
                (SPID_FUNC_MULTI_PATH, 0x80),
                (SPID_FUNC_ESTABLISH, 0x80),
                (SPID_FUNC_ESTABLISH, 0x40),
            ]
        );
    }

    #[test]
    fn test_pgid_retries_then_gives_up() {
        let (cio, id) = engine(0x80);
        // Busy on every attempt: the configured bound caps the retries.
        for _ in 0..16 {
            cio.hardware()
                .script_issue(id, SimOp::Start, IssueResult::code(ConditionCode::Busy));
        }
        let pgid = PathGroupId::generate(3, DeviceNumber(0x8123));
        let err = cio.set_path_group_id(id, PathMask::ALL, pgid).unwrap_err();
        assert!(matches!(err, CioError::Busy));
        assert!(cio.lookup(id).unwrap().path_group.is_none());
    }

    #[test]
    fn test_pgid_path_loss_is_partial_coverage() {
        let (cio, id) = engine(0xC0);
        // Path 0's attempt finds the path gone; negotiation continues.
        cio.hardware().script_issue(
            id,
            SimOp::Start,
            IssueResult {
                cc: ConditionCode::NotOperational,
                path_used: PathMask::new(0x80),
            },
        );
        let pgid = PathGroupId::generate(9, DeviceNumber(0x8123));
        cio.set_path_group_id(id, PathMask::ALL, pgid).unwrap();

        let info = cio.lookup(id).unwrap();
        assert_eq!(info.opm.bits(), 0x40);
        assert_eq!(info.path_group, Some(pgid));
    }

    #[test]
    fn test_verify_paths_single_path_exemption() {
        let (cio, id) = engine(0x80);
        cio.verify_paths(id, None).unwrap();
        assert!(spid_attempts(&cio, id).is_empty());
        // Support is cleared for good: multi-path reappearing later does
        // not re-enable negotiation.
        cio.hardware()
            .set_paths(id, PathMask::new(0xC0));
        cio.verify_paths(id, None).unwrap();
        assert!(spid_attempts(&cio, id).is_empty());
    }

    #[test]
    fn test_verify_paths_establishes_and_reuses_pgid() {
        let (cio, id) = engine(0xC0);
        cio.verify_paths(id, None).unwrap();
        let first = cio.lookup(id).unwrap().path_group.unwrap();

        cio.verify_paths(id, None).unwrap();
        let second = cio.lookup(id).unwrap().path_group.unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_verify_paths_narrows_by_topology() {
        let (cio, id) = engine(0xE0);
        cio.hardware().set_logically_offline(id, 1, true);
        cio.verify_paths(id, None).unwrap();
        assert_eq!(cio.lookup(id).unwrap().opm.bits(), 0xA0);
    }

    #[test]
    fn test_verify_paths_transition_events() {
        let sim = SimSubsystem::new();
        let id = SubchannelId(0x10);
        sim.add_device(id, DeviceNumber(0x8123), PathMask::new(0x80));
        let cio = ChannelSubsystem::new(sim, config());
        cio.validate(id).unwrap();

        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        let handler: Handler = Arc::new(move |ev| sink.lock().unwrap().push(ev.kind));
        cio.request(id, handler).unwrap();

        cio.hardware().set_paths(id, PathMask::EMPTY);
        assert!(matches!(
            cio.verify_paths(id, None),
            Err(CioError::NotOperational)
        ));
        cio.hardware().set_paths(id, PathMask::new(0x80));
        cio.verify_paths(id, None).unwrap();

        assert_eq!(
            log.lock().unwrap().as_slice(),
            &[CompletionKind::DeviceGone, CompletionKind::DeviceOnline]
        );
    }

    #[test]
    fn test_foreign_pgid_is_adopted() {
        let (cio, id) = engine(0xC0);
        let foreign = PathGroupId::from_bytes(&[9, 9, 9, 9, 1, 2, 3, 4]).unwrap();

        // Both establish attempts on path 0 draw command rejects, then
        // the SENSE-PGID probe reports an existing group.
        let reject = CompletionInfo::unit_check().with_sense(&[0x80]);
        cio.hardware().queue_response(id, reject.clone());
        cio.hardware().queue_response(id, reject);
        let mut response = vec![PathGroupState::Grouped.as_byte()];
        response.extend_from_slice(foreign.as_bytes());
        cio.hardware()
            .queue_response(id, CompletionInfo::final_ok().with_data(response));

        cio.verify_paths(id, None).unwrap();
        assert_eq!(cio.lookup(id).unwrap().path_group, Some(foreign));
    }

    #[test]
    fn test_ungrouped_sense_disables_support() {
        let (cio, id) = engine(0xC0);
        let reject = CompletionInfo::unit_check().with_sense(&[0x80]);
        cio.hardware().queue_response(id, reject.clone());
        cio.hardware().queue_response(id, reject);
        let mut response = vec![PathGroupState::Ungrouped.as_byte()];
        response.extend_from_slice(&[0u8; PathGroupId::LEN]);
        cio.hardware()
            .queue_response(id, CompletionInfo::final_ok().with_data(response));

        cio.verify_paths(id, None).unwrap();
        assert!(cio.lookup(id).unwrap().path_group.is_none());

        // Support is permanently off: nothing is issued next time.
        let before = cio.hardware().issues(id).len();
        cio.verify_paths(id, None).unwrap();
        assert_eq!(cio.hardware().issues(id).len(), before);
    }

    #[test]
    fn test_admin_negotiation_never_calls_owner_back() {
        let (cio, id) = engine(0xC0);
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        let handler: Handler = Arc::new(move |ev| sink.lock().unwrap().push(ev.clone()));
        cio.request(id, handler).unwrap();

        cio.verify_paths(id, None).unwrap();
        assert!(log.lock().unwrap().is_empty());
    }
}
