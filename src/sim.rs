// S/390-style Channel I/O Command/Completion Engine
// Copyright 2026 cio-rust contributors
// SPDX-License-Identifier: MIT

//! Simulated channel subsystem.
//!
//! An in-process, scriptable implementation of the hardware boundary for
//! tests, demos and benchmarks. Devices are registered up front;
//! condition codes, probe outcomes and completion fragments can be
//! scripted per subchannel, and every issued function is journalled for
//! assertions.
//!
//! Control-type commands the engine issues internally (SET-PGID,
//! SENSE-PGID, basic sense) are answered automatically with emulated
//! device semantics unless a scripted response overrides them.

use crate::command::{CcwCommand, CcwData, ChannelProgram};
use crate::hw::{
    ChannelHardware, IssueKind, IssueResult, MonotonicClock, PathTopology, ProbeResult,
    SubchannelProbe,
};
use crate::pathgroup::{PathGroupId, PathGroupState};
use crate::status::{CompletionInfo, ConditionCode};
use crate::subchannel::{DeviceNumber, PathMask, SubchannelId};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Function selector for scripted condition codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimOp {
    Start,
    Halt,
    Clear,
    Resume,
    Cancel,
}

impl SimOp {
    fn of(kind: &IssueKind) -> Self {
        match kind {
            IssueKind::Start { .. } => Self::Start,
            IssueKind::Halt => Self::Halt,
            IssueKind::Clear => Self::Clear,
            IssueKind::Resume => Self::Resume,
            IssueKind::Cancel => Self::Cancel,
        }
    }
}

/// One journalled issue call.
#[derive(Debug, Clone)]
pub struct SimIssue {
    pub kind: IssueKind,
}

#[derive(Default)]
struct SimDevice {
    devno: DeviceNumber,
    paths: PathMask,
    is_io: bool,
    gone: bool,
    auto_complete: bool,
    fail_reprogram: bool,
    probe_overrides: VecDeque<ProbeResult>,
    issue_scripts: HashMap<SimOp, VecDeque<IssueResult>>,
    queued_responses: VecDeque<CompletionInfo>,
    completions: VecDeque<CompletionInfo>,
    sense_bytes: Vec<u8>,
    pgid_store: Option<(PathGroupState, [u8; PathGroupId::LEN])>,
    offline_paths: PathMask,
    journal: Vec<SimIssue>,
}

struct SimState {
    devices: HashMap<u16, SimDevice>,
    pending: VecDeque<SubchannelId>,
    scheduled: Vec<(SubchannelId, CompletionInfo, u64)>,
    polls: u64,
    sync_journal: Vec<(SubchannelId, bool)>,
}

/// Scriptable software channel subsystem.
pub struct SimSubsystem {
    state: Mutex<SimState>,
}

fn lock(m: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SimSubsystem {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState {
                devices: HashMap::new(),
                pending: VecDeque::new(),
                scheduled: Vec::new(),
                polls: 0,
                sync_journal: Vec::new(),
            }),
        }
    }

    /// Register a device behind subchannel `id` with the given path set.
    pub fn add_device(&self, id: SubchannelId, devno: DeviceNumber, paths: PathMask) {
        lock(&self.state).devices.insert(
            id.0,
            SimDevice {
                devno,
                paths,
                is_io: true,
                ..SimDevice::default()
            },
        );
    }

    /// Mark the subchannel as (not) I/O-class.
    pub fn set_is_io(&self, id: SubchannelId, is_io: bool) {
        self.with_device(id, |dev| dev.is_io = is_io);
    }

    /// Replace the device's installed/available/online path set.
    pub fn set_paths(&self, id: SubchannelId, paths: PathMask) {
        self.with_device(id, |dev| dev.paths = paths);
    }

    /// Make fetch-completion report the device not operational.
    pub fn set_gone(&self, id: SubchannelId, gone: bool) {
        self.with_device(id, |dev| dev.gone = gone);
    }

    /// Answer every accepted start with a clean final completion.
    pub fn set_auto_complete(&self, id: SubchannelId, auto: bool) {
        self.with_device(id, |dev| dev.auto_complete = auto);
    }

    /// Make synchronous-class reprogramming fail for this subchannel.
    pub fn fail_reprogram(&self, id: SubchannelId, fail: bool) {
        self.with_device(id, |dev| dev.fail_reprogram = fail);
    }

    /// Sense bytes returned for automatic basic-sense responses.
    pub fn set_sense(&self, id: SubchannelId, bytes: &[u8]) {
        let bytes = bytes.to_vec();
        self.with_device(id, move |dev| dev.sense_bytes = bytes);
    }

    /// Mark a path logically offline for the topology query.
    pub fn set_logically_offline(&self, id: SubchannelId, path: u8, offline: bool) {
        self.with_device(id, |dev| {
            if offline {
                dev.offline_paths = dev.offline_paths | PathMask::single(path);
            } else {
                dev.offline_paths = dev.offline_paths.without(PathMask::single(path));
            }
        });
    }

    /// Queue a one-shot probe outcome consumed before the steady state.
    pub fn push_probe_override(&self, id: SubchannelId, result: ProbeResult) {
        self.with_device(id, move |dev| dev.probe_overrides.push_back(result));
    }

    /// Queue the condition code returned by the next issue of `op`.
    pub fn script_issue(&self, id: SubchannelId, op: SimOp, result: IssueResult) {
        self.with_device(id, move |dev| {
            dev.issue_scripts.entry(op).or_default().push_back(result);
        });
    }

    /// Queue the completion answering the next accepted start,
    /// overriding the emulated device semantics.
    pub fn queue_response(&self, id: SubchannelId, info: CompletionInfo) {
        self.with_device(id, move |dev| dev.queued_responses.push_back(info));
    }

    /// Deliver a completion fragment and raise its interrupt.
    pub fn push_completion(&self, id: SubchannelId, info: CompletionInfo) {
        let mut state = lock(&self.state);
        if let Some(dev) = state.devices.get_mut(&id.0) {
            dev.completions.push_back(info);
        }
        state.pending.push_back(id);
    }

    /// Raise an interrupt without queueing a completion.
    pub fn raise_interrupt(&self, id: SubchannelId) {
        lock(&self.state).pending.push_back(id);
    }

    /// Deliver a completion after `polls` further poll calls.
    pub fn schedule_completion_after_polls(
        &self,
        id: SubchannelId,
        info: CompletionInfo,
        polls: u64,
    ) {
        let mut state = lock(&self.state);
        let due = state.polls + polls;
        state.scheduled.push((id, info, due));
    }

    /// Journal of issue calls against one subchannel.
    pub fn issues(&self, id: SubchannelId) -> Vec<SimIssue> {
        lock(&self.state)
            .devices
            .get(&id.0)
            .map(|dev| dev.journal.clone())
            .unwrap_or_default()
    }

    /// Journal of synchronous-class reprogramming calls.
    pub fn sync_reprograms(&self) -> Vec<(SubchannelId, bool)> {
        lock(&self.state).sync_journal.clone()
    }

    fn with_device<R>(&self, id: SubchannelId, f: impl FnOnce(&mut SimDevice) -> R) -> Option<R> {
        lock(&self.state).devices.get_mut(&id.0).map(f)
    }

    /// Emulated device answer for an accepted start.
    fn respond(dev: &mut SimDevice, program: &ChannelProgram) -> Option<CompletionInfo> {
        if let Some(info) = dev.queued_responses.pop_front() {
            return Some(info);
        }
        match program.first_command() {
            Some(CcwCommand::SetPathGroupId) => {
                if let CcwData::Inline(payload) = &program.ccws()[0].data {
                    if let Some(pgid) = payload.get(1..).and_then(PathGroupId::from_bytes) {
                        dev.pgid_store = Some((PathGroupState::Grouped, *pgid.as_bytes()));
                    }
                }
                Some(CompletionInfo::final_ok())
            }
            Some(CcwCommand::SensePathGroupId) => {
                let (state, bytes) = dev
                    .pgid_store
                    .unwrap_or((PathGroupState::Reset, [0u8; PathGroupId::LEN]));
                let mut data = vec![state.as_byte()];
                data.extend_from_slice(&bytes);
                Some(CompletionInfo::final_ok().with_data(data))
            }
            Some(CcwCommand::BasicSense) if !dev.sense_bytes.is_empty() => {
                Some(CompletionInfo::final_ok().with_data(dev.sense_bytes.clone()))
            }
            _ if dev.auto_complete => Some(CompletionInfo::final_ok()),
            _ => None,
        }
    }
}

impl Default for SimSubsystem {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelHardware for SimSubsystem {
    fn store_status(&self, id: SubchannelId) -> ProbeResult {
        let mut state = lock(&self.state);
        let Some(dev) = state.devices.get_mut(&id.0) else {
            return ProbeResult::NotPresent;
        };
        if let Some(overridden) = dev.probe_overrides.pop_front() {
            return overridden;
        }
        if dev.gone {
            return ProbeResult::NotPresent;
        }
        ProbeResult::Info(SubchannelProbe {
            installed: dev.paths,
            available: dev.paths,
            online: dev.paths,
            is_io: dev.is_io,
            devno: dev.devno,
        })
    }

    fn issue(&self, id: SubchannelId, kind: IssueKind) -> IssueResult {
        let mut state = lock(&self.state);
        let state = &mut *state;
        let Some(dev) = state.devices.get_mut(&id.0) else {
            return IssueResult::code(ConditionCode::NotOperational);
        };
        dev.journal.push(SimIssue { kind: kind.clone() });

        let op = SimOp::of(&kind);
        if let Some(scripted) = dev
            .issue_scripts
            .get_mut(&op)
            .and_then(|queue| queue.pop_front())
        {
            return scripted;
        }

        let (result, raise) = match &kind {
            IssueKind::Start { program, lpm, .. } => {
                let mut raise = false;
                if let Some(info) = Self::respond(dev, program) {
                    dev.completions.push_back(info);
                    raise = true;
                }
                (
                    IssueResult {
                        cc: ConditionCode::Accepted,
                        path_used: *lpm,
                    },
                    raise,
                )
            }
            IssueKind::Halt | IssueKind::Clear => {
                let mut raise = false;
                if dev.auto_complete {
                    dev.completions.push_back(CompletionInfo::final_ok());
                    raise = true;
                }
                (IssueResult::code(ConditionCode::Accepted), raise)
            }
            IssueKind::Resume | IssueKind::Cancel => {
                (IssueResult::code(ConditionCode::Accepted), false)
            }
        };
        if raise {
            state.pending.push_back(id);
        }
        result
    }

    fn fetch_completion(&self, id: SubchannelId) -> (ConditionCode, Option<CompletionInfo>) {
        let mut state = lock(&self.state);
        let Some(dev) = state.devices.get_mut(&id.0) else {
            return (ConditionCode::NotOperational, None);
        };
        if dev.gone {
            return (ConditionCode::NotOperational, None);
        }
        match dev.completions.pop_front() {
            Some(info) => (ConditionCode::Accepted, Some(info)),
            None => (ConditionCode::Accepted, None),
        }
    }

    fn poll_pending(&self) -> Option<SubchannelId> {
        let mut state = lock(&self.state);
        state.polls += 1;
        let now = state.polls;
        let due: Vec<(SubchannelId, CompletionInfo)> = {
            let (ready, waiting): (Vec<_>, Vec<_>) = state
                .scheduled
                .drain(..)
                .partition(|(_, _, due)| *due <= now);
            state.scheduled = waiting;
            ready.into_iter().map(|(id, info, _)| (id, info)).collect()
        };
        for (id, info) in due {
            if let Some(dev) = state.devices.get_mut(&id.0) {
                dev.completions.push_back(info);
            }
            state.pending.push_back(id);
        }
        state.pending.pop_front()
    }

    fn reprogram_sync_class(&self, id: SubchannelId, enable: bool) -> ConditionCode {
        let mut state = lock(&self.state);
        let fails = state
            .devices
            .get(&id.0)
            .map(|dev| dev.fail_reprogram)
            .unwrap_or(true);
        if fails && enable {
            return ConditionCode::NotOperational;
        }
        state.sync_journal.push((id, enable));
        ConditionCode::Accepted
    }
}

impl PathTopology for SimSubsystem {
    fn is_path_logically_online(&self, id: SubchannelId, path: u8) -> bool {
        lock(&self.state)
            .devices
            .get(&id.0)
            .map(|dev| !dev.offline_paths.contains_path(path))
            .unwrap_or(false)
    }
}

/// Deterministic clock for tests: each reading advances by a fixed step.
pub struct SimClock {
    ticks: AtomicU64,
    step: u64,
}

impl SimClock {
    /// Clock advancing by `step_ms` per reading.
    pub fn stepping(step_ms: u64) -> Self {
        Self {
            ticks: AtomicU64::new(0),
            step: step_ms,
        }
    }

    /// Manually-advanced clock.
    pub fn manual() -> Self {
        Self::stepping(0)
    }

    /// Advance the clock by `ms`.
    pub fn advance(&self, ms: u64) {
        self.ticks.fetch_add(ms, Ordering::Relaxed);
    }
}

impl MonotonicClock for SimClock {
    fn ticks_ms(&self) -> u64 {
        self.ticks.fetch_add(self.step, Ordering::Relaxed) + self.step
    }
}

impl MonotonicClock for Arc<SimClock> {
    fn ticks_ms(&self) -> u64 {
        self.as_ref().ticks_ms()
    }
}
