// S/390-style Channel I/O Command/Completion Engine
// Copyright 2026 cio-rust contributors
// SPDX-License-Identifier: MIT

//! Channel program dispatch: Start/Halt/Clear/Resume/Cancel.
//!
//! Each operation issues one hardware function and classifies the
//! immediate condition code into an operation outcome. Completion status
//! arrives later through the interrupt processor; per-subchannel ordering
//! is enforced by the busy flag.

use crate::command::ChannelProgram;
use crate::engine::ChannelSubsystem;
use crate::error::{CioError, CioResult};
use crate::event::{CompletionEvent, CompletionKind, Handler};
use crate::hw::{ChannelHardware, IssueKind, PathTopology};
use crate::status::{ConditionCode, StatusRecord};
use crate::subchannel::{
    OpContext, OpFunc, PathMask, QueuedStart, Subchannel, SubchannelFlags, SubchannelId,
};
use bitflags::bitflags;

bitflags! {
    /// Option flags for [`ChannelSubsystem::start`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StartFlags: u32 {
        /// Call back on primary status, not only on final status.
        const EARLY_NOTIFICATION = 1 << 0;
        /// Call back on every interrupt, not only on final status.
        const REPORT_ALL = 1 << 1;
        /// Block inline until the operation completes.
        const WAIT_SYNCHRONOUS = 1 << 2;
        /// Never invoke the completion callback for this operation.
        const SUPPRESS_CALLBACK = 1 << 3;
        /// Forbid the channel from prefetching CCWs.
        const DENY_PREFETCH = 1 << 4;
        /// Permit the channel program to suspend.
        const ALLOW_SUSPEND = 1 << 5;
        /// Issue an automatic cancel when a synchronous wait times out.
        const CANCEL_ON_TIMEOUT = 1 << 6;
    }
}

/// Classification of an accepted start call.
enum StartOutcome {
    Accepted,
    Queued,
    StatusPending,
}

/// Outcome of a halt/clear issue.
enum ControlOutcome {
    Accepted,
    SenseNoop,
    StatusPending,
}

pub(crate) type Callbacks = Vec<(Handler, CompletionEvent)>;

pub(crate) fn fire(callbacks: Callbacks) {
    for (handler, event) in callbacks {
        handler(&event);
    }
}

impl<H: ChannelHardware + PathTopology> ChannelSubsystem<H> {
    /// Start a channel program.
    ///
    /// `intent` is an opaque completion tag handed back in the matching
    /// [`CompletionEvent`]. `lpm`, when given, restricts the operation to
    /// those paths; the effective mask is always narrowed by the current
    /// operational path mask.
    pub fn start(
        &self,
        id: SubchannelId,
        program: ChannelProgram,
        intent: u64,
        lpm: Option<PathMask>,
        flags: StartFlags,
    ) -> CioResult<()> {
        self.start_inner(id, program, intent, lpm, flags, false)
    }

    /// Start used by registry-internal housekeeping (path-group
    /// negotiation, probing): no handler requirement, owner callbacks
    /// stay suppressed for the whole drain.
    pub(crate) fn start_internal(
        &self,
        id: SubchannelId,
        program: ChannelProgram,
        intent: u64,
        lpm: Option<PathMask>,
        flags: StartFlags,
    ) -> CioResult<()> {
        self.start_inner(id, program, intent, lpm, flags, true)
    }

    fn start_inner(
        &self,
        id: SubchannelId,
        program: ChannelProgram,
        intent: u64,
        lpm: Option<PathMask>,
        flags: StartFlags,
        admin: bool,
    ) -> CioResult<()> {
        let sync = flags.contains(StartFlags::WAIT_SYNCHRONOUS);
        let _sync_release = if sync {
            self.acquire_sync(id)?;
            Some(scopeguard::guard((), |_| self.release_sync(id)))
        } else {
            None
        };

        let mut callbacks = Callbacks::new();
        let outcome = self.registry.with_sub(id, |sub| {
            self.classify_start(sub, &program, intent, lpm, flags, admin, &mut callbacks)
        });
        fire(callbacks);
        match outcome?? {
            StartOutcome::Queued => Ok(()),
            StartOutcome::Accepted => {
                if sync {
                    self.wait_for_completion(id, flags)
                } else {
                    Ok(())
                }
            }
            StartOutcome::StatusPending => {
                // Drain the already-available status as if an interrupt
                // had arrived, then report the failure.
                let verdict = self.process_one(id)?;
                if verdict.device_gone {
                    Err(CioError::NotOperational)
                } else {
                    let (cstat, dstat) = self
                        .registry
                        .with_sub(id, |sub| (sub.status.cstat.bits(), sub.status.dstat.bits()))?;
                    Err(CioError::IoError { cstat, dstat })
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn classify_start(
        &self,
        sub: &mut Subchannel,
        program: &ChannelProgram,
        intent: u64,
        lpm: Option<PathMask>,
        flags: StartFlags,
        admin: bool,
        callbacks: &mut Callbacks,
    ) -> CioResult<StartOutcome> {
        if !admin && sub.handler.is_none() {
            return Err(CioError::InvalidState("no completion handler registered"));
        }
        if !sub.operational {
            return Err(CioError::NotOperational);
        }
        if sub.flags.contains(SubchannelFlags::BUSY) {
            // One deferred start may ride behind an early-notification
            // operation that already delivered primary status.
            if sub.flags.contains(SubchannelFlags::WAIT_FINAL) && sub.queued.is_none() {
                sub.queued = Some(QueuedStart {
                    program: program.clone(),
                    intent,
                    lpm,
                    flags,
                });
                return Ok(StartOutcome::Queued);
            }
            return Err(CioError::Busy);
        }

        let mask = match lpm {
            Some(m) => m.narrow(sub.opm),
            None => sub.opm,
        };
        if mask.is_empty() {
            return Err(CioError::NotOperational);
        }

        let result = self.hw.issue(
            sub.id,
            IssueKind::Start {
                program: program.clone(),
                lpm: mask,
                deny_prefetch: flags.contains(StartFlags::DENY_PREFETCH),
                allow_suspend: flags.contains(StartFlags::ALLOW_SUSPEND),
            },
        );
        match result.cc {
            ConditionCode::Accepted => {
                sub.flags
                    .insert(SubchannelFlags::BUSY | SubchannelFlags::DOING_START);
                if admin {
                    sub.flags.insert(SubchannelFlags::ADMIN_DRAIN);
                }
                if !sub.flags.contains(SubchannelFlags::WAIT_SENSE) {
                    sub.status.reset();
                }
                sub.used = mask;
                sub.inflight = Some(OpContext {
                    intent,
                    flags,
                    func: OpFunc::Start,
                });
                Ok(StartOutcome::Accepted)
            }
            ConditionCode::StatusPending => Ok(StartOutcome::StatusPending),
            ConditionCode::Busy => Err(CioError::Busy),
            ConditionCode::NotOperational => {
                let lost = if result.path_used.is_empty() {
                    lpm.unwrap_or(PathMask::ALL)
                } else {
                    result.path_used
                };
                if sub.demote_paths(lost) {
                    log::debug!("subchannel {}: all paths lost on start", sub.id);
                    self.push_device_gone(sub, intent, flags, admin, callbacks);
                }
                Err(CioError::NotOperational)
            }
        }
    }

    /// Halt the current function on a subchannel.
    pub fn halt(&self, id: SubchannelId, intent: u64, flags: StartFlags) -> CioResult<()> {
        self.control_function(id, intent, flags, OpFunc::Halt)
    }

    /// Clear the subchannel.
    pub fn clear(&self, id: SubchannelId, intent: u64, flags: StartFlags) -> CioResult<()> {
        self.control_function(id, intent, flags, OpFunc::Clear)
    }

    fn control_function(
        &self,
        id: SubchannelId,
        intent: u64,
        flags: StartFlags,
        func: OpFunc,
    ) -> CioResult<()> {
        let sync = flags.contains(StartFlags::WAIT_SYNCHRONOUS);
        let _sync_release = if sync {
            self.acquire_sync(id)?;
            Some(scopeguard::guard((), |_| self.release_sync(id)))
        } else {
            None
        };

        let mut callbacks = Callbacks::new();
        let outcome = self.registry.with_sub(id, |sub| -> CioResult<ControlOutcome> {
            // A sense retrieval in flight outranks halt/clear; pretend
            // success and let the sense drain.
            if sub.flags.contains(SubchannelFlags::WAIT_SENSE) {
                return Ok(ControlOutcome::SenseNoop);
            }
            if !sub.operational {
                return Err(CioError::NotOperational);
            }
            let kind = match func {
                OpFunc::Halt => IssueKind::Halt,
                OpFunc::Clear => IssueKind::Clear,
                OpFunc::Start => unreachable!("start is not a control function"),
            };
            let result = self.hw.issue(sub.id, kind);
            match result.cc {
                ConditionCode::Accepted => {
                    sub.flags.remove(SubchannelFlags::DOING_START | SubchannelFlags::WAIT_FINAL);
                    sub.flags.insert(
                        SubchannelFlags::BUSY
                            | match func {
                                OpFunc::Halt => SubchannelFlags::DOING_HALT,
                                _ => SubchannelFlags::DOING_CLEAR,
                            },
                    );
                    sub.inflight = Some(OpContext {
                        intent,
                        flags,
                        func,
                    });
                    Ok(ControlOutcome::Accepted)
                }
                ConditionCode::StatusPending => Ok(ControlOutcome::StatusPending),
                ConditionCode::Busy => Err(CioError::Busy),
                ConditionCode::NotOperational => {
                    if sub.demote_paths(PathMask::ALL) {
                        self.push_device_gone(sub, intent, flags, false, &mut callbacks);
                    }
                    Err(CioError::NotOperational)
                }
            }
        });
        fire(callbacks);
        match outcome?? {
            ControlOutcome::SenseNoop => Ok(()),
            ControlOutcome::Accepted => {
                if sync {
                    self.wait_for_completion(id, flags)
                } else {
                    Ok(())
                }
            }
            ControlOutcome::StatusPending => {
                let verdict = self.process_one(id)?;
                if verdict.device_gone {
                    Err(CioError::NotOperational)
                } else {
                    let (cstat, dstat) = self
                        .registry
                        .with_sub(id, |sub| (sub.status.cstat.bits(), sub.status.dstat.bits()))?;
                    Err(CioError::IoError { cstat, dstat })
                }
            }
        }
    }

    /// Resume a suspended channel program.
    ///
    /// Valid only while an operation started with
    /// [`StartFlags::ALLOW_SUSPEND`] is outstanding.
    pub fn resume(&self, id: SubchannelId) -> CioResult<()> {
        let drain = self.registry.with_sub(id, |sub| -> CioResult<bool> {
            let suspendable = sub.flags.contains(SubchannelFlags::BUSY)
                && sub
                    .inflight
                    .as_ref()
                    .is_some_and(|op| op.flags.contains(StartFlags::ALLOW_SUSPEND));
            if !suspendable {
                return Err(CioError::InvalidState("resume without suspended operation"));
            }
            let result = self.hw.issue(sub.id, IssueKind::Resume);
            match result.cc {
                ConditionCode::Accepted => Ok(false),
                ConditionCode::StatusPending => Ok(true),
                ConditionCode::Busy => Err(CioError::InvalidState("resume rejected by hardware")),
                ConditionCode::NotOperational => {
                    sub.demote_paths(PathMask::ALL);
                    Err(CioError::NotOperational)
                }
            }
        })??;
        if drain {
            let _ = self.process_one(id)?;
            return Err(CioError::Busy);
        }
        Ok(())
    }

    /// Cancel an outstanding start before the device accepted it.
    pub fn cancel(&self, id: SubchannelId) -> CioResult<()> {
        let drain = self.registry.with_sub(id, |sub| -> CioResult<bool> {
            if !sub
                .flags
                .contains(SubchannelFlags::BUSY | SubchannelFlags::DOING_START)
            {
                return Err(CioError::InvalidState("cancel without outstanding start"));
            }
            let result = self.hw.issue(sub.id, IssueKind::Cancel);
            match result.cc {
                ConditionCode::Accepted => {
                    sub.flags.remove(
                        SubchannelFlags::BUSY
                            | SubchannelFlags::DOING_START
                            | SubchannelFlags::WAIT_FINAL,
                    );
                    sub.inflight = None;
                    Ok(false)
                }
                ConditionCode::StatusPending => Ok(true),
                ConditionCode::Busy => Err(CioError::InvalidState("cancel rejected by hardware")),
                ConditionCode::NotOperational => {
                    sub.demote_paths(PathMask::ALL);
                    Err(CioError::NotOperational)
                }
            }
        })??;
        if drain {
            let _ = self.process_one(id)?;
            return Err(CioError::Busy);
        }
        Ok(())
    }

    /// Snapshot of the accumulated status record.
    pub fn status(&self, id: SubchannelId) -> CioResult<StatusRecord> {
        self.registry.with_sub(id, |sub| sub.status.clone())
    }

    pub(crate) fn push_device_gone(
        &self,
        sub: &mut Subchannel,
        intent: u64,
        flags: StartFlags,
        admin: bool,
        callbacks: &mut Callbacks,
    ) {
        if admin
            || sub.flags.contains(SubchannelFlags::ADMIN_DRAIN)
            || flags.contains(StartFlags::SUPPRESS_CALLBACK)
        {
            return;
        }
        if let Some(handler) = sub.handler.clone() {
            callbacks.push((
                handler,
                CompletionEvent {
                    id: sub.id,
                    intent,
                    kind: CompletionKind::DeviceGone,
                    status: sub.status.clone(),
                },
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::CioConfig;
    use crate::sim::{SimOp, SimSubsystem};
    use crate::status::CompletionInfo;
    use crate::subchannel::DeviceNumber;
    use crate::hw::IssueResult;
    use std::sync::{Arc, Mutex};

    type Log = Arc<Mutex<Vec<CompletionEvent>>>;

    fn recorded() -> (Handler, Log) {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        let handler: Handler = Arc::new(move |ev: &CompletionEvent| {
            sink.lock().unwrap().push(ev.clone());
        });
        (handler, log)
    }

    fn engine(opm: u8) -> (ChannelSubsystem<SimSubsystem>, SubchannelId, Log) {
        let sim = SimSubsystem::new();
        let id = SubchannelId(0x10);
        sim.add_device(id, DeviceNumber(0x4711), PathMask::new(opm));
        let cio = ChannelSubsystem::new(sim, CioConfig::default());
        let (handler, log) = recorded();
        cio.request(id, handler).unwrap();
        (cio, id, log)
    }

    #[test]
    fn test_scenario_a_accept_then_final() {
        let (cio, id, log) = engine(0xC0);

        cio.start(id, ChannelProgram::nop(), 1, None, StartFlags::empty())
            .unwrap();
        assert!(cio.lookup(id).unwrap().busy);
        assert!(log.lock().unwrap().is_empty());

        cio.hardware().push_completion(id, CompletionInfo::final_ok());
        assert!(cio.process_pending());

        let events = log.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].intent, 1);
        assert_eq!(events[0].kind, CompletionKind::Normal);
        assert!(events[0].status.final_status);
        drop(events);
        assert!(!cio.lookup(id).unwrap().busy);
    }

    #[test]
    fn test_scenario_b_cc2_is_busy_without_mutation() {
        let (cio, id, log) = engine(0xC0);
        cio.hardware()
            .script_issue(id, SimOp::Start, IssueResult::code(ConditionCode::Busy));

        let before = cio.lookup(id).unwrap();
        let err = cio
            .start(id, ChannelProgram::nop(), 1, None, StartFlags::empty())
            .unwrap_err();
        assert!(matches!(err, CioError::Busy));

        let after = cio.lookup(id).unwrap();
        assert_eq!(after.busy, before.busy);
        assert_eq!(after.opm, before.opm);
        assert!(log.lock().unwrap().is_empty());
        let record = cio.status(id).unwrap();
        assert!(record.dstat.is_empty());
        assert!(record.cstat.is_empty());
    }

    #[test]
    fn test_scenario_c_cc3_narrows_then_device_gone() {
        let (cio, id, log) = engine(0xC0);

        cio.hardware().script_issue(
            id,
            SimOp::Start,
            IssueResult {
                cc: ConditionCode::NotOperational,
                path_used: PathMask::new(0x80),
            },
        );
        let err = cio
            .start(id, ChannelProgram::nop(), 1, None, StartFlags::empty())
            .unwrap_err();
        assert!(matches!(err, CioError::NotOperational));
        let info = cio.lookup(id).unwrap();
        assert_eq!(info.opm.bits(), 0x40);
        assert!(info.operational);
        assert!(log.lock().unwrap().is_empty());

        cio.hardware().script_issue(
            id,
            SimOp::Start,
            IssueResult {
                cc: ConditionCode::NotOperational,
                path_used: PathMask::new(0x40),
            },
        );
        let err = cio
            .start(id, ChannelProgram::nop(), 2, None, StartFlags::empty())
            .unwrap_err();
        assert!(matches!(err, CioError::NotOperational));
        let info = cio.lookup(id).unwrap();
        assert_eq!(info.opm.bits(), 0x00);
        assert!(!info.operational);

        let events = log.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, CompletionKind::DeviceGone);
        assert_eq!(events[0].intent, 2);
    }

    #[test]
    fn test_start_while_busy_is_rejected() {
        let (cio, id, log) = engine(0xC0);
        cio.start(id, ChannelProgram::nop(), 1, None, StartFlags::empty())
            .unwrap();
        // No early notification engaged: second start must bounce.
        let err = cio
            .start(id, ChannelProgram::nop(), 2, None, StartFlags::empty())
            .unwrap_err();
        assert!(matches!(err, CioError::Busy));
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_early_notification_queues_one_start() {
        let (cio, id, log) = engine(0xC0);
        cio.start(
            id,
            ChannelProgram::nop(),
            1,
            None,
            StartFlags::EARLY_NOTIFICATION,
        )
        .unwrap();

        // Primary status arrives; final still outstanding.
        cio.hardware()
            .push_completion(id, CompletionInfo::primary_only());
        assert!(cio.process_pending());
        assert_eq!(log.lock().unwrap().len(), 1);
        assert!(cio.lookup(id).unwrap().busy);

        // Second start rides in the queue slot; a third sees Busy.
        cio.start(id, ChannelProgram::nop(), 2, None, StartFlags::empty())
            .unwrap();
        let err = cio
            .start(id, ChannelProgram::nop(), 3, None, StartFlags::empty())
            .unwrap_err();
        assert!(matches!(err, CioError::Busy));

        // Final status completes op 1 and starts the queued op.
        cio.hardware().push_completion(id, CompletionInfo::final_ok());
        assert!(cio.process_pending());
        assert!(cio.lookup(id).unwrap().busy);

        cio.hardware().push_completion(id, CompletionInfo::final_ok());
        assert!(cio.process_pending());

        let events = log.lock().unwrap();
        let intents: Vec<u64> = events.iter().map(|e| e.intent).collect();
        assert_eq!(intents, vec![1, 1, 2]);
        assert!(!cio.lookup(id).unwrap().busy);
    }

    #[test]
    fn test_start_without_handler_is_invalid_state() {
        let sim = SimSubsystem::new();
        let id = SubchannelId(0x10);
        sim.add_device(id, DeviceNumber(0x4711), PathMask::new(0x80));
        let cio = ChannelSubsystem::new(sim, CioConfig::default());
        cio.validate(id).unwrap();
        let err = cio
            .start(id, ChannelProgram::nop(), 1, None, StartFlags::empty())
            .unwrap_err();
        assert!(matches!(err, CioError::InvalidState(_)));
    }

    #[test]
    fn test_restricted_lpm_narrows_issue_mask() {
        let (cio, id, _log) = engine(0xC0);
        cio.start(
            id,
            ChannelProgram::nop(),
            1,
            Some(PathMask::new(0xF0)),
            StartFlags::empty(),
        )
        .unwrap();
        let issues = cio.hardware().issues(id);
        match &issues[0].kind {
            IssueKind::Start { lpm, .. } => assert_eq!(lpm.bits(), 0xC0),
            other => panic!("unexpected issue {other:?}"),
        }
    }

    #[test]
    fn test_start_with_disjoint_lpm_is_not_operational() {
        let (cio, id, _log) = engine(0xC0);
        let err = cio
            .start(
                id,
                ChannelProgram::nop(),
                1,
                Some(PathMask::new(0x0F)),
                StartFlags::empty(),
            )
            .unwrap_err();
        assert!(matches!(err, CioError::NotOperational));
    }

    #[test]
    fn test_halt_marks_halt_function() {
        let (cio, id, log) = engine(0xC0);
        cio.start(id, ChannelProgram::nop(), 1, None, StartFlags::empty())
            .unwrap();
        cio.halt(id, 9, StartFlags::empty()).unwrap();

        cio.hardware().push_completion(id, CompletionInfo::final_ok());
        assert!(cio.process_pending());

        let events = log.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, CompletionKind::Halted);
        assert_eq!(events[0].intent, 9);
    }

    #[test]
    fn test_halt_is_silent_noop_during_sense_wait() {
        let (cio, id, log) = engine(0xC0);
        cio.start(id, ChannelProgram::nop(), 1, None, StartFlags::empty())
            .unwrap();
        // Unit check without concurrent sense leaves a sense retrieval
        // in flight.
        cio.hardware()
            .push_completion(id, CompletionInfo::unit_check());
        cio.process_pending();
        let issued_before = cio.hardware().issues(id).len();

        cio.halt(id, 9, StartFlags::empty()).unwrap();
        assert_eq!(cio.hardware().issues(id).len(), issued_before);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_clear_completion_kind() {
        let (cio, id, log) = engine(0xC0);
        cio.clear(id, 4, StartFlags::empty()).unwrap();
        cio.hardware().push_completion(id, CompletionInfo::final_ok());
        assert!(cio.process_pending());
        assert_eq!(log.lock().unwrap()[0].kind, CompletionKind::Cleared);
    }

    #[test]
    fn test_resume_on_idle_is_invalid_state() {
        let (cio, id, _log) = engine(0xC0);
        assert!(matches!(
            cio.resume(id),
            Err(CioError::InvalidState(_))
        ));
    }

    #[test]
    fn test_resume_suspended_operation() {
        let (cio, id, _log) = engine(0xC0);
        cio.start(
            id,
            ChannelProgram::nop(),
            1,
            None,
            StartFlags::ALLOW_SUSPEND,
        )
        .unwrap();
        cio.resume(id).unwrap();
        let issues = cio.hardware().issues(id);
        assert!(matches!(issues.last().unwrap().kind, IssueKind::Resume));
    }

    #[test]
    fn test_cancel_without_start_is_invalid_state() {
        let (cio, id, _log) = engine(0xC0);
        assert!(matches!(cio.cancel(id), Err(CioError::InvalidState(_))));
    }

    #[test]
    fn test_cancel_clears_busy() {
        let (cio, id, _log) = engine(0xC0);
        cio.start(id, ChannelProgram::nop(), 1, None, StartFlags::empty())
            .unwrap();
        cio.cancel(id).unwrap();
        assert!(!cio.lookup(id).unwrap().busy);
    }

    #[test]
    fn test_cancel_with_pending_status_drains_and_reports_busy() {
        let (cio, id, log) = engine(0xC0);
        cio.start(id, ChannelProgram::nop(), 1, None, StartFlags::empty())
            .unwrap();
        cio.hardware().script_issue(
            id,
            SimOp::Cancel,
            IssueResult::code(ConditionCode::StatusPending),
        );
        cio.hardware().push_completion(id, CompletionInfo::final_ok());
        let err = cio.cancel(id).unwrap_err();
        assert!(matches!(err, CioError::Busy));
        // The drained completion reached the handler.
        assert_eq!(log.lock().unwrap().len(), 1);
        assert!(!cio.lookup(id).unwrap().busy);
    }
}
