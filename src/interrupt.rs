// S/390-style Channel I/O Command/Completion Engine
// Copyright 2026 cio-rust contributors
// SPDX-License-Identifier: MIT

//! Interrupt/status processing.
//!
//! All completion status funnels through [`ChannelSubsystem::process_one`]:
//! the asynchronous delivery entry and every synchronous drain call use
//! the same decoding routine, so subchannel state has a single writer.
//! Owner callbacks are collected under the per-subchannel lock and
//! invoked only after it has been released.

use crate::dispatcher::{fire, Callbacks, StartFlags};
use crate::engine::ChannelSubsystem;
use crate::error::CioResult;
use crate::event::{CompletionEvent, CompletionKind};
use crate::hw::{ChannelHardware, IssueKind, PathTopology};
use crate::status::{
    CompletionInfo, ConditionCode, DeviceStatus, SenseData, StatusControl, SubchannelStatus,
};
use crate::subchannel::{OpContext, OpFunc, PathMask, Subchannel, SubchannelFlags, SubchannelId};

/// Result of processing one delivered status.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessVerdict {
    /// A known subchannel consumed the status.
    pub handled: bool,
    /// The outstanding operation reached final status in this call.
    pub target_done: bool,
    /// The subchannel was found not operational.
    pub device_gone: bool,
}

impl ProcessVerdict {
    fn absorbed() -> Self {
        Self::default()
    }

    fn interim() -> Self {
        Self {
            handled: true,
            ..Self::default()
        }
    }

    fn done() -> Self {
        Self {
            handled: true,
            target_done: true,
            device_gone: false,
        }
    }
}

impl<H: ChannelHardware + PathTopology> ChannelSubsystem<H> {
    /// Process one pending interrupt, if any. Returns true when an
    /// interrupt was taken from the hardware.
    ///
    /// This is the asynchronous delivery entry: the embedding environment
    /// calls it whenever the interrupt controller signals the channel
    /// subsystem.
    pub fn process_pending(&self) -> bool {
        match self.hw.poll_pending() {
            Some(id) => {
                let _ = self.process_one(id);
                true
            }
            None => false,
        }
    }

    /// Fetch and decode the pending completion status of one subchannel.
    pub fn process_one(&self, id: SubchannelId) -> CioResult<ProcessVerdict> {
        let (cc, info) = self.hw.fetch_completion(id);
        let mut callbacks = Callbacks::new();
        let verdict = self.registry.with_slot(id, |slot| {
            let Some(sub) = slot.as_mut() else {
                // Never validated: nothing to update, nobody to call.
                return ProcessVerdict::absorbed();
            };
            let verdict = match cc {
                ConditionCode::NotOperational => self.device_gone_locked(sub, &mut callbacks),
                _ => match info {
                    Some(info) => self.decode_locked(sub, info, &mut callbacks),
                    None => ProcessVerdict::absorbed(),
                },
            };
            // Deferred-disable bookkeeping: an owner that freed the
            // subchannel mid-interrupt is released once the drain ends.
            if sub.flags.contains(SubchannelFlags::RELEASE_PENDING)
                && !sub.flags.contains(SubchannelFlags::BUSY)
            {
                sub.flags.remove(SubchannelFlags::RELEASE_PENDING);
                sub.handler = None;
            }
            verdict
        })?;
        fire(callbacks);
        Ok(verdict)
    }

    fn decode_locked(
        &self,
        sub: &mut Subchannel,
        info: CompletionInfo,
        callbacks: &mut Callbacks,
    ) -> ProcessVerdict {
        if sub.flags.contains(SubchannelFlags::DOING_SENSE) {
            return self.finish_sense_locked(sub, info, callbacks);
        }

        if info.cstat.intersects(
            SubchannelStatus::CHANNEL_CONTROL_CHECK | SubchannelStatus::INTERFACE_CONTROL_CHECK,
        ) {
            // Recorded in the accumulated status, never fatal by itself.
            log::warn!(
                "subchannel {}: channel check, cstat={:#04x}",
                sub.id,
                info.cstat.bits()
            );
        }

        sub.status.accumulate(&info);
        if !info.path_used.is_empty() {
            sub.used = info.path_used;
        }

        if !sub.flags.contains(SubchannelFlags::BUSY) {
            return self.unsolicited_locked(sub, callbacks);
        }

        let ending = sub.status.ending_status();
        let op_flags = sub
            .inflight
            .as_ref()
            .map(|op| op.flags)
            .unwrap_or_default();

        if sub.status.unit_check() && !sub.status.sense_valid {
            if ending {
                if self.issue_sense_locked(sub) {
                    return ProcessVerdict::interim();
                }
            } else {
                // Sense retrieval must wait for ending status; this
                // intermediate interrupt stays silent.
                sub.flags.insert(SubchannelFlags::SENSE_DEFERRED);
                return ProcessVerdict::interim();
            }
        }

        if ending {
            if sub.flags.contains(SubchannelFlags::SENSE_DEFERRED) && !sub.status.sense_valid {
                sub.flags.remove(SubchannelFlags::SENSE_DEFERRED);
                if self.issue_sense_locked(sub) {
                    return ProcessVerdict::interim();
                }
            }
            return self.finish_op_locked(sub, CompletionKind::Normal, callbacks);
        }

        // Interim status: busy stays set, status keeps accumulating.
        let primary = sub.status.control.contains(StatusControl::PRIMARY);
        let newly_primary = primary && !sub.flags.contains(SubchannelFlags::WAIT_FINAL);
        if primary && op_flags.contains(StartFlags::EARLY_NOTIFICATION) {
            sub.flags.insert(SubchannelFlags::WAIT_FINAL);
        }
        let report = op_flags.contains(StartFlags::REPORT_ALL)
            || (op_flags.contains(StartFlags::EARLY_NOTIFICATION) && newly_primary);
        if report {
            self.push_op_callback(sub, CompletionKind::Normal, callbacks);
        }
        ProcessVerdict::interim()
    }

    fn unsolicited_locked(
        &self,
        sub: &mut Subchannel,
        callbacks: &mut Callbacks,
    ) -> ProcessVerdict {
        if sub.queued.is_some() && sub.operational {
            // A status arrived while a deferred start was still waiting
            // for its launch window.
            self.start_queued_locked(sub, callbacks);
        } else if !sub.flags.contains(SubchannelFlags::ADMIN_DRAIN)
            && sub.status.control.contains(StatusControl::STATUS_PENDING)
        {
            if let Some(handler) = sub.handler.clone() {
                callbacks.push((
                    handler,
                    CompletionEvent {
                        id: sub.id,
                        intent: 0,
                        kind: CompletionKind::Normal,
                        status: sub.status.clone(),
                    },
                ));
            }
        }
        ProcessVerdict::interim()
    }

    fn issue_sense_locked(&self, sub: &mut Subchannel) -> bool {
        let mask = if sub.used.is_empty() {
            sub.opm
        } else {
            sub.used
        };
        let result = self.hw.issue(
            sub.id,
            IssueKind::Start {
                program: crate::command::ChannelProgram::basic_sense(SenseData::CAPACITY as u32),
                lpm: mask,
                deny_prefetch: true,
                allow_suspend: false,
            },
        );
        match result.cc {
            ConditionCode::Accepted => {
                sub.flags
                    .insert(SubchannelFlags::DOING_SENSE | SubchannelFlags::WAIT_SENSE);
                true
            }
            cc => {
                log::warn!("subchannel {}: basic sense rejected, cc {:?}", sub.id, cc);
                false
            }
        }
    }

    fn finish_sense_locked(
        &self,
        sub: &mut Subchannel,
        info: CompletionInfo,
        callbacks: &mut Callbacks,
    ) -> ProcessVerdict {
        sub.flags
            .remove(SubchannelFlags::DOING_SENSE | SubchannelFlags::WAIT_SENSE);
        if info.dstat.contains(DeviceStatus::UNIT_CHECK) {
            log::warn!("subchannel {}: basic sense itself unit-checked", sub.id);
        } else if !info.data.is_empty() {
            sub.status.sense = SenseData::from_slice(&info.data);
            sub.status.sense_valid = true;
        } else if let Some(sense) = info.sense {
            sub.status.sense = sense;
            sub.status.sense_valid = true;
        } else {
            log::warn!("subchannel {}: basic sense returned no data", sub.id);
        }
        self.finish_op_locked(sub, CompletionKind::Normal, callbacks)
    }

    fn finish_op_locked(
        &self,
        sub: &mut Subchannel,
        kind: CompletionKind,
        callbacks: &mut Callbacks,
    ) -> ProcessVerdict {
        sub.status.final_status = true;
        self.push_op_callback(sub, kind, callbacks);
        sub.inflight = None;
        sub.flags.remove(
            SubchannelFlags::BUSY
                | SubchannelFlags::DOING_START
                | SubchannelFlags::DOING_HALT
                | SubchannelFlags::DOING_CLEAR
                | SubchannelFlags::WAIT_FINAL
                | SubchannelFlags::SENSE_DEFERRED
                | SubchannelFlags::ADMIN_DRAIN,
        );
        self.start_queued_locked(sub, callbacks);
        ProcessVerdict::done()
    }

    /// Queue the owner callback for the operation in flight, honoring
    /// suppression and the administrative-drain rule.
    fn push_op_callback(
        &self,
        sub: &mut Subchannel,
        kind: CompletionKind,
        callbacks: &mut Callbacks,
    ) {
        let Some(ctx) = sub.inflight.as_ref() else {
            return;
        };
        if ctx.flags.contains(StartFlags::SUPPRESS_CALLBACK)
            || sub.flags.contains(SubchannelFlags::ADMIN_DRAIN)
        {
            return;
        }
        let kind = match ctx.func {
            OpFunc::Halt => CompletionKind::Halted,
            OpFunc::Clear => CompletionKind::Cleared,
            OpFunc::Start => kind,
        };
        if let Some(handler) = sub.handler.clone() {
            callbacks.push((
                handler,
                CompletionEvent {
                    id: sub.id,
                    intent: ctx.intent,
                    kind,
                    status: sub.status.clone(),
                },
            ));
        }
    }

    fn start_queued_locked(&self, sub: &mut Subchannel, callbacks: &mut Callbacks) {
        let Some(q) = sub.queued.take() else {
            return;
        };
        let synth_gone = |sub: &Subchannel, callbacks: &mut Callbacks| {
            if q_suppressed(&q.flags) {
                return;
            }
            if let Some(handler) = sub.handler.clone() {
                callbacks.push((
                    handler,
                    CompletionEvent {
                        id: sub.id,
                        intent: q.intent,
                        kind: CompletionKind::DeviceGone,
                        status: sub.status.clone(),
                    },
                ));
            }
        };

        let mask = match q.lpm {
            Some(m) => m.narrow(sub.opm),
            None => sub.opm,
        };
        if !sub.operational || mask.is_empty() {
            synth_gone(sub, callbacks);
            return;
        }

        let result = self.hw.issue(
            sub.id,
            IssueKind::Start {
                program: q.program.clone(),
                lpm: mask,
                deny_prefetch: q.flags.contains(StartFlags::DENY_PREFETCH),
                allow_suspend: q.flags.contains(StartFlags::ALLOW_SUSPEND),
            },
        );
        match result.cc {
            ConditionCode::Accepted => {
                sub.flags
                    .insert(SubchannelFlags::BUSY | SubchannelFlags::DOING_START);
                sub.status.reset();
                sub.used = mask;
                sub.inflight = Some(OpContext {
                    intent: q.intent,
                    flags: q.flags,
                    func: OpFunc::Start,
                });
            }
            ConditionCode::NotOperational => {
                let lost = if result.path_used.is_empty() {
                    PathMask::ALL
                } else {
                    result.path_used
                };
                sub.demote_paths(lost);
                synth_gone(sub, callbacks);
            }
            cc => {
                log::warn!(
                    "subchannel {}: deferred start rejected, cc {:?}, dropped",
                    sub.id,
                    cc
                );
            }
        }
    }

    fn device_gone_locked(
        &self,
        sub: &mut Subchannel,
        callbacks: &mut Callbacks,
    ) -> ProcessVerdict {
        sub.operational = false;
        sub.opm = PathMask::EMPTY;
        sub.status.final_status = true;
        let admin = sub.flags.contains(SubchannelFlags::ADMIN_DRAIN);
        let ctx = sub.inflight.take();
        sub.flags.remove(
            SubchannelFlags::BUSY
                | SubchannelFlags::DOING_START
                | SubchannelFlags::DOING_HALT
                | SubchannelFlags::DOING_CLEAR
                | SubchannelFlags::DOING_SENSE
                | SubchannelFlags::WAIT_SENSE
                | SubchannelFlags::WAIT_FINAL
                | SubchannelFlags::SENSE_DEFERRED
                | SubchannelFlags::ADMIN_DRAIN,
        );

        let suppressed = ctx
            .as_ref()
            .is_some_and(|c| c.flags.contains(StartFlags::SUPPRESS_CALLBACK));
        if !admin && !suppressed {
            if let Some(handler) = sub.handler.clone() {
                callbacks.push((
                    handler,
                    CompletionEvent {
                        id: sub.id,
                        intent: ctx.as_ref().map(|c| c.intent).unwrap_or(0),
                        kind: CompletionKind::DeviceGone,
                        status: sub.status.clone(),
                    },
                ));
            }
        }
        if let Some(q) = sub.queued.take() {
            if !admin && !q_suppressed(&q.flags) {
                if let Some(handler) = sub.handler.clone() {
                    callbacks.push((
                        handler,
                        CompletionEvent {
                            id: sub.id,
                            intent: q.intent,
                            kind: CompletionKind::DeviceGone,
                            status: sub.status.clone(),
                        },
                    ));
                }
            }
        }
        ProcessVerdict {
            handled: true,
            target_done: true,
            device_gone: true,
        }
    }
}

fn q_suppressed(flags: &StartFlags) -> bool {
    flags.contains(StartFlags::SUPPRESS_CALLBACK)
}
