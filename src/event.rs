// S/390-style Channel I/O Command/Completion Engine
// Copyright 2026 cio-rust contributors
// SPDX-License-Identifier: MIT

//! Completion events delivered to owner callbacks.

use crate::status::StatusRecord;
use crate::subchannel::SubchannelId;
use std::sync::Arc;

/// Classification of a completion delivered to the owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionKind {
    /// Normal completion of a start function (may still carry error status
    /// in the record; interpreting it is the owner's business).
    Normal,
    /// Completion of a halt function.
    Halted,
    /// Completion of a clear function.
    Cleared,
    /// The device or its last path vanished.
    DeviceGone,
    /// Path verification found the device reachable again.
    DeviceOnline,
}

/// One completion delivered to a registered handler.
#[derive(Debug, Clone)]
pub struct CompletionEvent {
    /// Subchannel the completion belongs to.
    pub id: SubchannelId,
    /// Caller-supplied tag from the originating operation; zero for
    /// unsolicited or administrative notifications.
    pub intent: u64,
    /// Completion classification.
    pub kind: CompletionKind,
    /// Snapshot of the accumulated status record.
    pub status: StatusRecord,
}

/// Owner completion callback.
///
/// Invoked outside the per-subchannel lock; re-entering the engine from a
/// handler is allowed.
pub type Handler = Arc<dyn Fn(&CompletionEvent) + Send + Sync>;
