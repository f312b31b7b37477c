// S/390-style Channel I/O Command/Completion Engine
// Copyright 2026 cio-rust contributors
// SPDX-License-Identifier: MIT

//! Error types for channel I/O operations.

use thiserror::Error;

/// Errors that can occur during channel I/O operations.
#[derive(Debug, Error)]
pub enum CioError {
    /// Subchannel id is out of range or was never validated.
    #[error("invalid subchannel handle")]
    InvalidHandle,

    /// Device is blacklisted or was never detected.
    #[error("subchannel not present")]
    NotPresent,

    /// Subchannel exists but is not an I/O-class subchannel.
    #[error("not an I/O subchannel")]
    NotIo,

    /// No usable physical path to the device currently exists.
    #[error("subchannel not operational")]
    NotOperational,

    /// An operation is already outstanding and no queue slot is available.
    #[error("subchannel busy")]
    Busy,

    /// Operation is not legal in the subchannel's current state.
    #[error("invalid subchannel state: {0}")]
    InvalidState(&'static str),

    /// Hardware reported an error status not otherwise classified.
    #[error("I/O error: channel status={cstat:#04x}, device status={dstat:#04x}")]
    IoError { cstat: u8, dstat: u8 },

    /// Synchronous wait exceeded its budget.
    #[error("synchronous wait timed out after {budget_ms} ms")]
    Timeout { budget_ms: u64 },

    /// Feature rejected by the device via command-reject sense.
    #[error("operation not supported by device")]
    Unsupported,
}

/// Result type alias for channel I/O operations.
pub type CioResult<T> = Result<T, CioError>;
