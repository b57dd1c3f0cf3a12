// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Adapter error taxonomy.
//!
//! Argument, resource and state errors are detected synchronously before
//! any queue interaction. Queue errors abort an operation with no partial
//! state change. Timeouts and firmware failures are delivered through the
//! caller's reply channel after any partially-run command chain has been
//! unwound to the slot's last well-defined state.

use thiserror::Error;

/// Result alias used across the adapter surface.
pub type AdapterResult<T> = Result<T, AdapterError>;

/// Errors reported by adapter operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdapterError {
    /// Null, out-of-range or oversize input, caught before submission.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// No free slot, handle or record.
    #[error("no free slot or handle")]
    ResourceExhausted,

    /// Operation not legal in the current state.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// The command or event queue is saturated.
    #[error("queue full")]
    QueueFull,

    /// The adapter is not initialized or is shutting down.
    #[error("adapter not running")]
    NotRunning,

    /// A bounded wait on the controller expired. The slot's true state is
    /// unknown; callers should query or retry rather than assume either
    /// outcome.
    #[error("timed out waiting for the controller")]
    Timeout,

    /// The firmware accepted a command but reported a non-zero completion
    /// status.
    #[error("firmware reported status {0:#06x}")]
    Firmware(u16),

    /// Slot or index bookkeeping contradiction. Reported rather than
    /// ignored; should never occur.
    #[error("internal inconsistency: {0}")]
    Inconsistent(&'static str),

    /// The operation is already running (double init/deinit, duplicate
    /// connect attempt).
    #[error("already in progress")]
    AlreadyInProgress,

    /// The persisted bond/whitelist store failed.
    #[error("storage error: {0}")]
    Storage(String),
}

impl AdapterError {
    /// Map a raw firmware completion status, treating zero as success.
    pub fn from_status(status: u16) -> Result<(), AdapterError> {
        if status == 0 {
            Ok(())
        } else {
            Err(AdapterError::Firmware(status))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_status_is_success() {
        assert_eq!(AdapterError::from_status(0), Ok(()));
    }

    #[test]
    fn nonzero_status_maps_to_firmware_error() {
        assert_eq!(
            AdapterError::from_status(0x22),
            Err(AdapterError::Firmware(0x22))
        );
    }
}
