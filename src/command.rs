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

//! Command descriptors and submission.
//!
//! A command owns its payload. Submission is non-blocking: a saturated
//! queue or a stopped worker is reported immediately and the descriptor
//! (payload included) is dropped without side effects.

use tokio::sync::{mpsc, oneshot};

use crate::error::{AdapterError, AdapterResult};
use crate::slots::adv::AdvRecord;
use crate::types::{AdvKind, AttrHandle, ConnHandle, PeerAddress};

/// Value carried back through a command reply.
#[derive(Debug)]
pub(crate) enum CommandValue {
    None,
    /// Allocated advertising / connection handle.
    Handle(u8),
    /// Attribute data read from a peer.
    Data(Vec<u8>),
}

pub(crate) type ReplySender = oneshot::Sender<AdapterResult<CommandValue>>;
pub(crate) type ReplyReceiver = oneshot::Receiver<AdapterResult<CommandValue>>;

/// Whitelist mutation.
#[derive(Debug, Clone, Copy)]
pub(crate) enum WhitelistCmd {
    Add(PeerAddress),
    Remove(PeerAddress),
    Clear,
}

/// Operations the command worker knows how to run.
pub(crate) enum CommandOp {
    CreateAdv {
        kind: AdvKind,
        record: AdvRecord,
    },
    StartAdv {
        handle: u8,
    },
    StopAdv {
        handle: u8,
    },
    DeleteAdv {
        handle: u8,
        /// When the deletion follows a connection to this advertisement,
        /// report the server link as connected once the slot is reclaimed.
        notify_connected: Option<ConnHandle>,
    },
    StartScan,
    StopScan,
    /// Internal follow-up after a firmware-initiated scan stop.
    DeleteScan,
    Connect,
    Disconnect {
        conn: ConnHandle,
    },
    RegisterService {
        service_index: usize,
    },
    Whitelist(WhitelistCmd),
    Bond {
        conn: ConnHandle,
    },
    GattRead {
        conn: ConnHandle,
        attr: AttrHandle,
    },
    GattWrite {
        conn: ConnHandle,
        attr: AttrHandle,
        value: Vec<u8>,
        with_response: bool,
    },
    /// Orderly worker teardown: reply, then exit the loop.
    Shutdown,
}

impl CommandOp {
    pub fn name(&self) -> &'static str {
        match self {
            CommandOp::CreateAdv { .. } => "create-adv",
            CommandOp::StartAdv { .. } => "start-adv",
            CommandOp::StopAdv { .. } => "stop-adv",
            CommandOp::DeleteAdv { .. } => "delete-adv",
            CommandOp::StartScan => "start-scan",
            CommandOp::StopScan => "stop-scan",
            CommandOp::DeleteScan => "delete-scan",
            CommandOp::Connect => "connect",
            CommandOp::Disconnect { .. } => "disconnect",
            CommandOp::RegisterService { .. } => "register-service",
            CommandOp::Whitelist(_) => "whitelist",
            CommandOp::Bond { .. } => "bond",
            CommandOp::GattRead { .. } => "gatt-read",
            CommandOp::GattWrite { .. } => "gatt-write",
            CommandOp::Shutdown => "shutdown",
        }
    }
}

/// One queued command.
pub(crate) struct Command {
    pub op: CommandOp,
    pub reply: Option<ReplySender>,
}

/// Producer half of the command queue.
#[derive(Clone)]
pub(crate) struct CommandSender {
    tx: mpsc::Sender<Command>,
}

impl CommandSender {
    pub fn new(tx: mpsc::Sender<Command>) -> Self {
        Self { tx }
    }

    /// Queue a command and hand back the reply channel.
    pub fn submit(&self, op: CommandOp) -> AdapterResult<ReplyReceiver> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command {
            op,
            reply: Some(reply_tx),
        })?;
        Ok(reply_rx)
    }

    /// Queue a command without caring about its outcome. Used by event
    /// handlers for follow-up work.
    pub fn post(&self, op: CommandOp) -> AdapterResult<()> {
        self.send(Command { op, reply: None })
    }

    fn send(&self, command: Command) -> AdapterResult<()> {
        self.tx.try_send(command).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => AdapterError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => AdapterError::NotRunning,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn full_queue_is_reported() {
        let (tx, _rx) = mpsc::channel(1);
        let sender = CommandSender::new(tx);
        sender.post(CommandOp::StartScan).unwrap();
        assert_eq!(
            sender.post(CommandOp::StopScan).unwrap_err(),
            AdapterError::QueueFull
        );
    }

    #[tokio::test]
    async fn closed_queue_reports_not_running() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let sender = CommandSender::new(tx);
        assert_eq!(
            sender.post(CommandOp::StartScan).unwrap_err(),
            AdapterError::NotRunning
        );
    }
}
