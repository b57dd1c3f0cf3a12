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

//! The event worker: single consumer of the event queue.
//!
//! Every event kind has exactly one handler, running on this task only.
//! Handlers answer firmware requests with fire-and-forget response
//! primitives and enqueue commands for follow-up work; they never block
//! waiting for the command worker.

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::adapter::Core;
use crate::advertiser;
use crate::central;
use crate::command::CommandOp;
use crate::error::AdapterError;
use crate::firmware::FirmwareNotification;
use crate::scanner;
use crate::server::gatt;
use crate::slots::conn::{fail_waiters, release_waiters, RequestKind};
use crate::types::{
    AuthState, ConnHandle, ConnState, LinkRole, ScanStateChange, ServerConnectionKind,
};

/// Messages consumed by the event worker.
pub(crate) enum Event {
    /// A firmware notification routed through the sink.
    Firmware(FirmwareNotification),
    /// Internal: report a server link transition to the application.
    ServerConnected {
        conn: ConnHandle,
        kind: ServerConnectionKind,
    },
    /// Internal: report a scan state transition to the application.
    ScanState(ScanStateChange),
    /// Drain no further events, signal and terminate.
    Shutdown(oneshot::Sender<()>),
}

/// Producer half of the event queue.
#[derive(Clone)]
pub(crate) struct EventSender {
    tx: mpsc::Sender<Event>,
}

impl EventSender {
    pub fn new(tx: mpsc::Sender<Event>) -> Self {
        Self { tx }
    }

    pub fn raw(&self) -> mpsc::Sender<Event> {
        self.tx.clone()
    }

    /// Non-blocking push; a saturated or closed queue only logs, the way
    /// unattributable firmware traffic must never stall its source.
    pub fn push(&self, event: Event) {
        if let Err(e) = self.tx.try_send(event) {
            error!("event queue push failed: {}", e);
        }
    }
}

/// The event worker loop.
pub(crate) struct EventWorker {
    core: Arc<Core>,
    rx: mpsc::Receiver<Event>,
}

impl EventWorker {
    pub fn new(core: Arc<Core>, rx: mpsc::Receiver<Event>) -> Self {
        Self { core, rx }
    }

    pub async fn run(mut self) {
        debug!("event worker running");
        while let Some(event) = self.rx.recv().await {
            match event {
                Event::Shutdown(done) => {
                    let _ = done.send(());
                    break;
                }
                Event::ServerConnected { conn, kind } => {
                    gatt::report_connected(&self.core, conn, kind);
                }
                Event::ScanState(change) => {
                    if let Some(cb) = &self.core.client.scan_state_changed {
                        cb(change);
                    }
                }
                Event::Firmware(notification) => self.dispatch(notification),
            }
        }
        info!("event worker stopped");
    }

    fn dispatch(&self, notification: FirmwareNotification) {
        let core = &self.core;
        match notification {
            FirmwareNotification::ConnectionEstablished {
                conn,
                role,
                peer,
                interval,
                latency,
                supervision_timeout,
            } => {
                central::on_link_established(
                    core,
                    conn,
                    role,
                    peer,
                    interval,
                    latency,
                    supervision_timeout,
                );
            }

            FirmwareNotification::ConnectionFailed { status } => {
                central::on_connect_failed(core, status);
            }

            FirmwareNotification::Disconnected { conn, reason } => {
                self.on_disconnected(conn, reason);
            }

            FirmwareNotification::MtuChanged { conn, mtu } => {
                gatt::on_mtu_changed(core, conn, mtu);
            }

            FirmwareNotification::ConnParamsUpdated {
                conn,
                interval,
                latency,
                supervision_timeout,
            } => {
                debug!(
                    "conn {} params updated: interval {} latency {} timeout {}",
                    conn, interval, latency, supervision_timeout
                );
                let _ = core.conns.with_slot(conn, |slot| {
                    slot.interval = interval;
                    slot.latency = latency;
                    slot.supervision_timeout = supervision_timeout;
                });
            }

            FirmwareNotification::AdvStopped {
                adv_idx,
                conn,
                reason,
            } => {
                advertiser::on_adv_stopped(core, adv_idx, conn, reason);
            }

            FirmwareNotification::ScanStopped { reason } => {
                scanner::on_scan_stopped(core, reason);
            }

            FirmwareNotification::ScanReport {
                peer,
                report_type,
                rssi,
                data,
            } => {
                scanner::on_scan_report(core, peer, report_type, rssi, data);
            }

            FirmwareNotification::PeerWrite {
                conn,
                service,
                attr_index,
                value,
                no_response,
            } => {
                gatt::on_peer_write(core, conn, service, attr_index, &value, no_response);
            }

            FirmwareNotification::PeerRead {
                conn,
                service,
                attr_index,
            } => {
                gatt::on_peer_read(core, conn, service, attr_index);
            }

            FirmwareNotification::TxDone {
                conn,
                service,
                attr_index,
                kind,
                status,
            } => {
                gatt::on_tx_done(core, conn, service, attr_index, kind, status);
            }

            FirmwareNotification::ReadResult { conn, status, value } => {
                central::on_request_result(core, conn, RequestKind::Read, status, Some(value));
            }

            FirmwareNotification::WriteResult { conn, status } => {
                central::on_request_result(core, conn, RequestKind::Write, status, None);
            }

            FirmwareNotification::NotificationReceived { conn, attr, value } => {
                if let Some(cb) = &core.client.notification_received {
                    cb(conn, attr, &value);
                }
            }

            FirmwareNotification::IndicationReceived { conn, attr, value } => {
                if let Some(cb) = &core.client.indication_received {
                    cb(conn, attr, &value);
                }
            }

            FirmwareNotification::PairingRequest { conn } => {
                let accept = core.server.secured_connect_allowed;
                debug!("pairing request on conn {}, accept {}", conn, accept);
                if let Err(status) =
                    core.firmware
                        .send_auth_mode(conn, &core.config.security, accept)
                {
                    error!("auth mode response failed with status {:#x}", status);
                }
                let _ = core.conns.with_slot(conn, |slot| slot.auth = AuthState::Started);
            }

            FirmwareNotification::SecurityRequest { conn } => {
                debug!("security request on conn {}", conn);
                if core.cmd_tx.post(CommandOp::Bond { conn }).is_err() {
                    error!("bond follow-up push failed for conn {}", conn);
                }
            }

            FirmwareNotification::PasskeyDisplay { conn, passkey } => {
                let passkey = self.effective_passkey(passkey);
                self.show_passkey(conn, passkey);
            }

            FirmwareNotification::PasskeyInputRequest { conn } => {
                if core.config.security.use_fixed_passkey {
                    let fixed = core.config.security.fixed_passkey;
                    debug!("answering passkey input with the fixed key");
                    if let Err(status) = core.firmware.passkey_confirm(conn, true, fixed) {
                        error!("passkey confirm failed with status {:#x}", status);
                    }
                } else {
                    error!("passkey input requested but no fixed passkey configured");
                }
            }

            FirmwareNotification::NumericComparisonRequest { conn, passkey } => {
                let passkey = self.effective_passkey(passkey);
                info!("numeric comparison on conn {}: {:06}", conn, passkey);
                self.show_passkey(conn, passkey);
            }

            FirmwareNotification::EncryptResult { conn, status } => {
                central::on_encrypt_result(core, conn, status);
            }

            FirmwareNotification::PairingSucceeded { conn } => {
                central::on_auth_complete(core, conn, 0, false);
            }

            FirmwareNotification::PairingFailed { conn, status } => {
                warn!("pairing failed on conn {} with status {:#x}", conn, status);
                central::on_auth_complete(core, conn, status.max(1), true);
            }

            FirmwareNotification::KeyMaterial(record) => {
                debug!("key material for {}", record.peer);
                if let Err(e) = core.bonds.save_bond(record) {
                    error!("storing bond failed: {}", e);
                }
            }

            // Routed to the command worker by the sink; never seen here.
            FirmwareNotification::ServiceRegistered { .. }
            | FirmwareNotification::WhitelistComplete { .. } => {
                warn!("completion notification reached the event worker");
            }
        }
    }

    fn effective_passkey(&self, reported: u32) -> u32 {
        if self.core.config.security.use_fixed_passkey {
            self.core.config.security.fixed_passkey
        } else {
            reported
        }
    }

    fn show_passkey(&self, conn: ConnHandle, passkey: u32) {
        let role = self
            .core
            .conns
            .with_slot(conn, |slot| slot.role)
            .unwrap_or(LinkRole::Undefined);
        match role {
            LinkRole::Central => {
                if let Some(cb) = &self.core.client.passkey_display {
                    cb(passkey, conn);
                }
            }
            LinkRole::Peripheral => gatt::report_passkey(&self.core, conn, passkey),
            LinkRole::Undefined => {
                error!("passkey for unknown link {}", conn);
            }
        }
    }

    /// Link closed: clear the slot, release every parked waiter, then tell
    /// the owning side of the stack.
    fn on_disconnected(&self, conn: ConnHandle, reason: u16) {
        let core = &self.core;
        let cleanup = match core.conns.clear_on_disconnect(conn) {
            Ok(cleanup) => cleanup,
            Err(e) => {
                error!("disconnect for bad handle {}: {}", conn, e);
                return;
            }
        };
        info!(
            "conn {} disconnected, reason {:#x}, role {:?}",
            conn, reason, cleanup.role
        );

        release_waiters(cleanup.disconnect_waiters);
        fail_waiters(
            cleanup.aborted_requests,
            AdapterError::InvalidState("link disconnected"),
        );
        if let Some(waiter) = cleanup.notify_waiter {
            let _ = waiter.send(reason.max(1));
        }

        match cleanup.role {
            LinkRole::Peripheral => {
                if let Some(cb) = &core.server.connected {
                    cb(
                        conn,
                        ServerConnectionKind::Disconnected,
                        &cleanup.peer,
                        cleanup.related_adv,
                    );
                }
                if let Some(cb) = &core.server.disconnected {
                    cb(conn, reason);
                }
            }
            LinkRole::Central => {
                if cleanup.app_connected {
                    if let Some(cb) = &core.client.device_disconnected {
                        cb(conn);
                    }
                }
            }
            LinkRole::Undefined => {
                warn!("disconnect for link {} with no role", conn);
            }
        }
        debug_assert_eq!(
            core.conns.state(conn).unwrap_or(ConnState::Disconnected),
            ConnState::Disconnected
        );
    }
}
