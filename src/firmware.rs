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

//! Radio-controller firmware collaborator.
//!
//! The firmware accepts fire-and-forget commands: each call returns an
//! immediate accept/reject, and the real outcome arrives later through the
//! [`FirmwareEventSink`] handed over at [`FirmwareController::attach`]
//! time. The sink is the adapter's single completion callback and single
//! notification callback rolled into one handle.

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, warn};
use uuid::Uuid;

use crate::config::SecurityConfig;
use crate::storage::{BondRecord, BondStorage};
use crate::types::{
    AdvParams, AdvReportType, AttrHandle, AttrPermissions, AttrProperties, BdAddr, ConnHandle,
    ConnParams, LinkRole, PeerAddress, ScanParams,
};
use crate::workers::event::Event;

/// Immediate accept/reject of a firmware command; the payload is the raw
/// firmware status code on rejection.
pub type FwResult = Result<(), u16>;

/// Primitive firmware command kinds, used to match completion events to
/// the step that is waiting for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareOp {
    CreateAdv,
    ModifyAdv,
    SetAdvRandomAddr,
    SetAdvData,
    SetScanResponse,
    StartAdv,
    StopAdv,
    DeleteAdv,
    CreateScan,
    StartScan,
    StopScan,
    DeleteScan,
    CreateInitiator,
    StartInitiator,
    StopInitiator,
    Disconnect,
    RegisterService,
    WhitelistOp,
}

/// Completion of a previously accepted firmware command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandComplete {
    pub op: FirmwareOp,
    /// Advertising / scan / initiator / connection index the command
    /// targeted.
    pub target: u8,
    /// Zero on success.
    pub status: u16,
}

/// Why an advertisement stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvStopReason {
    /// The host asked for the stop.
    HostRequest,
    /// A peer connected to the advertisement.
    Connection,
    /// The configured event-count limit was reached.
    LimitReached,
}

/// Why a scan session stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStopReason {
    HostRequest,
    DurationElapsed,
}

/// Transmit kind reported by a tx-done notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxKind {
    Notification,
    Indication,
}

/// Out-of-band notifications pushed by the firmware.
#[derive(Debug, Clone)]
pub enum FirmwareNotification {
    ConnectionEstablished {
        conn: ConnHandle,
        role: LinkRole,
        peer: PeerAddress,
        interval: u16,
        latency: u16,
        supervision_timeout: u16,
    },
    ConnectionFailed {
        status: u16,
    },
    Disconnected {
        conn: ConnHandle,
        reason: u16,
    },
    MtuChanged {
        conn: ConnHandle,
        mtu: u16,
    },
    ConnParamsUpdated {
        conn: ConnHandle,
        interval: u16,
        latency: u16,
        supervision_timeout: u16,
    },
    AdvStopped {
        adv_idx: u8,
        conn: Option<ConnHandle>,
        reason: AdvStopReason,
    },
    ScanStopped {
        reason: ScanStopReason,
    },
    ScanReport {
        peer: PeerAddress,
        report_type: AdvReportType,
        rssi: i8,
        data: Vec<u8>,
    },
    /// Peer wrote one of our attributes, addressed by (service, index).
    PeerWrite {
        conn: ConnHandle,
        service: u8,
        attr_index: u16,
        value: Vec<u8>,
        no_response: bool,
    },
    /// Peer read one of our attributes.
    PeerRead {
        conn: ConnHandle,
        service: u8,
        attr_index: u16,
    },
    /// A queued notification or indication left the controller.
    TxDone {
        conn: ConnHandle,
        service: u8,
        attr_index: u16,
        kind: TxKind,
        status: u16,
    },
    /// Untagged completion of the oldest outstanding client read.
    ReadResult {
        conn: ConnHandle,
        status: u16,
        value: Vec<u8>,
    },
    /// Untagged completion of the oldest outstanding client write.
    WriteResult {
        conn: ConnHandle,
        status: u16,
    },
    /// Peer notification received on a client link.
    NotificationReceived {
        conn: ConnHandle,
        attr: AttrHandle,
        value: Vec<u8>,
    },
    /// Peer indication received on a client link.
    IndicationReceived {
        conn: ConnHandle,
        attr: AttrHandle,
        value: Vec<u8>,
    },
    PairingRequest {
        conn: ConnHandle,
    },
    SecurityRequest {
        conn: ConnHandle,
    },
    PasskeyDisplay {
        conn: ConnHandle,
        passkey: u32,
    },
    PasskeyInputRequest {
        conn: ConnHandle,
    },
    NumericComparisonRequest {
        conn: ConnHandle,
        passkey: u32,
    },
    EncryptResult {
        conn: ConnHandle,
        status: u16,
    },
    PairingSucceeded {
        conn: ConnHandle,
    },
    PairingFailed {
        conn: ConnHandle,
        status: u16,
    },
    /// Key material distributed during bonding, to be persisted.
    KeyMaterial(BondRecord),
    /// Attribute database registration finished.
    ServiceRegistered {
        status: u16,
    },
    /// A whitelist add/remove/clear finished.
    WhitelistComplete {
        status: u16,
    },
}

/// One attribute of a service table handed to the firmware.
#[derive(Debug, Clone)]
pub struct ServiceAttribute {
    pub uuid: Uuid,
    pub properties: AttrProperties,
    pub permissions: AttrPermissions,
    pub max_len: u16,
}

/// A service table handed to the firmware for registration.
#[derive(Debug, Clone)]
pub struct ServiceDefinition {
    pub service_index: u8,
    pub uuid: Uuid,
    pub start_handle: AttrHandle,
    pub attributes: Vec<ServiceAttribute>,
}

/// Handle through which the firmware reports completions, notifications
/// and bond-information queries back into the adapter.
#[derive(Clone)]
pub struct FirmwareEventSink {
    completions: mpsc::UnboundedSender<CommandComplete>,
    events: mpsc::Sender<Event>,
    bonds: Arc<BondStorage>,
}

impl FirmwareEventSink {
    pub(crate) fn new(
        completions: mpsc::UnboundedSender<CommandComplete>,
        events: mpsc::Sender<Event>,
        bonds: Arc<BondStorage>,
    ) -> Self {
        Self {
            completions,
            events,
            bonds,
        }
    }

    /// Report completion of a previously accepted command.
    pub fn command_complete(&self, complete: CommandComplete) {
        if self.completions.send(complete).is_err() {
            warn!("completion dropped, command worker gone: {:?}", complete);
        }
    }

    /// Push a firmware notification.
    ///
    /// Service-registration and whitelist completions are steered to the
    /// command worker, which waits for them on the command path; everything
    /// else goes to the event queue.
    pub fn notify(&self, notification: FirmwareNotification) {
        match notification {
            FirmwareNotification::ServiceRegistered { status } => {
                self.command_complete(CommandComplete {
                    op: FirmwareOp::RegisterService,
                    target: 0,
                    status,
                });
            }
            FirmwareNotification::WhitelistComplete { status } => {
                self.command_complete(CommandComplete {
                    op: FirmwareOp::WhitelistOp,
                    target: 0,
                    status,
                });
            }
            other => {
                if let Err(e) = self.events.try_send(Event::Firmware(other)) {
                    error!("event queue push failed: {}", e);
                }
            }
        }
    }

    /// Synchronous bond lookup: the firmware asks for stored key material
    /// when a bonded peer reconnects.
    pub fn bond_info(&self, addr: &BdAddr, addr_type: crate::types::AddrType) -> Option<BondRecord> {
        self.bonds.find(addr, addr_type)
    }
}

/// The radio-controller firmware.
///
/// Each method submits one primitive command and returns the firmware's
/// immediate accept/reject. Indices are host-chosen activity identifiers;
/// completions referencing them arrive through the attached sink.
pub trait FirmwareController: Send + Sync + 'static {
    /// Hand the firmware its reporting channel. Called once per `init`.
    fn attach(&self, sink: FirmwareEventSink);

    // Advertising.
    fn create_advertising(&self, adv_idx: u8, params: &AdvParams) -> FwResult;
    fn modify_advertising(&self, adv_idx: u8, params: &AdvParams) -> FwResult;
    fn set_adv_random_addr(&self, adv_idx: u8, addr: &BdAddr) -> FwResult;
    fn set_adv_data(&self, adv_idx: u8, data: &[u8]) -> FwResult;
    fn set_scan_response(&self, adv_idx: u8, data: &[u8]) -> FwResult;
    fn set_adv_tx_power(&self, adv_idx: u8, gain_dbm: f32) -> FwResult;
    fn start_advertising(&self, adv_idx: u8, duration: u16, max_events: u8) -> FwResult;
    fn stop_advertising(&self, adv_idx: u8) -> FwResult;
    fn delete_advertising(&self, adv_idx: u8) -> FwResult;

    // Scanning.
    fn create_scan(&self, scan_idx: u8, params: &ScanParams) -> FwResult;
    fn start_scan(&self, scan_idx: u8, duration: u16, period: u16) -> FwResult;
    fn stop_scan(&self, scan_idx: u8) -> FwResult;
    fn delete_scan(&self, scan_idx: u8) -> FwResult;

    // Connections.
    fn create_initiator(&self, init_idx: u8, params: &ConnParams) -> FwResult;
    fn set_initiator_target(&self, init_idx: u8, peer: &PeerAddress) -> FwResult;
    fn set_initiator_timeout(&self, init_idx: u8, timeout_ms: u32) -> FwResult;
    fn start_initiator(&self, init_idx: u8) -> FwResult;
    fn stop_initiator(&self, init_idx: u8) -> FwResult;
    fn disconnect(&self, conn: ConnHandle) -> FwResult;
    fn update_conn_params(&self, conn: ConnHandle, params: &ConnParams) -> FwResult;
    fn set_max_mtu(&self, mtu: u16) -> FwResult;
    fn set_device_name(&self, name: &[u8]) -> FwResult;

    // GATT server.
    fn register_service(&self, service: &ServiceDefinition) -> FwResult;
    fn read_response(
        &self,
        conn: ConnHandle,
        service: u8,
        attr_index: u16,
        value: &[u8],
        reject: u8,
    ) -> FwResult;
    fn write_response(&self, conn: ConnHandle, service: u8, attr_index: u16, reject: u8)
        -> FwResult;
    fn notify_value(&self, conn: ConnHandle, service: u8, attr_index: u16, value: &[u8])
        -> FwResult;
    fn indicate_value(
        &self,
        conn: ConnHandle,
        service: u8,
        attr_index: u16,
        value: &[u8],
    ) -> FwResult;

    // GATT client.
    fn read_attribute(&self, conn: ConnHandle, attr: AttrHandle) -> FwResult;
    fn write_attribute(
        &self,
        conn: ConnHandle,
        attr: AttrHandle,
        value: &[u8],
        with_response: bool,
    ) -> FwResult;

    // Security.
    fn create_bond(&self, conn: ConnHandle, security: &SecurityConfig) -> FwResult;
    fn send_auth_mode(&self, conn: ConnHandle, security: &SecurityConfig, accept: bool)
        -> FwResult;
    fn passkey_confirm(&self, conn: ConnHandle, accept: bool, passkey: u32) -> FwResult;

    // Whitelist.
    fn whitelist_add(&self, peer: &PeerAddress) -> FwResult;
    fn whitelist_remove(&self, peer: &PeerAddress) -> FwResult;
    fn whitelist_clear(&self) -> FwResult;
}
