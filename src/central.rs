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

//! Central-role operations: connecting, bonding and GATT client
//! read/write, plus the link and security event handlers.
//!
//! Client read/write completions from the firmware are untagged; the
//! per-connection pending-request FIFOs attribute each completion to the
//! oldest outstanding request of its kind.

use tracing::{debug, error, info, warn};

use crate::adapter::{BleAdapter, Core};
use crate::command::{CommandOp, CommandValue};
use crate::error::{AdapterError, AdapterResult};
use crate::server::gatt;
use crate::slots::conn::{InitState, RequestKind};
use crate::types::{
    AttrHandle, AuthState, ConnHandle, ConnParams, ConnState, ConnectTarget, ConnectedDevice,
    LinkRole, PeerAddress, ServerConnectionKind,
};

/// Security-manager status for a missing link key; the stored bond is
/// stale and must be re-established.
const SM_STATUS_KEY_MISSING: u16 = 0x22;

impl BleAdapter {
    /// Connect to a peer. Blocks until the link is established (and, for
    /// a secured target, bonded and encrypted) or definitively failed.
    pub async fn connect(&self, target: ConnectTarget) -> AdapterResult<ConnHandle> {
        if target.peer.addr.is_zero() {
            return Err(AdapterError::InvalidArgument("zero peer address"));
        }
        let core = self.core()?;
        if core.conns.find_by_peer(&target.peer.addr).is_some() {
            return Err(AdapterError::AlreadyInProgress);
        }
        core.conns.begin_initiation(target)?;

        let reply = match core.cmd_tx.submit(CommandOp::Connect) {
            Ok(reply) => reply,
            Err(e) => {
                core.conns.abort_initiation();
                return Err(e);
            }
        };
        match tokio::time::timeout(core.config.connect_timeout(), reply).await {
            // The initiator keeps running; the firmware reports the final
            // outcome later and the slot state resolves then.
            Err(_) => Err(AdapterError::Timeout),
            Ok(Err(_)) => Err(AdapterError::NotRunning),
            Ok(Ok(Ok(CommandValue::Handle(conn)))) => Ok(conn),
            Ok(Ok(Ok(_))) => Err(AdapterError::Inconsistent("unexpected connect reply")),
            Ok(Ok(Err(e))) => Err(e),
        }
    }

    /// Disconnect a link. A no-op success when it is already down.
    pub async fn disconnect(&self, conn: ConnHandle) -> AdapterResult<()> {
        let core = self.core()?;
        let supervision = core.conns.with_slot(conn, |slot| slot.supervision_timeout)?;
        let reply = core.cmd_tx.submit(CommandOp::Disconnect { conn })?;
        match tokio::time::timeout(core.config.disconnect_timeout(supervision), reply).await {
            Err(_) => Err(AdapterError::Timeout),
            Ok(Err(_)) => Err(AdapterError::NotRunning),
            Ok(Ok(outcome)) => outcome.map(|_| ()),
        }
    }

    /// Start bonding on a connected link.
    pub async fn bond(&self, conn: ConnHandle) -> AdapterResult<()> {
        self.call(CommandOp::Bond { conn }).await?;
        Ok(())
    }

    /// Forget the stored bond for a peer.
    pub fn delete_bond(&self, peer: &PeerAddress) -> AdapterResult<()> {
        let core = self.core()?;
        core.bonds.delete_bond(&peer.addr, peer.addr_type)
    }

    /// Forget every stored bond.
    pub fn clear_bonds(&self) -> AdapterResult<()> {
        let core = self.core()?;
        core.bonds.clear_bonds()
    }

    /// Peers with stored bonds.
    pub fn bonded_devices(&self) -> AdapterResult<Vec<PeerAddress>> {
        let core = self.core()?;
        Ok(core.bonds.bonded_devices())
    }

    /// State of a connection slot.
    pub fn connection_state(&self, conn: ConnHandle) -> AdapterResult<ConnState> {
        let core = self.core()?;
        core.conns.state(conn)
    }

    /// Every currently connected link.
    pub fn connected_devices(&self) -> AdapterResult<Vec<ConnectedDevice>> {
        let core = self.core()?;
        Ok(core.conns.connected_snapshot())
    }

    /// Request a connection parameter update; the negotiated values land
    /// on the slot when the firmware confirms them.
    pub fn update_conn_params(&self, conn: ConnHandle, params: &ConnParams) -> AdapterResult<()> {
        let core = self.core()?;
        if core.conns.state(conn)? != ConnState::Connected {
            return Err(AdapterError::InvalidState("link not connected"));
        }
        core.firmware
            .update_conn_params(conn, params)
            .map_err(AdapterError::Firmware)
    }

    /// Read a peer attribute. Resolved in arrival order with the other
    /// outstanding reads on the link.
    pub async fn gatt_read(&self, conn: ConnHandle, attr: AttrHandle) -> AdapterResult<Vec<u8>> {
        if attr == 0 {
            return Err(AdapterError::InvalidArgument("zero attribute handle"));
        }
        match self.call(CommandOp::GattRead { conn, attr }).await? {
            CommandValue::Data(value) => Ok(value),
            _ => Err(AdapterError::Inconsistent("unexpected read reply")),
        }
    }

    /// Write a peer attribute and wait for its acknowledgement.
    pub async fn gatt_write(
        &self,
        conn: ConnHandle,
        attr: AttrHandle,
        value: &[u8],
    ) -> AdapterResult<()> {
        self.gatt_write_inner(conn, attr, value, true).await
    }

    /// Write a peer attribute without response.
    pub async fn gatt_write_no_response(
        &self,
        conn: ConnHandle,
        attr: AttrHandle,
        value: &[u8],
    ) -> AdapterResult<()> {
        self.gatt_write_inner(conn, attr, value, false).await
    }

    async fn gatt_write_inner(
        &self,
        conn: ConnHandle,
        attr: AttrHandle,
        value: &[u8],
        with_response: bool,
    ) -> AdapterResult<()> {
        if attr == 0 {
            return Err(AdapterError::InvalidArgument("zero attribute handle"));
        }
        if value.is_empty() {
            return Err(AdapterError::InvalidArgument("empty write payload"));
        }
        self.call(CommandOp::GattWrite {
            conn,
            attr,
            value: value.to_vec(),
            with_response,
        })
        .await?;
        Ok(())
    }
}

/// A link came up (either role). Runs on the event worker.
pub(crate) fn on_link_established(
    core: &Core,
    conn: ConnHandle,
    role: LinkRole,
    peer: PeerAddress,
    interval: u16,
    latency: u16,
    supervision_timeout: u16,
) {
    let peer = core.bonds.resolve_identity(peer);
    if let Err(e) = core
        .conns
        .set_connected(conn, role, peer, interval, latency, supervision_timeout)
    {
        error!("connection for bad handle {}: {}", conn, e);
        return;
    }
    info!("conn {} established to {} as {:?}", conn, peer, role);

    match role {
        LinkRole::Peripheral => {
            // The server-connected report follows the advertising-stopped
            // notification that carries the producing advertisement.
        }
        LinkRole::Central => {
            let (target, init_handle) = core.conns.with_initiator(|init| {
                init.state = InitState::Idle;
                (init.target.take(), init.handle.take())
            });
            if let Some(handle) = init_handle {
                core.ids.free(handle);
            }

            let secured = target.as_ref().map(|t| t.secured).unwrap_or(false);
            if let Some(target) = &target {
                if target.peer.addr != peer.addr {
                    error!(
                        "connected peer {} does not match target {}",
                        peer, target.peer
                    );
                }
            }
            let _ = core.conns.with_slot(conn, |slot| slot.secured = secured);

            let auth = core
                .conns
                .with_slot(conn, |slot| slot.auth)
                .unwrap_or(AuthState::None);
            if secured && auth != AuthState::Complete {
                debug!("secured connect: bonding before the connected report");
                if core.cmd_tx.post(CommandOp::Bond { conn }).is_err() {
                    error!("bond follow-up push failed for conn {}", conn);
                }
            } else {
                finish_central_connect(core, conn, false);
            }
        }
        LinkRole::Undefined => error!("connection with no role on {}", conn),
    }
}

/// Report a central link to the application and release the connecting
/// caller.
fn finish_central_connect(core: &Core, conn: ConnHandle, bonded: bool) {
    let device = core.conns.with_slot(conn, |slot| {
        slot.app_connected = true;
        ConnectedDevice {
            conn,
            peer: slot.peer,
            interval: slot.interval,
            latency: slot.latency,
            mtu: slot.mtu,
            bonded,
            secured: slot.secured,
        }
    });
    let Ok(device) = device else {
        error!("connected report for bad handle {}", conn);
        return;
    };
    if let Some(waiter) = core.conns.take_initiator_waiter() {
        let _ = waiter.send(Ok(CommandValue::Handle(conn)));
    }
    if let Some(cb) = &core.client.device_connected {
        cb(&device);
    }
}

/// The initiator gave up. Runs on the event worker.
pub(crate) fn on_connect_failed(core: &Core, status: u16) {
    warn!("connection attempt failed with status {:#x}", status);
    let init_handle = core.conns.with_initiator(|init| {
        init.state = InitState::Idle;
        init.target = None;
        init.handle.take()
    });
    if let Some(handle) = init_handle {
        core.ids.free(handle);
    }
    if let Some(waiter) = core.conns.take_initiator_waiter() {
        let _ = waiter.send(Err(AdapterError::Firmware(status.max(1))));
    }
}

/// Untagged completion of the oldest outstanding client request of
/// `kind`. Runs on the event worker.
pub(crate) fn on_request_result(
    core: &Core,
    conn: ConnHandle,
    kind: RequestKind,
    status: u16,
    value: Option<Vec<u8>>,
) {
    let Some(pending) = core.conns.pop_pending(conn, kind) else {
        error!(
            "untagged {:?} completion on conn {} with empty queue",
            kind, conn
        );
        return;
    };
    debug!(
        "{:?} on conn {} attr {:#x} completed with status {:#x}",
        kind, conn, pending.attr, status
    );
    let outcome = if status == 0 {
        Ok(match value {
            Some(value) => CommandValue::Data(value),
            None => CommandValue::None,
        })
    } else {
        Err(AdapterError::Firmware(status))
    };
    let _ = pending.reply.send(outcome);
}

/// Authentication finished (success or failure). Runs on the event
/// worker. `forget_bond` drops the stored record on failure; pairing
/// failures invalidate it, transient encryption failures do not.
pub(crate) fn on_auth_complete(core: &Core, conn: ConnHandle, status: u16, forget_bond: bool) {
    if status == 0 {
        let state = core.conns.with_slot(conn, |slot| {
            let previous = slot.auth;
            slot.auth = AuthState::Complete;
            (slot.role, previous)
        });
        let Ok((role, previous)) = state else {
            error!("auth completion for bad handle {}", conn);
            return;
        };
        match role {
            LinkRole::Peripheral => {
                gatt::report_connected(core, conn, ServerConnectionKind::SecurityConnected);
            }
            LinkRole::Central => {
                if previous != AuthState::Complete {
                    info!("conn {} bonded", conn);
                    finish_central_connect(core, conn, true);
                }
            }
            LinkRole::Undefined => warn!("auth completion on roleless link {}", conn),
        }
    } else {
        let info = core.conns.with_slot(conn, |slot| {
            slot.auth = AuthState::None;
            (slot.role, slot.peer)
        });
        let Ok((role, peer)) = info else {
            return;
        };
        warn!("auth failed on conn {} with status {:#x}", conn, status);
        if forget_bond {
            if let Err(e) = core.bonds.delete_bond(&peer.addr, peer.addr_type) {
                error!("bond cleanup failed: {}", e);
            }
        }
        if role == LinkRole::Central {
            if let Some(waiter) = core.conns.take_initiator_waiter() {
                let _ = waiter.send(Err(AdapterError::Firmware(status)));
            }
        }
    }
}

/// Link encryption finished. Runs on the event worker.
pub(crate) fn on_encrypt_result(core: &Core, conn: ConnHandle, status: u16) {
    if status == 0 {
        on_auth_complete(core, conn, 0, false);
        return;
    }
    debug!("encrypt failed on conn {} with status {:#x}", conn, status);
    if status == SM_STATUS_KEY_MISSING {
        let info = core.conns.with_slot(conn, |slot| (slot.role, slot.peer, slot.secured));
        if let Ok((role, peer, secured)) = info {
            if let Err(e) = core.bonds.delete_bond(&peer.addr, peer.addr_type) {
                error!("stale bond cleanup failed: {}", e);
            }
            if role == LinkRole::Central && secured {
                info!("link key missing, re-pairing conn {}", conn);
                if core.cmd_tx.post(CommandOp::Bond { conn }).is_err() {
                    error!("re-pair follow-up push failed for conn {}", conn);
                }
                return;
            }
        }
    }
    on_auth_complete(core, conn, status, false);
}
