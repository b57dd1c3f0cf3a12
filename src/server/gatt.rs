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

//! Peripheral-role server operations and the event handlers that dispatch
//! incoming peer reads, writes and transmit completions.
//!
//! Write/read indications from the firmware address attributes by
//! (service, attribute index); the registry translates them to the stable
//! external handle before the application callback runs. A configured
//! reject code turns into the firmware-level error response and discards
//! the operation: the stored value is not updated and no callback fires.

use tracing::{debug, error, info, warn};

use crate::adapter::{BleAdapter, Core};
use crate::error::{AdapterError, AdapterResult};
use crate::firmware::TxKind;
use crate::types::{
    AttrCallbackKind, AttrEvent, AttrHandle, BdAddr, ConnHandle, ConnState, LinkRole,
    PeerAddress, ServerConnectionKind, NOTIFY_TX_TIMEOUT,
};

use super::registry::AttrKind;

impl BleAdapter {
    /// Store the application-side value of an attribute.
    pub fn attr_set_data(&self, handle: AttrHandle, data: &[u8]) -> AdapterResult<()> {
        let core = self.core()?;
        core.registry.set_value(handle, data)
    }

    /// Read back the stored value of an attribute (the latest accepted
    /// peer write or `attr_set_data` value).
    pub fn attr_get_data(&self, handle: AttrHandle) -> AdapterResult<Vec<u8>> {
        let core = self.core()?;
        core.registry.get_value(handle)
    }

    /// Configure the ATT error code future peer operations on `handle`
    /// receive; zero accepts again.
    pub fn attr_reject(&self, handle: AttrHandle, error_code: u8) -> AdapterResult<()> {
        let core = self.core()?;
        core.registry.set_reject(handle, error_code)
    }

    /// Send a notification and wait for the controller to transmit it.
    pub async fn notify(
        &self,
        conn: ConnHandle,
        handle: AttrHandle,
        data: &[u8],
    ) -> AdapterResult<()> {
        if data.is_empty() {
            return Err(AdapterError::InvalidArgument("empty notification payload"));
        }
        let core = self.core()?;
        if core.conns.state(conn)? != ConnState::Connected {
            return Err(AdapterError::InvalidState("link not connected"));
        }
        let (service, attr_index) = core.registry.locate_value(handle)?;

        let waiter = core.conns.register_notify_waiter(conn)?;
        core.firmware
            .notify_value(conn, service, attr_index, data)
            .map_err(AdapterError::Firmware)?;

        match tokio::time::timeout(NOTIFY_TX_TIMEOUT, waiter).await {
            Err(_) => {
                core.conns.take_notify_waiter(conn);
                Err(AdapterError::Timeout)
            }
            Ok(Err(_)) => Err(AdapterError::NotRunning),
            Ok(Ok(status)) => AdapterError::from_status(status),
        }
    }

    /// Queue an indication. At most [`crate::types::MAX_PENDING_INDICATIONS`]
    /// may be in flight per connection; the completion arrives through the
    /// attribute callback.
    pub fn indicate(&self, conn: ConnHandle, handle: AttrHandle, data: &[u8]) -> AdapterResult<()> {
        if data.is_empty() {
            return Err(AdapterError::InvalidArgument("empty indication payload"));
        }
        let core = self.core()?;
        let (service, attr_index) = core.registry.locate_value(handle)?;

        // Claim a pending-indication slot before touching the firmware;
        // the cap failure must be purely local.
        core.conns.begin_indication(conn)?;
        if let Err(status) = core.firmware.indicate_value(conn, service, attr_index, data) {
            core.conns.end_indication(conn);
            return Err(AdapterError::Firmware(status));
        }
        Ok(())
    }

    /// Indications currently in flight on `conn`.
    pub fn indicate_pending_count(&self, conn: ConnHandle) -> AdapterResult<u32> {
        let core = self.core()?;
        if core.conns.state(conn)? != ConnState::Connected {
            return Err(AdapterError::InvalidState("link not connected"));
        }
        core.conns.pending_indications(conn)
    }

    /// Peer address of a connected link.
    pub fn peer_of(&self, conn: ConnHandle) -> AdapterResult<PeerAddress> {
        let core = self.core()?;
        core.conns.with_slot(conn, |slot| {
            if slot.state == ConnState::Connected {
                Ok(slot.peer)
            } else {
                Err(AdapterError::InvalidState("link not connected"))
            }
        })?
    }

    /// Connection handle of the link to `addr`, if any.
    pub fn conn_of(&self, addr: &BdAddr) -> AdapterResult<ConnHandle> {
        let core = self.core()?;
        core.conns
            .find_by_peer(addr)
            .ok_or(AdapterError::InvalidState("no link to that address"))
    }

    /// Set the GAP device name.
    pub fn set_device_name(&self, name: &str) -> AdapterResult<()> {
        if name.is_empty() {
            return Err(AdapterError::InvalidArgument("empty device name"));
        }
        let core = self.core()?;
        core.firmware
            .set_device_name(name.as_bytes())
            .map_err(AdapterError::Firmware)
    }
}

/// Dispatch an incoming peer write. Runs on the event worker.
pub(crate) fn on_peer_write(
    core: &Core,
    conn: ConnHandle,
    service: u8,
    attr_index: u16,
    value: &[u8],
    no_response: bool,
) {
    let Some(target) = core.registry.target(service, attr_index) else {
        error!(
            "write for unknown attribute, service {} index {}",
            service, attr_index
        );
        return;
    };
    debug!(
        "peer write conn {} handle {:#x} len {} reject {:#x}",
        conn,
        target.handle,
        value.len(),
        target.reject
    );

    if let Err(status) = core
        .firmware
        .write_response(conn, service, attr_index, target.reject)
    {
        warn!("write response failed with status {:#x}", status);
    }
    if target.reject != 0 {
        warn!("write rejected with code {:#x}", target.reject);
        return;
    }

    let event = match target.kind {
        AttrKind::Cccd => {
            let mut bits = [0u8; 2];
            for (dst, src) in bits.iter_mut().zip(value.iter()) {
                *dst = *src;
            }
            let bits = u16::from_le_bytes(bits);
            core.registry.set_cccd(service, attr_index, bits);
            AttrEvent {
                kind: AttrCallbackKind::CccdChanged,
                conn,
                handle: target.handle,
                status: bits,
                pending: 0,
            }
        }
        _ => {
            core.registry.commit_peer_write(service, attr_index, value);
            AttrEvent {
                kind: if no_response {
                    AttrCallbackKind::WriteNoResponse
                } else {
                    AttrCallbackKind::Write
                },
                conn,
                handle: target.handle,
                status: 0,
                pending: 0,
            }
        }
    };

    if let Some(cb) = target.callback {
        cb(event);
    }
}

/// Dispatch an incoming peer read. Runs on the event worker.
pub(crate) fn on_peer_read(core: &Core, conn: ConnHandle, service: u8, attr_index: u16) {
    let Some(target) = core.registry.target(service, attr_index) else {
        error!(
            "read for unknown attribute, service {} index {}",
            service, attr_index
        );
        return;
    };

    let payload = match target.kind {
        AttrKind::Cccd => core
            .registry
            .cccd_bits(service, attr_index)
            .to_le_bytes()
            .to_vec(),
        _ => core.registry.value_at(service, attr_index),
    };
    debug!(
        "peer read conn {} handle {:#x} len {}",
        conn,
        target.handle,
        payload.len()
    );

    if let Err(status) = core
        .firmware
        .read_response(conn, service, attr_index, &payload, target.reject)
    {
        warn!("read response failed with status {:#x}", status);
    }
    if target.reject != 0 {
        warn!("read rejected with code {:#x}", target.reject);
        return;
    }

    // CCCD reads are answered from bookkeeping and not surfaced.
    if target.kind != AttrKind::Cccd {
        if let Some(cb) = target.callback {
            cb(AttrEvent {
                kind: AttrCallbackKind::Read,
                conn,
                handle: target.handle,
                status: 0,
                pending: 0,
            });
        }
    }
}

/// A queued notification or indication left the controller.
pub(crate) fn on_tx_done(
    core: &Core,
    conn: ConnHandle,
    service: u8,
    attr_index: u16,
    kind: TxKind,
    status: u16,
) {
    match kind {
        TxKind::Notification => {
            if let Some(waiter) = core.conns.take_notify_waiter(conn) {
                let _ = waiter.send(status);
            }
        }
        TxKind::Indication => {
            let remaining = core.conns.end_indication(conn);
            if let Some(target) = core.registry.target(service, attr_index) {
                if let Some(cb) = target.callback {
                    cb(AttrEvent {
                        kind: AttrCallbackKind::IndicateResult,
                        conn,
                        handle: target.handle,
                        status,
                        pending: remaining,
                    });
                }
            }
        }
    }
}

/// MTU renegotiated on a link.
pub(crate) fn on_mtu_changed(core: &Core, conn: ConnHandle, mtu: u16) {
    let role = core
        .conns
        .with_slot(conn, |slot| {
            slot.mtu = mtu;
            slot.role
        })
        .unwrap_or(LinkRole::Undefined);
    info!("conn {} mtu {}", conn, mtu);
    if role == LinkRole::Peripheral {
        if let Some(cb) = &core.server.mtu_updated {
            cb(conn, mtu);
        }
    }
}

/// Report a server link as connected (link layer or security level) to
/// the application.
pub(crate) fn report_connected(core: &Core, conn: ConnHandle, kind: ServerConnectionKind) {
    let Ok((peer, related_adv)) = core
        .conns
        .with_slot(conn, |slot| (slot.peer, slot.related_adv))
    else {
        error!("connected report for bad handle {}", conn);
        return;
    };
    debug!("server link {} {:?} adv {:?}", conn, kind, related_adv);
    if let Some(cb) = &core.server.connected {
        cb(conn, kind, &peer, related_adv);
    }
}

/// Surface a passkey on a peripheral link.
pub(crate) fn report_passkey(core: &Core, conn: ConnHandle, passkey: u32) {
    if let Some(cb) = &core.server.passkey_displayed {
        cb(conn, passkey);
    }
}
