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

//! Connection slot table and the single initiator slot.
//!
//! Each slot keeps three pending-request FIFOs (read, write, service
//! discovery). The firmware's completion events for these request kinds
//! carry no correlation tag, so entries are consumed strictly in arrival
//! order: arrival order equals request order, per kind. The invariant is
//! never assumed to hold across different kinds.

use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::oneshot;

use crate::command::{CommandValue, ReplySender};
use crate::error::{AdapterError, AdapterResult};
use crate::types::{
    AddrType, AttrHandle, AuthState, BdAddr, ConnHandle, ConnState, ConnectTarget, LinkRole,
    PeerAddress, CONN_SLOT_COUNT, DEFAULT_MTU, MAX_PENDING_INDICATIONS,
};

/// One outstanding peer-directed request awaiting its untagged completion.
pub(crate) struct PendingRequest {
    pub attr: AttrHandle,
    pub reply: ReplySender,
}

/// Request kind selecting which FIFO an entry lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestKind {
    Read,
    Write,
    Discovery,
}

pub(crate) struct ConnSlot {
    pub state: ConnState,
    pub role: LinkRole,
    pub peer: PeerAddress,
    pub interval: u16,
    pub latency: u16,
    pub supervision_timeout: u16,
    pub mtu: u16,
    pub auth: AuthState,
    pub secured: bool,
    /// The application has been told about this link.
    pub app_connected: bool,
    /// Advertisement that produced this link, if any.
    pub related_adv: Option<u8>,
    pending_reads: VecDeque<PendingRequest>,
    pending_writes: VecDeque<PendingRequest>,
    pending_discoveries: VecDeque<PendingRequest>,
    pub pending_indications: u32,
    /// Waiter for a synchronous notification transmit.
    pub notify_waiter: Option<oneshot::Sender<u16>>,
    /// Callers blocked until this link reports disconnected.
    pub disconnect_waiters: Vec<ReplySender>,
}

impl Default for ConnSlot {
    fn default() -> Self {
        Self {
            state: ConnState::Disconnected,
            role: LinkRole::Undefined,
            peer: PeerAddress {
                addr: BdAddr::ZERO,
                addr_type: AddrType::Public,
            },
            interval: 0,
            latency: 0,
            supervision_timeout: 0,
            mtu: DEFAULT_MTU,
            auth: AuthState::None,
            secured: false,
            app_connected: false,
            related_adv: None,
            pending_reads: VecDeque::new(),
            pending_writes: VecDeque::new(),
            pending_discoveries: VecDeque::new(),
            pending_indications: 0,
            notify_waiter: None,
            disconnect_waiters: Vec::new(),
        }
    }
}

impl ConnSlot {
    fn fifo_mut(&mut self, kind: RequestKind) -> &mut VecDeque<PendingRequest> {
        match kind {
            RequestKind::Read => &mut self.pending_reads,
            RequestKind::Write => &mut self.pending_writes,
            RequestKind::Discovery => &mut self.pending_discoveries,
        }
    }
}

/// State of the single central-role initiator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum InitState {
    #[default]
    Idle,
    Initiating,
}

#[derive(Default)]
pub(crate) struct InitiatorState {
    pub state: InitState,
    /// Controller activity index while initiating.
    pub handle: Option<u8>,
    pub target: Option<ConnectTarget>,
    /// The connecting caller, released once the link is up (or failed).
    pub waiter: Option<ReplySender>,
}

/// Everything collected while tearing a link down, resolved outside the
/// table lock.
pub(crate) struct DisconnectCleanup {
    pub role: LinkRole,
    pub peer: PeerAddress,
    pub related_adv: Option<u8>,
    pub app_connected: bool,
    pub disconnect_waiters: Vec<ReplySender>,
    pub aborted_requests: Vec<ReplySender>,
    pub notify_waiter: Option<oneshot::Sender<u16>>,
}

struct ConnTableInner {
    slots: [ConnSlot; CONN_SLOT_COUNT],
    /// A peripheral-role link is currently up.
    peripheral_connected: bool,
}

/// The connection slot table.
pub(crate) struct ConnTable {
    inner: Mutex<ConnTableInner>,
    init: Mutex<InitiatorState>,
}

impl ConnTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ConnTableInner {
                slots: std::array::from_fn(|_| ConnSlot::default()),
                peripheral_connected: false,
            }),
            init: Mutex::new(InitiatorState::default()),
        }
    }

    /// Reset every slot; returns the waiters that must be failed.
    pub fn reset(&self) -> Vec<ReplySender> {
        let mut inner = self.inner.lock();
        let mut orphans = Vec::new();
        for slot in inner.slots.iter_mut() {
            let mut old = std::mem::take(slot);
            orphans.extend(old.disconnect_waiters.drain(..));
            orphans.extend(old.pending_reads.drain(..).map(|p| p.reply));
            orphans.extend(old.pending_writes.drain(..).map(|p| p.reply));
            orphans.extend(old.pending_discoveries.drain(..).map(|p| p.reply));
        }
        inner.peripheral_connected = false;
        drop(inner);

        let mut init = self.init.lock();
        if let Some(waiter) = init.waiter.take() {
            orphans.push(waiter);
        }
        *init = InitiatorState::default();
        orphans
    }

    pub fn with_slot<R>(
        &self,
        conn: ConnHandle,
        f: impl FnOnce(&mut ConnSlot) -> R,
    ) -> AdapterResult<R> {
        let mut inner = self.inner.lock();
        let slot = inner
            .slots
            .get_mut(conn as usize)
            .ok_or(AdapterError::InvalidArgument("connection handle out of range"))?;
        Ok(f(slot))
    }

    pub fn state(&self, conn: ConnHandle) -> AdapterResult<ConnState> {
        self.with_slot(conn, |slot| slot.state)
    }

    /// Record a freshly established link.
    pub fn set_connected(
        &self,
        conn: ConnHandle,
        role: LinkRole,
        peer: PeerAddress,
        interval: u16,
        latency: u16,
        supervision_timeout: u16,
    ) -> AdapterResult<()> {
        let mut inner = self.inner.lock();
        let slot = inner
            .slots
            .get_mut(conn as usize)
            .ok_or(AdapterError::InvalidArgument("connection handle out of range"))?;
        *slot = ConnSlot {
            state: ConnState::Connected,
            role,
            peer,
            interval,
            latency,
            supervision_timeout,
            mtu: DEFAULT_MTU,
            ..ConnSlot::default()
        };
        if role == LinkRole::Peripheral {
            inner.peripheral_connected = true;
        }
        Ok(())
    }

    /// Tear a link down to `Disconnected`, clearing all three FIFOs and
    /// handing every parked waiter back for resolution outside the lock.
    pub fn clear_on_disconnect(&self, conn: ConnHandle) -> AdapterResult<DisconnectCleanup> {
        let mut inner = self.inner.lock();
        let slot = inner
            .slots
            .get_mut(conn as usize)
            .ok_or(AdapterError::InvalidArgument("connection handle out of range"))?;
        let mut old = std::mem::take(slot);
        let cleanup = DisconnectCleanup {
            role: old.role,
            peer: old.peer,
            related_adv: old.related_adv,
            app_connected: old.app_connected,
            disconnect_waiters: old.disconnect_waiters.drain(..).collect(),
            aborted_requests: old
                .pending_reads
                .drain(..)
                .chain(old.pending_writes.drain(..))
                .chain(old.pending_discoveries.drain(..))
                .map(|p| p.reply)
                .collect(),
            notify_waiter: old.notify_waiter.take(),
        };
        if cleanup.role == LinkRole::Peripheral {
            inner.peripheral_connected = inner
                .slots
                .iter()
                .any(|s| s.state == ConnState::Connected && s.role == LinkRole::Peripheral);
        }
        Ok(cleanup)
    }

    pub fn peripheral_connected(&self) -> bool {
        self.inner.lock().peripheral_connected
    }

    /// Handles of connected peripheral-role links.
    pub fn connected_peripherals(&self) -> Vec<ConnHandle> {
        let inner = self.inner.lock();
        inner
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.state == ConnState::Connected && s.role == LinkRole::Peripheral)
            .map(|(i, _)| i as ConnHandle)
            .collect()
    }

    /// Snapshot of every connected link.
    pub fn connected_snapshot(&self) -> Vec<crate::types::ConnectedDevice> {
        let inner = self.inner.lock();
        inner
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.state == ConnState::Connected)
            .map(|(i, s)| crate::types::ConnectedDevice {
                conn: i as ConnHandle,
                peer: s.peer,
                interval: s.interval,
                latency: s.latency,
                mtu: s.mtu,
                bonded: s.auth == AuthState::Complete,
                secured: s.secured,
            })
            .collect()
    }

    pub fn find_by_peer(&self, addr: &BdAddr) -> Option<ConnHandle> {
        let inner = self.inner.lock();
        inner
            .slots
            .iter()
            .position(|s| s.state == ConnState::Connected && s.peer.addr == *addr)
            .map(|i| i as ConnHandle)
    }

    /// True when every slot is back to `Disconnected`.
    pub fn all_free(&self) -> bool {
        let inner = self.inner.lock();
        inner.slots.iter().all(|s| s.state == ConnState::Disconnected)
    }

    // --- pending-request FIFOs ---

    pub fn push_pending(
        &self,
        conn: ConnHandle,
        kind: RequestKind,
        request: PendingRequest,
    ) -> AdapterResult<()> {
        self.with_slot(conn, |slot| slot.fifo_mut(kind).push_back(request))
    }

    /// Pop the oldest outstanding request of `kind`. The untagged firmware
    /// completion being attributed belongs to exactly this entry.
    pub fn pop_pending(&self, conn: ConnHandle, kind: RequestKind) -> Option<PendingRequest> {
        let mut inner = self.inner.lock();
        inner
            .slots
            .get_mut(conn as usize)
            .and_then(|slot| slot.fifo_mut(kind).pop_front())
    }

    // --- indication back-pressure ---

    /// Claim one in-flight indication; `ResourceExhausted` at the cap,
    /// without contacting the firmware.
    pub fn begin_indication(&self, conn: ConnHandle) -> AdapterResult<()> {
        self.with_slot(conn, |slot| {
            if slot.state != ConnState::Connected {
                return Err(AdapterError::InvalidState("link not connected"));
            }
            if slot.pending_indications >= MAX_PENDING_INDICATIONS {
                return Err(AdapterError::ResourceExhausted);
            }
            slot.pending_indications += 1;
            Ok(())
        })?
    }

    /// Release one in-flight indication; returns how many remain.
    pub fn end_indication(&self, conn: ConnHandle) -> u32 {
        self.with_slot(conn, |slot| {
            slot.pending_indications = slot.pending_indications.saturating_sub(1);
            slot.pending_indications
        })
        .unwrap_or(0)
    }

    pub fn pending_indications(&self, conn: ConnHandle) -> AdapterResult<u32> {
        self.with_slot(conn, |slot| slot.pending_indications)
    }

    // --- waiters ---

    pub fn register_notify_waiter(&self, conn: ConnHandle) -> AdapterResult<oneshot::Receiver<u16>> {
        self.with_slot(conn, |slot| {
            let (tx, rx) = oneshot::channel();
            slot.notify_waiter = Some(tx);
            rx
        })
    }

    pub fn take_notify_waiter(&self, conn: ConnHandle) -> Option<oneshot::Sender<u16>> {
        self.with_slot(conn, |slot| slot.notify_waiter.take())
            .ok()
            .flatten()
    }

    pub fn add_disconnect_waiter(&self, conn: ConnHandle, waiter: ReplySender) -> AdapterResult<()> {
        self.with_slot(conn, |slot| slot.disconnect_waiters.push(waiter))
    }

    // --- initiator ---

    /// Stage a connection attempt. Only one may be outstanding, staged or
    /// running.
    pub fn begin_initiation(&self, target: ConnectTarget) -> AdapterResult<()> {
        let mut init = self.init.lock();
        if init.state != InitState::Idle || init.target.is_some() {
            return Err(AdapterError::InvalidState("initiator busy"));
        }
        init.target = Some(target);
        Ok(())
    }

    pub fn abort_initiation(&self) {
        let mut init = self.init.lock();
        *init = InitiatorState::default();
    }

    pub fn with_initiator<R>(&self, f: impl FnOnce(&mut InitiatorState) -> R) -> R {
        f(&mut self.init.lock())
    }

    pub fn take_initiator_waiter(&self) -> Option<ReplySender> {
        self.init.lock().waiter.take()
    }
}

/// Fail a batch of orphaned reply channels without blocking.
pub(crate) fn fail_waiters(waiters: Vec<ReplySender>, error: AdapterError) {
    for waiter in waiters {
        let _ = waiter.send(Err(error.clone()));
    }
}

/// Resolve a batch of reply channels successfully.
pub(crate) fn release_waiters(waiters: Vec<ReplySender>) {
    for waiter in waiters {
        let _ = waiter.send(Ok(CommandValue::None));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    fn request(attr: AttrHandle) -> (PendingRequest, crate::command::ReplyReceiver) {
        let (tx, rx) = oneshot::channel();
        (PendingRequest { attr, reply: tx }, rx)
    }

    fn peer(last: u8) -> PeerAddress {
        PeerAddress {
            addr: BdAddr([last, 0, 0, 0, 0, 0]),
            addr_type: AddrType::Public,
        }
    }

    #[test]
    fn fifo_preserves_arrival_order() {
        let table = ConnTable::new();
        table
            .set_connected(0, LinkRole::Central, peer(1), 40, 0, 500)
            .unwrap();
        let (a, _ra) = request(0x10);
        let (b, _rb) = request(0x20);
        let (c, _rc) = request(0x30);
        table.push_pending(0, RequestKind::Read, a).unwrap();
        table.push_pending(0, RequestKind::Read, b).unwrap();
        table.push_pending(0, RequestKind::Read, c).unwrap();

        assert_eq!(table.pop_pending(0, RequestKind::Read).unwrap().attr, 0x10);
        assert_eq!(table.pop_pending(0, RequestKind::Read).unwrap().attr, 0x20);
        assert_eq!(table.pop_pending(0, RequestKind::Read).unwrap().attr, 0x30);
        assert!(table.pop_pending(0, RequestKind::Read).is_none());
    }

    #[test]
    fn fifos_are_separate_per_kind() {
        let table = ConnTable::new();
        table
            .set_connected(0, LinkRole::Central, peer(1), 40, 0, 500)
            .unwrap();
        let (r, _rr) = request(0x10);
        let (w, _rw) = request(0x20);
        table.push_pending(0, RequestKind::Read, r).unwrap();
        table.push_pending(0, RequestKind::Write, w).unwrap();
        assert_eq!(table.pop_pending(0, RequestKind::Write).unwrap().attr, 0x20);
        assert_eq!(table.pop_pending(0, RequestKind::Read).unwrap().attr, 0x10);
    }

    #[test]
    fn indication_cap_is_enforced() {
        let table = ConnTable::new();
        table
            .set_connected(2, LinkRole::Peripheral, peer(2), 40, 0, 500)
            .unwrap();
        for _ in 0..MAX_PENDING_INDICATIONS {
            table.begin_indication(2).unwrap();
        }
        assert_eq!(
            table.begin_indication(2).unwrap_err(),
            AdapterError::ResourceExhausted
        );
        assert_eq!(table.end_indication(2), MAX_PENDING_INDICATIONS - 1);
        table.begin_indication(2).unwrap();
    }

    #[test]
    fn disconnect_clears_everything() {
        let table = ConnTable::new();
        table
            .set_connected(1, LinkRole::Peripheral, peer(3), 40, 0, 500)
            .unwrap();
        let (a, _ra) = request(0x10);
        table.push_pending(1, RequestKind::Write, a).unwrap();
        table.with_slot(1, |s| s.pending_indications = 3).unwrap();
        assert!(table.peripheral_connected());

        let cleanup = table.clear_on_disconnect(1).unwrap();
        assert_eq!(cleanup.role, LinkRole::Peripheral);
        assert_eq!(cleanup.aborted_requests.len(), 1);
        assert!(!table.peripheral_connected());
        assert_eq!(table.state(1).unwrap(), ConnState::Disconnected);
        assert_eq!(table.pending_indications(1).unwrap(), 0);
    }

    #[test]
    fn single_initiation_only() {
        let table = ConnTable::new();
        let target = ConnectTarget {
            peer: peer(9),
            secured: false,
            conn_params: None,
        };
        table.begin_initiation(target.clone()).unwrap();
        table.with_initiator(|init| init.state = InitState::Initiating);
        assert_eq!(
            table.begin_initiation(target).unwrap_err(),
            AdapterError::InvalidState("initiator busy")
        );
        table.abort_initiation();
        assert_eq!(table.with_initiator(|init| init.state), InitState::Idle);
    }

    #[test]
    fn out_of_range_handle_is_invalid_argument() {
        let table = ConnTable::new();
        assert_eq!(
            table.state(CONN_SLOT_COUNT as u8).unwrap_err(),
            AdapterError::InvalidArgument("connection handle out of range")
        );
    }
}
