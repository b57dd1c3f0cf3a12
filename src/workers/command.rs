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

//! The command worker: single consumer of the command queue.
//!
//! Every logical operation is a short ordered chain of primitive firmware
//! calls. The worker issues one primitive, waits (bounded) for its
//! completion on the dedicated completion channel, then proceeds. A
//! failure at any step short-circuits the chain, restores the slot to its
//! last well-defined state and resolves the caller's reply with the
//! error.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::adapter::Core;
use crate::command::{Command, CommandOp, CommandValue, ReplySender, WhitelistCmd};
use crate::error::{AdapterError, AdapterResult};
use crate::firmware::{CommandComplete, FirmwareOp};
use crate::slots::adv::AdvRecord;
use crate::slots::conn::{InitState, PendingRequest, RequestKind};
use crate::types::{
    AdvKind, AdvState, AttrHandle, ConnHandle, ConnState, LinkRole, OwnAddrType, ScanState,
    ScanStateChange, ScanStopCause, ServerConnectionKind,
};
use crate::workers::event::Event;

fn respond(reply: Option<ReplySender>, outcome: AdapterResult<CommandValue>) {
    match reply {
        Some(reply) => {
            let _ = reply.send(outcome);
        }
        None => {
            if let Err(e) = outcome {
                warn!("unobserved command failure: {}", e);
            }
        }
    }
}

/// The command worker loop.
pub(crate) struct CommandWorker {
    core: Arc<Core>,
    rx: mpsc::Receiver<Command>,
    completions: mpsc::UnboundedReceiver<CommandComplete>,
}

impl CommandWorker {
    pub fn new(
        core: Arc<Core>,
        rx: mpsc::Receiver<Command>,
        completions: mpsc::UnboundedReceiver<CommandComplete>,
    ) -> Self {
        Self {
            core,
            rx,
            completions,
        }
    }

    pub async fn run(mut self) {
        debug!("command worker running");
        while let Some(command) = self.rx.recv().await {
            debug!("command {}", command.op.name());
            let Command { op, reply } = command;
            match op {
                CommandOp::Shutdown => {
                    respond(reply, Ok(CommandValue::None));
                    break;
                }
                CommandOp::CreateAdv { kind, record } => {
                    let outcome = self.create_adv(kind, record).await;
                    respond(reply, outcome);
                }
                CommandOp::StartAdv { handle } => {
                    let outcome = self.start_adv(handle).await;
                    respond(reply, outcome);
                }
                CommandOp::StopAdv { handle } => {
                    let outcome = self.stop_adv(handle).await;
                    respond(reply, outcome);
                }
                CommandOp::DeleteAdv {
                    handle,
                    notify_connected,
                } => {
                    let outcome = self.delete_adv(handle, notify_connected).await;
                    respond(reply, outcome);
                }
                CommandOp::StartScan => {
                    let outcome = self.start_scan().await;
                    respond(reply, outcome);
                }
                CommandOp::StopScan => {
                    let outcome = self.stop_scan().await;
                    respond(reply, outcome);
                }
                CommandOp::DeleteScan => {
                    let outcome = self.delete_scan().await;
                    respond(reply, outcome);
                }
                CommandOp::Connect => self.connect(reply).await,
                CommandOp::Disconnect { conn } => self.disconnect(conn, reply),
                CommandOp::RegisterService { service_index } => {
                    let outcome = self.register_service(service_index).await;
                    respond(reply, outcome);
                }
                CommandOp::Whitelist(cmd) => {
                    let outcome = self.whitelist(cmd).await;
                    respond(reply, outcome);
                }
                CommandOp::Bond { conn } => {
                    let outcome = self.bond(conn);
                    respond(reply, outcome);
                }
                CommandOp::GattRead { conn, attr } => self.gatt_read(conn, attr, reply),
                CommandOp::GattWrite {
                    conn,
                    attr,
                    value,
                    with_response,
                } => self.gatt_write(conn, attr, value, with_response, reply),
            }
        }
        info!("command worker stopped");
    }

    /// Wait (bounded) for the completion of the primitive `expect` on
    /// `target`. Stale completions from timed-out earlier steps are
    /// drained and logged.
    async fn await_step(&mut self, expect: FirmwareOp, target: u8) -> AdapterResult<()> {
        let step_timeout = self.core.config.step_timeout();
        loop {
            match timeout(step_timeout, self.completions.recv()).await {
                Err(_) => {
                    warn!("step {:?} on {} timed out", expect, target);
                    return Err(AdapterError::Timeout);
                }
                Ok(None) => return Err(AdapterError::NotRunning),
                Ok(Some(complete)) => {
                    if complete.op != expect || complete.target != target {
                        warn!(
                            "stale completion {:?} on {} while waiting for {:?} on {}",
                            complete.op, complete.target, expect, target
                        );
                        continue;
                    }
                    return AdapterError::from_status(complete.status);
                }
            }
        }
    }

    // --- advertising chains ---

    async fn create_adv(&mut self, kind: AdvKind, record: AdvRecord) -> AdapterResult<CommandValue> {
        let handle = self.core.ids.alloc().ok_or(AdapterError::ResourceExhausted)?;
        if let Err(e) = self.core.adv.occupy(handle, kind, record.clone()) {
            self.core.ids.free(handle);
            return Err(e);
        }

        let accepted = self
            .core
            .firmware
            .create_advertising(handle, &record.params)
            .map_err(AdapterError::Firmware);
        let outcome = match accepted {
            Ok(()) => self.await_step(FirmwareOp::CreateAdv, handle).await,
            Err(e) => Err(e),
        };
        if let Err(e) = outcome {
            self.core.adv.release(handle);
            self.core.ids.free(handle);
            return Err(e);
        }

        self.core.adv.set_state(handle, AdvState::Created)?;
        if kind == AdvKind::Static {
            self.core.adv.set_static_handle(Some(handle));
        }
        info!("advertising set {} created ({:?})", handle, kind);
        Ok(CommandValue::Handle(handle))
    }

    async fn start_adv(&mut self, handle: u8) -> AdapterResult<CommandValue> {
        match self.core.adv.state_of(handle) {
            None => return Err(AdapterError::InvalidArgument("unknown advertising handle")),
            Some(AdvState::Created) => {}
            Some(AdvState::Advertising) => {
                return Err(AdapterError::InvalidState("already advertising"))
            }
            Some(_) => return Err(AdapterError::InvalidState("advertisement not created")),
        }
        let record = self
            .core
            .adv
            .record_of(handle)
            .ok_or(AdapterError::Inconsistent("advertising record missing"))?;

        // Parameters, address and payloads are (re)loaded ahead of every
        // start so a stopped set restarts with its latest configuration.
        self.core
            .firmware
            .modify_advertising(handle, &record.params)
            .map_err(AdapterError::Firmware)?;
        self.await_step(FirmwareOp::ModifyAdv, handle).await?;

        if record.params.own_addr_type == OwnAddrType::Random {
            self.core
                .firmware
                .set_adv_random_addr(handle, &record.own_addr)
                .map_err(AdapterError::Firmware)?;
            self.await_step(FirmwareOp::SetAdvRandomAddr, handle).await?;
        }

        self.core
            .firmware
            .set_adv_data(handle, &record.adv_data)
            .map_err(AdapterError::Firmware)?;
        self.await_step(FirmwareOp::SetAdvData, handle).await?;

        if !record.resp_data.is_empty() && record.params.scannable {
            self.core
                .firmware
                .set_scan_response(handle, &record.resp_data)
                .map_err(AdapterError::Firmware)?;
            self.await_step(FirmwareOp::SetScanResponse, handle).await?;
        }

        self.core
            .firmware
            .start_advertising(handle, 0, record.max_events)
            .map_err(AdapterError::Firmware)?;
        self.await_step(FirmwareOp::StartAdv, handle).await?;

        self.core.adv.set_state(handle, AdvState::Advertising)?;
        info!("advertising set {} started", handle);
        Ok(CommandValue::None)
    }

    async fn stop_adv(&mut self, handle: u8) -> AdapterResult<CommandValue> {
        match self.core.adv.state_of(handle) {
            None => Err(AdapterError::InvalidArgument("unknown advertising handle")),
            Some(AdvState::Created) => {
                debug!("advertising set {} already stopped", handle);
                Ok(CommandValue::None)
            }
            Some(AdvState::Advertising) => {
                self.core
                    .firmware
                    .stop_advertising(handle)
                    .map_err(AdapterError::Firmware)?;
                self.await_step(FirmwareOp::StopAdv, handle).await?;
                self.core.adv.set_state(handle, AdvState::Created)?;
                info!("advertising set {} stopped", handle);
                Ok(CommandValue::None)
            }
            Some(_) => Err(AdapterError::InvalidState("advertisement not active")),
        }
    }

    async fn delete_adv(
        &mut self,
        handle: u8,
        notify_connected: Option<ConnHandle>,
    ) -> AdapterResult<CommandValue> {
        match self.core.adv.state_of(handle) {
            None => return Err(AdapterError::InvalidArgument("unknown advertising handle")),
            Some(AdvState::Created) | Some(AdvState::Deleting) => {}
            Some(_) => return Err(AdapterError::InvalidState("advertisement still active")),
        }
        self.core.adv.set_state(handle, AdvState::Deleting)?;

        let accepted = self
            .core
            .firmware
            .delete_advertising(handle)
            .map_err(AdapterError::Firmware);
        let outcome = match accepted {
            Ok(()) => self.await_step(FirmwareOp::DeleteAdv, handle).await,
            Err(e) => Err(e),
        };
        if let Err(e) = outcome {
            self.core.adv.set_state(handle, AdvState::Created)?;
            return Err(e);
        }

        self.core.adv.release(handle);
        self.core.ids.free(handle);
        info!("advertising set {} deleted", handle);

        if let Some(conn) = notify_connected {
            // Deleted because a peer connected to it; tell the server side
            // now that the slot is reclaimed.
            self.core.evt_tx.push(Event::ServerConnected {
                conn,
                kind: ServerConnectionKind::LinkConnected,
            });
        }
        Ok(CommandValue::None)
    }

    // --- scan chains ---

    async fn start_scan(&mut self) -> AdapterResult<CommandValue> {
        if self.core.scan.state() != ScanState::Idle {
            return Err(AdapterError::InvalidState("scan already running"));
        }
        let handle = self.core.ids.alloc().ok_or(AdapterError::ResourceExhausted)?;
        self.core.scan.set_handle(Some(handle));
        self.core.scan.set_state(ScanState::Starting);

        if let Err(e) = self.scan_start_chain(handle).await {
            self.core.scan.set_state(ScanState::Idle);
            self.core.scan.set_handle(None);
            self.core.ids.free(handle);
            return Err(e);
        }

        self.core.scan.set_state(ScanState::Scanning);
        self.core.evt_tx.push(Event::ScanState(ScanStateChange::Started));
        info!("scan session {} started", handle);
        Ok(CommandValue::None)
    }

    async fn scan_start_chain(&mut self, handle: u8) -> AdapterResult<()> {
        let params = self.core.scan.params();
        let (duration, period) = self.core.scan.duration_and_period();

        self.core
            .firmware
            .create_scan(handle, &params)
            .map_err(AdapterError::Firmware)?;
        self.await_step(FirmwareOp::CreateScan, handle).await?;

        self.core
            .firmware
            .start_scan(handle, duration, period)
            .map_err(AdapterError::Firmware)?;
        self.await_step(FirmwareOp::StartScan, handle).await
    }

    async fn stop_scan(&mut self) -> AdapterResult<CommandValue> {
        if self.core.scan.state() != ScanState::Scanning {
            return Err(AdapterError::InvalidState("scan not running"));
        }
        let handle = self
            .core
            .scan
            .handle()
            .ok_or(AdapterError::Inconsistent("scan handle missing"))?;
        self.core.scan.set_stop_cause(ScanStopCause::User);
        self.core.scan.set_state(ScanState::Stopping);

        if let Err(status) = self.core.firmware.stop_scan(handle) {
            self.core.scan.set_state(ScanState::Scanning);
            return Err(AdapterError::Firmware(status));
        }
        if let Err(e) = self.await_step(FirmwareOp::StopScan, handle).await {
            self.core.scan.set_state(ScanState::Scanning);
            return Err(e);
        }

        self.finish_scan_session(handle).await?;
        Ok(CommandValue::None)
    }

    /// Delete the scan activity after a stop (user-requested or
    /// firmware-initiated) and return the session to idle.
    async fn delete_scan(&mut self) -> AdapterResult<CommandValue> {
        let Some(handle) = self.core.scan.handle() else {
            debug!("scan already torn down");
            return Ok(CommandValue::None);
        };
        self.finish_scan_session(handle).await?;
        Ok(CommandValue::None)
    }

    async fn finish_scan_session(&mut self, handle: u8) -> AdapterResult<()> {
        self.core
            .firmware
            .delete_scan(handle)
            .map_err(AdapterError::Firmware)?;
        self.await_step(FirmwareOp::DeleteScan, handle).await?;

        self.core.scan.set_state(ScanState::Idle);
        self.core.scan.set_handle(None);
        self.core.scan.clear_reports();
        self.core.ids.free(handle);
        self.core.evt_tx.push(Event::ScanState(ScanStateChange::Stopped));
        info!(
            "scan session {} deleted ({:?} stop)",
            handle,
            self.core.scan.stop_cause()
        );
        Ok(())
    }

    // --- connection chains ---

    async fn connect(&mut self, reply: Option<ReplySender>) {
        let staged = self.core.conns.with_initiator(|init| {
            if init.state != InitState::Idle {
                return Err(AdapterError::InvalidState("initiator busy"));
            }
            init.target
                .clone()
                .ok_or(AdapterError::Inconsistent("no connect target staged"))
        });
        let target = match staged {
            Ok(target) => target,
            Err(e) => {
                // Only a missing target means our own staging is stale; a
                // busy initiator belongs to another caller and stays.
                if matches!(e, AdapterError::Inconsistent(_)) {
                    self.core.conns.abort_initiation();
                }
                respond(reply, Err(e));
                return;
            }
        };

        let Some(handle) = self.core.ids.alloc() else {
            self.core.conns.abort_initiation();
            respond(reply, Err(AdapterError::ResourceExhausted));
            return;
        };

        let params = target
            .conn_params
            .clone()
            .unwrap_or_else(|| self.core.config.conn_params.clone());

        let outcome = self.connect_chain(handle, &params, &target.peer).await;
        if let Err(e) = outcome {
            self.core.ids.free(handle);
            self.core.conns.abort_initiation();
            respond(reply, Err(e));
            return;
        }

        self.core.conns.with_initiator(|init| {
            init.state = InitState::Initiating;
            init.handle = Some(handle);
            init.waiter = reply;
        });
        info!("initiating connection to {}", target.peer);
    }

    async fn connect_chain(
        &mut self,
        handle: u8,
        params: &crate::types::ConnParams,
        peer: &crate::types::PeerAddress,
    ) -> AdapterResult<()> {
        self.core
            .firmware
            .create_initiator(handle, params)
            .map_err(AdapterError::Firmware)?;
        self.await_step(FirmwareOp::CreateInitiator, handle).await?;

        self.core
            .firmware
            .set_initiator_target(handle, peer)
            .map_err(AdapterError::Firmware)?;
        self.core
            .firmware
            .set_initiator_timeout(handle, self.core.config.connect_scan_timeout_ms)
            .map_err(AdapterError::Firmware)?;

        self.core
            .firmware
            .start_initiator(handle)
            .map_err(AdapterError::Firmware)?;
        self.await_step(FirmwareOp::StartInitiator, handle).await
    }

    fn disconnect(&mut self, conn: ConnHandle, reply: Option<ReplySender>) {
        let state = match self.core.conns.state(conn) {
            Ok(state) => state,
            Err(e) => {
                respond(reply, Err(e));
                return;
            }
        };
        match state {
            // The link is already down: a no-op success.
            ConnState::Disconnected => respond(reply, Ok(CommandValue::None)),
            ConnState::Connecting => {
                respond(reply, Err(AdapterError::InvalidState("link still connecting")))
            }
            ConnState::Disconnecting => {
                // Join the teardown already in flight.
                if let Some(reply) = reply {
                    let _ = self.core.conns.add_disconnect_waiter(conn, reply);
                }
            }
            ConnState::Connected => {
                if let Err(status) = self.core.firmware.disconnect(conn) {
                    respond(reply, Err(AdapterError::Firmware(status)));
                    return;
                }
                let _ = self
                    .core
                    .conns
                    .with_slot(conn, |slot| slot.state = ConnState::Disconnecting);
                if let Some(reply) = reply {
                    let _ = self.core.conns.add_disconnect_waiter(conn, reply);
                }
                info!("disconnecting conn {}", conn);
            }
        }
    }

    // --- server / security / whitelist ---

    async fn register_service(&mut self, service_index: usize) -> AdapterResult<CommandValue> {
        let definitions = self.core.registry.service_definitions();
        let definition = definitions
            .get(service_index)
            .ok_or(AdapterError::Inconsistent("service index out of range"))?;

        self.core
            .firmware
            .register_service(definition)
            .map_err(AdapterError::Firmware)?;
        self.await_step(FirmwareOp::RegisterService, 0).await?;
        info!(
            "service {} ({}) registered",
            definition.service_index, definition.uuid
        );
        Ok(CommandValue::None)
    }

    async fn whitelist(&mut self, cmd: WhitelistCmd) -> AdapterResult<CommandValue> {
        let accepted = match &cmd {
            WhitelistCmd::Add(peer) => self.core.firmware.whitelist_add(peer),
            WhitelistCmd::Remove(peer) => self.core.firmware.whitelist_remove(peer),
            WhitelistCmd::Clear => self.core.firmware.whitelist_clear(),
        };
        accepted.map_err(AdapterError::Firmware)?;
        self.await_step(FirmwareOp::WhitelistOp, 0).await?;

        match cmd {
            WhitelistCmd::Add(peer) => self.core.bonds.whitelist_add(peer)?,
            WhitelistCmd::Remove(peer) => self.core.bonds.whitelist_remove(&peer)?,
            WhitelistCmd::Clear => self.core.bonds.whitelist_clear()?,
        }
        Ok(CommandValue::None)
    }

    fn bond(&mut self, conn: ConnHandle) -> AdapterResult<CommandValue> {
        if self.core.conns.state(conn)? != ConnState::Connected {
            return Err(AdapterError::InvalidState("link not connected"));
        }
        self.core
            .firmware
            .create_bond(conn, &self.core.config.security)
            .map_err(AdapterError::Firmware)?;
        let _ = self
            .core
            .conns
            .with_slot(conn, |slot| slot.auth = crate::types::AuthState::Started);
        info!("bonding started on conn {}", conn);
        Ok(CommandValue::None)
    }

    // --- client attribute operations ---

    fn client_link_check(&self, conn: ConnHandle) -> AdapterResult<()> {
        if self.core.conns.state(conn)? != ConnState::Connected {
            return Err(AdapterError::InvalidState("link not connected"));
        }
        let role = self.core.conns.with_slot(conn, |slot| slot.role)?;
        if role != LinkRole::Central {
            return Err(AdapterError::InvalidState("not a client link"));
        }
        Ok(())
    }

    fn gatt_read(&mut self, conn: ConnHandle, attr: AttrHandle, reply: Option<ReplySender>) {
        let Some(reply) = reply else {
            error!("client read without a reply channel");
            return;
        };
        if let Err(e) = self.client_link_check(conn) {
            let _ = reply.send(Err(e));
            return;
        }
        if let Err(status) = self.core.firmware.read_attribute(conn, attr) {
            let _ = reply.send(Err(AdapterError::Firmware(status)));
            return;
        }
        // The completion carries no tag; the FIFO entry attributes it.
        let _ = self
            .core
            .conns
            .push_pending(conn, RequestKind::Read, PendingRequest { attr, reply });
    }

    fn gatt_write(
        &mut self,
        conn: ConnHandle,
        attr: AttrHandle,
        value: Vec<u8>,
        with_response: bool,
        reply: Option<ReplySender>,
    ) {
        let Some(reply) = reply else {
            error!("client write without a reply channel");
            return;
        };
        if let Err(e) = self.client_link_check(conn) {
            let _ = reply.send(Err(e));
            return;
        }
        if let Err(status) = self
            .core
            .firmware
            .write_attribute(conn, attr, &value, with_response)
        {
            let _ = reply.send(Err(AdapterError::Firmware(status)));
            return;
        }
        if with_response {
            let _ = self
                .core
                .conns
                .push_pending(conn, RequestKind::Write, PendingRequest { attr, reply });
        } else {
            // Write commands have no completion event.
            let _ = reply.send(Ok(CommandValue::None));
        }
    }
}
