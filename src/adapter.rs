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

//! The adapter surface: lifecycle and shared state.
//!
//! `init` wires the firmware sink, spawns the two workers, loads the
//! persisted bonds, registers the server profiles and replays the
//! whitelist. `deinit` disconnects live peripheral links, stops the
//! command worker first (so no new firmware work is issued), then the
//! event worker, and resets every table. Between `deinit` and the next
//! `init` every operation fails with `NotRunning`.

use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::command::{CommandOp, CommandSender, CommandValue, WhitelistCmd};
use crate::config::AdapterConfig;
use crate::error::{AdapterError, AdapterResult};
use crate::firmware::{FirmwareController, FirmwareEventSink};
use crate::server::registry::ServerRegistry;
use crate::slots::adv::AdvTable;
use crate::slots::conn::{fail_waiters, ConnTable};
use crate::slots::scan::ScanSession;
use crate::slots::IndexAllocator;
use crate::storage::{BlobStore, BondStorage};
use crate::types::{ClientCallbacks, ServerConfig};
use crate::workers::command::CommandWorker;
use crate::workers::event::{Event, EventSender, EventWorker};

/// Controller activity identifiers shared by advertising sets, the scan
/// session and the initiator.
const ACTIVITY_ID_CAPACITY: u8 = 16;

/// Everything the workers and API entry points share.
pub(crate) struct Core {
    pub config: AdapterConfig,
    pub firmware: Arc<dyn FirmwareController>,
    pub adv: AdvTable,
    pub conns: ConnTable,
    pub scan: ScanSession,
    pub registry: ServerRegistry,
    pub bonds: Arc<BondStorage>,
    pub client: ClientCallbacks,
    pub server: ServerConfig,
    pub cmd_tx: CommandSender,
    pub evt_tx: EventSender,
    pub ids: IndexAllocator,
}

/// Collaborators and configuration handed to [`BleAdapter::init`].
pub struct AdapterSetup {
    pub config: AdapterConfig,
    pub client: ClientCallbacks,
    pub server: ServerConfig,
    pub firmware: Arc<dyn FirmwareController>,
    pub store: Arc<dyn BlobStore>,
}

struct Running {
    core: Arc<Core>,
    cmd_task: JoinHandle<()>,
    evt_task: JoinHandle<()>,
}

/// The host-side BLE adapter.
///
/// One instance per controller. All operations are safe to call from any
/// number of tasks concurrently; callers block only on their own bounded
/// reply while the workers run the firmware sequences.
pub struct BleAdapter {
    state: RwLock<Option<Running>>,
}

impl Default for BleAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl BleAdapter {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(None),
        }
    }

    pub(crate) fn core(&self) -> AdapterResult<Arc<Core>> {
        self.state
            .read()
            .as_ref()
            .map(|running| running.core.clone())
            .ok_or(AdapterError::NotRunning)
    }

    pub fn is_running(&self) -> bool {
        self.state.read().is_some()
    }

    /// Submit a command and wait (bounded) for its single outcome.
    pub(crate) async fn call(&self, op: CommandOp) -> AdapterResult<CommandValue> {
        let core = self.core()?;
        let reply = core.cmd_tx.submit(op)?;
        match tokio::time::timeout(core.config.api_timeout(), reply).await {
            Err(_) => Err(AdapterError::Timeout),
            Ok(Err(_)) => Err(AdapterError::NotRunning),
            Ok(Ok(outcome)) => outcome,
        }
    }

    /// Bring the adapter up against the given firmware and store.
    pub async fn init(&self, setup: AdapterSetup) -> AdapterResult<()> {
        if self.state.read().is_some() {
            return Err(AdapterError::InvalidState("already initialized"));
        }
        info!("adapter starting");

        let registry = ServerRegistry::build(&setup.server.profiles)?;
        let bonds = Arc::new(BondStorage::load(setup.store)?);

        let (cmd_tx, cmd_rx) = mpsc::channel(setup.config.command_queue_depth);
        let (evt_tx, evt_rx) = mpsc::channel(setup.config.event_queue_depth);
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();

        let core = Arc::new(Core {
            config: setup.config,
            firmware: setup.firmware.clone(),
            adv: AdvTable::new(),
            conns: ConnTable::new(),
            scan: ScanSession::new(),
            registry,
            bonds: bonds.clone(),
            client: setup.client,
            server: setup.server,
            cmd_tx: CommandSender::new(cmd_tx),
            evt_tx: EventSender::new(evt_tx),
            ids: IndexAllocator::new(ACTIVITY_ID_CAPACITY),
        });

        let sink = FirmwareEventSink::new(completion_tx, core.evt_tx.raw(), bonds);
        setup.firmware.attach(sink);

        let cmd_task = tokio::spawn(CommandWorker::new(core.clone(), cmd_rx, completion_rx).run());
        let evt_task = tokio::spawn(EventWorker::new(core.clone(), evt_rx).run());

        {
            let mut state = self.state.write();
            if state.is_some() {
                cmd_task.abort();
                evt_task.abort();
                return Err(AdapterError::InvalidState("already initialized"));
            }
            *state = Some(Running {
                core: core.clone(),
                cmd_task,
                evt_task,
            });
        }

        if let Err(e) = self.bring_up(&core).await {
            error!("bring-up failed: {}", e);
            let _ = self.deinit().await;
            return Err(e);
        }
        info!("adapter ready");
        Ok(())
    }

    async fn bring_up(&self, core: &Arc<Core>) -> AdapterResult<()> {
        core.firmware
            .set_max_mtu(core.config.max_mtu)
            .map_err(AdapterError::Firmware)?;

        for service_index in 0..core.registry.service_count() {
            self.call(CommandOp::RegisterService { service_index }).await?;
        }

        // Replay the persisted whitelist into the controller.
        for peer in core.bonds.whitelist_entries() {
            self.call(CommandOp::Whitelist(WhitelistCmd::Add(peer))).await?;
        }
        Ok(())
    }

    /// Tear the adapter down. After this returns both workers have
    /// terminated and every slot is free.
    pub async fn deinit(&self) -> AdapterResult<()> {
        let Some(running) = self.state.write().take() else {
            return Err(AdapterError::InvalidState("not initialized"));
        };
        info!("adapter stopping");
        let core = running.core;

        // Close live peripheral links while the command worker still runs.
        for conn in core.conns.connected_peripherals() {
            let supervision = core
                .conns
                .with_slot(conn, |slot| slot.supervision_timeout)
                .unwrap_or(0);
            match core.cmd_tx.submit(CommandOp::Disconnect { conn }) {
                Ok(reply) => {
                    let wait = core.config.disconnect_timeout(supervision);
                    match tokio::time::timeout(wait, reply).await {
                        Ok(Ok(Ok(_))) => {}
                        Ok(Ok(Err(e))) => warn!("disconnect of {} failed: {}", conn, e),
                        Ok(Err(_)) | Err(_) => warn!("disconnect of {} did not finish", conn),
                    }
                }
                Err(e) => warn!("disconnect of {} not submitted: {}", conn, e),
            }
        }

        // Stop the command worker first so no new firmware operations are
        // issued, then let it drain and exit.
        let mut clean = false;
        if let Ok(reply) = core.cmd_tx.submit(CommandOp::Shutdown) {
            clean = tokio::time::timeout(core.config.api_timeout(), reply)
                .await
                .is_ok();
        }
        if clean {
            let _ = running.cmd_task.await;
        } else {
            warn!("command worker did not stop cleanly");
            running.cmd_task.abort();
        }

        // Then the event worker.
        let (done_tx, done_rx) = oneshot::channel();
        let mut clean = false;
        if core
            .evt_tx
            .raw()
            .send(Event::Shutdown(done_tx))
            .await
            .is_ok()
        {
            clean = tokio::time::timeout(core.config.api_timeout(), done_rx)
                .await
                .is_ok();
        }
        if clean {
            let _ = running.evt_task.await;
        } else {
            warn!("event worker did not stop cleanly");
            running.evt_task.abort();
        }

        // Release every parked caller and reset the tables.
        let orphans = core.conns.reset();
        fail_waiters(orphans, AdapterError::NotRunning);
        core.adv.reset();
        core.scan.reset();
        core.ids.reset();
        debug_assert!(core.conns.all_free());

        info!("adapter stopped");
        Ok(())
    }
}
