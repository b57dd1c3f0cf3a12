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

//! Advertising operations: the reserved static advertisement, concurrent
//! multi advertising sets and one-shot advertisements.
//!
//! Live parameters are immutable: changing data, type or interval on a
//! running multi set stops and restarts it; the static template can only
//! be edited while the static advertisement is off air.

use tracing::{debug, error, info, warn};

use crate::adapter::{BleAdapter, Core};
use crate::command::{CommandOp, CommandValue};
use crate::error::{AdapterError, AdapterResult};
use crate::firmware::AdvStopReason;
use crate::server::gatt;
use crate::slots::adv::AdvRecord;
use crate::types::{
    AdvEventProp, AdvHandle, AdvKind, AdvState, AdvType, ConnHandle, OneShotId, OwnAddrType,
    PeerAddress, ServerConnectionKind, MAX_ADV_DATA_LEN,
};

/// Coarse tx power scale used by the host surface: 0.5 dBm steps starting
/// at -9 dBm, capped at level 0x31.
const ADV_TX_POWER_MAX_LEVEL: u8 = 0x31;
const ADV_TX_POWER_STEP_DBM: f32 = 0.5;
const ADV_TX_POWER_MIN_DBM: f32 = -9.0;

fn check_payload(data: &[u8]) -> AdapterResult<()> {
    if data.len() > MAX_ADV_DATA_LEN {
        return Err(AdapterError::InvalidArgument("advertising payload too long"));
    }
    Ok(())
}

/// Apply an advertisement type to a parameter record. Directed
/// advertising is rejected: the surface carries no peer address for it.
fn apply_adv_type(record: &mut AdvRecord, adv_type: AdvType) -> AdapterResult<()> {
    match adv_type {
        AdvType::ConnectableScannable => {
            record.params.connectable = true;
            record.params.scannable = true;
        }
        AdvType::Scannable => {
            record.params.connectable = false;
            record.params.scannable = true;
        }
        AdvType::NonConnectable => {
            record.params.connectable = false;
            record.params.scannable = false;
        }
        AdvType::Directed => {
            return Err(AdapterError::InvalidArgument(
                "directed advertising unsupported",
            ))
        }
    }
    Ok(())
}

fn apply_own_address(record: &mut AdvRecord, own: Option<PeerAddress>) {
    match own {
        None => record.params.own_addr_type = OwnAddrType::Public,
        Some(own) => {
            if own.addr_type.is_random() {
                record.params.own_addr_type = OwnAddrType::Random;
                record.own_addr = own.addr;
            } else {
                record.params.own_addr_type = OwnAddrType::Public;
            }
        }
    }
}

fn apply_event_prop(record: &mut AdvRecord, prop: AdvEventProp) -> AdapterResult<()> {
    let adv_type = match prop {
        AdvEventProp::ConnectableScannableUndirected => AdvType::ConnectableScannable,
        AdvEventProp::ScannableUndirected => AdvType::Scannable,
        AdvEventProp::NonConnectableUndirected => AdvType::NonConnectable,
        AdvEventProp::ConnectableLowDutyDirected | AdvEventProp::ConnectableHighDutyDirected => {
            AdvType::Directed
        }
    };
    apply_adv_type(record, adv_type)
}

impl BleAdapter {
    // --- static advertisement ---

    /// Set the advertising payload of the static advertisement.
    pub fn set_adv_data(&self, data: &[u8]) -> AdapterResult<()> {
        check_payload(data)?;
        let core = self.core()?;
        core.adv.update_static_template(|record| {
            record.adv_data = data.to_vec();
        })
    }

    /// Set the scan-response payload of the static advertisement.
    pub fn set_scan_response(&self, data: &[u8]) -> AdapterResult<()> {
        check_payload(data)?;
        let core = self.core()?;
        core.adv.update_static_template(|record| {
            record.resp_data = data.to_vec();
        })
    }

    /// Set the advertisement type (and own address for random types) of
    /// the static advertisement.
    pub fn set_adv_type(&self, adv_type: AdvType, own: Option<PeerAddress>) -> AdapterResult<()> {
        let core = self.core()?;
        let mut staged = core.adv.static_template();
        apply_adv_type(&mut staged, adv_type)?;
        apply_own_address(&mut staged, own);
        core.adv.update_static_template(move |record| *record = staged)
    }

    /// Set the advertising interval of the static advertisement.
    pub fn set_adv_interval(&self, interval: u16) -> AdapterResult<()> {
        let core = self.core()?;
        core.adv.update_static_template(|record| {
            record.params.interval_min = interval;
            record.params.interval_max = interval;
        })
    }

    /// Bring the static advertisement on air with the current template.
    pub async fn start_advertising(&self) -> AdapterResult<()> {
        let core = self.core()?;
        if core.adv.static_advertising() {
            return Err(AdapterError::InvalidState("static advertising active"));
        }
        // A stale created-but-stopped set is reclaimed before the fresh
        // template is applied.
        if let Some(stale) = core.adv.static_handle() {
            warn!("reclaiming stale static advertising set {}", stale);
            self.call(CommandOp::DeleteAdv {
                handle: stale,
                notify_connected: None,
            })
            .await?;
        }

        let record = core.adv.static_template();
        let handle = match self
            .call(CommandOp::CreateAdv {
                kind: AdvKind::Static,
                record,
            })
            .await?
        {
            CommandValue::Handle(handle) => handle,
            _ => return Err(AdapterError::Inconsistent("unexpected create reply")),
        };
        self.call(CommandOp::StartAdv { handle }).await?;
        Ok(())
    }

    /// Take the static advertisement off air and reclaim its slot. A
    /// no-op when it is not running.
    pub async fn stop_advertising(&self) -> AdapterResult<()> {
        let core = self.core()?;
        let Some(handle) = core.adv.static_handle() else {
            debug!("static advertising already idle");
            return Ok(());
        };
        self.call(CommandOp::StopAdv { handle }).await?;
        self.call(CommandOp::DeleteAdv {
            handle,
            notify_connected: None,
        })
        .await?;
        Ok(())
    }

    // --- multi advertising sets ---

    /// Create a multi advertising set and return its handle.
    pub async fn create_multi_adv(
        &self,
        prop: AdvEventProp,
        interval: (u16, u16),
        own: Option<PeerAddress>,
    ) -> AdapterResult<AdvHandle> {
        let core = self.core()?;
        let mut record = AdvRecord::default();
        apply_event_prop(&mut record, prop)?;
        apply_own_address(&mut record, own);
        if record.params.own_addr_type == OwnAddrType::Random && record.own_addr.is_zero() {
            return Err(AdapterError::InvalidArgument(
                "random own address required for random address type",
            ));
        }
        record.params.interval_min = interval.0;
        record.params.interval_max = interval.1;

        match self
            .call(CommandOp::CreateAdv {
                kind: AdvKind::Multi,
                record,
            })
            .await?
        {
            CommandValue::Handle(handle) => {
                info!("multi advertising set {} created", handle);
                Ok(handle)
            }
            _ => Err(AdapterError::Inconsistent("unexpected create reply")),
        }
    }

    /// Delete a multi advertising set; its slot returns to defaults.
    pub async fn delete_multi_adv(&self, handle: AdvHandle) -> AdapterResult<()> {
        self.call(CommandOp::DeleteAdv {
            handle,
            notify_connected: None,
        })
        .await?;
        Ok(())
    }

    /// Start or stop a multi advertising set.
    pub async fn enable_multi_adv(&self, handle: AdvHandle, enable: bool) -> AdapterResult<()> {
        let op = if enable {
            CommandOp::StartAdv { handle }
        } else {
            CommandOp::StopAdv { handle }
        };
        self.call(op).await?;
        Ok(())
    }

    /// Set the advertising payload of a multi set; a running set is
    /// stopped and restarted with the new payload.
    pub async fn set_multi_adv_data(&self, handle: AdvHandle, data: &[u8]) -> AdapterResult<()> {
        check_payload(data)?;
        let core = self.core()?;
        let state = core.adv.update_record(handle, |record| {
            record.adv_data = data.to_vec();
        })?;
        self.restart_if_advertising(handle, state).await
    }

    /// Set the scan-response payload of a multi set; a running set is
    /// stopped and restarted.
    pub async fn set_multi_resp_data(&self, handle: AdvHandle, data: &[u8]) -> AdapterResult<()> {
        check_payload(data)?;
        let core = self.core()?;
        let state = core.adv.update_record(handle, |record| {
            record.resp_data = data.to_vec();
        })?;
        self.restart_if_advertising(handle, state).await
    }

    /// Change the event properties (and own address) of a multi set; a
    /// running set is stopped and restarted.
    pub async fn set_multi_adv_type(
        &self,
        handle: AdvHandle,
        prop: AdvEventProp,
        own: Option<PeerAddress>,
    ) -> AdapterResult<()> {
        let core = self.core()?;
        let mut staged = core
            .adv
            .record_of(handle)
            .ok_or(AdapterError::InvalidArgument("unknown advertising handle"))?;
        apply_event_prop(&mut staged, prop)?;
        apply_own_address(&mut staged, own);
        let state = core.adv.update_record(handle, move |record| *record = staged)?;
        self.restart_if_advertising(handle, state).await
    }

    /// Change the advertising interval of a multi set; a running set is
    /// stopped and restarted.
    pub async fn set_multi_adv_interval(
        &self,
        handle: AdvHandle,
        interval: u16,
    ) -> AdapterResult<()> {
        let core = self.core()?;
        let state = core.adv.update_record(handle, |record| {
            record.params.interval_min = interval;
            record.params.interval_max = interval;
        })?;
        self.restart_if_advertising(handle, state).await
    }

    /// Set the tx power of a created or running multi set. Levels map to
    /// 0.5 dBm steps from -9 dBm.
    pub fn set_multi_adv_tx_power(&self, handle: AdvHandle, level: u8) -> AdapterResult<()> {
        let core = self.core()?;
        let level = level.min(ADV_TX_POWER_MAX_LEVEL);
        let gain = ADV_TX_POWER_MIN_DBM + level as f32 * ADV_TX_POWER_STEP_DBM;
        match core.adv.state_of(handle) {
            Some(AdvState::Created) | Some(AdvState::Advertising) => core
                .firmware
                .set_adv_tx_power(handle, gain)
                .map_err(AdapterError::Firmware),
            Some(_) => Err(AdapterError::InvalidState("advertisement not created")),
            None => Err(AdapterError::InvalidArgument("unknown advertising handle")),
        }
    }

    /// Current lifecycle state of an advertising set.
    pub fn adv_state(&self, handle: AdvHandle) -> AdapterResult<AdvState> {
        let core = self.core()?;
        core.adv
            .state_of(handle)
            .ok_or(AdapterError::InvalidArgument("unknown advertising handle"))
    }

    async fn restart_if_advertising(&self, handle: AdvHandle, state: AdvState) -> AdapterResult<()> {
        if state == AdvState::Advertising {
            debug!("advertising set {} restarting with new parameters", handle);
            self.enable_multi_adv(handle, false).await?;
            self.enable_multi_adv(handle, true).await?;
        }
        Ok(())
    }

    // --- one-shot advertisements ---

    /// Store the parameters of a one-shot advertisement under `id`.
    pub fn one_shot_set(
        &self,
        id: OneShotId,
        adv_data: &[u8],
        resp_data: &[u8],
        adv_type: AdvType,
    ) -> AdapterResult<()> {
        check_payload(adv_data)?;
        check_payload(resp_data)?;
        let core = self.core()?;
        let mut record = AdvRecord {
            adv_data: adv_data.to_vec(),
            resp_data: resp_data.to_vec(),
            max_events: 1,
            ..AdvRecord::default()
        };
        apply_adv_type(&mut record, adv_type)?;
        core.adv.oneshot_set(id, record)
    }

    /// Run the one-shot advertisement `id` to completion: create, start,
    /// wait for the firmware's auto-stop, delete. Synchronous end to end.
    pub async fn one_shot_enable(&self, id: OneShotId) -> AdapterResult<()> {
        let core = self.core()?;
        let record = core
            .adv
            .oneshot_get(id)
            .ok_or(AdapterError::InvalidArgument("unknown one-shot id"))?;

        let handle = match self
            .call(CommandOp::CreateAdv {
                kind: AdvKind::OneShot,
                record,
            })
            .await?
        {
            CommandValue::Handle(handle) => handle,
            _ => return Err(AdapterError::Inconsistent("unexpected create reply")),
        };

        // Register for the auto-stop before starting: the advertisement
        // may fire and stop before the start reply is even observed.
        let stopped = core.adv.register_stop_waiter(handle)?;

        if let Err(e) = self.call(CommandOp::StartAdv { handle }).await {
            let _ = self
                .call(CommandOp::DeleteAdv {
                    handle,
                    notify_connected: None,
                })
                .await;
            return Err(e);
        }

        let wait = tokio::time::timeout(core.config.api_timeout(), stopped).await;
        let reason = match wait {
            Err(_) => {
                warn!("one-shot {} did not stop in time", id);
                let _ = self.call(CommandOp::StopAdv { handle }).await;
                let _ = self
                    .call(CommandOp::DeleteAdv {
                        handle,
                        notify_connected: None,
                    })
                    .await;
                return Err(AdapterError::Timeout);
            }
            Ok(Err(_)) => return Err(AdapterError::NotRunning),
            Ok(Ok(reason)) => reason,
        };
        debug!("one-shot {} stopped ({:?})", id, reason);

        self.call(CommandOp::DeleteAdv {
            handle,
            notify_connected: None,
        })
        .await?;
        Ok(())
    }
}

/// Firmware reported an advertisement stopped. Runs on the event worker.
pub(crate) fn on_adv_stopped(
    core: &Core,
    adv_idx: u8,
    conn: Option<ConnHandle>,
    reason: AdvStopReason,
) {
    let Some(kind) = core.adv.kind_of(adv_idx) else {
        error!("stop report for unknown advertising set {}", adv_idx);
        return;
    };
    debug!(
        "advertising set {} stopped ({:?}, conn {:?})",
        adv_idx, reason, conn
    );
    if core.adv.set_state(adv_idx, AdvState::Created).is_err() {
        return;
    }

    match reason {
        AdvStopReason::HostRequest => {
            // The requesting command chain owns the state transition.
        }
        AdvStopReason::LimitReached => {
            match core.adv.take_stop_waiter(adv_idx) {
                Some(waiter) => {
                    let _ = waiter.send(reason);
                }
                None => warn!("limit stop on {} with nobody waiting", adv_idx),
            }
        }
        AdvStopReason::Connection => {
            let Some(conn) = conn else {
                error!("connection stop on {} without a link", adv_idx);
                return;
            };
            // Record which advertisement produced the link before the slot
            // can be reclaimed.
            let _ = core
                .conns
                .with_slot(conn, |slot| slot.related_adv = Some(adv_idx));

            match kind {
                AdvKind::Static => {
                    // The reserved set self-deletes once a peer connects;
                    // the server is told when the slot is reclaimed.
                    if core
                        .cmd_tx
                        .post(CommandOp::DeleteAdv {
                            handle: adv_idx,
                            notify_connected: Some(conn),
                        })
                        .is_err()
                    {
                        error!("delete follow-up push failed for set {}", adv_idx);
                    }
                }
                AdvKind::OneShot => {
                    if let Some(waiter) = core.adv.take_stop_waiter(adv_idx) {
                        let _ = waiter.send(reason);
                    }
                    gatt::report_connected(core, conn, ServerConnectionKind::LinkConnected);
                }
                AdvKind::Multi => {
                    gatt::report_connected(core, conn, ServerConnectionKind::LinkConnected);
                }
            }
        }
    }
}
