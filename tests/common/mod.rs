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

//! Scripted controller firmware for integration tests.
//!
//! Every call is recorded, completions fire synchronously through the
//! sink (unless a call is configured to fail, be rejected or stay
//! silent), and link-level notifications are delivered with a small delay
//! to mimic real controller latency.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ble_host_adapter::{
    AdvParams, AdvStopReason, AttrHandle, BdAddr, CommandComplete, ConnHandle, ConnParams,
    FirmwareController, FirmwareEventSink, FirmwareNotification, FirmwareOp, FwResult,
    LinkRole, PeerAddress, ScanParams, SecurityConfig, ServiceDefinition,
};

/// How long the mock waits before delivering link-level notifications.
const LINK_EVENT_DELAY: Duration = Duration::from_millis(30);

#[derive(Default)]
pub struct MockFirmware {
    sink: Mutex<Option<FirmwareEventSink>>,
    calls: Mutex<Vec<String>>,
    /// Call name -> non-zero completion status.
    fail_completion: Mutex<Vec<(String, u16)>>,
    /// Call name -> immediate reject status.
    reject_call: Mutex<Vec<(String, u16)>>,
    /// Calls that are accepted but never complete.
    silent: Mutex<HashSet<String>>,
    /// Connection handle assigned when the initiator finds its target.
    auto_connect: Mutex<Option<ConnHandle>>,
    last_target: Mutex<Option<PeerAddress>>,
}

impl MockFirmware {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sink(&self) -> FirmwareEventSink {
        self.sink
            .lock()
            .unwrap()
            .clone()
            .expect("firmware not attached")
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    /// Make the completion of `call` report `status`.
    pub fn fail_completion_of(&self, call: &str, status: u16) {
        self.fail_completion
            .lock()
            .unwrap()
            .push((call.to_string(), status));
    }

    /// Make `call` rejected immediately with `status`.
    pub fn reject(&self, call: &str, status: u16) {
        self.reject_call
            .lock()
            .unwrap()
            .push((call.to_string(), status));
    }

    /// Accept `call` but never complete it.
    pub fn silence(&self, call: &str) {
        self.silent.lock().unwrap().insert(call.to_string());
    }

    /// Establish a central link on this handle once the initiator starts.
    pub fn set_auto_connect(&self, conn: ConnHandle) {
        *self.auto_connect.lock().unwrap() = Some(conn);
    }

    fn record(&self, entry: String) {
        self.calls.lock().unwrap().push(entry);
    }

    fn accept(&self, name: &str) -> FwResult {
        let rejects = self.reject_call.lock().unwrap();
        match rejects.iter().find(|(call, _)| call == name) {
            Some((_, status)) => Err(*status),
            None => Ok(()),
        }
    }

    fn completion_status(&self, name: &str) -> u16 {
        let failures = self.fail_completion.lock().unwrap();
        failures
            .iter()
            .find(|(call, _)| call == name)
            .map(|(_, status)| *status)
            .unwrap_or(0)
    }

    fn finish(&self, name: &str, op: FirmwareOp, target: u8) {
        if self.silent.lock().unwrap().contains(name) {
            return;
        }
        let status = self.completion_status(name);
        self.sink().command_complete(CommandComplete { op, target, status });
    }

    fn notify_later(&self, notification: FirmwareNotification) {
        let sink = self.sink();
        tokio::spawn(async move {
            tokio::time::sleep(LINK_EVENT_DELAY).await;
            sink.notify(notification);
        });
    }
}

impl FirmwareController for MockFirmware {
    fn attach(&self, sink: FirmwareEventSink) {
        *self.sink.lock().unwrap() = Some(sink);
    }

    fn create_advertising(&self, adv_idx: u8, _params: &AdvParams) -> FwResult {
        self.record(format!("create-adv:{adv_idx}"));
        self.accept("create-adv")?;
        self.finish("create-adv", FirmwareOp::CreateAdv, adv_idx);
        Ok(())
    }

    fn modify_advertising(&self, adv_idx: u8, _params: &AdvParams) -> FwResult {
        self.record(format!("modify-adv:{adv_idx}"));
        self.accept("modify-adv")?;
        self.finish("modify-adv", FirmwareOp::ModifyAdv, adv_idx);
        Ok(())
    }

    fn set_adv_random_addr(&self, adv_idx: u8, _addr: &BdAddr) -> FwResult {
        self.record(format!("set-adv-random-addr:{adv_idx}"));
        self.accept("set-adv-random-addr")?;
        self.finish("set-adv-random-addr", FirmwareOp::SetAdvRandomAddr, adv_idx);
        Ok(())
    }

    fn set_adv_data(&self, adv_idx: u8, data: &[u8]) -> FwResult {
        self.record(format!("set-adv-data:{adv_idx}:{}", data.len()));
        self.accept("set-adv-data")?;
        self.finish("set-adv-data", FirmwareOp::SetAdvData, adv_idx);
        Ok(())
    }

    fn set_scan_response(&self, adv_idx: u8, data: &[u8]) -> FwResult {
        self.record(format!("set-scan-rsp:{adv_idx}:{}", data.len()));
        self.accept("set-scan-rsp")?;
        self.finish("set-scan-rsp", FirmwareOp::SetScanResponse, adv_idx);
        Ok(())
    }

    fn set_adv_tx_power(&self, adv_idx: u8, _gain_dbm: f32) -> FwResult {
        self.record(format!("set-adv-tx-power:{adv_idx}"));
        self.accept("set-adv-tx-power")
    }

    fn start_advertising(&self, adv_idx: u8, _duration: u16, max_events: u8) -> FwResult {
        self.record(format!("start-adv:{adv_idx}"));
        self.accept("start-adv")?;
        self.finish("start-adv", FirmwareOp::StartAdv, adv_idx);
        if max_events > 0 {
            // Event-count-limited advertisements stop by themselves.
            self.notify_later(FirmwareNotification::AdvStopped {
                adv_idx,
                conn: None,
                reason: AdvStopReason::LimitReached,
            });
        }
        Ok(())
    }

    fn stop_advertising(&self, adv_idx: u8) -> FwResult {
        self.record(format!("stop-adv:{adv_idx}"));
        self.accept("stop-adv")?;
        self.finish("stop-adv", FirmwareOp::StopAdv, adv_idx);
        Ok(())
    }

    fn delete_advertising(&self, adv_idx: u8) -> FwResult {
        self.record(format!("delete-adv:{adv_idx}"));
        self.accept("delete-adv")?;
        self.finish("delete-adv", FirmwareOp::DeleteAdv, adv_idx);
        Ok(())
    }

    fn create_scan(&self, scan_idx: u8, _params: &ScanParams) -> FwResult {
        self.record(format!("create-scan:{scan_idx}"));
        self.accept("create-scan")?;
        self.finish("create-scan", FirmwareOp::CreateScan, scan_idx);
        Ok(())
    }

    fn start_scan(&self, scan_idx: u8, _duration: u16, _period: u16) -> FwResult {
        self.record(format!("start-scan:{scan_idx}"));
        self.accept("start-scan")?;
        self.finish("start-scan", FirmwareOp::StartScan, scan_idx);
        Ok(())
    }

    fn stop_scan(&self, scan_idx: u8) -> FwResult {
        self.record(format!("stop-scan:{scan_idx}"));
        self.accept("stop-scan")?;
        self.finish("stop-scan", FirmwareOp::StopScan, scan_idx);
        Ok(())
    }

    fn delete_scan(&self, scan_idx: u8) -> FwResult {
        self.record(format!("delete-scan:{scan_idx}"));
        self.accept("delete-scan")?;
        self.finish("delete-scan", FirmwareOp::DeleteScan, scan_idx);
        Ok(())
    }

    fn create_initiator(&self, init_idx: u8, _params: &ConnParams) -> FwResult {
        self.record(format!("create-init:{init_idx}"));
        self.accept("create-init")?;
        self.finish("create-init", FirmwareOp::CreateInitiator, init_idx);
        Ok(())
    }

    fn set_initiator_target(&self, init_idx: u8, peer: &PeerAddress) -> FwResult {
        self.record(format!("set-init-target:{init_idx}"));
        *self.last_target.lock().unwrap() = Some(*peer);
        self.accept("set-init-target")
    }

    fn set_initiator_timeout(&self, init_idx: u8, _timeout_ms: u32) -> FwResult {
        self.record(format!("set-init-timeout:{init_idx}"));
        self.accept("set-init-timeout")
    }

    fn start_initiator(&self, init_idx: u8) -> FwResult {
        self.record(format!("start-init:{init_idx}"));
        self.accept("start-init")?;
        self.finish("start-init", FirmwareOp::StartInitiator, init_idx);
        if let Some(conn) = *self.auto_connect.lock().unwrap() {
            let peer = self
                .last_target
                .lock()
                .unwrap()
                .expect("initiator target not set");
            self.notify_later(FirmwareNotification::ConnectionEstablished {
                conn,
                role: LinkRole::Central,
                peer,
                interval: 40,
                latency: 0,
                supervision_timeout: 500,
            });
        }
        Ok(())
    }

    fn stop_initiator(&self, init_idx: u8) -> FwResult {
        self.record(format!("stop-init:{init_idx}"));
        self.accept("stop-init")?;
        self.finish("stop-init", FirmwareOp::StopInitiator, init_idx);
        Ok(())
    }

    fn disconnect(&self, conn: ConnHandle) -> FwResult {
        self.record(format!("disconnect:{conn}"));
        self.accept("disconnect")?;
        self.notify_later(FirmwareNotification::Disconnected {
            conn,
            reason: 0x16,
        });
        Ok(())
    }

    fn update_conn_params(&self, conn: ConnHandle, _params: &ConnParams) -> FwResult {
        self.record(format!("update-conn-params:{conn}"));
        self.accept("update-conn-params")
    }

    fn set_max_mtu(&self, mtu: u16) -> FwResult {
        self.record(format!("set-max-mtu:{mtu}"));
        self.accept("set-max-mtu")
    }

    fn set_device_name(&self, _name: &[u8]) -> FwResult {
        self.record("set-device-name".to_string());
        self.accept("set-device-name")
    }

    fn register_service(&self, service: &ServiceDefinition) -> FwResult {
        self.record(format!("register-service:{}", service.service_index));
        self.accept("register-service")?;
        if !self.silent.lock().unwrap().contains("register-service") {
            let status = self.completion_status("register-service");
            self.sink()
                .notify(FirmwareNotification::ServiceRegistered { status });
        }
        Ok(())
    }

    fn read_response(
        &self,
        conn: ConnHandle,
        service: u8,
        attr_index: u16,
        _value: &[u8],
        reject: u8,
    ) -> FwResult {
        self.record(format!("read-response:{conn}:{service}:{attr_index}:{reject}"));
        self.accept("read-response")
    }

    fn write_response(&self, conn: ConnHandle, service: u8, attr_index: u16, reject: u8) -> FwResult {
        self.record(format!("write-response:{conn}:{service}:{attr_index}:{reject}"));
        self.accept("write-response")
    }

    fn notify_value(&self, conn: ConnHandle, service: u8, attr_index: u16, _value: &[u8]) -> FwResult {
        self.record(format!("notify:{conn}:{service}:{attr_index}"));
        self.accept("notify")?;
        self.sink().notify(FirmwareNotification::TxDone {
            conn,
            service,
            attr_index,
            kind: ble_host_adapter::TxKind::Notification,
            status: 0,
        });
        Ok(())
    }

    fn indicate_value(&self, conn: ConnHandle, service: u8, attr_index: u16, _value: &[u8]) -> FwResult {
        self.record(format!("indicate:{conn}:{service}:{attr_index}"));
        // Indication completions are injected by the test.
        self.accept("indicate")
    }

    fn read_attribute(&self, conn: ConnHandle, attr: AttrHandle) -> FwResult {
        self.record(format!("read-attr:{conn}:{attr:#x}"));
        // Read results are injected by the test, untagged.
        self.accept("read-attr")
    }

    fn write_attribute(
        &self,
        conn: ConnHandle,
        attr: AttrHandle,
        _value: &[u8],
        with_response: bool,
    ) -> FwResult {
        self.record(format!("write-attr:{conn}:{attr:#x}:{with_response}"));
        self.accept("write-attr")
    }

    fn create_bond(&self, conn: ConnHandle, _security: &SecurityConfig) -> FwResult {
        self.record(format!("create-bond:{conn}"));
        self.accept("create-bond")?;
        // Pairing concludes successfully unless the test intervenes.
        self.notify_later(FirmwareNotification::PairingSucceeded { conn });
        Ok(())
    }

    fn send_auth_mode(&self, conn: ConnHandle, _security: &SecurityConfig, accept: bool) -> FwResult {
        self.record(format!("send-auth-mode:{conn}:{accept}"));
        self.accept("send-auth-mode")
    }

    fn passkey_confirm(&self, conn: ConnHandle, accept: bool, _passkey: u32) -> FwResult {
        self.record(format!("passkey-confirm:{conn}:{accept}"));
        self.accept("passkey-confirm")
    }

    fn whitelist_add(&self, _peer: &PeerAddress) -> FwResult {
        self.record("whitelist-add".to_string());
        self.accept("whitelist-add")?;
        self.sink()
            .notify(FirmwareNotification::WhitelistComplete { status: 0 });
        Ok(())
    }

    fn whitelist_remove(&self, _peer: &PeerAddress) -> FwResult {
        self.record("whitelist-remove".to_string());
        self.accept("whitelist-remove")?;
        self.sink()
            .notify(FirmwareNotification::WhitelistComplete { status: 0 });
        Ok(())
    }

    fn whitelist_clear(&self) -> FwResult {
        self.record("whitelist-clear".to_string());
        self.accept("whitelist-clear")?;
        self.sink()
            .notify(FirmwareNotification::WhitelistComplete { status: 0 });
        Ok(())
    }
}
