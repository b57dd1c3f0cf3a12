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

//! End-to-end tests of the adapter against the scripted mock firmware.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::sleep;

use ble_host_adapter::*;
use common::MockFirmware;

fn peer(last: u8) -> PeerAddress {
    PeerAddress {
        addr: BdAddr([last, 0, 0, 0, 0, 0]),
        addr_type: AddrType::Public,
    }
}

async fn start_adapter(
    server: ServerConfig,
    client: ClientCallbacks,
) -> (BleAdapter, Arc<MockFirmware>) {
    start_adapter_with_config(AdapterConfig::default(), server, client).await
}

async fn start_adapter_with_config(
    config: AdapterConfig,
    server: ServerConfig,
    client: ClientCallbacks,
) -> (BleAdapter, Arc<MockFirmware>) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let firmware = MockFirmware::new();
    let adapter = BleAdapter::new();
    adapter
        .init(AdapterSetup {
            config,
            client,
            server,
            firmware: firmware.clone(),
            store: Arc::new(MemoryBlobStore::new()),
        })
        .await
        .unwrap();
    (adapter, firmware)
}

/// Battery-style profile: service at 0x10, characteristic declaration at
/// 0x11 (value 0x12), CCCD at 0x13. Attribute events are collected.
fn battery_profile(events: Arc<Mutex<Vec<AttrEvent>>>) -> ServerConfig {
    let callback: AttrCallback = Arc::new(move |event| events.lock().unwrap().push(event));
    ServerConfig {
        profiles: vec![
            GattProfileEntry {
                entry_type: GattAttrType::Service,
                uuid: uuid16(0x180F),
                attr_handle: 0x10,
                properties: AttrProperties::default(),
                permissions: AttrPermissions::default(),
                callback: None,
            },
            GattProfileEntry {
                entry_type: GattAttrType::Characteristic,
                uuid: uuid16(0x2A19),
                attr_handle: 0x11,
                properties: AttrProperties {
                    read: true,
                    write: true,
                    notify: true,
                    indicate: true,
                    ..AttrProperties::default()
                },
                permissions: AttrPermissions::default(),
                callback: Some(callback.clone()),
            },
            GattProfileEntry {
                entry_type: GattAttrType::Descriptor,
                uuid: CCCD_UUID,
                attr_handle: 0x13,
                properties: AttrProperties::default(),
                permissions: AttrPermissions::default(),
                callback: Some(callback),
            },
        ],
        ..ServerConfig::default()
    }
}

async fn peripheral_link(firmware: &MockFirmware, conn: ConnHandle) {
    firmware
        .sink()
        .notify(FirmwareNotification::ConnectionEstablished {
            conn,
            role: LinkRole::Peripheral,
            peer: peer(0x5A),
            interval: 40,
            latency: 0,
            supervision_timeout: 500,
        });
    sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn services_register_during_init() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let (_adapter, firmware) = start_adapter(battery_profile(events), ClientCallbacks::default()).await;
    assert_eq!(firmware.call_count("register-service"), 1);
    assert_eq!(firmware.call_count("set-max-mtu"), 1);
}

#[tokio::test]
async fn static_advertising_lifecycle() {
    let (adapter, firmware) = start_adapter(ServerConfig::default(), ClientCallbacks::default()).await;

    adapter.set_adv_data(&[0xAB; 20]).unwrap();
    adapter.set_scan_response(&[0xCD; 8]).unwrap();
    adapter.start_advertising().await.unwrap();

    assert_eq!(firmware.call_count("create-adv"), 1);
    assert_eq!(firmware.call_count("start-adv"), 1);
    assert!(firmware.calls().iter().any(|c| c.starts_with("set-adv-data")));

    // Template edits are rejected while on air.
    assert_eq!(
        adapter.set_adv_data(&[0xEE; 4]).unwrap_err(),
        AdapterError::InvalidState("static advertising active")
    );

    adapter.stop_advertising().await.unwrap();
    assert_eq!(firmware.call_count("stop-adv"), 1);
    assert_eq!(firmware.call_count("delete-adv"), 1);

    // Stopping again is a no-op.
    firmware.clear_calls();
    adapter.stop_advertising().await.unwrap();
    assert!(firmware.calls().is_empty());
}

#[tokio::test]
async fn starting_static_twice_never_touches_firmware() {
    let (adapter, firmware) = start_adapter(ServerConfig::default(), ClientCallbacks::default()).await;
    adapter.start_advertising().await.unwrap();

    firmware.clear_calls();
    assert_eq!(
        adapter.start_advertising().await.unwrap_err(),
        AdapterError::InvalidState("static advertising active")
    );
    assert!(firmware.calls().is_empty());
}

#[tokio::test]
async fn oversize_payload_is_rejected_before_submission() {
    let (adapter, firmware) = start_adapter(ServerConfig::default(), ClientCallbacks::default()).await;
    firmware.clear_calls();
    assert_eq!(
        adapter.set_adv_data(&[0; 32]).unwrap_err(),
        AdapterError::InvalidArgument("advertising payload too long")
    );
    assert!(firmware.calls().is_empty());
}

#[tokio::test]
async fn multi_adv_data_change_restarts_running_set() {
    let (adapter, firmware) = start_adapter(ServerConfig::default(), ClientCallbacks::default()).await;

    let handle = adapter
        .create_multi_adv(AdvEventProp::ConnectableScannableUndirected, (160, 160), None)
        .await
        .unwrap();
    assert_eq!(adapter.adv_state(handle).unwrap(), AdvState::Created);

    adapter.set_multi_adv_data(handle, &[0x11; 30]).await.unwrap();
    adapter.set_multi_resp_data(handle, &[0x22; 10]).await.unwrap();
    adapter.enable_multi_adv(handle, true).await.unwrap();
    assert_eq!(adapter.adv_state(handle).unwrap(), AdvState::Advertising);
    assert!(firmware
        .calls()
        .iter()
        .any(|c| c == &format!("set-adv-data:{handle}:30")));

    // Changing data on a running set performs an implicit stop+restart.
    firmware.clear_calls();
    adapter.set_multi_adv_data(handle, &[0x33; 20]).await.unwrap();
    assert_eq!(firmware.call_count(&format!("stop-adv:{handle}")), 1);
    assert_eq!(firmware.call_count(&format!("start-adv:{handle}")), 1);
    assert!(firmware
        .calls()
        .iter()
        .any(|c| c == &format!("set-adv-data:{handle}:20")));
    assert_eq!(adapter.adv_state(handle).unwrap(), AdvState::Advertising);

    adapter.enable_multi_adv(handle, false).await.unwrap();
    adapter.delete_multi_adv(handle).await.unwrap();
    assert!(adapter.adv_state(handle).is_err());
}

#[tokio::test]
async fn one_shot_requires_parameters_first() {
    let (adapter, firmware) = start_adapter(ServerConfig::default(), ClientCallbacks::default()).await;
    firmware.clear_calls();
    assert_eq!(
        adapter.one_shot_enable(42).await.unwrap_err(),
        AdapterError::InvalidArgument("unknown one-shot id")
    );
    assert!(firmware.calls().is_empty());
}

#[tokio::test]
async fn one_shot_runs_to_completion_and_is_reusable() {
    let (adapter, firmware) = start_adapter(ServerConfig::default(), ClientCallbacks::default()).await;

    adapter
        .one_shot_set(7, &[0x01; 12], &[], AdvType::NonConnectable)
        .unwrap();
    adapter.one_shot_enable(7).await.unwrap();

    assert_eq!(firmware.call_count("create-adv"), 1);
    assert_eq!(firmware.call_count("start-adv"), 1);
    assert_eq!(firmware.call_count("delete-adv"), 1);

    // The parameter record survives; the slot was reclaimed.
    firmware.clear_calls();
    adapter.one_shot_enable(7).await.unwrap();
    assert_eq!(firmware.call_count("delete-adv"), 1);
}

#[tokio::test]
async fn scan_lifecycle() {
    let (adapter, firmware) = start_adapter(ServerConfig::default(), ClientCallbacks::default()).await;

    adapter.start_scan().await.unwrap();
    assert!(adapter.scanning());
    assert_eq!(firmware.call_count("create-scan"), 1);
    assert_eq!(firmware.call_count("start-scan"), 1);

    assert_eq!(
        adapter.start_scan().await.unwrap_err(),
        AdapterError::InvalidState("scan already running")
    );

    adapter.stop_scan().await.unwrap();
    assert!(!adapter.scanning());
    assert_eq!(firmware.call_count("stop-scan"), 1);
    assert_eq!(firmware.call_count("delete-scan"), 1);
}

#[tokio::test]
async fn duplicate_scan_reports_are_filtered() {
    let seen: Arc<Mutex<Vec<ScannedDevice>>> = Arc::new(Mutex::new(Vec::new()));
    let sink_seen = seen.clone();
    let client = ClientCallbacks {
        device_scanned: Some(Arc::new(move |device| {
            sink_seen.lock().unwrap().push(device.clone());
        })),
        ..ClientCallbacks::default()
    };
    let (adapter, firmware) = start_adapter(ServerConfig::default(), client).await;

    adapter.start_scan_with(None, true, None).await.unwrap();
    for _ in 0..3 {
        firmware.sink().notify(FirmwareNotification::ScanReport {
            peer: peer(0x77),
            report_type: AdvReportType::ConnectableUndirected,
            rssi: -40,
            data: vec![0x02, 0x01, 0x06],
        });
    }
    sleep(Duration::from_millis(50)).await;

    assert_eq!(seen.lock().unwrap().len(), 1);
    assert_eq!(seen.lock().unwrap()[0].peer.addr, BdAddr([0x77, 0, 0, 0, 0, 0]));
}

#[tokio::test]
async fn untagged_read_completions_resolve_in_fifo_order() {
    let (adapter, firmware) = start_adapter(ServerConfig::default(), ClientCallbacks::default()).await;
    firmware.set_auto_connect(3);

    let conn = adapter
        .connect(ConnectTarget {
            peer: peer(9),
            secured: false,
            conn_params: None,
        })
        .await
        .unwrap();
    assert_eq!(conn, 3);
    assert_eq!(adapter.connection_state(conn).unwrap(), ConnState::Connected);

    let adapter = Arc::new(adapter);
    let mut readers = Vec::new();
    for attr in [0x10u16, 0x20, 0x30] {
        let reader = adapter.clone();
        readers.push(tokio::spawn(async move { reader.gatt_read(3, attr).await }));
        sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(firmware.call_count("read-attr"), 3);

    // Three untagged completions, delivered in firmware order, must land
    // on A, B, C regardless of any timing jitter above.
    for value in [0xA1u8, 0xB2, 0xC3] {
        firmware.sink().notify(FirmwareNotification::ReadResult {
            conn: 3,
            status: 0,
            value: vec![value],
        });
    }

    let mut results = Vec::new();
    for reader in readers {
        results.push(reader.await.unwrap().unwrap());
    }
    assert_eq!(results, vec![vec![0xA1], vec![0xB2], vec![0xC3]]);
}

#[tokio::test]
async fn second_connect_attempt_is_rejected_while_initiating() {
    let (adapter, firmware) = start_adapter(ServerConfig::default(), ClientCallbacks::default()).await;
    // No auto-connect: the initiator stays busy.
    let adapter = Arc::new(adapter);

    let first = {
        let adapter = adapter.clone();
        tokio::spawn(async move {
            adapter
                .connect(ConnectTarget {
                    peer: peer(1),
                    secured: false,
                    conn_params: None,
                })
                .await
        })
    };
    sleep(Duration::from_millis(50)).await;

    assert_eq!(
        adapter
            .connect(ConnectTarget {
                peer: peer(2),
                secured: false,
                conn_params: None,
            })
            .await
            .unwrap_err(),
        AdapterError::InvalidState("initiator busy")
    );

    // The firmware gives up; the first caller sees the failure.
    firmware
        .sink()
        .notify(FirmwareNotification::ConnectionFailed { status: 0x3E });
    assert_eq!(
        first.await.unwrap().unwrap_err(),
        AdapterError::Firmware(0x3E)
    );
}

#[tokio::test]
async fn disconnect_is_idempotent() {
    let (adapter, firmware) = start_adapter(ServerConfig::default(), ClientCallbacks::default()).await;
    firmware.set_auto_connect(2);

    let conn = adapter
        .connect(ConnectTarget {
            peer: peer(4),
            secured: false,
            conn_params: None,
        })
        .await
        .unwrap();

    adapter.disconnect(conn).await.unwrap();
    assert_eq!(adapter.connection_state(conn).unwrap(), ConnState::Disconnected);
    assert_eq!(firmware.call_count("disconnect"), 1);

    // The link is already down: success without another firmware trip.
    adapter.disconnect(conn).await.unwrap();
    assert_eq!(firmware.call_count("disconnect"), 1);
}

#[tokio::test]
async fn indication_backpressure_is_local() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let (adapter, firmware) =
        start_adapter(battery_profile(events.clone()), ClientCallbacks::default()).await;
    peripheral_link(&firmware, 0).await;

    firmware.clear_calls();
    for _ in 0..5 {
        adapter.indicate(0, 0x12, &[1, 2]).unwrap();
    }
    // The cap is enforced before the firmware is contacted.
    assert_eq!(
        adapter.indicate(0, 0x12, &[1, 2]).unwrap_err(),
        AdapterError::ResourceExhausted
    );
    assert_eq!(firmware.call_count("indicate"), 5);
    assert_eq!(adapter.indicate_pending_count(0).unwrap(), 5);

    // One completion frees exactly one slot.
    firmware.sink().notify(FirmwareNotification::TxDone {
        conn: 0,
        service: 0,
        attr_index: 2,
        kind: TxKind::Indication,
        status: 0,
    });
    sleep(Duration::from_millis(50)).await;
    assert_eq!(adapter.indicate_pending_count(0).unwrap(), 4);
    adapter.indicate(0, 0x12, &[3]).unwrap();

    let events = events.lock().unwrap();
    let indication_results: Vec<_> = events
        .iter()
        .filter(|e| e.kind == AttrCallbackKind::IndicateResult)
        .collect();
    assert_eq!(indication_results.len(), 1);
    assert_eq!(indication_results[0].pending, 4);
}

#[tokio::test]
async fn notify_waits_for_transmit_completion() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let (adapter, firmware) = start_adapter(battery_profile(events), ClientCallbacks::default()).await;
    peripheral_link(&firmware, 1).await;

    adapter.notify(1, 0x12, &[9, 9]).await.unwrap();
    assert_eq!(firmware.call_count("notify"), 1);
}

#[tokio::test]
async fn rejected_peer_write_changes_nothing() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let (adapter, firmware) =
        start_adapter(battery_profile(events.clone()), ClientCallbacks::default()).await;
    peripheral_link(&firmware, 0).await;

    adapter.attr_reject(0x12, 0x03).unwrap();
    firmware.sink().notify(FirmwareNotification::PeerWrite {
        conn: 0,
        service: 0,
        attr_index: 2,
        value: vec![0xDE, 0xAD],
        no_response: false,
    });
    sleep(Duration::from_millis(50)).await;

    // The error response carried the configured code; the value and the
    // application both saw nothing.
    assert_eq!(firmware.call_count("write-response:0:0:2:3"), 1);
    assert!(adapter.attr_get_data(0x12).unwrap().is_empty());
    assert!(events.lock().unwrap().is_empty());

    // Clearing the reject code accepts writes again.
    adapter.attr_reject(0x12, 0).unwrap();
    firmware.sink().notify(FirmwareNotification::PeerWrite {
        conn: 0,
        service: 0,
        attr_index: 2,
        value: vec![0xBE, 0xEF],
        no_response: false,
    });
    sleep(Duration::from_millis(50)).await;
    assert_eq!(adapter.attr_get_data(0x12).unwrap(), vec![0xBE, 0xEF]);
    let events = events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, AttrCallbackKind::Write);
    assert_eq!(events[0].handle, 0x12);
}

#[tokio::test]
async fn cccd_writes_are_classified() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let (_adapter, firmware) =
        start_adapter(battery_profile(events.clone()), ClientCallbacks::default()).await;
    peripheral_link(&firmware, 0).await;

    firmware.sink().notify(FirmwareNotification::PeerWrite {
        conn: 0,
        service: 0,
        attr_index: 3,
        value: CCCD_NOTIFY.to_le_bytes().to_vec(),
        no_response: false,
    });
    sleep(Duration::from_millis(50)).await;

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, AttrCallbackKind::CccdChanged);
    assert_eq!(events[0].status, CCCD_NOTIFY);
    assert_eq!(events[0].handle, 0x13);
}

#[tokio::test]
async fn peer_read_answers_with_stored_value() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let (adapter, firmware) =
        start_adapter(battery_profile(events.clone()), ClientCallbacks::default()).await;
    peripheral_link(&firmware, 0).await;

    adapter.attr_set_data(0x12, &[0x64]).unwrap();
    firmware.sink().notify(FirmwareNotification::PeerRead {
        conn: 0,
        service: 0,
        attr_index: 2,
    });
    sleep(Duration::from_millis(50)).await;

    assert_eq!(firmware.call_count("read-response:0:0:2:0"), 1);
    let events = events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, AttrCallbackKind::Read);
}

#[tokio::test]
async fn whitelist_survives_reinit() {
    let firmware = MockFirmware::new();
    let store: Arc<MemoryBlobStore> = Arc::new(MemoryBlobStore::new());
    let adapter = BleAdapter::new();
    adapter
        .init(AdapterSetup {
            config: AdapterConfig::default(),
            client: ClientCallbacks::default(),
            server: ServerConfig::default(),
            firmware: firmware.clone(),
            store: store.clone(),
        })
        .await
        .unwrap();

    adapter.whitelist_add(peer(0x42)).await.unwrap();
    assert_eq!(adapter.whitelist_entries().unwrap().len(), 1);
    adapter.deinit().await.unwrap();

    // A fresh bring-up replays the persisted entry into the controller.
    firmware.clear_calls();
    adapter
        .init(AdapterSetup {
            config: AdapterConfig::default(),
            client: ClientCallbacks::default(),
            server: ServerConfig::default(),
            firmware: firmware.clone(),
            store,
        })
        .await
        .unwrap();
    assert_eq!(firmware.call_count("whitelist-add"), 1);
}

#[tokio::test]
async fn unresponsive_firmware_degrades_to_timeout() {
    let config = AdapterConfig {
        firmware_step_timeout_ms: 150,
        api_timeout_ms: 1_000,
        ..AdapterConfig::default()
    };
    let (adapter, firmware) =
        start_adapter_with_config(config, ServerConfig::default(), ClientCallbacks::default()).await;

    firmware.silence("create-adv");
    assert_eq!(
        adapter.start_advertising().await.unwrap_err(),
        AdapterError::Timeout
    );

    // The slot was unwound; a responsive firmware succeeds afterwards.
    let firmware_calls_before = firmware.call_count("create-adv");
    assert_eq!(firmware_calls_before, 1);
}

#[tokio::test]
async fn deinit_stops_workers_and_frees_everything() {
    let (adapter, firmware) = start_adapter(ServerConfig::default(), ClientCallbacks::default()).await;
    adapter.start_advertising().await.unwrap();
    adapter.start_scan().await.unwrap();

    adapter.deinit().await.unwrap();
    assert!(!adapter.is_running());

    assert_eq!(
        adapter.start_scan().await.unwrap_err(),
        AdapterError::NotRunning
    );
    assert_eq!(adapter.set_adv_data(&[1]).unwrap_err(), AdapterError::NotRunning);
    assert_eq!(
        adapter.deinit().await.unwrap_err(),
        AdapterError::InvalidState("not initialized")
    );

    // Everything was reset: a fresh init starts from a clean table.
    adapter
        .init(AdapterSetup {
            config: AdapterConfig::default(),
            client: ClientCallbacks::default(),
            server: ServerConfig::default(),
            firmware: firmware.clone(),
            store: Arc::new(MemoryBlobStore::new()),
        })
        .await
        .unwrap();
    adapter.start_advertising().await.unwrap();
}

#[tokio::test]
async fn connecting_to_connected_peer_is_rejected() {
    let (adapter, firmware) = start_adapter(ServerConfig::default(), ClientCallbacks::default()).await;
    firmware.set_auto_connect(1);

    adapter
        .connect(ConnectTarget {
            peer: peer(6),
            secured: false,
            conn_params: None,
        })
        .await
        .unwrap();

    assert_eq!(
        adapter
            .connect(ConnectTarget {
                peer: peer(6),
                secured: false,
                conn_params: None,
            })
            .await
            .unwrap_err(),
        AdapterError::AlreadyInProgress
    );
}

#[tokio::test]
async fn connected_callback_fires_for_central_links() {
    let connected: Arc<Mutex<Vec<ConnHandle>>> = Arc::new(Mutex::new(Vec::new()));
    let connected_sink = connected.clone();
    let client = ClientCallbacks {
        device_connected: Some(Arc::new(move |device| {
            connected_sink.lock().unwrap().push(device.conn);
        })),
        ..ClientCallbacks::default()
    };
    let (adapter, firmware) = start_adapter(ServerConfig::default(), client).await;
    firmware.set_auto_connect(5);

    let conn = adapter
        .connect(ConnectTarget {
            peer: peer(8),
            secured: false,
            conn_params: None,
        })
        .await
        .unwrap();
    sleep(Duration::from_millis(20)).await;
    assert_eq!(*connected.lock().unwrap(), vec![conn]);
}
