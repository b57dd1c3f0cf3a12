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

//! Host-side BLE adapter core.
//!
//! This crate bridges a generic BLE network interface to a radio-controller
//! firmware that only offers "submit a command, eventually receive an
//! asynchronous completion event". It presents blocking, ordered,
//! single-outcome operations (advertise, scan, connect, GATT server
//! read/write/notify, bond) to upper layers.
//!
//! Internally two long-lived worker tasks drain a command queue and an
//! event queue. Callers never touch firmware or slot-table state directly:
//! caller-initiated mutation is funneled through the command worker,
//! firmware-initiated mutation through the event worker. A caller blocks
//! only on its own bounded reply channel while a multi-step firmware
//! sequence runs on its behalf.

mod adapter;
mod advertiser;
mod central;
mod command;
mod config;
mod error;
mod firmware;
mod scanner;
mod server;
mod slots;
mod storage;
mod types;
mod workers;

pub use adapter::{AdapterSetup, BleAdapter};
pub use config::{AdapterConfig, IoCapability, SecurityConfig};
pub use error::{AdapterError, AdapterResult};
pub use firmware::{
    AdvStopReason, CommandComplete, FirmwareController, FirmwareEventSink, FirmwareNotification,
    FirmwareOp, FwResult, ScanStopReason, ServiceDefinition, ServiceAttribute, TxKind,
};
pub use storage::{
    BlobStore, BondRecord, BondStorage, FileBlobStore, MemoryBlobStore, StorageError,
};
pub use types::*;
