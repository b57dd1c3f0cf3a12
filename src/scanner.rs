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

//! Scan session operations and whitelist management.

use tracing::{debug, error, info};

use crate::adapter::{BleAdapter, Core};
use crate::command::{CommandOp, WhitelistCmd};
use crate::error::{AdapterError, AdapterResult};
use crate::firmware::ScanStopReason;
use crate::types::{
    AdvReportType, PeerAddress, ScanContentFilter, ScanParams, ScanState, ScanStopCause,
    ScannedDevice, MAX_ADV_DATA_LEN,
};

impl BleAdapter {
    /// Start scanning with the default parameters.
    pub async fn start_scan(&self) -> AdapterResult<()> {
        self.start_scan_with(None, false, None).await
    }

    /// Start scanning with explicit parameters, optional duplicate
    /// filtering and an optional payload content filter.
    pub async fn start_scan_with(
        &self,
        params: Option<ScanParams>,
        filter_duplicates: bool,
        content_filter: Option<ScanContentFilter>,
    ) -> AdapterResult<()> {
        if let Some(filter) = &content_filter {
            if filter.pattern.is_empty() {
                return Err(AdapterError::InvalidArgument("empty scan filter pattern"));
            }
            if filter.offset as usize + filter.pattern.len() > MAX_ADV_DATA_LEN {
                return Err(AdapterError::InvalidArgument(
                    "scan filter exceeds advertising payload",
                ));
            }
        }
        let core = self.core()?;
        core.scan.configure(params, filter_duplicates, content_filter)?;
        self.call(CommandOp::StartScan).await?;
        Ok(())
    }

    /// Stop the running scan session.
    pub async fn stop_scan(&self) -> AdapterResult<()> {
        self.call(CommandOp::StopScan).await?;
        Ok(())
    }

    /// True while a scan session is delivering reports.
    pub fn scanning(&self) -> bool {
        self.core()
            .map(|core| core.scan.state() == ScanState::Scanning)
            .unwrap_or(false)
    }

    // --- whitelist ---

    /// Add a peer to the controller whitelist and persist it.
    pub async fn whitelist_add(&self, peer: PeerAddress) -> AdapterResult<()> {
        if peer.addr.is_zero() {
            return Err(AdapterError::InvalidArgument("zero whitelist address"));
        }
        self.call(CommandOp::Whitelist(WhitelistCmd::Add(peer))).await?;
        Ok(())
    }

    /// Remove a peer from the controller whitelist and the store.
    pub async fn whitelist_remove(&self, peer: PeerAddress) -> AdapterResult<()> {
        self.call(CommandOp::Whitelist(WhitelistCmd::Remove(peer)))
            .await?;
        Ok(())
    }

    /// Clear the controller whitelist and the store.
    pub async fn whitelist_clear(&self) -> AdapterResult<()> {
        self.call(CommandOp::Whitelist(WhitelistCmd::Clear)).await?;
        Ok(())
    }

    /// Persisted whitelist entries.
    pub fn whitelist_entries(&self) -> AdapterResult<Vec<PeerAddress>> {
        let core = self.core()?;
        Ok(core.bonds.whitelist_entries())
    }
}

/// A raw advertising report arrived. Runs on the event worker.
pub(crate) fn on_scan_report(
    core: &Core,
    peer: PeerAddress,
    report_type: AdvReportType,
    rssi: i8,
    data: Vec<u8>,
) {
    if !core
        .scan
        .accept_report(&peer.addr, peer.addr_type, report_type, &data)
    {
        return;
    }
    let device = ScannedDevice {
        peer,
        report_type,
        rssi,
        data,
    };
    if let Some(cb) = &core.client.device_scanned {
        cb(&device);
    }
}

/// Firmware reported the scan session stopped. Runs on the event worker.
pub(crate) fn on_scan_stopped(core: &Core, reason: ScanStopReason) {
    match reason {
        ScanStopReason::HostRequest => {
            // The stop chain on the command worker owns the teardown.
            debug!("scan stopped on host request");
        }
        ScanStopReason::DurationElapsed => {
            info!("scan duration elapsed, tearing the session down");
            core.scan.set_stop_cause(ScanStopCause::Auto);
            core.scan.set_state(ScanState::Stopping);
            if core.cmd_tx.post(CommandOp::DeleteScan).is_err() {
                error!("scan delete follow-up push failed");
            }
        }
    }
}
