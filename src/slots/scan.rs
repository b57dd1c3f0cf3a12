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

//! The single scan session: state, parameters, duplicate filter and the
//! optional payload content filter.

use parking_lot::Mutex;

use crate::error::{AdapterError, AdapterResult};
use crate::types::{
    AddrType, AdvReportType, BdAddr, ScanContentFilter, ScanParams, ScanState, ScanStopCause,
    DUP_FILTER_CAPACITY,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DupEntry {
    addr: BdAddr,
    addr_type: AddrType,
    report_type: AdvReportType,
}

/// Ring buffer of recently reported advertisements.
struct DupFilter {
    entries: Vec<DupEntry>,
    pos: usize,
}

impl DupFilter {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            pos: 0,
        }
    }

    /// True when the report was seen before; otherwise remembers it.
    fn check_and_insert(&mut self, entry: DupEntry) -> bool {
        if self.entries.contains(&entry) {
            return true;
        }
        if self.entries.len() < DUP_FILTER_CAPACITY {
            self.entries.push(entry);
        } else {
            // Oldest entry overwritten once the table wraps.
            self.entries[self.pos] = entry;
            self.pos = (self.pos + 1) % DUP_FILTER_CAPACITY;
        }
        false
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.pos = 0;
    }
}

struct ScanInner {
    handle: Option<u8>,
    state: ScanState,
    params: ScanParams,
    stop_cause: ScanStopCause,
    duration: u16,
    period: u16,
    filter_duplicates: bool,
    content_filter: Option<ScanContentFilter>,
    dup: DupFilter,
}

/// The scan session slot.
pub(crate) struct ScanSession {
    inner: Mutex<ScanInner>,
}

impl ScanSession {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ScanInner {
                handle: None,
                state: ScanState::Idle,
                params: ScanParams::default(),
                stop_cause: ScanStopCause::User,
                duration: 0,
                period: 0,
                filter_duplicates: false,
                content_filter: None,
                dup: DupFilter::new(),
            }),
        }
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.handle = None;
        inner.state = ScanState::Idle;
        inner.params = ScanParams::default();
        inner.stop_cause = ScanStopCause::User;
        inner.duration = 0;
        inner.period = 0;
        inner.filter_duplicates = false;
        inner.content_filter = None;
        inner.dup.clear();
    }

    pub fn state(&self) -> ScanState {
        self.inner.lock().state
    }

    pub fn set_state(&self, state: ScanState) {
        self.inner.lock().state = state;
    }

    pub fn handle(&self) -> Option<u8> {
        self.inner.lock().handle
    }

    pub fn set_handle(&self, handle: Option<u8>) {
        self.inner.lock().handle = handle;
    }

    pub fn params(&self) -> ScanParams {
        self.inner.lock().params.clone()
    }

    pub fn duration_and_period(&self) -> (u16, u16) {
        let inner = self.inner.lock();
        (inner.duration, inner.period)
    }

    pub fn stop_cause(&self) -> ScanStopCause {
        self.inner.lock().stop_cause
    }

    pub fn set_stop_cause(&self, cause: ScanStopCause) {
        self.inner.lock().stop_cause = cause;
    }

    /// Stage scan parameters before the start chain runs. Fails unless the
    /// session is idle.
    pub fn configure(
        &self,
        params: Option<ScanParams>,
        filter_duplicates: bool,
        content_filter: Option<ScanContentFilter>,
    ) -> AdapterResult<()> {
        let mut inner = self.inner.lock();
        if inner.state != ScanState::Idle {
            return Err(AdapterError::InvalidState("scan already running"));
        }
        if let Some(params) = params {
            inner.params = params;
        }
        inner.filter_duplicates = filter_duplicates;
        inner.content_filter = content_filter;
        inner.dup.clear();
        Ok(())
    }

    /// Duplicate-filter bookkeeping reset, used when a session ends.
    pub fn clear_reports(&self) {
        self.inner.lock().dup.clear();
    }

    /// Decide whether a raw report reaches the application: the session
    /// must be scanning, the report must pass the content filter and must
    /// not be a duplicate (when duplicate filtering is on).
    pub fn accept_report(
        &self,
        addr: &BdAddr,
        addr_type: AddrType,
        report_type: AdvReportType,
        data: &[u8],
    ) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != ScanState::Scanning {
            return false;
        }
        if let Some(filter) = &inner.content_filter {
            let start = filter.offset as usize;
            let end = start + filter.pattern.len();
            if data.len() < end || data[start..end] != filter.pattern[..] {
                return false;
            }
        }
        if inner.filter_duplicates {
            let entry = DupEntry {
                addr: *addr,
                addr_type,
                report_type,
            };
            if inner.dup.check_and_insert(entry) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u8) -> BdAddr {
        BdAddr([last, 0, 0, 0, 0, 0])
    }

    #[test]
    fn reports_rejected_while_idle() {
        let session = ScanSession::new();
        assert!(!session.accept_report(
            &addr(1),
            AddrType::Public,
            AdvReportType::ConnectableUndirected,
            &[]
        ));
    }

    #[test]
    fn duplicate_filtering() {
        let session = ScanSession::new();
        session.configure(None, true, None).unwrap();
        session.set_state(ScanState::Scanning);

        assert!(session.accept_report(
            &addr(1),
            AddrType::Public,
            AdvReportType::ConnectableUndirected,
            &[1, 2]
        ));
        assert!(!session.accept_report(
            &addr(1),
            AddrType::Public,
            AdvReportType::ConnectableUndirected,
            &[1, 2]
        ));
        // A different report type from the same device is not a duplicate.
        assert!(session.accept_report(
            &addr(1),
            AddrType::Public,
            AdvReportType::ScanResponse,
            &[1, 2]
        ));
    }

    #[test]
    fn content_filter_matches_at_offset() {
        let session = ScanSession::new();
        session
            .configure(
                None,
                false,
                Some(ScanContentFilter {
                    offset: 2,
                    pattern: vec![0xAA, 0xBB],
                }),
            )
            .unwrap();
        session.set_state(ScanState::Scanning);

        assert!(session.accept_report(
            &addr(2),
            AddrType::Public,
            AdvReportType::ConnectableUndirected,
            &[0, 0, 0xAA, 0xBB, 9]
        ));
        assert!(!session.accept_report(
            &addr(2),
            AddrType::Public,
            AdvReportType::ConnectableUndirected,
            &[0, 0, 0xAA, 0xCC]
        ));
        assert!(!session.accept_report(
            &addr(2),
            AddrType::Public,
            AdvReportType::ConnectableUndirected,
            &[0, 0, 0xAA]
        ));
    }

    #[test]
    fn configure_rejected_mid_session() {
        let session = ScanSession::new();
        session.set_state(ScanState::Scanning);
        assert_eq!(
            session.configure(None, false, None).unwrap_err(),
            AdapterError::InvalidState("scan already running")
        );
    }
}
