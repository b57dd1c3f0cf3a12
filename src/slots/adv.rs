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

//! Advertising slot table.
//!
//! Three allocation policies share the table: the single static
//! advertisement (parameters kept in a reusable template), multi
//! advertising sets (one slot per handle) and one-shot advertisements
//! (a small pool of parameter records keyed by caller-supplied id, only
//! occupying a slot while enabled).

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{AdapterError, AdapterResult};
use crate::firmware::AdvStopReason;
use crate::types::{
    AdvKind, AdvParams, AdvState, BdAddr, OneShotId, ADV_SLOT_COUNT, ONE_SHOT_SLOT_COUNT,
};

/// Everything the firmware needs to run one advertisement.
#[derive(Debug, Clone, Default)]
pub(crate) struct AdvRecord {
    pub params: AdvParams,
    pub own_addr: BdAddr,
    pub adv_data: Vec<u8>,
    pub resp_data: Vec<u8>,
    /// Stop after this many advertising events; zero means unlimited.
    pub max_events: u8,
}

struct AdvSlot {
    /// Controller activity index; doubles as the public handle.
    handle: Option<u8>,
    state: AdvState,
    kind: AdvKind,
    record: AdvRecord,
    stopped_waiter: Option<oneshot::Sender<AdvStopReason>>,
}

impl Default for AdvSlot {
    fn default() -> Self {
        Self {
            handle: None,
            state: AdvState::Idle,
            kind: AdvKind::Multi,
            record: AdvRecord::default(),
            stopped_waiter: None,
        }
    }
}

struct AdvTableInner {
    slots: [AdvSlot; ADV_SLOT_COUNT],
    static_template: AdvRecord,
    static_handle: Option<u8>,
    oneshot: [Option<OneShotRecord>; ONE_SHOT_SLOT_COUNT],
}

#[derive(Debug, Clone)]
struct OneShotRecord {
    id: OneShotId,
    record: AdvRecord,
}

/// The advertising slot table.
pub(crate) struct AdvTable {
    inner: Mutex<AdvTableInner>,
}

impl AdvTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(AdvTableInner {
                slots: std::array::from_fn(|_| AdvSlot::default()),
                static_template: AdvRecord::default(),
                static_handle: None,
                oneshot: std::array::from_fn(|_| None),
            }),
        }
    }

    /// Reset every slot, template and one-shot record to defaults.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        *inner = AdvTableInner {
            slots: std::array::from_fn(|_| AdvSlot::default()),
            static_template: AdvRecord::default(),
            static_handle: None,
            oneshot: std::array::from_fn(|_| None),
        };
    }

    /// Claim a free slot for the given firmware handle.
    pub fn occupy(&self, handle: u8, kind: AdvKind, record: AdvRecord) -> AdapterResult<()> {
        let mut inner = self.inner.lock();
        if inner.slots.iter().any(|s| s.handle == Some(handle)) {
            return Err(AdapterError::Inconsistent("advertising handle reused"));
        }
        let slot = inner
            .slots
            .iter_mut()
            .find(|s| s.handle.is_none())
            .ok_or(AdapterError::ResourceExhausted)?;
        slot.handle = Some(handle);
        slot.state = AdvState::Idle;
        slot.kind = kind;
        slot.record = record;
        slot.stopped_waiter = None;
        Ok(())
    }

    /// Release the slot owning `handle`.
    pub fn release(&self, handle: u8) {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.slots.iter_mut().find(|s| s.handle == Some(handle)) {
            *slot = AdvSlot::default();
        }
        if inner.static_handle == Some(handle) {
            inner.static_handle = None;
        }
    }

    pub fn state_of(&self, handle: u8) -> Option<AdvState> {
        let inner = self.inner.lock();
        inner
            .slots
            .iter()
            .find(|s| s.handle == Some(handle))
            .map(|s| s.state)
    }

    pub fn kind_of(&self, handle: u8) -> Option<AdvKind> {
        let inner = self.inner.lock();
        inner
            .slots
            .iter()
            .find(|s| s.handle == Some(handle))
            .map(|s| s.kind)
    }

    pub fn set_state(&self, handle: u8, state: AdvState) -> AdapterResult<()> {
        let mut inner = self.inner.lock();
        let slot = inner
            .slots
            .iter_mut()
            .find(|s| s.handle == Some(handle))
            .ok_or(AdapterError::Inconsistent("advertising handle not found"))?;
        slot.state = state;
        Ok(())
    }

    /// Copy of the record backing `handle`.
    pub fn record_of(&self, handle: u8) -> Option<AdvRecord> {
        let inner = self.inner.lock();
        inner
            .slots
            .iter()
            .find(|s| s.handle == Some(handle))
            .map(|s| s.record.clone())
    }

    /// Mutate the record backing `handle`; returns the slot state so the
    /// caller can decide whether a restart is needed.
    pub fn update_record<F>(&self, handle: u8, mutate: F) -> AdapterResult<AdvState>
    where
        F: FnOnce(&mut AdvRecord),
    {
        let mut inner = self.inner.lock();
        let slot = inner
            .slots
            .iter_mut()
            .find(|s| s.handle == Some(handle))
            .ok_or(AdapterError::InvalidArgument("unknown advertising handle"))?;
        mutate(&mut slot.record);
        Ok(slot.state)
    }

    // --- static advertisement ---

    pub fn static_handle(&self) -> Option<u8> {
        self.inner.lock().static_handle
    }

    pub fn set_static_handle(&self, handle: Option<u8>) {
        self.inner.lock().static_handle = handle;
    }

    /// True while the reserved static advertisement is on air.
    pub fn static_advertising(&self) -> bool {
        let inner = self.inner.lock();
        match inner.static_handle {
            Some(handle) => inner
                .slots
                .iter()
                .any(|s| s.handle == Some(handle) && s.state == AdvState::Advertising),
            None => false,
        }
    }

    /// Mutate the static parameter template. Fails while the static
    /// advertisement is on air: live parameters are immutable.
    pub fn update_static_template<F>(&self, mutate: F) -> AdapterResult<()>
    where
        F: FnOnce(&mut AdvRecord),
    {
        let mut inner = self.inner.lock();
        if let Some(handle) = inner.static_handle {
            if inner
                .slots
                .iter()
                .any(|s| s.handle == Some(handle) && s.state == AdvState::Advertising)
            {
                return Err(AdapterError::InvalidState("static advertising active"));
            }
        }
        mutate(&mut inner.static_template);
        Ok(())
    }

    pub fn static_template(&self) -> AdvRecord {
        self.inner.lock().static_template.clone()
    }

    // --- one-shot pool ---

    /// Store or update a one-shot parameter record for `id`.
    pub fn oneshot_set(&self, id: OneShotId, record: AdvRecord) -> AdapterResult<()> {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner
            .oneshot
            .iter_mut()
            .flatten()
            .find(|entry| entry.id == id)
        {
            entry.record = record;
            return Ok(());
        }
        let free = inner
            .oneshot
            .iter_mut()
            .find(|entry| entry.is_none())
            .ok_or(AdapterError::ResourceExhausted)?;
        *free = Some(OneShotRecord { id, record });
        Ok(())
    }

    pub fn oneshot_get(&self, id: OneShotId) -> Option<AdvRecord> {
        let inner = self.inner.lock();
        inner
            .oneshot
            .iter()
            .flatten()
            .find(|entry| entry.id == id)
            .map(|entry| entry.record.clone())
    }

    // --- stop waiters ---

    /// Register interest in the next firmware-initiated stop of `handle`.
    /// Any previous waiter is replaced.
    pub fn register_stop_waiter(&self, handle: u8) -> AdapterResult<oneshot::Receiver<AdvStopReason>> {
        let mut inner = self.inner.lock();
        let slot = inner
            .slots
            .iter_mut()
            .find(|s| s.handle == Some(handle))
            .ok_or(AdapterError::Inconsistent("advertising handle not found"))?;
        let (tx, rx) = oneshot::channel();
        slot.stopped_waiter = Some(tx);
        Ok(rx)
    }

    pub fn take_stop_waiter(&self, handle: u8) -> Option<oneshot::Sender<AdvStopReason>> {
        let mut inner = self.inner.lock();
        inner
            .slots
            .iter_mut()
            .find(|s| s.handle == Some(handle))
            .and_then(|s| s.stopped_waiter.take())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn occupy_and_release() {
        let table = AdvTable::new();
        table.occupy(3, AdvKind::Multi, AdvRecord::default()).unwrap();
        assert_eq!(table.state_of(3), Some(AdvState::Idle));
        table.set_state(3, AdvState::Created).unwrap();
        assert_eq!(table.state_of(3), Some(AdvState::Created));
        table.release(3);
        assert_eq!(table.state_of(3), None);
    }

    #[test]
    fn table_capacity_is_bounded() {
        let table = AdvTable::new();
        for handle in 0..ADV_SLOT_COUNT as u8 {
            table
                .occupy(handle, AdvKind::Multi, AdvRecord::default())
                .unwrap();
        }
        assert_eq!(
            table
                .occupy(10, AdvKind::Multi, AdvRecord::default())
                .unwrap_err(),
            AdapterError::ResourceExhausted
        );
    }

    #[test]
    fn duplicate_handle_is_inconsistent() {
        let table = AdvTable::new();
        table.occupy(1, AdvKind::Multi, AdvRecord::default()).unwrap();
        assert_eq!(
            table
                .occupy(1, AdvKind::Multi, AdvRecord::default())
                .unwrap_err(),
            AdapterError::Inconsistent("advertising handle reused")
        );
    }

    #[test]
    fn static_template_locked_while_advertising() {
        let table = AdvTable::new();
        table
            .occupy(0, AdvKind::Static, AdvRecord::default())
            .unwrap();
        table.set_static_handle(Some(0));
        table.set_state(0, AdvState::Advertising).unwrap();
        let err = table
            .update_static_template(|r| r.adv_data = vec![1, 2, 3])
            .unwrap_err();
        assert_eq!(err, AdapterError::InvalidState("static advertising active"));

        table.set_state(0, AdvState::Created).unwrap();
        table
            .update_static_template(|r| r.adv_data = vec![1, 2, 3])
            .unwrap();
        assert_eq!(table.static_template().adv_data, vec![1, 2, 3]);
    }

    #[test]
    fn oneshot_pool_capacity() {
        let table = AdvTable::new();
        table.oneshot_set(1, AdvRecord::default()).unwrap();
        table.oneshot_set(2, AdvRecord::default()).unwrap();
        assert_eq!(
            table.oneshot_set(3, AdvRecord::default()).unwrap_err(),
            AdapterError::ResourceExhausted
        );
        // Updating an existing id never needs a new record.
        table.oneshot_set(2, AdvRecord::default()).unwrap();
        assert!(table.oneshot_get(2).is_some());
        assert!(table.oneshot_get(3).is_none());
    }
}
