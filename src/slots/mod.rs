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

//! Fixed-capacity slot tables.
//!
//! Each table is guarded by a `parking_lot` lock with short critical
//! sections only. A slot is either free or owned by exactly one logical
//! entity; the worker that drives the transition into the terminal state
//! is the one that frees the slot.

pub mod adv;
pub mod conn;
pub mod scan;

use parking_lot::Mutex;

/// Allocator for controller activity indices, shared between advertising
/// sets, the scan session and the initiator.
pub(crate) struct IndexAllocator {
    used: Mutex<u32>,
    capacity: u8,
}

impl IndexAllocator {
    pub fn new(capacity: u8) -> Self {
        debug_assert!(capacity <= 32);
        Self {
            used: Mutex::new(0),
            capacity,
        }
    }

    /// Claim the lowest free index, if any.
    pub fn alloc(&self) -> Option<u8> {
        let mut used = self.used.lock();
        for idx in 0..self.capacity {
            if *used & (1 << idx) == 0 {
                *used |= 1 << idx;
                return Some(idx);
            }
        }
        None
    }

    pub fn free(&self, idx: u8) {
        let mut used = self.used.lock();
        *used &= !(1 << idx);
    }

    pub fn reset(&self) {
        *self.used.lock() = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_lowest_free_index() {
        let ids = IndexAllocator::new(3);
        assert_eq!(ids.alloc(), Some(0));
        assert_eq!(ids.alloc(), Some(1));
        ids.free(0);
        assert_eq!(ids.alloc(), Some(0));
        assert_eq!(ids.alloc(), Some(2));
        assert_eq!(ids.alloc(), None);
    }
}
