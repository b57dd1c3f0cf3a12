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

//! Persisted bonding and whitelist storage.
//!
//! The persistence backend is a synchronous, fallible get/set-blob
//! key-value collaborator behind [`BlobStore`]. [`BondStorage`] keeps the
//! link-key table and whitelist in memory and syncs each mutation back to
//! the store.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::AdapterError;
use crate::types::{AddrType, BdAddr, PeerAddress, MAX_BOND_COUNT, MAX_WHITELIST_COUNT};

/// Key under which the bond table blob is stored.
pub const BOND_INFO_KEY: &str = "bluetooth_bond_info";
/// Key under which the whitelist blob is stored.
pub const WHITELIST_INFO_KEY: &str = "bluetooth_whitelist_info";

/// Failure of the persistence backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct StorageError(pub String);

impl From<StorageError> for AdapterError {
    fn from(e: StorageError) -> Self {
        AdapterError::Storage(e.0)
    }
}

/// Synchronous get/set-blob key-value store.
pub trait BlobStore: Send + Sync + 'static {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;
    fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;
    fn delete(&self, key: &str) -> Result<(), StorageError>;
}

/// In-memory store, for tests and volatile deployments.
#[derive(Default)]
pub struct MemoryBlobStore {
    map: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlobStore for MemoryBlobStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.map.read().get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.map.write().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.map.write().remove(key);
        Ok(())
    }
}

/// One JSON file per key inside a data directory.
pub struct FileBlobStore {
    dir: PathBuf,
}

impl FileBlobStore {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .map_err(|e| StorageError(format!("create {}: {}", dir.display(), e)))?;
        Ok(Self { dir })
    }

    /// Platform data directory for this adapter.
    pub fn default_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("ble-host-adapter")
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }
}

impl BlobStore for FileBlobStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        match std::fs::read(self.path(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError(format!("read {}: {}", key, e))),
        }
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        std::fs::write(self.path(key), value)
            .map_err(|e| StorageError(format!("write {}: {}", key, e)))
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        match std::fs::remove_file(self.path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError(format!("delete {}: {}", key, e))),
        }
    }
}

mod hex_key {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 16], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 16], D::Error> {
        let text = String::deserialize(deserializer)?;
        let raw = hex::decode(&text).map_err(serde::de::Error::custom)?;
        raw.try_into()
            .map_err(|_| serde::de::Error::custom("key must be 16 bytes"))
    }
}

/// Key material for one bonded peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BondRecord {
    pub peer: PeerAddress,
    /// Identity address behind a resolvable private address, when the
    /// peer distributed one.
    pub identity: Option<PeerAddress>,
    #[serde(with = "hex_key")]
    pub peer_ltk: [u8; 16],
    #[serde(with = "hex_key")]
    pub local_ltk: [u8; 16],
    #[serde(with = "hex_key")]
    pub peer_irk: [u8; 16],
    pub bonded_at: DateTime<Utc>,
}

impl BondRecord {
    pub fn new(peer: PeerAddress) -> Self {
        Self {
            peer,
            identity: None,
            peer_ltk: [0; 16],
            local_ltk: [0; 16],
            peer_irk: [0; 16],
            bonded_at: Utc::now(),
        }
    }
}

/// The in-memory bond table and whitelist, synced to a [`BlobStore`].
pub struct BondStorage {
    store: Arc<dyn BlobStore>,
    bonds: RwLock<Vec<BondRecord>>,
    whitelist: RwLock<Vec<PeerAddress>>,
}

impl BondStorage {
    /// Load both tables from the store; absent or corrupt blobs start
    /// empty.
    pub fn load(store: Arc<dyn BlobStore>) -> Result<Self, StorageError> {
        let bonds = match store.get(BOND_INFO_KEY)? {
            Some(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!("bond blob unreadable, starting empty: {}", e);
                Vec::new()
            }),
            None => Vec::new(),
        };
        let whitelist = match store.get(WHITELIST_INFO_KEY)? {
            Some(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!("whitelist blob unreadable, starting empty: {}", e);
                Vec::new()
            }),
            None => Vec::new(),
        };
        info!(
            "Bond storage loaded: {} bond(s), {} whitelist entr(ies)",
            bonds.len(),
            whitelist.len()
        );
        Ok(Self {
            store,
            bonds: RwLock::new(bonds),
            whitelist: RwLock::new(whitelist),
        })
    }

    fn sync_bonds(&self) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(&*self.bonds.read())
            .map_err(|e| StorageError(format!("encode bonds: {}", e)))?;
        self.store.put(BOND_INFO_KEY, &bytes)
    }

    fn sync_whitelist(&self) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(&*self.whitelist.read())
            .map_err(|e| StorageError(format!("encode whitelist: {}", e)))?;
        self.store.put(WHITELIST_INFO_KEY, &bytes)
    }

    /// Store or overwrite the record for its peer address.
    pub fn save_bond(&self, record: BondRecord) -> Result<(), AdapterError> {
        {
            let mut bonds = self.bonds.write();
            if let Some(existing) = bonds.iter_mut().find(|r| {
                r.peer.addr == record.peer.addr && r.peer.addr_type == record.peer.addr_type
            }) {
                *existing = record;
            } else {
                if bonds.len() >= MAX_BOND_COUNT {
                    return Err(AdapterError::ResourceExhausted);
                }
                debug!("new bond stored for {}", record.peer);
                bonds.push(record);
            }
        }
        self.sync_bonds().map_err(AdapterError::from)
    }

    /// Look a bond up by exact peer address or by identity address.
    pub fn find(&self, addr: &BdAddr, addr_type: AddrType) -> Option<BondRecord> {
        let bonds = self.bonds.read();
        bonds
            .iter()
            .find(|r| {
                (r.peer.addr == *addr && r.peer.addr_type == addr_type)
                    || r.identity.is_some_and(|id| id.addr == *addr)
            })
            .cloned()
    }

    /// Map a resolvable private address back to the address the bond was
    /// stored under; other addresses pass through unchanged.
    pub fn resolve_identity(&self, peer: PeerAddress) -> PeerAddress {
        if !peer.addr_type.is_resolvable() {
            return peer;
        }
        let bonds = self.bonds.read();
        bonds
            .iter()
            .find(|r| r.identity.is_some_and(|id| id.addr == peer.addr))
            .map(|r| r.peer)
            .unwrap_or(peer)
    }

    pub fn delete_bond(&self, addr: &BdAddr, addr_type: AddrType) -> Result<(), AdapterError> {
        {
            let mut bonds = self.bonds.write();
            bonds.retain(|r| !(r.peer.addr == *addr && r.peer.addr_type == addr_type));
        }
        self.sync_bonds().map_err(AdapterError::from)
    }

    pub fn clear_bonds(&self) -> Result<(), AdapterError> {
        self.bonds.write().clear();
        self.sync_bonds().map_err(AdapterError::from)
    }

    pub fn bonded_devices(&self) -> Vec<PeerAddress> {
        self.bonds.read().iter().map(|r| r.peer).collect()
    }

    pub fn bond_count(&self) -> usize {
        self.bonds.read().len()
    }

    // --- whitelist ---

    pub fn whitelist_add(&self, peer: PeerAddress) -> Result<(), AdapterError> {
        {
            let mut whitelist = self.whitelist.write();
            if !whitelist.contains(&peer) {
                if whitelist.len() >= MAX_WHITELIST_COUNT {
                    return Err(AdapterError::ResourceExhausted);
                }
                whitelist.push(peer);
            }
        }
        self.sync_whitelist().map_err(AdapterError::from)
    }

    pub fn whitelist_remove(&self, peer: &PeerAddress) -> Result<(), AdapterError> {
        self.whitelist.write().retain(|p| p != peer);
        self.sync_whitelist().map_err(AdapterError::from)
    }

    pub fn whitelist_clear(&self) -> Result<(), AdapterError> {
        self.whitelist.write().clear();
        self.sync_whitelist().map_err(AdapterError::from)
    }

    pub fn whitelist_contains(&self, peer: &PeerAddress) -> bool {
        self.whitelist.read().contains(peer)
    }

    pub fn whitelist_entries(&self) -> Vec<PeerAddress> {
        self.whitelist.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(last: u8, addr_type: AddrType) -> PeerAddress {
        PeerAddress {
            addr: BdAddr([last, 0, 0, 0, 0, 0]),
            addr_type,
        }
    }

    #[test]
    fn bond_round_trip_through_store() {
        let store = Arc::new(MemoryBlobStore::new());
        let bonds = BondStorage::load(store.clone()).unwrap();
        bonds
            .save_bond(BondRecord::new(peer(1, AddrType::Public)))
            .unwrap();

        // A fresh load sees the persisted record.
        let reloaded = BondStorage::load(store).unwrap();
        assert_eq!(reloaded.bond_count(), 1);
        assert!(reloaded
            .find(&BdAddr([1, 0, 0, 0, 0, 0]), AddrType::Public)
            .is_some());
    }

    #[test]
    fn save_overwrites_same_peer() {
        let bonds = BondStorage::load(Arc::new(MemoryBlobStore::new())).unwrap();
        let mut record = BondRecord::new(peer(1, AddrType::Public));
        bonds.save_bond(record.clone()).unwrap();
        record.peer_ltk = [7; 16];
        bonds.save_bond(record).unwrap();
        assert_eq!(bonds.bond_count(), 1);
        assert_eq!(
            bonds
                .find(&BdAddr([1, 0, 0, 0, 0, 0]), AddrType::Public)
                .unwrap()
                .peer_ltk,
            [7; 16]
        );
    }

    #[test]
    fn bond_table_capacity() {
        let bonds = BondStorage::load(Arc::new(MemoryBlobStore::new())).unwrap();
        for i in 0..MAX_BOND_COUNT {
            bonds
                .save_bond(BondRecord::new(peer(i as u8, AddrType::Public)))
                .unwrap();
        }
        assert_eq!(
            bonds
                .save_bond(BondRecord::new(peer(0xEE, AddrType::Public)))
                .unwrap_err(),
            AdapterError::ResourceExhausted
        );
    }

    #[test]
    fn resolve_identity_maps_rpa() {
        let bonds = BondStorage::load(Arc::new(MemoryBlobStore::new())).unwrap();
        let pseudo = peer(1, AddrType::Public);
        let mut record = BondRecord::new(pseudo);
        record.identity = Some(peer(0x42, AddrType::RandomResolvable));
        bonds.save_bond(record).unwrap();

        let resolved = bonds.resolve_identity(peer(0x42, AddrType::RandomResolvable));
        assert_eq!(resolved, pseudo);
        // Unknown addresses pass through.
        let unknown = peer(0x99, AddrType::RandomResolvable);
        assert_eq!(bonds.resolve_identity(unknown), unknown);
    }

    #[test]
    fn whitelist_dedupes_and_persists() {
        let store = Arc::new(MemoryBlobStore::new());
        let bonds = BondStorage::load(store.clone()).unwrap();
        bonds.whitelist_add(peer(5, AddrType::Public)).unwrap();
        bonds.whitelist_add(peer(5, AddrType::Public)).unwrap();
        assert_eq!(bonds.whitelist_entries().len(), 1);

        let reloaded = BondStorage::load(store).unwrap();
        assert!(reloaded.whitelist_contains(&peer(5, AddrType::Public)));
    }

    #[test]
    fn file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBlobStore::new(dir.path()).unwrap();
        assert_eq!(store.get("missing").unwrap(), None);
        store.put("k", b"payload").unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some(&b"payload"[..]));
        store.delete("k").unwrap();
        assert_eq!(store.get("k").unwrap(), None);
        store.delete("k").unwrap();
    }
}
