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

//! The attribute registry built at server-registration time.
//!
//! The application's profile table (service / characteristic / descriptor
//! entries) is expanded into the attribute layout the controller expects:
//! a service declaration, a declaration/value pair per characteristic and
//! one attribute per descriptor. The resulting map from external attribute
//! handle to (service index, attribute index) is read-only after
//! construction.

use parking_lot::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{AdapterError, AdapterResult};
use crate::firmware::{ServiceAttribute, ServiceDefinition};
use crate::types::{
    AttrCallback, AttrHandle, AttrPermissions, AttrProperties, GattAttrType, GattProfileEntry,
    CCCD_UUID, CHARACTERISTIC_DECL_UUID, PRIMARY_SERVICE_DECL_UUID,
};

/// Largest stored attribute value.
pub(crate) const ATTR_MAX_VALUE_LEN: usize = 512;

/// What one registered attribute is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AttrKind {
    ServiceDecl,
    CharacteristicDecl,
    Value,
    Descriptor,
    Cccd,
}

pub(crate) struct AttrRecord {
    pub uuid: Uuid,
    pub kind: AttrKind,
    pub properties: AttrProperties,
    pub permissions: AttrPermissions,
    pub callback: Option<AttrCallback>,
    /// Error code returned to peer reads/writes; zero accepts.
    pub reject: u8,
    pub value: Vec<u8>,
    pub cccd: u16,
}

impl AttrRecord {
    fn new(uuid: Uuid, kind: AttrKind) -> Self {
        Self {
            uuid,
            kind,
            properties: AttrProperties::default(),
            permissions: AttrPermissions::default(),
            callback: None,
            reject: 0,
            value: Vec::new(),
            cccd: 0,
        }
    }
}

pub(crate) struct ServiceRecord {
    pub uuid: Uuid,
    pub start_handle: AttrHandle,
    pub attrs: Vec<AttrRecord>,
}

impl ServiceRecord {
    fn contains(&self, handle: AttrHandle) -> bool {
        handle >= self.start_handle
            && (handle - self.start_handle) < self.attrs.len() as AttrHandle
    }
}

/// Summary of the attribute an incoming peer operation targets.
pub(crate) struct AttrTarget {
    pub handle: AttrHandle,
    pub kind: AttrKind,
    pub reject: u8,
    pub callback: Option<AttrCallback>,
}

/// The attribute registry. Concurrent reads; writes only for attribute
/// values, reject codes and CCCD bits.
pub(crate) struct ServerRegistry {
    services: RwLock<Vec<ServiceRecord>>,
}

impl std::fmt::Debug for ServerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerRegistry")
            .field("services", &self.services.read().len())
            .finish()
    }
}

impl ServerRegistry {
    /// Expand a profile table into the registry.
    pub fn build(profiles: &[GattProfileEntry]) -> AdapterResult<Self> {
        let mut services: Vec<ServiceRecord> = Vec::new();
        let mut char_seen = false;

        for entry in profiles {
            match entry.entry_type {
                GattAttrType::Service => {
                    if entry.attr_handle == 0 {
                        return Err(AdapterError::InvalidArgument("service handle is zero"));
                    }
                    if let Some(last) = services.last() {
                        let last_end = last.start_handle + last.attrs.len() as AttrHandle;
                        if entry.attr_handle < last_end {
                            return Err(AdapterError::InvalidArgument(
                                "service handle ranges overlap",
                            ));
                        }
                    }
                    let mut decl = AttrRecord::new(PRIMARY_SERVICE_DECL_UUID, AttrKind::ServiceDecl);
                    decl.callback = entry.callback.clone();
                    services.push(ServiceRecord {
                        uuid: entry.uuid,
                        start_handle: entry.attr_handle,
                        attrs: vec![decl],
                    });
                    char_seen = false;
                }
                GattAttrType::Characteristic => {
                    let service = services.last_mut().ok_or(AdapterError::InvalidArgument(
                        "characteristic before any service",
                    ))?;
                    let decl_handle =
                        service.start_handle + service.attrs.len() as AttrHandle;
                    if decl_handle != entry.attr_handle {
                        warn!(
                            "characteristic handle {:#x} does not match layout {:#x}",
                            entry.attr_handle, decl_handle
                        );
                    }
                    service
                        .attrs
                        .push(AttrRecord::new(CHARACTERISTIC_DECL_UUID, AttrKind::CharacteristicDecl));
                    let mut value = AttrRecord::new(entry.uuid, AttrKind::Value);
                    value.properties = entry.properties;
                    value.permissions = entry.permissions;
                    value.callback = entry.callback.clone();
                    service.attrs.push(value);
                    char_seen = true;
                }
                GattAttrType::Descriptor => {
                    if !char_seen {
                        return Err(AdapterError::InvalidArgument(
                            "descriptor before any characteristic",
                        ));
                    }
                    let service = services.last_mut().ok_or(AdapterError::InvalidArgument(
                        "descriptor before any service",
                    ))?;
                    let kind = if entry.uuid == CCCD_UUID {
                        AttrKind::Cccd
                    } else {
                        AttrKind::Descriptor
                    };
                    let mut desc = AttrRecord::new(entry.uuid, kind);
                    desc.permissions = entry.permissions;
                    desc.callback = entry.callback.clone();
                    service.attrs.push(desc);
                }
            }
        }

        for (index, service) in services.iter().enumerate() {
            debug!(
                "service {} uuid {} start {:#x} with {} attribute(s)",
                index,
                service.uuid,
                service.start_handle,
                service.attrs.len()
            );
        }

        Ok(Self {
            services: RwLock::new(services),
        })
    }

    pub fn service_count(&self) -> usize {
        self.services.read().len()
    }

    /// Firmware-facing attribute tables, one per service.
    pub fn service_definitions(&self) -> Vec<ServiceDefinition> {
        let services = self.services.read();
        services
            .iter()
            .enumerate()
            .map(|(index, service)| ServiceDefinition {
                service_index: index as u8,
                uuid: service.uuid,
                start_handle: service.start_handle,
                attributes: service
                    .attrs
                    .iter()
                    .map(|attr| ServiceAttribute {
                        uuid: attr.uuid,
                        properties: attr.properties,
                        permissions: attr.permissions,
                        max_len: ATTR_MAX_VALUE_LEN as u16,
                    })
                    .collect(),
            })
            .collect()
    }

    /// External handle of (service index, attribute index).
    pub fn handle_of(&self, service_index: u8, attr_index: u16) -> Option<AttrHandle> {
        let services = self.services.read();
        let service = services.get(service_index as usize)?;
        if (attr_index as usize) < service.attrs.len() {
            Some(service.start_handle + attr_index)
        } else {
            None
        }
    }

    /// (service index, attribute index) behind an external handle.
    pub fn locate(&self, handle: AttrHandle) -> Option<(u8, u16)> {
        if handle == 0 {
            return None;
        }
        let services = self.services.read();
        services
            .iter()
            .position(|service| service.contains(handle))
            .map(|index| {
                let offset = handle - services[index].start_handle;
                (index as u8, offset)
            })
    }

    /// Locate a characteristic value attribute, for notify/indicate.
    pub fn locate_value(&self, handle: AttrHandle) -> AdapterResult<(u8, u16)> {
        let (service, index) = self
            .locate(handle)
            .ok_or(AdapterError::InvalidArgument("unknown attribute handle"))?;
        let services = self.services.read();
        match services[service as usize].attrs[index as usize].kind {
            AttrKind::Value => Ok((service, index)),
            _ => Err(AdapterError::InvalidArgument(
                "not a characteristic value attribute",
            )),
        }
    }

    /// Snapshot of the attribute an incoming peer operation targets.
    pub fn target(&self, service_index: u8, attr_index: u16) -> Option<AttrTarget> {
        let handle = self.handle_of(service_index, attr_index)?;
        let services = self.services.read();
        let attr = services
            .get(service_index as usize)?
            .attrs
            .get(attr_index as usize)?;
        Some(AttrTarget {
            handle,
            kind: attr.kind,
            reject: attr.reject,
            callback: attr.callback.clone(),
        })
    }

    fn with_attr<R>(
        &self,
        handle: AttrHandle,
        f: impl FnOnce(&mut AttrRecord) -> AdapterResult<R>,
    ) -> AdapterResult<R> {
        let (service, index) = self
            .locate(handle)
            .ok_or(AdapterError::InvalidArgument("unknown attribute handle"))?;
        let mut services = self.services.write();
        f(&mut services[service as usize].attrs[index as usize])
    }

    /// Store an application-supplied attribute value. Declarations carry
    /// no application data.
    pub fn set_value(&self, handle: AttrHandle, data: &[u8]) -> AdapterResult<()> {
        if data.len() > ATTR_MAX_VALUE_LEN {
            return Err(AdapterError::InvalidArgument("attribute value too long"));
        }
        self.with_attr(handle, |attr| match attr.kind {
            AttrKind::ServiceDecl | AttrKind::CharacteristicDecl => Err(
                AdapterError::InvalidArgument("cannot set declaration attribute data"),
            ),
            _ => {
                attr.value = data.to_vec();
                Ok(())
            }
        })
    }

    pub fn get_value(&self, handle: AttrHandle) -> AdapterResult<Vec<u8>> {
        self.with_attr(handle, |attr| match attr.kind {
            AttrKind::ServiceDecl | AttrKind::CharacteristicDecl => Err(
                AdapterError::InvalidArgument("cannot get declaration attribute data"),
            ),
            _ => Ok(attr.value.clone()),
        })
    }

    /// Configure the error code future peer reads/writes of this attribute
    /// receive; zero accepts again.
    pub fn set_reject(&self, handle: AttrHandle, code: u8) -> AdapterResult<()> {
        self.with_attr(handle, |attr| {
            attr.reject = code;
            Ok(())
        })
    }

    /// Store an accepted peer write, truncating to the attribute capacity.
    pub fn commit_peer_write(&self, service_index: u8, attr_index: u16, data: &[u8]) {
        let mut services = self.services.write();
        if let Some(attr) = services
            .get_mut(service_index as usize)
            .and_then(|s| s.attrs.get_mut(attr_index as usize))
        {
            let len = data.len().min(ATTR_MAX_VALUE_LEN);
            if len < data.len() {
                warn!(
                    "peer write of {} byte(s) truncated to {}",
                    data.len(),
                    len
                );
            }
            attr.value = data[..len].to_vec();
        }
    }

    pub fn set_cccd(&self, service_index: u8, attr_index: u16, bits: u16) {
        let mut services = self.services.write();
        if let Some(attr) = services
            .get_mut(service_index as usize)
            .and_then(|s| s.attrs.get_mut(attr_index as usize))
        {
            attr.cccd = bits;
        }
    }

    pub fn cccd_bits(&self, service_index: u8, attr_index: u16) -> u16 {
        let services = self.services.read();
        services
            .get(service_index as usize)
            .and_then(|s| s.attrs.get(attr_index as usize))
            .map(|attr| attr.cccd)
            .unwrap_or(0)
    }

    /// Stored value of (service index, attribute index), for read
    /// responses.
    pub fn value_at(&self, service_index: u8, attr_index: u16) -> Vec<u8> {
        let services = self.services.read();
        services
            .get(service_index as usize)
            .and_then(|s| s.attrs.get(attr_index as usize))
            .map(|attr| attr.value.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::uuid16;

    fn service(handle: AttrHandle, uuid: Uuid) -> GattProfileEntry {
        GattProfileEntry {
            entry_type: GattAttrType::Service,
            uuid,
            attr_handle: handle,
            properties: AttrProperties::default(),
            permissions: AttrPermissions::default(),
            callback: None,
        }
    }

    fn characteristic(handle: AttrHandle, uuid: Uuid) -> GattProfileEntry {
        GattProfileEntry {
            entry_type: GattAttrType::Characteristic,
            uuid,
            attr_handle: handle,
            properties: AttrProperties {
                read: true,
                write: true,
                notify: true,
                ..AttrProperties::default()
            },
            permissions: AttrPermissions::default(),
            callback: None,
        }
    }

    fn descriptor(handle: AttrHandle, uuid: Uuid) -> GattProfileEntry {
        GattProfileEntry {
            entry_type: GattAttrType::Descriptor,
            uuid,
            attr_handle: handle,
            properties: AttrProperties::default(),
            permissions: AttrPermissions::default(),
            callback: None,
        }
    }

    fn sample() -> ServerRegistry {
        // Service at 0x10: decl, char decl, char value, CCCD.
        ServerRegistry::build(&[
            service(0x10, uuid16(0x180F)),
            characteristic(0x11, uuid16(0x2A19)),
            descriptor(0x13, CCCD_UUID),
        ])
        .unwrap()
    }

    #[test]
    fn layout_expands_declaration_pairs() {
        let registry = sample();
        assert_eq!(registry.service_count(), 1);
        let defs = registry.service_definitions();
        assert_eq!(defs[0].attributes.len(), 4);
        assert_eq!(defs[0].start_handle, 0x10);
    }

    #[test]
    fn handle_translation_round_trips() {
        let registry = sample();
        assert_eq!(registry.locate(0x12), Some((0, 2)));
        assert_eq!(registry.handle_of(0, 2), Some(0x12));
        assert_eq!(registry.locate(0x14), None);
        assert_eq!(registry.locate(0), None);
    }

    #[test]
    fn cccd_is_recognised() {
        let registry = sample();
        let target = registry.target(0, 3).unwrap();
        assert_eq!(target.kind, AttrKind::Cccd);
        registry.set_cccd(0, 3, 0x0001);
        assert_eq!(registry.cccd_bits(0, 3), 0x0001);
    }

    #[test]
    fn declarations_carry_no_data() {
        let registry = sample();
        assert!(registry.set_value(0x10, &[1]).is_err());
        assert!(registry.set_value(0x11, &[1]).is_err());
        registry.set_value(0x12, &[1, 2, 3]).unwrap();
        assert_eq!(registry.get_value(0x12).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn locate_value_rejects_non_values() {
        let registry = sample();
        assert!(registry.locate_value(0x12).is_ok());
        assert!(registry.locate_value(0x10).is_err());
        assert!(registry.locate_value(0x13).is_err());
    }

    #[test]
    fn descriptor_requires_characteristic() {
        let err = ServerRegistry::build(&[
            service(0x10, uuid16(0x180F)),
            descriptor(0x11, CCCD_UUID),
        ])
        .unwrap_err();
        assert_eq!(
            err,
            AdapterError::InvalidArgument("descriptor before any characteristic")
        );
    }

    #[test]
    fn overlapping_services_rejected() {
        let err = ServerRegistry::build(&[
            service(0x10, uuid16(0x180F)),
            characteristic(0x11, uuid16(0x2A19)),
            service(0x11, uuid16(0x1810)),
        ])
        .unwrap_err();
        assert_eq!(
            err,
            AdapterError::InvalidArgument("service handle ranges overlap")
        );
    }

    #[test]
    fn peer_write_truncates_to_capacity() {
        let registry = sample();
        registry.commit_peer_write(0, 2, &vec![0xAB; ATTR_MAX_VALUE_LEN + 9]);
        assert_eq!(registry.value_at(0, 2).len(), ATTR_MAX_VALUE_LEN);
    }
}
