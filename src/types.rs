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

//! Shared data model: addresses, handles, states, capacities and the
//! application-facing callback bags.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Number of concurrent advertising slots.
pub const ADV_SLOT_COUNT: usize = 6;
/// Number of connection slots.
pub const CONN_SLOT_COUNT: usize = 8;
/// Number of one-shot advertising parameter records.
pub const ONE_SHOT_SLOT_COUNT: usize = 2;
/// Maximum legacy advertising / scan-response payload.
pub const MAX_ADV_DATA_LEN: usize = 31;
/// Maximum persisted bond records.
pub const MAX_BOND_COUNT: usize = 18;
/// Maximum persisted whitelist entries.
pub const MAX_WHITELIST_COUNT: usize = 32;
/// Capacity of the scan duplicate-filter table.
pub const DUP_FILTER_CAPACITY: usize = 500;
/// Maximum indications in flight per connection.
pub const MAX_PENDING_INDICATIONS: u32 = 5;
/// ATT MTU before negotiation.
pub const DEFAULT_MTU: u16 = 23;
/// Largest MTU the adapter will request.
pub const MAX_MTU: u16 = 247;
/// Command queue depth.
pub const COMMAND_QUEUE_DEPTH: usize = 10;
/// Event queue depth.
pub const EVENT_QUEUE_DEPTH: usize = 160;
/// Bounded wait for one firmware round trip.
pub const FIRMWARE_STEP_TIMEOUT: Duration = Duration::from_secs(5);
/// Bounded wait for one caller-visible operation.
pub const API_TIMEOUT: Duration = Duration::from_secs(7);
/// Bounded wait for a synchronous notification transmit.
pub const NOTIFY_TX_TIMEOUT: Duration = Duration::from_secs(14);
/// How long the initiator scans for the target before giving up (ms).
pub const CONNECT_SCAN_TIMEOUT_MS: u32 = 10_000;

/// Connection handle, assigned by the firmware.
pub type ConnHandle = u8;
/// External, stable GATT attribute handle.
pub type AttrHandle = u16;
/// Advertising-set handle, assigned at creation.
pub type AdvHandle = u8;
/// Caller-supplied one-shot advertisement id.
pub type OneShotId = u8;

const ADDR_MSB_MASK: u8 = 0xC0;
const ADDR_MSB_STATIC: u8 = 0xC0;
const ADDR_MSB_RESOLVABLE: u8 = 0x40;
const ADDR_MSB_NON_RESOLVABLE: u8 = 0x00;

/// A 48-bit Bluetooth device address, least-significant byte first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BdAddr(pub [u8; 6]);

impl BdAddr {
    /// The all-zero address.
    pub const ZERO: BdAddr = BdAddr([0; 6]);

    pub fn is_zero(&self) -> bool {
        self.0 == [0; 6]
    }

    /// Generate a random static address (two most significant bits set).
    pub fn random_static() -> BdAddr {
        let mut raw: [u8; 6] = rand::random();
        raw[5] |= ADDR_MSB_STATIC;
        BdAddr(raw)
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Rendered most-significant byte first, the usual over-the-air order.
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[5], self.0[4], self.0[3], self.0[2], self.0[1], self.0[0]
        )
    }
}

impl Serialize for BdAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for BdAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        let raw = hex::decode(&text).map_err(serde::de::Error::custom)?;
        let raw: [u8; 6] = raw
            .try_into()
            .map_err(|_| serde::de::Error::custom("address must be 6 bytes"))?;
        Ok(BdAddr(raw))
    }
}

/// Bluetooth address type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddrType {
    Public,
    RandomStatic,
    RandomResolvable,
    RandomNonResolvable,
}

impl AddrType {
    /// Classify a raw (type, address) pair the way the controller reports
    /// it: type 0 is public, type 1 is random and subdivided by the two
    /// most significant address bits.
    pub fn classify(raw_type: u8, addr: &BdAddr) -> AddrType {
        if raw_type == 0 {
            return AddrType::Public;
        }
        match addr.0[5] & ADDR_MSB_MASK {
            ADDR_MSB_STATIC => AddrType::RandomStatic,
            ADDR_MSB_RESOLVABLE => AddrType::RandomResolvable,
            ADDR_MSB_NON_RESOLVABLE => AddrType::RandomNonResolvable,
            _ => AddrType::RandomStatic,
        }
    }

    pub fn is_random(self) -> bool {
        !matches!(self, AddrType::Public)
    }

    pub fn is_resolvable(self) -> bool {
        matches!(self, AddrType::RandomResolvable)
    }
}

/// A peer device address with its type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddress {
    pub addr: BdAddr,
    pub addr_type: AddrType,
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?})", self.addr, self.addr_type)
    }
}

/// The address an advertisement is sent from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OwnAddrType {
    #[default]
    Public,
    Random,
}

/// Advertisement kind, selecting the slot allocation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvKind {
    /// The single reserved legacy advertisement.
    Static,
    /// One of several concurrent advertising sets.
    Multi,
    /// Fire-and-forget single-use advertisement.
    OneShot,
}

/// Legacy advertisement type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvType {
    /// Connectable and scannable undirected.
    ConnectableScannable,
    /// Connectable directed. Unsupported: the surface carries no peer
    /// address for directed advertising.
    Directed,
    /// Scannable undirected.
    Scannable,
    /// Non-connectable, non-scannable undirected.
    NonConnectable,
}

/// Legacy advertising event properties for multi-advertising sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvEventProp {
    ConnectableScannableUndirected,
    ConnectableLowDutyDirected,
    ConnectableHighDutyDirected,
    ScannableUndirected,
    NonConnectableUndirected,
}

/// Per-slot advertising lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdvState {
    #[default]
    Idle,
    Created,
    Advertising,
    Stopping,
    Deleting,
}

impl AdvState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdvState::Idle => "idle",
            AdvState::Created => "created",
            AdvState::Advertising => "advertising",
            AdvState::Stopping => "stopping",
            AdvState::Deleting => "deleting",
        }
    }
}

/// Advertising parameters handed to the firmware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvParams {
    pub own_addr_type: OwnAddrType,
    pub connectable: bool,
    pub scannable: bool,
    pub interval_min: u16,
    pub interval_max: u16,
    /// Channel bitmap; 0x07 enables all three primary channels.
    pub channel_map: u8,
}

impl Default for AdvParams {
    fn default() -> Self {
        Self {
            own_addr_type: OwnAddrType::Public,
            connectable: true,
            scannable: true,
            interval_min: 120,
            interval_max: 160,
            channel_map: 0x07,
        }
    }
}

/// Scan parameters handed to the firmware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanParams {
    pub active: bool,
    pub interval: u16,
    pub window: u16,
}

impl Default for ScanParams {
    fn default() -> Self {
        Self {
            active: true,
            interval: 0x64,
            window: 0x1C,
        }
    }
}

/// Connection parameters handed to the firmware.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnParams {
    pub interval_min: u16,
    pub interval_max: u16,
    pub latency: u16,
    pub supervision_timeout: u16,
}

impl Default for ConnParams {
    fn default() -> Self {
        Self {
            interval_min: 67,
            interval_max: 67,
            latency: 0,
            supervision_timeout: 0x1F4,
        }
    }
}

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl ConnState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnState::Disconnected => "disconnected",
            ConnState::Connecting => "connecting",
            ConnState::Connected => "connected",
            ConnState::Disconnecting => "disconnecting",
        }
    }
}

/// Role of the local device on a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkRole {
    #[default]
    Undefined,
    Central,
    Peripheral,
}

/// Authentication progress on a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthState {
    #[default]
    None,
    Started,
    Complete,
}

/// Scan session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanState {
    #[default]
    Idle,
    Starting,
    Scanning,
    Stopping,
}

/// Why a scan session stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanStopCause {
    #[default]
    User,
    Auto,
}

/// Scan state transition reported to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStateChange {
    Started,
    Stopped,
}

/// Advertising report type observed while scanning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvReportType {
    ConnectableUndirected,
    ConnectableDirected,
    ScannableUndirected,
    NonConnectableUndirected,
    ScanResponse,
}

/// A device seen while scanning.
#[derive(Debug, Clone)]
pub struct ScannedDevice {
    pub peer: PeerAddress,
    pub report_type: AdvReportType,
    pub rssi: i8,
    pub data: Vec<u8>,
}

/// A fully established connection, reported to the application.
#[derive(Debug, Clone)]
pub struct ConnectedDevice {
    pub conn: ConnHandle,
    pub peer: PeerAddress,
    pub interval: u16,
    pub latency: u16,
    pub mtu: u16,
    pub bonded: bool,
    pub secured: bool,
}

/// Target of a central-role connection attempt.
#[derive(Debug, Clone)]
pub struct ConnectTarget {
    pub peer: PeerAddress,
    /// Bond and encrypt before reporting the device as connected.
    pub secured: bool,
    /// Connection parameters; adapter defaults when absent.
    pub conn_params: Option<ConnParams>,
}

/// Content filter applied to raw scan reports before delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanContentFilter {
    /// Byte offset into the advertising payload.
    pub offset: u8,
    /// Bytes the payload must carry at `offset`.
    pub pattern: Vec<u8>,
}

/// GATT profile entry type, in registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattAttrType {
    Service,
    Characteristic,
    Descriptor,
}

/// Characteristic properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AttrProperties {
    pub read: bool,
    pub write: bool,
    pub write_no_response: bool,
    pub notify: bool,
    pub indicate: bool,
}

/// Access requirement on one direction of an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessRequirement {
    Banned,
    #[default]
    Open,
    Authorized,
    Authenticated,
}

/// Attribute permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AttrPermissions {
    pub read: AccessRequirement,
    pub write: AccessRequirement,
}

/// How an incoming attribute operation was classified before dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrCallbackKind {
    /// Peer read of the attribute value.
    Read,
    /// Peer write request (response sent).
    Write,
    /// Peer write command (no response).
    WriteNoResponse,
    /// Client-configuration descriptor write; `status` carries the bits.
    CccdChanged,
    /// Indication transmit finished; `status` carries the outcome.
    IndicateResult,
}

/// Payload of an attribute callback invocation.
#[derive(Debug, Clone)]
pub struct AttrEvent {
    pub kind: AttrCallbackKind,
    pub conn: ConnHandle,
    pub handle: AttrHandle,
    /// CCCD bits or transmit status, depending on `kind`.
    pub status: u16,
    /// Indications still in flight after this one, for `IndicateResult`.
    pub pending: u32,
}

/// Per-attribute application callback, invoked on the event worker only.
pub type AttrCallback = Arc<dyn Fn(AttrEvent) + Send + Sync>;

/// One entry of the server profile table supplied at registration.
#[derive(Clone)]
pub struct GattProfileEntry {
    pub entry_type: GattAttrType,
    pub uuid: Uuid,
    /// External attribute handle. For a service this is the start handle
    /// of its attribute range; subsequent attributes follow contiguously.
    pub attr_handle: AttrHandle,
    pub properties: AttrProperties,
    pub permissions: AttrPermissions,
    pub callback: Option<AttrCallback>,
}

impl fmt::Debug for GattProfileEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GattProfileEntry")
            .field("entry_type", &self.entry_type)
            .field("uuid", &self.uuid)
            .field("attr_handle", &self.attr_handle)
            .field("properties", &self.properties)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

/// How a server link was connected, as reported to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerConnectionKind {
    /// Link-layer connection established.
    LinkConnected,
    /// Security procedure completed on an existing link.
    SecurityConnected,
    /// Link closed.
    Disconnected,
}

/// Optional application callbacks for client-role events, invoked from the
/// event worker thread only.
#[derive(Clone, Default)]
pub struct ClientCallbacks {
    pub device_connected: Option<Arc<dyn Fn(&ConnectedDevice) + Send + Sync>>,
    pub device_disconnected: Option<Arc<dyn Fn(ConnHandle) + Send + Sync>>,
    pub scan_state_changed: Option<Arc<dyn Fn(ScanStateChange) + Send + Sync>>,
    pub device_scanned: Option<Arc<dyn Fn(&ScannedDevice) + Send + Sync>>,
    pub passkey_display: Option<Arc<dyn Fn(u32, ConnHandle) + Send + Sync>>,
    pub notification_received: Option<Arc<dyn Fn(ConnHandle, AttrHandle, &[u8]) + Send + Sync>>,
    pub indication_received: Option<Arc<dyn Fn(ConnHandle, AttrHandle, &[u8]) + Send + Sync>>,
}

impl fmt::Debug for ClientCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ClientCallbacks { .. }")
    }
}

/// Server registration: the profile table plus link-event callbacks.
#[derive(Clone, Default)]
pub struct ServerConfig {
    pub profiles: Vec<GattProfileEntry>,
    /// Accept incoming pairing requests.
    pub secured_connect_allowed: bool,
    pub connected:
        Option<Arc<dyn Fn(ConnHandle, ServerConnectionKind, &PeerAddress, Option<AdvHandle>) + Send + Sync>>,
    pub disconnected: Option<Arc<dyn Fn(ConnHandle, u16) + Send + Sync>>,
    pub mtu_updated: Option<Arc<dyn Fn(ConnHandle, u16) + Send + Sync>>,
    pub passkey_displayed: Option<Arc<dyn Fn(ConnHandle, u32) + Send + Sync>>,
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("profiles", &self.profiles.len())
            .field("secured_connect_allowed", &self.secured_connect_allowed)
            .finish()
    }
}

/// Build a 128-bit UUID from a 16-bit Bluetooth SIG identifier.
pub const fn uuid16(short: u16) -> Uuid {
    // Bluetooth base UUID 00000000-0000-1000-8000-00805F9B34FB.
    Uuid::from_u128(0x0000_0000_0000_1000_8000_00805F9B34FB | ((short as u128) << 96))
}

/// Primary service declaration.
pub const PRIMARY_SERVICE_DECL_UUID: Uuid = uuid16(0x2800);
/// Characteristic declaration.
pub const CHARACTERISTIC_DECL_UUID: Uuid = uuid16(0x2803);
/// Client characteristic configuration descriptor.
pub const CCCD_UUID: Uuid = uuid16(0x2902);

/// Notification bit of the CCCD value.
pub const CCCD_NOTIFY: u16 = 0x0001;
/// Indication bit of the CCCD value.
pub const CCCD_INDICATE: u16 = 0x0002;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_display_is_msb_first() {
        let addr = BdAddr([0x01, 0x02, 0x03, 0x04, 0x05, 0xC6]);
        assert_eq!(addr.to_string(), "c6:05:04:03:02:01");
    }

    #[test]
    fn address_hex_round_trip() {
        let addr = BdAddr([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, "\"aabbccddeeff\"");
        let back: BdAddr = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
    }

    #[test]
    fn random_static_address_has_static_bits() {
        let addr = BdAddr::random_static();
        assert_eq!(addr.0[5] & 0xC0, 0xC0);
        assert_eq!(AddrType::classify(1, &addr), AddrType::RandomStatic);
    }

    #[test]
    fn classify_recognises_resolvable_private() {
        let addr = BdAddr([0, 0, 0, 0, 0, 0x40]);
        assert_eq!(AddrType::classify(1, &addr), AddrType::RandomResolvable);
        assert_eq!(AddrType::classify(0, &addr), AddrType::Public);
    }

    #[test]
    fn sig_uuid_expansion() {
        assert_eq!(
            CCCD_UUID.to_string(),
            "00002902-0000-1000-8000-00805f9b34fb"
        );
    }
}
