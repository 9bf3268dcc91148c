use std::collections::HashSet;
use std::fmt;

use async_trait::async_trait;
use log::trace;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::advertise::Advertisement;
use crate::attribute::{CharacteristicProperties, Permissions, ServiceType, WriteType};
use crate::uuid::{uuid_from_u16, uuid_from_u32};
use crate::{Address, ConnectionHandle, Error, Result};

/// Identity of a native GATT object (service, characteristic or descriptor).
///
/// This is whatever the platform glue uses to find its own object again, e.g.
/// an index into a table of JNI global references. It's never exposed to
/// callers, who only ever see handles.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttributeId(pub u64);

/// A GATT status code as reported by the native stack.
///
/// The code is passed through to callers uninterpreted via
/// `Error::NativeFailure`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GattStatus(pub i32);

impl GattStatus {
    pub const SUCCESS: GattStatus = GattStatus(0x00);
    pub const REQUEST_NOT_SUPPORTED: GattStatus = GattStatus(0x06);
    pub const FAILURE: GattStatus = GattStatus(0x101);

    pub fn is_success(self) -> bool {
        self == GattStatus::SUCCESS
    }

    pub fn into_result(self) -> Result<()> {
        if self.is_success() {
            Ok(())
        } else {
            Err(Error::NativeFailure(self.0))
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NativeService {
    pub id: AttributeId,
    pub uuid: Uuid,
    pub service_type: ServiceType,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NativeCharacteristic {
    pub id: AttributeId,
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
    pub permissions: Permissions,
    pub write_type: WriteType,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NativeDescriptor {
    pub id: AttributeId,
    pub uuid: Uuid,
    pub permissions: Permissions,
}

/// An advertisement seen while scanning
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScanResult {
    pub address: Address,
    pub rssi: i16,
    pub name: Option<String>,
    pub advertisement: Vec<u8>,
}

// Advertising data (AD) structure types listing service class UUIDs
const AD_INCOMPLETE_UUID16: u8 = 0x02;
const AD_COMPLETE_UUID16: u8 = 0x03;
const AD_INCOMPLETE_UUID32: u8 = 0x04;
const AD_COMPLETE_UUID32: u8 = 0x05;
const AD_INCOMPLETE_UUID128: u8 = 0x06;
const AD_COMPLETE_UUID128: u8 = 0x07;

impl ScanResult {
    /// The service UUIDs listed in the raw advertisement.
    ///
    /// Parsing stops quietly at the first truncated AD structure.
    pub fn service_uuids(&self) -> Vec<Uuid> {
        let mut uuids = vec![];
        let mut rest = &self.advertisement[..];
        while let Some((&len, tail)) = rest.split_first() {
            let len = len as usize;
            if len == 0 || len > tail.len() {
                break;
            }
            let (structure, next) = tail.split_at(len);
            rest = next;

            let (ad_type, payload) = (structure[0], &structure[1..]);
            match ad_type {
                AD_INCOMPLETE_UUID16 | AD_COMPLETE_UUID16 => uuids.extend(payload
                    .chunks_exact(2)
                    .map(|c| uuid_from_u16(u16::from_le_bytes([c[0], c[1]])))),
                AD_INCOMPLETE_UUID32 | AD_COMPLETE_UUID32 => uuids.extend(payload
                    .chunks_exact(4)
                    .map(|c| uuid_from_u32(u32::from_le_bytes([c[0], c[1], c[2], c[3]])))),
                AD_INCOMPLETE_UUID128 | AD_COMPLETE_UUID128 => uuids.extend(payload.chunks_exact(16).map(|c| {
                    let mut bytes = [0u8; 16];
                    bytes.copy_from_slice(c);
                    Uuid::from_u128(u128::from_le_bytes(bytes))
                })),
                _ => {}
            }
        }
        uuids
    }
}

#[derive(Clone, Debug)]
pub struct Filter {
    pub(crate) service_uuids: HashSet<Uuid>,
}
impl Filter {
    pub fn new() -> Self {
        Self {
            service_uuids: HashSet::new(),
        }
    }

    pub fn add_service(&mut self, uuid: Uuid) -> &mut Self {
        self.service_uuids.insert(uuid);

        self
    }

    pub fn service_uuids(&self) -> impl Iterator<Item = &Uuid> {
        self.service_uuids.iter()
    }

    /// An empty filter matches everything, otherwise the advertisement has
    /// to list at least one of the filter's services
    pub fn matches(&self, result: &ScanResult) -> bool {
        self.service_uuids.is_empty() ||
            result.service_uuids().iter().any(|uuid| self.service_uuids.contains(uuid))
    }
}

impl Default for Filter {
    fn default() -> Self {
        Self::new()
    }
}

/// Completion and unsolicited events for one central-role connection
#[derive(Clone, Debug)]
pub enum NativeEvent {
    ConnectionStateChanged {
        status: GattStatus,
        state: ConnectionState,
    },
    RssiRead {
        status: GattStatus,
        rssi: i16,
    },
    ServicesDiscovered {
        status: GattStatus,
    },
    CharacteristicRead {
        status: GattStatus,
        characteristic: AttributeId,
        value: Vec<u8>,
    },
    DescriptorRead {
        status: GattStatus,
        descriptor: AttributeId,
        value: Vec<u8>,
    },
    CharacteristicWritten {
        status: GattStatus,
        characteristic: AttributeId,
    },
    DescriptorWritten {
        status: GattStatus,
        descriptor: AttributeId,
    },
    CharacteristicChanged {
        characteristic: AttributeId,
        value: Vec<u8>,
    },
}

/// Requests and status events from a peripheral-role GATT server
#[derive(Clone, Debug)]
pub enum NativeServerEvent {
    ConnectionStateChanged {
        device: Address,
        status: GattStatus,
        connected: bool,
    },
    ReadRequest {
        device: Address,
        request_id: i32,
        offset: u16,
        attribute: AttributeId,
    },
    WriteRequest {
        device: Address,
        request_id: i32,
        attribute: AttributeId,
        prepared: bool,
        response_needed: bool,
        offset: u16,
        value: Vec<u8>,
    },
    ExecuteWrite {
        device: Address,
        request_id: i32,
        execute: bool,
    },
    NotificationSent {
        device: Address,
        status: GattStatus,
    },
    MtuChanged {
        device: Address,
        mtu: u16,
    },
    ServiceAdded {
        status: GattStatus,
        service: AttributeId,
    },
}

// The native service tree built from a server configuration. Ids are assigned
// by the bridge and echoed back by the native stack in request events.

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceDefinition {
    pub id: AttributeId,
    pub uuid: Uuid,
    pub service_type: ServiceType,
    pub characteristics: Vec<CharacteristicDefinition>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CharacteristicDefinition {
    pub id: AttributeId,
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
    pub permissions: Permissions,
    pub descriptors: Vec<DescriptorDefinition>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DescriptorDefinition {
    pub id: AttributeId,
    pub uuid: Uuid,
    pub permissions: Permissions,
}

#[derive(Debug)]
pub(crate) enum BackendEvent {
    Connection {
        connection: ConnectionHandle,
        event: NativeEvent,
    },
    Server {
        generation: u32,
        event: NativeServerEvent,
    },
    RadioLost,
    Flush(oneshot::Sender<()>),
}

/// Handed to the native stack when a connection is requested; every callback
/// for that connection should be forwarded through it.
#[derive(Clone, Debug)]
pub struct ConnectionEventSink {
    connection: ConnectionHandle,
    bus: mpsc::UnboundedSender<BackendEvent>,
}

impl ConnectionEventSink {
    pub(crate) fn new(connection: ConnectionHandle, bus: mpsc::UnboundedSender<BackendEvent>) -> Self {
        Self { connection, bus }
    }

    pub fn connection(&self) -> ConnectionHandle {
        self.connection
    }

    pub fn send(&self, event: NativeEvent) {
        let connection = self.connection;
        if self.bus.send(BackendEvent::Connection { connection, event }).is_err() {
            trace!("Dropping native event for connection {}: session has gone", connection);
        }
    }
}

/// Handed to the native stack when a GATT server is opened
#[derive(Clone, Debug)]
pub struct ServerEventSink {
    // Lets the session ignore late events from a server that has since been
    // stopped (and possibly replaced)
    generation: u32,
    bus: mpsc::UnboundedSender<BackendEvent>,
}

impl ServerEventSink {
    pub(crate) fn new(generation: u32, bus: mpsc::UnboundedSender<BackendEvent>) -> Self {
        Self { generation, bus }
    }

    pub fn send(&self, event: NativeServerEvent) {
        let generation = self.generation;
        if self.bus.send(BackendEvent::Server { generation, event }).is_err() {
            trace!("Dropping native server event: session has gone");
        }
    }
}

/// Radio-wide notifications that aren't tied to a connection
#[derive(Clone, Debug)]
pub struct RadioEventSink {
    bus: mpsc::UnboundedSender<BackendEvent>,
}

impl RadioEventSink {
    pub(crate) fn new(bus: mpsc::UnboundedSender<BackendEvent>) -> Self {
        Self { bus }
    }

    /// Reports that the radio stack has gone away (powered off, crashed, ...).
    ///
    /// Every connection and any running GATT server is torn down.
    pub fn radio_lost(&self) {
        let _ = self.bus.send(BackendEvent::RadioLost);
    }
}

/// The platform radio.
///
/// Calls that start an asynchronous GATT procedure only *submit* it: an `Err`
/// means the stack rejected the request outright and no completion event
/// will follow, `Ok` means exactly one completion event will eventually be
/// delivered through the connection's [`ConnectionEventSink`].
#[async_trait]
pub trait Radio: Send + Sync + fmt::Debug {
    /// Resolves once the radio is powered on, asking the platform to power it
    /// on if necessary.
    async fn wait_powered_on(&self) -> Result<()>;

    /// Called once when a session starts
    fn attach(&self, sink: RadioEventSink);

    /// Only advertisements matching `filter` should be reported
    fn start_scan(&self, filter: &Filter, results: mpsc::UnboundedSender<ScanResult>) -> Result<()>;
    fn stop_scan(&self) -> Result<()>;

    /// Starts advertising, resolving once the stack reports that advertising
    /// started. A failure code reported by the stack should be returned as
    /// `Error::NativeFailure`, and radios that can't advertise should return
    /// `Error::Unsupported`.
    async fn start_advertising(&self, advertisement: &Advertisement) -> Result<()>;
    fn stop_advertising(&self) -> Result<()>;

    /// Turns the adapter off and back on, resolving once it's powered on
    /// again. The session has already torn down its own state, so this
    /// needn't be reported through [`RadioEventSink::radio_lost`].
    async fn power_cycle(&self) -> Result<()>;

    /// Requests a GATT connection. Connection state changes are reported
    /// via `NativeEvent::ConnectionStateChanged`.
    fn connect(&self, address: &Address, auto_connect: bool, events: ConnectionEventSink)
               -> Result<Box<dyn NativeConnection>>;

    /// Opens a local GATT server. Radios without peripheral role support
    /// should return `Error::Unsupported`.
    fn open_gatt_server(&self, events: ServerEventSink) -> Result<Box<dyn NativeGattServer>>;
}

/// A native central-role GATT connection.
///
/// The native stack only tolerates one outstanding procedure (RSSI reads
/// aside) per connection; callers of this trait guarantee that.
pub trait NativeConnection: Send + Sync + fmt::Debug {
    fn read_rssi(&self) -> Result<()>;
    fn discover_services(&self) -> Result<()>;

    // Synchronous lookups into the tree built by the last successful discovery
    fn services(&self) -> Result<Vec<NativeService>>;
    fn characteristics(&self, service: AttributeId) -> Result<Vec<NativeCharacteristic>>;
    fn descriptors(&self, characteristic: AttributeId) -> Result<Vec<NativeDescriptor>>;

    fn read_characteristic(&self, characteristic: AttributeId) -> Result<()>;
    fn read_descriptor(&self, descriptor: AttributeId) -> Result<()>;
    fn write_characteristic(&self, characteristic: AttributeId, value: &[u8], write_type: WriteType)
                            -> Result<()>;
    fn write_descriptor(&self, descriptor: AttributeId, value: &[u8]) -> Result<()>;

    /// Enables/disables local delivery of value change notifications. This
    /// completes synchronously.
    fn set_notification(&self, characteristic: AttributeId, enable: bool) -> Result<()>;

    /// Releases the native connection; no further events are expected
    fn close(&self);
}

/// A native peripheral-role GATT server
pub trait NativeGattServer: Send + Sync + fmt::Debug {
    fn add_service(&self, service: &ServiceDefinition) -> Result<()>;

    fn send_response(&self, device: &Address, request_id: i32, status: GattStatus, offset: u16,
                     value: &[u8])
                     -> Result<()>;

    /// Submits a notification (or, with `confirm`, an indication). Completion
    /// is reported via `NativeServerEvent::NotificationSent`.
    fn notify_characteristic_changed(&self, device: &Address, characteristic: AttributeId,
                                     value: &[u8], confirm: bool)
                                     -> Result<()>;

    fn close(&self);
}
