//! A scriptable in-process radio.
//!
//! Nothing completes on its own: submitted GATT procedures stay pending
//! until a test calls [`FakeRadio::complete_pending`] (or
//! [`FakeRadio::fail_pending`]), which makes it easy to observe exactly
//! what the broker hands to the native stack and when.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::trace;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::advertise::Advertisement;
use crate::attribute::{CharacteristicProperties, Permissions, ServiceType, WriteType};
use crate::backend::{AttributeId, ConnectionEventSink, ConnectionState, Filter, GattStatus, NativeCharacteristic,
                     NativeConnection, NativeDescriptor, NativeEvent, NativeGattServer, NativeServerEvent,
                     NativeService, Radio, RadioEventSink, ScanResult, ServerEventSink, ServiceDefinition};
use crate::{Address, Error, Result};

#[derive(Clone, Debug)]
pub struct FakeService {
    uuid: Uuid,
    service_type: ServiceType,
    characteristics: Vec<FakeCharacteristic>,
}

impl FakeService {
    pub fn primary(uuid: Uuid) -> Self {
        Self { uuid, service_type: ServiceType::Primary, characteristics: vec![] }
    }

    pub fn secondary(uuid: Uuid) -> Self {
        Self { uuid, service_type: ServiceType::Secondary, characteristics: vec![] }
    }

    pub fn with_characteristic(mut self, characteristic: FakeCharacteristic) -> Self {
        self.characteristics.push(characteristic);
        self
    }
}

#[derive(Clone, Debug)]
pub struct FakeCharacteristic {
    uuid: Uuid,
    properties: CharacteristicProperties,
    permissions: Permissions,
    value: Vec<u8>,
    descriptors: Vec<FakeDescriptor>,
}

impl FakeCharacteristic {
    pub fn new(uuid: Uuid, properties: CharacteristicProperties) -> Self {
        Self {
            uuid,
            properties,
            permissions: Permissions::READ | Permissions::WRITE,
            value: vec![],
            descriptors: vec![],
        }
    }

    /// Readable and writable (with response)
    pub fn readable(uuid: Uuid) -> Self {
        Self::new(uuid, CharacteristicProperties::READ | CharacteristicProperties::WRITE)
    }

    pub fn notify(uuid: Uuid) -> Self {
        Self::new(uuid, CharacteristicProperties::READ | CharacteristicProperties::NOTIFY)
    }

    pub fn with_value(mut self, value: Vec<u8>) -> Self {
        self.value = value;
        self
    }

    pub fn with_descriptor(mut self, descriptor: FakeDescriptor) -> Self {
        self.descriptors.push(descriptor);
        self
    }
}

#[derive(Clone, Debug)]
pub struct FakeDescriptor {
    uuid: Uuid,
    permissions: Permissions,
    value: Vec<u8>,
}

impl FakeDescriptor {
    pub fn new(uuid: Uuid) -> Self {
        Self { uuid, permissions: Permissions::READ | Permissions::WRITE, value: vec![] }
    }

    pub fn with_value(mut self, value: Vec<u8>) -> Self {
        self.value = value;
        self
    }
}

/// A request the fake radio accepted, as seen by the native stack
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FakeRequest {
    Connect { auto_connect: bool },
    ReadRssi,
    DiscoverServices,
    ReadCharacteristic(Uuid),
    ReadDescriptor(Uuid),
    WriteCharacteristic { uuid: Uuid, value: Vec<u8>, write_type: WriteType },
    WriteDescriptor { uuid: Uuid, value: Vec<u8> },
    SetNotification { uuid: Uuid, enable: bool },
    Close,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FakeResponse {
    pub device: Address,
    pub request_id: i32,
    pub status: GattStatus,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FakeNotification {
    pub device: Address,
    pub characteristic: AttributeId,
    pub value: Vec<u8>,
    pub confirm: bool,
}

#[derive(Debug)]
struct FakeCharacteristicEntry {
    native: NativeCharacteristic,
    descriptors: Vec<NativeDescriptor>,
}

#[derive(Debug)]
struct FakeServiceEntry {
    native: NativeService,
    characteristics: Vec<FakeCharacteristicEntry>,
}

#[derive(Debug, Default)]
struct FakePeripheral {
    services: Vec<FakeServiceEntry>,
    uuids: HashMap<AttributeId, Uuid>,
    values: HashMap<AttributeId, Vec<u8>>,
}

impl FakePeripheral {
    fn uuid(&self, id: AttributeId) -> Uuid {
        self.uuids.get(&id).copied().unwrap_or_else(Uuid::nil)
    }
}

/// A submitted procedure awaiting its completion event
#[derive(Debug)]
enum Procedure {
    DiscoverServices,
    ReadCharacteristic(AttributeId),
    ReadDescriptor(AttributeId),
    WriteCharacteristic(AttributeId, Vec<u8>),
    WriteDescriptor(AttributeId, Vec<u8>),
}

#[derive(Debug)]
struct FakeLink {
    sink: ConnectionEventSink,
    discovered: bool,
    outstanding: VecDeque<Procedure>,
    max_in_flight: usize,
    rssi_pending: bool,
    closed: bool,
}

#[derive(Debug)]
struct FakeServer {
    sink: ServerEventSink,
    services: Vec<ServiceDefinition>,
    responses: Vec<FakeResponse>,
    notifications: Vec<FakeNotification>,
    closed: bool,
}

#[derive(Debug, Default)]
struct FakeState {
    next_id: u64,
    peripherals: HashMap<Address, FakePeripheral>,
    links: HashMap<Address, FakeLink>,
    requests: HashMap<Address, Vec<FakeRequest>>,
    refuse_next: usize,

    radio_sink: Option<RadioEventSink>,
    scan: Option<(Filter, mpsc::UnboundedSender<ScanResult>)>,
    advertisement: Option<Advertisement>,
    advertising_failure: Option<i32>,
    power_cycles: usize,
    server: Option<FakeServer>,
}

impl FakeState {
    fn allocate_id(&mut self) -> AttributeId {
        self.next_id += 1;
        AttributeId(self.next_id)
    }

    fn check_refused(&mut self) -> Result<()> {
        if self.refuse_next > 0 {
            self.refuse_next -= 1;
            trace!("Fake radio refusing request");
            Err(Error::Other(anyhow::anyhow!("Request refused by fake radio")))
        } else {
            Ok(())
        }
    }

    fn log(&mut self, address: &Address, request: FakeRequest) {
        self.requests.entry(address.clone()).or_default().push(request);
    }

    fn open_link(&mut self, address: &Address) -> Result<&mut FakeLink> {
        match self.links.get_mut(address) {
            Some(link) if !link.closed => Ok(link),
            _ => Err(Error::Closed),
        }
    }

    fn submit(&mut self, address: &Address, request: FakeRequest, procedure: Procedure) -> Result<()> {
        self.check_refused()?;
        let link = self.open_link(address)?;
        link.outstanding.push_back(procedure);
        link.max_in_flight = link.max_in_flight.max(link.outstanding.len());
        self.log(address, request);
        Ok(())
    }
}

#[derive(Debug)]
struct FakeRadioInner {
    state: Mutex<FakeState>,
    power_tx: watch::Sender<bool>,
    power_rx: watch::Receiver<bool>,
    peripheral_role: bool,
}

#[derive(Clone, Debug)]
pub struct FakeRadio {
    inner: Arc<FakeRadioInner>,
}

impl Default for FakeRadio {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRadio {
    fn with_role(peripheral_role: bool) -> Self {
        let (power_tx, power_rx) = watch::channel(true);
        Self {
            inner: Arc::new(FakeRadioInner {
                state: Mutex::new(FakeState::default()),
                power_tx,
                power_rx,
                peripheral_role,
            }),
        }
    }

    /// A powered-on radio supporting both central and peripheral roles
    pub fn new() -> Self {
        Self::with_role(true)
    }

    pub fn without_peripheral_role() -> Self {
        Self::with_role(false)
    }

    pub fn set_powered(&self, powered: bool) {
        let _ = self.inner.power_tx.send(powered);
    }

    /// Simulates the radio stack going away
    pub fn power_off(&self) {
        self.set_powered(false);
        let state = self.inner.state.lock().unwrap();
        if let Some(sink) = &state.radio_sink {
            sink.radio_lost();
        }
    }

    /// Makes the next request (connect, GATT procedure, notification toggle,
    /// server response, ...) fail synchronously
    pub fn refuse_next_request(&self) {
        self.inner.state.lock().unwrap().refuse_next += 1;
    }

    pub fn add_peripheral(&self, address: &Address, services: Vec<FakeService>) {
        let mut state = self.inner.state.lock().unwrap();
        let mut peripheral = FakePeripheral::default();

        for service in services {
            let id = state.allocate_id();
            peripheral.uuids.insert(id, service.uuid);
            let mut entry = FakeServiceEntry {
                native: NativeService { id, uuid: service.uuid, service_type: service.service_type },
                characteristics: vec![],
            };

            for characteristic in service.characteristics {
                let id = state.allocate_id();
                peripheral.uuids.insert(id, characteristic.uuid);
                peripheral.values.insert(id, characteristic.value);
                let write_type = if characteristic.properties.contains(CharacteristicProperties::WRITE_WITHOUT_RESPONSE) &&
                    !characteristic.properties.contains(CharacteristicProperties::WRITE)
                {
                    WriteType::WithoutResponse
                } else {
                    WriteType::WithResponse
                };
                let mut characteristic_entry = FakeCharacteristicEntry {
                    native: NativeCharacteristic {
                        id,
                        uuid: characteristic.uuid,
                        properties: characteristic.properties,
                        permissions: characteristic.permissions,
                        write_type,
                    },
                    descriptors: vec![],
                };

                for descriptor in characteristic.descriptors {
                    let id = state.allocate_id();
                    peripheral.uuids.insert(id, descriptor.uuid);
                    peripheral.values.insert(id, descriptor.value);
                    characteristic_entry.descriptors.push(NativeDescriptor {
                        id,
                        uuid: descriptor.uuid,
                        permissions: descriptor.permissions,
                    });
                }
                entry.characteristics.push(characteristic_entry);
            }
            peripheral.services.push(entry);
        }

        state.peripherals.insert(address.clone(), peripheral);
    }

    /// The native id of the first attribute of `address` with the given uuid
    pub fn attribute_id(&self, address: &Address, uuid: Uuid) -> Option<AttributeId> {
        let state = self.inner.state.lock().unwrap();
        let peripheral = state.peripherals.get(address)?;
        let mut ids: Vec<AttributeId> = peripheral.uuids.iter()
            .filter(|(_, attribute_uuid)| **attribute_uuid == uuid)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids.first().copied()
    }

    pub fn value(&self, address: &Address, uuid: Uuid) -> Option<Vec<u8>> {
        let id = self.attribute_id(address, uuid)?;
        let state = self.inner.state.lock().unwrap();
        state.peripherals.get(address)?.values.get(&id).cloned()
    }

    /// Every request accepted for `address` so far, in order
    pub fn requests(&self, address: &Address) -> Vec<FakeRequest> {
        let state = self.inner.state.lock().unwrap();
        state.requests.get(address).cloned().unwrap_or_default()
    }

    /// Submitted GATT procedures still awaiting completion
    pub fn in_flight(&self, address: &Address) -> usize {
        let state = self.inner.state.lock().unwrap();
        state.links.get(address).map(|link| link.outstanding.len()).unwrap_or(0)
    }

    /// The most procedures that were ever outstanding at once for `address`
    pub fn max_in_flight(&self, address: &Address) -> usize {
        let state = self.inner.state.lock().unwrap();
        state.links.get(address).map(|link| link.max_in_flight).unwrap_or(0)
    }

    fn finish_pending(&self, address: &Address, status: GattStatus) -> bool {
        let mut guard = self.inner.state.lock().unwrap();
        let state = &mut *guard;
        let link = match state.links.get_mut(address) {
            Some(link) => link,
            None => return false,
        };
        let procedure = match link.outstanding.pop_front() {
            Some(procedure) => procedure,
            None => return false,
        };
        let mut empty = FakePeripheral::default();
        let peripheral = state.peripherals.get_mut(address).unwrap_or(&mut empty);
        let success = status.is_success();

        let event = match procedure {
            Procedure::DiscoverServices => {
                link.discovered |= success;
                NativeEvent::ServicesDiscovered { status }
            }
            Procedure::ReadCharacteristic(characteristic) => NativeEvent::CharacteristicRead {
                status,
                characteristic,
                value: if success { peripheral.values.get(&characteristic).cloned().unwrap_or_default() } else { vec![] },
            },
            Procedure::ReadDescriptor(descriptor) => NativeEvent::DescriptorRead {
                status,
                descriptor,
                value: if success { peripheral.values.get(&descriptor).cloned().unwrap_or_default() } else { vec![] },
            },
            Procedure::WriteCharacteristic(characteristic, value) => {
                if success {
                    peripheral.values.insert(characteristic, value);
                }
                NativeEvent::CharacteristicWritten { status, characteristic }
            }
            Procedure::WriteDescriptor(descriptor, value) => {
                if success {
                    peripheral.values.insert(descriptor, value);
                }
                NativeEvent::DescriptorWritten { status, descriptor }
            }
        };
        link.sink.send(event);
        true
    }

    /// Successfully completes the oldest outstanding procedure for `address`.
    /// Reads return the attribute's current value, writes update it.
    ///
    /// Returns false if nothing was outstanding.
    pub fn complete_pending(&self, address: &Address) -> bool {
        self.finish_pending(address, GattStatus::SUCCESS)
    }

    /// Fails the oldest outstanding procedure for `address` with `status`
    pub fn fail_pending(&self, address: &Address, status: GattStatus) -> bool {
        self.finish_pending(address, status)
    }

    /// Delivers an rssi reading, returning whether one had been requested
    pub fn complete_rssi(&self, address: &Address, status: GattStatus, rssi: i16) -> bool {
        let mut state = self.inner.state.lock().unwrap();
        match state.links.get_mut(address) {
            Some(link) => {
                link.sink.send(NativeEvent::RssiRead { status, rssi });
                std::mem::replace(&mut link.rssi_pending, false)
            }
            None => false,
        }
    }

    /// Raises a value-changed event for the first characteristic with `uuid`
    pub fn notify(&self, address: &Address, uuid: Uuid, value: Vec<u8>) {
        if let Some(characteristic) = self.attribute_id(address, uuid) {
            self.send_event(address, NativeEvent::CharacteristicChanged { characteristic, value });
        }
    }

    pub fn set_connection_state(&self, address: &Address, status: GattStatus, state: ConnectionState) {
        self.send_event(address, NativeEvent::ConnectionStateChanged { status, state });
    }

    /// Delivers an arbitrary native event for `address`
    pub fn send_event(&self, address: &Address, event: NativeEvent) {
        let state = self.inner.state.lock().unwrap();
        if let Some(link) = state.links.get(address) {
            link.sink.send(event);
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.inner.state.lock().unwrap().scan.is_some()
    }

    /// Reports an advertisement to the running scan, if its filter matches
    pub fn advertise(&self, result: ScanResult) {
        let state = self.inner.state.lock().unwrap();
        match &state.scan {
            Some((filter, tx)) if filter.matches(&result) => {
                let _ = tx.send(result);
            }
            Some(_) => trace!("Fake radio filtered out advertisement from {}", result.address),
            None => {}
        }
    }

    /// What the radio is currently advertising, if anything
    pub fn advertisement(&self) -> Option<Advertisement> {
        self.inner.state.lock().unwrap().advertisement.clone()
    }

    /// Makes the next attempt to start advertising fail with `code`, as if
    /// reported by the stack's start callback
    pub fn fail_next_advertising(&self, code: i32) {
        self.inner.state.lock().unwrap().advertising_failure = Some(code);
    }

    /// How many times the adapter has been power cycled
    pub fn power_cycles(&self) -> usize {
        self.inner.state.lock().unwrap().power_cycles
    }

    /// Delivers a request from a remote central to the open GATT server
    pub fn server_request(&self, event: NativeServerEvent) {
        let state = self.inner.state.lock().unwrap();
        if let Some(server) = &state.server {
            server.sink.send(event);
        }
    }

    pub fn complete_notification(&self, device: &Address, status: GattStatus) {
        self.server_request(NativeServerEvent::NotificationSent { device: device.clone(), status });
    }

    /// The service tree registered by the last server opened, if any
    pub fn server_services(&self) -> Option<Vec<ServiceDefinition>> {
        let state = self.inner.state.lock().unwrap();
        state.server.as_ref().map(|server| server.services.clone())
    }

    /// The native id the server assigned to the first attribute with `uuid`
    pub fn server_attribute_id(&self, uuid: Uuid) -> Option<AttributeId> {
        let services = self.server_services()?;
        for service in services {
            if service.uuid == uuid {
                return Some(service.id);
            }
            for characteristic in service.characteristics {
                if characteristic.uuid == uuid {
                    return Some(characteristic.id);
                }
                if let Some(descriptor) = characteristic.descriptors.iter().find(|d| d.uuid == uuid) {
                    return Some(descriptor.id);
                }
            }
        }
        None
    }

    pub fn server_responses(&self) -> Vec<FakeResponse> {
        let state = self.inner.state.lock().unwrap();
        state.server.as_ref().map(|server| server.responses.clone()).unwrap_or_default()
    }

    pub fn server_notifications(&self) -> Vec<FakeNotification> {
        let state = self.inner.state.lock().unwrap();
        state.server.as_ref().map(|server| server.notifications.clone()).unwrap_or_default()
    }

    pub fn server_closed(&self) -> bool {
        let state = self.inner.state.lock().unwrap();
        state.server.as_ref().map(|server| server.closed).unwrap_or(false)
    }
}

#[async_trait]
impl Radio for FakeRadio {
    async fn wait_powered_on(&self) -> Result<()> {
        let mut power = self.inner.power_rx.clone();
        loop {
            let powered = *power.borrow();
            if powered {
                return Ok(());
            }
            power.changed().await.map_err(|_| Error::Closed)?;
        }
    }

    fn attach(&self, sink: RadioEventSink) {
        self.inner.state.lock().unwrap().radio_sink = Some(sink);
    }

    fn start_scan(&self, filter: &Filter, results: mpsc::UnboundedSender<ScanResult>) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        state.check_refused()?;
        state.scan = Some((filter.clone(), results));
        Ok(())
    }

    fn stop_scan(&self) -> Result<()> {
        self.inner.state.lock().unwrap().scan = None;
        Ok(())
    }

    async fn start_advertising(&self, advertisement: &Advertisement) -> Result<()> {
        if !self.inner.peripheral_role {
            return Err(Error::Unsupported);
        }
        let mut state = self.inner.state.lock().unwrap();
        state.check_refused()?;
        if let Some(code) = state.advertising_failure.take() {
            return Err(Error::NativeFailure(code));
        }
        state.advertisement = Some(advertisement.clone());
        Ok(())
    }

    fn stop_advertising(&self) -> Result<()> {
        self.inner.state.lock().unwrap().advertisement = None;
        Ok(())
    }

    async fn power_cycle(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.check_refused()?;
            state.power_cycles += 1;
            state.scan = None;
            state.advertisement = None;
        }
        self.set_powered(false);
        self.set_powered(true);
        self.wait_powered_on().await
    }

    fn connect(&self, address: &Address, auto_connect: bool, events: ConnectionEventSink)
               -> Result<Box<dyn NativeConnection>>
    {
        let mut state = self.inner.state.lock().unwrap();
        state.check_refused()?;
        state.log(address, FakeRequest::Connect { auto_connect });

        let link = FakeLink {
            sink: events,
            discovered: false,
            outstanding: VecDeque::new(),
            max_in_flight: 0,
            rssi_pending: false,
            closed: false,
        };
        if state.peripherals.contains_key(address) {
            link.sink.send(NativeEvent::ConnectionStateChanged {
                status: GattStatus::SUCCESS,
                state: ConnectionState::Connected,
            });
        }
        state.links.insert(address.clone(), link);

        Ok(Box::new(FakeConnection { address: address.clone(), radio: self.clone() }))
    }

    fn open_gatt_server(&self, events: ServerEventSink) -> Result<Box<dyn NativeGattServer>> {
        if !self.inner.peripheral_role {
            return Err(Error::Unsupported);
        }
        let mut state = self.inner.state.lock().unwrap();
        state.server = Some(FakeServer {
            sink: events,
            services: vec![],
            responses: vec![],
            notifications: vec![],
            closed: false,
        });
        Ok(Box::new(FakeGattServer { radio: self.clone() }))
    }
}

#[derive(Debug)]
struct FakeConnection {
    address: Address,
    radio: FakeRadio,
}

impl FakeConnection {
    fn with_state<T>(&self, f: impl FnOnce(&mut FakeState) -> Result<T>) -> Result<T> {
        let mut state = self.radio.inner.state.lock().unwrap();
        f(&mut state)
    }

    fn uuid(&self, state: &FakeState, id: AttributeId) -> Uuid {
        state.peripherals.get(&self.address).map(|peripheral| peripheral.uuid(id)).unwrap_or_else(Uuid::nil)
    }
}

impl NativeConnection for FakeConnection {
    fn read_rssi(&self) -> Result<()> {
        self.with_state(|state| {
            state.check_refused()?;
            let link = state.open_link(&self.address)?;
            link.rssi_pending = true;
            state.log(&self.address, FakeRequest::ReadRssi);
            Ok(())
        })
    }

    fn discover_services(&self) -> Result<()> {
        self.with_state(|state| state.submit(&self.address, FakeRequest::DiscoverServices, Procedure::DiscoverServices))
    }

    fn services(&self) -> Result<Vec<NativeService>> {
        self.with_state(|state| {
            if !state.open_link(&self.address)?.discovered {
                return Ok(vec![]);
            }
            Ok(state.peripherals
                .get(&self.address)
                .map(|peripheral| peripheral.services.iter().map(|service| service.native.clone()).collect())
                .unwrap_or_default())
        })
    }

    fn characteristics(&self, service: AttributeId) -> Result<Vec<NativeCharacteristic>> {
        self.with_state(|state| {
            state.peripherals
                .get(&self.address)
                .and_then(|peripheral| peripheral.services.iter().find(|entry| entry.native.id == service))
                .map(|entry| entry.characteristics.iter().map(|c| c.native.clone()).collect())
                .ok_or(Error::NotFound("attribute"))
        })
    }

    fn descriptors(&self, characteristic: AttributeId) -> Result<Vec<NativeDescriptor>> {
        self.with_state(|state| {
            state.peripherals
                .get(&self.address)
                .and_then(|peripheral| {
                    peripheral.services.iter()
                        .flat_map(|service| service.characteristics.iter())
                        .find(|entry| entry.native.id == characteristic)
                })
                .map(|entry| entry.descriptors.clone())
                .ok_or(Error::NotFound("attribute"))
        })
    }

    fn read_characteristic(&self, characteristic: AttributeId) -> Result<()> {
        self.with_state(|state| {
            let request = FakeRequest::ReadCharacteristic(self.uuid(state, characteristic));
            state.submit(&self.address, request, Procedure::ReadCharacteristic(characteristic))
        })
    }

    fn read_descriptor(&self, descriptor: AttributeId) -> Result<()> {
        self.with_state(|state| {
            let request = FakeRequest::ReadDescriptor(self.uuid(state, descriptor));
            state.submit(&self.address, request, Procedure::ReadDescriptor(descriptor))
        })
    }

    fn write_characteristic(&self, characteristic: AttributeId, value: &[u8], write_type: WriteType)
                            -> Result<()>
    {
        self.with_state(|state| {
            let request = FakeRequest::WriteCharacteristic {
                uuid: self.uuid(state, characteristic),
                value: value.to_vec(),
                write_type,
            };
            state.submit(&self.address, request, Procedure::WriteCharacteristic(characteristic, value.to_vec()))
        })
    }

    fn write_descriptor(&self, descriptor: AttributeId, value: &[u8]) -> Result<()> {
        self.with_state(|state| {
            let request = FakeRequest::WriteDescriptor { uuid: self.uuid(state, descriptor), value: value.to_vec() };
            state.submit(&self.address, request, Procedure::WriteDescriptor(descriptor, value.to_vec()))
        })
    }

    fn set_notification(&self, characteristic: AttributeId, enable: bool) -> Result<()> {
        self.with_state(|state| {
            state.check_refused()?;
            state.open_link(&self.address)?;
            let uuid = self.uuid(state, characteristic);
            state.log(&self.address, FakeRequest::SetNotification { uuid, enable });
            Ok(())
        })
    }

    fn close(&self) {
        let mut state = self.radio.inner.state.lock().unwrap();
        if let Some(link) = state.links.get_mut(&self.address) {
            link.closed = true;
        }
        state.log(&self.address, FakeRequest::Close);
    }
}

#[derive(Debug)]
struct FakeGattServer {
    radio: FakeRadio,
}

impl FakeGattServer {
    fn with_server<T>(&self, f: impl FnOnce(&mut FakeServer) -> T) -> Result<T> {
        let mut state = self.radio.inner.state.lock().unwrap();
        state.check_refused()?;
        match state.server.as_mut() {
            Some(server) if !server.closed => Ok(f(server)),
            _ => Err(Error::Closed),
        }
    }
}

impl NativeGattServer for FakeGattServer {
    fn add_service(&self, service: &ServiceDefinition) -> Result<()> {
        self.with_server(|server| server.services.push(service.clone()))
    }

    fn send_response(&self, device: &Address, request_id: i32, status: GattStatus, _offset: u16, value: &[u8])
                     -> Result<()>
    {
        self.with_server(|server| {
            server.responses.push(FakeResponse {
                device: device.clone(),
                request_id,
                status,
                data: value.to_vec(),
            })
        })
    }

    fn notify_characteristic_changed(&self, device: &Address, characteristic: AttributeId, value: &[u8],
                                     confirm: bool)
                                     -> Result<()>
    {
        self.with_server(|server| {
            server.notifications.push(FakeNotification {
                device: device.clone(),
                characteristic,
                value: value.to_vec(),
                confirm,
            })
        })
    }

    fn close(&self) {
        let mut state = self.radio.inner.state.lock().unwrap();
        if let Some(server) = state.server.as_mut() {
            server.closed = true;
        }
    }
}
