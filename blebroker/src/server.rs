use std::collections::HashMap;

use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::attribute::{CharacteristicProperties, Permissions, ServiceType};
use crate::backend::{AttributeId, CharacteristicDefinition, DescriptorDefinition, GattStatus, NativeGattServer,
                     NativeServerEvent, Radio, ServerEventSink, ServiceDefinition};
use crate::reply::{Reply, Responder};
use crate::uuid::parse_uuid;
use crate::{Address, DeviceHandle, Error, HandleTable, Result, RoutingHandle};

/// Configuration for a local GATT server.
///
/// This is the JSON shape accepted by [`ServerConfig::from_json`]:
///
/// ```json
/// {
///   "nextHandle": 1,
///   "services": [{
///     "uuid": "180d", "type": 0,
///     "characteristics": [{
///       "uuid": "2a37", "properties": 16, "permissions": 1,
///       "onReadRequestHandle": 10, "onWriteRequestHandle": 11,
///       "descriptors": [{ "uuid": "2902", "permissions": 17,
///                         "onReadRequestHandle": 12, "onWriteRequestHandle": 13 }]
///     }]
///   }]
/// }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// The first device handle to allocate (defaults to 1)
    #[serde(default)]
    pub next_handle: Option<u32>,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    pub uuid: String,
    /// 0 = primary, 1 = secondary
    #[serde(rename = "type", default)]
    pub service_type: u32,
    #[serde(default)]
    pub characteristics: Vec<CharacteristicConfig>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CharacteristicConfig {
    pub uuid: String,
    #[serde(default)]
    pub properties: u32,
    #[serde(default)]
    pub permissions: u32,
    #[serde(default)]
    pub on_read_request_handle: Option<RoutingHandle>,
    #[serde(default)]
    pub on_write_request_handle: Option<RoutingHandle>,
    #[serde(default)]
    pub descriptors: Vec<DescriptorConfig>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescriptorConfig {
    pub uuid: String,
    #[serde(default)]
    pub permissions: u32,
    #[serde(default)]
    pub on_read_request_handle: Option<RoutingHandle>,
    #[serde(default)]
    pub on_write_request_handle: Option<RoutingHandle>,
}

impl ServerConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

fn parse_permissions(raw: u32) -> Result<Permissions> {
    Permissions::from_bits(raw).ok_or_else(|| Error::InvalidArgument(format!("Invalid permissions {:#x}", raw)))
}

/// Events forwarded from remote centrals talking to the local GATT server
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "camelCase")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    Connection {
        device: DeviceHandle,
        connected: bool,
    },
    #[serde(rename_all = "camelCase")]
    Read {
        device: DeviceHandle,
        request_id: i32,
        routing_handle: RoutingHandle,
    },
    #[serde(rename_all = "camelCase")]
    Write {
        device: DeviceHandle,
        request_id: i32,
        routing_handle: RoutingHandle,
        data: Vec<u8>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct NotifyTarget {
    characteristic: AttributeId,
    confirm: bool,
}

/// The native service tree plus routing tables derived from a [`ServerConfig`]
#[derive(Debug, Default)]
struct ServiceLayout {
    services: Vec<ServiceDefinition>,
    read_routes: HashMap<AttributeId, RoutingHandle>,
    write_routes: HashMap<AttributeId, RoutingHandle>,
    notify_targets: HashMap<RoutingHandle, NotifyTarget>,
}

impl ServiceLayout {
    fn build(config: &ServerConfig) -> Result<Self> {
        let mut layout = ServiceLayout::default();
        let mut next_id = 1u64;
        let mut allocate_id = || {
            let id = AttributeId(next_id);
            next_id += 1;
            id
        };

        for service in config.services.iter() {
            let service_type = ServiceType::from_raw(service.service_type)
                .ok_or_else(|| Error::InvalidArgument(format!("Invalid service type {}", service.service_type)))?;
            let mut definition = ServiceDefinition {
                id: allocate_id(),
                uuid: parse_uuid(&service.uuid)?,
                service_type,
                characteristics: vec![],
            };

            for characteristic in service.characteristics.iter() {
                let properties = CharacteristicProperties::from_bits(characteristic.properties)
                    .ok_or_else(|| Error::InvalidArgument(format!("Invalid properties {:#x}", characteristic.properties)))?;
                let id = allocate_id();
                layout.route(id, characteristic.on_read_request_handle, characteristic.on_write_request_handle);

                // Indicate-only characteristics need confirmed indications
                let confirm = properties.contains(CharacteristicProperties::INDICATE) &&
                    !properties.contains(CharacteristicProperties::NOTIFY);
                for routing_handle in characteristic.on_read_request_handle.iter()
                    .chain(characteristic.on_write_request_handle.iter())
                {
                    layout.notify_targets
                        .entry(*routing_handle)
                        .or_insert(NotifyTarget { characteristic: id, confirm });
                }

                let mut characteristic_definition = CharacteristicDefinition {
                    id,
                    uuid: parse_uuid(&characteristic.uuid)?,
                    properties,
                    permissions: parse_permissions(characteristic.permissions)?,
                    descriptors: vec![],
                };

                for descriptor in characteristic.descriptors.iter() {
                    let id = allocate_id();
                    layout.route(id, descriptor.on_read_request_handle, descriptor.on_write_request_handle);
                    characteristic_definition.descriptors.push(DescriptorDefinition {
                        id,
                        uuid: parse_uuid(&descriptor.uuid)?,
                        permissions: parse_permissions(descriptor.permissions)?,
                    });
                }

                definition.characteristics.push(characteristic_definition);
            }

            layout.services.push(definition);
        }

        Ok(layout)
    }

    fn route(&mut self, id: AttributeId, read: Option<RoutingHandle>, write: Option<RoutingHandle>) {
        if let Some(read) = read {
            self.read_routes.insert(id, read);
        }
        if let Some(write) = write {
            self.write_routes.insert(id, write);
        }
    }
}

/// Peripheral-role counterpart of the connection broker.
///
/// Forwards requests from remote centrals as [`ServerEvent`]s tagged with the
/// caller's routing handles, and correlates the caller's responses and
/// outgoing notifications with native devices.
#[derive(Debug)]
pub(crate) struct GattServerBridge {
    generation: u32,
    native: Box<dyn NativeGattServer>,

    // Never reset while the server is open, so a reconnecting device keeps
    // its handle
    devices: HandleTable<DeviceHandle, Address>,

    read_routes: HashMap<AttributeId, RoutingHandle>,
    write_routes: HashMap<AttributeId, RoutingHandle>,
    notify_targets: HashMap<RoutingHandle, NotifyTarget>,

    events_tx: mpsc::UnboundedSender<ServerEvent>,
    notify_tx: Option<Responder<()>>,
}

impl GattServerBridge {
    /// Validates `config`, opens a native server and registers its services.
    ///
    /// Nothing is opened if the configuration is invalid.
    pub fn start(generation: u32, config: &ServerConfig, radio: &dyn Radio, sink: ServerEventSink)
                 -> Result<(Self, mpsc::UnboundedReceiver<ServerEvent>)>
    {
        let layout = ServiceLayout::build(config)?;
        let native = radio.open_gatt_server(sink)?;

        for service in layout.services.iter() {
            if let Err(err) = native.add_service(service) {
                warn!("Failed to add service {}: {:?}", service.uuid, err);
                native.close();
                return Err(Error::SubmitFailed("add service"));
            }
        }
        debug!("GATT server started with {} services", layout.services.len());

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let first_device = config.next_handle.unwrap_or(1);
        let bridge = Self {
            generation,
            native,
            devices: HandleTable::bidirectional().starting_at(first_device),
            read_routes: layout.read_routes,
            write_routes: layout.write_routes,
            notify_targets: layout.notify_targets,
            events_tx,
            notify_tx: None,
        };
        Ok((bridge, events_rx))
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    fn emit(&self, event: ServerEvent) {
        if self.events_tx.send(event).is_err() {
            trace!("Server event stream has been dropped");
        }
    }

    /// Answers a request nobody can route
    fn refuse(&self, device: &Address, request_id: i32) {
        if let Err(err) = self.native.send_response(device, request_id, GattStatus::REQUEST_NOT_SUPPORTED, 0, &[]) {
            warn!("Failed to refuse request {} from {}: {:?}", request_id, device, err);
        }
    }

    pub fn handle_event(&mut self, event: NativeServerEvent) {
        match event {
            NativeServerEvent::ConnectionStateChanged { device, status, connected } => {
                if !status.is_success() {
                    debug!("Device {} connection state changed with status {:?}", device, status);
                }
                match self.devices.get_or_allocate(device) {
                    Ok(handle) => self.emit(ServerEvent::Connection { device: handle, connected }),
                    Err(err) => warn!("Dropping connection event: {:?}", err),
                }
            }
            NativeServerEvent::ReadRequest { device, request_id, offset, attribute } => {
                trace!("Read request {} from {} (offset = {})", request_id, device, offset);
                match self.read_routes.get(&attribute).copied() {
                    Some(routing_handle) => match self.devices.get_or_allocate(device.clone()) {
                        Ok(handle) => self.emit(ServerEvent::Read { device: handle, request_id, routing_handle }),
                        Err(err) => {
                            warn!("Refusing read request {}: {:?}", request_id, err);
                            self.refuse(&device, request_id);
                        }
                    },
                    None => {
                        warn!("No read routing for {:?}", attribute);
                        self.refuse(&device, request_id);
                    }
                }
            }
            NativeServerEvent::WriteRequest { device, request_id, attribute, prepared, response_needed, offset,
                                              value } =>
            {
                trace!("Write request {} from {} (prepared = {}, response needed = {}, offset = {})",
                       request_id, device, prepared, response_needed, offset);
                match self.write_routes.get(&attribute).copied() {
                    Some(routing_handle) => match self.devices.get_or_allocate(device.clone()) {
                        Ok(handle) => {
                            self.emit(ServerEvent::Write { device: handle, request_id, routing_handle, data: value });
                        }
                        Err(err) => {
                            warn!("Refusing write request {}: {:?}", request_id, err);
                            self.refuse(&device, request_id);
                        }
                    },
                    None => {
                        warn!("No write routing for {:?}", attribute);
                        self.refuse(&device, request_id);
                    }
                }
            }
            NativeServerEvent::ExecuteWrite { device, request_id, execute } => {
                // Prepared writes are forwarded as they arrive so there's
                // nothing left to commit (or cancel)
                trace!("Acknowledging execute write {} from {} (execute = {})", request_id, device, execute);
                if let Err(err) = self.native.send_response(&device, request_id, GattStatus::SUCCESS, 0, &[]) {
                    warn!("Failed to acknowledge execute write: {:?}", err);
                }
            }
            NativeServerEvent::NotificationSent { device, status } => match self.notify_tx.take() {
                Some(tx) => {
                    let _ = tx.send(status.into_result());
                }
                None => warn!("Spurious notification sent event for {}", device),
            },
            NativeServerEvent::MtuChanged { device, mtu } => {
                debug!("MTU for {} changed to {}", device, mtu);
            }
            NativeServerEvent::ServiceAdded { status, service } => {
                if status.is_success() {
                    debug!("Service {:?} added", service);
                } else {
                    warn!("Failed to add service {:?}: status = {:?}", service, status);
                }
            }
        }
    }

    /// Sends the caller's answer to a read or write request. The payload is
    /// passed through verbatim, and may be empty.
    pub fn respond(&self, device: DeviceHandle, request_id: i32, data: &[u8]) -> Result<()> {
        let address = self.devices.resolve(device)?;
        if let Err(err) = self.native.send_response(address, request_id, GattStatus::SUCCESS, 0, data) {
            debug!("Native stack refused response to {}: {:?}", request_id, err);
            return Err(Error::SubmitFailed("respond"));
        }
        Ok(())
    }

    /// Pushes a value change to a connected device. Only one notification can
    /// be outstanding at a time.
    pub fn notify_device(&mut self, device: DeviceHandle, routing_handle: RoutingHandle, data: &[u8]) -> Reply<()> {
        if self.notify_tx.is_some() {
            return Reply::ready(Err(Error::AlreadyPending("notify")));
        }
        let address = match self.devices.resolve(device) {
            Ok(address) => address,
            Err(err) => return Reply::ready(Err(err)),
        };
        let target = match self.notify_targets.get(&routing_handle) {
            Some(target) => *target,
            None => return Reply::ready(Err(Error::NotFound("routing"))),
        };

        if let Err(err) = self.native.notify_characteristic_changed(address, target.characteristic, data, target.confirm) {
            debug!("Native stack refused notification: {:?}", err);
            return Reply::ready(Err(Error::SubmitFailed("notify")));
        }

        let (tx, reply) = Reply::channel();
        self.notify_tx = Some(tx);
        reply
    }

    /// Closes the native server. The event stream ends once the bridge is
    /// dropped.
    pub fn stop(mut self) {
        debug!("Stopping GATT server ({} known devices)", self.devices.len());
        self.native.close();
        if let Some(tx) = self.notify_tx.take() {
            let _ = tx.send(Err(Error::Closed));
        }
    }
}
