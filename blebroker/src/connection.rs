use std::sync::Mutex;

use log::{debug, error, trace, warn};
use tokio::sync::mpsc;

use crate::attribute::{CharacteristicInfo, DescriptorInfo, ServiceInfo, WriteType};
use crate::backend::{AttributeId, ConnectionState, GattStatus, NativeConnection, NativeEvent};
use crate::notify::NotificationRegistry;
use crate::queue::{Operation, OperationQueue};
use crate::reply::{Reply, Responder};
use crate::{AttributeHandle, ConnectionHandle, Error, HandleTable, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum AttributeKind {
    Service,
    Characteristic,
    Descriptor,
}

/// What an attribute handle stands for
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct NativeAttribute {
    id: AttributeId,
    kind: AttributeKind,
}

impl NativeAttribute {
    fn characteristic(id: AttributeId) -> Self {
        Self { id, kind: AttributeKind::Characteristic }
    }
    fn descriptor(id: AttributeId) -> Self {
        Self { id, kind: AttributeKind::Descriptor }
    }
}

#[derive(Debug)]
enum PendingOperation {
    DiscoverServices {
        tx: Responder<Vec<ServiceInfo>>,
    },
    Read {
        handle: AttributeHandle,
        target: NativeAttribute,
        tx: Responder<Vec<u8>>,
    },
    Write {
        handle: AttributeHandle,
        target: NativeAttribute,
        value: Vec<u8>,
        write_type: WriteType,
        tx: Responder<()>,
    },
}

impl Operation for PendingOperation {
    fn name(&self) -> &'static str {
        match self {
            PendingOperation::DiscoverServices { .. } => "discover services",
            PendingOperation::Read { .. } => "read",
            PendingOperation::Write { .. } => "write",
        }
    }

    fn reject(self, err: Error) {
        match self {
            PendingOperation::DiscoverServices { tx } => { let _ = tx.send(Err(err)); }
            PendingOperation::Read { tx, .. } => { let _ = tx.send(Err(err)); }
            PendingOperation::Write { tx, .. } => { let _ = tx.send(Err(err)); }
        }
    }
}

// Handles are checked again on submission: a discovery that ran while the
// operation was queued invalidates every handle issued before it
fn check_current(attributes: &HandleTable<AttributeHandle, NativeAttribute>, handle: AttributeHandle,
                 target: &NativeAttribute)
                 -> Result<()>
{
    match attributes.resolve(handle) {
        Ok(current) if current == target => Ok(()),
        _ => Err(Error::NotFound("attribute")),
    }
}

fn submit(native: &dyn NativeConnection, attributes: &HandleTable<AttributeHandle, NativeAttribute>,
          op: &PendingOperation)
          -> Result<()>
{
    match op {
        PendingOperation::DiscoverServices { .. } => native.discover_services(),
        PendingOperation::Read { handle, target, .. } => {
            check_current(attributes, *handle, target)?;
            match target.kind {
                AttributeKind::Characteristic => native.read_characteristic(target.id),
                AttributeKind::Descriptor => native.read_descriptor(target.id),
                AttributeKind::Service => Err(Error::NotFound("attribute")),
            }
        }
        PendingOperation::Write { handle, target, value, write_type, .. } => {
            check_current(attributes, *handle, target)?;
            match target.kind {
                AttributeKind::Characteristic => native.write_characteristic(target.id, value, *write_type),
                AttributeKind::Descriptor => native.write_descriptor(target.id, value),
                AttributeKind::Service => Err(Error::NotFound("attribute")),
            }
        }
    }
}

#[derive(Debug)]
struct BrokerState {
    native: Box<dyn NativeConnection>,
    queue: OperationQueue<PendingOperation>,

    // Services, characteristics and descriptors share one handle space, reset
    // by every successful service discovery
    attributes: HandleTable<AttributeHandle, NativeAttribute>,
    notifications: NotificationRegistry,

    state_tx: Option<mpsc::UnboundedSender<Result<ConnectionState>>>,
    rssi_tx: Option<Responder<i16>>,

    closed: bool,
}

impl BrokerState {
    fn resolve(&self, handle: AttributeHandle, kinds: &[AttributeKind]) -> Result<NativeAttribute> {
        let attribute = *self.attributes.resolve(handle)?;
        if kinds.contains(&attribute.kind) {
            Ok(attribute)
        } else {
            Err(Error::NotFound("attribute"))
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }

    fn enqueue(&mut self, op: PendingOperation) {
        let native = &*self.native;
        let attributes = &self.attributes;
        self.queue.enqueue(op, |op| submit(native, attributes, op));
    }

    fn advance(&mut self) {
        let native = &*self.native;
        let attributes = &self.attributes;
        self.queue.advance(|op| submit(native, attributes, op));
    }
}

/// Broker for one central-role connection.
///
/// Serializes GATT procedures through an [`OperationQueue`], owns the
/// connection's attribute handles and routes value-changed events to
/// notification subscribers.
#[derive(Debug)]
pub(crate) struct ConnectionBroker {
    handle: ConnectionHandle,
    state: Mutex<BrokerState>,
}

impl ConnectionBroker {
    pub fn new(handle: ConnectionHandle, native: Box<dyn NativeConnection>,
               state_tx: mpsc::UnboundedSender<Result<ConnectionState>>)
               -> Self
    {
        Self {
            handle,
            state: Mutex::new(BrokerState {
                native,
                queue: OperationQueue::new(),
                attributes: HandleTable::bidirectional(),
                notifications: NotificationRegistry::new(),
                state_tx: Some(state_tx),
                rssi_tx: None,
                closed: false,
            }),
        }
    }

    pub fn discover_services(&self) -> Reply<Vec<ServiceInfo>> {
        let mut state = self.state.lock().unwrap();
        if let Err(err) = state.check_open() {
            return Reply::ready(Err(err));
        }

        let (tx, reply) = Reply::channel();
        state.enqueue(PendingOperation::DiscoverServices { tx });
        reply
    }

    pub fn characteristics(&self, service: AttributeHandle) -> Result<Vec<CharacteristicInfo>> {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        state.check_open()?;

        let service = state.resolve(service, &[AttributeKind::Service])?;
        let characteristics = state.native.characteristics(service.id)?;
        characteristics.into_iter()
            .map(|characteristic| Ok::<_, Error>(CharacteristicInfo {
                handle: state.attributes.get_or_allocate(NativeAttribute::characteristic(characteristic.id))?,
                uuid: characteristic.uuid,
                permissions: characteristic.permissions,
                properties: characteristic.properties,
                write_type: characteristic.write_type,
            }))
            .collect()
    }

    pub fn descriptors(&self, characteristic: AttributeHandle) -> Result<Vec<DescriptorInfo>> {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        state.check_open()?;

        let characteristic = state.resolve(characteristic, &[AttributeKind::Characteristic])?;
        let descriptors = state.native.descriptors(characteristic.id)?;
        descriptors.into_iter()
            .map(|descriptor| Ok::<_, Error>(DescriptorInfo {
                handle: state.attributes.get_or_allocate(NativeAttribute::descriptor(descriptor.id))?,
                uuid: descriptor.uuid,
                permissions: descriptor.permissions,
            }))
            .collect()
    }

    /// Reads a characteristic or descriptor value
    pub fn read(&self, attribute: AttributeHandle) -> Reply<Vec<u8>> {
        let mut state = self.state.lock().unwrap();
        let target = match state.check_open()
            .and_then(|_| state.resolve(attribute, &[AttributeKind::Characteristic, AttributeKind::Descriptor]))
        {
            Ok(target) => target,
            Err(err) => return Reply::ready(Err(err)),
        };

        let (tx, reply) = Reply::channel();
        state.enqueue(PendingOperation::Read { handle: attribute, target, tx });
        reply
    }

    /// Writes a characteristic or descriptor value. `response_required` is
    /// ignored for descriptors.
    pub fn write(&self, attribute: AttributeHandle, value: Vec<u8>, response_required: bool) -> Reply<()> {
        let mut state = self.state.lock().unwrap();
        let target = match state.check_open()
            .and_then(|_| state.resolve(attribute, &[AttributeKind::Characteristic, AttributeKind::Descriptor]))
        {
            Ok(target) => target,
            Err(err) => return Reply::ready(Err(err)),
        };

        let (tx, reply) = Reply::channel();
        let write_type = WriteType::from_response_required(response_required);
        state.enqueue(PendingOperation::Write { handle: attribute, target, value, write_type, tx });
        reply
    }

    pub fn read_rssi(&self) -> Reply<i16> {
        let mut state = self.state.lock().unwrap();
        if let Err(err) = state.check_open() {
            return Reply::ready(Err(err));
        }
        if state.rssi_tx.is_some() {
            return Reply::ready(Err(Error::AlreadyPending("rssi")));
        }
        if let Err(err) = state.native.read_rssi() {
            debug!("Native stack refused rssi request: {:?}", err);
            return Reply::ready(Err(Error::SubmitFailed("rssi")));
        }

        let (tx, reply) = Reply::channel();
        state.rssi_tx = Some(tx);
        reply
    }

    pub fn subscribe(&self, characteristic: AttributeHandle) -> Result<mpsc::UnboundedReceiver<Vec<u8>>> {
        let mut state = self.state.lock().unwrap();
        state.check_open()?;

        let target = state.resolve(characteristic, &[AttributeKind::Characteristic])?;
        if let Err(err) = state.native.set_notification(target.id, true) {
            debug!("Native stack refused to enable notifications: {:?}", err);
            return Err(Error::SubmitFailed("subscribe"));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.notifications.subscribe(characteristic, tx);
        Ok(rx)
    }

    pub fn unsubscribe(&self, characteristic: AttributeHandle) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.check_open()?;

        let target = state.resolve(characteristic, &[AttributeKind::Characteristic])?;
        state.notifications.unsubscribe(characteristic);
        if let Err(err) = state.native.set_notification(target.id, false) {
            debug!("Native stack refused to disable notifications: {:?}", err);
            return Err(Error::SubmitFailed("unsubscribe"));
        }
        Ok(())
    }

    /// Replaces the connection state subscriber, ending the previous stream
    pub fn watch_state(&self) -> Result<mpsc::UnboundedReceiver<Result<ConnectionState>>> {
        let mut state = self.state.lock().unwrap();
        state.check_open()?;

        let (tx, rx) = mpsc::unbounded_channel();
        state.state_tx = Some(tx);
        Ok(rx)
    }

    pub fn handle_event(&self, event: NativeEvent) {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        if state.closed {
            trace!("Ignoring {:?} for closed connection {}", event, self.handle);
            return;
        }

        match event {
            NativeEvent::ConnectionStateChanged { status, state: connection_state } => {
                self.on_connection_state_changed(state, status, connection_state);
            }
            NativeEvent::RssiRead { status, rssi } => match state.rssi_tx.take() {
                Some(tx) => {
                    let _ = tx.send(status.into_result().map(|_| rssi));
                }
                None => {
                    warn!("Spurious rssi notification for connection {}", self.handle);
                }
            },
            NativeEvent::ServicesDiscovered { status } => {
                match state.queue.complete(|op| matches!(op, PendingOperation::DiscoverServices { .. })) {
                    Some(PendingOperation::DiscoverServices { tx }) => {
                        let result = status.into_result().and_then(|_| self.index_services(state));
                        let _ = tx.send(result);
                        state.advance();
                    }
                    _ => error!("Spurious discover services notification for connection {}", self.handle),
                }
            }
            NativeEvent::CharacteristicRead { status, characteristic, value } => {
                self.on_read(state, NativeAttribute::characteristic(characteristic), status, value);
            }
            NativeEvent::DescriptorRead { status, descriptor, value } => {
                self.on_read(state, NativeAttribute::descriptor(descriptor), status, value);
            }
            NativeEvent::CharacteristicWritten { status, characteristic } => {
                self.on_write(state, NativeAttribute::characteristic(characteristic), status);
            }
            NativeEvent::DescriptorWritten { status, descriptor } => {
                self.on_write(state, NativeAttribute::descriptor(descriptor), status);
            }
            NativeEvent::CharacteristicChanged { characteristic, value } => {
                match state.attributes.reverse_lookup(&NativeAttribute::characteristic(characteristic)) {
                    Ok(handle) => state.notifications.deliver(handle, value),
                    Err(_) => trace!("Value change for unknown characteristic {:?}", characteristic),
                }
            }
        }
    }

    fn on_connection_state_changed(&self, state: &mut BrokerState, status: GattStatus,
                                   connection_state: ConnectionState)
    {
        trace!("Connection {} state = {:?}, status = {:?}", self.handle, connection_state, status);

        let tx = match &state.state_tx {
            Some(tx) => tx,
            None => {
                debug!("No state subscriber for connection {}", self.handle);
                return;
            }
        };
        if let Err(err) = status.into_result() {
            let _ = tx.send(Err(err));
            state.state_tx = None;
        } else if tx.send(Ok(connection_state)).is_err() {
            state.state_tx = None;
        }
    }

    // Runs with the discovery already taken off the queue so must not fail
    // to advance, whatever happens here
    fn index_services(&self, state: &mut BrokerState) -> Result<Vec<ServiceInfo>> {
        state.attributes.reset();
        state.notifications.clear();

        let services = state.native.services()?;
        services.into_iter()
            .map(|service| Ok::<_, Error>(ServiceInfo {
                handle: state.attributes.allocate(NativeAttribute { id: service.id, kind: AttributeKind::Service })?,
                uuid: service.uuid,
                service_type: service.service_type,
            }))
            .collect()
    }

    fn on_read(&self, state: &mut BrokerState, attribute: NativeAttribute, status: GattStatus, value: Vec<u8>) {
        let finished = state.queue.complete(|op| {
            matches!(op, PendingOperation::Read { target, .. } if *target == attribute)
        });
        match finished {
            Some(PendingOperation::Read { tx, .. }) => {
                let _ = tx.send(status.into_result().map(|_| value));
                state.advance();
            }
            _ => error!("Spurious read notification for {:?} on connection {}", attribute, self.handle),
        }
    }

    fn on_write(&self, state: &mut BrokerState, attribute: NativeAttribute, status: GattStatus) {
        let finished = state.queue.complete(|op| {
            matches!(op, PendingOperation::Write { target, .. } if *target == attribute)
        });
        match finished {
            Some(PendingOperation::Write { tx, .. }) => {
                let _ = tx.send(status.into_result());
                state.advance();
            }
            _ => error!("Spurious write notification for {:?} on connection {}", attribute, self.handle),
        }
    }

    /// Releases the native connection and resolves everything outstanding
    /// with `Error::Closed`. Idempotent.
    pub fn close(&self) {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        if state.closed {
            return;
        }
        state.closed = true;

        let outstanding = state.queue.len() + state.queue.is_busy() as usize;
        debug!("Closing connection {} ({} outstanding operations)", self.handle, outstanding);

        state.native.close();
        state.queue.drain(|| Error::Closed);
        if let Some(tx) = state.rssi_tx.take() {
            let _ = tx.send(Err(Error::Closed));
        }
        state.state_tx = None;
        state.notifications.clear();
        state.attributes.reset();
    }
}
