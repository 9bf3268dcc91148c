use std::hash::Hash;
use std::ops::Deref;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex as StdMutex;
use std::sync::{Arc, Weak};

use anyhow::anyhow;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::StreamExt;
use log::{debug, trace, warn};
use tokio::sync::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::advertise::AdvertiseSettings;
use crate::attribute::{CharacteristicInfo, DescriptorInfo, ServiceInfo};
use crate::backend::{BackendEvent, ConnectionEventSink, ConnectionState, Filter, Radio, RadioEventSink,
                     ScanResult, ServerEventSink};
use crate::connection::ConnectionBroker;
use crate::server::{GattServerBridge, ServerConfig, ServerEvent};
use crate::{Address, AttributeHandle, ConnectionHandle, DeviceHandle, Error, Reply, Result, RoutingHandle};

pub type ScanStream = UnboundedReceiverStream<ScanResult>;
pub type ConnectionStateStream = UnboundedReceiverStream<Result<ConnectionState>>;
pub type NotificationStream = UnboundedReceiverStream<Vec<u8>>;
pub type ServerEventStream = UnboundedReceiverStream<ServerEvent>;

/// A newly requested connection.
///
/// The connection is registered (and can be used to queue requests) straight
/// away; `states` reports the native connection state as it changes.
#[derive(Debug)]
pub struct Connection {
    pub handle: ConnectionHandle,
    pub states: ConnectionStateStream,
}

#[derive(Clone, Debug)]
pub struct Session {
    inner: Arc<SessionInner>,
}
impl PartialEq for Session {
    fn eq(&self, other: &Session) -> bool {
        Arc::<SessionInner>::ptr_eq(&self.inner, &other.inner)
    }
}
impl Eq for Session {}
impl Hash for Session {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        std::ptr::hash(Arc::<SessionInner>::as_ptr(&self.inner), state);
    }
}
impl Deref for Session {
    type Target = SessionInner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

/// Top-level map from connection handle to broker.
///
/// Connection handles are global to a session and never reused.
#[derive(Debug)]
pub(crate) struct ConnectionRegistry {
    connections: DashMap<ConnectionHandle, Arc<ConnectionBroker>>,
    next_handle: AtomicU32,
}

impl ConnectionRegistry {
    fn new() -> Self {
        Self {
            connections: DashMap::new(),
            next_handle: AtomicU32::new(1),
        }
    }

    /// Allocates a handle and registers the broker built by `open`.
    ///
    /// The registry entry stays locked while `open` runs, so native events
    /// raised by the connect request itself can't race with registration.
    fn register<F>(&self, open: F) -> Result<ConnectionHandle>
        where F: FnOnce(ConnectionHandle) -> Result<ConnectionBroker>
    {
        let raw = self.next_handle
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |raw| raw.checked_add(1))
            .map_err(|_| Error::Other(anyhow!("Connection handle space exhausted")))?;
        let handle = ConnectionHandle::new(raw)
            .ok_or_else(|| Error::Other(anyhow!("Connection handle space exhausted")))?;

        match self.connections.entry(handle) {
            Entry::Occupied(_) => Err(Error::Other(anyhow!("Connection handle {} already registered", handle))),
            Entry::Vacant(entry) => {
                let broker = open(handle)?;
                entry.insert(Arc::new(broker));
                Ok(handle)
            }
        }
    }

    fn get(&self, handle: ConnectionHandle) -> Result<Arc<ConnectionBroker>> {
        self.connections
            .get(&handle)
            .map(|entry| entry.value().clone())
            .ok_or(Error::NotFound("connection"))
    }

    fn remove(&self, handle: ConnectionHandle) -> Result<Arc<ConnectionBroker>> {
        self.connections
            .remove(&handle)
            .map(|(_, broker)| broker)
            .ok_or(Error::NotFound("connection"))
    }

    fn close_all(&self) {
        let handles: Vec<ConnectionHandle> = self.connections.iter().map(|entry| *entry.key()).collect();
        for handle in handles {
            if let Ok(broker) = self.remove(handle) {
                broker.close();
            }
        }
    }

    fn len(&self) -> usize {
        self.connections.len()
    }
}

// public for the sake of implementing Deref for ergonomics but there's no
// public API for SessionInner so nothing leaks
#[derive(Debug)]
pub struct SessionInner {
    radio: Arc<dyn Radio>,
    auto_connect: bool,

    // Native callbacks are funneled through here into the task spawned by
    // `start()`, which owns the RX end
    backend_bus: mpsc::UnboundedSender<BackendEvent>,

    // A (tokio) mutex since it serializes starting/stopping scans, not just
    // the flag itself
    is_scanning: Mutex<bool>,
    is_advertising: Mutex<bool>,

    connections: ConnectionRegistry,

    server: StdMutex<Option<GattServerBridge>>,
    next_server_generation: AtomicU32,
}

impl SessionInner {
    fn close_everything(&self) {
        let count = self.connections.len();
        if count > 0 {
            debug!("Closing {} connections", count);
        }
        self.connections.close_all();

        if let Some(bridge) = self.server.lock().unwrap().take() {
            bridge.stop();
        }
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        if let Ok(is_scanning) = self.is_scanning.try_lock() {
            if *is_scanning {
                let _ = self.radio.stop_scan();
            }
        }
        if let Ok(is_advertising) = self.is_advertising.try_lock() {
            if *is_advertising {
                let _ = self.radio.stop_advertising();
            }
        }
        self.close_everything();
    }
}

pub struct SessionConfig {
    radio: Arc<dyn Radio>,
    auto_connect: bool,
}

impl SessionConfig {
    pub fn new(radio: Arc<dyn Radio>) -> SessionConfig {
        SessionConfig {
            radio,
            auto_connect: true,
        }
    }

    /// Whether the native stack should transparently re-establish connections
    /// that drop (defaults to true)
    pub fn set_auto_connect(&mut self, auto_connect: bool) -> &mut Self {
        self.auto_connect = auto_connect;
        self
    }

    pub async fn start(self) -> Result<Session> {
        Session::start(self).await
    }
}

impl Session {
    // The backend task only holds a Weak reference to the SessionInner (to
    // avoid a reference cycle) and re-`wrap()`s it after upgrading while it
    // processes an event
    fn wrap(inner: Arc<SessionInner>) -> Self {
        Self { inner }
    }

    async fn start(config: SessionConfig) -> Result<Self> {
        let (backend_bus_tx, backend_bus_rx) = mpsc::unbounded_channel();
        config.radio.attach(RadioEventSink::new(backend_bus_tx.clone()));

        let session = Session {
            inner: Arc::new(SessionInner {
                radio: config.radio,
                auto_connect: config.auto_connect,
                backend_bus: backend_bus_tx,
                is_scanning: Mutex::new(false),
                is_advertising: Mutex::new(false),
                connections: ConnectionRegistry::new(),
                server: StdMutex::new(None),
                next_server_generation: AtomicU32::new(1),
            }),
        };

        // The task upgrades this to a strong reference only while actually
        // processing an event, otherwise it wouldn't be possible to drop a
        // Session
        let weak_session = Arc::downgrade(&session.inner);
        tokio::spawn(async move { Session::run_backend_task(weak_session, backend_bus_rx).await });

        Ok(session)
    }

    async fn run_backend_task(weak_session_inner: Weak<SessionInner>,
                              backend_bus: mpsc::UnboundedReceiver<BackendEvent>) {
        trace!("Starting task to process backend events from the backend_bus...");

        let stream = UnboundedReceiverStream::new(backend_bus);
        tokio::pin!(stream);
        while let Some(event) = stream.next().await {
            let session = match weak_session_inner.upgrade() {
                Some(strong_inner) => Session::wrap(strong_inner),
                None => {
                    trace!("Exiting backend event processor task since Session has been dropped");
                    break;
                }
            };

            match event {
                BackendEvent::Connection { connection, event } => match session.connections.get(connection) {
                    Ok(broker) => broker.handle_event(event),
                    Err(_) => trace!("Dropping {:?} for unknown connection {}", event, connection),
                },
                BackendEvent::Server { generation, event } => {
                    let mut guard = session.server.lock().unwrap();
                    match guard.as_mut() {
                        Some(bridge) if bridge.generation() == generation => bridge.handle_event(event),
                        _ => trace!("Dropping {:?} for stopped GATT server", event),
                    }
                }
                BackendEvent::RadioLost => {
                    warn!("Radio lost: tearing down all connections");
                    session.teardown().await;
                }
                BackendEvent::Flush(tx) => {
                    trace!("backend flush received");
                    let _ = tx.send(());
                }
            }
        }

        trace!("Finished task processing backend events from the backend_bus");
    }

    /// Starts scanning for devices, according to the given filter
    ///
    /// Note: It's an error to try and initiate multiple scans in parallel.
    pub async fn scan_start(&self, filter: Filter) -> Result<ScanStream> {
        self.radio.wait_powered_on().await?;

        let mut is_scanning_guard = self.is_scanning.lock().await;
        if *is_scanning_guard {
            return Err(Error::AlreadyPending("scan"));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        if let Err(err) = self.radio.start_scan(&filter, tx) {
            debug!("Native stack refused to start scanning: {:?}", err);
            return Err(Error::SubmitFailed("scan"));
        }
        *is_scanning_guard = true;

        Ok(UnboundedReceiverStream::new(rx))
    }

    pub async fn scan_stop(&self) -> Result<()> {
        let mut is_scanning_guard = self.is_scanning.lock().await;
        if !*is_scanning_guard {
            return Err(Error::Other(anyhow!("Not currently scanning")));
        }

        self.radio.stop_scan()?;
        *is_scanning_guard = false;

        Ok(())
    }

    /// Requests a GATT connection to `address`, waiting for the radio to be
    /// powered on first.
    pub async fn connect(&self, address: &Address) -> Result<Connection> {
        address.validate()?;
        self.radio.wait_powered_on().await?;

        let (states_tx, states_rx) = mpsc::unbounded_channel();
        let handle = self.connections.register(|handle| {
            let sink = ConnectionEventSink::new(handle, self.backend_bus.clone());
            let native = self.radio.connect(address, self.auto_connect, sink).map_err(|err| {
                debug!("Native stack refused connection to {}: {:?}", address, err);
                Error::SubmitFailed("connect")
            })?;
            Ok(ConnectionBroker::new(handle, native, states_tx))
        })?;
        debug!("Connection {} requested for {}", handle, address);

        Ok(Connection {
            handle,
            states: UnboundedReceiverStream::new(states_rx),
        })
    }

    /// Releases the connection. Anything still queued or in flight resolves
    /// with `Error::Closed`.
    pub fn close(&self, connection: ConnectionHandle) -> Result<()> {
        let broker = self.connections.remove(connection)?;
        broker.close();
        Ok(())
    }

    pub fn read_rssi(&self, connection: ConnectionHandle) -> Reply<i16> {
        match self.connections.get(connection) {
            Ok(broker) => broker.read_rssi(),
            Err(err) => Reply::ready(Err(err)),
        }
    }

    /// Queues a service discovery. On success every attribute handle
    /// previously issued for the connection becomes invalid, and existing
    /// notification subscriptions end.
    pub fn discover_services(&self, connection: ConnectionHandle) -> Reply<Vec<ServiceInfo>> {
        match self.connections.get(connection) {
            Ok(broker) => broker.discover_services(),
            Err(err) => Reply::ready(Err(err)),
        }
    }

    pub fn characteristics(&self, connection: ConnectionHandle, service: AttributeHandle)
                           -> Result<Vec<CharacteristicInfo>>
    {
        self.connections.get(connection)?.characteristics(service)
    }

    pub fn descriptors(&self, connection: ConnectionHandle, characteristic: AttributeHandle)
                       -> Result<Vec<DescriptorInfo>>
    {
        self.connections.get(connection)?.descriptors(characteristic)
    }

    pub fn read(&self, connection: ConnectionHandle, attribute: AttributeHandle) -> Reply<Vec<u8>> {
        match self.connections.get(connection) {
            Ok(broker) => broker.read(attribute),
            Err(err) => Reply::ready(Err(err)),
        }
    }

    pub fn write(&self, connection: ConnectionHandle, attribute: AttributeHandle, value: Vec<u8>,
                 response_required: bool)
                 -> Reply<()>
    {
        match self.connections.get(connection) {
            Ok(broker) => broker.write(attribute, value, response_required),
            Err(err) => Reply::ready(Err(err)),
        }
    }

    /// Enables value change notifications for a characteristic.
    ///
    /// Subscribing again replaces the previous stream, which then ends.
    pub fn subscribe(&self, connection: ConnectionHandle, characteristic: AttributeHandle)
                     -> Result<NotificationStream>
    {
        let rx = self.connections.get(connection)?.subscribe(characteristic)?;
        Ok(UnboundedReceiverStream::new(rx))
    }

    pub fn unsubscribe(&self, connection: ConnectionHandle, characteristic: AttributeHandle) -> Result<()> {
        self.connections.get(connection)?.unsubscribe(characteristic)
    }

    /// Replaces the connection's state stream (including the one returned by
    /// `connect`)
    pub fn watch_connection_state(&self, connection: ConnectionHandle) -> Result<ConnectionStateStream> {
        let rx = self.connections.get(connection)?.watch_state()?;
        Ok(UnboundedReceiverStream::new(rx))
    }

    pub fn start_gatt_server(&self, config: &ServerConfig) -> Result<ServerEventStream> {
        let mut server = self.server.lock().unwrap();
        if server.is_some() {
            return Err(Error::AlreadyPending("gatt server"));
        }

        let generation = self.next_server_generation.fetch_add(1, Ordering::Relaxed);
        let sink = ServerEventSink::new(generation, self.backend_bus.clone());
        let (bridge, events) = GattServerBridge::start(generation, config, &*self.radio, sink)?;
        *server = Some(bridge);

        Ok(UnboundedReceiverStream::new(events))
    }

    /// As [`start_gatt_server`](Self::start_gatt_server) with a JSON
    /// configuration
    pub fn start_gatt_server_json(&self, config: &str) -> Result<ServerEventStream> {
        let config = ServerConfig::from_json(config)?;
        self.start_gatt_server(&config)
    }

    pub fn stop_gatt_server(&self) -> Result<()> {
        let bridge = self.server.lock().unwrap().take().ok_or(Error::NotFound("gatt server"))?;
        bridge.stop();
        Ok(())
    }

    /// Answers a read or write request forwarded as a [`ServerEvent`]
    pub fn respond(&self, device: DeviceHandle, request_id: i32, data: &[u8]) -> Result<()> {
        let server = self.server.lock().unwrap();
        let bridge = server.as_ref().ok_or(Error::NotFound("gatt server"))?;
        bridge.respond(device, request_id, data)
    }

    /// Notifies (or indicates, for indicate-only characteristics) a connected
    /// device of a new value. Only one notification can be outstanding.
    pub fn notify_device(&self, device: DeviceHandle, routing_handle: RoutingHandle, data: &[u8]) -> Reply<()> {
        let mut server = self.server.lock().unwrap();
        match server.as_mut() {
            Some(bridge) => bridge.notify_device(device, routing_handle, data),
            None => Reply::ready(Err(Error::NotFound("gatt server"))),
        }
    }

    /// Starts advertising. Only one advertisement can run at a time.
    ///
    /// Unless the settings say otherwise the advertisement is connectable
    /// while the GATT server is running.
    pub async fn start_advertising(&self, settings: &AdvertiseSettings) -> Result<()> {
        let server_running = self.server.lock().unwrap().is_some();
        let advertisement = settings.resolve(server_running)?;
        self.radio.wait_powered_on().await?;

        let mut is_advertising_guard = self.is_advertising.lock().await;
        if *is_advertising_guard {
            return Err(Error::AlreadyPending("advertise"));
        }

        match self.radio.start_advertising(&advertisement).await {
            Ok(()) => {
                *is_advertising_guard = true;
                Ok(())
            }
            Err(err @ Error::NativeFailure(_)) | Err(err @ Error::Unsupported) => Err(err),
            Err(err) => {
                debug!("Native stack refused to start advertising: {:?}", err);
                Err(Error::SubmitFailed("advertise"))
            }
        }
    }

    /// As [`start_advertising`](Self::start_advertising) with JSON settings
    pub async fn start_advertising_json(&self, settings: &str) -> Result<()> {
        let settings = AdvertiseSettings::from_json(settings)?;
        self.start_advertising(&settings).await
    }

    /// Stops advertising. This succeeds even if nothing was being advertised.
    pub async fn stop_advertising(&self) -> Result<()> {
        let mut is_advertising_guard = self.is_advertising.lock().await;
        if *is_advertising_guard {
            if let Err(err) = self.radio.stop_advertising() {
                warn!("Failed to stop advertising: {:?}", err);
            }
            *is_advertising_guard = false;
        }
        Ok(())
    }

    // Stops scanning and advertising, closes every connection and stops the
    // GATT server
    async fn teardown(&self) {
        {
            let mut is_scanning_guard = self.is_scanning.lock().await;
            if *is_scanning_guard {
                if let Err(err) = self.radio.stop_scan() {
                    warn!("Failed to stop scanning: {:?}", err);
                }
                *is_scanning_guard = false;
            }
        }
        if let Err(err) = self.stop_advertising().await {
            warn!("Failed to stop advertising: {:?}", err);
        }
        self.close_everything();
    }

    /// Tears down every connection, scan, advertisement and the GATT server,
    /// then power cycles the adapter. Resolves once it's powered on again.
    pub async fn reset(&self) -> Result<()> {
        self.teardown().await;
        debug!("Power cycling the radio");
        self.radio.power_cycle().await
    }

    /// Resolves once every native event raised before the call has been
    /// processed
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.backend_bus
            .send(BackendEvent::Flush(tx))
            .map_err(|_| Error::Closed)?;
        rx.await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeRadio;
    use crate::uuid::uuid_from_u16;
    use std::str::FromStr;
    use std::time::Duration;

    async fn start(radio: &FakeRadio) -> Session {
        let _ = env_logger::builder().is_test(true).try_init();
        SessionConfig::new(Arc::new(radio.clone())).start().await.unwrap()
    }

    #[tokio::test]
    async fn session_eq() {
        let radio = FakeRadio::new();
        let session0 = start(&radio).await;
        let session1 = start(&radio).await;
        assert_ne!(session0, session1);
        assert_eq!(session0, session0.clone());
    }

    #[tokio::test]
    async fn one_scan_at_a_time() {
        let radio = FakeRadio::new();
        let session = start(&radio).await;
        let address = Address::from_str("01:02:03:04:05:06").unwrap();

        let mut results = session.scan_start(Filter::new()).await.unwrap();
        assert!(matches!(session.scan_start(Filter::new()).await, Err(Error::AlreadyPending(_))));

        radio.advertise(ScanResult { address: address.clone(), rssi: -60, name: None, advertisement: vec![2, 1, 6] });
        assert_eq!(results.next().await.unwrap().address, address);

        session.scan_stop().await.unwrap();
        assert!(results.next().await.is_none());
        assert!(session.scan_stop().await.is_err());
    }

    #[tokio::test]
    async fn scan_filter_is_applied() {
        let radio = FakeRadio::new();
        let session = start(&radio).await;
        let heart_rate = Address::from_str("01:02:03:04:05:06").unwrap();
        let battery = Address::from_str("01:02:03:04:05:07").unwrap();

        let mut filter = Filter::new();
        filter.add_service(uuid_from_u16(0x180d));
        let mut results = session.scan_start(filter).await.unwrap();

        radio.advertise(ScanResult { address: battery, rssi: -60, name: None, advertisement: vec![3, 3, 0x0f, 0x18] });
        radio.advertise(ScanResult {
            address: heart_rate.clone(),
            rssi: -50,
            name: None,
            advertisement: vec![2, 1, 6, 5, 2, 0x0f, 0x18, 0x0d, 0x18],
        });
        session.scan_stop().await.unwrap();

        assert_eq!(results.next().await.unwrap().address, heart_rate);
        assert!(results.next().await.is_none());
    }

    #[tokio::test]
    async fn connect_waits_for_power() {
        let radio = FakeRadio::new();
        radio.set_powered(false);
        let session = start(&radio).await;
        let address = Address::from_str("01:02:03:04:05:06").unwrap();
        radio.add_peripheral(&address, vec![]);

        let connecting = {
            let session = session.clone();
            let address = address.clone();
            tokio::spawn(async move { session.connect(&address).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!connecting.is_finished());
        assert!(radio.requests(&address).is_empty());

        radio.set_powered(true);
        let connection = connecting.await.unwrap().unwrap();
        assert_eq!(connection.handle.get(), 1);
    }

    #[tokio::test]
    async fn refused_connect_registers_nothing() {
        let radio = FakeRadio::new();
        let session = start(&radio).await;
        let address = Address::from_str("01:02:03:04:05:06").unwrap();
        radio.add_peripheral(&address, vec![]);

        radio.refuse_next_request();
        assert!(matches!(session.connect(&address).await, Err(Error::SubmitFailed("connect"))));

        // Handles are never reused, even for attempts that failed
        let connection = session.connect(&address).await.unwrap();
        assert_eq!(connection.handle.get(), 2);
        assert!(matches!(session.close(ConnectionHandle::new(1).unwrap()), Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn empty_address_is_rejected() {
        let radio = FakeRadio::new();
        let session = start(&radio).await;
        let empty = Address::String(" ".to_string());

        assert!(matches!(session.connect(&empty).await, Err(Error::InvalidArgument(_))));
        assert!(radio.requests(&empty).is_empty());

        // No handle was used up
        let address = Address::from_str("01:02:03:04:05:06").unwrap();
        radio.add_peripheral(&address, vec![]);
        assert_eq!(session.connect(&address).await.unwrap().handle.get(), 1);
    }

    #[test]
    fn connection_handles_never_wrap() {
        let registry = ConnectionRegistry {
            connections: DashMap::new(),
            next_handle: AtomicU32::new(u32::MAX - 1),
        };

        assert!(matches!(registry.register(|_| Err(Error::Unsupported)), Err(Error::Unsupported)));
        assert_eq!(registry.next_handle.load(Ordering::Relaxed), u32::MAX);
        for _ in 0..2 {
            assert!(matches!(registry.register(|_| Err(Error::Unsupported)), Err(Error::Other(_))));
            assert_eq!(registry.next_handle.load(Ordering::Relaxed), u32::MAX);
        }
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn one_advertisement_at_a_time() {
        let radio = FakeRadio::new();
        let session = start(&radio).await;
        let settings = AdvertiseSettings::from_json(r#"{ "broadcastData": { "serviceUUIDs": ["180d"] } }"#).unwrap();

        session.start_advertising(&settings).await.unwrap();
        assert!(!radio.advertisement().unwrap().connectable);
        assert!(matches!(session.start_advertising(&settings).await, Err(Error::AlreadyPending("advertise"))));

        session.stop_advertising().await.unwrap();
        assert!(radio.advertisement().is_none());
        session.stop_advertising().await.unwrap();

        // Connectable by default once there's a server
        let _events = session.start_gatt_server(&ServerConfig::default()).unwrap();
        session.start_advertising(&settings).await.unwrap();
        assert!(radio.advertisement().unwrap().connectable);
        session.stop_advertising().await.unwrap();

        radio.fail_next_advertising(3);
        assert!(matches!(session.start_advertising(&settings).await, Err(Error::NativeFailure(3))));
        radio.refuse_next_request();
        assert!(matches!(session.start_advertising(&settings).await, Err(Error::SubmitFailed("advertise"))));
        assert!(matches!(session.start_advertising_json("{}").await, Err(Error::InvalidArgument(_))));

        // Failed attempts don't hold the slot
        session.start_advertising_json(r#"{ "broadcastData": {} }"#).await.unwrap();

        let radio = FakeRadio::without_peripheral_role();
        let session = start(&radio).await;
        assert!(matches!(session.start_advertising(&settings).await, Err(Error::Unsupported)));
    }

    #[tokio::test]
    async fn reset_power_cycles_the_radio() {
        let radio = FakeRadio::new();
        let session = start(&radio).await;
        let _results = session.scan_start(Filter::new()).await.unwrap();
        session.start_advertising_json(r#"{ "broadcastData": {} }"#).await.unwrap();

        session.reset().await.unwrap();
        assert_eq!(radio.power_cycles(), 1);
        assert!(!radio.is_scanning());
        assert!(radio.advertisement().is_none());

        // Both slots are free again
        let _results = session.scan_start(Filter::new()).await.unwrap();
        session.start_advertising_json(r#"{ "broadcastData": {} }"#).await.unwrap();

        radio.refuse_next_request();
        assert!(session.reset().await.is_err());
        assert!(!radio.is_scanning());
    }

    #[tokio::test]
    async fn server_lifecycle() {
        let radio = FakeRadio::new();
        let session = start(&radio).await;

        assert!(matches!(session.stop_gatt_server(), Err(Error::NotFound(_))));
        assert!(matches!(session.start_gatt_server_json("[]"), Err(Error::InvalidArgument(_))));

        let mut events = session.start_gatt_server(&ServerConfig::default()).unwrap();
        assert!(matches!(session.start_gatt_server(&ServerConfig::default()), Err(Error::AlreadyPending(_))));

        session.stop_gatt_server().unwrap();
        assert!(events.next().await.is_none());
        assert!(radio.server_closed());

        let radio = FakeRadio::without_peripheral_role();
        let session = start(&radio).await;
        assert!(matches!(session.start_gatt_server(&ServerConfig::default()), Err(Error::Unsupported)));
    }
}
