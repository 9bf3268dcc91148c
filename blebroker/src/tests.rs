use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use uuid::Uuid;

use crate::attribute::{ServiceInfo, ServiceType, WriteType};
use crate::backend::{ConnectionState, Filter, GattStatus, NativeServerEvent, ScanResult};
use crate::fake::{FakeCharacteristic, FakeDescriptor, FakeRadio, FakeRequest, FakeResponse, FakeService};
use crate::server::ServerEvent;
use crate::session::{ConnectionStateStream, Session, SessionConfig};
use crate::uuid::uuid_from_u16;
use crate::{Address, AttributeHandle, ConnectionHandle, DeviceHandle, Error, RoutingHandle};

const HEART_RATE: Uuid = uuid_from_u16(0x180d);
const BATTERY: Uuid = uuid_from_u16(0x180f);
const MEASUREMENT: Uuid = uuid_from_u16(0x2a37);
const BATTERY_LEVEL: Uuid = uuid_from_u16(0x2a19);
const CCCD: Uuid = uuid_from_u16(0x2902);

struct Fixture {
    radio: FakeRadio,
    session: Session,
    address: Address,
    connection: ConnectionHandle,
    states: ConnectionStateStream,
}

impl Fixture {
    async fn new() -> Fixture {
        let _ = env_logger::builder().is_test(true).try_init();

        let radio = FakeRadio::new();
        let address = Address::from_str("C0:FF:EE:00:00:01").unwrap();
        radio.add_peripheral(&address, vec![
            FakeService::primary(HEART_RATE)
                .with_characteristic(FakeCharacteristic::notify(MEASUREMENT)
                                         .with_value(vec![0x01, 0x02])
                                         .with_descriptor(FakeDescriptor::new(CCCD).with_value(vec![0, 0]))),
            FakeService::secondary(BATTERY)
                .with_characteristic(FakeCharacteristic::readable(BATTERY_LEVEL).with_value(vec![87])),
        ]);

        let session = SessionConfig::new(Arc::new(radio.clone())).start().await.unwrap();
        let connection = session.connect(&address).await.unwrap();
        Fixture {
            radio,
            session,
            address,
            connection: connection.handle,
            states: connection.states,
        }
    }

    /// Completes the oldest outstanding procedure and waits for the broker
    /// to see it
    async fn complete(&self) {
        assert!(self.radio.complete_pending(&self.address));
        self.session.flush().await.unwrap();
    }

    async fn discover(&self) -> Vec<ServiceInfo> {
        let discovery = self.session.discover_services(self.connection);
        self.complete().await;
        discovery.await.unwrap()
    }

    /// Runs a discovery and returns the measurement characteristic
    async fn measurement(&self) -> AttributeHandle {
        let services = self.discover().await;
        let characteristics = self.session.characteristics(self.connection, services[0].handle).unwrap();
        assert_eq!(characteristics[0].uuid, MEASUREMENT);
        characteristics[0].handle
    }
}

#[tokio::test]
async fn connection_handles_start_at_one() {
    let fixture = Fixture::new().await;
    assert_eq!(fixture.connection.get(), 1);
    assert_eq!(fixture.radio.requests(&fixture.address), vec![FakeRequest::Connect { auto_connect: true }]);

    let mut config = SessionConfig::new(Arc::new(fixture.radio.clone()));
    config.set_auto_connect(false);
    let session = config.start().await.unwrap();
    let other = session.connect(&fixture.address).await.unwrap();
    assert_eq!(other.handle.get(), 1);
    assert_eq!(fixture.radio.requests(&fixture.address).last(),
               Some(&FakeRequest::Connect { auto_connect: false }));
}

#[tokio::test]
async fn discover_then_read_runs_in_order() {
    let fixture = Fixture::new().await;

    let discovery = fixture.session.discover_services(fixture.connection);
    assert_eq!(fixture.radio.requests(&fixture.address).last(), Some(&FakeRequest::DiscoverServices));
    fixture.complete().await;
    let services = discovery.await.unwrap();
    assert_eq!(services.len(), 2);
    assert_eq!(services[0].handle.get(), 1);
    assert_eq!(services[1].uuid, BATTERY);
    assert_eq!(services[1].service_type, ServiceType::Secondary);

    let characteristic = fixture.session.characteristics(fixture.connection, services[0].handle).unwrap()[0].handle;
    let cccd = fixture.session.descriptors(fixture.connection, characteristic).unwrap()[0].handle;

    // A read queued behind another procedure is submitted once that finishes
    let write = fixture.session.write(fixture.connection, cccd, vec![0x01, 0x00], true);
    let read = fixture.session.read(fixture.connection, characteristic);
    assert_eq!(fixture.radio.in_flight(&fixture.address), 1);

    fixture.complete().await;
    write.await.unwrap();
    assert_eq!(fixture.radio.requests(&fixture.address).last(), Some(&FakeRequest::ReadCharacteristic(MEASUREMENT)));
    fixture.complete().await;
    assert_eq!(read.await.unwrap(), vec![0x01, 0x02]);
    assert_eq!(fixture.radio.max_in_flight(&fixture.address), 1);
}

#[tokio::test]
async fn rediscovery_invalidates_queued_operations() {
    let fixture = Fixture::new().await;
    let characteristic = fixture.measurement().await;

    let discovery = fixture.session.discover_services(fixture.connection);
    let read = fixture.session.read(fixture.connection, characteristic);
    let write = fixture.session.write(fixture.connection, characteristic, vec![9], true);
    fixture.complete().await;

    let services = discovery.await.unwrap();
    assert!(services.iter().all(|service| service.handle > characteristic));
    assert!(matches!(read.await, Err(Error::NotFound("attribute"))));
    assert!(matches!(write.await, Err(Error::NotFound("attribute"))));

    // Neither reached the native stack and the queue is idle again
    assert_eq!(fixture.radio.requests(&fixture.address).last(), Some(&FakeRequest::DiscoverServices));
    assert_eq!(fixture.radio.in_flight(&fixture.address), 0);
    assert_eq!(fixture.radio.value(&fixture.address, MEASUREMENT), Some(vec![0x01, 0x02]));

    // A handle from the new generation works
    let fresh = fixture.session.characteristics(fixture.connection, services[0].handle).unwrap()[0].handle;
    let read = fixture.session.read(fixture.connection, fresh);
    fixture.complete().await;
    assert_eq!(read.await.unwrap(), vec![0x01, 0x02]);
}

#[tokio::test]
async fn write_submit_failure_does_not_block_queue() {
    let fixture = Fixture::new().await;
    let characteristic = fixture.measurement().await;

    fixture.radio.refuse_next_request();
    let write = fixture.session.write(fixture.connection, characteristic, vec![0x05], true);
    let read = fixture.session.read(fixture.connection, characteristic);
    assert!(matches!(write.await, Err(Error::SubmitFailed("write"))));

    fixture.complete().await;
    assert_eq!(read.await.unwrap(), vec![0x01, 0x02]);
}

#[tokio::test]
async fn close_resolves_queued_operations() {
    let mut fixture = Fixture::new().await;
    let characteristic = fixture.measurement().await;

    let mut read = fixture.session.read(fixture.connection, characteristic);
    let mut write = fixture.session.write(fixture.connection, characteristic, vec![1], true);
    let mut discovery = fixture.session.discover_services(fixture.connection);
    assert!(read.try_take().is_none());

    fixture.session.close(fixture.connection).unwrap();
    assert!(matches!(read.try_take(), Some(Err(Error::Closed))));
    assert!(matches!(write.try_take(), Some(Err(Error::Closed))));
    assert!(matches!(discovery.try_take(), Some(Err(Error::Closed))));
    assert_eq!(fixture.radio.requests(&fixture.address).last(), Some(&FakeRequest::Close));

    // The whole handle scope is gone
    assert!(matches!(fixture.session.read(fixture.connection, characteristic).await, Err(Error::NotFound("connection"))));
    assert!(matches!(fixture.session.close(fixture.connection), Err(Error::NotFound(_))));

    // The state stream has ended (after the initial connected state)
    fixture.session.flush().await.unwrap();
    assert!(matches!(fixture.states.next().await, Some(Ok(ConnectionState::Connected))));
    assert!(fixture.states.next().await.is_none());
}

#[tokio::test]
async fn second_rssi_request_is_rejected() {
    let fixture = Fixture::new().await;

    let first = fixture.session.read_rssi(fixture.connection);
    let second = fixture.session.read_rssi(fixture.connection);
    assert!(matches!(second.await, Err(Error::AlreadyPending("rssi"))));

    // RSSI reads don't go through the operation queue
    let discovery = fixture.session.discover_services(fixture.connection);
    assert_eq!(fixture.radio.in_flight(&fixture.address), 1);

    assert!(fixture.radio.complete_rssi(&fixture.address, GattStatus::SUCCESS, -55));
    fixture.session.flush().await.unwrap();
    assert_eq!(first.await.unwrap(), -55);

    let third = fixture.session.read_rssi(fixture.connection);
    fixture.radio.complete_rssi(&fixture.address, GattStatus(0x85), 0);
    fixture.session.flush().await.unwrap();
    assert!(matches!(third.await, Err(Error::NativeFailure(0x85))));

    fixture.complete().await;
    assert!(discovery.await.is_ok());
}

#[tokio::test]
async fn resubscribing_replaces_the_stream() {
    let fixture = Fixture::new().await;
    let characteristic = fixture.measurement().await;

    let mut first = fixture.session.subscribe(fixture.connection, characteristic).unwrap();
    let mut second = fixture.session.subscribe(fixture.connection, characteristic).unwrap();
    fixture.radio.notify(&fixture.address, MEASUREMENT, vec![0x42]);
    fixture.session.flush().await.unwrap();

    assert!(first.next().await.is_none());
    assert_eq!(second.next().await.unwrap(), vec![0x42]);
    assert!(second.next().now_or_never().is_none());

    fixture.session.unsubscribe(fixture.connection, characteristic).unwrap();
    assert_eq!(fixture.radio.requests(&fixture.address).last(),
               Some(&FakeRequest::SetNotification { uuid: MEASUREMENT, enable: false }));
    fixture.radio.notify(&fixture.address, MEASUREMENT, vec![0x43]);
    fixture.session.flush().await.unwrap();
    assert!(second.next().await.is_none());
}

#[tokio::test]
async fn refused_notification_toggles() {
    let fixture = Fixture::new().await;
    let characteristic = fixture.measurement().await;

    fixture.radio.refuse_next_request();
    assert!(matches!(fixture.session.subscribe(fixture.connection, characteristic),
                     Err(Error::SubmitFailed("subscribe"))));

    let mut values = fixture.session.subscribe(fixture.connection, characteristic).unwrap();
    fixture.radio.refuse_next_request();
    assert!(matches!(fixture.session.unsubscribe(fixture.connection, characteristic),
                     Err(Error::SubmitFailed("unsubscribe"))));

    // The recipient is dropped regardless
    assert!(values.next().await.is_none());

    // Only characteristics can be subscribed to
    let services = fixture.session.discover_services(fixture.connection);
    fixture.complete().await;
    let services = services.await.unwrap();
    assert!(matches!(fixture.session.subscribe(fixture.connection, services[0].handle), Err(Error::NotFound(_))));
}

#[tokio::test]
async fn descriptor_reads_and_writes() {
    let fixture = Fixture::new().await;
    let characteristic = fixture.measurement().await;
    let descriptors = fixture.session.descriptors(fixture.connection, characteristic).unwrap();
    assert_eq!(descriptors.len(), 1);
    let cccd = descriptors[0].handle;

    // Descriptor writes ignore response_required
    let write = fixture.session.write(fixture.connection, cccd, vec![0x01, 0x00], false);
    let read = fixture.session.read(fixture.connection, cccd);
    fixture.complete().await;
    write.await.unwrap();
    fixture.complete().await;
    assert_eq!(read.await.unwrap(), vec![0x01, 0x00]);

    assert_eq!(fixture.radio.value(&fixture.address, CCCD), Some(vec![0x01, 0x00]));
    assert!(fixture.radio.requests(&fixture.address).contains(&FakeRequest::WriteDescriptor {
        uuid: CCCD,
        value: vec![0x01, 0x00],
    }));
}

#[tokio::test]
async fn every_operation_resolves_exactly_once() {
    let fixture = Fixture::new().await;
    let services = fixture.discover().await;
    let level = fixture.session.characteristics(fixture.connection, services[1].handle).unwrap()[0].handle;

    let mut replies: Vec<_> = (0..12u8)
        .map(|i| {
            if i % 2 == 0 {
                fixture.session.write(fixture.connection, level, vec![i], true).map(|r| r.map(|_| Vec::<u8>::new())).boxed()
            } else {
                fixture.session.read(fixture.connection, level).boxed()
            }
        })
        .collect();

    let mut step = 0;
    while fixture.radio.in_flight(&fixture.address) > 0 {
        step += 1;
        if step % 4 == 0 {
            // The next submit (as the queue advances) gets refused
            fixture.radio.refuse_next_request();
        }
        if step % 3 == 0 {
            fixture.radio.fail_pending(&fixture.address, GattStatus::FAILURE);
        } else {
            fixture.radio.complete_pending(&fixture.address);
        }
        fixture.session.flush().await.unwrap();
        assert!(fixture.radio.in_flight(&fixture.address) <= 1);
    }

    let (mut ok, mut native, mut refused) = (0, 0, 0);
    for reply in replies.iter_mut() {
        match reply.now_or_never() {
            Some(Ok(_)) => ok += 1,
            Some(Err(Error::NativeFailure(_))) => native += 1,
            Some(Err(Error::SubmitFailed(_))) => refused += 1,
            other => panic!("unexpected resolution {:?}", other),
        }
    }
    assert_eq!(ok + native + refused, 12);
    assert!(native > 0 && refused > 0);
    assert_eq!(fixture.radio.max_in_flight(&fixture.address), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_keep_one_procedure_in_flight() {
    let fixture = Fixture::new().await;
    let services = fixture.discover().await;
    let level = fixture.session.characteristics(fixture.connection, services[1].handle).unwrap()[0].handle;

    let callers: Vec<_> = (0..4u8)
        .map(|caller| {
            let session = fixture.session.clone();
            let connection = fixture.connection;
            tokio::spawn(async move {
                let mut replies = Vec::new();
                for i in 0..100u8 {
                    replies.push(if i % 2 == 0 {
                        session.write(connection, level, vec![caller, i], true).map(|r| r.map(|_| ())).boxed()
                    } else {
                        session.read(connection, level).map(|r| r.map(|_| ())).boxed()
                    });
                    if i % 10 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
                futures::future::join_all(replies).await
            })
        })
        .collect();

    // Completions, native failures and refusals race with the callers still
    // enqueueing
    let mut step = 0;
    while !callers.iter().all(|caller| caller.is_finished()) {
        if fixture.radio.in_flight(&fixture.address) == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
            continue;
        }
        step += 1;
        if step % 5 == 0 {
            fixture.radio.refuse_next_request();
        }
        if step % 3 == 0 {
            fixture.radio.fail_pending(&fixture.address, GattStatus::FAILURE);
        } else {
            fixture.radio.complete_pending(&fixture.address);
        }
        fixture.session.flush().await.unwrap();
        assert!(fixture.radio.in_flight(&fixture.address) <= 1);
    }

    let (mut ok, mut native, mut refused) = (0, 0, 0);
    for caller in callers {
        for outcome in caller.await.unwrap() {
            match outcome {
                Ok(()) => ok += 1,
                Err(Error::NativeFailure(_)) => native += 1,
                Err(Error::SubmitFailed(_)) => refused += 1,
                Err(err) => panic!("unexpected resolution {:?}", err),
            }
        }
    }
    assert_eq!(ok + native + refused, 400);
    assert!(ok > 0 && native > 0 && refused > 0);
    assert_eq!(fixture.radio.max_in_flight(&fixture.address), 1);
}

#[tokio::test]
async fn attribute_handles_restart_on_a_new_connection() {
    let fixture = Fixture::new().await;
    let first = fixture.discover().await;
    assert_eq!(first[0].handle.get(), 1);
    let characteristics = fixture.session.characteristics(fixture.connection, first[0].handle).unwrap();
    assert!(characteristics[0].handle.get() > 2);

    let rediscover = |connection: ConnectionHandle| {
        let session = fixture.session.clone();
        let radio = fixture.radio.clone();
        let address = fixture.address.clone();
        async move {
            let discovery = session.discover_services(connection);
            assert!(radio.complete_pending(&address));
            session.flush().await.unwrap();
            discovery.await.unwrap()
        }
    };

    fixture.session.close(fixture.connection).unwrap();
    let second = fixture.session.connect(&fixture.address).await.unwrap().handle;
    assert_eq!(second.get(), 2);
    assert_eq!(rediscover(second).await[0].handle.get(), 1);

    fixture.session.reset().await.unwrap();
    let third = fixture.session.connect(&fixture.address).await.unwrap().handle;
    assert_eq!(third.get(), 3);
    let services = rediscover(third).await;
    assert_eq!(services[0].handle.get(), 1);
    assert_eq!(services[1].handle.get(), 2);
}

#[tokio::test]
async fn write_type_follows_response_required() {
    let fixture = Fixture::new().await;
    let characteristic = fixture.measurement().await;

    let write = fixture.session.write(fixture.connection, characteristic, vec![7], false);
    fixture.complete().await;
    write.await.unwrap();
    assert_eq!(fixture.radio.requests(&fixture.address).last(), Some(&FakeRequest::WriteCharacteristic {
        uuid: MEASUREMENT,
        value: vec![7],
        write_type: WriteType::WithoutResponse,
    }));
}

#[tokio::test]
async fn connection_state_failures_end_the_stream() {
    let mut fixture = Fixture::new().await;
    fixture.session.flush().await.unwrap();
    assert!(matches!(fixture.states.next().await, Some(Ok(ConnectionState::Connected))));

    // A disconnect is only reported, queued work is left alone
    let discovery = fixture.session.discover_services(fixture.connection);
    fixture.radio.set_connection_state(&fixture.address, GattStatus::SUCCESS, ConnectionState::Disconnected);
    fixture.session.flush().await.unwrap();
    assert!(matches!(fixture.states.next().await, Some(Ok(ConnectionState::Disconnected))));
    assert_eq!(fixture.radio.in_flight(&fixture.address), 1);

    fixture.radio.set_connection_state(&fixture.address, GattStatus(0x85), ConnectionState::Disconnected);
    fixture.session.flush().await.unwrap();
    assert!(matches!(fixture.states.next().await, Some(Err(Error::NativeFailure(0x85)))));
    assert!(fixture.states.next().await.is_none());

    let mut states = fixture.session.watch_connection_state(fixture.connection).unwrap();
    fixture.radio.set_connection_state(&fixture.address, GattStatus::SUCCESS, ConnectionState::Connected);
    fixture.session.flush().await.unwrap();
    assert!(matches!(states.next().await, Some(Ok(ConnectionState::Connected))));

    fixture.complete().await;
    assert!(discovery.await.is_ok());
}

#[tokio::test]
async fn unknown_handles_are_rejected_up_front() {
    let fixture = Fixture::new().await;
    let bogus = AttributeHandle::new(99).unwrap();

    assert!(matches!(fixture.session.read(fixture.connection, bogus).await, Err(Error::NotFound("attribute"))));
    assert!(matches!(fixture.session.characteristics(fixture.connection, bogus), Err(Error::NotFound(_))));
    assert!(matches!(fixture.session.read_rssi(ConnectionHandle::new(7).unwrap()).await,
                     Err(Error::NotFound("connection"))));
    assert_eq!(fixture.radio.in_flight(&fixture.address), 0);
}

const SERVER_CONFIG: &str = r#"{
    "nextHandle": 1,
    "services": [{
        "uuid": "180d",
        "type": 0,
        "characteristics": [{
            "uuid": "2a37",
            "properties": 26,
            "permissions": 17,
            "onReadRequestHandle": 41,
            "onWriteRequestHandle": 42
        }]
    }]
}"#;

#[tokio::test]
async fn server_write_is_routed_and_answered_once() {
    let _ = env_logger::builder().is_test(true).try_init();
    let radio = FakeRadio::new();
    let session = SessionConfig::new(Arc::new(radio.clone())).start().await.unwrap();
    let mut events = session.start_gatt_server_json(SERVER_CONFIG).unwrap();

    let central = Address::from_str("12:34:56:78:9A:BC").unwrap();
    let attribute = radio.server_attribute_id(MEASUREMENT).unwrap();
    radio.server_request(NativeServerEvent::ConnectionStateChanged {
        device: central.clone(),
        status: GattStatus::SUCCESS,
        connected: true,
    });
    radio.server_request(NativeServerEvent::WriteRequest {
        device: central.clone(),
        request_id: 3,
        attribute,
        prepared: false,
        response_needed: true,
        offset: 0,
        value: vec![0xAB],
    });
    session.flush().await.unwrap();

    let device = DeviceHandle::new(1).unwrap();
    assert_eq!(events.next().await.unwrap(), ServerEvent::Connection { device, connected: true });
    assert_eq!(events.next().await.unwrap(), ServerEvent::Write {
        device,
        request_id: 3,
        routing_handle: RoutingHandle(42),
        data: vec![0xAB],
    });

    session.respond(device, 3, &[0x00]).unwrap();
    assert_eq!(radio.server_responses(), vec![FakeResponse {
        device: central.clone(),
        request_id: 3,
        status: GattStatus::SUCCESS,
        data: vec![0x00],
    }]);

    assert!(matches!(session.respond(DeviceHandle::new(5).unwrap(), 3, &[]), Err(Error::NotFound("device"))));
    radio.refuse_next_request();
    assert!(matches!(session.respond(device, 4, &[]), Err(Error::SubmitFailed("respond"))));
    assert_eq!(radio.server_responses().len(), 1);
}

#[test]
fn server_events_serialize_like_the_wire_format() {
    let event = ServerEvent::Read {
        device: DeviceHandle::new(2).unwrap(),
        request_id: 9,
        routing_handle: RoutingHandle(41),
    };
    let json = serde_json::to_value(&event).unwrap();
    assert_eq!(json, serde_json::json!({ "name": "read", "device": 2, "requestId": 9, "routingHandle": 41 }));
}

#[tokio::test]
async fn notify_device_resolves_on_notification_sent() {
    let radio = FakeRadio::new();
    let session = SessionConfig::new(Arc::new(radio.clone())).start().await.unwrap();
    let _events = session.start_gatt_server_json(SERVER_CONFIG).unwrap();
    let central = Address::from_str("12:34:56:78:9A:BC").unwrap();
    radio.server_request(NativeServerEvent::ConnectionStateChanged {
        device: central.clone(),
        status: GattStatus::SUCCESS,
        connected: true,
    });
    session.flush().await.unwrap();

    let device = DeviceHandle::new(1).unwrap();
    let sent = session.notify_device(device, RoutingHandle(41), &[0x10]);
    assert!(matches!(session.notify_device(device, RoutingHandle(41), &[0x11]).await,
                     Err(Error::AlreadyPending("notify"))));

    let notifications = radio.server_notifications();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].value, vec![0x10]);
    assert!(!notifications[0].confirm);

    radio.complete_notification(&central, GattStatus::SUCCESS);
    session.flush().await.unwrap();
    sent.await.unwrap();

    // Events from a server that has since been replaced are dropped
    session.stop_gatt_server().unwrap();
    let mut events = session.start_gatt_server_json(SERVER_CONFIG).unwrap();
    session.flush().await.unwrap();
    assert!(events.next().now_or_never().is_none());
}

#[tokio::test]
async fn radio_loss_tears_everything_down() {
    let fixture = Fixture::new().await;
    let discovery = fixture.session.discover_services(fixture.connection);
    let mut scan = fixture.session.scan_start(Filter::new()).await.unwrap();
    let mut events = fixture.session.start_gatt_server_json(SERVER_CONFIG).unwrap();

    fixture.radio.advertise(ScanResult {
        address: fixture.address.clone(),
        rssi: -70,
        name: Some("hrm".to_string()),
        advertisement: vec![],
    });
    assert_eq!(scan.next().await.unwrap().name.as_deref(), Some("hrm"));

    fixture.radio.power_off();
    fixture.session.flush().await.unwrap();

    assert!(matches!(discovery.await, Err(Error::Closed)));
    assert!(scan.next().await.is_none());
    assert!(events.next().await.is_none());
    assert!(!fixture.radio.is_scanning());
    assert!(fixture.radio.server_closed());
    assert!(matches!(fixture.session.close(fixture.connection), Err(Error::NotFound(_))));
    assert!(matches!(fixture.session.stop_gatt_server(), Err(Error::NotFound(_))));
}

#[tokio::test]
async fn reset_closes_connections_and_server() {
    let fixture = Fixture::new().await;
    let characteristic = fixture.measurement().await;
    let mut values = fixture.session.subscribe(fixture.connection, characteristic).unwrap();
    let rssi = fixture.session.read_rssi(fixture.connection);
    let _events = fixture.session.start_gatt_server_json(SERVER_CONFIG).unwrap();

    fixture.session.reset().await.unwrap();
    assert!(matches!(rssi.await, Err(Error::Closed)));
    assert!(values.next().await.is_none());
    assert!(fixture.radio.server_closed());
    assert_eq!(fixture.radio.power_cycles(), 1);

    // The session is still usable afterwards
    let connection = fixture.session.connect(&fixture.address).await.unwrap();
    assert_eq!(connection.handle.get(), 2);
    fixture.session.start_gatt_server_json(SERVER_CONFIG).unwrap();
}
