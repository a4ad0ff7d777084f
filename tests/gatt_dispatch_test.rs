mod utils;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bt_le_sessions::{
    config::GattConfig,
    core::address::RawAddress,
    core::uuid::{Uuid128Bit, UuidHelper},
    gatt::{
        advertise_data::{AdvertiseData, AdvertisingSetParameters},
        context_map::CallerIdentity,
        mocks::{
            mock_advertiser::AdvertiserEvents,
            mock_battery_stats::{BatteryEvents, MockBatteryStats},
            mock_callbacks::{CallbackEvents, MockCallbacks},
            mock_gatt::{mock_gatt, GattClientEvents, MockGattEvents},
            mock_scanner::ScannerEvents,
        },
        native::{AdvertiserCallbacks, GattClientCallbacks, ScannerCallbacks},
        scan_record::ScanRecord,
        scan_settings::{ScanMode, ScanResult, ScanSettings},
        service::GattService,
        status::{AdvertisingStatus, GattStatus, ScanStatus},
    },
    Message, Stack,
};
use tokio::{
    sync::mpsc::{UnboundedReceiver, UnboundedSender},
    task::spawn_local,
};
use utils::start_test;

const CLIENT_IF: i32 = 1;
const SCANNER_ID: u8 = 2;
const ADV_ID: u8 = 3;

struct TestStack {
    service: Arc<Mutex<GattService>>,
    tx: UnboundedSender<Message>,
    events: MockGattEvents,
    _battery_rx: UnboundedReceiver<BatteryEvents>,
}

// Starts the dispatch loop over a service whose native interfaces are mocked.
fn start_stack() -> TestStack {
    let (gatt, events) = mock_gatt();
    let (battery, battery_rx) = MockBatteryStats::new();
    let (tx, rx) = Stack::create_channel();
    let service = Arc::new(Mutex::new(GattService::new(
        gatt,
        tx.clone(),
        &GattConfig::default(),
        Arc::new(battery),
    )));
    spawn_local(Stack::dispatch(rx, service.clone()));
    TestStack { service, tx, events, _battery_rx: battery_rx }
}

fn caller() -> CallerIdentity {
    CallerIdentity { uid: 3000, app_name: "test.app".into(), is_privileged: false }
}

fn register_scanner(stack: &TestStack, callback: Arc<MockCallbacks>) -> Uuid128Bit {
    stack.service.lock().unwrap().scan_manager().register_scanner(callback, &caller()).unwrap()
}

#[test]
fn test_client_registration_through_dispatch() {
    start_test(async {
        // arrange
        let mut stack = start_stack();
        let (callback, mut cb_rx) = MockCallbacks::new("client");
        let uuid = stack.service.lock().unwrap().register_client(callback, &caller()).unwrap();
        assert_eq!(
            stack.events.client.recv().await.unwrap(),
            GattClientEvents::RegisterClient(uuid)
        );

        // act: the stack grants the registration
        stack
            .tx
            .send(Message::GattClient(GattClientCallbacks::RegisterClient(0, CLIENT_IF, uuid)))
            .unwrap();

        // assert
        assert_eq!(
            cb_rx.recv().await.unwrap(),
            CallbackEvents::ClientRegistered(GattStatus::Success, CLIENT_IF)
        );
        let service = stack.service.lock().unwrap();
        assert!(!service.clients().get_by_id(CLIENT_IF).unwrap().is_pending());
    });
}

#[test]
fn test_client_death_cascades_to_connections() {
    start_test(async {
        // arrange: a registered client with a live connection
        let mut stack = start_stack();
        let (callback, mut cb_rx) = MockCallbacks::new("client");
        let uuid =
            stack.service.lock().unwrap().register_client(callback.clone(), &caller()).unwrap();
        stack.events.client.recv().await.unwrap();
        let address = RawAddress::from([1, 2, 3, 4, 5, 6]);
        stack
            .tx
            .send(Message::GattClient(GattClientCallbacks::RegisterClient(0, CLIENT_IF, uuid)))
            .unwrap();
        stack
            .tx
            .send(Message::GattClient(GattClientCallbacks::Connect(5, 0, CLIENT_IF, address)))
            .unwrap();
        cb_rx.recv().await.unwrap();
        cb_rx.recv().await.unwrap();
        assert_eq!(stack.service.lock().unwrap().get_connected_devices(), vec![address]);

        // act: the caller's process dies
        callback.die();

        // assert: the client is unregistered and its connection forgotten
        assert_eq!(
            stack.events.client.recv().await.unwrap(),
            GattClientEvents::UnregisterClient(CLIENT_IF)
        );
        let service = stack.service.lock().unwrap();
        assert!(service.clients().is_empty());
        assert!(service.get_connected_devices().is_empty());
    });
}

#[test]
fn test_advertising_set_stopped_before_grant() {
    start_test(async {
        // arrange
        let mut stack = start_stack();
        let (callback, mut cb_rx) = MockCallbacks::new("advertiser");
        let reg_id = stack
            .service
            .lock()
            .unwrap()
            .advertise_manager()
            .start_advertising_set(
                AdvertisingSetParameters::default(),
                AdvertiseData::default(),
                None,
                None,
                None,
                0,
                0,
                callback.clone(),
                &caller(),
            )
            .unwrap();
        assert!(matches!(
            stack.events.advertiser.recv().await,
            Some(AdvertiserEvents::StartAdvertisingSet(id, ..)) if id == reg_id
        ));

        // act: the caller gives up before the controller answers, then the grant arrives
        stack.service.lock().unwrap().advertise_manager().stop_advertising_set(callback.as_ref());
        stack
            .tx
            .send(Message::Advertiser(AdvertiserCallbacks::OnAdvertisingSetStarted(
                reg_id, ADV_ID, 0, 0,
            )))
            .unwrap();

        // assert: the granted set is stopped and the caller hears nothing more
        assert_eq!(
            stack.events.advertiser.recv().await.unwrap(),
            AdvertiserEvents::StopAdvertisingSet(ADV_ID)
        );
        assert!(stack.service.lock().unwrap().advertise_manager().advertisers().is_empty());
        assert!(cb_rx.try_recv().is_err());
        assert_eq!(callback.active_links(), 0);
    });
}

#[test]
fn test_advertiser_death_stops_set() {
    start_test(async {
        // arrange
        let mut stack = start_stack();
        let (callback, mut cb_rx) = MockCallbacks::new("advertiser");
        let reg_id = stack
            .service
            .lock()
            .unwrap()
            .advertise_manager()
            .start_advertising_set(
                AdvertisingSetParameters::default(),
                AdvertiseData::default(),
                None,
                None,
                None,
                0,
                0,
                callback.clone(),
                &caller(),
            )
            .unwrap();
        stack.events.advertiser.recv().await.unwrap();
        stack
            .tx
            .send(Message::Advertiser(AdvertiserCallbacks::OnAdvertisingSetStarted(
                reg_id, ADV_ID, 0, 0,
            )))
            .unwrap();
        assert_eq!(
            cb_rx.recv().await.unwrap(),
            CallbackEvents::AdvertisingSetStarted(
                reg_id,
                ADV_ID as i32,
                0,
                AdvertisingStatus::Success
            )
        );

        // act
        callback.die();

        // assert
        assert_eq!(
            stack.events.advertiser.recv().await.unwrap(),
            AdvertiserEvents::StopAdvertisingSet(ADV_ID)
        );
        assert!(stack.service.lock().unwrap().advertise_manager().advertisers().is_empty());
    });
}

#[test]
fn test_scan_results_through_dispatch() {
    start_test(async {
        // arrange: a scanning scanner
        let mut stack = start_stack();
        let (callback, mut cb_rx) = MockCallbacks::new("scanner");
        let uuid = register_scanner(&stack, callback);
        stack.events.scanner.recv().await.unwrap();
        stack
            .tx
            .send(Message::Scanner(ScannerCallbacks::OnScannerRegistered(uuid, SCANNER_ID, 0)))
            .unwrap();
        assert_eq!(
            cb_rx.recv().await.unwrap(),
            CallbackEvents::ScannerRegistered(uuid, SCANNER_ID as i32, ScanStatus::Success)
        );
        stack.service.lock().unwrap().scan_manager().start_scan(
            SCANNER_ID as i32,
            ScanSettings::default(),
            vec![],
        );
        stack.events.scanner.recv().await.unwrap();

        // act
        let adv = vec![5, 0x03, 0x0d, 0x18, 0x0f, 0x18];
        let result = ScanResult {
            address: RawAddress::from([6, 5, 4, 3, 2, 1]),
            event_type: 0x1b,
            rssi: -55,
            scan_record: ScanRecord { bytes: adv, ..Default::default() },
            ..Default::default()
        };
        stack.tx.send(Message::Scanner(ScannerCallbacks::OnScanResult(result))).unwrap();

        // assert: the record is parsed on the way through
        match cb_rx.recv().await.unwrap() {
            CallbackEvents::ScanResult(delivered) => {
                assert_eq!(delivered.rssi, -55);
                assert_eq!(
                    delivered.scan_record.service_uuids,
                    vec![UuidHelper::from_u16(0x180d), UuidHelper::from_u16(0x180f)]
                );
            }
            other => panic!("unexpected {:?}", other),
        }
    });
}

#[test]
fn test_long_scan_downgraded_by_periodic_check() {
    start_test(async {
        tokio::time::pause();

        // arrange: a scan left running, with the periodic check armed
        let mut stack = start_stack();
        let (callback, mut cb_rx) = MockCallbacks::new("scanner");
        let uuid = register_scanner(&stack, callback);
        stack.events.scanner.recv().await.unwrap();
        stack
            .tx
            .send(Message::Scanner(ScannerCallbacks::OnScannerRegistered(uuid, SCANNER_ID, 0)))
            .unwrap();
        cb_rx.recv().await.unwrap();
        stack.service.lock().unwrap().scan_manager().start_scan(
            SCANNER_ID as i32,
            ScanSettings::default(),
            vec![],
        );
        assert!(matches!(
            stack.events.scanner.recv().await,
            Some(ScannerEvents::StartScan(SCANNER_ID, ..))
        ));
        let checks = Stack::spawn_scan_duration_checks(stack.tx.clone(), Duration::from_secs(60));

        // act: the paused clock runs forward until the scan is restarted
        let start = tokio::time::Instant::now();
        assert_eq!(
            stack.events.scanner.recv().await.unwrap(),
            ScannerEvents::StopScan(SCANNER_ID)
        );

        // assert
        assert!(start.elapsed() > Duration::from_secs(30 * 60));
        match stack.events.scanner.recv().await.unwrap() {
            ScannerEvents::StartScan(SCANNER_ID, settings, _) => {
                assert_eq!(settings.scan_mode, ScanMode::Opportunistic)
            }
            other => panic!("unexpected {:?}", other),
        }
        checks.abort();
    });
}
