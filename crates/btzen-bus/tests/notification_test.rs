// Integration tests for property-change subscriptions.
#![allow(clippy::unwrap_used)]

use std::time::Duration;

use btzen_bus::testing::MockBus;
use btzen_bus::{CancelReason, Error, Value};
use tokio_test::{assert_pending, assert_ready_ok, task};

const CHAR_PATH: &str = "/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF/service0010/char0011";
const GATT_CHAR: &str = "org.bluez.GattCharacteristic1";

async fn wait_for_rules(bus: &MockBus, count: usize) {
    tokio::time::timeout(Duration::from_secs(1), async {
        while bus.match_rules().len() != count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_only_registered_property_is_queued() {
    let (bus, conn) = MockBus::start().await;
    let mut handle = conn.subscribe(CHAR_PATH, GATT_CHAR, &["Value"]).await.unwrap();

    bus.emit_properties_changed(
        CHAR_PATH,
        GATT_CHAR,
        vec![
            ("Value", Value::from(vec![0x0a, 0x0b])),
            ("RSSI", Value::Int16(-60)),
        ],
    );

    assert_eq!(handle.next("Value").await.unwrap(), Value::from(vec![0x0a, 0x0b]));
    assert!(handle.latest("Value").is_none());
    assert!(handle.next("RSSI").await.is_err());
}

#[tokio::test]
async fn test_values_keep_bus_order() {
    let (bus, conn) = MockBus::start().await;
    let mut handle = conn.subscribe(CHAR_PATH, GATT_CHAR, &["Value"]).await.unwrap();

    for b in [1u8, 1, 2, 2, 3] {
        bus.emit_properties_changed(CHAR_PATH, GATT_CHAR, vec![("Value", Value::from(vec![b]))]);
    }

    let mut seen = Vec::new();
    for _ in 0..5 {
        let value = handle.next("Value").await.unwrap();
        seen.push(value.as_bytes().unwrap()[0]);
    }
    assert_eq!(seen, vec![1, 1, 2, 2, 3]);
}

#[tokio::test]
async fn test_next_stays_pending_until_a_signal_arrives() {
    let (bus, conn) = MockBus::start().await;
    let mut handle = conn.subscribe(CHAR_PATH, GATT_CHAR, &["Value"]).await.unwrap();

    let mut next = task::spawn(handle.next("Value"));
    assert_pending!(next.poll());

    bus.emit_properties_changed(CHAR_PATH, GATT_CHAR, vec![("Value", Value::from(vec![5]))]);
    tokio::time::timeout(Duration::from_secs(1), async {
        while !next.is_woken() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(assert_ready_ok!(next.poll()), Value::from(vec![5]));
}

#[tokio::test]
async fn test_signals_for_other_paths_are_ignored() {
    let (bus, conn) = MockBus::start().await;
    let mut handle = conn.subscribe(CHAR_PATH, GATT_CHAR, &["Value"]).await.unwrap();

    bus.emit_properties_changed("/org/bluez/hci0/other", GATT_CHAR, vec![("Value", Value::from(vec![9]))]);
    bus.emit_properties_changed(CHAR_PATH, "org.bluez.Device1", vec![("Value", Value::from(vec![8]))]);
    bus.emit_properties_changed(CHAR_PATH, GATT_CHAR, vec![("Value", Value::from(vec![7]))]);

    assert_eq!(handle.next("Value").await.unwrap(), Value::from(vec![7]));
}

#[tokio::test]
async fn test_next_any_reports_property_name() {
    let (bus, conn) = MockBus::start().await;
    let dev = "/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF";
    let mut handle = conn
        .subscribe(dev, "org.bluez.Device1", &["Connected", "ServicesResolved"])
        .await
        .unwrap();

    bus.emit_properties_changed(dev, "org.bluez.Device1", vec![("ServicesResolved", Value::Bool(true))]);
    let (name, value) = handle.next_any().await.unwrap();
    assert_eq!(name, "ServicesResolved");
    assert_eq!(value, Value::Bool(true));
}

#[tokio::test]
async fn test_unsubscribe_removes_match_rule() {
    let (bus, conn) = MockBus::start().await;
    let handle = conn.subscribe(CHAR_PATH, GATT_CHAR, &["Value"]).await.unwrap();
    assert_eq!(bus.match_rules(), vec![handle.rule().to_string()]);

    bus.emit_properties_changed(CHAR_PATH, GATT_CHAR, vec![("Value", Value::from(vec![1]))]);
    handle.unsubscribe().await.unwrap();
    assert!(bus.match_rules().is_empty());
}

#[tokio::test]
async fn test_dropped_handle_removes_match_rule() {
    let (bus, conn) = MockBus::start().await;
    let handle = conn.subscribe(CHAR_PATH, GATT_CHAR, &["Value"]).await.unwrap();
    wait_for_rules(&bus, 1).await;
    drop(handle);
    wait_for_rules(&bus, 0).await;
}

#[tokio::test]
async fn test_disconnect_wakes_waiting_reader() {
    let (bus, conn) = MockBus::start().await;
    let mut handle = conn.subscribe(CHAR_PATH, GATT_CHAR, &["Value"]).await.unwrap();

    let waiter = tokio::spawn(async move { handle.next("Value").await });
    tokio::task::yield_now().await;
    bus.hang_up();

    let err = waiter.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Cancelled(CancelReason::Disconnected)), "{err}");
}
