// Integration tests for sessions against a fake BlueZ on the mock bus.
#![allow(clippy::unwrap_used)]

mod common;

use std::time::Duration;

use btzen_bus::testing::CLIENT_NAME;
use btzen_bus::{CancelReason, Message, PROPERTIES_INTERFACE, Value};
use btzen_core::profile::{GATT_PROFILE_INTERFACE, PROFILE_PATH};
use btzen_core::{CoreError, DeviceState, ReconnectConfig, SessionConfig, Trigger};
use common::{
    CONF_PATH, DATA_PATH, FakeBluez, TRIGGER_PATH, battery, connected, connection_error,
    env_sensing, temperature, test_config, wait_calls, wait_state,
};
use pretty_assertions::assert_eq;
use tokio_stream::StreamExt;

// ── Lifecycle ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_connect_registers_application_and_dials() {
    let fake = FakeBluez::start().await;
    let dev = temperature(Trigger::Manual);
    let session = fake.session([dev.clone()]).await;
    connected(&session, &dev).await;

    assert_eq!(fake.count("RegisterApplication"), 1);
    let dial = &fake.bus.calls_to("ConnectDevice")[0];
    let filter = dial.first_arg().unwrap();
    assert_eq!(filter.dict_get("Address").unwrap().as_str(), Some(common::MAC));
    assert_eq!(filter.dict_get("AddressType").unwrap().as_str(), Some("public"));
    assert_eq!(session.device_state(&dev).unwrap(), DeviceState::Connected);
    assert!(session.is_active());
    session.close().await;
}

#[tokio::test]
async fn test_profile_lists_service_uuids() {
    let fake = FakeBluez::start().await;
    let session = fake.session([temperature(Trigger::Manual), battery()]).await;

    let get = Message::method_call(CLIENT_NAME, PROFILE_PATH, PROPERTIES_INTERFACE, "Get")
        .with_args([Value::from(GATT_PROFILE_INTERFACE), Value::from("UUIDs")])
        .unwrap();
    let reply = fake.bus.call_client(get).await.into_result().unwrap();
    let uuids: Vec<String> = reply
        .first_arg()
        .unwrap()
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap().to_owned())
        .collect();
    assert_eq!(
        uuids,
        vec![
            "0000180f-0000-1000-8000-00805f9b34fb".to_owned(),
            "0000181a-0000-1000-8000-00805f9b34fb".to_owned(),
        ]
    );
    session.close().await;
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let fake = FakeBluez::start().await;
    let dev = temperature(Trigger::Manual);
    let session = fake.session([dev.clone()]).await;
    connected(&session, &dev).await;

    session.close().await;
    session.close().await;

    assert!(!session.is_active());
    assert_eq!(fake.count("UnregisterApplication"), 1);
    assert_eq!(fake.count("Disconnect"), 1);
    assert_eq!(session.device_state(&dev).unwrap(), DeviceState::Disconnected);

    let err = session.read(&dev, None).await.unwrap_err();
    assert!(
        matches!(err, CoreError::Cancelled { reason: CancelReason::Closed }),
        "{err}"
    );
}

#[tokio::test]
async fn test_agent_is_registered_on_request() {
    let fake = FakeBluez::start().await;
    let config = SessionConfig {
        register_agent: true,
        ..test_config()
    };
    let session = fake.session_with(config, [battery()]).await;
    assert_eq!(fake.count("RegisterAgent"), 1);
    assert_eq!(fake.count("RequestDefaultAgent"), 1);

    session.close().await;
    assert_eq!(fake.count("UnregisterAgent"), 1);
}

#[tokio::test]
async fn test_dropped_session_unregisters_in_background() {
    let fake = FakeBluez::start().await;
    let config = SessionConfig {
        register_agent: true,
        ..test_config()
    };
    let session = fake.session_with(config, [battery()]).await;
    drop(session);

    wait_calls(&fake, "UnregisterApplication", 1).await;
    wait_calls(&fake, "UnregisterAgent", 1).await;
}

#[tokio::test]
async fn test_duplicate_device_is_a_configuration_error() {
    let fake = FakeBluez::start().await;
    let dev = temperature(Trigger::Manual);
    let err = btzen_core::Session::connect(fake.conn.clone(), test_config(), [dev.clone(), dev])
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Configuration { .. }), "{err}");
    assert_eq!(fake.count("RegisterApplication"), 0);
}

#[tokio::test]
async fn test_remove_device_targets_device_path() {
    let fake = FakeBluez::start().await;
    let bluez = btzen_core::bluez::Bluez::new(fake.conn.clone(), &test_config());
    let mac: btzen_core::MacAddress = common::MAC.parse().unwrap();

    bluez.remove_device(&mac).await.unwrap();
    let call = &fake.bus.calls_to("RemoveDevice")[0];
    assert_eq!(call.path.as_deref(), Some("/org/bluez/hci0"));
    assert_eq!(call.first_arg().unwrap().as_str(), Some(common::DEVICE_PATH));
}

// ── Read / write ────────────────────────────────────────────────────

#[tokio::test]
async fn test_write_then_read() {
    let fake = FakeBluez::start().await;
    let dev = temperature(Trigger::Manual);
    let session = fake.session([dev.clone()]).await;
    connected(&session, &dev).await;

    session.write(&dev, vec![0xbb]).await.unwrap();
    assert_eq!(fake.written(DATA_PATH), vec![vec![0xbb]]);

    fake.set_value(&[0xbb, 0x4d]);
    let data = session.read(&dev, Some(2)).await.unwrap();
    assert_eq!(&data[..], &[0xbb, 0x4d]);
    session.close().await;
}

#[tokio::test]
async fn test_read_cuts_and_rejects_by_length() {
    let fake = FakeBluez::start().await;
    let dev = temperature(Trigger::Manual);
    let session = fake.session([dev.clone()]).await;
    connected(&session, &dev).await;

    fake.set_value(&[0x01, 0x02, 0x03]);
    assert_eq!(&session.read(&dev, None).await.unwrap()[..], &[0x01, 0x02]);

    let err = session.read(&dev, Some(4)).await.unwrap_err();
    assert!(matches!(err, CoreError::DataRead { .. }), "{err}");
    session.close().await;
}

#[tokio::test]
async fn test_battery_level_is_read_from_interface_property() {
    let fake = FakeBluez::start().await;
    let dev = battery();
    let session = fake.session([dev.clone()]).await;
    connected(&session, &dev).await;

    assert_eq!(&session.read(&dev, None).await.unwrap()[..], &[87]);
    let err = session.write(&dev, vec![1]).await.unwrap_err();
    assert!(matches!(err, CoreError::DataWrite { .. }), "{err}");
    assert_eq!(fake.count("GetManagedObjects"), 0);
    session.close().await;
}

#[tokio::test]
async fn test_read_timeout_is_a_cancellation() {
    let fake = FakeBluez::start().await;
    let dev = temperature(Trigger::OnChange);
    let session = fake.session([dev.clone()]).await;
    connected(&session, &dev).await;

    let err = session
        .read_with_timeout(&dev, None, Duration::from_millis(20))
        .await
        .unwrap_err();
    assert!(err.is_cancelled(), "{err}");
    session.close().await;
}

#[tokio::test]
async fn test_unknown_device_is_rejected() {
    let fake = FakeBluez::start().await;
    let session = fake.session([battery()]).await;
    let err = session.read(&temperature(Trigger::Manual), None).await.unwrap_err();
    assert!(matches!(err, CoreError::Configuration { .. }), "{err}");
    session.close().await;
}

// ── Enable / disable ────────────────────────────────────────────────

#[tokio::test]
async fn test_env_sensing_is_switched_on_and_off() {
    let fake = FakeBluez::start().await;
    let dev = env_sensing(Trigger::OnChange);
    let session = fake.session([dev.clone()]).await;
    connected(&session, &dev).await;

    assert_eq!(fake.written(CONF_PATH), vec![vec![0x01]]);
    assert_eq!(fake.written(TRIGGER_PATH), vec![vec![0x04]]);
    assert_eq!(fake.count("StartNotify"), 1);

    session.close().await;
    assert_eq!(fake.count("StopNotify"), 1);
    assert_eq!(fake.written(CONF_PATH), vec![vec![0x01], vec![0x00]]);
}

// ── Disconnection ───────────────────────────────────────────────────

#[tokio::test]
async fn test_link_loss_fails_reads_until_bluez_reconnects() {
    let fake = FakeBluez::start().await;
    let dev = temperature(Trigger::Manual);
    let session = fake.session([dev.clone()]).await;
    connected(&session, &dev).await;

    fake.set_reachable(false);
    fake.link(false);
    let err = connection_error(&session, &dev).await;
    assert!(err.is_disconnect(), "{err}");
    assert_ne!(session.device_state(&dev).unwrap(), DeviceState::Connected);

    fake.set_reachable(true);
    fake.link(true);
    connected(&session, &dev).await;
    fake.set_value(&[0x10, 0x20]);
    assert_eq!(&session.read(&dev, None).await.unwrap()[..], &[0x10, 0x20]);
    session.close().await;
}

#[tokio::test]
async fn test_notifications_are_restarted_after_reconnect() {
    let fake = FakeBluez::start().await;
    let dev = temperature(Trigger::OnChange);
    let session = fake.session([dev.clone()]).await;
    connected(&session, &dev).await;
    assert_eq!(fake.count("StartNotify"), 1);

    fake.link(false);
    wait_calls(&fake, "StartNotify", 2).await;
    connected(&session, &dev).await;

    fake.notify(&[0x05, 0x00]);
    assert_eq!(&session.read(&dev, None).await.unwrap()[..], &[0x05, 0x00]);
    session.close().await;
}

#[tokio::test]
async fn test_exhausted_reconnects_mark_device_failed() {
    let fake = FakeBluez::start().await;
    fake.set_reachable(false);
    let dev = temperature(Trigger::Manual);
    let config = SessionConfig {
        reconnect: ReconnectConfig {
            max_retries: Some(1),
            ..test_config().reconnect
        },
        ..test_config()
    };
    let session = fake.session_with(config, [dev.clone()]).await;

    wait_state(&session, &dev, DeviceState::Failed).await;
    let err = session.read(&dev, None).await.unwrap_err();
    assert!(err.to_string().contains("Page Timeout"), "{err}");
    assert_eq!(fake.count("ConnectDevice"), 2);

    fake.set_reachable(true);
    fake.link(true);
    connected(&session, &dev).await;
    assert_eq!(fake.count("ConnectDevice"), 2);
    session.close().await;
}

#[tokio::test]
async fn test_state_stream_reports_transitions() {
    let fake = FakeBluez::start().await;
    let dev = temperature(Trigger::Manual);
    let session = fake.session([dev.clone()]).await;
    let mut states = session.state(&dev).unwrap();

    let seen = tokio::time::timeout(common::WAIT, async {
        loop {
            if states.next().await == Some(DeviceState::Connected) {
                break;
            }
        }
    })
    .await;
    assert!(seen.is_ok());
    session.close().await;
    assert_eq!(session.device_state(&dev).unwrap(), DeviceState::Disconnected);
}

#[tokio::test]
async fn test_closed_bus_ends_session_tasks() {
    let fake = FakeBluez::start().await;
    let dev = temperature(Trigger::Manual);
    let session = fake.session([dev.clone()]).await;
    connected(&session, &dev).await;

    fake.bus.hang_up();
    let err = connection_error(&session, &dev).await;
    assert!(err.is_disconnect(), "{err}");
    tokio::time::timeout(common::WAIT, session.close()).await.unwrap();
}
