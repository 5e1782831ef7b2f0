mod common;

use std::sync::{Arc, Mutex};

use common::*;
use gattlink::bus::properties;
use gattlink::error::{names, AttError, AttErrorCode, ErrorKind};
use gattlink::{Characteristic, Device, DeviceManager, DeviceObserver, PropertyValue};

fn firmware(manager: &DeviceManager) -> Characteristic {
    manager
        .device(&PERIPHERAL)
        .unwrap()
        .characteristic(DEVICE_INFORMATION, FIRMWARE_REVISION)
        .unwrap()
        .clone()
}

fn battery_level(manager: &DeviceManager) -> Characteristic {
    manager
        .device(&PERIPHERAL)
        .unwrap()
        .characteristic(BATTERY, BATTERY_LEVEL)
        .unwrap()
        .clone()
}

#[tokio::test]
async fn read_firmware_version() {
    let (mut manager, gateway, log) = open().await;
    connect_and_resolve(&mut manager, &gateway, &log).await;
    gateway.script("read_value", Reply::Bytes(b"1.0".to_vec()));

    let read = firmware(&manager).read_value().unwrap();
    settle(&mut manager).await;
    assert_eq!(log.take(), vec![Event::ValueUpdated(FIRMWARE_REVISION, vec![0x31, 0x2e, 0x30])]);
    assert_eq!(read.await.unwrap(), b"1.0");
    assert_eq!(gateway.calls_to("read_value")[0].path, firmware_path(&PERIPHERAL));
}

#[tokio::test]
async fn pushed_values() {
    let (mut manager, gateway, log) = open().await;
    connect_and_resolve(&mut manager, &gateway, &log).await;

    gateway.set_characteristic(&battery_path(&PERIPHERAL), &[(properties::VALUE, PropertyValue::Bytes(vec![87]))]);
    gateway.set_characteristic(&battery_path(&PERIPHERAL), &[(properties::VALUE, PropertyValue::Bytes(vec![86]))]);
    settle(&mut manager).await;
    assert_eq!(
        log.take(),
        vec![
            Event::ValueUpdated(BATTERY_LEVEL, vec![87]),
            Event::ValueUpdated(BATTERY_LEVEL, vec![86]),
        ]
    );
}

#[tokio::test]
async fn pushed_values_need_resolved_services() {
    let (mut manager, gateway, log) = open().await;
    connect_and_resolve(&mut manager, &gateway, &log).await;
    gateway.set_device(&PERIPHERAL, &[(properties::SERVICES_RESOLVED, PropertyValue::Bool(false))]);
    settle(&mut manager).await;

    gateway.set_characteristic(&battery_path(&PERIPHERAL), &[(properties::VALUE, PropertyValue::Bytes(vec![87]))]);
    settle(&mut manager).await;
    assert!(log.take().is_empty());
}

#[tokio::test]
async fn one_read_at_a_time() {
    let (mut manager, gateway, log) = open().await;
    connect_and_resolve(&mut manager, &gateway, &log).await;
    let firmware = firmware(&manager);
    let release = gateway.hold("read_value");

    let read = firmware.read_value().unwrap();
    assert_eq!(firmware.read_value().unwrap_err().kind(), ErrorKind::Busy);
    settle(&mut manager).await;

    release.send(Reply::Bytes(b"2.1".to_vec())).unwrap();
    settle(&mut manager).await;
    assert_eq!(log.take(), vec![Event::ValueUpdated(FIRMWARE_REVISION, b"2.1".to_vec())]);
    assert_eq!(read.await.unwrap(), b"2.1");
    assert_eq!(gateway.calls_to("read_value").len(), 1);

    // Free again
    firmware.read_value().unwrap();
}

#[tokio::test]
async fn read_reply_racing_a_pushed_value_is_reported_once() {
    let (mut manager, gateway, log) = open().await;
    connect_and_resolve(&mut manager, &gateway, &log).await;
    let level = battery_level(&manager);
    let release = gateway.hold("read_value");

    let read = level.read_value().unwrap();
    settle(&mut manager).await;
    gateway.set_characteristic(&battery_path(&PERIPHERAL), &[(properties::VALUE, PropertyValue::Bytes(vec![50]))]);
    settle(&mut manager).await;
    release.send(Reply::Bytes(vec![50])).unwrap();
    settle(&mut manager).await;

    assert_eq!(log.take(), vec![Event::ValueUpdated(BATTERY_LEVEL, vec![50])]);
    assert_eq!(read.await.unwrap(), vec![50]);
}

#[tokio::test]
async fn read_reply_differing_from_a_pushed_value_is_reported() {
    let (mut manager, gateway, log) = open().await;
    connect_and_resolve(&mut manager, &gateway, &log).await;
    let level = battery_level(&manager);
    let release = gateway.hold("read_value");

    let read = level.read_value().unwrap();
    settle(&mut manager).await;
    gateway.set_characteristic(&battery_path(&PERIPHERAL), &[(properties::VALUE, PropertyValue::Bytes(vec![51]))]);
    settle(&mut manager).await;
    release.send(Reply::Bytes(vec![50])).unwrap();
    settle(&mut manager).await;

    assert_eq!(
        log.take(),
        vec![
            Event::ValueUpdated(BATTERY_LEVEL, vec![51]),
            Event::ValueUpdated(BATTERY_LEVEL, vec![50]),
        ]
    );
    assert_eq!(read.await.unwrap(), vec![50]);
}

#[tokio::test]
async fn failed_read() {
    let (mut manager, gateway, log) = open().await;
    connect_and_resolve(&mut manager, &gateway, &log).await;
    gateway.script(
        "read_value",
        Reply::err(names::FAILED, "Operation failed with ATT error: 0x0e"),
    );

    let read = firmware(&manager).read_value().unwrap();
    settle(&mut manager).await;
    assert_eq!(
        log.take(),
        vec![Event::ReadFailed(FIRMWARE_REVISION, ErrorKind::OperationFailed)]
    );
    let err = read.await.unwrap_err();
    assert_eq!(err.att_error(), Some(AttError::Known(AttErrorCode::UnlikelyError)));
}

#[tokio::test]
async fn writes_are_serialized_in_order() {
    let (mut manager, gateway, log) = open().await;
    connect_and_resolve(&mut manager, &gateway, &log).await;
    let level = battery_level(&manager);
    let release = gateway.hold("write_value");
    gateway.script("write_value", Reply::err(names::INVALID_VALUE_LENGTH, "Invalid Length"));

    let first = level.write_value(&[1]).unwrap();
    let second = level.write_value(&[2, 2]).unwrap();
    let third = level.write_value(&[3]).unwrap();
    settle(&mut manager).await;
    assert_eq!(gateway.calls_to("write_value").len(), 1);

    release.send(Reply::Ok).unwrap();
    settle(&mut manager).await;
    let written: Vec<_> = gateway.calls_to("write_value").into_iter().map(|x| x.data).collect();
    assert_eq!(written, vec![vec![1], vec![2, 2], vec![3]]);
    assert_eq!(
        log.take(),
        vec![
            Event::WriteSucceeded(BATTERY_LEVEL),
            Event::WriteFailed(BATTERY_LEVEL, ErrorKind::InvalidParameter),
            Event::WriteSucceeded(BATTERY_LEVEL),
        ]
    );
    assert!(first.await.is_ok());
    assert_eq!(second.await.unwrap_err().kind(), ErrorKind::InvalidParameter);
    assert!(third.await.is_ok());
}

#[tokio::test]
async fn unsupported_operations() {
    let (mut manager, gateway, log) = open().await;
    connect_and_resolve(&mut manager, &gateway, &log).await;
    let firmware = firmware(&manager);

    assert_eq!(firmware.write_value(&[0]).unwrap_err().kind(), ErrorKind::NotSupported);
    assert_eq!(firmware.enable_notifications().unwrap_err().kind(), ErrorKind::NotSupported);
    settle(&mut manager).await;
    assert!(gateway.calls_to("write_value").is_empty());
    assert!(gateway.calls_to("start_notify").is_empty());
    assert!(log.take().is_empty());
}

#[tokio::test]
async fn notifications() {
    let (mut manager, gateway, log) = open().await;
    connect_and_resolve(&mut manager, &gateway, &log).await;
    let level = battery_level(&manager);
    assert!(!level.is_notifying());

    let release = gateway.hold("start_notify");
    let enabled = level.enable_notifications().unwrap();
    assert_eq!(level.disable_notifications().unwrap_err().kind(), ErrorKind::Busy);
    settle(&mut manager).await;
    release.send(Reply::Ok).unwrap();
    settle(&mut manager).await;
    assert!(enabled.await.is_ok());
    assert!(level.is_notifying());

    // The service answers a second subscription with an error that means "already done"
    gateway.script("start_notify", Reply::err(names::FAILED, "Already notifying"));
    level.enable_notifications().unwrap();
    settle(&mut manager).await;

    level.disable_notifications().unwrap();
    settle(&mut manager).await;
    assert!(!level.is_notifying());
    assert_eq!(
        log.take(),
        vec![
            Event::NotifyEnabled(BATTERY_LEVEL),
            Event::NotifyEnabled(BATTERY_LEVEL),
            Event::NotifyDisabled(BATTERY_LEVEL),
        ]
    );
}

#[tokio::test]
async fn failed_notification_changes() {
    let (mut manager, gateway, log) = open().await;
    connect_and_resolve(&mut manager, &gateway, &log).await;
    let level = battery_level(&manager);

    gateway.script("start_notify", Reply::err(names::NOT_PERMITTED, "Notify not permitted"));
    let enabled = level.enable_notifications().unwrap();
    settle(&mut manager).await;
    assert_eq!(enabled.await.unwrap_err().kind(), ErrorKind::PermissionDenied);
    assert!(!level.is_notifying());

    gateway.script("stop_notify", Reply::err(names::FAILED, "Operation failed"));
    level.disable_notifications().unwrap();
    settle(&mut manager).await;
    assert_eq!(
        log.take(),
        vec![
            Event::NotifyEnableFailed(BATTERY_LEVEL, ErrorKind::PermissionDenied),
            Event::NotifyDisableFailed(BATTERY_LEVEL, ErrorKind::OperationFailed),
        ]
    );
}

#[tokio::test]
async fn notifying_property_is_mirrored() {
    let (mut manager, gateway, log) = open().await;
    connect_and_resolve(&mut manager, &gateway, &log).await;
    let level = battery_level(&manager);

    gateway.set_characteristic(&battery_path(&PERIPHERAL), &[(properties::NOTIFYING, PropertyValue::Bool(true))]);
    settle(&mut manager).await;
    assert!(level.is_notifying());
    assert!(log.take().is_empty());
}

#[tokio::test]
async fn handles_go_stale_on_disconnect() {
    let (mut manager, gateway, log) = open().await;
    connect_and_resolve(&mut manager, &gateway, &log).await;
    let level = battery_level(&manager);
    let release = gateway.hold("write_value");

    let first = level.write_value(&[1]).unwrap();
    let queued = level.write_value(&[2]).unwrap();
    settle(&mut manager).await;

    manager.device_mut(&PERIPHERAL).unwrap().disconnect().unwrap();
    assert!(!level.is_valid());
    assert_eq!(level.write_value(&[3]).unwrap_err().kind(), ErrorKind::NotConnected);
    assert_eq!(level.read_value().unwrap_err().kind(), ErrorKind::NotConnected);
    assert_eq!(level.enable_notifications().unwrap_err().kind(), ErrorKind::NotConnected);
    assert_eq!(first.await.unwrap_err().kind(), ErrorKind::NotConnected);
    assert_eq!(queued.await.unwrap_err().kind(), ErrorKind::NotConnected);

    settle(&mut manager).await;
    release.send(Reply::Ok).unwrap();
    settle(&mut manager).await;
    assert_eq!(log.take(), vec![Event::DisconnectSucceeded]);
    assert_eq!(gateway.calls_to("write_value").len(), 1);
}

/// Reads the firmware revision as soon as the services are known.
struct FirmwareReader(Arc<Mutex<Vec<String>>>);

impl DeviceObserver for FirmwareReader {
    fn services_resolved(&mut self, device: &mut Device) {
        let Some(firmware) = device.characteristic(DEVICE_INFORMATION, FIRMWARE_REVISION) else {
            return;
        };
        firmware.read_value().unwrap();
    }

    fn characteristic_value_updated(&mut self, _device: &mut Device, characteristic: &Characteristic, value: &[u8]) {
        if characteristic.uuid() == FIRMWARE_REVISION {
            self.0.lock().unwrap().push(String::from_utf8_lossy(value).into_owned());
        }
    }
}

#[tokio::test]
async fn operations_from_callbacks() {
    let (mut manager, gateway, _log) = open().await;
    let versions = Arc::new(Mutex::new(Vec::new()));
    manager.add_device(PERIPHERAL, FirmwareReader(versions.clone())).connect().unwrap();
    gateway.script("read_value", Reply::Bytes(b"3.4.1".to_vec()));

    settle(&mut manager).await;
    gateway.resolve_services(&PERIPHERAL, gatt_tree(&PERIPHERAL));
    settle(&mut manager).await;
    assert_eq!(*versions.lock().unwrap(), vec!["3.4.1".to_string()]);
}
