//! Session Integration Tests
//!
//! Drive a `DeviceSessionManager` against the in-memory bridge and check
//! device set tracking, group updates and teardown ordering.

mod common;

use common::{drain, drive_until, MockBridge, Recorder};
use device_bridge::device::plugins;
use device_bridge::session::SessionInput;
use device_bridge::{
    BatteryIndicator, BatteryState, BridgeError, BridgeSignal, DeviceSessionManager,
    GroupPayload, Listeners, PropertyGroup, SessionEvent, SessionState, StatusFlags,
};
use std::sync::Arc;

fn session_for(bridge: &Arc<MockBridge>) -> (DeviceSessionManager, Recorder) {
    let events = Listeners::new();
    let recorder = Recorder::attach(&events);
    let session = DeviceSessionManager::new(bridge.clone(), ":1.42".to_string(), events);
    (session, recorder)
}

fn has_battery(session: &DeviceSessionManager, id: &str) -> bool {
    session
        .device(id)
        .and_then(|device| device.snapshot().ok())
        .is_some_and(|record| record.battery().is_some())
}

fn battery_changed(id: &str, level: u8, charging: bool) -> BridgeSignal {
    BridgeSignal::PropertyChanged {
        device_id: id.to_string(),
        group: PropertyGroup::Battery,
        payload: Some(GroupPayload::Battery(BatteryState { level, charging })),
    }
}

#[tokio::test]
async fn test_battery_scenario() {
    let bridge = MockBridge::new();
    bridge.add_phone("dev1", "Pixel", &[plugins::BATTERY, plugins::TELEPHONY]);
    bridge.set_battery("dev1", 45, false);

    let (mut session, recorder) = session_for(&bridge);
    session.start().await.unwrap();
    assert_eq!(session.state(), SessionState::Active);
    assert_eq!(recorder.added(), vec!["dev1"]);

    drive_until(&mut session, |s| has_battery(s, "dev1")).await;
    let device = session.device("dev1").unwrap();
    let indicator = BatteryIndicator::for_device(&device.snapshot().unwrap());
    assert_eq!(indicator.icon_name(), "battery-good");
    assert_eq!(indicator.label().as_deref(), Some("45%"));

    bridge.emit(battery_changed("dev1", 60, true));
    drive_until(&mut session, |s| {
        s.device("dev1")
            .and_then(|d| d.snapshot().ok())
            .and_then(|r| r.battery())
            .is_some_and(|b| b.level == 60)
    })
    .await;
    let indicator = BatteryIndicator::for_device(&device.snapshot().unwrap());
    assert_eq!(indicator.icon_name(), "battery-full-charging");
    assert_eq!(indicator.label().as_deref(), Some("60%"));

    session.destroy();
    assert_eq!(recorder.ended(), 1);
    assert!(matches!(
        recorder.events().last(),
        Some(SessionEvent::SessionEnded)
    ));

    let before = recorder.events().len();
    session.handle(SessionInput::Signal(battery_changed("dev1", 10, false)));
    assert_eq!(recorder.events().len(), before);
    assert!(matches!(device.snapshot(), Err(BridgeError::DeviceGone(_))));
}

#[tokio::test]
async fn test_signal_without_payload_rereads_group() {
    let bridge = MockBridge::new();
    bridge.add_phone("dev1", "Pixel", &[plugins::BATTERY]);
    bridge.set_battery("dev1", 45, false);

    let (mut session, recorder) = session_for(&bridge);
    session.start().await.unwrap();
    drive_until(&mut session, |s| has_battery(s, "dev1")).await;

    bridge.set(
        "dev1",
        GroupPayload::Identity {
            name: "Work phone".to_string(),
            class: device_bridge::DeviceClass::Phone,
        },
    );
    bridge.emit(BridgeSignal::PropertyChanged {
        device_id: "dev1".to_string(),
        group: PropertyGroup::Identity,
        payload: None,
    });
    drive_until(&mut session, |s| {
        s.device("dev1")
            .and_then(|d| d.snapshot().ok())
            .is_some_and(|r| r.name == "Work phone")
    })
    .await;
    assert_eq!(recorder.changed("dev1", PropertyGroup::Identity), 2);
}

#[tokio::test]
async fn test_destroy_removes_each_device_once() {
    let bridge = MockBridge::new();
    for id in ["dev1", "dev2", "dev3"] {
        bridge.add_phone(id, id, &[]);
    }

    let (mut session, recorder) = session_for(&bridge);
    session.start().await.unwrap();
    assert_eq!(recorder.added(), vec!["dev1", "dev2", "dev3"]);
    let handles: Vec<_> = ["dev1", "dev2", "dev3"]
        .iter()
        .map(|id| session.device(id).unwrap())
        .collect();
    drain(&mut session).await;

    session.destroy();
    session.destroy();

    let mut removed = recorder.removed();
    removed.sort();
    assert_eq!(removed, vec!["dev1", "dev2", "dev3"]);
    assert_eq!(recorder.ended(), 1);
    assert_eq!(session.state(), SessionState::Destroyed);
    assert!(session.device_ids().is_empty());
    assert!(handles.iter().all(|handle| !handle.is_alive()));
}

#[tokio::test]
async fn test_removed_handle_readable_during_notification() {
    let bridge = MockBridge::new();
    bridge.add_phone("dev1", "Pixel", &[]);

    let events = Listeners::new();
    let names = Arc::new(std::sync::Mutex::new(Vec::new()));
    let session_events = events.clone();
    let seen = names.clone();
    let handles = Arc::new(std::sync::Mutex::new(Vec::new()));
    let store = handles.clone();
    let _sub = session_events.subscribe(move |event: &SessionEvent| match event {
        SessionEvent::DeviceAdded { device, .. } => store.lock().unwrap().push(device.clone()),
        SessionEvent::DeviceRemoved(id) => {
            for handle in store.lock().unwrap().iter().filter(|h| h.id() == id) {
                seen.lock().unwrap().push(handle.snapshot().map(|r| r.name));
            }
        }
        _ => {}
    });

    let mut session = DeviceSessionManager::new(bridge.clone(), ":1.7".to_string(), events);
    session.start().await.unwrap();
    drive_until(&mut session, |s| {
        s.device("dev1")
            .and_then(|d| d.snapshot().ok())
            .is_some_and(|r| r.name == "Pixel")
    })
    .await;

    bridge.emit(BridgeSignal::DeviceRemoved("dev1".to_string()));
    drive_until(&mut session, |s| s.device("dev1").is_none()).await;

    let names = names.lock().unwrap();
    assert_eq!(names.len(), 1);
    assert_eq!(names[0].as_deref().ok(), Some("Pixel"));
    assert!(!handles.lock().unwrap()[0].is_alive());
}

#[tokio::test]
async fn test_change_after_removal_does_not_resurrect() {
    let bridge = MockBridge::new();
    bridge.add_phone("dev1", "Pixel", &[plugins::BATTERY]);
    bridge.set_battery("dev1", 45, false);

    let (mut session, recorder) = session_for(&bridge);
    session.start().await.unwrap();
    drive_until(&mut session, |s| has_battery(s, "dev1")).await;

    bridge.emit(BridgeSignal::DeviceRemoved("dev1".to_string()));
    bridge.emit(battery_changed("dev1", 80, true));
    bridge.emit(BridgeSignal::PropertyChanged {
        device_id: "dev1".to_string(),
        group: PropertyGroup::Status,
        payload: None,
    });
    drain(&mut session).await;

    assert!(session.device("dev1").is_none());
    assert_eq!(recorder.added(), vec!["dev1"]);
    assert_eq!(recorder.removed(), vec!["dev1"]);
    assert!(matches!(
        recorder.events().last(),
        Some(SessionEvent::DeviceRemoved(id)) if id == "dev1"
    ));
    assert_eq!(session.state(), SessionState::Active);
}

#[tokio::test]
async fn test_inconsistent_notifications_are_ignored() {
    let bridge = MockBridge::new();
    bridge.add_phone("dev1", "Pixel", &[]);

    let (mut session, recorder) = session_for(&bridge);
    session.start().await.unwrap();
    drain(&mut session).await;

    bridge.emit(BridgeSignal::DeviceAdded("dev1".to_string()));
    bridge.emit(BridgeSignal::DeviceRemoved("ghost".to_string()));
    drain(&mut session).await;

    assert_eq!(recorder.added(), vec!["dev1"]);
    assert!(recorder.removed().is_empty());
    assert_eq!(session.device_ids(), ["dev1".to_string()]);
}

#[tokio::test]
async fn test_device_added_while_active() {
    let bridge = MockBridge::new();
    let (mut session, recorder) = session_for(&bridge);
    session.start().await.unwrap();
    assert!(recorder.added().is_empty());

    bridge.add_phone("dev2", "Tablet", &[plugins::FIND_MY_PHONE]);
    bridge.emit(BridgeSignal::DeviceAdded("dev2".to_string()));
    drive_until(&mut session, |s| {
        s.device("dev2")
            .and_then(|d| d.snapshot().ok())
            .is_some_and(|r| r.has_plugin(plugins::FIND_MY_PHONE))
    })
    .await;

    assert_eq!(recorder.added(), vec!["dev2"]);
    let device = session.device("dev2").unwrap();
    device.find_device().await.unwrap();
}

#[tokio::test]
async fn test_trust_request_leaves_other_devices_alone() {
    let bridge = MockBridge::new();
    bridge.add_phone("dev1", "Pixel", &[]);
    bridge.add_phone("dev2", "Galaxy", &[plugins::BATTERY]);
    bridge.set_battery("dev2", 30, false);
    bridge.set(
        "dev1",
        GroupPayload::Status(StatusFlags {
            active: true,
            trusted: false,
            paired: false,
            allowed: true,
        }),
    );

    let (mut session, _recorder) = session_for(&bridge);
    session.start().await.unwrap();
    drive_until(&mut session, |s| has_battery(s, "dev2")).await;
    drain(&mut session).await;

    let before = session.device("dev2").unwrap().snapshot().unwrap();
    session.device("dev1").unwrap().request_trust().await.unwrap();
    drain(&mut session).await;

    assert_eq!(session.device("dev2").unwrap().snapshot().unwrap(), before);
    assert!(!session.device("dev1").unwrap().snapshot().unwrap().trusted);
    assert_eq!(*bridge.trust_requests.lock().unwrap(), vec!["dev1"]);
}

#[tokio::test]
async fn test_command_failure_leaves_session_intact() {
    let bridge = MockBridge::new();
    bridge.add_phone("dev1", "Pixel", &[]);

    let (mut session, _recorder) = session_for(&bridge);
    session.start().await.unwrap();
    drain(&mut session).await;

    let result = session.device("dev1").unwrap().find_device().await;
    assert!(matches!(result, Err(BridgeError::CommandFailed { .. })));
    assert_eq!(session.state(), SessionState::Active);
    assert!(session.device("dev1").is_some());
}

#[tokio::test]
async fn test_read_for_departed_device_is_discarded() {
    let bridge = MockBridge::new();
    bridge.add_phone("dev1", "Pixel", &[]);
    bridge.hold_reads();

    let (mut session, recorder) = session_for(&bridge);
    session.start().await.unwrap();

    bridge.emit(BridgeSignal::DeviceRemoved("dev1".to_string()));
    drive_until(&mut session, |s| s.device("dev1").is_none()).await;

    bridge.release_reads();
    drain(&mut session).await;

    assert_eq!(recorder.changed("dev1", PropertyGroup::Identity), 0);
    assert_eq!(recorder.changed("dev1", PropertyGroup::Status), 0);
    assert!(session.device("dev1").is_none());
}

#[tokio::test]
async fn test_malformed_read_keeps_cached_group() {
    let bridge = MockBridge::new();
    bridge.add_phone("dev1", "Pixel", &[]);

    let (mut session, _recorder) = session_for(&bridge);
    session.start().await.unwrap();
    drive_until(&mut session, |s| {
        s.device("dev1")
            .and_then(|d| d.snapshot().ok())
            .is_some_and(|r| r.name == "Pixel")
    })
    .await;

    bridge.forget("dev1", PropertyGroup::Identity);
    bridge.emit(BridgeSignal::PropertyChanged {
        device_id: "dev1".to_string(),
        group: PropertyGroup::Identity,
        payload: None,
    });
    drain(&mut session).await;

    assert_eq!(session.device("dev1").unwrap().snapshot().unwrap().name, "Pixel");
    assert_eq!(session.state(), SessionState::Active);
}

#[tokio::test]
async fn test_battery_waits_for_plugin() {
    let bridge = MockBridge::new();
    bridge.add_phone("dev1", "Pixel", &[]);
    bridge.set_battery("dev1", 75, false);

    let (mut session, _recorder) = session_for(&bridge);
    session.start().await.unwrap();
    drain(&mut session).await;

    bridge.emit(battery_changed("dev1", 50, false));
    drain(&mut session).await;
    let record = session.device("dev1").unwrap().snapshot().unwrap();
    assert_eq!(BatteryIndicator::for_device(&record), BatteryIndicator::Unknown);

    bridge.set(
        "dev1",
        GroupPayload::Plugins(vec![plugins::BATTERY.to_string()]),
    );
    bridge.emit(BridgeSignal::PropertyChanged {
        device_id: "dev1".to_string(),
        group: PropertyGroup::Plugins,
        payload: None,
    });
    drive_until(&mut session, |s| has_battery(s, "dev1")).await;

    let record = session.device("dev1").unwrap().snapshot().unwrap();
    assert_eq!(
        BatteryIndicator::for_device(&record).label().as_deref(),
        Some("75%")
    );
}

#[tokio::test]
async fn test_failed_enumeration_leaves_session_destroyed() {
    let bridge = MockBridge::new();
    bridge.add_phone("dev1", "Pixel", &[]);
    bridge
        .fail_list
        .store(true, std::sync::atomic::Ordering::SeqCst);

    let (mut session, recorder) = session_for(&bridge);
    assert!(session.start().await.is_err());
    assert_eq!(session.state(), SessionState::Destroyed);
    assert!(recorder.events().is_empty());
    assert!(!session.step().await);

    assert!(matches!(
        session.start().await,
        Err(BridgeError::SessionNotActive)
    ));
}

#[tokio::test]
async fn test_lost_signal_stream_ends_session() {
    let bridge = MockBridge::new();
    bridge.add_phone("dev1", "Pixel", &[]);

    let (mut session, recorder) = session_for(&bridge);
    session.start().await.unwrap();
    drain(&mut session).await;

    bridge.drop_signals();
    drain(&mut session).await;

    assert_eq!(session.state(), SessionState::Destroyed);
    assert_eq!(recorder.removed(), vec!["dev1"]);
    assert_eq!(recorder.ended(), 1);
}

#[tokio::test]
async fn test_second_start_is_rejected() {
    let bridge = MockBridge::new();
    bridge.add_phone("dev1", "Pixel", &[]);

    let (mut session, recorder) = session_for(&bridge);
    session.start().await.unwrap();
    drain(&mut session).await;

    assert!(matches!(
        session.start().await,
        Err(BridgeError::ProtocolViolation(_))
    ));
    assert_eq!(session.state(), SessionState::Active);
    assert_eq!(recorder.added(), vec!["dev1"]);
}

#[tokio::test]
async fn test_slow_command_does_not_delay_other_device() {
    let bridge = MockBridge::new();
    bridge.add_phone("dev1", "Pixel", &[plugins::FIND_MY_PHONE]);
    bridge.add_phone("dev2", "Tablet", &[plugins::BATTERY]);
    bridge.set_battery("dev2", 45, false);

    let (mut session, _recorder) = session_for(&bridge);
    session.start().await.unwrap();
    drive_until(&mut session, |s| has_battery(s, "dev2")).await;

    bridge.hold_commands();
    let pixel = session.device("dev1").unwrap();
    let ringing = tokio::spawn(async move { pixel.find_device().await });

    bridge.emit(battery_changed("dev2", 80, true));
    drive_until(&mut session, |s| {
        s.device("dev2")
            .and_then(|d| d.snapshot().ok())
            .and_then(|r| r.battery())
            .is_some_and(|b| b.level == 80)
    })
    .await;
    assert!(!ringing.is_finished());

    bridge.release_commands();
    assert!(ringing.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_pending_read_does_not_delay_other_device() {
    let bridge = MockBridge::new();
    bridge.add_phone("dev1", "Pixel", &[]);
    bridge.add_phone("dev2", "Tablet", &[plugins::BATTERY]);
    bridge.set_battery("dev2", 45, false);

    let (mut session, recorder) = session_for(&bridge);
    session.start().await.unwrap();
    drive_until(&mut session, |s| has_battery(s, "dev2")).await;
    drain(&mut session).await;
    recorder.clear();

    bridge.hold_reads();
    bridge.emit(BridgeSignal::PropertyChanged {
        device_id: "dev1".to_string(),
        group: PropertyGroup::Status,
        payload: None,
    });
    bridge.emit(battery_changed("dev2", 80, true));

    drive_until(&mut session, |_| recorder.changed("dev2", PropertyGroup::Battery) == 1).await;
    assert_eq!(recorder.changed("dev1", PropertyGroup::Status), 0);

    bridge.release_reads();
    drive_until(&mut session, |_| recorder.changed("dev1", PropertyGroup::Status) == 1).await;
}
