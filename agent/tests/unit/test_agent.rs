//! Device agent orchestration tests

use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio_test::assert_ok;

use fwagent::app::run::{DeviceAgent, RunOutcome};
use fwagent::utils::RetryPolicy;

use crate::fakes::{
    firmware_url, no_sleep, options, topic, version_url, FakeControlPlane, FakeHttp,
    FakeNetwork, FakeResponse, Harness, Inbound, PlaneEvent, DEVICE,
};

const IMAGE: &[u8] = b"firmware image";

fn up_to_date() -> FakeHttp {
    FakeHttp::new().route(
        &version_url(),
        FakeResponse::ok(br#"{"version":"1.0.1","url":"1.0.1"}"#),
    )
}

fn announcements() -> Vec<PlaneEvent> {
    vec![
        PlaneEvent::Publish {
            topic: topic("status"),
            payload: "online".to_string(),
            retain: true,
        },
        PlaneEvent::Publish {
            topic: topic("version"),
            payload: "1.0.1".to_string(),
            retain: true,
        },
        PlaneEvent::Publish {
            topic: topic("environment"),
            payload: "prod".to_string(),
            retain: true,
        },
        PlaneEvent::Subscribe(topic("firmware/update")),
        PlaneEvent::Subscribe(format!("devices/{}", DEVICE)),
    ]
}

fn ends_offline(events: &[PlaneEvent]) -> bool {
    events.ends_with(&[
        PlaneEvent::Publish {
            topic: topic("status"),
            payload: "offline".to_string(),
            retain: true,
        },
        PlaneEvent::Disconnect,
    ])
}

#[tokio::test]
async fn test_startup_check_installs_and_restarts() {
    let http = FakeHttp::new()
        .route(&version_url(), FakeResponse::ok(br#"{"version":"1.0.2","url":"1.0.2"}"#))
        .route(&firmware_url("1.0.2"), FakeResponse::ok(IMAGE));
    let harness = Harness::new(FakeControlPlane::new(), http);

    let agent = DeviceAgent::new(options(), harness.capabilities());
    let outcome = agent.run(no_sleep, harness.plane.clone().drained()).await;

    assert_eq!(assert_ok!(outcome), RunOutcome::Restarted);
    assert_eq!(harness.slot.committed().as_deref(), Some(IMAGE));
    assert_eq!(harness.device.restarts(), 1);
    assert!(ends_offline(&harness.plane.events()));
}

#[tokio::test]
async fn test_up_to_date_device_serves_until_shutdown() {
    let harness = Harness::new(FakeControlPlane::new(), up_to_date());

    let agent = DeviceAgent::new(options(), harness.capabilities());
    let outcome = agent.run(no_sleep, harness.plane.clone().drained()).await;

    assert_eq!(assert_ok!(outcome), RunOutcome::Shutdown);
    assert_eq!(harness.slot.begins(), 0);
    assert_eq!(harness.device.restarts(), 0);
    assert_eq!(harness.http.requests(), vec![version_url()]);

    let events = harness.plane.events();
    assert_eq!(events[1..6], announcements()[..]);
    assert!(ends_offline(&events));
}

#[tokio::test]
async fn test_malformed_descriptor_does_not_stop_the_agent() {
    let http = FakeHttp::new().route(&version_url(), FakeResponse::ok(b"not json"));
    let harness = Harness::new(FakeControlPlane::new(), http);

    let agent = DeviceAgent::new(options(), harness.capabilities());
    let outcome = agent.run(no_sleep, harness.plane.clone().drained()).await;

    assert_eq!(assert_ok!(outcome), RunOutcome::Shutdown);
    assert_eq!(harness.slot.begins(), 0);
}

#[tokio::test]
async fn test_update_command_installs_without_version_check() {
    let plane = FakeControlPlane::new().script(Inbound::Message(
        topic("firmware/update"),
        b"http://host/fw.bin".to_vec(),
    ));
    let http = up_to_date().route("http://host/fw.bin", FakeResponse::ok(IMAGE));
    let harness = Harness::new(plane, http);

    let agent = DeviceAgent::new(options(), harness.capabilities());
    let outcome = agent.run(no_sleep, harness.plane.clone().drained()).await;

    assert_eq!(assert_ok!(outcome), RunOutcome::Restarted);
    assert_eq!(
        harness.http.requests(),
        vec![version_url(), "http://host/fw.bin".to_string()]
    );
    assert_eq!(harness.slot.committed().as_deref(), Some(IMAGE));
    assert_eq!(harness.device.restarts(), 1);
}

#[tokio::test]
async fn test_failed_command_install_keeps_running() {
    let plane = FakeControlPlane::new().script(Inbound::Message(
        topic("firmware/update"),
        b"http://host/missing.bin".to_vec(),
    ));
    let harness = Harness::new(plane, up_to_date());

    let agent = DeviceAgent::new(options(), harness.capabilities());
    let outcome = agent.run(no_sleep, harness.plane.clone().drained()).await;

    assert_eq!(assert_ok!(outcome), RunOutcome::Shutdown);
    assert!(harness
        .http
        .requests()
        .contains(&"http://host/missing.bin".to_string()));
    assert!(harness.slot.committed().is_none());
    assert_eq!(harness.device.restarts(), 0);
}

#[tokio::test]
async fn test_only_first_of_two_commands_installs() {
    let plane = FakeControlPlane::new()
        .script(Inbound::Message(
            topic("firmware/update"),
            b"http://host/a.bin".to_vec(),
        ))
        .script(Inbound::Message(
            topic("firmware/update"),
            b"http://host/b.bin".to_vec(),
        ));
    let http = up_to_date()
        .route("http://host/a.bin", FakeResponse::ok(b"image a"))
        .route("http://host/b.bin", FakeResponse::ok(b"image b"));
    let harness = Harness::new(plane, http);

    let agent = DeviceAgent::new(options(), harness.capabilities());
    let outcome = agent.run(no_sleep, harness.plane.clone().drained()).await;

    assert_eq!(assert_ok!(outcome), RunOutcome::Restarted);
    assert_eq!(harness.slot.begins(), 1);
    assert_eq!(harness.slot.committed().as_deref(), Some(&b"image a"[..]));
    assert!(!harness
        .http
        .requests()
        .contains(&"http://host/b.bin".to_string()));
}

#[tokio::test]
async fn test_dropped_link_reconnects_and_announces_again() {
    let plane = FakeControlPlane::new().script(Inbound::Drop);
    let harness = Harness::new(plane, up_to_date());

    let agent = DeviceAgent::new(options(), harness.capabilities());
    let outcome = agent.run(no_sleep, harness.plane.clone().drained()).await;

    assert_eq!(assert_ok!(outcome), RunOutcome::Shutdown);
    assert_eq!(harness.plane.connects(), 2);

    let session = harness.plane.last_session();
    assert_eq!(session[1..6], announcements()[..]);
}

#[tokio::test]
async fn test_poll_error_reconnects() {
    let plane = FakeControlPlane::new().script(Inbound::Error);
    let harness = Harness::new(plane, up_to_date());

    let agent = DeviceAgent::new(options(), harness.capabilities());
    let outcome = agent.run(no_sleep, harness.plane.clone().drained()).await;

    assert_eq!(assert_ok!(outcome), RunOutcome::Shutdown);
    assert_eq!(harness.plane.connects(), 2);
}

#[tokio::test]
async fn test_refused_connects_are_retried() {
    let plane = FakeControlPlane::new().failing_connects(3);
    let harness = Harness::new(plane, up_to_date());

    let agent = DeviceAgent::new(options(), harness.capabilities());
    let outcome = agent.run(no_sleep, harness.plane.clone().drained()).await;

    assert_eq!(assert_ok!(outcome), RunOutcome::Shutdown);
    assert_eq!(harness.plane.connects(), 4);
    assert_eq!(harness.plane.last_session()[1..6], announcements()[..]);
}

#[tokio::test]
async fn test_bounded_reconnect_policy_gives_up() {
    let plane = FakeControlPlane::new().failing_connects(10);
    let harness = Harness::new(plane, up_to_date());
    let mut options = options();
    options.control_plane.reconnect = RetryPolicy::bounded(Duration::ZERO, 2);

    let agent = DeviceAgent::new(options, harness.capabilities());
    let outcome = agent.run(no_sleep, std::future::pending()).await;

    assert!(outcome.is_err());
    assert_eq!(harness.plane.connects(), 2);
    assert!(harness.http.requests().is_empty());
}

#[tokio::test]
async fn test_network_bring_up_is_retried() {
    let mut harness = Harness::new(FakeControlPlane::new(), up_to_date());
    harness.network = FakeNetwork::failing(3);

    let agent = DeviceAgent::new(options(), harness.capabilities());
    let outcome = agent.run(no_sleep, harness.plane.clone().drained()).await;

    assert_eq!(assert_ok!(outcome), RunOutcome::Shutdown);
    assert_eq!(harness.network.attempts.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_unreadable_hardware_address_is_retried_with_bring_up() {
    let mut harness = Harness::new(FakeControlPlane::new(), up_to_date());
    harness.network = FakeNetwork::unreadable_mac(1);

    let agent = DeviceAgent::new(options(), harness.capabilities());
    let outcome = agent.run(no_sleep, harness.plane.clone().drained()).await;

    assert_eq!(assert_ok!(outcome), RunOutcome::Shutdown);
    assert_eq!(harness.network.attempts.load(Ordering::SeqCst), 2);
    assert_eq!(harness.plane.connects(), 1);
}

#[tokio::test]
async fn test_shutdown_during_network_bring_up() {
    let mut harness = Harness::new(FakeControlPlane::new(), up_to_date());
    harness.network = FakeNetwork::failing(u32::MAX);
    let mut options = options();
    options.network.retry = RetryPolicy::unbounded(Duration::from_millis(10));

    let agent = DeviceAgent::new(options, harness.capabilities());
    let outcome = agent
        .run(tokio::time::sleep, tokio::time::sleep(Duration::from_millis(50)))
        .await;

    assert_eq!(assert_ok!(outcome), RunOutcome::Shutdown);
    assert_eq!(harness.plane.connects(), 0);
}

#[tokio::test]
async fn test_dev_mode_skips_update_check() {
    let http = FakeHttp::new()
        .route(&version_url(), FakeResponse::ok(br#"{"version":"1.0.2","url":"1.0.2"}"#))
        .route(&firmware_url("1.0.2"), FakeResponse::ok(IMAGE));
    let harness = Harness::new(FakeControlPlane::new(), http);
    let mut options = options();
    options.is_dev = true;
    options.update_check_interval = Some(Duration::from_millis(1));

    let agent = DeviceAgent::new(options, harness.capabilities());
    let outcome = agent.run(no_sleep, harness.plane.clone().drained()).await;

    assert_eq!(assert_ok!(outcome), RunOutcome::Shutdown);
    assert!(harness.http.requests().is_empty());
    assert_eq!(harness.plane.connects(), 1);
}

#[tokio::test]
async fn test_periodic_check_reruns() {
    // Descriptor advertises an image the server cannot serve
    let http = FakeHttp::new().route(
        &version_url(),
        FakeResponse::ok(br#"{"version":"1.0.2","url":"1.0.2"}"#),
    );
    let harness = Harness::new(FakeControlPlane::new(), http);
    let mut options = options();
    options.update_check_interval = Some(Duration::from_millis(20));

    let requests = harness.http.clone();
    let checked_twice = async move {
        loop {
            let checks = requests
                .requests()
                .iter()
                .filter(|url| **url == version_url())
                .count();
            if checks >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };

    let agent = DeviceAgent::new(options, harness.capabilities());
    let outcome = agent.run(no_sleep, checked_twice).await;

    assert_eq!(assert_ok!(outcome), RunOutcome::Shutdown);
    assert_eq!(harness.device.restarts(), 0);
    assert!(harness.slot.committed().is_none());
}
