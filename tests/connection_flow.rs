//! End-to-end connection scenarios against the recording gateway.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};

use rower_link::controller::RowerController;
use rower_link::gateway::{channel, Input, StageEvent, StageId, Subscription};
use rower_link::gateway_mock::{GatewayCall, MockGateway};
use rower_link::protocol::{
    CONTROL_POINT, OP_CODE_REQUEST_CONTROL, ROWER_DATA, SOFTWARE_REVISION,
};
use rower_link::rower_client::{RowerClient, RowerClientConfig};
use rower_link::stack::StageKind;
use rower_link::types::{Advisory, RowerEvent};

fn drain(rx: &mut mpsc::UnboundedReceiver<RowerEvent>) -> Vec<RowerEvent> {
    let mut out = Vec::new();
    while let Ok(e) = rx.try_recv() {
        out.push(e);
    }
    out
}

/// A controller with a remembered rower, walked up to its session stage.
fn connecting() -> (
    RowerController<MockGateway>,
    mpsc::UnboundedReceiver<RowerEvent>,
    StageId,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let gateway = MockGateway::new().with_remembered("AA:BB:CC:DD:EE:FF");
    let mut controller = RowerController::new(gateway, RowerClientConfig::default(), tx);

    controller.open(Instant::now());
    let permission = controller.current_stage().unwrap();
    controller.handle(
        Input::Stage {
            stage: permission,
            event: StageEvent::PermissionResult { granted: true },
        },
        Instant::now(),
    );
    assert_eq!(
        controller.stages(),
        vec![
            StageKind::Permission,
            StageKind::LocationService,
            StageKind::Radio,
            StageKind::DeviceSelection,
            StageKind::Session,
        ]
    );
    let session = controller.current_stage().unwrap();
    (controller, rx, session)
}

fn send(controller: &mut RowerController<MockGateway>, stage: StageId, event: StageEvent) {
    controller.handle(Input::Stage { stage, event }, Instant::now());
}

fn establish(
    controller: &mut RowerController<MockGateway>,
    rx: &mut mpsc::UnboundedReceiver<RowerEvent>,
    session: StageId,
) {
    send(controller, session, StageEvent::ConnectionChanged { connected: true });
    send(
        controller,
        session,
        StageEvent::ServicesDiscovered(vec![ROWER_DATA, CONTROL_POINT, SOFTWARE_REVISION]),
    );
    assert!(drain(rx).is_empty(), "connected before telemetry was subscribed");

    send(
        controller,
        session,
        StageEvent::Subscribed {
            characteristic: ROWER_DATA,
            ok: true,
        },
    );
    assert_eq!(drain(rx), vec![RowerEvent::Connected]);
}

#[test]
fn control_requested_after_revision_read() {
    let (mut controller, mut rx, session) = connecting();
    establish(&mut controller, &mut rx, session);

    let calls = controller.gateway().calls();
    assert!(calls.contains(&GatewayCall::Read(SOFTWARE_REVISION)));
    assert!(!calls.iter().any(|c| matches!(c, GatewayCall::Write(..))));

    send(
        &mut controller,
        session,
        StageEvent::CharacteristicRead {
            characteristic: SOFTWARE_REVISION,
            value: b"4.5".to_vec(),
        },
    );
    let calls = controller.gateway().calls();
    let read = calls
        .iter()
        .position(|c| *c == GatewayCall::Read(SOFTWARE_REVISION))
        .unwrap();
    let write = calls
        .iter()
        .position(|c| *c == GatewayCall::Write(CONTROL_POINT, vec![OP_CODE_REQUEST_CONTROL]))
        .expect("request-control write");
    assert!(read < write);
    assert!(calls.contains(&GatewayCall::Subscribe(CONTROL_POINT, Subscription::Indicate)));
}

#[test]
fn old_firmware_never_gets_control_point_writes() {
    let (mut controller, mut rx, session) = connecting();
    establish(&mut controller, &mut rx, session);

    send(
        &mut controller,
        session,
        StageEvent::CharacteristicRead {
            characteristic: SOFTWARE_REVISION,
            value: b"3.9".to_vec(),
        },
    );
    // A reset must not sneak a write through either.
    controller.reset(Instant::now());

    let calls = controller.gateway().calls();
    assert!(!calls.iter().any(|c| matches!(c, GatewayCall::Write(..))));
    assert!(!calls
        .iter()
        .any(|c| matches!(c, GatewayCall::Subscribe(cp, _) if *cp == CONTROL_POINT)));
}

/// The stage id passed to the most recent `connect`.
fn connected_stage(gateway: &MockGateway) -> Option<StageId> {
    gateway.calls().iter().rev().find_map(|c| match c {
        GatewayCall::Connect(stage, _) => Some(*stage),
        _ => None,
    })
}

#[tokio::test(start_paused = true)]
async fn silent_device_is_forgotten_after_connect_timeout() {
    let (sink, inbox) = channel();
    let gateway = MockGateway::new()
        .with_remembered("AA:BB:CC:DD:EE:FF")
        .with_sink(sink.clone());
    let probe = gateway.clone();
    let (mut rx, handle) = RowerClient::new(RowerClientConfig::default()).start(gateway, sink, inbox);

    let started = Instant::now();
    handle.open();

    let event = timeout(Duration::from_secs(60), rx.recv()).await.unwrap();
    assert_eq!(
        event,
        Some(RowerEvent::Advisory(Advisory::ConnectionFailed(
            "AA:BB:CC:DD:EE:FF".into()
        )))
    );
    assert!(started.elapsed() >= Duration::from_secs(10));

    let calls = probe.calls();
    let forgotten = calls
        .iter()
        .position(|c| *c == GatewayCall::RememberDevice(None))
        .expect("device forgotten");
    assert!(calls[forgotten..]
        .iter()
        .any(|c| matches!(c, GatewayCall::PromptDevice(..))));

    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn telemetry_streams_and_keep_alive_resubscribes() {
    let (sink, inbox) = channel();
    let gateway = MockGateway::new()
        .with_remembered("AA:BB:CC:DD:EE:FF")
        .with_sink(sink.clone());
    let probe = gateway.clone();
    let (mut rx, handle) =
        RowerClient::new(RowerClientConfig::default()).start(gateway, sink.clone(), inbox);

    handle.open();
    tokio::time::sleep(Duration::from_millis(10)).await;
    let session = connected_stage(&probe).expect("connect issued");

    sink.send(session, StageEvent::ConnectionChanged { connected: true });
    sink.send(session, StageEvent::ServicesDiscovered(vec![ROWER_DATA]));
    sink.send(
        session,
        StageEvent::Subscribed {
            characteristic: ROWER_DATA,
            ok: true,
        },
    );
    assert_eq!(rx.recv().await, Some(RowerEvent::Connected));

    // flags: more data + total distance (1000 m) + elapsed time (3 s)
    sink.send(
        session,
        StageEvent::CharacteristicChanged {
            characteristic: ROWER_DATA,
            value: vec![0x05, 0x08, 0xE8, 0x03, 0x00, 0x03, 0x00],
        },
    );
    match rx.recv().await {
        Some(RowerEvent::Measurement(m)) => {
            assert_eq!(m.distance, 1000);
            assert_eq!(m.duration, 3);
        }
        other => panic!("expected a measurement, got {other:?}"),
    }

    probe.take_calls();
    tokio::time::sleep(Duration::from_millis(2100)).await;
    assert_eq!(
        probe.take_calls(),
        vec![GatewayCall::Subscribe(ROWER_DATA, Subscription::Notify)]
    );

    handle.shutdown().await;
    assert!(probe.calls().contains(&GatewayCall::Disconnect));
    // The stream ends once the task has stopped.
    assert_eq!(rx.recv().await, None);
}
