//! The GATT session stage: one connection attempt to one addressed rower.
//!
//! ```text
//! Connecting ──connected──▶ Discovering ──telemetry subscribed──▶ Active
//!     │                          │                                  │
//!     └── timeout / disconnect ──┴──────▶ Reselect          disconnect ──▶ Lost
//! ```
//!
//! Timers are deadlines stored here and polled by the controller task, so
//! restarting one replaces it and popping the stage drops all three.

use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::gateway::{Gateway, StageEvent, StageId, Subscription};
use crate::parse::{decode_rower_data, ElapsedTimeTracker};
use crate::protocol::{
    decode_control_response, encode_control, CharacteristicId, ControlResult, FirmwareVersion,
    BATTERY_LEVEL, CONTROL_POINT, LOW_BATTERY, OP_CODE_REQUEST_CONTROL, OP_CODE_RESET,
    ROWER_DATA, SOFTWARE_REVISION,
};
use crate::rower_client::RowerClientConfig;
use crate::types::{Advisory, MeasurementSnapshot, RowerEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Discovering,
    Active,
    Closed,
}

/// What the controller must do after a session step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Continue,
    /// Telemetry is subscribed; tell the consumer.
    Connected,
    /// The attempt failed before telemetry flowed; forget the device and
    /// return to device selection.
    Reselect,
    /// An established session dropped; tear everything down.
    Lost,
}

/// Borrowed controller state a session step may use.
pub(crate) struct SessionCx<'a, G> {
    pub stage: StageId,
    pub gateway: &'a mut G,
    pub config: &'a RowerClientConfig,
    pub events: &'a mpsc::UnboundedSender<RowerEvent>,
    /// Lives in the controller so a reset requested before the session
    /// exists still applies once control is obtained.
    pub resetting: &'a mut bool,
    pub now: Instant,
}

impl<G> SessionCx<'_, G> {
    fn emit(&self, event: RowerEvent) {
        let _ = self.events.send(event);
    }

    fn advise(&self, advisory: Advisory) {
        self.emit(RowerEvent::Advisory(advisory));
    }
}

#[derive(Debug)]
pub struct Session {
    address: String,
    state: SessionState,
    discovered: Vec<CharacteristicId>,
    rower_data: Option<CharacteristicId>,
    /// Telemetry notifications were confirmed at least once.
    subscribed: bool,
    software_revision: Option<CharacteristicId>,
    battery_level: Option<CharacteristicId>,
    low_battery: Option<CharacteristicId>,
    control_point: Option<CharacteristicId>,
    min_control_firmware: Option<FirmwareVersion>,
    snapshot: MeasurementSnapshot,
    clock: ElapsedTimeTracker,
    connect_deadline: Option<Instant>,
    keep_alive_deadline: Option<Instant>,
    reset_deadline: Option<Instant>,
}

impl Session {
    pub fn new(address: String, config: &RowerClientConfig) -> Self {
        let min_control_firmware = FirmwareVersion::parse(&config.min_control_firmware);
        if min_control_firmware.is_none() {
            warn!(
                "unparsable minimum control firmware {:?}; control point disabled",
                config.min_control_firmware
            );
        }
        Self {
            address,
            state: SessionState::Connecting,
            discovered: Vec::new(),
            rower_data: None,
            subscribed: false,
            software_revision: None,
            battery_level: None,
            low_battery: None,
            control_point: None,
            min_control_firmware,
            snapshot: MeasurementSnapshot::default(),
            clock: ElapsedTimeTracker::new(config.max_trusted_elapsed_delta),
            connect_deadline: None,
            keep_alive_deadline: None,
            reset_deadline: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn snapshot(&self) -> &MeasurementSnapshot {
        &self.snapshot
    }

    pub fn control_point(&self) -> Option<CharacteristicId> {
        self.control_point
    }

    /// Earliest pending timer.
    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.connect_deadline,
            self.keep_alive_deadline,
            self.reset_deadline,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    pub(crate) fn open<G: Gateway>(&mut self, cx: &mut SessionCx<'_, G>) -> SessionOutcome {
        info!("connecting {}", self.address);
        match cx.gateway.connect(cx.stage, &self.address) {
            Ok(()) => {
                self.connect_deadline = Some(cx.now + cx.config.connect_timeout);
                SessionOutcome::Continue
            }
            Err(e) => {
                warn!("cannot connect {}: {e}", self.address);
                self.state = SessionState::Closed;
                SessionOutcome::Reselect
            }
        }
    }

    /// Release the link and forget all handles.  Idempotent.
    pub(crate) fn close<G: Gateway>(&mut self, gateway: &mut G) {
        if self.state != SessionState::Closed {
            debug!("disconnecting {}", self.address);
            gateway.disconnect();
            self.state = SessionState::Closed;
        }
        self.discovered.clear();
        self.rower_data = None;
        self.software_revision = None;
        self.battery_level = None;
        self.low_battery = None;
        self.control_point = None;
        self.connect_deadline = None;
        self.keep_alive_deadline = None;
        self.reset_deadline = None;
    }

    /// Zero the snapshot and, if control was obtained, ask the machine to
    /// reset.  The caller has already raised the resetting flag.
    pub(crate) fn reset<G: Gateway>(&mut self, cx: &mut SessionCx<'_, G>) {
        self.snapshot = MeasurementSnapshot::default();
        self.send_reset(cx);
    }

    fn send_reset<G: Gateway>(&mut self, cx: &mut SessionCx<'_, G>) {
        if let Some(control_point) = self.control_point {
            info!("control point: resetting");
            cx.gateway
                .write_characteristic(control_point, encode_control(OP_CODE_RESET));
            self.reset_deadline = Some(cx.now + cx.config.reset_timeout);
        }
    }

    pub(crate) fn on_deadline<G: Gateway>(&mut self, cx: &mut SessionCx<'_, G>) -> SessionOutcome {
        let now = cx.now;
        let due = |deadline: Option<Instant>| deadline.is_some_and(|d| d <= now);

        if due(self.reset_deadline) {
            self.reset_deadline = None;
            if *cx.resetting {
                warn!("reset timeout");
                cx.advise(Advisory::ResetTimeout);
            }
        }

        if due(self.keep_alive_deadline) {
            self.keep_alive_deadline = None;
            if let Some(rower_data) = self.rower_data {
                debug!("rower data quiet, re-enabling notifications");
                cx.gateway.subscribe(rower_data, Subscription::Notify);
            }
        }

        if due(self.connect_deadline) {
            self.connect_deadline = None;
            if !self.subscribed {
                warn!("connection timeout for {}", self.address);
                cx.advise(Advisory::ConnectionFailed(self.address.clone()));
                return SessionOutcome::Reselect;
            }
        }

        SessionOutcome::Continue
    }

    pub(crate) fn on_event<G: Gateway>(
        &mut self,
        cx: &mut SessionCx<'_, G>,
        event: StageEvent,
    ) -> SessionOutcome {
        match event {
            StageEvent::ConnectionChanged { connected: true } => {
                if self.state == SessionState::Connecting {
                    info!("connected {}, discovering services", self.address);
                    self.state = SessionState::Discovering;
                    cx.gateway.discover_services();
                }
                SessionOutcome::Continue
            }
            StageEvent::ConnectionChanged { connected: false } => self.on_disconnected(cx),
            StageEvent::ServicesDiscovered(characteristics) => {
                self.on_services_discovered(cx, characteristics)
            }
            StageEvent::Subscribed { characteristic, ok } => {
                self.on_subscribed(cx, characteristic, ok)
            }
            StageEvent::CharacteristicRead {
                characteristic,
                value,
            } => {
                if Some(characteristic) == self.software_revision {
                    self.on_software_revision(cx, &value);
                } else if Some(characteristic) == self.battery_level {
                    match value.first() {
                        Some(&level) => self.on_battery_level(cx, level),
                        None => warn!("empty battery level read"),
                    }
                }
                SessionOutcome::Continue
            }
            StageEvent::CharacteristicChanged {
                characteristic,
                value,
            } => {
                self.on_characteristic_changed(cx, characteristic, &value);
                SessionOutcome::Continue
            }
            other => {
                debug!("session ignores {other:?}");
                SessionOutcome::Continue
            }
        }
    }

    fn on_disconnected<G: Gateway>(&mut self, cx: &mut SessionCx<'_, G>) -> SessionOutcome {
        if self.state == SessionState::Closed {
            return SessionOutcome::Continue;
        }
        info!("disconnected {}", self.address);
        self.state = SessionState::Closed;

        if cx.gateway.radio_enabled() {
            cx.advise(Advisory::DeviceDisconnected(self.address.clone()));
            if !self.subscribed {
                // Never got telemetry from this address; let the user pick again.
                return SessionOutcome::Reselect;
            }
        }
        SessionOutcome::Lost
    }

    fn on_services_discovered<G: Gateway>(
        &mut self,
        cx: &mut SessionCx<'_, G>,
        characteristics: Vec<CharacteristicId>,
    ) -> SessionOutcome {
        if self.state != SessionState::Discovering {
            debug!("ignoring service discovery in state {:?}", self.state);
            return SessionOutcome::Continue;
        }
        info!(
            "{}: {} characteristics discovered",
            self.address,
            characteristics.len()
        );
        self.discovered = characteristics;
        let find = |wanted: CharacteristicId, discovered: &[CharacteristicId]| {
            discovered.iter().copied().find(|c| *c == wanted)
        };

        self.rower_data = find(ROWER_DATA, &self.discovered);
        let Some(rower_data) = self.rower_data else {
            warn!("{}: no rower data", self.address);
            cx.advise(Advisory::DeviceNotFound(self.address.clone()));
            return SessionOutcome::Reselect;
        };
        debug!("rower data: enabling notifications");
        cx.gateway.subscribe(rower_data, Subscription::Notify);

        self.software_revision = find(SOFTWARE_REVISION, &self.discovered);
        match self.software_revision {
            Some(c) => cx.gateway.read_characteristic(c),
            None => debug!("no software revision"),
        }

        self.battery_level = find(BATTERY_LEVEL, &self.discovered);
        match self.battery_level {
            Some(c) => cx.gateway.read_characteristic(c),
            None => debug!("no battery level"),
        }

        self.low_battery = find(LOW_BATTERY, &self.discovered);
        match self.low_battery {
            Some(c) => cx.gateway.subscribe(c, Subscription::Notify),
            None => debug!("no low battery alert"),
        }

        SessionOutcome::Continue
    }

    fn on_subscribed<G: Gateway>(
        &mut self,
        cx: &mut SessionCx<'_, G>,
        characteristic: CharacteristicId,
        ok: bool,
    ) -> SessionOutcome {
        if Some(characteristic) != self.rower_data {
            if !ok {
                warn!("subscription to {characteristic} failed");
            }
            return SessionOutcome::Continue;
        }

        match (self.state, ok) {
            (SessionState::Discovering, true) => {
                info!("{}: rower data subscribed", self.address);
                self.subscribed = true;
                self.state = SessionState::Active;
                self.connect_deadline = None;
                SessionOutcome::Connected
            }
            (SessionState::Discovering, false) => {
                warn!("{}: rower data subscription refused", self.address);
                cx.advise(Advisory::ConnectionFailed(self.address.clone()));
                SessionOutcome::Reselect
            }
            (_, false) => {
                warn!("rower data re-subscription failed");
                SessionOutcome::Continue
            }
            _ => SessionOutcome::Continue,
        }
    }

    fn on_software_revision<G: Gateway>(&mut self, cx: &mut SessionCx<'_, G>, value: &[u8]) {
        let raw = String::from_utf8_lossy(value);
        info!("software revision {raw:?}");

        let permitted = match (FirmwareVersion::parse(&raw), &self.min_control_firmware) {
            (Some(version), Some(minimum)) => version.permits_control(minimum),
            _ => false,
        };
        if !permitted {
            // Old comm modules refuse to re-bond, and a control-point write
            // triggers bonding.
            info!("control point left alone for revision {raw:?}");
            return;
        }

        self.control_point = self.discovered.iter().copied().find(|c| *c == CONTROL_POINT);
        let Some(control_point) = self.control_point else {
            debug!("no control point");
            return;
        };
        debug!("control point: enabling indications, requesting control");
        cx.gateway.subscribe(control_point, Subscription::Indicate);
        cx.gateway
            .write_characteristic(control_point, encode_control(OP_CODE_REQUEST_CONTROL));

        if *cx.resetting {
            self.send_reset(cx);
        }
    }

    fn on_battery_level<G: Gateway>(&mut self, cx: &mut SessionCx<'_, G>, level: u8) {
        cx.emit(RowerEvent::BatteryLevel(level));
        if level <= cx.config.low_battery_threshold {
            warn!("battery level {level}%");
            cx.advise(Advisory::LowBattery(level));
        } else {
            info!("battery level {level}%");
        }
    }

    fn on_characteristic_changed<G: Gateway>(
        &mut self,
        cx: &mut SessionCx<'_, G>,
        characteristic: CharacteristicId,
        value: &[u8],
    ) {
        if !self.subscribed {
            return;
        }

        if Some(characteristic) == self.control_point {
            debug!("control point changed {value:02x?}");
            match decode_control_response(value) {
                Some(r) if r.result == ControlResult::Success => {
                    debug!("control point op 0x{:02x} succeeded", r.request)
                }
                Some(r) => warn!("control point op 0x{:02x} answered {:?}", r.request, r.result),
                None => {}
            }
        } else if Some(characteristic) == self.low_battery {
            info!("low battery alert");
            let level = cx.config.unknown_battery_level;
            self.on_battery_level(cx, level);
            // One-shot warning channel.
            cx.gateway.unsubscribe(characteristic);
            self.low_battery = None;
        } else if Some(characteristic) == self.rower_data {
            debug!("rower data changed {value:02x?}");
            self.keep_alive_deadline = Some(cx.now + cx.config.keep_alive_timeout);
            self.on_rower_data(cx, value);
        }
    }

    fn on_rower_data<G: Gateway>(&mut self, cx: &mut SessionCx<'_, G>, value: &[u8]) {
        let frame = decode_rower_data(value, &self.snapshot, &mut self.clock, *cx.resetting);

        if *cx.resetting {
            // Only a fully decoded frame can prove the counters are zero.
            if frame.error.is_none() && frame.snapshot.reset_sum() == 0 {
                info!("reset confirmed by device");
                *cx.resetting = false;
                self.reset_deadline = None;
                self.clock = ElapsedTimeTracker::new(cx.config.max_trusted_elapsed_delta);
            } else {
                debug!("discarding frame while resetting");
            }
            return;
        }

        self.snapshot = frame.snapshot;
        if frame.error.is_none() {
            cx.emit(RowerEvent::Measurement(self.snapshot));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::gateway::StageId;
    use crate::gateway_mock::{GatewayCall, MockGateway};

    struct Harness {
        session: Session,
        gateway: MockGateway,
        config: RowerClientConfig,
        events: mpsc::UnboundedSender<RowerEvent>,
        rx: mpsc::UnboundedReceiver<RowerEvent>,
        resetting: bool,
        now: Instant,
    }

    impl Harness {
        fn new() -> Self {
            let config = RowerClientConfig::default();
            let (events, rx) = mpsc::unbounded_channel();
            Self {
                session: Session::new("AA:BB".into(), &config),
                gateway: MockGateway::new(),
                config,
                events,
                rx,
                resetting: false,
                now: Instant::now(),
            }
        }

        fn step<F>(&mut self, f: F) -> SessionOutcome
        where
            F: FnOnce(&mut Session, &mut SessionCx<'_, MockGateway>) -> SessionOutcome,
        {
            let mut cx = SessionCx {
                stage: StageId(1),
                gateway: &mut self.gateway,
                config: &self.config,
                events: &self.events,
                resetting: &mut self.resetting,
                now: self.now,
            };
            f(&mut self.session, &mut cx)
        }

        fn event(&mut self, event: StageEvent) -> SessionOutcome {
            self.step(|s, cx| s.on_event(cx, event))
        }

        fn events(&mut self) -> Vec<RowerEvent> {
            let mut out = Vec::new();
            while let Ok(e) = self.rx.try_recv() {
                out.push(e);
            }
            out
        }

        /// Drive the session to Active with the given characteristics.
        fn activate(&mut self, characteristics: Vec<CharacteristicId>) {
            assert_eq!(self.step(|s, cx| s.open(cx)), SessionOutcome::Continue);
            self.event(StageEvent::ConnectionChanged { connected: true });
            self.event(StageEvent::ServicesDiscovered(characteristics));
            let outcome = self.event(StageEvent::Subscribed {
                characteristic: ROWER_DATA,
                ok: true,
            });
            assert_eq!(outcome, SessionOutcome::Connected);
        }

        fn rower_data(&mut self, value: &[u8]) {
            self.event(StageEvent::CharacteristicChanged {
                characteristic: ROWER_DATA,
                value: value.to_vec(),
            });
        }
    }

    fn measurements(events: &[RowerEvent]) -> Vec<MeasurementSnapshot> {
        events
            .iter()
            .filter_map(|e| match e {
                RowerEvent::Measurement(m) => Some(*m),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn missing_rower_data_reselects() {
        let mut h = Harness::new();
        h.step(|s, cx| s.open(cx));
        h.event(StageEvent::ConnectionChanged { connected: true });
        let outcome = h.event(StageEvent::ServicesDiscovered(vec![BATTERY_LEVEL]));
        assert_eq!(outcome, SessionOutcome::Reselect);
        assert_eq!(
            h.events(),
            vec![RowerEvent::Advisory(Advisory::DeviceNotFound("AA:BB".into()))]
        );
    }

    #[test]
    fn early_disconnect_reselects_late_disconnect_is_lost() {
        let mut h = Harness::new();
        h.step(|s, cx| s.open(cx));
        assert_eq!(
            h.event(StageEvent::ConnectionChanged { connected: false }),
            SessionOutcome::Reselect
        );

        let mut h = Harness::new();
        h.activate(vec![ROWER_DATA]);
        assert_eq!(
            h.event(StageEvent::ConnectionChanged { connected: false }),
            SessionOutcome::Lost
        );
    }

    #[test]
    fn disconnect_with_radio_off_is_lost_without_advisory() {
        let mut h = Harness::new();
        h.step(|s, cx| s.open(cx));
        h.gateway.radio_enabled = false;
        assert_eq!(
            h.event(StageEvent::ConnectionChanged { connected: false }),
            SessionOutcome::Lost
        );
        assert!(h.events().is_empty());
    }

    #[test]
    fn connect_timeout_only_before_subscription() {
        let mut h = Harness::new();
        h.step(|s, cx| s.open(cx));
        assert_eq!(
            h.session.next_deadline(),
            Some(h.now + Duration::from_secs(10))
        );
        h.now += Duration::from_secs(10);
        assert_eq!(h.step(|s, cx| s.on_deadline(cx)), SessionOutcome::Reselect);

        let mut h = Harness::new();
        h.activate(vec![ROWER_DATA]);
        assert_eq!(h.session.next_deadline(), None);
    }

    #[test]
    fn keep_alive_restarts_and_resubscribes() {
        let mut h = Harness::new();
        h.activate(vec![ROWER_DATA]);
        h.gateway.take_calls();

        h.rower_data(&[0x01, 0x00]);
        h.now += Duration::from_millis(1500);
        h.rower_data(&[0x01, 0x00]);
        assert_eq!(
            h.session.next_deadline(),
            Some(h.now + Duration::from_secs(2))
        );

        h.now += Duration::from_secs(2);
        assert_eq!(h.step(|s, cx| s.on_deadline(cx)), SessionOutcome::Continue);
        assert_eq!(
            h.gateway.take_calls(),
            vec![GatewayCall::Subscribe(ROWER_DATA, Subscription::Notify)]
        );
        assert_eq!(h.session.next_deadline(), None);
    }

    #[test]
    fn control_point_gated_by_revision() {
        for (revision, expect_control) in [("3.9", false), ("4.2", true), ("4.10", true)] {
            let mut h = Harness::new();
            h.activate(vec![ROWER_DATA, SOFTWARE_REVISION, CONTROL_POINT]);
            h.gateway.take_calls();
            h.event(StageEvent::CharacteristicRead {
                characteristic: SOFTWARE_REVISION,
                value: revision.as_bytes().to_vec(),
            });
            let writes = h
                .gateway
                .calls()
                .into_iter()
                .filter(|c| matches!(c, GatewayCall::Write(..)))
                .count();
            assert_eq!(writes > 0, expect_control, "revision {revision}");
            assert_eq!(h.session.control_point().is_some(), expect_control);
        }
    }

    #[test]
    fn pending_reset_sent_once_control_obtained() {
        let mut h = Harness::new();
        h.activate(vec![ROWER_DATA, SOFTWARE_REVISION, CONTROL_POINT]);
        h.resetting = true;
        h.gateway.take_calls();
        h.event(StageEvent::CharacteristicRead {
            characteristic: SOFTWARE_REVISION,
            value: b"4.5".to_vec(),
        });
        assert_eq!(
            h.gateway.take_calls(),
            vec![
                GatewayCall::Subscribe(CONTROL_POINT, Subscription::Indicate),
                GatewayCall::Write(CONTROL_POINT, vec![OP_CODE_REQUEST_CONTROL]),
                GatewayCall::Write(CONTROL_POINT, vec![OP_CODE_RESET]),
            ]
        );
        assert_eq!(
            h.session.next_deadline(),
            Some(h.now + Duration::from_secs(3))
        );
    }

    #[test]
    fn reset_timeout_is_advisory_only() {
        let mut h = Harness::new();
        h.activate(vec![ROWER_DATA, SOFTWARE_REVISION, CONTROL_POINT]);
        h.event(StageEvent::CharacteristicRead {
            characteristic: SOFTWARE_REVISION,
            value: b"4.5".to_vec(),
        });
        h.resetting = true;
        h.step(|s, cx| {
            s.reset(cx);
            SessionOutcome::Continue
        });
        h.events();

        h.now += Duration::from_secs(3);
        assert_eq!(h.step(|s, cx| s.on_deadline(cx)), SessionOutcome::Continue);
        assert_eq!(h.events(), vec![RowerEvent::Advisory(Advisory::ResetTimeout)]);
        assert!(h.resetting);
        assert_eq!(h.session.state(), SessionState::Active);
    }

    #[test]
    fn reset_discards_until_counters_reach_zero() {
        let mut h = Harness::new();
        h.activate(vec![ROWER_DATA]);
        // distance 300
        h.rower_data(&[0x05, 0x00, 0x2c, 0x01, 0x00]);
        assert_eq!(h.session.snapshot().distance, 300);
        h.events();

        h.resetting = true;
        h.step(|s, cx| {
            s.reset(cx);
            SessionOutcome::Continue
        });

        // Still reporting the old distance: discarded.
        h.rower_data(&[0x05, 0x00, 0x2c, 0x01, 0x00]);
        assert!(measurements(&h.events()).is_empty());
        assert!(h.resetting);

        // Distance and elapsed time zero: reset confirmed, frame not applied.
        h.rower_data(&[0x05, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00]);
        assert!(measurements(&h.events()).is_empty());
        assert!(!h.resetting);

        // Next frame applies normally.
        h.rower_data(&[0x05, 0x00, 0x0a, 0x00, 0x00]);
        let applied = measurements(&h.events());
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].distance, 10);
    }

    #[test]
    fn undecodable_frame_never_confirms_reset() {
        let mut h = Harness::new();
        h.activate(vec![ROWER_DATA]);
        h.rower_data(&[0x05, 0x00, 0x2c, 0x01, 0x00]);
        h.events();

        h.resetting = true;
        h.step(|s, cx| {
            s.reset(cx);
            SessionOutcome::Continue
        });

        // No flags at all, then flags with the distance cut short.
        h.rower_data(&[0x00]);
        assert!(h.resetting);
        h.rower_data(&[0x05, 0x00, 0x00]);
        assert!(h.resetting);
        assert!(measurements(&h.events()).is_empty());

        h.rower_data(&[0x05, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00]);
        assert!(!h.resetting);
    }

    #[test]
    fn refused_telemetry_subscription_reselects() {
        let mut h = Harness::new();
        h.step(|s, cx| s.open(cx));
        h.event(StageEvent::ConnectionChanged { connected: true });
        h.event(StageEvent::ServicesDiscovered(vec![ROWER_DATA]));
        h.events();

        let outcome = h.event(StageEvent::Subscribed {
            characteristic: ROWER_DATA,
            ok: false,
        });
        assert_eq!(outcome, SessionOutcome::Reselect);
        assert_eq!(h.session.state(), SessionState::Discovering);
        assert_eq!(
            h.events(),
            vec![RowerEvent::Advisory(Advisory::ConnectionFailed("AA:BB".into()))]
        );
    }

    #[test]
    fn truncated_frame_applies_but_does_not_push() {
        let mut h = Harness::new();
        h.activate(vec![ROWER_DATA]);
        h.events();
        h.rower_data(&[0x25, 0x00, 0x64, 0x00, 0x00, 0x10]);
        assert!(measurements(&h.events()).is_empty());
        assert_eq!(h.session.snapshot().distance, 100);
    }

    #[test]
    fn low_battery_alert_is_one_shot() {
        let mut h = Harness::new();
        h.activate(vec![ROWER_DATA, LOW_BATTERY]);
        h.events();
        h.gateway.take_calls();

        for _ in 0..2 {
            h.event(StageEvent::CharacteristicChanged {
                characteristic: LOW_BATTERY,
                value: vec![],
            });
        }
        assert_eq!(
            h.events(),
            vec![
                RowerEvent::BatteryLevel(10),
                RowerEvent::Advisory(Advisory::LowBattery(10)),
            ]
        );
        assert_eq!(h.gateway.take_calls(), vec![GatewayCall::Unsubscribe(LOW_BATTERY)]);
    }

    #[test]
    fn battery_read_advises_only_below_threshold() {
        let mut h = Harness::new();
        h.activate(vec![ROWER_DATA, BATTERY_LEVEL]);
        h.events();

        h.event(StageEvent::CharacteristicRead {
            characteristic: BATTERY_LEVEL,
            value: vec![80],
        });
        assert_eq!(h.events(), vec![RowerEvent::BatteryLevel(80)]);

        h.event(StageEvent::CharacteristicRead {
            characteristic: BATTERY_LEVEL,
            value: vec![25],
        });
        assert_eq!(
            h.events(),
            vec![
                RowerEvent::BatteryLevel(25),
                RowerEvent::Advisory(Advisory::LowBattery(25)),
            ]
        );
    }

    #[test]
    fn close_is_idempotent() {
        let mut h = Harness::new();
        h.activate(vec![ROWER_DATA]);
        h.gateway.take_calls();
        h.session.close(&mut h.gateway);
        h.session.close(&mut h.gateway);
        assert_eq!(h.gateway.take_calls(), vec![GatewayCall::Disconnect]);
        assert_eq!(h.session.state(), SessionState::Closed);
    }
}
