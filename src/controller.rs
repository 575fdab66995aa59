//! Drives the [`ConnectionStack`]: entering and releasing stages, routing
//! inputs to the stage they are addressed to, and dropping stale ones.
//!
//! The controller is synchronous and owns all mutable state; it is driven
//! by [`crate::rower_client`], which feeds it one input or deadline at a
//! time.  Tests drive it directly.

use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::gateway::{Command, Gateway, Input, Permission, RadioState, StageEvent, StageId};
use crate::protocol::FITNESS_MACHINE_SERVICE;
use crate::rower_client::RowerClientConfig;
use crate::session::{Session, SessionCx, SessionOutcome};
use crate::stack::{ConnectionStack, Stage, StageKind};
use crate::types::{Advisory, RowerEvent};

pub struct RowerController<G: Gateway> {
    gateway: G,
    config: RowerClientConfig,
    stack: ConnectionStack,
    /// A reset was requested and the device has not yet reported zeroed
    /// counters.  Survives stage changes so a reset requested before the
    /// session exists is sent once control is obtained.
    resetting: bool,
    events: mpsc::UnboundedSender<RowerEvent>,
}

impl<G: Gateway> RowerController<G> {
    pub fn new(
        gateway: G,
        config: RowerClientConfig,
        events: mpsc::UnboundedSender<RowerEvent>,
    ) -> Self {
        Self {
            gateway,
            config,
            stack: ConnectionStack::new(),
            resetting: false,
            events,
        }
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    pub fn gateway_mut(&mut self) -> &mut G {
        &mut self.gateway
    }

    pub fn is_open(&self) -> bool {
        !self.stack.is_empty()
    }

    pub fn resetting(&self) -> bool {
        self.resetting
    }

    /// Id of the top stage, which is the only one accepting most events.
    pub fn current_stage(&self) -> Option<StageId> {
        self.stack.current()
    }

    /// Stage kinds from bottom to top.
    pub fn stages(&self) -> Vec<StageKind> {
        self.stack.kinds()
    }

    pub fn session(&self) -> Option<&Session> {
        let id = self.stack.current()?;
        match self.stack.get(id)? {
            Stage::Session(session) => Some(session),
            _ => None,
        }
    }

    // ── Consumer operations ───────────────────────────────────────────────────

    /// Start negotiating a connection.  No-op while one is in progress.
    pub fn open(&mut self, now: Instant) {
        if self.is_open() {
            debug!("open ignored, connection in progress");
            return;
        }
        info!("opening");
        self.push(Stage::Permission, now);
    }

    /// Unwind every stage.  Safe at any point; inputs addressed to the
    /// popped stages are dropped when they arrive.
    pub fn close(&mut self) {
        if self.is_open() {
            info!("closing");
        }
        while self.pop() {}
    }

    /// Flag a reset and, if a session is current, zero it and ask the
    /// machine to reset.  The stack is left as is.
    pub fn reset(&mut self, now: Instant) {
        info!("reset requested");
        self.resetting = true;
        if let Some(id) = self.stack.current() {
            self.with_session(id, now, |session, cx| {
                session.reset(cx);
                SessionOutcome::Continue
            });
        }
    }

    /// Process one inbox message.
    pub fn handle(&mut self, input: Input, now: Instant) {
        match input {
            Input::Command(Command::Open) => self.open(now),
            Input::Command(Command::Close) | Input::Command(Command::Shutdown) => self.close(),
            Input::Command(Command::Reset) => self.reset(now),
            Input::Stage { stage, event } => self.on_stage_event(stage, event, now),
        }
    }

    /// The earliest timer of the current session, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.session().and_then(Session::next_deadline)
    }

    /// Fire every session timer due at `now`.
    pub fn on_deadline(&mut self, now: Instant) {
        let Some(id) = self.stack.current() else {
            return;
        };
        if let Some(outcome) = self.with_session(id, now, |session, cx| session.on_deadline(cx)) {
            self.apply_outcome(outcome, now);
        }
    }

    // ── Stage events ──────────────────────────────────────────────────────────

    fn on_stage_event(&mut self, id: StageId, event: StageEvent, now: Instant) {
        let Some(kind) = self.stack.get(id).map(Stage::kind) else {
            debug!("dropping {event:?} for popped {id}");
            return;
        };

        // The radio going away invalidates everything above it.
        if kind == StageKind::Radio && event == StageEvent::RadioChanged(RadioState::Off) {
            info!("radio turned off");
            self.abort();
            return;
        }

        if !self.stack.is_current(id) {
            debug!("dropping {event:?} for paused {id}");
            return;
        }

        match (kind, event) {
            (StageKind::Permission, StageEvent::PermissionResult { granted: true }) => {
                debug!("permission granted");
                self.push(Stage::LocationService { watching: false }, now);
            }
            (StageKind::Permission, StageEvent::PermissionResult { granted: false }) => {
                warn!("permission denied");
                self.advise(Advisory::PermissionDenied);
                self.abort();
            }
            (StageKind::LocationService, StageEvent::LocationChanged) => {
                if self.gateway.location_enabled() {
                    info!("location services enabled");
                    self.push(Stage::Radio { watching: false }, now);
                }
            }
            (StageKind::Radio, StageEvent::RadioChanged(RadioState::On)) => {
                info!("radio turned on");
                self.push(Stage::DeviceSelection { prompting: false }, now);
            }
            (StageKind::DeviceSelection, StageEvent::DevicePicked(picked)) => {
                if let Some(Stage::DeviceSelection { prompting }) = self.stack.get_mut(id) {
                    *prompting = false;
                }
                match picked {
                    Some(device) => {
                        info!("picked {} (remember: {})", device.address, device.remember);
                        let remembered = device.remember.then(|| device.address.clone());
                        self.gateway.remember_device(remembered);
                        self.push_session(device.address, now);
                    }
                    None => {
                        info!("device selection cancelled");
                        self.abort();
                    }
                }
            }
            (StageKind::Session, event) => {
                if let Some(outcome) =
                    self.with_session(id, now, |session, cx| session.on_event(cx, event))
                {
                    self.apply_outcome(outcome, now);
                }
            }
            (kind, event) => debug!("{kind:?} ignores {event:?}"),
        }
    }

    // ── Stack operations ──────────────────────────────────────────────────────

    fn push(&mut self, stage: Stage, now: Instant) {
        let kind = stage.kind();
        let id = self.stack.push(stage);
        debug!("push {kind:?} as {id}");
        self.enter(id, kind, now);
    }

    fn push_session(&mut self, address: String, now: Instant) {
        let session = Session::new(address, &self.config);
        self.push(Stage::Session(Box::new(session)), now);
    }

    /// Pop and release the top stage.  Returns `false` on an empty stack.
    fn pop(&mut self) -> bool {
        let Some((id, stage)) = self.stack.pop() else {
            return false;
        };
        debug!("pop {:?} {id}", stage.kind());
        match stage {
            Stage::Permission => self.gateway.abort_permission(id),
            Stage::LocationService { watching } => {
                if watching {
                    self.gateway.unwatch_location(id);
                }
            }
            Stage::Radio { watching } => {
                if watching {
                    self.gateway.unwatch_radio(id);
                }
            }
            Stage::DeviceSelection { prompting } => {
                if prompting {
                    self.gateway.cancel_device_prompt();
                }
            }
            Stage::Session(mut session) => session.close(&mut self.gateway),
        }
        true
    }

    fn enter(&mut self, id: StageId, kind: StageKind, now: Instant) {
        match kind {
            StageKind::Permission => {
                self.gateway
                    .acquire_permission(id, Permission::BluetoothScan);
            }
            StageKind::LocationService => {
                if self.gateway.location_required() && !self.gateway.location_enabled() {
                    info!("waiting for location services");
                    self.advise(Advisory::LocationServicesDisabled);
                    self.gateway.prompt_location();
                    self.gateway.watch_location(id);
                    if let Some(Stage::LocationService { watching }) = self.stack.get_mut(id) {
                        *watching = true;
                    }
                } else {
                    self.push(Stage::Radio { watching: false }, now);
                }
            }
            StageKind::Radio => {
                if !self.gateway.radio_present() {
                    warn!("no radio");
                    self.advise(Advisory::NoRadio);
                    self.abort();
                    return;
                }
                self.gateway.watch_radio(id);
                if let Some(Stage::Radio { watching }) = self.stack.get_mut(id) {
                    *watching = true;
                }
                if self.gateway.radio_enabled() {
                    self.push(Stage::DeviceSelection { prompting: false }, now);
                } else {
                    info!("radio off, requesting enable");
                    self.advise(Advisory::RadioDisabled);
                    self.gateway.enable_radio();
                }
            }
            StageKind::DeviceSelection => match self.gateway.remembered_device() {
                Some(address) => {
                    info!("using remembered device {address}");
                    self.push_session(address, now);
                }
                None => {
                    info!("prompting for a rower");
                    self.gateway.prompt_device(id, FITNESS_MACHINE_SERVICE);
                    if let Some(Stage::DeviceSelection { prompting }) = self.stack.get_mut(id) {
                        *prompting = true;
                    }
                }
            },
            StageKind::Session => {
                if let Some(outcome) = self.with_session(id, now, |session, cx| session.open(cx)) {
                    self.apply_outcome(outcome, now);
                }
            }
        }
    }

    /// Tear down every stage and tell the consumer.
    fn abort(&mut self) {
        self.close();
        self.emit(RowerEvent::Disconnected);
    }

    /// Forget the device and re-prompt from a fresh selection stage.
    fn reselect(&mut self, now: Instant) {
        info!("forgetting device, selecting again");
        self.gateway.remember_device(None);
        while matches!(
            self.stack.current().and_then(|id| self.stack.get(id)).map(Stage::kind),
            Some(StageKind::Session | StageKind::DeviceSelection)
        ) {
            self.pop();
        }
        self.push(Stage::DeviceSelection { prompting: false }, now);
    }

    fn apply_outcome(&mut self, outcome: SessionOutcome, now: Instant) {
        match outcome {
            SessionOutcome::Continue => {}
            SessionOutcome::Connected => self.emit(RowerEvent::Connected),
            SessionOutcome::Reselect => self.reselect(now),
            SessionOutcome::Lost => self.abort(),
        }
    }

    fn with_session<F>(&mut self, id: StageId, now: Instant, f: F) -> Option<SessionOutcome>
    where
        F: FnOnce(&mut Session, &mut SessionCx<'_, G>) -> SessionOutcome,
    {
        let Some(Stage::Session(session)) = self.stack.get_mut(id) else {
            return None;
        };
        let mut cx = SessionCx {
            stage: id,
            gateway: &mut self.gateway,
            config: &self.config,
            events: &self.events,
            resetting: &mut self.resetting,
            now,
        };
        Some(f(session, &mut cx))
    }

    fn advise(&self, advisory: Advisory) {
        info!("advisory: {advisory}");
        self.emit(RowerEvent::Advisory(advisory));
    }

    fn emit(&self, event: RowerEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::PickedDevice;
    use crate::gateway_mock::{GatewayCall, MockGateway};
    use crate::protocol::ROWER_DATA;

    type Controller = RowerController<MockGateway>;

    fn controller(gateway: MockGateway) -> (Controller, mpsc::UnboundedReceiver<RowerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            RowerController::new(gateway, RowerClientConfig::default(), tx),
            rx,
        )
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<RowerEvent>) -> Vec<RowerEvent> {
        let mut out = Vec::new();
        while let Ok(e) = rx.try_recv() {
            out.push(e);
        }
        out
    }

    fn send(c: &mut Controller, stage: StageId, event: StageEvent) {
        c.handle(Input::Stage { stage, event }, Instant::now());
    }

    fn grant(c: &mut Controller) {
        let id = c.current_stage().unwrap();
        send(c, id, StageEvent::PermissionResult { granted: true });
    }

    #[test]
    fn open_walks_to_the_picker() {
        let (mut c, _rx) = controller(MockGateway::new());
        c.open(Instant::now());
        assert_eq!(c.stages(), vec![StageKind::Permission]);
        grant(&mut c);
        assert_eq!(
            c.stages(),
            vec![
                StageKind::Permission,
                StageKind::LocationService,
                StageKind::Radio,
                StageKind::DeviceSelection,
            ]
        );
        let top = c.current_stage().unwrap();
        assert!(c
            .gateway()
            .calls()
            .contains(&GatewayCall::PromptDevice(top, FITNESS_MACHINE_SERVICE)));
    }

    #[test]
    fn open_is_idempotent() {
        let (mut c, _rx) = controller(MockGateway::new());
        c.open(Instant::now());
        c.open(Instant::now());
        assert_eq!(c.stages(), vec![StageKind::Permission]);
        let acquires = c
            .gateway()
            .calls()
            .iter()
            .filter(|call| matches!(call, GatewayCall::AcquirePermission(..)))
            .count();
        assert_eq!(acquires, 1);
    }

    #[test]
    fn remembered_device_skips_the_picker() {
        let (mut c, _rx) = controller(MockGateway::new().with_remembered("AA:BB"));
        c.open(Instant::now());
        grant(&mut c);
        assert_eq!(c.stages().last(), Some(&StageKind::Session));
        let top = c.current_stage().unwrap();
        assert!(c
            .gateway()
            .calls()
            .contains(&GatewayCall::Connect(top, "AA:BB".into())));
    }

    #[test]
    fn stale_location_event_is_a_no_op() {
        let mut gateway = MockGateway::new();
        gateway.location_required = true;
        gateway.location_enabled = false;
        gateway.radio_enabled = false;
        let (mut c, mut rx) = controller(gateway);
        c.open(Instant::now());
        grant(&mut c);
        assert_eq!(c.stages().last(), Some(&StageKind::LocationService));
        let location = c.current_stage().unwrap();
        assert_eq!(
            drain(&mut rx),
            vec![RowerEvent::Advisory(Advisory::LocationServicesDisabled)]
        );

        c.gateway_mut().location_enabled = true;
        send(&mut c, location, StageEvent::LocationChanged);
        assert_eq!(c.stages().last(), Some(&StageKind::Radio));
        let before = c.stages();

        // A duplicate notification to the now-paused location stage.
        send(&mut c, location, StageEvent::LocationChanged);
        assert_eq!(c.stages(), before);

        // And one to a stage that no longer exists.
        c.close();
        send(&mut c, location, StageEvent::LocationChanged);
        assert!(c.stages().is_empty());
    }

    #[test]
    fn close_releases_every_stage() {
        let mut gateway = MockGateway::new();
        gateway.location_required = true;
        gateway.location_enabled = false;
        let (mut c, mut rx) = controller(gateway);
        c.open(Instant::now());
        grant(&mut c);
        let location = c.current_stage().unwrap();
        c.gateway().take_calls();

        c.close();
        assert!(!c.is_open());
        assert_eq!(
            c.gateway().take_calls(),
            vec![
                GatewayCall::UnwatchLocation(location),
                GatewayCall::AbortPermission(StageId(location.0 - 1)),
            ]
        );
        // Closing is not a disconnect signal.
        assert_eq!(
            drain(&mut rx),
            vec![RowerEvent::Advisory(Advisory::LocationServicesDisabled)]
        );
        c.close();
        assert!(c.gateway().take_calls().is_empty());
    }

    #[test]
    fn permission_denied_aborts() {
        let (mut c, mut rx) = controller(MockGateway::new());
        c.open(Instant::now());
        let id = c.current_stage().unwrap();
        send(&mut c, id, StageEvent::PermissionResult { granted: false });
        assert!(!c.is_open());
        assert_eq!(
            drain(&mut rx),
            vec![
                RowerEvent::Advisory(Advisory::PermissionDenied),
                RowerEvent::Disconnected,
            ]
        );
    }

    #[test]
    fn missing_radio_aborts() {
        let mut gateway = MockGateway::new();
        gateway.radio_present = false;
        let (mut c, mut rx) = controller(gateway);
        c.open(Instant::now());
        grant(&mut c);
        assert!(!c.is_open());
        assert_eq!(
            drain(&mut rx),
            vec![
                RowerEvent::Advisory(Advisory::NoRadio),
                RowerEvent::Disconnected,
            ]
        );
    }

    #[test]
    fn disabled_radio_waits_for_enable() {
        let mut gateway = MockGateway::new();
        gateway.radio_enabled = false;
        let (mut c, _rx) = controller(gateway);
        c.open(Instant::now());
        grant(&mut c);
        assert_eq!(c.stages().last(), Some(&StageKind::Radio));
        assert!(c.gateway().calls().contains(&GatewayCall::EnableRadio));

        let radio = c.current_stage().unwrap();
        send(&mut c, radio, StageEvent::RadioChanged(RadioState::On));
        assert_eq!(c.stages().last(), Some(&StageKind::DeviceSelection));
    }

    #[test]
    fn radio_off_below_top_tears_down() {
        let (mut c, mut rx) = controller(MockGateway::new().with_remembered("AA:BB"));
        c.open(Instant::now());
        grant(&mut c);
        let radio = c
            .stages()
            .iter()
            .position(|k| *k == StageKind::Radio)
            .map(|i| StageId(i as u64 + 1))
            .unwrap();
        send(&mut c, radio, StageEvent::RadioChanged(RadioState::Off));
        assert!(!c.is_open());
        assert_eq!(drain(&mut rx), vec![RowerEvent::Disconnected]);
        assert!(c.gateway().calls().contains(&GatewayCall::Disconnect));
    }

    #[test]
    fn cancelled_picker_aborts() {
        let (mut c, mut rx) = controller(MockGateway::new());
        c.open(Instant::now());
        grant(&mut c);
        let picker = c.current_stage().unwrap();
        send(&mut c, picker, StageEvent::DevicePicked(None));
        assert!(!c.is_open());
        assert_eq!(drain(&mut rx), vec![RowerEvent::Disconnected]);
        // The picker already answered; nothing to cancel.
        assert!(!c.gateway().calls().contains(&GatewayCall::CancelDevicePrompt));
    }

    #[test]
    fn picked_device_is_remembered_on_request() {
        let (mut c, _rx) = controller(MockGateway::new());
        c.open(Instant::now());
        grant(&mut c);
        let picker = c.current_stage().unwrap();
        send(
            &mut c,
            picker,
            StageEvent::DevicePicked(Some(PickedDevice {
                address: "AA:BB".into(),
                remember: true,
            })),
        );
        assert_eq!(c.gateway().remembered.as_deref(), Some("AA:BB"));
        assert_eq!(c.stages().last(), Some(&StageKind::Session));
    }

    #[test]
    fn early_disconnect_forgets_device_and_prompts() {
        let (mut c, mut rx) = controller(MockGateway::new().with_remembered("AA:BB"));
        c.open(Instant::now());
        grant(&mut c);
        let session = c.current_stage().unwrap();
        let depth = c.stages().len();

        send(&mut c, session, StageEvent::ConnectionChanged { connected: false });
        assert_eq!(c.stages().len(), depth - 1);
        assert_eq!(c.stages().last(), Some(&StageKind::DeviceSelection));
        assert_eq!(c.gateway().remembered, None);
        let picker = c.current_stage().unwrap();
        assert!(c
            .gateway()
            .calls()
            .contains(&GatewayCall::PromptDevice(picker, FITNESS_MACHINE_SERVICE)));
        assert_eq!(
            drain(&mut rx),
            vec![RowerEvent::Advisory(Advisory::DeviceDisconnected(
                "AA:BB".into()
            ))]
        );

        // Late events from the dropped session are ignored.
        send(&mut c, session, StageEvent::ConnectionChanged { connected: true });
        assert!(!c.gateway().calls().contains(&GatewayCall::DiscoverServices));
    }

    #[test]
    fn rower_without_telemetry_is_forgotten() {
        let (mut c, mut rx) = controller(MockGateway::new().with_remembered("AA:BB"));
        c.open(Instant::now());
        grant(&mut c);
        let session = c.current_stage().unwrap();
        send(&mut c, session, StageEvent::ConnectionChanged { connected: true });
        send(
            &mut c,
            session,
            StageEvent::ServicesDiscovered(vec![crate::protocol::BATTERY_LEVEL]),
        );

        assert_eq!(c.stages().last(), Some(&StageKind::DeviceSelection));
        assert_eq!(c.gateway().remembered, None);
        assert!(c.gateway().calls().contains(&GatewayCall::Disconnect));
        assert_eq!(
            drain(&mut rx),
            vec![RowerEvent::Advisory(Advisory::DeviceNotFound("AA:BB".into()))]
        );
    }

    #[test]
    fn refused_telemetry_subscription_prompts_again() {
        let (mut c, mut rx) = controller(MockGateway::new().with_remembered("AA:BB"));
        c.open(Instant::now());
        grant(&mut c);
        let session = c.current_stage().unwrap();
        send(&mut c, session, StageEvent::ConnectionChanged { connected: true });
        send(&mut c, session, StageEvent::ServicesDiscovered(vec![ROWER_DATA]));
        send(
            &mut c,
            session,
            StageEvent::Subscribed {
                characteristic: ROWER_DATA,
                ok: false,
            },
        );

        assert_eq!(c.stages().last(), Some(&StageKind::DeviceSelection));
        assert_eq!(c.gateway().remembered, None);
        let events = drain(&mut rx);
        assert!(!events.contains(&RowerEvent::Connected));
        assert!(!events.contains(&RowerEvent::Disconnected));
    }

    #[test]
    fn invalid_remembered_address_reselects() {
        let (mut c, _rx) = controller(MockGateway::new().with_remembered(" "));
        c.open(Instant::now());
        grant(&mut c);
        assert_eq!(c.stages().last(), Some(&StageKind::DeviceSelection));
        assert_eq!(c.gateway().remembered, None);
    }

    #[test]
    fn session_loss_after_connect_is_surfaced() {
        let (mut c, mut rx) = controller(MockGateway::new().with_remembered("AA:BB"));
        c.open(Instant::now());
        grant(&mut c);
        let session = c.current_stage().unwrap();
        send(&mut c, session, StageEvent::ConnectionChanged { connected: true });
        send(&mut c, session, StageEvent::ServicesDiscovered(vec![ROWER_DATA]));
        send(
            &mut c,
            session,
            StageEvent::Subscribed {
                characteristic: ROWER_DATA,
                ok: true,
            },
        );
        assert_eq!(drain(&mut rx), vec![RowerEvent::Connected]);

        send(&mut c, session, StageEvent::ConnectionChanged { connected: false });
        assert!(!c.is_open());
        assert_eq!(
            drain(&mut rx),
            vec![
                RowerEvent::Advisory(Advisory::DeviceDisconnected("AA:BB".into())),
                RowerEvent::Disconnected,
            ]
        );
    }

    #[test]
    fn reset_before_session_stays_pending() {
        let (mut c, _rx) = controller(MockGateway::new());
        c.reset(Instant::now());
        assert!(c.resetting());
        assert!(!c.is_open());
        c.open(Instant::now());
        assert!(c.resetting());
    }
}
