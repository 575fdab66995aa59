//! Platform capabilities consumed by the connection stack.
//!
//! The controller never blocks on the platform.  Every capability method
//! either answers synchronously from cached state (`radio_enabled`) or starts
//! an operation whose result comes back later as an [`Input::Stage`] message
//! on the controller's inbox, tagged with the [`StageId`] that asked for it.
//! Stage ids are never reused, so a result addressed to a stage that has
//! since been popped is recognisably stale and is dropped.
//!
//! ```text
//!  RowerHandle ──Command──┐
//!                         ▼
//!  gateway task ──Stage──▶ inbox ──▶ RowerController (one task)
//!        ▲                                 │
//!        └──────── capability calls ───────┘
//! ```

use std::fmt;

use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::CharacteristicId;

/// Identity of one pushed stage.  Unique for the lifetime of a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StageId(pub(crate) u64);

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stage#{}", self.0)
    }
}

/// OS permission needed before the radio may scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    /// Fine location on platforms that gate BLE scanning behind it.
    BluetoothScan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioState {
    On,
    Off,
}

/// How a characteristic delivers value changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subscription {
    Notify,
    Indicate,
}

/// A device chosen in the picker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PickedDevice {
    pub address: String,
    /// Whether the user asked for this device to be used next time.
    pub remember: bool,
}

/// Asynchronous platform and transport results, addressed to one stage.
#[derive(Debug, Clone, PartialEq)]
pub enum StageEvent {
    PermissionResult { granted: bool },
    /// Location services were toggled; re-check [`LocationServices::location_enabled`].
    LocationChanged,
    RadioChanged(RadioState),
    /// `None` when the picker was dismissed without a choice.
    DevicePicked(Option<PickedDevice>),
    ConnectionChanged { connected: bool },
    ServicesDiscovered(Vec<CharacteristicId>),
    Subscribed {
        characteristic: CharacteristicId,
        ok: bool,
    },
    CharacteristicRead {
        characteristic: CharacteristicId,
        value: Vec<u8>,
    },
    CharacteristicChanged {
        characteristic: CharacteristicId,
        value: Vec<u8>,
    },
}

/// Requests from the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Open,
    Close,
    Reset,
    /// Close and stop the controller task.
    Shutdown,
}

/// Everything the controller task consumes, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Command(Command),
    Stage { stage: StageId, event: StageEvent },
}

pub type Inbox = mpsc::UnboundedReceiver<Input>;

/// Cloneable sender into the controller's inbox.
///
/// Gateways hold one to report asynchronous results; sending after the
/// controller has stopped is a silent no-op.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<Input>,
}

impl EventSink {
    /// Report `event` to `stage`.  Returns `false` once the controller is gone.
    pub fn send(&self, stage: StageId, event: StageEvent) -> bool {
        self.tx.send(Input::Stage { stage, event }).is_ok()
    }

    pub(crate) fn command(&self, command: Command) -> bool {
        self.tx.send(Input::Command(command)).is_ok()
    }
}

/// Create the inbox shared by a controller and its gateway.
pub fn channel() -> (EventSink, Inbox) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSink { tx }, rx)
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("invalid device address {0:?}")]
    InvalidAddress(String),
    #[error("no Bluetooth adapter available")]
    NoAdapter,
}

// ── Capabilities ──────────────────────────────────────────────────────────────

pub trait Permissions {
    /// Ask for `permission`; answer with [`StageEvent::PermissionResult`].
    fn acquire_permission(&mut self, stage: StageId, permission: Permission);
    /// Dismiss a pending request made by `stage`.
    fn abort_permission(&mut self, stage: StageId);
}

pub trait LocationServices {
    /// Whether the platform refuses to scan without location services.
    fn location_required(&self) -> bool;
    fn location_enabled(&self) -> bool;
    /// Send the user to the location settings.
    fn prompt_location(&mut self);
    /// Report [`StageEvent::LocationChanged`] to `stage` until unwatched.
    fn watch_location(&mut self, stage: StageId);
    fn unwatch_location(&mut self, stage: StageId);
}

pub trait Radio {
    fn radio_present(&self) -> bool;
    fn radio_enabled(&self) -> bool;
    /// Ask for the radio to be switched on.  Completion arrives through the watch.
    fn enable_radio(&mut self);
    /// Report [`StageEvent::RadioChanged`] to `stage` until unwatched.
    fn watch_radio(&mut self, stage: StageId);
    fn unwatch_radio(&mut self, stage: StageId);
}

pub trait DeviceSelector {
    fn remembered_device(&self) -> Option<String>;
    /// Replace (or with `None`, forget) the remembered address.
    fn remember_device(&mut self, address: Option<String>);
    /// Let the user pick a device offering `service`; answer with
    /// [`StageEvent::DevicePicked`].
    fn prompt_device(&mut self, stage: StageId, service: Uuid);
    fn cancel_device_prompt(&mut self);
}

/// GATT client operations on the single active link.
///
/// Operations are queued and executed in call order.  Results and
/// notifications are reported to the stage that called [`GattTransport::connect`].
pub trait GattTransport {
    /// Start connecting; answer with [`StageEvent::ConnectionChanged`].
    fn connect(&mut self, stage: StageId, address: &str) -> Result<(), TransportError>;
    /// Answer with [`StageEvent::ServicesDiscovered`].
    fn discover_services(&mut self);
    /// Answer with [`StageEvent::CharacteristicRead`].
    fn read_characteristic(&mut self, characteristic: CharacteristicId);
    fn write_characteristic(&mut self, characteristic: CharacteristicId, value: Vec<u8>);
    /// Answer with [`StageEvent::Subscribed`]; changes then arrive as
    /// [`StageEvent::CharacteristicChanged`].
    fn subscribe(&mut self, characteristic: CharacteristicId, mode: Subscription);
    fn unsubscribe(&mut self, characteristic: CharacteristicId);
    /// Release the link.  Safe to call when not connected.
    fn disconnect(&mut self);
}

/// The full capability set required by [`crate::controller::RowerController`].
pub trait Gateway: Permissions + LocationServices + Radio + DeviceSelector + GattTransport {}

impl<T> Gateway for T where T: Permissions + LocationServices + Radio + DeviceSelector + GattTransport {}
