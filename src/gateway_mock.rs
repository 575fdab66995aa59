use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::gateway::{
    DeviceSelector, EventSink, GattTransport, LocationServices, Permission, Permissions, Radio,
    StageEvent, StageId, Subscription, TransportError,
};
use crate::protocol::CharacteristicId;

/// One capability call observed by [`MockGateway`].
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayCall {
    AcquirePermission(StageId, Permission),
    AbortPermission(StageId),
    PromptLocation,
    WatchLocation(StageId),
    UnwatchLocation(StageId),
    EnableRadio,
    WatchRadio(StageId),
    UnwatchRadio(StageId),
    RememberDevice(Option<String>),
    PromptDevice(StageId, Uuid),
    CancelDevicePrompt,
    Connect(StageId, String),
    DiscoverServices,
    Read(CharacteristicId),
    Write(CharacteristicId, Vec<u8>),
    Subscribe(CharacteristicId, Subscription),
    Unsubscribe(CharacteristicId),
    Disconnect,
}

/// In-memory gateway that records every call.
///
/// Environment flags are plain fields so tests can flip them between
/// events.  Clones share the call log.  With [`MockGateway::with_sink`],
/// permission requests are granted immediately through the inbox.
#[derive(Debug, Clone)]
pub struct MockGateway {
    pub location_required: bool,
    pub location_enabled: bool,
    pub radio_present: bool,
    pub radio_enabled: bool,
    pub remembered: Option<String>,
    calls: Arc<Mutex<Vec<GatewayCall>>>,
    sink: Option<EventSink>,
}

impl MockGateway {
    /// A platform with the radio on and no location requirement.
    pub fn new() -> Self {
        Self {
            location_required: false,
            location_enabled: true,
            radio_present: true,
            radio_enabled: true,
            remembered: None,
            calls: Arc::new(Mutex::new(Vec::new())),
            sink: None,
        }
    }

    pub fn with_remembered(mut self, address: &str) -> Self {
        self.remembered = Some(address.to_owned());
        self
    }

    pub fn with_sink(mut self, sink: EventSink) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Every call so far, oldest first.
    pub fn calls(&self) -> Vec<GatewayCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Drain the call log.
    pub fn take_calls(&self) -> Vec<GatewayCall> {
        self.calls
            .lock()
            .map(|mut c| std::mem::take(&mut *c))
            .unwrap_or_default()
    }

    fn record(&self, call: GatewayCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }
}

impl Default for MockGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl Permissions for MockGateway {
    fn acquire_permission(&mut self, stage: StageId, permission: Permission) {
        self.record(GatewayCall::AcquirePermission(stage, permission));
        if let Some(sink) = &self.sink {
            sink.send(stage, StageEvent::PermissionResult { granted: true });
        }
    }

    fn abort_permission(&mut self, stage: StageId) {
        self.record(GatewayCall::AbortPermission(stage));
    }
}

impl LocationServices for MockGateway {
    fn location_required(&self) -> bool {
        self.location_required
    }

    fn location_enabled(&self) -> bool {
        self.location_enabled
    }

    fn prompt_location(&mut self) {
        self.record(GatewayCall::PromptLocation);
    }

    fn watch_location(&mut self, stage: StageId) {
        self.record(GatewayCall::WatchLocation(stage));
    }

    fn unwatch_location(&mut self, stage: StageId) {
        self.record(GatewayCall::UnwatchLocation(stage));
    }
}

impl Radio for MockGateway {
    fn radio_present(&self) -> bool {
        self.radio_present
    }

    fn radio_enabled(&self) -> bool {
        self.radio_enabled
    }

    fn enable_radio(&mut self) {
        self.record(GatewayCall::EnableRadio);
    }

    fn watch_radio(&mut self, stage: StageId) {
        self.record(GatewayCall::WatchRadio(stage));
    }

    fn unwatch_radio(&mut self, stage: StageId) {
        self.record(GatewayCall::UnwatchRadio(stage));
    }
}

impl DeviceSelector for MockGateway {
    fn remembered_device(&self) -> Option<String> {
        self.remembered.clone()
    }

    fn remember_device(&mut self, address: Option<String>) {
        self.record(GatewayCall::RememberDevice(address.clone()));
        self.remembered = address;
    }

    fn prompt_device(&mut self, stage: StageId, service: Uuid) {
        self.record(GatewayCall::PromptDevice(stage, service));
    }

    fn cancel_device_prompt(&mut self) {
        self.record(GatewayCall::CancelDevicePrompt);
    }
}

impl GattTransport for MockGateway {
    fn connect(&mut self, stage: StageId, address: &str) -> Result<(), TransportError> {
        self.record(GatewayCall::Connect(stage, address.to_owned()));
        if address.trim().is_empty() {
            return Err(TransportError::InvalidAddress(address.to_owned()));
        }
        Ok(())
    }

    fn discover_services(&mut self) {
        self.record(GatewayCall::DiscoverServices);
    }

    fn read_characteristic(&mut self, characteristic: CharacteristicId) {
        self.record(GatewayCall::Read(characteristic));
    }

    fn write_characteristic(&mut self, characteristic: CharacteristicId, value: Vec<u8>) {
        self.record(GatewayCall::Write(characteristic, value));
    }

    fn subscribe(&mut self, characteristic: CharacteristicId, mode: Subscription) {
        self.record(GatewayCall::Subscribe(characteristic, mode));
    }

    fn unsubscribe(&mut self, characteristic: CharacteristicId) {
        self.record(GatewayCall::Unsubscribe(characteristic));
    }

    fn disconnect(&mut self) {
        self.record(GatewayCall::Disconnect);
    }
}
