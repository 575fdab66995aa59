//! Desktop [`Gateway`] backed by `btleplug`.
//!
//! Desktop platforms have no runtime permission prompt or location-services
//! switch, so those capabilities answer immediately.  The device picker is
//! a scan for the first peripheral advertising the requested service.  GATT
//! operations are queued to one worker task that owns the link and runs
//! them strictly in order.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use btleplug::api::{
    Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{sleep, timeout};
use uuid::Uuid;

use crate::gateway::{
    DeviceSelector, EventSink, GattTransport, LocationServices, Permission, Permissions,
    PickedDevice, Radio, RadioState, StageEvent, StageId, Subscription, TransportError,
};
use crate::protocol::{CharacteristicId, FITNESS_MACHINE_SERVICE};

/// Hard cap on a single `connect()`; BlueZ can otherwise block forever on
/// an out-of-range device.
const LINK_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DISCOVER_TIMEOUT: Duration = Duration::from_secs(15);
const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(250);

// ── BleGatewayConfig ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct BleGatewayConfig {
    /// How long the picker scans before reporting that nothing was chosen.
    /// Default: `15`.
    pub scan_timeout_secs: u64,
    /// Address to connect to without scanning: a MAC on Linux, a
    /// CoreBluetooth UUID on macOS.  Default: `None`.
    pub remembered_address: Option<String>,
    /// Remember the scanned device for later reconnects.  Default: `true`.
    pub remember_picked: bool,
}

impl Default for BleGatewayConfig {
    fn default() -> Self {
        Self {
            scan_timeout_secs: 15,
            remembered_address: None,
            remember_picked: true,
        }
    }
}

// ── BleGateway ────────────────────────────────────────────────────────────────

pub struct BleGateway {
    config: BleGatewayConfig,
    adapter: Adapter,
    sink: EventSink,
    radio_on: Arc<AtomicBool>,
    radio_watcher: Arc<Mutex<Option<StageId>>>,
    remembered: Option<String>,
    picker: Option<JoinHandle<()>>,
    scans: ScanUsers,
    gatt: mpsc::UnboundedSender<GattCommand>,
    tasks: Vec<JoinHandle<()>>,
}

impl BleGateway {
    /// Open the first Bluetooth adapter and start watching its state.
    ///
    /// Results are reported through `sink`, which must feed the same
    /// inbox the [`crate::rower_client::RowerClient`] consumes.
    pub async fn new(config: BleGatewayConfig, sink: EventSink) -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!(TransportError::NoAdapter))?;

        wait_powered_on(&adapter).await;

        let radio_on = match adapter.adapter_state().await {
            Ok(state) => radio_state(state) == RadioState::On,
            Err(e) => {
                warn!("adapter_state() error: {e}, assuming the radio is on");
                true
            }
        };
        info!("adapter ready, radio {}", if radio_on { "on" } else { "off" });
        let radio_on = Arc::new(AtomicBool::new(radio_on));
        let radio_watcher = Arc::new(Mutex::new(None));

        let state_task = tokio::spawn(watch_adapter_state(
            adapter.clone(),
            sink.clone(),
            radio_on.clone(),
            radio_watcher.clone(),
        ));

        let scans = ScanUsers::default();
        let (gatt, commands) = mpsc::unbounded_channel();
        let worker = tokio::spawn(gatt_worker(
            adapter.clone(),
            sink.clone(),
            scans.clone(),
            Duration::from_secs(config.scan_timeout_secs),
            commands,
        ));

        Ok(Self {
            remembered: config.remembered_address.clone(),
            config,
            adapter,
            sink,
            radio_on,
            radio_watcher,
            picker: None,
            scans,
            gatt,
            tasks: vec![state_task, worker],
        })
    }

    fn queue(&self, command: GattCommand) {
        if self.gatt.send(command).is_err() {
            warn!("GATT worker has stopped");
        }
    }
}

impl Drop for BleGateway {
    fn drop(&mut self) {
        if let Some(picker) = self.picker.take() {
            picker.abort();
        }
        for task in &self.tasks {
            task.abort();
        }
    }
}

// ── macOS: wait for the CoreBluetooth manager to reach poweredOn ─────────────

/// CBCentralManager starts in an "unknown" state and silently ignores scans
/// until it reports poweredOn.  Elsewhere this returns at once.
async fn wait_powered_on(adapter: &Adapter) {
    #[cfg(target_os = "macos")]
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        loop {
            match adapter.adapter_state().await {
                Ok(CentralState::PoweredOn) => {
                    info!("macOS: adapter is PoweredOn");
                    break;
                }
                Ok(state) => {
                    if tokio::time::Instant::now() >= deadline {
                        warn!("macOS: adapter still in state {state:?} after 3 s, proceeding anyway");
                        break;
                    }
                    debug!("macOS: adapter state = {state:?}, waiting");
                }
                Err(e) => {
                    warn!("macOS: adapter_state() error: {e}");
                    break;
                }
            }
            sleep(Duration::from_millis(200)).await;
        }
        sleep(Duration::from_millis(300)).await;
    }
    #[cfg(not(target_os = "macos"))]
    let _ = adapter;
}

/// Only a powered-on adapter counts as on; CoreBluetooth reports `Unknown`
/// until it has settled.
fn radio_state(state: CentralState) -> RadioState {
    match state {
        CentralState::PoweredOn => RadioState::On,
        _ => RadioState::Off,
    }
}

// ── Scan ownership ───────────────────────────────────────────────────────────

/// Counts the tasks that currently need the adapter scanning.
///
/// The picker and a connect to an uncached address may scan at the same
/// time; whoever finishes last stops the scan.
#[derive(Debug, Clone, Default)]
struct ScanUsers(Arc<AtomicUsize>);

impl ScanUsers {
    fn enter(&self) -> ScanUse {
        self.0.fetch_add(1, Ordering::SeqCst);
        ScanUse {
            users: self.0.clone(),
            active: true,
        }
    }

    fn idle(&self) -> bool {
        self.0.load(Ordering::SeqCst) == 0
    }
}

/// One registered scan user.  Dropping it (e.g. when its task is aborted)
/// releases the registration without stopping the scan.
#[derive(Debug)]
struct ScanUse {
    users: Arc<AtomicUsize>,
    active: bool,
}

impl ScanUse {
    /// Leave the scan.  Returns `true` when nobody else still needs it.
    fn leave(mut self) -> bool {
        self.active = false;
        self.users.fetch_sub(1, Ordering::SeqCst) == 1
    }
}

impl Drop for ScanUse {
    fn drop(&mut self) {
        if self.active {
            self.users.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Stop scanning once `task` has wound down, unless another user still
/// needs the scan.
async fn stop_scan_after<T>(adapter: Adapter, scans: ScanUsers, task: JoinHandle<T>) {
    let _ = task.await;
    if scans.idle() {
        adapter.stop_scan().await.ok();
    }
}

async fn watch_adapter_state(
    adapter: Adapter,
    sink: EventSink,
    radio_on: Arc<AtomicBool>,
    watcher: Arc<Mutex<Option<StageId>>>,
) {
    let mut events = match adapter.events().await {
        Ok(events) => events,
        Err(e) => {
            warn!("radio watcher: could not subscribe to adapter events: {e}");
            return;
        }
    };
    while let Some(event) = events.next().await {
        let CentralEvent::StateUpdate(state) = event else {
            continue;
        };
        info!("radio state {state:?}");
        let state = radio_state(state);
        radio_on.store(state == RadioState::On, Ordering::SeqCst);

        let stage = watcher.lock().ok().and_then(|w| *w);
        if let Some(stage) = stage {
            sink.send(stage, StageEvent::RadioChanged(state));
        }
    }
    debug!("radio watcher: adapter event stream ended");
}

// ── Platform capabilities ────────────────────────────────────────────────────

impl Permissions for BleGateway {
    fn acquire_permission(&mut self, stage: StageId, permission: Permission) {
        // Granted by the OS at launch (Info.plist on macOS, group membership
        // on Linux); a denial shows up later as scan or connect errors.
        debug!("{permission:?} implied on desktop");
        self.sink
            .send(stage, StageEvent::PermissionResult { granted: true });
    }

    fn abort_permission(&mut self, _stage: StageId) {}
}

impl LocationServices for BleGateway {
    fn location_required(&self) -> bool {
        false
    }

    fn location_enabled(&self) -> bool {
        true
    }

    fn prompt_location(&mut self) {}

    fn watch_location(&mut self, _stage: StageId) {}

    fn unwatch_location(&mut self, _stage: StageId) {}
}

impl Radio for BleGateway {
    fn radio_present(&self) -> bool {
        // `new` fails without an adapter.
        true
    }

    fn radio_enabled(&self) -> bool {
        self.radio_on.load(Ordering::SeqCst)
    }

    fn enable_radio(&mut self) {
        warn!("Bluetooth is off; switch it on to continue");
    }

    fn watch_radio(&mut self, stage: StageId) {
        if let Ok(mut watcher) = self.radio_watcher.lock() {
            *watcher = Some(stage);
        }
    }

    fn unwatch_radio(&mut self, stage: StageId) {
        if let Ok(mut watcher) = self.radio_watcher.lock() {
            if *watcher == Some(stage) {
                *watcher = None;
            }
        }
    }
}

impl DeviceSelector for BleGateway {
    fn remembered_device(&self) -> Option<String> {
        self.remembered.clone()
    }

    fn remember_device(&mut self, address: Option<String>) {
        match &address {
            Some(address) => info!("remembering {address}"),
            None => debug!("forgetting remembered device"),
        }
        self.remembered = address;
    }

    fn prompt_device(&mut self, stage: StageId, service: Uuid) {
        self.cancel_device_prompt();
        let adapter = self.adapter.clone();
        let sink = self.sink.clone();
        let scan_timeout = Duration::from_secs(self.config.scan_timeout_secs);
        let remember = self.config.remember_picked;
        let scans = self.scans.clone();

        self.picker = Some(tokio::spawn(async move {
            let scan = scans.enter();
            let picked = match scan_for_service(&adapter, service, scan_timeout).await {
                Ok((peripheral, name)) => {
                    let address = peripheral.id().to_string();
                    info!("picker: found {name}  id={address}");
                    Some(PickedDevice { address, remember })
                }
                Err(e) => {
                    warn!("picker: {e:#}");
                    None
                }
            };
            if scan.leave() {
                adapter.stop_scan().await.ok();
            }
            sink.send(stage, StageEvent::DevicePicked(picked));
        }));
    }

    fn cancel_device_prompt(&mut self) {
        if let Some(picker) = self.picker.take() {
            if !picker.is_finished() {
                debug!("picker cancelled");
                picker.abort();
                tokio::spawn(stop_scan_after(
                    self.adapter.clone(),
                    self.scans.clone(),
                    picker,
                ));
            }
        }
    }
}

/// Scan until a peripheral advertising `service` appears.
async fn scan_for_service(
    adapter: &Adapter,
    service: Uuid,
    scan_timeout: Duration,
) -> Result<(Peripheral, String)> {
    info!("scanning for {service} ({} s)", scan_timeout.as_secs());
    adapter
        .start_scan(ScanFilter {
            services: vec![service],
        })
        .await?;

    let result = timeout(scan_timeout, async {
        loop {
            let peripherals = adapter.peripherals().await.unwrap_or_default();
            for p in peripherals {
                if let Ok(Some(props)) = p.properties().await {
                    if props.services.contains(&service) {
                        let name = props.local_name.unwrap_or_else(|| "Unknown".into());
                        return (p, name);
                    }
                }
            }
            sleep(SCAN_POLL_INTERVAL).await;
        }
    })
    .await;
    result.map_err(|_| anyhow!("no device offering {service} after {} s", scan_timeout.as_secs()))
}

// ── GATT transport ───────────────────────────────────────────────────────────

#[derive(Debug)]
enum GattCommand {
    Connect { stage: StageId, address: String },
    Discover,
    Read(CharacteristicId),
    Write(CharacteristicId, Vec<u8>),
    Subscribe(CharacteristicId, Subscription),
    Unsubscribe(CharacteristicId),
    Disconnect,
}

impl GattTransport for BleGateway {
    fn connect(&mut self, stage: StageId, address: &str) -> Result<(), TransportError> {
        let address = address.trim();
        if address.is_empty() {
            return Err(TransportError::InvalidAddress(address.to_owned()));
        }
        self.queue(GattCommand::Connect {
            stage,
            address: address.to_owned(),
        });
        Ok(())
    }

    fn discover_services(&mut self) {
        self.queue(GattCommand::Discover);
    }

    fn read_characteristic(&mut self, characteristic: CharacteristicId) {
        self.queue(GattCommand::Read(characteristic));
    }

    fn write_characteristic(&mut self, characteristic: CharacteristicId, value: Vec<u8>) {
        self.queue(GattCommand::Write(characteristic, value));
    }

    fn subscribe(&mut self, characteristic: CharacteristicId, mode: Subscription) {
        self.queue(GattCommand::Subscribe(characteristic, mode));
    }

    fn unsubscribe(&mut self, characteristic: CharacteristicId) {
        self.queue(GattCommand::Unsubscribe(characteristic));
    }

    fn disconnect(&mut self) {
        self.queue(GattCommand::Disconnect);
    }
}

/// The connected peripheral and the tasks forwarding its events.
struct Link {
    stage: StageId,
    peripheral: Peripheral,
    tasks: Vec<JoinHandle<()>>,
}

impl Link {
    fn characteristic(&self, id: CharacteristicId) -> Result<Characteristic> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.service_uuid == id.service && c.uuid == id.uuid)
            .ok_or_else(|| anyhow!("characteristic {id} not found"))
    }

    async fn run(&self, command: GattCommand, sink: &EventSink) -> Result<()> {
        let stage = self.stage;
        match command {
            GattCommand::Discover => {
                timeout(DISCOVER_TIMEOUT, self.peripheral.discover_services())
                    .await
                    .map_err(|_| anyhow!("discover_services() timed out"))??;
                let chars: BTreeSet<Characteristic> = self.peripheral.characteristics();
                let discovered = chars
                    .iter()
                    .map(|c| CharacteristicId::new(c.service_uuid, c.uuid))
                    .collect();
                sink.send(stage, StageEvent::ServicesDiscovered(discovered));
            }
            GattCommand::Read(id) => {
                let value = self.peripheral.read(&self.characteristic(id)?).await?;
                debug!("read {id}: {value:02x?}");
                sink.send(
                    stage,
                    StageEvent::CharacteristicRead {
                        characteristic: id,
                        value,
                    },
                );
            }
            GattCommand::Write(id, value) => {
                debug!("write {id}: {value:02x?}");
                self.peripheral
                    .write(&self.characteristic(id)?, &value, WriteType::WithResponse)
                    .await?;
            }
            GattCommand::Subscribe(id, mode) => {
                // btleplug picks notify or indicate from the characteristic's
                // properties.
                debug!("subscribe {id} ({mode:?})");
                let result = match self.characteristic(id) {
                    Ok(c) => self.peripheral.subscribe(&c).await.map_err(Into::into),
                    Err(e) => Err(e),
                };
                if let Err(e) = &result {
                    warn!("subscribe {id}: {e:#}");
                }
                sink.send(
                    stage,
                    StageEvent::Subscribed {
                        characteristic: id,
                        ok: result.is_ok(),
                    },
                );
            }
            GattCommand::Unsubscribe(id) => {
                self.peripheral
                    .unsubscribe(&self.characteristic(id)?)
                    .await?;
            }
            GattCommand::Connect { .. } | GattCommand::Disconnect => {}
        }
        Ok(())
    }

    async fn release(self) {
        for task in &self.tasks {
            task.abort();
        }
        if let Err(e) = self.peripheral.disconnect().await {
            debug!("disconnect: {e}");
        }
        info!("link released");
    }
}

/// A connect running on its own task so later commands can cancel it.
struct PendingConnect {
    stage: StageId,
    address: String,
    task: JoinHandle<Result<Link>>,
}

impl PendingConnect {
    async fn cancel(self, adapter: &Adapter, scans: &ScanUsers) {
        debug!("connect to {} cancelled", self.address);
        self.task.abort();
        stop_scan_after(adapter.clone(), scans.clone(), self.task).await;
    }
}

/// Wait for the pending connect, or forever when there is none.
async fn connect_finished(
    pending: &mut Option<PendingConnect>,
) -> Result<Result<Link>, JoinError> {
    match pending {
        Some(p) => (&mut p.task).await,
        None => std::future::pending().await,
    }
}

async fn gatt_worker(
    adapter: Adapter,
    sink: EventSink,
    scans: ScanUsers,
    scan_timeout: Duration,
    mut commands: mpsc::UnboundedReceiver<GattCommand>,
) {
    let mut link: Option<Link> = None;
    let mut pending: Option<PendingConnect> = None;
    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else { break };
                match command {
                    GattCommand::Connect { stage, address } => {
                        if let Some(stale) = pending.take() {
                            stale.cancel(&adapter, &scans).await;
                        }
                        if let Some(old) = link.take() {
                            old.release().await;
                        }
                        let task = tokio::spawn(open_link(
                            adapter.clone(),
                            sink.clone(),
                            scans.clone(),
                            stage,
                            address.clone(),
                            scan_timeout,
                        ));
                        pending = Some(PendingConnect { stage, address, task });
                    }
                    GattCommand::Disconnect => {
                        if let Some(stale) = pending.take() {
                            stale.cancel(&adapter, &scans).await;
                        }
                        if let Some(old) = link.take() {
                            old.release().await;
                        }
                    }
                    command => match &link {
                        Some(l) => {
                            if let Err(e) = l.run(command, &sink).await {
                                warn!("GATT operation failed: {e:#}");
                            }
                        }
                        None => debug!("no link for {command:?}"),
                    },
                }
            }
            joined = connect_finished(&mut pending) => {
                let Some(PendingConnect { stage, address, .. }) = pending.take() else {
                    continue;
                };
                match joined {
                    Ok(Ok(opened)) => {
                        sink.send(stage, StageEvent::ConnectionChanged { connected: true });
                        link = Some(opened);
                    }
                    Ok(Err(e)) => {
                        warn!("connect {address}: {e:#}");
                        sink.send(stage, StageEvent::ConnectionChanged { connected: false });
                    }
                    Err(e) => {
                        warn!("connect {address}: task failed: {e}");
                        sink.send(stage, StageEvent::ConnectionChanged { connected: false });
                    }
                }
            }
        }
    }
    if let Some(stale) = pending.take() {
        stale.cancel(&adapter, &scans).await;
    }
    if let Some(old) = link.take() {
        old.release().await;
    }
    debug!("GATT worker stopped");
}

/// Find `address` among known peripherals, scanning for FTMS devices if it
/// has not been seen yet.  The scan is only stopped when no picker shares it.
async fn find_peripheral(
    adapter: &Adapter,
    scans: &ScanUsers,
    address: &str,
    scan_timeout: Duration,
) -> Result<Peripheral> {
    let matches = |p: &Peripheral| {
        let id = p.id().to_string();
        id.eq_ignore_ascii_case(address) || p.address().to_string().eq_ignore_ascii_case(address)
    };

    if let Some(p) = adapter.peripherals().await?.into_iter().find(|p| matches(p)) {
        return Ok(p);
    }

    let scan = scans.enter();
    adapter
        .start_scan(ScanFilter {
            services: vec![FITNESS_MACHINE_SERVICE],
        })
        .await?;
    let found = timeout(scan_timeout, async {
        loop {
            let peripherals = adapter.peripherals().await.unwrap_or_default();
            if let Some(p) = peripherals.into_iter().find(|p| matches(p)) {
                return p;
            }
            sleep(SCAN_POLL_INTERVAL).await;
        }
    })
    .await;
    if scan.leave() {
        adapter.stop_scan().await.ok();
    }
    found.map_err(|_| anyhow!("{address} not seen after {} s", scan_timeout.as_secs()))
}

async fn open_link(
    adapter: Adapter,
    sink: EventSink,
    scans: ScanUsers,
    stage: StageId,
    address: String,
    scan_timeout: Duration,
) -> Result<Link> {
    let peripheral = find_peripheral(&adapter, &scans, &address, scan_timeout).await?;

    if !peripheral.is_connected().await? {
        timeout(LINK_CONNECT_TIMEOUT, peripheral.connect())
            .await
            .map_err(|_| anyhow!("BLE connect() timed out"))??;
    }

    // BlueZ signals the connection before the remote GATT cache is
    // populated; discovering too early returns an empty set.
    #[cfg(target_os = "linux")]
    sleep(Duration::from_millis(600)).await;

    info!("connected {address}");

    let notifications = tokio::spawn(forward_notifications(
        peripheral.clone(),
        sink.clone(),
        stage,
    ));
    let watcher = tokio::spawn(watch_disconnect(
        adapter.clone(),
        peripheral.clone(),
        sink,
        stage,
    ));

    Ok(Link {
        stage,
        peripheral,
        tasks: vec![notifications, watcher],
    })
}

async fn forward_notifications(peripheral: Peripheral, sink: EventSink, stage: StageId) {
    let mut notifications = match peripheral.notifications().await {
        Ok(n) => n,
        Err(e) => {
            warn!("could not get notification stream: {e}");
            return;
        }
    };
    while let Some(notification) = notifications.next().await {
        let service = peripheral
            .characteristics()
            .iter()
            .find(|c| c.uuid == notification.uuid)
            .map(|c| c.service_uuid);
        let Some(service) = service else {
            debug!("notification from unknown {}", notification.uuid);
            continue;
        };
        let delivered = sink.send(
            stage,
            StageEvent::CharacteristicChanged {
                characteristic: CharacteristicId::new(service, notification.uuid),
                value: notification.value,
            },
        );
        if !delivered {
            return;
        }
    }
    info!("notification stream ended");
    sink.send(stage, StageEvent::ConnectionChanged { connected: false });
}

/// Adapter-level disconnect events often arrive before the notification
/// stream closes.
async fn watch_disconnect(adapter: Adapter, peripheral: Peripheral, sink: EventSink, stage: StageId) {
    let peripheral_id = peripheral.id();
    match adapter.events().await {
        Ok(mut events) => {
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(id) = event {
                    if id == peripheral_id {
                        info!("device {id:?} disconnected");
                        sink.send(stage, StageEvent::ConnectionChanged { connected: false });
                        break;
                    }
                }
            }
        }
        Err(e) => warn!("disconnect watcher: could not subscribe to adapter events: {e}"),
    }
}
