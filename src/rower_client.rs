use std::time::Duration;

use log::{debug, info};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

use crate::controller::RowerController;
use crate::gateway::{Command, EventSink, Gateway, Inbox, Input};
use crate::protocol::{
    CONNECT_TIMEOUT, KEEP_ALIVE_TIMEOUT, LOW_BATTERY_THRESHOLD, MAX_TRUSTED_ELAPSED_DELTA,
    MIN_CONTROL_FIRMWARE, RESET_TIMEOUT, UNKNOWN_LOW_BATTERY_LEVEL,
};
use crate::types::RowerEvent;

// ── RowerClientConfig ─────────────────────────────────────────────────────────

/// Timing and threshold knobs for [`RowerClient`].
#[derive(Debug, Clone)]
pub struct RowerClientConfig {
    /// How long a session may take from connect to subscribed telemetry
    /// before the device is forgotten and the picker shown again.
    /// Default: 10 s.
    pub connect_timeout: Duration,
    /// Silence on the telemetry channel after which notifications are
    /// re-enabled.  Some comm modules drop the subscription every other
    /// minute.  Default: 2 s.
    pub keep_alive_timeout: Duration,
    /// How long to wait for zeroed counters after a reset before warning.
    /// Default: 3 s.
    pub reset_timeout: Duration,
    /// Lowest software revision that may be sent control-point commands,
    /// compared numerically per dotted component.  Default: `"4.2"`.
    pub min_control_firmware: String,
    /// Battery percentage at or below which a warning is raised.  Default: 25.
    pub low_battery_threshold: u8,
    /// Level reported when the device only signals "battery low".  Default: 10.
    pub unknown_battery_level: u8,
    /// Largest elapsed-time step in seconds taken at face value.  Default: 5.
    pub max_trusted_elapsed_delta: u16,
}

impl Default for RowerClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
            keep_alive_timeout: KEEP_ALIVE_TIMEOUT,
            reset_timeout: RESET_TIMEOUT,
            min_control_firmware: MIN_CONTROL_FIRMWARE.into(),
            low_battery_threshold: LOW_BATTERY_THRESHOLD,
            unknown_battery_level: UNKNOWN_LOW_BATTERY_LEVEL,
            max_trusted_elapsed_delta: MAX_TRUSTED_ELAPSED_DELTA,
        }
    }
}

// ── RowerClient ───────────────────────────────────────────────────────────────

/// Keeps one FTMS rowing machine connected and streams its telemetry.
///
/// [`RowerClient::start`] moves a [`RowerController`] into a single tokio
/// task.  That task is the only place any connection state is touched:
/// consumer commands, gateway callbacks and timer expiries are all handled
/// there one at a time, so no locking is needed.
///
/// ```no_run
/// # async fn demo(gateway: rower_link::gateway_mock::MockGateway) {
/// use rower_link::gateway::channel;
/// use rower_link::rower_client::{RowerClient, RowerClientConfig};
///
/// let (sink, inbox) = channel();
/// let (mut events, handle) = RowerClient::new(RowerClientConfig::default())
///     .start(gateway, sink, inbox);
/// handle.open();
/// while let Some(event) = events.recv().await {
///     println!("{event:?}");
/// }
/// # }
/// ```
pub struct RowerClient {
    config: RowerClientConfig,
}

impl RowerClient {
    pub fn new(config: RowerClientConfig) -> Self {
        Self { config }
    }

    /// Spawn the controller task.
    ///
    /// `sink` and `inbox` must come from the same [`crate::gateway::channel`]
    /// call, and `gateway` must report its results through a clone of `sink`.
    /// Must be called from within a tokio runtime.
    pub fn start<G>(
        self,
        gateway: G,
        sink: EventSink,
        inbox: Inbox,
    ) -> (mpsc::UnboundedReceiver<RowerEvent>, RowerHandle)
    where
        G: Gateway + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let controller = RowerController::new(gateway, self.config, tx);
        let task = tokio::spawn(run(controller, inbox));
        (rx, RowerHandle { sink, task })
    }
}

async fn run<G: Gateway>(mut controller: RowerController<G>, mut inbox: Inbox) {
    debug!("rower client task started");
    loop {
        let deadline = controller.next_deadline();
        tokio::select! {
            input = inbox.recv() => {
                let Some(input) = input else {
                    break;
                };
                let shutdown = input == Input::Command(Command::Shutdown);
                controller.handle(input, Instant::now());
                if shutdown {
                    break;
                }
            }
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                controller.on_deadline(Instant::now());
            }
        }
    }
    controller.close();
    info!("rower client task stopped");
}

// ── RowerHandle ───────────────────────────────────────────────────────────────

/// Sends consumer commands to a running [`RowerClient`].
///
/// Commands are queued behind any pending gateway callbacks and never block.
pub struct RowerHandle {
    sink: EventSink,
    task: JoinHandle<()>,
}

impl RowerHandle {
    /// Start connecting, unless a connection is already being negotiated.
    pub fn open(&self) {
        self.sink.command(Command::Open);
    }

    /// Release the connection and every pending platform request.
    pub fn close(&self) {
        self.sink.command(Command::Close);
    }

    /// Zero the displayed measurement and ask the machine to reset.
    pub fn reset(&self) {
        self.sink.command(Command::Reset);
    }

    /// Close and wait for the controller task to finish.
    pub async fn shutdown(self) {
        self.sink.command(Command::Shutdown);
        let _ = self.task.await;
    }
}
