//! # rower-link
//!
//! Async Rust library and terminal UI that keeps a Bluetooth Low Energy
//! rowing machine connected and streams its telemetry as normalized
//! measurements.  Any rower implementing the Fitness Machine Service (FTMS)
//! Rower Data characteristic is supported.
//!
//! ## How a connection is made
//!
//! Connecting is a pushdown stack of stages, each waiting on one platform
//! precondition before pushing the next:
//!
//! ```text
//! Permission → LocationService → Radio → DeviceSelection → Session
//! ```
//!
//! A failing stage pops back to retry from an earlier one; a device that
//! connects but never delivers telemetry is forgotten and the picker is
//! shown again.  The consumer only ever sees
//! [`RowerEvent::Connected`](types::RowerEvent::Connected),
//! [`RowerEvent::Disconnected`](types::RowerEvent::Disconnected) and the
//! measurements in between.
//!
//! ## Quick start
//!
//! ```no_run
//! use rower_link::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let (sink, inbox) = channel();
//!     let gateway = BleGateway::new(BleGatewayConfig::default(), sink.clone()).await?;
//!     let (mut rx, handle) = RowerClient::new(RowerClientConfig::default())
//!         .start(gateway, sink, inbox);
//!     handle.open();
//!
//!     while let Some(event) = rx.recv().await {
//!         match event {
//!             RowerEvent::Measurement(m) => println!("{} m in {} s", m.distance, m.duration),
//!             RowerEvent::Disconnected => break,
//!             _ => {}
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`prelude`] | One-line glob import of the most commonly needed types |
//! | [`rower_client`] | The controller task, its config and the [`rower_client::RowerHandle`] command API |
//! | [`ble`] | `btleplug` implementation of the platform capabilities |
//! | [`cli`] | `clap` flags shared by the binaries, mapped onto [`ble::BleGatewayConfig`] |
//! | [`types`] | Measurement snapshot, advisories and the event stream |
//! | [`protocol`] | GATT UUIDs, control-point op codes, firmware versions, defaults |
//! | [`parse`] | Rower Data frame decoder and elapsed-time correction |
//! | [`gateway`] | Capability traits the controller drives, and its inbox |
//! | [`gateway_mock`] | Recording in-memory gateway for tests |
//! | [`controller`] | Stage transitions and stale-event filtering |
//! | [`stack`] / [`session`] | The stage stack and the GATT session stage |

pub mod ble;
pub mod cli;
pub mod controller;
pub mod gateway;
pub mod gateway_mock;
pub mod parse;
pub mod protocol;
pub mod rower_client;
pub mod session;
pub mod stack;
pub mod types;

// ── Prelude ───────────────────────────────────────────────────────────────────

/// Convenience re-exports for downstream crates.
pub mod prelude {
    // ── Client ────────────────────────────────────────────────────────────────
    pub use crate::ble::{BleGateway, BleGatewayConfig};
    pub use crate::gateway::channel;
    pub use crate::rower_client::{RowerClient, RowerClientConfig, RowerHandle};

    // ── Events and data types ─────────────────────────────────────────────────
    pub use crate::types::{Advisory, MeasurementSnapshot, RowerEvent};

    // ── Protocol ──────────────────────────────────────────────────────────────
    pub use crate::protocol::{FirmwareVersion, FITNESS_MACHINE_SERVICE, MIN_CONTROL_FIRMWARE};
}
