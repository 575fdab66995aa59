use std::io::{self, BufRead};

use anyhow::Result;
use clap::Parser;
use log::{info, warn};

use rower_link::ble::BleGateway;
use rower_link::cli::GatewayArgs;
use rower_link::gateway::channel;
use rower_link::rower_client::{RowerClient, RowerClientConfig};
use rower_link::types::RowerEvent;

#[tokio::main]
async fn main() -> Result<()> {
    // ── Logging ───────────────────────────────────────────────────────────────
    // Set RUST_LOG=debug to see every frame and control-point exchange, e.g.:
    //   RUST_LOG=rower_link=debug cargo run
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // ── Configuration ─────────────────────────────────────────────────────────
    let ble_config = GatewayArgs::parse().into();

    // ── Start the client ──────────────────────────────────────────────────────
    let (sink, inbox) = channel();
    let gateway = BleGateway::new(ble_config, sink.clone()).await?;
    let (mut rx, handle) = RowerClient::new(RowerClientConfig::default()).start(gateway, sink, inbox);

    handle.open();
    info!("Connecting to rower …");
    info!("Commands (type + Enter):");
    info!("  o  – open (reconnect after a disconnect)");
    info!("  c  – close");
    info!("  r  – reset the rower's counters");
    info!("  q  – quit\n");

    // ── Stdin command loop ────────────────────────────────────────────────────
    // Lines are read on a dedicated OS thread so no StdinLock is held
    // across await points.
    let (line_tx, mut line_rx) = tokio::sync::mpsc::unbounded_channel::<String>();

    std::thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(l) => {
                    if line_tx.send(l.trim().to_owned()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    // ── Main event loop ───────────────────────────────────────────────────────
    loop {
        tokio::select! {
            line = line_rx.recv() => {
                let Some(line) = line else { break };
                match line.as_str() {
                    "" => {}
                    "q" => {
                        info!("Quit requested.");
                        break;
                    }
                    "o" => handle.open(),
                    "c" => handle.close(),
                    "r" => handle.reset(),
                    other => warn!("Unknown command '{other}'"),
                }
            }
            event = rx.recv() => {
                let Some(event) = event else { break };
                match event {
                    RowerEvent::Connected => info!("✅  Connected, rowing data will follow."),
                    RowerEvent::Disconnected => {
                        info!("❌  Disconnected. Type 'o' + Enter to connect again.")
                    }
                    RowerEvent::Measurement(m) => {
                        println!(
                            "[ROW] {:6} m  {:5} s  {:4} strokes  {:4.1} spm  {:3}.{:02} m/s  {:4} W  {:3} bpm  {:4} kcal",
                            m.distance,
                            m.duration,
                            m.strokes,
                            m.stroke_rate,
                            m.speed / 100,
                            m.speed % 100,
                            m.power,
                            m.pulse,
                            m.energy,
                        );
                    }
                    RowerEvent::Advisory(advisory) => warn!("⚠  {advisory}"),
                    RowerEvent::BatteryLevel(level) => println!("[BATTERY] {level}%"),
                }
            }
        }
    }

    handle.shutdown().await;
    info!("Event loop finished – exiting.");
    Ok(())
}
