//! Command-line flags shared by the `rower-link` and `tui` binaries.

use clap::Parser;

use crate::ble::BleGatewayConfig;

#[derive(Debug, Parser)]
#[command(version, about = "Keep a Bluetooth FTMS rowing machine connected")]
pub struct GatewayArgs {
    /// Connect to this rower without scanning (MAC on Linux, CoreBluetooth
    /// UUID on macOS)
    #[arg(short, long, value_name = "ID", env = "ROWER_ADDRESS")]
    pub address: Option<String>,

    /// Seconds the device picker scans before giving up
    #[arg(long, value_name = "SECS", default_value_t = 15)]
    pub scan_timeout: u64,

    /// Do not remember a scanned rower for later reconnects
    #[arg(long)]
    pub forget: bool,
}

impl From<GatewayArgs> for BleGatewayConfig {
    fn from(args: GatewayArgs) -> Self {
        Self {
            scan_timeout_secs: args.scan_timeout,
            remembered_address: args.address,
            remember_picked: !args.forget,
        }
    }
}
