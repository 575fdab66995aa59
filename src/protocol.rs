//! GATT UUIDs, control-point op codes, timing defaults, and wire helpers for
//! FTMS rowing machines.
//!
//! Standard characteristics use the Bluetooth SIG base UUID
//! `0000XXXX-0000-1000-8000-00805f9b34fb`.  The low-battery alert belongs to a
//! vendor namespace used by comm modules that do not implement the standard
//! battery service.

use std::cmp::Ordering;
use std::fmt;
use std::time::Duration;

use uuid::Uuid;

// ── Services ─────────────────────────────────────────────────────────────────

/// Fitness Machine Service (0x1826).
///
/// Used as the scan filter when prompting for a device and as the parent of
/// the rower-data and control-point characteristics.
pub const FITNESS_MACHINE_SERVICE: Uuid = Uuid::from_u128(0x00001826_0000_1000_8000_00805f9b34fb);

/// Device Information Service (0x180A).
pub const DEVICE_INFORMATION_SERVICE: Uuid =
    Uuid::from_u128(0x0000180a_0000_1000_8000_00805f9b34fb);

/// Battery Service (0x180F).
pub const BATTERY_SERVICE: Uuid = Uuid::from_u128(0x0000180f_0000_1000_8000_00805f9b34fb);

/// Vendor service carrying the low-battery alert characteristic.
pub const LOW_BATTERY_SERVICE: Uuid = Uuid::from_u128(0x00001001_c042_66ba_1335_90118f542c77);

// ── Characteristics ──────────────────────────────────────────────────────────

/// Rower Data (0x2AD1), the telemetry stream decoded by
/// [`crate::parse::decode_rower_data`].  Required; a device without it is
/// treated as "not found".
pub const ROWER_DATA_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x00002ad1_0000_1000_8000_00805f9b34fb);

/// Fitness Machine Control Point (0x2AD9).
///
/// Accepts op codes (see [`OP_CODE_REQUEST_CONTROL`], [`OP_CODE_RESET`]) and
/// answers with indications.  Only touched on firmware at or above
/// [`MIN_CONTROL_FIRMWARE`].
pub const CONTROL_POINT_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x00002ad9_0000_1000_8000_00805f9b34fb);

/// Software Revision String (0x2A28).
pub const SOFTWARE_REVISION_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x00002a28_0000_1000_8000_00805f9b34fb);

/// Battery Level (0x2A19), a single `u8` percentage.
pub const BATTERY_LEVEL_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x00002a19_0000_1000_8000_00805f9b34fb);

/// Proprietary low-battery alert.
///
/// Notifies a handful of times per session without carrying a level.
pub const LOW_BATTERY_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x8ec92002_f315_4f60_9fb8_838830daea50);

/// A characteristic addressed by its parent service and its own UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CharacteristicId {
    pub service: Uuid,
    pub uuid: Uuid,
}

impl CharacteristicId {
    pub const fn new(service: Uuid, uuid: Uuid) -> Self {
        Self { service, uuid }
    }
}

impl fmt::Display for CharacteristicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.uuid)
    }
}

pub const ROWER_DATA: CharacteristicId =
    CharacteristicId::new(FITNESS_MACHINE_SERVICE, ROWER_DATA_CHARACTERISTIC);
pub const CONTROL_POINT: CharacteristicId =
    CharacteristicId::new(FITNESS_MACHINE_SERVICE, CONTROL_POINT_CHARACTERISTIC);
pub const SOFTWARE_REVISION: CharacteristicId =
    CharacteristicId::new(DEVICE_INFORMATION_SERVICE, SOFTWARE_REVISION_CHARACTERISTIC);
pub const BATTERY_LEVEL: CharacteristicId =
    CharacteristicId::new(BATTERY_SERVICE, BATTERY_LEVEL_CHARACTERISTIC);
pub const LOW_BATTERY: CharacteristicId =
    CharacteristicId::new(LOW_BATTERY_SERVICE, LOW_BATTERY_CHARACTERISTIC);

// ── Control point ────────────────────────────────────────────────────────────

/// Ask the machine for exclusive control.  Must precede any other op code.
pub const OP_CODE_REQUEST_CONTROL: u8 = 0x00;

/// Zero the machine's workout counters.
pub const OP_CODE_RESET: u8 = 0x01;

/// Leading byte of every control-point indication.
pub const OP_CODE_RESPONSE: u8 = 0x80;

/// Encode a parameterless control-point request.
///
/// # Example
///
/// ```
/// # use rower_link::protocol::{encode_control, OP_CODE_RESET};
/// assert_eq!(encode_control(OP_CODE_RESET), vec![0x01]);
/// ```
pub fn encode_control(op_code: u8) -> Vec<u8> {
    vec![op_code]
}

/// Result code carried by a control-point indication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlResult {
    Success,
    NotSupported,
    InvalidParameter,
    Failed,
    ControlNotPermitted,
    Unknown(u8),
}

impl From<u8> for ControlResult {
    fn from(code: u8) -> Self {
        match code {
            0x01 => Self::Success,
            0x02 => Self::NotSupported,
            0x03 => Self::InvalidParameter,
            0x04 => Self::Failed,
            0x05 => Self::ControlNotPermitted,
            other => Self::Unknown(other),
        }
    }
}

/// A decoded control-point indication: `[0x80, request op code, result]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlResponse {
    pub request: u8,
    pub result: ControlResult,
}

/// Decode a control-point indication.
///
/// Returns `None` when the payload is not a response frame.
pub fn decode_control_response(bytes: &[u8]) -> Option<ControlResponse> {
    match bytes {
        [OP_CODE_RESPONSE, request, result, ..] => Some(ControlResponse {
            request: *request,
            result: ControlResult::from(*result),
        }),
        _ => None,
    }
}

// ── Firmware versions ────────────────────────────────────────────────────────

/// Lowest software revision that may receive control-point writes.
///
/// Older comm modules reject re-bonding of a previously bonded device, and a
/// control-point write triggers exactly that bond.
pub const MIN_CONTROL_FIRMWARE: &str = "4.2";

/// A dotted numeric software revision such as `"4.10"`.
///
/// Components compare numerically, and missing trailing components count as
/// zero, so `"4.10" > "4.2"` and `"4.2" == "4.2.0"`.
///
/// ```
/// # use rower_link::protocol::FirmwareVersion;
/// let min = FirmwareVersion::parse("4.2").unwrap();
/// assert!(FirmwareVersion::parse("4.10").unwrap() >= min);
/// assert!(FirmwareVersion::parse("3.9").unwrap() < min);
/// assert!(FirmwareVersion::parse("rev").is_none());
/// ```
#[derive(Debug, Clone)]
pub struct FirmwareVersion(Vec<u32>);

impl FirmwareVersion {
    /// Parse a revision string leniently.
    ///
    /// Each dot-separated component contributes its leading digits; parsing
    /// stops at the first component without any.  Trailing NULs and
    /// whitespace, common in GATT string reads, are ignored.  Returns `None`
    /// if not even the first component is numeric.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim_matches(|c: char| c == '\0' || c.is_whitespace());
        let mut parts = Vec::new();
        for component in trimmed.split('.') {
            let digits: String = component.chars().take_while(|c| c.is_ascii_digit()).collect();
            match digits.parse::<u32>() {
                Ok(n) => parts.push(n),
                Err(_) => break,
            }
        }
        if parts.is_empty() {
            None
        } else {
            Some(Self(parts))
        }
    }

    /// Whether this revision is allowed to receive control-point writes.
    pub fn permits_control(&self, minimum: &FirmwareVersion) -> bool {
        self >= minimum
    }
}

impl Ord for FirmwareVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.0.len().max(other.0.len());
        for i in 0..len {
            let a = self.0.get(i).copied().unwrap_or(0);
            let b = other.0.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => continue,
                unequal => return unequal,
            }
        }
        Ordering::Equal
    }
}

impl PartialOrd for FirmwareVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for FirmwareVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for FirmwareVersion {}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|n| n.to_string()).collect();
        f.write_str(&parts.join("."))
    }
}

// ── Timing and thresholds ────────────────────────────────────────────────────

/// How long a session may take to confirm the telemetry subscription.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Re-subscribe to telemetry when no notification arrived for this long.
///
/// Some comm modules silently drop the subscription every other minute.
pub const KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(2);

/// Best-effort wait for the machine to report zeroed counters after a reset.
pub const RESET_TIMEOUT: Duration = Duration::from_secs(3);

/// Battery levels at or below this percentage raise an advisory.
pub const LOW_BATTERY_THRESHOLD: u8 = 25;

/// Level assumed when the proprietary low-battery alert fires.
pub const UNKNOWN_LOW_BATTERY_LEVEL: u8 = 10;

/// Largest elapsed-time step (seconds) trusted verbatim by the clock filter.
pub const MAX_TRUSTED_ELAPSED_DELTA: u16 = 5;
