use std::fmt;

/// The normalized workout metrics decoded from rower-data frames.
///
/// Fields are replaced one by one as the corresponding optional field appears
/// in a frame; a field missing from a frame keeps its previous value.
///
/// | Field | Unit | Source |
/// |---|---|---|
/// | `distance` | m | total distance (24-bit) |
/// | `duration` | s | elapsed time, clock-corrected |
/// | `strokes` | count | stroke count |
/// | `stroke_rate` | strokes/min, 0.5 resolution | stroke rate |
/// | `speed` | cm/s | derived from instantaneous pace |
/// | `power` | W | instantaneous power |
/// | `pulse` | bpm | heart rate (only when > 0) |
/// | `energy` | kcal | total energy |
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MeasurementSnapshot {
    pub distance: u32,
    pub duration: u32,
    pub strokes: u16,
    pub stroke_rate: f32,
    /// Speed in centimetres per second: `500 * 100 / pace` where pace is the
    /// time in seconds per 500 m.  Zero while the machine reports no pace.
    pub speed: u32,
    pub power: i16,
    pub pulse: u8,
    pub energy: u16,
}

impl MeasurementSnapshot {
    /// Sum of the counters a machine zeroes on reset.
    ///
    /// Exactly zero once the reset has taken effect on the device.
    pub fn reset_sum(&self) -> u64 {
        self.distance as u64 + self.duration as u64 + self.energy as u64 + self.strokes as u64
    }
}

/// A user-visible warning.
///
/// These are advisory only: the connection state is signalled separately by
/// [`RowerEvent::Connected`] and [`RowerEvent::Disconnected`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advisory {
    /// The OS permission required for scanning was denied.
    PermissionDenied,
    /// Location services must be enabled before the platform allows scanning.
    LocationServicesDisabled,
    /// No Bluetooth adapter is present.
    NoRadio,
    /// The radio is off and has been asked to turn on.
    RadioDisabled,
    /// The device connected but does not expose rower data.
    DeviceNotFound(String),
    /// No session could be established within the connect timeout.
    ConnectionFailed(String),
    /// The link to the device dropped while the radio was still on.
    DeviceDisconnected(String),
    /// The machine did not confirm zeroed counters after a reset.
    ResetTimeout,
    /// Battery at or below the warning threshold, in percent.
    LowBattery(u8),
}

impl fmt::Display for Advisory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PermissionDenied => f.write_str("Bluetooth permission denied"),
            Self::LocationServicesDisabled => {
                f.write_str("Location services are required to find the rower")
            }
            Self::NoRadio => f.write_str("No Bluetooth adapter found"),
            Self::RadioDisabled => f.write_str("Bluetooth is off, waiting for it to turn on"),
            Self::DeviceNotFound(address) => write!(f, "No rower found at {address}"),
            Self::ConnectionFailed(address) => write!(f, "Connection to {address} failed"),
            Self::DeviceDisconnected(address) => write!(f, "Rower {address} disconnected"),
            Self::ResetTimeout => f.write_str("Rower did not confirm the reset"),
            Self::LowBattery(level) => write!(f, "Rower battery low ({level}%)"),
        }
    }
}

/// All events emitted to the consumer of a [`crate::rower_client::RowerClient`].
///
/// `Connected` and `Disconnected` are the only connection-state signals; the
/// internal negotiation phases are never exposed.
#[derive(Debug, Clone, PartialEq)]
pub enum RowerEvent {
    /// Telemetry notifications are subscribed; measurements will follow.
    Connected,
    /// The connection attempt was abandoned or an established session was
    /// lost.  The client is idle again and [`crate::rower_client::RowerHandle::open`]
    /// may be called to start over.
    Disconnected,
    /// One decoded, non-discarded telemetry frame.
    Measurement(MeasurementSnapshot),
    /// A warning worth showing to the user.
    Advisory(Advisory),
    /// A battery level read from the device, in percent.
    BatteryLevel(u8),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_sum_ignores_rates() {
        let snapshot = MeasurementSnapshot {
            stroke_rate: 24.5,
            speed: 400,
            power: 180,
            pulse: 140,
            ..Default::default()
        };
        assert_eq!(snapshot.reset_sum(), 0);

        let snapshot = MeasurementSnapshot {
            distance: 1,
            ..Default::default()
        };
        assert_eq!(snapshot.reset_sum(), 1);
    }

    #[test]
    fn advisory_display() {
        assert_eq!(
            Advisory::LowBattery(10).to_string(),
            "Rower battery low (10%)"
        );
        assert_eq!(
            Advisory::DeviceNotFound("AA:BB".into()).to_string(),
            "No rower found at AA:BB"
        );
    }
}
