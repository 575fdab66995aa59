//! Decoder for FTMS Rower Data (0x2AD1) notifications.
//!
//! Every public function here is pure apart from the caller-owned
//! [`ElapsedTimeTracker`]; nothing performs I/O or touches timers.
//!
//! # Frame layout
//!
//! ```text
//! bytes 0–1 : flag word (u16 LE)
//! bytes 2.. : optional fields, in ascending flag-bit order
//! ```
//!
//! | Bit | Field | Wire | Effect |
//! |---|---|---|---|
//! | 0 | stroke rate + count (present when bit is **clear**) | u8, u16 | rate = raw / 2, strokes |
//! | 1 | average stroke rate | u8 | skipped |
//! | 2 | total distance | u16 + u8 << 16 | distance |
//! | 3 | instantaneous pace | u16 | speed = 50000 / pace |
//! | 4 | average pace | u16 | skipped |
//! | 5 | instantaneous power | i16 | power |
//! | 6 | average power | i16 | skipped |
//! | 7 | resistance level | i16 | skipped |
//! | 8 | expended energy | u16, u16, u8 | energy = total |
//! | 9 | heart rate | u8 | pulse, when > 0 |
//! | 10 | metabolic equivalent | u8 | skipped |
//! | 11 | elapsed time | u16 | duration, clock-corrected |
//! | 12 | remaining time | u16 | skipped |

use log::{debug, warn};
use thiserror::Error;

use crate::protocol::MAX_TRUSTED_ELAPSED_DELTA;
use crate::types::MeasurementSnapshot;

/// Flag bits of the rower-data flag word.
mod rower_flag {
    pub const MORE_DATA: u16 = 1 << 0;
    pub const AVERAGE_STROKE_RATE: u16 = 1 << 1;
    pub const TOTAL_DISTANCE: u16 = 1 << 2;
    pub const INSTANTANEOUS_PACE: u16 = 1 << 3;
    pub const AVERAGE_PACE: u16 = 1 << 4;
    pub const INSTANTANEOUS_POWER: u16 = 1 << 5;
    pub const AVERAGE_POWER: u16 = 1 << 6;
    pub const RESISTANCE_LEVEL: u16 = 1 << 7;
    pub const EXPENDED_ENERGY: u16 = 1 << 8;
    pub const HEART_RATE: u16 = 1 << 9;
    pub const METABOLIC_EQUIVALENT: u16 = 1 << 10;
    pub const ELAPSED_TIME: u16 = 1 << 11;
    pub const REMAINING_TIME: u16 = 1 << 12;
}

/// A rower-data frame whose flags promise more than its bytes deliver.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("frame of {0} bytes has no flag word")]
    MissingFlags(usize),

    #[error("{field} needs {needed} bytes at offset {offset}, frame has {len}")]
    Truncated {
        field: &'static str,
        offset: usize,
        needed: usize,
        len: usize,
    },
}

// ── Field cursor ──────────────────────────────────────────────────────────────

/// Sequential little-endian reader over the optional-field region.
struct Fields<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Fields<'a> {
    fn new(data: &'a [u8], offset: usize) -> Self {
        Self { data, offset }
    }

    fn take(&mut self, field: &'static str, needed: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.offset + needed;
        if end > self.data.len() {
            return Err(DecodeError::Truncated {
                field,
                offset: self.offset,
                needed,
                len: self.data.len(),
            });
        }
        let bytes = &self.data[self.offset..end];
        self.offset = end;
        Ok(bytes)
    }

    fn u8(&mut self, field: &'static str) -> Result<u8, DecodeError> {
        Ok(self.take(field, 1)?[0])
    }

    fn u16(&mut self, field: &'static str) -> Result<u16, DecodeError> {
        let b = self.take(field, 2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn i16(&mut self, field: &'static str) -> Result<i16, DecodeError> {
        let b = self.take(field, 2)?;
        Ok(i16::from_le_bytes([b[0], b[1]]))
    }
}

// ── Elapsed-time correction ───────────────────────────────────────────────────

/// Filters the device's elapsed-time counter into trustworthy duration steps.
///
/// Rowing comm modules emit a corrupted elapsed time at minute boundaries:
/// 4.x revisions jump forward a minute and come back shortly after, 1.x
/// revisions jump back a minute and never recover.  Instead of trusting the
/// raw value, the tracker remembers the last raw reading and turns each new
/// one into a delta:
///
/// * no change → `0`
/// * negative → `0` (always a firmware error; the new raw value is still
///   tracked, so the counter recovers from a permanent backward jump)
/// * `1..=max_delta` → the delta itself
/// * anything larger → `1`, a single tick
///
/// Because negative deltas are ignored, a device reset cannot be detected
/// from elapsed time reaching zero; reset detection uses the combined
/// counter check in the session instead.
#[derive(Debug, Clone)]
pub struct ElapsedTimeTracker {
    previous: u16,
    max_delta: u16,
}

impl ElapsedTimeTracker {
    pub fn new(max_delta: u16) -> Self {
        Self {
            previous: 0,
            max_delta,
        }
    }

    /// The last raw elapsed time seen.
    pub fn previous(&self) -> u16 {
        self.previous
    }

    /// Seconds to add to the accumulated duration for a new raw reading.
    pub fn delta(&mut self, elapsed: u16) -> u32 {
        if elapsed == self.previous {
            return 0;
        }

        let delta = elapsed as i32 - self.previous as i32;
        self.previous = elapsed;
        debug!("elapsed time {delta:+} = {elapsed}");

        if delta < 0 {
            0
        } else if delta > self.max_delta as i32 {
            1
        } else {
            delta as u32
        }
    }
}

impl Default for ElapsedTimeTracker {
    fn default() -> Self {
        Self::new(MAX_TRUSTED_ELAPSED_DELTA)
    }
}

// ── Rower data ────────────────────────────────────────────────────────────────

/// Result of decoding one rower-data frame.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrame {
    /// The previous snapshot with every successfully decoded field applied.
    pub snapshot: MeasurementSnapshot,
    /// Set when decoding stopped early; fields before the failure are kept.
    pub error: Option<DecodeError>,
}

/// Decode a rower-data notification on top of `previous`.
///
/// While `resetting`, the elapsed time is copied into `duration` verbatim
/// instead of going through `clock`, so convergence to zero is observable.
///
/// A frame whose flags promise more fields than it carries never fails: the
/// decoder stops at the first missing field, logs it, and returns what it has.
pub fn decode_rower_data(
    data: &[u8],
    previous: &MeasurementSnapshot,
    clock: &mut ElapsedTimeTracker,
    resetting: bool,
) -> DecodedFrame {
    let mut snapshot = *previous;
    let error = apply_fields(data, &mut snapshot, clock, resetting).err();
    if let Some(e) = &error {
        warn!("rower data field mismatch: {e} | raw: {data:02x?}");
    }
    DecodedFrame { snapshot, error }
}

fn apply_fields(
    data: &[u8],
    s: &mut MeasurementSnapshot,
    clock: &mut ElapsedTimeTracker,
    resetting: bool,
) -> Result<(), DecodeError> {
    use rower_flag::*;

    if data.len() < 2 {
        return Err(DecodeError::MissingFlags(data.len()));
    }
    let flags = u16::from_le_bytes([data[0], data[1]]);
    let mut fields = Fields::new(data, 2);
    let set = |bit: u16| flags & bit != 0;

    // Inverted polarity: stroke data is present when "more data" is clear.
    if !set(MORE_DATA) {
        let rate = fields.u8("stroke rate")?;
        s.stroke_rate = rate as f32 / 2.0;
        s.strokes = fields.u16("stroke count")?;
    }
    if set(AVERAGE_STROKE_RATE) {
        fields.u8("average stroke rate")?;
    }
    if set(TOTAL_DISTANCE) {
        let low = fields.u16("total distance")? as u32;
        let high = fields.u8("total distance")? as u32;
        s.distance = low | (high << 16);
    }
    if set(INSTANTANEOUS_PACE) {
        let pace = fields.u16("instantaneous pace")?;
        s.speed = if pace == 0 { 0 } else { 500 * 100 / pace as u32 };
    }
    if set(AVERAGE_PACE) {
        fields.u16("average pace")?;
    }
    if set(INSTANTANEOUS_POWER) {
        s.power = fields.i16("instantaneous power")?;
    }
    if set(AVERAGE_POWER) {
        fields.i16("average power")?;
    }
    if set(RESISTANCE_LEVEL) {
        fields.i16("resistance level")?;
    }
    if set(EXPENDED_ENERGY) {
        let total = fields.u16("total energy")?;
        fields.u16("energy per hour")?;
        fields.u8("energy per minute")?;
        s.energy = total;
    }
    if set(HEART_RATE) {
        let pulse = fields.u8("heart rate")?;
        if pulse > 0 {
            s.pulse = pulse;
        }
    }
    if set(METABOLIC_EQUIVALENT) {
        fields.u8("metabolic equivalent")?;
    }
    if set(ELAPSED_TIME) {
        let elapsed = fields.u16("elapsed time")?;
        if resetting {
            s.duration = elapsed as u32;
        } else {
            s.duration += clock.delta(elapsed);
        }
    }
    if set(REMAINING_TIME) {
        fields.u16("remaining time")?;
    }
    Ok(())
}
