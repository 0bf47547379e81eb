//! Binary frame codec for the LG multi-split RS-485 bus.
//!
//! Pure encode/decode, no I/O. One exchange on the bus is an 8-byte write
//! frame answered by a 16-byte response frame:
//!
//! ```text
//! write:    [0x80][0x00][0xA3][group_id][action][mode][set_temp][checksum]
//! response: [0x10][action][rsv][rsv][group_id][rsv][mode][set_temp]
//!           [cur_temp][pipe1][pipe2][outer][rsv][model][fixed][checksum]
//! ```
//!
//! The checksum for both directions is `(sum(preceding bytes) & 0xFF) ^ 0x55`.

use packed_struct::prelude::*;
use thiserror::Error;

use super::values::{Action, FanSpeed, OpMode, Sweep};

/// First byte of every response frame.
pub const RESPONSE_HEAD: u8 = 0x10;

pub const RESPONSE_FRAME_SIZE: usize = 16;
pub const WRITE_FRAME_SIZE: usize = 8;

/// Magic prefix of every write frame.
pub const WRITE_HEADER_MAGIC: [u8; 3] = [0x80, 0x00, 0xa3];

/// Set-temperature byte sent when the target is outside the unit's
/// settable 19-30 degree range.
const SET_TEMP_SENTINEL: u8 = 10;

#[derive(Error, Debug)]
pub enum FramingError {
    #[error("frame length mismatch (expected {expected}, actual {actual})")]
    WrongLength { expected: usize, actual: usize },
    #[error("invalid checksum (expected {expected:#04x}, actual {actual:#04x})")]
    InvalidChecksum { expected: u8, actual: u8 },
    #[error(transparent)]
    Packing(#[from] packed_struct::PackingError),
}

pub trait Checksum {
    fn checksum(&mut self) -> u8;
}

impl<'a> Checksum for std::slice::Iter<'a, u8> {
    fn checksum(&mut self) -> u8 {
        let sum = self.fold(0u32, |acc, byte| acc + u32::from(*byte));
        (sum & 0xff) as u8 ^ 0x55
    }
}

/// Check the trailing checksum byte of a full frame (either direction).
pub fn verify_checksum(frame: &[u8]) -> bool {
    match frame.split_last() {
        Some((checksum, body)) => body.iter().checksum() == *checksum,
        None => false,
    }
}

/// 16-byte status frame returned by an indoor unit.
#[derive(PackedStruct, Clone, Copy, Debug, Default)]
#[packed_struct(bit_numbering = "msb0")]
pub struct ResponseFrame {
    #[packed_field(bytes = "0")]
    pub head: u8,
    #[packed_field(bytes = "1")]
    pub action: u8,
    #[packed_field(bytes = "2")]
    pub unknown1: u8,
    #[packed_field(bytes = "3")]
    pub unknown2: u8,
    #[packed_field(bytes = "4")]
    pub group_id: u8,
    #[packed_field(bytes = "5")]
    pub unknown3: u8,
    #[packed_field(bytes = "6")]
    pub mode: u8,
    #[packed_field(bytes = "7")]
    pub set_temp: u8,
    #[packed_field(bytes = "8")]
    pub current_temp: u8,
    #[packed_field(bytes = "9")]
    pub pipe1_temp: u8,
    #[packed_field(bytes = "10")]
    pub pipe2_temp: u8,
    #[packed_field(bytes = "11")]
    pub outer_sensor: u8,
    #[packed_field(bytes = "12")]
    pub unknown4: u8,
    #[packed_field(bytes = "13")]
    pub model: u8,
    #[packed_field(bytes = "14")]
    pub fixed_value: u8,
    #[packed_field(bytes = "15")]
    pub checksum: u8,
}

/// 8-byte command frame sent to an indoor unit.
#[derive(PackedStruct, Clone, Copy, Debug, Default)]
#[packed_struct(bit_numbering = "msb0")]
pub struct WriteFrame {
    #[packed_field(bytes = "0..=2")]
    pub magic: [u8; 3],
    #[packed_field(bytes = "3")]
    pub group_id: u8,
    #[packed_field(bytes = "4")]
    pub action: u8,
    #[packed_field(bytes = "5")]
    pub mode: u8,
    #[packed_field(bytes = "6")]
    pub set_temp: u8,
    #[packed_field(bytes = "7")]
    pub checksum: u8,
}

/// Fields of a decoded response frame, mapped to symbolic values and
/// physical temperatures.
#[derive(Clone, Debug, PartialEq)]
pub struct DecodedStatus {
    pub group_id: u8,
    pub action: Action,
    /// `None` when the mode bits carry a value outside the known table;
    /// discovery treats that as an implausible reply.
    pub opmode: Option<OpMode>,
    pub sweep: Sweep,
    pub fan_speed: FanSpeed,
    /// Target temperature in degrees, recovered from the low nibble.
    pub set_temp: u8,
    /// Room temperature with the process-wide calibration offset applied.
    pub current_temp: f64,
    pub pipe1_temp: f64,
    pub pipe2_temp: f64,
}

/// Temperature bytes count down in quarter degrees from 54.0.
fn calc_temp(raw: u8) -> f64 {
    ((54.0 - f64::from(raw) / 4.0) * 100.0).round() / 100.0
}

/// Decode a 16-byte response frame. Does not check the checksum; the read
/// path verifies the window before handing it here.
pub fn decode(raw: &[u8], calibration: f64) -> Result<DecodedStatus, FramingError> {
    let bytes: &[u8; RESPONSE_FRAME_SIZE] =
        raw.try_into().map_err(|_| FramingError::WrongLength {
            expected: RESPONSE_FRAME_SIZE,
            actual: raw.len(),
        })?;

    let frame = ResponseFrame::unpack(bytes)?;

    Ok(DecodedStatus {
        group_id: frame.group_id,
        action: Action::from_code(frame.action).unwrap_or(Action::Status),
        opmode: OpMode::from_code(frame.mode & 0x07),
        sweep: if frame.mode & 0x08 != 0 {
            Sweep::Swing
        } else {
            Sweep::Fixed
        },
        fan_speed: FanSpeed::from_code((frame.mode >> 4) & 0x07).unwrap_or(FanSpeed::Low),
        set_temp: (frame.set_temp & 0x0f) + 0x0f,
        current_temp: calc_temp(frame.current_temp) + calibration,
        pipe1_temp: calc_temp(frame.pipe1_temp),
        pipe2_temp: calc_temp(frame.pipe2_temp),
    })
}

/// Build an 8-byte write frame, checksum included.
///
/// Symbols the caller leaves unset encode as 0, matching the bus's "no
/// request" value for those fields.
pub fn encode(
    group: u8,
    id: u8,
    action: Option<Action>,
    opmode: Option<OpMode>,
    sweep: Sweep,
    fan_speed: Option<FanSpeed>,
    target_temp: u8,
) -> Result<[u8; WRITE_FRAME_SIZE], FramingError> {
    let mut mode = opmode.map(OpMode::code).unwrap_or(0);
    if sweep == Sweep::Swing {
        mode |= 0x08;
    }
    mode |= (fan_speed.map(FanSpeed::code).unwrap_or(0) << 4) & 0xf0;

    let frame = WriteFrame {
        magic: WRITE_HEADER_MAGIC,
        group_id: (group << 4) | (id & 0x0f),
        action: action.map(Action::code).unwrap_or(0),
        mode,
        set_temp: if target_temp > 18 && target_temp <= 30 {
            target_temp - 0x0f
        } else {
            SET_TEMP_SENTINEL
        },
        checksum: 0,
    };

    let mut packet = frame.pack()?;
    packet[WRITE_FRAME_SIZE - 1] = packet[..WRITE_FRAME_SIZE - 1].iter().checksum();
    Ok(packet)
}

/// Build a checksum-valid response frame from the meaningful fields.
#[cfg(test)]
pub(crate) fn response_bytes(
    action: u8,
    group_id: u8,
    mode: u8,
    set_temp: u8,
    current_temp: u8,
) -> [u8; RESPONSE_FRAME_SIZE] {
    let mut raw = [0u8; RESPONSE_FRAME_SIZE];
    raw[0] = RESPONSE_HEAD;
    raw[1] = action;
    raw[4] = group_id;
    raw[6] = mode;
    raw[7] = set_temp;
    raw[8] = current_temp;
    raw[9] = 0x68; // pipe temps around 28 degrees
    raw[10] = 0x68;
    raw[15] = raw[..15].iter().checksum();
    raw
}
