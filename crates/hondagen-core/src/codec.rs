use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("malformed frame")]
    Malformed,
    #[error("unsupported frame kind")]
    UnsupportedFrameKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    EngineStop,
    EngineStart,
    EcoOn,
    EcoOff,
}

// ---------------------------------------------------------------------------
// Poll architecture: ASCII-framed diagnostic register reads
// ---------------------------------------------------------------------------

/// One diagnostic register address: a bank letter plus a two-character
/// position, both sent as ASCII.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Register {
    pub bank: u8,
    pub position: [u8; 2],
}

impl Register {
    pub const fn new(bank: u8, position: [u8; 2]) -> Self {
        Self { bank, position }
    }
}

pub mod registers {
    use super::Register;

    pub const RUNTIME_HOURS_HI: Register = Register::new(b'B', *b"00");
    pub const RUNTIME_HOURS_LO: Register = Register::new(b'B', *b"01");
    pub const CURRENT_HI: Register = Register::new(b'B', *b"13");
    pub const CURRENT_LO: Register = Register::new(b'B', *b"14");
    pub const POWER_HI: Register = Register::new(b'B', *b"17");
    pub const POWER_LO: Register = Register::new(b'B', *b"18");
    pub const ECO_MODE: Register = Register::new(b'B', *b"19");
    pub const FUEL_LEVEL: Register = Register::new(b'B', *b"40");
    pub const FUEL_REMAINING_HI: Register = Register::new(b'B', *b"41");
    pub const FUEL_REMAINING_LO: Register = Register::new(b'B', *b"42");
    pub const WARNINGS: Register = Register::new(b'C', *b"10");
    pub const FAULTS_HI: Register = Register::new(b'D', *b"10");
    pub const FAULTS_LO: Register = Register::new(b'D', *b"11");
}

fn hex_nibble(value: u8) -> u8 {
    match value {
        0..=9 => b'0' + value,
        _ => b'A' + (value - 10),
    }
}

fn parse_hex_byte(hi: u8, lo: u8) -> Result<u8, CodecError> {
    let digit = |c: u8| -> Result<u8, CodecError> {
        match c {
            b'0'..=b'9' => Ok(c - b'0'),
            b'A'..=b'F' => Ok(c - b'A' + 10),
            b'a'..=b'f' => Ok(c - b'a' + 10),
            _ => Err(CodecError::Malformed),
        }
    };
    Ok((digit(hi)? << 4) | digit(lo)?)
}

fn frame_checksum(frame: &[u8]) -> (u8, u8) {
    let mut cksum = 0u8;
    for b in &frame[1..7] {
        cksum ^= b;
    }
    (hex_nibble(cksum >> 4), hex_nibble(cksum & 0x0F))
}

/// Build a 10-byte diagnostic read request:
/// `[0x01, 'B', bank, p0, p1, '0', '0', ckHi, ckLo, 0x04]` where the
/// checksum is the XOR of bytes 1..=6 rendered as two ASCII hex digits.
pub fn encode_diagnostic_request(reg: Register) -> [u8; 10] {
    let mut frame = [
        0x01,
        0x42,
        reg.bank,
        reg.position[0],
        reg.position[1],
        0x30,
        0x30,
        0x00,
        0x00,
        0x04,
    ];
    let (hi, lo) = frame_checksum(&frame);
    frame[7] = hi;
    frame[8] = lo;
    frame
}

/// Decode a diagnostic response notification. The first byte of the raw
/// payload is framing and skipped; the remainder mirrors the request
/// layout with the data value in the two ASCII hex chars at 5..7.
pub fn decode_diagnostic_response(raw: &[u8]) -> Result<(Register, u8), CodecError> {
    if raw.len() < 11 {
        return Err(CodecError::Malformed);
    }
    let frame = &raw[1..];
    let (hi, lo) = frame_checksum(frame);
    if frame[7] != hi || frame[8] != lo {
        return Err(CodecError::Malformed);
    }
    let reg = Register::new(frame[2], [frame[3], frame[4]]);
    let value = parse_hex_byte(frame[5], frame[6])?;
    Ok((reg, value))
}

// Sanity bounds from the field protocol notes; readings outside them are
// corrupted transfers, dropped rather than surfaced.
const BOUNDS_RUNTIME_HOURS: (f64, f64) = (0.0, 100_000.0);
const BOUNDS_CURRENT: (f64, f64) = (0.0, 50.0);
const BOUNDS_POWER: (f64, f64) = (0.0, 10_000.0);
const MAX_FUEL_LEVEL: u8 = 100;
const MAX_FUEL_REMAINING_MIN: u16 = 1440;

fn in_bounds(value: f64, bounds: (f64, f64)) -> Option<f64> {
    (bounds.0 <= value && value <= bounds.1).then_some(value)
}

/// Engineering-unit conversions for register pairs. This is the single
/// scaling point; everything downstream works in hours/amps/VA.
pub fn runtime_hours(hi: u8, lo: u8) -> Option<f64> {
    in_bounds(i16::from_be_bytes([hi, lo]) as f64, BOUNDS_RUNTIME_HOURS)
}

pub fn output_current(hi: u8, lo: u8) -> Option<f64> {
    in_bounds(i16::from_be_bytes([hi, lo]) as f64 / 10.0, BOUNDS_CURRENT)
}

pub fn output_power(hi: u8, lo: u8) -> Option<f64> {
    in_bounds(i16::from_be_bytes([hi, lo]) as f64 * 10.0, BOUNDS_POWER)
}

/// ECO register: bit 0 clear means ECO is on.
pub fn eco_mode(value: u8) -> bool {
    value & 1 == 0
}

pub fn fuel_level(value: u8) -> Option<u8> {
    (value <= MAX_FUEL_LEVEL).then_some(value)
}

pub fn fuel_remaining_minutes(hi: u8, lo: u8) -> Option<u16> {
    let value = u16::from_be_bytes([hi, lo]);
    (value <= MAX_FUEL_REMAINING_MIN).then_some(value)
}

/// Engine status characteristic: event, running, error, voltage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStatus {
    pub event: u8,
    pub running: bool,
    pub error: u8,
    pub voltage: u8,
}

pub fn decode_engine_status(raw: &[u8]) -> Result<EngineStatus, CodecError> {
    if raw.len() < 4 {
        return Err(CodecError::Malformed);
    }
    Ok(EngineStatus {
        event: raw[0],
        running: raw[1] != 0,
        error: raw[2],
        voltage: raw[3],
    })
}

/// Firmware version is BCD: four nibbles, one dotted component each.
pub fn decode_firmware_bcd(raw: &[u8]) -> Result<String, CodecError> {
    if raw.len() < 2 {
        return Err(CodecError::Malformed);
    }
    let nibbles = [raw[0] >> 4, raw[0] & 0x0F, raw[1] >> 4, raw[1] & 0x0F];
    Ok(nibbles.map(|n| n.to_string()).join("."))
}

/// Serial characteristic: ASCII with null padding, space-delimited.
pub fn decode_serial(raw: &[u8]) -> Result<String, CodecError> {
    let text = std::str::from_utf8(raw).map_err(|_| CodecError::Malformed)?;
    let serial = text.trim_end_matches('\0').split(' ').next().unwrap_or("");
    if serial.is_empty() {
        return Err(CodecError::Malformed);
    }
    Ok(serial.to_string())
}

// ---------------------------------------------------------------------------
// Push architecture: CAN frames over one notify characteristic
// ---------------------------------------------------------------------------

pub mod can {
    pub const ECU_STATUS: u16 = 0x312;
    pub const INV_INFO: u16 = 0x332;
    pub const INV_INFO2: u16 = 0x352;
    pub const ECU_INFO_ETC: u16 = 0x362;
    pub const OUTPUT_SETTING: u16 = 0x5D2;
    pub const ECU_ERROR: u16 = 0x3A2;
    pub const INV_ERROR: u16 = 0x3B2;
    pub const BT_ERROR: u16 = 0x3A5;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanFrame {
    pub id: u16,
    pub payload: Vec<u8>,
}

/// Push frame layout: `[packet_type, id_lo, id_hi, payload…]`. Only
/// packet type 0x01 carries CAN data.
pub fn decode_push_frame(raw: &[u8]) -> Result<CanFrame, CodecError> {
    if raw.len() < 3 {
        return Err(CodecError::Malformed);
    }
    if raw[0] != 0x01 {
        return Err(CodecError::UnsupportedFrameKind);
    }
    Ok(CanFrame {
        id: u16::from_le_bytes([raw[1], raw[2]]),
        payload: raw[3..].to_vec(),
    })
}

fn u16_le(payload: &[u8], at: usize) -> Result<u16, CodecError> {
    payload
        .get(at..at + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .ok_or(CodecError::Malformed)
}

fn error_bits(payload: &[u8]) -> Vec<u8> {
    let mut bits = Vec::new();
    for (byte_idx, byte) in payload.iter().enumerate() {
        for bit_idx in 0..8 {
            if byte & (1 << bit_idx) != 0 {
                bits.push((byte_idx * 8 + bit_idx) as u8);
            }
        }
    }
    bits
}

const SEEN_ECU_STATUS: u8 = 1 << 0;
const SEEN_INV_INFO: u8 = 1 << 1;
const SEEN_INV_INFO2: u8 = 1 << 2;
const SEEN_ALL_REQUIRED: u8 = SEEN_ECU_STATUS | SEEN_INV_INFO | SEEN_INV_INFO2;

/// Merges the partial CAN frames into one reading. The stream partitions
/// fields across frame kinds; a snapshot is complete only once all
/// required kinds have been seen since the last emission. Field values
/// persist across cycles, so optional frames enrich the next emission
/// without being required for it.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    seen: u8,
    pub engine_mode: u8,
    pub eco_mode: bool,
    pub power_watts: u16,
    pub voltage: u16,
    pub current_amps: f64,
    pub runtime_hours: u16,
    pub fuel_ml: u16,
    pub fuel_remaining_min: u16,
    pub fuel_gauge_level: u8,
    pub voltage_setting: u16,
    pub ecu_errors: Vec<u8>,
    pub inv_errors: Vec<u8>,
    pub bt_errors: Vec<u8>,
}

impl StreamAccumulator {
    /// Fold one frame in. A malformed payload leaves prior state intact.
    pub fn apply(&mut self, frame: &CanFrame) -> Result<(), CodecError> {
        let p = &frame.payload;
        match frame.id {
            can::ECU_STATUS => {
                if p.len() < 3 {
                    return Err(CodecError::Malformed);
                }
                self.engine_mode = p[0];
                // ECO is active when the status byte is 0 or 2.
                self.eco_mode = matches!(p[2], 0 | 2);
                self.seen |= SEEN_ECU_STATUS;
            }
            can::INV_INFO => {
                let power = u16_le(p, 0)?;
                let voltage = u16_le(p, 2)?;
                let raw_current = u16_le(p, 4)?;
                self.power_watts = power;
                self.voltage = voltage;
                // Fixed-point: 1/500 A per count.
                self.current_amps = raw_current as f64 / 500.0;
                self.seen |= SEEN_INV_INFO;
            }
            can::INV_INFO2 => {
                self.runtime_hours = u16_le(p, 4)?;
                self.seen |= SEEN_INV_INFO2;
            }
            can::ECU_INFO_ETC => {
                let fuel_ml = u16_le(p, 0)?;
                let remaining = u16_le(p, 2)?;
                let gauge = *p.get(5).ok_or(CodecError::Malformed)?;
                self.fuel_ml = fuel_ml;
                self.fuel_remaining_min = remaining;
                self.fuel_gauge_level = gauge;
            }
            can::OUTPUT_SETTING => {
                let code = *p.first().ok_or(CodecError::Malformed)?;
                self.voltage_setting = voltage_setting(code);
            }
            can::ECU_ERROR => self.ecu_errors = error_bits(p),
            can::INV_ERROR => self.inv_errors = error_bits(p),
            can::BT_ERROR => self.bt_errors = error_bits(p),
            _ => return Err(CodecError::UnsupportedFrameKind),
        }
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.seen & SEEN_ALL_REQUIRED == SEEN_ALL_REQUIRED
    }

    /// Start the next accumulation cycle, keeping last known values.
    pub fn reset_cycle(&mut self) {
        self.seen = 0;
    }
}

/// Output-voltage selector positions for the push models.
pub fn voltage_setting(code: u8) -> u16 {
    match code {
        1 => 100,
        2 => 110,
        3 => 115,
        4 => 120,
        5 => 220,
        6 => 230,
        7 => 240,
        _ => 0,
    }
}

// ---------------------------------------------------------------------------
// Control writes
// ---------------------------------------------------------------------------

pub const FUNC_ECO_ON: u16 = 0x1027;
pub const FUNC_ECO_OFF: u16 = 0x1028;
pub const FUNC_ENGINE_STOP: u16 = 0x0402;

/// Single-byte engine control for the remote-control characteristic.
pub fn encode_engine_control(start: bool) -> [u8; 1] {
    [if start { 0x01 } else { 0x00 }]
}

/// 14-byte function packet for the generator-data request characteristic:
/// `[0x01, func_hi, func_lo, 0…]`.
pub fn encode_function_command(func: u16) -> [u8; 14] {
    let mut packet = [0u8; 14];
    packet[0] = 0x01;
    packet[1] = (func >> 8) as u8;
    packet[2] = (func & 0xFF) as u8;
    packet
}

/// Stream control: `[0x03, 0x01, 0…]` starts the CAN stream,
/// `[0x04, 0x00, 0…]` stops it.
pub fn encode_stream_control(start: bool) -> [u8; 14] {
    let mut packet = [0u8; 14];
    if start {
        packet[0] = 0x03;
        packet[1] = 0x01;
    } else {
        packet[0] = 0x04;
    }
    packet
}

#[cfg(test)]
#[path = "codec_tests.rs"]
mod codec_tests;
