use super::*;

fn poll_response(bank: u8, pos: [u8; 2], value: [u8; 2]) -> Vec<u8> {
    let mut frame = vec![
        0x01, 0x42, bank, pos[0], pos[1], value[0], value[1], 0x00, 0x00, 0x04,
    ];
    let (hi, lo) = {
        let mut cksum = 0u8;
        for b in &frame[1..7] {
            cksum ^= b;
        }
        (
            super::hex_nibble(cksum >> 4),
            super::hex_nibble(cksum & 0x0F),
        )
    };
    frame[7] = hi;
    frame[8] = lo;
    // Notifications carry one leading framing byte.
    let mut raw = vec![0x10];
    raw.extend(frame);
    raw
}

#[test]
fn diagnostic_request_layout_and_checksum() {
    let frame = encode_diagnostic_request(registers::RUNTIME_HOURS_HI);
    assert_eq!(
        frame,
        [0x01, 0x42, b'B', b'0', b'0', 0x30, 0x30, b'0', b'0', 0x04]
    );

    let frame = encode_diagnostic_request(registers::FUEL_LEVEL);
    // XOR of [0x42, 'B', '4', '0', '0', '0'] is 0x04.
    assert_eq!(frame[7], b'0');
    assert_eq!(frame[8], b'4');
}

#[test]
fn diagnostic_response_roundtrip() {
    let raw = poll_response(b'B', *b"00", *b"2A");
    let (reg, value) = decode_diagnostic_response(&raw).unwrap();
    assert_eq!(reg, registers::RUNTIME_HOURS_HI);
    assert_eq!(value, 0x2A);
}

#[test]
fn diagnostic_response_rejects_bad_checksum() {
    let mut raw = poll_response(b'B', *b"00", *b"2A");
    raw[8] ^= 0x01;
    assert_eq!(
        decode_diagnostic_response(&raw),
        Err(CodecError::Malformed)
    );
}

#[test]
fn diagnostic_response_rejects_short_frame() {
    assert_eq!(
        decode_diagnostic_response(&[0x10, 0x01, 0x42]),
        Err(CodecError::Malformed)
    );
}

#[test]
fn diagnostic_response_rejects_non_hex_value() {
    let mut raw = poll_response(b'B', *b"00", *b"2A");
    raw[6] = b'G';
    // Recompute the checksum so only the hex parse fails.
    let mut cksum = 0u8;
    for b in &raw[2..8] {
        cksum ^= b;
    }
    raw[8] = super::hex_nibble(cksum >> 4);
    raw[9] = super::hex_nibble(cksum & 0x0F);
    assert_eq!(
        decode_diagnostic_response(&raw),
        Err(CodecError::Malformed)
    );
}

#[test]
fn register_scalings() {
    assert_eq!(runtime_hours(0x00, 0x2A), Some(42.0));
    assert_eq!(output_current(0x00, 0x7B), Some(12.3));
    assert_eq!(output_power(0x00, 0x64), Some(1000.0));
    assert_eq!(fuel_level(55), Some(55));
    assert_eq!(fuel_remaining_minutes(0x01, 0x2C), Some(300));
}

#[test]
fn out_of_bounds_readings_are_dropped() {
    // Negative hour meter, over-range current/power, impossible fuel.
    assert_eq!(runtime_hours(0x80, 0x00), None);
    assert_eq!(output_current(0x02, 0x00), None);
    assert_eq!(output_power(0x04, 0x00), None);
    assert_eq!(fuel_level(101), None);
    assert_eq!(fuel_remaining_minutes(0x05, 0xA1), None);
}

#[test]
fn eco_register_is_inverted_bit_zero() {
    assert!(eco_mode(0x00));
    assert!(!eco_mode(0x01));
    assert!(eco_mode(0x02));
}

#[test]
fn engine_status_decodes_four_bytes() {
    let status = decode_engine_status(&[0x01, 0x01, 0x00, 0x78]).unwrap();
    assert_eq!(status.event, 1);
    assert!(status.running);
    assert_eq!(status.error, 0);
    assert_eq!(status.voltage, 120);

    assert_eq!(
        decode_engine_status(&[0x01, 0x01]),
        Err(CodecError::Malformed)
    );
}

#[test]
fn firmware_version_is_dotted_bcd() {
    assert_eq!(decode_firmware_bcd(&[0x12, 0x34]).unwrap(), "1.2.3.4");
    assert_eq!(decode_firmware_bcd(&[0x10]), Err(CodecError::Malformed));
}

#[test]
fn serial_strips_padding_and_suffix() {
    assert_eq!(
        decode_serial(b"EBKJ-1012527 01\0\0\0").unwrap(),
        "EBKJ-1012527"
    );
    assert_eq!(decode_serial(b"\0\0"), Err(CodecError::Malformed));
}

#[test]
fn push_frame_header_parsing() {
    let frame = decode_push_frame(&[0x01, 0x12, 0x03, 0xAA, 0xBB]).unwrap();
    assert_eq!(frame.id, can::ECU_STATUS);
    assert_eq!(frame.payload, vec![0xAA, 0xBB]);

    assert_eq!(
        decode_push_frame(&[0x02, 0x12, 0x03]),
        Err(CodecError::UnsupportedFrameKind)
    );
    assert_eq!(decode_push_frame(&[0x01, 0x12]), Err(CodecError::Malformed));
}

fn can_frame(id: u16, payload: &[u8]) -> CanFrame {
    CanFrame {
        id,
        payload: payload.to_vec(),
    }
}

#[test]
fn accumulator_requires_all_three_core_kinds() {
    let mut acc = StreamAccumulator::default();
    acc.apply(&can_frame(can::ECU_STATUS, &[0x01, 0x00, 0x02]))
        .unwrap();
    acc.apply(&can_frame(
        can::INV_INFO,
        &[0xE8, 0x03, 0x78, 0x00, 0xC4, 0x09],
    ))
    .unwrap();
    assert!(!acc.is_complete());

    acc.apply(&can_frame(
        can::INV_INFO2,
        &[0x00, 0x00, 0x00, 0x00, 0x2A, 0x00],
    ))
    .unwrap();
    assert!(acc.is_complete());

    assert_eq!(acc.engine_mode, 1);
    assert!(acc.eco_mode);
    assert_eq!(acc.power_watts, 1000);
    assert_eq!(acc.voltage, 120);
    assert!((acc.current_amps - 5.0).abs() < 1e-9);
    assert_eq!(acc.runtime_hours, 42);
}

#[test]
fn accumulator_keeps_values_across_cycles() {
    let mut acc = StreamAccumulator::default();
    acc.apply(&can_frame(
        can::INV_INFO,
        &[0xE8, 0x03, 0x78, 0x00, 0xC4, 0x09],
    ))
    .unwrap();
    acc.reset_cycle();
    assert!(!acc.is_complete());
    assert_eq!(acc.power_watts, 1000);
}

#[test]
fn accumulator_rejects_short_payload_without_state_change() {
    let mut acc = StreamAccumulator::default();
    acc.apply(&can_frame(
        can::INV_INFO,
        &[0xE8, 0x03, 0x78, 0x00, 0xC4, 0x09],
    ))
    .unwrap();
    assert_eq!(
        acc.apply(&can_frame(can::INV_INFO, &[0x01, 0x02])),
        Err(CodecError::Malformed)
    );
    assert_eq!(acc.power_watts, 1000);
}

#[test]
fn accumulator_optional_frames() {
    let mut acc = StreamAccumulator::default();
    acc.apply(&can_frame(
        can::ECU_INFO_ETC,
        &[0x10, 0x0E, 0x2C, 0x01, 0x00, 0x03],
    ))
    .unwrap();
    assert_eq!(acc.fuel_ml, 3600);
    assert_eq!(acc.fuel_remaining_min, 300);
    assert_eq!(acc.fuel_gauge_level, 3);

    acc.apply(&can_frame(can::OUTPUT_SETTING, &[0x06])).unwrap();
    assert_eq!(acc.voltage_setting, 230);

    acc.apply(&can_frame(can::ECU_ERROR, &[0b0000_0101, 0b0000_0001]))
        .unwrap();
    assert_eq!(acc.ecu_errors, vec![0, 2, 8]);

    assert!(!acc.is_complete());
}

#[test]
fn accumulator_drops_unknown_ids() {
    let mut acc = StreamAccumulator::default();
    assert_eq!(
        acc.apply(&can_frame(0x7FF, &[0x00])),
        Err(CodecError::UnsupportedFrameKind)
    );
}

#[test]
fn control_packet_layouts() {
    assert_eq!(encode_engine_control(true), [0x01]);
    assert_eq!(encode_engine_control(false), [0x00]);

    let eco_on = encode_function_command(FUNC_ECO_ON);
    assert_eq!(&eco_on[..3], &[0x01, 0x10, 0x27]);
    assert!(eco_on[3..].iter().all(|b| *b == 0));

    let start = encode_stream_control(true);
    assert_eq!(&start[..2], &[0x03, 0x01]);
    let stop = encode_stream_control(false);
    assert_eq!(&stop[..2], &[0x04, 0x00]);
    assert_eq!(stop.len(), 14);
}
