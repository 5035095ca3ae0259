use proptest::prelude::*;

use maclease::Packet;

const ETHERTYPE: [u8; 2] = [0x33, 0xff];
const HEADER_SIZE: usize = 22;

/// A minimal legal discover frame header with an empty parameter area.
fn valid_header() -> Vec<u8> {
    let mut frame = vec![0u8; HEADER_SIZE];
    frame[12..14].copy_from_slice(&ETHERTYPE);
    frame[14] = 0; // subtype
    frame[15] = 1; // version 0, discover
    frame[21] = 8; // length: protocol header only
    frame
}

/// Rewrites the 12-bit length field to cover `param_bytes` of parameters.
fn fix_length(frame: &mut [u8], param_bytes: usize) {
    let total = 8 + param_bytes;
    frame[20] = (frame[20] & 0xf0) | ((total >> 8) & 0x0f) as u8;
    frame[21] = (total & 0xff) as u8;
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(10000))]

    #[test]
    fn parse_never_panics_on_arbitrary_bytes(data: Vec<u8>) {
        let _ = Packet::parse(&data);
    }

    #[test]
    fn parse_never_panics_on_valid_header_with_random_params(
        params in prop::collection::vec(any::<u8>(), 0..600)
    ) {
        let mut frame = valid_header();
        frame.extend_from_slice(&params);
        fix_length(&mut frame, params.len());
        let _ = Packet::parse(&frame);
    }

    #[test]
    fn parse_never_panics_on_corrupted_header(
        bytes in prop::collection::vec(any::<u8>(), HEADER_SIZE..600),
        indices in prop::collection::vec(0usize..HEADER_SIZE, 1..10),
        values in prop::collection::vec(any::<u8>(), 1..10)
    ) {
        let mut frame = bytes;
        frame[12..14].copy_from_slice(&ETHERTYPE);
        for (index, value) in indices.iter().zip(values.iter()) {
            if *index < frame.len() {
                frame[*index] = *value;
            }
        }
        let _ = Packet::parse(&frame);
    }

    #[test]
    fn parse_never_panics_on_random_param_lengths(
        param_id in any::<u8>(),
        param_len in any::<u8>(),
        body in prop::collection::vec(any::<u8>(), 0..256)
    ) {
        let mut frame = valid_header();
        frame.push(param_id);
        frame.push(param_len);
        frame.extend_from_slice(&body);
        fix_length(&mut frame, body.len() + 2);
        let _ = Packet::parse(&frame);
    }

    #[test]
    fn validate_never_panics_on_parsed_frames(
        params in prop::collection::vec(any::<u8>(), 0..600),
        msg_type in 1u8..8,
        control in any::<u16>()
    ) {
        let mut frame = valid_header();
        frame[15] = msg_type;
        frame[16..18].copy_from_slice(&control.to_be_bytes());
        frame.extend_from_slice(&params);
        fix_length(&mut frame, params.len());
        if let Ok(packet) = Packet::parse(&frame) {
            let _ = packet.validate();
        }
    }
}
