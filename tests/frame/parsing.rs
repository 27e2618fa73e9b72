//! Tests for frame header parsing and control body decoding

use spdy_session::{flags, Control, Error, Frame, FrameType, RstStatus, Setting, DEFAULT_MAX_FRAME_SIZE};

#[test]
fn test_data_frame_clears_control_bit_from_stream_id() {
    // high bit of byte 0 is the control bit; a data frame never has it
    let bytes = [0x7F, 0xFF, 0xFF, 0xFF, 0, 0, 0, 0];
    let frame = Frame::from_bytes(&bytes, DEFAULT_MAX_FRAME_SIZE).unwrap();
    assert_eq!(frame.frame_type(), FrameType::Data);
    assert_eq!(frame.stream_id(), 0x7FFF_FFFF);
    assert_eq!(frame.body_len(), 0);
}

#[test]
fn test_length_plus_header_equals_end() {
    let mut bytes = vec![0, 0, 0, 3, 0, 0, 1, 0];
    bytes.extend_from_slice(&[9u8; 256]);
    let frame = Frame::from_bytes(&bytes, DEFAULT_MAX_FRAME_SIZE).unwrap();
    assert_eq!(frame.end(), 256 + 8);
    assert_eq!(frame.remaining(), 256);
}

#[test]
fn test_truncated_body_rejected() {
    let bytes = [0, 0, 0, 1, 0, 0, 0, 10, 1, 2, 3];
    assert!(matches!(
        Frame::from_bytes(&bytes, DEFAULT_MAX_FRAME_SIZE),
        Err(Error::Malformed { .. })
    ));
}

#[test]
fn test_short_header_rejected() {
    assert!(Frame::from_bytes(&[0x80, 2, 0], DEFAULT_MAX_FRAME_SIZE).is_err());
}

#[test]
fn test_frame_at_exact_max_size_accepted() {
    let mut bytes = vec![0, 0, 0, 1, 0, 0, 0, 56];
    bytes.extend_from_slice(&[0u8; 56]);
    assert!(Frame::from_bytes(&bytes, 64).is_ok());
    assert!(matches!(
        Frame::from_bytes(&bytes, 63),
        Err(Error::FrameTooLarge { size: 64, max: 63 })
    ));
}

#[test]
fn test_rst_stream_decodes_status() {
    let bytes = [0x80, 2, 0, 3, 0, 0, 0, 8, 0, 0, 0, 5, 0, 0, 0, 3];
    let mut frame = Frame::from_bytes(&bytes, DEFAULT_MAX_FRAME_SIZE).unwrap();
    assert_eq!(
        frame.decode_control(None).unwrap(),
        Control::RstStream {
            stream_id: 5,
            status: RstStatus::RefusedStream
        }
    );
    assert_eq!(frame.rst_status(), Some(RstStatus::RefusedStream));
}

#[test]
fn test_rst_stream_with_short_body_is_malformed() {
    let bytes = [0x80, 2, 0, 3, 0, 0, 0, 4, 0, 0, 0, 5];
    let mut frame = Frame::from_bytes(&bytes, DEFAULT_MAX_FRAME_SIZE).unwrap();
    assert!(matches!(
        frame.decode_control(None),
        Err(Error::Malformed { frame: "RST_STREAM", .. })
    ));
}

#[test]
fn test_settings_entries_decoded() {
    let mut frame = Frame::settings(&[
        Setting { flags: 1, id: 4, value: 100 },
        Setting { flags: 0, id: 7, value: 65536 },
    ]);
    let bytes = frame.encode().to_vec();
    assert_eq!(bytes.len(), 8 + 4 + 2 * 8);

    let mut parsed = Frame::from_bytes(&bytes, DEFAULT_MAX_FRAME_SIZE).unwrap();
    match parsed.decode_control(None).unwrap() {
        Control::Settings(settings) => {
            assert_eq!(settings.len(), 2);
            assert_eq!(settings[0], Setting { flags: 1, id: 4, value: 100 });
            assert_eq!(settings[1].value, 65536);
        }
        other => panic!("Expected Settings, got {:?}", other),
    }
}

#[test]
fn test_settings_count_beyond_body_rejected() {
    // claims 3 entries, carries none
    let bytes = [0x80, 2, 0, 4, 0, 0, 0, 4, 0, 0, 0, 3];
    let mut frame = Frame::from_bytes(&bytes, DEFAULT_MAX_FRAME_SIZE).unwrap();
    assert!(frame.decode_control(None).is_err());
}

#[test]
fn test_goaway_and_noop() {
    let mut goaway = Frame::goaway(9);
    let bytes = goaway.encode().to_vec();
    let mut parsed = Frame::from_bytes(&bytes, DEFAULT_MAX_FRAME_SIZE).unwrap();
    assert_eq!(parsed.decode_control(None).unwrap(), Control::GoAway { last_stream_id: 9 });

    let noop = [0x80, 2, 0, 5, 0, 0, 0, 0];
    let mut parsed = Frame::from_bytes(&noop, DEFAULT_MAX_FRAME_SIZE).unwrap();
    assert_eq!(parsed.decode_control(None).unwrap(), Control::Noop);
}

#[test]
fn test_syn_stream_fields_recovered() {
    let mut frame = Frame::control(FrameType::SynStream);
    frame.set_stream_id(7);
    frame.set_associated_stream_id(3);
    frame.set_priority(0x40);
    frame.set_flags(flags::FIN | flags::UNIDIRECTIONAL);
    frame.add_header("url", "/").unwrap();
    let bytes = frame.encode().to_vec();

    let mut parsed = Frame::from_bytes(&bytes, DEFAULT_MAX_FRAME_SIZE).unwrap();
    assert_eq!(
        parsed.decode_control(None).unwrap(),
        Control::SynStream {
            stream_id: 7,
            associated_stream_id: 3,
            priority: 0x40
        }
    );
    assert!(parsed.is_half_close());
    assert_eq!(parsed.flags() & flags::UNIDIRECTIONAL, flags::UNIDIRECTIONAL);
    assert_eq!(parsed.nv_count(), 1);
}

#[test]
fn test_display_names_type_and_stream() {
    let frame = Frame::from_bytes(&[0, 0, 0, 3, 1, 0, 0, 0], DEFAULT_MAX_FRAME_SIZE).unwrap();
    assert_eq!(frame.to_string(), "DATA stream=3 len=0 flags=0x1");
}
