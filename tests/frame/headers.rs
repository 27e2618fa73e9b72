//! Tests for name/value header blocks

use spdy_session::{Error, Frame, FrameType, DEFAULT_MAX_FRAME_SIZE};

fn reparse(frame: &mut Frame) -> Frame {
    let bytes = frame.encode().to_vec();
    let mut parsed = Frame::from_bytes(&bytes, DEFAULT_MAX_FRAME_SIZE).unwrap();
    parsed.decode_control(None).unwrap();
    parsed
}

#[test]
fn test_request_headers_roundtrip() {
    let mut frame = Frame::control(FrameType::SynStream);
    frame.set_stream_id(1);
    frame.add_header("host", "example.com").unwrap();
    frame.add_header("url", "/").unwrap();
    frame.add_header("method", "GET").unwrap();

    let parsed = reparse(&mut frame);
    let headers = parsed.headers().unwrap();
    assert_eq!(headers.len(), 3);
    assert_eq!(headers["host"], "example.com");
    assert_eq!(headers["url"], "/");
    assert_eq!(headers["method"], "GET");
}

#[test]
fn test_pairs_keep_wire_order() {
    let mut frame = Frame::control(FrameType::Headers);
    frame.set_stream_id(3);
    frame.add_header("b", "2").unwrap();
    frame.add_header("a", "1").unwrap();

    let parsed = reparse(&mut frame);
    let pairs = parsed.header_pairs().unwrap();
    assert_eq!(pairs[0].0, "b");
    assert_eq!(pairs[1].0, "a");
}

#[test]
fn test_split_name_and_value_calls() {
    let mut frame = Frame::control(FrameType::SynReply);
    frame.set_stream_id(1);
    frame.header_name(b"status").unwrap();
    frame.header_value(b"404 Not Found").unwrap();
    assert_eq!(frame.nv_count(), 1);

    let parsed = reparse(&mut frame);
    assert_eq!(parsed.headers().unwrap()["status"], "404 Not Found");
}

#[test]
fn test_empty_header_block() {
    let mut frame = Frame::control(FrameType::SynReply);
    frame.set_stream_id(1);
    let parsed = reparse(&mut frame);
    assert_eq!(parsed.nv_count(), 0);
    assert!(parsed.headers().unwrap().is_empty());
}

#[test]
fn test_truncated_block_is_error() {
    let mut frame = Frame::control(FrameType::SynReply);
    frame.set_stream_id(1);
    frame.add_header("status", "200 OK").unwrap();
    let mut bytes = frame.encode().to_vec();
    // shrink the frame by 3 bytes so the value runs past the end
    bytes.truncate(bytes.len() - 3);
    let len = (bytes.len() - 8) as u32;
    bytes[5..8].copy_from_slice(&len.to_be_bytes()[1..]);

    let mut parsed = Frame::from_bytes(&bytes, DEFAULT_MAX_FRAME_SIZE).unwrap();
    parsed.decode_control(None).unwrap();
    assert!(parsed.header_pairs().is_err());
}

#[test]
fn test_pair_count_overflow_is_rejected() {
    let mut frame = Frame::control(FrameType::Headers);
    frame.set_stream_id(1);
    for _ in 0..u16::MAX {
        frame.add_header("a", "").unwrap();
    }
    assert_eq!(frame.nv_count(), u16::MAX);

    let err = frame.add_header("b", "").unwrap_err();
    assert!(matches!(err, Error::Malformed { .. }), "{:?}", err);
    assert_eq!(frame.nv_count(), u16::MAX);

    // the rejected name never reached the block
    let bytes = frame.encode().to_vec();
    assert_eq!(&bytes[bytes.len() - 5..], &[0, 1, b'a', 0, 0]);
}
