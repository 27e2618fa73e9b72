//! Tests for the output path: id assignment, queueing and partial writes

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use spdy_session::{
    Connection, Context, Control, Drain, Error, Frame, FrameType, HeaderInflater, Input, Role, RstStatus,
};

use super::*;

#[test]
fn test_client_stream_ids_are_odd_and_in_wire_order() {
    let (context, _executor) = manual_context();
    let (connection, peer) = raw_connection(context, Role::Client);

    let ids: Vec<u32> = (0..4)
        .map(|i| connection.get("example.com", &format!("/{}", i)).unwrap().id())
        .collect();
    assert_eq!(ids, vec![1, 3, 5, 7]);

    let mut frames = parse_frames(&peer.take());
    let wire: Vec<u32> = decode_all(&mut frames, None)
        .into_iter()
        .map(|control| match control {
            Some(Control::SynStream { stream_id, .. }) => stream_id,
            other => panic!("expected SYN_STREAM, got {:?}", other),
        })
        .collect();
    assert_eq!(wire, ids);
}

#[test]
fn test_server_stream_ids_are_even() {
    let (context, _executor) = manual_context();
    let (connection, _peer) = raw_connection(context, Role::Server);

    let first = connection.new_stream();
    assert_eq!(first.id(), 0);
    first.send().unwrap();
    let second = connection.new_stream();
    second.send().unwrap();
    assert_eq!((first.id(), second.id()), (2, 4));
}

#[test]
fn test_large_frame_survives_partial_writes() {
    let (context, _executor) = manual_context();
    let (local, peer) = pipe();
    let local = local.nonblocking().limited(1500, 1500);
    let connection = Connection::new(context, Role::Client, local.clone(), local).unwrap();

    let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
    connection
        .send_frame_non_blocking(Frame::data(1, &payload, true), None)
        .unwrap();

    let mut wire = Vec::new();
    let mut blocked = 0;
    loop {
        match connection.drain() {
            Drain::Blocked => {
                blocked += 1;
                wire.extend(peer.take());
            }
            Drain::Idle => break,
            Drain::Closed => panic!("connection closed"),
        }
    }
    wire.extend(peer.take());

    assert!(blocked >= 13, "only blocked {} times", blocked);
    assert!(peer.peer_writes().iter().all(|n| *n <= 1500));
    let frames = parse_frames(&wire);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].payload(), &payload[..]);
    assert!(frames[0].is_half_close());
}

#[test]
fn test_blocking_send_waits_for_slow_reader() {
    let (context, _executor) = manual_context();
    let (local, peer) = pipe();
    let local = local.limited(1500, 1500);
    let connection = Connection::new(context, Role::Client, local.clone(), local).unwrap();

    let expected = HEADER_LEN + 20_000;
    let consumer = thread::spawn(move || {
        let mut wire = Vec::new();
        while wire.len() < expected {
            wire.extend(peer.take());
            thread::sleep(Duration::from_millis(1));
        }
        wire
    });

    connection
        .send_frame_blocking(Frame::data(1, &[9u8; 20_000], false), None)
        .unwrap();
    let wire = consumer.join().unwrap();
    let frames = parse_frames(&wire);
    assert_eq!(frames[0].payload(), &[9u8; 20_000][..]);
}

#[test]
fn test_concurrent_senders_never_interleave() {
    const THREADS: u8 = 8;
    const FRAMES: usize = 50;

    let (context, _executor) = manual_context();
    let (local, peer) = pipe();
    let local = local.nonblocking().limited(1500, 700);
    let connection = Connection::new(context, Role::Client, local.clone(), local).unwrap();

    let expected: usize = (0..FRAMES).map(|i| HEADER_LEN + 100 + i).sum::<usize>() * THREADS as usize;
    let collector = thread::spawn(move || {
        let mut wire = Vec::new();
        while wire.len() < expected {
            wire.extend(peer.take());
            thread::yield_now();
        }
        wire
    });

    let senders: Vec<_> = (0..THREADS)
        .map(|t| {
            let connection = connection.clone();
            thread::spawn(move || {
                for i in 0..FRAMES {
                    let payload = vec![t; 100 + i];
                    let frame = Frame::data(2 * t as u32 + 1, &payload, false);
                    connection.send_frame_blocking(frame, None).unwrap();
                }
            })
        })
        .collect();
    for sender in senders {
        sender.join().unwrap();
    }

    let frames = parse_frames(&collector.join().unwrap());
    assert_eq!(frames.len(), THREADS as usize * FRAMES);

    let mut seen = vec![Vec::new(); THREADS as usize];
    for frame in &frames {
        let t = ((frame.stream_id() - 1) / 2) as u8;
        assert!(frame.payload().iter().all(|b| *b == t), "interleaved frame on stream {}", frame.stream_id());
        seen[t as usize].push(frame.payload().len());
    }
    for lengths in seen {
        assert_eq!(lengths, (100..100 + FRAMES).collect::<Vec<_>>());
    }
}

#[test]
fn test_stream_finishes_after_local_then_remote_fin() {
    let (context, _executor) = manual_context();
    let (connection, peer) = raw_connection(context, Role::Client);

    let stream = connection.get("example.com", "/").unwrap();
    assert!(stream.fin_sent());
    assert!(!stream.is_finished());
    assert_eq!(connection.open_streams(), 1);

    peer.push(&syn_reply(1, &[("status", "200 OK")], true));
    assert_eq!(connection.process_input(), Input::Pending);
    assert!(stream.is_finished());
    assert_eq!(connection.open_streams(), 0);
}

#[test]
fn test_stream_finishes_after_remote_then_local_fin() {
    let (context, _executor) = manual_context();
    let (connection, peer) = raw_connection(context, Role::Server);

    peer.push(&syn_stream(1, &[("url", "/")], true));
    assert_eq!(connection.process_input(), Input::Pending);
    let stream = connection.stream(1).unwrap();
    assert!(stream.fin_rcvd());
    assert!(!stream.is_finished());

    stream.send_reply(&[("status", "200 OK")], true).unwrap();
    assert!(stream.is_finished());
    assert_eq!(connection.open_streams(), 0);

    let mut frames = parse_frames(&peer.take());
    assert_eq!(
        decode_all(&mut frames, None),
        vec![Some(Control::SynReply { stream_id: 1 })]
    );
    let headers = frames[0].headers().unwrap();
    assert_eq!(headers["status"], "200 OK");
    assert_eq!(headers["version"], "HTTP/1.1");
    assert!(frames[0].is_half_close());
}

#[test]
fn test_writes_after_fin_are_rejected() {
    let (context, _executor) = manual_context();
    let (connection, _peer) = raw_connection(context, Role::Client);

    let stream = connection.get("example.com", "/").unwrap();
    assert!(matches!(stream.send_data_frame(b"late", false), Err(Error::StreamFinished)));
    assert!(matches!(stream.add_header("late", "header"), Err(Error::StreamFinished)));
    assert!(matches!(stream.send(), Err(Error::StreamFinished)));
}

#[test]
fn test_body_is_split_to_max_frame_size() {
    init_tracing();
    let (context, _executor) = {
        let executor = ManualExecutor::default();
        let context = Context::builder()
            .compression(false)
            .max_frame_size(1024)
            .executor(executor.clone())
            .build()
            .unwrap();
        (context, executor)
    };
    let (connection, peer) = raw_connection(context, Role::Client);

    let stream = connection.new_stream();
    stream.add_header("url", "/upload").unwrap();
    stream.send_request("POST", "http", false).unwrap();
    stream.send_data_frame(&[7u8; 3000], true).unwrap();

    let frames = parse_frames(&peer.take());
    assert_eq!(frames[0].frame_type(), FrameType::SynStream);
    let bodies: Vec<(usize, bool)> = frames[1..]
        .iter()
        .map(|frame| {
            assert_eq!(frame.stream_id(), 1);
            (frame.payload().len(), frame.is_half_close())
        })
        .collect();
    assert_eq!(bodies, vec![(1016, false), (1016, false), (968, true)]);
}

#[test]
fn test_empty_body_sends_fin_only_frame() {
    let (context, _executor) = manual_context();
    let (connection, peer) = raw_connection(context, Role::Client);

    let stream = connection.new_stream();
    stream.send_request("POST", "http", false).unwrap();
    stream.send_data_frame(&[], true).unwrap();

    let frames = parse_frames(&peer.take());
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[1].body_len(), 0);
    assert!(frames[1].is_half_close());
    assert!(stream.fin_sent());
}

#[test]
fn test_local_reset_sends_rst_stream() {
    let (context, _executor) = manual_context();
    let (connection, peer) = raw_connection(context, Role::Client);

    let stream = connection.new_stream();
    stream.send_request("POST", "http", false).unwrap();
    stream.reset(RstStatus::Cancel).unwrap();
    assert!(stream.is_finished());
    assert_eq!(connection.open_streams(), 0);

    let mut frames = parse_frames(&peer.take());
    let decoded = decode_all(&mut frames, None);
    assert_eq!(
        decoded[1],
        Some(Control::RstStream {
            stream_id: 1,
            status: RstStatus::Cancel
        })
    );

    // a second reset is a no-op
    stream.reset(RstStatus::InternalError).unwrap();
    assert!(peer.take().is_empty());
}

#[test]
fn test_reset_before_open_stays_off_the_wire() {
    let (context, _executor) = manual_context();
    let (connection, peer) = raw_connection(context, Role::Client);

    let stream = connection.new_stream();
    stream.reset(RstStatus::Cancel).unwrap();
    assert_eq!(stream.reset_status(), Some(RstStatus::Cancel));
    assert!(peer.take().is_empty());
}

#[test]
fn test_writes_before_open_are_rejected() {
    let (context, executor) = manual_context();
    let (connection, peer) = raw_connection(context, Role::Client);

    let stream = connection.new_stream();
    assert!(matches!(stream.send_data_frame(b"early", true), Err(Error::NotOpened)));
    assert!(matches!(stream.send_headers(&[("x", "y")], false), Err(Error::NotOpened)));
    assert!(matches!(stream.send_reply(&[("status", "200 OK")], true), Err(Error::NotOpened)));
    executor.run_all();
    assert!(peer.take().is_empty());
    assert!(!connection.is_closed());

    // opening afterwards still works and takes the first id
    stream.send_request("POST", "http", false).unwrap();
    assert_eq!(stream.id(), 1);
    stream.send_data_frame(b"body", true).unwrap();
    let mut frames = parse_frames(&peer.take());
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[1].stream_id(), 1);
    assert_eq!(frames[1].payload(), b"body");
    assert!(matches!(
        decode_all(&mut frames[..1], None)[0],
        Some(Control::SynStream { stream_id: 1, .. })
    ));
}

#[test]
fn test_blocked_sender_released_on_abort() {
    let (context, _executor) = manual_context();
    let (local, peer) = pipe();
    let local = local.nonblocking().limited(10, 10);
    let connection = Connection::new(context, Role::Client, local.clone(), local).unwrap();

    let started = Arc::new(AtomicBool::new(false));
    let sender = {
        let connection = connection.clone();
        let started = started.clone();
        thread::spawn(move || {
            started.store(true, Ordering::SeqCst);
            connection.send_frame_blocking(Frame::data(1, &[0u8; 100], false), None)
        })
    };

    assert!(eventually(|| started.load(Ordering::SeqCst) && !peer.take().is_empty()));
    connection.abort("test teardown");
    assert!(matches!(sender.join().unwrap(), Err(Error::Closed)));
    assert!(connection.is_closed());
    assert_eq!(connection.drain(), Drain::Closed);
    assert!(matches!(
        connection.send_frame_blocking(Frame::data(1, b"x", false), None),
        Err(Error::Closed)
    ));
}

#[test]
fn test_syn_stream_headers_are_compressed() {
    init_tracing();
    let executor = ManualExecutor::default();
    let context = Context::builder().executor(executor).build().unwrap();
    let (connection, peer) = raw_connection(context, Role::Client);

    connection.get("example.com", "/index.html").unwrap();
    connection.get("example.com", "/style.css").unwrap();

    let mut frames = parse_frames(&peer.take());
    let mut inflater = HeaderInflater::new();
    let decoded = decode_all(&mut frames, Some(&mut inflater));
    assert!(matches!(decoded[0], Some(Control::SynStream { stream_id: 1, .. })));
    assert!(matches!(decoded[1], Some(Control::SynStream { stream_id: 3, .. })));

    let first = frames[0].headers().unwrap();
    assert_eq!(first["host"], "example.com");
    assert_eq!(first["url"], "/index.html");
    assert_eq!(first["method"], "GET");
    assert_eq!(first["scheme"], "http");
    assert_eq!(first["version"], "HTTP/1.1");
    assert_eq!(frames[1].headers().unwrap()["url"], "/style.css");
}

#[test]
fn test_dump_lists_open_streams() {
    let (context, _executor) = manual_context();
    let (connection, _peer) = raw_connection(context, Role::Client);

    connection.get("example.com", "/").unwrap();
    let dump = connection.dump();
    assert!(dump.starts_with("Client connection: closed=false streams=1"));
    assert!(dump.contains("id: 1"));
}
