use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use assert_matches::assert_matches;

use super::*;
use crate::coding::Codec;
use crate::wire::Handshake;

mod util;
use util::*;

#[test]
fn loopback_roundtrip() {
    let _guard = subscribe();
    let mut pair = Pair::new(async_config(3001), async_config(3002));
    let to = pair.b.addr;
    let msg = test_message(to, 1, b"hello");
    let identity = msg.identity();

    assert_matches!(pair.send(Side::A, msg, 1), Ok(SendOutcome::Success));
    let (_, status) = pair.a.take_sent(1).expect("send completed");
    assert_eq!(status, ErrorCode::Success);

    let mut received = pair.b.take_messages();
    assert_eq!(received.len(), 1);
    let echo = received.pop().unwrap();
    assert_eq!(echo.identity(), identity);
    assert_eq!(&echo.data()[..], b"hello");
    assert_eq!(echo.peer(), pair.a.addr);
    assert!(echo.has_slot());

    // Echo the message straight back and release its slot afterwards
    assert_matches!(pair.send(Side::B, echo, 2), Ok(_));
    let (echo, status) = pair.b.take_sent(2).expect("echo completed");
    assert_eq!(status, ErrorCode::Success);
    pair.release(Side::B, echo);

    let mut received = pair.a.take_messages();
    assert_eq!(received.len(), 1);
    let reply = received.pop().unwrap();
    assert_eq!(reply.identity(), identity);
    assert_eq!(&reply.data()[..], b"hello");
    pair.release(Side::A, reply);
}

#[test]
fn synchronous_send_completes_only_after_ack() {
    let _guard = subscribe();
    let mut pair = Pair::new(sync_config(3003), sync_config(3004));
    let msg = test_message(pair.b.addr, 2, b"");

    assert_matches!(pair.send(Side::A, msg, 1), Ok(SendOutcome::Success));
    // The write is done, but the ack only comes once B releases the slot
    assert!(pair.a.take_sent(1).is_none());

    let mut received = pair.b.take_messages();
    assert_eq!(received.len(), 1);
    let msg = received.pop().unwrap();
    assert_eq!(msg.data().len(), 0);
    pair.release(Side::B, msg);

    let (_, status) = pair.a.take_sent(1).expect("ack arrived");
    assert_eq!(status, ErrorCode::Success);
}

#[test]
fn oversized_message_is_rejected() {
    let _guard = subscribe();
    let receiver = Config {
        max_msg_size: 4,
        ..sync_config(3006)
    };
    let mut pair = Pair::new(sync_config(3005), receiver);
    let msg = test_message(pair.b.addr, 3, b"hello");

    assert_matches!(pair.send(Side::A, msg, 1), Ok(_));
    let (_, status) = pair.a.take_sent(1).expect("send aborted");
    assert_eq!(status, ErrorCode::ProtocolError);
    assert!(pair.b.take_messages().is_empty());
}

#[test]
fn max_msg_size_is_a_sharp_boundary() {
    let _guard = subscribe();
    let receiver = Config {
        max_msg_size: 10,
        ..sync_config(3025)
    };
    let mut pair = Pair::new(sync_config(3024), receiver);

    // Exactly at the limit passes end-to-end
    let msg = test_message(pair.b.addr, 20, b"0123456789");
    pair.send(Side::A, msg, 1).unwrap();
    let received = pair.b.take_messages().pop().expect("boundary accepted");
    assert_eq!(received.data().len(), 10);
    pair.release(Side::B, received);
    assert_eq!(pair.a.take_sent(1).unwrap().1, ErrorCode::Success);

    // One byte over tears the connection down
    let msg = test_message(pair.b.addr, 21, b"0123456789x");
    pair.send(Side::A, msg, 2).unwrap();
    assert!(pair.b.take_messages().is_empty());
    assert_eq!(pair.a.take_sent(2).unwrap().1, ErrorCode::ProtocolError);
}

#[test]
fn serials_increase_per_remote() {
    let _guard = subscribe();
    let mut pair = Pair::new(async_config(3026), async_config(3027));
    for i in 0..3u64 {
        let msg = test_message(pair.b.addr, 30 + i as u8, b"seq");
        pair.send(Side::A, msg, i).unwrap();
    }
    let received = pair.b.take_messages();
    assert_eq!(received.len(), 3);
    let first = received[0].serial();
    for (i, msg) in received.iter().enumerate() {
        assert_eq!(msg.serial(), first.wrapping_add(i as u32));
    }
}

#[test]
fn send_behind_a_waiting_message_reports_queued() {
    let _guard = subscribe();
    let mut pair = Pair::new(sync_config(3028), sync_config(3029));
    let first = test_message(pair.b.addr, 40, b"one");
    let second = test_message(pair.b.addr, 41, b"two");
    let third = test_message(pair.b.addr, 42, b"three");

    // First goes straight out; second waits for its ack; third queues
    // behind the second
    assert_matches!(pair.send(Side::A, first, 1), Ok(SendOutcome::Success));
    assert_matches!(pair.send(Side::A, second, 2), Ok(SendOutcome::Success));
    assert_matches!(pair.send(Side::A, third, 3), Ok(SendOutcome::Queued));

    for token in 1..=3 {
        let received = pair.b.take_messages().pop().expect("delivered in order");
        pair.release(Side::B, received);
        assert_eq!(pair.a.take_sent(token).unwrap().1, ErrorCode::Success);
    }
}

#[test]
fn unresponsive_peer_times_out() {
    let _guard = subscribe();
    let config = Config {
        timeout: Duration::from_millis(500),
        ..sync_config(3007)
    };
    let mut pair = Pair::new(config, sync_config(3008));
    let target: SocketAddr = "10.255.255.1:65000".parse().unwrap();
    pair.blackholes.push(target);

    let msg = test_message(target, 4, b"void");
    assert_matches!(pair.send(Side::A, msg, 1), Ok(SendOutcome::Success));
    assert!(pair.a.take_sent(1).is_none());

    pair.advance(Duration::from_millis(600));
    let (_, status) = pair.a.take_sent(1).expect("send timed out");
    assert_eq!(status, ErrorCode::Timeout);
    // The remote sits in the reconnect-debounce window before becoming
    // available again
    assert_eq!(pair.a.node.remote_blocked(target), Some(true));
    pair.advance(Duration::from_millis(600));
    assert_eq!(pair.a.node.remote_blocked(target), Some(false));
}

#[test]
fn simultaneous_dial_settles_on_one_connection() {
    let _guard = subscribe();
    let mut pair = Pair::new(async_config(3009), async_config(3010));
    let now = pair.time;
    let to_b = test_message(pair.b.addr, 5, b"from a");
    let to_a = test_message(pair.a.addr, 6, b"from b");
    pair.a.node.send(now, to_b, 1).unwrap();
    pair.b.node.send(now, to_a, 2).unwrap();
    pair.drive();

    assert_eq!(pair.a.take_sent(1).unwrap().1, ErrorCode::Success);
    assert_eq!(pair.b.take_sent(2).unwrap().1, ErrorCode::Success);
    assert_eq!(pair.a.take_messages().len(), 1);
    assert_eq!(pair.b.take_messages().len(), 1);

    // Both sides raced, so each holds a superseded connection for GC
    assert_eq!(pair.a.node.remote_count(), 1);
    assert_eq!(pair.b.node.remote_count(), 1);
    assert_eq!(pair.a.node.old_connection_count(), 1);
    assert_eq!(pair.b.node.old_connection_count(), 1);

    // Keep the remotes warm while GC reaps the old connections
    for round in 0..7u64 {
        let msg = test_message(pair.b.addr, 7, b"keepalive");
        pair.send(Side::A, msg, 100 + round).unwrap();
        pair.advance(Duration::from_secs(10));
    }
    assert_eq!(pair.a.node.old_connection_count(), 0);
    assert_eq!(pair.b.node.old_connection_count(), 0);
    assert_eq!(pair.a.node.connection_count(), 1);
    assert_eq!(pair.b.node.connection_count(), 1);
    assert!(pair.a.node.remote_connection(pair.b.addr).is_some());
}

#[test]
fn exhausted_slots_pause_the_stream() {
    let _guard = subscribe();
    // Synchronous mode forces a single slot on the receiver
    let mut pair = Pair::new(async_config(3011), sync_config(3012));
    let now = pair.time;
    let first = test_message(pair.b.addr, 7, b"first");
    let second = test_message(pair.b.addr, 8, b"second");
    pair.a.node.send(now, first, 1).unwrap();
    pair.a.node.send(now, second, 2).unwrap();
    pair.drive();

    assert_eq!(pair.a.take_sent(1).unwrap().1, ErrorCode::Success);
    assert_eq!(pair.a.take_sent(2).unwrap().1, ErrorCode::Success);

    // Only the first message fits; the reader stopped the stream
    let mut received = pair.b.take_messages();
    assert_eq!(received.len(), 1);
    let first = received.pop().unwrap();
    assert_eq!(&first.data()[..], b"first");
    let conn = pair.b.node.remote_connection(pair.a.addr).unwrap();
    assert!(pair.b.is_paused(conn));

    // Releasing the slot restarts the stream and delivers the second
    pair.release(Side::B, first);
    let mut received = pair.b.take_messages();
    assert_eq!(received.len(), 1);
    assert_eq!(&received.pop().unwrap().data()[..], b"second");
    assert!(!pair.b.is_paused(conn));
}

#[test]
fn idle_remote_gets_probed_before_next_send() {
    let _guard = subscribe();
    let mut pair = Pair::new(sync_config(3013), sync_config(3014));
    let msg = test_message(pair.b.addr, 9, b"one");
    pair.send(Side::A, msg, 1).unwrap();
    let received = pair.b.take_messages().pop().unwrap();
    pair.release(Side::B, received);
    assert_eq!(pair.a.take_sent(1).unwrap().1, ErrorCode::Success);

    // Idle past 3/4 of the reuse time; the next send leads with a NOOP
    pair.advance(Duration::from_secs(24));
    let msg = test_message(pair.b.addr, 10, b"two");
    pair.send(Side::A, msg, 2).unwrap();
    let mut received = pair.b.take_messages();
    assert_eq!(received.len(), 1, "the probe itself is not delivered");
    pair.release(Side::B, received.pop().unwrap());
    assert_eq!(pair.a.take_sent(2).unwrap().1, ErrorCode::Success);
}

#[test]
fn idle_remote_is_garbage_collected() {
    let _guard = subscribe();
    let mut pair = Pair::new(sync_config(3017), sync_config(3018));
    let msg = test_message(pair.b.addr, 11, b"ping");
    pair.send(Side::A, msg, 1).unwrap();
    let received = pair.b.take_messages().pop().unwrap();
    pair.release(Side::B, received);
    assert_eq!(pair.a.node.remote_count(), 1);
    assert_eq!(pair.b.node.remote_count(), 1);

    pair.advance(Duration::from_secs(61));
    pair.advance(Duration::from_secs(61));
    assert_eq!(pair.a.node.remote_count(), 0);
    assert_eq!(pair.b.node.remote_count(), 0);
    assert_eq!(pair.a.node.connection_count(), 0);
    assert_eq!(pair.b.node.connection_count(), 0);
}

#[test]
fn close_aborts_pending_sends() {
    let _guard = subscribe();
    let mut pair = Pair::new(sync_config(3015), sync_config(3016));
    let target: SocketAddr = "10.255.255.1:65000".parse().unwrap();
    pair.blackholes.push(target);
    let msg = test_message(target, 12, b"stuck");
    pair.send(Side::A, msg, 1).unwrap();
    assert!(pair.a.take_sent(1).is_none());

    let now = pair.time;
    pair.a.node.close(now).unwrap();
    pair.drive();

    let (_, status) = pair.a.take_sent(1).expect("pending send aborted");
    assert_eq!(status, ErrorCode::Shutdown);
    assert!(pair.a.closed());

    // Every send after close is rejected outright
    let msg = test_message(target, 13, b"late");
    assert_matches!(
        pair.a.node.send(now, msg, 2),
        Err((_, ErrorCode::Shutdown))
    );
    assert_matches!(pair.a.node.close(now), Err(ErrorCode::InProgress) | Err(ErrorCode::Fatal));
}

#[test]
fn pool_outlives_connection_while_slot_is_held() {
    let _guard = subscribe();
    let mut pair = Pair::new(sync_config(3019), sync_config(3020));
    let msg = test_message(pair.b.addr, 14, b"hold");
    pair.send(Side::A, msg, 1).unwrap();
    let held = pair.b.take_messages().pop().unwrap();

    let now = pair.time;
    pair.b.node.close(now).unwrap();
    pair.drive();
    assert!(pair.b.closed());
    assert_eq!(pair.b.node.connection_count(), 0);
    // The slot pool stays alive until the application lets go
    assert_eq!(pair.b.node.pool_count(), 1);
    pair.b.node.release_slot(now, held, Some(7));
    pair.drive();
    assert_eq!(pair.b.node.pool_count(), 0);
    assert!(pair
        .b
        .events
        .iter()
        .any(|e| matches!(e, Event::Released { token: 7 })));
}

#[test]
fn reader_handles_bytewise_input() {
    let _guard = subscribe();
    let now = Instant::now();
    let mut node = Node::new(Arc::new(async_config(3021)), None, now).unwrap();
    let peer: SocketAddr = "127.0.0.1:52111".parse().unwrap();
    let ch = node.accept(now, peer).unwrap();

    let hs = Handshake {
        port: 4242,
        identity: Identity([7; ID_SIZE]),
    };
    let mut hs_buf = [0u8; HANDSHAKE_SIZE];
    hs.encode(&mut &mut hs_buf[..]);
    node.handle_input(ch, now, &hs_buf);

    let wire = crate::wire::WireHeader {
        identity: Identity([9; ID_SIZE]),
        serial: 99,
        ty: crate::wire::MessageType::NONE,
        header_len: 3,
        data_len: 5,
    };
    let mut buf = Vec::new();
    wire.encode(&mut buf);
    buf.extend_from_slice(b"abc");
    buf.extend_from_slice(b"hello");
    for byte in buf {
        node.handle_input(ch, now, &[byte]);
    }

    let msg = loop {
        match node.poll_event() {
            Some(Event::Message(msg)) => break msg,
            Some(_) => continue,
            None => panic!("message not delivered"),
        }
    };
    assert_eq!(msg.serial(), 99);
    assert_eq!(&msg.header()[..], b"abc");
    assert_eq!(&msg.data()[..], b"hello");
    assert_eq!(msg.peer(), "127.0.0.1:4242".parse().unwrap());
    assert_eq!(msg.remote_identity(), Identity([7; ID_SIZE]));
}

#[test]
fn stale_ack_is_ignored() {
    let _guard = subscribe();
    let now = Instant::now();
    let mut node = Node::new(Arc::new(sync_config(3022)), None, now).unwrap();
    let peer: SocketAddr = "127.0.0.1:52112".parse().unwrap();
    let ch = node.accept(now, peer).unwrap();

    let hs = Handshake {
        port: 4243,
        identity: Identity([7; ID_SIZE]),
    };
    let mut hs_buf = [0u8; HANDSHAKE_SIZE];
    hs.encode(&mut &mut hs_buf[..]);
    node.handle_input(ch, now, &hs_buf);

    let ack = crate::wire::WireHeader {
        identity: Identity([3; ID_SIZE]),
        serial: 1,
        ty: crate::wire::MessageType::ACK,
        header_len: 0,
        data_len: 0,
    };
    let mut buf = Vec::new();
    ack.encode(&mut buf);
    node.handle_input(ch, now, &buf);

    assert_eq!(node.connection_count(), 1);
    while let Some(event) = node.poll_event() {
        panic!("unexpected event {event:?}");
    }
}

#[test]
fn control_message_with_payload_kills_the_connection() {
    let _guard = subscribe();
    let now = Instant::now();
    let mut node = Node::new(Arc::new(sync_config(3023)), None, now).unwrap();
    let peer: SocketAddr = "127.0.0.1:52113".parse().unwrap();
    let ch = node.accept(now, peer).unwrap();

    let hs = Handshake {
        port: 4244,
        identity: Identity([7; ID_SIZE]),
    };
    let mut hs_buf = [0u8; HANDSHAKE_SIZE];
    hs.encode(&mut &mut hs_buf[..]);
    node.handle_input(ch, now, &hs_buf);

    let bad = crate::wire::WireHeader {
        identity: Identity([3; ID_SIZE]),
        serial: 1,
        ty: crate::wire::MessageType::ACK,
        header_len: 0,
        data_len: 4,
    };
    let mut buf = Vec::new();
    bad.encode(&mut buf);
    buf.extend_from_slice(b"oops");
    node.handle_input(ch, now, &buf);

    let saw_close = std::iter::from_fn(|| node.poll_io())
        .any(|req| matches!(req, IoRequest::Close { handle } if handle == ch));
    assert!(saw_close, "protocol error must tear the connection down");
}

#[test]
fn encrypted_pair_roundtrip() {
    let _guard = subscribe();
    let fixture = TlsFixture::new("wan");
    let mut pair = Pair::new_tls(
        fixture.config(3031),
        Some(fixture.context()),
        fixture.config(3032),
        Some(fixture.context()),
    );
    // Non-loopback addresses so the connection is upgraded to TLS
    pair.a.addr = SocketAddr::new("192.0.2.1".parse().unwrap(), 3031);
    pair.b.addr = SocketAddr::new("192.0.2.2".parse().unwrap(), 3032);

    let msg = test_message(pair.b.addr, 15, b"secret");
    assert_matches!(pair.send(Side::A, msg, 1), Ok(_));
    let mut received = pair.b.take_messages();
    assert_eq!(received.len(), 1);
    let msg = received.pop().unwrap();
    assert_eq!(&msg.data()[..], b"secret");
    pair.release(Side::B, msg);
    assert_eq!(pair.a.take_sent(1).unwrap().1, ErrorCode::Success);
}

#[test]
fn always_encrypt_upgrades_loopback() {
    let _guard = subscribe();
    let fixture = TlsFixture::new("loopback");
    let config = |port| Config {
        always_encrypt: true,
        ..fixture.config(port)
    };
    let mut pair = Pair::new_tls(
        config(3033),
        Some(fixture.context()),
        config(3034),
        Some(fixture.context()),
    );

    let msg = test_message(pair.b.addr, 16, b"local secret");
    assert_matches!(pair.send(Side::A, msg, 1), Ok(_));
    let mut received = pair.b.take_messages();
    assert_eq!(received.len(), 1);
    let msg = received.pop().unwrap();
    assert_eq!(&msg.data()[..], b"local secret");
    pair.release(Side::B, msg);
    assert_eq!(pair.a.take_sent(1).unwrap().1, ErrorCode::Success);
}
