#![cfg(test)]

use super::support::{connected, inet, local_addr, stack};
use crate::options::{SO_RCVTIMEO, SO_SNDTIMEO, SOL_SOCKET};
use crate::*;
use std::io::{IoSlice, IoSliceMut};
use std::net::Shutdown;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

fn set_timeout(so: &Socket, name: u32, ms: i64) {
    let mut raw = (ms / 1000).to_ne_bytes().to_vec();
    raw.extend_from_slice(&((ms % 1000) * 1000).to_ne_bytes());
    so.setsockopt(SOL_SOCKET, name, &raw).unwrap();
}

/// Calls `poke` until the thread finishes.
fn poke_until_done<T>(handle: thread::JoinHandle<T>, poke: impl Fn()) -> T {
    while !handle.is_finished() {
        poke();
        thread::sleep(Duration::from_millis(5));
    }
    handle.join().unwrap()
}

#[test]
fn test_bind() {
    let (stack, _) = stack(None);
    let so = stack.create(Domain::Inet, SockType::Stream, 0).unwrap();
    assert!(matches!(so.local_address(), Err(SockError::AddressUnavailable)));
    assert!(matches!(
        so.bind(&local_addr("nope")),
        Err(SockError::AddressFamilyUnsupported)
    ));
    so.bind(&inet(5000)).unwrap();
    assert_eq!(so.state(), SockState::Closed);
    assert_eq!(so.local_address().unwrap(), inet(5000));
    assert!(matches!(so.bind(&inet(5001)), Err(SockError::InvalidArgument)));
}

#[test]
fn test_create_unknown_protocol() {
    let (stack, _) = stack(None);
    let raw = stack.create(Domain::Inet, SockType::Raw, 0);
    assert!(matches!(raw, Err(SockError::Unsupported)));
    let sctp = stack.create(Domain::Inet, SockType::Stream, libc::IPPROTO_SCTP);
    assert!(matches!(sctp, Err(SockError::Unsupported)));
    let tcp = stack.create(Domain::Inet, SockType::Stream, 0).unwrap();
    assert_eq!(tcp.kind().protocol, libc::IPPROTO_TCP);
    assert_eq!(stack.registry().len(), 4);
}

#[test]
fn test_connect_complete() {
    let (stack, _) = stack(None);
    let so = stack.create(Domain::Inet, SockType::Stream, 0).unwrap();
    assert!(matches!(so.peer_address(), Err(SockError::NotConnected)));
    so.connect(&inet(80), MsgFlags::empty()).unwrap();
    assert!(so.is_connected());
    assert_eq!(so.peer_address().unwrap(), inet(80));
    assert!(matches!(
        so.connect(&inet(80), MsgFlags::empty()),
        Err(SockError::AlreadyConnected)
    ));
    so.connectwait(None).unwrap();
}

#[test]
fn test_connect_refused() {
    let (stack, probe) = stack(None);
    probe.refuse.store(true, Ordering::SeqCst);
    let so = stack.create(Domain::Inet, SockType::Stream, 0).unwrap();
    assert!(matches!(
        so.connect(&inet(80), MsgFlags::empty()),
        Err(SockError::AddressUnavailable)
    ));
    assert_eq!(so.state(), SockState::Closed);
    assert!(matches!(so.peer_address(), Err(SockError::NotConnected)));
    assert!(matches!(so.connectwait(None), Err(SockError::InvalidArgument)));
}

#[test]
fn test_nonblocking_connect() {
    let (stack, probe) = stack(None);
    probe.pending.store(true, Ordering::SeqCst);
    let so = stack.create(Domain::Inet, SockType::Stream, 0).unwrap();
    assert!(matches!(
        so.connect(&inet(80), MsgFlags::DONTWAIT),
        Err(SockError::InProgress)
    ));
    assert_eq!(so.state(), SockState::Connecting);
    assert!(matches!(
        so.connect(&inet(80), MsgFlags::DONTWAIT),
        Err(SockError::AlreadyInProgress)
    ));
    assert!(matches!(
        so.connectwait(Some(Duration::from_millis(20))),
        Err(SockError::InProgress)
    ));

    so.set_connected(None).unwrap();
    so.connectwait(None).unwrap();
    assert_eq!(so.peer_address().unwrap(), inet(80));
}

#[test]
fn test_pending_connect_failure() {
    let (stack, probe) = stack(None);
    probe.pending.store(true, Ordering::SeqCst);
    let so = stack.create(Domain::Inet, SockType::Stream, 0).unwrap();
    so.ioctl(options::FIONBIO, &mut 1i32.to_ne_bytes()).unwrap();
    assert!(matches!(
        so.connect(&inet(80), MsgFlags::empty()),
        Err(SockError::InProgress)
    ));
    so.set_disconnected(Some(SockError::TimedOut)).unwrap();
    assert_eq!(so.state(), SockState::Closed);
    assert!(matches!(so.connectwait(None), Err(SockError::TimedOut)));
}

#[test]
fn test_reconnect_after_failure_uses_new_peer() {
    let (stack, probe) = stack(None);
    probe.pending.store(true, Ordering::SeqCst);
    let so = stack.create(Domain::Inet, SockType::Stream, 0).unwrap();
    assert!(matches!(
        so.connect(&inet(80), MsgFlags::DONTWAIT),
        Err(SockError::InProgress)
    ));
    assert_eq!(so.peer_address().unwrap(), inet(80));
    so.set_disconnected(Some(SockError::TimedOut)).unwrap();
    assert!(matches!(so.peer_address(), Err(SockError::NotConnected)));

    assert!(matches!(
        so.connect(&inet(81), MsgFlags::DONTWAIT),
        Err(SockError::InProgress)
    ));
    so.set_connected(None).unwrap();
    so.connectwait(None).unwrap();
    assert_eq!(so.peer_address().unwrap(), inet(81));
}

#[test]
fn test_blocking_connect_times_out() {
    let config = KpiConfig {
        timeout: Some(Duration::from_millis(30)),
        ..KpiConfig::default()
    };
    let (stack, probe) = stack(Some(config));
    probe.pending.store(true, Ordering::SeqCst);
    let so = stack.create(Domain::Inet, SockType::Stream, 0).unwrap();
    assert!(matches!(
        so.connect(&inet(80), MsgFlags::empty()),
        Err(SockError::InProgress)
    ));
    assert_eq!(so.state(), SockState::Connecting);
}

#[test]
fn test_huge_timeouts_wait_without_deadline() {
    let config = KpiConfig {
        timeout: Some(Duration::MAX),
        ..KpiConfig::default()
    };
    let (stack, probe) = stack(Some(config));
    let so = connected(&stack);
    let mut raw = i64::MAX.to_ne_bytes().to_vec();
    raw.extend_from_slice(&0i64.to_ne_bytes());
    so.setsockopt(SOL_SOCKET, SO_RCVTIMEO, &raw).unwrap();

    let mut buf = [0u8; 8];
    assert!(matches!(
        so.receive(&mut [IoSliceMut::new(&mut buf)], MsgFlags::DONTWAIT),
        Err(SockError::WouldBlock)
    ));
    probe.feed(&so, b"late");
    let got = so
        .receive(&mut [IoSliceMut::new(&mut buf)], MsgFlags::empty())
        .unwrap();
    assert_eq!(&buf[..got.bytes], b"late");

    probe.limit(0);
    assert!(matches!(
        so.send(&[IoSlice::new(b"x")], &[], MsgFlags::DONTWAIT),
        Err(SockError::WouldBlock)
    ));
}

#[test]
fn test_blocking_connect_completes_from_other_thread() {
    let (stack, probe) = stack(None);
    probe.pending.store(true, Ordering::SeqCst);
    let so = stack.create(Domain::Inet, SockType::Stream, 0).unwrap();
    let remote = so.clone();
    let completer = thread::spawn(move || {
        while remote.state() != SockState::Connecting {
            thread::sleep(Duration::from_millis(1));
        }
        remote.set_connected(Some(inet(81))).unwrap();
    });
    so.connect(&inet(80), MsgFlags::empty()).unwrap();
    completer.join().unwrap();
    assert_eq!(so.peer_address().unwrap(), inet(81));
}

#[test]
fn test_send_gathers_buffers() {
    let (stack, probe) = stack(None);
    let so = stack.create(Domain::Inet, SockType::Stream, 0).unwrap();
    let bufs = [IoSlice::new(b"hello, "), IoSlice::new(b"world")];
    assert!(matches!(
        so.send(&bufs, &[], MsgFlags::empty()),
        Err(SockError::NotConnected)
    ));
    so.connect(&inet(80), MsgFlags::empty()).unwrap();
    assert_eq!(so.send(&bufs, &[], MsgFlags::empty()).unwrap(), 12);
    assert_eq!(so.send_record(b"!".to_vec(), &[], MsgFlags::empty(), None).unwrap(), 1);
    assert_eq!(probe.sent(), b"hello, world!");
}

#[test]
fn test_send_traffic_class() {
    let (stack, probe) = stack(None);
    let so = connected(&stack);
    so.set_traffic_class(TrafficClass::Vi).unwrap();
    so.send(&[IoSlice::new(b"a")], &[], MsgFlags::empty()).unwrap();
    assert_eq!(*probe.last_class.lock().unwrap(), Some(TrafficClass::Vi));

    let records = [Ancillary::TrafficClass(TrafficClass::Vo)];
    so.send(&[IoSlice::new(b"b")], &records, MsgFlags::empty()).unwrap();
    assert_eq!(*probe.last_class.lock().unwrap(), Some(TrafficClass::Vo));
    assert_eq!(*probe.last_control.lock().unwrap(), control::encode(&records));
}

#[test]
fn test_partial_send_nonblocking() {
    let (stack, probe) = stack(None);
    let so = connected(&stack);
    probe.limit(4);
    let data = b"0123456789";
    let n = so.send(&[IoSlice::new(data)], &[], MsgFlags::DONTWAIT).unwrap();
    assert_eq!(n, 4);
    assert!(matches!(
        so.send(&[IoSlice::new(&data[n..])], &[], MsgFlags::DONTWAIT),
        Err(SockError::WouldBlock)
    ));
    probe.grant(&so, 100);
    let m = so.send(&[IoSlice::new(&data[n..])], &[], MsgFlags::DONTWAIT).unwrap();
    assert_eq!(n + m, data.len());
    assert_eq!(probe.sent(), data);
}

#[test]
fn test_blocking_send_resumes_on_space() {
    let (stack, probe) = stack(None);
    let so = connected(&stack);
    probe.limit(3);
    let sender = so.clone();
    let handle = thread::spawn(move || {
        sender.send(&[IoSlice::new(b"abcdefgh")], &[], MsgFlags::empty())
    });
    while probe.sent().len() < 3 {
        thread::sleep(Duration::from_millis(1));
    }
    probe.grant(&so, 5);
    assert_eq!(handle.join().unwrap().unwrap(), 8);
    assert_eq!(probe.sent(), b"abcdefgh");
}

#[test]
fn test_send_timeout_and_interrupt_keep_progress() {
    let (stack, probe) = stack(None);
    let so = connected(&stack);
    set_timeout(&so, SO_SNDTIMEO, 20);
    probe.limit(0);
    assert!(matches!(
        so.send(&[IoSlice::new(b"xyz")], &[], MsgFlags::empty()),
        Err(SockError::WouldBlock)
    ));

    set_timeout(&so, SO_SNDTIMEO, 0);
    probe.limit(2);
    let sender = so.clone();
    let handle = thread::spawn(move || {
        sender.send(&[IoSlice::new(b"xyz")], &[], MsgFlags::empty())
    });
    let sent = poke_until_done(handle, || so.interrupt());
    assert_eq!(sent.unwrap(), 2);
    assert_eq!(probe.sent(), b"xy");
}

#[test]
fn test_send_record_is_atomic() {
    let (stack, probe) = stack(None);
    let so = connected(&stack);
    probe.limit(3);
    assert!(matches!(
        so.send_record(b"toolong".to_vec(), &[], MsgFlags::DONTWAIT, None),
        Err(SockError::WouldBlock)
    ));
    assert!(probe.sent().is_empty());
}

#[test]
fn test_receive_scatter_and_eof() {
    let (stack, probe) = stack(None);
    let so = connected(&stack);
    assert!(matches!(
        so.receive(&mut [IoSliceMut::new(&mut [0u8; 4])], MsgFlags::DONTWAIT),
        Err(SockError::WouldBlock)
    ));

    probe.feed(&so, b"hello");
    assert_eq!(so.available(), 5);
    let (mut a, mut b) = ([0u8; 3], [0u8; 8]);
    let got = so
        .receive(&mut [IoSliceMut::new(&mut a), IoSliceMut::new(&mut b)], MsgFlags::empty())
        .unwrap();
    assert_eq!(got.bytes, 5);
    assert_eq!(&a, b"hel");
    assert_eq!(&b[..2], b"lo");
    assert_eq!(so.available(), 0);

    probe.eof.store(true, Ordering::SeqCst);
    so.mark_eof();
    let got = so.receive(&mut [IoSliceMut::new(&mut a)], MsgFlags::empty()).unwrap();
    assert_eq!(got.bytes, 0);
}

#[test]
fn test_receive_peek() {
    let (stack, probe) = stack(None);
    let so = connected(&stack);
    probe.feed(&so, b"abc");
    let mut buf = [0u8; 8];
    let got = so.receive(&mut [IoSliceMut::new(&mut buf)], MsgFlags::PEEK).unwrap();
    assert_eq!(got.bytes, 3);
    let got = so.receive(&mut [IoSliceMut::new(&mut buf)], MsgFlags::empty()).unwrap();
    assert_eq!(got.bytes, 3);
    assert_eq!(&buf[..3], b"abc");
}

#[test]
fn test_receive_waitall() {
    let (stack, probe) = stack(None);
    let so = connected(&stack);
    probe.feed(&so, b"ab");
    let receiver = so.clone();
    let handle = thread::spawn(move || {
        let mut buf = [0u8; 5];
        let got = receiver
            .receive(&mut [IoSliceMut::new(&mut buf)], MsgFlags::WAITALL)
            .unwrap();
        (got.bytes, buf)
    });
    thread::sleep(Duration::from_millis(20));
    probe.feed(&so, b"cd");
    thread::sleep(Duration::from_millis(20));
    probe.feed(&so, b"efg");
    let (bytes, buf) = handle.join().unwrap();
    assert_eq!(bytes, 5);
    assert_eq!(&buf, b"abcde");
    assert_eq!(so.available(), 2);
}

#[test]
fn test_blocking_receive_wakes_on_data() {
    let (stack, probe) = stack(None);
    let so = connected(&stack);
    let receiver = so.clone();
    let handle = thread::spawn(move || {
        let mut buf = [0u8; 16];
        let got = receiver.receive(&mut [IoSliceMut::new(&mut buf)], MsgFlags::empty());
        got.map(|r| buf[..r.bytes].to_vec())
    });
    thread::sleep(Duration::from_millis(20));
    probe.feed(&so, b"late");
    assert_eq!(handle.join().unwrap().unwrap(), b"late");
}

#[test]
fn test_receive_timeout_and_interrupt() {
    let (stack, _) = stack(None);
    let so = connected(&stack);
    set_timeout(&so, SO_RCVTIMEO, 20);
    let mut buf = [0u8; 4];
    assert!(matches!(
        so.receive(&mut [IoSliceMut::new(&mut buf)], MsgFlags::empty()),
        Err(SockError::WouldBlock)
    ));

    set_timeout(&so, SO_RCVTIMEO, 0);
    let receiver = so.clone();
    let handle = thread::spawn(move || {
        let mut buf = [0u8; 4];
        receiver
            .receive(&mut [IoSliceMut::new(&mut buf)], MsgFlags::empty())
            .map(|r| r.bytes)
    });
    let got = poke_until_done(handle, || so.interrupt());
    assert!(matches!(got, Err(SockError::Interrupted)));
}

#[test]
fn test_nointerrupt_ignores_interrupt() {
    let (stack, _) = stack(None);
    let so = connected(&stack);
    so.set_nointerrupt(true);
    set_timeout(&so, SO_RCVTIMEO, 60);
    let receiver = so.clone();
    let handle = thread::spawn(move || {
        let mut buf = [0u8; 4];
        receiver
            .receive(&mut [IoSliceMut::new(&mut buf)], MsgFlags::empty())
            .map(|r| r.bytes)
    });
    let got = poke_until_done(handle, || so.interrupt());
    assert!(matches!(got, Err(SockError::WouldBlock)));
}

#[test]
fn test_pending_error_reaches_blocked_receiver() {
    let (stack, _) = stack(None);
    let so = connected(&stack);
    let receiver = so.clone();
    let handle = thread::spawn(move || {
        let mut buf = [0u8; 4];
        receiver
            .receive(&mut [IoSliceMut::new(&mut buf)], MsgFlags::empty())
            .map(|r| r.bytes)
    });
    let got = poke_until_done(handle, || so.post_error(SockError::ConnectionAborted));
    assert!(matches!(got, Err(SockError::ConnectionAborted)));
}

#[test]
fn test_shutdown_directions() {
    let (stack, probe) = stack(None);
    let idle = stack.create(Domain::Inet, SockType::Stream, 0).unwrap();
    assert!(matches!(idle.shutdown(Shutdown::Both), Err(SockError::NotConnected)));

    let so = connected(&stack);
    so.shutdown(Shutdown::Write).unwrap();
    assert_eq!(so.state(), SockState::Closing);
    assert!(matches!(
        so.send(&[IoSlice::new(b"x")], &[], MsgFlags::empty()),
        Err(SockError::BrokenPipe)
    ));
    probe.feed(&so, b"still readable");
    let mut buf = [0u8; 32];
    let got = so.receive(&mut [IoSliceMut::new(&mut buf)], MsgFlags::empty()).unwrap();
    assert_eq!(got.bytes, 14);

    so.shutdown(Shutdown::Read).unwrap();
    probe.feed(&so, b"dropped");
    let got = so.receive(&mut [IoSliceMut::new(&mut buf)], MsgFlags::empty()).unwrap();
    assert_eq!(got.bytes, 0);
    assert_eq!(probe.shutdowns.load(Ordering::SeqCst), 2);
}

#[test]
fn test_shutdown_wakes_blocked_receiver() {
    let (stack, _) = stack(None);
    let so = connected(&stack);
    let receiver = so.clone();
    let handle = thread::spawn(move || {
        let mut buf = [0u8; 4];
        receiver
            .receive(&mut [IoSliceMut::new(&mut buf)], MsgFlags::empty())
            .map(|r| r.bytes)
    });
    thread::sleep(Duration::from_millis(20));
    so.shutdown(Shutdown::Read).unwrap();
    assert_eq!(handle.join().unwrap().unwrap(), 0);
}

#[test]
fn test_defunct_fails_fast() {
    let (stack, probe) = stack(None);
    let so = connected(&stack);
    let receiver = so.clone();
    let handle = thread::spawn(move || {
        let mut buf = [0u8; 4];
        receiver
            .receive(&mut [IoSliceMut::new(&mut buf)], MsgFlags::empty())
            .map(|r| r.bytes)
    });
    thread::sleep(Duration::from_millis(20));
    so.set_defunct().unwrap();
    assert!(matches!(handle.join().unwrap(), Err(SockError::Defunct)));

    assert_eq!(so.state(), SockState::Defunct);
    assert!(matches!(
        so.send(&[IoSlice::new(b"x")], &[], MsgFlags::empty()),
        Err(SockError::Defunct)
    ));
    assert!(matches!(so.bind(&inet(1)), Err(SockError::Defunct)));
    assert!(matches!(so.listen(1), Err(SockError::Defunct)));
    assert!(matches!(so.shutdown(Shutdown::Both), Err(SockError::Defunct)));
    assert!(matches!(so.connectwait(None), Err(SockError::Defunct)));
    assert!(matches!(so.set_priv(true), Err(SockError::Defunct)));
    assert!(matches!(so.peer_address(), Err(SockError::Defunct)));
    so.set_defunct().unwrap();
    assert_eq!(probe.shutdowns.load(Ordering::SeqCst), 1);
    so.close().unwrap();
    assert_eq!(probe.closes(), 1);
}

#[test]
fn test_defunct_listener_drops_queue() {
    let (stack, probe) = stack(None);
    let ls = stack.create(Domain::Inet, SockType::Stream, 0).unwrap();
    ls.bind(&inet(9100)).unwrap();
    ls.listen(4).unwrap();
    let child = ls.spawn_connection(super::support::handler(&probe)).unwrap();
    child.set_connected(None).unwrap();
    ls.set_defunct().unwrap();
    assert!(child.is_destroyed());
    assert_eq!(ls.accept_queue_len(), 0);
    assert!(matches!(ls.accept(MsgFlags::empty()), Err(SockError::Defunct)));
}

#[test]
fn test_unconnected_datagram_send() {
    let (stack, probe) = stack(None);
    let so = stack.create(Domain::Inet, SockType::Datagram, 0).unwrap();
    assert!(matches!(
        so.send(&[IoSlice::new(b"x")], &[], MsgFlags::empty()),
        Err(SockError::NotConnected)
    ));
    let n = so
        .send_to(&[IoSlice::new(b"ping")], &[], MsgFlags::empty(), &inet(53))
        .unwrap();
    assert_eq!(n, 4);
    assert!(matches!(
        so.send_to(&[IoSlice::new(b"x")], &[], MsgFlags::empty(), &local_addr("x")),
        Err(SockError::AddressFamilyUnsupported)
    ));
    assert_eq!(probe.sent(), b"ping");
}
