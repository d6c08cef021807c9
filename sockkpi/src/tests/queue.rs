#![cfg(test)]

use super::support::{handler, inet, stack};
use crate::*;
use std::net::Shutdown;

fn listener(stack: &Stack, backlog: u32) -> Socket {
    let so = stack.create(Domain::Inet, SockType::Stream, 0).unwrap();
    so.bind(&inet(9000)).unwrap();
    so.listen(backlog).unwrap();
    so
}

#[test]
fn test_accept_in_completion_order() {
    let (stack, probe) = stack(None);
    let ls = listener(&stack, 8);
    let c1 = ls.spawn_connection(handler(&probe)).unwrap();
    let c2 = ls.spawn_connection(handler(&probe)).unwrap();
    let c3 = ls.spawn_connection(handler(&probe)).unwrap();
    assert_eq!(ls.accept_queue_len(), 3);
    assert_eq!(c1.state(), SockState::Connecting);
    assert_eq!(c1.listener(), Some(ls.clone()));

    assert!(matches!(ls.accept(MsgFlags::DONTWAIT), Err(SockError::WouldBlock)));

    c2.set_connected(Some(inet(40002))).unwrap();
    c1.set_connected(Some(inet(40001))).unwrap();
    c3.set_connected(Some(inet(40003))).unwrap();

    let order: Vec<u64> = (0..3)
        .map(|_| ls.accept(MsgFlags::DONTWAIT).unwrap().id())
        .collect();
    assert_eq!(order, vec![c2.id(), c1.id(), c3.id()]);
    assert_eq!(ls.accept_queue_len(), 0);
    assert!(matches!(ls.accept(MsgFlags::DONTWAIT), Err(SockError::WouldBlock)));

    assert_eq!(c1.listener(), None);
    assert_eq!(c1.peer_address().unwrap(), inet(40001));
    assert_eq!(c1.local_address().unwrap(), inet(9000));
}

#[test]
fn test_backlog_limit() {
    let (stack, probe) = stack(None);
    let ls = listener(&stack, 1);
    let first = ls.spawn_connection(handler(&probe)).unwrap();
    let full = ls.spawn_connection(handler(&probe));
    assert!(matches!(full, Err(SockError::ResourceExhausted)));
    // The rejected child was created and destroyed.
    assert_eq!(stack.stats().created, 3);
    assert_eq!(stack.stats().destroyed, 1);
    assert_eq!(probe.closes(), 1);

    first.set_connected(None).unwrap();
    assert!(ls.spawn_connection(handler(&probe)).is_err());
    let accepted = ls.accept(MsgFlags::empty()).unwrap();
    assert_eq!(accepted, first);
    assert!(ls.spawn_connection(handler(&probe)).is_ok());
}

#[test]
fn test_backlog_is_clamped() {
    let config = KpiConfig {
        max_backlog: Some(2),
        ..KpiConfig::default()
    };
    let (stack, probe) = stack(Some(config));
    let ls = listener(&stack, 100);
    ls.spawn_connection(handler(&probe)).unwrap();
    ls.spawn_connection(handler(&probe)).unwrap();
    assert!(matches!(
        ls.spawn_connection(handler(&probe)),
        Err(SockError::ResourceExhausted)
    ));
}

#[test]
fn test_failed_handshake_leaves_queue() {
    let (stack, probe) = stack(None);
    let ls = listener(&stack, 4);
    let child = ls.spawn_connection(handler(&probe)).unwrap();
    child.set_disconnected(Some(SockError::ConnectionAborted)).unwrap();
    assert!(child.is_destroyed());
    assert_eq!(ls.accept_queue_len(), 0);
    assert_eq!(probe.closes(), 1);
}

#[test]
fn test_reset_after_completion_leaves_queue() {
    let (stack, probe) = stack(None);
    let ls = listener(&stack, 4);
    let child = ls.spawn_connection(handler(&probe)).unwrap();
    child.set_connected(None).unwrap();
    child.set_disconnected(Some(SockError::ConnectionAborted)).unwrap();
    assert!(child.is_destroyed());
    assert!(matches!(ls.accept(MsgFlags::DONTWAIT), Err(SockError::WouldBlock)));
}

#[test]
fn test_close_listener_destroys_queued() {
    let (stack, probe) = stack(None);
    let ls = listener(&stack, 4);
    let done = ls.spawn_connection(handler(&probe)).unwrap();
    let embryo = ls.spawn_connection(handler(&probe)).unwrap();
    done.set_connected(None).unwrap();
    ls.close().unwrap();
    assert!(done.is_destroyed());
    assert!(embryo.is_destroyed());
    assert!(ls.is_destroyed());
    assert_eq!(probe.closes(), 3);
    assert_eq!(stack.stats().destroyed, 3);
    assert_eq!(stack.stats().open, 0);
}

#[test]
fn test_accept_state_errors() {
    let (stack, probe) = stack(None);
    let so = stack.create(Domain::Inet, SockType::Stream, 0).unwrap();
    assert!(matches!(so.accept(MsgFlags::DONTWAIT), Err(SockError::InvalidArgument)));
    assert!(matches!(
        so.spawn_connection(handler(&probe)),
        Err(SockError::InvalidArgument)
    ));

    let dg = stack.create(Domain::Inet, SockType::Datagram, 0).unwrap();
    assert!(matches!(dg.listen(4), Err(SockError::Unsupported)));

    let ls = listener(&stack, 4);
    ls.shutdown(Shutdown::Both).unwrap();
    assert!(matches!(ls.accept(MsgFlags::empty()), Err(SockError::ConnectionAborted)));
    assert!(matches!(
        ls.spawn_connection(handler(&probe)),
        Err(SockError::ConnectionAborted)
    ));
}

#[test]
fn test_accepted_child_setup() {
    let (stack, probe) = stack(None);
    let ls = listener(&stack, 4);
    ls.set_traffic_class(TrafficClass::Vi).unwrap();
    ls.setsockopt(options::SOL_SOCKET, options::SO_KEEPALIVE, &1i32.to_ne_bytes())
        .unwrap();
    let child = ls.spawn_connection(handler(&probe)).unwrap();
    child.set_connected(None).unwrap();
    assert_eq!(stack.stats().open, 1);

    let child = ls.accept(MsgFlags::empty()).unwrap();
    assert_eq!(stack.stats().open, 2);
    assert_eq!(child.traffic_class(), TrafficClass::Vi);
    let keepalive = child
        .getsockopt(options::SOL_SOCKET, options::SO_KEEPALIVE, 4)
        .unwrap();
    assert_eq!(keepalive, 1i32.to_ne_bytes());
    let acceptconn = child
        .getsockopt(options::SOL_SOCKET, options::SO_ACCEPTCONN, 4)
        .unwrap();
    assert_eq!(acceptconn, 0i32.to_ne_bytes());
    assert_eq!(child.owner(), std::process::id());

    child.close().unwrap();
    assert!(child.is_destroyed());
    assert!(!ls.is_destroyed());
}
