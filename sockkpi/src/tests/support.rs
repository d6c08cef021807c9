#![cfg(test)]

// In-memory protocol used by the unit tests. Every socket of a test stack shares one `Probe`,
// through which a test scripts the protocol's answers and observes what it was asked to do.

use crate::*;
use std::collections::VecDeque;
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const PROBE_LEVEL: u32 = libc::IPPROTO_TCP as u32;
pub const PROBE_OPT: u32 = 1;
pub const PROBE_VALUE: i32 = 42;

#[derive(Default)]
pub struct Probe {
    /// `connect` answers `Pending` instead of `Complete`.
    pub pending: AtomicBool,
    /// `connect` fails with `AddressUnavailable`.
    pub refuse: AtomicBool,
    /// Bytes `send` may still take; `None` is unlimited.
    pub budget: Mutex<Option<usize>>,
    pub sent: Mutex<Vec<u8>>,
    pub inbox: Mutex<VecDeque<u8>>,
    pub eof: AtomicBool,
    pub last_class: Mutex<Option<TrafficClass>>,
    pub last_control: Mutex<Vec<u8>>,
    pub shutdowns: AtomicUsize,
    pub closes: AtomicUsize,
}

impl Probe {
    /// Queues incoming bytes and tells the socket about them.
    pub fn feed(&self, so: &Socket, data: &[u8]) {
        let queued = {
            let mut inbox = self.inbox.lock().unwrap();
            inbox.extend(data.iter().copied());
            inbox.len()
        };
        so.wakeup_read(queued);
    }

    /// Allows `n` more bytes to be sent and tells the socket.
    pub fn grant(&self, so: &Socket, n: usize) {
        {
            let mut budget = self.budget.lock().unwrap();
            *budget = Some(budget.unwrap_or(0) + n);
        }
        so.wakeup_write(n);
    }

    pub fn limit(&self, n: usize) {
        *self.budget.lock().unwrap() = Some(n);
    }

    pub fn sent(&self) -> Vec<u8> {
        self.sent.lock().unwrap().clone()
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

pub struct TestProto(pub Arc<Probe>);

impl ProtocolHandler for TestProto {
    fn bind(&self, _so: &Socket, addr: &SockAddr) -> SockResult<SockAddr> {
        Ok(addr.clone())
    }

    fn connect(&self, _so: &Socket, _addr: &SockAddr) -> SockResult<Handshake> {
        if self.0.refuse.load(Ordering::SeqCst) {
            return Err(SockError::AddressUnavailable);
        }
        if self.0.pending.load(Ordering::SeqCst) {
            return Ok(Handshake::Pending);
        }
        Ok(Handshake::Complete(None))
    }

    fn control(&self, _so: &Socket, request: Control<'_>) -> SockResult<()> {
        match request {
            Control::Option(opt) if opt.level == PROBE_LEVEL && opt.name == PROBE_OPT => {
                if opt.direction == OptDirection::Get {
                    opt.put_int(PROBE_VALUE);
                }
                Ok(())
            }
            _ => Err(SockError::Unsupported),
        }
    }

    fn send(&self, _so: &Socket, payload: &mut Payload<'_>, meta: &SendMeta) -> Transfer {
        *self.0.last_class.lock().unwrap() = Some(meta.traffic_class);
        *self.0.last_control.lock().unwrap() = meta.control.clone();
        let mut budget = self.0.budget.lock().unwrap();
        let allowed = budget.unwrap_or(usize::MAX);
        if allowed == 0 || (payload.is_atomic() && payload.remaining() > allowed) {
            return Transfer::failed(SockError::WouldBlock);
        }
        let data = payload.peek(allowed);
        if let Some(left) = budget.as_mut() {
            *left -= data.len();
        }
        self.0.sent.lock().unwrap().extend_from_slice(&data);
        Transfer::done(data.len())
    }

    fn receive(&self, so: &Socket, sink: &mut Sink<'_, '_>, meta: &mut RecvMeta) -> Transfer {
        let mut inbox = self.0.inbox.lock().unwrap();
        if inbox.is_empty() {
            return if self.0.eof.load(Ordering::SeqCst) {
                Transfer::done(0)
            } else {
                Transfer::failed(SockError::WouldBlock)
            };
        }
        let (front, back) = inbox.as_slices();
        let (mut n, _) = sink.fill(front);
        if n == front.len() && !back.is_empty() {
            n += sink.fill(back).0;
        }
        if !meta.request.contains(MsgFlags::PEEK) {
            inbox.drain(..n);
        }
        let left = inbox.len();
        drop(inbox);
        so.set_available(left);
        Transfer::done(n)
    }

    fn shutdown(&self, _so: &Socket, _how: Shutdown) -> SockResult<()> {
        self.0.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self, _so: &Socket) {
        self.0.closes.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A stack with the local protocols plus the probe protocol on Inet stream and datagram.
pub fn stack(config: Option<KpiConfig>) -> (Stack, Arc<Probe>) {
    init_logger();
    let probe = Arc::new(Probe::default());
    let (streams, dgrams) = (probe.clone(), probe.clone());
    let registry = local::register(Registry::builder())
        .register(
            Domain::Inet,
            SockType::Stream,
            libc::IPPROTO_TCP,
            move |_kind: SockKind| -> SockResult<Arc<dyn ProtocolHandler>> {
                Ok(Arc::new(TestProto(streams.clone())))
            },
        )
        .register(
            Domain::Inet,
            SockType::Datagram,
            libc::IPPROTO_UDP,
            move |_kind: SockKind| -> SockResult<Arc<dyn ProtocolHandler>> {
                Ok(Arc::new(TestProto(dgrams.clone())))
            },
        )
        .build();
    (Stack::new(registry, config), probe)
}

pub fn handler(probe: &Arc<Probe>) -> Arc<dyn ProtocolHandler> {
    Arc::new(TestProto(probe.clone()))
}

pub fn inet(port: u16) -> SockAddr {
    SockAddr::inet(SocketAddr::from(([127, 0, 0, 1], port)))
}

pub fn local_addr(name: &str) -> SockAddr {
    SockAddr::local(name).unwrap()
}

pub fn int(raw: &[u8]) -> i32 {
    i32::from_ne_bytes(raw[..4].try_into().unwrap())
}

/// A connected probe stream socket.
pub fn connected(stack: &Stack) -> Socket {
    let so = stack.create(Domain::Inet, SockType::Stream, 0).unwrap();
    so.connect(&inet(80), MsgFlags::empty()).unwrap();
    so
}
