//! A protocol whose answers are scripted by the test that uses it.
//!
//! Every socket created from one `Script` shares it, so a test can queue the outcome of the next
//! `connect` or `send` and then inspect what the socket layer asked the protocol to do.

use sockkpi::{
    Handshake, MsgFlags, Payload, ProtocolHandler, RecvMeta, SendMeta, Sink, SockAddr,
    SockError, SockResult, Socket, Transfer,
};
use std::collections::VecDeque;
use std::net::Shutdown;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Outcome of the next `connect`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ConnectPlan {
    #[default]
    Complete,
    /// The handshake stays open until the test calls `set_connected` or `set_disconnected`.
    Pending,
    /// Fails with `AddressUnavailable`.
    Refuse,
}

/// Behaviour of one `send` call.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SendStep {
    /// Take at most this many bytes.
    Accept(usize),
    /// Take at most this many bytes, then report an interruption.
    AcceptThenInterrupt(usize),
    /// Take nothing until the test signals send space.
    Block,
}

#[derive(Default)]
pub struct Script {
    connect: Mutex<ConnectPlan>,
    steps: Mutex<VecDeque<SendStep>>,
    sent: Mutex<Vec<u8>>,
    incoming: Mutex<VecDeque<u8>>,
    eof: AtomicBool,
    send_calls: AtomicUsize,
    shutdowns: AtomicUsize,
    closes: AtomicUsize,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Script {
    pub fn new() -> Arc<Self> {
        Arc::new(Script::default())
    }

    pub fn plan_connect(&self, plan: ConnectPlan) {
        *lock(&self.connect) = plan;
    }

    /// Queues send behaviour. Once the queue is empty every call takes all it is given.
    pub fn plan_sends(&self, steps: &[SendStep]) {
        lock(&self.steps).extend(steps.iter().copied());
    }

    /// Drops queued send steps and signals send space to `so`.
    pub fn unblock(&self, so: &Socket) {
        lock(&self.steps).clear();
        so.wakeup_write(usize::MAX);
    }

    /// Makes `data` readable on `so`.
    pub fn deliver(&self, so: &Socket, data: &[u8]) {
        let queued = {
            let mut incoming = lock(&self.incoming);
            incoming.extend(data.iter().copied());
            incoming.len()
        };
        so.wakeup_read(queued);
    }

    /// Ends the incoming stream of `so` once buffered data is read.
    pub fn finish(&self, so: &Socket) {
        self.eof.store(true, Ordering::SeqCst);
        so.mark_eof();
    }

    pub fn sent(&self) -> Vec<u8> {
        lock(&self.sent).clone()
    }

    pub fn send_calls(&self) -> usize {
        self.send_calls.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

/// The handler attached to each scripted socket.
pub struct Scripted(pub Arc<Script>);

impl ProtocolHandler for Scripted {
    fn bind(&self, _so: &Socket, addr: &SockAddr) -> SockResult<SockAddr> {
        Ok(addr.clone())
    }

    fn connect(&self, _so: &Socket, _addr: &SockAddr) -> SockResult<Handshake> {
        match *lock(&self.0.connect) {
            ConnectPlan::Complete => Ok(Handshake::Complete(None)),
            ConnectPlan::Pending => Ok(Handshake::Pending),
            ConnectPlan::Refuse => Err(SockError::AddressUnavailable),
        }
    }

    fn send(&self, _so: &Socket, payload: &mut Payload<'_>, _meta: &SendMeta) -> Transfer {
        self.0.send_calls.fetch_add(1, Ordering::SeqCst);
        let step = lock(&self.0.steps).pop_front();
        let (limit, interrupt) = match step {
            None => (usize::MAX, false),
            Some(SendStep::Accept(n)) => (n, false),
            Some(SendStep::AcceptThenInterrupt(n)) => (n, true),
            Some(SendStep::Block) => {
                lock(&self.0.steps).push_front(SendStep::Block);
                return Transfer::failed(SockError::WouldBlock);
            }
        };
        if payload.is_atomic() && payload.remaining() > limit {
            return Transfer::failed(SockError::WouldBlock);
        }
        let data = payload.peek(limit);
        lock(&self.0.sent).extend_from_slice(&data);
        log::trace!("scripted: took {} bytes", data.len());
        if interrupt {
            Transfer::partial(data.len(), SockError::Interrupted)
        } else {
            Transfer::done(data.len())
        }
    }

    fn receive(&self, so: &Socket, sink: &mut Sink<'_, '_>, meta: &mut RecvMeta) -> Transfer {
        let mut incoming = lock(&self.0.incoming);
        if incoming.is_empty() {
            return if self.0.eof.load(Ordering::SeqCst) {
                Transfer::done(0)
            } else {
                Transfer::failed(SockError::WouldBlock)
            };
        }
        let (front, back) = incoming.as_slices();
        let (mut n, _) = sink.fill(front);
        if n == front.len() && !back.is_empty() {
            n += sink.fill(back).0;
        }
        if !meta.request.contains(MsgFlags::PEEK) {
            incoming.drain(..n);
        }
        let left = incoming.len();
        drop(incoming);
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
