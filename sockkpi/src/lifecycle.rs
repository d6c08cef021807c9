//! # Socket Lifecycle
//!
//! ## Purpose
//!
//! The public operations on a socket: bind, listen, connect, connectwait, accept, send,
//! receive, shutdown, close, retain, release, set_priv and set_defunct. Each one sequences the
//! socket lock, the protocol handler and the blocking waits.
//!
//! ## How it works
//!
//! Every operation takes the socket lock, checks the state, and delegates to the protocol
//! handler through `with_unlocked`. On re-entry the socket is re-validated; `Defunct` wins
//! over whatever the handler returned. Blocking operations park on the socket's condition
//! variable in a loop that re-checks its predicate, the pending error, shutdown, defunct,
//! interruption and the deadline on every wake-up.
//!
//! Reference counting follows a single rule: destruction happens in `teardown`, which is
//! reached either from `close` with no outstanding retains or from the `release` that brings
//! the count back to the minimum after the descriptor is gone.
//!
//! ## Main components
//!
//! - `impl Socket`: the lifecycle operations.
//! - `Received`: what a receive call reports besides the data.

use crate::addr::SockAddr;
use crate::buffer::{IoVec, IoVecMut, Payload, Sink};
use crate::control::{self, Ancillary};
use crate::error::{SockError, SockResult};
use crate::proto::{Handshake, MsgFlags, RecvMeta, SendMeta};
use crate::socket::{BufFlags, CoreGuard, OptFlags, SockState, Socket, Wait};
use crate::upcall::{Notify, SockEvents};
use std::io::{IoSlice, IoSliceMut};
use std::net::Shutdown;
use std::sync::atomic::Ordering;
use std::time::Duration;

/// Metadata of a completed receive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Received {
    /// Bytes stored into the caller's buffers. 0 with no error means end of stream.
    pub bytes: usize,
    /// Source address, for datagram protocols.
    pub from: Option<SockAddr>,
    pub control: Vec<Ancillary>,
    /// `TRUNC`, `CTRUNC`, `EOR` or `OOB` as reported for this call.
    pub flags: MsgFlags,
}

fn partial(sent: usize, error: SockError) -> SockResult<usize> {
    if sent > 0 && error.is_transient() {
        Ok(sent)
    } else {
        Err(error)
    }
}

impl Socket {
    /// Binds the socket to a local address.
    ///
    /// The state passes through `Binding` while the protocol works and returns to `Closed`;
    /// a bound, unconnected socket is `Closed` with a local address.
    pub fn bind(&self, addr: &SockAddr) -> SockResult<()> {
        addr.validate(self.0.kind.domain)?;
        let mut core = self.lock();
        core.check_alive()?;
        match core.state {
            SockState::Closed if core.local_addr.is_none() => {}
            SockState::Binding => return Err(SockError::AlreadyInProgress),
            _ => return Err(SockError::InvalidArgument),
        }
        core.state = SockState::Binding;
        core.last_pid = std::process::id();

        let (mut core, bound) = self.with_unlocked(core, || self.0.handler.bind(self, addr));
        core.check_alive()?;
        core.state = SockState::Closed;
        let bound = bound?;
        log::debug!("socket {}: bound to {bound}", self.id());
        core.local_addr = Some(bound);
        Ok(())
    }

    /// Starts accepting connections.
    ///
    /// # Arguments
    /// * `backlog` - Maximum queued connections; clamped to the configured maximum, and 0
    ///   selects that maximum. Calling `listen` again on a listener updates the backlog.
    pub fn listen(&self, backlog: u32) -> SockResult<()> {
        if !self.0.kind.ty.is_connection_oriented() {
            return Err(SockError::Unsupported);
        }
        let max = self.0.env.settings.max_backlog;
        let backlog = if backlog == 0 { max } else { backlog.min(max) };

        let core = self.lock();
        core.check_alive()?;
        match core.state {
            SockState::Closed | SockState::Listening => {}
            SockState::Binding => return Err(SockError::AlreadyInProgress),
            _ => return Err(SockError::InvalidArgument),
        }
        let (mut core, result) =
            self.with_unlocked(core, || self.0.handler.listen(self, backlog));
        core.check_alive()?;
        result?;
        if !matches!(core.state, SockState::Closed | SockState::Listening) {
            return Err(SockError::InvalidArgument);
        }
        core.state = SockState::Listening;
        core.options.insert(OptFlags::ACCEPTCONN);
        core.backlog = backlog;
        self.0.queue.acquire().set_limit(backlog as usize);
        log::debug!("socket {}: listening, backlog {backlog}", self.id());
        Ok(())
    }

    /// Connects to `addr`.
    ///
    /// A handshake that does not complete synchronously leaves the socket `Connecting`. A
    /// non-blocking socket (or `DONTWAIT`) then returns `InProgress`; a blocking one waits for
    /// the outcome, returning `InProgress` if its timeout elapses first.
    pub fn connect(&self, addr: &SockAddr, flags: MsgFlags) -> SockResult<()> {
        addr.validate(self.0.kind.domain)?;
        let mut core = self.lock();
        core.check_alive()?;
        match core.state {
            SockState::Closed => {}
            SockState::Connecting => return Err(SockError::AlreadyInProgress),
            SockState::Connected => return Err(SockError::AlreadyConnected),
            _ => return Err(SockError::InvalidArgument),
        }
        core.state = SockState::Connecting;
        core.pending_error = None;
        core.peer_addr = Some(addr.clone());
        core.last_pid = std::process::id();
        let nonblocking = core.nonblocking || flags.contains(MsgFlags::DONTWAIT);
        let timeout = core.snd.timeout;
        log::debug!("socket {}: connecting to {addr}", self.id());

        let (mut core, outcome) = self.with_unlocked(core, || self.0.handler.connect(self, addr));
        core.check_alive()?;
        match outcome {
            Err(e) => {
                if core.state == SockState::Connecting {
                    core.state = SockState::Closed;
                    core.peer_addr = None;
                }
                log::debug!("socket {}: connect failed: {e}", self.id());
                return Err(e);
            }
            Ok(Handshake::Complete(peer)) => {
                if core.state == SockState::Connecting {
                    core = self.mark_connected(core, peer.or_else(|| Some(addr.clone())));
                }
            }
            Ok(Handshake::Pending) => {}
        }
        self.await_connection(core, nonblocking, timeout)
    }

    /// Waits for a pending connect to resolve.
    ///
    /// # Returns
    /// `Ok` once connected, the connection error if it failed, `InProgress` if `timeout`
    /// elapsed first. `InvalidArgument` when no connect was started.
    pub fn connectwait(&self, timeout: Option<Duration>) -> SockResult<()> {
        let mut core = self.lock();
        core.check_alive()?;
        let state = core.state;
        match state {
            SockState::Connecting => self.await_connection(core, false, timeout),
            SockState::Connected => Ok(()),
            _ => Err(core.pending_error.take().unwrap_or(SockError::InvalidArgument)),
        }
    }

    fn await_connection<'g>(
        &'g self,
        mut core: CoreGuard<'g>,
        nonblocking: bool,
        timeout: Option<Duration>,
    ) -> SockResult<()> {
        let wait = Wait::new(&core, timeout);
        loop {
            core.check_alive()?;
            match core.state {
                SockState::Connected => return Ok(()),
                SockState::Connecting => {}
                _ => {
                    return Err(core
                        .pending_error
                        .take()
                        .unwrap_or(SockError::ConnectionAborted));
                }
            }
            if nonblocking {
                return Err(SockError::InProgress);
            }
            wait.check(&core, || SockError::InProgress)?;
            core = self.park(core, &wait);
        }
    }

    /// Takes the oldest completed connection off a listener.
    ///
    /// The child is unlinked under the accept queue lock and set up after the listener's lock
    /// is dropped: it gets a descriptor reference, the listener's accept upcalls, and the
    /// protocol's `accept` call.
    pub fn accept(&self, flags: MsgFlags) -> SockResult<Socket> {
        let mut core = self.lock();
        core.last_pid = std::process::id();
        let nonblocking = core.nonblocking || flags.contains(MsgFlags::DONTWAIT);
        let wait = Wait::new(&core, core.rcv.timeout);
        let child = loop {
            core.check_alive()?;
            match core.state {
                SockState::Listening => {}
                SockState::Closing => return Err(SockError::ConnectionAborted),
                _ => return Err(SockError::InvalidArgument),
            }
            if let Some(e) = core.pending_error.take() {
                return Err(e);
            }
            if let Some(child) = self.0.queue.acquire().pop() {
                break child;
            }
            if nonblocking {
                return Err(SockError::WouldBlock);
            }
            wait.check(&core, || SockError::WouldBlock)?;
            core = self.park(core, &wait);
        };
        let defaults = core.accept_upcalls.clone();
        drop(core);

        {
            let mut cc = child.lock();
            cc.listener = None;
            cc.fd_ref = true;
            cc.owner_pid = std::process::id();
            if defaults.is_some() {
                cc.upcalls = defaults;
            }
        }
        self.0.env.stats.open.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = child.0.handler.accept(&child) {
            log::debug!("socket {}: protocol refused accepted child: {e}", self.id());
            let mut cc = child.lock();
            cc.fd_ref = false;
            self.0.env.stats.open.fetch_sub(1, Ordering::Relaxed);
            child.teardown(cc);
            return Err(e);
        }
        log::debug!("socket {}: accepted {}", self.id(), child.id());
        Ok(child)
    }

    /// Sends from scatter/gather buffers. Returns the bytes sent, which may be fewer than
    /// requested when the call is interrupted or would block after making progress.
    pub fn send(
        &self,
        bufs: &[IoSlice<'_>],
        control: &[Ancillary],
        flags: MsgFlags,
    ) -> SockResult<usize> {
        let mut payload = Payload::Stream(IoVec::new(bufs));
        self.send_payload(&mut payload, control, flags, None)
    }

    /// Sends to an explicit destination, for datagram protocols.
    pub fn send_to(
        &self,
        bufs: &[IoSlice<'_>],
        control: &[Ancillary],
        flags: MsgFlags,
        to: &SockAddr,
    ) -> SockResult<usize> {
        let mut payload = Payload::Stream(IoVec::new(bufs));
        self.send_payload(&mut payload, control, flags, Some(to))
    }

    /// Sends one whole record. It is delivered entirely or not at all.
    pub fn send_record(
        &self,
        record: Vec<u8>,
        control: &[Ancillary],
        flags: MsgFlags,
        to: Option<&SockAddr>,
    ) -> SockResult<usize> {
        let mut payload = Payload::Record(Some(record));
        self.send_payload(&mut payload, control, flags, to)
    }

    fn send_payload(
        &self,
        payload: &mut Payload<'_>,
        control: &[Ancillary],
        flags: MsgFlags,
        to: Option<&SockAddr>,
    ) -> SockResult<usize> {
        if let Some(to) = to {
            to.validate(self.0.kind.domain)?;
        }
        let mut core = self.lock();
        core.check_alive()?;
        core.last_pid = std::process::id();
        if core.snd.flags.contains(BufFlags::SHUT) {
            return Err(SockError::BrokenPipe);
        }
        if let Some(e) = core.pending_error.take() {
            return Err(e);
        }
        match core.state {
            SockState::Connected | SockState::Closing => {}
            SockState::Closed if to.is_some() && !self.0.kind.ty.is_connection_oriented() => {}
            _ => return Err(SockError::NotConnected),
        }
        let meta = SendMeta {
            flags,
            to: to.cloned(),
            control: control::encode(control),
            traffic_class: control::traffic_class(control).unwrap_or(core.traffic_class),
        };
        let nonblocking = core.nonblocking || flags.contains(MsgFlags::DONTWAIT);
        let wait = Wait::new(&core, core.snd.timeout);
        let mut sent = 0;

        loop {
            let seen = core.snd.generation;
            let (c, transfer) =
                self.with_unlocked(core, || self.0.handler.send(self, payload, &meta));
            core = c;
            payload.advance(transfer.bytes);
            sent += transfer.bytes;
            core.check_alive()?;
            match transfer.status {
                Ok(()) if payload.remaining() == 0 => return Ok(sent),
                Ok(()) if transfer.bytes > 0 => continue,
                Ok(()) | Err(SockError::WouldBlock) => {}
                Err(e) => return partial(sent, e),
            }

            if nonblocking {
                return partial(sent, SockError::WouldBlock);
            }
            while core.snd.generation == seen {
                if core.snd.flags.contains(BufFlags::SHUT) {
                    if sent > 0 {
                        return Ok(sent);
                    }
                    return Err(SockError::BrokenPipe);
                }
                if core.pending_error.is_some() {
                    if sent > 0 {
                        return Ok(sent);
                    }
                    return Err(core.pending_error.take().unwrap_or(SockError::NotConnected));
                }
                if let Err(e) = wait.check(&core, || SockError::WouldBlock) {
                    return partial(sent, e);
                }
                core = self.park(core, &wait);
            }
        }
    }

    /// Receives into scatter/gather buffers.
    ///
    /// Returns as soon as some data arrived, unless `WAITALL` asks for the buffers to be
    /// filled. `bytes == 0` without an error means end of stream.
    pub fn receive(&self, bufs: &mut [IoSliceMut<'_>], flags: MsgFlags) -> SockResult<Received> {
        let mut sink = Sink::Stream(IoVecMut::new(bufs));
        self.receive_into(&mut sink, flags)
    }

    /// Receives one whole record, truncated to `limit` bytes (reported with `TRUNC`).
    pub fn receive_record(
        &self,
        limit: usize,
        flags: MsgFlags,
    ) -> SockResult<(Vec<u8>, Received)> {
        let mut sink = Sink::record(limit);
        let received = self.receive_into(&mut sink, flags)?;
        Ok((sink.into_record().unwrap_or_default(), received))
    }

    fn receive_into(&self, sink: &mut Sink<'_, '_>, flags: MsgFlags) -> SockResult<Received> {
        let mut core = self.lock();
        core.check_alive()?;
        core.last_pid = std::process::id();
        let mut received = Received::default();
        if core.rcv.flags.contains(BufFlags::SHUT) {
            return Ok(received);
        }
        if let Some(e) = core.pending_error.take() {
            return Err(e);
        }
        match core.state {
            SockState::Connected | SockState::Closing => {}
            SockState::Closed if !self.0.kind.ty.is_connection_oriented() => {}
            _ => return Err(SockError::NotConnected),
        }
        let nonblocking = core.nonblocking || flags.contains(MsgFlags::DONTWAIT);
        let waitall = flags.contains(MsgFlags::WAITALL)
            && !flags.contains(MsgFlags::PEEK)
            && !sink.is_atomic();
        let wait = Wait::new(&core, core.rcv.timeout);

        loop {
            let seen = core.rcv.generation;
            let mut meta = RecvMeta {
                request: flags,
                ..RecvMeta::default()
            };
            let (c, transfer) =
                self.with_unlocked(core, || self.0.handler.receive(self, sink, &mut meta));
            core = c;
            core.check_alive()?;
            received.bytes += transfer.bytes;
            received.flags |= meta.flags;
            if meta.from.is_some() {
                received.from = meta.from;
            }
            if !meta.control.is_empty() {
                let (records, truncated) = control::decode(&meta.control);
                received.control.extend(records);
                if truncated {
                    received.flags |= MsgFlags::CTRUNC;
                }
            }
            match transfer.status {
                Ok(()) => {
                    let more = waitall && transfer.bytes > 0 && sink.capacity() > 0;
                    if !more {
                        return Ok(received);
                    }
                    continue;
                }
                Err(SockError::WouldBlock) => {}
                Err(e) if received.bytes > 0 && e.is_transient() => return Ok(received),
                Err(e) => return Err(e),
            }

            if received.bytes > 0 && !waitall {
                return Ok(received);
            }
            if core.rcv.flags.intersects(BufFlags::SHUT | BufFlags::EOF) {
                return Ok(received);
            }
            if nonblocking {
                return if received.bytes > 0 {
                    Ok(received)
                } else {
                    Err(SockError::WouldBlock)
                };
            }
            while core.rcv.generation == seen
                && !core.rcv.flags.intersects(BufFlags::SHUT | BufFlags::EOF)
            {
                if core.pending_error.is_some() {
                    if received.bytes > 0 {
                        return Ok(received);
                    }
                    return Err(core.pending_error.take().unwrap_or(SockError::NotConnected));
                }
                if let Err(e) = wait.check(&core, || SockError::WouldBlock) {
                    if received.bytes > 0 && e.is_transient() {
                        return Ok(received);
                    }
                    return Err(e);
                }
                core = self.park(core, &wait);
            }
        }
    }

    /// Disables sending, receiving or both, and wakes every waiter on the socket.
    pub fn shutdown(&self, how: Shutdown) -> SockResult<()> {
        let mut core = self.lock();
        core.check_alive()?;
        match core.state {
            SockState::Connected
            | SockState::Connecting
            | SockState::Listening
            | SockState::Closing => {}
            _ => return Err(SockError::NotConnected),
        }
        let mut events = SockEvents::empty();
        if matches!(how, Shutdown::Read | Shutdown::Both) {
            core.rcv.flags.insert(BufFlags::SHUT);
            core.rcv.wake();
            events |= SockEvents::CANT_RCV_MORE;
        }
        if matches!(how, Shutdown::Write | Shutdown::Both) {
            core.snd.flags.insert(BufFlags::SHUT);
            core.snd.wake();
            events |= SockEvents::CANT_SEND_MORE;
        }
        core.state = SockState::Closing;
        log::info!("socket {}: shutdown {how:?}", self.id());
        let core = self.dispatch(core, Notify::Event(events));
        drop(core);
        self.0.handler.shutdown(self, how)
    }

    /// Drops the descriptor reference.
    ///
    /// The socket is destroyed right away when nothing retains it; otherwise destruction is
    /// left to the last `release`. Allowed on a defunct socket.
    pub fn close(&self) -> SockResult<()> {
        let mut core = self.lock();
        if core.destroyed {
            return Err(SockError::NotSocket);
        }
        if !core.fd_ref {
            return Err(SockError::InvalidArgument);
        }
        core.fd_ref = false;
        self.0.env.stats.open.fetch_sub(1, Ordering::Relaxed);
        if matches!(
            core.state,
            SockState::Listening | SockState::Connected | SockState::Connecting
        ) {
            core.state = SockState::Closing;
        }
        if core.retain_count == 0 {
            self.teardown(core);
        } else {
            core.rcv.flags.insert(BufFlags::SHUT);
            core.snd.flags.insert(BufFlags::SHUT);
            core.rcv.wake();
            core.snd.wake();
            log::debug!(
                "socket {}: closed, destruction deferred ({} retains)",
                self.id(),
                core.retain_count
            );
            self.wake_all();
        }
        Ok(())
    }

    /// Adds an external hold on the socket.
    pub fn retain(&self) -> SockResult<()> {
        let mut core = self.lock();
        if core.destroyed {
            return Err(SockError::NotSocket);
        }
        core.retain_count += 1;
        core.use_count += 1;
        Ok(())
    }

    /// Drops an external hold.
    ///
    /// Waits for unlocked upcalls running on other threads first. The release that returns
    /// the count to the minimum after the descriptor is gone destroys the socket.
    pub fn release(&self) -> SockResult<()> {
        let core = self.lock();
        let mut core = self.drain_upcalls(core);
        if core.destroyed {
            return Err(SockError::NotSocket);
        }
        if core.retain_count == 0 {
            log::error!("socket {}: release without a matching retain", self.id());
            return Err(SockError::InvalidArgument);
        }
        let min = core.min_refs();
        if core.use_count <= min {
            log::error!(
                "socket {}: use count {} would drop below minimum {min}",
                self.id(),
                core.use_count
            );
            return Err(SockError::InvalidArgument);
        }
        core.retain_count -= 1;
        core.use_count -= 1;
        if core.retain_count == 0 && !core.fd_ref && core.use_count == min {
            self.teardown(core);
        }
        Ok(())
    }

    /// Marks the socket as privileged, allowing the privileged traffic classes.
    pub fn set_priv(&self, privileged: bool) -> SockResult<()> {
        let mut core = self.lock();
        core.check_alive()?;
        core.privileged = privileged;
        Ok(())
    }

    /// While set, blocking waits on this socket ignore `interrupt`.
    pub fn set_nointerrupt(&self, on: bool) {
        self.lock().nointerrupt = on;
    }

    /// Interrupts every thread blocked on this socket; each wait returns `Interrupted`.
    pub fn interrupt(&self) {
        let mut core = self.lock();
        core.interrupt_gen = core.interrupt_gen.wrapping_add(1);
        self.wake_all();
    }

    /// Administrative teardown. Every blocked and future operation fails with `Defunct`,
    /// except `close`. Calling it again is a no-op.
    pub fn set_defunct(&self) -> SockResult<()> {
        let mut core = self.lock();
        if core.destroyed {
            return Err(SockError::NotSocket);
        }
        if core.state == SockState::Defunct {
            return Ok(());
        }
        core.state = SockState::Defunct;
        core.rcv.flags.insert(BufFlags::SHUT);
        core.snd.flags.insert(BufFlags::SHUT);
        core.rcv.wake();
        core.snd.wake();
        let listener = core.listener.take();
        let core = self.dispatch(core, Notify::Event(SockEvents::DEFUNCT));
        drop(core);

        let children = self.0.queue.acquire().drain();
        for child in children {
            child.teardown(child.lock());
        }
        let parent = listener.and_then(|w| w.upgrade()).map(Socket);
        if let Some(parent) = parent {
            if parent.0.queue.acquire().remove(self.id()).is_some() {
                self.teardown(self.lock());
            }
        }
        if let Err(e) = self.0.handler.shutdown(self, Shutdown::Both) {
            log::debug!("socket {}: protocol shutdown on defunct: {e}", self.id());
        }
        log::info!("socket {}: defunct", self.id());
        Ok(())
    }

    /// The single destruction path. Idempotent.
    pub(crate) fn teardown(&self, core: CoreGuard<'_>) {
        let mut core = self.drain_upcalls(core);
        if core.destroyed {
            return;
        }
        core.destroyed = true;
        core.use_count = 0;
        if core.state != SockState::Defunct {
            core.state = SockState::Closed;
        }
        core.upcalls = None;
        core.accept_upcalls = None;
        core.fd_ref = false;
        let listener = core.listener.take();
        drop(core);
        self.wake_all();

        let children = self.0.queue.acquire().drain();
        for child in children {
            child.teardown(child.lock());
        }
        if let Some(parent) = listener.and_then(|w| w.upgrade()) {
            parent.queue.acquire().remove(self.id());
        }
        self.0.handler.close(self);
        self.0.env.stats.destroyed.fetch_add(1, Ordering::Relaxed);
        log::debug!("socket {}: destroyed", self.id());
    }

    pub(crate) fn mark_connected<'g>(
        &'g self,
        mut core: CoreGuard<'g>,
        peer: Option<SockAddr>,
    ) -> CoreGuard<'g> {
        core.state = SockState::Connected;
        if peer.is_some() {
            core.peer_addr = peer;
        }
        core.connected_extra = self.0.connected_refs;
        core.use_count += self.0.connected_refs;
        log::debug!("socket {}: connected", self.id());
        let core = self.dispatch(core, Notify::Event(SockEvents::CONNECTED));
        self.dispatch(core, Notify::Write)
    }
}
