//! # Protocol Completion Callbacks
//!
//! ## Purpose
//!
//! Protocol handlers never touch a socket's state or reference counts. They report what
//! happened through the calls in this file, and the socket layer performs the transition,
//! wakes waiters and runs upcalls.
//!
//! ## How it works
//!
//! A listener's protocol creates an embryonic child with `spawn_connection`; the child sits on
//! the listener's incomplete list until the protocol calls `set_connected` on it, which moves
//! it to the tail of the completed list and wakes `accept`. The child's lock is always dropped
//! before the listener's queue or lock is taken, so no thread ever holds two socket locks.
//!
//! ## Main components
//!
//! - `spawn_connection()`: embryonic child of a listener.
//! - `set_connected()`, `set_disconnected()`: handshake and connection outcomes.
//! - `post_error()`, `wakeup_read()`, `wakeup_write()`, `set_available()`, `mark_eof()`: data
//!   path signals.

use crate::addr::SockAddr;
use crate::error::{SockError, SockResult};
use crate::proto::ProtocolHandler;
use crate::socket::{BufFlags, SockCore, SockState, Socket};
use crate::upcall::{Notify, SockEvents};
use std::sync::Arc;

impl Socket {
    /// Creates an embryonic connection on a listening socket.
    ///
    /// The child inherits the listener's kind, buffer sizes, options, traffic class and
    /// blocking mode, starts in `Connecting` without a descriptor, and is recorded as
    /// incomplete on the listener's accept queue.
    ///
    /// # Returns
    /// The child, or `ResourceExhausted` when the backlog is full.
    pub fn spawn_connection(&self, handler: Arc<dyn ProtocolHandler>) -> SockResult<Socket> {
        let core = self.lock();
        core.check_alive()?;
        match core.state {
            SockState::Listening => {}
            SockState::Closing => return Err(SockError::ConnectionAborted),
            _ => return Err(SockError::InvalidArgument),
        }
        let mut init = SockCore::inherit(&core);
        init.listener = Some(Arc::downgrade(&self.0));
        let child = Socket::new(self.0.kind, handler, self.0.env.clone(), init);

        let mut queue = self.0.queue.acquire();
        if let Err(e) = queue.push_incomplete(child.clone()) {
            drop(queue);
            drop(core);
            log::warn!(
                "socket {}: backlog full, dropping connection {}",
                self.id(),
                child.id()
            );
            child.teardown(child.lock());
            return Err(e);
        }
        log::debug!("socket {}: embryonic connection {}", self.id(), child.id());
        Ok(child)
    }

    /// Reports that the handshake completed.
    ///
    /// A child of a listener moves to the completed list and the listener's accept waiters
    /// and read upcall are woken.
    pub fn set_connected(&self, peer: Option<SockAddr>) -> SockResult<()> {
        let core = self.lock();
        core.check_alive()?;
        match core.state {
            SockState::Connecting => {}
            SockState::Connected => return Ok(()),
            _ => return Err(SockError::InvalidArgument),
        }
        let listener = core.listener.clone();
        let core = self.mark_connected(core, peer);
        drop(core);

        if let Some(parent) = listener.and_then(|w| w.upgrade()).map(Socket) {
            let moved = parent.0.queue.acquire().complete(self.id());
            if moved {
                let pc = parent.lock();
                drop(parent.dispatch(pc, Notify::Read));
            }
        }
        Ok(())
    }

    /// Reports that a handshake failed or an established connection went away.
    ///
    /// A connecting socket returns to `Closed` with `error` pending. A connected one moves to
    /// `Closing` with both directions finished. An embryonic child is removed from its
    /// listener and destroyed.
    pub fn set_disconnected(&self, error: Option<SockError>) -> SockResult<()> {
        let mut core = self.lock();
        core.check_alive()?;
        let mut events = SockEvents::DISCONNECTED;
        match core.state {
            SockState::Connecting => {
                core.state = SockState::Closed;
                core.peer_addr = None;
            }
            SockState::Connected | SockState::Closing => {
                core.state = SockState::Closing;
                core.rcv.flags.insert(BufFlags::EOF);
                core.snd.flags.insert(BufFlags::SHUT);
                core.rcv.wake();
                core.snd.wake();
                core.peer_addr = None;
                core.use_count -= core.connected_extra;
                core.connected_extra = 0;
                events |= SockEvents::CANT_RCV_MORE | SockEvents::CANT_SEND_MORE;
            }
            _ => return Err(SockError::NotConnected),
        }
        if let Some(e) = error {
            log::debug!("socket {}: disconnected: {e}", self.id());
            if matches!(e, SockError::ConnectionAborted) {
                events |= SockEvents::CONN_RESET;
            }
            events |= SockEvents::ERROR;
            core.pending_error = Some(e);
        }
        let listener = core.listener.clone();
        let core = self.dispatch(core, Notify::Event(events));
        let core = self.dispatch(core, Notify::Read);
        drop(self.dispatch(core, Notify::Write));

        if let Some(parent) = listener.and_then(|w| w.upgrade()) {
            let unlinked = parent.queue.acquire().remove(self.id());
            if unlinked.is_some() {
                self.teardown(self.lock());
            }
        }
        Ok(())
    }

    /// Posts an asynchronous error, delivered to the next blocking caller.
    pub fn post_error(&self, error: SockError) {
        let mut core = self.lock();
        if core.destroyed {
            return;
        }
        core.pending_error = Some(error);
        drop(self.dispatch(core, Notify::Event(SockEvents::ERROR)));
    }

    /// Reports that `available` bytes can be read.
    pub fn wakeup_read(&self, available: usize) {
        let mut core = self.lock();
        core.rcv.avail = available;
        core.rcv.wake();
        drop(self.dispatch(core, Notify::Read));
    }

    /// Updates the readable byte count without waking anyone, after the protocol consumed
    /// data on behalf of a receive.
    pub fn set_available(&self, available: usize) {
        self.lock().rcv.avail = available;
    }

    /// Reports that `space` bytes can be sent.
    pub fn wakeup_write(&self, space: usize) {
        let mut core = self.lock();
        core.snd.avail = space;
        core.snd.wake();
        drop(self.dispatch(core, Notify::Write));
    }

    /// Reports that the peer will send no more data.
    pub fn mark_eof(&self) {
        let mut core = self.lock();
        if core.rcv.flags.contains(BufFlags::EOF) {
            return;
        }
        core.rcv.flags.insert(BufFlags::EOF);
        core.rcv.wake();
        let core = self.dispatch(core, Notify::Event(SockEvents::CANT_RCV_MORE));
        drop(self.dispatch(core, Notify::Read));
    }
}
