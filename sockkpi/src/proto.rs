//! # Protocol Handler Interface
//!
//! ## Purpose
//!
//! The contract a transport protocol implements to plug into the socket layer, and the
//! registry that picks an implementation by (domain, type, protocol).
//!
//! ## How it works
//!
//! Every `ProtocolHandler` entry point is called with the socket lock released, so a handler
//! may block, sleep or operate on other sockets. A handler never changes the socket's state or
//! reference counts itself; it reports progress through its return values and through the
//! completion callbacks on `Socket` (`set_connected`, `set_disconnected`, `wakeup_read`, ...).
//! The socket may have changed, or gone defunct, by the time a handler call returns; the
//! lifecycle code re-validates it on re-entry.
//!
//! The `Registry` is filled once through `RegistryBuilder` and is read-only afterwards.
//!
//! ## Main components
//!
//! - `ProtocolHandler`: the per-socket handler trait.
//! - `ProtocolFactory`: produces a handler for a new socket.
//! - `Registry`, `RegistryBuilder`: the (domain, type, protocol) switch table.
//! - `Handshake`, `Control`, `SendMeta`, `RecvMeta`, `MsgFlags`: values passed across the seam.

use crate::addr::{Domain, SockAddr, SockKind, SockType};
use crate::buffer::{Payload, Sink, Transfer};
use crate::error::{SockError, SockResult};
use crate::options::SockOpt;
use crate::socket::Socket;
use crate::tclass::TrafficClass;
use bitflags::bitflags;
use std::collections::HashMap;
use std::net::Shutdown;
use std::sync::Arc;

bitflags! {
    /// Per-call message flags.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct MsgFlags: u32 {
        /// Do not block for this call only.
        const DONTWAIT = 1 << 0;
        /// Look at incoming data without consuming it.
        const PEEK = 1 << 1;
        /// Keep receiving until the buffer is full.
        const WAITALL = 1 << 2;
        /// Out-of-band data.
        const OOB = 1 << 3;
        /// End of record.
        const EOR = 1 << 4;
        /// Reported on receive: the record was longer than the buffer.
        const TRUNC = 1 << 5;
        /// Reported on receive: control data did not fit.
        const CTRUNC = 1 << 6;
        /// Do not raise SIGPIPE on a broken connection.
        const NOSIGNAL = 1 << 7;
    }
}

/// Result of a handler's `connect`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handshake {
    /// Connected before returning. Carries the peer address when the handler knows it.
    Complete(Option<SockAddr>),
    /// The handshake continues asynchronously; the handler calls `set_connected` or
    /// `set_disconnected` on the socket when it resolves.
    Pending,
}

/// A request routed to a handler's `control` entry point.
#[derive(Debug)]
pub enum Control<'a> {
    /// A protocol-level socket option.
    Option(&'a mut SockOpt),
    /// An ioctl the socket layer does not handle itself. `arg` is in/out.
    Ioctl { cmd: u64, arg: &'a mut [u8] },
}

/// Per-call send parameters.
#[derive(Debug, Clone, Default)]
pub struct SendMeta {
    pub flags: MsgFlags,
    /// Destination for unconnected sends.
    pub to: Option<SockAddr>,
    /// Ancillary data in wire form.
    pub control: Vec<u8>,
    /// Effective traffic class: the per-message override, or the socket's class.
    pub traffic_class: TrafficClass,
}

/// Per-call receive parameters and results.
#[derive(Debug, Clone, Default)]
pub struct RecvMeta {
    /// Flags requested by the caller.
    pub request: MsgFlags,
    /// Flags reported back by the handler (`TRUNC`, `CTRUNC`, `EOR`, `OOB`).
    pub flags: MsgFlags,
    /// Source address, filled by datagram handlers.
    pub from: Option<SockAddr>,
    /// Ancillary data in wire form, filled by the handler.
    pub control: Vec<u8>,
}

/// Protocol-specific behaviour attached to a socket at creation.
///
/// Errors are reported with the shared `SockError` kinds. `close` is called exactly once, when
/// the socket is destroyed, and no other entry point is called afterwards.
pub trait ProtocolHandler: Send + Sync {
    /// Binds `addr`, returning the address actually bound.
    fn bind(&self, so: &Socket, addr: &SockAddr) -> SockResult<SockAddr>;

    /// Prepares the socket to accept connections.
    fn listen(&self, _so: &Socket, _backlog: u32) -> SockResult<()> {
        Ok(())
    }

    /// Starts a connection to `addr`.
    fn connect(&self, so: &Socket, addr: &SockAddr) -> SockResult<Handshake>;

    /// Called on a child socket when it is handed to an `accept` caller.
    fn accept(&self, _so: &Socket) -> SockResult<()> {
        Ok(())
    }

    /// Protocol-level options and ioctls.
    fn control(&self, _so: &Socket, _request: Control<'_>) -> SockResult<()> {
        Err(SockError::Unsupported)
    }

    /// Sends as much of `payload` as possible right now.
    ///
    /// A handler that cannot take any data returns `WouldBlock` (or `Ok` with 0 bytes); the
    /// socket layer then waits for `wakeup_write` in blocking mode.
    fn send(&self, so: &Socket, payload: &mut Payload<'_>, meta: &SendMeta) -> Transfer;

    /// Receives into `sink`. `Ok` with 0 bytes means end of stream, `WouldBlock` means no data
    /// yet.
    fn receive(&self, so: &Socket, sink: &mut Sink<'_, '_>, meta: &mut RecvMeta) -> Transfer;

    /// Current local address. `Unsupported` lets the socket layer answer from its cache.
    fn local_address(&self, _so: &Socket) -> SockResult<SockAddr> {
        Err(SockError::Unsupported)
    }

    /// Current peer address. `Unsupported` lets the socket layer answer from its cache.
    fn peer_address(&self, _so: &Socket) -> SockResult<SockAddr> {
        Err(SockError::Unsupported)
    }

    /// Disables one or both directions at the protocol level.
    fn shutdown(&self, _so: &Socket, _how: Shutdown) -> SockResult<()> {
        Ok(())
    }

    /// Releases protocol resources. Called exactly once.
    fn close(&self, so: &Socket);

    /// Extra references a connected socket of this protocol holds on itself, added to the
    /// base minimum once the socket is connected.
    fn connected_refs(&self) -> u32 {
        0
    }
}

/// Creates handlers for new sockets.
pub trait ProtocolFactory: Send + Sync {
    fn attach(&self, kind: SockKind) -> SockResult<Arc<dyn ProtocolHandler>>;
}

impl<F> ProtocolFactory for F
where
    F: Fn(SockKind) -> SockResult<Arc<dyn ProtocolHandler>> + Send + Sync,
{
    fn attach(&self, kind: SockKind) -> SockResult<Arc<dyn ProtocolHandler>> {
        self(kind)
    }
}

/// Read-only protocol switch table.
pub struct Registry {
    entries: HashMap<(Domain, SockType, i32), Arc<dyn ProtocolFactory>>,
    defaults: HashMap<(Domain, SockType), i32>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder {
            entries: HashMap::new(),
            defaults: HashMap::new(),
        }
    }

    /// Finds the factory for a triple. Protocol 0 selects the default for (domain, type).
    ///
    /// # Returns
    /// The resolved kind (with the concrete protocol number) and its factory, or
    /// `Unsupported` when nothing is registered.
    pub fn lookup(
        &self,
        domain: Domain,
        ty: SockType,
        protocol: i32,
    ) -> SockResult<(SockKind, Arc<dyn ProtocolFactory>)> {
        let protocol = if protocol == 0 {
            *self
                .defaults
                .get(&(domain, ty))
                .ok_or(SockError::Unsupported)?
        } else {
            protocol
        };
        let factory = self
            .entries
            .get(&(domain, ty, protocol))
            .ok_or(SockError::Unsupported)?;
        Ok((SockKind { domain, ty, protocol }, factory.clone()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Collects registrations before the registry is frozen.
pub struct RegistryBuilder {
    entries: HashMap<(Domain, SockType, i32), Arc<dyn ProtocolFactory>>,
    defaults: HashMap<(Domain, SockType), i32>,
}

impl RegistryBuilder {
    /// Registers `factory` for `(domain, ty, protocol)`. The first protocol registered for a
    /// (domain, type) pair becomes its default. Re-registering a triple replaces the factory.
    pub fn register(
        mut self,
        domain: Domain,
        ty: SockType,
        protocol: i32,
        factory: impl ProtocolFactory + 'static,
    ) -> Self {
        self.defaults.entry((domain, ty)).or_insert(protocol);
        self.entries
            .insert((domain, ty, protocol), Arc::new(factory));
        self
    }

    pub fn build(self) -> Arc<Registry> {
        Arc::new(Registry {
            entries: self.entries,
            defaults: self.defaults,
        })
    }
}
