//! # Socket Object
//!
//! ## Purpose
//!
//! The lock-guarded connection record shared by the owning descriptor, the accept queue of a
//! listener and any registered upcall context.
//!
//! ## How it works
//!
//! `Socket` is a cloneable handle over `Arc<Shared>`. Immutable parts (kind, handler, the
//! stack environment) live directly in `Shared`; everything that changes lives in `SockCore`
//! behind a non-reentrant `Mutex`, paired with one `Condvar` on which every blocking
//! operation parks. Waits are re-check loops: a waiter captures the generation counters it
//! cares about, parks, and re-evaluates its predicate on every wake-up, so spurious and stale
//! wake-ups are harmless.
//!
//! Handler calls go through `with_unlocked`, which drops the guard for the duration of the
//! call and hands back a fresh one. The caller re-validates with `SockCore::check_alive`
//! because the socket may have been destroyed or made defunct in between.
//!
//! ## Main components
//!
//! - `Socket`, `WeakSocket`: strong and weak handles.
//! - `SockCore`: the guarded state, with read-only accessors for locked upcalls.
//! - `SockState`, `SockBuf`, `BufFlags`, `OptFlags`: pieces of the guarded state.
//! - `Wait`: the terminal conditions shared by every blocking wait.

use crate::accept_queue::AcceptQueue;
use crate::addr::{SockAddr, SockKind};
use crate::config::Settings;
use crate::error::{SockError, SockResult};
use crate::proto::ProtocolHandler;
use crate::tclass::TrafficClass;
use crate::upcall::Upcalls;
use bitflags::bitflags;
use static_assertions::{assert_impl_all, const_assert_eq};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

/// References every live socket holds: the descriptor slot and the protocol attachment.
pub const BASE_REFS: u32 = 2;

const_assert_eq!(BASE_REFS, 2);
assert_impl_all!(Socket: Send, Sync, Clone);

pub(crate) type CoreGuard<'a> = MutexGuard<'a, SockCore>;

/// Connection state.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SockState {
    /// Unconnected, possibly bound.
    Closed,
    /// A bind is being processed by the protocol.
    Binding,
    /// A handshake is in progress.
    Connecting,
    Connected,
    Listening,
    /// At least one direction was shut down, or the peer went away.
    Closing,
    /// Administratively torn down. Absorbing.
    Defunct,
}

bitflags! {
    /// Per-direction buffer flags.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct BufFlags: u8 {
        /// This direction was shut down locally.
        const SHUT = 1 << 0;
        /// The peer will send no more data. Buffered data may still be read.
        const EOF = 1 << 1;
    }
}

bitflags! {
    /// Boolean socket-level options.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct OptFlags: u16 {
        const REUSEADDR = 1 << 0;
        const KEEPALIVE = 1 << 1;
        const DEBUG = 1 << 2;
        const DONTROUTE = 1 << 3;
        const BROADCAST = 1 << 4;
        const OOBINLINE = 1 << 5;
        const ACCEPTCONN = 1 << 6;
    }
}

/// Send or receive buffer descriptor.
#[derive(Debug, Clone)]
pub struct SockBuf {
    /// High-water mark (`SO_SNDBUF` / `SO_RCVBUF`).
    pub(crate) hiwat: usize,
    /// Low-water mark (`SO_SNDLOWAT` / `SO_RCVLOWAT`).
    pub(crate) lowat: usize,
    /// Receive side: bytes readable. Send side: free space. As last reported by the handler.
    pub(crate) avail: usize,
    pub(crate) flags: BufFlags,
    /// Timeout for blocking waits in this direction.
    pub(crate) timeout: Option<Duration>,
    /// Bumped on every wake-up of this direction.
    pub(crate) generation: u64,
}

impl SockBuf {
    fn new(hiwat: usize, lowat: usize, timeout: Option<Duration>) -> Self {
        SockBuf {
            hiwat,
            lowat,
            avail: 0,
            flags: BufFlags::empty(),
            timeout,
            generation: 0,
        }
    }

    pub(crate) fn wake(&mut self) {
        self.generation = self.generation.wrapping_add(1);
    }

    pub fn hiwat(&self) -> usize {
        self.hiwat
    }

    pub fn lowat(&self) -> usize {
        self.lowat
    }

    pub fn avail(&self) -> usize {
        self.avail
    }

    pub fn flags(&self) -> BufFlags {
        self.flags
    }
}

/// The mutable, lock-guarded part of a socket.
///
/// Locked-mode upcalls receive a shared reference to it; the public accessors are all they
/// can use.
pub struct SockCore {
    pub(crate) state: SockState,
    pub(crate) use_count: u32,
    pub(crate) retain_count: u32,
    /// Whether a descriptor (the creator or an `accept` caller) still holds the socket.
    pub(crate) fd_ref: bool,
    pub(crate) destroyed: bool,
    pub(crate) local_addr: Option<SockAddr>,
    pub(crate) peer_addr: Option<SockAddr>,
    pub(crate) snd: SockBuf,
    pub(crate) rcv: SockBuf,
    pub(crate) pending_error: Option<SockError>,
    pub(crate) owner_pid: u32,
    pub(crate) last_pid: u32,
    pub(crate) nonblocking: bool,
    pub(crate) nointerrupt: bool,
    pub(crate) privileged: bool,
    pub(crate) options: OptFlags,
    /// `SO_LINGER`: `Some(secs)` when enabled.
    pub(crate) linger: Option<i32>,
    pub(crate) traffic_class: TrafficClass,
    pub(crate) backlog: u32,
    /// The listener whose accept queue holds this socket.
    pub(crate) listener: Option<Weak<Shared>>,
    pub(crate) upcalls: Option<Upcalls>,
    /// Applied to every child handed out by `accept`.
    pub(crate) accept_upcalls: Option<Upcalls>,
    pub(crate) upcall_inflight: u32,
    pub(crate) upcall_threads: Vec<ThreadId>,
    pub(crate) interrupt_gen: u64,
    /// References added by the protocol while connected.
    pub(crate) connected_extra: u32,
}

impl SockCore {
    pub(crate) fn new(settings: &Settings) -> Self {
        let pid = std::process::id();
        SockCore {
            state: SockState::Closed,
            use_count: BASE_REFS,
            retain_count: 0,
            fd_ref: false,
            destroyed: false,
            local_addr: None,
            peer_addr: None,
            snd: SockBuf::new(settings.send_buffer, settings.send_buffer.min(2048), settings.timeout),
            rcv: SockBuf::new(settings.recv_buffer, 1, settings.timeout),
            pending_error: None,
            owner_pid: pid,
            last_pid: pid,
            nonblocking: settings.nonblocking,
            nointerrupt: false,
            privileged: false,
            options: OptFlags::empty(),
            linger: None,
            traffic_class: TrafficClass::default(),
            backlog: 0,
            listener: None,
            upcalls: None,
            accept_upcalls: None,
            upcall_inflight: 0,
            upcall_threads: Vec::new(),
            interrupt_gen: 0,
            connected_extra: 0,
        }
    }

    /// A child of a listening socket: same buffers, options, class and blocking mode.
    pub(crate) fn inherit(parent: &SockCore) -> Self {
        let pid = std::process::id();
        SockCore {
            state: SockState::Connecting,
            use_count: BASE_REFS,
            retain_count: 0,
            fd_ref: false,
            destroyed: false,
            local_addr: parent.local_addr.clone(),
            peer_addr: None,
            snd: SockBuf::new(parent.snd.hiwat, parent.snd.lowat, parent.snd.timeout),
            rcv: SockBuf::new(parent.rcv.hiwat, parent.rcv.lowat, parent.rcv.timeout),
            pending_error: None,
            owner_pid: pid,
            last_pid: pid,
            nonblocking: parent.nonblocking,
            nointerrupt: false,
            privileged: parent.privileged,
            options: parent.options - OptFlags::ACCEPTCONN,
            linger: parent.linger,
            traffic_class: parent.traffic_class,
            backlog: 0,
            listener: None,
            upcalls: None,
            accept_upcalls: None,
            upcall_inflight: 0,
            upcall_threads: Vec::new(),
            interrupt_gen: 0,
            connected_extra: 0,
        }
    }

    /// Fails with `NotSocket` once destroyed and with `Defunct` once defunct.
    pub(crate) fn check_alive(&self) -> SockResult<()> {
        if self.destroyed {
            Err(SockError::NotSocket)
        } else if self.state == SockState::Defunct {
            Err(SockError::Defunct)
        } else {
            Ok(())
        }
    }

    /// The reference count below which `release` must never go.
    pub(crate) fn min_refs(&self) -> u32 {
        BASE_REFS + self.connected_extra
    }

    pub fn state(&self) -> SockState {
        self.state
    }

    pub fn send_buf(&self) -> &SockBuf {
        &self.snd
    }

    pub fn recv_buf(&self) -> &SockBuf {
        &self.rcv
    }

    pub fn local_addr(&self) -> Option<&SockAddr> {
        self.local_addr.as_ref()
    }

    pub fn peer_addr(&self) -> Option<&SockAddr> {
        self.peer_addr.as_ref()
    }

    pub fn has_error(&self) -> bool {
        self.pending_error.is_some()
    }

    pub fn use_count(&self) -> u32 {
        self.use_count
    }

    pub fn retain_count(&self) -> u32 {
        self.retain_count
    }
}

/// Counters shared by every socket of a stack.
#[derive(Default)]
pub(crate) struct Stats {
    pub created: AtomicU64,
    pub destroyed: AtomicU64,
    pub open: AtomicU64,
}

/// State shared by all sockets of one `Stack`.
pub(crate) struct Env {
    pub settings: Settings,
    pub stats: Stats,
    next_id: AtomicU64,
}

impl Env {
    pub fn new(settings: Settings) -> Self {
        Env {
            settings,
            stats: Stats::default(),
            next_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

pub(crate) struct Shared {
    pub id: u64,
    pub kind: SockKind,
    pub handler: Arc<dyn ProtocolHandler>,
    /// `handler.connected_refs()`, read once at creation.
    pub connected_refs: u32,
    pub env: Arc<Env>,
    pub core: Mutex<SockCore>,
    pub cond: Condvar,
    pub queue: AcceptQueue,
}

/// Handle to a socket. Clones refer to the same socket.
#[derive(Clone)]
pub struct Socket(pub(crate) Arc<Shared>);

/// Non-owning handle, for protocol handlers that point at their peers.
#[derive(Clone)]
pub struct WeakSocket(Weak<Shared>);

impl WeakSocket {
    pub fn upgrade(&self) -> Option<Socket> {
        self.0.upgrade().map(Socket)
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.0.id)
            .field("kind", &self.0.kind)
            .finish()
    }
}

impl PartialEq for Socket {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Socket {}

impl Socket {
    pub(crate) fn new(
        kind: SockKind,
        handler: Arc<dyn ProtocolHandler>,
        env: Arc<Env>,
        core: SockCore,
    ) -> Self {
        env.stats.created.fetch_add(1, Ordering::Relaxed);
        let connected_refs = handler.connected_refs();
        Socket(Arc::new(Shared {
            id: env.next_id(),
            kind,
            handler,
            connected_refs,
            env,
            core: Mutex::new(core),
            cond: Condvar::new(),
            queue: AcceptQueue::new(),
        }))
    }

    pub fn downgrade(&self) -> WeakSocket {
        WeakSocket(Arc::downgrade(&self.0))
    }

    /// Acquires the socket lock. A poisoned lock is recovered; the state it guards is kept
    /// consistent at every unlock point.
    pub(crate) fn lock(&self) -> CoreGuard<'_> {
        self.0.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `f` with the socket lock released and re-acquires it afterwards.
    pub(crate) fn with_unlocked<'g, R>(
        &'g self,
        core: CoreGuard<'g>,
        f: impl FnOnce() -> R,
    ) -> (CoreGuard<'g>, R) {
        drop(core);
        let r = f();
        (self.lock(), r)
    }

    /// Parks on the socket's condition variable until woken or until the wait's deadline.
    pub(crate) fn park<'g>(&'g self, core: CoreGuard<'g>, wait: &Wait) -> CoreGuard<'g> {
        match wait.deadline {
            None => self.0.cond.wait(core).unwrap_or_else(PoisonError::into_inner),
            Some(deadline) => {
                let left = deadline.saturating_duration_since(Instant::now());
                self.0
                    .cond
                    .wait_timeout(core, left)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
            }
        }
    }

    pub(crate) fn wake_all(&self) {
        self.0.cond.notify_all();
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn kind(&self) -> SockKind {
        self.0.kind
    }

    pub fn state(&self) -> SockState {
        self.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.lock().state == SockState::Connected
    }

    pub fn is_nonblocking(&self) -> bool {
        self.lock().nonblocking
    }

    pub fn is_privileged(&self) -> bool {
        self.lock().privileged
    }

    pub fn is_destroyed(&self) -> bool {
        self.lock().destroyed
    }

    /// The listener whose accept queue holds this socket; `None` once accepted.
    pub fn listener(&self) -> Option<Socket> {
        self.lock()
            .listener
            .as_ref()
            .and_then(Weak::upgrade)
            .map(Socket)
    }

    /// Errno of the pending error, without clearing it.
    pub fn pending_error(&self) -> Option<i32> {
        self.lock().pending_error.as_ref().map(SockError::errno)
    }

    /// Process that owns the socket.
    pub fn owner(&self) -> u32 {
        self.lock().owner_pid
    }

    /// Process that last operated on the socket.
    pub fn last_pid(&self) -> u32 {
        self.lock().last_pid
    }

    /// Bytes readable, as last reported by the protocol.
    pub fn available(&self) -> usize {
        self.lock().rcv.avail
    }

    /// Completed plus embryonic connections waiting on this listener.
    pub fn accept_queue_len(&self) -> usize {
        self.0.queue.acquire().len()
    }

    /// Timeout used by blocking receive-side waits (`accept`, `receive`).
    pub fn timeout(&self) -> Option<Duration> {
        self.lock().rcv.timeout
    }

    /// The local address: the protocol's answer if it has one, otherwise the cached bind.
    pub fn local_address(&self) -> SockResult<SockAddr> {
        self.lock().check_alive()?;
        match self.0.handler.local_address(self) {
            Err(SockError::Unsupported) => self
                .lock()
                .local_addr
                .clone()
                .ok_or(SockError::AddressUnavailable),
            other => other,
        }
    }

    /// The peer address: the protocol's answer if it has one, otherwise the cached one.
    pub fn peer_address(&self) -> SockResult<SockAddr> {
        self.lock().check_alive()?;
        match self.0.handler.peer_address(self) {
            Err(SockError::Unsupported) => {
                self.lock().peer_addr.clone().ok_or(SockError::NotConnected)
            }
            other => other,
        }
    }
}

/// The conditions that end any blocking wait regardless of its own predicate.
pub(crate) struct Wait {
    deadline: Option<Instant>,
    interrupt_gen: u64,
}

impl Wait {
    /// A timeout too large to represent as an instant waits without a deadline.
    pub fn new(core: &SockCore, timeout: Option<Duration>) -> Self {
        Wait {
            deadline: timeout.and_then(|t| Instant::now().checked_add(t)),
            interrupt_gen: core.interrupt_gen,
        }
    }

    /// Fails when the socket died, when an interrupt arrived since the wait began (unless the
    /// socket ignores interrupts), or when the deadline passed.
    pub fn check(&self, core: &SockCore, on_timeout: fn() -> SockError) -> SockResult<()> {
        core.check_alive()?;
        if !core.nointerrupt && core.interrupt_gen != self.interrupt_gen {
            return Err(SockError::Interrupted);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(on_timeout()),
            _ => Ok(()),
        }
    }
}
