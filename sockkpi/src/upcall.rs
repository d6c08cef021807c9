//! # Upcall Dispatcher
//!
//! ## Purpose
//!
//! Lets the owner of a socket register callbacks that run when data becomes readable, when
//! send space opens up, or when a connection event happens.
//!
//! ## How it works
//!
//! A socket holds at most one `Upcalls` set: a read callback, a write callback and an event
//! callback with its interest mask. Registering replaces the whole set under the socket lock.
//! The registrant picks the invocation mode explicitly:
//!
//! - `UpcallMode::Locked`: the callback runs with the socket lock held and gets a read-only
//!   view of the guarded state. It must not call `Socket` methods that take the lock.
//! - `UpcallMode::Unlocked`: the lock is dropped for the call. The socket counts the call as
//!   in flight, and `release` waits for in-flight calls to finish before it can destroy the
//!   socket.
//!
//! Every dispatch also wakes the socket's waiters.

use crate::socket::{CoreGuard, SockCore, Socket};
use bitflags::bitflags;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::thread;

bitflags! {
    /// Connection events delivered to the event callback.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct SockEvents: u32 {
        const CONNECTED = 1 << 0;
        const DISCONNECTED = 1 << 1;
        const CONN_RESET = 1 << 2;
        const CANT_RCV_MORE = 1 << 3;
        const CANT_SEND_MORE = 1 << 4;
        const ERROR = 1 << 5;
        const DEFUNCT = 1 << 6;
    }
}

/// How a registered callback is invoked.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UpcallMode {
    Locked,
    Unlocked,
}

/// Opaque context handed back to every callback.
pub type UpcallCtx = Arc<dyn Any + Send + Sync>;

type DataFn = Arc<dyn Fn(&Upcall<'_>) + Send + Sync>;
type EventFn = Arc<dyn Fn(&Upcall<'_>, SockEvents) + Send + Sync>;

/// What a callback sees.
pub struct Upcall<'a> {
    socket: &'a Socket,
    core: Option<&'a SockCore>,
    context: Option<&'a UpcallCtx>,
}

impl<'a> Upcall<'a> {
    pub fn socket(&self) -> &'a Socket {
        self.socket
    }

    /// The guarded state, for locked-mode callbacks only.
    pub fn core(&self) -> Option<&'a SockCore> {
        self.core
    }

    pub fn context(&self) -> Option<&'a UpcallCtx> {
        self.context
    }
}

/// A set of callbacks registered together.
#[derive(Clone)]
pub struct Upcalls {
    mode: UpcallMode,
    read: Option<DataFn>,
    write: Option<DataFn>,
    events: Option<(SockEvents, EventFn)>,
    context: Option<UpcallCtx>,
}

impl fmt::Debug for Upcalls {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Upcalls")
            .field("mode", &self.mode)
            .field("read", &self.read.is_some())
            .field("write", &self.write.is_some())
            .field("events", &self.events.as_ref().map(|(mask, _)| *mask))
            .finish()
    }
}

impl Upcalls {
    pub fn new(mode: UpcallMode) -> Self {
        Upcalls {
            mode,
            read: None,
            write: None,
            events: None,
            context: None,
        }
    }

    pub fn read(mut self, f: impl Fn(&Upcall<'_>) + Send + Sync + 'static) -> Self {
        self.read = Some(Arc::new(f));
        self
    }

    pub fn write(mut self, f: impl Fn(&Upcall<'_>) + Send + Sync + 'static) -> Self {
        self.write = Some(Arc::new(f));
        self
    }

    /// Event callback, invoked only for events in `mask`.
    pub fn events(
        mut self,
        mask: SockEvents,
        f: impl Fn(&Upcall<'_>, SockEvents) + Send + Sync + 'static,
    ) -> Self {
        self.events = Some((mask, Arc::new(f)));
        self
    }

    pub fn context(mut self, ctx: UpcallCtx) -> Self {
        self.context = Some(ctx);
        self
    }

    pub fn mode(&self) -> UpcallMode {
        self.mode
    }
}

/// What changed on a socket.
#[derive(Copy, Clone, Debug)]
pub(crate) enum Notify {
    Read,
    Write,
    Event(SockEvents),
}

enum Callback {
    Data(DataFn),
    Event(EventFn, SockEvents),
}

impl Callback {
    fn invoke(&self, up: &Upcall<'_>) {
        match self {
            Callback::Data(f) => f(up),
            Callback::Event(f, events) => f(up, *events),
        }
    }
}

impl Socket {
    /// Registers a callback set, replacing any previous one.
    pub fn set_upcalls(&self, upcalls: Upcalls) {
        self.lock().upcalls = Some(upcalls);
    }

    pub fn clear_upcalls(&self) {
        self.lock().upcalls = None;
    }

    /// Callbacks installed on every child this listener hands out through `accept`.
    pub fn set_accept_upcalls(&self, upcalls: Option<Upcalls>) {
        self.lock().accept_upcalls = upcalls;
    }

    /// Wakes waiters and runs the matching callback, if any.
    ///
    /// The returned guard may come from a re-acquisition, so callers must not rely on state
    /// read before the call.
    pub(crate) fn dispatch<'g>(&'g self, mut core: CoreGuard<'g>, what: Notify) -> CoreGuard<'g> {
        self.wake_all();
        let Some(upcalls) = core.upcalls.clone() else {
            return core;
        };
        let callback = match what {
            Notify::Read => upcalls.read.clone().map(Callback::Data),
            Notify::Write => upcalls.write.clone().map(Callback::Data),
            Notify::Event(events) => upcalls.events.as_ref().and_then(|(mask, f)| {
                let hit = events & *mask;
                (!hit.is_empty()).then(|| Callback::Event(f.clone(), hit))
            }),
        };
        let Some(callback) = callback else {
            return core;
        };

        match upcalls.mode {
            UpcallMode::Locked => {
                callback.invoke(&Upcall {
                    socket: self,
                    core: Some(&*core),
                    context: upcalls.context.as_ref(),
                });
                core
            }
            UpcallMode::Unlocked => {
                let me = thread::current().id();
                core.upcall_inflight += 1;
                core.upcall_threads.push(me);
                let (mut core, ()) = self.with_unlocked(core, || {
                    callback.invoke(&Upcall {
                        socket: self,
                        core: None,
                        context: upcalls.context.as_ref(),
                    })
                });
                core.upcall_inflight -= 1;
                if let Some(pos) = core.upcall_threads.iter().position(|t| *t == me) {
                    core.upcall_threads.swap_remove(pos);
                }
                if core.upcall_inflight == 0 {
                    self.wake_all();
                }
                core
            }
        }
    }

    /// Waits until no unlocked callback is running on another thread.
    pub(crate) fn drain_upcalls<'g>(&'g self, mut core: CoreGuard<'g>) -> CoreGuard<'g> {
        let me = thread::current().id();
        while core.upcall_inflight > 0 && !core.upcall_threads.contains(&me) {
            core = self
                .0
                .cond
                .wait(core)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
        core
    }
}
