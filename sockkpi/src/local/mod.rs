//! # Local-Domain Protocols
//!
//! ## Purpose
//!
//! In-process stream and datagram protocols for `Domain::Local`, addressed by name. They are
//! complete `ProtocolHandler` implementations and what the crate's own tests run against.
//!
//! ## How it works
//!
//! `register` creates one name space shared by every socket the registry produces, and
//! installs a factory per socket type. Streams are pairs of bounded byte pipes between the
//! connecting socket and an embryonic child of the listener. Datagrams go into the bounded
//! inbox of the socket bound to the destination name.
//!
//! ## Main components
//!
//! - `register()`: installs both protocols on a `RegistryBuilder`.
//! - `stream::LocalStream`, `dgram::LocalDgram`: the handlers.

mod dgram;
mod stream;

use crate::addr::{Domain, SockAddr, SockKind, SockType};
use crate::error::{SockError, SockResult};
use crate::options::{SO_RCVBUF, SOL_SOCKET};
use crate::proto::{ProtocolHandler, RegistryBuilder};
use crate::socket::{Socket, WeakSocket};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

pub use dgram::LocalDgram;
pub use stream::LocalStream;

/// Protocol number of the local protocols.
pub const LOCAL_PROTOCOL: i32 = 0;

/// Installs the local stream and datagram protocols.
pub fn register(builder: RegistryBuilder) -> RegistryBuilder {
    let names = Arc::new(Namespace::default());
    let streams = names.clone();
    builder
        .register(
            Domain::Local,
            SockType::Stream,
            LOCAL_PROTOCOL,
            move |_kind: SockKind| -> SockResult<Arc<dyn ProtocolHandler>> {
                Ok(Arc::new(LocalStream::new(streams.clone())))
            },
        )
        .register(
            Domain::Local,
            SockType::Datagram,
            LOCAL_PROTOCOL,
            move |_kind: SockKind| -> SockResult<Arc<dyn ProtocolHandler>> {
                Ok(Arc::new(LocalDgram::new(names.clone())))
            },
        )
}

/// Bound names, one table per socket type.
#[derive(Default)]
pub(crate) struct Namespace {
    streams: Mutex<HashMap<String, WeakSocket>>,
    dgrams: Mutex<HashMap<String, (WeakSocket, Weak<dgram::Inbox>)>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn name_of(addr: &SockAddr) -> SockResult<String> {
    addr.local_name()
        .map(str::to_owned)
        .ok_or(SockError::InvalidArgument)
}

/// `SO_RCVBUF` of a socket, the capacity of what is queued towards it.
fn rcvbuf(so: &Socket) -> SockResult<usize> {
    let raw = so.getsockopt(SOL_SOCKET, SO_RCVBUF, 4)?;
    match raw.as_slice() {
        [a, b, c, d] => Ok(i32::from_ne_bytes([*a, *b, *c, *d]).max(1) as usize),
        _ => Err(SockError::InvalidArgument),
    }
}

/// A name is free when nothing live is bound to it.
fn is_free(entry: Option<&WeakSocket>) -> bool {
    entry
        .and_then(WeakSocket::upgrade)
        .is_none_or(|so| so.is_destroyed())
}
