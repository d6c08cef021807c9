// Local datagram protocol: records delivered into the inbox bound to a name.

use super::{Namespace, is_free, lock, name_of, rcvbuf};
use crate::addr::SockAddr;
use crate::buffer::{Payload, Sink, Transfer};
use crate::error::{SockError, SockResult};
use crate::proto::{Handshake, MsgFlags, ProtocolHandler, RecvMeta, SendMeta};
use crate::socket::Socket;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

struct Datagram {
    from: Option<SockAddr>,
    data: Vec<u8>,
    control: Vec<u8>,
}

#[derive(Default)]
struct Queue {
    items: VecDeque<Datagram>,
    bytes: usize,
    closed: bool,
}

/// Datagrams waiting for a bound socket.
#[derive(Default)]
pub(crate) struct Inbox(Mutex<Queue>);

#[derive(Default)]
struct DgramState {
    bound: Option<String>,
    peer: Option<SockAddr>,
}

/// Handler of a local datagram socket.
pub struct LocalDgram {
    names: Arc<Namespace>,
    inbox: Arc<Inbox>,
    state: Mutex<DgramState>,
}

impl LocalDgram {
    pub(crate) fn new(names: Arc<Namespace>) -> Self {
        LocalDgram {
            names,
            inbox: Arc::new(Inbox::default()),
            state: Mutex::new(DgramState::default()),
        }
    }

    fn lookup(&self, addr: &SockAddr) -> SockResult<(Socket, Arc<Inbox>)> {
        let name = name_of(addr)?;
        let names = lock(&self.names.dgrams);
        let (so, inbox) = names.get(&name).ok_or(SockError::AddressUnavailable)?;
        so.upgrade()
            .zip(inbox.upgrade())
            .ok_or(SockError::AddressUnavailable)
    }
}

impl ProtocolHandler for LocalDgram {
    fn bind(&self, so: &Socket, addr: &SockAddr) -> SockResult<SockAddr> {
        let name = name_of(addr)?;
        let mut names = lock(&self.names.dgrams);
        if !is_free(names.get(&name).map(|(so, _)| so)) {
            return Err(SockError::AddressInUse);
        }
        names.insert(name.clone(), (so.downgrade(), Arc::downgrade(&self.inbox)));
        lock(&self.state).bound = Some(name);
        Ok(addr.clone())
    }

    fn connect(&self, _so: &Socket, addr: &SockAddr) -> SockResult<Handshake> {
        self.lookup(addr)?;
        lock(&self.state).peer = Some(addr.clone());
        Ok(Handshake::Complete(Some(addr.clone())))
    }

    fn send(&self, _so: &Socket, payload: &mut Payload<'_>, meta: &SendMeta) -> Transfer {
        let (from, peer) = {
            let st = lock(&self.state);
            let from = st.bound.as_deref().and_then(|n| SockAddr::local(n).ok());
            (from, st.peer.clone())
        };
        let Some(to) = meta.to.clone().or(peer) else {
            return Transfer::failed(SockError::NotConnected);
        };
        let (target, inbox) = match self.lookup(&to) {
            Ok(found) => found,
            Err(e) => return Transfer::failed(e),
        };
        let cap = match rcvbuf(&target) {
            Ok(cap) => cap,
            Err(e) => return Transfer::failed(e),
        };
        let data = payload.peek(usize::MAX);
        if data.len() > cap {
            return Transfer::failed(SockError::InvalidArgument);
        }
        let mut queue = lock(&inbox.0);
        if queue.closed {
            return Transfer::failed(SockError::AddressUnavailable);
        }
        if queue.bytes + data.len() > cap {
            return Transfer::failed(SockError::WouldBlock);
        }
        let len = data.len();
        queue.bytes += len;
        queue.items.push_back(Datagram {
            from,
            data,
            control: meta.control.clone(),
        });
        let queued = queue.bytes;
        drop(queue);
        target.wakeup_read(queued);
        Transfer::done(len)
    }

    fn receive(&self, so: &Socket, sink: &mut Sink<'_, '_>, meta: &mut RecvMeta) -> Transfer {
        let mut queue = lock(&self.inbox.0);
        let peek = meta.request.contains(MsgFlags::PEEK);
        let Some(front) = queue.items.front() else {
            return Transfer::failed(SockError::WouldBlock);
        };
        let (n, truncated) = sink.fill(&front.data);
        meta.from = front.from.clone();
        meta.control = front.control.clone();
        if truncated {
            meta.flags |= MsgFlags::TRUNC;
        }
        if !peek {
            if let Some(taken) = queue.items.pop_front() {
                queue.bytes -= taken.data.len();
            }
        }
        let left = queue.bytes;
        drop(queue);
        so.set_available(left);
        Transfer::done(n)
    }

    fn local_address(&self, _so: &Socket) -> SockResult<SockAddr> {
        match &lock(&self.state).bound {
            Some(name) => SockAddr::local(name),
            None => Err(SockError::Unsupported),
        }
    }

    fn peer_address(&self, _so: &Socket) -> SockResult<SockAddr> {
        lock(&self.state).peer.clone().ok_or(SockError::NotConnected)
    }

    fn close(&self, so: &Socket) {
        {
            let mut queue = lock(&self.inbox.0);
            queue.closed = true;
            queue.items.clear();
            queue.bytes = 0;
        }
        let bound = lock(&self.state).bound.take();
        if let Some(name) = bound {
            let mut names = lock(&self.names.dgrams);
            let ours = names
                .get(&name)
                .and_then(|(s, _)| s.upgrade())
                .is_some_and(|s| s == *so);
            if ours {
                names.remove(&name);
            }
        }
    }
}
