// Local stream protocol: two bounded byte pipes per connection.

use super::{Namespace, is_free, lock, name_of, rcvbuf};
use crate::addr::SockAddr;
use crate::buffer::{Payload, Sink, Transfer};
use crate::error::{SockError, SockResult};
use crate::proto::{Handshake, MsgFlags, ProtocolHandler, RecvMeta, SendMeta};
use crate::socket::{Socket, WeakSocket};
use std::collections::VecDeque;
use std::net::Shutdown;
use std::sync::{Arc, Mutex};

struct PipeInner {
    buf: VecDeque<u8>,
    cap: usize,
    /// The writer will write no more.
    writer_done: bool,
    /// The reader will read no more.
    reader_done: bool,
}

/// One direction of a connection.
pub(crate) struct Pipe(Mutex<PipeInner>);

impl Pipe {
    fn new(cap: usize) -> Arc<Self> {
        Arc::new(Pipe(Mutex::new(PipeInner {
            buf: VecDeque::new(),
            cap,
            writer_done: false,
            reader_done: false,
        })))
    }
}

#[derive(Default)]
struct StreamState {
    /// Name this socket bound, and therefore owns in the name space.
    bound: Option<String>,
    rx: Option<Arc<Pipe>>,
    tx: Option<Arc<Pipe>>,
    peer: Option<WeakSocket>,
}

/// Handler of a local stream socket.
pub struct LocalStream {
    names: Arc<Namespace>,
    state: Mutex<StreamState>,
}

impl LocalStream {
    pub(crate) fn new(names: Arc<Namespace>) -> Self {
        LocalStream {
            names,
            state: Mutex::new(StreamState::default()),
        }
    }

    /// Handler of the accepting side of a new connection. The peer is linked only after the
    /// listener has queued the child.
    fn accepted(names: Arc<Namespace>, rx: Arc<Pipe>, tx: Arc<Pipe>) -> Self {
        LocalStream {
            names,
            state: Mutex::new(StreamState {
                bound: None,
                rx: Some(rx),
                tx: Some(tx),
                peer: None,
            }),
        }
    }

    fn pipes(&self) -> (Option<Arc<Pipe>>, Option<Arc<Pipe>>, Option<Socket>) {
        let st = lock(&self.state);
        (
            st.rx.clone(),
            st.tx.clone(),
            st.peer.as_ref().and_then(WeakSocket::upgrade),
        )
    }

    fn close_read(&self) {
        let (rx, _, peer) = self.pipes();
        if let Some(rx) = rx {
            let mut pipe = lock(&rx.0);
            pipe.reader_done = true;
            pipe.buf.clear();
        }
        if let Some(peer) = peer {
            peer.wakeup_write(0);
        }
    }

    fn close_write(&self) {
        let (_, tx, peer) = self.pipes();
        if let Some(tx) = tx {
            lock(&tx.0).writer_done = true;
        }
        if let Some(peer) = peer {
            peer.mark_eof();
        }
    }
}

impl ProtocolHandler for LocalStream {
    fn bind(&self, so: &Socket, addr: &SockAddr) -> SockResult<SockAddr> {
        let name = name_of(addr)?;
        let mut names = lock(&self.names.streams);
        if !is_free(names.get(&name)) {
            return Err(SockError::AddressInUse);
        }
        names.insert(name.clone(), so.downgrade());
        lock(&self.state).bound = Some(name);
        Ok(addr.clone())
    }

    fn listen(&self, _so: &Socket, _backlog: u32) -> SockResult<()> {
        if lock(&self.state).bound.is_none() {
            return Err(SockError::InvalidArgument);
        }
        Ok(())
    }

    fn connect(&self, so: &Socket, addr: &SockAddr) -> SockResult<Handshake> {
        let name = name_of(addr)?;
        let listener = lock(&self.names.streams)
            .get(&name)
            .and_then(WeakSocket::upgrade)
            .ok_or(SockError::AddressUnavailable)?;
        if listener == *so {
            return Err(SockError::InvalidArgument);
        }

        let to_server = Pipe::new(rcvbuf(&listener)?);
        let to_client = Pipe::new(rcvbuf(so)?);
        let child_handler = Arc::new(LocalStream::accepted(
            self.names.clone(),
            to_server.clone(),
            to_client.clone(),
        ));
        let child = listener.spawn_connection(child_handler.clone())?;
        lock(&child_handler.state).peer = Some(so.downgrade());
        {
            let mut st = lock(&self.state);
            st.rx = Some(to_client);
            st.tx = Some(to_server);
            st.peer = Some(child.downgrade());
        }
        let me = so.local_address().ok();
        child.set_connected(me)?;
        Ok(Handshake::Complete(Some(addr.clone())))
    }

    fn send(&self, _so: &Socket, payload: &mut Payload<'_>, _meta: &SendMeta) -> Transfer {
        let (_, tx, peer) = self.pipes();
        let Some(tx) = tx else {
            return Transfer::failed(SockError::NotConnected);
        };
        let mut pipe = lock(&tx.0);
        if pipe.reader_done || pipe.writer_done {
            return Transfer::failed(SockError::BrokenPipe);
        }
        let space = pipe.cap.saturating_sub(pipe.buf.len());
        if payload.is_atomic() && payload.remaining() > pipe.cap {
            return Transfer::failed(SockError::InvalidArgument);
        }
        if space == 0 || (payload.is_atomic() && payload.remaining() > space) {
            return Transfer::failed(SockError::WouldBlock);
        }
        let data = payload.peek(space);
        pipe.buf.extend(data.iter().copied());
        let queued = pipe.buf.len();
        drop(pipe);
        if let Some(peer) = peer {
            peer.wakeup_read(queued);
        }
        Transfer::done(data.len())
    }

    fn receive(&self, so: &Socket, sink: &mut Sink<'_, '_>, meta: &mut RecvMeta) -> Transfer {
        let (rx, _, peer) = self.pipes();
        let Some(rx) = rx else {
            return Transfer::failed(SockError::NotConnected);
        };
        let mut pipe = lock(&rx.0);
        if pipe.buf.is_empty() {
            return if pipe.writer_done {
                Transfer::done(0)
            } else {
                Transfer::failed(SockError::WouldBlock)
            };
        }
        let (front, back) = pipe.buf.as_slices();
        let (mut n, _) = sink.fill(front);
        if n == front.len() && !back.is_empty() {
            n += sink.fill(back).0;
        }
        if meta.request.contains(MsgFlags::PEEK) {
            return Transfer::done(n);
        }
        pipe.buf.drain(..n);
        let (left, space) = (pipe.buf.len(), pipe.cap - pipe.buf.len());
        drop(pipe);
        so.set_available(left);
        if let Some(peer) = peer.filter(|_| n > 0) {
            peer.wakeup_write(space);
        }
        Transfer::done(n)
    }

    fn local_address(&self, _so: &Socket) -> SockResult<SockAddr> {
        match &lock(&self.state).bound {
            Some(name) => SockAddr::local(name),
            None => Err(SockError::Unsupported),
        }
    }

    fn shutdown(&self, _so: &Socket, how: Shutdown) -> SockResult<()> {
        if matches!(how, Shutdown::Read | Shutdown::Both) {
            self.close_read();
        }
        if matches!(how, Shutdown::Write | Shutdown::Both) {
            self.close_write();
        }
        Ok(())
    }

    fn close(&self, so: &Socket) {
        self.close_read();
        self.close_write();
        let bound = {
            let mut st = lock(&self.state);
            st.rx = None;
            st.tx = None;
            st.peer = None;
            st.bound.take()
        };
        if let Some(name) = bound {
            let mut names = lock(&self.names.streams);
            if names.get(&name).and_then(WeakSocket::upgrade).as_ref() == Some(so) {
                names.remove(&name);
            }
        }
    }

    fn connected_refs(&self) -> u32 {
        1
    }
}
