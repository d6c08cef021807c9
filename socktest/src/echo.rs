use crate::runner::TestBed;
use sockkpi::options::{SO_RCVTIMEO, SOL_SOCKET};
use sockkpi::{MsgFlags, SockAddr, SockError, Socket};
use std::io::{IoSlice, IoSliceMut, Result};
use std::net::Shutdown;
use std::thread;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const POLL: Duration = Duration::from_millis(50);

fn timeval(t: Duration) -> Vec<u8> {
    let mut raw = (t.as_secs() as i64).to_ne_bytes().to_vec();
    raw.extend_from_slice(&(t.subsec_micros() as i64).to_ne_bytes());
    raw
}

fn send_all(so: &Socket, mut data: &[u8]) -> Result<()> {
    while !data.is_empty() {
        let n = so.send(&[IoSlice::new(data)], &[], MsgFlags::empty())?;
        data = &data[n..];
    }
    Ok(())
}

/// Accepts connections on `listener` and echoes each one on its own thread until `token` is
/// cancelled. Returns the number of connections served to completion.
pub fn run_echo_server(listener: &Socket, token: CancellationToken) -> Result<usize> {
    // Accepted children inherit the poll timeout.
    listener.setsockopt(SOL_SOCKET, SO_RCVTIMEO, &timeval(POLL))?;
    let mut workers = Vec::new();
    loop {
        match listener.accept(MsgFlags::empty()) {
            Ok(conn) => {
                log::debug!("[echo] accepted socket {}", conn.id());
                let token = token.clone();
                workers.push(thread::spawn(move || echo(conn, token)));
            }
            Err(SockError::WouldBlock) | Err(SockError::Interrupted) => {
                if token.is_cancelled() {
                    break;
                }
            }
            Err(e) => {
                log::error!("[echo] accept failed: {e}");
                return Err(e.into());
            }
        }
    }
    let mut served = 0;
    for worker in workers {
        match worker.join() {
            Ok(Ok(())) => served += 1,
            Ok(Err(e)) => log::warn!("[echo] connection failed: {e}"),
            Err(_) => log::error!("[echo] connection thread panicked"),
        }
    }
    Ok(served)
}

fn echo(conn: Socket, token: CancellationToken) -> Result<()> {
    let mut buf = [0u8; 512];
    loop {
        let got = match conn.receive(&mut [IoSliceMut::new(&mut buf)], MsgFlags::empty()) {
            Ok(got) => got,
            Err(SockError::WouldBlock) if !token.is_cancelled() => continue,
            Err(e) => {
                conn.close()?;
                return Err(e.into());
            }
        };
        if got.bytes == 0 {
            break;
        }
        send_all(&conn, &buf[..got.bytes])?;
    }
    log::debug!("[echo] socket {} done", conn.id());
    conn.close()?;
    Ok(())
}

/// Connects to the echo server at `name`, sends `message`, and returns what came back.
///
/// The whole message is sent before the reply is read, so it must fit in the socket buffers.
pub fn run_echo_client(bed: &TestBed, name: &str, message: &[u8]) -> Result<Vec<u8>> {
    let so = bed.local_stream()?;
    so.connect(&SockAddr::local(name)?, MsgFlags::empty())?;
    send_all(&so, message)?;
    so.shutdown(Shutdown::Write)?;

    let mut reply = Vec::with_capacity(message.len());
    let mut buf = [0u8; 256];
    loop {
        let got = so.receive(&mut [IoSliceMut::new(&mut buf)], MsgFlags::empty())?;
        if got.bytes == 0 {
            break;
        }
        reply.extend_from_slice(&buf[..got.bytes]);
    }
    so.close()?;
    Ok(reply)
}
