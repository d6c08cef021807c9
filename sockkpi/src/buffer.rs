//! # Buffer Abstraction
//!
//! ## Purpose
//!
//! A transport-agnostic view of the bytes being sent or received. A transfer is either
//! vectored (scatter/gather over caller slices, may complete partially) or a whole record
//! (moved as a unit, never split).
//!
//! ## How it works
//!
//! `IoVec` and `IoVecMut` are cursors over `IoSlice` / `IoSliceMut` arrays. They remember how
//! far a transfer got, so a send interrupted after K bytes can resume from byte K on the next
//! call. `Payload` and `Sink` wrap the cursor or the record and are what protocol handlers
//! receive. Handlers only read from a `Payload`; the socket layer advances it by the byte count
//! the handler reports. `Transfer` is what a handler hands back: the byte count plus the
//! status, so a retryable error never loses the count.
//!
//! ## Main components
//!
//! - `IoVec`, `IoVecMut`: gather/scatter cursors.
//! - `Payload`: outgoing data handed to a protocol handler.
//! - `Sink`: incoming data destination handed to a protocol handler.
//! - `Transfer`: the outcome of one handler transfer.

use crate::error::{SockError, SockResult};
use std::io::{IoSlice, IoSliceMut};

/// Gather cursor over caller-provided slices.
#[derive(Clone)]
pub struct IoVec<'a> {
    slices: &'a [IoSlice<'a>],
    index: usize,
    offset: usize,
    consumed: usize,
}

impl<'a> IoVec<'a> {
    pub fn new(slices: &'a [IoSlice<'a>]) -> Self {
        let mut iov = IoVec {
            slices,
            index: 0,
            offset: 0,
            consumed: 0,
        };
        iov.skip_empty();
        iov
    }

    /// Total length of all slices.
    pub fn len(&self) -> usize {
        self.slices.iter().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn consumed(&self) -> usize {
        self.consumed
    }

    pub fn remaining(&self) -> usize {
        self.len() - self.consumed
    }

    /// The unconsumed part of the current slice.
    pub fn chunk(&self) -> &'a [u8] {
        match self.slices.get(self.index) {
            Some(slice) => {
                let bytes: &'a [u8] = slice;
                &bytes[self.offset..]
            }
            None => &[],
        }
    }

    /// Marks `n` bytes as transferred.
    pub fn advance(&mut self, mut n: usize) {
        n = n.min(self.remaining());
        self.consumed += n;
        while n > 0 {
            let left = self.slices[self.index].len() - self.offset;
            if n < left {
                self.offset += n;
                n = 0;
            } else {
                n -= left;
                self.index += 1;
                self.offset = 0;
            }
        }
        self.skip_empty();
    }

    /// Copies up to `max` bytes out of the cursor and advances past them.
    pub fn take(&mut self, max: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(max.min(self.remaining()));
        while out.len() < max {
            let chunk = self.chunk();
            if chunk.is_empty() {
                break;
            }
            let n = chunk.len().min(max - out.len());
            out.extend_from_slice(&chunk[..n]);
            self.advance(n);
        }
        out
    }

    fn skip_empty(&mut self) {
        while self.index < self.slices.len() && self.slices[self.index].len() == self.offset {
            self.index += 1;
            self.offset = 0;
        }
    }
}

/// Scatter cursor over caller-provided mutable slices.
pub struct IoVecMut<'a, 'b> {
    slices: &'a mut [IoSliceMut<'b>],
    index: usize,
    offset: usize,
    filled: usize,
}

impl<'a, 'b> IoVecMut<'a, 'b> {
    pub fn new(slices: &'a mut [IoSliceMut<'b>]) -> Self {
        IoVecMut {
            slices,
            index: 0,
            offset: 0,
            filled: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slices.iter().map(|s| s.len()).sum()
    }

    pub fn filled(&self) -> usize {
        self.filled
    }

    pub fn remaining(&self) -> usize {
        self.capacity() - self.filled
    }

    /// Copies as much of `src` as fits and returns the number of bytes copied.
    pub fn fill(&mut self, src: &[u8]) -> usize {
        let mut copied = 0;
        while copied < src.len() && self.index < self.slices.len() {
            let dst = &mut self.slices[self.index][self.offset..];
            let n = dst.len().min(src.len() - copied);
            dst[..n].copy_from_slice(&src[copied..copied + n]);
            copied += n;
            self.offset += n;
            if self.offset == self.slices[self.index].len() {
                self.index += 1;
                self.offset = 0;
            }
        }
        self.filled += copied;
        copied
    }
}

/// Outgoing data handed to a protocol handler's `send`.
pub enum Payload<'a> {
    /// Byte stream; the handler may take any prefix.
    Stream(IoVec<'a>),
    /// Whole message; the handler takes all of it or none of it.
    Record(Option<Vec<u8>>),
}

impl<'a> Payload<'a> {
    pub fn is_atomic(&self) -> bool {
        matches!(self, Payload::Record(_))
    }

    pub fn remaining(&self) -> usize {
        match self {
            Payload::Stream(iov) => iov.remaining(),
            Payload::Record(record) => record.as_ref().map_or(0, Vec::len),
        }
    }

    /// The next contiguous run of unsent bytes.
    pub fn chunk(&self) -> &[u8] {
        match self {
            Payload::Stream(iov) => iov.chunk(),
            Payload::Record(record) => record.as_deref().unwrap_or(&[]),
        }
    }

    /// Marks `n` bytes as sent. Advancing a record by any amount consumes all of it.
    pub fn advance(&mut self, n: usize) {
        match self {
            Payload::Stream(iov) => iov.advance(n),
            Payload::Record(record) => {
                if n > 0 {
                    record.take();
                }
            }
        }
    }

    /// Copies up to `max` unsent bytes without consuming them. A record is copied whole,
    /// regardless of `max`.
    pub fn peek(&self, max: usize) -> Vec<u8> {
        match self {
            Payload::Stream(iov) => iov.clone().take(max),
            Payload::Record(record) => record.clone().unwrap_or_default(),
        }
    }
}

/// Incoming data destination handed to a protocol handler's `receive`.
pub enum Sink<'a, 'b> {
    Stream(IoVecMut<'a, 'b>),
    Record {
        limit: usize,
        record: Option<Vec<u8>>,
    },
}

impl<'a, 'b> Sink<'a, 'b> {
    pub fn record(limit: usize) -> Self {
        Sink::Record {
            limit,
            record: None,
        }
    }

    pub fn is_atomic(&self) -> bool {
        matches!(self, Sink::Record { .. })
    }

    pub fn capacity(&self) -> usize {
        match self {
            Sink::Stream(iov) => iov.remaining(),
            Sink::Record { limit, record } => {
                if record.is_some() {
                    0
                } else {
                    *limit
                }
            }
        }
    }

    /// Stores `data`, returning the number of bytes kept and whether the rest was cut off.
    pub fn fill(&mut self, data: &[u8]) -> (usize, bool) {
        match self {
            Sink::Stream(iov) => {
                let n = iov.fill(data);
                (n, n < data.len())
            }
            Sink::Record { limit, record } => {
                if record.is_some() {
                    return (0, !data.is_empty());
                }
                let n = data.len().min(*limit);
                *record = Some(data[..n].to_vec());
                (n, n < data.len())
            }
        }
    }

    pub fn filled(&self) -> usize {
        match self {
            Sink::Stream(iov) => iov.filled(),
            Sink::Record { record, .. } => record.as_ref().map_or(0, Vec::len),
        }
    }

    /// `true` once a record, possibly empty, has been stored.
    pub fn has_record(&self) -> bool {
        matches!(self, Sink::Record { record: Some(_), .. })
    }

    pub(crate) fn into_record(self) -> Option<Vec<u8>> {
        match self {
            Sink::Stream(_) => None,
            Sink::Record { record, .. } => record,
        }
    }
}

/// Outcome of a single protocol handler transfer.
///
/// `bytes` is valid even when `status` is an error, so partial progress is never lost.
#[derive(Debug)]
pub struct Transfer {
    pub bytes: usize,
    pub status: SockResult<()>,
}

impl Transfer {
    pub fn done(bytes: usize) -> Self {
        Transfer {
            bytes,
            status: Ok(()),
        }
    }

    pub fn partial(bytes: usize, error: SockError) -> Self {
        Transfer {
            bytes,
            status: Err(error),
        }
    }

    pub fn failed(error: SockError) -> Self {
        Transfer::partial(0, error)
    }
}
