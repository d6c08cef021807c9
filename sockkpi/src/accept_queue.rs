//! # Accept Queue
//!
//! ## Purpose
//!
//! Holds the connections of a listening socket until `accept` claims them: embryonic children
//! whose handshake is still running, and completed children in completion order.
//!
//! ## How it works
//!
//! The queue has its own mutex, separate from the listener's socket lock. `acquire()` returns a
//! guard; dropping the guard is the release. Producers (protocol handlers completing a
//! handshake) only take the queue lock, never the listener's socket lock while holding it. The
//! consumer may take the queue lock while holding the listener's socket lock, so the order is
//! always socket lock, then queue lock.
//!
//! A child is in at most one of the two lists, at most once. `pop` unlinks a child before the
//! guard is dropped, so the backlog count already excludes it when `accept` returns.

use crate::error::{SockError, SockResult};
use crate::socket::Socket;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct QueueInner {
    incomplete: Vec<Socket>,
    complete: VecDeque<Socket>,
    limit: usize,
}

pub(crate) struct AcceptQueue {
    inner: Mutex<QueueInner>,
}

impl AcceptQueue {
    pub fn new() -> Self {
        AcceptQueue {
            inner: Mutex::new(QueueInner::default()),
        }
    }

    pub fn acquire(&self) -> QueueGuard<'_> {
        QueueGuard(self.inner.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// Exclusive access to an accept queue. Dropping it releases the queue.
pub(crate) struct QueueGuard<'a>(MutexGuard<'a, QueueInner>);

impl QueueGuard<'_> {
    /// Embryonic plus completed connections.
    pub fn len(&self) -> usize {
        self.0.incomplete.len() + self.0.complete.len()
    }

    pub fn set_limit(&mut self, limit: usize) {
        self.0.limit = limit;
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.0.limit
    }

    /// Records an embryonic child. Fails when the backlog is exhausted.
    pub fn push_incomplete(&mut self, child: Socket) -> SockResult<()> {
        if self.is_full() {
            return Err(SockError::ResourceExhausted);
        }
        if self.contains(child.id()) {
            return Err(SockError::InvalidArgument);
        }
        self.0.incomplete.push(child);
        Ok(())
    }

    /// Moves a child from the embryonic list to the tail of the completed list.
    ///
    /// # Returns
    /// `false` when the child was not embryonic on this queue.
    pub fn complete(&mut self, id: u64) -> bool {
        match self.0.incomplete.iter().position(|s| s.id() == id) {
            Some(pos) => {
                let child = self.0.incomplete.swap_remove(pos);
                self.0.complete.push_back(child);
                true
            }
            None => false,
        }
    }

    /// Takes the oldest completed child.
    pub fn pop(&mut self) -> Option<Socket> {
        self.0.complete.pop_front()
    }

    /// Unlinks a child from whichever list holds it.
    pub fn remove(&mut self, id: u64) -> Option<Socket> {
        if let Some(pos) = self.0.incomplete.iter().position(|s| s.id() == id) {
            return Some(self.0.incomplete.swap_remove(pos));
        }
        let pos = self.0.complete.iter().position(|s| s.id() == id)?;
        self.0.complete.remove(pos)
    }

    /// Empties both lists, completed children first.
    pub fn drain(&mut self) -> Vec<Socket> {
        let mut all: Vec<Socket> = self.0.complete.drain(..).collect();
        all.append(&mut self.0.incomplete);
        all
    }

    fn contains(&self, id: u64) -> bool {
        self.0.incomplete.iter().any(|s| s.id() == id)
            || self.0.complete.iter().any(|s| s.id() == id)
    }
}
