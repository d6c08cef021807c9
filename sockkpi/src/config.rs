//! # Stack Configuration
//!
//! ## Purpose
//!
//! Defaults applied to every socket a `Stack` creates: buffer high-water marks, the listen
//! backlog clamp, the blocking-wait timeout and the initial non-blocking mode.
//!
//! ## How it works
//!
//! `KpiConfig` is a plain set of optional knobs. `Stack::new` resolves it once into `Settings`,
//! filling in the defaults below, and every socket created afterwards copies what it needs.

use std::time::Duration;

pub(crate) const DEFAULT_SEND_BUFFER: usize = 8192;
pub(crate) const DEFAULT_RECV_BUFFER: usize = 8192;
pub(crate) const DEFAULT_MAX_BACKLOG: u32 = 128;
/// Largest value accepted for `SO_SNDBUF` / `SO_RCVBUF`.
pub(crate) const MAX_BUFFER: usize = 8 * 1024 * 1024;

/// Configuration for the sockets created by a `Stack`.
#[derive(Debug, Copy, Clone, Default)]
pub struct KpiConfig {
    /// Send buffer high-water mark in bytes.
    ///
    /// - `Some(n)`: New sockets start with `SO_SNDBUF == n`.
    /// - `None`: Defaults to 8 KiB.
    pub send_buffer: Option<usize>,
    /// Receive buffer high-water mark in bytes.
    ///
    /// - `Some(n)`: New sockets start with `SO_RCVBUF == n`.
    /// - `None`: Defaults to 8 KiB.
    pub recv_buffer: Option<usize>,
    /// Upper bound for the backlog passed to `listen`.
    ///
    /// - `Some(n)`: Backlogs above `n` (and a backlog of 0) are clamped to `n`.
    /// - `None`: Defaults to 128.
    pub max_backlog: Option<u32>,
    /// Timeout used by blocking waits.
    ///
    /// - `Some(d)`: Blocking accept, connect, send and receive give up after `d`.
    /// - `None`: Blocking calls wait until they can proceed or are cancelled.
    pub timeout: Option<Duration>,
    /// Initial non-blocking mode.
    ///
    /// - `Some(true)`: New sockets are non-blocking.
    /// - `Some(false)`, `None`: New sockets block.
    pub nonblocking: Option<bool>,
}

/// `KpiConfig` with every default filled in.
#[derive(Debug, Copy, Clone)]
pub(crate) struct Settings {
    pub send_buffer: usize,
    pub recv_buffer: usize,
    pub max_backlog: u32,
    pub timeout: Option<Duration>,
    pub nonblocking: bool,
}

impl From<Option<KpiConfig>> for Settings {
    fn from(config: Option<KpiConfig>) -> Self {
        let config = config.unwrap_or_default();
        Settings {
            send_buffer: config
                .send_buffer
                .filter(|&n| n > 0)
                .unwrap_or(DEFAULT_SEND_BUFFER)
                .min(MAX_BUFFER),
            recv_buffer: config
                .recv_buffer
                .filter(|&n| n > 0)
                .unwrap_or(DEFAULT_RECV_BUFFER)
                .min(MAX_BUFFER),
            max_backlog: config
                .max_backlog
                .filter(|&n| n > 0)
                .unwrap_or(DEFAULT_MAX_BACKLOG),
            timeout: config.timeout.filter(|d| !d.is_zero()),
            nonblocking: config.nonblocking.unwrap_or(false),
        }
    }
}
