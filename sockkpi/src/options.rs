//! # Option Marshaling
//!
//! ## Purpose
//!
//! Generic get/set of `{level, name, value}` options and ioctls. Socket-level options are
//! handled here under the socket lock; everything else goes to the protocol handler.
//!
//! ## How it works
//!
//! A `SockOpt` is built per call. For `Set` its `value` holds the input bytes. For `Get` the
//! capacity of `value` is the caller's buffer size and `size` reports the bytes written, which
//! never exceeds that capacity. Integer values are native-endian `i32`.
//!
//! Protocol-level requests are delegated with the lock released; on return the socket is
//! re-validated because it may have gone defunct in the meantime.
//!
//! ## Main components
//!
//! - `SockOpt`, `OptDirection`: the option triple.
//! - `Socket::sockopt`, `setsockopt`, `getsockopt`: marshaling entry points.
//! - `Socket::ioctl`: `FIONBIO`, `FIONREAD` and pass-through.
//! - `Socket::set_traffic_class` and friends: typed wrappers.

use crate::config::MAX_BUFFER;
use crate::error::{SockError, SockResult};
use crate::proto::Control;
use crate::socket::{CoreGuard, OptFlags, Socket};
use crate::tclass::TrafficClass;
use std::time::Duration;

pub const SOL_SOCKET: u32 = libc::SOL_SOCKET as u32;
pub const SO_DEBUG: u32 = libc::SO_DEBUG as u32;
pub const SO_REUSEADDR: u32 = libc::SO_REUSEADDR as u32;
pub const SO_TYPE: u32 = libc::SO_TYPE as u32;
pub const SO_ERROR: u32 = libc::SO_ERROR as u32;
pub const SO_DONTROUTE: u32 = libc::SO_DONTROUTE as u32;
pub const SO_BROADCAST: u32 = libc::SO_BROADCAST as u32;
pub const SO_SNDBUF: u32 = libc::SO_SNDBUF as u32;
pub const SO_RCVBUF: u32 = libc::SO_RCVBUF as u32;
pub const SO_KEEPALIVE: u32 = libc::SO_KEEPALIVE as u32;
pub const SO_OOBINLINE: u32 = libc::SO_OOBINLINE as u32;
pub const SO_LINGER: u32 = libc::SO_LINGER as u32;
pub const SO_RCVLOWAT: u32 = libc::SO_RCVLOWAT as u32;
pub const SO_SNDLOWAT: u32 = libc::SO_SNDLOWAT as u32;
pub const SO_RCVTIMEO: u32 = libc::SO_RCVTIMEO as u32;
pub const SO_SNDTIMEO: u32 = libc::SO_SNDTIMEO as u32;
pub const SO_ACCEPTCONN: u32 = libc::SO_ACCEPTCONN as u32;
pub const SO_TRAFFIC_CLASS: u32 = 0x1086;
pub const SO_NONBLOCK: u32 = 0x1100;

pub const FIONBIO: u64 = libc::FIONBIO as u64;
pub const FIONREAD: u64 = libc::FIONREAD as u64;

const INT_LEN: usize = 4;
const LINGER_LEN: usize = 8;
const TIMEVAL_LEN: usize = 16;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OptDirection {
    Get,
    Set,
}

/// One option request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SockOpt {
    pub direction: OptDirection,
    pub level: u32,
    pub name: u32,
    /// Input for `Set`; output buffer for `Get`.
    pub value: Vec<u8>,
    /// Bytes of `value` that are meaningful.
    pub size: usize,
}

impl SockOpt {
    /// A `Get` request with room for `capacity` bytes.
    pub fn get(level: u32, name: u32, capacity: usize) -> Self {
        SockOpt {
            direction: OptDirection::Get,
            level,
            name,
            value: vec![0; capacity],
            size: 0,
        }
    }

    pub fn set(level: u32, name: u32, value: impl Into<Vec<u8>>) -> Self {
        let value = value.into();
        SockOpt {
            direction: OptDirection::Set,
            level,
            name,
            size: value.len(),
            value,
        }
    }

    pub fn set_int(level: u32, name: u32, value: i32) -> Self {
        Self::set(level, name, value.to_ne_bytes())
    }

    /// The meaningful bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.value[..self.size.min(self.value.len())]
    }

    pub fn as_int(&self) -> SockResult<i32> {
        match self.bytes() {
            [a, b, c, d, ..] => Ok(i32::from_ne_bytes([*a, *b, *c, *d])),
            _ => Err(SockError::InvalidArgument),
        }
    }

    /// Writes a result for a `Get`, truncated to the caller's capacity.
    pub fn put(&mut self, data: &[u8]) {
        let n = data.len().min(self.value.len());
        self.value[..n].copy_from_slice(&data[..n]);
        self.size = n;
    }

    pub fn put_int(&mut self, value: i32) {
        self.put(&value.to_ne_bytes());
    }

    fn need(&self, len: usize) -> SockResult<&[u8]> {
        let bytes = self.bytes();
        if bytes.len() < len {
            return Err(SockError::InvalidArgument);
        }
        Ok(&bytes[..len])
    }
}

fn flag_for(name: u32) -> Option<OptFlags> {
    match name {
        SO_REUSEADDR => Some(OptFlags::REUSEADDR),
        SO_KEEPALIVE => Some(OptFlags::KEEPALIVE),
        SO_DEBUG => Some(OptFlags::DEBUG),
        SO_DONTROUTE => Some(OptFlags::DONTROUTE),
        SO_BROADCAST => Some(OptFlags::BROADCAST),
        SO_OOBINLINE => Some(OptFlags::OOBINLINE),
        _ => None,
    }
}

fn int_at(bytes: &[u8], at: usize) -> i32 {
    i32::from_ne_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn i64_at(bytes: &[u8], at: usize) -> i64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    i64::from_ne_bytes(raw)
}

fn timeval(timeout: Option<Duration>) -> [u8; TIMEVAL_LEN] {
    let (sec, usec) = timeout.map_or((0, 0), |t| (t.as_secs() as i64, t.subsec_micros() as i64));
    let mut out = [0u8; TIMEVAL_LEN];
    out[..8].copy_from_slice(&sec.to_ne_bytes());
    out[8..].copy_from_slice(&usec.to_ne_bytes());
    out
}

fn parse_timeval(bytes: &[u8]) -> SockResult<Option<Duration>> {
    let (sec, usec) = (i64_at(bytes, 0), i64_at(bytes, 8));
    if sec < 0 || !(0..1_000_000).contains(&usec) {
        return Err(SockError::InvalidArgument);
    }
    let timeout = Duration::from_secs(sec as u64) + Duration::from_micros(usec as u64);
    Ok((!timeout.is_zero()).then_some(timeout))
}

fn buffer_size(value: i32) -> SockResult<usize> {
    if value <= 0 {
        return Err(SockError::InvalidArgument);
    }
    let value = value as usize;
    if value > MAX_BUFFER {
        return Err(SockError::ResourceExhausted);
    }
    Ok(value)
}

impl Socket {
    /// Processes one option request.
    ///
    /// # Arguments
    /// * `opt` - The request. For `Get`, the result is written into `opt.value` and `opt.size`.
    ///
    /// # Returns
    /// `InvalidArgument` for short values or read-only options, `PermissionDenied` for a
    /// privileged traffic class on an unprivileged socket, or the protocol's result for
    /// options this layer does not own.
    pub fn sockopt(&self, opt: &mut SockOpt) -> SockResult<()> {
        let mut core = self.lock();
        core.check_alive()?;
        if opt.level == SOL_SOCKET {
            let handled = match opt.direction {
                OptDirection::Set => self.set_builtin(&mut core, opt)?,
                OptDirection::Get => self.get_builtin(&mut core, opt),
            };
            if handled {
                return Ok(());
            }
        }
        let (core, result) =
            self.with_unlocked(core, || self.0.handler.control(self, Control::Option(opt)));
        core.check_alive()?;
        result
    }

    pub fn setsockopt(&self, level: u32, name: u32, value: &[u8]) -> SockResult<()> {
        self.sockopt(&mut SockOpt::set(level, name, value))
    }

    /// Reads an option into a buffer of `capacity` bytes and returns the bytes written.
    pub fn getsockopt(&self, level: u32, name: u32, capacity: usize) -> SockResult<Vec<u8>> {
        let mut opt = SockOpt::get(level, name, capacity);
        self.sockopt(&mut opt)?;
        opt.value.truncate(opt.size);
        Ok(opt.value)
    }

    pub fn set_traffic_class(&self, tc: TrafficClass) -> SockResult<()> {
        self.sockopt(&mut SockOpt::set_int(SOL_SOCKET, SO_TRAFFIC_CLASS, tc.value()))
    }

    pub fn traffic_class(&self) -> TrafficClass {
        self.lock().traffic_class
    }

    /// Selects the traffic class matching a DSCP code point.
    pub fn set_tc_from_dscp(&self, dscp: u8) -> SockResult<()> {
        self.set_traffic_class(TrafficClass::from_dscp(dscp))
    }

    /// Handles `FIONBIO` and `FIONREAD`; passes every other command to the protocol.
    pub fn ioctl(&self, cmd: u64, arg: &mut [u8]) -> SockResult<()> {
        let mut core = self.lock();
        core.check_alive()?;
        match cmd {
            FIONBIO => {
                let on = arg.get(..INT_LEN).ok_or(SockError::InvalidArgument)?;
                core.nonblocking = int_at(on, 0) != 0;
                Ok(())
            }
            FIONREAD => {
                let out = arg.get_mut(..INT_LEN).ok_or(SockError::InvalidArgument)?;
                let avail = i32::try_from(core.rcv.avail).unwrap_or(i32::MAX);
                out.copy_from_slice(&avail.to_ne_bytes());
                Ok(())
            }
            _ => {
                let (core, result) = self.with_unlocked(core, || {
                    self.0.handler.control(self, Control::Ioctl { cmd, arg })
                });
                core.check_alive()?;
                result
            }
        }
    }

    /// Applies a socket-level option. Returns `false` for names this layer does not own.
    fn set_builtin(&self, core: &mut CoreGuard<'_>, opt: &SockOpt) -> SockResult<bool> {
        if let Some(flag) = flag_for(opt.name) {
            let on = int_at(opt.need(INT_LEN)?, 0) != 0;
            core.options.set(flag, on);
            return Ok(true);
        }
        match opt.name {
            SO_SNDBUF => core.snd.hiwat = buffer_size(opt.as_int()?)?,
            SO_RCVBUF => core.rcv.hiwat = buffer_size(opt.as_int()?)?,
            SO_SNDLOWAT => {
                let lowat = opt.as_int()?.max(1) as usize;
                core.snd.lowat = lowat.min(core.snd.hiwat);
            }
            SO_RCVLOWAT => {
                let lowat = opt.as_int()?.max(1) as usize;
                core.rcv.lowat = lowat.min(core.rcv.hiwat);
            }
            SO_LINGER => {
                let raw = opt.need(LINGER_LEN)?;
                let (onoff, secs) = (int_at(raw, 0), int_at(raw, 4));
                if secs < 0 {
                    return Err(SockError::InvalidArgument);
                }
                core.linger = (onoff != 0).then_some(secs);
            }
            SO_RCVTIMEO => core.rcv.timeout = parse_timeval(opt.need(TIMEVAL_LEN)?)?,
            SO_SNDTIMEO => core.snd.timeout = parse_timeval(opt.need(TIMEVAL_LEN)?)?,
            SO_NONBLOCK => core.nonblocking = opt.as_int()? != 0,
            SO_TRAFFIC_CLASS => {
                let tc = TrafficClass::from_priority(opt.as_int()?)?;
                if tc.requires_privilege() && !core.privileged {
                    return Err(SockError::PermissionDenied);
                }
                core.traffic_class = tc;
            }
            SO_ERROR | SO_TYPE | SO_ACCEPTCONN => return Err(SockError::InvalidArgument),
            _ => return Ok(false),
        }
        log::debug!("socket {}: set option {:#x}", self.id(), opt.name);
        Ok(true)
    }

    /// Reads a socket-level option. Returns `false` for names this layer does not own.
    fn get_builtin(&self, core: &mut CoreGuard<'_>, opt: &mut SockOpt) -> bool {
        if let Some(flag) = flag_for(opt.name) {
            opt.put_int(core.options.contains(flag) as i32);
            return true;
        }
        let clamp = |n: usize| i32::try_from(n).unwrap_or(i32::MAX);
        match opt.name {
            SO_SNDBUF => opt.put_int(clamp(core.snd.hiwat)),
            SO_RCVBUF => opt.put_int(clamp(core.rcv.hiwat)),
            SO_SNDLOWAT => opt.put_int(clamp(core.snd.lowat)),
            SO_RCVLOWAT => opt.put_int(clamp(core.rcv.lowat)),
            SO_LINGER => {
                let mut raw = [0u8; LINGER_LEN];
                raw[..4].copy_from_slice(&(core.linger.is_some() as i32).to_ne_bytes());
                raw[4..].copy_from_slice(&core.linger.unwrap_or(0).to_ne_bytes());
                opt.put(&raw);
            }
            SO_RCVTIMEO => opt.put(&timeval(core.rcv.timeout)),
            SO_SNDTIMEO => opt.put(&timeval(core.snd.timeout)),
            SO_NONBLOCK => opt.put_int(core.nonblocking as i32),
            SO_TRAFFIC_CLASS => opt.put_int(core.traffic_class.value()),
            SO_ERROR => {
                let errno = core.pending_error.take().map_or(0, |e| e.errno());
                opt.put_int(errno);
            }
            SO_TYPE => opt.put_int(self.0.kind.ty as i32),
            SO_ACCEPTCONN => opt.put_int(core.options.contains(OptFlags::ACCEPTCONN) as i32),
            _ => return false,
        }
        true
    }
}
