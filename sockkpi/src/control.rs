//! # Ancillary Control Data
//!
//! ## Purpose
//!
//! Send and receive calls may carry ancillary records next to the payload. Callers work with
//! typed records; protocol handlers see the generic wire form, a sequence of `cmsghdr`-style
//! records.
//!
//! ## How it works
//!
//! Each record is a 12-byte header (`len: u32`, `level: i32`, `type: i32`) padded to 8 bytes,
//! followed by the data, with the whole record padded to 8 bytes. `len` counts the padded
//! header plus the data. Known `(level, type)` pairs decode to typed variants, anything else is
//! kept as `Raw`. A record whose header or length runs past the end of the buffer stops the
//! decode and is reported as truncation instead of an error.
//!
//! ## Main components
//!
//! - `Ancillary`: typed records.
//! - `encode()`, `decode()`: conversion between typed records and the wire form.

use crate::options::{SO_TRAFFIC_CLASS, SOL_SOCKET};
use crate::tclass::TrafficClass;
use std::time::Duration;

const ALIGN: usize = 8;
const HDR_LEN: usize = 12;

const fn align(n: usize) -> usize {
    (n + ALIGN - 1) & !(ALIGN - 1)
}

const DATA_OFFSET: usize = align(HDR_LEN);

/// A typed ancillary record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Ancillary {
    /// Per-message traffic class.
    TrafficClass(TrafficClass),
    /// Receive timestamp since the Unix epoch.
    Timestamp(Duration),
    /// IPv6 packet info: interface index and address.
    PacketInfo { if_index: u32, addr: [u8; 16] },
    /// Anything without a typed form.
    Raw { level: i32, kind: i32, data: Vec<u8> },
}

impl Ancillary {
    fn level_kind(&self) -> (i32, i32) {
        match self {
            Ancillary::TrafficClass(_) => (SOL_SOCKET as i32, SO_TRAFFIC_CLASS as i32),
            Ancillary::Timestamp(_) => (libc::SOL_SOCKET, libc::SCM_TIMESTAMP),
            Ancillary::PacketInfo { .. } => (libc::IPPROTO_IPV6, libc::IPV6_PKTINFO),
            Ancillary::Raw { level, kind, .. } => (*level, *kind),
        }
    }

    fn data(&self) -> Vec<u8> {
        match self {
            Ancillary::TrafficClass(tc) => tc.value().to_ne_bytes().to_vec(),
            Ancillary::Timestamp(ts) => {
                let mut data = Vec::with_capacity(16);
                data.extend_from_slice(&(ts.as_secs() as i64).to_ne_bytes());
                data.extend_from_slice(&(ts.subsec_micros() as i64).to_ne_bytes());
                data
            }
            Ancillary::PacketInfo { if_index, addr } => {
                let mut data = Vec::with_capacity(20);
                data.extend_from_slice(addr);
                data.extend_from_slice(&if_index.to_ne_bytes());
                data
            }
            Ancillary::Raw { data, .. } => data.clone(),
        }
    }

    fn parse(level: i32, kind: i32, data: &[u8]) -> Self {
        let raw = || Ancillary::Raw {
            level,
            kind,
            data: data.to_vec(),
        };
        if level == SOL_SOCKET as i32 && kind == SO_TRAFFIC_CLASS as i32 && data.len() == 4 {
            let value = i32::from_ne_bytes([data[0], data[1], data[2], data[3]]);
            return TrafficClass::from_priority(value)
                .map(Ancillary::TrafficClass)
                .unwrap_or_else(|_| raw());
        }
        if level == libc::SOL_SOCKET && kind == libc::SCM_TIMESTAMP && data.len() == 16 {
            let mut sec = [0u8; 8];
            let mut usec = [0u8; 8];
            sec.copy_from_slice(&data[..8]);
            usec.copy_from_slice(&data[8..]);
            let (sec, usec) = (i64::from_ne_bytes(sec), i64::from_ne_bytes(usec));
            if sec >= 0 && (0..1_000_000).contains(&usec) {
                return Ancillary::Timestamp(
                    Duration::from_secs(sec as u64) + Duration::from_micros(usec as u64),
                );
            }
            return raw();
        }
        if level == libc::IPPROTO_IPV6 && kind == libc::IPV6_PKTINFO && data.len() == 20 {
            let mut addr = [0u8; 16];
            addr.copy_from_slice(&data[..16]);
            let if_index = u32::from_ne_bytes([data[16], data[17], data[18], data[19]]);
            return Ancillary::PacketInfo { if_index, addr };
        }
        raw()
    }
}

/// Encodes typed records into the wire form.
pub fn encode(records: &[Ancillary]) -> Vec<u8> {
    let mut out = Vec::new();
    for record in records {
        let (level, kind) = record.level_kind();
        let data = record.data();
        let len = DATA_OFFSET + data.len();
        let start = out.len();
        out.extend_from_slice(&(len as u32).to_ne_bytes());
        out.extend_from_slice(&level.to_ne_bytes());
        out.extend_from_slice(&kind.to_ne_bytes());
        out.resize(start + DATA_OFFSET, 0);
        out.extend_from_slice(&data);
        out.resize(start + align(len), 0);
    }
    out
}

/// Decodes the wire form. The flag is `true` when trailing bytes could not be decoded.
pub fn decode(mut bytes: &[u8]) -> (Vec<Ancillary>, bool) {
    let mut records = Vec::new();
    while !bytes.is_empty() {
        if bytes.len() < HDR_LEN {
            return (records, true);
        }
        let len = u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        let level = i32::from_ne_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let kind = i32::from_ne_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        if len < DATA_OFFSET || len > bytes.len() {
            return (records, true);
        }
        records.push(Ancillary::parse(level, kind, &bytes[DATA_OFFSET..len]));
        bytes = &bytes[align(len).min(bytes.len())..];
    }
    (records, false)
}

/// Traffic class requested by the records, if any.
pub(crate) fn traffic_class(records: &[Ancillary]) -> Option<TrafficClass> {
    records.iter().rev().find_map(|r| match r {
        Ancillary::TrafficClass(tc) => Some(*tc),
        _ => None,
    })
}
