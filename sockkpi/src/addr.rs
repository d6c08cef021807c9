//! # Socket Addresses and Kinds
//!
//! ## Purpose
//!
//! Addresses travel through the socket layer as opaque, family-tagged byte strings. The core
//! checks only the family and the length; turning the bytes into something meaningful is the
//! job of the protocol handler that owns the family.
//!
//! ## How it works
//!
//! `SockAddr` stores the family next to the encoded bytes. Constructors encode the common
//! families (IPv4/IPv6 socket addresses, link-layer interface addresses and local-domain names)
//! and the matching accessors decode them for handlers.
//!
//! ## Main components
//!
//! - `Domain`, `SockType`, `SockKind`: the (family, type, protocol) triple of a socket.
//! - `SockAddr`: the opaque address value.

use crate::error::{SockError, SockResult};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

/// Longest accepted local-domain name, the size of `sun_path` minus the terminator.
pub const MAX_LOCAL_NAME: usize = 103;

const INET_LEN: usize = 6;
const INET6_LEN: usize = 26;
const LINK_LEN: usize = 10;

/// Address family / protocol domain.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Domain {
    Inet = libc::AF_INET,
    Inet6 = libc::AF_INET6,
    /// Local (unix) domain.
    Local = libc::AF_UNIX,
    /// Link layer.
    Link = libc::AF_PACKET,
}

impl Domain {
    pub fn from_raw(family: i32) -> SockResult<Self> {
        match family {
            libc::AF_INET => Ok(Domain::Inet),
            libc::AF_INET6 => Ok(Domain::Inet6),
            libc::AF_UNIX => Ok(Domain::Local),
            libc::AF_PACKET => Ok(Domain::Link),
            _ => Err(SockError::AddressFamilyUnsupported),
        }
    }

    fn valid_len(self, len: usize) -> bool {
        match self {
            Domain::Inet => len == INET_LEN,
            Domain::Inet6 => len == INET6_LEN,
            Domain::Local => (1..=MAX_LOCAL_NAME).contains(&len),
            Domain::Link => len == LINK_LEN,
        }
    }
}

/// Socket type.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum SockType {
    Stream = libc::SOCK_STREAM,
    Datagram = libc::SOCK_DGRAM,
    Raw = libc::SOCK_RAW,
    SeqPacket = libc::SOCK_SEQPACKET,
}

impl SockType {
    /// Record-preserving types hand whole messages to the protocol.
    pub fn is_atomic(self) -> bool {
        !matches!(self, SockType::Stream)
    }

    /// Types that must be connected before data can flow.
    pub fn is_connection_oriented(self) -> bool {
        matches!(self, SockType::Stream | SockType::SeqPacket)
    }
}

/// The (domain, type, protocol) triple a socket was created with.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SockKind {
    pub domain: Domain,
    pub ty: SockType,
    pub protocol: i32,
}

/// Opaque family-tagged address.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SockAddr {
    family: Domain,
    bytes: Vec<u8>,
}

impl SockAddr {
    /// Wraps raw address bytes. Only length and family are checked.
    pub fn from_raw(family: Domain, bytes: impl Into<Vec<u8>>) -> SockResult<Self> {
        let bytes = bytes.into();
        if !family.valid_len(bytes.len()) {
            return Err(SockError::InvalidArgument);
        }
        Ok(SockAddr { family, bytes })
    }

    pub fn inet(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => {
                let mut bytes = Vec::with_capacity(INET_LEN);
                bytes.extend_from_slice(&v4.port().to_be_bytes());
                bytes.extend_from_slice(&v4.ip().octets());
                SockAddr { family: Domain::Inet, bytes }
            }
            SocketAddr::V6(v6) => {
                let mut bytes = Vec::with_capacity(INET6_LEN);
                bytes.extend_from_slice(&v6.port().to_be_bytes());
                bytes.extend_from_slice(&v6.ip().octets());
                bytes.extend_from_slice(&v6.flowinfo().to_be_bytes());
                bytes.extend_from_slice(&v6.scope_id().to_be_bytes());
                SockAddr { family: Domain::Inet6, bytes }
            }
        }
    }

    /// Local-domain name. Empty names and names longer than `MAX_LOCAL_NAME` are rejected.
    pub fn local(name: &str) -> SockResult<Self> {
        Self::from_raw(Domain::Local, name.as_bytes())
    }

    pub fn link(if_index: u32, mac: [u8; 6]) -> Self {
        let mut bytes = Vec::with_capacity(LINK_LEN);
        bytes.extend_from_slice(&if_index.to_be_bytes());
        bytes.extend_from_slice(&mac);
        SockAddr { family: Domain::Link, bytes }
    }

    pub fn family(&self) -> Domain {
        self.family
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Checks that the address may be used with a socket of `domain`.
    pub fn validate(&self, domain: Domain) -> SockResult<()> {
        if self.family != domain {
            return Err(SockError::AddressFamilyUnsupported);
        }
        if !self.family.valid_len(self.bytes.len()) {
            return Err(SockError::InvalidArgument);
        }
        Ok(())
    }

    pub fn to_inet(&self) -> Option<SocketAddr> {
        let b = &self.bytes;
        match self.family {
            Domain::Inet if b.len() == INET_LEN => {
                let port = u16::from_be_bytes([b[0], b[1]]);
                let ip = Ipv4Addr::new(b[2], b[3], b[4], b[5]);
                Some(SocketAddr::V4(SocketAddrV4::new(ip, port)))
            }
            Domain::Inet6 if b.len() == INET6_LEN => {
                let port = u16::from_be_bytes([b[0], b[1]]);
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&b[2..18]);
                let flowinfo = u32::from_be_bytes([b[18], b[19], b[20], b[21]]);
                let scope_id = u32::from_be_bytes([b[22], b[23], b[24], b[25]]);
                Some(SocketAddr::V6(SocketAddrV6::new(
                    Ipv6Addr::from(octets),
                    port,
                    flowinfo,
                    scope_id,
                )))
            }
            _ => None,
        }
    }

    pub fn local_name(&self) -> Option<&str> {
        match self.family {
            Domain::Local => std::str::from_utf8(&self.bytes).ok(),
            _ => None,
        }
    }

    pub fn to_link(&self) -> Option<(u32, [u8; 6])> {
        let b = &self.bytes;
        match self.family {
            Domain::Link if b.len() == LINK_LEN => {
                let if_index = u32::from_be_bytes([b[0], b[1], b[2], b[3]]);
                let mut mac = [0u8; 6];
                mac.copy_from_slice(&b[4..10]);
                Some((if_index, mac))
            }
            _ => None,
        }
    }
}

impl From<SocketAddr> for SockAddr {
    fn from(addr: SocketAddr) -> Self {
        SockAddr::inet(addr)
    }
}

impl From<(IpAddr, u16)> for SockAddr {
    fn from((ip, port): (IpAddr, u16)) -> Self {
        SockAddr::inet(SocketAddr::new(ip, port))
    }
}

impl fmt::Display for SockAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(addr) = self.to_inet() {
            return write!(f, "{addr}");
        }
        if let Some(name) = self.local_name() {
            return write!(f, "local:{name}");
        }
        if let Some((if_index, mac)) = self.to_link() {
            return write!(
                f,
                "link:{if_index}/{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
                mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
            );
        }
        write!(f, "{:?}:{:02x?}", self.family, self.bytes)
    }
}

impl fmt::Debug for SockAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SockAddr({self})")
    }
}
