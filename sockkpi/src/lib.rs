// Public modules and re-exports
pub mod addr;
pub mod buffer;
pub mod config;
pub mod control;
pub mod error;
pub mod local;
pub mod options;
pub mod proto;
pub mod socket;
pub mod stack;
pub mod tclass;
pub mod upcall;

pub use addr::{Domain, MAX_LOCAL_NAME, SockAddr, SockKind, SockType};
pub use buffer::{IoVec, IoVecMut, Payload, Sink, Transfer};
pub use config::KpiConfig;
pub use control::Ancillary;
pub use error::{SockError, SockResult};
pub use lifecycle::Received;
pub use options::{OptDirection, SockOpt};
pub use proto::{
    Control, Handshake, MsgFlags, ProtocolFactory, ProtocolHandler, RecvMeta, Registry,
    RegistryBuilder, SendMeta,
};
pub use socket::{BASE_REFS, BufFlags, OptFlags, SockBuf, SockCore, SockState, Socket, WeakSocket};
pub use stack::{Stack, StatsSnapshot};
pub use tclass::TrafficClass;
pub use upcall::{SockEvents, Upcall, UpcallCtx, UpcallMode, Upcalls};

// Internal modules, hidden from documentation
mod accept_queue;
#[doc(hidden)]
pub mod completion;
#[doc(hidden)]
pub mod lifecycle;

#[cfg(test)]
mod tests;
