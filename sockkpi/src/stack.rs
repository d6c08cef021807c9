//! # Socket Stack
//!
//! ## Purpose
//!
//! Entry point of the crate: owns the protocol registry and the resolved configuration, and
//! creates sockets.
//!
//! ## How it works
//!
//! `Stack::create` looks up the factory for the requested (domain, type, protocol), asks it for
//! a fresh handler, and builds a `Closed` socket that holds a descriptor reference. The stack
//! keeps creation, destruction and open-descriptor counters for in-process accounting.

use crate::addr::{Domain, SockType};
use crate::config::{KpiConfig, Settings};
use crate::error::SockResult;
use crate::proto::Registry;
use crate::socket::{Env, SockCore, Socket};
use std::sync::Arc;
use std::sync::atomic::Ordering;

/// Counter values at one point in time.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub created: u64,
    pub destroyed: u64,
    /// Sockets currently held by a descriptor.
    pub open: u64,
}

/// Creates sockets against a frozen protocol registry.
#[derive(Clone)]
pub struct Stack {
    registry: Arc<Registry>,
    env: Arc<Env>,
}

impl Stack {
    /// # Arguments
    /// * `registry` - The protocol switch table, see `Registry::builder`.
    /// * `config` - Optional defaults for new sockets.
    pub fn new(registry: Arc<Registry>, config: Option<KpiConfig>) -> Self {
        let settings = Settings::from(config);
        log::debug!("socket stack: {} protocols, {settings:?}", registry.len());
        Stack {
            registry,
            env: Arc::new(Env::new(settings)),
        }
    }

    /// Creates a socket.
    ///
    /// # Returns
    /// A `Closed` socket holding a descriptor reference, or `Unsupported` when no protocol is
    /// registered for the triple. Errors from the protocol factory are returned as is.
    pub fn create(&self, domain: Domain, ty: SockType, protocol: i32) -> SockResult<Socket> {
        let (kind, factory) = self.registry.lookup(domain, ty, protocol)?;
        let handler = factory.attach(kind)?;
        let mut core = SockCore::new(&self.env.settings);
        core.fd_ref = true;
        let socket = Socket::new(kind, handler, self.env.clone(), core);
        self.env.stats.open.fetch_add(1, Ordering::Relaxed);
        log::debug!("socket {}: created {kind:?}", socket.id());
        Ok(socket)
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn stats(&self) -> StatsSnapshot {
        let stats = &self.env.stats;
        StatsSnapshot {
            created: stats.created.load(Ordering::Relaxed),
            destroyed: stats.destroyed.load(Ordering::Relaxed),
            open: stats.open.load(Ordering::Relaxed),
        }
    }
}
