//! Test harness for `sockkpi`.
//!
//! - `scripted`: a protocol handler whose answers a test scripts.
//! - `runner`: a ready-made stack (`TestBed`) and an async driver that runs a test against an
//!   echo server.
//! - `echo`: the blocking echo server and client used by the driver.

pub mod echo;
pub mod runner;
pub mod scripted;

pub use runner::{SCRIPTED_PROTOCOL, TestBed, init_logger, run_with_echo_server};
pub use scripted::{ConnectPlan, Script, SendStep};
