//! `WebPier` Core Library
//!
//! Shared functionality for `WebPier` components:
//! - Control protocol codec (newline-delimited JSON messages)
//! - Local IPC transport between the daemon and its clients
//! - File-backed configuration store and cross-process locks
//! - Common error types

pub mod config;
pub mod error;
pub mod ipc;
pub mod lock;
pub mod protocol;
pub mod tracing_init;

pub use config::{GlobalConfig, Repository, ServiceSpec, Snapshot};
pub use error::{Error, Result};
pub use protocol::{Action, Handle, Health, Message, Payload, Report, State, Tunnel};
