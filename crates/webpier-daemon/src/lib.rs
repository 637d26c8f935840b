//! `WebPier` Daemon Library
//!
//! Control plane of a pier:
//! - Rendezvous attempts on dedicated threads (spawner)
//! - Tunnel child process supervision with retry (connector, controller)
//! - Service pool and the six control operations (engine)
//! - Local control server over the IPC endpoint (server)

pub mod connector;
pub mod context;
pub mod controller;
pub mod engine;
pub mod event;
pub mod rendezvous;
pub mod server;
pub mod spawner;
pub mod tunnel;

#[cfg(test)]
mod testing;

pub use context::{Context, Settings};
pub use engine::{Engine, EngineError};
pub use server::{RunMode, Server};
