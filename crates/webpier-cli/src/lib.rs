//! `WebPier` CLI Library
//!
//! Client side of the daemon control protocol and the helper that starts a
//! session daemon on demand.

pub mod connection;
pub mod spawn;
