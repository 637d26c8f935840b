//! Control protocol spoken between the daemon and its clients.
//!
//! Every message is a single JSON object terminated by a newline, the same
//! shape for requests and responses. The payload kind is recognised by the
//! field present (`error`, `handle`, `health`, `report`) and, for bulk kinds,
//! by whether the value is an object or an array.

mod codec;
mod types;

pub use codec::{decode, encode};
pub use types::*;
