//! Message types for the control protocol.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Control operation carried by a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Action {
    /// No operation; never a valid request.
    #[default]
    Naught = 0,
    Unplug = 1,
    Engage = 2,
    Adjust = 3,
    Status = 4,
    Review = 5,
}

impl TryFrom<u64> for Action {
    type Error = Error;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Naught),
            1 => Ok(Self::Unplug),
            2 => Ok(Self::Engage),
            3 => Ok(Self::Adjust),
            4 => Ok(Self::Status),
            5 => Ok(Self::Review),
            other => Err(Error::Protocol(format!("Unknown action {other}"))),
        }
    }
}

impl From<Action> for u64 {
    fn from(action: Action) -> Self {
        action as Self
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Naught => "naught",
            Self::Unplug => "unplug",
            Self::Engage => "engage",
            Self::Adjust => "adjust",
            Self::Status => "status",
            Self::Review => "review",
        };
        f.write_str(name)
    }
}

/// Identifies one declared service instance.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Handle {
    pub pier: String,
    pub service: String,
}

impl Handle {
    pub fn new(pier: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            pier: pier.into(),
            service: service.into(),
        }
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.pier, self.service)
    }
}

/// Live state of a declared service.
///
/// When several connectors disagree the reported state is picked by
/// precedence `Broken > Burden > Lonely > Asleep`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum State {
    /// Not started.
    #[default]
    Asleep = 0,
    /// The last rendezvous attempt failed.
    Broken = 1,
    /// Waiting for a peer.
    Lonely = 2,
    /// Forwarding traffic through at least one tunnel.
    Burden = 3,
}

impl TryFrom<u8> for State {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Asleep),
            1 => Ok(Self::Broken),
            2 => Ok(Self::Lonely),
            3 => Ok(Self::Burden),
            other => Err(format!("unknown state {other}")),
        }
    }
}

impl From<State> for u8 {
    fn from(state: State) -> Self {
        state as Self
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Asleep => "asleep",
            Self::Broken => "broken",
            Self::Lonely => "lonely",
            Self::Burden => "burden",
        };
        f.write_str(name)
    }
}

/// State of a service together with the last error, if broken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Health {
    #[serde(flatten)]
    pub handle: Handle,
    pub state: State,
    #[serde(default)]
    pub message: String,
}

/// One live tunnel child process.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tunnel {
    pub pid: u32,
    pub pier: String,
}

/// Health plus the tunnels currently running for the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    #[serde(flatten)]
    pub health: Health,
    #[serde(default)]
    pub tunnels: Vec<Tunnel>,
}

/// Message payload.
///
/// `Health` and `HealthList` (likewise `Report` and `ReportList`) are told
/// apart on the wire by object vs. array, so a one-element list stays a list.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Payload {
    #[default]
    Empty,
    Error(String),
    Handle(Handle),
    Health(Health),
    HealthList(Vec<Health>),
    Report(Report),
    ReportList(Vec<Report>),
}

/// A control request or response.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    pub action: Action,
    pub payload: Payload,
}

impl Message {
    pub const fn new(action: Action, payload: Payload) -> Self {
        Self { action, payload }
    }

    /// Request addressing every declared service.
    pub const fn request(action: Action) -> Self {
        Self::new(action, Payload::Empty)
    }

    /// Request addressing a single service.
    pub const fn with_handle(action: Action, handle: Handle) -> Self {
        Self::new(action, Payload::Handle(handle))
    }

    /// Response reporting a failed `action`.
    pub fn failure(action: Action, error: impl Into<String>) -> Self {
        Self::new(action, Payload::Error(error.into()))
    }

    /// Whether the message denotes success.
    ///
    /// An error payload with an empty text counts as success.
    pub fn ok(&self) -> bool {
        self.action != Action::Naught
            && !matches!(&self.payload, Payload::Error(text) if !text.is_empty())
    }

    /// The error text, if this is a failure.
    pub fn error(&self) -> Option<&str> {
        match &self.payload {
            Payload::Error(text) if !text.is_empty() => Some(text),
            _ => None,
        }
    }

    /// Encode as one newline-terminated JSON line.
    pub fn encode(&self) -> crate::Result<String> {
        super::codec::encode(self)
    }

    /// Decode one JSON line (the trailing newline is optional).
    pub fn decode(line: &str) -> crate::Result<Self> {
        super::codec::decode(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_requires_real_action() {
        assert!(!Message::request(Action::Naught).ok());
        assert!(Message::request(Action::Status).ok());
    }

    #[test]
    fn empty_error_counts_as_success() {
        assert!(Message::failure(Action::Engage, "").ok());
        assert!(!Message::failure(Action::Engage, "wrong service").ok());
        assert_eq!(
            Message::failure(Action::Engage, "wrong service").error(),
            Some("wrong service")
        );
        assert_eq!(Message::failure(Action::Engage, "").error(), None);
    }

    #[test]
    fn action_from_wire_number() {
        assert_eq!(Action::try_from(3).ok(), Some(Action::Adjust));
        assert!(Action::try_from(6).is_err());
        assert_eq!(u64::from(Action::Review), 5);
    }

    #[test]
    fn state_names() {
        assert_eq!(State::Burden.to_string(), "burden");
        assert_eq!(State::try_from(1), Ok(State::Broken));
        assert!(State::try_from(4).is_err());
    }
}
