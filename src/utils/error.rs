//! Transport-independent error type and kind taxonomy.

use std::fmt;
use std::io;

/// Machine-readable error kind, mirroring the propagation policy: everything
/// short of `Fatal` is observable but never crashes a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Datagram send failed or receive timed out; recovered locally by retry.
    TransientIo,
    /// Message round/epoch older than current; dropped silently by callers.
    ProtocolStale,
    /// Message tag invalid for current role.
    ProtocolUnexpected,
    /// Unknown or stale client token.
    Auth,
    /// Operation violates an application invariant.
    StateViolation,
    /// A ring neighbour is unreachable.
    MembershipFault,
    /// Bind failure, multicast join failure: terminate the process.
    Fatal,
}

/// Errors that can occur anywhere in the ringvote core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingVoteError {
    kind: ErrorKind,
    msg: String,
}

impl RingVoteError {
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        RingVoteError {
            kind,
            msg: msg.into(),
        }
    }

    /// Shorthand for a `StateViolation`-kinded error carrying just a message,
    /// the common case for ad-hoc internal checks.
    pub fn msg(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::StateViolation, msg)
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fatal, msg)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn is_fatal(&self) -> bool {
        self.kind == ErrorKind::Fatal
    }
}

impl fmt::Display for RingVoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.msg)
    }
}

impl std::error::Error for RingVoteError {}

impl From<io::Error> for RingVoteError {
    fn from(e: io::Error) -> Self {
        RingVoteError::new(ErrorKind::TransientIo, e.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for RingVoteError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        RingVoteError::new(ErrorKind::TransientIo, format!("codec error: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind() {
        let e = RingVoteError::new(ErrorKind::Auth, "unknown token");
        assert_eq!(format!("{}", e), "Auth: unknown token");
    }

    #[test]
    fn msg_defaults_to_state_violation() {
        let e = RingVoteError::msg("bad option index");
        assert_eq!(e.kind(), ErrorKind::StateViolation);
    }
}
