//! Liveness state machine of one magic link
//!
//! ```text
//! Searching --ping--> Handshaking --accepted--> Linked --countdown expired--> Stale
//!     ^                   |                        |
//!     +-----rejected------+                        +--disconnect--> Disconnected
//! ```
//!
//! `Stale` and `Disconnected` are terminal. A worker that comes back after
//! either registers again as a new link.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    /// Worker has no front-end yet
    Searching,
    /// Ping sent, waiting for the handshake response
    Handshaking,
    Linked,
    /// Countdown ran out
    Stale,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkSignal {
    PingSent,
    HandshakeAccepted,
    HandshakeRejected,
    /// Ping received for an already linked worker
    KeepAlive,
    CountdownExpired,
    Disconnect,
}

impl LinkState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Stale | Self::Disconnected)
    }

    /// Next state, or `None` if `signal` does not apply in this state.
    #[must_use]
    pub const fn apply(self, signal: LinkSignal) -> Option<Self> {
        use LinkSignal as S;
        use LinkState as L;

        match (self, signal) {
            (L::Stale | L::Disconnected, _) => None,
            (_, S::Disconnect) => Some(L::Disconnected),

            (L::Searching | L::Handshaking, S::PingSent) => Some(L::Handshaking),
            (L::Searching | L::Handshaking | L::Linked, S::HandshakeAccepted) => Some(L::Linked),
            (L::Handshaking, S::HandshakeRejected) => Some(L::Searching),

            (L::Linked, S::PingSent | S::KeepAlive) => Some(L::Linked),
            (L::Linked, S::CountdownExpired) => Some(L::Stale),

            _ => None,
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Searching => "searching",
            Self::Handshaking => "handshaking",
            Self::Linked => "linked",
            Self::Stale => "stale",
            Self::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_path() {
        let state = LinkState::Searching;
        let state = state.apply(LinkSignal::PingSent).unwrap();
        assert_eq!(state, LinkState::Handshaking);
        let state = state.apply(LinkSignal::HandshakeAccepted).unwrap();
        assert_eq!(state, LinkState::Linked);
        assert_eq!(state.apply(LinkSignal::KeepAlive), Some(LinkState::Linked));
        assert_eq!(state.apply(LinkSignal::CountdownExpired), Some(LinkState::Stale));
    }

    #[test]
    fn test_rejected_handshake_returns_to_searching() {
        assert_eq!(
            LinkState::Handshaking.apply(LinkSignal::HandshakeRejected),
            Some(LinkState::Searching)
        );
        assert_eq!(LinkState::Linked.apply(LinkSignal::HandshakeRejected), None);
    }

    #[test]
    fn test_terminal_states_accept_nothing() {
        for state in [LinkState::Stale, LinkState::Disconnected] {
            assert!(state.is_terminal());
            for signal in [
                LinkSignal::PingSent,
                LinkSignal::HandshakeAccepted,
                LinkSignal::KeepAlive,
                LinkSignal::Disconnect,
            ] {
                assert_eq!(state.apply(signal), None);
            }
        }
    }

    #[test]
    fn test_disconnect_from_any_live_state() {
        for state in [LinkState::Searching, LinkState::Handshaking, LinkState::Linked] {
            assert_eq!(state.apply(LinkSignal::Disconnect), Some(LinkState::Disconnected));
        }
    }

    #[test]
    fn test_countdown_only_expires_linked_workers() {
        assert_eq!(LinkState::Searching.apply(LinkSignal::CountdownExpired), None);
        assert_eq!(LinkState::Handshaking.apply(LinkSignal::CountdownExpired), None);
    }
}
