use thiserror::Error;

/// Progress of the link to the broker, strictly ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    Disconnected,
    WifiOnly,
    TransportOpen,
    SessionEstablished,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("cannot advance from {from:?} to {to:?}")]
    InvalidAdvance {
        from: ConnectionState,
        to: ConnectionState,
    },
    #[error("cannot collapse from {from:?} to {to:?}")]
    InvalidCollapse {
        from: ConnectionState,
        to: ConnectionState,
    },
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::WifiOnly => "wifi-only",
            Self::TransportOpen => "transport-open",
            Self::SessionEstablished => "session-established",
        }
    }

    fn next(self) -> Option<Self> {
        match self {
            Self::Disconnected => Some(Self::WifiOnly),
            Self::WifiOnly => Some(Self::TransportOpen),
            Self::TransportOpen => Some(Self::SessionEstablished),
            Self::SessionEstablished => None,
        }
    }

    pub fn is_established(self) -> bool {
        self == Self::SessionEstablished
    }
}

/// Connection state holder that only allows single forward steps and
/// collapses to strictly earlier stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connectivity {
    state: ConnectionState,
}

impl Default for Connectivity {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
        }
    }
}

impl Connectivity {
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state.is_established()
    }

    pub fn advance(&mut self, to: ConnectionState) -> Result<ConnectionState, StateError> {
        if self.state.next() != Some(to) {
            return Err(StateError::InvalidAdvance {
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(to)
    }

    pub fn collapse(&mut self, to: ConnectionState) -> Result<ConnectionState, StateError> {
        if to >= self.state {
            return Err(StateError::InvalidCollapse {
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(to)
    }

    /// Collapses only when currently above `to`; returns whether it moved.
    pub fn fall_back_to(&mut self, to: ConnectionState) -> bool {
        self.collapse(to).is_ok()
    }
}

/// Numbers successive sockets so late callbacks from a torn-down one can be
/// told apart from events of the socket that replaced it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SocketEpoch {
    issued: u32,
    live: Option<u32>,
}

impl SocketEpoch {
    /// Starts a new socket and returns the tag its events must carry.
    pub fn begin(&mut self) -> u32 {
        self.issued = self.issued.wrapping_add(1);
        self.live = Some(self.issued);
        self.issued
    }

    /// Marks the current socket as gone; its remaining events are stale.
    pub fn end(&mut self) {
        self.live = None;
    }

    pub fn accepts(&self, tag: u32) -> bool {
        self.live == Some(tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::ConnectionState::*;

    #[test]
    fn advances_one_step_at_a_time() {
        let mut conn = Connectivity::default();

        assert_eq!(conn.advance(WifiOnly), Ok(WifiOnly));
        assert_eq!(conn.advance(TransportOpen), Ok(TransportOpen));
        assert_eq!(conn.advance(SessionEstablished), Ok(SessionEstablished));
        assert!(conn.is_established());
    }

    #[test]
    fn rejects_skipping_and_repeating() {
        let mut conn = Connectivity::default();

        assert!(conn.advance(TransportOpen).is_err());
        assert!(conn.advance(Disconnected).is_err());
        conn.advance(WifiOnly).unwrap();
        assert!(conn.advance(WifiOnly).is_err());
        assert_eq!(conn.state(), WifiOnly);
    }

    #[test]
    fn failure_collapses_to_earlier_stage_only() {
        let mut conn = Connectivity::default();
        conn.advance(WifiOnly).unwrap();
        conn.advance(TransportOpen).unwrap();
        conn.advance(SessionEstablished).unwrap();

        assert_eq!(conn.collapse(WifiOnly), Ok(WifiOnly));
        assert!(conn.collapse(TransportOpen).is_err());
        assert!(conn.collapse(WifiOnly).is_err());
        assert!(!conn.fall_back_to(WifiOnly));
        assert!(conn.fall_back_to(Disconnected));
        assert_eq!(conn.state(), Disconnected);
    }

    #[test]
    fn stale_socket_events_are_rejected() {
        let mut epoch = SocketEpoch::default();
        assert!(!epoch.accepts(0));

        let first = epoch.begin();
        assert!(epoch.accepts(first));

        // Teardown emits several events; none of them count after `end`.
        epoch.end();
        assert!(!epoch.accepts(first));

        let second = epoch.begin();
        assert_ne!(first, second);
        assert!(!epoch.accepts(first));
        assert!(epoch.accepts(second));
    }
}
