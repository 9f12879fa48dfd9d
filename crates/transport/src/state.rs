use super::target::ConnectionTarget;

/// Why a socket reached `Closed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The owner asked for the connection to close.
    Requested,
    /// The connector failed before any socket existed.
    ConnectFailed(String),
    /// The socket reported an error.
    SocketError(String),
    /// The server ended the socket.
    RemoteClosed,
}

impl CloseReason {
    pub fn describe(&self) -> String {
        match self {
            Self::Requested => "closed by client".to_string(),
            Self::ConnectFailed(message) => format!("connect failed: {message}"),
            Self::SocketError(message) => format!("socket error: {message}"),
            Self::RemoteClosed => "closed by server".to_string(),
        }
    }
}

/// Lifecycle of one socket: `Idle -> Connecting -> Open -> Closing -> Closed`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Open,
    Closing,
    Closed(CloseReason),
}

impl ConnectionState {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed(_))
    }

    /// True while a socket is live or on its way up.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Connecting | Self::Open)
    }

    /// Applies one transition deterministically.
    ///
    /// `Connect` is only legal from a resting state, `HandshakeReceived` only while
    /// connecting, and a socket may fail straight from `Connecting` to `Closed`.
    pub fn apply(&self, transition: ConnectionTransition) -> ConnectionTransitionResult {
        match (self, transition) {
            (Self::Idle | Self::Closed(_), ConnectionTransition::Connect) => Ok(Self::Connecting),
            (Self::Connecting, ConnectionTransition::HandshakeReceived) => Ok(Self::Open),
            (Self::Closed(_), ConnectionTransition::BeginClose) => Ok(self.clone()),
            (_, ConnectionTransition::BeginClose) => Ok(Self::Closing),
            (Self::Closed(_), ConnectionTransition::Finish(_)) => {
                Err(ConnectionTransitionRejection::AlreadyClosed)
            }
            (_, ConnectionTransition::Finish(reason)) => Ok(Self::Closed(reason)),
            (state, attempted) => Err(ConnectionTransitionRejection::Illegal {
                from: state.clone(),
                attempted,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionTransition {
    Connect,
    HandshakeReceived,
    BeginClose,
    Finish(CloseReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionTransitionRejection {
    AlreadyClosed,
    Illegal {
        from: ConnectionState,
        attempted: ConnectionTransition,
    },
}

pub type ConnectionTransitionResult = Result<ConnectionState, ConnectionTransitionRejection>;

/// Published connection status: the state plus the socket it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionStatus {
    pub target: Option<ConnectionTarget>,
    pub state: ConnectionState,
}

impl ConnectionStatus {
    pub fn is_current(&self, target: &ConnectionTarget) -> bool {
        self.target.as_ref() == Some(target)
    }
}
