use std::fmt;

/// State of the relay connection, published on a `watch` channel by the client
/// loop.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    /// Socket opening, or open but no `pong` seen yet.
    Connecting,
    /// The relay answered a ping on the current socket.
    Connected,
    /// The last attempt failed; a retry is scheduled.
    Failed(String),
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Disconnected => f.write_str("disconnected"),
            ConnectionStatus::Connecting => f.write_str("connecting"),
            ConnectionStatus::Connected => f.write_str("connected"),
            ConnectionStatus::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Progress of the most recent snapshot reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SyncStatus {
    #[default]
    Idle,
    Syncing,
    Success,
    Failed(String),
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncStatus::Idle => f.write_str("idle"),
            SyncStatus::Syncing => f.write_str("syncing"),
            SyncStatus::Success => f.write_str("success"),
            SyncStatus::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}
