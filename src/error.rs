use thiserror::Error;

/// Result type for Rotel operations
pub type Result<T> = std::result::Result<T, RotelError>;

/// Errors that can occur when talking to a Rotel amplifier
#[derive(Error, Debug)]
pub enum RotelError {
    /// Failed to establish the TCP connection (timeout, refused and DNS failures alike)
    #[error("Connect error: {0}")]
    Connect(String),

    /// Writing to the socket failed or the socket is already closed
    #[error("Write error: {0}")]
    Write(String),

    /// The device closed the connection (read stream terminated)
    #[error("Connection closed")]
    ConnectionClosed,

    /// Received data grew past the line limit without a terminator
    #[error("Framing error: {buffered} bytes buffered without terminator (limit {limit})")]
    Framing {
        /// Bytes currently buffered
        buffered: usize,
        /// Configured maximum line length
        limit: usize,
    },

    /// The device did not answer the model query in time
    #[error("Handshake timed out")]
    HandshakeTimeout,

    /// Caller supplied a value outside the profile's range or source map
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Profile key is not registered
    #[error("Unknown profile: {0}")]
    UnknownProfile(String),

    /// Command attempted while the session is not subscribed
    #[error("Not connected")]
    NotConnected,

    /// Configuration rejected by validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel receive error
    #[error("Channel error: {0}")]
    ChannelError(String),
}

impl RotelError {
    /// Whether this error is a transport failure the session recovers from by reconnecting
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            RotelError::Connect(_)
                | RotelError::Write(_)
                | RotelError::ConnectionClosed
                | RotelError::Framing { .. }
                | RotelError::HandshakeTimeout
                | RotelError::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_are_classified() {
        assert!(RotelError::Connect("refused".into()).is_transport());
        assert!(RotelError::ConnectionClosed.is_transport());
        assert!(RotelError::Framing { buffered: 10, limit: 5 }.is_transport());
        assert!(!RotelError::NotConnected.is_transport());
        assert!(!RotelError::InvalidArgument("vol".into()).is_transport());
        assert!(!RotelError::UnknownProfile("x".into()).is_transport());
    }
}
