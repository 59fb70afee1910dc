//! Network error types.

use thiserror::Error;

/// Network errors.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Connection failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection closed by the remote side.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Magic bytes did not match; the stream is out of sync.
    #[error("Network magic mismatch: got {got:02x?}")]
    MagicMismatch { got: Vec<u8> },

    /// Payload checksum did not match the header.
    #[error("Checksum mismatch in '{command}' message")]
    ChecksumMismatch { command: String },

    /// Message too large.
    #[error("Message too large: {size} bytes, max {max} bytes")]
    MessageTooLarge { size: usize, max: usize },

    /// Command name does not fit the 12-byte header field.
    #[error("Command name too long: {0}")]
    CommandTooLong(String),

    /// Message body could not be understood.
    #[error("Malformed '{command}' message: {reason}")]
    Malformed { command: String, reason: String },

    /// Identity already has a live connection.
    #[error("Peer already connected: {0}")]
    DuplicatePeer(String),

    /// Too many connections.
    #[error("Too many connections: {count}, max {max}")]
    TooManyConnections { count: usize, max: usize },

    /// Outbound buffer refused more bytes.
    #[error("Send buffer full: {queued} bytes queued, max {max}")]
    SendBufferFull { queued: usize, max: usize },

    /// Timeout.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl NetworkError {
    /// Shorthand for [`NetworkError::Malformed`].
    pub fn malformed(command: impl Into<String>, reason: impl Into<String>) -> Self {
        NetworkError::Malformed {
            command: command.into(),
            reason: reason.into(),
        }
    }

    /// The peer lied to us: terminate and ban.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, NetworkError::ChecksumMismatch { .. })
    }

    /// Timed out with nothing transferred; not an error for a polling worker.
    pub fn is_transient(&self) -> bool {
        match self {
            NetworkError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

/// Result type for network operations.
pub type NetworkResult<T> = Result<T, NetworkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let e = NetworkError::ChecksumMismatch {
            command: "inv".into(),
        };
        assert!(e.is_protocol_violation());
        assert!(!e.is_transient());

        let e = NetworkError::MagicMismatch { got: vec![0, 1] };
        assert!(!e.is_protocol_violation());

        let e = NetworkError::Io(std::io::Error::from(std::io::ErrorKind::WouldBlock));
        assert!(e.is_transient());

        let e = NetworkError::Io(std::io::Error::from(std::io::ErrorKind::ConnectionReset));
        assert!(!e.is_transient());
    }

    #[test]
    fn test_display() {
        let e = NetworkError::malformed("version", "too short");
        assert_eq!(e.to_string(), "Malformed 'version' message: too short");
    }
}
