//! Error types for peerlink

use thiserror::Error;

/// Main error type for peerlink operations
#[derive(Error, Debug)]
pub enum PeerlinkError {
    /// Session lookup failed
    #[error("Session not found: {session_id}")]
    SessionNotFound {
        /// Session ID that was not found
        session_id: String,
    },

    /// Message is invalid for the session's current negotiation state.
    /// The message is dropped; the session survives.
    #[error("Protocol violation in session {session_id}: {message_type} not valid in state {state}")]
    ProtocolViolation {
        /// Session ID where the violation occurred
        session_id: String,
        /// Negotiation state at the time of the violation
        state: String,
        /// Type of the offending message
        message_type: String,
    },

    /// Signaling transport send or receive failure
    #[error("Transport failure: {reason}")]
    TransportFailure {
        /// Reason for the transport failure
        reason: String,
    },

    /// The signaling channel is gone and cannot deliver messages
    #[error("Signaling channel closed")]
    ChannelClosed,

    /// Wire payload could not be decoded
    #[error("Invalid message: {source}")]
    InvalidMessage {
        /// Parsing error
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Platform media capability reported an error
    #[error("Media capability error: {reason}")]
    MediaFailure {
        /// Reason for the media failure
        reason: String,
    },

    /// Session already exists for the given ID
    #[error("Session already exists: {session_id}")]
    SessionAlreadyExists {
        /// Session ID that already exists
        session_id: String,
    },
}

impl PeerlinkError {
    /// Get error code for programmatic handling
    pub fn error_code(&self) -> &'static str {
        match self {
            PeerlinkError::SessionNotFound { .. } => "SESSION_NOT_FOUND",
            PeerlinkError::ProtocolViolation { .. } => "PROTOCOL_VIOLATION",
            PeerlinkError::TransportFailure { .. } => "TRANSPORT_FAILURE",
            PeerlinkError::ChannelClosed => "CHANNEL_CLOSED",
            PeerlinkError::InvalidMessage { .. } => "INVALID_MESSAGE",
            PeerlinkError::MediaFailure { .. } => "MEDIA_FAILURE",
            PeerlinkError::SessionAlreadyExists { .. } => "SESSION_ALREADY_EXISTS",
        }
    }

    /// Whether this error is fatal to the session it names.
    ///
    /// Protocol violations and routing misses are recovered locally by
    /// dropping the offending message; transport, media and decode
    /// failures close the session.
    pub fn is_session_fatal(&self) -> bool {
        !matches!(
            self,
            PeerlinkError::ProtocolViolation { .. }
                | PeerlinkError::SessionNotFound { .. }
                | PeerlinkError::SessionAlreadyExists { .. }
        )
    }
}
