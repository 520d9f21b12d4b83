//! Signaling protocol messages
//!
//! The wire format is JSON with an external `type` tag. SDP blobs and ICE
//! candidate strings are opaque to the core; they are produced and consumed
//! by the platform media capability.

use serde::{Deserialize, Serialize};

/// One signaling message within a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalMessage {
    /// Session description offer
    Offer {
        /// Opaque session description produced by the offering peer
        sdp: String,
    },
    /// Session description answer
    Answer {
        /// Opaque session description produced by the answering peer
        sdp: String,
    },
    /// Incremental connectivity candidate
    Candidate {
        /// Opaque candidate string
        candidate: String,
    },
    /// Graceful session teardown
    Bye,
}

impl SignalMessage {
    /// Get the message type as a string, for logging and error reporting
    pub fn message_type(&self) -> &'static str {
        match self {
            SignalMessage::Offer { .. } => "offer",
            SignalMessage::Answer { .. } => "answer",
            SignalMessage::Candidate { .. } => "candidate",
            SignalMessage::Bye => "bye",
        }
    }
}

/// Routing envelope around a [`SignalMessage`].
///
/// The rendezvous service relays envelopes verbatim; it must preserve
/// delivery order within a session. Ordering across sessions is not
/// assumed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    /// Session the message belongs to
    pub session_id: String,
    /// Peer ID of the sender
    pub from: String,
    /// Peer ID of the intended recipient
    pub to: String,
    /// The signaling payload
    pub message: SignalMessage,
}

impl SignalEnvelope {
    /// Create an envelope for a session-scoped message
    pub fn new(
        session_id: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
        message: SignalMessage,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            from: from.into(),
            to: to.into(),
            message,
        }
    }
}
