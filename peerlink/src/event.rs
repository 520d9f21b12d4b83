//! Caller-facing session lifecycle events

use peerlink_core::CloseReason;
use tokio::sync::mpsc;

/// Lifecycle events emitted by the session manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A remote offer is pending; the caller decides whether to accept
    IncomingOffer {
        /// Session holding the pending offer
        session_id: String,
        /// Peer that sent the offer
        remote_peer: String,
    },
    /// A session completed a negotiation round
    SessionConnected {
        /// Session that connected
        session_id: String,
    },
    /// A session was torn down
    SessionClosed {
        /// Session that closed
        session_id: String,
        /// Why it closed
        reason: CloseReason,
    },
    /// A session failed with an unrecoverable error
    SessionFailed {
        /// Session that failed
        session_id: String,
        /// Error description
        error: String,
    },
}

impl SessionEvent {
    /// Get the event type as a string
    pub fn event_type(&self) -> &'static str {
        match self {
            SessionEvent::IncomingOffer { .. } => "incoming_offer",
            SessionEvent::SessionConnected { .. } => "session_connected",
            SessionEvent::SessionClosed { .. } => "session_closed",
            SessionEvent::SessionFailed { .. } => "session_failed",
        }
    }

    /// Session ID the event refers to
    pub fn session_id(&self) -> &str {
        match self {
            SessionEvent::IncomingOffer { session_id, .. }
            | SessionEvent::SessionConnected { session_id }
            | SessionEvent::SessionClosed { session_id, .. }
            | SessionEvent::SessionFailed { session_id, .. } => session_id,
        }
    }
}

/// Stream of session events for async iteration
#[derive(Debug)]
pub struct EventStream {
    receiver: mpsc::UnboundedReceiver<SessionEvent>,
}

impl EventStream {
    /// Create a stream and its feeding sender
    pub fn channel() -> (mpsc::UnboundedSender<SessionEvent>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { receiver: rx })
    }

    /// Get the next event from the stream
    pub async fn next(&mut self) -> Option<SessionEvent> {
        self.receiver.recv().await
    }

    /// Try to get the next event without blocking
    pub fn try_next(&mut self) -> Option<SessionEvent> {
        self.receiver.try_recv().ok()
    }

    /// Close the event stream
    pub fn close(&mut self) {
        self.receiver.close();
    }
}
