//! Platform media capability interface
//!
//! The negotiation core drives the host platform's peer-connection
//! primitive through this narrow interface. SDP and candidate strings are
//! opaque; encoding, cryptography and transport internals stay on the
//! platform side.

use crate::error::PeerlinkError;
use crate::session::Role;
use async_trait::async_trait;

/// Media-side handle for one session.
///
/// Implementations wrap the platform peer-connection object. Calls are
/// async but local: they must not depend on remote peers making progress.
#[async_trait]
pub trait MediaSession: Send + Sync {
    /// Produce a local session description for the given role and round.
    ///
    /// For an initiator this is an offer, for a responder an answer to the
    /// already-applied remote description.
    async fn create_local_description(
        &self,
        role: Role,
        round: u32,
    ) -> Result<String, PeerlinkError>;

    /// Apply a remote session description
    async fn apply_remote_description(&self, sdp: &str) -> Result<(), PeerlinkError>;

    /// Apply one remote connectivity candidate.
    ///
    /// Only called after a remote description has been applied; the engine
    /// buffers earlier arrivals.
    async fn add_remote_candidate(&self, candidate: &str) -> Result<(), PeerlinkError>;

    /// Release platform resources for this session. Idempotent.
    async fn close(&self);
}

/// Creates one [`MediaSession`] per negotiated session.
///
/// The session manager calls this when a session is created, either
/// explicitly or lazily on the first inbound offer.
#[async_trait]
pub trait MediaFactory: Send + Sync {
    /// Build the platform media handle for a new session
    async fn create_session(
        &self,
        session_id: &str,
        role: Role,
    ) -> Result<std::sync::Arc<dyn MediaSession>, PeerlinkError>;
}

/// Event-driven notifications from the platform media capability.
///
/// The platform surfaces candidate discovery and connection-state changes
/// asynchronously; the core only reacts to these, it never blocks waiting
/// for one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    /// The platform discovered a local candidate to signal to the remote peer
    LocalCandidate {
        /// Session the candidate belongs to
        session_id: String,
        /// Opaque candidate string
        candidate: String,
    },
    /// The platform established peer connectivity for a session
    ConnectivityEstablished {
        /// Session that reached connectivity
        session_id: String,
    },
    /// The platform gave up on peer connectivity for a session
    ConnectionFailed {
        /// Session that failed
        session_id: String,
        /// Platform-reported reason
        reason: String,
    },
}
