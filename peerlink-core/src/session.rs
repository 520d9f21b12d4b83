//! Session data model and in-memory store

use crate::error::PeerlinkError;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Negotiation role, fixed for the lifetime of a session.
///
/// The role determines offer/answer obligations: only an [`Role::Initiator`]
/// produces offers for the first round, only a [`Role::Responder`] session is
/// ever created lazily from an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// This peer starts negotiation rounds by sending offers
    Initiator,
    /// This peer answers offers from the remote side
    Responder,
}

impl Role {
    /// Short name used in logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Initiator => "initiator",
            Role::Responder => "responder",
        }
    }
}

/// Negotiation state of one session.
///
/// Transitions are monotonic within a round; renegotiation from
/// [`NegotiationState::Connected`] starts a new round back at the
/// offer-exchange states. [`NegotiationState::Closed`] is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    /// No negotiation round in progress yet
    Idle,
    /// Local offer produced but not yet handed to the transport
    OfferCreated,
    /// Local offer dispatched, awaiting the remote answer
    OfferSent,
    /// Remote offer stored, awaiting local accept
    OfferReceived,
    /// Local answer produced but not yet handed to the transport
    AnswerCreated,
    /// Local answer dispatched, awaiting connectivity
    AnswerSent,
    /// Remote answer stored and applied
    AnswerReceived,
    /// Negotiation round complete, peers connected
    Connected,
    /// Session torn down; no further transitions
    Closed,
}

impl NegotiationState {
    /// Short name used in logs and protocol-violation errors
    pub fn as_str(&self) -> &'static str {
        match self {
            NegotiationState::Idle => "idle",
            NegotiationState::OfferCreated => "offer_created",
            NegotiationState::OfferSent => "offer_sent",
            NegotiationState::OfferReceived => "offer_received",
            NegotiationState::AnswerCreated => "answer_created",
            NegotiationState::AnswerSent => "answer_sent",
            NegotiationState::AnswerReceived => "answer_received",
            NegotiationState::Connected => "connected",
            NegotiationState::Closed => "closed",
        }
    }

    /// Whether the session can still make progress
    pub fn is_live(&self) -> bool {
        !matches!(self, NegotiationState::Closed)
    }
}

/// State for one negotiated peer relationship
#[derive(Debug)]
pub struct Session {
    /// Opaque unique identifier, assigned at creation, immutable
    pub session_id: String,
    /// Negotiation role, immutable
    pub role: Role,
    /// Peer ID of the remote side
    pub remote_peer: String,
    /// Current negotiation state
    pub state: NegotiationState,
    /// Local session description for the current round
    pub local_description: Option<String>,
    /// Remote session description for the current round
    pub remote_description: Option<String>,
    /// Candidates received before the remote description existed,
    /// buffered in arrival order
    pub pending_candidates: Vec<String>,
    /// Negotiation round counter; bumped on renegotiation
    pub round: u32,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Timestamp of the last signaling activity, used for timeout sweeps
    pub last_activity: DateTime<Utc>,
}

impl Session {
    /// Create a fresh session in [`NegotiationState::Idle`]
    pub fn new(session_id: String, role: Role, remote_peer: String) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            role,
            remote_peer,
            state: NegotiationState::Idle,
            local_description: None,
            remote_description: None,
            pending_candidates: Vec::new(),
            round: 0,
            created_at: now,
            last_activity: now,
        }
    }

    /// Record signaling activity for timeout accounting
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_activity = now;
    }

    /// Reset per-round state for a new negotiation round.
    ///
    /// A new round invalidates the previous local and remote descriptions;
    /// candidates buffered for the old round are stale and dropped.
    pub fn begin_round(&mut self) {
        self.round += 1;
        self.local_description = None;
        self.remote_description = None;
        self.pending_candidates.clear();
    }

    /// Take the buffered candidates, leaving the buffer empty.
    ///
    /// Called exactly once per round, immediately after the remote
    /// description becomes non-empty.
    pub fn drain_pending_candidates(&mut self) -> Vec<String> {
        std::mem::take(&mut self.pending_candidates)
    }
}

/// Shared handle to one session; the mutex enforces one writer at a time
pub type SessionHandle = Arc<Mutex<Session>>;

/// In-memory session store.
///
/// Pure storage: no I/O, no side effects beyond its own map. The per-session
/// mutex inside each [`SessionHandle`] is what serializes mutation; the
/// store itself only resolves IDs to handles.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: DashMap<String, SessionHandle>,
}

impl SessionStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Create a session and return its handle.
    ///
    /// Fails with `SessionAlreadyExists` if the ID is taken.
    pub fn create(
        &self,
        session_id: &str,
        role: Role,
        remote_peer: &str,
    ) -> Result<SessionHandle, PeerlinkError> {
        if self.sessions.contains_key(session_id) {
            return Err(PeerlinkError::SessionAlreadyExists {
                session_id: session_id.to_string(),
            });
        }
        let handle = Arc::new(Mutex::new(Session::new(
            session_id.to_string(),
            role,
            remote_peer.to_string(),
        )));
        self.sessions.insert(session_id.to_string(), handle.clone());
        Ok(handle)
    }

    /// Look up a session by ID.
    ///
    /// Fails with `SessionNotFound` for absent IDs; callers treat this as
    /// "no such session", never as a crash.
    pub fn get(&self, session_id: &str) -> Result<SessionHandle, PeerlinkError> {
        self.sessions
            .get(session_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| PeerlinkError::SessionNotFound {
                session_id: session_id.to_string(),
            })
    }

    /// Remove a session. Removing an absent ID is a no-op.
    pub fn remove(&self, session_id: &str) {
        self.sessions.remove(session_id);
    }

    /// Number of sessions currently stored
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the store holds no sessions
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Snapshot of all stored session IDs
    pub fn session_ids(&self) -> Vec<String> {
        self.sessions
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }
}
