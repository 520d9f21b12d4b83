//! Offer/answer negotiation state machine
//!
//! One [`NegotiationEngine`] drives one session. Every step mutates the
//! session through an exclusive borrow and returns an [`EngineOutput`]
//! holding queued outbound messages and lifecycle events; the caller
//! dispatches both only after the session's lock is released, so a slow
//! signaling transport can never stall other sessions.

use crate::error::PeerlinkError;
use crate::media::MediaSession;
use crate::protocol::SignalMessage;
use crate::session::{NegotiationState, Role, Session};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, warn};

/// Why a session reached [`NegotiationState::Closed`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Local caller asked for teardown
    LocalClose,
    /// Remote peer sent a bye
    RemoteBye,
    /// Signaling transport failed past the retry budget
    TransportFailure,
    /// No negotiation progress within the deadline
    NegotiationTimeout,
    /// Platform media capability gave up on connectivity
    MediaFailure,
    /// This side's offer lost a glare tie-break; the remote peer's
    /// session replaces it
    Superseded,
}

impl CloseReason {
    /// Short name used in logs and events
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::LocalClose => "local_close",
            CloseReason::RemoteBye => "remote_bye",
            CloseReason::TransportFailure => "transport_failure",
            CloseReason::NegotiationTimeout => "negotiation_timeout",
            CloseReason::MediaFailure => "media_failure",
            CloseReason::Superseded => "superseded",
        }
    }
}

/// Lifecycle notification produced by an engine step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineEvent {
    /// A remote offer was stored; the local side must accept to proceed
    RemoteOffer,
    /// The session completed a negotiation round
    Connected,
    /// The session was torn down
    Closed(CloseReason),
}

/// Result of one engine step: messages to send and events to surface,
/// both dispatched by the caller after the session lock is dropped.
#[derive(Debug, Default)]
pub struct EngineOutput {
    /// Outbound signaling messages, in emission order
    pub outbound: Vec<SignalMessage>,
    /// Lifecycle events for the caller's observer
    pub events: Vec<EngineEvent>,
}

impl EngineOutput {
    fn empty() -> Self {
        Self::default()
    }
}

/// Tie-break for initial-offer glare.
///
/// When both peers open independent initiator sessions toward each other
/// concurrently, the peer whose local session ID is lexicographically
/// larger yields: it abandons its own offer and answers the remote one.
/// Both ends must apply this rule independently; it is a pure function of
/// the two session IDs and needs no central arbiter.
pub fn initiator_yields(local_session_id: &str, remote_session_id: &str) -> bool {
    local_session_id > remote_session_id
}

/// State machine driver for one session.
///
/// Holds the platform media handle for the session; the session itself is
/// owned by the store and only ever borrowed mutably for the duration of
/// one step.
pub struct NegotiationEngine {
    media: Arc<dyn MediaSession>,
}

impl NegotiationEngine {
    /// Create an engine backed by the given media-capability handle
    pub fn new(media: Arc<dyn MediaSession>) -> Self {
        Self { media }
    }

    /// Start (or restart) a negotiation round as the initiator.
    ///
    /// Valid from `Idle` for the first round and from `Connected` for
    /// renegotiation. Produces the local offer and queues it for dispatch.
    pub async fn initiate(&self, session: &mut Session) -> Result<EngineOutput, PeerlinkError> {
        if session.role != Role::Initiator {
            return Err(self.violation(session, "initiate"));
        }
        match session.state {
            NegotiationState::Idle | NegotiationState::Connected => {}
            _ => return Err(self.violation(session, "initiate")),
        }

        session.begin_round();
        session.state = NegotiationState::OfferCreated;

        let sdp = self
            .media
            .create_local_description(session.role, session.round)
            .await?;
        session.local_description = Some(sdp.clone());
        session.touch(Utc::now());
        session.state = NegotiationState::OfferSent;

        debug!(
            session_id = %session.session_id,
            round = session.round,
            "offer created, queued for dispatch"
        );

        Ok(EngineOutput {
            outbound: vec![SignalMessage::Offer { sdp }],
            events: vec![],
        })
    }

    /// Accept a received offer, producing and queueing the local answer.
    pub async fn accept(&self, session: &mut Session) -> Result<EngineOutput, PeerlinkError> {
        if session.state != NegotiationState::OfferReceived {
            return Err(self.violation(session, "accept"));
        }

        session.state = NegotiationState::AnswerCreated;
        let sdp = self
            .media
            .create_local_description(session.role, session.round)
            .await?;
        session.local_description = Some(sdp.clone());
        session.touch(Utc::now());
        session.state = NegotiationState::AnswerSent;

        debug!(
            session_id = %session.session_id,
            round = session.round,
            "answer created, queued for dispatch"
        );

        Ok(EngineOutput {
            outbound: vec![SignalMessage::Answer { sdp }],
            events: vec![],
        })
    }

    /// Process one inbound signaling message for this session.
    ///
    /// A message invalid for the current state fails with
    /// `ProtocolViolation`; the caller logs and drops it, the session
    /// survives untouched.
    pub async fn handle_message(
        &self,
        session: &mut Session,
        message: &SignalMessage,
    ) -> Result<EngineOutput, PeerlinkError> {
        if session.state == NegotiationState::Closed {
            return Err(self.violation(session, message.message_type()));
        }
        match message {
            SignalMessage::Offer { sdp } => self.handle_offer(session, sdp).await,
            SignalMessage::Answer { sdp } => self.handle_answer(session, sdp).await,
            SignalMessage::Candidate { candidate } => {
                self.handle_candidate(session, candidate).await
            }
            SignalMessage::Bye => Ok(self.close(session, CloseReason::RemoteBye).await),
        }
    }

    /// Platform signalled that peer connectivity is established.
    ///
    /// Completes the responder path (`AnswerSent` → `Connected`). In any
    /// other state the notification is informational and ignored.
    pub async fn connectivity_established(&self, session: &mut Session) -> EngineOutput {
        if session.state != NegotiationState::AnswerSent {
            debug!(
                session_id = %session.session_id,
                state = session.state.as_str(),
                "connectivity notification outside answer_sent, ignoring"
            );
            return EngineOutput::empty();
        }
        session.state = NegotiationState::Connected;
        session.touch(Utc::now());
        debug!(session_id = %session.session_id, round = session.round, "connected");
        EngineOutput {
            outbound: vec![],
            events: vec![EngineEvent::Connected],
        }
    }

    /// Tear the session down. Idempotent: closing an already-closed
    /// session produces no output and no second event.
    pub async fn close(&self, session: &mut Session, reason: CloseReason) -> EngineOutput {
        if session.state == NegotiationState::Closed {
            return EngineOutput::empty();
        }
        session.state = NegotiationState::Closed;
        self.media.close().await;

        debug!(
            session_id = %session.session_id,
            reason = reason.as_str(),
            "session closed"
        );

        // Only a local close notifies the remote side; the other reasons
        // either originate remotely or imply the transport is unusable.
        let outbound = if reason == CloseReason::LocalClose {
            vec![SignalMessage::Bye]
        } else {
            vec![]
        };

        EngineOutput {
            outbound,
            events: vec![EngineEvent::Closed(reason)],
        }
    }

    async fn handle_offer(
        &self,
        session: &mut Session,
        sdp: &str,
    ) -> Result<EngineOutput, PeerlinkError> {
        match session.state {
            // First round, responder side.
            NegotiationState::Idle if session.role == Role::Responder => {
                session.begin_round();
            }
            // Renegotiation: the remote side re-offers inside an
            // established session.
            NegotiationState::Connected => {
                session.begin_round();
            }
            // Renegotiation glare: both ends re-offered at once. The
            // session's original responder is the polite peer and yields;
            // the initiator keeps its own offer in flight and drops the
            // incoming one. Both ends compute this from the fixed role, so
            // they agree without coordination.
            NegotiationState::OfferSent => {
                if session.role == Role::Initiator {
                    debug!(
                        session_id = %session.session_id,
                        "glare: keeping own offer, dropping remote offer"
                    );
                    return Ok(EngineOutput::empty());
                }
                debug!(
                    session_id = %session.session_id,
                    "glare: yielding to remote offer"
                );
                session.local_description = None;
            }
            _ => return Err(self.violation(session, "offer")),
        }

        self.media.apply_remote_description(sdp).await?;
        session.remote_description = Some(sdp.to_string());
        let applied = self.apply_buffered_candidates(session).await?;
        session.touch(Utc::now());
        session.state = NegotiationState::OfferReceived;

        debug!(
            session_id = %session.session_id,
            round = session.round,
            buffered_candidates = applied,
            "remote offer stored"
        );
        Ok(EngineOutput {
            outbound: vec![],
            events: vec![EngineEvent::RemoteOffer],
        })
    }

    async fn handle_answer(
        &self,
        session: &mut Session,
        sdp: &str,
    ) -> Result<EngineOutput, PeerlinkError> {
        if session.state != NegotiationState::OfferSent {
            return Err(self.violation(session, "answer"));
        }

        self.media.apply_remote_description(sdp).await?;
        session.remote_description = Some(sdp.to_string());
        session.state = NegotiationState::AnswerReceived;
        let applied = self.apply_buffered_candidates(session).await?;
        session.touch(Utc::now());
        session.state = NegotiationState::Connected;

        debug!(
            session_id = %session.session_id,
            round = session.round,
            buffered_candidates = applied,
            "answer applied, connected"
        );
        Ok(EngineOutput {
            outbound: vec![],
            events: vec![EngineEvent::Connected],
        })
    }

    async fn handle_candidate(
        &self,
        session: &mut Session,
        candidate: &str,
    ) -> Result<EngineOutput, PeerlinkError> {
        session.touch(Utc::now());
        if session.remote_description.is_some() {
            self.media.add_remote_candidate(candidate).await?;
            debug!(session_id = %session.session_id, "candidate applied");
        } else {
            session.pending_candidates.push(candidate.to_string());
            debug!(
                session_id = %session.session_id,
                buffered = session.pending_candidates.len(),
                "candidate buffered until remote description arrives"
            );
        }
        Ok(EngineOutput::empty())
    }

    /// Drain candidates buffered before the remote description existed and
    /// apply them in arrival order. Must run immediately after
    /// `remote_description` is set.
    async fn apply_buffered_candidates(
        &self,
        session: &mut Session,
    ) -> Result<usize, PeerlinkError> {
        let buffered = session.drain_pending_candidates();
        let count = buffered.len();
        for candidate in &buffered {
            self.media.add_remote_candidate(candidate).await?;
        }
        Ok(count)
    }

    fn violation(&self, session: &Session, message_type: &str) -> PeerlinkError {
        warn!(
            session_id = %session.session_id,
            state = session.state.as_str(),
            message_type,
            "message invalid for current state, dropping"
        );
        PeerlinkError::ProtocolViolation {
            session_id: session.session_id.clone(),
            state: session.state.as_str().to_string(),
            message_type: message_type.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Deterministic media stub recording everything applied to it
    #[derive(Default)]
    struct MockMedia {
        applied_candidates: Mutex<Vec<String>>,
        applied_descriptions: Mutex<Vec<String>>,
        closed: Mutex<bool>,
    }

    #[async_trait]
    impl MediaSession for MockMedia {
        async fn create_local_description(
            &self,
            role: Role,
            round: u32,
        ) -> Result<String, PeerlinkError> {
            Ok(format!("sdp-{}-r{}", role.as_str(), round))
        }

        async fn apply_remote_description(&self, sdp: &str) -> Result<(), PeerlinkError> {
            self.applied_descriptions.lock().push(sdp.to_string());
            Ok(())
        }

        async fn add_remote_candidate(&self, candidate: &str) -> Result<(), PeerlinkError> {
            self.applied_candidates.lock().push(candidate.to_string());
            Ok(())
        }

        async fn close(&self) {
            *self.closed.lock() = true;
        }
    }

    fn engine() -> (NegotiationEngine, Arc<MockMedia>) {
        let media = Arc::new(MockMedia::default());
        (NegotiationEngine::new(media.clone()), media)
    }

    fn initiator() -> Session {
        Session::new("s1".to_string(), Role::Initiator, "bob".to_string())
    }

    fn responder() -> Session {
        Session::new("s1".to_string(), Role::Responder, "alice".to_string())
    }

    #[tokio::test]
    async fn initiator_happy_path() {
        let (engine, _media) = engine();
        let mut session = initiator();

        let out = engine.initiate(&mut session).await.unwrap();
        assert_eq!(session.state, NegotiationState::OfferSent);
        assert_eq!(session.round, 1);
        assert_eq!(
            out.outbound,
            vec![SignalMessage::Offer {
                sdp: "sdp-initiator-r1".to_string()
            }]
        );

        let out = engine
            .handle_message(
                &mut session,
                &SignalMessage::Answer {
                    sdp: "remote-answer".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(session.state, NegotiationState::Connected);
        assert_eq!(out.events, vec![EngineEvent::Connected]);
        assert_eq!(session.remote_description.as_deref(), Some("remote-answer"));
    }

    #[tokio::test]
    async fn responder_happy_path() {
        let (engine, _media) = engine();
        let mut session = responder();

        let out = engine
            .handle_message(
                &mut session,
                &SignalMessage::Offer {
                    sdp: "remote-offer".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(session.state, NegotiationState::OfferReceived);
        assert_eq!(out.events, vec![EngineEvent::RemoteOffer]);

        let out = engine.accept(&mut session).await.unwrap();
        assert_eq!(session.state, NegotiationState::AnswerSent);
        assert_eq!(
            out.outbound,
            vec![SignalMessage::Answer {
                sdp: "sdp-responder-r1".to_string()
            }]
        );

        let out = engine.connectivity_established(&mut session).await;
        assert_eq!(session.state, NegotiationState::Connected);
        assert_eq!(out.events, vec![EngineEvent::Connected]);
    }

    #[tokio::test]
    async fn answer_in_idle_is_violation_and_leaves_state_alone() {
        let (engine, _media) = engine();
        let mut session = initiator();

        let err = engine
            .handle_message(
                &mut session,
                &SignalMessage::Answer {
                    sdp: "early".to_string(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PeerlinkError::ProtocolViolation { .. }));
        assert_eq!(err.error_code(), "PROTOCOL_VIOLATION");
        assert_eq!(session.state, NegotiationState::Idle);
    }

    #[tokio::test]
    async fn offer_to_initiator_in_idle_is_violation() {
        let (engine, _media) = engine();
        let mut session = initiator();

        let err = engine
            .handle_message(
                &mut session,
                &SignalMessage::Offer {
                    sdp: "unexpected".to_string(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PeerlinkError::ProtocolViolation { .. }));
    }

    #[tokio::test]
    async fn candidates_buffered_then_applied_in_arrival_order() {
        let (engine, media) = engine();
        let mut session = initiator();
        engine.initiate(&mut session).await.unwrap();

        // Candidates arrive before the remote answer exists.
        for c in ["c1", "c2", "c3"] {
            engine
                .handle_message(
                    &mut session,
                    &SignalMessage::Candidate {
                        candidate: c.to_string(),
                    },
                )
                .await
                .unwrap();
        }
        assert!(media.applied_candidates.lock().is_empty());
        assert_eq!(session.pending_candidates.len(), 3);

        engine
            .handle_message(
                &mut session,
                &SignalMessage::Answer {
                    sdp: "remote-answer".to_string(),
                },
            )
            .await
            .unwrap();

        assert_eq!(*media.applied_candidates.lock(), vec!["c1", "c2", "c3"]);
        assert!(session.pending_candidates.is_empty());

        // After the remote description is set, candidates apply directly.
        engine
            .handle_message(
                &mut session,
                &SignalMessage::Candidate {
                    candidate: "c4".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(
            *media.applied_candidates.lock(),
            vec!["c1", "c2", "c3", "c4"]
        );
    }

    #[tokio::test]
    async fn close_is_idempotent_with_single_event() {
        let (engine, media) = engine();
        let mut session = initiator();

        let out = engine.close(&mut session, CloseReason::LocalClose).await;
        assert_eq!(
            out.events,
            vec![EngineEvent::Closed(CloseReason::LocalClose)]
        );
        assert_eq!(out.outbound, vec![SignalMessage::Bye]);
        assert!(*media.closed.lock());

        let out = engine.close(&mut session, CloseReason::LocalClose).await;
        assert!(out.events.is_empty());
        assert!(out.outbound.is_empty());
    }

    #[tokio::test]
    async fn remote_bye_closes_without_echoing_bye() {
        let (engine, _media) = engine();
        let mut session = responder();

        let out = engine
            .handle_message(&mut session, &SignalMessage::Bye)
            .await
            .unwrap();
        assert_eq!(session.state, NegotiationState::Closed);
        assert_eq!(out.events, vec![EngineEvent::Closed(CloseReason::RemoteBye)]);
        assert!(out.outbound.is_empty());
    }

    #[tokio::test]
    async fn message_after_close_is_violation() {
        let (engine, _media) = engine();
        let mut session = responder();
        engine.close(&mut session, CloseReason::LocalClose).await;

        let err = engine
            .handle_message(
                &mut session,
                &SignalMessage::Candidate {
                    candidate: "late".to_string(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PeerlinkError::ProtocolViolation { .. }));
    }

    #[tokio::test]
    async fn renegotiation_starts_new_round_preserving_identity() {
        let (engine, _media) = engine();
        let mut session = initiator();

        engine.initiate(&mut session).await.unwrap();
        engine
            .handle_message(
                &mut session,
                &SignalMessage::Answer {
                    sdp: "answer-1".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(session.state, NegotiationState::Connected);

        let out = engine.initiate(&mut session).await.unwrap();
        assert_eq!(session.state, NegotiationState::OfferSent);
        assert_eq!(session.round, 2);
        assert_eq!(session.role, Role::Initiator);
        assert_eq!(session.session_id, "s1");
        assert!(session.remote_description.is_none());
        assert_eq!(
            out.outbound,
            vec![SignalMessage::Offer {
                sdp: "sdp-initiator-r2".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn renegotiation_glare_responder_yields() {
        let (engine, _media) = engine();
        let mut session = responder();

        // Establish the session, then both ends re-offer.
        engine
            .handle_message(
                &mut session,
                &SignalMessage::Offer {
                    sdp: "offer-1".to_string(),
                },
            )
            .await
            .unwrap();
        engine.accept(&mut session).await.unwrap();
        engine.connectivity_established(&mut session).await;
        assert_eq!(session.state, NegotiationState::Connected);

        // Responder-side renegotiation offer goes out... the responder is
        // not allowed to initiate, so simulate via state for the glare
        // branch: a remote re-offer lands while our own offer is in flight.
        session.begin_round();
        session.state = NegotiationState::OfferSent;
        session.local_description = Some("our-re-offer".to_string());

        engine
            .handle_message(
                &mut session,
                &SignalMessage::Offer {
                    sdp: "their-re-offer".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(session.state, NegotiationState::OfferReceived);
        assert!(session.local_description.is_none());
        assert_eq!(
            session.remote_description.as_deref(),
            Some("their-re-offer")
        );
    }

    #[tokio::test]
    async fn renegotiation_glare_initiator_keeps_own_offer() {
        let (engine, _media) = engine();
        let mut session = initiator();
        engine.initiate(&mut session).await.unwrap();
        assert_eq!(session.state, NegotiationState::OfferSent);

        let out = engine
            .handle_message(
                &mut session,
                &SignalMessage::Offer {
                    sdp: "their-offer".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(session.state, NegotiationState::OfferSent);
        assert!(out.outbound.is_empty());
        assert!(session.remote_description.is_none());
    }

    #[test]
    fn initial_glare_tie_break_larger_id_yields() {
        assert!(initiator_yields("b", "a"));
        assert!(!initiator_yields("a", "b"));
        assert!(!initiator_yields("a", "a"));
    }
}
