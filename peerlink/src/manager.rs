//! Session manager: routing, lifecycle and timeout sweeps
//!
//! The manager owns the set of active sessions. Every inbound envelope is
//! processed under that session's lock, so no two messages for one
//! session run concurrently while distinct sessions proceed in parallel.
//! Outbound sends are collected while locked and dispatched only after
//! the lock is released; a slow transport therefore cannot stall other
//! sessions.

use crate::channel::{SignalReceiver, SignalingChannel};
use crate::config::ManagerConfig;
use crate::event::{EventStream, SessionEvent};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use peerlink_core::{
    initiator_yields, CloseReason, EngineEvent, EngineOutput, MediaEvent, MediaFactory,
    NegotiationEngine, NegotiationState, PeerlinkError, SessionStore, SignalEnvelope,
    SignalMessage,
};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Owns and routes all active sessions for one local peer
pub struct SessionManager {
    config: ManagerConfig,
    store: SessionStore,
    engines: DashMap<String, Arc<NegotiationEngine>>,
    /// Initiator session in flight per remote peer, for glare detection
    initiators_by_peer: DashMap<String, String>,
    channel: Arc<dyn SignalingChannel>,
    media: Arc<dyn MediaFactory>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionManager {
    /// Create a manager and the event stream its lifecycle events flow to
    pub fn new(
        config: ManagerConfig,
        channel: Arc<dyn SignalingChannel>,
        media: Arc<dyn MediaFactory>,
    ) -> (Arc<Self>, EventStream) {
        let (events, stream) = EventStream::channel();
        (
            Arc::new(Self {
                config,
                store: SessionStore::new(),
                engines: DashMap::new(),
                initiators_by_peer: DashMap::new(),
                channel,
                media,
                events,
            }),
            stream,
        )
    }

    /// Start a new initiator session toward `remote_peer`.
    ///
    /// Produces the local offer and dispatches it; returns the new
    /// session's ID.
    pub async fn start_session(&self, remote_peer: &str) -> Result<String, PeerlinkError> {
        let session_id = Uuid::new_v4().to_string();
        let media = self
            .media
            .create_session(&session_id, peerlink_core::Role::Initiator)
            .await?;
        let engine = Arc::new(NegotiationEngine::new(media));

        let handle = self
            .store
            .create(&session_id, peerlink_core::Role::Initiator, remote_peer)?;
        self.engines.insert(session_id.clone(), engine.clone());
        self.initiators_by_peer
            .insert(remote_peer.to_string(), session_id.clone());

        let output = {
            let mut session = handle.lock().await;
            match engine.initiate(&mut session).await {
                Ok(output) => output,
                Err(e) => {
                    drop(session);
                    self.forget(&session_id, remote_peer);
                    return Err(e);
                }
            }
        };

        info!(session_id = %session_id, remote_peer, "session started");
        self.dispatch(&session_id, remote_peer, output).await;
        Ok(session_id)
    }

    /// Accept a pending remote offer on a responder session
    pub async fn accept_session(&self, session_id: &str) -> Result<(), PeerlinkError> {
        let handle = self.store.get(session_id)?;
        let engine = self.engine(session_id)?;

        let (output, remote_peer) = {
            let mut session = handle.lock().await;
            let output = engine.accept(&mut session).await?;
            (output, session.remote_peer.clone())
        };

        self.dispatch(session_id, &remote_peer, output).await;
        Ok(())
    }

    /// Route one inbound signaling envelope.
    ///
    /// A session is created lazily on the first offer for an unknown ID,
    /// always with the responder role; any other message for an unknown
    /// ID fails with `SessionNotFound` and is dropped. Messages invalid
    /// for the session's state are logged and dropped without touching it.
    pub async fn handle_inbound(&self, envelope: SignalEnvelope) -> Result<(), PeerlinkError> {
        let handle = match self.store.get(&envelope.session_id) {
            Ok(handle) => handle,
            Err(_) => {
                if let SignalMessage::Offer { .. } = envelope.message {
                    if !self.resolve_initial_glare(&envelope).await {
                        // Our own offer stands; the remote side will yield.
                        return Ok(());
                    }
                    self.create_responder_session(&envelope).await?
                } else {
                    warn!(
                        session_id = %envelope.session_id,
                        message_type = envelope.message.message_type(),
                        "message for unknown session, dropping"
                    );
                    return Err(PeerlinkError::SessionNotFound {
                        session_id: envelope.session_id,
                    });
                }
            }
        };

        let engine = self.engine(&envelope.session_id)?;
        let (result, remote_peer) = {
            let mut session = handle.lock().await;
            let result = engine.handle_message(&mut session, &envelope.message).await;
            (result, session.remote_peer.clone())
        };

        match result {
            Ok(output) => {
                self.dispatch(&envelope.session_id, &remote_peer, output)
                    .await;
                Ok(())
            }
            // Dropped message, session survives. The engine already
            // logged the violation.
            Err(e) if !e.is_session_fatal() => Ok(()),
            Err(e) => {
                self.fail_session(&envelope.session_id, CloseReason::MediaFailure, &e)
                    .await;
                Err(e)
            }
        }
    }

    /// Close a session locally. Idempotent: closing an unknown or
    /// already-closed session is a no-op and emits no second event.
    pub async fn close_session(&self, session_id: &str) {
        self.close_with_reason(session_id, CloseReason::LocalClose)
            .await;
    }

    /// Close every session whose negotiation round has been idle longer
    /// than the inactivity timeout.
    ///
    /// The deadline is a negotiation deadline: `Connected` sessions are
    /// exempt, since signaling silence on an established session is
    /// normal. Returns the IDs that were closed. Each candidate is
    /// checked under its own session lock, so a sweep cannot race an
    /// in-flight negotiation step.
    pub async fn sweep_timeouts(&self, now: DateTime<Utc>) -> Vec<String> {
        let limit = chrono::Duration::from_std(self.config.inactivity_timeout)
            .unwrap_or(chrono::Duration::MAX);
        let mut closed = Vec::new();

        for session_id in self.store.session_ids() {
            let Ok(handle) = self.store.get(&session_id) else {
                continue;
            };
            let Ok(engine) = self.engine(&session_id) else {
                continue;
            };

            let swept = {
                let mut session = handle.lock().await;
                let idle = now.signed_duration_since(session.last_activity);
                let negotiating =
                    session.state.is_live() && session.state != NegotiationState::Connected;
                if negotiating && idle > limit {
                    let output = engine
                        .close(&mut session, CloseReason::NegotiationTimeout)
                        .await;
                    let remote_peer = session.remote_peer.clone();
                    Some((output, remote_peer))
                } else {
                    None
                }
            };

            if let Some((output, remote_peer)) = swept {
                info!(session_id = %session_id, "session swept after inactivity");
                self.dispatch(&session_id, &remote_peer, output).await;
                closed.push(session_id);
            }
        }
        closed
    }

    /// React to a platform media notification
    pub async fn handle_media_event(&self, event: MediaEvent) {
        match event {
            MediaEvent::LocalCandidate {
                session_id,
                candidate,
            } => {
                let Ok(handle) = self.store.get(&session_id) else {
                    debug!(session_id = %session_id, "candidate for unknown session, dropping");
                    return;
                };
                let remote_peer = {
                    let session = handle.lock().await;
                    session.remote_peer.clone()
                };
                self.dispatch(
                    &session_id,
                    &remote_peer,
                    EngineOutput {
                        outbound: vec![SignalMessage::Candidate { candidate }],
                        events: vec![],
                    },
                )
                .await;
            }
            MediaEvent::ConnectivityEstablished { session_id } => {
                let Ok(handle) = self.store.get(&session_id) else {
                    return;
                };
                let Ok(engine) = self.engine(&session_id) else {
                    return;
                };
                let (output, remote_peer) = {
                    let mut session = handle.lock().await;
                    let output = engine.connectivity_established(&mut session).await;
                    (output, session.remote_peer.clone())
                };
                self.dispatch(&session_id, &remote_peer, output).await;
            }
            MediaEvent::ConnectionFailed { session_id, reason } => {
                let error = PeerlinkError::MediaFailure { reason };
                self.fail_session(&session_id, CloseReason::MediaFailure, &error)
                    .await;
            }
        }
    }

    /// Spawn the loop feeding inbound envelopes into the manager.
    ///
    /// Envelopes are processed sequentially, which preserves the
    /// per-session delivery order the engine relies on.
    pub fn spawn_inbound_loop(self: &Arc<Self>, mut receiver: SignalReceiver) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            while let Some(envelope) = receiver.recv().await {
                // Errors are routing misses already logged; the loop and
                // the manager outlive any single bad message.
                let _ = manager.handle_inbound(envelope).await;
            }
            debug!("inbound signaling stream ended");
        })
    }

    /// Spawn the periodic timeout sweeper
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                manager.sweep_timeouts(Utc::now()).await;
            }
        })
    }

    /// Number of sessions currently tracked
    pub fn session_count(&self) -> usize {
        self.store.len()
    }

    /// Current negotiation state of a session, if it exists
    pub async fn session_state(&self, session_id: &str) -> Option<NegotiationState> {
        let handle = self.store.get(session_id).ok()?;
        let session = handle.lock().await;
        Some(session.state)
    }

    /// Initial-offer glare: an offer arrived for an unknown session while
    /// one of our own initiator offers toward the same peer is in flight.
    ///
    /// Returns `true` when the remote offer should be answered (no glare,
    /// or our side yielded), `false` when our offer stands and the remote
    /// offer is dropped. The tie-break compares the two session IDs; the
    /// lexicographically larger one yields, so both ends agree without a
    /// central arbiter.
    async fn resolve_initial_glare(&self, envelope: &SignalEnvelope) -> bool {
        let Some(local_id) = self
            .initiators_by_peer
            .get(&envelope.from)
            .map(|entry| entry.value().clone())
        else {
            return true;
        };
        let Ok(handle) = self.store.get(&local_id) else {
            return true;
        };

        let yielded = {
            let mut session = handle.lock().await;
            if session.state != NegotiationState::OfferSent {
                return true;
            }
            if !initiator_yields(&local_id, &envelope.session_id) {
                debug!(
                    local_session = %local_id,
                    remote_session = %envelope.session_id,
                    "glare: our offer stands, dropping remote offer"
                );
                return false;
            }
            let Ok(engine) = self.engine(&local_id) else {
                return true;
            };
            info!(
                local_session = %local_id,
                remote_session = %envelope.session_id,
                "glare: yielding, answering remote offer instead"
            );
            let output = engine.close(&mut session, CloseReason::Superseded).await;
            let remote_peer = session.remote_peer.clone();
            (output, remote_peer)
        };

        let (output, remote_peer) = yielded;
        self.dispatch(&local_id, &remote_peer, output).await;
        true
    }

    async fn create_responder_session(
        &self,
        envelope: &SignalEnvelope,
    ) -> Result<peerlink_core::SessionHandle, PeerlinkError> {
        let media = self
            .media
            .create_session(&envelope.session_id, peerlink_core::Role::Responder)
            .await?;
        let engine = Arc::new(NegotiationEngine::new(media));
        let handle = self.store.create(
            &envelope.session_id,
            peerlink_core::Role::Responder,
            &envelope.from,
        )?;
        self.engines.insert(envelope.session_id.clone(), engine);
        info!(
            session_id = %envelope.session_id,
            remote_peer = %envelope.from,
            "responder session created from inbound offer"
        );
        Ok(handle)
    }

    fn engine(&self, session_id: &str) -> Result<Arc<NegotiationEngine>, PeerlinkError> {
        self.engines
            .get(session_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| PeerlinkError::SessionNotFound {
                session_id: session_id.to_string(),
            })
    }

    /// Dispatch an engine step's output: outbound messages first, then
    /// lifecycle events. Runs only after the session lock is released.
    async fn dispatch(&self, session_id: &str, remote_peer: &str, output: EngineOutput) {
        let mut send_failure = None;
        for message in output.outbound {
            let envelope = SignalEnvelope::new(
                session_id,
                self.config.local_peer.clone(),
                remote_peer,
                message,
            );
            if let Err(e) = self.send_with_retry(envelope).await {
                send_failure = Some(e);
                break;
            }
        }

        for event in output.events {
            match event {
                EngineEvent::RemoteOffer => {
                    self.emit(SessionEvent::IncomingOffer {
                        session_id: session_id.to_string(),
                        remote_peer: remote_peer.to_string(),
                    });
                }
                EngineEvent::Connected => {
                    self.initiators_by_peer
                        .remove_if(remote_peer, |_, v| v.as_str() == session_id);
                    self.emit(SessionEvent::SessionConnected {
                        session_id: session_id.to_string(),
                    });
                }
                EngineEvent::Closed(reason) => {
                    self.forget(session_id, remote_peer);
                    self.emit(SessionEvent::SessionClosed {
                        session_id: session_id.to_string(),
                        reason,
                    });
                }
            }
        }

        // A send failure is fatal to the session unless this very output
        // already tore it down.
        if let Some(e) = send_failure {
            if self.store.get(session_id).is_ok() {
                Box::pin(self.fail_session(session_id, CloseReason::TransportFailure, &e)).await;
            }
        }
    }

    /// Send with bounded retries and exponential backoff plus jitter.
    /// Exhausting the budget surfaces the last transport error.
    async fn send_with_retry(&self, envelope: SignalEnvelope) -> Result<(), PeerlinkError> {
        let mut attempt: u32 = 0;
        loop {
            match self.channel.send(envelope.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.config.max_send_retries.max(1) {
                        warn!(
                            session_id = %envelope.session_id,
                            attempts = attempt,
                            error = %e,
                            "send retries exhausted"
                        );
                        return Err(e);
                    }
                    let backoff = self.config.retry_backoff * 2u32.saturating_pow(attempt - 1);
                    let jitter_ms =
                        rand::thread_rng().gen_range(0..=(backoff.as_millis() as u64 / 2));
                    warn!(
                        session_id = %envelope.session_id,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64 + jitter_ms,
                        error = %e,
                        "send failed, retrying"
                    );
                    tokio::time::sleep(backoff + Duration::from_millis(jitter_ms)).await;
                }
            }
        }
    }

    /// Close a session because of an unrecoverable error, surfacing both
    /// the failure detail and the close to the observer.
    async fn fail_session(&self, session_id: &str, reason: CloseReason, error: &PeerlinkError) {
        self.emit(SessionEvent::SessionFailed {
            session_id: session_id.to_string(),
            error: error.to_string(),
        });
        self.close_with_reason(session_id, reason).await;
    }

    async fn close_with_reason(&self, session_id: &str, reason: CloseReason) {
        let Ok(handle) = self.store.get(session_id) else {
            return;
        };
        let Ok(engine) = self.engine(session_id) else {
            return;
        };

        let (output, remote_peer) = {
            let mut session = handle.lock().await;
            let output = engine.close(&mut session, reason).await;
            (output, session.remote_peer.clone())
        };
        self.dispatch(session_id, &remote_peer, output).await;
    }

    /// Drop all bookkeeping for a closed session
    fn forget(&self, session_id: &str, remote_peer: &str) {
        self.store.remove(session_id);
        self.engines.remove(session_id);
        self.initiators_by_peer
            .remove_if(remote_peer, |_, v| v.as_str() == session_id);
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            debug!("event observer dropped, event discarded");
        }
    }
}
