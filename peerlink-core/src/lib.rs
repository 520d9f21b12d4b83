//! # peerlink-core
//!
//! Session data model and offer/answer negotiation state machine for
//! peerlink. This crate is pure negotiation logic: it owns session state,
//! enforces transition ordering and glare resolution, and talks to the
//! platform peer-connection primitive only through the narrow
//! [`MediaSession`] trait. Signaling I/O and session routing live in the
//! `peerlink` crate.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod engine;
pub mod error;
pub mod media;
pub mod protocol;
pub mod session;

// Re-export main types
pub use engine::{initiator_yields, CloseReason, EngineEvent, EngineOutput, NegotiationEngine};
pub use error::PeerlinkError;
pub use media::{MediaEvent, MediaFactory, MediaSession};
pub use protocol::{SignalEnvelope, SignalMessage};
pub use session::{NegotiationState, Role, Session, SessionHandle, SessionStore};
