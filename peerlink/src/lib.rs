//! # peerlink
//!
//! WebRTC signaling and session-negotiation core. Drives the
//! offer/answer/candidate exchange for any number of concurrent peer
//! sessions over an external rendezvous service, with glare resolution,
//! timeout sweeps and bounded transport retries. Media capture, encoding
//! and the peer-connection transport itself stay behind the
//! [`peerlink_core::MediaSession`] trait.
//!
//! ```no_run
//! use peerlink::{ManagerConfig, SessionManager, WebSocketChannel};
//! use peerlink_core::MediaFactory;
//! use std::sync::Arc;
//!
//! # async fn run(media: Arc<dyn MediaFactory>) -> Result<(), peerlink_core::PeerlinkError> {
//! let (channel, inbound) = WebSocketChannel::connect("ws://rendezvous:8080/ws").await?;
//! let (manager, mut events) =
//!     SessionManager::new(ManagerConfig::new("alice"), Arc::new(channel), media);
//! manager.spawn_inbound_loop(inbound);
//! manager.spawn_sweeper();
//!
//! let session_id = manager.start_session("bob").await?;
//! while let Some(event) = events.next().await {
//!     println!("{}: {}", event.session_id(), event.event_type());
//! }
//! # let _ = session_id;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod config;
pub mod event;
pub mod manager;

// Re-export main types
pub use channel::{MemoryChannel, SignalReceiver, SignalingChannel, WebSocketChannel};
pub use config::ManagerConfig;
pub use event::{EventStream, SessionEvent};
pub use manager::SessionManager;
pub use peerlink_core::{CloseReason, MediaEvent, NegotiationState, Role};
