//! Signaling channel abstraction and transports
//!
//! The manager talks to the rendezvous service only through
//! [`SignalingChannel`]. Implementations must preserve delivery order
//! within a session; ordering across sessions is not required.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use peerlink_core::{PeerlinkError, SignalEnvelope};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

/// Receiving half of a signaling connection
pub type SignalReceiver = mpsc::UnboundedReceiver<SignalEnvelope>;

/// Outbound half of the signaling transport
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Send one envelope toward the remote peer.
    ///
    /// A failed send is retried by the manager; implementations should
    /// fail fast rather than retry internally.
    async fn send(&self, envelope: SignalEnvelope) -> Result<(), PeerlinkError>;
}

/// In-process channel pair for tests and demos.
///
/// Sends from one endpoint arrive at the other endpoint's receiver in
/// send order. Failures can be injected to exercise the manager's retry
/// path.
pub struct MemoryChannel {
    peer_tx: mpsc::UnboundedSender<SignalEnvelope>,
    inject_failures: Arc<AtomicU32>,
}

impl MemoryChannel {
    /// Create two linked endpoints, each with its own inbound receiver
    pub fn pair() -> ((Self, SignalReceiver), (Self, SignalReceiver)) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let a = Self {
            peer_tx: b_tx,
            inject_failures: Arc::new(AtomicU32::new(0)),
        };
        let b = Self {
            peer_tx: a_tx,
            inject_failures: Arc::new(AtomicU32::new(0)),
        };
        ((a, a_rx), (b, b_rx))
    }

    /// Make the next `count` sends fail with a transport error
    pub fn fail_next_sends(&self, count: u32) {
        self.inject_failures.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl SignalingChannel for MemoryChannel {
    async fn send(&self, envelope: SignalEnvelope) -> Result<(), PeerlinkError> {
        let remaining = self.inject_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.inject_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(PeerlinkError::TransportFailure {
                reason: "injected failure".to_string(),
            });
        }
        self.peer_tx
            .send(envelope)
            .map_err(|_| PeerlinkError::ChannelClosed)
    }
}

type WsSink = futures::stream::SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Decode one text frame into an envelope
fn decode_envelope(text: &str) -> Result<SignalEnvelope, PeerlinkError> {
    serde_json::from_str(text).map_err(|e| PeerlinkError::InvalidMessage {
        source: Box::new(e),
    })
}

/// WebSocket signaling client.
///
/// Connects to a rendezvous server that relays JSON-encoded envelopes
/// between peers. WebSocket framing guarantees the in-order delivery the
/// core assumes within a session.
pub struct WebSocketChannel {
    sink: tokio::sync::Mutex<WsSink>,
}

impl WebSocketChannel {
    /// Connect to a rendezvous server.
    ///
    /// Returns the outbound channel plus the receiver the manager's run
    /// loop consumes. A background task owns the read half; the receiver
    /// yields `None` once the server closes the connection.
    pub async fn connect(url: &str) -> Result<(Self, SignalReceiver), PeerlinkError> {
        let (ws, _) =
            connect_async(url)
                .await
                .map_err(|e| PeerlinkError::TransportFailure {
                    reason: format!("websocket connect to {url}: {e}"),
                })?;
        debug!(url, "signaling connection established");

        let (sink, mut stream) = ws.split();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => match decode_envelope(&text) {
                        Ok(envelope) => {
                            if inbound_tx.send(envelope).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(
                                code = e.error_code(),
                                error = %e,
                                "undecodable signaling frame, dropping"
                            );
                        }
                    },
                    Ok(Message::Close(_)) => {
                        debug!("signaling connection closed by server");
                        break;
                    }
                    Ok(_) => {
                        // Binary, ping and pong frames carry no envelopes.
                    }
                    Err(e) => {
                        warn!(error = %e, "signaling read error");
                        break;
                    }
                }
            }
        });

        Ok((
            Self {
                sink: tokio::sync::Mutex::new(sink),
            },
            inbound_rx,
        ))
    }
}

#[async_trait]
impl SignalingChannel for WebSocketChannel {
    async fn send(&self, envelope: SignalEnvelope) -> Result<(), PeerlinkError> {
        let json =
            serde_json::to_string(&envelope).map_err(|e| PeerlinkError::TransportFailure {
                reason: format!("envelope encode: {e}"),
            })?;
        self.sink
            .lock()
            .await
            .send(Message::Text(json))
            .await
            .map_err(|e| PeerlinkError::TransportFailure {
                reason: format!("websocket send: {e}"),
            })
    }
}
