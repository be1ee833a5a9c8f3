//! WebSocket transport adapter.
//!
//! Owns the single bidirectional channel to the app-server and exposes it as
//! opaque text frames plus lifecycle events. No retries, no buffering while
//! disconnected: a send after the channel is gone is dropped with a
//! diagnostic, never an error to the caller.

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, warn};

use codexline_core::wire::SUBPROTOCOL;

/// Close code reported when the stream ends without a close frame.
const ABNORMAL_CLOSE: u16 = 1006;

/// Events raised by the transport, in channel order.
///
/// Exactly one `Opened` or `Error` follows a connect attempt; `Closed` may
/// follow at any time after that.
#[derive(Clone, Debug)]
pub enum TransportEvent {
    /// The channel finished opening.
    Opened,
    /// One inbound text frame.
    Frame(String),
    /// The channel closed.
    Closed {
        /// Close code (1006 when the peer vanished without a close frame).
        code: u16,
        /// Close reason, possibly empty.
        reason: String,
    },
    /// The channel errored. A `Closed` event follows.
    Error(String),
}

/// Failure to establish the channel.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The address was invalid or the WebSocket handshake failed.
    #[error("websocket handshake failed: {0}")]
    Handshake(#[from] tokio_tungstenite::tungstenite::Error),
}

/// One open WebSocket channel.
///
/// Dropping the transport tears down both pump tasks and the connection.
pub struct Transport {
    tx: mpsc::Sender<Message>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Transport {
    /// Open the channel and start pumping inbound frames into `events`.
    ///
    /// The `codex.app-server.v1` sub-protocol is offered during the
    /// handshake. On success an `Opened` event is delivered before any
    /// frame; connect failures are returned to the caller, which surfaces
    /// them as `Error` + `Closed` events.
    pub async fn connect(
        address: &str,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Self, TransportError> {
        let mut request = address.into_client_request()?;
        let _ = request
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(SUBPROTOCOL));

        let (stream, _response) = connect_async(request).await?;
        debug!(address, "websocket open");
        let (mut sink, mut source) = stream.split();

        let (tx, mut rx) = mpsc::channel::<Message>(64);

        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if sink.send(message).await.is_err() {
                    debug!("outbound sink closed");
                    break;
                }
            }
        });

        // Deliver Opened before the reader task exists, so a frame the
        // server sends eagerly can never precede it on the channel.
        if events.send(TransportEvent::Opened).await.is_err() {
            debug!("event receiver dropped before opened was delivered");
        }

        let pong_tx = tx.clone();
        let reader_events = events;
        let reader = tokio::spawn(async move {
            while let Some(item) = source.next().await {
                match item {
                    Ok(Message::Text(text)) => {
                        if reader_events
                            .send(TransportEvent::Frame(text.to_string()))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Ok(Message::Ping(payload)) => {
                        let _ = pong_tx.send(Message::Pong(payload)).await;
                    }
                    Ok(Message::Close(frame)) => {
                        let (code, reason) = frame
                            .map(|f| (u16::from(f.code), f.reason.to_string()))
                            .unwrap_or((ABNORMAL_CLOSE, String::new()));
                        let _ = reader_events.send(TransportEvent::Closed { code, reason }).await;
                        return;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let _ = reader_events.send(TransportEvent::Error(e.to_string())).await;
                        break;
                    }
                }
            }
            // Stream ended without a close frame.
            let _ = reader_events
                .send(TransportEvent::Closed {
                    code: ABNORMAL_CLOSE,
                    reason: String::new(),
                })
                .await;
        });

        Ok(Self { tx, reader, writer })
    }

    /// Queue one text frame for transmission.
    ///
    /// Fire-and-forget: if the channel is closed or congested the frame is
    /// dropped with a logged diagnostic.
    pub fn send(&self, frame: String) {
        if self.tx.try_send(Message::Text(frame.into())).is_err() {
            warn!("dropping outbound frame: channel closed or full");
        }
    }

    /// Request a graceful close. The server's close reply (or the dropped
    /// connection) surfaces as a `Closed` event.
    pub fn close(&self) {
        if self.tx.try_send(Message::Close(None)).is_err() {
            debug!("close requested on an already-closed channel");
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}
