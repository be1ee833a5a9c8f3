//! Single-threaded client runtime.
//!
//! One task owns the [`Session`] and at most one [`Transport`]. A
//! `tokio::select!` loop interleaves user intents and transport events, so
//! no two handlers ever run concurrently and the session needs no locking.
//! Session outputs are executed in order; UI events are forwarded to the
//! renderer channel.

use tokio::sync::mpsc;
use tracing::{debug, warn};

use codexline_core::session::{Input, Output, Session, UiEvent};

use crate::transport::{Transport, TransportEvent};

/// Close code used for synthetic close events after a failed connect.
const CONNECT_FAILED: u16 = 1006;

/// User intents accepted by the runtime.
#[derive(Clone, Debug)]
pub enum Intent {
    /// Connect to the given endpoint, tearing down any open connection.
    Connect(String),
    /// Begin a new conversation.
    StartConversation,
    /// Send one user message.
    SubmitText(String),
    /// Close the connection.
    Disconnect,
    /// Stop the runtime task.
    Shutdown,
}

/// Handle for feeding intents into a running client.
#[derive(Clone)]
pub struct ClientHandle {
    tx: mpsc::Sender<Intent>,
}

impl ClientHandle {
    /// Deliver one intent. A dropped runtime is logged, not an error.
    pub async fn send(&self, intent: Intent) {
        if self.tx.send(intent).await.is_err() {
            warn!("client runtime is gone");
        }
    }
}

/// Spawn the client runtime task.
///
/// Returns the intent handle and the stream of UI events for a renderer.
pub fn spawn() -> (ClientHandle, mpsc::Receiver<UiEvent>) {
    let (intent_tx, intent_rx) = mpsc::channel(64);
    let (ui_tx, ui_rx) = mpsc::channel(256);
    drop(tokio::spawn(run(intent_rx, ui_tx)));
    (ClientHandle { tx: intent_tx }, ui_rx)
}

/// The current connection and its event channel.
///
/// Every connection attempt gets a fresh channel; replacing the whole link
/// drops the old receiver, so teardown events from a dying transport can
/// never bleed into the connection that follows it.
struct Link {
    transport: Option<Transport>,
    events_tx: mpsc::Sender<TransportEvent>,
    events_rx: mpsc::Receiver<TransportEvent>,
}

impl Link {
    fn new() -> Self {
        let (events_tx, events_rx) = mpsc::channel(256);
        Self {
            transport: None,
            events_tx,
            events_rx,
        }
    }
}

async fn run(mut intents: mpsc::Receiver<Intent>, ui: mpsc::Sender<UiEvent>) {
    let mut session = Session::new();
    let mut link = Link::new();

    loop {
        let outputs = tokio::select! {
            intent = intents.recv() => match intent {
                Some(Intent::Connect(address)) => session.handle(Input::Connect(address)),
                Some(Intent::StartConversation) => session.handle(Input::StartConversation),
                Some(Intent::SubmitText(text)) => session.handle(Input::SubmitText(text)),
                Some(Intent::Disconnect) => session.handle(Input::Disconnect),
                Some(Intent::Shutdown) | None => break,
            },
            event = link.events_rx.recv() => match event {
                Some(TransportEvent::Opened) => session.handle(Input::Opened),
                Some(TransportEvent::Frame(frame)) => session.handle(Input::Frame(frame)),
                Some(TransportEvent::Closed { code, reason }) => {
                    link.transport = None;
                    session.handle(Input::Closed { code, reason })
                }
                Some(TransportEvent::Error(detail)) => {
                    session.handle(Input::TransportError(detail))
                }
                // Unreachable while link.events_tx is held.
                None => break,
            },
        };

        execute(outputs, &mut link, &ui).await;
    }
    debug!("client runtime stopped");
}

/// Execute one batch of session outputs in order.
async fn execute(outputs: Vec<Output>, link: &mut Link, ui: &mpsc::Sender<UiEvent>) {
    for output in outputs {
        match output {
            Output::Open(address) => {
                // Fresh link per connection; the old transport and any of
                // its still-queued events go away with the old channel.
                *link = Link::new();
                match Transport::connect(&address, link.events_tx.clone()).await {
                    Ok(t) => link.transport = Some(t),
                    Err(e) => {
                        warn!(address = %address, error = %e, "connect failed");
                        let _ = link.events_tx.send(TransportEvent::Error(e.to_string())).await;
                        let _ = link
                            .events_tx
                            .send(TransportEvent::Closed {
                                code: CONNECT_FAILED,
                                reason: "connect failed".into(),
                            })
                            .await;
                    }
                }
            }
            Output::SendFrame(frame) => match link.transport.as_ref() {
                Some(t) => t.send(frame),
                None => warn!("cannot send frame: not connected"),
            },
            Output::Close => {
                if let Some(t) = link.transport.take() {
                    t.close();
                    // Hold the transport briefly so the close frame flushes.
                    drop(tokio::spawn(async move {
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                        drop(t);
                    }));
                }
            }
            Output::Ui(event) => {
                if ui.send(event).await.is_err() {
                    debug!("ui receiver dropped");
                }
            }
        }
    }
}
