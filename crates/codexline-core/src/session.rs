//! Protocol session state machine for the codex app-server connection.
//!
//! A [`Session`] is constructed per connection attempt and fed [`Input`]s —
//! user intents and transport events — one at a time. Each input yields a
//! list of [`Output`]s: transport commands (`Open`, `SendFrame`, `Close`) and
//! UI-observable events. The session never performs I/O itself and never
//! panics on malformed frames; undecodable or incomplete frames are logged
//! and dropped.
//!
//! Responses are correlated through an explicit id → operation table rather
//! than positional convention, so the handshake sequence can change without
//! breaking correlation. Request identifiers start at 0 on every connection
//! and strictly increase while the channel stays open.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::wire::{
    self, AddListenerParams, AddListenerResult, AgentMessageParams, ClientInfo,
    ClientNotification, ClientRequest, Inbound, InitializeParams, InitializeResult,
    NewConversationResult, RawItemParams, SendUserMessageParams, TaskCompleteParams,
    UserInputItem,
};

/// Name reported to the server in `initialize`.
pub const CLIENT_NAME: &str = "codexline";
/// Version reported to the server in `initialize`.
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Coarse connection phase, in handshake order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// No channel.
    Disconnected,
    /// Channel requested, not yet open.
    Connecting,
    /// Channel open, `initialize` outstanding.
    AwaitingInit,
    /// Initialized, no conversation yet.
    Ready,
    /// A conversation exists; messages can be exchanged.
    ConversationActive,
}

/// Who produced a chat entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Speaker {
    /// The local user.
    User,
    /// The remote agent.
    Assistant,
}

/// One transcript utterance. Append-only, ordered by arrival.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChatEntry {
    /// Who said it.
    pub speaker: Speaker,
    /// The utterance text.
    pub text: String,
    /// RFC 3339 arrival timestamp.
    pub timestamp: String,
}

impl ChatEntry {
    fn now(speaker: Speaker, text: String) -> Self {
        Self {
            speaker,
            text,
            timestamp: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        }
    }
}

/// Semantic operation awaiting its response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PendingOp {
    Initialize,
    NewConversation,
    AddListener,
    SendUserMessage,
}

/// Inputs fed into the session: user intents and transport events.
#[derive(Clone, Debug)]
pub enum Input {
    /// Establish a connection to the given endpoint address.
    Connect(String),
    /// The channel finished opening.
    Opened,
    /// One inbound text frame.
    Frame(String),
    /// The channel closed.
    Closed {
        /// Close code.
        code: u16,
        /// Close reason, possibly empty.
        reason: String,
    },
    /// The transport reported an error. The channel may still close separately.
    TransportError(String),
    /// Begin a (new) conversation.
    StartConversation,
    /// The user submitted a message.
    SubmitText(String),
    /// Tear down the connection.
    Disconnect,
}

/// User-facing facts derived from protocol events, consumed by a renderer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UiEvent {
    /// The coarse phase changed.
    Phase(Phase),
    /// Human-readable status line.
    Status(String),
    /// A transcript entry was appended.
    Chat(ChatEntry),
    /// The transcript was cleared (new connection or new conversation).
    TranscriptCleared,
    /// Whether message composition is currently allowed.
    ComposerEnabled(bool),
    /// Diagnostic line, not part of the transcript.
    Trace(String),
}

/// Commands and events produced by one input.
#[derive(Clone, Debug)]
pub enum Output {
    /// Open a channel to the address.
    Open(String),
    /// Transmit one text frame.
    SendFrame(String),
    /// Close the channel.
    Close,
    /// Forward a fact to the renderer.
    Ui(UiEvent),
}

/// The single active connection context.
///
/// All fields reset when a new connection is established or the channel
/// closes; the session is never carried across connections.
#[derive(Debug)]
pub struct Session {
    phase: Phase,
    next_id: u64,
    initialized: bool,
    conversation_id: Option<String>,
    subscription_id: Option<String>,
    composer_enabled: bool,
    pending: HashMap<u64, PendingOp>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    /// Create a session in the disconnected state.
    pub fn new() -> Self {
        Self {
            phase: Phase::Disconnected,
            next_id: 0,
            initialized: false,
            conversation_id: None,
            subscription_id: None,
            composer_enabled: false,
            pending: HashMap::new(),
        }
    }

    /// Current coarse phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Active conversation identifier, if any.
    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    /// Active event subscription identifier, if any.
    pub fn subscription_id(&self) -> Option<&str> {
        self.subscription_id.as_deref()
    }

    /// Process one input and return the outputs it caused.
    pub fn handle(&mut self, input: Input) -> Vec<Output> {
        match input {
            Input::Connect(address) => self.on_connect(address),
            Input::Opened => self.on_opened(),
            Input::Frame(frame) => self.on_frame(&frame),
            Input::Closed { code, reason } => self.on_closed(code, &reason),
            Input::TransportError(detail) => {
                warn!(detail = %detail, "transport error");
                vec![Output::Ui(UiEvent::Trace(format!("transport error: {detail}")))]
            }
            Input::StartConversation => self.on_start_conversation(),
            Input::SubmitText(text) => self.on_submit(text),
            Input::Disconnect => self.on_disconnect(),
        }
    }

    fn reset(&mut self) {
        self.next_id = 0;
        self.initialized = false;
        self.conversation_id = None;
        self.subscription_id = None;
        self.composer_enabled = false;
        self.pending.clear();
    }

    /// Record the composition state and emit the matching UI event.
    fn set_composer(&mut self, enabled: bool, out: &mut Vec<Output>) {
        self.composer_enabled = enabled;
        out.push(Output::Ui(UiEvent::ComposerEnabled(enabled)));
    }

    fn on_connect(&mut self, address: String) -> Vec<Output> {
        let mut out = Vec::new();
        if self.phase != Phase::Disconnected {
            // Never two live channels: tear down the old one first.
            out.push(Output::Close);
        }
        self.reset();
        self.phase = Phase::Connecting;
        out.push(Output::Ui(UiEvent::TranscriptCleared));
        out.push(Output::Ui(UiEvent::Phase(Phase::Connecting)));
        out.push(Output::Ui(UiEvent::Status(format!("Connecting to {address}"))));
        self.set_composer(false, &mut out);
        out.push(Output::Open(address));
        out
    }

    fn on_opened(&mut self) -> Vec<Output> {
        if self.phase != Phase::Connecting {
            debug!(phase = ?self.phase, "ignoring opened event outside of connect");
            return Vec::new();
        }
        self.phase = Phase::AwaitingInit;
        let mut out = vec![
            Output::Ui(UiEvent::Phase(Phase::AwaitingInit)),
            Output::Ui(UiEvent::Status("Connected, awaiting initialization".into())),
        ];
        self.send_request(
            PendingOp::Initialize,
            wire::METHOD_INITIALIZE,
            &InitializeParams {
                client_info: ClientInfo {
                    name: CLIENT_NAME.into(),
                    version: CLIENT_VERSION.into(),
                },
            },
            &mut out,
        );
        out
    }

    fn on_frame(&mut self, frame: &str) -> Vec<Output> {
        match wire::decode(frame) {
            Ok(Inbound::Response { id, result, error }) => self.on_response(id, result, error),
            Ok(Inbound::Event { method, params }) => self.on_event(&method, params),
            Err(e) => {
                warn!(error = %e, "dropping undecodable frame");
                Vec::new()
            }
        }
    }

    fn on_response(
        &mut self,
        id: u64,
        result: Option<Value>,
        error: Option<Value>,
    ) -> Vec<Output> {
        let Some(&op) = self.pending.get(&id) else {
            debug!(id, "response for unknown request id");
            return Vec::new();
        };

        if let Some(error) = error {
            let _ = self.pending.remove(&id);
            warn!(id, %error, "request failed");
            return vec![Output::Ui(UiEvent::Trace(format!("request {id} failed: {error}")))];
        }
        let result = result.unwrap_or(Value::Null);

        match op {
            PendingOp::Initialize => self.on_initialize_result(id, result),
            PendingOp::NewConversation => self.on_new_conversation_result(id, result),
            PendingOp::AddListener => self.on_add_listener_result(id, result),
            PendingOp::SendUserMessage => {
                // Ack only; outcomes arrive via the event stream.
                let _ = self.pending.remove(&id);
                Vec::new()
            }
        }
    }

    fn on_initialize_result(&mut self, id: u64, result: Value) -> Vec<Output> {
        let Ok(init) = serde_json::from_value::<InitializeResult>(result) else {
            // Missing userAgent means "not yet", not an error.
            debug!(id, "initialize response missing userAgent, ignoring");
            return Vec::new();
        };
        let _ = self.pending.remove(&id);
        if self.initialized {
            debug!("already initialized, ignoring duplicate result");
            return Vec::new();
        }
        self.initialized = true;
        self.phase = Phase::Ready;

        let mut out = vec![Output::Ui(UiEvent::Trace(format!(
            "connected to app-server: {}",
            init.user_agent
        )))];
        self.send_notification(wire::METHOD_INITIALIZED, json!({}), &mut out);
        out.push(Output::Ui(UiEvent::Phase(Phase::Ready)));
        out.push(Output::Ui(UiEvent::Status("Connected".into())));
        // Begin a conversation without waiting for the user.
        self.send_request(
            PendingOp::NewConversation,
            wire::METHOD_NEW_CONVERSATION,
            json!({}),
            &mut out,
        );
        out
    }

    fn on_new_conversation_result(&mut self, id: u64, result: Value) -> Vec<Output> {
        let Ok(conv) = serde_json::from_value::<NewConversationResult>(result) else {
            debug!(id, "newConversation response missing conversationId, ignoring");
            return Vec::new();
        };
        let _ = self.pending.remove(&id);
        if self.conversation_id.is_some() {
            // A conversation id is set at most once per connection.
            debug!("conversation already established, ignoring");
            return Vec::new();
        }
        self.conversation_id = Some(conv.conversation_id.clone());
        self.phase = Phase::ConversationActive;
        let mut out = vec![
            Output::Ui(UiEvent::Phase(Phase::ConversationActive)),
            Output::Ui(UiEvent::Status(format!("Conversation {}", conv.conversation_id))),
        ];
        self.set_composer(true, &mut out);
        out.push(Output::Ui(UiEvent::Trace(format!(
            "conversation started: {}",
            conv.conversation_id
        ))));
        out
    }

    fn on_add_listener_result(&mut self, id: u64, result: Value) -> Vec<Output> {
        let Ok(sub) = serde_json::from_value::<AddListenerResult>(result) else {
            debug!(id, "addConversationListener response missing subscriptionId, ignoring");
            return Vec::new();
        };
        let _ = self.pending.remove(&id);
        if self.conversation_id.is_none() {
            debug!(id, "listener response with no active conversation, ignoring");
            return Vec::new();
        }
        if self.subscription_id.is_some() {
            debug!("subscription already active, ignoring");
            return Vec::new();
        }
        self.subscription_id = Some(sub.subscription_id.clone());
        vec![Output::Ui(UiEvent::Trace(format!(
            "listening for events ({})",
            sub.subscription_id
        )))]
    }

    fn on_event(&mut self, method: &str, params: Value) -> Vec<Output> {
        match method {
            wire::EVENT_AGENT_MESSAGE => {
                let parsed: AgentMessageParams =
                    serde_json::from_value(params).unwrap_or_default();
                vec![Output::Ui(UiEvent::Chat(ChatEntry::now(
                    Speaker::Assistant,
                    parsed.msg.message,
                )))]
            }
            wire::EVENT_RAW_RESPONSE_ITEM => {
                let parsed: RawItemParams =
                    serde_json::from_value(params.clone()).unwrap_or_default();
                let line = match parsed.msg.item.content.first() {
                    Some(block) if !block.text.is_empty() => block.text.clone(),
                    _ => params.to_string(),
                };
                vec![Output::Ui(UiEvent::Trace(line))]
            }
            wire::EVENT_TASK_COMPLETE => {
                let parsed: TaskCompleteParams =
                    serde_json::from_value(params).unwrap_or_default();
                // Only the active conversation re-enables composition.
                if self.conversation_id.as_deref() != Some(parsed.conversation_id.as_str()) {
                    debug!(
                        conversation_id = %parsed.conversation_id,
                        "task_complete for inactive conversation, ignoring"
                    );
                    return Vec::new();
                }
                let mut out = vec![Output::Ui(UiEvent::Status(
                    "Conversation complete (ready for new prompt)".into(),
                ))];
                self.set_composer(true, &mut out);
                out
            }
            _ => {
                debug!(method, "unhandled server event");
                Vec::new()
            }
        }
    }

    fn on_start_conversation(&mut self) -> Vec<Output> {
        if !matches!(self.phase, Phase::Ready | Phase::ConversationActive) {
            warn!(phase = ?self.phase, "cannot start conversation: not connected");
            return vec![Output::Ui(UiEvent::Trace(
                "cannot start conversation: not connected".into(),
            ))];
        }
        if self.pending.values().any(|op| *op == PendingOp::NewConversation) {
            debug!("newConversation already pending, ignoring");
            return Vec::new();
        }
        // Drop the current conversation before requesting a fresh one. Any
        // requests still in flight belonged to it, so their late responses
        // must not be correlated into the next conversation.
        self.conversation_id = None;
        self.subscription_id = None;
        self.pending.clear();
        self.phase = Phase::Ready;
        let mut out = vec![
            Output::Ui(UiEvent::TranscriptCleared),
            Output::Ui(UiEvent::Phase(Phase::Ready)),
        ];
        self.set_composer(false, &mut out);
        self.send_request(
            PendingOp::NewConversation,
            wire::METHOD_NEW_CONVERSATION,
            json!({}),
            &mut out,
        );
        out
    }

    fn on_submit(&mut self, text: String) -> Vec<Output> {
        let Some(conversation_id) = self.conversation_id.clone() else {
            warn!("rejecting message: no active conversation");
            return vec![Output::Ui(UiEvent::Trace(
                "start a conversation before sending messages".into(),
            ))];
        };
        if !self.composer_enabled {
            warn!("rejecting message: a task is still running");
            return vec![Output::Ui(UiEvent::Trace(
                "wait for the current task to complete".into(),
            ))];
        }

        let mut out = Vec::new();
        // Attach the event listener lazily, before the first message.
        if self.subscription_id.is_none()
            && !self.pending.values().any(|op| *op == PendingOp::AddListener)
        {
            self.send_request(
                PendingOp::AddListener,
                wire::METHOD_ADD_LISTENER,
                &AddListenerParams {
                    conversation_id: conversation_id.clone(),
                    experimental_raw_events: true,
                },
                &mut out,
            );
        }

        out.push(Output::Ui(UiEvent::Chat(ChatEntry::now(
            Speaker::User,
            text.clone(),
        ))));
        self.send_request(
            PendingOp::SendUserMessage,
            wire::METHOD_SEND_USER_MESSAGE,
            &SendUserMessageParams {
                conversation_id,
                items: vec![UserInputItem::text(text)],
            },
            &mut out,
        );
        // Composition stays locked until the server signals task completion.
        self.set_composer(false, &mut out);
        out
    }

    fn on_closed(&mut self, code: u16, reason: &str) -> Vec<Output> {
        if self.phase == Phase::Disconnected {
            // Already torn down (e.g. a close reply after a user disconnect).
            return Vec::new();
        }
        self.reset();
        self.phase = Phase::Disconnected;
        vec![
            Output::Ui(UiEvent::Trace(format!("connection closed: {code} {reason}"))),
            Output::Ui(UiEvent::Phase(Phase::Disconnected)),
            Output::Ui(UiEvent::Status("Disconnected".into())),
            Output::Ui(UiEvent::ComposerEnabled(false)),
        ]
    }

    fn on_disconnect(&mut self) -> Vec<Output> {
        if self.phase == Phase::Disconnected {
            return Vec::new();
        }
        self.reset();
        self.phase = Phase::Disconnected;
        vec![
            Output::Close,
            Output::Ui(UiEvent::Phase(Phase::Disconnected)),
            Output::Ui(UiEvent::Status("Disconnected".into())),
            Output::Ui(UiEvent::ComposerEnabled(false)),
        ]
    }

    /// Assign the next request id, record the pending operation, and encode
    /// the frame. Encoding these params cannot realistically fail; if it
    /// ever does the frame is dropped with a diagnostic rather than a panic.
    fn send_request(
        &mut self,
        op: PendingOp,
        method: &str,
        params: impl Serialize,
        out: &mut Vec<Output>,
    ) {
        let params = match serde_json::to_value(params) {
            Ok(v) => v,
            Err(e) => {
                warn!(method, error = %e, "failed to encode request params");
                return;
            }
        };
        let id = self.next_id;
        self.next_id += 1;
        let _ = self.pending.insert(id, op);
        let request = ClientRequest {
            id,
            method: method.to_string(),
            params,
        };
        match serde_json::to_string(&request) {
            Ok(frame) => out.push(Output::SendFrame(frame)),
            Err(e) => warn!(method, error = %e, "failed to encode request"),
        }
    }

    fn send_notification(&mut self, method: &str, params: Value, out: &mut Vec<Output>) {
        let note = ClientNotification {
            method: method.to_string(),
            params,
        };
        match serde_json::to_string(&note) {
            Ok(frame) => out.push(Output::SendFrame(frame)),
            Err(e) => warn!(method, error = %e, "failed to encode notification"),
        }
    }
}
