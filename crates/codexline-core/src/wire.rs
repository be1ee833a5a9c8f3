//! Wire-format types for the codex app-server protocol.
//!
//! One JSON object per WebSocket text frame. Outgoing frames are requests
//! (carry an `id`, expect a response) or notifications (no `id`, no reply).
//! Inbound frames are decoded into a closed set of variants: a [`Inbound::Response`]
//! correlated by `id`, or a server-pushed [`Inbound::Event`] identified by its
//! `method` name.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Sub-protocol token negotiated during the WebSocket handshake.
pub const SUBPROTOCOL: &str = "codex.app-server.v1";

/// Handshake request sent immediately after the channel opens.
pub const METHOD_INITIALIZE: &str = "initialize";
/// Notification acknowledging a successful `initialize` exchange.
pub const METHOD_INITIALIZED: &str = "initialized";
/// Request to create a conversation on the server.
pub const METHOD_NEW_CONVERSATION: &str = "newConversation";
/// Request to subscribe to a conversation's event stream.
pub const METHOD_ADD_LISTENER: &str = "addConversationListener";
/// Request carrying one user utterance into the conversation.
pub const METHOD_SEND_USER_MESSAGE: &str = "sendUserMessage";

/// Server event: the agent produced a chat message.
pub const EVENT_AGENT_MESSAGE: &str = "codex/event/agent_message";
/// Server event: a raw model response item (debug stream).
pub const EVENT_RAW_RESPONSE_ITEM: &str = "codex/event/raw_response_item";
/// Server event: the agent finished working on the current task.
pub const EVENT_TASK_COMPLETE: &str = "codex/event/task_complete";

/// Outgoing request. The server echoes `id` in its response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientRequest {
    /// Locally assigned identifier, strictly increasing per connection.
    pub id: u64,
    /// Method name.
    pub method: String,
    /// Parameters object (`{}` when the method takes none).
    pub params: Value,
}

/// Outgoing notification. No `id`, no response expected.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientNotification {
    /// Method name.
    pub method: String,
    /// Parameters object.
    pub params: Value,
}

/// Client metadata sent with `initialize`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    /// Client name.
    pub name: String,
    /// Client version.
    pub version: String,
}

/// Parameters for `initialize`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    /// Identifies this client to the server.
    pub client_info: ClientInfo,
}

/// Parameters for `addConversationListener`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddListenerParams {
    /// Conversation to subscribe to.
    pub conversation_id: String,
    /// Request verbose raw-item event delivery.
    pub experimental_raw_events: bool,
}

/// Parameters for `sendUserMessage`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendUserMessageParams {
    /// Conversation the message belongs to.
    pub conversation_id: String,
    /// Message content items.
    pub items: Vec<UserInputItem>,
}

/// One item of user input inside `sendUserMessage`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UserInputItem {
    /// Plain text input.
    Text {
        /// Text payload wrapper.
        data: TextData,
    },
}

/// Text payload of a [`UserInputItem::Text`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TextData {
    /// The utterance.
    pub text: String,
}

impl UserInputItem {
    /// Build a text input item.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text {
            data: TextData { text: text.into() },
        }
    }
}

/// A decoded inbound frame.
///
/// The presence of an `id` field marks a response to one of our requests;
/// frames without one are server-pushed event notifications.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum Inbound {
    /// Response to a request we sent.
    Response {
        /// Echo of the originating request's identifier.
        id: u64,
        /// Result payload on success.
        #[serde(default)]
        result: Option<Value>,
        /// Error payload on failure.
        #[serde(default)]
        error: Option<Value>,
    },
    /// Server-pushed event, may arrive at any time.
    Event {
        /// Event method name (e.g. `codex/event/agent_message`).
        method: String,
        /// Event payload.
        #[serde(default)]
        params: Value,
    },
}

/// Failure to decode an inbound frame.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The frame was not valid JSON or matched no known shape.
    #[error("unrecognized frame: {0}")]
    Frame(#[from] serde_json::Error),
}

/// Decode one inbound text frame.
pub fn decode(frame: &str) -> Result<Inbound, DecodeError> {
    Ok(serde_json::from_str(frame)?)
}

/// Expected result of `initialize`.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    /// Server identity string.
    pub user_agent: String,
}

/// Expected result of `newConversation`.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewConversationResult {
    /// Opaque conversation identifier.
    pub conversation_id: String,
}

/// Expected result of `addConversationListener`.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddListenerResult {
    /// Opaque subscription identifier.
    pub subscription_id: String,
}

/// Payload of `codex/event/agent_message`.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct AgentMessageParams {
    /// Event body.
    #[serde(default)]
    pub msg: AgentMessageBody,
}

/// Body of an agent message event.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct AgentMessageBody {
    /// The agent's message text. Empty when the server omits it.
    #[serde(default)]
    pub message: String,
}

/// Payload of `codex/event/raw_response_item`.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct RawItemParams {
    /// Event body.
    #[serde(default)]
    pub msg: RawItemBody,
}

/// Body of a raw response item event.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct RawItemBody {
    /// The raw item.
    #[serde(default)]
    pub item: RawItem,
}

/// A raw model response item.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct RawItem {
    /// Content blocks; only the first text block is surfaced.
    #[serde(default)]
    pub content: Vec<RawContent>,
}

/// One content block of a raw item.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct RawContent {
    /// Text of the block, if any.
    #[serde(default)]
    pub text: String,
}

/// Payload of `codex/event/task_complete`.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCompleteParams {
    /// Conversation the completed task belonged to.
    #[serde(default)]
    pub conversation_id: String,
}
