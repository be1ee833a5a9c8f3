//! End-to-end tests driving the client runtime against a scripted app-server.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::Message;

use codexline_client::runtime::{self, Intent};
use codexline_core::session::{Phase, Speaker, UiEvent};

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>;
type WsSink = futures::stream::SplitSink<WsStream, Message>;

async fn send_json(tx: &mut WsSink, value: Value) {
    tx.send(Message::Text(value.to_string().into())).await.unwrap();
}

/// Frames the scripted server received, plus the offered sub-protocol.
#[derive(Clone, Default)]
struct ServerLog {
    requests: Arc<Mutex<Vec<Value>>>,
    subprotocol: Arc<Mutex<Option<String>>>,
}

/// Accept a connection, echoing back whatever sub-protocol was offered.
/// tungstenite fails the client handshake if the offer goes unanswered.
async fn accept_ws(stream: tokio::net::TcpStream) -> WsStream {
    tokio_tungstenite::accept_hdr_async(stream, |req: &Request, mut resp: Response| {
        if let Some(protocol) = req.headers().get("sec-websocket-protocol") {
            let _ = resp
                .headers_mut()
                .insert("sec-websocket-protocol", protocol.clone());
        }
        Ok(resp)
    })
    .await
    .unwrap()
}

/// Accept connections one at a time and answer the codex handshake from a
/// script: initialize → userAgent, newConversation → c1,
/// addConversationListener → s1, sendUserMessage → ack + agent_message +
/// raw item + task_complete.
async fn scripted_server(listener: TcpListener, log: ServerLog) {
    loop {
        let (stream, _) = listener.accept().await.unwrap();

        let offered = log.subprotocol.clone();
        let callback = move |req: &Request, mut resp: Response| {
            if let Some(protocol) = req.headers().get("sec-websocket-protocol") {
                *offered.lock().unwrap() = Some(protocol.to_str().unwrap().to_string());
                let _ = resp
                    .headers_mut()
                    .insert("sec-websocket-protocol", protocol.clone());
            }
            Ok(resp)
        };
        let ws = tokio_tungstenite::accept_hdr_async(stream, callback)
            .await
            .unwrap();
        let (tx, rx) = ws.split();
        serve_connection(tx, rx, &log).await;
    }
}

async fn serve_connection(
    mut tx: WsSink,
    mut rx: futures::stream::SplitStream<WsStream>,
    log: &ServerLog,
) {
    while let Some(Ok(msg)) = rx.next().await {
        let Message::Text(text) = msg else { continue };
        let frame: Value = serde_json::from_str(&text).unwrap();
        log.requests.lock().unwrap().push(frame.clone());

        let method = frame["method"].as_str().unwrap_or_default().to_string();
        let Some(id) = frame.get("id").and_then(Value::as_u64) else {
            continue; // notifications get no reply
        };
        match method.as_str() {
            "initialize" => {
                send_json(
                    &mut tx,
                    json!({"id": id, "result": {"userAgent": "codex app-server 9.9-test"}}),
                )
                .await;
            }
            "newConversation" => {
                send_json(&mut tx, json!({"id": id, "result": {"conversationId": "c1"}})).await;
            }
            "addConversationListener" => {
                send_json(&mut tx, json!({"id": id, "result": {"subscriptionId": "s1"}})).await;
            }
            "sendUserMessage" => {
                send_json(&mut tx, json!({"id": id, "result": {}})).await;
                send_json(
                    &mut tx,
                    json!({"method": "codex/event/raw_response_item",
                        "params": {"msg": {"item": {"content": [{"text": "thinking"}]}}}}),
                )
                .await;
                send_json(
                    &mut tx,
                    json!({"method": "codex/event/agent_message",
                        "params": {"msg": {"message": "hello from codex"}}}),
                )
                .await;
                send_json(
                    &mut tx,
                    json!({"method": "codex/event/task_complete",
                        "params": {"conversationId": "c1"}}),
                )
                .await;
            }
            other => panic!("unexpected method: {other}"),
        }
    }
}

async fn next_ui(ui: &mut mpsc::Receiver<UiEvent>) -> UiEvent {
    timeout(TIMEOUT, ui.recv())
        .await
        .expect("timed out waiting for ui event")
        .expect("ui channel closed")
}

/// Drain UI events until `pred` matches, returning everything seen.
async fn ui_until(
    ui: &mut mpsc::Receiver<UiEvent>,
    pred: impl Fn(&UiEvent) -> bool,
) -> Vec<UiEvent> {
    let mut seen = Vec::new();
    loop {
        let event = next_ui(ui).await;
        let done = pred(&event);
        seen.push(event);
        if done {
            return seen;
        }
    }
}

#[tokio::test]
async fn full_conversation_round_trip() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let log = ServerLog::default();
    let server = tokio::spawn(scripted_server(listener, log.clone()));

    let (client, mut ui) = runtime::spawn();
    client.send(Intent::Connect(format!("ws://{addr}"))).await;

    // Handshake runs unattended up to an active conversation.
    let seen = ui_until(&mut ui, |e| matches!(e, UiEvent::ComposerEnabled(true))).await;
    assert!(seen.contains(&UiEvent::Phase(Phase::Connecting)));
    assert!(seen.contains(&UiEvent::Phase(Phase::AwaitingInit)));
    assert!(seen.contains(&UiEvent::Phase(Phase::Ready)));
    assert!(seen.contains(&UiEvent::Phase(Phase::ConversationActive)));
    assert!(seen.contains(&UiEvent::Status("Conversation c1".into())));

    // One exchange: our entry, the agent's reply, composition unlocked again.
    client.send(Intent::SubmitText("hi".into())).await;
    let seen = ui_until(&mut ui, |e| matches!(e, UiEvent::ComposerEnabled(true))).await;
    let chats: Vec<_> = seen
        .iter()
        .filter_map(|e| match e {
            UiEvent::Chat(entry) => Some(entry.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(chats.len(), 2);
    assert_eq!(chats[0].speaker, Speaker::User);
    assert_eq!(chats[0].text, "hi");
    assert_eq!(chats[1].speaker, Speaker::Assistant);
    assert_eq!(chats[1].text, "hello from codex");
    assert!(seen.contains(&UiEvent::Trace("thinking".into())));

    client.send(Intent::Disconnect).await;
    // Teardown ends with composition locked.
    let seen = ui_until(&mut ui, |e| matches!(e, UiEvent::ComposerEnabled(false))).await;
    assert!(seen.contains(&UiEvent::Phase(Phase::Disconnected)));
    assert!(seen.contains(&UiEvent::Status("Disconnected".into())));
    server.abort();

    // The wire carried exactly the expected sequence with gap-free ids.
    let requests = log.requests.lock().unwrap().clone();
    let methods: Vec<_> = requests
        .iter()
        .map(|f| f["method"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(
        methods,
        vec![
            "initialize",
            "initialized",
            "newConversation",
            "addConversationListener",
            "sendUserMessage",
        ]
    );
    let ids: Vec<_> = requests
        .iter()
        .filter_map(|f| f.get("id").and_then(Value::as_u64))
        .collect();
    assert_eq!(ids, vec![0, 1, 2, 3]);
    assert!(requests[1].get("id").is_none(), "initialized is a notification");
    assert_eq!(
        requests[4]["params"]["items"][0]["data"]["text"], "hi",
        "user text travels as a text item"
    );
    assert_eq!(
        log.subprotocol.lock().unwrap().as_deref(),
        Some("codex.app-server.v1")
    );
}

#[tokio::test]
async fn connect_failure_lands_back_in_disconnected() {
    let (client, mut ui) = runtime::spawn();
    // Nothing listens on port 1.
    client.send(Intent::Connect("ws://127.0.0.1:1".into())).await;

    let seen = ui_until(&mut ui, |e| matches!(e, UiEvent::Status(s) if s == "Disconnected")).await;
    assert!(seen.contains(&UiEvent::Phase(Phase::Connecting)));
    assert!(seen.contains(&UiEvent::Phase(Phase::Disconnected)));
    assert!(
        seen.iter()
            .any(|e| matches!(e, UiEvent::Trace(line) if line.starts_with("transport error"))),
        "the failure is surfaced as a diagnostic"
    );
    assert_eq!(next_ui(&mut ui).await, UiEvent::ComposerEnabled(false));
}

#[tokio::test]
async fn server_drop_resets_the_session() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    // A server that answers the handshake, then vanishes.
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = accept_ws(stream).await;
        let (mut tx, mut rx) = ws.split();
        while let Some(Ok(msg)) = rx.next().await {
            let Message::Text(text) = msg else { continue };
            let frame: Value = serde_json::from_str(&text).unwrap();
            if frame["method"] == "initialize" {
                let reply = json!({"id": frame["id"], "result": {"userAgent": "flaky"}});
                tx.send(Message::Text(reply.to_string().into())).await.unwrap();
            }
            if frame["method"] == "newConversation" {
                return; // drop the connection mid-handshake
            }
        }
    });

    let (client, mut ui) = runtime::spawn();
    client.send(Intent::Connect(format!("ws://{addr}"))).await;

    let seen = ui_until(&mut ui, |e| matches!(e, UiEvent::Status(s) if s == "Disconnected")).await;
    assert!(seen.contains(&UiEvent::Phase(Phase::Ready)));
    assert!(seen.contains(&UiEvent::Phase(Phase::Disconnected)));
    assert_eq!(next_ui(&mut ui).await, UiEvent::ComposerEnabled(false));
    server.await.unwrap();

    // Submitting now is rejected without any connection.
    client.send(Intent::SubmitText("anyone there?".into())).await;
    let event = next_ui(&mut ui).await;
    assert!(matches!(event, UiEvent::Trace(line) if line.contains("start a conversation")));
}

#[tokio::test]
async fn reconnect_establishes_a_fresh_conversation() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let log = ServerLog::default();
    let server = tokio::spawn(scripted_server(listener, log.clone()));

    let (client, mut ui) = runtime::spawn();
    client.send(Intent::Connect(format!("ws://{addr}"))).await;
    let _ = ui_until(&mut ui, |e| matches!(e, UiEvent::ComposerEnabled(true))).await;

    // Reconnect while the first connection is still open. The torn-down
    // connection's trailing events must not disturb the new one.
    client.send(Intent::Connect(format!("ws://{addr}"))).await;
    let seen = ui_until(&mut ui, |e| matches!(e, UiEvent::ComposerEnabled(true))).await;
    assert!(seen.contains(&UiEvent::TranscriptCleared));
    assert!(seen.contains(&UiEvent::Phase(Phase::ConversationActive)));
    assert!(seen.contains(&UiEvent::Status("Conversation c1".into())));

    // The second connection is live end to end.
    client.send(Intent::SubmitText("still here?".into())).await;
    let seen = ui_until(&mut ui, |e| matches!(e, UiEvent::ComposerEnabled(true))).await;
    assert!(
        seen.iter().any(|e| matches!(
            e,
            UiEvent::Chat(entry) if entry.speaker == Speaker::Assistant
        )),
        "the agent replied over the new connection"
    );
    server.abort();

    // Both connections ran the full handshake, ids restarting at 0.
    let requests = log.requests.lock().unwrap().clone();
    let initializes: Vec<_> = requests
        .iter()
        .filter(|f| f["method"] == "initialize")
        .collect();
    assert_eq!(initializes.len(), 2);
    assert!(initializes.iter().all(|f| f["id"] == 0));
}
