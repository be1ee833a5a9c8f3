//! # codexline
//!
//! Terminal client for the codex app-server: connects over WebSocket,
//! renders the conversation to stdout, and reads prompts from stdin.
//! All protocol logic lives in `codexline-core`; this binary only renders
//! state and forwards user intents.

#![deny(unsafe_code)]

mod logging;

use anyhow::Result;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};

use codexline_client::runtime::{self, ClientHandle, Intent};
use codexline_core::session::{Speaker, UiEvent};

/// Terminal client for the codex app-server.
#[derive(Parser, Debug)]
#[command(name = "codexline", about = "Terminal client for the codex app-server")]
struct Cli {
    /// WebSocket endpoint, e.g. ws://localhost:4500
    url: String,

    /// Minimum log level (trace|debug|info|warn|error).
    #[arg(long, default_value = "warn")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_subscriber(&cli.log_level);

    let (client, mut ui) = runtime::spawn();
    client.send(Intent::Connect(cli.url.clone())).await;

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    // Mirrors the session's composition state so typed-ahead prompts get
    // visible feedback instead of silently going nowhere.
    let mut composing = false;
    loop {
        tokio::select! {
            event = ui.recv() => match event {
                Some(event) => {
                    if let UiEvent::ComposerEnabled(enabled) = &event {
                        composing = *enabled;
                    }
                    render(&event);
                }
                None => break,
            },
            line = stdin.next_line() => {
                if !handle_line(&client, line?, composing).await {
                    break;
                }
            }
        }
    }

    client.send(Intent::Shutdown).await;
    Ok(())
}

/// Dispatch one stdin line. Returns `false` when the client should exit.
async fn handle_line(client: &ClientHandle, line: Option<String>, composing: bool) -> bool {
    let Some(line) = line else {
        // stdin closed
        client.send(Intent::Disconnect).await;
        return false;
    };
    let line = line.trim();
    match line {
        "" => true,
        "/quit" => {
            client.send(Intent::Disconnect).await;
            false
        }
        "/new" => {
            client.send(Intent::StartConversation).await;
            true
        }
        text if !composing => {
            println!("* busy, wait for the current response (text not sent: {text})");
            true
        }
        text => {
            client.send(Intent::SubmitText(text.to_string())).await;
            true
        }
    }
}

fn render(event: &UiEvent) {
    match event {
        UiEvent::Status(text) => println!("* {text}"),
        UiEvent::Chat(entry) => {
            let who = match entry.speaker {
                Speaker::User => "you",
                Speaker::Assistant => "codex",
            };
            println!("{who} > {}", entry.text);
        }
        UiEvent::ComposerEnabled(enabled) => {
            if *enabled {
                println!("* ready for input");
            }
        }
        // Status lines already carry the human-readable phase.
        UiEvent::Phase(_) | UiEvent::TranscriptCleared => {}
        UiEvent::Trace(line) => tracing::debug!("{line}"),
    }
}
