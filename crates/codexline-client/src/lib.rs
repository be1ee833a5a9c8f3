//! # codexline-client
//!
//! WebSocket transport adapter and the single-threaded client runtime for
//! the codex app-server protocol.
//!
//! [`transport::Transport`] owns one tokio-tungstenite connection and
//! surfaces it as a stream of [`transport::TransportEvent`]s. The
//! [`runtime`] module spawns the event loop that feeds user intents and
//! transport events through the pure [`codexline_core::session::Session`]
//! and executes the commands it emits.

#![deny(unsafe_code)]

pub mod runtime;
pub mod transport;
