//! # codexline-core
//!
//! Wire-format types and the protocol session state machine for the codex
//! app-server WebSocket protocol.
//!
//! This crate is pure: no sockets, no async, no global state. The
//! [`session::Session`] consumes [`session::Input`]s (user intents and
//! transport events) and returns [`session::Output`]s (frames to send,
//! transport commands, UI-observable events). The client crate owns the
//! actual WebSocket and pumps events through the session.

#![deny(unsafe_code)]

pub mod session;
pub mod wire;
