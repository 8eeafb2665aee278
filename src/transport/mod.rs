//! Transport module - WebSocket server and client.
//!
//! Provides:
//! - [`Server`] - accepts connections and feeds requests to the processor
//! - [`Client`] - issues calls and awaits their replies
//! - [`Outbox`] - the batching outbound queue both sides write through

mod client;
mod outbox;
mod server;

pub use client::{Client, DEFAULT_CALL_TIMEOUT, DEFAULT_ORIGIN};
pub use outbox::{Outbox, OutboxConfig, DEFAULT_OUTBOX_CREDITS, DEFAULT_SEND_TIMEOUT};
pub use server::Server;
