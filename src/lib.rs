//! # echowire
//!
//! WebSocket RPC framework built on a self-describing streaming binary codec.
//!
//! ## Architecture
//!
//! - **Protocol**: segmented [`Stream`](protocol::Stream) of pooled 512-byte
//!   frames behind a 16-byte header
//! - **Codec**: one-opcode-per-value encoding with position-indexed
//!   array and map views
//! - **Handler**: a tree of services whose leaves, the echoes, are typed
//!   Rust functions
//! - **Processor**: a slotted worker pool that evaluates requests and
//!   keeps per-echo latency counters
//! - **Transport**: one WebSocket message per request or reply
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use echowire::config::Config;
//! use echowire::handler::{Context, Registry};
//! use echowire::transport::Server;
//!
//! #[tokio::main]
//! async fn main() -> echowire::Result<()> {
//!     let config = Config::default();
//!     echowire::logging::init(config.log_level);
//!
//!     let mut registry = Registry::from_config(&config);
//!     let user = registry.add_service("$", "user")?;
//!     registry.add_echo(&user, "sayHello", true, |ctx: &mut Context, name: String| {
//!         ctx.ok(format!("hello {}", name))
//!     })?;
//!
//!     let server = Arc::new(Server::new(registry, config)?);
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:8080").await?;
//!     server.serve(listener).await
//! }
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod handler;
pub mod logging;
pub mod processor;
pub mod protocol;
pub mod transport;

pub use codec::{Encode, RpcArray, RpcMap, Value};
pub use config::Config;
pub use error::{EchowireError, MountError, MountErrorKind, Result, RpcError, WireError};
pub use handler::{Context, Registry, Return};
pub use processor::Processor;
pub use protocol::{Header, Stream};
pub use transport::{Client, Server};
