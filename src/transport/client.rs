//! WebSocket RPC client.
//!
//! # Example
//!
//! ```ignore
//! use echowire::codec::Value;
//! use echowire::transport::Client;
//!
//! let client = Client::connect("ws://127.0.0.1:8080").await?;
//! let reply = client.call("$.user:sayHello", &[Value::from("world")]).await?;
//! assert_eq!(reply.as_str(), Some("hello world"));
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use super::outbox::{Outbox, OutboxConfig};
use crate::codec::Value;
use crate::error::{EchowireError, Result};
use crate::handler::read_reply;
use crate::protocol::{Header, Stream};

/// Default per-call timeout.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Default origin sent with every call.
pub const DEFAULT_ORIGIN: &str = "@";

type PendingCalls = Arc<Mutex<HashMap<u32, oneshot::Sender<Stream>>>>;

/// Client side of one WebSocket connection.
pub struct Client {
    outbox: Outbox,
    pending: PendingCalls,
    next_id: AtomicU32,
    origin: String,
    depth: u64,
    timeout: Duration,
    reader: JoinHandle<()>,
}

impl Client {
    /// Connect to `url` (`ws://host:port/...`).
    pub async fn connect(url: &str) -> Result<Self> {
        let (ws, _) = tokio_tungstenite::connect_async(url).await?;
        Ok(Self::from_websocket(ws))
    }

    /// Run the client handshake for `url` over an existing byte stream.
    pub async fn connect_with<S>(url: &str, io: S) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (ws, _) = tokio_tungstenite::client_async(url, io).await?;
        Ok(Self::from_websocket(ws))
    }

    /// Wrap an established WebSocket. Must be called inside a tokio runtime.
    pub fn from_websocket<S>(ws: WebSocketStream<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, source) = ws.split();
        let (outbox, _flush_task) = Outbox::spawn(sink, OutboxConfig::default());
        let pending = PendingCalls::default();
        let reader = tokio::spawn(reader_loop(source, pending.clone()));

        Self {
            outbox,
            pending,
            next_id: AtomicU32::new(1),
            origin: DEFAULT_ORIGIN.to_string(),
            depth: 0,
            timeout: DEFAULT_CALL_TIMEOUT,
            reader,
        }
    }

    /// Set the per-call timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the origin reported to the server.
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }

    /// Set the call depth sent with every request.
    pub fn with_depth(mut self, depth: u64) -> Self {
        self.depth = depth;
        self
    }

    /// Calls still waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        self.pending.lock().len()
    }

    /// Call the echo at `path` and wait for its reply.
    ///
    /// An error reply becomes [`EchowireError::Rpc`].
    pub async fn call(&self, path: &str, args: &[Value]) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = self.encode_request(id, path, args)?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        if let Err(e) = self.outbox.send(request.to_bytes()).await {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        let mut reply = match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(EchowireError::ConnectionClosed),
            Err(_) => {
                self.pending.lock().remove(&id);
                return Err(EchowireError::Timeout);
            }
        };

        read_reply(&mut reply)?.map_err(EchowireError::Rpc)
    }

    fn encode_request(&self, id: u32, path: &str, args: &[Value]) -> Result<Stream> {
        let mut stream = Stream::new();
        let mut header = Header::new();
        header.set_client_callback_id(id);
        stream.set_header(&header);

        stream.write_string(path)?;
        stream.write_u64(self.depth);
        stream.write_string(&self.origin)?;
        for arg in args {
            stream.write(arg)?;
        }
        Ok(stream)
    }

    /// Stop reading and fail every pending call.
    pub fn close(self) {
        self.reader.abort();
        self.pending.lock().clear();
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("origin", &self.origin)
            .field("depth", &self.depth)
            .field("timeout", &self.timeout)
            .field("pending", &self.pending_calls())
            .finish()
    }
}

async fn reader_loop<S>(mut source: S, pending: PendingCalls)
where
    S: futures::Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>
        + Unpin,
{
    while let Some(message) = source.next().await {
        let data = match message {
            Ok(Message::Binary(data)) => data,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!("client read failed: {}", e);
                break;
            }
        };

        let reply = match Stream::from_frame(&data) {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!("malformed reply frame: {}", e);
                continue;
            }
        };
        let id = reply.header().client_callback_id();
        match pending.lock().remove(&id) {
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => tracing::debug!("reply for unknown call {}", id),
        }
    }

    // dropping the senders fails every waiting call
    pending.lock().clear();
}
