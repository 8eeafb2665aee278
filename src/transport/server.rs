//! WebSocket server front end.
//!
//! One binary WebSocket message carries exactly one request. The server
//! stamps the connection id into header bytes 4..8, hands the stream to the
//! [`Processor`], and routes each reply back by that id.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;

use super::outbox::{Outbox, OutboxConfig};
use crate::config::Config;
use crate::error::{EchowireError, Result};
use crate::handler::Registry;
use crate::processor::{EchoStats, Processor};
use crate::protocol::Stream;

/// Outbound side of one live connection.
#[derive(Clone)]
struct Connection {
    outbox: Outbox,
    /// Signalled when a reply could not be queued in time.
    shutdown: Arc<Notify>,
}

/// Live connections keyed by connection id.
#[derive(Default)]
struct ConnectionTable {
    connections: RwLock<HashMap<u32, Connection>>,
}

impl ConnectionTable {
    fn insert(&self, id: u32, connection: Connection) {
        self.connections.write().insert(id, connection);
    }

    fn remove(&self, id: u32) -> Option<Connection> {
        self.connections.write().remove(&id)
    }

    fn len(&self) -> usize {
        self.connections.read().len()
    }

    /// Queue a reply on the connection named by its header.
    ///
    /// The returned future waits for room in the outbox. A reply that cannot
    /// be queued within the send timeout closes its connection, so a reply is
    /// either delivered or the caller sees the connection drop.
    fn route(&self, reply: &Stream) -> BoxFuture<'static, ()> {
        if reply.is_body_empty() {
            return futures::future::ready(()).boxed();
        }
        let id = reply.header().client_conn_id();
        let Some(connection) = self.connections.read().get(&id).cloned() else {
            tracing::debug!("dropping reply for closed connection {}", id);
            return futures::future::ready(()).boxed();
        };
        let bytes = reply.to_bytes();

        async move {
            if let Err(e) = connection.outbox.send(bytes).await {
                tracing::warn!("closing connection {}: reply not queued: {}", id, e);
                connection.shutdown.notify_one();
            }
        }
        .boxed()
    }
}

/// WebSocket RPC server.
pub struct Server {
    processor: Processor,
    connections: Arc<ConnectionTable>,
    config: Config,
    next_conn_id: AtomicU32,
}

impl Server {
    /// Freeze `registry` and start the processor.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(registry: Registry, config: Config) -> Result<Self> {
        let connections = Arc::new(ConnectionTable::default());
        let table = connections.clone();
        let processor = Processor::start(Arc::new(registry), &config, move |reply: &Stream| {
            table.route(reply)
        })?;

        Ok(Self {
            processor,
            connections,
            config,
            next_conn_id: AtomicU32::new(1),
        })
    }

    pub fn processor(&self) -> &Processor {
        &self.processor
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Number of open connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Per-echo counters.
    pub fn stats(&self) -> Vec<EchoStats> {
        self.processor.stats()
    }

    /// Accept connections until the listener fails.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        tracing::info!("listening on {}", listener.local_addr()?);
        loop {
            let (socket, peer) = listener.accept().await?;
            if let Err(e) = socket.set_nodelay(true) {
                tracing::debug!("set_nodelay failed for {}: {}", peer, e);
            }
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.serve_connection(socket).await {
                    log_connection_error(peer, &e);
                }
            });
        }
    }

    /// Run the WebSocket handshake on `io` and serve it until it closes.
    pub async fn serve_connection<S>(&self, io: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(self.config.read_limit);
        ws_config.max_frame_size = Some(self.config.read_limit);

        let ws = tokio_tungstenite::accept_async_with_config(io, Some(ws_config)).await?;
        let (sink, mut source) = ws.split();

        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let (outbox, flush_task) = Outbox::spawn(
            sink,
            OutboxConfig {
                credits: self.config.reply_channel_capacity,
                send_timeout: self.config.reply_send_timeout(),
            },
        );
        let shutdown = Arc::new(Notify::new());
        self.connections.insert(
            id,
            Connection {
                outbox,
                shutdown: shutdown.clone(),
            },
        );
        tracing::debug!("connection {} opened", id);

        let read_timeout = self.config.read_timeout();
        let result = loop {
            let next = tokio::select! {
                _ = shutdown.notified() => break Err(EchowireError::BackpressureTimeout),
                next = tokio::time::timeout(read_timeout, source.next()) => next,
            };
            let message = match next {
                Err(_) => break Err(EchowireError::Timeout),
                Ok(None) => break Ok(()),
                Ok(Some(Err(e))) => break Err(e.into()),
                Ok(Some(Ok(message))) => message,
            };

            match message {
                Message::Binary(data) => {
                    let mut stream = match Stream::from_frame(&data) {
                        Ok(stream) => stream,
                        Err(e) => break Err(e.into()),
                    };
                    let mut header = stream.header();
                    header.set_client_conn_id(id);
                    stream.set_header(&header);
                    if let Err(e) = self.processor.put_stream(stream).await {
                        break Err(e);
                    }
                }
                Message::Close(_) => break Ok(()),
                Message::Text(_) => {
                    tracing::warn!("connection {} sent a text frame", id);
                    break Err(EchowireError::ConnectionClosed);
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        };

        drop(self.connections.remove(id));
        if matches!(result, Err(EchowireError::BackpressureTimeout)) {
            // the peer stopped reading; the sink may never drain
            flush_task.abort();
        }
        // dropping the last outbox lets the flush task send a close frame
        match flush_task.await {
            Ok(Err(e)) => tracing::debug!("connection {} flush ended: {}", id, e),
            Err(e) if e.is_cancelled() => tracing::debug!("connection {} flush aborted", id),
            Err(e) => tracing::debug!("connection {} flush task failed: {}", id, e),
            Ok(Ok(())) => {}
        }
        tracing::debug!("connection {} closed", id);
        result
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("processor", &self.processor)
            .field("connections", &self.connections.len())
            .finish()
    }
}

fn log_connection_error(peer: SocketAddr, e: &EchowireError) {
    match e {
        EchowireError::Timeout => tracing::debug!("{} read deadline expired", peer),
        EchowireError::ConnectionClosed => tracing::debug!("{} closed: {}", peer, e),
        _ => tracing::warn!("{} connection error: {}", peer, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::read_reply;
    use crate::protocol::Header;
    use std::time::Duration;
    use tokio::io::duplex;
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::protocol::Role;
    use tokio_tungstenite::WebSocketStream;

    fn reply_for(conn_id: u32, callback_id: u32, write: impl FnOnce(&mut Stream)) -> Stream {
        let mut reply = Stream::new();
        let mut header = Header::new();
        header.set_client_conn_id(conn_id);
        header.set_client_callback_id(callback_id);
        reply.set_header(&header);
        write(&mut reply);
        reply
    }

    fn connection(outbox: Outbox) -> Connection {
        Connection {
            outbox,
            shutdown: Arc::new(Notify::new()),
        }
    }

    #[tokio::test]
    async fn test_route_skips_empty_and_unknown() {
        let table = ConnectionTable::default();
        table.route(&Stream::new()).await;

        let reply = reply_for(9, 1, |s| s.write_bool(true));
        table.route(&reply).await;
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn test_route_by_conn_id() {
        let (a, b) = duplex(4096);
        let server = WebSocketStream::from_raw_socket(a, Role::Server, None).await;
        let mut client = WebSocketStream::from_raw_socket(b, Role::Client, None).await;
        let (sink, _source) = server.split();
        let (outbox, _task) = Outbox::spawn(sink, OutboxConfig::default());

        let table = ConnectionTable::default();
        table.insert(3, connection(outbox));

        let reply = reply_for(3, 8, |s| {
            s.write_bool(true);
            s.write_i64(5);
        });
        table.route(&reply).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            if let Some(Ok(message)) = client.next().await {
                let _ = tx.send(message.into_data());
            }
        });
        let data = rx.recv().await.unwrap();
        let mut got = Stream::from_frame(&data).unwrap();
        assert_eq!(got.header().client_callback_id(), 8);
        assert_eq!(read_reply(&mut got).unwrap().unwrap().as_i64(), Some(5));
    }

    #[tokio::test]
    async fn test_full_outbox_closes_connection() {
        // nobody reads the other end, so the first reply never flushes
        let (a, _b) = duplex(64);
        let server = WebSocketStream::from_raw_socket(a, Role::Server, None).await;
        let (sink, _source) = server.split();
        let config = OutboxConfig {
            credits: 1,
            send_timeout: Duration::from_millis(20),
        };
        let (outbox, _task) = Outbox::spawn(sink, config);

        let table = ConnectionTable::default();
        let conn = connection(outbox.clone());
        let shutdown = conn.shutdown.clone();
        table.insert(4, conn);

        let big = reply_for(4, 1, |s| s.write(&vec![7u8; 4096][..]).unwrap());
        table.route(&big).await;
        assert!(outbox.is_full());

        // the second reply waits for a credit, then gives up on the peer
        let started = std::time::Instant::now();
        table.route(&reply_for(4, 2, |s| s.write_bool(true))).await;
        assert!(started.elapsed() >= Duration::from_millis(20));

        tokio::time::timeout(Duration::from_secs(1), shutdown.notified())
            .await
            .unwrap();
    }
}
