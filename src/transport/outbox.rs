//! Per-connection outbound queue.
//!
//! Replies are produced on worker tasks, but the WebSocket write half has a
//! single owner: a flush task fed through an mpsc channel.
//!
//! ```text
//! Worker 1 ─┐
//! Worker 2 ─┼─► Outbox ─► mpsc ─► flush task ─► WebSocket sink
//! Worker N ─┘
//! ```
//!
//! The flush task feeds every message already queued and flushes once per
//! batch. Queue space is metered by a semaphore: a sender takes one credit
//! per message and the flush task hands credits back after each flush.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{Sink, SinkExt};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::error::{EchowireError, Result};

/// Messages a connection may have queued but not yet flushed.
pub const DEFAULT_OUTBOX_CREDITS: usize = 1024;

/// How long [`Outbox::send`] waits for a credit.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Most messages fed to the sink between two flushes.
const FLUSH_BATCH: usize = 64;

/// Sizing of one outbox.
#[derive(Debug, Clone, Copy)]
pub struct OutboxConfig {
    /// Queue size and credit count.
    pub credits: usize,
    /// Wait limit for [`Outbox::send`].
    pub send_timeout: Duration,
}

impl OutboxConfig {
    pub fn with_credits(credits: usize) -> Self {
        Self {
            credits,
            ..Self::default()
        }
    }
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            credits: DEFAULT_OUTBOX_CREDITS,
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }
}

/// Sending side of a connection's outbound queue. Cheap to clone.
#[derive(Clone)]
pub struct Outbox {
    queue: mpsc::Sender<Bytes>,
    credits: Arc<Semaphore>,
    capacity: usize,
    send_timeout: Duration,
}

impl Outbox {
    /// Spawn the flush task over `sink`.
    ///
    /// The task sends a close frame and ends with `Ok(())` once every
    /// `Outbox` clone is dropped.
    pub fn spawn<S>(sink: S, config: OutboxConfig) -> (Self, JoinHandle<Result<()>>)
    where
        S: Sink<Message> + Unpin + Send + 'static,
        S::Error: Into<EchowireError>,
    {
        let (queue, rx) = mpsc::channel(config.credits);
        let credits = Arc::new(Semaphore::new(config.credits));
        let task = tokio::spawn(flush_loop(rx, sink, credits.clone()));

        let outbox = Self {
            queue,
            credits,
            capacity: config.credits,
            send_timeout: config.send_timeout,
        };
        (outbox, task)
    }

    /// Queue one binary message, waiting up to the send timeout for room.
    pub async fn send(&self, message: Bytes) -> Result<()> {
        let credit = tokio::time::timeout(self.send_timeout, self.credits.acquire())
            .await
            .map_err(|_| EchowireError::BackpressureTimeout)?
            .map_err(|_| EchowireError::ConnectionClosed)?;
        credit.forget();

        self.queue.send(message).await.map_err(|_| {
            self.credits.add_permits(1);
            EchowireError::ConnectionClosed
        })
    }

    /// Queue one binary message if there is room right now.
    pub fn try_send(&self, message: Bytes) -> Result<()> {
        let credit = self
            .credits
            .try_acquire()
            .map_err(|_| EchowireError::BackpressureTimeout)?;
        credit.forget();

        self.queue.try_send(message).map_err(|e| {
            self.credits.add_permits(1);
            match e {
                mpsc::error::TrySendError::Full(_) => EchowireError::BackpressureTimeout,
                mpsc::error::TrySendError::Closed(_) => EchowireError::ConnectionClosed,
            }
        })
    }

    /// Messages queued but not yet flushed.
    pub fn queued(&self) -> usize {
        self.capacity - self.credits.available_permits()
    }

    /// Whether the queue is out of credits.
    pub fn is_full(&self) -> bool {
        self.credits.available_permits() == 0
    }

    /// Whether the flush task has stopped.
    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }
}

impl std::fmt::Debug for Outbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outbox")
            .field("queued", &self.queued())
            .field("capacity", &self.capacity)
            .finish()
    }
}

async fn flush_loop<S>(
    mut rx: mpsc::Receiver<Bytes>,
    mut sink: S,
    credits: Arc<Semaphore>,
) -> Result<()>
where
    S: Sink<Message> + Unpin,
    S::Error: Into<EchowireError>,
{
    while let Some(first) = rx.recv().await {
        let mut fed = 0;
        let mut next = Some(first);
        while let Some(bytes) = next.take() {
            sink.feed(Message::binary(Vec::from(bytes)))
                .await
                .map_err(Into::into)?;
            fed += 1;
            if fed < FLUSH_BATCH {
                next = rx.try_recv().ok();
            }
        }

        sink.flush().await.map_err(Into::into)?;
        credits.add_permits(fed);
    }

    sink.close().await.map_err(Into::into)
}
