//! Slotted worker pool.
//!
//! A slot owns a fixed set of worker tasks. Each worker has a capacity-1
//! inbox and a run-state word:
//!
//! ```text
//!   0      free, index is on the free-list
//!   > 0    running since this timestamp (ns from slot creation)
//!   -1     finished, waiting for the sweeper
//! ```
//!
//! Admission pops a free index and CAS'es `0 -> now`. A worker that finishes
//! only flips itself to `-1`; the per-slot sweeper walks a batch of workers
//! per tick, CAS'es `-1 -> 0` and pushes the index back on the free-list.
//!
//! Handlers are synchronous and may block, so a worker runs each evaluation
//! on the blocking thread pool and only waits for it. A blocked handler holds
//! its own worker and a pool thread, never a runtime thread.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::dispatcher::Dispatcher;
use crate::error::{EchowireError, Result};
use crate::protocol::Stream;

const FREE: i64 = 0;
const TO_SWEEP: i64 = -1;

/// Callback receiving every filled reply.
///
/// The worker stays busy until the returned future completes, so a slow
/// delivery pushes back on admission.
pub type ReplyFn = dyn Fn(&Stream) -> BoxFuture<'static, ()> + Send + Sync + 'static;

/// Sizing of one slot.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SlotConfig {
    pub workers: usize,
    pub sweep_batch: usize,
    pub sweep_interval: Duration,
}

struct WorkerHandle {
    state: Arc<AtomicI64>,
    inbox: mpsc::Sender<Stream>,
}

/// One shard of the worker pool.
pub(crate) struct Slot {
    index: usize,
    workers: Vec<WorkerHandle>,
    free_tx: mpsc::Sender<usize>,
    free_rx: Mutex<mpsc::Receiver<usize>>,
    closed: watch::Sender<bool>,
    epoch: Instant,
}

impl Slot {
    /// Spawn the workers and the sweeper of slot `index`.
    ///
    /// Must be called inside a tokio runtime. Workers exit once the slot is
    /// dropped; the returned handle is the sweeper's.
    pub(crate) fn start(
        index: usize,
        config: SlotConfig,
        dispatcher: Arc<Dispatcher>,
        on_reply: Arc<ReplyFn>,
    ) -> (Arc<Self>, JoinHandle<()>) {
        let (free_tx, free_rx) = mpsc::channel(config.workers);
        let mut workers = Vec::with_capacity(config.workers);

        for id in 0..config.workers {
            let (inbox, rx) = mpsc::channel(1);
            let state = Arc::new(AtomicI64::new(FREE));
            tokio::spawn(worker_loop(
                state.clone(),
                rx,
                dispatcher.clone(),
                on_reply.clone(),
            ));
            workers.push(WorkerHandle { state, inbox });
            // capacity equals the worker count, so this cannot fail
            let _ = free_tx.try_send(id);
        }

        let (closed, _) = watch::channel(false);
        let slot = Arc::new(Self {
            index,
            workers,
            free_tx,
            free_rx: Mutex::new(free_rx),
            closed,
            epoch: Instant::now(),
        });

        let sweeper = tokio::spawn(sweeper_loop(
            Arc::downgrade(&slot),
            config.sweep_batch,
            config.sweep_interval,
        ));
        tracing::debug!("slot {} started with {} workers", index, config.workers);
        (slot, sweeper)
    }

    /// Hand `stream` to a free worker, waiting until one is available.
    pub(crate) async fn put(&self, stream: Stream) -> Result<()> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(EchowireError::ProcessorClosed);
        }

        let id = {
            let mut free = self.free_rx.lock().await;
            tokio::select! {
                id = free.recv() => id.ok_or(EchowireError::ProcessorClosed)?,
                _ = closed.wait_for(|c| *c) => return Err(EchowireError::ProcessorClosed),
            }
        };

        let worker = &self.workers[id];
        let now = (self.epoch.elapsed().as_nanos() as i64).max(1);
        if worker
            .state
            .compare_exchange(FREE, now, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::warn!("slot {} worker {} was listed free while busy", self.index, id);
            return Err(EchowireError::ProcessorClosed);
        }

        worker
            .inbox
            .send(stream)
            .await
            .map_err(|_| EchowireError::ProcessorClosed)
    }

    /// Return up to `batch` finished workers to the free-list, starting at
    /// `cursor`. Returns the cursor for the next pass.
    pub(crate) fn sweep(&self, cursor: usize, batch: usize) -> usize {
        let n = self.workers.len();
        let mut i = cursor % n;
        for _ in 0..batch.min(n) {
            let worker = &self.workers[i];
            if worker
                .state
                .compare_exchange(TO_SWEEP, FREE, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
                && self.free_tx.try_send(i).is_err()
            {
                worker.state.store(TO_SWEEP, Ordering::Release);
            }
            i = (i + 1) % n;
        }
        i
    }

    /// Refuse further admissions and wake pending ones.
    pub(crate) fn close(&self) {
        self.closed.send_replace(true);
    }

    pub(crate) fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Workers currently free.
    pub(crate) fn free_count(&self) -> usize {
        self.workers
            .iter()
            .filter(|w| w.state.load(Ordering::Acquire) == FREE)
            .count()
    }
}

async fn worker_loop(
    state: Arc<AtomicI64>,
    mut inbox: mpsc::Receiver<Stream>,
    dispatcher: Arc<Dispatcher>,
    on_reply: Arc<ReplyFn>,
) {
    let mut reply = Stream::new();
    let mut scratch = Vec::new();

    while let Some(inbound) = inbox.recv().await {
        let dispatcher = dispatcher.clone();
        let evaluated = tokio::task::spawn_blocking(move || {
            let filled = dispatcher.evaluate(inbound, reply, &mut scratch);
            (filled, scratch)
        })
        .await;

        match evaluated {
            Ok((filled, used)) => {
                on_reply(&filled).await;
                // the filled reply is reused as the next reply buffer
                reply = filled;
                scratch = used;
            }
            Err(e) => {
                tracing::error!("echo evaluation did not complete: {}", e);
                reply = Stream::new();
                scratch = Vec::new();
            }
        }
        state.store(TO_SWEEP, Ordering::Release);
    }
}

async fn sweeper_loop(slot: Weak<Slot>, batch: usize, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut cursor = 0;

    loop {
        ticker.tick().await;
        let Some(slot) = slot.upgrade() else {
            break;
        };
        cursor = slot.sweep(cursor, batch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Value;
    use crate::handler::{read_reply, Context, Registry};
    use futures::FutureExt;

    fn dispatcher() -> Arc<Dispatcher> {
        let mut registry = Registry::new(16);
        registry
            .add_echo("$", "double", true, |ctx: &mut Context, n: i64| ctx.ok(n * 2))
            .unwrap();
        registry
            .add_echo("$", "nap", true, |ctx: &mut Context, ms: u64| {
                std::thread::sleep(Duration::from_millis(ms));
                ctx.ok(ms)
            })
            .unwrap();
        Arc::new(Dispatcher::new(Arc::new(registry), 16))
    }

    fn request(path: &str, arg: impl FnOnce(&mut Stream)) -> Stream {
        let mut stream = Stream::new();
        stream.write_string(path).unwrap();
        stream.write_u64(0);
        stream.write_string("@").unwrap();
        arg(&mut stream);
        stream
    }

    fn double(n: i64) -> Stream {
        request("$:double", |s| s.write_i64(n))
    }

    fn config(workers: usize, sweep_interval: Duration) -> SlotConfig {
        SlotConfig {
            workers,
            sweep_batch: workers,
            sweep_interval,
        }
    }

    fn ignore_replies() -> Arc<ReplyFn> {
        Arc::new(|_: &Stream| futures::future::ready(()).boxed())
    }

    fn collect_replies() -> (Arc<ReplyFn>, mpsc::UnboundedReceiver<Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let on_reply: Arc<ReplyFn> = Arc::new(move |reply: &Stream| {
            let mut copy = reply.clone();
            let _ = tx.send(read_reply(&mut copy).unwrap().unwrap());
            futures::future::ready(()).boxed()
        });
        (on_reply, rx)
    }

    #[tokio::test]
    async fn test_workers_answer_and_get_swept() {
        let (on_reply, mut rx) = collect_replies();
        let (slot, _sweeper) = Slot::start(
            0,
            config(4, Duration::from_millis(1)),
            dispatcher(),
            on_reply,
        );

        let mut got = Vec::new();
        for n in 0..20 {
            slot.put(double(n)).await.unwrap();
        }
        for _ in 0..20 {
            got.push(rx.recv().await.unwrap());
        }
        got.sort_by_key(|v| v.as_i64());
        let expected: Vec<Value> = (0..20).map(|n| Value::Int(n * 2)).collect();
        assert_eq!(got, expected);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(slot.free_count(), slot.worker_count());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blocking_handlers_do_not_hold_runtime_threads() {
        let (on_reply, mut rx) = collect_replies();
        let (slot, _sweeper) = Slot::start(
            0,
            config(8, Duration::from_millis(1)),
            dispatcher(),
            on_reply,
        );

        let started = Instant::now();
        for _ in 0..8 {
            slot.put(request("$:nap", |s| s.write_u64(200))).await.unwrap();
        }

        // an unrelated timer still fires on time while every handler sleeps
        let timer = Instant::now();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(timer.elapsed() < Duration::from_millis(150));

        for _ in 0..8 {
            assert_eq!(rx.recv().await.unwrap(), Value::Uint(200));
        }
        // eight 200ms sleeps on two threads would take at least 800ms in turn
        assert!(started.elapsed() < Duration::from_millis(700));
    }

    #[tokio::test]
    async fn test_worker_waits_for_delivery() {
        let (release, released) = watch::channel(false);
        let on_reply: Arc<ReplyFn> = Arc::new(move |_: &Stream| {
            let mut released = released.clone();
            async move {
                let _ = released.wait_for(|r| *r).await;
            }
            .boxed()
        });
        let (slot, _sweeper) = Slot::start(
            0,
            config(1, Duration::from_millis(1)),
            dispatcher(),
            on_reply,
        );

        slot.put(double(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(slot.free_count(), 0);

        release.send_replace(true);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(slot.free_count(), 1);
    }

    #[tokio::test]
    async fn test_sweep_only_touches_finished_workers() {
        let (slot, sweeper) = Slot::start(
            0,
            config(3, Duration::from_secs(3600)),
            dispatcher(),
            ignore_replies(),
        );
        sweeper.abort();

        slot.workers[1].state.store(TO_SWEEP, Ordering::Release);
        slot.workers[2].state.store(12345, Ordering::Release);
        let cursor = slot.sweep(0, 2);
        assert_eq!(cursor, 2);
        assert_eq!(slot.workers[1].state.load(Ordering::Acquire), FREE);
        assert_eq!(slot.workers[2].state.load(Ordering::Acquire), 12345);
    }

    #[tokio::test]
    async fn test_put_after_close_fails() {
        let (slot, _sweeper) = Slot::start(
            0,
            config(1, Duration::from_millis(5)),
            dispatcher(),
            ignore_replies(),
        );
        slot.close();
        assert!(matches!(
            slot.put(double(1)).await,
            Err(EchowireError::ProcessorClosed)
        ));
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_admission() {
        let (slot, sweeper) = Slot::start(
            0,
            config(1, Duration::from_secs(3600)),
            dispatcher(),
            ignore_replies(),
        );
        sweeper.abort();

        // the only worker is taken and never swept back
        slot.put(double(1)).await.unwrap();

        let waiting = {
            let slot = slot.clone();
            tokio::spawn(async move { slot.put(double(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        slot.close();
        assert!(matches!(
            waiting.await.unwrap(),
            Err(EchowireError::ProcessorClosed)
        ));
    }
}
