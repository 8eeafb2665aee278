//! Processor - request dispatch over a slotted worker pool.
//!
//! ```text
//! put_stream ─► slots[rand % n] ─► free worker ─► Dispatcher::evaluate ─► on_reply
//! ```
//!
//! The registry is frozen into an `Arc` when the processor starts; echoes
//! cannot be mounted afterwards.

mod dispatcher;
mod indicator;
mod panic;
mod random;
mod slot;

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub use dispatcher::{Dispatcher, DATA_FORMAT_ERROR};
pub use indicator::{bucket_for, Indicator, IndicatorSnapshot, BUCKET_BOUNDS_MS, BUCKET_COUNT};
pub use random::{rand_u32, RandomRing, RING_SIZE};
pub use slot::ReplyFn;

use crate::config::Config;
use crate::error::{EchowireError, Result};
use crate::handler::Registry;
use crate::protocol::Stream;
use slot::{Slot, SlotConfig};

/// Counters of one echo, as reported by [`Processor::stats`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EchoStats {
    /// Full echo path.
    pub path: String,
    /// Counter snapshot.
    #[serde(flatten)]
    pub indicator: IndicatorSnapshot,
}

/// Worker pool bound to one registry.
pub struct Processor {
    dispatcher: Arc<Dispatcher>,
    slots: Vec<Arc<Slot>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Processor {
    /// Spawn the slots, their sweepers and the indicator ticker.
    ///
    /// Must be called inside a tokio runtime. `on_reply` is called by the
    /// worker that evaluated the request, once per request, and the worker
    /// is not released before the returned future completes.
    pub fn start<F, Fut>(registry: Arc<Registry>, config: &Config, on_reply: F) -> Result<Self>
    where
        F: Fn(&Stream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        config.validate()?;

        let dispatcher = Arc::new(Dispatcher::new(registry, config.max_call_depth));
        let on_reply: Arc<ReplyFn> = Arc::new(move |reply: &Stream| on_reply(reply).boxed());
        let slot_config = SlotConfig {
            workers: config.workers_per_slot,
            sweep_batch: config.gc_sweep_batch,
            sweep_interval: config.sweep_interval(),
        };

        let num_slots = config.resolved_num_slots();
        let mut slots = Vec::with_capacity(num_slots);
        let mut tasks = Vec::with_capacity(num_slots + 1);
        for index in 0..num_slots {
            let (slot, sweeper) =
                Slot::start(index, slot_config, dispatcher.clone(), on_reply.clone());
            slots.push(slot);
            tasks.push(sweeper);
        }
        tasks.push(tokio::spawn(indicator_ticker(
            dispatcher.registry().clone(),
            config.qps_interval(),
        )));

        tracing::info!(
            "processor started: {} slots x {} workers, {} echoes",
            num_slots,
            config.workers_per_slot,
            dispatcher.registry().echo_count()
        );

        Ok(Self {
            dispatcher,
            slots,
            tasks: Mutex::new(tasks),
        })
    }

    /// Admit one request stream.
    ///
    /// Waits while every worker of the chosen slot is busy.
    pub async fn put_stream(&self, stream: Stream) -> Result<()> {
        if self.slots.is_empty() {
            return Err(EchowireError::ProcessorClosed);
        }
        let index = rand_u32() as usize % self.slots.len();
        self.slots[index].put(stream).await
    }

    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        self.dispatcher.registry()
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Per-echo counters, sorted by path.
    pub fn stats(&self) -> Vec<EchoStats> {
        let mut stats: Vec<EchoStats> = self
            .registry()
            .echoes()
            .map(|echo| EchoStats {
                path: echo.path().to_string(),
                indicator: echo.indicator().snapshot(),
            })
            .collect();
        stats.sort_by(|a, b| a.path.cmp(&b.path));
        stats
    }

    /// [`stats`](Self::stats) rendered as JSON.
    pub fn stats_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.stats())?)
    }

    /// Refuse new streams and stop the background tasks.
    ///
    /// In-flight requests still complete. Idempotent.
    pub fn stop(&self) {
        for slot in &self.slots {
            slot.close();
        }
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        if !tasks.is_empty() {
            tracing::info!("processor stopped");
        }
        for task in tasks {
            task.abort();
        }
    }
}

impl Drop for Processor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor")
            .field("num_slots", &self.slots.len())
            .field("max_call_depth", &self.dispatcher.max_call_depth())
            .finish()
    }
}

async fn indicator_ticker(registry: Arc<Registry>, interval: std::time::Duration) {
    let epoch = Instant::now();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let now_ns = epoch.elapsed().as_nanos() as u64 + 1;
        for echo in registry.echoes() {
            echo.indicator().on_timer(now_ns);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{read_reply, Context};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn small_config() -> Config {
        Config::default()
            .with_num_slots(2)
            .with_workers_per_slot(4)
            .with_gc_sweep_batch(4)
            .with_sweep_interval(Duration::from_millis(1))
            .with_qps_interval(Duration::from_millis(10))
    }

    fn registry() -> Arc<Registry> {
        let mut registry = Registry::new(16);
        let math = registry.add_service("$", "math").unwrap();
        registry
            .add_echo(&math, "add", true, |ctx: &mut Context, a: i64, b: i64| ctx.ok(a + b))
            .unwrap();
        Arc::new(registry)
    }

    fn add_request(a: i64, b: i64) -> Stream {
        let mut stream = Stream::new();
        stream.write_string("$.math:add").unwrap();
        stream.write_u64(0);
        stream.write_string("test").unwrap();
        stream.write_i64(a);
        stream.write_i64(b);
        stream
    }

    #[tokio::test]
    async fn test_processor_round_trip_and_stats() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let processor = Processor::start(registry(), &small_config(), move |reply: &Stream| {
            let _ = tx.send(reply.clone());
            async {}
        })
        .unwrap();
        assert_eq!(processor.num_slots(), 2);

        for i in 0..32 {
            processor.put_stream(add_request(i, 1)).await.unwrap();
        }
        let mut sum = 0;
        for _ in 0..32 {
            let mut reply = rx.recv().await.unwrap();
            sum += read_reply(&mut reply).unwrap().unwrap().as_i64().unwrap();
        }
        assert_eq!(sum, (0..32).map(|i| i + 1).sum::<i64>());

        let stats = processor.stats();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].path, "$.math:add");
        assert_eq!(stats[0].indicator.total(), 32);

        let json = processor.stats_json().unwrap();
        assert!(json.contains("\"path\":\"$.math:add\""));
        assert!(json.contains("\"failed\":0"));
    }

    #[tokio::test]
    async fn test_stop_refuses_new_streams() {
        let processor =
            Processor::start(registry(), &small_config(), |_: &Stream| async {}).unwrap();
        processor.stop();
        processor.stop();
        assert!(matches!(
            processor.put_stream(add_request(1, 2)).await,
            Err(EchowireError::ProcessorClosed)
        ));
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let config = small_config().with_workers_per_slot(0);
        assert!(Processor::start(registry(), &config, |_: &Stream| async {}).is_err());
    }
}
