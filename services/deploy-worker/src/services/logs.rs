use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::warn;
use worker_core::models::LogSource;

use super::api::ApiClient;

/// Delivery seam for batched log lines. Injected so tests can capture
/// batches in memory.
#[async_trait]
pub trait LogDispatcher: Send + Sync {
    async fn dispatch(&self, deployment_id: &str, source: LogSource, messages: Vec<String>);
}

/// Production dispatcher: ships batches to the control plane. Logs are
/// best-effort, so failures are warnings and never retried.
pub struct ApiLogDispatcher {
    api: ApiClient,
}

impl ApiLogDispatcher {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }
}

#[async_trait]
impl LogDispatcher for ApiLogDispatcher {
    async fn dispatch(&self, deployment_id: &str, source: LogSource, messages: Vec<String>) {
        let count = messages.len();
        if let Err(e) = self.api.save_logs(deployment_id, source, &messages).await {
            warn!(
                deployment_id = %deployment_id,
                source = %source,
                count,
                error = %e,
                "Failed to ship log batch"
            );
        }
    }
}

#[derive(Clone, Debug)]
pub struct SinkConfig {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub source: LogSource,
    pub prefix: String,
}

impl SinkConfig {
    /// Per-source batching defaults: build output is chatty but tolerant of
    /// 2s latency, runtime logs flush faster, system events batch small.
    pub fn for_source(source: LogSource) -> Self {
        match source {
            LogSource::Build => Self {
                batch_size: 20,
                flush_interval: Duration::from_secs(2),
                source,
                prefix: String::new(),
            },
            LogSource::Runtime => Self {
                batch_size: 50,
                flush_interval: Duration::from_secs(1),
                source,
                prefix: String::new(),
            },
            LogSource::System => Self {
                batch_size: 10,
                flush_interval: Duration::from_secs(2),
                source,
                prefix: String::new(),
            },
        }
    }
}

struct SinkState {
    buffer: Vec<String>,
    last_flush: Instant,
}

struct SinkInner {
    config: SinkConfig,
    state: Mutex<SinkState>,
    tx: Mutex<Option<mpsc::UnboundedSender<Vec<String>>>>,
}

impl SinkInner {
    fn append(&self, line: &str) {
        let line = if self.config.prefix.is_empty() {
            line.to_string()
        } else {
            format!("{}{}", self.config.prefix, line)
        };

        let mut state = self.state.lock().unwrap();
        state.buffer.push(line);
        if state.buffer.len() >= self.config.batch_size {
            self.flush_locked(&mut state);
        }
    }

    fn flush_now(&self) {
        let mut state = self.state.lock().unwrap();
        self.flush_locked(&mut state);
    }

    fn flush_if_stale(&self) {
        let mut state = self.state.lock().unwrap();
        if !state.buffer.is_empty() && state.last_flush.elapsed() >= self.config.flush_interval {
            self.flush_locked(&mut state);
        }
    }

    fn flush_locked(&self, state: &mut SinkState) {
        if state.buffer.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut state.buffer);
        state.last_flush = Instant::now();
        if let Some(tx) = self.tx.lock().unwrap().as_ref() {
            let _ = tx.send(batch);
        }
    }
}

/// Per-deployment, per-source log sink. Lines accumulate in an ordered
/// buffer and leave through a single dispatch task, which keeps delivery
/// ordered across flushes.
pub struct LogSink {
    inner: Arc<SinkInner>,
    dispatch_task: Option<JoinHandle<()>>,
    flush_task: Option<JoinHandle<()>>,
}

impl LogSink {
    fn new(deployment_id: &str, dispatcher: Arc<dyn LogDispatcher>, config: SinkConfig) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<String>>();

        let inner = Arc::new(SinkInner {
            config: config.clone(),
            state: Mutex::new(SinkState {
                buffer: Vec::with_capacity(config.batch_size),
                last_flush: Instant::now(),
            }),
            tx: Mutex::new(Some(tx)),
        });

        let dispatch_task = {
            let deployment_id = deployment_id.to_string();
            let source = config.source;
            tokio::spawn(async move {
                while let Some(batch) = rx.recv().await {
                    dispatcher.dispatch(&deployment_id, source, batch).await;
                }
            })
        };

        let flush_task = {
            let inner = Arc::clone(&inner);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(inner.config.flush_interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                // The first tick fires immediately and is a no-op on an
                // empty buffer.
                loop {
                    ticker.tick().await;
                    inner.flush_if_stale();
                }
            })
        };

        Self {
            inner,
            dispatch_task: Some(dispatch_task),
            flush_task: Some(flush_task),
        }
    }

    /// Line-oriented write for subprocess output. Chunks split on both `\n`
    /// and `\r`; empty lines are dropped.
    pub fn write(&self, chunk: &str) {
        for line in chunk.split(['\n', '\r']) {
            if line.is_empty() {
                continue;
            }
            self.inner.append(line);
        }
    }

    /// Appends a single message verbatim (empty lines allowed, for
    /// banner spacing).
    pub fn log(&self, message: impl AsRef<str>) {
        self.inner.append(message.as_ref());
    }

    pub fn flush(&self) {
        self.inner.flush_now();
    }

    /// Stops the auto-flush loop, performs the final flush, and waits for
    /// every pending batch to be dispatched.
    pub async fn close(mut self) {
        if let Some(flush_task) = self.flush_task.take() {
            flush_task.abort();
        }
        self.inner.flush_now();
        drop(self.inner.tx.lock().unwrap().take());
        if let Some(dispatch_task) = self.dispatch_task.take() {
            let _ = dispatch_task.await;
        }
    }
}

impl Drop for LogSink {
    fn drop(&mut self) {
        if let Some(task) = self.flush_task.take() {
            task.abort();
        }
        if let Some(task) = self.dispatch_task.take() {
            task.abort();
        }
    }
}

/// Creates sinks bound to one dispatcher.
#[derive(Clone)]
pub struct LogSinkFactory {
    dispatcher: Arc<dyn LogDispatcher>,
}

impl LogSinkFactory {
    pub fn new(dispatcher: Arc<dyn LogDispatcher>) -> Self {
        Self { dispatcher }
    }

    pub fn build_sink(&self, deployment_id: &str) -> LogSink {
        LogSink::new(
            deployment_id,
            Arc::clone(&self.dispatcher),
            SinkConfig::for_source(LogSource::Build),
        )
    }

    pub fn system_sink(&self, deployment_id: &str) -> LogSink {
        LogSink::new(
            deployment_id,
            Arc::clone(&self.dispatcher),
            SinkConfig::for_source(LogSource::System),
        )
    }

    pub fn prefixed_sink(&self, deployment_id: &str, prefix: &str, source: LogSource) -> LogSink {
        let config = SinkConfig {
            prefix: prefix.to_string(),
            ..SinkConfig::for_source(source)
        };
        LogSink::new(deployment_id, Arc::clone(&self.dispatcher), config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct MemoryDispatcher {
        batches: Mutex<Vec<(LogSource, Vec<String>)>>,
    }

    impl MemoryDispatcher {
        fn lines(&self) -> Vec<String> {
            self.batches
                .lock()
                .unwrap()
                .iter()
                .flat_map(|(_, batch)| batch.clone())
                .collect()
        }

        fn batch_sizes(&self) -> Vec<usize> {
            self.batches
                .lock()
                .unwrap()
                .iter()
                .map(|(_, batch)| batch.len())
                .collect()
        }
    }

    #[async_trait]
    impl LogDispatcher for MemoryDispatcher {
        async fn dispatch(&self, _deployment_id: &str, source: LogSource, messages: Vec<String>) {
            self.batches.lock().unwrap().push((source, messages));
        }
    }

    fn factory() -> (LogSinkFactory, Arc<MemoryDispatcher>) {
        let dispatcher = Arc::new(MemoryDispatcher::default());
        (
            LogSinkFactory::new(dispatcher.clone() as Arc<dyn LogDispatcher>),
            dispatcher,
        )
    }

    #[tokio::test]
    async fn batching_preserves_content_and_order() {
        let (factory, dispatcher) = factory();
        let sink = factory.build_sink("d1");

        let expected: Vec<String> = (0..45).map(|i| format!("line-{i}")).collect();
        for line in &expected {
            sink.log(line);
        }
        sink.close().await;

        assert_eq!(dispatcher.lines(), expected);
        for size in dispatcher.batch_sizes() {
            assert!(size <= 21, "batch too large: {size}");
        }
        // 45 lines with batch size 20 arrive as at least three batches.
        assert!(dispatcher.batch_sizes().len() >= 3);
    }

    #[tokio::test]
    async fn write_splits_on_both_line_boundaries_and_drops_empties() {
        let (factory, dispatcher) = factory();
        let sink = factory.build_sink("d1");

        sink.write("alpha\r\nbeta\rgamma\n\n");
        sink.close().await;

        assert_eq!(dispatcher.lines(), vec!["alpha", "beta", "gamma"]);
    }

    #[tokio::test]
    async fn prefix_is_applied_to_every_line() {
        let (factory, dispatcher) = factory();
        let sink = factory.prefixed_sink("d1", "[build] ", LogSource::Build);

        sink.log("compiling");
        sink.write("linking\n");
        sink.close().await;

        assert_eq!(dispatcher.lines(), vec!["[build] compiling", "[build] linking"]);
    }

    #[tokio::test]
    async fn close_flushes_the_remainder() {
        let (factory, dispatcher) = factory();
        let sink = factory.system_sink("d1");

        sink.log("only line");
        sink.close().await;

        assert_eq!(dispatcher.lines(), vec!["only line"]);
    }

    #[tokio::test]
    async fn threshold_triggers_flush_before_close() {
        let (factory, dispatcher) = factory();
        let sink = factory.system_sink("d1"); // batch size 10

        for i in 0..10 {
            sink.log(format!("line-{i}"));
        }
        // Give the dispatch task a chance to drain the channel.
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(dispatcher.lines().len(), 10);
        sink.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn interval_flushes_a_stale_buffer() {
        let (factory, dispatcher) = factory();
        let sink = factory.build_sink("d1"); // 2s interval

        sink.log("stale line");
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(dispatcher.lines(), vec!["stale line"]);
        sink.close().await;
    }

    #[tokio::test]
    async fn runtime_source_travels_with_batches() {
        let (factory, dispatcher) = factory();
        let sink = factory.prefixed_sink("d1", "[5q8tk] ", LogSource::Runtime);

        sink.log("ready on :3000");
        sink.close().await;

        let batches = dispatcher.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].0, LogSource::Runtime);
    }
}
