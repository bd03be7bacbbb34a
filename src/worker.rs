//! A worker: one OS thread consuming one queue with one message handler.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::config::{DEFAULT_POLLING_INTERVAL, DEFAULT_STOP_TIMEOUT};
use crate::error::{panic_message, MqError};
use crate::handler::MessageHandler;
use crate::retry::backoff_delay;
use crate::stats::{MessageHandlerStats, StatsHandle};
use crate::status::{AtomicStatus, WorkerStatus};
use crate::transport::{MessageFactory, MessageQueueClient};

/// How long dispose waits before nudging a worker thread a second time.
const SOFT_JOIN_TIMEOUT: Duration = Duration::from_millis(500);
const JOIN_POLL: Duration = Duration::from_millis(10);

/// A message handler shared by a worker and its replacements.
pub type SharedHandler = Arc<Mutex<Box<dyn MessageHandler>>>;

/// Called on the worker thread when its run loop fails.
pub type WorkerErrorHandler = Arc<dyn Fn(&Worker, &MqError) + Send + Sync>;

static NEXT_WORKER_ID: AtomicUsize = AtomicUsize::new(1);

/// Joins `handle` with a deadline: a soft wait, one `nudge`, then a hard wait
/// up to `timeout`. A thread that outlives that is detached with a warning.
/// Never joins the calling thread. Returns whether the thread was joined.
pub(crate) fn join_with_deadline(handle: JoinHandle<()>, timeout: Duration, name: &str, nudge: &dyn Fn()) -> bool {
    if handle.thread().id() == thread::current().id() {
        return false;
    }

    let started = Instant::now();
    let mut nudged = false;
    while !handle.is_finished() {
        let elapsed = started.elapsed();
        if !nudged && elapsed >= SOFT_JOIN_TIMEOUT {
            nudge();
            nudged = true;
        }
        if elapsed >= timeout.max(SOFT_JOIN_TIMEOUT) {
            warn!(target: "mq::worker", "{} did not stop cleanly within {:?}", name, timeout);
            return false;
        }
        thread::sleep(JOIN_POLL);
    }
    if let Err(payload) = handle.join() {
        error!(target: "mq::worker", "{} panicked: {}", name, panic_message(payload.as_ref()));
    }
    true
}

pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Configuration for a `Worker`.
///
/// Use the `WorkerConfig::builder()` method to construct this struct. The
/// same config builds the original worker and any replacement.
#[derive(Clone)]
pub struct WorkerConfig {
    /// The name of the queue to consume messages from.
    pub queue_name: String,
    /// The handler that processes every message from the queue.
    pub handler: SharedHandler,
    /// Source of transport clients.
    pub factory: Arc<dyn MessageFactory>,
    /// Invoked with the worker and the error when the run loop fails.
    pub error_handler: Option<WorkerErrorHandler>,
    /// Reconnect after transport interruptions instead of stopping.
    pub auto_reconnect: bool,
    /// Sleep between polling passes that processed nothing.
    pub polling_interval: Duration,
    /// How long dispose waits for the worker thread to exit.
    pub stop_timeout: Duration,
}

impl WorkerConfig {
    /// Creates a new `WorkerConfigBuilder` to start building the worker configuration.
    ///
    /// # Arguments
    /// * `queue_name` - The name of the queue to consume from.
    /// * `handler` - The handler for messages on that queue.
    /// * `factory` - The transport the worker creates its client from.
    pub fn builder(
        queue_name: impl Into<String>,
        handler: Box<dyn MessageHandler>,
        factory: Arc<dyn MessageFactory>,
    ) -> WorkerConfigBuilder {
        WorkerConfigBuilder::new(queue_name.into(), Arc::new(Mutex::new(handler)), factory)
    }
}

impl fmt::Debug for WorkerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerConfig")
            .field("queue_name", &self.queue_name)
            .field("auto_reconnect", &self.auto_reconnect)
            .field("polling_interval", &self.polling_interval)
            .field("stop_timeout", &self.stop_timeout)
            .field("error_handler", &self.error_handler.is_some())
            .finish_non_exhaustive()
    }
}

/// A builder for creating `WorkerConfig` instances.
pub struct WorkerConfigBuilder {
    queue_name: String,
    handler: SharedHandler,
    factory: Arc<dyn MessageFactory>,
    error_handler: Option<WorkerErrorHandler>,
    auto_reconnect: Option<bool>,
    polling_interval: Option<Duration>,
    stop_timeout: Option<Duration>,
}

impl WorkerConfigBuilder {
    fn new(queue_name: String, handler: SharedHandler, factory: Arc<dyn MessageFactory>) -> Self {
        Self {
            queue_name,
            handler,
            factory,
            error_handler: None,
            auto_reconnect: None,
            polling_interval: None,
            stop_timeout: None,
        }
    }

    /// Sets the callback invoked when the run loop fails.
    pub fn error_handler(mut self, handler: WorkerErrorHandler) -> Self {
        self.error_handler = Some(handler);
        self
    }

    /// Defaults to true.
    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = Some(enabled);
        self
    }

    /// Defaults to 1000ms.
    pub fn polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = Some(interval);
        self
    }

    /// Defaults to 3s.
    pub fn stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = Some(timeout);
        self
    }

    /// Builds the final `WorkerConfig`, applying defaults for any unset options.
    pub fn build(self) -> WorkerConfig {
        WorkerConfig {
            queue_name: self.queue_name,
            handler: self.handler,
            factory: self.factory,
            error_handler: self.error_handler,
            auto_reconnect: self.auto_reconnect.unwrap_or(true),
            polling_interval: self.polling_interval.unwrap_or(DEFAULT_POLLING_INTERVAL),
            stop_timeout: self.stop_timeout.unwrap_or(DEFAULT_STOP_TIMEOUT),
        }
    }
}

/// A latch with a timed wait that resets once observed.
#[derive(Default)]
struct Signal {
    raised: Mutex<bool>,
    cond: Condvar,
}

impl Signal {
    fn notify(&self) {
        *lock(&self.raised) = true;
        self.cond.notify_all();
    }

    fn reset(&self) {
        *lock(&self.raised) = false;
    }

    /// Waits until raised or `timeout` elapses. Returns whether it was raised.
    fn wait(&self, timeout: Duration) -> bool {
        let raised = lock(&self.raised);
        let (mut raised, _) = self
            .cond
            .wait_timeout_while(raised, timeout, |raised| !*raised)
            .unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *raised, false)
    }
}

struct WorkerInner {
    id: usize,
    config: WorkerConfig,
    status: AtomicStatus,
    // Bumped on every start; a run loop exits once its generation is stale.
    generation: AtomicU64,
    wake: Signal,
    delivered: Signal,
    client: Mutex<Option<Arc<dyn MessageQueueClient>>>,
    bg_thread: Mutex<Option<JoinHandle<()>>>,
    times_started: AtomicU64,
    stats: StatsHandle,
}

/// A cloneable handle onto one worker thread bound to one queue.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

impl Worker {
    pub fn new(config: WorkerConfig) -> Self {
        let stats = lock(&config.handler).stats_handle();
        Self {
            inner: Arc::new(WorkerInner {
                id: NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed),
                config,
                status: AtomicStatus::new(WorkerStatus::Stopped),
                generation: AtomicU64::new(0),
                wake: Signal::default(),
                delivered: Signal::default(),
                client: Mutex::new(None),
                bg_thread: Mutex::new(None),
                times_started: AtomicU64::new(0),
                stats,
            }),
        }
    }

    /// A fresh, stopped worker built from the same config.
    pub fn replacement(&self) -> Worker {
        Worker::new(self.inner.config.clone())
    }

    pub fn id(&self) -> usize {
        self.inner.id
    }

    pub fn queue_name(&self) -> &str {
        &self.inner.config.queue_name
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.inner.config
    }

    pub fn status(&self) -> WorkerStatus {
        self.inner.status.load()
    }

    pub fn times_started(&self) -> u64 {
        self.inner.times_started.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> MessageHandlerStats {
        self.inner.stats.snapshot()
    }

    /// True when both handles refer to the same worker.
    pub fn ptr_eq(&self, other: &Worker) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Starts the worker thread. A no-op if already started, an error if
    /// disposed. A worker still stopping is joined first.
    pub fn start(&self) -> Result<(), MqError> {
        match self.status() {
            WorkerStatus::Disposed => return Err(MqError::Disposed),
            WorkerStatus::Started | WorkerStatus::Starting => return Ok(()),
            WorkerStatus::Stopping => {
                debug!(target: "mq::worker", "Worker {} still stopping, joining before start", self.id());
                self.join_bg_thread();
                if self.inner.status.transition(WorkerStatus::Stopping, WorkerStatus::Stopped) {
                    self.inner.generation.fetch_add(1, Ordering::SeqCst);
                }
            }
            WorkerStatus::Stopped => {}
        }

        if !self.inner.status.transition(WorkerStatus::Stopped, WorkerStatus::Starting) {
            return match self.status() {
                WorkerStatus::Disposed => Err(MqError::Disposed),
                _ => Ok(()),
            };
        }

        // Reap a thread that already exited after its last stop.
        self.join_bg_thread();
        self.inner.wake.reset();
        self.inner.delivered.reset();
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.times_started.fetch_add(1, Ordering::SeqCst);

        let worker = self.clone();
        let spawned = thread::Builder::new()
            .name(format!("mq-worker:{}", self.queue_name()))
            .spawn(move || worker.run(generation));
        match spawned {
            Ok(handle) => {
                *lock(&self.inner.bg_thread) = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.inner.status.transition(WorkerStatus::Starting, WorkerStatus::Stopped);
                Err(MqError::Transport(format!("failed to spawn worker thread: {e}")))
            }
        }
    }

    /// Signals the worker to stop and closes its client to interrupt any
    /// blocked receive. Does not wait for the thread to exit.
    pub fn stop(&self) {
        let stopping = self.inner.status.transition(WorkerStatus::Started, WorkerStatus::Stopping)
            || self.inner.status.transition(WorkerStatus::Starting, WorkerStatus::Stopping);
        if !stopping {
            return;
        }
        info!(target: "mq::worker", "Stopping worker {} on '{}'", self.id(), self.queue_name());
        self.interrupt();
    }

    /// Abandons any running thread and starts a fresh one.
    pub fn force_restart(&self) -> Result<(), MqError> {
        if self.status() == WorkerStatus::Disposed {
            return Err(MqError::Disposed);
        }
        info!(target: "mq::worker", "Force restarting worker {} on '{}'", self.id(), self.queue_name());
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.interrupt();
        if let Some(handle) = lock(&self.inner.bg_thread).take() {
            if handle.is_finished() {
                let _ = handle.join();
            }
        }
        // The abandoned thread may still move the status, so retry until the
        // worker is Stopped or someone disposes it.
        loop {
            match self.status() {
                WorkerStatus::Disposed => return Err(MqError::Disposed),
                WorkerStatus::Stopped => break,
                current => {
                    if self.inner.status.transition(current, WorkerStatus::Stopped) {
                        break;
                    }
                }
            }
        }
        self.start()
    }

    /// Stops the worker permanently and waits, up to the stop timeout, for
    /// its thread to exit. Safe to call more than once.
    pub fn dispose(&self) {
        self.stop();
        if self.inner.status.swap(WorkerStatus::Disposed) == WorkerStatus::Disposed {
            return;
        }
        self.interrupt();
        self.join_bg_thread();
        if let Some(client) = lock(&self.inner.client).take() {
            client.close();
        }
        debug!(target: "mq::worker", "Worker {} on '{}' disposed", self.id(), self.queue_name());
    }

    fn interrupt(&self) {
        self.inner.wake.notify();
        self.inner.delivered.notify();
        if let Some(client) = lock(&self.inner.client).as_ref() {
            client.close();
        }
    }

    fn join_bg_thread(&self) {
        let Some(handle) = lock(&self.inner.bg_thread).take() else {
            return;
        };
        let name = format!("Worker {} on '{}'", self.id(), self.queue_name());
        join_with_deadline(handle, self.inner.config.stop_timeout, &name, &|| self.interrupt());
    }

    fn is_running(&self, generation: u64) -> bool {
        self.inner.status.load() == WorkerStatus::Started
            && self.inner.generation.load(Ordering::SeqCst) == generation
    }

    fn run(&self, generation: u64) {
        if !self.inner.status.transition(WorkerStatus::Starting, WorkerStatus::Started) {
            self.finish(generation);
            return;
        }
        info!(target: "mq::worker", "Worker {} started on '{}'", self.id(), self.queue_name());

        let result = catch_unwind(AssertUnwindSafe(|| self.consume(generation)))
            .unwrap_or_else(|payload| Err(MqError::from_panic(payload)));

        if let Err(e) = result {
            error!(
                target: "mq::worker",
                "Worker {} on '{}' failed: {}", self.id(), self.queue_name(), e
            );
            self.stop();
            if let Some(handler) = &self.inner.config.error_handler {
                let handler = Arc::clone(handler);
                if let Err(payload) = catch_unwind(AssertUnwindSafe(|| handler(self, &e))) {
                    error!(
                        target: "mq::worker",
                        "Worker error handler panicked: {}",
                        panic_message(payload.as_ref())
                    );
                }
            }
        }
        self.finish(generation);
    }

    fn finish(&self, generation: u64) {
        if self.inner.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        if let Some(client) = lock(&self.inner.client).take() {
            client.close();
        }
        let stopped = self.inner.status.transition(WorkerStatus::Stopping, WorkerStatus::Stopped)
            || self.inner.status.transition(WorkerStatus::Started, WorkerStatus::Stopped);
        if stopped {
            info!(target: "mq::worker", "Worker {} on '{}' stopped", self.id(), self.queue_name());
        }
    }

    fn consume(&self, generation: u64) -> Result<(), MqError> {
        loop {
            let result = if self.inner.config.factory.use_polling() {
                self.run_polling(generation)
            } else {
                self.run_subscription(generation)
            };
            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_interruption() => {
                    if !self.is_running(generation) {
                        return Ok(());
                    }
                    if !self.inner.config.auto_reconnect {
                        warn!(
                            target: "mq::worker",
                            "Worker {} on '{}' interrupted and auto-reconnect is off: {}",
                            self.id(), self.queue_name(), e
                        );
                        return Ok(());
                    }
                    warn!(
                        target: "mq::worker",
                        "Worker {} on '{}' interrupted, reconnecting: {}", self.id(), self.queue_name(), e
                    );
                    if let Some(client) = lock(&self.inner.client).take() {
                        client.close();
                    }
                    self.wait_for_reconnect(generation)?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Retries client creation with capped exponential backoff until it
    /// succeeds or the worker stops.
    fn wait_for_reconnect(&self, generation: u64) -> Result<(), MqError> {
        let mut attempt = 0;
        while self.is_running(generation) {
            self.inner.wake.wait(backoff_delay(attempt));
            if !self.is_running(generation) {
                break;
            }
            match self.client() {
                Ok(_) => {
                    info!(target: "mq::worker", "Worker {} reconnected", self.id());
                    return Ok(());
                }
                Err(e) if e.is_interruption() => {
                    warn!(
                        target: "mq::worker",
                        "Worker {} reconnect attempt {} failed: {}", self.id(), attempt + 1, e
                    );
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn client(&self) -> Result<Arc<dyn MessageQueueClient>, MqError> {
        let mut slot = lock(&self.inner.client);
        if let Some(client) = slot.as_ref() {
            if !client.is_closed() {
                return Ok(Arc::clone(client));
            }
        }
        let client = self.inner.config.factory.create_client()?;
        *slot = Some(Arc::clone(&client));
        Ok(client)
    }

    fn run_polling(&self, generation: u64) -> Result<(), MqError> {
        let client = self.client()?;
        let queue_name = self.queue_name();
        while self.is_running(generation) {
            let processed = lock(&self.inner.config.handler).process_queue(
                client.as_ref(),
                queue_name,
                &|| self.is_running(generation),
            )?;
            if client.is_closed() && self.is_running(generation) {
                return Err(MqError::Closed);
            }
            if processed == 0 {
                self.inner.wake.wait(self.inner.config.polling_interval);
            }
        }
        Ok(())
    }

    fn run_subscription(&self, generation: u64) -> Result<(), MqError> {
        let client = self.client()?;
        let handler = Arc::clone(&self.inner.config.handler);
        let callback_client = Arc::clone(&client);
        let worker: Weak<WorkerInner> = Arc::downgrade(&self.inner);

        client.subscribe(
            self.queue_name(),
            Box::new(move |message| {
                let Some(inner) = worker.upgrade() else {
                    return;
                };
                match lock(&handler).process_message(callback_client.as_ref(), message) {
                    Ok(()) => {}
                    Err(e) if e.is_interruption() => {
                        warn!(target: "mq::worker", "Subscription on '{}' interrupted: {}", inner.config.queue_name, e);
                        callback_client.close();
                    }
                    Err(e) => {
                        error!(target: "mq::worker", "Error in subscription on '{}': {}", inner.config.queue_name, e);
                    }
                }
                inner.delivered.notify();
            }),
        )?;

        while self.is_running(generation) && !client.is_closed() {
            self.inner.delivered.wait(self.inner.config.polling_interval);
        }
        if self.is_running(generation) {
            return Err(MqError::Interrupted("subscription ended".to_string()));
        }
        Ok(())
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id())
            .field("queue_name", &self.queue_name())
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerError;
    use crate::factory::MessageHandlerFactory;
    use crate::message::{Message, MessageBody};
    use crate::naming::QueueNaming;
    use crate::transport::memory::InMemoryTransport;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::AtomicBool;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Job {
        n: u32,
    }
    impl MessageBody for Job {}

    const IN_QUEUE: &str = "mq:Job.inq";

    fn job_handler() -> Box<dyn MessageHandler> {
        Box::new(MessageHandlerFactory::<Job>::new(QueueNaming::new(), |_| Ok(None)).create_handler())
    }

    fn wait_until(timeout: Duration, check: impl Fn() -> bool) -> bool {
        crate::retry::retry_until(timeout, check)
    }

    fn publish_jobs(transport: &InMemoryTransport, count: u32) {
        let client = transport.create_client().unwrap();
        for n in 0..count {
            client
                .publish(IN_QUEUE, &Message::new(Job { n }).to_wire().unwrap())
                .unwrap();
        }
    }

    /// Delegates to an in-memory transport but fails the first `failures`
    /// client creations with the given error.
    struct FlakyFactory {
        inner: InMemoryTransport,
        failures: AtomicUsize,
        interrupt: bool,
    }

    impl MessageFactory for FlakyFactory {
        fn create_client(&self) -> Result<Arc<dyn MessageQueueClient>, MqError> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(if self.interrupt {
                    MqError::Interrupted("connection refused".into())
                } else {
                    MqError::Transport("broken".into())
                });
            }
            self.inner.create_client()
        }

        fn declare_queues(&self, queue_names: &crate::naming::QueueNames) -> Result<(), MqError> {
            self.inner.declare_queues(queue_names)
        }

        fn use_polling(&self) -> bool {
            self.inner.use_polling()
        }

        fn dispose(&self) {
            self.inner.dispose()
        }
    }

    #[test]
    fn test_worker_config_builder_defaults() {
        let transport = Arc::new(InMemoryTransport::new());
        let config = WorkerConfig::builder(IN_QUEUE, job_handler(), transport).build();

        assert_eq!(config.queue_name, IN_QUEUE);
        assert!(config.auto_reconnect);
        assert_eq!(config.polling_interval, Duration::from_millis(1000));
        assert_eq!(config.stop_timeout, Duration::from_secs(3));
        assert!(config.error_handler.is_none());
    }

    #[test]
    fn test_worker_config_builder_custom_values() {
        let transport = Arc::new(InMemoryTransport::new());
        let config = WorkerConfig::builder(IN_QUEUE, job_handler(), transport)
            .auto_reconnect(false)
            .polling_interval(Duration::from_millis(20))
            .stop_timeout(Duration::from_secs(1))
            .error_handler(Arc::new(|_, _| {}))
            .build();

        assert!(!config.auto_reconnect);
        assert_eq!(config.polling_interval, Duration::from_millis(20));
        assert_eq!(config.stop_timeout, Duration::from_secs(1));
        assert!(config.error_handler.is_some());
    }

    #[test]
    fn test_polling_worker_processes_and_stops() {
        let transport = InMemoryTransport::new();
        publish_jobs(&transport, 3);
        let config = WorkerConfig::builder(IN_QUEUE, job_handler(), Arc::new(transport.clone()))
            .polling_interval(Duration::from_millis(20))
            .build();
        let worker = Worker::new(config);

        worker.start().unwrap();
        assert!(wait_until(Duration::from_secs(5), || worker.stats().total_messages_processed == 3));
        assert_eq!(worker.status(), WorkerStatus::Started);

        worker.stop();
        assert!(wait_until(Duration::from_secs(5), || worker.status() == WorkerStatus::Stopped));
        worker.stop();
        assert_eq!(worker.status(), WorkerStatus::Stopped);

        publish_jobs(&transport, 1);
        worker.start().unwrap();
        assert!(wait_until(Duration::from_secs(5), || worker.stats().total_messages_processed == 4));
        assert_eq!(worker.times_started(), 2);
        worker.dispose();
        assert_eq!(transport.counters().acked, 4);
    }

    #[test]
    fn test_subscription_worker_processes() {
        let transport = InMemoryTransport::new().with_subscriptions();
        let config = WorkerConfig::builder(IN_QUEUE, job_handler(), Arc::new(transport.clone()))
            .polling_interval(Duration::from_millis(20))
            .build();
        let worker = Worker::new(config);
        worker.start().unwrap();

        publish_jobs(&transport, 2);
        assert!(wait_until(Duration::from_secs(5), || worker.stats().total_messages_processed == 2));

        worker.dispose();
        assert_eq!(worker.status(), WorkerStatus::Disposed);
        let counters = transport.counters();
        assert_eq!(counters.acked, counters.delivered);
    }

    #[test]
    fn test_disposed_worker_refuses_start() {
        let worker = Worker::new(WorkerConfig::builder(IN_QUEUE, job_handler(), Arc::new(InMemoryTransport::new())).build());
        worker.dispose();
        worker.dispose();
        assert!(matches!(worker.start(), Err(MqError::Disposed)));
        assert!(matches!(worker.force_restart(), Err(MqError::Disposed)));
    }

    #[test]
    fn test_run_loop_failure_reports_to_error_handler() {
        let factory = Arc::new(FlakyFactory {
            inner: InMemoryTransport::new(),
            failures: AtomicUsize::new(1),
            interrupt: false,
        });
        let reported = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&reported);
        let config = WorkerConfig::builder(IN_QUEUE, job_handler(), factory)
            .polling_interval(Duration::from_millis(20))
            .error_handler(Arc::new(move |worker: &Worker, err: &MqError| {
                *sink.lock().unwrap() = Some((worker.queue_name().to_string(), err.to_string()));
            }))
            .build();
        let worker = Worker::new(config);
        worker.start().unwrap();

        assert!(wait_until(Duration::from_secs(5), || reported.lock().unwrap().is_some()));
        let (queue, message) = reported.lock().unwrap().clone().unwrap();
        assert_eq!(queue, IN_QUEUE);
        assert!(message.contains("broken"));
        assert!(wait_until(Duration::from_secs(5), || worker.status() == WorkerStatus::Stopped));

        let replacement = worker.replacement();
        assert!(!replacement.ptr_eq(&worker));
        assert_eq!(replacement.queue_name(), IN_QUEUE);
        assert_eq!(replacement.status(), WorkerStatus::Stopped);
        replacement.start().unwrap();
        assert!(wait_until(Duration::from_secs(5), || replacement.status() == WorkerStatus::Started));
        replacement.dispose();
    }

    #[test]
    fn test_interruption_reconnects() {
        let factory = Arc::new(FlakyFactory {
            inner: InMemoryTransport::new(),
            failures: AtomicUsize::new(2),
            interrupt: true,
        });
        publish_jobs(&factory.inner, 1);
        let errored = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&errored);
        let config = WorkerConfig::builder(IN_QUEUE, job_handler(), factory.clone())
            .polling_interval(Duration::from_millis(20))
            .error_handler(Arc::new(move |_: &Worker, _: &MqError| flag.store(true, Ordering::SeqCst)))
            .build();
        let worker = Worker::new(config);
        worker.start().unwrap();

        assert!(wait_until(Duration::from_secs(5), || worker.stats().total_messages_processed == 1));
        assert!(!errored.load(Ordering::SeqCst));
        worker.dispose();
    }

    #[test]
    fn test_interruption_without_auto_reconnect_stops() {
        let factory = Arc::new(FlakyFactory {
            inner: InMemoryTransport::new(),
            failures: AtomicUsize::new(1),
            interrupt: true,
        });
        let config = WorkerConfig::builder(IN_QUEUE, job_handler(), factory)
            .auto_reconnect(false)
            .build();
        let worker = Worker::new(config);
        worker.start().unwrap();

        assert!(wait_until(Duration::from_secs(5), || worker.status() == WorkerStatus::Stopped));
        worker.dispose();
    }

    #[test]
    fn test_force_restart_replaces_thread() {
        let transport = InMemoryTransport::new();
        let config = WorkerConfig::builder(IN_QUEUE, job_handler(), Arc::new(transport.clone()))
            .polling_interval(Duration::from_millis(20))
            .build();
        let worker = Worker::new(config);
        worker.start().unwrap();
        assert!(wait_until(Duration::from_secs(5), || worker.status() == WorkerStatus::Started));

        worker.force_restart().unwrap();
        assert!(wait_until(Duration::from_secs(5), || worker.status() == WorkerStatus::Started));
        assert_eq!(worker.times_started(), 2);

        publish_jobs(&transport, 1);
        assert!(wait_until(Duration::from_secs(5), || worker.stats().total_messages_processed == 1));
        worker.dispose();
    }

    #[test]
    fn test_force_restart_from_transitional_states() {
        let transport = InMemoryTransport::new();
        let config = WorkerConfig::builder(IN_QUEUE, job_handler(), Arc::new(transport.clone()))
            .polling_interval(Duration::from_millis(20))
            .build();
        let worker = Worker::new(config);

        for status in [WorkerStatus::Stopping, WorkerStatus::Starting] {
            assert!(worker.inner.status.transition(worker.status(), status));
            worker.force_restart().unwrap();
            assert!(wait_until(Duration::from_secs(5), || worker.status() == WorkerStatus::Started));
        }
        assert_eq!(worker.times_started(), 2);

        worker.dispose();
        assert!(matches!(worker.force_restart(), Err(MqError::Disposed)));
    }

    #[test]
    fn test_handler_failures_do_not_stop_worker() {
        let transport = InMemoryTransport::new();
        publish_jobs(&transport, 1);
        let handler = Box::new(
            MessageHandlerFactory::<Job>::new(QueueNaming::new(), |_| Err(HandlerError::unretryable("nope")))
                .create_handler(),
        );
        let config = WorkerConfig::builder(IN_QUEUE, handler, Arc::new(transport.clone()))
            .polling_interval(Duration::from_millis(20))
            .build();
        let worker = Worker::new(config);
        worker.start().unwrap();

        assert!(wait_until(Duration::from_secs(5), || transport.queue_len("mq:Job.dlq") == 1));
        assert_eq!(worker.status(), WorkerStatus::Started);
        worker.dispose();
    }
}
