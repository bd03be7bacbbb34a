//! The message-queue server: handler registration, the worker pool and the
//! single controller thread that serializes stop and restart requests.

use std::collections::HashMap;
use std::fmt::{self, Write as _};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::client::MqClient;
use crate::config::ServerConfig;
use crate::error::{panic_message, HandlerError, MqError};
use crate::factory::{HandlerFactory, MessageHandlerFactory};
use crate::handler::{ExceptionFn, FailureContext, HandlerResult};
use crate::message::{Message, MessageBody};
use crate::naming::QueueNaming;
use crate::retry::{retry_until, RetryConfig};
use crate::stats::MessageHandlerStats;
use crate::status::{AtomicStatus, WorkerStatus};
use crate::transport::MessageFactory;
use crate::worker::{join_with_deadline, lock, Worker, WorkerConfig};

/// Per-registration options for `MqServer::register_handler_with`.
pub struct HandlerOptions<T: MessageBody> {
    exception_handler: Option<ExceptionFn<T>>,
    thread_count: usize,
    retry_count: Option<u32>,
}

impl<T: MessageBody> HandlerOptions<T> {
    pub fn new() -> Self {
        Self {
            exception_handler: None,
            thread_count: 1,
            retry_count: None,
        }
    }

    /// Replaces the default requeue-or-dead-letter failure handling.
    pub fn with_exception_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&FailureContext<'_>, &mut Message<T>, &HandlerError) -> Result<(), MqError> + Send + Sync + 'static,
    {
        self.exception_handler = Some(Arc::new(handler));
        self
    }

    /// Workers per inbound queue. Defaults to 1.
    pub fn with_thread_count(mut self, thread_count: usize) -> Self {
        self.thread_count = thread_count;
        self
    }

    /// Overrides the server-wide retry count for this type.
    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }
}

impl<T: MessageBody> Default for HandlerOptions<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Pending request for the controller thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    NoOp,
    Stop,
    Restart,
}

struct Registration {
    factory: Arc<dyn HandlerFactory>,
    thread_count: usize,
}

struct ServerInner {
    factory: Arc<dyn MessageFactory>,
    config: ServerConfig,
    status: AtomicStatus,
    registrations: Mutex<Vec<Registration>>,
    initialized: Mutex<bool>,
    workers: Mutex<Vec<Worker>>,
    queue_index: Mutex<HashMap<String, Vec<usize>>>,
    pending: Mutex<Operation>,
    pulse: Condvar,
    controller: Mutex<Option<JoinHandle<()>>>,
    bg_thread_count: AtomicUsize,
    times_started: AtomicU64,
    error_count: AtomicU64,
    continuous_error_count: AtomicU64,
    last_error_message: Mutex<Option<String>>,
}

/// Hosts typed message handlers on a pool of worker threads.
///
/// Register handlers, then `start()`. Each registered type gets
/// `thread_count` workers on its in queue and, unless priority queues are
/// disabled for it, as many on its priority queue. A worker whose run loop
/// fails is replaced in place by a fresh one built from the same config.
///
/// Dropping the server disposes it.
pub struct MqServer {
    inner: Arc<ServerInner>,
}

impl MqServer {
    /// A server with the default configuration, naming queues the way the
    /// factory does.
    pub fn new(factory: Arc<dyn MessageFactory>) -> Self {
        let mut config = ServerConfig::new();
        if let Some(naming) = factory.naming() {
            config = config.with_naming(naming.clone());
        }
        Self::from_parts(factory, config)
    }

    /// Fails with `MqError::Config` when the config is invalid or names
    /// queues differently from the factory.
    pub fn with_config(factory: Arc<dyn MessageFactory>, config: ServerConfig) -> Result<Self, MqError> {
        config.validate()?;
        if let Some(naming) = factory.naming() {
            if !naming.matches(&config.naming) {
                return Err(MqError::config(format!(
                    "server queue naming (prefix '{}') differs from the transport's (prefix '{}')",
                    config.naming.prefix(),
                    naming.prefix()
                )));
            }
        }
        Ok(Self::from_parts(factory, config))
    }

    fn from_parts(factory: Arc<dyn MessageFactory>, config: ServerConfig) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                factory,
                config,
                status: AtomicStatus::new(WorkerStatus::Stopped),
                registrations: Mutex::new(Vec::new()),
                initialized: Mutex::new(false),
                workers: Mutex::new(Vec::new()),
                queue_index: Mutex::new(HashMap::new()),
                pending: Mutex::new(Operation::NoOp),
                pulse: Condvar::new(),
                controller: Mutex::new(None),
                bg_thread_count: AtomicUsize::new(0),
                times_started: AtomicU64::new(0),
                error_count: AtomicU64::new(0),
                continuous_error_count: AtomicU64::new(0),
                last_error_message: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    pub fn naming(&self) -> &QueueNaming {
        &self.inner.config.naming
    }

    /// Registers `process_fn` for messages of type `T` with one worker per
    /// inbound queue.
    pub fn register_handler<T, F>(&self, process_fn: F) -> Result<(), MqError>
    where
        T: MessageBody,
        F: Fn(&Message<T>) -> HandlerResult + Send + Sync + 'static,
    {
        self.register_handler_with(process_fn, HandlerOptions::new())
    }

    /// Registers `process_fn` for messages of type `T`.
    ///
    /// Fails if `T` is already registered, if the server was already
    /// initialized, or if the options are invalid.
    pub fn register_handler_with<T, F>(&self, process_fn: F, options: HandlerOptions<T>) -> Result<(), MqError>
    where
        T: MessageBody,
        F: Fn(&Message<T>) -> HandlerResult + Send + Sync + 'static,
    {
        if self.inner.status.load() == WorkerStatus::Disposed {
            return Err(MqError::Disposed);
        }
        if *lock(&self.inner.initialized) {
            return Err(MqError::config(format!(
                "cannot register '{}' after the server has been initialized",
                T::type_name()
            )));
        }
        if options.thread_count == 0 {
            return Err(MqError::config(format!(
                "thread count for '{}' must be at least 1",
                T::type_name()
            )));
        }
        let retry = RetryConfig::new(options.retry_count.unwrap_or(self.inner.config.retry_count))?;

        let mut registrations = lock(&self.inner.registrations);
        if registrations
            .iter()
            .any(|r| r.factory.message_type() == T::type_name())
        {
            return Err(MqError::AlreadyRegistered(T::type_name().to_string()));
        }
        let factory = MessageHandlerFactory::<T>::new(self.inner.config.naming.clone(), process_fn)
            .with_server_config(&self.inner.config)
            .with_retry_config(retry)
            .with_exception_fn(options.exception_handler);
        registrations.push(Registration {
            factory: Arc::new(factory),
            thread_count: options.thread_count,
        });
        info!(
            target: "mq::server",
            "Registered handler for '{}' with {} thread(s)", T::type_name(), options.thread_count
        );
        Ok(())
    }

    /// Declares every registered type's queues and builds the workers. Only
    /// the first call has any effect.
    pub fn init(&self) -> Result<(), MqError> {
        self.inner.init()
    }

    /// Starts every worker and the controller thread. When already started,
    /// restarts any worker that has stopped.
    pub fn start(&self) -> Result<(), MqError> {
        self.inner.start().map(|_| ())
    }

    /// Asks the controller to stop all workers. Returns without waiting.
    pub fn stop(&self) -> Result<(), MqError> {
        self.inner.stop()
    }

    /// Asks the controller to stop and restart all workers. Starts a stopped
    /// server.
    pub fn restart(&self) -> Result<(), MqError> {
        self.inner.restart()
    }

    /// Waits until the server and every worker report stopped.
    pub fn wait_for_workers_to_stop(&self, timeout: Duration) -> Result<(), MqError> {
        let stopped = retry_until(timeout, || {
            matches!(self.status(), WorkerStatus::Stopped | WorkerStatus::Disposed)
                && self
                    .inner
                    .workers()
                    .iter()
                    .all(|w| matches!(w.status(), WorkerStatus::Stopped | WorkerStatus::Disposed))
        });
        if stopped {
            Ok(())
        } else {
            Err(MqError::Timeout(timeout))
        }
    }

    /// Stops everything for good. Safe to call more than once.
    pub fn dispose(&self) {
        self.inner.dispose();
    }

    pub fn status(&self) -> WorkerStatus {
        self.inner.status.load()
    }

    /// Controller threads spawned over the server's lifetime.
    pub fn bg_thread_count(&self) -> usize {
        self.inner.bg_thread_count.load(Ordering::SeqCst)
    }

    pub fn times_started(&self) -> u64 {
        self.inner.times_started.load(Ordering::SeqCst)
    }

    pub fn error_count(&self) -> u64 {
        self.inner.error_count.load(Ordering::SeqCst)
    }

    /// Run-loop failures since the last successful start.
    pub fn continuous_error_count(&self) -> u64 {
        self.inner.continuous_error_count.load(Ordering::SeqCst)
    }

    pub fn last_error_message(&self) -> Option<String> {
        lock(&self.inner.last_error_message).clone()
    }

    pub fn worker_count(&self) -> usize {
        lock(&self.inner.workers).len()
    }

    pub fn worker(&self, index: usize) -> Option<Worker> {
        lock(&self.inner.workers).get(index).cloned()
    }

    /// The queue of every worker, in worker order, without duplicates.
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for worker in self.inner.workers() {
            if !names.iter().any(|n| n == worker.queue_name()) {
                names.push(worker.queue_name().to_string());
            }
        }
        names
    }

    /// Indices of the workers consuming `queue_name`.
    pub fn worker_indices(&self, queue_name: &str) -> Vec<usize> {
        lock(&self.inner.queue_index)
            .get(queue_name)
            .cloned()
            .unwrap_or_default()
    }

    pub fn worker_statuses(&self) -> Vec<(String, WorkerStatus)> {
        self.inner
            .workers()
            .iter()
            .map(|w| (w.queue_name().to_string(), w.status()))
            .collect()
    }

    /// Combined statistics of every worker's handler.
    pub fn stats(&self) -> MessageHandlerStats {
        let stats: Vec<MessageHandlerStats> = self.inner.workers().iter().map(Worker::stats).collect();
        MessageHandlerStats::combine("All Handlers", &stats)
    }

    /// A human-readable report of server state and per-worker statistics.
    pub fn stats_description(&self) -> String {
        let mut out = String::new();
        // Writing to a String cannot fail.
        let _ = self.write_stats(&mut out);
        out
    }

    fn write_stats(&self, out: &mut String) -> fmt::Result {
        writeln!(out, "===============")?;
        writeln!(out, "Current Status: {}", self.status())?;
        writeln!(out, "Listening On: {}", self.queue_names().join(", "))?;
        writeln!(out, "Times Started: {}", self.times_started())?;
        writeln!(out, "Num of Errors: {}", self.error_count())?;
        writeln!(out, "Num of Continuous Errors: {}", self.continuous_error_count())?;
        writeln!(out, "Last ErrorMsg: {}", self.last_error_message().unwrap_or_default())?;
        writeln!(out, "===============")?;
        for worker in self.inner.workers() {
            writeln!(out, "[{}] {}", worker.queue_name(), worker.status())?;
            write!(out, "{}", worker.stats())?;
        }
        Ok(())
    }

    /// A typed client on a new transport connection.
    pub fn create_client(&self) -> Result<MqClient, MqError> {
        Ok(MqClient::new(
            self.inner.factory.create_client()?,
            self.inner.config.naming.clone(),
        ))
    }
}

impl Drop for MqServer {
    fn drop(&mut self) {
        self.inner.dispose();
    }
}

impl fmt::Debug for MqServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MqServer")
            .field("status", &self.status())
            .field("workers", &self.worker_count())
            .field("times_started", &self.times_started())
            .finish()
    }
}

impl ServerInner {
    fn workers(&self) -> Vec<Worker> {
        lock(&self.workers).clone()
    }

    fn init(self: &Arc<Self>) -> Result<(), MqError> {
        if self.status.load() == WorkerStatus::Disposed {
            return Err(MqError::Disposed);
        }
        let mut initialized = lock(&self.initialized);
        if *initialized {
            return Ok(());
        }

        self.declare_queues()?;
        let mut workers = Vec::new();
        for registration in lock(&self.registrations).iter() {
            let names = registration.factory.queue_names();
            if self.config.uses_priority_queue(registration.factory.message_type()) {
                for _ in 0..registration.thread_count {
                    workers.push(self.create_worker(registration.factory.as_ref(), &names.priority));
                }
            }
            for _ in 0..registration.thread_count {
                workers.push(self.create_worker(registration.factory.as_ref(), &names.in_queue));
            }
        }

        let mut index: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, worker) in workers.iter().enumerate() {
            index.entry(worker.queue_name().to_string()).or_default().push(i);
        }
        info!(target: "mq::server", "Initialized {} worker(s) on {} queue(s)", workers.len(), index.len());

        *lock(&self.workers) = workers;
        *lock(&self.queue_index) = index;
        *initialized = true;
        Ok(())
    }

    fn declare_queues(&self) -> Result<(), MqError> {
        for registration in lock(&self.registrations).iter() {
            self.factory.declare_queues(&registration.factory.queue_names())?;
        }
        Ok(())
    }

    fn create_worker(self: &Arc<Self>, factory: &dyn HandlerFactory, queue_name: &str) -> Worker {
        let server: Weak<ServerInner> = Arc::downgrade(self);
        let config = WorkerConfig::builder(queue_name, factory.create_message_handler(), Arc::clone(&self.factory))
            .auto_reconnect(self.config.auto_reconnect)
            .polling_interval(self.config.polling_interval)
            .stop_timeout(self.config.stop_timeout)
            .error_handler(Arc::new(move |worker: &Worker, err: &MqError| {
                if let Some(server) = server.upgrade() {
                    server.replace_worker(worker, err);
                }
            }))
            .build();
        Worker::new(config)
    }

    /// Swaps a failed worker for a fresh one in the same slot, starts the
    /// replacement and disposes the original.
    fn replace_worker(&self, failed: &Worker, err: &MqError) {
        let replacement = failed.replacement();
        let slot = {
            let mut workers = lock(&self.workers);
            let slot = workers.iter().position(|w| w.ptr_eq(failed));
            if let Some(i) = slot {
                workers[i] = replacement.clone();
            }
            slot
        };
        let Some(slot) = slot else {
            warn!(target: "mq::server", "Failed worker on '{}' is no longer in the pool", failed.queue_name());
            return;
        };
        warn!(
            target: "mq::server",
            "Replacing worker #{} on '{}' after error: {}", slot, failed.queue_name(), err
        );

        match self.status.load() {
            WorkerStatus::Started | WorkerStatus::Starting => {
                if let Err(e) = replacement.start() {
                    error!(target: "mq::server", "Could not start replacement worker #{}: {}", slot, e);
                }
            }
            WorkerStatus::Disposed => replacement.dispose(),
            _ => {}
        }
        failed.dispose();
    }

    fn start_workers(&self) -> Result<(), MqError> {
        for worker in self.workers() {
            worker.start()?;
        }
        Ok(())
    }

    fn stop_workers(&self) {
        for worker in self.workers() {
            worker.stop();
        }
    }

    fn signal(&self, op: Operation) {
        *lock(&self.pending) = op;
        self.pulse.notify_all();
    }

    fn is_controller_thread(&self) -> bool {
        lock(&self.controller)
            .as_ref()
            .is_some_and(|h| h.thread().id() == thread::current().id())
    }

    /// Returns whether this call moved the server out of Stopped.
    fn start(self: &Arc<Self>) -> Result<bool, MqError> {
        match self.status.load() {
            WorkerStatus::Disposed => return Err(MqError::Disposed),
            WorkerStatus::Started => {
                self.start_workers()?;
                return Ok(false);
            }
            _ => {}
        }
        if !self.status.transition(WorkerStatus::Stopped, WorkerStatus::Starting) {
            return match self.status.load() {
                WorkerStatus::Disposed => Err(MqError::Disposed),
                _ => Ok(false),
            };
        }
        *lock(&self.pending) = Operation::NoOp;

        if let Err(e) = self.init().and_then(|()| self.start_workers()) {
            error!(target: "mq::server", "Failed to start MQ server: {}", e);
            self.status.transition(WorkerStatus::Starting, WorkerStatus::Stopped);
            return Err(e);
        }

        if self.is_controller_thread() {
            return Ok(true);
        }

        // A previous controller may still be winding down.
        self.pulse.notify_all();
        let previous = lock(&self.controller).take();
        if let Some(previous) = previous {
            join_with_deadline(previous, self.config.stop_timeout, "MQ server controller", &|| {
                self.pulse.notify_all()
            });
        }

        let n = self.bg_thread_count.fetch_add(1, Ordering::SeqCst) + 1;
        let server = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("mq-server-{n}"))
            .spawn(move || server.controller_main());
        match spawned {
            Ok(handle) => {
                *lock(&self.controller) = Some(handle);
                Ok(true)
            }
            Err(e) => {
                self.bg_thread_count.fetch_sub(1, Ordering::SeqCst);
                self.stop_workers();
                self.status.transition(WorkerStatus::Starting, WorkerStatus::Stopped);
                Err(MqError::Transport(format!("failed to spawn controller thread: {e}")))
            }
        }
    }

    fn stop(&self) -> Result<(), MqError> {
        match self.status.load() {
            WorkerStatus::Disposed => Err(MqError::Disposed),
            WorkerStatus::Starting => {
                self.signal(Operation::Stop);
                Ok(())
            }
            _ => {
                if self.status.transition(WorkerStatus::Started, WorkerStatus::Stopping) {
                    info!(target: "mq::server", "Stopping MQ server");
                    self.signal(Operation::Stop);
                }
                Ok(())
            }
        }
    }

    fn restart(self: &Arc<Self>) -> Result<(), MqError> {
        match self.status.load() {
            WorkerStatus::Disposed => Err(MqError::Disposed),
            WorkerStatus::Stopped => self.start().map(|_| ()),
            WorkerStatus::Starting => {
                info!(target: "mq::server", "Restart requested while starting");
                self.signal(Operation::Restart);
                Ok(())
            }
            _ => {
                if self.status.transition(WorkerStatus::Started, WorkerStatus::Stopping) {
                    info!(target: "mq::server", "Restarting MQ server");
                    self.signal(Operation::Restart);
                }
                Ok(())
            }
        }
    }

    fn controller_main(self: &Arc<Self>) {
        loop {
            let result = catch_unwind(AssertUnwindSafe(|| self.run_loop()))
                .unwrap_or_else(|payload| Err(MqError::from_panic(payload)));
            let Err(e) = result else {
                break;
            };

            error!(target: "mq::server", "MQ server run loop failed: {}", e);
            *lock(&self.last_error_message) = Some(e.to_string());
            self.error_count.fetch_add(1, Ordering::SeqCst);
            self.continuous_error_count.fetch_add(1, Ordering::SeqCst);
            for current in [WorkerStatus::Starting, WorkerStatus::Started, WorkerStatus::Stopping] {
                self.status.transition(current, WorkerStatus::Stopped);
            }
            self.stop_workers();
            if let Some(handler) = &self.config.error_handler {
                if let Err(payload) = catch_unwind(AssertUnwindSafe(|| handler(&e))) {
                    error!(
                        target: "mq::server",
                        "Server error handler panicked: {}",
                        panic_message(payload.as_ref())
                    );
                }
            }

            let Some(interval) = self.config.keep_alive_retry_interval else {
                break;
            };
            if !self.wait_for_keep_alive(interval) {
                break;
            }
            info!(target: "mq::server", "Retrying MQ server start after {:?}", interval);
            match self.start() {
                Ok(true) => continue,
                Ok(false) => break,
                Err(e) => {
                    error!(target: "mq::server", "Keep-alive restart failed: {}", e);
                    break;
                }
            }
        }
        debug!(target: "mq::server", "Controller thread exiting");
    }

    /// Sleeps `interval` unless someone else moves the server or requests an
    /// operation first. Returns whether the keep-alive restart should go ahead.
    fn wait_for_keep_alive(&self, interval: Duration) -> bool {
        let pending = lock(&self.pending);
        let (pending, _) = self
            .pulse
            .wait_timeout_while(pending, interval, |op| {
                *op == Operation::NoOp && self.status.load() == WorkerStatus::Stopped
            })
            .unwrap_or_else(PoisonError::into_inner);
        *pending == Operation::NoOp && self.status.load() == WorkerStatus::Stopped
    }

    fn run_loop(&self) -> Result<(), MqError> {
        if !self.status.transition(WorkerStatus::Starting, WorkerStatus::Started) {
            return Ok(());
        }
        self.times_started.fetch_add(1, Ordering::SeqCst);
        self.continuous_error_count.store(0, Ordering::SeqCst);
        info!(target: "mq::server", "MQ server started");

        loop {
            let op = {
                let pending = lock(&self.pending);
                let mut pending = self
                    .pulse
                    .wait_while(pending, |op| *op == Operation::NoOp)
                    .unwrap_or_else(PoisonError::into_inner);
                std::mem::replace(&mut *pending, Operation::NoOp)
            };
            debug!(target: "mq::server", "Controller received {:?}", op);

            match op {
                Operation::NoOp => {}
                Operation::Stop => {
                    self.status.transition(WorkerStatus::Started, WorkerStatus::Stopping);
                    self.stop_workers();
                    self.status.transition(WorkerStatus::Stopping, WorkerStatus::Stopped);
                    info!(target: "mq::server", "MQ server stopped");
                    return Ok(());
                }
                Operation::Restart => {
                    self.status.transition(WorkerStatus::Started, WorkerStatus::Stopping);
                    self.stop_workers();
                    if !self.status.transition(WorkerStatus::Stopping, WorkerStatus::Stopped) {
                        return Ok(());
                    }
                    // The broker may have lost the queues along with the connection.
                    self.declare_queues()?;
                    self.start_workers()?;
                    if !self.status.transition(WorkerStatus::Stopped, WorkerStatus::Started) {
                        return Ok(());
                    }
                    self.times_started.fetch_add(1, Ordering::SeqCst);
                    info!(target: "mq::server", "MQ server restarted");
                }
            }
        }
    }

    fn dispose(&self) {
        if self.status.swap(WorkerStatus::Disposed) == WorkerStatus::Disposed {
            return;
        }
        info!(target: "mq::server", "Disposing MQ server");
        self.signal(Operation::Stop);
        for worker in self.workers() {
            worker.dispose();
        }
        let controller = lock(&self.controller).take();
        if let Some(controller) = controller {
            join_with_deadline(controller, self.config.stop_timeout, "MQ server controller", &|| {
                self.signal(Operation::Stop)
            });
        }
        self.factory.dispose();
    }
}
