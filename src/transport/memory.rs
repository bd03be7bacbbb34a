//! In-memory transport for tests and single-process setups.
//!
//! Queues are FIFO and created on first use. Fetched messages stay in flight
//! under their delivery tag until acked or nacked. Counters record every
//! delivery and settlement so callers can check that each delivery was
//! settled exactly once. Closing a client returns the deliveries it still
//! holds to the front of their source queue, the way a broker redelivers
//! unacked messages when a channel goes away.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use log::{debug, warn};

use crate::error::MqError;
use crate::message::{DeliveryTag, WireMessage};
use crate::naming::QueueNames;
use crate::transport::{DeliveryCallback, MessageFactory, MessageQueueClient};

const SUBSCRIPTION_WAIT: Duration = Duration::from_millis(50);

/// Delivery and settlement counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportCounters {
    pub published: u64,
    pub delivered: u64,
    pub acked: u64,
    pub nacked: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
    /// Unsettled deliveries put back on their queue by a closing client.
    pub returned: u64,
    pub in_flight: u64,
}

struct InFlight {
    queue: String,
    owner: u64,
    message: WireMessage,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, VecDeque<WireMessage>>,
    declared: HashSet<String>,
    in_flight: HashMap<DeliveryTag, InFlight>,
    next_tag: u64,
    next_client: u64,
    counters: TransportCounters,
    disposed: bool,
}

impl BrokerState {
    fn push(&mut self, queue_name: &str, message: &WireMessage) {
        self.queues
            .entry(queue_name.to_string())
            .or_default()
            .push_back(message.clone().without_delivery_tag());
    }

    fn pop(&mut self, queue_name: &str, auto_ack: bool, owner: u64) -> Option<WireMessage> {
        let message = self.queues.get_mut(queue_name)?.pop_front()?;
        self.counters.delivered += 1;
        if auto_ack {
            return Some(message);
        }
        self.next_tag += 1;
        let tag = DeliveryTag::new(self.next_tag);
        let message = message.with_delivery_tag(tag);
        self.in_flight.insert(
            tag,
            InFlight {
                queue: queue_name.to_string(),
                owner,
                message: message.clone(),
            },
        );
        Some(message)
    }

    /// Puts every delivery held by `owner` back at the head of its queue,
    /// oldest first. Returns how many were put back.
    fn return_unsettled(&mut self, owner: u64) -> usize {
        let mut tags: Vec<DeliveryTag> = self
            .in_flight
            .iter()
            .filter(|(_, entry)| entry.owner == owner)
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_by_key(|tag| std::cmp::Reverse(tag.value()));
        for tag in &tags {
            if let Some(entry) = self.in_flight.remove(tag) {
                self.queues
                    .entry(entry.queue)
                    .or_default()
                    .push_front(entry.message.without_delivery_tag());
            }
        }
        self.counters.returned += tags.len() as u64;
        tags.len()
    }
}

#[derive(Default)]
struct Broker {
    state: Mutex<BrokerState>,
    available: Condvar,
}

impl Broker {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A process-local broker. Cloning shares the same queues.
#[derive(Clone)]
pub struct InMemoryTransport {
    broker: Arc<Broker>,
    use_polling: bool,
}

impl InMemoryTransport {
    /// A transport whose workers poll.
    pub fn new() -> Self {
        Self {
            broker: Arc::new(Broker::default()),
            use_polling: true,
        }
    }

    /// Workers subscribe instead of polling.
    pub fn with_subscriptions(mut self) -> Self {
        self.use_polling = false;
        self
    }

    pub fn queue_len(&self, queue_name: &str) -> usize {
        self.broker
            .lock()
            .queues
            .get(queue_name)
            .map_or(0, VecDeque::len)
    }

    /// Copies of the messages currently waiting on a queue, in order.
    pub fn peek(&self, queue_name: &str) -> Vec<WireMessage> {
        self.broker
            .lock()
            .queues
            .get(queue_name)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_declared(&self, queue_name: &str) -> bool {
        self.broker.lock().declared.contains(queue_name)
    }

    pub fn counters(&self) -> TransportCounters {
        let state = self.broker.lock();
        TransportCounters {
            in_flight: state.in_flight.len() as u64,
            ..state.counters
        }
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageFactory for InMemoryTransport {
    fn create_client(&self) -> Result<Arc<dyn MessageQueueClient>, MqError> {
        if self.broker.lock().disposed {
            return Err(MqError::Interrupted("in-memory broker disposed".to_string()));
        }
        let id = {
            let mut state = self.broker.lock();
            state.next_client += 1;
            state.next_client
        };
        Ok(Arc::new(InMemoryClient {
            id,
            broker: Arc::clone(&self.broker),
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }

    fn declare_queues(&self, queue_names: &QueueNames) -> Result<(), MqError> {
        let mut state = self.broker.lock();
        for name in queue_names.all() {
            state.queues.entry(name.to_string()).or_default();
            state.declared.insert(name.to_string());
        }
        Ok(())
    }

    fn use_polling(&self) -> bool {
        self.use_polling
    }

    fn dispose(&self) {
        self.broker.lock().disposed = true;
        self.broker.available.notify_all();
    }
}

struct InMemoryClient {
    id: u64,
    broker: Arc<Broker>,
    closed: Arc<AtomicBool>,
}

impl InMemoryClient {
    fn ensure_open(&self) -> Result<(), MqError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MqError::Closed);
        }
        Ok(())
    }
}

impl MessageQueueClient for InMemoryClient {
    fn publish(&self, queue_name: &str, message: &WireMessage) -> Result<(), MqError> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        state.push(queue_name, message);
        state.counters.published += 1;
        drop(state);
        self.broker.available.notify_all();
        Ok(())
    }

    fn notify(&self, queue_name: &str, message: &WireMessage) -> Result<(), MqError> {
        self.publish(queue_name, message)
    }

    fn get(&self, queue_name: &str, auto_ack: bool) -> Result<Option<WireMessage>, MqError> {
        let mut state = self.broker.lock();
        // Checked under the lock so a concurrent close cannot miss this delivery.
        self.ensure_open()?;
        Ok(state.pop(queue_name, auto_ack, self.id))
    }

    fn subscribe(&self, queue_name: &str, mut on_message: DeliveryCallback) -> Result<(), MqError> {
        self.ensure_open()?;
        let broker = Arc::clone(&self.broker);
        let closed = Arc::clone(&self.closed);
        let queue = queue_name.to_string();
        let owner = self.id;

        thread::Builder::new()
            .name(format!("mq-memory-delivery:{queue_name}"))
            .spawn(move || {
                debug!(target: "mq::memory", "Subscription on '{}' started", queue);
                while !closed.load(Ordering::SeqCst) {
                    let next = {
                        let mut state = broker.lock();
                        if state.disposed || closed.load(Ordering::SeqCst) {
                            break;
                        }
                        let mut next = state.pop(&queue, false, owner);
                        if next.is_none() {
                            let (mut state, _) = broker
                                .available
                                .wait_timeout(state, SUBSCRIPTION_WAIT)
                                .unwrap_or_else(PoisonError::into_inner);
                            if !state.disposed && !closed.load(Ordering::SeqCst) {
                                next = state.pop(&queue, false, owner);
                            }
                        }
                        next
                    };
                    if let Some(message) = next {
                        on_message(message);
                    }
                }
                debug!(target: "mq::memory", "Subscription on '{}' ended", queue);
            })
            .map_err(|e| MqError::Transport(format!("failed to spawn delivery thread: {e}")))?;
        Ok(())
    }

    fn ack(&self, tag: DeliveryTag) -> Result<(), MqError> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        if state.in_flight.remove(&tag).is_none() {
            warn!(target: "mq::memory", "Ack for unknown delivery tag {}", tag.value());
            return Ok(());
        }
        state.counters.acked += 1;
        Ok(())
    }

    fn nak(&self, message: &WireMessage, requeue: bool, queue_names: &QueueNames) -> Result<(), MqError> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        if let Some(tag) = message.tag() {
            state.in_flight.remove(&tag);
        }
        state.counters.nacked += 1;
        if requeue {
            state.push(queue_names.inbound(message.priority()), message);
            state.counters.requeued += 1;
        } else {
            state.push(&queue_names.dlq, message);
            state.counters.dead_lettered += 1;
        }
        drop(state);
        self.broker.available.notify_all();
        Ok(())
    }

    fn close(&self) {
        let mut state = self.broker.lock();
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let returned = state.return_unsettled(self.id);
        drop(state);
        if returned > 0 {
            debug!(target: "mq::memory", "Returned {} unsettled deliveries on close", returned);
        }
        self.broker.available.notify_all();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
