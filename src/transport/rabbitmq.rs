//! RabbitMQ transport over `lapin`.
//!
//! lapin is async; workers are plain OS threads. The factory owns a small
//! tokio runtime and every client call drives its future to completion with
//! `Handle::block_on`. Subscription deliveries are pulled from the consumer
//! stream on a dedicated thread and handed to the callback outside of any
//! `block_on`, so callbacks may call back into the client.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicGetOptions, BasicPublishOptions, BasicQosOptions,
    },
    types::FieldTable,
    Channel, Connection, ConnectionProperties,
};
use log::{debug, error, info, warn};
use tokio::runtime::{Builder, Handle, Runtime};
use uuid::Uuid;

use crate::config::RabbitMqConfig;
use crate::error::MqError;
use crate::message::{DeliveryTag, WireMessage};
use crate::naming::{QueueNames, QueueNaming};
use crate::transport::topology::{from_delivery, to_properties, Topology};
use crate::transport::{DeliveryCallback, MessageFactory, MessageQueueClient};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);
const REPLY_SUCCESS: u16 = 200;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns the broker connection and hands out one channel per client.
pub struct RabbitMqMessageFactory {
    config: RabbitMqConfig,
    topology: Topology,
    runtime: Option<Runtime>,
    handle: Handle,
    connection: Mutex<Option<Arc<Connection>>>,
    disposed: AtomicBool,
}

impl RabbitMqMessageFactory {
    /// Creates the factory. The connection is opened lazily on first use and
    /// reopened after it drops.
    pub fn new(config: RabbitMqConfig) -> Result<Self, MqError> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("mq-amqp")
            .enable_all()
            .build()
            .map_err(|e| MqError::Transport(format!("failed to start AMQP runtime: {e}")))?;
        Ok(Self {
            topology: Topology::new(&config),
            handle: runtime.handle().clone(),
            runtime: Some(runtime),
            config,
            connection: Mutex::new(None),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &RabbitMqConfig {
        &self.config
    }

    fn connection(&self) -> Result<Arc<Connection>, MqError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(MqError::Interrupted("RabbitMQ factory disposed".to_string()));
        }
        let mut slot = lock(&self.connection);
        if let Some(connection) = slot.as_ref() {
            if connection.status().connected() {
                return Ok(Arc::clone(connection));
            }
            warn!(target: "mq::rabbitmq", "RabbitMQ connection lost, reconnecting");
        }
        let connection = self
            .handle
            .block_on(Connection::connect(&self.config.url, ConnectionProperties::default()))?;
        info!(target: "mq::rabbitmq", "Connected to RabbitMQ");
        let connection = Arc::new(connection);
        *slot = Some(Arc::clone(&connection));
        Ok(connection)
    }
}

impl MessageFactory for RabbitMqMessageFactory {
    fn create_client(&self) -> Result<Arc<dyn MessageQueueClient>, MqError> {
        let connection = self.connection()?;
        let channel = self.handle.block_on(connection.create_channel())?;
        Ok(Arc::new(RabbitMqClient {
            handle: self.handle.clone(),
            connection,
            channel: Mutex::new(channel),
            topology: self.topology.clone(),
            declared: Mutex::new(HashSet::new()),
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }

    fn declare_queues(&self, queue_names: &QueueNames) -> Result<(), MqError> {
        let connection = self.connection()?;
        let topology = &self.topology;
        self.handle.block_on(async {
            let channel = connection.create_channel().await?;
            topology.declare_queues(&channel, queue_names).await?;
            channel.close(REPLY_SUCCESS, "OK").await?;
            Ok::<(), MqError>(())
        })
    }

    fn use_polling(&self) -> bool {
        self.config.use_polling
    }

    fn naming(&self) -> Option<&QueueNaming> {
        Some(&self.topology.naming)
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(connection) = lock(&self.connection).take() {
            let closed = self
                .handle
                .block_on(async { tokio::time::timeout(CLOSE_TIMEOUT, connection.close(REPLY_SUCCESS, "OK")).await });
            if let Ok(Err(e)) = closed {
                debug!(target: "mq::rabbitmq", "Error closing RabbitMQ connection: {}", e);
            }
        }
        info!(target: "mq::rabbitmq", "RabbitMQ factory disposed");
    }
}

impl Drop for RabbitMqMessageFactory {
    fn drop(&mut self) {
        self.dispose();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

/// One AMQP channel. Reopened transparently when the broker closes it after
/// a channel-level error.
pub struct RabbitMqClient {
    handle: Handle,
    connection: Arc<Connection>,
    channel: Mutex<Channel>,
    topology: Topology,
    declared: Mutex<HashSet<String>>,
    closed: Arc<AtomicBool>,
}

impl RabbitMqClient {
    fn ensure_open(&self) -> Result<(), MqError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MqError::Closed);
        }
        Ok(())
    }

    fn channel(&self) -> Result<Channel, MqError> {
        self.ensure_open()?;
        let mut channel = lock(&self.channel);
        if !channel.status().connected() {
            if !self.connection.status().connected() {
                return Err(MqError::Interrupted("RabbitMQ connection closed".to_string()));
            }
            debug!(target: "mq::rabbitmq", "Reopening closed channel");
            *channel = self.handle.block_on(self.connection.create_channel())?;
            lock(&self.declared).clear();
        }
        Ok(channel.clone())
    }

    /// Declares `queue_name` once per channel. Temp queues are exclusive to
    /// their consumer, so publishers never declare them.
    fn ensure_declared(&self, channel: &Channel, queue_name: &str, consuming: bool) -> Result<(), MqError> {
        let temp = self.topology.naming.is_temp_queue(queue_name);
        if (temp && !consuming) || lock(&self.declared).contains(queue_name) {
            return Ok(());
        }
        self.handle
            .block_on(self.topology.declare_queue(channel, queue_name))?;
        lock(&self.declared).insert(queue_name.to_string());
        Ok(())
    }

    fn publish_via(&self, exchange: &str, routing_key: &str, message: &WireMessage) -> Result<(), MqError> {
        let channel = self.channel()?;
        self.ensure_declared(&channel, routing_key, false)?;
        let properties = to_properties(message)?;
        self.handle.block_on(channel.basic_publish(
            exchange,
            routing_key,
            BasicPublishOptions::default(),
            message.body(),
            properties,
        ))?;
        Ok(())
    }

    fn basic_get(&self, queue_name: &str, auto_ack: bool) -> Result<Option<WireMessage>, MqError> {
        let channel = self.channel()?;
        let message = self
            .handle
            .block_on(channel.basic_get(queue_name, BasicGetOptions { no_ack: auto_ack }))?;
        Ok(message.map(|m| {
            let tag = (!auto_ack).then_some(m.delivery.delivery_tag);
            from_delivery(tag, m.delivery.data, &m.delivery.properties)
        }))
    }
}

impl MessageQueueClient for RabbitMqClient {
    fn publish(&self, queue_name: &str, message: &WireMessage) -> Result<(), MqError> {
        let exchange = self.topology.publish_exchange(queue_name).to_string();
        self.publish_via(&exchange, queue_name, message)
    }

    fn notify(&self, queue_name: &str, message: &WireMessage) -> Result<(), MqError> {
        let exchange = self.topology.topic_exchange.clone();
        self.publish_via(&exchange, queue_name, message)
    }

    fn get(&self, queue_name: &str, auto_ack: bool) -> Result<Option<WireMessage>, MqError> {
        match self.basic_get(queue_name, auto_ack) {
            Err(e) if e.is_not_found() => {
                info!(target: "mq::rabbitmq", "Queue '{}' not found, declaring it", queue_name);
                let channel = self.channel()?;
                self.ensure_declared(&channel, queue_name, true)?;
                self.basic_get(queue_name, auto_ack)
            }
            other => other,
        }
    }

    fn subscribe(&self, queue_name: &str, mut on_message: DeliveryCallback) -> Result<(), MqError> {
        let channel = self.channel()?;
        self.ensure_declared(&channel, queue_name, true)?;
        let consumer_tag = format!("{}-{}", queue_name, Uuid::new_v4().simple());
        let consumer = self.handle.block_on(async {
            channel.basic_qos(1, BasicQosOptions::default()).await?;
            channel
                .basic_consume(
                    queue_name,
                    &consumer_tag,
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await
        })?;
        info!(target: "mq::rabbitmq", "Consumer '{}' started on '{}'", consumer_tag, queue_name);

        let handle = self.handle.clone();
        let closed = Arc::clone(&self.closed);
        let queue = queue_name.to_string();
        thread::Builder::new()
            .name(format!("mq-amqp-delivery:{queue_name}"))
            .spawn(move || {
                let mut consumer = Box::pin(consumer);
                while !closed.load(Ordering::SeqCst) {
                    match handle.block_on(consumer.next()) {
                        Some(Ok(delivery)) => {
                            on_message(from_delivery(
                                Some(delivery.delivery_tag),
                                delivery.data,
                                &delivery.properties,
                            ));
                        }
                        Some(Err(e)) => {
                            error!(target: "mq::rabbitmq", "Consumer on '{}' failed: {}", queue, e);
                            break;
                        }
                        None => break,
                    }
                }
                debug!(target: "mq::rabbitmq", "Consumer on '{}' ended", queue);
            })
            .map_err(|e| MqError::Transport(format!("failed to spawn delivery thread: {e}")))?;
        Ok(())
    }

    fn ack(&self, tag: DeliveryTag) -> Result<(), MqError> {
        let channel = self.channel()?;
        self.handle
            .block_on(channel.basic_ack(tag.value(), BasicAckOptions::default()))?;
        Ok(())
    }

    /// Republishes the failed message with its updated retry count and error,
    /// then acks the original delivery. Plain `basic_nack` would lose both.
    fn nak(&self, message: &WireMessage, requeue: bool, queue_names: &QueueNames) -> Result<(), MqError> {
        if requeue {
            let exchange = self.topology.exchange.clone();
            self.publish_via(&exchange, queue_names.inbound(message.priority()), message)?;
        } else {
            let exchange = self.topology.dlq_exchange.clone();
            self.publish_via(&exchange, &queue_names.dlq, message)?;
        }
        if let Some(tag) = message.tag() {
            self.ack(tag)?;
        }
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let channel = lock(&self.channel).clone();
        if channel.status().connected() {
            let closed = self
                .handle
                .block_on(async { tokio::time::timeout(CLOSE_TIMEOUT, channel.close(REPLY_SUCCESS, "OK")).await });
            if let Ok(Err(e)) = closed {
                debug!(target: "mq::rabbitmq", "Error closing channel: {}", e);
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || !self.connection.status().connected()
    }
}
