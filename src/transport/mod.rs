//! Queue transport seams: a connection-level factory and per-worker clients.
//!
//! Everything here is blocking. A worker thread owns its client and calls it
//! directly; subscription deliveries arrive on a transport-owned thread.

pub mod memory;
pub mod rabbitmq;
mod topology;

use std::sync::Arc;

use crate::error::MqError;
use crate::message::{DeliveryTag, WireMessage};
use crate::naming::{QueueNames, QueueNaming};

/// Callback invoked for each message pushed by a subscription.
pub type DeliveryCallback = Box<dyn FnMut(WireMessage) + Send>;

/// One logical client (an AMQP channel, for RabbitMQ).
pub trait MessageQueueClient: Send + Sync {
    /// Publishes to an inbound or reply queue. Any delivery tag on `message`
    /// is ignored.
    fn publish(&self, queue_name: &str, message: &WireMessage) -> Result<(), MqError>;

    /// Publishes a one-way notification to an out queue.
    fn notify(&self, queue_name: &str, message: &WireMessage) -> Result<(), MqError>;

    /// Non-blocking fetch. Returned messages carry a delivery tag unless
    /// `auto_ack` is set.
    fn get(&self, queue_name: &str, auto_ack: bool) -> Result<Option<WireMessage>, MqError>;

    /// Starts pushing messages from `queue_name` to `on_message` on a
    /// transport-owned thread until the client is closed.
    fn subscribe(&self, queue_name: &str, on_message: DeliveryCallback) -> Result<(), MqError>;

    fn ack(&self, tag: DeliveryTag) -> Result<(), MqError>;

    /// Settles a failed message: back onto its inbound queue when `requeue`,
    /// otherwise onto the dead-letter queue.
    fn nak(&self, message: &WireMessage, requeue: bool, queue_names: &QueueNames) -> Result<(), MqError>;

    /// Closes the client. Blocked or later calls fail with `MqError::Closed`.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Creates clients and declares queue topology.
pub trait MessageFactory: Send + Sync {
    fn create_client(&self) -> Result<Arc<dyn MessageQueueClient>, MqError>;

    /// Declares the in, priority, out and dlq queues of one message type.
    fn declare_queues(&self, queue_names: &QueueNames) -> Result<(), MqError>;

    /// Workers poll with `get` when true and subscribe otherwise.
    fn use_polling(&self) -> bool;

    /// The naming this transport resolves temporary and dead-letter queues
    /// with, when it keeps its own. A server refuses a config that disagrees.
    fn naming(&self) -> Option<&QueueNaming> {
        None
    }

    /// Releases the underlying connection.
    fn dispose(&self);
}
