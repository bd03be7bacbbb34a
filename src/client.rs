//! Typed producer/consumer API over a transport client.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::error;
use serde::Serialize;
use uuid::Uuid;

use crate::error::MqError;
use crate::message::{Message, MessageBody, ResponseStatus};
use crate::naming::QueueNaming;
use crate::retry::backoff_delay;
use crate::transport::MessageQueueClient;

/// A typed client for publishing requests and reading replies.
///
/// Obtain one from `MqServer::create_client`. The underlying transport
/// client is closed when this is dropped.
pub struct MqClient {
    client: Arc<dyn MessageQueueClient>,
    naming: QueueNaming,
}

impl MqClient {
    pub fn new(client: Arc<dyn MessageQueueClient>, naming: QueueNaming) -> Self {
        Self { client, naming }
    }

    /// Wraps `body` in a new message and publishes it to its type's in
    /// queue. Returns the message id.
    pub fn publish<T: MessageBody>(&self, body: T) -> Result<Uuid, MqError> {
        let message = Message::new(body);
        self.publish_message(&message)?;
        Ok(message.id())
    }

    /// Publishes to the priority queue when `priority > 0`, otherwise to the
    /// in queue.
    pub fn publish_message<T: MessageBody>(&self, message: &Message<T>) -> Result<(), MqError> {
        let names = self.naming.queue_names_for::<T>();
        self.client
            .publish(names.inbound(message.priority()), &message.to_wire()?)
    }

    pub fn publish_to<T: Serialize>(&self, queue_name: &str, message: &Message<T>) -> Result<(), MqError> {
        self.client.publish(queue_name, &message.to_wire()?)
    }

    /// Publishes a one-way notification to an out queue.
    pub fn notify<T: Serialize>(&self, queue_name: &str, message: &Message<T>) -> Result<(), MqError> {
        self.client.notify(queue_name, &message.to_wire()?)
    }

    /// Fetches one message without waiting. The message must be acked or
    /// nacked by the caller. An empty body is acked and reported as no
    /// message; an undecodable body is dead-lettered and returned as an error.
    pub fn get_async<T: MessageBody>(&self, queue_name: &str) -> Result<Option<Message<T>>, MqError> {
        let Some(wire) = self.client.get(queue_name, false)? else {
            return Ok(None);
        };
        match wire.decode::<T>() {
            Ok(Some(message)) => Ok(Some(message)),
            Ok(None) => {
                if let Some(tag) = wire.tag() {
                    self.client.ack(tag)?;
                }
                Ok(None)
            }
            Err(e) => {
                error!(target: "mq::client", "Could not decode message from {}: {}", queue_name, e);
                let mut wire = wire;
                wire.set_error(ResponseStatus::new("SerializationError", e.to_string()));
                self.client
                    .nak(&wire, false, &self.naming.queue_names_for::<T>())?;
                Err(e)
            }
        }
    }

    /// Polls `queue_name` with growing pauses until a message arrives or
    /// `timeout` elapses.
    pub fn get<T: MessageBody>(&self, queue_name: &str, timeout: Duration) -> Result<Option<Message<T>>, MqError> {
        let deadline = Instant::now() + timeout;
        let mut attempt = 0;
        loop {
            if let Some(message) = self.get_async(queue_name)? {
                return Ok(Some(message));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            thread::sleep(backoff_delay(attempt).min(deadline - now));
            attempt += 1;
        }
    }

    pub fn ack<T>(&self, message: &Message<T>) -> Result<(), MqError> {
        match message.tag() {
            Some(tag) => self.client.ack(tag),
            None => Ok(()),
        }
    }

    /// Requeues the message onto its type's inbound queue, or dead-letters it.
    pub fn nak<T: MessageBody>(&self, message: &Message<T>, requeue: bool) -> Result<(), MqError> {
        self.client
            .nak(&message.to_wire()?, requeue, &self.naming.queue_names_for::<T>())
    }

    /// A fresh reply queue name for request/reply exchanges.
    pub fn temp_queue_name(&self) -> String {
        self.naming.temp_queue_name()
    }

    pub fn naming(&self) -> &QueueNaming {
        &self.naming
    }

    pub fn close(&self) {
        self.client.close();
    }

    pub fn is_closed(&self) -> bool {
        self.client.is_closed()
    }
}

impl Drop for MqClient {
    fn drop(&mut self) {
        self.client.close();
    }
}
