//! Message handlers: decode, process, reply and settle one message type.

use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, error, warn};
use serde::Serialize;

use crate::error::{panic_message, HandlerError, MqError};
use crate::message::{DeliveryTag, Message, MessageBody, MessageOptions, Reply, ResponseStatus, WireMessage};
use crate::naming::{QueueNames, QueueNaming, IN_SUFFIX};
use crate::retry::RetryConfig;
use crate::stats::{MessageHandlerStats, StatsCounters, StatsHandle};
use crate::transport::{DeliveryCallback, MessageQueueClient};

/// What a processing function returns: an optional reply, or a failure.
pub type HandlerResult = Result<Option<Reply>, HandlerError>;

/// User processing function for messages of type `T`.
pub type ProcessFn<T> = Arc<dyn Fn(&Message<T>) -> HandlerResult + Send + Sync>;

/// Replaces the default failure policy for one registration. It must settle
/// the message through the context (ack or nak); if it does not, the message
/// is acked.
pub type ExceptionFn<T> =
    Arc<dyn Fn(&FailureContext<'_>, &mut Message<T>, &HandlerError) -> Result<(), MqError> + Send + Sync>;

/// Rewrites or drops (`None`) a message before it is decoded.
pub type RequestFilter = Arc<dyn Fn(WireMessage) -> Option<WireMessage> + Send + Sync>;

/// Rewrites or drops (`None`) a reply before it is published.
pub type ResponseFilter = Arc<dyn Fn(Reply) -> Option<Reply> + Send + Sync>;

/// A per-type processing engine. One instance is owned by one worker thread.
pub trait MessageHandler: Send {
    /// Type name of the messages this handler processes.
    fn message_type(&self) -> &str;

    fn queue_names(&self) -> &QueueNames;

    /// Drains the priority queue, then the in queue. Returns how many messages
    /// were processed.
    fn process(&mut self, client: &dyn MessageQueueClient) -> Result<usize, MqError> {
        let names = self.queue_names().clone();
        let mut total = 0;
        for queue_name in names.inbound_queues() {
            total += self.process_queue(client, queue_name, &|| true)?;
        }
        Ok(total)
    }

    /// Fetches and processes messages from one queue until it is empty or
    /// `do_next` returns false.
    ///
    /// A closed client ends the loop quietly. Other transport interruptions
    /// are returned so the worker can reconnect; any other fetch error is
    /// logged and ends the loop.
    fn process_queue(
        &mut self,
        client: &dyn MessageQueueClient,
        queue_name: &str,
        do_next: &dyn Fn() -> bool,
    ) -> Result<usize, MqError>;

    /// Processes one retrieved message and settles it exactly once. Only
    /// transport failures while settling are returned.
    fn process_message(&mut self, client: &dyn MessageQueueClient, message: WireMessage) -> Result<(), MqError>;

    fn stats_handle(&self) -> StatsHandle;

    fn stats(&self) -> MessageHandlerStats {
        self.stats_handle().snapshot()
    }
}

/// Settlement tools handed to an exception handler.
pub struct FailureContext<'a> {
    client: &'a dyn MessageQueueClient,
    queue_names: &'a QueueNames,
    retry: RetryConfig,
    counters: &'a StatsCounters,
}

impl<'a> FailureContext<'a> {
    pub fn queue_names(&self) -> &QueueNames {
        self.queue_names
    }

    pub fn retry_config(&self) -> RetryConfig {
        self.retry
    }

    pub fn ack<T>(&self, message: &Message<T>) -> Result<(), MqError> {
        match message.tag() {
            Some(tag) => self.client.ack(tag),
            None => Ok(()),
        }
    }

    /// Requeues the message onto its inbound queue, or dead-letters it.
    pub fn nak<T: Serialize>(&self, message: &Message<T>, requeue: bool) -> Result<(), MqError> {
        let wire = message.to_wire()?;
        self.client.nak(&wire, requeue, self.queue_names)
    }

    /// The default failure policy: requeue retryable errors while retries
    /// remain, dead-letter everything else. Returns whether it requeued.
    pub fn requeue_or_dead_letter<T: Serialize>(
        &self,
        message: &mut Message<T>,
        error: &HandlerError,
    ) -> Result<bool, MqError> {
        let requeue = self.retry.should_requeue(message.retry_attempts(), error);
        if requeue {
            message.increment_retry();
            self.counters.record_retry();
        }
        message.set_error(error.to_response_status());
        self.nak(message, requeue)?;
        Ok(requeue)
    }
}

/// Wraps the worker's client for one message so that the message is settled
/// at most once, and tells the handler whether anything settled it.
struct SettlingClient<'a> {
    inner: &'a dyn MessageQueueClient,
    settled: AtomicBool,
}

impl<'a> SettlingClient<'a> {
    fn new(inner: &'a dyn MessageQueueClient) -> Self {
        Self {
            inner,
            settled: AtomicBool::new(false),
        }
    }

    fn is_settled(&self) -> bool {
        self.settled.load(Ordering::SeqCst)
    }

    fn already_settled(&self, op: &str) -> bool {
        if self.is_settled() {
            warn!(target: "mq::handler", "Message already settled, ignoring {}", op);
            return true;
        }
        false
    }
}

impl MessageQueueClient for SettlingClient<'_> {
    fn publish(&self, queue_name: &str, message: &WireMessage) -> Result<(), MqError> {
        self.inner.publish(queue_name, message)
    }

    fn notify(&self, queue_name: &str, message: &WireMessage) -> Result<(), MqError> {
        self.inner.notify(queue_name, message)
    }

    fn get(&self, queue_name: &str, auto_ack: bool) -> Result<Option<WireMessage>, MqError> {
        self.inner.get(queue_name, auto_ack)
    }

    fn subscribe(&self, queue_name: &str, on_message: DeliveryCallback) -> Result<(), MqError> {
        self.inner.subscribe(queue_name, on_message)
    }

    fn ack(&self, tag: DeliveryTag) -> Result<(), MqError> {
        if self.already_settled("ack") {
            return Ok(());
        }
        self.inner.ack(tag)?;
        self.settled.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn nak(&self, message: &WireMessage, requeue: bool, queue_names: &QueueNames) -> Result<(), MqError> {
        if self.already_settled("nak") {
            return Ok(());
        }
        self.inner.nak(message, requeue, queue_names)?;
        self.settled.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        self.inner.close()
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

/// The handler built for each registered message type.
pub struct TypedMessageHandler<T: MessageBody> {
    pub(crate) queue_names: QueueNames,
    pub(crate) naming: QueueNaming,
    pub(crate) process_fn: ProcessFn<T>,
    pub(crate) exception_fn: Option<ExceptionFn<T>>,
    pub(crate) retry: RetryConfig,
    pub(crate) request_filter: Option<RequestFilter>,
    pub(crate) response_filter: Option<ResponseFilter>,
    pub(crate) publish_responses_whitelist: Option<Arc<HashSet<String>>>,
    pub(crate) publish_to_outq_whitelist: Option<Arc<HashSet<String>>>,
    pub(crate) counters: Arc<StatsCounters>,
}

fn allowed(whitelist: &Option<Arc<HashSet<String>>>, type_name: &str) -> bool {
    whitelist.as_ref().map_or(true, |w| w.contains(type_name))
}

impl<T: MessageBody> TypedMessageHandler<T> {
    fn handle(&self, client: &SettlingClient<'_>, wire: WireMessage) -> Result<(), MqError> {
        let tag = wire.tag();
        let wire = match &self.request_filter {
            Some(filter) => match filter(wire) {
                Some(filtered) => match tag {
                    Some(tag) => filtered.with_delivery_tag(tag),
                    None => filtered,
                },
                None => {
                    debug!(target: "mq::handler", "Message dropped by request filter");
                    return Ok(());
                }
            },
            None => wire,
        };

        let mut message = match wire.decode::<T>() {
            Ok(Some(message)) => message,
            Ok(None) => {
                debug!(
                    target: "mq::handler",
                    "Empty {} message {}, skipping", self.queue_names.type_name, wire.id()
                );
                return Ok(());
            }
            Err(e) => {
                error!(
                    target: "mq::handler",
                    "Could not decode {} message {}, dead-lettering: {}",
                    self.queue_names.type_name, wire.id(), e
                );
                self.counters.record_failed();
                let mut wire = wire;
                wire.set_error(ResponseStatus::new("SerializationError", e.to_string()));
                return client.nak(&wire, false, &self.queue_names);
            }
        };

        let outcome = catch_unwind(AssertUnwindSafe(|| (self.process_fn)(&message)))
            .unwrap_or_else(|payload| Err(HandlerError::from_panic(payload)));

        match outcome {
            Ok(reply) => {
                self.counters.record_processed();
                match self.dispatch_reply(client, &message, reply) {
                    Ok(()) => Ok(()),
                    Err(e) if e.is_interruption() => Err(e),
                    Err(e) => self.on_failure(client, &mut message, HandlerError::from(e)),
                }
            }
            Err(err) => self.on_failure(client, &mut message, err),
        }
    }

    fn dispatch_reply(
        &self,
        client: &SettlingClient<'_>,
        request: &Message<T>,
        reply: Option<Reply>,
    ) -> Result<(), MqError> {
        let type_name = &self.queue_names.type_name;
        let Some(reply) = reply else {
            if request.options().contains(MessageOptions::NOTIFY_ONE_WAY)
                && allowed(&self.publish_to_outq_whitelist, type_name)
            {
                let notification = request.to_wire()?.without_delivery_tag();
                client.notify(&self.queue_names.out, &notification)?;
                debug!(target: "mq::handler", "Notified {} of {}", self.queue_names.out, request.id());
            }
            return Ok(());
        };

        let reply = match &self.response_filter {
            Some(filter) => match filter(reply) {
                Some(reply) => reply,
                None => return Ok(()),
            },
            None => reply,
        };

        match request.reply_to() {
            Some(reply_to) => {
                let reply_to = reply_to.to_string();
                client.publish(&reply_to, &reply.into_message(request.id()))
            }
            None => {
                if !allowed(&self.publish_responses_whitelist, reply.type_name()) {
                    debug!(
                        target: "mq::handler",
                        "Reply type {} not in responses whitelist, dropping", reply.type_name()
                    );
                    return Ok(());
                }
                let queue_name = self.naming.resolve(reply.type_name(), IN_SUFFIX);
                client.publish(&queue_name, &reply.into_message(request.id()))
            }
        }
    }

    fn on_failure(
        &self,
        client: &SettlingClient<'_>,
        message: &mut Message<T>,
        err: HandlerError,
    ) -> Result<(), MqError> {
        self.counters.record_failed();
        let ctx = FailureContext {
            client,
            queue_names: &self.queue_names,
            retry: self.retry,
            counters: &self.counters,
        };
        let result = catch_unwind(AssertUnwindSafe(|| match &self.exception_fn {
            Some(exception_fn) => exception_fn(&ctx, message, &err),
            None => self.default_exception_handler(&ctx, message, &err),
        }));
        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) if e.is_interruption() => Err(e),
            Ok(Err(e)) => {
                error!(
                    target: "mq::handler",
                    "Exception handler failed for {} message {}: {}",
                    self.queue_names.type_name, message.id(), e
                );
                Ok(())
            }
            Err(payload) => {
                error!(
                    target: "mq::handler",
                    "Exception handler panicked for {} message {}: {}",
                    self.queue_names.type_name, message.id(), panic_message(payload.as_ref())
                );
                Ok(())
            }
        }
    }

    fn default_exception_handler(
        &self,
        ctx: &FailureContext<'_>,
        message: &mut Message<T>,
        err: &HandlerError,
    ) -> Result<(), MqError> {
        error!(
            target: "mq::handler",
            "Error processing {} message {} ({} attempt): {}",
            self.queue_names.type_name,
            message.id(),
            self.retry.attempt_type(message.retry_attempts()),
            err
        );
        let requeued = ctx.requeue_or_dead_letter(message, err)?;
        if !requeued {
            warn!(
                target: "mq::handler",
                "{} message {} sent to {} after {} retries",
                self.queue_names.type_name, message.id(), self.queue_names.dlq, message.retry_attempts()
            );
        }
        Ok(())
    }
}

impl<T: MessageBody> MessageHandler for TypedMessageHandler<T> {
    fn message_type(&self) -> &str {
        &self.queue_names.type_name
    }

    fn queue_names(&self) -> &QueueNames {
        &self.queue_names
    }

    fn process_queue(
        &mut self,
        client: &dyn MessageQueueClient,
        queue_name: &str,
        do_next: &dyn Fn() -> bool,
    ) -> Result<usize, MqError> {
        let mut processed = 0;
        while do_next() {
            let message = match client.get(queue_name, false) {
                Ok(Some(message)) => message,
                Ok(None) => break,
                Err(MqError::Closed) => break,
                Err(e) if e.is_interruption() => return Err(e),
                Err(e) => {
                    error!(target: "mq::handler", "Error fetching from {}: {}", queue_name, e);
                    break;
                }
            };
            processed += 1;
            match self.process_message(client, message) {
                Ok(()) => {}
                Err(e) if e.is_interruption() => return Err(e),
                Err(e) => {
                    error!(target: "mq::handler", "Error settling message from {}: {}", queue_name, e);
                    break;
                }
            }
        }
        Ok(processed)
    }

    fn process_message(&mut self, client: &dyn MessageQueueClient, message: WireMessage) -> Result<(), MqError> {
        let tag = message.tag();
        let priority = message.priority() > 0;
        let settling = SettlingClient::new(client);

        let mut result = self.handle(&settling, message);

        if !settling.is_settled() {
            if let Some(tag) = tag {
                if let Err(e) = settling.ack(tag) {
                    result = result.and(Err(e));
                }
            }
        }
        self.counters.record_received(priority);
        result
    }

    fn stats_handle(&self) -> StatsHandle {
        StatsHandle::new(self.queue_names.type_name.clone(), Arc::clone(&self.counters))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::MessageHandlerFactory;
    use crate::transport::memory::InMemoryTransport;
    use crate::transport::MessageFactory;
    use serde::Deserialize;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Echo {
        value: String,
    }
    impl MessageBody for Echo {}

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct EchoReply {
        value: String,
    }
    impl MessageBody for EchoReply {}

    fn setup() -> (InMemoryTransport, Arc<dyn MessageQueueClient>, QueueNames) {
        let transport = InMemoryTransport::new();
        let client = transport.create_client().unwrap();
        let names = QueueNaming::new().queue_names_for::<Echo>();
        (transport, client, names)
    }

    fn publish(client: &Arc<dyn MessageQueueClient>, queue: &str, message: Message<Echo>) {
        client.publish(queue, &message.to_wire().unwrap()).unwrap();
    }

    fn echo(value: &str) -> Message<Echo> {
        Message::new(Echo { value: value.into() })
    }

    #[test]
    fn test_success_acks_and_counts() {
        let (transport, client, names) = setup();
        let mut handler = MessageHandlerFactory::<Echo>::new(QueueNaming::new(), |_| Ok(None)).create_handler();

        publish(&client, &names.in_queue, echo("hi"));
        assert_eq!(handler.process(client.as_ref()).unwrap(), 1);

        let stats = handler.stats();
        assert_eq!(stats.total_messages_processed, 1);
        assert_eq!(stats.total_messages_failed, 0);
        assert_eq!(stats.total_normal_messages_received, 1);
        assert!(stats.last_message_processed.is_some());

        let counters = transport.counters();
        assert_eq!(counters.acked, 1);
        assert_eq!(counters.nacked, 0);
        assert_eq!(counters.in_flight, 0);
    }

    #[test]
    fn test_one_way_notify_publishes_request_to_out_queue() {
        let (transport, client, names) = setup();
        let mut handler = MessageHandlerFactory::<Echo>::new(QueueNaming::new(), |_| Ok(None)).create_handler();

        let request = echo("hi").with_options(MessageOptions::NOTIFY_ONE_WAY);
        publish(&client, &names.in_queue, request.clone());
        handler.process(client.as_ref()).unwrap();

        let out = transport.peek(&names.out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id(), request.id());
        assert_eq!(out[0].decode::<Echo>().unwrap().unwrap().body(), request.body());
    }

    #[test]
    fn test_outq_whitelist_blocks_notify() {
        let (transport, client, names) = setup();
        let mut handler = MessageHandlerFactory::<Echo>::new(QueueNaming::new(), |_| Ok(None))
            .with_publish_to_outq_whitelist(["Other"])
            .create_handler();

        publish(&client, &names.in_queue, echo("hi").with_options(MessageOptions::NOTIFY_ONE_WAY));
        handler.process(client.as_ref()).unwrap();

        assert_eq!(transport.queue_len(&names.out), 0);
        assert_eq!(transport.counters().acked, 1);
    }

    #[test]
    fn test_reply_goes_to_reply_type_in_queue() {
        let (transport, client, names) = setup();
        let mut handler = MessageHandlerFactory::<Echo>::new(QueueNaming::new(), |m| {
            Ok(Some(Reply::new(&EchoReply {
                value: m.body().value.to_uppercase(),
            })?))
        })
        .create_handler();

        let request = echo("hi");
        publish(&client, &names.in_queue, request.clone());
        handler.process(client.as_ref()).unwrap();

        let replies = transport.peek("mq:EchoReply.inq");
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].reply_id(), Some(request.id()));
        let reply: Message<EchoReply> = replies[0].decode().unwrap().unwrap();
        assert_eq!(reply.body().value, "HI");
    }

    #[test]
    fn test_reply_to_overrides_default_route() {
        let (transport, client, names) = setup();
        let naming = QueueNaming::new();
        let reply_queue = naming.temp_queue_name();
        let mut handler = MessageHandlerFactory::<Echo>::new(naming, |m| {
            Ok(Some(Reply::new(&EchoReply {
                value: m.body().value.clone(),
            })?))
        })
        .with_publish_responses_whitelist(Vec::<String>::new())
        .create_handler();

        publish(&client, &names.in_queue, echo("hi").with_reply_to(reply_queue.clone()));
        handler.process(client.as_ref()).unwrap();

        assert_eq!(transport.queue_len(&reply_queue), 1);
        assert_eq!(transport.queue_len("mq:EchoReply.inq"), 0);
    }

    #[test]
    fn test_responses_whitelist_and_filter() {
        let (transport, client, names) = setup();
        let mut handler = MessageHandlerFactory::<Echo>::new(QueueNaming::new(), |m| {
            Ok(Some(Reply::new(&EchoReply {
                value: m.body().value.clone(),
            })?))
        })
        .with_publish_responses_whitelist(["Unrelated"])
        .create_handler();
        publish(&client, &names.in_queue, echo("blocked"));
        handler.process(client.as_ref()).unwrap();
        assert_eq!(transport.queue_len("mq:EchoReply.inq"), 0);

        let mut handler = MessageHandlerFactory::<Echo>::new(QueueNaming::new(), |m| {
            Ok(Some(Reply::new(&EchoReply {
                value: m.body().value.clone(),
            })?))
        })
        .with_response_filter(|_| None)
        .create_handler();
        publish(&client, &names.in_queue, echo("filtered"));
        handler.process(client.as_ref()).unwrap();
        assert_eq!(transport.queue_len("mq:EchoReply.inq"), 0);
        assert_eq!(transport.counters().acked, 2);
    }

    #[test]
    fn test_retryable_failure_requeues_until_ceiling() {
        let (transport, client, names) = setup();
        let mut handler = MessageHandlerFactory::<Echo>::new(QueueNaming::new(), |_| {
            Err(HandlerError::retryable("flaky"))
        })
        .with_retry_config(RetryConfig::new(2).unwrap())
        .create_handler();

        publish(&client, &names.in_queue, echo("hi"));
        // Requeued messages land back on the in queue, so one pass drains all attempts.
        assert_eq!(handler.process(client.as_ref()).unwrap(), 3);

        let counters = transport.counters();
        assert_eq!(counters.requeued, 2);
        assert_eq!(counters.dead_lettered, 1);
        assert_eq!(counters.acked + counters.nacked, counters.delivered);

        let dead = transport.peek(&names.dlq);
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].retry_attempts(), 2);
        assert_eq!(dead[0].error().unwrap().error_code, "HandlerError");
        assert_eq!(dead[0].error().unwrap().message, "flaky");

        let stats = handler.stats();
        assert_eq!(stats.total_messages_failed, 3);
        assert_eq!(stats.total_retries, 2);
        assert_eq!(stats.total_messages_processed, 0);
    }

    #[test]
    fn test_unretryable_failure_dead_letters_immediately() {
        let (transport, client, names) = setup();
        let mut handler = MessageHandlerFactory::<Echo>::new(QueueNaming::new(), |_| {
            Err(HandlerError::unretryable("bad input"))
        })
        .with_retry_config(RetryConfig::new(5).unwrap())
        .create_handler();

        publish(&client, &names.in_queue, echo("hi"));
        handler.process(client.as_ref()).unwrap();

        let counters = transport.counters();
        assert_eq!(counters.requeued, 0);
        assert_eq!(counters.dead_lettered, 1);
        assert_eq!(transport.peek(&names.dlq)[0].retry_attempts(), 0);
    }

    #[test]
    fn test_panic_is_a_retryable_failure() {
        let (transport, client, names) = setup();
        let mut handler = MessageHandlerFactory::<Echo>::new(QueueNaming::new(), |_| panic!("kaboom"))
            .with_retry_config(RetryConfig::new(0).unwrap())
            .create_handler();

        publish(&client, &names.in_queue, echo("hi"));
        handler.process(client.as_ref()).unwrap();

        let dead = transport.peek(&names.dlq);
        assert_eq!(dead[0].error().unwrap().error_code, "Panic");
        assert_eq!(dead[0].error().unwrap().message, "kaboom");
    }

    #[test]
    fn test_poison_message_is_dead_lettered() {
        let (transport, client, names) = setup();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let mut handler = MessageHandlerFactory::<Echo>::new(QueueNaming::new(), move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        })
        .create_handler();

        client
            .publish(&names.in_queue, &Message::new(b"{not json".to_vec()))
            .unwrap();
        handler.process(client.as_ref()).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(transport.queue_len(&names.dlq), 1);
        assert_eq!(transport.counters().nacked, 1);
        assert_eq!(transport.counters().acked, 0);
        assert_eq!(handler.stats().total_messages_failed, 1);
    }

    #[test]
    fn test_empty_body_is_acked_and_skipped() {
        let (transport, client, names) = setup();
        let mut handler = MessageHandlerFactory::<Echo>::new(QueueNaming::new(), |_| Ok(None)).create_handler();

        client.publish(&names.in_queue, &Message::new(Vec::new())).unwrap();
        handler.process(client.as_ref()).unwrap();

        assert_eq!(transport.counters().acked, 1);
        assert_eq!(handler.stats().total_messages_processed, 0);
        assert_eq!(handler.stats().total_normal_messages_received, 1);
    }

    #[test]
    fn test_failing_exception_handler_still_acks_once() {
        let (transport, client, names) = setup();
        let mut handler = MessageHandlerFactory::<Echo>::new(QueueNaming::new(), |_| {
            Err(HandlerError::retryable("flaky"))
        })
        .with_exception_handler(|_, _, _| Err(MqError::Transport("handler broke".into())))
        .create_handler();

        publish(&client, &names.in_queue, echo("hi"));
        handler.process(client.as_ref()).unwrap();

        let counters = transport.counters();
        assert_eq!(counters.acked, 1);
        assert_eq!(counters.nacked, 0);
        assert_eq!(counters.in_flight, 0);
    }

    #[test]
    fn test_exception_handler_settling_twice_is_ignored() {
        let (transport, client, names) = setup();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&errors);
        let mut handler = MessageHandlerFactory::<Echo>::new(QueueNaming::new(), |_| {
            Err(HandlerError::retryable("flaky"))
        })
        .with_exception_handler(move |ctx, message, err| {
            recorded.lock().unwrap().push(err.message().to_string());
            ctx.nak(message, false)?;
            ctx.ack(message)
        })
        .create_handler();

        publish(&client, &names.in_queue, echo("hi"));
        handler.process(client.as_ref()).unwrap();

        assert_eq!(*errors.lock().unwrap(), vec!["flaky".to_string()]);
        let counters = transport.counters();
        assert_eq!(counters.nacked, 1);
        assert_eq!(counters.acked, 0);
    }

    #[test]
    fn test_request_filter_can_drop() {
        let (transport, client, names) = setup();
        let mut handler = MessageHandlerFactory::<Echo>::new(QueueNaming::new(), |_| Ok(None))
            .with_request_filter(|m| if m.priority() > 5 { None } else { Some(m) })
            .create_handler();

        publish(&client, &names.priority, echo("dropped").with_priority(9));
        publish(&client, &names.in_queue, echo("kept"));
        handler.process(client.as_ref()).unwrap();

        let stats = handler.stats();
        assert_eq!(stats.total_messages_processed, 1);
        assert_eq!(stats.total_priority_messages_received, 1);
        assert_eq!(transport.counters().acked, 2);
    }

    #[test]
    fn test_priority_queue_drained_first() {
        let (_transport, client, names) = setup();
        let order = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&order);
        let mut handler = MessageHandlerFactory::<Echo>::new(QueueNaming::new(), move |m| {
            seen.lock().unwrap().push(m.body().value.clone());
            Ok(None)
        })
        .create_handler();

        publish(&client, &names.in_queue, echo("normal-1"));
        publish(&client, &names.priority, echo("priority-1").with_priority(1));
        publish(&client, &names.in_queue, echo("normal-2"));
        publish(&client, &names.priority, echo("priority-2").with_priority(1));

        assert_eq!(handler.process(client.as_ref()).unwrap(), 4);
        assert_eq!(
            *order.lock().unwrap(),
            vec!["priority-1", "priority-2", "normal-1", "normal-2"]
        );
    }

    #[test]
    fn test_process_queue_stops_when_do_next_is_false() {
        let (transport, client, names) = setup();
        let mut handler = MessageHandlerFactory::<Echo>::new(QueueNaming::new(), |_| Ok(None)).create_handler();
        publish(&client, &names.in_queue, echo("a"));
        publish(&client, &names.in_queue, echo("b"));

        let budget = AtomicUsize::new(1);
        let processed = handler
            .process_queue(client.as_ref(), &names.in_queue, &|| {
                budget.fetch_sub(1, Ordering::SeqCst) > 0
            })
            .unwrap();

        assert_eq!(processed, 1);
        assert_eq!(transport.queue_len(&names.in_queue), 1);
    }

    #[test]
    fn test_closed_client_ends_queue_quietly() {
        let (_transport, client, names) = setup();
        let mut handler = MessageHandlerFactory::<Echo>::new(QueueNaming::new(), |_| Ok(None)).create_handler();
        client.close();
        assert_eq!(
            handler
                .process_queue(client.as_ref(), &names.in_queue, &|| true)
                .unwrap(),
            0
        );
    }
}
