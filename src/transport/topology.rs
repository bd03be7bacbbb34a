//! Exchange and queue layout on the broker, and the mapping between message
//! envelopes and AMQP properties.

use chrono::{DateTime, TimeZone, Utc};
use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties, Channel, ExchangeKind,
};
use uuid::Uuid;

use crate::config::RabbitMqConfig;
use crate::error::MqError;
use crate::message::{DeliveryTag, Message, MessageOptions, ResponseStatus, WireMessage};
use crate::naming::{QueueKind, QueueNames, QueueNaming};

pub(crate) const RETRY_ATTEMPTS_HEADER: &str = "x-retry-attempts";
pub(crate) const OPTIONS_HEADER: &str = "x-options";
pub(crate) const ERROR_HEADER: &str = "x-error";
pub(crate) const CREATED_HEADER: &str = "x-created-ms";
const DEAD_LETTER_EXCHANGE_ARG: &str = "x-dead-letter-exchange";
const DEAD_LETTER_ROUTING_KEY_ARG: &str = "x-dead-letter-routing-key";

const RESERVED_HEADERS: [&str; 4] = [RETRY_ATTEMPTS_HEADER, OPTIONS_HEADER, ERROR_HEADER, CREATED_HEADER];

/// Exchange names plus the queue naming used to classify queues.
#[derive(Debug, Clone)]
pub(crate) struct Topology {
    pub exchange: String,
    pub dlq_exchange: String,
    pub topic_exchange: String,
    pub naming: QueueNaming,
}

impl Topology {
    pub(crate) fn new(config: &RabbitMqConfig) -> Self {
        Self {
            exchange: config.exchange.clone(),
            dlq_exchange: config.dlq_exchange.clone(),
            topic_exchange: config.topic_exchange.clone(),
            naming: config.naming.clone(),
        }
    }

    /// Declares the direct, dead-letter and topic exchanges.
    pub(crate) async fn declare_exchanges(&self, channel: &Channel) -> Result<(), MqError> {
        for (name, kind) in [
            (&self.exchange, ExchangeKind::Direct),
            (&self.dlq_exchange, ExchangeKind::Direct),
            (&self.topic_exchange, ExchangeKind::Topic),
        ] {
            channel
                .exchange_declare(
                    name,
                    kind,
                    ExchangeDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await?;
        }
        Ok(())
    }

    /// Declares and binds every queue of one message type.
    pub(crate) async fn declare_queues(&self, channel: &Channel, names: &QueueNames) -> Result<(), MqError> {
        self.declare_exchanges(channel).await?;
        self.declare_bound(channel, &names.dlq, &self.dlq_exchange, FieldTable::default())
            .await?;
        self.declare_bound(channel, &names.out, &self.topic_exchange, FieldTable::default())
            .await?;
        for inbound in [&names.in_queue, &names.priority] {
            self.declare_bound(channel, inbound, &self.exchange, dead_letter_args(&self.dlq_exchange, &names.dlq))
                .await?;
        }
        log::info!(
            target: "mq::rabbitmq",
            "Queues for '{}' declared: {}, {}, {}, {}",
            names.type_name, names.in_queue, names.priority, names.out, names.dlq
        );
        Ok(())
    }

    /// Declares a single queue by name, inferring its role from the suffix.
    /// Used when the broker reports a queue as missing.
    pub(crate) async fn declare_queue(&self, channel: &Channel, queue_name: &str) -> Result<(), MqError> {
        match self.naming.queue_kind(queue_name) {
            QueueKind::Temp => {
                channel
                    .queue_declare(
                        queue_name,
                        QueueDeclareOptions {
                            exclusive: true,
                            auto_delete: true,
                            ..Default::default()
                        },
                        FieldTable::default(),
                    )
                    .await?;
            }
            QueueKind::In | QueueKind::Priority => {
                self.declare_exchanges(channel).await?;
                let args = match self.naming.dlq_for(queue_name) {
                    Some(dlq) => {
                        self.declare_bound(channel, &dlq, &self.dlq_exchange, FieldTable::default())
                            .await?;
                        dead_letter_args(&self.dlq_exchange, &dlq)
                    }
                    None => FieldTable::default(),
                };
                self.declare_bound(channel, queue_name, &self.exchange, args).await?;
            }
            QueueKind::Dlq => {
                self.declare_exchanges(channel).await?;
                self.declare_bound(channel, queue_name, &self.dlq_exchange, FieldTable::default())
                    .await?;
            }
            QueueKind::Out => {
                self.declare_exchanges(channel).await?;
                self.declare_bound(channel, queue_name, &self.topic_exchange, FieldTable::default())
                    .await?;
            }
            QueueKind::Other => {
                self.declare_exchanges(channel).await?;
                self.declare_bound(channel, queue_name, &self.exchange, FieldTable::default())
                    .await?;
            }
        }
        log::debug!(target: "mq::rabbitmq", "Queue '{}' declared", queue_name);
        Ok(())
    }

    async fn declare_bound(
        &self,
        channel: &Channel,
        queue_name: &str,
        exchange: &str,
        args: FieldTable,
    ) -> Result<(), MqError> {
        channel
            .queue_declare(
                queue_name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                args,
            )
            .await?;
        channel
            .queue_bind(
                queue_name,
                exchange,
                queue_name,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    /// Exchange a message for `queue_name` is published through. Temp queues
    /// use the default exchange since they are never bound.
    pub(crate) fn publish_exchange(&self, queue_name: &str) -> &str {
        if self.naming.is_temp_queue(queue_name) {
            ""
        } else {
            &self.exchange
        }
    }
}

fn dead_letter_args(dlq_exchange: &str, dlq: &str) -> FieldTable {
    let mut args = FieldTable::default();
    args.insert(
        DEAD_LETTER_EXCHANGE_ARG.into(),
        AMQPValue::LongString(dlq_exchange.into()),
    );
    args.insert(DEAD_LETTER_ROUTING_KEY_ARG.into(), AMQPValue::LongString(dlq.into()));
    args
}

/// Builds the AMQP properties carrying a message's envelope metadata.
pub(crate) fn to_properties(message: &WireMessage) -> Result<BasicProperties, MqError> {
    let mut headers = FieldTable::default();
    headers.insert(
        RETRY_ATTEMPTS_HEADER.into(),
        AMQPValue::LongLongInt(i64::from(message.retry_attempts())),
    );
    headers.insert(
        CREATED_HEADER.into(),
        AMQPValue::LongLongInt(message.created_date().timestamp_millis()),
    );
    if message.options() != MessageOptions::NONE {
        headers.insert(
            OPTIONS_HEADER.into(),
            AMQPValue::LongUInt(message.options().bits()),
        );
    }
    if let Some(error) = message.error() {
        headers.insert(
            ERROR_HEADER.into(),
            AMQPValue::LongString(serde_json::to_string(error)?.into()),
        );
    }
    for (key, value) in message.meta() {
        headers.insert(key.clone().into(), AMQPValue::LongString(value.clone().into()));
    }

    let mut properties = BasicProperties::default()
        .with_message_id(ShortString::from(message.id().to_string()))
        .with_timestamp(message.created_date().timestamp().max(0) as u64)
        .with_priority(message.priority().clamp(0, i64::from(u8::MAX)) as u8)
        .with_content_type("application/json".into())
        .with_delivery_mode(2)
        .with_headers(headers);
    if let Some(reply_to) = message.reply_to() {
        properties = properties.with_reply_to(ShortString::from(reply_to.to_string()));
    }
    if let Some(reply_id) = message.reply_id() {
        properties = properties.with_correlation_id(ShortString::from(reply_id.to_string()));
    }
    Ok(properties)
}

/// Rebuilds a wire message from a delivery. Messages published by other
/// clients without our headers get a fresh id and the current time.
pub(crate) fn from_delivery(
    delivery_tag: Option<u64>,
    data: Vec<u8>,
    properties: &BasicProperties,
) -> WireMessage {
    let headers = properties.headers().as_ref();
    let header = |name: &str| headers.and_then(|h| h.inner().get(name));

    let id = properties
        .message_id()
        .as_ref()
        .and_then(|id| Uuid::parse_str(id.as_str()).ok())
        .unwrap_or_else(Uuid::new_v4);

    let created_date = match header(CREATED_HEADER) {
        Some(AMQPValue::LongLongInt(ms)) => Utc.timestamp_millis_opt(*ms).single(),
        _ => None,
    }
    .or_else(|| {
        properties
            .timestamp()
            .and_then(|secs| DateTime::from_timestamp(secs as i64, 0))
    })
    .unwrap_or_else(Utc::now);

    let retry_attempts = match header(RETRY_ATTEMPTS_HEADER) {
        Some(AMQPValue::LongLongInt(n)) => *n as u32,
        Some(AMQPValue::LongInt(n)) => *n as u32,
        Some(AMQPValue::ShortInt(n)) => *n as u32,
        _ => 0,
    };

    let options = match header(OPTIONS_HEADER) {
        Some(AMQPValue::LongUInt(bits)) => MessageOptions::from_bits(*bits),
        Some(AMQPValue::LongInt(bits)) => MessageOptions::from_bits(*bits as u32),
        _ => MessageOptions::NONE,
    };

    let error = header(ERROR_HEADER)
        .and_then(|v| v.as_long_string())
        .and_then(|s| serde_json::from_str::<ResponseStatus>(&s.to_string()).ok());

    let mut message = Message::restore(id, created_date, data)
        .with_priority(i64::from(properties.priority().unwrap_or(0)))
        .with_retry_attempts(retry_attempts)
        .with_options(options)
        .with_error(error);

    if let Some(reply_to) = properties.reply_to() {
        message = message.with_reply_to(reply_to.as_str());
    }
    if let Some(reply_id) = properties
        .correlation_id()
        .as_ref()
        .and_then(|id| Uuid::parse_str(id.as_str()).ok())
    {
        message = message.with_reply_id(reply_id);
    }
    if let Some(headers) = headers {
        for (key, value) in headers.inner() {
            if RESERVED_HEADERS.contains(&key.as_str()) {
                continue;
            }
            if let Some(value) = value.as_long_string() {
                message = message.with_meta(key.as_str(), value.to_string());
            }
        }
    }
    match delivery_tag {
        Some(tag) => message.with_delivery_tag(DeliveryTag::new(tag)),
        None => message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_properties_round_trip_metadata() {
        let mut message: WireMessage = Message::new(br#"{"value":1}"#.to_vec())
            .with_priority(5)
            .with_reply_to("mq:tmp:abc")
            .with_reply_id(Uuid::new_v4())
            .with_options(MessageOptions::NOTIFY_ONE_WAY)
            .with_meta("tenant", "acme");
        message.increment_retry();
        message.set_error(ResponseStatus::new("HandlerError", "boom"));

        let properties = to_properties(&message).unwrap();
        let restored = from_delivery(Some(9), message.body().clone(), &properties);

        assert_eq!(restored.id(), message.id());
        assert_eq!(
            restored.created_date().timestamp_millis(),
            message.created_date().timestamp_millis()
        );
        assert_eq!(restored.priority(), 5);
        assert_eq!(restored.retry_attempts(), 1);
        assert_eq!(restored.reply_to(), Some("mq:tmp:abc"));
        assert_eq!(restored.reply_id(), message.reply_id());
        assert!(restored.options().contains(MessageOptions::NOTIFY_ONE_WAY));
        assert_eq!(restored.error(), message.error());
        assert_eq!(restored.meta().get("tenant").map(String::as_str), Some("acme"));
        assert_eq!(restored.meta().len(), 1);
        assert_eq!(restored.tag(), Some(DeliveryTag::new(9)));
    }

    #[test]
    fn test_foreign_message_defaults() {
        let restored = from_delivery(None, b"{}".to_vec(), &BasicProperties::default());
        assert_eq!(restored.retry_attempts(), 0);
        assert_eq!(restored.priority(), 0);
        assert!(restored.tag().is_none());
        assert!(restored.error().is_none());
    }

    #[test]
    fn test_priority_is_clamped() {
        let message: WireMessage = Message::new(Vec::new()).with_priority(1000);
        let properties = to_properties(&message).unwrap();
        assert_eq!(*properties.priority(), Some(255));
    }

    #[test]
    fn test_temp_queues_use_default_exchange() {
        let topology = Topology::new(&RabbitMqConfig::default());
        let temp = topology.naming.temp_queue_name();
        assert_eq!(topology.publish_exchange(&temp), "");
        assert_eq!(topology.publish_exchange("mq:Order.inq"), "mx.mq");
    }
}
