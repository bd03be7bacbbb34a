//! The message envelope and its wire form.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::MqError;

/// A payload type that can travel through the MQ server.
///
/// The type name picks the queues the message lives on. The default is the
/// last path segment of the Rust type name (`my_app::Order` -> `Order`);
/// override it for generic types or to match another service's names.
pub trait MessageBody: Serialize + DeserializeOwned + Send + 'static {
    fn type_name() -> &'static str {
        short_type_name(std::any::type_name::<Self>())
    }
}

fn short_type_name(full: &'static str) -> &'static str {
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// Bit flags carried on a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageOptions(u32);

impl MessageOptions {
    pub const NONE: MessageOptions = MessageOptions(0);
    /// Publish the request to its out queue when the handler returns no reply.
    pub const NOTIFY_ONE_WAY: MessageOptions = MessageOptions(1);

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: MessageOptions) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: MessageOptions) {
        self.0 |= other.0;
    }
}

/// Structured error stored on a message that failed processing.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseStatus {
    pub error_code: String,
    pub message: String,
}

impl ResponseStatus {
    pub fn new(error_code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_code: error_code.into(),
            message: message.into(),
        }
    }
}

/// Transport delivery handle used to ack or nak a retrieved message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeliveryTag(u64);

impl DeliveryTag {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

/// The unit of transport: identity, routing metadata and a typed body.
///
/// `id` and `created_date` are fixed at construction. `retry_attempts` only
/// grows. The delivery tag is set by transports when a message is retrieved.
#[derive(Debug, Clone)]
pub struct Message<T> {
    id: Uuid,
    created_date: DateTime<Utc>,
    priority: i64,
    retry_attempts: u32,
    reply_id: Option<Uuid>,
    reply_to: Option<String>,
    options: MessageOptions,
    error: Option<ResponseStatus>,
    tag: Option<DeliveryTag>,
    meta: HashMap<String, String>,
    body: T,
}

/// A message whose body is still the encoded JSON bytes.
pub type WireMessage = Message<Vec<u8>>;

impl<T> Message<T> {
    pub fn new(body: T) -> Self {
        Self::restore(Uuid::new_v4(), Utc::now(), body)
    }

    /// Rebuilds a message with a known identity, as read back from a transport.
    pub fn restore(id: Uuid, created_date: DateTime<Utc>, body: T) -> Self {
        Self {
            id,
            created_date,
            priority: 0,
            retry_attempts: 0,
            reply_id: None,
            reply_to: None,
            options: MessageOptions::NONE,
            error: None,
            tag: None,
            meta: HashMap::new(),
            body,
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_reply_id(mut self, reply_id: Uuid) -> Self {
        self.reply_id = Some(reply_id);
        self
    }

    pub fn with_options(mut self, options: MessageOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    /// Restores a retry count read back from a transport. Never lowers it.
    pub fn with_retry_attempts(mut self, retry_attempts: u32) -> Self {
        self.retry_attempts = self.retry_attempts.max(retry_attempts);
        self
    }

    pub fn with_error(mut self, error: Option<ResponseStatus>) -> Self {
        self.error = error;
        self
    }

    /// Attaches the transport delivery handle. Only transports call this.
    pub fn with_delivery_tag(mut self, tag: DeliveryTag) -> Self {
        self.tag = Some(tag);
        self
    }

    pub fn without_delivery_tag(mut self) -> Self {
        self.tag = None;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn created_date(&self) -> DateTime<Utc> {
        self.created_date
    }

    pub fn priority(&self) -> i64 {
        self.priority
    }

    pub fn retry_attempts(&self) -> u32 {
        self.retry_attempts
    }

    pub fn reply_id(&self) -> Option<Uuid> {
        self.reply_id
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    pub fn options(&self) -> MessageOptions {
        self.options
    }

    pub fn error(&self) -> Option<&ResponseStatus> {
        self.error.as_ref()
    }

    pub fn tag(&self) -> Option<DeliveryTag> {
        self.tag
    }

    pub fn meta(&self) -> &HashMap<String, String> {
        &self.meta
    }

    pub fn meta_mut(&mut self) -> &mut HashMap<String, String> {
        &mut self.meta
    }

    pub fn body(&self) -> &T {
        &self.body
    }

    pub fn body_mut(&mut self) -> &mut T {
        &mut self.body
    }

    pub fn into_body(self) -> T {
        self.body
    }

    pub fn increment_retry(&mut self) -> u32 {
        self.retry_attempts += 1;
        self.retry_attempts
    }

    pub fn set_error(&mut self, error: ResponseStatus) {
        self.error = Some(error);
    }

    /// Same envelope metadata around a different body.
    pub fn with_body<U>(&self, body: U) -> Message<U> {
        Message {
            id: self.id,
            created_date: self.created_date,
            priority: self.priority,
            retry_attempts: self.retry_attempts,
            reply_id: self.reply_id,
            reply_to: self.reply_to.clone(),
            options: self.options,
            error: self.error.clone(),
            tag: self.tag,
            meta: self.meta.clone(),
            body,
        }
    }
}

impl<T: Serialize> Message<T> {
    /// Encodes the body as UTF-8 JSON. Only the body is serialized; the rest
    /// travels as transport metadata.
    pub fn to_wire(&self) -> Result<WireMessage, MqError> {
        Ok(self.with_body(serde_json::to_vec(&self.body)?))
    }
}

impl WireMessage {
    /// Decodes the JSON body. Empty input is the "no message" sentinel and
    /// yields `Ok(None)`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<Option<Message<T>>, MqError> {
        if self.body.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        let body = serde_json::from_slice(&self.body)?;
        Ok(Some(self.with_body(body)))
    }
}

/// A reply produced by a processing function, already encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    type_name: String,
    body: Vec<u8>,
}

impl Reply {
    pub fn new<R: MessageBody>(body: &R) -> Result<Self, MqError> {
        Ok(Self {
            type_name: R::type_name().to_string(),
            body: serde_json::to_vec(body)?,
        })
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Wraps the reply in a fresh envelope correlated to the request.
    pub fn into_message(self, request_id: Uuid) -> WireMessage {
        Message::new(self.body).with_reply_id(request_id)
    }
}
