//! Queue naming: derives the canonical queue names for a message type.
//!
//! For message type `T` and prefix `P` the names are `P + "mq:" + T + ".inq"`,
//! `".priorityq"`, `".outq"` and `".dlq"`. Temporary reply queues are
//! `P + "mq:tmp:" + <uuid>`.

use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use crate::message::MessageBody;

pub const MQ_PREFIX: &str = "mq:";
pub const TEMP_QUEUE_PREFIX: &str = "mq:tmp:";

pub const IN_SUFFIX: &str = ".inq";
pub const PRIORITY_SUFFIX: &str = ".priorityq";
pub const OUT_SUFFIX: &str = ".outq";
pub const DLQ_SUFFIX: &str = ".dlq";

/// Stands in for the type name when a resolver's output is split into the
/// text around it. Type names never contain NUL.
const TYPE_PLACEHOLDER: &str = "\u{0}";

/// Resolver signature: `(prefix, type_name, suffix) -> queue name`.
pub type ResolveFn = Arc<dyn Fn(&str, &str, &str) -> String + Send + Sync>;

/// The default resolver: `prefix + "mq:" + type_name + suffix`.
pub fn default_resolver(prefix: &str, type_name: &str, suffix: &str) -> String {
    format!("{prefix}{MQ_PREFIX}{type_name}{suffix}")
}

/// Queue naming configuration.
///
/// This is a plain value handed to the server and transports at construction.
/// Names already resolved from one `QueueNaming` never change, so two servers
/// with different prefixes can coexist in one process.
#[derive(Clone)]
pub struct QueueNaming {
    prefix: String,
    resolver: ResolveFn,
}

impl QueueNaming {
    pub fn new() -> Self {
        Self {
            prefix: String::new(),
            resolver: Arc::new(default_resolver),
        }
    }

    /// Sets the prefix prepended to every queue name (e.g. `"site1."`).
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Replaces the resolver function. It must be pure.
    pub fn with_resolver<F>(mut self, resolver: F) -> Self
    where
        F: Fn(&str, &str, &str) -> String + Send + Sync + 'static,
    {
        self.resolver = Arc::new(resolver);
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn resolve(&self, type_name: &str, suffix: &str) -> String {
        (self.resolver)(&self.prefix, type_name, suffix)
    }

    pub fn queue_names(&self, type_name: &str) -> QueueNames {
        QueueNames {
            type_name: type_name.to_string(),
            in_queue: self.resolve(type_name, IN_SUFFIX),
            priority: self.resolve(type_name, PRIORITY_SUFFIX),
            out: self.resolve(type_name, OUT_SUFFIX),
            dlq: self.resolve(type_name, DLQ_SUFFIX),
        }
    }

    pub fn queue_names_for<T: MessageBody>(&self) -> QueueNames {
        self.queue_names(T::type_name())
    }

    pub fn temp_queue_prefix(&self) -> String {
        format!("{}{}", self.prefix, TEMP_QUEUE_PREFIX)
    }

    pub fn is_temp_queue(&self, queue_name: &str) -> bool {
        queue_name.starts_with(&self.temp_queue_prefix())
    }

    /// A fresh, unique reply queue name. Every call returns a new name.
    pub fn temp_queue_name(&self) -> String {
        format!("{}{}", self.temp_queue_prefix(), Uuid::new_v4().simple())
    }

    /// Whether both configurations resolve every queue name the same way.
    ///
    /// Resolvers are compared by output for a sample type, so two separately
    /// built but equivalent configurations match.
    pub fn matches(&self, other: &QueueNaming) -> bool {
        self.temp_queue_prefix() == other.temp_queue_prefix()
            && [IN_SUFFIX, PRIORITY_SUFFIX, OUT_SUFFIX, DLQ_SUFFIX]
                .iter()
                .all(|suffix| self.template(suffix) == other.template(suffix))
    }

    /// The resolver's output for `suffix`, split around the type name.
    fn template(&self, suffix: &str) -> Option<(String, String)> {
        let resolved = self.resolve(TYPE_PLACEHOLDER, suffix);
        let (head, tail) = resolved.split_once(TYPE_PLACEHOLDER)?;
        Some((head.to_string(), tail.to_string()))
    }

    /// The type-name part of `queue_name` if this resolver would produce it
    /// for `suffix`.
    fn type_segment<'a>(&self, queue_name: &'a str, suffix: &str) -> Option<&'a str> {
        let (head, tail) = self.template(suffix)?;
        let segment = queue_name.strip_prefix(head.as_str())?.strip_suffix(tail.as_str())?;
        (!segment.is_empty()).then_some(segment)
    }

    /// Classifies a queue name by matching it against this resolver's
    /// output for each suffix.
    pub fn queue_kind(&self, queue_name: &str) -> QueueKind {
        if self.is_temp_queue(queue_name) {
            return QueueKind::Temp;
        }
        [
            (PRIORITY_SUFFIX, QueueKind::Priority),
            (IN_SUFFIX, QueueKind::In),
            (OUT_SUFFIX, QueueKind::Out),
            (DLQ_SUFFIX, QueueKind::Dlq),
        ]
        .into_iter()
        .find(|(suffix, _)| self.type_segment(queue_name, suffix).is_some())
        .map_or(QueueKind::Other, |(_, kind)| kind)
    }

    /// The dead-letter queue paired with an inbound queue name, if it is one.
    pub fn dlq_for(&self, queue_name: &str) -> Option<String> {
        let segment = [PRIORITY_SUFFIX, IN_SUFFIX]
            .iter()
            .find_map(|suffix| self.type_segment(queue_name, suffix))?;
        let (head, tail) = self.template(DLQ_SUFFIX)?;
        Some(format!("{head}{segment}{tail}"))
    }
}

impl Default for QueueNaming {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for QueueNaming {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueNaming")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    In,
    Priority,
    Out,
    Dlq,
    Temp,
    Other,
}

/// The four canonical queue names of one message type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueNames {
    pub type_name: String,
    pub in_queue: String,
    pub priority: String,
    pub out: String,
    pub dlq: String,
}

impl QueueNames {
    /// The queue a message of the given priority is published to.
    pub fn inbound(&self, priority: i64) -> &str {
        if priority > 0 {
            &self.priority
        } else {
            &self.in_queue
        }
    }

    /// Inbound queues in draining order: priority first.
    pub fn inbound_queues(&self) -> [&str; 2] {
        [&self.priority, &self.in_queue]
    }

    pub fn all(&self) -> [&str; 4] {
        [&self.in_queue, &self.priority, &self.out, &self.dlq]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_names() {
        let names = QueueNaming::new().queue_names("Order");
        assert_eq!(names.in_queue, "mq:Order.inq");
        assert_eq!(names.priority, "mq:Order.priorityq");
        assert_eq!(names.out, "mq:Order.outq");
        assert_eq!(names.dlq, "mq:Order.dlq");
    }

    #[test]
    fn test_prefixed_names() {
        let names = QueueNaming::new().with_prefix("site1.").queue_names("Order");
        assert_eq!(names.in_queue, "site1.mq:Order.inq");
        assert_eq!(names.priority, "site1.mq:Order.priorityq");
        assert_eq!(names.dlq, "site1.mq:Order.dlq");
    }

    #[test]
    fn test_custom_resolver() {
        let naming = QueueNaming::new()
            .with_prefix("app.")
            .with_resolver(|prefix, type_name, suffix| {
                format!("{}{}{}", prefix, type_name.to_lowercase(), suffix)
            });
        assert_eq!(naming.queue_names("Order").in_queue, "app.order.inq");
    }

    #[test]
    fn test_resolved_names_survive_new_prefix() {
        let naming = QueueNaming::new().with_prefix("a.");
        let resolved = naming.queue_names("Order");
        let _other = naming.clone().with_prefix("b.");
        assert_eq!(resolved.in_queue, "a.mq:Order.inq");
        assert_eq!(naming.prefix(), "a.");
    }

    #[test]
    fn test_temp_queues() {
        let naming = QueueNaming::new().with_prefix("site1.");
        let first = naming.temp_queue_name();
        let second = naming.temp_queue_name();

        assert!(first.starts_with("site1.mq:tmp:"));
        assert_ne!(first, second);
        assert!(naming.is_temp_queue(&first));
        assert!(!naming.is_temp_queue("site1.mq:Order.inq"));
        assert!(!naming.is_temp_queue("mq:tmp:abc"));
    }

    #[test]
    fn test_queue_kind_and_dlq() {
        let naming = QueueNaming::new();
        assert_eq!(naming.queue_kind("mq:Order.inq"), QueueKind::In);
        assert_eq!(naming.queue_kind("mq:Order.priorityq"), QueueKind::Priority);
        assert_eq!(naming.queue_kind("mq:Order.outq"), QueueKind::Out);
        assert_eq!(naming.queue_kind("mq:Order.dlq"), QueueKind::Dlq);
        assert_eq!(naming.queue_kind(&naming.temp_queue_name()), QueueKind::Temp);
        assert_eq!(naming.queue_kind("plain"), QueueKind::Other);

        assert_eq!(naming.dlq_for("mq:Order.inq").as_deref(), Some("mq:Order.dlq"));
        assert_eq!(naming.dlq_for("mq:Order.priorityq").as_deref(), Some("mq:Order.dlq"));
        assert_eq!(naming.dlq_for("mq:Order.outq"), None);
    }

    #[test]
    fn test_queue_kind_follows_custom_resolver() {
        let naming = QueueNaming::new()
            .with_prefix("app.")
            .with_resolver(|prefix, type_name, suffix| {
                let kind = match suffix {
                    IN_SUFFIX => "in",
                    PRIORITY_SUFFIX => "prio",
                    OUT_SUFFIX => "out",
                    _ => "dead",
                };
                format!("{}{}/{}", prefix, kind, type_name.to_lowercase())
            });
        let names = naming.queue_names("Order");
        assert_eq!(names.in_queue, "app.in/order");

        assert_eq!(naming.queue_kind(&names.in_queue), QueueKind::In);
        assert_eq!(naming.queue_kind(&names.priority), QueueKind::Priority);
        assert_eq!(naming.queue_kind(&names.out), QueueKind::Out);
        assert_eq!(naming.queue_kind(&names.dlq), QueueKind::Dlq);
        assert_eq!(naming.queue_kind("mq:Order.inq"), QueueKind::Other);
        assert_eq!(naming.queue_kind("app.in/"), QueueKind::Other);

        assert_eq!(naming.dlq_for(&names.in_queue).as_deref(), Some("app.dead/order"));
        assert_eq!(naming.dlq_for(&names.priority).as_deref(), Some("app.dead/order"));
        assert_eq!(naming.dlq_for(&names.out), None);
    }

    #[test]
    fn test_matches_compares_resolved_names() {
        let lowercase = |prefix: &str, type_name: &str, suffix: &str| {
            format!("{}{}{}", prefix, type_name.to_lowercase(), suffix)
        };
        let a = QueueNaming::new().with_prefix("x.");
        assert!(a.matches(&QueueNaming::new().with_prefix("x.")));
        assert!(!a.matches(&QueueNaming::new()));
        assert!(!a.matches(&QueueNaming::new().with_prefix("x.").with_resolver(lowercase)));
        assert!(QueueNaming::new()
            .with_resolver(lowercase)
            .matches(&QueueNaming::new().with_resolver(lowercase)));
    }

    #[test]
    fn test_inbound_routing() {
        let names = QueueNaming::new().queue_names("Order");
        assert_eq!(names.inbound(0), "mq:Order.inq");
        assert_eq!(names.inbound(-1), "mq:Order.inq");
        assert_eq!(names.inbound(5), "mq:Order.priorityq");
        assert_eq!(names.inbound_queues(), ["mq:Order.priorityq", "mq:Order.inq"]);
    }
}
