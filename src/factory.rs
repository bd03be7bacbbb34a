//! Builds message handlers for a registration.

use std::collections::HashSet;
use std::sync::Arc;

use crate::config::ServerConfig;
use crate::error::{HandlerError, MqError};
use crate::handler::{
    ExceptionFn, FailureContext, HandlerResult, MessageHandler, ProcessFn, RequestFilter, ResponseFilter,
    TypedMessageHandler,
};
use crate::message::{Message, MessageBody, Reply, WireMessage};
use crate::naming::{QueueNames, QueueNaming};
use crate::retry::RetryConfig;
use crate::stats::StatsCounters;

/// Type-erased handler factory stored by the server, one per registered type.
pub trait HandlerFactory: Send + Sync {
    fn message_type(&self) -> &str;

    fn queue_names(&self) -> QueueNames;

    /// A fresh handler with its own statistics.
    fn create_message_handler(&self) -> Box<dyn MessageHandler>;
}

/// Produces `TypedMessageHandler<T>` instances sharing one processing
/// function, failure policy, filters and whitelists.
pub struct MessageHandlerFactory<T: MessageBody> {
    naming: QueueNaming,
    process_fn: ProcessFn<T>,
    exception_fn: Option<ExceptionFn<T>>,
    retry: RetryConfig,
    request_filter: Option<RequestFilter>,
    response_filter: Option<ResponseFilter>,
    publish_responses_whitelist: Option<Arc<HashSet<String>>>,
    publish_to_outq_whitelist: Option<Arc<HashSet<String>>>,
}

impl<T: MessageBody> MessageHandlerFactory<T> {
    pub fn new<F>(naming: QueueNaming, process_fn: F) -> Self
    where
        F: Fn(&Message<T>) -> HandlerResult + Send + Sync + 'static,
    {
        Self {
            naming,
            process_fn: Arc::new(process_fn),
            exception_fn: None,
            retry: RetryConfig::default(),
            request_filter: None,
            response_filter: None,
            publish_responses_whitelist: None,
            publish_to_outq_whitelist: None,
        }
    }

    pub fn with_exception_handler<F>(mut self, exception_fn: F) -> Self
    where
        F: Fn(&FailureContext<'_>, &mut Message<T>, &HandlerError) -> Result<(), MqError> + Send + Sync + 'static,
    {
        self.exception_fn = Some(Arc::new(exception_fn));
        self
    }

    pub(crate) fn with_exception_fn(mut self, exception_fn: Option<ExceptionFn<T>>) -> Self {
        self.exception_fn = exception_fn;
        self
    }

    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_request_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(WireMessage) -> Option<WireMessage> + Send + Sync + 'static,
    {
        self.request_filter = Some(Arc::new(filter));
        self
    }

    pub fn with_response_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(Reply) -> Option<Reply> + Send + Sync + 'static,
    {
        self.response_filter = Some(Arc::new(filter));
        self
    }

    pub fn with_publish_responses_whitelist<I, S>(mut self, type_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.publish_responses_whitelist = Some(Arc::new(type_names.into_iter().map(Into::into).collect()));
        self
    }

    pub fn with_publish_to_outq_whitelist<I, S>(mut self, type_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.publish_to_outq_whitelist = Some(Arc::new(type_names.into_iter().map(Into::into).collect()));
        self
    }

    /// Copies the server-wide filters and whitelists onto this factory.
    pub(crate) fn with_server_config(mut self, config: &ServerConfig) -> Self {
        self.request_filter = config.request_filter.clone();
        self.response_filter = config.response_filter.clone();
        self.publish_responses_whitelist = config.publish_responses_whitelist.clone().map(Arc::new);
        self.publish_to_outq_whitelist = config.publish_to_outq_whitelist.clone().map(Arc::new);
        self
    }

    pub fn queue_names(&self) -> QueueNames {
        self.naming.queue_names_for::<T>()
    }

    pub fn create_handler(&self) -> TypedMessageHandler<T> {
        TypedMessageHandler {
            queue_names: self.queue_names(),
            naming: self.naming.clone(),
            process_fn: Arc::clone(&self.process_fn),
            exception_fn: self.exception_fn.clone(),
            retry: self.retry,
            request_filter: self.request_filter.clone(),
            response_filter: self.response_filter.clone(),
            publish_responses_whitelist: self.publish_responses_whitelist.clone(),
            publish_to_outq_whitelist: self.publish_to_outq_whitelist.clone(),
            counters: Arc::new(StatsCounters::default()),
        }
    }
}

impl<T: MessageBody> HandlerFactory for MessageHandlerFactory<T> {
    fn message_type(&self) -> &str {
        T::type_name()
    }

    fn queue_names(&self) -> QueueNames {
        MessageHandlerFactory::queue_names(self)
    }

    fn create_message_handler(&self) -> Box<dyn MessageHandler> {
        Box::new(self.create_handler())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct Order {
        id: u32,
    }
    impl MessageBody for Order {}

    #[test]
    fn test_type_erased_factory() {
        let factory = MessageHandlerFactory::<Order>::new(QueueNaming::new().with_prefix("site1."), |_| Ok(None));
        let boxed: &dyn HandlerFactory = &factory;
        assert_eq!(boxed.message_type(), "Order");
        assert_eq!(boxed.queue_names().in_queue, "site1.mq:Order.inq");

        let a = boxed.create_message_handler();
        let b = boxed.create_message_handler();
        assert_eq!(a.stats().name, "Order");
        assert_eq!(b.queue_names().priority, "site1.mq:Order.priorityq");
    }

    #[test]
    fn test_server_config_is_applied() {
        let config = ServerConfig::new()
            .with_publish_responses_whitelist(["Reply"])
            .with_publish_to_outq_whitelist(["Order"])
            .with_request_filter(Some);
        let handler = MessageHandlerFactory::<Order>::new(QueueNaming::new(), |_| Ok(None))
            .with_server_config(&config)
            .create_handler();

        assert!(handler.request_filter.is_some());
        assert!(handler.response_filter.is_none());
        assert!(handler.publish_responses_whitelist.as_ref().unwrap().contains("Reply"));
        assert!(handler.publish_to_outq_whitelist.as_ref().unwrap().contains("Order"));
    }
}
