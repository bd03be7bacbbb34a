//! # RabbitMQ MQ Server
//! A message-queue server hosting typed message handlers on per-queue worker
//! threads, with retry, requeue and dead-letter handling, a single controller
//! thread and hot-swap of crashed workers.

pub mod client;
pub mod config;
pub mod error;
pub mod factory;
pub mod handler;
pub mod message;
pub mod naming;
pub mod retry;
pub mod server;
pub mod stats;
pub mod status;
pub mod transport;
pub mod worker;

// Re-export key components for easy access
pub use client::MqClient;
pub use config::{RabbitMqConfig, ServerConfig};
pub use error::{ErrorKind, HandlerError, MqError};
pub use factory::{HandlerFactory, MessageHandlerFactory};
pub use handler::{FailureContext, HandlerResult, MessageHandler, TypedMessageHandler};
pub use message::{DeliveryTag, Message, MessageBody, MessageOptions, Reply, ResponseStatus, WireMessage};
pub use naming::{QueueKind, QueueNames, QueueNaming};
pub use retry::RetryConfig;
pub use server::{HandlerOptions, MqServer};
pub use stats::MessageHandlerStats;
pub use status::WorkerStatus;
pub use transport::memory::InMemoryTransport;
pub use transport::rabbitmq::{RabbitMqClient, RabbitMqMessageFactory};
pub use transport::{MessageFactory, MessageQueueClient};
pub use worker::{Worker, WorkerConfig};
