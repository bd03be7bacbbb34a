use std::sync::Arc;
use std::time::Duration;

use rabbitmq_mq_server::{
    HandlerError, HandlerOptions, Message, MessageBody, MqError, MqServer, RabbitMqConfig, RabbitMqMessageFactory,
    Reply, ServerConfig,
};
use serde::{Deserialize, Serialize};

// 1. Define your message structs
#[derive(Serialize, Deserialize, Debug, Clone)]
struct MyMessage {
    content: String,
    id: u32,
}

impl MessageBody for MyMessage {}

#[derive(Serialize, Deserialize, Debug, Clone)]
struct MyMessageProcessed {
    id: u32,
}

impl MessageBody for MyMessageProcessed {}

// 2. Write the processing function
fn handle_message(message: &Message<MyMessage>) -> Result<Option<Reply>, HandlerError> {
    let body = message.body();
    log::info!(
        "Received message with ID: {}. Content: '{}' (attempt {})",
        body.id,
        body.content,
        message.retry_attempts() + 1
    );

    if body.id == 99 {
        log::info!("Simulating a long-running task...");
        std::thread::sleep(Duration::from_secs(10));
        log::info!("Long-running task finished.");
    }

    if body.id == 0 {
        return Err(HandlerError::unretryable("Message id 0 is never valid"));
    }

    if body.id % 2 != 0 {
        log::warn!("Simulating a processing failure for message {}", body.id);
        return Err(HandlerError::retryable(format!(
            "Failed to process message with odd ID: {}",
            body.id
        )));
    }

    log::info!("Successfully processed message {}", body.id);
    Ok(Some(Reply::new(&MyMessageProcessed { id: body.id })?))
}

// 3. Configure and run the server
fn main() -> Result<(), MqError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let broker = RabbitMqConfig::from_env();
    log::info!("Using RabbitMQ at {}", broker.url);

    let factory = Arc::new(RabbitMqMessageFactory::new(broker)?);
    let config = ServerConfig::new()
        .with_retry_count(3)
        .with_keep_alive_retry_interval(Duration::from_secs(5))
        .with_error_handler(|e| log::error!("Server failed: {}", e));
    let server = MqServer::with_config(factory, config)?;

    server.register_handler_with(handle_message, HandlerOptions::new().with_thread_count(2))?;
    server.start()?;

    let client = server.create_client()?;
    for id in [2, 3, 4] {
        client.publish(MyMessage {
            content: format!("hello #{id}"),
            id,
        })?;
    }

    // Block until Ctrl+C; the server runs on its own threads.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| MqError::Transport(e.to_string()))?;
    if let Err(e) = runtime.block_on(tokio::signal::ctrl_c()) {
        log::error!("Failed to listen for Ctrl+C: {}", e);
    }
    log::info!("Ctrl+C received. Shutting down.");

    drop(client);
    log::info!("{}", server.stats_description());
    server.dispose();
    log::info!("Application has shut down.");
    Ok(())
}
