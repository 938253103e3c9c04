//! Print source example
//!
//! Publishes a handful of messages on an in-process broker, then reads them
//! through a source runtime and prints each one before acknowledging it.
//!
//! Usage:
//!   EM_CONNECTION_NAME=print-source \
//!   EM_DESTINATION=queue:orders \
//!   EM_SERVICE_URL=https://localhost/protocols/amqp10ws \
//!   cargo run --example print_source

use async_trait::async_trait;
use embridge_core::memory::InMemoryBroker;
use embridge_core::translate::GROUP_ID_PROPERTY;
use embridge_core::{
    init_tracing, BridgeResult, ConnectionSettings, Record, RecordHandler, SourceAdapter,
    SourceRuntime, SourceSettings, WireMessage,
};
use std::sync::Arc;
use std::time::Duration;

/// Prints every record and acknowledges it
struct PrintHandler {
    message_count: u64,
}

#[async_trait]
impl RecordHandler for PrintHandler {
    async fn handle(&mut self, record: Record) -> BridgeResult<()> {
        self.message_count += 1;

        println!("=== Message #{} ===", self.message_count);
        println!("Message ID: {:?}", record.message_id);
        println!("Key: {:?}", record.key);
        println!("Redelivered: {}", record.redelivered);
        match record.payload_str() {
            Some(text) => println!("Payload (text): {}", text),
            None => println!("Payload (binary): {} bytes", record.size()),
        }
        for (key, value) in &record.properties {
            println!("  {} = {}", key, value);
        }
        println!();

        record.ack().await
    }

    async fn shutdown(&mut self) -> BridgeResult<()> {
        println!("Total messages processed: {}", self.message_count);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> BridgeResult<()> {
    let settings = SourceSettings::load().unwrap_or_else(|_| {
        println!("Using default configuration");
        println!("To use custom settings, set EM_CONNECTION_NAME, EM_DESTINATION, EM_SERVICE_URL");
        println!();
        SourceSettings::new(ConnectionSettings::new("print-source", "queue:orders"))
    });
    init_tracing(&settings.processing.log_level);

    let broker = InMemoryBroker::new();
    let destination = settings.connection.destination.clone();
    for i in 1..=5 {
        broker.publish(
            &destination,
            WireMessage::text(format!("Test message #{}", i))
                .with_property(GROUP_ID_PROPERTY, format!("group-{}", i % 2))
                .with_property("message_number", i),
        );
    }

    let source = SourceAdapter::new(Arc::new(broker), settings)?;
    let mut runtime = SourceRuntime::new(PrintHandler { message_count: 0 }, source).with_ctrl_c();

    // stop after the backlog has been printed
    let shutdown = runtime.shutdown_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        shutdown.cancel();
    });

    runtime.run().await
}
