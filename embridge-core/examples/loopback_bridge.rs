//! Loopback bridge example
//!
//! Wires a source runtime to a sink runtime through a channel: messages read
//! from `queue:inbound` are republished to `topic:outbound`, and each inbound
//! message is acknowledged only after its outbound send completed.
//!
//! Usage:
//!   RUST_LOG=debug cargo run --example loopback_bridge

use embridge_core::memory::InMemoryBroker;
use embridge_core::translate::GROUP_ID_PROPERTY;
use embridge_core::{
    init_tracing, ConnectionSettings, SinkAdapter, SinkRuntime, SinkSettings, SourceAdapter,
    SourceRuntime, SourceSettings, WireMessage,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing("info");

    let broker = InMemoryBroker::new();
    broker.set_send_latency(Some(Duration::from_millis(10)));
    for i in 1..=10 {
        broker.publish(
            "queue:inbound",
            WireMessage::text(format!("order {}", i))
                .with_property(GROUP_ID_PROPERTY, "orders"),
        );
    }

    let source = SourceAdapter::new(
        Arc::new(broker.clone()),
        SourceSettings::new(ConnectionSettings::new("loopback-in", "queue:inbound")),
    )?;
    let sink = SinkAdapter::new(
        Arc::new(broker.clone()),
        SinkSettings::new(ConnectionSettings::new("loopback-out", "topic:outbound")),
    )?;

    let (tx, rx) = mpsc::channel(64);
    let mut source_runtime = SourceRuntime::new(tx, source).with_ctrl_c();
    let mut sink_runtime = SinkRuntime::new(sink, rx);
    let shutdown = source_runtime.shutdown_token();

    let source_task = tokio::spawn(async move { source_runtime.run().await });
    let sink_task = tokio::spawn(async move { sink_runtime.run().await });

    while broker.acknowledge_count() < 10 {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    shutdown.cancel();

    source_task.await??;
    sink_task.await??;

    println!(
        "Bridged {} messages, {} left on the inbound queue",
        broker.published("topic:outbound").len(),
        broker.pending("queue:inbound")
    );
    Ok(())
}
