//! Pipeline-side extension point.

use crate::message::Record;
use crate::{BridgeError, BridgeResult};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Consumes records produced by a [`SourceRuntime`](crate::SourceRuntime).
///
/// The handler owns each record it receives and is responsible for resolving
/// it, either directly with [`Record::ack`]/[`Record::fail`] or by passing the
/// record on to a component that does (for example a sink).
///
/// # Example
///
/// ```ignore
/// use async_trait::async_trait;
/// use embridge_core::{BridgeResult, Record, RecordHandler};
///
/// pub struct PrintHandler;
///
/// #[async_trait]
/// impl RecordHandler for PrintHandler {
///     async fn handle(&mut self, record: Record) -> BridgeResult<()> {
///         println!("{:?}", record.payload_str());
///         record.ack().await
///     }
/// }
/// ```
#[async_trait]
pub trait RecordHandler: Send {
    /// Called once before the first record
    async fn initialize(&mut self) -> BridgeResult<()> {
        Ok(())
    }

    /// Process one record.
    ///
    /// Errors for which [`BridgeError::is_fatal`] holds stop the runtime (or
    /// trigger a reconnect when configured); other errors are logged.
    async fn handle(&mut self, record: Record) -> BridgeResult<()>;

    /// Called once after the loop stops
    async fn shutdown(&mut self) -> BridgeResult<()> {
        Ok(())
    }
}

/// Forward records into a channel, typically drained by a [`SinkRuntime`](crate::SinkRuntime).
#[async_trait]
impl RecordHandler for mpsc::Sender<Record> {
    async fn handle(&mut self, record: Record) -> BridgeResult<()> {
        if let Err(mpsc::error::SendError(record)) = self.send(record).await {
            // receiver is gone, let the broker redeliver
            record.fail().await?;
            return Err(BridgeError::Closed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Outcome;

    #[tokio::test]
    async fn test_channel_handler_forwards() {
        let (mut tx, mut rx) = mpsc::channel(4);
        tx.handle(Record::from_string("a")).await.unwrap();

        let forwarded = rx.recv().await.unwrap();
        assert_eq!(forwarded.payload_str(), Some("a"));
    }

    #[tokio::test]
    async fn test_channel_handler_fails_when_receiver_gone() {
        let (mut tx, rx) = mpsc::channel(1);
        drop(rx);

        let (record, outcome) = Record::from_string("orphan").track();
        let err = tx.handle(record).await.unwrap_err();
        assert!(err.is_closed());
        assert_eq!(outcome.await, Outcome::Failed);
    }
}
