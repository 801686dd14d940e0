use tokio::sync::mpsc::Sender;
use tonic::Status;
use tracing::debug;

use crate::core::registry::PartitionResult;
use crate::framework::errors::{FerrumStreamError, Result};
use crate::proto;

pub type ResponseSender = Sender<std::result::Result<proto::ResponseBatch, Status>>;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EmitStats {
    pub batches: usize,
    pub messages: usize,
}

/// Writes finalized partitions to the outbound response stream.
///
/// Every partition gets its own batch, split when it exceeds `batch_size` messages.
/// Sending waits for capacity on the bounded channel.
#[derive(Debug, Clone)]
pub struct OutputEmitter {
    tx: ResponseSender,
    batch_size: usize,
}

impl OutputEmitter {
    pub fn new(tx: ResponseSender, batch_size: usize) -> Self {
        OutputEmitter {
            tx,
            batch_size: batch_size.max(1),
        }
    }

    pub async fn emit(&self, results: Vec<PartitionResult>) -> Result<EmitStats> {
        let mut stats = EmitStats::default();
        for result in results {
            let mut messages = result.messages.into_iter().peekable();
            while messages.peek().is_some() {
                let elements: Vec<proto::ResponseDatum> = messages
                    .by_ref()
                    .take(self.batch_size)
                    .map(Into::into)
                    .collect();
                let count = elements.len();

                self.tx
                    .send(Ok(proto::ResponseBatch { elements }))
                    .await
                    .map_err(|_| {
                        FerrumStreamError::StreamAbort(
                            "response stream closed during emission".to_string(),
                        )
                    })?;

                stats.batches += 1;
                stats.messages += count;
            }
            debug!("emitted partition {}", result.key);
        }
        Ok(stats)
    }

    /// Terminal error for the caller. Best effort, the caller may already be gone.
    pub async fn fail(&self, error: FerrumStreamError) {
        let _ = self.tx.send(Err(Status::from(error))).await;
    }

    /// Resolves once the receiving side of the response stream is dropped.
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}
