//! Ingestion consumer
//!
//! Takes telemetry batches off the inbound queue one at a time and writes
//! each to the store in a single transaction. The broker message is settled
//! only after the outcome is known:
//!
//! - stored: ack
//! - undecodable: reject without requeue (it can never succeed)
//! - store failure: reject with requeue (the broker redelivers it)
//!
//! A crash between commit and ack means a redelivery of an already stored
//! batch; replaying it is a no-op in every backend.

use std::future::{self, Future};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::StreamExt;
use serde::Serialize;
use tracing::{debug, error, instrument, trace, warn};

use crate::AgentBatch;
use crate::storage::StorageBackend;
use crate::transport::{Delivery, DeliveryStream, TransportResult};
use crate::util::preview;

/// Bytes of an undecodable payload included in the error log
const PREVIEW_BYTES: usize = 256;

/// How a delivery is settled with the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Reject { requeue: bool },
}

/// Counters for the consumer, shared with the status endpoint
#[derive(Debug, Default)]
pub struct IngestStats {
    acked: AtomicU64,
    rejected: AtomicU64,
    requeued: AtomicU64,
    redelivered_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct IngestSnapshot {
    /// Batches stored and acknowledged
    pub acked: u64,

    /// Undecodable messages dropped
    pub rejected: u64,

    /// Store failures handed back to the broker
    pub requeued: u64,

    /// Store failures on messages that had already been redelivered
    pub redelivered_failures: u64,
}

impl IngestStats {
    pub fn snapshot(&self) -> IngestSnapshot {
        IngestSnapshot {
            acked: self.acked.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            redelivered_failures: self.redelivered_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone)]
pub struct IngestionConsumer {
    store: Arc<dyn StorageBackend>,
    stats: Arc<IngestStats>,
}

impl IngestionConsumer {
    pub fn new(store: Arc<dyn StorageBackend>) -> Self {
        Self {
            store,
            stats: Arc::new(IngestStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        self.stats.clone()
    }

    /// Decode and store one message, returning how it must be settled
    #[instrument(skip(self, payload), fields(bytes = payload.len()))]
    pub async fn handle(&self, payload: &[u8], redelivered: bool) -> Disposition {
        let batch = match AgentBatch::decode(payload) {
            Ok(batch) => batch,
            Err(e) => {
                error!(
                    "dropping undecodable message ({e}): {} bytes, payload: {}",
                    payload.len(),
                    preview(payload, PREVIEW_BYTES)
                );
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                return Disposition::Reject { requeue: false };
            }
        };

        match self.store.apply_agent_batch(&batch).await {
            Ok(outcome) => {
                trace!(
                    "stored batch from {} ({} rows appended)",
                    batch.agent_id, outcome.metric_rows_appended
                );
                self.stats.acked.fetch_add(1, Ordering::Relaxed);
                Disposition::Ack
            }
            Err(e) => {
                if redelivered {
                    error!(
                        "store write failed again for batch from {}, requeueing: {e}",
                        batch.agent_id
                    );
                    self.stats
                        .redelivered_failures
                        .fetch_add(1, Ordering::Relaxed);
                } else {
                    warn!(
                        "store write failed for batch from {}, requeueing: {e}",
                        batch.agent_id
                    );
                }
                self.stats.requeued.fetch_add(1, Ordering::Relaxed);
                Disposition::Reject { requeue: true }
            }
        }
    }

    /// Handle a delivery and settle it with the broker
    pub async fn process(&self, delivery: Delivery) -> TransportResult<Disposition> {
        let disposition = self.handle(&delivery.payload, delivery.redelivered).await;

        match disposition {
            Disposition::Ack => delivery.ack().await?,
            Disposition::Reject { requeue } => delivery.reject(requeue).await?,
        }

        Ok(disposition)
    }

    /// Consume until the stream ends or a delivery can no longer be settled
    pub async fn run(&self, deliveries: DeliveryStream) {
        self.run_until(deliveries, future::pending()).await
    }

    /// Like `run`, but also stops once `stop` resolves
    ///
    /// `stop` is only observed between deliveries: a message already handed
    /// to `handle` is always settled (or fails to settle) first.
    pub async fn run_until<F>(&self, mut deliveries: DeliveryStream, stop: F)
    where
        F: Future<Output = ()>,
    {
        debug!("ingestion consumer started");
        tokio::pin!(stop);

        loop {
            let item = tokio::select! {
                biased;
                _ = &mut stop => {
                    debug!("ingestion consumer asked to stop");
                    break;
                }
                item = deliveries.next() => item,
            };

            let delivery = match item {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => {
                    warn!("delivery stream failed: {e}");
                    break;
                }
                None => break,
            };

            if let Err(e) = self.process(delivery).await {
                // the broker will redeliver whatever was left unsettled
                warn!("could not settle delivery: {e}");
                break;
            }
        }

        debug!("ingestion consumer stopped");
    }
}
