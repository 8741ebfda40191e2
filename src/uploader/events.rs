// SPDX-License-Identifier: MIT
//! Event batch uploader: the batcher's flush target.
//!
//! Each flush persists the batch to the spool before calling ingest, so an
//! event is always either in the batcher's buffer or spooled (or both)
//! until the backend has acknowledged it. On success the spool copy is
//! deleted; on failure the batch is re-queued in memory by the batcher and
//! the stale spool entry is left for FIFO eviction to reclaim.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use crate::batcher::FlushTarget;
use crate::diag::DebugSink;
use crate::event::Event;
use crate::ingest::IngestApi;
use crate::retry::RetryConfig;
use crate::spool::{SpoolHandle, SpoolKind};

use super::UploadStats;

pub(crate) struct EventUploader {
    spool: SpoolHandle,
    ingest: Arc<dyn IngestApi>,
    backoff: RetryConfig,
    consecutive_failures: AtomicU32,
    stats: Arc<UploadStats>,
    diag: DebugSink,
}

impl EventUploader {
    pub fn new(
        spool: SpoolHandle,
        ingest: Arc<dyn IngestApi>,
        backoff: RetryConfig,
        stats: Arc<UploadStats>,
        debug: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            spool,
            ingest,
            backoff,
            consecutive_failures: AtomicU32::new(0),
            stats,
            diag: DebugSink::new(debug),
        })
    }
}

#[async_trait]
impl FlushTarget for EventUploader {
    async fn flush(&self, events: &[Event]) -> Result<()> {
        // Persist first. A spool failure must not block delivery: the batch
        // is still safe in the batcher until ingest succeeds.
        let storage_id = Uuid::new_v4().to_string();
        let spooled = match serde_json::to_vec(events) {
            Ok(bytes) => match self.spool.write(&storage_id, &bytes, SpoolKind::Events).await {
                Ok(()) => true,
                Err(e) => {
                    self.diag
                        .debug(&format!("event batch spool write failed: {e:#}"));
                    false
                }
            },
            Err(e) => {
                self.diag
                    .debug(&format!("event batch could not be encoded: {e:#}"));
                false
            }
        };

        match self.ingest.ingest(events).await {
            Ok(()) => {
                if spooled {
                    // Best-effort: a failed delete is logged inside the
                    // spool and the entry ages out via eviction.
                    self.spool.delete(&storage_id).await;
                }
                self.stats.record_batch(events.len());
                self.consecutive_failures.store(0, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => {
                self.stats.record_batch_failure();
                let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                let delay = self.backoff.delay_after_failure(failures);
                self.diag.debug(&format!(
                    "ingest of {} events failed ({failures} consecutive), backing off {}ms: {e:#}",
                    events.len(),
                    delay.as_millis()
                ));
                tokio::time::sleep(delay).await;
                Err(e)
            }
        }
    }
}
