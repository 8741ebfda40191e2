// SPDX-License-Identifier: MIT
//! The two upload pipelines.
//!
//! Events ride a time-or-size batcher with indefinite re-queue; blobs are
//! fire-and-forget per-task pipelines with a bounded retry budget. Both
//! write through the spool before touching the network.

mod blobs;
mod events;

pub(crate) use blobs::{BlobTask, BlobUploader};
pub(crate) use events::EventUploader;

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by both pipelines. Snapshot via [`crate::Xray::stats`].
#[derive(Debug, Default)]
pub(crate) struct UploadStats {
    events_delivered: AtomicU64,
    batches_delivered: AtomicU64,
    batch_failures: AtomicU64,
    blobs_uploaded: AtomicU64,
    blobs_dropped: AtomicU64,
}

impl UploadStats {
    pub fn record_batch(&self, events: usize) {
        self.events_delivered
            .fetch_add(events as u64, Ordering::Relaxed);
        self.batches_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch_failure(&self) {
        self.batch_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_blob_uploaded(&self) {
        self.blobs_uploaded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_blob_dropped(&self) {
        self.blobs_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, spool_bytes: u64) -> crate::XrayStats {
        crate::XrayStats {
            events_delivered: self.events_delivered.load(Ordering::Relaxed),
            batches_delivered: self.batches_delivered.load(Ordering::Relaxed),
            batch_failures: self.batch_failures.load(Ordering::Relaxed),
            blobs_uploaded: self.blobs_uploaded.load(Ordering::Relaxed),
            blobs_dropped: self.blobs_dropped.load(Ordering::Relaxed),
            spool_bytes,
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Recording fake for the transport seam, shared by pipeline tests.

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use anyhow::{bail, Result};
    use async_trait::async_trait;

    use crate::event::Event;
    use crate::ingest::{IngestApi, PresignRequest, PresignResponse};

    #[derive(Default)]
    pub struct MockIngest {
        pub presigns: Mutex<Vec<PresignRequest>>,
        pub puts: Mutex<Vec<(String, Vec<u8>)>>,
        pub ingests: Mutex<Vec<Vec<Event>>>,
        /// Fail this many presign calls before starting to succeed.
        pub fail_presigns: AtomicUsize,
        /// Fail this many ingest calls before starting to succeed.
        pub fail_ingests: AtomicUsize,
    }

    impl MockIngest {
        pub fn ingested_events(&self) -> Vec<Event> {
            self.ingests
                .lock()
                .unwrap()
                .iter()
                .flatten()
                .cloned()
                .collect()
        }

        pub fn put_count(&self) -> usize {
            self.puts.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl IngestApi for MockIngest {
        async fn presign(&self, request: &PresignRequest) -> Result<PresignResponse> {
            if decrement(&self.fail_presigns) {
                bail!("presign returned 503 Service Unavailable");
            }
            self.presigns.lock().unwrap().push(request.clone());
            Ok(PresignResponse {
                presigned_url: format!("https://store.test/{}", request.data_id),
                data_path: None,
            })
        }

        async fn ingest(&self, events: &[Event]) -> Result<()> {
            if decrement(&self.fail_ingests) {
                bail!("ingest returned 503 Service Unavailable");
            }
            self.ingests.lock().unwrap().push(events.to_vec());
            Ok(())
        }

        async fn put_object(&self, url: &str, bytes: Vec<u8>) -> Result<()> {
            self.puts.lock().unwrap().push((url.to_string(), bytes));
            Ok(())
        }
    }

    /// Decrement a failure budget; true while failures remain.
    fn decrement(budget: &AtomicUsize) -> bool {
        budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}
