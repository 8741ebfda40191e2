// SPDX-License-Identifier: MIT
//! Blob uploader: one independent pipeline per data blob.
//!
//! ```text
//! received → serializing → spooled → presigned → uploading → done
//!                           ↑                                  │
//!                           └──────── backoff ←───── failed ───┘
//! ```
//!
//! Submission is a non-blocking channel push; a dispatcher task spawns one
//! pipeline task per blob and tracks them so shutdown can await the lot.
//! Presign/PUT failures retry under the bounded jittered backoff; on
//! exhaustion the spool entry is left for FIFO eviction and the failure is
//! visible only through the debug-gated sink.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;

use crate::diag::DebugSink;
use crate::event::Metadata;
use crate::ingest::{IngestApi, PresignRequest};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::serializer::SerializerPool;
use crate::spool::{SpoolHandle, SpoolKind};

use super::UploadStats;

/// Submissions the dispatcher can absorb before `submit` starts dropping.
const QUEUE_CAPACITY: usize = 1024;

/// One pending blob upload.
#[derive(Debug)]
pub(crate) struct BlobTask {
    pub data_id: String,
    pub trace_id: String,
    pub key: String,
    pub value: serde_json::Value,
    pub metadata: Option<Metadata>,
    /// Upload attempts already spent in a previous life (resumed tasks).
    pub attempts: u32,
}

enum Command {
    Upload(BlobTask),
    /// Recovered from the spool: payload already serialized and persisted,
    /// resume at the presign step.
    Resume { data_id: String, bytes: Vec<u8> },
    Shutdown(oneshot::Sender<()>),
}

pub(crate) struct BlobUploader {
    tx: mpsc::Sender<Command>,
    spool: SpoolHandle,
    diag: DebugSink,
}

struct Ctx {
    spool: SpoolHandle,
    ingest: Arc<dyn IngestApi>,
    serializer: Arc<SerializerPool>,
    retry: RetryConfig,
    stats: Arc<UploadStats>,
    diag: DebugSink,
}

impl BlobUploader {
    pub fn new(
        spool: SpoolHandle,
        ingest: Arc<dyn IngestApi>,
        serializer: Arc<SerializerPool>,
        retry: RetryConfig,
        stats: Arc<UploadStats>,
        runtime: tokio::runtime::Handle,
        debug: bool,
    ) -> Self {
        let diag = DebugSink::new(debug);
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let ctx = Arc::new(Ctx {
            spool: spool.clone(),
            ingest,
            serializer,
            retry,
            stats,
            diag,
        });
        runtime.spawn(run_dispatcher(rx, ctx));
        Self { tx, spool, diag }
    }

    /// Hand a blob to the pipeline. Never blocks; a full queue drops the
    /// task with a debug log.
    pub fn submit(&self, task: BlobTask) {
        match self.tx.try_send(Command::Upload(task)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(Command::Upload(task))) => {
                self.diag
                    .debug(&format!("blob queue full, dropping {}", task.data_id));
            }
            Err(_) => {
                self.diag.debug("blob uploader stopped, dropping task");
            }
        }
    }

    /// Re-spawn an upload for every `data`-kind entry left in the spool by
    /// a previous run. Runs in the background after the spool scan; resumed
    /// tasks start at the presign step with the spooled bytes.
    pub async fn recover(&self) {
        let entries = self.spool.list().await;
        let mut resumed = 0usize;
        for entry in entries {
            if entry.kind != SpoolKind::Data {
                continue;
            }
            let bytes = match self.spool.read(&entry.id).await {
                Ok(Some(bytes)) => bytes,
                Ok(None) => continue,
                Err(e) => {
                    self.diag.debug(&format!(
                        "recovery: could not read spooled blob {}: {e:#}",
                        entry.id
                    ));
                    continue;
                }
            };
            if self
                .tx
                .send(Command::Resume {
                    data_id: entry.id,
                    bytes,
                })
                .await
                .is_err()
            {
                break;
            }
            resumed += 1;
        }
        if resumed > 0 {
            self.diag
                .info(&format!("recovery: resumed {resumed} spooled blob uploads"));
        }
    }

    /// Wait for every in-flight pipeline to finish. Idempotent; a second
    /// call returns immediately.
    pub async fn shutdown(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Command::Shutdown(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }
}

async fn run_dispatcher(mut rx: mpsc::Receiver<Command>, ctx: Arc<Ctx>) {
    let mut tasks: JoinSet<()> = JoinSet::new();
    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(Command::Upload(task)) => {
                    let ctx = ctx.clone();
                    tasks.spawn(async move { upload_blob(ctx, task).await });
                }
                Some(Command::Resume { data_id, bytes }) => {
                    let ctx = ctx.clone();
                    tasks.spawn(async move { resume_blob(ctx, data_id, bytes).await });
                }
                Some(Command::Shutdown(done)) => {
                    while tasks.join_next().await.is_some() {}
                    let _ = done.send(());
                    break;
                }
                None => {
                    while tasks.join_next().await.is_some() {}
                    break;
                }
            },
            // Reap finished pipelines so the set does not grow unbounded.
            Some(_finished) = tasks.join_next(), if !tasks.is_empty() => {}
        }
    }
}

async fn upload_blob(ctx: Arc<Ctx>, task: BlobTask) {
    let BlobTask {
        data_id,
        trace_id,
        key,
        value,
        metadata,
        attempts,
    } = task;

    let bytes = match ctx.serializer.serialize(value).await {
        Ok(bytes) => bytes,
        Err(e) => {
            ctx.diag
                .debug(&format!("blob {data_id} could not be serialized, dropping: {e:#}"));
            ctx.stats.record_blob_dropped();
            return;
        }
    };

    // Persist before the network. Retried under the same policy as the
    // upload; a persistently failing spool drops the blob.
    let spooled = retry_with_backoff(&ctx.retry, ctx.diag, 0, || {
        let spool = ctx.spool.clone();
        let data_id = data_id.clone();
        let bytes = &bytes;
        async move { spool.write(&data_id, bytes, SpoolKind::Data).await }
    })
    .await;
    if let Err(e) = spooled {
        ctx.diag
            .error(&format!("blob {data_id} could not be spooled, dropping: {e:#}"));
        ctx.stats.record_blob_dropped();
        return;
    }

    let request = PresignRequest {
        data_id,
        trace_id,
        key,
        metadata,
    };
    presign_and_put(ctx, request, bytes, attempts).await;
}

async fn resume_blob(ctx: Arc<Ctx>, data_id: String, bytes: Vec<u8>) {
    // The spool payload carries only the serialized value; the presign
    // association is re-established by data id alone.
    let request = PresignRequest {
        data_id,
        trace_id: String::new(),
        key: String::new(),
        metadata: None,
    };
    presign_and_put(ctx, request, bytes, 0).await;
}

/// Steps 3–5 of the pipeline: presign, PUT, delete the spool entry.
async fn presign_and_put(
    ctx: Arc<Ctx>,
    request: PresignRequest,
    bytes: Vec<u8>,
    prior_attempts: u32,
) {
    let data_id = request.data_id.clone();
    let outcome = retry_with_backoff(&ctx.retry, ctx.diag, prior_attempts, || {
        let ctx = ctx.clone();
        let request = request.clone();
        let bytes = bytes.clone();
        async move {
            let presigned = ctx.ingest.presign(&request).await?;
            ctx.ingest
                .put_object(&presigned.presigned_url, bytes)
                .await
        }
    })
    .await;

    match outcome {
        Ok(()) => {
            ctx.spool.delete(&data_id).await;
            ctx.stats.record_blob_uploaded();
            ctx.diag.debug(&format!("blob {data_id} uploaded"));
        }
        Err(e) => {
            // The spool entry stays behind; eviction reclaims it, or the
            // next run's recovery scan retries it.
            ctx.stats.record_blob_dropped();
            ctx.diag.error(&format!(
                "blob {data_id} abandoned after {} attempts: {e:#}",
                ctx.retry.max_attempts
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spool::MemorySpool;
    use crate::uploader::testing::MockIngest;
    use serde_json::json;
    use std::sync::atomic::Ordering;

    fn task(data_id: &str, value: serde_json::Value) -> BlobTask {
        BlobTask {
            data_id: data_id.to_string(),
            trace_id: "proj-t1".to_string(),
            key: "input".to_string(),
            value,
            metadata: None,
            attempts: 0,
        }
    }

    struct Fixture {
        uploader: BlobUploader,
        mock: Arc<MockIngest>,
        spool: SpoolHandle,
        stats: Arc<UploadStats>,
        serializer: Arc<SerializerPool>,
    }

    fn fixture() -> Fixture {
        let mock = Arc::new(MockIngest::default());
        let spool = SpoolHandle::new(Arc::new(MemorySpool::new(1024 * 1024)));
        let stats = Arc::new(UploadStats::default());
        let serializer = Arc::new(SerializerPool::start(1, false));
        let uploader = BlobUploader::new(
            spool.clone(),
            mock.clone(),
            serializer.clone(),
            RetryConfig::instant(),
            stats.clone(),
            tokio::runtime::Handle::current(),
            false,
        );
        Fixture {
            uploader,
            mock,
            spool,
            stats,
            serializer,
        }
    }

    #[tokio::test]
    async fn happy_path_serializes_presigns_puts_and_cleans_up() {
        let f = fixture();
        let value = json!({"x": 42});
        f.uploader.submit(task("d1", value.clone()));
        f.uploader.shutdown().await;

        let presigns = f.mock.presigns.lock().unwrap();
        assert_eq!(presigns.len(), 1);
        assert_eq!(presigns[0].data_id, "d1");
        assert_eq!(presigns[0].trace_id, "proj-t1");
        assert_eq!(presigns[0].key, "input");

        let puts = f.mock.puts.lock().unwrap();
        assert_eq!(puts.len(), 1);
        assert_eq!(puts[0].0, "https://store.test/d1");
        assert_eq!(puts[0].1, serde_json::to_vec(&value).unwrap());

        assert_eq!(f.spool.size().await, 0, "spool entry deleted after PUT");
        assert_eq!(f.stats.snapshot(0).blobs_uploaded, 1);
        f.serializer.drain().await;
    }

    #[tokio::test]
    async fn transient_presign_failure_is_retried() {
        let f = fixture();
        f.mock.fail_presigns.store(2, Ordering::SeqCst);
        f.uploader.submit(task("d1", json!(1)));
        f.uploader.shutdown().await;

        assert_eq!(f.mock.put_count(), 1);
        assert_eq!(f.stats.snapshot(0).blobs_uploaded, 1);
        assert_eq!(f.spool.size().await, 0);
    }

    #[tokio::test]
    async fn retry_exhaustion_leaves_the_spool_entry() {
        let f = fixture();
        f.mock.fail_presigns.store(usize::MAX, Ordering::SeqCst);
        f.uploader.submit(task("d1", json!([1, 2, 3])));
        f.uploader.shutdown().await;

        assert_eq!(f.mock.put_count(), 0);
        assert_eq!(f.stats.snapshot(0).blobs_dropped, 1);
        let entries = f.spool.list().await;
        assert_eq!(entries.len(), 1, "payload kept for the next run");
        assert_eq!(entries[0].id, "d1");
        assert_eq!(entries[0].kind, SpoolKind::Data);
    }

    #[tokio::test]
    async fn recovery_resumes_spooled_blobs_at_presign() {
        let f = fixture();
        // Residue from a "previous run": already-serialized payloads.
        f.spool
            .write("old-1", b"{\"a\":1}", SpoolKind::Data)
            .await
            .unwrap();
        f.spool
            .write("old-2", b"{\"b\":2}", SpoolKind::Data)
            .await
            .unwrap();
        // Stale event batches must not be resumed as blobs.
        f.spool
            .write("batch", b"[]", SpoolKind::Events)
            .await
            .unwrap();

        f.uploader.recover().await;
        f.uploader.shutdown().await;

        let presigned: Vec<String> = f
            .mock
            .presigns
            .lock()
            .unwrap()
            .iter()
            .map(|p| p.data_id.clone())
            .collect();
        assert_eq!(presigned.len(), 2);
        assert!(presigned.contains(&"old-1".to_string()));
        assert!(presigned.contains(&"old-2".to_string()));
        assert_eq!(f.mock.put_count(), 2);

        // Both blob entries gone; the events entry untouched.
        let remaining = f.spool.list().await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].kind, SpoolKind::Events);
    }

    #[tokio::test]
    async fn concurrent_submissions_all_land() {
        let f = fixture();
        for i in 0..20 {
            f.uploader.submit(task(&format!("d{i}"), json!({"i": i})));
        }
        f.uploader.shutdown().await;
        assert_eq!(f.mock.put_count(), 20);
        assert_eq!(f.stats.snapshot(0).blobs_uploaded, 20);
    }
}
