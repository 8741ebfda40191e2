// SPDX-License-Identifier: MIT
//! Tracer root and trace handle — the public recording API.
//!
//! The central contract: every user-facing call is synchronous, never
//! raises, and returns ids immediately even though the referenced work
//! completes in the background. The only fallible operation in this crate
//! is [`Xray::init`] itself.
//!
//! The root owns everything: spool, serializer pool, both uploaders, and
//! the process-lifetime shutdown hook. [`Trace`] handles are short-lived
//! references into the root's pipelines; they own nothing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use uuid::Uuid;

use crate::batcher::Batcher;
use crate::config::{XrayConfig, XrayError};
use crate::diag::DebugSink;
use crate::event::{now_rfc3339, ArtifactRef, Event, Metadata};
use crate::ingest::{IngestApi, IngestClient};
use crate::retry::RetryConfig;
use crate::serializer::SerializerPool;
use crate::spool::{DiskSpool, MemorySpool, SpoolHandle};
use crate::uploader::{BlobTask, BlobUploader, EventUploader, UploadStats};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ─── Options ─────────────────────────────────────────────────────────────────

/// Options for [`Xray::create_trace`].
#[derive(Debug, Clone, Default)]
pub struct TraceOptions {
    /// Trace-level metadata, echoed into the start and end events.
    pub metadata: Option<Metadata>,
}

/// Options for [`Trace::step`].
#[derive(Debug, Clone, Default)]
pub struct StepOptions {
    pub step_name: String,
    /// Explicit step number. The internal counter is raised to at least
    /// this value so later auto-increments cannot reuse numbers.
    pub step_number: Option<u64>,
    pub artifacts: Vec<ArtifactRef>,
    pub metadata: Option<Metadata>,
}

/// Options for [`Trace::error`].
#[derive(Debug)]
pub struct ErrorOptions {
    pub error: anyhow::Error,
    pub metadata: Option<Metadata>,
}

impl ErrorOptions {
    pub fn new(error: impl Into<anyhow::Error>) -> Self {
        Self {
            error: error.into(),
            metadata: None,
        }
    }
}

/// Options for [`Trace::success`] and [`Trace::failure`].
#[derive(Debug, Clone, Default)]
pub struct EndOptions {
    pub metadata: Option<Metadata>,
}

/// Options for [`Trace::capture`] (minimal mode).
#[derive(Debug, Clone, Default)]
pub struct CaptureOptions {
    pub step_name: String,
    pub artifacts: Vec<CaptureArtifact>,
    pub metadata: Option<Metadata>,
}

/// A raw value to store alongside a [`Trace::capture`] step.
#[derive(Debug, Clone)]
pub struct CaptureArtifact {
    pub data: serde_json::Value,
    pub key: String,
}

/// Delivery counters, observable independently of the debug flag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XrayStats {
    pub events_delivered: u64,
    pub batches_delivered: u64,
    pub batch_failures: u64,
    pub blobs_uploaded: u64,
    pub blobs_dropped: u64,
    pub spool_bytes: u64,
}

// ─── Tracer root ─────────────────────────────────────────────────────────────

/// The tracer root. Cheap to clone; all clones share one set of pipelines.
#[derive(Clone)]
pub struct Xray {
    inner: Arc<XrayInner>,
}

struct XrayInner {
    config: XrayConfig,
    diag: DebugSink,
    spool: SpoolHandle,
    serializer: Arc<SerializerPool>,
    batcher: Arc<Batcher>,
    blobs: Arc<BlobUploader>,
    stats: Arc<UploadStats>,
    shutdown_started: AtomicBool,
    signal_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Xray {
    /// Construct the tracer against the configured ingest service.
    ///
    /// Validates required fields, wires the pipelines, kicks off the spool
    /// scan and blob recovery in the background, and installs the shutdown
    /// signal hook. Must be called from within a tokio runtime.
    pub fn init(config: XrayConfig) -> Result<Xray, XrayError> {
        let ingest = IngestClient::new(&config.base_url, &config.api_key)
            .map_err(|e| XrayError::InvalidConfig(format!("http client: {e:#}")))?;
        Self::init_with_ingest(config, Arc::new(ingest))
    }

    /// Like [`Xray::init`], but with a caller-supplied transport. Intended
    /// for tests and custom transports.
    pub fn init_with_ingest(
        config: XrayConfig,
        ingest: Arc<dyn IngestApi>,
    ) -> Result<Xray, XrayError> {
        Self::init_internal(config, ingest, RetryConfig::default())
    }

    fn init_internal(
        config: XrayConfig,
        ingest: Arc<dyn IngestApi>,
        retry: RetryConfig,
    ) -> Result<Xray, XrayError> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            XrayError::InvalidConfig("a running tokio runtime is required".into())
        })?;

        let diag = DebugSink::new(config.debug);
        // A disabled client never serializes anything; skip the threads.
        let pool_size = if config.enabled {
            config.worker_pool_size
        } else {
            0
        };
        let serializer = Arc::new(SerializerPool::start(pool_size, config.debug));

        let disk = Arc::new(DiskSpool::new(
            config.spool_root(),
            config.max_disk_size,
            config.debug,
        ));
        let spool = SpoolHandle::new(disk.clone());

        let stats = Arc::new(UploadStats::default());
        let events = EventUploader::new(
            spool.clone(),
            ingest.clone(),
            retry.clone(),
            stats.clone(),
            config.debug,
        );
        let batcher = Arc::new(Batcher::new(
            config.batch_interval,
            config.max_batch_size,
            events,
            runtime.clone(),
            config.debug,
        ));
        let blobs = Arc::new(BlobUploader::new(
            spool.clone(),
            ingest,
            serializer.clone(),
            retry,
            stats.clone(),
            runtime.clone(),
            config.debug,
        ));

        let inner = Arc::new(XrayInner {
            config,
            diag,
            spool,
            serializer,
            batcher,
            blobs,
            stats,
            shutdown_started: AtomicBool::new(false),
            signal_task: Mutex::new(None),
        });

        if inner.config.enabled {
            // Disk initialization is asynchronous so construction never
            // waits on the filesystem. On failure the memory backend is
            // swapped in; on success the recovery scan resumes any blob
            // residue from a previous run.
            let init_inner = inner.clone();
            runtime.spawn(async move {
                match disk.init().await {
                    Ok(()) => init_inner.blobs.recover().await,
                    Err(e) => {
                        init_inner.diag.warn_always(&format!(
                            "disk spool unavailable, falling back to in-memory spool: {e:#}"
                        ));
                        let memory = MemorySpool::new(init_inner.config.max_memory_size);
                        init_inner.spool.swap(Arc::new(memory)).await;
                    }
                }
            });

            // Drain on SIGTERM / Ctrl-C. Holds only a weak reference so a
            // dropped tracer is not kept alive by its own hook.
            let weak = Arc::downgrade(&inner);
            let handle = runtime.spawn(async move {
                shutdown_signal().await;
                if let Some(inner) = weak.upgrade() {
                    inner.shutdown().await;
                }
            });
            *lock(&inner.signal_task) = Some(handle);
        }

        Ok(Xray { inner })
    }

    /// Start a new trace and synchronously emit its `trace-start` event.
    ///
    /// Returns a no-op handle (empty `trace_id`) when the client is
    /// disabled.
    pub fn create_trace(&self, options: TraceOptions) -> Trace {
        let inner = &self.inner;
        if !inner.config.enabled {
            return Trace {
                inner: Arc::new(TraceInner {
                    trace_id: String::new(),
                    project_id: inner.config.project_id.clone(),
                    metadata: None,
                    created_at: String::new(),
                    enabled: false,
                    ended: AtomicBool::new(false),
                    step_counter: Mutex::new(0),
                    batcher: inner.batcher.clone(),
                    blobs: inner.blobs.clone(),
                }),
            };
        }

        let trace_id = format!("{}-{}", inner.config.project_id, Uuid::new_v4());
        let created_at = now_rfc3339();
        inner.batcher.add(Event::TraceStart {
            trace_id: trace_id.clone(),
            project_id: inner.config.project_id.clone(),
            metadata: options.metadata.clone(),
            created_at: created_at.clone(),
        });

        Trace {
            inner: Arc::new(TraceInner {
                trace_id,
                project_id: inner.config.project_id.clone(),
                metadata: options.metadata,
                created_at,
                enabled: true,
                ended: AtomicBool::new(false),
                step_counter: Mutex::new(0),
                batcher: inner.batcher.clone(),
                blobs: inner.blobs.clone(),
            }),
        }
    }

    /// Force-flush the event batcher. A checkpoint for hosts that want
    /// delivery without shutting down.
    pub async fn flush(&self) {
        self.inner.batcher.force_drain().await;
    }

    /// Snapshot of the delivery counters and current spool size.
    pub async fn stats(&self) -> XrayStats {
        let spool_bytes = self.inner.spool.size().await;
        self.inner.stats.snapshot(spool_bytes)
    }

    /// Drain everything: batcher force-drain, pending blob uploads,
    /// serializer pool. Idempotent and non-throwing; also invoked by the
    /// signal hook.
    pub async fn shutdown(&self) {
        self.inner.shutdown().await;
    }
}

impl XrayInner {
    async fn shutdown(&self) {
        if self.shutdown_started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.diag.debug("shutdown: draining pipelines");
        self.batcher.force_drain().await;
        self.blobs.shutdown().await;
        self.serializer.drain().await;
        if let Some(handle) = lock(&self.signal_task).take() {
            handle.abort();
        }
    }
}

/// Resolves when the host receives a termination signal.
///
/// On Unix both SIGTERM and Ctrl-C are observed; elsewhere Ctrl-C only.
/// Registration failures degrade to whatever signal is still available —
/// never to an error.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

// ─── Trace handle ────────────────────────────────────────────────────────────

/// A single pipeline run. All methods are synchronous and infallible;
/// referenced uploads complete in the background.
#[derive(Clone)]
pub struct Trace {
    inner: Arc<TraceInner>,
}

struct TraceInner {
    trace_id: String,
    project_id: String,
    metadata: Option<Metadata>,
    created_at: String,
    enabled: bool,
    ended: AtomicBool,
    /// Highest step number handed out so far. A mutex rather than an
    /// atomic: the max-with-supplied update must be one critical section
    /// even if the host shares the handle across threads.
    step_counter: Mutex<u64>,
    batcher: Arc<Batcher>,
    blobs: Arc<BlobUploader>,
}

impl Trace {
    /// The trace id, `"{projectId}-{uuid}"`. Empty for a disabled tracer.
    pub fn trace_id(&self) -> &str {
        &self.inner.trace_id
    }

    /// Queue `value` for upload to object storage and return its fresh
    /// `dataId` immediately.
    ///
    /// The returned id may be embedded in later [`Trace::step`] events
    /// right away; the backend tolerates the step arriving before the blob.
    /// Serialization happens in the background pool, so this returns in
    /// bounded time regardless of the value's size.
    pub fn data_id(
        &self,
        value: serde_json::Value,
        key: impl Into<String>,
        metadata: Option<Metadata>,
    ) -> String {
        if !self.inner.enabled {
            return String::new();
        }
        let data_id = Uuid::new_v4().to_string();
        self.inner.blobs.submit(BlobTask {
            data_id: data_id.clone(),
            trace_id: self.inner.trace_id.clone(),
            key: key.into(),
            value,
            metadata,
            attempts: 0,
        });
        data_id
    }

    /// Record a unit of work.
    pub fn step(&self, options: StepOptions) {
        if !self.inner.enabled {
            return;
        }
        let step_number = self.inner.next_step_number(options.step_number);
        self.inner.batcher.add(Event::Step {
            step_id: Uuid::new_v4().to_string(),
            trace_id: self.inner.trace_id.clone(),
            project_id: self.inner.project_id.clone(),
            step_name: options.step_name,
            step_number,
            artifacts: options.artifacts,
            metadata: options.metadata,
            timestamp: now_rfc3339(),
        });
    }

    /// Record an error as a step named `error`, with the normalized
    /// message and cause chain merged into the metadata.
    pub fn error(&self, options: ErrorOptions) {
        if !self.inner.enabled {
            return;
        }
        let ErrorOptions { error, metadata } = options;
        let message = error.to_string();
        let stack = error
            .chain()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\ncaused by: ");
        let mut metadata = metadata.unwrap_or_default();
        metadata.insert("message".into(), serde_json::Value::String(message));
        metadata.insert("stack".into(), serde_json::Value::String(stack));
        self.step(StepOptions {
            step_name: "error".into(),
            step_number: None,
            artifacts: Vec::new(),
            metadata: Some(metadata),
        });
    }

    /// End the trace successfully. The first end call wins; later
    /// `success`/`failure` calls are no-ops, while steps and blobs are
    /// still accepted.
    pub fn success(&self, options: EndOptions) {
        if !self.inner.enabled || self.inner.ended.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.batcher.add(Event::TraceSuccess {
            trace_id: self.inner.trace_id.clone(),
            project_id: self.inner.project_id.clone(),
            metadata: self.inner.metadata.clone(),
            success_metadata: options.metadata,
            status: "success".into(),
            created_at: self.inner.created_at.clone(),
            ended_at: now_rfc3339(),
        });
    }

    /// End the trace as failed. Symmetric to [`Trace::success`].
    pub fn failure(&self, options: EndOptions) {
        if !self.inner.enabled || self.inner.ended.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.batcher.add(Event::TraceFailure {
            trace_id: self.inner.trace_id.clone(),
            project_id: self.inner.project_id.clone(),
            metadata: self.inner.metadata.clone(),
            failure_metadata: options.metadata,
            status: "failure".into(),
            created_at: self.inner.created_at.clone(),
            ended_at: now_rfc3339(),
        });
    }

    /// Minimal mode: store each raw artifact value under a fresh `dataId`
    /// and record one step whose artifacts are untagged (`type: null`).
    pub fn capture(&self, options: CaptureOptions) {
        if !self.inner.enabled {
            return;
        }
        let mut artifacts = Vec::with_capacity(options.artifacts.len());
        for artifact in options.artifacts {
            let id = self.data_id(artifact.data, artifact.key, None);
            artifacts.push(ArtifactRef::untagged(id));
        }
        self.step(StepOptions {
            step_name: options.step_name,
            step_number: None,
            artifacts,
            metadata: options.metadata,
        });
    }
}

impl TraceInner {
    fn next_step_number(&self, supplied: Option<u64>) -> u64 {
        let mut counter = lock(&self.step_counter);
        match supplied {
            Some(n) => {
                *counter = (*counter).max(n);
                n
            }
            None => {
                *counter += 1;
                *counter
            }
        }
    }
}
