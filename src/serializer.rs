// SPDX-License-Identifier: MIT
//! Background JSON serializer pool.
//!
//! Encoding a large user value must never run on the host's async runtime,
//! so a fixed set of dedicated OS threads drains a shared job queue and
//! replies over oneshot channels. A panicking encode fails only its own
//! job; the pool keeps serving with whatever workers remain. A pool that
//! failed to spawn any worker (or was drained) degrades to inline encoding
//! on the calling task.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use anyhow::{anyhow, Context, Result};
use tokio::sync::{mpsc, oneshot};

use crate::diag::DebugSink;

struct Job {
    value: serde_json::Value,
    reply: oneshot::Sender<Result<Vec<u8>, String>>,
}

pub struct SerializerPool {
    jobs: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    workers: Mutex<Vec<std::thread::JoinHandle<()>>>,
    live: AtomicUsize,
    diag: DebugSink,
}

impl SerializerPool {
    /// Spawn `pool_size` worker threads. A thread that fails to spawn is
    /// logged and skipped; the pool runs with the survivors.
    pub fn start(pool_size: usize, debug: bool) -> Self {
        let diag = DebugSink::new(debug);
        let (tx, rx) = mpsc::unbounded_channel::<Job>();
        let rx = std::sync::Arc::new(Mutex::new(rx));

        let mut workers = Vec::new();
        for i in 0..pool_size {
            let rx = rx.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("xray-serializer-{i}"))
                .spawn(move || worker_loop(rx));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => diag.warn(&format!("serializer worker {i} failed to spawn: {e}")),
            }
        }
        let live = workers.len();
        if live < pool_size {
            diag.warn(&format!(
                "serializer pool running with {live}/{pool_size} workers"
            ));
        }

        Self {
            jobs: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            live: AtomicUsize::new(live),
            diag,
        }
    }

    /// Encode `value` as JSON off the runtime.
    ///
    /// Falls back to inline encoding when no worker is available. The await
    /// is a channel round-trip; the caller's scheduler is never blocked.
    pub async fn serialize(&self, value: serde_json::Value) -> Result<Vec<u8>> {
        let sender = {
            let guard = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
            guard.clone()
        };
        let sender = match sender {
            Some(s) if self.live.load(Ordering::Relaxed) > 0 => s,
            _ => return encode_inline(&value),
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        if let Err(send_err) = sender.send(Job {
            value,
            reply: reply_tx,
        }) {
            // Channel closed under us (drain race): encode inline.
            return encode_inline(&send_err.0.value);
        }

        match reply_rx.await {
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(message)) => Err(anyhow!("serialize failed: {message}")),
            Err(_) => {
                self.diag.debug("serializer worker died with job in flight");
                Err(anyhow!("serializer worker died"))
            }
        }
    }

    /// Wait for the queue to empty, then terminate every worker.
    ///
    /// Closing the channel lets workers finish queued jobs first: a worker
    /// only observes the closed channel once the queue is drained.
    pub async fn drain(&self) {
        {
            let mut guard = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
            guard.take();
        }
        let handles: Vec<_> = {
            let mut guard = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *guard)
        };
        self.live.store(0, Ordering::Relaxed);
        if handles.is_empty() {
            return;
        }
        let _ = tokio::task::spawn_blocking(move || {
            for handle in handles {
                let _ = handle.join();
            }
        })
        .await;
    }

    #[cfg(test)]
    pub fn live_workers(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }
}

fn encode_inline(value: &serde_json::Value) -> Result<Vec<u8>> {
    serde_json::to_vec(value).context("encode value")
}

fn worker_loop(rx: std::sync::Arc<Mutex<mpsc::UnboundedReceiver<Job>>>) {
    loop {
        // Hold the lock only while waiting for the next job, so a busy
        // worker never starves the others.
        let job = {
            let mut guard = rx.lock().unwrap_or_else(PoisonError::into_inner);
            guard.blocking_recv()
        };
        let Some(job) = job else {
            break; // channel closed and empty: pool drained
        };
        let encoded = catch_unwind(AssertUnwindSafe(|| serde_json::to_vec(&job.value)));
        let result = match encoded {
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("panic while encoding value".to_string()),
        };
        // The caller may have gone away; that is fine.
        let _ = job.reply.send(result);
    }
}
