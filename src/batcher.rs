// SPDX-License-Identifier: MIT
//! Time-or-size triggered event batcher.
//!
//! # State machine
//!
//! ```text
//! Idle (timer stopped, buffer empty)
//!   │ add()
//!   ▼
//! Accumulating (timer running)
//!   │ interval tick, or buffer reaches max_batch_size
//!   ▼
//! Flushing (is_processing set, snapshot taken, buffer cleared)
//!   │ ok → Idle (or Accumulating if add() raced in)
//!   └ err → snapshot prepended back, timer restarted
//! ```
//!
//! The timer starts on the first `add` after Idle, never at construction,
//! so a quiescent process does not tick forever; after a flush that leaves
//! the buffer empty the timer stops again. A tick that fires while a flush
//! is in progress is a no-op. Backoff on repeated failure belongs to the
//! flush target, not here.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::diag::DebugSink;
use crate::event::Event;

/// Receives batches from the [`Batcher`]. Returning an error re-queues the
/// batch (prepended, so age order is preserved).
#[async_trait]
pub trait FlushTarget: Send + Sync {
    async fn flush(&self, events: &[Event]) -> Result<()>;
}

pub struct Batcher {
    inner: Arc<Inner>,
}

struct Inner {
    interval: Duration,
    max_batch_size: usize,
    target: Arc<dyn FlushTarget>,
    runtime: tokio::runtime::Handle,
    buffer: Mutex<VecDeque<Event>>,
    is_processing: AtomicBool,
    timer: Mutex<Option<tokio::task::JoinHandle<()>>>,
    diag: DebugSink,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Batcher {
    pub fn new(
        interval: Duration,
        max_batch_size: usize,
        target: Arc<dyn FlushTarget>,
        runtime: tokio::runtime::Handle,
        debug: bool,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                interval,
                max_batch_size,
                target,
                runtime,
                buffer: Mutex::new(VecDeque::new()),
                is_processing: AtomicBool::new(false),
                timer: Mutex::new(None),
                diag: DebugSink::new(debug),
            }),
        }
    }

    /// Append an event. Synchronous and cheap: a buffer push, plus either a
    /// spawned flush (size threshold reached) or a timer start.
    pub fn add(&self, event: Event) {
        let len = {
            let mut buffer = lock(&self.inner.buffer);
            buffer.push_back(event);
            buffer.len()
        };
        if len >= self.inner.max_batch_size {
            let inner = self.inner.clone();
            self.inner.runtime.spawn(async move {
                Inner::flush_once(&inner).await;
            });
        } else {
            Inner::ensure_timer(&self.inner);
        }
    }

    /// Number of buffered events awaiting flush.
    pub fn pending(&self) -> usize {
        lock(&self.inner.buffer).len()
    }

    /// Stop the timer and flush until the buffer is empty or a flush
    /// fails. Used at shutdown; residue stays buffered (and spooled by the
    /// flush target) for the next run.
    pub async fn force_drain(&self) {
        if let Some(handle) = lock(&self.inner.timer).take() {
            handle.abort();
        }
        loop {
            if self.inner.is_processing.load(Ordering::SeqCst) {
                // A flush is mid-flight; give it a moment to settle.
                tokio::time::sleep(Duration::from_millis(20)).await;
                continue;
            }
            if lock(&self.inner.buffer).is_empty() {
                break;
            }
            if !Inner::flush_once(&self.inner).await {
                break;
            }
        }
        // A failed flush restarts the timer; stop it again on the way out.
        if let Some(handle) = lock(&self.inner.timer).take() {
            handle.abort();
        }
    }

    #[cfg(test)]
    fn timer_running(&self) -> bool {
        lock(&self.inner.timer)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Inner {
    /// Start the interval task if it is not already running.
    fn ensure_timer(inner: &Arc<Inner>) {
        let mut slot = lock(&inner.timer);
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let task = inner.clone();
        let handle = inner.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(task.interval);
            ticker.tick().await; // the first tick completes immediately; skip it
            loop {
                ticker.tick().await;
                Inner::flush_once(&task).await;
                // Exit only while holding the timer slot, so a concurrent
                // add() either lands its event before this check or finds
                // the slot empty and starts a fresh timer. Without this a
                // racing add could observe a timer that has already
                // decided to stop and strand its event.
                let mut slot = lock(&task.timer);
                let idle = lock(&task.buffer).is_empty()
                    && !task.is_processing.load(Ordering::SeqCst);
                if idle {
                    *slot = None;
                    break;
                }
            }
        });
        *slot = Some(handle);
    }

    /// Take a snapshot of the buffer and hand it to the flush target.
    ///
    /// Returns false when the flush failed or another flush was already in
    /// progress (the reentrancy guard). An empty buffer is a successful
    /// no-op.
    async fn flush_once(inner: &Arc<Inner>) -> bool {
        if inner.is_processing.swap(true, Ordering::SeqCst) {
            return false;
        }
        let batch: Vec<Event> = {
            let mut buffer = lock(&inner.buffer);
            buffer.drain(..).collect()
        };
        if batch.is_empty() {
            inner.is_processing.store(false, Ordering::SeqCst);
            return true;
        }

        match inner.target.flush(&batch).await {
            Ok(()) => {
                inner.is_processing.store(false, Ordering::SeqCst);
                // Adds that raced in during the flush put us back in
                // Accumulating; they need a running timer to ever leave.
                if !lock(&inner.buffer).is_empty() {
                    Inner::ensure_timer(inner);
                }
                true
            }
            Err(e) => {
                inner.diag.debug(&format!(
                    "flush of {} events failed, re-queueing: {e:#}",
                    batch.len()
                ));
                {
                    let mut buffer = lock(&inner.buffer);
                    for event in batch.into_iter().rev() {
                        buffer.push_front(event);
                    }
                }
                inner.is_processing.store(false, Ordering::SeqCst);
                Inner::ensure_timer(inner);
                false
            }
        }
    }
}
