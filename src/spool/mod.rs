// SPDX-License-Identifier: MIT
//! Local bounded spool for payloads pending upload.
//!
//! Two logical streams share one store: event batches (`events`) and blob
//! payloads (`data`). Writes are durable-on-return for the disk backend and
//! trivially durable in memory. Space is reclaimed FIFO: when a write would
//! exceed the quota, the oldest entries are evicted *before* the write
//! returns success.

mod disk;
mod memory;

pub use disk::DiskSpool;
pub use memory::MemorySpool;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;

/// Which logical stream a spool entry belongs to.
///
/// The kind is encoded into the on-disk filename so the recovery scan can
/// classify entries without an index file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpoolKind {
    /// Blob payload, stored as `{id}.data.bin`.
    Data,
    /// Serialized event batch, stored as `{id}.events.json`.
    Events,
}

impl SpoolKind {
    /// Subdirectory this kind lives in.
    pub fn dir_name(&self) -> &'static str {
        match self {
            SpoolKind::Data => "data",
            SpoolKind::Events => "events",
        }
    }

    /// File name for an entry id of this kind.
    pub fn file_name(&self, id: &str) -> String {
        match self {
            SpoolKind::Data => format!("{id}.data.bin"),
            SpoolKind::Events => format!("{id}.events.json"),
        }
    }

    /// Classify a file by name. Returns the entry id and kind, or `None`
    /// for files that do not follow the naming convention.
    pub fn classify(file_name: &str) -> Option<(String, SpoolKind)> {
        if let Some(id) = file_name.strip_suffix(".data.bin") {
            if !id.is_empty() {
                return Some((id.to_string(), SpoolKind::Data));
            }
        }
        if let Some(id) = file_name.strip_suffix(".events.json") {
            if !id.is_empty() {
                return Some((id.to_string(), SpoolKind::Events));
            }
        }
        None
    }
}

/// Summary of one spooled entry, as returned by [`StorageAdapter::list`].
#[derive(Debug, Clone)]
pub struct SpoolEntry {
    pub id: String,
    pub kind: SpoolKind,
    pub size: u64,
}

/// Bounded FIFO-evicting persistence for the two upload pipelines.
///
/// All mutations on a backend are serialized internally; callers may share
/// an adapter freely across tasks.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Persist `bytes` under `id`. Durable on return. If an entry with the
    /// same id already exists it is replaced (its size is subtracted before
    /// the new size is accounted). Evicts oldest entries as needed to keep
    /// the total within the quota.
    async fn write(&self, id: &str, bytes: &[u8], kind: SpoolKind) -> Result<()>;

    /// Fetch the payload for `id`, or `None` if the entry is absent.
    async fn read(&self, id: &str) -> Result<Option<Vec<u8>>>;

    /// Remove the entry. I/O errors are swallowed; the registry record is
    /// dropped regardless.
    async fn delete(&self, id: &str);

    /// All entries, oldest first.
    async fn list(&self) -> Vec<SpoolEntry>;

    /// Total payload bytes currently held.
    async fn size(&self) -> u64;

    /// Evict oldest entries until `size() <= quota`.
    async fn evict_to_fit(&self, quota: u64);

    /// Human-readable backend name for diagnostics.
    fn backend_name(&self) -> &'static str;
}

/// Shared, swap-able handle to the active spool backend.
///
/// The tracer starts every component against the disk backend and swaps in
/// the memory backend if disk initialization fails; holders of the handle
/// never notice.
#[derive(Clone)]
pub struct SpoolHandle {
    inner: Arc<RwLock<Arc<dyn StorageAdapter>>>,
}

impl SpoolHandle {
    pub fn new(adapter: Arc<dyn StorageAdapter>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(adapter)),
        }
    }

    /// Replace the active backend. Entries in the old backend are not
    /// migrated; the disk residue is picked up by the next run's recovery
    /// scan.
    pub async fn swap(&self, adapter: Arc<dyn StorageAdapter>) {
        *self.inner.write().await = adapter;
    }

    async fn current(&self) -> Arc<dyn StorageAdapter> {
        self.inner.read().await.clone()
    }

    pub async fn write(&self, id: &str, bytes: &[u8], kind: SpoolKind) -> Result<()> {
        self.current().await.write(id, bytes, kind).await
    }

    pub async fn read(&self, id: &str) -> Result<Option<Vec<u8>>> {
        self.current().await.read(id).await
    }

    pub async fn delete(&self, id: &str) {
        self.current().await.delete(id).await
    }

    pub async fn list(&self) -> Vec<SpoolEntry> {
        self.current().await.list().await
    }

    pub async fn size(&self) -> u64 {
        self.current().await.size().await
    }

    pub async fn evict_to_fit(&self, quota: u64) {
        self.current().await.evict_to_fit(quota).await
    }

    pub async fn backend_name(&self) -> &'static str {
        self.current().await.backend_name()
    }
}
