// SPDX-License-Identifier: MIT
//! Filesystem spool backend.
//!
//! Layout under the root:
//!
//! ```text
//! {root}/
//!   data/{id}.data.bin
//!   events/{id}.events.json
//! ```
//!
//! The filename alone determines the entry kind; there is no index file. An
//! in-memory registry tracks sizes and insertion order for quota accounting
//! and FIFO eviction; [`DiskSpool::init`] rebuilds it from a directory scan
//! so residue from a previous run is rediscovered.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::diag::DebugSink;

use super::{SpoolEntry, SpoolKind, StorageAdapter};

pub struct DiskSpool {
    root: PathBuf,
    quota: u64,
    diag: DebugSink,
    state: Mutex<Registry>,
}

#[derive(Default)]
struct Registry {
    entries: HashMap<String, EntryMeta>,
    /// Insertion order, oldest first. Drives FIFO eviction.
    order: VecDeque<String>,
    total: u64,
}

struct EntryMeta {
    path: PathBuf,
    kind: SpoolKind,
    size: u64,
}

impl Registry {
    /// Drop the record for `id` and return its metadata, keeping `total`
    /// and `order` consistent.
    fn remove(&mut self, id: &str) -> Option<EntryMeta> {
        let meta = self.entries.remove(id)?;
        self.total = self.total.saturating_sub(meta.size);
        self.order.retain(|queued| queued != id);
        Some(meta)
    }

    fn insert(&mut self, id: String, meta: EntryMeta) {
        self.total += meta.size;
        self.entries.insert(id.clone(), meta);
        self.order.push_back(id);
    }
}

impl DiskSpool {
    /// Create an empty spool rooted at `root`. The registry starts blank;
    /// call [`DiskSpool::init`] to rediscover entries left by a previous
    /// run.
    pub fn new(root: impl Into<PathBuf>, quota: u64, debug: bool) -> Self {
        Self {
            root: root.into(),
            quota,
            diag: DebugSink::new(debug),
            state: Mutex::new(Registry::default()),
        }
    }

    /// Scan `data/` and `events/` and seed the registry, oldest file first.
    ///
    /// Both subdirectories are created if missing, so the scan succeeds
    /// against a partially written (or brand new) root. Files that do not
    /// match the naming convention are ignored. Returns an error only when
    /// the root itself is unusable, which is the signal for the tracer to
    /// fall back to the memory backend.
    pub async fn init(&self) -> Result<()> {
        let mut found: Vec<(String, EntryMeta, SystemTime)> = Vec::new();

        for kind in [SpoolKind::Data, SpoolKind::Events] {
            let dir = self.root.join(kind.dir_name());
            tokio::fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("create spool dir {}", dir.display()))?;

            let mut entries = tokio::fs::read_dir(&dir)
                .await
                .with_context(|| format!("list spool dir {}", dir.display()))?;
            while let Some(entry) = entries.next_entry().await? {
                let name = match entry.file_name().into_string() {
                    Ok(n) => n,
                    Err(_) => continue,
                };
                let Some((id, parsed_kind)) = SpoolKind::classify(&name) else {
                    continue;
                };
                let meta = match entry.metadata().await {
                    Ok(m) => m,
                    Err(e) => {
                        self.diag
                            .debug(&format!("spool scan: could not stat {name}: {e:#}"));
                        continue;
                    }
                };
                let created = meta
                    .created()
                    .or_else(|_| meta.modified())
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                found.push((
                    id,
                    EntryMeta {
                        path: entry.path(),
                        kind: parsed_kind,
                        size: meta.len(),
                    },
                    created,
                ));
            }
        }

        found.sort_by_key(|(_, _, created)| *created);

        let mut state = self.state.lock().await;
        for (id, meta, _) in found {
            // Entries written before the scan finished are already
            // registered; the scan must not double-count them.
            if state.entries.contains_key(&id) {
                continue;
            }
            state.insert(id, meta);
        }
        let recovered = state.entries.len();
        drop(state);

        if recovered > 0 {
            self.diag
                .info(&format!("spool scan recovered {recovered} entries"));
        }
        self.evict_to_fit(self.quota).await;
        Ok(())
    }

    fn entry_path(&self, id: &str, kind: SpoolKind) -> PathBuf {
        self.root.join(kind.dir_name()).join(kind.file_name(id))
    }

    /// Write `bytes` to `path` and flush to stable storage before renaming
    /// into place, so a crash mid-write never leaves a half entry under a
    /// convention-matching name.
    async fn write_durable(path: &Path, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let tmp = path.with_file_name(format!(
            "{}.tmp",
            path.file_name().and_then(|n| n.to_str()).unwrap_or("entry")
        ));
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .with_context(|| format!("create {}", tmp.display()))?;
        file.write_all(bytes).await.context("write payload")?;
        file.sync_all().await.context("sync payload")?;
        drop(file);
        tokio::fs::rename(&tmp, path)
            .await
            .with_context(|| format!("rename into {}", path.display()))?;
        Ok(())
    }

    async fn evict_locked(&self, state: &mut Registry, quota: u64) {
        while state.total > quota {
            let Some(oldest) = state.order.front().cloned() else {
                break;
            };
            if let Some(meta) = state.remove(&oldest) {
                if let Err(e) = tokio::fs::remove_file(&meta.path).await {
                    self.diag.debug(&format!(
                        "spool eviction: could not remove {}: {e:#}",
                        meta.path.display()
                    ));
                }
                self.diag
                    .debug(&format!("spool evicted {oldest} ({} bytes)", meta.size));
            }
        }
    }
}

#[async_trait]
impl StorageAdapter for DiskSpool {
    async fn write(&self, id: &str, bytes: &[u8], kind: SpoolKind) -> Result<()> {
        let path = self.entry_path(id, kind);
        Self::write_durable(&path, bytes).await?;

        let mut state = self.state.lock().await;
        // Replacing an existing id: subtract the old size first.
        state.remove(id);
        state.insert(
            id.to_string(),
            EntryMeta {
                path,
                kind,
                size: bytes.len() as u64,
            },
        );
        self.evict_locked(&mut state, self.quota).await;
        Ok(())
    }

    async fn read(&self, id: &str) -> Result<Option<Vec<u8>>> {
        let path = {
            let state = self.state.lock().await;
            match state.entries.get(id) {
                Some(meta) => meta.path.clone(),
                None => return Ok(None),
            }
        };
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("read {}", path.display())),
        }
    }

    async fn delete(&self, id: &str) {
        let meta = {
            let mut state = self.state.lock().await;
            state.remove(id)
        };
        if let Some(meta) = meta {
            if let Err(e) = tokio::fs::remove_file(&meta.path).await {
                self.diag.debug(&format!(
                    "spool delete: could not remove {}: {e:#}",
                    meta.path.display()
                ));
            }
        }
    }

    async fn list(&self) -> Vec<SpoolEntry> {
        let state = self.state.lock().await;
        state
            .order
            .iter()
            .filter_map(|id| {
                state.entries.get(id).map(|meta| SpoolEntry {
                    id: id.clone(),
                    kind: meta.kind,
                    size: meta.size,
                })
            })
            .collect()
    }

    async fn size(&self) -> u64 {
        self.state.lock().await.total
    }

    async fn evict_to_fit(&self, quota: u64) {
        let mut state = self.state.lock().await;
        self.evict_locked(&mut state, quota).await;
    }

    fn backend_name(&self) -> &'static str {
        "disk"
    }
}
