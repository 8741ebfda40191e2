// SPDX-License-Identifier: MIT
//! In-memory spool backend.
//!
//! Used when disk initialization fails (missing permission, unwritable
//! root). Same FIFO accounting as the disk backend, trivially durable,
//! nothing survives the process.

use std::collections::{HashMap, VecDeque};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{SpoolEntry, SpoolKind, StorageAdapter};

pub struct MemorySpool {
    quota: u64,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    entries: HashMap<String, (SpoolKind, Vec<u8>)>,
    order: VecDeque<String>,
    total: u64,
}

impl State {
    fn remove(&mut self, id: &str) -> Option<(SpoolKind, Vec<u8>)> {
        let entry = self.entries.remove(id)?;
        self.total = self.total.saturating_sub(entry.1.len() as u64);
        self.order.retain(|queued| queued != id);
        Some(entry)
    }

    fn evict_to_fit(&mut self, quota: u64) {
        while self.total > quota {
            let Some(oldest) = self.order.front().cloned() else {
                break;
            };
            self.remove(&oldest);
        }
    }
}

impl MemorySpool {
    pub fn new(quota: u64) -> Self {
        Self {
            quota,
            state: Mutex::new(State::default()),
        }
    }
}

#[async_trait]
impl StorageAdapter for MemorySpool {
    async fn write(&self, id: &str, bytes: &[u8], kind: SpoolKind) -> Result<()> {
        let mut state = self.state.lock().await;
        state.remove(id);
        state.total += bytes.len() as u64;
        state.entries.insert(id.to_string(), (kind, bytes.to_vec()));
        state.order.push_back(id.to_string());
        state.evict_to_fit(self.quota);
        Ok(())
    }

    async fn read(&self, id: &str) -> Result<Option<Vec<u8>>> {
        let state = self.state.lock().await;
        Ok(state.entries.get(id).map(|(_, bytes)| bytes.clone()))
    }

    async fn delete(&self, id: &str) {
        self.state.lock().await.remove(id);
    }

    async fn list(&self) -> Vec<SpoolEntry> {
        let state = self.state.lock().await;
        state
            .order
            .iter()
            .filter_map(|id| {
                state.entries.get(id).map(|(kind, bytes)| SpoolEntry {
                    id: id.clone(),
                    kind: *kind,
                    size: bytes.len() as u64,
                })
            })
            .collect()
    }

    async fn size(&self) -> u64 {
        self.state.lock().await.total
    }

    async fn evict_to_fit(&self, quota: u64) {
        self.state.lock().await.evict_to_fit(quota);
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trip_and_accounting() {
        let s = MemorySpool::new(1024);
        s.write("a", b"hello", SpoolKind::Data).await.unwrap();
        assert_eq!(s.size().await, 5);
        assert_eq!(s.read("a").await.unwrap().as_deref(), Some(&b"hello"[..]));
        s.delete("a").await;
        assert_eq!(s.size().await, 0);
    }

    #[tokio::test]
    async fn quota_eviction_is_fifo() {
        let s = MemorySpool::new(1024);
        for id in ["one", "two", "three"] {
            s.write(id, &vec![0u8; 500], SpoolKind::Data).await.unwrap();
        }
        assert!(s.size().await <= 1024);
        assert!(s.read("one").await.unwrap().is_none());
        assert!(s.read("three").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn rewrite_replaces_rather_than_duplicates() {
        let s = MemorySpool::new(1024);
        s.write("a", &vec![0u8; 400], SpoolKind::Events).await.unwrap();
        s.write("a", &vec![0u8; 10], SpoolKind::Events).await.unwrap();
        assert_eq!(s.size().await, 10);
        assert_eq!(s.list().await.len(), 1);
    }
}
