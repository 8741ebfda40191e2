// SPDX-License-Identifier: MIT
//! Shared helpers for the integration tests: a recording in-process
//! transport and a polling wait.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use xray::{Event, IngestApi, PresignRequest, PresignResponse};

#[derive(Default)]
pub struct MockIngest {
    pub presigns: Mutex<Vec<PresignRequest>>,
    pub puts: Mutex<Vec<(String, Vec<u8>)>>,
    pub ingests: Mutex<Vec<Vec<Event>>>,
    /// Fail this many ingest calls before starting to succeed.
    pub fail_ingests: AtomicUsize,
    /// Fail this many presign calls before starting to succeed.
    pub fail_presigns: AtomicUsize,
}

impl MockIngest {
    pub fn events(&self) -> Vec<Event> {
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

    pub fn presign_count(&self) -> usize {
        self.presigns.lock().unwrap().len()
    }
}

#[async_trait]
impl IngestApi for MockIngest {
    async fn presign(&self, request: &PresignRequest) -> Result<PresignResponse> {
        if take_failure(&self.fail_presigns) {
            bail!("presign returned 503 Service Unavailable");
        }
        self.presigns.lock().unwrap().push(request.clone());
        Ok(PresignResponse {
            presigned_url: format!("https://store.test/{}", request.data_id),
            data_path: None,
        })
    }

    async fn ingest(&self, events: &[Event]) -> Result<()> {
        if take_failure(&self.fail_ingests) {
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

fn take_failure(budget: &AtomicUsize) -> bool {
    budget
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Poll `condition` every 20 ms until it holds, panicking after `timeout`.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not reached within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
