// SPDX-License-Identifier: MIT
//! Crash-and-restart behavior: blob payloads left in the spool by a
//! previous run are rediscovered and uploaded on the next one.

mod common;

use std::sync::Arc;
use std::time::Duration;

use xray::spool::{DiskSpool, SpoolKind, StorageAdapter};
use xray::{Xray, XrayConfig};

use common::{wait_until, MockIngest};

fn config(dir: &std::path::Path) -> XrayConfig {
    XrayConfig::new("test-key", "proj")
        .with_temp_dir(dir)
        .with_batch_interval(Duration::from_millis(50))
}

#[tokio::test]
async fn spooled_blobs_are_reuploaded_after_restart() {
    let dir = tempfile::tempdir().unwrap();

    // A previous run got as far as spooling two payloads, then died before
    // the uploads completed.
    {
        let spool = DiskSpool::new(dir.path(), 1024 * 1024, false);
        spool.init().await.unwrap();
        spool
            .write("blob-a", br#"{"a":1}"#, SpoolKind::Data)
            .await
            .unwrap();
        spool
            .write("blob-b", br#"{"b":2}"#, SpoolKind::Data)
            .await
            .unwrap();
    }

    let mock = Arc::new(MockIngest::default());
    let xray = Xray::init_with_ingest(config(dir.path()), mock.clone()).unwrap();

    wait_until(Duration::from_secs(5), || mock.put_count() == 2).await;

    let uploaded: Vec<Vec<u8>> = mock
        .puts
        .lock()
        .unwrap()
        .iter()
        .map(|(_, bytes)| bytes.clone())
        .collect();
    assert!(uploaded.contains(&br#"{"a":1}"#.to_vec()));
    assert!(uploaded.contains(&br#"{"b":2}"#.to_vec()));

    // Delivered payloads are removed from disk.
    wait_until(Duration::from_secs(5), || {
        std::fs::read_dir(dir.path().join("data"))
            .map(|entries| entries.count() == 0)
            .unwrap_or(false)
    })
    .await;

    xray.shutdown().await;
    assert_eq!(xray.stats().await.blobs_uploaded, 2);
}

#[tokio::test]
async fn stale_event_batches_are_not_replayed() {
    let dir = tempfile::tempdir().unwrap();

    {
        let spool = DiskSpool::new(dir.path(), 1024 * 1024, false);
        spool.init().await.unwrap();
        spool
            .write("old-batch", b"[]", SpoolKind::Events)
            .await
            .unwrap();
        spool
            .write("blob-a", b"{}", SpoolKind::Data)
            .await
            .unwrap();
    }

    let mock = Arc::new(MockIngest::default());
    let xray = Xray::init_with_ingest(config(dir.path()), mock.clone()).unwrap();

    // The blob is resumed; the forensic event batch is left alone.
    wait_until(Duration::from_secs(5), || mock.put_count() == 1).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(mock.events().is_empty());
    assert!(dir.path().join("events/old-batch.events.json").exists());

    xray.shutdown().await;
}

#[tokio::test]
async fn recovered_payloads_respect_the_quota() {
    let dir = tempfile::tempdir().unwrap();

    {
        let spool = DiskSpool::new(dir.path(), 1024 * 1024, false);
        spool.init().await.unwrap();
        for i in 0..3 {
            spool
                .write(&format!("blob-{i}"), &vec![b'x'; 500], SpoolKind::Data)
                .await
                .unwrap();
        }
    }

    // The new run's quota is smaller than the residue: the scan must evict
    // oldest-first down to the quota before uploading the rest.
    let mock = Arc::new(MockIngest::default());
    let xray = Xray::init_with_ingest(
        config(dir.path()).with_max_disk_size(1024),
        mock.clone(),
    )
    .unwrap();

    wait_until(Duration::from_secs(5), || mock.put_count() == 2).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(mock.put_count(), 2, "evicted payload is gone for good");

    xray.shutdown().await;
}
