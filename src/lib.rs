// SPDX-License-Identifier: MIT
//! Embeddable pipeline-trace telemetry client.
//!
//! A host application records a tree of events (trace start/end, steps,
//! errors) and uploads opaque data blobs to object storage through
//! presigned URLs, with never-break-the-host semantics: every recording
//! call is synchronous, non-throwing, and returns ids immediately while
//! the referenced work completes in the background.
//!
//! Transient network failure is absorbed by a local bounded spool with
//! FIFO eviction; residue left by a crash is rediscovered and re-uploaded
//! on the next run. The only fallible public call is [`Xray::init`].
//!
//! ```no_run
//! use xray::{ArtifactRef, StepOptions, TraceOptions, Xray, XrayConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), xray::XrayError> {
//!     let xray = Xray::init(XrayConfig::new("api-key", "my-project"))?;
//!
//!     let trace = xray.create_trace(TraceOptions::default());
//!     let input = trace.data_id(serde_json::json!({"prompt": "hello"}), "input", None);
//!     trace.step(StepOptions {
//!         step_name: "tokenize".into(),
//!         artifacts: vec![ArtifactRef::input(input)],
//!         ..Default::default()
//!     });
//!     trace.success(Default::default());
//!
//!     xray.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod batcher;
pub mod config;
mod diag;
pub mod event;
pub mod ingest;
mod retry;
pub mod serializer;
pub mod spool;
mod tracer;
mod uploader;

pub use config::{XrayConfig, XrayError};
pub use event::{ArtifactRef, ArtifactType, Event, Metadata};
pub use ingest::{IngestApi, IngestClient, PresignRequest, PresignResponse};
pub use tracer::{
    CaptureArtifact, CaptureOptions, EndOptions, ErrorOptions, StepOptions, Trace, TraceOptions,
    Xray, XrayStats,
};
