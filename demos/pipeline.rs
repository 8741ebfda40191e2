// SPDX-License-Identifier: MIT
//! Instrument a small retrieve-then-generate pipeline.
//!
//! Points at `XRAY_BASE_URL` (default `http://localhost:3000`); run an
//! ingest service there to see the events arrive. With `debug` on, delivery
//! and retry activity is visible through `tracing`.
//!
//! ```sh
//! XRAY_API_KEY=demo-key cargo run --example pipeline
//! ```

use serde_json::json;
use xray::{
    ArtifactRef, CaptureArtifact, CaptureOptions, EndOptions, ErrorOptions, StepOptions,
    TraceOptions, Xray, XrayConfig,
};

#[tokio::main]
async fn main() -> Result<(), xray::XrayError> {
    let config = XrayConfig::new(
        std::env::var("XRAY_API_KEY").unwrap_or_else(|_| "demo-key".into()),
        "demo-project",
    )
    .with_debug(true)
    .with_batch_interval(std::time::Duration::from_millis(250));
    let xray = Xray::init(config)?;

    let trace = xray.create_trace(TraceOptions::default());
    println!("trace started: {}", trace.trace_id());

    // Stage 1: store the input blob, record the step referencing it.
    let input = trace.data_id(json!({"prompt": "what is a spool?"}), "input", None);
    trace.step(StepOptions {
        step_name: "retrieve".into(),
        artifacts: vec![ArtifactRef::input(input.clone())],
        ..Default::default()
    });

    // Stage 2: the generated answer, linked to both sides.
    match generate_answer() {
        Ok(answer) => {
            let output = trace.data_id(answer, "output", None);
            trace.step(StepOptions {
                step_name: "generate".into(),
                artifacts: vec![ArtifactRef::input(input), ArtifactRef::output(output)],
                ..Default::default()
            });

            // Minimal mode: raw values in, untagged artifacts out.
            trace.capture(CaptureOptions {
                step_name: "scores".into(),
                artifacts: vec![CaptureArtifact {
                    data: json!({"relevance": 0.93, "groundedness": 0.88}),
                    key: "eval".into(),
                }],
                metadata: None,
            });
            trace.success(EndOptions::default());
        }
        Err(e) => {
            trace.error(ErrorOptions::new(e));
            trace.failure(EndOptions::default());
        }
    }

    xray.shutdown().await;
    println!("delivery stats: {:?}", xray.stats().await);
    Ok(())
}

fn generate_answer() -> anyhow::Result<serde_json::Value> {
    Ok(json!({"answer": "a bounded local buffer that survives restarts"}))
}
