// SPDX-License-Identifier: MIT
//! Wire event model.
//!
//! Events are value types: once emitted they are never mutated. On the wire
//! they are JSON objects discriminated by a `type` field, all other fields
//! `camelCase`, matching what `POST /api/v1/ingest` expects.

use serde::{Deserialize, Serialize};

/// Free-form user metadata: an arbitrary key → value tree of scalars,
/// arrays, and nested objects. User types are never reified; hosts hand us
/// JSON trees.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// A reference from a step to a previously stored data blob.
///
/// `kind` is serialized as `type` and is deliberately *not* skipped when
/// absent: `"type": null` is the minimal-mode sentinel meaning "no
/// input/output distinction".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRef {
    pub data_id: String,
    #[serde(rename = "type")]
    pub kind: Option<ArtifactType>,
}

impl ArtifactRef {
    /// An artifact tagged as step input.
    pub fn input(data_id: impl Into<String>) -> Self {
        Self {
            data_id: data_id.into(),
            kind: Some(ArtifactType::Input),
        }
    }

    /// An artifact tagged as step output.
    pub fn output(data_id: impl Into<String>) -> Self {
        Self {
            data_id: data_id.into(),
            kind: Some(ArtifactType::Output),
        }
    }

    /// An untagged artifact (minimal mode).
    pub fn untagged(data_id: impl Into<String>) -> Self {
        Self {
            data_id: data_id.into(),
            kind: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactType {
    Input,
    Output,
}

/// The tagged event sum shipped to the ingest service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    #[serde(rename = "trace-start", rename_all = "camelCase")]
    TraceStart {
        trace_id: String,
        project_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        metadata: Option<Metadata>,
        created_at: String,
    },

    #[serde(rename = "trace-success", rename_all = "camelCase")]
    TraceSuccess {
        trace_id: String,
        project_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        metadata: Option<Metadata>,
        #[serde(skip_serializing_if = "Option::is_none")]
        success_metadata: Option<Metadata>,
        /// Always `"success"`.
        status: String,
        created_at: String,
        ended_at: String,
    },

    #[serde(rename = "trace-failure", rename_all = "camelCase")]
    TraceFailure {
        trace_id: String,
        project_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        metadata: Option<Metadata>,
        #[serde(skip_serializing_if = "Option::is_none")]
        failure_metadata: Option<Metadata>,
        /// Always `"failure"`.
        status: String,
        created_at: String,
        ended_at: String,
    },

    #[serde(rename = "step", rename_all = "camelCase")]
    Step {
        step_id: String,
        trace_id: String,
        project_id: String,
        step_name: String,
        step_number: u64,
        artifacts: Vec<ArtifactRef>,
        #[serde(skip_serializing_if = "Option::is_none")]
        metadata: Option<Metadata>,
        timestamp: String,
    },

    /// Metadata-only record of a blob upload. The client never emits this
    /// variant itself; the backend synthesizes it from the presign path.
    /// It lives here so the wire model round-trips.
    #[serde(rename = "data", rename_all = "camelCase")]
    Data {
        data_id: String,
        trace_id: String,
        project_id: String,
        key: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        metadata: Option<Metadata>,
        #[serde(skip_serializing_if = "Option::is_none")]
        data_path: Option<String>,
    },
}

impl Event {
    /// The owning trace id, for log lines.
    pub fn trace_id(&self) -> &str {
        match self {
            Event::TraceStart { trace_id, .. }
            | Event::TraceSuccess { trace_id, .. }
            | Event::TraceFailure { trace_id, .. }
            | Event::Step { trace_id, .. }
            | Event::Data { trace_id, .. } => trace_id,
        }
    }
}

/// RFC-3339 UTC timestamp for event fields.
pub(crate) fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn trace_start_wire_shape() {
        let mut metadata = Metadata::new();
        metadata.insert("run".into(), json!(1));
        let event = Event::TraceStart {
            trace_id: "P-abc".into(),
            project_id: "P".into(),
            metadata: Some(metadata),
            created_at: "2026-01-01T00:00:00+00:00".into(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "trace-start");
        assert_eq!(value["traceId"], "P-abc");
        assert_eq!(value["projectId"], "P");
        assert_eq!(value["metadata"]["run"], 1);
        assert_eq!(value["createdAt"], "2026-01-01T00:00:00+00:00");
    }

    #[test]
    fn step_artifact_type_serializes_null_when_untagged() {
        let event = Event::Step {
            step_id: "s".into(),
            trace_id: "t".into(),
            project_id: "p".into(),
            step_name: "tokenize".into(),
            step_number: 3,
            artifacts: vec![ArtifactRef::input("d1"), ArtifactRef::untagged("d2")],
            metadata: None,
            timestamp: "2026-01-01T00:00:00+00:00".into(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["stepNumber"], 3);
        assert_eq!(value["artifacts"][0]["type"], "input");
        assert_eq!(value["artifacts"][0]["dataId"], "d1");
        // Untagged artifacts carry an explicit null, not an absent key.
        assert!(value["artifacts"][1].as_object().unwrap().contains_key("type"));
        assert_eq!(value["artifacts"][1]["type"], serde_json::Value::Null);
    }

    #[test]
    fn end_events_carry_status() {
        let event = Event::TraceSuccess {
            trace_id: "t".into(),
            project_id: "p".into(),
            metadata: None,
            success_metadata: None,
            status: "success".into(),
            created_at: "a".into(),
            ended_at: "b".into(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "trace-success");
        assert_eq!(value["status"], "success");
        assert_eq!(value["endedAt"], "b");
        // Absent optional metadata is omitted entirely.
        assert!(!value.as_object().unwrap().contains_key("metadata"));
    }

    #[test]
    fn data_record_round_trips() {
        let raw = json!({
            "type": "data",
            "dataId": "d",
            "traceId": "t",
            "projectId": "p",
            "key": "output",
            "dataPath": "bucket/p/d.json",
        });
        let event: Event = serde_json::from_value(raw).unwrap();
        match &event {
            Event::Data { data_id, data_path, .. } => {
                assert_eq!(data_id, "d");
                assert_eq!(data_path.as_deref(), Some("bucket/p/d.json"));
            }
            other => panic!("wrong variant: {other:?}"),
        }
        assert_eq!(event.trace_id(), "t");
    }
}
