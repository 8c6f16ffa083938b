//! Scenario vectors.
//!
//! Each vector is one cycle from a known starting state with its expected
//! end state. They are plain data so other implementations of the same
//! wire protocol and record format can replay them from JSON.

use crate::fixtures::MemoryRig;
use serde::{Deserialize, Serialize};
use tailsync_engine::SyncError;
use tailsync_storage::{InMemoryBackend, MemoryOffsetStore, OffsetStore};

/// Which loop a vector drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Local file is the source, remote file the destination.
    Producer,
    /// Remote file is the source, local file the destination.
    Consumer,
}

/// One cycle with its starting and expected state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioVector {
    /// Unique identifier for this vector.
    pub id: String,
    /// Human-readable description.
    pub description: String,
    /// Loop under test.
    pub role: Role,
    /// Local file content before the cycle.
    pub local: String,
    /// Remote file content before the cycle; `None` if absent.
    pub remote: Option<String>,
    /// Raw watermark record before the cycle; `None` if absent.
    pub record: Option<String>,
    /// Local file content afterwards.
    pub expected_local: String,
    /// Remote file content afterwards.
    pub expected_remote: Option<String>,
    /// Persisted watermark afterwards, if the record is readable.
    pub expected_watermark: Option<u64>,
    /// Error kind the cycle must fail with, if any.
    pub expected_error: Option<String>,
}

/// What a vector run left behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VectorOutcome {
    /// Local file content.
    pub local: String,
    /// Remote file content.
    pub remote: Option<String>,
    /// Persisted watermark, if readable.
    pub watermark: Option<u64>,
    /// Error kind, if the run failed.
    pub error: Option<String>,
}

/// Short stable name for an error, as used in vectors.
pub fn error_kind(error: &SyncError) -> &'static str {
    match error {
        SyncError::Connectivity { .. } => "connectivity",
        SyncError::LocalIo { .. } => "local_io",
        SyncError::RemoteOperation { .. } => "remote_operation",
        SyncError::CorruptRecord { .. } => "corrupt_record",
        SyncError::WatermarkAhead { .. } => "watermark_ahead",
        SyncError::Protocol(_) => "protocol",
        SyncError::Timeout { .. } => "timeout",
        SyncError::Cancelled => "cancelled",
    }
}

const REMOTE_PATH: &str = "/shared/file1.txt";

fn vector(
    id: &str,
    description: &str,
    role: Role,
    before: (&str, Option<&str>, Option<&str>),
    after: (&str, Option<&str>, Option<u64>),
) -> ScenarioVector {
    ScenarioVector {
        id: id.into(),
        description: description.into(),
        role,
        local: before.0.into(),
        remote: before.1.map(Into::into),
        record: before.2.map(Into::into),
        expected_local: after.0.into(),
        expected_remote: after.1.map(Into::into),
        expected_watermark: after.2,
        expected_error: None,
    }
}

/// Vectors for single producer and consumer cycles.
pub fn scenario_vectors() -> Vec<ScenarioVector> {
    vec![
        vector(
            "producer_first_upload",
            "Empty history, writer appended 'hello': whole file ships",
            Role::Producer,
            ("hello", None, None),
            ("hello", Some("hello"), Some(5)),
        ),
        vector(
            "producer_resume",
            "Watermark 5 over 'helloworld': only 'world' ships",
            Role::Producer,
            ("helloworld", Some("hello"), Some("5")),
            ("helloworld", Some("helloworld"), Some(10)),
        ),
        vector(
            "producer_up_to_date",
            "Watermark equals file size: nothing ships",
            Role::Producer,
            ("hello", Some("hello"), Some("5\n")),
            ("hello", Some("hello"), Some(5)),
        ),
        vector(
            "consumer_up_to_date",
            "Watermark 5 with remote size 5: no fetch",
            Role::Consumer,
            ("hello", Some("hello"), Some("5")),
            ("hello", Some("hello"), Some(5)),
        ),
        vector(
            "consumer_first_download",
            "No history, remote 'hello world!': all 12 bytes mirrored",
            Role::Consumer,
            ("", Some("hello world!"), None),
            ("hello world!", Some("hello world!"), Some(12)),
        ),
        vector(
            "consumer_remote_absent",
            "Remote file does not exist yet: treated as empty",
            Role::Consumer,
            ("", None, None),
            ("", None, Some(0)),
        ),
        ScenarioVector {
            expected_error: Some("corrupt_record".into()),
            ..vector(
                "producer_corrupt_record",
                "Record 'abc' is rejected before any transfer",
                Role::Producer,
                ("hello", None, Some("abc")),
                ("hello", None, None),
            )
        },
        ScenarioVector {
            expected_error: Some("watermark_ahead".into()),
            ..vector(
                "producer_source_shrank",
                "Watermark beyond the source size is fatal",
                Role::Producer,
                ("hello", Some("hello world"), Some("11")),
                ("hello", Some("hello world"), Some(11)),
            )
        },
    ]
}

/// Replays one vector against in-memory parts.
pub fn run_vector(vector: &ScenarioVector) -> VectorOutcome {
    let local = InMemoryBackend::with_data(vector.local.clone().into_bytes());
    let record = match &vector.record {
        Some(content) => MemoryOffsetStore::with_content(content.as_str()),
        None => MemoryOffsetStore::new(),
    };
    let rig = match vector.role {
        Role::Producer => MemoryRig {
            source: local.clone(),
            producer_offsets: record.clone(),
            ..MemoryRig::new(REMOTE_PATH)
        },
        Role::Consumer => MemoryRig {
            mirror: local.clone(),
            consumer_offsets: record.clone(),
            ..MemoryRig::new(REMOTE_PATH)
        },
    };
    if let Some(content) = &vector.remote {
        rig.remote.put(REMOTE_PATH, content.as_bytes());
    }

    let result = match vector.role {
        Role::Producer => rig.producer().and_then(|mut p| p.run_cycle()),
        Role::Consumer => rig.consumer().and_then(|mut c| c.run_cycle()),
    };

    VectorOutcome {
        local: String::from_utf8_lossy(&local.data()).into_owned(),
        remote: rig
            .remote
            .file(REMOTE_PATH)
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()),
        watermark: record.read().ok(),
        error: result.err().map(|e| error_kind(&e).to_string()),
    }
}

/// Replays a vector and compares against its expectations.
pub fn check_vector(vector: &ScenarioVector) -> Result<(), String> {
    let outcome = run_vector(vector);
    let expected = VectorOutcome {
        local: vector.expected_local.clone(),
        remote: vector.expected_remote.clone(),
        watermark: vector.expected_watermark,
        error: vector.expected_error.clone(),
    };
    if outcome == expected {
        Ok(())
    } else {
        Err(format!(
            "{}: expected {expected:?}, got {outcome:?}",
            vector.id
        ))
    }
}

/// Returns all vectors as JSON.
pub fn all_vectors_json() -> String {
    serde_json::to_string_pretty(&scenario_vectors()).expect("Failed to serialize vectors")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scenario_vectors() {
        for vector in scenario_vectors() {
            check_vector(&vector).unwrap();
        }
    }

    #[test]
    fn test_vector_ids_unique() {
        let vectors = scenario_vectors();
        let mut ids: Vec<_> = vectors.iter().map(|v| v.id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), vectors.len());
    }

    #[test]
    fn test_all_vectors_json() {
        let json = all_vectors_json();
        let parsed: Vec<ScenarioVector> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.len(), scenario_vectors().len());
        assert!(json.contains("\"role\": \"consumer\""));
    }

    #[test]
    fn mismatch_is_reported() {
        let mut vector = scenario_vectors().remove(0);
        vector.expected_watermark = Some(99);
        let message = check_vector(&vector).unwrap_err();
        assert!(message.contains("producer_first_upload"));
    }
}
