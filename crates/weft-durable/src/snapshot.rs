//! Persisted workflow state
//!
//! A [`WorkflowSnapshot`] is the versioned, JSON-serializable record of all
//! completed keyed steps plus execution metadata. Snapshots are written by
//! the durable coordinator after every keyed step and replayed on resume;
//! the step runtime never touches them directly.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PersistenceError, StepMeta};

/// Structural format version this engine reads and writes
pub const FORMAT_VERSION: u32 = 1;

/// Execution status of a persisted workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Execution block of a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionInfo {
    pub status: RunStatus,

    pub last_updated: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub current_step_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Application-level metadata carried on a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SnapshotMetadata {
    /// Application schema version; absent means 1
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub version: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub workflow_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub input: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub definition_hash: Option<String>,

    /// Opaque caller extensions
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A diagnostic attached to a snapshot rather than failing the run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotWarning {
    #[serde(rename = "type")]
    pub kind: String,

    pub step_id: String,

    pub path: String,

    pub reason: String,
}

impl SnapshotWarning {
    /// A step payload could not be represented as JSON and was not persisted
    pub fn lossy_value(step_id: impl Into<String>, reason: impl Into<String>) -> Self {
        let step_id = step_id.into();
        Self {
            kind: "lossy_value".to_string(),
            path: format!("steps.{step_id}"),
            step_id,
            reason: reason.into(),
        }
    }
}

/// Serialized outcome of one completed keyed step.
///
/// Exactly one of `value`/`error` is populated, matching `ok`. `value` is
/// absent for unit successes (a recorded `null`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub ok: bool,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub value: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cause: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub meta: Option<StepMeta>,
}

impl StepRecord {
    pub fn success(value: serde_json::Value) -> Self {
        let value = if value.is_null() { None } else { Some(value) };
        Self {
            ok: true,
            value,
            error: None,
            cause: None,
            meta: None,
        }
    }

    pub fn failure(
        error: serde_json::Value,
        cause: Option<serde_json::Value>,
        meta: StepMeta,
    ) -> Self {
        Self {
            ok: false,
            value: None,
            error: Some(error),
            cause,
            meta: Some(meta),
        }
    }

    pub fn with_meta(mut self, meta: StepMeta) -> Self {
        self.meta = Some(meta);
        self
    }

    /// The recorded success value, with absent normalized to `null`
    pub fn value_or_null(&self) -> serde_json::Value {
        self.value.clone().unwrap_or(serde_json::Value::Null)
    }

    /// Structural invariant: `ok` records never carry an error and vice versa
    pub fn is_valid(&self) -> bool {
        if self.ok {
            self.error.is_none() && self.cause.is_none()
        } else {
            self.error.is_some() && self.value.is_none()
        }
    }
}

/// Versioned record of a workflow's completed keyed steps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    pub format_version: u32,

    /// Completed steps only, keyed by step key
    pub steps: BTreeMap<String, StepRecord>,

    pub execution: ExecutionInfo,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub metadata: Option<SnapshotMetadata>,

    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub warnings: Vec<SnapshotWarning>,
}

impl WorkflowSnapshot {
    /// A fresh snapshot for a newly started run
    pub fn new(workflow_id: impl Into<String>, version: u32) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            steps: BTreeMap::new(),
            execution: ExecutionInfo {
                status: RunStatus::Running,
                last_updated: Utc::now(),
                current_step_id: None,
                completed_at: None,
            },
            metadata: Some(SnapshotMetadata {
                version: Some(version),
                workflow_id: Some(workflow_id.into()),
                ..Default::default()
            }),
            warnings: Vec::new(),
        }
    }

    /// The application schema version; absent metadata means 1
    pub fn stored_version(&self) -> u32 {
        self.metadata
            .as_ref()
            .and_then(|m| m.version)
            .unwrap_or(1)
    }

    pub fn set_version(&mut self, version: u32) {
        self.metadata
            .get_or_insert_with(SnapshotMetadata::default)
            .version = Some(version);
    }

    /// Record a completed step and drop any stale warning for it
    pub fn record_step(&mut self, key: impl Into<String>, record: StepRecord) {
        let key = key.into();
        self.warnings.retain(|w| w.step_id != key);
        self.steps.insert(key.clone(), record);
        self.execution.current_step_id = Some(key);
        self.execution.last_updated = Utc::now();
    }

    /// Record a lossy-value warning in place of an unserializable outcome
    pub fn record_lossy(&mut self, step_id: impl Into<String>, reason: impl Into<String>) {
        let warning = SnapshotWarning::lossy_value(step_id, reason);
        self.warnings.retain(|w| w.step_id != warning.step_id);
        self.warnings.push(warning);
        self.execution.last_updated = Utc::now();
    }

    pub fn mark(&mut self, status: RunStatus) {
        self.execution.status = status;
        self.execution.last_updated = Utc::now();
        self.execution.completed_at = if matches!(status, RunStatus::Running) {
            None
        } else {
            Some(Utc::now())
        };
    }

    /// Structural validation applied to loaded snapshots.
    ///
    /// Field types are already enforced by deserialization; this checks the
    /// invariants serde cannot express.
    pub fn validate(&self) -> Result<(), PersistenceError> {
        if self.format_version != FORMAT_VERSION {
            return Err(PersistenceError::Invalid {
                reason: format!(
                    "unsupported format version {} (expected {FORMAT_VERSION})",
                    self.format_version
                ),
            });
        }

        for (key, record) in &self.steps {
            if !record.is_valid() {
                return Err(PersistenceError::Invalid {
                    reason: format!("step record '{key}' mixes ok and error payloads"),
                });
            }
        }

        Ok(())
    }
}
