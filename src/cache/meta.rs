//! Per-target metadata persisted across runs.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Output-file fingerprint at the time a target finished building.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FileStamp {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtime_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

/// One record per successfully built target (or failed target, when
/// `record_failed_meta` is enabled; those carry no `value_hash`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaRecord {
    pub target: String,
    pub command_hash: String,
    pub depends_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_hash: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub output_files: BTreeMap<String, FileStamp>,
    pub seed: u64,
    pub elapsed_ms: u64,
    pub finished_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MetaRecord {
    pub fn is_failure(&self) -> bool {
        self.value_hash.is_none()
    }
}
