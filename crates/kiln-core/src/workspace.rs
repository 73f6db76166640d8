//! Workspace snapshot types.

use crate::ids::{JobName, RunId, SnapshotId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A directory tree persisted by one job of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub id: SnapshotId,
    pub run_id: RunId,
    pub job: JobName,
    pub paths: Vec<String>,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}
