pub mod dispatcher;
pub mod incremental;
pub mod polling;
pub mod rate_limit;

use serde::Serialize;

use crate::model::Provider;

/// Options controlling a sync operation.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Messages fetched when the cursor is missing or rejected.
    pub bootstrap_limit: usize,
    /// Changes resolved concurrently.
    pub concurrency: usize,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            bootstrap_limit: 50,
            concurrency: 4,
        }
    }
}

/// Where an incremental sync run ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Fetching,
    Applied,
    BootstrapRequired,
}

impl SyncPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncPhase::Idle => "idle",
            SyncPhase::Fetching => "fetching",
            SyncPhase::Applied => "applied",
            SyncPhase::BootstrapRequired => "bootstrap",
        }
    }
}

/// Report returned after a sync operation completes.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub user_id: String,
    pub provider: Provider,
    pub phase: SyncPhase,
    pub status: SyncStatus,
    pub items_synced: u64,
    pub items_failed: u64,
    pub cursor: Option<String>,
    pub error: Option<String>,
}

impl SyncReport {
    /// Create a SyncReport with the appropriate status derived from counts.
    pub fn from_counts(
        user_id: &str,
        provider: Provider,
        phase: SyncPhase,
        items_synced: u64,
        items_failed: u64,
    ) -> Self {
        let status = if items_failed == 0 {
            SyncStatus::Success
        } else if items_synced > 0 {
            SyncStatus::PartialFailure
        } else {
            SyncStatus::Failed
        };
        let error = (items_failed > 0).then(|| format!("{items_failed} items failed"));
        Self {
            user_id: user_id.to_string(),
            provider,
            phase,
            status,
            items_synced,
            items_failed,
            cursor: None,
            error,
        }
    }

    /// A run that failed before anything was applied.
    pub fn failed(user_id: &str, provider: Provider, phase: SyncPhase, error: String) -> Self {
        Self {
            user_id: user_id.to_string(),
            provider,
            phase,
            status: SyncStatus::Failed,
            items_synced: 0,
            items_failed: 0,
            cursor: None,
            error: Some(error),
        }
    }

    pub fn with_cursor(mut self, cursor: Option<String>) -> Self {
        self.cursor = cursor;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncStatus {
    Success,
    PartialFailure,
    Failed,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncStatus::Success => "success",
            SyncStatus::PartialFailure => "partial_failure",
            SyncStatus::Failed => "failed",
        }
    }
}
