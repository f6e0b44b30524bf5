use crate::types::{DeliveryResult, RecipientTable, SessionId};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

pub mod file;
pub use file::FileCheckpointStore;

// ============================================================================
// Snapshot
// ============================================================================

/// Everything needed to resume a session: the table as loaded, how many
/// rows are resolved, and every result so far.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub session_id: SessionId,
    pub table: RecipientTable,
    /// Rows resolved so far, success or failure. Never decreases.
    pub sent_count: usize,
    pub results: Vec<DeliveryResult>,
    pub updated_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn new(session_id: SessionId, table: RecipientTable) -> Self {
        Self {
            session_id,
            table,
            sent_count: 0,
            results: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    /// Row indices that already have a result and must not be attempted
    /// again.
    pub fn resolved_rows(&self) -> HashSet<usize> {
        self.results.iter().map(|r| r.row).collect()
    }
}

// ============================================================================
// CheckpointStore trait
// ============================================================================

#[allow(async_fn_in_trait)]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, session: &SessionId, snapshot: &Snapshot) -> Result<()>;

    /// `None` when the session has no checkpoint.
    async fn load(&self, session: &SessionId) -> Result<Option<Snapshot>>;

    /// Removing a checkpoint that does not exist is not an error.
    async fn clear(&self, session: &SessionId) -> Result<()>;
}

// ============================================================================
// InMemoryCheckpointStore
// ============================================================================

/// Process-local store for tests and runs that do not need to survive a
/// crash.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    snapshots: Mutex<HashMap<SessionId, Snapshot>>,
    saves: AtomicUsize,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(self, snapshot: Snapshot) -> Self {
        self.snapshots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(snapshot.session_id.clone(), snapshot);
        self
    }

    /// Number of `save` calls so far.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn contains(&self, session: &SessionId) -> bool {
        self.snapshots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(session)
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, session: &SessionId, snapshot: &Snapshot) -> Result<()> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.snapshots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(session.clone(), snapshot.clone());
        Ok(())
    }

    async fn load(&self, session: &SessionId) -> Result<Option<Snapshot>> {
        Ok(self
            .snapshots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(session)
            .cloned())
    }

    async fn clear(&self, session: &SessionId) -> Result<()> {
        self.snapshots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(session);
        Ok(())
    }
}
