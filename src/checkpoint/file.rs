use super::{CheckpointStore, Snapshot};
use crate::types::SessionId;
use anyhow::{Context, Result};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::AsyncWriteExt;
use tracing::debug;

const EXTENSION: &str = "json";

// ============================================================================
// FileCheckpointStore
// ============================================================================

/// Writes go to a temporary file in the same directory, are synced, then
/// renamed over the checkpoint, so a crash leaves either the old or the new
/// snapshot and never a torn one.
pub struct FileCheckpointStore {
    dir: PathBuf,
    tmp_counter: AtomicU64,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            tmp_counter: AtomicU64::new(0),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, session: &SessionId) -> PathBuf {
        self.dir.join(format!("{}.{}", session, EXTENSION))
    }

    fn tmp_path_for(&self, session: &SessionId) -> PathBuf {
        let n = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        self.dir
            .join(format!(".{}.{}.{}.tmp", session, std::process::id(), n))
    }
}

impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, session: &SessionId, snapshot: &Snapshot) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create checkpoint dir {}", self.dir.display()))?;

        let json = serde_json::to_vec(snapshot).context("Failed to serialize checkpoint")?;
        let tmp = self.tmp_path_for(session);
        let target = self.path_for(session);

        let write = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(&json).await?;
            file.sync_all().await?;
            tokio::fs::rename(&tmp, &target).await
        };

        if let Err(e) = write.await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e)
                .with_context(|| format!("Failed to write checkpoint {}", target.display()));
        }

        debug!(
            session = %session,
            sent_count = snapshot.sent_count,
            path = %target.display(),
            "Checkpoint saved"
        );
        Ok(())
    }

    async fn load(&self, session: &SessionId) -> Result<Option<Snapshot>> {
        let path = self.path_for(session);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read checkpoint {}", path.display()));
            }
        };

        let snapshot = serde_json::from_slice(&bytes)
            .with_context(|| format!("Corrupt checkpoint {}", path.display()))?;
        Ok(Some(snapshot))
    }

    async fn clear(&self, session: &SessionId) -> Result<()> {
        let path = self.path_for(session);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(session = %session, "Checkpoint cleared");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => {
                Err(e).with_context(|| format!("Failed to remove checkpoint {}", path.display()))
            }
        }
    }
}
