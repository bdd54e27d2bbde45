//! Persisted backlog of work items.
//!
//! The working set lives at `.autodev/features.json` with a backup alongside
//! it. Every mutation copies the current file to the backup first, then
//! rewrites the whole file. An empty working set is never written over a
//! non-empty one; if the main file comes back empty while the backup still
//! has items, the backup wins.

use std::path::{Path, PathBuf};

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::authz::PathAuthorizer;
use crate::errors::StoreError;
use crate::model::{FeatureStatus, WorkItem};

/// Result of a targeted mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Applied,
    /// No item with the given id; the file was left untouched.
    NotFound,
}

pub struct WorkItemStore {
    file: PathBuf,
    backup: PathBuf,
    /// Serializes the backup-reload-mutate-write cycle.
    write_lock: Mutex<()>,
}

impl WorkItemStore {
    /// Open (and if needed create) the state directory under `project_dir`.
    pub fn open(project_dir: &Path, authz: &dyn PathAuthorizer) -> Result<Self, StoreError> {
        authz.authorize(project_dir)?;
        let state_dir = project_dir.join(".autodev");
        std::fs::create_dir_all(&state_dir).map_err(|source| StoreError::StateDirFailed {
            path: state_dir.clone(),
            source,
        })?;
        Ok(Self {
            file: state_dir.join("features.json"),
            backup: state_dir.join("features.backup.json"),
            write_lock: Mutex::new(()),
        })
    }

    /// Current working set. A missing or unreadable file is an empty
    /// backlog, not an error; readers never fail.
    pub async fn load(&self) -> Vec<WorkItem> {
        read_items(&self.file).await
    }

    /// First item eligible for automatic scheduling, in file order.
    pub fn select_next<'a>(items: &'a [WorkItem]) -> Option<&'a WorkItem> {
        items.iter().find(|item| item.status.is_auto_selectable())
    }

    /// Set an item's status, and optionally its summary. `error` is
    /// two-sided: `Some` records a failure message, `None` clears any
    /// previous one so a recovered item carries no stale diagnostics.
    pub async fn update_status(
        &self,
        id: &str,
        status: FeatureStatus,
        summary: Option<String>,
        error: Option<String>,
    ) -> Result<UpdateOutcome, StoreError> {
        let _guard = self.write_lock.lock().await;
        self.backup_current().await;
        let mut items = self.reload_with_recovery().await;

        let Some(item) = items.iter_mut().find(|item| item.id == id) else {
            warn!(id, "status update for unknown work item, ignoring");
            return Ok(UpdateOutcome::NotFound);
        };
        if status == FeatureStatus::InProgress {
            item.started_at = Some(chrono::Utc::now().to_rfc3339());
        }
        item.status = status;
        if let Some(summary) = summary {
            item.summary = Some(summary);
        }
        item.error = error;

        self.write_items(&items).await?;
        debug!(id, status = status.as_str(), "work item status updated");
        Ok(UpdateOutcome::Applied)
    }

    /// Set or clear an item's worktree annotation. Path and branch move
    /// together; there is no way to persist one without the other. This is
    /// metadata-only, so no backup step.
    pub async fn update_worktree(
        &self,
        id: &str,
        worktree: Option<(String, String)>,
    ) -> Result<UpdateOutcome, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut items = self.reload_with_recovery().await;

        let Some(item) = items.iter_mut().find(|item| item.id == id) else {
            warn!(id, "worktree update for unknown work item, ignoring");
            return Ok(UpdateOutcome::NotFound);
        };
        match worktree {
            Some((path, branch)) => {
                item.worktree_path = Some(path);
                item.branch_name = Some(branch);
            }
            None => {
                item.worktree_path = None;
                item.branch_name = None;
            }
        }

        self.write_items(&items).await?;
        debug!(id, "work item worktree updated");
        Ok(UpdateOutcome::Applied)
    }

    /// Copy the current file over the backup, but only when it still holds
    /// a non-empty collection. A corrupted or emptied main file must never
    /// clobber the backup it will be recovered from. Best effort: a failed
    /// backup is logged but does not block the mutation.
    async fn backup_current(&self) {
        if read_items(&self.file).await.is_empty() {
            return;
        }
        match tokio::fs::copy(&self.file, &self.backup).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(error = %e, "failed to back up working set"),
        }
    }

    /// Reload the working set, falling back to the backup when the main
    /// file has lost its contents.
    async fn reload_with_recovery(&self) -> Vec<WorkItem> {
        let items = read_items(&self.file).await;
        if items.is_empty() {
            let from_backup = read_items(&self.backup).await;
            if !from_backup.is_empty() {
                warn!(
                    count = from_backup.len(),
                    "working set was empty, restored from backup"
                );
                return from_backup;
            }
        }
        items
    }

    async fn write_items(&self, items: &[WorkItem]) -> Result<(), StoreError> {
        if items.is_empty() {
            return Err(StoreError::RefusedEmptyWrite {
                path: self.file.clone(),
            });
        }
        let json = serde_json::to_string_pretty(items).map_err(StoreError::Serialize)?;
        tokio::fs::write(&self.file, json)
            .await
            .map_err(|source| StoreError::WriteFailed {
                path: self.file.clone(),
                source,
            })
    }
}

async fn read_items(path: &Path) -> Vec<WorkItem> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to read working set");
            return Vec::new();
        }
    };
    match serde_json::from_str(&content) {
        Ok(items) => items,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "working set is not valid JSON");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::AllowAll;
    use tempfile::tempdir;

    fn seed(n: usize) -> Vec<WorkItem> {
        (0..n)
            .map(|i| WorkItem::new("core", &format!("feature {}", i), vec![]))
            .collect()
    }

    async fn store_with(dir: &Path, items: &[WorkItem]) -> WorkItemStore {
        let store = WorkItemStore::open(dir, &AllowAll).unwrap();
        let json = serde_json::to_string_pretty(items).unwrap();
        tokio::fs::write(dir.join(".autodev/features.json"), json)
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_update_status_persists_and_clears_error() {
        let dir = tempdir().unwrap();
        let mut items = seed(2);
        items[0].error = Some("old failure".into());
        let store = store_with(dir.path(), &items).await;

        let outcome = store
            .update_status(
                &items[0].id,
                FeatureStatus::WaitingApproval,
                Some("implemented".into()),
                None,
            )
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::Applied);

        let loaded = store.load().await;
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].status, FeatureStatus::WaitingApproval);
        assert_eq!(loaded[0].summary.as_deref(), Some("implemented"));
        assert_eq!(loaded[0].error, None);
        assert_eq!(loaded[1].status, FeatureStatus::Backlog);
    }

    #[tokio::test]
    async fn test_in_progress_transition_stamps_started_at() {
        let dir = tempdir().unwrap();
        let items = seed(1);
        let store = store_with(dir.path(), &items).await;

        store
            .update_status(&items[0].id, FeatureStatus::InProgress, None, None)
            .await
            .unwrap();

        let loaded = store.load().await;
        assert!(loaded[0].started_at.is_some());
    }

    #[tokio::test]
    async fn test_update_preserves_cardinality() {
        let dir = tempdir().unwrap();
        let items = seed(5);
        let store = store_with(dir.path(), &items).await;

        store
            .update_status(&items[3].id, FeatureStatus::InProgress, None, None)
            .await
            .unwrap();

        assert_eq!(store.load().await.len(), 5);
    }

    #[tokio::test]
    async fn test_unknown_id_is_a_noop() {
        let dir = tempdir().unwrap();
        let items = seed(2);
        let store = store_with(dir.path(), &items).await;
        let before = tokio::fs::read_to_string(dir.path().join(".autodev/features.json"))
            .await
            .unwrap();

        let outcome = store
            .update_status("no-such-id", FeatureStatus::Verified, None, None)
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::NotFound);

        let after = tokio::fs::read_to_string(dir.path().join(".autodev/features.json"))
            .await
            .unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_corrupted_file_recovers_from_backup() {
        let dir = tempdir().unwrap();
        let items = seed(3);
        let store = store_with(dir.path(), &items).await;

        // Prime the backup, then wreck the main file.
        store
            .update_status(&items[0].id, FeatureStatus::InProgress, None, None)
            .await
            .unwrap();
        tokio::fs::write(dir.path().join(".autodev/features.json"), "[]")
            .await
            .unwrap();

        store
            .update_status(&items[1].id, FeatureStatus::Verified, None, None)
            .await
            .unwrap();

        let loaded = store.load().await;
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded[1].status, FeatureStatus::Verified);
    }

    #[tokio::test]
    async fn test_empty_main_file_does_not_clobber_backup() {
        let dir = tempdir().unwrap();
        let items = seed(3);
        let store = store_with(dir.path(), &items).await;

        store
            .update_status(&items[0].id, FeatureStatus::InProgress, None, None)
            .await
            .unwrap();
        tokio::fs::write(dir.path().join(".autodev/features.json"), "[]")
            .await
            .unwrap();

        store
            .update_status(&items[1].id, FeatureStatus::Verified, None, None)
            .await
            .unwrap();

        // The backup survived the corrupted write cycle intact.
        let backup: Vec<WorkItem> = serde_json::from_str(
            &tokio::fs::read_to_string(dir.path().join(".autodev/features.backup.json"))
                .await
                .unwrap(),
        )
        .unwrap();
        assert_eq!(backup.len(), 3);
    }

    #[tokio::test]
    async fn test_unparseable_main_file_does_not_clobber_backup() {
        let dir = tempdir().unwrap();
        let items = seed(2);
        let store = store_with(dir.path(), &items).await;

        store
            .update_status(&items[0].id, FeatureStatus::InProgress, None, None)
            .await
            .unwrap();
        tokio::fs::write(dir.path().join(".autodev/features.json"), "{garbage")
            .await
            .unwrap();

        store
            .update_status(&items[1].id, FeatureStatus::Verified, None, None)
            .await
            .unwrap();

        let loaded = store.load().await;
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[1].status, FeatureStatus::Verified);
    }

    #[tokio::test]
    async fn test_worktree_update_skips_backup_step() {
        let dir = tempdir().unwrap();
        let items = seed(1);
        let store = store_with(dir.path(), &items).await;

        store
            .update_worktree(&items[0].id, Some(("/tmp/wt".into(), "feat/x".into())))
            .await
            .unwrap();

        assert!(!dir.path().join(".autodev/features.backup.json").exists());
    }

    #[tokio::test]
    async fn test_refuses_to_write_empty_working_set() {
        let dir = tempdir().unwrap();
        let store = store_with(dir.path(), &seed(1)).await;

        let err = store.write_items(&[]).await.unwrap_err();
        assert!(matches!(err, StoreError::RefusedEmptyWrite { .. }));
    }

    #[tokio::test]
    async fn test_missing_file_loads_as_empty_backlog() {
        let dir = tempdir().unwrap();
        let store = WorkItemStore::open(dir.path(), &AllowAll).unwrap();
        assert!(store.load().await.is_empty());
    }

    #[tokio::test]
    async fn test_worktree_fields_move_together() {
        let dir = tempdir().unwrap();
        let items = seed(1);
        let store = store_with(dir.path(), &items).await;

        store
            .update_worktree(&items[0].id, Some(("/tmp/wt".into(), "feat/x".into())))
            .await
            .unwrap();
        let loaded = store.load().await;
        assert_eq!(loaded[0].worktree_path.as_deref(), Some("/tmp/wt"));
        assert_eq!(loaded[0].branch_name.as_deref(), Some("feat/x"));

        store.update_worktree(&items[0].id, None).await.unwrap();
        let raw = tokio::fs::read_to_string(dir.path().join(".autodev/features.json"))
            .await
            .unwrap();
        assert!(!raw.contains("worktreePath"));
        assert!(!raw.contains("branchName"));
    }

    #[tokio::test]
    async fn test_select_next_skips_verified_and_waiting() {
        let mut items = seed(4);
        items[0].status = FeatureStatus::Verified;
        items[1].status = FeatureStatus::WaitingApproval;
        items[2].status = FeatureStatus::Backlog;
        items[3].status = FeatureStatus::Backlog;

        let next = WorkItemStore::select_next(&items).unwrap();
        assert_eq!(next.id, items[2].id);
    }

    #[tokio::test]
    async fn test_select_next_includes_error_and_in_progress() {
        let mut items = seed(2);
        items[0].status = FeatureStatus::Error;
        items[1].status = FeatureStatus::InProgress;
        assert_eq!(
            WorkItemStore::select_next(&items).unwrap().id,
            items[0].id
        );
    }

    #[tokio::test]
    async fn test_select_next_empty_when_all_settled() {
        let mut items = seed(2);
        items[0].status = FeatureStatus::Verified;
        items[1].status = FeatureStatus::WaitingApproval;
        assert!(WorkItemStore::select_next(&items).is_none());
    }
}
