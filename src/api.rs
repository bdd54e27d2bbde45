//! Narrow entry point for engine consumers.
//!
//! Everything outside the engine (CLI today, a UI layer tomorrow) talks to
//! the `Orchestrator`: list and mutate the backlog, drive the scheduler,
//! subscribe to events. Nothing else in the crate is part of the surface.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::authz::AllowListAuthorizer;
use crate::config::OrchestratorConfig;
use crate::errors::{SchedulerError, StoreError};
use crate::events::SchedulerEvent;
use crate::model::{FeatureStatus, WorkItem};
use crate::runner::{AgentRunner, ClaudeRunner};
use crate::scheduler::Scheduler;
use crate::store::{UpdateOutcome, WorkItemStore};

pub struct Orchestrator {
    config: OrchestratorConfig,
    store: Arc<WorkItemStore>,
    scheduler: Arc<Scheduler>,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig) -> Result<Self, StoreError> {
        let authz = Arc::new(AllowListAuthorizer::new(config.allowed_roots.clone())?);
        let runner = Arc::new(ClaudeRunner::new(config.clone(), authz.clone()));
        Self::with_runner(config, runner, authz)
    }

    /// Construction seam for tests and embedders with their own runner.
    pub fn with_runner(
        config: OrchestratorConfig,
        runner: Arc<dyn AgentRunner>,
        authz: Arc<dyn crate::authz::PathAuthorizer>,
    ) -> Result<Self, StoreError> {
        let store = Arc::new(WorkItemStore::open(&config.project_dir, authz.as_ref())?);
        let scheduler = Arc::new(Scheduler::new(store.clone(), runner));
        Ok(Self {
            config,
            store,
            scheduler,
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub async fn list_work_items(&self) -> Vec<WorkItem> {
        self.store.load().await
    }

    pub async fn update_work_item_status(
        &self,
        id: &str,
        status: FeatureStatus,
        summary: Option<String>,
        error: Option<String>,
    ) -> Result<UpdateOutcome, StoreError> {
        let outcome = self.store.update_status(id, status, summary, error).await?;
        if outcome == UpdateOutcome::Applied {
            self.scheduler.publish(SchedulerEvent::StatusChanged {
                item_id: id.to_string(),
                status,
            });
            self.scheduler.kick();
        }
        Ok(outcome)
    }

    pub async fn update_work_item_worktree(
        &self,
        id: &str,
        worktree: Option<(String, String)>,
    ) -> Result<UpdateOutcome, StoreError> {
        self.store.update_worktree(id, worktree).await
    }

    pub async fn start_scheduler(&self, limit: usize) -> Result<(), SchedulerError> {
        self.scheduler.start(limit).await
    }

    pub async fn stop_scheduler(&self) {
        self.scheduler.stop().await;
    }

    pub async fn set_concurrency(&self, limit: usize) {
        self.scheduler.set_concurrency(limit).await;
    }

    pub async fn running_count(&self) -> usize {
        self.scheduler.running_count().await
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.scheduler.subscribe()
    }

    /// Wait until the scheduler and every in-flight run have finished.
    pub async fn join(&self) {
        self.scheduler.join().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::AllowAll;
    use crate::runner::RunOutcome;
    use crate::stream::RunRecord;
    use async_trait::async_trait;
    use tempfile::tempdir;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    struct InstantSuccess;

    #[async_trait]
    impl AgentRunner for InstantSuccess {
        async fn run(
            &self,
            _item: &WorkItem,
            records: mpsc::Sender<RunRecord>,
            _cancel: CancellationToken,
        ) -> RunOutcome {
            let _ = records
                .send(crate::stream::parse_line(
                    r#"{"type":"result","result":"done"}"#,
                ))
                .await;
            RunOutcome {
                exit_code: Some(0),
                stderr: String::new(),
                records_emitted: 1,
                cancelled: false,
                timed_out: false,
            }
        }
    }

    async fn orchestrator_with_items(dir: &std::path::Path, n: usize) -> (Orchestrator, Vec<WorkItem>) {
        let config = OrchestratorConfig::new(dir.to_path_buf()).unwrap();
        let orchestrator =
            Orchestrator::with_runner(config, Arc::new(InstantSuccess), Arc::new(AllowAll))
                .unwrap();
        let items: Vec<WorkItem> = (0..n)
            .map(|i| WorkItem::new("core", &format!("feature {}", i), vec![]))
            .collect();
        let json = serde_json::to_string_pretty(&items).unwrap();
        tokio::fs::write(dir.join(".autodev/features.json"), json)
            .await
            .unwrap();
        (orchestrator, items)
    }

    #[tokio::test]
    async fn test_run_to_completion_through_the_facade() {
        let dir = tempdir().unwrap();
        let (orchestrator, _) = orchestrator_with_items(dir.path(), 3).await;

        orchestrator.start_scheduler(2).await.unwrap();
        orchestrator.join().await;

        let items = orchestrator.list_work_items().await;
        assert_eq!(items.len(), 3);
        assert!(
            items
                .iter()
                .all(|i| i.status == FeatureStatus::WaitingApproval)
        );
    }

    #[tokio::test]
    async fn test_manual_status_update_publishes_event() {
        let dir = tempdir().unwrap();
        let (orchestrator, items) = orchestrator_with_items(dir.path(), 1).await;
        let mut events = orchestrator.subscribe_events();

        let outcome = orchestrator
            .update_work_item_status(&items[0].id, FeatureStatus::Verified, None, None)
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::Applied);

        let event = events.recv().await.unwrap();
        assert!(matches!(
            event,
            SchedulerEvent::StatusChanged {
                status: FeatureStatus::Verified,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_unknown_id_reports_not_found() {
        let dir = tempdir().unwrap();
        let (orchestrator, _) = orchestrator_with_items(dir.path(), 1).await;
        let outcome = orchestrator
            .update_work_item_status("ghost", FeatureStatus::Verified, None, None)
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::NotFound);
    }
}
