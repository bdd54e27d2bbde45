//! Run scheduling over the persisted backlog.
//!
//! A single coordinator task repeatedly selects the next eligible work item
//! and launches an agent run for it, keeping at most `limit` runs in flight
//! and at most one run per item id. Terminal records decide the item's final
//! status; every transition is published on a broadcast bus that never
//! blocks the engine.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, Notify, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::errors::SchedulerError;
use crate::events::SchedulerEvent;
use crate::model::{FeatureStatus, WorkItem};
use crate::runner::{AgentRunner, RunOutcome};
use crate::store::{UpdateOutcome, WorkItemStore};
use crate::stream::{RecordKind, RunRecord};

const EVENT_BUS_CAPACITY: usize = 256;

/// Launch ceiling per item per session. Failed items go back to the pool
/// and are retried until this runs out; what is left unresolved is reported
/// when the backlog drains.
const MAX_SESSION_ATTEMPTS: u32 = 3;

struct RunHandle {
    cancel: CancellationToken,
}

struct Inner {
    running: HashMap<String, RunHandle>,
    limit: usize,
    stopping: bool,
    coordinator: Option<JoinHandle<()>>,
}

pub struct Scheduler {
    store: Arc<WorkItemStore>,
    runner: Arc<dyn AgentRunner>,
    events: broadcast::Sender<SchedulerEvent>,
    inner: Mutex<Inner>,
    wake: Notify,
}

/// Result of one selection attempt by the coordinator.
enum Launch {
    Started,
    AtCapacity,
    NothingEligible {
        running: usize,
        /// Items still selectable but out of attempts for this session.
        unresolved: usize,
    },
}

/// What a finished run means for the item's persisted state.
#[derive(Debug, PartialEq, Eq)]
enum Resolution {
    Update {
        status: FeatureStatus,
        summary: Option<String>,
        error: Option<String>,
    },
    /// Cancelled before any terminal record; the item keeps its current
    /// status and stays selectable for a later session.
    LeaveAsIs,
}

impl Scheduler {
    pub fn new(store: Arc<WorkItemStore>, runner: Arc<dyn AgentRunner>) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self {
            store,
            runner,
            events,
            inner: Mutex::new(Inner {
                running: HashMap::new(),
                limit: 1,
                stopping: false,
                coordinator: None,
            }),
            wake: Notify::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    /// Publish an event on the bus. No subscribers is fine.
    pub(crate) fn publish(&self, event: SchedulerEvent) {
        let _ = self.events.send(event);
    }

    /// Nudge the coordinator, e.g. after an external backlog edit.
    pub fn kick(&self) {
        self.wake.notify_one();
    }

    pub async fn running_count(&self) -> usize {
        self.inner.lock().await.running.len()
    }

    pub async fn set_concurrency(&self, limit: usize) {
        self.inner.lock().await.limit = limit.max(1);
        self.wake.notify_one();
    }

    /// Start the coordinator with the given concurrency ceiling.
    pub async fn start(self: &Arc<Self>, limit: usize) -> Result<(), SchedulerError> {
        let mut inner = self.inner.lock().await;
        if inner
            .coordinator
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
        {
            return Err(SchedulerError::AlreadyRunning);
        }
        inner.limit = limit.max(1);
        inner.stopping = false;

        let scheduler = Arc::clone(self);
        inner.coordinator = Some(tokio::spawn(async move {
            scheduler.coordinate().await;
        }));
        info!(limit = limit.max(1), "scheduler started");
        Ok(())
    }

    /// Cancel every in-flight run and let the coordinator wind down. Runs
    /// that had not reached a terminal record keep their current status.
    pub async fn stop(&self) {
        let inner = &mut *self.inner.lock().await;
        inner.stopping = true;
        for handle in inner.running.values() {
            handle.cancel.cancel();
        }
        self.wake.notify_one();
        info!("scheduler stop requested");
    }

    /// Wait for the coordinator and all in-flight runs to finish.
    pub async fn join(&self) {
        let coordinator = self.inner.lock().await.coordinator.take();
        if let Some(handle) = coordinator {
            if let Err(e) = handle.await {
                error!(error = %e, "coordinator task panicked");
            }
        }
        loop {
            if self.inner.lock().await.running.is_empty() {
                return;
            }
            self.wake.notified().await;
        }
    }

    async fn coordinate(self: Arc<Self>) {
        // Per-session launch counters; a failed item goes back into the
        // pool until its attempts run out.
        let mut attempts: HashMap<String, u32> = HashMap::new();
        loop {
            if self.inner.lock().await.stopping {
                break;
            }
            match self.try_launch(&mut attempts).await {
                Launch::Started => continue,
                Launch::AtCapacity => self.wake.notified().await,
                Launch::NothingEligible {
                    running: 0,
                    unresolved,
                } => {
                    if unresolved > 0 {
                        warn!(unresolved, "backlog drained with unresolved items");
                    } else {
                        info!("backlog drained, no runnable work items remain");
                    }
                    self.publish(SchedulerEvent::BacklogDrained { unresolved });
                    break;
                }
                Launch::NothingEligible { .. } => self.wake.notified().await,
            }
        }
        self.publish(SchedulerEvent::SchedulerStopped);
        debug!("coordinator exited");
    }

    async fn try_launch(self: &Arc<Self>, attempts: &mut HashMap<String, u32>) -> Launch {
        let items = self.store.load().await;
        let mut inner = self.inner.lock().await;
        if inner.running.len() >= inner.limit {
            return Launch::AtCapacity;
        }
        let next = items.iter().find(|item| {
            item.status.is_auto_selectable()
                && !inner.running.contains_key(&item.id)
                && attempts.get(&item.id).copied().unwrap_or(0) < MAX_SESSION_ATTEMPTS
        });
        let Some(item) = next else {
            let unresolved = items
                .iter()
                .filter(|item| {
                    item.status.is_auto_selectable() && !inner.running.contains_key(&item.id)
                })
                .count();
            return Launch::NothingEligible {
                running: inner.running.len(),
                unresolved,
            };
        };

        *attempts.entry(item.id.clone()).or_insert(0) += 1;
        let item = item.clone();
        let cancel = CancellationToken::new();
        inner.running.insert(
            item.id.clone(),
            RunHandle {
                cancel: cancel.clone(),
            },
        );
        drop(inner);

        self.launch(item, cancel).await;
        Launch::Started
    }

    async fn launch(self: &Arc<Self>, item: WorkItem, cancel: CancellationToken) {
        info!(id = %item.id, category = %item.category, "launching agent run");

        // Marked in-progress before the run so a crash leaves a record that
        // is still selectable on the next session.
        if let Err(e) = self
            .store
            .update_status(&item.id, FeatureStatus::InProgress, None, None)
            .await
        {
            error!(id = %item.id, error = %e, "failed to mark work item in progress");
            self.release(&item.id).await;
            return;
        }
        self.publish(SchedulerEvent::StatusChanged {
            item_id: item.id.clone(),
            status: FeatureStatus::InProgress,
        });
        self.publish(SchedulerEvent::RunStarted {
            item_id: item.id.clone(),
        });

        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let (tx, mut rx) = mpsc::channel::<RunRecord>(64);
            let item_id = item.id.clone();

            let consumer = async {
                let mut terminal: Option<RunRecord> = None;
                while let Some(record) = rx.recv().await {
                    scheduler.publish(SchedulerEvent::Diagnostic {
                        item_id: item_id.clone(),
                        kind: record.kind.as_str().to_string(),
                        content: record.content.clone(),
                    });
                    if record.is_terminal() {
                        terminal = Some(record);
                    }
                }
                terminal
            };

            let (outcome, terminal) =
                tokio::join!(scheduler.runner.run(&item, tx, cancel), consumer);
            scheduler.finish_run(&item.id, outcome, terminal).await;
        });
    }

    async fn finish_run(&self, id: &str, outcome: RunOutcome, terminal: Option<RunRecord>) {
        let resolution = resolve_outcome(&outcome, terminal.as_ref());
        let status = match resolution {
            Resolution::Update {
                status,
                summary,
                error,
            } => {
                match self.store.update_status(id, status, summary, error).await {
                    Ok(UpdateOutcome::Applied) => {
                        self.publish(SchedulerEvent::StatusChanged {
                            item_id: id.to_string(),
                            status,
                        });
                    }
                    Ok(UpdateOutcome::NotFound) => {
                        warn!(id, "finished run for a work item that no longer exists");
                    }
                    Err(e) => error!(id, error = %e, "failed to persist run outcome"),
                }
                status
            }
            Resolution::LeaveAsIs => FeatureStatus::InProgress,
        };
        info!(id, status = status.as_str(), "agent run finished");
        self.publish(SchedulerEvent::RunFinished {
            item_id: id.to_string(),
            status,
        });
        self.release(id).await;
    }

    async fn release(&self, id: &str) {
        self.inner.lock().await.running.remove(id);
        self.wake.notify_one();
    }
}

/// Map a run's terminal record (or its absence) to the item's next state.
fn resolve_outcome(outcome: &RunOutcome, terminal: Option<&RunRecord>) -> Resolution {
    if let Some(record) = terminal {
        if record.kind == RecordKind::Error {
            return Resolution::Update {
                status: FeatureStatus::Error,
                summary: None,
                error: Some(record.content.clone()),
            };
        }
        // A result record: the agent's own verdict wins over the exit code.
        let payload = record.payload.as_ref();
        let is_error = payload
            .and_then(|p| p.get("is_error"))
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if is_error {
            return Resolution::Update {
                status: FeatureStatus::Error,
                summary: None,
                error: Some(record.content.clone()),
            };
        }
        let verified = payload
            .and_then(|p| p.get("status"))
            .and_then(|v| v.as_str())
            == Some("verified");
        let status = if verified {
            FeatureStatus::Verified
        } else {
            FeatureStatus::WaitingApproval
        };
        let summary = if record.content.is_empty() {
            None
        } else {
            Some(record.content.clone())
        };
        return Resolution::Update {
            status,
            summary,
            error: None,
        };
    }

    if outcome.cancelled {
        return Resolution::LeaveAsIs;
    }
    if outcome.timed_out {
        return Resolution::Update {
            status: FeatureStatus::Error,
            summary: None,
            error: Some("Agent run produced no output within the idle window".to_string()),
        };
    }
    if outcome.clean_success() {
        // Clean exit, no verdict: done but unreviewed.
        return Resolution::Update {
            status: FeatureStatus::WaitingApproval,
            summary: None,
            error: None,
        };
    }
    let message = if !outcome.stderr.trim().is_empty() {
        format!("Agent failed: {}", outcome.stderr.trim())
    } else {
        match outcome.exit_code {
            Some(code) => format!("Agent process exited with code {}", code),
            None => "Agent process was terminated unexpectedly".to_string(),
        }
    };
    Resolution::Update {
        status: FeatureStatus::Error,
        summary: None,
        error: Some(message),
    }
}
