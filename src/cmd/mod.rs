//! CLI subcommand implementations.

use anyhow::Result;
use console::style;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use crate::api::Orchestrator;
use crate::events::SchedulerEvent;
use crate::model::FeatureStatus;

/// Print every work item with its status.
pub async fn list(orchestrator: &Orchestrator) -> Result<()> {
    let items = orchestrator.list_work_items().await;
    if items.is_empty() {
        println!("{}", style("No work items.").dim());
        return Ok(());
    }
    for item in &items {
        let status = match item.status {
            FeatureStatus::Verified => style(item.status.as_str()).green(),
            FeatureStatus::Error => style(item.status.as_str()).red(),
            FeatureStatus::InProgress => style(item.status.as_str()).yellow(),
            _ => style(item.status.as_str()).dim(),
        };
        println!(
            "{}  [{}] {} {}",
            style(&item.id[..item.id.len().min(8)]).cyan(),
            status,
            style(&item.category).magenta(),
            item.description
        );
        if let Some(error) = &item.error {
            println!("          {}", style(error).red().dim());
        }
    }
    Ok(())
}

/// Print a one-line summary of the backlog.
pub async fn status(orchestrator: &Orchestrator) -> Result<()> {
    let items = orchestrator.list_work_items().await;
    let count = |s: FeatureStatus| items.iter().filter(|i| i.status == s).count();
    println!(
        "{} items: {} backlog, {} in progress, {} waiting approval, {} verified, {} error",
        items.len(),
        count(FeatureStatus::Backlog),
        count(FeatureStatus::InProgress),
        count(FeatureStatus::WaitingApproval),
        count(FeatureStatus::Verified),
        count(FeatureStatus::Error),
    );
    Ok(())
}

/// Run the scheduler until the backlog drains or the user interrupts.
pub async fn run(orchestrator: &Orchestrator, parallel: usize) -> Result<()> {
    let mut events = orchestrator.subscribe_events();
    orchestrator.start_scheduler(parallel).await?;
    println!(
        "{} (parallel: {}, ctrl-c to stop)",
        style("Scheduler running").bold(),
        parallel.max(1)
    );

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(SchedulerEvent::RunStarted { item_id }) => {
                    println!("{} {}", style("started").yellow(), item_id);
                }
                Ok(SchedulerEvent::RunFinished { item_id, status }) => {
                    println!("{} {} -> {}", style("finished").bold(), item_id, status);
                }
                Ok(SchedulerEvent::StatusChanged { .. }) => {}
                Ok(SchedulerEvent::Diagnostic { item_id, kind, content }) => {
                    if orchestrator.config().verbose && !content.is_empty() {
                        println!("  {} [{}] {}", style(&item_id[..item_id.len().min(8)]).dim(), kind, style(content).dim());
                    }
                }
                Ok(SchedulerEvent::BacklogDrained { unresolved }) => {
                    if unresolved > 0 {
                        println!(
                            "{}",
                            style(format!(
                                "Backlog drained, {} item(s) left unresolved.",
                                unresolved
                            ))
                            .yellow()
                            .bold()
                        );
                    } else {
                        println!("{}", style("Backlog drained.").green().bold());
                    }
                    break;
                }
                Ok(SchedulerEvent::SchedulerStopped) => break,
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "event subscriber lagged");
                }
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                println!("{}", style("Interrupted, stopping runs...").yellow());
                orchestrator.stop_scheduler().await;
            }
        }
    }

    orchestrator.join().await;
    status(orchestrator).await
}
