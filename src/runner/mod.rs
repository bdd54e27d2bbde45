//! Agent subprocess execution.
//!
//! One `execute` call owns one external process: spawn with an overridable
//! environment, stream stdout records to the caller, accumulate stderr for
//! diagnostics, watch for silence with an idle watchdog, honor cooperative
//! cancellation, and interpret the exit code. Failures are reported as
//! terminal stream records plus a `RunOutcome` — nothing is thrown past the
//! stream boundary, so the scheduler sees one uniform signal shape.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::authz::PathAuthorizer;
use crate::config::OrchestratorConfig;
use crate::errors::RunnerError;
use crate::model::WorkItem;
use crate::stream::{RecordStream, RunRecord};

/// Grace window between the graceful termination signal and a forced kill.
pub const KILL_GRACE: Duration = Duration::from_secs(5);

/// Everything needed to launch one agent process.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    /// Overrides applied on top of the inherited environment.
    pub env: HashMap<String, String>,
    pub idle_timeout: Duration,
}

/// Terminal result of one run, alongside whatever records were streamed.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Exit code; `None` when the process died from a signal or never spawned.
    pub exit_code: Option<i32>,
    /// Full captured stderr, used only for failure diagnostics.
    pub stderr: String,
    pub records_emitted: usize,
    pub cancelled: bool,
    pub timed_out: bool,
}

impl RunOutcome {
    pub fn clean_success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Seam between the scheduler and real subprocess execution.
/// Real implementation: `ClaudeRunner`. Tests script their own.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(
        &self,
        item: &WorkItem,
        records: mpsc::Sender<RunRecord>,
        cancel: CancellationToken,
    ) -> RunOutcome;
}

/// Runs the Claude CLI in stream-json mode against a single work item.
pub struct ClaudeRunner {
    config: OrchestratorConfig,
    authz: Arc<dyn PathAuthorizer>,
}

impl ClaudeRunner {
    pub fn new(config: OrchestratorConfig, authz: Arc<dyn PathAuthorizer>) -> Self {
        Self { config, authz }
    }

    fn request_for(&self, item: &WorkItem) -> RunRequest {
        let mut args = self.config.agent_flags();
        if let Some(model) = &item.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        args.push("-p".to_string());
        args.push(build_prompt(item));

        // Runs execute inside the item's worktree when one is annotated.
        let working_dir = item
            .worktree_path
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.config.project_dir.clone());

        RunRequest {
            program: self.config.agent_cmd.clone(),
            args,
            working_dir,
            env: HashMap::new(),
            idle_timeout: self.config.idle_timeout,
        }
    }
}

#[async_trait]
impl AgentRunner for ClaudeRunner {
    async fn run(
        &self,
        item: &WorkItem,
        records: mpsc::Sender<RunRecord>,
        cancel: CancellationToken,
    ) -> RunOutcome {
        let request = self.request_for(item);
        if let Err(e) = self.authz.authorize(&request.working_dir) {
            warn!(id = %item.id, error = %e, "working directory rejected");
            let _ = records
                .send(RunRecord::terminal_error(format!(
                    "Refusing to run in unauthorized directory: {}",
                    e
                )))
                .await;
            return RunOutcome {
                exit_code: None,
                stderr: String::new(),
                records_emitted: 1,
                cancelled: false,
                timed_out: false,
            };
        }
        execute(&request, &records, &cancel).await
    }
}

fn build_prompt(item: &WorkItem) -> String {
    let mut prompt = format!(
        "Implement the following feature.\n\n## FEATURE ({})\n{}\n",
        item.category, item.description
    );
    if !item.steps.is_empty() {
        prompt.push_str("\n## STEPS\n");
        for (i, step) in item.steps.iter().enumerate() {
            prompt.push_str(&format!("{}. {}\n", i + 1, step));
        }
    }
    prompt.push_str(
        "\nWhen the work is complete, emit a final result record summarizing the outcome.\n",
    );
    prompt
}

/// Launch the process described by `request` and pump its records into
/// `records` until the stream closes and the process exits. Both must
/// complete before this returns.
pub async fn execute(
    request: &RunRequest,
    records: &mpsc::Sender<RunRecord>,
    cancel: &CancellationToken,
) -> RunOutcome {
    let mut cmd = Command::new(&request.program);
    cmd.args(&request.args)
        .envs(&request.env)
        .current_dir(&request.working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    // Own process group, so termination reaches whatever the agent spawns
    // and not just the direct child.
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(source) => {
            let err = RunnerError::SpawnFailed {
                program: request.program.clone(),
                source,
            };
            warn!(error = %err, "failed to spawn agent process");
            let _ = records.send(RunRecord::terminal_error(err.to_string())).await;
            return RunOutcome {
                exit_code: None,
                stderr: String::new(),
                records_emitted: 1,
                cancelled: false,
                timed_out: false,
            };
        }
    };

    debug!(program = %request.program, pid = child.id(), "agent process spawned");

    let stderr = child.stderr.take();
    let stderr_task = tokio::spawn(async move {
        let mut content = String::new();
        if let Some(stderr) = stderr {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                content.push_str(&line);
                content.push('\n');
            }
        }
        content
    });

    let mut emitted = 0usize;
    let mut cancelled = false;
    let mut timed_out = false;

    if let Some(stdout) = child.stdout.take() {
        let (activity_tx, activity_rx) = watch::channel(Instant::now());
        let mut stream = RecordStream::new(stdout, activity_tx);
        let mut terminating = false;
        let mut kill_at: Option<Instant> = None;
        let mut drain_until: Option<Instant> = None;

        loop {
            let idle_deadline = *activity_rx.borrow() + request.idle_timeout;
            let kill_deadline =
                kill_at.unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400));
            let drain_deadline =
                drain_until.unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400));

            tokio::select! {
                next = stream.next_record() => match next {
                    Ok(Some(record)) => {
                        emitted += 1;
                        debug!(kind = record.kind.as_str(), "agent record");
                        // A closed receiver is not our problem; keep draining
                        // so the child can exit.
                        let _ = records.send(record).await;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let err = RunnerError::StreamRead(e);
                        warn!(error = %err, "agent stdout read failed");
                        let _ = records.send(RunRecord::terminal_error(err.to_string())).await;
                        emitted += 1;
                        if !terminating {
                            terminate(&mut child);
                        }
                        break;
                    }
                },
                _ = sleep_until(idle_deadline), if !terminating => {
                    warn!(
                        idle_ms = request.idle_timeout.as_millis() as u64,
                        "agent produced no output within the idle window, terminating"
                    );
                    timed_out = true;
                    terminate(&mut child);
                    terminating = true;
                    kill_at = Some(Instant::now() + KILL_GRACE);
                }
                _ = cancel.cancelled(), if !terminating => {
                    debug!("cancellation requested, terminating agent");
                    cancelled = true;
                    terminate(&mut child);
                    terminating = true;
                    kill_at = Some(Instant::now() + KILL_GRACE);
                }
                _ = sleep_until(kill_deadline), if kill_at.is_some() => {
                    warn!("agent ignored termination signal, killing");
                    force_kill(&mut child);
                    kill_at = None;
                    // Give the pipe one more grace window to close, then
                    // stop waiting on it.
                    drain_until = Some(Instant::now() + KILL_GRACE);
                }
                _ = sleep_until(drain_deadline), if drain_until.is_some() => {
                    warn!("agent output pipe still open after kill, abandoning drain");
                    break;
                }
            }
        }
    }

    // The stream is done; the process must still be reaped. Give it the
    // grace window, then force the issue.
    let exit_code = match tokio::time::timeout(KILL_GRACE, child.wait()).await {
        Ok(Ok(status)) => status.code(),
        Ok(Err(e)) => {
            warn!(error = %e, "failed waiting for agent exit");
            None
        }
        Err(_) => {
            warn!("agent did not exit within the grace window, killing");
            force_kill(&mut child);
            child.wait().await.ok().and_then(|s| s.code())
        }
    };

    let stderr = stderr_task.await.unwrap_or_default();

    // A failed run that never spoke still owes the caller one terminal
    // record, built from whatever diagnostics exist.
    if exit_code != Some(0) && emitted == 0 {
        let message = if !stderr.trim().is_empty() {
            format!("Agent failed: {}", stderr.trim())
        } else {
            match exit_code {
                Some(code) => format!("Agent process exited with code {} and no output", code),
                None => "Agent process was terminated before producing output".to_string(),
            }
        };
        let _ = records.send(RunRecord::terminal_error(message)).await;
        emitted += 1;
    }

    debug!(
        exit_code,
        records = emitted,
        cancelled,
        timed_out,
        "agent run finished"
    );

    RunOutcome {
        exit_code,
        stderr,
        records_emitted: emitted,
        cancelled,
        timed_out,
    }
}

/// Signal the child's whole process group. `false` when the child has
/// already been reaped or the signal could not be delivered.
#[cfg(unix)]
fn signal_group(child: &Child, signal: libc::c_int) -> bool {
    match child.id() {
        Some(pid) => unsafe { libc::kill(-(pid as libc::pid_t), signal) == 0 },
        None => false,
    }
}

/// Ask the child to exit. On unix this is SIGTERM to the process group so
/// the agent and its descendants can shut down in an orderly way; the
/// caller escalates to a kill if it is ignored.
fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if signal_group(child, libc::SIGTERM) {
        return;
    }
    if let Err(e) = child.start_kill() {
        warn!(error = %e, "failed to signal agent process");
    }
}

/// Hard-kill the child and, on unix, its whole process group.
fn force_kill(child: &mut Child) {
    #[cfg(unix)]
    if signal_group(child, libc::SIGKILL) {
        return;
    }
    if let Err(e) = child.start_kill() {
        warn!(error = %e, "failed to kill agent process");
    }
}
