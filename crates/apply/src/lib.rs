//! kade apply+wait executor.
//!
//! Walks a [`ChangeGraph`] as a task scheduler: every change whose
//! predecessors are done is spawned (up to `concurrency` at once), applied,
//! then waited on until its readiness predicate settles. Completions
//! release successors; failures either stop scheduling (exit-early) or mark
//! dependents failed and let independent branches finish.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::counter;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kade_core::{ChangeOp, KadeError, KadeResult, MultiError, ObjectKey, OpStrategy, UiSink};
use kade_diff::{Change, ChangeCalculator};
use kade_graph::ChangeGraph;
use kade_kubehub::ResourceClient;

mod ops;
mod wait;

pub use wait::{WaitEvaluator, WaitOutcome, Waiter};

fn wait_poll_interval() -> Duration {
    let ms = std::env::var("KADE_WAIT_POLL_MS").ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(1000);
    Duration::from_millis(ms.max(10))
}

/// Exponential delay for retryable cluster errors: `base * 2^n`, capped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    /// Retries after the first attempt.
    pub retries: u32,
}

impl Default for Backoff {
    fn default() -> Self { Self { base: Duration::from_millis(200), max: Duration::from_secs(10), retries: 5 } }
}

impl Backoff {
    pub fn delay(&self, attempt: u32) -> Duration { self.base.saturating_mul(1u32 << attempt.min(16)).min(self.max) }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSide {
    pub field_manager: String,
    /// Take ownership of conflicting fields; rebase is skipped in this mode.
    pub force: bool,
}

#[derive(Debug, Clone)]
pub struct ExecOptions {
    pub concurrency: usize,
    /// Wait for readiness after applying.
    pub wait: bool,
    /// Bounds one change from its first write through its readiness wait.
    pub change_timeout: Duration,
    pub global_timeout: Option<Duration>,
    pub poll_interval: Duration,
    pub exit_early_on_apply_error: bool,
    pub exit_early_on_wait_error: bool,
    pub server_side: Option<ServerSide>,
    pub backoff: Backoff,
    /// Re-read/re-rebase rounds after an update conflict.
    pub conflict_retries: u32,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            concurrency: 5,
            wait: true,
            change_timeout: Duration::from_secs(15 * 60),
            global_timeout: None,
            poll_interval: wait_poll_interval(),
            exit_early_on_apply_error: true,
            exit_early_on_wait_error: true,
            server_side: None,
            backoff: Backoff::default(),
            conflict_retries: 5,
        }
    }
}

/// What confirms a change once it has been written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitPolicy {
    Reconcile,
    Delete,
    Noop,
}

impl WaitPolicy {
    pub fn for_change(change: &Change) -> Self {
        match (change.op, change.strategy) {
            (ChangeOp::Delete, OpStrategy::Orphan) => Self::Noop,
            (ChangeOp::Delete, _) => Self::Delete,
            _ => Self::Reconcile,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeState {
    Pending,
    Applying,
    Applied,
    Waiting,
    Done,
    Failed,
    /// A predecessor failed; never started.
    FailedByDependency,
    Canceled,
}

impl ChangeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Applying => "applying",
            Self::Applied => "applied",
            Self::Waiting => "waiting",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::FailedByDependency => "failed-by-dependency",
            Self::Canceled => "canceled",
        }
    }
}

impl fmt::Display for ChangeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone)]
pub struct ChangeReport {
    pub key: ObjectKey,
    pub op: ChangeOp,
    pub description: String,
    /// `pending` here means the change was never started.
    pub state: ChangeState,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionReport {
    pub changes: Vec<ChangeReport>,
    /// Keys in the order their tasks started.
    pub started: Vec<ObjectKey>,
    pub took: Duration,
}

impl ExecutionReport {
    pub fn count(&self, state: ChangeState) -> usize { self.changes.iter().filter(|c| c.state == state).count() }
    pub fn successful(&self) -> bool { self.changes.iter().all(|c| c.state == ChangeState::Done) }
    pub fn state_of(&self, key: &ObjectKey) -> Option<ChangeState> { self.changes.iter().find(|c| &c.key == key).map(|c| c.state) }

    pub fn summary(&self) -> String {
        format!(
            "{} done, {} failed, {} canceled, {} not started",
            self.count(ChangeState::Done),
            self.count(ChangeState::Failed) + self.count(ChangeState::FailedByDependency),
            self.count(ChangeState::Canceled),
            self.count(ChangeState::Pending),
        )
    }
}

pub struct Execution {
    pub report: ExecutionReport,
    pub result: KadeResult<()>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Apply,
    Wait,
}

enum TaskEnd {
    Done,
    Canceled,
    Failed { error: KadeError, stage: Stage, timed_out: bool },
}

type StateTx = mpsc::UnboundedSender<(usize, ChangeState)>;

#[derive(Clone)]
pub struct Executor {
    client: Arc<dyn ResourceClient>,
    calc: ChangeCalculator,
    waiter: Waiter,
    ui: Arc<dyn UiSink>,
    opts: ExecOptions,
}

impl Executor {
    pub fn new(client: Arc<dyn ResourceClient>, calc: ChangeCalculator, waiter: Waiter, ui: Arc<dyn UiSink>, opts: ExecOptions) -> Self {
        Self { client, calc, waiter, ui, opts }
    }

    pub fn options(&self) -> &ExecOptions { &self.opts }

    /// Run every change in `graph`. Cancelling `cancel` stops scheduling,
    /// interrupts in-flight tasks and yields a `Canceled` result.
    pub async fn execute(&self, graph: &ChangeGraph, cancel: &CancellationToken) -> Execution {
        let t0 = Instant::now();
        let n = graph.len();
        let run = cancel.child_token();
        let mut states = vec![ChangeState::Pending; n];
        let mut messages = vec![String::new(); n];
        let mut remaining: Vec<usize> = (0..n).map(|i| graph.preds(i).len()).collect();
        let mut ready: VecDeque<usize> = (0..n).filter(|&i| remaining[i] == 0).collect();
        let mut started = Vec::new();
        let mut errors = MultiError::new();
        let mut halted = false;
        let mut timed_out = false;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut tasks = JoinSet::new();

        let deadline = self.opts.global_timeout.map(|d| tokio::time::Instant::now() + d);
        let global = async move {
            match deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(global);

        loop {
            while !halted && !run.is_cancelled() && tasks.len() < self.opts.concurrency.max(1) {
                let Some(i) = ready.pop_front() else { break };
                if states[i] != ChangeState::Pending {
                    continue;
                }
                states[i] = ChangeState::Applying;
                started.push(i);
                let change = graph.node(i).change.clone();
                let exec = self.clone();
                let tx = tx.clone();
                let token = run.clone();
                tasks.spawn(async move { (i, exec.run_change(i, &change, &tx, &token).await) });
            }
            if tasks.is_empty() {
                break;
            }
            tokio::select! {
                joined = tasks.join_next() => {
                    while let Ok((j, s)) = rx.try_recv() {
                        states[j] = s;
                    }
                    let (i, end) = match joined {
                        Some(Ok(done)) => done,
                        Some(Err(e)) => {
                            errors.push(KadeError::Apply(format!("executor task aborted: {e}")));
                            halted = true;
                            continue;
                        }
                        None => continue,
                    };
                    match end {
                        TaskEnd::Done => {
                            states[i] = ChangeState::Done;
                            release(graph, i, &mut remaining, &mut ready);
                        }
                        TaskEnd::Canceled => states[i] = ChangeState::Canceled,
                        TaskEnd::Failed { error, stage, timed_out: change_timed_out } => {
                            states[i] = ChangeState::Failed;
                            messages[i] = error.to_string();
                            let exit_early = match stage {
                                Stage::Apply => self.opts.exit_early_on_apply_error,
                                Stage::Wait => self.opts.exit_early_on_wait_error,
                            };
                            halted |= exit_early;
                            if stage == Stage::Wait && change_timed_out && !self.opts.exit_early_on_wait_error {
                                release(graph, i, &mut remaining, &mut ready);
                            } else {
                                fail_dependents(graph, i, &mut states, &mut messages);
                            }
                            warn!(change = %graph.node(i).change.description(), error = %error, "apply: change failed");
                            errors.push(error);
                        }
                    }
                }
                Some((j, s)) = rx.recv() => states[j] = s,
                _ = &mut global, if !timed_out => {
                    timed_out = true;
                    run.cancel();
                    let limit = self.opts.global_timeout.unwrap_or_default();
                    errors.push(KadeError::Wait(format!("deploy exceeded its global timeout of {}s", limit.as_secs())));
                }
            }
        }

        let report = ExecutionReport {
            changes: graph
                .nodes()
                .iter()
                .enumerate()
                .map(|(i, node)| ChangeReport {
                    key: node.change.key(),
                    op: node.change.op,
                    description: node.change.description(),
                    state: states[i],
                    message: std::mem::take(&mut messages[i]),
                })
                .collect(),
            started: started.iter().map(|&i| graph.node(i).change.key()).collect(),
            took: t0.elapsed(),
        };
        info!(
            changes = n,
            done = report.count(ChangeState::Done),
            failed = report.count(ChangeState::Failed),
            took_ms = %report.took.as_millis(),
            "apply: graph executed"
        );
        let result = if cancel.is_cancelled() {
            Err(KadeError::Canceled(report.summary()))
        } else {
            errors.into_result()
        };
        Execution { report, result }
    }

    async fn run_change(&self, i: usize, change: &Change, tx: &StateTx, token: &CancellationToken) -> TaskEnd {
        let desc = change.description();
        let deadline = tokio::time::Instant::now() + self.opts.change_timeout;
        if change.op.mutates() {
            self.ui.notify(&format!("{desc}: applying"));
            let applied = tokio::select! {
                r = tokio::time::timeout_at(deadline, self.apply(change)) => r,
                _ = token.cancelled() => return TaskEnd::Canceled,
            };
            let applied = applied.unwrap_or_else(|_| Err(KadeError::Apply(format!("not applied within {}s", self.opts.change_timeout.as_secs()))));
            if let Err(error) = applied {
                counter!("apply_errors_total", 1u64, "op" => change.op.as_str());
                return TaskEnd::Failed { error: error.context(&desc), stage: Stage::Apply, timed_out: false };
            }
            let _ = tx.send((i, ChangeState::Applied));
        }
        if !self.opts.wait {
            return TaskEnd::Done;
        }
        let _ = tx.send((i, ChangeState::Waiting));
        match tokio::time::timeout_at(deadline, self.wait_for(change, token)).await {
            Ok(Ok(())) => {
                debug!(change = %desc, "apply: change done");
                TaskEnd::Done
            }
            Ok(Err(KadeError::Canceled(_))) => TaskEnd::Canceled,
            Ok(Err(error)) => TaskEnd::Failed { error, stage: Stage::Wait, timed_out: false },
            Err(_) => {
                let error = KadeError::Wait(format!("{desc}: not reconciled within {}s", self.opts.change_timeout.as_secs()));
                TaskEnd::Failed { error, stage: Stage::Wait, timed_out: true }
            }
        }
    }
}

fn release(graph: &ChangeGraph, i: usize, remaining: &mut [usize], ready: &mut VecDeque<usize>) {
    for &s in graph.succs(i) {
        remaining[s] -= 1;
        if remaining[s] == 0 {
            ready.push_back(s);
        }
    }
}

fn fail_dependents(graph: &ChangeGraph, i: usize, states: &mut [ChangeState], messages: &mut [String]) {
    let cause = graph.node(i).change.description();
    let mut stack: Vec<usize> = graph.succs(i).to_vec();
    while let Some(s) = stack.pop() {
        if states[s] != ChangeState::Pending {
            continue;
        }
        states[s] = ChangeState::FailedByDependency;
        messages[s] = format!("not applied: depends on failed {cause}");
        stack.extend_from_slice(graph.succs(s));
    }
}
