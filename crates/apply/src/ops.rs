//! Per-change cluster writes and the wait loop.

use std::future::Future;
use std::time::Instant;

use futures::stream::BoxStream;
use futures::StreamExt;
use metrics::{counter, histogram};
use serde_json::{json, Value as Json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use kade_core::annotations as ann;
use kade_core::{ChangeOp, KadeError, KadeResult, OpStrategy, Resource, ResourceRef};
use kade_diff::{Change, RenderedDiff};
use kade_kubehub::{ClientResult, LabelSelector, PatchMode, Propagation, WatchEvent};

use crate::wait::WaitOutcome;
use crate::{Executor, ServerSide, WaitPolicy};

fn desired(change: &Change) -> KadeResult<&Resource> {
    change.new.as_ref().ok_or_else(|| KadeError::Apply(format!("{}: no desired object", change.description())))
}

fn live(change: &Change) -> KadeResult<&Resource> {
    change.existing.as_ref().ok_or_else(|| KadeError::Apply(format!("{}: no live object", change.description())))
}

async fn next_event(events: &mut Option<BoxStream<'static, WatchEvent>>) {
    match events {
        Some(stream) => {
            if stream.next().await.is_none() {
                *events = None;
            }
        }
        None => std::future::pending().await,
    }
}

impl Executor {
    /// Retry transport failures with exponential backoff.
    pub(crate) async fn retrying<T, F, Fut>(&self, what: &'static str, mut call: F) -> ClientResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ClientResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Err(e) if e.is_transient() && attempt < self.opts.backoff.retries => {
                    let delay = self.opts.backoff.delay(attempt);
                    counter!("apply_retries_total", 1u64, "call" => what);
                    warn!(call = what, attempt, delay_ms = %delay.as_millis(), error = %e, "apply: retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    pub(crate) async fn apply(&self, change: &Change) -> KadeResult<()> {
        let t0 = Instant::now();
        counter!("apply_attempts_total", 1u64, "op" => change.op.as_str());
        let out = match (change.op, change.strategy) {
            (ChangeOp::Create, _) => self.create(change).await,
            (ChangeOp::Update, OpStrategy::AlwaysReplace) => self.replace(change).await,
            (ChangeOp::Update, _) => self.update(change).await,
            (ChangeOp::Delete, OpStrategy::Orphan) => self.disown(change).await,
            (ChangeOp::Delete, _) => self.delete(change).await,
            (ChangeOp::Noop | ChangeOp::Exists, _) => Ok(()),
        };
        histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        out
    }

    async fn create(&self, change: &Change) -> KadeResult<()> {
        let new = desired(change)?;
        if let Some(ssa) = &self.opts.server_side {
            return self.server_side_apply(new, ssa).await;
        }
        match self.retrying("create", || self.client.create(new)).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_already_exists() => match change.strategy {
                OpStrategy::FallbackOnUpdate => self.update_live(change, new, None, true).await,
                OpStrategy::FallbackOnUpdateOrNoop => self.update_live(change, new, None, false).await,
                _ => Err(e.into()),
            },
            Err(e) => Err(e.into()),
        }
    }

    async fn update(&self, change: &Change) -> KadeResult<()> {
        let new = desired(change)?;
        match &self.opts.server_side {
            Some(ssa) if ssa.force => self.server_side_apply(new, ssa).await,
            Some(ssa) => {
                self.fresh_diff(new, Some(&change.diff.approval)).await?;
                self.server_side_apply(new, ssa).await
            }
            None => self.update_live(change, new, Some(&change.diff.approval), false).await,
        }
    }

    /// GET the live object and rebase `new` onto it. With `approval`, the
    /// fresh diff must still be the one that was approved.
    async fn fresh_diff(&self, new: &Resource, approval: Option<&str>) -> KadeResult<(Resource, RenderedDiff)> {
        let target = new.resource_ref();
        let current = self
            .retrying("get", || self.client.get(&target))
            .await?
            .ok_or_else(|| KadeError::Apply(format!("{} disappeared before it could be updated", new.description())))?;
        let (applied, diff) = self.calc.rebase_and_render(&current, new)?;
        if let Some(approved) = approval {
            if !diff.is_empty() && diff.approval != approved {
                counter!("apply_stale_blocked_total", 1u64);
                return Err(KadeError::Conflict(format!(
                    "{}: live object changed since the diff was approved; review the new diff and re-run",
                    new.description()
                )));
            }
        }
        Ok((applied, diff))
    }

    async fn update_live(&self, change: &Change, new: &Resource, approval: Option<&str>, write_if_unchanged: bool) -> KadeResult<()> {
        for attempt in 0..=self.opts.conflict_retries {
            let (applied, diff) = self.fresh_diff(new, approval).await?;
            if diff.is_empty() && !write_if_unchanged {
                debug!(change = %change.description(), "apply: live object already matches");
                return Ok(());
            }
            match self.retrying("update", || self.client.update(&applied)).await {
                Ok(_) => return Ok(()),
                Err(e) if e.is_conflict() => {
                    counter!("apply_conflicts_total", 1u64);
                    debug!(change = %change.description(), attempt, "apply: update conflict, re-reading");
                }
                Err(e) if e.is_invalid() && change.strategy == OpStrategy::FallbackOnReplace => {
                    debug!(change = %change.description(), error = %e, "apply: falling back to replace");
                    return self.replace(change).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(KadeError::Conflict(format!("{}: still conflicting after {} attempts", new.description(), self.opts.conflict_retries + 1)))
    }

    async fn server_side_apply(&self, new: &Resource, ssa: &ServerSide) -> KadeResult<()> {
        let mode = PatchMode::ServerSideApply { field_manager: ssa.field_manager.clone(), force: ssa.force };
        let target = new.resource_ref();
        self.retrying("apply", || self.client.patch(&target, new.raw(), &mode)).await?;
        Ok(())
    }

    /// Delete, wait for the object to go away, create fresh.
    async fn replace(&self, change: &Change) -> KadeResult<()> {
        let new = desired(change)?;
        let target = new.resource_ref();
        match self.retrying("delete", || self.client.delete(&target, Propagation::Foreground)).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
        let gone = async {
            loop {
                if self.retrying("get", || self.client.get(&target)).await?.is_none() {
                    return Ok::<_, KadeError>(());
                }
                tokio::time::sleep(self.opts.poll_interval).await;
            }
        };
        tokio::time::timeout(self.opts.change_timeout, gone)
            .await
            .map_err(|_| KadeError::Apply(format!("{}: still present after delete", new.description())))??;
        self.retrying("create", || self.client.create(new)).await?;
        debug!(change = %change.description(), "apply: replaced");
        Ok(())
    }

    async fn delete(&self, change: &Change) -> KadeResult<()> {
        let target = live(change)?.resource_ref();
        match self.retrying("delete", || self.client.delete(&target, Propagation::Background)).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Stop managing the object: drop the engine labels and leave it running.
    async fn disown(&self, change: &Change) -> KadeResult<()> {
        let target = live(change)?.resource_ref();
        let mut labels = serde_json::Map::new();
        for key in [ann::APP_LABEL, ann::ASSOCIATION_LABEL] {
            labels.insert(key.to_string(), Json::Null);
        }
        let patch = json!({"metadata": {"labels": labels}});
        match self.retrying("patch", || self.client.patch(&target, &patch, &PatchMode::Merge)).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Poll (and watch, when available) until the change's wait policy settles.
    pub(crate) async fn wait_for(&self, change: &Change, token: &CancellationToken) -> KadeResult<()> {
        let policy = WaitPolicy::for_change(change);
        if policy == WaitPolicy::Noop {
            return Ok(());
        }
        let desc = change.description();
        let target: ResourceRef = change.resource().resource_ref();
        let t0 = Instant::now();
        let mut events = match self.client.watch(&target, &LabelSelector::new()).await {
            Ok(s) => Some(s),
            Err(e) => {
                debug!(change = %desc, error = %e, "wait: no watch, polling");
                None
            }
        };
        let mut last = String::new();
        loop {
            let current = self.retrying("get", || self.client.get(&target)).await?;
            let outcome = match (policy, current) {
                (WaitPolicy::Delete, None) => WaitOutcome::ready("deleted"),
                (WaitPolicy::Delete, Some(_)) => WaitOutcome::pending("waiting for deletion"),
                (_, None) => WaitOutcome::pending("waiting for the object to appear"),
                (_, Some(_)) if change.op == ChangeOp::Exists => WaitOutcome::ready("present"),
                (_, Some(obj)) => self.waiter.check(&obj)?,
            };
            if outcome.done {
                histogram!("wait_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
                if outcome.successful {
                    self.ui.notify(&format!("{desc}: {outcome}"));
                    return Ok(());
                }
                return Err(KadeError::Wait(format!("{desc}: {}", outcome.message)));
            }
            if outcome.message != last {
                self.ui.notify(&format!("{desc}: {outcome}"));
                last = outcome.message;
            }
            tokio::select! {
                _ = token.cancelled() => return Err(KadeError::Canceled(desc)),
                _ = next_event(&mut events) => {}
                _ = tokio::time::sleep(self.opts.poll_interval) => {}
            }
        }
    }
}
