//! kade change calculator.
//!
//! Pairs existing and new resources by identity, rebases each pair, derives
//! the operation (honouring the strategy annotations) and renders a
//! line-numbered diff. Output is ordered by namespace, kind, name, group.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use tracing::{debug, info};

use kade_core::annotations as ann;
use kade_core::{parse_duration, ChangeOp, Config, KadeError, KadeResult, ObjectKey, OpStrategy, Resource};
use kade_rebase::Rebaser;
use kade_versioned::{renewal_due, timestamp};

mod filter;
mod render;

pub use filter::{DiffFilter, LabelFilter};
pub use render::{strip_noisy, unified, RenderedDiff};

const DEFAULT_CONFIG: &str = r#"
diffMaskRules:
- path: [data]
  resourceMatchers:
  - apiVersionKindMatcher: {apiVersion: v1, kind: Secret}
- path: [stringData]
  resourceMatchers:
  - apiVersionKindMatcher: {apiVersion: v1, kind: Secret}
"#;

/// Secret payloads are masked unless the user opts out.
pub fn default_config() -> KadeResult<Config> { Config::from_yaml(DEFAULT_CONFIG) }

#[derive(Debug, Clone)]
pub struct CalcOptions {
    pub context_lines: usize,
    /// Apply `diffMaskRules` when rendering.
    pub mask: bool,
    pub now: DateTime<Utc>,
}

impl Default for CalcOptions {
    fn default() -> Self { Self { context_lines: 2, mask: true, now: Utc::now() } }
}

/// One pending transition for a single resource identity.
#[derive(Debug, Clone)]
pub struct Change {
    pub op: ChangeOp,
    pub strategy: OpStrategy,
    pub existing: Option<Resource>,
    /// Desired object, carrying the `kade.dev/original` annotation.
    pub new: Option<Resource>,
    /// What the executor writes: `new` after rebasing onto `existing`.
    pub applied: Option<Resource>,
    pub diff: RenderedDiff,
    /// Dropped by a diff filter or `update-strategy: skip`.
    pub ignored: bool,
}

impl Change {
    /// The side that identifies this change (new when present).
    pub fn resource(&self) -> &Resource {
        match (&self.new, &self.existing) {
            (Some(r), _) | (None, Some(r)) => r,
            // constructed only by the calculator, which always sets one side
            (None, None) => unreachable!("change without resources"),
        }
    }

    pub fn key(&self) -> ObjectKey { self.resource().key() }

    pub fn description(&self) -> String { format!("{} {}", self.op, self.resource().description()) }

    /// Header plus the rendered diff, as shown before approval.
    pub fn render(&self) -> String {
        let mut out = format!("@@ {} @@", self.description());
        if self.strategy != OpStrategy::Default {
            out.push_str(&format!(" ({})", self.strategy));
        }
        out.push('\n');
        out.push_str(&self.diff.text);
        out
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSummary {
    pub ops: BTreeMap<ChangeOp, usize>,
    pub ignored: usize,
}

impl ChangeSummary {
    pub fn from_changes<'a>(changes: impl IntoIterator<Item = &'a Change>) -> Self {
        let mut s = Self::default();
        for c in changes {
            if c.ignored {
                s.ignored += 1;
                continue;
            }
            *s.ops.entry(c.op).or_default() += 1;
        }
        s
    }

    pub fn count(&self, op: ChangeOp) -> usize { self.ops.get(&op).copied().unwrap_or(0) }

    /// Changes that write to the cluster.
    pub fn pending(&self) -> usize { ChangeOp::ALL.iter().filter(|op| op.mutates()).map(|op| self.count(*op)).sum() }
}

impl fmt::Display for ChangeSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = ChangeOp::ALL.iter().map(|op| format!("{} {op}", self.count(*op))).collect();
        write!(f, "Op: {}", parts.join(", "))?;
        if self.ignored > 0 {
            write!(f, " ({} ignored)", self.ignored)?;
        }
        Ok(())
    }
}

/// Record what the engine submitted so later rebases can tell user-owned
/// fields from server defaults.
pub fn with_original(res: &Resource) -> KadeResult<Resource> {
    let mut out = res.clone();
    out.remove_annotation(ann::ORIGINAL);
    let mut raw = out.raw().clone();
    if let Some(meta) = raw.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        for k in ["resourceVersion", "uid", "creationTimestamp", "generation", "managedFields"] {
            meta.remove(k);
        }
    }
    let compact = serde_json::to_string(&raw)?;
    out.set_annotation(ann::ORIGINAL, &compact);
    Ok(out)
}

#[derive(Clone)]
pub struct ChangeCalculator {
    rebaser: Rebaser,
    config: Arc<Config>,
    opts: CalcOptions,
}

impl ChangeCalculator {
    pub fn new(rebaser: Rebaser, opts: CalcOptions) -> Self {
        let config = rebaser.config().clone();
        Self { rebaser, config, opts }
    }

    pub fn rebaser(&self) -> &Rebaser { &self.rebaser }

    fn mask_rules(&self) -> &[kade_core::config::PathRule] {
        if self.opts.mask {
            &self.config.diff_mask_rules
        } else {
            &[]
        }
    }

    /// Rebase `new` onto a (possibly refreshed) live object and render the
    /// result. Returns the object to write and its diff.
    pub fn rebase_and_render(&self, existing: &Resource, new: &Resource) -> KadeResult<(Resource, RenderedDiff)> {
        let applied = self.rebaser.rebase(existing, new)?;
        let diff = if strip_noisy(existing.raw().clone()) == strip_noisy(applied.raw().clone()) {
            RenderedDiff::default()
        } else {
            render::render_pair(Some(existing), Some(&applied), self.mask_rules(), self.opts.context_lines)?
        };
        Ok((applied, diff))
    }

    /// Resources without the engine's own renewal bookkeeping (non-versioned)
    /// get `last-renewed-time` from the live object until renewal is due.
    fn stamp_renewal(&self, new: &mut Resource, existing: Option<&Resource>) -> KadeResult<()> {
        if new.has_annotation(ann::VERSIONED_ORIGINAL_NAME) {
            return Ok(());
        }
        let Some(raw) = new.annotation(ann::RENEW_DURATION).or_else(|| new.annotation(ann::MAX_DURATION)) else {
            return Ok(());
        };
        let every = parse_duration(raw).map_err(|e| e.context(format!("{}: {}", new.description(), ann::RENEW_DURATION)))?;
        let stamp = match existing.filter(|e| !renewal_due(e, every, self.opts.now)).and_then(|e| e.annotation(ann::LAST_RENEWED_TIME)) {
            Some(kept) => kept.to_string(),
            None => timestamp(self.opts.now),
        };
        new.set_annotation(ann::LAST_RENEWED_TIME, &stamp);
        Ok(())
    }

    /// Change for one pair; at least one side must be present.
    pub fn calculate_one(&self, existing: Option<&Resource>, new: Option<&Resource>) -> KadeResult<Change> {
        let ctx = self.opts.context_lines;
        match (existing, new) {
            (None, Some(n)) => {
                let mut n = n.clone();
                self.stamp_renewal(&mut n, None)?;
                let n = with_original(&n)?;
                if n.has_annotation(ann::NOOP) || n.has_annotation(ann::EXISTS) {
                    return Ok(Change { op: ChangeOp::Exists, strategy: OpStrategy::Default, existing: None, new: Some(n), applied: None, diff: RenderedDiff::default(), ignored: false });
                }
                let strategy = OpStrategy::for_create(&n)?;
                let diff = render::render_pair(None, Some(&n), self.mask_rules(), ctx)?;
                Ok(Change { op: ChangeOp::Create, strategy, existing: None, applied: Some(n.clone()), new: Some(n), diff, ignored: false })
            }
            (Some(e), Some(n)) => {
                let mut n = n.clone();
                self.stamp_renewal(&mut n, Some(e))?;
                let n = with_original(&n)?;
                let base = Change { op: ChangeOp::Noop, strategy: OpStrategy::Default, existing: Some(e.clone()), new: Some(n.clone()), applied: None, diff: RenderedDiff::default(), ignored: false };
                if n.has_annotation(ann::EXISTS) {
                    return Ok(Change { op: ChangeOp::Exists, ..base });
                }
                if n.has_annotation(ann::NOOP) {
                    return Ok(base);
                }
                let strategy = OpStrategy::for_update(&n)?;
                let (applied, diff) = self.rebase_and_render(e, &n)?;
                if diff.is_empty() && strategy != OpStrategy::AlwaysReplace {
                    return Ok(Change { strategy, applied: Some(applied), ..base });
                }
                if strategy == OpStrategy::Skip {
                    return Ok(Change { strategy, applied: Some(applied), diff, ignored: true, ..base });
                }
                Ok(Change { op: ChangeOp::Update, strategy, applied: Some(applied), diff, ..base })
            }
            (Some(e), None) => {
                let strategy = OpStrategy::for_delete(e)?;
                let diff = render::render_pair(Some(e), None, self.mask_rules(), ctx)?;
                Ok(Change { op: ChangeOp::Delete, strategy, existing: Some(e.clone()), new: None, applied: None, diff, ignored: false })
            }
            (None, None) => Err(KadeError::validation("change calculation needs an existing or a new resource")),
        }
    }

    /// Pair by identity and derive every change.
    pub fn calculate(&self, existing: &[Resource], new: &[Resource]) -> KadeResult<Vec<Change>> {
        let t0 = Instant::now();
        let mut by_key: FxHashMap<ObjectKey, &Resource> = existing.iter().map(|e| (e.key(), e)).collect();
        let mut changes = Vec::with_capacity(new.len() + existing.len());
        for n in new {
            let e = by_key.remove(&n.key());
            changes.push(self.calculate_one(e, Some(n))?);
        }
        for e in existing {
            if !by_key.contains_key(&e.key()) {
                continue;
            }
            // controller-created children inherit engine labels; their owner
            // deletes them
            if !e.owner_refs().is_empty() {
                debug!(resource = %e.description(), "diff: skipping owned resource");
                continue;
            }
            changes.push(self.calculate_one(Some(e), None)?);
        }
        changes.sort_by_key(Change::key);
        let summary = ChangeSummary::from_changes(&changes);
        info!(changes = changes.len(), pending = summary.pending(), took_ms = %t0.elapsed().as_millis(), "diff: calculated");
        Ok(changes)
    }
}

/// Mark changes outside `filter` as ignored.
pub fn apply_filter(changes: &mut [Change], filter: &DiffFilter) {
    if filter.is_empty() {
        return;
    }
    for c in changes.iter_mut().filter(|c| !filter.matches(c)) {
        c.ignored = true;
    }
}
