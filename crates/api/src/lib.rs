//! kade deploy API façade (in-process).
//!
//! Frontends depend on [`KadeApi`]. `plan` reads the cluster and computes the
//! change set without writing anything; `apply` executes an approved plan;
//! `deploy` runs both back to back.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use metrics::{counter, histogram};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use kade_apply::{Execution, ExecutionReport, Executor, ExecOptions, WaitEvaluator, Waiter};
use kade_core::annotations::APP_LABEL;
use kade_core::config::RebaseRuleType;
use kade_core::{Config, KadeError, KadeResult, Resource, UiSink};
use kade_diff::{apply_filter, CalcOptions, Change, ChangeCalculator, ChangeSummary, DiffFilter};
use kade_kubehub::{Catalogue, LabelSelector, ResourceClient};
use kade_persist::{App, AppSpec, AppStore, ChangeRecord, DEFAULT_CHANGE_HISTORY};
use kade_prepare::{AppLabel, PrepareOptions};
use kade_rebase::{OverlayEvaluator, Rebaser};
use kade_versioned::{Reference, TemplateOptions};

/// Overlay rules need their evaluator registered before anything is written.
fn check_evaluators(config: &Config, options: &DeployOptions) -> KadeResult<()> {
    if options.overlay_evaluator.is_none() {
        if let Some(i) = config.rebase_rules.iter().position(|r| r.rule_type == RebaseRuleType::Overlay) {
            return Err(KadeError::config("overlay rule configured but no overlay evaluator is registered").context(format!("rebaseRules[{i}]")));
        }
    }
    if options.wait_evaluator.is_none() {
        if let Some((i, name)) = config.wait_rules.iter().enumerate().find_map(|(i, r)| r.overlay.as_deref().map(|o| (i, o))) {
            return Err(KadeError::config(format!("wait rule overlay '{name}' has no registered evaluator")).context(format!("waitRules[{i}]")));
        }
    }
    Ok(())
}

/// Engine defaults of every stage, then the user's config.
pub fn pipeline_config(user: &Config) -> KadeResult<Config> {
    let cfg = Config::merged([
        kade_prepare::default_config()?,
        kade_rebase::default_config()?,
        kade_versioned::default_config()?,
        kade_diff::default_config()?,
        kade_graph::default_config()?,
        user.clone(),
    ]);
    cfg.validate()?;
    Ok(cfg)
}

/// Process exit status for CLI drivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    Failure,
    /// Diff-only run, nothing to write.
    NoChanges,
    /// Diff-only run with writes pending.
    PendingChanges,
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Failure => 1,
            Self::NoChanges => 2,
            Self::PendingChanges => 3,
        }
    }
}

#[derive(Clone)]
pub struct DeployOptions {
    /// Merged after the engine defaults.
    pub config: Config,
    pub prepare: PrepareOptions,
    /// Deploying nothing deletes everything the app owns; refused unless set.
    pub allow_empty: bool,
    /// Reuse the newest matching version even after a failed deploy.
    pub latest_versions: bool,
    pub filter: DiffFilter,
    pub context_lines: usize,
    pub mask_diffs: bool,
    pub exec: ExecOptions,
    /// Extra labels for a newly created app record.
    pub app_labels: BTreeMap<String, String>,
    pub change_history: usize,
    pub overlay_evaluator: Option<Arc<dyn OverlayEvaluator>>,
    pub wait_evaluator: Option<Arc<dyn WaitEvaluator>>,
}

impl Default for DeployOptions {
    fn default() -> Self {
        Self {
            config: Config::default(),
            prepare: PrepareOptions::default(),
            allow_empty: false,
            latest_versions: false,
            filter: DiffFilter::default(),
            context_lines: 2,
            mask_diffs: true,
            exec: ExecOptions::default(),
            app_labels: BTreeMap::new(),
            change_history: DEFAULT_CHANGE_HISTORY,
            overlay_evaluator: None,
            wait_evaluator: None,
        }
    }
}

#[derive(Clone)]
pub struct DeployRequest {
    pub app: String,
    pub resources: Vec<Resource>,
    pub options: DeployOptions,
}

impl DeployRequest {
    pub fn new(app: impl Into<String>, resources: Vec<Resource>) -> Self { Self { app: app.into(), resources, options: DeployOptions::default() } }

    pub fn with_options(mut self, options: DeployOptions) -> Self {
        self.options = options;
        self
    }
}

/// A computed change set awaiting approval.
pub struct Plan {
    pub app: String,
    /// Sorted by namespace, kind, name; includes filtered-out changes.
    pub changes: Vec<Change>,
    pub references: Vec<Reference>,
    pub summary: ChangeSummary,
    spec: AppSpec,
    config: Arc<Config>,
    calc: ChangeCalculator,
    options: DeployOptions,
}

impl std::fmt::Debug for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plan").field("app", &self.app).field("changes", &self.changes.len()).finish_non_exhaustive()
    }
}

impl Plan {
    /// The app label value every resource of this plan carries.
    pub fn label_value(&self) -> &str { &self.spec.label_value }

    pub fn has_pending(&self) -> bool { self.summary.pending() > 0 }

    /// Writes the plan would make, as `op kind/ns/name` lines.
    pub fn operations(&self) -> Vec<String> {
        self.changes.iter().filter(|c| !c.ignored && c.op.mutates()).map(Change::description).collect()
    }

    /// Every change with a diff, then the summary line.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for c in self.changes.iter().filter(|c| !c.ignored && (c.op.mutates() || !c.diff.is_empty())) {
            out.push_str(&c.render());
            if !out.ends_with('\n') {
                out.push('\n');
            }
        }
        out.push_str(&self.summary.to_string());
        out
    }

    /// Exit status of a diff-only run.
    pub fn diff_status(&self) -> ExitStatus { if self.has_pending() { ExitStatus::PendingChanges } else { ExitStatus::NoChanges } }

    fn namespaces(&self) -> Vec<String> {
        let set: BTreeSet<&str> = self.changes.iter().filter(|c| !c.ignored).filter_map(|c| c.resource().namespace()).collect();
        set.into_iter().map(str::to_string).collect()
    }
}

#[derive(Debug)]
pub struct DeployOutcome {
    pub change: ChangeRecord,
    pub summary: ChangeSummary,
    pub report: ExecutionReport,
}

/// Declarative kade API surface.
#[async_trait::async_trait]
pub trait KadeApi: Send + Sync {
    /// Compute the change set for `req`; never writes to the cluster.
    async fn plan(&self, req: DeployRequest) -> KadeResult<Plan>;

    /// Execute an approved plan and record the attempt on the app.
    async fn apply(&self, plan: Plan, cancel: &CancellationToken) -> KadeResult<DeployOutcome>;

    async fn deploy(&self, req: DeployRequest, cancel: &CancellationToken) -> KadeResult<DeployOutcome> {
        let plan = self.plan(req).await?;
        self.apply(plan, cancel).await
    }

    /// Live resources owned by `app`.
    async fn inspect(&self, app: &str) -> KadeResult<Vec<Resource>>;

    /// Change records of `app`, oldest first.
    async fn history(&self, app: &str) -> KadeResult<Vec<ChangeRecord>>;

    async fn apps(&self) -> KadeResult<Vec<App>>;

    /// Delete everything `app` owns, then the app record.
    async fn delete(&self, app: &str, options: DeployOptions, cancel: &CancellationToken) -> KadeResult<DeployOutcome>;
}

// ----------------- In-process implementation -----------------

/// Runs the pipeline against a [`ResourceClient`] directly.
pub struct InProcApi {
    client: Arc<dyn ResourceClient>,
    catalogue: Catalogue,
    store: AppStore,
    ui: Arc<dyn UiSink>,
}

impl InProcApi {
    /// App records live in `app_namespace`.
    pub fn new(client: Arc<dyn ResourceClient>, app_namespace: impl Into<String>, ui: Arc<dyn UiSink>) -> Self {
        let store = AppStore::new(client.clone(), app_namespace);
        Self { client, catalogue: Catalogue::new(), store, ui }
    }

    async fn require(&self, app: &str) -> KadeResult<App> {
        self.store.get(app).await?.ok_or_else(|| KadeError::validation(format!("app '{app}' does not exist in namespace {}", self.store.namespace())))
    }
}

#[async_trait::async_trait]
impl KadeApi for InProcApi {
    async fn plan(&self, req: DeployRequest) -> KadeResult<Plan> {
        let t0 = Instant::now();
        let DeployRequest { app, resources, options } = req;
        info!(app = %app, resources = resources.len(), "api: plan start");
        if app.trim().is_empty() {
            return Err(KadeError::validation("app name must not be empty"));
        }
        if resources.is_empty() && !options.allow_empty {
            return Err(KadeError::validation(format!("app '{app}': no resources given; allow empty deploys to delete everything the app owns")));
        }
        let config = Arc::new(pipeline_config(&options.config)?);
        check_evaluators(&config, &options)?;
        self.catalogue.ensure(self.client.as_ref()).await?;
        let now = Utc::now();

        let record = self.store.get(&app).await?;
        let spec = record.as_ref().map_or_else(|| AppSpec::generate(APP_LABEL, now), |a| a.spec.clone());
        // first deploys count as settled
        let prior_successful = record.as_ref().and_then(App::last_change_successful).unwrap_or(true);
        let app_label = AppLabel { key: spec.label_key.clone(), value: spec.label_value.clone() };

        let mut new = kade_prepare::prepare(resources, &options.prepare, &self.catalogue)?;
        kade_prepare::label(&mut new, &app_label, &config)?;

        let mut existing = match &record {
            Some(_) => self.client.list(&LabelSelector::new().with(&app_label.key, &app_label.value)).await?,
            None => Vec::new(),
        };
        let templated = kade_versioned::template(new, &existing, &config, &TemplateOptions { latest: options.latest_versions, prior_successful, now })?;
        existing.retain(|e| !templated.retained.contains(&e.key()));

        let mut rebaser = Rebaser::new(config.clone());
        if let Some(overlay) = &options.overlay_evaluator {
            rebaser = rebaser.with_overlay(overlay.clone());
        }
        let calc = ChangeCalculator::new(rebaser, CalcOptions { context_lines: options.context_lines, mask: options.mask_diffs, now });
        let mut changes = calc.calculate(&existing, &templated.resources)?;
        apply_filter(&mut changes, &options.filter);
        // cycles and bad bindings surface before approval
        kade_graph::build(changes.clone(), &templated.references, &config)?;

        let summary = ChangeSummary::from_changes(&changes);
        counter!("api_plans_total", 1u64);
        histogram!("api_plan_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(app = %app, changes = changes.len(), pending = summary.pending(), took_ms = %t0.elapsed().as_millis(), "api: plan ok");
        Ok(Plan { app, changes, references: templated.references, summary, spec, config, calc, options })
    }

    async fn apply(&self, plan: Plan, cancel: &CancellationToken) -> KadeResult<DeployOutcome> {
        let t0 = Instant::now();
        let namespaces = plan.namespaces();
        let diff_changes = plan.operations().join("\n");
        let Plan { app, changes, references, summary, spec, config, calc, options } = plan;
        info!(app = %app, pending = summary.pending(), "api: apply start");
        let graph = kade_graph::build(changes, &references, &config)?;

        let mut record = self.store.ensure(&app, &options.app_labels, spec).await?;
        let mut change = self.store.begin_change(&mut record, &format!("update: {summary}"), namespaces, Utc::now()).await?;

        let mut waiter = Waiter::new(config.wait_rules.clone());
        if let Some(evaluator) = &options.wait_evaluator {
            waiter = waiter.with_evaluator(evaluator.clone());
        }
        let executor = Executor::new(self.client.clone(), calc, waiter, self.ui.clone(), options.exec.clone());
        let Execution { report, result } = executor.execute(&graph, cancel).await;

        let successful = result.is_ok();
        let diff_changes = (!diff_changes.is_empty()).then_some(diff_changes);
        let finished = self.store.finish_change(&mut record, &mut change, successful, diff_changes, Utc::now()).await;
        self.ui.notify(&format!("{app}: {}", report.summary()));
        counter!("api_deploys_total", 1u64, "successful" => if successful { "true" } else { "false" });
        histogram!("api_apply_ms", t0.elapsed().as_secs_f64() * 1000.0);
        result?;
        finished?;

        if let Err(e) = self.store.gc_changes(&app, options.change_history).await {
            warn!(app = %app, error = %e, "api: change history gc failed");
        }
        info!(app = %app, change = %change.name, took_ms = %t0.elapsed().as_millis(), "api: apply ok");
        Ok(DeployOutcome { change, summary, report })
    }

    async fn inspect(&self, app: &str) -> KadeResult<Vec<Resource>> {
        let t0 = Instant::now();
        let record = self.require(app).await?;
        let mut out = self.client.list(&record.selector()).await?;
        out.sort_by_key(Resource::key);
        info!(app, resources = out.len(), took_ms = %t0.elapsed().as_millis(), "api: inspect ok");
        Ok(out)
    }

    async fn history(&self, app: &str) -> KadeResult<Vec<ChangeRecord>> {
        self.require(app).await?;
        self.store.changes(app).await
    }

    async fn apps(&self) -> KadeResult<Vec<App>> { self.store.list().await }

    async fn delete(&self, app: &str, options: DeployOptions, cancel: &CancellationToken) -> KadeResult<DeployOutcome> {
        self.require(app).await?;
        let options = DeployOptions { allow_empty: true, ..options };
        let outcome = self.deploy(DeployRequest::new(app, Vec::new()).with_options(options), cancel).await?;
        self.store.delete(app).await?;
        info!(app, "api: app deleted");
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes() {
        let codes: Vec<i32> = [ExitStatus::Success, ExitStatus::Failure, ExitStatus::NoChanges, ExitStatus::PendingChanges].iter().map(|s| s.code()).collect();
        assert_eq!(codes, vec![0, 1, 2, 3]);
    }

    #[test]
    fn engine_defaults_parse() {
        let cfg = pipeline_config(&Config::default()).unwrap();
        assert!(cfg.change_group_bindings.iter().any(|b| !b.resource_matchers.is_empty()));
        assert!(!cfg.ownership_label_rules.is_empty());
        check_evaluators(&cfg, &DeployOptions::default()).unwrap();
    }

    #[test]
    fn overlays_without_evaluators_are_config_errors() {
        let user = Config::from_yaml("waitRules:\n- overlay: cm-ready\n").unwrap();
        let e = check_evaluators(&pipeline_config(&user).unwrap(), &DeployOptions::default()).unwrap_err();
        assert!(e.is_pre_mutation(), "{e}");
        assert!(e.to_string().contains("cm-ready"), "{e}");

        let user = Config::from_yaml("rebaseRules: [{type: overlay, overlay: keep}]").unwrap();
        let e = check_evaluators(&pipeline_config(&user).unwrap(), &DeployOptions::default()).unwrap_err();
        assert!(e.to_string().contains("rebaseRules"), "{e}");
    }

    #[test]
    fn pipeline_config_keeps_user_rules_last() {
        let user = Config::from_yaml("additionalLabels: {team: infra}\n").unwrap();
        let cfg = pipeline_config(&user).unwrap();
        assert_eq!(cfg.additional_labels.get("team").map(String::as_str), Some("infra"));
        assert!(!cfg.change_group_bindings.is_empty());
        assert!(!cfg.rebase_rules.is_empty());
    }
}
