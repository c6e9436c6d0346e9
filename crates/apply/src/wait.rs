//! Readiness predicates.
//!
//! Built-in checks cover the workload kinds, Services, CRDs and
//! APIServices; anything else is ready once its generic conditions allow.
//! `waitRules` from config take precedence over the built-ins.

use std::fmt;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Pod, Service};
use serde::de::DeserializeOwned;
use serde_json::Value as Json;

use kade_core::config::{ConditionMatcher, WaitRule};
use kade_core::{any_matches, KadeError, KadeResult, Resource};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitOutcome {
    pub done: bool,
    pub successful: bool,
    pub message: String,
}

impl WaitOutcome {
    pub fn pending(msg: impl Into<String>) -> Self { Self { done: false, successful: false, message: msg.into() } }
    pub fn ready(msg: impl Into<String>) -> Self { Self { done: true, successful: true, message: msg.into() } }
    pub fn failed(msg: impl Into<String>) -> Self { Self { done: true, successful: false, message: msg.into() } }
}

impl fmt::Display for WaitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match (self.done, self.successful) {
            (false, _) => "ongoing",
            (true, true) => "ok",
            (true, false) => "failed",
        };
        if self.message.is_empty() {
            write!(f, "{state}")
        } else {
            write!(f, "{state}: {}", self.message)
        }
    }
}

/// Named predicates referenced by `waitRules[].overlay`.
pub trait WaitEvaluator: Send + Sync {
    fn evaluate(&self, overlay: &str, res: &Resource) -> KadeResult<WaitOutcome>;
}

#[derive(Clone, Default)]
pub struct Waiter {
    rules: Arc<Vec<WaitRule>>,
    evaluator: Option<Arc<dyn WaitEvaluator>>,
}

impl Waiter {
    pub fn new(rules: Vec<WaitRule>) -> Self { Self { rules: Arc::new(rules), evaluator: None } }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn WaitEvaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    /// Readiness of a live object.
    pub fn check(&self, res: &Resource) -> KadeResult<WaitOutcome> {
        if let Some(rule) = self.rules.iter().find(|r| any_matches(&r.resource_matchers, res)) {
            return self.check_rule(rule, res);
        }
        builtin(res)
    }

    fn check_rule(&self, rule: &WaitRule, res: &Resource) -> KadeResult<WaitOutcome> {
        if let Some(overlay) = &rule.overlay {
            let Some(ev) = &self.evaluator else {
                return Err(KadeError::config(format!("wait rule overlay '{overlay}' has no registered evaluator")));
            };
            return ev.evaluate(overlay, res);
        }
        if rule.supports_observed_generation {
            if let Some(pending) = generation_pending(res) {
                return Ok(pending);
            }
        }
        let conditions = conditions(res.raw());
        for m in &rule.condition_matchers {
            let Some(c) = conditions.iter().find(|c| cond_str(c, "type") == Some(m.condition_type.as_str())) else { continue };
            if cond_str(c, "status") != Some(m.status.as_str()) {
                continue;
            }
            if m.supports_observed_generation && !condition_observed(c, res) {
                continue;
            }
            if let Some(out) = matched(m, c) {
                return Ok(out);
            }
        }
        Ok(WaitOutcome::pending("waiting on matching conditions"))
    }
}

fn matched(m: &ConditionMatcher, c: &Json) -> Option<WaitOutcome> {
    let detail = cond_str(c, "message").or_else(|| cond_str(c, "reason")).unwrap_or_default();
    let msg = format!("{}={}{}", m.condition_type, m.status, if detail.is_empty() { String::new() } else { format!(" ({detail})") });
    if m.failure {
        Some(WaitOutcome::failed(msg))
    } else if m.success {
        Some(WaitOutcome::ready(msg))
    } else {
        None
    }
}

fn conditions(raw: &Json) -> Vec<Json> {
    raw.pointer("/status/conditions").and_then(Json::as_array).cloned().unwrap_or_default()
}

fn cond_str<'a>(c: &'a Json, field: &str) -> Option<&'a str> { c.get(field).and_then(Json::as_str) }

fn condition_observed(c: &Json, res: &Resource) -> bool {
    match (c.get("observedGeneration").and_then(Json::as_i64), res.generation()) {
        (Some(seen), Some(gen)) => seen >= gen,
        _ => true,
    }
}

fn observed_generation(res: &Resource) -> Option<i64> { res.raw().pointer("/status/observedGeneration").and_then(Json::as_i64) }

fn generation_pending(res: &Resource) -> Option<WaitOutcome> {
    let gen = res.generation()?;
    match observed_generation(res) {
        Some(seen) if seen >= gen => None,
        _ => Some(WaitOutcome::pending(format!("waiting for generation {gen} to be observed"))),
    }
}

fn typed<T: DeserializeOwned>(res: &Resource) -> KadeResult<T> {
    serde_json::from_value(res.raw().clone()).map_err(|e| KadeError::Wait(format!("{}: decode: {e}", res.description())))
}

fn builtin(res: &Resource) -> KadeResult<WaitOutcome> {
    match (res.group(), res.kind()) {
        ("apps", "Deployment") => deployment(&typed(res)?),
        ("apps", "StatefulSet") => Ok(stateful_set(&typed(res)?)),
        ("apps", "DaemonSet") => Ok(daemon_set(&typed(res)?)),
        ("batch", "Job") => Ok(job(&typed(res)?)),
        ("", "Pod") => Ok(pod(&typed(res)?)),
        ("", "Service") => Ok(service(&typed(res)?)),
        ("apiextensions.k8s.io", "CustomResourceDefinition") => Ok(crd(res)),
        ("apiregistration.k8s.io", "APIService") => Ok(api_service(res)),
        _ => Ok(generic(res)),
    }
}

fn deployment(d: &Deployment) -> KadeResult<WaitOutcome> {
    let gen = d.metadata.generation.unwrap_or(0);
    let Some(status) = &d.status else { return Ok(WaitOutcome::pending("waiting for status")) };
    if status.observed_generation.unwrap_or(0) < gen {
        return Ok(WaitOutcome::pending(format!("waiting for generation {gen} to be observed")));
    }
    for c in status.conditions.iter().flatten() {
        if c.type_ == "Progressing" && c.reason.as_deref() == Some("ProgressDeadlineExceeded") {
            return Ok(WaitOutcome::failed(format!("deployment exceeded its progress deadline: {}", c.message.as_deref().unwrap_or_default())));
        }
    }
    let want = d.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let updated = status.updated_replicas.unwrap_or(0);
    if updated < want {
        return Ok(WaitOutcome::pending(format!("waiting for {} updated replicas ({updated}/{want})", want - updated)));
    }
    let total = status.replicas.unwrap_or(0);
    if total > updated {
        return Ok(WaitOutcome::pending(format!("waiting for {} old replicas to go away", total - updated)));
    }
    let unavailable = status.unavailable_replicas.unwrap_or(0);
    if unavailable > 0 {
        return Ok(WaitOutcome::pending(format!("waiting for {unavailable} unavailable replicas")));
    }
    Ok(WaitOutcome::ready(format!("{updated}/{want} replicas updated and available")))
}

fn stateful_set(s: &StatefulSet) -> WaitOutcome {
    let gen = s.metadata.generation.unwrap_or(0);
    let Some(status) = &s.status else { return WaitOutcome::pending("waiting for status") };
    if status.observed_generation.unwrap_or(0) < gen {
        return WaitOutcome::pending(format!("waiting for generation {gen} to be observed"));
    }
    let want = s.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let ready = status.ready_replicas.unwrap_or(0);
    let updated = status.updated_replicas.unwrap_or(0);
    if updated < want || ready < want {
        return WaitOutcome::pending(format!("waiting for replicas: {updated} updated, {ready} ready of {want}"));
    }
    WaitOutcome::ready(format!("{ready}/{want} replicas ready"))
}

fn daemon_set(d: &DaemonSet) -> WaitOutcome {
    let gen = d.metadata.generation.unwrap_or(0);
    let Some(status) = &d.status else { return WaitOutcome::pending("waiting for status") };
    if status.observed_generation.unwrap_or(0) < gen {
        return WaitOutcome::pending(format!("waiting for generation {gen} to be observed"));
    }
    let want = status.desired_number_scheduled;
    let updated = status.updated_number_scheduled.unwrap_or(0);
    let available = status.number_available.unwrap_or(0);
    if updated < want || available < want {
        return WaitOutcome::pending(format!("waiting for pods: {updated} updated, {available} available of {want}"));
    }
    WaitOutcome::ready(format!("{available}/{want} pods available"))
}

fn job(j: &Job) -> WaitOutcome {
    let conditions = j.status.as_ref().and_then(|s| s.conditions.as_ref());
    for c in conditions.into_iter().flatten() {
        if c.status != "True" {
            continue;
        }
        match c.type_.as_str() {
            "Complete" => return WaitOutcome::ready("completed"),
            "Failed" => return WaitOutcome::failed(format!("job failed: {}", c.message.as_deref().unwrap_or_default())),
            _ => {}
        }
    }
    WaitOutcome::pending("waiting to complete")
}

fn pod(p: &Pod) -> WaitOutcome {
    let Some(status) = &p.status else { return WaitOutcome::pending("waiting for status") };
    match status.phase.as_deref() {
        Some("Succeeded") => return WaitOutcome::ready("pod succeeded"),
        Some("Failed") => return WaitOutcome::failed(format!("pod failed: {}", status.message.as_deref().unwrap_or_default())),
        _ => {}
    }
    let ready = status.conditions.iter().flatten().any(|c| c.type_ == "Ready" && c.status == "True");
    if ready {
        WaitOutcome::ready("pod ready")
    } else {
        WaitOutcome::pending(format!("waiting for pod in phase {}", status.phase.as_deref().unwrap_or("Unknown")))
    }
}

fn service(s: &Service) -> WaitOutcome {
    let spec = s.spec.as_ref();
    if spec.and_then(|s| s.type_.as_deref()) == Some("ExternalName") {
        return WaitOutcome::ready("external name");
    }
    match spec.and_then(|s| s.cluster_ip.as_deref()) {
        Some(ip) if !ip.is_empty() => WaitOutcome::ready(format!("cluster IP {ip}")),
        _ => WaitOutcome::pending("waiting for a cluster IP"),
    }
}

fn crd(res: &Resource) -> WaitOutcome {
    for c in conditions(res.raw()) {
        match (cond_str(&c, "type"), cond_str(&c, "status")) {
            (Some("NamesAccepted"), Some("False")) => return WaitOutcome::failed(format!("names not accepted: {}", cond_str(&c, "message").unwrap_or_default())),
            (Some("Established"), Some("True")) => return WaitOutcome::ready("established"),
            _ => {}
        }
    }
    WaitOutcome::pending("waiting to be established")
}

fn api_service(res: &Resource) -> WaitOutcome {
    let available = conditions(res.raw()).iter().any(|c| cond_str(c, "type") == Some("Available") && cond_str(c, "status") == Some("True"));
    if available {
        WaitOutcome::ready("available")
    } else {
        WaitOutcome::pending("waiting to become available")
    }
}

/// Generation first, then `Failed`/`Ready` conditions; no status means ready.
fn generic(res: &Resource) -> WaitOutcome {
    if observed_generation(res).is_some() {
        if let Some(pending) = generation_pending(res) {
            return pending;
        }
    }
    let conditions = conditions(res.raw());
    let find = |t: &str| conditions.iter().find(|c| cond_str(c, "type") == Some(t));
    if let Some(c) = find("Failed").filter(|c| cond_str(c, "status") == Some("True")) {
        return WaitOutcome::failed(cond_str(c, "message").unwrap_or("Failed=True").to_string());
    }
    match find("Ready").and_then(|c| cond_str(c, "status")) {
        Some("False") | Some("Unknown") => WaitOutcome::pending("waiting for Ready=True"),
        _ => WaitOutcome::ready(""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn res(raw: Json) -> Resource { Resource::from_json(raw).unwrap() }

    fn deploy(generation: i64, status: Json) -> Resource {
        res(json!({
            "apiVersion": "apps/v1", "kind": "Deployment",
            "metadata": {"name": "web", "namespace": "default", "generation": generation},
            "spec": {"replicas": 2, "selector": {"matchLabels": {"app": "web"}}, "template": {"spec": {"containers": []}}},
            "status": status,
        }))
    }

    #[test]
    fn deployment_waits_for_observed_generation_and_replicas() {
        let w = Waiter::default();
        let out = w.check(&deploy(2, json!({"observedGeneration": 1}))).unwrap();
        assert!(!out.done && out.message.contains("generation 2"), "{out}");
        let out = w.check(&deploy(2, json!({"observedGeneration": 2, "replicas": 2, "updatedReplicas": 1}))).unwrap();
        assert!(!out.done);
        let out = w.check(&deploy(2, json!({"observedGeneration": 2, "replicas": 2, "updatedReplicas": 2, "availableReplicas": 2}))).unwrap();
        assert!(out.done && out.successful, "{out}");
        let stuck = json!({"observedGeneration": 2, "conditions": [{"type": "Progressing", "status": "False", "reason": "ProgressDeadlineExceeded"}]});
        let out = w.check(&deploy(2, stuck)).unwrap();
        assert!(out.done && !out.successful);
    }

    #[test]
    fn jobs_and_pods_finish_or_fail() {
        let w = Waiter::default();
        let job = |t: &str| res(json!({"apiVersion": "batch/v1", "kind": "Job", "metadata": {"name": "j"}, "status": {"conditions": [{"type": t, "status": "True"}]}}));
        assert!(w.check(&job("Complete")).unwrap().successful);
        let failed = w.check(&job("Failed")).unwrap();
        assert!(failed.done && !failed.successful);
        let pod = |phase: &str| res(json!({"apiVersion": "v1", "kind": "Pod", "metadata": {"name": "p"}, "status": {"phase": phase}}));
        assert!(!w.check(&pod("Pending")).unwrap().done);
        assert!(w.check(&pod("Succeeded")).unwrap().successful);
    }

    #[test]
    fn generic_resources_use_conditions() {
        let w = Waiter::default();
        let cm = Resource::build("v1", "ConfigMap", Some("default"), "c");
        assert!(w.check(&cm).unwrap().successful);
        let mut widget = Resource::build("example.com/v1", "Widget", Some("default"), "w");
        widget.raw_mut()["status"] = json!({"conditions": [{"type": "Ready", "status": "False"}]});
        assert!(!w.check(&widget).unwrap().done);
        widget.raw_mut()["status"] = json!({"conditions": [{"type": "Failed", "status": "True", "message": "boom"}]});
        assert_eq!(w.check(&widget).unwrap(), WaitOutcome::failed("boom"));
    }

    #[test]
    fn wait_rules_override_builtins() {
        let cfg = kade_core::Config::from_yaml(
            "waitRules:\n- supportsObservedGeneration: true\n  conditionMatchers:\n  - {type: Synced, status: 'True', success: true}\n  - {type: Synced, status: 'False', failure: true}\n  resourceMatchers:\n  - apiVersionKindMatcher: {apiVersion: example.com/v1, kind: Widget}\n",
        )
        .unwrap();
        let w = Waiter::new(cfg.wait_rules);
        let mut widget = Resource::build("example.com/v1", "Widget", Some("default"), "w");
        widget.raw_mut()["metadata"]["generation"] = json!(3);
        widget.raw_mut()["status"] = json!({"observedGeneration": 2, "conditions": [{"type": "Synced", "status": "True"}]});
        assert!(!w.check(&widget).unwrap().done);
        widget.raw_mut()["status"]["observedGeneration"] = json!(3);
        assert!(w.check(&widget).unwrap().successful);
        widget.raw_mut()["status"]["conditions"] = json!([{"type": "Synced", "status": "False", "message": "bad ref"}]);
        let out = w.check(&widget).unwrap();
        assert!(out.done && !out.successful && out.message.contains("bad ref"));
    }

    struct AlwaysReady;

    impl WaitEvaluator for AlwaysReady {
        fn evaluate(&self, overlay: &str, _res: &Resource) -> KadeResult<WaitOutcome> { Ok(WaitOutcome::ready(overlay)) }
    }

    #[test]
    fn overlays_need_an_evaluator() {
        let cfg = kade_core::Config::from_yaml("waitRules:\n- overlay: widget-ready\n  resourceMatchers:\n  - apiVersionKindMatcher: {apiVersion: example.com/v1, kind: Widget}\n").unwrap();
        let widget = Resource::build("example.com/v1", "Widget", Some("default"), "w");
        let w = Waiter::new(cfg.wait_rules);
        assert!(w.check(&widget).unwrap_err().is_pre_mutation());
        let w = w.with_evaluator(Arc::new(AlwaysReady));
        assert_eq!(w.check(&widget).unwrap(), WaitOutcome::ready("widget-ready"));
    }
}
