//! kade rebase engine.
//!
//! Before diffing, fields the server (or controllers) introduced on the live
//! object are carried into the desired object so only user-intended changes
//! remain. Two layers run in order:
//!
//! 1. server-defaulted fields: anything present on the live object that the
//!    engine never submitted (per the `kade.dev/original` annotation) and the
//!    new object does not set;
//! 2. `rebaseRules` from config, left to right, each seeing the result of
//!    the previous ones.

#![forbid(unsafe_code)]

use std::sync::Arc;

use serde_json::Value as Json;
use tracing::trace;

use kade_core::config::{RebaseRule, RebaseRuleType, RebaseSource};
use kade_core::path::{get_at, remove_all, set_at};
use kade_core::{annotations, any_matches, Config, KadeError, KadeResult, Resource};

mod defaults;

pub use defaults::default_config;

/// Evaluates overlay rules over `{existing, new, _current}` and returns the
/// next `_current`.
pub trait OverlayEvaluator: Send + Sync {
    fn evaluate(&self, overlay: &str, existing: &Json, new: &Json, current: &Json) -> KadeResult<Json>;
}

#[derive(Clone)]
pub struct Rebaser {
    config: Arc<Config>,
    overlay: Option<Arc<dyn OverlayEvaluator>>,
}

impl Rebaser {
    pub fn new(config: Arc<Config>) -> Self { Self { config, overlay: None } }

    pub fn with_overlay(mut self, evaluator: Arc<dyn OverlayEvaluator>) -> Self {
        self.overlay = Some(evaluator);
        self
    }

    pub fn config(&self) -> &Arc<Config> { &self.config }

    pub fn rebase(&self, existing: &Resource, new: &Resource) -> KadeResult<Resource> {
        let mut current = new.raw().clone();
        let original = existing
            .annotation(annotations::ORIGINAL)
            .and_then(|s| serde_json::from_str::<Json>(s).ok())
            .unwrap_or(Json::Null);
        merge_server_defaults(existing.raw(), &original, &mut current);

        for (i, rule) in self.config.rebase_rules.iter().enumerate() {
            if !any_matches(&rule.resource_matchers, new) {
                continue;
            }
            self.apply_rule(rule, existing.raw(), new.raw(), &mut current)
                .map_err(|e| e.context(format!("{}: rebase rule {i}", new.description())))?;
        }
        Resource::from_json(current).map_err(|e| KadeError::config(format!("{}: rebase produced an invalid object: {e}", new.description())))
    }

    fn apply_rule(&self, rule: &RebaseRule, existing: &Json, new: &Json, current: &mut Json) -> KadeResult<()> {
        match rule.rule_type {
            RebaseRuleType::Copy => {
                for path in rule.all_paths() {
                    let mut locations = path.expand_for_write(current)?;
                    for loc in path.expand(existing)? {
                        if !locations.contains(&loc) {
                            locations.push(loc);
                        }
                    }
                    for loc in locations {
                        let value = rule.sources.iter().find_map(|src| match src {
                            RebaseSource::New => get_at(current, &loc).cloned(),
                            RebaseSource::Existing => get_at(existing, &loc).cloned(),
                        });
                        if let Some(value) = value {
                            trace!(path = %kade_core::path::render_steps(&loc), "rebase: copy");
                            set_at(current, &loc, value);
                        }
                    }
                }
            }
            RebaseRuleType::Remove => {
                for path in rule.all_paths() {
                    let locations = path.expand(current)?;
                    remove_all(current, locations);
                }
            }
            RebaseRuleType::Overlay => {
                let overlay = rule.overlay.as_deref().unwrap_or_default();
                let evaluator = self.overlay.as_ref().ok_or_else(|| KadeError::config("overlay rule configured but no overlay evaluator is registered"))?;
                *current = evaluator.evaluate(overlay, existing, new, current)?;
            }
        }
        Ok(())
    }
}

/// Copy fields that exist on `existing`, were not part of what the engine
/// last submitted (`original`), and are not set in `current`.
pub fn merge_server_defaults(existing: &Json, original: &Json, current: &mut Json) {
    match (existing, current) {
        (Json::Object(ex), Json::Object(cur)) => {
            for (k, ex_v) in ex {
                let orig_v = original.get(k).unwrap_or(&Json::Null);
                match cur.get_mut(k) {
                    Some(cur_v) => merge_server_defaults(ex_v, orig_v, cur_v),
                    None if orig_v.is_null() => {
                        cur.insert(k.clone(), ex_v.clone());
                    }
                    // removed by the user since the last deploy
                    None => {}
                }
            }
        }
        (Json::Array(ex), Json::Array(cur)) if ex.len() == cur.len() => {
            for (i, (ex_v, cur_v)) in ex.iter().zip(cur.iter_mut()).enumerate() {
                let orig_v = original.as_array().and_then(|a| a.get(i)).unwrap_or(&Json::Null);
                merge_server_defaults(ex_v, orig_v, cur_v);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn res(v: Json) -> Resource { Resource::from_json(v).unwrap() }

    fn rebaser(yaml: &str) -> Rebaser { Rebaser::new(Arc::new(Config::from_yaml(yaml).unwrap())) }

    #[test]
    fn copy_prefers_first_source() {
        let r = rebaser(
            r#"
rebaseRules:
- type: copy
  sources: [new, existing]
  path: [spec, clusterIP]
- type: copy
  sources: [existing]
  path: [spec, ports, {allIndexes: true}, nodePort]
"#,
        );
        let existing = res(json!({"apiVersion": "v1", "kind": "Service", "metadata": {"name": "s", "namespace": "d"},
            "spec": {"clusterIP": "10.0.0.1", "ports": [{"port": 80, "nodePort": 31000}]}}));
        let new = res(json!({"apiVersion": "v1", "kind": "Service", "metadata": {"name": "s", "namespace": "d"},
            "spec": {"ports": [{"port": 80}]}}));
        let out = r.rebase(&existing, &new).unwrap();
        assert_eq!(out.raw()["spec"]["clusterIP"], json!("10.0.0.1"));
        assert_eq!(out.raw()["spec"]["ports"][0]["nodePort"], json!(31000));

        let mut explicit = new.clone();
        explicit.raw_mut()["spec"]["clusterIP"] = json!("None");
        let out = r.rebase(&existing, &explicit).unwrap();
        assert_eq!(out.raw()["spec"]["clusterIP"], json!("None"));
    }

    #[test]
    fn rules_see_previous_results() {
        let r = rebaser(
            r#"
rebaseRules:
- {type: copy, sources: [existing], path: [data, a]}
- {type: copy, sources: [new], path: [data, b]}
- {type: remove, path: [data, {regex: "^tmp-"}]}
"#,
        );
        let existing = res(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "c", "annotations": {"kade.dev/original": "{}"}}, "data": {"a": "x"}}));
        let new = res(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "c"}, "data": {"b": "y", "tmp-1": "z", "tmp-2": "z"}}));
        let out = r.rebase(&existing, &new).unwrap();
        assert_eq!(out.raw()["data"], json!({"a": "x", "b": "y"}));
    }

    #[test]
    fn overlay_requires_evaluator() {
        let r = rebaser("rebaseRules: [{type: overlay, overlay: keep}]");
        let obj = res(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "c"}}));
        let e = r.rebase(&obj, &obj).unwrap_err();
        assert_eq!(e.kind(), kade_core::ErrorKind::Config);
        assert!(e.to_string().contains("rebase rule 0"), "{e}");

        struct KeepExisting;
        impl OverlayEvaluator for KeepExisting {
            fn evaluate(&self, _: &str, existing: &Json, _: &Json, _: &Json) -> KadeResult<Json> { Ok(existing.clone()) }
        }
        let r = r.with_overlay(Arc::new(KeepExisting));
        let mut existing = obj.clone();
        existing.set_label("live", "1");
        assert_eq!(r.rebase(&existing, &obj).unwrap().label("live"), Some("1"));
    }

    #[test]
    fn server_defaults_are_carried_unless_removed_by_user() {
        let original = json!({"spec": {"replicas": 2, "paused": true}});
        let existing = json!({"spec": {"replicas": 2, "progressDeadlineSeconds": 600, "paused": true}, "status": {"x": 1}});
        let mut current = json!({"spec": {"replicas": 3}});
        merge_server_defaults(&existing, &original, &mut current);
        assert_eq!(current, json!({"spec": {"replicas": 3, "progressDeadlineSeconds": 600}, "status": {"x": 1}}));
    }
}
