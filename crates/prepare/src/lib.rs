//! kade prepare: turn raw input objects into a canonical, namespaced,
//! uniquely identified and labeled resource set.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;
use tracing::debug;

use kade_core::{Config, KadeError, KadeResult, ObjectKey, Resource};
use kade_kubehub::Catalogue;

mod label;

pub use label::{association_value, label, AppLabel};

const DEFAULT_CONFIG: &str = r#"
ownershipLabelRules:
- path: [spec, template, metadata, labels]
  resourceMatchers:
  - apiVersionKindMatcher: {apiVersion: apps/v1, kind: Deployment}
  - apiVersionKindMatcher: {apiVersion: apps/v1, kind: StatefulSet}
  - apiVersionKindMatcher: {apiVersion: apps/v1, kind: DaemonSet}
  - apiVersionKindMatcher: {apiVersion: apps/v1, kind: ReplicaSet}
  - apiVersionKindMatcher: {apiVersion: batch/v1, kind: Job}
- path: [spec, jobTemplate, metadata, labels]
  resourceMatchers:
  - apiVersionKindMatcher: {apiVersion: batch/v1, kind: CronJob}
- path: [spec, jobTemplate, spec, template, metadata, labels]
  resourceMatchers:
  - apiVersionKindMatcher: {apiVersion: batch/v1, kind: CronJob}
- path: [spec, volumeClaimTemplates, {allIndexes: true}, metadata, labels]
  resourceMatchers:
  - apiVersionKindMatcher: {apiVersion: apps/v1, kind: StatefulSet}
labelScopingRules:
- path: [spec, selector]
  resourceMatchers:
  - andMatcher:
      matchers:
      - apiVersionKindMatcher: {apiVersion: v1, kind: Service}
      - hasFieldMatcher: {path: [spec, selector]}
- path: [spec, selector, matchLabels]
  resourceMatchers:
  - apiVersionKindMatcher: {apiVersion: apps/v1, kind: Deployment}
  - apiVersionKindMatcher: {apiVersion: apps/v1, kind: StatefulSet}
  - apiVersionKindMatcher: {apiVersion: apps/v1, kind: DaemonSet}
  - apiVersionKindMatcher: {apiVersion: apps/v1, kind: ReplicaSet}
  - apiVersionKindMatcher: {apiVersion: policy/v1, kind: PodDisruptionBudget}
"#;

/// Ownership and label-scoping rules for well-known workload kinds.
pub fn default_config() -> KadeResult<Config> { Config::from_yaml(DEFAULT_CONFIG) }

#[derive(Debug, Clone)]
pub struct PrepareOptions {
    /// Namespace for namespaced objects that do not name one.
    pub default_namespace: String,
    /// Force every namespaced object into this namespace.
    pub into_namespace: Option<String>,
    /// `src -> dst` namespace renames, applied last.
    pub namespace_map: BTreeMap<String, String>,
    /// Empty means any namespace.
    pub allowed_namespaces: Vec<String>,
    pub allow_cluster_scoped: bool,
}

impl Default for PrepareOptions {
    fn default() -> Self {
        Self {
            default_namespace: "default".to_string(),
            into_namespace: None,
            namespace_map: BTreeMap::new(),
            allowed_namespaces: Vec::new(),
            allow_cluster_scoped: true,
        }
    }
}

/// Parse `src=dst` mapping options.
pub fn parse_namespace_map<S: AsRef<str>>(items: &[S]) -> KadeResult<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    for item in items {
        let item = item.as_ref();
        match item.split_once('=') {
            Some((src, dst)) if !src.trim().is_empty() && !dst.trim().is_empty() => {
                out.insert(src.trim().to_string(), dst.trim().to_string());
            }
            _ => return Err(KadeError::validation(format!("malformed namespace mapping '{item}' (expected src=dst)"))),
        }
    }
    Ok(out)
}

/// Scope answers for kinds: catalogue first, CRDs from the same input set second.
struct Scopes<'a> {
    catalogue: &'a Catalogue,
    from_crds: FxHashMap<(String, String), bool>,
}

impl<'a> Scopes<'a> {
    fn new(catalogue: &'a Catalogue, resources: &[Resource]) -> Self {
        let from_crds = resources.iter().filter_map(Resource::crd_target).map(|(g, k, ns)| ((g, k), ns)).collect();
        Self { catalogue, from_crds }
    }

    fn is_namespaced(&self, res: &Resource) -> KadeResult<bool> {
        if let Some(ns) = self.from_crds.get(&(res.group().to_string(), res.kind().to_string())) {
            return Ok(*ns);
        }
        self.catalogue
            .is_namespaced(res.group(), res.kind())
            .ok_or_else(|| KadeError::validation(format!("{}: resource type {}/{} is not known to the cluster", res.description(), res.api_version(), res.kind())))
    }
}

/// Assign namespaces, enforce scope and allow-list rules, reject duplicate
/// identities.
pub fn prepare(resources: Vec<Resource>, opts: &PrepareOptions, catalogue: &Catalogue) -> KadeResult<Vec<Resource>> {
    let scopes = Scopes::new(catalogue, &resources);
    let mut out = Vec::with_capacity(resources.len());
    for mut res in resources {
        if scopes.is_namespaced(&res)? {
            let mut ns = res.namespace().filter(|n| !n.is_empty()).map(str::to_string);
            if ns.is_none() && !opts.default_namespace.is_empty() {
                ns = Some(opts.default_namespace.clone());
            }
            if let Some(into) = &opts.into_namespace {
                ns = Some(into.clone());
            }
            if let Some(mapped) = ns.as_ref().and_then(|n| opts.namespace_map.get(n)) {
                ns = Some(mapped.clone());
            }
            let ns = ns.ok_or_else(|| KadeError::validation(format!("{}: namespaced resource has no namespace", res.description())))?;
            if !opts.allowed_namespaces.is_empty() && !opts.allowed_namespaces.iter().any(|a| *a == ns) {
                return Err(KadeError::validation(format!(
                    "{}: namespace '{ns}' is outside the allowed namespaces ({})",
                    res.description(),
                    opts.allowed_namespaces.join(", ")
                )));
            }
            res.set_namespace(Some(&ns));
        } else {
            if res.namespace().is_some_and(|n| !n.is_empty()) {
                return Err(KadeError::validation(format!("{}: cluster-scoped resource must not specify a namespace", res.description())));
            }
            if !opts.allow_cluster_scoped {
                return Err(KadeError::validation(format!("{}: cluster-scoped resources are not allowed", res.description())));
            }
            res.set_namespace(None);
        }
        out.push(res);
    }
    check_unique(&out)?;
    debug!(count = out.len(), "prepare: ok");
    Ok(out)
}

fn check_unique(resources: &[Resource]) -> KadeResult<()> {
    let mut seen: BTreeMap<ObjectKey, usize> = BTreeMap::new();
    for r in resources {
        *seen.entry(r.key()).or_default() += 1;
    }
    let dups: Vec<String> = seen.into_iter().filter(|(_, n)| *n > 1).map(|(k, n)| format!("{k} ({n} times)")).collect();
    if dups.is_empty() {
        Ok(())
    } else {
        Err(KadeError::config(format!("duplicate resources: {}", dups.join("; "))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kade_kubehub::ResourceType;

    fn catalogue() -> Catalogue {
        Catalogue::from_types(vec![
            ResourceType::new("v1", "ConfigMap", true),
            ResourceType::new("v1", "Namespace", false),
            ResourceType::new("apiextensions.k8s.io/v1", "CustomResourceDefinition", false),
        ])
    }

    fn cm(ns: Option<&str>, name: &str) -> Resource { Resource::build("v1", "ConfigMap", ns, name) }

    #[test]
    fn assigns_namespaces_in_order() {
        let mut opts = PrepareOptions::default();
        let out = prepare(vec![cm(None, "a"), cm(Some("x"), "b")], &opts, &catalogue()).unwrap();
        assert_eq!(out[0].namespace(), Some("default"));
        assert_eq!(out[1].namespace(), Some("x"));

        opts.into_namespace = Some("into".into());
        opts.namespace_map = parse_namespace_map(&["into=mapped"]).unwrap();
        let out = prepare(vec![cm(Some("x"), "b")], &opts, &catalogue()).unwrap();
        assert_eq!(out[0].namespace(), Some("mapped"));
    }

    #[test]
    fn rejects_bad_scoping() {
        let opts = PrepareOptions::default();
        let e = prepare(vec![Resource::build("v1", "Namespace", Some("x"), "n")], &opts, &catalogue()).unwrap_err();
        assert!(e.to_string().contains("must not specify a namespace"), "{e}");

        let opts = PrepareOptions { default_namespace: String::new(), ..Default::default() };
        let e = prepare(vec![cm(None, "a")], &opts, &catalogue()).unwrap_err();
        assert!(e.to_string().contains("has no namespace"), "{e}");

        let opts = PrepareOptions { allowed_namespaces: vec!["ok".into()], ..Default::default() };
        assert!(prepare(vec![cm(Some("nope"), "a")], &opts, &catalogue()).is_err());

        let opts = PrepareOptions { allow_cluster_scoped: false, ..Default::default() };
        assert!(prepare(vec![Resource::build("v1", "Namespace", None, "n")], &opts, &catalogue()).is_err());

        assert!(parse_namespace_map(&["nodst="]).is_err());
        assert!(prepare(vec![Resource::build("x.io/v1", "Thing", None, "t")], &PrepareOptions::default(), &catalogue()).is_err());
    }

    #[test]
    fn duplicates_are_fatal_even_across_versions() {
        let mut other = cm(Some("default"), "a");
        other.raw_mut()["apiVersion"] = serde_json::json!("v1beta1");
        let e = prepare(vec![cm(None, "a"), other], &PrepareOptions::default(), &catalogue()).unwrap_err();
        assert!(e.to_string().contains("duplicate resources"), "{e}");
        assert_eq!(e.kind(), kade_core::ErrorKind::Config);
    }

    #[test]
    fn crd_scope_comes_from_input() {
        let mut crd = Resource::build("apiextensions.k8s.io/v1", "CustomResourceDefinition", None, "widgets.example.com");
        crd.raw_mut()["spec"] = serde_json::json!({"group": "example.com", "names": {"kind": "Widget"}, "scope": "Namespaced"});
        let w = Resource::build("example.com/v1", "Widget", None, "w");
        let out = prepare(vec![crd, w], &PrepareOptions::default(), &catalogue()).unwrap();
        assert_eq!(out[1].namespace(), Some("default"));
    }

    #[test]
    fn default_config_parses() {
        let cfg = default_config().unwrap();
        assert!(!cfg.ownership_label_rules.is_empty());
        assert!(!cfg.label_scoping_rules.is_empty());
    }
}
