use kade_core::config::{AffectedResources, ObjectReference, TemplateRule};
use kade_core::path::PathSegment;
use kade_core::{Config, KadeResult, Path, ResourceMatcher};

/// Where a pod spec lives for each workload kind.
const POD_SPEC_HOSTS: &[(&str, &str, &[&str])] = &[
    ("v1", "Pod", &["spec"]),
    ("apps/v1", "Deployment", &["spec", "template", "spec"]),
    ("apps/v1", "StatefulSet", &["spec", "template", "spec"]),
    ("apps/v1", "DaemonSet", &["spec", "template", "spec"]),
    ("apps/v1", "ReplicaSet", &["spec", "template", "spec"]),
    ("batch/v1", "Job", &["spec", "template", "spec"]),
    ("batch/v1", "CronJob", &["spec", "jobTemplate", "spec", "template", "spec"]),
];

enum Seg {
    K(&'static str),
    All,
}

fn path(prefix: &[&str], rest: &[Seg]) -> Path {
    let mut segs: Vec<PathSegment> = prefix.iter().map(|k| PathSegment::Key(k.to_string())).collect();
    segs.extend(rest.iter().map(|s| match s {
        Seg::K(k) => PathSegment::Key(k.to_string()),
        Seg::All => PathSegment::AllIndexes,
    }));
    Path::new(segs)
}

fn references_for(prefix: &[&str], target_kind: &str) -> Vec<(Path, &'static str)> {
    use Seg::{All, K};
    let mut out = Vec::new();
    for c in ["containers", "initContainers"] {
        if target_kind == "ConfigMap" {
            out.push((path(prefix, &[K(c), All, K("env"), All, K("valueFrom"), K("configMapKeyRef")]), "name"));
            out.push((path(prefix, &[K(c), All, K("envFrom"), All, K("configMapRef")]), "name"));
        } else {
            out.push((path(prefix, &[K(c), All, K("env"), All, K("valueFrom"), K("secretKeyRef")]), "name"));
            out.push((path(prefix, &[K(c), All, K("envFrom"), All, K("secretRef")]), "name"));
        }
    }
    if target_kind == "ConfigMap" {
        out.push((path(prefix, &[K("volumes"), All, K("configMap")]), "name"));
        out.push((path(prefix, &[K("volumes"), All, K("projected"), K("sources"), All, K("configMap")]), "name"));
    } else {
        out.push((path(prefix, &[K("volumes"), All, K("secret")]), "secretName"));
        out.push((path(prefix, &[K("volumes"), All, K("projected"), K("sources"), All, K("secret")]), "name"));
        out.push((path(prefix, &[K("imagePullSecrets"), All]), "name"));
    }
    out
}

/// Template rules for ConfigMap and Secret references from pod specs.
pub fn default_config() -> KadeResult<Config> {
    let mut cfg = Config::default();
    for target_kind in ["ConfigMap", "Secret"] {
        let mut object_references = Vec::new();
        for (api_version, kind, prefix) in POD_SPEC_HOSTS {
            for (path, name_key) in references_for(prefix, target_kind) {
                object_references.push(ObjectReference {
                    path,
                    resource_matchers: vec![ResourceMatcher::api_version_kind(api_version, kind)],
                    name_key: name_key.to_string(),
                });
            }
        }
        cfg.template_rules.push(TemplateRule {
            resource_matchers: vec![ResourceMatcher::api_version_kind("v1", target_kind)],
            affected_resources: AffectedResources { object_references },
        });
    }
    cfg.validate()?;
    Ok(cfg)
}
