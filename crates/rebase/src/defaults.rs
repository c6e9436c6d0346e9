use kade_core::{Config, KadeResult};

const DEFAULT_CONFIG: &str = r#"
rebaseRules:
# server-owned metadata always comes from the live object
- type: copy
  sources: [existing]
  paths:
  - [metadata, resourceVersion]
  - [metadata, uid]
  - [metadata, creationTimestamp]
  - [metadata, generation]
  - [metadata, selfLink]
  - [metadata, managedFields]
- type: copy
  sources: [new, existing]
  paths:
  - [metadata, finalizers]
  - [metadata, ownerReferences]
- type: copy
  sources: [existing]
  path: [status]

- type: copy
  sources: [new, existing]
  paths:
  - [spec, clusterIP]
  - [spec, clusterIPs]
  - [spec, ipFamilies]
  - [spec, ipFamilyPolicy]
  - [spec, healthCheckNodePort]
  - [spec, ports, {allIndexes: true}, nodePort]
  resourceMatchers:
  - apiVersionKindMatcher: {apiVersion: v1, kind: Service}

- type: copy
  sources: [new, existing]
  paths:
  - [secrets]
  - [imagePullSecrets]
  resourceMatchers:
  - apiVersionKindMatcher: {apiVersion: v1, kind: ServiceAccount}

# token controller fills these in
- type: copy
  sources: [new, existing]
  paths:
  - [data]
  - [metadata, annotations, kubernetes.io/service-account.uid]
  resourceMatchers:
  - andMatcher:
      matchers:
      - apiVersionKindMatcher: {apiVersion: v1, kind: Secret}
      - hasAnnotationMatcher: {keys: [kubernetes.io/service-account.name]}

# aggregated rules are computed by the controller
- type: copy
  sources: [existing, new]
  path: [rules]
  resourceMatchers:
  - andMatcher:
      matchers:
      - apiVersionKindMatcher: {apiVersion: rbac.authorization.k8s.io/v1, kind: ClusterRole}
      - hasFieldMatcher: {path: [aggregationRule]}

- type: copy
  sources: [new, existing]
  paths:
  - [metadata, annotations, deployment.kubernetes.io/revision]
  - [spec, template, metadata, annotations, kubectl.kubernetes.io/restartedAt]
  resourceMatchers:
  - apiVersionKindMatcher: {apiVersion: apps/v1, kind: Deployment}

- type: copy
  sources: [new, existing]
  paths:
  - [spec, volumeName]
  - [spec, storageClassName]
  - [spec, volumeMode]
  - [metadata, annotations, {regex: "^pv\\.kubernetes\\.io/"}]
  - [metadata, annotations, {regex: "^volume\\.(beta\\.)?kubernetes\\.io/"}]
  resourceMatchers:
  - apiVersionKindMatcher: {apiVersion: v1, kind: PersistentVolumeClaim}

- type: copy
  sources: [new, existing]
  paths:
  - [spec, selector]
  - [spec, template, metadata, labels, controller-uid]
  - [spec, template, metadata, labels, batch.kubernetes.io/controller-uid]
  - [spec, template, metadata, labels, batch.kubernetes.io/job-name]
  - [spec, template, metadata, labels, job-name]
  resourceMatchers:
  - apiVersionKindMatcher: {apiVersion: batch/v1, kind: Job}

- type: copy
  sources: [new, existing]
  path: [spec, caBundle]
  resourceMatchers:
  - apiVersionKindMatcher: {apiVersion: apiregistration.k8s.io/v1, kind: APIService}
"#;

/// Rebase rules for fields well-known controllers inject.
pub fn default_config() -> KadeResult<Config> { Config::from_yaml(DEFAULT_CONFIG) }

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Rebaser;
    use kade_core::Resource;
    use serde_json::json;
    use std::sync::Arc;

    fn rebaser() -> Rebaser { Rebaser::new(Arc::new(default_config().unwrap())) }

    #[test]
    fn defaults_parse() {
        assert!(default_config().unwrap().rebase_rules.len() >= 10);
    }

    #[test]
    fn service_fields_are_kept_even_when_user_dropped_them() {
        // original records clusterIP as never submitted, so only the rule keeps it
        let existing = Resource::from_json(json!({
            "apiVersion": "v1", "kind": "Service",
            "metadata": {"name": "s", "namespace": "d", "uid": "u1", "resourceVersion": "7",
                         "annotations": {"kade.dev/original": "{\"spec\":{\"clusterIP\":\"10.0.0.9\"}}"}},
            "spec": {"clusterIP": "10.0.0.9", "ports": [{"port": 80, "nodePort": 30080}], "type": "NodePort"}
        }))
        .unwrap();
        let new = Resource::from_json(json!({
            "apiVersion": "v1", "kind": "Service", "metadata": {"name": "s", "namespace": "d"},
            "spec": {"ports": [{"port": 80}], "type": "NodePort"}
        }))
        .unwrap();
        let out = rebaser().rebase(&existing, &new).unwrap();
        assert_eq!(out.raw()["spec"]["clusterIP"], json!("10.0.0.9"));
        assert_eq!(out.raw()["spec"]["ports"][0]["nodePort"], json!(30080));
        assert_eq!(out.uid(), Some("u1"));
        assert_eq!(out.resource_version(), Some("7"));
    }

    #[test]
    fn aggregated_cluster_role_keeps_live_rules() {
        let existing = Resource::from_json(json!({
            "apiVersion": "rbac.authorization.k8s.io/v1", "kind": "ClusterRole", "metadata": {"name": "agg"},
            "aggregationRule": {"clusterRoleSelectors": [{"matchLabels": {"x": "y"}}]},
            "rules": [{"verbs": ["get"], "resources": ["pods"], "apiGroups": [""]}]
        }))
        .unwrap();
        let mut new = existing.clone();
        new.raw_mut()["rules"] = json!([]);
        let out = rebaser().rebase(&existing, &new).unwrap();
        assert_eq!(out.raw()["rules"], existing.raw()["rules"]);
        assert_eq!(out, existing, "fully rebased object equals the live one");
    }
}
