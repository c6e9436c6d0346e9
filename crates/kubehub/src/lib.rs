//! kade kubehub: the resource client the deploy engine drives, a kube-rs
//! implementation, an in-memory cluster for tests, and the shared
//! resource-type catalogue.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use kade_core::{KadeError, Resource, ResourceRef};

mod catalogue;
mod error;
mod kube_client;
mod memory;

pub use catalogue::Catalogue;
pub use error::{ClientError, ClientResult};
pub use kube_client::KubeClient;
pub use memory::{Call, MemoryClient, Verb};

/// A served kind with its scope and verbs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceType {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub namespaced: bool,
    #[serde(default)]
    pub verbs: Vec<String>,
}

impl ResourceType {
    pub fn new(api_version: &str, kind: &str, namespaced: bool) -> Self {
        let (group, version) = kade_core::resource::split_api_version(api_version);
        let verbs = ["create", "delete", "get", "list", "patch", "update", "watch"].iter().map(|s| s.to_string()).collect();
        Self { group: group.to_string(), version: version.to_string(), kind: kind.to_string(), namespaced, verbs }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }

    pub fn supports(&self, verb: &str) -> bool { self.verbs.iter().any(|v| v == verb) }
    pub fn gvk_key(&self) -> String { format!("{}/{}", self.api_version(), self.kind) }
}

/// Equality-based label selector (`k=v,k2=v2`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelector {
    pub equals: BTreeMap<String, String>,
}

impl LabelSelector {
    pub fn new() -> Self { Self::default() }

    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.equals.insert(key.to_string(), value.to_string());
        self
    }

    pub fn is_empty(&self) -> bool { self.equals.is_empty() }

    pub fn matches(&self, res: &Resource) -> bool {
        self.equals.iter().all(|(k, v)| res.label(k) == Some(v.as_str()))
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.equals.iter().map(|(k, v)| format!("{k}={v}")).collect();
        f.write_str(&parts.join(","))
    }
}

impl FromStr for LabelSelector {
    type Err = KadeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = Self::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (k, v) = part
                .split_once('=')
                .ok_or_else(|| KadeError::validation(format!("label selector '{s}': expected key=value, got '{part}'")))?;
            out.equals.insert(k.trim().to_string(), v.trim().to_string());
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchMode {
    /// RFC 7386 JSON merge patch.
    Merge,
    ServerSideApply { field_manager: String, force: bool },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Propagation {
    #[default]
    Background,
    Foreground,
    Orphan,
}

#[derive(Debug, Clone)]
pub enum WatchEvent {
    Applied(Resource),
    Deleted(Resource),
    Restarted(Vec<Resource>),
}

/// Cluster operations consumed by the deploy pipeline.
#[async_trait]
pub trait ResourceClient: Send + Sync {
    async fn resource_types(&self) -> ClientResult<Vec<ResourceType>>;
    /// All objects of every listable type carrying the selector's labels.
    async fn list(&self, selector: &LabelSelector) -> ClientResult<Vec<Resource>>;
    async fn get(&self, target: &ResourceRef) -> ClientResult<Option<Resource>>;
    async fn create(&self, res: &Resource) -> ClientResult<Resource>;
    /// Full replace; fails with `Conflict` when `metadata.resourceVersion` is stale.
    async fn update(&self, res: &Resource) -> ClientResult<Resource>;
    async fn patch(&self, target: &ResourceRef, patch: &Json, mode: &PatchMode) -> ClientResult<Resource>;
    async fn delete(&self, target: &ResourceRef, propagation: Propagation) -> ClientResult<()>;
    /// Events for one object identity (and optionally a label subset).
    async fn watch(&self, target: &ResourceRef, selector: &LabelSelector) -> ClientResult<BoxStream<'static, WatchEvent>>;
}

/// RFC 7386 merge: `null` removes, objects merge recursively, everything
/// else replaces.
pub fn merge_patch(target: &mut Json, patch: &Json) {
    let Json::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Json::Object(Default::default());
    }
    let Json::Object(target_map) = target else { return };
    for (k, v) in patch_map {
        if v.is_null() {
            target_map.remove(k);
        } else {
            merge_patch(target_map.entry(k.clone()).or_insert(Json::Null), v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn selector_parse_and_match() {
        let sel: LabelSelector = "kade.dev/app=123, tier=web".parse().unwrap();
        assert_eq!(sel.to_string(), "kade.dev/app=123,tier=web");
        let mut r = Resource::build("v1", "ConfigMap", Some("default"), "c");
        assert!(!sel.matches(&r));
        r.set_label("kade.dev/app", "123");
        r.set_label("tier", "web");
        assert!(sel.matches(&r));
        assert!("novalue".parse::<LabelSelector>().is_err());
    }

    #[test]
    fn merge_patch_semantics() {
        let mut doc = json!({"a": {"b": 1, "c": 2}, "d": [1, 2]});
        merge_patch(&mut doc, &json!({"a": {"b": null, "e": 3}, "d": [3]}));
        assert_eq!(doc, json!({"a": {"c": 2, "e": 3}, "d": [3]}));
    }
}
