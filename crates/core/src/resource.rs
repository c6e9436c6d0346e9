//! Resource model: an opaque JSON tree with a typed metadata header.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

use crate::error::{KadeError, KadeResult};

fn max_yaml_bytes() -> usize {
    std::env::var("KADE_MAX_YAML_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(8_000_000)
}

/// Identity used to pair existing and new objects. Version is deliberately absent.
///
/// Field order doubles as display order: namespace, kind, name, then group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub kind: String,
    pub name: String,
    pub group: String,
}

impl ObjectKey {
    pub fn new(group: &str, kind: &str, namespace: Option<&str>, name: &str) -> Self {
        Self {
            namespace: namespace.unwrap_or_default().to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
            group: group.to_string(),
        }
    }

    pub fn namespace(&self) -> Option<&str> {
        if self.namespace.is_empty() { None } else { Some(&self.namespace) }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let group = if self.group.is_empty() { "core" } else { self.group.as_str() };
        match self.namespace() {
            Some(ns) => write!(f, "{}/{} ({}) namespace: {}", self.kind.to_lowercase(), self.name, group, ns),
            None => write!(f, "{}/{} ({}) cluster", self.kind.to_lowercase(), self.name, group),
        }
    }
}

/// Fully qualified reference, including version, for talking to the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceRef {
    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.group, &self.kind, self.namespace.as_deref(), &self.name)
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.namespace.as_deref() {
            Some(ns) => write!(f, "{}/{} ({}) namespace: {}", self.kind.to_lowercase(), self.name, self.api_version(), ns),
            None => write!(f, "{}/{} ({}) cluster", self.kind.to_lowercase(), self.name, self.api_version()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerRef {
    pub uid: String,
    pub api_version: String,
    pub kind: String,
    pub name: String,
}

/// Split `group/version` (or bare `version` for the core group).
pub fn split_api_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((g, v)) => (g, v),
        None => ("", api_version),
    }
}

/// A Kubernetes-shaped object. Path-based engines work on `raw`; typed
/// accessors cover the metadata header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Resource {
    raw: Json,
}

impl Resource {
    /// Wrap a JSON object, checking the identifying fields are present.
    pub fn from_json(raw: Json) -> KadeResult<Self> {
        if !raw.is_object() {
            return Err(KadeError::validation("resource must be a mapping"));
        }
        if raw.get("apiVersion").and_then(|v| v.as_str()).map_or(true, str::is_empty) {
            return Err(KadeError::validation("resource missing apiVersion"));
        }
        if raw.get("kind").and_then(|v| v.as_str()).map_or(true, str::is_empty) {
            return Err(KadeError::validation("resource missing kind"));
        }
        let name = raw.get("metadata").and_then(|m| m.get("name")).and_then(|v| v.as_str());
        if name.map_or(true, str::is_empty) {
            return Err(KadeError::validation("resource missing metadata.name"));
        }
        Ok(Self { raw })
    }

    /// Minimal object with identity only; handy for records and tests.
    pub fn build(api_version: &str, kind: &str, namespace: Option<&str>, name: &str) -> Self {
        let mut meta = Map::new();
        meta.insert("name".into(), Json::String(name.to_string()));
        if let Some(ns) = namespace {
            meta.insert("namespace".into(), Json::String(ns.to_string()));
        }
        let mut root = Map::new();
        root.insert("apiVersion".into(), Json::String(api_version.to_string()));
        root.insert("kind".into(), Json::String(kind.to_string()));
        root.insert("metadata".into(), Json::Object(meta));
        Self { raw: Json::Object(root) }
    }

    /// Parse a multi-document YAML stream. `*List` documents are flattened.
    pub fn from_yaml_documents(yaml: &str) -> KadeResult<Vec<Self>> {
        if yaml.len() > max_yaml_bytes() {
            return Err(KadeError::validation(format!("YAML payload too large (>{} bytes)", max_yaml_bytes())));
        }
        let mut out = Vec::new();
        for doc in serde_yaml::Deserializer::from_str(yaml) {
            let val = serde_yaml::Value::deserialize(doc)?;
            if val.is_null() {
                continue;
            }
            let json = serde_json::to_value(val)?;
            let is_list = json.get("kind").and_then(|k| k.as_str()).map_or(false, |k| k.ends_with("List"));
            match json.get("items").and_then(|i| i.as_array()) {
                Some(items) if is_list => {
                    for item in items {
                        out.push(Self::from_json(item.clone())?);
                    }
                }
                _ => out.push(Self::from_json(json)?),
            }
        }
        Ok(out)
    }

    pub fn raw(&self) -> &Json { &self.raw }
    pub fn raw_mut(&mut self) -> &mut Json { &mut self.raw }
    pub fn into_raw(self) -> Json { self.raw }

    pub fn api_version(&self) -> &str { self.raw.get("apiVersion").and_then(|v| v.as_str()).unwrap_or_default() }
    pub fn group(&self) -> &str { split_api_version(self.api_version()).0 }
    pub fn version(&self) -> &str { split_api_version(self.api_version()).1 }
    pub fn kind(&self) -> &str { self.raw.get("kind").and_then(|v| v.as_str()).unwrap_or_default() }

    fn metadata(&self) -> Option<&Map<String, Json>> { self.raw.get("metadata").and_then(|m| m.as_object()) }

    fn metadata_mut(&mut self) -> &mut Map<String, Json> {
        let root = ensure_object(&mut self.raw);
        ensure_object(root.entry("metadata").or_insert_with(|| Json::Object(Map::new())))
    }

    fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata().and_then(|m| m.get(key)).and_then(|v| v.as_str()).filter(|s| !s.is_empty())
    }

    pub fn name(&self) -> &str { self.meta_str("name").unwrap_or_default() }
    pub fn namespace(&self) -> Option<&str> { self.meta_str("namespace") }
    pub fn uid(&self) -> Option<&str> { self.meta_str("uid") }
    pub fn resource_version(&self) -> Option<&str> { self.meta_str("resourceVersion") }

    pub fn set_name(&mut self, name: &str) {
        self.metadata_mut().insert("name".into(), Json::String(name.to_string()));
    }

    pub fn set_namespace(&mut self, namespace: Option<&str>) {
        let meta = self.metadata_mut();
        match namespace {
            Some(ns) => { meta.insert("namespace".into(), Json::String(ns.to_string())); }
            None => { meta.remove("namespace"); }
        }
    }

    pub fn creation_timestamp(&self) -> Option<DateTime<Utc>> {
        self.meta_str("creationTimestamp")
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    pub fn generation(&self) -> Option<i64> {
        self.metadata().and_then(|m| m.get("generation")).and_then(|v| v.as_i64())
    }

    pub fn labels(&self) -> BTreeMap<String, String> { string_map(self.metadata().and_then(|m| m.get("labels"))) }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.metadata().and_then(|m| m.get("labels")).and_then(|l| l.get(key)).and_then(|v| v.as_str())
    }

    pub fn set_label(&mut self, key: &str, value: &str) {
        let meta = self.metadata_mut();
        let labels = ensure_object(meta.entry("labels").or_insert_with(|| Json::Object(Map::new())));
        labels.insert(key.to_string(), Json::String(value.to_string()));
    }

    pub fn remove_label(&mut self, key: &str) -> Option<String> {
        let labels = self.metadata_mut().get_mut("labels").and_then(|l| l.as_object_mut())?;
        labels.remove(key).and_then(|v| v.as_str().map(str::to_string))
    }

    pub fn annotations(&self) -> BTreeMap<String, String> { string_map(self.metadata().and_then(|m| m.get("annotations"))) }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata().and_then(|m| m.get("annotations")).and_then(|a| a.get(key)).and_then(|v| v.as_str())
    }

    pub fn has_annotation(&self, key: &str) -> bool { self.annotation(key).is_some() }

    pub fn set_annotation(&mut self, key: &str, value: &str) {
        let meta = self.metadata_mut();
        let annos = ensure_object(meta.entry("annotations").or_insert_with(|| Json::Object(Map::new())));
        annos.insert(key.to_string(), Json::String(value.to_string()));
    }

    pub fn remove_annotation(&mut self, key: &str) -> Option<String> {
        let annos = self.metadata_mut().get_mut("annotations").and_then(|a| a.as_object_mut())?;
        annos.remove(key).and_then(|v| v.as_str().map(str::to_string))
    }

    pub fn owner_refs(&self) -> Vec<OwnerRef> {
        let Some(refs) = self.metadata().and_then(|m| m.get("ownerReferences")).and_then(|v| v.as_array()) else {
            return Vec::new();
        };
        refs.iter()
            .map(|r| OwnerRef {
                uid: json_str(r, "uid"),
                api_version: json_str(r, "apiVersion"),
                kind: json_str(r, "kind"),
                name: json_str(r, "name"),
            })
            .collect()
    }

    pub fn status(&self) -> Option<&Json> { self.raw.get("status") }

    pub fn managed_fields(&self) -> Option<&Json> { self.metadata().and_then(|m| m.get("managedFields")) }

    pub fn key(&self) -> ObjectKey { ObjectKey::new(self.group(), self.kind(), self.namespace(), self.name()) }

    pub fn resource_ref(&self) -> ResourceRef {
        ResourceRef {
            group: self.group().to_string(),
            version: self.version().to_string(),
            kind: self.kind().to_string(),
            namespace: self.namespace().map(str::to_string),
            name: self.name().to_string(),
        }
    }

    pub fn is_kind(&self, group: &str, kind: &str) -> bool { self.group() == group && self.kind() == kind }

    pub fn is_crd(&self) -> bool { self.is_kind("apiextensions.k8s.io", "CustomResourceDefinition") }

    /// `(group, kind, namespaced)` declared by a CRD.
    pub fn crd_target(&self) -> Option<(String, String, bool)> {
        if !self.is_crd() {
            return None;
        }
        let spec = self.raw.get("spec")?;
        let group = spec.get("group")?.as_str()?.to_string();
        let kind = spec.get("names")?.get("kind")?.as_str()?.to_string();
        let namespaced = spec.get("scope").and_then(|s| s.as_str()).map_or(true, |s| s != "Cluster");
        Some((group, kind, namespaced))
    }

    pub fn description(&self) -> String { self.resource_ref().to_string() }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { fmt::Display::fmt(&self.resource_ref(), f) }
}

fn json_str(v: &Json, key: &str) -> String {
    v.get(key).and_then(|s| s.as_str()).unwrap_or_default().to_string()
}

fn string_map(v: Option<&Json>) -> BTreeMap<String, String> {
    v.and_then(|m| m.as_object())
        .map(|m| m.iter().filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string()))).collect())
        .unwrap_or_default()
}

/// Coerce `v` into an object (replacing any scalar) and borrow the map.
pub fn ensure_object(v: &mut Json) -> &mut Map<String, Json> {
    if !v.is_object() {
        *v = Json::Object(Map::new());
    }
    match v {
        Json::Object(m) => m,
        _ => unreachable!("value was just coerced into an object"),
    }
}

/// Stable, key-sorted YAML rendering used for diffs and fingerprints.
pub fn canonical_yaml(v: &Json) -> String {
    fn conv(v: &Json) -> serde_yaml::Value {
        use serde_yaml::{Mapping, Number, Value as Y};
        match v {
            Json::Null => Y::Null,
            Json::Bool(b) => Y::Bool(*b),
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Y::Number(Number::from(i))
                } else if let Some(u) = n.as_u64() {
                    Y::Number(Number::from(u))
                } else {
                    Y::Number(Number::from(n.as_f64().unwrap_or_default()))
                }
            }
            Json::String(s) => Y::String(s.clone()),
            Json::Array(items) => Y::Sequence(items.iter().map(conv).collect()),
            Json::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                let mut out = Mapping::new();
                for k in keys {
                    out.insert(Y::String(k.clone()), conv(&map[k]));
                }
                Y::Mapping(out)
            }
        }
    }
    match v {
        Json::Null => String::new(),
        _ => serde_yaml::to_string(&conv(v)).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_errors_are_friendly() {
        let e = Resource::from_json(json!({"kind": "Foo", "metadata": {"name": "x"}})).unwrap_err().to_string();
        assert!(e.contains("missing apiVersion"), "{e}");
        let e = Resource::from_json(json!({"apiVersion": "v1", "metadata": {"name": "x"}})).unwrap_err().to_string();
        assert!(e.contains("missing kind"), "{e}");
        let e = Resource::from_json(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {}})).unwrap_err().to_string();
        assert!(e.contains("missing metadata.name"), "{e}");
    }

    #[test]
    fn yaml_documents_flatten_lists_and_skip_empty() {
        let yaml = "---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n---\n---\napiVersion: v1\nkind: List\nitems:\n- apiVersion: v1\n  kind: Secret\n  metadata:\n    name: b\n";
        let res = Resource::from_yaml_documents(yaml).unwrap();
        assert_eq!(res.len(), 2);
        assert_eq!(res[0].kind(), "ConfigMap");
        assert_eq!(res[1].kind(), "Secret");
        assert_eq!(res[1].name(), "b");
    }

    #[test]
    fn identity_ignores_version() {
        let a = Resource::build("apps/v1", "Deployment", Some("ns"), "web");
        let b = Resource::build("apps/v1beta2", "Deployment", Some("ns"), "web");
        assert_eq!(a.key(), b.key());
        assert_ne!(a.resource_ref(), b.resource_ref());
        assert_eq!(a.group(), "apps");
        assert_eq!(a.version(), "v1");
    }

    #[test]
    fn keys_order_by_namespace_kind_name_group() {
        let mut keys = vec![
            ObjectKey::new("", "Service", Some("b"), "x"),
            ObjectKey::new("", "ConfigMap", Some("b"), "y"),
            ObjectKey::new("", "ConfigMap", Some("a"), "z"),
            ObjectKey::new("", "Namespace", None, "a"),
        ];
        keys.sort();
        let names: Vec<_> = keys.iter().map(|k| k.name.as_str()).collect();
        assert_eq!(names, vec!["a", "z", "y", "x"]);
    }

    #[test]
    fn labels_and_annotations_round_trip() {
        let mut r = Resource::build("v1", "ConfigMap", Some("default"), "cm");
        r.set_label("app", "web");
        r.set_annotation("note", "hi");
        assert_eq!(r.label("app"), Some("web"));
        assert_eq!(r.annotations().get("note").map(String::as_str), Some("hi"));
        assert_eq!(r.remove_label("app").as_deref(), Some("web"));
        assert!(r.labels().is_empty());
        r.set_namespace(None);
        assert_eq!(r.namespace(), None);
    }

    #[test]
    fn crd_target_reads_spec() {
        let crd = Resource::from_json(json!({
            "apiVersion": "apiextensions.k8s.io/v1",
            "kind": "CustomResourceDefinition",
            "metadata": {"name": "widgets.example.com"},
            "spec": {"group": "example.com", "names": {"kind": "Widget"}, "scope": "Cluster"}
        }))
        .unwrap();
        assert_eq!(crd.crd_target(), Some(("example.com".into(), "Widget".into(), false)));
    }

    #[test]
    fn canonical_yaml_sorts_keys() {
        let a = canonical_yaml(&json!({"b": 1, "a": {"d": true, "c": "x"}}));
        assert_eq!(a, "a:\n  c: x\n  d: true\nb: 1\n");
    }
}
