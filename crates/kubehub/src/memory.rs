//! In-memory cluster implementing `ResourceClient`.
//!
//! Behaves like a small apiserver: assigns uid/resourceVersion/
//! creationTimestamp, rejects stale updates, enforces namespace existence and
//! Service `spec.clusterIP` immutability, registers CRD kinds when CRDs are
//! created, and cascades namespace deletion. Tests drive it with
//! [`MemoryClient::fail_next`], [`MemoryClient::mutate`] and the call log.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::{json, Value as Json};
use tokio::sync::broadcast;
use tracing::debug;

use kade_core::{ObjectKey, Resource, ResourceRef};

use crate::{merge_patch, ClientError, ClientResult, LabelSelector, PatchMode, Propagation, ResourceClient, ResourceType, WatchEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    List,
    Get,
    Create,
    Update,
    Patch,
    Delete,
    Watch,
}

/// One recorded client call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub verb: Verb,
    pub key: Option<ObjectKey>,
}

struct Injected {
    verb: Verb,
    name: Option<String>,
    error: ClientError,
}

#[derive(Default)]
struct State {
    types: Vec<ResourceType>,
    objects: BTreeMap<ObjectKey, Resource>,
    next_rv: u64,
    next_ip: u32,
    failures: VecDeque<Injected>,
    calls: Vec<Call>,
}

pub struct MemoryClient {
    state: Mutex<State>,
    events: broadcast::Sender<WatchEvent>,
}

impl Default for MemoryClient {
    fn default() -> Self { Self::new() }
}

fn standard_types() -> Vec<ResourceType> {
    [
        ("v1", "Namespace", false),
        ("v1", "ConfigMap", true),
        ("v1", "Secret", true),
        ("v1", "Service", true),
        ("v1", "ServiceAccount", true),
        ("v1", "Pod", true),
        ("v1", "PersistentVolumeClaim", true),
        ("v1", "Endpoints", true),
        ("apps/v1", "Deployment", true),
        ("apps/v1", "StatefulSet", true),
        ("apps/v1", "DaemonSet", true),
        ("apps/v1", "ReplicaSet", true),
        ("batch/v1", "Job", true),
        ("batch/v1", "CronJob", true),
        ("networking.k8s.io/v1", "Ingress", true),
        ("policy/v1", "PodDisruptionBudget", true),
        ("rbac.authorization.k8s.io/v1", "Role", true),
        ("rbac.authorization.k8s.io/v1", "RoleBinding", true),
        ("rbac.authorization.k8s.io/v1", "ClusterRole", false),
        ("rbac.authorization.k8s.io/v1", "ClusterRoleBinding", false),
        ("apiextensions.k8s.io/v1", "CustomResourceDefinition", false),
        ("apiregistration.k8s.io/v1", "APIService", false),
    ]
    .into_iter()
    .map(|(av, k, ns)| ResourceType::new(av, k, ns))
    .collect()
}

fn now_rfc3339() -> String { Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true) }

fn meta_mut(res: &mut Resource) -> &mut serde_json::Map<String, Json> {
    let root = kade_core::resource::ensure_object(res.raw_mut());
    kade_core::resource::ensure_object(root.entry("metadata").or_insert_with(|| json!({})))
}

impl MemoryClient {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        let client = Self { state: Mutex::new(State { types: standard_types(), next_rv: 1, next_ip: 1, ..State::default() }), events };
        for ns in ["default", "kube-system"] {
            client.insert(Resource::build("v1", "Namespace", None, ns));
        }
        client
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        }
    }

    pub fn add_type(&self, api_version: &str, kind: &str, namespaced: bool) {
        let mut st = self.lock();
        let t = ResourceType::new(api_version, kind, namespaced);
        if !st.types.iter().any(|x| x.group == t.group && x.kind == t.kind) {
            st.types.push(t);
        }
    }

    /// Store an object as if created by someone else (no call recorded,
    /// no failure injection).
    pub fn insert(&self, res: Resource) -> Resource {
        let mut st = self.lock();
        let out = Self::stamp_new(&mut st, res);
        st.objects.insert(out.key(), out.clone());
        drop(st);
        let _ = self.events.send(WatchEvent::Applied(out.clone()));
        out
    }

    /// Mutate a live object out-of-band; bumps resourceVersion.
    pub fn mutate(&self, target: &ResourceRef, f: impl FnOnce(&mut Resource)) -> Option<Resource> {
        let mut st = self.lock();
        let rv = Self::bump_rv(&mut st);
        let obj = st.objects.get_mut(&target.key())?;
        f(obj);
        meta_mut(obj).insert("resourceVersion".into(), Json::String(rv));
        let out = obj.clone();
        drop(st);
        let _ = self.events.send(WatchEvent::Applied(out.clone()));
        Some(out)
    }

    /// Remove an object out-of-band.
    pub fn remove(&self, target: &ResourceRef) -> Option<Resource> {
        let out = self.lock().objects.remove(&target.key());
        if let Some(o) = &out {
            let _ = self.events.send(WatchEvent::Deleted(o.clone()));
        }
        out
    }

    /// Fail the next call of `verb` (optionally only for object `name`).
    pub fn fail_next(&self, verb: Verb, name: Option<&str>, error: ClientError) {
        self.lock().failures.push_back(Injected { verb, name: name.map(str::to_string), error });
    }

    pub fn object(&self, target: &ResourceRef) -> Option<Resource> { self.lock().objects.get(&target.key()).cloned() }
    pub fn objects(&self) -> Vec<Resource> { self.lock().objects.values().cloned().collect() }
    pub fn calls(&self) -> Vec<Call> { self.lock().calls.clone() }

    /// Keys of mutating calls (create/update/patch/delete) in order.
    pub fn writes(&self) -> Vec<(Verb, ObjectKey)> {
        self.lock()
            .calls
            .iter()
            .filter(|c| matches!(c.verb, Verb::Create | Verb::Update | Verb::Patch | Verb::Delete))
            .filter_map(|c| c.key.clone().map(|k| (c.verb, k)))
            .collect()
    }

    pub fn clear_calls(&self) { self.lock().calls.clear(); }

    fn bump_rv(st: &mut State) -> String {
        let rv = st.next_rv;
        st.next_rv += 1;
        rv.to_string()
    }

    fn stamp_new(st: &mut State, mut res: Resource) -> Resource {
        let rv = Self::bump_rv(st);
        if res.is_kind("", "Service") {
            let spec = kade_core::resource::ensure_object(kade_core::resource::ensure_object(res.raw_mut()).entry("spec").or_insert_with(|| json!({})));
            if !spec.get("clusterIP").is_some_and(|v| v.as_str().is_some_and(|s| !s.is_empty())) {
                let ip = format!("10.96.0.{}", st.next_ip);
                st.next_ip += 1;
                spec.insert("clusterIP".into(), Json::String(ip));
            }
        }
        if let Some((group, kind, namespaced)) = res.crd_target() {
            let version = res
                .raw()
                .pointer("/spec/versions/0/name")
                .and_then(Json::as_str)
                .unwrap_or("v1")
                .to_string();
            if !st.types.iter().any(|t| t.group == group && t.kind == kind) {
                let av = if group.is_empty() { version } else { format!("{group}/{version}") };
                st.types.push(ResourceType::new(&av, &kind, namespaced));
            }
            if res.status().is_none() {
                let conditions = json!({"conditions": [
                    {"type": "NamesAccepted", "status": "True"},
                    {"type": "Established", "status": "True"},
                ]});
                kade_core::resource::ensure_object(res.raw_mut()).insert("status".into(), conditions);
            }
        }
        let meta = meta_mut(&mut res);
        meta.insert("uid".into(), Json::String(uuid::Uuid::new_v4().to_string()));
        meta.insert("resourceVersion".into(), Json::String(rv));
        meta.insert("creationTimestamp".into(), Json::String(now_rfc3339()));
        meta.insert("generation".into(), json!(1));
        res
    }

    fn record(&self, st: &mut State, verb: Verb, key: Option<ObjectKey>) -> ClientResult<()> {
        st.calls.push(Call { verb, key: key.clone() });
        let name = key.as_ref().map(|k| k.name.as_str());
        let pos = st.failures.iter().position(|f| f.verb == verb && (f.name.is_none() || f.name.as_deref() == name));
        match pos.and_then(|i| st.failures.remove(i)) {
            Some(f) => {
                debug!(?verb, error = %f.error, "memory: injected failure");
                Err(f.error)
            }
            None => Ok(()),
        }
    }

    fn check_type(st: &State, group: &str, kind: &str, namespace: Option<&str>) -> ClientResult<()> {
        let t = st
            .types
            .iter()
            .find(|t| t.group == group && t.kind == kind)
            .ok_or_else(|| ClientError::NotFound(format!("the server could not find the requested resource ({group}/{kind})")))?;
        match (t.namespaced, namespace) {
            (true, None) => Err(ClientError::Invalid(format!("{kind}: namespace is required"))),
            (true, Some(ns)) => {
                let ns_key = ObjectKey::new("", "Namespace", None, ns);
                if st.objects.contains_key(&ns_key) { Ok(()) } else { Err(ClientError::NotFound(format!("namespaces \"{ns}\" not found"))) }
            }
            (false, _) => Ok(()),
        }
    }

    fn do_update(st: &mut State, mut res: Resource) -> ClientResult<Resource> {
        let key = res.key();
        Self::check_type(st, res.group(), res.kind(), res.namespace())?;
        let Some(current) = st.objects.get(&key).cloned() else {
            return Err(ClientError::NotFound(format!("{key}")));
        };
        if let Some(rv) = res.resource_version() {
            if Some(rv) != current.resource_version() {
                return Err(ClientError::Conflict(format!(
                    "Operation cannot be fulfilled on {}: the object has been modified; please apply your changes to the latest version and try again",
                    res.description()
                )));
            }
        }
        if res.is_kind("", "Service") {
            let old_ip = current.raw().pointer("/spec/clusterIP").cloned();
            match res.raw().pointer("/spec/clusterIP").cloned() {
                None | Some(Json::Null) => {
                    if let Some(ip) = old_ip {
                        let spec = kade_core::resource::ensure_object(kade_core::resource::ensure_object(res.raw_mut()).entry("spec").or_insert_with(|| json!({})));
                        spec.insert("clusterIP".into(), ip);
                    }
                }
                Some(new_ip) if Some(&new_ip) != old_ip.as_ref() => {
                    return Err(ClientError::Invalid(format!("{}: spec.clusterIP: Invalid value: {new_ip}: field is immutable", res.description())));
                }
                Some(_) => {}
            }
        }
        let spec_changed = strip_meta_status(res.raw()) != strip_meta_status(current.raw());
        let generation = current.generation().unwrap_or(1) + i64::from(spec_changed);
        let rv = Self::bump_rv(st);
        // status is a subresource: plain updates keep the stored one
        if let Some(status) = current.status().cloned() {
            kade_core::resource::ensure_object(res.raw_mut()).insert("status".into(), status);
        } else if let Some(map) = res.raw_mut().as_object_mut() {
            map.remove("status");
        }
        let meta = meta_mut(&mut res);
        for k in ["uid", "creationTimestamp"] {
            if let Some(v) = current.raw().pointer(&format!("/metadata/{k}")) {
                meta.insert(k.into(), v.clone());
            }
        }
        meta.insert("resourceVersion".into(), Json::String(rv));
        meta.insert("generation".into(), json!(generation));
        st.objects.insert(key, res.clone());
        Ok(res)
    }
}

fn strip_meta_status(v: &Json) -> Json {
    let mut v = v.clone();
    if let Some(m) = v.as_object_mut() {
        m.remove("metadata");
        m.remove("status");
    }
    v
}

#[async_trait]
impl ResourceClient for MemoryClient {
    async fn resource_types(&self) -> ClientResult<Vec<ResourceType>> { Ok(self.lock().types.clone()) }

    async fn list(&self, selector: &LabelSelector) -> ClientResult<Vec<Resource>> {
        let mut st = self.lock();
        self.record(&mut st, Verb::List, None)?;
        Ok(st.objects.values().filter(|o| selector.matches(o)).cloned().collect())
    }

    async fn get(&self, target: &ResourceRef) -> ClientResult<Option<Resource>> {
        let mut st = self.lock();
        self.record(&mut st, Verb::Get, Some(target.key()))?;
        Ok(st.objects.get(&target.key()).cloned())
    }

    async fn create(&self, res: &Resource) -> ClientResult<Resource> {
        let mut st = self.lock();
        let key = res.key();
        self.record(&mut st, Verb::Create, Some(key.clone()))?;
        Self::check_type(&st, res.group(), res.kind(), res.namespace())?;
        if st.objects.contains_key(&key) {
            return Err(ClientError::AlreadyExists(format!("{} already exists", res.description())));
        }
        let mut res = res.clone();
        if let Some(m) = res.raw_mut().get_mut("metadata").and_then(Json::as_object_mut) {
            m.remove("resourceVersion");
            m.remove("uid");
        }
        let out = Self::stamp_new(&mut st, res);
        st.objects.insert(key, out.clone());
        drop(st);
        let _ = self.events.send(WatchEvent::Applied(out.clone()));
        Ok(out)
    }

    async fn update(&self, res: &Resource) -> ClientResult<Resource> {
        let mut st = self.lock();
        self.record(&mut st, Verb::Update, Some(res.key()))?;
        let out = Self::do_update(&mut st, res.clone())?;
        drop(st);
        let _ = self.events.send(WatchEvent::Applied(out.clone()));
        Ok(out)
    }

    async fn patch(&self, target: &ResourceRef, patch: &Json, mode: &PatchMode) -> ClientResult<Resource> {
        let mut st = self.lock();
        let key = target.key();
        self.record(&mut st, Verb::Patch, Some(key.clone()))?;
        let out = match (st.objects.get(&key).cloned(), mode) {
            (Some(current), _) => {
                let mut raw = current.raw().clone();
                merge_patch(&mut raw, patch);
                let mut next = Resource::from_json(raw).map_err(|e| ClientError::Invalid(e.to_string()))?;
                // patches never carry a stale resourceVersion
                if let Some(rv) = current.resource_version() {
                    meta_mut(&mut next).insert("resourceVersion".into(), Json::String(rv.to_string()));
                }
                Self::do_update(&mut st, next)?
            }
            (None, PatchMode::ServerSideApply { .. }) => {
                let res = Resource::from_json(patch.clone()).map_err(|e| ClientError::Invalid(e.to_string()))?;
                Self::check_type(&st, res.group(), res.kind(), res.namespace())?;
                let out = Self::stamp_new(&mut st, res);
                st.objects.insert(key, out.clone());
                out
            }
            (None, PatchMode::Merge) => return Err(ClientError::NotFound(target.to_string())),
        };
        drop(st);
        let _ = self.events.send(WatchEvent::Applied(out.clone()));
        Ok(out)
    }

    async fn delete(&self, target: &ResourceRef, propagation: Propagation) -> ClientResult<()> {
        let mut st = self.lock();
        let key = target.key();
        self.record(&mut st, Verb::Delete, Some(key.clone()))?;
        let Some(removed) = st.objects.remove(&key) else {
            return Err(ClientError::NotFound(target.to_string()));
        };
        let mut gone = vec![removed];
        if target.group.is_empty() && target.kind == "Namespace" && propagation != Propagation::Orphan {
            let contents: Vec<ObjectKey> = st.objects.keys().filter(|k| k.namespace() == Some(target.name.as_str())).cloned().collect();
            gone.extend(contents.iter().filter_map(|k| st.objects.remove(k)));
        }
        drop(st);
        for o in gone {
            let _ = self.events.send(WatchEvent::Deleted(o));
        }
        Ok(())
    }

    async fn watch(&self, target: &ResourceRef, selector: &LabelSelector) -> ClientResult<BoxStream<'static, WatchEvent>> {
        let key = target.key();
        let rx = {
            let mut st = self.lock();
            self.record(&mut st, Verb::Watch, Some(key.clone()))?;
            self.events.subscribe()
        };
        let selector = selector.clone();
        let stream = stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(ev) => return Some((ev, rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .filter(move |ev| {
            let keep = match ev {
                WatchEvent::Applied(o) | WatchEvent::Deleted(o) => o.key() == key && selector.matches(o),
                WatchEvent::Restarted(_) => true,
            };
            futures::future::ready(keep)
        });
        Ok(stream.boxed())
    }
}
