//! `ResourceClient` over kube-rs dynamic objects.

use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams, PropagationPolicy},
    core::{ApiResource, DynamicObject},
    discovery::{verbs, Discovery, Scope},
    runtime::watcher::{self, Event},
    Client,
};
use metrics::{counter, histogram};
use serde_json::Value as Json;
use tracing::{debug, info, warn};

use kade_core::{Resource, ResourceRef};

use crate::{ClientError, ClientResult, LabelSelector, PatchMode, Propagation, ResourceClient, ResourceType, WatchEvent};

const LIST_CONCURRENCY: usize = 8;

#[derive(Clone)]
struct Served {
    ar: ApiResource,
    namespaced: bool,
    verbs: Vec<String>,
}

pub struct KubeClient {
    client: Client,
    served: ArcSwapOption<Vec<Served>>,
}

impl KubeClient {
    pub fn new(client: Client) -> Self { Self { client, served: ArcSwapOption::empty() } }

    pub async fn try_default() -> ClientResult<Self> {
        let client = Client::try_default().await.map_err(ClientError::from)?;
        Ok(Self::new(client))
    }

    async fn discover(&self) -> ClientResult<Arc<Vec<Served>>> {
        if let Some(s) = self.served.load_full() {
            return Ok(s);
        }
        let t0 = Instant::now();
        let discovery = Discovery::new(self.client.clone()).run().await.map_err(ClientError::from)?;
        let mut out = Vec::new();
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                out.push(Served { ar, namespaced, verbs: caps.operations.clone() });
            }
        }
        let out = Arc::new(out);
        self.served.store(Some(out.clone()));
        info!(count = out.len(), took_ms = %t0.elapsed().as_millis(), "kube: discovery ok");
        Ok(out)
    }

    /// Resolve the api resource for a ref, keeping the caller's version.
    async fn api_for(&self, target: &ResourceRef) -> ClientResult<Api<DynamicObject>> {
        let served = self.discover().await?;
        let found = served
            .iter()
            .find(|s| s.ar.group == target.group && s.ar.kind == target.kind)
            .ok_or_else(|| ClientError::NotFound(format!("resource type {}/{} is not served", target.api_version(), target.kind)))?;
        let mut ar = found.ar.clone();
        if !target.version.is_empty() {
            ar.version = target.version.clone();
            ar.api_version = target.api_version();
        }
        Ok(match (&target.namespace, found.namespaced) {
            (Some(ns), true) => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        })
    }

    fn to_dynamic(res: &Resource) -> ClientResult<DynamicObject> {
        serde_json::from_value(res.raw().clone()).map_err(|e| ClientError::Invalid(format!("{}: {e}", res.description())))
    }
}

fn from_dynamic(obj: DynamicObject, ar: Option<&ApiResource>) -> ClientResult<Resource> {
    let mut raw = serde_json::to_value(&obj).map_err(|e| ClientError::Transport(format!("decode object: {e}")))?;
    // list items come back without TypeMeta
    if let (Some(ar), Some(map)) = (ar, raw.as_object_mut()) {
        map.entry("apiVersion").or_insert_with(|| Json::String(ar.api_version.clone()));
        map.entry("kind").or_insert_with(|| Json::String(ar.kind.clone()));
    }
    Resource::from_json(raw).map_err(|e| ClientError::Transport(e.to_string()))
}

fn observe(op: &'static str, t0: Instant, res: &ClientResult<impl Sized>) {
    histogram!("kube_request_latency_ms", t0.elapsed().as_secs_f64() * 1000.0, "op" => op);
    if res.is_err() {
        counter!("kube_request_errors_total", 1u64, "op" => op);
    }
}

#[async_trait]
impl ResourceClient for KubeClient {
    async fn resource_types(&self) -> ClientResult<Vec<ResourceType>> {
        self.served.store(None);
        let served = self.discover().await?;
        Ok(served
            .iter()
            .map(|s| ResourceType {
                group: s.ar.group.clone(),
                version: s.ar.version.clone(),
                kind: s.ar.kind.clone(),
                namespaced: s.namespaced,
                verbs: s.verbs.clone(),
            })
            .collect())
    }

    async fn list(&self, selector: &LabelSelector) -> ClientResult<Vec<Resource>> {
        let t0 = Instant::now();
        let served = self.discover().await?;
        let lp = ListParams::default().labels(&selector.to_string());
        let listable: Vec<Served> = served.iter().filter(|s| s.verbs.iter().any(|v| v == verbs::LIST)).cloned().collect();
        let results: Vec<ClientResult<Vec<Resource>>> = stream::iter(listable)
            .map(|s| {
                let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &s.ar);
                let lp = lp.clone();
                async move {
                    match api.list(&lp).await {
                        Ok(list) => list.items.into_iter().map(|o| from_dynamic(o, Some(&s.ar))).collect(),
                        Err(e) => match ClientError::from(e) {
                            // kinds we cannot list are skipped, not fatal
                            ClientError::Forbidden(m) | ClientError::NotFound(m) => {
                                debug!(kind = %s.ar.kind, error = %m, "kube: list skipped");
                                Ok(Vec::new())
                            }
                            other => Err(other),
                        },
                    }
                }
            })
            .buffer_unordered(LIST_CONCURRENCY)
            .collect()
            .await;
        let mut out = Vec::new();
        for r in results {
            out.extend(r?);
        }
        out.sort_by_key(|r| r.key());
        info!(selector = %selector, count = out.len(), took_ms = %t0.elapsed().as_millis(), "kube: list ok");
        Ok(out)
    }

    async fn get(&self, target: &ResourceRef) -> ClientResult<Option<Resource>> {
        let t0 = Instant::now();
        let api = self.api_for(target).await?;
        let res = api.get_opt(&target.name).await.map_err(ClientError::from);
        observe("get", t0, &res);
        let ar = ApiResource { group: target.group.clone(), version: target.version.clone(), api_version: target.api_version(), kind: target.kind.clone(), plural: String::new() };
        res?.map(|o| from_dynamic(o, Some(&ar))).transpose()
    }

    async fn create(&self, res: &Resource) -> ClientResult<Resource> {
        let t0 = Instant::now();
        let api = self.api_for(&res.resource_ref()).await?;
        let out = api.create(&PostParams::default(), &Self::to_dynamic(res)?).await.map_err(ClientError::from);
        observe("create", t0, &out);
        from_dynamic(out?, None)
    }

    async fn update(&self, res: &Resource) -> ClientResult<Resource> {
        let t0 = Instant::now();
        let api = self.api_for(&res.resource_ref()).await?;
        let out = api.replace(res.name(), &PostParams::default(), &Self::to_dynamic(res)?).await.map_err(ClientError::from);
        observe("update", t0, &out);
        from_dynamic(out?, None)
    }

    async fn patch(&self, target: &ResourceRef, patch: &Json, mode: &PatchMode) -> ClientResult<Resource> {
        let t0 = Instant::now();
        let api = self.api_for(target).await?;
        let out = match mode {
            PatchMode::Merge => api.patch(&target.name, &PatchParams::default(), &Patch::Merge(patch)).await,
            PatchMode::ServerSideApply { field_manager, force } => {
                let mut pp = PatchParams::apply(field_manager);
                if *force {
                    pp = pp.force();
                }
                api.patch(&target.name, &pp, &Patch::Apply(patch)).await
            }
        }
        .map_err(ClientError::from);
        observe("patch", t0, &out);
        from_dynamic(out?, None)
    }

    async fn delete(&self, target: &ResourceRef, propagation: Propagation) -> ClientResult<()> {
        let t0 = Instant::now();
        let api = self.api_for(target).await?;
        let dp = DeleteParams {
            propagation_policy: Some(match propagation {
                Propagation::Background => PropagationPolicy::Background,
                Propagation::Foreground => PropagationPolicy::Foreground,
                Propagation::Orphan => PropagationPolicy::Orphan,
            }),
            ..DeleteParams::default()
        };
        let out = api.delete(&target.name, &dp).await.map(|_| ()).map_err(ClientError::from);
        observe("delete", t0, &out);
        out
    }

    async fn watch(&self, target: &ResourceRef, selector: &LabelSelector) -> ClientResult<BoxStream<'static, WatchEvent>> {
        let api = self.api_for(target).await?;
        let mut cfg = watcher::Config::default().fields(&format!("metadata.name={}", target.name));
        if !selector.is_empty() {
            cfg = cfg.labels(&selector.to_string());
        }
        let ar = ApiResource { group: target.group.clone(), version: target.version.clone(), api_version: target.api_version(), kind: target.kind.clone(), plural: String::new() };
        let desc = target.to_string();
        let stream = watcher::watcher(api, cfg)
            .map_err(|e| ClientError::Transport(e.to_string()))
            .filter_map(move |ev| {
                let ar = ar.clone();
                let desc = desc.clone();
                async move {
                    let conv = |o: DynamicObject| from_dynamic(o, Some(&ar)).ok();
                    match ev {
                        Ok(Event::Applied(o)) => conv(o).map(WatchEvent::Applied),
                        Ok(Event::Deleted(o)) => conv(o).map(WatchEvent::Deleted),
                        Ok(Event::Restarted(list)) => Some(WatchEvent::Restarted(list.into_iter().filter_map(conv).collect())),
                        Err(e) => {
                            warn!(target = %desc, error = %e, "kube: watch error");
                            None
                        }
                    }
                }
            });
        Ok(stream.boxed())
    }
}
