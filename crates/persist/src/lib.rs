//! kade persistence: app records and change history.
//!
//! An app is a ConfigMap labelled `kade.dev/is-app` whose `data.spec` holds
//! the JSON-encoded [`AppSpec`]. Every deploy attempt writes a sibling
//! ConfigMap labelled `kade.dev/is-change` carrying a [`ChangeMeta`]. The
//! history is bounded and collected oldest-first.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, SecondsFormat, Utc};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{debug, info};

use kade_core::{KadeError, KadeResult, Resource, ResourceRef};
use kade_kubehub::{LabelSelector, Propagation, ResourceClient};

pub const IS_APP_LABEL: &str = "kade.dev/is-app";
pub const IS_CHANGE_LABEL: &str = "kade.dev/is-change";
pub const CHANGE_APP_LABEL: &str = "kade.dev/change-app";
pub const DEFAULT_CHANGE_HISTORY: usize = 200;

const SPEC_KEY: &str = "spec";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeMeta {
    pub started_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub successful: Option<bool>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub namespaces: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff_changes: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSpec {
    pub label_key: String,
    pub label_value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_change_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_change: Option<ChangeMeta>,
}

impl AppSpec {
    /// Fresh spec whose label value is a nanosecond timestamp.
    pub fn generate(label_key: &str, now: DateTime<Utc>) -> Self {
        let nanos = now.timestamp_nanos_opt().unwrap_or_else(|| now.timestamp_micros() * 1000);
        Self { label_key: label_key.to_string(), label_value: nanos.to_string(), ..Self::default() }
    }
}

fn timestamp(t: DateTime<Utc>) -> String { t.to_rfc3339_opts(SecondsFormat::Nanos, true) }

fn encode<T: Serialize>(value: &T) -> KadeResult<String> { Ok(serde_json::to_string(value)?) }

fn decode<T: for<'de> Deserialize<'de>>(obj: &Resource) -> KadeResult<T> {
    let raw = obj
        .raw()
        .pointer("/data/spec")
        .and_then(Json::as_str)
        .ok_or_else(|| KadeError::validation(format!("{}: missing data.spec", obj.description())))?;
    serde_json::from_str(raw).map_err(|e| KadeError::validation(format!("{}: data.spec: {e}", obj.description())))
}

fn config_map(namespace: &str, name: &str, labels: &BTreeMap<String, String>, spec: String) -> Resource {
    let mut res = Resource::build("v1", "ConfigMap", Some(namespace), name);
    for (k, v) in labels {
        res.set_label(k, v);
    }
    res.raw_mut()["data"] = serde_json::json!({ SPEC_KEY: spec });
    res
}

/// An app as stored on the cluster.
#[derive(Debug, Clone)]
pub struct App {
    pub name: String,
    pub spec: AppSpec,
    object: Resource,
}

impl App {
    pub fn selector(&self) -> LabelSelector { LabelSelector::new().with(&self.spec.label_key, &self.spec.label_value) }

    /// Whether the previous deploy finished successfully (`None` before the first).
    pub fn last_change_successful(&self) -> Option<bool> { self.spec.last_change.as_ref().and_then(|c| c.successful) }
}

#[derive(Debug, Clone)]
pub struct ChangeRecord {
    pub name: String,
    pub app: String,
    pub meta: ChangeMeta,
}

impl ChangeRecord {
    fn from_object(obj: &Resource) -> KadeResult<Self> {
        Ok(Self { name: obj.name().to_string(), app: obj.label(CHANGE_APP_LABEL).unwrap_or_default().to_string(), meta: decode(obj)? })
    }
}

pub struct AppStore {
    client: Arc<dyn ResourceClient>,
    namespace: String,
}

impl AppStore {
    pub fn new(client: Arc<dyn ResourceClient>, namespace: impl Into<String>) -> Self { Self { client, namespace: namespace.into() } }

    pub fn namespace(&self) -> &str { &self.namespace }

    fn target(&self, name: &str) -> ResourceRef { Resource::build("v1", "ConfigMap", Some(&self.namespace), name).resource_ref() }

    pub async fn get(&self, name: &str) -> KadeResult<Option<App>> {
        let Some(object) = self.client.get(&self.target(name)).await? else { return Ok(None) };
        if object.label(IS_APP_LABEL).is_none() {
            return Err(KadeError::validation(format!("{} exists but is not a kade app", object.description())));
        }
        Ok(Some(App { name: name.to_string(), spec: decode(&object)?, object }))
    }

    /// Existing record, or one created from `spec`. A planned deploy picks its
    /// label value before the record exists; this keeps that value.
    pub async fn ensure(&self, name: &str, extra_labels: &BTreeMap<String, String>, spec: AppSpec) -> KadeResult<App> {
        if let Some(app) = self.get(name).await? {
            return Ok(app);
        }
        let mut labels = extra_labels.clone();
        labels.insert(IS_APP_LABEL.to_string(), String::new());
        let object = self.client.create(&config_map(&self.namespace, name, &labels, encode(&spec)?)).await?;
        info!(app = name, namespace = %self.namespace, label_value = %spec.label_value, "persist: app created");
        Ok(App { name: name.to_string(), spec, object })
    }

    async fn save(&self, app: &mut App) -> KadeResult<()> {
        let mut object = app.object.clone();
        object.raw_mut()["data"][SPEC_KEY] = Json::String(encode(&app.spec)?);
        app.object = self.client.update(&object).await?;
        Ok(())
    }

    /// Open a change record and point the app at it.
    pub async fn begin_change(&self, app: &mut App, description: &str, namespaces: Vec<String>, now: DateTime<Utc>) -> KadeResult<ChangeRecord> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let name = format!("{}-change-{}", app.name, &id[..8]);
        let meta = ChangeMeta { started_at: timestamp(now), description: description.to_string(), namespaces, ..ChangeMeta::default() };
        let labels: BTreeMap<String, String> =
            [(IS_CHANGE_LABEL.to_string(), String::new()), (CHANGE_APP_LABEL.to_string(), app.name.clone())].into_iter().collect();
        self.client.create(&config_map(&self.namespace, &name, &labels, encode(&meta)?)).await?;
        app.spec.last_change_name = Some(name.clone());
        app.spec.last_change = Some(meta.clone());
        self.save(app).await?;
        debug!(app = %app.name, change = %name, "persist: change opened");
        Ok(ChangeRecord { name, app: app.name.clone(), meta })
    }

    /// Close the record with its outcome.
    pub async fn finish_change(&self, app: &mut App, change: &mut ChangeRecord, successful: bool, diff_changes: Option<String>, now: DateTime<Utc>) -> KadeResult<()> {
        change.meta.finished_at = Some(timestamp(now));
        change.meta.successful = Some(successful);
        change.meta.diff_changes = diff_changes;
        let target = self.target(&change.name);
        let mut object = self
            .client
            .get(&target)
            .await?
            .ok_or_else(|| KadeError::Apply(format!("change record {} disappeared", change.name)))?;
        object.raw_mut()["data"][SPEC_KEY] = Json::String(encode(&change.meta)?);
        self.client.update(&object).await?;
        if app.spec.last_change_name.as_deref() == Some(change.name.as_str()) {
            app.spec.last_change = Some(change.meta.clone());
            self.save(app).await?;
        }
        counter!("persist_changes_finished_total", 1u64, "successful" => if successful { "true" } else { "false" });
        Ok(())
    }

    /// Change records of `app`, oldest first.
    pub async fn changes(&self, app: &str) -> KadeResult<Vec<ChangeRecord>> {
        let selector = LabelSelector::new().with(IS_CHANGE_LABEL, "").with(CHANGE_APP_LABEL, app);
        let mut out = Vec::new();
        for obj in self.client.list(&selector).await? {
            if obj.namespace() == Some(self.namespace.as_str()) && obj.is_kind("", "ConfigMap") {
                out.push(ChangeRecord::from_object(&obj)?);
            }
        }
        out.sort_by(|a, b| (&a.meta.started_at, &a.name).cmp(&(&b.meta.started_at, &b.name)));
        Ok(out)
    }

    /// Delete the oldest records beyond `keep`; returns how many went.
    pub async fn gc_changes(&self, app: &str, keep: usize) -> KadeResult<usize> {
        let t0 = Instant::now();
        let changes = self.changes(app).await?;
        let excess = changes.len().saturating_sub(keep);
        for c in changes.iter().take(excess) {
            match self.client.delete(&self.target(&c.name), Propagation::Background).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }
        counter!("persist_changes_gc_total", excess as u64);
        histogram!("persist_gc_ms", t0.elapsed().as_secs_f64() * 1000.0);
        if excess > 0 {
            info!(app, deleted = excess, kept = keep, "persist: change history trimmed");
        }
        Ok(excess)
    }

    /// Remove the app record and its whole history.
    pub async fn delete(&self, app: &str) -> KadeResult<()> {
        self.gc_changes(app, 0).await?;
        match self.client.delete(&self.target(app), Propagation::Background).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn list(&self) -> KadeResult<Vec<App>> {
        let mut out = Vec::new();
        for obj in self.client.list(&LabelSelector::new().with(IS_APP_LABEL, "")).await? {
            if obj.namespace() == Some(self.namespace.as_str()) {
                out.push(App { name: obj.name().to_string(), spec: decode(&obj)?, object: obj });
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }
}
