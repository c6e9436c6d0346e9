use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use kade_api::{DeployOptions, DeployRequest, ExitStatus, InProcApi, KadeApi};
use kade_apply::{Backoff, ExecOptions};
use kade_core::annotations as ann;
use kade_core::{ChangeOp, ErrorKind, RecordingUi, Resource};
use kade_diff::DiffFilter;
use kade_kubehub::{MemoryClient, Verb};

struct Harness {
    client: Arc<MemoryClient>,
    api: InProcApi,
    ui: Arc<RecordingUi>,
}

impl Harness {
    fn new() -> Self {
        let client = Arc::new(MemoryClient::new());
        let ui = Arc::new(RecordingUi::new());
        let api = InProcApi::new(client.clone(), "default", ui.clone());
        Self { client, api, ui }
    }

    fn request(&self, app: &str, resources: Vec<Resource>) -> DeployRequest { DeployRequest::new(app, resources).with_options(options()) }

    async fn deploy(&self, app: &str, resources: Vec<Resource>) -> kade_api::DeployOutcome {
        self.api.deploy(self.request(app, resources), &CancellationToken::new()).await.unwrap()
    }

    fn live(&self, kind: &str, ns: Option<&str>, name: &str) -> Option<Resource> {
        self.client.object(&Resource::build("v1", kind, ns, name).resource_ref())
    }

    fn created(&self) -> Vec<String> {
        self.client.writes().into_iter().filter(|(v, _)| *v == Verb::Create).map(|(_, k)| k.name).collect()
    }
}

fn options() -> DeployOptions {
    DeployOptions {
        exec: ExecOptions {
            poll_interval: Duration::from_millis(10),
            change_timeout: Duration::from_secs(5),
            backoff: Backoff { base: Duration::from_millis(1), max: Duration::from_millis(5), retries: 3 },
            ..ExecOptions::default()
        },
        ..DeployOptions::default()
    }
}

fn cm(name: &str, data: serde_json::Value) -> Resource {
    let mut r = Resource::build("v1", "ConfigMap", None, name);
    r.raw_mut()["data"] = data;
    r
}

fn service(name: &str) -> Resource {
    let mut r = Resource::build("v1", "Service", None, name);
    r.raw_mut()["spec"] = json!({"selector": {"app": name}, "ports": [{"port": 6379}]});
    r
}

fn pending(plan: &kade_api::Plan) -> Vec<(ChangeOp, String)> {
    plan.changes.iter().filter(|c| !c.ignored && c.op.mutates()).map(|c| (c.op, c.resource().name().to_string())).collect()
}

fn data_key(res: &Resource, key: &str) -> Option<String> { res.raw().pointer(&format!("/data/{key}")).and_then(|v| v.as_str()).map(str::to_string) }

#[tokio::test]
async fn create_update_delete() {
    let h = Harness::new();
    h.deploy("redis", vec![service("redis-primary"), cm("redis-config", json!({"key": "value1"}))]).await;
    assert!(h.live("Service", Some("default"), "redis-primary").is_some());

    let plan = h.api.plan(h.request("redis", vec![cm("redis-config", json!({"key": "value2"})), cm("redis-config2", json!({"key": "value1"}))])).await.unwrap();
    let mut ops = pending(&plan);
    ops.sort();
    assert_eq!(
        ops,
        vec![(ChangeOp::Create, "redis-config2".to_string()), (ChangeOp::Update, "redis-config".to_string()), (ChangeOp::Delete, "redis-primary".to_string())]
    );
    assert_eq!(plan.diff_status(), ExitStatus::PendingChanges);

    h.api.apply(plan, &CancellationToken::new()).await.unwrap();
    assert!(h.live("Service", Some("default"), "redis-primary").is_none());
    let config = h.live("ConfigMap", Some("default"), "redis-config").unwrap();
    assert_eq!(data_key(&config, "key").as_deref(), Some("value2"));
    assert!(h.live("ConfigMap", Some("default"), "redis-config2").is_some());
}

#[tokio::test]
async fn redeploying_the_same_inputs_changes_nothing() {
    let h = Harness::new();
    let resources = vec![service("redis-primary"), cm("redis-config", json!({"key": "value1"}))];
    h.deploy("redis", resources.clone()).await;
    h.client.clear_calls();

    let plan = h.api.plan(h.request("redis", resources)).await.unwrap();
    assert!(plan.changes.iter().all(|c| matches!(c.op, ChangeOp::Noop | ChangeOp::Exists)), "{}", plan.render());
    assert_eq!(plan.diff_status(), ExitStatus::NoChanges);
    assert!(h.client.writes().is_empty(), "planning never writes");

    h.api.apply(plan, &CancellationToken::new()).await.unwrap();
    assert!(!h.client.writes().iter().any(|(_, k)| k.name == "redis-primary" || k.name == "redis-config"));
    assert!(h.created().iter().all(|n| n.starts_with("redis-change-")), "only the change record is new");
}

#[tokio::test]
async fn versioned_resources_get_new_names_and_old_ones_stay() {
    let h = Harness::new();
    let versioned = |value: &str| {
        let mut r = cm("config", json!({"key1": value}));
        r.set_annotation(ann::VERSIONED, "");
        r
    };

    let plan = h.api.plan(h.request("web", vec![versioned("val1")])).await.unwrap();
    assert_eq!(pending(&plan), vec![(ChangeOp::Create, "config-ver-1".to_string())]);
    h.api.apply(plan, &CancellationToken::new()).await.unwrap();

    let plan = h.api.plan(h.request("web", vec![versioned("val2")])).await.unwrap();
    assert_eq!(pending(&plan), vec![(ChangeOp::Create, "config-ver-2".to_string())]);
    h.api.apply(plan, &CancellationToken::new()).await.unwrap();
    assert!(h.live("ConfigMap", Some("default"), "config-ver-1").is_some());
    assert!(h.live("ConfigMap", Some("default"), "config-ver-2").is_some());

    let plan = h.api.plan(h.request("web", vec![versioned("val2")])).await.unwrap();
    assert!(!plan.has_pending(), "{}", plan.render());
}

#[tokio::test]
async fn change_rules_order_the_deploy() {
    let h = Harness::new();
    let grouped = |name: &str, group: &str, rule: Option<&str>| {
        let mut r = cm(name, json!({"k": "v"}));
        r.set_annotation(ann::CHANGE_GROUP, group);
        if let Some(rule) = rule {
            r.set_annotation(ann::CHANGE_RULE, rule);
        }
        r
    };
    h.deploy(
        "app",
        vec![
            grouped("deployment", "a/deployment", Some("upsert after upserting a/migrations")),
            grouped("migrations", "a/migrations", Some("upsert after upserting a/import")),
            grouped("import", "a/import", None),
        ],
    )
    .await;

    let created = h.created();
    let at = |name: &str| created.iter().position(|n| n == name).unwrap();
    assert!(at("import") < at("migrations"));
    assert!(at("migrations") < at("deployment"));
}

#[tokio::test]
async fn immutable_field_changes_replace_the_object() {
    let h = Harness::new();
    h.deploy("svc", vec![service("redis")]).await;
    let uid = |h: &Harness| h.live("Service", Some("default"), "redis").and_then(|s| s.uid().map(str::to_string));
    let first = uid(&h).unwrap();

    let mut headless = service("redis");
    headless.raw_mut()["spec"]["clusterIP"] = json!("None");
    headless.set_annotation(ann::UPDATE_STRATEGY, "fallback-on-replace");
    h.deploy("svc", vec![headless]).await;
    let second = uid(&h).unwrap();
    assert_ne!(first, second);

    h.deploy("svc", vec![service("redis")]).await;
    assert_eq!(uid(&h).unwrap(), second);
}

#[tokio::test]
async fn exists_waits_for_external_namespace() {
    let h = Harness::new();
    let mut ns = Resource::build("v1", "Namespace", None, "external");
    ns.set_annotation(ann::EXISTS, "");
    let mut config = cm("inside", json!({"k": "v"}));
    config.set_namespace(Some("external"));

    let outside = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.client.insert(Resource::build("v1", "Namespace", None, "external"));
    };
    let cancel = CancellationToken::new();
    let (out, ()) = tokio::join!(h.api.deploy(h.request("ext", vec![ns, config]), &cancel), outside);
    out.unwrap();

    assert!(h.live("ConfigMap", Some("external"), "inside").is_some());
    assert!(!h.client.writes().iter().any(|(_, k)| k.kind == "Namespace"), "the namespace is never written");
}

#[tokio::test]
async fn live_edits_between_plan_and_apply() {
    let h = Harness::new();
    h.deploy("web", vec![cm("settings", json!({"key": "value1"}))]).await;
    let target = h.live("ConfigMap", Some("default"), "settings").unwrap().resource_ref();

    let plan = h.api.plan(h.request("web", vec![cm("settings", json!({"key": "value2"}))])).await.unwrap();
    h.client.mutate(&target, |r| r.raw_mut()["data"]["other"] = json!("theirs"));
    h.api.apply(plan, &CancellationToken::new()).await.unwrap();
    let live = h.client.object(&target).unwrap();
    assert_eq!(live.raw()["data"], json!({"key": "value2", "other": "theirs"}));

    let plan = h.api.plan(h.request("web", vec![cm("settings", json!({"key": "value3"}))])).await.unwrap();
    h.client.mutate(&target, |r| r.raw_mut()["data"]["key"] = json!("edited"));
    let err = h.api.apply(plan, &CancellationToken::new()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict, "{err}");
    assert_eq!(data_key(&h.client.object(&target).unwrap(), "key").as_deref(), Some("edited"));

    let history = h.api.history("web").await.unwrap();
    assert_eq!(history.iter().map(|c| c.meta.successful).collect::<Vec<_>>(), vec![Some(true), Some(true), Some(false)]);
}

#[tokio::test]
async fn empty_deploys_need_allow_empty() {
    let h = Harness::new();
    let err = h.api.plan(h.request("web", Vec::new())).await.unwrap_err();
    assert!(err.is_pre_mutation(), "{err}");
    assert!(h.api.apps().await.unwrap().is_empty());

    h.deploy("web", vec![cm("a", json!({})), cm("b", json!({}))]).await;
    assert_eq!(h.api.inspect("web").await.unwrap().len(), 2);

    let mut req = h.request("web", Vec::new());
    req.options.allow_empty = true;
    let out = h.api.deploy(req, &CancellationToken::new()).await.unwrap();
    assert_eq!(out.summary.count(ChangeOp::Delete), 2);
    assert!(h.api.inspect("web").await.unwrap().is_empty());
}

#[tokio::test]
async fn filtered_changes_are_left_alone() {
    let h = Harness::new();
    h.deploy("web", vec![cm("keep", json!({"k": "1"})), cm("gone", json!({}))]).await;

    let mut req = h.request("web", vec![cm("keep", json!({"k": "2"}))]);
    req.options.filter = DiffFilter::parse("ops: [update]").unwrap();
    let plan = h.api.plan(req).await.unwrap();
    assert_eq!(plan.summary.ignored, 1);
    h.api.apply(plan, &CancellationToken::new()).await.unwrap();
    assert!(h.live("ConfigMap", Some("default"), "gone").is_some());
    assert_eq!(data_key(&h.live("ConfigMap", Some("default"), "keep").unwrap(), "k").as_deref(), Some("2"));
}

#[tokio::test]
async fn deleting_an_app_removes_resources_and_records() {
    let h = Harness::new();
    h.deploy("web", vec![service("web"), cm("web-config", json!({}))]).await;
    h.deploy("web", vec![service("web"), cm("web-config", json!({"k": "v"}))]).await;
    assert_eq!(h.api.history("web").await.unwrap().len(), 2);

    h.api.delete("web", options(), &CancellationToken::new()).await.unwrap();
    assert!(h.live("Service", Some("default"), "web").is_none());
    assert!(h.live("ConfigMap", Some("default"), "web-config").is_none());
    assert!(h.live("ConfigMap", Some("default"), "web").is_none(), "app record");
    assert!(h.api.apps().await.unwrap().is_empty());
    assert_eq!(h.api.inspect("web").await.unwrap_err().kind(), ErrorKind::Validation);
    assert!(h.ui.lines().iter().any(|l| l.starts_with("web: ")));
}

#[tokio::test]
async fn unregistered_wait_overlays_fail_before_any_write() {
    let h = Harness::new();
    let mut req = h.request("web", vec![cm("settings", json!({"k": "v"}))]);
    req.options.config = kade_core::Config::from_yaml(
        "waitRules:\n- overlay: cm-ready\n  resourceMatchers:\n  - apiVersionKindMatcher: {apiVersion: v1, kind: ConfigMap}\n",
    )
    .unwrap();
    let err = h.api.deploy(req, &CancellationToken::new()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config, "{err}");
    assert!(h.client.writes().is_empty());
    assert!(h.api.apps().await.unwrap().is_empty());
}
