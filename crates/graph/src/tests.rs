use super::*;
use kade_core::annotations as ann;
use kade_core::{ChangeOp, OpStrategy, Resource};
use kade_diff::RenderedDiff;
use serde_json::json;

fn change(op: ChangeOp, res: Resource) -> Change {
    let (existing, new) = if op == ChangeOp::Delete { (Some(res), None) } else { (None, Some(res)) };
    Change { op, strategy: OpStrategy::Default, existing, new, applied: None, diff: RenderedDiff::default(), ignored: false }
}

fn cm(name: &str, group: &str, rule: Option<&str>) -> Resource {
    let mut r = Resource::build("v1", "ConfigMap", Some("default"), name);
    r.set_annotation(ann::CHANGE_GROUP, group);
    if let Some(rule) = rule {
        r.set_annotation(ann::CHANGE_RULE, rule);
    }
    r
}

fn defaults() -> Config { default_config().unwrap() }

fn wave_names(g: &ChangeGraph) -> Vec<Vec<String>> {
    g.waves().into_iter().map(|w| w.into_iter().map(|i| g.node(i).change.resource().name().to_string()).collect()).collect()
}

#[test]
fn change_rules_order_groups_into_waves() {
    let changes = vec![
        change(ChangeOp::Create, cm("deployment", "a/deployment", Some("upsert after upserting a/migrations"))),
        change(ChangeOp::Create, cm("migrations", "a/migrations", Some("upsert after upserting a/import"))),
        change(ChangeOp::Create, cm("import", "a/import", None)),
    ];
    let g = build(changes, &[], &defaults()).unwrap();
    assert_eq!(wave_names(&g), vec![vec!["import"], vec!["migrations"], vec!["deployment"]]);
}

#[test]
fn rules_only_bind_matching_operations() {
    let changes = vec![
        change(ChangeOp::Create, cm("user", "g/user", Some("upsert after deleting g/old"))),
        change(ChangeOp::Create, cm("old", "g/old", None)),
    ];
    let g = build(changes, &[], &defaults()).unwrap();
    assert_eq!(g.waves().len(), 1, "old is upserted, not deleted");
}

#[test]
fn explicit_cycles_are_fatal_and_name_all_members() {
    let changes = vec![
        change(ChangeOp::Create, cm("a", "g/a", Some("upsert after upserting g/c"))),
        change(ChangeOp::Create, cm("b", "g/b", Some("upsert after upserting g/a"))),
        change(ChangeOp::Create, cm("c", "g/c", Some("upsert after upserting g/b"))),
    ];
    let err = build(changes, &[], &defaults()).err().unwrap();
    assert!(err.is_pre_mutation());
    let msg = err.to_string();
    for name in ["configmap/a", "configmap/b", "configmap/c"] {
        assert!(msg.contains(name), "{msg}");
    }
}

#[test]
fn namespaces_and_crds_come_first() {
    let ns = Resource::build("v1", "Namespace", None, "web");
    let mut crd = Resource::build("apiextensions.k8s.io/v1", "CustomResourceDefinition", None, "widgets.example.com");
    crd.raw_mut()["spec"] = json!({"group": "example.com", "names": {"kind": "Widget", "plural": "widgets"}, "scope": "Namespaced"});
    let widget = Resource::build("example.com/v1", "Widget", Some("web"), "w1");
    let cfg = Resource::build("v1", "ConfigMap", Some("web"), "cfg");
    let changes = vec![
        change(ChangeOp::Create, widget),
        change(ChangeOp::Create, cfg),
        change(ChangeOp::Create, crd),
        change(ChangeOp::Exists, ns),
    ];
    let g = build(changes, &[], &defaults()).unwrap();
    let waves = wave_names(&g);
    assert_eq!(waves[0].len(), 2, "{waves:?}");
    assert!(waves[0].contains(&"web".to_string()) && waves[0].contains(&"widgets.example.com".to_string()));
    assert_eq!(waves[1].len(), 2);
}

#[test]
fn namespaced_deletes_precede_namespace_delete() {
    let ns = Resource::build("v1", "Namespace", None, "web");
    let cfg = Resource::build("v1", "ConfigMap", Some("web"), "cfg");
    let g = build(vec![change(ChangeOp::Delete, ns), change(ChangeOp::Delete, cfg)], &[], &defaults()).unwrap();
    assert_eq!(wave_names(&g), vec![vec!["cfg"], vec!["web"]]);
}

#[test]
fn ignorable_edges_yield_to_explicit_ones() {
    // explicit rule puts the namespace after its configmap; the default
    // binding would close a cycle and is dropped
    let mut ns = Resource::build("v1", "Namespace", None, "web");
    ns.set_annotation(ann::CHANGE_RULE, "upsert after upserting late/cfg");
    let mut cfg = Resource::build("v1", "ConfigMap", Some("web"), "cfg");
    cfg.set_annotation(ann::CHANGE_GROUP, "late/cfg");
    let g = build(vec![change(ChangeOp::Create, ns), change(ChangeOp::Create, cfg)], &[], &defaults()).unwrap();
    assert_eq!(wave_names(&g), vec![vec!["cfg"], vec!["web"]]);
}

#[test]
fn versioned_references_add_structural_edges() {
    let config = Resource::build("v1", "ConfigMap", Some("default"), "config-ver-1");
    let app = Resource::build("apps/v1", "Deployment", Some("default"), "app");
    let refs = vec![Reference { user: app.key(), referenced: config.key() }];
    let g = build(vec![change(ChangeOp::Update, app), change(ChangeOp::Create, config)], &refs, &defaults()).unwrap();
    assert_eq!(wave_names(&g), vec![vec!["config-ver-1"], vec!["app"]]);
    assert!(g.render().contains("  after (create) configmap/config-ver-1 (v1) namespace: default"), "{}", g.render());
}

#[test]
fn ignored_changes_are_left_out() {
    let mut c = change(ChangeOp::Create, cm("x", "g/x", None));
    c.ignored = true;
    assert!(build(vec![c], &[], &defaults()).unwrap().is_empty());
}
