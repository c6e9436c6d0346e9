use super::*;
use chrono::TimeZone;
use serde_json::json;

fn config_map(name: &str, value: &str) -> Resource {
    let mut r = Resource::build("v1", "ConfigMap", Some("default"), name);
    r.set_annotation(ann::VERSIONED, "");
    r.raw_mut()["data"] = json!({"key1": value});
    r
}

fn deployment(config: &str) -> Resource {
    let mut d = Resource::build("apps/v1", "Deployment", Some("default"), "app");
    d.raw_mut()["spec"] = json!({"template": {"spec": {
        "containers": [{"name": "c", "envFrom": [{"configMapRef": {"name": config}}]}],
        "volumes": [{"name": "v", "configMap": {"name": config}}, {"name": "other", "configMap": {"name": "unrelated"}}]
    }}});
    d
}

fn cfg() -> Config { default_config().unwrap() }

fn opts() -> TemplateOptions { TemplateOptions { latest: false, prior_successful: true, now: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() } }

/// What the cluster would hold after deploying `out`.
fn as_existing(out: &TemplateOutcome) -> Vec<Resource> { out.resources.clone() }

#[test]
fn first_deploy_allocates_ver_1_and_rewrites_refs() {
    let out = template(vec![config_map("config", "val1"), deployment("config")], &[], &cfg(), &opts()).unwrap();
    let names: Vec<&str> = out.resources.iter().map(|r| r.name()).collect();
    assert_eq!(names, vec!["config-ver-1", "app"]);
    let d = &out.resources[1];
    assert_eq!(d.raw().pointer("/spec/template/spec/containers/0/envFrom/0/configMapRef/name"), Some(&json!("config-ver-1")));
    assert_eq!(d.raw().pointer("/spec/template/spec/volumes/0/configMap/name"), Some(&json!("config-ver-1")));
    assert_eq!(d.raw().pointer("/spec/template/spec/volumes/1/configMap/name"), Some(&json!("unrelated")));
    assert_eq!(out.references.len(), 1);
    assert_eq!(out.references[0].referenced.name, "config-ver-1");
    assert_eq!(out.references[0].user.name, "app");
}

#[test]
fn unchanged_content_reuses_version_and_changed_content_advances() {
    let first = template(vec![config_map("config", "val1")], &[], &cfg(), &opts()).unwrap();
    let live = as_existing(&first);

    let again = template(vec![config_map("config", "val1")], &live, &cfg(), &opts()).unwrap();
    assert_eq!(again.resources[0].name(), "config-ver-1");
    assert!(again.retained.is_empty());

    let changed = template(vec![config_map("config", "val2")], &live, &cfg(), &opts()).unwrap();
    assert_eq!(changed.resources[0].name(), "config-ver-2");
    assert!(changed.retained.contains(&live[0].key()), "previous version is retained");
}

#[test]
fn failed_prior_deploy_advances_unless_latest() {
    let live = as_existing(&template(vec![config_map("config", "val1")], &[], &cfg(), &opts()).unwrap());
    let failed = TemplateOptions { prior_successful: false, ..opts() };
    let out = template(vec![config_map("config", "val1")], &live, &cfg(), &failed).unwrap();
    assert_eq!(out.resources[0].name(), "config-ver-2");

    let latest = TemplateOptions { latest: true, ..failed };
    let out = template(vec![config_map("config", "val1")], &live, &cfg(), &latest).unwrap();
    assert_eq!(out.resources[0].name(), "config-ver-1");
}

#[test]
fn retention_is_bounded_by_num_versions() {
    let mut live = Vec::new();
    for n in 1..=4 {
        let mut r = config_map(&versioned_name("config", n), &format!("v{n}"));
        r.set_annotation(ann::VERSIONED_FINGERPRINT, &format!("fp{n}"));
        live.push(r);
    }
    let mut new = config_map("config", "v5");
    new.set_annotation(ann::NUM_VERSIONS, "3");
    let out = template(vec![new], &live, &cfg(), &opts()).unwrap();
    assert_eq!(out.resources[0].name(), "config-ver-5");
    let kept: Vec<String> = out.retained.iter().map(|k| k.name.clone()).collect();
    assert_eq!(kept, vec!["config-ver-3", "config-ver-4"]);
}

#[test]
fn keep_original_emits_both_names() {
    let mut r = Resource::build("v1", "Secret", Some("default"), "creds");
    r.set_annotation(ann::VERSIONED_KEEP_ORIGINAL, "");
    let out = template(vec![r], &[], &cfg(), &opts()).unwrap();
    let names: Vec<&str> = out.resources.iter().map(|r| r.name()).collect();
    assert_eq!(names, vec!["creds", "creds-ver-1"]);
}

#[test]
fn explicit_refs_are_rewritten_and_validated() {
    let mut user = Resource::build("v1", "ConfigMap", Some("default"), "user");
    user.set_annotation(&format!("{}.cfg", ann::VERSIONED_EXPLICIT_REF), "{apiVersion: v1, kind: ConfigMap, name: config}");
    let out = template(vec![config_map("config", "a"), user.clone()], &[], &cfg(), &opts()).unwrap();
    let rewritten = out.resources[1].annotation(&format!("{}.cfg", ann::VERSIONED_EXPLICIT_REF)).unwrap();
    let parsed: ExplicitRef = serde_json::from_str(rewritten).unwrap();
    assert_eq!(parsed.name, "config-ver-1");
    assert_eq!(out.references.len(), 1);

    let mut dangling = user;
    dangling.set_annotation(ann::VERSIONED_EXPLICIT_REF, "{apiVersion: v1, kind: ConfigMap, name: missing}");
    assert!(template(vec![config_map("config", "a"), dangling], &[], &cfg(), &opts()).is_err());
}

#[test]
fn nomatch_explicit_refs_are_optional() {
    let nomatch = format!("{}.cfg.nomatch", ann::VERSIONED_EXPLICIT_REF);
    let mut user = Resource::build("v1", "ConfigMap", Some("default"), "user");
    user.set_annotation(&nomatch, "{apiVersion: v1, kind: ConfigMap, name: missing}");
    let out = template(vec![config_map("config", "a"), user.clone()], &[], &cfg(), &opts()).unwrap();
    assert!(out.references.is_empty());
    assert_eq!(out.resources[1].annotation(&nomatch), Some("{apiVersion: v1, kind: ConfigMap, name: missing}"));

    // an optional ref that does resolve is still rewritten
    user.set_annotation(&nomatch, "{apiVersion: v1, kind: ConfigMap, name: config}");
    let out = template(vec![config_map("config", "a"), user.clone()], &[], &cfg(), &opts()).unwrap();
    let parsed: ExplicitRef = serde_json::from_str(out.resources[1].annotation(&nomatch).unwrap()).unwrap();
    assert_eq!(parsed.name, "config-ver-1");

    let mut required = user;
    required.set_annotation(&format!("{}.cfg.match", ann::VERSIONED_EXPLICIT_REF), "{apiVersion: v1, kind: ConfigMap, name: missing}");
    let err = template(vec![config_map("config", "a"), required], &[], &cfg(), &opts()).unwrap_err();
    assert_eq!(err.kind(), kade_core::ErrorKind::Validation, "{err}");
}

#[test]
fn versioned_user_of_versioned_object_follows_its_version() {
    let mut d = deployment("config");
    d.set_annotation(ann::VERSIONED, "");
    let first = template(vec![d.clone(), config_map("config", "a")], &[], &cfg(), &opts()).unwrap();
    let live = as_existing(&first);
    assert!(live.iter().any(|r| r.name() == "app-ver-1"));

    // only the config map changes; the deployment's rewritten content changes with it
    let second = template(vec![d, config_map("config", "b")], &live, &cfg(), &opts()).unwrap();
    let names: BTreeSet<&str> = second.resources.iter().map(|r| r.name()).collect();
    assert!(names.contains("config-ver-2") && names.contains("app-ver-2"), "{names:?}");
}

#[test]
fn renew_duration_forces_new_version_when_expired() {
    let mut r = config_map("config", "a");
    r.set_annotation(ann::RENEW_DURATION, "1h");
    let first = template(vec![r.clone()], &[], &cfg(), &opts()).unwrap();
    let live = as_existing(&first);
    assert_eq!(live[0].annotation(ann::LAST_RENEWED_TIME), Some("2024-01-01T00:00:00Z"));

    let soon = TemplateOptions { now: opts().now + chrono::Duration::minutes(30), ..opts() };
    assert_eq!(template(vec![r.clone()], &live, &cfg(), &soon).unwrap().resources[0].name(), "config-ver-1");

    let later = TemplateOptions { now: opts().now + chrono::Duration::hours(2), ..opts() };
    assert_eq!(template(vec![r], &live, &cfg(), &later).unwrap().resources[0].name(), "config-ver-2");
}

#[test]
fn version_names_parse() {
    assert_eq!(parse_version("cfg-ver-12", "cfg"), Some(12));
    assert_eq!(parse_version("cfg-ver-", "cfg"), None);
    assert_eq!(parse_version("cfg-other-ver-1", "cfg"), None);
}
