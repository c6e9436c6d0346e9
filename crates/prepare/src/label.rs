//! Engine labels: app ownership label, per-resource association label,
//! label scoping of selectors and ownership labels on pod templates.

use std::collections::BTreeMap;

use serde_json::Value as Json;

use kade_core::annotations::{APP_LABEL, ASSOCIATION_LABEL};
use kade_core::config::PathRule;
use kade_core::path::{get_at_mut, set_at};
use kade_core::{any_matches, Config, KadeError, KadeResult, Resource};

/// The `key=value` pair identifying an app's resources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppLabel {
    pub key: String,
    pub value: String,
}

impl AppLabel {
    pub fn new(value: impl Into<String>) -> Self { Self { key: APP_LABEL.to_string(), value: value.into() } }
}

/// Stable per-identity value; independent of version and of any
/// versioned-name suffix applied later.
pub fn association_value(res: &Resource) -> String {
    let id = format!("{}/{}/{}/{}", res.group(), res.kind(), res.namespace().unwrap_or_default(), res.name());
    let hash = blake3::hash(id.as_bytes()).to_hex();
    format!("v1.{}", &hash.as_str()[..32])
}

/// Inject engine labels into metadata, ownership paths and selectors.
pub fn label(resources: &mut [Resource], app: &AppLabel, config: &Config) -> KadeResult<()> {
    for res in resources.iter_mut() {
        let assoc = association_value(res);
        let mut owned: BTreeMap<String, String> = config.additional_labels.clone();
        owned.insert(app.key.clone(), app.value.clone());
        owned.insert(ASSOCIATION_LABEL.to_string(), assoc);

        for (k, v) in &owned {
            res.set_label(k, v);
        }

        let ownership: Vec<&PathRule> = config.ownership_label_rules.iter().filter(|r| any_matches(&r.resource_matchers, res)).collect();
        for rule in ownership {
            let desc = res.description();
            for loc in rule.path.expand_for_write(res.raw())? {
                match get_at_mut(res.raw_mut(), &loc) {
                    Some(target) => insert_labels(target, &owned, &desc, &rule.path)?,
                    None => {
                        let map: serde_json::Map<String, Json> = owned.iter().map(|(k, v)| (k.clone(), Json::String(v.clone()))).collect();
                        set_at(res.raw_mut(), &loc, Json::Object(map));
                    }
                }
            }
        }

        let app_only: BTreeMap<String, String> = [(app.key.clone(), app.value.clone())].into_iter().collect();
        let scoping: Vec<&PathRule> = config.label_scoping_rules.iter().filter(|r| any_matches(&r.resource_matchers, res)).collect();
        for rule in scoping {
            let desc = res.description();
            for loc in rule.path.expand(res.raw())? {
                if let Some(target) = get_at_mut(res.raw_mut(), &loc) {
                    insert_labels(target, &app_only, &desc, &rule.path)?;
                }
            }
        }
    }
    Ok(())
}

fn insert_labels(target: &mut Json, labels: &BTreeMap<String, String>, desc: &str, path: &kade_core::Path) -> KadeResult<()> {
    if target.is_null() {
        *target = Json::Object(Default::default());
    }
    let map = target
        .as_object_mut()
        .ok_or_else(|| KadeError::validation(format!("{desc}: expected a label map at {path}, found a non-mapping value")))?;
    for (k, v) in labels {
        map.insert(k.clone(), Json::String(v.clone()));
    }
    Ok(())
}
