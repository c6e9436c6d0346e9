//! Finding and rewriting references to versioned objects.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use kade_core::annotations::{matching_keys, VERSIONED_EXPLICIT_REF};
use kade_core::config::TemplateRule;
use kade_core::path::{get_at, get_at_mut, Step};
use kade_core::resource::split_api_version;
use kade_core::{any_matches, KadeError, KadeResult, ObjectKey, Resource};

/// A versioned object others may refer to, by its original name.
pub(crate) struct Target<'a> {
    pub key: ObjectKey,
    pub resource: &'a Resource,
    pub rules: Vec<&'a TemplateRule>,
}

impl<'a> Target<'a> {
    pub fn new(resource: &'a Resource, all_rules: &'a [TemplateRule]) -> Self {
        let rules = all_rules.iter().filter(|r| any_matches(&r.resource_matchers, resource)).collect();
        Self { key: resource.key(), resource, rules }
    }

    fn visible_from(&self, user: &Resource) -> bool {
        match self.resource.namespace() {
            Some(ns) => user.namespace() == Some(ns),
            None => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExplicitRef {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Trailing qualifier of an explicit reference key. `.nomatch` makes the
/// reference optional; a bare key, `.match` or any other suffix requires the
/// target to be a versioned resource of the same deploy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RefQualifier {
    Match,
    NoMatch,
}

impl RefQualifier {
    pub fn of(key: &str) -> Self {
        match key.rsplit_once('.') {
            Some((base, "nomatch")) if base.starts_with(VERSIONED_EXPLICIT_REF) => Self::NoMatch,
            _ => Self::Match,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Site {
    Field { location: Vec<Step>, name_key: String },
    Annotation { key: String, value: ExplicitRef },
}

#[derive(Debug, Clone)]
pub(crate) struct RefSite {
    pub target: ObjectKey,
    pub site: Site,
}

/// Every place in `user` that names one of `targets`.
pub(crate) fn find_references(user: &Resource, targets: &[Target<'_>]) -> KadeResult<Vec<RefSite>> {
    let user_key = user.key();
    let mut out = Vec::new();
    for t in targets.iter().filter(|t| t.key != user_key && t.visible_from(user)) {
        let target_name = t.resource.name();
        for rule in &t.rules {
            for obj_ref in rule.affected_resources.object_references.iter().filter(|r| any_matches(&r.resource_matchers, user)) {
                for location in obj_ref.path.expand(user.raw())? {
                    let named = get_at(user.raw(), &location).and_then(|node| node.get(&obj_ref.name_key)).and_then(Json::as_str);
                    if named == Some(target_name) {
                        out.push(RefSite { target: t.key.clone(), site: Site::Field { location, name_key: obj_ref.name_key.clone() } });
                    }
                }
            }
        }
    }

    let annotations = user.annotations();
    for (key, raw) in matching_keys(&annotations, VERSIONED_EXPLICIT_REF) {
        let value: ExplicitRef = serde_yaml::from_str(raw)
            .map_err(|e| KadeError::validation(format!("{}: annotation {key}: expected {{apiVersion, kind, name, namespace?}}: {e}", user.description())))?;
        let ns = value.namespace.clone().or_else(|| user.namespace().map(str::to_string));
        let (group, _) = split_api_version(&value.api_version);
        let wanted = ObjectKey::new(group, &value.kind, ns.as_deref(), &value.name);
        // cluster-scoped targets carry no namespace
        let wanted_cluster = ObjectKey::new(group, &value.kind, None, &value.name);
        let Some(target) = targets.iter().find(|t| t.key == wanted || t.key == wanted_cluster) else {
            if RefQualifier::of(key) == RefQualifier::NoMatch {
                continue;
            }
            return Err(KadeError::validation(format!(
                "{}: annotation {key} references {wanted}, which is not a versioned resource in this deploy",
                user.description()
            )));
        };
        out.push(RefSite { target: target.key.clone(), site: Site::Annotation { key: key.clone(), value } });
    }
    Ok(out)
}

pub(crate) fn rewrite(user: &mut Resource, site: &Site, new_name: &str) -> KadeResult<()> {
    match site {
        Site::Field { location, name_key } => {
            if let Some(map) = get_at_mut(user.raw_mut(), location).and_then(Json::as_object_mut) {
                map.insert(name_key.clone(), Json::String(new_name.to_string()));
            }
        }
        Site::Annotation { key, value } => {
            let mut value = value.clone();
            value.name = new_name.to_string();
            let rendered = serde_json::to_string(&value)?;
            user.set_annotation(key, &rendered);
        }
    }
    Ok(())
}
