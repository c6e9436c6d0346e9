//! Resource matchers used by every rule in the config document.

use serde::{Deserialize, Serialize};

use crate::path::Path;
use crate::resource::{split_api_version, Resource};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResourceMatcher {
    AllMatcher {},
    #[serde(rename_all = "camelCase")]
    ApiVersionKindMatcher { api_version: String, kind: String },
    KindNamespaceNameMatcher {
        kind: String,
        #[serde(default)]
        namespace: String,
        name: String,
    },
    HasAnnotationMatcher { keys: Vec<String> },
    HasNamespaceMatcher {
        /// Empty means "any namespaced resource".
        #[serde(default)]
        names: Vec<String>,
    },
    HasFieldMatcher { path: Path },
    NotMatcher { matcher: Box<ResourceMatcher> },
    AndMatcher { matchers: Vec<ResourceMatcher> },
    OrMatcher { matchers: Vec<ResourceMatcher> },
}

impl ResourceMatcher {
    pub fn api_version_kind(api_version: &str, kind: &str) -> Self {
        Self::ApiVersionKindMatcher { api_version: api_version.into(), kind: kind.into() }
    }

    pub fn matches(&self, res: &Resource) -> bool {
        match self {
            Self::AllMatcher {} => true,
            Self::ApiVersionKindMatcher { api_version, kind } => {
                // version is tolerated within a kind
                let (group, _) = split_api_version(api_version);
                res.kind() == kind && res.group() == group
            }
            Self::KindNamespaceNameMatcher { kind, namespace, name } => {
                res.kind() == kind && res.namespace().unwrap_or_default() == namespace && res.name() == name
            }
            Self::HasAnnotationMatcher { keys } => keys.iter().all(|k| res.has_annotation(k)),
            Self::HasNamespaceMatcher { names } => match res.namespace() {
                Some(ns) if !ns.is_empty() => names.is_empty() || names.iter().any(|n| n == ns),
                _ => false,
            },
            Self::HasFieldMatcher { path } => path.expand(res.raw()).map(|locs| !locs.is_empty()).unwrap_or(false),
            Self::NotMatcher { matcher } => !matcher.matches(res),
            Self::AndMatcher { matchers } => matchers.iter().all(|m| m.matches(res)),
            Self::OrMatcher { matchers } => matchers.iter().any(|m| m.matches(res)),
        }
    }
}

/// An empty matcher list selects every resource.
pub fn any_matches(matchers: &[ResourceMatcher], res: &Resource) -> bool {
    matchers.is_empty() || matchers.iter().any(|m| m.matches(res))
}
