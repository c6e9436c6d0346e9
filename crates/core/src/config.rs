//! Config document: rebase, template, wait, labeling, masking and
//! dependency-binding rules.
//!
//! Each engine ships a default fragment; the API merges those with user
//! input via [`Config::merge`] (lists append, labels merge with later wins).

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{KadeError, KadeResult};
use crate::matcher::ResourceMatcher;
use crate::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub rebase_rules: Vec<RebaseRule>,
    pub template_rules: Vec<TemplateRule>,
    pub wait_rules: Vec<WaitRule>,
    pub label_scoping_rules: Vec<PathRule>,
    pub ownership_label_rules: Vec<PathRule>,
    pub additional_labels: BTreeMap<String, String>,
    pub diff_mask_rules: Vec<PathRule>,
    pub change_group_bindings: Vec<ChangeGroupBinding>,
    pub change_rule_bindings: Vec<ChangeRuleBinding>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RebaseRuleType {
    Copy,
    Remove,
    #[serde(alias = "ytt")]
    Overlay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RebaseSource {
    New,
    Existing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RebaseRule {
    #[serde(rename = "type")]
    pub rule_type: RebaseRuleType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<RebaseSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Path>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub paths: Vec<Path>,
    #[serde(default)]
    pub resource_matchers: Vec<ResourceMatcher>,
    /// Overlay program handed to the registered overlay evaluator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overlay: Option<String>,
}

impl RebaseRule {
    pub fn all_paths(&self) -> impl Iterator<Item = &Path> { self.path.iter().chain(self.paths.iter()) }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateRule {
    /// Selects the versioned resources this rule is about.
    #[serde(default)]
    pub resource_matchers: Vec<ResourceMatcher>,
    pub affected_resources: AffectedResources,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AffectedResources {
    pub object_references: Vec<ObjectReference>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectReference {
    pub path: Path,
    #[serde(default)]
    pub resource_matchers: Vec<ResourceMatcher>,
    #[serde(default = "default_name_key")]
    pub name_key: String,
}

fn default_name_key() -> String { "name".to_string() }

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitRule {
    #[serde(default)]
    pub resource_matchers: Vec<ResourceMatcher>,
    #[serde(default)]
    pub supports_observed_generation: bool,
    #[serde(default)]
    pub condition_matchers: Vec<ConditionMatcher>,
    /// Name of a predicate registered with the wait evaluator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overlay: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionMatcher {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: String,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub failure: bool,
    #[serde(default)]
    pub supports_observed_generation: bool,
}

/// A path plus the resources it applies to (label scoping, ownership
/// labels, diff masking).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathRule {
    pub path: Path,
    #[serde(default)]
    pub resource_matchers: Vec<ResourceMatcher>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeGroupBinding {
    pub name: String,
    #[serde(default)]
    pub resource_matchers: Vec<ResourceMatcher>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRuleBinding {
    pub rules: Vec<String>,
    #[serde(default)]
    pub ignore_if_cyclical: bool,
    #[serde(default)]
    pub resource_matchers: Vec<ResourceMatcher>,
}

/// Parses YAML in which enum variants are written as single-key maps
/// (`- apiVersionKindMatcher: {...}`), at any depth.
pub fn parse_yaml<T: DeserializeOwned>(yaml: &str) -> Result<T, serde_yaml::Error> {
    serde_yaml::with::singleton_map_recursive::deserialize(serde_yaml::Deserializer::from_str(yaml))
}

impl Config {
    pub fn from_yaml(yaml: &str) -> KadeResult<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        let cfg: Self = parse_yaml(yaml).map_err(|e| KadeError::config(format!("parse config: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Append `other` after `self`; rule order is preserved.
    pub fn merge(&mut self, other: Config) {
        self.rebase_rules.extend(other.rebase_rules);
        self.template_rules.extend(other.template_rules);
        self.wait_rules.extend(other.wait_rules);
        self.label_scoping_rules.extend(other.label_scoping_rules);
        self.ownership_label_rules.extend(other.ownership_label_rules);
        self.additional_labels.extend(other.additional_labels);
        self.diff_mask_rules.extend(other.diff_mask_rules);
        self.change_group_bindings.extend(other.change_group_bindings);
        self.change_rule_bindings.extend(other.change_rule_bindings);
    }

    pub fn merged(configs: impl IntoIterator<Item = Config>) -> Self {
        let mut out = Self::default();
        for c in configs {
            out.merge(c);
        }
        out
    }

    pub fn validate(&self) -> KadeResult<()> {
        for (i, rule) in self.rebase_rules.iter().enumerate() {
            let ctx = format!("rebaseRules[{i}]");
            match rule.rule_type {
                RebaseRuleType::Copy | RebaseRuleType::Remove => {
                    if rule.all_paths().next().is_none() {
                        return Err(KadeError::config("expected path or paths").context(ctx));
                    }
                    for p in rule.all_paths() {
                        p.validate().map_err(|e| e.context(&ctx))?;
                    }
                    if rule.rule_type == RebaseRuleType::Copy && rule.sources.is_empty() {
                        return Err(KadeError::config("copy rule requires sources").context(ctx));
                    }
                }
                RebaseRuleType::Overlay => {
                    if rule.overlay.as_deref().map_or(true, str::is_empty) {
                        return Err(KadeError::config("overlay rule requires overlay").context(ctx));
                    }
                }
            }
        }
        for (i, rule) in self.template_rules.iter().enumerate() {
            for r in &rule.affected_resources.object_references {
                r.path.validate().map_err(|e| e.context(format!("templateRules[{i}]")))?;
            }
        }
        for (i, rule) in self.wait_rules.iter().enumerate() {
            if rule.overlay.is_none() && rule.condition_matchers.is_empty() && !rule.supports_observed_generation {
                return Err(KadeError::config("wait rule needs conditionMatchers, supportsObservedGeneration or overlay")
                    .context(format!("waitRules[{i}]")));
            }
        }
        let path_rules = [
            ("labelScopingRules", &self.label_scoping_rules),
            ("ownershipLabelRules", &self.ownership_label_rules),
            ("diffMaskRules", &self.diff_mask_rules),
        ];
        for (field, rules) in path_rules {
            for (i, r) in rules.iter().enumerate() {
                r.path.validate().map_err(|e| e.context(format!("{field}[{i}]")))?;
            }
        }
        for (i, b) in self.change_group_bindings.iter().enumerate() {
            if b.name.trim().is_empty() {
                return Err(KadeError::config("binding name must not be empty").context(format!("changeGroupBindings[{i}]")));
            }
        }
        Ok(())
    }
}
