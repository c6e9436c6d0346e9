//! `change-group` names and `change-rule` expressions.

use std::fmt;
use std::str::FromStr;

use kade_core::annotations::{self as ann, matching_keys};
use kade_core::config::{ChangeGroupBinding, ChangeRuleBinding};
use kade_core::{any_matches, ChangeOp, KadeError, KadeResult, Resource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    Upsert,
    Delete,
}

impl RuleAction {
    pub fn applies_to(self, op: ChangeOp) -> bool {
        match self {
            Self::Upsert => op.is_upsert(),
            Self::Delete => op == ChangeOp::Delete,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleOrder {
    Before,
    After,
}

/// `<upsert|delete> <before|after> <upserting|deleting> <group>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRule {
    pub action: RuleAction,
    pub order: RuleOrder,
    pub target: RuleAction,
    pub group: String,
    /// Drop edges from this rule that would close a cycle.
    pub ignore_if_cyclical: bool,
}

impl FromStr for ChangeRule {
    type Err = KadeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split_whitespace().collect();
        let bad = || KadeError::config(format!("change rule '{s}': expected '<upsert|delete> <before|after> <upserting|deleting> <group>'"));
        let [action, order, target, group] = parts.as_slice() else { return Err(bad()) };
        let action = match *action {
            "upsert" => RuleAction::Upsert,
            "delete" => RuleAction::Delete,
            _ => return Err(bad()),
        };
        let order = match *order {
            "before" => RuleOrder::Before,
            "after" => RuleOrder::After,
            _ => return Err(bad()),
        };
        let target = match *target {
            "upserting" => RuleAction::Upsert,
            "deleting" => RuleAction::Delete,
            _ => return Err(bad()),
        };
        validate_group(group).map_err(|e| e.context(format!("change rule '{s}'")))?;
        Ok(Self { action, order, target, group: group.to_string(), ignore_if_cyclical: false })
    }
}

impl fmt::Display for ChangeRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let action = match self.action {
            RuleAction::Upsert => "upsert",
            RuleAction::Delete => "delete",
        };
        let order = match self.order {
            RuleOrder::Before => "before",
            RuleOrder::After => "after",
        };
        let target = match self.target {
            RuleAction::Upsert => "upserting",
            RuleAction::Delete => "deleting",
        };
        write!(f, "{action} {order} {target} {}", self.group)
    }
}

pub fn validate_group(name: &str) -> KadeResult<()> {
    if name.is_empty() || name.chars().any(char::is_whitespace) {
        return Err(KadeError::config(format!("invalid change group name '{name}'")));
    }
    Ok(())
}

/// Substitute `{api-group}`, `{kind}`, `{name}`, `{namespace}`, `{crd-group}`
/// and `{crd-kind}`. `None` when a placeholder has no value for `res`.
pub fn resolve_placeholders(template: &str, res: &Resource) -> Option<String> {
    if !template.contains('{') {
        return Some(template.to_string());
    }
    let crd = res.crd_target();
    let mut out = template.to_string();
    let values: [(&str, Option<&str>); 6] = [
        ("{api-group}", Some(res.group())),
        ("{kind}", Some(res.kind())),
        ("{name}", Some(res.name())),
        ("{namespace}", res.namespace()),
        ("{crd-group}", crd.as_ref().map(|c| c.0.as_str())),
        ("{crd-kind}", crd.as_ref().map(|c| c.1.as_str())),
    ];
    for (placeholder, value) in values {
        if out.contains(placeholder) {
            out = out.replace(placeholder, value?);
        }
    }
    if out.contains('{') {
        return None;
    }
    Some(out)
}

/// Groups `res` belongs to: annotations first, then matching bindings.
pub fn groups_for(res: &Resource, bindings: &[ChangeGroupBinding]) -> KadeResult<Vec<String>> {
    let mut out = Vec::new();
    for (_, value) in matching_keys(&res.annotations(), ann::CHANGE_GROUP) {
        validate_group(value).map_err(|e| e.context(res.description()))?;
        out.push(value.clone());
    }
    for b in bindings.iter().filter(|b| any_matches(&b.resource_matchers, res)) {
        if let Some(name) = resolve_placeholders(&b.name, res) {
            out.push(name);
        }
    }
    out.sort();
    out.dedup();
    Ok(out)
}

/// Rules declared on `res` plus those bound by configuration.
pub fn rules_for(res: &Resource, bindings: &[ChangeRuleBinding]) -> KadeResult<Vec<ChangeRule>> {
    let mut out = Vec::new();
    for (_, value) in matching_keys(&res.annotations(), ann::CHANGE_RULE) {
        out.push(value.parse::<ChangeRule>().map_err(|e| e.context(res.description()))?);
    }
    for b in bindings.iter().filter(|b| any_matches(&b.resource_matchers, res)) {
        for raw in &b.rules {
            // unresolvable placeholders mean the binding does not apply here
            let Some(resolved) = resolve_placeholders(raw, res) else { continue };
            let mut rule: ChangeRule = resolved.parse()?;
            rule.ignore_if_cyclical = b.ignore_if_cyclical;
            out.push(rule);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_displays_rules() {
        let r: ChangeRule = "upsert after upserting apps.big.co/db-migrations".parse().unwrap();
        assert_eq!((r.action, r.order, r.target), (RuleAction::Upsert, RuleOrder::After, RuleAction::Upsert));
        assert_eq!(r.to_string(), "upsert after upserting apps.big.co/db-migrations");
        assert!("upsert later upserting x".parse::<ChangeRule>().is_err());
        assert!("upsert after upserting".parse::<ChangeRule>().unwrap_err().is_pre_mutation());
    }

    #[test]
    fn placeholders_resolve_or_skip() {
        let cm = Resource::build("v1", "ConfigMap", Some("web"), "cfg");
        assert_eq!(resolve_placeholders("ns-{namespace}/{kind}", &cm).as_deref(), Some("ns-web/ConfigMap"));
        assert_eq!(resolve_placeholders("crd-{crd-group}", &cm), None);
        let ns = Resource::build("v1", "Namespace", None, "web");
        assert_eq!(resolve_placeholders("{namespace}", &ns), None);
    }

    #[test]
    fn groups_from_annotations_with_suffixes() {
        let mut r = Resource::build("v1", "ConfigMap", Some("web"), "cfg");
        r.set_annotation(ann::CHANGE_GROUP, "a/one");
        r.set_annotation(&format!("{}.extra", ann::CHANGE_GROUP), "a/two");
        assert_eq!(groups_for(&r, &[]).unwrap(), vec!["a/one", "a/two"]);
        r.set_annotation(ann::CHANGE_GROUP, "has space");
        assert!(groups_for(&r, &[]).is_err());
    }
}
