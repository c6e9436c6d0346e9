//! Diff filters: boolean expressions over change records.
//!
//! ```yaml
//! or:
//! - ops: [delete]
//! - and:
//!   - kinds: [Deployment]
//!   - not: {namespaces: [kube-system]}
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use kade_core::{ChangeOp, KadeError, KadeResult, Resource};

use crate::Change;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LabelFilter {
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl LabelFilter {
    fn matches(&self, res: Option<&Resource>) -> bool {
        let Some(res) = res else { return false };
        self.labels.iter().all(|(k, v)| res.label(k) == Some(v.as_str()))
    }
}

/// Every populated field must hold; an empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DiffFilter {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub and: Vec<DiffFilter>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub or: Vec<DiffFilter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not: Option<Box<DiffFilter>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ops: Vec<ChangeOp>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kinds: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub names: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_resource: Option<LabelFilter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub existing_resource: Option<LabelFilter>,
}

impl DiffFilter {
    /// Accepts JSON or YAML.
    pub fn parse(s: &str) -> KadeResult<Self> {
        if s.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(s).map_err(|e| KadeError::config(format!("diff filter: {e}")))
    }

    pub fn is_empty(&self) -> bool { *self == Self::default() }

    pub fn matches(&self, change: &Change) -> bool {
        let res = change.resource();
        let ns = res.namespace().unwrap_or_default();
        let one_of = |list: &[String], v: &str| list.is_empty() || list.iter().any(|x| x == v);
        one_of(&self.kinds, res.kind())
            && one_of(&self.namespaces, ns)
            && one_of(&self.names, res.name())
            && (self.ops.is_empty() || self.ops.contains(&change.op))
            && self.new_resource.as_ref().map_or(true, |f| f.matches(change.new.as_ref()))
            && self.existing_resource.as_ref().map_or(true, |f| f.matches(change.existing.as_ref()))
            && self.and.iter().all(|f| f.matches(change))
            && (self.or.is_empty() || self.or.iter().any(|f| f.matches(change)))
            && self.not.as_ref().map_or(true, |f| !f.matches(change))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::change_for;

    #[test]
    fn parses_nested_yaml() {
        let f = DiffFilter::parse("or:\n- ops: [delete]\n- and:\n  - kinds: [Deployment]\n  - not: {namespaces: [kube-system]}\n").unwrap();
        assert_eq!(f.or.len(), 2);
        assert!(f.or[1].and[1].not.is_some());
        assert!(DiffFilter::parse("{\"ops\":[\"update\"]}").unwrap().ops == vec![ChangeOp::Update]);
        assert!(DiffFilter::parse("bogus: 1").is_err());
        assert!(DiffFilter::parse("").unwrap().is_empty());
    }

    #[test]
    fn evaluates_boolean_structure() {
        let del = change_for(ChangeOp::Delete, "ConfigMap", "default", "a");
        let dep = change_for(ChangeOp::Update, "Deployment", "default", "web");
        let sys = change_for(ChangeOp::Update, "Deployment", "kube-system", "dns");
        let f = DiffFilter::parse("or:\n- ops: [delete]\n- and:\n  - kinds: [Deployment]\n  - not: {namespaces: [kube-system]}\n").unwrap();
        assert!(f.matches(&del));
        assert!(f.matches(&dep));
        assert!(!f.matches(&sys));
        assert!(DiffFilter::default().matches(&sys));
    }

    #[test]
    fn label_filters_look_at_the_right_side() {
        let mut c = change_for(ChangeOp::Delete, "ConfigMap", "default", "a");
        if let Some(e) = c.existing.as_mut() {
            e.set_label("tier", "db");
        }
        let f = DiffFilter::parse("existingResource: {labels: {tier: db}}").unwrap();
        assert!(f.matches(&c));
        let f = DiffFilter::parse("newResource: {labels: {tier: db}}").unwrap();
        assert!(!f.matches(&c), "deletes have no new side");
    }
}
