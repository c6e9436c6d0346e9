//! kade dependency graph.
//!
//! Nodes are changes; an edge `a -> b` means `a` must be done before `b`
//! starts. Edges come from `change-group`/`change-rule` annotations, from
//! config bindings (namespaces before their contents, CRDs before custom
//! resources, RBAC before workloads) and from versioned references.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::time::Instant;

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, info};

use kade_core::{Config, KadeError, KadeResult, ObjectKey};
use kade_diff::Change;
use kade_versioned::Reference;

mod rules;

pub use rules::{groups_for, resolve_placeholders, rules_for, ChangeRule, RuleAction, RuleOrder};

const DEFAULT_CONFIG: &str = r#"
changeGroupBindings:
- name: kade.dev/namespaces
  resourceMatchers:
  - apiVersionKindMatcher: {apiVersion: v1, kind: Namespace}
- name: kade.dev/namespace-{name}
  resourceMatchers:
  - apiVersionKindMatcher: {apiVersion: v1, kind: Namespace}
- name: kade.dev/crds
  resourceMatchers:
  - apiVersionKindMatcher: {apiVersion: apiextensions.k8s.io/v1, kind: CustomResourceDefinition}
- name: kade.dev/crds-{crd-group}-{crd-kind}
  resourceMatchers:
  - apiVersionKindMatcher: {apiVersion: apiextensions.k8s.io/v1, kind: CustomResourceDefinition}
- name: kade.dev/rbac
  resourceMatchers:
  - apiVersionKindMatcher: {apiVersion: v1, kind: ServiceAccount}
  - apiVersionKindMatcher: {apiVersion: rbac.authorization.k8s.io/v1, kind: Role}
  - apiVersionKindMatcher: {apiVersion: rbac.authorization.k8s.io/v1, kind: RoleBinding}
  - apiVersionKindMatcher: {apiVersion: rbac.authorization.k8s.io/v1, kind: ClusterRole}
  - apiVersionKindMatcher: {apiVersion: rbac.authorization.k8s.io/v1, kind: ClusterRoleBinding}

changeRuleBindings:
- rules:
  - upsert after upserting kade.dev/namespace-{namespace}
  - delete before deleting kade.dev/namespace-{namespace}
  ignoreIfCyclical: true
  resourceMatchers:
  - hasNamespaceMatcher: {}
- rules:
  - upsert after upserting kade.dev/crds-{api-group}-{kind}
  - delete before deleting kade.dev/crds-{api-group}-{kind}
  ignoreIfCyclical: true
  resourceMatchers:
  - notMatcher:
      matcher:
        apiVersionKindMatcher: {apiVersion: apiextensions.k8s.io/v1, kind: CustomResourceDefinition}
- rules:
  - upsert after upserting kade.dev/rbac
  ignoreIfCyclical: true
  resourceMatchers:
  - apiVersionKindMatcher: {apiVersion: v1, kind: Pod}
  - apiVersionKindMatcher: {apiVersion: apps/v1, kind: Deployment}
  - apiVersionKindMatcher: {apiVersion: apps/v1, kind: StatefulSet}
  - apiVersionKindMatcher: {apiVersion: apps/v1, kind: DaemonSet}
  - apiVersionKindMatcher: {apiVersion: apps/v1, kind: ReplicaSet}
  - apiVersionKindMatcher: {apiVersion: batch/v1, kind: Job}
  - apiVersionKindMatcher: {apiVersion: batch/v1, kind: CronJob}
"#;

/// Implicit ordering bindings.
pub fn default_config() -> KadeResult<Config> { Config::from_yaml(DEFAULT_CONFIG) }

pub struct Node {
    pub change: Change,
    pub groups: Vec<String>,
    pub rules: Vec<ChangeRule>,
}

/// Arena graph: nodes in a vector, edges as index lists.
pub struct ChangeGraph {
    nodes: Vec<Node>,
    preds: Vec<Vec<usize>>,
    succs: Vec<Vec<usize>>,
}

impl ChangeGraph {
    pub fn len(&self) -> usize { self.nodes.len() }
    pub fn is_empty(&self) -> bool { self.nodes.is_empty() }
    pub fn nodes(&self) -> &[Node] { &self.nodes }
    pub fn node(&self, i: usize) -> &Node { &self.nodes[i] }
    pub fn preds(&self, i: usize) -> &[usize] { &self.preds[i] }
    pub fn succs(&self, i: usize) -> &[usize] { &self.succs[i] }
    pub fn into_changes(self) -> Vec<Change> { self.nodes.into_iter().map(|n| n.change).collect() }

    pub fn index_of(&self, key: &ObjectKey) -> Option<usize> { self.nodes.iter().position(|n| &n.change.key() == key) }

    fn empty(nodes: Vec<Node>) -> Self {
        let n = nodes.len();
        Self { nodes, preds: vec![Vec::new(); n], succs: vec![Vec::new(); n] }
    }

    fn has_edge(&self, from: usize, to: usize) -> bool { self.succs[from].contains(&to) }

    fn add_edge(&mut self, from: usize, to: usize) {
        if from == to || self.has_edge(from, to) {
            return;
        }
        self.succs[from].push(to);
        self.preds[to].push(from);
    }

    /// Whether `to` already reaches `from`, i.e. `from -> to` would close a cycle.
    fn would_create_cycle(&self, from: usize, to: usize) -> bool {
        let mut seen = FxHashSet::default();
        let mut stack = vec![to];
        while let Some(cur) = stack.pop() {
            if cur == from {
                return true;
            }
            if seen.insert(cur) {
                stack.extend(self.succs[cur].iter().copied());
            }
        }
        false
    }

    /// Members of some cycle, if any.
    fn find_cycle(&self) -> Option<Vec<usize>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Visit {
            New,
            Active,
            Done,
        }
        fn dfs(g: &ChangeGraph, i: usize, state: &mut [Visit], path: &mut Vec<usize>) -> Option<Vec<usize>> {
            state[i] = Visit::Active;
            path.push(i);
            for &next in &g.succs[i] {
                match state[next] {
                    Visit::Active => {
                        let start = path.iter().position(|&p| p == next).unwrap_or(0);
                        return Some(path[start..].to_vec());
                    }
                    Visit::New => {
                        if let Some(c) = dfs(g, next, state, path) {
                            return Some(c);
                        }
                    }
                    Visit::Done => {}
                }
            }
            path.pop();
            state[i] = Visit::Done;
            None
        }
        let mut state = vec![Visit::New; self.len()];
        for i in 0..self.len() {
            if state[i] == Visit::New {
                let mut path = Vec::new();
                if let Some(c) = dfs(self, i, &mut state, &mut path) {
                    return Some(c);
                }
            }
        }
        None
    }

    /// Topological layers: every node's predecessors sit in earlier layers.
    pub fn waves(&self) -> Vec<Vec<usize>> {
        let mut remaining: Vec<usize> = self.preds.iter().map(Vec::len).collect();
        let mut current: Vec<usize> = (0..self.len()).filter(|&i| remaining[i] == 0).collect();
        let mut out = Vec::new();
        while !current.is_empty() {
            let mut next = Vec::new();
            for &i in &current {
                for &s in &self.succs[i] {
                    remaining[s] -= 1;
                    if remaining[s] == 0 {
                        next.push(s);
                    }
                }
            }
            next.sort_unstable();
            out.push(std::mem::take(&mut current));
            current = next;
        }
        out
    }

    /// One line per change with its prerequisites.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (i, n) in self.nodes.iter().enumerate() {
            out.push_str(&format!("({}) {}\n", n.change.op, n.change.resource().description()));
            for &p in &self.preds[i] {
                let pn = &self.nodes[p].change;
                out.push_str(&format!("  after ({}) {}\n", pn.op, pn.resource().description()));
            }
        }
        out
    }
}

struct PendingEdge {
    from: usize,
    to: usize,
    ignorable: bool,
}

/// Build the graph over non-ignored `changes`.
pub fn build(changes: Vec<Change>, references: &[Reference], config: &Config) -> KadeResult<ChangeGraph> {
    let t0 = Instant::now();
    let mut nodes = Vec::with_capacity(changes.len());
    for change in changes.into_iter().filter(|c| !c.ignored) {
        let res = change.resource();
        let groups = groups_for(res, &config.change_group_bindings)?;
        let rules = rules_for(res, &config.change_rule_bindings)?;
        nodes.push(Node { change, groups, rules });
    }
    let mut graph = ChangeGraph::empty(nodes);

    let mut members: FxHashMap<&str, Vec<usize>> = FxHashMap::default();
    for (i, n) in graph.nodes.iter().enumerate() {
        for g in &n.groups {
            members.entry(g.as_str()).or_default().push(i);
        }
    }

    let mut pending = Vec::new();
    for (i, n) in graph.nodes.iter().enumerate() {
        for rule in n.rules.iter().filter(|r| r.action.applies_to(n.change.op)) {
            let Some(targets) = members.get(rule.group.as_str()) else { continue };
            for &t in targets.iter().filter(|&&t| t != i && rule.target.applies_to(graph.nodes[t].change.op)) {
                let (from, to) = match rule.order {
                    RuleOrder::After => (t, i),
                    RuleOrder::Before => (i, t),
                };
                pending.push(PendingEdge { from, to, ignorable: rule.ignore_if_cyclical });
            }
        }
    }

    // the referenced object must exist before its user is written
    let index: FxHashMap<ObjectKey, usize> = graph.nodes.iter().enumerate().map(|(i, n)| (n.change.key(), i)).collect();
    for r in references {
        let (Some(&from), Some(&to)) = (index.get(&r.referenced), index.get(&r.user)) else { continue };
        if graph.nodes[from].change.op.is_upsert() && graph.nodes[to].change.op.is_upsert() {
            pending.push(PendingEdge { from, to, ignorable: false });
        }
    }

    pending.sort_by_key(|e| e.ignorable);
    let mut dropped = 0usize;
    for e in pending {
        if e.ignorable && graph.would_create_cycle(e.from, e.to) {
            dropped += 1;
            continue;
        }
        graph.add_edge(e.from, e.to);
    }

    if let Some(cycle) = graph.find_cycle() {
        let names: BTreeSet<String> = cycle.iter().map(|&i| graph.nodes[i].change.description()).collect();
        let names: Vec<String> = names.into_iter().collect();
        return Err(KadeError::config(format!("change graph has a cycle between: {}", names.join(", "))));
    }

    let edges: usize = graph.succs.iter().map(Vec::len).sum();
    debug!(dropped_cyclical = dropped, "graph: ignorable edges dropped");
    info!(nodes = graph.len(), edges, took_ms = %t0.elapsed().as_millis(), "graph: built");
    Ok(graph)
}

#[cfg(test)]
mod tests;
