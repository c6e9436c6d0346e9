//! Canonical, line-numbered rendering of change pairs.

use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use similar::{ChangeTag, TextDiff};

use kade_core::annotations;
use kade_core::config::PathRule;
use kade_core::path::get_at_mut;
use kade_core::{any_matches, canonical_yaml, KadeResult, Resource};

/// Drop fields that never carry user intent (server bookkeeping, status and
/// the engine's own record of the last submission).
pub fn strip_noisy(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata").and_then(Json::as_object_mut) {
        for k in ["managedFields", "resourceVersion", "generation", "creationTimestamp", "uid", "selfLink"] {
            meta.remove(k);
        }
        let now_empty = match meta.get_mut("annotations").and_then(Json::as_object_mut) {
            Some(ann) => {
                ann.remove(annotations::ORIGINAL);
                ann.is_empty()
            }
            None => false,
        };
        if now_empty {
            meta.remove("annotations");
        }
    }
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
    v
}

/// Replaces masked values with numbered placeholders. Equal values share a
/// number across both sides of a diff, so a reader can still tell whether a
/// hidden value changed.
#[derive(Default)]
pub(crate) struct Masker {
    seen: FxHashMap<String, usize>,
}

impl Masker {
    fn token(&mut self, v: &Json) -> Json {
        let next = self.seen.len() + 1;
        let id = *self.seen.entry(v.to_string()).or_insert(next);
        Json::String(format!("<-- value not shown (#{id})"))
    }

    pub fn mask(&mut self, doc: &mut Json, res: &Resource, rules: &[PathRule]) -> KadeResult<()> {
        for rule in rules.iter().filter(|r| any_matches(&r.resource_matchers, res)) {
            for loc in rule.path.expand(doc)? {
                match get_at_mut(doc, &loc) {
                    // a masked mapping hides each value but keeps its keys
                    Some(Json::Object(map)) => {
                        for v in map.values_mut() {
                            let t = self.token(v);
                            *v = t;
                        }
                    }
                    Some(node) => {
                        let t = self.token(node);
                        *node = t;
                    }
                    None => {}
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderedDiff {
    pub text: String,
    /// Hash over the changed lines only; unaffected by unrelated context.
    pub approval: String,
    pub additions: usize,
    pub removals: usize,
}

impl RenderedDiff {
    pub fn is_empty(&self) -> bool { self.additions == 0 && self.removals == 0 }
}

fn line_no(i: Option<usize>) -> String { i.map(|i| (i + 1).to_string()).unwrap_or_default() }

/// Unified diff of two YAML documents with both line numbers on each line.
pub fn unified(old: &str, new: &str, context: usize) -> RenderedDiff {
    let diff = TextDiff::from_lines(old, new);
    let mut out = RenderedDiff::default();
    let mut hasher = blake3::Hasher::new();
    for (i, group) in diff.grouped_ops(context).iter().enumerate() {
        if i > 0 {
            out.text.push_str("  ...\n");
        }
        for op in group {
            for change in diff.iter_changes(op) {
                let line = change.value().trim_end_matches('\n');
                let (old_no, new_no) = (line_no(change.old_index()), line_no(change.new_index()));
                let rendered = match change.tag() {
                    ChangeTag::Equal => format!("{old_no:>4},{new_no:>4}   {line}\n"),
                    ChangeTag::Delete => {
                        out.removals += 1;
                        hasher.update(format!("-{line}\n").as_bytes());
                        format!("{old_no:>4}{:5} - {line}\n", "")
                    }
                    ChangeTag::Insert => {
                        out.additions += 1;
                        hasher.update(format!("+{line}\n").as_bytes());
                        format!("{:4}{new_no:>5} + {line}\n", "")
                    }
                };
                out.text.push_str(&rendered);
            }
        }
    }
    out.approval = hasher.finalize().to_hex().as_str()[..32].to_string();
    out
}

/// Render `existing` -> `new` after normalization and masking.
pub(crate) fn render_pair(existing: Option<&Resource>, new: Option<&Resource>, mask_rules: &[PathRule], context: usize) -> KadeResult<RenderedDiff> {
    let mut masker = Masker::default();
    let mut side = |res: Option<&Resource>| -> KadeResult<String> {
        let Some(res) = res else { return Ok(String::new()) };
        let mut doc = strip_noisy(res.raw().clone());
        masker.mask(&mut doc, res, mask_rules)?;
        Ok(canonical_yaml(&doc))
    };
    let old = side(existing)?;
    let new = side(new)?;
    Ok(unified(&old, &new, context))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kade_core::Path;
    use serde_json::json;

    #[test]
    fn strip_noisy_prunes_server_fields_and_original() {
        let v = json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": {"name": "x", "namespace": "ns", "managedFields": [{"foo": "bar"}], "resourceVersion": "123",
                         "generation": 5, "creationTimestamp": "2020-01-01T00:00:00Z",
                         "annotations": {"kade.dev/original": "{}"}},
            "status": {"obs": true},
            "data": {"k": "v"}
        });
        let pruned = strip_noisy(v);
        assert_eq!(pruned, json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "x", "namespace": "ns"}, "data": {"k": "v"}}));
    }

    #[test]
    fn unified_numbers_both_sides() {
        let d = unified("a: 1\nb: 2\nc: 3\n", "a: 1\nb: 9\nc: 3\n", 1);
        assert_eq!(d.text, "   1,   1   a: 1\n   2      - b: 2\n        2 + b: 9\n   3,   3   c: 3\n");
        assert_eq!((d.additions, d.removals), (1, 1));
        assert!(unified("x\n", "x\n", 3).is_empty());
    }

    #[test]
    fn approval_ignores_context() {
        let a = unified("a: 1\nb: 2\n", "a: 1\nb: 3\n", 2);
        let b = unified("a: 7\nq: 0\nb: 2\n", "a: 7\nq: 0\nb: 3\n", 2);
        assert_eq!(a.approval, b.approval);
        assert_ne!(a.approval, unified("a: 1\nb: 4\n", "a: 1\nb: 3\n", 2).approval);
    }

    #[test]
    fn masking_numbers_values_consistently() {
        let rules = vec![PathRule { path: Path::keys(&["data"]), resource_matchers: vec![] }];
        let mut old = Resource::build("v1", "Secret", Some("ns"), "s");
        old.raw_mut()["data"] = json!({"a": "c2VjcmV0", "b": "b2xk"});
        let mut new = old.clone();
        new.raw_mut()["data"]["b"] = json!("bmV3");
        let d = render_pair(Some(&old), Some(&new), &rules, 3).unwrap();
        assert!(!d.text.contains("c2VjcmV0") && !d.text.contains("bmV3"), "{}", d.text);
        let line = |tag: &str| d.text.lines().find(|l| l.contains(tag)).unwrap_or_default().to_string();
        assert!(line("(#1)").contains("  a: "), "{}", d.text);
        assert!(line("(#2)").contains(" - b: "), "{}", d.text);
        assert!(line("(#3)").contains(" + b: "), "{}", d.text);
    }
}
