//! Path language over resource trees.
//!
//! A [`Path`] is a list of segments: map keys, array indexes, "all indexes",
//! or regexes over map keys. Evaluating a path against a document expands it
//! into concrete [`Step`] lists; the mutation primitives below operate on
//! those concrete locations.
//!
//! Config syntax (YAML): `[spec, ports, {allIndexes: true}, nodePort]`,
//! `[spec, containers, {index: 0}]`, `[metadata, labels, {regex: "^app"}]`.

use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

use crate::error::{KadeError, KadeResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawSegment", into = "RawSegment")]
pub enum PathSegment {
    Key(String),
    Index(usize),
    AllIndexes,
    Regex(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RawSegment {
    Key(String),
    Index(u64),
    Map(RawSegmentMap),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawSegmentMap {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    all_indexes: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    index: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    regex: Option<String>,
}

impl TryFrom<RawSegment> for PathSegment {
    type Error = String;

    fn try_from(raw: RawSegment) -> Result<Self, Self::Error> {
        match raw {
            RawSegment::Key(k) => Ok(Self::Key(k)),
            RawSegment::Index(i) => Ok(Self::Index(i as usize)),
            RawSegment::Map(m) => match (m.all_indexes, m.index, m.regex) {
                (Some(true), None, None) => Ok(Self::AllIndexes),
                (None, Some(i), None) => Ok(Self::Index(i as usize)),
                (None, None, Some(r)) => {
                    Regex::new(&r).map_err(|e| format!("invalid regex path segment {r:?}: {e}"))?;
                    Ok(Self::Regex(r))
                }
                _ => Err("path segment must set exactly one of allIndexes: true, index, regex".to_string()),
            },
        }
    }
}

impl From<PathSegment> for RawSegment {
    fn from(seg: PathSegment) -> Self {
        match seg {
            PathSegment::Key(k) => RawSegment::Key(k),
            PathSegment::Index(i) => RawSegment::Map(RawSegmentMap { index: Some(i as u64), ..Default::default() }),
            PathSegment::AllIndexes => RawSegment::Map(RawSegmentMap { all_indexes: Some(true), ..Default::default() }),
            PathSegment::Regex(r) => RawSegment::Map(RawSegmentMap { regex: Some(r), ..Default::default() }),
        }
    }
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key(k) => write!(f, "{k}"),
            Self::Index(i) => write!(f, "[{i}]"),
            Self::AllIndexes => write!(f, "[*]"),
            Self::Regex(r) => write!(f, "/{r}/"),
        }
    }
}

/// A concrete location inside a document.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Step {
    Key(String),
    Index(usize),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Path(Vec<PathSegment>);

impl Path {
    pub fn new(segments: Vec<PathSegment>) -> Self { Self(segments) }

    /// Shorthand for a path made only of keys.
    pub fn keys(keys: &[&str]) -> Self { Self(keys.iter().map(|k| PathSegment::Key(k.to_string())).collect()) }

    pub fn segments(&self) -> &[PathSegment] { &self.0 }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    pub fn join(&self, seg: PathSegment) -> Self {
        let mut out = self.0.clone();
        out.push(seg);
        Self(out)
    }

    /// Check regexes compile and the path is not empty.
    pub fn validate(&self) -> KadeResult<()> {
        if self.0.is_empty() {
            return Err(KadeError::config("path must not be empty"));
        }
        for seg in &self.0 {
            if let PathSegment::Regex(r) = seg {
                Regex::new(r).map_err(|e| KadeError::config(format!("path {self}: invalid regex {r:?}: {e}")))?;
            }
        }
        Ok(())
    }

    /// Every concrete location in `doc` where the whole path resolves.
    pub fn expand(&self, doc: &Json) -> KadeResult<Vec<Vec<Step>>> {
        let mut out = Vec::new();
        let mut prefix = Vec::new();
        self.walk(doc, 0, &mut prefix, false, &mut out)?;
        Ok(out)
    }

    /// Like [`Path::expand`], but a missing final key still yields a
    /// location (its parent must exist and be a mapping).
    pub fn expand_for_write(&self, doc: &Json) -> KadeResult<Vec<Vec<Step>>> {
        let mut out = Vec::new();
        let mut prefix = Vec::new();
        self.walk(doc, 0, &mut prefix, true, &mut out)?;
        Ok(out)
    }

    fn walk(&self, cur: &Json, depth: usize, prefix: &mut Vec<Step>, allow_missing_last: bool, out: &mut Vec<Vec<Step>>) -> KadeResult<()> {
        let Some(seg) = self.0.get(depth) else {
            out.push(prefix.clone());
            return Ok(());
        };
        let last = depth + 1 == self.0.len();
        match seg {
            PathSegment::Key(k) => {
                let Some(map) = cur.as_object() else { return Ok(()) };
                match map.get(k) {
                    Some(next) => {
                        prefix.push(Step::Key(k.clone()));
                        self.walk(next, depth + 1, prefix, allow_missing_last, out)?;
                        prefix.pop();
                    }
                    None if last && allow_missing_last => {
                        let mut loc = prefix.clone();
                        loc.push(Step::Key(k.clone()));
                        out.push(loc);
                    }
                    None => {}
                }
            }
            PathSegment::Index(i) => {
                if let Some(next) = cur.as_array().and_then(|a| a.get(*i)) {
                    prefix.push(Step::Index(*i));
                    self.walk(next, depth + 1, prefix, allow_missing_last, out)?;
                    prefix.pop();
                }
            }
            PathSegment::AllIndexes => {
                if let Some(items) = cur.as_array() {
                    for (i, next) in items.iter().enumerate() {
                        prefix.push(Step::Index(i));
                        self.walk(next, depth + 1, prefix, allow_missing_last, out)?;
                        prefix.pop();
                    }
                }
            }
            PathSegment::Regex(r) => {
                let re = Regex::new(r).map_err(|e| KadeError::config(format!("path {self}: invalid regex {r:?}: {e}")))?;
                if let Some(map) = cur.as_object() {
                    for (k, next) in map.iter() {
                        if !re.is_match(k) {
                            continue;
                        }
                        prefix.push(Step::Key(k.clone()));
                        self.walk(next, depth + 1, prefix, allow_missing_last, out)?;
                        prefix.pop();
                    }
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        write!(f, "{}", parts.join("."))
    }
}

impl From<Vec<PathSegment>> for Path {
    fn from(v: Vec<PathSegment>) -> Self { Self(v) }
}

pub fn get_at<'a>(doc: &'a Json, steps: &[Step]) -> Option<&'a Json> {
    steps.iter().try_fold(doc, |cur, step| match step {
        Step::Key(k) => cur.as_object()?.get(k),
        Step::Index(i) => cur.as_array()?.get(*i),
    })
}

pub fn get_at_mut<'a>(doc: &'a mut Json, steps: &[Step]) -> Option<&'a mut Json> {
    steps.iter().try_fold(doc, |cur, step| match step {
        Step::Key(k) => cur.as_object_mut()?.get_mut(k),
        Step::Index(i) => cur.as_array_mut()?.get_mut(*i),
    })
}

/// Write `value` at `steps`, creating intermediate mappings for missing keys.
/// Array elements are never created; returns false when a step cannot be
/// reached.
pub fn set_at(doc: &mut Json, steps: &[Step], value: Json) -> bool {
    let Some((last, parents)) = steps.split_last() else {
        *doc = value;
        return true;
    };
    let mut cur = doc;
    for step in parents {
        cur = match step {
            Step::Key(k) => {
                if cur.is_null() {
                    *cur = Json::Object(Map::new());
                }
                let Some(map) = cur.as_object_mut() else { return false };
                map.entry(k.clone()).or_insert(Json::Null)
            }
            Step::Index(i) => match cur.as_array_mut().and_then(|a| a.get_mut(*i)) {
                Some(next) => next,
                None => return false,
            },
        };
    }
    match last {
        Step::Key(k) => {
            if cur.is_null() {
                *cur = Json::Object(Map::new());
            }
            match cur.as_object_mut() {
                Some(map) => {
                    map.insert(k.clone(), value);
                    true
                }
                None => false,
            }
        }
        Step::Index(i) => match cur.as_array_mut().and_then(|a| a.get_mut(*i)) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        },
    }
}

pub fn remove_at(doc: &mut Json, steps: &[Step]) -> Option<Json> {
    let (last, parents) = steps.split_last()?;
    let parent = get_at_mut(doc, parents)?;
    match last {
        Step::Key(k) => parent.as_object_mut()?.remove(k),
        Step::Index(i) => {
            let arr = parent.as_array_mut()?;
            if *i < arr.len() { Some(arr.remove(*i)) } else { None }
        }
    }
}

/// Remove every location, deepest/last first so array indexes stay valid.
pub fn remove_all(doc: &mut Json, mut locations: Vec<Vec<Step>>) -> usize {
    locations.sort_by(|a, b| cmp_steps(b, a));
    locations.dedup();
    locations.iter().filter(|loc| remove_at(doc, loc).is_some()).count()
}

fn cmp_steps(a: &[Step], b: &[Step]) -> std::cmp::Ordering {
    for (x, y) in a.iter().zip(b.iter()) {
        let ord = match (x, y) {
            (Step::Index(i), Step::Index(j)) => i.cmp(j),
            (Step::Key(k), Step::Key(l)) => k.cmp(l),
            (Step::Key(_), Step::Index(_)) => std::cmp::Ordering::Less,
            (Step::Index(_), Step::Key(_)) => std::cmp::Ordering::Greater,
        };
        if ord != std::cmp::Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}

pub fn render_steps(steps: &[Step]) -> String {
    let parts: Vec<String> = steps
        .iter()
        .map(|s| match s {
            Step::Key(k) => k.clone(),
            Step::Index(i) => format!("[{i}]"),
        })
        .collect();
    parts.join(".")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(yaml: &str) -> Path { serde_yaml::from_str(yaml).unwrap() }

    #[test]
    fn parses_all_segment_kinds() {
        let p = parse("[spec, ports, {allIndexes: true}, nodePort, {index: 2}, {regex: '^app'}, 3]");
        assert_eq!(
            p.segments(),
            &[
                PathSegment::Key("spec".into()),
                PathSegment::Key("ports".into()),
                PathSegment::AllIndexes,
                PathSegment::Key("nodePort".into()),
                PathSegment::Index(2),
                PathSegment::Regex("^app".into()),
                PathSegment::Index(3),
            ]
        );
    }

    #[test]
    fn malformed_segments_are_rejected() {
        assert!(serde_yaml::from_str::<Path>("[{allIndexes: false}]").is_err());
        assert!(serde_yaml::from_str::<Path>("[{index: 1, regex: a}]").is_err());
        assert!(serde_yaml::from_str::<Path>("[{regex: '('}]").is_err());
        assert!(serde_yaml::from_str::<Path>("[{bogus: 1}]").is_err());
    }

    #[test]
    fn expands_wildcards_and_regex() {
        let doc = json!({
            "spec": {"ports": [{"port": 80, "nodePort": 30001}, {"port": 81}, {"port": 82, "nodePort": 30003}]},
            "metadata": {"labels": {"app": "a", "apple": "b", "tier": "c"}}
        });
        let locs = parse("[spec, ports, {allIndexes: true}, nodePort]").expand(&doc).unwrap();
        assert_eq!(locs.len(), 2);
        assert_eq!(get_at(&doc, &locs[1]), Some(&json!(30003)));

        let locs = parse("[metadata, labels, {regex: '^app'}]").expand(&doc).unwrap();
        assert_eq!(locs.len(), 2);
    }

    #[test]
    fn expand_for_write_allows_missing_leaf_only() {
        let doc = json!({"spec": {"template": {}}});
        let p = Path::keys(&["spec", "template", "labels"]);
        assert!(p.expand(&doc).unwrap().is_empty());
        assert_eq!(p.expand_for_write(&doc).unwrap().len(), 1);
        let deeper = Path::keys(&["spec", "template", "metadata", "labels"]);
        assert!(deeper.expand_for_write(&doc).unwrap().is_empty());
    }

    #[test]
    fn set_and_remove() {
        let mut doc = json!({"a": [{"b": 1}, {"b": 2}, {"b": 3}]});
        assert!(set_at(&mut doc, &[Step::Key("x".into()), Step::Key("y".into())], json!("z")));
        assert_eq!(doc["x"]["y"], json!("z"));
        assert!(!set_at(&mut doc, &[Step::Key("a".into()), Step::Index(9), Step::Key("b".into())], json!(0)));

        let locs = parse("[a, {allIndexes: true}]").expand(&doc).unwrap();
        let removed = remove_all(&mut doc, locs[..2].to_vec());
        assert_eq!(removed, 2);
        assert_eq!(doc["a"], json!([{"b": 3}]));
    }

    #[test]
    fn display_is_readable() {
        let p = parse("[spec, {allIndexes: true}, name]");
        assert_eq!(p.to_string(), "spec.[*].name");
        assert_eq!(render_steps(&[Step::Key("a".into()), Step::Index(1)]), "a.[1]");
    }
}
