//! kade versioned templater.
//!
//! Objects annotated `kade.dev/versioned` are deployed as `<name>-ver-<N>`.
//! N is reused while the content fingerprint is unchanged (and the previous
//! deploy succeeded, or `latest` mode is on) and advanced otherwise. All
//! references to the original name, found through `templateRules` or
//! `kade.dev/versioned-explicit-ref*` annotations, are rewritten to the
//! versioned name and reported as ordering edges.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use tracing::{debug, info};

use kade_core::annotations::{self as ann, DEFAULT_NUM_VERSIONS};
use kade_core::{parse_duration, Config, KadeError, KadeResult, ObjectKey, Resource};

mod defaults;
mod refs;

pub use defaults::default_config;
pub use refs::ExplicitRef;

use refs::{find_references, rewrite, RefSite, Target};

const VERSION_INFIX: &str = "-ver-";

#[derive(Debug, Clone)]
pub struct TemplateOptions {
    /// Reuse the newest version when the fingerprint matches, even if the
    /// last deploy failed.
    pub latest: bool,
    /// Whether the app's previous deploy finished successfully.
    pub prior_successful: bool,
    pub now: DateTime<Utc>,
}

impl Default for TemplateOptions {
    fn default() -> Self { Self { latest: false, prior_successful: true, now: Utc::now() } }
}

/// `user` must be upserted after `referenced`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Reference {
    pub user: ObjectKey,
    pub referenced: ObjectKey,
}

#[derive(Debug, Default)]
pub struct TemplateOutcome {
    pub resources: Vec<Resource>,
    pub references: Vec<Reference>,
    /// Older versions kept on the cluster; they must not turn into deletes.
    pub retained: BTreeSet<ObjectKey>,
}

pub fn is_versioned(res: &Resource) -> bool { res.has_annotation(ann::VERSIONED) || res.has_annotation(ann::VERSIONED_KEEP_ORIGINAL) }

pub fn versioned_name(base: &str, version: u64) -> String { format!("{base}{VERSION_INFIX}{version}") }

/// `Some(N)` when `name` is `<base>-ver-<N>`.
pub fn parse_version(name: &str, base: &str) -> Option<u64> {
    let n = name.strip_prefix(base)?.strip_prefix(VERSION_INFIX)?;
    if n.is_empty() || !n.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    n.parse().ok()
}

/// Content fingerprint over everything except volatile and engine-managed
/// fields and the name.
pub fn fingerprint(res: &Resource) -> String {
    let mut raw = res.raw().clone();
    if let Some(root) = raw.as_object_mut() {
        root.remove("status");
        if let Some(meta) = root.get_mut("metadata").and_then(Json::as_object_mut) {
            for k in ["name", "managedFields", "resourceVersion", "uid", "creationTimestamp", "generation", "selfLink"] {
                meta.remove(k);
            }
            if let Some(labels) = meta.get_mut("labels").and_then(Json::as_object_mut) {
                labels.remove(ann::APP_LABEL);
                labels.remove(ann::ASSOCIATION_LABEL);
            }
            if let Some(annotations) = meta.get_mut("annotations").and_then(Json::as_object_mut) {
                for k in [ann::VERSIONED_FINGERPRINT, ann::LAST_RENEWED_TIME, ann::ORIGINAL, ann::VERSIONED_ORIGINAL_NAME] {
                    annotations.remove(k);
                }
            }
        }
    }
    let hash = blake3::hash(kade_core::canonical_yaml(&raw).as_bytes()).to_hex();
    hash.as_str()[..32].to_string()
}

fn num_versions(res: &Resource) -> KadeResult<usize> {
    match res.annotation(ann::NUM_VERSIONS) {
        None => Ok(DEFAULT_NUM_VERSIONS),
        Some(v) => match v.trim().parse::<usize>() {
            Ok(n) if n >= 1 => Ok(n),
            _ => Err(KadeError::validation(format!("{}: {} must be a positive integer, got '{v}'", res.description(), ann::NUM_VERSIONS))),
        },
    }
}

fn renew_duration(res: &Resource) -> KadeResult<Option<Duration>> {
    let raw = res.annotation(ann::RENEW_DURATION).or_else(|| res.annotation(ann::MAX_DURATION));
    raw.map(|v| parse_duration(v).map_err(|e| e.context(format!("{}: {}", res.description(), ann::RENEW_DURATION)))).transpose()
}

/// True when `existing` was last renewed longer than `every` ago (or never).
pub fn renewal_due(existing: &Resource, every: Duration, now: DateTime<Utc>) -> bool {
    let Some(last) = existing.annotation(ann::LAST_RENEWED_TIME).and_then(|s| DateTime::parse_from_rfc3339(s).ok()) else {
        return true;
    };
    let every = chrono::Duration::from_std(every).unwrap_or_else(|_| chrono::Duration::days(36_500));
    last.with_timezone(&Utc) + every <= now
}

pub fn timestamp(now: DateTime<Utc>) -> String { now.to_rfc3339_opts(SecondsFormat::Secs, true) }

struct Family<'a> {
    /// Newest first.
    versions: Vec<(u64, &'a Resource)>,
}

fn family<'a>(existing: &'a [Resource], res: &Resource) -> Family<'a> {
    let mut versions: Vec<(u64, &Resource)> = existing
        .iter()
        .filter(|e| e.group() == res.group() && e.kind() == res.kind() && e.namespace() == res.namespace())
        .filter_map(|e| parse_version(e.name(), res.name()).map(|n| (n, e)))
        .collect();
    versions.sort_by(|a, b| b.0.cmp(&a.0));
    Family { versions }
}

struct Allocation {
    name: String,
    retained: Vec<ObjectKey>,
}

/// Pick the version for `res` (already reference-rewritten) and stamp its
/// engine annotations.
fn allocate(res: &mut Resource, existing: &[Resource], opts: &TemplateOptions) -> KadeResult<Allocation> {
    let fp = fingerprint(res);
    let keep = num_versions(res)?;
    let renew_every = renew_duration(res)?;
    let fam = family(existing, res);
    let base = res.name().to_string();

    let reuse = fam.versions.first().filter(|(_, prev)| {
        let same = prev.annotation(ann::VERSIONED_FINGERPRINT) == Some(fp.as_str());
        let settled = opts.latest || opts.prior_successful;
        let fresh = renew_every.map_or(true, |every| !renewal_due(prev, every, opts.now));
        same && settled && fresh
    });

    let (version, renewed) = match reuse {
        Some((n, prev)) => (*n, prev.annotation(ann::LAST_RENEWED_TIME).map(str::to_string)),
        None => {
            let next = fam.versions.first().map_or(1, |(n, _)| n + 1);
            (next, renew_every.map(|_| timestamp(opts.now)))
        }
    };

    // the chosen version counts toward the limit
    let reused_n = reuse.map(|(n, _)| *n);
    let retained = fam
        .versions
        .iter()
        .filter(|(n, _)| Some(*n) != reused_n)
        .take(keep.saturating_sub(1))
        .map(|(_, e)| e.key())
        .collect();

    res.set_annotation(ann::VERSIONED_FINGERPRINT, &fp);
    res.set_annotation(ann::VERSIONED_ORIGINAL_NAME, &base);
    if let Some(t) = renewed {
        res.set_annotation(ann::LAST_RENEWED_TIME, &t);
    }
    let name = versioned_name(&base, version);
    debug!(resource = %res.description(), version, reused = reuse.is_some(), "versioned: allocated");
    Ok(Allocation { name, retained })
}

/// Rewrite names of versioned resources and every reference to them.
pub fn template(new: Vec<Resource>, existing: &[Resource], config: &Config, opts: &TemplateOptions) -> KadeResult<TemplateOutcome> {
    let mut resources = new;
    let versioned: Vec<usize> = resources.iter().enumerate().filter(|(_, r)| is_versioned(r)).map(|(i, _)| i).collect();
    if versioned.is_empty() {
        return Ok(TemplateOutcome { resources, ..Default::default() });
    }

    let originals: Vec<Resource> = versioned.iter().map(|&i| resources[i].clone()).collect();
    let targets: Vec<Target<'_>> = originals.iter().map(|r| Target::new(r, &config.template_rules)).collect();

    let sites: Vec<Vec<RefSite>> = resources.iter().map(|r| find_references(r, &targets)).collect::<KadeResult<_>>()?;

    // allocate referenced versioned objects before their versioned users so
    // a user's fingerprint covers the rewritten names
    let mut final_names: FxHashMap<ObjectKey, String> = FxHashMap::default();
    let mut retained = BTreeSet::new();
    let mut pending: Vec<usize> = versioned.clone();
    let mut stuck = false;
    while !pending.is_empty() {
        let mut next_pending = Vec::new();
        let mut progressed = false;
        for &i in &pending {
            let ready = sites[i].iter().all(|s| final_names.contains_key(&s.target));
            if !ready && !stuck {
                next_pending.push(i);
                continue;
            }
            for s in &sites[i] {
                if let Some(name) = final_names.get(&s.target) {
                    rewrite(&mut resources[i], &s.site, name)?;
                }
            }
            let alloc = allocate(&mut resources[i], existing, opts)?;
            final_names.insert(resources[i].key(), alloc.name);
            retained.extend(alloc.retained);
            progressed = true;
        }
        // a reference cycle between versioned objects: allocate the rest on
        // their unrewritten content
        stuck = !progressed;
        pending = next_pending;
    }

    // rewriting is idempotent, so sites handled before allocation are safe to revisit
    for (i, res) in resources.iter_mut().enumerate() {
        for s in &sites[i] {
            if let Some(name) = final_names.get(&s.target) {
                rewrite(res, &s.site, name)?;
            }
        }
    }

    let mut references = BTreeSet::new();
    for (i, res_sites) in sites.iter().enumerate() {
        let user = resources[i].key();
        let user_final = match final_names.get(&user) {
            Some(n) => ObjectKey { name: n.clone(), ..user.clone() },
            None => user.clone(),
        };
        for s in res_sites {
            if let Some(n) = final_names.get(&s.target) {
                references.insert(Reference { user: user_final.clone(), referenced: ObjectKey { name: n.clone(), ..s.target.clone() } });
            }
        }
    }

    let mut out = Vec::with_capacity(resources.len() + versioned.len());
    for (i, mut res) in resources.into_iter().enumerate() {
        let Some(name) = final_names.get(&res.key()).cloned() else {
            out.push(res);
            continue;
        };
        if res.has_annotation(ann::VERSIONED_KEEP_ORIGINAL) {
            let mut original = res.clone();
            original.remove_annotation(ann::VERSIONED_FINGERPRINT);
            original.remove_annotation(ann::VERSIONED_ORIGINAL_NAME);
            out.push(original);
        }
        debug!(index = i, from = %res.name(), to = %name, "versioned: renamed");
        res.set_name(&name);
        out.push(res);
    }

    info!(versioned = versioned.len(), references = references.len(), retained = retained.len(), "versioned: templated");
    Ok(TemplateOutcome { resources: out, references: references.into_iter().collect(), retained })
}

#[cfg(test)]
mod tests;
