//! Engine-owned annotation and label keys.

pub const PREFIX: &str = "kade.dev/";

pub const VERSIONED: &str = "kade.dev/versioned";
pub const VERSIONED_KEEP_ORIGINAL: &str = "kade.dev/versioned-keep-original";
/// Any key starting with this prefix (optionally suffixed, e.g. `.match`)
/// names one referenced versioned object.
pub const VERSIONED_EXPLICIT_REF: &str = "kade.dev/versioned-explicit-ref";
pub const NUM_VERSIONS: &str = "kade.dev/num-versions";
pub const VERSIONED_FINGERPRINT: &str = "kade.dev/versioned-fingerprint";
/// Original (un-versioned) name recorded on `-ver-N` objects.
pub const VERSIONED_ORIGINAL_NAME: &str = "kade.dev/versioned-original-name";

pub const CHANGE_GROUP: &str = "kade.dev/change-group";
pub const CHANGE_RULE: &str = "kade.dev/change-rule";

pub const CREATE_STRATEGY: &str = "kade.dev/create-strategy";
pub const UPDATE_STRATEGY: &str = "kade.dev/update-strategy";
pub const DELETE_STRATEGY: &str = "kade.dev/delete-strategy";

pub const NOOP: &str = "kade.dev/noop";
pub const EXISTS: &str = "kade.dev/exists";

pub const RENEW_DURATION: &str = "kade.dev/renew-duration";
/// Older spelling of [`RENEW_DURATION`].
pub const MAX_DURATION: &str = "kade.dev/max-duration";
pub const LAST_RENEWED_TIME: &str = "kade.dev/last-renewed-time";

/// Compact JSON of the object as last submitted by the engine.
pub const ORIGINAL: &str = "kade.dev/original";

pub const APP_LABEL: &str = "kade.dev/app";
pub const ASSOCIATION_LABEL: &str = "kade.dev/association";

pub const DEFAULT_NUM_VERSIONS: usize = 5;

/// Keys matching `base` exactly or `base.<suffix>`.
pub fn matching_keys<'a>(annotations: impl IntoIterator<Item = (&'a String, &'a String)>, base: &'a str) -> impl Iterator<Item = (&'a String, &'a String)> {
    annotations.into_iter().filter(move |(k, _)| k.as_str() == base || k.strip_prefix(base).is_some_and(|rest| rest.starts_with('.')))
}

pub fn is_engine_label(key: &str) -> bool { key == APP_LABEL || key == ASSOCIATION_LABEL }
