//! Change operations and annotation-driven operation strategies.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::annotations;
use crate::error::{KadeError, KadeResult};
use crate::resource::Resource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    Create,
    Update,
    Delete,
    Noop,
    Exists,
}

impl ChangeOp {
    pub const ALL: [ChangeOp; 5] = [Self::Create, Self::Update, Self::Delete, Self::Noop, Self::Exists];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Noop => "noop",
            Self::Exists => "exists",
        }
    }

    /// Everything except delete counts as "upserting" for change rules.
    pub fn is_upsert(&self) -> bool { !matches!(self, Self::Delete) }

    /// Whether the executor writes to the server for this op.
    pub fn mutates(&self) -> bool { matches!(self, Self::Create | Self::Update | Self::Delete) }
}

impl fmt::Display for ChangeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for ChangeOp {
    type Err = KadeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| KadeError::validation(format!("unknown change operation '{s}'")))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OpStrategy {
    #[default]
    Default,
    FallbackOnUpdate,
    FallbackOnUpdateOrNoop,
    AlwaysReplace,
    FallbackOnReplace,
    Orphan,
    Skip,
}

impl OpStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "",
            Self::FallbackOnUpdate => "fallback-on-update",
            Self::FallbackOnUpdateOrNoop => "fallback-on-update-or-noop",
            Self::AlwaysReplace => "always-replace",
            Self::FallbackOnReplace => "fallback-on-replace",
            Self::Orphan => "orphan",
            Self::Skip => "skip",
        }
    }

    fn parse(res: &Resource, key: &str, allowed: &[OpStrategy]) -> KadeResult<Self> {
        let Some(value) = res.annotation(key) else { return Ok(Self::Default) };
        if value.is_empty() {
            return Ok(Self::Default);
        }
        allowed.iter().copied().find(|s| s.as_str() == value).ok_or_else(|| {
            let names: Vec<&str> = allowed.iter().map(|s| s.as_str()).collect();
            KadeError::validation(format!("{}: unknown value '{value}' for {key} (expected one of: {})", res.description(), names.join(", ")))
        })
    }

    pub fn for_create(res: &Resource) -> KadeResult<Self> {
        Self::parse(res, annotations::CREATE_STRATEGY, &[Self::FallbackOnUpdate, Self::FallbackOnUpdateOrNoop])
    }

    pub fn for_update(res: &Resource) -> KadeResult<Self> {
        Self::parse(res, annotations::UPDATE_STRATEGY, &[Self::FallbackOnReplace, Self::AlwaysReplace, Self::Skip])
    }

    pub fn for_delete(res: &Resource) -> KadeResult<Self> { Self::parse(res, annotations::DELETE_STRATEGY, &[Self::Orphan]) }
}

impl fmt::Display for OpStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => f.write_str("default"),
            other => f.write_str(other.as_str()),
        }
    }
}
