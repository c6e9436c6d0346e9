//! Error taxonomy shared by every engine.

use std::fmt;

/// Broad failure class; drives abort/retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Config,
    Validation,
    Transport,
    Conflict,
    Apply,
    Wait,
    Canceled,
    Multi,
}

#[derive(Debug, thiserror::Error)]
pub enum KadeError {
    #[error("config: {0}")]
    Config(String),
    #[error("validation: {0}")]
    Validation(String),
    #[error("transport: {0}")]
    Transport(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("apply: {0}")]
    Apply(String),
    #[error("wait: {0}")]
    Wait(String),
    #[error("canceled: {0}")]
    Canceled(String),
    #[error("{0}")]
    Multi(MultiError),
}

pub type KadeResult<T> = Result<T, KadeError>;

impl KadeError {
    pub fn config(msg: impl Into<String>) -> Self { Self::Config(msg.into()) }
    pub fn validation(msg: impl Into<String>) -> Self { Self::Validation(msg.into()) }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Config,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Transport(_) => ErrorKind::Transport,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Apply(_) => ErrorKind::Apply,
            Self::Wait(_) => ErrorKind::Wait,
            Self::Canceled(_) => ErrorKind::Canceled,
            Self::Multi(_) => ErrorKind::Multi,
        }
    }

    /// Config and validation errors must surface before any cluster mutation.
    pub fn is_pre_mutation(&self) -> bool {
        matches!(self.kind(), ErrorKind::Config | ErrorKind::Validation)
    }

    pub fn is_retryable(&self) -> bool { matches!(self, Self::Transport(_)) }

    /// Prefix the message with context while keeping the kind.
    pub fn context(self, ctx: impl fmt::Display) -> Self {
        match self {
            Self::Config(m) => Self::Config(format!("{ctx}: {m}")),
            Self::Validation(m) => Self::Validation(format!("{ctx}: {m}")),
            Self::Transport(m) => Self::Transport(format!("{ctx}: {m}")),
            Self::Conflict(m) => Self::Conflict(format!("{ctx}: {m}")),
            Self::Apply(m) => Self::Apply(format!("{ctx}: {m}")),
            Self::Wait(m) => Self::Wait(format!("{ctx}: {m}")),
            Self::Canceled(m) => Self::Canceled(format!("{ctx}: {m}")),
            Self::Multi(m) => Self::Multi(m),
        }
    }
}

impl From<serde_json::Error> for KadeError {
    fn from(e: serde_json::Error) -> Self { Self::Validation(format!("json: {e}")) }
}

impl From<serde_yaml::Error> for KadeError {
    fn from(e: serde_yaml::Error) -> Self { Self::Validation(format!("yaml: {e}")) }
}

/// Errors collected while the executor keeps going past failures.
#[derive(Debug, Default)]
pub struct MultiError {
    errors: Vec<KadeError>,
}

impl MultiError {
    pub fn new() -> Self { Self::default() }
    pub fn push(&mut self, e: KadeError) { self.errors.push(e); }
    pub fn len(&self) -> usize { self.errors.len() }
    pub fn is_empty(&self) -> bool { self.errors.is_empty() }
    pub fn errors(&self) -> &[KadeError] { &self.errors }
    pub fn iter(&self) -> impl Iterator<Item = &KadeError> { self.errors.iter() }

    /// Collapse into a single error: none, the lone error, or `Multi`.
    pub fn into_result(mut self) -> KadeResult<()> {
        match self.errors.len() {
            0 => Ok(()),
            1 => Err(self.errors.remove(0)),
            _ => Err(KadeError::Multi(self)),
        }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} errors:", self.errors.len())?;
        for e in &self.errors {
            write!(f, "\n- {e}")?;
        }
        Ok(())
    }
}

impl Extend<KadeError> for MultiError {
    fn extend<T: IntoIterator<Item = KadeError>>(&mut self, iter: T) { self.errors.extend(iter); }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_error_collapses() {
        assert!(MultiError::new().into_result().is_ok());

        let mut one = MultiError::new();
        one.push(KadeError::Apply("boom".into()));
        let e = one.into_result().unwrap_err();
        assert_eq!(e.kind(), ErrorKind::Apply);

        let mut two = MultiError::new();
        two.push(KadeError::Apply("a".into()));
        two.push(KadeError::Wait("b".into()));
        let e = two.into_result().unwrap_err();
        let s = e.to_string();
        assert!(s.starts_with("2 errors:"), "{s}");
        assert!(s.contains("- apply: a") && s.contains("- wait: b"), "{s}");
    }

    #[test]
    fn context_keeps_kind() {
        let e = KadeError::config("bad path").context("rebase rule 2");
        assert_eq!(e.kind(), ErrorKind::Config);
        assert_eq!(e.to_string(), "config: rebase rule 2: bad path");
        assert!(e.is_pre_mutation());
    }
}
