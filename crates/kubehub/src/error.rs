use kade_core::KadeError;

/// Cluster API failures, classified by what the caller can do about them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("transport: {0}")]
    Transport(String),
}

pub type ClientResult<T> = Result<T, ClientError>;

impl ClientError {
    pub fn is_not_found(&self) -> bool { matches!(self, Self::NotFound(_)) }
    pub fn is_already_exists(&self) -> bool { matches!(self, Self::AlreadyExists(_)) }
    pub fn is_conflict(&self) -> bool { matches!(self, Self::Conflict(_)) }
    pub fn is_invalid(&self) -> bool { matches!(self, Self::Invalid(_)) }
    pub fn is_transient(&self) -> bool { matches!(self, Self::Transport(_)) }

    /// Map an HTTP status (plus the API `reason`) the way the apiserver uses them.
    pub fn from_status(code: u16, reason: &str, message: String) -> Self {
        match code {
            404 => Self::NotFound(message),
            409 if reason == "AlreadyExists" => Self::AlreadyExists(message),
            409 => Self::Conflict(message),
            400 | 422 => Self::Invalid(message),
            401 | 403 => Self::Forbidden(message),
            _ => Self::Transport(format!("{code} {reason}: {message}")),
        }
    }
}

impl From<ClientError> for KadeError {
    fn from(e: ClientError) -> Self {
        match e {
            ClientError::Transport(m) => KadeError::Transport(m),
            ClientError::Conflict(m) => KadeError::Conflict(m),
            other => KadeError::Apply(other.to_string()),
        }
    }
}

impl From<kube::Error> for ClientError {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(resp) => Self::from_status(resp.code, &resp.reason, resp.message),
            other => Self::Transport(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert!(ClientError::from_status(409, "AlreadyExists", "x".into()).is_already_exists());
        assert!(ClientError::from_status(409, "Conflict", "x".into()).is_conflict());
        assert!(ClientError::from_status(422, "Invalid", "x".into()).is_invalid());
        assert!(ClientError::from_status(503, "ServiceUnavailable", "x".into()).is_transient());
        let k: KadeError = ClientError::Conflict("rv".into()).into();
        assert_eq!(k.kind(), kade_core::ErrorKind::Conflict);
    }
}
