use std::time::Duration;

use cookiebridge_provider_core::{SourceError, UpstreamError};
use cookiebridge_storage::StorageError;

pub type SessionResult<T> = Result<T, SessionError>;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("profile '{profile}' is missing required credentials: {}", .missing.join(", "))]
    CredentialMissing {
        profile: String,
        missing: Vec<String>,
    },
    #[error("profile '{profile}' has expired credentials: {}", .expired.join(", "))]
    CredentialExpired {
        profile: String,
        expired: Vec<String>,
    },
    #[error("profile not found: {0}")]
    ProfileNotFound(String),
    #[error("upstream session is not initialized")]
    UpstreamNotInitialized,
    #[error(transparent)]
    Upstream(UpstreamError),
    #[error("upstream call timed out after {0:?}")]
    UpstreamTimeout(Duration),
    #[error(transparent)]
    Storage(StorageError),
}

/// Coarse classification used for HTTP status mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Credential,
    NotFound,
    NotInitialized,
    Upstream,
    Timeout,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Credential => "credential_error",
            ErrorKind::NotFound => "not_found",
            ErrorKind::NotInitialized => "upstream_not_initialized",
            ErrorKind::Upstream => "upstream_error",
            ErrorKind::Timeout => "upstream_timeout",
            ErrorKind::Internal => "internal_error",
        }
    }
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::CredentialMissing { .. } | SessionError::CredentialExpired { .. } => {
                ErrorKind::Credential
            }
            SessionError::ProfileNotFound(_) => ErrorKind::NotFound,
            SessionError::UpstreamNotInitialized
            | SessionError::Upstream(UpstreamError::NotInitialized) => ErrorKind::NotInitialized,
            SessionError::Upstream(err) if err.is_timeout() => ErrorKind::Timeout,
            SessionError::Upstream(_) => ErrorKind::Upstream,
            SessionError::UpstreamTimeout(_) => ErrorKind::Timeout,
            SessionError::Storage(StorageError::Source(SourceError::UnknownSource(_))) => {
                ErrorKind::NotFound
            }
            SessionError::Storage(StorageError::Source(SourceError::Invalid(_))) => {
                ErrorKind::Credential
            }
            SessionError::Storage(StorageError::ExtractTimeout(_)) => ErrorKind::Timeout,
            SessionError::Storage(_) => ErrorKind::Internal,
        }
    }
}

impl From<UpstreamError> for SessionError {
    fn from(err: UpstreamError) -> Self {
        match err {
            UpstreamError::NotInitialized => SessionError::UpstreamNotInitialized,
            other => SessionError::Upstream(other),
        }
    }
}

impl From<StorageError> for SessionError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::MissingCredentials { profile, missing } => {
                SessionError::CredentialMissing { profile, missing }
            }
            StorageError::ProfileNotFound(name) => SessionError::ProfileNotFound(name),
            other => SessionError::Storage(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cookiebridge_provider_core::UpstreamTransportErrorKind;

    #[test]
    fn kinds_follow_error_families() {
        let missing: SessionError = StorageError::MissingCredentials {
            profile: "p".to_string(),
            missing: vec!["a".to_string()],
        }
        .into();
        assert_eq!(missing.kind(), ErrorKind::Credential);

        let not_found: SessionError = StorageError::ProfileNotFound("p".to_string()).into();
        assert_eq!(not_found.kind(), ErrorKind::NotFound);

        let uninit: SessionError = UpstreamError::NotInitialized.into();
        assert_eq!(uninit.kind(), ErrorKind::NotInitialized);

        let read_timeout: SessionError = UpstreamError::Transport {
            kind: UpstreamTransportErrorKind::ReadTimeout,
            message: "idle".to_string(),
        }
        .into();
        assert_eq!(read_timeout.kind(), ErrorKind::Timeout);

        let auth: SessionError = UpstreamError::AuthFailure("401".to_string()).into();
        assert_eq!(auth.kind(), ErrorKind::Upstream);

        let serde_err = serde_json::from_str::<u8>("x").unwrap_err();
        let internal: SessionError = StorageError::Serde(serde_err).into();
        assert_eq!(internal.kind(), ErrorKind::Internal);
    }
}
