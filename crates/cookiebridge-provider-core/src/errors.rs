use std::error::Error;
use std::fmt;

pub type UpstreamResult<T> = Result<T, UpstreamError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum UpstreamTransportErrorKind {
    Timeout,
    ReadTimeout,
    Connect,
    Dns,
    Tls,
    Other,
}

impl UpstreamTransportErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::ReadTimeout => "read_timeout",
            Self::Connect => "connect",
            Self::Dns => "dns",
            Self::Tls => "tls",
            Self::Other => "other",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamError {
    /// No connection has been opened yet.
    NotInitialized,
    /// The upstream rejected the session credentials.
    AuthFailure(String),
    /// The upstream did not answer in time.
    Timeout,
    /// Transport-level failures (no HTTP response).
    Transport {
        kind: UpstreamTransportErrorKind,
        message: String,
    },
    /// Non-2xx response captured as text.
    Http { status: u16, body: String },
    /// A 2xx response whose payload could not be understood.
    Protocol(String),
    /// The connection was closed while in use.
    Closed,
}

impl UpstreamError {
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::Timeout
                | Self::Transport {
                    kind: UpstreamTransportErrorKind::Timeout
                        | UpstreamTransportErrorKind::ReadTimeout,
                    ..
                }
        )
    }

    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => Self::AuthFailure(format!("upstream returned {status}")),
            _ => Self::Http { status, body },
        }
    }
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamError::NotInitialized => write!(f, "upstream not initialized"),
            UpstreamError::AuthFailure(msg) => write!(f, "upstream auth failure: {msg}"),
            UpstreamError::Timeout => write!(f, "upstream timed out"),
            UpstreamError::Transport { kind, message } => {
                write!(f, "upstream transport error ({}): {message}", kind.as_str())
            }
            UpstreamError::Http { status, body } => {
                write!(f, "upstream http {status}: {body}")
            }
            UpstreamError::Protocol(msg) => write!(f, "upstream protocol error: {msg}"),
            UpstreamError::Closed => write!(f, "upstream connection closed"),
        }
    }
}

impl Error for UpstreamError {}

/// Failure of an external credential source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// The source label is not known to this source.
    UnknownSource(String),
    Unavailable(String),
    Invalid(String),
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceError::UnknownSource(label) => write!(f, "unknown credential source: {label}"),
            SourceError::Unavailable(msg) => write!(f, "credential source unavailable: {msg}"),
            SourceError::Invalid(msg) => write!(f, "invalid credential data: {msg}"),
        }
    }
}

impl Error for SourceError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_statuses_become_auth_failures() {
        assert!(matches!(
            UpstreamError::from_status(401, String::new()),
            UpstreamError::AuthFailure(_)
        ));
        assert_eq!(
            UpstreamError::from_status(500, "boom".to_string()),
            UpstreamError::Http {
                status: 500,
                body: "boom".to_string()
            }
        );
    }

    #[test]
    fn read_timeouts_count_as_timeouts() {
        let err = UpstreamError::Transport {
            kind: UpstreamTransportErrorKind::ReadTimeout,
            message: "idle".to_string(),
        };
        assert!(err.is_timeout());
        assert!(!UpstreamError::Closed.is_timeout());
    }
}
