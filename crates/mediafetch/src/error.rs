use std::fmt;

use reqwest::StatusCode;

/// Coarse classification of a failure, consumed by [`crate::RetryPolicy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Connection resets, read timeouts, truncated bodies, 5xx and 429.
    TransientNetwork,
    /// 4xx responses that carry no retry hint.
    ServerRejected,
    /// 401 / 403.
    Authorization,
    /// Remote content changed between requests.
    InconsistentResource,
    /// A fragment exhausted its retry budget.
    FragmentUnrecoverable,
    /// Selection-time failure, raised before any network I/O.
    Selection,
    /// Local filesystem failure.
    Io,
    /// Overall job deadline exceeded.
    JobTimeout,
    Cancelled,
    Configuration,
    Postprocess,
    Extraction,
    /// Aggregate job-level failure.
    DownloadFailed,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::TransientNetwork => "transient network error",
            Self::ServerRejected => "server rejected request",
            Self::Authorization => "authorization failure",
            Self::InconsistentResource => "inconsistent resource",
            Self::FragmentUnrecoverable => "fragment unrecoverable",
            Self::Selection => "format selection",
            Self::Io => "I/O error",
            Self::JobTimeout => "job timeout",
            Self::Cancelled => "cancelled",
            Self::Configuration => "configuration error",
            Self::Postprocess => "postprocess error",
            Self::Extraction => "extraction error",
            Self::DownloadFailed => "download failed",
        };
        f.write_str(name)
    }
}

/// One group member that reached the terminal `failed` state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedMember {
    pub group_index: usize,
    pub descriptor_id: String,
    pub kind: ErrorKind,
    pub message: String,
}

impl fmt::Display for FailedMember {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "stream `{}` (group {}): {}: {}",
            self.descriptor_id, self.group_index, self.kind, self.message
        )
    }
}

fn join_members(members: &[FailedMember]) -> String {
    members
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

fn fallback_suffix(fallback_available: &bool) -> &'static str {
    if *fallback_available {
        " (fallback candidates remain)"
    } else {
        ""
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("download cancelled")]
    Cancelled,

    #[error("transient network error for {url}: {reason}")]
    TransientNetwork {
        url: String,
        reason: String,
        /// Server-provided `Retry-After` hint in seconds.
        retry_after_secs: Option<u64>,
    },

    #[error("request rejected with HTTP {status} for {url}")]
    ServerRejected { status: StatusCode, url: String },

    #[error("remote resource changed during download of {url}: {reason}")]
    InconsistentResource { url: String, reason: String },

    #[error("range not satisfiable (remote size: {total:?})")]
    RangeNotSatisfiable { total: Option<u64> },

    #[error("fragment {index} unrecoverable after {attempts} attempts: {reason}")]
    FragmentUnrecoverable {
        index: usize,
        attempts: u32,
        reason: String,
    },

    #[error("fetch of {url} failed after {attempts} attempts ({kind}): {reason}")]
    FetchFailed {
        kind: ErrorKind,
        attempts: u32,
        url: String,
        reason: String,
    },

    #[error("no format matches `{expression}`")]
    NoMatchingFormat { expression: String },

    #[error("cannot merge streams [{}]: {reason}", .group.join(", "))]
    AmbiguousMergeGroup { group: Vec<String>, reason: String },

    #[error("invalid format expression `{expression}` at {position}: {reason}")]
    InvalidExpression {
        expression: String,
        position: usize,
        reason: String,
    },

    #[error("download failed: {}{}", join_members(.failed_members), fallback_suffix(.fallback_available))]
    DownloadFailed {
        failed_members: Vec<FailedMember>,
        fallback_available: bool,
    },

    #[error("operation timed out: {reason}")]
    Timeout { reason: String },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("HTTP request failed: {source}")]
    Http {
        #[from]
        source: reqwest::Error,
    },

    #[error("invalid URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    #[error("postprocessing failed: {reason}")]
    Postprocess { reason: String },

    #[error("extraction failed: {reason}")]
    Extraction { reason: String },
}

impl EngineError {
    pub fn transient(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::TransientNetwork {
            url: url.into(),
            reason: reason.into(),
            retry_after_secs: None,
        }
    }

    pub fn server_rejected(status: StatusCode, url: impl Into<String>) -> Self {
        Self::ServerRejected {
            status,
            url: url.into(),
        }
    }

    pub fn inconsistent(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InconsistentResource {
            url: url.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_url(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    pub fn postprocess(reason: impl Into<String>) -> Self {
        Self::Postprocess {
            reason: reason.into(),
        }
    }

    pub fn timeout(reason: impl Into<String>) -> Self {
        Self::Timeout {
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Cancelled => ErrorKind::Cancelled,
            Self::TransientNetwork { .. } => ErrorKind::TransientNetwork,
            Self::ServerRejected { status, .. } => {
                if *status == StatusCode::UNAUTHORIZED || *status == StatusCode::FORBIDDEN {
                    ErrorKind::Authorization
                } else {
                    ErrorKind::ServerRejected
                }
            }
            Self::InconsistentResource { .. } | Self::RangeNotSatisfiable { .. } => {
                ErrorKind::InconsistentResource
            }
            Self::FragmentUnrecoverable { .. } => ErrorKind::FragmentUnrecoverable,
            Self::FetchFailed { kind, .. } => *kind,
            Self::NoMatchingFormat { .. }
            | Self::AmbiguousMergeGroup { .. }
            | Self::InvalidExpression { .. } => ErrorKind::Selection,
            Self::DownloadFailed { .. } => ErrorKind::DownloadFailed,
            Self::Timeout { .. } => ErrorKind::JobTimeout,
            Self::Io { .. } => ErrorKind::Io,
            Self::Http { source } => {
                if is_transient_reqwest_error(source) {
                    ErrorKind::TransientNetwork
                } else {
                    ErrorKind::ServerRejected
                }
            }
            Self::InvalidUrl { .. } | Self::Configuration { .. } => ErrorKind::Configuration,
            Self::Postprocess { .. } => ErrorKind::Postprocess,
            Self::Extraction { .. } => ErrorKind::Extraction,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::TransientNetwork
    }

    pub(crate) fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::TransientNetwork {
                retry_after_secs, ..
            } => *retry_after_secs,
            _ => None,
        }
    }
}

/// Connect, timeout, request and body errors are worth another attempt;
/// redirect loops and builder errors are not.
pub fn is_transient_reqwest_error(e: &reqwest::Error) -> bool {
    e.is_connect() || e.is_timeout() || e.is_request() || e.is_body() || e.is_decode()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authorization_statuses_are_classified_separately() {
        let err = EngineError::server_rejected(StatusCode::FORBIDDEN, "http://a/b");
        assert_eq!(err.kind(), ErrorKind::Authorization);
        assert!(!err.is_retryable());

        let err = EngineError::server_rejected(StatusCode::GONE, "http://a/b");
        assert_eq!(err.kind(), ErrorKind::ServerRejected);
    }

    #[test]
    fn download_failed_message_names_each_stream() {
        let err = EngineError::DownloadFailed {
            failed_members: vec![FailedMember {
                group_index: 0,
                descriptor_id: "137".to_string(),
                kind: ErrorKind::FragmentUnrecoverable,
                message: "fragment 2 unrecoverable".to_string(),
            }],
            fallback_available: false,
        };
        let message = err.to_string();
        assert!(message.contains("`137`"));
        assert!(message.contains("fragment unrecoverable"));
    }
}
