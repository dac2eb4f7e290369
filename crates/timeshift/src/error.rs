use reqwest::StatusCode;

/// Classification of a failed operation, used for retry decisions and
/// per-category accounting in the downloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    /// Connection, DNS, or transport-level failure.
    Network,
    /// Upstream returned a 5xx status.
    Server,
    /// Upstream returned a 4xx status.
    Client,
    /// The request or body read exceeded its deadline.
    Timeout,
    /// The response body was empty or unparseable.
    Content,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Network => "network",
            ErrorCategory::Server => "server",
            ErrorCategory::Client => "client",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Content => "content",
            ErrorCategory::Unknown => "unknown",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TimeShiftError {
    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("request failed with HTTP {status} for {url}")]
    HttpStatus { status: StatusCode, url: String },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("playlist error: {reason}")]
    Playlist { reason: String },

    #[error("segment fetch error: {reason}")]
    SegmentFetch {
        reason: String,
        category: ErrorCategory,
    },

    #[error("configuration error: {reason}")]
    Configuration { reason: String },
}

pub type Result<T> = std::result::Result<T, TimeShiftError>;

impl TimeShiftError {
    pub fn invalid_url(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn playlist(reason: impl Into<String>) -> Self {
        Self::Playlist {
            reason: reason.into(),
        }
    }

    pub fn segment_fetch(reason: impl Into<String>, category: ErrorCategory) -> Self {
        Self::SegmentFetch {
            reason: reason.into(),
            category,
        }
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    /// Classify this error for retry accounting.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Network { source } => categorize_reqwest(source),
            Self::HttpStatus { status, .. } => categorize_status(*status),
            Self::SegmentFetch { category, .. } => *category,
            Self::Playlist { .. } => ErrorCategory::Content,
            _ => ErrorCategory::Unknown,
        }
    }

    /// Whether a retry may succeed.
    ///
    /// Retryable: network failures, 5xx, timeouts, and the client codes
    /// 408 and 429. Everything else is terminal.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Cancelled => false,
            Self::InvalidUrl { .. } | Self::Configuration { .. } => false,
            Self::HttpStatus { status, .. } => is_retryable_status(*status),
            Self::SegmentFetch { category, .. } => matches!(
                category,
                ErrorCategory::Network | ErrorCategory::Server | ErrorCategory::Timeout
            ),
            Self::Network { source } => is_retryable_reqwest_error(source),
            Self::Io { .. } | Self::Playlist { .. } => true,
        }
    }
}

/// Classify a reqwest error.
pub fn categorize_reqwest(e: &reqwest::Error) -> ErrorCategory {
    if e.is_timeout() {
        ErrorCategory::Timeout
    } else if e.is_connect() || e.is_request() {
        ErrorCategory::Network
    } else if e.is_body() || e.is_decode() {
        ErrorCategory::Content
    } else if let Some(status) = e.status() {
        categorize_status(status)
    } else {
        ErrorCategory::Unknown
    }
}

/// Classify an HTTP status code.
pub fn categorize_status(status: StatusCode) -> ErrorCategory {
    if status.is_server_error() {
        ErrorCategory::Server
    } else if status == StatusCode::REQUEST_TIMEOUT {
        ErrorCategory::Timeout
    } else if status.is_client_error() {
        ErrorCategory::Client
    } else {
        ErrorCategory::Unknown
    }
}

/// A status is worth retrying when it is a 5xx, 408, or 429.
pub fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
}

/// Transport-level reqwest failures worth retrying: connection, timeout,
/// request, and body/decode errors. Builder and redirect errors are not.
pub fn is_retryable_reqwest_error(e: &reqwest::Error) -> bool {
    e.is_connect() || e.is_timeout() || e.is_request() || e.is_body() || e.is_decode()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_are_retryable() {
        assert!(is_retryable_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(is_retryable_status(StatusCode::BAD_GATEWAY));
        assert!(is_retryable_status(StatusCode::SERVICE_UNAVAILABLE));
    }

    #[test]
    fn throttling_client_codes_are_retryable() {
        assert!(is_retryable_status(StatusCode::REQUEST_TIMEOUT));
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
    }

    #[test]
    fn plain_client_errors_are_terminal() {
        assert!(!is_retryable_status(StatusCode::NOT_FOUND));
        assert!(!is_retryable_status(StatusCode::FORBIDDEN));
        assert!(!is_retryable_status(StatusCode::GONE));
    }

    #[test]
    fn status_categories() {
        assert_eq!(
            categorize_status(StatusCode::BAD_GATEWAY),
            ErrorCategory::Server
        );
        assert_eq!(
            categorize_status(StatusCode::NOT_FOUND),
            ErrorCategory::Client
        );
        assert_eq!(
            categorize_status(StatusCode::REQUEST_TIMEOUT),
            ErrorCategory::Timeout
        );
    }

    #[test]
    fn fetch_error_retryability_follows_category() {
        let retryable = TimeShiftError::segment_fetch("503 upstream", ErrorCategory::Server);
        assert!(retryable.is_retryable());

        let terminal = TimeShiftError::segment_fetch("410 gone", ErrorCategory::Client);
        assert!(!terminal.is_retryable());

        let content = TimeShiftError::segment_fetch("empty body", ErrorCategory::Content);
        assert!(!content.is_retryable());
    }
}
