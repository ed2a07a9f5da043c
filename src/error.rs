//! Failure taxonomy for background cache population.
//!
//! None of these reach the client: the request that triggered a populate has
//! already been routed to the origin.  They are logged, counted and handed to
//! any task waiting on the in-flight entry.  Path problems are caught earlier
//! by [`PathResolutionError`](crate::cache::key::PathResolutionError).

use std::path::PathBuf;

/// Why a populate attempt ended without publishing an artifact.
#[derive(Debug, thiserror::Error)]
pub enum PopulateError {
    /// Transport-level failure talking to the origin, including a body
    /// stream that broke off mid-transfer.
    #[error("fetch from {url} failed: {source}")]
    Fetch {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The origin answered with a non-success status.
    #[error("origin returned {status} for {url}")]
    UpstreamStatus {
        url: String,
        status: reqwest::StatusCode,
    },

    /// Creating, writing or publishing the local file failed.
    #[error("cache write to {} failed: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configured populate deadline elapsed.
    #[error("populate timed out after {secs}s")]
    Timeout { secs: u64 },

    /// Shutdown cancelled the attempt before it finished.
    #[error("populate cancelled by shutdown")]
    Cancelled,
}

impl PopulateError {
    /// Short stable label used for metrics and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Fetch { .. } => "fetch_error",
            Self::UpstreamStatus { .. } => "upstream_status",
            Self::Write { .. } => "write_error",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled => "cancelled",
        }
    }

    pub(crate) fn write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Write {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_error_names_the_path() {
        let err = PopulateError::write(
            "/var/cache/tarcache/pkg/-/pkg-1.0.0.tgz",
            std::io::Error::other("disk full"),
        );
        assert_eq!(err.kind(), "write_error");
        let msg = err.to_string();
        assert!(msg.contains("/var/cache/tarcache/pkg/-/pkg-1.0.0.tgz"));
        assert!(msg.contains("disk full"));
    }

    #[test]
    fn status_error_message() {
        let err = PopulateError::UpstreamStatus {
            url: "http://origin/pkg/-/pkg-1.0.0.tgz".into(),
            status: reqwest::StatusCode::INTERNAL_SERVER_ERROR,
        };
        assert_eq!(err.kind(), "upstream_status");
        assert!(err.to_string().contains("500"));
    }
}
