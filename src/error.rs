//! Error types for usenet-ul
//!
//! This module provides error handling for the upload engine, including:
//! - The crate-level [`Error`] type covering configuration, pipeline, and
//!   run-fatal conditions
//! - The wire-level [`ConnectionError`] taxonomy surfaced by the consumed
//!   connection capability
//! - The [`SkipClass`] allow-list of failure classes that may be tolerated
//!   (counted and skipped) instead of aborting the run

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for usenet-ul operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for usenet-ul
///
/// Per-article failures are reported through each article's completion
/// outcome; only run-fatal conditions surface through this type from
/// [`Uploader::wait`](crate::Uploader::wait).
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "check.tries")
        key: Option<String>,
    },

    /// NNTP connection or protocol error escalated from a worker
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Every posting connection has failed; the run cannot continue
    #[error("no connections available for uploading, process terminated")]
    NoPostConnections,

    /// Every checking connection has failed; the run cannot continue
    #[error("no connections available for checking, process terminated")]
    NoCheckConnections,

    /// A posted article could not be found after exhausting check and post
    /// retries, and the failure class is not tolerated
    #[error("posted article {message_id} could not be found")]
    ArticleNotFound {
        /// Message-id assigned when the article was posted
        message_id: String,
    },

    /// The configured maximum number of skipped article errors was exceeded
    #[error("maximum error count reached, upload process aborted")]
    MaxErrorsExceeded,

    /// Re-fetching a released article payload failed
    #[error("article reload failed: {0}")]
    Reload(String),

    /// The run was cancelled by request
    #[error("upload cancelled: {0}")]
    Cancelled(String),

    /// Pipeline bookkeeping violated an internal invariant (bug)
    #[error("internal error: {0}")]
    Internal(String),
}

/// Failure kinds surfaced by the consumed connection capability
///
/// Implementations of [`NntpConnection`](crate::connection::NntpConnection)
/// classify every failure into exactly one of these kinds; the engine never
/// inspects protocol details beyond this taxonomy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The operation did not complete within the connection's own deadline
    Timeout,
    /// Establishing or re-establishing the TCP/TLS session failed
    ConnectFail,
    /// The server refused the posted article (e.g., 441)
    PostDenied,
    /// The server replied with something the client could not interpret
    BadResponse,
    /// Unclassified protocol failure
    UnknownError,
    /// The server closed the connection mid-operation
    ConnectionEnded,
    /// The operation was attempted on a connection that is not open
    NotConnected,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::ConnectFail => "connect_fail",
            ErrorKind::PostDenied => "post_denied",
            ErrorKind::BadResponse => "bad_response",
            ErrorKind::UnknownError => "unknown_error",
            ErrorKind::ConnectionEnded => "connection_ended",
            ErrorKind::NotConnected => "not_connected",
        };
        f.write_str(s)
    }
}

/// A classified failure from the connection capability
#[derive(Clone, Debug, Error)]
#[error("{kind}: {message}")]
pub struct ConnectionError {
    /// Which class of failure occurred
    pub kind: ErrorKind,
    /// Human-readable detail from the underlying implementation
    pub message: String,
}

impl ConnectionError {
    /// Create a new connection error of the given kind
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Whether this error represents a failure of the post operation itself
    /// rather than of the connection carrying it
    ///
    /// Transport-level kinds (connect failure, connection ended, not
    /// connected) are never post failures: the article was likely never
    /// seen by the server.
    pub fn is_post_failure(&self) -> bool {
        !matches!(
            self.kind,
            ErrorKind::ConnectFail | ErrorKind::ConnectionEnded | ErrorKind::NotConnected
        )
    }
}

/// Failure classes that may be tolerated instead of aborting the run
///
/// A tolerated failure finalizes its article with an error flag and the
/// pipeline continues; an untolerated one is fatal to the connection or the
/// whole run. Unknown names are rejected at configuration load time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkipClass {
    /// Posting timed out
    PostTimeout,
    /// The server rejected the article (denied / bad response / unknown)
    PostReject,
    /// Posting failed for any non-transport reason
    PostFail,
    /// The verification query timed out
    CheckTimeout,
    /// The posted article could not be found after all retries
    CheckMissing,
    /// The verification query returned a protocol error
    CheckFail,
    /// A connection could not be established
    ConnectFail,
}

impl SkipClass {
    /// All skip classes, in declaration order
    pub const ALL: [SkipClass; 7] = [
        SkipClass::PostTimeout,
        SkipClass::PostReject,
        SkipClass::PostFail,
        SkipClass::CheckTimeout,
        SkipClass::CheckMissing,
        SkipClass::CheckFail,
        SkipClass::ConnectFail,
    ];
}

/// Compiled membership table of tolerated failure classes
///
/// Built once at construction from
/// [`SkipErrorsConfig`](crate::config::SkipErrorsConfig); lookups are a
/// fixed-size array index.
#[derive(Clone, Copy, Debug, Default)]
pub struct SkipSet {
    tolerated: [bool; 7],
}

impl SkipSet {
    /// An empty set: no failure class is tolerated
    pub fn none() -> Self {
        Self::default()
    }

    /// The full set: every failure class is tolerated
    pub fn all() -> Self {
        Self {
            tolerated: [true; 7],
        }
    }

    /// Build a set from an explicit list of classes
    pub fn from_classes(classes: &[SkipClass]) -> Self {
        let mut set = Self::default();
        for class in classes {
            set.tolerated[*class as usize] = true;
        }
        set
    }

    /// Whether the given failure class is tolerated
    pub fn contains(&self, class: SkipClass) -> bool {
        self.tolerated[class as usize]
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_failure_excludes_transport_kinds() {
        for kind in [
            ErrorKind::ConnectFail,
            ErrorKind::ConnectionEnded,
            ErrorKind::NotConnected,
        ] {
            assert!(!ConnectionError::new(kind, "x").is_post_failure());
        }
        for kind in [
            ErrorKind::Timeout,
            ErrorKind::PostDenied,
            ErrorKind::BadResponse,
            ErrorKind::UnknownError,
        ] {
            assert!(ConnectionError::new(kind, "x").is_post_failure());
        }
    }

    #[test]
    fn skip_set_membership() {
        let set = SkipSet::from_classes(&[SkipClass::PostTimeout, SkipClass::CheckMissing]);
        assert!(set.contains(SkipClass::PostTimeout));
        assert!(set.contains(SkipClass::CheckMissing));
        assert!(!set.contains(SkipClass::ConnectFail));

        assert!(SkipSet::all().contains(SkipClass::CheckFail));
        assert!(!SkipSet::none().contains(SkipClass::CheckFail));
    }

    #[test]
    fn skip_class_kebab_case_names() {
        let parsed: SkipClass = serde_json::from_str("\"post-timeout\"").unwrap();
        assert_eq!(parsed, SkipClass::PostTimeout);

        // Unknown names are rejected at deserialization time
        assert!(serde_json::from_str::<SkipClass>("\"post-explode\"").is_err());
    }
}
