use std::io;

use thiserror::Error;
use tracing::error;

use crate::completion_queue::WcError;

/// Outcome side of a two-process scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Side {
    /// The listening process
    Passive,
    /// The connecting process
    Active,
}

impl std::fmt::Display for Side {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::Passive => write!(f, "passive"),
            Self::Active => write!(f, "active"),
        }
    }
}

/// Crate-wide error type.
///
/// `Skip` is not a failure: it means the hardware/driver combination cannot
/// run the scenario and the caller should report the test as skipped.
#[derive(Error, Debug)]
pub enum TestkitError {
    /// The scenario cannot run in this environment
    #[error("skipped: {0}")]
    Skip(String),
    /// A native verbs/rdmacm call failed
    #[error("verbs call failed: {0}")]
    Verbs(#[from] io::Error),
    /// A work request completed with a non-success status
    #[error("work completion failed: {0}")]
    Completion(#[from] WcError),
    /// A completion arrived with a status other than the expected one
    #[error("completion status {actual:?}, expected {expected:?}")]
    UnexpectedCompletion {
        /// Status the scenario required, `None` for success
        expected: Option<WcError>,
        /// Status actually observed, `None` for success
        actual: Option<WcError>,
    },
    /// `to_rts` was invoked before the peer identities were exchanged
    #[error("peer identities were not exchanged before the RTS transition")]
    PeerNotBound,
    /// Payload validation failed after traffic
    #[error("message validation failed: {0}")]
    BadPayload(String),
    /// One side of a two-process scenario exited with an exception code
    #[error("{side} side raised an exception")]
    SideException {
        /// Which child failed
        side: Side,
    },
    /// Neither child finished inside the polling budget
    #[error("handshake stuck, children had to be terminated")]
    StuckHandshake,
    /// A bad-flow scenario completed cleanly
    #[error("expected failure did not occur")]
    ExpectedFailureMissing,
}

impl TestkitError {
    /// Build a `Skip` from anything printable.
    #[inline]
    pub fn skip(reason: impl Into<String>) -> Self {
        Self::Skip(reason.into())
    }

    /// Whether this error means "report the scenario as skipped".
    #[inline]
    #[must_use]
    pub fn is_skip(&self) -> bool {
        matches!(*self, Self::Skip(_))
    }
}

/// Convenience alias used across the crate.
pub type TestkitResult<T> = Result<T, TestkitError>;

/// OS error codes that mean "the device/driver cannot do this at all".
/// Creation failures with these codes become skip outcomes, never test
/// failures.
const UNSUPPORTED_ERRNOS: [i32; 2] = [libc::EOPNOTSUPP, libc::EPROTONOSUPPORT];

/// Classify a resource-creation failure: the unsupported class converts to
/// `Skip`, everything else propagates as a hard verbs error.
pub(crate) fn classify_create_err(err: io::Error, what: &str) -> TestkitError {
    match err.raw_os_error() {
        Some(code) if UNSUPPORTED_ERRNOS.contains(&code) => {
            TestkitError::skip(format!("{what} is not supported (errno {code})"))
        }
        _ => TestkitError::Verbs(err),
    }
}

/// Capture the last OS error, log it with a note and return it.
pub(crate) fn log_ret_last_os_err(note: &str) -> io::Error {
    let err = io::Error::last_os_error();
    error!("OS error {:?} during {}", err, note);
    err
}

/// Capture the last OS error during teardown and only log it.
pub(crate) fn log_last_os_err(note: &str) {
    let err = io::Error::last_os_error();
    error!("OS error {:?} during {}", err, note);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_errno_becomes_skip() {
        let err = io::Error::from_raw_os_error(libc::EOPNOTSUPP);
        assert!(classify_create_err(err, "create qp").is_skip());
        let err = io::Error::from_raw_os_error(libc::EPROTONOSUPPORT);
        assert!(classify_create_err(err, "rdma connect").is_skip());
    }

    #[test]
    fn other_errno_stays_hard() {
        let err = io::Error::from_raw_os_error(libc::EINVAL);
        let classified = classify_create_err(err, "create qp");
        assert!(!classified.is_skip());
        assert!(matches!(classified, TestkitError::Verbs(_)));
    }

    #[test]
    fn skip_constructor_roundtrip() {
        let err = TestkitError::skip("no usable endpoint");
        assert!(err.is_skip());
        assert_eq!(err.to_string(), "skipped: no usable endpoint");
    }
}
