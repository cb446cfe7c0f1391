//! Error types for proctap.
//!
//! All fallible operations return [`TapError`]. Callers that only care about
//! the category of a failure (CLI exit codes, retry decisions) can match on
//! [`ErrorKind`] via [`TapError::kind`] instead of destructuring variants.

use std::time::Duration;

/// Errors surfaced by capture sessions and the conversion pipeline.
///
/// Errors during [`Session::start`](crate::Session::start) are returned
/// synchronously and leave the session in a failed state. Errors during a
/// running capture (device invalidation, helper crash) move the session to
/// the failed state and wake blocked readers with [`TapError::SessionStopped`];
/// the original cause is preserved via [`Session::last_error`](crate::Session::last_error).
#[derive(Debug, thiserror::Error)]
pub enum TapError {
    /// The capture target identifier is malformed (e.g. pid 0).
    #[error("invalid capture target: {reason}")]
    InvalidTarget {
        /// What was wrong with the identifier.
        reason: String,
    },

    /// No running process or application bundle matches the target.
    #[error("capture target not found: {target}")]
    TargetNotFound {
        /// The identifier that could not be resolved.
        target: String,
    },

    /// The host OS is below the version required for per-process capture.
    ///
    /// Windows 10 build 19041, macOS 13, or Linux with PipeWire/PulseAudio.
    #[error("unsupported OS: {reason}")]
    UnsupportedOs {
        /// Which requirement is not met.
        reason: String,
    },

    /// The OS refused the capture (TCC, sandbox, ACL).
    ///
    /// On macOS, check System Settings > Privacy & Security > Screen Recording.
    #[error("permission denied: {reason}")]
    PermissionDenied {
        /// OS-level detail where available.
        reason: String,
    },

    /// No capture strategy succeeded on this host.
    #[error("no capture backend available: {}", reasons.join("; "))]
    BackendUnavailable {
        /// One entry per strategy that was probed and failed.
        reasons: Vec<String>,
    },

    /// Asynchronous backend activation did not complete within the deadline.
    #[error("backend activation timed out after {timeout:?}")]
    BackendTimeout {
        /// The deadline that elapsed.
        timeout: Duration,
    },

    /// A previously healthy capture died mid-stream.
    ///
    /// Device invalidation on Windows, helper crash on macOS, subprocess
    /// exit on Linux. The session does not attempt recovery.
    #[error("capture backend lost: {reason}")]
    BackendLost {
        /// What was observed when the backend died.
        reason: String,
    },

    /// The requested conversion has no implemented path.
    #[error("unsupported format conversion: {reason}")]
    FormatUnsupported {
        /// Which stage rejected the request.
        reason: String,
    },

    /// The session is no longer running.
    #[error("session is stopped")]
    SessionStopped,

    /// The session has been closed; it cannot be used again.
    #[error("session is closed")]
    SessionClosed,

    /// Internal invariant violation. Diagnostic only; callers should treat
    /// this as a bug in proctap.
    #[error("internal error: {reason}")]
    Internal {
        /// The violated invariant.
        reason: String,
    },
}

/// The category of a [`TapError`], without payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`TapError::InvalidTarget`].
    InvalidTarget,
    /// See [`TapError::TargetNotFound`].
    TargetNotFound,
    /// See [`TapError::UnsupportedOs`].
    UnsupportedOs,
    /// See [`TapError::PermissionDenied`].
    PermissionDenied,
    /// See [`TapError::BackendUnavailable`].
    BackendUnavailable,
    /// See [`TapError::BackendTimeout`].
    BackendTimeout,
    /// See [`TapError::BackendLost`].
    BackendLost,
    /// See [`TapError::FormatUnsupported`].
    FormatUnsupported,
    /// See [`TapError::SessionStopped`].
    SessionStopped,
    /// See [`TapError::SessionClosed`].
    SessionClosed,
    /// See [`TapError::Internal`].
    Internal,
}

impl TapError {
    /// Returns the category of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidTarget { .. } => ErrorKind::InvalidTarget,
            Self::TargetNotFound { .. } => ErrorKind::TargetNotFound,
            Self::UnsupportedOs { .. } => ErrorKind::UnsupportedOs,
            Self::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            Self::BackendUnavailable { .. } => ErrorKind::BackendUnavailable,
            Self::BackendTimeout { .. } => ErrorKind::BackendTimeout,
            Self::BackendLost { .. } => ErrorKind::BackendLost,
            Self::FormatUnsupported { .. } => ErrorKind::FormatUnsupported,
            Self::SessionStopped => ErrorKind::SessionStopped,
            Self::SessionClosed => ErrorKind::SessionClosed,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Creates an invalid-target error.
    pub fn invalid_target(reason: impl Into<String>) -> Self {
        Self::InvalidTarget {
            reason: reason.into(),
        }
    }

    /// Creates a target-not-found error.
    pub fn target_not_found(target: impl Into<String>) -> Self {
        Self::TargetNotFound {
            target: target.into(),
        }
    }

    /// Creates a permission-denied error.
    pub fn permission_denied(reason: impl Into<String>) -> Self {
        Self::PermissionDenied {
            reason: reason.into(),
        }
    }

    /// Creates a backend-lost error.
    pub fn backend_lost(reason: impl Into<String>) -> Self {
        Self::BackendLost {
            reason: reason.into(),
        }
    }

    /// Creates an unsupported-conversion error.
    pub fn format_unsupported(reason: impl Into<String>) -> Self {
        Self::FormatUnsupported {
            reason: reason.into(),
        }
    }

    /// Creates an internal-invariant error.
    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    /// Clones the error for storage in `last_error`. `TapError` itself is
    /// intentionally `!Clone` so it can later grow `#[source]` chains.
    pub(crate) fn duplicate(&self) -> Self {
        match self {
            Self::InvalidTarget { reason } => Self::InvalidTarget {
                reason: reason.clone(),
            },
            Self::TargetNotFound { target } => Self::TargetNotFound {
                target: target.clone(),
            },
            Self::UnsupportedOs { reason } => Self::UnsupportedOs {
                reason: reason.clone(),
            },
            Self::PermissionDenied { reason } => Self::PermissionDenied {
                reason: reason.clone(),
            },
            Self::BackendUnavailable { reasons } => Self::BackendUnavailable {
                reasons: reasons.clone(),
            },
            Self::BackendTimeout { timeout } => Self::BackendTimeout { timeout: *timeout },
            Self::BackendLost { reason } => Self::BackendLost {
                reason: reason.clone(),
            },
            Self::FormatUnsupported { reason } => Self::FormatUnsupported {
                reason: reason.clone(),
            },
            Self::SessionStopped => Self::SessionStopped,
            Self::SessionClosed => Self::SessionClosed,
            Self::Internal { reason } => Self::Internal {
                reason: reason.clone(),
            },
        }
    }
}
