// SPDX-License-Identifier: MIT

//! The error taxonomy from spec.md §7. Error *kinds* are the contract;
//! message text is informational (spec.md §9's "string-heavy error
//! messaging" design note).

use thiserror::Error;

/// The enumerated error codes surfaced to callers (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    RateLimited,
    DegradedMode,
    CbOpen,
    LockContention,
    InvalidLockName,
    BootAborted,
    IntegrityFailed,
    LoopDetected,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::DegradedMode => "DEGRADED_MODE",
            ErrorCode::CbOpen => "CB_OPEN",
            ErrorCode::LockContention => "LOCK_CONTENTION",
            ErrorCode::InvalidLockName => "INVALID_LOCK_NAME",
            ErrorCode::BootAborted => "BOOT_ABORTED",
            ErrorCode::IntegrityFailed => "INTEGRITY_FAILED",
            ErrorCode::LoopDetected => "LOOP_DETECTED",
        };
        f.write_str(s)
    }
}

/// Failure classification used by the circuit breaker (spec.md §3.4, §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Transient,
    Permanent,
    Expected,
    External,
    RateLimited,
}

/// The taxonomized kernel error. Kinds carry the admission/contention/
/// integrity/external/fatal split from spec.md §7; `code()` exposes the
/// stable enumerated identifier for callers that branch on it.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("operating mode is degraded; write capability rejected")]
    DegradedMode,

    #[error("circuit breaker open for scope {scope}")]
    CircuitOpen { scope: String },

    #[error("lock '{name}' is held by another owner")]
    LockContention { name: String },

    #[error("lock name '{name}' is invalid")]
    InvalidLockName { name: String },

    #[error("dedup key '{key}' already has a conflicting pending entry")]
    DedupConflict { key: String },

    #[error("boot aborted: {reason}")]
    BootAborted { reason: String },

    #[error("integrity check failed: {reason}")]
    IntegrityFailed { reason: String },

    #[error("restore loop detected, entering degraded mode")]
    LoopDetected,

    #[error("transient external failure: {0}")]
    Transient(String),

    #[error("permanent external failure: {0}")]
    Permanent(String),

    #[error("expected external condition: {0}")]
    Expected(String),

    #[error("data directory error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("fatal infrastructure error: {0}")]
    Fatal(String),
}

impl KernelError {
    /// The stable enumerated code for this error, where one applies.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            KernelError::RateLimited { .. } => Some(ErrorCode::RateLimited),
            KernelError::DegradedMode => Some(ErrorCode::DegradedMode),
            KernelError::CircuitOpen { .. } => Some(ErrorCode::CbOpen),
            KernelError::LockContention { .. } => Some(ErrorCode::LockContention),
            KernelError::InvalidLockName { .. } => Some(ErrorCode::InvalidLockName),
            KernelError::BootAborted { .. } => Some(ErrorCode::BootAborted),
            KernelError::IntegrityFailed { .. } => Some(ErrorCode::IntegrityFailed),
            KernelError::LoopDetected => Some(ErrorCode::LoopDetected),
            _ => None,
        }
    }

    /// Classify this error into a [`FailureClass`] using the default
    /// status-free mapping; callers with richer context (HTTP status,
    /// headers) should go through the breaker's classifier instead.
    pub fn default_class(&self) -> FailureClass {
        match self {
            KernelError::RateLimited { .. } => FailureClass::RateLimited,
            KernelError::Expected(_) => FailureClass::Expected,
            KernelError::Permanent(_) => FailureClass::Permanent,
            KernelError::Io(_) => FailureClass::External,
            _ => FailureClass::Transient,
        }
    }
}
