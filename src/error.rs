//! Error types for the ONTAP driver core
//!
//! Provides structured error types for every control-plane component:
//! appliance calls, access reconciliation, CHAP validation, pool admission
//! and the clone/snapshot lifecycle.

use std::time::Duration;
use thiserror::Error;

// =============================================================================
// Appliance API Errors
// =============================================================================

/// Stable classification of a failed management API call.
///
/// Callers branch on these codes, never on message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiErrorCode {
    /// Object does not exist
    NotFound,
    /// Object already exists (create of a duplicate)
    AlreadyExists,
    /// Initiator is already a member of the igroup
    AlreadyPresent,
    /// Initiator is not a member of the igroup
    NotPresent,
    /// Snapshot has dependent clones
    Busy,
    /// The appliance lost track of the job backing the request
    JobTrackingFailure,
    /// The management user lacks the privilege for this call
    InsufficientPrivilege,
    /// Volume is already offline
    VolumeOffline,
    /// Anything else
    Other,
}

impl std::fmt::Display for ApiErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ApiErrorCode::NotFound => "not-found",
            ApiErrorCode::AlreadyExists => "already-exists",
            ApiErrorCode::AlreadyPresent => "already-present",
            ApiErrorCode::NotPresent => "not-present",
            ApiErrorCode::Busy => "busy",
            ApiErrorCode::JobTrackingFailure => "job-tracking-failure",
            ApiErrorCode::InsufficientPrivilege => "insufficient-privilege",
            ApiErrorCode::VolumeOffline => "volume-offline",
            ApiErrorCode::Other => "other",
        };
        write!(f, "{}", s)
    }
}

/// A classified failure returned by the management client
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("[{code}] {message}")]
pub struct ApiError {
    pub code: ApiErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ApiErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ApiErrorCode::NotFound, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(ApiErrorCode::Other, message)
    }

    #[inline]
    pub fn is(&self, code: ApiErrorCode) -> bool {
        self.code == code
    }
}

// =============================================================================
// Driver Errors
// =============================================================================

/// Unified error type for the driver core
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal / Validation Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    // =========================================================================
    // Appliance Errors
    // =========================================================================
    #[error("{operation} failed for {resource}: {source}")]
    Api {
        operation: String,
        resource: String,
        #[source]
        source: ApiError,
    },

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    #[error("Resource already exists: {kind}/{name}")]
    ResourceExists { kind: String, name: String },

    #[error("Snapshot {snapshot} does not exist in volume {volume}")]
    SnapshotNotFound { snapshot: String, volume: String },

    #[error("Timed out after {duration:?} waiting for {operation} on {resource}")]
    Timeout {
        operation: String,
        resource: String,
        duration: Duration,
    },

    // =========================================================================
    // Admission Errors
    // =========================================================================
    #[error("Backend ineligible for volume {volume}: {reason}")]
    BackendIneligible { volume: String, reason: String },

    #[error("Could not find pool {pool}")]
    PoolNotFound { pool: String },

    #[error("Aggregate {aggregate}: usage of {percent_used:.2} % {verb} the limit of {limit:.2} %")]
    AggregateLimitExceeded {
        aggregate: String,
        percent_used: f64,
        limit: f64,
        verb: &'static str,
    },

    #[error("Requested volume size ({requested} bytes) is too small; the minimum volume size is {minimum} bytes")]
    VolumeTooSmall { requested: u64, minimum: u64 },

    #[error("Capacity parse error: {0}")]
    CapacityParse(String),

    // =========================================================================
    // CHAP Errors
    // =========================================================================
    #[error("CHAP error: {0}")]
    Chap(String),

    // =========================================================================
    // Parse / IO Errors
    // =========================================================================
    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse taxonomy used by callers to decide how to react to an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    AlreadyExists,
    Busy,
    InsufficientPrivilege,
    Timeout,
    Ineligible,
    Transient,
}

/// Action the upstream orchestrator should take on error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
    /// This backend cannot host the request; try another one
    TryOtherBackend,
}

impl Error {
    /// Wrap an appliance failure with the operation and resource it concerned
    pub fn api(operation: impl Into<String>, resource: impl Into<String>, source: ApiError) -> Self {
        Error::Api {
            operation: operation.into(),
            resource: resource.into(),
            source,
        }
    }

    /// The appliance error code, if this error came from the appliance
    pub fn api_code(&self) -> Option<ApiErrorCode> {
        match self {
            Error::Api { source, .. } => Some(source.code),
            _ => None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Configuration(_)
            | Error::Validation(_)
            | Error::CapacityParse(_)
            | Error::VolumeTooSmall { .. }
            | Error::SnapshotNotFound { .. }
            | Error::Chap(_)
            | Error::YamlParse(_)
            | Error::JsonParse(_) => ErrorKind::Validation,

            Error::ResourceNotFound { .. } | Error::PoolNotFound { .. } => ErrorKind::NotFound,
            Error::ResourceExists { .. } => ErrorKind::AlreadyExists,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::BackendIneligible { .. } | Error::AggregateLimitExceeded { .. } => {
                ErrorKind::Ineligible
            }

            Error::Api { source, .. } => match source.code {
                ApiErrorCode::NotFound => ErrorKind::NotFound,
                ApiErrorCode::AlreadyExists | ApiErrorCode::AlreadyPresent => {
                    ErrorKind::AlreadyExists
                }
                ApiErrorCode::Busy => ErrorKind::Busy,
                ApiErrorCode::InsufficientPrivilege => ErrorKind::InsufficientPrivilege,
                _ => ErrorKind::Transient,
            },

            Error::Internal(_) | Error::Io(_) => ErrorKind::Transient,
        }
    }

    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self.kind() {
            // Busy snapshots unblock once the background split finishes
            ErrorKind::Busy => ErrorAction::RequeueAfter(Duration::from_secs(30)),

            ErrorKind::Ineligible => ErrorAction::TryOtherBackend,

            // Configuration/validation errors - don't retry automatically
            ErrorKind::Validation
            | ErrorKind::AlreadyExists
            | ErrorKind::InsufficientPrivilege
            | ErrorKind::Timeout => ErrorAction::NoRequeue,

            ErrorKind::NotFound | ErrorKind::Transient => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable on the same backend
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.action(),
            ErrorAction::RequeueWithBackoff | ErrorAction::RequeueAfter(_)
        )
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Check if the backend should be skipped rather than retried
    pub fn is_ineligible(&self) -> bool {
        self.kind() == ErrorKind::Ineligible
    }

    pub fn is_busy(&self) -> bool {
        self.kind() == ErrorKind::Busy
    }
}

/// Result type alias for the driver core
pub type Result<T> = std::result::Result<T, Error>;
