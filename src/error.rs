/// Error types for gated fact-store operations.
///
/// Every failure mode a caller can observe is covered here. Gate rejections
/// carry a machine-readable reason and never leak data belonging to another
/// tenant. The HTTP boundary (out of scope for this crate) maps variants to
/// status codes via [`GateError::status_code`].
use thiserror::Error;

/// The main error type for gate pipeline operations.
///
/// All fallible operations return `Result<T, GateError>`. Transient errors
/// (`RateLimited`, `VersionConflict`) may be retried by the caller; policy
/// and authorization rejections require caller-side correction.
#[derive(Error, Debug)]
pub enum GateError {
    /// The caller holds no role granting the required permission or scope
    #[error("Authorization denied: {reason}")]
    AuthorizationDenied {
        /// Why the request was denied (permission or scope)
        reason: String,
    },

    /// The tenant's rate-limit bucket is empty
    #[error("Rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited {
        /// Seconds until enough tokens have refilled for one request
        retry_after_secs: u64,
    },

    /// A tenant policy check rejected the candidate fact
    #[error("Policy violation: {0}")]
    Policy(#[from] PolicyViolation),

    /// A writer timed out waiting for a contended key lock
    #[error("Version conflict on key '{key}' after {attempts} attempts")]
    VersionConflict {
        /// Canonical fact key that was contended
        key: String,
        /// Number of acquisition attempts made before the wait timed out
        attempts: u32,
    },

    /// No active fact exists with the given id
    #[error("Fact '{id}' not found")]
    FactNotFound {
        /// The fact id that was looked up
        id: uuid::Uuid,
    },

    /// No fact history exists for the given key
    #[error("No history for key '{key}'")]
    KeyNotFound {
        /// Canonical fact key that was queried
        key: String,
    },

    /// The candidate fact failed structural validation
    #[error("Invalid candidate: {reason}")]
    InvalidCandidate {
        /// Description of the validation failure
        reason: String,
    },

    /// Serialization error when converting data to/from JSON
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Storage or persistence operation failed
    #[error("Storage error: {0}")]
    Storage(String),
}

impl GateError {
    /// Suggested HTTP status code for the boundary layer.
    pub fn status_code(&self) -> u16 {
        match self {
            GateError::AuthorizationDenied { .. } => 403,
            GateError::RateLimited { .. } => 429,
            GateError::Policy(_) | GateError::InvalidCandidate { .. } => 422,
            GateError::VersionConflict { .. } => 409,
            GateError::FactNotFound { .. } | GateError::KeyNotFound { .. } => 404,
            GateError::Serialization(_) | GateError::Storage(_) => 500,
        }
    }

    /// Stable machine-readable reason code.
    pub fn reason_code(&self) -> &'static str {
        match self {
            GateError::AuthorizationDenied { .. } => "AuthDenied",
            GateError::RateLimited { .. } => "RateLimited",
            GateError::Policy(v) => v.reason_code(),
            GateError::VersionConflict { .. } => "VersionConflict",
            GateError::FactNotFound { .. } => "FactNotFound",
            GateError::KeyNotFound { .. } => "KeyNotFound",
            GateError::InvalidCandidate { .. } => "InvalidCandidate",
            GateError::Serialization(_) => "SerializationError",
            GateError::Storage(_) => "StorageError",
        }
    }
}

/// A tenant policy rejection.
///
/// Checks run in a fixed order (predicate, confidence, user quota, tenant
/// quota) and the first failure wins, so a caller sees exactly one violation
/// per attempt.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PolicyViolation {
    /// The tenant maintains a predicate whitelist and this predicate is absent
    #[error("Predicate '{predicate}' is not in the tenant's allowed list")]
    PredicateNotAllowed {
        /// The rejected predicate
        predicate: String,
    },

    /// Candidate confidence is below the tenant's minimum threshold
    #[error("Confidence {confidence:.2} below minimum threshold {threshold:.2}")]
    ConfidenceTooLow {
        /// The candidate's confidence
        confidence: f64,
        /// The tenant's configured minimum
        threshold: f64,
    },

    /// The user already holds the maximum number of active facts
    #[error("User quota exceeded: {count}/{limit} active memories")]
    UserQuotaExceeded {
        /// Current active count for the user
        count: usize,
        /// Configured per-user limit
        limit: usize,
    },

    /// The tenant already holds the maximum number of active facts
    #[error("Tenant quota exceeded: {count}/{limit} active memories")]
    TenantQuotaExceeded {
        /// Current active count for the tenant
        count: usize,
        /// Configured per-tenant limit
        limit: usize,
    },
}

impl PolicyViolation {
    /// Stable machine-readable reason code.
    pub fn reason_code(&self) -> &'static str {
        match self {
            PolicyViolation::PredicateNotAllowed { .. } => "PredicateNotAllowed",
            PolicyViolation::ConfidenceTooLow { .. } => "ConfidenceTooLow",
            PolicyViolation::UserQuotaExceeded { .. } => "UserQuotaExceeded",
            PolicyViolation::TenantQuotaExceeded { .. } => "TenantQuotaExceeded",
        }
    }
}

/// Result type alias for gate operations.
pub type GateResult<T> = Result<T, GateError>;
