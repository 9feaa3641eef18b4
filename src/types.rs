/// Common types for the fact ledger.
///
/// This module defines the core data model: subject-predicate-object facts
/// partitioned by tenant and user, the scope hierarchy that bounds their
/// visibility, and the append-only audit record shape.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Visibility scope of a fact, from narrowest to broadest.
///
/// Scopes form a total order: `user < team < organization < global`. A
/// caller whose effective maximum scope is `S` may read facts at scope `S`
/// or narrower, and may not write above `S`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// Visible to the owning user only (default)
    #[default]
    User,
    /// Visible to the user's team
    Team,
    /// Visible across the organization
    Organization,
    /// Visible to every user of the tenant
    Global,
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scope::User => write!(f, "user"),
            Scope::Team => write!(f, "team"),
            Scope::Organization => write!(f, "organization"),
            Scope::Global => write!(f, "global"),
        }
    }
}

/// The fully-qualified key a fact is versioned under.
///
/// Invariant: at most one *active* fact exists per key at any time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FactKey {
    /// The tenant that owns the fact
    pub tenant_id: String,
    /// The user the fact is about
    pub user_id: String,
    /// Subject of the triple (e.g. "favorite_editor")
    pub subject: String,
    /// Predicate of the triple (e.g. "is")
    pub predicate: String,
}

impl FactKey {
    /// Create a new fact key.
    pub fn new(
        tenant_id: impl Into<String>,
        user_id: impl Into<String>,
        subject: impl Into<String>,
        predicate: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            user_id: user_id.into(),
            subject: subject.into(),
            predicate: predicate.into(),
        }
    }

    /// Canonical string representation, used in logs and error messages.
    ///
    /// Format: "tenant/user/subject/predicate"
    pub fn to_canonical_string(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.tenant_id, self.user_id, self.subject, self.predicate
        )
    }
}

/// Lifecycle state of a single fact version row.
///
/// Transitions are one-way: a row starts `Active` and moves to exactly one
/// of the terminal states. Rows are never edited in place or physically
/// deleted by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FactStatus {
    /// The current version for its key
    Active,
    /// Replaced by a newer version of the same key
    Superseded,
    /// Deactivated by the expiry sweeper after its TTL elapsed
    Expired,
    /// Soft-deleted by an authorized caller
    Deleted,
}

impl FactStatus {
    /// Whether a transition from `self` to `next` is permitted.
    ///
    /// Only `Active` rows may transition; every non-active state is terminal.
    pub fn can_transition_to(self, next: FactStatus) -> bool {
        self == FactStatus::Active && next != FactStatus::Active
    }
}

/// A stored, versioned fact about a user.
///
/// Every gated write appends a new row; updating a key deactivates the prior
/// row and appends one with `version = prior.version + 1`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fact {
    /// Unique row identifier
    pub id: Uuid,
    /// Tenant partition
    pub tenant_id: String,
    /// User the fact is about
    pub user_id: String,
    /// Subject of the triple
    pub subject: String,
    /// Predicate of the triple
    pub predicate: String,
    /// Object of the triple (arbitrary JSON)
    pub object: JsonValue,
    /// Extraction confidence in [0, 1]
    pub confidence: f64,
    /// Where the fact came from (e.g. "conversation")
    pub source: String,
    /// Monotonically increasing version per key, starting at 1
    pub version: u64,
    /// Lifecycle state of this row
    pub status: FactStatus,
    /// Visibility scope
    pub scope: Scope,
    /// When the fact stops counting as active, if a TTL applies
    pub expires_at: Option<DateTime<Utc>>,
    /// When this row was created
    pub created_at: DateTime<Utc>,
    /// When this row last changed state
    pub updated_at: DateTime<Utc>,
}

impl Fact {
    /// The key this fact is versioned under.
    pub fn key(&self) -> FactKey {
        FactKey::new(
            self.tenant_id.clone(),
            self.user_id.clone(),
            self.subject.clone(),
            self.predicate.clone(),
        )
    }

    /// Whether this row is the live version for its key.
    pub fn is_active(&self) -> bool {
        self.status == FactStatus::Active
    }

    /// Whether the TTL has elapsed as of `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(expiry) if expiry <= now)
    }

    /// Active and not past its TTL: the rows that count toward quotas and
    /// are visible to `retrieve`.
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.is_active() && !self.is_expired_at(now)
    }
}

/// A candidate fact supplied by a caller (or the extraction pipeline, which
/// is treated as just another caller).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateFact {
    /// Subject of the triple
    pub subject: String,
    /// Predicate of the triple
    pub predicate: String,
    /// Object of the triple
    pub object: JsonValue,
    /// Extraction confidence in [0, 1]
    pub confidence: f64,
    /// Provenance label
    pub source: String,
    /// Requested visibility scope
    pub scope: Scope,
}

impl CandidateFact {
    /// Create a candidate with the default scope and source.
    pub fn new(
        subject: impl Into<String>,
        predicate: impl Into<String>,
        object: JsonValue,
        confidence: f64,
    ) -> Self {
        Self {
            subject: subject.into(),
            predicate: predicate.into(),
            object,
            confidence,
            source: "conversation".to_string(),
            scope: Scope::User,
        }
    }

    /// Set the requested scope.
    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    /// Set the provenance label.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Structural validation, applied before any gate runs.
    ///
    /// Subject and predicate must be non-blank and confidence must lie in
    /// [0, 1]. Whitespace-only fields are rejected rather than trimmed to
    /// empty keys.
    pub fn validate(&self) -> Result<(), String> {
        if self.subject.trim().is_empty() {
            return Err("subject cannot be empty or whitespace".to_string());
        }
        if self.predicate.trim().is_empty() {
            return Err("predicate cannot be empty or whitespace".to_string());
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(format!(
                "confidence {} outside [0, 1]",
                self.confidence
            ));
        }
        Ok(())
    }
}

/// Result of a successful gated write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteReceipt {
    /// Id of the active row for the key
    pub id: Uuid,
    /// Version of the active row
    pub version: u64,
    /// True when the write was a no-op duplicate of the current value
    pub deduplicated: bool,
}

/// The kind of operation an audit entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ActionType {
    /// First version written for a key
    Ingest,
    /// A key superseded with a new version
    Update,
    /// Soft deletion of a fact
    Delete,
    /// Read of active facts
    Retrieve,
    /// TTL deactivation by the sweeper
    Expire,
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionType::Ingest => write!(f, "INGEST"),
            ActionType::Update => write!(f, "UPDATE"),
            ActionType::Delete => write!(f, "DELETE"),
            ActionType::Retrieve => write!(f, "RETRIEVE"),
            ActionType::Expire => write!(f, "EXPIRE"),
        }
    }
}

/// An immutable record of one attempted operation.
///
/// Entries are append-only: no update or delete path exists for them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Tenant the operation targeted
    pub tenant_id: String,
    /// User involved, when known
    pub user_id: Option<String>,
    /// What was attempted
    pub action_type: ActionType,
    /// Fact affected, when one exists
    pub fact_id: Option<Uuid>,
    /// SHA-256 hex digest of the caller's credential (never the raw key)
    pub actor_key_hash: String,
    /// Whether the operation succeeded
    pub success: bool,
    /// Machine-readable reason code on failure
    pub error: Option<String>,
    /// Role that granted the operation, when authorization succeeded
    pub role_name: Option<String>,
    /// Sanitized additional context
    pub metadata: Option<JsonValue>,
    /// When the entry was recorded
    pub timestamp: DateTime<Utc>,
}
