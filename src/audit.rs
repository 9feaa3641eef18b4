/// Append-only audit trail.
///
/// Every gated operation, allowed or denied, produces exactly one entry.
/// Entries are partitioned per tenant and never mutated or removed; there is
/// deliberately no update or delete path in this module.
///
/// Recording is infallible from the caller's point of view: audit problems
/// are logged, never turned into operation failures.
use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use tracing::warn;
use uuid::Uuid;

use crate::types::{ActionType, AuditEntry};

/// Metadata keys that must never reach the audit trail.
const SENSITIVE_METADATA_KEYS: &[&str] = &["conversation_text", "api_key", "password"];

/// SHA-256 hex digest of a caller credential.
///
/// The audit trail stores this digest, never the raw key, so entries can be
/// correlated to a caller without the trail becoming a credential store.
pub fn hash_actor_key(credential: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(credential.as_bytes());
    hex::encode(hasher.finalize())
}

/// Drop sensitive keys from caller-supplied metadata.
fn sanitize_metadata(metadata: JsonValue) -> JsonValue {
    match metadata {
        JsonValue::Object(mut map) => {
            for key in SENSITIVE_METADATA_KEYS {
                if map.remove(*key).is_some() {
                    warn!(key, "dropped sensitive metadata key from audit entry");
                }
            }
            JsonValue::Object(map)
        }
        other => other,
    }
}

/// Parameters for one audit entry.
///
/// Built by the gate for every operation outcome; `success` and `error`
/// describe how the operation ended.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub tenant_id: String,
    pub user_id: Option<String>,
    pub action_type: ActionType,
    pub fact_id: Option<Uuid>,
    pub actor_key_hash: String,
    pub success: bool,
    pub error: Option<String>,
    pub role_name: Option<String>,
    pub metadata: Option<JsonValue>,
}

/// Per-tenant, append-only audit log.
#[derive(Debug, Default)]
pub struct AuditLogger {
    entries: DashMap<String, Vec<AuditEntry>>,
}

impl AuditLogger {
    /// Create an empty audit log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one entry. Never fails and never blocks the recorded operation.
    pub fn record(&self, event: AuditEvent) {
        let entry = AuditEntry {
            tenant_id: event.tenant_id.clone(),
            user_id: event.user_id,
            action_type: event.action_type,
            fact_id: event.fact_id,
            actor_key_hash: event.actor_key_hash,
            success: event.success,
            error: event.error,
            role_name: event.role_name,
            metadata: event.metadata.map(sanitize_metadata),
            timestamp: Utc::now(),
        };
        self.entries.entry(event.tenant_id).or_default().push(entry);
    }

    /// Entries for a tenant, newest first, optionally filtered by action.
    pub fn entries_for_tenant(
        &self,
        tenant_id: &str,
        action_filter: Option<ActionType>,
        limit: usize,
    ) -> Vec<AuditEntry> {
        let Some(entries) = self.entries.get(tenant_id) else {
            return Vec::new();
        };
        entries
            .iter()
            .rev()
            .filter(|entry| action_filter.map_or(true, |action| entry.action_type == action))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Total entries across all tenants.
    pub fn entry_count(&self) -> usize {
        self.entries.iter().map(|entry| entry.value().len()).sum()
    }

    /// Snapshot all entries for persistence.
    pub(crate) fn snapshot(&self) -> Vec<AuditEntry> {
        let mut all: Vec<AuditEntry> = self
            .entries
            .iter()
            .flat_map(|entry| entry.value().clone())
            .collect();
        all.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        all
    }

    /// Rebuild the log from a persisted snapshot.
    pub(crate) fn from_snapshot(entries: Vec<AuditEntry>) -> Self {
        let logger = Self::new();
        for entry in entries {
            logger
                .entries
                .entry(entry.tenant_id.clone())
                .or_default()
                .push(entry);
        }
        logger
    }
}
