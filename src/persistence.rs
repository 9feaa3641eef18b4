/// JSON snapshot persistence.
///
/// The whole gate state (facts, policies, roles, assignments, audit trail)
/// serializes to a single versioned JSON document. Saves write to a temp
/// file in the same directory and rename into place, so a crash mid-write
/// leaves the previous snapshot intact. Rate-limiter buckets are deliberately
/// not persisted; a restart grants every tenant a fresh burst.
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::audit::AuditLogger;
use crate::config::GateConfig;
use crate::error::{GateError, GateResult};
use crate::gate::FactGate;
use crate::policy::{PolicyResolver, TenantPolicy};
use crate::rbac::{Role, RoleAssignment, RoleDirectory};
use crate::store::FactStore;
use crate::types::{AuditEntry, Fact, FactKey};

/// Bumped when the snapshot layout changes incompatibly.
const SNAPSHOT_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct GateSnapshot {
    format_version: u32,
    facts: Vec<(FactKey, Vec<Fact>)>,
    policies: Vec<TenantPolicy>,
    roles: Vec<Role>,
    assignments: Vec<RoleAssignment>,
    audit: Vec<AuditEntry>,
}

impl FactGate {
    /// Write the full gate state to `path`, atomically.
    pub async fn save_to(&self, path: impl AsRef<Path>) -> GateResult<()> {
        let path = path.as_ref();
        let (roles, assignments) = self.roles().snapshot();
        let snapshot = GateSnapshot {
            format_version: SNAPSHOT_FORMAT_VERSION,
            facts: self.store().snapshot(),
            policies: self.policies().snapshot(),
            roles,
            assignments,
            audit: self.audit().snapshot(),
        };
        let bytes = serde_json::to_vec_pretty(&snapshot)?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| GateError::Storage(format!("create {}: {}", parent.display(), e)))?;
        }

        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| GateError::Storage(format!("write {}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| GateError::Storage(format!("rename to {}: {}", path.display(), e)))?;

        info!(
            path = %path.display(),
            keys = snapshot.facts.len(),
            "gate state saved"
        );
        Ok(())
    }

    /// Load gate state from a snapshot written by [`save_to`](Self::save_to).
    pub async fn load_from(path: impl AsRef<Path>, config: GateConfig) -> GateResult<Self> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| GateError::Storage(format!("read {}: {}", path.display(), e)))?;
        let snapshot: GateSnapshot = serde_json::from_slice(&bytes)?;

        if snapshot.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(GateError::Storage(format!(
                "unsupported snapshot format version {}",
                snapshot.format_version
            )));
        }

        let staleness = chrono::Duration::from_std(config.policy_cache_staleness)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let store = FactStore::from_snapshot(snapshot.facts, config.upsert_lock_timeout);
        let roles = RoleDirectory::from_snapshot(snapshot.roles, snapshot.assignments);
        let policies = PolicyResolver::from_snapshot(snapshot.policies, staleness);
        let audit = AuditLogger::from_snapshot(snapshot.audit);

        info!(path = %path.display(), "gate state loaded");
        Ok(FactGate::from_parts(config, store, roles, policies, audit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::Actor;
    use crate::types::{ActionType, CandidateFact};
    use serde_json::json;

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gate.json");

        let gate = FactGate::new();
        gate.bootstrap_tenant("acme", "root").await.unwrap();
        let root = Actor::new("acme", "root", "root-key");
        gate.assign_role(&root, "alice", "user", None).await.unwrap();

        let alice = Actor::new("acme", "alice", "alice-key");
        let receipt = gate
            .ingest(&alice, CandidateFact::new("favorite_editor", "is", json!("helix"), 0.9))
            .await
            .unwrap();

        gate.save_to(&path).await.unwrap();
        let restored = FactGate::load_from(&path, GateConfig::default())
            .await
            .unwrap();

        // Facts, roles, and the audit trail all survive the round trip.
        let facts = restored
            .retrieve(&alice, Default::default())
            .await
            .unwrap();
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].id, receipt.id);

        let trail = restored
            .audit_trail(&root, Some(ActionType::Ingest), 100)
            .await
            .unwrap();
        assert_eq!(trail.len(), 1);
    }

    #[tokio::test]
    async fn test_load_missing_file_is_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let result =
            FactGate::load_from(dir.path().join("absent.json"), GateConfig::default()).await;
        assert!(matches!(result, Err(GateError::Storage(_))));
    }

    #[tokio::test]
    async fn test_save_creates_missing_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("snapshots").join("gate.json");

        let gate = FactGate::new();
        gate.save_to(&path).await.unwrap();

        assert!(path.exists());
        FactGate::load_from(&path, GateConfig::default()).await.unwrap();
    }

    #[tokio::test]
    async fn test_save_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gate.json");

        let gate = FactGate::new();
        gate.save_to(&path).await.unwrap();

        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn test_unsupported_format_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gate.json");

        let gate = FactGate::new();
        gate.save_to(&path).await.unwrap();

        let mut value: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        value["format_version"] = json!(999);
        std::fs::write(&path, serde_json::to_vec(&value).unwrap()).unwrap();

        let result = FactGate::load_from(&path, GateConfig::default()).await;
        assert!(matches!(result, Err(GateError::Storage(_))));
    }
}
