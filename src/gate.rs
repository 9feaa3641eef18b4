/// The gated write/read pipeline.
///
/// [`FactGate`] composes the authorizer, rate limiter, policy resolver,
/// store, audit log, and sweeper behind one facade. Every operation follows
/// the same shape: run the gates in a fixed order, perform the store action,
/// and record exactly one audit entry for the outcome, allowed or denied.
///
/// Gate order for writes: structural validation, authorization, rate limit,
/// policy. The cheapest and most security-relevant checks run first, and a
/// caller who fails an early gate learns nothing about later ones.
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use crate::audit::{hash_actor_key, AuditEvent, AuditLogger};
use crate::config::GateConfig;
use crate::error::{GateError, GateResult};
use crate::policy::{PolicyResolver, TenantPolicy};
use crate::ratelimit::RateLimiter;
use crate::rbac::{Permission, Role, RoleDirectory};
use crate::store::{FactStore, RetrieveFilter};
use crate::sweeper::ExpirySweeper;
use crate::types::{ActionType, AuditEntry, CandidateFact, Fact, FactKey, Scope, WriteReceipt};

/// The caller of a gated operation.
#[derive(Debug, Clone)]
pub struct Actor {
    /// Tenant the caller belongs to
    pub tenant_id: String,
    /// The caller's user id
    pub user_id: String,
    /// Raw credential; only its hash ever reaches the audit trail
    pub credential: String,
}

impl Actor {
    pub fn new(
        tenant_id: impl Into<String>,
        user_id: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            user_id: user_id.into(),
            credential: credential.into(),
        }
    }

    fn key_hash(&self) -> String {
        hash_actor_key(&self.credential)
    }
}

/// Point-in-time operational counters, for dashboards and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateStats {
    /// Distinct fact keys with at least one version
    pub fact_keys: usize,
    /// Total fact rows, history included
    pub fact_versions: usize,
    /// Audit entries across all tenants
    pub audit_entries: usize,
    /// Live rate-limiter buckets
    pub rate_limit_buckets: usize,
}

/// Multi-tenant gated fact store.
///
/// Cheap to clone via [`Arc`]; all components are shared.
#[derive(Debug)]
pub struct FactGate {
    config: GateConfig,
    store: Arc<FactStore>,
    roles: Arc<RoleDirectory>,
    policies: Arc<PolicyResolver>,
    limiter: Arc<RateLimiter>,
    audit: Arc<AuditLogger>,
    sweeper: Arc<ExpirySweeper>,
}

impl FactGate {
    /// Create a gate with default configuration.
    pub fn new() -> Self {
        Self::with_config(GateConfig::default())
    }

    /// Create a gate with explicit configuration.
    pub fn with_config(config: GateConfig) -> Self {
        let store = Arc::new(FactStore::new(config.upsert_lock_timeout));
        let audit = Arc::new(AuditLogger::new());
        let staleness = chrono::Duration::from_std(config.policy_cache_staleness)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let sweeper = Arc::new(ExpirySweeper::new(
            Arc::clone(&store),
            Arc::clone(&audit),
            config.sweep_interval,
            config.sweep_batch_limit,
        ));
        Self {
            config,
            store,
            roles: Arc::new(RoleDirectory::new()),
            policies: Arc::new(PolicyResolver::new(staleness)),
            limiter: Arc::new(RateLimiter::new()),
            audit,
            sweeper,
        }
    }

    pub(crate) fn from_parts(
        config: GateConfig,
        store: FactStore,
        roles: RoleDirectory,
        policies: PolicyResolver,
        audit: AuditLogger,
    ) -> Self {
        let store = Arc::new(store);
        let audit = Arc::new(audit);
        let sweeper = Arc::new(ExpirySweeper::new(
            Arc::clone(&store),
            Arc::clone(&audit),
            config.sweep_interval,
            config.sweep_batch_limit,
        ));
        Self {
            config,
            store,
            roles: Arc::new(roles),
            policies: Arc::new(policies),
            limiter: Arc::new(RateLimiter::new()),
            audit,
            sweeper,
        }
    }

    /// Seed a tenant with the built-in roles and its first administrator.
    ///
    /// This is the bootstrap path; it bypasses authorization because no
    /// admin exists yet to grant one.
    pub async fn bootstrap_tenant(&self, tenant_id: &str, admin_user_id: &str) -> GateResult<()> {
        self.roles.seed_builtin_roles(tenant_id);
        self.roles
            .assign_role(tenant_id, admin_user_id, "admin", "system", None)?;
        info!(tenant_id, admin_user_id, "tenant bootstrapped");
        Ok(())
    }

    /// Write a candidate fact through the full gate pipeline.
    ///
    /// On success the receipt says whether a new version was written or the
    /// candidate duplicated the current value. Every outcome, including each
    /// denial, appends one audit entry.
    pub async fn ingest(&self, actor: &Actor, candidate: CandidateFact) -> GateResult<WriteReceipt> {
        let metadata = json!({
            "subject": candidate.subject,
            "predicate": candidate.predicate,
            "scope": candidate.scope.to_string(),
        });

        let outcome = self.ingest_inner(actor, &candidate).await;
        match &outcome {
            Ok((receipt, role_name)) => {
                // Classified by the resulting version: the first version of a
                // key is an ingest, later versions are updates. A no-op
                // duplicate keeps its version's classification and is
                // distinguished by the `deduplicated` metadata flag.
                let action = if receipt.version == 1 {
                    ActionType::Ingest
                } else {
                    ActionType::Update
                };
                self.audit.record(AuditEvent {
                    tenant_id: actor.tenant_id.clone(),
                    user_id: Some(actor.user_id.clone()),
                    action_type: action,
                    fact_id: Some(receipt.id),
                    actor_key_hash: actor.key_hash(),
                    success: true,
                    error: None,
                    role_name: Some(role_name.clone()),
                    metadata: Some(json!({
                        "subject": candidate.subject,
                        "predicate": candidate.predicate,
                        "scope": candidate.scope.to_string(),
                        "version": receipt.version,
                        "deduplicated": receipt.deduplicated,
                    })),
                });
            }
            Err(error) => {
                self.record_denial(actor, ActionType::Ingest, error, Some(metadata));
            }
        }
        outcome.map(|(receipt, _)| receipt)
    }

    async fn ingest_inner(
        &self,
        actor: &Actor,
        candidate: &CandidateFact,
    ) -> GateResult<(WriteReceipt, String)> {
        candidate
            .validate()
            .map_err(|reason| GateError::InvalidCandidate { reason })?;

        let decision =
            self.roles
                .authorize(&actor.tenant_id, &actor.user_id, Permission::Ingest, candidate.scope)?;

        let policy = self.policies.resolve(&actor.tenant_id);
        self.limiter
            .try_acquire(&actor.tenant_id, policy.rate_limit_per_minute)?;

        let key = FactKey::new(
            actor.tenant_id.clone(),
            actor.user_id.clone(),
            candidate.subject.clone(),
            candidate.predicate.clone(),
        );

        let mut user_count = self
            .store
            .active_count_for_user(&actor.tenant_id, &actor.user_id);
        let mut tenant_count = self.store.active_count_for_tenant(&actor.tenant_id);
        // A write that supersedes a live row does not grow the live count, so
        // it must pass quota even when the caller sits exactly at the limit.
        if self.store.has_live_fact(&key) {
            user_count = user_count.saturating_sub(1);
            tenant_count = tenant_count.saturating_sub(1);
        }
        let policy_decision = policy.evaluate(candidate, user_count, tenant_count, Utc::now())?;
        let receipt = self.store.upsert(key, candidate, policy_decision.expires_at)?;

        debug!(
            tenant_id = %actor.tenant_id,
            user_id = %actor.user_id,
            version = receipt.version,
            deduplicated = receipt.deduplicated,
            "candidate accepted"
        );
        Ok((receipt, decision.granted_by))
    }

    /// Read the caller's live facts, bounded by their effective scope.
    pub async fn retrieve(&self, actor: &Actor, filter: RetrieveFilter) -> GateResult<Vec<Fact>> {
        let outcome = self.retrieve_inner(actor, &filter).await;
        match &outcome {
            Ok((facts, role_name)) => {
                self.audit.record(AuditEvent {
                    tenant_id: actor.tenant_id.clone(),
                    user_id: Some(actor.user_id.clone()),
                    action_type: ActionType::Retrieve,
                    fact_id: None,
                    actor_key_hash: actor.key_hash(),
                    success: true,
                    error: None,
                    role_name: Some(role_name.clone()),
                    metadata: Some(json!({ "count": facts.len() })),
                });
            }
            Err(error) => {
                self.record_denial(actor, ActionType::Retrieve, error, None);
            }
        }
        outcome.map(|(facts, _)| facts)
    }

    async fn retrieve_inner(
        &self,
        actor: &Actor,
        filter: &RetrieveFilter,
    ) -> GateResult<(Vec<Fact>, String)> {
        // Scope::User is the floor every reader may request; the decision's
        // effective scope is what actually bounds visibility.
        let decision = self.roles.authorize(
            &actor.tenant_id,
            &actor.user_id,
            Permission::Retrieve,
            Scope::User,
        )?;

        let policy = self.policies.resolve(&actor.tenant_id);
        self.limiter
            .try_acquire(&actor.tenant_id, policy.rate_limit_per_minute)?;

        let facts = self.store.retrieve(
            &actor.tenant_id,
            &actor.user_id,
            decision.effective_max_scope,
            filter,
        );
        Ok((facts, decision.granted_by))
    }

    /// The full version chain for one of the caller's keys, oldest first.
    ///
    /// History includes superseded, expired, and deleted rows.
    pub async fn history(
        &self,
        actor: &Actor,
        subject: &str,
        predicate: &str,
    ) -> GateResult<Vec<Fact>> {
        let outcome = self.history_inner(actor, subject, predicate).await;
        match &outcome {
            Ok((facts, role_name)) => {
                self.audit.record(AuditEvent {
                    tenant_id: actor.tenant_id.clone(),
                    user_id: Some(actor.user_id.clone()),
                    action_type: ActionType::Retrieve,
                    fact_id: None,
                    actor_key_hash: actor.key_hash(),
                    success: true,
                    error: None,
                    role_name: Some(role_name.clone()),
                    metadata: Some(json!({
                        "subject": subject,
                        "predicate": predicate,
                        "versions": facts.len(),
                    })),
                });
            }
            Err(error) => {
                self.record_denial(actor, ActionType::Retrieve, error, None);
            }
        }
        outcome.map(|(facts, _)| facts)
    }

    async fn history_inner(
        &self,
        actor: &Actor,
        subject: &str,
        predicate: &str,
    ) -> GateResult<(Vec<Fact>, String)> {
        let decision = self.roles.authorize(
            &actor.tenant_id,
            &actor.user_id,
            Permission::Retrieve,
            Scope::User,
        )?;

        let policy = self.policies.resolve(&actor.tenant_id);
        self.limiter
            .try_acquire(&actor.tenant_id, policy.rate_limit_per_minute)?;

        let key = FactKey::new(
            actor.tenant_id.clone(),
            actor.user_id.clone(),
            subject,
            predicate,
        );
        let facts = self.store.history(&key)?;
        Ok((facts, decision.granted_by))
    }

    /// Soft-delete a fact by id.
    ///
    /// The row transitions to `Deleted` and stays in history. Facts outside
    /// the caller's tenant read as not found rather than as denied, so ids
    /// cannot be probed across tenants.
    pub async fn delete(&self, actor: &Actor, fact_id: Uuid) -> GateResult<()> {
        let outcome = self.delete_inner(actor, fact_id).await;
        match &outcome {
            Ok(role_name) => {
                self.audit.record(AuditEvent {
                    tenant_id: actor.tenant_id.clone(),
                    user_id: Some(actor.user_id.clone()),
                    action_type: ActionType::Delete,
                    fact_id: Some(fact_id),
                    actor_key_hash: actor.key_hash(),
                    success: true,
                    error: None,
                    role_name: Some(role_name.clone()),
                    metadata: None,
                });
            }
            Err(error) => {
                self.record_denial(actor, ActionType::Delete, error, Some(json!({
                    "fact_id": fact_id.to_string(),
                })));
            }
        }
        outcome.map(|_| ())
    }

    async fn delete_inner(&self, actor: &Actor, fact_id: Uuid) -> GateResult<String> {
        let decision = self.roles.authorize(
            &actor.tenant_id,
            &actor.user_id,
            Permission::Delete,
            Scope::User,
        )?;

        let policy = self.policies.resolve(&actor.tenant_id);
        self.limiter
            .try_acquire(&actor.tenant_id, policy.rate_limit_per_minute)?;

        let fact = self
            .store
            .get_by_id(fact_id)
            .filter(|f| f.tenant_id == actor.tenant_id)
            .ok_or(GateError::FactNotFound { id: fact_id })?;

        if !self.store.soft_delete(fact.id) {
            // Known id but no longer active (already deleted or expired).
            return Err(GateError::FactNotFound { id: fact_id });
        }
        Ok(decision.granted_by)
    }

    /// Install or replace a tenant policy. Requires the admin capability.
    pub async fn set_policy(&self, actor: &Actor, policy: TenantPolicy) -> GateResult<()> {
        self.require_admin(actor)?;
        if policy.tenant_id != actor.tenant_id {
            return Err(GateError::AuthorizationDenied {
                reason: "policy tenant does not match actor tenant".to_string(),
            });
        }
        info!(tenant_id = %policy.tenant_id, tier = %policy.tier, "tenant policy updated");
        self.policies.set_policy(policy);
        Ok(())
    }

    /// Current policy snapshot for the caller's tenant.
    pub async fn policy(&self, actor: &Actor) -> GateResult<TenantPolicy> {
        self.require_admin(actor)?;
        Ok(self.policies.resolve(&actor.tenant_id))
    }

    /// Define a custom role within the caller's tenant.
    pub async fn define_role(&self, actor: &Actor, role: Role) -> GateResult<()> {
        self.require_admin(actor)?;
        if role.tenant_id != actor.tenant_id {
            return Err(GateError::AuthorizationDenied {
                reason: "role tenant does not match actor tenant".to_string(),
            });
        }
        self.roles.define_role(role)
    }

    /// Assign a role to a user in the caller's tenant.
    pub async fn assign_role(
        &self,
        actor: &Actor,
        user_id: &str,
        role_name: &str,
        expires_at: Option<chrono::DateTime<Utc>>,
    ) -> GateResult<()> {
        self.require_admin(actor)?;
        self.roles
            .assign_role(&actor.tenant_id, user_id, role_name, &actor.user_id, expires_at)
    }

    /// Revoke a role from a user in the caller's tenant.
    pub async fn revoke_role(
        &self,
        actor: &Actor,
        user_id: &str,
        role_name: &str,
    ) -> GateResult<bool> {
        self.require_admin(actor)?;
        Ok(self.roles.revoke_role(&actor.tenant_id, user_id, role_name))
    }

    /// Read the tenant's audit trail, newest first. Requires admin.
    pub async fn audit_trail(
        &self,
        actor: &Actor,
        action_filter: Option<ActionType>,
        limit: usize,
    ) -> GateResult<Vec<AuditEntry>> {
        self.require_admin(actor)?;
        Ok(self
            .audit
            .entries_for_tenant(&actor.tenant_id, action_filter, limit))
    }

    fn require_admin(&self, actor: &Actor) -> GateResult<()> {
        self.roles
            .authorize(&actor.tenant_id, &actor.user_id, Permission::Admin, Scope::User)
            .map(|_| ())
    }

    fn record_denial(
        &self,
        actor: &Actor,
        action: ActionType,
        error: &GateError,
        metadata: Option<serde_json::Value>,
    ) {
        debug!(
            tenant_id = %actor.tenant_id,
            user_id = %actor.user_id,
            action = %action,
            reason = error.reason_code(),
            "operation denied"
        );
        self.audit.record(AuditEvent {
            tenant_id: actor.tenant_id.clone(),
            user_id: Some(actor.user_id.clone()),
            action_type: action,
            fact_id: None,
            actor_key_hash: actor.key_hash(),
            success: false,
            error: Some(error.reason_code().to_string()),
            role_name: None,
            metadata,
        });
    }

    /// Run one expiry sweep immediately. Returns the number of facts expired.
    pub async fn sweep_now(&self) -> usize {
        self.sweeper.sweep_once()
    }

    /// Start the periodic background sweeper.
    pub fn start_sweeper(&self) -> JoinHandle<()> {
        Arc::clone(&self.sweeper).start()
    }

    /// Stop the background sweeper after its current pass.
    pub fn stop_sweeper(&self) {
        self.sweeper.stop()
    }

    /// Reclaim memory from idle rate-limiter buckets.
    pub fn evict_idle_buckets(&self) -> usize {
        self.limiter.evict_idle(Utc::now())
    }

    /// Operational counters.
    pub fn stats(&self) -> GateStats {
        GateStats {
            fact_keys: self.store.key_count(),
            fact_versions: self.store.total_version_count(),
            audit_entries: self.audit.entry_count(),
            rate_limit_buckets: self.limiter.bucket_count(),
        }
    }

    /// Current configuration.
    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    pub(crate) fn store(&self) -> &FactStore {
        &self.store
    }

    pub(crate) fn roles(&self) -> &RoleDirectory {
        &self.roles
    }

    pub(crate) fn policies(&self) -> &PolicyResolver {
        &self.policies
    }

    pub(crate) fn audit(&self) -> &AuditLogger {
        &self.audit
    }
}

impl Default for FactGate {
    fn default() -> Self {
        Self::new()
    }
}
