/// Tenant policy configuration and enforcement.
///
/// A [`TenantPolicy`] bundles the quota, TTL, data-quality, and rate-limit
/// settings for one tenant. The [`PolicyResolver`] hands out point-in-time
/// snapshots of the policy through a bounded-staleness cache, so every
/// pipeline stage works against an explicit snapshot value rather than an
/// ambient lookup, and administrative edits converge within the staleness
/// window without touching the hot path.
///
/// Enforcement itself is a pure method on the snapshot: checks run in a fixed
/// order and the first failure wins.
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::PolicyViolation;
use crate::types::CandidateFact;

/// Per-tenant quota, quality, TTL, and rate-limit configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantPolicy {
    /// Tenant this policy applies to
    pub tenant_id: String,
    /// Maximum active facts per user
    pub max_memories_per_user: usize,
    /// Maximum active facts across the whole tenant
    pub max_memories_per_tenant: usize,
    /// TTL applied to new facts, in days; `None` disables expiry
    pub memory_ttl_days: Option<i64>,
    /// Master switch for TTL assignment
    pub auto_expire_enabled: bool,
    /// Minimum confidence accepted for a candidate fact
    pub min_confidence_threshold: f64,
    /// When non-empty, only these predicates are accepted
    pub allowed_predicates: Option<BTreeSet<String>>,
    /// Token-bucket capacity for the tenant, per minute
    pub rate_limit_per_minute: u32,
    /// Commercial tier label, echoed in quota errors upstream
    pub tier: String,
}

impl TenantPolicy {
    /// The default "standard" tier policy applied to unknown tenants.
    pub fn standard(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            max_memories_per_user: 10_000,
            max_memories_per_tenant: 100_000,
            memory_ttl_days: Some(365),
            auto_expire_enabled: true,
            min_confidence_threshold: 0.5,
            allowed_predicates: None,
            rate_limit_per_minute: 100,
            tier: "standard".to_string(),
        }
    }

    /// Evaluate a candidate against this policy snapshot.
    ///
    /// Checks in order, first failure wins:
    /// 1. predicate whitelist (when one is configured),
    /// 2. confidence threshold,
    /// 3. per-user quota,
    /// 4. per-tenant quota.
    ///
    /// The caller supplies the current live counts; only rows that are
    /// active and not past their TTL count toward quota.
    pub fn evaluate(
        &self,
        candidate: &CandidateFact,
        active_user_count: usize,
        active_tenant_count: usize,
        now: DateTime<Utc>,
    ) -> Result<PolicyDecision, PolicyViolation> {
        if let Some(allowed) = &self.allowed_predicates {
            if !allowed.is_empty() && !allowed.contains(&candidate.predicate) {
                return Err(PolicyViolation::PredicateNotAllowed {
                    predicate: candidate.predicate.clone(),
                });
            }
        }

        if candidate.confidence < self.min_confidence_threshold {
            return Err(PolicyViolation::ConfidenceTooLow {
                confidence: candidate.confidence,
                threshold: self.min_confidence_threshold,
            });
        }

        if active_user_count >= self.max_memories_per_user {
            return Err(PolicyViolation::UserQuotaExceeded {
                count: active_user_count,
                limit: self.max_memories_per_user,
            });
        }

        if active_tenant_count >= self.max_memories_per_tenant {
            return Err(PolicyViolation::TenantQuotaExceeded {
                count: active_tenant_count,
                limit: self.max_memories_per_tenant,
            });
        }

        Ok(PolicyDecision {
            expires_at: self.expiry_after(now),
        })
    }

    /// TTL expiry for a fact written at `now`, or `None` when expiry is off.
    pub fn expiry_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !self.auto_expire_enabled {
            return None;
        }
        self.memory_ttl_days.map(|days| now + Duration::days(days))
    }
}

/// A positive policy decision for one candidate write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyDecision {
    /// TTL expiry to stamp on the new fact, if any
    pub expires_at: Option<DateTime<Utc>>,
}

/// Cached policy snapshot with its fetch time.
#[derive(Debug, Clone)]
struct CachedPolicy {
    policy: TenantPolicy,
    fetched_at: DateTime<Utc>,
}

/// Read-mostly policy registry with a bounded-staleness snapshot cache.
///
/// `resolve` serves from the per-tenant cache while an entry is fresher than
/// the staleness window, then re-reads the registry. `set_policy` updates the
/// registry and drops the cache entry, so edits are visible immediately to
/// the editing process and within one window everywhere else.
#[derive(Debug)]
pub struct PolicyResolver {
    registry: DashMap<String, TenantPolicy>,
    cache: DashMap<String, CachedPolicy>,
    staleness: Duration,
}

impl PolicyResolver {
    /// Create a resolver with the given cache staleness window.
    pub fn new(staleness: Duration) -> Self {
        Self {
            registry: DashMap::new(),
            cache: DashMap::new(),
            staleness,
        }
    }

    /// Resolve the policy snapshot for a tenant.
    ///
    /// Unknown tenants fall back to the standard-tier default policy (and
    /// the default is installed in the registry so later edits start from it).
    pub fn resolve(&self, tenant_id: &str) -> TenantPolicy {
        let now = Utc::now();

        if let Some(cached) = self.cache.get(tenant_id) {
            if now - cached.fetched_at < self.staleness {
                return cached.policy.clone();
            }
        }

        let policy = self
            .registry
            .entry(tenant_id.to_string())
            .or_insert_with(|| TenantPolicy::standard(tenant_id))
            .clone();

        self.cache.insert(
            tenant_id.to_string(),
            CachedPolicy {
                policy: policy.clone(),
                fetched_at: now,
            },
        );
        policy
    }

    /// Install or replace a tenant's policy (administrative action).
    pub fn set_policy(&self, policy: TenantPolicy) {
        let tenant_id = policy.tenant_id.clone();
        self.registry.insert(tenant_id.clone(), policy);
        self.cache.remove(&tenant_id);
    }

    /// Drop the cached snapshot for a tenant, forcing a registry re-read.
    pub fn invalidate(&self, tenant_id: &str) {
        self.cache.remove(tenant_id);
    }

    /// Snapshot all configured policies for persistence.
    pub(crate) fn snapshot(&self) -> Vec<TenantPolicy> {
        self.registry.iter().map(|e| e.value().clone()).collect()
    }

    /// Rebuild a resolver from persisted policies.
    pub(crate) fn from_snapshot(policies: Vec<TenantPolicy>, staleness: Duration) -> Self {
        let resolver = Self::new(staleness);
        for policy in policies {
            resolver.registry.insert(policy.tenant_id.clone(), policy);
        }
        resolver
    }
}
