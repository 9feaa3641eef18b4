/// Versioned fact ledger.
///
/// The store keeps one version chain per `(tenant, user, subject, predicate)`
/// key. Writes never edit a row in place: superseding a fact flips the prior
/// active row to `Superseded` and appends a new row with `version + 1`.
/// Expired and deleted rows stay in the chain for history and audit.
///
/// ## Invariants
///
/// - At most one active row per key at any time.
/// - Versions per key are strictly increasing by 1 with no gaps.
/// - Non-active rows never change state again.
///
/// ## Concurrency
///
/// Chains live in a sharded map and each write holds only its own entry's
/// lock, so writers to different keys proceed in parallel. Same-key writers
/// wait for each other with exponential backoff; the wait is bounded by a
/// timeout, after which a retryable `VersionConflict` surfaces instead of
/// holding the caller indefinitely.
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{GateError, GateResult};
use crate::types::{CandidateFact, Fact, FactKey, FactStatus, Scope, WriteReceipt};

/// Version chain for a single key, oldest first.
#[derive(Debug, Default, Clone)]
pub(crate) struct FactChain {
    versions: Vec<Fact>,
}

impl FactChain {
    /// The live row, if the chain has one.
    fn active(&self) -> Option<&Fact> {
        self.versions.iter().find(|f| f.is_active())
    }

    fn active_mut(&mut self) -> Option<&mut Fact> {
        self.versions.iter_mut().find(|f| f.is_active())
    }

    fn last_version(&self) -> u64 {
        self.versions.last().map(|f| f.version).unwrap_or(0)
    }
}

/// Filters for [`FactStore::retrieve`].
#[derive(Debug, Clone, Default)]
pub struct RetrieveFilter {
    /// Restrict to a single subject
    pub subject: Option<String>,
    /// Restrict to a single predicate
    pub predicate: Option<String>,
    /// Restrict to exactly this scope (still bounded by the caller's maximum)
    pub scope: Option<Scope>,
    /// Cap the number of returned facts
    pub limit: Option<usize>,
}

/// The versioned, uniquely-keyed fact store.
#[derive(Debug)]
pub struct FactStore {
    /// Key → version chain
    chains: DashMap<FactKey, FactChain>,
    /// Row id → owning key, for id-addressed operations
    ids: DashMap<Uuid, FactKey>,
    /// Upper bound on how long one upsert may wait for its entry lock
    lock_timeout: Duration,
}

/// Initial pause between entry-lock attempts; doubles up to [`BACKOFF_CAP`].
const BACKOFF_FLOOR: Duration = Duration::from_micros(50);
const BACKOFF_CAP: Duration = Duration::from_millis(5);

impl FactStore {
    /// Create an empty store with the given bound on key-lock waits.
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            chains: DashMap::new(),
            ids: DashMap::new(),
            lock_timeout,
        }
    }

    /// Apply a gated write to the ledger.
    ///
    /// Runs as one critical section per key:
    /// 1. If the current active row holds an identical object, the write is a
    ///    no-op duplicate and the existing receipt is returned.
    /// 2. Otherwise the active row (if any) transitions to `Superseded` and a
    ///    new active row is appended with the next version number.
    ///
    /// The candidate is assumed to have passed the gates already; `expires_at`
    /// comes from the policy decision.
    pub fn upsert(
        &self,
        key: FactKey,
        candidate: &CandidateFact,
        expires_at: Option<DateTime<Utc>>,
    ) -> GateResult<WriteReceipt> {
        let deadline = Instant::now() + self.lock_timeout;
        let mut backoff = BACKOFF_FLOOR;
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            if let Some(entry) = self.chains.try_entry(key.clone()) {
                let mut chain = entry.or_default();
                return Ok(self.apply_upsert(&key, &mut chain, candidate, expires_at));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(
                    key = %key.to_canonical_string(),
                    attempts,
                    timeout_ms = self.lock_timeout.as_millis() as u64,
                    "upsert key lock timed out, surfacing conflict"
                );
                return Err(GateError::VersionConflict {
                    key: key.to_canonical_string(),
                    attempts,
                });
            }
            std::thread::sleep(backoff.min(remaining));
            backoff = (backoff * 2).min(BACKOFF_CAP);
        }
    }

    fn apply_upsert(
        &self,
        key: &FactKey,
        chain: &mut FactChain,
        candidate: &CandidateFact,
        expires_at: Option<DateTime<Utc>>,
    ) -> WriteReceipt {
        let now = Utc::now();

        if let Some(active) = chain.active() {
            if active.object == candidate.object {
                debug!(
                    key = %key.to_canonical_string(),
                    version = active.version,
                    "duplicate write, no new version"
                );
                return WriteReceipt {
                    id: active.id,
                    version: active.version,
                    deduplicated: true,
                };
            }
        }

        if let Some(active) = chain.active_mut() {
            active.status = FactStatus::Superseded;
            active.updated_at = now;
        }

        let version = chain.last_version() + 1;
        let fact = Fact {
            id: Uuid::new_v4(),
            tenant_id: key.tenant_id.clone(),
            user_id: key.user_id.clone(),
            subject: key.subject.clone(),
            predicate: key.predicate.clone(),
            object: candidate.object.clone(),
            confidence: candidate.confidence,
            source: candidate.source.clone(),
            version,
            status: FactStatus::Active,
            scope: candidate.scope,
            expires_at,
            created_at: now,
            updated_at: now,
        };

        self.ids.insert(fact.id, key.clone());
        let receipt = WriteReceipt {
            id: fact.id,
            version,
            deduplicated: false,
        };
        chain.versions.push(fact);
        receipt
    }

    /// Active, non-expired facts for a user, bounded by the caller's scope.
    ///
    /// A caller with effective maximum scope `S` sees facts at scope `S` or
    /// narrower. Results are newest first.
    pub fn retrieve(
        &self,
        tenant_id: &str,
        user_id: &str,
        max_scope: Scope,
        filter: &RetrieveFilter,
    ) -> Vec<Fact> {
        let now = Utc::now();
        let mut facts: Vec<Fact> = self
            .chains
            .iter()
            .filter(|entry| {
                let key = entry.key();
                key.tenant_id == tenant_id
                    && key.user_id == user_id
                    && filter
                        .subject
                        .as_deref()
                        .map_or(true, |s| key.subject == s)
                    && filter
                        .predicate
                        .as_deref()
                        .map_or(true, |p| key.predicate == p)
            })
            .filter_map(|entry| entry.value().active().cloned())
            .filter(|fact| {
                fact.is_live_at(now)
                    && fact.scope <= max_scope
                    && filter.scope.map_or(true, |s| fact.scope == s)
            })
            .collect();

        facts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            facts.truncate(limit);
        }
        facts
    }

    /// The complete version chain for a key, oldest first.
    ///
    /// Includes superseded, expired, and deleted rows; this is the audit and
    /// debugging view of a fact's evolution.
    pub fn history(&self, key: &FactKey) -> GateResult<Vec<Fact>> {
        self.chains
            .get(key)
            .map(|chain| chain.versions.clone())
            .ok_or_else(|| GateError::KeyNotFound {
                key: key.to_canonical_string(),
            })
    }

    /// Look up a single fact row by id, any status.
    pub fn get_by_id(&self, id: Uuid) -> Option<Fact> {
        let key = self.ids.get(&id)?.clone();
        let chain = self.chains.get(&key)?;
        chain.versions.iter().find(|f| f.id == id).cloned()
    }

    /// Soft-delete the fact with the given id.
    ///
    /// Returns true when an active row transitioned to `Deleted`; false when
    /// the id is unknown or the row is no longer active. The row itself is
    /// retained.
    pub fn soft_delete(&self, id: Uuid) -> bool {
        let Some(key) = self.ids.get(&id).map(|k| k.clone()) else {
            return false;
        };
        let Some(mut chain) = self.chains.get_mut(&key) else {
            return false;
        };
        let now = Utc::now();
        if let Some(fact) = chain.versions.iter_mut().find(|f| f.id == id) {
            if fact.status.can_transition_to(FactStatus::Deleted) {
                fact.status = FactStatus::Deleted;
                fact.updated_at = now;
                return true;
            }
        }
        false
    }

    /// Whether the key currently has a live (active, non-expired) row.
    ///
    /// Quota checks use this to treat a replacement write differently from a
    /// net-new one: superseding does not grow the live count.
    pub fn has_live_fact(&self, key: &FactKey) -> bool {
        let now = Utc::now();
        self.chains
            .get(key)
            .and_then(|chain| chain.active().cloned())
            .map(|fact| fact.is_live_at(now))
            .unwrap_or(false)
    }

    /// Number of live (active, non-expired) facts for a user.
    pub fn active_count_for_user(&self, tenant_id: &str, user_id: &str) -> usize {
        let now = Utc::now();
        self.chains
            .iter()
            .filter(|entry| {
                entry.key().tenant_id == tenant_id && entry.key().user_id == user_id
            })
            .filter_map(|entry| entry.value().active().cloned())
            .filter(|fact| fact.is_live_at(now))
            .count()
    }

    /// Number of live facts across a tenant.
    pub fn active_count_for_tenant(&self, tenant_id: &str) -> usize {
        let now = Utc::now();
        self.chains
            .iter()
            .filter(|entry| entry.key().tenant_id == tenant_id)
            .filter_map(|entry| entry.value().active().cloned())
            .filter(|fact| fact.is_live_at(now))
            .count()
    }

    /// Transition expired active facts to `Expired`, up to `limit` rows.
    ///
    /// Returns the affected facts (post-transition) so the caller can emit
    /// audit entries. Rows are flipped, never removed.
    pub fn sweep_expired(&self, now: DateTime<Utc>, limit: usize) -> Vec<Fact> {
        let candidates: Vec<FactKey> = self
            .chains
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .active()
                    .map(|f| f.is_expired_at(now))
                    .unwrap_or(false)
            })
            .map(|entry| entry.key().clone())
            .take(limit)
            .collect();

        let mut expired = Vec::with_capacity(candidates.len());
        for key in candidates {
            if let Some(mut chain) = self.chains.get_mut(&key) {
                if let Some(fact) = chain.active_mut() {
                    // Re-check under the entry lock; a concurrent write may
                    // have superseded the row since the scan.
                    if fact.is_expired_at(now)
                        && fact.status.can_transition_to(FactStatus::Expired)
                    {
                        fact.status = FactStatus::Expired;
                        fact.updated_at = now;
                        expired.push(fact.clone());
                    }
                }
            }
        }
        expired
    }

    /// Number of keys with at least one version.
    pub fn key_count(&self) -> usize {
        self.chains.len()
    }

    /// Total rows across all chains, history included.
    pub fn total_version_count(&self) -> usize {
        self.chains.iter().map(|entry| entry.value().versions.len()).sum()
    }

    /// Snapshot every chain for persistence.
    pub(crate) fn snapshot(&self) -> Vec<(FactKey, Vec<Fact>)> {
        self.chains
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().versions.clone()))
            .collect()
    }

    /// Rebuild a store from a persisted snapshot, re-indexing row ids.
    pub(crate) fn from_snapshot(chains: Vec<(FactKey, Vec<Fact>)>, lock_timeout: Duration) -> Self {
        let store = Self::new(lock_timeout);
        for (key, versions) in chains {
            for fact in &versions {
                store.ids.insert(fact.id, key.clone());
            }
            store.chains.insert(key, FactChain { versions });
        }
        store
    }
}
