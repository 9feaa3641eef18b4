/// Background TTL enforcement.
///
/// The sweeper periodically scans for active facts whose `expires_at` has
/// passed and transitions them to `Expired`, one audit entry per fact.
/// Retrieval already filters expired facts out, so the sweep changes durable
/// state and the audit trail, not read results.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::audit::{hash_actor_key, AuditEvent, AuditLogger};
use crate::store::FactStore;
use crate::types::ActionType;

/// Actor name recorded for sweeper-initiated transitions.
const SYSTEM_ACTOR: &str = "system";

/// Periodic expiry sweeper over a shared [`FactStore`].
#[derive(Debug)]
pub struct ExpirySweeper {
    store: Arc<FactStore>,
    audit: Arc<AuditLogger>,
    interval: Duration,
    batch_limit: usize,
    running: Arc<AtomicBool>,
}

impl ExpirySweeper {
    pub fn new(
        store: Arc<FactStore>,
        audit: Arc<AuditLogger>,
        interval: Duration,
        batch_limit: usize,
    ) -> Self {
        Self {
            store,
            audit,
            interval,
            batch_limit,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Run one sweep pass now. Returns the number of facts expired.
    ///
    /// Each expired fact gets its own audit entry attributed to the system
    /// actor, so per-fact expiry is reconstructible from the trail alone.
    pub fn sweep_once(&self) -> usize {
        let now = Utc::now();
        let expired = self.store.sweep_expired(now, self.batch_limit);
        let actor_hash = hash_actor_key(SYSTEM_ACTOR);

        for fact in &expired {
            self.audit.record(AuditEvent {
                tenant_id: fact.tenant_id.clone(),
                user_id: Some(fact.user_id.clone()),
                action_type: ActionType::Expire,
                fact_id: Some(fact.id),
                actor_key_hash: actor_hash.clone(),
                success: true,
                error: None,
                role_name: None,
                metadata: None,
            });
        }

        if expired.is_empty() {
            debug!("sweep pass found no expired facts");
        } else {
            info!(count = expired.len(), "expired facts deactivated");
        }
        expired.len()
    }

    /// Spawn the periodic sweep loop on the current tokio runtime.
    ///
    /// The loop runs until [`stop`](Self::stop) or until the returned handle
    /// is aborted. A batch that fills the limit triggers an immediate
    /// follow-up pass instead of waiting a full interval.
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        let sweeper = Arc::clone(&self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweeper.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick of a tokio interval completes immediately.
            ticker.tick().await;
            while sweeper.running.load(Ordering::SeqCst) {
                let mut swept = sweeper.sweep_once();
                while swept >= sweeper.batch_limit && sweeper.running.load(Ordering::SeqCst) {
                    swept = sweeper.sweep_once();
                }
                ticker.tick().await;
            }
        })
    }

    /// Signal the sweep loop to exit after its current pass.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Whether the periodic loop is active.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
