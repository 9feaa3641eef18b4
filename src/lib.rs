//! # FactGate — Gated, Versioned Fact Store
//!
//! FactGate stores subject-predicate-object facts about users, partitioned
//! by tenant, behind a mandatory gate pipeline:
//!
//! - **Role-based authorization** - Capabilities come from roles, never users
//! - **Token-bucket rate limiting** - Per-tenant admission control
//! - **Tenant policy** - Quotas, confidence thresholds, predicate whitelists, TTLs
//! - **Versioned storage** - Updates supersede, never overwrite; history survives
//! - **Append-only audit** - One entry per operation, allowed or denied
//!
//! ## Quick Start
//!
//! ```ignore
//! use factgate::{Actor, CandidateFact, FactGate};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let gate = FactGate::new();
//!
//!     // Seed a tenant with built-in roles and its first admin.
//!     gate.bootstrap_tenant("acme", "root").await?;
//!     let root = Actor::new("acme", "root", "root-api-key");
//!     gate.assign_role(&root, "alice", "user", None).await?;
//!
//!     // Write a fact through the gate.
//!     let alice = Actor::new("acme", "alice", "alice-api-key");
//!     let receipt = gate
//!         .ingest(&alice, CandidateFact::new("favorite_editor", "is", json!("helix"), 0.9))
//!         .await?;
//!     println!("version {}", receipt.version);
//!
//!     // Read it back; updating the same key later yields version 2 and
//!     // keeps version 1 in history.
//!     let facts = gate.retrieve(&alice, Default::default()).await?;
//!     println!("{} facts", facts.len());
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! [`FactGate`] composes six components, each independently testable:
//!
//! 1. **RBAC** ([`rbac`]) - pure authorization decisions over roles
//! 2. **Rate limiter** ([`ratelimit`]) - non-blocking per-tenant token buckets
//! 3. **Policy** ([`policy`]) - per-tenant quota/quality/TTL snapshots
//! 4. **Store** ([`store`]) - the versioned fact ledger
//! 5. **Audit** ([`audit`]) - the append-only trail
//! 6. **Sweeper** ([`sweeper`]) - background TTL enforcement
//!
//! ## Thread Safety
//!
//! All operations are thread-safe; components are shared via `Arc` and a
//! gate can be used concurrently from many tasks.

mod config;
mod error;
mod gate;
mod types;

pub mod audit;
pub mod persistence;
pub mod policy;
pub mod ratelimit;
pub mod rbac;
pub mod store;
pub mod sweeper;

// Public API exports
pub use config::GateConfig;
pub use error::{GateError, GateResult, PolicyViolation};
pub use gate::{Actor, FactGate, GateStats};
pub use types::{
    ActionType, AuditEntry, CandidateFact, Fact, FactKey, FactStatus, Scope, WriteReceipt,
};

pub use policy::TenantPolicy;
pub use rbac::{Permission, Role, RoleAssignment};
pub use store::RetrieveFilter;

// Re-export commonly used external types for convenience
pub use chrono::{DateTime, Utc};
pub use serde_json::{json, Value as JsonValue};
pub use uuid::Uuid;

/// Install a global tracing subscriber that honors `RUST_LOG`.
///
/// Convenience for binaries and tests; calling it more than once is a no-op.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// Prelude module for convenient imports.
///
/// Import everything you need with:
/// ```ignore
/// use factgate::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::GateConfig;
    pub use crate::error::{GateError, GateResult, PolicyViolation};
    pub use crate::gate::{Actor, FactGate, GateStats};
    pub use crate::policy::TenantPolicy;
    pub use crate::rbac::{Permission, Role, RoleAssignment};
    pub use crate::store::RetrieveFilter;
    pub use crate::types::{
        ActionType, AuditEntry, CandidateFact, Fact, FactKey, FactStatus, Scope, WriteReceipt,
    };
    pub use chrono::{DateTime, Utc};
    pub use serde_json::{json, Value as JsonValue};
    pub use uuid::Uuid;
}
