/// Integration tests for the full gate pipeline.
///
/// These tests exercise the public facade end to end:
/// - Authorization, rate limiting, and policy gates in order
/// - Versioned writes with preserved history
/// - Scope containment on retrieval
/// - TTL expiry via the sweeper
/// - One audit entry per operation, allowed or denied
use factgate::{
    ActionType, Actor, CandidateFact, FactGate, FactStatus, GateError, PolicyViolation,
    Permission, RetrieveFilter, Role, Scope, TenantPolicy,
};
use serde_json::json;

/// Helper: a gate with tenant "acme" bootstrapped, a root admin, and a
/// regular user "alice" holding the built-in user role.
async fn seeded_gate() -> (FactGate, Actor, Actor) {
    let gate = FactGate::new();
    gate.bootstrap_tenant("acme", "root").await.unwrap();
    let root = Actor::new("acme", "root", "root-api-key");
    gate.assign_role(&root, "alice", "user", None).await.unwrap();
    let alice = Actor::new("acme", "alice", "alice-api-key");
    (gate, root, alice)
}

fn fact(subject: &str, object: serde_json::Value) -> CandidateFact {
    CandidateFact::new(subject, "is", object, 0.9)
}

#[tokio::test]
async fn test_ingest_and_retrieve_round_trip() {
    let (gate, _root, alice) = seeded_gate().await;

    let receipt = gate
        .ingest(&alice, fact("favorite_editor", json!("helix")))
        .await
        .unwrap();
    assert_eq!(receipt.version, 1);
    assert!(!receipt.deduplicated);

    let facts = gate.retrieve(&alice, RetrieveFilter::default()).await.unwrap();
    assert_eq!(facts.len(), 1);
    assert_eq!(facts[0].subject, "favorite_editor");
    assert_eq!(facts[0].object, json!("helix"));
}

#[tokio::test]
async fn test_update_supersedes_and_preserves_history() {
    let (gate, _root, alice) = seeded_gate().await;

    gate.ingest(&alice, fact("favorite_editor", json!("helix")))
        .await
        .unwrap();
    let second = gate
        .ingest(&alice, fact("favorite_editor", json!("neovim")))
        .await
        .unwrap();
    assert_eq!(second.version, 2);

    // Retrieval sees only the current version.
    let facts = gate.retrieve(&alice, RetrieveFilter::default()).await.unwrap();
    assert_eq!(facts.len(), 1);
    assert_eq!(facts[0].object, json!("neovim"));

    // History keeps both, oldest first, with statuses.
    let history = gate.history(&alice, "favorite_editor", "is").await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].status, FactStatus::Superseded);
    assert_eq!(history[0].version, 1);
    assert_eq!(history[1].status, FactStatus::Active);
}

#[tokio::test]
async fn test_duplicate_write_is_deduplicated() {
    let (gate, _root, alice) = seeded_gate().await;

    let first = gate
        .ingest(&alice, fact("favorite_editor", json!("helix")))
        .await
        .unwrap();
    let second = gate
        .ingest(&alice, fact("favorite_editor", json!("helix")))
        .await
        .unwrap();

    assert!(second.deduplicated);
    assert_eq!(second.id, first.id);
    assert_eq!(second.version, 1);
}

#[tokio::test]
async fn test_audit_distinguishes_ingest_update_and_dedup() {
    let (gate, root, alice) = seeded_gate().await;

    gate.ingest(&alice, fact("s", json!("a"))).await.unwrap(); // version 1
    gate.ingest(&alice, fact("s", json!("a"))).await.unwrap(); // dedup of v1
    gate.ingest(&alice, fact("s", json!("b"))).await.unwrap(); // version 2
    gate.ingest(&alice, fact("s", json!("b"))).await.unwrap(); // dedup of v2

    // Newest first: Update(dedup), Update, Ingest(dedup), Ingest.
    let trail = gate.audit_trail(&root, None, 100).await.unwrap();
    let writes: Vec<_> = trail
        .iter()
        .filter(|e| matches!(e.action_type, ActionType::Ingest | ActionType::Update))
        .collect();
    assert_eq!(writes.len(), 4);

    let dedup_flag = |entry: &factgate::AuditEntry| {
        entry.metadata.as_ref().unwrap()["deduplicated"]
            .as_bool()
            .unwrap()
    };
    assert_eq!(writes[3].action_type, ActionType::Ingest);
    assert!(!dedup_flag(writes[3]));
    // A no-op duplicate of version 1 is still an ingest, not an update.
    assert_eq!(writes[2].action_type, ActionType::Ingest);
    assert!(dedup_flag(writes[2]));
    assert_eq!(writes[1].action_type, ActionType::Update);
    assert!(!dedup_flag(writes[1]));
    assert_eq!(writes[0].action_type, ActionType::Update);
    assert!(dedup_flag(writes[0]));
}

#[tokio::test]
async fn test_unassigned_user_is_denied_and_audited() {
    let (gate, root, _alice) = seeded_gate().await;
    let mallory = Actor::new("acme", "mallory", "mallory-key");

    let result = gate.ingest(&mallory, fact("s", json!("v"))).await;
    assert!(matches!(result, Err(GateError::AuthorizationDenied { .. })));

    let trail = gate.audit_trail(&root, Some(ActionType::Ingest), 100).await.unwrap();
    let denied: Vec<_> = trail.iter().filter(|e| !e.success).collect();
    assert_eq!(denied.len(), 1);
    assert_eq!(denied[0].error.as_deref(), Some("AuthDenied"));
    assert_eq!(denied[0].user_id.as_deref(), Some("mallory"));
}

#[tokio::test]
async fn test_scope_containment_on_write_and_read() {
    let (gate, root, alice) = seeded_gate().await;

    // The built-in user role tops out at team scope.
    gate.ingest(&alice, fact("team_fact", json!(1)).with_scope(Scope::Team))
        .await
        .unwrap();
    let denied = gate
        .ingest(&alice, fact("org_fact", json!(2)).with_scope(Scope::Organization))
        .await;
    assert!(matches!(denied, Err(GateError::AuthorizationDenied { .. })));

    // An org-scoped fact written by an org-capable role is invisible to a
    // team-bounded reader of the same user partition.
    gate.define_role(
        &root,
        Role::new("acme", "org_writer", [Permission::Ingest], Scope::Organization),
    )
    .await
    .unwrap();
    gate.assign_role(&root, "bob", "org_writer", None).await.unwrap();
    gate.assign_role(&root, "bob", "user", None).await.unwrap();
    let bob = Actor::new("acme", "bob", "bob-key");
    gate.ingest(&bob, fact("org_fact", json!(3)).with_scope(Scope::Organization))
        .await
        .unwrap();
    gate.ingest(&bob, fact("own_fact", json!(4)))
        .await
        .unwrap();

    // Bob's retrieve permission comes from the user role (team max), so the
    // organization-scoped fact is filtered out of his own reads.
    let visible = gate.retrieve(&bob, RetrieveFilter::default()).await.unwrap();
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].subject, "own_fact");
}

#[tokio::test]
async fn test_confidence_gate_rejects_with_single_audit_entry() {
    let (gate, root, alice) = seeded_gate().await;

    let low = CandidateFact::new("subject", "is", json!("v"), 0.2);
    let result = gate.ingest(&alice, low).await;
    assert!(matches!(
        result,
        Err(GateError::Policy(PolicyViolation::ConfidenceTooLow { .. }))
    ));

    let trail = gate.audit_trail(&root, Some(ActionType::Ingest), 100).await.unwrap();
    assert_eq!(trail.len(), 1);
    assert!(!trail[0].success);
    assert_eq!(trail[0].error.as_deref(), Some("ConfidenceTooLow"));
}

#[tokio::test]
async fn test_predicate_whitelist_enforced() {
    let (gate, root, alice) = seeded_gate().await;

    let mut policy = TenantPolicy::standard("acme");
    policy.allowed_predicates = Some(["is".to_string()].into());
    gate.set_policy(&root, policy).await.unwrap();

    gate.ingest(&alice, fact("s", json!("v"))).await.unwrap();
    let rejected = gate
        .ingest(&alice, CandidateFact::new("s", "hates", json!("v"), 0.9))
        .await;
    assert!(matches!(
        rejected,
        Err(GateError::Policy(PolicyViolation::PredicateNotAllowed { .. }))
    ));
}

#[tokio::test]
async fn test_user_quota_blocks_new_keys_but_not_updates() {
    let (gate, root, alice) = seeded_gate().await;

    let mut policy = TenantPolicy::standard("acme");
    policy.max_memories_per_user = 2;
    gate.set_policy(&root, policy).await.unwrap();

    gate.ingest(&alice, fact("a", json!(1))).await.unwrap();
    gate.ingest(&alice, fact("b", json!(2))).await.unwrap();

    // Third distinct key: over quota.
    let rejected = gate.ingest(&alice, fact("c", json!(3))).await;
    assert!(matches!(
        rejected,
        Err(GateError::Policy(PolicyViolation::UserQuotaExceeded { count: 2, limit: 2 }))
    ));

    // Updating an existing key does not grow the live count and still works.
    let updated = gate.ingest(&alice, fact("a", json!(10))).await.unwrap();
    assert_eq!(updated.version, 2);

    // Deleting frees a quota slot.
    let facts = gate.retrieve(&alice, RetrieveFilter::default()).await.unwrap();
    let victim = facts.iter().find(|f| f.subject == "b").unwrap();
    gate.delete(&alice_with_delete(&gate, &root).await, victim.id).await.unwrap();
    gate.ingest(&alice, fact("c", json!(3))).await.unwrap();
}

/// Helper: grant alice delete capability through a custom role.
async fn alice_with_delete(gate: &FactGate, root: &Actor) -> Actor {
    gate.define_role(
        root,
        Role::new("acme", "cleaner", [Permission::Delete], Scope::User),
    )
    .await
    .unwrap();
    gate.assign_role(root, "alice", "cleaner", None).await.unwrap();
    Actor::new("acme", "alice", "alice-api-key")
}

#[tokio::test]
async fn test_rate_limit_denies_and_reports_retry_after() {
    let (gate, root, alice) = seeded_gate().await;

    let mut policy = TenantPolicy::standard("acme");
    policy.rate_limit_per_minute = 2;
    gate.set_policy(&root, policy).await.unwrap();

    gate.ingest(&alice, fact("a", json!(1))).await.unwrap();
    gate.ingest(&alice, fact("b", json!(2))).await.unwrap();

    match gate.ingest(&alice, fact("c", json!(3))).await {
        Err(GateError::RateLimited { retry_after_secs }) => {
            assert!(retry_after_secs > 0);
        }
        other => panic!("expected RateLimited, got {:?}", other),
    }

    // The denial is on the audit trail too.
    let trail = gate.audit_trail(&root, Some(ActionType::Ingest), 100).await.unwrap();
    assert!(trail.iter().any(|e| e.error.as_deref() == Some("RateLimited")));
}

#[tokio::test]
async fn test_tenants_do_not_share_rate_buckets_or_facts() {
    let gate = FactGate::new();
    gate.bootstrap_tenant("acme", "root").await.unwrap();
    gate.bootstrap_tenant("globex", "root").await.unwrap();
    let acme_root = Actor::new("acme", "root", "k1");
    let globex_root = Actor::new("globex", "root", "k2");

    let mut tight = TenantPolicy::standard("acme");
    tight.rate_limit_per_minute = 1;
    gate.set_policy(&acme_root, tight).await.unwrap();

    gate.ingest(&acme_root, fact("s", json!(1))).await.unwrap();
    assert!(gate.ingest(&acme_root, fact("t", json!(2))).await.is_err());

    // Globex is untouched by acme's policy or bucket.
    gate.ingest(&globex_root, fact("s", json!(1))).await.unwrap();
    gate.ingest(&globex_root, fact("t", json!(2))).await.unwrap();

    // And facts never cross tenants.
    let globex_facts = gate.retrieve(&globex_root, RetrieveFilter::default()).await.unwrap();
    assert!(globex_facts.iter().all(|f| f.tenant_id == "globex"));
    assert_eq!(globex_facts.len(), 2);
}

#[tokio::test]
async fn test_ttl_expiry_hides_from_retrieve_but_not_history() {
    let (gate, root, alice) = seeded_gate().await;

    // TTL of zero days: facts expire the moment they are written.
    let mut policy = TenantPolicy::standard("acme");
    policy.memory_ttl_days = Some(0);
    gate.set_policy(&root, policy).await.unwrap();

    gate.ingest(&alice, fact("ephemeral", json!("v"))).await.unwrap();

    let visible = gate.retrieve(&alice, RetrieveFilter::default()).await.unwrap();
    assert!(visible.is_empty());

    let history = gate.history(&alice, "ephemeral", "is").await.unwrap();
    assert_eq!(history.len(), 1);

    // The sweeper flips the row and records one EXPIRE entry per fact.
    assert_eq!(gate.sweep_now().await, 1);
    let history = gate.history(&alice, "ephemeral", "is").await.unwrap();
    assert_eq!(history[0].status, FactStatus::Expired);

    let expires = gate.audit_trail(&root, Some(ActionType::Expire), 100).await.unwrap();
    assert_eq!(expires.len(), 1);
    assert!(expires[0].success);
    assert_eq!(expires[0].fact_id, Some(history[0].id));
}

#[tokio::test]
async fn test_delete_requires_capability_and_is_tenant_bounded() {
    let (gate, root, alice) = seeded_gate().await;

    let receipt = gate.ingest(&alice, fact("s", json!("v"))).await.unwrap();

    // The built-in user role has no delete capability.
    let denied = gate.delete(&alice, receipt.id).await;
    assert!(matches!(denied, Err(GateError::AuthorizationDenied { .. })));

    // A foreign tenant's admin sees the fact as not found, not as forbidden.
    gate.bootstrap_tenant("globex", "boss").await.unwrap();
    let boss = Actor::new("globex", "boss", "boss-key");
    let cross_tenant = gate.delete(&boss, receipt.id).await;
    assert!(matches!(cross_tenant, Err(GateError::FactNotFound { .. })));

    // The tenant's own admin can delete; a second delete is not found.
    gate.delete(&root, receipt.id).await.unwrap();
    let again = gate.delete(&root, receipt.id).await;
    assert!(matches!(again, Err(GateError::FactNotFound { .. })));

    let history = gate.history(&alice, "s", "is").await.unwrap();
    assert_eq!(history[0].status, FactStatus::Deleted);
}

#[tokio::test]
async fn test_admin_surface_requires_admin_capability() {
    let (gate, _root, alice) = seeded_gate().await;

    let denied = gate.set_policy(&alice, TenantPolicy::standard("acme")).await;
    assert!(matches!(denied, Err(GateError::AuthorizationDenied { .. })));

    let denied = gate.audit_trail(&alice, None, 10).await;
    assert!(matches!(denied, Err(GateError::AuthorizationDenied { .. })));

    let denied = gate.assign_role(&alice, "mallory", "admin", None).await;
    assert!(matches!(denied, Err(GateError::AuthorizationDenied { .. })));
}

#[tokio::test]
async fn test_revoked_role_loses_access() {
    let (gate, root, alice) = seeded_gate().await;

    gate.ingest(&alice, fact("s", json!("v"))).await.unwrap();
    assert!(gate.revoke_role(&root, "alice", "user").await.unwrap());

    let denied = gate.ingest(&alice, fact("t", json!("w"))).await;
    assert!(matches!(denied, Err(GateError::AuthorizationDenied { .. })));
    let denied = gate.retrieve(&alice, RetrieveFilter::default()).await;
    assert!(matches!(denied, Err(GateError::AuthorizationDenied { .. })));
}

#[tokio::test]
async fn test_concurrent_ingest_distinct_keys() {
    let (gate, _root, _alice) = seeded_gate().await;
    let gate = std::sync::Arc::new(gate);

    let mut handles = vec![];
    for i in 0..16 {
        let gate = std::sync::Arc::clone(&gate);
        handles.push(tokio::spawn(async move {
            let alice = Actor::new("acme", "alice", "alice-api-key");
            gate.ingest(&alice, fact(&format!("subject{}", i), json!(i)))
                .await
                .unwrap()
        }));
    }
    for handle in handles {
        let receipt = handle.await.unwrap();
        assert_eq!(receipt.version, 1);
    }

    let stats = gate.stats();
    assert_eq!(stats.fact_keys, 16);
    assert_eq!(stats.fact_versions, 16);
}

#[tokio::test]
async fn test_concurrent_updates_same_key_keep_versions_gapless() {
    let (gate, _root, _alice) = seeded_gate().await;
    let gate = std::sync::Arc::new(gate);

    let mut handles = vec![];
    for i in 0..10 {
        let gate = std::sync::Arc::clone(&gate);
        handles.push(tokio::spawn(async move {
            let alice = Actor::new("acme", "alice", "alice-api-key");
            gate.ingest(&alice, fact("counter", json!(format!("value-{}", i))))
                .await
                .unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let alice = Actor::new("acme", "alice", "alice-api-key");
    let history = gate.history(&alice, "counter", "is").await.unwrap();
    assert_eq!(history.len(), 10);
    for (index, row) in history.iter().enumerate() {
        assert_eq!(row.version, index as u64 + 1);
    }
    assert_eq!(history.iter().filter(|f| f.is_active()).count(), 1);
}

#[tokio::test]
async fn test_audit_trail_hashes_credentials() {
    let (gate, root, alice) = seeded_gate().await;

    gate.ingest(&alice, fact("s", json!("v"))).await.unwrap();

    let trail = gate.audit_trail(&root, None, 100).await.unwrap();
    assert!(!trail.is_empty());
    for entry in &trail {
        assert_eq!(entry.actor_key_hash.len(), 64);
        assert!(!entry.actor_key_hash.contains("api-key"));
    }
}

#[tokio::test]
async fn test_invalid_candidate_rejected_before_any_gate() {
    let (gate, root, alice) = seeded_gate().await;

    let blank = CandidateFact::new("  ", "is", json!("v"), 0.9);
    let result = gate.ingest(&alice, blank).await;
    assert!(matches!(result, Err(GateError::InvalidCandidate { .. })));

    let trail = gate.audit_trail(&root, Some(ActionType::Ingest), 10).await.unwrap();
    assert_eq!(trail.len(), 1);
    assert_eq!(trail[0].error.as_deref(), Some("InvalidCandidate"));
}

#[tokio::test]
async fn test_history_for_unknown_key() {
    let (gate, _root, alice) = seeded_gate().await;
    let result = gate.history(&alice, "never", "written").await;
    assert!(matches!(result, Err(GateError::KeyNotFound { .. })));
}
