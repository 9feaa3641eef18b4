/// Role-based access control.
///
/// Permissions derive from roles, never directly from users. A user may hold
/// several role assignments; the effective permission set is the union of the
/// non-expired ones, and the effective maximum scope is the broadest
/// `max_scope` among roles that actually carry the required permission.
///
/// The decision function is pure: it takes the relevant roles and assignments
/// as inputs and produces a [`Decision`] without side effects. Auditing the
/// outcome is the caller's job. Authorization fails closed: a user with no
/// live assignments is denied.
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::{GateError, GateResult};
use crate::types::Scope;

/// A capability a role may grant.
///
/// Fixed set, matched structurally rather than by string name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    /// Write candidate facts through the gate
    Ingest,
    /// Read active facts and history
    Retrieve,
    /// Soft-delete facts
    Delete,
    /// Edit tenant policy and role assignments
    Admin,
}

/// A role definition within a tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    /// Tenant the role belongs to
    pub tenant_id: String,
    /// Unique name within the tenant
    pub role_name: String,
    /// Human-readable description
    pub description: Option<String>,
    /// Capabilities this role grants
    pub permissions: BTreeSet<Permission>,
    /// Broadest scope this role may operate at
    pub max_scope: Scope,
    /// Built-in roles cannot be redefined by tenant admins
    pub is_system_role: bool,
}

impl Role {
    /// Create a role with the given capabilities.
    pub fn new(
        tenant_id: impl Into<String>,
        role_name: impl Into<String>,
        permissions: impl IntoIterator<Item = Permission>,
        max_scope: Scope,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            role_name: role_name.into(),
            description: None,
            permissions: permissions.into_iter().collect(),
            max_scope,
            is_system_role: false,
        }
    }

    /// Whether this role grants `permission`.
    pub fn allows(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }

    /// The built-in "user" role: ingest and retrieve at team scope.
    pub fn builtin_user(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            role_name: "user".to_string(),
            description: Some("Default end-user role".to_string()),
            permissions: [Permission::Ingest, Permission::Retrieve].into_iter().collect(),
            max_scope: Scope::Team,
            is_system_role: true,
        }
    }

    /// The built-in "admin" role: every capability at global scope.
    pub fn builtin_admin(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            role_name: "admin".to_string(),
            description: Some("Tenant administrator".to_string()),
            permissions: [
                Permission::Ingest,
                Permission::Retrieve,
                Permission::Delete,
                Permission::Admin,
            ]
            .into_iter()
            .collect(),
            max_scope: Scope::Global,
            is_system_role: true,
        }
    }
}

/// Assignment of a role to a user.
///
/// Expired assignments become inert without being deleted, so the record of
/// who held what remains available.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleAssignment {
    /// Tenant partition
    pub tenant_id: String,
    /// User receiving the role
    pub user_id: String,
    /// Name of the assigned role
    pub role_name: String,
    /// Who performed the assignment
    pub assigned_by: String,
    /// Optional expiry; `None` means the assignment does not lapse
    pub expires_at: Option<DateTime<Utc>>,
    /// When the assignment was made
    pub assigned_at: DateTime<Utc>,
}

impl RoleAssignment {
    /// Whether the assignment has lapsed as of `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(expiry) if expiry <= now)
    }
}

/// A positive authorization decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// Broadest scope the caller may operate at for the checked permission
    pub effective_max_scope: Scope,
    /// The role that granted the broadest scope, for audit trails
    pub granted_by: String,
}

/// Pure authorization check.
///
/// Collects the caller's non-expired assignments, resolves them against the
/// given role definitions, and checks both the permission bit and the scope
/// bound. Returns the effective decision or an `AuthorizationDenied` error.
pub fn authorize(
    roles: &[Role],
    assignments: &[RoleAssignment],
    required: Permission,
    requested_scope: Scope,
    now: DateTime<Utc>,
) -> GateResult<Decision> {
    let live_role_names: Vec<&str> = assignments
        .iter()
        .filter(|a| !a.is_expired_at(now))
        .map(|a| a.role_name.as_str())
        .collect();

    if live_role_names.is_empty() {
        return Err(GateError::AuthorizationDenied {
            reason: "no active role assignments".to_string(),
        });
    }

    // Broadest max_scope among roles that carry the required permission.
    let mut best: Option<(&Role, Scope)> = None;
    for role in roles {
        if !live_role_names.contains(&role.role_name.as_str()) {
            continue;
        }
        if !role.allows(required) {
            continue;
        }
        match best {
            Some((_, scope)) if scope >= role.max_scope => {}
            _ => best = Some((role, role.max_scope)),
        }
    }

    let (granting_role, effective_max_scope) = match best {
        Some(found) => found,
        None => {
            return Err(GateError::AuthorizationDenied {
                reason: format!("no assigned role grants '{:?}'", required),
            })
        }
    };

    if requested_scope > effective_max_scope {
        return Err(GateError::AuthorizationDenied {
            reason: format!(
                "requested scope '{}' exceeds effective maximum '{}'",
                requested_scope, effective_max_scope
            ),
        });
    }

    Ok(Decision {
        effective_max_scope,
        granted_by: granting_role.role_name.clone(),
    })
}

/// In-process registry of role definitions and user assignments.
///
/// Both maps are sharded per key; reads and administrative writes for
/// unrelated tenants never contend.
#[derive(Debug, Default)]
pub struct RoleDirectory {
    /// (tenant_id, role_name) → role definition
    roles: DashMap<(String, String), Role>,
    /// (tenant_id, user_id) → assignments (expired ones retained)
    assignments: DashMap<(String, String), Vec<RoleAssignment>>,
}

impl RoleDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or replace a role definition.
    ///
    /// System roles cannot be replaced by a non-system definition.
    pub fn define_role(&self, role: Role) -> GateResult<()> {
        let key = (role.tenant_id.clone(), role.role_name.clone());
        if let Some(existing) = self.roles.get(&key) {
            if existing.is_system_role && !role.is_system_role {
                return Err(GateError::InvalidCandidate {
                    reason: format!("role '{}' is a system role", role.role_name),
                });
            }
        }
        self.roles.insert(key, role);
        Ok(())
    }

    /// Seed the built-in "user" and "admin" roles for a tenant.
    pub fn seed_builtin_roles(&self, tenant_id: &str) {
        for role in [Role::builtin_user(tenant_id), Role::builtin_admin(tenant_id)] {
            self.roles
                .insert((role.tenant_id.clone(), role.role_name.clone()), role);
        }
    }

    /// Assign a role to a user.
    ///
    /// The role must exist. Re-assigning an already-held role refreshes its
    /// expiry instead of duplicating the assignment.
    pub fn assign_role(
        &self,
        tenant_id: &str,
        user_id: &str,
        role_name: &str,
        assigned_by: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> GateResult<()> {
        if !self
            .roles
            .contains_key(&(tenant_id.to_string(), role_name.to_string()))
        {
            return Err(GateError::InvalidCandidate {
                reason: format!("unknown role '{}' for tenant '{}'", role_name, tenant_id),
            });
        }

        let mut entry = self
            .assignments
            .entry((tenant_id.to_string(), user_id.to_string()))
            .or_default();

        if let Some(existing) = entry.iter_mut().find(|a| a.role_name == role_name) {
            existing.expires_at = expires_at;
            existing.assigned_by = assigned_by.to_string();
            existing.assigned_at = Utc::now();
        } else {
            entry.push(RoleAssignment {
                tenant_id: tenant_id.to_string(),
                user_id: user_id.to_string(),
                role_name: role_name.to_string(),
                assigned_by: assigned_by.to_string(),
                expires_at,
                assigned_at: Utc::now(),
            });
        }
        Ok(())
    }

    /// Revoke a role from a user.
    ///
    /// Revocation expires the assignment immediately rather than erasing it.
    pub fn revoke_role(&self, tenant_id: &str, user_id: &str, role_name: &str) -> bool {
        let key = (tenant_id.to_string(), user_id.to_string());
        let mut revoked = false;
        if let Some(mut entry) = self.assignments.get_mut(&key) {
            let now = Utc::now();
            for assignment in entry
                .iter_mut()
                .filter(|a| a.role_name == role_name && !a.is_expired_at(now))
            {
                assignment.expires_at = Some(now);
                revoked = true;
            }
        }
        revoked
    }

    /// All assignments for a user, expired ones included.
    pub fn assignments_for(&self, tenant_id: &str, user_id: &str) -> Vec<RoleAssignment> {
        self.assignments
            .get(&(tenant_id.to_string(), user_id.to_string()))
            .map(|entry| entry.clone())
            .unwrap_or_default()
    }

    /// Role definitions referenced by a user's assignments.
    pub fn roles_for(&self, tenant_id: &str, user_id: &str) -> Vec<Role> {
        self.assignments_for(tenant_id, user_id)
            .iter()
            .filter_map(|a| {
                self.roles
                    .get(&(tenant_id.to_string(), a.role_name.clone()))
                    .map(|r| r.clone())
            })
            .collect()
    }

    /// Authorize a user for a permission at a requested scope.
    ///
    /// Convenience wrapper that resolves the user's roles and assignments and
    /// delegates to the pure [`authorize`] function.
    pub fn authorize(
        &self,
        tenant_id: &str,
        user_id: &str,
        required: Permission,
        requested_scope: Scope,
    ) -> GateResult<Decision> {
        let roles = self.roles_for(tenant_id, user_id);
        let assignments = self.assignments_for(tenant_id, user_id);
        authorize(&roles, &assignments, required, requested_scope, Utc::now())
    }

    /// Snapshot all roles and assignments for persistence.
    pub(crate) fn snapshot(&self) -> (Vec<Role>, Vec<RoleAssignment>) {
        let roles = self.roles.iter().map(|e| e.value().clone()).collect();
        let assignments = self
            .assignments
            .iter()
            .flat_map(|e| e.value().clone())
            .collect();
        (roles, assignments)
    }

    /// Rebuild a directory from a persisted snapshot.
    pub(crate) fn from_snapshot(roles: Vec<Role>, assignments: Vec<RoleAssignment>) -> Self {
        let directory = Self::new();
        for role in roles {
            directory
                .roles
                .insert((role.tenant_id.clone(), role.role_name.clone()), role);
        }
        for assignment in assignments {
            directory
                .assignments
                .entry((assignment.tenant_id.clone(), assignment.user_id.clone()))
                .or_default()
                .push(assignment);
        }
        directory
    }
}
