//! Tenant-scoped access control. Role assignments live inside each
//! tenant's own database, keyed by central user ids carried by value.

use diesel::pg::PgConnection;
use diesel::prelude::*;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::models::Tenant;
use crate::schema::tenants;
use crate::tenancy::catalog::{is_known_role, normalize_role, ROLE_OWNER};
use crate::tenancy::naming::database_name_for;
use crate::tenancy::registry::TenantPools;
use crate::tenant_models::{NewModelHasRole, Role};
use crate::tenant_schema::{model_has_roles, permissions, role_permissions, roles};

/// Discriminator stored in `model_has_roles.model_type` for user
/// assignments.
pub const MODEL_TYPE_USER: &str = "user";

#[derive(Debug, Error)]
pub enum AclError {
    #[error("unknown role: {0}")]
    UnknownRole(String),
    #[error("tenant not found: {0}")]
    TenantNotFound(Uuid),
    #[error("tenant database unreachable: {0}")]
    Connectivity(String),
    #[error("database statement failed: {0}")]
    Database(#[from] diesel::result::Error),
}

pub type AclResult<T> = Result<T, AclError>;

/// Resolves the user's role inside a tenant, or `None` without a
/// tenant: personal mode deliberately has no roles. Connectivity
/// failures (database not yet provisioned, pool exhausted) also yield
/// `None` so permission checks fail closed instead of crashing a
/// request that raced provisioning.
pub fn role_in_tenant(
    central: &mut PgConnection,
    pools: &TenantPools,
    db_prefix: &str,
    user_id: Uuid,
    tenant_id: Option<Uuid>,
) -> Option<Role> {
    let tenant_id = tenant_id?;
    match try_role_in_tenant(central, pools, db_prefix, user_id, tenant_id) {
        Ok(role) => role,
        Err(err) => {
            debug!(user = %user_id, tenant = %tenant_id, error = %err, "role lookup degraded to no-role");
            None
        }
    }
}

fn try_role_in_tenant(
    central: &mut PgConnection,
    pools: &TenantPools,
    db_prefix: &str,
    user_id: Uuid,
    tenant_id: Uuid,
) -> AclResult<Option<Role>> {
    let tenant = load_tenant(central, tenant_id)?;
    let database_name = database_name_for(db_prefix, &tenant);
    let mut conn = checkout(pools, &database_name)?;
    assigned_role(&mut conn, user_id)
}

fn assigned_role(conn: &mut PgConnection, user_id: Uuid) -> AclResult<Option<Role>> {
    let role = model_has_roles::table
        .inner_join(roles::table)
        .filter(model_has_roles::model_type.eq(MODEL_TYPE_USER))
        .filter(model_has_roles::model_id.eq(user_id))
        .select(roles::all_columns)
        .first::<Role>(conn)
        .optional()?;
    Ok(role)
}

/// Owners hold every permission without a table lookup; this is the
/// named owner-bypass rule, not an artifact of seeding. Everyone else
/// needs explicit membership in the role's permission set. Fails
/// closed on any lookup problem.
pub fn has_permission_in_tenant(
    central: &mut PgConnection,
    pools: &TenantPools,
    db_prefix: &str,
    user_id: Uuid,
    permission: &str,
    tenant_id: Option<Uuid>,
) -> bool {
    let Some(tenant_id) = tenant_id else {
        return false;
    };
    match try_permission_in_tenant(central, pools, db_prefix, user_id, permission, tenant_id) {
        Ok(granted) => granted,
        Err(err) => {
            debug!(user = %user_id, tenant = %tenant_id, error = %err, "permission check degraded to deny");
            false
        }
    }
}

// one tenant checkout serves both the role lookup and the grant
// lookup, so an unreachable database costs a single pool timeout
fn try_permission_in_tenant(
    central: &mut PgConnection,
    pools: &TenantPools,
    db_prefix: &str,
    user_id: Uuid,
    permission: &str,
    tenant_id: Uuid,
) -> AclResult<bool> {
    let tenant = load_tenant(central, tenant_id)?;
    let database_name = database_name_for(db_prefix, &tenant);
    let mut conn = checkout(pools, &database_name)?;

    let Some(role) = assigned_role(&mut conn, user_id)? else {
        return Ok(false);
    };
    if role.name == ROLE_OWNER {
        return Ok(true);
    }

    let count: i64 = role_permissions::table
        .inner_join(permissions::table)
        .filter(role_permissions::role_id.eq(role.id))
        .filter(permissions::name.eq(permission))
        .count()
        .get_result(&mut conn)?;
    Ok(count > 0)
}

/// Assigns a role to a user inside a tenant database. Legacy role
/// aliases are normalized first, any existing assignment is replaced
/// (at most one role per user within a tenant), and the composite
/// primary key backs that invariant against races.
pub fn assign_role_in_tenant(
    central: &mut PgConnection,
    pools: &TenantPools,
    db_prefix: &str,
    user_id: Uuid,
    role_name: &str,
    tenant_id: Uuid,
) -> AclResult<()> {
    let normalized = normalize_role(role_name);
    if !is_known_role(normalized) {
        return Err(AclError::UnknownRole(role_name.to_string()));
    }

    let tenant = load_tenant(central, tenant_id)?;
    let database_name = database_name_for(db_prefix, &tenant);
    let mut conn = checkout(pools, &database_name)?;

    conn.transaction::<_, diesel::result::Error, _>(|conn| {
        let role_id: i32 = roles::table
            .filter(roles::name.eq(normalized))
            .select(roles::id)
            .first(conn)?;

        diesel::delete(
            model_has_roles::table
                .filter(model_has_roles::model_type.eq(MODEL_TYPE_USER))
                .filter(model_has_roles::model_id.eq(user_id)),
        )
        .execute(conn)?;

        diesel::insert_into(model_has_roles::table)
            .values(&NewModelHasRole {
                model_type: MODEL_TYPE_USER.to_string(),
                model_id: user_id,
                role_id,
            })
            .execute(conn)?;
        Ok(())
    })?;
    Ok(())
}

/// Removes every role assignment a user holds in the tenant database.
/// Used on member removal; missing assignments are not an error.
pub fn remove_roles_in_tenant(
    central: &mut PgConnection,
    pools: &TenantPools,
    db_prefix: &str,
    user_id: Uuid,
    tenant_id: Uuid,
) -> AclResult<usize> {
    let tenant = load_tenant(central, tenant_id)?;
    let database_name = database_name_for(db_prefix, &tenant);
    let mut conn = checkout(pools, &database_name)?;

    let deleted = diesel::delete(
        model_has_roles::table
            .filter(model_has_roles::model_type.eq(MODEL_TYPE_USER))
            .filter(model_has_roles::model_id.eq(user_id)),
    )
    .execute(&mut conn)?;
    Ok(deleted)
}

fn load_tenant(central: &mut PgConnection, tenant_id: Uuid) -> AclResult<Tenant> {
    tenants::table
        .find(tenant_id)
        .first::<Tenant>(central)
        .optional()?
        .ok_or(AclError::TenantNotFound(tenant_id))
}

fn checkout(
    pools: &TenantPools,
    database_name: &str,
) -> AclResult<crate::tenancy::registry::TenantConnection> {
    pools
        .checkout(database_name)
        .map_err(|err| AclError::Connectivity(err.to_string()))
}
