//! Cross-database referential consistency. Tenant databases reference
//! central user ids by value only, so a centrally deleted user can
//! leave orphaned role assignments behind. This sweep detects and
//! removes them; it runs as a background job, never inline.

use std::collections::HashSet;

use diesel::pg::PgConnection;
use diesel::prelude::*;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::Tenant;
use crate::schema::{tenants, users};
use crate::tenancy::acl::MODEL_TYPE_USER;
use crate::tenancy::naming::database_name_for;
use crate::tenancy::registry::TenantPools;
use crate::tenant_schema::model_has_roles;

#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub tenants_checked: usize,
    pub tenants_skipped: usize,
    pub orphans_removed: usize,
}

/// Sweeps every tenant database for role assignments whose user id no
/// longer exists centrally. Unreachable tenant databases (still
/// provisioning, mid-deletion) are skipped, not treated as failures.
pub fn reconcile_role_assignments(
    central: &mut PgConnection,
    pools: &TenantPools,
    db_prefix: &str,
) -> Result<ReconcileReport, diesel::result::Error> {
    let known_users: HashSet<Uuid> = users::table
        .select(users::id)
        .load::<Uuid>(central)?
        .into_iter()
        .collect();

    let all_tenants: Vec<Tenant> = tenants::table.load(central)?;

    let mut report = ReconcileReport::default();
    for tenant in &all_tenants {
        let database_name = database_name_for(db_prefix, tenant);
        let mut conn = match pools.checkout(&database_name) {
            Ok(conn) => conn,
            Err(err) => {
                warn!(tenant = %tenant.id, database = %database_name, error = %err, "skipping unreachable tenant database");
                report.tenants_skipped += 1;
                continue;
            }
        };

        let assigned: Vec<Uuid> = model_has_roles::table
            .filter(model_has_roles::model_type.eq(MODEL_TYPE_USER))
            .select(model_has_roles::model_id)
            .load(&mut conn)?;

        let orphans: Vec<Uuid> = assigned
            .into_iter()
            .filter(|id| !known_users.contains(id))
            .collect();

        if !orphans.is_empty() {
            let removed = diesel::delete(
                model_has_roles::table
                    .filter(model_has_roles::model_type.eq(MODEL_TYPE_USER))
                    .filter(model_has_roles::model_id.eq_any(&orphans)),
            )
            .execute(&mut conn)?;
            info!(tenant = %tenant.id, removed, "removed orphaned role assignments");
            report.orphans_removed += removed;
        }
        report.tenants_checked += 1;
    }

    Ok(report)
}
