use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::sql_query;
use diesel::sql_types::Text;
use tracing::info;

use crate::models::Tenant;
use crate::tenancy::naming::database_name_for;
use crate::tenancy::provision::{quote_ident, ProvisionError, ProvisionResult};
use crate::tenancy::registry::TenantPools;

/// Forcibly terminates every backend session bound to the tenant's
/// database, then drops it. Postgres refuses to drop a database with
/// live connections, so the termination pass is not optional; requests
/// in flight against a tenant being deleted are interrupted by design.
/// Authorization (owner-only) is the caller's responsibility.
pub fn drop_tenant_database(
    central: &mut PgConnection,
    pools: &TenantPools,
    db_prefix: &str,
    tenant: &Tenant,
) -> ProvisionResult<()> {
    let database_name = database_name_for(db_prefix, tenant);
    force_drop_database(central, pools, &database_name)
}

pub fn force_drop_database(
    central: &mut PgConnection,
    pools: &TenantPools,
    database_name: &str,
) -> ProvisionResult<()> {
    // drop our own pooled handles first so we are not among the
    // sessions we are about to terminate
    pools.invalidate(database_name);

    terminate_sessions(central, database_name)?;

    sql_query(format!(
        "DROP DATABASE IF EXISTS {}",
        quote_ident(database_name)
    ))
    .execute(central)?;

    info!(database = %database_name, "tenant database dropped");
    Ok(())
}

fn terminate_sessions(central: &mut PgConnection, database_name: &str) -> ProvisionResult<()> {
    sql_query(
        "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
         WHERE datname = $1 AND pid <> pg_backend_pid()",
    )
    .bind::<Text, _>(database_name)
    .execute(central)
    .map_err(ProvisionError::from)?;
    Ok(())
}
