use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::sql_query;
use diesel::sql_types::Text;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::models::Tenant;
use crate::storage::{ensure_tenant_layout, TenantPaths, TenantStorage};
use crate::tenancy::catalog::{GUARD_NAME, PERMISSIONS, ROLES, ROLE_GRANTS};
use crate::tenancy::naming::database_name_for;
use crate::tenancy::registry::TenantPools;
use crate::tenant_models::{NewPermission, NewRole, NewRolePermission};
use crate::tenant_schema::{permissions, quota_settings, quota_usages, role_permissions, roles};

pub const TENANT_MIGRATIONS: EmbeddedMigrations = embed_migrations!("tenant_migrations");

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("database statement failed: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("tenant database unreachable: {0}")]
    Connectivity(String),
    #[error("tenant migrations failed: {0}")]
    Migration(String),
    #[error("storage namespace failed: {0}")]
    Storage(String),
}

pub type ProvisionResult<T> = Result<T, ProvisionError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    /// Database was missing and has been fully provisioned.
    Created,
    /// Database already existed; migrations were re-applied to patch
    /// any schema drift.
    Migrated,
}

#[derive(QueryableByName)]
struct ExistsRow {
    #[diesel(sql_type = Text)]
    datname: String,
}

pub fn database_exists(central: &mut PgConnection, database_name: &str) -> ProvisionResult<bool> {
    let row: Option<ExistsRow> = sql_query("SELECT datname FROM pg_database WHERE datname = $1")
        .bind::<Text, _>(database_name)
        .get_result(central)
        .optional()?;
    Ok(row.map(|r| r.datname == database_name).unwrap_or(false))
}

/// Idempotent "provision or patch" entry point. Missing databases get
/// the full provisioning pass; existing ones only re-run migrations so
/// repair never duplicates seeded data or errors on a re-trigger.
pub fn ensure_tenant_database(
    central: &mut PgConnection,
    pools: &TenantPools,
    storage: &dyn TenantStorage,
    storage_root: &std::path::Path,
    db_prefix: &str,
    tenant: &Tenant,
) -> ProvisionResult<EnsureOutcome> {
    let database_name = database_name_for(db_prefix, tenant);
    if database_exists(central, &database_name)? {
        let mut conn = checkout(pools, &database_name)?;
        run_tenant_migrations(&mut conn)?;
        info!(tenant = %tenant.id, database = %database_name, "tenant database patched");
        Ok(EnsureOutcome::Migrated)
    } else {
        create_tenant_database(central, pools, storage, storage_root, db_prefix, tenant)?;
        Ok(EnsureOutcome::Created)
    }
}

/// Creates and fully initializes the tenant's physical database:
/// CREATE DATABASE (outside any transaction), privilege grant, tenant
/// migrations, ACL catalog seed, filesystem namespace. On failure the
/// partially created database is dropped best-effort; a cleanup
/// failure is logged and never masks the original error.
pub fn create_tenant_database(
    central: &mut PgConnection,
    pools: &TenantPools,
    storage: &dyn TenantStorage,
    storage_root: &std::path::Path,
    db_prefix: &str,
    tenant: &Tenant,
) -> ProvisionResult<()> {
    let database_name = database_name_for(db_prefix, tenant);

    // CREATE DATABASE cannot run inside a transaction block, so this
    // statement goes out in autocommit mode on the central connection.
    // A bounded statement timeout keeps a stuck template copy from
    // hanging the provisioning worker forever.
    sql_query("SET statement_timeout = 60000").execute(central)?;
    let created = sql_query(format!("CREATE DATABASE {}", quote_ident(&database_name)))
        .execute(central);
    let reset = sql_query("SET statement_timeout = 0").execute(central);
    created?;
    reset?;

    // Any pool built while the database was absent holds dead handles.
    pools.invalidate(&database_name);

    let result = initialize_tenant_database(pools, storage, storage_root, &database_name, central);
    if let Err(err) = result {
        cleanup_partial_database(central, pools, &database_name);
        return Err(err);
    }

    info!(tenant = %tenant.id, database = %database_name, "tenant database provisioned");
    Ok(())
}

fn initialize_tenant_database(
    pools: &TenantPools,
    storage: &dyn TenantStorage,
    storage_root: &std::path::Path,
    database_name: &str,
    central: &mut PgConnection,
) -> ProvisionResult<()> {
    sql_query(format!(
        "GRANT ALL PRIVILEGES ON DATABASE {} TO CURRENT_USER",
        quote_ident(database_name)
    ))
    .execute(central)?;

    let mut conn = checkout(pools, database_name)?;
    run_tenant_migrations(&mut conn)?;
    seed_acl_catalog(&mut conn)?;
    seed_quota_defaults(&mut conn)?;

    let paths = TenantPaths::new(storage_root, database_name);
    ensure_tenant_layout(storage, &paths).map_err(|err| ProvisionError::Storage(err.to_string()))?;

    Ok(())
}

fn cleanup_partial_database(central: &mut PgConnection, pools: &TenantPools, database_name: &str) {
    warn!(database = %database_name, "rolling back partially provisioned database");
    pools.invalidate(database_name);
    if let Err(err) = sql_query(format!(
        "DROP DATABASE IF EXISTS {}",
        quote_ident(database_name)
    ))
    .execute(central)
    {
        // the original provisioning error is what the caller needs to see
        error!(database = %database_name, error = %err, "cleanup of partial database failed");
    }
}

/// Re-runnable against an existing database to pick up schema
/// additions without a rebuild.
pub fn run_tenant_migrations(conn: &mut PgConnection) -> ProvisionResult<()> {
    conn.run_pending_migrations(TENANT_MIGRATIONS)
        .map_err(|err| ProvisionError::Migration(err.to_string()))?;
    Ok(())
}

/// Seeds the fixed roles, the permission catalog and the
/// role-permission mapping. Conflict-tolerant so a repeated seed never
/// duplicates rows.
pub fn seed_acl_catalog(conn: &mut PgConnection) -> ProvisionResult<()> {
    conn.transaction::<_, diesel::result::Error, _>(|conn| {
        let new_roles: Vec<NewRole> = ROLES
            .iter()
            .map(|name| NewRole {
                name: name.to_string(),
                guard_name: GUARD_NAME.to_string(),
            })
            .collect();
        diesel::insert_into(roles::table)
            .values(&new_roles)
            .on_conflict((roles::name, roles::guard_name))
            .do_nothing()
            .execute(conn)?;

        let new_permissions: Vec<NewPermission> = PERMISSIONS
            .iter()
            .map(|name| NewPermission {
                name: name.to_string(),
                guard_name: GUARD_NAME.to_string(),
            })
            .collect();
        diesel::insert_into(permissions::table)
            .values(&new_permissions)
            .on_conflict((permissions::name, permissions::guard_name))
            .do_nothing()
            .execute(conn)?;

        for (role_name, grants) in ROLE_GRANTS {
            let role_id: i32 = roles::table
                .filter(roles::name.eq(role_name))
                .select(roles::id)
                .first(conn)?;

            let permission_ids: Vec<i32> = permissions::table
                .filter(permissions::name.eq_any(grants.iter().copied()))
                .select(permissions::id)
                .load(conn)?;

            let mappings: Vec<NewRolePermission> = permission_ids
                .into_iter()
                .map(|permission_id| NewRolePermission {
                    role_id,
                    permission_id,
                })
                .collect();
            diesel::insert_into(role_permissions::table)
                .values(&mappings)
                .on_conflict((role_permissions::role_id, role_permissions::permission_id))
                .do_nothing()
                .execute(conn)?;
        }

        Ok(())
    })?;
    Ok(())
}

fn seed_quota_defaults(conn: &mut PgConnection) -> ProvisionResult<()> {
    conn.transaction::<_, diesel::result::Error, _>(|conn| {
        let settings: i64 = quota_settings::table.count().get_result(conn)?;
        if settings == 0 {
            diesel::insert_into(quota_settings::table)
                .default_values()
                .execute(conn)?;
        }
        let usages: i64 = quota_usages::table.count().get_result(conn)?;
        if usages == 0 {
            diesel::insert_into(quota_usages::table)
                .default_values()
                .execute(conn)?;
        }
        Ok(())
    })?;
    Ok(())
}

fn checkout(
    pools: &TenantPools,
    database_name: &str,
) -> ProvisionResult<crate::tenancy::registry::TenantConnection> {
    pools
        .checkout(database_name)
        .map_err(|err| ProvisionError::Connectivity(err.to_string()))
}

/// Double-quotes a Postgres identifier. Database names derive from
/// UUIDs and a configured prefix, but never interpolate one unquoted.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
