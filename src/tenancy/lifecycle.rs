//! Tenant lifecycle orchestration.
//!
//! Creation inserts the central rows synchronously and defers the
//! heavy provisioning to a durable job; the provisioning pass itself
//! is a sequence of idempotent steps, so a re-trigger resumes from
//! whatever is still incomplete instead of redoing finished work.

use chrono::Utc;
use diesel::pg::PgConnection;
use diesel::prelude::*;
use rand::distributions::Alphanumeric;
use rand::Rng;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::models::{NewTenant, NewTenantMember, OauthClient, Tenant};
use crate::pki;
use crate::schema::{oauth_clients, tenant_members, tenants};
use crate::storage::{ensure_tenant_layout, TenantPaths, TenantStorage};
use crate::tenancy::acl::{self, AclError};
use crate::tenancy::catalog::ROLE_OWNER;
use crate::tenancy::naming::database_name_for;
use crate::tenancy::provision::{ensure_tenant_database, ProvisionError};
use crate::tenancy::registry::TenantPools;
use crate::tenant_models::NewTenantOauthClient;
use crate::tenant_schema::oauth_clients as tenant_oauth_clients;

const JOIN_CODE_LEN: usize = 8;
const CODE_RETRY_LIMIT: usize = 5;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Provision(#[from] ProvisionError),
    #[error(transparent)]
    Acl(#[from] AclError),
    #[error("database statement failed: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("root CA generation failed: {0}")]
    RootCa(String),
    #[error("storage namespace failed: {0}")]
    Storage(String),
    #[error("could not allocate a unique code or slug for {0}")]
    CodeExhausted(String),
    #[error("tenant not found: {0}")]
    TenantNotFound(Uuid),
}

pub type LifecycleResult<T> = Result<T, LifecycleError>;

/// Synchronous half of tenant creation: the central tenant row plus
/// the owner membership. No wrapping transaction on purpose — the
/// follow-up database creation cannot run inside one anyway, and a
/// tenant row without a database is valid, resumable state.
pub fn register_tenant(
    central: &mut PgConnection,
    owner_id: Uuid,
    name: &str,
    plan: &str,
    metadata: serde_json::Value,
) -> LifecycleResult<Tenant> {
    let tenant_id = Uuid::now_v7();

    // the uniqueness probes race with concurrent creations; a losing
    // insert regenerates slug and code and tries again
    let mut inserted = false;
    for _ in 0..CODE_RETRY_LIMIT {
        let slug = unique_slug(central, name)?;
        let code = unique_join_code(central)?;
        let new_tenant = NewTenant {
            id: tenant_id,
            name: name.to_string(),
            code,
            slug,
            owner_id,
            plan: plan.to_string(),
            metadata: metadata.clone(),
        };
        match diesel::insert_into(tenants::table)
            .values(&new_tenant)
            .execute(central)
        {
            Ok(_) => {
                inserted = true;
                break;
            }
            Err(diesel::result::Error::DatabaseError(
                diesel::result::DatabaseErrorKind::UniqueViolation,
                _,
            )) => continue,
            Err(other) => return Err(other.into()),
        }
    }
    if !inserted {
        return Err(LifecycleError::CodeExhausted(name.to_string()));
    }

    diesel::insert_into(tenant_members::table)
        .values(&NewTenantMember {
            tenant_id,
            user_id: owner_id,
            role: ROLE_OWNER.to_string(),
            is_owner: true,
        })
        .execute(central)?;

    let tenant = tenants::table.find(tenant_id).first(central)?;
    info!(tenant = %tenant_id, owner = %owner_id, "tenant registered");
    Ok(tenant)
}

/// The provisioning pass behind the `provision-tenant` job. Every
/// step checks before it acts, so partial failures resume cleanly:
/// ensure database, owner ACL role, root CA (skipped once
/// `has_root_ca` is set), filesystem namespace, reference-data sync.
pub fn run_provisioning(
    central: &mut PgConnection,
    pools: &TenantPools,
    storage: &dyn TenantStorage,
    storage_root: &std::path::Path,
    db_prefix: &str,
    tenant_id: Uuid,
) -> LifecycleResult<()> {
    let tenant: Tenant = tenants::table
        .find(tenant_id)
        .first(central)
        .optional()?
        .ok_or(LifecycleError::TenantNotFound(tenant_id))?;

    ensure_tenant_database(central, pools, storage, storage_root, db_prefix, &tenant)?;

    acl::assign_role_in_tenant(central, pools, db_prefix, tenant.owner_id, ROLE_OWNER, tenant.id)?;

    let database_name = database_name_for(db_prefix, &tenant);
    let paths = TenantPaths::new(storage_root, &database_name);
    ensure_tenant_layout(storage, &paths).map_err(|err| LifecycleError::Storage(err.to_string()))?;

    if !tenant.has_root_ca {
        generate_root_ca(central, pools, &tenant, &database_name, &paths)?;
    }

    sync_reference_data(central, pools, &database_name)?;

    info!(tenant = %tenant.id, database = %database_name, "tenant fully provisioned");
    Ok(())
}

fn generate_root_ca(
    central: &mut PgConnection,
    pools: &TenantPools,
    tenant: &Tenant,
    database_name: &str,
    paths: &TenantPaths,
) -> LifecycleResult<()> {
    let material = pki::generate_root_ca(tenant, &paths.secure_dir())
        .map_err(|err| LifecycleError::RootCa(err.to_string()))?;

    let mut conn = pools
        .checkout(database_name)
        .map_err(|err| LifecycleError::RootCa(err.to_string()))?;
    pki::store_root_ca(&mut conn, &material)
        .map_err(|err| LifecycleError::RootCa(err.to_string()))?;
    drop(conn);

    // flipping the flag last makes it a reliable "step 5 done" marker
    diesel::update(tenants::table.find(tenant.id))
        .set((
            tenants::has_root_ca.eq(true),
            tenants::root_ca_generated_at.eq(Some(Utc::now().naive_utc())),
            tenants::updated_at.eq(Utc::now().naive_utc()),
        ))
        .execute(central)?;

    info!(tenant = %tenant.id, "root CA generated");
    Ok(())
}

/// Copies central OAuth client records into the tenant database so
/// authentication keeps working once requests are tenant-scoped.
fn sync_reference_data(
    central: &mut PgConnection,
    pools: &TenantPools,
    database_name: &str,
) -> LifecycleResult<()> {
    let clients: Vec<OauthClient> = oauth_clients::table.load(central)?;
    if clients.is_empty() {
        return Ok(());
    }

    let mut conn = pools
        .checkout(database_name)
        .map_err(|err| LifecycleError::Provision(ProvisionError::Connectivity(err.to_string())))?;

    let rows: Vec<NewTenantOauthClient> = clients
        .into_iter()
        .map(|client| NewTenantOauthClient {
            id: client.id,
            name: client.name,
            secret_hash: client.secret_hash,
            redirect_uri: client.redirect_uri,
        })
        .collect();
    diesel::insert_into(tenant_oauth_clients::table)
        .values(&rows)
        .on_conflict(tenant_oauth_clients::id)
        .do_nothing()
        .execute(&mut conn)?;
    Ok(())
}

fn unique_slug(central: &mut PgConnection, name: &str) -> LifecycleResult<String> {
    let base = slugify(name);
    for attempt in 0..CODE_RETRY_LIMIT {
        let candidate = if attempt == 0 {
            base.clone()
        } else {
            format!("{base}-{}", random_suffix(4))
        };
        let taken: i64 = tenants::table
            .filter(tenants::slug.eq(&candidate))
            .count()
            .get_result(central)?;
        if taken == 0 {
            return Ok(candidate);
        }
    }
    Err(LifecycleError::CodeExhausted(name.to_string()))
}

fn unique_join_code(central: &mut PgConnection) -> LifecycleResult<String> {
    for _ in 0..CODE_RETRY_LIMIT {
        let candidate = random_suffix(JOIN_CODE_LEN).to_uppercase();
        let taken: i64 = tenants::table
            .filter(tenants::code.eq(&candidate))
            .count()
            .get_result(central)?;
        if taken == 0 {
            return Ok(candidate);
        }
    }
    Err(LifecycleError::CodeExhausted("join code".to_string()))
}

pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut last_dash = true;
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    let trimmed = slug.trim_end_matches('-');
    if trimmed.is_empty() {
        "org".to_string()
    } else {
        trimmed.to_string()
    }
}

fn random_suffix(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect::<String>()
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::slugify;

    #[test]
    fn slugify_lowercases_and_dashes() {
        assert_eq!(slugify("Acme GmbH & Co."), "acme-gmbh-co");
    }

    #[test]
    fn slugify_collapses_runs_and_trims() {
        assert_eq!(slugify("  --Weird   Name--  "), "weird-name");
    }

    #[test]
    fn slugify_never_returns_empty() {
        assert_eq!(slugify("!!!"), "org");
    }
}
