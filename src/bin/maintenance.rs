use std::env;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use diesel::prelude::*;
use uuid::Uuid;

use countersign::{
    config::AppConfig,
    db,
    models::Tenant,
    schema::tenants,
    storage::FsStorage,
    tenancy::{
        deprovision::drop_tenant_database, lifecycle::run_provisioning,
        reconcile::reconcile_role_assignments, registry::TenantPools,
    },
};

const USAGE: &str = "Usage: maintenance ensure-tenant <tenant-id> | drop-tenant <tenant-id> | reconcile-roles";

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let mut args = env::args().skip(1);
    match args.next().as_deref() {
        Some("ensure-tenant") => {
            let id = parse_tenant_id(args.next())?;
            ensure_tenant(id).await?;
        }
        Some("drop-tenant") => {
            let id = parse_tenant_id(args.next())?;
            drop_tenant(id).await?;
        }
        Some("reconcile-roles") => reconcile_roles().await?,
        Some(cmd) => {
            eprintln!("Unknown command: {cmd}\n{USAGE}");
            std::process::exit(1);
        }
        None => {
            eprintln!("{USAGE}");
            std::process::exit(1);
        }
    }

    Ok(())
}

fn parse_tenant_id(arg: Option<String>) -> Result<Uuid> {
    let raw = arg.context(USAGE)?;
    raw.parse().context("tenant id must be a UUID")
}

struct MaintenanceEnv {
    config: AppConfig,
    pool: db::PgPool,
    pools: Arc<TenantPools>,
}

fn load_env() -> Result<MaintenanceEnv> {
    let config = AppConfig::from_env()?;
    tracing::info!(
        component = "maintenance",
        database_url = %config.redacted_database_url(),
        tenant_db_prefix = %config.tenant_db_prefix,
        "loaded backend configuration"
    );
    let pool = db::init_pool_with_size(&config.database_url, 1)?;
    let pools = Arc::new(TenantPools::new(
        config.database_url.clone(),
        config.tenant_pool_size,
    ));
    Ok(MaintenanceEnv {
        config,
        pool,
        pools,
    })
}

async fn ensure_tenant(tenant_id: Uuid) -> Result<()> {
    let env = load_env()?;
    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut conn = env.pool.get().context("failed to get database connection")?;
        run_provisioning(
            &mut conn,
            &env.pools,
            &FsStorage,
            &env.config.storage_root,
            &env.config.tenant_db_prefix,
            tenant_id,
        )
        .with_context(|| format!("failed to provision tenant {tenant_id}"))?;
        println!("Tenant {tenant_id} provisioned.");
        Ok(())
    })
    .await
    .context("provisioning task panicked")?
}

async fn drop_tenant(tenant_id: Uuid) -> Result<()> {
    let env = load_env()?;
    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut conn = env.pool.get().context("failed to get database connection")?;
        let tenant: Option<Tenant> = tenants::table.find(tenant_id).first(&mut conn).optional()?;
        let Some(tenant) = tenant else {
            bail!("tenant {tenant_id} not found");
        };
        drop_tenant_database(&mut conn, &env.pools, &env.config.tenant_db_prefix, &tenant)
            .with_context(|| format!("failed to drop database for tenant {tenant_id}"))?;
        diesel::delete(tenants::table.find(tenant_id)).execute(&mut conn)?;
        println!("Tenant {tenant_id} dropped.");
        Ok(())
    })
    .await
    .context("drop task panicked")?
}

async fn reconcile_roles() -> Result<()> {
    let env = load_env()?;
    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut conn = env.pool.get().context("failed to get database connection")?;
        let report =
            reconcile_role_assignments(&mut conn, &env.pools, &env.config.tenant_db_prefix)?;
        println!(
            "Checked {} tenants ({} unreachable), removed {} orphaned role rows.",
            report.tenants_checked, report.tenants_skipped, report.orphans_removed
        );
        Ok(())
    })
    .await
    .context("reconcile task panicked")?
}
