use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use diesel::pg::PgConnection;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use tracing::debug;

use crate::db::{database_url_for, PgPool};

pub type TenantConnection = PooledConnection<ConnectionManager<PgConnection>>;

/// Pool-of-pools keyed by physical database name.
///
/// There is deliberately no process-wide "current tenant" pointer:
/// callers check a connection out for the operation at hand and let it
/// drop when done, so concurrent requests against different tenants
/// never share mutable routing state and nothing can leak into the
/// next request.
pub struct TenantPools {
    base_url: String,
    pool_size: u32,
    pools: Mutex<HashMap<String, PgPool>>,
}

impl TenantPools {
    pub fn new(base_url: impl Into<String>, pool_size: u32) -> Self {
        Self {
            base_url: base_url.into(),
            pool_size: pool_size.max(1),
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// Checks a connection out of the pool for `database_name`,
    /// building the pool on first use. Fails when the database does
    /// not exist or is unreachable; callers decide whether that is an
    /// error or a fail-closed "no access".
    pub fn checkout(&self, database_name: &str) -> Result<TenantConnection> {
        let pool = self.pool_for(database_name)?;
        pool.get()
            .with_context(|| format!("no connection available for database {database_name}"))
    }

    /// Forgets the cached pool for a database. Required after a drop
    /// or re-create so no pooled handle can keep talking to the old
    /// physical database.
    pub fn invalidate(&self, database_name: &str) {
        let mut pools = self.pools.lock().expect("tenant pool registry poisoned");
        if pools.remove(database_name).is_some() {
            debug!(database = %database_name, "invalidated tenant connection pool");
        }
    }

    fn pool_for(&self, database_name: &str) -> Result<PgPool> {
        let mut pools = self.pools.lock().expect("tenant pool registry poisoned");
        if let Some(pool) = pools.get(database_name) {
            return Ok(pool.clone());
        }

        let url = database_url_for(&self.base_url, database_name)?;
        let manager = ConnectionManager::<PgConnection>::new(url);
        let pool = Pool::builder()
            .max_size(self.pool_size)
            // lazy: the database may not exist yet
            .min_idle(Some(0))
            .connection_timeout(Duration::from_secs(10))
            .build_unchecked(manager);

        pools.insert(database_name.to_string(), pool.clone());
        debug!(database = %database_name, "created tenant connection pool");
        Ok(pool)
    }
}
