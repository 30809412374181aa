use std::sync::Arc;

use diesel::{
    pg::PgConnection,
    r2d2::{ConnectionManager, PooledConnection},
};

use crate::{
    auth::jwt::JwtService,
    config::AppConfig,
    db::PgPool,
    error::{AppError, AppResult},
    storage::TenantStorage,
    tenancy::registry::TenantPools,
};

type PgPooledConnection = PooledConnection<ConnectionManager<PgConnection>>;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub tenant_pools: Arc<TenantPools>,
    pub config: Arc<AppConfig>,
    pub storage: Arc<dyn TenantStorage>,
    pub jwt: JwtService,
}

impl AppState {
    pub fn new(
        pool: PgPool,
        config: AppConfig,
        storage: Arc<dyn TenantStorage>,
        jwt: JwtService,
    ) -> Self {
        let tenant_pools = Arc::new(TenantPools::new(
            config.database_url.clone(),
            config.tenant_pool_size,
        ));
        Self {
            pool,
            tenant_pools,
            config: Arc::new(config),
            storage,
            jwt,
        }
    }

    /// Central database connection. Always reachable regardless of any
    /// tenant scoping in effect for the request.
    pub fn db(&self) -> AppResult<PgPooledConnection> {
        self.pool
            .get()
            .map_err(|err| AppError::internal(format!("database pool error: {err}")))
    }
}
